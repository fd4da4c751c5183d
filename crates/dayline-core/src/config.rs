//! Run configuration loading.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::capabilities::{Capability, ServiceDescriptor};
use crate::error::{Error, Result};

/// Per-run settings. All values are passed through to the orchestrators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Image resource for the diary run.
    #[serde(default = "default_image")]
    pub image: PathBuf,
    /// Free-text request the capability plan is derived from.
    #[serde(default = "default_prompt")]
    pub prompt: String,
    /// Per-call timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: f64,
    /// Upper bound on decide steps in one run.
    #[serde(default = "default_max_decisions")]
    pub max_decisions: usize,
    /// Diary length as an inclusive sentence range.
    #[serde(default = "default_diary_sentences")]
    pub diary_sentences: [u8; 2],
    /// Service launch overrides keyed by capability name.
    #[serde(default)]
    pub services: BTreeMap<String, ServiceDescriptor>,
}

fn default_image() -> PathBuf {
    PathBuf::from("sample.jpg")
}
fn default_prompt() -> String {
    "caption and metadata, please".into()
}
fn default_timeout_secs() -> f64 {
    20.0
}
fn default_max_decisions() -> usize {
    8
}
fn default_diary_sentences() -> [u8; 2] {
    [5, 7]
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            prompt: default_prompt(),
            timeout_secs: default_timeout_secs(),
            max_decisions: default_max_decisions(),
            diary_sentences: default_diary_sentences(),
            services: BTreeMap::new(),
        }
    }
}

impl RunConfig {
    /// Resolve the config path from `DAYLINE_CONFIG`, defaulting to `config.json`.
    pub fn default_path() -> PathBuf {
        std::env::var("DAYLINE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config.json"))
    }

    /// Load config from a JSON file. A missing file yields defaults; a
    /// malformed one is an error.
    pub fn load(path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(data) => {
                let config: RunConfig = serde_json::from_str(&data)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
                info!("Loaded run config from {}", path.display());
                config
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No config at {}, using defaults", path.display());
                RunConfig::default()
            }
            Err(e) => return Err(e.into()),
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.timeout_secs <= 0.0 || Duration::try_from_secs_f64(self.timeout_secs).is_err() {
            return Err(Error::Config(format!(
                "timeout_secs must be a positive, representable number of seconds, got {}",
                self.timeout_secs
            )));
        }
        if self.max_decisions == 0 {
            return Err(Error::Config("max_decisions must be at least 1".into()));
        }
        let [lo, hi] = self.diary_sentences;
        if lo == 0 || lo > hi {
            return Err(Error::Config(format!(
                "diary_sentences must be a non-empty range, got {}..={}",
                lo, hi
            )));
        }
        Ok(())
    }

    /// Per-call budget. Values `validate` would reject fall back to the default.
    pub fn timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.timeout_secs)
            .ok()
            .filter(|t| !t.is_zero())
            .unwrap_or_else(|| Duration::from_secs_f64(default_timeout_secs()))
    }

    /// Launch descriptor for a capability: configured override, else the
    /// bundled Python service.
    pub fn service(&self, name: &str) -> Option<ServiceDescriptor> {
        if let Some(desc) = self.services.get(name) {
            let mut desc = desc.clone();
            desc.name = name.to_string();
            return Some(desc);
        }
        Capability::from_name(name).map(ServiceDescriptor::python)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RunConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.image, PathBuf::from("sample.jpg"));
        assert_eq!(config.max_decisions, 8);
        assert_eq!(config.timeout(), Duration::from_secs(20));
    }

    #[test]
    fn test_partial_file_merges_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "image": "beach.jpg",
                "prompt": "caption only",
                "services": {
                    "caption": {"program": "/usr/bin/caption-svc"}
                }
            }"#,
        )
        .unwrap();

        let config = RunConfig::load(&path).unwrap();
        assert_eq!(config.image, PathBuf::from("beach.jpg"));
        assert_eq!(config.prompt, "caption only");
        assert_eq!(config.diary_sentences, [5, 7]);

        let caption = config.service("caption").unwrap();
        assert_eq!(caption.name, "caption");
        assert_eq!(caption.program, "/usr/bin/caption-svc");

        let exif = config.service("exif").unwrap();
        assert_eq!(exif.args, vec!["servers/exif_server.py".to_string()]);

        assert!(config.service("unknown").is_none());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(RunConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_invalid_values_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"timeout_secs": 0}"#).unwrap();
        assert!(RunConfig::load(&path).is_err());

        std::fs::write(&path, r#"{"diary_sentences": [7, 5]}"#).unwrap();
        assert!(RunConfig::load(&path).is_err());
    }

    #[test]
    fn test_oversized_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"timeout_secs": 1e30}"#).unwrap();
        assert!(matches!(RunConfig::load(&path), Err(Error::Config(_))));

        // A value set after loading never panics.
        let mut config = RunConfig::default();
        config.timeout_secs = 1e30;
        assert_eq!(config.timeout(), Duration::from_secs(20));
        config.timeout_secs = f64::NAN;
        assert_eq!(config.timeout(), Duration::from_secs(20));
    }
}
