//! Known capability services and how to launch them.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Capability services shipped alongside the orchestrator.
///
/// The registry itself is keyed by name, so services outside this list can
/// still be configured; this enum only provides defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// One-line image caption plus hashtags.
    Caption,
    /// EXIF datetime/GPS with optional weather and address lookups.
    Exif,
    /// Playlist mood from numeric audio features or a Spotify URL.
    Playlist,
    /// Text playlist resolution via genre lookups.
    Trackinfo,
    /// MBTI trait keywords.
    Mbti,
    /// Diary summary and mood.
    Diary,
    /// Final one-line synthesis.
    Synth,
}

impl Capability {
    pub fn all() -> &'static [Capability] {
        &[
            Self::Caption,
            Self::Exif,
            Self::Playlist,
            Self::Trackinfo,
            Self::Mbti,
            Self::Diary,
            Self::Synth,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Caption => "caption",
            Self::Exif => "exif",
            Self::Playlist => "playlist",
            Self::Trackinfo => "trackinfo",
            Self::Mbti => "mbti",
            Self::Diary => "diary",
            Self::Synth => "synth",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "caption" => Some(Self::Caption),
            "exif" => Some(Self::Exif),
            "playlist" => Some(Self::Playlist),
            "trackinfo" => Some(Self::Trackinfo),
            "mbti" => Some(Self::Mbti),
            "diary" => Some(Self::Diary),
            "synth" => Some(Self::Synth),
            _ => None,
        }
    }

    /// Script path of the bundled service, relative to the working directory.
    pub fn default_script(&self) -> String {
        format!("servers/{}_server.py", self.name())
    }
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// How to start one capability service process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Capability name the service is registered under.
    #[serde(default)]
    pub name: String,
    /// Executable to run.
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Working directory (inherits the orchestrator's when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
    /// Extra environment variables layered over the inherited environment.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ServiceDescriptor {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: BTreeMap::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Default launcher for a bundled Python service.
    ///
    /// Bundled services import shared modules from the project root, so the
    /// working directory goes first on `PYTHONPATH`.
    pub fn python(capability: Capability) -> Self {
        let python = std::env::var("DAYLINE_PYTHON").unwrap_or_else(|_| "python".into());
        let desc = Self::new(capability.name(), python).arg(capability.default_script());
        match project_python_path() {
            Some(path) => desc.env("PYTHONPATH", path),
            None => desc,
        }
    }

    /// First argument that looks like a script path, resolved against `cwd`.
    pub fn script_path(&self) -> Option<PathBuf> {
        let script = self
            .args
            .iter()
            .find(|a| a.ends_with(".py") || a.ends_with(".js"))?;
        let path = Path::new(script);
        Some(match &self.cwd {
            Some(cwd) if path.is_relative() => cwd.join(path),
            _ => path.to_path_buf(),
        })
    }

    /// Whether the service can plausibly be launched.
    ///
    /// Only script-backed services are checked; a missing script means the
    /// service is not installed and is skipped rather than spawned.
    pub fn is_available(&self) -> bool {
        self.script_path().map_or(true, |p| p.exists())
    }
}

/// Current directory followed by any inherited `PYTHONPATH` entries.
fn project_python_path() -> Option<String> {
    let mut paths = vec![std::env::current_dir().ok()?];
    if let Some(existing) = std::env::var_os("PYTHONPATH") {
        paths.extend(std::env::split_paths(&existing));
    }
    std::env::join_paths(paths).ok()?.into_string().ok()
}
