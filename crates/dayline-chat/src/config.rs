//! LLM configuration and provider selection.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::LlmProvider;

pub const DEFAULT_OPENAI_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_GROQ_MODEL: &str = "llama-3.3-70b-versatile";

/// Stored LLM configuration (`llm` section of the run config, or env only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// `auto`, `openai` or `groq`.
    #[serde(default = "default_preferred")]
    pub preferred_provider: String,
    #[serde(default)]
    pub openai_api_key: Option<String>,
    #[serde(default)]
    pub groq_api_key: Option<String>,
    #[serde(default = "default_openai_model")]
    pub openai_model: String,
    #[serde(default = "default_groq_model")]
    pub groq_model: String,
    /// Overrides the provider's API root, e.g. for a local proxy.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: f64,
}

fn default_preferred() -> String {
    "auto".into()
}
fn default_openai_model() -> String {
    DEFAULT_OPENAI_MODEL.into()
}
fn default_groq_model() -> String {
    DEFAULT_GROQ_MODEL.into()
}
fn default_request_timeout() -> f64 {
    60.0
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            preferred_provider: default_preferred(),
            openai_api_key: None,
            groq_api_key: None,
            openai_model: default_openai_model(),
            groq_model: default_groq_model(),
            base_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

/// A provider choice with everything needed to call it.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedProvider {
    pub provider: LlmProvider,
    pub model: String,
    pub api_key: String,
    pub base_url: String,
}

impl LlmConfig {
    /// Load config from file, falling back to env vars and defaults.
    pub fn load(config_path: &Path) -> Self {
        let config: LlmConfig = match std::fs::read_to_string(config_path) {
            Ok(s) => serde_json::from_str(&s).unwrap_or_else(|e| {
                warn!("Ignoring malformed {}: {}", config_path.display(), e);
                LlmConfig::default()
            }),
            Err(_) => LlmConfig::default(),
        };
        config.with_env_fallback()
    }

    /// Defaults plus environment.
    pub fn from_env() -> Self {
        LlmConfig::default().with_env_fallback()
    }

    /// Fill unset fields from `OPENAI_API_KEY`, `GROQ_API_KEY`,
    /// `OPENAI_MODEL_TEXT`, `OPENAI_BASE_URL` and `DAYLINE_LLM_PROVIDER`.
    pub fn with_env_fallback(self) -> Self {
        self.with_env_from(|key| std::env::var(key).ok())
    }

    fn with_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if self.openai_api_key.is_none() {
            self.openai_api_key = lookup("OPENAI_API_KEY").filter(|k| !k.is_empty());
        }
        if self.groq_api_key.is_none() {
            self.groq_api_key = lookup("GROQ_API_KEY").filter(|k| !k.is_empty());
        }
        if self.openai_model == DEFAULT_OPENAI_MODEL {
            if let Some(model) = lookup("OPENAI_MODEL_TEXT") {
                self.openai_model = model;
            }
        }
        if self.base_url.is_none() {
            self.base_url = lookup("OPENAI_BASE_URL");
        }
        if self.preferred_provider == "auto" {
            if let Some(p) = lookup("DAYLINE_LLM_PROVIDER") {
                self.preferred_provider = p.to_lowercase();
            }
        }
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs.max(1.0))
    }

    /// Resolve which provider and model to use.
    pub fn resolve_provider(&self) -> Option<ResolvedProvider> {
        let pick = |provider: LlmProvider| {
            let (key, model) = match provider {
                LlmProvider::OpenAi => (&self.openai_api_key, &self.openai_model),
                LlmProvider::Groq => (&self.groq_api_key, &self.groq_model),
            };
            key.as_ref().map(|k| ResolvedProvider {
                provider,
                model: model.clone(),
                api_key: k.clone(),
                base_url: self
                    .base_url
                    .clone()
                    .unwrap_or_else(|| provider.default_base_url().to_string()),
            })
        };

        let resolved = match self.preferred_provider.as_str() {
            "openai" => pick(LlmProvider::OpenAi),
            "groq" => pick(LlmProvider::Groq),
            // Auto mode: OpenAI > Groq
            "auto" => pick(LlmProvider::OpenAi).or_else(|| pick(LlmProvider::Groq)),
            other => {
                warn!("Unknown LLM provider preference '{}'", other);
                None
            }
        };
        if let Some(r) = &resolved {
            debug!("Resolved LLM provider {} ({})", r.provider, r.model);
        }
        resolved
    }
}
