//! Fault-tolerant orchestrator for one-line day summaries.
//!
//! Capabilities are picked by classifying the inputs, not by a decision
//! loop. Every call goes through [`safe_call`], so a dead, slow or failing
//! service only removes its field from the synthesis payload. When the
//! synthesis service itself is unavailable the line is produced by a direct
//! completion instead, and the output is flagged `degraded`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use dayline_chat::{ChatMessage, CompletionRequest, LanguageModel};
use dayline_core::{Error, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::registry::{ServiceLauncher, ServiceRegistry};
use crate::types::{DaylineOutput, SourcePayloads, ToolCall, ToolResult, UsedSources};

pub const MBTI_TYPES: [&str; 16] = [
    "INTJ", "INTP", "ENTJ", "ENTP", "INFJ", "INFP", "ENFJ", "ENFP", "ISTJ", "ISFJ", "ESTJ",
    "ESFJ", "ISTP", "ISFP", "ESTP", "ESFP",
];

/// Floor for the synthesis call's budget.
const MIN_SYNTH_TIMEOUT: Duration = Duration::from_secs(6);
const FALLBACK_TEMPERATURE: f64 = 0.5;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
    Nonbinary,
    #[default]
    Unknown,
}

impl FromStr for Gender {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "male" => Ok(Gender::Male),
            "female" => Ok(Gender::Female),
            "nonbinary" => Ok(Gender::Nonbinary),
            "unknown" => Ok(Gender::Unknown),
            other => Err(format!(
                "invalid gender '{}' (expected male, female, nonbinary or unknown)",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Persona {
    pub age: Option<u32>,
    pub gender: Gender,
    pub nationality: Option<String>,
}

/// Raw user inputs; any subset may be present.
#[derive(Debug, Clone)]
pub struct SummaryInputs {
    pub image: Option<PathBuf>,
    /// Spotify playlist URL, path to a text playlist, or inline lines.
    pub playlist: Option<String>,
    pub mbti: Option<String>,
    /// Path to a diary file, or the diary text itself.
    pub diary: Option<String>,
    pub persona: Persona,
    pub target_chars: u32,
    /// Per-call budget.
    pub timeout: Duration,
    /// Suppress the warning when no caption is available.
    pub allow_no_image: bool,
}

impl Default for SummaryInputs {
    fn default() -> Self {
        Self {
            image: None,
            playlist: None,
            mbti: None,
            diary: None,
            persona: Persona::default(),
            target_chars: 14,
            timeout: Duration::from_secs(8),
            allow_no_image: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlaylistSource {
    Spotify(String),
    File(PathBuf),
    Lines(Vec<String>),
}

impl PlaylistSource {
    /// `None` when the input holds no usable lines.
    pub fn classify(raw: &str) -> Option<Self> {
        if is_spotify_playlist(raw) {
            return Some(PlaylistSource::Spotify(raw.to_string()));
        }
        if Path::new(raw).is_file() {
            return Some(PlaylistSource::File(PathBuf::from(raw)));
        }
        let lines = split_playlist_lines(raw);
        (!lines.is_empty()).then_some(PlaylistSource::Lines(lines))
    }

    pub fn capability(&self) -> &'static str {
        match self {
            PlaylistSource::Spotify(_) => "playlist",
            _ => "trackinfo",
        }
    }
}

pub fn is_spotify_playlist(s: &str) -> bool {
    s.contains("open.spotify.com/playlist") || s.starts_with("spotify:playlist:")
}

/// One track per line; `;` and `,` are dropped.
pub fn split_playlist_lines(text: &str) -> Vec<String> {
    text.replace([';', ','], "")
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Uppercased type if it is one of the sixteen.
pub fn normalize_mbti(raw: &str) -> Option<String> {
    let upper = raw.trim().to_uppercase();
    MBTI_TYPES.contains(&upper.as_str()).then_some(upper)
}

/// Diary text: the file's contents when `raw` names a readable file.
pub fn read_diary(raw: &str) -> String {
    if Path::new(raw).is_file() {
        match std::fs::read_to_string(raw) {
            Ok(text) => return text,
            Err(e) => warn!("Could not read diary file {}: {}", raw, e),
        }
    }
    raw.to_string()
}

/// Reshape a text-playlist result to what synthesis expects.
pub fn coerce_text_playlist(result: &Value) -> Value {
    json!({
        "label": result.get("label").cloned().unwrap_or(Value::Null),
        "summary": result
            .get("summary")
            .and_then(Value::as_str)
            .unwrap_or("text playlist"),
        "stats": {"energy": 0.5, "valence": 0.5, "danceability": 0.5, "tempo": 110},
    })
}

impl SummaryInputs {
    fn image_file(&self) -> Option<&Path> {
        self.image.as_deref().filter(|p| p.is_file())
    }

    fn playlist_source(&self) -> Option<PlaylistSource> {
        self.playlist.as_deref().and_then(PlaylistSource::classify)
    }

    fn valid_mbti(&self) -> Option<String> {
        let raw = self.mbti.as_deref()?;
        let mbti = normalize_mbti(raw);
        if mbti.is_none() {
            warn!("Ignoring unrecognised MBTI type '{}'", raw);
        }
        mbti
    }

    fn diary_text(&self) -> Option<String> {
        self.diary
            .as_deref()
            .filter(|d| !d.trim().is_empty())
            .map(read_diary)
    }

    /// Services worth starting for these inputs. Synthesis is always wanted.
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps = Vec::new();
        if self.image_file().is_some() {
            caps.extend(["caption".to_string(), "exif".to_string()]);
        }
        if let Some(source) = self.playlist_source() {
            caps.push(source.capability().to_string());
        }
        if self.mbti.as_deref().and_then(normalize_mbti).is_some() {
            caps.push("mbti".into());
        }
        if self.diary.as_deref().is_some_and(|d| !d.trim().is_empty()) {
            caps.push("diary".into());
        }
        caps.push("synth".into());
        caps
    }
}

/// Invoke one operation, turning every failure into `None` plus a warning.
pub async fn safe_call(
    registry: &ServiceRegistry,
    capability: &str,
    operation: &str,
    arguments: Value,
    timeout: Duration,
) -> Option<Value> {
    if !registry.contains(capability) {
        debug!("{} not running, skipping {}", capability, operation);
        return None;
    }
    let call = ToolCall::new(capability, operation, arguments);
    match registry.invoke(&call, timeout).await {
        ToolResult::Success(payload) if !is_empty(&payload) => Some(payload),
        ToolResult::Success(_) => {
            warn!("{}::{} returned nothing, excluding it", capability, operation);
            None
        }
        ToolResult::Failure(reason) => {
            warn!("{}::{} failed, excluding it: {}", capability, operation, reason);
            None
        }
        ToolResult::Timeout => {
            warn!(
                "{}::{} timed out after {}ms, excluding it",
                capability,
                operation,
                timeout.as_millis()
            );
            None
        }
    }
}

fn is_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(m) => m.is_empty(),
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn has_text(value: &Value) -> bool {
    value.as_str().is_some_and(|s| !s.trim().is_empty())
}

pub struct ResilientOrchestrator<'a> {
    model: &'a dyn LanguageModel,
}

impl<'a> ResilientOrchestrator<'a> {
    pub fn new(model: &'a dyn LanguageModel) -> Self {
        Self { model }
    }

    /// Produce a dayline. Fails only when both synthesis paths fail.
    pub async fn summarize(
        &self,
        inputs: &SummaryInputs,
        launcher: &dyn ServiceLauncher,
    ) -> Result<DaylineOutput> {
        let registry = launcher.launch(&inputs.capabilities()).await;
        for (name, reason) in registry.unavailable() {
            warn!("{} unavailable, continuing without it: {}", name, reason);
        }
        let outcome = self.run(inputs, &registry).await;
        registry.shutdown().await;
        outcome
    }

    async fn run(&self, inputs: &SummaryInputs, registry: &ServiceRegistry) -> Result<DaylineOutput> {
        let gathered = gather(inputs, registry).await;

        let used = UsedSources {
            caption: gathered
                .caption
                .as_ref()
                .is_some_and(|c| has_text(&c["caption"]) || has_text(&c["text"])),
            playlist: gathered.playlist.is_some(),
            mbti: gathered.mbti.is_some(),
            diary: gathered.diary.is_some(),
            meta: gathered.meta.is_some(),
        };

        let caption = gathered.caption.clone().unwrap_or_else(|| {
            if !inputs.allow_no_image {
                warn!("No caption available (no image or caption service down), using a placeholder");
            }
            json!({"caption": "no image", "tags": []})
        });

        let payload = json!({
            "caption": caption,
            "playlist": gathered.playlist,
            "mbti": gathered.mbti,
            "diary": gathered.diary,
            "meta": gathered.meta,
            "persona": inputs.persona,
            "target_chars": inputs.target_chars,
        });

        let synth_timeout = inputs.timeout.max(MIN_SYNTH_TIMEOUT);
        let from_service = safe_call(
            registry,
            "synth",
            "synthesize_dayline",
            json!({ "input": payload }),
            synth_timeout,
        )
        .await
        .and_then(|v| extract_line(&v));

        let (dayline, degraded) = match from_service {
            Some(line) => (line, false),
            None => {
                let line = self.fallback_line(&payload, inputs.target_chars).await?;
                info!("Synthesis service unavailable, used direct completion fallback");
                (line, true)
            }
        };

        Ok(DaylineOutput {
            dayline,
            used,
            sources: gathered,
            degraded,
        })
    }

    async fn fallback_line(&self, payload: &Value, target_chars: u32) -> Result<String> {
        let lo = target_chars.saturating_sub(4).max(1);
        let hi = target_chars + 6;
        let system = format!(
            "You compress a person's day into one line of {lo} to {hi} characters. \
             Reflect the persona's age, gender and nationality in the style. \
             Use only the data provided."
        );
        let user = format!(
            "Combine the JSON below into exactly one summary of about {} characters. \
             No line breaks, no commentary.\n{}",
            target_chars, payload
        );

        let completion = self
            .model
            .complete(
                CompletionRequest::new(vec![ChatMessage::system(system), ChatMessage::user(user)])
                    .with_temperature(FALLBACK_TEMPERATURE),
            )
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;

        let line = completion
            .content
            .unwrap_or_default()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        if line.is_empty() {
            return Err(Error::Synthesis("fallback completion returned no text".into()));
        }
        Ok(line)
    }
}

async fn gather(inputs: &SummaryInputs, registry: &ServiceRegistry) -> SourcePayloads {
    let timeout = inputs.timeout;
    let image = inputs.image_file().map(|p| p.display().to_string());

    let caption = async {
        let path = image.as_ref()?;
        safe_call(registry, "caption", "caption_image", json!({"input": {"path": path}}), timeout).await
    };
    let meta = async {
        let path = image.as_ref()?;
        safe_call(
            registry,
            "exif",
            "extract_image_metadata",
            json!({"input": {"path": path}, "weather": {"use_open_meteo": true}}),
            timeout,
        )
        .await
    };
    let playlist = async {
        match inputs.playlist_source()? {
            PlaylistSource::Spotify(url) => {
                safe_call(
                    registry,
                    "playlist",
                    "analyze_playlist",
                    json!({"input": {"spotify_url": url}}),
                    timeout,
                )
                .await
            }
            PlaylistSource::File(path) => safe_call(
                registry,
                "trackinfo",
                "resolve_text_playlist",
                json!({"input": {"path": path.display().to_string()}}),
                timeout,
            )
            .await
            .map(|tp| coerce_text_playlist(&tp)),
            PlaylistSource::Lines(lines) => safe_call(
                registry,
                "trackinfo",
                "resolve_text_playlist",
                json!({"input": {"lines": lines}}),
                timeout,
            )
            .await
            .map(|tp| coerce_text_playlist(&tp)),
        }
    };
    let mbti = async {
        let mbti = inputs.valid_mbti()?;
        safe_call(registry, "mbti", "infer_mbti_traits", json!({"input": {"mbti": mbti}}), timeout).await
    };
    let diary = async {
        let text = inputs.diary_text()?;
        safe_call(
            registry,
            "diary",
            "summarize_diary",
            json!({"input": {"text": text, "language": "ko"}}),
            timeout,
        )
        .await
    };

    let (caption, meta, playlist, mbti, diary) = tokio::join!(caption, meta, playlist, mbti, diary);
    SourcePayloads {
        caption,
        meta,
        playlist,
        mbti,
        diary,
    }
}

/// The synthesized line from a synthesis reply, if it carries one.
fn extract_line(reply: &Value) -> Option<String> {
    ["line", "text"]
        .iter()
        .find_map(|key| reply.get(*key).and_then(Value::as_str))
        .or_else(|| reply.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
