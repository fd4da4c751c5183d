//! Orchestration state machine: plan → decide → {invoke, decide, collect}
//! → compose.
//!
//! The decision collaborator only sees tools its plan enables. Each
//! capability is dispatched at most once per run; repeat, unplanned, unknown
//! and malformed requests are answered with a rejected tool turn instead of
//! reaching a service. Decide steps are bounded by `max_decisions`.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use dayline_chat::{ChatMessage, CompletionRequest, LanguageModel, ToolCallRequest};
use dayline_core::{Error, Result, RunConfig};
use futures::future::join_all;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::collect::ResultAccumulator;
use crate::conversation::{ConversationState, ToolOutcome, Turn};
use crate::plan::{decide_plan, CapabilityPlan, PLAN_FIELDS};
use crate::registry::{ServiceLauncher, ServiceRegistry};
use crate::tools::ToolCatalog;
use crate::types::{RunReport, ToolCall, ToolResult};

const DECIDER_PROMPT: &str = "You are an image caption and metadata assistant.\n\
- Only call tools enabled by the plan.\n\
- Call each tool at most once.\n\
- Pass exif_metadata_tool arguments as (path, weather, address).\n\
- Do not summarize results; only decide tool calls.";

const DECISION_TEMPERATURE: f64 = 0.2;
const COMPOSE_TEMPERATURE: f64 = 0.4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Decide,
    Invoke,
    Collect,
}

#[derive(Debug, Clone)]
pub struct MachineSettings {
    /// Per-call budget.
    pub timeout: Duration,
    pub max_decisions: usize,
    pub diary_sentences: [u8; 2],
}

impl From<&RunConfig> for MachineSettings {
    fn from(config: &RunConfig) -> Self {
        Self {
            timeout: config.timeout(),
            max_decisions: config.max_decisions,
            diary_sentences: config.diary_sentences,
        }
    }
}

impl Default for MachineSettings {
    fn default() -> Self {
        Self::from(&RunConfig::default())
    }
}

pub struct StateMachine<'a> {
    model: &'a dyn LanguageModel,
    catalog: ToolCatalog,
    settings: MachineSettings,
}

impl<'a> StateMachine<'a> {
    pub fn new(model: &'a dyn LanguageModel, settings: MachineSettings) -> Self {
        Self {
            model,
            catalog: ToolCatalog::standard(),
            settings,
        }
    }

    pub fn with_catalog(mut self, catalog: ToolCatalog) -> Self {
        self.catalog = catalog;
        self
    }

    /// Run once. Services for the planned capabilities are launched after
    /// planning and closed on every exit path.
    pub async fn run(
        &self,
        image: &Path,
        request: &str,
        launcher: &dyn ServiceLauncher,
    ) -> Result<RunReport> {
        let plan = decide_plan(self.model, request).await?;
        let required = self.catalog.required_capabilities(&plan);

        let registry = launcher.launch(&required).await;
        for (name, reason) in registry.unavailable() {
            warn!("Planned capability {} is unavailable: {}", name, reason);
        }

        let outcome = self.drive(plan, image, &registry).await;
        registry.shutdown().await;
        outcome
    }

    async fn drive(
        &self,
        plan: CapabilityPlan,
        image: &Path,
        registry: &ServiceRegistry,
    ) -> Result<RunReport> {
        let mut state = ConversationState::new();
        state.push(Turn::System(DECIDER_PROMPT.to_string()));
        state.push(Turn::User(first_turn_context(&plan, image).to_string()));

        let mut called = BTreeSet::new();
        let mut invoked = Vec::new();
        let mut decisions = 0;
        let mut phase = Phase::Decide;

        while phase != Phase::Collect {
            phase = match phase {
                Phase::Decide => {
                    if decisions >= self.settings.max_decisions {
                        return Err(Error::DecisionLimit(decisions));
                    }
                    decisions += 1;
                    self.decide(&plan, &mut state).await?;
                    self.next_phase(&plan, &state)
                }
                Phase::Invoke => {
                    self.invoke(&plan, &mut state, &mut called, &mut invoked, registry)
                        .await;
                    Phase::Decide
                }
                Phase::Collect => Phase::Collect,
            };
            debug!("Decision {} → {:?}", decisions, phase);
        }

        let results = ResultAccumulator::from_conversation(&state);
        info!(
            "Collected {} results after {} decisions",
            results.len(),
            decisions
        );
        let diary = self.compose(&results).await?;

        Ok(RunReport {
            plan,
            caption: results.payload("caption").cloned(),
            meta: results.payload("exif").cloned(),
            diary,
            decisions,
            invoked,
        })
    }

    async fn decide(&self, plan: &CapabilityPlan, state: &mut ConversationState) -> Result<()> {
        let tools = self.catalog.enabled(plan).map(|t| t.spec()).collect();
        let completion = self
            .model
            .complete(
                CompletionRequest::new(state.to_messages())
                    .with_tools(tools)
                    .with_temperature(DECISION_TEMPERATURE),
            )
            .await
            .map_err(|e| Error::Decision(e.to_string()))?;
        state.push(Turn::Decision(completion));
        Ok(())
    }

    /// Collect once every planned capability has a result; otherwise invoke
    /// if the latest decision asks for tools, else decide again.
    pub fn next_phase(&self, plan: &CapabilityPlan, state: &ConversationState) -> Phase {
        let satisfied = self
            .catalog
            .required_capabilities(plan)
            .iter()
            .all(|cap| state.has_result_for(cap));
        if satisfied {
            Phase::Collect
        } else if state
            .latest_decision()
            .map_or(false, |d| d.requests_tools())
        {
            Phase::Invoke
        } else {
            Phase::Decide
        }
    }

    async fn invoke(
        &self,
        plan: &CapabilityPlan,
        state: &mut ConversationState,
        called: &mut BTreeSet<String>,
        invoked: &mut Vec<String>,
        registry: &ServiceRegistry,
    ) {
        let requests = state
            .latest_decision()
            .map(|d| d.tool_calls.clone())
            .unwrap_or_default();

        let mut accepted: Vec<(ToolCallRequest, ToolCall)> = Vec::new();
        let mut rejected = Vec::new();
        for request in requests {
            match self.admit(plan, called, &request) {
                Ok(call) => {
                    called.insert(call.capability.clone());
                    accepted.push((request, call));
                }
                Err((capability, reason)) => {
                    warn!("Rejected tool call {}: {}", request.name, reason);
                    rejected.push(Turn::Tool {
                        call_id: request.id,
                        tool: request.name,
                        capability,
                        outcome: ToolOutcome::Rejected(reason),
                    });
                }
            }
        }

        // Independent capabilities run concurrently; turns land in catalog order.
        accepted.sort_by_key(|(_, call)| self.catalog.rank(&call.capability));
        let timeout = self.settings.timeout;
        let results = join_all(
            accepted
                .iter()
                .map(|(_, call)| registry.invoke(call, timeout)),
        )
        .await;

        for ((request, call), result) in accepted.into_iter().zip(results) {
            info!(
                "{}::{} → {}",
                call.capability,
                call.operation,
                match &result {
                    r if r.is_success() => "ok",
                    ToolResult::Timeout => "timeout",
                    _ => "failed",
                }
            );
            invoked.push(call.capability.clone());
            state.push(Turn::Tool {
                call_id: request.id,
                tool: request.name,
                capability: Some(call.capability),
                outcome: ToolOutcome::Completed(result),
            });
        }
        state.extend(rejected);
    }

    fn admit(
        &self,
        plan: &CapabilityPlan,
        called: &BTreeSet<String>,
        request: &ToolCallRequest,
    ) -> std::result::Result<ToolCall, (Option<String>, String)> {
        let tool = self
            .catalog
            .get(&request.name)
            .ok_or_else(|| (None, format!("unknown tool {}", request.name)))?;
        let capability = Some(tool.capability.clone());
        if !plan.wants(&tool.capability) {
            return Err((capability, "not enabled by the plan".into()));
        }
        if called.contains(&tool.capability) {
            return Err((capability, "already called in this run".into()));
        }
        tool.to_call(&request.arguments)
            .map_err(|e| (capability, format!("invalid arguments: {}", e)))
    }

    async fn compose(&self, results: &ResultAccumulator) -> Result<String> {
        let [lo, hi] = self.settings.diary_sentences;
        let system = format!(
            "You are a careful diary assistant. Using only the facts in the given JSON, \
             write a diary entry of {lo} to {hi} sentences.\n\
             - First sentence: weave in the time or place when present.\n\
             - Body: describe the scene, activity and feeling suggested by caption and tags.\n\
             - Mention the weather once if present.\n\
             - If an address is present, name only the district or neighbourhood.\n\
             - Do not guess missing information; leave it out.\n\
             - Last sentence: a one-line reflection on the day.\n\
             Output only the diary text: no title, bullets, hashtags or emoji."
        );
        let payload = json!({ "facts": diary_facts(results), "legend": diary_legend() });

        let completion = self
            .model
            .complete(
                CompletionRequest::new(vec![
                    ChatMessage::system(system),
                    ChatMessage::user(payload.to_string()),
                ])
                .with_temperature(COMPOSE_TEMPERATURE),
            )
            .await
            .map_err(|e| Error::Synthesis(e.to_string()))?;

        completion
            .content
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Synthesis("compose returned no text".into()))
    }
}

/// Context for the first decision: image, plan, argument hints.
fn first_turn_context(plan: &CapabilityPlan, image: &Path) -> Value {
    let enabled: serde_json::Map<String, Value> = PLAN_FIELDS
        .iter()
        .map(|(name, _)| (name.to_string(), json!(plan.wants(name))))
        .collect();
    json!({
        "image_path": image.display().to_string(),
        "call_hints": {
            "exif_args": {"weather": plan.wants("weather"), "address": plan.wants("address")},
        },
        "enabled_tools": enabled,
    })
}

fn present(value: &Value) -> Value {
    match value {
        Value::Object(m) if m.is_empty() => Value::Null,
        Value::String(s) if s.is_empty() => Value::Null,
        other => other.clone(),
    }
}

fn diary_facts(results: &ResultAccumulator) -> Value {
    let empty = json!({});
    let caption = results.payload("caption").unwrap_or(&empty);
    let meta = results.payload("exif").unwrap_or(&empty);
    let tags = match &caption["tags"] {
        Value::Array(tags) => Value::Array(tags.clone()),
        _ => json!([]),
    };
    json!({
        "caption": present(&caption["caption"]),
        "tags": tags,
        "datetime": present(&meta["datetime"]),
        "address": present(&meta["address"]),
        "weather": present(&meta["weather"]),
        "gps": present(&meta["gps"]),
    })
}

fn diary_legend() -> Value {
    json!({
        "caption": "one-line scene description from the image",
        "tags": "keywords that evoke the scene",
        "datetime": "capture time 'YYYY:MM:DD HH:MM:SS', may be absent",
        "address": "approximate place name from reverse geocoding (district level)",
        "weather": "daily summary (max/min, precipitation, weather code); omit if absent",
        "gps": "latitude/longitude numbers; never write them in the text",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use dayline_chat::Role;
    use std::path::PathBuf;

    fn settings() -> MachineSettings {
        MachineSettings {
            timeout: Duration::from_millis(100),
            max_decisions: 8,
            diary_sentences: [5, 7],
        }
    }

    fn image() -> PathBuf {
        PathBuf::from("sample.jpg")
    }

    fn exif_reply() -> Value {
        json!({
            "datetime": "2024:05:01 10:12:00",
            "gps": {"lat": 37.5665, "lon": 126.978},
            "weather": null,
            "address": null,
        })
    }

    fn tool_messages(request: &CompletionRequest) -> Vec<&ChatMessage> {
        request
            .messages
            .iter()
            .filter(|m| m.role == Role::Tool)
            .collect()
    }

    #[tokio::test]
    async fn test_caption_only_plan_never_calls_exif() {
        let caption = FakeChannel::new("caption", Behavior::Reply(caption_reply()));
        let exif = FakeChannel::new("exif", Behavior::Reply(exif_reply()));
        let launcher = FakeLauncher::new(vec![caption.clone(), exif.clone()]);
        let model = ScriptedModel::new(vec![
            plan_reply(true, false),
            tool_decision(&["caption_image_tool", "exif_metadata_tool"]),
            text_reply("done"),
            text_reply("A quiet morning by the sea."),
        ]);

        let report = StateMachine::new(&model, settings())
            .run(&image(), "caption only", &launcher)
            .await
            .unwrap();

        assert_eq!(*launcher.requested.lock(), vec!["caption".to_string()]);
        assert_eq!(caption.call_count(), 1);
        assert_eq!(exif.call_count(), 0);
        assert_eq!(report.caption, Some(caption_reply()));
        assert_eq!(report.meta, None);
        assert_eq!(report.invoked, vec!["caption"]);
        assert_eq!(report.diary, "A quiet morning by the sea.");
        assert_eq!(*caption.closed.lock(), 1);

        // Only the caption tool is offered to the decider.
        let requests = model.requests.lock();
        let offered: Vec<&str> = requests[1].tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(offered, vec!["caption_image_tool"]);
        // The unplanned exif request was answered with a rejection.
        let tools = tool_messages(&requests[2]);
        assert_eq!(tools.len(), 2);
        assert!(tools[1].content.as_deref().unwrap_or_default().contains("rejected"));
    }

    #[tokio::test]
    async fn test_exif_lookup_failures_keep_datetime_and_gps() {
        let exif = FakeChannel::new("exif", Behavior::Reply(exif_reply()));
        let launcher = FakeLauncher::new(vec![exif.clone()]);
        let model = ScriptedModel::new(vec![
            plan_reply(false, true),
            tool_decision(&["exif_metadata_tool"]),
            text_reply("ok"),
            text_reply("diary"),
        ]);

        let report = StateMachine::new(&model, settings())
            .run(&image(), "metadata only", &launcher)
            .await
            .unwrap();

        let meta = report.meta.unwrap();
        assert_eq!(meta["datetime"], "2024:05:01 10:12:00");
        assert_eq!(meta["gps"]["lat"], 37.5665);
        assert!(meta["weather"].is_null());
        assert!(meta["address"].is_null());

        // Exif hints reached the service.
        let (op, args) = exif.calls.lock()[0].clone();
        assert_eq!(op, "extract_image_metadata");
        assert_eq!(args["weather"]["use_open_meteo"], true);
        assert_eq!(args["address"], true);
    }

    #[tokio::test]
    async fn test_repeat_requests_are_rejected() {
        let caption = FakeChannel::new("caption", Behavior::Reply(caption_reply()));
        let exif = FakeChannel::new("exif", Behavior::Reply(exif_reply()));
        let launcher = FakeLauncher::new(vec![caption.clone(), exif.clone()]);
        let model = ScriptedModel::new(vec![
            plan_reply(true, true),
            tool_decision(&["caption_image_tool", "caption_image_tool"]),
            tool_decision(&["caption_image_tool", "exif_metadata_tool"]),
            text_reply("done"),
            text_reply("diary"),
        ]);

        let report = StateMachine::new(&model, settings())
            .run(&image(), "both", &launcher)
            .await
            .unwrap();

        assert_eq!(caption.call_count(), 1);
        assert_eq!(exif.call_count(), 1);
        assert_eq!(report.invoked, vec!["caption", "exif"]);
        assert_eq!(report.decisions, 3);
    }

    #[tokio::test]
    async fn test_malformed_arguments_rejected_and_retried() {
        let caption = FakeChannel::new("caption", Behavior::Reply(caption_reply()));
        let exif = FakeChannel::new("exif", Behavior::Reply(exif_reply()));
        let launcher = FakeLauncher::new(vec![caption.clone(), exif.clone()]);
        let mut first = tool_decision(&["caption_image_tool", "exif_metadata_tool"]).unwrap();
        first.tool_calls[1].arguments = Value::String("{\"path\": \"sample.jpg\"".into());
        let model = ScriptedModel::new(vec![
            plan_reply(true, true),
            Ok(first),
            tool_decision(&["exif_metadata_tool"]),
            text_reply("done"),
            text_reply("diary"),
        ]);

        let report = StateMachine::new(&model, settings())
            .run(&image(), "both", &launcher)
            .await
            .unwrap();

        assert_eq!(caption.call_count(), 1);
        assert_eq!(exif.call_count(), 1);
        assert_eq!(report.invoked, vec!["caption", "exif"]);
        assert!(report.meta.is_some());

        let requests = model.requests.lock();
        let tools = tool_messages(&requests[2]);
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].tool_call_id.as_deref(), Some("call_0_caption_image_tool"));
        let rejected = tools[1].content.as_deref().unwrap_or_default();
        assert!(rejected.contains("rejected"));
        assert!(rejected.contains("not a JSON object"));
    }

    #[tokio::test]
    async fn test_results_recorded_in_catalog_order() {
        let caption = FakeChannel::new("caption", Behavior::Reply(caption_reply()));
        let exif = FakeChannel::new("exif", Behavior::Reply(exif_reply()));
        let launcher = FakeLauncher::new(vec![caption, exif]);
        let model = ScriptedModel::new(vec![
            plan_reply(true, true),
            tool_decision(&["exif_metadata_tool", "caption_image_tool"]),
            text_reply("done"),
            text_reply("diary"),
        ]);

        StateMachine::new(&model, settings())
            .run(&image(), "both", &launcher)
            .await
            .unwrap();

        let requests = model.requests.lock();
        let tools = tool_messages(&requests[2]);
        assert_eq!(tools[0].tool_call_id.as_deref(), Some("call_1_caption_image_tool"));
        assert_eq!(tools[1].tool_call_id.as_deref(), Some("call_0_exif_metadata_tool"));
    }

    #[tokio::test]
    async fn test_every_plan_and_order_reaches_compose_once_per_capability() {
        let orders: [&[&str]; 2] = [
            &["caption_image_tool", "exif_metadata_tool"],
            &["exif_metadata_tool", "caption_image_tool"],
        ];
        for (want_caption, want_exif) in [(true, true), (true, false), (false, true), (false, false)] {
            for order in orders {
                let caption = FakeChannel::new("caption", Behavior::Reply(caption_reply()));
                let exif = FakeChannel::new("exif", Behavior::Reply(exif_reply()));
                let launcher = FakeLauncher::new(vec![caption.clone(), exif.clone()]);
                // Requests each tool one at a time, then repeats everything.
                let model = ScriptedModel::new(vec![
                    plan_reply(want_caption, want_exif),
                    tool_decision(&order[..1]),
                    tool_decision(&order[1..]),
                    tool_decision(order),
                ])
                .with_untooled_reply(dayline_chat::Completion::text("diary"));

                let report = StateMachine::new(&model, settings())
                    .run(&image(), "fuzz", &launcher)
                    .await
                    .unwrap();

                assert_eq!(caption.call_count(), want_caption as usize);
                assert_eq!(exif.call_count(), want_exif as usize);
                assert_eq!(report.caption.is_some(), want_caption);
                assert_eq!(report.meta.is_some(), want_exif);
                assert_eq!(report.diary, "diary");
            }
        }
    }

    #[tokio::test]
    async fn test_decision_limit_fails_run_and_releases_services() {
        let caption = FakeChannel::new("caption", Behavior::Reply(caption_reply()));
        let exif = FakeChannel::new("exif", Behavior::Reply(exif_reply()));
        let launcher = FakeLauncher::new(vec![caption.clone(), exif.clone()]);
        let model = ScriptedModel::new(vec![plan_reply(true, true)])
            .with_fallback(dayline_chat::Completion::text("thinking"));

        let mut s = settings();
        s.max_decisions = 3;
        let err = StateMachine::new(&model, s)
            .run(&image(), "both", &launcher)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::DecisionLimit(3)));
        assert_eq!(model.request_count(), 4);
        assert_eq!(*caption.closed.lock(), 1);
        assert_eq!(*exif.closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_planning_failure_spawns_nothing() {
        let launcher = FakeLauncher::new(vec![]);
        let model = ScriptedModel::new(vec![Err("rate limited".into())]);
        let err = StateMachine::new(&model, settings())
            .run(&image(), "both", &launcher)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Planning(_)));
        assert!(launcher.requested.lock().is_empty());
    }

    #[tokio::test]
    async fn test_decider_failure_is_reported() {
        let caption = FakeChannel::new("caption", Behavior::Reply(caption_reply()));
        let launcher = FakeLauncher::new(vec![caption.clone()]);
        let model = ScriptedModel::new(vec![plan_reply(true, false), Err("500".into())]);
        let err = StateMachine::new(&model, settings())
            .run(&image(), "caption", &launcher)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Decision(_)));
        assert_eq!(*caption.closed.lock(), 1);
    }

    #[tokio::test]
    async fn test_capability_failures_become_tool_turns() {
        let caption = FakeChannel::new("caption", Behavior::Fail("model not loaded".into()));
        let exif = FakeChannel::new("exif", Behavior::Hang);
        let launcher = FakeLauncher::new(vec![caption, exif]);
        let model = ScriptedModel::new(vec![
            plan_reply(true, true),
            tool_decision(&["caption_image_tool", "exif_metadata_tool"]),
            text_reply("nothing more to do"),
            text_reply("A day with little to go on."),
        ]);

        let report = StateMachine::new(&model, settings())
            .run(&image(), "both", &launcher)
            .await
            .unwrap();
        assert!(report.caption.is_none());
        assert!(report.meta.is_none());

        let requests = model.requests.lock();
        let tools = tool_messages(&requests[2]);
        assert!(tools[0].content.as_deref().unwrap_or_default().contains("model not loaded"));
        assert_eq!(tools[1].content.as_deref(), Some("{\"error\":\"timeout\"}"));

        // Compose sees nulls, not error payloads.
        let compose = requests.last().unwrap();
        let facts: Value =
            serde_json::from_str(compose.messages[1].content.as_deref().unwrap()).unwrap();
        assert!(facts["facts"]["caption"].is_null());
        assert_eq!(facts["facts"]["tags"], json!([]));
    }

    #[tokio::test]
    async fn test_unavailable_service_still_completes() {
        // exif is planned but its spawn failed.
        let caption = FakeChannel::new("caption", Behavior::Reply(caption_reply()));
        let launcher = FakeLauncher::new(vec![caption]);
        let model = ScriptedModel::new(vec![
            plan_reply(true, true),
            tool_decision(&["caption_image_tool", "exif_metadata_tool"]),
            text_reply("done"),
            text_reply("diary"),
        ]);
        let report = StateMachine::new(&model, settings())
            .run(&image(), "both", &launcher)
            .await
            .unwrap();
        assert!(report.caption.is_some());
        assert!(report.meta.is_none());
        assert_eq!(report.invoked, vec!["caption", "exif"]);
    }

    #[test]
    fn test_first_turn_context() {
        let plan = CapabilityPlan::new([("weather", false)]);
        let ctx = first_turn_context(&plan, Path::new("a.jpg"));
        assert_eq!(ctx["image_path"], "a.jpg");
        assert_eq!(ctx["call_hints"]["exif_args"], json!({"weather": false, "address": true}));
        assert_eq!(ctx["enabled_tools"]["caption"], true);
    }

    #[test]
    fn test_next_phase_predicate() {
        let model = ScriptedModel::new(vec![]);
        let machine = StateMachine::new(&model, settings());
        let plan = CapabilityPlan::new([("exif", false)]);
        let mut state = ConversationState::new();
        state.push(Turn::Decision(dayline_chat::Completion::text("hmm")));
        assert_eq!(machine.next_phase(&plan, &state), Phase::Decide);

        if let Ok(c) = tool_decision(&["caption_image_tool"]) {
            state.push(Turn::Decision(c));
        }
        assert_eq!(machine.next_phase(&plan, &state), Phase::Invoke);

        state.push(Turn::Tool {
            call_id: "c".into(),
            tool: "caption_image_tool".into(),
            capability: Some("caption".into()),
            outcome: ToolOutcome::Completed(ToolResult::Success(caption_reply())),
        });
        assert_eq!(machine.next_phase(&plan, &state), Phase::Collect);
    }
}
