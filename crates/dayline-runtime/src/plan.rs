//! Capability plan: which capabilities a request wants.

use std::collections::BTreeMap;

use dayline_chat::{ChatMessage, CompletionRequest, LanguageModel};
use dayline_core::{Error, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Plan fields the planner decides, in prompt order.
pub const PLAN_FIELDS: &[(&str, &str)] = &[
    ("caption", "whether an image caption is needed"),
    ("exif", "whether EXIF metadata (time, GPS) is needed"),
    ("weather", "whether to include a weather lookup"),
    ("address", "whether to include reverse geocoding (address)"),
];

/// Immutable capability → wanted map. Absent names count as wanted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CapabilityPlan {
    flags: BTreeMap<String, bool>,
}

impl CapabilityPlan {
    pub fn new<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = (S, bool)>,
        S: Into<String>,
    {
        Self {
            flags: flags.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }

    pub fn wants(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(true)
    }

    /// Parse a planner reply. Every present field must be a boolean.
    pub fn from_value(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| Error::Planning(format!("plan is not an object: {}", value)))?;
        let mut flags = BTreeMap::new();
        for (key, v) in object {
            let flag = v
                .as_bool()
                .ok_or_else(|| Error::Planning(format!("plan field {} is not a boolean: {}", key, v)))?;
            flags.insert(key.clone(), flag);
        }
        Ok(Self { flags })
    }
}

fn plan_schema() -> Value {
    let properties: serde_json::Map<String, Value> = PLAN_FIELDS
        .iter()
        .map(|(name, desc)| (name.to_string(), json!({"type": "boolean", "description": desc})))
        .collect();
    json!({
        "type": "object",
        "properties": properties,
        "required": PLAN_FIELDS.iter().map(|(name, _)| *name).collect::<Vec<_>>(),
        "additionalProperties": false,
    })
}

fn planner_prompt() -> String {
    let mut prompt = String::from(
        "You are a tool router. Read the user's request and decide the fields below. \
         Answer with JSON only.\n",
    );
    for (name, desc) in PLAN_FIELDS {
        prompt.push_str(&format!("- {}: {}\n", name, desc));
    }
    prompt.push_str("When the request does not say, default to true.");
    prompt
}

/// Derive a plan from free text. A collaborator failure fails the run.
pub async fn decide_plan(model: &dyn LanguageModel, request: &str) -> Result<CapabilityPlan> {
    let completion = model
        .complete(
            CompletionRequest::new(vec![
                ChatMessage::system(planner_prompt()),
                ChatMessage::user(request),
            ])
            .with_schema("capability_plan", plan_schema())
            .with_temperature(0.0),
        )
        .await
        .map_err(|e| Error::Planning(e.to_string()))?;

    let value = completion
        .json()
        .ok_or_else(|| Error::Planning(format!("planner reply is not JSON: {:?}", completion.content)))?;
    debug!("Planner reply: {}", value);
    let plan = CapabilityPlan::from_value(&value)?;
    info!("Capability plan: {}", serde_json::to_string(&plan)?);
    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use dayline_chat::Completion;

    struct Fixed(Result<Completion>);

    #[async_trait]
    impl LanguageModel for Fixed {
        async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
            assert!(request.response_schema.is_some());
            assert!(request.tools.is_empty());
            match &self.0 {
                Ok(c) => Ok(c.clone()),
                Err(e) => Err(Error::Completion(e.to_string())),
            }
        }
    }

    #[test]
    fn test_absent_keys_default_to_wanted() {
        let plan = CapabilityPlan::new([("exif", false)]);
        assert!(plan.wants("caption"));
        assert!(!plan.wants("exif"));
        assert!(plan.wants("weather"));
    }

    #[test]
    fn test_from_value_rejects_non_bool() {
        assert!(CapabilityPlan::from_value(&json!({"caption": "yes"})).is_err());
        assert!(CapabilityPlan::from_value(&json!([true])).is_err());
        let plan = CapabilityPlan::from_value(&json!({"caption": true, "exif": false})).unwrap();
        assert!(!plan.wants("exif"));
    }

    #[tokio::test]
    async fn test_decide_plan_parses_reply() {
        let model = Fixed(Ok(Completion::text(
            r#"{"caption": true, "exif": false, "weather": false, "address": true}"#,
        )));
        let plan = decide_plan(&model, "just a caption").await.unwrap();
        assert!(plan.wants("caption"));
        assert!(!plan.wants("exif"));
    }

    #[tokio::test]
    async fn test_planner_failure_is_fatal() {
        let model = Fixed(Err(Error::Completion("503".into())));
        let err = decide_plan(&model, "anything").await.unwrap_err();
        assert!(matches!(err, Error::Planning(_)));

        let model = Fixed(Ok(Completion::text("sure, both!")));
        let err = decide_plan(&model, "anything").await.unwrap_err();
        assert!(matches!(err, Error::Planning(_)));
    }
}
