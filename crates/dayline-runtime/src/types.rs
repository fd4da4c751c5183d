//! Runtime types.

use serde::Serialize;
use serde_json::{json, Value};

use crate::plan::CapabilityPlan;

/// One capability invocation attempt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolCall {
    pub capability: String,
    pub operation: String,
    pub arguments: Value,
}

impl ToolCall {
    pub fn new(capability: impl Into<String>, operation: impl Into<String>, arguments: Value) -> Self {
        Self {
            capability: capability.into(),
            operation: operation.into(),
            arguments,
        }
    }
}

/// Outcome of one invocation. Payloads are always normalized.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "lowercase")]
pub enum ToolResult {
    Success(Value),
    Failure(String),
    Timeout,
}

impl ToolResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ToolResult::Success(_))
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            ToolResult::Success(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_payload(self) -> Option<Value> {
        match self {
            ToolResult::Success(v) => Some(v),
            _ => None,
        }
    }

    /// What the decision collaborator sees for this result.
    pub fn to_content(&self) -> Value {
        match self {
            ToolResult::Success(v) => v.clone(),
            ToolResult::Failure(reason) => json!({ "error": reason }),
            ToolResult::Timeout => json!({ "error": "timeout" }),
        }
    }
}

/// Record of one state-machine run, printed by `dayline diary`.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub plan: CapabilityPlan,
    pub caption: Option<Value>,
    pub meta: Option<Value>,
    pub diary: String,
    /// Decide steps taken.
    #[serde(skip)]
    pub decisions: usize,
    /// Capabilities actually invoked, in dispatch order.
    #[serde(skip)]
    pub invoked: Vec<String>,
}

/// Which inputs contributed to a dayline.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsedSources {
    pub caption: bool,
    pub playlist: bool,
    pub mbti: bool,
    pub diary: bool,
    pub meta: bool,
}

/// Normalized payload per capability; `None` where the capability was
/// absent, failed or timed out.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SourcePayloads {
    pub caption: Option<Value>,
    pub meta: Option<Value>,
    pub playlist: Option<Value>,
    pub mbti: Option<Value>,
    pub diary: Option<Value>,
}

/// Output of the fault-tolerant orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct DaylineOutput {
    pub dayline: String,
    pub used: UsedSources,
    pub sources: SourcePayloads,
    /// True when the line came from the fallback completion instead of the
    /// synthesis service.
    pub degraded: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_result_content() {
        assert_eq!(
            ToolResult::Success(json!({"caption": "x"})).to_content(),
            json!({"caption": "x"})
        );
        assert_eq!(ToolResult::Timeout.to_content(), json!({"error": "timeout"}));
        assert!(ToolResult::Failure("boom".into()).payload().is_none());
    }
}
