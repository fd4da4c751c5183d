//! Result collection: one entry per capability, last write wins.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::conversation::ConversationState;
use crate::types::ToolResult;

#[derive(Debug, Clone, Default)]
pub struct ResultAccumulator {
    results: BTreeMap<String, ToolResult>,
}

impl ResultAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Group completed tool turns by capability. Rejected turns are ignored.
    pub fn from_conversation(state: &ConversationState) -> Self {
        let mut acc = Self::new();
        for (capability, result) in state.results() {
            acc.record(capability, result.clone());
        }
        acc
    }

    pub fn record(&mut self, capability: &str, result: ToolResult) {
        self.results.insert(capability.to_string(), result);
    }

    pub fn get(&self, capability: &str) -> Option<&ToolResult> {
        self.results.get(capability)
    }

    /// Canonical payload, only for successful results.
    pub fn payload(&self, capability: &str) -> Option<&Value> {
        self.get(capability).and_then(ToolResult::payload)
    }

    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.results.keys().map(String::as_str)
    }
}
