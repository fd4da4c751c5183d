//! Append-only conversation state shared with the decision collaborator.

use dayline_chat::{ChatMessage, Completion};
use serde_json::json;

use crate::types::ToolResult;

/// What happened to one requested tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// The call reached its service.
    Completed(ToolResult),
    /// The call was refused before dispatch (repeat, unplanned, unknown or
    /// malformed). Never counts as a result.
    Rejected(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Turn {
    System(String),
    User(String),
    Decision(Completion),
    Tool {
        call_id: String,
        tool: String,
        capability: Option<String>,
        outcome: ToolOutcome,
    },
}

/// Ordered turns of one run. Turns are only ever appended.
#[derive(Debug, Clone, Default)]
pub struct ConversationState {
    turns: Vec<Turn>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, turn: Turn) {
        self.turns.push(turn);
    }

    pub fn extend(&mut self, turns: impl IntoIterator<Item = Turn>) {
        self.turns.extend(turns);
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn latest_decision(&self) -> Option<&Completion> {
        self.turns.iter().rev().find_map(|t| match t {
            Turn::Decision(c) => Some(c),
            _ => None,
        })
    }

    /// Completed tool turns in insertion order.
    pub fn results(&self) -> impl Iterator<Item = (&str, &ToolResult)> {
        self.turns.iter().filter_map(|t| match t {
            Turn::Tool {
                capability: Some(cap),
                outcome: ToolOutcome::Completed(result),
                ..
            } => Some((cap.as_str(), result)),
            _ => None,
        })
    }

    pub fn has_result_for(&self, capability: &str) -> bool {
        self.results().any(|(cap, _)| cap == capability)
    }

    /// Wire messages for the next completion request.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .map(|turn| match turn {
                Turn::System(text) => ChatMessage::system(text.clone()),
                Turn::User(text) => ChatMessage::user(text.clone()),
                Turn::Decision(c) => ChatMessage::assistant(c.content.clone(), c.tool_calls.clone()),
                Turn::Tool {
                    call_id, outcome, ..
                } => {
                    let content = match outcome {
                        ToolOutcome::Completed(result) => result.to_content(),
                        ToolOutcome::Rejected(reason) => json!({ "error": "rejected", "reason": reason }),
                    };
                    ChatMessage::tool(call_id.clone(), content.to_string())
                }
            })
            .collect()
    }
}
