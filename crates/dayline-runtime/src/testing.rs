//! In-memory collaborators for orchestrator tests.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dayline_chat::{Completion, CompletionRequest, LanguageModel, ToolCallRequest};
use dayline_core::{Error, Result};
use dayline_transport::{CapabilityChannel, ContentItem, RawReply, TransportError};
use parking_lot::Mutex;
use serde_json::{json, Value};

use crate::registry::{ServiceLauncher, ServiceRegistry};

#[derive(Clone)]
pub enum Behavior {
    Reply(Value),
    Text(String),
    Fail(String),
    Hang,
}

pub struct FakeChannel {
    name: String,
    behavior: Behavior,
    pub calls: Mutex<Vec<(String, Value)>>,
    pub closed: Mutex<u32>,
}

impl FakeChannel {
    pub fn new(name: &str, behavior: Behavior) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            behavior,
            calls: Mutex::new(Vec::new()),
            closed: Mutex::new(0),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl CapabilityChannel for FakeChannel {
    fn service(&self) -> &str {
        &self.name
    }

    async fn list_operations(&self, _timeout: Duration) -> std::result::Result<BTreeSet<String>, TransportError> {
        Ok(BTreeSet::new())
    }

    async fn invoke(
        &self,
        operation: &str,
        arguments: Value,
        timeout: Duration,
    ) -> std::result::Result<RawReply, TransportError> {
        self.calls.lock().push((operation.to_string(), arguments));
        match &self.behavior {
            Behavior::Reply(v) => Ok(RawReply {
                structured_content: Some(v.clone()),
                ..Default::default()
            }),
            Behavior::Text(t) => Ok(RawReply {
                content: vec![ContentItem::text(t.clone())],
                ..Default::default()
            }),
            Behavior::Fail(reason) => Err(TransportError::Invocation(reason.clone())),
            Behavior::Hang => {
                tokio::time::sleep(timeout).await;
                Err(TransportError::Timeout {
                    operation: operation.to_string(),
                    timeout,
                })
            }
        }
    }

    async fn close(&self) {
        *self.closed.lock() += 1;
    }
}

/// Launcher over a fixed set of fakes; records what was asked for.
pub struct FakeLauncher {
    channels: Vec<Arc<FakeChannel>>,
    pub requested: Mutex<Vec<String>>,
}

impl FakeLauncher {
    pub fn new(channels: Vec<Arc<FakeChannel>>) -> Self {
        Self {
            channels,
            requested: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl ServiceLauncher for FakeLauncher {
    async fn launch(&self, capabilities: &[String]) -> ServiceRegistry {
        self.requested.lock().extend(capabilities.iter().cloned());
        let mut registry = ServiceRegistry::new();
        for name in capabilities {
            match self.channels.iter().find(|c| c.service() == name) {
                Some(c) => registry.insert(c.clone()),
                None => registry.mark_unavailable(name, "spawn failed"),
            }
        }
        registry
    }
}

/// Replays queued replies in order, then `fallback` (or an error).
pub struct ScriptedModel {
    replies: Mutex<VecDeque<std::result::Result<Completion, String>>>,
    fallback: Option<Completion>,
    untooled: Option<Completion>,
    pub requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<std::result::Result<Completion, String>>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            fallback: None,
            untooled: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_fallback(mut self, fallback: Completion) -> Self {
        self.fallback = Some(fallback);
        self
    }

    /// Answer every request that offers no tools and no schema (compose
    /// steps, and decide steps of an empty plan) without consuming the script.
    pub fn with_untooled_reply(mut self, reply: Completion) -> Self {
        self.untooled = Some(reply);
        self
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion> {
        let untooled = request.tools.is_empty() && request.response_schema.is_none();
        self.requests.lock().push(request);
        if let (true, Some(reply)) = (untooled, &self.untooled) {
            return Ok(reply.clone());
        }
        match self.replies.lock().pop_front() {
            Some(Ok(c)) => Ok(c),
            Some(Err(e)) => Err(Error::Completion(e)),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| Error::Completion("script exhausted".into())),
        }
    }
}

pub fn plan_reply(caption: bool, exif: bool) -> std::result::Result<Completion, String> {
    Ok(Completion::text(
        json!({"caption": caption, "exif": exif, "weather": true, "address": true}).to_string(),
    ))
}

/// A decision requesting the given tools, each with `{"path": "sample.jpg"}`.
pub fn tool_decision(tools: &[&str]) -> std::result::Result<Completion, String> {
    Ok(Completion {
        content: None,
        tool_calls: tools
            .iter()
            .enumerate()
            .map(|(i, name)| ToolCallRequest {
                id: format!("call_{}_{}", i, name),
                name: name.to_string(),
                arguments: json!({"path": "sample.jpg"}),
            })
            .collect(),
    })
}

pub fn text_reply(content: &str) -> std::result::Result<Completion, String> {
    Ok(Completion::text(content))
}

pub fn caption_reply() -> Value {
    json!({"caption": "a dog on a beach", "tags": ["dog", "beach"]})
}
