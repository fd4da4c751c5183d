//! Service registry: capability name → live channel, scoped to one run.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dayline_core::RunConfig;
use dayline_transport::{normalize, CapabilityChannel, StdioChannel, TransportError};
use futures::future::join_all;
use tracing::{debug, info, warn};

use crate::types::{ToolCall, ToolResult};

/// Channels owned by one run, plus why the missing ones are missing.
#[derive(Default)]
pub struct ServiceRegistry {
    channels: BTreeMap<String, Arc<dyn CapabilityChannel>>,
    unavailable: BTreeMap<String, String>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("live", &self.channels.keys().collect::<Vec<_>>())
            .field("unavailable", &self.unavailable)
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, channel: Arc<dyn CapabilityChannel>) {
        let name = channel.service().to_string();
        self.unavailable.remove(&name);
        self.channels.insert(name, channel);
    }

    pub fn mark_unavailable(&mut self, capability: &str, reason: impl Into<String>) {
        self.unavailable.insert(capability.to_string(), reason.into());
    }

    pub fn contains(&self, capability: &str) -> bool {
        self.channels.contains_key(capability)
    }

    pub fn live(&self) -> impl Iterator<Item = &str> {
        self.channels.keys().map(String::as_str)
    }

    pub fn unavailable(&self) -> &BTreeMap<String, String> {
        &self.unavailable
    }

    /// Invoke and normalize. Never fails: problems become `Failure`/`Timeout`.
    pub async fn invoke(&self, call: &ToolCall, timeout: Duration) -> ToolResult {
        let Some(channel) = self.channels.get(&call.capability) else {
            let reason = self
                .unavailable
                .get(&call.capability)
                .cloned()
                .unwrap_or_else(|| "not running".into());
            return ToolResult::Failure(format!("service {} unavailable: {}", call.capability, reason));
        };

        debug!("Invoking {}::{}", call.capability, call.operation);
        match channel
            .invoke(&call.operation, call.arguments.clone(), timeout)
            .await
        {
            Ok(reply) => ToolResult::Success(normalize(&reply)),
            Err(TransportError::Timeout { .. }) => ToolResult::Timeout,
            Err(e) => ToolResult::Failure(e.for_service(&call.capability).to_string()),
        }
    }

    /// Close every channel. Safe to call more than once.
    pub async fn shutdown(&self) {
        join_all(self.channels.values().map(|c| c.close())).await;
        if !self.channels.is_empty() {
            debug!("Registry shut down ({} services)", self.channels.len());
        }
    }
}

/// Builds the registry for a run.
#[async_trait]
pub trait ServiceLauncher: Send + Sync {
    async fn launch(&self, capabilities: &[String]) -> ServiceRegistry;
}

/// Spawns service processes from the run configuration.
pub struct ProcessLauncher {
    config: RunConfig,
}

impl ProcessLauncher {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ServiceLauncher for ProcessLauncher {
    async fn launch(&self, capabilities: &[String]) -> ServiceRegistry {
        let mut registry = ServiceRegistry::new();
        let handshake_timeout = self.config.timeout();

        let mut pending = Vec::new();
        for name in capabilities {
            let Some(descriptor) = self.config.service(name) else {
                registry.mark_unavailable(name, "no service configured");
                continue;
            };
            if !descriptor.is_available() {
                info!("Skipping {}: {:?} not found", name, descriptor.script_path());
                registry.mark_unavailable(name, "not installed");
                continue;
            }
            pending.push(async move {
                let result = StdioChannel::connect(&descriptor, handshake_timeout).await;
                (descriptor.name, result)
            });
        }

        for (name, result) in join_all(pending).await {
            match result {
                Ok(channel) => {
                    info!("Started service {}", name);
                    registry.insert(Arc::new(channel));
                }
                Err(e) => {
                    let err = e.for_service(&name);
                    warn!("{}", err);
                    registry.mark_unavailable(&name, err.to_string());
                }
            }
        }
        registry
    }
}
