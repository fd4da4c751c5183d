//! Client side of a capability service: one spawned process, one channel.
//!
//! Requests are written as single JSON lines to the child's stdin by a writer
//! task; a reader task matches replies on stdout to pending requests by id.
//! Child stderr is relayed to the log.
//!
//! Timeout policy: a call that exceeds its budget removes its pending slot
//! (a late reply is discarded) and kills the service process, so no
//! abandoned work keeps running behind the orchestrator's back. Later calls
//! on the same channel fail with [`TransportError::Closed`].

use std::collections::{BTreeSet, HashMap};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dayline_core::ServiceDescriptor;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::protocol::{methods, JsonRpcRequest, JsonRpcResponse, RawReply, ToolInfo, PROTOCOL_VERSION};

type PendingMap = HashMap<u64, oneshot::Sender<JsonRpcResponse>>;

/// How long a closing service gets to exit on its own after stdin EOF.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// A live connection to one capability service.
///
/// The orchestrators only talk to services through this trait, so tests can
/// substitute in-memory channels.
#[async_trait]
pub trait CapabilityChannel: Send + Sync {
    /// Capability name this channel serves.
    fn service(&self) -> &str;

    async fn list_operations(&self, timeout: Duration) -> Result<BTreeSet<String>, TransportError>;

    async fn invoke(
        &self,
        operation: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<RawReply, TransportError>;

    /// Release the channel and its process. Idempotent.
    async fn close(&self);
}

/// JSON-RPC over the stdio of a spawned child process.
pub struct StdioChannel {
    service: String,
    child: tokio::sync::Mutex<Option<Child>>,
    writer: Mutex<Option<mpsc::Sender<String>>>,
    pending: Arc<Mutex<PendingMap>>,
    next_id: AtomicU64,
    alive: Arc<AtomicBool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    server_info: Mutex<Option<Value>>,
}

impl std::fmt::Debug for StdioChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StdioChannel")
            .field("service", &self.service)
            .field("alive", &self.is_alive())
            .finish()
    }
}

impl StdioChannel {
    /// Start the service process and its I/O tasks. No protocol traffic yet.
    pub async fn spawn(descriptor: &ServiceDescriptor) -> Result<Self, TransportError> {
        let mut cmd = Command::new(&descriptor.program);
        cmd.args(&descriptor.args)
            .envs(&descriptor.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &descriptor.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = cmd.spawn().map_err(|e| {
            TransportError::Spawn(format!(
                "{} {}: {}",
                descriptor.program,
                descriptor.args.join(" "),
                e
            ))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn("stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn("stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Spawn("stderr not captured".into()))?;

        let service = descriptor.name.clone();
        let pending: Arc<Mutex<PendingMap>> = Arc::new(Mutex::new(HashMap::new()));
        let alive = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel::<String>(64);

        let tasks = vec![
            tokio::spawn(read_replies(
                service.clone(),
                stdout,
                Arc::clone(&pending),
                Arc::clone(&alive),
            )),
            tokio::spawn(write_requests(service.clone(), stdin, rx)),
            tokio::spawn(relay_stderr(service.clone(), stderr)),
        ];

        info!(
            "Spawned service {} (pid {:?})",
            service,
            child.id()
        );

        Ok(Self {
            service,
            child: tokio::sync::Mutex::new(Some(child)),
            writer: Mutex::new(Some(tx)),
            pending,
            next_id: AtomicU64::new(1),
            alive,
            tasks: Mutex::new(tasks),
            server_info: Mutex::new(None),
        })
    }

    /// Spawn and handshake. On handshake failure the process is released
    /// before the error is returned.
    pub async fn connect(
        descriptor: &ServiceDescriptor,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let channel = Self::spawn(descriptor).await?;
        if let Err(e) = channel.handshake(timeout).await {
            channel.shutdown().await;
            return Err(e);
        }
        Ok(channel)
    }

    /// `initialize` exchange followed by the `initialized` notification.
    /// Returns the service's `serverInfo`.
    pub async fn handshake(&self, timeout: Duration) -> Result<Value, TransportError> {
        let params = json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {"name": "dayline", "version": env!("CARGO_PKG_VERSION")},
        });
        let result = self
            .request(methods::INITIALIZE, params, methods::INITIALIZE, timeout)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        self.notify(methods::INITIALIZED)
            .await
            .map_err(|e| TransportError::Handshake(e.to_string()))?;

        let info = result.get("serverInfo").cloned().unwrap_or(Value::Null);
        debug!("{}: handshake complete, serverInfo={}", self.service, info);
        *self.server_info.lock() = Some(info.clone());
        Ok(info)
    }

    pub async fn list_tools(&self, timeout: Duration) -> Result<Vec<ToolInfo>, TransportError> {
        let result = self
            .request(methods::LIST_TOOLS, json!({}), methods::LIST_TOOLS, timeout)
            .await?;
        let tools = result.get("tools").cloned().unwrap_or_else(|| json!([]));
        serde_json::from_value(tools)
            .map_err(|e| TransportError::Invocation(format!("malformed tools/list reply: {}", e)))
    }

    /// Invoke one operation. A reply flagged `isError` is an invocation error.
    pub async fn call_tool(
        &self,
        operation: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<RawReply, TransportError> {
        let params = json!({"name": operation, "arguments": arguments});
        let result = self
            .request(methods::CALL_TOOL, params, operation, timeout)
            .await?;
        let reply: RawReply = serde_json::from_value(result)
            .map_err(|e| TransportError::Invocation(format!("malformed reply: {}", e)))?;
        if reply.is_error {
            let reason = reply
                .first_text()
                .map(str::to_string)
                .unwrap_or_else(|| reply.render());
            return Err(TransportError::Invocation(reason));
        }
        Ok(reply)
    }

    pub async fn ping(&self, timeout: Duration) -> Result<(), TransportError> {
        self.request(methods::PING, json!({}), methods::PING, timeout)
            .await
            .map(|_| ())
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn server_info(&self) -> Option<Value> {
        self.server_info.lock().clone()
    }

    /// Close stdin, give the process a short grace period, then kill it.
    /// Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.writer.lock().take();
        self.pending.lock().clear();

        let child = self.child.lock().await.take();
        if let Some(mut child) = child {
            match tokio::time::timeout(CLOSE_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!("{}: exited with {}", self.service, status),
                _ => {
                    if let Err(e) = child.kill().await {
                        warn!("{}: failed to kill service: {}", self.service, e);
                    }
                }
            }
            info!("Closed service {}", self.service);
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    /// Stop using the channel immediately: fail pending calls and signal the
    /// process to die without waiting for it. `shutdown` reaps it later.
    async fn abandon(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.writer.lock().take();
        self.pending.lock().clear();
        if let Some(child) = self.child.lock().await.as_mut() {
            if let Err(e) = child.start_kill() {
                debug!("{}: kill after timeout failed: {}", self.service, e);
            }
        }
    }

    async fn notify(&self, method: &str) -> Result<(), TransportError> {
        let line = serde_json::to_string(&JsonRpcRequest::notification(method))
            .map_err(|e| TransportError::Invocation(e.to_string()))?;
        let writer = self.writer.lock().clone();
        match writer {
            Some(writer) => writer.send(line).await.map_err(|_| TransportError::Closed),
            None => Err(TransportError::Closed),
        }
    }

    async fn request(
        &self,
        method: &str,
        params: Value,
        label: &str,
        timeout: Duration,
    ) -> Result<Value, TransportError> {
        if !self.is_alive() {
            return Err(TransportError::Closed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = serde_json::to_string(&JsonRpcRequest::new(id, method, params))
            .map_err(|e| TransportError::Invocation(format!("unserializable request: {}", e)))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);

        let writer = self.writer.lock().clone();
        let sent = match writer {
            Some(writer) => writer.send(line).await.is_ok(),
            None => false,
        };
        if !sent {
            self.pending.lock().remove(&id);
            return Err(TransportError::Closed);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => match response.error {
                Some(err) => Err(TransportError::Invocation(err.to_string())),
                None => Ok(response.result.unwrap_or(Value::Null)),
            },
            Ok(Err(_)) => Err(TransportError::Invocation(format!(
                "{} closed before replying to {}",
                self.service, label
            ))),
            Err(_) => {
                self.pending.lock().remove(&id);
                warn!(
                    "{}: {} timed out after {}ms, terminating service",
                    self.service,
                    label,
                    timeout.as_millis()
                );
                self.abandon().await;
                Err(TransportError::Timeout {
                    operation: label.to_string(),
                    timeout,
                })
            }
        }
    }
}

impl Drop for StdioChannel {
    fn drop(&mut self) {
        // The child itself is killed by `kill_on_drop`.
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl CapabilityChannel for StdioChannel {
    fn service(&self) -> &str {
        &self.service
    }

    async fn list_operations(&self, timeout: Duration) -> Result<BTreeSet<String>, TransportError> {
        Ok(self
            .list_tools(timeout)
            .await?
            .into_iter()
            .map(|t| t.name)
            .collect())
    }

    async fn invoke(
        &self,
        operation: &str,
        arguments: Value,
        timeout: Duration,
    ) -> Result<RawReply, TransportError> {
        self.call_tool(operation, arguments, timeout).await
    }

    async fn close(&self) {
        self.shutdown().await;
    }
}

async fn read_replies(
    service: String,
    stdout: ChildStdout,
    pending: Arc<Mutex<PendingMap>>,
    alive: Arc<AtomicBool>,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => {
                debug!("{}: stdout closed", service);
                break;
            }
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                let value: Value = match serde_json::from_str(trimmed) {
                    Ok(v) => v,
                    Err(_) => {
                        debug!("{}: ignoring non-protocol output: {}", service, trimmed);
                        continue;
                    }
                };
                // Server-initiated requests and notifications are not replies.
                if value.get("method").is_some() {
                    continue;
                }
                let response: JsonRpcResponse = match serde_json::from_value(value) {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("{}: malformed reply: {}", service, e);
                        continue;
                    }
                };
                let Some(id) = response.id.as_u64() else {
                    continue;
                };
                let sender = pending.lock().remove(&id);
                match sender {
                    Some(tx) => {
                        let _ = tx.send(response);
                    }
                    None => debug!("{}: discarding reply to abandoned request {}", service, id),
                }
            }
            Err(e) => {
                warn!("{}: error reading stdout: {}", service, e);
                break;
            }
        }
    }
    alive.store(false, Ordering::SeqCst);
    // Dropping the senders wakes every waiter with a closed-channel error.
    pending.lock().clear();
}

async fn write_requests(service: String, mut stdin: ChildStdin, mut rx: mpsc::Receiver<String>) {
    while let Some(msg) = rx.recv().await {
        let written = async {
            stdin.write_all(msg.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        if let Err(e) = written {
            warn!("{}: failed to write to stdin: {}", service, e);
            break;
        }
    }
}

async fn relay_stderr(service: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => debug!(target: "dayline::service", "[{}] {}", service, line.trim_end()),
        }
    }
}
