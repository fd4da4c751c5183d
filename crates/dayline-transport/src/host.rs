//! Server side of the service invocation protocol.
//!
//! A leaf service registers its operations on a [`ServiceHost`] and calls
//! [`ServiceHost::run_stdio`]. Requests are handled one at a time in arrival
//! order.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::protocol::{
    methods, ContentItem, JsonRpcError, JsonRpcRequest, JsonRpcResponse, RawReply, ToolInfo,
    PROTOCOL_VERSION,
};

type Handler = Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, String>> + Send + Sync>;

/// Registry of named operations served over a line-delimited stream.
pub struct ServiceHost {
    name: String,
    version: String,
    operations: BTreeMap<String, (ToolInfo, Handler)>,
}

impl ServiceHost {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            operations: BTreeMap::new(),
        }
    }

    /// Register an operation. The handler receives the call's `arguments`.
    pub fn register<F, Fut>(
        &mut self,
        name: &str,
        description: &str,
        input_schema: Value,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let info = ToolInfo {
            name: name.to_string(),
            description: description.to_string(),
            input_schema,
        };
        let boxed: Handler = Arc::new(
            move |args: Value| -> BoxFuture<'static, Result<Value, String>> {
                Box::pin(handler(args))
            },
        );
        self.operations.insert(name.to_string(), (info, boxed));
        self
    }

    pub fn operations(&self) -> impl Iterator<Item = &ToolInfo> {
        self.operations.values().map(|(info, _)| info)
    }

    /// Serve on the process's own stdin/stdout until EOF.
    pub async fn run_stdio(&self) -> std::io::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Serve requests from `input`, writing replies to `output`, until EOF.
    pub async fn serve<R, W>(&self, input: R, mut output: W) -> std::io::Result<()>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut reader = BufReader::new(input);
        let mut line = String::new();

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                debug!("{}: input closed", self.name);
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<JsonRpcRequest>(trimmed) {
                Ok(request) => self.handle(request).await,
                Err(e) => Some(JsonRpcResponse::error(
                    Value::Null,
                    JsonRpcError::parse_error(format!("Parse error: {}", e)),
                )),
            };

            if let Some(response) = response {
                let json = serde_json::to_string(&response)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                output.write_all(json.as_bytes()).await?;
                output.write_all(b"\n").await?;
                output.flush().await?;
            }
        }

        Ok(())
    }

    /// Handle one request. Notifications produce no response.
    async fn handle(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        let id = request.id.clone()?;
        let result = match request.method.as_str() {
            methods::INITIALIZE => Ok(json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {"tools": {}},
                "serverInfo": {"name": self.name, "version": self.version},
            })),
            methods::LIST_TOOLS => Ok(json!({
                "tools": self.operations().collect::<Vec<_>>(),
            })),
            methods::CALL_TOOL => self.call(&request).await,
            methods::PING => Ok(json!({})),
            other => Err(JsonRpcError::method_not_found(other)),
        };
        Some(JsonRpcResponse::from_result(id, result))
    }

    async fn call(&self, request: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let call = request.extract_tool_call()?;
        let (_, handler) = self.operations.get(&call.name).ok_or_else(|| {
            JsonRpcError::invalid_params(format!("Unknown operation: {}", call.name))
        })?;

        let reply = match handler(call.arguments).await {
            Ok(Value::String(text)) => RawReply {
                content: vec![ContentItem::text(text)],
                ..Default::default()
            },
            Ok(value @ Value::Object(_)) => RawReply {
                content: vec![ContentItem::text(value.to_string())],
                structured_content: Some(value),
                is_error: false,
            },
            Ok(other) => RawReply {
                content: vec![ContentItem::json(other)],
                ..Default::default()
            },
            Err(message) => {
                warn!("{}::{} failed: {}", self.name, call.name, message);
                RawReply {
                    content: vec![ContentItem::text(message)],
                    structured_content: None,
                    is_error: true,
                }
            }
        };

        serde_json::to_value(reply).map_err(|e| JsonRpcError::new(
            crate::protocol::error_codes::INTERNAL_ERROR,
            e.to_string(),
        ))
    }
}
