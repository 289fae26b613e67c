//! Serving a [`ToolPort`] over a line-delimited transport

use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::transport::{FrameReader, FrameWriter};
use crate::domain::mcp_types::{
    methods, CallToolParams, Implementation, IncomingMessage, InitializeResult, JsonRpcError,
    JsonRpcRequest, JsonRpcResponse, ServerCapabilities, INTERNAL_ERROR, INVALID_PARAMS,
    METHOD_NOT_FOUND, PROTOCOL_VERSION,
};
use crate::domain::ToolPort;

/// Answers protocol requests from a tool handler
#[derive(Clone)]
pub struct ProtocolServer {
    handler: Arc<dyn ToolPort>,
    info: Implementation,
    instructions: Option<String>,
}

impl ProtocolServer {
    pub fn new(handler: Arc<dyn ToolPort>, info: Implementation) -> Self {
        Self {
            handler,
            info,
            instructions: None,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Handle one request. Notifications produce no response.
    pub async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        if request.is_notification() {
            match request.method.as_str() {
                methods::NOTIFY_INITIALIZED => debug!("Client initialized"),
                other => debug!("Ignoring notification: {}", other),
            }
            return None;
        }

        let id = request.id.clone().unwrap_or(Value::Null);
        let result = match request.method.as_str() {
            methods::INITIALIZE => Ok(self.initialize_result()),
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => self.list_tools().await,
            methods::TOOLS_CALL => self.call_tool(request.params).await,
            methods::RESOURCES_LIST => self
                .handler
                .list_resources()
                .await
                .map(|r| json!({ "resources": r }))
                .map_err(|e| JsonRpcError::new(INTERNAL_ERROR, e.to_string())),
            methods::PROMPTS_LIST => self
                .handler
                .list_prompts()
                .await
                .map(|p| json!({ "prompts": p }))
                .map_err(|e| JsonRpcError::new(INTERNAL_ERROR, e.to_string())),
            other => Err(JsonRpcError::new(
                METHOD_NOT_FOUND,
                format!("Method not found: {}", other),
            )),
        };

        Some(match result {
            Ok(value) => JsonRpcResponse::success(id, value),
            Err(err) => JsonRpcResponse::failure(id, err),
        })
    }

    fn initialize_result(&self) -> Value {
        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(json!({ "listChanged": true })),
                resources: Some(json!({})),
                prompts: Some(json!({})),
            },
            server_info: self.info.clone(),
            instructions: self.instructions.clone(),
        };
        serde_json::to_value(result).unwrap_or_else(|_| json!({}))
    }

    async fn list_tools(&self) -> Result<Value, JsonRpcError> {
        self.handler
            .list_tools()
            .await
            .map(|tools| json!({ "tools": tools }))
            .map_err(|e| JsonRpcError::new(INTERNAL_ERROR, e.to_string()))
    }

    async fn call_tool(&self, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params = params.ok_or_else(|| JsonRpcError::new(INVALID_PARAMS, "Missing parameters"))?;
        let call: CallToolParams = serde_json::from_value(params)
            .map_err(|e| JsonRpcError::new(INVALID_PARAMS, format!("Invalid call params: {}", e)))?;
        let arguments = if call.arguments.is_null() {
            json!({})
        } else {
            call.arguments
        };

        match self.handler.execute_tool(&call.name, arguments).await {
            Ok(result) => serde_json::to_value(result)
                .map_err(|e| JsonRpcError::new(INTERNAL_ERROR, e.to_string())),
            Err(e) => Err(JsonRpcError::new(e.code(), e.to_string())),
        }
    }

    /// Serve one connection until the client hangs up.
    ///
    /// The current tool listing is pushed as a notification before anything
    /// else. Requests are handled concurrently, so a slow tool call does not
    /// hold up a `ping` behind it.
    pub async fn serve<R, W>(&self, reader: R, writer: W) -> anyhow::Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Value>();
        let writer_task = tokio::spawn(async move {
            let mut frames = FrameWriter::new(Box::new(writer));
            while let Some(message) = out_rx.recv().await {
                if let Err(e) = frames.write_frame(&message).await {
                    warn!("Failed to write response: {}", e);
                    break;
                }
            }
        });

        match self.list_tools().await {
            Ok(listing) => {
                let note = JsonRpcRequest::notification(methods::NOTIFY_TOOLS, Some(listing));
                let _ = out_tx.send(serde_json::to_value(note)?);
            }
            Err(e) => warn!("Could not advertise tools: {}", e.message),
        }

        let mut frames = FrameReader::new(reader);
        while let Some(frame) = frames.next_frame().await? {
            let request = match IncomingMessage::parse(&frame) {
                Some(IncomingMessage::Request { id, method, params }) => JsonRpcRequest {
                    jsonrpc: "2.0".to_string(),
                    id: Some(id),
                    method,
                    params,
                },
                Some(IncomingMessage::Notification { method, params }) => {
                    JsonRpcRequest::notification(method, params)
                }
                Some(IncomingMessage::Response { id, .. }) => {
                    debug!("Ignoring unsolicited response {}", id);
                    continue;
                }
                None => {
                    debug!("Ignoring malformed frame ({} bytes)", frame.len());
                    continue;
                }
            };

            let server = self.clone();
            let out_tx = out_tx.clone();
            tokio::spawn(async move {
                if let Some(response) = server.handle_request(request).await {
                    match serde_json::to_value(response) {
                        Ok(value) => {
                            let _ = out_tx.send(value);
                        }
                        Err(e) => error!("Failed to encode response: {}", e),
                    }
                }
            });
        }

        debug!("Client hung up");
        drop(out_tx);
        let _ = writer_task.await;
        Ok(())
    }

    /// Serve the process's own stdin/stdout.
    pub async fn serve_stdio(&self) -> anyhow::Result<()> {
        self.serve(tokio::io::stdin(), tokio::io::stdout()).await
    }

    /// Accept connections forever, serving each on its own task.
    pub async fn serve_tcp(&self, listener: TcpListener) -> anyhow::Result<()> {
        info!("Listening on {}", listener.local_addr()?);
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!("Accepted connection from {}", peer);
            let server = self.clone();
            tokio::spawn(async move {
                let (reader, writer) = stream.into_split();
                if let Err(e) = server.serve(reader, writer).await {
                    warn!("Connection from {} ended with error: {}", peer, e);
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CallToolResult, ToolError, ToolSpec};
    use async_trait::async_trait;

    struct EchoTools;

    #[async_trait]
    impl ToolPort for EchoTools {
        async fn list_tools(&self) -> anyhow::Result<Vec<ToolSpec>> {
            Ok(vec![ToolSpec::new("echo", "Echo the input", json!({"type": "object"}))])
        }

        async fn execute_tool(&self, name: &str, args: Value) -> Result<CallToolResult, ToolError> {
            match name {
                "echo" => Ok(CallToolResult::success(
                    args.get("text").and_then(|v| v.as_str()).unwrap_or_default(),
                )),
                "broken" => Err(ToolError::InvalidArguments("missing text".to_string())),
                other => Err(ToolError::NotFound(other.to_string())),
            }
        }
    }

    fn server() -> ProtocolServer {
        ProtocolServer::new(
            Arc::new(EchoTools),
            Implementation {
                name: "echo".to_string(),
                version: "0.0.1".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn test_initialize_reports_server_info() {
        let response = server()
            .handle_request(JsonRpcRequest::new(1, methods::INITIALIZE, Some(json!({}))))
            .await
            .unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(result["serverInfo"]["name"], "echo");
        assert_eq!(response.id, json!(1));
    }

    #[tokio::test]
    async fn test_tools_call_success_and_errors() {
        let server = server();

        let ok = server
            .handle_request(JsonRpcRequest::new(
                2,
                methods::TOOLS_CALL,
                Some(json!({"name": "echo", "arguments": {"text": "hi"}})),
            ))
            .await
            .unwrap();
        assert_eq!(ok.result.unwrap()["content"][0]["text"], "hi");

        let missing = server
            .handle_request(JsonRpcRequest::new(
                3,
                methods::TOOLS_CALL,
                Some(json!({"name": "nope"})),
            ))
            .await
            .unwrap();
        assert_eq!(missing.error.unwrap().code, METHOD_NOT_FOUND);

        let invalid = server
            .handle_request(JsonRpcRequest::new(
                4,
                methods::TOOLS_CALL,
                Some(json!({"name": "broken", "arguments": {}})),
            ))
            .await
            .unwrap();
        assert_eq!(invalid.error.unwrap().code, INVALID_PARAMS);

        let no_params = server
            .handle_request(JsonRpcRequest::new(5, methods::TOOLS_CALL, None))
            .await
            .unwrap();
        assert_eq!(no_params.error.unwrap().code, INVALID_PARAMS);
    }

    #[tokio::test]
    async fn test_unknown_method_and_notifications() {
        let server = server();
        let unknown = server
            .handle_request(JsonRpcRequest::new(9, "sampling/createMessage", None))
            .await
            .unwrap();
        assert_eq!(unknown.error.unwrap().code, METHOD_NOT_FOUND);

        let note = server
            .handle_request(JsonRpcRequest::notification(methods::NOTIFY_INITIALIZED, None))
            .await;
        assert!(note.is_none());
    }

    #[tokio::test]
    async fn test_serve_pushes_tools_then_answers() {
        use tokio::io::AsyncWriteExt;

        let (client_io, server_io) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server_io);
        let handle = tokio::spawn(async move { server().serve(server_read, server_write).await });

        let (client_read, mut client_write) = tokio::io::split(client_io);
        let mut frames = FrameReader::new(client_read);

        let first = IncomingMessage::parse(&frames.next_frame().await.unwrap().unwrap()).unwrap();
        match first {
            IncomingMessage::Notification { method, params } => {
                assert_eq!(method, methods::NOTIFY_TOOLS);
                assert_eq!(params.unwrap()["tools"][0]["name"], "echo");
            }
            other => panic!("expected tools notification, got {:?}", other),
        }

        client_write.write_all(b"garbage line\n").await.unwrap();
        client_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"ping\"}\n")
            .await
            .unwrap();

        let reply = IncomingMessage::parse(&frames.next_frame().await.unwrap().unwrap()).unwrap();
        assert_eq!(
            reply,
            IncomingMessage::Response {
                id: json!(1),
                outcome: Ok(json!({})),
            }
        );

        client_write.shutdown().await.unwrap();
        handle.await.unwrap().unwrap();
    }
}
