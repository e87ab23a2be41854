// ── MCP Client ─────────────────────────────────────────────────────────────
//
// A connected client for a single MCP server: transport fallback
// (Streamable HTTP first, then SSE), the `initialize` handshake, tool
// listing, and tool calls.

use super::transport::{McpTransportHandle, SseTransport, StreamableHttpTransport};
use super::types::*;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::AbortSignal;
use log::info;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// MCP protocol version we advertise.
const PROTOCOL_VERSION: &str = "2025-03-26";
/// Default timeout for control-plane requests (initialize, tools/list).
const CONTROL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct McpClient {
    /// The server config this client was created from.
    pub config: McpServerConfig,
    transport: McpTransportHandle,
    /// Monotonically increasing request ID.
    next_id: AtomicU64,
    /// Server info declared during initialize.
    pub server_info: Option<McpServerInfo>,
    /// Cached tools from the last `tools/list` call.
    pub tools: Vec<McpToolDef>,
}

impl McpClient {
    /// Connect with transport fallback: Streamable HTTP first, then SSE.
    /// Both failing yields a composite error. The abort signal is honored
    /// between attempts.
    pub async fn connect(
        config: McpServerConfig,
        signal: Option<&AbortSignal>,
    ) -> EngineResult<Self> {
        if !config.is_poolable() {
            return Err(EngineError::Config(format!(
                "server '{}' has no dialable URL transport",
                config.name
            )));
        }
        config.validate_url()?;

        info!("[mcp] Connecting to '{}' at {}", config.name, config.url);

        let http_attempt = Self::try_transport(
            &config,
            McpTransportHandle::StreamableHttp(StreamableHttpTransport::new(
                &config.url,
                &config.headers,
            )?),
        )
        .await;

        let client = match http_attempt {
            Ok(client) => client,
            Err(http_err) => {
                // Auth failures will not improve on a different transport.
                if matches!(http_err, EngineError::Auth(_)) {
                    return Err(http_err);
                }
                if let Some(sig) = signal {
                    if sig.is_aborted() {
                        return Err(EngineError::Cancelled(format!(
                            "connect to '{}' aborted between transports",
                            config.name
                        )));
                    }
                }
                info!(
                    "[mcp] Streamable HTTP failed for '{}', falling back to SSE: {}",
                    config.name, http_err
                );
                let sse = SseTransport::connect(&config.url, &config.headers).await.map_err(
                    |sse_err| {
                        EngineError::ServiceDown(format!(
                            "server '{}' unreachable. streamable_http: {http_err} | sse: {sse_err}",
                            config.name
                        ))
                    },
                )?;
                Self::try_transport(&config, McpTransportHandle::Sse(sse))
                    .await
                    .map_err(|sse_err| {
                        EngineError::ServiceDown(format!(
                            "server '{}' handshake failed. streamable_http: {http_err} | sse: {sse_err}",
                            config.name
                        ))
                    })?
            }
        };

        info!(
            "[mcp] Connected to '{}' via {} ({} tools)",
            client.config.name,
            client.transport.kind(),
            client.tools.len()
        );
        Ok(client)
    }

    /// Run the handshake + tool listing over a candidate transport.
    async fn try_transport(
        config: &McpServerConfig,
        transport: McpTransportHandle,
    ) -> EngineResult<Self> {
        let mut client = McpClient {
            config: config.clone(),
            transport,
            next_id: AtomicU64::new(1),
            server_info: None,
            tools: vec![],
        };
        client.initialize().await?;
        client.refresh_tools().await?;
        Ok(client)
    }

    /// MCP `initialize` handshake + `initialized` notification.
    async fn initialize(&mut self) -> EngineResult<()> {
        let params = InitializeParams {
            protocol_version: PROTOCOL_VERSION.into(),
            capabilities: McpClientCapabilities::default(),
            client_info: McpClientInfo {
                name: "Zikaron".into(),
                version: env!("CARGO_PKG_VERSION").into(),
            },
        };

        let req = JsonRpcRequest::new(
            self.next_id(),
            "initialize",
            Some(serde_json::to_value(&params)?),
        );
        let resp = self.transport.send_request(req, CONTROL_TIMEOUT).await?;

        if let Some(err) = resp.error {
            return Err(EngineError::BadResponse(format!(
                "initialize failed: {} (code={})",
                err.message, err.code
            )));
        }
        if let Some(result) = resp.result {
            let init: InitializeResult = serde_json::from_value(result)
                .map_err(|e| EngineError::BadResponse(format!("parse init result: {e}")))?;
            info!(
                "[mcp] '{}' initialized (protocol={})",
                self.config.name, init.protocol_version
            );
            self.server_info = init.server_info;
        }

        self.transport
            .send_notification("notifications/initialized", None)
            .await?;
        Ok(())
    }

    /// Fetch (or refresh) the tool list from the server.
    pub async fn refresh_tools(&mut self) -> EngineResult<()> {
        let req = JsonRpcRequest::new(self.next_id(), "tools/list", None);
        let resp = self.transport.send_request(req, CONTROL_TIMEOUT).await?;

        if let Some(err) = resp.error {
            // Server may not support tools — that's OK.
            if err.code == -32601 {
                info!("[mcp] '{}' does not expose tools", self.config.name);
                self.tools = vec![];
                return Ok(());
            }
            return Err(EngineError::BadResponse(format!(
                "tools/list failed: {} (code={})",
                err.message, err.code
            )));
        }

        if let Some(result) = resp.result {
            let list: ToolsListResult = serde_json::from_value(result)
                .map_err(|e| EngineError::BadResponse(format!("parse tools/list: {e}")))?;
            self.tools = list.tools;
        } else {
            self.tools = vec![];
        }
        Ok(())
    }

    /// Call a tool. The idle timeout resets on progress notifications
    /// (carried by the progress token in `_meta`).
    pub async fn call_tool(
        &self,
        tool_name: &str,
        arguments: serde_json::Value,
        idle_timeout: Duration,
    ) -> EngineResult<String> {
        let id = self.next_id();
        let params = ToolCallParams {
            name: tool_name.into(),
            arguments,
            meta: Some(serde_json::json!({ "progressToken": format!("call-{id}") })),
        };
        let req = JsonRpcRequest::new(id, "tools/call", Some(serde_json::to_value(&params)?));
        let resp = self.transport.send_request(req, idle_timeout).await?;

        if let Some(err) = resp.error {
            return Err(EngineError::tool(
                tool_name,
                format!("{} (code={})", err.message, err.code),
            ));
        }
        let result_val = resp
            .result
            .ok_or_else(|| EngineError::tool(tool_name, "empty result"))?;
        let tool_result: ToolCallResult = serde_json::from_value(result_val)
            .map_err(|e| EngineError::BadResponse(format!("parse tools/call result: {e}")))?;

        let text = extract_text_content(&tool_result.content);
        if tool_result.is_error {
            return Err(EngineError::tool(tool_name, text));
        }
        Ok(text)
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    pub fn shutdown(&self) {
        info!("[mcp] Shutting down client for '{}'", self.config.name);
        self.transport.shutdown();
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

// ── Tests ──────────────────────────────────────────────────────────────
