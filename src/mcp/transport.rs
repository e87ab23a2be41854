// ── MCP Transports ─────────────────────────────────────────────────────────
//
// Two URL-based transports, tried in this order when connecting:
//
//   StreamableHttp — every JSON-RPC request is its own POST; the server
//   answers with plain JSON or a short SSE stream carrying the response
//   (and optional progress notifications). A session id handed out during
//   `initialize` rides subsequent requests.
//
//   Sse — one long-lived GET stream; the first `endpoint` event names the
//   POST target, responses come back on the stream and are routed to
//   waiting callers by JSON-RPC id.
//
// Per-call timeouts are idle timeouts: any bytes from the server (including
// progress notifications) reset the clock, so a slow-but-alive tool call is
// not cut off mid-work.

use super::types::{JsonRpcRequest, JsonRpcResponse};
use crate::atoms::error::{EngineError, EngineResult};
use futures::StreamExt;
use log::{debug, info, warn};
use reqwest::Client;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};

/// Connect timeout shared by both transports.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

// ═══════════════════════════════════════════════════════════════════════════
// SSE event parsing
// ═══════════════════════════════════════════════════════════════════════════

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

/// Incrementally drain complete events (terminated by a blank line) from a
/// buffer, leaving any partial event in place.
pub fn drain_sse_events(buffer: &mut String) -> Vec<SseEvent> {
    let mut events = Vec::new();
    loop {
        let Some(split) = buffer.find("\n\n") else { break };
        let raw: String = buffer.drain(..split + 2).collect();
        let mut event = String::from("message");
        let mut data_lines: Vec<&str> = Vec::new();
        for line in raw.lines() {
            if let Some(rest) = line.strip_prefix("event:") {
                event = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("data:") {
                data_lines.push(rest.strip_prefix(' ').unwrap_or(rest));
            }
        }
        if !data_lines.is_empty() || event != "message" {
            events.push(SseEvent { event, data: data_lines.join("\n") });
        }
    }
    events
}

fn classify_reqwest(context: &str, e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::Transport(format!("{context} timed out: {e}"))
    } else if e.is_connect() {
        EngineError::ServiceDown(format!("{context} unreachable: {e}"))
    } else {
        EngineError::Transport(format!("{context}: {e}"))
    }
}

fn classify_status(context: &str, status: u16, body: &str) -> EngineError {
    let brief: String = body.chars().take(200).collect();
    match status {
        401 | 403 => EngineError::Auth(format!(
            "{context} returned {status} (auth_required — check the server's headers/token)"
        )),
        s if s >= 500 => EngineError::ServiceDown(format!("{context} {status}: {brief}")),
        _ => EngineError::BadResponse(format!("{context} {status}: {brief}")),
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Streamable HTTP transport
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug)]
pub struct StreamableHttpTransport {
    client: Client,
    url: String,
    headers: BTreeMap<String, String>,
    /// Session id minted by the server during initialize.
    session_id: Mutex<Option<String>>,
}

impl StreamableHttpTransport {
    pub fn new(url: &str, headers: &BTreeMap<String, String>) -> EngineResult<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Transport(format!("http client build: {e}")))?;
        Ok(StreamableHttpTransport {
            client,
            url: url.to_string(),
            headers: headers.clone(),
            session_id: Mutex::new(None),
        })
    }

    /// POST one JSON-RPC request; `idle_timeout` resets on any server bytes.
    pub async fn send_request(
        &self,
        request: JsonRpcRequest,
        idle_timeout: Duration,
    ) -> EngineResult<JsonRpcResponse> {
        let id = request.id;
        let mut builder = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .header("Content-Type", "application/json");
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        if let Some(session) = self.session_id.lock().await.as_ref() {
            builder = builder.header("Mcp-Session-Id", session);
        }

        let resp = tokio::time::timeout(idle_timeout, builder.json(&request).send())
            .await
            .map_err(|_| EngineError::Transport(format!("request {id} timed out (connect)")))?
            .map_err(|e| classify_reqwest("mcp server", e))?;

        if let Some(session) = resp
            .headers()
            .get("mcp-session-id")
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(session.to_string());
        }

        let status = resp.status().as_u16();
        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status("mcp server", status, &body));
        }

        let content_type = resp
            .headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        if content_type.contains("text/event-stream") {
            self.read_sse_response(resp, id, idle_timeout).await
        } else {
            let body = tokio::time::timeout(idle_timeout, resp.text())
                .await
                .map_err(|_| EngineError::Transport(format!("request {id} timed out (body)")))?
                .map_err(|e| classify_reqwest("mcp body", e))?;
            serde_json::from_str::<JsonRpcResponse>(&body)
                .map_err(|e| EngineError::BadResponse(format!("mcp response not JSON-RPC: {e}")))
        }
    }

    /// Scan an SSE-framed response body for the message answering `id`.
    /// Progress notifications reset the idle clock and are otherwise dropped.
    async fn read_sse_response(
        &self,
        resp: reqwest::Response,
        id: u64,
        idle_timeout: Duration,
    ) -> EngineResult<JsonRpcResponse> {
        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();

        loop {
            let chunk = tokio::time::timeout(idle_timeout, stream.next())
                .await
                .map_err(|_| {
                    EngineError::Transport(format!("request {id} idle-timed out mid-stream"))
                })?;
            let Some(chunk) = chunk else {
                return Err(EngineError::BadResponse(format!(
                    "stream ended without a response for request {id}"
                )));
            };
            let bytes = chunk.map_err(|e| classify_reqwest("mcp stream", e))?;
            buffer.push_str(&String::from_utf8_lossy(&bytes));

            for event in drain_sse_events(&mut buffer) {
                if event.data.is_empty() {
                    continue;
                }
                match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                    Ok(parsed) if parsed.id == Some(id) => return Ok(parsed),
                    Ok(_) => {
                        // Progress / unrelated notification — any activity
                        // already reset the idle clock above.
                        debug!("[mcp] Interim event on request {id}");
                    }
                    Err(e) => warn!("[mcp] Unparseable SSE data: {e}"),
                }
            }
        }
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> EngineResult<()> {
        let notif = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or(serde_json::json!({})),
        });
        let mut builder = self
            .client
            .post(&self.url)
            .header("Accept", "application/json, text/event-stream")
            .header("Content-Type", "application/json");
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        if let Some(session) = self.session_id.lock().await.as_ref() {
            builder = builder.header("Mcp-Session-Id", session);
        }
        let resp = builder
            .json(&notif)
            .send()
            .await
            .map_err(|e| classify_reqwest("mcp notification", e))?;
        // 202/204 are the usual acks; anything else non-success is reported.
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status("mcp notification", status, &body));
        }
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        // Stateless between calls; liveness is probed by the next request.
        true
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// SSE transport
// ═══════════════════════════════════════════════════════════════════════════

type PendingMap = Arc<Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>>;

#[derive(Debug)]
pub struct SseTransport {
    client: Client,
    /// POST target announced by the server's `endpoint` event.
    endpoint: String,
    headers: BTreeMap<String, String>,
    pending: PendingMap,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl SseTransport {
    /// Open the event stream and wait for the `endpoint` event.
    pub async fn connect(url: &str, headers: &BTreeMap<String, String>) -> EngineResult<Self> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| EngineError::Transport(format!("sse client build: {e}")))?;

        let mut builder = client.get(url).header("Accept", "text/event-stream");
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| classify_reqwest("sse connect", e))?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status("sse connect", status, &body));
        }

        let mut stream = resp.bytes_stream();
        let mut buffer = String::new();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        // The endpoint event must arrive before we can post anything.
        let endpoint = loop {
            let chunk = tokio::time::timeout(CONNECT_TIMEOUT, stream.next())
                .await
                .map_err(|_| EngineError::Transport("sse: no endpoint event".into()))?
                .ok_or_else(|| EngineError::BadResponse("sse stream closed during handshake".into()))?
                .map_err(|e| classify_reqwest("sse stream", e))?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            let mut found = None;
            for event in drain_sse_events(&mut buffer) {
                if event.event == "endpoint" {
                    found = Some(resolve_endpoint(url, event.data.trim())?);
                    break;
                }
            }
            if let Some(endpoint) = found {
                break endpoint;
            }
        };
        info!("[mcp] SSE endpoint: {}", endpoint);

        // ── Reader task: route responses to waiting callers ────────────
        let reader_handle = {
            let pending = pending.clone();
            tokio::spawn(async move {
                let mut buffer = buffer;
                while let Some(chunk) = stream.next().await {
                    let Ok(bytes) = chunk else {
                        warn!("[mcp] SSE stream error, closing");
                        break;
                    };
                    buffer.push_str(&String::from_utf8_lossy(&bytes));
                    for event in drain_sse_events(&mut buffer) {
                        if event.data.is_empty() {
                            continue;
                        }
                        match serde_json::from_str::<JsonRpcResponse>(&event.data) {
                            Ok(resp) => {
                                if let Some(id) = resp.id {
                                    let mut map = pending.lock().await;
                                    if let Some(tx) = map.remove(&id) {
                                        let _ = tx.send(resp);
                                    } else {
                                        debug!("[mcp] Response for unknown id={id}, ignoring");
                                    }
                                }
                                // Notifications (no id) are dropped; progress
                                // handling lives in the idle-timeout design.
                            }
                            Err(e) => debug!("[mcp] Non-JSON-RPC SSE data: {e}"),
                        }
                    }
                }
                debug!("[mcp] SSE reader exiting");
            })
        };

        Ok(SseTransport {
            client,
            endpoint,
            headers: headers.clone(),
            pending,
            reader_handle,
        })
    }

    pub async fn send_request(
        &self,
        request: JsonRpcRequest,
        idle_timeout: Duration,
    ) -> EngineResult<JsonRpcResponse> {
        let id = request.id;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json");
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        let resp = match builder.json(&request).send().await {
            Ok(resp) => resp,
            Err(e) => {
                self.pending.lock().await.remove(&id);
                return Err(classify_reqwest("sse post", e));
            }
        };
        if !resp.status().is_success() {
            self.pending.lock().await.remove(&id);
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status("sse post", status, &body));
        }

        match tokio::time::timeout(idle_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(EngineError::Transport("sse response channel dropped".into())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(EngineError::Transport(format!(
                    "mcp request {id} timed out after {}s",
                    idle_timeout.as_secs()
                )))
            }
        }
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> EngineResult<()> {
        let notif = serde_json::json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params.unwrap_or(serde_json::json!({})),
        });
        let mut builder = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/json");
        for (name, value) in &self.headers {
            builder = builder.header(name, value);
        }
        builder
            .json(&notif)
            .send()
            .await
            .map_err(|e| classify_reqwest("sse notification", e))?;
        Ok(())
    }

    pub fn is_alive(&self) -> bool {
        !self.reader_handle.is_finished()
    }

    pub fn shutdown(&self) {
        self.reader_handle.abort();
    }
}

impl Drop for SseTransport {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Resolve the endpoint event's payload (absolute or path-relative) against
/// the stream URL.
fn resolve_endpoint(base: &str, endpoint: &str) -> EngineResult<String> {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return Ok(endpoint.to_string());
    }
    let base_url = url::Url::parse(base)
        .map_err(|e| EngineError::BadResponse(format!("bad sse base url: {e}")))?;
    base_url
        .join(endpoint)
        .map(|u| u.to_string())
        .map_err(|e| EngineError::BadResponse(format!("bad endpoint event: {e}")))
}

// ═══════════════════════════════════════════════════════════════════════════
// Transport handle
// ═══════════════════════════════════════════════════════════════════════════

/// Uniform dispatch over the two transports.
#[derive(Debug)]
pub enum McpTransportHandle {
    StreamableHttp(StreamableHttpTransport),
    Sse(SseTransport),
}

impl McpTransportHandle {
    pub async fn send_request(
        &self,
        request: JsonRpcRequest,
        idle_timeout: Duration,
    ) -> EngineResult<JsonRpcResponse> {
        match self {
            McpTransportHandle::StreamableHttp(t) => t.send_request(request, idle_timeout).await,
            McpTransportHandle::Sse(t) => t.send_request(request, idle_timeout).await,
        }
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> EngineResult<()> {
        match self {
            McpTransportHandle::StreamableHttp(t) => t.send_notification(method, params).await,
            McpTransportHandle::Sse(t) => t.send_notification(method, params).await,
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            McpTransportHandle::StreamableHttp(t) => t.is_alive(),
            McpTransportHandle::Sse(t) => t.is_alive(),
        }
    }

    pub fn shutdown(&self) {
        if let McpTransportHandle::Sse(t) = self {
            t.shutdown();
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            McpTransportHandle::StreamableHttp(_) => "streamable_http",
            McpTransportHandle::Sse(_) => "sse",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drain_single_event() {
        let mut buffer = "event: endpoint\ndata: /messages?session=1\n\n".to_string();
        let events = drain_sse_events(&mut buffer);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "endpoint");
        assert_eq!(events[0].data, "/messages?session=1");
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_leaves_partial_event() {
        let mut buffer = "data: {\"jsonrpc\"".to_string();
        assert!(drain_sse_events(&mut buffer).is_empty());
        assert_eq!(buffer, "data: {\"jsonrpc\"");

        buffer.push_str(":\"2.0\",\"id\":1}\n\n");
        let events = drain_sse_events(&mut buffer);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event, "message");
        assert!(events[0].data.contains("\"id\":1"));
    }

    #[test]
    fn test_drain_multiple_events_and_multiline_data() {
        let mut buffer =
            "data: line1\ndata: line2\n\nevent: ping\ndata: {}\n\n".to_string();
        let events = drain_sse_events(&mut buffer);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "line1\nline2");
        assert_eq!(events[1].event, "ping");
    }

    #[test]
    fn test_resolve_endpoint_relative_and_absolute() {
        assert_eq!(
            resolve_endpoint("https://srv.example.com/sse", "/messages?sid=9").unwrap(),
            "https://srv.example.com/messages?sid=9"
        );
        assert_eq!(
            resolve_endpoint("https://srv.example.com/sse", "https://other.example.com/m").unwrap(),
            "https://other.example.com/m"
        );
        assert!(resolve_endpoint("not a url", "/x").is_err());
    }

    #[tokio::test]
    async fn test_streamable_http_unreachable() {
        let transport =
            StreamableHttpTransport::new("http://127.0.0.1:1/mcp", &BTreeMap::new()).unwrap();
        let err = transport
            .send_request(JsonRpcRequest::new(1, "initialize", None), Duration::from_millis(400))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ServiceDown(_) | EngineError::Transport(_)));
    }

    #[tokio::test]
    async fn test_sse_connect_unreachable() {
        let err = SseTransport::connect("http://127.0.0.1:1/sse", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ServiceDown(_) | EngineError::Transport(_)));
    }

    #[test]
    fn test_auth_status_classified() {
        let err = classify_status("mcp server", 401, "unauthorized");
        assert_eq!(err.category(), "auth");
        assert!(err.to_string().contains("auth_required"));
        let err = classify_status("mcp server", 503, "down");
        assert_eq!(err.category(), "service_down");
    }
}
