// ── Flow: Chat Stream Provider ─────────────────────────────────────────────
//
// The LLM endpoint is a black box: an OpenAI-compatible `/chat/completions`
// SSE stream. The orchestrator depends on the `ChatStreamProvider` trait so
// tests can script model output without a network.
//
// Transport errors before the stream starts are retried with backoff; the
// stream itself is unbounded (tool-using turns can run long).

use crate::atoms::error::{EngineError, EngineResult};
use crate::http_util::{is_retryable_status, parse_retry_after, retry_delay, CircuitBreaker, MAX_RETRIES};
use async_trait::async_trait;
use futures::StreamExt;
use log::{info, warn};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage { role: Role::System, content: content.into(), name: None }
    }

    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage { role: Role::User, content: content.into(), name: None }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage { role: Role::Assistant, content: content.into(), name: None }
    }

    pub fn tool(name: &str, content: impl Into<String>) -> Self {
        ChatMessage { role: Role::Tool, content: content.into(), name: Some(name.to_string()) }
    }
}

#[derive(Debug, Clone)]
pub struct ChatStreamRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
    pub stop: Vec<String>,
}

/// One streamed delta from the model.
#[derive(Debug, Clone, Default)]
pub struct StreamDelta {
    pub text: Option<String>,
    pub finish_reason: Option<String>,
}

/// Seam between the orchestrator and the model endpoint.
#[async_trait]
pub trait ChatStreamProvider: Send + Sync {
    /// Open a token stream. The receiver closes when the stream ends.
    async fn chat_stream(
        &self,
        request: ChatStreamRequest,
    ) -> EngineResult<mpsc::Receiver<StreamDelta>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// OpenAI-compatible implementation
// ═══════════════════════════════════════════════════════════════════════════

pub struct ChatClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
    breaker: CircuitBreaker,
}

impl ChatClient {
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        ChatClient {
            client: Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            breaker: CircuitBreaker::new(5, 60_000, 1),
        }
    }

    /// Parse a single SSE data line from an OpenAI-compatible stream.
    fn parse_sse_chunk(data: &str) -> Option<StreamDelta> {
        if data == "[DONE]" {
            return None;
        }
        let v: Value = serde_json::from_str(data).ok()?;
        let choice = v["choices"].get(0)?;
        Some(StreamDelta {
            text: choice["delta"]["content"].as_str().map(|s| s.to_string()),
            finish_reason: choice["finish_reason"].as_str().map(|s| s.to_string()),
        })
    }
}

#[async_trait]
impl ChatStreamProvider for ChatClient {
    async fn chat_stream(
        &self,
        request: ChatStreamRequest,
    ) -> EngineResult<mpsc::Receiver<StreamDelta>> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = json!({
            "model": request.model,
            "messages": request.messages,
            "stream": true,
        });
        if let Some(temp) = request.temperature {
            body["temperature"] = json!(temp);
        }
        if !request.stop.is_empty() {
            body["stop"] = json!(request.stop);
        }

        self.breaker.check().map_err(EngineError::ServiceDown)?;

        // Retry loop for transient errors before the stream opens.
        let mut retry_after: Option<u64> = None;
        let mut last_error = EngineError::ServiceDown("llm endpoint unreachable".into());

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = retry_delay(attempt - 1, retry_after.take()).await;
                warn!(
                    "[flow] LLM retry {}/{} after {}ms",
                    attempt,
                    MAX_RETRIES,
                    delay.as_millis()
                );
            }

            let mut builder = self
                .client
                .post(&url)
                .header("Content-Type", "application/json");
            if let Some(key) = &self.api_key {
                builder = builder.header("Authorization", format!("Bearer {key}"));
            }

            let response = match builder.json(&body).send().await {
                Ok(r) => r,
                Err(e) => {
                    self.breaker.record_failure();
                    last_error = if e.is_connect() {
                        EngineError::ServiceDown(format!("llm endpoint unreachable: {e}"))
                    } else {
                        EngineError::Transport(format!("llm request failed: {e}"))
                    };
                    continue;
                }
            };

            let status = response.status().as_u16();
            if !response.status().is_success() {
                retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                let body_text = response.text().await.unwrap_or_default();
                let brief: String = body_text.chars().take(200).collect();
                self.breaker.record_failure();

                if status == 401 || status == 403 {
                    return Err(EngineError::Auth(format!("llm endpoint {status}: {brief}")));
                }
                if is_retryable_status(status) {
                    last_error = EngineError::ServiceDown(format!("llm endpoint {status}: {brief}"));
                    continue;
                }
                return Err(EngineError::BadResponse(format!("llm endpoint {status}: {brief}")));
            }

            self.breaker.record_success();
            info!("[flow] LLM stream opened (model={})", request.model);

            // ── Stream task: SSE lines → deltas on the channel ─────────
            let (tx, rx) = mpsc::channel::<StreamDelta>(64);
            let mut byte_stream = response.bytes_stream();
            tokio::spawn(async move {
                let mut buffer = String::new();
                while let Some(result) = byte_stream.next().await {
                    let bytes = match result {
                        Ok(b) => b,
                        Err(e) => {
                            warn!("[flow] LLM stream read error: {e}");
                            break;
                        }
                    };
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    while let Some(line_end) = buffer.find('\n') {
                        let line = buffer[..line_end].trim().to_string();
                        buffer.drain(..line_end + 1);
                        if let Some(data) = line.strip_prefix("data: ") {
                            if data == "[DONE]" {
                                return;
                            }
                            if let Some(delta) = Self::parse_sse_chunk(data) {
                                if tx.send(delta).await.is_err() {
                                    return; // receiver dropped
                                }
                            }
                        }
                    }
                }
            });
            return Ok(rx);
        }

        Err(last_error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_chunk_delta() {
        let data = r#"{"choices":[{"delta":{"content":"Hello"},"finish_reason":null}]}"#;
        let delta = ChatClient::parse_sse_chunk(data).unwrap();
        assert_eq!(delta.text.as_deref(), Some("Hello"));
        assert!(delta.finish_reason.is_none());
    }

    #[test]
    fn test_parse_sse_chunk_finish() {
        let data = r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#;
        let delta = ChatClient::parse_sse_chunk(data).unwrap();
        assert!(delta.text.is_none());
        assert_eq!(delta.finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn test_parse_sse_chunk_done_and_garbage() {
        assert!(ChatClient::parse_sse_chunk("[DONE]").is_none());
        assert!(ChatClient::parse_sse_chunk("not json").is_none());
        assert!(ChatClient::parse_sse_chunk("{}").is_none());
    }

    #[test]
    fn test_message_constructors() {
        let msg = ChatMessage::tool("fetch", "result body");
        assert_eq!(msg.role, Role::Tool);
        assert_eq!(msg.name.as_deref(), Some("fetch"));

        let json = serde_json::to_value(&ChatMessage::user("hi")).unwrap();
        assert_eq!(json["role"], "user");
        assert!(json.get("name").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_errors() {
        let client = ChatClient::new("http://127.0.0.1:1/v1", None);
        let err = client
            .chat_stream(ChatStreamRequest {
                model: "test".into(),
                messages: vec![ChatMessage::user("hi")],
                temperature: None,
                stop: vec![],
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ServiceDown(_) | EngineError::Transport(_)));
    }
}
