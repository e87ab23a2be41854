// ── Zikaron Atoms: Error Types ─────────────────────────────────────────────
// Single canonical error enum for the engine core, built with `thiserror`.
//
// Design rules:
//   • Variants follow the engine's failure taxonomy: each one maps to a
//     distinct recovery policy (retry, degrade, fail fast, surface).
//   • The `#[from]` attribute wires std/external error conversions automatically.
//   • `EngineError` → `String` conversion is provided via `Display` so hook
//     boundaries (`Result<T, String>`) can call `.map_err(|e| e.to_string())`
//     without boilerplate.
//   • No variant carries secret material (API keys, tokens) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// Invalid or missing configuration: bad env var, vector dimension
    /// mismatch, rejected feature-flag combination. Blocks writes until fixed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Network-level failure: DNS, connection reset, request timeout.
    /// Retried with backoff inside the owning component.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Upstream service returned 5xx or refused the connection.
    /// Treated like transport, plus graceful-degradation fallback where defined.
    #[error("Service down: {0}")]
    ServiceDown(String),

    /// Upstream returned malformed JSON or an unexpected shape. Never retried.
    #[error("Bad response: {0}")]
    BadResponse(String),

    /// 401/403 from an upstream (typically an MCP server). Never retried;
    /// callers report `auth_required` with a remediation hint.
    #[error("Auth error: {0}")]
    Auth(String),

    /// Request-time input invalid. Rejected with a precise message.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Memory / conversation / node absent. Not an error at the scorer.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Abort signal fired or a deadline elapsed. Propagated; the retriever
    /// annotates `fallbacks_used += "timeout"`.
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Tool execution failure reported by an MCP server.
    #[error("Tool error: {tool}: {message}")]
    Tool { tool: String, message: String },

    /// Filesystem or OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization / deserialization failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP / network failure (reqwest layer).
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    /// SQLite / rusqlite document store failure.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Catch-all for errors that do not yet have a dedicated variant.
    /// Prefer adding a specific variant over using this in new code.
    #[error("{0}")]
    Other(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create a tool error with name and message.
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Tool { tool: tool.into(), message: message.into() }
    }

    /// Short machine-readable category, used by status surfaces and
    /// `last_error_category` fields.
    pub fn category(&self) -> &'static str {
        match self {
            EngineError::Config(_) => "configuration",
            EngineError::Transport(_) => "transport",
            EngineError::ServiceDown(_) => "service_down",
            EngineError::BadResponse(_) => "bad_response",
            EngineError::Auth(_) => "auth",
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::Cancelled(_) => "cancelled",
            EngineError::Tool { .. } => "tool",
            EngineError::Io(_) => "io",
            EngineError::Serialization(_) => "bad_response",
            EngineError::Network(e) => {
                if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "service_down"
                } else {
                    "transport"
                }
            }
            EngineError::Database(_) => "database",
            EngineError::Other(_) => "other",
        }
    }

    /// Whether the owning component may retry the operation.
    /// Bad responses, auth failures, and validation errors never retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::Transport(_) | EngineError::ServiceDown(_) | EngineError::Network(_)
        )
    }
}

// ── Migration bridge: String → EngineError ─────────────────────────────────
// Allows `?` on helpers still returning `Result<T, String>` inside functions
// that return `EngineResult<T>`.

impl From<String> for EngineError {
    fn from(s: String) -> Self {
        EngineError::Other(s)
    }
}

impl From<&str> for EngineError {
    fn from(s: &str) -> Self {
        EngineError::Other(s.to_string())
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations should return this type.
/// At hook boundaries, convert with `.map_err(|e| e.to_string())`.
pub type EngineResult<T> = Result<T, EngineError>;

// ── Conversion: EngineError → String ───────────────────────────────────────

impl From<EngineError> for String {
    fn from(e: EngineError) -> Self {
        e.to_string()
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────
