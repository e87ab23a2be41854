// ── MCP (Model Context Protocol) ───────────────────────────────────────────
// Client-side MCP: protocol types, URL transports (Streamable HTTP + SSE),
// a per-server client, and the bounded connection pool.

pub mod client;
pub mod pool;
pub mod transport;
pub mod types;

pub use client::McpClient;
pub use pool::{McpClientPool, PooledClient};
pub use types::{parse_servers_json, McpServerConfig, McpToolDef, McpTransportKind};
