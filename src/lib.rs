// Zikaron — memory engine and MCP tool-orchestration core for a desktop
// AI assistant.
//
// The crate is the engine only: the UI, router, and auth live in the host
// application. Initialization order matters and is the host's contract:
//   config → document store → vector index (schema probe) → embedding
//   client → facade → background schedulers.
//
// Module map:
//   atoms          — error taxonomy + domain types
//   config         — env-driven configuration and feature-flag validation
//   http_util      — retry/backoff + circuit breaker shared by all clients
//   memory         — the memory engine (store, retrieval, scoring, KG, …)
//   mcp            — MCP protocol, transports, client, connection pool
//   flow           — model streaming, tool-call interception, turn orchestration
//   hooks          — typed inbound surface the host router maps onto HTTP
//   observability  — sampled logging, rolling metrics, health probes

pub mod atoms;
pub mod config;
pub mod flow;
pub mod hooks;
pub mod http_util;
pub mod mcp;
pub mod memory;
pub mod observability;

pub use atoms::error::{EngineError, EngineResult};
pub use config::EngineConfig;
pub use memory::facade::MemoryFacade;
