// ── MCP Client Pool ────────────────────────────────────────────────────────
//
// Bounded per-server pooling of connected MCP clients, keyed by
// `(url, sorted headers)`. Acquire prefers an idle entry, creates below
// the cap, and reaps entries idle past the timeout. Entries are never
// borrowed concurrently: `in_use` is flipped under the pool lock.
//
// `call_tool` wraps acquire → call → release with the per-call timeout
// policy (60s default, 5 min for the extended set) and marks the client
// invalid on transport-level failure so the next acquire reconnects.

use super::client::McpClient;
use super::types::McpServerConfig;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::AbortSignal;
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

/// Max concurrent connections per pool key.
const MAX_CONNECTIONS: usize = 5;

/// Entries idle longer than this are closed on the next acquire.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default per-call tool timeout.
const TOOL_TIMEOUT: Duration = Duration::from_secs(60);

/// Long-running tools get five minutes (substring match on the tool name).
const EXTENDED_TIMEOUT: Duration = Duration::from_secs(300);
const EXTENDED_TOOL_MARKERS: &[&str] =
    &["crawl", "scrape", "deep_research", "render", "browser", "download", "batch", "export"];

struct PoolEntry {
    client: Arc<McpClient>,
    in_use: bool,
    last_used: Instant,
    #[allow(dead_code)] // kept for pool diagnostics
    created_at: Instant,
}

/// A checked-out client. Hand it back with `release` (or `invalidate` after
/// a transport failure).
#[derive(Debug)]
pub struct PooledClient {
    pub client: Arc<McpClient>,
    key: String,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    pub pools: usize,
    pub total_entries: usize,
    pub in_use: usize,
}

#[derive(Default)]
pub struct McpClientPool {
    pools: Mutex<HashMap<String, Vec<PoolEntry>>>,
}

impl McpClientPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a client for a server: reuse an idle healthy entry, else
    /// connect a new one below the cap.
    pub async fn get_client(
        &self,
        server: &McpServerConfig,
        signal: Option<&AbortSignal>,
    ) -> EngineResult<PooledClient> {
        let key = server.pool_key();

        // Fast path under the lock: reap stale entries, claim an idle one.
        {
            let mut pools = self.pools.lock().await;
            let entries = pools.entry(key.clone()).or_default();

            entries.retain(|entry| {
                let stale = !entry.in_use && entry.last_used.elapsed() > IDLE_TIMEOUT;
                if stale {
                    info!("[mcp] Closing idle connection to '{}'", server.name);
                    entry.client.shutdown();
                }
                !stale
            });

            if let Some(entry) = entries
                .iter_mut()
                .find(|e| !e.in_use && e.client.is_alive())
            {
                entry.in_use = true;
                entry.last_used = Instant::now();
                return Ok(PooledClient { client: entry.client.clone(), key });
            }

            if entries.len() >= MAX_CONNECTIONS {
                return Err(EngineError::Transport(format!(
                    "pool for '{}' exhausted ({MAX_CONNECTIONS} connections in use)",
                    server.name
                )));
            }
        }

        // Connect outside the lock — handshakes are slow.
        let client = Arc::new(McpClient::connect(server.clone(), signal).await?);
        let mut pools = self.pools.lock().await;
        let entries = pools.entry(key.clone()).or_default();
        entries.push(PoolEntry {
            client: client.clone(),
            in_use: true,
            last_used: Instant::now(),
            created_at: Instant::now(),
        });
        Ok(PooledClient { client, key })
    }

    /// Return a client to the pool.
    pub async fn release_client(&self, pooled: PooledClient) {
        let mut pools = self.pools.lock().await;
        if let Some(entries) = pools.get_mut(&pooled.key) {
            if let Some(entry) = entries
                .iter_mut()
                .find(|e| Arc::ptr_eq(&e.client, &pooled.client))
            {
                entry.in_use = false;
                entry.last_used = Instant::now();
            }
        }
    }

    /// Drop a client whose transport misbehaved; the next acquire redials.
    pub async fn invalidate_client(&self, pooled: PooledClient) {
        let mut pools = self.pools.lock().await;
        if let Some(entries) = pools.get_mut(&pooled.key) {
            entries.retain(|e| {
                let matches = Arc::ptr_eq(&e.client, &pooled.client);
                if matches {
                    e.client.shutdown();
                }
                !matches
            });
        }
    }

    /// Close everything (shutdown path).
    pub async fn drain_pool(&self) {
        let mut pools = self.pools.lock().await;
        for (_, entries) in pools.drain() {
            for entry in entries {
                entry.client.shutdown();
            }
        }
        info!("[mcp] Pool drained");
    }

    pub async fn stats(&self) -> PoolStats {
        let pools = self.pools.lock().await;
        PoolStats {
            pools: pools.len(),
            total_entries: pools.values().map(|v| v.len()).sum(),
            in_use: pools
                .values()
                .flat_map(|v| v.iter())
                .filter(|e| e.in_use)
                .count(),
        }
    }

    /// Acquire → call → release, with the per-call timeout policy.
    /// Transport-level failures invalidate the pooled connection.
    pub async fn call_tool(
        &self,
        server: &McpServerConfig,
        tool_name: &str,
        arguments: serde_json::Value,
        timeout_ms: Option<u64>,
        signal: Option<&AbortSignal>,
    ) -> EngineResult<String> {
        if let Some(sig) = signal {
            if sig.is_aborted() {
                return Err(EngineError::Cancelled(format!("tool '{tool_name}' aborted")));
            }
        }

        let timeout = timeout_ms
            .map(Duration::from_millis)
            .or(server.timeout.map(Duration::from_millis))
            .unwrap_or_else(|| tool_timeout_for(tool_name));

        let pooled = self.get_client(server, signal).await?;
        let result = pooled.client.call_tool(tool_name, arguments, timeout).await;

        match &result {
            Err(e) if e.is_retryable() => {
                warn!(
                    "[mcp] Invalidating connection to '{}' after transport failure: {}",
                    server.name, e
                );
                self.invalidate_client(pooled).await;
            }
            _ => self.release_client(pooled).await,
        }
        result
    }
}

/// Per-call timeout: extended for tool names that imply long work.
pub fn tool_timeout_for(tool_name: &str) -> Duration {
    let lower = tool_name.to_lowercase();
    if EXTENDED_TOOL_MARKERS.iter().any(|m| lower.contains(m)) {
        EXTENDED_TIMEOUT
    } else {
        TOOL_TIMEOUT
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mcp::types::McpTransportKind;
    use std::collections::BTreeMap;

    fn server(url: &str) -> McpServerConfig {
        McpServerConfig {
            name: "srv".into(),
            transport: McpTransportKind::StreamableHttp,
            url: url.into(),
            command: None,
            args: vec![],
            env: HashMap::new(),
            headers: BTreeMap::new(),
            timeout: None,
            retries: None,
            retry_delay: None,
            capabilities: vec![],
            enabled: true,
        }
    }

    #[test]
    fn test_tool_timeout_policy() {
        assert_eq!(tool_timeout_for("fetch"), TOOL_TIMEOUT);
        assert_eq!(tool_timeout_for("web_crawl_site"), EXTENDED_TIMEOUT);
        assert_eq!(tool_timeout_for("Deep_Research"), EXTENDED_TIMEOUT);
        assert_eq!(tool_timeout_for("pdf_render"), EXTENDED_TIMEOUT);
        assert_eq!(tool_timeout_for("memory_search"), TOOL_TIMEOUT);
    }

    #[tokio::test]
    async fn test_get_client_unreachable_server() {
        let pool = McpClientPool::new();
        let err = pool.get_client(&server("http://127.0.0.1:1/mcp"), None).await.unwrap_err();
        assert!(matches!(err, EngineError::ServiceDown(_) | EngineError::Transport(_)));
        // Failed connects leave nothing behind.
        let stats = pool.stats().await;
        assert_eq!(stats.total_entries, 0);
    }

    #[tokio::test]
    async fn test_call_tool_honors_abort() {
        let pool = McpClientPool::new();
        let signal = AbortSignal::new();
        signal.abort();
        let err = pool
            .call_tool(&server("http://127.0.0.1:1/mcp"), "fetch", serde_json::json!({}), None, Some(&signal))
            .await
            .unwrap_err();
        assert_eq!(err.category(), "cancelled");
    }

    #[tokio::test]
    async fn test_server_timeout_override_wins() {
        // The config-level timeout overrides the name-based policy; verified
        // through the public call path erroring before any long wait.
        let mut cfg = server("http://127.0.0.1:1/mcp");
        cfg.timeout = Some(50);
        let pool = McpClientPool::new();
        let started = Instant::now();
        let _ = pool
            .call_tool(&cfg, "deep_research", serde_json::json!({}), None, None)
            .await;
        // Connection to a dead port fails fast regardless; the point is the
        // call completed without waiting for the 5-minute extended timeout.
        assert!(started.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_drain_empty_pool() {
        let pool = McpClientPool::new();
        pool.drain_pool().await;
        assert_eq!(pool.stats().await.pools, 0);
    }
}
