// ── Zikaron Engine: HTTP Retry & Circuit Breaker ───────────────────────────
//
// Shared failure-isolation utilities used by every outbound client
// (embedding, reranker, vector index, MCP servers, LLM endpoint).
//
// Features:
//   • Exponential backoff with ±25% jitter (base 500ms, max 30s)
//   • Retry on 429 (rate limit), 500, 502, 503, 504, 529
//   • Respects `Retry-After` header (integer seconds)
//   • Circuit breaker: N consecutive failures → fail fast for a cooldown,
//     then a single half-open probe; M consecutive successes close it

use log::warn;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

// ── Constants ──────────────────────────────────────────────────────────────

/// Default maximum number of retry attempts per request.
pub const MAX_RETRIES: u32 = 3;

/// Initial retry delay in milliseconds (doubles each attempt).
const INITIAL_RETRY_DELAY_MS: u64 = 500;

/// Maximum retry delay cap in milliseconds.
const MAX_RETRY_DELAY_MS: u64 = 30_000;

// ── Retryable status detection ─────────────────────────────────────────────

/// Check if an HTTP status code represents a transient/retryable error.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504 | 529)
}

// ── Backoff delay ──────────────────────────────────────────────────────────

/// Sleep with exponential backoff + ±25% jitter.
/// Respects a server-specified Retry-After when present.
/// Returns the actual delay duration for logging.
pub async fn retry_delay(attempt: u32, retry_after_secs: Option<u64>) -> Duration {
    let base_ms = INITIAL_RETRY_DELAY_MS * 2u64.pow(attempt.min(8));
    let capped_ms = base_ms.min(MAX_RETRY_DELAY_MS);
    let delay_ms = if let Some(secs) = retry_after_secs {
        (secs.min(60) * 1000).max(capped_ms)
    } else {
        capped_ms
    };
    let delay = Duration::from_millis(apply_jitter(delay_ms));
    tokio::time::sleep(delay).await;
    delay
}

/// Apply ±25% jitter to prevent thundering-herd effects.
fn apply_jitter(base_ms: u64) -> u64 {
    let jitter_range = (base_ms / 4) as i64;
    if jitter_range == 0 {
        return base_ms.max(50);
    }
    let offset = (clock_jitter() % (2 * jitter_range + 1)) - jitter_range;
    (base_ms as i64 + offset).max(50) as u64
}

/// Jitter source from the system clock nanos (no extra crate needed).
fn clock_jitter() -> i64 {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    (nanos % 1000) as i64
}

/// Parse Retry-After header value (integer seconds only).
/// HTTP-date format is not implemented — falls back to computed backoff.
pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    header_value.trim().parse::<u64>().ok()
}

// ── Circuit Breaker ────────────────────────────────────────────────────────

/// Snapshot of a breaker's state for status surfaces.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerStatus {
    pub circuit_open: bool,
    pub failures: u32,
    pub half_open: bool,
    /// Seconds remaining in the cooldown while open (0 when closed).
    pub cooldown_remaining_secs: u64,
}

/// A circuit breaker that trips after N consecutive failures, rejects
/// requests for a cooldown period, then allows a single half-open probe.
/// M consecutive probe successes close it again.
///
/// States:
///   Closed   — normal operation, requests pass through
///   Open     — rejecting requests (cooldown active)
///   HalfOpen — cooldown expired, one probe in flight at a time
pub struct CircuitBreaker {
    /// Number of consecutive failures.
    consecutive_failures: AtomicU32,
    /// Consecutive successes observed while half-open.
    probe_successes: AtomicU32,
    /// Timestamp (epoch millis) when the circuit was tripped open.
    tripped_at_ms: AtomicU64,
    /// Number of consecutive failures before tripping.
    failure_threshold: u32,
    /// How long the circuit stays open before a probe is allowed (ms).
    open_duration_ms: u64,
    /// Consecutive successes needed to close from half-open.
    success_threshold: u32,
}

impl CircuitBreaker {
    /// Defaults match the embedding client contract: trip after 3 failures,
    /// stay open 30s, close after 1 good probe.
    pub const fn new(failure_threshold: u32, open_duration_ms: u64, success_threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            probe_successes: AtomicU32::new(0),
            tripped_at_ms: AtomicU64::new(0),
            failure_threshold,
            open_duration_ms,
            success_threshold,
        }
    }

    fn now_ms() -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }

    /// Whether the circuit currently rejects requests without probing.
    pub fn is_open(&self) -> bool {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        if failures < self.failure_threshold {
            return false;
        }
        let tripped = self.tripped_at_ms.load(Ordering::Relaxed);
        Self::now_ms().saturating_sub(tripped) < self.open_duration_ms
    }

    /// Whether the breaker is past its cooldown and awaiting a probe.
    pub fn is_half_open(&self) -> bool {
        let failures = self.consecutive_failures.load(Ordering::Relaxed);
        failures >= self.failure_threshold && !self.is_open()
    }

    /// Check if a request should be allowed through.
    /// Returns `Ok(())` if allowed, `Err(message)` if the circuit is open.
    pub fn check(&self) -> Result<(), String> {
        if self.is_open() {
            let tripped = self.tripped_at_ms.load(Ordering::Relaxed);
            let remaining =
                (self.open_duration_ms.saturating_sub(Self::now_ms().saturating_sub(tripped))) / 1000;
            Err(format!(
                "Circuit breaker open: {} consecutive failures, cooling down for {}s",
                self.consecutive_failures.load(Ordering::Relaxed),
                remaining.max(1)
            ))
        } else {
            Ok(())
        }
    }

    /// Record a successful request. While half-open, counts toward the
    /// success threshold; once reached, the breaker closes fully.
    pub fn record_success(&self) {
        if self.is_half_open() {
            let probes = self.probe_successes.fetch_add(1, Ordering::Relaxed) + 1;
            if probes >= self.success_threshold {
                self.consecutive_failures.store(0, Ordering::Relaxed);
                self.probe_successes.store(0, Ordering::Relaxed);
                self.tripped_at_ms.store(0, Ordering::Relaxed);
            }
        } else {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            self.probe_successes.store(0, Ordering::Relaxed);
        }
    }

    /// Record a failed request. On reaching the threshold (or failing a
    /// half-open probe) the circuit (re)opens.
    pub fn record_failure(&self) {
        self.probe_successes.store(0, Ordering::Relaxed);
        let prev = self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if prev + 1 >= self.failure_threshold {
            self.tripped_at_ms.store(Self::now_ms(), Ordering::Relaxed);
            warn!(
                "[circuit-breaker] Tripped after {} consecutive failures — cooling down {}ms",
                prev + 1,
                self.open_duration_ms
            );
        }
    }

    /// Force-close the circuit (operator action).
    pub fn reset(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        self.probe_successes.store(0, Ordering::Relaxed);
        self.tripped_at_ms.store(0, Ordering::Relaxed);
    }

    pub fn status(&self) -> BreakerStatus {
        let open = self.is_open();
        let tripped = self.tripped_at_ms.load(Ordering::Relaxed);
        let remaining = if open {
            (self.open_duration_ms.saturating_sub(Self::now_ms().saturating_sub(tripped))) / 1000
        } else {
            0
        };
        BreakerStatus {
            circuit_open: open,
            failures: self.consecutive_failures.load(Ordering::Relaxed),
            half_open: self.is_half_open(),
            cooldown_remaining_secs: remaining,
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(529));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("30"), Some(30));
        assert_eq!(parse_retry_after(" 5 "), Some(5));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015"), None);
    }

    #[test]
    fn test_breaker_trips_after_threshold() {
        let cb = CircuitBreaker::new(3, 30_000, 1);
        assert!(cb.check().is_ok());
        cb.record_failure();
        cb.record_failure();
        assert!(cb.check().is_ok(), "two failures should not trip");
        cb.record_failure();
        assert!(cb.check().is_err(), "three failures should trip");
        assert!(cb.is_open());
    }

    #[test]
    fn test_breaker_success_resets_closed() {
        let cb = CircuitBreaker::new(3, 30_000, 1);
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        assert!(cb.check().is_ok(), "counter should reset on success");
    }

    #[test]
    fn test_breaker_half_open_probe_closes() {
        // Zero cooldown: the breaker goes half-open immediately after tripping.
        let cb = CircuitBreaker::new(1, 0, 2);
        cb.record_failure();
        assert!(cb.is_half_open());
        assert!(cb.check().is_ok(), "half-open allows a probe");
        cb.record_success();
        assert!(cb.is_half_open(), "one probe success of two required");
        cb.record_success();
        assert!(!cb.is_half_open());
        assert_eq!(cb.status().failures, 0);
    }

    #[test]
    fn test_breaker_probe_failure_reopens() {
        let cb = CircuitBreaker::new(1, 0, 1);
        cb.record_failure();
        assert!(cb.is_half_open());
        cb.record_failure();
        // Re-tripped; with zero cooldown it is immediately half-open again,
        // but the failure count kept growing.
        assert!(cb.status().failures >= 2);
    }

    #[test]
    fn test_breaker_reset() {
        let cb = CircuitBreaker::new(1, 60_000, 1);
        cb.record_failure();
        assert!(cb.is_open());
        cb.reset();
        assert!(!cb.is_open());
        assert!(cb.check().is_ok());
    }

    #[test]
    fn test_status_snapshot() {
        let cb = CircuitBreaker::new(2, 60_000, 1);
        cb.record_failure();
        let s = cb.status();
        assert!(!s.circuit_open);
        assert_eq!(s.failures, 1);
        cb.record_failure();
        let s = cb.status();
        assert!(s.circuit_open);
        assert!(s.cooldown_remaining_secs > 0);
    }
}
