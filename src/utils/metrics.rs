//! Observability and Metrics
//!
//! Atomic counters for the listener and the query responder. One
//! [`Metrics`] instance is shared by everything a coordinator starts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Metrics collector for ICP operations
#[derive(Debug)]
pub struct Metrics {
    /// Datagrams read off the socket
    pub datagrams_received: AtomicU64,
    /// Bytes read off the socket
    pub bytes_received: AtomicU64,
    /// Datagrams written to the socket
    pub datagrams_sent: AtomicU64,
    /// Bytes written to the socket
    pub bytes_sent: AtomicU64,
    /// Datagrams dropped as malformed
    pub decode_errors: AtomicU64,
    /// Handler calls that failed or panicked
    pub handler_failures: AtomicU64,
    /// Queries answered or dropped by the responder
    pub queries: AtomicU64,
    pub hits: AtomicU64,
    pub misses: AtomicU64,
    pub denied: AtomicU64,
    /// Queries answered with ICP_OP_ERR
    pub errors: AtomicU64,
    /// Queries dropped by the rate limiter
    pub rate_limited: AtomicU64,
    /// Queries dropped because no response could be built or sent
    pub dropped: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            datagrams_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            datagrams_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            decode_errors: AtomicU64::new(0),
            handler_failures: AtomicU64::new(0),
            queries: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            denied: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            rate_limited: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn datagram_received(&self, byte_count: u64) {
        self.datagrams_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn datagram_sent(&self, byte_count: u64) {
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn decode_error(&self) {
        self.decode_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn query(&self) {
        self.queries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn deny(&self) {
        self.denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn error_response(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn rate_limit(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    pub fn drop_query(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            denied: self.denied.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            datagrams_received = snapshot.datagrams_received,
            datagrams_sent = snapshot.datagrams_sent,
            decode_errors = snapshot.decode_errors,
            handler_failures = snapshot.handler_failures,
            queries = snapshot.queries,
            hits = snapshot.hits,
            misses = snapshot.misses,
            denied = snapshot.denied,
            errors = snapshot.errors,
            rate_limited = snapshot.rate_limited,
            dropped = snapshot.dropped,
            uptime_seconds = snapshot.uptime_seconds,
            "ICP metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub datagrams_received: u64,
    pub bytes_received: u64,
    pub datagrams_sent: u64,
    pub bytes_sent: u64,
    pub decode_errors: u64,
    pub handler_failures: u64,
    pub queries: u64,
    pub hits: u64,
    pub misses: u64,
    pub denied: u64,
    pub errors: u64,
    pub rate_limited: u64,
    pub dropped: u64,
    pub uptime_seconds: u64,
}
