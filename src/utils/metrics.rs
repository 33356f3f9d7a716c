//! Observability and Metrics
//!
//! Counters for the dispatch path. Owned by the dispatch context rather than
//! a global, so every dispatcher (and every test) counts on its own.
//!
//! Uses atomic counters so a snapshot can be taken from another thread while
//! the dispatch thread keeps counting.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

/// Metrics collector for dispatch operations
#[derive(Debug)]
pub struct Metrics {
    /// Packets handed to the dispatcher
    pub packets_received: AtomicU64,
    /// Bytes handed to the dispatcher
    pub bytes_received: AtomicU64,
    /// Packets dropped without a reply
    pub packets_discarded: AtomicU64,
    /// Packets sent
    pub packets_sent: AtomicU64,
    /// Bytes sent
    pub bytes_sent: AtomicU64,
    /// Sends the transport did not complete
    pub send_failures: AtomicU64,
    /// ABORT chunks sent
    pub aborts_sent: AtomicU64,
    /// INIT-ACK chunks sent
    pub init_acks_sent: AtomicU64,
    /// Cookies that passed authentication
    pub cookies_accepted: AtomicU64,
    /// Cookies that failed authentication or were stale
    pub cookies_rejected: AtomicU64,
    /// Associations that reached the established state
    pub associations_established: AtomicU64,
    /// Associations torn down
    pub associations_lost: AtomicU64,
    /// Internal consistency failures
    pub invariant_violations: AtomicU64,
    /// Start time for uptime calculation
    start_time: Instant,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_discarded: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            aborts_sent: AtomicU64::new(0),
            init_acks_sent: AtomicU64::new(0),
            cookies_accepted: AtomicU64::new(0),
            cookies_rejected: AtomicU64::new(0),
            associations_established: AtomicU64::new(0),
            associations_lost: AtomicU64::new(0),
            invariant_violations: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn packet_received(&self, byte_count: u64) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn packet_discarded(&self) {
        self.packets_discarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of one send
    pub fn packet_sent(&self, byte_count: u64, delivered: bool) {
        if delivered {
            self.packets_sent.fetch_add(1, Ordering::Relaxed);
            self.bytes_sent.fetch_add(byte_count, Ordering::Relaxed);
        } else {
            self.send_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn abort_sent(&self) {
        self.aborts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn init_ack_sent(&self) {
        self.init_acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cookie_accepted(&self) {
        self.cookies_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn cookie_rejected(&self) {
        self.cookies_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn association_established(&self) {
        self.associations_established.fetch_add(1, Ordering::Relaxed);
    }

    pub fn association_lost(&self) {
        self.associations_lost.fetch_add(1, Ordering::Relaxed);
    }

    pub fn invariant_violation(&self) {
        self.invariant_violations.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_discarded: self.packets_discarded.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            aborts_sent: self.aborts_sent.load(Ordering::Relaxed),
            init_acks_sent: self.init_acks_sent.load(Ordering::Relaxed),
            cookies_accepted: self.cookies_accepted.load(Ordering::Relaxed),
            cookies_rejected: self.cookies_rejected.load(Ordering::Relaxed),
            associations_established: self.associations_established.load(Ordering::Relaxed),
            associations_lost: self.associations_lost.load(Ordering::Relaxed),
            invariant_violations: self.invariant_violations.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current metrics
    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            packets_received = snapshot.packets_received,
            bytes_received = snapshot.bytes_received,
            packets_discarded = snapshot.packets_discarded,
            packets_sent = snapshot.packets_sent,
            bytes_sent = snapshot.bytes_sent,
            send_failures = snapshot.send_failures,
            aborts_sent = snapshot.aborts_sent,
            init_acks_sent = snapshot.init_acks_sent,
            cookies_accepted = snapshot.cookies_accepted,
            cookies_rejected = snapshot.cookies_rejected,
            associations_established = snapshot.associations_established,
            associations_lost = snapshot.associations_lost,
            invariant_violations = snapshot.invariant_violations,
            uptime_seconds = snapshot.uptime_seconds,
            "Dispatch metrics snapshot"
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
    pub packets_received: u64,
    pub bytes_received: u64,
    pub packets_discarded: u64,
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub aborts_sent: u64,
    pub init_acks_sent: u64,
    pub cookies_accepted: u64,
    pub cookies_rejected: u64,
    pub associations_established: u64,
    pub associations_lost: u64,
    pub invariant_violations: u64,
    pub uptime_seconds: u64,
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    /// Start timing an operation
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        let duration = self.start.elapsed();
        debug!(
            operation = self.operation,
            duration_us = duration.as_micros() as u64,
            "Operation completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let m = Metrics::new();
        m.packet_received(100);
        m.packet_received(20);
        m.packet_sent(64, true);
        m.packet_sent(64, false);
        m.abort_sent();
        let s = m.snapshot();
        assert_eq!(s.packets_received, 2);
        assert_eq!(s.bytes_received, 120);
        assert_eq!(s.packets_sent, 1);
        assert_eq!(s.bytes_sent, 64);
        assert_eq!(s.send_failures, 1);
        assert_eq!(s.aborts_sent, 1);
    }
}
