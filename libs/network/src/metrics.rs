//! Handler Metrics
//!
//! Lock-free counters updated on the send/receive paths, plus a per-category
//! error tally. Snapshots are cheap and safe to take from any thread.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters for one message handler
#[derive(Default)]
pub struct HandlerMetrics {
    sends_posted: AtomicU64,
    receives_posted: AtomicU64,
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    back_pressure: AtomicU64,
    cancelled: AtomicU64,
    errors: AtomicU64,

    /// Error counts keyed by `MessagingError::category`
    error_types: RwLock<HashMap<&'static str, u64>>,
}

/// Point-in-time copy of [`HandlerMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandlerMetricsSnapshot {
    pub sends_posted: u64,
    pub receives_posted: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Sends queued locally because the transport pushed back
    pub back_pressure: u64,
    pub cancelled: u64,
    pub errors: u64,
    pub error_types: HashMap<&'static str, u64>,
}

impl HandlerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_send_posted(&self) {
        self.sends_posted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_receive_posted(&self) {
        self.receives_posted.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_received(&self, bytes: usize) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_back_pressure(&self) {
        self.back_pressure.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_cancelled(&self) {
        self.cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an error under its category
    pub fn record_error(&self, category: &'static str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.error_types.write().entry(category).or_insert(0) += 1;
    }

    pub fn snapshot(&self) -> HandlerMetricsSnapshot {
        HandlerMetricsSnapshot {
            sends_posted: self.sends_posted.load(Ordering::Relaxed),
            receives_posted: self.receives_posted.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            back_pressure: self.back_pressure.load(Ordering::Relaxed),
            cancelled: self.cancelled.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            error_types: self.error_types.read().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let metrics = HandlerMetrics::new();
        metrics.record_send_posted();
        metrics.record_sent(10);
        metrics.record_sent(5);
        metrics.record_received(7);
        metrics.record_error("malformed_header");
        metrics.record_error("malformed_header");
        metrics.record_error("transport");

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sends_posted, 1);
        assert_eq!(snapshot.messages_sent, 2);
        assert_eq!(snapshot.bytes_sent, 15);
        assert_eq!(snapshot.bytes_received, 7);
        assert_eq!(snapshot.errors, 3);
        assert_eq!(snapshot.error_types.get("malformed_header"), Some(&2));
        assert_eq!(snapshot.error_types.get("transport"), Some(&1));
    }
}
