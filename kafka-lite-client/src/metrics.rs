//! Metrics collection for the Kafka lite client

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters shared between a handle and its session task
#[derive(Debug, Default)]
pub struct ClientMetrics {
    // Producer metrics
    pub sends_requested: AtomicU64,
    pub sends_completed: AtomicU64,
    pub sends_dropped: AtomicU64,
    pub sends_cancelled: AtomicU64,

    // Consumer metrics
    pub messages_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub parse_errors: AtomicU64,
    pub broker_errors: AtomicU64,

    // Connection metrics
    pub connections_created: AtomicU64,
    pub connection_errors: AtomicU64,
}

impl ClientMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a send accepted into the send queue
    pub fn record_send_requested(&self) {
        self.sends_requested.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send written to the socket
    pub fn record_send_completed(&self) {
        self.sends_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a send evicted by queue overflow
    pub fn record_send_dropped(&self) {
        self.sends_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a queued send discarded by an explicit disconnect
    pub fn record_send_cancelled(&self) {
        self.sends_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a decoded message
    pub fn record_message(&self, byte_count: u64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(byte_count, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_broker_error(&self) {
        self.broker_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful connection
    pub fn record_connection_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection error
    pub fn record_connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get snapshot of current metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            sends_requested: self.sends_requested.load(Ordering::Relaxed),
            sends_completed: self.sends_completed.load(Ordering::Relaxed),
            sends_dropped: self.sends_dropped.load(Ordering::Relaxed),
            sends_cancelled: self.sends_cancelled.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            broker_errors: self.broker_errors.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of metrics at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub sends_requested: u64,
    pub sends_completed: u64,
    pub sends_dropped: u64,
    pub sends_cancelled: u64,
    pub messages_received: u64,
    pub bytes_received: u64,
    pub parse_errors: u64,
    pub broker_errors: u64,
    pub connections_created: u64,
    pub connection_errors: u64,
}

impl MetricsSnapshot {
    /// Sends that left the queue: written, evicted or cancelled
    pub fn total_processed(&self) -> u64 {
        self.sends_completed + self.sends_dropped + self.sends_cancelled
    }

    /// Sends still waiting in the queue
    pub fn sends_pending(&self) -> u64 {
        self.sends_requested.saturating_sub(self.total_processed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = ClientMetrics::new();
        for _ in 0..5 {
            metrics.record_send_requested();
        }
        metrics.record_send_completed();
        metrics.record_send_dropped();
        metrics.record_send_dropped();
        metrics.record_message(10);
        metrics.record_message(4);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.sends_requested, 5);
        assert_eq!(snapshot.total_processed(), 3);
        assert_eq!(snapshot.sends_pending(), 2);
        assert_eq!(snapshot.messages_received, 2);
        assert_eq!(snapshot.bytes_received, 14);

        metrics.record_send_cancelled();
        metrics.record_send_cancelled();
        assert_eq!(metrics.snapshot().sends_pending(), 0);
    }
}
