//! Per-endpoint traffic counters.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct EndpointStats {
    messages_sent: AtomicU64,
    messages_delivered: AtomicU64,
    control_received: AtomicU64,
    parcels_resent: AtomicU64,
    acks_sent: AtomicU64,
    parcels_rejected: AtomicU64,
    send_failures: AtomicU64,
}

/// Point-in-time copy of the counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub control_received: u64,
    pub parcels_resent: u64,
    pub acks_sent: u64,
    pub parcels_rejected: u64,
    pub send_failures: u64,
}

impl EndpointStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn message_sent(&self, resent: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.parcels_resent
            .fetch_add(resent as u64, Ordering::Relaxed);
    }

    pub fn message_delivered(&self) {
        self.messages_delivered.fetch_add(1, Ordering::Relaxed);
    }

    pub fn control_received(&self) {
        self.control_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn ack_sent(&self) {
        self.acks_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn parcel_rejected(&self) {
        self.parcels_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failed(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            control_received: self.control_received.load(Ordering::Relaxed),
            parcels_resent: self.parcels_resent.load(Ordering::Relaxed),
            acks_sent: self.acks_sent.load(Ordering::Relaxed),
            parcels_rejected: self.parcels_rejected.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
        }
    }

    /// Log the counters, skipping idle endpoints.
    pub fn print_stats(&self) {
        let s = self.snapshot();
        if s == StatsSnapshot::default() {
            return;
        }
        tracing::info!(
            sent = s.messages_sent,
            delivered = s.messages_delivered,
            control = s.control_received,
            resent = s.parcels_resent,
            acks = s.acks_sent,
            rejected = s.parcels_rejected,
            failures = s.send_failures,
            "endpoint stats"
        );
    }
}
