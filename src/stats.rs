//! Per-producer counters, exposed via `Producer::get_stats()`.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a producer's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStatsSnapshot {
    pub messages_sent: u64,
    pub bytes_sent: u64,
    pub send_failed: u64,
    pub acks_received: u64,
}

/// Atomic counters updated on the hot send/ack path.
///
/// These are maintained unconditionally — `stats_interval_seconds == 0`
/// only disables periodic reporting (spec.md §6), not the counters
/// themselves, so `get_stats()` is always accurate.
#[derive(Default)]
pub struct ProducerStats {
    messages_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_failed: AtomicU64,
    acks_received: AtomicU64,
}

impl ProducerStats {
    pub fn record_sent(&self, bytes: u64) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.send_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ack(&self) {
        self.acks_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProducerStatsSnapshot {
        ProducerStatsSnapshot {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            send_failed: self.send_failed.load(Ordering::Relaxed),
            acks_received: self.acks_received.load(Ordering::Relaxed),
        }
    }
}
