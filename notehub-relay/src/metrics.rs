//! Relay counters surfaced by `/stats`

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide relay counters. Plain atomics; `/stats` takes a snapshot.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    pub connections_opened: AtomicU64,
    pub connections_closed: AtomicU64,
    pub messages_in: AtomicU64,
    pub messages_out: AtomicU64,
    pub docs_loaded: AtomicU64,
    pub docs_saved: AtomicU64,
    pub save_errors: AtomicU64,
    pub errors: AtomicU64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub connections_opened: u64,
    pub connections_closed: u64,
    pub active_connections: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub docs_loaded: u64,
    pub docs_saved: u64,
    pub save_errors: u64,
    pub errors: u64,
}

impl RelayMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let opened = self.connections_opened.load(Ordering::Relaxed);
        let closed = self.connections_closed.load(Ordering::Relaxed);
        MetricsSnapshot {
            connections_opened: opened,
            connections_closed: closed,
            active_connections: opened.saturating_sub(closed),
            messages_in: self.messages_in.load(Ordering::Relaxed),
            messages_out: self.messages_out.load(Ordering::Relaxed),
            docs_loaded: self.docs_loaded.load(Ordering::Relaxed),
            docs_saved: self.docs_saved.load(Ordering::Relaxed),
            save_errors: self.save_errors.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_is_opened_minus_closed() {
        let metrics = RelayMetrics::default();
        for _ in 0..5 {
            RelayMetrics::incr(&metrics.connections_opened);
        }
        for _ in 0..2 {
            RelayMetrics::incr(&metrics.connections_closed);
        }
        assert_eq!(metrics.snapshot().active_connections, 3);
    }
}
