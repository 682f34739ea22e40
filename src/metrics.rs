use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

// ---------------------------------------------------------------------------
// Per-stream gauges
// ---------------------------------------------------------------------------

/// Publisher/subscriber gauges for one stream.
///
/// Relaxed atomics -- eventual consistency is fine for metrics, but the
/// callers guarantee exactly-once increment/decrement per session so the
/// values are exact at rest.
#[derive(Default)]
pub struct StreamGauges {
    publishers: AtomicI64,
    subscribers: AtomicI64,
}

impl StreamGauges {
    pub fn publishers(&self) -> i64 {
        self.publishers.load(Ordering::Relaxed)
    }

    pub fn subscribers(&self) -> i64 {
        self.subscribers.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// In-process metrics registry, scoped to the application state.
///
/// This is the contract a Prometheus exporter would scrape; emission itself
/// lives outside the core.
#[derive(Default)]
pub struct MetricsRegistry {
    streams: RwLock<HashMap<String, Arc<StreamGauges>>>,

    // Forwarding counters (process-wide totals).
    rtp_packets_forwarded: AtomicU64,
    rtp_packets_dropped: AtomicU64,
    rtcp_packets_processed: AtomicU64,
    signal_messages_routed: AtomicU64,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn gauges(&self, stream_id: &str) -> Arc<StreamGauges> {
        if let Some(g) = self.streams.read().unwrap().get(stream_id) {
            return g.clone();
        }
        let mut map = self.streams.write().unwrap();
        map.entry(stream_id.to_string())
            .or_insert_with(|| Arc::new(StreamGauges::default()))
            .clone()
    }

    pub fn inc_publishers(&self, stream_id: &str) {
        self.gauges(stream_id)
            .publishers
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_publishers(&self, stream_id: &str) {
        self.gauges(stream_id)
            .publishers
            .fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_subscribers(&self, stream_id: &str) {
        self.gauges(stream_id)
            .subscribers
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_subscribers(&self, stream_id: &str) {
        self.gauges(stream_id)
            .subscribers
            .fetch_sub(1, Ordering::Relaxed);
    }

    /// Current `(publishers, subscribers)` for a stream.
    pub fn stream_counts(&self, stream_id: &str) -> (i64, i64) {
        match self.streams.read().unwrap().get(stream_id) {
            Some(g) => (g.publishers(), g.subscribers()),
            None => (0, 0),
        }
    }

    /// Drop gauges for a stream that no longer exists.
    pub fn remove_stream(&self, stream_id: &str) {
        self.streams.write().unwrap().remove(stream_id);
    }

    pub fn inc_rtp_forwarded(&self) {
        self.rtp_packets_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rtp_dropped(&self) {
        self.rtp_packets_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rtcp_processed(&self) {
        self.rtcp_packets_processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_signal_routed(&self) {
        self.signal_messages_routed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn totals(&self) -> Totals {
        Totals {
            rtp_packets_forwarded: self.rtp_packets_forwarded.load(Ordering::Relaxed),
            rtp_packets_dropped: self.rtp_packets_dropped.load(Ordering::Relaxed),
            rtcp_packets_processed: self.rtcp_packets_processed.load(Ordering::Relaxed),
            signal_messages_routed: self.signal_messages_routed.load(Ordering::Relaxed),
        }
    }
}

/// Process-wide counter snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub rtp_packets_forwarded: u64,
    pub rtp_packets_dropped: u64,
    pub rtcp_packets_processed: u64,
    pub signal_messages_routed: u64,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
