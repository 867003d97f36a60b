//! Stream Metrics Collector
//!
//! Per-stream counters using DashMap for lock-free concurrent access.

use crate::domain::entities::StreamMetrics;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters for a single stream.
#[derive(Debug, Default)]
struct StreamCounters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
    backpressure_events: AtomicU64,
    dropped_messages: AtomicU64,
}

impl StreamCounters {
    fn snapshot(&self) -> StreamMetrics {
        StreamMetrics {
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            backpressure_events: self.backpressure_events.load(Ordering::Relaxed),
            dropped_messages: self.dropped_messages.load(Ordering::Relaxed),
        }
    }
}

/// Collector of per-stream metrics.
///
/// Entries are created lazily on the first record for an id and are never
/// evicted automatically; callers that want to bound memory snapshot and
/// then [`remove`](Self::remove).
#[derive(Debug, Default)]
pub struct StreamMetricsCollector {
    streams: DashMap<String, StreamCounters>,
}

impl StreamMetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_counters(&self, stream_id: &str, f: impl FnOnce(&StreamCounters)) {
        if let Some(c) = self.streams.get(stream_id) {
            f(c.value());
            return;
        }
        let entry = self.streams.entry(stream_id.to_string()).or_default();
        f(entry.value());
    }

    pub fn record_sent(&self, stream_id: &str, bytes: usize) {
        self.with_counters(stream_id, |c| {
            c.messages_sent.fetch_add(1, Ordering::Relaxed);
            c.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        });
    }

    pub fn record_received(&self, stream_id: &str, bytes: usize) {
        self.with_counters(stream_id, |c| {
            c.messages_received.fetch_add(1, Ordering::Relaxed);
            c.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        });
    }

    pub fn record_error(&self, stream_id: &str) {
        self.with_counters(stream_id, |c| {
            c.errors.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_backpressure(&self, stream_id: &str) {
        self.with_counters(stream_id, |c| {
            c.backpressure_events.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn record_dropped(&self, stream_id: &str) {
        self.with_counters(stream_id, |c| {
            c.dropped_messages.fetch_add(1, Ordering::Relaxed);
        });
    }

    pub fn get(&self, stream_id: &str) -> Option<StreamMetrics> {
        self.streams.get(stream_id).map(|c| c.snapshot())
    }

    pub fn get_all(&self) -> HashMap<String, StreamMetrics> {
        self.streams
            .iter()
            .map(|e| (e.key().clone(), e.snapshot()))
            .collect()
    }

    /// Forget a stream, returning its final counters.
    pub fn remove(&self, stream_id: &str) -> Option<StreamMetrics> {
        self.streams.remove(stream_id).map(|(_, c)| c.snapshot())
    }

    pub fn len(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }
}
