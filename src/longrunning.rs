//! Heartbeat snapshots for long-running spans.
//!
//! Spans that stay open beyond the heartbeat interval get periodic snapshot
//! chunks so the backend can show liveness before the span finishes. The
//! tracked set is sharded by span id to keep lock contention away from the
//! span start/finish hot path.

use crate::context::SpanContext;
use crate::keys;
use crate::span::{Span, SpanFields, SpanInner};
use crate::trace::{Chunk, ChunkKind};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const SHARD_COUNT: usize = 32;
const MIN_HEARTBEAT: Duration = Duration::from_secs(20);
const MAX_HEARTBEAT: Duration = Duration::from_secs(450);
/// Spans older than this stop being tracked even if never finished.
const TRACKING_EXPIRATION: Duration = Duration::from_secs(12 * 60 * 60);

struct Tracked {
    span: Arc<SpanInner>,
    context: SpanContext,
}

/// Sharded registry of live spans eligible for heartbeats.
pub(crate) struct LongRunningTracker {
    shards: Vec<Mutex<HashMap<u64, Tracked>>>,
    heartbeat_ns: i64,
}

impl LongRunningTracker {
    pub(crate) fn new(heartbeat: Duration) -> Self {
        let heartbeat = heartbeat.clamp(MIN_HEARTBEAT, MAX_HEARTBEAT);
        LongRunningTracker {
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
            heartbeat_ns: heartbeat.as_nanos() as i64,
        }
    }

    pub(crate) fn heartbeat(&self) -> Duration {
        Duration::from_nanos(self.heartbeat_ns as u64)
    }

    fn shard(&self, span_id: u64) -> &Mutex<HashMap<u64, Tracked>> {
        &self.shards[(splitmix64(span_id) % SHARD_COUNT as u64) as usize]
    }

    pub(crate) fn track(&self, span: &Span) {
        let span_id = span.span_id();
        if span_id == 0 {
            return;
        }
        let mut shard = self.shard(span_id).lock().unwrap_or_else(|e| e.into_inner());
        shard.insert(
            span_id,
            Tracked {
                span: span.inner.clone(),
                context: span.context(),
            },
        );
    }

    pub(crate) fn untrack(&self, span_id: u64) {
        let mut shard = self.shard(span_id).lock().unwrap_or_else(|e| e.into_inner());
        shard.remove(&span_id);
    }

    #[cfg(test)]
    fn tracked_count(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap().len())
            .sum()
    }

    /// Walks every shard and emits one snapshot chunk per overdue span.
    /// Finished and expired spans fall out of tracking.
    pub(crate) fn tick(&self, now_ns: i64) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        for shard in &self.shards {
            let mut shard = shard.lock().unwrap_or_else(|e| e.into_inner());
            shard.retain(|_, tracked| {
                let (finished, start) = tracked.span.with_fields(|f| (f.finished, f.start));
                if finished || now_ns - start >= TRACKING_EXPIRATION.as_nanos() as i64 {
                    return false;
                }
                if now_ns - start >= self.heartbeat_ns {
                    chunks.push(self.snapshot_chunk(tracked, now_ns));
                }
                true
            });
        }
        chunks
    }

    /// Builds the heartbeat chunk: a copy of the live span with its running
    /// duration and the next partial version, plus any children that
    /// finished since the last flush.
    fn snapshot_chunk(&self, tracked: &Tracked, now_ns: i64) -> Chunk {
        let trace = tracked.context.trace();
        let version = trace.next_partial_version();

        let snapshot = tracked.span.with_fields(|f| {
            let mut metrics = f.metrics.clone();
            // Stats are computed from the finished span; a snapshot marked
            // top-level would double count.
            metrics.remove(keys::TOP_LEVEL);
            metrics.insert(keys::PARTIAL_VERSION.to_string(), version as f64);
            SpanFields {
                name: f.name.clone(),
                service: f.service.clone(),
                resource: f.resource.clone(),
                span_type: f.span_type.clone(),
                span_id: f.span_id,
                trace_id: f.trace_id,
                parent_id: f.parent_id,
                start: f.start,
                duration: now_ns - f.start,
                error: f.error,
                meta: f.meta.clone(),
                metrics,
                meta_struct: HashMap::new(),
                span_links: f.span_links.clone(),
                span_events: f.span_events.clone(),
                integration: f.integration.clone(),
                finished: true,
                buffered: false,
            }
        });
        let span_id = snapshot.span_id;
        let trace_id = snapshot.trace_id;

        let mut spans: Vec<Arc<SpanInner>> = vec![Arc::new(SpanInner::new(snapshot))];
        spans.extend(trace.take_finished_children(span_id));

        Chunk {
            spans,
            trace_id,
            origin: tracked.context.origin().to_string(),
            priority: trace.priority(),
            mechanism: trace.mechanism(),
            dropped: false,
            kind: ChunkKind::Heartbeat,
        }
    }
}

/// The 64-bit finalizer of splitmix64, used as the shard hash.
fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9e3779b97f4a7c15);
    x = (x ^ (x >> 30)).wrapping_mul(0xbf58476d1ce4e5b9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94d049bb133111eb);
    x ^ (x >> 31)
}
