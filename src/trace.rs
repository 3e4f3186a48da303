//! The trace aggregate: every span sharing one trace id.
//!
//! A `Trace` owns its spans. Each finished span bumps a counter and when the
//! count reaches the number of buffered spans the whole list is drained for
//! submission. Oversized traces are marked full and stop buffering; large
//! still-running traces can be partially flushed, draining only the spans
//! that already finished.

use crate::ids::TraceId;
use crate::keys;
use crate::sampling;
use crate::span::SpanInner;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// What the tracer should do after a span of this trace finished.
pub(crate) enum FinishAction {
    /// Nothing yet; the trace is still running.
    None,
    /// Every buffered span finished; submit them all.
    Flush(Vec<Arc<SpanInner>>),
    /// Partial flush: submit the drained finished spans, the rest continue.
    Partial(Vec<Arc<SpanInner>>),
}

/// Buffering failed because the trace reached its configured size limit.
#[derive(Debug, thiserror::Error)]
#[error("trace buffer full ({len} spans)")]
pub(crate) struct TraceFull {
    pub len: usize,
}

#[derive(Debug, Default)]
struct TraceInner {
    spans: Vec<Arc<SpanInner>>,
    finished: usize,
    full: bool,
    priority: Option<f64>,
    locked: bool,
    mechanism: Option<u32>,
    propagating_tags: HashMap<String, String>,
    tags: HashMap<String, String>,
    root: Option<Arc<SpanInner>>,
    partial_version: u32,
}

/// Shared handle to the mutable trace state.
#[derive(Clone, Debug, Default)]
pub(crate) struct Trace {
    inner: Arc<Mutex<TraceInner>>,
}

impl Trace {
    pub(crate) fn new() -> Trace {
        Trace::default()
    }

    /// Buffers a span. The first pushed span becomes the trace root.
    pub(crate) fn push(&self, span: Arc<SpanInner>, max_size: usize) -> Result<(), TraceFull> {
        let mut t = self.lock();
        if t.full {
            return Err(TraceFull { len: t.spans.len() });
        }
        if t.spans.len() >= max_size {
            t.full = true;
            return Err(TraceFull { len: t.spans.len() });
        }
        if t.root.is_none() {
            t.root = Some(span.clone());
        }
        t.spans.push(span);
        Ok(())
    }

    pub(crate) fn root(&self) -> Option<Arc<SpanInner>> {
        self.lock().root.clone()
    }

    pub(crate) fn priority(&self) -> Option<i32> {
        self.lock().priority.map(|p| p as i32)
    }

    pub(crate) fn mechanism(&self) -> Option<u32> {
        self.lock().mechanism
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.lock().locked
    }

    /// Writes the sampling priority unless a previous decision was locked.
    /// A kept decision records its mechanism in the decision-maker
    /// propagating tag; a drop clears it. Returns whether the write applied.
    pub(crate) fn set_sampling_priority(
        &self,
        priority: f64,
        mechanism: Option<u32>,
        lock: bool,
    ) -> bool {
        let mut t = self.lock();
        if t.locked {
            return false;
        }
        t.priority = Some(priority);
        t.mechanism = mechanism;
        if lock {
            t.locked = true;
        }
        if priority > 0.0 {
            if let Some(mechanism) = mechanism {
                t.propagating_tags.insert(
                    keys::DECISION_MAKER.to_string(),
                    sampling::decision_maker(mechanism),
                );
            }
        } else {
            t.propagating_tags.remove(keys::DECISION_MAKER);
        }
        true
    }

    pub(crate) fn set_propagating_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lock().propagating_tags.insert(key.into(), value.into());
    }

    pub(crate) fn propagating_tag(&self, key: &str) -> Option<String> {
        self.lock().propagating_tags.get(key).cloned()
    }

    pub(crate) fn propagating_tags(&self) -> HashMap<String, String> {
        self.lock().propagating_tags.clone()
    }

    /// Sets a trace-level tag, stamped onto the chunk's first span at
    /// submission time.
    pub(crate) fn set_tag(&self, key: impl Into<String>, value: impl Into<String>) {
        self.lock().tags.insert(key.into(), value.into());
    }

    pub(crate) fn tags(&self) -> HashMap<String, String> {
        self.lock().tags.clone()
    }

    /// Records one finished span and decides whether anything is ready for
    /// submission. Partial flushing drains finished spans once at least
    /// `partial_min` of them accumulated, stamping each drained span with a
    /// monotonically increasing partial version.
    pub(crate) fn finished_one(
        &self,
        partial_enabled: bool,
        partial_min: usize,
    ) -> FinishAction {
        let mut t = self.lock();
        t.finished += 1;

        if t.finished >= t.spans.len() {
            t.finished = 0;
            return FinishAction::Flush(std::mem::take(&mut t.spans));
        }

        if partial_enabled && t.finished >= partial_min {
            let (done, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut t.spans)
                .into_iter()
                .partition(|span| span.with_fields(|f| f.finished));
            if done.len() >= partial_min {
                t.spans = rest;
                t.finished = 0;
                t.partial_version += 1;
                let version = t.partial_version;
                for span in &done {
                    span.with_fields_mut(|f| {
                        f.metrics
                            .insert(keys::PARTIAL_VERSION.to_string(), version as f64);
                    });
                }
                return FinishAction::Partial(done);
            }
            t.spans = done;
            t.spans.extend(rest);
        }
        FinishAction::None
    }

    /// Bumps and returns the partial version counter, used by heartbeat
    /// snapshots of long-running spans.
    pub(crate) fn next_partial_version(&self) -> u32 {
        let mut t = self.lock();
        t.partial_version += 1;
        t.partial_version
    }

    /// Removes and returns the finished spans of this trace, excluding the
    /// given span id. Used by the long-running tracker to ship completed
    /// children alongside a heartbeat snapshot without re-submitting them.
    pub(crate) fn take_finished_children(&self, exclude_span_id: u64) -> Vec<Arc<SpanInner>> {
        let mut t = self.lock();
        let (done, rest): (Vec<_>, Vec<_>) =
            std::mem::take(&mut t.spans).into_iter().partition(|span| {
                span.with_fields(|f| f.finished && f.span_id != exclude_span_id)
            });
        t.spans = rest;
        t.finished = t.finished.saturating_sub(done.len());
        done
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().spans.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TraceInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Why a chunk was produced, which controls post-processing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChunkKind {
    /// The trace completed normally.
    Finished,
    /// A partial flush of a still-running trace.
    Partial,
    /// A heartbeat snapshot of a long-running span.
    Heartbeat,
}

/// A batch of spans from one trace, ready for a writer.
pub(crate) struct Chunk {
    pub spans: Vec<Arc<SpanInner>>,
    pub trace_id: TraceId,
    pub origin: String,
    pub priority: Option<i32>,
    pub mechanism: Option<u32>,
    /// The trace was dropped by sampling; it ships for stats, and any spans
    /// kept by single-span rules carry their own keep markers.
    pub dropped: bool,
    pub kind: ChunkKind,
}
