//! Debug log of abandoned spans: spans open longer than a configured
//! timeout.
//!
//! Span starts and finishes stream in over channels and a single loop owns
//! all structure, so no lock protects the buckets. Spans are grouped into
//! time buckets: every span in a bucket started within the tracking
//! interval of every other, and buckets are ordered by the start of their
//! oldest span. A tick walks buckets oldest-first and stops at the first
//! young one.

use crate::clock::Clock;
use crate::span::SpanInner;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::warn;

/// Capacity of the start/finish event channels. When the loop cannot keep
/// up, events are dropped at the call site and counted.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 200;

/// A span being watched for abandonment.
pub(crate) struct TrackedSpan {
    pub span_id: u64,
    pub trace_id: u64,
    pub name: String,
    pub start: i64,
    pub span: Arc<SpanInner>,
}

impl TrackedSpan {
    pub(crate) fn from_span(span: &Arc<SpanInner>) -> Self {
        span.with_fields(|f| TrackedSpan {
            span_id: f.span_id,
            trace_id: f.trace_id.lower(),
            name: f.name.clone(),
            start: f.start,
            span: span.clone(),
        })
    }
}

struct Bucket {
    spans: VecDeque<TrackedSpan>,
}

impl Bucket {
    fn head_start(&self) -> i64 {
        self.spans.front().map(|s| s.start).unwrap_or(i64::MAX)
    }
}

/// The bucketed structure itself, detached from the loop for testability.
pub(crate) struct AbandonedTracker {
    buckets: VecDeque<Bucket>,
    interval_ns: i64,
    log_size: usize,
}

impl AbandonedTracker {
    pub(crate) fn new(interval: Duration, log_size: usize) -> Self {
        AbandonedTracker {
            buckets: VecDeque::new(),
            interval_ns: interval.as_nanos() as i64,
            log_size,
        }
    }

    /// Files the span into the first bucket whose head started within the
    /// interval, appending a new bucket when none matches.
    pub(crate) fn insert(&mut self, span: TrackedSpan) {
        for bucket in &mut self.buckets {
            if (span.start - bucket.head_start()).abs() < self.interval_ns {
                bucket.spans.push_back(span);
                return;
            }
        }
        let mut spans = VecDeque::new();
        spans.push_back(span);
        self.buckets.push_back(Bucket { spans });
    }

    /// Removes a finished span; empty buckets disappear with it.
    pub(crate) fn remove(&mut self, span_id: u64) {
        for (i, bucket) in self.buckets.iter_mut().enumerate() {
            if let Some(pos) = bucket.spans.iter().position(|s| s.span_id == span_id) {
                bucket.spans.remove(pos);
                if bucket.spans.is_empty() {
                    self.buckets.remove(i);
                }
                return;
            }
        }
    }

    /// Checks the bucket ordering invariant, for tests.
    #[cfg(test)]
    fn assert_invariant(&self) {
        for bucket in &self.buckets {
            for a in &bucket.spans {
                for b in &bucket.spans {
                    assert!((a.start - b.start).abs() <= self.interval_ns);
                }
            }
        }
        let heads: Vec<i64> = self.buckets.iter().map(Bucket::head_start).collect();
        let mut sorted = heads.clone();
        sorted.sort();
        assert_eq!(heads, sorted);
    }

    /// Builds the overdue-span report for this tick, or `None` when every
    /// bucket is still young. The report is capped at `log_size` bytes of
    /// span descriptions and marks truncation.
    pub(crate) fn tick(&mut self, now_ns: i64) -> Option<String> {
        let mut total = 0usize;
        let mut body = String::new();
        let mut truncated = false;

        for bucket in &mut self.buckets {
            if now_ns - bucket.head_start() < self.interval_ns {
                // Buckets are ordered; everything after this one is younger.
                break;
            }
            // Spans whose finish event was dropped under back-pressure are
            // quietly released here.
            bucket
                .spans
                .retain(|entry| !entry.span.with_fields(|f| f.finished));
            for entry in &bucket.spans {
                if now_ns - entry.start < self.interval_ns {
                    continue;
                }
                total += 1;
                if truncated {
                    continue;
                }
                let line = format!(
                    "[name:{},span_id:{},trace_id:{},age:{}s],",
                    entry.name,
                    entry.span_id,
                    entry.trace_id,
                    (now_ns - entry.start) / 1_000_000_000
                );
                if body.len() + line.len() > self.log_size {
                    truncated = true;
                    body.push_str("...");
                } else {
                    body.push_str(&line);
                }
            }
        }
        self.buckets.retain(|bucket| !bucket.spans.is_empty());

        if total == 0 {
            return None;
        }
        Some(format!("{total} abandoned spans: {body}"))
    }
}

/// Channel endpoints the tracer feeds span lifecycle events into.
#[derive(Clone)]
pub(crate) struct AbandonedSpanChannels {
    pub in_tx: Sender<TrackedSpan>,
    pub out_tx: Sender<u64>,
}

/// Starts the tracker loop. All mutations happen on the spawned thread,
/// serialized through channel receives.
pub(crate) fn spawn(
    interval: Duration,
    log_size: usize,
    clock: Arc<dyn Clock>,
    stop: Receiver<()>,
) -> (AbandonedSpanChannels, JoinHandle<()>) {
    let (in_tx, in_rx) = bounded::<TrackedSpan>(EVENT_CHANNEL_CAPACITY);
    let (out_tx, out_rx) = bounded::<u64>(EVENT_CHANNEL_CAPACITY);
    let ticker = tick(interval);

    let handle = std::thread::Builder::new()
        .name("dd-trace-abandoned-spans".to_string())
        .spawn(move || {
            let mut tracker = AbandonedTracker::new(interval, log_size);
            loop {
                select! {
                    recv(in_rx) -> event => {
                        if let Ok(span) = event {
                            tracker.insert(span);
                        }
                    }
                    recv(out_rx) -> event => {
                        if let Ok(span_id) = event {
                            tracker.remove(span_id);
                        }
                    }
                    recv(ticker) -> _ => {
                        if let Some(report) = tracker.tick(clock.now()) {
                            warn!(timeout_secs = interval.as_secs(), "{report}");
                        }
                    }
                    recv(stop) -> _ => return,
                }
            }
        })
        .expect("spawning abandoned-span tracker");

    (AbandonedSpanChannels { in_tx, out_tx }, handle)
}
