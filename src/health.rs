//! Health counters reported periodically through the statsd client.
//!
//! Counters accumulate between report ticks and reset once flushed, so each
//! reported value covers exactly one interval.

use crate::statsd::StatsdClient;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Debug, Default)]
pub(crate) struct HealthMetrics {
    spans_started: Mutex<HashMap<String, u64>>,
    spans_finished: Mutex<HashMap<String, u64>>,
    traces_dropped: Mutex<HashMap<&'static str, u64>>,
    tracker_events_dropped: AtomicU64,
    flushed_traces: AtomicU64,
    flushed_bytes: AtomicU64,
    partial_spans_closed: AtomicU64,
    partial_spans_remaining: AtomicU64,
    /// Net spans alive: started minus finished, reported as a gauge.
    spans_in_flight: AtomicI64,
}

impl HealthMetrics {
    pub(crate) fn new() -> Self {
        HealthMetrics::default()
    }

    pub(crate) fn span_started(&self, integration: &str) {
        let mut map = self.spans_started.lock().unwrap_or_else(|e| e.into_inner());
        *map.entry(integration.to_string()).or_default() += 1;
        self.spans_in_flight.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn span_finished(&self, integration: &str) {
        let mut map = self
            .spans_finished
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *map.entry(integration.to_string()).or_default() += 1;
        self.spans_in_flight.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn trace_dropped(&self, reason: &'static str) {
        self.traces_dropped_n(reason, 1);
    }

    pub(crate) fn traces_dropped_n(&self, reason: &'static str, n: usize) {
        let mut map = self
            .traces_dropped
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *map.entry(reason).or_default() += n as u64;
    }

    pub(crate) fn tracker_event_dropped(&self) {
        self.tracker_events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush(&self, traces: usize, bytes: usize) {
        self.flushed_traces.fetch_add(traces as u64, Ordering::Relaxed);
        self.flushed_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_partial_flush(&self, closed: usize, remaining: usize) {
        self.partial_spans_closed
            .fetch_add(closed as u64, Ordering::Relaxed);
        self.partial_spans_remaining
            .fetch_add(remaining as u64, Ordering::Relaxed);
    }

    /// Emits and resets the interval counters, plus point-in-time gauges.
    pub(crate) fn report(&self, statsd: &dyn StatsdClient, queue_depth: usize) {
        let started = std::mem::take(
            &mut *self.spans_started.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for (integration, count) in started {
            statsd.count(
                "datadog.tracer.spans_started",
                count as i64,
                &[format!("integration:{integration}")],
                1.0,
            );
        }
        let finished = std::mem::take(
            &mut *self
                .spans_finished
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for (integration, count) in finished {
            statsd.count(
                "datadog.tracer.spans_finished",
                count as i64,
                &[format!("integration:{integration}")],
                1.0,
            );
        }
        let dropped = std::mem::take(
            &mut *self
                .traces_dropped
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for (reason, count) in dropped {
            statsd.count(
                "datadog.tracer.traces_dropped",
                count as i64,
                &[format!("reason:{reason}")],
                1.0,
            );
        }

        let tracker_dropped = self.tracker_events_dropped.swap(0, Ordering::Relaxed);
        if tracker_dropped > 0 {
            statsd.count(
                "datadog.tracer.tracker_events_dropped",
                tracker_dropped as i64,
                &[],
                1.0,
            );
        }
        let flushed = self.flushed_traces.swap(0, Ordering::Relaxed);
        if flushed > 0 {
            statsd.count("datadog.tracer.flush_traces", flushed as i64, &[], 1.0);
        }
        let bytes = self.flushed_bytes.swap(0, Ordering::Relaxed);
        if bytes > 0 {
            statsd.count("datadog.tracer.flush_bytes", bytes as i64, &[], 1.0);
        }
        let closed = self.partial_spans_closed.swap(0, Ordering::Relaxed);
        if closed > 0 {
            statsd.count(
                "datadog.tracer.partial_flush.spans_closed",
                closed as i64,
                &[],
                1.0,
            );
        }
        let remaining = self.partial_spans_remaining.swap(0, Ordering::Relaxed);
        if remaining > 0 {
            statsd.count(
                "datadog.tracer.partial_flush.spans_remaining",
                remaining as i64,
                &[],
                1.0,
            );
        }

        statsd.gauge(
            "datadog.tracer.spans_in_flight",
            self.spans_in_flight.load(Ordering::Relaxed) as f64,
            &[],
            1.0,
        );
        statsd.gauge("datadog.tracer.queue_depth", queue_depth as f64, &[], 1.0);
        statsd.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::statsd::testing::{Metric, RecordingStatsd};

    #[test]
    fn counters_reset_between_reports() {
        let health = HealthMetrics::new();
        let statsd = RecordingStatsd::new();

        health.span_started("net/http");
        health.span_started("net/http");
        health.span_finished("net/http");
        health.trace_dropped("trace_too_large");
        health.record_flush(3, 1024);

        health.report(&statsd, 5);
        assert_eq!(
            statsd.counts_named("datadog.tracer.spans_started"),
            vec![(2, vec!["integration:net/http".to_string()])]
        );
        assert_eq!(
            statsd.counts_named("datadog.tracer.traces_dropped"),
            vec![(1, vec!["reason:trace_too_large".to_string()])]
        );
        assert_eq!(
            statsd.counts_named("datadog.tracer.flush_traces"),
            vec![(3, vec![])]
        );

        // Second report with no activity carries no counters, only gauges.
        let statsd = RecordingStatsd::new();
        health.report(&statsd, 0);
        assert!(statsd.counts_named("datadog.tracer.spans_started").is_empty());
        assert!(statsd.counts_named("datadog.tracer.flush_traces").is_empty());
        let calls = statsd.calls.lock().unwrap();
        assert!(calls
            .iter()
            .any(|m| matches!(m, Metric::Gauge(name, v, _) if name == "datadog.tracer.spans_in_flight" && *v == 1.0)));
    }
}
