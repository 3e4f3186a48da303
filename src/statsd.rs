//! Minimal statsd abstraction for health and runtime metrics.

use std::fmt;
use std::time::Duration;

/// The statsd surface the tracer emits through. Implementations are
/// expected to be cheap and non-blocking; the default is a no-op.
pub trait StatsdClient: Send + Sync + fmt::Debug {
    fn count(&self, name: &str, value: i64, tags: &[String], rate: f64);

    fn gauge(&self, name: &str, value: f64, tags: &[String], rate: f64);

    fn timing(&self, name: &str, duration: Duration, tags: &[String], rate: f64);

    fn incr(&self, name: &str, tags: &[String]) {
        self.count(name, 1, tags, 1.0);
    }

    /// Forces buffered metrics out.
    fn flush(&self) {}

    /// Releases the client. Called once at tracer shutdown.
    fn close(&self) {}
}

/// Discards every metric.
#[derive(Debug, Default)]
pub struct NoopStatsdClient;

impl StatsdClient for NoopStatsdClient {
    fn count(&self, _name: &str, _value: i64, _tags: &[String], _rate: f64) {}

    fn gauge(&self, _name: &str, _value: f64, _tags: &[String], _rate: f64) {}

    fn timing(&self, _name: &str, _duration: Duration, _tags: &[String], _rate: f64) {}
}

#[cfg(test)]
pub(crate) mod testing {
    use super::StatsdClient;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    pub(crate) enum Metric {
        Count(String, i64, Vec<String>),
        Gauge(String, f64, Vec<String>),
        Timing(String, Duration, Vec<String>),
    }

    /// Records every call for assertions.
    #[derive(Debug, Default)]
    pub(crate) struct RecordingStatsd {
        pub calls: Mutex<Vec<Metric>>,
    }

    impl RecordingStatsd {
        pub(crate) fn new() -> Self {
            RecordingStatsd::default()
        }

        pub(crate) fn counts_named(&self, name: &str) -> Vec<(i64, Vec<String>)> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter_map(|m| match m {
                    Metric::Count(n, v, tags) if n == name => Some((*v, tags.clone())),
                    _ => None,
                })
                .collect()
        }
    }

    impl StatsdClient for RecordingStatsd {
        fn count(&self, name: &str, value: i64, tags: &[String], _rate: f64) {
            self.calls
                .lock()
                .unwrap()
                .push(Metric::Count(name.to_string(), value, tags.to_vec()));
        }

        fn gauge(&self, name: &str, value: f64, tags: &[String], _rate: f64) {
            self.calls
                .lock()
                .unwrap()
                .push(Metric::Gauge(name.to_string(), value, tags.to_vec()));
        }

        fn timing(&self, name: &str, duration: Duration, tags: &[String], _rate: f64) {
            self.calls
                .lock()
                .unwrap()
                .push(Metric::Timing(name.to_string(), duration, tags.to_vec()));
        }
    }
}
