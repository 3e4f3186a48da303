//! The log trace writer: JSON trace output for agentless environments.
//!
//! Spans are encoded as a JSON object `{"traces": [[...], ...]}` written to
//! a backing writer, stdout by default. The buffer is capped below 256 KiB
//! so each emitted line stays within log-pipeline limits; a trace larger
//! than the buffer is split at span boundaries, and a single span that
//! cannot fit an empty buffer is dropped.

use super::TraceWriter;
use crate::health::HealthMetrics;
use crate::span::SpanFields;
use crate::trace::Chunk;
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use tracing::{error, warn};

const HEADER: &[u8] = b"{\"traces\": [";
const SUFFIX: &[u8] = b"]}\n";
/// Maximum buffered content between the header and the suffix.
const BUFFER_LIMIT: usize = 256 * 1024 - HEADER.len() - SUFFIX.len();

pub(crate) struct LogTraceWriter {
    out: Box<dyn io::Write + Send>,
    buf: Vec<u8>,
    traces: usize,
    health: Arc<HealthMetrics>,
}

impl LogTraceWriter {
    pub(crate) fn new(out: Box<dyn io::Write + Send>, health: Arc<HealthMetrics>) -> Self {
        LogTraceWriter {
            out,
            buf: Vec::with_capacity(4096),
            traces: 0,
            health,
        }
    }

    fn append_trace(&mut self, trace_json: &[u8]) {
        if self.buf.len() + trace_json.len() + 1 > BUFFER_LIMIT {
            self.flush();
        }
        if self.traces > 0 {
            self.buf.push(b',');
        }
        self.buf.extend_from_slice(trace_json);
        self.traces += 1;
    }
}

impl TraceWriter for LogTraceWriter {
    fn add(&mut self, chunk: &Chunk) {
        let mut current: Vec<u8> = vec![b'['];
        let mut spans_in_current = 0usize;
        let mut dropped = false;

        for span in &chunk.spans {
            let encoded = span.with_fields(|fields| serde_json::to_vec(&JsonSpan(fields)));
            let encoded = match encoded {
                Ok(encoded) => encoded,
                Err(error) => {
                    error!(%error, "dropping span that failed to encode");
                    self.health.trace_dropped("encoding_error");
                    continue;
                }
            };
            if encoded.len() + 2 > BUFFER_LIMIT {
                dropped = true;
                continue;
            }
            // Split the trace rather than overflow the buffer.
            if current.len() + encoded.len() + 1 > BUFFER_LIMIT {
                current.push(b']');
                self.append_trace(&current);
                current = vec![b'['];
                spans_in_current = 0;
            }
            if spans_in_current > 0 {
                current.push(b',');
            }
            current.extend_from_slice(&encoded);
            spans_in_current += 1;
        }

        if dropped {
            warn!(trace_id = chunk.trace_id.lower(), "span exceeds log buffer, dropping");
            self.health.trace_dropped("trace_too_large");
        }
        if spans_in_current > 0 {
            current.push(b']');
            self.append_trace(&current);
        }
    }

    fn flush(&mut self) {
        if self.traces == 0 {
            return;
        }
        let result = self
            .out
            .write_all(HEADER)
            .and_then(|_| self.out.write_all(&self.buf))
            .and_then(|_| self.out.write_all(SUFFIX))
            .and_then(|_| self.out.flush());
        if let Err(error) = result {
            error!(%error, "log writer flush failed");
        }
        self.buf.clear();
        self.traces = 0;
    }

    fn stop(&mut self) {
        self.flush();
    }
}

struct JsonSpan<'a>(&'a SpanFields);

impl Serialize for JsonSpan<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let f = self.0;
        // Non-finite metric values have no JSON representation and encode
        // as null; a metrics map holding only such values is omitted.
        let metrics: BTreeMap<&str, Option<f64>> = f
            .metrics
            .iter()
            .map(|(k, v)| (k.as_str(), v.is_finite().then_some(*v)))
            .collect();
        let include_metrics = metrics.is_empty() || metrics.values().any(Option::is_some);

        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("trace_id", &f.trace_id.lower())?;
        map.serialize_entry("span_id", &f.span_id)?;
        map.serialize_entry("parent_id", &f.parent_id)?;
        map.serialize_entry("name", &f.name)?;
        map.serialize_entry("service", &f.service)?;
        map.serialize_entry("resource", &f.resource)?;
        map.serialize_entry("type", &f.span_type)?;
        map.serialize_entry("start", &f.start)?;
        map.serialize_entry("duration", &f.duration)?;
        map.serialize_entry("error", &f.error)?;
        let meta: BTreeMap<&str, &str> = f
            .meta
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        map.serialize_entry("meta", &meta)?;
        if include_metrics {
            map.serialize_entry("metrics", &metrics)?;
        }
        map.end()
    }
}
