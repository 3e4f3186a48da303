//! The Datadog `x-datadog-*` header format.

use super::{Error, Extractor, Injector, TextMapPropagator};
use crate::baggage::{Baggage, BaggageNamespace};
use crate::context::SpanContext;
use crate::ids::TraceId;
use crate::keys;
use std::collections::HashMap;
use tracing::debug;

const TRACE_ID_HEADER: &str = "x-datadog-trace-id";
const PARENT_ID_HEADER: &str = "x-datadog-parent-id";
const PRIORITY_HEADER: &str = "x-datadog-sampling-priority";
const ORIGIN_HEADER: &str = "x-datadog-origin";
const TAGS_HEADER: &str = "x-datadog-tags";
const BAGGAGE_PREFIX: &str = "ot-baggage-";

/// Injects and extracts span contexts using Datadog's header format. The
/// 64-bit decimal trace id headers carry the lower half of the trace id; the
/// upper half travels as the `_dd.p.tid` member of `x-datadog-tags`.
#[derive(Debug)]
pub(crate) struct DatadogPropagator {
    /// Byte budget for `x-datadog-tags`; zero disables the header.
    max_tags_header_len: usize,
}

impl DatadogPropagator {
    pub(crate) fn new(max_tags_header_len: usize) -> Self {
        DatadogPropagator {
            max_tags_header_len,
        }
    }

    fn encode_tags_header(&self, context: &SpanContext) -> Option<String> {
        if self.max_tags_header_len == 0 {
            return None;
        }
        let tags = context.trace().propagating_tags();
        let mut pairs: Vec<(String, String)> = tags
            .into_iter()
            .filter(|(key, _)| key.starts_with(keys::PROPAGATED_PREFIX))
            .collect();
        if pairs.is_empty() {
            return None;
        }
        pairs.sort();

        let mut header = String::new();
        for (key, value) in pairs {
            if !valid_tag_part(&key) || !valid_tag_part(&value) {
                context
                    .trace()
                    .set_tag(keys::PROPAGATION_ERROR, "encoding_error");
                continue;
            }
            if !header.is_empty() {
                header.push(',');
            }
            header.push_str(&key);
            header.push('=');
            header.push_str(&value);
        }
        if header.len() > self.max_tags_header_len {
            context
                .trace()
                .set_tag(keys::PROPAGATION_ERROR, "inject_max_size");
            return None;
        }
        (!header.is_empty()).then_some(header)
    }
}

fn valid_tag_part(part: &str) -> bool {
    part.bytes()
        .all(|b| (0x20..=0x7e).contains(&b) && b != b',' && b != b'=')
}

impl TextMapPropagator for DatadogPropagator {
    fn inject(&self, context: &SpanContext, carrier: &mut dyn Injector) -> Result<(), Error> {
        if context.trace_id().is_zero() || context.span_id() == 0 {
            return Err(Error::NotFound);
        }
        carrier.set(TRACE_ID_HEADER, context.trace_id().lower().to_string());
        carrier.set(PARENT_ID_HEADER, context.span_id().to_string());
        if let Some(priority) = context.sampling_priority() {
            carrier.set(PRIORITY_HEADER, priority.to_string());
        }
        if !context.origin().is_empty() {
            carrier.set(ORIGIN_HEADER, context.origin().to_string());
        }
        if let Some(header) = self.encode_tags_header(context) {
            carrier.set(TAGS_HEADER, header);
        }
        context.for_each_baggage_item(BaggageNamespace::OpenTracing, |key, value| {
            carrier.set(&format!("{BAGGAGE_PREFIX}{key}"), value.to_string());
            true
        });
        Ok(())
    }

    fn extract(&self, carrier: &dyn Extractor) -> Result<SpanContext, Error> {
        let raw_trace_id = carrier.get(TRACE_ID_HEADER).ok_or(Error::NotFound)?;
        let lower: u64 = raw_trace_id.parse().map_err(|_| Error::Corrupted)?;
        if lower == 0 {
            return Err(Error::Corrupted);
        }

        let span_id = match carrier.get(PARENT_ID_HEADER) {
            Some(raw) => raw.parse::<u64>().map_err(|_| Error::Corrupted)?,
            None => 0,
        };
        let priority = match carrier.get(PRIORITY_HEADER) {
            Some(raw) => Some(raw.parse::<i32>().map_err(|_| Error::Corrupted)?),
            None => None,
        };
        let origin = carrier.get(ORIGIN_HEADER).unwrap_or_default().to_string();

        let mut upper = 0u64;
        let mut tags = HashMap::new();
        if let Some(raw) = carrier.get(TAGS_HEADER) {
            for pair in raw.split(',').filter(|p| !p.is_empty()) {
                let Some((key, value)) = pair.split_once('=') else {
                    debug!(header = TAGS_HEADER, pair, "skipping malformed tag pair");
                    continue;
                };
                if !key.starts_with(keys::PROPAGATED_PREFIX) {
                    continue;
                }
                if key == keys::TRACE_ID_UPPER {
                    match u64::from_str_radix(value, 16) {
                        Ok(parsed) if value.len() == 16 => upper = parsed,
                        _ => {
                            debug!(value, "dropping malformed upper trace id tag");
                            continue;
                        }
                    }
                }
                tags.insert(key.to_string(), value.to_string());
            }
        }

        let mut baggage = Baggage::new();
        for key in carrier.keys() {
            let lowered = key.to_ascii_lowercase();
            if let Some(name) = lowered.strip_prefix(BAGGAGE_PREFIX) {
                if let Some(value) = carrier.get(key) {
                    baggage.set(BaggageNamespace::OpenTracing, name, value);
                }
            }
        }

        Ok(SpanContext::remote(
            TraceId::new(upper, lower),
            span_id,
            priority,
            origin,
            tags,
            baggage,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn propagator() -> DatadogPropagator {
        DatadogPropagator::new(512)
    }

    fn context_with_tags(tags: Vec<(&str, &str)>) -> SpanContext {
        let tags = tags
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SpanContext::remote(
            TraceId::new(0x1111, 0x2222),
            0x3333,
            Some(2),
            "rum".to_string(),
            tags,
            Baggage::new(),
        )
    }

    #[test]
    fn inject_base_headers() {
        let mut carrier = HashMap::new();
        propagator()
            .inject(&context_with_tags(vec![]), &mut carrier)
            .unwrap();
        assert_eq!(carrier["x-datadog-trace-id"], 0x2222.to_string());
        assert_eq!(carrier["x-datadog-parent-id"], 0x3333.to_string());
        assert_eq!(carrier["x-datadog-sampling-priority"], "2");
        assert_eq!(carrier["x-datadog-origin"], "rum");
    }

    #[test]
    fn inject_missing_context() {
        let context = SpanContext::remote(
            TraceId::ZERO,
            0,
            None,
            String::new(),
            HashMap::new(),
            Baggage::new(),
        );
        let mut carrier = HashMap::new();
        assert_eq!(
            propagator().inject(&context, &mut carrier),
            Err(Error::NotFound)
        );
        assert!(carrier.is_empty());
    }

    #[test]
    fn tags_header_carries_propagated_tags_only() {
        let context = context_with_tags(vec![("_dd.p.dm", "-4"), ("tracestate", "foo=bar")]);
        let mut carrier = HashMap::new();
        propagator().inject(&context, &mut carrier).unwrap();
        assert_eq!(carrier["x-datadog-tags"], "_dd.p.dm=-4");
    }

    #[test]
    fn oversized_tags_header_is_dropped_and_flagged() {
        let long_value = "v".repeat(600);
        let context = context_with_tags(vec![("_dd.p.big", &long_value)]);
        let mut carrier = HashMap::new();
        propagator().inject(&context, &mut carrier).unwrap();
        assert!(!carrier.contains_key("x-datadog-tags"));
        assert_eq!(
            context.trace().tags().get(keys::PROPAGATION_ERROR).map(String::as_str),
            Some("inject_max_size")
        );
    }

    #[test]
    fn invalid_tag_chars_are_skipped_and_flagged() {
        let context = context_with_tags(vec![("_dd.p.ok", "fine"), ("_dd.p.bad", "a,b")]);
        let mut carrier = HashMap::new();
        propagator().inject(&context, &mut carrier).unwrap();
        assert_eq!(carrier["x-datadog-tags"], "_dd.p.ok=fine");
        assert_eq!(
            context.trace().tags().get(keys::PROPAGATION_ERROR).map(String::as_str),
            Some("encoding_error")
        );
    }

    #[test]
    fn baggage_round_trip() {
        let context = context_with_tags(vec![]);
        context.set_baggage_item("account", "apm");
        let mut carrier = HashMap::new();
        propagator().inject(&context, &mut carrier).unwrap();
        assert_eq!(carrier["ot-baggage-account"], "apm");

        let extracted = propagator().extract(&carrier).unwrap();
        assert_eq!(extracted.baggage_item("account"), Some("apm".to_string()));
    }

    #[test]
    fn extract_full_context() {
        let mut carrier = HashMap::new();
        carrier.insert("x-datadog-trace-id".to_string(), "8738".to_string());
        carrier.insert("x-datadog-parent-id".to_string(), "13107".to_string());
        carrier.insert("x-datadog-sampling-priority".to_string(), "-1".to_string());
        carrier.insert("x-datadog-origin".to_string(), "synthetics".to_string());
        carrier.insert(
            "x-datadog-tags".to_string(),
            format!("_dd.p.dm=-4,{}=0000000000001111", keys::TRACE_ID_UPPER),
        );

        let context = propagator().extract(&carrier).unwrap();
        assert_eq!(context.trace_id(), TraceId::new(0x1111, 8738));
        assert_eq!(context.span_id(), 13107);
        assert_eq!(context.sampling_priority(), Some(-1));
        assert_eq!(context.origin(), "synthetics");
        assert_eq!(
            context.trace().propagating_tag("_dd.p.dm"),
            Some("-4".to_string())
        );
    }

    #[test]
    fn extract_error_kinds() {
        let empty = HashMap::new();
        assert_eq!(propagator().extract(&empty).unwrap_err(), Error::NotFound);

        let mut corrupt = HashMap::new();
        corrupt.insert("x-datadog-trace-id".to_string(), "not-a-number".to_string());
        assert_eq!(propagator().extract(&corrupt).unwrap_err(), Error::Corrupted);

        let mut zero = HashMap::new();
        zero.insert("x-datadog-trace-id".to_string(), "0".to_string());
        assert_eq!(propagator().extract(&zero).unwrap_err(), Error::Corrupted);

        let mut bad_parent = HashMap::new();
        bad_parent.insert("x-datadog-trace-id".to_string(), "1".to_string());
        bad_parent.insert("x-datadog-parent-id".to_string(), "xyz".to_string());
        assert_eq!(
            propagator().extract(&bad_parent).unwrap_err(),
            Error::Corrupted
        );
    }

    #[test]
    fn extract_tolerates_missing_parent() {
        let mut carrier = HashMap::new();
        carrier.insert("x-datadog-trace-id".to_string(), "99".to_string());
        let context = propagator().extract(&carrier).unwrap();
        assert_eq!(context.trace_id().lower(), 99);
        assert_eq!(context.span_id(), 0);
    }

    #[test]
    fn round_trip_preserves_context() {
        let context = context_with_tags(vec![("_dd.p.dm", "-3"), ("_dd.p.usr.id", "baz64")]);
        context.trace().set_propagating_tag(
            keys::TRACE_ID_UPPER,
            format!("{:016x}", context.trace_id().upper()),
        );
        let mut carrier = HashMap::new();
        propagator().inject(&context, &mut carrier).unwrap();

        let extracted = propagator().extract(&carrier).unwrap();
        assert_eq!(extracted.trace_id(), context.trace_id());
        assert_eq!(extracted.span_id(), context.span_id());
        assert_eq!(extracted.sampling_priority(), Some(2));
        assert_eq!(extracted.origin(), "rum");
        assert_eq!(
            extracted.trace().propagating_tag("_dd.p.usr.id"),
            Some("baz64".to_string())
        );
    }
}
