//! The B3 header format, single (`b3`) and multi (`x-b3-*`) variants.

use super::{Error, Extractor, Injector, TextMapPropagator};
use crate::baggage::Baggage;
use crate::context::SpanContext;
use crate::ids::TraceId;
use crate::ext::priority;
use std::collections::HashMap;

const B3_SINGLE_HEADER: &str = "b3";
const B3_TRACE_ID_HEADER: &str = "x-b3-traceid";
const B3_SPAN_ID_HEADER: &str = "x-b3-spanid";
const B3_SAMPLED_HEADER: &str = "x-b3-sampled";

/// Injects and extracts span contexts as B3 headers. Extraction accepts both
/// encodings, preferring the single header; injection uses the configured
/// one. B3 carries no origin, baggage or vendor tags.
#[derive(Debug)]
pub(crate) struct B3Propagator {
    single_header: bool,
}

impl B3Propagator {
    pub(crate) fn single_header() -> Self {
        B3Propagator {
            single_header: true,
        }
    }

    pub(crate) fn multi_header() -> Self {
        B3Propagator {
            single_header: false,
        }
    }

    fn format_trace_id(trace_id: TraceId) -> String {
        if trace_id.upper() != 0 {
            trace_id.to_hex()
        } else {
            format!("{:016x}", trace_id.lower())
        }
    }

    /// Trace ids are 16 or 32 lowercase hex characters, right-aligned.
    fn parse_trace_id(raw: &str) -> Result<TraceId, Error> {
        if raw.len() != 16 && raw.len() != 32 {
            return Err(Error::Corrupted);
        }
        if raw.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(Error::Corrupted);
        }
        let trace_id = TraceId::from_hex(raw).map_err(|_| Error::Corrupted)?;
        if trace_id.is_zero() {
            return Err(Error::Corrupted);
        }
        Ok(trace_id)
    }

    fn parse_span_id(raw: &str) -> Result<u64, Error> {
        if raw.len() != 16 || raw.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(Error::Corrupted);
        }
        u64::from_str_radix(raw, 16).map_err(|_| Error::Corrupted)
    }

    fn parse_sampled(raw: &str) -> Result<i32, Error> {
        match raw {
            "1" | "true" | "d" => Ok(priority::AUTO_KEEP),
            "0" | "false" => Ok(priority::AUTO_REJECT),
            _ => Err(Error::Corrupted),
        }
    }

    fn extract_single(&self, raw: &str) -> Result<SpanContext, Error> {
        let parts: Vec<&str> = raw.split('-').collect();
        if parts.len() < 2 || parts.len() > 4 {
            return Err(Error::Corrupted);
        }
        let trace_id = Self::parse_trace_id(parts[0])?;
        let span_id = Self::parse_span_id(parts[1])?;
        let sampled = match parts.get(2) {
            Some(flag) => Some(Self::parse_sampled(flag)?),
            None => None,
        };
        Ok(Self::build_context(trace_id, span_id, sampled))
    }

    fn extract_multi(&self, carrier: &dyn Extractor) -> Result<SpanContext, Error> {
        let raw_trace_id = carrier.get(B3_TRACE_ID_HEADER).ok_or(Error::NotFound)?;
        let trace_id = Self::parse_trace_id(raw_trace_id)?;
        let span_id = match carrier.get(B3_SPAN_ID_HEADER) {
            Some(raw) => Self::parse_span_id(raw)?,
            None => return Err(Error::Corrupted),
        };
        let sampled = match carrier.get(B3_SAMPLED_HEADER) {
            Some(raw) => Some(Self::parse_sampled(raw)?),
            None => None,
        };
        Ok(Self::build_context(trace_id, span_id, sampled))
    }

    fn build_context(trace_id: TraceId, span_id: u64, sampled: Option<i32>) -> SpanContext {
        SpanContext::remote(
            trace_id,
            span_id,
            sampled,
            String::new(),
            HashMap::new(),
            Baggage::new(),
        )
    }
}

impl TextMapPropagator for B3Propagator {
    fn inject(&self, context: &SpanContext, carrier: &mut dyn Injector) -> Result<(), Error> {
        if context.trace_id().is_zero() || context.span_id() == 0 {
            return Err(Error::NotFound);
        }
        let trace_id = Self::format_trace_id(context.trace_id());
        let span_id = format!("{:016x}", context.span_id());
        let sampled = context
            .sampling_priority()
            .map(|p| if p > 0 { "1" } else { "0" });

        if self.single_header {
            let mut value = format!("{trace_id}-{span_id}");
            if let Some(sampled) = sampled {
                value.push('-');
                value.push_str(sampled);
            }
            carrier.set(B3_SINGLE_HEADER, value);
        } else {
            carrier.set(B3_TRACE_ID_HEADER, trace_id);
            carrier.set(B3_SPAN_ID_HEADER, span_id);
            if let Some(sampled) = sampled {
                carrier.set(B3_SAMPLED_HEADER, sampled.to_string());
            }
        }
        Ok(())
    }

    fn extract(&self, carrier: &dyn Extractor) -> Result<SpanContext, Error> {
        match carrier.get(B3_SINGLE_HEADER) {
            Some(raw) => self.extract_single(raw.trim()),
            None => self.extract_multi(carrier),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context(upper: u64, lower: u64, span_id: u64, priority: Option<i32>) -> SpanContext {
        SpanContext::remote(
            TraceId::new(upper, lower),
            span_id,
            priority,
            String::new(),
            HashMap::new(),
            Baggage::new(),
        )
    }

    #[test]
    fn multi_inject() {
        let mut carrier = HashMap::new();
        B3Propagator::multi_header()
            .inject(&context(0, 0xabc, 0xdef, Some(1)), &mut carrier)
            .unwrap();
        assert_eq!(carrier["x-b3-traceid"], "0000000000000abc");
        assert_eq!(carrier["x-b3-spanid"], "0000000000000def");
        assert_eq!(carrier["x-b3-sampled"], "1");
    }

    #[test]
    fn multi_inject_128_bit() {
        let mut carrier = HashMap::new();
        B3Propagator::multi_header()
            .inject(&context(0x11, 0x22, 0x33, Some(-1)), &mut carrier)
            .unwrap();
        assert_eq!(
            carrier["x-b3-traceid"],
            "00000000000000110000000000000022"
        );
        assert_eq!(carrier["x-b3-sampled"], "0");
    }

    #[test]
    fn single_inject() {
        let mut carrier = HashMap::new();
        B3Propagator::single_header()
            .inject(&context(0, 0xabc, 0xdef, Some(2)), &mut carrier)
            .unwrap();
        assert_eq!(carrier["b3"], "0000000000000abc-0000000000000def-1");
    }

    #[test]
    fn single_inject_without_priority() {
        let mut carrier = HashMap::new();
        B3Propagator::single_header()
            .inject(&context(0, 0xabc, 0xdef, None), &mut carrier)
            .unwrap();
        assert_eq!(carrier["b3"], "0000000000000abc-0000000000000def");
    }

    #[test]
    fn multi_extract_right_aligns_short_trace_id() {
        let mut carrier = HashMap::new();
        carrier.insert("x-b3-traceid".to_string(), "0000000000000abc".to_string());
        carrier.insert("x-b3-spanid".to_string(), "0000000000000def".to_string());
        carrier.insert("x-b3-sampled".to_string(), "0".to_string());

        let context = B3Propagator::multi_header().extract(&carrier).unwrap();
        assert_eq!(context.trace_id(), TraceId::new(0, 0xabc));
        assert_eq!(context.span_id(), 0xdef);
        assert_eq!(context.sampling_priority(), Some(0));
    }

    #[test]
    fn multi_extract_32_char_trace_id() {
        let mut carrier = HashMap::new();
        carrier.insert(
            "x-b3-traceid".to_string(),
            "463ac35c9f6413ad48485a3953bb6124".to_string(),
        );
        carrier.insert("x-b3-spanid".to_string(), "0020000000000001".to_string());

        let context = B3Propagator::multi_header().extract(&carrier).unwrap();
        assert_eq!(context.trace_id().upper(), 0x463ac35c9f6413ad);
        assert_eq!(context.trace_id().lower(), 0x48485a3953bb6124);
        assert_eq!(context.sampling_priority(), None);
    }

    #[test]
    fn single_header_preferred_on_extract() {
        let mut carrier = HashMap::new();
        carrier.insert(
            "b3".to_string(),
            "0000000000000abc-0000000000000def-d".to_string(),
        );
        carrier.insert("x-b3-traceid".to_string(), "0000000000000999".to_string());
        carrier.insert("x-b3-spanid".to_string(), "0000000000000888".to_string());

        let context = B3Propagator::multi_header().extract(&carrier).unwrap();
        assert_eq!(context.trace_id().lower(), 0xabc);
        assert_eq!(context.sampling_priority(), Some(1));
    }

    #[test]
    fn extract_error_kinds() {
        let empty = HashMap::new();
        assert_eq!(
            B3Propagator::multi_header().extract(&empty).unwrap_err(),
            Error::NotFound
        );

        let mut bad_len = HashMap::new();
        bad_len.insert("x-b3-traceid".to_string(), "abc".to_string());
        assert_eq!(
            B3Propagator::multi_header().extract(&bad_len).unwrap_err(),
            Error::Corrupted
        );

        let mut upper_case = HashMap::new();
        upper_case.insert("x-b3-traceid".to_string(), "0000000000000ABC".to_string());
        assert_eq!(
            B3Propagator::multi_header()
                .extract(&upper_case)
                .unwrap_err(),
            Error::Corrupted
        );

        let mut no_span = HashMap::new();
        no_span.insert("x-b3-traceid".to_string(), "0000000000000abc".to_string());
        assert_eq!(
            B3Propagator::multi_header().extract(&no_span).unwrap_err(),
            Error::Corrupted
        );

        let mut zero_trace = HashMap::new();
        zero_trace.insert("x-b3-traceid".to_string(), "0000000000000000".to_string());
        zero_trace.insert("x-b3-spanid".to_string(), "0000000000000def".to_string());
        assert_eq!(
            B3Propagator::multi_header()
                .extract(&zero_trace)
                .unwrap_err(),
            Error::Corrupted
        );
    }

    #[test]
    fn round_trip() {
        for propagator in [B3Propagator::single_header(), B3Propagator::multi_header()] {
            let original = context(0x11, 0x22, 0x33, Some(1));
            let mut carrier = HashMap::new();
            propagator.inject(&original, &mut carrier).unwrap();
            let extracted = propagator.extract(&carrier).unwrap();
            assert_eq!(extracted.trace_id(), original.trace_id());
            assert_eq!(extracted.span_id(), original.span_id());
            assert_eq!(extracted.sampling_priority(), Some(1));
        }
    }
}
