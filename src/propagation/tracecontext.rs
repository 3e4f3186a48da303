//! The W3C trace context format: `traceparent` and `tracestate`.

use super::{Error, Extractor, Injector, TextMapPropagator};
use crate::baggage::Baggage;
use crate::context::SpanContext;
use crate::ids::TraceId;
use crate::keys;
use std::collections::HashMap;

const TRACEPARENT_HEADER: &str = "traceparent";
const TRACESTATE_HEADER: &str = "tracestate";

const SUPPORTED_VERSION: u8 = 0;
/// 0xff is forbidden by the specification.
const INVALID_VERSION: u8 = 0xff;
const FLAG_SAMPLED: u8 = 0x01;

/// Members allowed in a `tracestate` header.
const MAX_TRACESTATE_MEMBERS: usize = 32;
/// Size budget for the `dd` tracestate member.
const MAX_DD_MEMBER_LEN: usize = 256;

/// Injects and extracts span contexts in W3C trace context format. The
/// vendor-specific `dd` tracestate member carries the sampling priority,
/// origin and propagating tags; foreign vendor members observed on extract
/// are preserved and re-emitted after ours.
#[derive(Debug, Default)]
pub(crate) struct TraceContextPropagator {
    _private: (),
}

impl TraceContextPropagator {
    pub(crate) fn new() -> Self {
        TraceContextPropagator::default()
    }

    fn build_dd_member(context: &SpanContext) -> String {
        let mut member = String::from("dd=");
        let mut first = true;
        let mut push_part = |member: &mut String, part: String| {
            if !first {
                member.push(';');
            }
            first = false;
            member.push_str(&part);
        };

        if let Some(p) = context.sampling_priority() {
            push_part(&mut member, format!("s:{p}"));
        }
        if !context.origin().is_empty() {
            push_part(&mut member, format!("o:{}", sanitize_origin(context.origin())));
        }

        let mut tags: Vec<(String, String)> = context
            .trace()
            .propagating_tags()
            .into_iter()
            .filter(|(key, _)| {
                key.starts_with(keys::PROPAGATED_PREFIX) && key != keys::TRACE_ID_UPPER
            })
            .collect();
        tags.sort();
        for (key, value) in tags {
            let short_key = &key[keys::PROPAGATED_PREFIX.len()..];
            let part = format!(
                "t.{}:{}",
                sanitize_tag_key(short_key),
                sanitize_tag_value(&value)
            );
            // Tags that would overflow the member budget are dropped.
            if member.len() + 1 + part.len() > MAX_DD_MEMBER_LEN {
                continue;
            }
            push_part(&mut member, part);
        }
        member
    }

    fn build_tracestate(context: &SpanContext) -> String {
        let mut entries = vec![Self::build_dd_member(context)];
        if let Some(upstream) = context.trace().propagating_tag(keys::W3C_TRACESTATE) {
            for member in upstream.split(',') {
                let member = member.trim();
                if member.is_empty() || member.starts_with("dd=") {
                    continue;
                }
                if entries.len() >= MAX_TRACESTATE_MEMBERS {
                    break;
                }
                entries.push(member.to_string());
            }
        }
        entries.join(",")
    }

    fn parse_traceparent(raw: &str) -> Result<(TraceId, u64, bool), Error> {
        let parts: Vec<&str> = raw.trim().split('-').collect();
        if parts.len() < 4 {
            return Err(Error::Corrupted);
        }
        if parts[0].len() != 2 || has_upper(parts[0]) {
            return Err(Error::Corrupted);
        }
        let version = u8::from_str_radix(parts[0], 16).map_err(|_| Error::Corrupted)?;
        if version == INVALID_VERSION || (version == SUPPORTED_VERSION && parts.len() != 4) {
            return Err(Error::Corrupted);
        }

        if parts[1].len() != 32 || has_upper(parts[1]) {
            return Err(Error::Corrupted);
        }
        let trace_id = TraceId::from_hex(parts[1]).map_err(|_| Error::Corrupted)?;
        if trace_id.is_zero() {
            return Err(Error::Corrupted);
        }

        if parts[2].len() != 16 || has_upper(parts[2]) {
            return Err(Error::Corrupted);
        }
        let span_id = u64::from_str_radix(parts[2], 16).map_err(|_| Error::Corrupted)?;
        if span_id == 0 {
            return Err(Error::Corrupted);
        }

        if parts[3].len() != 2 || has_upper(parts[3]) {
            return Err(Error::Corrupted);
        }
        let flags = u8::from_str_radix(parts[3], 16).map_err(|_| Error::Corrupted)?;

        Ok((trace_id, span_id, flags & FLAG_SAMPLED != 0))
    }

    fn parse_tracestate(
        raw: &str,
        sampled: bool,
    ) -> (i32, String, HashMap<String, String>) {
        let mut priority = i32::from(sampled);
        let mut origin = String::new();
        let mut tags = HashMap::new();

        let dd_member = raw
            .split(',')
            .map(str::trim)
            .find_map(|member| member.strip_prefix("dd="));
        if let Some(dd) = dd_member {
            for part in dd.split(';') {
                let Some((key, value)) = part.split_once(':') else {
                    continue;
                };
                match key {
                    "s" => {
                        if let Ok(s) = value.parse::<i32>() {
                            // The traceparent sampled bit wins when the
                            // upstream priority disagrees with it.
                            if (sampled && s > 0) || (!sampled && s <= 0) {
                                priority = s;
                            }
                        }
                    }
                    "o" => origin = value.replace('~', "="),
                    _ => {
                        if let Some(short_key) = key.strip_prefix("t.") {
                            tags.insert(
                                format!("{}{short_key}", keys::PROPAGATED_PREFIX),
                                value.replace('~', "="),
                            );
                        }
                    }
                }
            }
        }
        (priority, origin, tags)
    }
}

impl TextMapPropagator for TraceContextPropagator {
    fn inject(&self, context: &SpanContext, carrier: &mut dyn Injector) -> Result<(), Error> {
        if context.trace_id().is_zero() || context.span_id() == 0 {
            return Err(Error::NotFound);
        }
        let flags = if context.sampling_priority().unwrap_or(0) > 0 {
            FLAG_SAMPLED
        } else {
            0
        };
        carrier.set(
            TRACEPARENT_HEADER,
            format!(
                "{:02x}-{}-{:016x}-{:02x}",
                SUPPORTED_VERSION,
                context.trace_id().to_hex(),
                context.span_id(),
                flags
            ),
        );
        carrier.set(TRACESTATE_HEADER, Self::build_tracestate(context));
        Ok(())
    }

    fn extract(&self, carrier: &dyn Extractor) -> Result<SpanContext, Error> {
        let raw = carrier.get(TRACEPARENT_HEADER).ok_or(Error::NotFound)?;
        let (trace_id, span_id, sampled) = Self::parse_traceparent(raw)?;

        let tracestate = carrier.get(TRACESTATE_HEADER).unwrap_or_default();
        let (priority, origin, mut tags) = Self::parse_tracestate(tracestate, sampled);

        if trace_id.upper() != 0 {
            tags.insert(
                keys::TRACE_ID_UPPER.to_string(),
                format!("{:016x}", trace_id.upper()),
            );
        }
        if !tracestate.is_empty() {
            tags.insert(keys::W3C_TRACESTATE.to_string(), tracestate.to_string());
        }

        Ok(SpanContext::remote(
            trace_id,
            span_id,
            Some(priority),
            origin,
            tags,
            Baggage::new(),
        ))
    }
}

fn has_upper(part: &str) -> bool {
    part.chars().any(|c| c.is_ascii_uppercase())
}

/// Origins are restricted to printable ASCII minus the tracestate
/// structural characters.
fn sanitize_origin(origin: &str) -> String {
    origin
        .chars()
        .map(|c| match c {
            ',' | ';' | '=' => '_',
            ' '..='~' => c,
            _ => '_',
        })
        .collect()
}

fn sanitize_tag_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            ',' | ';' | '=' | ' ' => '_',
            '!'..='~' => c,
            _ => '_',
        })
        .collect()
}

/// Tag values transpose `=` to `~` so the pair survives the tracestate
/// key:value syntax.
fn sanitize_tag_value(value: &str) -> String {
    value
        .chars()
        .map(|c| match c {
            '=' => '~',
            ',' | ';' | '~' => '_',
            ' '..='~' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ext::priority;

    fn propagator() -> TraceContextPropagator {
        TraceContextPropagator::new()
    }

    fn context(
        trace_id: TraceId,
        span_id: u64,
        prio: Option<i32>,
        origin: &str,
        tags: Vec<(&str, &str)>,
    ) -> SpanContext {
        let tags = tags
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        SpanContext::remote(
            trace_id,
            span_id,
            prio,
            origin.to_string(),
            tags,
            Baggage::new(),
        )
    }

    #[test]
    fn inject_reference_vectors() {
        let ctx = context(
            TraceId::from_u128(0x4bf92f3577b34da6a3ce929d0e0e4736),
            0x00f067aa0ba902b7,
            Some(2),
            "rum",
            vec![("_dd.p.usr.id", "baz64")],
        );
        let mut carrier = HashMap::new();
        propagator().inject(&ctx, &mut carrier).unwrap();

        assert_eq!(
            carrier["traceparent"],
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01"
        );
        assert!(carrier["tracestate"].starts_with("dd=s:2;o:rum;t.usr.id:baz64"));
    }

    #[test]
    fn inject_unsampled_flags() {
        let ctx = context(TraceId::new(0, 1), 2, Some(-1), "", vec![]);
        let mut carrier = HashMap::new();
        propagator().inject(&ctx, &mut carrier).unwrap();
        assert!(carrier["traceparent"].ends_with("-00"));
        assert!(carrier["tracestate"].starts_with("dd=s:-1"));
    }

    #[test]
    fn inject_sanitizes_origin_and_tag_values() {
        let ctx = context(
            TraceId::new(0, 1),
            2,
            Some(1),
            "my origin;v=2",
            vec![("_dd.p.note", "a=b,c")],
        );
        let mut carrier = HashMap::new();
        propagator().inject(&ctx, &mut carrier).unwrap();
        let state = &carrier["tracestate"];
        assert!(state.contains("o:my origin_v_2"), "got {state}");
        assert!(state.contains("t.note:a~b_c"), "got {state}");
    }

    #[test]
    fn inject_preserves_foreign_vendors() {
        let ctx = context(
            TraceId::new(0, 1),
            2,
            Some(1),
            "",
            vec![(keys::W3C_TRACESTATE, "congo=t61rcWkgMzE,dd=s:0")],
        );
        let mut carrier = HashMap::new();
        propagator().inject(&ctx, &mut carrier).unwrap();
        let state = &carrier["tracestate"];
        assert!(state.starts_with("dd=s:1"), "got {state}");
        assert!(state.ends_with(",congo=t61rcWkgMzE"), "got {state}");
        // The stale upstream dd member is not duplicated.
        assert_eq!(state.matches("dd=").count(), 1);
    }

    #[test]
    fn extract_reference_vector() {
        let mut carrier = HashMap::new();
        carrier.insert(
            "traceparent".to_string(),
            "00-4bf92f3577b34da6a3ce929d0e0e4736-00f067aa0ba902b7-01".to_string(),
        );
        carrier.insert(
            "tracestate".to_string(),
            "dd=s:2;o:rum;t.usr.id:baz64,congo=t61rcWkgMzE".to_string(),
        );

        let ctx = propagator().extract(&carrier).unwrap();
        assert_eq!(
            ctx.trace_id(),
            TraceId::from_u128(0x4bf92f3577b34da6a3ce929d0e0e4736)
        );
        assert_eq!(ctx.span_id(), 0x00f067aa0ba902b7);
        assert_eq!(ctx.sampling_priority(), Some(2));
        assert_eq!(ctx.origin(), "rum");
        assert_eq!(
            ctx.trace().propagating_tag("_dd.p.usr.id"),
            Some("baz64".to_string())
        );
        assert_eq!(
            ctx.trace().propagating_tag(keys::TRACE_ID_UPPER),
            Some("4bf92f3577b34da6".to_string())
        );
        // Raw upstream state is retained for reinjection.
        assert!(ctx
            .trace()
            .propagating_tag(keys::W3C_TRACESTATE)
            .unwrap()
            .contains("congo=t61rcWkgMzE"));
    }

    #[test]
    fn sampled_flag_wins_over_conflicting_priority() {
        let mut carrier = HashMap::new();
        carrier.insert(
            "traceparent".to_string(),
            "00-00000000000000000000000000000001-0000000000000002-01".to_string(),
        );
        carrier.insert("tracestate".to_string(), "dd=s:-1".to_string());
        let ctx = propagator().extract(&carrier).unwrap();
        assert_eq!(ctx.sampling_priority(), Some(1));

        let mut carrier = HashMap::new();
        carrier.insert(
            "traceparent".to_string(),
            "00-00000000000000000000000000000001-0000000000000002-00".to_string(),
        );
        carrier.insert("tracestate".to_string(), "dd=s:2".to_string());
        let ctx = propagator().extract(&carrier).unwrap();
        assert_eq!(ctx.sampling_priority(), Some(0));
    }

    #[test]
    fn extract_without_tracestate_uses_flags() {
        let mut carrier = HashMap::new();
        carrier.insert(
            "traceparent".to_string(),
            "00-00000000000000000000000000000001-0000000000000002-01".to_string(),
        );
        let ctx = propagator().extract(&carrier).unwrap();
        assert_eq!(ctx.sampling_priority(), Some(priority::AUTO_KEEP));
    }

    #[test]
    fn extract_rejects_malformed_traceparent() {
        let bad = [
            "",
            "00",
            "00-abc-def-01",
            "0000-00000000000000000000000000000001-0000000000000002-01",
            "ff-00000000000000000000000000000001-0000000000000002-01",
            "00-00000000000000000000000000000000-0000000000000002-01",
            "00-00000000000000000000000000000001-0000000000000000-01",
            "00-0000000000000000000000000000000G-0000000000000002-01",
            "00-00000000000000000000000000000001-0000000000000002-01-extra",
            "00-ABCDEF00000000000000000000000001-0000000000000002-01",
        ];
        for raw in bad {
            let mut carrier = HashMap::new();
            carrier.insert("traceparent".to_string(), raw.to_string());
            assert_eq!(
                propagator().extract(&carrier).unwrap_err(),
                Error::Corrupted,
                "accepted {raw:?}"
            );
        }
    }

    #[test]
    fn extract_missing_header_is_not_found() {
        let carrier = HashMap::new();
        assert_eq!(propagator().extract(&carrier).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn round_trip() {
        let original = context(
            TraceId::new(0x4bf92f3577b34da6, 0xa3ce929d0e0e4736),
            0xf067aa0ba902b7,
            Some(2),
            "rum",
            vec![("_dd.p.dm", "-4"), ("_dd.p.usr.id", "baz64")],
        );
        let mut carrier = HashMap::new();
        propagator().inject(&original, &mut carrier).unwrap();
        let extracted = propagator().extract(&carrier).unwrap();

        assert_eq!(extracted.trace_id(), original.trace_id());
        assert_eq!(extracted.span_id(), original.span_id());
        assert_eq!(extracted.sampling_priority(), Some(2));
        assert_eq!(extracted.origin(), "rum");
        assert_eq!(
            extracted.trace().propagating_tag("_dd.p.dm"),
            Some("-4".to_string())
        );
        assert_eq!(
            extracted.trace().propagating_tag("_dd.p.usr.id"),
            Some("baz64".to_string())
        );
    }
}
