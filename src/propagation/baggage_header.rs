//! The W3C `baggage` header.

use super::{Error, Extractor, Injector, TextMapPropagator};
use crate::baggage::{Baggage, BaggageNamespace};
use crate::context::SpanContext;
use crate::ids::TraceId;
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use std::collections::HashMap;

const BAGGAGE_HEADER: &str = "baggage";

/// Characters escaped in baggage keys and values on top of controls.
const ESCAPED: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b',')
    .add(b';')
    .add(b'\\')
    .add(b'%')
    .add(b'=');

/// Injects and extracts the W3C baggage namespace as a single
/// comma-separated header of percent-encoded `key=value` pairs.
#[derive(Debug, Default)]
pub(crate) struct BaggagePropagator {
    _private: (),
}

impl BaggagePropagator {
    pub(crate) fn new() -> Self {
        BaggagePropagator::default()
    }
}

impl TextMapPropagator for BaggagePropagator {
    fn inject(&self, context: &SpanContext, carrier: &mut dyn Injector) -> Result<(), Error> {
        let mut pairs: Vec<(String, String)> = Vec::new();
        context.for_each_baggage_item(BaggageNamespace::W3c, |key, value| {
            pairs.push((key.to_string(), value.to_string()));
            true
        });
        if pairs.is_empty() {
            return Ok(());
        }
        pairs.sort();
        let header = pairs
            .iter()
            .map(|(key, value)| {
                format!(
                    "{}={}",
                    utf8_percent_encode(key, ESCAPED),
                    utf8_percent_encode(value, ESCAPED)
                )
            })
            .collect::<Vec<_>>()
            .join(",");
        carrier.set(BAGGAGE_HEADER, header);
        Ok(())
    }

    fn extract(&self, carrier: &dyn Extractor) -> Result<SpanContext, Error> {
        let raw = carrier.get(BAGGAGE_HEADER).ok_or(Error::NotFound)?;
        let mut baggage = Baggage::new();
        let mut any = false;
        for entry in raw.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let Some((key, value)) = entry.split_once('=') else {
                return Err(Error::Corrupted);
            };
            let key = percent_decode_str(key.trim())
                .decode_utf8()
                .map_err(|_| Error::Corrupted)?;
            // Value metadata (`;`-separated properties) is not interpreted.
            let value = value.split(';').next().unwrap_or_default();
            let value = percent_decode_str(value.trim())
                .decode_utf8()
                .map_err(|_| Error::Corrupted)?;
            if key.is_empty() {
                return Err(Error::Corrupted);
            }
            baggage.set(BaggageNamespace::W3c, key, value);
            any = true;
        }
        if !any {
            return Err(Error::NotFound);
        }
        Ok(SpanContext::remote(
            TraceId::ZERO,
            0,
            None,
            String::new(),
            HashMap::new(),
            baggage,
        ))
    }
}
