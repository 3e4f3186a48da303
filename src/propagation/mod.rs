//! Span context propagation across process boundaries.
//!
//! Propagators serialize a [`SpanContext`] into a carrier on the way out and
//! reconstruct one on the way in. Carriers are anything that can set or get
//! string pairs: a `HashMap`, an [`http::HeaderMap`] through the provided
//! adapters, or a custom [`Injector`]/[`Extractor`] implementation.
//!
//! The wire formats supported out of the box are the Datadog `x-datadog-*`
//! headers, B3 single and multi headers, W3C `traceparent`/`tracestate` and
//! the W3C `baggage` header. A chained propagator applies every configured
//! injector and tries extractors in order until one finds a context.

mod b3;
mod baggage_header;
mod datadog;
mod tracecontext;

pub(crate) use b3::B3Propagator;
pub(crate) use baggage_header::BaggagePropagator;
pub(crate) use datadog::DatadogPropagator;
pub(crate) use tracecontext::TraceContextPropagator;

use crate::baggage::BaggageNamespace;
use crate::config::{Config, PropagationStyle};
use crate::context::SpanContext;
use std::collections::HashMap;
use thiserror::Error;

/// Propagation failure modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    /// The carrier cannot be used for this operation.
    #[error("invalid carrier")]
    InvalidCarrier,
    /// The carrier holds no span context.
    #[error("span context not found")]
    NotFound,
    /// The carrier holds a span context that cannot be decoded.
    #[error("span context corrupted")]
    Corrupted,
}

/// Write half of a carrier.
pub trait Injector {
    /// Sets a key/value pair on the carrier.
    fn set(&mut self, key: &str, value: String);
}

/// Read half of a carrier.
pub trait Extractor {
    /// Returns the value for a key, if present.
    fn get(&self, key: &str) -> Option<&str>;

    /// Lists all keys present on the carrier.
    fn keys(&self) -> Vec<&str>;
}

impl Injector for HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_string(), value);
    }
}

impl Extractor for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, key).map(String::as_str)
    }

    fn keys(&self) -> Vec<&str> {
        self.keys().map(String::as_str).collect()
    }
}

/// Adapts an [`http::HeaderMap`] into an [`Injector`]. Keys or values that
/// are not valid header names or values are silently skipped.
pub struct HeaderInjector<'a>(pub &'a mut http::HeaderMap);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        if let Ok(name) = http::header::HeaderName::from_bytes(key.as_bytes()) {
            if let Ok(value) = http::header::HeaderValue::from_str(&value) {
                self.0.insert(name, value);
            }
        }
    }
}

/// Adapts an [`http::HeaderMap`] into an [`Extractor`]. Values that are not
/// valid ASCII read as absent.
pub struct HeaderExtractor<'a>(pub &'a http::HeaderMap);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|value| value.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().map(http::HeaderName::as_str).collect()
    }
}

/// Serializes span contexts to and from carriers in one wire format.
pub trait TextMapPropagator: Send + Sync + std::fmt::Debug {
    /// Writes the span context into the carrier.
    fn inject(&self, context: &SpanContext, carrier: &mut dyn Injector) -> Result<(), Error>;

    /// Reads a span context out of the carrier.
    fn extract(&self, carrier: &dyn Extractor) -> Result<SpanContext, Error>;
}

/// Applies every configured injector and tries extractors in order; the
/// first extractor that finds a context wins. W3C baggage is handled
/// separately so that incoming baggage merges into whichever context another
/// extractor produced, or yields a baggage-only context when none did.
#[derive(Debug)]
pub(crate) struct ChainedPropagator {
    injectors: Vec<Box<dyn TextMapPropagator>>,
    extractors: Vec<Box<dyn TextMapPropagator>>,
    baggage: Option<BaggagePropagator>,
    inject_baggage: bool,
    extract_baggage: bool,
}

impl ChainedPropagator {
    /// Builds the propagator stack selected by the configuration.
    pub(crate) fn from_config(config: &Config) -> Self {
        let build = |style: PropagationStyle| -> Option<Box<dyn TextMapPropagator>> {
            match style {
                PropagationStyle::Datadog => Some(Box::new(DatadogPropagator::new(
                    config.tags_header_max_len,
                ))),
                PropagationStyle::B3 => Some(Box::new(B3Propagator::single_header())),
                PropagationStyle::B3Multi => Some(Box::new(B3Propagator::multi_header())),
                PropagationStyle::TraceContext => Some(Box::new(TraceContextPropagator::new())),
                PropagationStyle::Baggage => None,
            }
        };
        let injectors = config
            .inject_styles
            .iter()
            .copied()
            .filter_map(|style| build(style))
            .collect();
        let extractors = config
            .extract_styles
            .iter()
            .copied()
            .filter_map(|style| build(style))
            .collect();
        ChainedPropagator {
            injectors,
            extractors,
            baggage: Some(BaggagePropagator::new()),
            inject_baggage: config.inject_styles.contains(&PropagationStyle::Baggage),
            extract_baggage: config.extract_styles.contains(&PropagationStyle::Baggage),
        }
    }

    pub(crate) fn inject(
        &self,
        context: &SpanContext,
        carrier: &mut dyn Injector,
    ) -> Result<(), Error> {
        let mut result = Ok(());
        for propagator in &self.injectors {
            if let Err(error) = propagator.inject(context, carrier) {
                if result.is_ok() {
                    result = Err(error);
                }
            }
        }
        if self.inject_baggage {
            if let Some(baggage) = &self.baggage {
                let _ = baggage.inject(context, carrier);
            }
        }
        result
    }

    pub(crate) fn extract(&self, carrier: &dyn Extractor) -> Result<SpanContext, Error> {
        let mut found: Option<SpanContext> = None;
        for propagator in &self.extractors {
            match propagator.extract(carrier) {
                Ok(context) => {
                    found = Some(context);
                    break;
                }
                Err(Error::NotFound) => continue,
                Err(error) => return Err(error),
            }
        }

        if self.extract_baggage {
            if let Some(baggage) = &self.baggage {
                if let Ok(incoming) = baggage.extract(carrier) {
                    match &found {
                        Some(context) => {
                            incoming.for_each_baggage_item(BaggageNamespace::W3c, |k, v| {
                                context.baggage_set(BaggageNamespace::W3c, k, v);
                                true
                            });
                        }
                        None => found = Some(incoming),
                    }
                }
            }
        }

        found.ok_or(Error::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ids::TraceId;

    fn chained(inject: Vec<PropagationStyle>, extract: Vec<PropagationStyle>) -> ChainedPropagator {
        let mut config = Config::new();
        config.inject_styles = inject;
        config.extract_styles = extract;
        ChainedPropagator::from_config(&config)
    }

    fn sample_context() -> SpanContext {
        SpanContext::remote(
            TraceId::new(0, 0x1234),
            0x12,
            Some(1),
            String::new(),
            HashMap::new(),
            crate::baggage::Baggage::new(),
        )
    }

    #[test]
    fn inject_applies_every_style() {
        let propagator = chained(
            vec![
                PropagationStyle::Datadog,
                PropagationStyle::TraceContext,
                PropagationStyle::B3Multi,
            ],
            vec![],
        );
        let mut carrier = HashMap::new();
        propagator.inject(&sample_context(), &mut carrier).unwrap();
        assert!(carrier.contains_key("x-datadog-trace-id"));
        assert!(carrier.contains_key("traceparent"));
        assert!(carrier.contains_key("x-b3-traceid"));
    }

    #[test]
    fn extract_first_non_empty_wins() {
        let propagator = chained(
            vec![],
            vec![PropagationStyle::Datadog, PropagationStyle::TraceContext],
        );
        // Only W3C headers present: datadog extractor reports not-found and
        // the chain moves on.
        let mut carrier = HashMap::new();
        carrier.insert(
            "traceparent".to_string(),
            "00-000000000000000000000000000000aa-00000000000000bb-01".to_string(),
        );
        let context = propagator.extract(&carrier).unwrap();
        assert_eq!(context.trace_id().lower(), 0xaa);
        assert_eq!(context.span_id(), 0xbb);
    }

    #[test]
    fn extract_nothing_is_not_found() {
        let propagator = chained(vec![], vec![PropagationStyle::Datadog]);
        let carrier = HashMap::new();
        assert_eq!(propagator.extract(&carrier).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn corrupted_context_stops_the_chain() {
        let propagator = chained(
            vec![],
            vec![PropagationStyle::Datadog, PropagationStyle::TraceContext],
        );
        let mut carrier = HashMap::new();
        carrier.insert("x-datadog-trace-id".to_string(), "garbage".to_string());
        carrier.insert(
            "traceparent".to_string(),
            "00-000000000000000000000000000000aa-00000000000000bb-01".to_string(),
        );
        assert_eq!(propagator.extract(&carrier).unwrap_err(), Error::Corrupted);
    }

    #[test]
    fn baggage_merges_into_extracted_context() {
        let propagator = chained(
            vec![],
            vec![PropagationStyle::Datadog, PropagationStyle::Baggage],
        );
        let mut carrier = HashMap::new();
        carrier.insert("x-datadog-trace-id".to_string(), "42".to_string());
        carrier.insert("x-datadog-parent-id".to_string(), "7".to_string());
        carrier.insert("baggage".to_string(), "user=alice".to_string());

        let context = propagator.extract(&carrier).unwrap();
        assert_eq!(context.trace_id().lower(), 42);
        assert_eq!(
            context.baggage_get(BaggageNamespace::W3c, "user"),
            Some("alice".to_string())
        );
    }

    #[test]
    fn baggage_only_carrier_yields_baggage_context() {
        let propagator = chained(
            vec![],
            vec![PropagationStyle::Datadog, PropagationStyle::Baggage],
        );
        let mut carrier = HashMap::new();
        carrier.insert("baggage".to_string(), "user=alice".to_string());

        let context = propagator.extract(&carrier).unwrap();
        assert!(context.trace_id().is_zero());
        assert_eq!(
            context.baggage_get(BaggageNamespace::W3c, "user"),
            Some("alice".to_string())
        );
    }

    #[test]
    fn header_map_carrier_adapters() {
        let propagator = chained(
            vec![PropagationStyle::Datadog],
            vec![PropagationStyle::Datadog],
        );
        let mut headers = http::HeaderMap::new();
        propagator
            .inject(&sample_context(), &mut HeaderInjector(&mut headers))
            .unwrap();
        assert_eq!(
            headers.get("x-datadog-trace-id").unwrap(),
            &(0x1234u64).to_string()
        );

        let context = propagator.extract(&HeaderExtractor(&headers)).unwrap();
        assert_eq!(context.trace_id().lower(), 0x1234);
    }
}
