//! A Datadog APM tracing client.
//!
//! This crate contains the in-process core of a distributed-tracing
//! client: it builds spans into traces, decides which traces are kept
//! through a layered sampling pipeline, encodes completed traces into the
//! agent's msgpack payload formats, and uploads them to a local agent over
//! HTTP with retry and back-pressure. Long-running and abandoned spans are
//! watched by background trackers, and agent-pushed remote configuration
//! can adjust sampling at runtime.
//!
//! # Getting started
//!
//! ```no_run
//! use dd_trace::{Config, ext};
//!
//! let tracer = dd_trace::start(Config::new().with_service("billing"));
//!
//! let root = tracer.start_span("web.request");
//! let child = tracer
//!     .span_builder("db.query")
//!     .child_of(root.context())
//!     .with_span_type("sql")
//!     .start(&tracer);
//! child.set_tag("db.statement", "SELECT 1");
//! child.finish();
//! root.set_tag(ext::RESOURCE_NAME, "GET /checkout");
//! root.finish();
//!
//! dd_trace::stop();
//! ```
//!
//! Configuration is read from `DD_*` environment variables (service, agent
//! address, sampling rates and rules, propagation styles) and refined
//! through [`Config`]'s builder methods. Propagation across processes goes
//! through [`Tracer::inject`] and [`Tracer::extract`] over any carrier
//! implementing [`Injector`]/[`Extractor`].

mod abandoned;
mod baggage;
mod clock;
mod config;
mod context;
mod encoding;
pub mod ext;
mod health;
mod ids;
mod keys;
mod longrunning;
mod propagation;
mod remoteconfig;
mod sampling;
mod span;
mod statsd;
mod trace;
mod tracer;
mod transport;
mod writer;

pub use baggage::BaggageNamespace;
pub use clock::Clock;
pub use config::{ApiVersion, Config, ConfigOrigin, PropagationStyle};
pub use context::{ContextError, DeadlineContext, SpanContext};
pub use ids::{ParseIdError, TraceId};
pub use propagation::{
    Error as PropagationError, Extractor, HeaderExtractor, HeaderInjector, Injector,
    TextMapPropagator,
};
pub use remoteconfig::{ApplyState, ApplyStatus, ProductUpdate};
pub use sampling::{Provenance, SamplingRule};
pub use span::{FinishOptions, ReadWriteSpan, Span, SpanEvent, SpanLink, TagValue};
pub use statsd::{NoopStatsdClient, StatsdClient};
pub use tracer::{flush, global, start, stop, SpanBuilder, Tracer};
pub use transport::{HttpClient, TransportError};

#[cfg(feature = "reqwest-blocking-client")]
pub use transport::ReqwestBlockingClient;
