//! Span contexts: the propagation-bearing state shared with child spans.
//!
//! A [`SpanContext`] travels with a span and across process boundaries. It
//! carries the identifiers, origin, baggage and trace reference that child
//! spans inherit, and doubles as a deadline/cancellation context so request
//! plumbing can thread one value through both tracing and timeout concerns:
//! the deadline, done-channel, error and value-lookup operations delegate to
//! a parent [`DeadlineContext`] when one is attached.

use crate::baggage::{Baggage, BaggageNamespace};
use crate::ids::TraceId;
use crate::trace::Trace;
use crate::tracer::TracerCore;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock, Weak};
use std::time::SystemTime;
use thiserror::Error;

/// Why a deadline/cancellation context is done.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("context canceled")]
    Canceled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Deadline, cancellation and value lookup, in the shape request-scoped
/// plumbing expects. [`SpanContext`] implements this by delegating to the
/// parent context captured at span creation, so a span context can stand in
/// wherever one of these is required.
pub trait DeadlineContext: Send + Sync {
    /// The instant after which work on behalf of this context should stop.
    fn deadline(&self) -> Option<SystemTime> {
        None
    }

    /// A channel closed when the context is canceled or expired.
    fn done(&self) -> Option<crossbeam_channel::Receiver<()>> {
        None
    }

    /// Non-nil once the context is done.
    fn err(&self) -> Option<ContextError> {
        None
    }

    /// Looks up a context value by type. Prefer the typed
    /// [`SpanContext::value`] wrapper.
    fn value_any(&self, _key: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }
}

pub(crate) struct ContextInner {
    pub(crate) trace_id: TraceId,
    pub(crate) span_id: u64,
    pub(crate) trace: Trace,
    pub(crate) origin: String,
    /// True when this context was reconstructed from carrier headers rather
    /// than created around a local span.
    pub(crate) is_remote: bool,
    pub(crate) baggage: RwLock<Baggage>,
    pub(crate) tracer: Weak<TracerCore>,
    pub(crate) parent: Option<Arc<dyn DeadlineContext>>,
}

/// The propagation-bearing state of one span, shared with its children.
#[derive(Clone)]
pub struct SpanContext {
    pub(crate) inner: Arc<ContextInner>,
}

impl SpanContext {
    pub(crate) fn from_inner(inner: ContextInner) -> Self {
        SpanContext {
            inner: Arc::new(inner),
        }
    }

    /// Builds a context from values extracted out of a carrier. The context
    /// owns a fresh trace seeded with the upstream priority and propagating
    /// tags; local child spans join that trace.
    pub(crate) fn remote(
        trace_id: TraceId,
        span_id: u64,
        priority: Option<i32>,
        origin: String,
        propagating_tags: HashMap<String, String>,
        baggage: Baggage,
    ) -> Self {
        let trace = Trace::new();
        for (key, value) in propagating_tags {
            trace.set_propagating_tag(key, value);
        }
        if let Some(priority) = priority {
            trace.set_sampling_priority(priority as f64, None, false);
        }
        SpanContext::from_inner(ContextInner {
            trace_id,
            span_id,
            trace,
            origin,
            is_remote: true,
            baggage: RwLock::new(baggage),
            tracer: Weak::new(),
            parent: None,
        })
    }

    /// The 128-bit trace identifier.
    pub fn trace_id(&self) -> TraceId {
        self.inner.trace_id
    }

    /// The identifier of the span this context belongs to.
    pub fn span_id(&self) -> u64 {
        self.inner.span_id
    }

    /// The sampling priority, if one has been decided.
    pub fn sampling_priority(&self) -> Option<i32> {
        self.inner.trace.priority()
    }

    /// The trace origin (`rum`, `synthetics`, ...), empty when unset.
    pub fn origin(&self) -> &str {
        &self.inner.origin
    }

    /// Returns an OpenTracing-namespace baggage item.
    pub fn baggage_item(&self, key: &str) -> Option<String> {
        self.baggage_get(BaggageNamespace::OpenTracing, key)
    }

    /// Sets an OpenTracing-namespace baggage item.
    pub fn set_baggage_item(&self, key: impl Into<String>, value: impl Into<String>) {
        self.baggage_set(BaggageNamespace::OpenTracing, key, value);
    }

    /// Returns a baggage item from the given namespace.
    pub fn baggage_get(&self, ns: BaggageNamespace, key: &str) -> Option<String> {
        let baggage = self.inner.baggage.read().unwrap_or_else(|e| e.into_inner());
        baggage.get(ns, key).map(str::to_string)
    }

    /// Sets a baggage item in the given namespace.
    pub fn baggage_set(
        &self,
        ns: BaggageNamespace,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Option<String> {
        let mut baggage = self
            .inner
            .baggage
            .write()
            .unwrap_or_else(|e| e.into_inner());
        baggage.set(ns, key, value)
    }

    /// Removes a baggage item from the given namespace.
    pub fn baggage_remove(&self, ns: BaggageNamespace, key: &str) -> Option<String> {
        let mut baggage = self
            .inner
            .baggage
            .write()
            .unwrap_or_else(|e| e.into_inner());
        baggage.remove(ns, key)
    }

    /// Clears one baggage namespace.
    pub fn baggage_clear(&self, ns: BaggageNamespace) {
        let mut baggage = self
            .inner
            .baggage
            .write()
            .unwrap_or_else(|e| e.into_inner());
        baggage.clear(ns);
    }

    /// Visits baggage items in the namespace until the callback returns
    /// `false`. Order is unspecified.
    pub fn for_each_baggage_item<F>(&self, ns: BaggageNamespace, f: F)
    where
        F: FnMut(&str, &str) -> bool,
    {
        let baggage = self.inner.baggage.read().unwrap_or_else(|e| e.into_inner());
        baggage.visit(ns, f);
    }

    /// Typed context-value lookup, delegated up the parent chain.
    pub fn value<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value_any(TypeId::of::<T>())
            .and_then(|v| v.downcast::<T>().ok())
    }

    pub(crate) fn trace(&self) -> &Trace {
        &self.inner.trace
    }

    pub(crate) fn tracer(&self) -> Option<Arc<TracerCore>> {
        self.inner.tracer.upgrade()
    }

    pub(crate) fn baggage_snapshot(&self) -> Baggage {
        self.inner
            .baggage
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl DeadlineContext for SpanContext {
    fn deadline(&self) -> Option<SystemTime> {
        self.inner.parent.as_ref().and_then(|p| p.deadline())
    }

    fn done(&self) -> Option<crossbeam_channel::Receiver<()>> {
        self.inner.parent.as_ref().and_then(|p| p.done())
    }

    fn err(&self) -> Option<ContextError> {
        self.inner.parent.as_ref().and_then(|p| p.err())
    }

    fn value_any(&self, key: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.inner.parent.as_ref().and_then(|p| p.value_any(key))
    }
}

impl fmt::Debug for SpanContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpanContext")
            .field("trace_id", &self.inner.trace_id)
            .field("span_id", &self.inner.span_id)
            .field("origin", &self.inner.origin)
            .field("is_remote", &self.inner.is_remote)
            .field("priority", &self.sampling_priority())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::Receiver;

    #[test]
    fn remote_context_seeds_trace_state() {
        let mut tags = HashMap::new();
        tags.insert("_dd.p.dm".to_string(), "-4".to_string());
        let ctx = SpanContext::remote(
            TraceId::new(0, 42),
            7,
            Some(2),
            "rum".to_string(),
            tags,
            Baggage::new(),
        );
        assert_eq!(ctx.trace_id().lower(), 42);
        assert_eq!(ctx.span_id(), 7);
        assert_eq!(ctx.sampling_priority(), Some(2));
        assert_eq!(ctx.origin(), "rum");
        assert_eq!(
            ctx.trace().propagating_tag("_dd.p.dm"),
            Some("-4".to_string())
        );
    }

    #[test]
    fn baggage_namespaces_via_context() {
        let ctx = SpanContext::remote(
            TraceId::new(0, 1),
            1,
            None,
            String::new(),
            HashMap::new(),
            Baggage::new(),
        );
        ctx.set_baggage_item("account", "apm");
        ctx.baggage_set(BaggageNamespace::W3c, "account", "w3c");
        assert_eq!(ctx.baggage_item("account"), Some("apm".to_string()));
        assert_eq!(
            ctx.baggage_get(BaggageNamespace::W3c, "account"),
            Some("w3c".to_string())
        );
        ctx.baggage_remove(BaggageNamespace::OpenTracing, "account");
        assert_eq!(ctx.baggage_item("account"), None);
    }

    #[derive(Debug)]
    struct ParentCtx {
        deadline: SystemTime,
        done: Receiver<()>,
        answer: Arc<u64>,
    }

    impl DeadlineContext for ParentCtx {
        fn deadline(&self) -> Option<SystemTime> {
            Some(self.deadline)
        }

        fn done(&self) -> Option<Receiver<()>> {
            Some(self.done.clone())
        }

        fn err(&self) -> Option<ContextError> {
            Some(ContextError::Canceled)
        }

        fn value_any(&self, key: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
            (key == TypeId::of::<u64>()).then(|| self.answer.clone() as Arc<dyn Any + Send + Sync>)
        }
    }

    #[test]
    fn delegates_to_parent_context() {
        let (tx, rx) = crossbeam_channel::bounded(0);
        let deadline = SystemTime::now();
        let parent = Arc::new(ParentCtx {
            deadline,
            done: rx,
            answer: Arc::new(99),
        });

        let ctx = SpanContext::from_inner(ContextInner {
            trace_id: TraceId::new(0, 1),
            span_id: 1,
            trace: Trace::new(),
            origin: String::new(),
            is_remote: false,
            baggage: RwLock::new(Baggage::new()),
            tracer: Weak::new(),
            parent: Some(parent),
        });

        assert_eq!(ctx.deadline(), Some(deadline));
        assert_eq!(ctx.err(), Some(ContextError::Canceled));
        assert_eq!(ctx.value::<u64>().as_deref(), Some(&99));
        assert_eq!(ctx.value::<String>(), None);

        drop(tx);
        assert!(ctx.done().unwrap().recv().is_err());
    }

    #[test]
    fn no_parent_means_no_deadline() {
        let ctx = SpanContext::remote(
            TraceId::new(0, 1),
            1,
            None,
            String::new(),
            HashMap::new(),
            Baggage::new(),
        );
        assert!(ctx.deadline().is_none());
        assert!(ctx.done().is_none());
        assert!(ctx.err().is_none());
        assert!(ctx.value::<u64>().is_none());
    }
}
