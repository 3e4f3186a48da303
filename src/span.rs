//! Spans: the unit of work.
//!
//! A [`Span`] is a cheap handle over reference-counted state. Attribute
//! reads and writes are serialized through the span's own read/write lock,
//! and a span becomes immutable once finished, except through the
//! [`ReadWriteSpan`] view handed to post-processors.

use crate::context::SpanContext;
use crate::ext;
use crate::ids::TraceId;
use crate::keys;
use crate::sampling::mechanism;
use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, RwLock, Weak};

const MAX_STACK_BYTES: usize = 4096;

/// A value assignable to a span tag. Numeric values land in the span's
/// metrics, strings and booleans in its meta mapping.
#[derive(Clone, Debug, PartialEq)]
pub enum TagValue {
    Str(String),
    Bool(bool),
    Float(f64),
    Int(i64),
}

impl TagValue {
    pub(crate) fn is_truthy(&self) -> bool {
        match self {
            TagValue::Str(s) => !s.is_empty() && s != "false" && s != "0",
            TagValue::Bool(b) => *b,
            TagValue::Float(f) => *f != 0.0,
            TagValue::Int(i) => *i != 0,
        }
    }

    pub(crate) fn as_f64(&self) -> Option<f64> {
        match self {
            TagValue::Float(f) => Some(*f),
            TagValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    fn into_string(self) -> String {
        match self {
            TagValue::Str(s) => s,
            TagValue::Bool(b) => b.to_string(),
            TagValue::Float(f) => f.to_string(),
            TagValue::Int(i) => i.to_string(),
        }
    }
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        TagValue::Str(v.to_string())
    }
}

impl From<String> for TagValue {
    fn from(v: String) -> Self {
        TagValue::Str(v)
    }
}

impl From<bool> for TagValue {
    fn from(v: bool) -> Self {
        TagValue::Bool(v)
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        TagValue::Float(v)
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        TagValue::Int(v)
    }
}

impl From<i32> for TagValue {
    fn from(v: i32) -> Self {
        TagValue::Int(v as i64)
    }
}

impl From<u64> for TagValue {
    fn from(v: u64) -> Self {
        TagValue::Int(v as i64)
    }
}

/// A causal link to a span in another trace.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpanLink {
    pub trace_id: TraceId,
    pub span_id: u64,
    pub trace_state: String,
    pub flags: u32,
    pub attributes: HashMap<String, String>,
}

/// A timestamped event recorded within a span.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SpanEvent {
    pub name: String,
    /// Nanoseconds since the Unix epoch; filled from the tracer clock when
    /// zero at the time the event is added.
    pub time_unix_nano: i64,
    pub attributes: HashMap<String, String>,
}

/// The locked attribute block of one span.
#[derive(Debug, Default)]
pub(crate) struct SpanFields {
    pub name: String,
    pub service: String,
    pub resource: String,
    pub span_type: String,
    pub span_id: u64,
    pub trace_id: TraceId,
    pub parent_id: u64,
    pub start: i64,
    pub duration: i64,
    pub error: i32,
    pub meta: HashMap<String, String>,
    pub metrics: HashMap<String, f64>,
    pub meta_struct: HashMap<String, Vec<u8>>,
    pub span_links: Vec<SpanLink>,
    pub span_events: Vec<SpanEvent>,
    pub integration: String,
    pub finished: bool,
    /// Whether the span made it into its trace's buffer.
    pub buffered: bool,
}

/// Reference-counted span state; shared by handles, the owning trace and
/// the live-span trackers.
pub(crate) struct SpanInner {
    fields: RwLock<SpanFields>,
    context: OnceLock<Weak<crate::context::ContextInner>>,
}

impl SpanInner {
    pub(crate) fn new(fields: SpanFields) -> Self {
        SpanInner {
            fields: RwLock::new(fields),
            context: OnceLock::new(),
        }
    }

    pub(crate) fn with_fields<T>(&self, f: impl FnOnce(&SpanFields) -> T) -> T {
        let guard = self.fields.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    pub(crate) fn with_fields_mut<T>(&self, f: impl FnOnce(&mut SpanFields) -> T) -> T {
        let mut guard = self.fields.write().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub(crate) fn bind_context(&self, context: &SpanContext) {
        let _ = self.context.set(Arc::downgrade(&context.inner));
    }

    pub(crate) fn context(&self) -> Option<SpanContext> {
        self.context
            .get()
            .and_then(Weak::upgrade)
            .map(|inner| SpanContext { inner })
    }
}

impl fmt::Debug for SpanInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.with_fields(|fields| {
            f.debug_struct("Span")
                .field("name", &fields.name)
                .field("service", &fields.service)
                .field("resource", &fields.resource)
                .field("span_id", &fields.span_id)
                .field("trace_id", &fields.trace_id)
                .field("parent_id", &fields.parent_id)
                .field("finished", &fields.finished)
                .finish()
        })
    }
}

/// Options for [`Span::finish_with`].
#[derive(Debug, Default)]
pub struct FinishOptions {
    /// Explicit finish time in nanoseconds since the Unix epoch.
    pub finish_time_ns: Option<i64>,
    /// Marks the span errored with this message.
    pub error_message: Option<String>,
    /// Suppresses the stack excerpt normally recorded with an error.
    pub no_debug_stack: bool,
}

/// One unit of work in a trace.
#[derive(Clone, Debug)]
pub struct Span {
    pub(crate) inner: Arc<SpanInner>,
    pub(crate) context: SpanContext,
}

impl Span {
    /// The span's propagation context.
    pub fn context(&self) -> SpanContext {
        self.context.clone()
    }

    pub fn trace_id(&self) -> TraceId {
        self.context.trace_id()
    }

    pub fn span_id(&self) -> u64 {
        self.context.span_id()
    }

    /// Sets a tag on the span. Well-known keys are routed: `error` marks the
    /// span errored, sampling keys write the trace priority, and
    /// service/resource/name/type mutate the corresponding span fields.
    /// Other values land in meta (strings, booleans) or metrics (numbers).
    /// Writes after finish are ignored.
    pub fn set_tag(&self, key: &str, value: impl Into<TagValue>) {
        let value = value.into();

        // Sampling keys mutate trace state, not the span.
        match key {
            ext::MANUAL_KEEP => {
                if value.is_truthy() {
                    self.context.trace().set_sampling_priority(
                        ext::priority::USER_KEEP as f64,
                        Some(mechanism::MANUAL),
                        true,
                    );
                }
                return;
            }
            ext::MANUAL_DROP => {
                if value.is_truthy() {
                    self.context.trace().set_sampling_priority(
                        ext::priority::USER_REJECT as f64,
                        Some(mechanism::MANUAL),
                        true,
                    );
                }
                return;
            }
            ext::SAMPLING_PRIORITY => {
                if let Some(priority) = value.as_f64() {
                    self.context.trace().set_sampling_priority(
                        priority,
                        Some(mechanism::MANUAL),
                        true,
                    );
                }
                return;
            }
            _ => {}
        }
        if key.starts_with(keys::PROPAGATED_PREFIX) {
            self.context
                .trace()
                .set_propagating_tag(key, value.into_string());
            return;
        }

        let debug_stack_disabled = self
            .context
            .tracer()
            .map(|core| core.config().debug_stack_disabled)
            .unwrap_or(true);

        self.inner.with_fields_mut(|fields| {
            if fields.finished {
                return;
            }
            match key {
                ext::ERROR => apply_error_tag(fields, value, debug_stack_disabled),
                ext::SERVICE_NAME => fields.service = value.into_string(),
                ext::RESOURCE_NAME => fields.resource = value.into_string(),
                ext::SPAN_NAME => fields.name = value.into_string(),
                ext::SPAN_TYPE => fields.span_type = value.into_string(),
                ext::ANALYTICS_EVENT => {
                    let rate = if value.is_truthy() { 1.0 } else { 0.0 };
                    fields
                        .metrics
                        .insert(keys::ANALYTICS_EVENT_RATE.to_string(), rate);
                }
                _ => match value {
                    TagValue::Float(v) => {
                        fields.metrics.insert(key.to_string(), v);
                    }
                    TagValue::Int(v) => {
                        fields.metrics.insert(key.to_string(), v as f64);
                    }
                    TagValue::Bool(v) => {
                        fields.meta.insert(key.to_string(), v.to_string());
                    }
                    TagValue::Str(v) => {
                        fields.meta.insert(key.to_string(), v);
                    }
                },
            }
        });
    }

    /// Sets an OpenTracing-namespace baggage item, propagated to children
    /// and across process boundaries.
    pub fn set_baggage_item(&self, key: impl Into<String>, value: impl Into<String>) {
        self.context.set_baggage_item(key, value);
    }

    /// Returns an OpenTracing-namespace baggage item.
    pub fn baggage_item(&self, key: &str) -> Option<String> {
        self.context.baggage_item(key)
    }

    /// Records a causal link to a span of another trace.
    pub fn add_link(&self, link: SpanLink) {
        self.inner.with_fields_mut(|fields| {
            if !fields.finished {
                fields.span_links.push(link);
            }
        });
    }

    /// Records a timestamped event on the span.
    pub fn add_event(&self, mut event: SpanEvent) {
        if event.time_unix_nano == 0 {
            if let Some(core) = self.context.tracer() {
                event.time_unix_nano = core.clock().now();
            }
        }
        self.inner.with_fields_mut(|fields| {
            if !fields.finished {
                fields.span_events.push(event);
            }
        });
    }

    /// The root span of this span's trace, if its context is still held
    /// anywhere.
    pub fn root(&self) -> Option<Span> {
        let inner = self.context.trace().root()?;
        let context = inner.context()?;
        Some(Span { inner, context })
    }

    /// Finishes the span with the current time. Finishing twice is a no-op.
    pub fn finish(&self) {
        self.finish_with(FinishOptions::default());
    }

    /// Finishes the span with explicit options.
    pub fn finish_with(&self, opts: FinishOptions) {
        let core = self.context.tracer();
        let finish_ns = opts.finish_time_ns.unwrap_or_else(|| {
            core.as_ref().map(|c| c.clock().now()).unwrap_or(0)
        });
        let debug_stack_disabled = opts.no_debug_stack
            || core
                .as_ref()
                .map(|c| c.config().debug_stack_disabled)
                .unwrap_or(true);

        let newly_finished = self.inner.with_fields_mut(|fields| {
            if fields.finished {
                return false;
            }
            if let Some(msg) = &opts.error_message {
                apply_error_tag(
                    fields,
                    TagValue::Str(msg.clone()),
                    debug_stack_disabled,
                );
            }
            fields.duration = (finish_ns - fields.start).max(0);
            fields.finished = true;
            true
        });
        if !newly_finished {
            return;
        }
        if let Some(core) = core {
            core.finish_span(self);
        }
    }

    /// A flattened snapshot of the span: identifiers, fields, meta and
    /// metrics in one map.
    pub fn as_map(&self) -> HashMap<String, TagValue> {
        self.inner.with_fields(|fields| {
            let mut out = HashMap::new();
            out.insert("name".to_string(), TagValue::Str(fields.name.clone()));
            out.insert("service".to_string(), TagValue::Str(fields.service.clone()));
            out.insert(
                "resource".to_string(),
                TagValue::Str(fields.resource.clone()),
            );
            out.insert("type".to_string(), TagValue::Str(fields.span_type.clone()));
            out.insert(
                "span_id".to_string(),
                TagValue::Int(fields.span_id as i64),
            );
            out.insert(
                "trace_id".to_string(),
                TagValue::Int(fields.trace_id.lower() as i64),
            );
            out.insert(
                "parent_id".to_string(),
                TagValue::Int(fields.parent_id as i64),
            );
            out.insert("start".to_string(), TagValue::Int(fields.start));
            out.insert("duration".to_string(), TagValue::Int(fields.duration));
            out.insert("error".to_string(), TagValue::Int(fields.error as i64));
            for (k, v) in &fields.meta {
                out.insert(k.clone(), TagValue::Str(v.clone()));
            }
            for (k, v) in &fields.metrics {
                out.insert(k.clone(), TagValue::Float(*v));
            }
            out
        })
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.inner.with_fields(|f| f.finished)
    }

    /// A span that records nothing, returned when no tracer is running.
    pub(crate) fn noop() -> Span {
        let fields = SpanFields {
            finished: true,
            ..SpanFields::default()
        };
        let inner = Arc::new(SpanInner::new(fields));
        let context = SpanContext::remote(
            TraceId::ZERO,
            0,
            None,
            String::new(),
            HashMap::new(),
            crate::baggage::Baggage::new(),
        );
        Span { inner, context }
    }
}

fn apply_error_tag(fields: &mut SpanFields, value: TagValue, debug_stack_disabled: bool) {
    if !value.is_truthy() {
        fields.error = 0;
        return;
    }
    fields.error = 1;
    if let TagValue::Str(msg) = value {
        fields.meta.insert(ext::ERROR_MSG.to_string(), msg);
    }
    if !debug_stack_disabled && !fields.meta.contains_key(ext::ERROR_STACK) {
        let mut stack = Backtrace::force_capture().to_string();
        stack.truncate(MAX_STACK_BYTES);
        fields.meta.insert(ext::ERROR_STACK.to_string(), stack);
    }
}

/// Read/write access to a span regardless of its finished state, handed to
/// post-processors just before a trace reaches the writer.
pub struct ReadWriteSpan {
    pub(crate) inner: Arc<SpanInner>,
}

impl ReadWriteSpan {
    pub fn name(&self) -> String {
        self.inner.with_fields(|f| f.name.clone())
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        let name = name.into();
        self.inner.with_fields_mut(|f| f.name = name);
    }

    pub fn service(&self) -> String {
        self.inner.with_fields(|f| f.service.clone())
    }

    pub fn set_service(&mut self, service: impl Into<String>) {
        let service = service.into();
        self.inner.with_fields_mut(|f| f.service = service);
    }

    pub fn resource(&self) -> String {
        self.inner.with_fields(|f| f.resource.clone())
    }

    pub fn set_resource(&mut self, resource: impl Into<String>) {
        let resource = resource.into();
        self.inner.with_fields_mut(|f| f.resource = resource);
    }

    pub fn span_id(&self) -> u64 {
        self.inner.with_fields(|f| f.span_id)
    }

    pub fn trace_id(&self) -> TraceId {
        self.inner.with_fields(|f| f.trace_id)
    }

    pub fn parent_id(&self) -> u64 {
        self.inner.with_fields(|f| f.parent_id)
    }

    pub fn start_ns(&self) -> i64 {
        self.inner.with_fields(|f| f.start)
    }

    pub fn duration_ns(&self) -> i64 {
        self.inner.with_fields(|f| f.duration)
    }

    pub fn is_error(&self) -> bool {
        self.inner.with_fields(|f| f.error != 0)
    }

    pub fn set_error(&mut self, error: bool) {
        self.inner.with_fields_mut(|f| f.error = i32::from(error));
    }

    pub fn meta(&self, key: &str) -> Option<String> {
        self.inner.with_fields(|f| f.meta.get(key).cloned())
    }

    pub fn set_meta(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let (key, value) = (key.into(), value.into());
        self.inner.with_fields_mut(|f| {
            f.meta.insert(key, value);
        });
    }

    pub fn remove_meta(&mut self, key: &str) {
        self.inner.with_fields_mut(|f| {
            f.meta.remove(key);
        });
    }

    pub fn metric(&self, key: &str) -> Option<f64> {
        self.inner.with_fields(|f| f.metrics.get(key).copied())
    }

    pub fn set_metric(&mut self, key: impl Into<String>, value: f64) {
        let key = key.into();
        self.inner.with_fields_mut(|f| {
            f.metrics.insert(key, value);
        });
    }
}

impl fmt::Debug for ReadWriteSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}
