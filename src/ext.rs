//! Well-known span tag keys and sampling priorities.
//!
//! Setting one of these keys through [`Span::set_tag`](crate::Span::set_tag)
//! routes the value to the corresponding span field or trace-level state
//! instead of the generic tag stores.

/// Marks a span as errored. Truthy values set the error field; string values
/// additionally populate [`ERROR_MSG`].
pub const ERROR: &str = "error";

/// The error message companion tag.
pub const ERROR_MSG: &str = "error.msg";

/// The error type companion tag.
pub const ERROR_TYPE: &str = "error.type";

/// The error stack companion tag.
pub const ERROR_STACK: &str = "error.stack";

/// Forces the trace to be kept, overriding samplers, and locks the decision.
pub const MANUAL_KEEP: &str = "manual.keep";

/// Forces the trace to be dropped, overriding samplers, and locks the decision.
pub const MANUAL_DROP: &str = "manual.drop";

/// Sets the sampling priority directly. The written priority is locked.
pub const SAMPLING_PRIORITY: &str = "sampling.priority";

/// Overrides the span's service name.
pub const SERVICE_NAME: &str = "service.name";

/// Overrides the span's resource name.
pub const RESOURCE_NAME: &str = "resource.name";

/// Overrides the span's operation name.
pub const SPAN_NAME: &str = "span.name";

/// Sets the span type (`web`, `db`, `cache`, ...).
pub const SPAN_TYPE: &str = "span.type";

/// Marks the span as an analyzed span for app analytics.
pub const ANALYTICS_EVENT: &str = "analytics.event";

/// Sampling priorities, from user-forced drop to user-forced keep.
pub mod priority {
    /// The user explicitly asked for the trace to be dropped.
    pub const USER_REJECT: i32 = -1;
    /// The sampler decided to drop the trace.
    pub const AUTO_REJECT: i32 = 0;
    /// The sampler decided to keep the trace.
    pub const AUTO_KEEP: i32 = 1;
    /// The user explicitly asked for the trace to be kept.
    pub const USER_KEEP: i32 = 2;
}
