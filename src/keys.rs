//! Internal tag and metric keys exchanged with the agent.

/// Metric carrying the sampling priority of a chunk's first span.
pub(crate) const SAMPLING_PRIORITY: &str = "_sampling_priority_v1";

/// Metric recording the rate applied by a matching trace sampling rule.
pub(crate) const RULES_SAMPLER_APPLIED_RATE: &str = "_dd.rule_psr";

/// Metric recording the effective rate reported by the trace rate limiter.
pub(crate) const RULES_SAMPLER_LIMITER_RATE: &str = "_dd.limit_psr";

/// Metric recording the keep rate used by the priority sampler.
pub(crate) const PRIORITY_SAMPLER_RATE: &str = "_dd.agent_psr";

/// Metric recording the analytics event sample rate.
pub(crate) const ANALYTICS_EVENT_RATE: &str = "_dd1.sr.eausr";

/// Propagating tag naming the sampler that decided the trace.
pub(crate) const DECISION_MAKER: &str = "_dd.p.dm";

/// Propagating tag carrying the upper 64 bits of a 128-bit trace id, hex.
pub(crate) const TRACE_ID_UPPER: &str = "_dd.p.tid";

/// Prefix shared by all tags that cross service boundaries.
pub(crate) const PROPAGATED_PREFIX: &str = "_dd.p.";

/// Meta key carrying the trace origin (`rum`, `synthetics`, ...).
pub(crate) const ORIGIN: &str = "_dd.origin";

/// Trace-level tag recorded when propagation header injection fails.
pub(crate) const PROPAGATION_ERROR: &str = "_dd.propagation_error";

/// Metric flagging a span measured for trace stats; removed from heartbeat
/// snapshots so stats are not double counted.
pub(crate) const TOP_LEVEL: &str = "_dd.top_level";

/// Metric numbering successive chunks flushed from one live trace.
pub(crate) const PARTIAL_VERSION: &str = "_dd.partial_version";

/// Metric naming the mechanism that kept an individually sampled span.
pub(crate) const SPAN_SAMPLING_MECHANISM: &str = "_dd.span_sampling.mechanism";

/// Metric recording the rule rate that kept an individually sampled span.
pub(crate) const SPAN_SAMPLING_RULE_RATE: &str = "_dd.span_sampling.rule_rate";

/// Metric recording the configured per-second cap of a single-span rule.
pub(crate) const SPAN_SAMPLING_MPS: &str = "_dd.span_sampling.max_per_second";

/// Propagating tag storing a remote peer's raw `tracestate` header.
pub(crate) const W3C_TRACESTATE: &str = "tracestate";
