//! The tracer core: span creation, trace assembly and background loops.
//!
//! A started tracer owns a worker thread that receives completed trace
//! chunks over a bounded channel, runs post-processing, and feeds the
//! writer; flush and health ticks ride the same loop. Optional trackers for
//! abandoned and long-running spans run on their own threads. All
//! background work ends on a single stop signal, closed once.

use crate::abandoned::{self, AbandonedSpanChannels, TrackedSpan};
use crate::baggage::Baggage;
use crate::clock::{self, Clock};
use crate::config::{Config, ConfigOrigin, PostProcessor};
use crate::context::{ContextInner, DeadlineContext, SpanContext};
use crate::health::HealthMetrics;
use crate::ids;
use crate::keys;
use crate::longrunning::LongRunningTracker;
use crate::propagation::{ChainedPropagator, Error as PropagationError, Extractor, Injector};
use crate::remoteconfig::{
    self, ApplyStatus, LibConfig, LocalDefaults, ProductUpdate,
};
use crate::sampling::{
    self, mechanism, PrioritySampler, RuleTarget, SamplingRule, SpanRulesSampler,
    TraceRulesSampler,
};
use crate::span::{ReadWriteSpan, Span, SpanFields, SpanInner, SpanLink, TagValue};
use crate::statsd::{NoopStatsdClient, StatsdClient};
use crate::trace::{Chunk, ChunkKind, FinishAction, Trace};
use crate::transport::Transport;
use crate::writer::agent::AgentTraceWriter;
use crate::writer::log::LogTraceWriter;
use crate::writer::TraceWriter;
use crate::ext;
use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

static GLOBAL: Lazy<RwLock<Tracer>> = Lazy::new(|| RwLock::new(Tracer::noop()));

/// Starts a tracer from the configuration and installs it as the process
/// global. The returned handle and the global are interchangeable.
pub fn start(config: Config) -> Tracer {
    let tracer = Tracer::with_config(config);
    *GLOBAL.write().unwrap_or_else(|e| e.into_inner()) = tracer.clone();
    tracer
}

/// Stops the global tracer: flushes buffered traces, joins background
/// loops, and swaps in a no-op instance so in-flight callers observe either
/// the live tracer or the no-op.
pub fn stop() {
    let tracer = std::mem::replace(
        &mut *GLOBAL.write().unwrap_or_else(|e| e.into_inner()),
        Tracer::noop(),
    );
    tracer.shutdown();
}

/// The current global tracer; a no-op instance when none was started.
pub fn global() -> Tracer {
    GLOBAL.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// Flushes the global tracer synchronously.
pub fn flush() {
    global().flush();
}

/// Remote overrides currently shadowing local configuration. `None` means
/// the local value applies.
#[derive(Debug, Default)]
struct RemoteOverrides {
    sample_rate: Option<f64>,
    trace_rules: Option<Vec<SamplingRule>>,
    header_tags: Option<HashMap<String, String>>,
    global_tags: Option<HashMap<String, String>>,
}

pub(crate) struct TracerCore {
    config: Config,
    clock: Arc<dyn Clock>,
    statsd: Arc<dyn StatsdClient>,
    health: Arc<HealthMetrics>,
    propagator: ChainedPropagator,

    priority_sampler: Arc<PrioritySampler>,
    trace_rules: RwLock<Arc<TraceRulesSampler>>,
    span_rules: RwLock<Arc<SpanRulesSampler>>,
    header_tags: RwLock<HashMap<String, String>>,
    global_tags: RwLock<HashMap<String, String>>,

    local_defaults: LocalDefaults,
    remote_overrides: Mutex<RemoteOverrides>,
    /// Remote kill switch; sticky for the life of the tracer.
    kill_switch: AtomicBool,

    submit_tx: Sender<Chunk>,
    flush_tx: Sender<Sender<()>>,
    stop_tx: Mutex<Option<Sender<()>>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,

    abandoned: Option<AbandonedSpanChannels>,
    long_running: Option<Arc<LongRunningTracker>>,
}

/// A handle to a running tracer, or the no-op instance.
#[derive(Clone)]
pub struct Tracer {
    core: Option<Arc<TracerCore>>,
}

impl Tracer {
    /// The inert tracer: spans are no-ops, propagation finds nothing.
    pub fn noop() -> Tracer {
        Tracer { core: None }
    }

    /// Builds and starts a tracer without touching the global.
    pub fn with_config(config: Config) -> Tracer {
        if !config.enabled {
            info!("tracing disabled by configuration");
            return Tracer::noop();
        }
        Tracer {
            core: Some(TracerCore::start(config)),
        }
    }

    /// Starts building a span.
    pub fn span_builder(&self, name: impl Into<String>) -> SpanBuilder {
        SpanBuilder::new(name)
    }

    /// Starts a span with defaults.
    pub fn start_span(&self, name: impl Into<String>) -> Span {
        self.span_builder(name).start(self)
    }

    /// Injects a span context into a carrier using the configured
    /// propagation styles.
    pub fn inject(
        &self,
        context: &SpanContext,
        carrier: &mut dyn Injector,
    ) -> Result<(), PropagationError> {
        match &self.core {
            Some(core) => core.propagator.inject(context, carrier),
            None => Err(PropagationError::NotFound),
        }
    }

    /// Extracts a span context from a carrier using the configured
    /// propagation styles.
    pub fn extract(&self, carrier: &dyn Extractor) -> Result<SpanContext, PropagationError> {
        match &self.core {
            Some(core) => core.propagator.extract(carrier),
            None => Err(PropagationError::NotFound),
        }
    }

    /// Applies an agent-pushed configuration update and reports the
    /// per-path outcome.
    pub fn apply_remote_config(&self, update: ProductUpdate) -> HashMap<String, ApplyStatus> {
        match &self.core {
            Some(core) => core.apply_remote_config(update),
            None => update
                .into_keys()
                .map(|path| (path, ApplyStatus::acknowledged()))
                .collect(),
        }
    }

    /// Forces buffered traces through the writer and waits for the worker
    /// to acknowledge.
    pub fn flush(&self) {
        if let Some(core) = &self.core {
            core.flush_blocking();
        }
    }

    /// Stops this tracer instance. Idempotent.
    pub fn shutdown(&self) {
        if let Some(core) = &self.core {
            core.stop();
        }
    }

    /// The effective header-to-tag mapping, remote override included.
    pub fn header_tag(&self, header: &str) -> Option<String> {
        let core = self.core.as_ref()?;
        let tags = core.header_tags.read().unwrap_or_else(|e| e.into_inner());
        tags.get(&header.to_ascii_lowercase()).cloned()
    }

    pub(crate) fn core(&self) -> Option<&Arc<TracerCore>> {
        self.core.as_ref()
    }

    fn start_span_from(&self, builder: SpanBuilder) -> Span {
        match &self.core {
            Some(core) => core.start_span(builder),
            None => Span::noop(),
        }
    }
}

impl std::fmt::Debug for Tracer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.core {
            Some(core) => f
                .debug_struct("Tracer")
                .field("service", &core.config.service)
                .finish_non_exhaustive(),
            None => f.write_str("Tracer(noop)"),
        }
    }
}

impl TracerCore {
    fn start(config: Config) -> Arc<TracerCore> {
        let clock = config.clock.clone().unwrap_or_else(clock::system);
        let statsd: Arc<dyn StatsdClient> = config
            .statsd
            .clone()
            .unwrap_or_else(|| Arc::new(NoopStatsdClient));
        let health = Arc::new(HealthMetrics::new());
        let priority_sampler = Arc::new(PrioritySampler::new());
        let local_defaults = LocalDefaults::from_config(&config);

        let trace_rules = Arc::new(TraceRulesSampler::new(
            config.trace_rules.clone(),
            config.global_sample_rate,
            config.rate_limit,
        ));
        let span_rules = Arc::new(SpanRulesSampler::new(config.span_rules.clone()));
        let propagator = ChainedPropagator::from_config(&config);

        let (submit_tx, submit_rx) = bounded::<Chunk>(config.payload_queue_size);
        let (flush_tx, flush_rx) = bounded::<Sender<()>>(4);
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let (writer, long_running_supported) =
            build_writer(&config, priority_sampler.clone(), health.clone());

        let long_running = if config.long_running_enabled {
            if long_running_supported {
                Some(Arc::new(LongRunningTracker::new(config.heartbeat_interval)))
            } else {
                info!("long-running span tracking disabled: agent does not advertise support");
                None
            }
        } else {
            None
        };

        let mut threads = Vec::new();
        let mut abandoned = None;
        if let Some(timeout) = config.abandoned_timeout {
            let (channels, handle) = abandoned::spawn(
                timeout,
                config.abandoned_log_size,
                clock.clone(),
                stop_rx.clone(),
            );
            abandoned = Some(channels);
            threads.push(handle);
        }

        info!(
            service = %config.service,
            env = %config.env,
            version = %config.version,
            agent_url = %config.agent_url,
            api_version = ?config.api_version,
            sample_rate = ?config.global_sample_rate,
            sample_rate_origin = ?config.sample_rate_origin,
            trace_rules = config.trace_rules.len(),
            span_rules = config.span_rules.len(),
            "tracer started"
        );

        let core = Arc::new(TracerCore {
            config,
            clock,
            statsd,
            health,
            propagator,
            priority_sampler,
            trace_rules: RwLock::new(trace_rules),
            span_rules: RwLock::new(span_rules),
            header_tags: RwLock::new(local_defaults.header_tags.clone()),
            global_tags: RwLock::new(local_defaults.global_tags.clone()),
            local_defaults,
            remote_overrides: Mutex::new(RemoteOverrides::default()),
            kill_switch: AtomicBool::new(false),
            submit_tx,
            flush_tx,
            stop_tx: Mutex::new(Some(stop_tx)),
            threads: Mutex::new(threads),
            stopped: AtomicBool::new(false),
            abandoned,
            long_running: long_running.clone(),
        });

        let worker = {
            let core = core.clone();
            let stop_rx = stop_rx.clone();
            std::thread::Builder::new()
                .name("dd-trace-worker".to_string())
                .spawn(move || worker_loop(core, writer, submit_rx, flush_rx, stop_rx))
                .expect("spawning tracer worker")
        };
        core.threads.lock().unwrap_or_else(|e| e.into_inner()).push(worker);

        if let Some(tracker) = long_running {
            let clock = core.clock.clone();
            let submit_tx = core.submit_tx.clone();
            let handle = std::thread::Builder::new()
                .name("dd-trace-long-running".to_string())
                .spawn(move || {
                    let ticker = tick(tracker.heartbeat());
                    loop {
                        select! {
                            recv(ticker) -> _ => {
                                for chunk in tracker.tick(clock.now()) {
                                    let _ = submit_tx.try_send(chunk);
                                }
                            }
                            recv(stop_rx) -> _ => return,
                        }
                    }
                })
                .expect("spawning long-running tracker");
            core.threads
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(handle);
        }

        core
    }

    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn start_span(self: &Arc<Self>, builder: SpanBuilder) -> Span {
        if self.kill_switch.load(Ordering::Relaxed) || self.stopped.load(Ordering::Relaxed) {
            return Span::noop();
        }
        let now = builder.start_ns.unwrap_or_else(|| self.clock.now());

        let parent = builder
            .child_of
            .filter(|ctx| !ctx.trace_id().is_zero() || ctx.span_id() != 0);
        let baggage_parent = builder.baggage_parent;

        let (trace, trace_id, parent_id, origin, baggage, is_local_root) = match &parent {
            Some(ctx) if !ctx.trace_id().is_zero() => (
                ctx.trace().clone(),
                ctx.trace_id(),
                ctx.span_id(),
                ctx.origin().to_string(),
                ctx.baggage_snapshot(),
                ctx.inner.is_remote,
            ),
            _ => {
                let trace_id = ids::new_trace_id(now, self.config.trace_128_bit);
                let trace = Trace::new();
                if trace_id.upper() != 0 {
                    trace.set_propagating_tag(
                        keys::TRACE_ID_UPPER,
                        format!("{:016x}", trace_id.upper()),
                    );
                }
                let baggage = baggage_parent
                    .as_ref()
                    .map(|ctx| ctx.baggage_snapshot())
                    .unwrap_or_else(Baggage::new);
                (trace, trace_id, 0, String::new(), baggage, true)
            }
        };

        let span_id = ids::new_span_id();
        let name = builder.name;
        let service = builder.service.unwrap_or_else(|| self.config.service.clone());
        let resource = builder.resource.unwrap_or_else(|| name.clone());
        let integration = builder.integration.unwrap_or_else(|| "manual".to_string());

        let mut meta = HashMap::new();
        {
            let tags = self.global_tags.read().unwrap_or_else(|e| e.into_inner());
            for (key, value) in tags.iter() {
                meta.insert(key.clone(), value.clone());
            }
        }
        if !self.config.env.is_empty() {
            meta.insert("env".to_string(), self.config.env.clone());
        }
        if !self.config.version.is_empty() {
            meta.insert("version".to_string(), self.config.version.clone());
        }

        let fields = SpanFields {
            name,
            service,
            resource,
            span_type: builder.span_type.unwrap_or_default(),
            span_id,
            trace_id,
            parent_id,
            start: now,
            meta,
            span_links: builder.links,
            integration: integration.clone(),
            ..SpanFields::default()
        };
        let inner = Arc::new(SpanInner::new(fields));

        let deadline_parent = builder
            .deadline_parent
            .or_else(|| parent.clone().map(|ctx| Arc::new(ctx) as Arc<dyn DeadlineContext>));
        let context = SpanContext::from_inner(ContextInner {
            trace_id,
            span_id,
            trace: trace.clone(),
            origin,
            is_remote: false,
            baggage: RwLock::new(baggage),
            tracer: Arc::downgrade(self),
            parent: deadline_parent,
        });
        inner.bind_context(&context);
        let span = Span {
            inner: inner.clone(),
            context,
        };

        match trace.push(inner.clone(), self.config.trace_max_size) {
            Ok(()) => inner.with_fields_mut(|f| f.buffered = true),
            Err(error) => {
                warn!(%error, "trace exceeds maximum size, span will not be reported");
                self.health.trace_dropped("trace_too_large");
            }
        }

        for (key, value) in builder.tags {
            span.set_tag(&key, value);
        }
        if is_local_root && trace.priority().is_none() {
            self.sample_root(&span, now);
        }

        self.health.span_started(&integration);
        if let Some(channels) = &self.abandoned {
            if channels
                .in_tx
                .try_send(TrackedSpan::from_span(&inner))
                .is_err()
            {
                self.health.tracker_event_dropped();
            }
        }
        if let Some(tracker) = &self.long_running {
            tracker.track(&span);
        }

        span
    }

    /// Runs the root sampling path: trace rules first, then the agent rate
    /// table.
    fn sample_root(&self, span: &Span, now: i64) {
        let rules = self
            .trace_rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let decision = span.inner.with_fields(|f| {
            let lookup = |key: &str| {
                f.meta
                    .get(key)
                    .cloned()
                    .or_else(|| f.metrics.get(key).map(|v| v.to_string()))
            };
            let target = RuleTarget {
                service: &f.service,
                name: &f.name,
                resource: &f.resource,
                tag_lookup: &lookup,
            };
            rules.sample(&target, f.trace_id.lower(), now)
        });

        if let Some(decision) = decision {
            span.inner.with_fields_mut(|f| {
                f.metrics
                    .insert(keys::RULES_SAMPLER_APPLIED_RATE.to_string(), decision.rate);
                if let Some(rate) = decision.limiter_rate {
                    f.metrics
                        .insert(keys::RULES_SAMPLER_LIMITER_RATE.to_string(), rate);
                }
            });
            let priority = if decision.keep {
                ext::priority::USER_KEEP
            } else {
                ext::priority::USER_REJECT
            };
            span.context
                .trace()
                .set_sampling_priority(priority as f64, Some(decision.mechanism), false);
            return;
        }

        let decision = span.inner.with_fields(|f| {
            self.priority_sampler
                .sample(&f.service, &self.config.env, f.trace_id.lower())
        });
        span.inner.with_fields_mut(|f| {
            f.metrics
                .insert(keys::PRIORITY_SAMPLER_RATE.to_string(), decision.rate);
        });
        let priority = if decision.keep {
            ext::priority::AUTO_KEEP
        } else {
            ext::priority::AUTO_REJECT
        };
        span.context
            .trace()
            .set_sampling_priority(priority as f64, Some(decision.mechanism), false);
    }

    /// Called by `Span::finish` once per span, after the span marked itself
    /// finished.
    pub(crate) fn finish_span(self: &Arc<Self>, span: &Span) {
        let (integration, buffered, span_id) = span
            .inner
            .with_fields(|f| (f.integration.clone(), f.buffered, f.span_id));
        self.health.span_finished(&integration);

        if let Some(channels) = &self.abandoned {
            if channels.out_tx.try_send(span_id).is_err() {
                self.health.tracker_event_dropped();
            }
        }
        if let Some(tracker) = &self.long_running {
            tracker.untrack(span_id);
        }
        if !buffered {
            return;
        }

        let trace = span.context.trace();
        let action = trace.finished_one(
            self.config.partial_flush_enabled,
            self.config.partial_flush_min_spans,
        );
        match action {
            FinishAction::None => {}
            FinishAction::Flush(spans) => {
                self.submit_chunk(self.build_chunk(spans, &span.context, ChunkKind::Finished));
            }
            FinishAction::Partial(spans) => {
                self.health.record_partial_flush(spans.len(), trace.len());
                self.submit_chunk(self.build_chunk(spans, &span.context, ChunkKind::Partial));
            }
        }
    }

    /// Assembles a chunk: stamps the priority, decision tags and origin,
    /// and gives single-span rules a chance to rescue spans of dropped
    /// traces.
    fn build_chunk(
        &self,
        spans: Vec<Arc<SpanInner>>,
        context: &SpanContext,
        kind: ChunkKind,
    ) -> Chunk {
        let trace = context.trace();
        let priority = trace.priority();
        let mechanism = trace.mechanism();
        let origin = context.origin().to_string();
        let trace_id = spans
            .first()
            .map(|s| s.with_fields(|f| f.trace_id))
            .unwrap_or_else(|| context.trace_id());

        if let Some(first) = spans.first() {
            let propagating = trace.propagating_tags();
            let trace_tags = trace.tags();
            first.with_fields_mut(|f| {
                if let Some(priority) = priority {
                    f.metrics
                        .insert(keys::SAMPLING_PRIORITY.to_string(), priority as f64);
                }
                for (key, value) in propagating {
                    if key.starts_with(keys::PROPAGATED_PREFIX) {
                        f.meta.insert(key, value);
                    }
                }
                for (key, value) in trace_tags {
                    f.meta.insert(key, value);
                }
            });
        }
        if !origin.is_empty() {
            for span in &spans {
                span.with_fields_mut(|f| {
                    f.meta.insert(keys::ORIGIN.to_string(), origin.clone());
                });
            }
        }

        let dropped = priority.unwrap_or(0) <= 0;
        if dropped {
            self.sample_single_spans(&spans);
        }

        Chunk {
            spans,
            trace_id,
            origin,
            priority,
            mechanism,
            dropped,
            kind,
        }
    }

    /// Applies single-span rules to the spans of a dropped trace, stamping
    /// keep markers the agent honors span by span.
    fn sample_single_spans(&self, spans: &[Arc<SpanInner>]) {
        let rules = self
            .span_rules
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if rules.is_empty() {
            return;
        }
        let now = self.clock.now();
        for span in spans {
            let decision = span.with_fields(|f| {
                let lookup = |key: &str| {
                    f.meta
                        .get(key)
                        .cloned()
                        .or_else(|| f.metrics.get(key).map(|v| v.to_string()))
                };
                let target = RuleTarget {
                    service: &f.service,
                    name: &f.name,
                    resource: &f.resource,
                    tag_lookup: &lookup,
                };
                rules.sample(&target, f.span_id, now)
            });
            if let Some(decision) = decision {
                span.with_fields_mut(|f| {
                    f.metrics.insert(
                        keys::SPAN_SAMPLING_MECHANISM.to_string(),
                        mechanism::SINGLE_SPAN as f64,
                    );
                    f.metrics
                        .insert(keys::SPAN_SAMPLING_RULE_RATE.to_string(), decision.rate);
                    if let Some(mps) = decision.max_per_second {
                        f.metrics.insert(keys::SPAN_SAMPLING_MPS.to_string(), mps);
                    }
                });
            }
        }
    }

    fn submit_chunk(&self, chunk: Chunk) {
        if self.submit_tx.try_send(chunk).is_err() {
            debug!("payload queue full, dropping trace chunk");
            self.health.trace_dropped("payload_queue_full");
        }
    }

    fn flush_blocking(&self) {
        let (ack_tx, ack_rx) = bounded(1);
        if self.flush_tx.send(ack_tx).is_ok() {
            let _ = ack_rx.recv_timeout(std::time::Duration::from_secs(5));
        }
    }

    fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Closing the stop channel fans out to every background loop.
        drop(
            self.stop_tx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take(),
        );
        let threads = std::mem::take(
            &mut *self.threads.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for handle in threads {
            let _ = handle.join();
        }
        self.statsd.close();
    }

    fn apply_remote_config(&self, update: ProductUpdate) -> HashMap<String, ApplyStatus> {
        let mut statuses = HashMap::new();
        for (path, body) in update {
            let status = match body {
                None => {
                    self.apply_lib_config(LibConfig::default());
                    ApplyStatus::acknowledged()
                }
                Some(raw) => match remoteconfig::parse_payload(&raw) {
                    Err(error) => ApplyStatus::error(error.to_string()),
                    Ok(payload) => {
                        let applies = payload
                            .service_target
                            .map(|t| t.matches(&self.config.service, &self.config.env))
                            .unwrap_or(true);
                        if applies {
                            self.apply_lib_config(payload.lib_config);
                        }
                        ApplyStatus::acknowledged()
                    }
                },
            };
            if status.state == crate::remoteconfig::ApplyState::Error {
                error!(path = %path, error = %status.error, "remote config update rejected");
            }
            statuses.insert(path, status);
        }
        statuses
    }

    /// Installs the override set carried by one update. Fields absent from
    /// the update revert to their locally configured values.
    fn apply_lib_config(&self, lib: LibConfig) {
        if lib.is_empty() {
            debug!("remote configuration cleared, restoring local values");
        }
        if lib.tracing_enabled == Some(false) {
            if !self.kill_switch.swap(true, Ordering::SeqCst) {
                warn!("tracing disabled by remote configuration for the rest of the session");
            }
        }

        {
            let mut overrides = self
                .remote_overrides
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            overrides.sample_rate = lib.tracing_sampling_rate;
            overrides.trace_rules = lib.tracing_sampling_rules;
            overrides.header_tags = lib.tracing_header_tags.map(|tags| {
                tags.into_iter()
                    .map(|t| (t.header.to_ascii_lowercase(), t.tag_name))
                    .collect()
            });
            overrides.global_tags = lib
                .tracing_tags
                .map(|tags| remoteconfig::parse_tag_entries(&tags));
            self.rebuild_from_overrides(&overrides);
        }
    }

    fn rebuild_from_overrides(&self, overrides: &RemoteOverrides) {
        let rules = overrides
            .trace_rules
            .clone()
            .unwrap_or_else(|| self.local_defaults.trace_rules.clone());
        let rate = overrides.sample_rate.or(self.local_defaults.sample_rate);
        *self.trace_rules.write().unwrap_or_else(|e| e.into_inner()) = Arc::new(
            TraceRulesSampler::new(rules, rate, self.config.rate_limit),
        );

        *self.header_tags.write().unwrap_or_else(|e| e.into_inner()) = overrides
            .header_tags
            .clone()
            .unwrap_or_else(|| self.local_defaults.header_tags.clone());
        *self.global_tags.write().unwrap_or_else(|e| e.into_inner()) = overrides
            .global_tags
            .clone()
            .unwrap_or_else(|| self.local_defaults.global_tags.clone());
    }

    /// Origin of the effective sample rate, for configuration telemetry.
    pub(crate) fn sample_rate_origin(&self) -> ConfigOrigin {
        let overrides = self
            .remote_overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if overrides.sample_rate.is_some() {
            ConfigOrigin::Remote
        } else {
            self.local_defaults.sample_rate_origin
        }
    }
}

/// Builds the configured writer. Returns whether long-running span support
/// may be enabled, which requires the agent to advertise it.
fn build_writer(
    config: &Config,
    priority_sampler: Arc<PrioritySampler>,
    health: Arc<HealthMetrics>,
) -> (Box<dyn TraceWriter>, bool) {
    let log_writer = config
        .log_writer
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .take();
    if let Some(out) = log_writer {
        return (Box::new(LogTraceWriter::new(out, health)), true);
    }

    let client: Option<Arc<dyn crate::transport::HttpClient>> = match &config.http_client {
        Some(client) => Some(client.clone()),
        None => {
            #[cfg(feature = "reqwest-blocking-client")]
            {
                Some(Arc::new(crate::transport::ReqwestBlockingClient::default()))
            }
            #[cfg(not(feature = "reqwest-blocking-client"))]
            {
                None
            }
        }
    };
    let Some(client) = client else {
        warn!("no HTTP client available, falling back to log output");
        return (
            Box::new(LogTraceWriter::new(Box::new(std::io::stdout()), health)),
            true,
        );
    };

    let transport = Transport::new(config, client);
    // The /info probe is only worth a round trip when the feature that
    // depends on it was requested.
    let long_running_supported = config.long_running_enabled
        && match transport.agent_info() {
            Ok(info) => info.supports_long_running(),
            Err(error) => {
                debug!(%error, "agent /info unavailable");
                false
            }
        };
    let writer = AgentTraceWriter::new(config, transport, priority_sampler, health);
    (Box::new(writer), long_running_supported)
}

/// The worker loop: owns the writer, applies post-processing and drives
/// scheduled flushes and health reports.
fn worker_loop(
    core: Arc<TracerCore>,
    mut writer: Box<dyn TraceWriter>,
    submit_rx: Receiver<Chunk>,
    flush_rx: Receiver<Sender<()>>,
    stop_rx: Receiver<()>,
) {
    let flush_tick = tick(core.config.flush_interval);
    let health_tick = tick(core.config.health_interval);
    loop {
        select! {
            recv(submit_rx) -> msg => match msg {
                Ok(chunk) => {
                    if let Some(chunk) = post_process(&core, chunk) {
                        writer.add(&chunk);
                    }
                }
                Err(_) => break,
            },
            recv(flush_rx) -> msg => {
                if let Ok(ack) = msg {
                    while let Ok(chunk) = submit_rx.try_recv() {
                        if let Some(chunk) = post_process(&core, chunk) {
                            writer.add(&chunk);
                        }
                    }
                    writer.flush();
                    let _ = ack.send(());
                }
            },
            recv(flush_tick) -> _ => writer.flush(),
            recv(health_tick) -> _ => {
                core.health.report(core.statsd.as_ref(), submit_rx.len());
            }
            recv(stop_rx) -> _ => {
                while let Ok(chunk) = submit_rx.try_recv() {
                    if let Some(chunk) = post_process(&core, chunk) {
                        writer.add(&chunk);
                    }
                }
                writer.stop();
                core.health.report(core.statsd.as_ref(), 0);
                return;
            }
        }
    }
    // The submit channel closed without a stop signal; settle the writer.
    writer.stop();
}

/// Runs the registered post-processor over a chunk's spans. A panicking
/// processor is caught and the chunk continues; returning `false` drops the
/// whole chunk.
fn post_process(core: &Arc<TracerCore>, chunk: Chunk) -> Option<Chunk> {
    if chunk.kind == ChunkKind::Heartbeat {
        return Some(chunk);
    }
    let Some(processor) = core.config.post_processor.clone() else {
        return Some(chunk);
    };
    let mut views: Vec<ReadWriteSpan> = chunk
        .spans
        .iter()
        .map(|inner| ReadWriteSpan {
            inner: inner.clone(),
        })
        .collect();
    let processor: Arc<PostProcessor> = processor;
    match catch_unwind(AssertUnwindSafe(|| processor(&mut views))) {
        Ok(true) => Some(chunk),
        Ok(false) => {
            core.health.trace_dropped("post_processor");
            None
        }
        Err(_) => {
            error!("span post-processor panicked; keeping trace");
            Some(chunk)
        }
    }
}

/// Configures and starts a span.
pub struct SpanBuilder {
    name: String,
    service: Option<String>,
    resource: Option<String>,
    span_type: Option<String>,
    integration: Option<String>,
    start_ns: Option<i64>,
    child_of: Option<SpanContext>,
    baggage_parent: Option<SpanContext>,
    deadline_parent: Option<Arc<dyn DeadlineContext>>,
    tags: Vec<(String, TagValue)>,
    links: Vec<SpanLink>,
}

impl SpanBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        SpanBuilder {
            name: name.into(),
            service: None,
            resource: None,
            span_type: None,
            integration: None,
            start_ns: None,
            child_of: None,
            baggage_parent: None,
            deadline_parent: None,
            tags: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Makes the span a child of the given context, local or extracted. A
    /// baggage-only context (zero ids) starts a new root that inherits the
    /// baggage.
    pub fn child_of(mut self, context: SpanContext) -> Self {
        if context.trace_id().is_zero() {
            self.baggage_parent = Some(context);
        } else {
            self.child_of = Some(context);
        }
        self
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_span_type(mut self, span_type: impl Into<String>) -> Self {
        self.span_type = Some(span_type.into());
        self
    }

    /// Names the integration that created the span, for health metrics.
    pub fn with_integration(mut self, integration: impl Into<String>) -> Self {
        self.integration = Some(integration.into());
        self
    }

    pub fn with_start_time_ns(mut self, start_ns: i64) -> Self {
        self.start_ns = Some(start_ns);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        self.tags.push((key.into(), value.into()));
        self
    }

    pub fn with_link(mut self, link: SpanLink) -> Self {
        self.links.push(link);
        self
    }

    /// Attaches a deadline/cancellation context the span context delegates
    /// to.
    pub fn with_deadline_context(mut self, context: Arc<dyn DeadlineContext>) -> Self {
        self.deadline_parent = Some(context);
        self
    }

    pub fn start(self, tracer: &Tracer) -> Span {
        tracer.start_span_from(self)
    }
}
