//! The agent trace writer: payload buffering, bounded concurrent sends,
//! retries and protocol downgrade.

use super::TraceWriter;
use crate::config::{ApiVersion, Config};
use crate::encoding::{new_payload, Payload, PayloadMeta};
use crate::health::HealthMetrics;
use crate::sampling::PrioritySampler;
use crate::trace::Chunk;
use crate::transport::Transport;
use crossbeam_channel::{Receiver, Sender};
use crossbeam_utils::sync::WaitGroup;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Shared state the sender threads work against.
pub(crate) struct SenderState {
    transport: Transport,
    priority_sampler: Arc<PrioritySampler>,
    health: Arc<HealthMetrics>,
    /// Current protocol; flips from v1.0 to v0.4 on downgrade.
    api_version: Mutex<ApiVersion>,
    /// A v0.4 agent that rejects the endpoint falls back to the v0.3 path.
    legacy_path: AtomicBool,
    downgrade_logged: AtomicBool,
    send_retries: u32,
    retry_interval: Duration,
    // Semaphore bounding concurrent sends: a slot is held while a send
    // thread runs.
    climit_tx: Sender<()>,
    climit_rx: Receiver<()>,
}

impl SenderState {
    fn current_version(&self) -> ApiVersion {
        *self.api_version.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn endpoint_path(&self, version: ApiVersion) -> &'static str {
        if version == ApiVersion::Version04 && self.legacy_path.load(Ordering::Relaxed) {
            "/v0.3/traces"
        } else {
            version.path()
        }
    }

    fn log_downgrade_once(&self, from: &str, to: &str) {
        if !self.downgrade_logged.swap(true, Ordering::Relaxed) {
            warn!(from, to, "agent rejected endpoint, downgrading API");
        }
    }
}

/// Buffers chunks into a payload and ships payloads to the agent from a
/// bounded pool of sender threads.
pub(crate) struct AgentTraceWriter {
    payload: Box<dyn Payload>,
    /// Protocol the current payload was encoded with; may lag behind the
    /// sender state's version right after a downgrade.
    payload_version: ApiVersion,
    meta: PayloadMeta,
    state: Arc<SenderState>,
    wg: Option<WaitGroup>,
    payload_size_limit: usize,
    health: Arc<HealthMetrics>,
}

impl AgentTraceWriter {
    pub(crate) fn new(
        config: &Config,
        transport: Transport,
        priority_sampler: Arc<PrioritySampler>,
        health: Arc<HealthMetrics>,
    ) -> Self {
        let (climit_tx, climit_rx) =
            crossbeam_channel::bounded(config.concurrent_connection_limit.max(1));
        let meta = PayloadMeta::from_config(config);
        let state = Arc::new(SenderState {
            transport,
            priority_sampler,
            health: health.clone(),
            api_version: Mutex::new(config.api_version),
            legacy_path: AtomicBool::new(false),
            downgrade_logged: AtomicBool::new(false),
            send_retries: config.send_retries,
            retry_interval: config.retry_interval,
            climit_tx,
            climit_rx,
        });
        AgentTraceWriter {
            payload: new_payload(config.api_version, &meta),
            payload_version: config.api_version,
            meta,
            state,
            wg: Some(WaitGroup::new()),
            payload_size_limit: config.payload_size_limit,
            health,
        }
    }

    fn flush_with_reason(&mut self, reason: &'static str) {
        if self.payload.count() == 0 {
            return;
        }
        let version = self.payload_version;
        let next_version = self.state.current_version();
        let payload = std::mem::replace(&mut self.payload, new_payload(next_version, &self.meta));
        self.payload_version = next_version;
        debug!(
            traces = payload.count(),
            bytes = payload.size(),
            reason,
            "flushing payload"
        );

        let state = self.state.clone();
        let guard = self.wg.as_ref().map(WaitGroup::clone);
        // Take a semaphore slot before spawning so at most
        // `concurrent_connection_limit` sender threads exist at once.
        let _ = state.climit_tx.send(());
        thread::spawn(move || {
            send_payload(&state, payload, version);
            let _ = state.climit_rx.try_recv();
            drop(guard);
        });
    }
}

impl TraceWriter for AgentTraceWriter {
    fn add(&mut self, chunk: &Chunk) {
        // An empty buffer encoded for a protocol the agent just rejected is
        // rebuilt for the downgraded one.
        let current = self.state.current_version();
        if self.payload_version != current && self.payload.count() == 0 {
            self.payload = new_payload(current, &self.meta);
            self.payload_version = current;
        }
        if let Err(error) = self.payload.push(chunk) {
            error!(%error, "dropping trace chunk that failed to encode");
            self.health.trace_dropped("encoding_error");
            return;
        }
        if self.payload.size() > self.payload_size_limit {
            self.flush_with_reason("size");
        }
    }

    fn flush(&mut self) {
        self.flush_with_reason("scheduled");
    }

    fn stop(&mut self) {
        self.flush_with_reason("shutdown");
        if let Some(wg) = self.wg.take() {
            wg.wait();
            self.wg = Some(WaitGroup::new());
        }
    }
}

/// Runs the attempt loop for one payload: up to `1 + send_retries`
/// transmissions of byte-identical bodies, with a one-shot downgrade on 404
/// or 415.
fn send_payload(state: &SenderState, mut payload: Box<dyn Payload>, version: ApiVersion) {
    let count = payload.count();
    let mut attempts_left = state.send_retries + 1;
    loop {
        payload.reset();
        let mut body = Vec::with_capacity(payload.size());
        if payload.read_to_end(&mut body).is_err() {
            state.health.traces_dropped_n("encoding_error", count);
            payload.clear();
            return;
        }
        let bytes = body.len();
        let path = state.endpoint_path(version);

        match state
            .transport
            .send_traces(path, version.content_type(), body, count)
        {
            Ok(rates) => {
                state.health.record_flush(count, bytes);
                if let Err(error) = state.priority_sampler.update_rates(&rates) {
                    debug!(%error, "ignoring malformed rates response");
                }
                payload.clear();
                return;
            }
            Err(error) if error.is_downgrade() => match version {
                ApiVersion::Version10 => {
                    // The buffered bytes cannot be re-encoded for the older
                    // protocol; subsequent payloads use it.
                    state.log_downgrade_once("/v1.0/traces", "/v0.4/traces");
                    *state.api_version.lock().unwrap_or_else(|e| e.into_inner()) =
                        ApiVersion::Version04;
                    state.health.traces_dropped_n("send_failed", count);
                    payload.clear();
                    return;
                }
                ApiVersion::Version04 => {
                    if state.legacy_path.swap(true, Ordering::Relaxed) {
                        // Already on the oldest path; treat as a plain failure.
                        attempts_left -= 1;
                        if attempts_left == 0 {
                            error!(%error, traces = count, "dropping payload after failed sends");
                            state.health.traces_dropped_n("send_failed", count);
                            payload.clear();
                            return;
                        }
                        thread::sleep(state.retry_interval);
                    } else {
                        state.log_downgrade_once("/v0.4/traces", "/v0.3/traces");
                    }
                }
            },
            Err(error) => {
                attempts_left -= 1;
                if attempts_left == 0 {
                    error!(%error, traces = count, "dropping payload after failed sends");
                    state.health.traces_dropped_n("send_failed", count);
                    payload.clear();
                    return;
                }
                thread::sleep(state.retry_interval);
            }
        }
    }
}
