//! Token-bucket rate limiting for sampling rules.

use std::sync::Mutex;

const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// A token bucket with a burst of `ceil(limit)` tokens refilled at `limit`
/// tokens per second. Besides the keep/drop decision it reports an effective
/// rate, the fraction of allowed decisions over the previous and current
/// one-second windows, which samplers attach to spans so the backend can
/// upscale counts.
#[derive(Debug)]
pub(crate) struct RateLimiter {
    limit: f64,
    burst: f64,
    state: Mutex<State>,
}

#[derive(Debug)]
struct State {
    tokens: f64,
    last_ns: i64,
    window_start_ns: i64,
    allowed: f64,
    seen: f64,
    prev_allowed: f64,
    prev_seen: f64,
}

impl RateLimiter {
    pub(crate) fn new(limit: f64) -> Self {
        let burst = limit.max(0.0).ceil();
        RateLimiter {
            limit: limit.max(0.0),
            burst,
            state: Mutex::new(State {
                tokens: burst,
                last_ns: 0,
                window_start_ns: 0,
                allowed: 0.0,
                seen: 0.0,
                prev_allowed: 0.0,
                prev_seen: 0.0,
            }),
        }
    }

    pub(crate) fn limit(&self) -> f64 {
        self.limit
    }

    /// Takes one token if available. Returns the decision and the effective
    /// rate observed so far.
    pub(crate) fn allow(&self, now_ns: i64) -> (bool, f64) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        if state.last_ns == 0 {
            state.last_ns = now_ns;
            state.window_start_ns = now_ns;
        }
        if now_ns - state.window_start_ns >= NANOS_PER_SECOND {
            state.prev_allowed = state.allowed;
            state.prev_seen = state.seen;
            state.allowed = 0.0;
            state.seen = 0.0;
            state.window_start_ns = now_ns;
        }

        let elapsed = (now_ns - state.last_ns).max(0) as f64 / NANOS_PER_SECOND as f64;
        state.tokens = (state.tokens + elapsed * self.limit).min(self.burst);
        state.last_ns = now_ns;

        state.seen += 1.0;
        let allowed = state.tokens >= 1.0;
        if allowed {
            state.tokens -= 1.0;
            state.allowed += 1.0;
        }

        let total_seen = state.prev_seen + state.seen;
        let rate = if total_seen > 0.0 {
            (state.prev_allowed + state.allowed) / total_seen
        } else {
            1.0
        };
        (allowed, rate)
    }
}
