//! The layered sampling pipeline.
//!
//! A trace's keep/drop decision is made by the first layer that claims it:
//! the agent-fed priority sampler for plain root spans, user or remote rules
//! when one matches, manual `manual.keep`/`manual.drop` overrides, and
//! per-span rules that can rescue individual spans from dropped traces. Each
//! layer records which mechanism decided so the backend can attribute the
//! decision.

mod glob;
mod limiter;
mod rules;

pub use rules::{Provenance, SamplingRule};

pub(crate) use rules::{parse_rules, RuleTarget, SpanRulesSampler, TraceRulesSampler};

use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;

/// Sampling mechanisms reported through the `_dd.p.dm` propagating tag.
pub(crate) mod mechanism {
    /// No sampler configured; the hard-coded default rate applied.
    pub const DEFAULT: u32 = 0;
    /// The per-service rate table returned by the agent applied.
    pub const AGENT_RATE: u32 = 1;
    /// A locally configured trace sampling rule applied.
    pub const RULE_RATE: u32 = 3;
    /// A manual keep/drop override applied.
    pub const MANUAL: u32 = 4;
    /// A single-span sampling rule kept the span.
    pub const SINGLE_SPAN: u32 = 8;
    /// A remote rule authored by the customer applied.
    pub const REMOTE_USER_RULE: u32 = 11;
    /// A remote rule computed without user involvement applied.
    pub const REMOTE_DYNAMIC_RULE: u32 = 12;
}

const KNUTH_FACTOR: u64 = 1111111111111111111;

/// Deterministic keep decision for an id at the given rate: the same id at
/// the same rate always produces the same answer, on any host.
pub(crate) fn sampled_by_rate(id: u64, rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    id.wrapping_mul(KNUTH_FACTOR) <= (rate * u64::MAX as f64) as u64
}

/// Formats the decision-maker tag value for a mechanism.
pub(crate) fn decision_maker(mechanism: u32) -> String {
    format!("-{mechanism}")
}

#[derive(Debug, Deserialize)]
struct RatesPayload {
    rate_by_service: HashMap<String, f64>,
}

/// Keep-rate table keyed by `service:<svc>,env:<env>`, kept current from the
/// rates returned in the agent's flush responses. Missing entries keep at
/// the default rate of 1.
#[derive(Debug)]
pub(crate) struct PrioritySampler {
    rates: RwLock<HashMap<String, f64>>,
}

/// The priority sampler's verdict for a root span.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct PriorityDecision {
    pub rate: f64,
    pub keep: bool,
    pub mechanism: u32,
}

impl PrioritySampler {
    pub(crate) fn new() -> Self {
        PrioritySampler {
            rates: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) fn sample(&self, service: &str, env: &str, trace_id_lower: u64) -> PriorityDecision {
        let key = rate_key(service, env);
        let rates = self.rates.read().unwrap_or_else(|e| e.into_inner());
        let (rate, mechanism) = match rates.get(&key) {
            Some(rate) => (*rate, mechanism::AGENT_RATE),
            None => (1.0, mechanism::DEFAULT),
        };
        PriorityDecision {
            rate,
            keep: sampled_by_rate(trace_id_lower, rate),
            mechanism,
        }
    }

    /// Ingests a `{"rate_by_service": {...}}` response body, replacing the
    /// table wholesale.
    pub(crate) fn update_rates(&self, body: &[u8]) -> Result<(), serde_json::Error> {
        let payload: RatesPayload = serde_json::from_slice(body)?;
        let mut rates = self.rates.write().unwrap_or_else(|e| e.into_inner());
        *rates = payload.rate_by_service;
        Ok(())
    }
}

fn rate_key(service: &str, env: &str) -> String {
    format!("service:{service},env:{env}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_decision_is_deterministic() {
        for rate in [0.1, 0.5, 0.9] {
            for id in [1u64, 42, u64::MAX / 2, u64::MAX - 1] {
                let first = sampled_by_rate(id, rate);
                for _ in 0..10 {
                    assert_eq!(sampled_by_rate(id, rate), first);
                }
            }
        }
    }

    #[test]
    fn rate_extremes() {
        assert!(sampled_by_rate(123, 1.0));
        assert!(sampled_by_rate(123, 2.0));
        assert!(!sampled_by_rate(123, 0.0));
        assert!(!sampled_by_rate(123, -1.0));
    }

    #[test]
    fn rate_roughly_proportional() {
        let kept = (1..=10_000u64)
            .map(|id| id.wrapping_mul(0x9e3779b97f4a7c15))
            .filter(|id| sampled_by_rate(*id, 0.5))
            .count();
        assert!((4_500..=5_500).contains(&kept), "kept {kept} of 10000");
    }

    #[test]
    fn priority_sampler_defaults_to_keep() {
        let sampler = PrioritySampler::new();
        let decision = sampler.sample("web", "prod", 7);
        assert!(decision.keep);
        assert_eq!(decision.rate, 1.0);
        assert_eq!(decision.mechanism, mechanism::DEFAULT);
    }

    #[test]
    fn priority_sampler_applies_agent_rates() {
        let sampler = PrioritySampler::new();
        sampler
            .update_rates(br#"{"rate_by_service":{"service:web,env:prod":0.0,"service:db,env:prod":1.0}}"#)
            .unwrap();

        let decision = sampler.sample("web", "prod", 7);
        assert!(!decision.keep);
        assert_eq!(decision.rate, 0.0);
        assert_eq!(decision.mechanism, mechanism::AGENT_RATE);

        let decision = sampler.sample("db", "prod", 7);
        assert!(decision.keep);
        assert_eq!(decision.mechanism, mechanism::AGENT_RATE);

        // Unlisted services fall back to the default rate.
        assert!(sampler.sample("cache", "prod", 7).keep);
    }

    #[test]
    fn update_rates_rejects_malformed_body() {
        let sampler = PrioritySampler::new();
        assert!(sampler.update_rates(b"not json").is_err());
        assert!(sampler.update_rates(br#"{"rates":{}}"#).is_err());
    }

    #[test]
    fn decision_maker_format() {
        assert_eq!(decision_maker(mechanism::RULE_RATE), "-3");
        assert_eq!(decision_maker(mechanism::DEFAULT), "-0");
    }
}
