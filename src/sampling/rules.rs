//! User-defined sampling rules for traces and individual spans.
//!
//! Rules are ordered; the first match wins. They are configured in code, via
//! the `DD_TRACE_SAMPLING_RULES` / `DD_SPAN_SAMPLING_RULES` environment
//! variables (JSON arrays), or pushed by remote configuration, in which case
//! each rule carries a provenance of `customer` or `dynamic`.

use super::glob::glob_match;
use super::limiter::RateLimiter;
use super::{mechanism, sampled_by_rate};
use serde::Deserialize;
use std::collections::HashMap;

/// Identifies who authored a sampling rule.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    /// Configured locally, in code or environment.
    #[default]
    Local,
    /// Pushed by remote configuration on behalf of the user.
    Customer,
    /// Computed remotely without user involvement.
    Dynamic,
}

/// A single sampling rule.
///
/// Every matcher is optional; an omitted matcher accepts any value. Glob
/// syntax: `*` matches any sequence, `?` a single character, anchored.
#[derive(Clone, Debug, Deserialize)]
pub struct SamplingRule {
    #[serde(default)]
    pub service: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub resource: Option<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(rename = "sample_rate", default = "default_sample_rate")]
    pub rate: f64,
    #[serde(default)]
    pub max_per_second: Option<f64>,
    #[serde(default)]
    pub provenance: Provenance,
}

fn default_sample_rate() -> f64 {
    1.0
}

impl SamplingRule {
    /// A rule matching every span at the given rate.
    pub fn rate(rate: f64) -> Self {
        SamplingRule {
            service: None,
            name: None,
            resource: None,
            tags: HashMap::new(),
            rate,
            max_per_second: None,
            provenance: Provenance::Local,
        }
    }

    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.tags.insert(key.into(), pattern.into());
        self
    }

    pub fn with_max_per_second(mut self, mps: f64) -> Self {
        self.max_per_second = Some(mps);
        self
    }

    fn matches(&self, target: &RuleTarget<'_>) -> bool {
        if let Some(pattern) = &self.service {
            if !glob_match(pattern, target.service) {
                return false;
            }
        }
        if let Some(pattern) = &self.name {
            if !glob_match(pattern, target.name) {
                return false;
            }
        }
        if let Some(pattern) = &self.resource {
            if !glob_match(pattern, target.resource) {
                return false;
            }
        }
        for (key, pattern) in &self.tags {
            match (target.tag_lookup)(key) {
                Some(value) => {
                    if !glob_match(pattern, &value) {
                        return false;
                    }
                }
                None => return false,
            }
        }
        true
    }
}

/// Parses a JSON array of rules, the `DD_TRACE_SAMPLING_RULES` wire shape.
pub(crate) fn parse_rules(json: &str) -> Result<Vec<SamplingRule>, serde_json::Error> {
    serde_json::from_str(json)
}

/// The span attributes a rule is matched against. `tag_lookup` resolves both
/// meta and metric values by key.
pub(crate) struct RuleTarget<'a> {
    pub service: &'a str,
    pub name: &'a str,
    pub resource: &'a str,
    pub tag_lookup: &'a dyn Fn(&str) -> Option<String>,
}

/// The outcome of a matched trace rule.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct TraceRuleDecision {
    pub rate: f64,
    pub keep: bool,
    /// Effective rate of the limiter that gated the decision, if one ran.
    pub limiter_rate: Option<f64>,
    pub mechanism: u32,
}

/// Trace-level rules sampler. A configured global sample rate behaves as a
/// trailing match-all rule; kept decisions are gated per-rule by the rule's
/// own limiter when `max_per_second` is set, otherwise by the shared trace
/// rate limit.
#[derive(Debug)]
pub(crate) struct TraceRulesSampler {
    rules: Vec<(SamplingRule, Option<RateLimiter>)>,
    global_limiter: RateLimiter,
}

impl TraceRulesSampler {
    pub(crate) fn new(
        mut rules: Vec<SamplingRule>,
        global_rate: Option<f64>,
        rate_limit: f64,
    ) -> Self {
        if let Some(rate) = global_rate {
            rules.push(SamplingRule::rate(rate.clamp(0.0, 1.0)));
        }
        let rules = rules
            .into_iter()
            .map(|rule| {
                let limiter = rule.max_per_second.map(RateLimiter::new);
                (rule, limiter)
            })
            .collect();
        TraceRulesSampler {
            rules,
            global_limiter: RateLimiter::new(rate_limit),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Applies the first matching rule. Returns `None` when no rule matches
    /// and the decision falls through to the priority sampler.
    pub(crate) fn sample(
        &self,
        target: &RuleTarget<'_>,
        trace_id_lower: u64,
        now_ns: i64,
    ) -> Option<TraceRuleDecision> {
        let (rule, limiter) = self.rules.iter().find(|(rule, _)| rule.matches(target))?;
        let mechanism = match rule.provenance {
            Provenance::Local => mechanism::RULE_RATE,
            Provenance::Customer => mechanism::REMOTE_USER_RULE,
            Provenance::Dynamic => mechanism::REMOTE_DYNAMIC_RULE,
        };

        if !sampled_by_rate(trace_id_lower, rule.rate) {
            return Some(TraceRuleDecision {
                rate: rule.rate,
                keep: false,
                limiter_rate: None,
                mechanism,
            });
        }
        let (allowed, limiter_rate) = limiter
            .as_ref()
            .unwrap_or(&self.global_limiter)
            .allow(now_ns);
        Some(TraceRuleDecision {
            rate: rule.rate,
            keep: allowed,
            limiter_rate: Some(limiter_rate),
            mechanism,
        })
    }
}

/// The outcome of a matched single-span rule that kept the span.
#[derive(Clone, Copy, Debug, PartialEq)]
pub(crate) struct SpanRuleDecision {
    pub rate: f64,
    /// The configured cap, reported on the span as-is.
    pub max_per_second: Option<f64>,
}

/// Per-span rules sampler, consulted for spans of traces that were dropped
/// so that individually interesting spans still reach the backend.
#[derive(Debug)]
pub(crate) struct SpanRulesSampler {
    rules: Vec<(SamplingRule, Option<RateLimiter>)>,
}

impl SpanRulesSampler {
    pub(crate) fn new(rules: Vec<SamplingRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let limiter = rule.max_per_second.map(RateLimiter::new);
                (rule, limiter)
            })
            .collect();
        SpanRulesSampler { rules }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Returns a keep decision for the span, or `None` when no rule matched
    /// or the matched rule dropped it.
    pub(crate) fn sample(
        &self,
        target: &RuleTarget<'_>,
        span_id: u64,
        now_ns: i64,
    ) -> Option<SpanRuleDecision> {
        let (rule, limiter) = self.rules.iter().find(|(rule, _)| rule.matches(target))?;
        if !sampled_by_rate(span_id, rule.rate) {
            return None;
        }
        if let Some(limiter) = limiter {
            if !limiter.allow(now_ns).0 {
                return None;
            }
        }
        Some(SpanRuleDecision {
            rate: rule.rate,
            max_per_second: rule.max_per_second,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_tags(_: &str) -> Option<String> {
        None
    }

    fn target<'a>(
        service: &'a str,
        name: &'a str,
        resource: &'a str,
        lookup: &'a dyn Fn(&str) -> Option<String>,
    ) -> RuleTarget<'a> {
        RuleTarget {
            service,
            name,
            resource,
            tag_lookup: lookup,
        }
    }

    #[test]
    fn parse_env_shape() {
        let rules = parse_rules(
            r#"[{"service":"web*","name":"http.request","sample_rate":0.25,"max_per_second":10},
                {"tags":{"region":"us-?"},"sample_rate":1.0,"provenance":"customer"}]"#,
        )
        .unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].service.as_deref(), Some("web*"));
        assert_eq!(rules[0].rate, 0.25);
        assert_eq!(rules[0].max_per_second, Some(10.0));
        assert_eq!(rules[0].provenance, Provenance::Local);
        assert_eq!(rules[1].tags.get("region").map(String::as_str), Some("us-?"));
        assert_eq!(rules[1].provenance, Provenance::Customer);
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(parse_rules("{").is_err());
        assert!(parse_rules(r#"[{"sample_rate":"high"}]"#).is_err());
    }

    #[test]
    fn first_matching_rule_wins() {
        let sampler = TraceRulesSampler::new(
            vec![
                SamplingRule::rate(0.0).with_service("svc"),
                SamplingRule::rate(1.0),
            ],
            None,
            100.0,
        );
        let decision = sampler
            .sample(&target("svc", "op", "res", &no_tags), 1, 0)
            .unwrap();
        assert!(!decision.keep);
        assert_eq!(decision.rate, 0.0);
        assert_eq!(decision.mechanism, mechanism::RULE_RATE);

        let decision = sampler
            .sample(&target("other", "op", "res", &no_tags), 1, 0)
            .unwrap();
        assert!(decision.keep);
        assert_eq!(decision.rate, 1.0);
    }

    #[test]
    fn tag_matchers_require_presence() {
        let sampler = TraceRulesSampler::new(
            vec![SamplingRule::rate(1.0).with_tag("region", "us-*")],
            None,
            100.0,
        );
        let lookup = |key: &str| (key == "region").then(|| "us-east".to_string());
        assert!(sampler
            .sample(&target("svc", "op", "res", &lookup), 1, 0)
            .is_some());
        assert!(sampler
            .sample(&target("svc", "op", "res", &no_tags), 1, 0)
            .is_none());
    }

    #[test]
    fn global_rate_acts_as_trailing_rule() {
        let sampler = TraceRulesSampler::new(vec![], Some(1.0), 100.0);
        assert!(!sampler.is_empty());
        let decision = sampler
            .sample(&target("svc", "op", "res", &no_tags), 7, 0)
            .unwrap();
        assert!(decision.keep);
        assert_eq!(decision.rate, 1.0);
    }

    #[test]
    fn rule_limiter_caps_keeps() {
        let sampler = TraceRulesSampler::new(
            vec![SamplingRule::rate(1.0).with_max_per_second(2.0)],
            None,
            100.0,
        );
        let t = target("svc", "op", "res", &no_tags);
        assert!(sampler.sample(&t, 1, 0).unwrap().keep);
        assert!(sampler.sample(&t, 2, 0).unwrap().keep);
        let decision = sampler.sample(&t, 3, 0).unwrap();
        assert!(!decision.keep);
        // A dropped-by-limiter decision still reports the rule rate.
        assert_eq!(decision.rate, 1.0);
        assert!(decision.limiter_rate.is_some());
    }

    #[test]
    fn remote_provenance_changes_mechanism() {
        let mut customer = SamplingRule::rate(1.0);
        customer.provenance = Provenance::Customer;
        let mut dynamic = SamplingRule::rate(1.0).with_service("dyn");
        dynamic.provenance = Provenance::Dynamic;

        let sampler = TraceRulesSampler::new(vec![dynamic, customer], None, 100.0);
        let decision = sampler
            .sample(&target("dyn", "op", "res", &no_tags), 1, 0)
            .unwrap();
        assert_eq!(decision.mechanism, mechanism::REMOTE_DYNAMIC_RULE);
        let decision = sampler
            .sample(&target("other", "op", "res", &no_tags), 1, 0)
            .unwrap();
        assert_eq!(decision.mechanism, mechanism::REMOTE_USER_RULE);
    }

    #[test]
    fn span_rule_keeps_and_reports_configured_cap() {
        let sampler = SpanRulesSampler::new(vec![SamplingRule::rate(1.0)
            .with_service("svc")
            .with_name("http.get")
            .with_max_per_second(10.0)]);
        let decision = sampler
            .sample(&target("svc", "http.get", "res", &no_tags), 42, 0)
            .unwrap();
        assert_eq!(decision.rate, 1.0);
        assert_eq!(decision.max_per_second, Some(10.0));

        assert!(sampler
            .sample(&target("svc", "db.query", "res", &no_tags), 42, 0)
            .is_none());
    }

    #[test]
    fn span_rule_zero_rate_drops() {
        let sampler = SpanRulesSampler::new(vec![SamplingRule::rate(0.0)]);
        assert!(sampler
            .sample(&target("svc", "op", "res", &no_tags), 42, 0)
            .is_none());
    }
}
