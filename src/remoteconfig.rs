//! Remote-configuration payloads pushed by the agent.
//!
//! The transport that fetches updates is external; the tracer consumes a
//! generic map of config paths to raw JSON bodies through
//! [`Tracer::apply_remote_config`](crate::Tracer::apply_remote_config).
//! This module holds the wire shapes, per-path apply results, and the saved
//! local state that makes every override reversible.

use crate::config::{Config, ConfigOrigin};
use crate::sampling::SamplingRule;
use serde::Deserialize;
use std::collections::HashMap;

/// One remote-config push: config path to raw JSON body, `None` meaning
/// the path was withdrawn.
pub type ProductUpdate = HashMap<String, Option<Vec<u8>>>;

/// Per-path application outcome reported back to the config transport.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApplyState {
    /// The update was processed (applied, or ignored for another service).
    Acknowledged = 2,
    /// The update could not be decoded or applied.
    Error = 3,
}

/// Result of applying one config path.
#[derive(Clone, Debug, PartialEq)]
pub struct ApplyStatus {
    pub state: ApplyState,
    pub error: String,
}

impl ApplyStatus {
    pub(crate) fn acknowledged() -> Self {
        ApplyStatus {
            state: ApplyState::Acknowledged,
            error: String::new(),
        }
    }

    pub(crate) fn error(message: impl Into<String>) -> Self {
        ApplyStatus {
            state: ApplyState::Error,
            error: message.into(),
        }
    }
}

/// The decoded body of one config path.
#[derive(Debug, Default, Deserialize)]
pub(crate) struct ConfigPayload {
    #[serde(default)]
    pub lib_config: LibConfig,
    #[serde(default)]
    pub service_target: Option<ServiceTarget>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct LibConfig {
    #[serde(default)]
    pub tracing_sampling_rate: Option<f64>,
    #[serde(default)]
    pub tracing_sampling_rules: Option<Vec<SamplingRule>>,
    #[serde(default)]
    pub tracing_header_tags: Option<Vec<HeaderTag>>,
    #[serde(default)]
    pub tracing_tags: Option<Vec<String>>,
    #[serde(default)]
    pub tracing_enabled: Option<bool>,
}

impl LibConfig {
    pub(crate) fn is_empty(&self) -> bool {
        self.tracing_sampling_rate.is_none()
            && self.tracing_sampling_rules.is_none()
            && self.tracing_header_tags.is_none()
            && self.tracing_tags.is_none()
            && self.tracing_enabled.is_none()
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct HeaderTag {
    pub header: String,
    pub tag_name: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServiceTarget {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub env: String,
}

impl ServiceTarget {
    /// An update for another service or environment is acknowledged but
    /// must not be applied.
    pub(crate) fn matches(&self, service: &str, env: &str) -> bool {
        (self.service.is_empty() || self.service == service)
            && (self.env.is_empty() || self.env == env)
    }
}

pub(crate) fn parse_payload(raw: &[u8]) -> Result<ConfigPayload, serde_json::Error> {
    serde_json::from_slice(raw)
}

/// The locally configured values a remote override shadows, captured at
/// tracer start so a withdrawn update restores them together with the
/// origin telemetry reports for each.
#[derive(Debug)]
pub(crate) struct LocalDefaults {
    pub sample_rate: Option<f64>,
    pub sample_rate_origin: ConfigOrigin,
    pub trace_rules: Vec<SamplingRule>,
    pub header_tags: HashMap<String, String>,
    pub header_tags_origin: ConfigOrigin,
    pub global_tags: HashMap<String, String>,
    pub global_tags_origin: ConfigOrigin,
}

impl LocalDefaults {
    pub(crate) fn from_config(config: &Config) -> Self {
        LocalDefaults {
            sample_rate: config.global_sample_rate,
            sample_rate_origin: config.sample_rate_origin,
            trace_rules: config.trace_rules.clone(),
            header_tags: config.header_tags.clone(),
            header_tags_origin: config.header_tags_origin,
            global_tags: config.global_tags.clone(),
            global_tags_origin: config.global_tags_origin,
        }
    }
}

/// Parses the `k:v` entries of `tracing_tags`.
pub(crate) fn parse_tag_entries(entries: &[String]) -> HashMap<String, String> {
    entries
        .iter()
        .filter_map(|entry| {
            let (key, value) = entry.split_once(':')?;
            if key.is_empty() {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::Provenance;

    #[test]
    fn parses_full_lib_config() {
        let payload = parse_payload(
            br#"{
                "lib_config": {
                    "tracing_sampling_rate": 0.5,
                    "tracing_sampling_rules": [
                        {"service": "web", "sample_rate": 0.1, "provenance": "customer"},
                        {"service": "jobs", "sample_rate": 1.0, "provenance": "dynamic"}
                    ],
                    "tracing_header_tags": [
                        {"header": "X-Request-Id", "tag_name": "req.id"}
                    ],
                    "tracing_tags": ["team:payments", "region:eu"],
                    "tracing_enabled": false
                },
                "service_target": {"service": "web", "env": "prod"}
            }"#,
        )
        .unwrap();

        let lib = &payload.lib_config;
        assert_eq!(lib.tracing_sampling_rate, Some(0.5));
        let rules = lib.tracing_sampling_rules.as_ref().unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].provenance, Provenance::Customer);
        assert_eq!(rules[1].provenance, Provenance::Dynamic);
        assert_eq!(lib.tracing_header_tags.as_ref().unwrap()[0].header, "X-Request-Id");
        assert_eq!(lib.tracing_enabled, Some(false));

        let target = payload.service_target.unwrap();
        assert!(target.matches("web", "prod"));
        assert!(!target.matches("web", "staging"));
        assert!(!target.matches("other", "prod"));
    }

    #[test]
    fn empty_lib_config_is_a_revert() {
        let payload = parse_payload(br#"{"lib_config": {}}"#).unwrap();
        assert!(payload.lib_config.is_empty());
        assert!(payload.service_target.is_none());
    }

    #[test]
    fn malformed_payload_errors() {
        assert!(parse_payload(b"{").is_err());
        assert!(parse_payload(br#"{"lib_config": {"tracing_sampling_rate": "fast"}}"#).is_err());
    }

    #[test]
    fn empty_target_fields_match_anything() {
        let payload =
            parse_payload(br#"{"lib_config": {}, "service_target": {"service": "", "env": ""}}"#)
                .unwrap();
        assert!(payload.service_target.unwrap().matches("web", "prod"));
    }

    #[test]
    fn tag_entry_parsing() {
        let tags = parse_tag_entries(&[
            "team:payments".to_string(),
            "region:eu:west".to_string(),
            "malformed".to_string(),
            ":empty".to_string(),
        ]);
        assert_eq!(tags.get("team").map(String::as_str), Some("payments"));
        assert_eq!(tags.get("region").map(String::as_str), Some("eu:west"));
        assert_eq!(tags.len(), 2);
    }
}
