//! Tracer configuration: environment variables and start-up options.
//!
//! [`Config::new`] captures the `DD_*` environment; `with_*` methods layer
//! code-level options on top. The tracer snapshots the configuration at
//! start and never re-reads the environment.

use crate::clock::Clock;
use crate::sampling::{parse_rules, SamplingRule};
use crate::span::ReadWriteSpan;
use crate::statsd::StatsdClient;
use crate::transport::HttpClient;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

/// Version of the agent trace ingestion API used for uploads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ApiVersion {
    /// The msgpack array-of-arrays format accepted at `/v0.4/traces`.
    Version04,
    /// The string-table format accepted at `/v1.0/traces`.
    Version10,
}

impl ApiVersion {
    pub(crate) fn path(self) -> &'static str {
        match self {
            ApiVersion::Version04 => "/v0.4/traces",
            ApiVersion::Version10 => "/v1.0/traces",
        }
    }

    pub(crate) fn content_type(self) -> &'static str {
        "application/msgpack"
    }
}

/// A propagation wire format.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PropagationStyle {
    /// `x-datadog-*` headers.
    Datadog,
    /// The single `b3` header.
    B3,
    /// `x-b3-*` multi headers.
    B3Multi,
    /// W3C `traceparent`/`tracestate`.
    TraceContext,
    /// The W3C `baggage` header.
    Baggage,
}

/// Where a configuration value came from, tracked so remote overrides can
/// be reverted to the exact prior state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigOrigin {
    Default,
    EnvVar,
    Code,
    Remote,
}

pub(crate) type PostProcessor = dyn Fn(&mut [ReadWriteSpan]) -> bool + Send + Sync;

/// Tracer start-up configuration.
pub struct Config {
    pub(crate) service: String,
    pub(crate) env: String,
    pub(crate) version: String,
    pub(crate) agent_url: String,
    pub(crate) api_version: ApiVersion,
    pub(crate) hostname: String,
    pub(crate) runtime_id: String,
    pub(crate) container_id: String,
    pub(crate) tracer_version: String,
    pub(crate) language_version: String,
    pub(crate) enabled: bool,

    pub(crate) global_sample_rate: Option<f64>,
    pub(crate) sample_rate_origin: ConfigOrigin,
    pub(crate) trace_rules: Vec<SamplingRule>,
    pub(crate) span_rules: Vec<SamplingRule>,
    pub(crate) rate_limit: f64,

    pub(crate) global_tags: HashMap<String, String>,
    pub(crate) global_tags_origin: ConfigOrigin,
    pub(crate) header_tags: HashMap<String, String>,
    pub(crate) header_tags_origin: ConfigOrigin,

    pub(crate) trace_128_bit: bool,
    pub(crate) partial_flush_enabled: bool,
    pub(crate) partial_flush_min_spans: usize,
    pub(crate) trace_max_size: usize,

    pub(crate) payload_size_limit: usize,
    pub(crate) payload_queue_size: usize,
    pub(crate) flush_interval: Duration,
    pub(crate) health_interval: Duration,
    pub(crate) send_retries: u32,
    pub(crate) retry_interval: Duration,
    pub(crate) concurrent_connection_limit: usize,

    pub(crate) inject_styles: Vec<PropagationStyle>,
    pub(crate) extract_styles: Vec<PropagationStyle>,
    pub(crate) tags_header_max_len: usize,

    pub(crate) abandoned_timeout: Option<Duration>,
    pub(crate) abandoned_log_size: usize,
    pub(crate) long_running_enabled: bool,
    pub(crate) heartbeat_interval: Duration,

    pub(crate) remote_config_enabled: bool,
    pub(crate) data_streams_enabled: bool,
    pub(crate) debug_stack_disabled: bool,

    pub(crate) statsd: Option<Arc<dyn StatsdClient>>,
    pub(crate) http_client: Option<Arc<dyn HttpClient>>,
    pub(crate) log_writer: Mutex<Option<Box<dyn io::Write + Send>>>,
    pub(crate) post_processor: Option<Arc<PostProcessor>>,
    pub(crate) clock: Option<Arc<dyn Clock>>,
}

impl Default for Config {
    fn default() -> Self {
        Config::new()
    }
}

impl Config {
    /// Builds a configuration from the `DD_*` environment with defaults for
    /// everything unset.
    pub fn new() -> Self {
        let agent_host = env_string("DD_AGENT_HOST").unwrap_or_else(|| "localhost".to_string());
        let agent_port = env_parse("DD_TRACE_AGENT_PORT", 8126u16);
        let agent_url = env_string("DD_TRACE_AGENT_URL")
            .unwrap_or_else(|| format!("http://{agent_host}:{agent_port}"));

        let (global_sample_rate, sample_rate_origin) = match env_string("DD_TRACE_SAMPLE_RATE") {
            Some(raw) => match raw.parse::<f64>() {
                Ok(rate) => (Some(rate), ConfigOrigin::EnvVar),
                Err(_) => {
                    warn!(value = %raw, "ignoring invalid DD_TRACE_SAMPLE_RATE");
                    (None, ConfigOrigin::Default)
                }
            },
            None => (None, ConfigOrigin::Default),
        };

        let global_tags = env_string("DD_TAGS")
            .map(|raw| parse_tag_list(&raw))
            .unwrap_or_default();
        let header_tags = env_string("DD_TRACE_HEADER_TAGS")
            .map(|raw| parse_header_tags(&raw))
            .unwrap_or_default();

        let styles = env_styles("DD_TRACE_PROPAGATION_STYLE").unwrap_or_else(|| {
            vec![
                PropagationStyle::Datadog,
                PropagationStyle::TraceContext,
                PropagationStyle::Baggage,
            ]
        });
        let inject_styles =
            env_styles("DD_TRACE_PROPAGATION_STYLE_INJECT").unwrap_or_else(|| styles.clone());
        let extract_styles =
            env_styles("DD_TRACE_PROPAGATION_STYLE_EXTRACT").unwrap_or_else(|| styles.clone());

        Config {
            service: env_string("DD_SERVICE").unwrap_or_else(process_name),
            env: env_string("DD_ENV").unwrap_or_default(),
            version: env_string("DD_VERSION").unwrap_or_default(),
            agent_url,
            api_version: env_api_version(),
            hostname: env_string("HOSTNAME").unwrap_or_default(),
            runtime_id: random_runtime_id(),
            container_id: String::new(),
            tracer_version: env!("CARGO_PKG_VERSION").to_string(),
            language_version: String::new(),
            enabled: env_parse("DD_TRACE_ENABLED", true),

            global_sample_rate,
            sample_rate_origin,
            trace_rules: env_rules("DD_TRACE_SAMPLING_RULES"),
            span_rules: env_rules("DD_SPAN_SAMPLING_RULES"),
            rate_limit: env_parse("DD_TRACE_RATE_LIMIT", 100.0f64),

            global_tags_origin: origin_of_env(!global_tags.is_empty()),
            global_tags,
            header_tags_origin: origin_of_env(!header_tags.is_empty()),
            header_tags,

            trace_128_bit: env_parse("DD_TRACE_128_BIT_TRACEID_GENERATION_ENABLED", true),
            partial_flush_enabled: env_parse("DD_TRACE_PARTIAL_FLUSH_ENABLED", false),
            partial_flush_min_spans: env_parse("DD_TRACE_PARTIAL_FLUSH_MIN_SPANS", 1000usize),
            trace_max_size: 100_000,

            payload_size_limit: 5 * 1024 * 1024,
            payload_queue_size: 1000,
            flush_interval: Duration::from_secs(2),
            health_interval: Duration::from_secs(10),
            send_retries: env_parse("DD_TRACE_SEND_RETRIES", 0u32),
            retry_interval: Duration::from_millis(500),
            concurrent_connection_limit: 100,

            inject_styles,
            extract_styles,
            tags_header_max_len: env_parse("DD_TRACE_X_DATADOG_TAGS_MAX_LENGTH", 128usize),

            abandoned_timeout: env_string("DD_TRACE_ABANDONED_SPAN_TIMEOUT")
                .and_then(|raw| parse_seconds(&raw, "DD_TRACE_ABANDONED_SPAN_TIMEOUT")),
            abandoned_log_size: 9000,
            long_running_enabled: env_parse("DD_TRACE_LONG_RUNNING_SPANS_ENABLED", false),
            heartbeat_interval: env_string("DD_TRACE_LONG_RUNNING_HEARTBEAT_INTERVAL")
                .and_then(|raw| parse_seconds(&raw, "DD_TRACE_LONG_RUNNING_HEARTBEAT_INTERVAL"))
                .unwrap_or(Duration::from_secs(60)),

            remote_config_enabled: env_parse("DD_REMOTE_CONFIGURATION_ENABLED", true),
            data_streams_enabled: env_parse("DD_DATA_STREAMS_ENABLED", false),
            debug_stack_disabled: false,

            statsd: None,
            http_client: None,
            log_writer: Mutex::new(None),
            post_processor: None,
            clock: None,
        }
    }

    /// Sets the service name traces are reported under.
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = service.into();
        self
    }

    /// Sets the deployment environment (`prod`, `staging`, ...).
    pub fn with_env(mut self, env: impl Into<String>) -> Self {
        self.env = env.into();
        self
    }

    /// Sets the application version tag.
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets the agent endpoint, e.g. `http://localhost:8126`.
    pub fn with_agent_url(mut self, url: impl Into<String>) -> Self {
        self.agent_url = url.into();
        self
    }

    /// Selects the upload protocol version.
    pub fn with_api_version(mut self, version: ApiVersion) -> Self {
        self.api_version = version;
        self
    }

    /// Sets the global trace sample rate in `[0, 1]`.
    pub fn with_global_sample_rate(mut self, rate: f64) -> Self {
        self.global_sample_rate = Some(rate);
        self.sample_rate_origin = ConfigOrigin::Code;
        self
    }

    /// Installs trace sampling rules, evaluated in order.
    pub fn with_trace_sampling_rules(mut self, rules: Vec<SamplingRule>) -> Self {
        self.trace_rules = rules;
        self
    }

    /// Installs single-span sampling rules.
    pub fn with_span_sampling_rules(mut self, rules: Vec<SamplingRule>) -> Self {
        self.span_rules = rules;
        self
    }

    /// Caps rule-sampled traces per second.
    pub fn with_rate_limit(mut self, limit: f64) -> Self {
        self.rate_limit = limit;
        self
    }

    /// Adds a tag set on every started span.
    pub fn with_global_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.global_tags.insert(key.into(), value.into());
        self.global_tags_origin = ConfigOrigin::Code;
        self
    }

    /// Maps HTTP header names to span tag names for integrations.
    pub fn with_header_tags(mut self, tags: HashMap<String, String>) -> Self {
        self.header_tags = tags;
        self.header_tags_origin = ConfigOrigin::Code;
        self
    }

    /// Toggles 128-bit trace id generation.
    pub fn with_128_bit_trace_ids(mut self, enabled: bool) -> Self {
        self.trace_128_bit = enabled;
        self
    }

    /// Enables partial flushing of traces with many finished spans.
    pub fn with_partial_flush(mut self, min_spans: usize) -> Self {
        self.partial_flush_enabled = true;
        self.partial_flush_min_spans = min_spans;
        self
    }

    /// Sets the propagation styles used for injection and extraction.
    pub fn with_propagation_styles(mut self, styles: Vec<PropagationStyle>) -> Self {
        self.inject_styles = styles.clone();
        self.extract_styles = styles;
        self
    }

    /// Enables the abandoned-span debug log for spans open longer than the
    /// timeout.
    pub fn with_abandoned_span_timeout(mut self, timeout: Duration) -> Self {
        self.abandoned_timeout = Some(timeout);
        self
    }

    /// Enables heartbeat snapshots for long-running spans.
    pub fn with_long_running_spans(mut self, heartbeat: Duration) -> Self {
        self.long_running_enabled = true;
        self.heartbeat_interval = heartbeat;
        self
    }

    /// Number of upload retries after a failed attempt.
    pub fn with_send_retries(mut self, retries: u32, interval: Duration) -> Self {
        self.send_retries = retries;
        self.retry_interval = interval;
        self
    }

    /// Disables recording stack excerpts on errored spans.
    pub fn without_debug_stack(mut self) -> Self {
        self.debug_stack_disabled = true;
        self
    }

    /// Installs a statsd client for health and runtime metrics.
    pub fn with_statsd_client(mut self, client: Arc<dyn StatsdClient>) -> Self {
        self.statsd = Some(client);
        self
    }

    /// Installs the HTTP client used to reach the agent.
    pub fn with_http_client(mut self, client: Arc<dyn HttpClient>) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Writes traces as JSON to the given writer instead of uploading to an
    /// agent, for environments without an agent socket.
    pub fn with_log_writer(mut self, writer: Box<dyn io::Write + Send>) -> Self {
        self.log_writer = Mutex::new(Some(writer));
        self
    }

    /// Registers a function invoked with read/write span views just before
    /// a completed trace reaches the writer; returning `false` drops the
    /// whole trace.
    pub fn with_post_processor<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut [ReadWriteSpan]) -> bool + Send + Sync + 'static,
    {
        self.post_processor = Some(Arc::new(f));
        self
    }

    /// Replaces the time source, for tests.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("service", &self.service)
            .field("env", &self.env)
            .field("version", &self.version)
            .field("agent_url", &self.agent_url)
            .field("api_version", &self.api_version)
            .field("enabled", &self.enabled)
            .field("global_sample_rate", &self.global_sample_rate)
            .field("trace_rules", &self.trace_rules.len())
            .field("span_rules", &self.span_rules.len())
            .field("partial_flush_enabled", &self.partial_flush_enabled)
            .finish_non_exhaustive()
    }
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    match env_string(name) {
        Some(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(name, value = %raw, "ignoring unparsable environment variable");
                default
            }
        },
        None => default,
    }
}

fn env_rules(name: &str) -> Vec<SamplingRule> {
    match env_string(name) {
        Some(raw) => match parse_rules(&raw) {
            Ok(rules) => rules,
            Err(error) => {
                warn!(name, %error, "ignoring malformed sampling rules");
                Vec::new()
            }
        },
        None => Vec::new(),
    }
}

fn env_api_version() -> ApiVersion {
    match env_string("DD_TRACE_AGENT_PROTOCOL_VERSION").as_deref() {
        None => ApiVersion::Version04,
        Some("v0.4") | Some("0.4") => ApiVersion::Version04,
        Some("v1.0") | Some("1.0") => ApiVersion::Version10,
        Some(other) => {
            warn!(value = other, "unknown agent protocol version, using v0.4");
            ApiVersion::Version04
        }
    }
}

fn env_styles(name: &str) -> Option<Vec<PropagationStyle>> {
    let raw = env_string(name)?;
    let mut styles = Vec::new();
    for part in raw.split(',') {
        match part.trim().to_ascii_lowercase().as_str() {
            "datadog" => styles.push(PropagationStyle::Datadog),
            "b3" | "b3 single header" => styles.push(PropagationStyle::B3),
            "b3multi" => styles.push(PropagationStyle::B3Multi),
            "tracecontext" => styles.push(PropagationStyle::TraceContext),
            "baggage" => styles.push(PropagationStyle::Baggage),
            "none" => return Some(Vec::new()),
            "" => {}
            other => warn!(name, style = other, "skipping unknown propagation style"),
        }
    }
    Some(styles)
}

fn parse_seconds(raw: &str, name: &str) -> Option<Duration> {
    match raw.parse::<f64>() {
        Ok(secs) if secs > 0.0 => Some(Duration::from_secs_f64(secs)),
        _ => {
            warn!(name, value = %raw, "ignoring unparsable duration");
            None
        }
    }
}

/// Parses the `DD_TAGS` shape: `key:value` pairs separated by commas or
/// spaces; a bare key maps to the empty string.
fn parse_tag_list(raw: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for part in raw.split([',', ' ']) {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once(':') {
            Some((key, value)) if !key.is_empty() => {
                tags.insert(key.to_string(), value.to_string());
            }
            None => {
                tags.insert(part.to_string(), String::new());
            }
            _ => {}
        }
    }
    tags
}

/// Parses `DD_TRACE_HEADER_TAGS`: `header:tag` pairs; a bare header maps to
/// the canonical `http.request.headers.<header>` tag.
fn parse_header_tags(raw: &str) -> HashMap<String, String> {
    let mut tags = HashMap::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once(':') {
            Some((header, tag)) if !header.is_empty() && !tag.is_empty() => {
                tags.insert(header.to_ascii_lowercase(), tag.to_string());
            }
            _ => {
                let header = part.to_ascii_lowercase();
                let tag = format!("http.request.headers.{}", header.replace('-', "_"));
                tags.insert(header, tag);
            }
        }
    }
    tags
}

fn origin_of_env(set: bool) -> ConfigOrigin {
    if set {
        ConfigOrigin::EnvVar
    } else {
        ConfigOrigin::Default
    }
}

fn process_name() -> String {
    std::env::current_exe()
        .ok()
        .and_then(|path| path.file_stem().map(|s| s.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unnamed-rust-service".to_string())
}

fn random_runtime_id() -> String {
    format!("{:016x}{:016x}", rand::random::<u64>(), rand::random::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_without_env() {
        temp_env::with_vars_unset(
            [
                "DD_SERVICE",
                "DD_ENV",
                "DD_AGENT_HOST",
                "DD_TRACE_AGENT_PORT",
                "DD_TRACE_AGENT_URL",
                "DD_TRACE_SAMPLE_RATE",
                "DD_TRACE_ENABLED",
            ],
            || {
                let config = Config::new();
                assert_eq!(config.agent_url, "http://localhost:8126");
                assert_eq!(config.api_version, ApiVersion::Version04);
                assert!(config.enabled);
                assert!(config.global_sample_rate.is_none());
                assert_eq!(config.sample_rate_origin, ConfigOrigin::Default);
                assert_eq!(config.rate_limit, 100.0);
                assert!(config.trace_128_bit);
                assert_eq!(config.tags_header_max_len, 128);
            },
        );
    }

    #[test]
    fn env_wires_through() {
        temp_env::with_vars(
            [
                ("DD_SERVICE", Some("billing")),
                ("DD_ENV", Some("prod")),
                ("DD_VERSION", Some("1.2.3")),
                ("DD_AGENT_HOST", Some("agent.local")),
                ("DD_TRACE_AGENT_PORT", Some("9126")),
                ("DD_TRACE_SAMPLE_RATE", Some("0.25")),
                ("DD_TRACE_AGENT_PROTOCOL_VERSION", Some("v1.0")),
                ("DD_TAGS", Some("team:payments,region:eu")),
                (
                    "DD_TRACE_SAMPLING_RULES",
                    Some(r#"[{"service":"billing","sample_rate":0.5}]"#),
                ),
            ],
            || {
                let config = Config::new();
                assert_eq!(config.service, "billing");
                assert_eq!(config.env, "prod");
                assert_eq!(config.version, "1.2.3");
                assert_eq!(config.agent_url, "http://agent.local:9126");
                assert_eq!(config.global_sample_rate, Some(0.25));
                assert_eq!(config.sample_rate_origin, ConfigOrigin::EnvVar);
                assert_eq!(config.api_version, ApiVersion::Version10);
                assert_eq!(
                    config.global_tags.get("team").map(String::as_str),
                    Some("payments")
                );
                assert_eq!(config.trace_rules.len(), 1);
            },
        );
    }

    #[test]
    fn invalid_env_values_fall_back() {
        temp_env::with_vars(
            [
                ("DD_TRACE_SAMPLE_RATE", Some("lots")),
                ("DD_TRACE_RATE_LIMIT", Some("many")),
                ("DD_TRACE_SAMPLING_RULES", Some("{broken")),
                ("DD_TRACE_AGENT_PROTOCOL_VERSION", Some("v9.9")),
            ],
            || {
                let config = Config::new();
                assert!(config.global_sample_rate.is_none());
                assert_eq!(config.rate_limit, 100.0);
                assert!(config.trace_rules.is_empty());
                assert_eq!(config.api_version, ApiVersion::Version04);
            },
        );
    }

    #[test]
    fn propagation_style_env() {
        temp_env::with_vars(
            [
                ("DD_TRACE_PROPAGATION_STYLE", Some("b3multi,tracecontext")),
                ("DD_TRACE_PROPAGATION_STYLE_EXTRACT", Some("datadog")),
            ],
            || {
                let config = Config::new();
                assert_eq!(
                    config.inject_styles,
                    vec![PropagationStyle::B3Multi, PropagationStyle::TraceContext]
                );
                assert_eq!(config.extract_styles, vec![PropagationStyle::Datadog]);
            },
        );
    }

    #[test]
    fn header_tag_parsing() {
        let tags = parse_header_tags("X-Request-Id:req.id, Content-Type");
        assert_eq!(tags.get("x-request-id").map(String::as_str), Some("req.id"));
        assert_eq!(
            tags.get("content-type").map(String::as_str),
            Some("http.request.headers.content_type")
        );
    }

    #[test]
    fn tag_list_parsing() {
        let tags = parse_tag_list("team:payments region:eu,flag");
        assert_eq!(tags.get("team").map(String::as_str), Some("payments"));
        assert_eq!(tags.get("region").map(String::as_str), Some("eu"));
        assert_eq!(tags.get("flag").map(String::as_str), Some(""));
    }

    #[test]
    fn runtime_ids_are_unique() {
        assert_ne!(random_runtime_id(), random_runtime_id());
    }
}
