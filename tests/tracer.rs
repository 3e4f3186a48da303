//! End-to-end checks through the public API: spans out, JSON traces in.

use dd_trace::{Config, Tracer};
use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl io::Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl SharedBuf {
    fn traces(&self) -> Vec<serde_json::Value> {
        let bytes = self.0.lock().unwrap().clone();
        let text = String::from_utf8(bytes).unwrap();
        text.trim_end()
            .split('\n')
            .filter(|line| !line.is_empty())
            .flat_map(|line| {
                let value: serde_json::Value = serde_json::from_str(line).unwrap();
                value["traces"].as_array().unwrap().clone()
            })
            .collect()
    }
}

fn tracer_to_buffer(configure: impl FnOnce(Config) -> Config) -> (Tracer, SharedBuf) {
    let out = SharedBuf::default();
    let config = configure(
        Config::new()
            .with_service("integration-svc")
            .with_log_writer(Box::new(out.clone())),
    );
    (Tracer::with_config(config), out)
}

#[test]
fn parent_child_lifecycle() {
    let (tracer, out) = tracer_to_buffer(|c| c);

    let root = tracer.start_span("web.request");
    let child = tracer
        .span_builder("db.query")
        .child_of(root.context())
        .with_span_type("sql")
        .start(&tracer);
    child.set_tag("db.rows", 42);
    child.finish();
    root.finish();
    tracer.flush();

    let traces = out.traces();
    assert_eq!(traces.len(), 1);
    let spans = traces[0].as_array().unwrap();
    assert_eq!(spans.len(), 2);

    let root_json = spans.iter().find(|s| s["name"] == "web.request").unwrap();
    let child_json = spans.iter().find(|s| s["name"] == "db.query").unwrap();
    assert_eq!(child_json["parent_id"], root_json["span_id"]);
    assert_eq!(child_json["trace_id"], root_json["trace_id"]);
    assert_eq!(child_json["type"], "sql");
    assert_eq!(child_json["metrics"]["db.rows"], 42.0);
    assert_eq!(root_json["service"], "integration-svc");
    assert!(root_json["duration"].as_i64().unwrap() >= 0);

    tracer.shutdown();
}

#[test]
fn propagation_continues_the_trace_across_carriers() {
    let (tracer, out) = tracer_to_buffer(|c| c);

    let upstream = tracer.start_span("upstream");
    upstream.set_baggage_item("account", "apm");

    let mut headers: HashMap<String, String> = HashMap::new();
    tracer.inject(&upstream.context(), &mut headers).unwrap();

    let extracted = tracer.extract(&headers).unwrap();
    let downstream = tracer
        .span_builder("downstream")
        .child_of(extracted)
        .start(&tracer);
    assert_eq!(downstream.trace_id(), upstream.trace_id());
    assert_eq!(downstream.baggage_item("account"), Some("apm".to_string()));

    downstream.finish();
    upstream.finish();
    tracer.flush();

    // Two chunks: the downstream "continuation" trace and the upstream one
    // share a trace id on the wire.
    let traces = out.traces();
    assert_eq!(traces.len(), 2);
    let ids: Vec<&serde_json::Value> = traces
        .iter()
        .map(|t| &t.as_array().unwrap()[0]["trace_id"])
        .collect();
    assert_eq!(ids[0], ids[1]);

    tracer.shutdown();
}

#[test]
fn sampling_rules_are_visible_in_output() {
    let (tracer, out) = tracer_to_buffer(|c| {
        c.with_trace_sampling_rules(vec![dd_trace::SamplingRule::rate(0.0)
            .with_service("integration-svc")])
        .with_span_sampling_rules(vec![dd_trace::SamplingRule::rate(1.0)
            .with_name("critical.op")])
    });

    let dropped = tracer.start_span("boring.op");
    dropped.finish();
    let rescued = tracer.start_span("critical.op");
    rescued.finish();
    tracer.flush();

    let traces = out.traces();
    assert_eq!(traces.len(), 2);
    for trace in &traces {
        let span = &trace.as_array().unwrap()[0];
        assert_eq!(span["metrics"]["_dd.rule_psr"], 0.0);
        assert_eq!(span["metrics"]["_sampling_priority_v1"], -1.0);
        if span["name"] == "critical.op" {
            assert_eq!(span["metrics"]["_dd.span_sampling.mechanism"], 8.0);
            assert_eq!(span["metrics"]["_dd.span_sampling.rule_rate"], 1.0);
        } else {
            assert!(span["metrics"].get("_dd.span_sampling.mechanism").is_none());
        }
    }

    tracer.shutdown();
}

#[test]
fn remote_config_round_trip_through_public_api() {
    let (tracer, _out) = tracer_to_buffer(|c| c.with_global_sample_rate(0.2));

    let mut update: dd_trace::ProductUpdate = HashMap::new();
    update.insert(
        "datadog/2/APM_TRACING/x/config".to_string(),
        Some(br#"{"lib_config":{"tracing_sampling_rate":0.9}}"#.to_vec()),
    );
    let statuses = tracer.apply_remote_config(update);
    assert!(statuses
        .values()
        .all(|s| s.state == dd_trace::ApplyState::Acknowledged));

    let span = tracer.start_span("op");
    span.finish();
    // Reverting restores the configured local value.
    let mut revert: dd_trace::ProductUpdate = HashMap::new();
    revert.insert("datadog/2/APM_TRACING/x/config".to_string(), None);
    tracer.apply_remote_config(revert);

    tracer.shutdown();
}

#[test]
fn stopped_global_tracer_returns_noop_spans() {
    // No global start here: the default global is the no-op tracer.
    let span = dd_trace::global().start_span("orphan");
    assert_eq!(span.span_id(), 0);
    assert!(span.trace_id().is_zero());
    span.set_tag("ignored", true);
    span.finish();
}
