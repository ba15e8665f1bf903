//! End-to-end coverage for the usage-attribution ordering scenarios (S1/S2): a
//! `node_session_bind` event can arrive before or after the `result` it binds, and
//! both orderings must land on the same normalized per-node usage.

use pipeline_core::protocol::{parse_line, ParsedLine, StreamEvent};
use pipeline_core::types::NormalizedUsage;
use pipeline_host::attributor::UsageAttributor;

const BIND_LINE: &str = r#"{"type":"pipeline_event","event":"node_session_bind","node_id":"main","node_run_id":"main-1","session_id":"s1"}"#;
const RESULT_LINE: &str = r#"{"type":"result","session_id":"s1","result":{"next":"success"},"usage":{"input_tokens":10,"cache_creation_input_tokens":1,"cache_read_input_tokens":2,"output_tokens":3},"total_cost_usd":0.25}"#;

fn normalize_result(r: &pipeline_core::protocol::ResultEvent) -> NormalizedUsage {
    let mut usage = NormalizedUsage::default();
    if let Some(u) = &r.usage {
        usage.input_tokens = u.input_tokens;
        usage.cache_creation_input_tokens = u.cache_creation_input_tokens;
        usage.cache_read_input_tokens = u.cache_read_input_tokens;
        usage.output_tokens = u.output_tokens;
    }
    usage.cost_usd = r.total_cost_usd.unwrap_or(0.0);
    usage
}

fn feed(attributor: &mut UsageAttributor, line: &str) {
    match parse_line(line) {
        ParsedLine::Event(StreamEvent::Result(r)) => {
            attributor.on_result(&r.session_id, normalize_result(&r));
        }
        ParsedLine::Event(StreamEvent::PipelineEvent(
            pipeline_core::protocol::PipelineEvent::NodeSessionBind {
                node_id,
                node_run_id,
                session_id,
            },
        )) => {
            attributor.on_session_bind(&node_id, &node_run_id, &session_id);
        }
        other => panic!("unexpected parse result for fixture line: {other:?}"),
    }
}

fn assert_expected_usage(attributor: &UsageAttributor) {
    let usage = attributor
        .usage_for("main", "main-1")
        .expect("usage should be attributed to the bound node run");
    assert_eq!(usage.input_tokens, 10);
    assert_eq!(usage.cache_creation_input_tokens, 1);
    assert_eq!(usage.cache_read_input_tokens, 2);
    assert_eq!(usage.output_tokens, 3);
    assert!((usage.cost_usd - 0.25).abs() < f64::EPSILON);
}

#[test]
fn s1_bind_before_result() {
    let mut attributor = UsageAttributor::new();
    feed(&mut attributor, BIND_LINE);
    feed(&mut attributor, RESULT_LINE);
    assert_expected_usage(&attributor);
}

#[test]
fn s2_result_before_bind() {
    let mut attributor = UsageAttributor::new();
    feed(&mut attributor, RESULT_LINE);
    feed(&mut attributor, BIND_LINE);
    assert_expected_usage(&attributor);
}

#[test]
fn unbound_result_never_surfaces_usage() {
    let mut attributor = UsageAttributor::new();
    feed(&mut attributor, RESULT_LINE);
    assert!(attributor.usage_for("main", "main-1").is_none());
}
