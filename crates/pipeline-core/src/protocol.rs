//! Stream-JSON protocol (C6) — line-delimited events shared by both address spaces.
//!
//! Classification of a raw stdout line: empty/non-`{`-prefixed lines are non-JSON and
//! pass through to the raw log; `{`-prefixed lines that fail to decode are invalid JSON
//! (counted, forwarded raw, never silently dropped); decodable JSON objects dispatch on
//! `type`. The parser is lenient — unknown fields are ignored structurally, and an
//! unrecognized `type` value still yields the raw `Value` rather than being treated as
//! invalid JSON.

use crate::types::{
    NodeKind, NodeRunRecord, PromptSourceKind, RunStatus, TerminalStatus, PROTOCOL_VERSION,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemEvent {
    pub subtype: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerToolUse {
    #[serde(default)]
    pub web_search_requests: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsageDelta {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageDelta {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub server_tool_use: Option<ServerToolUse>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultEvent {
    pub session_id: String,
    #[serde(default)]
    pub is_error: bool,
    pub result: Value,
    #[serde(default)]
    pub usage: Option<UsageDelta>,
    #[serde(default, rename = "modelUsage")]
    pub model_usage: Option<HashMap<String, ModelUsageDelta>>,
    #[serde(default)]
    pub total_cost_usd: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
}

impl ResultEvent {
    /// Normalize this `result` event into a [`crate::types::NormalizedUsage`] delta
    /// (§3 Usage metrics): top-level token counts and cost, plus a per-model
    /// breakdown from `modelUsage`. `total_cost_usd` is the run's aggregate cost and
    /// has no per-model split on the wire, so it is attributed to the single model
    /// named by `model` when `modelUsage` carries exactly one entry, and left at 0
    /// per model otherwise.
    pub fn normalize(&self) -> crate::types::NormalizedUsage {
        use crate::types::{ModelUsage, NormalizedUsage};

        let mut usage = NormalizedUsage::default();
        if let Some(u) = &self.usage {
            usage.input_tokens = u.input_tokens;
            usage.cache_creation_input_tokens = u.cache_creation_input_tokens;
            usage.cache_read_input_tokens = u.cache_read_input_tokens;
            usage.output_tokens = u.output_tokens;
            if let Some(stu) = &u.server_tool_use {
                usage.web_search_requests = stu.web_search_requests;
            }
        }
        usage.cost_usd = self.total_cost_usd.unwrap_or(0.0);

        if let Some(per_model) = &self.model_usage {
            let single_model_cost = if per_model.len() == 1 {
                usage.cost_usd
            } else {
                0.0
            };
            for (model, delta) in per_model {
                usage.per_model.insert(
                    model.clone(),
                    ModelUsage {
                        input_tokens: delta.input_tokens,
                        cache_creation_input_tokens: delta.cache_creation_input_tokens,
                        cache_read_input_tokens: delta.cache_read_input_tokens,
                        output_tokens: delta.output_tokens,
                        cost_usd: single_model_cost,
                    },
                );
            }
        } else if let Some(model) = &self.model {
            usage.per_model.insert(
                model.clone(),
                ModelUsage {
                    input_tokens: usage.input_tokens,
                    cache_creation_input_tokens: usage.cache_creation_input_tokens,
                    cache_read_input_tokens: usage.cache_read_input_tokens,
                    output_tokens: usage.output_tokens,
                    cost_usd: usage.cost_usd,
                },
            );
        }

        usage
    }
}

/// Pipeline event taxonomy (§4.5), tagged on `event`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    PlanStart {
        version: String,
        entry_node: String,
        node_count: u64,
        started_at: String,
    },
    NodeStart {
        node_id: String,
        node_run_id: String,
        kind: NodeKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        prompt_source: PromptSourceKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prompt_file: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cmd: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
        iteration: u64,
        attempt: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        idle_timeout_sec: Option<u64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_sec: Option<u64>,
        started_at: String,
    },
    NodeSessionBind {
        node_id: String,
        node_run_id: String,
        session_id: String,
    },
    NodeTimeout {
        node_id: String,
        node_run_id: String,
        idle_timeout_sec: u64,
        reason: String,
    },
    NodeFinish {
        #[serde(flatten)]
        record: NodeRunRecord,
    },
    TransitionTaken {
        node_id: String,
        node_run_id: String,
        from_node: String,
        to_node: String,
        when: String,
        iteration: u64,
    },
    PlanFinish {
        status: RunStatus,
        finished_at: String,
        duration_ms: u64,
        iterations: u64,
        node_run_count: u64,
        failed_node_count: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        terminal_node: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        terminal_status: Option<TerminalStatus>,
        exit_code: i32,
    },
}

/// The top-level line union (C6), tagged on `type`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    System(SystemEvent),
    Assistant(Value),
    User(Value),
    Result(ResultEvent),
    PipelineEvent(PipelineEvent),
    PipelineResult(crate::types::PipelineResult),
}

impl StreamEvent {
    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn pipeline(event: PipelineEvent) -> Self {
        StreamEvent::PipelineEvent(event)
    }
}

pub fn protocol_version() -> &'static str {
    PROTOCOL_VERSION
}

/// Outcome of classifying one raw stdout line.
#[derive(Debug, Clone)]
pub enum ParsedLine {
    /// Empty, or doesn't start with `{` — forwarded verbatim to the raw log.
    NonJson(String),
    /// Starts with `{` but fails to decode as JSON at all.
    InvalidJson(String),
    /// Decodes as JSON and dispatches to a known `type`.
    Event(StreamEvent),
    /// Decodes as JSON but carries an unrecognized `type` (or none) — preserved raw.
    Unknown(Value),
}

pub fn parse_line(line: &str) -> ParsedLine {
    let trimmed = line.trim_start();
    if trimmed.is_empty() || !trimmed.starts_with('{') {
        return ParsedLine::NonJson(line.to_string());
    }
    let value: Value = match serde_json::from_str(line) {
        Ok(v) => v,
        Err(_) => return ParsedLine::InvalidJson(line.to_string()),
    };
    match serde_json::from_value::<StreamEvent>(value.clone()) {
        Ok(event) => ParsedLine::Event(event),
        Err(_) => ParsedLine::Unknown(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_line_is_non_json() {
        matches!(parse_line(""), ParsedLine::NonJson(_));
    }

    #[test]
    fn plain_text_line_is_non_json() {
        matches!(parse_line("container started"), ParsedLine::NonJson(_));
    }

    #[test]
    fn malformed_json_is_invalid() {
        matches!(parse_line("{not json"), ParsedLine::InvalidJson(_));
    }

    #[test]
    fn system_init_parses() {
        let line = r#"{"type":"system","subtype":"init","session_id":"s1"}"#;
        match parse_line(line) {
            ParsedLine::Event(StreamEvent::System(s)) => {
                assert_eq!(s.subtype, "init");
                assert_eq!(s.session_id.as_deref(), Some("s1"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn result_event_parses_with_usage() {
        let line = json!({
            "type": "result",
            "session_id": "s1",
            "result": {"next": "success"},
            "usage": {"input_tokens": 10, "cache_creation_input_tokens": 1, "cache_read_input_tokens": 2, "output_tokens": 3},
            "total_cost_usd": 0.25
        })
        .to_string();
        match parse_line(&line) {
            ParsedLine::Event(StreamEvent::Result(r)) => {
                assert_eq!(r.session_id, "s1");
                assert_eq!(r.usage.unwrap().input_tokens, 10);
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn pipeline_event_round_trips() {
        let ev = StreamEvent::pipeline(PipelineEvent::PlanStart {
            version: "v2".into(),
            entry_node: "main".into(),
            node_count: 3,
            started_at: "2026-07-28T00:00:00.000Z".into(),
        });
        let line = ev.to_line();
        assert!(line.contains("\"event\":\"plan_start\""));
        match parse_line(&line) {
            ParsedLine::Event(StreamEvent::PipelineEvent(PipelineEvent::PlanStart {
                node_count,
                ..
            })) => assert_eq!(node_count, 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_preserved_not_invalid() {
        let line = r#"{"type":"something_else","foo":1}"#;
        matches!(parse_line(line), ParsedLine::Unknown(_));
    }

    #[test]
    fn normalize_splits_per_model_breakdown() {
        let event: ResultEvent = serde_json::from_value(json!({
            "session_id": "s1",
            "result": {"next": "success"},
            "usage": {"input_tokens": 10, "output_tokens": 3},
            "modelUsage": {"opus": {"input_tokens": 10, "output_tokens": 3}},
            "total_cost_usd": 0.25
        }))
        .unwrap();
        let normalized = event.normalize();
        assert_eq!(normalized.input_tokens, 10);
        let opus = normalized.per_model.get("opus").unwrap();
        assert_eq!(opus.input_tokens, 10);
        assert!((opus.cost_usd - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn normalize_falls_back_to_top_level_model_when_no_model_usage_map() {
        let event: ResultEvent = serde_json::from_value(json!({
            "session_id": "s1",
            "result": {"next": "success"},
            "usage": {"input_tokens": 5},
            "model": "sonnet",
            "total_cost_usd": 0.1
        }))
        .unwrap();
        let normalized = event.normalize();
        let sonnet = normalized.per_model.get("sonnet").unwrap();
        assert_eq!(sonnet.input_tokens, 5);
        assert!((sonnet.cost_usd - 0.1).abs() < f64::EPSILON);
    }

    #[test]
    fn normalize_splits_cost_as_zero_for_multi_model_breakdown() {
        let event: ResultEvent = serde_json::from_value(json!({
            "session_id": "s1",
            "result": {"next": "success"},
            "usage": {"input_tokens": 10},
            "modelUsage": {
                "opus": {"input_tokens": 6},
                "haiku": {"input_tokens": 4}
            },
            "total_cost_usd": 0.25
        }))
        .unwrap();
        let normalized = event.normalize();
        assert_eq!(normalized.per_model.len(), 2);
        assert_eq!(normalized.per_model.get("opus").unwrap().cost_usd, 0.0);
        assert_eq!(normalized.per_model.get("haiku").unwrap().cost_usd, 0.0);
    }

    #[test]
    fn pipeline_result_emission_has_no_duplicate_type_key() {
        let result = crate::types::PipelineResult {
            version: "v2".into(),
            status: RunStatus::Success,
            is_error: false,
            entry_node: "main".into(),
            terminal_node: Some("success".into()),
            terminal_status: Some(TerminalStatus::Success),
            exit_code: 0,
            iterations: 1,
            node_run_count: 0,
            failed_node_count: 0,
            node_runs: Vec::new(),
        };
        let line = StreamEvent::PipelineResult(result).to_line();
        let value: Value = serde_json::from_str(&line).unwrap();
        let obj = value.as_object().unwrap();
        assert_eq!(obj.get("type").unwrap(), "pipeline_result");
        // A duplicate `"type"` key would have been silently collapsed by
        // `serde_json::Value` on decode, so check the raw text for a second
        // occurrence of the key rather than trusting the parsed map.
        assert_eq!(line.matches("\"type\"").count(), 1);

        match parse_line(&line) {
            ParsedLine::Event(StreamEvent::PipelineResult(parsed)) => {
                assert_eq!(parsed.entry_node, "main");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }
}
