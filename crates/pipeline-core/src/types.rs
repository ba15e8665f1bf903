//! Shared wire/data-model types (§3): node run records, decision scope, usage metrics,
//! pipeline result, and the persisted `RunRecord`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

pub const PROTOCOL_VERSION: &str = "v2";

/// System-error exit codes (§6/§7).
pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const AGENT_ERROR: i32 = 1;
    pub const INVALID_PLAN: i32 = 2;
    pub const NO_TRANSITION: i32 = 3;
    pub const LIMIT_REACHED: i32 = 4;
    pub const NODE_EXECUTION: i32 = 5;
    pub const IDLE_TIMEOUT: i32 = -1;
    pub const INTERRUPTED: i32 = 130;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Agent,
    Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptSourceKind {
    Prompt,
    PromptFile,
    #[serde(rename = "")]
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Success,
    Blocked,
    Failed,
    Canceled,
}

/// `run` sub-record of the decision scope (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub signal: String,
    pub timed_out: bool,
    pub status: RunStatus,
}

/// `node` sub-record of the decision scope (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub kind: NodeKind,
    pub attempt: u64,
    pub run_id: String,
}

/// `pipeline` sub-record of the decision scope (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub iteration: u64,
    pub total_node_runs: u64,
}

/// The full scope a compiled `when` expression is evaluated against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionScope {
    pub decision: Value,
    pub run: RunOutcome,
    pub node: NodeInfo,
    pub pipeline: PipelineInfo,
}

impl DecisionScope {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Per-model usage breakdown.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelUsage {
    pub input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

impl ModelUsage {
    pub fn add(&mut self, other: &ModelUsage) {
        self.input_tokens += other.input_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// Normalized usage accumulated per session / per node run (§3, §4.8).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NormalizedUsage {
    pub input_tokens: u64,
    pub cache_creation_input_tokens: u64,
    pub cache_read_input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub web_search_requests: u64,
    #[serde(default)]
    pub per_model: HashMap<String, ModelUsage>,
}

impl NormalizedUsage {
    pub fn add(&mut self, other: &NormalizedUsage) {
        self.input_tokens += other.input_tokens;
        self.cache_creation_input_tokens += other.cache_creation_input_tokens;
        self.cache_read_input_tokens += other.cache_read_input_tokens;
        self.output_tokens += other.output_tokens;
        self.cost_usd += other.cost_usd;
        self.web_search_requests += other.web_search_requests;
        for (model, usage) in &other.per_model {
            self.per_model.entry(model.clone()).or_default().add(usage);
        }
    }
}

/// Node run record (§3) — wire event payload and persisted record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRunRecord {
    pub node_id: String,
    pub node_run_id: String,
    pub kind: NodeKind,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub prompt_source: PromptSourceKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cmd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    pub exit_code: i32,
    pub signal: String,
    pub timed_out: bool,
    pub started_at: String,
    pub finished_at: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized: Option<NormalizedUsage>,
}

/// Final `pipeline_result` (§3, §4.5). The wire `"type":"pipeline_result"` tag comes
/// from the enclosing `StreamEvent`'s own `#[serde(tag = "type")]` — this struct must
/// not carry its own `type`/`kind` field, or the tagged serializer's injected key and
/// this struct's own key collide into a duplicate-key JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PipelineResult {
    pub version: String,
    pub status: RunStatus,
    pub is_error: bool,
    pub entry_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_status: Option<TerminalStatus>,
    pub exit_code: i32,
    pub iterations: u64,
    pub node_run_count: u64,
    pub failed_node_count: u64,
    pub node_runs: Vec<NodeRunRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunRecordStatus {
    Success,
    Error,
    ParseError,
    ExecError,
}

/// Persisted run record (§3, §4.9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub timestamp: String,
    pub status: RunRecordStatus,
    pub docker_exit_code: i32,
    pub cwd: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_result: Option<AgentResultRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalized: Option<NormalizedUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Pipeline-mode payload embedded in a `RunRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRecord {
    pub status: RunStatus,
    pub entry_node: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_node: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_status: Option<TerminalStatus>,
    pub exit_code: i32,
    pub iterations: u64,
    pub node_run_count: u64,
    pub failed_node_count: u64,
    pub node_runs: Vec<NodeRunRecord>,
}

/// Single-prompt mode payload embedded in a `RunRecord`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResultRecord {
    pub session_id: String,
    pub is_error: bool,
    pub result: Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_record_round_trips() {
        let record = RunRecord {
            run_id: "abc123".into(),
            timestamp: "2026-07-28T00:00:00.000Z".into(),
            status: RunRecordStatus::Success,
            docker_exit_code: 0,
            cwd: "/work".into(),
            pipeline: None,
            agent_result: None,
            normalized: None,
            error_type: None,
            error_message: None,
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: RunRecord = serde_json::from_str(&json).unwrap();
        let rejson = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, rejson);
    }
}
