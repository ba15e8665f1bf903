//! Host-side run orchestration: wires the Docker runner (C7) to the stream parser
//! (C6), the usage attributor (C8), the progress view (C10), and run persistence (C9)
//! to produce a persisted [`RunRecord`] (§2 control flow).

use crate::attributor::UsageAttributor;
use crate::docker::{DockerRunner, RunConfig, StopCause};
use crate::error::{Error, Result};
use crate::progress::ProgressView;
use pipeline_core::protocol::{ParsedLine, PipelineEvent, StreamEvent};
use pipeline_core::types::{
    AgentResultRecord, NodeRunRecord, PipelineRecord, RunRecord, RunRecordStatus,
};
use tokio_util::sync::CancellationToken;

/// Whether this invocation runs a plan (pipeline) or a single prompt (§4.11 `pipeline`
/// config flag).
pub enum RunMode {
    Pipeline,
    SinglePrompt,
}

pub struct HostRunRequest<'a> {
    pub cfg: RunConfig,
    pub container_cmd: Vec<String>,
    pub mode: RunMode,
    pub run_id: Option<String>,
    pub view: &'a mut dyn ProgressView,
}

/// The composed record plus the raw stdout/stderr captured from the container, for the
/// caller to persist verbatim as `output.log` (§4.9).
pub struct RunResult {
    pub record: RunRecord,
    pub stdout: String,
    pub stderr: String,
}

/// Drive one container to completion and compose the final [`RunRecord`]. Does not
/// persist — call [`crate::persistence::persist`] on the result if the caller wants it
/// written to disk.
pub async fn run(runner: &DockerRunner, req: HostRunRequest<'_>, cancel: &CancellationToken) -> RunResult {
    let run_id = req
        .run_id
        .unwrap_or_else(crate::persistence::generate_run_id);
    let cwd = req.cfg.cwd.display().to_string();

    let mut attributor = UsageAttributor::new();
    let view = req.view;

    let outcome = runner
        .run(&req.cfg, req.container_cmd, cancel, |line, is_stderr| {
            if is_stderr {
                view.send_raw_line(line, true);
                return;
            }
            match pipeline_core::protocol::parse_line(line) {
                ParsedLine::Event(event) => {
                    observe_event(&mut attributor, &event);
                    view.send_event(&event);
                }
                ParsedLine::NonJson(raw) | ParsedLine::InvalidJson(raw) => {
                    view.send_raw_line(&raw, false);
                }
                ParsedLine::Unknown(_) => {
                    view.send_raw_line(line, false);
                }
            }
        })
        .await;

    let (record, stdout, stderr) = match outcome {
        Ok(output) => {
            let record = build_record(
                &run_id,
                &cwd,
                req.mode,
                &output.stdout,
                output.docker_exit_code,
                &output.cause,
                &attributor,
            );
            (record, output.stdout, output.stderr)
        }
        Err(e) => (error_record(&run_id, &cwd, &e), String::new(), String::new()),
    };

    view.finish(&record);
    RunResult { record, stdout, stderr }
}

fn observe_event(attributor: &mut UsageAttributor, event: &StreamEvent) {
    match event {
        StreamEvent::Result(r) => {
            attributor.on_result(&r.session_id, r.normalize());
        }
        StreamEvent::PipelineEvent(PipelineEvent::NodeSessionBind {
            node_id,
            node_run_id,
            session_id,
        }) => {
            attributor.on_session_bind(node_id, node_run_id, session_id);
        }
        _ => {}
    }
}

/// Scan `stdout` from end to beginning for the last line of the given `type`/`event`,
/// per §5's "always the last JSON event of its kind" ordering guarantee.
fn last_pipeline_result(stdout: &str) -> Option<pipeline_core::types::PipelineResult> {
    for line in stdout.lines().rev() {
        if let ParsedLine::Event(StreamEvent::PipelineResult(result)) =
            pipeline_core::protocol::parse_line(line)
        {
            return Some(result);
        }
    }
    None
}

fn last_result_event(stdout: &str) -> Option<pipeline_core::protocol::ResultEvent> {
    for line in stdout.lines().rev() {
        if let ParsedLine::Event(StreamEvent::Result(result)) =
            pipeline_core::protocol::parse_line(line)
        {
            return Some(result);
        }
    }
    None
}

fn build_record(
    run_id: &str,
    cwd: &str,
    mode: RunMode,
    stdout: &str,
    docker_exit_code: i64,
    cause: &StopCause,
    attributor: &UsageAttributor,
) -> RunRecord {
    let timestamp = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true);

    if let StopCause::Interrupted = cause {
        return RunRecord {
            run_id: run_id.to_string(),
            timestamp,
            status: RunRecordStatus::Error,
            docker_exit_code: docker_exit_code as i32,
            cwd: cwd.to_string(),
            pipeline: None,
            agent_result: None,
            normalized: None,
            error_type: Some("interrupted".to_string()),
            error_message: Some("run interrupted by user".to_string()),
        };
    }
    if let StopCause::IdleTimeout(secs) = cause {
        return RunRecord {
            run_id: run_id.to_string(),
            timestamp,
            status: RunRecordStatus::Error,
            docker_exit_code: docker_exit_code as i32,
            cwd: cwd.to_string(),
            pipeline: None,
            agent_result: None,
            normalized: None,
            error_type: Some("timeout".to_string()),
            error_message: Some(format!("whole-run idle watchdog expired after {secs}s")),
        };
    }

    match mode {
        RunMode::Pipeline => match last_pipeline_result(stdout) {
            Some(result) => {
                let node_runs: Vec<NodeRunRecord> = result
                    .node_runs
                    .into_iter()
                    .map(|mut n| {
                        n.normalized = attributor.usage_for(&n.node_id, &n.node_run_id);
                        n
                    })
                    .collect();
                let total = node_runs
                    .iter()
                    .fold(pipeline_core::types::NormalizedUsage::default(), |mut acc, n| {
                        if let Some(u) = &n.normalized {
                            acc.add(u);
                        }
                        acc
                    });
                let (error_type, error_message) = classify_pipeline(&result, docker_exit_code);
                RunRecord {
                    run_id: run_id.to_string(),
                    timestamp,
                    status: if error_type.is_some() {
                        RunRecordStatus::Error
                    } else {
                        RunRecordStatus::Success
                    },
                    docker_exit_code: docker_exit_code as i32,
                    cwd: cwd.to_string(),
                    pipeline: Some(PipelineRecord {
                        status: result.status,
                        entry_node: result.entry_node,
                        terminal_node: result.terminal_node,
                        terminal_status: result.terminal_status,
                        exit_code: result.exit_code,
                        iterations: result.iterations,
                        node_run_count: result.node_run_count,
                        failed_node_count: result.failed_node_count,
                        node_runs,
                    }),
                    agent_result: None,
                    normalized: Some(total),
                    error_type,
                    error_message,
                }
            }
            None => RunRecord {
                run_id: run_id.to_string(),
                timestamp,
                status: RunRecordStatus::ParseError,
                docker_exit_code: docker_exit_code as i32,
                cwd: cwd.to_string(),
                pipeline: None,
                agent_result: None,
                normalized: None,
                error_type: Some("pipeline_parse_error".to_string()),
                error_message: Some(Error::PipelineParseError.to_string()),
            },
        },
        RunMode::SinglePrompt => match last_result_event(stdout) {
            Some(result) => {
                let usage = result.normalize();
                let error_type = if result.is_error {
                    Some("agent_error".to_string())
                } else if docker_exit_code != 0 {
                    Some("docker_exit_error".to_string())
                } else {
                    None
                };
                RunRecord {
                    run_id: run_id.to_string(),
                    timestamp,
                    status: if error_type.is_some() {
                        RunRecordStatus::Error
                    } else {
                        RunRecordStatus::Success
                    },
                    docker_exit_code: docker_exit_code as i32,
                    cwd: cwd.to_string(),
                    pipeline: None,
                    agent_result: Some(AgentResultRecord {
                        session_id: result.session_id.clone(),
                        is_error: result.is_error,
                        result: result.result.clone(),
                    }),
                    normalized: Some(usage),
                    error_type,
                    error_message: None,
                }
            }
            None => RunRecord {
                run_id: run_id.to_string(),
                timestamp,
                status: RunRecordStatus::ParseError,
                docker_exit_code: docker_exit_code as i32,
                cwd: cwd.to_string(),
                pipeline: None,
                agent_result: None,
                normalized: None,
                error_type: Some("parse_error".to_string()),
                error_message: Some(Error::ParseError.to_string()),
            },
        },
    }
}

fn classify_pipeline(
    result: &pipeline_core::types::PipelineResult,
    docker_exit_code: i64,
) -> (Option<String>, Option<String>) {
    if !result.is_error {
        return (None, None);
    }
    if result
        .node_runs
        .iter()
        .any(|n| n.error_message.as_deref().is_some_and(is_timeout_message))
    {
        return (
            Some("pipeline_timeout".to_string()),
            Some("a node idle-timed out".to_string()),
        );
    }
    if docker_exit_code != 0 {
        return (
            Some("docker_exit_error".to_string()),
            Some(format!("container exited with code {docker_exit_code}")),
        );
    }
    (
        Some("pipeline_error".to_string()),
        Some(format!(
            "pipeline terminated in `{}`",
            result.terminal_node.clone().unwrap_or_default()
        )),
    )
}

fn is_timeout_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("idle timeout") || lower.contains("timed out")
}

/// The process exit code the host CLI should surface for a composed `RunRecord`
/// (§6/§7). Distinct from `RunRecord.docker_exit_code`, which always records the raw
/// container exit status: interruption and the whole-run watchdog never leave the
/// container's own exit code in a state that matches the table in §6, so those two
/// causes are mapped explicitly and everything else passes the docker exit code
/// through (it already equals the pipeline/agent exit code on the success/error path,
/// since the container's own process exits with that code).
pub fn process_exit_code(record: &RunRecord) -> i32 {
    match record.error_type.as_deref() {
        Some("interrupted") => pipeline_core::types::exit_code::INTERRUPTED,
        Some("timeout") => pipeline_core::types::exit_code::IDLE_TIMEOUT,
        _ => record.docker_exit_code,
    }
}

fn error_record(run_id: &str, cwd: &str, err: &Error) -> RunRecord {
    RunRecord {
        run_id: run_id.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
        status: RunRecordStatus::ExecError,
        docker_exit_code: err.exit_code(),
        cwd: cwd.to_string(),
        pipeline: None,
        agent_result: None,
        normalized: None,
        error_type: err.error_type().map(|s| s.to_string()),
        error_message: Some(err.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_pipeline_result_scans_from_end() {
        let stdout = concat!(
            "{\"type\":\"pipeline_event\",\"event\":\"plan_start\",\"version\":\"v2\",\"entry_node\":\"main\",\"node_count\":1,\"started_at\":\"2026-07-28T00:00:00.000Z\"}\n",
            "{\"type\":\"pipeline_result\",\"version\":\"v2\",\"status\":\"success\",\"is_error\":false,\"entry_node\":\"main\",\"terminal_node\":\"success\",\"terminal_status\":\"success\",\"exit_code\":0,\"iterations\":1,\"node_run_count\":0,\"failed_node_count\":0,\"node_runs\":[]}\n",
        );
        let result = last_pipeline_result(stdout).unwrap();
        assert_eq!(result.entry_node, "main");
    }

    #[test]
    fn missing_pipeline_result_is_none() {
        let stdout = "not json\nplain text\n";
        assert!(last_pipeline_result(stdout).is_none());
    }

    #[test]
    fn timeout_message_detection_is_case_insensitive() {
        assert!(is_timeout_message("Idle Timeout after 30s"));
        assert!(is_timeout_message("Command timed out"));
        assert!(!is_timeout_message("schema validation failed"));
    }

    fn base_record(error_type: Option<&str>, docker_exit_code: i32) -> RunRecord {
        RunRecord {
            run_id: "r1".into(),
            timestamp: "2026-07-28T00:00:00.000Z".into(),
            status: RunRecordStatus::Error,
            docker_exit_code,
            cwd: "/work".into(),
            pipeline: None,
            agent_result: None,
            normalized: None,
            error_type: error_type.map(|s| s.to_string()),
            error_message: None,
        }
    }

    #[test]
    fn interrupted_exit_code_is_130_regardless_of_docker_exit_code() {
        let record = base_record(Some("interrupted"), -1);
        assert_eq!(process_exit_code(&record), 130);
    }

    #[test]
    fn idle_watchdog_exit_code_is_negative_one() {
        let record = base_record(Some("timeout"), 0);
        assert_eq!(process_exit_code(&record), -1);
    }

    #[test]
    fn other_causes_pass_through_docker_exit_code() {
        let record = base_record(Some("pipeline_error"), 3);
        assert_eq!(process_exit_code(&record), 3);
    }
}
