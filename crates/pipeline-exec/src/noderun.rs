//! Node runner (C4) — spawns an agent or command child, demultiplexes its stdout/stderr
//! through to this process's own stdout/stderr, enforces an idle timeout, and returns a
//! normalized [`NodeRunRecord`] plus (for agent runs) the parsed decision payload.

use pipeline_core::plan::{self, AgentRun, CommandRun, Defaults, RunSpec};
use pipeline_core::protocol::SystemEvent;
use pipeline_core::schema;
use pipeline_core::types::{NodeKind, NodeRunRecord, NodeStatus, NormalizedUsage, PromptSourceKind};
use serde_json::Value;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Callbacks the executor (C5) supplies to observe a node run as it happens.
pub trait NodeEventSink: Send {
    /// A raw line the child wrote to stdout or stderr, forwarded verbatim to this
    /// process's corresponding stream.
    fn raw_line(&mut self, line: &str, is_stderr: bool);
    /// The agent's `session_id`, extracted from its first `system/init` event.
    fn session_bind(&mut self, session_id: &str);
    /// The idle timer fired.
    fn idle_timeout(&mut self, idle_timeout_sec: u64, reason: &str);
}

pub struct NodeRunContext<'a> {
    pub node_id: &'a str,
    pub node_run_id: &'a str,
}

pub struct NodeRunOutcome {
    pub record: NodeRunRecord,
    pub decision: Option<Value>,
}

pub async fn run_node(
    spec: &RunSpec,
    ctx: &NodeRunContext<'_>,
    defaults: &Defaults,
    cancel: &CancellationToken,
    sink: &mut dyn NodeEventSink,
) -> NodeRunOutcome {
    match spec {
        RunSpec::Agent(agent) => run_agent(agent, ctx, defaults, cancel, sink).await,
        RunSpec::Command(command) => run_command(command, ctx, defaults, cancel, sink).await,
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

async fn run_agent(
    agent: &AgentRun,
    ctx: &NodeRunContext<'_>,
    defaults: &Defaults,
    cancel: &CancellationToken,
    sink: &mut dyn NodeEventSink,
) -> NodeRunOutcome {
    let idle_timeout_sec = plan::resolve_idle_timeout(agent, defaults);
    let started_at = now_rfc3339();
    let start = Instant::now();

    let schema_json = agent.decision_schema.to_string();
    let mut cmd = Command::new("agent");
    cmd.arg("--verbose")
        .arg("--output-format")
        .arg("stream-json")
        .arg("--json-schema")
        .arg(&schema_json)
        .arg(&agent.resolved_prompt)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return finish_error(
                ctx,
                NodeKind::Agent,
                prompt_source_kind(agent),
                Some(agent.model.clone()),
                started_at,
                start,
                format!("failed to spawn agent process: {e}"),
            )
        }
    };

    let mut session_id: Option<String> = None;
    let mut result_line: Option<ResultPayload> = None;
    let mut usage: Option<NormalizedUsage> = None;
    let mut timed_out = false;
    let mut timeout_reason = String::new();

    let outcome = drive_child(
        &mut child,
        idle_timeout_sec,
        cancel,
        sink,
        |line, sink| {
            use pipeline_core::protocol::{ParsedLine, StreamEvent};
            match pipeline_core::protocol::parse_line(line) {
                ParsedLine::Event(StreamEvent::System(SystemEvent {
                    subtype,
                    session_id: Some(sid),
                    ..
                })) if subtype == "init" && session_id.is_none() => {
                    session_id = Some(sid.clone());
                    sink.session_bind(&sid);
                }
                ParsedLine::Event(StreamEvent::Result(r)) => {
                    usage = Some(r.normalize());
                    result_line = Some(ResultPayload {
                        is_error: r.is_error,
                        result: r.result.clone(),
                    });
                }
                _ => {}
            }
        },
    )
    .await;

    match outcome {
        DriveOutcome::Exited(status) => {
            let duration_ms = start.elapsed().as_millis() as u64;
            let finished_at = now_rfc3339();
            let exit_code = status.code().unwrap_or(-1);
            let signal = unix_signal_name(&status);

            let (status_enum, decision, error_message) = match result_line {
                None => (
                    NodeStatus::Error,
                    None,
                    Some("final result event not found in agent stream".to_string()),
                ),
                Some(ResultPayload { is_error: true, .. }) => (
                    NodeStatus::Error,
                    None,
                    Some("agent reported an error result".to_string()),
                ),
                Some(ResultPayload { result, .. }) => match decode_decision(&result) {
                    Ok(value) => {
                        let errors = schema::validate(&agent.decision_schema, &value);
                        if errors.is_empty() {
                            (NodeStatus::Success, Some(value), None)
                        } else {
                            (
                                NodeStatus::Error,
                                None,
                                Some(format!(
                                    "decision schema validation failed: {}",
                                    errors.join("; ")
                                )),
                            )
                        }
                    }
                    Err(message) => (NodeStatus::Error, None, Some(message)),
                },
            };

            NodeRunOutcome {
                record: NodeRunRecord {
                    node_id: ctx.node_id.to_string(),
                    node_run_id: ctx.node_run_id.to_string(),
                    kind: NodeKind::Agent,
                    status: status_enum,
                    model: Some(agent.model.clone()),
                    prompt_source: prompt_source_kind(agent),
                    prompt_file: agent
                        .prompt_file
                        .as_ref()
                        .map(|p| p.display().to_string()),
                    cmd: None,
                    cwd: None,
                    exit_code,
                    signal,
                    timed_out: false,
                    started_at,
                    finished_at,
                    duration_ms,
                    error_message,
                    normalized: usage,
                },
                decision,
            }
        }
        DriveOutcome::TimedOut { reason } => {
            timed_out = true;
            timeout_reason = reason;
            sink.idle_timeout(idle_timeout_sec, &timeout_reason);
            let duration_ms = start.elapsed().as_millis() as u64;
            let finished_at = now_rfc3339();
            NodeRunOutcome {
                record: NodeRunRecord {
                    node_id: ctx.node_id.to_string(),
                    node_run_id: ctx.node_run_id.to_string(),
                    kind: NodeKind::Agent,
                    status: NodeStatus::Error,
                    model: Some(agent.model.clone()),
                    prompt_source: prompt_source_kind(agent),
                    prompt_file: agent
                        .prompt_file
                        .as_ref()
                        .map(|p| p.display().to_string()),
                    cmd: None,
                    cwd: None,
                    exit_code: 124,
                    signal: String::new(),
                    timed_out,
                    started_at,
                    finished_at,
                    duration_ms,
                    error_message: Some(timeout_reason),
                    normalized: usage,
                },
                decision: None,
            }
        }
    }
}

async fn run_command(
    command: &CommandRun,
    ctx: &NodeRunContext<'_>,
    defaults: &Defaults,
    cancel: &CancellationToken,
    sink: &mut dyn NodeEventSink,
) -> NodeRunOutcome {
    let timeout_sec = plan::resolve_command_timeout(command, defaults);
    let started_at = now_rfc3339();
    let start = Instant::now();

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(&command.cmd)
        .current_dir(&command.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return NodeRunOutcome {
                record: command_record(
                    ctx,
                    command,
                    started_at,
                    start,
                    -1,
                    String::new(),
                    false,
                    Some(format!("failed to spawn command: {e}")),
                ),
                decision: None,
            }
        }
    };

    let deadline = Instant::now() + Duration::from_secs(timeout_sec.max(1));
    let result = drive_child_wall_clock(&mut child, deadline, cancel, sink).await;

    let duration_ms = start.elapsed().as_millis() as u64;
    match result {
        DriveOutcome::Exited(status) => NodeRunOutcome {
            record: command_record(
                ctx,
                command,
                started_at,
                start,
                status.code().unwrap_or(-1),
                unix_signal_name(&status),
                false,
                None,
            ),
            decision: None,
        },
        DriveOutcome::TimedOut { reason } => {
            let _ = duration_ms;
            NodeRunOutcome {
                record: command_record(
                    ctx,
                    command,
                    started_at,
                    start,
                    124,
                    String::new(),
                    true,
                    Some(reason),
                ),
                decision: None,
            }
        }
    }
}

fn command_record(
    ctx: &NodeRunContext<'_>,
    command: &CommandRun,
    started_at: String,
    start: Instant,
    exit_code: i32,
    signal: String,
    timed_out: bool,
    error_message: Option<String>,
) -> NodeRunRecord {
    NodeRunRecord {
        node_id: ctx.node_id.to_string(),
        node_run_id: ctx.node_run_id.to_string(),
        kind: NodeKind::Command,
        status: if error_message.is_some() || exit_code != 0 {
            NodeStatus::Error
        } else {
            NodeStatus::Success
        },
        model: None,
        prompt_source: PromptSourceKind::None,
        prompt_file: None,
        cmd: Some(command.cmd.clone()),
        cwd: Some(command.cwd.display().to_string()),
        exit_code,
        signal,
        timed_out,
        started_at,
        finished_at: now_rfc3339(),
        duration_ms: start.elapsed().as_millis() as u64,
        error_message,
        normalized: None,
    }
}

fn finish_error(
    ctx: &NodeRunContext<'_>,
    kind: NodeKind,
    prompt_source: PromptSourceKind,
    model: Option<String>,
    started_at: String,
    start: Instant,
    message: String,
) -> NodeRunOutcome {
    NodeRunOutcome {
        record: NodeRunRecord {
            node_id: ctx.node_id.to_string(),
            node_run_id: ctx.node_run_id.to_string(),
            kind,
            status: NodeStatus::Error,
            model,
            prompt_source,
            prompt_file: None,
            cmd: None,
            cwd: None,
            exit_code: -1,
            signal: String::new(),
            timed_out: false,
            started_at,
            finished_at: now_rfc3339(),
            duration_ms: start.elapsed().as_millis() as u64,
            error_message: Some(message),
            normalized: None,
        },
        decision: None,
    }
}

struct ResultPayload {
    is_error: bool,
    result: Value,
}

fn decode_decision(result: &Value) -> std::result::Result<Value, String> {
    match result {
        Value::Object(_) => Ok(result.clone()),
        Value::String(s) => serde_json::from_str(s)
            .map_err(|e| format!("decision payload string is not valid JSON: {e}")),
        _ => Err("decision payload must be a JSON object".to_string()),
    }
}

fn prompt_source_kind(agent: &AgentRun) -> PromptSourceKind {
    match agent.prompt_source {
        plan::PromptSource::Prompt => PromptSourceKind::Prompt,
        plan::PromptSource::PromptFile => PromptSourceKind::PromptFile,
        plan::PromptSource::None => PromptSourceKind::None,
    }
}

fn unix_signal_name(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    match status.signal() {
        Some(sig) => format!("SIG{sig}"),
        None => String::new(),
    }
}

enum DriveOutcome {
    Exited(std::process::ExitStatus),
    TimedOut { reason: String },
}

/// Drive a child to completion while forwarding every line it writes and resetting an
/// idle deadline on each byte received (§4.4). A single select loop, no shared atomics
/// needed since this runs on one task per node.
async fn drive_child(
    child: &mut Child,
    idle_timeout_sec: u64,
    cancel: &CancellationToken,
    sink: &mut dyn NodeEventSink,
    mut on_stdout_line: impl FnMut(&str, &mut dyn NodeEventSink),
) -> DriveOutcome {
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let idle = Duration::from_secs(idle_timeout_sec.max(1));
    let mut deadline = Instant::now() + idle;
    let mut stdout_done = false;
    let mut stderr_done = false;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                terminate_gracefully(child).await;
                return DriveOutcome::TimedOut { reason: "run cancelled".to_string() };
            }

            line = stdout_lines.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(l)) => {
                        deadline = Instant::now() + idle;
                        sink.raw_line(&l, false);
                        on_stdout_line(&l, sink);
                    }
                    Ok(None) => stdout_done = true,
                    Err(_) => stdout_done = true,
                }
            }

            line = stderr_lines.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(l)) => {
                        deadline = Instant::now() + idle;
                        sink.raw_line(&l, true);
                    }
                    Ok(None) => stderr_done = true,
                    Err(_) => stderr_done = true,
                }
            }

            status = child.wait(), if stdout_done && stderr_done => {
                return DriveOutcome::Exited(status.unwrap_or_else(|_| {
                    std::os::unix::process::ExitStatusExt::from_raw(-1)
                }));
            }

            _ = tokio::time::sleep_until(deadline.into()) => {
                let reason = format!("no activity for {idle_timeout_sec} seconds");
                terminate_gracefully(child).await;
                return DriveOutcome::TimedOut { reason };
            }
        }
    }
}

/// Wall-clock variant for command runs: no idle reset, a single fixed deadline.
async fn drive_child_wall_clock(
    child: &mut Child,
    deadline: Instant,
    cancel: &CancellationToken,
    sink: &mut dyn NodeEventSink,
) -> DriveOutcome {
    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();
    let mut stdout_done = false;
    let mut stderr_done = false;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                terminate_gracefully(child).await;
                return DriveOutcome::TimedOut { reason: "run cancelled".to_string() };
            }

            line = stdout_lines.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(l)) => sink.raw_line(&l, false),
                    _ => stdout_done = true,
                }
            }

            line = stderr_lines.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(l)) => sink.raw_line(&l, true),
                    _ => stderr_done = true,
                }
            }

            status = child.wait(), if stdout_done && stderr_done => {
                return DriveOutcome::Exited(status.unwrap_or_else(|_| {
                    std::os::unix::process::ExitStatusExt::from_raw(-1)
                }));
            }

            _ = tokio::time::sleep_until(deadline.into()) => {
                terminate_gracefully(child).await;
                return DriveOutcome::TimedOut { reason: "command timed out".to_string() };
            }
        }
    }
}

/// SIGTERM, then SIGKILL if the child hasn't exited within the grace period (§4.4).
async fn terminate_gracefully(child: &mut Child) {
    if let Some(pid) = child.id() {
        // SAFETY: `pid` is this child's own process id; sending it a signal is the
        // normal graceful-shutdown request and cannot affect unrelated processes.
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    let graceful = tokio::time::timeout(GRACE_PERIOD, child.wait()).await;
    if graceful.is_err() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_decision_accepts_object() {
        let v = serde_json::json!({"next": "success"});
        assert_eq!(decode_decision(&v).unwrap(), v);
    }

    #[test]
    fn decode_decision_accepts_json_string() {
        let v = Value::String(r#"{"next":"success"}"#.to_string());
        let decoded = decode_decision(&v).unwrap();
        assert_eq!(decoded["next"], "success");
    }

    #[test]
    fn decode_decision_rejects_number() {
        let v = Value::from(42);
        assert!(decode_decision(&v).is_err());
    }
}
