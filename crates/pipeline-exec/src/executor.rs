//! Pipeline executor (C5) — drives the state machine over a [`LoadedPlan`] using the
//! node runner (C4), the condition language (C1), and the decision validator (via C4).
//!
//! Emits every event named in §4.5 as a single-line `StreamEvent` on the sink, and
//! returns the final `pipeline_result` / exit code the host (or the container-side main)
//! surfaces.

use crate::noderun::{self, NodeEventSink, NodeRunContext};
use pipeline_core::plan::{LoadedPlan, Node};
use pipeline_core::protocol::{PipelineEvent, StreamEvent};
use pipeline_core::types::{
    exit_code, DecisionScope, NodeInfo, NodeKind, NodeRunRecord, NodeStatus, PipelineInfo,
    PipelineResult, RunOutcome, RunStatus, TerminalStatus,
};
use std::collections::HashMap;
use std::time::Instant;
use tokio_util::sync::CancellationToken;

/// Where the executor writes wire-protocol lines and raw child output. The container-side
/// `main` wires this straight to stdout/stderr; tests can capture it in a buffer.
pub trait ExecutorSink: Send {
    // NOTE: `Send` so a forwarder holding `&mut dyn ExecutorSink` can satisfy
    // `NodeEventSink: Send` across the `.await` points in `noderun::run_node`.
    fn emit(&mut self, line: &str);
    fn raw_stdout(&mut self, line: &str);
    fn raw_stderr(&mut self, line: &str);
}

struct EventForwarder<'a> {
    sink: &'a mut dyn ExecutorSink,
    node_id: String,
    node_run_id: String,
}

impl NodeEventSink for EventForwarder<'_> {
    fn raw_line(&mut self, line: &str, is_stderr: bool) {
        if is_stderr {
            self.sink.raw_stderr(line);
        } else {
            self.sink.raw_stdout(line);
        }
    }

    fn session_bind(&mut self, session_id: &str) {
        let event = StreamEvent::pipeline(PipelineEvent::NodeSessionBind {
            node_id: self.node_id.clone(),
            node_run_id: self.node_run_id.clone(),
            session_id: session_id.to_string(),
        });
        self.sink.emit(&event.to_line());
    }

    fn idle_timeout(&mut self, idle_timeout_sec: u64, reason: &str) {
        let event = StreamEvent::pipeline(PipelineEvent::NodeTimeout {
            node_id: self.node_id.clone(),
            node_run_id: self.node_run_id.clone(),
            idle_timeout_sec,
            reason: reason.to_string(),
        });
        self.sink.emit(&event.to_line());
    }
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

/// Outcome of driving the plan to a stop, whatever the reason.
pub struct PipelineOutcome {
    pub result: PipelineResult,
}

/// Drive `plan` from its entry node to a terminal state or a system error, emitting every
/// event in §4.5 on `sink` as it goes.
pub async fn run_pipeline(
    plan: &LoadedPlan,
    cancel: &CancellationToken,
    sink: &mut dyn ExecutorSink,
) -> PipelineOutcome {
    let started_at = now_rfc3339();
    let start = Instant::now();

    sink.emit(
        &StreamEvent::pipeline(PipelineEvent::PlanStart {
            version: plan.version.clone(),
            entry_node: plan.entry.clone(),
            node_count: plan.node_count() as u64,
            started_at: started_at.clone(),
        })
        .to_line(),
    );

    let mut current = plan.entry.clone();
    let mut iteration: u64 = 0;
    let mut hit_counts: HashMap<String, u64> = HashMap::new();
    let mut node_runs: Vec<NodeRunRecord> = Vec::new();

    loop {
        // Step 1: resolve the current node.
        let Some(node) = plan.nodes.get(&current) else {
            return finish(
                plan,
                &started_at,
                start,
                sink,
                RunStatus::Error,
                None,
                None,
                exit_code::INVALID_PLAN,
                iteration,
                node_runs,
            );
        };

        // Step 2: terminal nodes stop the run.
        if let Node::Terminal(terminal) = node {
            let status = if terminal.terminal_status == TerminalStatus::Success {
                RunStatus::Success
            } else {
                RunStatus::Error
            };
            return finish(
                plan,
                &started_at,
                start,
                sink,
                status,
                Some(current.clone()),
                Some(terminal.terminal_status),
                terminal.exit_code as i32,
                iteration,
                node_runs,
            );
        }

        let Node::Executable(exec) = node else {
            unreachable!("terminal handled above");
        };

        // Step 3: iteration limit.
        iteration += 1;
        if iteration > plan.limits.max_iterations {
            return finish(
                plan,
                &started_at,
                start,
                sink,
                RunStatus::Error,
                None,
                None,
                exit_code::LIMIT_REACHED,
                iteration,
                node_runs,
            );
        }

        // Step 4: per-node hit limit.
        let hits = hit_counts.entry(current.clone()).or_insert(0);
        *hits += 1;
        if *hits > plan.limits.max_same_node_hits {
            return finish(
                plan,
                &started_at,
                start,
                sink,
                RunStatus::Error,
                None,
                None,
                exit_code::LIMIT_REACHED,
                iteration,
                node_runs,
            );
        }
        let attempt = *hits;

        // Step 5: form the node_run_id.
        let node_run_id = format!("{current}-{}", node_runs.len() + 1);

        let (kind, model, prompt_source, prompt_file, cmd, cwd, idle_timeout_sec, timeout_sec) =
            describe_run(&exec.run);

        let node_started_at = now_rfc3339();
        sink.emit(
            &StreamEvent::pipeline(PipelineEvent::NodeStart {
                node_id: current.clone(),
                node_run_id: node_run_id.clone(),
                kind,
                model: model.clone(),
                prompt_source,
                prompt_file: prompt_file.clone(),
                cmd: cmd.clone(),
                cwd: cwd.clone(),
                iteration,
                attempt,
                idle_timeout_sec,
                timeout_sec,
                started_at: node_started_at,
            })
            .to_line(),
        );

        // Step 6: execute via C4.
        let ctx = NodeRunContext {
            node_id: &current,
            node_run_id: &node_run_id,
        };
        let mut forwarder = EventForwarder {
            sink,
            node_id: current.clone(),
            node_run_id: node_run_id.clone(),
        };
        let outcome = noderun::run_node(&exec.run, &ctx, &plan.defaults, cancel, &mut forwarder)
            .await;
        drop(forwarder);

        sink.emit(
            &StreamEvent::pipeline(PipelineEvent::NodeFinish {
                record: outcome.record.clone(),
            })
            .to_line(),
        );

        let node_failed = outcome.record.status == NodeStatus::Error;
        let total_node_runs = node_runs.len() as u64 + 1;
        node_runs.push(outcome.record.clone());

        // Step 7: build the decision scope.
        let scope = DecisionScope {
            decision: outcome.decision.clone().unwrap_or(serde_json::Value::Null),
            run: RunOutcome {
                exit_code: outcome.record.exit_code,
                signal: outcome.record.signal.clone(),
                timed_out: outcome.record.timed_out,
                status: if node_failed {
                    RunStatus::Error
                } else {
                    RunStatus::Success
                },
            },
            node: NodeInfo {
                id: current.clone(),
                kind,
                attempt,
                run_id: node_run_id.clone(),
            },
            pipeline: PipelineInfo {
                iteration,
                total_node_runs,
            },
        };
        let scope_value = scope.to_value();

        // Step 8: evaluate transitions in declared order.
        let matched = exec
            .transitions
            .iter()
            .find(|t| t.when.evaluate(&scope_value));

        let Some(transition) = matched else {
            let exit = if node_failed {
                exit_code::NODE_EXECUTION
            } else {
                exit_code::NO_TRANSITION
            };
            return finish(
                plan,
                &started_at,
                start,
                sink,
                RunStatus::Error,
                None,
                None,
                exit,
                iteration,
                node_runs,
            );
        };

        // Step 9: emit transition_taken, advance.
        sink.emit(
            &StreamEvent::pipeline(PipelineEvent::TransitionTaken {
                node_id: current.clone(),
                node_run_id: node_run_id.clone(),
                from_node: current.clone(),
                to_node: transition.to.clone(),
                when: transition.when_source.clone(),
                iteration,
            })
            .to_line(),
        );

        current = transition.to.clone();
    }
}

#[allow(clippy::too_many_arguments)]
fn finish(
    plan: &LoadedPlan,
    _started_at: &str,
    start: Instant,
    sink: &mut dyn ExecutorSink,
    status: RunStatus,
    terminal_node: Option<String>,
    terminal_status: Option<TerminalStatus>,
    exit_code_value: i32,
    iterations: u64,
    node_runs: Vec<NodeRunRecord>,
) -> PipelineOutcome {
    let finished_at = now_rfc3339();
    let duration_ms = start.elapsed().as_millis() as u64;
    let node_run_count = node_runs.len() as u64;
    let failed_node_count = node_runs
        .iter()
        .filter(|n| n.status == NodeStatus::Error)
        .count() as u64;

    sink.emit(
        &StreamEvent::pipeline(PipelineEvent::PlanFinish {
            status,
            finished_at,
            duration_ms,
            iterations,
            node_run_count,
            failed_node_count,
            terminal_node: terminal_node.clone(),
            terminal_status,
            exit_code: exit_code_value,
        })
        .to_line(),
    );

    let result = PipelineResult {
        version: pipeline_core::types::PROTOCOL_VERSION.to_string(),
        status,
        is_error: status == RunStatus::Error,
        entry_node: plan.entry.clone(),
        terminal_node,
        terminal_status,
        exit_code: exit_code_value,
        iterations,
        node_run_count,
        failed_node_count,
        node_runs,
    };
    sink.emit(&StreamEvent::PipelineResult(result.clone()).to_line());

    PipelineOutcome { result }
}

type RunDescription = (
    NodeKind,
    Option<String>,
    pipeline_core::types::PromptSourceKind,
    Option<String>,
    Option<String>,
    Option<String>,
    Option<u64>,
    Option<u64>,
);

fn describe_run(run: &pipeline_core::plan::RunSpec) -> RunDescription {
    use pipeline_core::plan::RunSpec;
    match run {
        RunSpec::Agent(agent) => (
            NodeKind::Agent,
            Some(agent.model.clone()),
            prompt_source_kind(agent.prompt_source),
            agent
                .prompt_file
                .as_ref()
                .map(|p| p.display().to_string()),
            None,
            None,
            Some(agent.idle_timeout_sec),
            None,
        ),
        RunSpec::Command(command) => (
            NodeKind::Command,
            None,
            pipeline_core::types::PromptSourceKind::None,
            None,
            Some(command.cmd.clone()),
            Some(command.cwd.display().to_string()),
            None,
            Some(command.timeout_sec),
        ),
    }
}

fn prompt_source_kind(
    source: pipeline_core::plan::PromptSource,
) -> pipeline_core::types::PromptSourceKind {
    use pipeline_core::plan::PromptSource;
    use pipeline_core::types::PromptSourceKind;
    match source {
        PromptSource::Prompt => PromptSourceKind::Prompt,
        PromptSource::PromptFile => PromptSourceKind::PromptFile,
        PromptSource::None => PromptSourceKind::None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    struct CapturingSink {
        lines: Vec<String>,
    }

    impl ExecutorSink for CapturingSink {
        fn emit(&mut self, line: &str) {
            self.lines.push(line.to_string());
        }
        fn raw_stdout(&mut self, _line: &str) {}
        fn raw_stderr(&mut self, _line: &str) {}
    }

    fn schema_fixture_dir() -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("pipeline-exec-test-{}-{}", std::process::id(), {
            use std::time::{SystemTime, UNIX_EPOCH};
            SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos()
        }));
        std::fs::create_dir_all(&p).unwrap();
        std::fs::write(
            p.join("decision.schema.json"),
            r#"{"type":"object","required":["next"],"properties":{"next":{"type":"string"}}}"#,
        )
        .unwrap();
        p
    }

    #[tokio::test]
    async fn invalid_plan_entry_emits_plan_finish_with_invalid_plan_exit_code() {
        let dir = schema_fixture_dir();
        let json = r#"{
            "version": "v2",
            "entry": "ghost",
            "nodes": {
                "main": {
                    "run": {"kind": "command", "cmd": "true"},
                    "transitions": [{"when": "true", "to": "success"}]
                }
            }
        }"#;
        // `entry` must exist per the loader, so build a plan then corrupt `entry`
        // in-memory to exercise the executor's own defensive resolve step.
        let mut plan =
            pipeline_core::plan::PlanLoader::load(
                &json.replace("\"ghost\"", "\"main\""),
                &dir,
                &StdHashMap::new(),
            )
            .unwrap();
        plan.entry = "ghost".to_string();

        let cancel = CancellationToken::new();
        let mut sink = CapturingSink { lines: Vec::new() };
        let outcome = run_pipeline(&plan, &cancel, &mut sink).await;
        assert_eq!(outcome.result.exit_code, exit_code::INVALID_PLAN);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn command_pipeline_reaches_success_terminal() {
        let dir = schema_fixture_dir();
        let json = r#"{
            "version": "v2",
            "entry": "main",
            "nodes": {
                "main": {
                    "run": {"kind": "command", "cmd": "exit 0"},
                    "transitions": [{"when": "run.exit_code == 0", "to": "success"}]
                }
            }
        }"#;
        let plan = pipeline_core::plan::PlanLoader::load(json, &dir, &StdHashMap::new()).unwrap();
        let cancel = CancellationToken::new();
        let mut sink = CapturingSink { lines: Vec::new() };
        let outcome = run_pipeline(&plan, &cancel, &mut sink).await;
        assert_eq!(outcome.result.status, RunStatus::Success);
        assert_eq!(outcome.result.terminal_node.as_deref(), Some("success"));
        assert_eq!(outcome.result.node_run_count, 1);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn no_matching_transition_on_successful_node_is_no_transition() {
        let dir = schema_fixture_dir();
        let json = r#"{
            "version": "v2",
            "entry": "main",
            "nodes": {
                "main": {
                    "run": {"kind": "command", "cmd": "exit 0"},
                    "transitions": [{"when": "run.exit_code == 1", "to": "success"}]
                }
            }
        }"#;
        let plan = pipeline_core::plan::PlanLoader::load(json, &dir, &StdHashMap::new()).unwrap();
        let cancel = CancellationToken::new();
        let mut sink = CapturingSink { lines: Vec::new() };
        let outcome = run_pipeline(&plan, &cancel, &mut sink).await;
        assert_eq!(outcome.result.exit_code, exit_code::NO_TRANSITION);
        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn same_node_hit_limit_of_one_triggers_limit_reached() {
        let dir = schema_fixture_dir();
        let json = r#"{
            "version": "v2",
            "entry": "main",
            "limits": {"max_iterations": 100, "max_same_node_hits": 1},
            "nodes": {
                "main": {
                    "run": {"kind": "command", "cmd": "exit 1"},
                    "transitions": [{"when": "true", "to": "main"}]
                }
            }
        }"#;
        let plan = pipeline_core::plan::PlanLoader::load(json, &dir, &StdHashMap::new()).unwrap();
        let cancel = CancellationToken::new();
        let mut sink = CapturingSink { lines: Vec::new() };
        let outcome = run_pipeline(&plan, &cancel, &mut sink).await;
        assert_eq!(outcome.result.exit_code, exit_code::LIMIT_REACHED);
        std::fs::remove_dir_all(&dir).ok();
    }
}
