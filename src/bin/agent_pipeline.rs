//! Container-side binary: drives a validated graph plan to a terminal state (pipeline
//! mode) or runs a single agent prompt straight through (single-prompt mode), emitting
//! the stream-JSON protocol on stdout and diagnostics on stderr (§6).

use clap::Parser;
use pipeline_core::plan::PlanLoader;
use pipeline_core::protocol::{ParsedLine, ResultEvent, StreamEvent};
use pipeline_core::types::exit_code;
use pipeline_exec::executor::{run_pipeline, ExecutorSink};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Container-side pipeline executor / single-prompt runner.
#[derive(Parser)]
#[command(name = "agent-pipeline")]
struct Cli {
    /// Path to a plan JSON file. Mutually exclusive with --prompt.
    #[arg(long)]
    plan: Option<PathBuf>,

    /// A single prompt to run directly, bypassing the plan executor.
    #[arg(long)]
    prompt: Option<String>,

    /// Decision schema file, required alongside --prompt.
    #[arg(long)]
    schema: Option<PathBuf>,

    /// Workspace root confining prompt_file/schema_file/cwd resolution.
    #[arg(long, default_value = ".")]
    workspace_root: PathBuf,

    /// Per-node (or single-prompt) idle timeout, in seconds.
    #[arg(long, env = "AGENTPIPE_IDLE_TIMEOUT_SEC", default_value_t = 120)]
    idle_timeout_sec: u64,

    /// Command-node wall-clock timeout default, in seconds.
    #[arg(long, env = "AGENTPIPE_COMMAND_TIMEOUT_SEC")]
    command_timeout_sec: Option<u64>,

    /// Pipeline iteration limit.
    #[arg(long)]
    max_iterations: Option<u64>,

    /// Same-node hit limit.
    #[arg(long)]
    max_same_node_hits: Option<u64>,

    /// `KEY=VALUE` template variable for inline prompt substitution; repeatable.
    #[arg(long = "var")]
    vars: Vec<String>,
}

struct StdoutSink;

impl ExecutorSink for StdoutSink {
    fn emit(&mut self, line: &str) {
        println!("{line}");
    }
    fn raw_stdout(&mut self, line: &str) {
        println!("{line}");
    }
    fn raw_stderr(&mut self, line: &str) {
        eprintln!("{line}");
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let code = match (&cli.plan, &cli.prompt) {
        (Some(_), Some(_)) => {
            eprintln!("error: --plan and --prompt are mutually exclusive");
            exit_code::INVALID_PLAN
        }
        (Some(plan_path), None) => run_plan_mode(&cli, plan_path).await,
        (None, Some(prompt)) => run_single_prompt_mode(&cli, prompt).await,
        (None, None) => {
            eprintln!("error: one of --plan or --prompt is required");
            exit_code::INVALID_PLAN
        }
    };
    std::process::exit(code);
}

async fn run_plan_mode(cli: &Cli, plan_path: &PathBuf) -> i32 {
    let plan_json = match std::fs::read_to_string(plan_path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("error: failed to read plan file {}: {e}", plan_path.display());
            return exit_code::INVALID_PLAN;
        }
    };

    let mut variables = HashMap::new();
    for kv in &cli.vars {
        match kv.split_once('=') {
            Some((k, v)) => {
                variables.insert(k.to_string(), v.to_string());
            }
            None => {
                eprintln!("error: --var `{kv}` is not in KEY=VALUE form");
                return exit_code::INVALID_PLAN;
            }
        }
    }

    let mut plan = match PlanLoader::load(&plan_json, &cli.workspace_root, &variables) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("error: plan failed to load: {e}");
            return exit_code::INVALID_PLAN;
        }
    };
    if let Some(n) = cli.max_iterations {
        plan.limits.max_iterations = n;
    }
    if let Some(n) = cli.max_same_node_hits {
        plan.limits.max_same_node_hits = n;
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    let mut sink = StdoutSink;
    let outcome = run_pipeline(&plan, &cancel, &mut sink).await;
    outcome.result.exit_code
}

async fn run_single_prompt_mode(cli: &Cli, prompt: &str) -> i32 {
    let Some(schema_path) = &cli.schema else {
        eprintln!("error: --schema is required with --prompt");
        return exit_code::AGENT_ERROR;
    };
    let schema_json = match std::fs::read_to_string(schema_path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("error: failed to read schema file {}: {e}", schema_path.display());
            return exit_code::AGENT_ERROR;
        }
    };

    let mut cmd = Command::new("agent");
    cmd.arg("--verbose")
        .arg("--output-format")
        .arg("stream-json")
        .arg("--json-schema")
        .arg(&schema_json)
        .arg(prompt)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("error: failed to spawn agent process: {e}");
            return exit_code::AGENT_ERROR;
        }
    };

    let stdout = child.stdout.take().expect("piped stdout");
    let stderr = child.stderr.take().expect("piped stderr");
    let mut stdout_lines = BufReader::new(stdout).lines();
    let mut stderr_lines = BufReader::new(stderr).lines();

    let idle = Duration::from_secs(cli.idle_timeout_sec.max(1));
    let mut deadline = Instant::now() + idle;
    let mut stdout_done = false;
    let mut stderr_done = false;
    let mut last_result: Option<ResultEvent> = None;
    let mut timed_out = false;

    loop {
        tokio::select! {
            biased;

            line = stdout_lines.next_line(), if !stdout_done => {
                match line {
                    Ok(Some(l)) => {
                        deadline = Instant::now() + idle;
                        println!("{l}");
                        if let ParsedLine::Event(StreamEvent::Result(r)) =
                            pipeline_core::protocol::parse_line(&l)
                        {
                            last_result = Some(r);
                        }
                    }
                    _ => stdout_done = true,
                }
            }

            line = stderr_lines.next_line(), if !stderr_done => {
                match line {
                    Ok(Some(l)) => {
                        deadline = Instant::now() + idle;
                        eprintln!("{l}");
                    }
                    _ => stderr_done = true,
                }
            }

            status = child.wait(), if stdout_done && stderr_done => {
                let _ = status;
                break;
            }

            _ = tokio::time::sleep_until(deadline.into()) => {
                timed_out = true;
                terminate_gracefully(&mut child).await;
                break;
            }
        }
    }

    if timed_out {
        eprintln!("error: no activity for {} seconds", cli.idle_timeout_sec);
        return exit_code::AGENT_ERROR;
    }

    match last_result {
        None => {
            eprintln!("error: final result event not found in agent stream");
            exit_code::AGENT_ERROR
        }
        Some(r) if r.is_error => exit_code::AGENT_ERROR,
        Some(_) => exit_code::SUCCESS,
    }
}

async fn terminate_gracefully(child: &mut tokio::process::Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
    }
    let graceful = tokio::time::timeout(Duration::from_secs(10), child.wait()).await;
    if graceful.is_err() {
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}
