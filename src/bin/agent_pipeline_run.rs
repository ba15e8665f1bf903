//! Host-side binary: the streaming Docker Engine driver. Cleans stale containers for
//! this workspace, runs a single container through the pipeline or single-prompt
//! executor, attributes usage, and persists the resulting `RunRecord` (§6).

use clap::Parser;
use pipeline_host::docker::{DockerMode, DockerRunner, RunConfig};
use pipeline_host::host::{self, HostRunRequest, RunMode};
use pipeline_host::progress::LineProgressView;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Host-side run orchestrator for the containerized agent pipeline.
#[derive(Parser)]
#[command(name = "agent-pipeline-run")]
struct Cli {
    /// Workspace directory mounted into the container at /workspace-source.
    #[arg(long, default_value = ".")]
    cwd: PathBuf,

    /// Container image reference to run.
    #[arg(long, env = "AGENTPIPE_IMAGE")]
    image: String,

    /// Path (relative to --cwd) to a plan JSON file. Mutually exclusive with --prompt.
    #[arg(long)]
    plan: Option<String>,

    /// A single prompt to run directly. Mutually exclusive with --plan.
    #[arg(long)]
    prompt: Option<String>,

    /// Decision schema path (relative to --cwd), required alongside --prompt.
    #[arg(long)]
    schema: Option<String>,

    /// Root directory under which run directories are persisted.
    #[arg(long, env = "AGENTPIPE_RUNS_ROOT", default_value = "./runs")]
    runs_root: PathBuf,

    /// Whole-run idle timeout, in seconds.
    #[arg(long, env = "AGENTPIPE_WHOLE_RUN_IDLE_TIMEOUT_SEC", default_value_t = 900)]
    idle_timeout_sec: u64,

    /// Per-node agent idle timeout passed through to the container.
    #[arg(long, env = "AGENTPIPE_IDLE_TIMEOUT_SEC", default_value_t = 120)]
    node_idle_timeout_sec: u64,

    /// Docker networking/socket mode: none, dind, or dood.
    #[arg(long, default_value = "none")]
    docker_mode: String,

    /// Enable the progress tree view. The TUI's cosmetic layout is an external
    /// collaborator (§1); this flag is accepted for CLI-surface compatibility and
    /// currently renders the same line-buffered summary as the default.
    #[arg(long, default_value_t = false)]
    tui: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .json()
        .init();

    let cli = Cli::parse();
    let _ = cli.tui;

    let docker_mode: DockerMode = cli
        .docker_mode
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let container_cmd = build_container_cmd(&cli)?;
    let mode = if cli.plan.is_some() {
        RunMode::Pipeline
    } else {
        RunMode::SinglePrompt
    };

    let cfg = RunConfig {
        image: cli.image.clone(),
        cwd: cli.cwd.clone(),
        docker_mode,
        whole_run_idle_timeout_sec: cli.idle_timeout_sec,
        env: vec![(
            "AGENTPIPE_IDLE_TIMEOUT_SEC".to_string(),
            cli.node_idle_timeout_sec.to_string(),
        )],
    };

    let cancel = CancellationToken::new();
    let mut view = LineProgressView::new(cancel.clone());
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    let runner = DockerRunner::connect()?;
    let result = host::run(
        &runner,
        HostRunRequest {
            cfg,
            container_cmd,
            mode,
            run_id: None,
            view: &mut view,
        },
        &cancel,
    )
    .await;

    let now = chrono::Utc::now();
    let persisted = pipeline_host::persistence::persist(
        &cli.runs_root,
        now,
        &result.record,
        &result.stdout,
        &result.stderr,
    )?;
    tracing::info!(dir = %persisted.dir.display(), "run persisted");

    std::process::exit(host::process_exit_code(&result.record));
}

fn build_container_cmd(cli: &Cli) -> anyhow::Result<Vec<String>> {
    match (&cli.plan, &cli.prompt) {
        (Some(_), Some(_)) => anyhow::bail!("--plan and --prompt are mutually exclusive"),
        (Some(plan), None) => Ok(vec![
            "agent-pipeline".to_string(),
            "--plan".to_string(),
            format!("/workspace-source/{plan}"),
            "--workspace-root".to_string(),
            "/workspace-source".to_string(),
        ]),
        (None, Some(prompt)) => {
            let schema = cli
                .schema
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("--schema is required with --prompt"))?;
            Ok(vec![
                "agent-pipeline".to_string(),
                "--prompt".to_string(),
                prompt.clone(),
                "--schema".to_string(),
                format!("/workspace-source/{schema}"),
            ])
        }
        (None, None) => anyhow::bail!("one of --plan or --prompt is required"),
    }
}
