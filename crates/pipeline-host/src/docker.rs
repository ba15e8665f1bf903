//! Docker runner (C7) — owns the single container for a run: stale-container cleanup,
//! best-effort pull, create/start, demultiplexed log streaming, a whole-run idle
//! watchdog, and cancellation semantics (§4.7, §5).

use crate::error::{Error, Result};
use bollard::container::{
    AttachContainerOptions, Config, CreateContainerOptions, ListContainersOptions,
    LogOutput, RemoveContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub const LABEL_MANAGED_BY: &str = "agent-pipeline.managed";
pub const LABEL_CWD_HASH: &str = "agent-pipeline.cwd_hash";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerMode {
    None,
    Dind,
    Dood,
}

impl std::str::FromStr for DockerMode {
    type Err = String;
    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s {
            "none" => Ok(DockerMode::None),
            "dind" => Ok(DockerMode::Dind),
            "dood" => Ok(DockerMode::Dood),
            other => Err(format!("unknown docker mode `{other}`")),
        }
    }
}

pub struct RunConfig {
    pub image: String,
    pub cwd: std::path::PathBuf,
    pub docker_mode: DockerMode,
    pub whole_run_idle_timeout_sec: u64,
    /// Environment variables passed through to the container so the container-side
    /// executor honors host-configured idle timeouts (§4.7).
    pub env: Vec<(String, String)>,
}

pub fn cwd_hash(cwd: &std::path::Path) -> String {
    let mut hasher = Sha256::new();
    hasher.update(cwd.to_string_lossy().as_bytes());
    hex::encode(hasher.finalize())
}

/// The cause the watchdog/cancellation path observed, mapped to an `error_type` and
/// exit code by the caller via [`Error`].
pub enum StopCause {
    Completed,
    Interrupted,
    IdleTimeout(u64),
}

pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub docker_exit_code: i64,
    pub cause: StopCause,
}

pub struct DockerRunner {
    docker: Docker,
}

impl DockerRunner {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Enumerate containers labeled with this tool's `cwd_hash`, and force-remove any
    /// that are not currently `running` (§4.7, S6). Running containers with the same
    /// hash are left alone — a concurrent run for the same workspace is not this
    /// runner's business to kill.
    pub async fn cleanup_stale(&self, cwd: &std::path::Path) -> Result<()> {
        let hash = cwd_hash(cwd);
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{LABEL_CWD_HASH}={hash}")],
        );
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;

        for container in containers {
            let state = container.state.as_deref().unwrap_or("");
            if state == "running" {
                continue;
            }
            if let Some(id) = container.id {
                let _ = self
                    .docker
                    .remove_container(
                        &id,
                        Some(RemoveContainerOptions {
                            force: true,
                            v: true,
                            ..Default::default()
                        }),
                    )
                    .await;
            }
        }
        Ok(())
    }

    /// Run a single container end to end: pull (best-effort) → create → start → follow
    /// and demultiplex logs → wait → cleanup (§4.7). Each demultiplexed line is handed
    /// to `on_line(line, is_stderr)` as it's observed, in stdout-write order.
    pub async fn run(
        &self,
        cfg: &RunConfig,
        cmd: Vec<String>,
        cancel: &CancellationToken,
        mut on_line: impl FnMut(&str, bool) + Send,
    ) -> Result<RunOutput> {
        let hash = cwd_hash(&cfg.cwd);
        self.cleanup_stale(&cfg.cwd).await?;

        // Best-effort pull: a failure here is not fatal if a local image already
        // exists (§4.7). We don't distinguish the two cases further than "try, then
        // let create_container surface a real error if the image is truly missing".
        let mut pull = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: cfg.image.as_str(),
                ..Default::default()
            }),
            None,
            None,
        );
        while let Some(progress) = pull.next().await {
            if let Err(e) = progress {
                tracing::debug!(error = %e, "image pull progress error (best-effort, ignored)");
            }
        }

        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), "true".to_string());
        labels.insert(LABEL_CWD_HASH.to_string(), hash.clone());

        let (network_mode, privileged, binds_extra) = match cfg.docker_mode {
            DockerMode::None => ("host".to_string(), false, vec![]),
            DockerMode::Dind => ("bridge".to_string(), true, vec![]),
            DockerMode::Dood => (
                "bridge".to_string(),
                false,
                vec!["/var/run/docker.sock:/var/run/docker.sock".to_string()],
            ),
        };

        let mut binds = vec![format!(
            "{}:/workspace-source:ro",
            cfg.cwd.display()
        )];
        binds.extend(binds_extra);

        let env: Vec<String> = cfg
            .env
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();

        let container_name = format!("agent-pipeline-{hash}-{}", short_rand());
        let container = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: container_name.as_str(),
                    platform: None,
                }),
                Config {
                    image: Some(cfg.image.clone()),
                    cmd: Some(cmd),
                    env: Some(env),
                    labels: Some(labels),
                    host_config: Some(HostConfig {
                        network_mode: Some(network_mode),
                        privileged: Some(privileged),
                        binds: Some(binds),
                        auto_remove: Some(false),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
            )
            .await?;
        let container_id = container.id;

        let cleanup_once = Arc::new(AtomicBool::new(false));
        let result = self
            .run_started(cfg, &container_id, cancel, &mut on_line)
            .await;

        self.cleanup(&container_id, &cleanup_once).await;
        result
    }

    async fn run_started(
        &self,
        cfg: &RunConfig,
        container_id: &str,
        cancel: &CancellationToken,
        on_line: &mut (impl FnMut(&str, bool) + Send),
    ) -> Result<RunOutput> {
        self.docker.start_container::<String>(container_id, None).await?;

        let last_activity = Arc::new(AtomicI64::new(now_millis()));
        let idle_timed_out = Arc::new(AtomicBool::new(false));
        let stdout = Arc::new(Mutex::new(String::new()));
        let stderr = Arc::new(Mutex::new(String::new()));

        let watchdog_cancel = CancellationToken::new();
        let watchdog = {
            let last_activity = last_activity.clone();
            let idle_timed_out = idle_timed_out.clone();
            let whole_run_timeout = cfg.whole_run_idle_timeout_sec;
            let cancel = cancel.clone();
            let watchdog_cancel = watchdog_cancel.clone();
            tokio::spawn(async move {
                let tick = Duration::from_millis(250);
                loop {
                    tokio::select! {
                        _ = watchdog_cancel.cancelled() => return,
                        _ = tokio::time::sleep(tick) => {}
                    }
                    let age_ms = now_millis() - last_activity.load(Ordering::SeqCst);
                    if age_ms >= (whole_run_timeout as i64) * 1000 {
                        idle_timed_out.store(true, Ordering::SeqCst);
                        cancel.cancel();
                        return;
                    }
                }
            })
        };

        let mut attach = self
            .docker
            .attach_container(
                container_id,
                Some(AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    ..Default::default()
                }),
            )
            .await?;

        let demux_cancel = cancel.clone();
        let demux_stdout = stdout.clone();
        let demux_stderr = stderr.clone();
        let demux_last_activity = last_activity.clone();
        let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<(String, bool)>();
        let demux = tokio::spawn(async move {
            let mut out_buf = Vec::new();
            let mut err_buf = Vec::new();
            loop {
                tokio::select! {
                    _ = demux_cancel.cancelled() => break,
                    chunk = attach.output.next() => {
                        let Some(Ok(chunk)) = chunk else { break };
                        demux_last_activity.store(now_millis(), Ordering::SeqCst);
                        let (buf, is_stderr, bytes) = match chunk {
                            LogOutput::StdOut { message } => (&mut out_buf, false, message),
                            LogOutput::StdErr { message } => (&mut err_buf, true, message),
                            LogOutput::Console { message } => (&mut out_buf, false, message),
                            LogOutput::StdIn { .. } => continue,
                        };
                        buf.extend_from_slice(&bytes);
                        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                            let line_bytes: Vec<u8> = buf.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&line_bytes).trim_end_matches('\n').to_string();
                            if is_stderr {
                                demux_stderr.lock().await.push_str(&line);
                                demux_stderr.lock().await.push('\n');
                            } else {
                                demux_stdout.lock().await.push_str(&line);
                                demux_stdout.lock().await.push('\n');
                            }
                            let _ = line_tx.send((line, is_stderr));
                        }
                    }
                }
            }
        });

        let wait_result = {
            let mut wait_stream = self.docker.wait_container::<String>(container_id, None);
            tokio::select! {
                _ = cancel.cancelled() => None,
                res = wait_stream.next() => res,
            }
        };

        while let Ok((line, is_stderr)) = line_rx.try_recv() {
            on_line(&line, is_stderr);
        }
        // Drain any remaining lines the demux task queued before it observed cancellation.
        let drain_timeout = if cancel.is_cancelled() {
            Duration::from_secs(5)
        } else {
            Duration::from_secs(15)
        };
        let drained = tokio::time::timeout(drain_timeout, async {
            while let Some((line, is_stderr)) = line_rx.recv().await {
                on_line(&line, is_stderr);
            }
        })
        .await;

        watchdog_cancel.cancel();
        let _ = watchdog.await;
        demux.abort();

        if drained.is_err() {
            return Err(Error::LogDrainTimeout);
        }

        let cause = if idle_timed_out.load(Ordering::SeqCst) {
            StopCause::IdleTimeout(cfg.whole_run_idle_timeout_sec)
        } else if cancel.is_cancelled() {
            StopCause::Interrupted
        } else {
            StopCause::Completed
        };

        let docker_exit_code = match &wait_result {
            Some(Ok(r)) => r.status_code,
            Some(Err(_)) => -1,
            None => -1,
        };

        Ok(RunOutput {
            stdout: stdout.lock().await.clone(),
            stderr: stderr.lock().await.clone(),
            docker_exit_code,
            cause,
        })
    }

    /// Stop (10s grace) then force-remove. Not-found/conflict errors on stop are
    /// benign — the container may already be gone. A single guard prevents double
    /// work across the caller's error paths.
    async fn cleanup(&self, container_id: &str, guard: &Arc<AtomicBool>) {
        if guard.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: 10 }))
            .await;
        let _ = self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await;
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn short_rand() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 4];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cwd_hash_is_deterministic() {
        let a = cwd_hash(std::path::Path::new("/workspace"));
        let b = cwd_hash(std::path::Path::new("/workspace"));
        assert_eq!(a, b);
        let c = cwd_hash(std::path::Path::new("/other"));
        assert_ne!(a, c);
    }

    #[test]
    fn docker_mode_parses_known_values() {
        assert!(matches!("none".parse::<DockerMode>(), Ok(DockerMode::None)));
        assert!(matches!("dind".parse::<DockerMode>(), Ok(DockerMode::Dind)));
        assert!(matches!("dood".parse::<DockerMode>(), Ok(DockerMode::Dood)));
        assert!("other".parse::<DockerMode>().is_err());
    }
}
