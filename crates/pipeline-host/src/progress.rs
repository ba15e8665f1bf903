//! Progress view (C10) — interface only (§4.10). The renderer (tree view, TUI layout)
//! is an external collaborator; this module defines the contract the host driver holds
//! it to, plus a minimal line-buffered implementation used when `--tui` is not passed
//! (§6, host CLI surface).

use pipeline_core::protocol::StreamEvent;
use pipeline_core::types::RunRecord;
use tokio_util::sync::CancellationToken;

/// Consumes typed events (from C6) and raw non-JSON lines; finishes with the composed
/// `RunRecord`. Implementations may buffer, render a tree, or simply print — the host
/// driver only depends on this contract.
pub trait ProgressView: Send {
    fn send_event(&mut self, event: &StreamEvent);
    fn send_raw_line(&mut self, line: &str, is_stderr: bool);
    fn finish(&mut self, record: &RunRecord);
    /// Blocks (if the implementation runs its own render loop) until the view
    /// considers itself done. The default line-buffered view returns immediately.
    fn wait(&mut self) {}
}

/// The line-buffered default: prints a concise status line per pipeline event plus a
/// closing summary, and forwards raw (non-JSON) lines verbatim. No tree layout — that
/// cosmetic rendering is out of scope (§1) and left to the `--tui` collaborator.
pub struct LineProgressView {
    cancel: CancellationToken,
}

impl LineProgressView {
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Signals that the user asked to cancel (e.g. Ctrl-C); cancels the runner's
    /// context so the run stops cooperatively.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

impl ProgressView for LineProgressView {
    fn send_event(&mut self, event: &StreamEvent) {
        use pipeline_core::protocol::PipelineEvent;
        match event {
            StreamEvent::PipelineEvent(PipelineEvent::NodeStart {
                node_id,
                node_run_id,
                kind,
                ..
            }) => {
                println!("[{node_run_id}] {node_id} ({kind:?}) started");
            }
            StreamEvent::PipelineEvent(PipelineEvent::NodeFinish { record }) => {
                println!(
                    "[{}] {} finished: {:?}",
                    record.node_run_id, record.node_id, record.status
                );
            }
            StreamEvent::PipelineEvent(PipelineEvent::TransitionTaken {
                from_node, to_node, ..
            }) => {
                println!("{from_node} -> {to_node}");
            }
            StreamEvent::PipelineEvent(PipelineEvent::PlanFinish {
                status, exit_code, ..
            }) => {
                println!("plan finished: {status:?} (exit {exit_code})");
            }
            _ => {}
        }
    }

    fn send_raw_line(&mut self, line: &str, is_stderr: bool) {
        if is_stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
    }

    fn finish(&mut self, record: &RunRecord) {
        println!(
            "run {} finished: {:?} (docker exit {})",
            record.run_id, record.status, record.docker_exit_code
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_signals_the_shared_token() {
        let token = CancellationToken::new();
        let view = LineProgressView::new(token.clone());
        assert!(!token.is_cancelled());
        view.cancel();
        assert!(token.is_cancelled());
    }
}
