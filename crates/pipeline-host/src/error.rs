//! Error taxonomy for the host-side driver: Docker API failures, log-drain timeouts,
//! watchdog expiry, and run-persistence I/O. Each variant maps to one `error_type`
//! string from spec §7 via [`Error::error_type`], so the mapping lives in one place.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("docker api error: {0}")]
    DockerApi(#[from] bollard::errors::Error),

    #[error("timed out waiting for the log stream to drain")]
    LogDrainTimeout,

    #[error("whole-run idle watchdog expired after {0}s of inactivity")]
    IdleWatchdog(u64),

    #[error("run interrupted by user")]
    Interrupted,

    #[error("container exited non-zero: {0}")]
    DockerExitError(i64),

    #[error("container produced no parseable final result")]
    ParseError,

    #[error("container produced no parseable pipeline_result")]
    PipelineParseError,

    #[error("persistence io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("persistence json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The `error_type` string this failure contributes to a persisted `RunRecord`
    /// (spec §7). Some variants (parse/parse_pipeline) are folded into the caller's
    /// own classification instead, since the right tag depends on pipeline vs
    /// single-prompt mode; those return `None` here and are classified by the caller.
    pub fn error_type(&self) -> Option<&'static str> {
        match self {
            Error::DockerApi(_) => Some("docker_exec_error"),
            Error::LogDrainTimeout => Some("docker_exec_error"),
            Error::IdleWatchdog(_) => Some("timeout"),
            Error::Interrupted => Some("interrupted"),
            Error::DockerExitError(_) => Some("docker_exit_error"),
            Error::ParseError => Some("parse_error"),
            Error::PipelineParseError => Some("pipeline_parse_error"),
            Error::Io(_) | Error::Json(_) => None,
        }
    }

    /// The exit code this failure surfaces on the host CLI (spec §6/§7).
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Interrupted => 130,
            Error::IdleWatchdog(_) => -1,
            Error::DockerExitError(code) => {
                if *code == 0 {
                    -1
                } else {
                    *code as i32
                }
            }
            Error::DockerApi(_) | Error::LogDrainTimeout => -1,
            Error::ParseError | Error::PipelineParseError => 1,
            Error::Io(_) | Error::Json(_) => 1,
        }
    }
}
