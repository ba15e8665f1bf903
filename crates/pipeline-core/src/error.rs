//! Error taxonomy for the plan/condition/schema layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("condition expression failed to compile: {0}")]
    ConditionCompile(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("plan error: {0}")]
    Plan(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
