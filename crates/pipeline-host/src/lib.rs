//! Host-side run orchestrator: the Docker Engine driver (C7), usage attribution (C8),
//! run persistence (C9), and the progress-view contract (C10).

pub mod attributor;
pub mod docker;
pub mod error;
pub mod host;
pub mod persistence;
pub mod progress;

pub use error::{Error, Result};
