//! Shared types and pure logic for the agent pipeline: the condition language (C1), the
//! decision validator (C2), the plan model & loader (C3), and the stream-JSON protocol
//! (C6) that both address spaces speak.

pub mod condlang;
pub mod error;
pub mod plan;
pub mod protocol;
pub mod schema;
pub mod template;
pub mod types;

pub use error::{Error, Result};
