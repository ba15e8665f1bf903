//! Container-side execution: the node runner (C4) and the pipeline executor (C5).
//!
//! Unlike `pipeline_core`/`pipeline_host`, this crate has no fallible top-level entry
//! point of its own: a node that fails to spawn, times out, or produces a bad decision
//! is recorded as an error `NodeRunRecord` and fed back into the executor loop rather
//! than propagated as a typed error, since the pipeline keeps running past a single
//! failed node (§4.5). There is accordingly no per-crate `Error` enum here.

pub mod executor;
pub mod noderun;
