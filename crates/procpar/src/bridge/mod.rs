//! Wire bridge between the orchestrator (parent) and its worker subprocesses.
//!
//! # Architecture
//!
//! - **cmdline**: argv tokens to key/value map, worker-mode detection
//! - **payload**: `InvocationPayload` to a single argv token (two explicit layers)
//! - **channel**: sentinel-framed result line on the worker's stdout
//! - **protocol**: the message types themselves

pub mod channel;
pub mod cmdline;
pub mod payload;
pub mod protocol;
