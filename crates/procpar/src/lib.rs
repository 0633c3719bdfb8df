//! procpar: process-level parallelism by re-invoking the current executable.
//!
//! The same binary plays both roles. Called normally, it is the orchestrator:
//! [`Dispatcher::for_each`] launches one copy of itself per input. Called with
//! `--args <payload>`, it is a worker: [`handle_if_worker`] runs the named
//! operation, writes one framed result line to stdout, and exits.
//!
//! ```no_run
//! use std::sync::Arc;
//! use procpar::{Dispatcher, Registry, handle_if_worker};
//!
//! fn shout(s: String) -> Result<String, std::convert::Infallible> {
//!     Ok(s.to_uppercase())
//! }
//!
//! fn main() -> anyhow::Result<()> {
//!     let mut registry = Registry::new();
//!     let shout = registry.register("text", "shout", shout)?;
//!     handle_if_worker(&registry);
//!
//!     let dispatcher = Dispatcher::new(Arc::new(registry));
//!     let results = dispatcher.for_each_blocking(["a".to_string(), "b".to_string()], &shout)?;
//!     println!("{results:?}");
//!     Ok(())
//! }
//! ```

pub mod bridge;
mod logging;
pub mod orchestrator;
pub mod registry;
mod self_image;
pub mod worker;

pub use bridge::cmdline::{ArgMap, is_worker_mode};
pub use bridge::protocol::{ExceptionMessage, InvocationPayload, WorkerOutcome};
pub use logging::init_tracing;
pub use orchestrator::{
    DispatchConfig, DispatchError, Dispatcher, SelfLauncher, WorkerCommand, WorkerLauncher,
    default_concurrency, set_default_concurrency,
};
pub use registry::{Arity, Operation, OperationKey, Registry, ResolveError};
pub use self_image::SelfImage;
pub use worker::{WorkerError, handle_if_worker, run_worker};
