//! Orchestrator - fans inputs out to worker subprocesses, in batches.
//!
//! Flow:
//! 1. Check the operation handle against the registry
//! 2. Resolve the executable to re-invoke (this process's own image)
//! 3. Encode one payload token per input
//! 4. Launch batches of at most `concurrency` workers; a batch finishes
//!    completely before the next one starts
//! 5. Decode each worker's stdout; require exactly one result per input
//!
//! Results come back in completion order, not input order. Callers that need
//! positional correspondence tag their inputs with an index and re-sort.

use std::num::NonZeroUsize;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::process::Command;
use tokio::task::JoinSet;

use crate::bridge::channel::{self, Captured, ChannelError};
use crate::bridge::cmdline::ARGS_KEY;
use crate::bridge::payload;
use crate::bridge::protocol::{ExceptionMessage, InvocationPayload, WorkerOutcome};
use crate::registry::{Operation, OperationKey, Registry, ResolveError};
use crate::self_image::SelfImage;

/// Process-wide default; 0 means "use available parallelism".
static DEFAULT_CONCURRENCY: AtomicUsize = AtomicUsize::new(0);

/// Set the concurrency used by dispatchers without an explicit limit.
///
/// Read once at the start of each `for_each` call; changing it does not
/// affect calls already in flight. Passing 0 restores the default.
pub fn set_default_concurrency(limit: usize) {
    DEFAULT_CONCURRENCY.store(limit, Ordering::Relaxed);
}

pub fn default_concurrency() -> NonZeroUsize {
    NonZeroUsize::new(DEFAULT_CONCURRENCY.load(Ordering::Relaxed)).unwrap_or_else(|| {
        std::thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
    })
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("operation resolution failed: {0}")]
    OperationResolutionFailed(ResolveError),

    #[error("operation {key} is not invocable: {reason}")]
    InvocationNotInvocable { key: OperationKey, reason: String },

    #[error("internal error: invalid worker output format [{output}]")]
    ProtocolFraming { output: String },

    /// The operation failed inside the worker. Displays the original message.
    #[error(transparent)]
    RemoteExecutionFailed(ExceptionMessage),

    #[error("result mismatched {collected}/{expected}")]
    AggregationMismatch { collected: usize, expected: usize },

    #[error("current process cannot be re-invoked as a worker: {reason}")]
    EntryPointUnresolvable { reason: String },

    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker I/O failed: {0}")]
    WorkerIo(#[source] std::io::Error),

    #[error("failed to start async runtime: {0}")]
    Runtime(#[source] std::io::Error),

    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("failed to decode worker result: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl From<ResolveError> for DispatchError {
    fn from(error: ResolveError) -> Self {
        match error {
            ResolveError::NotInvocable {
                key,
                requested,
                reason,
            } => Self::InvocationNotInvocable {
                key,
                reason: format!("addressed as {requested}, {reason}"),
            },
            other => Self::OperationResolutionFailed(other),
        }
    }
}

impl From<ChannelError> for DispatchError {
    fn from(error: ChannelError) -> Self {
        match error {
            ChannelError::MissingSentinel { output } => Self::ProtocolFraming { output },
            ChannelError::Malformed(e) => Self::Decode(e),
        }
    }
}

/// Program and argv for one worker launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl WorkerCommand {
    /// `<program> --args <token> <forwarded...>`
    pub fn new(program: &Path, token: String, forwarded: &[String]) -> Self {
        let mut args = Vec::with_capacity(forwarded.len() + 2);
        args.push(format!("--{ARGS_KEY}"));
        args.push(token);
        args.extend_from_slice(forwarded);
        Self {
            program: program.to_path_buf(),
            args,
        }
    }
}

/// Extension point for how a worker is started and its output captured.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    /// Run the worker to exit and return everything it wrote to stdout.
    async fn launch(&self, command: WorkerCommand) -> Result<String, DispatchError>;
}

/// Launches workers as real subprocesses.
///
/// stdin is closed, stderr is inherited, stdout is captured. The child is
/// killed if the launch future is dropped (e.g. a sibling in the batch failed).
pub struct SelfLauncher;

#[async_trait]
impl WorkerLauncher for SelfLauncher {
    async fn launch(&self, command: WorkerCommand) -> Result<String, DispatchError> {
        let child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(DispatchError::Spawn)?;

        let pid = child.id();
        tracing::trace!(?pid, "Worker spawned");

        let output = child
            .wait_with_output()
            .await
            .map_err(DispatchError::WorkerIo)?;
        if !output.status.success() {
            tracing::warn!(?pid, exit_status = %output.status, "Worker exited with failure status");
        }

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        tracing::trace!(?pid, output = %stdout, "Worker output");
        Ok(stdout)
    }
}

#[derive(Clone)]
pub struct DispatchConfig {
    /// `None` defers to [`default_concurrency`] at call time.
    pub concurrency: Option<NonZeroUsize>,
    pub launcher: Arc<dyn WorkerLauncher>,
    /// `None` uses [`SelfImage::current`].
    pub self_image: Option<SelfImage>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            concurrency: None,
            launcher: Arc::new(SelfLauncher),
            self_image: None,
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// 0 means "use the process-wide default".
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = NonZeroUsize::new(limit);
        self
    }

    pub fn with_launcher(mut self, launcher: Arc<dyn WorkerLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    pub fn with_self_image(mut self, image: SelfImage) -> Self {
        self.self_image = Some(image);
        self
    }
}

/// Runs registered operations across worker subprocesses.
pub struct Dispatcher {
    registry: Arc<Registry>,
    config: DispatchConfig,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self::with_config(registry, DispatchConfig::default())
    }

    pub fn with_config(registry: Arc<Registry>, config: DispatchConfig) -> Self {
        Self { registry, config }
    }

    /// Run `op` once per input, each in its own worker process.
    ///
    /// A worker that writes nothing yields `O::default()`. Any other failure
    /// aborts the whole call; workers still running in the current batch are
    /// killed and no partial results are returned.
    pub async fn for_each<I, O>(
        &self,
        inputs: impl IntoIterator<Item = I>,
        op: &Operation<I, O>,
    ) -> Result<Vec<O>, DispatchError>
    where
        I: Serialize + 'static,
        O: DeserializeOwned + Default + Send + 'static,
    {
        let limit = self.config.concurrency.unwrap_or_else(default_concurrency);
        let inputs: Vec<I> = inputs.into_iter().collect();
        if inputs.is_empty() {
            return Ok(Vec::new());
        }

        self.registry.check(op)?;

        let image = self
            .config
            .self_image
            .as_ref()
            .unwrap_or_else(|| SelfImage::current());
        let program = image.executable()?;

        let key = op.key();
        let mut commands = inputs
            .iter()
            .map(|item| {
                let payload =
                    InvocationPayload::with_argument(&key.operation_type, &key.member, item)
                        .map_err(DispatchError::Encode)?;
                let token = payload::encode_token(&payload).map_err(DispatchError::Encode)?;
                Ok(WorkerCommand::new(program, token, image.forwarded_args()))
            })
            .collect::<Result<Vec<_>, DispatchError>>()?
            .into_iter();

        let expected = inputs.len();
        let batches = plan_batches(expected, limit);
        let mut results = Vec::with_capacity(expected);

        for (index, batch) in batches.iter().enumerate() {
            tracing::debug!(
                operation = %key,
                batch = index + 1,
                batches = batches.len(),
                batch_size = batch.len(),
                "Dispatching batch"
            );

            let mut workers = JoinSet::new();
            for command in commands.by_ref().take(batch.len()) {
                let launcher = Arc::clone(&self.config.launcher);
                workers.spawn(async move {
                    let output = launcher.launch(command).await?;
                    decode_result::<O>(&output)
                });
            }

            while let Some(joined) = workers.join_next().await {
                results.push(joined??);
            }
        }

        verify_count(results.len(), expected)?;
        Ok(results)
    }

    /// Blocking wrapper around [`for_each`](Self::for_each).
    ///
    /// Builds its own tokio runtime, so it must not be called from inside one.
    pub fn for_each_blocking<I, O>(
        &self,
        inputs: impl IntoIterator<Item = I>,
        op: &Operation<I, O>,
    ) -> Result<Vec<O>, DispatchError>
    where
        I: Serialize + 'static,
        O: DeserializeOwned + Default + Send + 'static,
    {
        let runtime = tokio::runtime::Runtime::new().map_err(DispatchError::Runtime)?;
        runtime.block_on(self.for_each(inputs, op))
    }
}

/// Split `total` items into consecutive batches of at most `limit`.
pub fn plan_batches(total: usize, limit: NonZeroUsize) -> Vec<Range<usize>> {
    (0..total)
        .step_by(limit.get())
        .map(|start| start..(start + limit.get()).min(total))
        .collect()
}

fn verify_count(collected: usize, expected: usize) -> Result<(), DispatchError> {
    if collected != expected {
        tracing::error!(collected, expected, "Worker result count mismatch");
        return Err(DispatchError::AggregationMismatch {
            collected,
            expected,
        });
    }
    Ok(())
}

fn decode_result<O: DeserializeOwned + Default>(output: &str) -> Result<O, DispatchError> {
    let captured = channel::decode_output(output).inspect_err(|e| {
        tracing::error!(error = %e, "Worker output could not be decoded");
    })?;

    match captured {
        Captured::Empty => Ok(O::default()),
        Captured::Outcome(WorkerOutcome::Success(value)) => {
            serde_json::from_value(value).map_err(DispatchError::Decode)
        }
        Captured::Outcome(WorkerOutcome::Failure(error)) => {
            tracing::error!(
                exception_type = %error.exception_type,
                stack_trace = %error.stack_trace,
                "Error: {}",
                error.message
            );
            Err(DispatchError::RemoteExecutionFailed(error))
        }
    }
}
