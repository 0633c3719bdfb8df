//! Worker re-entry - runs inside the re-invoked executable.
//!
//! The parent side (batching, spawning, decoding) is in orchestrator.rs.
//!
//! Flow:
//! 1. Decode the `--args` token into an `InvocationPayload`
//! 2. Resolve the operation in the registry
//! 3. Invoke it once, on this thread, with panics caught
//! 4. Write one framed line to stdout and exit 0
//!
//! Every failure along the way is reported through that line, never through
//! the exit status.

use std::any::{Any, type_name};
use std::backtrace::Backtrace;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;

use crate::bridge::channel;
use crate::bridge::cmdline::{ARGS_KEY, ArgMap};
use crate::bridge::payload;
use crate::bridge::protocol::{ExceptionMessage, InvocationPayload, PANIC_TYPE, WorkerOutcome};
use crate::registry::{Registry, ResolveError};

/// Backtrace of the most recent panic, recorded by the worker panic hook.
static PANIC_TRACE: Mutex<Option<String>> = Mutex::new(None);

/// Failures raised by the worker itself, before or around the operation.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("worker started without an 'args' value")]
    ArgsKeyMissing,

    #[error("malformed invocation payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("operation resolution failed: {0}")]
    OperationResolutionFailed(#[from] ResolveError),
}

/// Run the worker if this process was launched as one; otherwise return.
pub fn handle_if_worker(registry: &Registry) {
    let args = ArgMap::from_env();
    if args.is_worker_mode() {
        run_worker(registry, &args);
    }
}

/// Handle this process's single invocation, write the result line, exit.
pub fn run_worker(registry: &Registry, args: &ArgMap) -> ! {
    install_panic_hook();

    let line = respond_line(registry, args);
    let mut stdout = std::io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{line}").and_then(|()| stdout.flush()) {
        tracing::error!(error = %e, "Failed to write result line");
    }

    std::process::exit(0)
}

/// The framed stdout line for this invocation.
pub fn respond_line(registry: &Registry, args: &ArgMap) -> String {
    let outcome = respond(registry, args);
    channel::encode_line(&outcome).unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to encode outcome");
        let failure = ExceptionMessage::from_error(type_name::<serde_json::Error>(), &e)
            .with_stack_trace(Backtrace::force_capture().to_string());
        channel::encode_line(&WorkerOutcome::Failure(failure)).unwrap_or_default()
    })
}

/// Decode, resolve and invoke. Never fails: failures become `WorkerOutcome::Failure`.
pub fn respond(registry: &Registry, args: &ArgMap) -> WorkerOutcome {
    match invoke(registry, args) {
        Ok(value) => WorkerOutcome::Success(value),
        Err(error) => {
            tracing::debug!(exception_type = %error.exception_type, message = %error.message, "Operation failed");
            WorkerOutcome::Failure(error)
        }
    }
}

fn invoke(registry: &Registry, args: &ArgMap) -> Result<serde_json::Value, ExceptionMessage> {
    let payload = decode_payload(args).map_err(capture_worker_error)?;
    let operation = registry
        .resolve(&payload.operation_type, &payload.member)
        .map_err(|e| capture_worker_error(e.into()))?;

    tracing::debug!(operation = %operation.key(), arity = ?operation.arity(), "Invoking operation");

    match panic::catch_unwind(AssertUnwindSafe(|| operation.invoke(&payload.argument))) {
        Ok(result) => result,
        Err(panic) => Err(capture_panic(panic)),
    }
}

fn decode_payload(args: &ArgMap) -> Result<InvocationPayload, WorkerError> {
    let token = args
        .get(ARGS_KEY)
        .filter(|token| !token.is_empty())
        .ok_or(WorkerError::ArgsKeyMissing)?;
    payload::decode_token(token).map_err(WorkerError::MalformedPayload)
}

fn capture_worker_error(error: WorkerError) -> ExceptionMessage {
    ExceptionMessage::from_error(type_name::<WorkerError>(), &error)
        .with_stack_trace(Backtrace::force_capture().to_string())
}

fn capture_panic(panic: Box<dyn Any + Send>) -> ExceptionMessage {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "operation panicked".to_string());

    let stack_trace = PANIC_TRACE
        .lock()
        .ok()
        .and_then(|mut trace| trace.take())
        .unwrap_or_default();

    ExceptionMessage::new(PANIC_TYPE, message).with_stack_trace(stack_trace)
}

fn install_panic_hook() {
    panic::set_hook(Box::new(|info| {
        let trace = format!("{info}\n{}", Backtrace::force_capture());
        if let Ok(mut slot) = PANIC_TRACE.lock() {
            *slot = Some(trace);
        }
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::{Captured, decode_output};
    use serde_json::json;

    #[derive(Debug, thiserror::Error)]
    #[error("lookup failed for {key}")]
    struct LookupError {
        key: String,
        #[source]
        source: std::io::Error,
    }

    fn uppercase(s: String) -> Result<String, std::convert::Infallible> {
        Ok(s.to_uppercase())
    }

    fn lookup(key: String) -> Result<u32, LookupError> {
        Err(LookupError {
            key,
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such entry"),
        })
    }

    fn explode(_: u32) -> Result<u32, std::io::Error> {
        panic!("kaboom")
    }

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry.register("text", "uppercase", uppercase).unwrap();
        registry.register("store", "lookup", lookup).unwrap();
        registry.register("chaos", "explode", explode).unwrap();
        registry
    }

    fn worker_args(operation_type: &str, member: &str, argument: serde_json::Value) -> ArgMap {
        let payload =
            InvocationPayload::new(operation_type, member, serde_json::to_string(&argument).unwrap());
        let token = payload::encode_token(&payload).unwrap();
        ArgMap::decode(["--args", token.as_str(), "--forwarded", "flag"])
    }

    fn failure(outcome: WorkerOutcome) -> ExceptionMessage {
        match outcome {
            WorkerOutcome::Failure(e) => e,
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn success_is_returned_as_value() {
        let outcome = respond(&registry(), &worker_args("text", "uppercase", json!("abc")));
        assert_eq!(outcome, WorkerOutcome::Success(json!("ABC")));
    }

    #[test]
    fn response_line_decodes_on_the_parent_side() {
        let line = respond_line(&registry(), &worker_args("text", "uppercase", json!("b")));
        assert_eq!(
            decode_output(&format!("{line}\n")).unwrap(),
            Captured::Outcome(WorkerOutcome::Success(json!("B")))
        );
    }

    #[test]
    fn operation_error_keeps_message_and_cause_chain() {
        let error = failure(respond(&registry(), &worker_args("store", "lookup", json!("k1"))));
        assert_eq!(error.message, "lookup failed for k1");
        assert!(error.exception_type.ends_with("LookupError"));
        assert_eq!(
            error.inner_exception.as_deref().map(|e| e.message.as_str()),
            Some("no such entry")
        );
    }

    #[test]
    fn missing_args_value_is_reported() {
        let error = failure(respond(&registry(), &ArgMap::decode(["--args", "--x"])));
        assert_eq!(error.message, "worker started without an 'args' value");
        assert!(error.exception_type.ends_with("WorkerError"));
    }

    #[test]
    fn unknown_type_and_member_are_distinguished() {
        let error = failure(respond(&registry(), &worker_args("nope", "uppercase", json!("a"))));
        assert!(error.message.contains("operation type 'nope' is not registered"));

        let error = failure(respond(&registry(), &worker_args("text", "nope", json!("a"))));
        assert!(error.message.contains("has no member 'nope'"));
    }

    #[test]
    fn malformed_payload_is_reported() {
        let error = failure(respond(&registry(), &ArgMap::decode(["--args", "\"{broken"])));
        assert!(error.message.starts_with("malformed invocation payload"));
    }

    #[test]
    fn argument_shape_mismatch_is_reported() {
        let error = failure(respond(&registry(), &worker_args("text", "uppercase", json!(5))));
        assert!(error.exception_type.contains("serde_json"));
    }

    #[test]
    fn panic_is_caught_and_marshalled() {
        let error = failure(respond(&registry(), &worker_args("chaos", "explode", json!(1))));
        assert_eq!(error.exception_type, PANIC_TYPE);
        assert_eq!(error.message, "kaboom");
    }
}
