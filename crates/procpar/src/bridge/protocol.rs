//! Wire types for orchestrator-worker communication.
//!
//! Two directions, one message each:
//! - **argv** (parent → worker): `InvocationPayload`, which operation to run and with what
//! - **stdout** (worker → parent): a success value or an `ExceptionMessage`

use std::fmt;

use serde::{Deserialize, Serialize};

/// Type identifier given to every `source()` link below the top of a failure chain.
///
/// Rust erases the concrete type behind `dyn Error`, so only the outermost
/// failure can name its type.
pub const SOURCE_TYPE: &str = "source";

/// Type identifier for a panic caught inside a worker.
pub const PANIC_TYPE: &str = "panic";

/// Which operation a worker should run, and the argument to run it with.
///
/// Built once per work item by the orchestrator and consumed exactly once by
/// the worker it was launched for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvocationPayload {
    pub operation_type: String,
    pub member: String,
    /// JSON text of the argument (ignored by zero-argument operations).
    pub argument: String,
}

impl InvocationPayload {
    pub fn new(
        operation_type: impl Into<String>,
        member: impl Into<String>,
        argument: impl Into<String>,
    ) -> Self {
        Self {
            operation_type: operation_type.into(),
            member: member.into(),
            argument: argument.into(),
        }
    }

    /// Build a payload whose argument is the JSON encoding of `argument`.
    pub fn with_argument<T: Serialize + ?Sized>(
        operation_type: impl Into<String>,
        member: impl Into<String>,
        argument: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(
            operation_type,
            member,
            serde_json::to_string(argument)?,
        ))
    }
}

/// A failure marshalled across the process boundary.
///
/// Plain data: the worker fills it in from a live error (or panic), the
/// orchestrator reads it back. `inner_exception` links form the cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionMessage {
    pub message: String,
    pub stack_trace: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inner_exception: Option<Box<ExceptionMessage>>,
    pub exception_type: String,
}

impl ExceptionMessage {
    pub fn new(exception_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack_trace: String::new(),
            inner_exception: None,
            exception_type: exception_type.into(),
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = stack_trace.into();
        self
    }

    pub fn with_inner(mut self, inner: ExceptionMessage) -> Self {
        self.inner_exception = Some(Box::new(inner));
        self
    }

    /// Capture an error and its `source()` chain.
    ///
    /// The top record gets `exception_type`; deeper records get [`SOURCE_TYPE`].
    /// Stack traces are left empty, callers attach one with [`with_stack_trace`].
    ///
    /// [`with_stack_trace`]: Self::with_stack_trace
    pub fn from_error(
        exception_type: impl Into<String>,
        error: &(dyn std::error::Error + 'static),
    ) -> Self {
        let mut links = Vec::new();
        let mut cursor = error.source();
        while let Some(cause) = cursor {
            links.push(cause.to_string());
            cursor = cause.source();
        }

        let inner = links.into_iter().rev().fold(None, |inner, message| {
            let mut link = ExceptionMessage::new(SOURCE_TYPE, message);
            link.inner_exception = inner.map(Box::new);
            Some(link)
        });

        let mut top = ExceptionMessage::new(exception_type, error.to_string());
        top.inner_exception = inner.map(Box::new);
        top
    }

    /// Iterate this record followed by every nested cause.
    pub fn chain(&self) -> impl Iterator<Item = &ExceptionMessage> {
        std::iter::successors(Some(self), |e| e.inner_exception.as_deref())
    }
}

impl fmt::Display for ExceptionMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

impl std::error::Error for ExceptionMessage {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner_exception
            .as_deref()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

/// What a worker reports: its operation's return value, or the failure envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerOutcome {
    Success(serde_json::Value),
    Failure(ExceptionMessage),
}

impl WorkerOutcome {
    /// Field whose presence marks a decoded object as a failure envelope.
    pub const FAILURE_MARKER: &'static str = "stack_trace";

    /// Classify a decoded stdout value.
    ///
    /// Objects carrying [`FAILURE_MARKER`](Self::FAILURE_MARKER) are read as
    /// `ExceptionMessage`; anything else is a success value.
    pub fn classify(value: serde_json::Value) -> Result<Self, serde_json::Error> {
        let is_failure = value
            .as_object()
            .is_some_and(|obj| obj.contains_key(Self::FAILURE_MARKER));

        if is_failure {
            Ok(Self::Failure(serde_json::from_value(value)?))
        } else {
            Ok(Self::Success(value))
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::Success(value) => Ok(value.clone()),
            Self::Failure(error) => serde_json::to_value(error),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }
}
