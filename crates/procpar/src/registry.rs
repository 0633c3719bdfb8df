//! Operation registry - addresses remotely invocable operations by name.
//!
//! Both sides of the protocol hold the same registry (it is built by the
//! same executable at startup). The orchestrator turns an [`Operation`]
//! handle into an `(operation_type, member)` pair; the worker resolves that
//! pair back to a callable.
//!
//! Only plain `fn` items (or non-capturing closures) can be registered, so
//! every registered operation is state-independent by construction.

use std::any::{TypeId, type_name};
use std::backtrace::{Backtrace, BacktraceStatus};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::bridge::protocol::ExceptionMessage;

/// Stable address of an operation within the executable.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OperationKey {
    pub operation_type: String,
    pub member: String,
}

impl OperationKey {
    pub fn new(operation_type: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            operation_type: operation_type.into(),
            member: member.into(),
        }
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.operation_type, self.member)
    }
}

/// Number of parameters an operation declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arity {
    Nullary,
    Unary,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error("operation type '{operation_type}' is not registered")]
    TypeNotFound { operation_type: String },

    #[error("operation type '{operation_type}' has no member '{member}'")]
    MemberNotFound {
        operation_type: String,
        member: String,
    },

    #[error("operation {key} is already registered")]
    Duplicate { key: OperationKey },

    #[error("operation {key} cannot be invoked as {requested}: {reason}")]
    NotInvocable {
        key: OperationKey,
        requested: String,
        reason: String,
    },
}

/// Typed handle to a registered operation.
///
/// Returned by [`Registry::register`]; can also be built from a bare name
/// with [`Operation::named`], in which case the dispatcher verifies it
/// against the registry before launching anything.
pub struct Operation<I, O> {
    key: OperationKey,
    _signature: PhantomData<fn(I) -> O>,
}

impl<I, O> Operation<I, O> {
    pub fn named(operation_type: impl Into<String>, member: impl Into<String>) -> Self {
        Self {
            key: OperationKey::new(operation_type, member),
            _signature: PhantomData,
        }
    }

    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    pub(crate) fn signature() -> String {
        format!("fn({}) -> {}", type_name::<I>(), type_name::<O>())
    }
}

impl<I, O> Clone for Operation<I, O> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            _signature: PhantomData,
        }
    }
}

impl<I, O> fmt::Debug for Operation<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("key", &self.key)
            .field("signature", &Self::signature())
            .finish()
    }
}

/// Type-erased invoker: argument JSON text in, result JSON value out.
type Invoker = Arc<dyn Fn(&str) -> Result<serde_json::Value, ExceptionMessage> + Send + Sync>;

struct Entry {
    arity: Arity,
    input: TypeId,
    output: TypeId,
    signature: String,
    invoke: Invoker,
}

/// An operation resolved by the worker, ready to call.
pub struct ResolvedOperation<'a> {
    key: OperationKey,
    entry: &'a Entry,
}

impl ResolvedOperation<'_> {
    pub fn key(&self) -> &OperationKey {
        &self.key
    }

    pub fn arity(&self) -> Arity {
        self.entry.arity
    }

    /// Run the operation synchronously on the current thread.
    ///
    /// Unary operations decode `argument` into their parameter type first;
    /// nullary operations ignore it.
    pub fn invoke(&self, argument: &str) -> Result<serde_json::Value, ExceptionMessage> {
        (self.entry.invoke)(argument)
    }
}

/// Registry of invocable operations, keyed by type then member.
#[derive(Default)]
pub struct Registry {
    types: HashMap<String, HashMap<String, Entry>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a one-argument operation.
    pub fn register<I, O, E>(
        &mut self,
        operation_type: &str,
        member: &str,
        op: fn(I) -> Result<O, E>,
    ) -> Result<Operation<I, O>, ResolveError>
    where
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let invoke: Invoker = Arc::new(move |argument: &str| {
            let input: I = serde_json::from_str(argument).map_err(|e| {
                ExceptionMessage::from_error(type_name::<serde_json::Error>(), &e)
                    .with_stack_trace(Backtrace::force_capture().to_string())
            })?;
            let output = op(input).map_err(capture_failure::<E>)?;
            encode_output(output)
        });

        self.insert::<I, O>(operation_type, member, Arity::Unary, invoke)
    }

    /// Register a zero-argument operation. Its items are ignored by workers.
    pub fn register0<O, E>(
        &mut self,
        operation_type: &str,
        member: &str,
        op: fn() -> Result<O, E>,
    ) -> Result<Operation<(), O>, ResolveError>
    where
        O: Serialize + 'static,
        E: Into<anyhow::Error> + 'static,
    {
        let invoke: Invoker = Arc::new(move |_argument: &str| {
            let output = op().map_err(capture_failure::<E>)?;
            encode_output(output)
        });

        self.insert::<(), O>(operation_type, member, Arity::Nullary, invoke)
    }

    fn insert<I: 'static, O: 'static>(
        &mut self,
        operation_type: &str,
        member: &str,
        arity: Arity,
        invoke: Invoker,
    ) -> Result<Operation<I, O>, ResolveError> {
        let members = self.types.entry(operation_type.to_string()).or_default();
        if members.contains_key(member) {
            return Err(ResolveError::Duplicate {
                key: OperationKey::new(operation_type, member),
            });
        }

        let entry = Entry {
            arity,
            input: TypeId::of::<I>(),
            output: TypeId::of::<O>(),
            signature: Operation::<I, O>::signature(),
            invoke,
        };
        members.insert(member.to_string(), entry);
        tracing::trace!(operation_type, member, ?arity, "Registered operation");

        Ok(Operation::named(operation_type, member))
    }

    /// Resolve a name pair to a callable (worker side).
    pub fn resolve(
        &self,
        operation_type: &str,
        member: &str,
    ) -> Result<ResolvedOperation<'_>, ResolveError> {
        let members = self
            .types
            .get(operation_type)
            .ok_or_else(|| ResolveError::TypeNotFound {
                operation_type: operation_type.to_string(),
            })?;
        let entry = members
            .get(member)
            .ok_or_else(|| ResolveError::MemberNotFound {
                operation_type: operation_type.to_string(),
                member: member.to_string(),
            })?;

        Ok(ResolvedOperation {
            key: OperationKey::new(operation_type, member),
            entry,
        })
    }

    /// Check that a typed handle addresses a registered operation with the
    /// same signature (orchestrator side).
    pub fn check<I: 'static, O: 'static>(&self, op: &Operation<I, O>) -> Result<Arity, ResolveError> {
        let key = op.key();
        let resolved = self.resolve(&key.operation_type, &key.member)?;
        let entry = resolved.entry;

        if entry.input != TypeId::of::<I>() || entry.output != TypeId::of::<O>() {
            return Err(ResolveError::NotInvocable {
                key: key.clone(),
                requested: Operation::<I, O>::signature(),
                reason: format!("registered as {}", entry.signature),
            });
        }

        Ok(entry.arity)
    }

    pub fn len(&self) -> usize {
        self.types.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> impl Iterator<Item = OperationKey> + '_ {
        self.types.iter().flat_map(|(operation_type, members)| {
            members
                .keys()
                .map(move |member| OperationKey::new(operation_type.clone(), member.clone()))
        })
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut keys: Vec<String> = self.keys().map(|k| k.to_string()).collect();
        keys.sort();
        f.debug_struct("Registry").field("operations", &keys).finish()
    }
}

fn encode_output<O: Serialize>(output: O) -> Result<serde_json::Value, ExceptionMessage> {
    serde_json::to_value(output).map_err(|e| {
        ExceptionMessage::from_error(type_name::<serde_json::Error>(), &e)
            .with_stack_trace(Backtrace::force_capture().to_string())
    })
}

fn capture_failure<E: Into<anyhow::Error>>(error: E) -> ExceptionMessage {
    let error: anyhow::Error = error.into();
    let stack_trace = match error.backtrace().status() {
        BacktraceStatus::Captured => error.backtrace().to_string(),
        _ => Backtrace::force_capture().to_string(),
    };
    ExceptionMessage::from_error(type_name::<E>(), &*error).with_stack_trace(stack_trace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, thiserror::Error)]
    #[error("cannot shout '{0}'")]
    struct ShoutError(String);

    fn uppercase(s: String) -> Result<String, ShoutError> {
        if s.is_empty() {
            return Err(ShoutError(s));
        }
        Ok(s.to_uppercase())
    }

    fn answer() -> anyhow::Result<u32> {
        Ok(42)
    }

    fn registry() -> (Registry, Operation<String, String>) {
        let mut registry = Registry::new();
        let op = registry.register("text", "uppercase", uppercase).unwrap();
        registry.register0("math", "answer", answer).unwrap();
        (registry, op)
    }

    #[test]
    fn register_returns_addressable_handle() {
        let (registry, op) = registry();
        assert_eq!(op.key(), &OperationKey::new("text", "uppercase"));
        assert_eq!(op.key().to_string(), "text::uppercase");
        assert_eq!(registry.check(&op).unwrap(), Arity::Unary);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let (mut registry, _) = registry();
        let err = registry.register("text", "uppercase", uppercase).unwrap_err();
        assert!(matches!(err, ResolveError::Duplicate { .. }));
    }

    #[test]
    fn resolve_distinguishes_type_and_member() {
        let (registry, _) = registry();

        let err = registry.resolve("nope", "uppercase").err().unwrap();
        assert!(matches!(err, ResolveError::TypeNotFound { .. }));
        assert_eq!(err.to_string(), "operation type 'nope' is not registered");

        let err = registry.resolve("text", "lowercase").err().unwrap();
        assert!(matches!(err, ResolveError::MemberNotFound { .. }));
        assert_eq!(
            err.to_string(),
            "operation type 'text' has no member 'lowercase'"
        );
    }

    #[test]
    fn unary_invoke_decodes_argument() {
        let (registry, _) = registry();
        let resolved = registry.resolve("text", "uppercase").unwrap();
        assert_eq!(resolved.arity(), Arity::Unary);
        assert_eq!(resolved.invoke("\"abc\"").unwrap(), json!("ABC"));
    }

    #[test]
    fn nullary_invoke_ignores_argument() {
        let (registry, _) = registry();
        let resolved = registry.resolve("math", "answer").unwrap();
        assert_eq!(resolved.arity(), Arity::Nullary);
        assert_eq!(resolved.invoke("anything at all").unwrap(), json!(42));
    }

    #[test]
    fn operation_error_is_captured_with_type_and_trace() {
        let (registry, _) = registry();
        let err = registry
            .resolve("text", "uppercase")
            .unwrap()
            .invoke("\"\"")
            .unwrap_err();

        assert_eq!(err.message, "cannot shout ''");
        assert!(err.exception_type.ends_with("ShoutError"));
        assert!(!err.stack_trace.is_empty());
    }

    #[test]
    fn argument_of_wrong_shape_is_captured() {
        let (registry, _) = registry();
        let err = registry
            .resolve("text", "uppercase")
            .unwrap()
            .invoke("[1, 2]")
            .unwrap_err();
        assert_eq!(err.exception_type, "serde_json::error::Error");
    }

    #[test]
    fn check_rejects_signature_mismatch() {
        let (registry, _) = registry();
        let wrong: Operation<u32, String> = Operation::named("text", "uppercase");
        let err = registry.check(&wrong).unwrap_err();
        assert!(matches!(err, ResolveError::NotInvocable { .. }));
        assert!(err.to_string().contains("registered as fn(alloc::string::String)"));
    }

    #[test]
    fn check_rejects_unknown_handle() {
        let (registry, _) = registry();
        let ghost: Operation<String, String> = Operation::named("text", "ghost");
        assert!(matches!(
            registry.check(&ghost),
            Err(ResolveError::MemberNotFound { .. })
        ));
    }

    #[test]
    fn non_capturing_closures_register() {
        let mut registry = Registry::new();
        let op = registry
            .register("math", "double", |n: i64| Ok::<_, std::io::Error>(n * 2))
            .unwrap();
        assert_eq!(registry.check(&op).unwrap(), Arity::Unary);
    }
}
