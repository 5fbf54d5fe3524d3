//! Compile-time and runtime error taxonomy.
//!
//! `CompileError` pairs a message with the offending node, generalized with
//! a [`CompileErrorKind`] carrying the compile-time failure taxonomy.

use std::borrow::Cow;

use crate::tree::NodeId;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CompileErrorKind {
    #[error("variable used outside its declaring scope")]
    UnboundVariable,
    #[error("catch filter references a variable not declared in that catch")]
    UndeclaredCatchFilterVariable,
    #[error("goto has no matching label in scope")]
    UnresolvedLabel,
    #[error("lambda body type is incompatible with its declared type")]
    TypeMismatch,
    #[error("expression kind not supported by the emitter substrate")]
    UnsupportedConstruct,
    #[error("bound-constants slot count exceeds the emitter's addressable range")]
    ConstantOverflow,
}

/// A fatal compile-time failure. Carries the offending node so callers can
/// point back into the tree without the core needing to format positions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message} (at node {node:?})")]
pub struct CompileError {
    pub kind: CompileErrorKind,
    pub node: NodeId,
    pub message: Cow<'static, str>,
}

impl CompileError {
    pub fn new(kind: CompileErrorKind, node: NodeId, message: impl Into<Cow<'static, str>>) -> Self {
        Self { kind, node, message: message.into() }
    }
}

pub type CompileResult<T> = Result<T, CompileError>;

/// Failures the bytecode interpreter substrate can raise while running
/// already-compiled code. The core adds no wrapping beyond this enum; a host
/// embedding the interpreter is expected to translate these into its own
/// exception representation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RuntimeError {
    #[error("division by zero")]
    DivideByZero,
    #[error("checked arithmetic overflowed")]
    ArithmeticOverflow,
    #[error("runtime-variables index {0} out of range")]
    RuntimeVariableIndexOutOfRange(usize),
    #[error("host call {0:?} failed: {1}")]
    HostCallFailed(String, String),
    #[error("unhandled exception propagated out of the compiled function: {0}")]
    Unhandled(String),
    #[error("malformed bytecode: {0}")]
    MalformedBytecode(String),
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
