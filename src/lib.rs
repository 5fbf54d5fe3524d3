//! Closure analysis, constant pooling, and a stack-machine emitter backend
//! for compiling lambda expression trees into invocable callables.
//!
//! The pipeline: [`tree`] describes the expression trees this crate
//! compiles; [`binder`] classifies every variable's storage kind;
//! [`constants`] pools compile-time constants and quote/runtime-variables
//! metadata per lambda; [`spiller`] decides which composite nodes need a
//! temporary rather than direct stack evaluation; [`bytecode`] emits and
//! then runs the resulting code; [`env`] ties a compiled lambda's code to
//! its live closure state and exposes [`env::compile`], the entry point.

mod binder;
mod bytecode;
mod closure;
mod constants;
mod env;
mod error;
mod opcode;
mod quote;
mod runtime_vars;
mod spiller;
mod tree;
mod value;

pub use crate::{
    binder::StorageKind,
    bytecode::code::{Code, ConstPool, ExceptionEntry, LocationEntry},
    closure::{closure_layout, ClosureLayout, ClosureRecord, PREGENERATED_MAX_ARITY},
    env::{compile, compile_with_limits, CompileLimits, CompiledLambda, HostFunctions},
    error::{CompileError, CompileErrorKind, CompileResult, RuntimeError, RuntimeResult},
    opcode::Opcode,
    quote::{QuoteTemplate, QuotedTree},
    runtime_vars::{PackedIndex, RuntimeVariablesHandle},
    tree::{
        BinOp, BoxedConst, BoxedPayload, CatchClause, ConstantValue, HostHandle, IncDecOp, InlineConst, LabelId,
        NodeData, NodeId, NodeKind, Tree, TreeBuilder, Ty, UnOp, VarData, VarId,
    },
    value::{Cell, Value},
};
