//! Runtime value representation: the bytecode VM's stack/local cell type.
//!
//! A plain `Rc`-based enum rather than an inline-immediate / heap-arena
//! hybrid, since this crate has no garbage-collected heap of its own —
//! ordinary Rust ownership through `Rc`/`RefCell` does the aliasing work a
//! `Heap`/`HeapId` indirection would otherwise do.

use std::cell::RefCell;
use std::rc::Rc;

use crate::closure::ClosureRecord;
use crate::env::CompiledLambda;
use crate::quote::{QuoteTemplate, QuotedTree};
use crate::runtime_vars::RuntimeVariablesHandle;

/// A boxed cell: single-field heap object aliasing a variable's storage so a
/// quote (or a hoisted closure field) can share a live reference to it.
pub type Cell = Rc<RefCell<Value>>;

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(Rc<str>),
    Array(Rc<RefCell<Vec<Value>>>),
    Cell(Cell),
    Closure(Rc<ClosureRecord>),
    Lambda(Rc<CompiledLambda>),
    Quote(Rc<QuotedTree>),
    RuntimeVariables(Rc<RuntimeVariablesHandle>),
    /// The unbound, compile-time-constant half of a quote (see
    /// [`crate::quote`]); never observed by host code, only ever read back
    /// out of a constant pool by the `MakeQuote` opcode handler.
    QuoteTemplate(Rc<QuoteTemplate>),
}

impl Value {
    pub fn as_bool(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Int(n) => *n != 0,
            _ => true,
        }
    }

    pub fn as_int(&self) -> i64 {
        match self {
            Value::Int(n) => *n,
            Value::Bool(b) => *b as i64,
            other => panic!("expected int, found {other:?}"),
        }
    }

    pub fn as_str(&self) -> &Rc<str> {
        match self {
            Value::Str(s) => s,
            other => panic!("expected str, found {other:?}"),
        }
    }

    pub fn as_cell(&self) -> &Cell {
        match self {
            Value::Cell(c) => c,
            other => panic!("expected cell, found {other:?}"),
        }
    }

    pub fn as_closure(&self) -> &Rc<ClosureRecord> {
        match self {
            Value::Closure(c) => c,
            other => panic!("expected closure record, found {other:?}"),
        }
    }

    pub fn as_quote_template(&self) -> &Rc<QuoteTemplate> {
        match self {
            Value::QuoteTemplate(t) => t,
            other => panic!("expected quote template, found {other:?}"),
        }
    }

    /// Structural equality for quote-aliasing / array-parity tests. Not a
    /// general `PartialEq` impl because `Lambda`/`Quote`/`RuntimeVariables`
    /// have no sensible structural comparison.
    pub fn value_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => {
                let a = a.borrow();
                let b = b.borrow();
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.value_eq(y))
            }
            (Value::Cell(a), Value::Cell(b)) => a.borrow().value_eq(&b.borrow()),
            _ => false,
        }
    }
}
