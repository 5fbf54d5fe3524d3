//! Closure Record Factory.
//!
//! A closure record is a heap object carrying a lambda's hoisted variables
//! plus an optional back-reference to the enclosing closure record (field
//! index 0, when present). A monomorphized-per-arity family of generic
//! record types (`Item1..ItemN`) has no equivalent benefit in Rust (a
//! `Vec<Cell>` is already uniform and boxed), so the "family" is
//! represented as a single runtime layout plus an arity-keyed cache that
//! preserves the ≤16 pre-generated vs. >16 dynamic boundary as a
//! cache-population concern
//! rather than a distinct memory layout — see `DESIGN.md`.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Mutex, OnceLock};

use crate::value::{Cell, Value};

/// Arities at or below this bound are considered part of the "pre-generated"
/// family; above it, the "dynamic" family. Both are backed by the same
/// `Vec`-based storage — the distinction is tracked on [`ClosureLayout`]
/// purely so the boundary is observable (and testable) without requiring
/// per-arity monomorphized Rust types.
pub const PREGENERATED_MAX_ARITY: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct ClosureLayout {
    pub arity: usize,
    pub pregenerated: bool,
}

fn layout_cache() -> &'static Mutex<ahash::AHashMap<usize, ClosureLayout>> {
    static CACHE: OnceLock<Mutex<ahash::AHashMap<usize, ClosureLayout>>> = OnceLock::new();
    CACHE.get_or_init(|| Mutex::new(ahash::AHashMap::new()))
}

/// Returns the cached layout for `arity`, creating it on first use. Global,
/// process-wide, `init-on-first-use`, never invalidated.
pub fn closure_layout(arity: usize) -> ClosureLayout {
    let mut cache = layout_cache().lock().expect("closure layout cache poisoned");
    *cache.entry(arity).or_insert_with(|| ClosureLayout { arity, pregenerated: arity <= PREGENERATED_MAX_ARITY })
}

/// A heap object carrying the hoisted variables of one lambda. `fields[i]`
/// corresponds to the `i`-th hoisted variable in declaration order; `parent`
/// is the back-reference to the enclosing lambda's record, walked at runtime
/// to resolve a nested lambda's references to outer-hoisted variables.
#[derive(Debug)]
pub struct ClosureRecord {
    pub layout: ClosureLayout,
    pub parent: Option<Rc<ClosureRecord>>,
    fields: Vec<RefCell<Value>>,
}

impl ClosureRecord {
    pub fn new(parent: Option<Rc<ClosureRecord>>, fields: Vec<Value>) -> Rc<Self> {
        let layout = closure_layout(fields.len());
        Rc::new(Self { layout, parent, fields: fields.into_iter().map(RefCell::new).collect() })
    }

    pub fn count(&self) -> usize {
        self.fields.len()
    }

    /// Boxed read by index — the polymorphic `Item[int]` indexer.
    ///
    /// # Panics
    /// Panics on out-of-range `index`; the compiler only ever emits indices
    /// within the arity it itself allocated.
    pub fn get(&self, index: usize) -> Value {
        self.fields[index].borrow().clone()
    }

    pub fn set(&self, index: usize, value: Value) {
        *self.fields[index].borrow_mut() = value;
    }

    pub fn get_cell(&self, index: usize) -> Cell {
        match &*self.fields[index].borrow() {
            Value::Cell(c) => c.clone(),
            other => panic!("closure field {index} is not a cell: {other:?}"),
        }
    }

    /// Walks `depth` back-reference hops, the runtime counterpart of the
    /// compiler's `LoadClosureField` depth operand.
    pub fn ancestor(self: &Rc<Self>, depth: u8) -> Rc<ClosureRecord> {
        let mut cur = self.clone();
        for _ in 0..depth {
            cur = cur.parent.clone().expect("closure chain shorter than requested depth");
        }
        cur
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_arity_uses_pregenerated_family() {
        assert!(closure_layout(16).pregenerated);
        assert!(!closure_layout(17).pregenerated);
    }

    #[test]
    fn ancestor_walks_parent_chain() {
        let grandparent = ClosureRecord::new(None, vec![Value::Int(1)]);
        let parent = ClosureRecord::new(Some(grandparent.clone()), vec![Value::Int(2)]);
        let child = ClosureRecord::new(Some(parent.clone()), vec![Value::Int(3)]);
        assert!(Rc::ptr_eq(&child.ancestor(0), &child));
        assert!(Rc::ptr_eq(&child.ancestor(1), &parent));
        assert!(Rc::ptr_eq(&child.ancestor(2), &grandparent));
    }

    #[test]
    fn set_then_get_round_trips() {
        let record = ClosureRecord::new(None, vec![Value::Int(0)]);
        record.set(0, Value::Int(42));
        assert_eq!(record.get(0).as_int(), 42);
    }
}
