//! Runtime-Variables Facility: exposes a selected set of
//! variables as a single indexable, polymorphic handle value, so host code
//! can enumerate and mutate them without knowing each one's individual
//! storage kind.

use std::rc::Rc;

use crate::closure::ClosureRecord;
use crate::error::{RuntimeError, RuntimeResult};
use crate::value::{Cell, Value};

/// Where one listed variable lives, relative to the closure record active
/// when its `RuntimeVariables` node executes: `depth` back-reference hops
/// (see [`ClosureRecord::ancestor`]), then either its field directly (a
/// plain hoisted variable) or a boxed cell read through that field (a
/// variable also captured by a quote). Produced by the Lambda Compiler from
/// Variable Binder output and stored as the bound-constants slot the
/// Constant Allocator reserves for the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackedIndex {
    pub is_cell: bool,
    pub depth: u8,
    pub field: u16,
}

impl PackedIndex {
    pub fn pack(self) -> i64 {
        let cell_bit = if self.is_cell { 1i64 << 63 } else { 0 };
        cell_bit | ((self.depth as i64) << 16) | self.field as i64
    }

    pub fn unpack(raw: i64) -> Self {
        Self { is_cell: raw & (1 << 63) != 0, depth: ((raw >> 16) & 0xFF) as u8, field: (raw & 0xFFFF) as u16 }
    }
}

#[derive(Debug)]
enum VarSlot {
    Cell(Cell),
    Field(Rc<ClosureRecord>, usize),
}

/// The reified handle. Each slot is resolved once, by walking the closure
/// chain from a base record when the `RuntimeVariables` node executes; the
/// resolved `Rc` is held directly afterward rather than re-walked on every
/// access, since the chain of records it traverses cannot change once this
/// handle exists.
#[derive(Debug)]
pub struct RuntimeVariablesHandle {
    slots: Vec<VarSlot>,
}

impl RuntimeVariablesHandle {
    pub fn resolve(base: &Rc<ClosureRecord>, indices: &[PackedIndex]) -> Rc<Self> {
        let slots = indices
            .iter()
            .map(|idx| {
                let record = base.ancestor(idx.depth);
                if idx.is_cell {
                    VarSlot::Cell(record.get_cell(idx.field as usize))
                } else {
                    VarSlot::Field(record, idx.field as usize)
                }
            })
            .collect();
        Rc::new(Self { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, index: usize) -> RuntimeResult<Value> {
        let slot = self.slots.get(index).ok_or(RuntimeError::RuntimeVariableIndexOutOfRange(index))?;
        Ok(match slot {
            VarSlot::Cell(c) => c.borrow().clone(),
            VarSlot::Field(record, field) => record.get(*field),
        })
    }

    pub fn set(&self, index: usize, value: Value) -> RuntimeResult<()> {
        let slot = self.slots.get(index).ok_or(RuntimeError::RuntimeVariableIndexOutOfRange(index))?;
        match slot {
            VarSlot::Cell(c) => *c.borrow_mut() = value,
            VarSlot::Field(record, field) => record.set(*field, value),
        }
        Ok(())
    }
}
