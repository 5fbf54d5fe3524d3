//! Emitter substrate: method/locals/labels and structured exception regions.
//!
//! `CodeBuilder` is the emitter substrate: method definition, local
//! declaration, label definition and marking, structured try/catch/finally
//! regions, and the opcode set itself — the same jump-patching and
//! specialized-local encoding scheme a bytecode-compiled-language backend
//! would use, retargeted at this crate's own `Opcode` vocabulary.

use std::rc::Rc;

use super::code::{Code, ConstPool, ExceptionEntry, LocationEntry};
use crate::opcode::Opcode;
use crate::tree::NodeId;
use crate::value::Value;

#[derive(Debug, Default)]
pub struct CodeBuilder {
    bytecode: Vec<u8>,
    constants: Vec<Value>,
    location_table: Vec<LocationEntry>,
    exception_table: Vec<ExceptionEntry>,
    current_node: Option<NodeId>,
    current_stack_depth: u16,
    max_stack_depth: u16,
    local_names: Vec<Option<String>>,
    nested: Vec<Rc<Code>>,
}

impl CodeBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the node subsequent instructions are attributed to.
    pub fn set_location(&mut self, node: NodeId) {
        self.current_node = Some(node);
    }

    pub fn emit(&mut self, op: Opcode) {
        self.record_location();
        self.bytecode.push(op as u8);
    }

    pub fn emit_u8(&mut self, op: Opcode, operand: u8) {
        self.record_location();
        self.bytecode.push(op as u8);
        self.bytecode.push(operand);
    }

    pub fn emit_i8(&mut self, op: Opcode, operand: i8) {
        self.record_location();
        self.bytecode.push(op as u8);
        self.bytecode.push(operand as u8);
    }

    pub fn emit_u16(&mut self, op: Opcode, operand: u16) {
        self.record_location();
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand.to_le_bytes());
    }

    pub fn emit_u16_u8(&mut self, op: Opcode, operand1: u16, operand2: u8) {
        self.record_location();
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&operand1.to_le_bytes());
        self.bytecode.push(operand2);
    }

    pub fn emit_u8_u8(&mut self, op: Opcode, operand1: u8, operand2: u8) {
        self.record_location();
        self.bytecode.push(op as u8);
        self.bytecode.push(operand1);
        self.bytecode.push(operand2);
    }

    /// Emits a forward jump, returning a label to patch once the target is
    /// known.
    #[must_use]
    pub fn emit_jump(&mut self, op: Opcode) -> JumpLabel {
        self.record_location();
        let label = JumpLabel(self.bytecode.len());
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&0i16.to_le_bytes());
        label
    }

    /// Patches a forward jump to point at the current bytecode position.
    ///
    /// # Panics
    /// Panics if the offset exceeds `i16` range — the function is too large
    /// for this substrate, a hard compile-time failure rather than silent
    /// truncation.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.bytecode.len();
        let raw_offset = target as i64 - label.0 as i64 - 3;
        let offset =
            i16::try_from(raw_offset).expect("jump offset exceeds i16 range (-32768..32767); function too large");
        let bytes = offset.to_le_bytes();
        self.bytecode[label.0 + 1] = bytes[0];
        self.bytecode[label.0 + 2] = bytes[1];
    }

    /// Emits a backward jump to an already-known target offset.
    pub fn emit_jump_to(&mut self, op: Opcode, target: usize) {
        self.record_location();
        let current = self.bytecode.len();
        let raw_offset = target as i64 - (current as i64 + 3);
        let offset =
            i16::try_from(raw_offset).expect("jump offset exceeds i16 range (-32768..32767); function too large");
        self.bytecode.push(op as u8);
        self.bytecode.extend_from_slice(&offset.to_le_bytes());
    }

    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    pub fn register_local_name(&mut self, slot: u16, name: &str) {
        let slot_idx = slot as usize;
        if slot_idx >= self.local_names.len() {
            self.local_names.resize(slot_idx + 1, None);
        }
        if self.local_names[slot_idx].is_none() {
            self.local_names[slot_idx] = Some(name.to_owned());
        }
    }

    /// Emits `LoadLocal`, using specialized zero-operand opcodes for slots
    /// 0-3 and falling back to an explicit operand beyond that.
    pub fn emit_load_local(&mut self, slot: u16) {
        match slot {
            0 => self.emit(Opcode::LoadLocal0),
            1 => self.emit(Opcode::LoadLocal1),
            2 => self.emit(Opcode::LoadLocal2),
            3 => self.emit(Opcode::LoadLocal3),
            s if s <= 255 => self.emit_u8(Opcode::LoadLocal, s as u8),
            s => self.emit_u16(Opcode::LoadLocalW, s),
        }
        self.track_stack(1);
    }

    pub fn emit_store_local(&mut self, slot: u16) {
        match slot {
            0 => self.emit(Opcode::StoreLocal0),
            1 => self.emit(Opcode::StoreLocal1),
            2 => self.emit(Opcode::StoreLocal2),
            3 => self.emit(Opcode::StoreLocal3),
            s if s <= 255 => self.emit_u8(Opcode::StoreLocal, s as u8),
            s => self.emit_u16(Opcode::StoreLocalW, s),
        }
        self.track_stack(-1);
    }

    /// Adjusts the tracked operand-stack depth by `delta`, remembering the
    /// high-water mark. Callers emit the opcode first, then report its net
    /// stack effect.
    pub fn track_stack(&mut self, delta: i32) {
        let new_depth = self.current_stack_depth as i32 + delta;
        debug_assert!(new_depth >= 0, "operand stack underflow during emission");
        self.current_stack_depth = new_depth.max(0) as u16;
        self.max_stack_depth = self.max_stack_depth.max(self.current_stack_depth);
    }

    #[must_use]
    pub fn stack_depth(&self) -> u16 {
        self.current_stack_depth
    }

    /// Adds a constant to this lambda's pool, returning its slot index.
    ///
    /// # Panics
    /// Panics past 65535 entries; callers should have rejected this earlier
    /// via [`crate::error::CompileErrorKind::ConstantOverflow`].
    #[must_use]
    pub fn add_const(&mut self, value: Value) -> u16 {
        let idx = self.constants.len();
        u16::try_from(idx).expect("constant pool exceeds u16 range (65535); too many constants");
        self.constants.push(value);
        idx as u16
    }

    #[must_use]
    pub fn const_count(&self) -> usize {
        self.constants.len()
    }

    /// Overwrites an already-added constant slot in place — used for the
    /// bound-constants slots the Constant Allocator reserves blank and the
    /// Lambda Compiler fills in once Variable Binder output is available.
    pub fn patch_const(&mut self, index: u16, value: Value) {
        self.constants[index as usize] = value;
    }

    pub fn add_exception_entry(&mut self, entry: ExceptionEntry) {
        self.exception_table.push(entry);
    }

    /// Registers a nested lambda's already-compiled `Code`, returning the
    /// `u16` index a `MakeLambda` instruction should use to reference it.
    #[must_use]
    pub fn add_nested_lambda(&mut self, code: Rc<Code>) -> u16 {
        let idx = u16::try_from(self.nested.len()).expect("more than 65535 nested lambdas in one function");
        self.nested.push(code);
        idx
    }

    #[must_use]
    pub fn build(self, num_locals: u16, arity: usize) -> Code {
        Code::new(
            self.bytecode,
            ConstPool::from_vec(self.constants),
            self.location_table,
            self.exception_table,
            num_locals,
            self.max_stack_depth,
            self.local_names,
            self.nested,
            arity,
        )
    }

    fn record_location(&mut self) {
        if let Some(node) = self.current_node {
            self.location_table.push(LocationEntry::new(self.bytecode.len() as u32, node));
        }
    }
}

/// A forward jump awaiting [`CodeBuilder::patch_jump`]. Stores the bytecode
/// offset of the jump instruction itself.
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel(usize);
