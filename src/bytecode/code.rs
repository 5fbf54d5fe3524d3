//! Code object containing compiled bytecode and metadata.
//!
//! A `Code` object is the output of the Lambda Compiler for one non-inlined
//! lambda and the input to [`crate::bytecode::vm`]: bytecode, bound
//! constants, a location table for diagnostics, and a structured exception
//! table.

use std::fmt;
use std::rc::Rc;

use crate::opcode::Opcode;
use crate::value::Value;

/// Compiled bytecode for one lambda.
#[derive(Debug, Clone)]
pub struct Code {
    /// Opcodes are one byte each, followed by 0-3 operand bytes.
    bytecode: Vec<u8>,

    /// This lambda's bound constants, in allocation order. Indexed by the
    /// `u16` operand of `LoadConst`.
    constants: ConstPool,

    /// Maps bytecode offsets to originating node, for diagnostics.
    location_table: Vec<LocationEntry>,

    /// Protected-range -> handler table, innermost-first.
    exception_table: Vec<ExceptionEntry>,

    /// Number of local slots (scratch temporaries + locals) this function
    /// needs; used to pre-size the VM's frame.
    num_locals: u16,

    /// Maximum operand-stack depth, computed by the builder while emitting.
    stack_size: u16,

    /// Local names, for introspection/pretty-printing only.
    local_names: Vec<Option<String>>,

    /// Precompiled `Code` for every `Lambda` node nested directly in this
    /// one's body, in the order the `MakeLambda` opcode's `u16` operand
    /// indexes them.
    nested: Vec<Rc<Code>>,

    /// Number of declared parameters, for the `InvokeLambda`/host-call
    /// arity check.
    arity: usize,
}

impl Code {
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bytecode: Vec<u8>,
        constants: ConstPool,
        location_table: Vec<LocationEntry>,
        exception_table: Vec<ExceptionEntry>,
        num_locals: u16,
        stack_size: u16,
        local_names: Vec<Option<String>>,
        nested: Vec<Rc<Code>>,
        arity: usize,
    ) -> Self {
        Self { bytecode, constants, location_table, exception_table, num_locals, stack_size, local_names, nested, arity }
    }

    #[must_use]
    pub fn nested(&self, index: u16) -> &Rc<Code> {
        &self.nested[index as usize]
    }

    #[must_use]
    pub fn arity(&self) -> usize {
        self.arity
    }

    #[must_use]
    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    #[must_use]
    pub fn constants(&self) -> &ConstPool {
        &self.constants
    }

    #[must_use]
    pub fn num_locals(&self) -> u16 {
        self.num_locals
    }

    #[must_use]
    pub fn stack_size(&self) -> u16 {
        self.stack_size
    }

    #[must_use]
    pub fn local_name(&self, slot: u16) -> Option<&str> {
        self.local_names.get(slot as usize).and_then(|n| n.as_deref())
    }

    /// Finds the most recent location entry at or before `offset`.
    #[must_use]
    pub fn location_for_offset(&self, offset: usize) -> Option<&LocationEntry> {
        let offset_u32 = u32::try_from(offset).expect("bytecode offset exceeds u32");
        self.location_table.iter().rev().find(|entry| entry.bytecode_offset <= offset_u32)
    }

    /// Finds the innermost exception handler whose protected range contains
    /// `offset`.
    #[must_use]
    pub fn find_exception_handler(&self, offset: u32) -> Option<&ExceptionEntry> {
        self.exception_table.iter().find(|entry| entry.contains(offset))
    }

    #[must_use]
    pub fn exception_entries(&self) -> &[ExceptionEntry] {
        &self.exception_table
    }
}

/// Disassembles `code`, one instruction per line, annotated with the
/// originating node where a location entry covers it, followed by the
/// constant pool and exception table. Meant for test assertions on emitted
/// shape and ad-hoc debugging — never parsed back, so its exact layout
/// carries no compatibility guarantee.
impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Code {{ arity: {}, locals: {}, stack: {} }}", self.arity, self.num_locals, self.stack_size)?;
        let mut ip = 0usize;
        while ip < self.bytecode.len() {
            let offset = ip;
            let Some(op) = Opcode::decode(self.bytecode[ip]) else {
                writeln!(f, "  {offset:>6}: <unknown byte {}>", self.bytecode[ip])?;
                break;
            };
            ip += 1;
            let operand = disassemble_operand(op, &self.bytecode, &mut ip);
            match self.location_for_offset(offset) {
                Some(loc) => writeln!(f, "  {offset:>6}: {op:?}{operand:<24} ; node {:?}", loc.node())?,
                None => writeln!(f, "  {offset:>6}: {op:?}{operand}")?,
            }
        }
        if !self.constants.is_empty() {
            writeln!(f, "constants:")?;
            for i in 0..self.constants.len() {
                writeln!(f, "  [{i}] {:?}", self.constants.get(i as u16))?;
            }
        }
        if !self.exception_table.is_empty() {
            writeln!(f, "exception table:")?;
            for entry in &self.exception_table {
                writeln!(
                    f,
                    "  [{}, {}) -> {} (stack depth {})",
                    entry.start, entry.end, entry.handler, entry.stack_depth
                )?;
            }
        }
        Ok(())
    }
}

fn disassemble_operand(op: Opcode, bytecode: &[u8], ip: &mut usize) -> String {
    let u8_at = |ip: &mut usize| { let b = bytecode[*ip]; *ip += 1; b };
    let u16_at = |ip: &mut usize| { let b = [bytecode[*ip], bytecode[*ip + 1]]; *ip += 2; u16::from_le_bytes(b) };
    use Opcode::*;
    match op {
        LoadSmallInt => format!(" {}", u8_at(ip) as i8),
        LoadLocal | StoreLocal | InvokeLambda => format!(" {}", u8_at(ip)),
        LoadConst | LoadLocalW | StoreLocalW | MakeLambda | MakeRuntimeVariables | SwitchHash => {
            format!(" #{}", u16_at(ip))
        }
        LoadClosureField | StoreClosureField => {
            let depth = u8_at(ip);
            let field = u8_at(ip);
            format!(" depth={depth} field={field}")
        }
        NewClosureRecord => {
            let arity = u16_at(ip);
            let has_parent = u8_at(ip);
            format!(" arity={arity} has_parent={}", has_parent != 0)
        }
        Jump | JumpIfTrue | JumpIfFalse | JumpIfTrueOrPop | JumpIfFalseOrPop | Leave => {
            let offset = u16_at(ip) as i16;
            format!(" {offset:+}")
        }
        CallHost | NewHost => {
            let idx = u16_at(ip);
            let argc = u8_at(ip);
            format!(" #{idx} argc={argc}")
        }
        MakeQuote => {
            let slot = u16_at(ip);
            let count = u8_at(ip);
            format!(" #{slot} free={count}")
        }
        _ => String::new(),
    }
}

/// This lambda's bound-constants record: the runtime half of the Constant
/// Allocator's output. Reference-equality dedup already happened at
/// allocation time (see [`crate::constants`]), so by the time a `ConstPool`
/// exists, each slot is simply whatever value the allocator decided belongs
/// there.
#[derive(Debug, Clone, Default)]
pub struct ConstPool {
    values: Vec<Value>,
}

impl ConstPool {
    #[must_use]
    pub fn from_vec(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// # Panics
    /// Panics on an out-of-bounds index; valid bytecode never does this
    /// since indices are assigned by the allocator that built this pool.
    #[must_use]
    pub fn get(&self, index: u16) -> &Value {
        &self.values[index as usize]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Maps a bytecode offset to the tree node it was emitted for.
#[derive(Debug, Clone, Copy)]
pub struct LocationEntry {
    bytecode_offset: u32,
    node: crate::tree::NodeId,
}

impl LocationEntry {
    #[must_use]
    pub fn new(bytecode_offset: u32, node: crate::tree::NodeId) -> Self {
        Self { bytecode_offset, node }
    }

    #[must_use]
    pub fn node(&self) -> crate::tree::NodeId {
        self.node
    }
}

/// Entry in the exception table — maps a protected bytecode range to its
/// handler, in a static-table style (no runtime handler stack). Entries are
/// ordered innermost-first for nested `Try` nodes.
#[derive(Debug, Clone, Copy)]
pub struct ExceptionEntry {
    start: u32,
    end: u32,
    handler: u32,
    /// Stack depth on entry to the protected region; the VM unwinds the
    /// operand stack to this depth before pushing the exception value and
    /// jumping to `handler`.
    stack_depth: u16,
}

impl ExceptionEntry {
    #[must_use]
    pub fn new(start: u32, end: u32, handler: u32, stack_depth: u16) -> Self {
        Self { start, end, handler, stack_depth }
    }

    #[must_use]
    pub fn handler(&self) -> u32 {
        self.handler
    }

    #[must_use]
    pub fn stack_depth(&self) -> u16 {
        self.stack_depth
    }

    #[must_use]
    pub fn contains(&self, offset: u32) -> bool {
        offset >= self.start && offset < self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::NodeId;

    fn sample_code() -> Code {
        // LoadSmallInt 1; LoadSmallInt 2; Add; ReturnValue
        let bytecode = vec![
            Opcode::LoadSmallInt as u8, 1,
            Opcode::LoadSmallInt as u8, 2,
            Opcode::Add as u8,
            Opcode::ReturnValue as u8,
        ];
        let locations = vec![LocationEntry::new(0, NodeId(0)), LocationEntry::new(4, NodeId(1))];
        let exceptions = vec![ExceptionEntry::new(0, 4, 4, 0)];
        Code::new(bytecode, ConstPool::from_vec(vec![Value::Int(7)]), locations, exceptions, 2, 2, vec![], vec![], 0)
    }

    #[test]
    fn display_lists_every_instruction_and_its_location() {
        let rendered = sample_code().to_string();
        assert!(rendered.contains("LoadSmallInt 1"));
        assert!(rendered.contains("Add"));
        assert!(rendered.contains("node NodeId"));
    }

    #[test]
    fn display_lists_constants_and_exception_table() {
        let rendered = sample_code().to_string();
        assert!(rendered.contains("constants:"));
        assert!(rendered.contains("[0] Int(7)"));
        assert!(rendered.contains("exception table:"));
        assert!(rendered.contains("[0, 4) -> 4"));
    }
}
