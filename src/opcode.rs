//! The stack-machine instruction set emitted by the Lambda Compiler and
//! executed by [`crate::bytecode::vm`].
//!
//! Specialized zero-operand forms cover the first few local slots, falling
//! back to an explicit operand beyond that; loads/stores cover arguments,
//! locals, closure fields, and boxed cells; `New*` opcodes construct the
//! closure-record/cell/quote/runtime-variables family this backend needs.

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(u8)]
pub enum Opcode {
    // --- stack / constants -------------------------------------------------
    Nop = 0,
    Pop,
    Dup,
    PushNull,
    PushTrue,
    PushFalse,
    /// Signed one-byte immediate, for `InlineConst::Int` in range.
    LoadSmallInt,
    /// `u16` index into the current lambda's bound-constants record.
    LoadConst,

    // --- locals / arguments --------------------------------------------------
    LoadArg0,
    LoadLocal0,
    LoadLocal1,
    LoadLocal2,
    LoadLocal3,
    /// `u8` slot, for slots 4..=255.
    LoadLocal,
    /// `u16` slot, for slots beyond 255.
    LoadLocalW,
    StoreLocal0,
    StoreLocal1,
    StoreLocal2,
    StoreLocal3,
    StoreLocal,
    StoreLocalW,

    // --- closure / cell access ----------------------------------------------
    /// Load the environment's `Locals` closure record (argument 0's second
    /// field) onto the stack.
    LoadOuterClosure,
    /// Walk `u8` back-reference hops from the top-of-stack closure record,
    /// then read field `u8`.
    LoadClosureField,
    StoreClosureField,
    /// Read/write a boxed cell's single value field. The cell reference must
    /// already be on the stack.
    LoadCellValue,
    StoreCellValue,
    /// Allocate a fresh boxed cell, storing the top-of-stack value into it
    /// and leaving the cell reference on the stack.
    NewCell,
    /// Allocate a closure record of arity `u16`, consuming that many
    /// stack values (already in field order) plus, if `u8 != 0`, one more
    /// value below them for the parent back-reference.
    NewClosureRecord,

    // --- arithmetic / comparison --------------------------------------------
    Add,
    AddChecked,
    Sub,
    SubChecked,
    Mul,
    MulChecked,
    Div,
    Neg,
    Not,
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,
    CmpEq,
    CmpNe,

    // --- branches ------------------------------------------------------------
    /// `i16` relative offset from the end of the instruction.
    Jump,
    JumpIfTrue,
    JumpIfFalse,
    /// Short-circuit `&&`/`||`: peek, jump without popping if the branch
    /// decides the expression, otherwise pop and fall through.
    JumpIfTrueOrPop,
    JumpIfFalseOrPop,

    // --- calls / objects -------------------------------------------------------
    /// `u16` index into the host-function table, `u8` argument count.
    CallHost,
    /// Construct via a host handle: `u16` index, `u8` argument count.
    NewHost,
    /// Invoke a lambda value: stack holds `[callee, arg0, arg1, ..., argN-1]`
    /// (callee pushed first), `u8` operand is `N`.
    InvokeLambda,
    /// Materialize a nested lambda literal as a first-class value. Pops one
    /// value — a closure record to capture, or `Null` for "captures
    /// nothing" — and pairs it with the `u16`-indexed entry in this code
    /// object's nested-lambda table.
    MakeLambda,

    // --- quote / runtime-variables --------------------------------------------
    /// `u16` bound-constants slot holding the quoted tree, `u8` free-variable
    /// count consumed from the stack (cell references, in declaration
    /// order) to build the cell-environment.
    MakeQuote,
    /// `u16` bound-constants slot holding the packed index table. Pops one
    /// value — the closure record the packed depths are resolved relative
    /// to — and pushes the resulting handle.
    MakeRuntimeVariables,

    // --- exceptions ------------------------------------------------------------
    Throw,
    Rethrow,
    /// Leave a try region, performing any pending finally logic before
    /// jumping to the `i16`-relative target.
    Leave,

    // --- structured switch -----------------------------------------------------
    /// `u16` bound-constants slot holding a precomputed string-to-offset
    /// dispatch table.
    SwitchHash,

    // --- return ----------------------------------------------------------------
    ReturnValue,
    ReturnVoid,
}

impl Opcode {
    /// Number of operand bytes following the opcode byte itself, for
    /// disassembly and for the VM's fetch step. `None` for opcodes whose
    /// operand width is data-dependent (never emitted by this crate as of
    /// writing, kept as an explicit extension point).
    pub fn operand_len(self) -> usize {
        use Opcode::*;
        match self {
            Nop | Pop | Dup | PushNull | PushTrue | PushFalse | LoadArg0 | LoadLocal0 | LoadLocal1
            | LoadLocal2 | LoadLocal3 | StoreLocal0 | StoreLocal1 | StoreLocal2 | StoreLocal3
            | LoadOuterClosure | LoadCellValue | StoreCellValue | NewCell | Add | AddChecked | Sub
            | SubChecked | Mul | MulChecked | Div | Neg | Not | CmpLt | CmpLe | CmpGt | CmpGe | CmpEq
            | CmpNe | Throw | Rethrow | ReturnValue | ReturnVoid => 0,
            InvokeLambda => 1,
            LoadSmallInt => 1,
            LoadLocal | StoreLocal => 1,
            LoadConst | LoadLocalW | StoreLocalW => 2,
            LoadClosureField | StoreClosureField => 2,
            NewClosureRecord => 3,
            Jump | JumpIfTrue | JumpIfFalse | JumpIfTrueOrPop | JumpIfFalseOrPop | Leave => 2,
            CallHost | NewHost => 3,
            MakeQuote => 3,
            MakeRuntimeVariables | SwitchHash | MakeLambda => 2,
        }
    }

    /// Decodes a raw opcode byte, for the VM's fetch step. `None` for a byte
    /// that names no opcode — malformed bytecode, never produced by this
    /// crate's own emitter.
    #[must_use]
    pub fn decode(byte: u8) -> Option<Opcode> {
        use Opcode::*;
        const ALL: [Opcode; 60] = [
            Nop, Pop, Dup, PushNull, PushTrue, PushFalse, LoadSmallInt, LoadConst, LoadArg0, LoadLocal0, LoadLocal1,
            LoadLocal2, LoadLocal3, LoadLocal, LoadLocalW, StoreLocal0, StoreLocal1, StoreLocal2, StoreLocal3,
            StoreLocal, StoreLocalW, LoadOuterClosure, LoadClosureField, StoreClosureField, LoadCellValue,
            StoreCellValue, NewCell, NewClosureRecord, Add, AddChecked, Sub, SubChecked, Mul, MulChecked, Div, Neg,
            Not, CmpLt, CmpLe, CmpGt, CmpGe, CmpEq, CmpNe, Jump, JumpIfTrue, JumpIfFalse, JumpIfTrueOrPop,
            JumpIfFalseOrPop, CallHost, NewHost, InvokeLambda, MakeLambda, MakeQuote, MakeRuntimeVariables, Throw,
            Rethrow, Leave, SwitchHash, ReturnValue, ReturnVoid,
        ];
        ALL.get(byte as usize).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jump_family_has_two_operand_bytes() {
        for op in [Opcode::Jump, Opcode::JumpIfTrue, Opcode::JumpIfFalse] {
            assert_eq!(op.operand_len(), 2);
        }
    }

    #[test]
    fn zero_operand_opcodes_report_zero() {
        assert_eq!(Opcode::Add.operand_len(), 0);
        assert_eq!(Opcode::ReturnValue.operand_len(), 0);
    }

    #[test]
    fn decode_round_trips_every_discriminant() {
        for op in [Opcode::Nop, Opcode::LoadConst, Opcode::NewClosureRecord, Opcode::ReturnVoid] {
            assert_eq!(Opcode::decode(op as u8), Some(op));
        }
        assert_eq!(Opcode::decode(255), None);
    }
}
