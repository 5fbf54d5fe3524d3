//! Lambda Compiler: the emitter pass itself. Walks one lambda's
//! body, consulting the Variable Binder for storage kinds, the Constant
//! Allocator for bound-constants slots, and the Stack Spiller for which
//! composite nodes must evaluate their operands into temporaries rather than
//! directly on the stack, and drives [`super::builder::CodeBuilder`] to
//! produce a [`super::code::Code`].
//!
//! Nested `Lambda` nodes are compiled recursively and registered via
//! `add_nested_lambda`; every `Invoke`, including one whose target is a
//! literal nested `Lambda`, goes through a real `InvokeLambda` call rather
//! than being inlined into the caller's body (see `DESIGN.md` for why).

use std::cell::RefCell;
use std::rc::Rc;

use ahash::{AHashMap, AHashSet};

use super::builder::{CodeBuilder, JumpLabel};
use super::code::{Code, ExceptionEntry};
use crate::binder::{Bindings, StorageKind};
use crate::constants::{value_of_constant, ConstantAllocation};
use crate::error::{CompileError, CompileErrorKind, CompileResult};
use crate::opcode::Opcode;
use crate::runtime_vars::PackedIndex;
use crate::spiller::SpillPlan;
use crate::tree::{
    BinOp, CatchClause, ConstantValue, HostHandle, IncDecOp, InlineConst, LabelId, NodeId, NodeKind, Ty, Tree, UnOp,
    VarId,
};
use crate::value::Value;

/// The program-wide table of host-function/constructor handles referenced by
/// `Call`/`New` nodes, assigned sequentially as the compiler first encounters
/// each distinct `(name, arity)` pair. Shared by every lambda compiled within
/// one top-level `compile` call, since `CallHost`/`NewHost` indices must be
/// consistent across nested lambdas' independent `Code` objects.
#[derive(Debug, Default)]
pub struct HostTable {
    handles: Vec<HostHandle>,
    index: AHashMap<(Rc<str>, usize), u16>,
}

impl HostTable {
    pub fn index_of(&mut self, handle: &HostHandle) -> u16 {
        let key = (handle.name.clone(), handle.arity);
        if let Some(&idx) = self.index.get(&key) {
            return idx;
        }
        let idx = u16::try_from(self.handles.len()).expect("more than 65535 distinct host handles");
        self.handles.push(handle.clone());
        self.index.insert(key, idx);
        idx
    }

    pub fn into_vec(self) -> Vec<HostHandle> {
        self.handles
    }
}

struct Compiler<'a> {
    tree: &'a Tree,
    bindings: &'a Bindings,
    constants: &'a ConstantAllocation,
    spill: &'a SpillPlan,
    host_table: Rc<RefCell<HostTable>>,
    builder: CodeBuilder,
    lambda: NodeId,
    var_slots: AHashMap<VarId, u16>,
    const_cache: AHashMap<u16, u16>,
    own_closure_slot: Option<u16>,
    free_locals: Vec<u16>,
    next_local: u16,
    label_offsets: AHashMap<LabelId, usize>,
    pending_gotos: Vec<(JumpLabel, LabelId)>,
}

/// Compiles one `Lambda` node (and, recursively, every `Lambda` node nested
/// in its body) into a [`Code`] object.
pub fn compile_one_lambda(
    tree: &Tree,
    bindings: &Bindings,
    constants: &ConstantAllocation,
    spill: &SpillPlan,
    host_table: Rc<RefCell<HostTable>>,
    lambda: NodeId,
) -> CompileResult<Rc<Code>> {
    let (params, body, ret_ty) = match &tree.node(lambda).kind {
        NodeKind::Lambda { params, body, ret_ty } => (params.clone(), *body, ret_ty.clone()),
        _ => panic!("compile_one_lambda called on a non-Lambda node"),
    };

    let mut c = Compiler {
        tree,
        bindings,
        constants,
        spill,
        host_table,
        builder: CodeBuilder::new(),
        lambda,
        var_slots: AHashMap::new(),
        const_cache: AHashMap::new(),
        own_closure_slot: None,
        free_locals: Vec::new(),
        next_local: 0,
        label_offsets: AHashMap::new(),
        pending_gotos: Vec::new(),
    };

    // Preload this lambda's bound constants so slot numbers line up with
    // what the Constant Allocator already assigned.
    let lc = constants.lambda(lambda);
    for v in lc.values() {
        c.builder.add_const(v.clone());
    }

    // Provisional slots [0..arity) for declared parameters, in order.
    for (i, &p) in params.iter().enumerate() {
        let slot = c.fresh_local();
        debug_assert_eq!(slot as usize, i);
        c.var_slots.insert(p, slot);
    }

    // Cache bound constants read more than twice in a dedicated local.
    let const_len = u16::try_from(lc.len()).expect("lambda has more than 65535 bound constants");
    for slot in 0..const_len {
        if lc.ref_count(slot) > 2 {
            c.builder.emit_u16(Opcode::LoadConst, slot);
            c.builder.track_stack(1);
            let cache_slot = c.fresh_local();
            c.builder.emit_store_local(cache_slot);
            c.const_cache.insert(slot, cache_slot);
        }
    }

    // Wrap boxed (non-hoisted) parameters in a cell, in place.
    for &p in &params {
        if bindings.kind_of(p) == StorageKind::Boxed {
            let slot = c.var_slots[&p];
            c.builder.emit_load_local(slot);
            c.builder.emit(Opcode::NewCell);
            c.builder.emit_store_local(slot);
        }
    }

    // Closure-record construction, if this lambda hoists anything.
    if bindings.needs_closure_record(lambda) {
        let fields = bindings.hoisted_fields(lambda).to_vec();
        let param_set: AHashSet<VarId> = params.iter().copied().collect();

        if bindings.has_outer_closure(lambda) {
            c.builder.emit(Opcode::LoadOuterClosure);
            c.builder.track_stack(1);
        }
        for &f in &fields {
            if param_set.contains(&f) {
                let slot = c.var_slots[&f];
                c.builder.emit_load_local(slot);
            } else {
                c.builder.emit(Opcode::PushNull);
                c.builder.track_stack(1);
            }
            if bindings.kind_of(f) == StorageKind::HoistedBoxed {
                c.builder.emit(Opcode::NewCell);
            }
        }
        let arity = u16::try_from(fields.len()).expect("closure record arity exceeds u16 range");
        let has_parent = u8::from(bindings.has_outer_closure(lambda));
        c.builder.emit_u16_u8(Opcode::NewClosureRecord, arity, has_parent);
        let popped = arity as i32 + i32::from(has_parent);
        c.builder.track_stack(1 - popped);

        let own_slot = c.fresh_local();
        c.builder.emit_store_local(own_slot);
        c.own_closure_slot = Some(own_slot);

        for &f in &fields {
            if param_set.contains(&f) {
                let slot = c.var_slots.remove(&f).expect("hoisted param slot missing");
                c.free_locals.push(slot);
            }
        }
    }

    c.compile_expr(body)?;
    if ret_ty == Ty::Void {
        c.builder.emit(Opcode::ReturnVoid);
    } else {
        c.builder.emit(Opcode::ReturnValue);
    }

    if let Some(&(_, label)) = c.pending_gotos.first() {
        return Err(CompileError::new(
            CompileErrorKind::UnresolvedLabel,
            lambda,
            format!("goto to label {label:?} has no matching label in this lambda"),
        ));
    }

    let num_locals = c.next_local;
    Ok(Rc::new(c.builder.build(num_locals, params.len())))
}

impl<'a> Compiler<'a> {
    fn fresh_local(&mut self) -> u16 {
        let slot = self.next_local;
        self.next_local = self.next_local.checked_add(1).expect("function needs more than 65535 locals");
        slot
    }

    fn alloc_temp(&mut self) -> u16 {
        self.free_locals.pop().unwrap_or_else(|| self.fresh_local())
    }

    fn free_temp(&mut self, slot: u16) {
        self.free_locals.push(slot);
    }

    fn force_stack_depth(&mut self, target: u16) {
        let delta = target as i32 - self.builder.stack_depth() as i32;
        self.builder.track_stack(delta);
    }

    /// Pushes the closure record `var`'s declaring lambda's fields live in,
    /// returning the hop count `LoadClosureField`/`StoreClosureField` should
    /// use to reach it from whatever gets pushed.
    fn push_closure_base(&mut self, declaring_lambda: NodeId) -> u8 {
        if declaring_lambda == self.lambda {
            let slot = self.own_closure_slot.expect("lambda reads its own hoisted field but built no closure record");
            self.builder.emit_load_local(slot);
            0
        } else {
            let hops = self.hops_to_ancestor(declaring_lambda);
            if let Some(slot) = self.own_closure_slot {
                self.builder.emit_load_local(slot);
                hops + 1
            } else {
                self.builder.emit(Opcode::LoadOuterClosure);
                self.builder.track_stack(1);
                hops
            }
        }
    }

    /// Depth from this lambda's immediate enclosing record to
    /// `declaring_lambda`'s record, not counting this lambda's own record
    /// (that case is handled separately by `push_closure_base`).
    fn hops_to_ancestor(&self, declaring_lambda: NodeId) -> u8 {
        let ancestors = self.bindings.ancestors(self.lambda);
        let pos = ancestors
            .iter()
            .position(|&a| a == declaring_lambda)
            .expect("declaring lambda is not an ancestor of the referencing lambda");
        u8::try_from(ancestors.len() - 1 - pos).expect("closure nesting deeper than 255 levels")
    }

    fn load_constant_slot(&mut self, slot: u16) {
        if let Some(&cache_slot) = self.const_cache.get(&slot) {
            self.builder.emit_load_local(cache_slot);
        } else {
            self.builder.emit_u16(Opcode::LoadConst, slot);
            self.builder.track_stack(1);
        }
    }

    fn push_inline(&mut self, ic: &InlineConst) {
        match ic {
            InlineConst::Null => self.builder.emit(Opcode::PushNull),
            InlineConst::Bool(true) => self.builder.emit(Opcode::PushTrue),
            InlineConst::Bool(false) => self.builder.emit(Opcode::PushFalse),
            InlineConst::Int(n) => self.builder.emit_i8(Opcode::LoadSmallInt, *n as i8),
        }
        self.builder.track_stack(1);
    }

    fn push_constant_value(&mut self, cv: &ConstantValue) {
        match cv {
            ConstantValue::Inline(ic) => self.push_inline(ic),
            ConstantValue::Boxed(_) => {
                let value = value_of_constant(cv);
                let slot = self.builder.add_const(value);
                self.builder.emit_u16(Opcode::LoadConst, slot);
                self.builder.track_stack(1);
            }
        }
    }

    /// Pushes `var`'s current value. Leaves exactly one value on the stack.
    fn load_var(&mut self, var: VarId) {
        match self.bindings.kind_of(var) {
            StorageKind::Argument | StorageKind::Local => {
                let slot = self.var_slots[&var];
                self.builder.emit_load_local(slot);
            }
            StorageKind::Boxed => {
                let slot = self.var_slots[&var];
                self.builder.emit_load_local(slot);
                self.builder.emit(Opcode::LoadCellValue);
            }
            StorageKind::Hoisted => {
                let declaring = self.bindings.declaring_lambda(var);
                let depth = self.push_closure_base(declaring);
                let field = u8::try_from(self.bindings.hoisted_field_index(var)).expect("closure record too large");
                self.builder.emit_u8_u8(Opcode::LoadClosureField, depth, field);
            }
            StorageKind::HoistedBoxed => {
                let declaring = self.bindings.declaring_lambda(var);
                let depth = self.push_closure_base(declaring);
                let field = u8::try_from(self.bindings.hoisted_field_index(var)).expect("closure record too large");
                self.builder.emit_u8_u8(Opcode::LoadClosureField, depth, field);
                self.builder.emit(Opcode::LoadCellValue);
            }
        }
    }

    /// Pushes the cell reference backing `var`, which must be `Boxed` or
    /// `HoistedBoxed` — used for a quote's free-variable capture list.
    fn push_var_cell(&mut self, var: VarId) {
        match self.bindings.kind_of(var) {
            StorageKind::Boxed => {
                let slot = self.var_slots[&var];
                self.builder.emit_load_local(slot);
            }
            StorageKind::HoistedBoxed => {
                let declaring = self.bindings.declaring_lambda(var);
                let depth = self.push_closure_base(declaring);
                let field = u8::try_from(self.bindings.hoisted_field_index(var)).expect("closure record too large");
                self.builder.emit_u8_u8(Opcode::LoadClosureField, depth, field);
            }
            other => panic!("variable captured by a quote must be boxed, found {other:?}"),
        }
    }

    /// Consumes exactly one value off the top of the stack, storing it into
    /// `var`. Net stack effect: -1, regardless of storage kind.
    fn store_var_consuming(&mut self, var: VarId) {
        let tmp = self.alloc_temp();
        self.builder.emit_store_local(tmp);
        self.builder.emit_load_local(tmp);
        match self.bindings.kind_of(var) {
            StorageKind::Argument | StorageKind::Local => {
                let slot = self.var_slots[&var];
                self.builder.emit_store_local(slot);
            }
            StorageKind::Boxed => {
                let slot = self.var_slots[&var];
                self.builder.emit_load_local(slot);
                self.builder.emit(Opcode::StoreCellValue);
                self.builder.track_stack(-2);
            }
            StorageKind::Hoisted => {
                let declaring = self.bindings.declaring_lambda(var);
                let depth = self.push_closure_base(declaring);
                let field = u8::try_from(self.bindings.hoisted_field_index(var)).expect("closure record too large");
                self.builder.emit_u8_u8(Opcode::StoreClosureField, depth, field);
                self.builder.track_stack(-2);
            }
            StorageKind::HoistedBoxed => {
                let declaring = self.bindings.declaring_lambda(var);
                let depth = self.push_closure_base(declaring);
                let field = u8::try_from(self.bindings.hoisted_field_index(var)).expect("closure record too large");
                self.builder.emit_u8_u8(Opcode::LoadClosureField, depth, field);
                self.builder.emit(Opcode::StoreCellValue);
                self.builder.track_stack(-2);
            }
        }
        self.free_temp(tmp);
    }

    fn packed_index_for(&self, var: VarId) -> PackedIndex {
        let kind = self.bindings.kind_of(var);
        let declaring = self.bindings.declaring_lambda(var);
        let depth = if declaring == self.lambda {
            0u8
        } else {
            let hops = self.hops_to_ancestor(declaring);
            if self.own_closure_slot.is_some() {
                hops + 1
            } else {
                hops
            }
        };
        let field = u16::try_from(self.bindings.hoisted_field_index(var)).expect("closure record too large");
        PackedIndex { is_cell: kind.is_boxed(), depth, field }
    }

    fn compile_expr(&mut self, node: NodeId) -> CompileResult<()> {
        self.builder.set_location(node);
        let tree = self.tree;
        match &tree.node(node).kind {
            NodeKind::Constant(cv) => match cv {
                ConstantValue::Inline(ic) => self.push_inline(ic),
                ConstantValue::Boxed(_) => {
                    let slot = self.constants.lambda(self.lambda).slot_for_constant(node).expect("missing constant slot");
                    self.load_constant_slot(slot);
                }
            },
            NodeKind::Variable(var) => self.load_var(*var),
            NodeKind::Block { vars, body } => self.compile_block(vars, body)?,
            NodeKind::Lambda { .. } => self.compile_nested_lambda(node)?,
            NodeKind::Invoke { target, args } => self.compile_invoke(node, *target, args)?,
            NodeKind::Call { callee, args } => self.compile_host_call(node, callee, args, false)?,
            NodeKind::New { callee, args } => self.compile_host_call(node, callee, args, true)?,
            NodeKind::Assign { var, value } => self.compile_assign(*var, *value)?,
            NodeKind::Binary { op, checked, lhs, rhs } => self.compile_binary(node, *op, *checked, *lhs, *rhs)?,
            NodeKind::Unary { op, operand } => self.compile_unary(*op, *operand)?,
            NodeKind::Conditional { test, then_branch, else_branch } => {
                self.compile_conditional(*test, *then_branch, *else_branch)?;
            }
            NodeKind::Loop { body } => self.compile_loop(*body)?,
            NodeKind::Label(label) => self.compile_label(*label),
            NodeKind::Goto(label) => self.compile_goto(*label),
            NodeKind::Try { body, catches, finally } => self.compile_try(*body, catches, *finally)?,
            NodeKind::Switch { value, cases, default } => self.compile_switch(*value, cases, *default)?,
            NodeKind::Quote(inner) => self.compile_quote(node, *inner),
            NodeKind::RuntimeVariables(vars) => self.compile_runtime_variables(node, vars),
            NodeKind::IncDec { var, op, prefix, void_context } => {
                self.compile_inc_dec(*var, *op, *prefix, *void_context);
            }
        }
        Ok(())
    }

    fn compile_block(&mut self, vars: &[VarId], body: &[NodeId]) -> CompileResult<()> {
        for &v in vars {
            if matches!(self.bindings.kind_of(v), StorageKind::Local | StorageKind::Boxed) {
                let slot = self.fresh_local();
                self.var_slots.insert(v, slot);
            }
            if self.bindings.kind_of(v) == StorageKind::Boxed {
                self.builder.emit(Opcode::PushNull);
                self.builder.track_stack(1);
                self.builder.emit(Opcode::NewCell);
                let slot = self.var_slots[&v];
                self.builder.emit_store_local(slot);
            }
        }
        for (i, &b) in body.iter().enumerate() {
            self.compile_expr(b)?;
            let is_last = i + 1 == body.len();
            let produces_value = self.tree.node(b).ty != Ty::Void;
            if !is_last && produces_value {
                self.builder.emit(Opcode::Pop);
                self.builder.track_stack(-1);
            }
        }
        Ok(())
    }

    fn compile_nested_lambda(&mut self, node: NodeId) -> CompileResult<()> {
        let nested_code =
            compile_one_lambda(self.tree, self.bindings, self.constants, self.spill, self.host_table.clone(), node)?;
        let nested_idx = self.builder.add_nested_lambda(nested_code);

        if self.bindings.has_outer_closure(node) {
            if let Some(slot) = self.own_closure_slot {
                self.builder.emit_load_local(slot);
            } else {
                self.builder.emit(Opcode::LoadOuterClosure);
                self.builder.track_stack(1);
            }
        } else {
            self.builder.emit(Opcode::PushNull);
            self.builder.track_stack(1);
        }
        self.builder.emit_u16(Opcode::MakeLambda, nested_idx);
        Ok(())
    }

    fn compile_invoke(&mut self, node: NodeId, target: NodeId, args: &[NodeId]) -> CompileResult<()> {
        let mut operands = vec![target];
        operands.extend_from_slice(args);
        self.compile_operands(node, &operands)?;
        let argc = u8::try_from(args.len()).expect("more than 255 arguments to a single invoke");
        self.builder.emit_u8(Opcode::InvokeLambda, argc);
        self.builder.track_stack(-(args.len() as i32 + 1) + 1);
        Ok(())
    }

    fn compile_host_call(&mut self, node: NodeId, callee: &HostHandle, args: &[NodeId], is_new: bool) -> CompileResult<()> {
        self.compile_operands(node, args)?;
        let idx = self.host_table.borrow_mut().index_of(callee);
        let argc = u8::try_from(args.len()).expect("more than 255 arguments to a single call");
        let op = if is_new { Opcode::NewHost } else { Opcode::CallHost };
        self.builder.emit_u16_u8(op, idx, argc);
        self.builder.track_stack(1 - args.len() as i32);
        Ok(())
    }

    /// Evaluates `operands` in order, spilling each to a temporary first if
    /// the Stack Spiller flagged `node`.
    fn compile_operands(&mut self, node: NodeId, operands: &[NodeId]) -> CompileResult<()> {
        if self.spill.needs_spill(node) {
            let mut temps = Vec::with_capacity(operands.len());
            for &operand in operands {
                self.compile_expr(operand)?;
                let t = self.alloc_temp();
                self.builder.emit_store_local(t);
                temps.push(t);
            }
            for &t in &temps {
                self.builder.emit_load_local(t);
            }
            for t in temps {
                self.free_temp(t);
            }
        } else {
            for &operand in operands {
                self.compile_expr(operand)?;
            }
        }
        Ok(())
    }

    fn compile_assign(&mut self, var: VarId, value: NodeId) -> CompileResult<()> {
        self.compile_expr(value)?;
        self.builder.emit(Opcode::Dup);
        self.builder.track_stack(1);
        self.store_var_consuming(var);
        Ok(())
    }

    fn compile_binary(&mut self, node: NodeId, op: BinOp, checked: bool, lhs: NodeId, rhs: NodeId) -> CompileResult<()> {
        if matches!(op, BinOp::And | BinOp::Or) {
            self.compile_expr(lhs)?;
            let jump_op = if op == BinOp::Or { Opcode::JumpIfTrueOrPop } else { Opcode::JumpIfFalseOrPop };
            let label = self.builder.emit_jump(jump_op);
            self.builder.track_stack(-1);
            self.compile_expr(rhs)?;
            self.builder.patch_jump(label);
            return Ok(());
        }

        self.compile_operands(node, &[lhs, rhs])?;
        let opcode = match (op, checked) {
            (BinOp::Add, false) => Opcode::Add,
            (BinOp::Add, true) => Opcode::AddChecked,
            (BinOp::Sub, false) => Opcode::Sub,
            (BinOp::Sub, true) => Opcode::SubChecked,
            (BinOp::Mul, false) => Opcode::Mul,
            (BinOp::Mul, true) => Opcode::MulChecked,
            (BinOp::Div, _) => Opcode::Div,
            (BinOp::Lt, _) => Opcode::CmpLt,
            (BinOp::Le, _) => Opcode::CmpLe,
            (BinOp::Gt, _) => Opcode::CmpGt,
            (BinOp::Ge, _) => Opcode::CmpGe,
            (BinOp::Eq, _) => Opcode::CmpEq,
            (BinOp::Ne, _) => Opcode::CmpNe,
            (BinOp::And | BinOp::Or, _) => unreachable!("handled above"),
        };
        self.builder.emit(opcode);
        self.builder.track_stack(-1);
        Ok(())
    }

    fn compile_unary(&mut self, op: UnOp, operand: NodeId) -> CompileResult<()> {
        self.compile_expr(operand)?;
        let opcode = match op {
            UnOp::Neg => Opcode::Neg,
            UnOp::Not => Opcode::Not,
        };
        self.builder.emit(opcode);
        Ok(())
    }

    fn compile_conditional(&mut self, test: NodeId, then_branch: NodeId, else_branch: Option<NodeId>) -> CompileResult<()> {
        self.compile_expr(test)?;
        let else_jump = self.builder.emit_jump(Opcode::JumpIfFalse);
        self.builder.track_stack(-1);
        let branch_entry_depth = self.builder.stack_depth();

        self.compile_expr(then_branch)?;
        let then_exit_depth = self.builder.stack_depth();

        if let Some(e) = else_branch {
            let end_jump = self.builder.emit_jump(Opcode::Jump);
            self.builder.patch_jump(else_jump);
            self.force_stack_depth(branch_entry_depth);
            self.compile_expr(e)?;
            self.builder.patch_jump(end_jump);
            self.force_stack_depth(then_exit_depth);
        } else {
            self.builder.patch_jump(else_jump);
        }
        Ok(())
    }

    fn compile_loop(&mut self, body: NodeId) -> CompileResult<()> {
        let start = self.builder.current_offset();
        self.compile_expr(body)?;
        self.builder.emit_jump_to(Opcode::Jump, start);
        Ok(())
    }

    fn compile_label(&mut self, label: LabelId) {
        let offset = self.builder.current_offset();
        self.label_offsets.insert(label, offset);
        let (resolved, remaining): (Vec<_>, Vec<_>) =
            self.pending_gotos.drain(..).partition(|&(_, target)| target == label);
        self.pending_gotos = remaining;
        for (jl, _) in resolved {
            self.builder.patch_jump(jl);
        }
    }

    fn compile_goto(&mut self, label: LabelId) {
        if let Some(&offset) = self.label_offsets.get(&label) {
            self.builder.emit_jump_to(Opcode::Jump, offset);
        } else {
            let jl = self.builder.emit_jump(Opcode::Jump);
            self.pending_gotos.push((jl, label));
        }
    }

    /// Compiles a `Try`/`catches`/`finally`. Catch clauses of the same `Try`
    /// are tried in order via a filter chain; an exception that matches no
    /// clause's filter (or there are no clauses) is rethrown after replaying
    /// `finally`. The protected range covers only `body` itself — a
    /// simplification documented in `DESIGN.md`: an exception raised while
    /// replaying `finally` is not separately protected by this `Try`.
    fn compile_try(&mut self, body: NodeId, catches: &[CatchClause], finally: Option<NodeId>) -> CompileResult<()> {
        let entry_depth = self.builder.stack_depth();
        let try_start = self.builder.current_offset();
        self.compile_expr(body)?;
        let try_end = self.builder.current_offset();
        let body_produces_value = self.tree.node(body).ty != Ty::Void;

        self.emit_finally_then_join(finally, body_produces_value)?;
        let mut join_jumps = vec![self.builder.emit_jump(Opcode::Jump)];

        let handler_entry = self.builder.current_offset();
        self.force_stack_depth(entry_depth);
        self.builder.track_stack(1); // the exception value the VM pushes on unwind

        let mut next_check: Option<JumpLabel> = None;
        for clause in catches {
            if let Some(label) = next_check.take() {
                self.builder.patch_jump(label);
            }
            let tmp = self.alloc_temp();
            self.builder.emit(Opcode::Dup);
            self.builder.track_stack(1);
            self.builder.emit_store_local(tmp);
            if let Some(v) = clause.var {
                self.var_slots.insert(v, tmp);
            }
            if let Some(filter) = clause.filter {
                self.compile_expr(filter)?;
                let skip = self.builder.emit_jump(Opcode::JumpIfFalse);
                self.builder.track_stack(-1);
                next_check = Some(skip);
            }
            self.builder.emit(Opcode::Pop);
            self.builder.track_stack(-1);
            let clause_produces_value = self.tree.node(clause.body).ty != Ty::Void;
            self.compile_expr(clause.body)?;
            self.emit_finally_then_join(finally, clause_produces_value)?;
            join_jumps.push(self.builder.emit_jump(Opcode::Jump));
            self.free_temp(tmp);
        }
        if let Some(label) = next_check {
            self.builder.patch_jump(label);
        }
        // No clause matched (or there were none): stash the exception across
        // a finally replay, then rethrow it.
        if let Some(f) = finally {
            let tmp = self.alloc_temp();
            self.builder.emit_store_local(tmp);
            self.compile_expr(f)?;
            if self.tree.node(f).ty != Ty::Void {
                self.builder.emit(Opcode::Pop);
                self.builder.track_stack(-1);
            }
            self.builder.emit_load_local(tmp);
            self.free_temp(tmp);
        }
        self.builder.emit(Opcode::Rethrow);

        for j in join_jumps {
            self.builder.patch_jump(j);
        }
        self.force_stack_depth(entry_depth + u16::from(body_produces_value));

        self.builder.add_exception_entry(ExceptionEntry::new(
            try_start as u32,
            try_end as u32,
            handler_entry as u32,
            entry_depth,
        ));
        Ok(())
    }

    /// After a try body or a matched catch body completes normally: if a
    /// `finally` exists, stash the just-produced value (if any) across it,
    /// run `finally`, discard its own value (if non-void), then restore.
    fn emit_finally_then_join(&mut self, finally: Option<NodeId>, value_present: bool) -> CompileResult<()> {
        let Some(f) = finally else { return Ok(()) };
        let tmp = value_present.then(|| self.alloc_temp());
        if let Some(t) = tmp {
            self.builder.emit_store_local(t);
        }
        self.compile_expr(f)?;
        if self.tree.node(f).ty != Ty::Void {
            self.builder.emit(Opcode::Pop);
            self.builder.track_stack(-1);
        }
        if let Some(t) = tmp {
            self.builder.emit_load_local(t);
            self.free_temp(t);
        }
        Ok(())
    }

    /// Uniform comparison-chain dispatch for all case counts — many-case
    /// string switches get no separate hash-dispatch lowering; see
    /// `DESIGN.md`.
    fn compile_switch(
        &mut self,
        value: NodeId,
        cases: &[(ConstantValue, NodeId)],
        default: Option<NodeId>,
    ) -> CompileResult<()> {
        self.compile_expr(value)?;
        let val_tmp = self.alloc_temp();
        self.builder.emit_store_local(val_tmp);
        let entry_depth = self.builder.stack_depth();

        let mut end_jumps = Vec::with_capacity(cases.len());
        for (case_value, body) in cases {
            self.builder.emit_load_local(val_tmp);
            self.push_constant_value(case_value);
            self.builder.emit(Opcode::CmpEq);
            self.builder.track_stack(-1);
            let skip = self.builder.emit_jump(Opcode::JumpIfFalse);
            self.builder.track_stack(-1);
            self.compile_expr(*body)?;
            end_jumps.push(self.builder.emit_jump(Opcode::Jump));
            self.builder.patch_jump(skip);
            self.force_stack_depth(entry_depth);
        }
        if let Some(d) = default {
            self.compile_expr(d)?;
        }
        for j in end_jumps {
            self.builder.patch_jump(j);
        }
        let ty_is_void = cases.first().map(|(_, b)| self.tree.node(*b).ty.clone()).unwrap_or(Ty::Void) == Ty::Void;
        self.force_stack_depth(entry_depth + u16::from(!ty_is_void));
        self.free_temp(val_tmp);
        Ok(())
    }

    fn compile_quote(&mut self, node: NodeId, _inner: NodeId) {
        let slot = self.constants.lambda(self.lambda).slot_for_quote(node);
        let template = self.constants.lambda(self.lambda).values()[slot as usize].as_quote_template().clone();
        for &v in &template.free_vars {
            self.push_var_cell(v);
        }
        let count = u8::try_from(template.free_vars.len()).expect("quote captures more than 255 free variables");
        self.builder.emit_u16_u8(Opcode::MakeQuote, slot, count);
        self.builder.track_stack(1 - count as i32);
    }

    /// The packed indices in `vars` are resolved at runtime relative to
    /// whichever closure record is this lambda's own base: its own record if
    /// it built one, otherwise the outer closure passed in to it. Pushing
    /// that base explicitly (rather than letting the VM reach for "argument
    /// 0" implicitly) keeps `MakeRuntimeVariables` a plain pop-one-push-one
    /// opcode like every other closure-consuming opcode here.
    fn compile_runtime_variables(&mut self, node: NodeId, vars: &[VarId]) {
        let indices: Vec<Value> = vars.iter().map(|&v| Value::Int(self.packed_index_for(v).pack())).collect();
        let slot = self.constants.lambda(self.lambda).slot_for_runtime_vars(node);
        self.builder.patch_const(slot, Value::Array(Rc::new(RefCell::new(indices))));
        if let Some(own) = self.own_closure_slot {
            self.builder.emit_load_local(own);
        } else {
            self.builder.emit(Opcode::LoadOuterClosure);
            self.builder.track_stack(1);
        }
        self.builder.emit_u16(Opcode::MakeRuntimeVariables, slot);
    }

    fn compile_inc_dec(&mut self, var: VarId, op: IncDecOp, prefix: bool, void_context: bool) {
        let opcode = match op {
            IncDecOp::Inc => Opcode::Add,
            IncDecOp::Dec => Opcode::Sub,
        };
        if void_context {
            self.load_var(var);
            self.builder.emit_i8(Opcode::LoadSmallInt, 1);
            self.builder.track_stack(1);
            self.builder.emit(opcode);
            self.builder.track_stack(-1);
            self.store_var_consuming(var);
        } else if prefix {
            self.load_var(var);
            self.builder.emit_i8(Opcode::LoadSmallInt, 1);
            self.builder.track_stack(1);
            self.builder.emit(opcode);
            self.builder.track_stack(-1);
            self.builder.emit(Opcode::Dup);
            self.builder.track_stack(1);
            self.store_var_consuming(var);
        } else {
            self.load_var(var);
            self.builder.emit(Opcode::Dup);
            self.builder.track_stack(1);
            self.builder.emit_i8(Opcode::LoadSmallInt, 1);
            self.builder.track_stack(1);
            self.builder.emit(opcode);
            self.builder.track_stack(-1);
            self.store_var_consuming(var);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{BinOp, Ty, TreeBuilder};
    use crate::{binder, constants, spiller};

    fn compile(tree: &Tree) -> CompileResult<Rc<Code>> {
        let bindings = binder::bind(tree)?;
        let alloc = constants::allocate(tree);
        let plan = spiller::plan(tree);
        let host_table = Rc::new(RefCell::new(HostTable::default()));
        compile_one_lambda(tree, &bindings, &alloc, &plan, host_table, tree.root)
    }

    #[test]
    fn constant_lambda_returns_immediately() {
        let mut b = TreeBuilder::new();
        let five = b.constant_int(5);
        let lambda = b.lambda(vec![], five, Ty::Int);
        let tree = b.finish(lambda);

        let code = compile(&tree).unwrap();
        assert_eq!(code.arity(), 0);
        assert!(!code.bytecode().is_empty());
        assert_eq!(*code.bytecode().last().unwrap(), Opcode::ReturnValue as u8);
    }

    #[test]
    fn argument_passthrough_loads_local_zero() {
        let mut b = TreeBuilder::new();
        let x = b.declare_var("x", Ty::Int, false);
        let x_ref = b.var_ref(x, Ty::Int);
        let lambda = b.lambda(vec![x], x_ref, Ty::Int);
        let tree = b.finish(lambda);

        let code = compile(&tree).unwrap();
        assert_eq!(code.arity(), 1);
        assert_eq!(code.bytecode()[0], Opcode::LoadLocal0 as u8);
    }

    #[test]
    fn nested_lambda_registers_its_code_and_makes_lambda() {
        let mut b = TreeBuilder::new();
        let x = b.declare_var("x", Ty::Int, false);
        let y = b.declare_var("y", Ty::Int, false);
        let x_ref = b.var_ref(x, Ty::Int);
        let y_ref = b.var_ref(y, Ty::Int);
        let sum = b.binary(BinOp::Add, false, x_ref, y_ref, Ty::Int);
        let inner = b.lambda(vec![y], sum, Ty::Int);
        let outer = b.lambda(vec![x], inner, Ty::Any);
        let tree = b.finish(outer);

        let code = compile(&tree).unwrap();
        assert_eq!(code.nested(0).arity(), 1);
        assert!(code.bytecode().iter().any(|&b| b == Opcode::MakeLambda as u8));
        assert!(code.bytecode().iter().any(|&b| b == Opcode::NewClosureRecord as u8));
    }

    #[test]
    fn unresolved_goto_is_rejected() {
        let mut b = TreeBuilder::new();
        let ghost = b.fresh_label();
        let goto = b.goto(ghost);
        let lambda = b.lambda(vec![], goto, Ty::Void);
        let tree = b.finish(lambda);

        let err = compile(&tree).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UnresolvedLabel);
    }

    #[test]
    fn switch_compiles_a_comparison_chain_per_case() {
        let mut b = TreeBuilder::new();
        let value = b.constant_int(2);
        let c1 = b.constant_int(10);
        let case1 = b.constant_int(1);
        let c2 = b.constant_int(20);
        let case2 = b.constant_int(2);
        let default = b.constant_int(0);
        let cv1 = match &b.node(case1).kind {
            NodeKind::Constant(cv) => cv.clone(),
            _ => unreachable!(),
        };
        let cv2 = match &b.node(case2).kind {
            NodeKind::Constant(cv) => cv.clone(),
            _ => unreachable!(),
        };
        let switch =
            b.push(NodeKind::Switch { value, cases: vec![(cv1, c1), (cv2, c2)], default: Some(default) }, Ty::Int);
        let lambda = b.lambda(vec![], switch, Ty::Int);
        let tree = b.finish(lambda);

        let code = compile(&tree).unwrap();
        assert!(code.bytecode().iter().filter(|&&b| b == Opcode::CmpEq as u8).count() >= 2);
    }
}
