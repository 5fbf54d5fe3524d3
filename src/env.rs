//! Environment & Delegate Builder: wraps a compiled lambda's code with its
//! live bound-constants and closure state and exposes the single entry
//! point, `compile`, the rest of this crate's core exists to serve.

use std::rc::Rc;

use crate::binder::{self, Bindings};
use crate::bytecode::code::Code;
use crate::bytecode::compiler::{self, HostTable};
use crate::bytecode::vm;
use crate::closure::ClosureRecord;
use crate::constants;
use crate::error::{CompileError, CompileErrorKind, CompileResult, RuntimeResult};
use crate::quote::QuotedTree;
use crate::spiller;
use crate::tree::{HostHandle, NodeId, Ty, Tree};
use crate::value::Value;

/// Limits the emitter substrate enforces, constructor-injected rather than
/// read from a config file — this core has no file-based configuration
/// surface.
#[derive(Debug, Clone, Copy)]
pub struct CompileLimits {
    /// Bound-constants slots a single lambda may allocate before compilation
    /// fails with [`CompileErrorKind::ConstantOverflow`].
    pub max_bound_constants: u16,
    /// Closure arity at or below which the pre-generated record family is
    /// used; see [`crate::closure::PREGENERATED_MAX_ARITY`].
    pub max_pregenerated_closure_arity: usize,
}

impl Default for CompileLimits {
    fn default() -> Self {
        Self { max_bound_constants: u16::MAX, max_pregenerated_closure_arity: crate::closure::PREGENERATED_MAX_ARITY }
    }
}

/// Host functions a compiled lambda's `Call`/`New` nodes resolve against at
/// runtime. The core never inspects a handle's name itself — it is opaque,
/// threaded through from the tree to here.
pub trait HostFunctions {
    fn call(&self, handle: &HostHandle, args: &[Value]) -> RuntimeResult<Value>;
    fn construct(&self, handle: &HostHandle, args: &[Value]) -> RuntimeResult<Value>;
}

/// The `(Constants, Locals)` environment pair bundled with its generated
/// code: a ready-to-invoke compiled lambda.
#[derive(Debug)]
pub struct CompiledLambda {
    pub(crate) tree: Rc<Tree>,
    pub(crate) code: Rc<Code>,
    pub(crate) captured_env: Option<Rc<ClosureRecord>>,
    pub(crate) host_table: Rc<Vec<HostHandle>>,
}

impl CompiledLambda {
    pub fn invoke(&self, args: &[Value], host: &dyn HostFunctions) -> RuntimeResult<Value> {
        vm::invoke(self, args, host)
    }

    pub fn arity(&self) -> usize {
        self.code.arity()
    }

    pub fn code(&self) -> &Rc<Code> {
        &self.code
    }
}

/// Compiles `tree`'s root lambda with default limits.
pub fn compile(tree: Rc<Tree>) -> CompileResult<Rc<CompiledLambda>> {
    compile_with_limits(tree, CompileLimits::default())
}

pub fn compile_with_limits(tree: Rc<Tree>, limits: CompileLimits) -> CompileResult<Rc<CompiledLambda>> {
    let bindings = binder::bind(&tree)?;
    let constants = constants::allocate(&tree);
    check_constant_limits(&tree, &constants, limits, tree.root)?;
    let spill = spiller::plan(&tree);
    let host_table = Rc::new(std::cell::RefCell::new(HostTable::default()));

    let code = compiler::compile_one_lambda(&tree, &bindings, &constants, &spill, host_table.clone(), tree.root)?;

    let host_table = Rc::new(Rc::try_unwrap(host_table).expect("no outstanding host table references after compilation").into_inner().into_vec());

    Ok(Rc::new(CompiledLambda { tree, code, captured_env: None, host_table }))
}

fn check_constant_limits(
    tree: &Tree,
    constants: &constants::ConstantAllocation,
    limits: CompileLimits,
    lambda: NodeId,
) -> CompileResult<()> {
    let lc = constants.lambda(lambda);
    if lc.len() > limits.max_bound_constants as usize {
        return Err(CompileError::new(
            CompileErrorKind::ConstantOverflow,
            lambda,
            "lambda's bound-constants pool exceeds the configured limit",
        ));
    }
    if let crate::tree::NodeKind::Lambda { body, .. } = &tree.node(lambda).kind {
        for_each_nested_lambda(tree, *body, &mut |nested| {
            check_constant_limits(tree, constants, limits, nested)
        })?;
    }
    Ok(())
}

fn for_each_nested_lambda(
    tree: &Tree,
    node: NodeId,
    f: &mut impl FnMut(NodeId) -> CompileResult<()>,
) -> CompileResult<()> {
    if matches!(tree.node(node).kind, crate::tree::NodeKind::Lambda { .. }) {
        f(node)?;
    }
    for child in tree.children(node) {
        for_each_nested_lambda(tree, child, f)?;
    }
    Ok(())
}

/// Re-entrantly compiles a quote's captured sub-tree as an independent
/// lambda whose free variables are read through the outer-closure path,
/// bound at invocation time to the cells the quote already carries (see
/// [`crate::binder::Bindings::for_quote`] and
/// [`crate::tree::Tree::with_synthetic_lambda`]).
pub(crate) fn compile_quoted(quoted: &QuotedTree) -> CompileResult<Rc<CompiledLambda>> {
    let (synthetic_tree, lambda) = quoted.tree.with_synthetic_lambda(quoted.node(), Ty::Any);
    let outer = NodeId(synthetic_tree.node_count() as u32);
    let bindings = Bindings::for_quote(lambda, outer, &quoted.template.free_vars);
    let constants = constants::allocate(&synthetic_tree);
    let spill = spiller::plan(&synthetic_tree);
    let host_table = Rc::new(std::cell::RefCell::new(HostTable::default()));

    let code =
        compiler::compile_one_lambda(&synthetic_tree, &bindings, &constants, &spill, host_table.clone(), lambda)?;
    let host_table = Rc::new(Rc::try_unwrap(host_table).expect("no outstanding host table references after compilation").into_inner().into_vec());

    let fields: Vec<Value> =
        quoted.template.free_vars.iter().map(|v| Value::Cell(quoted.cell(*v).expect("free var missing its cell").clone())).collect();
    let captured_env = Some(ClosureRecord::new(None, fields));

    Ok(Rc::new(CompiledLambda { tree: Rc::new(synthetic_tree), code, captured_env, host_table }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{BinOp, TreeBuilder};
    use crate::value::Value;

    struct NoHost;
    impl HostFunctions for NoHost {
        fn call(&self, handle: &HostHandle, _args: &[Value]) -> RuntimeResult<Value> {
            panic!("unexpected host call: {handle:?}")
        }
        fn construct(&self, handle: &HostHandle, _args: &[Value]) -> RuntimeResult<Value> {
            panic!("unexpected host construct: {handle:?}")
        }
    }

    #[test]
    fn deep_right_leaning_addition_tree_does_not_overflow() {
        let mut b = TreeBuilder::new();
        let mut acc = b.constant_int(0);
        for _ in 0..10_000 {
            let one = b.constant_int(1);
            acc = b.binary(BinOp::Add, false, acc, one, Ty::Int);
        }
        let lambda = b.lambda(vec![], acc, Ty::Int);
        let tree = Rc::new(b.finish(lambda));

        let compiled = compile(tree).unwrap();
        let result = compiled.invoke(&[], &NoHost).unwrap();
        assert_eq!(result.as_int(), 10_000);
    }

    #[test]
    fn nested_closure_adds_captured_argument() {
        let mut b = TreeBuilder::new();
        let x = b.declare_var("x", Ty::Int, false);
        let y = b.declare_var("y", Ty::Int, false);
        let x_ref = b.var_ref(x, Ty::Int);
        let y_ref = b.var_ref(y, Ty::Int);
        let sum = b.binary(BinOp::Add, false, x_ref, y_ref, Ty::Int);
        let inner = b.lambda(vec![y], sum, Ty::Int);
        let outer = b.lambda(vec![x], inner, Ty::Any);
        let tree = Rc::new(b.finish(outer));

        let compiled = compile(tree).unwrap();
        let inner_value = compiled.invoke(&[Value::Int(1)], &NoHost).unwrap();
        let inner_lambda = match inner_value {
            Value::Lambda(l) => l,
            other => panic!("expected a lambda value, found {other:?}"),
        };
        assert_eq!(inner_lambda.invoke(&[Value::Int(2)], &NoHost).unwrap().as_int(), 3);
        assert_eq!(inner_lambda.invoke(&[Value::Int(3)], &NoHost).unwrap().as_int(), 4);
    }
}
