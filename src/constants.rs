//! Constant Allocator: walks the tree collecting every live value that
//! cannot be materialized inline, recording per lambda the ordered
//! bound-constants pool and a reference count per slot (feeding the Lambda
//! Compiler's ">2 reads -> cache in a local" heuristic).
//!
//! Auxiliary slots whose value depends on the Variable Binder (the
//! runtime-variables packed index table) are reserved here as unfilled
//! blanks and patched by the Lambda Compiler once binder output is
//! available.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::{AHashMap, AHashSet};

use crate::quote::QuoteTemplate;
use crate::tree::{BoxedConst, BoxedPayload, ConstantValue, InlineConst, NodeId, NodeKind, Tree, VarId};
use crate::value::Value;

const STACK_RED_ZONE: usize = 256 * 1024;
const STACK_GROW_BY: usize = 4 * 1024 * 1024;

#[derive(Debug, Default)]
pub struct LambdaConstants {
    pool_values: Vec<Value>,
    ref_counts: Vec<u32>,
    by_identity: AHashMap<usize, u16>,
    tree_constant_slot: AHashMap<NodeId, u16>,
    quote_slot: AHashMap<NodeId, u16>,
    runtime_vars_slot: AHashMap<NodeId, u16>,
}

impl LambdaConstants {
    fn intern(&mut self, value: Value, identity: Option<usize>) -> u16 {
        if let Some(key) = identity {
            if let Some(&slot) = self.by_identity.get(&key) {
                self.ref_counts[slot as usize] += 1;
                return slot;
            }
        }
        let slot = u16::try_from(self.pool_values.len()).expect("lambda has more than 65535 bound constants");
        self.pool_values.push(value);
        self.ref_counts.push(1);
        if let Some(key) = identity {
            self.by_identity.insert(key, slot);
        }
        slot
    }

    /// Reserves a slot with a placeholder value, to be overwritten later via
    /// [`LambdaConstants::patch`].
    fn reserve(&mut self) -> u16 {
        let slot = u16::try_from(self.pool_values.len()).expect("lambda has more than 65535 bound constants");
        self.pool_values.push(Value::Null);
        self.ref_counts.push(1);
        slot
    }

    pub fn patch(&mut self, slot: u16, value: Value) {
        self.pool_values[slot as usize] = value;
    }

    pub fn slot_for_constant(&self, node: NodeId) -> Option<u16> {
        self.tree_constant_slot.get(&node).copied()
    }

    pub fn slot_for_quote(&self, node: NodeId) -> u16 {
        self.quote_slot[&node]
    }

    pub fn slot_for_runtime_vars(&self, node: NodeId) -> u16 {
        self.runtime_vars_slot[&node]
    }

    pub fn ref_count(&self, slot: u16) -> u32 {
        self.ref_counts[slot as usize]
    }

    pub fn len(&self) -> usize {
        self.pool_values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool_values.is_empty()
    }

    pub fn into_values(self) -> Vec<Value> {
        self.pool_values
    }

    pub fn values(&self) -> &[Value] {
        &self.pool_values
    }
}

#[derive(Debug, Default)]
pub struct ConstantAllocation {
    per_lambda: AHashMap<NodeId, LambdaConstants>,
}

impl ConstantAllocation {
    pub fn lambda(&self, id: NodeId) -> &LambdaConstants {
        &self.per_lambda[&id]
    }

    pub fn lambda_mut(&mut self, id: NodeId) -> &mut LambdaConstants {
        self.per_lambda.get_mut(&id).expect("lambda not seen during constant allocation")
    }
}

pub fn allocate(tree: &Tree) -> ConstantAllocation {
    let mut out = ConstantAllocation::default();
    out.per_lambda.insert(tree.root, LambdaConstants::default());
    stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_BY, || walk(tree, tree.root, tree.root, &mut out));
    out
}

fn walk(tree: &Tree, node: NodeId, lambda: NodeId, out: &mut ConstantAllocation) {
    match &tree.node(node).kind {
        NodeKind::Lambda { params: _, body, .. } => {
            out.per_lambda.entry(node).or_default();
            stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_BY, || walk(tree, *body, node, out));
            return;
        }
        NodeKind::Constant(cv) => {
            if !cv.is_inline() {
                let ConstantValue::Boxed(boxed) = cv else { unreachable!() };
                let value = value_of_boxed(boxed);
                let identity = cv.identity();
                let slot = out.lambda_mut(lambda).intern(value, identity);
                out.lambda_mut(lambda).tree_constant_slot.insert(node, slot);
            }
        }
        NodeKind::Quote(inner) => {
            let mut bound = AHashSet::new();
            let mut free = AHashSet::new();
            super_collect_declared_within(tree, *inner, &mut bound);
            super_collect_free_vars(tree, *inner, &bound, &mut free);
            let mut free_vars: Vec<VarId> = free.into_iter().collect();
            free_vars.sort_by_key(|v| v.0);
            let template = Rc::new(QuoteTemplate { node: *inner, free_vars });
            let slot = out.lambda_mut(lambda).intern(Value::QuoteTemplate(template), None);
            out.lambda_mut(lambda).quote_slot.insert(node, slot);
            walk(tree, *inner, lambda, out);
            return;
        }
        NodeKind::RuntimeVariables(_) => {
            let slot = out.lambda_mut(lambda).reserve();
            out.lambda_mut(lambda).runtime_vars_slot.insert(node, slot);
        }
        _ => {}
    }
    for child in tree.children(node) {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_BY, || walk(tree, child, lambda, out));
    }
}

pub(crate) fn value_of_constant(cv: &ConstantValue) -> Value {
    match cv {
        ConstantValue::Inline(InlineConst::Null) => Value::Null,
        ConstantValue::Inline(InlineConst::Bool(b)) => Value::Bool(*b),
        ConstantValue::Inline(InlineConst::Int(n)) => Value::Int(*n),
        ConstantValue::Boxed(bc) => value_of_boxed(bc),
    }
}

fn value_of_boxed(bc: &BoxedConst) -> Value {
    match &bc.payload {
        BoxedPayload::Int(n) => Value::Int(*n),
        BoxedPayload::Str(s) => Value::Str(Rc::from(s.as_str())),
        BoxedPayload::Array(items) => {
            Value::Array(Rc::new(RefCell::new(items.iter().map(value_of_constant).collect())))
        }
        BoxedPayload::Host(s) => Value::Str(Rc::from(s.as_str())),
    }
}

// Duplicated (rather than shared with `binder`) deliberately: the allocator
// must be runnable before or independent of binder output, keeping the two
// stages bottom-up and isolated — sharing a helper would couple their
// internals together.
fn super_collect_declared_within(tree: &Tree, node: NodeId, out: &mut AHashSet<VarId>) {
    match &tree.node(node).kind {
        NodeKind::Lambda { params, body, .. } => {
            out.extend(params.iter().copied());
            super_collect_declared_within(tree, *body, out);
        }
        NodeKind::Block { vars, body } => {
            out.extend(vars.iter().copied());
            for &b in body {
                super_collect_declared_within(tree, b, out);
            }
        }
        NodeKind::Try { body, catches, finally } => {
            super_collect_declared_within(tree, *body, out);
            for clause in catches {
                if let Some(v) = clause.var {
                    out.insert(v);
                }
                if let Some(f) = clause.filter {
                    super_collect_declared_within(tree, f, out);
                }
                super_collect_declared_within(tree, clause.body, out);
            }
            if let Some(f) = finally {
                super_collect_declared_within(tree, *f, out);
            }
        }
        _ => {
            for child in tree.children(node) {
                super_collect_declared_within(tree, child, out);
            }
        }
    }
}

fn super_collect_free_vars(tree: &Tree, node: NodeId, bound: &AHashSet<VarId>, out: &mut AHashSet<VarId>) {
    match &tree.node(node).kind {
        NodeKind::Variable(v) => {
            if !bound.contains(v) {
                out.insert(*v);
            }
        }
        NodeKind::Assign { var, value } => {
            if !bound.contains(var) {
                out.insert(*var);
            }
            super_collect_free_vars(tree, *value, bound, out);
        }
        NodeKind::IncDec { var, .. } => {
            if !bound.contains(var) {
                out.insert(*var);
            }
        }
        _ => {
            for child in tree.children(node) {
                super_collect_free_vars(tree, child, bound, out);
            }
        }
    }
}
