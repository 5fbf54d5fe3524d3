//! Variable Binder: classifies every declared variable into a storage kind,
//! via two passes over the tree, with results kept entirely in side tables
//! keyed by [`VarId`] — the tree itself is never touched.

use ahash::{AHashMap, AHashSet};

use crate::error::{CompileError, CompileErrorKind, CompileResult};
use crate::tree::{CatchClause, NodeId, NodeKind, Tree, VarId};

const STACK_RED_ZONE: usize = 256 * 1024;
const STACK_GROW_BY: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKind {
    Argument,
    Local,
    Boxed,
    Hoisted,
    HoistedBoxed,
}

impl StorageKind {
    pub fn is_hoisted(self) -> bool {
        matches!(self, StorageKind::Hoisted | StorageKind::HoistedBoxed)
    }

    pub fn is_boxed(self) -> bool {
        matches!(self, StorageKind::Boxed | StorageKind::HoistedBoxed)
    }
}

/// The Variable Binder's output: one classification per variable, plus, per
/// lambda, the deterministic field order of its closure record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Bindings {
    kind: AHashMap<VarId, StorageKind>,
    decl_lambda: AHashMap<VarId, NodeId>,
    hoisted_fields: AHashMap<NodeId, Vec<VarId>>,
    has_outer_closure: AHashMap<NodeId, bool>,
    /// Enclosing lambdas of each lambda, outermost first, not including the
    /// lambda itself — the Lambda Compiler's lexical-nesting chain for
    /// computing closure-field access depth.
    ancestors: AHashMap<NodeId, Vec<NodeId>>,
}

impl Bindings {
    pub fn kind_of(&self, var: VarId) -> StorageKind {
        self.kind[&var]
    }

    pub fn declaring_lambda(&self, var: VarId) -> NodeId {
        self.decl_lambda[&var]
    }

    pub fn hoisted_fields(&self, lambda: NodeId) -> &[VarId] {
        self.hoisted_fields.get(&lambda).map_or(&[], |v| v.as_slice())
    }

    pub fn needs_closure_record(&self, lambda: NodeId) -> bool {
        !self.hoisted_fields(lambda).is_empty()
    }

    pub fn has_outer_closure(&self, lambda: NodeId) -> bool {
        self.has_outer_closure.get(&lambda).copied().unwrap_or(false)
    }

    /// Field index of `var` within its declaring lambda's closure record.
    /// The parent back-reference is carried out-of-band on
    /// [`crate::closure::ClosureRecord::parent`] rather than occupying a
    /// `fields` slot, so no offset is needed here.
    pub fn hoisted_field_index(&self, var: VarId) -> usize {
        let lambda = self.decl_lambda[&var];
        self.hoisted_fields(lambda).iter().position(|&v| v == var).expect("var not hoisted in its own lambda")
    }

    /// Enclosing lambdas of `lambda`, outermost first, not including
    /// `lambda` itself.
    pub fn ancestors(&self, lambda: NodeId) -> &[NodeId] {
        self.ancestors.get(&lambda).map_or(&[], |v| v.as_slice())
    }

    /// Builds a minimal `Bindings` for re-entrantly compiling a quote's
    /// captured sub-tree as its own lambda body (see
    /// [`crate::quote::compile_quoted`]). `lambda` is a synthetic node
    /// wrapping the quoted body; `free_vars` are classified as
    /// `HoistedBoxed` fields of a synthetic outer ancestor, so the Lambda
    /// Compiler reads them through `LoadOuterClosure` exactly as it would
    /// any outer-hoisted variable — the outer record handed to the
    /// synthetic lambda at invocation time is built directly from the
    /// quote's already-live cells, never freshly allocated.
    pub(crate) fn for_quote(lambda: NodeId, outer: NodeId, free_vars: &[VarId]) -> Self {
        let mut kind = AHashMap::new();
        let mut decl_lambda = AHashMap::new();
        for &v in free_vars {
            kind.insert(v, StorageKind::HoistedBoxed);
            decl_lambda.insert(v, outer);
        }
        let mut hoisted_fields = AHashMap::new();
        hoisted_fields.insert(outer, free_vars.to_vec());
        let mut has_outer_closure = AHashMap::new();
        has_outer_closure.insert(lambda, true);
        let mut ancestors = AHashMap::new();
        ancestors.insert(lambda, vec![outer]);
        Self { kind, decl_lambda, hoisted_fields, has_outer_closure, ancestors }
    }
}

#[derive(Default)]
struct Collector {
    uses: AHashMap<VarId, AHashSet<NodeId>>,
    quote_referenced: AHashSet<VarId>,
    runtime_referenced: AHashSet<VarId>,
    decl_lambda: AHashMap<VarId, NodeId>,
    param_vars: AHashSet<VarId>,
    declared_vars: Vec<VarId>,
}

pub fn bind(tree: &Tree) -> CompileResult<Bindings> {
    let mut collector = Collector::default();
    let root_ctx = tree.root;
    stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_BY, || collect(tree, tree.root, root_ctx, &mut collector))?;

    let mut kind = AHashMap::new();
    let mut hoisted_fields: AHashMap<NodeId, Vec<VarId>> = AHashMap::new();
    for &var in &collector.declared_vars {
        let lambda = collector.decl_lambda[&var];
        let used_elsewhere = collector.uses.get(&var).is_some_and(|set| set.iter().any(|&ctx| ctx != lambda));
        let runtime_ref = collector.runtime_referenced.contains(&var);
        let quote_ref = collector.quote_referenced.contains(&var);
        let would_hoist = used_elsewhere || runtime_ref;

        let k = if quote_ref {
            if would_hoist {
                StorageKind::HoistedBoxed
            } else {
                StorageKind::Boxed
            }
        } else if would_hoist {
            StorageKind::Hoisted
        } else if collector.param_vars.contains(&var) {
            StorageKind::Argument
        } else {
            StorageKind::Local
        };

        if k.is_hoisted() {
            hoisted_fields.entry(lambda).or_default().push(var);
        }
        kind.insert(var, k);
    }

    let mut ancestors = AHashMap::new();
    compute_ancestors(tree, tree.root, &mut Vec::new(), &mut ancestors);

    let mut has_outer_closure = AHashMap::new();
    mark_outer_closures(tree, &collector.decl_lambda, &hoisted_fields, &ancestors, &mut has_outer_closure);

    Ok(Bindings { kind, decl_lambda: collector.decl_lambda, hoisted_fields, has_outer_closure, ancestors })
}

/// A lambda needs a reference to its immediately enclosing lambda's closure
/// record iff it (or something nested inside it) reads a variable hoisted by
/// a strict ancestor lambda.
fn mark_outer_closures(
    tree: &Tree,
    decl_lambda: &AHashMap<VarId, NodeId>,
    hoisted_fields: &AHashMap<NodeId, Vec<VarId>>,
    ancestors_of: &AHashMap<NodeId, Vec<NodeId>>,
    out: &mut AHashMap<NodeId, bool>,
) {
    let mut stack = vec![tree.root];
    while let Some(node) = stack.pop() {
        if let NodeKind::Lambda { .. } = &tree.node(node).kind {
            let ancestors = ancestors_of.get(&node).cloned().unwrap_or_default();
            let needs_outer = hoisted_fields.iter().any(|(owner, fields)| {
                ancestors.contains(owner) && fields.iter().any(|v| decl_lambda.get(v) == Some(owner))
            });
            out.insert(node, needs_outer);
        }
        stack.extend(tree.children(node));
    }
}

fn compute_ancestors(tree: &Tree, node: NodeId, stack: &mut Vec<NodeId>, out: &mut AHashMap<NodeId, Vec<NodeId>>) {
    let is_lambda = matches!(tree.node(node).kind, NodeKind::Lambda { .. });
    if is_lambda {
        out.insert(node, stack.clone());
        stack.push(node);
    }
    for child in tree.children(node) {
        compute_ancestors(tree, child, stack, out);
    }
    if is_lambda {
        stack.pop();
    }
}

fn collect(tree: &Tree, node: NodeId, ctx: NodeId, c: &mut Collector) -> CompileResult<()> {
    match &tree.node(node).kind {
        NodeKind::Variable(v) => {
            c.uses.entry(*v).or_default().insert(ctx);
            if !c.decl_lambda.contains_key(v) {
                return Err(CompileError::new(
                    CompileErrorKind::UnboundVariable,
                    node,
                    "variable referenced before any declaring scope bound it",
                ));
            }
        }
        NodeKind::Lambda { params, body, .. } => {
            for &p in params {
                c.decl_lambda.insert(p, node);
                c.param_vars.insert(p);
                c.declared_vars.push(p);
            }
            collect(tree, *body, node, c)?;
        }
        NodeKind::Block { vars, body } => {
            for &v in vars {
                c.decl_lambda.insert(v, ctx);
                c.declared_vars.push(v);
            }
            for &b in body {
                collect(tree, b, ctx, c)?;
            }
        }
        NodeKind::Try { body, catches, finally } => {
            collect(tree, *body, ctx, c)?;
            for clause in catches {
                bind_catch(tree, clause, ctx, c)?;
            }
            if let Some(f) = finally {
                collect(tree, *f, ctx, c)?;
            }
        }
        NodeKind::Quote(inner) => {
            let mut bound = AHashSet::new();
            let mut free = AHashSet::new();
            collect_declared_within(tree, *inner, &mut bound);
            collect_free_vars(tree, *inner, &bound, &mut free);
            for v in free {
                c.quote_referenced.insert(v);
            }
            collect(tree, *inner, ctx, c)?;
        }
        NodeKind::RuntimeVariables(vars) => {
            for &v in vars {
                c.runtime_referenced.insert(v);
                c.uses.entry(v).or_default().insert(ctx);
                if !c.decl_lambda.contains_key(&v) {
                    return Err(CompileError::new(
                        CompileErrorKind::UnboundVariable,
                        node,
                        "runtime-variables node lists a variable with no declaring scope",
                    ));
                }
            }
        }
        NodeKind::IncDec { var, .. } => {
            c.uses.entry(*var).or_default().insert(ctx);
        }
        NodeKind::Assign { var, value } => {
            c.uses.entry(*var).or_default().insert(ctx);
            collect(tree, *value, ctx, c)?;
        }
        _ => {
            for child in tree.children(node) {
                stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_BY, || collect(tree, child, ctx, c))?;
            }
        }
    }
    Ok(())
}

fn bind_catch(tree: &Tree, clause: &CatchClause, ctx: NodeId, c: &mut Collector) -> CompileResult<()> {
    if let Some(v) = clause.var {
        c.decl_lambda.insert(v, ctx);
        c.declared_vars.push(v);
    }
    if let Some(filter) = clause.filter {
        let mut used = AHashSet::new();
        collect_free_vars(tree, filter, &AHashSet::new(), &mut used);
        for v in &used {
            if Some(*v) != clause.var && !c.decl_lambda.contains_key(v) {
                return Err(CompileError::new(
                    CompileErrorKind::UndeclaredCatchFilterVariable,
                    filter,
                    "catch filter references a variable not declared in that catch or an outer scope",
                ));
            }
        }
        collect(tree, filter, ctx, c)?;
    }
    collect(tree, clause.body, ctx, c)
}

/// Variables declared by nodes within `node`'s own subtree (used to compute
/// a quote's *free* variables: uses that are not locally bound).
fn collect_declared_within(tree: &Tree, node: NodeId, out: &mut AHashSet<VarId>) {
    match &tree.node(node).kind {
        NodeKind::Lambda { params, body, .. } => {
            out.extend(params.iter().copied());
            collect_declared_within(tree, *body, out);
        }
        NodeKind::Block { vars, body } => {
            out.extend(vars.iter().copied());
            for &b in body {
                collect_declared_within(tree, b, out);
            }
        }
        NodeKind::Try { body, catches, finally } => {
            collect_declared_within(tree, *body, out);
            for clause in catches {
                if let Some(v) = clause.var {
                    out.insert(v);
                }
                if let Some(f) = clause.filter {
                    collect_declared_within(tree, f, out);
                }
                collect_declared_within(tree, clause.body, out);
            }
            if let Some(f) = finally {
                collect_declared_within(tree, *f, out);
            }
        }
        _ => {
            for child in tree.children(node) {
                collect_declared_within(tree, child, out);
            }
        }
    }
}

fn collect_free_vars(tree: &Tree, node: NodeId, bound: &AHashSet<VarId>, out: &mut AHashSet<VarId>) {
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
            collect_free_vars(tree, *value, bound, out);
        }
        NodeKind::IncDec { var, .. } => {
            if !bound.contains(var) {
                out.insert(*var);
            }
        }
        NodeKind::RuntimeVariables(vars) => {
            for v in vars {
                if !bound.contains(v) {
                    out.insert(*v);
                }
            }
        }
        _ => {
            for child in tree.children(node) {
                collect_free_vars(tree, child, bound, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::Ty;

    #[test]
    fn unused_local_is_local() {
        let mut b = crate::tree::TreeBuilder::new();
        let x = b.declare_var("x", Ty::Int, false);
        let lit = b.constant_int(1);
        let assign = b.assign(x, lit);
        let reload = b.var_ref(x, Ty::Int);
        let block = b.block(vec![x], vec![assign, reload]);
        let lambda = b.lambda(vec![], block, Ty::Int);
        let tree = b.finish(lambda);

        let bindings = bind(&tree).unwrap();
        assert_eq!(bindings.kind_of(x), StorageKind::Local);
    }

    #[test]
    fn captured_by_nested_lambda_is_hoisted() {
        let mut b = crate::tree::TreeBuilder::new();
        let x = b.declare_var("x", Ty::Int, false);
        let y = b.declare_var("y", Ty::Int, false);
        let x_ref = b.var_ref(x, Ty::Int);
        let y_ref = b.var_ref(y, Ty::Int);
        let sum = b.binary(crate::tree::BinOp::Add, false, x_ref, y_ref, Ty::Int);
        let inner = b.lambda(vec![y], sum, Ty::Int);
        let outer = b.lambda(vec![x], inner, Ty::Any);
        let tree = b.finish(outer);

        let bindings = bind(&tree).unwrap();
        assert_eq!(bindings.kind_of(x), StorageKind::Hoisted);
        assert_eq!(bindings.kind_of(y), StorageKind::Argument);
        assert!(bindings.needs_closure_record(outer));
    }

    #[test]
    fn quote_referenced_var_is_boxed() {
        let mut b = crate::tree::TreeBuilder::new();
        let x = b.declare_var("x", Ty::Int, false);
        let x_ref = b.var_ref(x, Ty::Int);
        let quoted = b.quote(x_ref);
        let lambda = b.lambda(vec![x], quoted, Ty::Any);
        let tree = b.finish(lambda);

        let bindings = bind(&tree).unwrap();
        assert_eq!(bindings.kind_of(x), StorageKind::Boxed);
    }

    #[test]
    fn classification_is_idempotent() {
        let mut b = crate::tree::TreeBuilder::new();
        let x = b.declare_var("x", Ty::Int, false);
        let y = b.declare_var("y", Ty::Int, false);
        let x_ref = b.var_ref(x, Ty::Int);
        let y_ref = b.var_ref(y, Ty::Int);
        let sum = b.binary(crate::tree::BinOp::Add, false, x_ref, y_ref, Ty::Int);
        let inner = b.lambda(vec![y], sum, Ty::Int);
        let outer = b.lambda(vec![x], inner, Ty::Any);
        let tree = b.finish(outer);

        let first = bind(&tree).unwrap();
        let second = bind(&tree).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn undeclared_catch_filter_variable_is_rejected() {
        let mut b = crate::tree::TreeBuilder::new();
        // Declared in the var arena (so `var_ref` is well-typed) but never
        // bound by any Block/Lambda/Catch in the tree.
        let ghost = b.declare_var("ghost", Ty::Bool, false);
        let filter = b.var_ref(ghost, Ty::Bool);
        let body = b.constant_int(0);
        let clause = CatchClause { var: None, filter: Some(filter), body };
        let tryn = b.try_(body, vec![clause], None);
        let lambda = b.lambda(vec![], tryn, Ty::Int);
        let tree = b.finish(lambda);

        let err = bind(&tree).unwrap_err();
        assert_eq!(err.kind, CompileErrorKind::UndeclaredCatchFilterVariable);
    }
}
