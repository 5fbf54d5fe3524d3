//! The expression tree: an immutable, arena-backed tagged sum.
//!
//! Nodes never hold child pointers directly; they hold [`NodeId`]s into the
//! owning [`Tree`]'s arena. Variable identity works the same way: a
//! declaration site is assigned a [`VarId`] once, and every reference to that
//! variable anywhere in the tree carries the same `VarId` rather than a name.
//! This is the arena analog of identity-by-node rather than identity-by-name.

use std::rc::Rc;

/// An index into a [`Tree`]'s node arena. Never reused across trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct NodeId(pub(crate) u32);

/// An index into a [`Tree`]'s variable arena — the stand-in for "node
/// identity" for a declared variable, since a declaration is itself a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct VarId(pub(crate) u32);

/// An index naming a jump target. Scoped to a single lambda.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct LabelId(pub u32);

/// The small closed type system the compiler reasons about.
///
/// Reflection/host types beyond this set are represented as [`Ty::Any`] and
/// are opaque to the core — resolving what an `Any` actually holds is the
/// host's job; reflection-binding is treated as an external collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum Ty {
    Void,
    Bool,
    Int,
    Str,
    Array(Box<Ty>),
    Any,
}

/// A non-pooled constant: cheap enough that the emitter materializes it with
/// a direct opcode rather than reading it from the bound-constants record.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum InlineConst {
    Null,
    Bool(bool),
    /// Inline only when it fits the emitter's immediate-load opcodes; see
    /// [`InlineConst::fits_inline`].
    Int(i64),
}

impl InlineConst {
    /// Mirrors the emitter's fast-path immediate range (analogous to a
    /// one-byte `ldc.i4.s` operand): literals outside this range still go
    /// through the bound-constants pool even though they're still `i64`
    /// values, because the emitter has no direct opcode for them.
    pub fn fits_inline(n: i64) -> bool {
        (-128..=127).contains(&n)
    }
}

/// A pooled constant. Identity is by `Rc` pointer — two `Rc`s pointing at the
/// same allocation are the "same object" and get one bound-constants slot;
/// two `Rc`s with equal contents but distinct allocations do not.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BoxedConst {
    pub ty: Ty,
    pub payload: BoxedPayload,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum BoxedPayload {
    Int(i64),
    Str(String),
    Array(Vec<ConstantValue>),
    /// An opaque host handle (reflection handle, call-site object, ...): the
    /// core never inspects the string, it only carries it through to the
    /// environment for the host to interpret.
    Host(String),
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum ConstantValue {
    Inline(InlineConst),
    Boxed(Rc<BoxedConst>),
}

impl ConstantValue {
    pub fn is_inline(&self) -> bool {
        matches!(self, ConstantValue::Inline(_))
    }

    /// Reference-equality identity key used by the constant allocator's
    /// dedup table. `None` for inline constants, which are never pooled.
    pub fn identity(&self) -> Option<usize> {
        match self {
            ConstantValue::Inline(_) => None,
            ConstantValue::Boxed(rc) => Some(Rc::as_ptr(rc) as usize),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum IncDecOp {
    Inc,
    Dec,
}

/// An opaque handle to a host-provided function or constructor. Resolution
/// (what `name` actually calls) is the host's responsibility; the core only
/// threads the handle through to a `Call`/`New` opcode.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct HostHandle {
    pub name: Rc<str>,
    pub arity: usize,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct CatchClause {
    /// The variable the caught exception is bound to, if any.
    pub var: Option<VarId>,
    /// Filter expression; must reference only `var` and outer-scope
    /// variables — see [`crate::binder`]'s rejection rule.
    pub filter: Option<NodeId>,
    pub body: NodeId,
}

/// The tagged sum of node kinds — a small, total switch in place of open
/// polymorphism, so every traversal reduces to a `match` on kind.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum NodeKind {
    Constant(ConstantValue),
    /// A reference to a variable declared elsewhere in the tree.
    Variable(VarId),
    /// A new lexical scope. `vars` are declared here (in declaration order);
    /// `body` is evaluated in order and the block's value is its last
    /// element's value (`Ty::Void` if empty).
    Block { vars: Vec<VarId>, body: Vec<NodeId> },
    /// `params` are bound on entry; argument 0 (the environment) is implicit
    /// and never appears here.
    Lambda { params: Vec<VarId>, body: NodeId, ret_ty: Ty },
    /// Invocation of a lambda value (may be inlined by the compiler when the
    /// target is a literal `Lambda` node).
    Invoke { target: NodeId, args: Vec<NodeId> },
    Call { callee: HostHandle, args: Vec<NodeId> },
    New { callee: HostHandle, args: Vec<NodeId> },
    Assign { var: VarId, value: NodeId },
    Binary { op: BinOp, checked: bool, lhs: NodeId, rhs: NodeId },
    Unary { op: UnOp, operand: NodeId },
    Conditional { test: NodeId, then_branch: NodeId, else_branch: Option<NodeId> },
    /// An unconditional loop; `break`/`continue` are expressed as `Goto`s to
    /// labels the surrounding tree supplies.
    Loop { body: NodeId },
    Label(LabelId),
    Goto(LabelId),
    Try { body: NodeId, catches: Vec<CatchClause>, finally: Option<NodeId> },
    /// `cases` are matched in order against `value`; `default` runs if none
    /// match. String-keyed switches with enough cases are lowered to a
    /// hash-table dispatch by the Lambda Compiler; fewer, to a comparison
    /// chain.
    Switch { value: NodeId, cases: Vec<(ConstantValue, NodeId)>, default: Option<NodeId> },
    /// `operand` is reified at runtime into a [`crate::quote::QuotedTree`]
    /// with its free variables re-bound to shared cells.
    Quote(NodeId),
    /// Exposes the listed variables as an indexable runtime-variables
    /// handle, in the given order.
    RuntimeVariables(Vec<VarId>),
    /// `void_context = true` elides the load of the pre-mutation (or
    /// post-mutation) value — see the Lambda Compiler's statement-expression
    /// handling.
    IncDec { var: VarId, op: IncDecOp, prefix: bool, void_context: bool },
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct NodeData {
    pub kind: NodeKind,
    pub ty: Ty,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct VarData {
    pub name: Rc<str>,
    pub ty: Ty,
    pub by_ref: bool,
}

/// An immutable, arena-backed lambda tree. Once built, never mutated —
/// analyses attach to it via side tables keyed by [`NodeId`]/[`VarId`],
/// never by editing a `NodeData` in place.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct Tree {
    nodes: Vec<NodeData>,
    vars: Vec<VarData>,
    next_label: u32,
    pub root: NodeId,
}

impl Tree {
    pub fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0 as usize]
    }

    pub fn var(&self, id: VarId) -> &VarData {
        &self.vars[id.0 as usize]
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn var_count(&self) -> usize {
        self.vars.len()
    }

    pub fn fresh_label_count(&self) -> u32 {
        self.next_label
    }

    /// Appends a synthetic zero-parameter `Lambda` node wrapping `body`,
    /// returning a new tree (sharing every existing node's `NodeId`) rooted
    /// at it. Used to re-enter the core on a quote's captured sub-tree as an
    /// independent compilation — see [`crate::quote::compile_quoted`].
    pub(crate) fn with_synthetic_lambda(&self, body: NodeId, ret_ty: Ty) -> (Tree, NodeId) {
        let mut nodes = self.nodes.clone();
        let lambda_id = NodeId(nodes.len() as u32);
        nodes.push(NodeData { kind: NodeKind::Lambda { params: vec![], body, ret_ty }, ty: Ty::Any });
        (Tree { nodes, vars: self.vars.clone(), next_label: self.next_label, root: lambda_id }, lambda_id)
    }

    /// Children of `id` in left-to-right evaluation order, for traversals
    /// that don't need kind-specific structure (the stack spiller, the
    /// constant allocator's free-variable scan).
    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        match &self.node(id).kind {
            NodeKind::Constant(_) | NodeKind::Variable(_) | NodeKind::Label(_) | NodeKind::Goto(_) => vec![],
            NodeKind::Block { body, .. } => body.clone(),
            NodeKind::Lambda { body, .. } => vec![*body],
            NodeKind::Invoke { target, args } => {
                let mut c = vec![*target];
                c.extend(args);
                c
            }
            NodeKind::Call { args, .. } | NodeKind::New { args, .. } => args.clone(),
            NodeKind::Assign { value, .. } => vec![*value],
            NodeKind::Binary { lhs, rhs, .. } => vec![*lhs, *rhs],
            NodeKind::Unary { operand, .. } => vec![*operand],
            NodeKind::Conditional { test, then_branch, else_branch } => {
                let mut c = vec![*test, *then_branch];
                if let Some(e) = else_branch {
                    c.push(*e);
                }
                c
            }
            NodeKind::Loop { body } => vec![*body],
            NodeKind::Try { body, catches, finally } => {
                let mut c = vec![*body];
                for clause in catches {
                    if let Some(f) = clause.filter {
                        c.push(f);
                    }
                    c.push(clause.body);
                }
                if let Some(f) = finally {
                    c.push(*f);
                }
                c
            }
            NodeKind::Switch { value, cases, default } => {
                let mut c = vec![*value];
                c.extend(cases.iter().map(|(_, body)| *body));
                if let Some(d) = default {
                    c.push(*d);
                }
                c
            }
            NodeKind::Quote(inner) => vec![*inner],
            NodeKind::RuntimeVariables(_) => vec![],
            NodeKind::IncDec { .. } => vec![],
        }
    }
}

/// Minimal construction surface. Not part of the compiler core proper —
/// tree construction is treated as an external collaborator — kept here
/// only because this crate is its own frontend for test purposes.
pub struct TreeBuilder {
    nodes: Vec<NodeData>,
    vars: Vec<VarData>,
    next_label: u32,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self { nodes: Vec::new(), vars: Vec::new(), next_label: 0 }
    }

    pub fn declare_var(&mut self, name: &str, ty: Ty, by_ref: bool) -> VarId {
        let id = VarId(self.vars.len() as u32);
        self.vars.push(VarData { name: Rc::from(name), ty, by_ref });
        id
    }

    pub fn fresh_label(&mut self) -> LabelId {
        let id = LabelId(self.next_label);
        self.next_label += 1;
        id
    }

    pub fn push(&mut self, kind: NodeKind, ty: Ty) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(NodeData { kind, ty });
        id
    }

    pub fn node(&self, id: NodeId) -> &NodeData {
        &self.nodes[id.0 as usize]
    }

    pub fn constant_int(&mut self, n: i64) -> NodeId {
        let value = if InlineConst::fits_inline(n) {
            ConstantValue::Inline(InlineConst::Int(n))
        } else {
            ConstantValue::Boxed(Rc::new(BoxedConst { ty: Ty::Int, payload: BoxedPayload::Int(n) }))
        };
        self.push(NodeKind::Constant(value), Ty::Int)
    }

    pub fn constant_bool(&mut self, b: bool) -> NodeId {
        self.push(NodeKind::Constant(ConstantValue::Inline(InlineConst::Bool(b))), Ty::Bool)
    }

    pub fn constant_str(&mut self, s: &str) -> NodeId {
        let boxed = Rc::new(BoxedConst { ty: Ty::Str, payload: BoxedPayload::Str(s.to_owned()) });
        self.push(NodeKind::Constant(ConstantValue::Boxed(boxed)), Ty::Str)
    }

    /// Constructs a constant node that shares `boxed`'s identity with any
    /// other node built from the same `Rc` — the vehicle for testing
    /// reference-equality pooling.
    pub fn constant_shared(&mut self, boxed: Rc<BoxedConst>) -> NodeId {
        let ty = boxed.ty.clone();
        self.push(NodeKind::Constant(ConstantValue::Boxed(boxed)), ty)
    }

    pub fn var_ref(&mut self, var: VarId, ty: Ty) -> NodeId {
        self.push(NodeKind::Variable(var), ty)
    }

    pub fn block(&mut self, vars: Vec<VarId>, body: Vec<NodeId>) -> NodeId {
        let ty = body.last().map(|last| self.node(*last).ty.clone()).unwrap_or(Ty::Void);
        self.push(NodeKind::Block { vars, body }, ty)
    }

    pub fn lambda(&mut self, params: Vec<VarId>, body: NodeId, ret_ty: Ty) -> NodeId {
        self.push(NodeKind::Lambda { params, body, ret_ty }, Ty::Any)
    }

    pub fn invoke(&mut self, target: NodeId, args: Vec<NodeId>, ty: Ty) -> NodeId {
        self.push(NodeKind::Invoke { target, args }, ty)
    }

    pub fn assign(&mut self, var: VarId, value: NodeId) -> NodeId {
        let ty = self.node(value).ty.clone();
        self.push(NodeKind::Assign { var, value }, ty)
    }

    pub fn binary(&mut self, op: BinOp, checked: bool, lhs: NodeId, rhs: NodeId, ty: Ty) -> NodeId {
        self.push(NodeKind::Binary { op, checked, lhs, rhs }, ty)
    }

    pub fn unary(&mut self, op: UnOp, operand: NodeId, ty: Ty) -> NodeId {
        self.push(NodeKind::Unary { op, operand }, ty)
    }

    pub fn conditional(&mut self, test: NodeId, then_branch: NodeId, else_branch: Option<NodeId>) -> NodeId {
        let ty = self.node(then_branch).ty.clone();
        self.push(NodeKind::Conditional { test, then_branch, else_branch }, ty)
    }

    pub fn loop_(&mut self, body: NodeId) -> NodeId {
        self.push(NodeKind::Loop { body }, Ty::Void)
    }

    pub fn label(&mut self, label: LabelId) -> NodeId {
        self.push(NodeKind::Label(label), Ty::Void)
    }

    pub fn goto(&mut self, label: LabelId) -> NodeId {
        self.push(NodeKind::Goto(label), Ty::Void)
    }

    pub fn try_(&mut self, body: NodeId, catches: Vec<CatchClause>, finally: Option<NodeId>) -> NodeId {
        let ty = self.node(body).ty.clone();
        self.push(NodeKind::Try { body, catches, finally }, ty)
    }

    pub fn quote(&mut self, inner: NodeId) -> NodeId {
        self.push(NodeKind::Quote(inner), Ty::Any)
    }

    pub fn runtime_variables(&mut self, vars: Vec<VarId>) -> NodeId {
        self.push(NodeKind::RuntimeVariables(vars), Ty::Any)
    }

    pub fn inc_dec(&mut self, var: VarId, op: IncDecOp, prefix: bool, void_context: bool, ty: Ty) -> NodeId {
        self.push(NodeKind::IncDec { var, op, prefix, void_context }, ty)
    }

    pub fn finish(self, root: NodeId) -> Tree {
        Tree { nodes: self.nodes, vars: self.vars, next_label: self.next_label, root }
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_constant_has_one_identity() {
        let boxed = Rc::new(BoxedConst { ty: Ty::Str, payload: BoxedPayload::Str("x".into()) });
        let mut b = TreeBuilder::new();
        let n1 = b.constant_shared(boxed.clone());
        let n2 = b.constant_shared(boxed);
        let tree = b.finish(n1);
        let (NodeKind::Constant(c1), NodeKind::Constant(c2)) = (&tree.node(n1).kind, &tree.node(n2).kind) else {
            panic!("expected constants");
        };
        assert_eq!(c1.identity(), c2.identity());
    }

    #[test]
    fn distinct_constants_have_distinct_identity() {
        let mut b = TreeBuilder::new();
        let n1 = b.constant_str("x");
        let n2 = b.constant_str("x");
        let tree = b.finish(n1);
        let (NodeKind::Constant(c1), NodeKind::Constant(c2)) = (&tree.node(n1).kind, &tree.node(n2).kind) else {
            panic!("expected constants");
        };
        assert_ne!(c1.identity(), c2.identity());
    }

    #[test]
    fn small_ints_are_inline() {
        let mut b = TreeBuilder::new();
        let small = b.constant_int(5);
        let big = b.constant_int(100_000);
        let tree = b.finish(small);
        let NodeKind::Constant(c) = &tree.node(small).kind else { panic!() };
        assert!(c.is_inline());
        let NodeKind::Constant(c) = &tree.node(big).kind else { panic!() };
        assert!(!c.is_inline());
    }
}
