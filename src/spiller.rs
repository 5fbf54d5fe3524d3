//! Stack Spiller: identifies every composite expression (an
//! `Invoke`, `Call`, `New`, or `Binary`) where a later operand's subtree
//! contains a `Try`, `Switch`, or `Loop` — constructs that must be entered
//! with an empty operand stack. The Lambda Compiler consults this plan and,
//! for a flagged node, evaluates every operand into a fresh temporary local
//! immediately (in original left-to-right order, each exactly once) rather
//! than leaving earlier operands sitting on the stack while the risky one
//! runs. This preserves both side-effect order and once-only evaluation;
//! the plan names risky nodes, it does not rewrite the tree.

use ahash::{AHashMap, AHashSet};

use crate::tree::{NodeId, NodeKind, Tree};

const STACK_RED_ZONE: usize = 256 * 1024;
const STACK_GROW_BY: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct SpillPlan {
    spill_all_operands: AHashSet<NodeId>,
}

impl SpillPlan {
    /// Whether `node` (a composite with more than one operand) must spill
    /// every operand to a temporary local rather than evaluating them
    /// directly onto the stack.
    pub fn needs_spill(&self, node: NodeId) -> bool {
        self.spill_all_operands.contains(&node)
    }
}

pub fn plan(tree: &Tree) -> SpillPlan {
    let mut risky_cache = AHashMap::new();
    let mut out = SpillPlan::default();
    stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_BY, || walk(tree, tree.root, &mut risky_cache, &mut out));
    out
}

fn walk(tree: &Tree, node: NodeId, risky_cache: &mut AHashMap<NodeId, bool>, out: &mut SpillPlan) {
    let operands = match &tree.node(node).kind {
        NodeKind::Invoke { target, args } => {
            let mut v = vec![*target];
            v.extend(args);
            Some(v)
        }
        NodeKind::Call { args, .. } | NodeKind::New { args, .. } => Some(args.clone()),
        NodeKind::Binary { lhs, rhs, .. } => Some(vec![*lhs, *rhs]),
        _ => None,
    };

    if let Some(operands) = operands {
        if operands.len() >= 2 && operands[1..].iter().any(|&n| is_risky(tree, n, risky_cache)) {
            out.spill_all_operands.insert(node);
        }
    }

    for child in tree.children(node) {
        stacker::maybe_grow(STACK_RED_ZONE, STACK_GROW_BY, || walk(tree, child, risky_cache, out));
    }
}

/// Whether evaluating `node` might, somewhere in its own subtree (not
/// crossing into a nested lambda's body, which runs on its own fresh stack),
/// require the operand stack to be empty on entry.
fn is_risky(tree: &Tree, node: NodeId, cache: &mut AHashMap<NodeId, bool>) -> bool {
    if let Some(&cached) = cache.get(&node) {
        return cached;
    }
    let risky = match &tree.node(node).kind {
        NodeKind::Try { .. } | NodeKind::Switch { .. } | NodeKind::Loop { .. } => true,
        NodeKind::Lambda { .. } => false,
        _ => tree.children(node).iter().any(|&c| is_risky(tree, c, cache)),
    };
    cache.insert(node, risky);
    risky
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{BinOp, Ty, TreeBuilder};

    #[test]
    fn binary_with_risky_rhs_needs_spill() {
        let mut b = TreeBuilder::new();
        let lhs = b.constant_int(1);
        let try_body = b.constant_int(2);
        let rhs = b.try_(try_body, vec![], None);
        let add = b.binary(BinOp::Add, false, lhs, rhs, Ty::Int);
        let lambda = b.lambda(vec![], add, Ty::Int);
        let tree = b.finish(lambda);

        let plan = plan(&tree);
        assert!(plan.needs_spill(add));
    }

    #[test]
    fn binary_with_two_plain_operands_does_not_need_spill() {
        let mut b = TreeBuilder::new();
        let lhs = b.constant_int(1);
        let rhs = b.constant_int(2);
        let add = b.binary(BinOp::Add, false, lhs, rhs, Ty::Int);
        let lambda = b.lambda(vec![], add, Ty::Int);
        let tree = b.finish(lambda);

        let plan = plan(&tree);
        assert!(!plan.needs_spill(add));
    }

    #[test]
    fn risky_first_operand_alone_does_not_need_spill() {
        // Nothing precedes the first operand on the stack, so a Try there is
        // already entered with an empty stack.
        let mut b = TreeBuilder::new();
        let try_body = b.constant_int(1);
        let lhs = b.try_(try_body, vec![], None);
        let rhs = b.constant_int(2);
        let add = b.binary(BinOp::Add, false, lhs, rhs, Ty::Int);
        let lambda = b.lambda(vec![], add, Ty::Int);
        let tree = b.finish(lambda);

        let plan = plan(&tree);
        assert!(!plan.needs_spill(add));
    }

    #[test]
    fn nested_lambda_boundary_is_not_risky() {
        let mut b = TreeBuilder::new();
        let inner_body = b.constant_int(1);
        let loop_in_lambda = b.loop_(inner_body);
        let nested_lambda = b.lambda(vec![], loop_in_lambda, Ty::Void);
        let lhs = b.constant_int(1);
        let invoke = b.invoke(nested_lambda, vec![lhs], Ty::Int);
        let lambda = b.lambda(vec![], invoke, Ty::Int);
        let tree = b.finish(lambda);

        let plan = plan(&tree);
        // `nested_lambda` itself sits at operand index 0 (the Invoke target)
        // and is never descended into across the boundary, so no spill.
        assert!(!plan.needs_spill(invoke));
    }
}
