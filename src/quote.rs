//! Quote Facility: reifies a sub-tree into a runtime value whose
//! free variables alias the live cells of the scope that quoted it, and
//! supports re-entrant compilation of that sub-tree as if it were its own
//! lambda body.

use std::rc::Rc;

use ahash::AHashMap;

use crate::error::CompileResult;
use crate::tree::{NodeId, Tree, VarId};
use crate::value::Cell;

/// The compile-time-constant part of a quote: which sub-tree, and which
/// variables it closes over. Built once by the constant allocator and placed
/// in the enclosing lambda's bound-constants pool; the per-invocation part
/// (the cells themselves) is supplied by `MakeQuote` at runtime, since a
/// fresh set of cells exists per invocation.
#[derive(Debug)]
pub struct QuoteTemplate {
    pub node: NodeId,
    pub free_vars: Vec<VarId>,
}

/// A reified quote: `template.node`'s sub-tree, together with shared cells
/// for every free variable referenced inside it. Cloning the surrounding
/// `Rc<QuotedTree>` does not clone the cells — two clones alias the same
/// live variables, which is what makes mutation through a quote visible to
/// the scope that produced it.
#[derive(Debug)]
pub struct QuotedTree {
    pub tree: Rc<Tree>,
    pub template: Rc<QuoteTemplate>,
    pub cells: AHashMap<VarId, Cell>,
}

impl QuotedTree {
    pub fn new(tree: Rc<Tree>, template: Rc<QuoteTemplate>, cells: AHashMap<VarId, Cell>) -> Rc<Self> {
        Rc::new(Self { tree, template, cells })
    }

    pub fn node(&self) -> NodeId {
        self.template.node
    }

    pub fn cell(&self, var: VarId) -> Option<&Cell> {
        self.cells.get(&var)
    }
}

/// Re-entrantly compiles a quoted sub-tree as its own lambda body. The
/// quote's free-variable cells stand in for a synthetic closure record
/// (each pre-classified `Hoisted` at a known field index), so the body
/// compiles exactly as if it were a nested lambda capturing them — see
/// `crate::env::compile_quoted`.
pub fn compile_quoted(quoted: &QuotedTree) -> CompileResult<Rc<crate::env::CompiledLambda>> {
    crate::env::compile_quoted(quoted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::{Ty, TreeBuilder};
    use crate::value::Value;
    use std::cell::RefCell;

    #[test]
    fn quoted_tree_exposes_its_node_and_cells() {
        let mut b = TreeBuilder::new();
        let x = b.declare_var("x", Ty::Int, false);
        let body = b.var_ref(x, Ty::Int);
        let lambda = b.lambda(vec![], body, Ty::Int);
        let tree = Rc::new(b.finish(lambda));

        let template = Rc::new(QuoteTemplate { node: body, free_vars: vec![x] });
        let mut cells = AHashMap::new();
        cells.insert(x, Rc::new(RefCell::new(Value::Int(7))));
        let quoted = QuotedTree::new(tree, template, cells);

        assert_eq!(quoted.node(), body);
        assert_eq!(quoted.cell(x).unwrap().borrow().as_int(), 7);
    }

    #[test]
    fn cloned_handle_aliases_same_cell() {
        let mut b = TreeBuilder::new();
        let x = b.declare_var("x", Ty::Int, false);
        let body = b.var_ref(x, Ty::Int);
        let lambda = b.lambda(vec![], body, Ty::Int);
        let tree = Rc::new(b.finish(lambda));
        let template = Rc::new(QuoteTemplate { node: body, free_vars: vec![x] });
        let cell = Rc::new(RefCell::new(Value::Int(1)));
        let mut cells = AHashMap::new();
        cells.insert(x, cell.clone());
        let quoted = QuotedTree::new(tree, template, cells);

        *cell.borrow_mut() = Value::Int(2);
        assert_eq!(quoted.cell(x).unwrap().borrow().as_int(), 2);
    }
}
