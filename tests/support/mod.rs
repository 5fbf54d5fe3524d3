//! A small tree-walking reference interpreter, used only to check compiled
//! output against independently-computed semantics. Never shipped as
//! library surface.
//!
//! Deliberately restricted: it covers the integer/boolean arithmetic and
//! control-flow subset exercised by the scenario tests in this directory —
//! enough to cross-check the deep-expression and loop/break scenarios — and
//! does not attempt to model closures, quotes, or host calls. Scenarios that
//! need those compare the compiled result against a hand-computed expected
//! value instead.

use std::collections::HashMap;

use exprc::{BinOp, IncDecOp, NodeId, NodeKind, Tree, UnOp, VarId};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InterpValue {
    Int(i64),
    Bool(bool),
}

impl InterpValue {
    pub fn as_int(self) -> i64 {
        match self {
            InterpValue::Int(n) => n,
            InterpValue::Bool(b) => b as i64,
        }
    }

    fn as_bool(self) -> bool {
        match self {
            InterpValue::Bool(b) => b,
            InterpValue::Int(n) => n != 0,
        }
    }
}

enum Flow {
    Normal(InterpValue),
    Goto(u32),
}

/// Evaluates `tree`'s root lambda body directly, with no parameters bound
/// (every scenario this supports is a zero-argument lambda).
pub fn eval_zero_arg_lambda(tree: &Tree) -> InterpValue {
    let NodeKind::Lambda { body, .. } = &tree.node(tree.root).kind else {
        panic!("reference interpreter only evaluates a lambda's body");
    };
    let mut env: HashMap<VarId, InterpValue> = HashMap::new();
    match eval(tree, *body, &mut env) {
        Flow::Normal(v) => v,
        Flow::Goto(label) => panic!("body fell through to unresolved label {label}"),
    }
}

fn eval(tree: &Tree, node: NodeId, env: &mut HashMap<VarId, InterpValue>) -> Flow {
    match &tree.node(node).kind {
        NodeKind::Constant(c) => Flow::Normal(eval_constant(c)),
        NodeKind::Variable(v) => Flow::Normal(env[v]),
        NodeKind::Assign { var, value } => {
            let Flow::Normal(v) = eval(tree, *value, env) else { panic!("goto inside assign value") };
            env.insert(*var, v);
            Flow::Normal(v)
        }
        NodeKind::Binary { op, lhs, rhs, .. } => {
            let Flow::Normal(l) = eval(tree, *lhs, env) else { panic!("goto inside binary lhs") };
            let Flow::Normal(r) = eval(tree, *rhs, env) else { panic!("goto inside binary rhs") };
            Flow::Normal(eval_binary(*op, l, r))
        }
        NodeKind::Unary { op, operand } => {
            let Flow::Normal(v) = eval(tree, *operand, env) else { panic!("goto inside unary operand") };
            Flow::Normal(match op {
                UnOp::Neg => InterpValue::Int(-v.as_int()),
                UnOp::Not => InterpValue::Bool(!v.as_bool()),
            })
        }
        NodeKind::IncDec { var, op, .. } => {
            let before = env[var].as_int();
            let after = match op {
                IncDecOp::Inc => before + 1,
                IncDecOp::Dec => before - 1,
            };
            env.insert(*var, InterpValue::Int(after));
            Flow::Normal(InterpValue::Int(before))
        }
        NodeKind::Conditional { test, then_branch, else_branch } => {
            let Flow::Normal(t) = eval(tree, *test, env) else { panic!("goto inside conditional test") };
            if t.as_bool() {
                eval(tree, *then_branch, env)
            } else if let Some(e) = else_branch {
                eval(tree, *e, env)
            } else {
                Flow::Normal(InterpValue::Bool(false))
            }
        }
        NodeKind::Block { body, .. } => {
            let mut last = InterpValue::Bool(false);
            let mut i = 0;
            while i < body.len() {
                match eval(tree, body[i], env) {
                    Flow::Normal(v) => last = v,
                    Flow::Goto(label) => {
                        if let Some(target) = find_label(tree, body, label) {
                            i = target;
                            continue;
                        }
                        return Flow::Goto(label);
                    }
                }
                i += 1;
            }
            Flow::Normal(last)
        }
        NodeKind::Loop { body } => loop {
            match eval(tree, *body, env) {
                Flow::Normal(_) => {}
                Flow::Goto(label) => return Flow::Goto(label),
            }
        },
        NodeKind::Label(_) => Flow::Normal(InterpValue::Bool(false)),
        NodeKind::Goto(label) => Flow::Goto(label.0),
        other => panic!("reference interpreter does not support node kind {other:?}"),
    }
}

fn find_label(tree: &Tree, body: &[NodeId], label: u32) -> Option<usize> {
    body.iter().position(|n| matches!(&tree.node(*n).kind, NodeKind::Label(l) if l.0 == label))
}

fn eval_constant(c: &exprc::ConstantValue) -> InterpValue {
    match c {
        exprc::ConstantValue::Inline(exprc::InlineConst::Int(n)) => InterpValue::Int(*n),
        exprc::ConstantValue::Inline(exprc::InlineConst::Bool(b)) => InterpValue::Bool(*b),
        exprc::ConstantValue::Inline(exprc::InlineConst::Null) => InterpValue::Bool(false),
        exprc::ConstantValue::Boxed(boxed) => match &boxed.payload {
            exprc::BoxedPayload::Int(n) => InterpValue::Int(*n),
            other => panic!("reference interpreter does not support boxed payload {other:?}"),
        },
    }
}

fn eval_binary(op: BinOp, l: InterpValue, r: InterpValue) -> InterpValue {
    match op {
        BinOp::Add => InterpValue::Int(l.as_int() + r.as_int()),
        BinOp::Sub => InterpValue::Int(l.as_int() - r.as_int()),
        BinOp::Mul => InterpValue::Int(l.as_int() * r.as_int()),
        BinOp::Div => InterpValue::Int(l.as_int() / r.as_int()),
        BinOp::Lt => InterpValue::Bool(l.as_int() < r.as_int()),
        BinOp::Le => InterpValue::Bool(l.as_int() <= r.as_int()),
        BinOp::Gt => InterpValue::Bool(l.as_int() > r.as_int()),
        BinOp::Ge => InterpValue::Bool(l.as_int() >= r.as_int()),
        BinOp::Eq => InterpValue::Bool(l.as_int() == r.as_int()),
        BinOp::Ne => InterpValue::Bool(l.as_int() != r.as_int()),
        BinOp::And => InterpValue::Bool(l.as_bool() && r.as_bool()),
        BinOp::Or => InterpValue::Bool(l.as_bool() || r.as_bool()),
    }
}
