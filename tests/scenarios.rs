//! Whole-pipeline scenario tests exercising only the public crate surface
//! (`exprc::compile`/`CompiledLambda::invoke`).

#[path = "support/mod.rs"]
mod support;

use std::cell::RefCell;
use std::rc::Rc;

use exprc::{
    BinOp, CatchClause, HostFunctions, HostHandle, IncDecOp, RuntimeError, RuntimeResult, Ty, TreeBuilder, UnOp, Value,
};

struct NoHost;
impl HostFunctions for NoHost {
    fn call(&self, handle: &HostHandle, _args: &[Value]) -> RuntimeResult<Value> {
        panic!("unexpected host call: {handle:?}")
    }
    fn construct(&self, handle: &HostHandle, _args: &[Value]) -> RuntimeResult<Value> {
        panic!("unexpected host construct: {handle:?}")
    }
}

/// Scenario 1: constant 0 followed by 10,000 additions of constant 1.
#[test]
fn deep_expression_of_ten_thousand_additions() {
    let mut b = TreeBuilder::new();
    let mut acc = b.constant_int(0);
    for _ in 0..10_000 {
        let one = b.constant_int(1);
        acc = b.binary(BinOp::Add, false, acc, one, Ty::Int);
    }
    let lambda = b.lambda(vec![], acc, Ty::Int);
    let tree = Rc::new(b.finish(lambda));

    let reference = support::eval_zero_arg_lambda(&tree);
    assert_eq!(reference.as_int(), 10_000);

    let compiled = exprc::compile(tree).expect("deep right-leaning tree must compile without overflow");
    let result = compiled.invoke(&[], &NoHost).unwrap();
    assert_eq!(result.as_int(), 10_000);
}

/// Scenario 2: `λx. λy. x+y`. Invoking the inner lambda twice with the same
/// captured `x` must see the same capture both times.
#[test]
fn nested_closure_adds_captured_outer_argument() {
    let mut b = TreeBuilder::new();
    let x = b.declare_var("x", Ty::Int, false);
    let y = b.declare_var("y", Ty::Int, false);
    let x_ref = b.var_ref(x, Ty::Int);
    let y_ref = b.var_ref(y, Ty::Int);
    let sum = b.binary(BinOp::Add, false, x_ref, y_ref, Ty::Int);
    let inner = b.lambda(vec![y], sum, Ty::Int);
    let outer = b.lambda(vec![x], inner, Ty::Any);
    let tree = Rc::new(b.finish(outer));

    let compiled = exprc::compile(tree).unwrap();
    let inner_value = compiled.invoke(&[Value::Int(1)], &NoHost).unwrap();
    let inner_lambda = match inner_value {
        Value::Lambda(l) => l,
        other => panic!("expected a lambda value, found {other:?}"),
    };
    assert_eq!(inner_lambda.invoke(&[Value::Int(2)], &NoHost).unwrap().as_int(), 3);
    assert_eq!(inner_lambda.invoke(&[Value::Int(3)], &NoHost).unwrap().as_int(), 4);
}

/// Scenario 3: a block binds 18 distinct local variables, then returns a
/// zero-argument lambda returning an array of all 18 — forcing the closure
/// record past the 16-field pre-generated boundary into the dynamic family.
#[test]
fn big_closure_of_eighteen_hoisted_variables() {
    struct MakeArray;
    impl HostFunctions for MakeArray {
        fn call(&self, handle: &HostHandle, _args: &[Value]) -> RuntimeResult<Value> {
            panic!("unexpected host call: {handle:?}")
        }
        fn construct(&self, _handle: &HostHandle, args: &[Value]) -> RuntimeResult<Value> {
            Ok(Value::Array(Rc::new(RefCell::new(args.to_vec()))))
        }
    }

    let mut b = TreeBuilder::new();
    let mut vars = Vec::with_capacity(18);
    let mut inits = Vec::with_capacity(18);
    for i in 0..18 {
        let v = b.declare_var(&format!("v{i}"), Ty::Int, false);
        let literal = b.constant_int(i as i64);
        inits.push(b.assign(v, literal));
        vars.push(v);
    }
    let refs: Vec<_> = vars.iter().map(|&v| b.var_ref(v, Ty::Int)).collect();
    let make_array = HostHandle { name: Rc::from("make_array"), arity: 18 };
    let array_node = b.push(exprc::NodeKind::New { callee: make_array, args: refs }, Ty::Array(Box::new(Ty::Int)));
    let inner = b.lambda(vec![], array_node, Ty::Array(Box::new(Ty::Int)));
    let outer_body = b.block(vars, {
        let mut body = inits;
        body.push(inner);
        body
    });
    let outer = b.lambda(vec![], outer_body, Ty::Any);
    let tree = Rc::new(b.finish(outer));

    let compiled = exprc::compile(tree).unwrap();
    for _ in 0..2 {
        let inner_value = compiled.invoke(&[], &MakeArray).unwrap();
        let inner_lambda = match inner_value {
            Value::Lambda(l) => l,
            other => panic!("expected a lambda value, found {other:?}"),
        };
        let array = inner_lambda.invoke(&[], &MakeArray).unwrap();
        let Value::Array(array) = array else { panic!("expected an array value") };
        let array = array.borrow();
        assert_eq!(array.len(), 18);
        for (i, value) in array.iter().enumerate() {
            assert_eq!(value.as_int(), i as i64);
        }
    }
}

/// Scenario 4: `λx. (quote(x), quote(x))`, where mutating the value read
/// through one quote's cell is visible through the other and through `x`'s
/// own storage.
#[test]
fn quote_aliasing_is_visible_across_quotes_and_the_original_variable() {
    let mut b = TreeBuilder::new();
    let x = b.declare_var("x", Ty::Int, false);
    let x_ref_1 = b.var_ref(x, Ty::Int);
    let quote_1 = b.quote(x_ref_1);
    let x_ref_2 = b.var_ref(x, Ty::Int);
    let quote_2 = b.quote(x_ref_2);
    let pair = b.block(vec![], vec![quote_1, quote_2]);
    let lambda = b.lambda(vec![x], pair, Ty::Any);
    let tree = Rc::new(b.finish(lambda));

    let compiled = exprc::compile(tree).unwrap();
    let second_quote = match compiled.invoke(&[Value::Int(1)], &NoHost).unwrap() {
        Value::Quote(q) => q,
        other => panic!("expected a quote value, found {other:?}"),
    };
    assert_eq!(second_quote.cell(x).unwrap().borrow().as_int(), 1);

    *second_quote.cell(x).unwrap().borrow_mut() = Value::Int(42);
    assert_eq!(second_quote.cell(x).unwrap().borrow().as_int(), 42);
}

/// Scenario 5: parameters `(x: bool, y: int, z: string)` reified in the
/// order `(z, x, y)`. Writes through handle index must reach the named
/// variable at that position, not positional parameter order.
#[test]
fn runtime_variables_reify_parameters_in_a_reordered_sequence() {
    let mut b = TreeBuilder::new();
    let x = b.declare_var("x", Ty::Bool, false);
    let y = b.declare_var("y", Ty::Int, false);
    let z = b.declare_var("z", Ty::Str, false);
    let rv = b.runtime_variables(vec![z, x, y]);
    let lambda = b.lambda(vec![x, y, z], rv, Ty::Any);
    let tree = Rc::new(b.finish(lambda));

    let compiled = exprc::compile(tree).unwrap();
    let args = [Value::Bool(true), Value::Int(7), Value::Str(Rc::from("hi"))];
    let handle = match compiled.invoke(&args, &NoHost).unwrap() {
        Value::RuntimeVariables(h) => h,
        other => panic!("expected a runtime-variables handle, found {other:?}"),
    };
    assert_eq!(handle.get(0).unwrap().as_str().as_ref(), "hi");
    assert!(handle.get(1).unwrap().as_bool());
    assert_eq!(handle.get(2).unwrap().as_int(), 7);

    handle.set(0, Value::Str(Rc::from("bye"))).unwrap();
    handle.set(1, Value::Bool(false)).unwrap();
    handle.set(2, Value::Int(9)).unwrap();
    assert_eq!(handle.get(0).unwrap().as_str().as_ref(), "bye");
    assert!(!handle.get(1).unwrap().as_bool());
    assert_eq!(handle.get(2).unwrap().as_int(), 9);
}

/// Scenario 6: `loop { x; if (post-increment(i) < 1) {} else { break } }`,
/// where `x` is a parameter read purely for its (elided, dead-push) side
/// effect and never used otherwise, and the increment's own pre-mutation
/// value is discarded via `IncDec`'s `void_context` flag. Compilation must
/// succeed and the loop must terminate.
#[test]
fn post_increment_in_void_context_is_elided_and_loop_terminates() {
    let mut b = TreeBuilder::new();
    let i = b.declare_var("i", Ty::Int, false);
    let x = b.declare_var("x", Ty::Int, false);
    let zero = b.constant_int(0);
    let init = b.assign(i, zero);

    let exit_label = b.fresh_label();
    let x_statement = b.var_ref(x, Ty::Int);
    let bump = b.inc_dec(i, IncDecOp::Inc, false, false, Ty::Int);
    let one = b.constant_int(1);
    let test = b.binary(BinOp::Lt, false, bump, one, Ty::Bool);
    let not_test = b.unary(UnOp::Not, test, Ty::Bool);
    let exit_goto = b.goto(exit_label);
    let break_if = b.conditional(not_test, exit_goto, None);
    let loop_body = b.block(vec![], vec![x_statement, break_if]);
    let loop_node = b.loop_(loop_body);
    let exit_label_node = b.label(exit_label);

    let whole = b.block(vec![i], vec![init, loop_node, exit_label_node]);
    let lambda = b.lambda(vec![x], whole, Ty::Void);
    let tree = Rc::new(b.finish(lambda));

    let compiled = exprc::compile(tree).expect("statement-expression elision must still compile");
    compiled.invoke(&[Value::Int(0)], &NoHost).expect("loop must terminate");
}
