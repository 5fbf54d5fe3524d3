//! The bytecode interpreter: a fetch-decode-execute loop over one [`Code`]
//! object's instructions, using the stack/locals frame the Lambda Compiler
//! assumed when it emitted them.
//!
//! Exceptions (`Throw`/`Rethrow` and the handful of opcodes that can fault —
//! division, checked arithmetic, a failing host call) are all represented
//! the same way once raised: a [`Value`] searched against [`Code`]'s
//! exception table at the offset of the faulting instruction. An exception
//! that finds no handler anywhere up the call chain becomes
//! [`RuntimeError::Unhandled`]; only a genuinely malformed instruction stream
//! (an unknown opcode byte) short-circuits straight out as
//! [`RuntimeError::MalformedBytecode`], bypassing the exception table
//! entirely — that failure means the compiler or this interpreter has a bug,
//! not that the compiled program threw something.

use std::cell::RefCell;
use std::rc::Rc;

use ahash::AHashMap;

use super::code::Code;
use crate::closure::ClosureRecord;
use crate::env::{CompiledLambda, HostFunctions};
use crate::error::{RuntimeError, RuntimeResult};
use crate::opcode::Opcode;
use crate::quote::QuotedTree;
use crate::runtime_vars::{PackedIndex, RuntimeVariablesHandle};
use crate::tree::{HostHandle, Tree};
use crate::value::Value;

/// What one instruction's execution did to control flow, once it has not
/// thrown.
enum Step {
    Continue,
    Return(Value),
}

pub fn invoke(lambda: &CompiledLambda, args: &[Value], host: &dyn HostFunctions) -> RuntimeResult<Value> {
    run_frame(&lambda.tree, &lambda.code, args, lambda.captured_env.clone(), &lambda.host_table, host)
}

fn run_frame(
    tree: &Rc<Tree>,
    code: &Rc<Code>,
    args: &[Value],
    outer: Option<Rc<ClosureRecord>>,
    host_table: &Rc<Vec<HostHandle>>,
    host: &dyn HostFunctions,
) -> RuntimeResult<Value> {
    let mut locals: Vec<Value> = Vec::with_capacity(code.num_locals() as usize);
    locals.extend_from_slice(args);
    locals.resize(code.num_locals() as usize, Value::Null);
    let mut stack: Vec<Value> = Vec::with_capacity(code.stack_size() as usize);
    let bytecode = code.bytecode();
    let mut ip: usize = 0;

    loop {
        let op_offset = ip;
        let Some(opcode) = Opcode::decode(bytecode[ip]) else {
            return Err(RuntimeError::MalformedBytecode(format!("unknown opcode byte {} at offset {op_offset}", bytecode[ip])));
        };
        ip += 1;

        let outcome = execute(opcode, bytecode, &mut ip, &mut stack, &mut locals, code, tree, outer.as_ref(), host_table, host);

        match outcome {
            Ok(Step::Continue) => {}
            Ok(Step::Return(value)) => return Ok(value),
            Err(thrown) => match code.find_exception_handler(op_offset as u32) {
                Some(entry) => {
                    stack.truncate(entry.stack_depth() as usize);
                    stack.push(thrown);
                    ip = entry.handler() as usize;
                }
                None => return Err(RuntimeError::Unhandled(describe(&thrown))),
            },
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn execute(
    opcode: Opcode,
    bytecode: &[u8],
    ip: &mut usize,
    stack: &mut Vec<Value>,
    locals: &mut [Value],
    code: &Rc<Code>,
    tree: &Rc<Tree>,
    outer: Option<&Rc<ClosureRecord>>,
    host_table: &Rc<Vec<HostHandle>>,
    host: &dyn HostFunctions,
) -> Result<Step, Value> {
    let pop = |stack: &mut Vec<Value>| stack.pop().expect("operand stack underflow — malformed bytecode");

    match opcode {
        Opcode::Nop => {}
        Opcode::Pop => {
            pop(stack);
        }
        Opcode::Dup => {
            let top = stack.last().expect("operand stack underflow — malformed bytecode").clone();
            stack.push(top);
        }
        Opcode::PushNull => stack.push(Value::Null),
        Opcode::PushTrue => stack.push(Value::Bool(true)),
        Opcode::PushFalse => stack.push(Value::Bool(false)),
        Opcode::LoadSmallInt => {
            let n = read_i8(bytecode, ip) as i64;
            stack.push(Value::Int(n));
        }
        Opcode::LoadConst => {
            let slot = read_u16(bytecode, ip);
            stack.push(code.constants().get(slot).clone());
        }

        Opcode::LoadArg0 | Opcode::LoadLocal0 => stack.push(locals[0].clone()),
        Opcode::LoadLocal1 => stack.push(locals[1].clone()),
        Opcode::LoadLocal2 => stack.push(locals[2].clone()),
        Opcode::LoadLocal3 => stack.push(locals[3].clone()),
        Opcode::LoadLocal => {
            let slot = read_u8(bytecode, ip) as usize;
            stack.push(locals[slot].clone());
        }
        Opcode::LoadLocalW => {
            let slot = read_u16(bytecode, ip) as usize;
            stack.push(locals[slot].clone());
        }
        Opcode::StoreLocal0 => locals[0] = pop(stack),
        Opcode::StoreLocal1 => locals[1] = pop(stack),
        Opcode::StoreLocal2 => locals[2] = pop(stack),
        Opcode::StoreLocal3 => locals[3] = pop(stack),
        Opcode::StoreLocal => {
            let slot = read_u8(bytecode, ip) as usize;
            locals[slot] = pop(stack);
        }
        Opcode::StoreLocalW => {
            let slot = read_u16(bytecode, ip) as usize;
            locals[slot] = pop(stack);
        }

        Opcode::LoadOuterClosure => {
            let record = outer.expect("lambda reads its outer closure but none was captured").clone();
            stack.push(Value::Closure(record));
        }
        Opcode::LoadClosureField => {
            let depth = read_u8(bytecode, ip);
            let field = read_u8(bytecode, ip) as usize;
            let base = pop(stack).as_closure().clone();
            stack.push(base.ancestor(depth).get(field));
        }
        Opcode::StoreClosureField => {
            let depth = read_u8(bytecode, ip);
            let field = read_u8(bytecode, ip) as usize;
            let base = pop(stack).as_closure().clone();
            let value = pop(stack);
            base.ancestor(depth).set(field, value);
        }
        Opcode::LoadCellValue => {
            let cell = pop(stack).as_cell().clone();
            let value = cell.borrow().clone();
            stack.push(value);
        }
        Opcode::StoreCellValue => {
            let cell = pop(stack).as_cell().clone();
            let value = pop(stack);
            *cell.borrow_mut() = value;
        }
        Opcode::NewCell => {
            let value = pop(stack);
            stack.push(Value::Cell(Rc::new(RefCell::new(value))));
        }
        Opcode::NewClosureRecord => {
            let arity = read_u16(bytecode, ip) as usize;
            let has_parent = read_u8(bytecode, ip);
            let mut fields = Vec::with_capacity(arity);
            for _ in 0..arity {
                fields.push(pop(stack));
            }
            fields.reverse();
            let parent = (has_parent != 0).then(|| pop(stack).as_closure().clone());
            stack.push(Value::Closure(ClosureRecord::new(parent, fields)));
        }

        Opcode::Add => return binary_arith(stack, |a, b| Ok(a.wrapping_add(b))),
        Opcode::AddChecked => return binary_arith(stack, |a, b| a.checked_add(b).ok_or(())),
        Opcode::Sub => return binary_arith(stack, |a, b| Ok(a.wrapping_sub(b))),
        Opcode::SubChecked => return binary_arith(stack, |a, b| a.checked_sub(b).ok_or(())),
        Opcode::Mul => return binary_arith(stack, |a, b| Ok(a.wrapping_mul(b))),
        Opcode::MulChecked => return binary_arith(stack, |a, b| a.checked_mul(b).ok_or(())),
        Opcode::Div => {
            let rhs = pop(stack).as_int();
            let lhs = pop(stack).as_int();
            if rhs == 0 {
                return Err(thrown_from(RuntimeError::DivideByZero));
            }
            stack.push(Value::Int(lhs.wrapping_div(rhs)));
        }
        Opcode::Neg => {
            let v = pop(stack).as_int();
            stack.push(Value::Int(v.wrapping_neg()));
        }
        Opcode::Not => {
            let v = pop(stack).as_bool();
            stack.push(Value::Bool(!v));
        }
        Opcode::CmpLt => return compare(stack, |a, b| a < b),
        Opcode::CmpLe => return compare(stack, |a, b| a <= b),
        Opcode::CmpGt => return compare(stack, |a, b| a > b),
        Opcode::CmpGe => return compare(stack, |a, b| a >= b),
        Opcode::CmpEq => {
            let rhs = pop(stack);
            let lhs = pop(stack);
            stack.push(Value::Bool(lhs.value_eq(&rhs)));
        }
        Opcode::CmpNe => {
            let rhs = pop(stack);
            let lhs = pop(stack);
            stack.push(Value::Bool(!lhs.value_eq(&rhs)));
        }

        Opcode::Jump | Opcode::Leave => {
            let offset = read_i16(bytecode, ip);
            *ip = (*ip as i64 + offset as i64) as usize;
        }
        Opcode::JumpIfTrue => {
            let offset = read_i16(bytecode, ip);
            if pop(stack).as_bool() {
                *ip = (*ip as i64 + offset as i64) as usize;
            }
        }
        Opcode::JumpIfFalse => {
            let offset = read_i16(bytecode, ip);
            if !pop(stack).as_bool() {
                *ip = (*ip as i64 + offset as i64) as usize;
            }
        }
        Opcode::JumpIfTrueOrPop => {
            let offset = read_i16(bytecode, ip);
            if stack.last().expect("operand stack underflow — malformed bytecode").as_bool() {
                *ip = (*ip as i64 + offset as i64) as usize;
            } else {
                pop(stack);
            }
        }
        Opcode::JumpIfFalseOrPop => {
            let offset = read_i16(bytecode, ip);
            if !stack.last().expect("operand stack underflow — malformed bytecode").as_bool() {
                *ip = (*ip as i64 + offset as i64) as usize;
            } else {
                pop(stack);
            }
        }

        Opcode::CallHost | Opcode::NewHost => {
            let idx = read_u16(bytecode, ip);
            let argc = read_u8(bytecode, ip) as usize;
            let mut call_args = Vec::with_capacity(argc);
            for _ in 0..argc {
                call_args.push(pop(stack));
            }
            call_args.reverse();
            let handle = &host_table[idx as usize];
            let result =
                if opcode == Opcode::NewHost { host.construct(handle, &call_args) } else { host.call(handle, &call_args) };
            match result {
                Ok(v) => stack.push(v),
                Err(e) => return Err(thrown_from(e)),
            }
        }
        Opcode::InvokeLambda => {
            let argc = read_u8(bytecode, ip) as usize;
            let mut call_args = Vec::with_capacity(argc);
            for _ in 0..argc {
                call_args.push(pop(stack));
            }
            call_args.reverse();
            let callee = pop(stack);
            let target = match callee {
                Value::Lambda(l) => l,
                other => panic!("invoke target is not a lambda value, found {other:?}"),
            };
            match run_frame(&target.tree, &target.code, &call_args, target.captured_env.clone(), &target.host_table, host) {
                Ok(v) => stack.push(v),
                Err(RuntimeError::MalformedBytecode(m)) => return Err(thrown_from(RuntimeError::MalformedBytecode(m))),
                Err(e) => return Err(thrown_from(e)),
            }
        }
        Opcode::MakeLambda => {
            let idx = read_u16(bytecode, ip);
            let captured = pop(stack);
            let captured_env = match captured {
                Value::Null => None,
                Value::Closure(c) => Some(c),
                other => panic!("MakeLambda capture operand must be Null or a closure record, found {other:?}"),
            };
            let nested_code = code.nested(idx).clone();
            let compiled =
                Rc::new(CompiledLambda { tree: tree.clone(), code: nested_code, captured_env, host_table: host_table.clone() });
            stack.push(Value::Lambda(compiled));
        }

        Opcode::MakeQuote => {
            let slot = read_u16(bytecode, ip);
            let count = read_u8(bytecode, ip) as usize;
            let template = code.constants().get(slot).as_quote_template().clone();
            let mut cells = Vec::with_capacity(count);
            for _ in 0..count {
                cells.push(pop(stack).as_cell().clone());
            }
            cells.reverse();
            let mut by_var = AHashMap::new();
            for (&var, cell) in template.free_vars.iter().zip(cells) {
                by_var.insert(var, cell);
            }
            stack.push(Value::Quote(QuotedTree::new(tree.clone(), template, by_var)));
        }
        Opcode::MakeRuntimeVariables => {
            let slot = read_u16(bytecode, ip);
            let base = pop(stack).as_closure().clone();
            let indices: Vec<PackedIndex> = match code.constants().get(slot) {
                Value::Array(arr) => arr.borrow().iter().map(|v| PackedIndex::unpack(v.as_int())).collect(),
                other => panic!("runtime-variables constant slot is not an array, found {other:?}"),
            };
            stack.push(Value::RuntimeVariables(RuntimeVariablesHandle::resolve(&base, &indices)));
        }

        Opcode::Throw | Opcode::Rethrow => return Err(pop(stack)),

        Opcode::SwitchHash => {
            return Err(thrown_from(RuntimeError::MalformedBytecode(
                "SwitchHash is never emitted by this compiler (string switches always lower to a comparison chain)"
                    .to_owned(),
            )));
        }

        Opcode::ReturnValue => return Ok(Step::Return(pop(stack))),
        Opcode::ReturnVoid => return Ok(Step::Return(Value::Null)),
    }

    Ok(Step::Continue)
}

fn binary_arith(stack: &mut Vec<Value>, f: impl FnOnce(i64, i64) -> Result<i64, ()>) -> Result<Step, Value> {
    let rhs = stack.pop().expect("operand stack underflow — malformed bytecode").as_int();
    let lhs = stack.pop().expect("operand stack underflow — malformed bytecode").as_int();
    match f(lhs, rhs) {
        Ok(n) => {
            stack.push(Value::Int(n));
            Ok(Step::Continue)
        }
        Err(()) => Err(thrown_from(RuntimeError::ArithmeticOverflow)),
    }
}

fn compare(stack: &mut Vec<Value>, f: impl FnOnce(i64, i64) -> bool) -> Result<Step, Value> {
    let rhs = stack.pop().expect("operand stack underflow — malformed bytecode").as_int();
    let lhs = stack.pop().expect("operand stack underflow — malformed bytecode").as_int();
    stack.push(Value::Bool(f(lhs, rhs)));
    Ok(Step::Continue)
}

fn thrown_from(err: RuntimeError) -> Value {
    Value::Str(Rc::from(err.to_string().as_str()))
}

fn describe(value: &Value) -> String {
    match value {
        Value::Str(s) => s.to_string(),
        other => format!("{other:?}"),
    }
}

fn read_u8(bytecode: &[u8], ip: &mut usize) -> u8 {
    let b = bytecode[*ip];
    *ip += 1;
    b
}

fn read_i8(bytecode: &[u8], ip: &mut usize) -> i8 {
    read_u8(bytecode, ip) as i8
}

fn read_u16(bytecode: &[u8], ip: &mut usize) -> u16 {
    let bytes = [bytecode[*ip], bytecode[*ip + 1]];
    *ip += 2;
    u16::from_le_bytes(bytes)
}

fn read_i16(bytecode: &[u8], ip: &mut usize) -> i16 {
    read_u16(bytecode, ip) as i16
}
