//! Guest programs shared by the integration suites.
//!
//! Each builder returns a fresh program (fresh residual-call state), so
//! interpreter-only and JIT-enabled runs start from the same state.
#![allow(dead_code)]

use std::cell::Cell;
use std::rc::Rc;

use sable_engine::heap::RawValue;
use sable_engine::ir::descr::{CallEffect, FieldDescr};
use sable_engine::jitcode::{JitCodeBuilder, Program, ProgramBuilder, ResidualFn};
use sable_engine::{GcRef, JitDriver, Kind};

/// The canonical sum loop: `s = 0; for i in 0..100 { s += i }; s`.
pub fn sum_loop() -> (Rc<Program>, usize) {
    let mut pb = ProgramBuilder::new();
    let mut b = JitCodeBuilder::new("sum", Some(Kind::Int));
    let g = b.new_reg_i();
    let i = b.new_reg_i();
    let s = b.new_reg_i();
    let lim = b.new_reg_i();
    let cond = b.new_reg_i();
    let one = b.new_reg_i();
    let header = b.new_label();
    let done = b.new_label();

    b.int_const(g, 0);
    b.int_const(i, 0);
    b.int_const(s, 0);
    b.bind(header);
    b.jit_merge_point(&[g], &[i, s], &[], &[]);
    b.int_const(lim, 100);
    b.int_lt(cond, i, lim);
    b.goto_if_not(done, cond);
    b.int_add(s, s, i);
    b.int_const(one, 1);
    b.int_add(i, i, one);
    b.can_enter_jit(&[g], &[i, s], &[], &[]);
    b.goto(header);
    b.bind(done);
    b.int_return(s);

    let main = pb.add_jitcode(b.finish());
    (pb.finish(), main)
}

/// `for i in 0..200 { s += if i == 100 { 1000 } else { 1 } }`: one rare
/// branch that grows a bridge.
pub fn rare_branch() -> (Rc<Program>, usize) {
    let mut pb = ProgramBuilder::new();
    let mut b = JitCodeBuilder::new("rare_branch", Some(Kind::Int));
    let g = b.new_reg_i();
    let i = b.new_reg_i();
    let s = b.new_reg_i();
    let lim = b.new_reg_i();
    let cond = b.new_reg_i();
    let hundred = b.new_reg_i();
    let eq = b.new_reg_i();
    let step = b.new_reg_i();
    let header = b.new_label();
    let done = b.new_label();
    let else_branch = b.new_label();
    let join = b.new_label();

    b.int_const(g, 0);
    b.int_const(i, 0);
    b.int_const(s, 0);
    b.bind(header);
    b.jit_merge_point(&[g], &[i, s], &[], &[]);
    b.int_const(lim, 200);
    b.int_lt(cond, i, lim);
    b.goto_if_not(done, cond);
    b.int_const(hundred, 100);
    b.int_eq(eq, i, hundred);
    b.goto_if_not(else_branch, eq);
    b.int_const(step, 1000);
    b.int_add(s, s, step);
    b.goto(join);
    b.bind(else_branch);
    b.int_const(step, 1);
    b.int_add(s, s, step);
    b.bind(join);
    b.int_const(step, 1);
    b.int_add(i, i, step);
    b.can_enter_jit(&[g], &[i, s], &[], &[]);
    b.goto(header);
    b.bind(done);
    b.int_return(s);

    let main = pb.add_jitcode(b.finish());
    (pb.finish(), main)
}

/// `for i in 0..400 { s += if i & 1 { 2 } else { 1 } }`: a guard that
/// fails every other iteration, exercising bridge takeover.
pub fn parity_sum() -> (Rc<Program>, usize) {
    let mut pb = ProgramBuilder::new();
    let mut b = JitCodeBuilder::new("parity_sum", Some(Kind::Int));
    let g = b.new_reg_i();
    let i = b.new_reg_i();
    let s = b.new_reg_i();
    let lim = b.new_reg_i();
    let cond = b.new_reg_i();
    let one = b.new_reg_i();
    let parity = b.new_reg_i();
    let step = b.new_reg_i();
    let header = b.new_label();
    let done = b.new_label();
    let even = b.new_label();
    let join = b.new_label();

    b.int_const(g, 0);
    b.int_const(i, 0);
    b.int_const(s, 0);
    b.bind(header);
    b.jit_merge_point(&[g], &[i, s], &[], &[]);
    b.int_const(lim, 400);
    b.int_lt(cond, i, lim);
    b.goto_if_not(done, cond);
    b.int_const(one, 1);
    b.int_and(parity, i, one);
    b.goto_if_not(even, parity);
    b.int_const(step, 2);
    b.int_add(s, s, step);
    b.goto(join);
    b.bind(even);
    b.int_const(step, 1);
    b.int_add(s, s, step);
    b.bind(join);
    b.int_const(one, 1);
    b.int_add(i, i, one);
    b.can_enter_jit(&[g], &[i, s], &[], &[]);
    b.goto(header);
    b.bind(done);
    b.int_return(s);

    let main = pb.add_jitcode(b.finish());
    (pb.finish(), main)
}

/// Accumulates `(i64::MAX - 50) + i` with overflow checking; the
/// overflow at `i == 51` is caught and the function returns -1.
pub fn overflow_loop() -> (Rc<Program>, usize) {
    let mut pb = ProgramBuilder::new();
    let mut b = JitCodeBuilder::new("overflow_loop", Some(Kind::Int));
    let g = b.new_reg_i();
    let i = b.new_reg_i();
    let s = b.new_reg_i();
    let big = b.new_reg_i();
    let lim = b.new_reg_i();
    let cond = b.new_reg_i();
    let t = b.new_reg_i();
    let one = b.new_reg_i();
    let fail = b.new_reg_i();
    let exc = b.new_reg_r();
    let header = b.new_label();
    let done = b.new_label();
    let handler = b.new_label();

    b.int_const(g, 0);
    b.int_const(i, 0);
    b.int_const(s, 0);
    b.int_const(big, i64::MAX - 50);
    b.bind(header);
    b.jit_merge_point(&[g], &[i, s, big], &[], &[]);
    b.int_const(lim, 100);
    b.int_lt(cond, i, lim);
    b.goto_if_not(done, cond);
    b.int_add_ovf(t, big, i);
    b.catch_exception(handler);
    b.int_add(s, s, t);
    b.int_const(one, 1);
    b.int_add(i, i, one);
    b.can_enter_jit(&[g], &[i, s, big], &[], &[]);
    b.goto(header);
    b.bind(handler);
    b.last_exc_value(exc);
    b.int_const(fail, -1);
    b.int_return(fail);
    b.bind(done);
    b.int_return(s);

    let main = pb.add_jitcode(b.finish());
    (pb.finish(), main)
}

/// Reads the same pure field twice per iteration; takes the object as an
/// argument. Returns the program, the function, and a fresh object.
pub fn pure_field_sum() -> (Rc<Program>, usize, GcRef) {
    let mut pb = ProgramBuilder::new();
    let cls = pb.add_class("Cell", vec![Kind::Int]);
    let field = pb.field_descr(cls, 0);

    let mut b = JitCodeBuilder::new("pure_field_sum", Some(Kind::Int));
    let obj = b.new_reg_r();
    let g = b.new_reg_i();
    let i = b.new_reg_i();
    let s = b.new_reg_i();
    let lim = b.new_reg_i();
    let cond = b.new_reg_i();
    let first = b.new_reg_i();
    let second = b.new_reg_i();
    let t = b.new_reg_i();
    let one = b.new_reg_i();
    let header = b.new_label();
    let done = b.new_label();

    b.int_const(g, 0);
    b.int_const(i, 0);
    b.int_const(s, 0);
    b.bind(header);
    b.jit_merge_point(&[g], &[i, s], &[obj], &[]);
    b.int_const(lim, 100);
    b.int_lt(cond, i, lim);
    b.goto_if_not(done, cond);
    b.getfield_gc_pure_i(first, obj, field.clone());
    b.getfield_gc_pure_i(second, obj, field.clone());
    b.int_add(t, first, second);
    b.int_add(s, s, t);
    b.int_const(one, 1);
    b.int_add(i, i, one);
    b.can_enter_jit(&[g], &[i, s], &[obj], &[]);
    b.goto(header);
    b.bind(done);
    b.int_return(s);

    let main = pb.add_jitcode(b.finish());
    let target = GcRef::alloc_struct(1, &[Kind::Int], Some(cls));
    target.set_field(0, RawValue::Int(7));
    (pb.finish(), main, target)
}

/// Promotes its argument and multiplies by it every iteration.
pub fn promoting_loop() -> (Rc<Program>, usize) {
    let mut pb = ProgramBuilder::new();
    let mut b = JitCodeBuilder::new("promoting_loop", Some(Kind::Int));
    let x = b.new_reg_i(); // the argument lands in the first int register
    let g = b.new_reg_i();
    let i = b.new_reg_i();
    let s = b.new_reg_i();
    let lim = b.new_reg_i();
    let cond = b.new_reg_i();
    let px = b.new_reg_i();
    let two = b.new_reg_i();
    let t = b.new_reg_i();
    let one = b.new_reg_i();
    let header = b.new_label();
    let done = b.new_label();

    b.int_const(g, 0);
    b.int_const(i, 0);
    b.int_const(s, 0);
    b.bind(header);
    b.jit_merge_point(&[g], &[i, s, x], &[], &[]);
    b.int_const(lim, 100);
    b.int_lt(cond, i, lim);
    b.goto_if_not(done, cond);
    b.promote(px, x);
    b.int_const(two, 2);
    b.int_mul(t, px, two);
    b.int_add(s, s, t);
    b.int_const(one, 1);
    b.int_add(i, i, one);
    b.can_enter_jit(&[g], &[i, s, x], &[], &[]);
    b.goto(header);
    b.bind(done);
    b.int_return(s);

    let main = pb.add_jitcode(b.finish());
    (pb.finish(), main)
}

/// A loop whose body goes through an inlined guest call.
pub fn inlined_call_loop() -> (Rc<Program>, usize) {
    let mut pb = ProgramBuilder::new();

    let mut cb = JitCodeBuilder::new("double", Some(Kind::Int));
    let x = cb.new_reg_i();
    let r = cb.new_reg_i();
    cb.int_add(r, x, x);
    cb.int_return(r);
    let double = pb.add_jitcode(cb.finish());

    let mut b = JitCodeBuilder::new("inlined_call_loop", Some(Kind::Int));
    let g = b.new_reg_i();
    let i = b.new_reg_i();
    let s = b.new_reg_i();
    let lim = b.new_reg_i();
    let cond = b.new_reg_i();
    let t = b.new_reg_i();
    let one = b.new_reg_i();
    let header = b.new_label();
    let done = b.new_label();

    b.int_const(g, 0);
    b.int_const(i, 0);
    b.int_const(s, 0);
    b.bind(header);
    b.jit_merge_point(&[g], &[i, s], &[], &[]);
    b.int_const(lim, 100);
    b.int_lt(cond, i, lim);
    b.goto_if_not(done, cond);
    b.inline_call(Some(t.0), double, &[i], &[], &[], Some(Kind::Int));
    b.int_add(s, s, t);
    b.int_const(one, 1);
    b.int_add(i, i, one);
    b.can_enter_jit(&[g], &[i, s], &[], &[]);
    b.goto(header);
    b.bind(done);
    b.int_return(s);

    let main = pb.add_jitcode(b.finish());
    (pb.finish(), main)
}

/// Virtualizable counter object poked by a may-force residual call that
/// escapes the virtualizable after 150 calls. Returns the program, the
/// function, the counter field descr, and a fresh object.
pub fn virtualizable_loop() -> (Rc<Program>, usize, Rc<FieldDescr>, GcRef) {
    let mut pb = ProgramBuilder::new();
    let cls = pb.add_class("Counter", vec![Kind::Int]);
    let field = pb.field_descr(cls, 0);

    let calls = Rc::new(Cell::new(0u32));
    let poke: ResidualFn = Rc::new(move |ctx, args| {
        let n = calls.get() + 1;
        calls.set(n);
        if n >= 150 {
            let obj = args[0].as_ref();
            obj.set_field(0, RawValue::Int(obj.get_field(0).as_int() + 1000));
            ctx.signal_force();
        }
        Ok(None)
    });
    let poke_id = pb.register_function("poke", poke);
    let poke_descr = pb.call_descr(vec![Kind::Ref], None, CallEffect::MayForce);

    let mut b = JitCodeBuilder::new("virtualizable_loop", Some(Kind::Int));
    let vable = b.new_reg_r();
    let g = b.new_reg_i();
    let i = b.new_reg_i();
    let lim = b.new_reg_i();
    let cond = b.new_reg_i();
    let count = b.new_reg_i();
    let one = b.new_reg_i();
    let bumped = b.new_reg_i();
    let result = b.new_reg_i();
    let header = b.new_label();
    let done = b.new_label();

    b.int_const(g, 0);
    b.int_const(i, 0);
    b.bind(header);
    b.jit_merge_point(&[g], &[i], &[vable], &[]);
    b.int_const(lim, 200);
    b.int_lt(cond, i, lim);
    b.goto_if_not(done, cond);
    b.getfield_vable_i(count, vable, field.clone());
    b.int_const(one, 1);
    b.int_add(bumped, count, one);
    b.setfield_vable_i(vable, field.clone(), bumped);
    b.residual_call_may_force(None, poke_descr, poke_id, &[], &[vable], &[]);
    b.int_const(one, 1);
    b.int_add(i, i, one);
    b.can_enter_jit(&[g], &[i], &[vable], &[]);
    b.goto(header);
    b.bind(done);
    b.getfield_vable_i(result, vable, field.clone());
    b.int_return(result);

    let main = pb.add_jitcode(b.finish());
    let obj = GcRef::alloc_struct(1, &[Kind::Int], Some(cls));
    (pb.finish(), main, field, obj)
}

/// A driver tuned for quick tests.
pub fn quick_driver(threshold: u32) -> JitDriver {
    let mut driver = JitDriver::new();
    driver.set_param("threshold", &threshold.to_string());
    driver
}
