//! End-to-end JIT scenarios: the full pipeline from guest jitcode
//! through tracing, optimization, compilation on the portable back-end,
//! guard failure, and bridging.

mod common;

use common::*;
use sable_engine::ir::ops::OpNum;
use sable_engine::{run_function, ConstVal, JitDriver, RawValue};

fn int_result(result: Option<RawValue>) -> i64 {
    match result {
        Some(RawValue::Int(v)) => v,
        other => panic!("expected an int result, got {other:?}"),
    }
}

/// Operation names of the installed loop for the given greens, with the
/// merge-point markers stripped.
fn loop_op_names(driver: &JitDriver, greens: &[ConstVal]) -> Vec<&'static str> {
    let token = driver
        .loop_token_for(greens)
        .expect("no loop installed for greens");
    driver
        .backend()
        .trace_ops(token.entry)
        .iter()
        .filter(|op| op.opnum != OpNum::DebugMergePoint)
        .map(|op| op.opnum.name())
        .collect()
}

#[test]
fn test_sum_loop_compiles_and_computes() {
    let (program, main) = sum_loop();
    let mut driver = quick_driver(10);

    let result = run_function(&program, Some(&mut driver), main, &[]).unwrap();
    assert_eq!(int_result(result), 4950);

    assert_eq!(driver.stats.loops_compiled, 1);
    assert!(driver.stats.native_entries >= 1);

    // the residual loop body: compare+guard, two adds, and the closing jump
    let names = loop_op_names(&driver, &[ConstVal::Int(0)]);
    assert_eq!(
        names,
        vec!["int_lt", "guard_true", "int_add", "int_add", "jump"]
    );
}

#[test]
fn test_sum_loop_trace_is_bounded() {
    let (program, main) = sum_loop();
    let mut driver = quick_driver(10);
    let result = run_function(&program, Some(&mut driver), main, &[]).unwrap();
    assert_eq!(int_result(result), 4950);

    let token = driver.loop_token_for(&[ConstVal::Int(0)]).unwrap();
    let ops = driver.backend().trace_ops(token.entry);
    assert!(ops.len() <= driver.params().trace_limit);
}

#[test]
fn test_guard_failure_grows_bridge() {
    let (program, main) = rare_branch();
    let mut driver = quick_driver(10);
    driver.set_param("bridge_threshold", "1");

    let result = run_function(&program, Some(&mut driver), main, &[]).unwrap();
    // 199 ordinary iterations plus the single 1000 step
    assert_eq!(int_result(result), 1199);

    assert_eq!(driver.stats.loops_compiled, 1);
    assert_eq!(driver.stats.bridges_compiled, 1);
}

#[test]
fn test_bridge_takes_over_hot_guard() {
    let (program, main) = parity_sum();
    let mut driver = quick_driver(8);
    driver.set_param("bridge_threshold", "3");

    let result = run_function(&program, Some(&mut driver), main, &[]).unwrap();
    assert_eq!(int_result(result), 600);

    assert_eq!(driver.stats.bridges_compiled, 1);
    // once the bridge is in, the alternating guard no longer exits; only
    // a handful of failures happen around warmup and the final exit
    assert!(
        driver.stats.guard_failures < 20,
        "bridge did not take over: {} guard failures",
        driver.stats.guard_failures
    );
}

#[test]
fn test_overflow_guard_raises_in_guest() {
    let (program, main) = overflow_loop();
    let mut driver = quick_driver(10);

    let result = run_function(&program, Some(&mut driver), main, &[]).unwrap();
    assert_eq!(int_result(result), -1);

    // the trace carries the checked add and its overflow guard
    let names = loop_op_names(&driver, &[ConstVal::Int(0)]);
    assert!(names.contains(&"int_add_ovf"));
    assert!(names.contains(&"guard_no_overflow"));
}

#[test]
fn test_pure_field_reads_are_cse_d() {
    let (program, main, obj) = pure_field_sum();
    let mut driver = quick_driver(10);

    let result = run_function(
        &program,
        Some(&mut driver),
        main,
        &[RawValue::Ref(obj)],
    )
    .unwrap();
    assert_eq!(int_result(result), 100 * 14);

    let names = loop_op_names(&driver, &[ConstVal::Int(0)]);
    let loads = names.iter().filter(|n| **n == "getfield_gc_pure").count();
    assert_eq!(loads, 1, "duplicate pure load survived: {names:?}");
}

#[test]
fn test_promotion_freezes_value_into_trace() {
    let (program, main) = promoting_loop();
    let mut driver = quick_driver(10);

    let result = run_function(&program, Some(&mut driver), main, &[RawValue::Int(3)]).unwrap();
    assert_eq!(int_result(result), 600);

    let names = loop_op_names(&driver, &[ConstVal::Int(0)]);
    assert!(names.contains(&"guard_value"));
    // the multiply folded away against the promoted constant
    assert!(!names.contains(&"int_mul"));
}

#[test]
fn test_promotion_guard_fails_on_other_value() {
    let (program, main) = promoting_loop();
    let mut driver = quick_driver(10);

    // warm up and compile with x == 3
    let first = run_function(&program, Some(&mut driver), main, &[RawValue::Int(3)]).unwrap();
    assert_eq!(int_result(first), 600);
    let failures_before = driver.stats.guard_failures;

    // re-enter with x == 5: the promoted guard fails, resume data
    // reconstructs the frame, and the interpreter computes the answer
    let second = run_function(&program, Some(&mut driver), main, &[RawValue::Int(5)]).unwrap();
    assert_eq!(int_result(second), 1000);
    assert!(driver.stats.guard_failures > failures_before);
}

#[test]
fn test_inlined_guest_call_traces_through() {
    let (program, main) = inlined_call_loop();
    let mut driver = quick_driver(10);

    let result = run_function(&program, Some(&mut driver), main, &[]).unwrap();
    assert_eq!(int_result(result), 9900);

    assert_eq!(driver.stats.loops_compiled, 1);
    assert_eq!(driver.stats.aborts_nested, 0);
    // the callee's add was inlined into the trace: two adds plus the
    // inlined double
    let names = loop_op_names(&driver, &[ConstVal::Int(0)]);
    assert_eq!(names.iter().filter(|n| **n == "int_add").count(), 3);
}

#[test]
fn test_virtualizable_force_supplies_updated_fields() {
    let (program, main, field, obj) = virtualizable_loop();
    let mut driver = quick_driver(10);
    driver.set_virtualizable(vec![field]);

    let result = run_function(
        &program,
        Some(&mut driver),
        main,
        &[RawValue::Ref(obj.clone())],
    )
    .unwrap();
    // 200 increments, plus 1000 per forcing poke (calls 150..=200)
    assert_eq!(int_result(result), 200 + 51 * 1000);
    assert_eq!(obj.get_field(0), RawValue::Int(200 + 51 * 1000));

    // the loop compiled before any forcing began and stayed valid
    assert_eq!(driver.stats.loops_compiled, 1);
    assert_eq!(driver.stats.aborts_forced, 0);
    assert!(driver.stats.guard_failures > 0);
}

#[test]
fn test_trace_limit_blackholes_and_gives_up() {
    let (program, main) = sum_loop();
    let mut driver = quick_driver(10);
    driver.set_param("trace_limit", "3");

    let result = run_function(&program, Some(&mut driver), main, &[]).unwrap();
    assert_eq!(int_result(result), 4950);

    assert_eq!(driver.stats.loops_compiled, 0);
    assert!(driver.stats.aborts_trace_too_long >= 1);
    // the greens were marked as not worth tracing again
    assert_eq!(driver.stats.traces_started, 1);
}

#[test]
fn test_interpreter_only_baseline() {
    let (program, main) = sum_loop();
    let result = run_function::<sable_engine::PortableBackend>(&program, None, main, &[]).unwrap();
    assert_eq!(int_result(result), 4950);
}
