//! Observational equivalence: for every guest program, running with the
//! JIT engaged yields the same output as the plain interpreter, for any
//! threshold, trace limit, and optimizer selection.

mod common;

use std::rc::Rc;

use common::*;
use sable_engine::jitcode::Program;
use sable_engine::{run_function, JitDriver, PortableBackend, RawValue};

const THRESHOLDS: [u32; 3] = [1, 3, 17];
const TRACE_LIMITS: [usize; 2] = [50, 6000];
const OPT_SELECTIONS: [&str; 3] = ["", "fold", "fold,cse,guards,fuse"];

fn interpret(program: &Rc<Program>, main: usize, args: &[RawValue]) -> Option<RawValue> {
    run_function::<PortableBackend>(program, None, main, args).expect("interpreter raised")
}

fn assert_equivalent(build: impl Fn() -> (Rc<Program>, usize, Vec<RawValue>)) {
    let (program, main, args) = build();
    let expected = interpret(&program, main, &args);

    for threshold in THRESHOLDS {
        for trace_limit in TRACE_LIMITS {
            for opts in OPT_SELECTIONS {
                // fresh program per configuration: residual functions may
                // carry state
                let (program, main, args) = build();
                let mut driver = JitDriver::new();
                driver.set_param("threshold", &threshold.to_string());
                driver.set_param("trace_limit", &trace_limit.to_string());
                driver.set_param("enable_opts", opts);

                let jitted = run_function(&program, Some(&mut driver), main, &args)
                    .expect("jitted run raised");
                assert_eq!(
                    jitted, expected,
                    "divergence at threshold={threshold} trace_limit={trace_limit} opts={opts:?}"
                );
            }
        }
    }
}

#[test]
fn test_sum_loop_equivalence() {
    assert_equivalent(|| {
        let (program, main) = sum_loop();
        (program, main, vec![])
    });
}

#[test]
fn test_rare_branch_equivalence() {
    assert_equivalent(|| {
        let (program, main) = rare_branch();
        (program, main, vec![])
    });
}

#[test]
fn test_parity_sum_equivalence() {
    assert_equivalent(|| {
        let (program, main) = parity_sum();
        (program, main, vec![])
    });
}

#[test]
fn test_overflow_equivalence() {
    assert_equivalent(|| {
        let (program, main) = overflow_loop();
        (program, main, vec![])
    });
}

#[test]
fn test_pure_field_equivalence() {
    assert_equivalent(|| {
        let (program, main, obj) = pure_field_sum();
        (program, main, vec![RawValue::Ref(obj)])
    });
}

#[test]
fn test_promotion_equivalence() {
    assert_equivalent(|| {
        let (program, main) = promoting_loop();
        (program, main, vec![RawValue::Int(3)])
    });
    assert_equivalent(|| {
        let (program, main) = promoting_loop();
        (program, main, vec![RawValue::Int(-9)])
    });
}

#[test]
fn test_inlined_call_equivalence() {
    assert_equivalent(|| {
        let (program, main) = inlined_call_loop();
        (program, main, vec![])
    });
}

#[test]
fn test_virtualizable_equivalence() {
    // compared separately: the virtualizable declaration must accompany
    // every jitted run
    let (program, main, _, obj) = virtualizable_loop();
    let expected = interpret(&program, main, &[RawValue::Ref(obj)]);

    for threshold in THRESHOLDS {
        let (program, main, field, obj) = virtualizable_loop();
        let mut driver = JitDriver::new();
        driver.set_param("threshold", &threshold.to_string());
        driver.set_virtualizable(vec![field]);
        let jitted = run_function(&program, Some(&mut driver), main, &[RawValue::Ref(obj)])
            .expect("jitted run raised");
        assert_eq!(jitted, expected, "divergence at threshold={threshold}");
    }
}

#[test]
fn test_bridged_runs_match_interpreter() {
    let (program, main) = parity_sum();
    let expected = interpret(&program, main, &[]);

    for bridge_threshold in [1, 2, 5] {
        let (program, main) = parity_sum();
        let mut driver = JitDriver::new();
        driver.set_param("threshold", "5");
        driver.set_param("bridge_threshold", &bridge_threshold.to_string());
        let jitted =
            run_function(&program, Some(&mut driver), main, &[]).expect("jitted run raised");
        assert_eq!(jitted, expected, "divergence at bridge_threshold={bridge_threshold}");
    }
}
