//! Portable back-end: direct evaluation of optimized traces
//!
//! "Compiling" retains the operation list; executing walks it with an
//! environment mapping boxes to concrete values, sharing semantics with
//! the recorder through `ir::execute`. Bridges attach to their guard by
//! descr identity: when a guard with a bridge fails, execution rebinds
//! the bridge's input boxes from the failargs values and continues
//! without leaving the back-end, so a patched guard never falls back to
//! the interpreter.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use super::traits::{NativeExit, TraceBackend, TraceToken};
use crate::error::{CompileError, ExecError, GuestException};
use crate::heap::{ClassId, RawValue};
use crate::ir::boxes::{Operand, TraceBox};
use crate::ir::descr::DescrRef;
use crate::ir::execute::{execute_op, ExecContext, ForceToken};
use crate::ir::ops::{OpNum, Operation};
use crate::jitcode::Program;

struct CompiledTrace {
    /// Loop inputs, or bridge inputs paired with their failargs slot
    inputargs: Vec<TraceBox>,
    slots: Option<Vec<u32>>,
    operations: Rc<Vec<Operation>>,
    jump_target: TraceToken,
}

pub struct PortableBackend {
    loops: Vec<CompiledTrace>,
    bridges: FxHashMap<usize, CompiledTrace>,
}

impl PortableBackend {
    pub fn new() -> PortableBackend {
        PortableBackend {
            loops: vec![],
            bridges: FxHashMap::default(),
        }
    }

    /// The retained operations of a compiled loop (diagnostics and tests)
    pub fn trace_ops(&self, token: TraceToken) -> &[Operation] {
        &self.loops[token.0].operations
    }
}

impl Default for PortableBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Evaluate an operand against the execution environment.
fn eval(env: &FxHashMap<TraceBox, RawValue>, operand: &Operand) -> RawValue {
    match operand {
        Operand::Const(c) => c.value(),
        Operand::Box(b) => env
            .get(b)
            .cloned()
            .expect("trace argument box has no value"),
    }
}

impl TraceBackend for PortableBackend {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn compile_loop(
        &mut self,
        _program: &Rc<Program>,
        inputargs: &[TraceBox],
        operations: Vec<Operation>,
    ) -> Result<TraceToken, CompileError> {
        let token = TraceToken(self.loops.len());
        self.loops.push(CompiledTrace {
            inputargs: inputargs.to_vec(),
            slots: None,
            operations: Rc::new(operations),
            jump_target: token,
        });
        Ok(token)
    }

    fn compile_bridge(
        &mut self,
        _program: &Rc<Program>,
        guard: &DescrRef,
        inputargs: &[(u32, TraceBox)],
        operations: Vec<Operation>,
        target: TraceToken,
    ) -> Result<(), CompileError> {
        let (slots, boxes): (Vec<u32>, Vec<TraceBox>) = inputargs.iter().cloned().unzip();
        self.bridges.insert(
            guard.address(),
            CompiledTrace {
                inputargs: boxes,
                slots: Some(slots),
                operations: Rc::new(operations),
                jump_target: target,
            },
        );
        Ok(())
    }

    fn has_bridge(&self, guard: &DescrRef) -> bool {
        self.bridges.contains_key(&guard.address())
    }

    fn execute(
        &mut self,
        program: &Rc<Program>,
        token: TraceToken,
        args: &[RawValue],
    ) -> NativeExit {
        let mut env: FxHashMap<TraceBox, RawValue> = FxHashMap::default();
        let trace = &self.loops[token.0];
        assert_eq!(trace.inputargs.len(), args.len(), "argument shape mismatch");
        for (b, v) in trace.inputargs.iter().zip(args) {
            debug_assert_eq!(b.kind(), v.kind(), "wrong-kind value entering trace");
            env.insert(b.clone(), v.clone());
        }
        let mut operations = trace.operations.clone();
        let mut jump_target = trace.jump_target;

        let mut pending_exc: Option<GuestException> = None;
        let mut overflowed = false;
        let mut force: Option<Rc<ForceToken>> = None;
        let mut index = 0;

        loop {
            let op = &operations[index];
            match op.opnum {
                OpNum::Label | OpNum::DebugMergePoint => {}

                OpNum::Jump => {
                    let values: Vec<RawValue> =
                        op.args.iter().map(|a| eval(&env, a)).collect();
                    let target = &self.loops[jump_target.0];
                    env.clear();
                    for (b, v) in target.inputargs.iter().zip(values) {
                        env.insert(b.clone(), v);
                    }
                    operations = target.operations.clone();
                    jump_target = target.jump_target;
                    index = 0;
                    continue;
                }

                opnum if opnum.is_guard() => {
                    let holds = match opnum {
                        OpNum::GuardTrue => eval(&env, &op.args[0]).as_int() != 0,
                        OpNum::GuardFalse => eval(&env, &op.args[0]).as_int() == 0,
                        OpNum::GuardValue => {
                            eval(&env, &op.args[0]) == eval(&env, &op.args[1])
                        }
                        OpNum::GuardClass => {
                            let class = eval(&env, &op.args[1]).as_int();
                            eval(&env, &op.args[0]).as_ref().class()
                                == Some(ClassId(class as u32))
                        }
                        OpNum::GuardNonnull => !eval(&env, &op.args[0]).as_ref().is_null(),
                        OpNum::GuardIsnull => eval(&env, &op.args[0]).as_ref().is_null(),
                        OpNum::GuardNoException => pending_exc.is_none(),
                        OpNum::GuardException => {
                            let class = ClassId(eval(&env, &op.args[0]).as_int() as u32);
                            let matches = pending_exc
                                .as_ref()
                                .is_some_and(|exc| exc.value.class() == Some(class));
                            if matches {
                                let exc = pending_exc.take().unwrap();
                                if let Some(result) = &op.result {
                                    env.insert(result.clone(), RawValue::Ref(exc.value));
                                }
                            }
                            matches
                        }
                        OpNum::GuardNoOverflow => {
                            let was = overflowed;
                            overflowed = false;
                            !was
                        }
                        OpNum::GuardOverflow => {
                            let was = overflowed;
                            overflowed = false;
                            was
                        }
                        OpNum::GuardNotForced => {
                            !force.take().map(|t| t.forced.get()).unwrap_or(false)
                        }
                        _ => unreachable!(),
                    };

                    if !holds {
                        let descr = op.descr.clone().expect("guard without resume descr");
                        let guard = descr.as_resume_guard();
                        let values: Vec<RawValue> = guard
                            .failargs()
                            .iter()
                            .map(|slot| eval(&env, slot))
                            .collect();

                        if let Some(bridge) = self.bridges.get(&descr.address()) {
                            let slots = bridge.slots.as_ref().expect("bridge without slots");
                            let mut next_env = FxHashMap::default();
                            for (b, &slot) in bridge.inputargs.iter().zip(slots) {
                                next_env.insert(b.clone(), values[slot as usize].clone());
                            }
                            env = next_env;
                            operations = bridge.operations.clone();
                            jump_target = bridge.jump_target;
                            pending_exc = None;
                            overflowed = false;
                            index = 0;
                            continue;
                        }

                        return NativeExit::GuardFailed {
                            descr,
                            values,
                            exception: pending_exc.take(),
                        };
                    }
                }

                OpNum::IntAddOvf | OpNum::IntSubOvf | OpNum::IntMulOvf => {
                    let a = eval(&env, &op.args[0]).as_int();
                    let b = eval(&env, &op.args[1]).as_int();
                    let (wrapped, did_overflow) = match op.opnum {
                        OpNum::IntAddOvf => a.overflowing_add(b),
                        OpNum::IntSubOvf => a.overflowing_sub(b),
                        _ => a.overflowing_mul(b),
                    };
                    overflowed = did_overflow;
                    if let Some(result) = &op.result {
                        env.insert(result.clone(), RawValue::Int(wrapped));
                    }
                }

                opnum if opnum.can_raise() => {
                    let values: Vec<RawValue> =
                        op.args.iter().map(|a| eval(&env, a)).collect();
                    let token = if opnum == OpNum::CallMayForce {
                        let t = Rc::new(ForceToken::default());
                        force = Some(t.clone());
                        Some(t)
                    } else {
                        None
                    };
                    let ctx = ExecContext {
                        program,
                        force: token,
                    };
                    match execute_op(&ctx, opnum, &values, op.descr.as_ref()) {
                        Ok(value) => {
                            if let (Some(result), Some(v)) = (&op.result, value) {
                                env.insert(result.clone(), v);
                            }
                        }
                        Err(ExecError::Raise(exc)) => {
                            pending_exc = Some(exc);
                            if let Some(result) = &op.result {
                                env.insert(
                                    result.clone(),
                                    RawValue::default_of(result.kind()),
                                );
                            }
                        }
                        Err(_) => panic!("residual call reported a non-guest error"),
                    }
                }

                _ => {
                    let values: Vec<RawValue> =
                        op.args.iter().map(|a| eval(&env, a)).collect();
                    let ctx = ExecContext::new(program);
                    let value = execute_op(&ctx, op.opnum, &values, op.descr.as_ref())
                        .expect("non-raising operation failed in compiled trace");
                    if let (Some(result), Some(v)) = (&op.result, value) {
                        env.insert(result.clone(), v);
                    }
                }
            }
            index += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::boxes::ConstVal;
    use crate::jitcode::ProgramBuilder;
    use crate::resume::{capture_resumedata, ResumeGuardDescr};

    /// i < limit loop: { guard_true(i < 100); total += i; i += 1; jump }
    fn counting_loop(
        backend: &mut PortableBackend,
        program: &Rc<Program>,
    ) -> (TraceToken, DescrRef) {
        let i = TraceBox::new_int(0);
        let total = TraceBox::new_int(0);
        let cond = TraceBox::new_int(1);
        let total2 = TraceBox::new_int(0);
        let i2 = TraceBox::new_int(0);

        let guard = Rc::new(ResumeGuardDescr::new(OpNum::GuardTrue));
        // minimal capture so failargs exist: i and total live
        {
            use crate::jitcode::JitCodeBuilder;
            use crate::meta::frame::FramePool;
            let mut b = JitCodeBuilder::new("loop", None);
            b.new_reg_i();
            b.new_reg_i();
            b.new_reg_i();
            let code = Rc::new(b.finish());
            let mut pool = FramePool::new();
            let mut frame = pool.alloc(code, 0);
            frame.set_reg(crate::heap::Kind::Int, 0, Operand::Box(i.clone()));
            frame.set_reg(crate::heap::Kind::Int, 1, Operand::Box(total.clone()));
            frame.set_reg(crate::heap::Kind::Int, 2, Operand::Box(cond.clone()));
            capture_resumedata(&[frame], None, &[], &guard);
        }
        let descr = DescrRef::ResumeGuard(guard);

        let operations = vec![
            Operation::new(
                OpNum::IntLt,
                vec![Operand::Box(i.clone()), Operand::Const(ConstVal::Int(100))],
                Some(cond.clone()),
                None,
            ),
            Operation::new(
                OpNum::GuardTrue,
                vec![Operand::Box(cond)],
                None,
                Some(descr.clone()),
            ),
            Operation::new(
                OpNum::IntAdd,
                vec![Operand::Box(total.clone()), Operand::Box(i.clone())],
                Some(total2.clone()),
                None,
            ),
            Operation::new(
                OpNum::IntAdd,
                vec![Operand::Box(i.clone()), Operand::Const(ConstVal::Int(1))],
                Some(i2.clone()),
                None,
            ),
            Operation::new(
                OpNum::Jump,
                vec![Operand::Box(i2), Operand::Box(total2)],
                None,
                None,
            ),
        ];
        let token = backend
            .compile_loop(program, &[i, total], operations)
            .unwrap();
        (token, descr)
    }

    #[test]
    fn test_loop_runs_until_guard_fails() {
        let program = ProgramBuilder::new().finish();
        let mut backend = PortableBackend::new();
        let (token, descr) = counting_loop(&mut backend, &program);

        let exit = backend.execute(&program, token, &[RawValue::Int(0), RawValue::Int(0)]);
        let NativeExit::GuardFailed {
            descr: failed,
            values,
            exception,
        } = exit;
        assert_eq!(failed, descr);
        assert!(exception.is_none());
        // failargs are [i, total, cond]; at exit i == 100, sum == 4950
        assert_eq!(values[0], RawValue::Int(100));
        assert_eq!(values[1], RawValue::Int(4950));
        assert_eq!(values[2], RawValue::Int(0));
    }

    #[test]
    fn test_bridge_takes_over_failing_guard() {
        let program = ProgramBuilder::new().finish();
        let mut backend = PortableBackend::new();
        let (token, descr) = counting_loop(&mut backend, &program);

        // bridge: reset i to 0, keep total, re-enter the loop; exits via a
        // fresh guard once total exceeds a bound
        let bi = TraceBox::new_int(0);
        let bt = TraceBox::new_int(0);
        let bcond = TraceBox::new_int(0);
        let bridge_guard = Rc::new(ResumeGuardDescr::new(OpNum::GuardFalse));
        {
            use crate::jitcode::JitCodeBuilder;
            use crate::meta::frame::FramePool;
            let mut b = JitCodeBuilder::new("bridge", None);
            b.new_reg_i();
            let code = Rc::new(b.finish());
            let mut pool = FramePool::new();
            let mut frame = pool.alloc(code, 0);
            frame.set_reg(crate::heap::Kind::Int, 0, Operand::Box(bt.clone()));
            capture_resumedata(&[frame], None, &[], &bridge_guard);
        }
        let bridge_descr = DescrRef::ResumeGuard(bridge_guard);

        let operations = vec![
            Operation::new(
                OpNum::IntGt,
                vec![Operand::Box(bt.clone()), Operand::Const(ConstVal::Int(5000))],
                Some(bcond.clone()),
                None,
            ),
            Operation::new(
                OpNum::GuardFalse,
                vec![Operand::Box(bcond)],
                None,
                Some(bridge_descr.clone()),
            ),
            Operation::new(
                OpNum::Jump,
                vec![Operand::Const(ConstVal::Int(0)), Operand::Box(bt.clone())],
                None,
                None,
            ),
        ];
        backend
            .compile_bridge(&program, &descr, &[(0, bi), (1, bt)], operations, token)
            .unwrap();
        assert!(backend.has_bridge(&descr));

        let exit = backend.execute(&program, token, &[RawValue::Int(0), RawValue::Int(0)]);
        let NativeExit::GuardFailed { descr: failed, values, .. } = exit;
        // control left through the bridge's guard, not the loop guard
        assert_eq!(failed, bridge_descr);
        assert_eq!(values[0], RawValue::Int(9900)); // 4950 * 2
    }
}
