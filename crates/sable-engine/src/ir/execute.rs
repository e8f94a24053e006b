//! Concrete execution of trace operations
//!
//! Both the meta-interpreter (while recording) and the portable back-end
//! (while running compiled traces) evaluate operations through this one
//! routine, so the two agree on semantics by construction.
//!
//! Integer arithmetic wraps except for the `_ovf` variants, which report
//! overflow for the surrounding guard to handle. Division semantics are
//! truncating; the guest code writer emits zero-division and
//! division-overflow checks ahead of every division.

use std::cell::Cell;
use std::rc::Rc;

use crate::error::ExecError;
use crate::heap::{GcRef, Kind, RawValue};
use crate::ir::descr::DescrRef;
use crate::ir::ops::OpNum;
use crate::jitcode::Program;

/// Set by a residual callee to report that it forced the virtualizable
/// state of its caller; checked by the `guard_not_forced` that follows
/// every may-force call.
#[derive(Debug, Default)]
pub struct ForceToken {
    pub forced: Cell<bool>,
}

/// Everything a residual call can see of its host.
pub struct ExecContext<'a> {
    pub program: &'a Program,
    /// Present while a may-force call is in flight
    pub force: Option<Rc<ForceToken>>,
}

impl<'a> ExecContext<'a> {
    pub fn new(program: &'a Program) -> ExecContext<'a> {
        ExecContext {
            program,
            force: None,
        }
    }

    /// Called by a residual callee that escapes a virtualizable
    pub fn signal_force(&self) {
        if let Some(token) = &self.force {
            token.forced.set(true);
        }
    }
}

fn int_cmp(v: bool) -> Option<RawValue> {
    Some(RawValue::Int(v as i64))
}

fn shift_count(b: i64) -> u32 {
    (b & 63) as u32
}

/// Evaluate one operation on concrete values. Guards, jumps, and labels
/// are control flow and never reach this function.
pub fn execute_op(
    ctx: &ExecContext<'_>,
    opnum: OpNum,
    args: &[RawValue],
    descr: Option<&DescrRef>,
) -> Result<Option<RawValue>, ExecError> {
    let int = |i: usize| args[i].as_int();
    let float = |i: usize| args[i].as_float();
    let gcref = |i: usize| args[i].as_ref();

    let result = match opnum {
        OpNum::IntAdd => Some(RawValue::Int(int(0).wrapping_add(int(1)))),
        OpNum::IntSub => Some(RawValue::Int(int(0).wrapping_sub(int(1)))),
        OpNum::IntMul => Some(RawValue::Int(int(0).wrapping_mul(int(1)))),
        OpNum::IntFloordiv => {
            let b = int(1);
            if b == 0 {
                return Err(ExecError::DivByZero);
            }
            Some(RawValue::Int(int(0).wrapping_div(b)))
        }
        OpNum::IntMod => {
            let b = int(1);
            if b == 0 {
                return Err(ExecError::DivByZero);
            }
            Some(RawValue::Int(int(0).wrapping_rem(b)))
        }
        OpNum::IntAnd => Some(RawValue::Int(int(0) & int(1))),
        OpNum::IntOr => Some(RawValue::Int(int(0) | int(1))),
        OpNum::IntXor => Some(RawValue::Int(int(0) ^ int(1))),
        OpNum::IntLshift => Some(RawValue::Int(int(0).wrapping_shl(shift_count(int(1))))),
        OpNum::IntRshift => Some(RawValue::Int(int(0) >> shift_count(int(1)))),
        OpNum::UintRshift => Some(RawValue::Int(
            ((int(0) as u64) >> shift_count(int(1))) as i64,
        )),
        OpNum::UintFloordiv => {
            let b = int(1);
            if b == 0 {
                return Err(ExecError::DivByZero);
            }
            Some(RawValue::Int(((int(0) as u64) / (b as u64)) as i64))
        }
        OpNum::IntLt => int_cmp(int(0) < int(1)),
        OpNum::IntLe => int_cmp(int(0) <= int(1)),
        OpNum::IntEq => int_cmp(int(0) == int(1)),
        OpNum::IntNe => int_cmp(int(0) != int(1)),
        OpNum::IntGt => int_cmp(int(0) > int(1)),
        OpNum::IntGe => int_cmp(int(0) >= int(1)),
        OpNum::UintLt => int_cmp((int(0) as u64) < (int(1) as u64)),
        OpNum::UintLe => int_cmp((int(0) as u64) <= (int(1) as u64)),
        OpNum::UintGt => int_cmp((int(0) as u64) > (int(1) as u64)),
        OpNum::UintGe => int_cmp((int(0) as u64) >= (int(1) as u64)),
        OpNum::IntIsTrue => int_cmp(int(0) != 0),
        OpNum::IntNeg => Some(RawValue::Int(int(0).wrapping_neg())),
        OpNum::IntInvert => Some(RawValue::Int(!int(0))),
        OpNum::IntAbs => Some(RawValue::Int(int(0).wrapping_abs())),

        OpNum::IntAddOvf => match int(0).checked_add(int(1)) {
            Some(v) => Some(RawValue::Int(v)),
            None => return Err(ExecError::Overflow),
        },
        OpNum::IntSubOvf => match int(0).checked_sub(int(1)) {
            Some(v) => Some(RawValue::Int(v)),
            None => return Err(ExecError::Overflow),
        },
        OpNum::IntMulOvf => match int(0).checked_mul(int(1)) {
            Some(v) => Some(RawValue::Int(v)),
            None => return Err(ExecError::Overflow),
        },

        OpNum::FloatAdd => Some(RawValue::Float(float(0) + float(1))),
        OpNum::FloatSub => Some(RawValue::Float(float(0) - float(1))),
        OpNum::FloatMul => Some(RawValue::Float(float(0) * float(1))),
        OpNum::FloatDiv => Some(RawValue::Float(float(0) / float(1))),
        OpNum::FloatNeg => Some(RawValue::Float(-float(0))),
        OpNum::FloatAbs => Some(RawValue::Float(float(0).abs())),
        OpNum::FloatLt => int_cmp(float(0) < float(1)),
        OpNum::FloatLe => int_cmp(float(0) <= float(1)),
        OpNum::FloatEq => int_cmp(float(0) == float(1)),
        OpNum::FloatNe => int_cmp(float(0) != float(1)),
        OpNum::FloatGt => int_cmp(float(0) > float(1)),
        OpNum::FloatGe => int_cmp(float(0) >= float(1)),

        OpNum::PtrEq => int_cmp(gcref(0).same_object(&gcref(1))),
        OpNum::PtrNe => int_cmp(!gcref(0).same_object(&gcref(1))),

        OpNum::SameAs => Some(args[0].clone()),

        OpNum::GetfieldGc | OpNum::GetfieldGcPure => {
            let field = descr.expect("getfield without descr").as_field();
            Some(gcref(0).get_field(field.offset))
        }
        OpNum::SetfieldGc => {
            let field = descr.expect("setfield without descr").as_field();
            gcref(0).set_field(field.offset, args[1].clone());
            None
        }
        OpNum::GetarrayitemGc | OpNum::GetarrayitemGcPure => {
            Some(gcref(0).get_item(int(1) as usize))
        }
        OpNum::SetarrayitemGc => {
            gcref(0).set_item(int(1) as usize, args[2].clone());
            None
        }
        OpNum::ArraylenGc => Some(RawValue::Int(gcref(0).array_len() as i64)),

        OpNum::New | OpNum::NewWithVtable => {
            let size = descr.expect("new without descr").as_size();
            Some(RawValue::Ref(GcRef::alloc_struct(
                size.field_kinds.len(),
                &size.field_kinds,
                size.vtable,
            )))
        }
        OpNum::NewArray => {
            let array = descr.expect("new_array without descr").as_array();
            Some(RawValue::Ref(GcRef::alloc_array(int(0) as usize, array.kind)))
        }

        OpNum::Call
        | OpNum::CallMayForce
        | OpNum::CallAssembler
        | OpNum::CallLoopinvariant
        | OpNum::CallPure => {
            let func_index = int(0) as usize;
            let f = ctx.program.function(func_index).clone();
            match f(ctx, &args[1..]) {
                Ok(value) => {
                    let calldescr = descr.expect("call without descr").as_call();
                    debug_assert_eq!(
                        value.as_ref().map(RawValue::kind),
                        calldescr.result,
                        "residual call result kind mismatch"
                    );
                    value
                }
                Err(exc) => return Err(ExecError::Raise(exc)),
            }
        }

        OpNum::DebugMergePoint => None,

        OpNum::GuardTrue
        | OpNum::GuardFalse
        | OpNum::GuardValue
        | OpNum::GuardClass
        | OpNum::GuardNonnull
        | OpNum::GuardIsnull
        | OpNum::GuardNoException
        | OpNum::GuardException
        | OpNum::GuardOverflow
        | OpNum::GuardNoOverflow
        | OpNum::GuardNotForced
        | OpNum::Jump
        | OpNum::Label => unreachable!("{opnum} is control flow, not executable"),
    };
    Ok(result)
}

/// Pure function evaluation for constant folding: arguments known, no
/// heap or program access needed beyond what the descr carries.
pub fn execute_pure(
    ctx: &ExecContext<'_>,
    opnum: OpNum,
    args: &[RawValue],
    descr: Option<&DescrRef>,
) -> Option<RawValue> {
    debug_assert!(opnum.is_always_pure());
    execute_op(ctx, opnum, args, descr)
        .expect("pure operation failed during folding")
}

/// The kind of the value an operation produces, given its descr.
pub fn result_kind(opnum: OpNum, descr: Option<&DescrRef>) -> Option<Kind> {
    match opnum {
        OpNum::FloatAdd | OpNum::FloatSub | OpNum::FloatMul | OpNum::FloatDiv
        | OpNum::FloatNeg | OpNum::FloatAbs => Some(Kind::Float),
        OpNum::New | OpNum::NewWithVtable | OpNum::NewArray => Some(Kind::Ref),
        OpNum::GetfieldGc | OpNum::GetfieldGcPure => Some(descr?.as_field().kind),
        OpNum::GetarrayitemGc | OpNum::GetarrayitemGcPure => Some(descr?.as_array().kind),
        OpNum::SameAs => None, // kind follows the argument
        OpNum::Call | OpNum::CallMayForce | OpNum::CallAssembler | OpNum::CallLoopinvariant
        | OpNum::CallPure => descr?.as_call().result,
        OpNum::SetfieldGc | OpNum::SetarrayitemGc | OpNum::DebugMergePoint => None,
        _ => Some(Kind::Int),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jitcode::ProgramBuilder;

    fn with_ctx<T>(f: impl FnOnce(&ExecContext<'_>) -> T) -> T {
        let program = ProgramBuilder::new().finish();
        let ctx = ExecContext::new(&program);
        f(&ctx)
    }

    #[test]
    fn test_int_arithmetic() {
        with_ctx(|ctx| {
            let args = [RawValue::Int(7), RawValue::Int(3)];
            assert_eq!(
                execute_op(ctx, OpNum::IntAdd, &args, None).unwrap(),
                Some(RawValue::Int(10))
            );
            assert_eq!(
                execute_op(ctx, OpNum::IntFloordiv, &args, None).unwrap(),
                Some(RawValue::Int(2))
            );
            assert_eq!(
                execute_op(ctx, OpNum::IntMod, &args, None).unwrap(),
                Some(RawValue::Int(1))
            );
            assert_eq!(
                execute_op(ctx, OpNum::IntLt, &args, None).unwrap(),
                Some(RawValue::Int(0))
            );
        });
    }

    #[test]
    fn test_overflow_detection() {
        with_ctx(|ctx| {
            let args = [RawValue::Int(i64::MAX), RawValue::Int(1)];
            assert!(matches!(
                execute_op(ctx, OpNum::IntAddOvf, &args, None),
                Err(ExecError::Overflow)
            ));
            // plain add wraps
            assert_eq!(
                execute_op(ctx, OpNum::IntAdd, &args, None).unwrap(),
                Some(RawValue::Int(i64::MIN))
            );
        });
    }

    #[test]
    fn test_division_by_zero() {
        with_ctx(|ctx| {
            let args = [RawValue::Int(1), RawValue::Int(0)];
            assert!(matches!(
                execute_op(ctx, OpNum::IntFloordiv, &args, None),
                Err(ExecError::DivByZero)
            ));
        });
    }

    #[test]
    fn test_unsigned_comparison() {
        with_ctx(|ctx| {
            let args = [RawValue::Int(-1), RawValue::Int(1)];
            assert_eq!(
                execute_op(ctx, OpNum::UintLt, &args, None).unwrap(),
                Some(RawValue::Int(0)) // -1 is the largest unsigned value
            );
            assert_eq!(
                execute_op(ctx, OpNum::IntLt, &args, None).unwrap(),
                Some(RawValue::Int(1))
            );
        });
    }

    #[test]
    fn test_heap_operations() {
        let mut pb = ProgramBuilder::new();
        let cls = pb.add_class("Counter", vec![Kind::Int]);
        let field = pb.field_descr(cls, 0);
        let size = pb.size_vtable_descr(cls);
        let program = pb.finish();
        let ctx = ExecContext::new(&program);

        let obj = execute_op(
            &ctx,
            OpNum::NewWithVtable,
            &[],
            Some(&DescrRef::Size(size)),
        )
        .unwrap()
        .unwrap();

        execute_op(
            &ctx,
            OpNum::SetfieldGc,
            &[obj.clone(), RawValue::Int(11)],
            Some(&DescrRef::Field(field.clone())),
        )
        .unwrap();

        let read = execute_op(
            &ctx,
            OpNum::GetfieldGc,
            &[obj.clone()],
            Some(&DescrRef::Field(field)),
        )
        .unwrap();
        assert_eq!(read, Some(RawValue::Int(11)));
        assert_eq!(obj.as_ref().class(), Some(cls));
    }
}
