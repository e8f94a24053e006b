//! Optimizer passes over the recorded trace
//!
//! Each pass is one forward walk over the linear operation list,
//! implementing `OptPass`; the `Optimizer` runs a configurable sequence
//! of them (the driver's `enable_opts` parameter selects by name).
//! Substitutions discovered by a pass (a folded box, a CSE duplicate)
//! are applied to later argument lists and to the failargs of later
//! guards, so compiled code never materializes a value it can prove.
//!
//! Ordering rules: side-effecting operations keep their relative order;
//! pure operations may move subject to data dependencies; guards may
//! move earlier but never later than a side-effecting operation they
//! depend on.

use rustc_hash::FxHashMap;

use crate::heap::ClassId;
use crate::ir::boxes::{ConstVal, Operand, TraceBox};
use crate::ir::execute::{execute_pure, ExecContext};
use crate::ir::ops::{OpNum, Operation};
use crate::jitcode::Program;

/// The optimizer's working set: input arguments plus the operation list.
pub struct TraceParts {
    pub inputargs: Vec<TraceBox>,
    pub operations: Vec<Operation>,
}

/// One optimization pass, run in sequence by the `Optimizer`.
pub trait OptPass {
    /// Name of this pass (matched against `enable_opts`)
    fn name(&self) -> &'static str;
    /// Run the pass, rewriting the trace in place
    fn run(&self, ctx: &ExecContext<'_>, trace: &mut TraceParts);
}

/// Runs a sequence of passes over a trace.
pub struct Optimizer {
    passes: Vec<Box<dyn OptPass>>,
}

impl Optimizer {
    /// The full default pipeline
    pub fn new() -> Optimizer {
        Optimizer {
            passes: vec![
                Box::new(ConstantFolding),
                Box::new(CommonSubexpressions),
                Box::new(GuardStrengthening),
                Box::new(CompareGuardFusion),
            ],
        }
    }

    /// Pipeline selected by a comma-separated pass list; unknown names
    /// are ignored so old configuration strings stay usable
    pub fn from_names(names: &str) -> Optimizer {
        let all = Optimizer::new();
        let wanted: Vec<&str> = names.split(',').map(str::trim).collect();
        Optimizer {
            passes: all
                .passes
                .into_iter()
                .filter(|p| wanted.contains(&p.name()))
                .collect(),
        }
    }

    pub fn optimize(&self, program: &Program, trace: &mut TraceParts) {
        let ctx = ExecContext::new(program);
        for pass in &self.passes {
            pass.run(&ctx, trace);
        }
    }
}

impl Default for Optimizer {
    fn default() -> Self {
        Self::new()
    }
}

fn substitute_args(op: &mut Operation, map: &FxHashMap<TraceBox, Operand>) {
    for arg in op.args.iter_mut() {
        if let Operand::Box(b) = arg {
            if let Some(replacement) = map.get(b) {
                *arg = replacement.clone();
            }
        }
    }
}

fn apply_to_guard(op: &Operation, map: &FxHashMap<TraceBox, Operand>) {
    if op.is_guard() {
        if let Some(descr) = &op.descr {
            descr.as_resume_guard().substitute_failargs(map);
        }
    }
}

// ===== Pass 1: Constant folding =====

/// Folds pure operations whose arguments are all constants, and drops
/// guards that the constants already satisfy. A `guard_value` teaches the
/// pass the value of the guarded box for the rest of the trace.
pub struct ConstantFolding;

impl OptPass for ConstantFolding {
    fn name(&self) -> &'static str {
        "fold"
    }

    fn run(&self, ctx: &ExecContext<'_>, trace: &mut TraceParts) {
        let mut map: FxHashMap<TraceBox, Operand> = FxHashMap::default();
        let mut kept = Vec::with_capacity(trace.operations.len());

        for mut op in trace.operations.drain(..) {
            substitute_args(&mut op, &map);

            if op.is_guard() {
                if guard_is_statically_satisfied(&op) {
                    continue;
                }
                if op.opnum == OpNum::GuardValue {
                    if let Operand::Box(b) = &op.args[0] {
                        map.insert(b.clone(), Operand::Const(op.args[1].constbox()));
                    }
                }
                apply_to_guard(&op, &map);
                kept.push(op);
                continue;
            }

            if op.opnum.is_always_pure() && op.args.iter().all(Operand::is_const) {
                let args: Vec<_> = op.args.iter().map(Operand::value).collect();
                let value = execute_pure(ctx, op.opnum, &args, op.descr.as_ref())
                    .expect("pure op with no result");
                let result = op.result.expect("pure op without result box");
                map.insert(result, Operand::Const(ConstVal::from_value(value)));
                continue;
            }

            kept.push(op);
        }
        trace.operations = kept;
    }
}

/// A guard whose argument is already a satisfying constant can go away.
fn guard_is_statically_satisfied(op: &Operation) -> bool {
    match op.opnum {
        OpNum::GuardTrue => matches!(&op.args[0], Operand::Const(ConstVal::Int(v)) if *v != 0),
        OpNum::GuardFalse => matches!(&op.args[0], Operand::Const(ConstVal::Int(0))),
        OpNum::GuardValue => match (&op.args[0], &op.args[1]) {
            (Operand::Const(a), b) => a.same_constant(&b.constbox()),
            _ => false,
        },
        OpNum::GuardNonnull => {
            matches!(&op.args[0], Operand::Const(ConstVal::Ref(r)) if !r.is_null())
        }
        OpNum::GuardIsnull => {
            matches!(&op.args[0], Operand::Const(ConstVal::Ref(r)) if r.is_null())
        }
        OpNum::GuardClass => match (&op.args[0], &op.args[1]) {
            (Operand::Const(ConstVal::Ref(r)), Operand::Const(ConstVal::Int(cls))) => {
                r.class().map(|c| c.0 as i64) == Some(*cls)
            }
            _ => false,
        },
        _ => false,
    }
}

// ===== Pass 2: Common subexpression elimination =====

type CseKey = (OpNum, Vec<Operand>, Option<usize>);

/// Reuses the result of an identical earlier pure operation. Keys are
/// `(opnum, args, descr)`; descrs are interned, so pointer identity is
/// enough.
pub struct CommonSubexpressions;

impl OptPass for CommonSubexpressions {
    fn name(&self) -> &'static str {
        "cse"
    }

    fn run(&self, _ctx: &ExecContext<'_>, trace: &mut TraceParts) {
        let mut seen: FxHashMap<CseKey, Operand> = FxHashMap::default();
        let mut map: FxHashMap<TraceBox, Operand> = FxHashMap::default();
        let mut kept = Vec::with_capacity(trace.operations.len());

        for mut op in trace.operations.drain(..) {
            substitute_args(&mut op, &map);
            apply_to_guard(&op, &map);

            if op.opnum.is_always_pure() {
                let key = (
                    op.opnum,
                    op.args.clone(),
                    op.descr.as_ref().map(|d| d.address()),
                );
                if let Some(earlier) = seen.get(&key) {
                    let result = op.result.expect("pure op without result box");
                    map.insert(result, earlier.clone());
                    continue;
                }
                if let Some(result) = &op.result {
                    seen.insert(key, Operand::Box(result.clone()));
                }
            }
            kept.push(op);
        }
        trace.operations = kept;
    }
}

// ===== Pass 3: Guard strengthening =====

/// Drops guards made redundant by an earlier guard on the same box: a
/// second `guard_value x, c` with the same constant, a repeated
/// `guard_class`, or a nullness guard already implied by a known class.
/// Knowing a box's class also lets later call sites on that box stay
/// devirtualized.
pub struct GuardStrengthening;

impl OptPass for GuardStrengthening {
    fn name(&self) -> &'static str {
        "guards"
    }

    fn run(&self, _ctx: &ExecContext<'_>, trace: &mut TraceParts) {
        let mut known_values: FxHashMap<TraceBox, ConstVal> = FxHashMap::default();
        let mut known_classes: FxHashMap<TraceBox, ClassId> = FxHashMap::default();
        let mut kept = Vec::with_capacity(trace.operations.len());

        for op in trace.operations.drain(..) {
            let drop = match op.opnum {
                OpNum::GuardValue => match op.args[0].as_box() {
                    Some(b) => {
                        let c = op.args[1].constbox();
                        if known_values.get(b) == Some(&c) {
                            true
                        } else {
                            known_values.insert(b.clone(), c);
                            false
                        }
                    }
                    None => false,
                },
                OpNum::GuardClass => match op.args[0].as_box() {
                    Some(b) => {
                        let cls = ClassId(op.args[1].int_value() as u32);
                        if known_classes.get(b) == Some(&cls) {
                            true
                        } else {
                            known_classes.insert(b.clone(), cls);
                            false
                        }
                    }
                    None => false,
                },
                OpNum::GuardNonnull => match op.args[0].as_box() {
                    // a known class implies non-null
                    Some(b) => known_classes.contains_key(b),
                    None => false,
                },
                _ => false,
            };
            if !drop {
                kept.push(op);
            }
        }
        trace.operations = kept;
    }
}

// ===== Pass 4: Comparison-guard fusion =====

/// A comparison whose result feeds only the directly following
/// `guard_true`/`guard_false` needs no materialized box: the guard's
/// failargs entry for it is replaced by the outcome the failure implies,
/// and the back-end emits a compare-and-branch pair.
pub struct CompareGuardFusion;

fn is_comparison(opnum: OpNum) -> bool {
    matches!(
        opnum,
        OpNum::IntLt
            | OpNum::IntLe
            | OpNum::IntEq
            | OpNum::IntNe
            | OpNum::IntGt
            | OpNum::IntGe
            | OpNum::UintLt
            | OpNum::UintLe
            | OpNum::UintGt
            | OpNum::UintGe
            | OpNum::IntIsTrue
            | OpNum::FloatLt
            | OpNum::FloatLe
            | OpNum::FloatEq
            | OpNum::FloatNe
            | OpNum::FloatGt
            | OpNum::FloatGe
            | OpNum::PtrEq
            | OpNum::PtrNe
    )
}

impl OptPass for CompareGuardFusion {
    fn name(&self) -> &'static str {
        "fuse"
    }

    fn run(&self, _ctx: &ExecContext<'_>, trace: &mut TraceParts) {
        // count argument uses outside each guard's own failargs
        let mut uses: FxHashMap<TraceBox, u32> = FxHashMap::default();
        for op in &trace.operations {
            for arg in &op.args {
                if let Operand::Box(b) = arg {
                    *uses.entry(b.clone()).or_insert(0) += 1;
                }
            }
        }

        for i in 1..trace.operations.len() {
            let (before, after) = trace.operations.split_at_mut(i);
            let producer = &before[i - 1];
            let guard = &after[0];

            let fusible = matches!(guard.opnum, OpNum::GuardTrue | OpNum::GuardFalse)
                && is_comparison(producer.opnum)
                && producer.result.is_some()
                && matches!(
                    &guard.args[0],
                    Operand::Box(b) if Some(b) == producer.result.as_ref()
                )
                && uses.get(producer.result.as_ref().unwrap()) == Some(&1);
            if !fusible {
                continue;
            }

            // at failure the condition had the opposite of the guarded value
            let at_failure = match guard.opnum {
                OpNum::GuardTrue => ConstVal::Int(0),
                _ => ConstVal::Int(1),
            };
            let cond = producer.result.clone().unwrap();
            if let Some(descr) = &guard.descr {
                descr
                    .as_resume_guard()
                    .replace_failarg(&cond, Operand::Const(at_failure));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::heap::Kind;
    use crate::ir::descr::DescrRef;
    use crate::jitcode::ProgramBuilder;
    use crate::resume::ResumeGuardDescr;
    use std::rc::Rc;

    fn optimize_with(names: &str, trace: &mut TraceParts) {
        let program = ProgramBuilder::new().finish();
        Optimizer::from_names(names).optimize(&program, trace);
    }

    fn guard_descr(opnum: OpNum) -> DescrRef {
        DescrRef::ResumeGuard(Rc::new(ResumeGuardDescr::new(opnum)))
    }

    #[test]
    fn test_constant_folding_drops_pure_op() {
        let r = TraceBox::new_int(8);
        let user = TraceBox::new_int(16);
        let mut trace = TraceParts {
            inputargs: vec![],
            operations: vec![
                Operation::new(
                    OpNum::IntAdd,
                    vec![
                        Operand::Const(ConstVal::Int(3)),
                        Operand::Const(ConstVal::Int(5)),
                    ],
                    Some(r.clone()),
                    None,
                ),
                Operation::new(
                    OpNum::IntMul,
                    vec![Operand::Box(r), Operand::Const(ConstVal::Int(2))],
                    Some(user),
                    None,
                ),
            ],
        };
        optimize_with("fold", &mut trace);

        // int_add folded away; int_mul now multiplies the folded constant
        assert_eq!(trace.operations.len(), 1);
        assert_eq!(trace.operations[0].opnum, OpNum::IntMul);
        assert_eq!(
            trace.operations[0].args[0],
            Operand::Const(ConstVal::Int(8))
        );
    }

    #[test]
    fn test_guard_value_teaches_folding() {
        let x = TraceBox::new_int(3);
        let y = TraceBox::new_int(6);
        let mut trace = TraceParts {
            inputargs: vec![x.clone()],
            operations: vec![
                Operation::new(
                    OpNum::GuardValue,
                    vec![Operand::Box(x.clone()), Operand::Const(ConstVal::Int(3))],
                    None,
                    Some(guard_descr(OpNum::GuardValue)),
                ),
                Operation::new(
                    OpNum::IntAdd,
                    vec![Operand::Box(x), Operand::Const(ConstVal::Int(3))],
                    Some(y),
                    None,
                ),
            ],
        };
        optimize_with("fold", &mut trace);
        // the add folds to 6 thanks to the promoted value
        assert_eq!(trace.operations.len(), 1);
        assert_eq!(trace.operations[0].opnum, OpNum::GuardValue);
    }

    #[test]
    fn test_cse_reuses_pure_result() {
        let mut pb = ProgramBuilder::new();
        let cls = pb.add_class("Box", vec![Kind::Int]);
        let field = pb.field_descr(cls, 0);
        let program = pb.finish();

        let obj = TraceBox::new_ref(crate::heap::GcRef::alloc_struct(
            1,
            &[Kind::Int],
            Some(cls),
        ));
        let first = TraceBox::new_int(0);
        let second = TraceBox::new_int(0);
        let sum = TraceBox::new_int(0);
        let mut trace = TraceParts {
            inputargs: vec![obj.clone()],
            operations: vec![
                Operation::new(
                    OpNum::GetfieldGcPure,
                    vec![Operand::Box(obj.clone())],
                    Some(first.clone()),
                    Some(DescrRef::Field(field.clone())),
                ),
                Operation::new(
                    OpNum::GetfieldGcPure,
                    vec![Operand::Box(obj)],
                    Some(second.clone()),
                    Some(DescrRef::Field(field)),
                ),
                Operation::new(
                    OpNum::IntAdd,
                    vec![Operand::Box(first.clone()), Operand::Box(second)],
                    Some(sum),
                    None,
                ),
            ],
        };
        Optimizer::from_names("cse").optimize(&program, &mut trace);

        assert_eq!(trace.operations.len(), 2);
        // the add now uses the first load twice
        assert_eq!(
            trace.operations[1].args[0],
            trace.operations[1].args[1]
        );
        assert_eq!(trace.operations[1].args[0], Operand::Box(first));
    }

    #[test]
    fn test_redundant_guard_value_removed() {
        let x = TraceBox::new_int(3);
        let mut trace = TraceParts {
            inputargs: vec![x.clone()],
            operations: vec![
                Operation::new(
                    OpNum::GuardValue,
                    vec![Operand::Box(x.clone()), Operand::Const(ConstVal::Int(3))],
                    None,
                    Some(guard_descr(OpNum::GuardValue)),
                ),
                Operation::new(
                    OpNum::GuardValue,
                    vec![Operand::Box(x), Operand::Const(ConstVal::Int(3))],
                    None,
                    Some(guard_descr(OpNum::GuardValue)),
                ),
            ],
        };
        optimize_with("guards", &mut trace);
        assert_eq!(trace.operations.len(), 1);
    }

    #[test]
    fn test_known_class_implies_nonnull() {
        let x = TraceBox::new_ref(crate::heap::GcRef::alloc_struct(0, &[], None));
        let mut trace = TraceParts {
            inputargs: vec![x.clone()],
            operations: vec![
                Operation::new(
                    OpNum::GuardClass,
                    vec![Operand::Box(x.clone()), Operand::Const(ConstVal::Int(4))],
                    None,
                    Some(guard_descr(OpNum::GuardClass)),
                ),
                Operation::new(
                    OpNum::GuardNonnull,
                    vec![Operand::Box(x)],
                    None,
                    Some(guard_descr(OpNum::GuardNonnull)),
                ),
            ],
        };
        optimize_with("guards", &mut trace);
        assert_eq!(trace.operations.len(), 1);
        assert_eq!(trace.operations[0].opnum, OpNum::GuardClass);
    }

    #[test]
    fn test_fusion_rewrites_failargs() {
        let a = TraceBox::new_int(1);
        let b = TraceBox::new_int(100);
        let cond = TraceBox::new_int(1);

        let descr = Rc::new(ResumeGuardDescr::new(OpNum::GuardTrue));
        // simulate capture: the condition box is live in a register
        {
            use crate::meta::frame::FramePool;
            let mut builder = crate::jitcode::JitCodeBuilder::new("t", None);
            builder.new_reg_i();
            let code = Rc::new(builder.finish());
            let mut pool = FramePool::new();
            let mut frame = pool.alloc(code, 0);
            frame.set_reg(Kind::Int, 0, Operand::Box(cond.clone()));
            crate::resume::capture_resumedata(&[frame], None, &[], &descr);
        }

        let mut trace = TraceParts {
            inputargs: vec![a.clone(), b.clone()],
            operations: vec![
                Operation::new(
                    OpNum::IntLt,
                    vec![Operand::Box(a), Operand::Box(b)],
                    Some(cond.clone()),
                    None,
                ),
                Operation::new(
                    OpNum::GuardTrue,
                    vec![Operand::Box(cond)],
                    None,
                    Some(DescrRef::ResumeGuard(descr.clone())),
                ),
            ],
        };
        optimize_with("fuse", &mut trace);

        // the condition's failargs slot now holds the failing outcome
        assert_eq!(descr.failargs(), vec![Operand::Const(ConstVal::Int(0))]);
    }

    #[test]
    fn test_unknown_pass_names_ignored() {
        let opt = Optimizer::from_names("fold, nosuchpass");
        assert_eq!(opt.passes.len(), 1);
    }
}
