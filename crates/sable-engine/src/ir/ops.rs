//! Trace operations
//!
//! The opcode set is closed and laid out in ranges so classification is a
//! range test on the discriminant:
//! - `int_add ..= call_pure` is the ALWAYS_PURE range: side-effect-free,
//!   result depends only on the arguments; the optimizer may fold and CSE
//! - `call ..= call_loopinvariant` is the CAN_RAISE range: every such
//!   operation must be followed by an exception guard
//! - `guard_true ..= guard_not_forced` are the guards; each carries a
//!   resume descr
//! - `jump` / `label` are control flow

use super::boxes::{Operand, TraceBox};
use super::descr::DescrRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum OpNum {
    // ===== ALWAYS_PURE range =====
    IntAdd = 1,
    IntSub,
    IntMul,
    IntFloordiv,
    IntMod,
    IntAnd,
    IntOr,
    IntXor,
    IntLshift,
    IntRshift,
    UintRshift,
    UintFloordiv,
    IntLt,
    IntLe,
    IntEq,
    IntNe,
    IntGt,
    IntGe,
    UintLt,
    UintLe,
    UintGt,
    UintGe,
    IntIsTrue,
    IntNeg,
    IntInvert,
    IntAbs,
    FloatAdd,
    FloatSub,
    FloatMul,
    FloatDiv,
    FloatNeg,
    FloatAbs,
    FloatLt,
    FloatLe,
    FloatEq,
    FloatNe,
    FloatGt,
    FloatGe,
    PtrEq,
    PtrNe,
    SameAs,
    GetfieldGcPure,
    GetarrayitemGcPure,
    ArraylenGc,
    CallPure,

    // ===== overflow-checked arithmetic (requires an overflow guard) =====
    IntAddOvf,
    IntSubOvf,
    IntMulOvf,

    // ===== heap access and allocation =====
    GetfieldGc,
    SetfieldGc,
    GetarrayitemGc,
    SetarrayitemGc,
    New,
    NewWithVtable,
    NewArray,
    DebugMergePoint,

    // ===== CAN_RAISE range =====
    Call,
    CallMayForce,
    CallAssembler,
    CallLoopinvariant,

    // ===== guards =====
    GuardTrue,
    GuardFalse,
    GuardValue,
    GuardClass,
    GuardNonnull,
    GuardIsnull,
    GuardNoException,
    GuardException,
    GuardOverflow,
    GuardNoOverflow,
    GuardNotForced,

    // ===== control flow =====
    Jump,
    Label,
}

impl OpNum {
    fn num(self) -> u16 {
        self as u16
    }

    /// Side-effect-free; result depends only on the arguments
    pub fn is_always_pure(self) -> bool {
        (OpNum::IntAdd.num()..=OpNum::CallPure.num()).contains(&self.num())
    }

    /// Overflow-checked arithmetic
    pub fn is_ovf(self) -> bool {
        (OpNum::IntAddOvf.num()..=OpNum::IntMulOvf.num()).contains(&self.num())
    }

    /// May raise a guest exception; must be followed by an exception guard
    pub fn can_raise(self) -> bool {
        (OpNum::Call.num()..=OpNum::CallLoopinvariant.num()).contains(&self.num())
    }

    pub fn is_guard(self) -> bool {
        (OpNum::GuardTrue.num()..=OpNum::GuardNotForced.num()).contains(&self.num())
    }

    /// Guards generated by exception handling after a raising operation
    pub fn is_exception_guard(self) -> bool {
        matches!(self, OpNum::GuardNoException | OpNum::GuardException)
    }

    /// Whether the optimizer must preserve the position of this operation
    /// relative to other side-effecting operations
    pub fn has_side_effects(self) -> bool {
        matches!(
            self,
            OpNum::SetfieldGc
                | OpNum::SetarrayitemGc
                | OpNum::New
                | OpNum::NewWithVtable
                | OpNum::NewArray
                | OpNum::Call
                | OpNum::CallMayForce
                | OpNum::CallAssembler
                | OpNum::CallLoopinvariant
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            OpNum::IntAdd => "int_add",
            OpNum::IntSub => "int_sub",
            OpNum::IntMul => "int_mul",
            OpNum::IntFloordiv => "int_floordiv",
            OpNum::IntMod => "int_mod",
            OpNum::IntAnd => "int_and",
            OpNum::IntOr => "int_or",
            OpNum::IntXor => "int_xor",
            OpNum::IntLshift => "int_lshift",
            OpNum::IntRshift => "int_rshift",
            OpNum::UintRshift => "uint_rshift",
            OpNum::UintFloordiv => "uint_floordiv",
            OpNum::IntLt => "int_lt",
            OpNum::IntLe => "int_le",
            OpNum::IntEq => "int_eq",
            OpNum::IntNe => "int_ne",
            OpNum::IntGt => "int_gt",
            OpNum::IntGe => "int_ge",
            OpNum::UintLt => "uint_lt",
            OpNum::UintLe => "uint_le",
            OpNum::UintGt => "uint_gt",
            OpNum::UintGe => "uint_ge",
            OpNum::IntIsTrue => "int_is_true",
            OpNum::IntNeg => "int_neg",
            OpNum::IntInvert => "int_invert",
            OpNum::IntAbs => "int_abs",
            OpNum::FloatAdd => "float_add",
            OpNum::FloatSub => "float_sub",
            OpNum::FloatMul => "float_mul",
            OpNum::FloatDiv => "float_div",
            OpNum::FloatNeg => "float_neg",
            OpNum::FloatAbs => "float_abs",
            OpNum::FloatLt => "float_lt",
            OpNum::FloatLe => "float_le",
            OpNum::FloatEq => "float_eq",
            OpNum::FloatNe => "float_ne",
            OpNum::FloatGt => "float_gt",
            OpNum::FloatGe => "float_ge",
            OpNum::PtrEq => "ptr_eq",
            OpNum::PtrNe => "ptr_ne",
            OpNum::SameAs => "same_as",
            OpNum::GetfieldGcPure => "getfield_gc_pure",
            OpNum::GetarrayitemGcPure => "getarrayitem_gc_pure",
            OpNum::ArraylenGc => "arraylen_gc",
            OpNum::CallPure => "call_pure",
            OpNum::IntAddOvf => "int_add_ovf",
            OpNum::IntSubOvf => "int_sub_ovf",
            OpNum::IntMulOvf => "int_mul_ovf",
            OpNum::GetfieldGc => "getfield_gc",
            OpNum::SetfieldGc => "setfield_gc",
            OpNum::GetarrayitemGc => "getarrayitem_gc",
            OpNum::SetarrayitemGc => "setarrayitem_gc",
            OpNum::New => "new",
            OpNum::NewWithVtable => "new_with_vtable",
            OpNum::NewArray => "new_array",
            OpNum::DebugMergePoint => "debug_merge_point",
            OpNum::Call => "call",
            OpNum::CallMayForce => "call_may_force",
            OpNum::CallAssembler => "call_assembler",
            OpNum::CallLoopinvariant => "call_loopinvariant",
            OpNum::GuardTrue => "guard_true",
            OpNum::GuardFalse => "guard_false",
            OpNum::GuardValue => "guard_value",
            OpNum::GuardClass => "guard_class",
            OpNum::GuardNonnull => "guard_nonnull",
            OpNum::GuardIsnull => "guard_isnull",
            OpNum::GuardNoException => "guard_no_exception",
            OpNum::GuardException => "guard_exception",
            OpNum::GuardOverflow => "guard_overflow",
            OpNum::GuardNoOverflow => "guard_no_overflow",
            OpNum::GuardNotForced => "guard_not_forced",
            OpNum::Jump => "jump",
            OpNum::Label => "label",
        }
    }
}

impl std::fmt::Display for OpNum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// One node of a trace.
#[derive(Debug, Clone)]
pub struct Operation {
    pub opnum: OpNum,
    pub args: Vec<Operand>,
    pub result: Option<TraceBox>,
    pub descr: Option<DescrRef>,
}

impl Operation {
    pub fn new(
        opnum: OpNum,
        args: Vec<Operand>,
        result: Option<TraceBox>,
        descr: Option<DescrRef>,
    ) -> Operation {
        debug_assert!(
            !opnum.is_guard() || descr.as_ref().is_some_and(DescrRef::is_resume_guard),
            "guard {opnum} without a resume descr"
        );
        Operation {
            opnum,
            args,
            result,
            descr,
        }
    }

    pub fn is_guard(&self) -> bool {
        self.opnum.is_guard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_classification() {
        assert!(OpNum::IntAdd.is_always_pure());
        assert!(OpNum::CallPure.is_always_pure());
        assert!(OpNum::GetfieldGcPure.is_always_pure());
        assert!(!OpNum::GetfieldGc.is_always_pure());
        assert!(!OpNum::IntAddOvf.is_always_pure());

        assert!(OpNum::Call.can_raise());
        assert!(OpNum::CallLoopinvariant.can_raise());
        assert!(!OpNum::CallPure.can_raise());

        assert!(OpNum::GuardTrue.is_guard());
        assert!(OpNum::GuardNotForced.is_guard());
        assert!(!OpNum::Jump.is_guard());

        assert!(OpNum::IntMulOvf.is_ovf());
        assert!(!OpNum::IntMul.is_ovf());
    }

    #[test]
    fn test_side_effect_classification() {
        assert!(OpNum::SetfieldGc.has_side_effects());
        assert!(OpNum::Call.has_side_effects());
        assert!(!OpNum::IntAdd.has_side_effects());
        assert!(!OpNum::GetfieldGc.has_side_effects());
    }
}
