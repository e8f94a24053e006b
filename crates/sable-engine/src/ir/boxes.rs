//! Boxes, constants, and operands
//!
//! A `TraceBox` is a runtime value flowing through the trace being
//! recorded. Boxes have identity: two boxes holding the same integer are
//! distinct, and the trace records operations over identities, not over
//! concrete values. During tracing each box also carries its current
//! concrete value, so operations can execute for real as they are
//! recorded.
//!
//! `ConstVal` is the frozen form: compared by value, never mutated, and
//! eligible for constant folding.

use std::cell::RefCell;
use std::rc::Rc;

use crate::heap::{GcRef, Kind, RawValue};

#[derive(Debug)]
struct BoxInner {
    kind: Kind,
    value: RefCell<RawValue>,
}

/// An identity-bearing runtime value in a trace.
#[derive(Debug, Clone)]
pub struct TraceBox {
    inner: Rc<BoxInner>,
}

impl TraceBox {
    pub fn new(value: RawValue) -> TraceBox {
        TraceBox {
            inner: Rc::new(BoxInner {
                kind: value.kind(),
                value: RefCell::new(value),
            }),
        }
    }

    pub fn new_int(value: i64) -> TraceBox {
        Self::new(RawValue::Int(value))
    }

    pub fn new_ref(value: GcRef) -> TraceBox {
        Self::new(RawValue::Ref(value))
    }

    pub fn new_float(value: f64) -> TraceBox {
        Self::new(RawValue::Float(value))
    }

    pub fn kind(&self) -> Kind {
        self.inner.kind
    }

    /// Current concrete value
    pub fn value(&self) -> RawValue {
        self.inner.value.borrow().clone()
    }

    pub fn int_value(&self) -> i64 {
        self.value().as_int()
    }

    pub fn ref_value(&self) -> GcRef {
        self.value().as_ref()
    }

    pub fn float_value(&self) -> f64 {
        self.value().as_float()
    }

    /// Overwrite the concrete value; the kind never changes
    pub fn set_value(&self, value: RawValue) {
        assert_eq!(self.inner.kind, value.kind(), "box kind changed by store");
        *self.inner.value.borrow_mut() = value;
    }

    /// Freeze the current value into a constant
    pub fn constbox(&self) -> ConstVal {
        ConstVal::from_value(self.value())
    }

    fn address(&self) -> usize {
        Rc::as_ptr(&self.inner) as usize
    }
}

impl PartialEq for TraceBox {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for TraceBox {}

impl std::hash::Hash for TraceBox {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

/// A constant value. Compares by value; never the target of mutation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ConstVal {
    Int(i64),
    Ref(GcRef),
    Float(FloatBits),
}

/// f64 wrapper comparing and hashing by bit pattern.
#[derive(Debug, Clone, Copy)]
pub struct FloatBits(pub f64);

impl PartialEq for FloatBits {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for FloatBits {}

impl std::hash::Hash for FloatBits {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl ConstVal {
    pub fn from_value(value: RawValue) -> ConstVal {
        match value {
            RawValue::Int(v) => ConstVal::Int(v),
            RawValue::Ref(r) => ConstVal::Ref(r),
            RawValue::Float(f) => ConstVal::Float(FloatBits(f)),
        }
    }

    pub fn kind(&self) -> Kind {
        match self {
            ConstVal::Int(_) => Kind::Int,
            ConstVal::Ref(_) => Kind::Ref,
            ConstVal::Float(_) => Kind::Float,
        }
    }

    pub fn value(&self) -> RawValue {
        match self {
            ConstVal::Int(v) => RawValue::Int(*v),
            ConstVal::Ref(r) => RawValue::Ref(r.clone()),
            ConstVal::Float(f) => RawValue::Float(f.0),
        }
    }

    pub fn same_constant(&self, other: &ConstVal) -> bool {
        self == other
    }
}

/// Argument position of an operation: a box or an inline constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operand {
    Box(TraceBox),
    Const(ConstVal),
}

impl Operand {
    pub fn kind(&self) -> Kind {
        match self {
            Operand::Box(b) => b.kind(),
            Operand::Const(c) => c.kind(),
        }
    }

    /// Current concrete value of this operand
    pub fn value(&self) -> RawValue {
        match self {
            Operand::Box(b) => b.value(),
            Operand::Const(c) => c.value(),
        }
    }

    pub fn is_const(&self) -> bool {
        matches!(self, Operand::Const(_))
    }

    pub fn as_box(&self) -> Option<&TraceBox> {
        match self {
            Operand::Box(b) => Some(b),
            Operand::Const(_) => None,
        }
    }

    /// Freeze into the const form of the current value
    pub fn constbox(&self) -> ConstVal {
        match self {
            Operand::Box(b) => b.constbox(),
            Operand::Const(c) => c.clone(),
        }
    }

    /// Materialize as a box: constants get a fresh box holding their
    /// value, boxes stay themselves
    pub fn nonconstbox(&self) -> TraceBox {
        match self {
            Operand::Box(b) => b.clone(),
            Operand::Const(c) => TraceBox::new(c.value()),
        }
    }

    pub fn int_value(&self) -> i64 {
        self.value().as_int()
    }

    pub fn ref_value(&self) -> GcRef {
        self.value().as_ref()
    }

    pub fn float_value(&self) -> f64 {
        self.value().as_float()
    }
}

impl From<TraceBox> for Operand {
    fn from(b: TraceBox) -> Operand {
        Operand::Box(b)
    }
}

impl From<ConstVal> for Operand {
    fn from(c: ConstVal) -> Operand {
        Operand::Const(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_boxes_have_identity() {
        let a = TraceBox::new_int(5);
        let b = TraceBox::new_int(5);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_consts_compare_by_value() {
        let a = ConstVal::Int(5);
        let b = ConstVal::Int(5);
        assert!(a.same_constant(&b));
        assert!(!a.same_constant(&ConstVal::Int(6)));
        assert!(ConstVal::Float(FloatBits(1.5)).same_constant(&ConstVal::Float(FloatBits(1.5))));
    }

    #[test]
    fn test_box_value_mutation_keeps_identity() {
        let a = TraceBox::new_int(5);
        let a2 = a.clone();
        a.set_value(RawValue::Int(9));
        assert_eq!(a2.int_value(), 9);
        assert_eq!(a, a2);
    }

    #[test]
    #[should_panic(expected = "box kind changed")]
    fn test_kind_mismatch_panics() {
        let a = TraceBox::new_int(5);
        a.set_value(RawValue::Float(1.0));
    }

    #[test]
    fn test_constbox_freezes_current_value() {
        let a = TraceBox::new_int(5);
        a.set_value(RawValue::Int(7));
        assert_eq!(a.constbox(), ConstVal::Int(7));
    }

    #[test]
    fn test_nonconstbox_materializes_constants() {
        let c = Operand::Const(ConstVal::Int(4));
        let b = c.nonconstbox();
        assert_eq!(b.int_value(), 4);
        // boxes pass through unchanged
        let original = TraceBox::new_int(9);
        assert_eq!(Operand::Box(original.clone()).nonconstbox(), original);
    }
}
