//! Descrs: opaque metadata attached to operations
//!
//! Descrs are interned by the code writer and shared immutably: two uses
//! of the same `(class, field)` always share one allocation, so the
//! optimizer can compare descrs by pointer. The resume-guard descrs are
//! the one exception to immutability: they accumulate a snapshot and a
//! failure counter, and live in `crate::resume`.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::heap::{ClassId, Kind};
use crate::resume::{ResumeGuardDescr, ResumeGuardForcedDescr};

/// Field of a guest class: owning class, offset, and kind.
#[derive(Debug)]
pub struct FieldDescr {
    pub class: ClassId,
    pub offset: usize,
    pub kind: Kind,
    pub name: String,
}

/// Array element kind (element size follows from the kind).
#[derive(Debug)]
pub struct ArrayDescr {
    pub kind: Kind,
}

/// Effect information for residual calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallEffect {
    /// Arbitrary side effects
    Standard,
    /// Result depends only on the arguments
    Pure,
    /// May force virtualizables; followed by `guard_not_forced`
    MayForce,
    /// Same result for the whole duration of a loop
    LoopInvariant,
}

/// Callee signature and effect info for a residual call.
#[derive(Debug)]
pub struct CallDescr {
    pub arg_kinds: Vec<Kind>,
    pub result: Option<Kind>,
    pub effect: CallEffect,
}

/// Allocation shape: field kinds, and the vtable for class instances.
#[derive(Debug)]
pub struct SizeDescr {
    pub field_kinds: Vec<Kind>,
    /// `Some` for `new_with_vtable`, `None` for plain structs
    pub vtable: Option<ClassId>,
}

/// Dispatch table of a `switch` opcode: value to jitcode pc.
#[derive(Debug)]
pub struct SwitchDictDescr {
    pub cases: FxHashMap<i64, usize>,
}

/// Shared handle to any descr variant.
#[derive(Debug, Clone)]
pub enum DescrRef {
    Call(Rc<CallDescr>),
    Field(Rc<FieldDescr>),
    Array(Rc<ArrayDescr>),
    Size(Rc<SizeDescr>),
    SwitchDict(Rc<SwitchDictDescr>),
    ResumeGuard(Rc<ResumeGuardDescr>),
    ResumeGuardForced(Rc<ResumeGuardForcedDescr>),
}

impl DescrRef {
    pub fn as_field(&self) -> &Rc<FieldDescr> {
        match self {
            DescrRef::Field(d) => d,
            other => panic!("expected field descr, got {other:?}"),
        }
    }

    pub fn as_array(&self) -> &Rc<ArrayDescr> {
        match self {
            DescrRef::Array(d) => d,
            other => panic!("expected array descr, got {other:?}"),
        }
    }

    pub fn as_call(&self) -> &Rc<CallDescr> {
        match self {
            DescrRef::Call(d) => d,
            other => panic!("expected call descr, got {other:?}"),
        }
    }

    pub fn as_size(&self) -> &Rc<SizeDescr> {
        match self {
            DescrRef::Size(d) => d,
            other => panic!("expected size descr, got {other:?}"),
        }
    }

    /// The resume-guard payload of either guard descr variant
    pub fn as_resume_guard(&self) -> &ResumeGuardDescr {
        match self {
            DescrRef::ResumeGuard(d) => d,
            DescrRef::ResumeGuardForced(d) => &d.base,
            other => panic!("expected resume guard descr, got {other:?}"),
        }
    }

    pub fn as_resume_guard_forced(&self) -> &Rc<ResumeGuardForcedDescr> {
        match self {
            DescrRef::ResumeGuardForced(d) => d,
            other => panic!("expected forced resume guard descr, got {other:?}"),
        }
    }

    pub fn is_resume_guard(&self) -> bool {
        matches!(self, DescrRef::ResumeGuard(_) | DescrRef::ResumeGuardForced(_))
    }

    /// Pointer identity, for CSE keys: interning guarantees one
    /// allocation per distinct descr
    pub fn address(&self) -> usize {
        match self {
            DescrRef::Call(d) => Rc::as_ptr(d) as usize,
            DescrRef::Field(d) => Rc::as_ptr(d) as usize,
            DescrRef::Array(d) => Rc::as_ptr(d) as usize,
            DescrRef::Size(d) => Rc::as_ptr(d) as usize,
            DescrRef::SwitchDict(d) => Rc::as_ptr(d) as usize,
            DescrRef::ResumeGuard(d) => Rc::as_ptr(d) as usize,
            DescrRef::ResumeGuardForced(d) => Rc::as_ptr(d) as usize,
        }
    }
}

impl PartialEq for DescrRef {
    fn eq(&self, other: &Self) -> bool {
        self.address() == other.address()
    }
}

impl Eq for DescrRef {}

impl std::hash::Hash for DescrRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}
