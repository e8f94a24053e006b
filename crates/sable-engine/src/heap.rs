//! Guest heap model
//!
//! The engine works against a small reference-counted heap: structs with a
//! class (vtable) and kind-tagged fields, and fixed-length arrays. Field
//! and element layout is whatever the descrs say; the JIT never looks
//! inside an object except through a descr.

use std::cell::RefCell;
use std::rc::Rc;

/// Value kind tag. Mixing kinds in a register or field is a bug.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Int,
    Ref,
    Float,
}

impl Kind {
    pub fn letter(self) -> char {
        match self {
            Kind::Int => 'i',
            Kind::Ref => 'r',
            Kind::Float => 'f',
        }
    }
}

/// Identifier of a guest class (its vtable).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClassId(pub u32);

/// A concrete guest value.
#[derive(Debug, Clone)]
pub enum RawValue {
    Int(i64),
    Ref(GcRef),
    Float(f64),
}

impl RawValue {
    pub fn kind(&self) -> Kind {
        match self {
            RawValue::Int(_) => Kind::Int,
            RawValue::Ref(_) => Kind::Ref,
            RawValue::Float(_) => Kind::Float,
        }
    }

    pub fn default_of(kind: Kind) -> RawValue {
        match kind {
            Kind::Int => RawValue::Int(0),
            Kind::Ref => RawValue::Ref(GcRef::null()),
            Kind::Float => RawValue::Float(0.0),
        }
    }

    pub fn as_int(&self) -> i64 {
        match self {
            RawValue::Int(v) => *v,
            other => panic!("expected int value, got {:?} kind", other.kind()),
        }
    }

    pub fn as_ref(&self) -> GcRef {
        match self {
            RawValue::Ref(r) => r.clone(),
            other => panic!("expected ref value, got {:?} kind", other.kind()),
        }
    }

    pub fn as_float(&self) -> f64 {
        match self {
            RawValue::Float(v) => *v,
            other => panic!("expected float value, got {:?} kind", other.kind()),
        }
    }
}

// Value equality as the guards see it: ints by value, refs by identity,
// floats by bit pattern.
impl PartialEq for RawValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (RawValue::Int(a), RawValue::Int(b)) => a == b,
            (RawValue::Ref(a), RawValue::Ref(b)) => a.same_object(b),
            (RawValue::Float(a), RawValue::Float(b)) => a.to_bits() == b.to_bits(),
            _ => false,
        }
    }
}

impl Eq for RawValue {}

impl std::hash::Hash for RawValue {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            RawValue::Int(v) => {
                0u8.hash(state);
                v.hash(state);
            }
            RawValue::Ref(r) => {
                1u8.hash(state);
                r.address().hash(state);
            }
            RawValue::Float(v) => {
                2u8.hash(state);
                v.to_bits().hash(state);
            }
        }
    }
}

/// Payload of one heap cell.
#[derive(Debug)]
pub enum HeapData {
    /// Fields by descr offset
    Struct(Vec<RawValue>),
    /// Fixed-length array of one kind
    Array(Vec<RawValue>),
}

#[derive(Debug)]
pub struct HeapCell {
    pub class: Option<ClassId>,
    pub data: RefCell<HeapData>,
}

/// Nullable reference to a heap cell. Identity is pointer identity.
#[derive(Debug, Clone, Default)]
pub struct GcRef(Option<Rc<HeapCell>>);

impl GcRef {
    pub fn null() -> GcRef {
        GcRef(None)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    /// Allocate a struct with `size` fields, all zeroed to their kind
    pub fn alloc_struct(size: usize, kinds: &[Kind], class: Option<ClassId>) -> GcRef {
        debug_assert_eq!(kinds.len(), size);
        let fields = kinds.iter().map(|&k| RawValue::default_of(k)).collect();
        GcRef(Some(Rc::new(HeapCell {
            class,
            data: RefCell::new(HeapData::Struct(fields)),
        })))
    }

    /// Allocate an array of `len` elements of one kind
    pub fn alloc_array(len: usize, kind: Kind) -> GcRef {
        let items = (0..len).map(|_| RawValue::default_of(kind)).collect();
        GcRef(Some(Rc::new(HeapCell {
            class: None,
            data: RefCell::new(HeapData::Array(items)),
        })))
    }

    pub fn class(&self) -> Option<ClassId> {
        self.0.as_ref().and_then(|cell| cell.class)
    }

    /// Stable address for hashing and identity comparison (0 for null)
    pub fn address(&self) -> usize {
        match &self.0 {
            Some(rc) => Rc::as_ptr(rc) as usize,
            None => 0,
        }
    }

    pub fn same_object(&self, other: &GcRef) -> bool {
        self.address() == other.address()
    }

    fn cell(&self) -> &Rc<HeapCell> {
        self.0.as_ref().expect("null dereference in guest heap")
    }

    pub fn get_field(&self, offset: usize) -> RawValue {
        match &*self.cell().data.borrow() {
            HeapData::Struct(fields) => fields[offset].clone(),
            HeapData::Array(_) => panic!("field read on array object"),
        }
    }

    pub fn set_field(&self, offset: usize, value: RawValue) {
        match &mut *self.cell().data.borrow_mut() {
            HeapData::Struct(fields) => {
                debug_assert_eq!(fields[offset].kind(), value.kind());
                fields[offset] = value;
            }
            HeapData::Array(_) => panic!("field write on array object"),
        }
    }

    pub fn get_item(&self, index: usize) -> RawValue {
        match &*self.cell().data.borrow() {
            HeapData::Array(items) => items[index].clone(),
            HeapData::Struct(_) => panic!("array read on struct object"),
        }
    }

    pub fn set_item(&self, index: usize, value: RawValue) {
        match &mut *self.cell().data.borrow_mut() {
            HeapData::Array(items) => {
                debug_assert_eq!(items[index].kind(), value.kind());
                items[index] = value;
            }
            HeapData::Struct(_) => panic!("array write on struct object"),
        }
    }

    pub fn array_len(&self) -> usize {
        match &*self.cell().data.borrow() {
            HeapData::Array(items) => items.len(),
            HeapData::Struct(_) => panic!("array length of struct object"),
        }
    }
}

impl PartialEq for GcRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_object(other)
    }
}

impl Eq for GcRef {}

impl std::hash::Hash for GcRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.address().hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_fields() {
        let obj = GcRef::alloc_struct(2, &[Kind::Int, Kind::Ref], Some(ClassId(7)));
        assert_eq!(obj.class(), Some(ClassId(7)));
        assert_eq!(obj.get_field(0), RawValue::Int(0));
        obj.set_field(0, RawValue::Int(42));
        assert_eq!(obj.get_field(0), RawValue::Int(42));
    }

    #[test]
    fn test_array_items() {
        let arr = GcRef::alloc_array(3, Kind::Int);
        assert_eq!(arr.array_len(), 3);
        arr.set_item(2, RawValue::Int(-5));
        assert_eq!(arr.get_item(2), RawValue::Int(-5));
    }

    #[test]
    fn test_ref_identity_not_structure() {
        let a = GcRef::alloc_struct(1, &[Kind::Int], None);
        let b = GcRef::alloc_struct(1, &[Kind::Int], None);
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(GcRef::null().is_null());
        assert_eq!(GcRef::null(), GcRef::null());
    }

    #[test]
    #[should_panic(expected = "null dereference")]
    fn test_null_dereference_panics() {
        GcRef::null().get_field(0);
    }
}
