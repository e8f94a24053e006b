//! Guest jitcode: the bytecode the meta-interpreter executes
//!
//! A `JitCode` is a flat byte array plus side tables: constant pools
//! partitioned by kind, register counts per kind, and an interned descr
//! table. Encoding per operation:
//! - byte 0: opcode
//! - argument bytes per the opcode's signature:
//!   - register argument (`i`/`r`/`f`): one register index byte
//!   - small constant (`c`): one signed byte
//!   - constant pool / descr / jitcode / function index: two
//!     little-endian bytes
//!   - label: two little-endian pc bytes
//!   - box list: one length byte, then that many register index bytes
//!   - `orgpc`: no bytes; the decoder supplies the operation's start pc
//! - opcodes producing a value carry one trailing destination register
//!   byte
//!
//! `JitCodeBuilder` is the code-writer side: label back-patching,
//! constant pooling, and descr interning, producing immutable `JitCode`s
//! collected into a `Program`.

use std::rc::Rc;

use rustc_hash::FxHashMap;

use crate::error::GuestException;
use crate::heap::{ClassId, GcRef, Kind, RawValue};
use crate::ir::descr::{
    ArrayDescr, CallDescr, CallEffect, DescrRef, FieldDescr, SizeDescr, SwitchDictDescr,
};
use crate::ir::execute::ExecContext;

/// Host function callable from guest code via residual calls.
pub type ResidualFn =
    Rc<dyn Fn(&ExecContext<'_>, &[RawValue]) -> Result<Option<RawValue>, GuestException>>;

// ===== Opcodes =====

/// Guest opcode set. Argument signatures are listed per opcode; `>k`
/// marks a trailing destination register of kind `k`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum JcOp {
    // constants and moves
    IntConst = 0,      // c >i
    IntFromPool = 1,   // pool16 >i
    RefFromPool = 2,   // pool16 >r
    FloatFromPool = 3, // pool16 >f
    RefNull = 4,       // >r
    IntCopy = 5,       // i >i
    RefCopy = 6,       // r >r
    FloatCopy = 7,     // f >f

    // integer arithmetic and comparison
    IntAdd = 10, // i i >i
    IntSub = 11,
    IntMul = 12,
    IntFloordiv = 13,
    IntMod = 14,
    IntAnd = 15,
    IntOr = 16,
    IntXor = 17,
    IntLshift = 18,
    IntRshift = 19,
    UintRshift = 20,
    IntLt = 21,
    IntLe = 22,
    IntEq = 23,
    IntNe = 24,
    IntGt = 25,
    IntGe = 26,
    UintLt = 27,
    UintLe = 28,
    UintGt = 29,
    UintGe = 30,
    IntIsTrue = 31, // i >i
    IntNeg = 32,
    IntAbs = 33,
    IntAddOvf = 34, // i i orgpc >i
    IntSubOvf = 35,
    IntMulOvf = 36,
    CheckZeroDivision = 37, // i orgpc
    CheckDivOverflow = 38,  // i i orgpc

    // float arithmetic and comparison
    FloatAdd = 40, // f f >f
    FloatSub = 41,
    FloatMul = 42,
    FloatDiv = 43,
    FloatNeg = 44, // f >f
    FloatLt = 45,  // f f >i
    FloatLe = 46,
    FloatEq = 47,
    FloatNe = 48,
    FloatGt = 49,
    FloatGe = 50,

    // pointers
    PtrEq = 55,      // r r >i
    PtrNe = 56,      // r r >i
    RefIsNull = 57,  // r orgpc >i
    RefNonNull = 58, // r orgpc >i

    // control flow
    Goto = 60,      // label
    GotoIfNot = 61, // label i orgpc
    Switch = 62,    // i descr16 orgpc
    IntReturn = 63, // i
    RefReturn = 64,
    FloatReturn = 65,
    VoidReturn = 66,

    // heap
    New = 70,           // descr16 >r
    NewWithVtable = 71, // descr16 >r
    NewArray = 72,      // descr16 i >r
    GetfieldGc = 73,    // r descr16 >k
    GetfieldGcPure = 74,
    SetfieldGc = 75,      // r descr16 k
    GetarrayitemGc = 76,  // r descr16 i >k
    GetarrayitemGcPure = 77,
    SetarrayitemGc = 78, // r descr16 i k
    ArraylenGc = 79,     // r >i
    GetfieldVable = 80,  // r descr16 >k
    SetfieldVable = 81,  // r descr16 k

    // calls
    InlineCall = 85,            // jitcode16 boxes3 >res?
    ResidualCall = 86,          // descr16 func16 boxes3 >res?
    ResidualCallPure = 87,      // descr16 func16 boxes3 >res?
    ResidualCallMayForce = 88,  // descr16 func16 boxes3 orgpc >res?
    ResidualCallLoopinvariant = 89, // descr16 func16 boxes3 >res?

    // exceptions
    CatchException = 95,           // label
    LastExcValue = 96,             // >r
    GotoIfExceptionMismatch = 97,  // class16 label orgpc
    Raise = 98,                    // r
    Reraise = 99,                  //

    // driver hints and promotion
    JitMergePoint = 105, // boxes(i greens) boxes3(reds)
    CanEnterJit = 106,   // boxes(i greens) boxes3(reds)
    Promote = 107,       // i orgpc >i
    GuardClass = 108,    // r orgpc >i
    Keepalive = 109,     // r
    Unsupported = 110,   //
}

impl JcOp {
    pub fn from_byte(byte: u8) -> JcOp {
        use JcOp::*;
        const TABLE: &[(u8, JcOp)] = &[
            (0, IntConst),
            (1, IntFromPool),
            (2, RefFromPool),
            (3, FloatFromPool),
            (4, RefNull),
            (5, IntCopy),
            (6, RefCopy),
            (7, FloatCopy),
            (10, IntAdd),
            (11, IntSub),
            (12, IntMul),
            (13, IntFloordiv),
            (14, IntMod),
            (15, IntAnd),
            (16, IntOr),
            (17, IntXor),
            (18, IntLshift),
            (19, IntRshift),
            (20, UintRshift),
            (21, IntLt),
            (22, IntLe),
            (23, IntEq),
            (24, IntNe),
            (25, IntGt),
            (26, IntGe),
            (27, UintLt),
            (28, UintLe),
            (29, UintGt),
            (30, UintGe),
            (31, IntIsTrue),
            (32, IntNeg),
            (33, IntAbs),
            (34, IntAddOvf),
            (35, IntSubOvf),
            (36, IntMulOvf),
            (37, CheckZeroDivision),
            (38, CheckDivOverflow),
            (40, FloatAdd),
            (41, FloatSub),
            (42, FloatMul),
            (43, FloatDiv),
            (44, FloatNeg),
            (45, FloatLt),
            (46, FloatLe),
            (47, FloatEq),
            (48, FloatNe),
            (49, FloatGt),
            (50, FloatGe),
            (55, PtrEq),
            (56, PtrNe),
            (57, RefIsNull),
            (58, RefNonNull),
            (60, Goto),
            (61, GotoIfNot),
            (62, Switch),
            (63, IntReturn),
            (64, RefReturn),
            (65, FloatReturn),
            (66, VoidReturn),
            (70, New),
            (71, NewWithVtable),
            (72, NewArray),
            (73, GetfieldGc),
            (74, GetfieldGcPure),
            (75, SetfieldGc),
            (76, GetarrayitemGc),
            (77, GetarrayitemGcPure),
            (78, SetarrayitemGc),
            (79, ArraylenGc),
            (80, GetfieldVable),
            (81, SetfieldVable),
            (85, InlineCall),
            (86, ResidualCall),
            (87, ResidualCallPure),
            (88, ResidualCallMayForce),
            (89, ResidualCallLoopinvariant),
            (95, CatchException),
            (96, LastExcValue),
            (97, GotoIfExceptionMismatch),
            (98, Raise),
            (99, Reraise),
            (105, JitMergePoint),
            (106, CanEnterJit),
            (107, Promote),
            (108, GuardClass),
            (109, Keepalive),
            (110, Unsupported),
        ];
        for &(b, op) in TABLE {
            if b == byte {
                return op;
            }
        }
        panic!("bad opcode byte {byte}");
    }
}

// ===== JitCode =====

/// Immutable compiled-from-guest bytecode plus side tables.
pub struct JitCode {
    pub name: String,
    pub code: Vec<u8>,
    pub constants_i: Vec<i64>,
    pub constants_r: Vec<GcRef>,
    pub constants_f: Vec<f64>,
    pub num_regs_i: usize,
    pub num_regs_r: usize,
    pub num_regs_f: usize,
    pub descrs: Vec<DescrRef>,
    pub result_kind: Option<Kind>,
    /// Index in the owning program's jitcode table
    pub index: usize,
}

impl JitCode {
    pub fn num_regs(&self, kind: Kind) -> usize {
        match kind {
            Kind::Int => self.num_regs_i,
            Kind::Ref => self.num_regs_r,
            Kind::Float => self.num_regs_f,
        }
    }
}

impl std::fmt::Debug for JitCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<jitcode {}>", self.name)
    }
}

/// Positional byte decoder over a jitcode.
pub struct Decoder<'a> {
    pub code: &'a [u8],
    pub pc: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(jitcode: &'a JitCode, pc: usize) -> Decoder<'a> {
        Decoder {
            code: &jitcode.code,
            pc,
        }
    }

    pub fn next_op(&mut self) -> JcOp {
        let op = JcOp::from_byte(self.code[self.pc]);
        self.pc += 1;
        op
    }

    pub fn next_byte(&mut self) -> u8 {
        let b = self.code[self.pc];
        self.pc += 1;
        b
    }

    pub fn next_signed(&mut self) -> i8 {
        self.next_byte() as i8
    }

    pub fn next_u16(&mut self) -> u16 {
        let lo = self.next_byte() as u16;
        let hi = self.next_byte() as u16;
        lo | (hi << 8)
    }

    /// One length-prefixed register index list
    pub fn next_reg_list(&mut self) -> Vec<u8> {
        let len = self.next_byte() as usize;
        (0..len).map(|_| self.next_byte()).collect()
    }

    /// Three length-prefixed lists, one per kind (ints, refs, floats)
    pub fn next_reg_lists3(&mut self) -> (Vec<u8>, Vec<u8>, Vec<u8>) {
        let ints = self.next_reg_list();
        let refs = self.next_reg_list();
        let floats = self.next_reg_list();
        (ints, refs, floats)
    }
}

// ===== Program =====

/// A guest class definition.
#[derive(Debug)]
pub struct ClassDef {
    pub name: String,
    pub field_kinds: Vec<Kind>,
}

/// Everything the engine needs about one guest program: jitcodes,
/// residual functions, classes, and the well-known exception classes.
pub struct Program {
    pub jitcodes: Vec<Rc<JitCode>>,
    pub functions: Vec<(String, ResidualFn)>,
    pub classes: Vec<ClassDef>,
    pub exc_overflow: ClassId,
    pub exc_zero_division: ClassId,
}

impl Program {
    pub fn jitcode(&self, index: usize) -> &Rc<JitCode> {
        &self.jitcodes[index]
    }

    pub fn class(&self, id: ClassId) -> &ClassDef {
        &self.classes[id.0 as usize]
    }

    pub fn function(&self, index: usize) -> &ResidualFn {
        &self.functions[index].1
    }

    /// Allocate a fresh instance of an exception class
    pub fn raise_instance(&self, class: ClassId) -> GuestException {
        let def = self.class(class);
        GuestException {
            value: GcRef::alloc_struct(def.field_kinds.len(), &def.field_kinds, Some(class)),
        }
    }
}

// ===== Builders =====

/// Builder for a whole guest program: classes, residual functions, descr
/// interning, and the jitcode table.
pub struct ProgramBuilder {
    classes: Vec<ClassDef>,
    functions: Vec<(String, ResidualFn)>,
    jitcodes: Vec<Rc<JitCode>>,
    field_interner: FxHashMap<(u32, usize), Rc<FieldDescr>>,
    array_interner: FxHashMap<Kind, Rc<ArrayDescr>>,
    exc_overflow: ClassId,
    exc_zero_division: ClassId,
}

impl ProgramBuilder {
    pub fn new() -> ProgramBuilder {
        let mut pb = ProgramBuilder {
            classes: vec![],
            functions: vec![],
            jitcodes: vec![],
            field_interner: FxHashMap::default(),
            array_interner: FxHashMap::default(),
            exc_overflow: ClassId(0),
            exc_zero_division: ClassId(0),
        };
        pb.exc_overflow = pb.add_class("OverflowError", vec![]);
        pb.exc_zero_division = pb.add_class("ZeroDivisionError", vec![]);
        pb
    }

    pub fn add_class(&mut self, name: &str, field_kinds: Vec<Kind>) -> ClassId {
        let id = ClassId(self.classes.len() as u32);
        self.classes.push(ClassDef {
            name: name.to_string(),
            field_kinds,
        });
        id
    }

    pub fn overflow_class(&self) -> ClassId {
        self.exc_overflow
    }

    pub fn zero_division_class(&self) -> ClassId {
        self.exc_zero_division
    }

    /// Interned: two calls for the same `(class, field)` share one descr
    pub fn field_descr(&mut self, class: ClassId, index: usize) -> Rc<FieldDescr> {
        if let Some(d) = self.field_interner.get(&(class.0, index)) {
            return d.clone();
        }
        let def = &self.classes[class.0 as usize];
        let descr = Rc::new(FieldDescr {
            class,
            offset: index,
            kind: def.field_kinds[index],
            name: format!("{}.f{}", def.name, index),
        });
        self.field_interner.insert((class.0, index), descr.clone());
        descr
    }

    pub fn array_descr(&mut self, kind: Kind) -> Rc<ArrayDescr> {
        self.array_interner
            .entry(kind)
            .or_insert_with(|| Rc::new(ArrayDescr { kind }))
            .clone()
    }

    pub fn size_descr(&mut self, field_kinds: Vec<Kind>) -> Rc<SizeDescr> {
        Rc::new(SizeDescr {
            field_kinds,
            vtable: None,
        })
    }

    pub fn size_vtable_descr(&mut self, class: ClassId) -> Rc<SizeDescr> {
        let def = &self.classes[class.0 as usize];
        Rc::new(SizeDescr {
            field_kinds: def.field_kinds.clone(),
            vtable: Some(class),
        })
    }

    pub fn call_descr(
        &mut self,
        arg_kinds: Vec<Kind>,
        result: Option<Kind>,
        effect: CallEffect,
    ) -> Rc<CallDescr> {
        Rc::new(CallDescr {
            arg_kinds,
            result,
            effect,
        })
    }

    pub fn register_function(&mut self, name: &str, f: ResidualFn) -> u16 {
        self.functions.push((name.to_string(), f));
        (self.functions.len() - 1) as u16
    }

    /// Install a finished jitcode; returns its program-level index
    pub fn add_jitcode(&mut self, mut jitcode: JitCode) -> usize {
        let index = self.jitcodes.len();
        jitcode.index = index;
        self.jitcodes.push(Rc::new(jitcode));
        index
    }

    pub fn finish(self) -> Rc<Program> {
        Rc::new(Program {
            jitcodes: self.jitcodes,
            functions: self.functions,
            classes: self.classes,
            exc_overflow: self.exc_overflow,
            exc_zero_division: self.exc_zero_division,
        })
    }
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed register handles keep the three register files apart at build
/// time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegI(pub u8);
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegR(pub u8);
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegF(pub u8);

/// A forward-referencable position in the jitcode being built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JcLabel(usize);

/// Code-writer-side assembler for one jitcode.
pub struct JitCodeBuilder {
    name: String,
    result_kind: Option<Kind>,
    code: Vec<u8>,
    constants_i: Vec<i64>,
    constants_r: Vec<GcRef>,
    constants_f: Vec<f64>,
    descrs: Vec<Option<DescrRef>>,
    descr_index: FxHashMap<usize, u16>,
    labels: Vec<Option<usize>>,
    label_fixups: Vec<(usize, JcLabel)>,
    pending_switches: Vec<(u16, Vec<(i64, JcLabel)>)>,
    num_regs_i: usize,
    num_regs_r: usize,
    num_regs_f: usize,
}

impl JitCodeBuilder {
    pub fn new(name: &str, result_kind: Option<Kind>) -> JitCodeBuilder {
        JitCodeBuilder {
            name: name.to_string(),
            result_kind,
            code: vec![],
            constants_i: vec![],
            constants_r: vec![],
            constants_f: vec![],
            descrs: vec![],
            descr_index: FxHashMap::default(),
            labels: vec![],
            label_fixups: vec![],
            pending_switches: vec![],
            num_regs_i: 0,
            num_regs_r: 0,
            num_regs_f: 0,
        }
    }

    // --- registers and labels ---

    pub fn new_reg_i(&mut self) -> RegI {
        let r = RegI(self.num_regs_i as u8);
        self.num_regs_i += 1;
        r
    }

    pub fn new_reg_r(&mut self) -> RegR {
        let r = RegR(self.num_regs_r as u8);
        self.num_regs_r += 1;
        r
    }

    pub fn new_reg_f(&mut self) -> RegF {
        let r = RegF(self.num_regs_f as u8);
        self.num_regs_f += 1;
        r
    }

    pub fn new_label(&mut self) -> JcLabel {
        let label = JcLabel(self.labels.len());
        self.labels.push(None);
        label
    }

    pub fn bind(&mut self, label: JcLabel) {
        assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.code.len());
    }

    // --- low-level emission ---

    fn op(&mut self, op: JcOp) {
        self.code.push(op as u8);
    }

    fn byte(&mut self, b: u8) {
        self.code.push(b);
    }

    fn u16(&mut self, v: u16) {
        self.code.push((v & 0xff) as u8);
        self.code.push((v >> 8) as u8);
    }

    fn label_ref(&mut self, label: JcLabel) {
        self.label_fixups.push((self.code.len(), label));
        self.u16(0);
    }

    fn descr(&mut self, descr: DescrRef) -> u16 {
        let key = descr.address();
        if let Some(&idx) = self.descr_index.get(&key) {
            return idx;
        }
        let idx = self.descrs.len() as u16;
        self.descrs.push(Some(descr));
        self.descr_index.insert(key, idx);
        idx
    }

    fn descr_ref(&mut self, descr: DescrRef) {
        let idx = self.descr(descr);
        self.u16(idx);
    }

    fn pool_i(&mut self, value: i64) -> u16 {
        if let Some(pos) = self.constants_i.iter().position(|&v| v == value) {
            return pos as u16;
        }
        self.constants_i.push(value);
        (self.constants_i.len() - 1) as u16
    }

    fn reg_list_i(&mut self, regs: &[RegI]) {
        self.byte(regs.len() as u8);
        for r in regs {
            self.byte(r.0);
        }
    }

    fn reg_list_r(&mut self, regs: &[RegR]) {
        self.byte(regs.len() as u8);
        for r in regs {
            self.byte(r.0);
        }
    }

    fn reg_list_f(&mut self, regs: &[RegF]) {
        self.byte(regs.len() as u8);
        for r in regs {
            self.byte(r.0);
        }
    }

    // --- constants and moves ---

    pub fn int_const(&mut self, dst: RegI, value: i64) {
        if (-128..128).contains(&value) {
            self.op(JcOp::IntConst);
            self.byte(value as i8 as u8);
            self.byte(dst.0);
        } else {
            let idx = self.pool_i(value);
            self.op(JcOp::IntFromPool);
            self.u16(idx);
            self.byte(dst.0);
        }
    }

    pub fn ref_const(&mut self, dst: RegR, value: GcRef) {
        self.constants_r.push(value);
        let idx = (self.constants_r.len() - 1) as u16;
        self.op(JcOp::RefFromPool);
        self.u16(idx);
        self.byte(dst.0);
    }

    pub fn float_const(&mut self, dst: RegF, value: f64) {
        self.constants_f.push(value);
        let idx = (self.constants_f.len() - 1) as u16;
        self.op(JcOp::FloatFromPool);
        self.u16(idx);
        self.byte(dst.0);
    }

    pub fn ref_null(&mut self, dst: RegR) {
        self.op(JcOp::RefNull);
        self.byte(dst.0);
    }

    pub fn int_copy(&mut self, dst: RegI, src: RegI) {
        self.op(JcOp::IntCopy);
        self.byte(src.0);
        self.byte(dst.0);
    }

    pub fn ref_copy(&mut self, dst: RegR, src: RegR) {
        self.op(JcOp::RefCopy);
        self.byte(src.0);
        self.byte(dst.0);
    }

    pub fn float_copy(&mut self, dst: RegF, src: RegF) {
        self.op(JcOp::FloatCopy);
        self.byte(src.0);
        self.byte(dst.0);
    }

    // --- integer operations ---

    fn int_binary(&mut self, op: JcOp, dst: RegI, a: RegI, b: RegI) {
        self.op(op);
        self.byte(a.0);
        self.byte(b.0);
        self.byte(dst.0);
    }

    pub fn int_add(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntAdd, dst, a, b);
    }

    pub fn int_sub(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntSub, dst, a, b);
    }

    pub fn int_mul(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntMul, dst, a, b);
    }

    pub fn int_floordiv(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntFloordiv, dst, a, b);
    }

    pub fn int_mod(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntMod, dst, a, b);
    }

    pub fn int_and(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntAnd, dst, a, b);
    }

    pub fn int_or(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntOr, dst, a, b);
    }

    pub fn int_xor(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntXor, dst, a, b);
    }

    pub fn int_lshift(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntLshift, dst, a, b);
    }

    pub fn int_rshift(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntRshift, dst, a, b);
    }

    pub fn uint_rshift(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::UintRshift, dst, a, b);
    }

    pub fn int_lt(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntLt, dst, a, b);
    }

    pub fn int_le(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntLe, dst, a, b);
    }

    pub fn int_eq(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntEq, dst, a, b);
    }

    pub fn int_ne(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntNe, dst, a, b);
    }

    pub fn int_gt(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntGt, dst, a, b);
    }

    pub fn int_ge(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntGe, dst, a, b);
    }

    pub fn uint_lt(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::UintLt, dst, a, b);
    }

    pub fn uint_le(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::UintLe, dst, a, b);
    }

    pub fn uint_gt(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::UintGt, dst, a, b);
    }

    pub fn uint_ge(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::UintGe, dst, a, b);
    }

    pub fn int_is_true(&mut self, dst: RegI, a: RegI) {
        self.op(JcOp::IntIsTrue);
        self.byte(a.0);
        self.byte(dst.0);
    }

    pub fn int_neg(&mut self, dst: RegI, a: RegI) {
        self.op(JcOp::IntNeg);
        self.byte(a.0);
        self.byte(dst.0);
    }

    pub fn int_abs(&mut self, dst: RegI, a: RegI) {
        self.op(JcOp::IntAbs);
        self.byte(a.0);
        self.byte(dst.0);
    }

    pub fn int_add_ovf(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntAddOvf, dst, a, b);
    }

    pub fn int_sub_ovf(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntSubOvf, dst, a, b);
    }

    pub fn int_mul_ovf(&mut self, dst: RegI, a: RegI, b: RegI) {
        self.int_binary(JcOp::IntMulOvf, dst, a, b);
    }

    pub fn check_zero_division(&mut self, divisor: RegI) {
        self.op(JcOp::CheckZeroDivision);
        self.byte(divisor.0);
    }

    pub fn check_div_overflow(&mut self, a: RegI, b: RegI) {
        self.op(JcOp::CheckDivOverflow);
        self.byte(a.0);
        self.byte(b.0);
    }

    // --- float operations ---

    fn float_binary(&mut self, op: JcOp, dst: RegF, a: RegF, b: RegF) {
        self.op(op);
        self.byte(a.0);
        self.byte(b.0);
        self.byte(dst.0);
    }

    pub fn float_add(&mut self, dst: RegF, a: RegF, b: RegF) {
        self.float_binary(JcOp::FloatAdd, dst, a, b);
    }

    pub fn float_sub(&mut self, dst: RegF, a: RegF, b: RegF) {
        self.float_binary(JcOp::FloatSub, dst, a, b);
    }

    pub fn float_mul(&mut self, dst: RegF, a: RegF, b: RegF) {
        self.float_binary(JcOp::FloatMul, dst, a, b);
    }

    pub fn float_div(&mut self, dst: RegF, a: RegF, b: RegF) {
        self.float_binary(JcOp::FloatDiv, dst, a, b);
    }

    pub fn float_neg(&mut self, dst: RegF, a: RegF) {
        self.op(JcOp::FloatNeg);
        self.byte(a.0);
        self.byte(dst.0);
    }

    fn float_compare(&mut self, op: JcOp, dst: RegI, a: RegF, b: RegF) {
        self.op(op);
        self.byte(a.0);
        self.byte(b.0);
        self.byte(dst.0);
    }

    pub fn float_lt(&mut self, dst: RegI, a: RegF, b: RegF) {
        self.float_compare(JcOp::FloatLt, dst, a, b);
    }

    pub fn float_le(&mut self, dst: RegI, a: RegF, b: RegF) {
        self.float_compare(JcOp::FloatLe, dst, a, b);
    }

    pub fn float_eq(&mut self, dst: RegI, a: RegF, b: RegF) {
        self.float_compare(JcOp::FloatEq, dst, a, b);
    }

    pub fn float_ne(&mut self, dst: RegI, a: RegF, b: RegF) {
        self.float_compare(JcOp::FloatNe, dst, a, b);
    }

    pub fn float_gt(&mut self, dst: RegI, a: RegF, b: RegF) {
        self.float_compare(JcOp::FloatGt, dst, a, b);
    }

    pub fn float_ge(&mut self, dst: RegI, a: RegF, b: RegF) {
        self.float_compare(JcOp::FloatGe, dst, a, b);
    }

    // --- pointers ---

    pub fn ptr_eq(&mut self, dst: RegI, a: RegR, b: RegR) {
        self.op(JcOp::PtrEq);
        self.byte(a.0);
        self.byte(b.0);
        self.byte(dst.0);
    }

    pub fn ptr_ne(&mut self, dst: RegI, a: RegR, b: RegR) {
        self.op(JcOp::PtrNe);
        self.byte(a.0);
        self.byte(b.0);
        self.byte(dst.0);
    }

    pub fn ref_is_null(&mut self, dst: RegI, a: RegR) {
        self.op(JcOp::RefIsNull);
        self.byte(a.0);
        self.byte(dst.0);
    }

    pub fn ref_non_null(&mut self, dst: RegI, a: RegR) {
        self.op(JcOp::RefNonNull);
        self.byte(a.0);
        self.byte(dst.0);
    }

    // --- control flow ---

    pub fn goto(&mut self, target: JcLabel) {
        self.op(JcOp::Goto);
        self.label_ref(target);
    }

    /// Jump to `target` when `cond` is zero
    pub fn goto_if_not(&mut self, target: JcLabel, cond: RegI) {
        self.op(JcOp::GotoIfNot);
        self.label_ref(target);
        self.byte(cond.0);
    }

    pub fn switch(&mut self, selector: RegI, cases: &[(i64, JcLabel)]) {
        self.op(JcOp::Switch);
        self.byte(selector.0);
        // descr slot filled at finish time, once labels are resolved
        let idx = self.descrs.len() as u16;
        self.descrs.push(None);
        self.pending_switches.push((idx, cases.to_vec()));
        self.u16(idx);
    }

    pub fn int_return(&mut self, value: RegI) {
        self.op(JcOp::IntReturn);
        self.byte(value.0);
    }

    pub fn ref_return(&mut self, value: RegR) {
        self.op(JcOp::RefReturn);
        self.byte(value.0);
    }

    pub fn float_return(&mut self, value: RegF) {
        self.op(JcOp::FloatReturn);
        self.byte(value.0);
    }

    pub fn void_return(&mut self) {
        self.op(JcOp::VoidReturn);
    }

    // --- heap ---

    pub fn new_struct(&mut self, dst: RegR, descr: Rc<SizeDescr>) {
        self.op(JcOp::New);
        self.descr_ref(DescrRef::Size(descr));
        self.byte(dst.0);
    }

    pub fn new_with_vtable(&mut self, dst: RegR, descr: Rc<SizeDescr>) {
        assert!(descr.vtable.is_some());
        self.op(JcOp::NewWithVtable);
        self.descr_ref(DescrRef::Size(descr));
        self.byte(dst.0);
    }

    pub fn new_array(&mut self, dst: RegR, descr: Rc<ArrayDescr>, len: RegI) {
        self.op(JcOp::NewArray);
        self.descr_ref(DescrRef::Array(descr));
        self.byte(len.0);
        self.byte(dst.0);
    }

    fn getfield_like(&mut self, op: JcOp, obj: RegR, descr: Rc<FieldDescr>, dst: u8) {
        self.op(op);
        self.byte(obj.0);
        self.descr_ref(DescrRef::Field(descr));
        self.byte(dst);
    }

    pub fn getfield_gc_i(&mut self, dst: RegI, obj: RegR, descr: Rc<FieldDescr>) {
        debug_assert_eq!(descr.kind, Kind::Int);
        self.getfield_like(JcOp::GetfieldGc, obj, descr, dst.0);
    }

    pub fn getfield_gc_r(&mut self, dst: RegR, obj: RegR, descr: Rc<FieldDescr>) {
        debug_assert_eq!(descr.kind, Kind::Ref);
        self.getfield_like(JcOp::GetfieldGc, obj, descr, dst.0);
    }

    pub fn getfield_gc_f(&mut self, dst: RegF, obj: RegR, descr: Rc<FieldDescr>) {
        debug_assert_eq!(descr.kind, Kind::Float);
        self.getfield_like(JcOp::GetfieldGc, obj, descr, dst.0);
    }

    pub fn getfield_gc_pure_i(&mut self, dst: RegI, obj: RegR, descr: Rc<FieldDescr>) {
        debug_assert_eq!(descr.kind, Kind::Int);
        self.getfield_like(JcOp::GetfieldGcPure, obj, descr, dst.0);
    }

    pub fn getfield_gc_pure_r(&mut self, dst: RegR, obj: RegR, descr: Rc<FieldDescr>) {
        debug_assert_eq!(descr.kind, Kind::Ref);
        self.getfield_like(JcOp::GetfieldGcPure, obj, descr, dst.0);
    }

    fn setfield_like(&mut self, op: JcOp, obj: RegR, descr: Rc<FieldDescr>, value: u8) {
        self.op(op);
        self.byte(obj.0);
        self.descr_ref(DescrRef::Field(descr));
        self.byte(value);
    }

    pub fn setfield_gc_i(&mut self, obj: RegR, descr: Rc<FieldDescr>, value: RegI) {
        debug_assert_eq!(descr.kind, Kind::Int);
        self.setfield_like(JcOp::SetfieldGc, obj, descr, value.0);
    }

    pub fn setfield_gc_r(&mut self, obj: RegR, descr: Rc<FieldDescr>, value: RegR) {
        debug_assert_eq!(descr.kind, Kind::Ref);
        self.setfield_like(JcOp::SetfieldGc, obj, descr, value.0);
    }

    pub fn setfield_gc_f(&mut self, obj: RegR, descr: Rc<FieldDescr>, value: RegF) {
        debug_assert_eq!(descr.kind, Kind::Float);
        self.setfield_like(JcOp::SetfieldGc, obj, descr, value.0);
    }

    pub fn getfield_vable_i(&mut self, dst: RegI, obj: RegR, descr: Rc<FieldDescr>) {
        debug_assert_eq!(descr.kind, Kind::Int);
        self.op(JcOp::GetfieldVable);
        self.byte(obj.0);
        self.descr_ref(DescrRef::Field(descr));
        self.byte(dst.0);
    }

    pub fn setfield_vable_i(&mut self, obj: RegR, descr: Rc<FieldDescr>, value: RegI) {
        debug_assert_eq!(descr.kind, Kind::Int);
        self.op(JcOp::SetfieldVable);
        self.byte(obj.0);
        self.descr_ref(DescrRef::Field(descr));
        self.byte(value.0);
    }

    pub fn getarrayitem_gc_i(&mut self, dst: RegI, arr: RegR, descr: Rc<ArrayDescr>, index: RegI) {
        debug_assert_eq!(descr.kind, Kind::Int);
        self.op(JcOp::GetarrayitemGc);
        self.byte(arr.0);
        self.descr_ref(DescrRef::Array(descr));
        self.byte(index.0);
        self.byte(dst.0);
    }

    pub fn getarrayitem_gc_pure_i(
        &mut self,
        dst: RegI,
        arr: RegR,
        descr: Rc<ArrayDescr>,
        index: RegI,
    ) {
        debug_assert_eq!(descr.kind, Kind::Int);
        self.op(JcOp::GetarrayitemGcPure);
        self.byte(arr.0);
        self.descr_ref(DescrRef::Array(descr));
        self.byte(index.0);
        self.byte(dst.0);
    }

    pub fn setarrayitem_gc_i(&mut self, arr: RegR, descr: Rc<ArrayDescr>, index: RegI, value: RegI) {
        debug_assert_eq!(descr.kind, Kind::Int);
        self.op(JcOp::SetarrayitemGc);
        self.byte(arr.0);
        self.descr_ref(DescrRef::Array(descr));
        self.byte(index.0);
        self.byte(value.0);
    }

    pub fn arraylen_gc(&mut self, dst: RegI, arr: RegR) {
        self.op(JcOp::ArraylenGc);
        self.byte(arr.0);
        self.byte(dst.0);
    }

    // --- calls ---

    /// Destination register byte for a call, by result kind
    fn call_result(&mut self, result_kind: Option<Kind>, dst: Option<u8>) {
        match (result_kind, dst) {
            (Some(_), Some(reg)) => self.byte(reg),
            (None, None) => {}
            _ => panic!("call destination does not match callee result kind"),
        }
    }

    pub fn inline_call(
        &mut self,
        dst: Option<u8>,
        callee: usize,
        args_i: &[RegI],
        args_r: &[RegR],
        args_f: &[RegF],
        callee_result: Option<Kind>,
    ) {
        self.op(JcOp::InlineCall);
        self.u16(callee as u16);
        self.reg_list_i(args_i);
        self.reg_list_r(args_r);
        self.reg_list_f(args_f);
        self.call_result(callee_result, dst);
    }

    fn residual_like(
        &mut self,
        op: JcOp,
        dst: Option<u8>,
        descr: Rc<CallDescr>,
        func: u16,
        args_i: &[RegI],
        args_r: &[RegR],
        args_f: &[RegF],
    ) {
        let result = descr.result;
        self.op(op);
        self.descr_ref(DescrRef::Call(descr));
        self.u16(func);
        self.reg_list_i(args_i);
        self.reg_list_r(args_r);
        self.reg_list_f(args_f);
        self.call_result(result, dst);
    }

    pub fn residual_call(
        &mut self,
        dst: Option<u8>,
        descr: Rc<CallDescr>,
        func: u16,
        args_i: &[RegI],
        args_r: &[RegR],
        args_f: &[RegF],
    ) {
        self.residual_like(JcOp::ResidualCall, dst, descr, func, args_i, args_r, args_f);
    }

    pub fn residual_call_pure(
        &mut self,
        dst: Option<u8>,
        descr: Rc<CallDescr>,
        func: u16,
        args_i: &[RegI],
        args_r: &[RegR],
        args_f: &[RegF],
    ) {
        debug_assert_eq!(descr.effect, CallEffect::Pure);
        self.residual_like(JcOp::ResidualCallPure, dst, descr, func, args_i, args_r, args_f);
    }

    pub fn residual_call_may_force(
        &mut self,
        dst: Option<u8>,
        descr: Rc<CallDescr>,
        func: u16,
        args_i: &[RegI],
        args_r: &[RegR],
        args_f: &[RegF],
    ) {
        debug_assert_eq!(descr.effect, CallEffect::MayForce);
        self.residual_like(
            JcOp::ResidualCallMayForce,
            dst,
            descr,
            func,
            args_i,
            args_r,
            args_f,
        );
    }

    pub fn residual_call_loopinvariant(
        &mut self,
        dst: Option<u8>,
        descr: Rc<CallDescr>,
        func: u16,
        args_i: &[RegI],
        args_r: &[RegR],
        args_f: &[RegF],
    ) {
        debug_assert_eq!(descr.effect, CallEffect::LoopInvariant);
        self.residual_like(
            JcOp::ResidualCallLoopinvariant,
            dst,
            descr,
            func,
            args_i,
            args_r,
            args_f,
        );
    }

    // --- exceptions ---

    pub fn catch_exception(&mut self, handler: JcLabel) {
        self.op(JcOp::CatchException);
        self.label_ref(handler);
    }

    pub fn last_exc_value(&mut self, dst: RegR) {
        self.op(JcOp::LastExcValue);
        self.byte(dst.0);
    }

    pub fn goto_if_exception_mismatch(&mut self, class: ClassId, target: JcLabel) {
        self.op(JcOp::GotoIfExceptionMismatch);
        self.u16(class.0 as u16);
        self.label_ref(target);
    }

    pub fn raise(&mut self, value: RegR) {
        self.op(JcOp::Raise);
        self.byte(value.0);
    }

    pub fn reraise(&mut self) {
        self.op(JcOp::Reraise);
    }

    // --- driver hints ---

    pub fn jit_merge_point(
        &mut self,
        greens: &[RegI],
        reds_i: &[RegI],
        reds_r: &[RegR],
        reds_f: &[RegF],
    ) {
        self.op(JcOp::JitMergePoint);
        self.reg_list_i(greens);
        self.reg_list_i(reds_i);
        self.reg_list_r(reds_r);
        self.reg_list_f(reds_f);
    }

    pub fn can_enter_jit(
        &mut self,
        greens: &[RegI],
        reds_i: &[RegI],
        reds_r: &[RegR],
        reds_f: &[RegF],
    ) {
        self.op(JcOp::CanEnterJit);
        self.reg_list_i(greens);
        self.reg_list_i(reds_i);
        self.reg_list_r(reds_r);
        self.reg_list_f(reds_f);
    }

    pub fn promote(&mut self, dst: RegI, src: RegI) {
        self.op(JcOp::Promote);
        self.byte(src.0);
        self.byte(dst.0);
    }

    pub fn guard_class(&mut self, dst: RegI, obj: RegR) {
        self.op(JcOp::GuardClass);
        self.byte(obj.0);
        self.byte(dst.0);
    }

    pub fn keepalive(&mut self, obj: RegR) {
        self.op(JcOp::Keepalive);
        self.byte(obj.0);
    }

    pub fn unsupported(&mut self) {
        self.op(JcOp::Unsupported);
    }

    // --- finish ---

    pub fn finish(mut self) -> JitCode {
        // resolve label references
        for (site, label) in std::mem::take(&mut self.label_fixups) {
            let target = self.labels[label.0].expect("finish with unbound label");
            assert!(target <= u16::MAX as usize);
            self.code[site] = (target & 0xff) as u8;
            self.code[site + 1] = (target >> 8) as u8;
        }
        // build switch descrs now that labels are known
        for (slot, cases) in std::mem::take(&mut self.pending_switches) {
            let mut table = FxHashMap::default();
            for (value, label) in cases {
                let target = self.labels[label.0].expect("finish with unbound switch label");
                table.insert(value, target);
            }
            self.descrs[slot as usize] =
                Some(DescrRef::SwitchDict(Rc::new(SwitchDictDescr { cases: table })));
        }
        JitCode {
            name: self.name,
            code: self.code,
            constants_i: self.constants_i,
            constants_r: self.constants_r,
            constants_f: self.constants_f,
            num_regs_i: self.num_regs_i,
            num_regs_r: self.num_regs_r,
            num_regs_f: self.num_regs_f,
            descrs: self
                .descrs
                .into_iter()
                .map(|d| d.expect("unresolved descr slot"))
                .collect(),
            result_kind: self.result_kind,
            index: usize::MAX,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_label_backpatching() {
        let mut b = JitCodeBuilder::new("t", None);
        let cond = b.new_reg_i();
        let done = b.new_label();
        b.goto_if_not(done, cond);
        b.void_return();
        b.bind(done);
        b.void_return();
        let code = b.finish();

        let mut d = Decoder {
            code: &code.code,
            pc: 0,
        };
        assert_eq!(d.next_op(), JcOp::GotoIfNot);
        let target = d.next_u16() as usize;
        assert_eq!(d.next_byte(), cond.0);
        assert_eq!(d.next_op(), JcOp::VoidReturn);
        assert_eq!(target, d.pc);
        assert_eq!(code.code[target], JcOp::VoidReturn as u8);
    }

    #[test]
    fn test_large_int_constant_goes_to_pool() {
        let mut b = JitCodeBuilder::new("t", None);
        let r = b.new_reg_i();
        b.int_const(r, 5);
        b.int_const(r, 1_000_000);
        b.int_const(r, 1_000_000); // pooled once
        let code = b.finish();
        assert_eq!(code.constants_i, vec![1_000_000]);

        let mut d = Decoder {
            code: &code.code,
            pc: 0,
        };
        assert_eq!(d.next_op(), JcOp::IntConst);
        assert_eq!(d.next_signed(), 5);
        assert_eq!(d.next_byte(), r.0);
        assert_eq!(d.next_op(), JcOp::IntFromPool);
        assert_eq!(d.next_u16(), 0);
    }

    #[test]
    fn test_descr_interning_per_jitcode() {
        let mut pb = ProgramBuilder::new();
        let cls = pb.add_class("Point", vec![Kind::Int, Kind::Int]);
        let fx = pb.field_descr(cls, 0);
        let fx2 = pb.field_descr(cls, 0);
        assert!(Rc::ptr_eq(&fx, &fx2));

        let mut b = JitCodeBuilder::new("t", None);
        let obj = b.new_reg_r();
        let v = b.new_reg_i();
        b.getfield_gc_i(v, obj, fx.clone());
        b.getfield_gc_i(v, obj, fx2);
        let code = b.finish();
        // same descr referenced twice, stored once
        assert_eq!(code.descrs.len(), 1);
    }

    #[test]
    fn test_switch_descr_resolved_at_finish() {
        let mut b = JitCodeBuilder::new("t", None);
        let sel = b.new_reg_i();
        let one = b.new_label();
        let two = b.new_label();
        b.switch(sel, &[(1, one), (2, two)]);
        b.void_return();
        b.bind(one);
        b.void_return();
        b.bind(two);
        b.void_return();
        let code = b.finish();

        match &code.descrs[0] {
            DescrRef::SwitchDict(d) => {
                assert_eq!(d.cases.len(), 2);
                assert!(d.cases.values().all(|&pc| pc < code.code.len()));
            }
            other => panic!("expected switch descr, got {other:?}"),
        }
    }

    #[test]
    fn test_register_counts() {
        let mut b = JitCodeBuilder::new("t", Some(Kind::Int));
        let _ = b.new_reg_i();
        let i1 = b.new_reg_i();
        let _ = b.new_reg_r();
        b.int_return(i1);
        let code = b.finish();
        assert_eq!(code.num_regs(Kind::Int), 2);
        assert_eq!(code.num_regs(Kind::Ref), 1);
        assert_eq!(code.num_regs(Kind::Float), 0);
        assert_eq!(code.result_kind, Some(Kind::Int));
    }
}
