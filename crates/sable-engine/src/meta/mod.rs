//! The meta-interpreter: symbolic execution of guest jitcode
//!
//! While tracing, every guest operation is executed concretely *and*
//! recorded into the history as an operation over boxes. Guards are
//! generated wherever the recorded path depends on runtime data, each
//! carrying resume data for the frame stack at that point.
//!
//! The interpreter loop is an explicit state machine: each opcode
//! handler returns a `StepResult` and the loop reacts, continuing,
//! switching frames, or leaving with a `RunResult` that tells the driver
//! why tracing stopped (merge point reached, portal frame done, guest
//! exception escaped, or trace aborted toward blackhole).

pub mod frame;

use std::rc::Rc;

use rustc_hash::FxHashMap;
use tracing::debug;

use crate::error::ExecError;
use crate::heap::{ClassId, Kind, RawValue};
use crate::ir::boxes::{ConstVal, Operand, TraceBox};
use crate::ir::descr::{DescrRef, FieldDescr, SizeDescr};
use crate::ir::execute::{execute_op, ExecContext, ForceToken};
use crate::ir::history::History;
use crate::ir::ops::OpNum;
use crate::jitcode::{Decoder, JcOp, JitCode, Program};
use crate::resume::{capture_resumedata, ResumeGuardDescr, ResumeGuardForcedDescr};
use frame::{FramePool, MIFrame};

/// Why a trace was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    TraceTooLong,
    UnsupportedOp,
    NestedCanEnterJit,
    ForcedWhileTracing,
}

/// Why the interpreter loop returned to the driver.
pub enum RunResult {
    /// A `jit_merge_point` was crossed after a `can_enter_jit`; the
    /// driver decides whether to close the trace here
    MergeReached { greens: Vec<ConstVal> },
    /// The portal frame returned while tracing
    Done(Option<Operand>),
    /// A guest exception escaped the portal frame
    Raised(Operand),
    /// Trace abandoned; the frame stack continues in the interpreter
    Aborted(AbortReason),
}

/// What one interpreted step did to the control state.
enum StepResult {
    Continue,
    /// A guest-level call or return switched the active frame
    ChangeFrame,
    Leave(RunResult),
}

/// Shadowed state of the driver's virtualizable object: field values kept
/// as trace operands instead of heap reads.
pub struct VirtualizableState {
    pub obj: Operand,
    pub shadows: Vec<(Operand, Rc<FieldDescr>)>,
}

pub struct MetaInterp {
    program: Rc<Program>,
    pub framestack: Vec<MIFrame>,
    pub history: History,
    pool: FramePool,
    trace_limit: usize,
    inlining: bool,
    /// Fields of the virtualizable red argument, when the driver has one
    vable_fields: Option<Vec<Rc<FieldDescr>>>,

    last_exc: Option<Operand>,
    pub virtualizable: Option<VirtualizableState>,
    pub virtualref_boxes: Vec<Operand>,

    seen_can_enter_jit: bool,
    start_set: bool,
    is_bridge: bool,
    pub start_greens: Vec<ConstVal>,
    pending_merge_reds: Vec<Operand>,

    ops_per_jitcode: FxHashMap<usize, u32>,
    size_descr_cache: FxHashMap<u32, Rc<SizeDescr>>,
}

impl MetaInterp {
    /// Begin tracing a prospective loop from a converted guest frame.
    pub fn start_loop(
        program: Rc<Program>,
        frame: MIFrame,
        trace_limit: usize,
        inlining: bool,
        vable_fields: Option<Vec<Rc<FieldDescr>>>,
    ) -> MetaInterp {
        MetaInterp {
            program,
            framestack: vec![frame],
            history: History::new(vec![]),
            pool: FramePool::new(),
            trace_limit,
            inlining,
            vable_fields,
            last_exc: None,
            virtualizable: None,
            virtualref_boxes: vec![],
            seen_can_enter_jit: false,
            start_set: false,
            is_bridge: false,
            start_greens: vec![],
            pending_merge_reds: vec![],
            ops_per_jitcode: FxHashMap::default(),
            size_descr_cache: FxHashMap::default(),
        }
    }

    /// Begin tracing a bridge from frames rebuilt out of resume data.
    /// `inputargs` are the fresh boxes the rebuild created, one per used
    /// failargs slot.
    #[allow(clippy::too_many_arguments)]
    pub fn start_bridge(
        program: Rc<Program>,
        frames: Vec<MIFrame>,
        inputargs: Vec<TraceBox>,
        virtualizable_boxes: Vec<Operand>,
        virtualref_boxes: Vec<Operand>,
        pending_exception: Option<Operand>,
        trace_limit: usize,
        inlining: bool,
        vable_fields: Option<Vec<Rc<FieldDescr>>>,
    ) -> MetaInterp {
        let virtualizable = vable_fields.as_ref().and_then(|fields| {
            if virtualizable_boxes.is_empty() {
                return None;
            }
            // the object reference travels as the last entry
            let (obj, shadows) = virtualizable_boxes.split_last().unwrap();
            Some(VirtualizableState {
                obj: obj.clone(),
                shadows: shadows
                    .iter()
                    .cloned()
                    .zip(fields.iter().cloned())
                    .collect(),
            })
        });
        MetaInterp {
            program,
            framestack: frames,
            history: History::new(inputargs),
            pool: FramePool::new(),
            trace_limit,
            inlining,
            vable_fields,
            last_exc: pending_exception,
            virtualizable,
            virtualref_boxes,
            seen_can_enter_jit: false,
            start_set: true,
            is_bridge: true,
            start_greens: vec![],
            pending_merge_reds: vec![],
            ops_per_jitcode: FxHashMap::default(),
            size_descr_cache: FxHashMap::default(),
        }
    }

    // ===== accessors for the driver =====

    pub fn take_frames(&mut self) -> Vec<MIFrame> {
        std::mem::take(&mut self.framestack)
    }

    pub fn pending_merge_reds(&self) -> &[Operand] {
        &self.pending_merge_reds
    }

    pub fn pending_exception(&self) -> Option<&Operand> {
        self.last_exc.as_ref()
    }

    /// The guest function that contributed the most operations to the
    /// trace; used to steer future attempts away from huge functions.
    pub fn find_biggest_function(&self) -> Option<usize> {
        self.ops_per_jitcode
            .iter()
            .max_by_key(|&(index, count)| (*count, std::cmp::Reverse(*index)))
            .map(|(&index, _)| index)
    }

    /// Store shadowed virtualizable fields back into the heap object, so
    /// the interpreter sees current state after a blackhole.
    pub fn sync_virtualizable_to_heap(&self) {
        if let Some(vable) = &self.virtualizable {
            let obj = vable.obj.ref_value();
            for (shadow, field) in &vable.shadows {
                obj.set_field(field.offset, shadow.value());
            }
        }
    }

    /// Close the trace at the merge point: de-duplicate the live
    /// arguments (constants and repeated boxes become `same_as` copies),
    /// record the `jump`, and return the jump argument boxes.
    pub fn close_into_jump(&mut self) -> Vec<TraceBox> {
        let mut live: Vec<Operand> = self.pending_merge_reds.clone();
        if let Some(vable) = &self.virtualizable {
            // the object itself travels as a red argument already; only
            // the shadowed fields are extra loop variables
            live.extend(vable.shadows.iter().map(|(s, _)| s.clone()));
        }

        let mut seen: FxHashMap<TraceBox, ()> = FxHashMap::default();
        let mut jump_args = Vec::with_capacity(live.len());
        for arg in live {
            let needs_copy = match &arg {
                Operand::Const(_) => true,
                Operand::Box(b) => seen.contains_key(b),
            };
            if needs_copy {
                let copy = TraceBox::new(arg.value());
                self.record_op(OpNum::SameAs, vec![arg], Some(copy.clone()), None);
                jump_args.push(copy);
            } else {
                let b = arg.as_box().unwrap().clone();
                seen.insert(b.clone(), ());
                jump_args.push(b);
            }
        }

        let args: Vec<Operand> = jump_args.iter().cloned().map(Operand::Box).collect();
        self.record_op(OpNum::Jump, args, None, None);
        jump_args
    }

    // ===== main loop =====

    pub fn run(&mut self) -> RunResult {
        loop {
            if self.history.len() > self.trace_limit {
                debug!(ops = self.history.len(), "aborting tracing: trace too long");
                return RunResult::Aborted(AbortReason::TraceTooLong);
            }
            match self.step() {
                StepResult::Continue | StepResult::ChangeFrame => {}
                StepResult::Leave(result) => return result,
            }
        }
    }

    fn top(&self) -> &MIFrame {
        self.framestack.last().expect("empty frame stack")
    }

    fn top_mut(&mut self) -> &mut MIFrame {
        self.framestack.last_mut().expect("empty frame stack")
    }

    // ===== recording =====

    fn record_op(
        &mut self,
        opnum: OpNum,
        args: Vec<Operand>,
        result: Option<TraceBox>,
        descr: Option<DescrRef>,
    ) {
        let jitcode_index = self.top().jitcode.index;
        *self.ops_per_jitcode.entry(jitcode_index).or_insert(0) += 1;
        self.history.record(opnum, args, result, descr);
    }

    /// Evaluate concretely and append to the trace. Pure operations with
    /// all-constant arguments fold to a constant and record nothing.
    fn execute_and_record(
        &mut self,
        opnum: OpNum,
        args: Vec<Operand>,
        descr: Option<DescrRef>,
    ) -> Result<Option<Operand>, ExecError> {
        let values: Vec<RawValue> = args.iter().map(Operand::value).collect();
        let ctx = ExecContext::new(&self.program);
        let value = execute_op(&ctx, opnum, &values, descr.as_ref())?;

        if opnum.is_always_pure() && args.iter().all(Operand::is_const) {
            return Ok(value.map(|v| Operand::Const(ConstVal::from_value(v))));
        }
        let result = value.map(TraceBox::new);
        self.record_op(opnum, args, result.clone(), descr);
        Ok(result.map(Operand::Box))
    }

    // ===== guards =====

    /// Record a guard unless the guarded operand is already a constant.
    /// `resume_pc` is where interpretation restarts on failure; for
    /// re-executable operations it is the operation's own pc.
    fn generate_guard(
        &mut self,
        resume_pc: usize,
        opnum: OpNum,
        arg: Option<Operand>,
        extra: Vec<Operand>,
    ) -> Option<Rc<ResumeGuardDescr>> {
        if matches!(arg, Some(Operand::Const(_))) {
            return None;
        }
        let mut args = vec![];
        if let Some(a) = arg {
            args.push(a);
        }
        args.extend(extra);

        let descr = Rc::new(ResumeGuardDescr::new(opnum));
        self.capture_for(&descr, resume_pc);
        self.record_op(opnum, args, None, Some(DescrRef::ResumeGuard(descr.clone())));
        Some(descr)
    }

    fn capture_for(&mut self, descr: &ResumeGuardDescr, resume_pc: usize) {
        let continue_pc = self.top().pc;
        self.top_mut().pc = resume_pc;
        let vable: Option<Vec<Operand>> = self.virtualizable.as_ref().map(|v| {
            let mut boxes: Vec<Operand> = v.shadows.iter().map(|(s, _)| s.clone()).collect();
            boxes.push(v.obj.clone());
            boxes
        });
        capture_resumedata(
            &self.framestack,
            vable.as_deref(),
            &self.virtualref_boxes,
            descr,
        );
        self.top_mut().pc = continue_pc;
    }

    /// Promote a runtime operand into a constant: `guard_value` plus
    /// substitution of the box throughout the live state.
    fn implement_guard_value(&mut self, resume_pc: usize, arg: Operand) -> Operand {
        match arg {
            Operand::Const(_) => arg,
            Operand::Box(ref b) => {
                let promoted = Operand::Const(b.constbox());
                self.generate_guard(
                    resume_pc,
                    OpNum::GuardValue,
                    Some(arg.clone()),
                    vec![promoted.clone()],
                );
                self.replace_box(&b.clone(), &promoted);
                promoted
            }
        }
    }

    /// Substitute every live occurrence of `old`: frames, virtualizable
    /// shadows, virtual-ref handles.
    fn replace_box(&mut self, old: &TraceBox, new: &Operand) {
        for frame in &mut self.framestack {
            frame.replace_box(old, new);
        }
        if let Some(vable) = &mut self.virtualizable {
            if matches!(&vable.obj, Operand::Box(b) if b == old) {
                vable.obj = new.clone();
            }
            for (shadow, _) in &mut vable.shadows {
                if matches!(shadow, Operand::Box(b) if b == old) {
                    *shadow = new.clone();
                }
            }
        }
        for vref in &mut self.virtualref_boxes {
            if matches!(vref, Operand::Box(b) if b == old) {
                *vref = new.clone();
            }
        }
    }

    // ===== exceptions =====

    fn exc_size_descr(&mut self, class: ClassId) -> Rc<SizeDescr> {
        let program = self.program.clone();
        self.size_descr_cache
            .entry(class.0)
            .or_insert_with(|| {
                Rc::new(SizeDescr {
                    field_kinds: program.class(class).field_kinds.clone(),
                    vtable: Some(class),
                })
            })
            .clone()
    }

    /// Allocate and raise a well-known exception class (overflow,
    /// zero division); the allocation is recorded so the exception
    /// object is grounded in the trace.
    fn raise_guest_class(&mut self, class: ClassId) -> StepResult {
        let descr = self.exc_size_descr(class);
        let exc = self
            .execute_and_record(OpNum::NewWithVtable, vec![], Some(DescrRef::Size(descr)))
            .expect("allocation cannot fail")
            .expect("allocation produces a value");
        self.last_exc = Some(exc);
        self.dispatch_exception()
    }

    /// Unwind toward the nearest `catch_exception`: a frame whose next
    /// opcode is `catch_exception` handles the exception; otherwise the
    /// frame is popped. An empty stack means the exception escapes the
    /// portal.
    fn dispatch_exception(&mut self) -> StepResult {
        debug_assert!(self.last_exc.is_some());
        loop {
            let frame = self.top();
            let jitcode = frame.jitcode.clone();
            if frame.pc < jitcode.code.len()
                && jitcode.code[frame.pc] == JcOp::CatchException as u8
            {
                let mut decoder = Decoder::new(&jitcode, frame.pc + 1);
                let target = decoder.next_u16() as usize;
                self.top_mut().pc = target;
                return StepResult::Continue;
            }
            let frame = self.framestack.pop().expect("empty frame stack");
            self.pool.release(frame);
            if self.framestack.is_empty() {
                let exc = self.last_exc.take().unwrap();
                return StepResult::Leave(RunResult::Raised(exc));
            }
        }
    }

    /// After a raising operation: record the matching exception guard and
    /// dispatch if an exception is pending. Resume pc is after the call.
    fn handle_possible_exception(
        &mut self,
        raised: Option<crate::error::GuestException>,
    ) -> Option<StepResult> {
        let resume_pc = self.top().pc;
        match raised {
            None => {
                self.generate_guard(resume_pc, OpNum::GuardNoException, None, vec![]);
                None
            }
            Some(exc) => {
                let class = exc.value.class().expect("exception object without class");
                let descr = Rc::new(ResumeGuardDescr::new(OpNum::GuardException));
                self.capture_for(&descr, resume_pc);
                let exc_box = TraceBox::new_ref(exc.value);
                self.record_op(
                    OpNum::GuardException,
                    vec![Operand::Const(ConstVal::Int(class.0 as i64))],
                    Some(exc_box.clone()),
                    Some(DescrRef::ResumeGuard(descr)),
                );
                self.last_exc = Some(Operand::Box(exc_box));
                Some(self.dispatch_exception())
            }
        }
    }

    // ===== frame switching =====

    fn finish_frame(&mut self, result: Option<Operand>) -> StepResult {
        let frame = self.framestack.pop().expect("empty frame stack");
        let result_kind = frame.jitcode.result_kind;
        self.pool.release(frame);
        if self.framestack.is_empty() {
            return StepResult::Leave(RunResult::Done(result));
        }
        let caller = self.top_mut();
        match (result, caller.pending_result_reg.take()) {
            (Some(value), Some(reg)) => {
                let kind = result_kind.expect("value returned from void jitcode");
                caller.set_reg(kind, reg, value);
            }
            (None, None) => {}
            _ => panic!("call result does not match callee result kind"),
        }
        StepResult::ChangeFrame
    }

    // ===== virtualizable synchronization =====

    fn vable_sync_before_call(&mut self) {
        let Some(vable) = &self.virtualizable else {
            return;
        };
        let obj = vable.obj.clone();
        let shadows = vable.shadows.clone();
        for (shadow, field) in shadows {
            self.execute_and_record(
                OpNum::SetfieldGc,
                vec![obj.clone(), shadow],
                Some(DescrRef::Field(field)),
            )
            .expect("setfield cannot fail");
        }
    }

    fn vable_reload_after_call(&mut self) {
        let Some(vable) = &self.virtualizable else {
            return;
        };
        let obj = vable.obj.clone();
        let fields: Vec<Rc<FieldDescr>> =
            vable.shadows.iter().map(|(_, f)| f.clone()).collect();
        let mut new_shadows = Vec::with_capacity(fields.len());
        for field in fields {
            let fresh = self
                .execute_and_record(
                    OpNum::GetfieldGc,
                    vec![obj.clone()],
                    Some(DescrRef::Field(field.clone())),
                )
                .expect("getfield cannot fail")
                .expect("getfield produces a value");
            new_shadows.push((fresh, field));
        }
        self.virtualizable.as_mut().unwrap().shadows = new_shadows;
    }

    // ===== the dispatch loop =====

    fn step(&mut self) -> StepResult {
        let jitcode = self.top().jitcode.clone();
        let orgpc = self.top().pc;
        let mut decoder = Decoder::new(&jitcode, orgpc);
        let op = decoder.next_op();
        self.dispatch(op, &jitcode, &mut decoder, orgpc)
    }

    fn reg(&self, kind: Kind, index: u8) -> Operand {
        self.top().get_reg(kind, index)
    }

    fn set_reg(&mut self, kind: Kind, index: u8, value: Operand) {
        self.top_mut().set_reg(kind, index, value);
    }

    /// Decode, execute, and record a two-operand integer operation
    fn int_binary(&mut self, opnum: OpNum, decoder: &mut Decoder<'_>) -> StepResult {
        let a = self.reg(Kind::Int, decoder.next_byte());
        let b = self.reg(Kind::Int, decoder.next_byte());
        let dst = decoder.next_byte();
        self.top_mut().pc = decoder.pc;
        let result = self
            .execute_and_record(opnum, vec![a, b], None)
            .expect("pure int op cannot fail")
            .expect("int op produces a value");
        self.set_reg(Kind::Int, dst, result);
        StepResult::Continue
    }

    fn int_unary(&mut self, opnum: OpNum, decoder: &mut Decoder<'_>) -> StepResult {
        let a = self.reg(Kind::Int, decoder.next_byte());
        let dst = decoder.next_byte();
        self.top_mut().pc = decoder.pc;
        let result = self
            .execute_and_record(opnum, vec![a], None)
            .expect("pure int op cannot fail")
            .expect("int op produces a value");
        self.set_reg(Kind::Int, dst, result);
        StepResult::Continue
    }

    /// Division-family op: the guest emitter precedes these with
    /// zero-division (and overflow) checks, so a failure here raises the
    /// guest error directly.
    fn int_div_like(&mut self, opnum: OpNum, decoder: &mut Decoder<'_>) -> StepResult {
        let a = self.reg(Kind::Int, decoder.next_byte());
        let b = self.reg(Kind::Int, decoder.next_byte());
        let dst = decoder.next_byte();
        self.top_mut().pc = decoder.pc;
        match self.execute_and_record(opnum, vec![a, b], None) {
            Ok(result) => {
                self.set_reg(Kind::Int, dst, result.expect("div produces a value"));
                StepResult::Continue
            }
            Err(ExecError::DivByZero) => {
                let class = self.program.exc_zero_division;
                self.raise_guest_class(class)
            }
            Err(_) => unreachable!("division reports only zero-division"),
        }
    }

    /// Overflow-checked arithmetic: evaluate, then guard on the overflow
    /// outcome at the operation's own pc.
    fn int_ovf(&mut self, opnum: OpNum, decoder: &mut Decoder<'_>, orgpc: usize) -> StepResult {
        let a = self.reg(Kind::Int, decoder.next_byte());
        let b = self.reg(Kind::Int, decoder.next_byte());
        let dst = decoder.next_byte();
        self.top_mut().pc = decoder.pc;
        match self.execute_and_record(opnum, vec![a.clone(), b.clone()], None) {
            Ok(result) => {
                self.generate_guard(orgpc, OpNum::GuardNoOverflow, None, vec![]);
                self.set_reg(Kind::Int, dst, result.expect("ovf op produces a value"));
                StepResult::Continue
            }
            Err(ExecError::Overflow) => {
                // record the wrapped result so the operation stays in the
                // trace, then the overflow guard and the guest raise
                let wrapped_opnum = match opnum {
                    OpNum::IntAddOvf => OpNum::IntAdd,
                    OpNum::IntSubOvf => OpNum::IntSub,
                    _ => OpNum::IntMul,
                };
                let ctx = ExecContext::new(&self.program);
                let wrapped = execute_op(
                    &ctx,
                    wrapped_opnum,
                    &[a.value(), b.value()],
                    None,
                )
                .unwrap()
                .unwrap();
                self.record_op(opnum, vec![a, b], Some(TraceBox::new(wrapped)), None);
                self.generate_guard(orgpc, OpNum::GuardOverflow, None, vec![]);
                let class = self.program.exc_overflow;
                self.raise_guest_class(class)
            }
            Err(_) => unreachable!("overflow arithmetic reports only overflow"),
        }
    }

    fn float_binary(&mut self, opnum: OpNum, decoder: &mut Decoder<'_>, result_kind: Kind) -> StepResult {
        let a = self.reg(Kind::Float, decoder.next_byte());
        let b = self.reg(Kind::Float, decoder.next_byte());
        let dst = decoder.next_byte();
        self.top_mut().pc = decoder.pc;
        let result = self
            .execute_and_record(opnum, vec![a, b], None)
            .expect("pure float op cannot fail")
            .expect("float op produces a value");
        self.set_reg(result_kind, dst, result);
        StepResult::Continue
    }

    fn dispatch(
        &mut self,
        op: JcOp,
        jitcode: &Rc<JitCode>,
        decoder: &mut Decoder<'_>,
        orgpc: usize,
    ) -> StepResult {
        match op {
            // ----- constants and moves -----
            JcOp::IntConst => {
                let value = decoder.next_signed() as i64;
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                self.set_reg(Kind::Int, dst, Operand::Const(ConstVal::Int(value)));
                StepResult::Continue
            }
            JcOp::IntFromPool => {
                let value = jitcode.constants_i[decoder.next_u16() as usize];
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                self.set_reg(Kind::Int, dst, Operand::Const(ConstVal::Int(value)));
                StepResult::Continue
            }
            JcOp::RefFromPool => {
                let value = jitcode.constants_r[decoder.next_u16() as usize].clone();
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                self.set_reg(Kind::Ref, dst, Operand::Const(ConstVal::Ref(value)));
                StepResult::Continue
            }
            JcOp::FloatFromPool => {
                let value = jitcode.constants_f[decoder.next_u16() as usize];
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                self.set_reg(
                    Kind::Float,
                    dst,
                    Operand::Const(ConstVal::from_value(RawValue::Float(value))),
                );
                StepResult::Continue
            }
            JcOp::RefNull => {
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                self.set_reg(
                    Kind::Ref,
                    dst,
                    Operand::Const(ConstVal::Ref(crate::heap::GcRef::null())),
                );
                StepResult::Continue
            }
            JcOp::IntCopy | JcOp::RefCopy | JcOp::FloatCopy => {
                let kind = match op {
                    JcOp::IntCopy => Kind::Int,
                    JcOp::RefCopy => Kind::Ref,
                    _ => Kind::Float,
                };
                let src = self.reg(kind, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                self.set_reg(kind, dst, src);
                StepResult::Continue
            }

            // ----- integer operations -----
            JcOp::IntAdd => self.int_binary(OpNum::IntAdd, decoder),
            JcOp::IntSub => self.int_binary(OpNum::IntSub, decoder),
            JcOp::IntMul => self.int_binary(OpNum::IntMul, decoder),
            JcOp::IntFloordiv => self.int_div_like(OpNum::IntFloordiv, decoder),
            JcOp::IntMod => self.int_div_like(OpNum::IntMod, decoder),
            JcOp::IntAnd => self.int_binary(OpNum::IntAnd, decoder),
            JcOp::IntOr => self.int_binary(OpNum::IntOr, decoder),
            JcOp::IntXor => self.int_binary(OpNum::IntXor, decoder),
            JcOp::IntLshift => self.int_binary(OpNum::IntLshift, decoder),
            JcOp::IntRshift => self.int_binary(OpNum::IntRshift, decoder),
            JcOp::UintRshift => self.int_binary(OpNum::UintRshift, decoder),
            JcOp::IntLt => self.int_binary(OpNum::IntLt, decoder),
            JcOp::IntLe => self.int_binary(OpNum::IntLe, decoder),
            JcOp::IntEq => self.int_binary(OpNum::IntEq, decoder),
            JcOp::IntNe => self.int_binary(OpNum::IntNe, decoder),
            JcOp::IntGt => self.int_binary(OpNum::IntGt, decoder),
            JcOp::IntGe => self.int_binary(OpNum::IntGe, decoder),
            JcOp::UintLt => self.int_binary(OpNum::UintLt, decoder),
            JcOp::UintLe => self.int_binary(OpNum::UintLe, decoder),
            JcOp::UintGt => self.int_binary(OpNum::UintGt, decoder),
            JcOp::UintGe => self.int_binary(OpNum::UintGe, decoder),
            JcOp::IntIsTrue => self.int_unary(OpNum::IntIsTrue, decoder),
            JcOp::IntNeg => self.int_unary(OpNum::IntNeg, decoder),
            JcOp::IntAbs => self.int_unary(OpNum::IntAbs, decoder),
            JcOp::IntAddOvf => self.int_ovf(OpNum::IntAddOvf, decoder, orgpc),
            JcOp::IntSubOvf => self.int_ovf(OpNum::IntSubOvf, decoder, orgpc),
            JcOp::IntMulOvf => self.int_ovf(OpNum::IntMulOvf, decoder, orgpc),

            JcOp::CheckZeroDivision => {
                let divisor = self.reg(Kind::Int, decoder.next_byte());
                self.top_mut().pc = decoder.pc;
                let cond = self
                    .execute_and_record(OpNum::IntIsTrue, vec![divisor], None)
                    .unwrap()
                    .unwrap();
                if cond.int_value() != 0 {
                    self.generate_guard(orgpc, OpNum::GuardTrue, Some(cond), vec![]);
                    StepResult::Continue
                } else {
                    self.generate_guard(orgpc, OpNum::GuardFalse, Some(cond), vec![]);
                    let class = self.program.exc_zero_division;
                    self.raise_guest_class(class)
                }
            }
            JcOp::CheckDivOverflow => {
                let a = self.reg(Kind::Int, decoder.next_byte());
                let b = self.reg(Kind::Int, decoder.next_byte());
                self.top_mut().pc = decoder.pc;
                let min = Operand::Const(ConstVal::Int(i64::MIN));
                let minus1 = Operand::Const(ConstVal::Int(-1));
                let eq_min = self
                    .execute_and_record(OpNum::IntEq, vec![a, min], None)
                    .unwrap()
                    .unwrap();
                let eq_m1 = self
                    .execute_and_record(OpNum::IntEq, vec![b, minus1], None)
                    .unwrap()
                    .unwrap();
                let danger = self
                    .execute_and_record(OpNum::IntAnd, vec![eq_min, eq_m1], None)
                    .unwrap()
                    .unwrap();
                if danger.int_value() == 0 {
                    self.generate_guard(orgpc, OpNum::GuardFalse, Some(danger), vec![]);
                    StepResult::Continue
                } else {
                    self.generate_guard(orgpc, OpNum::GuardTrue, Some(danger), vec![]);
                    let class = self.program.exc_overflow;
                    self.raise_guest_class(class)
                }
            }

            // ----- float operations -----
            JcOp::FloatAdd => self.float_binary(OpNum::FloatAdd, decoder, Kind::Float),
            JcOp::FloatSub => self.float_binary(OpNum::FloatSub, decoder, Kind::Float),
            JcOp::FloatMul => self.float_binary(OpNum::FloatMul, decoder, Kind::Float),
            JcOp::FloatDiv => self.float_binary(OpNum::FloatDiv, decoder, Kind::Float),
            JcOp::FloatNeg => {
                let a = self.reg(Kind::Float, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let result = self
                    .execute_and_record(OpNum::FloatNeg, vec![a], None)
                    .unwrap()
                    .unwrap();
                self.set_reg(Kind::Float, dst, result);
                StepResult::Continue
            }
            JcOp::FloatLt => self.float_binary(OpNum::FloatLt, decoder, Kind::Int),
            JcOp::FloatLe => self.float_binary(OpNum::FloatLe, decoder, Kind::Int),
            JcOp::FloatEq => self.float_binary(OpNum::FloatEq, decoder, Kind::Int),
            JcOp::FloatNe => self.float_binary(OpNum::FloatNe, decoder, Kind::Int),
            JcOp::FloatGt => self.float_binary(OpNum::FloatGt, decoder, Kind::Int),
            JcOp::FloatGe => self.float_binary(OpNum::FloatGe, decoder, Kind::Int),

            // ----- pointers -----
            JcOp::PtrEq | JcOp::PtrNe => {
                let opnum = if op == JcOp::PtrEq {
                    OpNum::PtrEq
                } else {
                    OpNum::PtrNe
                };
                let a = self.reg(Kind::Ref, decoder.next_byte());
                let b = self.reg(Kind::Ref, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let result = self
                    .execute_and_record(opnum, vec![a, b], None)
                    .unwrap()
                    .unwrap();
                self.set_reg(Kind::Int, dst, result);
                StepResult::Continue
            }
            JcOp::RefIsNull | JcOp::RefNonNull => {
                let obj = self.reg(Kind::Ref, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let is_null = obj.ref_value().is_null();
                let guard = if is_null {
                    OpNum::GuardIsnull
                } else {
                    OpNum::GuardNonnull
                };
                self.generate_guard(orgpc, guard, Some(obj), vec![]);
                let outcome = match op {
                    JcOp::RefIsNull => is_null,
                    _ => !is_null,
                };
                self.set_reg(Kind::Int, dst, Operand::Const(ConstVal::Int(outcome as i64)));
                StepResult::Continue
            }

            // ----- control flow -----
            JcOp::Goto => {
                let target = decoder.next_u16() as usize;
                self.top_mut().pc = target;
                StepResult::Continue
            }
            JcOp::GotoIfNot => {
                let target = decoder.next_u16() as usize;
                let cond = self.reg(Kind::Int, decoder.next_byte());
                self.top_mut().pc = decoder.pc;
                if cond.int_value() != 0 {
                    self.generate_guard(orgpc, OpNum::GuardTrue, Some(cond), vec![]);
                    StepResult::Continue
                } else {
                    self.generate_guard(orgpc, OpNum::GuardFalse, Some(cond), vec![]);
                    self.top_mut().pc = target;
                    StepResult::Continue
                }
            }
            JcOp::Switch => {
                let selector = self.reg(Kind::Int, decoder.next_byte());
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                self.top_mut().pc = decoder.pc;
                let promoted = self.implement_guard_value(orgpc, selector);
                let cases = match &descr {
                    DescrRef::SwitchDict(d) => &d.cases,
                    other => panic!("switch with non-switch descr {other:?}"),
                };
                if let Some(&target) = cases.get(&promoted.int_value()) {
                    self.top_mut().pc = target;
                }
                StepResult::Continue
            }
            JcOp::IntReturn => {
                let value = self.reg(Kind::Int, decoder.next_byte());
                self.finish_frame(Some(value))
            }
            JcOp::RefReturn => {
                let value = self.reg(Kind::Ref, decoder.next_byte());
                self.finish_frame(Some(value))
            }
            JcOp::FloatReturn => {
                let value = self.reg(Kind::Float, decoder.next_byte());
                self.finish_frame(Some(value))
            }
            JcOp::VoidReturn => self.finish_frame(None),

            // ----- heap -----
            JcOp::New | JcOp::NewWithVtable => {
                let opnum = if op == JcOp::New {
                    OpNum::New
                } else {
                    OpNum::NewWithVtable
                };
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let result = self
                    .execute_and_record(opnum, vec![], Some(descr))
                    .unwrap()
                    .unwrap();
                self.set_reg(Kind::Ref, dst, result);
                StepResult::Continue
            }
            JcOp::NewArray => {
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                let len = self.reg(Kind::Int, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let result = self
                    .execute_and_record(OpNum::NewArray, vec![len], Some(descr))
                    .unwrap()
                    .unwrap();
                self.set_reg(Kind::Ref, dst, result);
                StepResult::Continue
            }
            JcOp::GetfieldGc | JcOp::GetfieldGcPure => {
                let opnum = if op == JcOp::GetfieldGc {
                    OpNum::GetfieldGc
                } else {
                    OpNum::GetfieldGcPure
                };
                let obj = self.reg(Kind::Ref, decoder.next_byte());
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let kind = descr.as_field().kind;
                let result = self
                    .execute_and_record(opnum, vec![obj], Some(descr))
                    .unwrap()
                    .unwrap();
                self.set_reg(kind, dst, result);
                StepResult::Continue
            }
            JcOp::SetfieldGc => {
                let obj = self.reg(Kind::Ref, decoder.next_byte());
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                let kind = descr.as_field().kind;
                let value = self.reg(kind, decoder.next_byte());
                self.top_mut().pc = decoder.pc;
                self.execute_and_record(OpNum::SetfieldGc, vec![obj, value], Some(descr))
                    .unwrap();
                StepResult::Continue
            }
            JcOp::GetarrayitemGc | JcOp::GetarrayitemGcPure => {
                let opnum = if op == JcOp::GetarrayitemGc {
                    OpNum::GetarrayitemGc
                } else {
                    OpNum::GetarrayitemGcPure
                };
                let arr = self.reg(Kind::Ref, decoder.next_byte());
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                let index = self.reg(Kind::Int, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let kind = descr.as_array().kind;
                let result = self
                    .execute_and_record(opnum, vec![arr, index], Some(descr))
                    .unwrap()
                    .unwrap();
                self.set_reg(kind, dst, result);
                StepResult::Continue
            }
            JcOp::SetarrayitemGc => {
                let arr = self.reg(Kind::Ref, decoder.next_byte());
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                let index = self.reg(Kind::Int, decoder.next_byte());
                let kind = descr.as_array().kind;
                let value = self.reg(kind, decoder.next_byte());
                self.top_mut().pc = decoder.pc;
                self.execute_and_record(OpNum::SetarrayitemGc, vec![arr, index, value], Some(descr))
                    .unwrap();
                StepResult::Continue
            }
            JcOp::ArraylenGc => {
                let arr = self.reg(Kind::Ref, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let result = self
                    .execute_and_record(OpNum::ArraylenGc, vec![arr], None)
                    .unwrap()
                    .unwrap();
                self.set_reg(Kind::Int, dst, result);
                StepResult::Continue
            }

            JcOp::GetfieldVable => {
                let obj = self.reg(Kind::Ref, decoder.next_byte());
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let field = descr.as_field().clone();
                let kind = field.kind;
                let shadow = self.vable_shadow(&field);
                match shadow {
                    Some(value) => {
                        self.set_reg(kind, dst, value);
                        StepResult::Continue
                    }
                    None => {
                        // not the virtualizable object: plain field read
                        let result = self
                            .execute_and_record(OpNum::GetfieldGc, vec![obj], Some(descr))
                            .unwrap()
                            .unwrap();
                        self.set_reg(kind, dst, result);
                        StepResult::Continue
                    }
                }
            }
            JcOp::SetfieldVable => {
                let obj = self.reg(Kind::Ref, decoder.next_byte());
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                let field = descr.as_field().clone();
                let value = self.reg(field.kind, decoder.next_byte());
                self.top_mut().pc = decoder.pc;
                if !self.vable_store_shadow(&field, value.clone()) {
                    self.execute_and_record(OpNum::SetfieldGc, vec![obj, value], Some(descr))
                        .unwrap();
                }
                StepResult::Continue
            }

            // ----- calls -----
            JcOp::InlineCall => {
                let callee_index = decoder.next_u16() as usize;
                let (args_i, args_r, args_f) = decoder.next_reg_lists3();
                let callee = self.program.jitcode(callee_index).clone();
                let dst = callee.result_kind.map(|_| decoder.next_byte());
                self.top_mut().pc = decoder.pc;

                if !self.inlining {
                    debug!("aborting tracing: call found with inlining disabled");
                    return StepResult::Leave(RunResult::Aborted(AbortReason::UnsupportedOp));
                }

                let values_i: Vec<Operand> =
                    args_i.iter().map(|&r| self.reg(Kind::Int, r)).collect();
                let values_r: Vec<Operand> =
                    args_r.iter().map(|&r| self.reg(Kind::Ref, r)).collect();
                let values_f: Vec<Operand> =
                    args_f.iter().map(|&r| self.reg(Kind::Float, r)).collect();

                self.top_mut().pending_result_reg = dst;
                let mut frame = self.pool.alloc(callee, 0);
                for (i, v) in values_i.into_iter().enumerate() {
                    frame.set_reg(Kind::Int, i as u8, v);
                }
                for (i, v) in values_r.into_iter().enumerate() {
                    frame.set_reg(Kind::Ref, i as u8, v);
                }
                for (i, v) in values_f.into_iter().enumerate() {
                    frame.set_reg(Kind::Float, i as u8, v);
                }
                self.framestack.push(frame);
                StepResult::ChangeFrame
            }

            JcOp::ResidualCall
            | JcOp::ResidualCallPure
            | JcOp::ResidualCallMayForce
            | JcOp::ResidualCallLoopinvariant => {
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                let func = decoder.next_u16();
                let (args_i, args_r, args_f) = decoder.next_reg_lists3();
                let result_kind = descr.as_call().result;
                let dst = result_kind.map(|_| decoder.next_byte());
                self.top_mut().pc = decoder.pc;

                let mut args: Vec<Operand> =
                    vec![Operand::Const(ConstVal::Int(func as i64))];
                args.extend(args_i.iter().map(|&r| self.reg(Kind::Int, r)));
                args.extend(args_r.iter().map(|&r| self.reg(Kind::Ref, r)));
                args.extend(args_f.iter().map(|&r| self.reg(Kind::Float, r)));

                self.do_residual_call(op, descr, args, result_kind, dst)
            }

            // ----- exceptions -----
            JcOp::CatchException => {
                // no exception pending: fall through past the handler hook
                decoder.next_u16();
                self.top_mut().pc = decoder.pc;
                StepResult::Continue
            }
            JcOp::LastExcValue => {
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let exc = self.last_exc.take().expect("last_exc_value without exception");
                self.set_reg(Kind::Ref, dst, exc);
                StepResult::Continue
            }
            JcOp::GotoIfExceptionMismatch => {
                let class = ClassId(decoder.next_u16() as u32);
                let target = decoder.next_u16() as usize;
                self.top_mut().pc = decoder.pc;
                let exc = self.last_exc.as_ref().expect("mismatch test without exception");
                let actual = exc.ref_value().class().expect("exception without class");
                if actual != class {
                    self.top_mut().pc = target;
                }
                StepResult::Continue
            }
            JcOp::Raise => {
                let value = self.reg(Kind::Ref, decoder.next_byte());
                self.top_mut().pc = decoder.pc;
                self.last_exc = Some(value);
                self.dispatch_exception()
            }
            JcOp::Reraise => {
                self.top_mut().pc = decoder.pc;
                debug_assert!(self.last_exc.is_some());
                // propagate out of the current frame
                let frame = self.framestack.pop().expect("empty frame stack");
                self.pool.release(frame);
                if self.framestack.is_empty() {
                    let exc = self.last_exc.take().unwrap();
                    return StepResult::Leave(RunResult::Raised(exc));
                }
                self.dispatch_exception()
            }

            // ----- driver hints -----
            JcOp::JitMergePoint => {
                let greens_regs = decoder.next_reg_list();
                let (reds_i, reds_r, reds_f) = decoder.next_reg_lists3();
                self.top_mut().pc = decoder.pc;
                self.handle_merge_point(&greens_regs, &reds_i, &reds_r, &reds_f)
            }
            JcOp::CanEnterJit => {
                decoder.next_reg_list();
                decoder.next_reg_lists3();
                self.top_mut().pc = decoder.pc;
                if self.framestack.len() > 1 {
                    debug!("aborting tracing: can_enter_jit in a nested frame");
                    return StepResult::Leave(RunResult::Aborted(AbortReason::NestedCanEnterJit));
                }
                self.seen_can_enter_jit = true;
                StepResult::Continue
            }
            JcOp::Promote => {
                let src = self.reg(Kind::Int, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let promoted = self.implement_guard_value(orgpc, src);
                self.set_reg(Kind::Int, dst, promoted);
                StepResult::Continue
            }
            JcOp::GuardClass => {
                let obj = self.reg(Kind::Ref, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let class = obj
                    .ref_value()
                    .class()
                    .expect("guard_class on classless object");
                let cls_const = Operand::Const(ConstVal::Int(class.0 as i64));
                self.generate_guard(orgpc, OpNum::GuardClass, Some(obj), vec![cls_const.clone()]);
                self.set_reg(Kind::Int, dst, cls_const);
                StepResult::Continue
            }
            JcOp::Keepalive => {
                decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                StepResult::Continue
            }
            JcOp::Unsupported => {
                debug!("aborting tracing: unsupported operation");
                StepResult::Leave(RunResult::Aborted(AbortReason::UnsupportedOp))
            }
        }
    }

    // ===== merge points =====

    fn handle_merge_point(
        &mut self,
        greens_regs: &[u8],
        reds_i: &[u8],
        reds_r: &[u8],
        reds_f: &[u8],
    ) -> StepResult {
        let mut greens: Vec<ConstVal> = Vec::with_capacity(greens_regs.len());
        for &r in greens_regs {
            match self.reg(Kind::Int, r) {
                Operand::Const(c) => greens.push(c),
                Operand::Box(_) => {
                    // a merge point whose greens are runtime data cannot
                    // anchor a trace
                    debug!("aborting tracing: non-constant green at merge point");
                    return StepResult::Leave(RunResult::Aborted(AbortReason::UnsupportedOp));
                }
            }
        }

        let mut reds: Vec<Operand> = vec![];
        reds.extend(reds_i.iter().map(|&r| self.reg(Kind::Int, r)));
        reds.extend(reds_r.iter().map(|&r| self.reg(Kind::Ref, r)));
        reds.extend(reds_f.iter().map(|&r| self.reg(Kind::Float, r)));

        self.record_op(
            OpNum::DebugMergePoint,
            greens.iter().cloned().map(Operand::Const).collect(),
            None,
            None,
        );

        if !self.start_set {
            // trace start: the reds become the loop's input arguments
            let red_boxes: Vec<TraceBox> = reds
                .iter()
                .map(|r| {
                    r.as_box()
                        .expect("red argument not a runtime value at trace start")
                        .clone()
                })
                .collect();
            let mut history = History::new(red_boxes);
            // keep the merge-point marker just recorded
            for op in self.history.operations.drain(..) {
                history.operations.push(op);
            }
            self.history = history;
            self.start_greens = greens;
            self.start_set = true;
            self.setup_virtualizable(&reds);
            return StepResult::Continue;
        }

        if self.seen_can_enter_jit {
            self.pending_merge_reds = reds;
            return StepResult::Leave(RunResult::MergeReached { greens });
        }
        StepResult::Continue
    }

    /// When the driver declared virtualizable fields, shadow them: read
    /// the current values into fresh input boxes so field accesses stay
    /// in registers for the whole loop. The virtualizable is the first
    /// red ref argument.
    fn setup_virtualizable(&mut self, reds: &[Operand]) {
        let Some(fields) = self.vable_fields.clone() else {
            return;
        };
        let Some(obj) = reds.iter().find(|r| r.kind() == Kind::Ref).cloned() else {
            return;
        };
        let gcref = obj.ref_value();
        let mut shadows = Vec::with_capacity(fields.len());
        for field in fields {
            let shadow = TraceBox::new(gcref.get_field(field.offset));
            self.history.inputargs.push(shadow.clone());
            self.history.add_known_box(shadow.clone());
            shadows.push((Operand::Box(shadow), field));
        }
        self.virtualizable = Some(VirtualizableState { obj, shadows });
    }

    fn vable_shadow(&self, field: &Rc<FieldDescr>) -> Option<Operand> {
        let vable = self.virtualizable.as_ref()?;
        vable
            .shadows
            .iter()
            .find(|(_, f)| Rc::ptr_eq(f, field))
            .map(|(s, _)| s.clone())
    }

    fn vable_store_shadow(&mut self, field: &Rc<FieldDescr>, value: Operand) -> bool {
        let Some(vable) = self.virtualizable.as_mut() else {
            return false;
        };
        for (shadow, f) in vable.shadows.iter_mut() {
            if Rc::ptr_eq(f, field) {
                *shadow = value;
                return true;
            }
        }
        false
    }

    // ===== residual calls =====

    fn do_residual_call(
        &mut self,
        op: JcOp,
        descr: DescrRef,
        args: Vec<Operand>,
        result_kind: Option<Kind>,
        dst: Option<u8>,
    ) -> StepResult {
        // pure call with constant arguments folds away entirely
        if op == JcOp::ResidualCallPure && args.iter().all(Operand::is_const) {
            return match self.execute_and_record(OpNum::CallPure, args, Some(descr)) {
                Ok(result) => {
                    if let (Some(value), Some(reg)) = (result, dst) {
                        self.set_reg(result_kind.unwrap(), reg, value);
                    }
                    StepResult::Continue
                }
                Err(_) => {
                    debug!("aborting tracing: pure residual call raised");
                    StepResult::Leave(RunResult::Aborted(AbortReason::UnsupportedOp))
                }
            };
        }

        let opnum = match op {
            JcOp::ResidualCallPure => OpNum::CallPure,
            JcOp::ResidualCallMayForce => OpNum::CallMayForce,
            JcOp::ResidualCallLoopinvariant => OpNum::CallLoopinvariant,
            _ => OpNum::Call,
        };

        // any residual call may observe the virtualizable: store the
        // shadows back before, reload after
        self.vable_sync_before_call();

        let force = match opnum {
            OpNum::CallMayForce => Some(Rc::new(ForceToken::default())),
            _ => None,
        };

        // evaluate the call; record it even when it raises, since the
        // compiled trace replays the call either way
        let values: Vec<RawValue> = args.iter().map(Operand::value).collect();
        let ctx = ExecContext {
            program: &self.program,
            force: force.clone(),
        };
        let outcome = execute_op(&ctx, opnum, &values, Some(&descr));
        let result = match &outcome {
            Ok(value) => value.clone().map(TraceBox::new),
            // the result register holds junk on the exception path
            Err(_) => result_kind.map(|k| TraceBox::new(RawValue::default_of(k))),
        };
        self.record_op(opnum, args, result.clone(), Some(descr));

        if let Some(token) = &force {
            if token.forced.get() {
                debug!("aborting tracing: virtualizable forced during residual call");
                return StepResult::Leave(RunResult::Aborted(AbortReason::ForcedWhileTracing));
            }
            let resume_pc = self.top().pc;
            let forced_descr = Rc::new(ResumeGuardForcedDescr::new());
            self.capture_for(&forced_descr.base, resume_pc);
            self.record_op(
                OpNum::GuardNotForced,
                vec![],
                None,
                Some(DescrRef::ResumeGuardForced(forced_descr.clone())),
            );
            if let Some(vable) = &self.virtualizable {
                let obj = vable.obj.ref_value();
                let shadows: Vec<(TraceBox, Rc<FieldDescr>)> = vable
                    .shadows
                    .iter()
                    .filter_map(|(s, f)| s.as_box().map(|b| (b.clone(), f.clone())))
                    .collect();
                forced_descr.register_refresh(obj, &shadows);
            }
        }

        match outcome {
            Ok(_) => {
                if opnum != OpNum::CallPure {
                    if let Some(step) = self.handle_possible_exception(None) {
                        return step;
                    }
                }
                if let (Some(value), Some(reg)) = (result, dst) {
                    self.set_reg(result_kind.unwrap(), reg, Operand::Box(value));
                }
                self.vable_reload_after_call();
                StepResult::Continue
            }
            Err(ExecError::Raise(exc)) => {
                if opnum == OpNum::CallPure {
                    debug!("aborting tracing: pure residual call raised");
                    return StepResult::Leave(RunResult::Aborted(AbortReason::UnsupportedOp));
                }
                self.vable_reload_after_call();
                self.handle_possible_exception(Some(exc))
                    .expect("exception dispatch required")
            }
            Err(_) => unreachable!("residual calls report only guest exceptions"),
        }
    }
}
