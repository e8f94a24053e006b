//! The plain guest interpreter
//!
//! Executes jitcode concretely, with no recording. This is both the
//! cold-path executor (before anything is hot) and the blackhole target:
//! when a trace is abandoned or a guard fails without a bridge, the
//! rebuilt frames continue here. At every `can_enter_jit` the driver is
//! consulted and may run native code, start tracing, or replace the
//! frame stack.

use std::rc::Rc;

use crate::driver::{CanEnterOutcome, JitDriver, RedRegs};
use crate::error::{ExecError, GuestException};
use crate::heap::{ClassId, GcRef, Kind, RawValue};
use crate::ir::descr::DescrRef;
use crate::ir::execute::{execute_op, ExecContext};
use crate::ir::ops::OpNum;
use crate::jitcode::{Decoder, JcOp, JitCode, Program};
use crate::meta::frame::MIFrame;
use crate::backend::TraceBackend;

/// A concrete guest activation.
pub struct PlainFrame {
    pub jitcode: Rc<JitCode>,
    pub pc: usize,
    pub regs_i: Vec<i64>,
    pub regs_r: Vec<GcRef>,
    pub regs_f: Vec<f64>,
    pub pending_result_reg: Option<u8>,
}

impl PlainFrame {
    pub fn new(jitcode: Rc<JitCode>, pc: usize) -> PlainFrame {
        PlainFrame {
            pc,
            regs_i: vec![0; jitcode.num_regs_i],
            regs_r: vec![GcRef::null(); jitcode.num_regs_r],
            regs_f: vec![0.0; jitcode.num_regs_f],
            pending_result_reg: None,
            jitcode,
        }
    }

    /// Concretize a tracing frame (blackhole and resume paths).
    pub fn from_tracing(frame: &MIFrame) -> PlainFrame {
        PlainFrame {
            jitcode: frame.jitcode.clone(),
            pc: frame.pc,
            regs_i: frame.registers_i.iter().map(|op| op.value().as_int()).collect(),
            regs_r: frame.registers_r.iter().map(|op| op.value().as_ref()).collect(),
            regs_f: frame
                .registers_f
                .iter()
                .map(|op| op.value().as_float())
                .collect(),
            pending_result_reg: frame.pending_result_reg,
        }
    }

    pub fn get(&self, kind: Kind, index: u8) -> RawValue {
        match kind {
            Kind::Int => RawValue::Int(self.regs_i[index as usize]),
            Kind::Ref => RawValue::Ref(self.regs_r[index as usize].clone()),
            Kind::Float => RawValue::Float(self.regs_f[index as usize]),
        }
    }

    pub fn set(&mut self, kind: Kind, index: u8, value: RawValue) {
        match (kind, value) {
            (Kind::Int, RawValue::Int(v)) => self.regs_i[index as usize] = v,
            (Kind::Ref, RawValue::Ref(v)) => self.regs_r[index as usize] = v,
            (Kind::Float, RawValue::Float(v)) => self.regs_f[index as usize] = v,
            (kind, value) => panic!(
                "wrong-kind value stored in register file: {:?} into {kind:?}",
                value.kind()
            ),
        }
    }
}

enum PlainStep {
    Continue,
    Finished(Option<RawValue>),
}

/// Run one guest function to completion. With a driver, loops become
/// candidates for tracing and native execution; without one, this is the
/// reference interpreter.
pub fn run_function<B: TraceBackend>(
    program: &Rc<Program>,
    mut driver: Option<&mut JitDriver<B>>,
    fn_index: usize,
    args: &[RawValue],
) -> Result<Option<RawValue>, GuestException> {
    let jitcode = program.jitcode(fn_index).clone();
    let mut frame = PlainFrame::new(jitcode, 0);
    let mut next_i = 0u8;
    let mut next_r = 0u8;
    let mut next_f = 0u8;
    for value in args {
        let (kind, index) = match value.kind() {
            Kind::Int => (Kind::Int, &mut next_i),
            Kind::Ref => (Kind::Ref, &mut next_r),
            Kind::Float => (Kind::Float, &mut next_f),
        };
        frame.set(kind, *index, value.clone());
        *index += 1;
    }

    let mut runner = GuestRunner {
        program: program.clone(),
        frames: vec![frame],
        last_exc: None,
    };
    runner.run(&mut driver)
}

struct GuestRunner {
    program: Rc<Program>,
    frames: Vec<PlainFrame>,
    last_exc: Option<GcRef>,
}

impl GuestRunner {
    fn run<B: TraceBackend>(
        &mut self,
        driver: &mut Option<&mut JitDriver<B>>,
    ) -> Result<Option<RawValue>, GuestException> {
        loop {
            match self.step(driver)? {
                PlainStep::Continue => {}
                PlainStep::Finished(value) => return Ok(value),
            }
        }
    }

    fn top(&self) -> &PlainFrame {
        self.frames.last().expect("empty frame stack")
    }

    fn top_mut(&mut self) -> &mut PlainFrame {
        self.frames.last_mut().expect("empty frame stack")
    }

    fn exec(
        &self,
        opnum: OpNum,
        args: &[RawValue],
        descr: Option<&DescrRef>,
    ) -> Result<Option<RawValue>, ExecError> {
        let ctx = ExecContext::new(&self.program);
        execute_op(&ctx, opnum, args, descr)
    }

    fn raise_class(&mut self, class: ClassId) -> Result<PlainStep, GuestException> {
        let exc = self.program.raise_instance(class);
        self.last_exc = Some(exc.value);
        self.dispatch_exception()
    }

    /// Unwind toward the nearest `catch_exception`, popping frames.
    fn dispatch_exception(&mut self) -> Result<PlainStep, GuestException> {
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
                return Ok(PlainStep::Continue);
            }
            self.frames.pop();
            if self.frames.is_empty() {
                let value = self.last_exc.take().unwrap();
                return Err(GuestException { value });
            }
        }
    }

    fn finish_frame(&mut self, value: Option<RawValue>) -> PlainStep {
        let frame = self.frames.pop().expect("empty frame stack");
        let result_kind = frame.jitcode.result_kind;
        if self.frames.is_empty() {
            return PlainStep::Finished(value);
        }
        let caller = self.top_mut();
        match (value, caller.pending_result_reg.take()) {
            (Some(v), Some(reg)) => {
                caller.set(result_kind.expect("value returned from void jitcode"), reg, v)
            }
            (None, None) => {}
            _ => panic!("call result does not match callee result kind"),
        }
        PlainStep::Continue
    }

    fn int_binary(
        &mut self,
        opnum: OpNum,
        decoder: &mut Decoder<'_>,
    ) -> Result<PlainStep, GuestException> {
        let a = self.top().get(Kind::Int, decoder.next_byte());
        let b = self.top().get(Kind::Int, decoder.next_byte());
        let dst = decoder.next_byte();
        self.top_mut().pc = decoder.pc;
        match self.exec(opnum, &[a, b], None) {
            Ok(value) => {
                self.top_mut()
                    .set(Kind::Int, dst, value.expect("int op produces a value"));
                Ok(PlainStep::Continue)
            }
            Err(ExecError::DivByZero) => {
                let class = self.program.exc_zero_division;
                self.raise_class(class)
            }
            Err(ExecError::Overflow) => {
                let class = self.program.exc_overflow;
                self.raise_class(class)
            }
            Err(ExecError::Raise(_)) => unreachable!("int op raised a guest exception"),
        }
    }

    fn step<B: TraceBackend>(
        &mut self,
        driver: &mut Option<&mut JitDriver<B>>,
    ) -> Result<PlainStep, GuestException> {
        let jitcode = self.top().jitcode.clone();
        let mut decoder = Decoder::new(&jitcode, self.top().pc);
        let op = decoder.next_op();

        match op {
            JcOp::IntConst => {
                let value = decoder.next_signed() as i64;
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                self.top_mut().set(Kind::Int, dst, RawValue::Int(value));
            }
            JcOp::IntFromPool => {
                let value = jitcode.constants_i[decoder.next_u16() as usize];
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                self.top_mut().set(Kind::Int, dst, RawValue::Int(value));
            }
            JcOp::RefFromPool => {
                let value = jitcode.constants_r[decoder.next_u16() as usize].clone();
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                self.top_mut().set(Kind::Ref, dst, RawValue::Ref(value));
            }
            JcOp::FloatFromPool => {
                let value = jitcode.constants_f[decoder.next_u16() as usize];
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                self.top_mut().set(Kind::Float, dst, RawValue::Float(value));
            }
            JcOp::RefNull => {
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                self.top_mut().set(Kind::Ref, dst, RawValue::Ref(GcRef::null()));
            }
            JcOp::IntCopy | JcOp::RefCopy | JcOp::FloatCopy => {
                let kind = match op {
                    JcOp::IntCopy => Kind::Int,
                    JcOp::RefCopy => Kind::Ref,
                    _ => Kind::Float,
                };
                let value = self.top().get(kind, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                self.top_mut().set(kind, dst, value);
            }

            JcOp::IntAdd => return self.int_binary(OpNum::IntAdd, &mut decoder),
            JcOp::IntSub => return self.int_binary(OpNum::IntSub, &mut decoder),
            JcOp::IntMul => return self.int_binary(OpNum::IntMul, &mut decoder),
            JcOp::IntFloordiv => return self.int_binary(OpNum::IntFloordiv, &mut decoder),
            JcOp::IntMod => return self.int_binary(OpNum::IntMod, &mut decoder),
            JcOp::IntAnd => return self.int_binary(OpNum::IntAnd, &mut decoder),
            JcOp::IntOr => return self.int_binary(OpNum::IntOr, &mut decoder),
            JcOp::IntXor => return self.int_binary(OpNum::IntXor, &mut decoder),
            JcOp::IntLshift => return self.int_binary(OpNum::IntLshift, &mut decoder),
            JcOp::IntRshift => return self.int_binary(OpNum::IntRshift, &mut decoder),
            JcOp::UintRshift => return self.int_binary(OpNum::UintRshift, &mut decoder),
            JcOp::IntLt => return self.int_binary(OpNum::IntLt, &mut decoder),
            JcOp::IntLe => return self.int_binary(OpNum::IntLe, &mut decoder),
            JcOp::IntEq => return self.int_binary(OpNum::IntEq, &mut decoder),
            JcOp::IntNe => return self.int_binary(OpNum::IntNe, &mut decoder),
            JcOp::IntGt => return self.int_binary(OpNum::IntGt, &mut decoder),
            JcOp::IntGe => return self.int_binary(OpNum::IntGe, &mut decoder),
            JcOp::UintLt => return self.int_binary(OpNum::UintLt, &mut decoder),
            JcOp::UintLe => return self.int_binary(OpNum::UintLe, &mut decoder),
            JcOp::UintGt => return self.int_binary(OpNum::UintGt, &mut decoder),
            JcOp::UintGe => return self.int_binary(OpNum::UintGe, &mut decoder),
            JcOp::IntAddOvf => return self.int_binary(OpNum::IntAddOvf, &mut decoder),
            JcOp::IntSubOvf => return self.int_binary(OpNum::IntSubOvf, &mut decoder),
            JcOp::IntMulOvf => return self.int_binary(OpNum::IntMulOvf, &mut decoder),

            JcOp::IntIsTrue | JcOp::IntNeg | JcOp::IntAbs => {
                let opnum = match op {
                    JcOp::IntIsTrue => OpNum::IntIsTrue,
                    JcOp::IntNeg => OpNum::IntNeg,
                    _ => OpNum::IntAbs,
                };
                let a = self.top().get(Kind::Int, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let value = self.exec(opnum, &[a], None).unwrap().unwrap();
                self.top_mut().set(Kind::Int, dst, value);
            }

            JcOp::CheckZeroDivision => {
                let divisor = self.top().get(Kind::Int, decoder.next_byte());
                self.top_mut().pc = decoder.pc;
                if divisor.as_int() == 0 {
                    let class = self.program.exc_zero_division;
                    return self.raise_class(class);
                }
            }
            JcOp::CheckDivOverflow => {
                let a = self.top().get(Kind::Int, decoder.next_byte());
                let b = self.top().get(Kind::Int, decoder.next_byte());
                self.top_mut().pc = decoder.pc;
                if a.as_int() == i64::MIN && b.as_int() == -1 {
                    let class = self.program.exc_overflow;
                    return self.raise_class(class);
                }
            }

            JcOp::FloatAdd | JcOp::FloatSub | JcOp::FloatMul | JcOp::FloatDiv => {
                let opnum = match op {
                    JcOp::FloatAdd => OpNum::FloatAdd,
                    JcOp::FloatSub => OpNum::FloatSub,
                    JcOp::FloatMul => OpNum::FloatMul,
                    _ => OpNum::FloatDiv,
                };
                let a = self.top().get(Kind::Float, decoder.next_byte());
                let b = self.top().get(Kind::Float, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let value = self.exec(opnum, &[a, b], None).unwrap().unwrap();
                self.top_mut().set(Kind::Float, dst, value);
            }
            JcOp::FloatNeg => {
                let a = self.top().get(Kind::Float, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let value = self.exec(OpNum::FloatNeg, &[a], None).unwrap().unwrap();
                self.top_mut().set(Kind::Float, dst, value);
            }
            JcOp::FloatLt | JcOp::FloatLe | JcOp::FloatEq | JcOp::FloatNe | JcOp::FloatGt
            | JcOp::FloatGe => {
                let opnum = match op {
                    JcOp::FloatLt => OpNum::FloatLt,
                    JcOp::FloatLe => OpNum::FloatLe,
                    JcOp::FloatEq => OpNum::FloatEq,
                    JcOp::FloatNe => OpNum::FloatNe,
                    JcOp::FloatGt => OpNum::FloatGt,
                    _ => OpNum::FloatGe,
                };
                let a = self.top().get(Kind::Float, decoder.next_byte());
                let b = self.top().get(Kind::Float, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let value = self.exec(opnum, &[a, b], None).unwrap().unwrap();
                self.top_mut().set(Kind::Int, dst, value);
            }

            JcOp::PtrEq | JcOp::PtrNe => {
                let opnum = if op == JcOp::PtrEq {
                    OpNum::PtrEq
                } else {
                    OpNum::PtrNe
                };
                let a = self.top().get(Kind::Ref, decoder.next_byte());
                let b = self.top().get(Kind::Ref, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let value = self.exec(opnum, &[a, b], None).unwrap().unwrap();
                self.top_mut().set(Kind::Int, dst, value);
            }
            JcOp::RefIsNull | JcOp::RefNonNull => {
                let obj = self.top().get(Kind::Ref, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let is_null = obj.as_ref().is_null();
                let outcome = match op {
                    JcOp::RefIsNull => is_null,
                    _ => !is_null,
                };
                self.top_mut().set(Kind::Int, dst, RawValue::Int(outcome as i64));
            }

            JcOp::Goto => {
                let target = decoder.next_u16() as usize;
                self.top_mut().pc = target;
            }
            JcOp::GotoIfNot => {
                let target = decoder.next_u16() as usize;
                let cond = self.top().get(Kind::Int, decoder.next_byte());
                self.top_mut().pc = decoder.pc;
                if cond.as_int() == 0 {
                    self.top_mut().pc = target;
                }
            }
            JcOp::Switch => {
                let selector = self.top().get(Kind::Int, decoder.next_byte());
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                self.top_mut().pc = decoder.pc;
                let cases = match &descr {
                    DescrRef::SwitchDict(d) => &d.cases,
                    other => panic!("switch with non-switch descr {other:?}"),
                };
                if let Some(&target) = cases.get(&selector.as_int()) {
                    self.top_mut().pc = target;
                }
            }

            JcOp::IntReturn => {
                let value = self.top().get(Kind::Int, decoder.next_byte());
                return Ok(self.finish_frame(Some(value)));
            }
            JcOp::RefReturn => {
                let value = self.top().get(Kind::Ref, decoder.next_byte());
                return Ok(self.finish_frame(Some(value)));
            }
            JcOp::FloatReturn => {
                let value = self.top().get(Kind::Float, decoder.next_byte());
                return Ok(self.finish_frame(Some(value)));
            }
            JcOp::VoidReturn => return Ok(self.finish_frame(None)),

            JcOp::New | JcOp::NewWithVtable => {
                let opnum = if op == JcOp::New {
                    OpNum::New
                } else {
                    OpNum::NewWithVtable
                };
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let value = self.exec(opnum, &[], Some(&descr)).unwrap().unwrap();
                self.top_mut().set(Kind::Ref, dst, value);
            }
            JcOp::NewArray => {
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                let len = self.top().get(Kind::Int, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let value = self.exec(OpNum::NewArray, &[len], Some(&descr)).unwrap().unwrap();
                self.top_mut().set(Kind::Ref, dst, value);
            }
            JcOp::GetfieldGc | JcOp::GetfieldGcPure | JcOp::GetfieldVable => {
                let obj = self.top().get(Kind::Ref, decoder.next_byte());
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let kind = descr.as_field().kind;
                let value = self
                    .exec(OpNum::GetfieldGc, &[obj], Some(&descr))
                    .unwrap()
                    .unwrap();
                self.top_mut().set(kind, dst, value);
            }
            JcOp::SetfieldGc | JcOp::SetfieldVable => {
                let obj = self.top().get(Kind::Ref, decoder.next_byte());
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                let kind = descr.as_field().kind;
                let value = self.top().get(kind, decoder.next_byte());
                self.top_mut().pc = decoder.pc;
                self.exec(OpNum::SetfieldGc, &[obj, value], Some(&descr)).unwrap();
            }
            JcOp::GetarrayitemGc | JcOp::GetarrayitemGcPure => {
                let arr = self.top().get(Kind::Ref, decoder.next_byte());
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                let index = self.top().get(Kind::Int, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let kind = descr.as_array().kind;
                let value = self
                    .exec(OpNum::GetarrayitemGc, &[arr, index], Some(&descr))
                    .unwrap()
                    .unwrap();
                self.top_mut().set(kind, dst, value);
            }
            JcOp::SetarrayitemGc => {
                let arr = self.top().get(Kind::Ref, decoder.next_byte());
                let descr = jitcode.descrs[decoder.next_u16() as usize].clone();
                let index = self.top().get(Kind::Int, decoder.next_byte());
                let kind = descr.as_array().kind;
                let value = self.top().get(kind, decoder.next_byte());
                self.top_mut().pc = decoder.pc;
                self.exec(OpNum::SetarrayitemGc, &[arr, index, value], Some(&descr))
                    .unwrap();
            }
            JcOp::ArraylenGc => {
                let arr = self.top().get(Kind::Ref, decoder.next_byte());
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let value = self.exec(OpNum::ArraylenGc, &[arr], None).unwrap().unwrap();
                self.top_mut().set(Kind::Int, dst, value);
            }

            JcOp::InlineCall => {
                let callee_index = decoder.next_u16() as usize;
                let (args_i, args_r, args_f) = decoder.next_reg_lists3();
                let callee = self.program.jitcode(callee_index).clone();
                let dst = callee.result_kind.map(|_| decoder.next_byte());
                self.top_mut().pc = decoder.pc;

                let mut frame = PlainFrame::new(callee, 0);
                for (i, &r) in args_i.iter().enumerate() {
                    frame.regs_i[i] = self.top().regs_i[r as usize];
                }
                for (i, &r) in args_r.iter().enumerate() {
                    frame.regs_r[i] = self.top().regs_r[r as usize].clone();
                }
                for (i, &r) in args_f.iter().enumerate() {
                    frame.regs_f[i] = self.top().regs_f[r as usize];
                }
                self.top_mut().pending_result_reg = dst;
                self.frames.push(frame);
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

                let mut args = vec![RawValue::Int(func as i64)];
                args.extend(args_i.iter().map(|&r| self.top().get(Kind::Int, r)));
                args.extend(args_r.iter().map(|&r| self.top().get(Kind::Ref, r)));
                args.extend(args_f.iter().map(|&r| self.top().get(Kind::Float, r)));

                match self.exec(OpNum::Call, &args, Some(&descr)) {
                    Ok(value) => {
                        if let (Some(v), Some(reg)) = (value, dst) {
                            self.top_mut().set(result_kind.unwrap(), reg, v);
                        }
                    }
                    Err(ExecError::Raise(exc)) => {
                        self.last_exc = Some(exc.value);
                        return self.dispatch_exception();
                    }
                    Err(_) => unreachable!("residual calls report only guest exceptions"),
                }
            }

            JcOp::CatchException => {
                decoder.next_u16();
                self.top_mut().pc = decoder.pc;
            }
            JcOp::LastExcValue => {
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                let value = self.last_exc.take().expect("last_exc_value without exception");
                self.top_mut().set(Kind::Ref, dst, RawValue::Ref(value));
            }
            JcOp::GotoIfExceptionMismatch => {
                let class = ClassId(decoder.next_u16() as u32);
                let target = decoder.next_u16() as usize;
                self.top_mut().pc = decoder.pc;
                let exc = self.last_exc.as_ref().expect("mismatch test without exception");
                if exc.class() != Some(class) {
                    self.top_mut().pc = target;
                }
            }
            JcOp::Raise => {
                let value = self.top().get(Kind::Ref, decoder.next_byte());
                self.top_mut().pc = decoder.pc;
                self.last_exc = Some(value.as_ref());
                return self.dispatch_exception();
            }
            JcOp::Reraise => {
                self.top_mut().pc = decoder.pc;
                debug_assert!(self.last_exc.is_some());
                self.frames.pop();
                if self.frames.is_empty() {
                    let value = self.last_exc.take().unwrap();
                    return Err(GuestException { value });
                }
                return self.dispatch_exception();
            }

            JcOp::JitMergePoint => {
                decoder.next_reg_list();
                decoder.next_reg_lists3();
                self.top_mut().pc = decoder.pc;
            }
            JcOp::CanEnterJit => {
                let greens_regs = decoder.next_reg_list();
                let (reds_i, reds_r, reds_f) = decoder.next_reg_lists3();
                self.top_mut().pc = decoder.pc;

                if let Some(active) = driver.as_deref_mut() {
                    let reds = RedRegs {
                        i: reds_i,
                        r: reds_r,
                        f: reds_f,
                    };
                    let outcome =
                        active.can_enter_jit(&self.program, &mut self.frames, &greens_regs, reds);
                    match outcome {
                        CanEnterOutcome::Continue { pending_exception } => {
                            if let Some(exc) = pending_exception {
                                self.last_exc = Some(exc);
                                return self.dispatch_exception();
                            }
                        }
                        CanEnterOutcome::Returned(value) => {
                            return Ok(self.finish_frame(value));
                        }
                        CanEnterOutcome::Raised(exc) => {
                            self.frames.pop();
                            if self.frames.is_empty() {
                                return Err(exc);
                            }
                            self.last_exc = Some(exc.value);
                            return self.dispatch_exception();
                        }
                    }
                }
            }

            JcOp::Promote | JcOp::GuardClass => {
                // promotion and class guards are tracing concerns; the
                // interpreter just produces the value
                let src = decoder.next_byte();
                let dst = decoder.next_byte();
                self.top_mut().pc = decoder.pc;
                match op {
                    JcOp::Promote => {
                        let value = self.top().get(Kind::Int, src);
                        self.top_mut().set(Kind::Int, dst, value);
                    }
                    _ => {
                        let obj = self.top().get(Kind::Ref, src);
                        let class = obj
                            .as_ref()
                            .class()
                            .expect("guard_class on classless object");
                        self.top_mut().set(Kind::Int, dst, RawValue::Int(class.0 as i64));
                    }
                }
            }
            JcOp::Keepalive => {
                decoder.next_byte();
                self.top_mut().pc = decoder.pc;
            }
            JcOp::Unsupported => {
                // carries no interpreter-level semantics; it exists to
                // mark operations the tracer must not follow
                self.top_mut().pc = decoder.pc;
            }
        }
        Ok(PlainStep::Continue)
    }
}
