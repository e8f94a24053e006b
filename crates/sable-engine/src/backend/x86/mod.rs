//! x86 back-end: trace lowering to native code
//!
//! Compiles integer traces to machine code through `sable-asm`. The
//! calling convention is deliberately small: the entry point receives in
//! rdi a pointer to an `i64` buffer holding the input arguments; on
//! guard failure the code writes the failargs values back into the low
//! slots of the same buffer and returns the guard's ordinal. A trace's
//! closing `jump` writes the next iteration's arguments into the buffer
//! and branches to the reload point, so self-loops and cross-trace
//! bridge entries share one ABI. Spilled values also live in the buffer,
//! above the argument/failargs region, which keeps rsp untouched across
//! trace-to-trace jumps.
//!
//! Register assignment is a linear scan over box lifetimes
//! (`sable_asm::regalloc`). rax, rcx, and rdx stay out of the pool as
//! scratch (rdx also feeds division, rcx variable shifts), and rdi holds
//! the buffer.
//!
//! Operations outside the integer subset (heap access, residual calls,
//! floats) are rejected with `UnsupportedOp`; the driver keeps such
//! traces on the portable back-end. A comparison directly followed by a
//! guard on its result compiles to compare-and-branch with no
//! materialized condition value.

pub mod graph;

use std::rc::Rc;

use rustc_hash::FxHashMap;

use sable_asm::regalloc::{linear_scan, Interval, Slot};
use sable_asm::{fits_in_32bits, Assembler, Cond, Gpr, Label, Mode};

#[cfg(unix)]
use sable_asm::memmap::CodeMap;

use super::traits::{NativeExit, TraceBackend, TraceToken};
use crate::error::CompileError;
use crate::heap::{Kind, RawValue};
use crate::ir::boxes::{ConstVal, Operand, TraceBox};
use crate::ir::descr::DescrRef;
use crate::ir::ops::{OpNum, Operation};
use crate::jitcode::Program;

/// Pool registers for trace variables; all caller-saved.
const POOL: [Gpr; 5] = [Gpr::RSI, Gpr::R8, Gpr::R9, Gpr::R10, Gpr::R11];

/// Patchable guard-stub tail: long enough for `movabs r11, imm64; jmp r11`.
const STUB_TAIL_LEN: usize = 13;

/// Where a trace variable lives.
#[derive(Debug, Clone, Copy)]
enum Loc {
    Reg(Gpr),
    /// Byte offset into the rdi buffer (spill region)
    Buffer(i32),
}

struct GuardSite {
    descr: DescrRef,
    trace: usize,
    /// Offset of the patchable stub tail within the trace's code
    tail_offset: usize,
    failargs_len: usize,
}

struct X86Trace {
    code: Vec<u8>,
    /// Offset the closing `jump` (and incoming bridges) re-enter at
    head_offset: usize,
    inputargs_len: usize,
    #[cfg(unix)]
    map: CodeMap,
}

pub struct X86Backend {
    traces: Vec<X86Trace>,
    guards: Vec<GuardSite>,
    guard_by_descr: FxHashMap<usize, usize>,
    bridged: FxHashMap<usize, usize>,
    /// i64 slots any execution buffer must provide
    buffer_slots: usize,
}

impl X86Backend {
    pub fn new() -> X86Backend {
        X86Backend {
            traces: vec![],
            guards: vec![],
            guard_by_descr: FxHashMap::default(),
            bridged: FxHashMap::default(),
            buffer_slots: 0,
        }
    }

    pub fn trace_code(&self, token: TraceToken) -> &[u8] {
        &self.traces[token.0].code
    }
}

impl Default for X86Backend {
    fn default() -> Self {
        Self::new()
    }
}

// ===== lowering =====

struct PendingStub {
    label: Label,
    ordinal: usize,
    failargs: Vec<Operand>,
}

struct Lowerer {
    asm: Assembler,
    locs: FxHashMap<TraceBox, Loc>,
    stubs: Vec<PendingStub>,
    epilogue: Label,
}

impl Lowerer {
    fn loc(&self, b: &TraceBox) -> Loc {
        *self.locs.get(b).expect("box has no assigned location")
    }

    fn read(&mut self, operand: &Operand, dest: Gpr) -> Result<(), CompileError> {
        match operand {
            Operand::Const(ConstVal::Int(v)) => self.asm.mov_ri(dest, *v),
            Operand::Const(_) => return Err(CompileError::UnsupportedOp("non-int constant")),
            Operand::Box(b) => match self.loc(b) {
                Loc::Reg(reg) => self.asm.mov_rr(dest, reg),
                Loc::Buffer(disp) => self.asm.mov_rm(dest, Gpr::RDI, disp),
            },
        }
        Ok(())
    }

    fn write_result(&mut self, result: &Option<TraceBox>, src: Gpr) {
        let Some(b) = result else {
            return;
        };
        match self.loc(b) {
            Loc::Reg(reg) => self.asm.mov_rr(reg, src),
            Loc::Buffer(disp) => self.asm.mov_mr(Gpr::RDI, disp, src),
        }
    }

    /// rax <- arg0 OP arg1
    fn binary_into_rax(&mut self, op: &Operation) -> Result<(), CompileError> {
        self.read(&op.args[0], Gpr::RAX)?;
        match (&op.args[1], op.opnum) {
            (Operand::Const(ConstVal::Int(v)), opnum) if fits_in_32bits(*v) => {
                let imm = *v as i32;
                match opnum {
                    OpNum::IntAdd | OpNum::IntAddOvf => self.asm.add_ri(Gpr::RAX, imm),
                    OpNum::IntSub | OpNum::IntSubOvf => self.asm.sub_ri(Gpr::RAX, imm),
                    OpNum::IntAnd => self.asm.and_ri(Gpr::RAX, imm),
                    OpNum::IntOr => self.asm.or_ri(Gpr::RAX, imm),
                    OpNum::IntXor => self.asm.xor_ri(Gpr::RAX, imm),
                    _ => {
                        self.asm.mov_ri(Gpr::RDX, imm as i64);
                        self.binary_rax_rdx(opnum)?;
                    }
                }
            }
            (arg, opnum) => {
                self.read(arg, Gpr::RDX)?;
                self.binary_rax_rdx(opnum)?;
            }
        }
        Ok(())
    }

    fn binary_rax_rdx(&mut self, opnum: OpNum) -> Result<(), CompileError> {
        match opnum {
            OpNum::IntAdd | OpNum::IntAddOvf => self.asm.add_rr(Gpr::RAX, Gpr::RDX),
            OpNum::IntSub | OpNum::IntSubOvf => self.asm.sub_rr(Gpr::RAX, Gpr::RDX),
            OpNum::IntMul | OpNum::IntMulOvf => self.asm.imul_rr(Gpr::RAX, Gpr::RDX),
            OpNum::IntAnd => self.asm.and_rr(Gpr::RAX, Gpr::RDX),
            OpNum::IntOr => self.asm.or_rr(Gpr::RAX, Gpr::RDX),
            OpNum::IntXor => self.asm.xor_rr(Gpr::RAX, Gpr::RDX),
            OpNum::IntLshift => {
                self.asm.mov_rr(Gpr::RCX, Gpr::RDX);
                self.asm.shl_rcl(Gpr::RAX);
            }
            OpNum::IntRshift => {
                self.asm.mov_rr(Gpr::RCX, Gpr::RDX);
                self.asm.sar_rcl(Gpr::RAX);
            }
            OpNum::UintRshift => {
                self.asm.mov_rr(Gpr::RCX, Gpr::RDX);
                self.asm.shr_rcl(Gpr::RAX);
            }
            other => return Err(CompileError::UnsupportedOp(other.name())),
        }
        Ok(())
    }

    fn compare_cond(opnum: OpNum) -> Option<Cond> {
        match opnum {
            OpNum::IntLt => Some(Cond::L),
            OpNum::IntLe => Some(Cond::Le),
            OpNum::IntEq => Some(Cond::E),
            OpNum::IntNe => Some(Cond::Ne),
            OpNum::IntGt => Some(Cond::G),
            OpNum::IntGe => Some(Cond::Ge),
            OpNum::UintLt => Some(Cond::B),
            OpNum::UintLe => Some(Cond::Be),
            OpNum::UintGt => Some(Cond::A),
            OpNum::UintGe => Some(Cond::Ae),
            _ => None,
        }
    }

    /// cmp of a comparison's operands, leaving only the flags set
    fn emit_compare(&mut self, op: &Operation) -> Result<(), CompileError> {
        self.read(&op.args[0], Gpr::RAX)?;
        match &op.args[1] {
            Operand::Const(ConstVal::Int(v)) if fits_in_32bits(*v) => {
                self.asm.cmp_ri(Gpr::RAX, *v as i32);
            }
            arg => {
                self.read(arg, Gpr::RDX)?;
                self.asm.cmp_rr(Gpr::RAX, Gpr::RDX);
            }
        }
        Ok(())
    }

    fn new_stub(&mut self, ordinal: usize, descr: &DescrRef) -> Label {
        let label = self.asm.new_label();
        self.stubs.push(PendingStub {
            label,
            ordinal,
            failargs: descr.as_resume_guard().failargs(),
        });
        label
    }

    /// Write the failargs values into the buffer's low slots, set the
    /// return ordinal, and leave a patchable tail for a future bridge.
    fn emit_stubs(&mut self) -> Result<Vec<usize>, CompileError> {
        let stubs = std::mem::take(&mut self.stubs);
        let mut tails = Vec::with_capacity(stubs.len());
        for stub in stubs {
            self.asm.bind_label(stub.label);
            for (slot, operand) in stub.failargs.iter().enumerate() {
                self.read(operand, Gpr::RAX)?;
                self.asm.mov_mr(Gpr::RDI, (slot * 8) as i32, Gpr::RAX);
            }
            self.asm.mov_ri(Gpr::RAX, stub.ordinal as i64);
            let tail = self.asm.current_offset();
            self.asm.jmp(self.epilogue);
            while self.asm.current_offset() < tail + STUB_TAIL_LEN {
                self.asm.nop();
            }
            tails.push(tail);
        }
        Ok(tails)
    }
}

impl X86Backend {
    /// Shared lowering for loops and bridges. `inputs` pairs each input
    /// box with its buffer slot; `jump_to` names the trace the closing
    /// `jump` re-enters (`None` while compiling a self-loop).
    fn lower(
        &mut self,
        inputs: &[(usize, TraceBox)],
        operations: &[Operation],
        jump_to: Option<usize>,
    ) -> Result<X86Trace, CompileError> {
        // the spill region sits above every slot the arguments, jump
        // values, and failargs writes can touch
        let max_failargs = operations
            .iter()
            .filter(|op| op.is_guard())
            .filter_map(|op| op.descr.as_ref())
            .map(|d| d.as_resume_guard().failargs().len())
            .max()
            .unwrap_or(0);
        let max_jump_args = operations
            .iter()
            .filter(|op| op.opnum == OpNum::Jump)
            .map(|op| op.args.len())
            .max()
            .unwrap_or(0);
        let spill_base = inputs
            .iter()
            .map(|&(slot, _)| slot + 1)
            .chain([max_failargs, max_jump_args])
            .max()
            .unwrap_or(0);

        let (locs, spill_count) = assign_registers(inputs, operations, spill_base)?;
        self.buffer_slots = self.buffer_slots.max(spill_base + spill_count);

        let mut asm = Assembler::new(Mode::Long64);
        let epilogue = asm.new_label();
        let mut lowerer = Lowerer {
            asm,
            locs,
            stubs: vec![],
            epilogue,
        };

        let head_offset = lowerer.asm.current_offset();
        let head_label = lowerer.asm.new_label();
        lowerer.asm.bind_label(head_label);
        for &(slot, ref b) in inputs {
            lowerer.asm.mov_rm(Gpr::RAX, Gpr::RDI, (slot * 8) as i32);
            lowerer.write_result(&Some(b.clone()), Gpr::RAX);
        }

        let mut index = 0;
        while index < operations.len() {
            let op = &operations[index];
            match op.opnum {
                OpNum::Label | OpNum::DebugMergePoint => {}

                OpNum::SameAs => {
                    lowerer.read(&op.args[0], Gpr::RAX)?;
                    lowerer.write_result(&op.result, Gpr::RAX);
                }

                OpNum::IntAdd
                | OpNum::IntSub
                | OpNum::IntMul
                | OpNum::IntAnd
                | OpNum::IntOr
                | OpNum::IntXor
                | OpNum::IntLshift
                | OpNum::IntRshift
                | OpNum::UintRshift => {
                    lowerer.binary_into_rax(op)?;
                    lowerer.write_result(&op.result, Gpr::RAX);
                }

                OpNum::IntNeg => {
                    lowerer.read(&op.args[0], Gpr::RAX)?;
                    lowerer.asm.neg_r(Gpr::RAX);
                    lowerer.write_result(&op.result, Gpr::RAX);
                }
                OpNum::IntInvert => {
                    lowerer.read(&op.args[0], Gpr::RAX)?;
                    lowerer.asm.not_r(Gpr::RAX);
                    lowerer.write_result(&op.result, Gpr::RAX);
                }

                OpNum::IntFloordiv | OpNum::IntMod => {
                    lowerer.read(&op.args[0], Gpr::RAX)?;
                    lowerer.read(&op.args[1], Gpr::RCX)?;
                    lowerer.asm.cqo();
                    lowerer.asm.idiv_r(Gpr::RCX);
                    let out = if op.opnum == OpNum::IntFloordiv {
                        Gpr::RAX
                    } else {
                        Gpr::RDX
                    };
                    lowerer.write_result(&op.result, out);
                }

                OpNum::IntAddOvf | OpNum::IntSubOvf | OpNum::IntMulOvf => {
                    lowerer.binary_into_rax(op)?;
                    lowerer.write_result(&op.result, Gpr::RAX);
                    // the overflow guard directly after consumes OF; a
                    // plain mov does not disturb the flags
                    let guard = operations.get(index + 1).ok_or(
                        CompileError::UnsupportedOp("overflow arithmetic without guard"),
                    )?;
                    let descr = guard.descr.clone().expect("guard without descr");
                    let ordinal = self.new_guard(&descr);
                    let stub = lowerer.new_stub(ordinal, &descr);
                    match guard.opnum {
                        OpNum::GuardNoOverflow => lowerer.asm.jcc(Cond::O, stub),
                        OpNum::GuardOverflow => lowerer.asm.jcc(Cond::No, stub),
                        _ => {
                            return Err(CompileError::UnsupportedOp(
                                "overflow arithmetic without overflow guard",
                            ))
                        }
                    };
                    index += 2;
                    continue;
                }

                opnum if Lowerer::compare_cond(opnum).is_some() || opnum == OpNum::IntIsTrue => {
                    let cond = match opnum {
                        OpNum::IntIsTrue => {
                            lowerer.read(&op.args[0], Gpr::RAX)?;
                            lowerer.asm.test_rr(Gpr::RAX, Gpr::RAX);
                            Cond::Ne
                        }
                        _ => {
                            lowerer.emit_compare(op)?;
                            Lowerer::compare_cond(opnum).unwrap()
                        }
                    };
                    // fused with a directly following guard on this result
                    let fused = operations.get(index + 1).filter(|next| {
                        matches!(next.opnum, OpNum::GuardTrue | OpNum::GuardFalse)
                            && matches!(
                                (&next.args[0], &op.result),
                                (Operand::Box(b), Some(r)) if b == r
                            )
                    });
                    if let Some(guard) = fused {
                        let descr = guard.descr.clone().expect("guard without descr");
                        let ordinal = self.new_guard(&descr);
                        let stub = lowerer.new_stub(ordinal, &descr);
                        let exit_cond = match guard.opnum {
                            OpNum::GuardTrue => cond.negate(),
                            _ => cond,
                        };
                        lowerer.asm.jcc(exit_cond, stub);
                        index += 2;
                        continue;
                    }
                    lowerer.asm.setcc_r(cond, Gpr::RAX);
                    lowerer.asm.movzx8_rr(Gpr::RAX, Gpr::RAX);
                    lowerer.write_result(&op.result, Gpr::RAX);
                }

                OpNum::GuardTrue | OpNum::GuardFalse => {
                    let descr = op.descr.clone().expect("guard without descr");
                    let ordinal = self.new_guard(&descr);
                    let stub = lowerer.new_stub(ordinal, &descr);
                    lowerer.read(&op.args[0], Gpr::RAX)?;
                    lowerer.asm.test_rr(Gpr::RAX, Gpr::RAX);
                    let exit_cond = match op.opnum {
                        OpNum::GuardTrue => Cond::E,
                        _ => Cond::Ne,
                    };
                    lowerer.asm.jcc(exit_cond, stub);
                }

                OpNum::GuardValue => {
                    if op.args[0].kind() != Kind::Int {
                        return Err(CompileError::UnsupportedOp("non-int guard_value"));
                    }
                    let descr = op.descr.clone().expect("guard without descr");
                    let ordinal = self.new_guard(&descr);
                    let stub = lowerer.new_stub(ordinal, &descr);
                    lowerer.emit_compare(op)?;
                    lowerer.asm.jcc(Cond::Ne, stub);
                }

                OpNum::Jump => {
                    for (slot, arg) in op.args.iter().enumerate() {
                        lowerer.read(arg, Gpr::RAX)?;
                        lowerer.asm.mov_mr(Gpr::RDI, (slot * 8) as i32, Gpr::RAX);
                    }
                    match jump_to {
                        None => {
                            lowerer.asm.jmp(head_label);
                        }
                        Some(target) => {
                            // cross-trace entry through an absolute jump
                            #[cfg(unix)]
                            let addr = unsafe {
                                self.traces[target].map.entry(self.traces[target].head_offset)
                            } as i64;
                            #[cfg(not(unix))]
                            let addr = self.traces[target].head_offset as i64;
                            lowerer.asm.mov_ri_wide(Gpr::R11, addr);
                            lowerer.asm.jmp_r(Gpr::R11);
                        }
                    }
                }

                other => return Err(CompileError::UnsupportedOp(other.name())),
            }
            index += 1;
        }

        lowerer.asm.bind_label(epilogue);
        lowerer.asm.ret();

        let tails = lowerer.emit_stubs()?;
        let first_new_guard = self.guards.len() - tails.len();
        for (site, tail) in self.guards[first_new_guard..].iter_mut().zip(tails) {
            site.tail_offset = tail;
        }

        let finished = lowerer.asm.into_buffer().finish();
        #[cfg(unix)]
        let map = CodeMap::install(&finished.bytes)?;
        Ok(X86Trace {
            code: finished.bytes,
            head_offset,
            inputargs_len: inputs.len(),
            #[cfg(unix)]
            map,
        })
    }

    fn new_guard(&mut self, descr: &DescrRef) -> usize {
        let failargs_len = descr.as_resume_guard().failargs().len();
        self.buffer_slots = self.buffer_slots.max(failargs_len);
        let ordinal = self.guards.len();
        self.guards.push(GuardSite {
            descr: descr.clone(),
            trace: self.traces.len(),
            tail_offset: 0,
            failargs_len,
        });
        self.guard_by_descr.insert(descr.address(), ordinal);
        ordinal
    }
}

/// Build live intervals over op positions and run the linear scan.
/// Returns the location map and the number of spill slots used.
fn assign_registers(
    inputs: &[(usize, TraceBox)],
    operations: &[Operation],
    spill_base: usize,
) -> Result<(FxHashMap<TraceBox, Loc>, usize), CompileError> {
    let mut order: Vec<TraceBox> = vec![];
    let mut index_of: FxHashMap<TraceBox, usize> = FxHashMap::default();
    let mut intervals: Vec<Interval> = vec![];

    fn define(
        b: &TraceBox,
        at: u32,
        order: &mut Vec<TraceBox>,
        index_of: &mut FxHashMap<TraceBox, usize>,
        intervals: &mut Vec<Interval>,
    ) {
        if index_of.contains_key(b) {
            return;
        }
        index_of.insert(b.clone(), order.len());
        order.push(b.clone());
        intervals.push(Interval::new(at, at + 1));
    }

    fn use_at(
        b: &TraceBox,
        at: u32,
        index_of: &FxHashMap<TraceBox, usize>,
        intervals: &mut [Interval],
    ) {
        if let Some(&i) = index_of.get(b) {
            intervals[i].end = intervals[i].end.max(at + 1);
        }
    }

    for (_, b) in inputs {
        if b.kind() != Kind::Int {
            return Err(CompileError::UnsupportedOp("non-int trace input"));
        }
        define(b, 0, &mut order, &mut index_of, &mut intervals);
    }

    for (position, op) in operations.iter().enumerate() {
        let at = position as u32 + 1;
        for arg in &op.args {
            if let Operand::Box(b) = arg {
                use_at(b, at, &index_of, &mut intervals);
            }
        }
        if op.is_guard() {
            if let Some(descr) = &op.descr {
                for slot in descr.as_resume_guard().failargs() {
                    if let Operand::Box(b) = slot {
                        use_at(&b, at, &index_of, &mut intervals);
                    }
                }
            }
        }
        if let Some(result) = &op.result {
            if result.kind() != Kind::Int {
                return Err(CompileError::UnsupportedOp("non-int trace value"));
            }
            define(result, at, &mut order, &mut index_of, &mut intervals);
        }
    }

    let allocation = linear_scan(&intervals, POOL.len() as u8);
    let mut locs = FxHashMap::default();
    for (b, slot) in order.into_iter().zip(allocation.slots) {
        let loc = match slot {
            Slot::Reg(i) => Loc::Reg(POOL[i as usize]),
            Slot::Stack(n) => Loc::Buffer(((spill_base + n as usize) * 8) as i32),
        };
        locs.insert(b, loc);
    }
    Ok((locs, allocation.stack_slots as usize))
}

impl TraceBackend for X86Backend {
    fn name(&self) -> &'static str {
        "x86_64"
    }

    fn compile_loop(
        &mut self,
        _program: &Rc<Program>,
        inputargs: &[TraceBox],
        operations: Vec<Operation>,
    ) -> Result<TraceToken, CompileError> {
        let inputs: Vec<(usize, TraceBox)> = inputargs
            .iter()
            .enumerate()
            .map(|(slot, b)| (slot, b.clone()))
            .collect();
        let trace = self.lower(&inputs, &operations, None)?;
        let token = TraceToken(self.traces.len());
        self.traces.push(trace);
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
        let inputs: Vec<(usize, TraceBox)> = inputargs
            .iter()
            .map(|&(slot, ref b)| (slot as usize, b.clone()))
            .collect();
        let trace = self.lower(&inputs, &operations, Some(target.0))?;
        let bridge_index = self.traces.len();
        self.traces.push(trace);

        // splice the long-form jump into the guard's stub tail
        let &ordinal = self
            .guard_by_descr
            .get(&guard.address())
            .expect("bridge for unknown guard");
        #[cfg(unix)]
        {
            let site = &self.guards[ordinal];
            let bridge = &self.traces[bridge_index];
            let bridge_entry = unsafe { bridge.map.entry(bridge.head_offset) } as u64;
            let mut patch = Vec::with_capacity(STUB_TAIL_LEN);
            patch.extend_from_slice(&[0x49, 0xbb]); // movabs r11, imm64
            patch.extend_from_slice(&bridge_entry.to_le_bytes());
            patch.extend_from_slice(&[0x41, 0xff, 0xe3]); // jmp r11
            self.traces[site.trace]
                .map
                .patch_bytes(site.tail_offset, &patch)?;
        }
        #[cfg(not(unix))]
        let _ = ordinal;
        self.bridged.insert(guard.address(), bridge_index);
        Ok(())
    }

    fn has_bridge(&self, guard: &DescrRef) -> bool {
        self.bridged.contains_key(&guard.address())
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    fn execute(
        &mut self,
        _program: &Rc<Program>,
        token: TraceToken,
        args: &[RawValue],
    ) -> NativeExit {
        let trace = &self.traces[token.0];
        assert_eq!(args.len(), trace.inputargs_len, "argument shape mismatch");
        let mut buffer = vec![0i64; self.buffer_slots.max(args.len())];
        for (slot, value) in args.iter().enumerate() {
            buffer[slot] = value.as_int();
        }
        let entry = unsafe { trace.map.entry(0) };
        let entry_fn: extern "C" fn(*mut i64) -> i64 = unsafe { std::mem::transmute(entry) };
        let ordinal = entry_fn(buffer.as_mut_ptr()) as usize;

        let site = &self.guards[ordinal];
        let values = buffer[..site.failargs_len]
            .iter()
            .map(|&v| RawValue::Int(v))
            .collect();
        NativeExit::GuardFailed {
            descr: site.descr.clone(),
            values,
            exception: None,
        }
    }

    #[cfg(not(all(unix, target_arch = "x86_64")))]
    fn execute(
        &mut self,
        _program: &Rc<Program>,
        _token: TraceToken,
        _args: &[RawValue],
    ) -> NativeExit {
        unimplemented!("x86 trace execution needs an x86-64 unix host")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jitcode::ProgramBuilder;
    use crate::meta::frame::FramePool;
    use crate::resume::{capture_resumedata, ResumeGuardDescr};

    fn guard_with_failargs(opnum: OpNum, live: &[TraceBox]) -> DescrRef {
        use crate::jitcode::JitCodeBuilder;
        let mut b = JitCodeBuilder::new("t", None);
        for _ in live {
            b.new_reg_i();
        }
        b.void_return();
        let code = Rc::new(b.finish());
        let mut pool = FramePool::new();
        let mut frame = pool.alloc(code, 0);
        for (i, b) in live.iter().enumerate() {
            frame.set_reg(Kind::Int, i as u8, Operand::Box(b.clone()));
        }
        let descr = Rc::new(ResumeGuardDescr::new(opnum));
        capture_resumedata(&[frame], None, &[], &descr);
        DescrRef::ResumeGuard(descr)
    }

    /// The counting-loop trace: guard(i < 100); total += i; i += 1; jump
    fn counting_loop_ops(i: &TraceBox, total: &TraceBox) -> Vec<Operation> {
        let cond = TraceBox::new_int(1);
        let total2 = TraceBox::new_int(0);
        let i2 = TraceBox::new_int(0);
        let descr = guard_with_failargs(OpNum::GuardTrue, &[i.clone(), total.clone()]);
        vec![
            Operation::new(
                OpNum::IntLt,
                vec![Operand::Box(i.clone()), Operand::Const(ConstVal::Int(100))],
                Some(cond.clone()),
                None,
            ),
            Operation::new(OpNum::GuardTrue, vec![Operand::Box(cond)], None, Some(descr)),
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
        ]
    }

    #[test]
    fn test_compile_counting_loop() {
        let program = ProgramBuilder::new().finish();
        let mut backend = X86Backend::new();
        let i = TraceBox::new_int(0);
        let total = TraceBox::new_int(0);
        let ops = counting_loop_ops(&i, &total);
        let token = backend
            .compile_loop(&program, &[i, total], ops)
            .expect("integer loop must compile");

        let code = backend.trace_code(token);
        // entry loads the first input: mov rax, [rdi]
        assert_eq!(&code[..3], &[0x48, 0x8b, 0x07]);
        // one guard site for the fused compare
        assert_eq!(backend.guards.len(), 1);
        assert_eq!(backend.guards[0].failargs_len, 2);
    }

    #[test]
    fn test_fused_compare_emits_no_setcc() {
        let program = ProgramBuilder::new().finish();
        let mut backend = X86Backend::new();
        let i = TraceBox::new_int(0);
        let total = TraceBox::new_int(0);
        let ops = counting_loop_ops(&i, &total);
        let token = backend.compile_loop(&program, &[i, total], ops).unwrap();
        let code = backend.trace_code(token);
        // setcc would be 0f 9x; the fused compare branches directly
        assert!(!code
            .windows(2)
            .any(|w| w[0] == 0x0f && (w[1] & 0xf0) == 0x90));
    }

    #[test]
    fn test_ref_trace_rejected() {
        let program = ProgramBuilder::new().finish();
        let mut backend = X86Backend::new();
        let obj = TraceBox::new_ref(crate::heap::GcRef::null());
        let err = backend.compile_loop(&program, &[obj], vec![]);
        assert!(matches!(err, Err(CompileError::UnsupportedOp(_))));
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    #[test]
    fn test_execute_counting_loop() {
        let program = ProgramBuilder::new().finish();
        let mut backend = X86Backend::new();
        let i = TraceBox::new_int(0);
        let total = TraceBox::new_int(0);
        let ops = counting_loop_ops(&i, &total);
        let token = backend.compile_loop(&program, &[i, total], ops).unwrap();

        let exit = backend.execute(&program, token, &[RawValue::Int(0), RawValue::Int(0)]);
        let NativeExit::GuardFailed { values, .. } = exit;
        assert_eq!(values[0], RawValue::Int(100));
        assert_eq!(values[1], RawValue::Int(4950));
    }

    #[cfg(all(unix, target_arch = "x86_64"))]
    #[test]
    fn test_overflow_guard_in_native_code() {
        let program = ProgramBuilder::new().finish();
        let mut backend = X86Backend::new();
        // loop: a = a + a (ovf-checked); jump
        let a = TraceBox::new_int(1);
        let a2 = TraceBox::new_int(2);
        let descr = guard_with_failargs(OpNum::GuardNoOverflow, &[a.clone()]);
        let ops = vec![
            Operation::new(
                OpNum::IntAddOvf,
                vec![Operand::Box(a.clone()), Operand::Box(a.clone())],
                Some(a2.clone()),
                None,
            ),
            Operation::new(OpNum::GuardNoOverflow, vec![], None, Some(descr.clone())),
            Operation::new(OpNum::Jump, vec![Operand::Box(a2)], None, None),
        ];
        let token = backend.compile_loop(&program, &[a], ops).unwrap();

        let exit = backend.execute(&program, token, &[RawValue::Int(1)]);
        let NativeExit::GuardFailed { descr: failed, values, .. } = exit;
        assert_eq!(failed, descr);
        // doubling 1 overflows once the value reaches 2^62; the guarded
        // value is the pre-overflow operand
        assert_eq!(values[0], RawValue::Int(1i64 << 62));
    }
}
