//! The JIT driver: trace lifecycle from hot loop to installed code
//!
//! The guest interpreter reports every backward branch through
//! `can_enter_jit`. The driver either dispatches to installed native
//! code for the loop's greens, or counts hotness and eventually traces:
//! the meta-interpreter executes the loop once more, recording, until the
//! same merge point comes around. The trace is then optimized, handed to
//! the back-end, and installed as the loop token for those greens.
//!
//! Guard failures decode their resume data, rebuild the interpreter
//! frames, and count against the guard; past `bridge_threshold` a bridge
//! is traced from the failure point and patched into the guard site.
//! Tracing that goes wrong (too long, an operation the driver refuses
//! to follow, a forced virtualizable) abandons the trace and continues
//! in the interpreter (blackhole).
//!
//! All loop tokens live in a driver-owned table keyed by greens; tokens
//! name each other by key, never by owning pointer.

use std::rc::Rc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::backend::{NativeExit, PortableBackend, TraceBackend, TraceToken};
use crate::error::GuestException;
use crate::heap::{GcRef, Kind, RawValue};
use crate::ir::boxes::{ConstVal, Operand, TraceBox};
use crate::ir::descr::{DescrRef, FieldDescr};
use crate::ir::display::format_trace;
use crate::ir::ops::OpNum;
use crate::jitcode::Program;
use crate::meta::frame::{FramePool, MIFrame};
use crate::meta::{AbortReason, MetaInterp, RunResult};
use crate::opt::{Optimizer, TraceParts};
use crate::resume::{rebuild_from_resumedata, RebuiltState};
use crate::runner::PlainFrame;

/// Tunable parameters, adjusted through `set_param`.
pub struct JitParams {
    /// Hotness before a loop is traced
    pub threshold: u32,
    /// Maximum operations per trace before blackholing
    pub trace_limit: usize,
    /// Follow guest-level calls while tracing
    pub inlining: bool,
    /// Comma-separated optimizer pass names
    pub enable_opts: String,
    /// Guard failures before a bridge is attempted
    pub bridge_threshold: u32,
}

impl Default for JitParams {
    fn default() -> Self {
        JitParams {
            threshold: 1000,
            trace_limit: 6000,
            inlining: true,
            enable_opts: "fold,cse,guards,fuse".to_string(),
            bridge_threshold: 200,
        }
    }
}

/// Counters the driver keeps while running.
#[derive(Debug, Default)]
pub struct JitStats {
    pub traces_started: u32,
    pub loops_compiled: u32,
    pub bridges_compiled: u32,
    pub native_entries: u32,
    pub guard_failures: u32,
    pub aborts_trace_too_long: u32,
    pub aborts_unsupported: u32,
    pub aborts_nested: u32,
    pub aborts_forced: u32,
    pub compile_failures: u32,
}

/// Handle to one compiled loop: entry token, argument shape, and the
/// greens it belongs to.
#[derive(Clone)]
pub struct LoopToken {
    pub greens: Vec<ConstVal>,
    pub specnodes: Vec<Kind>,
    pub entry: TraceToken,
}

#[derive(Default)]
struct WarmState {
    counter: u32,
    aborts: u32,
    dont_trace: bool,
}

/// Red argument registers at a `can_enter_jit` site, per kind.
pub struct RedRegs {
    pub i: Vec<u8>,
    pub r: Vec<u8>,
    pub f: Vec<u8>,
}

/// What the driver did with a `can_enter_jit`.
pub enum CanEnterOutcome {
    /// Keep interpreting; the frame stack may have been replaced and an
    /// exception may now be pending
    Continue { pending_exception: Option<GcRef> },
    /// The portal frame completed while the JIT was driving it
    Returned(Option<RawValue>),
    /// A guest exception escaped the portal frame
    Raised(GuestException),
}

enum BridgeOutcome {
    Entered(TraceToken, Vec<RawValue>),
    Blackhole(Vec<PlainFrame>, Option<GcRef>),
    Returned(Option<RawValue>),
    Raised(GuestException),
}

pub struct JitDriver<B: TraceBackend = PortableBackend> {
    params: JitParams,
    backend: B,
    warm: FxHashMap<Vec<ConstVal>, WarmState>,
    tokens: RwLock<FxHashMap<Vec<ConstVal>, LoopToken>>,
    pub stats: JitStats,
    vable_fields: Option<Vec<Rc<FieldDescr>>>,
    frame_pool: FramePool,
}

impl JitDriver<PortableBackend> {
    pub fn new() -> JitDriver<PortableBackend> {
        JitDriver::with_backend(PortableBackend::new())
    }
}

impl Default for JitDriver<PortableBackend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: TraceBackend> JitDriver<B> {
    pub fn with_backend(backend: B) -> JitDriver<B> {
        JitDriver {
            params: JitParams::default(),
            backend,
            warm: FxHashMap::default(),
            tokens: RwLock::new(FxHashMap::default()),
            stats: JitStats::default(),
            vable_fields: None,
            frame_pool: FramePool::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn params(&self) -> &JitParams {
        &self.params
    }

    /// Tune a driver parameter. Unknown names and unparsable values are
    /// an API misuse and abort.
    pub fn set_param(&mut self, name: &str, value: &str) {
        match name {
            "threshold" => self.params.threshold = value.parse().expect("bad threshold"),
            "trace_limit" => self.params.trace_limit = value.parse().expect("bad trace_limit"),
            "inlining" => self.params.inlining = value.parse().expect("bad inlining"),
            "enable_opts" => self.params.enable_opts = value.to_string(),
            "bridge_threshold" => {
                self.params.bridge_threshold = value.parse().expect("bad bridge_threshold")
            }
            other => panic!("unknown jit parameter {other:?}"),
        }
    }

    /// Declare the fields of the virtualizable red argument (the first
    /// red ref at the merge point).
    pub fn set_virtualizable(&mut self, fields: Vec<Rc<FieldDescr>>) {
        self.vable_fields = Some(fields);
    }

    /// Whether native code is installed for these greens.
    pub fn has_loop_for(&self, greens: &[ConstVal]) -> bool {
        self.tokens.read().contains_key(greens)
    }

    /// The installed loop token for these greens, if any.
    pub fn loop_token_for(&self, greens: &[ConstVal]) -> Option<LoopToken> {
        self.tokens.read().get(greens).cloned()
    }

    // ===== the can_enter_jit hint =====

    pub fn can_enter_jit(
        &mut self,
        program: &Rc<Program>,
        frames: &mut Vec<PlainFrame>,
        greens_regs: &[u8],
        reds: RedRegs,
    ) -> CanEnterOutcome {
        let top = frames.last().expect("empty frame stack");
        let greens: Vec<ConstVal> = greens_regs
            .iter()
            .map(|&r| ConstVal::Int(top.get(Kind::Int, r).as_int()))
            .collect();

        let existing = self.tokens.read().get(&greens).cloned();
        if let Some(token) = existing {
            let args = self.entry_args(frames.last().expect("empty frame stack"), &reds);
            check_specnodes(&token.specnodes, &args);
            return self.enter_native(program, frames, token.entry, args);
        }

        let state = self.warm.entry(greens.clone()).or_default();
        if state.dont_trace {
            return CanEnterOutcome::Continue {
                pending_exception: None,
            };
        }
        state.counter += 1;
        if state.counter < self.params.threshold {
            return CanEnterOutcome::Continue {
                pending_exception: None,
            };
        }
        state.counter = 0;
        self.trace_loop(program, frames, greens_regs)
    }

    /// Entry values for a compiled loop: the red registers in kind order,
    /// then the current heap values of the virtualizable fields.
    fn entry_args(&self, frame: &PlainFrame, reds: &RedRegs) -> Vec<RawValue> {
        let mut args: Vec<RawValue> = vec![];
        args.extend(reds.i.iter().map(|&r| frame.get(Kind::Int, r)));
        args.extend(reds.r.iter().map(|&r| frame.get(Kind::Ref, r)));
        args.extend(reds.f.iter().map(|&r| frame.get(Kind::Float, r)));
        if let (Some(fields), Some(&r0)) = (&self.vable_fields, reds.r.first()) {
            let obj = frame.get(Kind::Ref, r0).as_ref();
            for field in fields {
                args.push(obj.get_field(field.offset));
            }
        }
        args
    }

    // ===== tracing a new loop =====

    fn trace_loop(
        &mut self,
        program: &Rc<Program>,
        frames: &mut Vec<PlainFrame>,
        greens_regs: &[u8],
    ) -> CanEnterOutcome {
        self.stats.traces_started += 1;
        debug!("start tracing");

        let top = frames.last().expect("empty frame stack");
        let tracing_frame = self.tracing_frame(top, greens_regs);
        let mut meta = MetaInterp::start_loop(
            program.clone(),
            tracing_frame,
            self.params.trace_limit,
            self.params.inlining,
            self.vable_fields.clone(),
        );

        loop {
            match meta.run() {
                RunResult::MergeReached { greens: reached } => {
                    if reached != meta.start_greens {
                        // a different loop's header; keep tracing through it
                        continue;
                    }
                    let jump_args = meta.close_into_jump();
                    let mut parts = TraceParts {
                        inputargs: meta.history.inputargs.clone(),
                        operations: std::mem::take(&mut meta.history.operations),
                    };
                    Optimizer::from_names(&self.params.enable_opts).optimize(program, &mut parts);
                    debug!(
                        "loop trace:\n{}",
                        format_trace(&parts.inputargs, &parts.operations)
                    );

                    match self
                        .backend
                        .compile_loop(program, &parts.inputargs, parts.operations)
                    {
                        Ok(entry) => {
                            let token = LoopToken {
                                greens: reached.clone(),
                                specnodes: parts.inputargs.iter().map(TraceBox::kind).collect(),
                                entry,
                            };
                            let specnodes = token.specnodes.clone();
                            self.tokens.write().insert(reached, token);
                            self.stats.loops_compiled += 1;
                            info!(backend = self.backend.name(), "loop compiled and installed");

                            let args: Vec<RawValue> =
                                jump_args.iter().map(TraceBox::value).collect();
                            check_specnodes(&specnodes, &args);
                            return self.enter_native(program, frames, entry, args);
                        }
                        Err(err) => {
                            self.stats.compile_failures += 1;
                            debug!(%err, "loop compilation failed; blackholing");
                            return self.blackhole(frames, &mut meta);
                        }
                    }
                }
                RunResult::Done(value) => {
                    return CanEnterOutcome::Returned(value.map(|op| op.value()));
                }
                RunResult::Raised(exc) => {
                    return CanEnterOutcome::Raised(GuestException {
                        value: exc.ref_value(),
                    });
                }
                RunResult::Aborted(reason) => {
                    self.note_abort(program, &meta, reason, true);
                    return self.blackhole(frames, &mut meta);
                }
            }
        }
    }

    fn note_abort(
        &mut self,
        program: &Rc<Program>,
        meta: &MetaInterp,
        reason: AbortReason,
        mark_greens: bool,
    ) {
        match reason {
            AbortReason::TraceTooLong => {
                self.stats.aborts_trace_too_long += 1;
                if let Some(index) = meta.find_biggest_function() {
                    debug!(
                        function = %program.jitcode(index).name,
                        "trace too long; biggest function in trace"
                    );
                }
                if mark_greens {
                    if let Some(state) = self.warm.get_mut(&meta.start_greens) {
                        state.dont_trace = true;
                    }
                }
            }
            AbortReason::UnsupportedOp => self.stats.aborts_unsupported += 1,
            AbortReason::NestedCanEnterJit => self.stats.aborts_nested += 1,
            AbortReason::ForcedWhileTracing => self.stats.aborts_forced += 1,
        }
        if mark_greens && reason != AbortReason::TraceTooLong {
            if let Some(state) = self.warm.get_mut(&meta.start_greens) {
                state.aborts += 1;
                if state.aborts >= 3 {
                    state.dont_trace = true;
                }
            }
        }
    }

    /// Abandon a trace: discard the history and continue in the plain
    /// interpreter from the meta-interpreter's frames.
    fn blackhole(
        &mut self,
        frames: &mut Vec<PlainFrame>,
        meta: &mut MetaInterp,
    ) -> CanEnterOutcome {
        debug!("abandoning trace, continuing in the interpreter");
        meta.sync_virtualizable_to_heap();
        let pending = meta.pending_exception().map(|op| op.ref_value());
        let mi_frames = meta.take_frames();
        frames.pop();
        frames.extend(mi_frames.iter().map(PlainFrame::from_tracing));
        for frame in mi_frames {
            self.frame_pool.release(frame);
        }
        CanEnterOutcome::Continue {
            pending_exception: pending,
        }
    }

    /// Convert a concrete frame into a tracing frame: every register
    /// becomes a fresh box, except the green registers, which tracing
    /// must see as constants.
    fn tracing_frame(&mut self, plain: &PlainFrame, greens_regs: &[u8]) -> MIFrame {
        let mut frame = self.frame_pool.alloc(plain.jitcode.clone(), plain.pc);
        for (i, &v) in plain.regs_i.iter().enumerate() {
            let operand = if greens_regs.contains(&(i as u8)) {
                Operand::Const(ConstVal::Int(v))
            } else {
                Operand::Box(TraceBox::new_int(v))
            };
            frame.set_reg(Kind::Int, i as u8, operand);
        }
        for (i, v) in plain.regs_r.iter().enumerate() {
            frame.set_reg(Kind::Ref, i as u8, Operand::Box(TraceBox::new_ref(v.clone())));
        }
        for (i, &v) in plain.regs_f.iter().enumerate() {
            frame.set_reg(Kind::Float, i as u8, Operand::Box(TraceBox::new_float(v)));
        }
        frame.pending_result_reg = plain.pending_result_reg;
        frame
    }

    // ===== native execution and guard failures =====

    fn enter_native(
        &mut self,
        program: &Rc<Program>,
        frames: &mut Vec<PlainFrame>,
        mut token: TraceToken,
        mut args: Vec<RawValue>,
    ) -> CanEnterOutcome {
        loop {
            self.stats.native_entries += 1;
            let NativeExit::GuardFailed {
                descr,
                values,
                exception,
            } = self.backend.execute(program, token, &args);
            self.stats.guard_failures += 1;

            let guard = descr.as_resume_guard();
            let failures = guard.count_failure();
            let overrides = match &descr {
                DescrRef::ResumeGuardForced(forced) => forced.force_overrides(),
                _ => vec![],
            };
            let rebuilt =
                rebuild_from_resumedata(guard, &values, &overrides, &mut self.frame_pool);

            // exception guards and forced guards carry in-flight state a
            // bridge cannot pick up; they always deoptimize
            let bridgeable = !matches!(
                guard.guard_opnum,
                OpNum::GuardNoException | OpNum::GuardException | OpNum::GuardNotForced
            );
            if bridgeable
                && failures >= self.params.bridge_threshold
                && !self.backend.has_bridge(&descr)
            {
                match self.trace_bridge(program, &descr, rebuilt) {
                    BridgeOutcome::Entered(next_token, next_args) => {
                        token = next_token;
                        args = next_args;
                        continue;
                    }
                    BridgeOutcome::Blackhole(plain_frames, pending) => {
                        frames.pop();
                        frames.extend(plain_frames);
                        return CanEnterOutcome::Continue {
                            pending_exception: pending,
                        };
                    }
                    BridgeOutcome::Returned(value) => return CanEnterOutcome::Returned(value),
                    BridgeOutcome::Raised(exc) => return CanEnterOutcome::Raised(exc),
                }
            }

            frames.pop();
            frames.extend(rebuilt.frames.iter().map(PlainFrame::from_tracing));
            for frame in rebuilt.frames {
                self.frame_pool.release(frame);
            }
            return CanEnterOutcome::Continue {
                pending_exception: exception.map(|e| e.value),
            };
        }
    }

    // ===== tracing a bridge =====

    fn trace_bridge(
        &mut self,
        program: &Rc<Program>,
        guard: &DescrRef,
        rebuilt: RebuiltState,
    ) -> BridgeOutcome {
        self.stats.traces_started += 1;
        debug!("start tracing a bridge from a failing guard");

        let inputarg_pairs = rebuilt.slot_boxes.clone();
        let inputargs: Vec<TraceBox> =
            inputarg_pairs.iter().map(|(_, b)| b.clone()).collect();
        let mut meta = MetaInterp::start_bridge(
            program.clone(),
            rebuilt.frames,
            inputargs,
            rebuilt.virtualizable_boxes,
            rebuilt.virtualref_boxes,
            None,
            self.params.trace_limit,
            self.params.inlining,
            self.vable_fields.clone(),
        );

        loop {
            match meta.run() {
                RunResult::MergeReached { greens } => {
                    let target = self.tokens.read().get(&greens).cloned();
                    let Some(target) = target else {
                        // no compiled loop to close into yet; trace on
                        continue;
                    };
                    let jump_args = meta.close_into_jump();
                    let mut parts = TraceParts {
                        inputargs: meta.history.inputargs.clone(),
                        operations: std::mem::take(&mut meta.history.operations),
                    };
                    Optimizer::from_names(&self.params.enable_opts).optimize(program, &mut parts);
                    debug!(
                        "bridge trace:\n{}",
                        format_trace(&parts.inputargs, &parts.operations)
                    );

                    match self.backend.compile_bridge(
                        program,
                        guard,
                        &inputarg_pairs,
                        parts.operations,
                        target.entry,
                    ) {
                        Ok(()) => {
                            self.stats.bridges_compiled += 1;
                            info!(backend = self.backend.name(), "bridge compiled and patched");
                            let args: Vec<RawValue> =
                                jump_args.iter().map(TraceBox::value).collect();
                            check_specnodes(&target.specnodes, &args);
                            return BridgeOutcome::Entered(target.entry, args);
                        }
                        Err(err) => {
                            // the guard is left as-is and keeps falling
                            // back to the interpreter
                            self.stats.compile_failures += 1;
                            debug!(%err, "bridge compilation failed");
                            return self.bridge_blackhole(&mut meta);
                        }
                    }
                }
                RunResult::Done(value) => {
                    return BridgeOutcome::Returned(value.map(|op| op.value()));
                }
                RunResult::Raised(exc) => {
                    return BridgeOutcome::Raised(GuestException {
                        value: exc.ref_value(),
                    });
                }
                RunResult::Aborted(reason) => {
                    self.note_abort(program, &meta, reason, false);
                    return self.bridge_blackhole(&mut meta);
                }
            }
        }
    }

    fn bridge_blackhole(&mut self, meta: &mut MetaInterp) -> BridgeOutcome {
        meta.sync_virtualizable_to_heap();
        let pending = meta.pending_exception().map(|op| op.ref_value());
        let mi_frames = meta.take_frames();
        let plain = mi_frames.iter().map(PlainFrame::from_tracing).collect();
        for frame in mi_frames {
            self.frame_pool.release(frame);
        }
        BridgeOutcome::Blackhole(plain, pending)
    }
}

/// The argument shape must match the loop token's specnodes; a mismatch
/// is an impossible state.
fn check_specnodes(specnodes: &[Kind], args: &[RawValue]) {
    assert_eq!(specnodes.len(), args.len(), "jump target specnodes mismatch");
    for (kind, value) in specnodes.iter().zip(args) {
        assert_eq!(*kind, value.kind(), "jump target specnodes mismatch");
    }
}
