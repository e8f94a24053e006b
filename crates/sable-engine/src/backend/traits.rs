//! The back-end trait the driver compiles against

use std::rc::Rc;

use crate::error::{CompileError, GuestException};
use crate::heap::RawValue;
use crate::ir::boxes::TraceBox;
use crate::ir::descr::DescrRef;
use crate::ir::ops::Operation;
use crate::jitcode::Program;

/// Handle to one compiled trace, valid for the back-end that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceToken(pub usize);

/// How a run of compiled code came back to the driver. Guard failure is
/// the only exit: loops run until an assumption breaks.
pub enum NativeExit {
    GuardFailed {
        /// The failing guard's resume descr
        descr: DescrRef,
        /// Concrete values, one per failargs slot
        values: Vec<RawValue>,
        /// The in-flight guest exception, for exception guards
        exception: Option<GuestException>,
    },
}

/// A code-generation back-end for optimized traces.
///
/// `compile_loop` installs a trace whose final `jump` targets its own
/// label; `compile_bridge` compiles a trace starting at a failed guard
/// and patches the guard site so later failures enter the bridge
/// directly.
pub trait TraceBackend {
    fn name(&self) -> &'static str;

    fn compile_loop(
        &mut self,
        program: &Rc<Program>,
        inputargs: &[TraceBox],
        operations: Vec<Operation>,
    ) -> Result<TraceToken, CompileError>;

    /// `inputargs` pairs each failargs slot with the box the bridge
    /// trace uses for it; the bridge's final `jump` targets `target`.
    fn compile_bridge(
        &mut self,
        program: &Rc<Program>,
        guard: &DescrRef,
        inputargs: &[(u32, TraceBox)],
        operations: Vec<Operation>,
        target: TraceToken,
    ) -> Result<(), CompileError>;

    fn has_bridge(&self, guard: &DescrRef) -> bool;

    /// Run a compiled loop with the given input values until a guard
    /// fails.
    fn execute(&mut self, program: &Rc<Program>, token: TraceToken, args: &[RawValue])
        -> NativeExit;
}
