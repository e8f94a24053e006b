//! Sable engine: a meta-tracing JIT
//!
//! The engine watches a guest interpreter execute jitcode and, when a
//! loop gets hot, re-executes it in tracing mode: the meta-interpreter
//! records a linear operation trace with guards, each guard carrying
//! resume data to rebuild the interpreter frames on failure. Traces are
//! optimized, compiled by a pluggable back-end, and installed per loop;
//! repeatedly failing guards grow bridges.
//!
//! Layering, bottom up:
//! - `ir`: boxes, operations, descrs, the recorded history
//! - `opt`: optimizer passes over recorded traces
//! - `resume`: guard snapshots and frame reconstruction
//! - `jitcode` / `heap`: the guest program model
//! - `meta`: the tracing interpreter
//! - `runner`: the plain interpreter (cold path and blackhole target)
//! - `backend`: trace compilation (portable evaluator, x86)
//! - `driver`: trace lifecycle, hotness, loop tokens, bridges

pub mod backend;
pub mod driver;
pub mod error;
pub mod heap;
pub mod ir;
pub mod jitcode;
pub mod meta;
pub mod opt;
pub mod resume;
pub mod runner;

pub use backend::{NativeExit, PortableBackend, TraceBackend, TraceToken, X86Backend};
pub use driver::{CanEnterOutcome, JitDriver, JitParams, JitStats, LoopToken, RedRegs};
pub use error::{CompileError, GuestException};
pub use heap::{ClassId, GcRef, Kind, RawValue};
pub use ir::{ConstVal, OpNum, Operand, TraceBox};
pub use jitcode::{JcOp, JitCode, JitCodeBuilder, Program, ProgramBuilder};
pub use runner::{run_function, PlainFrame};
