//! Engine error types
//!
//! Guard failures and blackhole transitions are control flow, not errors;
//! they travel through dedicated enums (`NativeExit`, `TraceOutcome`).
//! These types cover the conditions that are genuinely reported upward.

use crate::heap::GcRef;

/// Error while turning a recorded trace into installed code.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    #[error("operation not supported by this back-end: {0}")]
    UnsupportedOp(&'static str),
    #[error("argument shape mismatch against loop token")]
    SpecMismatch,
    #[error("native code emission failed: {0}")]
    Emit(#[from] sable_asm::EmitError),
}

/// A guest-language exception in flight: a heap object carrying its class.
#[derive(Debug, Clone)]
pub struct GuestException {
    pub value: GcRef,
}

/// Error raised by concrete execution of a single operation.
#[derive(Debug)]
pub enum ExecError {
    /// Signed overflow in an `_ovf` arithmetic operation
    Overflow,
    /// Integer division or modulo by zero
    DivByZero,
    /// A residual call raised a guest exception
    Raise(GuestException),
}
