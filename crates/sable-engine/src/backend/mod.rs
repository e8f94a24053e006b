//! Trace compilation back-ends
//!
//! The driver is generic over `TraceBackend`. Two implementations ship:
//! the portable back-end, which retains the optimized operations and
//! evaluates them directly (the reference semantics, used by the test
//! suite), and the x86 back-end, which emits real machine code through
//! `sable-asm`.

pub mod portable;
pub mod traits;
pub mod x86;

pub use portable::PortableBackend;
pub use traits::{NativeExit, TraceBackend, TraceToken};
pub use x86::X86Backend;
