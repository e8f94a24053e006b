//! Native code emission for the Sable JIT
//!
//! This crate is the lowest layer of the JIT: it turns instruction
//! selections into raw machine bytes. It includes:
//! - A growable little-endian code buffer with labels and 32-bit patching
//! - An x86 instruction encoder built from composable encoding steps
//!   (mod/rm, SIB, REX prefixes, immediates, pc-relative displacements)
//! - A linear-scan register allocator over abstract live intervals
//! - Executable memory mapping for finished code (unix)
//!
//! Nothing here knows about traces or boxes; higher layers select
//! instructions and registers, this crate encodes them.

pub mod buffer;
pub mod encoding;
pub mod error;
pub mod reg;
pub mod regalloc;
pub mod x86_64;

#[cfg(unix)]
pub mod memmap;

pub use buffer::{CodeBuffer, FinishedCode, Label};
pub use encoding::{Enc, Factor, Mode, Operand, Width};
pub use error::EmitError;
pub use reg::{fits_in_32bits, single_byte, Gpr, Xmm};
pub use x86_64::{Assembler, Cond};
