//! Instruction encoding steps
//!
//! Every x86 instruction is described as a sequence of composable steps:
//! literal bytes, a register number or'd into a 3-bit slot of the next
//! byte, immediates of various widths, pc-relative displacements, and the
//! mod/rm memory forms. A single `emit` routine interprets a step table
//! against an operand list; in 64-bit mode a REX pass over the operands
//! runs first and the REX prefix is written at its step position.
//!
//! The mod/rm forms carry the architecture's irregularities:
//! - `[rsp+disp]` always takes a SIB byte with index = rsp (no index)
//! - `[rbp]` cannot be encoded without displacement; a zero byte is forced
//! - in 64-bit mode, r12 and r13 hit the same two cases after their
//!   register numbers are truncated to 3 bits

use crate::buffer::CodeBuffer;
use crate::reg::{fits_in_32bits, single_byte};

pub const REX_W: u8 = 8;
pub const REX_R: u8 = 4;
pub const REX_X: u8 = 2;
pub const REX_B: u8 = 1;

const MOD_RM_ESP: u8 = 4;
const MOD_RM_EBP: u8 = 5;
/// SIB byte meaning "no index" (index = esp)
const SIB_NO_INDEX: u8 = (MOD_RM_ESP << 3) | MOD_RM_ESP;

/// Operating mode of the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Protected32,
    Long64,
}

impl Mode {
    /// Machine word size in bytes
    pub fn word(self) -> u8 {
        match self {
            Mode::Protected32 => 4,
            Mode::Long64 => 8,
        }
    }

    fn is_long(self) -> bool {
        self == Mode::Long64
    }
}

/// Which 3-bit mod/rm slot a register number lands in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Factor {
    /// The low bits of the mod/rm byte (multiply by 1)
    Rm,
    /// The middle "reg" field (multiply by 8)
    Reg,
}

impl Factor {
    fn value(self) -> u8 {
        match self {
            Factor::Rm => 1,
            Factor::Reg => 8,
        }
    }
}

/// Immediate width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    B,
    H,
    I,
    /// 64-bit; permitted only in `Mode::Long64`
    Q,
}

/// Operand values consumed by encoding steps. GP and SSE registers both
/// pass their plain number.
#[derive(Debug, Clone, Copy)]
pub enum Operand {
    Reg(u8),
    Imm(i64),
    /// Absolute position in the same buffer, for pc-relative fields
    Target(usize),
    /// `[base + disp]`; base must not be rsp or rbp (use the dedicated forms)
    BaseDisp(u8, i32),
    /// `[base + index<<scale + disp]`
    Scaled {
        base: u8,
        index: u8,
        scale: u8,
        disp: i32,
    },
    /// `[rbp + disp]`
    BpDisp(i32),
    /// `[rsp + disp]`
    SpDisp(i32),
}

impl Operand {
    fn reg(self) -> u8 {
        match self {
            Operand::Reg(r) => r,
            other => panic!("expected register operand, got {other:?}"),
        }
    }

    fn imm(self) -> i64 {
        match self {
            Operand::Imm(v) => v,
            other => panic!("expected immediate operand, got {other:?}"),
        }
    }
}

/// One step of an instruction encoding. Steps that reference an operand
/// carry its index into the argument list.
#[derive(Debug, Clone, Copy)]
pub enum Enc {
    /// Literal byte (merged with any pending orbyte)
    Byte(u8),
    /// Constant merged into the next written byte
    Or(u8),
    /// Register number encoded into a 3-bit slot of the next byte
    Reg(u8, Factor),
    /// Immediate of the given width
    Imm(u8, Width),
    /// 32-bit displacement relative to the end of the field
    Rel32(u8),
    /// mod/rm for `[rbp + disp]`
    StackBp(u8),
    /// mod/rm for `[rbp + disp]`, always the 32-bit displacement form
    StackBp32(u8),
    /// mod/rm for `[rsp + disp]`
    StackSp(u8),
    /// mod/rm for `[base + disp]`
    MemBase(u8),
    /// mod/rm for `[base + index<<scale + disp]`
    MemScaled(u8),
    /// REX prefix with the W bit; always written in 64-bit mode
    RexW,
    /// REX prefix without W; written only when an extension bit is needed
    RexNoW,
}

impl Enc {
    /// REX extension bits contributed by this step's operand (64-bit mode).
    fn rex_bits(self, args: &[Operand]) -> u8 {
        match self {
            Enc::Reg(arg, factor) => {
                if args[arg as usize].reg() >= 8 {
                    match factor {
                        Factor::Rm => REX_B,
                        Factor::Reg => REX_R,
                    }
                } else {
                    0
                }
            }
            Enc::MemBase(arg) => match args[arg as usize] {
                Operand::BaseDisp(base, _) if base >= 8 => REX_B,
                _ => 0,
            },
            Enc::MemScaled(arg) => match args[arg as usize] {
                Operand::Scaled { base, index, .. } => {
                    let mut rex = 0;
                    if base >= 8 {
                        rex |= REX_B;
                    }
                    if index >= 8 {
                        rex |= REX_X;
                    }
                    rex
                }
                _ => 0,
            },
            _ => 0,
        }
    }
}

fn reg3(mode: Mode, reg: u8) -> u8 {
    match mode {
        Mode::Protected32 => {
            assert!(reg < 8, "register {reg} needs 64-bit mode");
            reg
        }
        Mode::Long64 => {
            assert!(reg < 16, "bad register number {reg}");
            reg & 7
        }
    }
}

/// mod/rm + optional SIB + displacement, shared by the memory forms.
/// `forced_sib` is `Some` when a SIB byte must follow even with no index.
fn emit_mod_rm(
    buf: &mut CodeBuffer,
    orbyte: u8,
    rm: u8,
    forced_sib: Option<u8>,
    disp: i32,
    allow_no_disp: bool,
) {
    let disp = disp as i64;
    assert!(fits_in_32bits(disp));
    if disp == 0 && allow_no_disp {
        buf.write_byte(0x00 | orbyte | rm);
        if let Some(sib) = forced_sib {
            buf.write_byte(sib);
        }
    } else if single_byte(disp) {
        buf.write_byte(0x40 | orbyte | rm);
        if let Some(sib) = forced_sib {
            buf.write_byte(sib);
        }
        buf.write_imm8(disp);
    } else {
        buf.write_byte(0x80 | orbyte | rm);
        if let Some(sib) = forced_sib {
            buf.write_byte(sib);
        }
        buf.write_imm32(disp);
    }
}

/// Interpret a step table against an operand list, appending the encoded
/// instruction to the buffer. Always advances the buffer by a
/// deterministic, operand-dependent number of bytes; never touches
/// unrelated buffer state.
pub fn emit(buf: &mut CodeBuffer, mode: Mode, steps: &[Enc], args: &[Operand]) {
    // REX pass: collect extension bits from the operands first
    let mut rex = 0u8;
    if mode.is_long() {
        for step in steps {
            rex |= step.rex_bits(args);
        }
    }

    let mut orbyte = 0u8;
    for step in steps {
        match *step {
            Enc::Byte(byte) => {
                buf.write_byte(byte | orbyte);
                orbyte = 0;
            }
            Enc::Or(constant) => {
                orbyte |= constant;
            }
            Enc::Reg(arg, factor) => {
                orbyte |= reg3(mode, args[arg as usize].reg()) * factor.value();
            }
            Enc::Imm(arg, width) => {
                debug_assert_eq!(orbyte, 0);
                let imm = args[arg as usize].imm();
                match width {
                    Width::B => buf.write_imm8(imm),
                    Width::H => buf.write_imm16(imm),
                    Width::I => buf.write_imm32(imm),
                    Width::Q => {
                        assert!(mode.is_long(), "64-bit immediate outside 64-bit mode");
                        buf.write_imm64(imm);
                    }
                }
            }
            Enc::Rel32(arg) => {
                debug_assert_eq!(orbyte, 0);
                let target = match args[arg as usize] {
                    Operand::Target(t) => t as i64,
                    other => panic!("expected target operand, got {other:?}"),
                };
                let rel = target - (buf.current_offset() as i64 + 4);
                buf.write_imm32(rel);
            }
            Enc::StackBp(arg) | Enc::StackBp32(arg) => {
                let disp = match args[arg as usize] {
                    Operand::BpDisp(d) => d,
                    other => panic!("expected [rbp+disp] operand, got {other:?}"),
                };
                let force_32bits = matches!(*step, Enc::StackBp32(_));
                if !force_32bits && single_byte(disp as i64) {
                    buf.write_byte(0x40 | orbyte | MOD_RM_EBP);
                    buf.write_imm8(disp as i64);
                } else {
                    buf.write_byte(0x80 | orbyte | MOD_RM_EBP);
                    buf.write_imm32(disp as i64);
                }
                orbyte = 0;
            }
            Enc::StackSp(arg) => {
                let disp = match args[arg as usize] {
                    Operand::SpDisp(d) => d,
                    other => panic!("expected [rsp+disp] operand, got {other:?}"),
                };
                emit_mod_rm(buf, orbyte, MOD_RM_ESP, Some(SIB_NO_INDEX), disp, true);
                orbyte = 0;
            }
            Enc::MemBase(arg) => {
                let (base, disp) = match args[arg as usize] {
                    Operand::BaseDisp(base, disp) => (base, disp),
                    other => panic!("expected [base+disp] operand, got {other:?}"),
                };
                assert!(
                    base != MOD_RM_ESP && base != MOD_RM_EBP,
                    "use the rsp/rbp addressing forms"
                );
                let rm = reg3(mode, base);
                let mut forced_sib = None;
                let mut allow_no_disp = true;
                // r12 and r13 look like rsp and rbp once truncated
                if mode.is_long() {
                    if rm == MOD_RM_ESP {
                        forced_sib = Some(SIB_NO_INDEX);
                    } else if rm == MOD_RM_EBP {
                        allow_no_disp = false;
                    }
                }
                emit_mod_rm(buf, orbyte, rm, forced_sib, disp, allow_no_disp);
                orbyte = 0;
            }
            Enc::MemScaled(arg) => {
                let (base, index, scale, disp) = match args[arg as usize] {
                    Operand::Scaled {
                        base,
                        index,
                        scale,
                        disp,
                    } => (base, index, scale, disp),
                    other => panic!("expected scaled memory operand, got {other:?}"),
                };
                assert!(base != MOD_RM_EBP && index != MOD_RM_ESP);
                assert!(scale < 4, "bad scale shift {scale}");
                let base3 = reg3(mode, base);
                let index3 = reg3(mode, index);
                let sib = (scale << 6) | (index3 << 3) | base3;
                // r13 as base looks like rbp once truncated
                let allow_no_disp = !(mode.is_long() && base3 == MOD_RM_EBP);
                emit_mod_rm(buf, orbyte, MOD_RM_ESP, Some(sib), disp, allow_no_disp);
                orbyte = 0;
            }
            Enc::RexW => {
                if mode.is_long() {
                    buf.write_byte(0x40 | REX_W | rex);
                } else {
                    assert_eq!(rex, 0);
                }
            }
            Enc::RexNoW => {
                if mode.is_long() {
                    if rex != 0 {
                        buf.write_byte(0x40 | rex);
                    }
                } else {
                    assert_eq!(rex, 0);
                }
            }
        }
    }
    debug_assert_eq!(orbyte, 0, "orbyte left unconsumed by the step table");
}
