//! x86 instruction table
//!
//! One method per instruction/operand-form pair, each a thin wrapper
//! around a step table handed to `encoding::emit`. Method suffixes follow
//! the operand kinds: `r` register, `i` immediate, `b` `[rbp+disp]`,
//! `s` `[rsp+disp]`, `m` `[base+disp]`, `a` `[base+index<<scale+disp]`,
//! `x` SSE register.
//!
//! The 64-bit mode applies two peepholes from the original encoder: a
//! `MOV r, imm` whose immediate fits in 32 bits uses the sign-extending
//! `C7` form instead of the 10-byte `B8+r` form, and a `CALL` whose
//! displacement overflows 32 bits falls back to loading the target into a
//! scratch register and calling through it.

use crate::buffer::{CodeBuffer, Label};
use crate::encoding::{emit, Enc, Factor, Mode, Operand, Width};
use crate::reg::{fits_in_32bits, single_byte, Gpr, Xmm};

/// x86 condition codes, as encoded in `Jcc`/`SETcc` opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    O = 0,
    No = 1,
    B = 2,
    Ae = 3,
    E = 4,
    Ne = 5,
    Be = 6,
    A = 7,
    S = 8,
    Ns = 9,
    P = 10,
    Np = 11,
    L = 12,
    Ge = 13,
    Le = 14,
    G = 15,
}

impl Cond {
    /// The opposite condition (flips the low bit of the encoding)
    pub fn negate(self) -> Cond {
        let bits = (self as u8) ^ 1;
        // Safety-free re-mapping through match keeps this total
        match bits {
            0 => Cond::O,
            1 => Cond::No,
            2 => Cond::B,
            3 => Cond::Ae,
            4 => Cond::E,
            5 => Cond::Ne,
            6 => Cond::Be,
            7 => Cond::A,
            8 => Cond::S,
            9 => Cond::Ns,
            10 => Cond::P,
            11 => Cond::Np,
            12 => Cond::L,
            13 => Cond::Ge,
            14 => Cond::Le,
            _ => Cond::G,
        }
    }
}

/// Instruction-level assembler over a `CodeBuffer`.
pub struct Assembler {
    buf: CodeBuffer,
    mode: Mode,
}

/// Generates the `ri`/`rr`/`rb` forms shared by the arithmetic group
/// (ADD=0, OR=1, AND=4, SUB=5, XOR=6, CMP=7). The immediate form picks
/// the sign-extended 8-bit encoding when the value fits.
macro_rules! arith_modes {
    ($group:expr, $ri:ident, $rr:ident, $rb:ident) => {
        pub fn $ri(&mut self, reg: Gpr, imm: i32) {
            let modrm = 0xc0 | ($group << 3);
            if single_byte(imm as i64) {
                self.emit(
                    &[
                        Enc::RexW,
                        Enc::Byte(0x83),
                        Enc::Reg(0, Factor::Rm),
                        Enc::Byte(modrm),
                        Enc::Imm(1, Width::B),
                    ],
                    &[Operand::Reg(reg.index()), Operand::Imm(imm as i64)],
                );
            } else {
                self.emit(
                    &[
                        Enc::RexW,
                        Enc::Byte(0x81),
                        Enc::Reg(0, Factor::Rm),
                        Enc::Byte(modrm),
                        Enc::Imm(1, Width::I),
                    ],
                    &[Operand::Reg(reg.index()), Operand::Imm(imm as i64)],
                );
            }
        }

        pub fn $rr(&mut self, dst: Gpr, src: Gpr) {
            self.emit(
                &[
                    Enc::RexW,
                    Enc::Byte(($group << 3) + 1),
                    Enc::Reg(1, Factor::Reg),
                    Enc::Reg(0, Factor::Rm),
                    Enc::Byte(0xc0),
                ],
                &[Operand::Reg(dst.index()), Operand::Reg(src.index())],
            );
        }

        pub fn $rb(&mut self, dst: Gpr, disp: i32) {
            self.emit(
                &[
                    Enc::RexW,
                    Enc::Byte(($group << 3) + 3),
                    Enc::Reg(0, Factor::Reg),
                    Enc::StackBp(1),
                ],
                &[Operand::Reg(dst.index()), Operand::BpDisp(disp)],
            );
        }
    };
}

impl Assembler {
    pub fn new(mode: Mode) -> Self {
        Assembler {
            buf: CodeBuffer::new(),
            mode,
        }
    }

    pub fn long64() -> Self {
        Self::new(Mode::Long64)
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn buffer(&self) -> &CodeBuffer {
        &self.buf
    }

    pub fn buffer_mut(&mut self) -> &mut CodeBuffer {
        &mut self.buf
    }

    pub fn into_buffer(self) -> CodeBuffer {
        self.buf
    }

    pub fn current_offset(&self) -> usize {
        self.buf.current_offset()
    }

    pub fn new_label(&mut self) -> Label {
        self.buf.new_label()
    }

    pub fn bind_label(&mut self, label: Label) {
        self.buf.bind_label(label);
    }

    fn emit(&mut self, steps: &[Enc], args: &[Operand]) {
        emit(&mut self.buf, self.mode, steps, args);
    }

    // ===== MOV =====

    /// `MOV reg, imm`, picking the shortest legal encoding for the mode
    pub fn mov_ri(&mut self, dst: Gpr, imm: i64) {
        match self.mode {
            Mode::Protected32 => {
                assert!(fits_in_32bits(imm));
                self.emit(
                    &[Enc::Reg(0, Factor::Rm), Enc::Byte(0xb8), Enc::Imm(1, Width::I)],
                    &[Operand::Reg(dst.index()), Operand::Imm(imm)],
                );
            }
            Mode::Long64 => {
                if fits_in_32bits(imm) {
                    // sign-extending C7 form
                    self.emit(
                        &[
                            Enc::RexW,
                            Enc::Byte(0xc7),
                            Enc::Reg(0, Factor::Rm),
                            Enc::Byte(0xc0),
                            Enc::Imm(1, Width::I),
                        ],
                        &[Operand::Reg(dst.index()), Operand::Imm(imm)],
                    );
                } else {
                    self.mov_ri_wide(dst, imm);
                }
            }
        }
    }

    /// The full-width `B8+r imm64` form
    pub fn mov_ri_wide(&mut self, dst: Gpr, imm: i64) {
        self.emit(
            &[Enc::RexW, Enc::Reg(0, Factor::Rm), Enc::Byte(0xb8), Enc::Imm(1, Width::Q)],
            &[Operand::Reg(dst.index()), Operand::Imm(imm)],
        );
    }

    pub fn mov_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit(
            &[
                Enc::RexW,
                Enc::Byte(0x89),
                Enc::Reg(1, Factor::Reg),
                Enc::Reg(0, Factor::Rm),
                Enc::Byte(0xc0),
            ],
            &[Operand::Reg(dst.index()), Operand::Reg(src.index())],
        );
    }

    /// `MOV [rbp+disp], reg`
    pub fn mov_br(&mut self, disp: i32, src: Gpr) {
        self.emit(
            &[Enc::RexW, Enc::Byte(0x89), Enc::Reg(1, Factor::Reg), Enc::StackBp(0)],
            &[Operand::BpDisp(disp), Operand::Reg(src.index())],
        );
    }

    /// `MOV reg, [rbp+disp]`
    pub fn mov_rb(&mut self, dst: Gpr, disp: i32) {
        self.emit(
            &[Enc::RexW, Enc::Byte(0x8b), Enc::Reg(0, Factor::Reg), Enc::StackBp(1)],
            &[Operand::Reg(dst.index()), Operand::BpDisp(disp)],
        );
    }

    /// `MOV reg, [rsp+disp]`
    pub fn mov_rs(&mut self, dst: Gpr, disp: i32) {
        self.emit(
            &[Enc::RexW, Enc::Byte(0x8b), Enc::Reg(0, Factor::Reg), Enc::StackSp(1)],
            &[Operand::Reg(dst.index()), Operand::SpDisp(disp)],
        );
    }

    /// `MOV [rsp+disp], reg`
    pub fn mov_sr(&mut self, disp: i32, src: Gpr) {
        self.emit(
            &[Enc::RexW, Enc::Byte(0x89), Enc::Reg(1, Factor::Reg), Enc::StackSp(0)],
            &[Operand::SpDisp(disp), Operand::Reg(src.index())],
        );
    }

    /// `MOV reg, [base+disp]`
    pub fn mov_rm(&mut self, dst: Gpr, base: Gpr, disp: i32) {
        self.emit(
            &[Enc::RexW, Enc::Byte(0x8b), Enc::Reg(0, Factor::Reg), Enc::MemBase(1)],
            &[Operand::Reg(dst.index()), Operand::BaseDisp(base.index(), disp)],
        );
    }

    /// `MOV [base+disp], reg`
    pub fn mov_mr(&mut self, base: Gpr, disp: i32, src: Gpr) {
        self.emit(
            &[Enc::RexW, Enc::Byte(0x89), Enc::Reg(1, Factor::Reg), Enc::MemBase(0)],
            &[Operand::BaseDisp(base.index(), disp), Operand::Reg(src.index())],
        );
    }

    /// `MOV qword [base+disp], imm32` (sign-extended)
    pub fn mov_mi(&mut self, base: Gpr, disp: i32, imm: i32) {
        self.emit(
            &[
                Enc::RexW,
                Enc::Byte(0xc7),
                Enc::Or(0),
                Enc::MemBase(0),
                Enc::Imm(1, Width::I),
            ],
            &[Operand::BaseDisp(base.index(), disp), Operand::Imm(imm as i64)],
        );
    }

    /// `MOV reg, [base+index<<scale+disp]`
    pub fn mov_ra(&mut self, dst: Gpr, base: Gpr, index: Gpr, scale: u8, disp: i32) {
        self.emit(
            &[Enc::RexW, Enc::Byte(0x8b), Enc::Reg(0, Factor::Reg), Enc::MemScaled(1)],
            &[
                Operand::Reg(dst.index()),
                Operand::Scaled {
                    base: base.index(),
                    index: index.index(),
                    scale,
                    disp,
                },
            ],
        );
    }

    /// `MOV [base+index<<scale+disp], reg`
    pub fn mov_ar(&mut self, base: Gpr, index: Gpr, scale: u8, disp: i32, src: Gpr) {
        self.emit(
            &[Enc::RexW, Enc::Byte(0x89), Enc::Reg(1, Factor::Reg), Enc::MemScaled(0)],
            &[
                Operand::Scaled {
                    base: base.index(),
                    index: index.index(),
                    scale,
                    disp,
                },
                Operand::Reg(src.index()),
            ],
        );
    }

    // ===== Arithmetic group =====

    arith_modes!(0, add_ri, add_rr, add_rb);
    arith_modes!(1, or_ri, or_rr, or_rb);
    arith_modes!(4, and_ri, and_rr, and_rb);
    arith_modes!(5, sub_ri, sub_rr, sub_rb);
    arith_modes!(6, xor_ri, xor_rr, xor_rb);
    arith_modes!(7, cmp_ri, cmp_rr, cmp_rb);

    pub fn test_rr(&mut self, a: Gpr, b: Gpr) {
        self.emit(
            &[
                Enc::RexW,
                Enc::Byte(0x85),
                Enc::Reg(1, Factor::Reg),
                Enc::Reg(0, Factor::Rm),
                Enc::Byte(0xc0),
            ],
            &[Operand::Reg(a.index()), Operand::Reg(b.index())],
        );
    }

    pub fn imul_rr(&mut self, dst: Gpr, src: Gpr) {
        self.emit(
            &[
                Enc::RexW,
                Enc::Byte(0x0f),
                Enc::Byte(0xaf),
                Enc::Reg(0, Factor::Reg),
                Enc::Reg(1, Factor::Rm),
                Enc::Byte(0xc0),
            ],
            &[Operand::Reg(dst.index()), Operand::Reg(src.index())],
        );
    }

    fn group_f7(&mut self, group: u8, reg: Gpr) {
        self.emit(
            &[
                Enc::RexW,
                Enc::Byte(0xf7),
                Enc::Or(group << 3),
                Enc::Reg(0, Factor::Rm),
                Enc::Byte(0xc0),
            ],
            &[Operand::Reg(reg.index())],
        );
    }

    pub fn not_r(&mut self, reg: Gpr) {
        self.group_f7(2, reg);
    }

    pub fn neg_r(&mut self, reg: Gpr) {
        self.group_f7(3, reg);
    }

    /// `IDIV reg`: divides rdx:rax, quotient in rax, remainder in rdx
    pub fn idiv_r(&mut self, reg: Gpr) {
        self.group_f7(7, reg);
    }

    /// `CQO`: sign-extend rax into rdx:rax
    pub fn cqo(&mut self) {
        self.emit(&[Enc::RexW, Enc::Byte(0x99)], &[]);
    }

    fn shift_ri(&mut self, group: u8, reg: Gpr, count: u8) {
        self.emit(
            &[
                Enc::RexW,
                Enc::Byte(0xc1),
                Enc::Or(group << 3),
                Enc::Reg(0, Factor::Rm),
                Enc::Byte(0xc0),
                Enc::Imm(1, Width::B),
            ],
            &[Operand::Reg(reg.index()), Operand::Imm(count as i64)],
        );
    }

    fn shift_rcl(&mut self, group: u8, reg: Gpr) {
        self.emit(
            &[
                Enc::RexW,
                Enc::Byte(0xd3),
                Enc::Or(group << 3),
                Enc::Reg(0, Factor::Rm),
                Enc::Byte(0xc0),
            ],
            &[Operand::Reg(reg.index())],
        );
    }

    pub fn shl_ri(&mut self, reg: Gpr, count: u8) {
        self.shift_ri(4, reg, count);
    }

    pub fn shr_ri(&mut self, reg: Gpr, count: u8) {
        self.shift_ri(5, reg, count);
    }

    pub fn sar_ri(&mut self, reg: Gpr, count: u8) {
        self.shift_ri(7, reg, count);
    }

    /// Shift count taken from cl
    pub fn shl_rcl(&mut self, reg: Gpr) {
        self.shift_rcl(4, reg);
    }

    pub fn shr_rcl(&mut self, reg: Gpr) {
        self.shift_rcl(5, reg);
    }

    pub fn sar_rcl(&mut self, reg: Gpr) {
        self.shift_rcl(7, reg);
    }

    // ===== Misc =====

    pub fn nop(&mut self) {
        self.emit(&[Enc::Byte(0x90)], &[]);
    }

    pub fn ret(&mut self) {
        self.emit(&[Enc::Byte(0xc3)], &[]);
    }

    pub fn push_r(&mut self, reg: Gpr) {
        self.emit(
            &[Enc::RexNoW, Enc::Reg(0, Factor::Rm), Enc::Byte(0x50)],
            &[Operand::Reg(reg.index())],
        );
    }

    pub fn pop_r(&mut self, reg: Gpr) {
        self.emit(
            &[Enc::RexNoW, Enc::Reg(0, Factor::Rm), Enc::Byte(0x58)],
            &[Operand::Reg(reg.index())],
        );
    }

    pub fn lea_rb(&mut self, dst: Gpr, disp: i32) {
        self.emit(
            &[Enc::RexW, Enc::Byte(0x8d), Enc::Reg(0, Factor::Reg), Enc::StackBp(1)],
            &[Operand::Reg(dst.index()), Operand::BpDisp(disp)],
        );
    }

    /// `LEA` with the displacement held in its 32-bit form for later patching
    pub fn lea32_rb(&mut self, dst: Gpr, disp: i32) {
        self.emit(
            &[Enc::RexW, Enc::Byte(0x8d), Enc::Reg(0, Factor::Reg), Enc::StackBp32(1)],
            &[Operand::Reg(dst.index()), Operand::BpDisp(disp)],
        );
    }

    pub fn xchg_rm(&mut self, reg: Gpr, base: Gpr, disp: i32) {
        self.emit(
            &[Enc::RexW, Enc::Byte(0x87), Enc::Reg(0, Factor::Reg), Enc::MemBase(1)],
            &[Operand::Reg(reg.index()), Operand::BaseDisp(base.index(), disp)],
        );
    }

    // ===== Calls and jumps =====

    /// `CALL rel32` to a position in this buffer
    pub fn call_target(&mut self, target: usize) {
        self.emit(&[Enc::Byte(0xe8), Enc::Rel32(0)], &[Operand::Target(target)]);
    }

    /// `CALL` to an absolute address.
    ///
    /// In 64-bit mode, if the displacement from here overflows 32 bits,
    /// falls back to `MOV scratch, imm64; CALL scratch`.
    pub fn call_addr(&mut self, target: i64, scratch: Gpr) {
        let offset = target - (self.buf.current_offset() as i64 + 5);
        if self.mode == Mode::Protected32 || fits_in_32bits(offset) {
            self.buf.write_byte(0xe8);
            self.buf.write_imm32(offset);
        } else {
            self.mov_ri_wide(scratch, target);
            self.call_r(scratch);
        }
    }

    pub fn call_r(&mut self, reg: Gpr) {
        self.emit(
            &[
                Enc::RexNoW,
                Enc::Byte(0xff),
                Enc::Reg(0, Factor::Rm),
                Enc::Byte(0xc0 | (2 << 3)),
            ],
            &[Operand::Reg(reg.index())],
        );
    }

    /// `JMP reg` (indirect)
    pub fn jmp_r(&mut self, reg: Gpr) {
        self.emit(
            &[
                Enc::RexNoW,
                Enc::Byte(0xff),
                Enc::Reg(0, Factor::Rm),
                Enc::Byte(0xc0 | (4 << 3)),
            ],
            &[Operand::Reg(reg.index())],
        );
    }

    pub fn call_b(&mut self, disp: i32) {
        self.emit(
            &[Enc::Byte(0xff), Enc::Or(2 << 3), Enc::StackBp(0)],
            &[Operand::BpDisp(disp)],
        );
    }

    /// `JMP rel32` to a label; forward references are patched at bind time.
    /// Returns the offset of the rel32 field for later retargeting.
    pub fn jmp(&mut self, label: Label) -> usize {
        self.buf.write_byte(0xe9);
        let field = self.buf.current_offset();
        self.buf.write_rel32_to(label);
        field
    }

    /// `Jcc rel32` to a label. Returns the offset of the rel32 field.
    pub fn jcc(&mut self, cond: Cond, label: Label) -> usize {
        self.buf.write_byte(0x0f);
        self.buf.write_byte(0x80 | cond as u8);
        let field = self.buf.current_offset();
        self.buf.write_rel32_to(label);
        field
    }

    /// `SETcc reg8`. Restricted to rax..rbx and r8..r15: without a REX
    /// prefix the numbers 4..8 name the high-byte registers instead.
    pub fn setcc_r(&mut self, cond: Cond, reg: Gpr) {
        debug_assert!(reg.index() < 4 || reg.is_extended());
        self.emit(
            &[
                Enc::RexNoW,
                Enc::Byte(0x0f),
                Enc::Byte(0x90 | cond as u8),
                Enc::Reg(0, Factor::Rm),
                Enc::Byte(0xc0),
            ],
            &[Operand::Reg(reg.index())],
        );
    }

    /// `MOVZX reg, reg8` (same low-byte restriction as `setcc_r`)
    pub fn movzx8_rr(&mut self, dst: Gpr, src: Gpr) {
        debug_assert!(src.index() < 4 || src.is_extended());
        self.emit(
            &[
                Enc::RexW,
                Enc::Byte(0x0f),
                Enc::Byte(0xb6),
                Enc::Reg(0, Factor::Reg),
                Enc::Reg(1, Factor::Rm),
                Enc::Byte(0xc0),
            ],
            &[Operand::Reg(dst.index()), Operand::Reg(src.index())],
        );
    }

    // ===== SSE2 scalar doubles =====

    fn sse_rr(&mut self, prefix: u8, opcode: u8, dst: u8, src: u8) {
        self.emit(
            &[
                Enc::Byte(prefix),
                Enc::RexNoW,
                Enc::Byte(0x0f),
                Enc::Byte(opcode),
                Enc::Reg(0, Factor::Reg),
                Enc::Reg(1, Factor::Rm),
                Enc::Byte(0xc0),
            ],
            &[Operand::Reg(dst), Operand::Reg(src)],
        );
    }

    pub fn movsd_rr(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xf2, 0x10, dst.index(), src.index());
    }

    pub fn movsd_rb(&mut self, dst: Xmm, disp: i32) {
        self.emit(
            &[
                Enc::Byte(0xf2),
                Enc::RexNoW,
                Enc::Byte(0x0f),
                Enc::Byte(0x10),
                Enc::Reg(0, Factor::Reg),
                Enc::StackBp(1),
            ],
            &[Operand::Reg(dst.index()), Operand::BpDisp(disp)],
        );
    }

    pub fn movsd_br(&mut self, disp: i32, src: Xmm) {
        self.emit(
            &[
                Enc::Byte(0xf2),
                Enc::RexNoW,
                Enc::Byte(0x0f),
                Enc::Byte(0x11),
                Enc::Reg(1, Factor::Reg),
                Enc::StackBp(0),
            ],
            &[Operand::BpDisp(disp), Operand::Reg(src.index())],
        );
    }

    pub fn movsd_rs(&mut self, dst: Xmm, disp: i32) {
        self.emit(
            &[
                Enc::Byte(0xf2),
                Enc::RexNoW,
                Enc::Byte(0x0f),
                Enc::Byte(0x10),
                Enc::Reg(0, Factor::Reg),
                Enc::StackSp(1),
            ],
            &[Operand::Reg(dst.index()), Operand::SpDisp(disp)],
        );
    }

    pub fn movsd_sr(&mut self, disp: i32, src: Xmm) {
        self.emit(
            &[
                Enc::Byte(0xf2),
                Enc::RexNoW,
                Enc::Byte(0x0f),
                Enc::Byte(0x11),
                Enc::Reg(1, Factor::Reg),
                Enc::StackSp(0),
            ],
            &[Operand::SpDisp(disp), Operand::Reg(src.index())],
        );
    }

    pub fn movsd_rm(&mut self, dst: Xmm, base: Gpr, disp: i32) {
        self.emit(
            &[
                Enc::Byte(0xf2),
                Enc::RexNoW,
                Enc::Byte(0x0f),
                Enc::Byte(0x10),
                Enc::Reg(0, Factor::Reg),
                Enc::MemBase(1),
            ],
            &[Operand::Reg(dst.index()), Operand::BaseDisp(base.index(), disp)],
        );
    }

    pub fn movsd_mr(&mut self, base: Gpr, disp: i32, src: Xmm) {
        self.emit(
            &[
                Enc::Byte(0xf2),
                Enc::RexNoW,
                Enc::Byte(0x0f),
                Enc::Byte(0x11),
                Enc::Reg(1, Factor::Reg),
                Enc::MemBase(0),
            ],
            &[Operand::BaseDisp(base.index(), disp), Operand::Reg(src.index())],
        );
    }

    pub fn addsd_rr(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xf2, 0x58, dst.index(), src.index());
    }

    pub fn subsd_rr(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xf2, 0x5c, dst.index(), src.index());
    }

    pub fn mulsd_rr(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xf2, 0x59, dst.index(), src.index());
    }

    pub fn divsd_rr(&mut self, dst: Xmm, src: Xmm) {
        self.sse_rr(0xf2, 0x5e, dst.index(), src.index());
    }

    pub fn ucomisd_rr(&mut self, a: Xmm, b: Xmm) {
        self.sse_rr(0x66, 0x2e, a.index(), b.index());
    }

    /// `CVTSI2SD xmm, reg`
    pub fn cvtsi2sd(&mut self, dst: Xmm, src: Gpr) {
        self.emit(
            &[
                Enc::Byte(0xf2),
                Enc::RexW,
                Enc::Byte(0x0f),
                Enc::Byte(0x2a),
                Enc::Reg(0, Factor::Reg),
                Enc::Reg(1, Factor::Rm),
                Enc::Byte(0xc0),
            ],
            &[Operand::Reg(dst.index()), Operand::Reg(src.index())],
        );
    }

    /// `CVTTSD2SI reg, xmm` (truncating)
    pub fn cvttsd2si(&mut self, dst: Gpr, src: Xmm) {
        self.emit(
            &[
                Enc::Byte(0xf2),
                Enc::RexW,
                Enc::Byte(0x0f),
                Enc::Byte(0x2c),
                Enc::Reg(0, Factor::Reg),
                Enc::Reg(1, Factor::Rm),
                Enc::Byte(0xc0),
            ],
            &[Operand::Reg(dst.index()), Operand::Reg(src.index())],
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::Gpr as R;

    fn asm() -> Assembler {
        Assembler::long64()
    }

    fn bytes(a: Assembler) -> Vec<u8> {
        a.into_buffer().bytes().to_vec()
    }

    #[test]
    fn test_mov_rr() {
        let mut a = asm();
        a.mov_rr(R::RCX, R::RAX);
        assert_eq!(bytes(a), vec![0x48, 0x89, 0xc1]);
    }

    #[test]
    fn test_mov_ri_short_form() {
        let mut a = asm();
        a.mov_ri(R::RAX, 0x1234);
        assert_eq!(bytes(a), vec![0x48, 0xc7, 0xc0, 0x34, 0x12, 0x00, 0x00]);
    }

    #[test]
    fn test_mov_ri_negative_sign_extends() {
        let mut a = asm();
        a.mov_ri(R::RDX, -1);
        assert_eq!(bytes(a), vec![0x48, 0xc7, 0xc2, 0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_mov_ri_wide_form() {
        let mut a = asm();
        a.mov_ri(R::RAX, 0x1_0000_0000);
        assert_eq!(
            bytes(a),
            vec![0x48, 0xb8, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_add_immediate_width_selection() {
        let mut a = asm();
        a.add_ri(R::RAX, 1);
        a.add_ri(R::RAX, 1000);
        assert_eq!(
            bytes(a),
            vec![
                0x48, 0x83, 0xc0, 0x01, // add rax, 1 (8-bit form)
                0x48, 0x81, 0xc0, 0xe8, 0x03, 0x00, 0x00, // add rax, 1000
            ]
        );
    }

    #[test]
    fn test_arith_rr_group_bytes() {
        let mut a = asm();
        a.add_rr(R::RAX, R::RCX);
        a.sub_rr(R::RAX, R::RCX);
        a.cmp_rr(R::RAX, R::RCX);
        assert_eq!(
            bytes(a),
            vec![0x48, 0x01, 0xc8, 0x48, 0x29, 0xc8, 0x48, 0x39, 0xc8]
        );
    }

    #[test]
    fn test_push_pop_extended() {
        let mut a = asm();
        a.push_r(R::RAX);
        a.push_r(R::R8);
        a.pop_r(R::R15);
        assert_eq!(bytes(a), vec![0x50, 0x41, 0x50, 0x41, 0x5f]);
    }

    #[test]
    fn test_mov_memory_forms() {
        let mut a = asm();
        a.mov_rm(R::RAX, R::RBX, 0);
        a.mov_rm(R::RAX, R::R13, 0); // forced displacement byte
        a.mov_rm(R::RAX, R::R12, 0); // forced SIB
        a.mov_mr(R::RBX, 16, R::RDX);
        assert_eq!(
            bytes(a),
            vec![
                0x48, 0x8b, 0x03, // mov rax, [rbx]
                0x49, 0x8b, 0x45, 0x00, // mov rax, [r13+0]
                0x49, 0x8b, 0x04, 0x24, // mov rax, [r12]
                0x48, 0x89, 0x53, 0x10, // mov [rbx+16], rdx
            ]
        );
    }

    #[test]
    fn test_mov_scaled() {
        let mut a = asm();
        a.mov_ra(R::RAX, R::RBX, R::RCX, 3, 0x40);
        assert_eq!(bytes(a), vec![0x48, 0x8b, 0x44, 0xcb, 0x40]);
    }

    #[test]
    fn test_div_sequence() {
        let mut a = asm();
        a.cqo();
        a.idiv_r(R::RBX);
        assert_eq!(bytes(a), vec![0x48, 0x99, 0x48, 0xf7, 0xfb]);
    }

    #[test]
    fn test_imul_and_shifts() {
        let mut a = asm();
        a.imul_rr(R::RAX, R::RCX);
        a.shl_ri(R::RAX, 3);
        a.sar_rcl(R::RDX);
        assert_eq!(
            bytes(a),
            vec![
                0x48, 0x0f, 0xaf, 0xc1, // imul rax, rcx
                0x48, 0xc1, 0xe0, 0x03, // shl rax, 3
                0x48, 0xd3, 0xfa, // sar rdx, cl
            ]
        );
    }

    #[test]
    fn test_call_register_and_stack() {
        let mut a = asm();
        a.call_r(R::RAX);
        a.call_r(R::R11);
        a.call_b(-8);
        assert_eq!(
            bytes(a),
            vec![0xff, 0xd0, 0x41, 0xff, 0xd3, 0xff, 0x55, 0xf8]
        );
    }

    #[test]
    fn test_call_rel32_within_range() {
        let mut a = asm();
        a.call_addr(0x100, R::R11);
        // offset = 0x100 - 5 = 0xfb
        assert_eq!(bytes(a), vec![0xe8, 0xfb, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_call_overflow_falls_back_to_register() {
        let mut a = asm();
        a.call_addr(0x7fff_ffff_f000, R::R11);
        assert_eq!(
            bytes(a),
            vec![
                0x49, 0xbb, 0x00, 0xf0, 0xff, 0xff, 0xff, 0x7f, 0x00, 0x00, // mov r11, imm64
                0x41, 0xff, 0xd3, // call r11
            ]
        );
    }

    #[test]
    fn test_jcc_forward_patch() {
        let mut a = asm();
        let skip = a.new_label();
        a.jcc(Cond::E, skip);
        a.nop();
        a.bind_label(skip);
        a.ret();
        assert_eq!(bytes(a), vec![0x0f, 0x84, 0x01, 0x00, 0x00, 0x00, 0x90, 0xc3]);
    }

    #[test]
    fn test_jmp_backward() {
        let mut a = asm();
        let top = a.new_label();
        a.bind_label(top);
        a.nop();
        a.jmp(top);
        // rel = 0 - 6 = -6
        assert_eq!(bytes(a), vec![0x90, 0xe9, 0xfa, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn test_setcc_movzx() {
        let mut a = asm();
        a.setcc_r(Cond::L, R::RAX);
        a.movzx8_rr(R::RAX, R::RAX);
        assert_eq!(
            bytes(a),
            vec![0x0f, 0x9c, 0xc0, 0x48, 0x0f, 0xb6, 0xc0]
        );
    }

    #[test]
    fn test_movsd_forms() {
        let mut a = asm();
        a.movsd_rr(Xmm::XMM1, Xmm::XMM2);
        a.movsd_rs(Xmm::XMM0, 8);
        a.movsd_br(-16, Xmm::XMM3);
        assert_eq!(
            bytes(a),
            vec![
                0xf2, 0x0f, 0x10, 0xca, // movsd xmm1, xmm2
                0xf2, 0x0f, 0x10, 0x44, 0x24, 0x08, // movsd xmm0, [rsp+8]
                0xf2, 0x0f, 0x11, 0x5d, 0xf0, // movsd [rbp-16], xmm3
            ]
        );
    }

    #[test]
    fn test_sse_arith_and_compare() {
        let mut a = asm();
        a.addsd_rr(Xmm::XMM0, Xmm::XMM1);
        a.ucomisd_rr(Xmm::XMM0, Xmm::XMM1);
        a.cvtsi2sd(Xmm::XMM0, R::RAX);
        a.cvttsd2si(R::RAX, Xmm::XMM0);
        assert_eq!(
            bytes(a),
            vec![
                0xf2, 0x0f, 0x58, 0xc1, // addsd xmm0, xmm1
                0x66, 0x0f, 0x2e, 0xc1, // ucomisd xmm0, xmm1
                0xf2, 0x48, 0x0f, 0x2a, 0xc0, // cvtsi2sd xmm0, rax
                0xf2, 0x48, 0x0f, 0x2c, 0xc0, // cvttsd2si rax, xmm0
            ]
        );
    }

    #[test]
    fn test_cond_negate() {
        assert_eq!(Cond::E.negate(), Cond::Ne);
        assert_eq!(Cond::L.negate(), Cond::Ge);
        assert_eq!(Cond::Ge.negate(), Cond::L);
    }
}
