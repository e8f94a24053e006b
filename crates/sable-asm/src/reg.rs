//! Register numbering for x86
//!
//! General-purpose registers are numbered 0..8 in 32-bit mode and 0..16 in
//! 64-bit mode; the extra registers (r8..r15) need a REX prefix bit. SSE
//! registers follow the same split.

/// A general-purpose register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Gpr(pub u8);

impl Gpr {
    pub const RAX: Gpr = Gpr(0);
    pub const RCX: Gpr = Gpr(1);
    pub const RDX: Gpr = Gpr(2);
    pub const RBX: Gpr = Gpr(3);
    pub const RSP: Gpr = Gpr(4);
    pub const RBP: Gpr = Gpr(5);
    pub const RSI: Gpr = Gpr(6);
    pub const RDI: Gpr = Gpr(7);
    pub const R8: Gpr = Gpr(8);
    pub const R9: Gpr = Gpr(9);
    pub const R10: Gpr = Gpr(10);
    pub const R11: Gpr = Gpr(11);
    pub const R12: Gpr = Gpr(12);
    pub const R13: Gpr = Gpr(13);
    pub const R14: Gpr = Gpr(14);
    pub const R15: Gpr = Gpr(15);

    /// Full register number (0..16)
    pub fn index(self) -> u8 {
        self.0
    }

    /// Whether encoding this register needs a REX extension bit
    pub fn is_extended(self) -> bool {
        self.0 >= 8
    }

    /// Register number truncated to the 3 bits that fit in a mod/rm field
    pub fn low3(self) -> u8 {
        self.0 & 7
    }

    pub fn name(self) -> &'static str {
        const NAMES: [&str; 16] = [
            "rax", "rcx", "rdx", "rbx", "rsp", "rbp", "rsi", "rdi", "r8", "r9", "r10", "r11",
            "r12", "r13", "r14", "r15",
        ];
        NAMES[self.0 as usize]
    }
}

impl std::fmt::Display for Gpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// An SSE register number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Xmm(pub u8);

impl Xmm {
    pub const XMM0: Xmm = Xmm(0);
    pub const XMM1: Xmm = Xmm(1);
    pub const XMM2: Xmm = Xmm(2);
    pub const XMM3: Xmm = Xmm(3);
    pub const XMM4: Xmm = Xmm(4);
    pub const XMM5: Xmm = Xmm(5);
    pub const XMM6: Xmm = Xmm(6);
    pub const XMM7: Xmm = Xmm(7);
    pub const XMM8: Xmm = Xmm(8);
    pub const XMM15: Xmm = Xmm(15);

    pub fn index(self) -> u8 {
        self.0
    }
}

impl std::fmt::Display for Xmm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "xmm{}", self.0)
    }
}

/// Whether a signed value fits in one byte (the short-immediate forms)
pub fn single_byte(value: i64) -> bool {
    (-128..128).contains(&value)
}

/// Whether a signed value fits in a 32-bit immediate or displacement
pub fn fits_in_32bits(value: i64) -> bool {
    (i32::MIN as i64..=i32::MAX as i64).contains(&value)
}
