//! Graph-building ABI over the x86 emitter
//!
//! The general code-writer surface: `newgraph` opens a function,
//! `genop1`/`genop2`/`genop_call` and friends append operations over
//! variables, `jump_if_true`/`jump_if_false` fork paths that are written
//! later, and `flexswitch` builds a switch whose cases are attached one
//! at a time after compilation has started: each `add_case` splices a
//! new compare into the dispatch chain by patching the previous chain
//! tail.
//!
//! Variables live in the i64 buffer passed in rdi, one slot each, the
//! same convention as the trace lowering; rax and rdx are scratch.

use sable_asm::{fits_in_32bits, Assembler, Cond, Gpr, Mode};

use crate::error::CompileError;
use crate::ir::ops::OpNum;

/// A value slot in the generated function's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Var(usize);

/// A forked path waiting to be written (`start_writing` attaches it).
#[derive(Debug)]
pub struct PendingPath(sable_asm::Label);

/// A bound position that `finish_and_goto` can target.
#[derive(Debug, Clone, Copy)]
pub struct BlockLabel(sable_asm::Label);

/// Builder for one generated function.
pub struct GraphBuilder {
    asm: Assembler,
    name: String,
    next_var: usize,
}

impl GraphBuilder {
    /// Open a new graph with `num_args` arguments, pre-assigned to the
    /// first buffer slots. The entry point is offset 0.
    pub fn newgraph(num_args: usize, name: &str) -> (GraphBuilder, Vec<Var>) {
        let builder = GraphBuilder {
            asm: Assembler::new(Mode::Long64),
            name: name.to_string(),
            next_var: num_args,
        };
        let args = (0..num_args).map(Var).collect();
        (builder, args)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn new_var(&mut self) -> Var {
        let v = Var(self.next_var);
        self.next_var += 1;
        v
    }

    fn slot(v: Var) -> i32 {
        (v.0 * 8) as i32
    }

    fn load(&mut self, v: Var, dest: Gpr) {
        self.asm.mov_rm(dest, Gpr::RDI, Self::slot(v));
    }

    fn store(&mut self, src: Gpr, v: Var) {
        self.asm.mov_mr(Gpr::RDI, Self::slot(v), src);
    }

    // ----- operations -----

    pub fn genop1(&mut self, opnum: OpNum, a: Var) -> Result<Var, CompileError> {
        self.load(a, Gpr::RAX);
        match opnum {
            OpNum::IntNeg => self.asm.neg_r(Gpr::RAX),
            OpNum::IntInvert => self.asm.not_r(Gpr::RAX),
            OpNum::IntIsTrue => {
                self.asm.test_rr(Gpr::RAX, Gpr::RAX);
                self.asm.setcc_r(Cond::Ne, Gpr::RAX);
                self.asm.movzx8_rr(Gpr::RAX, Gpr::RAX);
            }
            OpNum::IntAbs => {
                // branchless: mask = value >> 63; (value ^ mask) - mask
                self.asm.cqo();
                self.asm.xor_rr(Gpr::RAX, Gpr::RDX);
                self.asm.sub_rr(Gpr::RAX, Gpr::RDX);
            }
            other => return Err(CompileError::UnsupportedOp(other.name())),
        }
        let result = self.new_var();
        self.store(Gpr::RAX, result);
        Ok(result)
    }

    pub fn genop2(&mut self, opnum: OpNum, a: Var, b: Var) -> Result<Var, CompileError> {
        self.load(a, Gpr::RAX);
        match opnum {
            OpNum::IntAdd | OpNum::IntSub | OpNum::IntMul | OpNum::IntAnd | OpNum::IntOr
            | OpNum::IntXor => {
                self.load(b, Gpr::RDX);
                match opnum {
                    OpNum::IntAdd => self.asm.add_rr(Gpr::RAX, Gpr::RDX),
                    OpNum::IntSub => self.asm.sub_rr(Gpr::RAX, Gpr::RDX),
                    OpNum::IntMul => self.asm.imul_rr(Gpr::RAX, Gpr::RDX),
                    OpNum::IntAnd => self.asm.and_rr(Gpr::RAX, Gpr::RDX),
                    OpNum::IntOr => self.asm.or_rr(Gpr::RAX, Gpr::RDX),
                    _ => self.asm.xor_rr(Gpr::RAX, Gpr::RDX),
                }
            }
            OpNum::IntLshift | OpNum::IntRshift | OpNum::UintRshift => {
                self.load(b, Gpr::RCX);
                match opnum {
                    OpNum::IntLshift => self.asm.shl_rcl(Gpr::RAX),
                    OpNum::IntRshift => self.asm.sar_rcl(Gpr::RAX),
                    _ => self.asm.shr_rcl(Gpr::RAX),
                }
            }
            OpNum::IntFloordiv | OpNum::IntMod => {
                self.load(b, Gpr::RCX);
                self.asm.cqo();
                self.asm.idiv_r(Gpr::RCX);
                if opnum == OpNum::IntMod {
                    self.asm.mov_rr(Gpr::RAX, Gpr::RDX);
                }
            }
            OpNum::IntLt | OpNum::IntLe | OpNum::IntEq | OpNum::IntNe | OpNum::IntGt
            | OpNum::IntGe | OpNum::UintLt | OpNum::UintLe | OpNum::UintGt | OpNum::UintGe => {
                let cond = match opnum {
                    OpNum::IntLt => Cond::L,
                    OpNum::IntLe => Cond::Le,
                    OpNum::IntEq => Cond::E,
                    OpNum::IntNe => Cond::Ne,
                    OpNum::IntGt => Cond::G,
                    OpNum::IntGe => Cond::Ge,
                    OpNum::UintLt => Cond::B,
                    OpNum::UintLe => Cond::Be,
                    OpNum::UintGt => Cond::A,
                    _ => Cond::Ae,
                };
                self.load(b, Gpr::RDX);
                self.asm.cmp_rr(Gpr::RAX, Gpr::RDX);
                self.asm.setcc_r(cond, Gpr::RAX);
                self.asm.movzx8_rr(Gpr::RAX, Gpr::RAX);
            }
            other => return Err(CompileError::UnsupportedOp(other.name())),
        }
        let result = self.new_var();
        self.store(Gpr::RAX, result);
        Ok(result)
    }

    pub fn genop_same_as(&mut self, a: Var) -> Var {
        self.load(a, Gpr::RAX);
        let result = self.new_var();
        self.store(Gpr::RAX, result);
        result
    }

    /// Residual call to an absolute address with the System V integer
    /// argument registers (at most four arguments here; the buffer
    /// pointer is saved around the call).
    pub fn genop_call(&mut self, target: i64, args: &[Var]) -> Result<Var, CompileError> {
        const ARG_REGS: [Gpr; 4] = [Gpr::RDI, Gpr::RSI, Gpr::RDX, Gpr::RCX];
        if args.len() > ARG_REGS.len() {
            return Err(CompileError::UnsupportedOp("too many call arguments"));
        }
        self.asm.push_r(Gpr::RDI);
        // fill rdi last so the buffer stays readable while loading
        for (i, &arg) in args.iter().enumerate().rev() {
            self.load(arg, ARG_REGS[i]);
        }
        self.asm.call_addr(target, Gpr::R11);
        self.asm.pop_r(Gpr::RDI);
        let result = self.new_var();
        self.store(Gpr::RAX, result);
        Ok(result)
    }

    /// Allocate through the runtime's allocator entry point.
    pub fn genop_new(&mut self, allocator: i64, size: Var) -> Result<Var, CompileError> {
        self.genop_call(allocator, &[size])
    }

    pub fn genop_new_array(&mut self, allocator: i64, len: Var) -> Result<Var, CompileError> {
        self.genop_call(allocator, &[len])
    }

    /// `result = [obj + offset]`
    pub fn genop_getfield(&mut self, offset: i32, obj: Var) -> Var {
        self.load(obj, Gpr::RAX);
        self.asm.mov_rm(Gpr::RDX, Gpr::RAX, offset);
        let result = self.new_var();
        self.store(Gpr::RDX, result);
        result
    }

    /// `[obj + offset] = value`
    pub fn genop_setfield(&mut self, offset: i32, obj: Var, value: Var) {
        self.load(obj, Gpr::RAX);
        self.load(value, Gpr::RDX);
        self.asm.mov_mr(Gpr::RAX, offset, Gpr::RDX);
    }

    // ----- control flow -----

    /// Fork: branch away when `cond` is non-zero; the returned path is
    /// written later via `start_writing`.
    pub fn jump_if_true(&mut self, cond: Var) -> PendingPath {
        let label = self.asm.new_label();
        self.load(cond, Gpr::RAX);
        self.asm.test_rr(Gpr::RAX, Gpr::RAX);
        self.asm.jcc(Cond::Ne, label);
        PendingPath(label)
    }

    pub fn jump_if_false(&mut self, cond: Var) -> PendingPath {
        let label = self.asm.new_label();
        self.load(cond, Gpr::RAX);
        self.asm.test_rr(Gpr::RAX, Gpr::RAX);
        self.asm.jcc(Cond::E, label);
        PendingPath(label)
    }

    /// Attach a forked path at the current position. The current flow
    /// must already have been finished.
    pub fn start_writing(&mut self, path: PendingPath) {
        self.asm.bind_label(path.0);
    }

    /// Close the current block and mark a position jumps can target.
    pub fn enter_next_block(&mut self) -> BlockLabel {
        let label = self.asm.new_label();
        self.asm.bind_label(label);
        BlockLabel(label)
    }

    pub fn finish_and_return(&mut self, value: Var) {
        self.load(value, Gpr::RAX);
        self.asm.ret();
    }

    pub fn finish_and_goto(&mut self, target: BlockLabel) {
        self.asm.jmp(target.0);
    }

    /// Open a switch on `cond`. The builder continues as the default
    /// path; cases are attached through the returned handle.
    pub fn flexswitch(&mut self, cond: Var) -> FlexSwitch {
        self.load(cond, Gpr::RAX);
        // chain head: initially rel 0, falling through into the default
        self.asm.buffer_mut().write_byte(0xe9);
        let chain_tail = self.asm.current_offset();
        self.asm.buffer_mut().write_imm32(0);
        let default_entry = self.asm.current_offset();
        FlexSwitch {
            chain_tail,
            default_entry,
        }
    }

    /// Finish building; returns the emitted bytes and the number of
    /// buffer slots the generated code uses.
    pub fn end(self) -> (Vec<u8>, usize) {
        let finished = self.asm.into_buffer().finish();
        (finished.bytes, self.next_var)
    }
}

/// A compiled switch accepting new cases after the fact.
///
/// Each case is a `cmp`/`je` chunk appended at the current end of the
/// code; attaching it patches the previous chain tail to jump there, and
/// the chunk's own miss-jump becomes the new tail, still falling back to
/// the default path.
pub struct FlexSwitch {
    chain_tail: usize,
    default_entry: usize,
}

impl FlexSwitch {
    /// Attach a new case; the builder is then positioned to write the
    /// case's code.
    pub fn add_case(&mut self, builder: &mut GraphBuilder, value: i64) {
        assert!(fits_in_32bits(value), "switch case outside 32-bit range");
        let chunk_start = builder.asm.current_offset();

        // cmp rax, value; je case_code; jmp <default>
        builder.asm.cmp_ri(Gpr::RAX, value as i32);
        let case_code = builder.asm.new_label();
        builder.asm.jcc(Cond::E, case_code);
        builder.asm.buffer_mut().write_byte(0xe9);
        let miss_site = builder.asm.current_offset();
        let miss_rel = self.default_entry as i64 - (miss_site as i64 + 4);
        builder.asm.buffer_mut().write_imm32(miss_rel);
        builder.asm.bind_label(case_code);

        // splice the chunk into the chain
        let rel = chunk_start as i64 - (self.chain_tail as i64 + 4);
        builder.asm.buffer_mut().patch32(self.chain_tail, rel as i32);
        self.chain_tail = miss_site;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_straight_line_graph() {
        let (mut builder, args) = GraphBuilder::newgraph(2, "add");
        let sum = builder.genop2(OpNum::IntAdd, args[0], args[1]).unwrap();
        builder.finish_and_return(sum);
        let (code, slots) = builder.end();
        assert_eq!(slots, 3);
        assert_eq!(
            code,
            vec![
                0x48, 0x8b, 0x07, // mov rax, [rdi]
                0x48, 0x8b, 0x57, 0x08, // mov rdx, [rdi+8]
                0x48, 0x01, 0xd0, // add rax, rdx
                0x48, 0x89, 0x47, 0x10, // mov [rdi+16], rax
                0x48, 0x8b, 0x47, 0x10, // mov rax, [rdi+16]
                0xc3, // ret
            ]
        );
    }

    #[test]
    fn test_forked_paths() {
        let (mut builder, args) = GraphBuilder::newgraph(1, "branchy");
        let taken = builder.jump_if_true(args[0]);
        builder.finish_and_return(args[0]);
        builder.start_writing(taken);
        let neg = builder.genop1(OpNum::IntNeg, args[0]).unwrap();
        builder.finish_and_return(neg);
        let (code, _) = builder.end();
        // the fork's jcc must point past the first return
        assert_eq!(code[3], 0x48); // test rax, rax follows the load
        assert!(code.len() > 12);
    }

    #[test]
    fn test_flexswitch_chain_patches() {
        let (mut builder, args) = GraphBuilder::newgraph(1, "dispatch");
        let mut switch = builder.flexswitch(args[0]);
        // default path: return the selector
        builder.finish_and_return(args[0]);

        switch.add_case(&mut builder, 7);
        let seven = builder.genop1(OpNum::IntNeg, args[0]).unwrap();
        builder.finish_and_return(seven);

        switch.add_case(&mut builder, 9);
        let nine = builder.genop1(OpNum::IntInvert, args[0]).unwrap();
        builder.finish_and_return(nine);

        let (code, _) = builder.end();

        // the chain head (after the 3-byte load) now jumps forward into
        // the first case chunk rather than falling through
        let head_rel = i32::from_le_bytes([code[4], code[5], code[6], code[7]]);
        assert!(head_rel > 0);
        // first chunk begins with cmp rax, 7
        let chunk1 = (8 + head_rel) as usize;
        assert_eq!(&code[chunk1..chunk1 + 4], &[0x48, 0x83, 0xf8, 0x07]);
        // its miss-jump leads to the second chunk (cmp rax, 9)
        let miss_site = chunk1 + 4 + 6 + 1; // cmp, je rel32, jmp opcode
        let miss_rel =
            i32::from_le_bytes([code[miss_site], code[miss_site + 1], code[miss_site + 2], code[miss_site + 3]]);
        let chunk2 = (miss_site as i64 + 4 + miss_rel as i64) as usize;
        assert_eq!(&code[chunk2..chunk2 + 4], &[0x48, 0x83, 0xf8, 0x09]);
    }

    #[test]
    fn test_call_saves_buffer_pointer() {
        let (mut builder, args) = GraphBuilder::newgraph(1, "caller");
        let r = builder.genop_call(0x1000, &[args[0]]).unwrap();
        builder.finish_and_return(r);
        let (code, _) = builder.end();
        // push rdi first, pop rdi after the call
        assert_eq!(code[0], 0x57);
        assert!(code.contains(&0x5f));
    }
}
