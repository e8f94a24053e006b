//! Tracing-mode activation frames
//!
//! An `MIFrame` is one guest-level activation while tracing: a program
//! counter plus three register files holding operands (boxes while the
//! value is runtime data, constants once it is known). Frames are pooled:
//! releasing one keeps its register vectors alive so a guest call in a
//! hot loop does not reallocate three register files every iteration.

use std::rc::Rc;

use crate::heap::{Kind, RawValue};
use crate::ir::boxes::{Operand, TraceBox};
use crate::jitcode::JitCode;

#[derive(Debug)]
pub struct MIFrame {
    pub jitcode: Rc<JitCode>,
    pub pc: usize,
    pub registers_i: Vec<Operand>,
    pub registers_r: Vec<Operand>,
    pub registers_f: Vec<Operand>,
    /// Where the caller wants the result of the call it is blocked on
    pub pending_result_reg: Option<u8>,
}

fn fill(registers: &mut Vec<Operand>, count: usize, kind: Kind) {
    registers.clear();
    registers.resize(
        count,
        Operand::Const(crate::ir::boxes::ConstVal::from_value(RawValue::default_of(kind))),
    );
}

impl MIFrame {
    fn blank(jitcode: Rc<JitCode>) -> MIFrame {
        MIFrame {
            jitcode,
            pc: 0,
            registers_i: vec![],
            registers_r: vec![],
            registers_f: vec![],
            pending_result_reg: None,
        }
    }

    /// (Re)initialize for a fresh activation of `jitcode`.
    pub fn setup(&mut self, jitcode: Rc<JitCode>, pc: usize) {
        fill(&mut self.registers_i, jitcode.num_regs_i, Kind::Int);
        fill(&mut self.registers_r, jitcode.num_regs_r, Kind::Ref);
        fill(&mut self.registers_f, jitcode.num_regs_f, Kind::Float);
        self.jitcode = jitcode;
        self.pc = pc;
        self.pending_result_reg = None;
    }

    fn file(&self, kind: Kind) -> &Vec<Operand> {
        match kind {
            Kind::Int => &self.registers_i,
            Kind::Ref => &self.registers_r,
            Kind::Float => &self.registers_f,
        }
    }

    fn file_mut(&mut self, kind: Kind) -> &mut Vec<Operand> {
        match kind {
            Kind::Int => &mut self.registers_i,
            Kind::Ref => &mut self.registers_r,
            Kind::Float => &mut self.registers_f,
        }
    }

    pub fn get_reg(&self, kind: Kind, index: u8) -> Operand {
        self.file(kind)[index as usize].clone()
    }

    pub fn set_reg(&mut self, kind: Kind, index: u8, value: Operand) {
        assert_eq!(value.kind(), kind, "wrong-kind operand stored in register file");
        self.file_mut(kind)[index as usize] = value;
    }

    /// Substitute every occurrence of `old` in the register files
    /// (promotion rewrites a box into its constant form).
    pub fn replace_box(&mut self, old: &TraceBox, new: &Operand) {
        for file in [
            &mut self.registers_i,
            &mut self.registers_r,
            &mut self.registers_f,
        ] {
            for slot in file.iter_mut() {
                if matches!(slot, Operand::Box(b) if b == old) {
                    *slot = new.clone();
                }
            }
        }
    }
}

/// Pool of released frames.
pub struct FramePool {
    free: Vec<MIFrame>,
}

impl FramePool {
    pub fn new() -> FramePool {
        FramePool { free: vec![] }
    }

    pub fn alloc(&mut self, jitcode: Rc<JitCode>, pc: usize) -> MIFrame {
        let mut frame = match self.free.pop() {
            Some(frame) => frame,
            None => MIFrame::blank(jitcode.clone()),
        };
        frame.setup(jitcode, pc);
        frame
    }

    pub fn release(&mut self, frame: MIFrame) {
        self.free.push(frame);
    }
}

impl Default for FramePool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::boxes::ConstVal;
    use crate::jitcode::JitCodeBuilder;

    fn sample_jitcode() -> Rc<JitCode> {
        let mut b = JitCodeBuilder::new("t", None);
        let _ = b.new_reg_i();
        let _ = b.new_reg_i();
        let _ = b.new_reg_r();
        b.void_return();
        Rc::new(b.finish())
    }

    #[test]
    fn test_setup_sizes_register_files() {
        let code = sample_jitcode();
        let mut pool = FramePool::new();
        let frame = pool.alloc(code.clone(), 0);
        assert_eq!(frame.registers_i.len(), 2);
        assert_eq!(frame.registers_r.len(), 1);
        assert_eq!(frame.registers_f.len(), 0);
    }

    #[test]
    fn test_pool_reuses_released_frames() {
        let code = sample_jitcode();
        let mut pool = FramePool::new();
        let mut frame = pool.alloc(code.clone(), 0);
        frame.set_reg(Kind::Int, 0, Operand::Const(ConstVal::Int(9)));
        pool.release(frame);

        let frame = pool.alloc(code, 4);
        // reused frame starts clean
        assert_eq!(frame.get_reg(Kind::Int, 0), Operand::Const(ConstVal::Int(0)));
        assert_eq!(frame.pc, 4);
    }

    #[test]
    fn test_replace_box_touches_only_that_box() {
        let code = sample_jitcode();
        let mut pool = FramePool::new();
        let mut frame = pool.alloc(code, 0);
        let b0 = TraceBox::new_int(3);
        let b1 = TraceBox::new_int(4);
        frame.set_reg(Kind::Int, 0, b0.clone().into());
        frame.set_reg(Kind::Int, 1, b1.clone().into());

        frame.replace_box(&b0, &Operand::Const(ConstVal::Int(3)));
        assert_eq!(frame.get_reg(Kind::Int, 0), Operand::Const(ConstVal::Int(3)));
        assert_eq!(frame.get_reg(Kind::Int, 1), Operand::Box(b1));
    }

    #[test]
    #[should_panic(expected = "wrong-kind operand")]
    fn test_kind_mismatch_store_panics() {
        let code = sample_jitcode();
        let mut pool = FramePool::new();
        let mut frame = pool.alloc(code, 0);
        frame.set_reg(Kind::Int, 0, Operand::Const(ConstVal::from_value(RawValue::Float(1.0))));
    }
}
