//! Growable little-endian code buffer
//!
//! Instructions are appended byte by byte; forward references (jumps to
//! labels not yet bound) leave a 32-bit hole that is patched when the
//! label is bound. `patch32` is also used after installation to retarget
//! guard exits at bridges.

use crate::reg::fits_in_32bits;

/// A position in the buffer that may not be bound yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Label(pub(crate) u32);

/// Finished machine code plus the resolved label offsets.
#[derive(Debug)]
pub struct FinishedCode {
    pub bytes: Vec<u8>,
    /// Offset of each label, indexed by label number
    pub labels: Vec<usize>,
}

/// Append-only byte buffer with 32-bit patching and label fixups.
pub struct CodeBuffer {
    bytes: Vec<u8>,
    labels: Vec<Option<usize>>,
    /// (site, label): sites of rel32 fields waiting for their label
    fixups: Vec<(usize, Label)>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        CodeBuffer {
            bytes: Vec::with_capacity(256),
            labels: vec![],
            fixups: vec![],
        }
    }

    pub fn write_byte(&mut self, byte: u8) {
        self.bytes.push(byte);
    }

    pub fn write_imm8(&mut self, imm: i64) {
        self.bytes.push((imm & 0xff) as u8);
    }

    pub fn write_imm16(&mut self, imm: i64) {
        self.bytes.push((imm & 0xff) as u8);
        self.bytes.push(((imm >> 8) & 0xff) as u8);
    }

    pub fn write_imm32(&mut self, imm: i64) {
        assert!(fits_in_32bits(imm), "immediate does not fit in 32 bits: {imm}");
        self.bytes.extend_from_slice(&(imm as i32).to_le_bytes());
    }

    pub fn write_imm64(&mut self, imm: i64) {
        self.bytes.extend_from_slice(&imm.to_le_bytes());
    }

    /// Current position, i.e. the offset the next byte will land at
    pub fn current_offset(&self) -> usize {
        self.bytes.len()
    }

    /// Rewrite a previously-emitted 32-bit little-endian field in place.
    ///
    /// Panics if the field is not entirely inside already-emitted bytes;
    /// a patch outside the buffer is an impossible state.
    pub fn patch32(&mut self, at: usize, value: i32) {
        assert!(
            at + 4 <= self.bytes.len(),
            "patch32 outside code buffer: at={at}, len={}",
            self.bytes.len()
        );
        self.bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn new_label(&mut self) -> Label {
        let label = Label(self.labels.len() as u32);
        self.labels.push(None);
        label
    }

    /// Bind a label to the current offset and patch every rel32 fixup
    /// that was waiting for it.
    pub fn bind_label(&mut self, label: Label) {
        let offset = self.current_offset();
        let slot = &mut self.labels[label.0 as usize];
        assert!(slot.is_none(), "label bound twice");
        *slot = Some(offset);

        let mut pending = std::mem::take(&mut self.fixups);
        pending.retain(|&(site, target)| {
            if target == label {
                let rel = offset as i64 - (site as i64 + 4);
                self.patch32(site, rel as i32);
                false
            } else {
                true
            }
        });
        self.fixups = pending;
    }

    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels[label.0 as usize]
    }

    /// Emit a 32-bit pc-relative field pointing at `label`.
    ///
    /// If the label is already bound the displacement is written directly;
    /// otherwise a zero placeholder is left and patched at bind time.
    pub fn write_rel32_to(&mut self, label: Label) {
        match self.label_offset(label) {
            Some(target) => {
                let rel = target as i64 - (self.current_offset() as i64 + 4);
                self.write_imm32(rel);
            }
            None => {
                let site = self.current_offset();
                self.write_imm32(0);
                self.fixups.push((site, label));
            }
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn finish(self) -> FinishedCode {
        assert!(
            self.fixups.is_empty(),
            "finish with {} unresolved label fixups",
            self.fixups.len()
        );
        let labels = self
            .labels
            .into_iter()
            .map(|slot| slot.expect("finish with unbound label"))
            .collect();
        FinishedCode {
            bytes: self.bytes,
            labels,
        }
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_little_endian_immediates() {
        let mut buf = CodeBuffer::new();
        buf.write_imm16(0x1234);
        buf.write_imm32(0x0a0b0c0d);
        buf.write_imm64(-2);
        assert_eq!(
            buf.bytes(),
            &[
                0x34, 0x12, 0x0d, 0x0c, 0x0b, 0x0a, 0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
                0xff
            ]
        );
    }

    #[test]
    fn test_patch32_rewrites_in_place() {
        let mut buf = CodeBuffer::new();
        buf.write_byte(0xe9);
        let at = buf.current_offset();
        buf.write_imm32(0);
        buf.patch32(at, 0x11223344);
        buf.patch32(at, 0x55667788); // idempotent rewrite
        assert_eq!(buf.bytes(), &[0xe9, 0x88, 0x77, 0x66, 0x55]);
    }

    #[test]
    #[should_panic(expected = "patch32 outside code buffer")]
    fn test_patch32_out_of_bounds_panics() {
        let mut buf = CodeBuffer::new();
        buf.write_byte(0x90);
        buf.patch32(0, 0);
    }

    #[test]
    fn test_forward_label_fixup() {
        let mut buf = CodeBuffer::new();
        let target = buf.new_label();
        buf.write_byte(0xe9);
        buf.write_rel32_to(target);
        buf.write_byte(0x90);
        buf.bind_label(target);
        // jump over one nop: rel = 6 - 5 = 1
        assert_eq!(buf.bytes(), &[0xe9, 0x01, 0x00, 0x00, 0x00, 0x90]);

        let finished = buf.finish();
        assert_eq!(finished.labels, vec![6]);
    }

    #[test]
    fn test_backward_label_written_directly() {
        let mut buf = CodeBuffer::new();
        let target = buf.new_label();
        buf.bind_label(target);
        buf.write_byte(0x90);
        buf.write_byte(0xe9);
        buf.write_rel32_to(target);
        // rel = 0 - 6 = -6
        assert_eq!(buf.bytes(), &[0x90, 0xe9, 0xfa, 0xff, 0xff, 0xff]);
    }
}
