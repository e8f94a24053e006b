//! Executable memory for finished code
//!
//! Code pages are write-once: bytes are copied into a fresh anonymous
//! mapping, then the page protection is flipped to read+execute. The only
//! mutation ever applied afterwards is `patch32`, which retargets a
//! previously-emitted 32-bit field (a guard exit being redirected at a
//! bridge) through a temporary read-write window.

use crate::error::EmitError;

/// An installed, executable copy of a finished code buffer.
pub struct CodeMap {
    ptr: *mut u8,
    len: usize,
}

// The mapping is immutable-executable after installation; patch32 takes
// &self but is only called from the single compilation thread that owns
// the driver (see the engine's concurrency rules).
unsafe impl Send for CodeMap {}
unsafe impl Sync for CodeMap {}

fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

fn round_up(len: usize, page: usize) -> usize {
    (len + page - 1) & !(page - 1)
}

impl CodeMap {
    /// Map the given bytes into fresh executable memory.
    pub fn install(code: &[u8]) -> Result<CodeMap, EmitError> {
        assert!(!code.is_empty(), "installing empty code");
        let len = round_up(code.len(), page_size());
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(EmitError::Map("mmap failed".to_string()));
        }
        let ptr = ptr as *mut u8;
        unsafe {
            std::ptr::copy_nonoverlapping(code.as_ptr(), ptr, code.len());
        }
        let map = CodeMap { ptr, len };
        map.protect(libc::PROT_READ | libc::PROT_EXEC)?;
        Ok(map)
    }

    fn protect(&self, prot: libc::c_int) -> Result<(), EmitError> {
        let rc = unsafe { libc::mprotect(self.ptr as *mut libc::c_void, self.len, prot) };
        if rc != 0 {
            return Err(EmitError::Map("mprotect failed".to_string()));
        }
        Ok(())
    }

    /// Entry pointer at the given offset into the installed code.
    ///
    /// # Safety
    /// The offset must be an instruction boundary produced by the emitter.
    pub unsafe fn entry(&self, offset: usize) -> *const u8 {
        debug_assert!(offset < self.len);
        self.ptr.add(offset)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Retarget a previously-emitted 32-bit field.
    ///
    /// Panics if the field is not entirely inside the mapping (an
    /// impossible state); on x86 the instruction cache is coherent with
    /// stores, so no explicit flush is needed after the window closes.
    pub fn patch32(&self, at: usize, value: i32) -> Result<(), EmitError> {
        self.patch_bytes(at, &value.to_le_bytes())
    }

    /// Overwrite a reserved span of installed code (used to splice a
    /// long-form jump into a guard's exit stub).
    pub fn patch_bytes(&self, at: usize, bytes: &[u8]) -> Result<(), EmitError> {
        assert!(at + bytes.len() <= self.len, "patch outside installed code");
        self.protect(libc::PROT_READ | libc::PROT_WRITE)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.ptr.add(at), bytes.len());
        }
        self.protect(libc::PROT_READ | libc::PROT_EXEC)
    }
}

impl Drop for CodeMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr as *mut libc::c_void, self.len);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_install_and_read_back() {
        let code = vec![0x48, 0xc7, 0xc0, 0x2a, 0x00, 0x00, 0x00, 0xc3];
        let map = CodeMap::install(&code).unwrap();
        let installed = unsafe { std::slice::from_raw_parts(map.entry(0), code.len()) };
        assert_eq!(installed, &code[..]);
    }

    #[test]
    fn test_patch32_rewrites_field() {
        let code = vec![0xe9, 0x00, 0x00, 0x00, 0x00];
        let map = CodeMap::install(&code).unwrap();
        map.patch32(1, 0x11223344).unwrap();
        let installed = unsafe { std::slice::from_raw_parts(map.entry(0), code.len()) };
        assert_eq!(installed, &[0xe9, 0x44, 0x33, 0x22, 0x11]);
    }

    #[test]
    #[should_panic(expected = "patch outside installed code")]
    fn test_patch32_out_of_bounds_panics() {
        let map = CodeMap::install(&[0x90]).unwrap();
        let _ = map.patch32(map.len(), 0);
    }
}
