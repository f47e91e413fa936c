use super::errors::VmError;
use super::heap::ObjRef;
use super::operand_stack::{QWORD_SIZE, REF_SIZE};

/// A typed view over one frame's locals window.
///
/// Locals are a byte-indexed scratch area holding the frame's arguments
/// (the leading `parameters_byte_count` bytes) and its local variables.
/// Accessors address bytes directly; the compiler guarantees defined
/// reads after defined writes, so no per-slot initialization is tracked
/// here beyond the zeroing done at frame push. As on the operand stack,
/// a parallel flag per byte marks the first byte of every slot currently
/// holding a heap reference.
pub struct Locals<'a> {
    bytes: &'a mut [u8],
    refs: &'a mut [bool],
}

impl<'a> Locals<'a> {
    pub fn new(bytes: &'a mut [u8], refs: &'a mut [bool]) -> Self {
        debug_assert_eq!(bytes.len(), refs.len());
        Self { bytes, refs }
    }

    /// The declared locals size of the frame, in bytes.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    fn check(&self, at: usize, width: usize, action: &str) -> Result<(), VmError> {
        if at + width > self.bytes.len() {
            return Err(VmError::LocalsOutOfBound(format!(
                "{} value at offset {} (locals size is {})",
                action,
                at,
                self.bytes.len()
            )));
        }
        Ok(())
    }

    pub fn get_byte(&self, at: usize) -> Result<i8, VmError> {
        self.check(at, 1, "accessing")?;
        Ok(self.bytes[at] as i8)
    }

    pub fn set_byte(&mut self, at: usize, b: i8) -> Result<(), VmError> {
        self.check(at, 1, "updating")?;
        self.bytes[at] = b as u8;
        self.refs[at] = false;
        Ok(())
    }

    pub fn get_qword(&self, at: usize) -> Result<i64, VmError> {
        self.check(at, QWORD_SIZE, "accessing")?;
        let mut buf = [0u8; QWORD_SIZE];
        buf.copy_from_slice(&self.bytes[at..at + QWORD_SIZE]);
        Ok(i64::from_ne_bytes(buf))
    }

    pub fn set_qword(&mut self, at: usize, i: i64) -> Result<(), VmError> {
        self.check(at, QWORD_SIZE, "updating")?;
        self.bytes[at..at + QWORD_SIZE].copy_from_slice(&i.to_ne_bytes());
        self.refs[at..at + QWORD_SIZE].fill(false);
        Ok(())
    }

    pub fn get_ref(&self, at: usize) -> Result<ObjRef, VmError> {
        self.check(at, REF_SIZE, "accessing")?;
        let mut buf = [0u8; REF_SIZE];
        buf.copy_from_slice(&self.bytes[at..at + REF_SIZE]);
        Ok(ObjRef::from_raw(u64::from_ne_bytes(buf) as usize))
    }

    pub fn set_ref(&mut self, at: usize, r: ObjRef) -> Result<(), VmError> {
        self.check(at, REF_SIZE, "updating")?;
        self.bytes[at..at + REF_SIZE].copy_from_slice(&(r.as_raw() as u64).to_ne_bytes());
        self.refs[at..at + REF_SIZE].fill(false);
        self.refs[at] = true;
        Ok(())
    }
}
