//! Big-endian reads over a class-file byte buffer.

use super::ClassError;

/// Cursor over class-file bytes. All multi-byte reads are big-endian,
/// as the class-file format requires.
pub struct Stream<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Stream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current byte position.
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Number of bytes left.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8, ClassError> {
        let byte = *self.data.get(self.pos).ok_or(ClassError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16, ClassError> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32, ClassError> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64, ClassError> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    pub fn read_i8(&mut self) -> Result<i8, ClassError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_i16(&mut self) -> Result<i16, ClassError> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_i32(&mut self) -> Result<i32, ClassError> {
        Ok(self.read_u32()? as i32)
    }

    /// Read `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ClassError> {
        let end = self.pos.checked_add(len).ok_or(ClassError::UnexpectedEof)?;
        let bytes = self.data.get(self.pos..end).ok_or(ClassError::UnexpectedEof)?;
        self.pos = end;
        Ok(bytes)
    }

    /// Skip `len` bytes.
    pub fn skip(&mut self, len: usize) -> Result<(), ClassError> {
        self.read_bytes(len)?;
        Ok(())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], ClassError> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }
}
