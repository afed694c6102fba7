//! Class-file reader.
//!
//! Parses just enough of the class-file format to compile the supported
//! subset: the constant pool, the class's own index (used to reject
//! cross-class calls), and the method table with `Code` attributes.
//! Fields, interfaces, and all unrecognized attributes are skipped.

mod descriptor;
mod method;
mod opcode;
mod pool;
mod stream;

pub use descriptor::{check_print_descriptor, MethodDescriptor};
pub use method::{CodeInfo, MethodInfo, MethodTable};
pub use opcode::Opcode;
pub use pool::{ConstantPool, Entry, MemberRef, NameAndType};
pub use stream::Stream;

use thiserror::Error;

/// Errors from parsing a class file.
#[derive(Debug, Clone, Error)]
pub enum ClassError {
    #[error("Unexpected end of input")]
    UnexpectedEof,
    #[error("Trailing data after class file")]
    TrailingData,
    #[error("Bad magic number: {0:#010x}")]
    BadMagic(u32),
    #[error("Constant pool count cannot be 0")]
    EmptyPool,
    #[error("Unknown constant pool tag: {0}")]
    UnknownPoolTag(u8),
    #[error("Invalid constant pool index: {0}")]
    BadPoolIndex(u16),
    #[error("Bad constant pool entry at index {index}: expected {expected}, found {actual}")]
    BadPoolEntryType {
        index: u16,
        expected: &'static str,
        actual: &'static str,
    },
    #[error("Unsupported method descriptor: {0}")]
    BadDescriptor(String),
    #[error("Duplicate Code attribute")]
    DuplicateCode,
    #[error("Method is missing Code attribute")]
    MissingCode,
}

/// A parsed class file.
#[derive(Debug, Clone)]
pub struct ClassFile {
    pub pool: ConstantPool,
    /// Constant-pool index of this class's `Class` entry.
    pub self_index: u16,
    pub methods: MethodTable,
}

impl ClassFile {
    /// Parse a class file from its full byte contents. The entire buffer
    /// must be consumed; trailing bytes are an error.
    pub fn parse(data: &[u8]) -> Result<Self, ClassError> {
        let mut stream = Stream::new(data);
        let cls = Self::read(&mut stream)?;
        if stream.remaining() != 0 {
            return Err(ClassError::TrailingData);
        }
        Ok(cls)
    }

    fn read(stream: &mut Stream) -> Result<Self, ClassError> {
        let magic = stream.read_u32()?;
        if magic != 0xCAFEBABE {
            return Err(ClassError::BadMagic(magic));
        }
        stream.read_u16()?; // minor version
        stream.read_u16()?; // major version

        let pool = ConstantPool::parse(stream)?;

        stream.read_u16()?; // access flags
        let self_index = stream.read_u16()?;
        stream.read_u16()?; // super class index

        let interface_count = stream.read_u16()?;
        stream.skip(interface_count as usize * 2)?;

        let field_count = stream.read_u16()?;
        for _ in 0..field_count {
            stream.skip(6)?; // access flags, name index, descriptor index
            skip_attribute_table(stream)?;
        }

        let methods = MethodTable::parse(stream, &pool)?;
        skip_attribute_table(stream)?;

        Ok(Self { pool, self_index, methods })
    }
}

/// Skip a `(count, [name_index, length, bytes...])` attribute table.
pub(crate) fn skip_attribute_table(stream: &mut Stream) -> Result<(), ClassError> {
    let count = stream.read_u16()?;
    for _ in 0..count {
        stream.read_u16()?; // attribute name index
        let length = stream.read_u32()? as usize;
        stream.skip(length)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_magic() {
        let data = [0xDE, 0xAD, 0xBE, 0xEF];
        assert!(matches!(
            ClassFile::parse(&data),
            Err(ClassError::BadMagic(0xDEADBEEF))
        ));
    }

    #[test]
    fn test_truncated_input() {
        let data = [0xCA, 0xFE, 0xBA, 0xBE, 0x00];
        assert!(matches!(
            ClassFile::parse(&data),
            Err(ClassError::UnexpectedEof)
        ));
    }
}
