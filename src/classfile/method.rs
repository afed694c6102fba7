//! Method table and `Code` attributes.

use super::descriptor::MethodDescriptor;
use super::pool::{ConstantPool, NameAndType};
use super::stream::Stream;
use super::{skip_attribute_table, ClassError};

/// The body of a method's `Code` attribute.
#[derive(Debug, Clone, Default)]
pub struct CodeInfo {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
}

impl CodeInfo {
    fn parse(stream: &mut Stream) -> Result<Self, ClassError> {
        let max_stack = stream.read_u16()?;
        let max_locals = stream.read_u16()?;

        let code_len = stream.read_u32()? as usize;
        let code = stream.read_bytes(code_len)?.to_vec();

        // Exception table: 4 u16s per entry, all skipped.
        let exc_count = stream.read_u16()?;
        stream.skip(exc_count as usize * 8)?;

        skip_attribute_table(stream)?;
        Ok(Self { max_stack, max_locals, code })
    }
}

/// One parsed method: its name/descriptor indices and code.
#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub name_index: u16,
    pub descriptor_index: u16,
    pub code: CodeInfo,
}

impl MethodInfo {
    fn parse(stream: &mut Stream, pool: &ConstantPool) -> Result<Self, ClassError> {
        stream.read_u16()?; // access flags
        let name_index = stream.read_u16()?;
        let descriptor_index = stream.read_u16()?;

        let mut code = None;
        let attr_count = stream.read_u16()?;
        for _ in 0..attr_count {
            let attr_name_index = stream.read_u16()?;
            let length = stream.read_u32()? as usize;
            if pool.utf8(attr_name_index)? == "Code" {
                if code.is_some() {
                    return Err(ClassError::DuplicateCode);
                }
                code = Some(CodeInfo::parse(stream)?);
            } else {
                stream.skip(length)?;
            }
        }

        let code = code.ok_or(ClassError::MissingCode)?;
        Ok(Self { name_index, descriptor_index, code })
    }

    pub fn name<'a>(&self, pool: &'a ConstantPool) -> Result<&'a str, ClassError> {
        pool.utf8(self.name_index)
    }

    pub fn descriptor(&self, pool: &ConstantPool) -> Result<MethodDescriptor, ClassError> {
        MethodDescriptor::parse(pool.utf8(self.descriptor_index)?)
    }

    pub fn name_and_type(&self) -> NameAndType {
        NameAndType {
            name_index: self.name_index,
            desc_index: self.descriptor_index,
        }
    }
}

/// All methods declared by the class.
#[derive(Debug, Clone, Default)]
pub struct MethodTable {
    entries: Vec<MethodInfo>,
}

impl MethodTable {
    pub fn parse(stream: &mut Stream, pool: &ConstantPool) -> Result<Self, ClassError> {
        let count = stream.read_u16()?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            entries.push(MethodInfo::parse(stream, pool)?);
        }
        Ok(Self { entries })
    }

    /// Look up a method by its name/descriptor index pair.
    pub fn find(&self, key: NameAndType) -> Option<&MethodInfo> {
        self.entries.iter().find(|info| info.name_and_type() == key)
    }

    /// The `main` method, if the class declares one.
    pub fn main(&self, pool: &ConstantPool) -> Option<&MethodInfo> {
        self.entries
            .iter()
            .find(|info| pool.utf8(info.name_index).is_ok_and(|name| name == "main"))
    }

    /// The methods that become functions of the compiled program.
    /// Constructors (`<init>`/`<clinit>`) are not part of the supported
    /// subset and are filtered out by name.
    pub fn program_methods<'a>(
        &'a self,
        pool: &ConstantPool,
    ) -> Result<Vec<&'a MethodInfo>, ClassError> {
        let mut out = Vec::new();
        for info in &self.entries {
            let name = info.name(pool)?;
            if name == "<init>" || name == "<clinit>" {
                continue;
            }
            out.push(info);
        }
        Ok(out)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
