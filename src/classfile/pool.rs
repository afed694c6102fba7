//! Constant pool parsing and typed access.
//!
//! The pool is 1-based; entry 0 is invalid, and `Long`/`Double` entries
//! occupy two consecutive slots (the second slot is unusable).

use super::stream::Stream;
use super::ClassError;

/// A symbolic member reference (`Fieldref`/`Methodref`/`InterfaceMethodref`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemberRef {
    pub class_index: u16,
    pub name_type_index: u16,
}

/// A `NameAndType` pair of UTF-8 indices. Also used as the lookup key for
/// methods of the enclosing class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NameAndType {
    pub name_index: u16,
    pub desc_index: u16,
}

/// One constant-pool entry.
#[derive(Debug, Clone)]
pub enum Entry {
    Utf8(String),
    Integer(i32),
    Float(u32),
    Long(i64),
    Double(u64),
    Class { name_index: u16 },
    String { string_index: u16 },
    FieldRef(MemberRef),
    MethodRef(MemberRef),
    InterfaceMethodRef(MemberRef),
    NameAndType(NameAndType),
    MethodHandle { kind: u8, index: u16 },
    MethodType { desc_index: u16 },
    Dynamic { bootstrap_index: u16, name_type_index: u16 },
    InvokeDynamic { bootstrap_index: u16, name_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

impl Entry {
    /// Parse one entry; returns the entry and the number of slots it occupies.
    fn parse(stream: &mut Stream) -> Result<(Entry, u16), ClassError> {
        let tag = stream.read_u8()?;
        let entry = match tag {
            1 => {
                let len = stream.read_u16()? as usize;
                let bytes = stream.read_bytes(len)?;
                // Modified UTF-8 in general; the subset we care about is ASCII.
                let text = String::from_utf8_lossy(bytes).into_owned();
                Entry::Utf8(text)
            }
            3 => Entry::Integer(stream.read_i32()?),
            4 => Entry::Float(stream.read_u32()?),
            5 => Entry::Long(stream.read_u64()? as i64),
            6 => Entry::Double(stream.read_u64()?),
            7 => Entry::Class { name_index: stream.read_u16()? },
            8 => Entry::String { string_index: stream.read_u16()? },
            9 => Entry::FieldRef(Self::member_ref(stream)?),
            10 => Entry::MethodRef(Self::member_ref(stream)?),
            11 => Entry::InterfaceMethodRef(Self::member_ref(stream)?),
            12 => Entry::NameAndType(NameAndType {
                name_index: stream.read_u16()?,
                desc_index: stream.read_u16()?,
            }),
            15 => Entry::MethodHandle {
                kind: stream.read_u8()?,
                index: stream.read_u16()?,
            },
            16 => Entry::MethodType { desc_index: stream.read_u16()? },
            17 => Entry::Dynamic {
                bootstrap_index: stream.read_u16()?,
                name_type_index: stream.read_u16()?,
            },
            18 => Entry::InvokeDynamic {
                bootstrap_index: stream.read_u16()?,
                name_type_index: stream.read_u16()?,
            },
            19 => Entry::Module { name_index: stream.read_u16()? },
            20 => Entry::Package { name_index: stream.read_u16()? },
            other => return Err(ClassError::UnknownPoolTag(other)),
        };
        let nslots = match entry {
            Entry::Long(_) | Entry::Double(_) => 2,
            _ => 1,
        };
        Ok((entry, nslots))
    }

    fn member_ref(stream: &mut Stream) -> Result<MemberRef, ClassError> {
        Ok(MemberRef {
            class_index: stream.read_u16()?,
            name_type_index: stream.read_u16()?,
        })
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Entry::Utf8(_) => "Utf8",
            Entry::Integer(_) => "Integer",
            Entry::Float(_) => "Float",
            Entry::Long(_) => "Long",
            Entry::Double(_) => "Double",
            Entry::Class { .. } => "Class",
            Entry::String { .. } => "String",
            Entry::FieldRef(_) => "Fieldref",
            Entry::MethodRef(_) => "Methodref",
            Entry::InterfaceMethodRef(_) => "InterfaceMethodref",
            Entry::NameAndType(_) => "NameAndType",
            Entry::MethodHandle { .. } => "MethodHandle",
            Entry::MethodType { .. } => "MethodType",
            Entry::Dynamic { .. } => "Dynamic",
            Entry::InvokeDynamic { .. } => "InvokeDynamic",
            Entry::Module { .. } => "Module",
            Entry::Package { .. } => "Package",
        }
    }
}

/// The class file's constant pool.
#[derive(Debug, Clone, Default)]
pub struct ConstantPool {
    // `None` marks the unusable second slot of a Long/Double entry.
    entries: Vec<Option<Entry>>,
}

impl ConstantPool {
    pub fn parse(stream: &mut Stream) -> Result<Self, ClassError> {
        let count = stream.read_u16()?;
        if count == 0 {
            return Err(ClassError::EmptyPool);
        }
        let count = count - 1;

        let mut entries = Vec::with_capacity(count as usize);
        let mut filled = 0u16;
        while filled < count {
            let (entry, nslots) = Entry::parse(stream)?;
            entries.push(Some(entry));
            for _ in 1..nslots {
                entries.push(None);
            }
            filled += nslots;
        }
        Ok(Self { entries })
    }

    /// Look up an entry by its 1-based index.
    pub fn get(&self, index: u16) -> Result<&Entry, ClassError> {
        if index == 0 {
            return Err(ClassError::BadPoolIndex(index));
        }
        self.entries
            .get(index as usize - 1)
            .and_then(|slot| slot.as_ref())
            .ok_or(ClassError::BadPoolIndex(index))
    }

    /// The UTF-8 string at `index`.
    pub fn utf8(&self, index: u16) -> Result<&str, ClassError> {
        match self.get(index)? {
            Entry::Utf8(text) => Ok(text),
            other => Err(ClassError::BadPoolEntryType {
                index,
                expected: "Utf8",
                actual: other.kind_name(),
            }),
        }
    }

    /// The `NameAndType` pair at `index`.
    pub fn name_and_type(&self, index: u16) -> Result<NameAndType, ClassError> {
        match self.get(index)? {
            Entry::NameAndType(pair) => Ok(*pair),
            other => Err(ClassError::BadPoolEntryType {
                index,
                expected: "NameAndType",
                actual: other.kind_name(),
            }),
        }
    }

    /// The method reference at `index` (plain or interface).
    pub fn method_ref(&self, index: u16) -> Result<&MemberRef, ClassError> {
        match self.get(index)? {
            Entry::MethodRef(member) | Entry::InterfaceMethodRef(member) => Ok(member),
            other => Err(ClassError::BadPoolEntryType {
                index,
                expected: "Methodref",
                actual: other.kind_name(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_bytes(entries: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend(((entries.len() + 1) as u16).to_be_bytes());
        for entry in entries {
            out.extend(*entry);
        }
        out
    }

    #[test]
    fn test_utf8_and_name_and_type() {
        let bytes = pool_bytes(&[
            &[1, 0, 3, b'a', b'd', b'd'],
            &[12, 0, 1, 0, 3],
            &[1, 0, 4, b'(', b'I', b')', b'I'],
        ]);
        let mut stream = Stream::new(&bytes);
        let pool = ConstantPool::parse(&mut stream).unwrap();

        assert_eq!(pool.utf8(1).unwrap(), "add");
        assert_eq!(pool.utf8(3).unwrap(), "(I)I");
        let pair = pool.name_and_type(2).unwrap();
        assert_eq!(pair, NameAndType { name_index: 1, desc_index: 3 });
    }

    #[test]
    fn test_long_takes_two_slots() {
        let bytes = pool_bytes(&[
            &[5, 0, 0, 0, 0, 0, 0, 0, 7],
            &[1, 0, 1, b'x'],
        ]);
        let mut stream = Stream::new(&bytes);
        let pool = ConstantPool::parse(&mut stream).unwrap();

        assert!(matches!(pool.get(1).unwrap(), Entry::Long(7)));
        // Slot 2 is the Long's second half.
        assert!(matches!(pool.get(2), Err(ClassError::BadPoolIndex(2))));
        assert_eq!(pool.utf8(3).unwrap(), "x");
    }

    #[test]
    fn test_index_zero_invalid() {
        let bytes = pool_bytes(&[&[1, 0, 1, b'x']]);
        let mut stream = Stream::new(&bytes);
        let pool = ConstantPool::parse(&mut stream).unwrap();
        assert!(matches!(pool.get(0), Err(ClassError::BadPoolIndex(0))));
        assert!(matches!(pool.get(9), Err(ClassError::BadPoolIndex(9))));
    }

    #[test]
    fn test_wrong_entry_type() {
        let bytes = pool_bytes(&[&[3, 0, 0, 0, 5]]);
        let mut stream = Stream::new(&bytes);
        let pool = ConstantPool::parse(&mut stream).unwrap();
        assert!(matches!(
            pool.utf8(1),
            Err(ClassError::BadPoolEntryType { index: 1, .. })
        ));
    }
}
