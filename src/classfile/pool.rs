//! The constant pool of a single class: an append-only, deduplicating table
//! of typed constants, plus the bootstrap-method table that `invokedynamic`
//! entries point into.
use std::collections::HashMap;

use super::WriteBytes;

/// A field or method reference: owner class, member name, descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MemberRef {
    pub class: String,
    pub name: String,
    pub descriptor: String,
}

impl MemberRef {
    pub fn new(
        class: impl Into<String>,
        name: impl Into<String>,
        descriptor: impl Into<String>,
    ) -> Self {
        Self {
            class: class.into(),
            name: name.into(),
            descriptor: descriptor.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RefKind {
    GetField = 1,
    GetStatic = 2,
    PutField = 3,
    PutStatic = 4,
    InvokeVirtual = 5,
    InvokeStatic = 6,
    InvokeSpecial = 7,
    NewInvokeSpecial = 8,
    InvokeInterface = 9,
}

impl RefKind {
    pub fn from_u8(kind: u8) -> Option<Self> {
        Some(match kind {
            1 => Self::GetField,
            2 => Self::GetStatic,
            3 => Self::PutField,
            4 => Self::PutStatic,
            5 => Self::InvokeVirtual,
            6 => Self::InvokeStatic,
            7 => Self::InvokeSpecial,
            8 => Self::NewInvokeSpecial,
            9 => Self::InvokeInterface,
            _ => return None,
        })
    }

    fn is_field(self) -> bool {
        matches!(
            self,
            Self::GetField | Self::GetStatic | Self::PutField | Self::PutStatic
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodHandle {
    pub kind: RefKind,
    pub member: MemberRef,
    /// Whether the member lives on an interface (selects `InterfaceMethodref`).
    pub interface: bool,
}

/// A bootstrap method together with its static arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Bootstrap {
    pub handle: MethodHandle,
    pub args: Vec<Constant>,
}

/// Everything an `invokedynamic` instruction names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DynamicSite {
    pub bootstrap: Bootstrap,
    pub name: String,
    pub descriptor: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Constant {
    Utf8(String),
    Integer(i32),
    Long(i64),
    String(String),
    Class(String),
    NameAndType { name: String, descriptor: String },
    FieldRef(MemberRef),
    MethodRef(MemberRef),
    InterfaceMethodRef(MemberRef),
    MethodHandle(MethodHandle),
    MethodType(String),
    InvokeDynamic(DynamicSite),
}

impl Constant {
    pub fn tag(&self) -> u8 {
        match self {
            Constant::Utf8(_) => 1,
            Constant::Integer(_) => 3,
            Constant::Long(_) => 5,
            Constant::Class(_) => 7,
            Constant::String(_) => 8,
            Constant::FieldRef(_) => 9,
            Constant::MethodRef(_) => 10,
            Constant::InterfaceMethodRef(_) => 11,
            Constant::NameAndType { .. } => 12,
            Constant::MethodHandle(_) => 15,
            Constant::MethodType(_) => 16,
            Constant::InvokeDynamic(_) => 18,
        }
    }

    /// Number of pool indices the entry occupies.
    pub fn width(&self) -> u16 {
        match self {
            Constant::Long(_) => 2,
            _ => 1,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("constant pool exceeds 65535 entries")]
    Overflow,
    #[error("constant text of {0} bytes exceeds the 65535 byte limit")]
    StringTooLong(usize),
    #[error("too many bootstrap methods")]
    TooManyBootstraps,
}

#[derive(Debug, Default)]
pub struct ConstantPool {
    indices: HashMap<Constant, u16>,
    // the next free index, kept wide so that overflow is detectable
    next: u32,
    bytes: Vec<u8>,
    bootstraps: Vec<(u16, Vec<u16>)>,
    bootstrap_indices: HashMap<Bootstrap, u16>,
}

impl ConstantPool {
    pub fn new() -> Self {
        Self {
            next: 1,
            ..Default::default()
        }
    }

    /// Returns the index of `constant`, interning it (and everything it
    /// refers to) first if it is not present yet.
    pub fn insert(&mut self, constant: &Constant) -> Result<u16, PoolError> {
        if let Some(index) = self.indices.get(constant) {
            return Ok(*index);
        }

        let mut body = Vec::new();
        match constant {
            Constant::Utf8(text) => {
                let encoded = encode_modified_utf8(text);
                let len = u16::try_from(encoded.len())
                    .map_err(|_| PoolError::StringTooLong(encoded.len()))?;
                body.u2(len);
                body.extend_from_slice(&encoded);
            }
            Constant::Integer(value) => body.u4(*value as u32),
            Constant::Long(value) => body.extend_from_slice(&value.to_be_bytes()),
            Constant::String(text) => body.u2(self.utf8(text)?),
            Constant::Class(name) => body.u2(self.utf8(name)?),
            Constant::NameAndType { name, descriptor } => {
                body.u2(self.utf8(name)?);
                body.u2(self.utf8(descriptor)?);
            }
            Constant::FieldRef(member)
            | Constant::MethodRef(member)
            | Constant::InterfaceMethodRef(member) => {
                body.u2(self.class(&member.class)?);
                body.u2(self.name_and_type(&member.name, &member.descriptor)?);
            }
            Constant::MethodHandle(handle) => {
                let member = if handle.kind.is_field() {
                    Constant::FieldRef(handle.member.clone())
                } else if handle.interface {
                    Constant::InterfaceMethodRef(handle.member.clone())
                } else {
                    Constant::MethodRef(handle.member.clone())
                };
                body.u1(handle.kind as u8);
                body.u2(self.insert(&member)?);
            }
            Constant::MethodType(descriptor) => body.u2(self.utf8(descriptor)?),
            Constant::InvokeDynamic(site) => {
                body.u2(self.bootstrap(&site.bootstrap)?);
                body.u2(self.name_and_type(&site.name, &site.descriptor)?);
            }
        }

        let index = self.next;
        let next = index + u32::from(constant.width());
        // the count field is a u2 holding `next`
        if next > u32::from(u16::MAX) {
            return Err(PoolError::Overflow);
        }
        self.next = next;
        let index = index as u16;

        self.bytes.u1(constant.tag());
        self.bytes.extend_from_slice(&body);
        self.indices.insert(constant.clone(), index);
        Ok(index)
    }

    pub fn utf8(&mut self, text: &str) -> Result<u16, PoolError> {
        self.insert(&Constant::Utf8(text.into()))
    }

    pub fn class(&mut self, name: &str) -> Result<u16, PoolError> {
        self.insert(&Constant::Class(name.into()))
    }

    pub fn name_and_type(&mut self, name: &str, descriptor: &str) -> Result<u16, PoolError> {
        self.insert(&Constant::NameAndType {
            name: name.into(),
            descriptor: descriptor.into(),
        })
    }

    /// Index of `bootstrap` in the class's bootstrap-method table.
    pub fn bootstrap(&mut self, bootstrap: &Bootstrap) -> Result<u16, PoolError> {
        if let Some(index) = self.bootstrap_indices.get(bootstrap) {
            return Ok(*index);
        }
        let handle = self.insert(&Constant::MethodHandle(bootstrap.handle.clone()))?;
        let args = bootstrap
            .args
            .iter()
            .map(|arg| self.insert(arg))
            .collect::<Result<Vec<_>, _>>()?;

        let index =
            u16::try_from(self.bootstraps.len()).map_err(|_| PoolError::TooManyBootstraps)?;
        self.bootstraps.push((handle, args));
        self.bootstrap_indices.insert(bootstrap.clone(), index);
        Ok(index)
    }

    pub fn get(&self, constant: &Constant) -> Option<u16> {
        self.indices.get(constant).copied()
    }

    /// The `constant_pool_count` field: one more than the highest index.
    pub fn count(&self) -> u16 {
        self.next as u16
    }

    /// The encoded entries, in index order.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn has_bootstraps(&self) -> bool {
        !self.bootstraps.is_empty()
    }

    /// Body of the `BootstrapMethods` attribute (without name and length).
    pub fn bootstrap_table(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.u2(self.bootstraps.len() as u16);
        for (handle, args) in &self.bootstraps {
            out.u2(*handle);
            out.u2(args.len() as u16);
            for arg in args {
                out.u2(*arg);
            }
        }
        out
    }
}

/// The JVM's "modified UTF-8": NUL takes two bytes and supplementary
/// characters are written as surrogate pairs of three bytes each.
pub fn encode_modified_utf8(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for unit in text.encode_utf16() {
        match unit {
            0x0001..=0x007f => out.push(unit as u8),
            0x0000 | 0x0080..=0x07ff => {
                out.push(0xc0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
            _ => {
                out.push(0xe0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3f) as u8);
                out.push(0x80 | (unit & 0x3f) as u8);
            }
        }
    }
    out
}

/// Inverse of [`encode_modified_utf8`]; `None` on malformed input.
pub fn decode_modified_utf8(bytes: &[u8]) -> Option<String> {
    let mut units = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().copied();
    while let Some(b) = iter.next() {
        let unit = match b {
            0x01..=0x7f => u16::from(b),
            0xc0..=0xdf => {
                let b2 = iter.next()?;
                (u16::from(b & 0x1f) << 6) | u16::from(b2 & 0x3f)
            }
            0xe0..=0xef => {
                let b2 = iter.next()?;
                let b3 = iter.next()?;
                (u16::from(b & 0x0f) << 12) | (u16::from(b2 & 0x3f) << 6) | u16::from(b3 & 0x3f)
            }
            _ => return None,
        };
        units.push(unit);
    }
    String::from_utf16(&units).ok()
}
