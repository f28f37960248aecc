//! Reads class images back into a structured view, instructions included.
//!
//! This only understands what [`super::emitter`] writes (plus the common
//! attributes it skips), which is all the disassembler and tests need.
use super::{
    descriptor::VType,
    emitter::{Annotation, ElementValue, MAGIC},
    frames::StackMapFrame,
    insn::{FieldOp, InvokeOp, Jump, Loadable, LocalKind, MemberRef, Op, TypeOp},
    pool::{decode_modified_utf8, Bootstrap, Constant, DynamicSite, MethodHandle, RefKind},
    Insn, Label,
};

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of class image at byte {0}")]
    Truncated(usize),
    #[error("bad magic number {0:#010x}")]
    BadMagic(u32),
    #[error("unknown constant tag {tag} at pool index {index}")]
    BadTag { index: u16, tag: u8 },
    #[error("constant pool index {0} is missing or of the wrong kind")]
    BadIndex(u16),
    #[error("malformed modified UTF-8 text")]
    BadText,
    #[error("unknown opcode {opcode:#04x} at offset {offset}")]
    BadOpcode { offset: u32, opcode: u8 },
    #[error("unknown stack map entry {0}")]
    BadFrame(u8),
    #[error("{0} trailing bytes after the class")]
    TrailingBytes(usize),
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or(DecodeError::Truncated(self.pos))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u1(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    fn u2(&mut self) -> Result<u16, DecodeError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u4(&mut self) -> Result<u32, DecodeError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn i4(&mut self) -> Result<i32, DecodeError> {
        Ok(self.u4()? as i32)
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }
}

// Pool entries as stored, with references still unresolved.
#[derive(Debug, Clone)]
enum Raw {
    Utf8(String),
    Integer(i32),
    Long(i64),
    Class(u16),
    String(u16),
    NameAndType(u16, u16),
    FieldRef(u16, u16),
    MethodRef(u16, u16),
    InterfaceMethodRef(u16, u16),
    MethodHandle(u8, u16),
    MethodType(u16),
    InvokeDynamic(u16, u16),
    // second slot of a long
    Unusable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    pub access: u16,
    pub name: String,
    pub descriptor: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CodeInfo {
    pub max_stack: u16,
    pub max_locals: u16,
    pub bytes: Vec<u8>,
    /// The `StackMapTable` entries, as encoded.
    pub stack_map: Vec<StackMapFrame>,
    /// Instructions with their offsets. Branch labels hold absolute offsets.
    pub insns: Vec<(u32, Insn)>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MethodInfo {
    pub access: u16,
    pub name: String,
    pub descriptor: String,
    pub code: Option<CodeInfo>,
    pub annotations: Vec<Annotation>,
}

impl MethodInfo {
    pub fn annotation(&self, descriptor: &str) -> Option<&Annotation> {
        self.annotations
            .iter()
            .find(|annotation| annotation.descriptor == descriptor)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub pool_count: u16,
    pub access: u16,
    pub name: String,
    pub super_name: String,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub bootstrap_methods: Vec<Bootstrap>,
    pub source_file: Option<String>,
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut r = Reader::new(bytes);
        let magic = r.u4()?;
        if magic != MAGIC {
            return Err(DecodeError::BadMagic(magic));
        }
        let minor_version = r.u2()?;
        let major_version = r.u2()?;

        let pool_count = r.u2()?;
        let mut raw = vec![Raw::Unusable];
        while raw.len() < usize::from(pool_count) {
            let index = raw.len() as u16;
            let tag = r.u1()?;
            let entry = match tag {
                1 => {
                    let len = r.u2()?;
                    let text = decode_modified_utf8(r.take(usize::from(len))?)
                        .ok_or(DecodeError::BadText)?;
                    Raw::Utf8(text)
                }
                3 => Raw::Integer(r.i4()?),
                5 => {
                    let high = u64::from(r.u4()?);
                    let low = u64::from(r.u4()?);
                    Raw::Long(((high << 32) | low) as i64)
                }
                7 => Raw::Class(r.u2()?),
                8 => Raw::String(r.u2()?),
                9 => Raw::FieldRef(r.u2()?, r.u2()?),
                10 => Raw::MethodRef(r.u2()?, r.u2()?),
                11 => Raw::InterfaceMethodRef(r.u2()?, r.u2()?),
                12 => Raw::NameAndType(r.u2()?, r.u2()?),
                15 => Raw::MethodHandle(r.u1()?, r.u2()?),
                16 => Raw::MethodType(r.u2()?),
                18 => Raw::InvokeDynamic(r.u2()?, r.u2()?),
                tag => return Err(DecodeError::BadTag { index, tag }),
            };
            let wide = matches!(entry, Raw::Long(_));
            raw.push(entry);
            if wide {
                raw.push(Raw::Unusable);
            }
        }
        let mut pool = Pool {
            raw,
            bootstraps: Vec::new(),
        };

        let access = r.u2()?;
        let name = pool.class(r.u2()?)?;
        let super_name = pool.class(r.u2()?)?;
        let interfaces = r.u2()?;
        r.take(usize::from(interfaces) * 2)?;

        let mut fields = Vec::new();
        for _ in 0..r.u2()? {
            let access = r.u2()?;
            let name = pool.utf8(r.u2()?)?.to_owned();
            let descriptor = pool.utf8(r.u2()?)?.to_owned();
            for _ in 0..r.u2()? {
                r.u2()?;
                let len = r.u4()?;
                r.take(len as usize)?;
            }
            fields.push(FieldInfo {
                access,
                name,
                descriptor,
            });
        }

        let mut methods = Vec::new();
        for _ in 0..r.u2()? {
            let access = r.u2()?;
            let name = pool.utf8(r.u2()?)?.to_owned();
            let descriptor = pool.utf8(r.u2()?)?.to_owned();
            let mut code = None;
            let mut annotations = Vec::new();
            for _ in 0..r.u2()? {
                let attr = pool.utf8(r.u2()?)?.to_owned();
                let len = r.u4()?;
                let mut body = Reader::new(r.take(len as usize)?);
                match attr.as_str() {
                    "Code" => code = Some(pool.code(&mut body)?),
                    "RuntimeVisibleAnnotations" => annotations = pool.annotations(&mut body)?,
                    _ => {}
                }
            }
            methods.push(MethodInfo {
                access,
                name,
                descriptor,
                code,
                annotations,
            });
        }

        let mut source_file = None;
        for _ in 0..r.u2()? {
            let attr = pool.utf8(r.u2()?)?.to_owned();
            let len = r.u4()?;
            let mut body = Reader::new(r.take(len as usize)?);
            match attr.as_str() {
                "SourceFile" => source_file = Some(pool.utf8(body.u2()?)?.to_owned()),
                "BootstrapMethods" => {
                    for _ in 0..body.u2()? {
                        let handle = body.u2()?;
                        let args = (0..body.u2()?)
                            .map(|_| body.u2())
                            .collect::<Result<Vec<_>, _>>()?;
                        pool.bootstraps.push((handle, args));
                    }
                }
                _ => {}
            }
        }
        if r.remaining() > 0 {
            return Err(DecodeError::TrailingBytes(r.remaining()));
        }

        // instructions may name bootstrap methods, which are only known now
        for method in &mut methods {
            if let Some(code) = &mut method.code {
                code.insns = pool.instructions(&code.bytes)?;
            }
        }
        let bootstrap_methods = (0..pool.bootstraps.len())
            .map(|index| pool.bootstrap(index as u16))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            minor_version,
            major_version,
            pool_count,
            access,
            name,
            super_name,
            fields,
            methods,
            bootstrap_methods,
            source_file,
        })
    }

    pub fn method(&self, name: &str, descriptor: &str) -> Option<&MethodInfo> {
        self.methods
            .iter()
            .find(|method| method.name == name && method.descriptor == descriptor)
    }

    pub fn methods_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a MethodInfo> + 'a {
        self.methods.iter().filter(move |method| method.name == name)
    }
}

struct Pool {
    raw: Vec<Raw>,
    bootstraps: Vec<(u16, Vec<u16>)>,
}

impl Pool {
    fn entry(&self, index: u16) -> Result<&Raw, DecodeError> {
        match self.raw.get(usize::from(index)) {
            Some(Raw::Unusable) | None => Err(DecodeError::BadIndex(index)),
            Some(entry) => Ok(entry),
        }
    }

    fn utf8(&self, index: u16) -> Result<&str, DecodeError> {
        match self.entry(index)? {
            Raw::Utf8(text) => Ok(text),
            _ => Err(DecodeError::BadIndex(index)),
        }
    }

    fn class(&self, index: u16) -> Result<String, DecodeError> {
        match self.entry(index)? {
            Raw::Class(name) => Ok(self.utf8(*name)?.to_owned()),
            _ => Err(DecodeError::BadIndex(index)),
        }
    }

    fn name_and_type(&self, index: u16) -> Result<(String, String), DecodeError> {
        match self.entry(index)? {
            Raw::NameAndType(name, desc) => {
                Ok((self.utf8(*name)?.to_owned(), self.utf8(*desc)?.to_owned()))
            }
            _ => Err(DecodeError::BadIndex(index)),
        }
    }

    fn member(&self, class: u16, nat: u16) -> Result<MemberRef, DecodeError> {
        let (name, descriptor) = self.name_and_type(nat)?;
        Ok(MemberRef::new(self.class(class)?, name, descriptor))
    }

    fn bootstrap(&self, index: u16) -> Result<Bootstrap, DecodeError> {
        let (handle, args) = self
            .bootstraps
            .get(usize::from(index))
            .ok_or(DecodeError::BadIndex(index))?;
        let Constant::MethodHandle(handle) = self.constant(*handle)? else {
            return Err(DecodeError::BadIndex(*handle));
        };
        let args = args
            .iter()
            .map(|arg| self.constant(*arg))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Bootstrap { handle, args })
    }

    fn constant(&self, index: u16) -> Result<Constant, DecodeError> {
        Ok(match self.entry(index)? {
            Raw::Utf8(text) => Constant::Utf8(text.clone()),
            Raw::Integer(value) => Constant::Integer(*value),
            Raw::Long(value) => Constant::Long(*value),
            Raw::Class(name) => Constant::Class(self.utf8(*name)?.to_owned()),
            Raw::String(text) => Constant::String(self.utf8(*text)?.to_owned()),
            Raw::NameAndType(..) => {
                let (name, descriptor) = self.name_and_type(index)?;
                Constant::NameAndType { name, descriptor }
            }
            Raw::FieldRef(class, nat) => Constant::FieldRef(self.member(*class, *nat)?),
            Raw::MethodRef(class, nat) => Constant::MethodRef(self.member(*class, *nat)?),
            Raw::InterfaceMethodRef(class, nat) => {
                Constant::InterfaceMethodRef(self.member(*class, *nat)?)
            }
            Raw::MethodHandle(kind, member) => {
                let kind = RefKind::from_u8(*kind).ok_or(DecodeError::BadIndex(index))?;
                let (member, interface) = match self.constant(*member)? {
                    Constant::FieldRef(member) | Constant::MethodRef(member) => (member, false),
                    Constant::InterfaceMethodRef(member) => (member, true),
                    _ => return Err(DecodeError::BadIndex(index)),
                };
                Constant::MethodHandle(MethodHandle {
                    kind,
                    member,
                    interface,
                })
            }
            Raw::MethodType(desc) => Constant::MethodType(self.utf8(*desc)?.to_owned()),
            Raw::InvokeDynamic(bootstrap, nat) => {
                let (name, descriptor) = self.name_and_type(*nat)?;
                Constant::InvokeDynamic(DynamicSite {
                    bootstrap: self.bootstrap(*bootstrap)?,
                    name,
                    descriptor,
                })
            }
            Raw::Unusable => return Err(DecodeError::BadIndex(index)),
        })
    }

    fn code(&self, r: &mut Reader) -> Result<CodeInfo, DecodeError> {
        let max_stack = r.u2()?;
        let max_locals = r.u2()?;
        let len = r.u4()?;
        let bytes = r.take(len as usize)?.to_vec();
        let handlers = r.u2()?;
        r.take(usize::from(handlers) * 8)?;
        let mut stack_map = Vec::new();
        for _ in 0..r.u2()? {
            let name = self.utf8(r.u2()?)?;
            let len = r.u4()?;
            let mut body = Reader::new(r.take(len as usize)?);
            if name == "StackMapTable" {
                stack_map = self.stack_map(&mut body)?;
            }
        }
        Ok(CodeInfo {
            max_stack,
            max_locals,
            bytes,
            stack_map,
            insns: Vec::new(),
        })
    }

    fn vtype(&self, r: &mut Reader) -> Result<VType, DecodeError> {
        Ok(match r.u1()? {
            0 => VType::Top,
            1 => VType::Integer,
            2 => VType::Float,
            3 => VType::Double,
            4 => VType::Long,
            5 => VType::Null,
            6 => VType::UninitializedThis,
            7 => VType::Object(self.class(r.u2()?)?),
            8 => VType::Uninitialized(r.u2()?),
            tag => return Err(DecodeError::BadFrame(tag)),
        })
    }

    fn vtypes(&self, r: &mut Reader, count: u16) -> Result<Vec<VType>, DecodeError> {
        (0..count).map(|_| self.vtype(r)).collect()
    }

    fn stack_map(&self, r: &mut Reader) -> Result<Vec<StackMapFrame>, DecodeError> {
        let count = r.u2()?;
        let mut frames = Vec::with_capacity(usize::from(count));
        for _ in 0..count {
            let frame_type = r.u1()?;
            let frame = match frame_type {
                0..=63 => StackMapFrame::Same {
                    delta: frame_type.into(),
                },
                64..=127 => StackMapFrame::SameLocals1 {
                    delta: u16::from(frame_type - 64),
                    stack: self.vtype(r)?,
                },
                247 => {
                    let delta = r.u2()?;
                    StackMapFrame::SameLocals1 {
                        delta,
                        stack: self.vtype(r)?,
                    }
                }
                248..=250 => StackMapFrame::Chop {
                    delta: r.u2()?,
                    count: 251 - frame_type,
                },
                251 => StackMapFrame::Same { delta: r.u2()? },
                252..=254 => {
                    let delta = r.u2()?;
                    StackMapFrame::Append {
                        delta,
                        locals: self.vtypes(r, u16::from(frame_type - 251))?,
                    }
                }
                255 => {
                    let delta = r.u2()?;
                    let count = r.u2()?;
                    let locals = self.vtypes(r, count)?;
                    let count = r.u2()?;
                    StackMapFrame::Full {
                        delta,
                        locals,
                        stack: self.vtypes(r, count)?,
                    }
                }
                reserved => return Err(DecodeError::BadFrame(reserved)),
            };
            frames.push(frame);
        }
        Ok(frames)
    }

    fn annotations(&self, r: &mut Reader) -> Result<Vec<Annotation>, DecodeError> {
        let mut annotations = Vec::new();
        for _ in 0..r.u2()? {
            let mut annotation = Annotation::marker(self.utf8(r.u2()?)?);
            for _ in 0..r.u2()? {
                let name = self.utf8(r.u2()?)?.to_owned();
                let tag = r.u1()?;
                let index = r.u2()?;
                match (tag, self.entry(index)?) {
                    (b'I', Raw::Integer(value)) => {
                        annotation = annotation.with(name, ElementValue::Int(*value));
                    }
                    _ => return Err(DecodeError::BadIndex(index)),
                }
            }
            annotations.push(annotation);
        }
        Ok(annotations)
    }

    fn loadable(&self, index: u16) -> Result<Loadable, DecodeError> {
        Ok(match self.constant(index)? {
            Constant::Integer(value) => Loadable::Int(value),
            Constant::Long(value) => Loadable::Long(value),
            Constant::String(text) => Loadable::String(text),
            Constant::Class(name) => Loadable::Class(name),
            _ => return Err(DecodeError::BadIndex(index)),
        })
    }

    fn member_at(&self, index: u16) -> Result<MemberRef, DecodeError> {
        match self.constant(index)? {
            Constant::FieldRef(member)
            | Constant::MethodRef(member)
            | Constant::InterfaceMethodRef(member) => Ok(member),
            _ => Err(DecodeError::BadIndex(index)),
        }
    }

    fn instructions(&self, code: &[u8]) -> Result<Vec<(u32, Insn)>, DecodeError> {
        let mut r = Reader::new(code);
        let mut insns = Vec::new();
        let label = |site: u32, relative: i32| Label((site as i32 + relative) as u32);

        while r.remaining() > 0 {
            let site = r.pos as u32;
            let opcode = r.u1()?;
            let insn = match opcode {
                0x02..=0x08 => Insn::PushInt(i32::from(opcode) - 3),
                0x09 | 0x0a => Insn::PushLong(i64::from(opcode - 0x09)),
                0x10 => Insn::PushInt(i32::from(r.u1()? as i8)),
                0x11 => Insn::PushInt(i32::from(r.u2()? as i16)),
                0x12 => Insn::Ldc(self.loadable(u16::from(r.u1()?))?),
                0x13 | 0x14 => Insn::Ldc(self.loadable(r.u2()?)?),
                0x15 => Insn::Load(LocalKind::Int, u16::from(r.u1()?)),
                0x16 => Insn::Load(LocalKind::Long, u16::from(r.u1()?)),
                0x19 => Insn::Load(LocalKind::Reference, u16::from(r.u1()?)),
                0x1a..=0x1d => Insn::Load(LocalKind::Int, u16::from(opcode - 0x1a)),
                0x1e..=0x21 => Insn::Load(LocalKind::Long, u16::from(opcode - 0x1e)),
                0x2a..=0x2d => Insn::Load(LocalKind::Reference, u16::from(opcode - 0x2a)),
                0x36 => Insn::Store(LocalKind::Int, u16::from(r.u1()?)),
                0x37 => Insn::Store(LocalKind::Long, u16::from(r.u1()?)),
                0x3a => Insn::Store(LocalKind::Reference, u16::from(r.u1()?)),
                0x3b..=0x3e => Insn::Store(LocalKind::Int, u16::from(opcode - 0x3b)),
                0x3f..=0x42 => Insn::Store(LocalKind::Long, u16::from(opcode - 0x3f)),
                0x4b..=0x4e => Insn::Store(LocalKind::Reference, u16::from(opcode - 0x4b)),
                0xc4 => {
                    let inner = r.u1()?;
                    let slot = r.u2()?;
                    match inner {
                        0x15 => Insn::Load(LocalKind::Int, slot),
                        0x16 => Insn::Load(LocalKind::Long, slot),
                        0x19 => Insn::Load(LocalKind::Reference, slot),
                        0x36 => Insn::Store(LocalKind::Int, slot),
                        0x37 => Insn::Store(LocalKind::Long, slot),
                        0x3a => Insn::Store(LocalKind::Reference, slot),
                        opcode => {
                            return Err(DecodeError::BadOpcode {
                                offset: site + 1,
                                opcode,
                            })
                        }
                    }
                }
                0xaa => {
                    while r.pos % 4 != 0 {
                        r.u1()?;
                    }
                    let default = label(site, r.i4()?);
                    let low = r.i4()?;
                    let high = r.i4()?;
                    let targets = (low..=high)
                        .map(|_| Ok(label(site, r.i4()?)))
                        .collect::<Result<Vec<_>, DecodeError>>()?;
                    Insn::TableSwitch {
                        low,
                        default,
                        targets,
                    }
                }
                0xb9 => {
                    let member = self.member_at(r.u2()?)?;
                    r.u2()?;
                    Insn::Invoke(InvokeOp::Interface, member)
                }
                0xba => {
                    let index = r.u2()?;
                    r.u2()?;
                    match self.constant(index)? {
                        Constant::InvokeDynamic(site) => Insn::InvokeDynamic(site),
                        _ => return Err(DecodeError::BadIndex(index)),
                    }
                }
                opcode => {
                    if let Some(op) = Op::from_opcode(opcode) {
                        Insn::Op(op)
                    } else if let Some(jump) = Jump::from_opcode(opcode) {
                        Insn::Jump(jump, label(site, i32::from(r.u2()? as i16)))
                    } else if let Some(op) = TypeOp::from_opcode(opcode) {
                        Insn::Type(op, self.class(r.u2()?)?)
                    } else if let Some(op) = FieldOp::from_opcode(opcode) {
                        Insn::Field(op, self.member_at(r.u2()?)?)
                    } else if let Some(op) = InvokeOp::from_opcode(opcode) {
                        Insn::Invoke(op, self.member_at(r.u2()?)?)
                    } else {
                        return Err(DecodeError::BadOpcode {
                            offset: site,
                            opcode,
                        });
                    }
                }
            };
            insns.push((site, insn));
        }
        Ok(insns)
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use super::*;
    use crate::{
        classfile::emitter::{access, ClassBuilder, Method},
        runtime,
    };

    #[test]
    fn instructions_decode_to_their_symbolic_form() {
        let mut class = ClassBuilder::new("t/D", "java/lang/Object");
        let end = Label(9);
        let code = vec![
            Insn::PushLong(1 << 40),
            Insn::Op(Op::Pop2),
            Insn::Load(LocalKind::Reference, 0),
            Insn::Jump(Jump::IfNull, end),
            runtime::global_site("x"),
            Insn::Op(Op::Areturn),
            Insn::Label(end),
            Insn::Ldc(Loadable::String("s".into())),
            Insn::Op(Op::Areturn),
        ];
        class
            .add_method(Method::new(
                access::PUBLIC | access::STATIC,
                "f",
                "(Ljava/lang/Object;)Ljava/lang/Object;",
                code,
            ))
            .unwrap();
        let image = class.finish().unwrap();
        let_assert!(Ok(decoded) = ClassFile::parse(&image.bytes));

        let_assert!(Some(method) = decoded.method("f", "(Ljava/lang/Object;)Ljava/lang/Object;"));
        let_assert!(Some(code) = &method.code);
        let insns: Vec<_> = code.insns.iter().map(|(_, insn)| insn.clone()).collect();
        check!(
            insns
                == vec![
                    Insn::Ldc(Loadable::Long(1 << 40)),
                    Insn::Op(Op::Pop2),
                    Insn::Load(LocalKind::Reference, 0),
                    Insn::Jump(Jump::IfNull, Label(14)),
                    runtime::global_site("x"),
                    Insn::Op(Op::Areturn),
                    Insn::Ldc(Loadable::String("s".into())),
                    Insn::Op(Op::Areturn),
                ]
        );
        check!(decoded.bootstrap_methods.len() == 1);
    }

    #[test]
    fn garbage_is_rejected() {
        check!(ClassFile::parse(&[0xca, 0xfe]) == Err(DecodeError::Truncated(0)));
        check!(ClassFile::parse(&[0, 0, 0, 0, 0, 0]) == Err(DecodeError::BadMagic(0)));
    }
}
