//! Lays out whole class images.
use super::{
    assembler::{assemble, AssembleError},
    descriptor::{field_type, DescriptorError},
    frames::{write_table, Frame},
    pool::{Constant, ConstantPool, PoolError},
    Insn, WriteBytes,
};

/// Access flags for classes, fields and methods.
pub mod access {
    pub const PUBLIC: u16 = 0x0001;
    pub const PRIVATE: u16 = 0x0002;
    pub const STATIC: u16 = 0x0008;
    pub const FINAL: u16 = 0x0010;
    pub const SUPER: u16 = 0x0020;
    pub const ABSTRACT: u16 = 0x0400;
    pub const SYNTHETIC: u16 = 0x1000;
}

pub const MAGIC: u32 = 0xCAFE_BABE;
/// Java 8. `invokedynamic` needs at least 51.
pub const DEFAULT_MAJOR_VERSION: u16 = 52;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum EmitError {
    #[error("in method {method}{descriptor}: {source}")]
    Assemble {
        method: String,
        descriptor: String,
        source: AssembleError,
    },
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Descriptor(#[from] DescriptorError),
    #[error("attribute of {0} bytes is too large")]
    AttributeTooLarge(usize),
    #[error("too many fields or methods")]
    TooManyMembers,
}

/// An annotation element value. Only the forms the compiler emits are modeled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElementValue {
    Int(i32),
}

/// A runtime-visible annotation: type descriptor plus named elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub descriptor: String,
    pub elements: Vec<(String, ElementValue)>,
}

impl Annotation {
    pub fn marker(descriptor: impl Into<String>) -> Self {
        Self {
            descriptor: descriptor.into(),
            elements: Vec::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: ElementValue) -> Self {
        self.elements.push((name.into(), value));
        self
    }
}

/// A method waiting to be assembled into a class.
#[derive(Debug, Clone)]
pub struct Method {
    pub flags: u16,
    pub name: String,
    pub descriptor: String,
    pub code: Vec<Insn>,
    pub annotations: Vec<Annotation>,
}

impl Method {
    pub fn new(
        flags: u16,
        name: impl Into<String>,
        descriptor: impl Into<String>,
        code: Vec<Insn>,
    ) -> Self {
        Self {
            flags,
            name: name.into(),
            descriptor: descriptor.into(),
            code,
            annotations: Vec::new(),
        }
    }

    pub fn annotate(mut self, annotation: Annotation) -> Self {
        self.annotations.push(annotation);
        self
    }
}

/// A finished class file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassImage {
    /// Internal name (`lamina/gen/Fn$1`).
    pub name: String,
    pub bytes: Vec<u8>,
}

pub struct ClassBuilder {
    name: String,
    super_name: String,
    flags: u16,
    major_version: u16,
    source_file: Option<String>,
    pool: ConstantPool,
    field_count: u16,
    fields: Vec<u8>,
    method_count: u16,
    methods: Vec<u8>,
}

fn attribute(
    pool: &mut ConstantPool,
    name: &str,
    body: &[u8],
    out: &mut Vec<u8>,
) -> Result<(), EmitError> {
    let len = u32::try_from(body.len()).map_err(|_| EmitError::AttributeTooLarge(body.len()))?;
    out.u2(pool.utf8(name)?);
    out.u4(len);
    out.extend_from_slice(body);
    Ok(())
}

impl ClassBuilder {
    pub fn new(name: impl Into<String>, super_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            super_name: super_name.into(),
            flags: access::PUBLIC | access::FINAL | access::SUPER,
            major_version: DEFAULT_MAJOR_VERSION,
            source_file: None,
            pool: ConstantPool::new(),
            field_count: 0,
            fields: Vec::new(),
            method_count: 0,
            methods: Vec::new(),
        }
    }

    pub fn flags(mut self, flags: u16) -> Self {
        self.flags = flags;
        self
    }

    pub fn major_version(mut self, major: u16) -> Self {
        self.major_version = major;
        self
    }

    pub fn source_file(mut self, file: Option<String>) -> Self {
        self.source_file = file;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&mut self) -> &mut ConstantPool {
        &mut self.pool
    }

    pub fn add_field(&mut self, flags: u16, name: &str, descriptor: &str) -> Result<(), EmitError> {
        field_type(descriptor)?;
        self.field_count = self
            .field_count
            .checked_add(1)
            .ok_or(EmitError::TooManyMembers)?;
        self.fields.u2(flags);
        self.fields.u2(self.pool.utf8(name)?);
        self.fields.u2(self.pool.utf8(descriptor)?);
        self.fields.u2(0);
        Ok(())
    }

    /// Assembles `method` against this class's pool and appends it.
    pub fn add_method(&mut self, method: Method) -> Result<(), EmitError> {
        let wrap = |source| EmitError::Assemble {
            method: method.name.clone(),
            descriptor: method.descriptor.clone(),
            source,
        };
        let initial = Frame::for_method(
            &self.name,
            &method.descriptor,
            method.flags & access::STATIC != 0,
            method.name == "<init>",
        )?;
        let code = assemble(&mut self.pool, &self.name, &initial, &method.code).map_err(wrap)?;

        let mut body = Vec::new();
        body.u2(code.max_stack);
        body.u2(code.max_locals);
        body.u4(code.bytes.len() as u32);
        body.extend_from_slice(&code.bytes);
        body.u2(0); // exception table
        if code.frames.is_empty() {
            body.u2(0);
        } else {
            body.u2(1);
            let table = write_table(&mut self.pool, &code.frames)?;
            attribute(&mut self.pool, "StackMapTable", &table, &mut body)?;
        }

        self.method_count = self
            .method_count
            .checked_add(1)
            .ok_or(EmitError::TooManyMembers)?;
        self.methods.u2(method.flags);
        self.methods.u2(self.pool.utf8(&method.name)?);
        self.methods.u2(self.pool.utf8(&method.descriptor)?);
        self.methods.u2(if method.annotations.is_empty() { 1 } else { 2 });
        attribute(&mut self.pool, "Code", &body, &mut self.methods)?;
        if !method.annotations.is_empty() {
            let annotations = self.annotations(&method.annotations)?;
            attribute(
                &mut self.pool,
                "RuntimeVisibleAnnotations",
                &annotations,
                &mut self.methods,
            )?;
        }
        log::trace!(
            "{}.{}{}: {} bytes of code",
            self.name,
            method.name,
            method.descriptor,
            code.bytes.len()
        );
        Ok(())
    }

    fn annotations(&mut self, annotations: &[Annotation]) -> Result<Vec<u8>, EmitError> {
        let mut out = Vec::new();
        out.u2(annotations.len() as u16);
        for annotation in annotations {
            out.u2(self.pool.utf8(&annotation.descriptor)?);
            out.u2(annotation.elements.len() as u16);
            for (name, value) in &annotation.elements {
                out.u2(self.pool.utf8(name)?);
                match value {
                    ElementValue::Int(int) => {
                        out.u1(b'I');
                        out.u2(self.pool.insert(&Constant::Integer(*int))?);
                    }
                }
            }
        }
        Ok(out)
    }

    /// Lays out the class file.
    ///
    /// The body goes first because writing it may still intern constants;
    /// the header and pool are prepended once the pool is final.
    pub fn finish(mut self) -> Result<ClassImage, EmitError> {
        let mut body = Vec::new();
        body.u2(self.flags);
        body.u2(self.pool.class(&self.name)?);
        body.u2(self.pool.class(&self.super_name)?);
        body.u2(0); // interfaces
        body.u2(self.field_count);
        body.extend_from_slice(&self.fields);
        body.u2(self.method_count);
        body.extend_from_slice(&self.methods);

        let mut attributes = Vec::new();
        let mut attribute_count = 0u16;
        if let Some(file) = &self.source_file {
            let mut index = Vec::new();
            index.u2(self.pool.utf8(file)?);
            attribute(&mut self.pool, "SourceFile", &index, &mut attributes)?;
            attribute_count += 1;
        }
        if self.pool.has_bootstraps() {
            let table = self.pool.bootstrap_table();
            attribute(&mut self.pool, "BootstrapMethods", &table, &mut attributes)?;
            attribute_count += 1;
        }
        body.u2(attribute_count);
        body.extend_from_slice(&attributes);

        let mut bytes = Vec::with_capacity(10 + self.pool.bytes().len() + body.len());
        bytes.u4(MAGIC);
        bytes.u2(0);
        bytes.u2(self.major_version);
        bytes.u2(self.pool.count());
        bytes.extend_from_slice(self.pool.bytes());
        bytes.extend_from_slice(&body);

        log::debug!("emitted class {} ({} bytes)", self.name, bytes.len());
        Ok(ClassImage {
            name: self.name,
            bytes,
        })
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use super::*;
    use crate::classfile::{
        decode::ClassFile,
        descriptor::VType,
        frames::StackMapFrame,
        insn::{LocalKind, Op},
        Label,
    };

    #[test]
    fn minimal_class_layout() {
        let mut class = ClassBuilder::new("t/Unit", "java/lang/Object")
            .source_file(Some("unit.lam".into()));
        class
            .add_method(Method::new(
                access::PUBLIC | access::STATIC,
                "run",
                "()Ljava/lang/Object;",
                vec![Insn::Op(Op::AconstNull), Insn::Op(Op::Areturn)],
            ))
            .unwrap();
        let_assert!(Ok(image) = class.finish());

        check!(image.name == "t/Unit");
        check!(image.bytes[..4] == [0xca, 0xfe, 0xba, 0xbe]);
        check!(image.bytes[4..8] == [0, 0, 0, 52]);

        let_assert!(Ok(decoded) = ClassFile::parse(&image.bytes));
        check!(decoded.name == "t/Unit");
        check!(decoded.super_name == "java/lang/Object");
        check!(decoded.source_file.as_deref() == Some("unit.lam"));
        let_assert!([run] = decoded.methods.as_slice());
        check!(run.name == "run");
        let_assert!(Some(code) = &run.code);
        check!(code.bytes == vec![0x01, 0xb0]);
        check!(code.max_stack == 1);
        check!(code.stack_map.is_empty());
    }

    #[test]
    fn annotations_and_stack_maps() {
        let mut class = ClassBuilder::new("t/F", "java/lang/Object");
        class.add_field(access::PRIVATE | access::FINAL, "x", "Ljava/lang/Object;").unwrap();
        let end = Label(0);
        class
            .add_method(
                Method::new(
                    access::PUBLIC,
                    "invoke",
                    "(Ljava/lang/Object;)Ljava/lang/Object;",
                    vec![
                        Insn::Load(LocalKind::Reference, 1),
                        Insn::Op(Op::Dup),
                        Insn::Jump(crate::classfile::insn::Jump::IfNonNull, end),
                        Insn::Op(Op::Pop),
                        Insn::Op(Op::AconstNull),
                        Insn::Label(end),
                        Insn::Op(Op::Areturn),
                    ],
                )
                .annotate(Annotation::marker("Lt/Marker;").with("min", ElementValue::Int(2))),
            )
            .unwrap();
        let_assert!(Ok(image) = class.finish());
        let_assert!(Ok(decoded) = ClassFile::parse(&image.bytes));

        check!(decoded.fields.len() == 1);
        check!(decoded.fields[0].name == "x");
        let method = &decoded.methods[0];
        check!(method.annotations == vec![Annotation::marker("Lt/Marker;").with("min", ElementValue::Int(2))]);
        let_assert!(Some(code) = &method.code);
        check!(
            code.stack_map
                == vec![StackMapFrame::SameLocals1 {
                    delta: 7,
                    stack: VType::object("java/lang/Object"),
                }]
        );
    }

    #[test]
    fn assembler_errors_name_the_method() {
        let mut class = ClassBuilder::new("t/Bad", "java/lang/Object");
        let err = class
            .add_method(Method::new(access::PUBLIC | access::STATIC, "f", "()V", vec![]))
            .unwrap_err();
        check!(err.to_string() == "in method f()V: control falls off the end of the method");
    }
}
