//! Function literals waiting for their class to be generated.
use std::{collections::HashMap, mem};

use super::{method::MethodBuilder, CompilerOptions};
use crate::{
    classfile::{
        emitter::{access, Annotation, ClassBuilder, ClassImage, ElementValue, EmitError, Method},
        insn::{FieldOp, InvokeOp, Jump, Loadable, LocalKind, MemberRef, Op, TypeOp},
        Insn,
    },
    runtime::{
        self, constructor_desc, mangle, object_method_desc, Arity, Convention, Signature,
        APPLY_TO, APPLY_TO_DESC, ARITY_EXCEPTION, FN, INVOKE, INVOKE_VARIADIC, MACRO_ANNOTATION,
        OBJECT_DESC, VARIADIC_ANNOTATION,
    },
    value::Symbol,
};

/// A function literal whose clauses are still being compiled. Captures can
/// be added until the class is emitted, since a nested literal may reach
/// through this one.
#[derive(Debug)]
pub struct PendingClass {
    name: String,
    fn_name: Option<Symbol>,
    captures: Vec<Symbol>,
    clauses: Vec<(Arity, Vec<Insn>)>,
    convention: Convention,
}

impl PendingClass {
    pub fn new(name: String, fn_name: Option<Symbol>, convention: Convention) -> Self {
        Self {
            name,
            fn_name,
            captures: Vec::new(),
            clauses: Vec::new(),
            convention,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capture(&mut self, sym: &Symbol) {
        if !self.captures.contains(sym) {
            self.captures.push(sym.clone());
        }
    }

    pub fn captures(&self) -> &[Symbol] {
        &self.captures
    }

    pub fn add_clause(&mut self, arity: Arity, code: Vec<Insn>) {
        self.clauses.push((arity, code));
    }

    /// The field holding a captured value.
    pub fn field(&self, sym: &Symbol) -> MemberRef {
        MemberRef::new(&self.name, mangle(sym.name()), OBJECT_DESC)
    }

    /// How `ArityException` names this function.
    fn display_name(&self) -> &str {
        self.fn_name.as_ref().map_or(&self.name, Symbol::name)
    }

    pub fn emit(&mut self, options: &CompilerOptions) -> Result<ClassImage, EmitError> {
        let clauses = mem::take(&mut self.clauses);
        let signature = Signature::new(clauses.iter().map(|(arity, _)| *arity));

        let mut class = ClassBuilder::new(&self.name, FN)
            .major_version(options.major_version)
            .source_file(options.source_file.clone());
        for sym in &self.captures {
            class.add_field(access::PRIVATE | access::FINAL, &mangle(sym.name()), OBJECT_DESC)?;
        }
        class.add_method(self.constructor())?;

        for (arity, code) in clauses {
            let mut method = match arity {
                Arity::Exact(n) => Method::new(access::PUBLIC, INVOKE, object_method_desc(n), code),
                Arity::Min(n) => {
                    Method::new(access::PUBLIC, INVOKE_VARIADIC, object_method_desc(n + 1), code)
                        .annotate(
                            Annotation::marker(VARIADIC_ANNOTATION)
                                .with("min", ElementValue::Int(n as i32)),
                        )
                }
            };
            if self.convention == Convention::Macro {
                method = method.annotate(Annotation::marker(MACRO_ANNOTATION));
            }
            class.add_method(method)?;
        }

        class.add_method(Method::new(
            access::PUBLIC,
            APPLY_TO,
            APPLY_TO_DESC,
            self.dispatch(&signature),
        ))?;
        class.finish()
    }

    fn constructor(&self) -> Method {
        let mut code = vec![
            Insn::Load(LocalKind::Reference, 0),
            Insn::Invoke(InvokeOp::Special, MemberRef::new(FN, "<init>", "()V")),
        ];
        for (i, sym) in self.captures.iter().enumerate() {
            code.push(Insn::Load(LocalKind::Reference, 0));
            code.push(Insn::Load(LocalKind::Reference, i as u16 + 1));
            code.push(Insn::Field(FieldOp::PutField, self.field(sym)));
        }
        code.push(Insn::Op(Op::Return));
        Method::new(
            access::PUBLIC,
            "<init>",
            constructor_desc(self.captures.len()),
            code,
        )
    }

    /// `applyTo(Object[])`: picks a clause by the length of the argument
    /// array and spreads the array over its parameters.
    fn dispatch(&self, signature: &Signature) -> Vec<Insn> {
        let mut m = MethodBuilder::new();
        let error = m.label();
        let fixed: Vec<usize> = signature.fixed().collect();

        match (&fixed[..], signature.variadic()) {
            ([n], None) => {
                m.emit(Insn::Load(LocalKind::Reference, 1));
                m.emit(Insn::Op(Op::Arraylength));
                m.emit(Insn::PushInt(*n as i32));
                m.emit(Insn::Jump(Jump::IfIcmpne, error));
                self.invoke_fixed(&mut m, *n);
            }
            (fixed, variadic) => {
                let fallback = m.label();
                if let (Some(&low), Some(&high)) = (fixed.first(), fixed.last()) {
                    let cases: HashMap<usize, _> = fixed.iter().map(|n| (*n, m.label())).collect();
                    m.emit(Insn::Load(LocalKind::Reference, 1));
                    m.emit(Insn::Op(Op::Arraylength));
                    m.emit(Insn::TableSwitch {
                        low: low as i32,
                        default: fallback,
                        targets: (low..=high)
                            .map(|n| cases.get(&n).copied().unwrap_or(fallback))
                            .collect(),
                    });
                    for n in fixed {
                        m.bind(cases[n]);
                        self.invoke_fixed(&mut m, *n);
                    }
                }
                m.bind(fallback);
                if let Some(min) = variadic {
                    m.emit(Insn::Load(LocalKind::Reference, 1));
                    m.emit(Insn::Op(Op::Arraylength));
                    m.emit(Insn::PushInt(min as i32));
                    m.emit(Insn::Jump(Jump::IfIcmplt, error));
                    self.spread(&mut m, min);
                    m.emit(Insn::Load(LocalKind::Reference, 1));
                    m.emit(Insn::PushInt(min as i32));
                    m.emit(runtime::array_seq());
                    m.emit(Insn::Invoke(
                        InvokeOp::Virtual,
                        MemberRef::new(&self.name, INVOKE_VARIADIC, object_method_desc(min + 1)),
                    ));
                    m.emit(Insn::Op(Op::Areturn));
                }
            }
        }

        m.bind(error);
        m.emit_all([
            Insn::Type(TypeOp::New, ARITY_EXCEPTION.into()),
            Insn::Op(Op::Dup),
            Insn::Ldc(Loadable::String(self.display_name().into())),
            Insn::Load(LocalKind::Reference, 1),
            Insn::Op(Op::Arraylength),
            Insn::Invoke(
                InvokeOp::Special,
                MemberRef::new(ARITY_EXCEPTION, "<init>", "(Ljava/lang/String;I)V"),
            ),
            Insn::Op(Op::Athrow),
        ]);
        m.finish()
    }

    // this, then args[0..n]
    fn spread(&self, m: &mut MethodBuilder, n: usize) {
        m.emit(Insn::Load(LocalKind::Reference, 0));
        for i in 0..n {
            m.emit(Insn::Load(LocalKind::Reference, 1));
            m.emit(Insn::PushInt(i as i32));
            m.emit(Insn::Op(Op::Aaload));
        }
    }

    fn invoke_fixed(&self, m: &mut MethodBuilder, n: usize) {
        self.spread(m, n);
        m.emit(Insn::Invoke(
            InvokeOp::Virtual,
            MemberRef::new(&self.name, INVOKE, object_method_desc(n)),
        ));
        m.emit(Insn::Op(Op::Areturn));
    }
}
