//! Lowers forms into class images.
//!
//! Every top-level form becomes a unit class with a single
//! `public static Object run()` method, plus one class per function literal
//! it contains. For example
//!
//! ```text
//! (define add (function (x y) (+ x y)))
//! ```
//!
//! compiles to a `Fn` subclass whose `invoke` is
//!
//! ```text
//! aload_1
//! aload_2
//! invokedynamic call(Object, Object)Object  ; linkCall "+"
//! areturn
//! ```
//!
//! and a unit whose `run` loads the name, constructs the function and hands
//! both to `Linker.define`.
use log::debug;

use crate::{
    classfile::{
        assembler::AssembleError,
        emitter::{access, ClassBuilder, ClassImage, EmitError, Method},
        insn::{InvokeOp, Jump, Loadable, LocalKind, MemberRef, Op, TypeOp},
        Insn,
    },
    linker::Linker,
    runtime::{
        self, constructor_desc, mangle, Convention, Signature, APPLY_TO, APPLY_TO_DESC, DEFINE,
        DEFINE_DESC, DEFINE_MACRO, FN, KEYWORD, LINKER, OBJECT,
    },
    value::{Function, MacroError, Seq, Symbol, Value},
};

mod class;
pub mod environment;
mod inline_asm;
pub mod method;
mod quote;
pub mod special_forms;

use class::PendingClass;
use environment::{ClassId, Environment, Resolution, ScopeId, SlotOverflow};
use method::MethodBuilder;
use special_forms::{parse_bindings, FunctionForm, SpecialForm};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CompileError {
    #[error("malformed {form}: {message}")]
    Syntax { form: &'static str, message: String },
    #[error("recur is only allowed in tail position")]
    RecurNotInTail,
    #[error("recur outside of a function")]
    RecurOutsideFunction,
    #[error("recur with {found} arguments, the clause takes {expected}")]
    RecurArity { expected: usize, found: usize },
    #[error("{name} called with {found} arguments, accepts {signature}")]
    Arity {
        name: Symbol,
        signature: Signature,
        found: usize,
    },
    #[error("two clauses take {0} arguments")]
    DuplicateArity(usize),
    #[error("variadic clause overlaps another clause")]
    AmbiguousVariadic,
    #[error("macro {0} cannot be used as a value")]
    MacroAsValue(Symbol),
    #[error("expanding {name}: {source}")]
    Macro { name: Symbol, source: MacroError },
    #[error("macro expansion did not finish within {0} steps")]
    ExpansionLimit(usize),
    #[error("cannot quote a {0}")]
    Unquotable(&'static str),
    #[error("a {0} cannot appear in code")]
    Uncompilable(&'static str),
    #[error("unknown instruction {0}")]
    UnknownInstruction(String),
    #[error("class file version {0} has no invokedynamic")]
    UnsupportedVersion(u16),
    #[error(transparent)]
    TooManyLocals(#[from] SlotOverflow),
    #[error(transparent)]
    Emit(#[from] EmitError),
}

impl CompileError {
    pub fn syntax(form: &'static str, message: impl Into<String>) -> Self {
        Self::Syntax {
            form,
            message: message.into(),
        }
    }

    /// Whether this is the assembler rejecting generated code, which is a
    /// bug in the compiler (or in hand-written `asm`), not in the program.
    pub fn is_internal(&self) -> bool {
        let Self::Emit(EmitError::Assemble { source, .. }) = self else {
            return false;
        };
        !matches!(
            source,
            AssembleError::BranchOutOfRange { .. }
                | AssembleError::CodeTooLarge(_)
                | AssembleError::TooManySlots
                | AssembleError::Pool(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerOptions {
    /// Package of generated classes, in internal form with a trailing `/`.
    pub class_prefix: String,
    /// Class-file major version; 51 or later.
    pub major_version: u16,
    /// Written as the `SourceFile` attribute of every class.
    pub source_file: Option<String>,
    /// Upper bound on expansion steps for a single form.
    pub expansion_limit: Option<usize>,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            class_prefix: "lamina/gen/".into(),
            major_version: crate::classfile::emitter::DEFAULT_MAJOR_VERSION,
            source_file: None,
            expansion_limit: None,
        }
    }
}

/// The classes of one top-level form, to be loaded together. Nested
/// function classes come before the classes that construct them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledUnit {
    /// Internal name of the class whose `run()` evaluates the form.
    pub entry: String,
    pub classes: Vec<ClassImage>,
}

impl CompiledUnit {
    pub fn entry_image(&self) -> Option<&ClassImage> {
        self.classes.iter().find(|image| image.name == self.entry)
    }
}

pub struct Compiler<'l> {
    linker: &'l Linker,
    options: CompilerOptions,
    next_class: usize,
}

impl<'l> Compiler<'l> {
    pub fn new(linker: &'l Linker) -> Self {
        Self {
            linker,
            options: CompilerOptions::default(),
            next_class: 0,
        }
    }

    pub fn with_options(mut self, options: CompilerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &CompilerOptions {
        &self.options
    }

    pub fn compile(&mut self, form: &Value) -> Result<CompiledUnit, CompileError> {
        if self.options.major_version < 51 {
            return Err(CompileError::UnsupportedVersion(self.options.major_version));
        }
        let mut unit = Unit::new(self.linker, &self.options, &mut self.next_class);
        match unit.top_level(form) {
            Ok(unit) => Ok(unit),
            Err(err) => {
                unit.roll_back();
                Err(err)
            }
        }
    }
}

/// Lexical position of the expression being compiled.
#[derive(Debug, Clone, Copy)]
struct Ctx {
    scope: ScopeId,
    // the value of this expression is what the enclosing clause returns
    tail: bool,
}

impl Ctx {
    fn non_tail(self) -> Self {
        Self {
            tail: false,
            ..self
        }
    }

    fn within(self, scope: ScopeId) -> Self {
        Self { scope, ..self }
    }
}

/// State of compiling one top-level form.
struct Unit<'a> {
    linker: &'a Linker,
    options: &'a CompilerOptions,
    counter: &'a mut usize,
    env: Environment,
    root: ScopeId,
    classes: Vec<PendingClass>,
    images: Vec<ClassImage>,
    // globals declared ahead of their definition, with what they replaced
    declared: Vec<(Symbol, Option<Value>)>,
}

impl<'a> Unit<'a> {
    fn new(linker: &'a Linker, options: &'a CompilerOptions, counter: &'a mut usize) -> Self {
        let (env, root) = Environment::new();
        Self {
            linker,
            options,
            counter,
            env,
            root,
            classes: Vec::new(),
            images: Vec::new(),
            declared: Vec::new(),
        }
    }

    fn root(&self) -> Ctx {
        Ctx {
            scope: self.root,
            tail: false,
        }
    }

    fn class_name(&mut self, kind: &str, name: Option<&Symbol>) -> String {
        *self.counter += 1;
        let mut class = format!("{}{kind}${}", self.options.class_prefix, self.counter);
        if let Some(name) = name {
            class.push('$');
            class.push_str(&mangle(name.name()));
        }
        class
    }

    fn top_level(&mut self, form: &Value) -> Result<CompiledUnit, CompileError> {
        let mut m = MethodBuilder::new();
        let ctx = self.root();
        self.expr(&mut m, ctx, form)?;
        m.emit(Insn::Op(Op::Areturn));

        let entry = self.class_name("Unit", None);
        let mut class = ClassBuilder::new(&entry, OBJECT)
            .major_version(self.options.major_version)
            .source_file(self.options.source_file.clone());
        class.add_method(Method::new(
            access::PUBLIC | access::STATIC,
            "run",
            "()Ljava/lang/Object;",
            m.finish(),
        ))?;
        let mut classes = std::mem::take(&mut self.images);
        classes.push(class.finish()?);
        debug!("compiled {entry} with {} classes", classes.len());
        Ok(CompiledUnit { entry, classes })
    }

    fn roll_back(&mut self) {
        for (name, previous) in self.declared.drain(..).rev() {
            debug!("rolling back declaration of {name}");
            match previous {
                Some(value) => self.linker.insert(name.name(), value),
                None => self.linker.remove(name.name()),
            };
        }
    }

    fn expr(&mut self, m: &mut MethodBuilder, ctx: Ctx, form: &Value) -> Result<(), CompileError> {
        match form {
            Value::Nil => m.emit(Insn::Op(Op::AconstNull)),
            Value::Int(n) => {
                m.emit(Insn::PushLong(*n));
                m.emit(runtime::box_long());
            }
            Value::Str(text) => m.emit(Insn::Ldc(Loadable::String(text.to_string()))),
            Value::Keyword(kw) => m.emit_all(runtime::construct_named(KEYWORD, kw.name())),
            Value::Symbol(sym) => self.symbol(m, ctx, sym)?,
            Value::Seq(seq) if seq.is_empty() => m.emit(runtime::empty_seq()),
            Value::Seq(_) => match self.expand(ctx.scope, form.clone())? {
                Value::Seq(seq) if !seq.is_empty() => self.combination(m, ctx, &seq)?,
                expanded => self.expr(m, ctx, &expanded)?,
            },
            Value::Function(_) | Value::Macro(_) => {
                return Err(CompileError::Uncompilable(form.type_name()))
            }
        }
        Ok(())
    }

    /// Rewrites `form` until its head no longer names a macro.
    fn expand(&self, scope: ScopeId, mut form: Value) -> Result<Value, CompileError> {
        let mut steps = 0;
        loop {
            let Some((name, expander, args)) = self.macro_call(scope, &form) else {
                return Ok(form);
            };
            if let Some(limit) = self.options.expansion_limit {
                if steps >= limit {
                    return Err(CompileError::ExpansionLimit(limit));
                }
            }
            steps += 1;
            debug!("expanding {name}");
            form = expander
                .expand(&args)
                .map_err(|source| CompileError::Macro { name, source })?;
        }
    }

    fn macro_call(
        &self,
        scope: ScopeId,
        form: &Value,
    ) -> Option<(Symbol, crate::value::Macro, Seq)> {
        let seq = form.as_seq()?;
        let head = seq.first()?.as_symbol()?;
        if SpecialForm::from_symbol(head).is_some() || self.env.is_bound(scope, head) {
            return None;
        }
        match self.linker.lookup(head.name())? {
            Value::Macro(expander) => Some((head.clone(), expander, seq.rest())),
            _ => None,
        }
    }

    fn symbol(&mut self, m: &mut MethodBuilder, ctx: Ctx, sym: &Symbol) -> Result<(), CompileError> {
        match self.env.resolve(ctx.scope, sym) {
            Resolution::Local(slot) => m.emit(Insn::Load(LocalKind::Reference, slot)),
            Resolution::Captured(crossed) => {
                for class in &crossed {
                    self.classes[class.0].capture(sym);
                }
                let field = self.classes[crossed[0].0].field(sym);
                m.emit(Insn::Load(LocalKind::Reference, 0));
                m.emit(Insn::Field(crate::classfile::insn::FieldOp::GetField, field));
            }
            Resolution::Global => {
                if let Some(Value::Macro(_)) = self.linker.lookup(sym.name()) {
                    return Err(CompileError::MacroAsValue(sym.clone()));
                }
                m.emit(runtime::global_site(sym.name()));
            }
        }
        Ok(())
    }

    /// A non-empty list that is not a macro use.
    fn combination(
        &mut self,
        m: &mut MethodBuilder,
        ctx: Ctx,
        seq: &Seq,
    ) -> Result<(), CompileError> {
        let args = seq.rest();
        if let Some(Value::Symbol(head)) = seq.first() {
            if let Some(form) = SpecialForm::from_symbol(head) {
                return self.special(m, ctx, form, &args);
            }
        }
        self.call(m, ctx, seq.first().cloned().unwrap_or_default(), &args)
    }

    fn special(
        &mut self,
        m: &mut MethodBuilder,
        ctx: Ctx,
        form: SpecialForm,
        args: &Seq,
    ) -> Result<(), CompileError> {
        match form {
            SpecialForm::Quote => match &args.to_vec()[..] {
                [datum] => quote::emit(m, datum),
                _ => Err(CompileError::syntax("quote", "expected exactly one datum")),
            },
            SpecialForm::If => self.if_(m, ctx, args),
            SpecialForm::Do => self.body(m, ctx, args),
            SpecialForm::Recur => self.recur(m, ctx, args),
            SpecialForm::Let => self.let_(m, ctx, args),
            SpecialForm::Function => self
                .function(m, ctx, args, None, Convention::Plain)
                .map(drop),
            SpecialForm::Define => self.define(m, ctx, args),
            SpecialForm::DefineMacro => self.define_macro(m, ctx, args),
            SpecialForm::Asm => self.asm(m, ctx, args),
            SpecialForm::Unescape => Err(CompileError::syntax("unescape", "only allowed inside asm")),
        }
    }

    /// Evaluates `forms` in order, keeping the value of the last one.
    fn body(&mut self, m: &mut MethodBuilder, ctx: Ctx, forms: &Seq) -> Result<(), CompileError> {
        if forms.is_empty() {
            m.emit(Insn::Op(Op::AconstNull));
            return Ok(());
        }
        let last = forms.len() - 1;
        for (i, form) in forms.iter().enumerate() {
            if i == last {
                self.expr(m, ctx, form)?;
            } else {
                self.expr(m, ctx.non_tail(), form)?;
                m.emit(Insn::Op(Op::Pop));
            }
        }
        Ok(())
    }

    fn if_(&mut self, m: &mut MethodBuilder, ctx: Ctx, args: &Seq) -> Result<(), CompileError> {
        let (test, then, otherwise) = match &args.to_vec()[..] {
            [test, then] => (test.clone(), then.clone(), None),
            [test, then, otherwise] => (test.clone(), then.clone(), Some(otherwise.clone())),
            _ => return Err(CompileError::syntax("if", "expected a test and one or two arms")),
        };
        let (else_label, end) = (m.label(), m.label());

        self.expr(m, ctx.non_tail(), &test)?;
        m.emit(runtime::if_nil(else_label));
        self.expr(m, ctx, &then)?;
        m.emit(Insn::Jump(Jump::Goto, end));
        m.bind(else_label);
        match otherwise {
            Some(otherwise) => self.expr(m, ctx, &otherwise)?,
            None => m.emit(Insn::Op(Op::AconstNull)),
        }
        m.bind(end);
        Ok(())
    }

    fn let_(&mut self, m: &mut MethodBuilder, ctx: Ctx, args: &Seq) -> Result<(), CompileError> {
        let bindings = args
            .first()
            .ok_or_else(|| CompileError::syntax("let", "missing binding list"))?;
        let bindings = parse_bindings(bindings)?;

        let scope = self.env.push(ctx.scope);
        let inner = ctx.within(scope);
        for (name, init) in bindings {
            self.expr(m, inner.non_tail(), &init)?;
            let slot = self.env.bind(scope, name)?;
            m.emit(Insn::Store(LocalKind::Reference, slot));
        }
        self.body(m, inner, &args.rest())
    }

    fn recur(&mut self, m: &mut MethodBuilder, ctx: Ctx, args: &Seq) -> Result<(), CompileError> {
        let Some(slots) = m.recur_slots().map(<[u16]>::to_vec) else {
            return Err(CompileError::RecurOutsideFunction);
        };
        if !ctx.tail {
            return Err(CompileError::RecurNotInTail);
        }
        if args.len() != slots.len() {
            return Err(CompileError::RecurArity {
                expected: slots.len(),
                found: args.len(),
            });
        }
        // all arguments are evaluated before any parameter is overwritten
        for arg in args {
            self.expr(m, ctx.non_tail(), arg)?;
        }
        for slot in slots.iter().rev() {
            m.emit(Insn::Store(LocalKind::Reference, *slot));
        }
        let top = m.loop_label();
        m.emit(Insn::Jump(Jump::Goto, top));
        Ok(())
    }

    /// Compiles a function literal into its own class and leaves a new
    /// instance on the stack.
    fn function(
        &mut self,
        m: &mut MethodBuilder,
        ctx: Ctx,
        args: &Seq,
        name_hint: Option<&Symbol>,
        convention: Convention,
    ) -> Result<ClassId, CompileError> {
        let form = FunctionForm::parse(args)?;
        let fn_name = form.name.as_ref().or(name_hint).cloned();
        let id = ClassId(self.classes.len());
        let class_name = self.class_name("Fn", fn_name.as_ref());
        self.classes
            .push(PendingClass::new(class_name.clone(), fn_name, convention));

        for clause in &form.clauses {
            let scope = self.env.push_boundary(ctx.scope, id);
            if let Some(name) = &form.name {
                self.env.bind_at(scope, name.clone(), 0);
            }
            let mut slots = Vec::new();
            for param in clause.params.iter().chain(&clause.rest) {
                slots.push(self.env.bind(scope, param.clone())?);
            }
            let mut method = MethodBuilder::for_clause(slots);
            let body = Ctx { scope, tail: true };
            self.body(&mut method, body, &clause.body)?;
            method.emit(Insn::Op(Op::Areturn));
            self.classes[id.0].add_clause(clause.arity(), method.finish());
        }

        let captures = self.classes[id.0].captures().to_vec();
        m.emit(Insn::Type(TypeOp::New, class_name.clone()));
        m.emit(Insn::Op(Op::Dup));
        for sym in &captures {
            self.symbol(m, ctx.non_tail(), sym)?;
        }
        m.emit(Insn::Invoke(
            InvokeOp::Special,
            MemberRef::new(&class_name, "<init>", constructor_desc(captures.len())),
        ));

        let image = self.classes[id.0].emit(self.options)?;
        debug!("emitted {} ({} captures)", image.name, captures.len());
        self.images.push(image);
        Ok(id)
    }

    fn call(
        &mut self,
        m: &mut MethodBuilder,
        ctx: Ctx,
        head: Value,
        args: &Seq,
    ) -> Result<(), CompileError> {
        let argc = args.len();
        if let Value::Symbol(name) = &head {
            if let Some(function) = self.known_function(ctx.scope, name) {
                if function.convention() == Convention::Macro {
                    return Err(CompileError::MacroAsValue(name.clone()));
                }
                if !function.signature().accepts(argc) {
                    return Err(CompileError::Arity {
                        name: name.clone(),
                        signature: function.signature().clone(),
                        found: argc,
                    });
                }
                for arg in args {
                    self.expr(m, ctx.non_tail(), arg)?;
                }
                m.emit(runtime::call_site(name.name(), argc));
                return Ok(());
            }
        }

        self.expr(m, ctx.non_tail(), &head)?;
        m.emit_all(runtime::as_fn(&head.to_string()));
        let len = i32::try_from(argc).map_err(|_| CompileError::syntax("call", "too many arguments"))?;
        m.emit(Insn::PushInt(len));
        m.emit(Insn::Type(TypeOp::ANewArray, OBJECT.into()));
        for (i, arg) in args.iter().enumerate() {
            m.emit(Insn::Op(Op::Dup));
            m.emit(Insn::PushInt(i as i32));
            self.expr(m, ctx.non_tail(), arg)?;
            m.emit(Insn::Op(Op::Aastore));
        }
        m.emit(Insn::Invoke(
            InvokeOp::Virtual,
            MemberRef::new(FN, APPLY_TO, APPLY_TO_DESC),
        ));
        Ok(())
    }

    /// A global the linker knows to be a function, unless shadowed.
    fn known_function(&self, scope: ScopeId, name: &Symbol) -> Option<Function> {
        if self.env.is_bound(scope, name) {
            return None;
        }
        match self.linker.lookup(name.name())? {
            Value::Function(function) => Some(function),
            _ => None,
        }
    }

    fn define(&mut self, m: &mut MethodBuilder, ctx: Ctx, args: &Seq) -> Result<(), CompileError> {
        let (name, value) = match &args.to_vec()[..] {
            [Value::Symbol(name), value] => (name.clone(), value.clone()),
            _ => return Err(CompileError::syntax("define", "expected a name and a value")),
        };
        let value = self.expand(ctx.scope, value)?;

        m.emit(Insn::Ldc(Loadable::String(name.name().into())));
        match value.as_seq() {
            Some(literal) if SpecialForm::Function.heads(&value) => {
                let literal = literal.rest();
                // declared up front so the body and later forms can call it
                let signature = FunctionForm::parse(&literal)?.signature();
                let convention = match signature.variadic() {
                    Some(_) => Convention::Variadic,
                    None => Convention::Plain,
                };
                let declaration = Function::declared(Some(name.clone()), signature, convention);
                let previous = self.linker.insert(name.name(), Value::Function(declaration));
                self.declared.push((name.clone(), previous));
                self.function(m, ctx.non_tail(), &literal, Some(&name), Convention::Plain)?;
            }
            _ => self.expr(m, ctx.non_tail(), &value)?,
        }
        m.emit(Insn::Invoke(
            InvokeOp::Static,
            MemberRef::new(LINKER, DEFINE, DEFINE_DESC),
        ));
        Ok(())
    }

    fn define_macro(
        &mut self,
        m: &mut MethodBuilder,
        ctx: Ctx,
        args: &Seq,
    ) -> Result<(), CompileError> {
        let Some(Value::Symbol(name)) = args.first() else {
            return Err(CompileError::syntax("define-macro", "expected a name"));
        };
        let name = name.clone();
        m.emit(Insn::Ldc(Loadable::String(name.name().into())));
        self.function(m, ctx.non_tail(), &args.rest(), Some(&name), Convention::Macro)?;
        m.emit(Insn::Invoke(
            InvokeOp::Static,
            MemberRef::new(LINKER, DEFINE_MACRO, DEFINE_DESC),
        ));
        Ok(())
    }
}
