//! A small interpreter for the instructions the compiler emits, standing in
//! for the JVM and the `lamina/lang` runtime classes.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Weak,
    },
};

use lamina::{
    classfile::{
        decode::{ClassFile, DecodeError, MethodInfo},
        descriptor::method_type,
        insn::{FieldOp, InvokeOp, Jump, Loadable, MemberRef, Op, TypeOp},
        pool::Constant,
        Insn,
    },
    linker,
    runtime::{self, Arity, Convention, Signature},
    CallSite, CompileError, CompiledUnit, Compiler, CompilerOptions, Function, LinkError, Linker,
    Macro, MacroError, ReadError, Reader, Seq, Value,
};
use parking_lot::Mutex;

#[derive(thiserror::Error, Debug)]
pub enum Trap {
    #[error("{name} called with {argc} arguments")]
    Arity { name: String, argc: i32 },
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error(transparent)]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("{0}")]
    Runtime(String),
}

fn fault<T>(message: impl Into<String>) -> Result<T, Trap> {
    Err(Trap::Runtime(message.into()))
}

/// An instance of a generated `Fn` subclass.
pub struct Instance {
    pub class: Arc<ClassFile>,
    fields: Mutex<HashMap<String, Value>>,
}

impl Instance {
    pub fn field_count(&self) -> usize {
        self.class.fields.len()
    }
}

struct Native(NativeFn);

#[derive(Clone)]
enum Ref {
    Value(Value),
    Array(Arc<Mutex<Vec<Value>>>),
    Uninit(u64, String),
    Exception(String, i32),
}

#[derive(Clone)]
enum Slot {
    Int(i32),
    Long(i64),
    Ref(Ref),
    Top,
}

impl Slot {
    fn value(v: Value) -> Self {
        Slot::Ref(Ref::Value(v))
    }

    fn into_value(self) -> Result<Value, Trap> {
        match self {
            Slot::Ref(Ref::Value(v)) => Ok(v),
            _ => fault("expected an object"),
        }
    }

    fn int(self) -> Result<i32, Trap> {
        match self {
            Slot::Int(n) => Ok(n),
            _ => fault("expected an int"),
        }
    }

    fn long(self) -> Result<i64, Trap> {
        match self {
            Slot::Long(n) => Ok(n),
            _ => fault("expected a long"),
        }
    }
}

fn truth(b: bool) -> Value {
    if b {
        Value::symbol("true")
    } else {
        Value::Nil
    }
}

fn ints(args: &[Value]) -> Result<Vec<i64>, Trap> {
    args.iter()
        .map(|v| match v.as_int() {
            Some(n) => Ok(n),
            None => fault(format!("not an integer: {v}")),
        })
        .collect()
}

fn seq_of(v: &Value) -> Result<Seq, Trap> {
    match v {
        Value::Seq(s) => Ok(s.clone()),
        Value::Nil => Ok(Seq::EMPTY),
        _ => fault(format!("not a sequence: {v}")),
    }
}

type NativeFn = fn(&[Value]) -> Result<Value, Trap>;

fn natives() -> [(&'static str, Signature, NativeFn); 10] {
    [
        ("+", Signature::new([Arity::Min(0)]), |a| {
            Ok(Value::Int(ints(a)?.iter().sum()))
        }),
        ("*", Signature::new([Arity::Min(0)]), |a| {
            Ok(Value::Int(ints(a)?.iter().product()))
        }),
        ("-", Signature::new([Arity::Min(1)]), |a| {
            let n = ints(a)?;
            Ok(Value::Int(match &n[..] {
                [x] => -x,
                [x, rest @ ..] => rest.iter().fold(*x, |acc, y| acc - y),
                [] => 0,
            }))
        }),
        ("=", Signature::new([Arity::Exact(2)]), |a| Ok(truth(a[0] == a[1]))),
        ("<", Signature::new([Arity::Exact(2)]), |a| {
            let n = ints(a)?;
            Ok(truth(n[0] < n[1]))
        }),
        ("zero?", Signature::new([Arity::Exact(1)]), |a| {
            Ok(truth(ints(a)?[0] == 0))
        }),
        ("list", Signature::new([Arity::Min(0)]), |a| {
            Ok(Value::Seq(Seq::list(a.iter().cloned())))
        }),
        ("first", Signature::new([Arity::Exact(1)]), |a| {
            Ok(seq_of(&a[0])?.first().cloned().unwrap_or_default())
        }),
        ("rest", Signature::new([Arity::Exact(1)]), |a| {
            Ok(Value::Seq(seq_of(&a[0])?.rest()))
        }),
        ("cons", Signature::new([Arity::Exact(2)]), |a| {
            Ok(Value::Seq(Seq::cons(a[0].clone(), seq_of(&a[1])?)))
        }),
    ]
}

pub struct Machine {
    linker: Arc<Linker>,
    classes: Mutex<HashMap<String, Arc<ClassFile>>>,
    sites: Mutex<HashMap<(String, u32), Arc<CallSite>>>,
    next_object: AtomicU64,
    next_prefix: AtomicU64,
    depth: AtomicUsize,
    max_depth: AtomicUsize,
    this: Weak<Machine>,
}

impl Machine {
    pub fn new() -> Arc<Self> {
        let linker = Arc::new(Linker::with_prelude());
        for (name, signature, f) in natives() {
            let native = Function::declared(Some(name.into()), signature, Convention::Plain)
                .with_payload(Arc::new(Native(f)));
            linker.insert(name, Value::Function(native));
        }
        Arc::new_cyclic(|this| Self {
            linker,
            classes: Mutex::new(HashMap::new()),
            sites: Mutex::new(HashMap::new()),
            next_object: AtomicU64::new(0),
            next_prefix: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
            max_depth: AtomicUsize::new(0),
            this: this.clone(),
        })
    }

    pub fn linker(&self) -> &Linker {
        &self.linker
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth.load(Ordering::Relaxed)
    }

    pub fn reset_depth(&self) {
        self.max_depth.store(0, Ordering::Relaxed);
    }

    pub fn class(&self, name: &str) -> Option<Arc<ClassFile>> {
        self.classes.lock().get(name).cloned()
    }

    pub fn compiler(&self) -> Compiler<'_> {
        let n = self.next_prefix.fetch_add(1, Ordering::Relaxed);
        Compiler::new(&self.linker).with_options(CompilerOptions {
            class_prefix: format!("lamina/gen{n}/"),
            ..Default::default()
        })
    }

    /// Compiles and runs every form of `source`, returning the last value.
    pub fn eval(&self, source: &str) -> Result<Value, Trap> {
        let mut compiler = self.compiler();
        let mut last = Value::Nil;
        for form in Reader::new(source) {
            let unit = compiler.compile(&form?)?;
            last = self.run(&unit)?;
        }
        Ok(last)
    }

    pub fn load(&self, unit: &CompiledUnit) -> Result<(), Trap> {
        let mut classes = self.classes.lock();
        for image in &unit.classes {
            classes.insert(image.name.clone(), Arc::new(ClassFile::parse(&image.bytes)?));
        }
        Ok(())
    }

    pub fn run(&self, unit: &CompiledUnit) -> Result<Value, Trap> {
        self.load(unit)?;
        let Some(class) = self.class(&unit.entry) else {
            return fault("entry class missing");
        };
        let Some(method) = class.method("run", "()Ljava/lang/Object;") else {
            return fault("entry has no run method");
        };
        self.execute(&class, method, vec![])?
            .map_or(Ok(Value::Nil), Slot::into_value)
    }

    /// Calls a function value with arguments, the way `Fn.applyTo` would.
    pub fn apply(&self, function: &Function, args: Vec<Value>) -> Result<Value, Trap> {
        if let Some(native) = function.payload_as::<Native>() {
            return (native.0)(&args);
        }
        let Some(instance) = function.payload_as::<Instance>() else {
            return fault("function has no implementation loaded");
        };
        let class = instance.class.clone();
        let Some(method) = class.method(runtime::APPLY_TO, runtime::APPLY_TO_DESC) else {
            return fault("no applyTo");
        };
        let receiver = Slot::value(Value::Function(function.clone()));
        let array = Slot::Ref(Ref::Array(Arc::new(Mutex::new(args))));
        self.execute(&class, method, vec![receiver, array])?
            .map_or(Ok(Value::Nil), Slot::into_value)
    }

    fn instantiate(&self, class: Arc<ClassFile>) -> Value {
        let mut arities = Vec::new();
        for method in &class.methods {
            let params = method_type(&method.descriptor).map_or(0, |(p, _)| p.len());
            match method.name.as_str() {
                runtime::INVOKE => arities.push(Arity::Exact(params)),
                runtime::INVOKE_VARIADIC => arities.push(Arity::Min(params - 1)),
                _ => {}
            }
        }
        let instance = Instance {
            class,
            fields: Mutex::new(HashMap::new()),
        };
        Value::Function(
            Function::declared(None, Signature::new(arities), Convention::Plain)
                .with_payload(Arc::new(instance)),
        )
    }

    fn execute(
        &self,
        class: &Arc<ClassFile>,
        method: &MethodInfo,
        args: Vec<Slot>,
    ) -> Result<Option<Slot>, Trap> {
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.max_depth.fetch_max(depth, Ordering::Relaxed);
        let result = self.interpret(class, method, args);
        self.depth.fetch_sub(1, Ordering::Relaxed);
        result
    }

    fn interpret(
        &self,
        class: &Arc<ClassFile>,
        method: &MethodInfo,
        args: Vec<Slot>,
    ) -> Result<Option<Slot>, Trap> {
        let Some(code) = &method.code else {
            return fault(format!("{} has no code", method.name));
        };
        let index: HashMap<u32, usize> = code
            .insns
            .iter()
            .enumerate()
            .map(|(i, (offset, _))| (*offset, i))
            .collect();
        let target = |label: &lamina::classfile::Label| match index.get(&label.0) {
            Some(i) => Ok(*i),
            None => fault(format!("no instruction at {}", label.0)),
        };

        let mut locals = vec![Slot::Top; usize::from(code.max_locals).max(args.len())];
        for (i, arg) in args.into_iter().enumerate() {
            locals[i] = arg;
        }
        let mut stack: Vec<Slot> = Vec::new();
        let mut pc = 0;

        macro_rules! pop {
            () => {
                match stack.pop() {
                    Some(slot) => slot,
                    None => return fault("stack underflow"),
                }
            };
        }

        loop {
            let Some((offset, insn)) = code.insns.get(pc) else {
                return fault("fell off the end");
            };
            pc += 1;
            match insn {
                Insn::Label(_) => {}
                Insn::Op(op) => match op {
                    Op::Nop => {}
                    Op::AconstNull => stack.push(Slot::value(Value::Nil)),
                    Op::Pop => {
                        pop!();
                    }
                    Op::Pop2 => {
                        pop!();
                        pop!();
                    }
                    Op::Dup => {
                        let top = pop!();
                        stack.push(top.clone());
                        stack.push(top);
                    }
                    Op::DupX1 => {
                        let a = pop!();
                        let b = pop!();
                        stack.extend([a.clone(), b, a]);
                    }
                    Op::Swap => {
                        let a = pop!();
                        let b = pop!();
                        stack.extend([a, b]);
                    }
                    Op::Aaload => {
                        let i = pop!().int()?;
                        let Slot::Ref(Ref::Array(array)) = pop!() else {
                            return fault("aaload on a non-array");
                        };
                        let item = array.lock().get(i as usize).cloned();
                        match item {
                            Some(v) => stack.push(Slot::value(v)),
                            None => return fault("array index out of bounds"),
                        }
                    }
                    Op::Aastore => {
                        let v = pop!().into_value()?;
                        let i = pop!().int()?;
                        let Slot::Ref(Ref::Array(array)) = pop!() else {
                            return fault("aastore on a non-array");
                        };
                        match array.lock().get_mut(i as usize) {
                            Some(slot) => *slot = v,
                            None => return fault("array index out of bounds"),
                        }
                    }
                    Op::Arraylength => {
                        let Slot::Ref(Ref::Array(array)) = pop!() else {
                            return fault("arraylength on a non-array");
                        };
                        let len = array.lock().len();
                        stack.push(Slot::Int(len as i32));
                    }
                    Op::Iadd | Op::Isub | Op::Imul => {
                        let b = pop!().int()?;
                        let a = pop!().int()?;
                        stack.push(Slot::Int(match op {
                            Op::Iadd => a.wrapping_add(b),
                            Op::Isub => a.wrapping_sub(b),
                            _ => a.wrapping_mul(b),
                        }));
                    }
                    Op::Ladd | Op::Lsub | Op::Lmul => {
                        let b = pop!().long()?;
                        let a = pop!().long()?;
                        stack.push(Slot::Long(match op {
                            Op::Ladd => a.wrapping_add(b),
                            Op::Lsub => a.wrapping_sub(b),
                            _ => a.wrapping_mul(b),
                        }));
                    }
                    Op::Ineg => {
                        let a = pop!().int()?;
                        stack.push(Slot::Int(a.wrapping_neg()));
                    }
                    Op::Lneg => {
                        let a = pop!().long()?;
                        stack.push(Slot::Long(a.wrapping_neg()));
                    }
                    Op::I2l => {
                        let a = pop!().int()?;
                        stack.push(Slot::Long(i64::from(a)));
                    }
                    Op::L2i => {
                        let a = pop!().long()?;
                        stack.push(Slot::Int(a as i32));
                    }
                    Op::Lcmp => {
                        let b = pop!().long()?;
                        let a = pop!().long()?;
                        stack.push(Slot::Int(a.cmp(&b) as i32));
                    }
                    Op::Areturn | Op::Ireturn | Op::Lreturn => return Ok(Some(pop!())),
                    Op::Return => return Ok(None),
                    Op::Athrow => {
                        return match pop!() {
                            Slot::Ref(Ref::Exception(name, argc)) => Err(Trap::Arity { name, argc }),
                            _ => fault("threw something unexpected"),
                        }
                    }
                },
                Insn::PushInt(n) | Insn::Ldc(Loadable::Int(n)) => stack.push(Slot::Int(*n)),
                Insn::PushLong(n) | Insn::Ldc(Loadable::Long(n)) => stack.push(Slot::Long(*n)),
                Insn::Ldc(Loadable::String(text)) => stack.push(Slot::value(Value::string(text))),
                Insn::Ldc(Loadable::Class(_)) => return fault("class literals are unsupported"),
                Insn::Load(_, slot) => stack.push(locals[usize::from(*slot)].clone()),
                Insn::Store(_, slot) => locals[usize::from(*slot)] = pop!(),
                Insn::Type(op, name) => match op {
                    TypeOp::New => {
                        let id = self.next_object.fetch_add(1, Ordering::Relaxed);
                        stack.push(Slot::Ref(Ref::Uninit(id, name.clone())));
                    }
                    TypeOp::ANewArray => {
                        let len = pop!().int()?;
                        let array = vec![Value::Nil; len as usize];
                        stack.push(Slot::Ref(Ref::Array(Arc::new(Mutex::new(array)))));
                    }
                    TypeOp::CheckCast => {
                        let top = pop!();
                        let ok = match (&top, name.as_str()) {
                            (Slot::Ref(Ref::Value(Value::Nil)), _) => true,
                            (Slot::Ref(Ref::Value(Value::Function(_))), runtime::FN) => true,
                            (Slot::Ref(Ref::Value(Value::Str(_))), runtime::STRING) => true,
                            (Slot::Ref(Ref::Value(Value::Seq(_))), runtime::SEQ) => true,
                            (Slot::Ref(_), runtime::OBJECT) => true,
                            _ => false,
                        };
                        if !ok {
                            return fault(format!("cannot cast to {name}"));
                        }
                        stack.push(top);
                    }
                    TypeOp::InstanceOf => {
                        let top = pop!();
                        let is = matches!(
                            (&top, name.as_str()),
                            (Slot::Ref(Ref::Value(Value::Function(_))), runtime::FN)
                        );
                        stack.push(Slot::Int(i32::from(is)));
                    }
                },
                Insn::Field(op, member) => match op {
                    FieldOp::GetStatic if member.class == runtime::SEQ && member.name == "EMPTY" => {
                        stack.push(Slot::value(Value::Seq(Seq::EMPTY)))
                    }
                    FieldOp::GetField => {
                        let receiver = pop!().into_value()?;
                        let instance = instance_of(&receiver)?;
                        let value = instance.fields.lock().get(&member.name).cloned();
                        match value {
                            Some(v) => stack.push(Slot::value(v)),
                            None => return fault(format!("field {} is unset", member.name)),
                        }
                    }
                    FieldOp::PutField => {
                        let value = pop!().into_value()?;
                        let receiver = pop!().into_value()?;
                        instance_of(&receiver)?
                            .fields
                            .lock()
                            .insert(member.name.clone(), value);
                    }
                    _ => return fault(format!("unsupported field access {member:?}")),
                },
                Insn::Invoke(op, member) => {
                    let count = match method_type(&member.descriptor) {
                        Ok((params, _)) => params.len(),
                        Err(_) => return fault("bad descriptor"),
                    };
                    let mut args = Vec::with_capacity(count);
                    for _ in 0..count {
                        args.push(pop!());
                    }
                    args.reverse();
                    let receiver = match op {
                        InvokeOp::Static => None,
                        _ => Some(pop!()),
                    };
                    if let Some(result) = self.invoke(*op, member, receiver, args, &mut stack)? {
                        stack.push(result);
                    }
                }
                Insn::InvokeDynamic(site) => {
                    let Some(Constant::String(name)) = site.bootstrap.args.first() else {
                        return fault("dynamic site without a name");
                    };
                    match site.name.as_str() {
                        "global" => match self.linker.lookup(name) {
                            Some(v) => stack.push(Slot::value(v)),
                            None => return Err(LinkError::Unbound(name.as_str().into()).into()),
                        },
                        "call" => {
                            let argc = method_type(&site.descriptor).map_or(0, |(p, _)| p.len());
                            let mut args = Vec::with_capacity(argc);
                            for _ in 0..argc {
                                args.push(pop!().into_value()?);
                            }
                            args.reverse();
                            let call_site = self
                                .sites
                                .lock()
                                .entry((class.name.clone(), *offset))
                                .or_insert_with(|| Arc::new(self.linker.call_site(name, argc)))
                                .clone();
                            let function = call_site.target()?;
                            stack.push(Slot::value(self.apply(&function, args)?));
                        }
                        other => return fault(format!("unknown dynamic site {other}")),
                    }
                }
                Insn::Jump(jump, label) => {
                    let taken = match jump {
                        Jump::Goto => true,
                        Jump::IfNull | Jump::IfNonNull => {
                            let is_nil = matches!(pop!(), Slot::Ref(Ref::Value(Value::Nil)));
                            is_nil == (*jump == Jump::IfNull)
                        }
                        Jump::Ifeq | Jump::Ifne | Jump::Iflt | Jump::Ifge | Jump::Ifgt | Jump::Ifle => {
                            let a = pop!().int()?;
                            compare(*jump, a, 0)
                        }
                        Jump::IfAcmpeq | Jump::IfAcmpne => return fault("reference comparison"),
                        _ => {
                            let b = pop!().int()?;
                            let a = pop!().int()?;
                            compare(*jump, a, b)
                        }
                    };
                    if taken {
                        pc = target(label)?;
                    }
                }
                Insn::TableSwitch {
                    low,
                    default,
                    targets,
                } => {
                    let key = pop!().int()?;
                    let label = usize::try_from(key.wrapping_sub(*low))
                        .ok()
                        .and_then(|i| targets.get(i))
                        .unwrap_or(default);
                    pc = target(label)?;
                }
            }
        }
    }

    fn invoke(
        &self,
        op: InvokeOp,
        member: &MemberRef,
        receiver: Option<Slot>,
        args: Vec<Slot>,
        stack: &mut Vec<Slot>,
    ) -> Result<Option<Slot>, Trap> {
        let values = |args: Vec<Slot>| args.into_iter().map(Slot::into_value).collect::<Result<Vec<_>, _>>();
        match (op, member.class.as_str(), member.name.as_str()) {
            (InvokeOp::Static, runtime::LONG, "valueOf") => {
                let n = args.into_iter().next().map_or(fault("no argument"), Slot::long)?;
                Ok(Some(Slot::value(Value::Int(n))))
            }
            (InvokeOp::Static, runtime::ARRAY_SEQ, "of") => {
                let mut args = args.into_iter();
                let (Some(Slot::Ref(Ref::Array(array))), Some(Slot::Int(offset))) =
                    (args.next(), args.next())
                else {
                    return fault("bad ArraySeq.of arguments");
                };
                let items = array.lock().clone();
                Ok(Some(Slot::value(Value::Seq(Seq::from_array(
                    items,
                    offset as usize,
                    Seq::EMPTY,
                )))))
            }
            (InvokeOp::Static, runtime::LINKER, name @ (runtime::DEFINE | runtime::DEFINE_MACRO)) => {
                let values = values(args)?;
                let [Value::Str(global), value] = &values[..] else {
                    return fault("bad define arguments");
                };
                let stored = if name == runtime::DEFINE {
                    value.clone()
                } else {
                    self.macro_from(global, value)?
                };
                self.linker.insert(global, stored);
                Ok(Some(Slot::value(value.clone())))
            }
            (InvokeOp::Static, runtime::LINKER, runtime::AS_FN) => {
                let values = values(args)?;
                let [value, Value::Str(head)] = &values[..] else {
                    return fault("bad asFn arguments");
                };
                let function = linker::as_fn(head, value.clone())?;
                Ok(Some(Slot::value(Value::Function(function))))
            }
            (InvokeOp::Special, class, "<init>") => {
                let Some(Slot::Ref(receiver)) = receiver else {
                    return fault("constructor without a receiver");
                };
                let id = match receiver {
                    // the superclass constructor called on an existing `this`
                    Ref::Value(_) => return Ok(None),
                    Ref::Uninit(id, _) => id,
                    _ => return fault("bad constructor receiver"),
                };
                let constructed = match class {
                    runtime::SYMBOL | runtime::KEYWORD => {
                        let [Slot::Ref(Ref::Value(Value::Str(name)))] = &args[..] else {
                            return fault("bad name");
                        };
                        Ref::Value(if class == runtime::SYMBOL {
                            Value::symbol(name)
                        } else {
                            Value::keyword(name)
                        })
                    }
                    runtime::ARITY_EXCEPTION => {
                        let [Slot::Ref(Ref::Value(Value::Str(name))), Slot::Int(argc)] = &args[..]
                        else {
                            return fault("bad exception arguments");
                        };
                        Ref::Exception(name.to_string(), *argc)
                    }
                    _ => {
                        let Some(class) = self.class(class) else {
                            return fault(format!("class {class} is not loaded"));
                        };
                        let this = self.instantiate(class.clone());
                        let Some(constructor) = class.method("<init>", &member.descriptor) else {
                            return fault("no such constructor");
                        };
                        let mut locals = vec![Slot::value(this.clone())];
                        locals.extend(args);
                        self.execute(&class, constructor, locals)?;
                        Ref::Value(this)
                    }
                };
                for slot in stack.iter_mut() {
                    if matches!(slot, Slot::Ref(Ref::Uninit(other, _)) if *other == id) {
                        *slot = Slot::Ref(constructed.clone());
                    }
                }
                Ok(None)
            }
            (InvokeOp::Virtual, _, runtime::APPLY_TO) => {
                let function = match receiver.map(Slot::into_value) {
                    Some(Ok(Value::Function(f))) => f,
                    _ => return fault("applyTo on a non-function"),
                };
                let Some(Slot::Ref(Ref::Array(array))) = args.into_iter().next() else {
                    return fault("applyTo without an array");
                };
                let args = array.lock().clone();
                Ok(Some(Slot::value(self.apply(&function, args)?)))
            }
            (InvokeOp::Virtual, _, _) => {
                let Some(receiver) = receiver else {
                    return fault("virtual call without a receiver");
                };
                let this = receiver.clone().into_value()?;
                let class = instance_of(&this)?.class.clone();
                let Some(method) = class.method(&member.name, &member.descriptor) else {
                    return fault(format!("no method {}{}", member.name, member.descriptor));
                };
                let mut locals = vec![receiver];
                locals.extend(args);
                self.execute(&class, method, locals)
            }
            _ => fault(format!("unsupported call {member:?}")),
        }
    }

    /// A compile-time macro backed by a compiled macro function.
    fn macro_from(&self, name: &str, value: &Value) -> Result<Value, Trap> {
        let Value::Function(function) = value else {
            return fault("macro is not a function");
        };
        let function = function.clone();
        let machine = self.this.clone();
        Ok(Value::Macro(Macro::new(name, move |args: &Seq| {
            let Some(machine) = machine.upgrade() else {
                return Err(MacroError::new("machine is gone"));
            };
            machine
                .apply(&function, args.to_vec())
                .map_err(|trap| MacroError::new(trap.to_string()))
        })))
    }
}

fn instance_of(value: &Value) -> Result<&Instance, Trap> {
    match value {
        Value::Function(f) => match f.payload_as::<Instance>() {
            Some(instance) => Ok(instance),
            None => fault("not a compiled function"),
        },
        _ => fault(format!("not an object: {value}")),
    }
}

fn compare(jump: Jump, a: i32, b: i32) -> bool {
    match jump {
        Jump::Ifeq | Jump::IfIcmpeq => a == b,
        Jump::Ifne | Jump::IfIcmpne => a != b,
        Jump::Iflt | Jump::IfIcmplt => a < b,
        Jump::Ifge | Jump::IfIcmpge => a >= b,
        Jump::Ifgt | Jump::IfIcmpgt => a > b,
        Jump::Ifle | Jump::IfIcmple => a <= b,
        _ => false,
    }
}
