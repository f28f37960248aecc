//! The contract between emitted code and the runtime support classes that
//! the loader provides (`lamina/lang/*`).
//!
//! Nothing here runs on the JVM; these are the names, descriptors and calling
//! conventions the compiler bakes into class images, plus the arity model the
//! linker uses to decide whether a call can succeed.
use core::fmt;

use crate::classfile::{
    insn::{InvokeOp, Jump, MemberRef, TypeOp},
    pool::{Bootstrap, Constant, MethodHandle, RefKind},
    DynamicSite, Insn,
};

pub const OBJECT: &str = "java/lang/Object";
pub const OBJECT_DESC: &str = "Ljava/lang/Object;";
pub const OBJECT_ARRAY: &str = "[Ljava/lang/Object;";
pub const STRING: &str = "java/lang/String";
pub const LONG: &str = "java/lang/Long";

/// Abstract base of every compiled function.
pub const FN: &str = "lamina/lang/Fn";
pub const APPLY_TO: &str = "applyTo";
pub const APPLY_TO_DESC: &str = "([Ljava/lang/Object;)Ljava/lang/Object;";
pub const INVOKE: &str = "invoke";
pub const INVOKE_VARIADIC: &str = "invokeVariadic";

pub const SYMBOL: &str = "lamina/lang/Symbol";
pub const KEYWORD: &str = "lamina/lang/Keyword";
pub const SEQ: &str = "lamina/lang/Seq";
pub const SEQ_DESC: &str = "Llamina/lang/Seq;";
pub const ARRAY_SEQ: &str = "lamina/lang/ArraySeq";
pub const ARITY_EXCEPTION: &str = "lamina/lang/ArityException";

pub const LINKER: &str = "lamina/lang/Linker";
pub const LINK_CALL: &str = "linkCall";
pub const LINK_GLOBAL: &str = "linkGlobal";
pub const BOOTSTRAP_DESC: &str = "(Ljava/lang/invoke/MethodHandles$Lookup;Ljava/lang/String;Ljava/lang/invoke/MethodType;Ljava/lang/String;)Ljava/lang/invoke/CallSite;";
pub const DEFINE: &str = "define";
pub const DEFINE_MACRO: &str = "defineMacro";
pub const DEFINE_DESC: &str = "(Ljava/lang/String;Ljava/lang/Object;)Ljava/lang/Object;";
/// Throws a not-callable error naming the operator unless handed an `Fn`.
pub const AS_FN: &str = "asFn";
pub const AS_FN_DESC: &str = "(Ljava/lang/Object;Ljava/lang/String;)Llamina/lang/Fn;";

pub const VARIADIC_ANNOTATION: &str = "Llamina/lang/Variadic;";
pub const MACRO_ANNOTATION: &str = "Llamina/lang/Macro;";

/// Procedure arity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arity {
    Exact(usize),
    Min(usize),
}

impl Arity {
    pub fn is_satisfied(&self, len: usize) -> bool {
        match self {
            Self::Exact(e) => *e == len,
            Self::Min(m) => *m <= len,
        }
    }

    /// Number of parameter slots a clause with this arity declares; the rest
    /// sequence of a variadic clause takes one.
    pub fn param_count(&self) -> usize {
        match self {
            Self::Exact(n) => *n,
            Self::Min(n) => n + 1,
        }
    }
}

impl fmt::Display for Arity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(n) => write!(f, "{n}"),
            Self::Min(n) => write!(f, "{n}+"),
        }
    }
}

/// The argument counts a callable accepts: any number of exact arities and at
/// most one variadic threshold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Signature(Vec<Arity>);

impl Signature {
    pub fn new(arities: impl IntoIterator<Item = Arity>) -> Self {
        let mut arities: Vec<_> = arities.into_iter().collect();
        arities.sort_by_key(|arity| match arity {
            Arity::Exact(n) => (*n, false),
            Arity::Min(n) => (*n, true),
        });
        arities.dedup();
        Self(arities)
    }

    pub fn accepts(&self, len: usize) -> bool {
        self.0.iter().any(|arity| arity.is_satisfied(len))
    }

    pub fn arities(&self) -> &[Arity] {
        &self.0
    }

    pub fn fixed(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().filter_map(|arity| match arity {
            Arity::Exact(n) => Some(*n),
            Arity::Min(_) => None,
        })
    }

    pub fn variadic(&self) -> Option<usize> {
        self.0.iter().find_map(|arity| match arity {
            Arity::Min(n) => Some(*n),
            Arity::Exact(_) => None,
        })
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arity) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{arity}")?;
        }
        Ok(())
    }
}

/// How a function expects to be called. Recorded in class images as a marker
/// annotation so a loader can tell the conventions apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Convention {
    #[default]
    Plain,
    Variadic,
    Macro,
}

/// `(Object, ..., Object)Object` with `argc` parameters.
pub fn object_method_desc(argc: usize) -> String {
    let mut desc = String::with_capacity(2 + argc * OBJECT_DESC.len() + OBJECT_DESC.len());
    desc.push('(');
    for _ in 0..argc {
        desc.push_str(OBJECT_DESC);
    }
    desc.push(')');
    desc.push_str(OBJECT_DESC);
    desc
}

/// `(Object, ..., Object)V`, the constructor of a closure with `argc` captures.
pub fn constructor_desc(argc: usize) -> String {
    let mut desc = object_method_desc(argc);
    desc.truncate(desc.len() - OBJECT_DESC.len());
    desc.push('V');
    desc
}

/// Escapes a symbol name into a legal JVM unqualified name.
///
/// Characters the class-file format reserves (and the escape character
/// itself) become `$xx` hex escapes.
pub fn mangle(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for c in name.chars() {
        match c {
            '.' | ';' | '[' | '/' | '<' | '>' | '$' => {
                out.push_str(&format!("${:02x}", c as u32));
            }
            c => out.push(c),
        }
    }
    if out.is_empty() {
        out.push_str("$empty");
    }
    out
}

fn bootstrap(method: &str, name: &str) -> Bootstrap {
    Bootstrap {
        handle: MethodHandle {
            kind: RefKind::InvokeStatic,
            member: MemberRef::new(LINKER, method, BOOTSTRAP_DESC),
            interface: false,
        },
        args: vec![Constant::String(name.into())],
    }
}

/// A late-bound call of the global `name` with `argc` arguments.
pub fn call_site(name: &str, argc: usize) -> Insn {
    Insn::InvokeDynamic(DynamicSite {
        bootstrap: bootstrap(LINK_CALL, name),
        name: "call".into(),
        descriptor: object_method_desc(argc),
    })
}

/// A late-bound read of the global `name`.
pub fn global_site(name: &str) -> Insn {
    Insn::InvokeDynamic(DynamicSite {
        bootstrap: bootstrap(LINK_GLOBAL, name),
        name: "global".into(),
        descriptor: object_method_desc(0),
    })
}

/// Boxes the `long` on top of the stack.
pub fn box_long() -> Insn {
    Insn::Invoke(
        InvokeOp::Static,
        MemberRef::new(LONG, "valueOf", "(J)Ljava/lang/Long;"),
    )
}

/// Pushes the runtime's empty sequence.
pub fn empty_seq() -> Insn {
    Insn::Field(
        crate::classfile::insn::FieldOp::GetStatic,
        MemberRef::new(SEQ, "EMPTY", SEQ_DESC),
    )
}

/// Wraps `Object[] array, int offset` into an array-backed sequence.
pub fn array_seq() -> Insn {
    Insn::Invoke(
        InvokeOp::Static,
        MemberRef::new(ARRAY_SEQ, "of", "([Ljava/lang/Object;I)Llamina/lang/Seq;"),
    )
}

/// Instructions that leave a freshly constructed `class(name)` on the stack,
/// for the runtime's single-string constructors (`Symbol`, `Keyword`).
pub fn construct_named(class: &str, name: &str) -> [Insn; 4] {
    [
        Insn::Type(TypeOp::New, class.into()),
        Insn::Op(crate::classfile::insn::Op::Dup),
        Insn::Ldc(crate::classfile::insn::Loadable::String(name.into())),
        Insn::Invoke(
            InvokeOp::Special,
            MemberRef::new(class, "<init>", "(Ljava/lang/String;)V"),
        ),
    ]
}

/// Turns the operator value on top of the stack into an `Fn`, failing with
/// an error that quotes `printed` when it is not one.
pub fn as_fn(printed: &str) -> [Insn; 2] {
    [
        Insn::Ldc(crate::classfile::insn::Loadable::String(printed.into())),
        Insn::Invoke(InvokeOp::Static, MemberRef::new(LINKER, AS_FN, AS_FN_DESC)),
    ]
}

/// Branch taken when the top of the stack is `nil`.
pub fn if_nil(label: crate::classfile::Label) -> Insn {
    Insn::Jump(Jump::IfNull, label)
}

#[cfg(test)]
mod tests {
    use assert2::check;

    use super::*;

    #[test]
    fn signature_acceptance() {
        let sig = Signature::new([Arity::Exact(2), Arity::Min(3), Arity::Exact(1)]);
        check!(sig.arities() == &[Arity::Exact(1), Arity::Exact(2), Arity::Min(3)]);
        check!(!sig.accepts(0));
        check!(sig.accepts(1));
        check!(sig.accepts(2));
        check!(sig.accepts(7));
        check!(sig.variadic() == Some(3));
        check!(sig.fixed().collect::<Vec<_>>() == vec![1, 2]);
        check!(sig.to_string() == "1, 2, 3+");
    }

    #[test]
    fn descriptors() {
        check!(object_method_desc(0) == "()Ljava/lang/Object;");
        check!(
            object_method_desc(2) == "(Ljava/lang/Object;Ljava/lang/Object;)Ljava/lang/Object;"
        );
        check!(constructor_desc(0) == "()V");
        check!(constructor_desc(1) == "(Ljava/lang/Object;)V");
    }

    #[test]
    fn mangling() {
        check!(mangle("x") == "x");
        check!(mangle("zero?") == "zero?");
        check!(mangle("a/b") == "a$2fb");
        check!(mangle("<=") == "$3c=");
        check!(mangle("$") == "$24");
    }
}
