//! Representation of values, both as compiler input and as contents of the
//! linking environment.
use core::fmt;
use std::{any::Any, sync::Arc};

use arbitrary::{Arbitrary, Unstructured};

use crate::runtime::{Convention, Signature};

pub use atom::{Keyword, Symbol};
pub use seq::{Iter, Seq};

mod atom;
mod seq;

#[derive(Clone, Default, PartialEq)]
pub enum Value {
    // `nil` is the only false value
    #[default]
    Nil,
    // only 64-bit integers, no numeric tower
    Int(i64),
    Str(Arc<str>),
    Symbol(Symbol),
    Keyword(Keyword),
    Seq(Seq),
    Function(Function),
    Macro(Macro),
}

impl Value {
    pub fn symbol(name: impl AsRef<str>) -> Self {
        Self::Symbol(Symbol::new(name))
    }

    pub fn keyword(name: impl AsRef<str>) -> Self {
        Self::Keyword(Keyword::new(name))
    }

    pub fn string(text: impl AsRef<str>) -> Self {
        Self::Str(Arc::from(text.as_ref()))
    }

    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Self::Seq(Seq::list(items))
    }

    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Self::Symbol(sym) => Some(sym),
            _ => None,
        }
    }

    pub fn as_keyword(&self) -> Option<&Keyword> {
        match self {
            Self::Keyword(kw) => Some(kw),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&Seq> {
        match self {
            Self::Seq(seq) => Some(seq),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(int) => Some(*int),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(text) => Some(text),
            _ => None,
        }
    }

    /// Short name of the value's kind, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Nil => "nil",
            Self::Int(_) => "integer",
            Self::Str(_) => "string",
            Self::Symbol(_) => "symbol",
            Self::Keyword(_) => "keyword",
            Self::Seq(_) => "sequence",
            Self::Function(_) => "function",
            Self::Macro(_) => "macro",
        }
    }

    pub fn is_nil(&self) -> bool {
        matches!(self, Self::Nil)
    }
}

impl From<Seq> for Value {
    fn from(value: Seq) -> Self {
        Self::Seq(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Symbol> for Value {
    fn from(value: Symbol) -> Self {
        Self::Symbol(value)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Symbol(s) => write!(f, "{s}"),
            Value::Keyword(k) => write!(f, "{k}"),
            Value::Seq(seq) => write!(f, "{seq}"),
            Value::Function(func) => match func.name() {
                Some(name) => write!(f, "#<function {name}>"),
                None => write!(f, "#<function>"),
            },
            Value::Macro(mac) => write!(f, "#<macro {}>", mac.name()),
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Host data attached to a [`Function`] by whoever loaded it.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// A callable as far as the linker is concerned: how it may be called,
/// not how it runs.
///
/// Functions declared at compile time carry no payload; a loader that
/// installs the real thing attaches whatever handle it needs.
#[derive(Clone)]
pub struct Function {
    name: Option<Symbol>,
    signature: Signature,
    convention: Convention,
    payload: Option<Payload>,
}

impl Function {
    pub fn declared(name: Option<Symbol>, signature: Signature, convention: Convention) -> Self {
        Self {
            name,
            signature,
            convention,
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn name(&self) -> Option<&Symbol> {
        self.name.as_ref()
    }

    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    pub fn convention(&self) -> Convention {
        self.convention
    }

    pub fn payload(&self) -> Option<&Payload> {
        self.payload.as_ref()
    }

    pub fn payload_as<T: Any>(&self) -> Option<&T> {
        self.payload.as_ref()?.downcast_ref()
    }
}

// The payload is opaque host data.
impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("convention", &self.convention)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Function {
    fn eq(&self, other: &Self) -> bool {
        let same_payload = match (&self.payload, &other.payload) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const (),
            _ => false,
        };
        same_payload
            && self.name == other.name
            && self.signature == other.signature
            && self.convention == other.convention
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{0}")]
pub struct MacroError(pub Box<str>);

impl MacroError {
    pub fn new(message: impl AsRef<str>) -> Self {
        Self(Box::from(message.as_ref()))
    }
}

type Expander = dyn Fn(&Seq) -> Result<Value, MacroError> + Send + Sync;

/// A compile-time rewrite: receives the arguments of a call form and returns
/// the form that replaces it.
#[derive(Clone)]
pub struct Macro {
    name: Symbol,
    expander: Arc<Expander>,
}

impl Macro {
    pub fn new(
        name: impl Into<Symbol>,
        expander: impl Fn(&Seq) -> Result<Value, MacroError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            expander: Arc::new(expander),
        }
    }

    pub fn name(&self) -> &Symbol {
        &self.name
    }

    pub fn expand(&self, args: &Seq) -> Result<Value, MacroError> {
        (self.expander)(args)
    }
}

impl PartialEq for Macro {
    fn eq(&self, other: &Self) -> bool {
        Arc::as_ptr(&self.expander) as *const () == Arc::as_ptr(&other.expander) as *const ()
    }
}

// Only plain data is generated; functions and macros never appear in source.
impl<'a> Arbitrary<'a> for Value {
    fn arbitrary(u: &mut Unstructured<'a>) -> arbitrary::Result<Self> {
        arbitrary_datum(u, 3)
    }
}

fn arbitrary_name(u: &mut Unstructured) -> arbitrary::Result<String> {
    const ALPHABET: &[char] = &['a', 'b', 'f', 'x', 'y', '-', '?', '*', '+'];
    let len = u.int_in_range(1..=6)?;
    (0..len).map(|_| u.choose(ALPHABET).copied()).collect()
}

fn arbitrary_datum(u: &mut Unstructured, depth: u32) -> arbitrary::Result<Value> {
    let max_kind = if depth == 0 { 4 } else { 5 };
    Ok(match u.int_in_range(0..=max_kind)? {
        0 => Value::Nil,
        1 => Value::Int(u.arbitrary()?),
        2 => Value::string(u.arbitrary::<String>()?),
        3 => Value::symbol(arbitrary_name(u)?),
        4 => Value::keyword(arbitrary_name(u)?),
        _ => {
            let len = u.int_in_range(0..=4)?;
            let items = (0..len)
                .map(|_| arbitrary_datum(u, depth - 1))
                .collect::<arbitrary::Result<Vec<_>>>()?;
            if u.arbitrary()? {
                Value::list(items)
            } else {
                Value::Seq(Seq::from_vec(items))
            }
        }
    })
}
