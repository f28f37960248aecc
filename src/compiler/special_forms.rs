use std::collections::HashSet;

use super::CompileError;
use crate::{
    runtime::{Arity, Signature},
    value::{Seq, Symbol, Value},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialForm {
    // data
    Quote,

    // control
    If,
    Do,
    Recur,

    // binding
    Let,
    Function,
    Define,
    DefineMacro,

    // inline bytecode
    Asm,
    Unescape,
}

impl SpecialForm {
    pub fn from_symbol(sym: &Symbol) -> Option<Self> {
        Some(match sym.name() {
            "quote" => Self::Quote,
            "if" => Self::If,
            "do" => Self::Do,
            "recur" => Self::Recur,
            "let" => Self::Let,
            "function" => Self::Function,
            "define" => Self::Define,
            "define-macro" => Self::DefineMacro,
            "asm" => Self::Asm,
            "unescape" => Self::Unescape,
            _ => return None,
        })
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Quote => "quote",
            Self::If => "if",
            Self::Do => "do",
            Self::Recur => "recur",
            Self::Let => "let",
            Self::Function => "function",
            Self::Define => "define",
            Self::DefineMacro => "define-macro",
            Self::Asm => "asm",
            Self::Unescape => "unescape",
        }
    }

    /// Whether `form` is a list headed by this special form.
    pub fn heads(self, form: &Value) -> bool {
        form.as_seq()
            .and_then(Seq::first)
            .and_then(Value::as_symbol)
            .is_some_and(|head| Self::from_symbol(head) == Some(self))
    }
}

/// One parameter list and body of a function literal.
#[derive(Debug, Clone)]
pub struct Clause {
    pub params: Vec<Symbol>,
    pub rest: Option<Symbol>,
    pub body: Seq,
}

impl Clause {
    fn parse(params: &Value, body: Seq) -> Result<Self, CompileError> {
        let Value::Seq(list) = params else {
            return Err(CompileError::syntax(
                "function",
                format!("expected a parameter list, found {params}"),
            ));
        };

        let mut names = Vec::new();
        let mut rest = None;
        let mut items = list.iter();
        while let Some(item) = items.next() {
            let name = param_name(item)?;
            if name.name() == "&" {
                let Some(last) = items.next() else {
                    return Err(CompileError::syntax("function", "& must name a rest parameter"));
                };
                rest = Some(param_name(last)?);
                if items.next().is_some() {
                    return Err(CompileError::syntax(
                        "function",
                        "the rest parameter must come last",
                    ));
                }
            } else {
                names.push(name);
            }
        }

        Ok(Self {
            params: names,
            rest,
            body,
        })
    }

    pub fn arity(&self) -> Arity {
        match self.rest {
            Some(_) => Arity::Min(self.params.len()),
            None => Arity::Exact(self.params.len()),
        }
    }
}

fn param_name(item: &Value) -> Result<Symbol, CompileError> {
    item.as_symbol().cloned().ok_or_else(|| {
        CompileError::syntax("function", format!("parameters must be symbols, found {item}"))
    })
}

/// `(function [name] (params...) body...)` or
/// `(function [name] ((params...) body...) ...)`, minus the head.
#[derive(Debug, Clone)]
pub struct FunctionForm {
    pub name: Option<Symbol>,
    pub clauses: Vec<Clause>,
}

impl FunctionForm {
    pub fn parse(args: &Seq) -> Result<Self, CompileError> {
        let (name, rest) = match args.first() {
            Some(Value::Symbol(name)) => (Some(name.clone()), args.rest()),
            _ => (None, args.clone()),
        };

        // several clauses when the first item is itself headed by a list
        let multi = rest
            .first()
            .and_then(Value::as_seq)
            .and_then(Seq::first)
            .is_some_and(|item| matches!(item, Value::Seq(_)));

        let clauses = if multi {
            rest.iter()
                .map(|clause| match clause {
                    Value::Seq(clause) if !clause.is_empty() => {
                        Clause::parse(&clause.first().cloned().unwrap_or_default(), clause.rest())
                    }
                    other => Err(CompileError::syntax(
                        "function",
                        format!("expected a clause, found {other}"),
                    )),
                })
                .collect::<Result<Vec<_>, _>>()?
        } else {
            match rest.first() {
                Some(params) => vec![Clause::parse(params, rest.rest())?],
                None => Vec::new(),
            }
        };

        if clauses.is_empty() {
            return Err(CompileError::syntax("function", "no parameter list"));
        }

        let mut fixed = HashSet::new();
        let mut variadic = None;
        for clause in &clauses {
            match clause.arity() {
                Arity::Exact(n) => {
                    if !fixed.insert(n) {
                        return Err(CompileError::DuplicateArity(n));
                    }
                }
                Arity::Min(n) => {
                    if variadic.replace(n).is_some() {
                        return Err(CompileError::AmbiguousVariadic);
                    }
                }
            }
        }
        if let Some(min) = variadic {
            if fixed.iter().any(|n| *n >= min) {
                return Err(CompileError::AmbiguousVariadic);
            }
        }

        Ok(Self { name, clauses })
    }

    pub fn signature(&self) -> Signature {
        Signature::new(self.clauses.iter().map(Clause::arity))
    }
}

/// The `(name init ...)` list of a `let`.
pub fn parse_bindings(bindings: &Value) -> Result<Vec<(Symbol, Value)>, CompileError> {
    let Value::Seq(list) = bindings else {
        return Err(CompileError::syntax(
            "let",
            format!("expected a binding list, found {bindings}"),
        ));
    };
    let items = list.to_vec();
    if items.len() % 2 != 0 {
        return Err(CompileError::syntax("let", "bindings must come in pairs"));
    }
    items
        .chunks_exact(2)
        .map(|pair| match &pair[0] {
            Value::Symbol(name) => Ok((name.clone(), pair[1].clone())),
            other => Err(CompileError::syntax(
                "let",
                format!("binding names must be symbols, found {other}"),
            )),
        })
        .collect()
}
