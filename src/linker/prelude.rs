//! Macros every fresh environment starts with, written as native expanders.
use super::Linker;
use crate::value::{Macro, MacroError, Seq, Value};

fn sym(name: &str) -> Value {
    Value::symbol(name)
}

/// `(do body...)`
fn block(body: Seq) -> Value {
    Value::Seq(Seq::cons(sym("do"), body))
}

fn split_test(name: &str, args: &Seq) -> Result<(Value, Seq), MacroError> {
    match args.first() {
        Some(test) => Ok((test.clone(), args.rest())),
        None => Err(MacroError::new(format!("{name} needs a test"))),
    }
}

/// `(when test body...)` => `(if test (do body...))`
fn when(args: &Seq) -> Result<Value, MacroError> {
    let (test, body) = split_test("when", args)?;
    Ok(Value::list([sym("if"), test, block(body)]))
}

/// `(unless test body...)` => `(if test nil (do body...))`
fn unless(args: &Seq) -> Result<Value, MacroError> {
    let (test, body) = split_test("unless", args)?;
    Ok(Value::list([sym("if"), test, Value::Nil, block(body)]))
}

/// `(cond test expr ...)`, flat pairs tried in order.
fn cond(args: &Seq) -> Result<Value, MacroError> {
    let Some(test) = args.first() else {
        return Ok(Value::Nil);
    };
    let rest = args.rest();
    let Some(expr) = rest.first() else {
        return Err(MacroError::new("cond needs an expression after every test"));
    };
    let remaining = Value::Seq(Seq::cons(sym("cond"), rest.rest()));
    Ok(Value::list([sym("if"), test.clone(), expr.clone(), remaining]))
}

fn and(args: &Seq) -> Result<Value, MacroError> {
    let (first, rest) = split_test("and", args)?;
    if rest.is_empty() {
        return Ok(first);
    }
    let remaining = Value::Seq(Seq::cons(sym("and"), rest));
    Ok(Value::list([sym("if"), first, remaining, Value::Nil]))
}

/// `(defn name params body...)` => `(define name (function name params body...))`
fn defn(args: &Seq) -> Result<Value, MacroError> {
    let Some(Value::Symbol(name)) = args.first() else {
        return Err(MacroError::new("defn needs a name"));
    };
    if args.len() < 2 {
        return Err(MacroError::new("defn needs a parameter list"));
    }
    let function = Value::Seq(Seq::cons(sym("function"), args.clone()));
    Ok(Value::list([sym("define"), Value::Symbol(name.clone()), function]))
}

pub(super) fn install(linker: &Linker) {
    let macros: [(&str, fn(&Seq) -> Result<Value, MacroError>); 5] = [
        ("when", when),
        ("unless", unless),
        ("cond", cond),
        ("and", and),
        ("defn", defn),
    ];
    for (name, expander) in macros {
        linker.insert(name, Value::Macro(Macro::new(name, expander)));
    }
}

#[cfg(test)]
mod tests {
    use assert2::{check, let_assert};

    use super::*;
    use crate::reader::Reader;

    fn expand(src: &str) -> Result<String, MacroError> {
        let_assert!(Some(Ok(Value::Seq(form))) = Reader::new(src).next_form());
        let_assert!(Some(Value::Symbol(head)) = form.first());
        let_assert!(Some(Value::Macro(m)) = Linker::with_prelude().lookup(head.name()));
        m.expand(&form.rest()).map(|v| v.to_string())
    }

    #[test]
    fn expansions() {
        check!(expand("(when a b c)").unwrap() == "(if a (do b c))");
        check!(expand("(unless a b)").unwrap() == "(if a nil (do b))");
        check!(expand("(cond a 1 b 2)").unwrap() == "(if a 1 (cond b 2))");
        check!(expand("(cond)").unwrap() == "nil");
        check!(expand("(and x)").unwrap() == "x");
        check!(expand("(and x y)").unwrap() == "(if x (and y) nil)");
        check!(
            expand("(defn f (x) x)").unwrap() == "(define f (function f (x) x))"
        );
    }

    #[test]
    fn malformed_uses() {
        let_assert!(Err(_) = expand("(cond a)"));
        let_assert!(Err(_) = expand("(and)"));
        let_assert!(Err(_) = expand("(when)"));
        let_assert!(Err(_) = expand("(defn 1 (x) x)"));
        let_assert!(Err(_) = expand("(defn f)"));
    }
}
