pub use logos::Span;
use logos::{Lexer, Logos};

fn process_string(lexer: &mut Lexer<Token>) -> Result<Box<str>, LexerError> {
    let slice = lexer.slice();
    let mut built = String::with_capacity(slice.len());

    // Skip the quotes on both ends
    let mut chars = slice[1..slice.len() - 1].chars();
    while let Some(chr) = chars.next() {
        match chr {
            '\\' => built.push(match chars.next() {
                Some('n') => '\n',
                Some('t') => '\t',
                Some('r') => '\r',
                Some('0') => '\0',
                Some('\\') => '\\',
                Some('"') => '"',
                Some(_) | None => Err(LexerError::MalformedString)?,
            }),
            c => built.push(c),
        }
    }

    Ok(Box::from(built.as_str()))
}

fn read_integer(lexer: &mut Lexer<Token>) -> Result<i64, LexerError> {
    lexer.slice().parse().map_err(|_| LexerError::IntegerTooBig)
}

#[derive(thiserror::Error, Debug, PartialEq, Clone, Default)]
pub enum LexerError {
    #[default]
    #[error("invalid token encountered")]
    Invalid,
    #[error("malformed string")]
    MalformedString,
    #[error("integer literal does not fit in 64 bits")]
    IntegerTooBig,
}

/// Tokens are lexed from some source. Whitespace and `;` comments are skipped.
#[derive(Debug, Clone, PartialEq, Logos)]
#[logos(error = LexerError)]
#[logos(skip r"[ \t\r\n\f]+")]
#[logos(skip r";[^\n]*")]
pub enum Token {
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("'")]
    Quote,
    #[regex("[-+]?[0-9]+", read_integer)]
    Int(i64),
    #[regex(r#""([^\\"]|\\.)*""#, process_string)]
    Str(Box<str>),
    #[regex(r":[0-9a-zA-Z!$%&*/<=>?^_~+\-.@]+", |l| Box::from(&l.slice()[1..]))]
    Keyword(Box<str>),
    #[regex(r"[a-zA-Z!$%&*/<=>?^_~.@][0-9a-zA-Z!$%&*/:<=>?^_~+\-.@]*", |l| Box::from(l.slice()))]
    #[token("+", |l| Box::from(l.slice()))]
    #[token("-", |l| Box::from(l.slice()))]
    #[regex(r"[-+][a-zA-Z!$%&*/:<=>?^_~+\-.@][0-9a-zA-Z!$%&*/:<=>?^_~+\-.@]*", |l| Box::from(l.slice()))]
    Symbol(Box<str>),
}
