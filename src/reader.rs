//! Turns source text into [`Value`]s, one top-level form at a time.
use logos::Logos;

use crate::{
    lexer::{LexerError, Span, Token},
    value::{Seq, Value},
};

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ReadErrorKind {
    #[error(transparent)]
    Lexer(#[from] LexerError),
    #[error("unexpected closing parenthesis")]
    UnexpectedClose,
    #[error("list is never closed")]
    Unclosed,
    #[error("nothing to quote")]
    QuoteWithoutForm,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[error("{kind}")]
pub struct ReadError {
    pub kind: ReadErrorKind,
    /// Byte range in the source.
    pub span: Span,
}

impl ReadError {
    fn new(kind: impl Into<ReadErrorKind>, span: Span) -> Self {
        Self {
            kind: kind.into(),
            span,
        }
    }
}

pub struct Reader<'s> {
    lexer: logos::Lexer<'s, Token>,
}

impl<'s> Reader<'s> {
    pub fn new(source: &'s str) -> Self {
        Self {
            lexer: Token::lexer(source),
        }
    }

    fn token(&mut self) -> Option<Result<(Token, Span), ReadError>> {
        let token = self.lexer.next()?;
        let span = self.lexer.span();
        Some(token.map(|t| (t, span.clone())).map_err(|e| ReadError::new(e, span)))
    }

    /// The next form, or `None` at the end of input.
    pub fn next_form(&mut self) -> Option<Result<Value, ReadError>> {
        let next = self.token()?;
        Some(next.and_then(|(token, span)| self.form(token, span)))
    }

    fn form(&mut self, token: Token, span: Span) -> Result<Value, ReadError> {
        match token {
            Token::LParen => self.list(span),
            Token::RParen => Err(ReadError::new(ReadErrorKind::UnexpectedClose, span)),
            Token::Quote => match self.token() {
                None => Err(ReadError::new(ReadErrorKind::QuoteWithoutForm, span)),
                Some(next) => {
                    let (token, next_span) = next?;
                    if token == Token::RParen {
                        return Err(ReadError::new(ReadErrorKind::QuoteWithoutForm, span));
                    }
                    let datum = self.form(token, next_span)?;
                    Ok(Value::list([Value::symbol("quote"), datum]))
                }
            },
            Token::Int(n) => Ok(Value::Int(n)),
            Token::Str(text) => Ok(Value::string(text)),
            Token::Keyword(name) => Ok(Value::keyword(name)),
            Token::Symbol(name) if &*name == "nil" => Ok(Value::Nil),
            Token::Symbol(name) => Ok(Value::symbol(name)),
        }
    }

    fn list(&mut self, open: Span) -> Result<Value, ReadError> {
        let mut items = Vec::new();
        loop {
            let Some(next) = self.token() else {
                return Err(ReadError::new(ReadErrorKind::Unclosed, open));
            };
            let (token, span) = next?;
            if token == Token::RParen {
                return Ok(Value::Seq(Seq::list(items)));
            }
            items.push(self.form(token, span)?);
        }
    }
}

impl Iterator for Reader<'_> {
    type Item = Result<Value, ReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_form()
    }
}
