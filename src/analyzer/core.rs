//! # Core Parser Definitions
//!
//! The parser interface and error type underneath the combinators in
//! [`combinators`](super::combinators).

use thiserror::Error;

/// Core parsing interface over a token slice.
///
/// A parser reads `input` starting at `pos` and returns the position after the
/// consumed tokens together with its output, or a [`ParseError`].
pub trait Parser<I, O> {
    fn parse(&self, input: &[I], pos: usize) -> ParseResult<O>;
}

pub type ParseResult<O> = Result<(usize, O), ParseError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Unexpected: expected {expected}, found {found} at token {position}")]
    Unexpected {
        expected: String,
        found: String,
        position: usize,
    },
    #[error("Unexpected end of expression at token {position}")]
    UnexpectedEOF { position: usize },
    #[error("No alternative matched at token {position}")]
    NoAlternative { position: usize },
    #[error("Unconsumed input starting at token {position}: {found}")]
    TrailingInput { found: String, position: usize },
    #[error("Fail: {0}")]
    Fail(String),
    #[error("{message}: {inner}")]
    WithContext {
        message: String,
        inner: Box<ParseError>,
    },
}

impl ParseError {
    /// The innermost error, without the context chain.
    pub fn root_cause(&self) -> &ParseError {
        match self {
            ParseError::WithContext { inner, .. } => inner.root_cause(),
            other => other,
        }
    }
}
