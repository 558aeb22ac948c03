use std::fmt;

use nom::{
    branch::alt,
    bytes::complete::{take_while, take_while1},
    character::complete::char,
    combinator::{map, recognize},
    error::{context, VerboseError},
    sequence::{pair, preceded},
    IResult,
};
use thiserror::Error;

use super::{
    keyword::Keyword,
    literal::{parse_literal, Literal},
    symbol::{parse_delimiter, parse_operator, Delimiter, Operator},
    whitespace::{parse_newline, parse_whitespace},
};

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Keyword(Keyword),
    Identifier(String),
    /// Repeating-row index variable such as `$i`.
    IndexVariable(String),
    Operator(Operator),
    Delimiter(Delimiter),
    Literal(Literal),
    Whitespace(String),
    Newline,
}

impl Token {
    pub fn is_trivia(&self) -> bool {
        matches!(self, Token::Whitespace(_) | Token::Newline)
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Keyword(kw) => write!(f, "{}", kw),
            Token::Identifier(id) => write!(f, "{}", id),
            Token::IndexVariable(name) => write!(f, "${}", name),
            Token::Operator(op) => write!(f, "{}", op),
            Token::Delimiter(d) => write!(f, "{}", d),
            Token::Literal(Literal::String(s)) => write!(f, "{:?}", s),
            Token::Literal(Literal::Integer(i)) => write!(f, "{}", i),
            Token::Literal(Literal::Float(x)) => write!(f, "{}", x),
            Token::Whitespace(ws) => write!(f, "{}", ws),
            Token::Newline => writeln!(f),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Tokenizer {
    current_position: usize,
    current_line: usize,
    current_column: usize,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer {
    pub fn new() -> Self {
        Self {
            current_position: 0,
            current_line: 1,   // 1-based
            current_column: 1, // 1-based
        }
    }

    /// Splits `input` into tokens, trivia included. Positions continue from
    /// wherever the previous call on this tokenizer stopped.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn tokenize(&mut self, input: &str) -> TokenizerResult<Vec<TokenSpan>> {
        let mut tokens = Vec::new();
        let mut remaining = input;
        while !remaining.is_empty() {
            let (rest, token) = lex_one(remaining).map_err(|e| self.error_at(remaining, e))?;
            let (line, column) = (self.current_line, self.current_column);
            let start = self.current_position;
            self.update_position(&remaining[..remaining.len() - rest.len()]);
            tokens.push(TokenSpan {
                token,
                start,
                end: self.current_position,
                line,
                column,
            });
            remaining = rest;
        }
        Ok(tokens)
    }

    fn error_at(&self, remaining: &str, err: nom::Err<VerboseError<&str>>) -> TokenizerError {
        let message = match err {
            nom::Err::Incomplete(needed) => format!("Incomplete input, {:?}", needed),
            nom::Err::Error(e) | nom::Err::Failure(e) => nom::error::convert_error(remaining, e),
        };
        let error = TokenizerError::ParseError {
            message,
            found: remaining.chars().take(20).collect(),
            span: Span {
                start: self.current_position,
                end: self.current_position + 1,
                line: self.current_line,
                column: self.current_column,
            },
        };
        tracing::debug!("{}", error);
        error
    }

    fn update_position(&mut self, text: &str) {
        for c in text.chars() {
            self.current_position += c.len_utf8();
            if c == '\n' {
                self.current_line += 1;
                self.current_column = 1;
            } else {
                self.current_column += 1;
            }
        }
    }
}

/// Drops whitespace and newlines, keeping the tokens the parser cares about.
pub fn significant(spans: Vec<TokenSpan>) -> Vec<Token> {
    spans
        .into_iter()
        .filter(|span| !span.token.is_trivia())
        .map(|span| span.token)
        .collect()
}

#[derive(Debug, Clone)]
pub struct TokenSpan {
    pub token: Token,
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    pub line: usize,
    pub column: usize,
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line: {}, column: {}, start: {}, end: {}",
            self.line, self.column, self.start, self.end
        )
    }
}

fn lex_one(input: &str) -> ParserResult<Token> {
    alt((
        parse_whitespace,
        parse_newline,
        parse_literal,
        parse_index_variable,
        parse_operator,
        parse_delimiter,
        parse_identifier,
    ))(input)
}

fn identifier_body(input: &str) -> ParserResult<&str> {
    recognize(pair(
        take_while1(|c: char| c.is_alphabetic() || c == '_'),
        take_while(|c: char| c.is_alphanumeric() || c == '_'),
    ))(input)
}

#[tracing::instrument(level = "trace", skip(input))]
fn parse_identifier(input: &str) -> ParserResult<Token> {
    let (input, id) = context("identifier", identifier_body)(input)?;

    if let Ok(kw) = Keyword::try_from(id) {
        return Ok((input, Token::Keyword(kw)));
    }

    Ok((input, Token::Identifier(id.to_string())))
}

#[tracing::instrument(level = "trace", skip(input))]
fn parse_index_variable(input: &str) -> ParserResult<Token> {
    context(
        "index variable",
        map(preceded(char('$'), identifier_body), |name: &str| {
            Token::IndexVariable(name.to_string())
        }),
    )(input)
}

pub type ParserResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

pub type TokenizerResult<T> = Result<T, TokenizerError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TokenizerError {
    #[error("Parse error: {message} at position {span}")]
    ParseError {
        message: String,
        found: String,
        span: Span,
    },
}
