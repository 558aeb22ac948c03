//! # Literal Token Handling
//!
//! String literals may be single or double quoted and understand the escapes
//! `\\`, `\"`, `\'`, `\n` and `\t`. Number literals are unsigned; a leading
//! minus is a unary operator handled by the parser so that `qty-1` lexes as
//! three tokens.

use nom::{
    branch::alt,
    bytes::complete::{escaped_transform, is_not, tag},
    character::complete::{char, digit1},
    combinator::{map, map_res, opt, recognize, value},
    error::context,
    sequence::{delimited, tuple},
};

use super::token::{ParserResult, Token};

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    String(String),
    Integer(i64),
    Float(f64),
}

fn parse_quoted<'a>(quote: char, stop: &'static str) -> impl FnMut(&'a str) -> ParserResult<'a, String> {
    delimited(
        char(quote),
        map(
            opt(escaped_transform(
                is_not(stop),
                '\\',
                alt((
                    value("\\", tag("\\")),
                    value("\"", tag("\"")),
                    value("'", tag("'")),
                    value("\n", tag("n")),
                    value("\t", tag("t")),
                )),
            )),
            Option::unwrap_or_default,
        ),
        char(quote),
    )
}

#[tracing::instrument(level = "trace", skip(input))]
fn parse_string_literal(input: &str) -> ParserResult<Literal> {
    context(
        "string literal",
        map(
            alt((parse_quoted('"', "\\\""), parse_quoted('\'', "\\'"))),
            Literal::String,
        ),
    )(input)
}

#[tracing::instrument(level = "trace", skip(input))]
fn parse_float_literal(input: &str) -> ParserResult<Literal> {
    context(
        "float literal",
        map_res(
            recognize(tuple((digit1, char('.'), digit1))),
            |s: &str| s.parse::<f64>().map(Literal::Float),
        ),
    )(input)
}

#[tracing::instrument(level = "trace", skip(input))]
fn parse_integer_literal(input: &str) -> ParserResult<Literal> {
    context(
        "integer literal",
        map_res(digit1, |s: &str| s.parse::<i64>().map(Literal::Integer)),
    )(input)
}

#[tracing::instrument(level = "trace", skip(input))]
pub fn parse_literal(input: &str) -> ParserResult<Token> {
    context(
        "literal",
        map(
            alt((
                parse_string_literal,
                parse_float_literal,
                parse_integer_literal,
            )),
            Token::Literal,
        ),
    )(input)
}
