//! # Whitespace Token Handling
//!
//! Spaces, tabs and line breaks are preserved as tokens so that spans of the
//! surrounding tokens stay exact for error reporting.

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    combinator::map,
    error::context,
};

use super::token::{ParserResult, Token};

/// Parses a run of spaces and tabs.
///
/// ```
/// # use form_runtime::tokenizer::whitespace::parse_whitespace;
/// # use form_runtime::tokenizer::token::Token;
/// let (rest, token) = parse_whitespace("   qty").unwrap();
/// assert_eq!(token, Token::Whitespace("   ".to_string()));
/// assert_eq!(rest, "qty");
/// ```
#[tracing::instrument(level = "trace", skip(input))]
pub fn parse_whitespace(input: &str) -> ParserResult<Token> {
    context(
        "whitespace expected",
        map(take_while1(|c| c == ' ' || c == '\t'), |ws: &str| {
            Token::Whitespace(ws.to_string())
        }),
    )(input)
}

/// Parses a Unix (`\n`) or Windows (`\r\n`) line break.
#[tracing::instrument(level = "trace", skip(input))]
pub fn parse_newline(input: &str) -> ParserResult<Token> {
    context(
        "newline expected",
        map(alt((tag("\r\n"), tag("\n"))), |_| Token::Newline),
    )(input)
}
