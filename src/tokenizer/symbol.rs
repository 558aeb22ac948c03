//! # Symbol Token Handling
//!
//! Operators and delimiters of the rule grammar. Multi-character operators are
//! matched before their single-character prefixes (longest match), so `>=` is
//! never read as `>` followed by `=`.

use strum_macros::{AsRefStr, Display, EnumString};

use nom::{
    branch::alt,
    bytes::complete::tag,
    combinator::{map, value},
    error::context,
};

use super::token::{ParserResult, Token};

/// Operators recognised by the rule grammar. `Minus` doubles as unary
/// negation; the parser decides which from its position.
#[derive(Debug, Clone, Copy, PartialEq, EnumString, Display, AsRefStr)]
pub enum Operator {
    #[strum(serialize = ".")]
    Dot,

    // comparison
    #[strum(serialize = "==")]
    EqualEqual,
    #[strum(serialize = "!=")]
    NotEqual,
    #[strum(serialize = ">")]
    Greater,
    #[strum(serialize = ">=")]
    GreaterEqual,
    #[strum(serialize = "<")]
    Less,
    #[strum(serialize = "<=")]
    LessEqual,

    // arithmetic
    #[strum(serialize = "+")]
    Plus,
    #[strum(serialize = "-")]
    Minus,
    #[strum(serialize = "*")]
    Multiply,
    #[strum(serialize = "/")]
    Divide,

    // logic, null counts as false
    #[strum(serialize = "&&")]
    And,
    #[strum(serialize = "||")]
    Or,
    #[strum(serialize = "!")]
    Not,
}

/// Parentheses group and call, brackets index and build arrays.
#[derive(Debug, Clone, Copy, PartialEq, EnumString, Display, AsRefStr)]
pub enum Delimiter {
    #[strum(serialize = "(")]
    OpenParen,
    #[strum(serialize = ")")]
    CloseParen,
    #[strum(serialize = "[")]
    OpenBracket,
    #[strum(serialize = "]")]
    CloseBracket,
    #[strum(serialize = ",")]
    Comma,
}

/// Parses an operator token.
///
/// ```
/// # use form_runtime::tokenizer::symbol::{parse_operator, Operator};
/// # use form_runtime::tokenizer::token::Token;
/// let (rest, token) = parse_operator(">= 18").unwrap();
/// assert_eq!(token, Token::Operator(Operator::GreaterEqual));
/// assert_eq!(rest, " 18");
/// ```
#[tracing::instrument(level = "trace", skip(input))]
pub fn parse_operator(input: &str) -> ParserResult<Token> {
    context(
        "operator",
        map(
            alt((
                // Multi-character operators (matched first for longest-match)
                value(Operator::EqualEqual, tag("==")),
                value(Operator::NotEqual, tag("!=")),
                value(Operator::GreaterEqual, tag(">=")),
                value(Operator::LessEqual, tag("<=")),
                value(Operator::And, tag("&&")),
                value(Operator::Or, tag("||")),
                // Single-character operators
                value(Operator::Dot, tag(".")),
                value(Operator::Greater, tag(">")),
                value(Operator::Less, tag("<")),
                value(Operator::Plus, tag("+")),
                value(Operator::Minus, tag("-")),
                value(Operator::Multiply, tag("*")),
                value(Operator::Divide, tag("/")),
                value(Operator::Not, tag("!")),
            )),
            Token::Operator,
        ),
    )(input)
}

/// Parses a delimiter token.
#[tracing::instrument(level = "trace", skip(input))]
pub fn parse_delimiter(input: &str) -> ParserResult<Token> {
    context(
        "delimiter",
        map(
            alt((
                value(Delimiter::OpenParen, tag("(")),
                value(Delimiter::CloseParen, tag(")")),
                value(Delimiter::OpenBracket, tag("[")),
                value(Delimiter::CloseBracket, tag("]")),
                value(Delimiter::Comma, tag(",")),
            )),
            Token::Delimiter,
        ),
    )(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn operator(input: &str) -> Operator {
        match parse_operator(input) {
            Ok(("", Token::Operator(op))) => op,
            other => panic!("{} did not lex as one operator: {:?}", input, other),
        }
    }

    #[test]
    fn test_longest_match_wins() {
        assert_eq!(operator("=="), Operator::EqualEqual);
        assert_eq!(operator("!="), Operator::NotEqual);
        assert_eq!(operator(">="), Operator::GreaterEqual);
        assert_eq!(operator("<="), Operator::LessEqual);
        assert_eq!(operator("&&"), Operator::And);
        assert_eq!(operator("||"), Operator::Or);
        assert_eq!(operator("!"), Operator::Not);
        assert_eq!(operator("."), Operator::Dot);
    }

    #[test]
    fn test_display_matches_source() {
        for source in ["==", "<=", "*", "||"] {
            assert_eq!(operator(source).to_string(), source);
        }
        assert_eq!(Delimiter::OpenBracket.to_string(), "[");
    }

    #[test]
    fn test_delimiters() {
        let (rest, token) = parse_delimiter("(a, b)").unwrap();
        assert_eq!(token, Token::Delimiter(Delimiter::OpenParen));
        assert_eq!(rest, "a, b)");
        assert_eq!(
            parse_delimiter("]").unwrap().1,
            Token::Delimiter(Delimiter::CloseBracket)
        );
    }

    #[test]
    fn test_rejects_assignment_and_unknown_symbols() {
        // a single `=` is not part of the grammar
        assert!(parse_operator("= 1").is_err());
        assert!(parse_operator(";").is_err());
        assert!(parse_delimiter("{").is_err());
    }
}
