//! Token-level parser for rule expressions.
//!
//! [`parse_rule`] is the entry point used by the schema loader: it tokenizes
//! the source, drops trivia, parses one [`Expression`] and rejects unconsumed
//! tokens and built-in calls with the wrong number of arguments.

pub mod combinators;
pub mod core;
pub mod expression;
pub mod prelude;

pub use core::ParseError;
pub use core::ParseResult;
pub use core::Parser;

use thiserror::Error;

use crate::ast::Expression;
use crate::tokenizer::token::{significant, Tokenizer, TokenizerError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleSyntaxError {
    #[error("{0}")]
    Tokenize(#[from] TokenizerError),
    #[error("{0}")]
    Parse(#[from] ParseError),
}

#[tracing::instrument(level = "debug")]
pub fn parse_rule(source: &str) -> Result<Expression, RuleSyntaxError> {
    let tokens = significant(Tokenizer::new().tokenize(source)?);
    let (pos, expr) = expression::parse_expression().parse(&tokens, 0)?;
    if let Some(token) = tokens.get(pos) {
        return Err(ParseError::TrailingInput {
            found: token.to_string(),
            position: pos,
        }
        .into());
    }
    check_arity(&expr)?;
    Ok(expr)
}

fn check_arity(expr: &Expression) -> Result<(), ParseError> {
    match expr {
        Expression::Literal(_) | Expression::Reference(_) => Ok(()),
        Expression::Array(items) => items.iter().try_for_each(check_arity),
        Expression::Unary { operand, .. } => check_arity(operand),
        Expression::BinaryOp { left, right, .. } => {
            check_arity(left)?;
            check_arity(right)
        }
        Expression::FunctionCall {
            function,
            arguments,
        } => {
            if arguments.len() != function.arity() {
                return Err(ParseError::Fail(format!(
                    "{} takes {} argument(s), got {}",
                    function,
                    function.arity(),
                    arguments.len()
                )));
            }
            arguments.iter().try_for_each(check_arity)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trailing_input() {
        let err = parse_rule("a b").unwrap_err();
        assert_eq!(
            err,
            RuleSyntaxError::Parse(ParseError::TrailingInput {
                found: "b".to_string(),
                position: 1
            })
        );
    }

    #[test]
    fn test_empty_source() {
        assert!(matches!(
            parse_rule("   "),
            Err(RuleSyntaxError::Parse(_))
        ));
    }

    #[test]
    fn test_wrong_arity() {
        let err = parse_rule("contains(a)").unwrap_err();
        assert!(err.to_string().contains("contains takes 2"));
    }

    #[test]
    fn test_unknown_function_is_rejected() {
        // `eval` is not a built-in, so `(x)` is left over
        assert!(parse_rule("eval(x)").is_err());
    }

    #[test]
    fn test_tokenize_error() {
        assert!(matches!(
            parse_rule("a ; b"),
            Err(RuleSyntaxError::Tokenize(_))
        ));
    }
}
