//! Expression grammar over significant tokens.
//!
//! Precedence, lowest first: `||`, `&&`, `== !=`, `> < >= <=`, `+ -`, `* /`,
//! unary `! -`, then primaries. Every binary level is left associative.

use std::str::FromStr;

use super::{core::Parser, prelude::*};
use crate::ast::{
    Address, BinaryOperator, Builtin, Expression, IndexRef, Literal, Segment, UnaryOperator,
};
use crate::tokenizer::{
    keyword::Keyword,
    literal::Literal as TokenLiteral,
    symbol::{Delimiter, Operator},
    token::Token,
};

pub fn parse_expression() -> impl Parser<Token, Expression> {
    with_context(parse_logical_or(), "expression")
}

fn fold_binary((first, rest): (Expression, Vec<(BinaryOperator, Expression)>)) -> Expression {
    rest.into_iter()
        .fold(first, |left, (op, right)| Expression::BinaryOp {
            op,
            left: Box::new(left),
            right: Box::new(right),
        })
}

/// One left-associative precedence level: `operand (operator operand)*`.
fn binary_level<F, P, Q>(
    operand: F,
    operator: Q,
    context: &'static str,
) -> impl Parser<Token, Expression>
where
    F: Fn() -> P,
    P: Parser<Token, Expression>,
    Q: Parser<Token, BinaryOperator>,
{
    with_context(
        map(tuple2(operand(), many(tuple2(operator, operand()))), fold_binary),
        context,
    )
}

fn parse_logical_or() -> impl Parser<Token, Expression> {
    binary_level(
        parse_logical_and,
        binary_operator(Operator::Or, BinaryOperator::Or),
        "logical or",
    )
}

fn parse_logical_and() -> impl Parser<Token, Expression> {
    binary_level(
        parse_equality,
        binary_operator(Operator::And, BinaryOperator::And),
        "logical and",
    )
}

fn parse_equality() -> impl Parser<Token, Expression> {
    binary_level(
        parse_comparison,
        choice(vec![
            Box::new(binary_operator(Operator::EqualEqual, BinaryOperator::Equal)),
            Box::new(binary_operator(Operator::NotEqual, BinaryOperator::NotEqual)),
        ]),
        "equality",
    )
}

fn parse_comparison() -> impl Parser<Token, Expression> {
    binary_level(
        parse_additive,
        choice(vec![
            Box::new(binary_operator(
                Operator::GreaterEqual,
                BinaryOperator::GreaterThanEqual,
            )),
            Box::new(binary_operator(
                Operator::LessEqual,
                BinaryOperator::LessThanEqual,
            )),
            Box::new(binary_operator(Operator::Greater, BinaryOperator::GreaterThan)),
            Box::new(binary_operator(Operator::Less, BinaryOperator::LessThan)),
        ]),
        "comparison",
    )
}

fn parse_additive() -> impl Parser<Token, Expression> {
    binary_level(
        parse_multiplicative,
        choice(vec![
            Box::new(binary_operator(Operator::Plus, BinaryOperator::Add)),
            Box::new(binary_operator(Operator::Minus, BinaryOperator::Subtract)),
        ]),
        "additive",
    )
}

// 乗除算 (*, /)
fn parse_multiplicative() -> impl Parser<Token, Expression> {
    binary_level(
        parse_unary,
        choice(vec![
            Box::new(binary_operator(Operator::Multiply, BinaryOperator::Multiply)),
            Box::new(binary_operator(Operator::Divide, BinaryOperator::Divide)),
        ]),
        "multiplicative",
    )
}

fn binary_operator(token: Operator, op: BinaryOperator) -> impl Parser<Token, BinaryOperator> {
    map(equal(Token::Operator(token)), move |_| op)
}

fn parse_unary() -> impl Parser<Token, Expression> {
    with_context(
        choice(vec![
            Box::new(map(
                tuple2(unary_operator(Operator::Not, UnaryOperator::Not), lazy(parse_unary)),
                |(op, operand)| Expression::Unary {
                    op,
                    operand: Box::new(operand),
                },
            )),
            Box::new(map(
                tuple2(
                    unary_operator(Operator::Minus, UnaryOperator::Negate),
                    lazy(parse_unary),
                ),
                |(op, operand)| Expression::Unary {
                    op,
                    operand: Box::new(operand),
                },
            )),
            Box::new(parse_primary()),
        ]),
        "unary",
    )
}

fn unary_operator(token: Operator, op: UnaryOperator) -> impl Parser<Token, UnaryOperator> {
    map(equal(Token::Operator(token)), move |_| op)
}

fn parse_primary() -> impl Parser<Token, Expression> {
    with_context(
        choice(vec![
            Box::new(map(parse_literal(), Expression::Literal)),
            Box::new(parse_function_call()),
            Box::new(map(parse_reference(), Expression::Reference)),
            Box::new(map(parse_array(), Expression::Array)),
            Box::new(delimited(
                as_unit(delimiter(Delimiter::OpenParen)),
                lazy(parse_expression),
                as_unit(delimiter(Delimiter::CloseParen)),
            )),
        ]),
        "primary",
    )
}

fn parse_literal() -> impl Parser<Token, Literal> {
    with_context(
        satisfy(|token: &Token| match token {
            Token::Literal(TokenLiteral::String(s)) => Some(Literal::String(s.clone())),
            Token::Literal(TokenLiteral::Integer(i)) => Some(Literal::Integer(*i)),
            Token::Literal(TokenLiteral::Float(f)) => Some(Literal::Float(*f)),
            Token::Keyword(Keyword::True) => Some(Literal::Boolean(true)),
            Token::Keyword(Keyword::False) => Some(Literal::Boolean(false)),
            Token::Keyword(Keyword::Null) => Some(Literal::Null),
            _ => None,
        }),
        "literal",
    )
}

fn parse_function_call() -> impl Parser<Token, Expression> {
    with_context(
        map(
            tuple2(
                satisfy(|token: &Token| match token {
                    Token::Identifier(name) => Builtin::from_str(name).ok(),
                    _ => None,
                }),
                delimited(
                    as_unit(delimiter(Delimiter::OpenParen)),
                    separated_list(lazy(parse_expression), as_unit(delimiter(Delimiter::Comma))),
                    as_unit(delimiter(Delimiter::CloseParen)),
                ),
            ),
            |(function, arguments)| Expression::FunctionCall {
                function,
                arguments,
            },
        ),
        "function call",
    )
}

fn parse_array() -> impl Parser<Token, Vec<Expression>> {
    with_context(
        delimited(
            as_unit(delimiter(Delimiter::OpenBracket)),
            separated_list(lazy(parse_expression), as_unit(delimiter(Delimiter::Comma))),
            as_unit(delimiter(Delimiter::CloseBracket)),
        ),
        "array",
    )
}

/// `[this.]name ( .name | [index] )*`
fn parse_reference() -> impl Parser<Token, Address> {
    with_context(
        map(
            tuple2(
                preceded(
                    as_unit(optional(tuple2(
                        equal(Token::Keyword(Keyword::This)),
                        equal(Token::Operator(Operator::Dot)),
                    ))),
                    parse_identifier(),
                ),
                many(parse_segment()),
            ),
            |(first, rest)| {
                Address(
                    std::iter::once(Segment::Field(first))
                        .chain(rest)
                        .collect(),
                )
            },
        ),
        "reference",
    )
}

fn parse_segment() -> impl Parser<Token, Segment> {
    choice(vec![
        Box::new(map(
            preceded(as_unit(equal(Token::Operator(Operator::Dot))), parse_identifier()),
            Segment::Field,
        )),
        Box::new(map(
            delimited(
                as_unit(delimiter(Delimiter::OpenBracket)),
                parse_index(),
                as_unit(delimiter(Delimiter::CloseBracket)),
            ),
            Segment::Index,
        )),
    ])
}

fn parse_index() -> impl Parser<Token, IndexRef> {
    satisfy(|token: &Token| match token {
        Token::Literal(TokenLiteral::Integer(i)) if *i >= 0 => Some(IndexRef::Concrete(*i as usize)),
        Token::IndexVariable(name) => Some(IndexRef::Variable(name.clone())),
        _ => None,
    })
}

fn parse_identifier() -> impl Parser<Token, String> {
    satisfy(|token: &Token| match token {
        Token::Identifier(name) => Some(name.clone()),
        _ => None,
    })
}

fn delimiter(d: Delimiter) -> impl Parser<Token, Token> {
    equal(Token::Delimiter(d))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::parse_rule;
    use pretty_assertions::assert_eq;

    fn reference(path: &str) -> Expression {
        Expression::Reference(Address(
            path.split('.')
                .map(|s| Segment::Field(s.to_string()))
                .collect(),
        ))
    }

    #[test]
    fn test_precedence() {
        let expr = parse_rule("a + b * c").unwrap();
        assert_eq!(
            expr,
            Expression::BinaryOp {
                op: BinaryOperator::Add,
                left: Box::new(reference("a")),
                right: Box::new(Expression::BinaryOp {
                    op: BinaryOperator::Multiply,
                    left: Box::new(reference("b")),
                    right: Box::new(reference("c")),
                }),
            }
        );
    }

    #[test]
    fn test_left_associative() {
        let expr = parse_rule("a - b - c").unwrap();
        let Expression::BinaryOp { left, right, .. } = expr else {
            panic!("expected binary op");
        };
        assert_eq!(*right, reference("c"));
        assert!(matches!(
            *left,
            Expression::BinaryOp {
                op: BinaryOperator::Subtract,
                ..
            }
        ));
    }

    #[test]
    fn test_logical_and_comparison() {
        let expr = parse_rule("maritalStatus == 'Married' && age >= 18").unwrap();
        let Expression::BinaryOp { op, left, right } = expr else {
            panic!("expected binary op");
        };
        assert_eq!(op, BinaryOperator::And);
        assert_eq!(
            *left,
            Expression::BinaryOp {
                op: BinaryOperator::Equal,
                left: Box::new(reference("maritalStatus")),
                right: Box::new(Expression::Literal(Literal::String("Married".into()))),
            }
        );
        assert_eq!(
            *right,
            Expression::BinaryOp {
                op: BinaryOperator::GreaterThanEqual,
                left: Box::new(reference("age")),
                right: Box::new(Expression::Literal(Literal::Integer(18))),
            }
        );
    }

    #[test]
    fn test_this_prefix_and_index() {
        let expr = parse_rule("this.items[$i].qty * items[0].price").unwrap();
        let Expression::BinaryOp { left, right, .. } = expr else {
            panic!("expected binary op");
        };
        assert_eq!(
            *left,
            Expression::Reference(Address(vec![
                Segment::Field("items".into()),
                Segment::Index(IndexRef::Variable("i".into())),
                Segment::Field("qty".into()),
            ]))
        );
        assert_eq!(
            *right,
            Expression::Reference(Address(vec![
                Segment::Field("items".into()),
                Segment::Index(IndexRef::Concrete(0)),
                Segment::Field("price".into()),
            ]))
        );
    }

    #[test]
    fn test_unary_and_parens() {
        let expr = parse_rule("!(a || -b > 2)").unwrap();
        let Expression::Unary { op, operand } = expr else {
            panic!("expected unary");
        };
        assert_eq!(op, UnaryOperator::Not);
        assert!(matches!(
            *operand,
            Expression::BinaryOp {
                op: BinaryOperator::Or,
                ..
            }
        ));
    }

    #[test]
    fn test_builtins_and_arrays() {
        let expr = parse_rule("in(state, ['KA', \"MH\"]) && !isEmpty(name)").unwrap();
        let Expression::BinaryOp { left, .. } = expr else {
            panic!("expected binary op");
        };
        assert_eq!(
            *left,
            Expression::FunctionCall {
                function: Builtin::In,
                arguments: vec![
                    reference("state"),
                    Expression::Array(vec![
                        Expression::Literal(Literal::String("KA".into())),
                        Expression::Literal(Literal::String("MH".into())),
                    ]),
                ],
            }
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(
            parse_rule("null").unwrap(),
            Expression::Literal(Literal::Null)
        );
        assert_eq!(
            parse_rule("1.5").unwrap(),
            Expression::Literal(Literal::Float(1.5))
        );
        assert_eq!(
            parse_rule("false").unwrap(),
            Expression::Literal(Literal::Boolean(false))
        );
    }
}
