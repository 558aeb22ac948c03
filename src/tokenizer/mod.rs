//! # Rule Tokenizer
//!
//! Lexical analysis for predicate conditions and formulas. Raw expression text
//! such as `this.items[$i].qty * this.price > 100` is turned into a stream of
//! [`TokenSpan`](token::TokenSpan)s that the [`analyzer`](crate::analyzer)
//! consumes to build an [`Expression`](crate::ast::Expression).
//!
//! ## Component Structure
//!
//! * [`token`]: token types and the [`Tokenizer`](token::Tokenizer) driver
//! * [`keyword`]: reserved words (`true`, `false`, `null`, `this`)
//! * [`symbol`]: operators and delimiters
//! * [`literal`]: string and number literals
//! * [`whitespace`]: spaces and line breaks
//!
//! Whitespace is kept as tokens so spans stay exact; the parser works on
//! [`significant`](token::significant) tokens only.

pub mod keyword;
pub mod literal;
pub mod symbol;
pub mod token;
pub mod whitespace;
