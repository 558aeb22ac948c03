//! # Expression Evaluation
//!
//! A pure tree-walking interpreter over [`Expression`](crate::ast::Expression)
//! trees. Evaluation reads the answer snapshot through an [`EvalContext`] and
//! never writes; effects belong to the [`action`](crate::action) executor.
//!
//! Missing values follow a small set of rules:
//!
//! * a field without a value reads as [`Value::Null`]
//! * arithmetic with `null` yields `null`, ordering with `null` yields `false`
//! * `&&`, `||` and `!` treat `null` as `false`
//! * a path that is not a field fails with [`EvalError::UnresolvedReference`]
//!   only where the operator needs a non-null operand
//!
//! In strict mode, operators applied to incompatible kinds fail with
//! [`EvalError::TypeMismatch`] instead of producing `null`/`false`.

pub mod context;
pub mod evaluator;
pub mod value;

pub use context::{EvalContext, FieldScope, IndexBindings};
pub use evaluator::ExpressionEvaluator;
pub use value::Value;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("Unresolved reference: {0}")]
    UnresolvedReference(String),
    #[error("Type mismatch: {0}")]
    TypeMismatch(String),
    #[error("Division by zero")]
    DivisionByZero,
    #[error("{function} takes {expected} argument(s), got {found}")]
    Arity {
        function: String,
        expected: usize,
        found: usize,
    },
    #[error("Condition evaluated to {0}, expected boolean")]
    NonBooleanCondition(String),
    #[error("Unbound index variable {0}")]
    UnboundIndex(String),
}

pub type EvalResult<T> = Result<T, EvalError>;
