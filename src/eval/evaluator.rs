use std::cmp::Ordering;

use crate::ast::{Address, BinaryOperator, Builtin, Expression, UnaryOperator};

use super::{EvalContext, EvalError, EvalResult, Value};

/// Intermediate result: a reference to a path outside the schema stays
/// distinguishable from an empty field until an operator decides.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Value(Value),
    Unresolved(Address),
}

impl Operand {
    fn into_value(self) -> Value {
        match self {
            Operand::Value(v) => v,
            Operand::Unresolved(_) => Value::Null,
        }
    }

    /// The operand as a value that an operator needs to be non-null.
    fn required(self) -> EvalResult<Value> {
        match self {
            Operand::Value(v) => Ok(v),
            Operand::Unresolved(address) => {
                Err(EvalError::UnresolvedReference(address.to_string()))
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ExpressionEvaluator;

impl ExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    /// Evaluates a formula. `Value::Null` means "no value".
    pub fn evaluate(&self, expr: &Expression, ctx: &EvalContext<'_>) -> EvalResult<Value> {
        self.eval_operand(expr, ctx).map(Operand::into_value)
    }

    /// Evaluates a predicate condition: `null` is false, other non-booleans
    /// are rejected.
    pub fn evaluate_condition(&self, expr: &Expression, ctx: &EvalContext<'_>) -> EvalResult<bool> {
        match self.evaluate(expr, ctx)? {
            Value::Boolean(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(EvalError::NonBooleanCondition(other.kind().to_string())),
        }
    }

    fn eval_operand(&self, expr: &Expression, ctx: &EvalContext<'_>) -> EvalResult<Operand> {
        match expr {
            Expression::Literal(lit) => Ok(Operand::Value(Value::from(lit))),
            Expression::Reference(address) => self.eval_reference(address, ctx),
            Expression::Array(items) => items
                .iter()
                .map(|item| self.evaluate(item, ctx))
                .collect::<EvalResult<Vec<_>>>()
                .map(|values| Operand::Value(Value::List(values))),
            Expression::Unary { op, operand } => {
                let operand = self.eval_operand(operand, ctx)?;
                match op {
                    UnaryOperator::Not => self.eval_not(operand, ctx).map(Operand::Value),
                    UnaryOperator::Negate => self.eval_negate(operand, ctx).map(Operand::Value),
                }
            }
            Expression::BinaryOp { op, left, right } => {
                self.eval_binary_op(op, left, right, ctx).map(Operand::Value)
            }
            Expression::FunctionCall {
                function,
                arguments,
            } => self
                .eval_function_call(function, arguments, ctx)
                .map(Operand::Value),
        }
    }

    fn eval_reference(&self, address: &Address, ctx: &EvalContext<'_>) -> EvalResult<Operand> {
        let concrete = ctx.bindings.bind(address)?;
        if let Some(json) = ctx.answers.get(&concrete) {
            return Ok(Operand::Value(Value::from(json)));
        }
        if ctx.is_known(address) {
            Ok(Operand::Value(Value::Null))
        } else {
            Ok(Operand::Unresolved(concrete))
        }
    }

    fn eval_binary_op(
        &self,
        op: &BinaryOperator,
        left: &Expression,
        right: &Expression,
        ctx: &EvalContext<'_>,
    ) -> EvalResult<Value> {
        // && and || short-circuit
        match op {
            BinaryOperator::And => {
                if !self.truthy(self.eval_operand(left, ctx)?, ctx)? {
                    return Ok(Value::Boolean(false));
                }
                let right = self.eval_operand(right, ctx)?;
                return self.truthy(right, ctx).map(Value::Boolean);
            }
            BinaryOperator::Or => {
                if self.truthy(self.eval_operand(left, ctx)?, ctx)? {
                    return Ok(Value::Boolean(true));
                }
                let right = self.eval_operand(right, ctx)?;
                return self.truthy(right, ctx).map(Value::Boolean);
            }
            _ => {}
        }

        let left_val = self.eval_operand(left, ctx)?;
        let right_val = self.eval_operand(right, ctx)?;

        match op {
            BinaryOperator::Add => self.eval_arithmetic(op, left_val, right_val, ctx),
            BinaryOperator::Subtract => self.eval_arithmetic(op, left_val, right_val, ctx),
            BinaryOperator::Multiply => self.eval_arithmetic(op, left_val, right_val, ctx),
            BinaryOperator::Divide => self.eval_arithmetic(op, left_val, right_val, ctx),
            BinaryOperator::Equal => Ok(Value::Boolean(
                left_val.into_value().loose_eq(&right_val.into_value()),
            )),
            BinaryOperator::NotEqual => Ok(Value::Boolean(
                !left_val.into_value().loose_eq(&right_val.into_value()),
            )),
            BinaryOperator::LessThan => {
                self.compare_values(op, left_val, right_val, ctx, Ordering::is_lt)
            }
            BinaryOperator::GreaterThan => {
                self.compare_values(op, left_val, right_val, ctx, Ordering::is_gt)
            }
            BinaryOperator::LessThanEqual => {
                self.compare_values(op, left_val, right_val, ctx, Ordering::is_le)
            }
            BinaryOperator::GreaterThanEqual => {
                self.compare_values(op, left_val, right_val, ctx, Ordering::is_ge)
            }
            BinaryOperator::And | BinaryOperator::Or => Ok(Value::Null),
        }
    }

    fn truthy(&self, operand: Operand, ctx: &EvalContext<'_>) -> EvalResult<bool> {
        match operand.into_value() {
            Value::Boolean(b) => Ok(b),
            Value::Null => Ok(false),
            other if ctx.strict => Err(EvalError::TypeMismatch(format!(
                "logical operator on {}",
                other.kind()
            ))),
            _ => Ok(false),
        }
    }

    fn eval_not(&self, operand: Operand, ctx: &EvalContext<'_>) -> EvalResult<Value> {
        self.truthy(operand, ctx).map(|b| Value::Boolean(!b))
    }

    fn eval_negate(&self, operand: Operand, ctx: &EvalContext<'_>) -> EvalResult<Value> {
        match operand.required()? {
            Value::Null => Ok(Value::Null),
            Value::Integer(i) => Ok(i
                .checked_neg()
                .map(Value::Integer)
                .unwrap_or(Value::Float(-(i as f64)))),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => self.mismatch(format!("-{}", other.kind()), ctx),
        }
    }

    fn eval_arithmetic(
        &self,
        op: &BinaryOperator,
        left: Operand,
        right: Operand,
        ctx: &EvalContext<'_>,
    ) -> EvalResult<Value> {
        let left = left.required()?;
        let right = right.required()?;
        if left.is_null() || right.is_null() {
            return Ok(Value::Null);
        }
        match op {
            BinaryOperator::Add => self.eval_add(&left, &right, ctx),
            BinaryOperator::Subtract => self.eval_subtract(&left, &right, ctx),
            BinaryOperator::Multiply => self.eval_multiply(&left, &right, ctx),
            _ => self.eval_divide(&left, &right, ctx),
        }
    }

    fn eval_add(&self, left: &Value, right: &Value, ctx: &EvalContext<'_>) -> EvalResult<Value> {
        match (left, right) {
            (Value::Integer(l), Value::Integer(r)) => Ok(l
                .checked_add(*r)
                .map(Value::Integer)
                .unwrap_or(Value::Float(*l as f64 + *r as f64))),
            (Value::String(l), Value::String(r)) => Ok(Value::String(l.clone() + r)),
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => Ok(Value::Float(l + r)),
                _ => self.mismatch(format!("{} + {}", left.kind(), right.kind()), ctx),
            },
        }
    }

    fn eval_subtract(
        &self,
        left: &Value,
        right: &Value,
        ctx: &EvalContext<'_>,
    ) -> EvalResult<Value> {
        match (left, right) {
            (Value::Integer(l), Value::Integer(r)) => Ok(l
                .checked_sub(*r)
                .map(Value::Integer)
                .unwrap_or(Value::Float(*l as f64 - *r as f64))),
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => Ok(Value::Float(l - r)),
                _ => self.mismatch(format!("{} - {}", left.kind(), right.kind()), ctx),
            },
        }
    }

    fn eval_multiply(
        &self,
        left: &Value,
        right: &Value,
        ctx: &EvalContext<'_>,
    ) -> EvalResult<Value> {
        match (left, right) {
            (Value::Integer(l), Value::Integer(r)) => Ok(l
                .checked_mul(*r)
                .map(Value::Integer)
                .unwrap_or(Value::Float(*l as f64 * *r as f64))),
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => Ok(Value::Float(l * r)),
                _ => self.mismatch(format!("{} * {}", left.kind(), right.kind()), ctx),
            },
        }
    }

    fn eval_divide(&self, left: &Value, right: &Value, ctx: &EvalContext<'_>) -> EvalResult<Value> {
        match (left, right) {
            (Value::Integer(_), Value::Integer(0)) => Err(EvalError::DivisionByZero),
            (Value::Integer(l), Value::Integer(r)) => match (l.checked_rem(*r), l.checked_div(*r)) {
                (Some(0), Some(quotient)) => Ok(Value::Integer(quotient)),
                _ => Ok(Value::Float(*l as f64 / *r as f64)),
            },
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(_), Some(r)) if r == 0.0 => Err(EvalError::DivisionByZero),
                (Some(l), Some(r)) => Ok(Value::Float(l / r)),
                _ => self.mismatch(format!("{} / {}", left.kind(), right.kind()), ctx),
            },
        }
    }

    fn compare_values<F>(
        &self,
        op: &BinaryOperator,
        left: Operand,
        right: Operand,
        ctx: &EvalContext<'_>,
        compare: F,
    ) -> EvalResult<Value>
    where
        F: Fn(Ordering) -> bool,
    {
        let left = left.required()?;
        let right = right.required()?;
        let ordering = match (&left, &right) {
            (Value::Null, _) | (_, Value::Null) => return Ok(Value::Boolean(false)),
            (Value::Integer(l), Value::Integer(r)) => Some(l.cmp(r)),
            (Value::String(l), Value::String(r)) => Some(l.cmp(r)),
            _ => match (left.as_f64(), right.as_f64()) {
                (Some(l), Some(r)) => l.partial_cmp(&r),
                _ => {
                    return self
                        .mismatch(format!("{} {} {}", left.kind(), op, right.kind()), ctx)
                        .map(|v| Value::Boolean(!v.is_null()))
                }
            },
        };
        Ok(Value::Boolean(ordering.map(compare).unwrap_or(false)))
    }

    fn eval_function_call(
        &self,
        function: &Builtin,
        arguments: &[Expression],
        ctx: &EvalContext<'_>,
    ) -> EvalResult<Value> {
        if arguments.len() != function.arity() {
            return Err(EvalError::Arity {
                function: function.to_string(),
                expected: function.arity(),
                found: arguments.len(),
            });
        }
        let args = arguments
            .iter()
            .map(|arg| self.eval_operand(arg, ctx))
            .collect::<EvalResult<Vec<_>>>()?;
        let mut args = args.into_iter();
        let mut next = || args.next().unwrap_or(Operand::Value(Value::Null));

        match function {
            Builtin::Contains => {
                let haystack = next().required()?;
                let needle = next().into_value();
                self.eval_contains(&haystack, &needle, ctx)
            }
            Builtin::In => {
                let value = next().into_value();
                match next().into_value() {
                    Value::Null => Ok(Value::Boolean(false)),
                    Value::List(items) => {
                        Ok(Value::Boolean(items.iter().any(|item| item.loose_eq(&value))))
                    }
                    other => self
                        .mismatch(format!("in(_, {})", other.kind()), ctx)
                        .map(|_| Value::Boolean(false)),
                }
            }
            Builtin::IsEmpty => Ok(Value::Boolean(match next().into_value() {
                Value::Null => true,
                Value::String(s) => s.is_empty(),
                Value::List(items) => items.is_empty(),
                Value::Map(map) => map.is_empty(),
                _ => false,
            })),
            Builtin::Len => match next().into_value() {
                Value::Null => Ok(Value::Integer(0)),
                Value::String(s) => Ok(Value::Integer(s.chars().count() as i64)),
                Value::List(items) => Ok(Value::Integer(items.len() as i64)),
                Value::Map(map) => Ok(Value::Integer(map.len() as i64)),
                other => self.mismatch(format!("len({})", other.kind()), ctx),
            },
        }
    }

    fn eval_contains(
        &self,
        haystack: &Value,
        needle: &Value,
        ctx: &EvalContext<'_>,
    ) -> EvalResult<Value> {
        match (haystack, needle) {
            (Value::Null, _) => Ok(Value::Boolean(false)),
            (Value::String(h), Value::String(n)) => Ok(Value::Boolean(h.contains(n.as_str()))),
            (Value::String(_), Value::Null) => Ok(Value::Boolean(false)),
            (Value::List(items), _) => {
                Ok(Value::Boolean(items.iter().any(|item| item.loose_eq(needle))))
            }
            _ => self
                .mismatch(
                    format!("contains({}, {})", haystack.kind(), needle.kind()),
                    ctx,
                )
                .map(|_| Value::Boolean(false)),
        }
    }

    /// Incompatible kinds: an error in strict mode, otherwise "no value".
    fn mismatch(&self, message: String, ctx: &EvalContext<'_>) -> EvalResult<Value> {
        if ctx.strict {
            Err(EvalError::TypeMismatch(message))
        } else {
            Ok(Value::Null)
        }
    }
}
