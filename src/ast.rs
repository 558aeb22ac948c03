//! # Rule Expression AST
//!
//! Conditions, formulas and APPEND expressions are parsed once, at schema
//! build time, into the [`Expression`] tree defined here and evaluated by the
//! tree-walking interpreter in [`eval`](crate::eval). The grammar is closed:
//! there are no assignments, loops or user-defined functions.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Literal(Literal),
    /// A field reference resolved against the answer root.
    Reference(Address),
    /// Array literal, e.g. `['A', 'B']`.
    Array(Vec<Expression>),
    Unary {
        op: UnaryOperator,
        operand: Box<Expression>,
    },
    BinaryOp {
        op: BinaryOperator,
        left: Box<Expression>,
        right: Box<Expression>,
    },
    FunctionCall {
        function: Builtin,
        arguments: Vec<Expression>,
    },
}

impl Expression {
    /// Every field reference read by this expression, in source order.
    pub fn references(&self) -> Vec<&Address> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Address>) {
        match self {
            Expression::Literal(_) => {}
            Expression::Reference(address) => out.push(address),
            Expression::Array(items) => items.iter().for_each(|e| e.collect_references(out)),
            Expression::Unary { operand, .. } => operand.collect_references(out),
            Expression::BinaryOp { left, right, .. } => {
                left.collect_references(out);
                right.collect_references(out);
            }
            Expression::FunctionCall { arguments, .. } => {
                arguments.iter().for_each(|e| e.collect_references(out))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum UnaryOperator {
    #[strum(serialize = "!")]
    Not,
    #[strum(serialize = "-")]
    Negate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
pub enum BinaryOperator {
    #[strum(serialize = "+")]
    Add,
    #[strum(serialize = "-")]
    Subtract,
    #[strum(serialize = "*")]
    Multiply,
    #[strum(serialize = "/")]
    Divide,
    #[strum(serialize = "==")]
    Equal,
    #[strum(serialize = "!=")]
    NotEqual,
    #[strum(serialize = "<")]
    LessThan,
    #[strum(serialize = ">")]
    GreaterThan,
    #[strum(serialize = "<=")]
    LessThanEqual,
    #[strum(serialize = ">=")]
    GreaterThanEqual,
    #[strum(serialize = "&&")]
    And,
    #[strum(serialize = "||")]
    Or,
}

/// The fixed set of functions callable from rule expressions.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::EnumString, strum::Display,
)]
pub enum Builtin {
    /// `contains(haystack, needle)`: substring test or array membership.
    #[strum(serialize = "contains")]
    Contains,
    /// `in(value, array)`: array membership.
    #[strum(serialize = "in")]
    In,
    /// `isEmpty(x)`: null, empty string or empty array.
    #[strum(serialize = "isEmpty")]
    IsEmpty,
    /// `len(x)`: length of a string or array.
    #[strum(serialize = "len")]
    Len,
}

impl Builtin {
    pub fn arity(&self) -> usize {
        match self {
            Builtin::Contains | Builtin::In => 2,
            Builtin::IsEmpty | Builtin::Len => 1,
        }
    }
}

/// A dot/bracket path such as `a.b[2].c` or `items[$i].qty`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address(pub Vec<Segment>);

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Segment {
    Field(String),
    Index(IndexRef),
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexRef {
    Concrete(usize),
    /// Bound to the current row of an enclosing repeating group (`$i`, `$j`, ...).
    Variable(String),
}

impl Address {
    pub fn field(key: &str) -> Self {
        Address(vec![Segment::Field(key.to_string())])
    }

    pub fn segments(&self) -> &[Segment] {
        &self.0
    }

    /// The schema path of this address, with every index segment removed.
    pub fn field_path(&self) -> String {
        self.0
            .iter()
            .filter_map(|s| match s {
                Segment::Field(name) => Some(name.as_str()),
                Segment::Index(_) => None,
            })
            .collect::<Vec<_>>()
            .join(".")
    }

    /// Concrete row indices in path order, or `None` if an index is a variable.
    pub fn concrete_indices(&self) -> Option<Vec<usize>> {
        self.0
            .iter()
            .filter_map(|s| match s {
                Segment::Index(IndexRef::Concrete(i)) => Some(Some(*i)),
                Segment::Index(IndexRef::Variable(_)) => Some(None),
                Segment::Field(_) => None,
            })
            .collect()
    }

    pub fn push_field(&mut self, key: &str) {
        self.0.push(Segment::Field(key.to_string()));
    }

    pub fn push_index(&mut self, index: usize) {
        self.0.push(Segment::Index(IndexRef::Concrete(index)));
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                Segment::Field(name) if i == 0 => write!(f, "{}", name)?,
                Segment::Field(name) => write!(f, ".{}", name)?,
                Segment::Index(IndexRef::Concrete(idx)) => write!(f, "[{}]", idx)?,
                Segment::Index(IndexRef::Variable(var)) => write!(f, "[${}]", var)?,
            }
        }
        Ok(())
    }
}

/// Position of an index variable in the binding stack: `$i` is the outermost
/// repeating group, `$j` the next one, and so on.
pub fn index_variable_depth(name: &str) -> Option<usize> {
    let mut chars = name.chars();
    match (chars.next(), chars.next()) {
        (Some(c @ 'i'..='z'), None) => Some(c as usize - 'i' as usize),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_display_and_field_path() {
        let address = Address(vec![
            Segment::Field("items".to_string()),
            Segment::Index(IndexRef::Variable("i".to_string())),
            Segment::Field("qty".to_string()),
        ]);
        assert_eq!(address.to_string(), "items[$i].qty");
        assert_eq!(address.field_path(), "items.qty");
        assert_eq!(address.concrete_indices(), None);
    }

    #[test]
    fn test_concrete_indices() {
        let mut address = Address::field("items");
        address.push_index(2);
        address.push_field("qty");
        assert_eq!(address.concrete_indices(), Some(vec![2]));
    }

    #[test]
    fn test_index_variable_depth() {
        assert_eq!(index_variable_depth("i"), Some(0));
        assert_eq!(index_variable_depth("j"), Some(1));
        assert_eq!(index_variable_depth("k"), Some(2));
        assert_eq!(index_variable_depth("a"), None);
        assert_eq!(index_variable_depth("ij"), None);
    }

    #[test]
    fn test_references() {
        let expr = Expression::BinaryOp {
            op: BinaryOperator::Multiply,
            left: Box::new(Expression::Reference(Address::field("qty"))),
            right: Box::new(Expression::FunctionCall {
                function: Builtin::Len,
                arguments: vec![Expression::Reference(Address::field("tags"))],
            }),
        };
        let refs: Vec<String> = expr.references().iter().map(|a| a.to_string()).collect();
        assert_eq!(refs, vec!["qty", "tags"]);
    }
}
