use crate::answer::AnswerStore;
use crate::ast::{index_variable_depth, Address, IndexRef, Segment};

use super::{EvalError, EvalResult};

/// Row indices of the enclosing repeating groups, outermost first.
///
/// One entry is pushed per repeating group that encloses the predicate being
/// evaluated; `$i` reads entry 0, `$j` entry 1 and so on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexBindings(Vec<usize>);

impl IndexBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, index: usize) {
        self.0.push(index);
    }

    pub fn pop(&mut self) -> Option<usize> {
        self.0.pop()
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn as_slice(&self) -> &[usize] {
        &self.0
    }

    pub fn lookup(&self, variable: &str) -> EvalResult<usize> {
        index_variable_depth(variable)
            .and_then(|depth| self.0.get(depth).copied())
            .ok_or_else(|| EvalError::UnboundIndex(format!("${}", variable)))
    }

    /// Replaces every index variable in `address` with its bound row.
    pub fn bind(&self, address: &Address) -> EvalResult<Address> {
        address
            .segments()
            .iter()
            .map(|segment| match segment {
                Segment::Index(IndexRef::Variable(var)) => {
                    Ok(Segment::Index(IndexRef::Concrete(self.lookup(var)?)))
                }
                other => Ok(other.clone()),
            })
            .collect::<EvalResult<Vec<_>>>()
            .map(Address)
    }
}

impl From<Vec<usize>> for IndexBindings {
    fn from(indices: Vec<usize>) -> Self {
        Self(indices)
    }
}

/// Answers whether a path (indices removed, e.g. `items.qty`) names a field.
pub trait FieldScope: Send + Sync {
    fn has_field(&self, field_path: &str) -> bool;
}

/// Everything an expression can observe: the answer snapshot, the schema
/// scope used to tell unknown paths from empty fields, and the row bindings.
pub struct EvalContext<'a> {
    pub answers: &'a AnswerStore,
    pub scope: Option<&'a dyn FieldScope>,
    pub bindings: &'a IndexBindings,
    pub strict: bool,
}

impl<'a> EvalContext<'a> {
    pub fn new(answers: &'a AnswerStore, bindings: &'a IndexBindings) -> Self {
        Self {
            answers,
            scope: None,
            bindings,
            strict: false,
        }
    }

    pub fn with_scope(mut self, scope: &'a dyn FieldScope) -> Self {
        self.scope = Some(scope);
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Whether `address` names a field. Without a scope every path does.
    pub fn is_known(&self, address: &Address) -> bool {
        self.scope
            .map(|scope| scope.has_field(&address.field_path()))
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_variables() {
        let bindings = IndexBindings::from(vec![2, 0]);
        let address = Address(vec![
            Segment::Field("items".into()),
            Segment::Index(IndexRef::Variable("i".into())),
            Segment::Field("parts".into()),
            Segment::Index(IndexRef::Variable("j".into())),
        ]);
        assert_eq!(bindings.bind(&address).unwrap().to_string(), "items[2].parts[0]");
    }

    #[test]
    fn test_unbound_variable() {
        let bindings = IndexBindings::from(vec![1]);
        assert_eq!(
            bindings.lookup("j"),
            Err(EvalError::UnboundIndex("$j".into()))
        );
        assert_eq!(
            bindings.lookup("x"),
            Err(EvalError::UnboundIndex("$x".into()))
        );
    }
}
