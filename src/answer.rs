//! The answer tree of one form session.
//!
//! Values live in a JSON tree mirroring the field tree: groups are objects,
//! repeating groups are arrays of row objects. A field without a value is
//! simply absent; `null` is never stored.

use serde_json::{Map, Value as JsonValue};
use thiserror::Error;

use crate::ast::{Address, IndexRef, Segment};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnswerError {
    #[error("Address {0} contains an unbound index variable")]
    UnboundAddress(String),
    #[error("Cannot write through {address}: {found} is not a container")]
    PathConflict { address: String, found: String },
    #[error("Address {0} is empty")]
    EmptyAddress(String),
}

pub type AnswerResult<T> = Result<T, AnswerError>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnswerStore {
    root: Map<String, JsonValue>,
}

enum Step<'a> {
    Key(&'a str),
    Row(usize),
}

fn steps(address: &Address) -> AnswerResult<Vec<Step<'_>>> {
    address
        .segments()
        .iter()
        .map(|segment| match segment {
            Segment::Field(key) => Ok(Step::Key(key)),
            Segment::Index(IndexRef::Concrete(i)) => Ok(Step::Row(*i)),
            Segment::Index(IndexRef::Variable(_)) => {
                Err(AnswerError::UnboundAddress(address.to_string()))
            }
        })
        .collect()
}

impl AnswerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a store from an existing JSON object, dropping `null` leaves.
    pub fn from_json(value: JsonValue) -> Self {
        match strip_nulls(value) {
            Some(JsonValue::Object(root)) => Self { root },
            _ => Self::default(),
        }
    }

    pub fn get(&self, address: &Address) -> Option<&JsonValue> {
        let steps = steps(address).ok()?;
        let mut iter = steps.iter();
        let mut current = match iter.next()? {
            Step::Key(key) => self.root.get(*key)?,
            Step::Row(_) => return None,
        };
        for step in iter {
            current = match (step, current) {
                (Step::Key(key), JsonValue::Object(map)) => map.get(*key)?,
                (Step::Row(i), JsonValue::Array(rows)) => rows.get(*i)?,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn contains(&self, address: &Address) -> bool {
        self.get(address).is_some()
    }

    /// Writes `value` at `address`, creating intermediate objects and padding
    /// arrays with empty rows. Writing `null` removes the value.
    pub fn set(&mut self, address: &Address, value: JsonValue) -> AnswerResult<Option<JsonValue>> {
        if value.is_null() {
            return Ok(self.remove(address));
        }
        let steps = steps(address)?;
        let (last, parents) = steps
            .split_last()
            .ok_or_else(|| AnswerError::EmptyAddress(address.to_string()))?;

        let mut current = match parents.first() {
            None => return self.set_root(address, last, value),
            Some(Step::Key(key)) => self
                .root
                .entry(key.to_string())
                .or_insert_with(|| container_for(parents.get(1).unwrap_or(last))),
            Some(Step::Row(_)) => {
                return Err(AnswerError::PathConflict {
                    address: address.to_string(),
                    found: "root".to_string(),
                })
            }
        };

        for (i, step) in parents.iter().enumerate().skip(1) {
            let next = parents.get(i + 1).unwrap_or(last);
            current = descend(current, step, next, address)?;
        }

        match (last, current) {
            (Step::Key(key), JsonValue::Object(map)) => Ok(map.insert(key.to_string(), value)),
            (Step::Row(i), JsonValue::Array(rows)) => {
                pad_rows(rows, *i);
                Ok(Some(std::mem::replace(&mut rows[*i], value)))
            }
            (_, other) => Err(AnswerError::PathConflict {
                address: address.to_string(),
                found: kind_name(other).to_string(),
            }),
        }
    }

    fn set_root(
        &mut self,
        address: &Address,
        last: &Step<'_>,
        value: JsonValue,
    ) -> AnswerResult<Option<JsonValue>> {
        match last {
            Step::Key(key) => Ok(self.root.insert(key.to_string(), value)),
            Step::Row(_) => Err(AnswerError::PathConflict {
                address: address.to_string(),
                found: "root".to_string(),
            }),
        }
    }

    /// Removes the value at `address`. Rows of repeating groups are not
    /// shifted; use [`AnswerStore::remove_row`] for that.
    pub fn remove(&mut self, address: &Address) -> Option<JsonValue> {
        let steps = steps(address).ok()?;
        let (last, parents) = steps.split_last()?;
        if parents.is_empty() {
            return match last {
                Step::Key(key) => self.root.shift_remove(*key),
                Step::Row(_) => None,
            };
        }
        match (last, self.container_mut(parents)?) {
            (Step::Key(key), Some(JsonValue::Object(map))) => map.shift_remove(*key),
            (Step::Row(i), Some(JsonValue::Array(rows))) if *i < rows.len() => {
                Some(std::mem::replace(&mut rows[*i], JsonValue::Object(Map::new())))
            }
            _ => None,
        }
    }

    /// Resolves the container addressed by `parents`: `Some(None)` is the root.
    fn container_mut(&mut self, parents: &[Step<'_>]) -> Option<Option<&mut JsonValue>> {
        let mut iter = parents.iter();
        let mut current = match iter.next() {
            None => return Some(None),
            Some(Step::Key(key)) => self.root.get_mut(*key)?,
            Some(Step::Row(_)) => return None,
        };
        for step in iter {
            current = match (step, current) {
                (Step::Key(key), JsonValue::Object(map)) => map.get_mut(*key)?,
                (Step::Row(i), JsonValue::Array(rows)) => rows.get_mut(*i)?,
                _ => return None,
            };
        }
        Some(Some(current))
    }

    /// Number of rows currently stored for a repeating group.
    pub fn row_count(&self, group: &Address) -> usize {
        match self.get(group) {
            Some(JsonValue::Array(rows)) => rows.len(),
            _ => 0,
        }
    }

    /// Appends an empty row to a repeating group and returns its index.
    pub fn push_row(&mut self, group: &Address) -> AnswerResult<usize> {
        let index = self.row_count(group);
        let mut row = group.clone();
        row.push_index(index);
        self.set(&row, JsonValue::Object(Map::new()))?;
        Ok(index)
    }

    /// Removes a row and shifts later rows down by one.
    pub fn remove_row(&mut self, group: &Address, index: usize) -> Option<JsonValue> {
        let steps = steps(group).ok()?;
        match self.container_mut(&steps)? {
            Some(JsonValue::Array(rows)) if index < rows.len() => Some(rows.remove(index)),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> JsonValue {
        JsonValue::Object(self.root.clone())
    }
}

fn descend<'v>(
    current: &'v mut JsonValue,
    step: &Step<'_>,
    next: &Step<'_>,
    address: &Address,
) -> AnswerResult<&'v mut JsonValue> {
    match (step, current) {
        (Step::Key(key), JsonValue::Object(map)) => Ok(map
            .entry(key.to_string())
            .or_insert_with(|| container_for(next))),
        (Step::Row(i), JsonValue::Array(rows)) => {
            pad_rows(rows, *i);
            let row = &mut rows[*i];
            if !(row.is_object() || row.is_array()) {
                *row = container_for(next);
            }
            Ok(row)
        }
        (_, other) => Err(AnswerError::PathConflict {
            address: address.to_string(),
            found: kind_name(other).to_string(),
        }),
    }
}

fn container_for(next: &Step<'_>) -> JsonValue {
    match next {
        Step::Key(_) => JsonValue::Object(Map::new()),
        Step::Row(_) => JsonValue::Array(Vec::new()),
    }
}

fn pad_rows(rows: &mut Vec<JsonValue>, index: usize) {
    while rows.len() <= index {
        rows.push(JsonValue::Object(Map::new()));
    }
}

fn kind_name(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "boolean",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn strip_nulls(value: JsonValue) -> Option<JsonValue> {
    match value {
        JsonValue::Null => None,
        JsonValue::Object(map) => Some(JsonValue::Object(
            map.into_iter()
                .filter_map(|(k, v)| strip_nulls(v).map(|v| (k, v)))
                .collect(),
        )),
        JsonValue::Array(items) => Some(JsonValue::Array(
            items
                .into_iter()
                .map(|v| strip_nulls(v).unwrap_or(JsonValue::Object(Map::new())))
                .collect(),
        )),
        other => Some(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::parse_rule;
    use crate::ast::Expression;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn addr(path: &str) -> Address {
        match parse_rule(path).unwrap() {
            Expression::Reference(address) => address,
            other => panic!("not a reference: {:?}", other),
        }
    }

    #[test]
    fn test_set_and_get_nested() {
        let mut store = AnswerStore::new();
        store.set(&addr("applicant.name"), json!("Asha")).unwrap();
        store.set(&addr("items[1].qty"), json!(3)).unwrap();

        assert_eq!(store.get(&addr("applicant.name")), Some(&json!("Asha")));
        assert_eq!(store.get(&addr("items[1].qty")), Some(&json!(3)));
        assert_eq!(store.row_count(&addr("items")), 2);
        assert_eq!(
            store.snapshot(),
            json!({"applicant": {"name": "Asha"}, "items": [{}, {"qty": 3}]})
        );
    }

    #[test]
    fn test_null_write_removes() {
        let mut store = AnswerStore::new();
        store.set(&addr("total"), json!(150)).unwrap();
        store.set(&addr("total"), JsonValue::Null).unwrap();
        assert!(!store.contains(&addr("total")));
        assert_eq!(store.snapshot(), json!({}));
    }

    #[test]
    fn test_remove_nested() {
        let mut store = AnswerStore::from_json(json!({"a": {"b": 1, "c": null}}));
        assert_eq!(store.snapshot(), json!({"a": {"b": 1}}));
        assert_eq!(store.remove(&addr("a.b")), Some(json!(1)));
        assert_eq!(store.remove(&addr("a.missing")), None);
    }

    #[test]
    fn test_rows() {
        let mut store = AnswerStore::new();
        assert_eq!(store.push_row(&addr("items")).unwrap(), 0);
        assert_eq!(store.push_row(&addr("items")).unwrap(), 1);
        store.set(&addr("items[1].qty"), json!(2)).unwrap();
        store.remove_row(&addr("items"), 0);
        assert_eq!(store.get(&addr("items[0].qty")), Some(&json!(2)));
        assert_eq!(store.row_count(&addr("items")), 1);
    }

    #[test]
    fn test_path_conflict() {
        let mut store = AnswerStore::new();
        store.set(&addr("a"), json!(1)).unwrap();
        assert!(matches!(
            store.set(&addr("a.b"), json!(2)),
            Err(AnswerError::PathConflict { .. })
        ));
    }

    #[test]
    fn test_unbound_address() {
        let mut store = AnswerStore::new();
        assert!(matches!(
            store.set(&addr("items[$i].qty"), json!(2)),
            Err(AnswerError::UnboundAddress(_))
        ));
    }
}
