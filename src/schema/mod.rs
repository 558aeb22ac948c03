//! # Schema Model
//!
//! A validated, immutable form definition. Fields are stored in an arena in
//! document order and addressed by [`FieldId`]; every field carries a common
//! core (key, title, access, predicates, dependent keys) and a
//! [`FieldKind`] payload chosen from the `type`/`description` pair of the
//! document:
//!
//! | `type` | `description` | kind |
//! |---|---|---|
//! | `object` | any | [`FieldKind::Group`] |
//! | `array` with object `items` | any | [`FieldKind::Repeating`] |
//! | any | `repeating` | [`FieldKind::Repeating`] |
//! | anything else | any | [`FieldKind::Leaf`] |
//!
//! Schemas are built with [`Schema::from_json_str`] and friends (see
//! [`loader`]); building rejects duplicate keys, `order` arrays that do not
//! match `properties`, dangling field and master references, malformed
//! predicates, and cycles among dependent keys.

pub mod document;
pub mod loader;
pub mod predicate;

use std::collections::{BTreeMap, HashMap};

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::access::AccessState;
use crate::ast::{Address, IndexRef, Segment};
use crate::eval::FieldScope;

pub use predicate::{Action, ActionKind, Predicate};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchemaBuildError {
    #[error("Cyclic dependency: {}", .cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },
    #[error("Duplicate key {key} in {parent}")]
    DuplicateKey { parent: String, key: String },
    #[error("Order of {parent} does not match properties (missing: {missing:?}, extra: {extra:?})")]
    OrderMismatch {
        parent: String,
        missing: Vec<String>,
        extra: Vec<String>,
    },
    #[error("Field {field} references unknown master {master}")]
    DanglingMasterReference { field: String, master: String },
    #[error("Field {field} references unknown field {reference}")]
    DanglingFieldReference { field: String, reference: String },
    #[error("Invalid expression in {field}: {source_text}: {message}")]
    InvalidExpression {
        field: String,
        source_text: String,
        message: String,
    },
    #[error("Invalid predicate #{index} on {field}: {message}")]
    InvalidPredicate {
        field: String,
        index: usize,
        message: String,
    },
    #[error("Invalid pattern on {field}: {message}")]
    InvalidPattern { field: String, message: String },
    #[error("Malformed schema document: {0}")]
    Malformed(String),
}

pub type SchemaResult<T> = Result<T, SchemaBuildError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldId(pub usize);

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ValueType {
    #[default]
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
}

/// A master dataset declared at document level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MasterDecl {
    #[serde(skip)]
    pub id: String,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub partition_column: Option<String>,
    /// Row identity column; enables delta sync.
    #[serde(default)]
    pub key_column: Option<String>,
}

/// Binds a leaf to a dataset; `column` holds the option value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterBinding {
    pub id: String,
    pub column: String,
}

#[derive(Debug, Clone, Default)]
pub struct LeafSpec {
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub pattern: Option<Regex>,
    pub minimum: Option<f64>,
    pub maximum: Option<f64>,
    pub master: Option<MasterBinding>,
    pub default: Option<JsonValue>,
}

#[derive(Debug, Clone)]
pub enum FieldKind {
    Leaf(LeafSpec),
    Group {
        order: Vec<String>,
        children: Vec<FieldId>,
    },
    Repeating {
        order: Vec<String>,
        children: Vec<FieldId>,
        min_rows: Option<usize>,
        max_rows: Option<usize>,
    },
}

#[derive(Debug, Clone)]
pub struct Field {
    pub id: FieldId,
    pub key: String,
    /// Dotted path from the root without row indices, e.g. `items.qty`.
    pub path: String,
    pub parent: Option<FieldId>,
    pub title: Option<String>,
    pub value_type: ValueType,
    pub description: Option<String>,
    /// Initial own access state.
    pub access: AccessState,
    pub predicates: Vec<Predicate>,
    pub dependent_keys: Vec<FieldId>,
    /// Number of enclosing repeating groups.
    pub repeat_depth: usize,
    pub kind: FieldKind,
}

impl Field {
    pub fn children(&self) -> &[FieldId] {
        match &self.kind {
            FieldKind::Leaf(_) => &[],
            FieldKind::Group { children, .. } | FieldKind::Repeating { children, .. } => children,
        }
    }

    pub fn is_repeating(&self) -> bool {
        matches!(self.kind, FieldKind::Repeating { .. })
    }

    pub fn leaf(&self) -> Option<&LeafSpec> {
        match &self.kind {
            FieldKind::Leaf(spec) => Some(spec),
            _ => None,
        }
    }

    pub fn master(&self) -> Option<&MasterBinding> {
        self.leaf().and_then(|spec| spec.master.as_ref())
    }
}

#[derive(Debug, Clone)]
pub struct Schema {
    fields: Vec<Field>,
    roots: Vec<FieldId>,
    by_path: HashMap<String, FieldId>,
    masters: BTreeMap<String, MasterDecl>,
}

impl Schema {
    pub fn field(&self, id: FieldId) -> &Field {
        &self.fields[id.0]
    }

    pub fn get(&self, path: &str) -> Option<&Field> {
        self.by_path.get(path).map(|id| self.field(*id))
    }

    pub fn id_of(&self, path: &str) -> Option<FieldId> {
        self.by_path.get(path).copied()
    }

    /// Fields in document order (parents before children).
    pub fn fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn roots(&self) -> &[FieldId] {
        &self.roots
    }

    pub fn masters(&self) -> &BTreeMap<String, MasterDecl> {
        &self.masters
    }

    pub fn master(&self, id: &str) -> Option<&MasterDecl> {
        self.masters.get(id)
    }

    /// Ancestors of `id`, nearest first.
    pub fn ancestors(&self, id: FieldId) -> impl Iterator<Item = FieldId> + '_ {
        std::iter::successors(self.field(id).parent, move |p| self.field(*p).parent)
    }

    pub fn is_descendant_of(&self, id: FieldId, ancestor: FieldId) -> bool {
        self.ancestors(id).any(|a| a == ancestor)
    }

    /// Repeating groups enclosing `id`, outermost first.
    pub fn repeating_ancestors(&self, id: FieldId) -> Vec<FieldId> {
        let mut out: Vec<FieldId> = self
            .ancestors(id)
            .filter(|a| self.field(*a).is_repeating())
            .collect();
        out.reverse();
        out
    }

    /// `id` and all of its descendants, parents first.
    pub fn subtree(&self, id: FieldId) -> Vec<FieldId> {
        let mut out = vec![id];
        let mut i = 0;
        while i < out.len() {
            out.extend_from_slice(self.field(out[i]).children());
            i += 1;
        }
        out
    }

    /// Address of one instance of a field. `rows` holds one row index per
    /// enclosing repeating group; missing rows become index variables.
    pub fn address_of(&self, id: FieldId, rows: &[usize]) -> Address {
        let mut chain: Vec<FieldId> = self.ancestors(id).collect();
        chain.reverse();
        chain.push(id);

        let mut address = Address(Vec::new());
        let mut depth = 0;
        for node in chain {
            let field = self.field(node);
            address.push_field(&field.key);
            if field.is_repeating() && node != id {
                match rows.get(depth) {
                    Some(row) => address.push_index(*row),
                    None => address.0.push(Segment::Index(IndexRef::Variable(
                        index_variable_name(depth),
                    ))),
                }
                depth += 1;
            }
        }
        address
    }

    /// Resolves a key as written in `dependentKeys` or an action config:
    /// a sibling of `from` first, then a path from the root.
    pub fn resolve_key(&self, from: FieldId, key: &str) -> Option<FieldId> {
        let sibling_path = match self.field(from).parent {
            Some(parent) => format!("{}.{}", self.field(parent).path, key),
            None => key.to_string(),
        };
        self.id_of(&sibling_path).or_else(|| self.id_of(key))
    }

    /// Maps a written address onto the schema, treating a bare key as a
    /// sibling reference of `from` (bound to the same rows).
    pub fn resolve_address(&self, from: FieldId, address: &Address) -> Option<(FieldId, Address)> {
        if let [Segment::Field(key)] = address.segments() {
            let id = self.resolve_key(from, key)?;
            return Some((id, self.address_of(id, &[])));
        }
        let id = self.id_of(&address.field_path())?;
        Some((id, address.clone()))
    }
}

impl FieldScope for Schema {
    fn has_field(&self, field_path: &str) -> bool {
        self.by_path.contains_key(field_path)
    }
}

/// `$i` for depth 0, `$j` for depth 1, and so on.
pub fn index_variable_name(depth: usize) -> String {
    char::from_u32('i' as u32 + depth as u32)
        .unwrap_or('i')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::from_json_str(
            r#"{
              "schema": {
                "properties": {
                  "order": {
                    "type": "array",
                    "items": {
                      "type": "object",
                      "properties": {
                        "qty": {"type": "number"},
                        "parts": {
                          "type": "array",
                          "items": {"type": "object", "properties": {"sku": {}}}
                        }
                      }
                    }
                  },
                  "name": {"type": "string"}
                }
              }
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_address_of_nested_rows() {
        let schema = schema();
        let sku = schema.id_of("order.parts.sku").unwrap();
        assert_eq!(schema.address_of(sku, &[1, 2]).to_string(), "order[1].parts[2].sku");
        assert_eq!(schema.address_of(sku, &[]).to_string(), "order[$i].parts[$j].sku");
        assert_eq!(schema.field(sku).repeat_depth, 2);

        let parts = schema.id_of("order.parts").unwrap();
        assert_eq!(schema.address_of(parts, &[0]).to_string(), "order[0].parts");
    }

    #[test]
    fn test_resolve_key_sibling_first() {
        let schema = schema();
        let qty = schema.id_of("order.qty").unwrap();
        let parts = schema.resolve_key(qty, "parts").unwrap();
        assert_eq!(schema.field(parts).path, "order.parts");
        let name = schema.resolve_key(qty, "name").unwrap();
        assert_eq!(schema.field(name).path, "name");
        assert!(schema.resolve_key(qty, "missing").is_none());
    }

    #[test]
    fn test_navigation() {
        let schema = schema();
        let order = schema.id_of("order").unwrap();
        let sku = schema.id_of("order.parts.sku").unwrap();
        assert!(schema.is_descendant_of(sku, order));
        assert_eq!(schema.repeating_ancestors(sku).len(), 2);
        assert_eq!(schema.subtree(order).len(), 4);
        assert!(schema.has_field("order.parts"));
        assert!(!schema.has_field("order.total"));
    }

    #[test]
    fn test_index_variable_name() {
        assert_eq!(index_variable_name(0), "i");
        assert_eq!(index_variable_name(2), "k");
    }
}
