//! Builds a [`Schema`] from its JSON document.
//!
//! Building runs in two passes: the first lays out the field tree and checks
//! keys, `order` and master bindings; the second, with every path known,
//! resolves dependent keys and compiles predicates.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::access::{AccessPatch, AccessState};
use crate::analyzer::parse_rule;
use crate::ast::{Address, Expression};

use super::document::{Entries, RawField, RawPredicate, SchemaDocument};
use super::predicate::{
    AppendConfig, AsyncCalcConfig, CalcConfig, CopyConfig, OptionFilterConfig, ValidateConfig,
};
use super::{
    Action, ActionKind, Field, FieldId, FieldKind, LeafSpec, MasterDecl, Predicate, Schema,
    SchemaBuildError, SchemaResult, ValueType,
};

const ROOT: &str = "schema";

impl Schema {
    pub fn from_json_str(s: &str) -> SchemaResult<Self> {
        let document: SchemaDocument =
            serde_json::from_str(s).map_err(|e| SchemaBuildError::Malformed(e.to_string()))?;
        Self::from_document(document)
    }

    pub fn from_value(value: JsonValue) -> SchemaResult<Self> {
        let document: SchemaDocument =
            serde_json::from_value(value).map_err(|e| SchemaBuildError::Malformed(e.to_string()))?;
        Self::from_document(document)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> SchemaResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            SchemaBuildError::Malformed(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&text)
    }

    #[tracing::instrument(level = "debug", skip(document))]
    pub fn from_document(document: SchemaDocument) -> SchemaResult<Self> {
        let masters = check_masters(document.masters)?;
        let mut builder = Builder {
            fields: Vec::new(),
            by_path: HashMap::new(),
            pending: Vec::new(),
            masters: &masters,
        };
        let root = document.schema;
        let (_, roots) =
            builder.add_children(None, root.properties, root.order, root.required, 0)?;
        let pending = std::mem::take(&mut builder.pending);

        let mut schema = Schema {
            fields: builder.fields,
            roots,
            by_path: builder.by_path,
            masters,
        };

        let mut compiled = Vec::with_capacity(pending.len());
        for (id, dependent_keys, predicates) in pending {
            let dependents = schema.resolve_dependent_keys(id, &dependent_keys)?;
            let predicates = predicates
                .iter()
                .enumerate()
                .map(|(index, raw)| schema.compile_predicate(id, index, raw))
                .collect::<SchemaResult<Vec<_>>>()?;
            compiled.push((id, dependents, predicates));
        }
        for (id, dependents, predicates) in compiled {
            let field = &mut schema.fields[id.0];
            field.dependent_keys = dependents;
            field.predicates = predicates;
        }

        tracing::debug!("Built schema with {} fields", schema.len());
        Ok(schema)
    }

    fn resolve_dependent_keys(&self, id: FieldId, keys: &[String]) -> SchemaResult<Vec<FieldId>> {
        keys.iter()
            .map(|key| {
                self.resolve_key(id, key)
                    .ok_or_else(|| SchemaBuildError::DanglingFieldReference {
                        field: self.field(id).path.clone(),
                        reference: key.clone(),
                    })
            })
            .collect()
    }

    fn compile_predicate(
        &self,
        id: FieldId,
        index: usize,
        raw: &RawPredicate,
    ) -> SchemaResult<Predicate> {
        let field = self.field(id);
        let invalid = |message: String| SchemaBuildError::InvalidPredicate {
            field: field.path.clone(),
            index,
            message,
        };

        let condition = raw
            .condition
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .map(|c| compile_expression(field, c))
            .transpose()?;

        let kind = ActionKind::from_str(&raw.action)
            .map_err(|_| invalid(format!("unknown action {}", raw.action)))?;

        let action = match kind {
            ActionKind::Calc => {
                let config: CalcConfig = decode(&raw.action_config).map_err(&invalid)?;
                Action::Calc {
                    formula: compile_expression(field, &config.formula)?,
                }
            }
            ActionKind::OptionFilter => {
                let config: OptionFilterConfig = decode(&raw.action_config).map_err(&invalid)?;
                let binding = field
                    .master()
                    .ok_or_else(|| invalid("OPTION_FILTER needs a master binding".to_string()))?;
                let (parent_id, parent) = self.resolve_field_reference(field, &config.field)?;
                let decl = self.master(&binding.id).ok_or_else(|| {
                    SchemaBuildError::DanglingMasterReference {
                        field: field.path.clone(),
                        master: binding.id.clone(),
                    }
                })?;
                let column = config
                    .column
                    .or_else(|| decl.partition_column.clone())
                    .unwrap_or_else(|| self.field(parent_id).key.clone());
                if !decl.columns.is_empty() && !decl.columns.contains(&column) {
                    return Err(invalid(format!(
                        "column {} is not declared by master {}",
                        column, decl.id
                    )));
                }
                Action::OptionFilter { parent, column }
            }
            ActionKind::ApplyAccessMatrix => {
                let patch: AccessPatch = decode(&raw.action_config).map_err(&invalid)?;
                if patch.is_empty() {
                    return Err(invalid("empty access matrix".to_string()));
                }
                Action::ApplyAccessMatrix(patch)
            }
            ActionKind::Validate => {
                let config: ValidateConfig = decode(&raw.action_config).map_err(&invalid)?;
                Action::Validate {
                    message: config.message,
                }
            }
            ActionKind::Copy => {
                let config: CopyConfig = decode(&raw.action_config).map_err(&invalid)?;
                let (_, source) = self.resolve_field_reference(field, &config.field)?;
                Action::Copy { source }
            }
            ActionKind::Append => {
                let config: AppendConfig = decode(&raw.action_config).map_err(&invalid)?;
                Action::Append {
                    expression: compile_expression(field, &config.expression)?,
                }
            }
            ActionKind::AsyncCalc => {
                let config: AsyncCalcConfig = decode(&raw.action_config).map_err(&invalid)?;
                let arguments = config
                    .arguments
                    .iter()
                    .map(|(name, source)| Ok((name.clone(), compile_expression(field, source)?)))
                    .collect::<SchemaResult<BTreeMap<_, _>>>()?;
                Action::AsyncCalc {
                    aggregation: config.aggregation,
                    arguments,
                }
            }
        };

        Ok(Predicate {
            condition,
            condition_source: raw.condition.clone(),
            action,
            skip_on_client: raw.skip_predicate_execution_on_client,
            skip_on_server: raw.skip_predicate_execution_on_server,
        })
    }

    fn resolve_field_reference(&self, field: &Field, text: &str) -> SchemaResult<(FieldId, Address)> {
        let dangling = || SchemaBuildError::DanglingFieldReference {
            field: field.path.clone(),
            reference: text.to_string(),
        };
        match parse_rule(text) {
            Ok(Expression::Reference(address)) => {
                self.resolve_address(field.id, &address).ok_or_else(dangling)
            }
            _ => Err(dangling()),
        }
    }
}

struct Builder<'m> {
    fields: Vec<Field>,
    by_path: HashMap<String, FieldId>,
    pending: Vec<(FieldId, Vec<String>, Vec<RawPredicate>)>,
    masters: &'m BTreeMap<String, MasterDecl>,
}

impl Builder<'_> {
    /// Adds the entries of one `properties` map; returns the effective order
    /// and the new child ids in that order.
    fn add_children(
        &mut self,
        parent: Option<FieldId>,
        properties: Entries<RawField>,
        order: Option<Vec<String>>,
        required: Vec<String>,
        repeat_depth: usize,
    ) -> SchemaResult<(Vec<String>, Vec<FieldId>)> {
        let parent_path = parent
            .map(|p| self.fields[p.0].path.clone())
            .unwrap_or_else(|| ROOT.to_string());

        let mut seen = HashSet::new();
        for (key, _) in &properties.0 {
            if !seen.insert(key.as_str()) {
                return Err(SchemaBuildError::DuplicateKey {
                    parent: parent_path,
                    key: key.clone(),
                });
            }
        }

        let keys: Vec<String> = properties.0.iter().map(|(k, _)| k.clone()).collect();
        let order = match order {
            Some(order) => {
                check_order(&parent_path, &keys, &order)?;
                order
            }
            None => keys,
        };

        if let Some(missing) = required.iter().find(|r| !seen.contains(r.as_str())) {
            return Err(SchemaBuildError::DanglingFieldReference {
                field: parent_path,
                reference: missing.clone(),
            });
        }

        let mut by_key: HashMap<String, RawField> = properties.0.into_iter().collect();
        let mut children = Vec::with_capacity(order.len());
        for key in &order {
            if let Some(raw) = by_key.remove(key) {
                let is_required = required.contains(key);
                children.push(self.add_field(parent, key, raw, is_required, repeat_depth)?);
            }
        }
        Ok((order, children))
    }

    fn add_field(
        &mut self,
        parent: Option<FieldId>,
        key: &str,
        raw: RawField,
        required: bool,
        repeat_depth: usize,
    ) -> SchemaResult<FieldId> {
        let path = match parent {
            Some(p) => format!("{}.{}", self.fields[p.0].path, key),
            None => key.to_string(),
        };
        let id = FieldId(self.fields.len());

        let patch = raw.access_matrix.unwrap_or_default();
        let mut access = AccessState::from(patch.clone());
        if required && patch.mandatory.is_none() {
            access.mandatory = true;
        }

        let value_type = raw.value_type.unwrap_or_default();
        self.fields.push(Field {
            id,
            key: key.to_string(),
            path: path.clone(),
            parent,
            title: raw.title,
            value_type,
            description: raw.description.clone(),
            access,
            predicates: Vec::new(),
            dependent_keys: Vec::new(),
            repeat_depth,
            kind: FieldKind::Leaf(LeafSpec::default()),
        });
        self.by_path.insert(path.clone(), id);
        self.pending.push((id, raw.dependent_keys, raw.predicates));

        let object_items = raw.items.as_ref().is_some_and(|i| i.properties.is_some());
        let repeating = raw.description.as_deref() == Some("repeating")
            || (value_type == ValueType::Array && object_items);

        let kind = if repeating {
            let (properties, order, required) = match raw.items {
                Some(items) if object_items => {
                    let items = *items;
                    (items.properties, items.order, items.required)
                }
                _ => (raw.properties, raw.order, raw.required),
            };
            let (order, children) = self.add_children(
                Some(id),
                properties.unwrap_or_default(),
                order,
                required,
                repeat_depth + 1,
            )?;
            FieldKind::Repeating {
                order,
                children,
                min_rows: raw.min_items,
                max_rows: raw.max_items,
            }
        } else if value_type == ValueType::Object {
            let (order, children) = self.add_children(
                Some(id),
                raw.properties.unwrap_or_default(),
                raw.order,
                raw.required,
                repeat_depth,
            )?;
            FieldKind::Group { order, children }
        } else {
            let spec = LeafSpec {
                min_length: raw.min_length,
                max_length: raw.max_length,
                minimum: raw.minimum,
                maximum: raw.maximum,
                default: raw.default,
                ..Default::default()
            };
            FieldKind::Leaf(self.leaf_spec(&path, raw.pattern, raw.master, spec)?)
        };

        self.fields[id.0].kind = kind;
        Ok(id)
    }

    fn leaf_spec(
        &self,
        path: &str,
        pattern: Option<String>,
        master: Option<super::MasterBinding>,
        mut spec: LeafSpec,
    ) -> SchemaResult<LeafSpec> {
        spec.pattern = pattern
            .map(|p| {
                Regex::new(&p).map_err(|e| SchemaBuildError::InvalidPattern {
                    field: path.to_string(),
                    message: e.to_string(),
                })
            })
            .transpose()?;

        if let Some(binding) = &master {
            let dangling = |master: String| SchemaBuildError::DanglingMasterReference {
                field: path.to_string(),
                master,
            };
            let decl = self
                .masters
                .get(&binding.id)
                .ok_or_else(|| dangling(binding.id.clone()))?;
            if !decl.columns.is_empty() && !decl.columns.contains(&binding.column) {
                return Err(dangling(format!("{}.{}", binding.id, binding.column)));
            }
        }
        spec.master = master;
        Ok(spec)
    }
}

fn check_masters(masters: BTreeMap<String, MasterDecl>) -> SchemaResult<BTreeMap<String, MasterDecl>> {
    masters
        .into_iter()
        .map(|(id, mut decl)| {
            let declared = |column: &Option<String>| {
                column
                    .as_ref()
                    .map(|c| decl.columns.is_empty() || decl.columns.contains(c))
                    .unwrap_or(true)
            };
            if !declared(&decl.partition_column) || !declared(&decl.key_column) {
                return Err(SchemaBuildError::Malformed(format!(
                    "master {} names a partition or key column outside its columns",
                    id
                )));
            }
            decl.id = id.clone();
            Ok((id, decl))
        })
        .collect()
}

fn check_order(parent: &str, keys: &[String], order: &[String]) -> SchemaResult<()> {
    let key_set: HashSet<&str> = keys.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    let extra: Vec<String> = order
        .iter()
        .filter(|k| !key_set.contains(k.as_str()) || !seen.insert(k.as_str()))
        .cloned()
        .collect();
    let missing: Vec<String> = keys
        .iter()
        .filter(|k| !order.contains(k))
        .cloned()
        .collect();
    if missing.is_empty() && extra.is_empty() {
        Ok(())
    } else {
        Err(SchemaBuildError::OrderMismatch {
            parent: parent.to_string(),
            missing,
            extra,
        })
    }
}

fn compile_expression(field: &Field, source: &str) -> SchemaResult<Expression> {
    parse_rule(source).map_err(|e| SchemaBuildError::InvalidExpression {
        field: field.path.clone(),
        source_text: source.to_string(),
        message: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(config: &JsonValue) -> Result<T, String> {
    let config = match config {
        JsonValue::Null => JsonValue::Object(Default::default()),
        other => other.clone(),
    };
    serde_json::from_value(config).map_err(|e| format!("invalid actionConfig: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Visibility;
    use pretty_assertions::assert_eq;

    fn build(json: &str) -> SchemaResult<Schema> {
        Schema::from_json_str(json)
    }

    #[test]
    fn test_kinds_and_order() {
        let schema = build(
            r#"{
              "schema": {
                "order": ["b", "a"],
                "required": ["a"],
                "properties": {
                  "a": {"type": "string", "minLength": 2, "pattern": "^[A-Z]"},
                  "b": {
                    "type": "object",
                    "properties": {"c": {"type": "number", "maximum": 10}}
                  }
                }
              }
            }"#,
        )
        .unwrap();

        let roots: Vec<&str> = schema
            .roots()
            .iter()
            .map(|id| schema.field(*id).key.as_str())
            .collect();
        assert_eq!(roots, vec!["b", "a"]);

        let a = schema.get("a").unwrap();
        assert!(a.access.mandatory);
        let spec = a.leaf().unwrap();
        assert_eq!(spec.min_length, Some(2));
        assert!(spec.pattern.as_ref().unwrap().is_match("Abc"));

        let b = schema.get("b").unwrap();
        assert!(matches!(b.kind, FieldKind::Group { .. }));
        assert_eq!(schema.get("b.c").unwrap().leaf().unwrap().maximum, Some(10.0));
    }

    #[test]
    fn test_repeating_group() {
        let schema = build(
            r#"{
              "schema": {
                "properties": {
                  "items": {
                    "type": "array",
                    "maxItems": 3,
                    "items": {
                      "type": "object",
                      "properties": {"qty": {"type": "number"}}
                    }
                  },
                  "tags": {"type": "array", "items": {"type": "string"}}
                }
              }
            }"#,
        )
        .unwrap();
        let items = schema.get("items").unwrap();
        assert!(matches!(
            items.kind,
            FieldKind::Repeating {
                max_rows: Some(3),
                ..
            }
        ));
        assert_eq!(schema.get("items.qty").unwrap().repeat_depth, 1);
        assert!(schema.get("tags").unwrap().leaf().is_some());
    }

    #[test]
    fn test_duplicate_key() {
        let err = build(r#"{"schema": {"properties": {"a": {}, "a": {}}}}"#).unwrap_err();
        assert_eq!(
            err,
            SchemaBuildError::DuplicateKey {
                parent: "schema".into(),
                key: "a".into()
            }
        );
    }

    #[test]
    fn test_order_mismatch() {
        let err = build(
            r#"{"schema": {"order": ["a", "x", "a"], "properties": {"a": {}, "b": {}}}}"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            SchemaBuildError::OrderMismatch {
                parent: "schema".into(),
                missing: vec!["b".into()],
                extra: vec!["x".into(), "a".into()],
            }
        );
    }

    #[test]
    fn test_dangling_master() {
        let err = build(
            r#"{"schema": {"properties": {"district": {"master": {"id": "districts", "column": "name"}}}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaBuildError::DanglingMasterReference { .. }));

        let err = build(
            r#"{
              "masters": {"districts": {"columns": ["state", "name"]}},
              "schema": {"properties": {"district": {"master": {"id": "districts", "column": "label"}}}}
            }"#,
        )
        .unwrap_err();
        assert_eq!(
            err,
            SchemaBuildError::DanglingMasterReference {
                field: "district".into(),
                master: "districts.label".into()
            }
        );
    }

    #[test]
    fn test_dangling_dependent_key() {
        let err = build(r#"{"schema": {"properties": {"a": {"dependentKeys": ["nope"]}}}}"#)
            .unwrap_err();
        assert!(matches!(err, SchemaBuildError::DanglingFieldReference { .. }));
    }

    #[test]
    fn test_invalid_expression() {
        let err = build(
            r#"{"schema": {"properties": {"a": {"predicates": [
                {"condition": "b ==", "action": "VALIDATE", "actionConfig": {"message": "x"}}
            ]}}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaBuildError::InvalidExpression { .. }));
    }

    #[test]
    fn test_unknown_action() {
        let err = build(
            r#"{"schema": {"properties": {"a": {"predicates": [{"action": "EXEC"}]}}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaBuildError::InvalidPredicate { index: 0, .. }));
    }

    #[test]
    fn test_compiles_predicates() {
        let schema = build(
            r#"{
              "masters": {"districts": {"columns": ["state", "name"], "partitionColumn": "state"}},
              "schema": {"properties": {
                "state": {"dependentKeys": ["district"]},
                "district": {
                  "master": {"id": "districts", "column": "name"},
                  "predicates": [
                    {"action": "OPTION_FILTER", "actionConfig": {"field": "state"}},
                    {"condition": "state == 'Goa'", "action": "APPLY_ACCESS_MATRIX",
                     "actionConfig": {"visibility": "GONE"}, "skipPredicateExecutionOnServer": true}
                  ]
                }
              }}
            }"#,
        )
        .unwrap();

        let state = schema.get("state").unwrap();
        let district = schema.get("district").unwrap();
        assert_eq!(state.dependent_keys, vec![district.id]);
        assert_eq!(
            district.predicates[0].action,
            Action::OptionFilter {
                parent: Address::field("state"),
                column: "state".into()
            }
        );
        assert_eq!(
            district.predicates[1].action,
            Action::ApplyAccessMatrix(AccessPatch {
                visibility: Some(Visibility::Gone),
                ..Default::default()
            })
        );
        assert!(district.predicates[1].skip_on_server);
        assert_eq!(schema.master("districts").unwrap().id, "districts");
    }

    #[test]
    fn test_option_filter_requires_binding() {
        let err = build(
            r#"{"schema": {"properties": {
                "state": {},
                "district": {"predicates": [{"action": "OPTION_FILTER", "actionConfig": {"field": "state"}}]}
            }}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaBuildError::InvalidPredicate { .. }));
    }

    #[test]
    fn test_malformed_document() {
        assert!(matches!(
            build(r#"{"properties": {}}"#),
            Err(SchemaBuildError::Malformed(_))
        ));
    }
}
