//! # Dependency Graph
//!
//! Maps each trigger field to the (dependent field, predicate) pairs that must
//! re-run when the trigger's value changes. Only declared `dependentKeys`
//! create subscriptions; a predicate that reads a field which does not list
//! it as a dependent produces a [`GraphWarning`] instead.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashSet};
use std::fmt;

use crate::schema::{FieldId, Schema, SchemaBuildError, SchemaResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dependent {
    pub field: FieldId,
    /// Index into the dependent field's predicates.
    pub predicate: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GraphWarning {
    /// `field` reads `trigger`, but `trigger` does not list it in `dependentKeys`.
    UndeclaredDependency { field: String, trigger: String },
    /// `field` reads a path that names no field.
    UnknownReference { field: String, reference: String },
}

impl fmt::Display for GraphWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphWarning::UndeclaredDependency { field, trigger } => write!(
                f,
                "{} reads {} but is not listed in its dependentKeys",
                field, trigger
            ),
            GraphWarning::UnknownReference { field, reference } => {
                write!(f, "{} reads unknown path {}", field, reference)
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    edges: BTreeMap<FieldId, Vec<Dependent>>,
    warnings: Vec<GraphWarning>,
    order: Vec<FieldId>,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

impl DependencyGraph {
    #[tracing::instrument(level = "debug", skip(schema))]
    pub fn build(schema: &Schema) -> SchemaResult<Self> {
        detect_cycles(schema)?;

        let mut edges: BTreeMap<FieldId, Vec<Dependent>> = BTreeMap::new();
        for trigger in schema.fields() {
            for dependent in &trigger.dependent_keys {
                let pairs = edges.entry(trigger.id).or_default();
                let predicates = schema.field(*dependent).predicates.len();
                for predicate in 0..predicates {
                    let pair = Dependent {
                        field: *dependent,
                        predicate,
                    };
                    if !pairs.contains(&pair) {
                        pairs.push(pair);
                    }
                }
            }
        }

        let warnings = scan_references(schema);
        for warning in &warnings {
            tracing::warn!("{}", warning);
        }

        Ok(Self {
            edges,
            warnings,
            order: topological_order(schema),
        })
    }

    /// Pairs to re-run when `trigger` changes, in declaration order.
    pub fn dependents_of(&self, trigger: FieldId) -> &[Dependent] {
        self.edges.get(&trigger).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn triggers(&self) -> impl Iterator<Item = FieldId> + '_ {
        self.edges.keys().copied()
    }

    pub fn warnings(&self) -> &[GraphWarning] {
        &self.warnings
    }

    /// Every field, triggers before their dependents, document order otherwise.
    pub fn topological_order(&self) -> &[FieldId] {
        &self.order
    }
}

fn detect_cycles(schema: &Schema) -> SchemaResult<()> {
    let mut marks = vec![Mark::Unvisited; schema.len()];
    let mut path = Vec::new();
    for field in schema.fields() {
        if marks[field.id.0] == Mark::Unvisited {
            visit(schema, field.id, &mut marks, &mut path)?;
        }
    }
    Ok(())
}

fn visit(
    schema: &Schema,
    id: FieldId,
    marks: &mut [Mark],
    path: &mut Vec<FieldId>,
) -> SchemaResult<()> {
    marks[id.0] = Mark::InProgress;
    path.push(id);
    for next in &schema.field(id).dependent_keys {
        match marks[next.0] {
            Mark::InProgress => {
                let start = path.iter().position(|p| p == next).unwrap_or(0);
                let mut cycle: Vec<String> = path[start..]
                    .iter()
                    .map(|p| schema.field(*p).path.clone())
                    .collect();
                cycle.push(schema.field(*next).path.clone());
                return Err(SchemaBuildError::CyclicDependency { cycle });
            }
            Mark::Unvisited => visit(schema, *next, marks, path)?,
            Mark::Done => {}
        }
    }
    path.pop();
    marks[id.0] = Mark::Done;
    Ok(())
}

fn topological_order(schema: &Schema) -> Vec<FieldId> {
    let mut in_degree = vec![0usize; schema.len()];
    for field in schema.fields() {
        for dependent in &field.dependent_keys {
            in_degree[dependent.0] += 1;
        }
    }
    let mut ready: BinaryHeap<Reverse<FieldId>> = schema
        .fields()
        .filter(|f| in_degree[f.id.0] == 0)
        .map(|f| Reverse(f.id))
        .collect();

    let mut order = Vec::with_capacity(schema.len());
    while let Some(Reverse(id)) = ready.pop() {
        order.push(id);
        for dependent in &schema.field(id).dependent_keys {
            in_degree[dependent.0] -= 1;
            if in_degree[dependent.0] == 0 {
                ready.push(Reverse(*dependent));
            }
        }
    }
    order
}

fn scan_references(schema: &Schema) -> Vec<GraphWarning> {
    let mut seen = HashSet::new();
    let mut warnings = Vec::new();
    for field in schema.fields() {
        for predicate in &field.predicates {
            for address in predicate.references() {
                let warning = match schema.id_of(&address.field_path()) {
                    None => GraphWarning::UnknownReference {
                        field: field.path.clone(),
                        reference: address.to_string(),
                    },
                    Some(trigger) if trigger == field.id => continue,
                    Some(trigger) if schema.field(trigger).dependent_keys.contains(&field.id) => {
                        continue
                    }
                    Some(trigger) => GraphWarning::UndeclaredDependency {
                        field: field.path.clone(),
                        trigger: schema.field(trigger).path.clone(),
                    },
                };
                if seen.insert(warning.clone()) {
                    warnings.push(warning);
                }
            }
        }
    }
    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn schema(json: &str) -> Schema {
        Schema::from_json_str(json).unwrap()
    }

    #[test]
    fn test_dependents_in_declared_order() {
        let schema = schema(
            r#"{"schema": {"properties": {
                "maritalStatus": {"dependentKeys": ["spouseName"]},
                "spouseName": {"predicates": [
                    {"condition": "maritalStatus == 'Married'", "action": "APPLY_ACCESS_MATRIX",
                     "actionConfig": {"visibility": "VISIBLE"}},
                    {"condition": "maritalStatus != 'Married'", "action": "APPLY_ACCESS_MATRIX",
                     "actionConfig": {"visibility": "GONE"}}
                ]}
            }}}"#,
        );
        let graph = DependencyGraph::build(&schema).unwrap();
        let trigger = schema.id_of("maritalStatus").unwrap();
        let spouse = schema.id_of("spouseName").unwrap();
        assert_eq!(
            graph.dependents_of(trigger),
            &[
                Dependent {
                    field: spouse,
                    predicate: 0
                },
                Dependent {
                    field: spouse,
                    predicate: 1
                }
            ]
        );
        assert!(graph.dependents_of(spouse).is_empty());
        assert!(graph.warnings().is_empty());
        assert_eq!(graph.triggers().collect::<Vec<_>>(), vec![trigger]);
    }

    #[test]
    fn test_cycle_is_rejected() {
        let schema = schema(
            r#"{"schema": {"properties": {
                "a": {"dependentKeys": ["b"]},
                "b": {"dependentKeys": ["c"]},
                "c": {"dependentKeys": ["a"]}
            }}}"#,
        );
        let err = DependencyGraph::build(&schema).unwrap_err();
        assert_eq!(
            err,
            SchemaBuildError::CyclicDependency {
                cycle: vec!["a".into(), "b".into(), "c".into(), "a".into()]
            }
        );
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let schema = schema(r#"{"schema": {"properties": {"a": {"dependentKeys": ["a"]}}}}"#);
        assert!(matches!(
            DependencyGraph::build(&schema),
            Err(SchemaBuildError::CyclicDependency { .. })
        ));
    }

    #[test]
    fn test_undeclared_reference_is_a_warning() {
        let schema = schema(
            r#"{"schema": {"properties": {
                "qty": {},
                "price": {"dependentKeys": ["total"]},
                "total": {"predicates": [
                    {"action": "CALC", "actionConfig": {"formula": "qty * price + bonus"}}
                ]}
            }}}"#,
        );
        let graph = DependencyGraph::build(&schema).unwrap();
        assert_eq!(
            graph.warnings(),
            &[
                GraphWarning::UndeclaredDependency {
                    field: "total".into(),
                    trigger: "qty".into()
                },
                GraphWarning::UnknownReference {
                    field: "total".into(),
                    reference: "bonus".into()
                }
            ]
        );
        // qty is not subscribed
        assert!(graph.dependents_of(schema.id_of("qty").unwrap()).is_empty());
    }

    #[test]
    fn test_topological_order() {
        let schema = schema(
            r#"{"schema": {"properties": {
                "c": {},
                "b": {"dependentKeys": ["c"]},
                "a": {"dependentKeys": ["b"]}
            }}}"#,
        );
        let graph = DependencyGraph::build(&schema).unwrap();
        let order: Vec<&str> = graph
            .topological_order()
            .iter()
            .map(|id| schema.field(*id).key.as_str())
            .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
    }
}
