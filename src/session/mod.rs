//! # Form Sessions
//!
//! A [`FormSession`] owns the mutable state of one open form: the answer
//! store, per-instance access, options, validation messages and async
//! bookkeeping. Every edit runs one propagation pass to completion before the
//! next is accepted. [`SessionHandle`] wraps a session in a task fed by a FIFO
//! command queue so several callers can share it.
//!
//! State is tracked per field *instance*: a field inside repeating groups has
//! one instance per row combination, identified by [`Instance`].

pub mod form;
pub mod handle;
pub mod submit;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::access::EffectiveAccess;
use crate::action::{ActionError, Aggregator, FiringTrace};
use crate::answer::AnswerError;
use crate::graph::{DependencyGraph, GraphWarning};
use crate::master::{FetchResult, MasterDataManager};
use crate::schema::{FieldId, Schema, SchemaResult};

pub use form::{AsyncCompletion, FormSession};
pub use handle::SessionHandle;
pub use submit::{IssueKind, SubmitIssue};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Unknown field: {0}")]
    UnknownField(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("{0} is not an input field")]
    NotALeaf(String),
    #[error("{0} is not a repeating group")]
    NotRepeating(String),
    #[error("{group} is limited to {limit} row(s)")]
    RowLimit { group: String, limit: usize },
    #[error("{group} has no row {index}")]
    RowOutOfRange { group: String, index: usize },
    #[error("{0} does not accept edits")]
    Rejected(String),
    #[error("Answer error: {0}")]
    Answer(#[from] AnswerError),
    #[error("Session is closed")]
    Closed,
}

pub type SessionResult<T> = Result<T, SessionError>;

/// A validated schema together with its dependency graph, shared by every
/// session opened on it.
#[derive(Debug, Clone)]
pub struct FormDefinition {
    schema: Arc<Schema>,
    graph: Arc<DependencyGraph>,
}

impl FormDefinition {
    pub fn new(schema: Schema) -> SchemaResult<Self> {
        let graph = DependencyGraph::build(&schema)?;
        Ok(Self {
            schema: Arc::new(schema),
            graph: Arc::new(graph),
        })
    }

    pub fn from_json_str(s: &str) -> SchemaResult<Self> {
        Self::new(Schema::from_json_str(s)?)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> SchemaResult<Self> {
        Self::new(Schema::from_file(path)?)
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn graph(&self) -> &Arc<DependencyGraph> {
        &self.graph
    }

    pub fn warnings(&self) -> &[GraphWarning] {
        self.graph.warnings()
    }
}

/// Collaborators a session may call out to.
#[derive(Clone, Default)]
pub struct Services {
    pub masters: Option<Arc<MasterDataManager>>,
    pub aggregator: Option<Arc<dyn Aggregator>>,
}

impl Services {
    pub fn with_masters(mut self, masters: Arc<MasterDataManager>) -> Self {
        self.masters = Some(masters);
        self
    }

    pub fn with_aggregator(mut self, aggregator: Arc<dyn Aggregator>) -> Self {
        self.aggregator = Some(aggregator);
        self
    }
}

/// One field at one row combination (outermost row first).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Instance {
    pub field: FieldId,
    pub rows: Vec<usize>,
}

impl Instance {
    pub fn new(field: FieldId, rows: Vec<usize>) -> Self {
        Self { field, rows }
    }

    pub fn root(field: FieldId) -> Self {
        Self::new(field, Vec::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiagnosticKind {
    /// A condition or expression could not be evaluated.
    Evaluation,
    /// Master data or aggregation call failed; last-known state kept.
    Fetch,
    /// An effect could not be produced or applied.
    Action,
    /// A predicate hit its per-pass firing limit.
    PropagationLimit,
    /// An edit targeted a GONE or read-only field.
    Rejected,
}

/// A non-fatal problem collected during a propagation pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predicate: Option<usize>,
    pub kind: DiagnosticKind,
    pub message: String,
}

impl Diagnostic {
    pub fn new(address: impl Into<String>, kind: DiagnosticKind, message: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            predicate: None,
            kind,
            message: message.into(),
        }
    }

    pub fn for_predicate(mut self, predicate: usize) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub(crate) fn from_action(address: &str, predicate: usize, error: &ActionError) -> Self {
        let kind = match error {
            ActionError::Condition(_) | ActionError::Eval(_) => DiagnosticKind::Evaluation,
            ActionError::Fetch(_) => DiagnosticKind::Fetch,
            _ => DiagnosticKind::Action,
        };
        Self::new(address, kind, error.to_string()).for_predicate(predicate)
    }
}

/// Result of one propagation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PropagationReport {
    /// Addresses whose value, access, options or validation changed, in the
    /// order they first changed.
    pub changed: Vec<String>,
    pub diagnostics: Vec<Diagnostic>,
    pub trace: FiringTrace,
}

impl PropagationReport {
    pub fn mark(&mut self, address: String) {
        if !self.changed.contains(&address) {
            self.changed.push(address);
        }
    }

    pub fn has_changed(&self, address: &str) -> bool {
        self.changed.iter().any(|a| a == address)
    }

    pub fn merge(&mut self, other: PropagationReport) {
        for address in other.changed {
            self.mark(address);
        }
        self.diagnostics.extend(other.diagnostics);
        self.trace.extend(other.trace);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldState {
    pub access: EffectiveAccess,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<JsonValue>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub pending: bool,
}

/// Read-only view handed to whoever submits the answers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FormSnapshot {
    pub taken_at: DateTime<Utc>,
    pub answers: JsonValue,
    pub fields: BTreeMap<String, FieldState>,
}

impl FormSnapshot {
    pub fn field(&self, address: &str) -> Option<&FieldState> {
        self.fields.get(address)
    }
}

/// Outcome of an aggregation call routed back to its session.
pub(crate) type AggregationResult = FetchResult<JsonValue>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaBuildError;

    #[test]
    fn test_definition_rejects_cycles() {
        let err = FormDefinition::from_json_str(
            r#"{"schema": {"properties": {
                "a": {"dependentKeys": ["b"]},
                "b": {"dependentKeys": ["a"]}
            }}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaBuildError::CyclicDependency { .. }));
    }

    #[test]
    fn test_report_merge_keeps_first_order() {
        let mut report = PropagationReport::default();
        report.mark("b".into());
        report.mark("a".into());
        let mut other = PropagationReport::default();
        other.mark("a".into());
        other.mark("c".into());
        report.merge(other);
        assert_eq!(report.changed, vec!["b", "a", "c"]);
    }
}
