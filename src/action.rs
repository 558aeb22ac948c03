//! # Predicate Action Executor
//!
//! Runs one predicate of one field instance. Every firing walks a small state
//! machine,
//!
//! ```text
//! Idle -> ConditionEvaluated -> Skipped
//!                            -> Executing -> Applied | Failed
//! ```
//!
//! and produces an [`Effect`] for the session to apply. The executor never
//! writes to the answer store itself; OPTION_FILTER is the only action that
//! awaits (a master data fetch), and ASYNC_CALC only describes the call it
//! wants made ([`Effect::Suspend`]).

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::access::AccessPatch;
use crate::answer::{AnswerError, AnswerStore};
use crate::ast::{Address, Expression};
use crate::config::{EmptyParentFilter, RuntimeConfig, RuntimeMode};
use crate::eval::{EvalContext, EvalError, ExpressionEvaluator, IndexBindings, Value};
use crate::master::{filter_key, FetchError, FetchResult, MasterDataManager, PartitionFilter, RowSet};
use crate::schema::{Action, ActionKind, FieldId, Predicate, Schema};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ActionError {
    #[error("Condition failed: {0}")]
    Condition(EvalError),
    #[error("Evaluation failed: {0}")]
    Eval(#[from] EvalError),
    #[error("Fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("Answer error: {0}")]
    Answer(#[from] AnswerError),
    #[error("No master data source configured for {0}")]
    NoMasterSource(String),
    #[error("Illegal firing transition {from:?} -> {to:?}")]
    IllegalTransition { from: FiringState, to: FiringState },
}

pub type ActionResult<T> = Result<T, ActionError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FiringState {
    Idle,
    ConditionEvaluated(bool),
    Skipped,
    Executing,
    Applied,
    Failed,
}

impl FiringState {
    pub fn can_transition_to(&self, next: &FiringState) -> bool {
        use FiringState::*;
        matches!(
            (self, next),
            (Idle, ConditionEvaluated(_))
                // suppressed by mode, or the condition could not be evaluated
                | (Idle, Skipped)
                | (ConditionEvaluated(false), Skipped)
                | (ConditionEvaluated(_), Executing)
                | (Executing, Applied)
                | (Executing, Failed)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FiringState::Skipped | FiringState::Applied | FiringState::Failed
        )
    }
}

/// The states one firing went through, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct Firing {
    states: Vec<FiringState>,
}

impl Default for Firing {
    fn default() -> Self {
        Self {
            states: vec![FiringState::Idle],
        }
    }
}

impl Firing {
    pub fn state(&self) -> FiringState {
        self.states.last().copied().unwrap_or(FiringState::Idle)
    }

    pub fn advance(&mut self, next: FiringState) -> ActionResult<()> {
        let from = self.state();
        if !from.can_transition_to(&next) {
            return Err(ActionError::IllegalTransition { from, to: next });
        }
        self.states.push(next);
        Ok(())
    }

    pub fn states(&self) -> &[FiringState] {
        &self.states
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FiringRecord {
    /// Concrete address of the field instance.
    pub address: String,
    pub predicate: usize,
    pub action: ActionKind,
    pub states: Vec<FiringState>,
}

impl FiringRecord {
    pub fn state(&self) -> FiringState {
        self.states.last().copied().unwrap_or(FiringState::Idle)
    }
}

/// Every firing of one propagation pass, in execution order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FiringTrace(Vec<FiringRecord>);

impl FiringTrace {
    pub fn push(&mut self, record: FiringRecord) {
        self.0.push(record);
    }

    pub fn iter(&self) -> impl Iterator<Item = &FiringRecord> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn for_address<'a>(&'a self, address: &'a str) -> impl Iterator<Item = &'a FiringRecord> {
        self.0.iter().filter(move |r| r.address == address)
    }

    pub fn extend(&mut self, other: FiringTrace) {
        self.0.extend(other.0);
    }
}

/// Options of a master-bound field.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OptionSet {
    /// Parent value the set was filtered by; `None` when unfiltered or empty.
    pub filter: Option<String>,
    /// Distinct values of the bound column, in row order.
    pub values: Vec<JsonValue>,
    #[serde(skip)]
    pub rows: Arc<RowSet>,
}

impl OptionSet {
    pub fn from_rows(filter: Option<String>, rows: Arc<RowSet>, column: &str) -> Self {
        let mut values: Vec<JsonValue> = Vec::new();
        for value in rows.values(column) {
            if !values.contains(&value) {
                values.push(value);
            }
        }
        Self {
            filter,
            values,
            rows,
        }
    }

    pub fn contains(&self, value: &JsonValue) -> bool {
        self.values.contains(value)
    }
}

/// An ASYNC_CALC call for the session to hand to its [`Aggregator`].
#[derive(Debug, Clone, PartialEq)]
pub struct AsyncRequest {
    pub aggregation: String,
    pub arguments: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Replace the field's value, or remove it with `None`.
    Value(Option<JsonValue>),
    /// Merge into the field's own access state.
    Access(AccessPatch),
    /// `Some(message)` marks the field invalid, `None` clears the error.
    Validation(Option<String>),
    Options(OptionSet),
    Suspend(AsyncRequest),
}

/// External aggregation backend behind ASYNC_CALC.
#[mockall::automock]
#[async_trait]
pub trait Aggregator: Send + Sync {
    async fn aggregate(
        &self,
        name: &str,
        arguments: &BTreeMap<String, JsonValue>,
    ) -> FetchResult<JsonValue>;
}

#[derive(Debug, Clone)]
pub struct FiringOutcome {
    pub record: FiringRecord,
    pub effect: Option<Effect>,
    pub error: Option<ActionError>,
}

impl FiringOutcome {
    pub fn state(&self) -> FiringState {
        self.record.state()
    }
}

pub struct PredicateExecutor {
    schema: Arc<Schema>,
    masters: Option<Arc<MasterDataManager>>,
    evaluator: ExpressionEvaluator,
    mode: RuntimeMode,
    strict: bool,
    empty_parent: EmptyParentFilter,
}

impl PredicateExecutor {
    pub fn new(
        schema: Arc<Schema>,
        masters: Option<Arc<MasterDataManager>>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            schema,
            masters,
            evaluator: ExpressionEvaluator::new(),
            mode: config.mode,
            strict: config.strict_expressions,
            empty_parent: config.option_filter,
        }
    }

    /// Fires predicate `index` of `field` for the instance at `rows`.
    pub async fn fire(
        &self,
        field: FieldId,
        index: usize,
        rows: &[usize],
        answers: &AnswerStore,
    ) -> FiringOutcome {
        let target = self.schema.field(field);
        let address = self.schema.address_of(field, rows);
        let mut firing = Firing::default();

        let (effect, error) = match target.predicates.get(index) {
            Some(predicate) => {
                match self
                    .run(&mut firing, predicate, field, &address, rows, answers)
                    .await
                {
                    Ok(effect) => (effect, None),
                    Err(e) => {
                        let end = match firing.state() {
                            FiringState::Executing => FiringState::Failed,
                            _ => FiringState::Skipped,
                        };
                        if firing.advance(end).is_err() {
                            tracing::error!("Firing of {} ended in {:?}", address, firing.state());
                        }
                        (None, Some(e))
                    }
                }
            }
            None => (
                None,
                Some(ActionError::Eval(EvalError::UnresolvedReference(format!(
                    "{}#{}",
                    address, index
                )))),
            ),
        };

        let action = target
            .predicates
            .get(index)
            .map(|p| p.action.kind())
            .unwrap_or(ActionKind::Validate);
        tracing::debug!(
            "Fired {} #{} on {}: {:?}",
            action,
            index,
            address,
            firing.state()
        );

        FiringOutcome {
            record: FiringRecord {
                address: address.to_string(),
                predicate: index,
                action,
                states: firing.states().to_vec(),
            },
            effect,
            error,
        }
    }

    async fn run(
        &self,
        firing: &mut Firing,
        predicate: &Predicate,
        field: FieldId,
        address: &Address,
        rows: &[usize],
        answers: &AnswerStore,
    ) -> ActionResult<Option<Effect>> {
        if !predicate.runs_in(self.mode) {
            firing.advance(FiringState::Skipped)?;
            return Ok(None);
        }

        let bindings = IndexBindings::from(rows.to_vec());
        let holds = match &predicate.condition {
            Some(condition) => self
                .evaluator
                .evaluate_condition(condition, &self.context(answers, &bindings))
                .map_err(ActionError::Condition)?,
            None => true,
        };
        firing.advance(FiringState::ConditionEvaluated(holds))?;

        let validates = matches!(predicate.action, Action::Validate { .. });
        if !holds && !validates {
            firing.advance(FiringState::Skipped)?;
            return Ok(None);
        }
        firing.advance(FiringState::Executing)?;

        let effect = match &predicate.action {
            Action::Calc { formula } => {
                let value = self.evaluate(formula, answers, &bindings)?;
                Some(Effect::Value(to_answer(value)))
            }
            Action::OptionFilter { parent, column } => {
                let parent = bindings.bind(parent)?;
                let parent_value = answers.get(&parent).and_then(filter_key);
                self.filter_options(field, column, parent_value).await?
            }
            Action::ApplyAccessMatrix(patch) => Some(Effect::Access(patch.clone())),
            Action::Validate { message } => Some(Effect::Validation(holds.then(|| message.clone()))),
            Action::Copy { source } => {
                let source = bindings.bind(source)?;
                Some(Effect::Value(answers.get(&source).cloned()))
            }
            Action::Append { expression } => {
                match to_answer(self.evaluate(expression, answers, &bindings)?) {
                    Some(item) => Some(Effect::Value(Some(append(answers.get(address), item)?))),
                    None => None,
                }
            }
            Action::AsyncCalc {
                aggregation,
                arguments,
            } => {
                let mut values = BTreeMap::new();
                for (name, expression) in arguments {
                    let value = self.evaluate(expression, answers, &bindings)?;
                    values.insert(name.clone(), JsonValue::from(value));
                }
                Some(Effect::Suspend(AsyncRequest {
                    aggregation: aggregation.clone(),
                    arguments: values,
                }))
            }
        };

        firing.advance(FiringState::Applied)?;
        Ok(effect)
    }

    fn context<'a>(&'a self, answers: &'a AnswerStore, bindings: &'a IndexBindings) -> EvalContext<'a> {
        EvalContext::new(answers, bindings)
            .with_scope(self.schema.as_ref())
            .strict(self.strict)
    }

    fn evaluate(
        &self,
        expression: &Expression,
        answers: &AnswerStore,
        bindings: &IndexBindings,
    ) -> ActionResult<Value> {
        Ok(self
            .evaluator
            .evaluate(expression, &self.context(answers, bindings))?)
    }

    async fn filter_options(
        &self,
        field: FieldId,
        column: &str,
        parent_value: Option<String>,
    ) -> ActionResult<Option<Effect>> {
        let bound = self.schema.field(field).master();
        let (binding, decl) = match bound.and_then(|b| Some((b, self.schema.master(&b.id)?))) {
            Some(found) => found,
            None => return Err(ActionError::NoMasterSource(self.schema.field(field).path.clone())),
        };

        let rows = match (parent_value, self.empty_parent) {
            (Some(value), _) => {
                let filter = PartitionFilter::new(column, value.clone());
                let rows = self.manager(field)?.resolve(decl, Some(&filter)).await?;
                return Ok(Some(Effect::Options(OptionSet::from_rows(
                    Some(value),
                    rows,
                    &binding.column,
                ))));
            }
            (None, EmptyParentFilter::None) => Arc::new(RowSet::default()),
            (None, EmptyParentFilter::All) => self.manager(field)?.resolve(decl, None).await?,
            (None, EmptyParentFilter::KeepPrior) => return Ok(None),
        };
        Ok(Some(Effect::Options(OptionSet::from_rows(
            None,
            rows,
            &binding.column,
        ))))
    }

    /// Full option set of a master-bound field that has no OPTION_FILTER.
    pub async fn load_options(&self, field: FieldId) -> ActionResult<Option<OptionSet>> {
        let target = self.schema.field(field);
        let binding = match target.master() {
            Some(binding) => binding,
            None => return Ok(None),
        };
        let decl = self
            .schema
            .master(&binding.id)
            .ok_or_else(|| ActionError::NoMasterSource(target.path.clone()))?;
        let rows = self.manager(field)?.resolve(decl, None).await?;
        Ok(Some(OptionSet::from_rows(None, rows, &binding.column)))
    }

    fn manager(&self, field: FieldId) -> ActionResult<&MasterDataManager> {
        self.masters
            .as_deref()
            .ok_or_else(|| ActionError::NoMasterSource(self.schema.field(field).path.clone()))
    }
}

fn to_answer(value: Value) -> Option<JsonValue> {
    match JsonValue::from(value) {
        JsonValue::Null => None,
        other => Some(other),
    }
}

fn append(current: Option<&JsonValue>, item: JsonValue) -> ActionResult<JsonValue> {
    match current {
        None => Ok(JsonValue::Array(vec![item])),
        Some(JsonValue::Array(items)) => {
            let mut items = items.clone();
            items.push(item);
            Ok(JsonValue::Array(items))
        }
        Some(other) => Err(ActionError::Eval(EvalError::TypeMismatch(format!(
            "cannot append to {}",
            Value::from(other).kind()
        )))),
    }
}
