use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{
    AggregationResult, Diagnostic, DiagnosticKind, FieldState, FormDefinition, FormSnapshot,
    Instance, PropagationReport, Services, SessionError, SessionResult,
};
use crate::access::{AccessResolver, AccessState, EffectiveAccess};
use crate::action::{Aggregator, AsyncRequest, Effect, OptionSet, PredicateExecutor};
use crate::analyzer::parse_rule;
use crate::answer::AnswerStore;
use crate::ast::{Address, Expression};
use crate::config::RuntimeConfig;
use crate::schema::{Action, FieldId, FieldKind, Schema};

/// Result of an ASYNC_CALC call, routed back to the session that issued it.
#[derive(Debug, Clone)]
pub struct AsyncCompletion {
    pub instance: Instance,
    pub generation: u64,
    pub aggregation: String,
    pub result: AggregationResult,
}

type Firings = HashMap<(Instance, usize), usize>;

/// What applying one effect changed: whether the instance's own value was
/// written, plus instances cleared because they became GONE.
#[derive(Default)]
struct Applied {
    wrote: bool,
    cleared: Vec<Instance>,
}

pub struct FormSession {
    pub(super) id: Uuid,
    pub(super) definition: FormDefinition,
    pub(super) config: RuntimeConfig,
    executor: PredicateExecutor,
    resolver: AccessResolver,
    aggregator: Option<Arc<dyn Aggregator>>,
    pub(super) answers: AnswerStore,
    own_access: HashMap<Instance, AccessState>,
    pub(super) effective: HashMap<Instance, EffectiveAccess>,
    pub(super) options: HashMap<Instance, OptionSet>,
    pub(super) errors: HashMap<Instance, String>,
    /// Instances waiting on an aggregation, with the generation it was issued at.
    pub(super) pending: HashMap<Instance, u64>,
    /// Bumped on every write to an instance; stale completions are dropped.
    generations: HashMap<Instance, u64>,
    completions_tx: mpsc::UnboundedSender<AsyncCompletion>,
    completions_rx: mpsc::UnboundedReceiver<AsyncCompletion>,
}

impl FormSession {
    pub async fn open(
        definition: FormDefinition,
        config: RuntimeConfig,
        services: Services,
    ) -> (Self, PropagationReport) {
        Self::open_with_answers(definition, config, services, JsonValue::Null).await
    }

    /// Opens a session over previously saved answers. Defaults fill only the
    /// leaves that have no answer; every predicate then fires once per
    /// instance in dependency order.
    #[instrument(level = "debug", skip_all)]
    pub async fn open_with_answers(
        definition: FormDefinition,
        config: RuntimeConfig,
        services: Services,
        answers: JsonValue,
    ) -> (Self, PropagationReport) {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        let executor = PredicateExecutor::new(
            definition.schema().clone(),
            services.masters.clone(),
            &config,
        );
        let mut session = Self {
            id: Uuid::new_v4(),
            resolver: AccessResolver::new(config.cascade.clone()),
            definition,
            config,
            executor,
            aggregator: services.aggregator,
            answers: AnswerStore::from_json(answers),
            own_access: HashMap::new(),
            effective: HashMap::new(),
            options: HashMap::new(),
            errors: HashMap::new(),
            pending: HashMap::new(),
            generations: HashMap::new(),
            completions_tx,
            completions_rx,
        };
        debug!("Opening session {}", session.id);

        let mut report = PropagationReport::default();
        session.fill_defaults(None);
        let mut seeds = session.recompute_access(&mut report);
        session.load_static_options(None, &mut report).await;
        let mut firings = Firings::new();
        seeds.extend(session.evaluate_all(None, &mut firings, &mut report).await);
        session.propagate(seeds, &mut firings, &mut report).await;
        (session, report)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn definition(&self) -> &FormDefinition {
        &self.definition
    }

    pub fn answers(&self) -> &AnswerStore {
        &self.answers
    }

    /// Current answer at `address`, e.g. `items[1].qty`.
    pub fn value(&self, address: &str) -> Option<&JsonValue> {
        let instance = self.lookup(address)?;
        self.answers.get(&self.address(&instance))
    }

    pub fn access(&self, address: &str) -> Option<&EffectiveAccess> {
        self.effective.get(&self.lookup(address)?)
    }

    pub fn options(&self, address: &str) -> Option<&OptionSet> {
        self.options.get(&self.lookup(address)?)
    }

    pub fn error(&self, address: &str) -> Option<&str> {
        self.errors.get(&self.lookup(address)?).map(String::as_str)
    }

    pub fn is_pending(&self, address: &str) -> bool {
        self.lookup(address)
            .is_some_and(|instance| self.pending.contains_key(&instance))
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Applies one user edit and propagates it to completion. A `null` value
    /// clears the field.
    #[instrument(level = "debug", skip(self, value), fields(session = %self.id))]
    pub async fn apply_edit(
        &mut self,
        address: &str,
        value: JsonValue,
    ) -> SessionResult<PropagationReport> {
        let instance = self.locate(address)?;
        let schema = self.schema();
        if schema.field(instance.field).leaf().is_none() {
            return Err(SessionError::NotALeaf(address.to_string()));
        }

        let canonical = self.address(&instance).to_string();
        let mut report = PropagationReport::default();
        if let Some(reason) = self.refusal(&instance) {
            report.diagnostics.push(Diagnostic::new(
                canonical.clone(),
                DiagnosticKind::Rejected,
                format!("{} is {}", canonical, reason),
            ));
            return Ok(report);
        }

        let value = (!value.is_null()).then_some(value);
        if !self.write(&instance, value)? {
            return Ok(report);
        }
        // a user edit supersedes any aggregation still in flight
        self.pending.remove(&instance);
        report.mark(canonical);

        let mut firings = Firings::new();
        self.propagate(vec![instance], &mut firings, &mut report)
            .await;
        Ok(report)
    }

    pub async fn clear(&mut self, address: &str) -> SessionResult<PropagationReport> {
        self.apply_edit(address, JsonValue::Null).await
    }

    /// Appends a row to the repeating group at `group` and returns its index.
    #[instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub async fn add_row(&mut self, group: &str) -> SessionResult<(usize, PropagationReport)> {
        let instance = self.locate(group)?;
        let (_, max_rows) = self.row_limits(&instance, group)?;
        if let Some(reason) = self.refusal(&instance) {
            return Err(SessionError::Rejected(format!("{} ({})", group, reason)));
        }

        let address = self.address(&instance);
        if let Some(limit) = max_rows {
            if self.answers.row_count(&address) >= limit {
                return Err(SessionError::RowLimit {
                    group: group.to_string(),
                    limit,
                });
            }
        }
        let index = self.answers.push_row(&address)?;
        self.bump(&instance);

        let mut report = PropagationReport::default();
        report.mark(address.to_string());

        let mut rows = instance.rows.clone();
        rows.push(index);
        let scope = Some((instance.field, rows));
        self.fill_defaults(scope.as_ref());
        let mut seeds = self.recompute_access(&mut report);
        self.load_static_options(scope.as_ref(), &mut report).await;
        let mut firings = Firings::new();
        seeds.extend(
            self.evaluate_all(scope.as_ref(), &mut firings, &mut report)
                .await,
        );
        seeds.extend(self.group_seeds(&instance));
        self.propagate(seeds, &mut firings, &mut report).await;
        Ok((index, report))
    }

    /// Removes row `index`; later rows shift up by one.
    #[instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub async fn remove_row(&mut self, group: &str, index: usize) -> SessionResult<PropagationReport> {
        let instance = self.locate(group)?;
        let (min_rows, _) = self.row_limits(&instance, group)?;
        if let Some(reason) = self.refusal(&instance) {
            return Err(SessionError::Rejected(format!("{} ({})", group, reason)));
        }

        let address = self.address(&instance);
        let count = self.answers.row_count(&address);
        if index >= count {
            return Err(SessionError::RowOutOfRange {
                group: group.to_string(),
                index,
            });
        }
        if let Some(limit) = min_rows {
            if count <= limit {
                return Err(SessionError::RowLimit {
                    group: group.to_string(),
                    limit,
                });
            }
        }

        self.answers.remove_row(&address, index);
        let schema = self.schema();
        let depth = instance.rows.len();
        let shift = RowShift {
            schema: &schema,
            group: instance.field,
            prefix: &instance.rows,
            depth,
            index,
        };
        // results for removed or shifted rows can no longer be matched
        self.pending
            .retain(|key, _| !shift.covers(key) || key.rows[depth] < index);
        shift.apply(&mut self.own_access);
        shift.apply(&mut self.effective);
        shift.apply(&mut self.options);
        shift.apply(&mut self.errors);
        shift.apply(&mut self.generations);
        self.bump(&instance);

        let mut report = PropagationReport::default();
        report.mark(address.to_string());
        let mut seeds = self.recompute_access(&mut report);
        seeds.extend(self.group_seeds(&instance));
        let mut firings = Firings::new();
        self.propagate(seeds, &mut firings, &mut report).await;
        Ok(report)
    }

    pub fn snapshot(&self) -> FormSnapshot {
        let schema = self.schema();
        let mut fields = std::collections::BTreeMap::new();
        for field in schema.fields() {
            for instance in self.instances_under(field.id, &[]) {
                let state = FieldState {
                    access: self.effective.get(&instance).cloned().unwrap_or_default(),
                    options: self.options.get(&instance).map(|set| set.values.clone()),
                    error: self.errors.get(&instance).cloned(),
                    pending: self.pending.contains_key(&instance),
                };
                fields.insert(self.address(&instance).to_string(), state);
            }
        }
        FormSnapshot {
            taken_at: chrono::Utc::now(),
            answers: self.answers.snapshot(),
            fields,
        }
    }

    /// Waits for the next aggregation result. Never resolves while nothing
    /// is in flight, since the session keeps its own sender alive.
    pub async fn next_completion(&mut self) -> Option<AsyncCompletion> {
        self.completions_rx.recv().await
    }

    /// Applies an aggregation result if it is still current: the instance
    /// must be pending at that generation and not written since.
    #[instrument(level = "debug", skip_all, fields(session = %self.id, aggregation = %completion.aggregation))]
    pub async fn complete(&mut self, completion: AsyncCompletion) -> PropagationReport {
        let AsyncCompletion {
            instance,
            generation,
            aggregation,
            result,
        } = completion;
        let mut report = PropagationReport::default();
        let current = self.pending.get(&instance) == Some(&generation)
            && self.generations.get(&instance) == Some(&generation);
        let address = self.address(&instance).to_string();
        if !current {
            debug!("Discarding stale {} result for {}", aggregation, address);
            return report;
        }

        self.pending.remove(&instance);
        report.mark(address.clone());
        match result {
            Ok(value) => {
                if self.is_gone(&instance) {
                    return report;
                }
                let value = (!value.is_null()).then_some(value);
                match self.write(&instance, value) {
                    Ok(true) => {
                        let mut firings = Firings::new();
                        self.propagate(vec![instance], &mut firings, &mut report)
                            .await;
                    }
                    Ok(false) => {}
                    Err(e) => report.diagnostics.push(Diagnostic::new(
                        address,
                        DiagnosticKind::Action,
                        e.to_string(),
                    )),
                }
            }
            Err(e) => {
                warn!("Aggregation {} for {} failed: {}", aggregation, address, e);
                report
                    .diagnostics
                    .push(Diagnostic::new(address, DiagnosticKind::Fetch, e.to_string()));
            }
        }
        report
    }

    /// Applies completions until nothing is pending.
    pub async fn settle(&mut self) -> PropagationReport {
        let mut report = PropagationReport::default();
        while self.has_pending() {
            match self.completions_rx.recv().await {
                Some(completion) => {
                    let next = self.complete(completion).await;
                    report.merge(next);
                }
                None => break,
            }
        }
        report
    }

    fn schema(&self) -> Arc<Schema> {
        self.definition.schema().clone()
    }

    fn address(&self, instance: &Instance) -> Address {
        self.definition
            .schema()
            .address_of(instance.field, &instance.rows)
    }

    fn is_gone(&self, instance: &Instance) -> bool {
        self.effective
            .get(instance)
            .is_some_and(EffectiveAccess::is_gone)
    }

    fn refusal(&self, instance: &Instance) -> Option<&'static str> {
        let access = self.effective.get(instance)?;
        if access.is_gone() {
            Some("gone")
        } else if access.read_only {
            Some("read-only")
        } else {
            None
        }
    }

    fn row_limits(
        &self,
        instance: &Instance,
        group: &str,
    ) -> SessionResult<(Option<usize>, Option<usize>)> {
        match &self.definition.schema().field(instance.field).kind {
            FieldKind::Repeating {
                min_rows, max_rows, ..
            } => Ok((*min_rows, *max_rows)),
            _ => Err(SessionError::NotRepeating(group.to_string())),
        }
    }

    fn bump(&mut self, instance: &Instance) -> u64 {
        let generation = self.generations.entry(instance.clone()).or_insert(0);
        *generation += 1;
        *generation
    }

    /// Drops an in-flight aggregation so its result is discarded on arrival.
    fn cancel_pending(&mut self, instance: &Instance) {
        if self.pending.remove(instance).is_some() {
            debug!("Cancelled pending result for {}", self.address(instance));
            self.bump(instance);
        }
    }

    /// Writes or removes an instance's value. Returns whether it changed.
    fn write(&mut self, instance: &Instance, value: Option<JsonValue>) -> SessionResult<bool> {
        let address = self.address(instance);
        if self.answers.get(&address) == value.as_ref() {
            return Ok(false);
        }
        match value {
            Some(value) => {
                self.answers.set(&address, value)?;
            }
            None => {
                self.answers.remove(&address);
            }
        }
        self.bump(instance);
        Ok(true)
    }

    /// Parses an address and checks that it names an existing instance.
    fn locate(&self, text: &str) -> SessionResult<Instance> {
        let schema = self.schema();
        let address = match parse_rule(text) {
            Ok(Expression::Reference(address)) => address,
            _ => return Err(SessionError::InvalidAddress(text.to_string())),
        };
        let field = schema
            .id_of(&address.field_path())
            .ok_or_else(|| SessionError::UnknownField(text.to_string()))?;
        let rows = address
            .concrete_indices()
            .ok_or_else(|| SessionError::InvalidAddress(text.to_string()))?;
        if schema.address_of(field, &rows) != address {
            return Err(SessionError::InvalidAddress(text.to_string()));
        }

        let groups = schema.repeating_ancestors(field);
        for (depth, row) in rows.iter().enumerate() {
            let group = schema.address_of(groups[depth], &rows[..depth]);
            if *row >= self.answers.row_count(&group) {
                return Err(SessionError::RowOutOfRange {
                    group: group.to_string(),
                    index: *row,
                });
            }
        }
        Ok(Instance::new(field, rows))
    }

    fn lookup(&self, text: &str) -> Option<Instance> {
        let schema = self.definition.schema();
        let address = match parse_rule(text).ok()? {
            Expression::Reference(address) => address,
            _ => return None,
        };
        let field = schema.id_of(&address.field_path())?;
        let rows = address.concrete_indices()?;
        (rows.len() == schema.field(field).repeat_depth).then(|| Instance::new(field, rows))
    }

    /// Every existing instance of `field` whose rows start with `prefix`.
    pub(super) fn instances_under(&self, field: FieldId, prefix: &[usize]) -> Vec<Instance> {
        let schema = self.definition.schema();
        let groups = schema.repeating_ancestors(field);
        if prefix.len() > groups.len() {
            return Vec::new();
        }
        for (depth, row) in prefix.iter().enumerate() {
            let group = schema.address_of(groups[depth], &prefix[..depth]);
            if *row >= self.answers.row_count(&group) {
                return Vec::new();
            }
        }

        let mut combinations = vec![prefix.to_vec()];
        for (depth, group) in groups.iter().enumerate().skip(prefix.len()) {
            let mut next = Vec::new();
            for rows in combinations {
                let count = self
                    .answers
                    .row_count(&schema.address_of(*group, &rows[..depth]));
                for row in 0..count {
                    let mut extended = rows.clone();
                    extended.push(row);
                    next.push(extended);
                }
            }
            combinations = next;
        }
        combinations
            .into_iter()
            .map(|rows| Instance::new(field, rows))
            .collect()
    }

    /// Instances of `dependent` affected by a change to `trigger`: rows of
    /// repeating groups they share stay bound, deeper rows fan out.
    fn expand(&self, trigger: &Instance, dependent: FieldId) -> Vec<Instance> {
        let schema = self.definition.schema();
        let shared = schema
            .repeating_ancestors(dependent)
            .iter()
            .zip(schema.repeating_ancestors(trigger.field).iter())
            .take_while(|(a, b)| a == b)
            .count()
            .min(trigger.rows.len());
        self.instances_under(dependent, &trigger.rows[..shared])
    }

    /// Triggers for a row added to or removed from `group`: every field of
    /// the group, bound only to the group's own rows.
    fn group_seeds(&self, group: &Instance) -> Vec<Instance> {
        self.definition
            .schema()
            .subtree(group.field)
            .into_iter()
            .map(|field| Instance::new(field, group.rows.clone()))
            .collect()
    }

    fn in_scope(schema: &Schema, field: FieldId, scope: Option<&(FieldId, Vec<usize>)>) -> bool {
        scope.map_or(true, |(group, _)| schema.is_descendant_of(field, *group))
    }

    fn fill_defaults(&mut self, scope: Option<&(FieldId, Vec<usize>)>) {
        let schema = self.schema();
        let prefix = scope.map(|(_, rows)| rows.as_slice()).unwrap_or(&[]);
        for field in schema.fields() {
            let default = match field.leaf().and_then(|spec| spec.default.as_ref()) {
                Some(default) if !default.is_null() => default,
                _ => continue,
            };
            if !Self::in_scope(&schema, field.id, scope) {
                continue;
            }
            for instance in self.instances_under(field.id, prefix) {
                if self.answers.contains(&self.address(&instance)) {
                    continue;
                }
                if let Err(e) = self.write(&instance, Some(default.clone())) {
                    warn!("Default for {} not applied: {}", field.path, e);
                }
            }
        }
    }

    /// Options of master-bound fields that no OPTION_FILTER narrows.
    async fn load_static_options(
        &mut self,
        scope: Option<&(FieldId, Vec<usize>)>,
        report: &mut PropagationReport,
    ) {
        let schema = self.schema();
        let prefix = scope.map(|(_, rows)| rows.clone()).unwrap_or_default();
        for field in schema.fields() {
            if field.master().is_none()
                || !Self::in_scope(&schema, field.id, scope)
                || field
                    .predicates
                    .iter()
                    .any(|p| matches!(p.action, Action::OptionFilter { .. }))
            {
                continue;
            }
            let instances = self.instances_under(field.id, &prefix);
            if instances.is_empty() {
                continue;
            }
            match self.executor.load_options(field.id).await {
                Ok(Some(set)) => {
                    for instance in instances {
                        report.mark(self.address(&instance).to_string());
                        self.options.insert(instance, set.clone());
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("Options for {} unavailable: {}", field.path, e);
                    report.diagnostics.push(Diagnostic::new(
                        field.path.clone(),
                        DiagnosticKind::Fetch,
                        e.to_string(),
                    ));
                }
            }
        }
    }

    /// Fires every predicate once per instance in dependency order. Returns
    /// instances cleared by GONE transitions, whose dependents still need a
    /// pass.
    async fn evaluate_all(
        &mut self,
        scope: Option<&(FieldId, Vec<usize>)>,
        firings: &mut Firings,
        report: &mut PropagationReport,
    ) -> Vec<Instance> {
        let schema = self.schema();
        let graph = self.definition.graph().clone();
        let prefix = scope.map(|(_, rows)| rows.clone()).unwrap_or_default();
        let mut cleared = Vec::new();
        for &field in graph.topological_order() {
            let count = schema.field(field).predicates.len();
            if count == 0 || !Self::in_scope(&schema, field, scope) {
                continue;
            }
            for instance in self.instances_under(field, &prefix) {
                for index in 0..count {
                    let applied = self.fire(&instance, index, firings, report).await;
                    cleared.extend(applied.cleared);
                }
            }
        }
        cleared
    }

    /// Breadth-first propagation from changed instances. Each dequeued
    /// instance fires its dependents' predicates and its own VALIDATE
    /// predicates; anything that changes as a result is queued in turn.
    async fn propagate(
        &mut self,
        seeds: Vec<Instance>,
        firings: &mut Firings,
        report: &mut PropagationReport,
    ) {
        let schema = self.schema();
        let graph = self.definition.graph().clone();
        let mut queue: VecDeque<Instance> = seeds.into();

        while let Some(trigger) = queue.pop_front() {
            let mut jobs: Vec<(Instance, usize)> = Vec::new();
            for dependent in graph.dependents_of(trigger.field) {
                for instance in self.expand(&trigger, dependent.field) {
                    let job = (instance, dependent.predicate);
                    if !jobs.contains(&job) {
                        jobs.push(job);
                    }
                }
            }
            let field = schema.field(trigger.field);
            if trigger.rows.len() == field.repeat_depth {
                for (index, predicate) in field.predicates.iter().enumerate() {
                    let job = (trigger.clone(), index);
                    if matches!(predicate.action, Action::Validate { .. }) && !jobs.contains(&job) {
                        jobs.push(job);
                    }
                }
            }

            // 値を書く述語が再評価されるなら、古い集計結果は取り消す
            for (instance, index) in &jobs {
                if schema.field(instance.field).predicates[*index].action.writes_value() {
                    self.cancel_pending(instance);
                }
            }

            for (instance, index) in jobs {
                let applied = self.fire(&instance, index, firings, report).await;
                if applied.wrote {
                    queue.push_back(instance);
                }
                queue.extend(applied.cleared);
            }
        }
    }

    async fn fire(
        &mut self,
        instance: &Instance,
        index: usize,
        firings: &mut Firings,
        report: &mut PropagationReport,
    ) -> Applied {
        let limit = self.config.max_firings_per_predicate;
        let count = firings.entry((instance.clone(), index)).or_insert(0);
        *count += 1;
        if *count > limit {
            if *count == limit + 1 {
                let address = self.address(instance).to_string();
                warn!("Predicate {} of {} hit the firing limit", index, address);
                report.diagnostics.push(
                    Diagnostic::new(
                        address,
                        DiagnosticKind::PropagationLimit,
                        format!("fired more than {} times in one pass", limit),
                    )
                    .for_predicate(index),
                );
            }
            return Applied::default();
        }

        let outcome = self
            .executor
            .fire(instance.field, index, &instance.rows, &self.answers)
            .await;
        let address = outcome.record.address.clone();
        if let Some(error) = &outcome.error {
            debug!("Predicate {} of {} failed: {}", index, address, error);
            report
                .diagnostics
                .push(Diagnostic::from_action(&address, index, error));
        }
        report.trace.push(outcome.record);
        match outcome.effect {
            Some(effect) => self.apply_effect(instance, &address, effect, report),
            None => Applied::default(),
        }
    }

    fn apply_effect(
        &mut self,
        instance: &Instance,
        address: &str,
        effect: Effect,
        report: &mut PropagationReport,
    ) -> Applied {
        let frozen = self.pending.contains_key(instance);
        match effect {
            Effect::Value(value) => {
                if frozen || self.is_gone(instance) {
                    return Applied::default();
                }
                match self.write(instance, value) {
                    Ok(wrote) => {
                        if wrote {
                            report.mark(address.to_string());
                        }
                        Applied {
                            wrote,
                            cleared: Vec::new(),
                        }
                    }
                    Err(e) => {
                        report.diagnostics.push(Diagnostic::new(
                            address,
                            DiagnosticKind::Action,
                            e.to_string(),
                        ));
                        Applied::default()
                    }
                }
            }
            Effect::Access(patch) => {
                if frozen {
                    return Applied::default();
                }
                let schema = self.definition.schema();
                let own = self
                    .own_access
                    .entry(instance.clone())
                    .or_insert_with(|| schema.field(instance.field).access.clone());
                if !own.merge(&patch) {
                    return Applied::default();
                }
                Applied {
                    wrote: false,
                    cleared: self.recompute_access(report),
                }
            }
            Effect::Validation(message) => {
                let changed = match message {
                    Some(message) => {
                        self.errors.insert(instance.clone(), message.clone()) != Some(message)
                    }
                    None => self.errors.remove(instance).is_some(),
                };
                if changed {
                    report.mark(address.to_string());
                }
                Applied::default()
            }
            Effect::Options(set) => {
                let refiltered = self
                    .options
                    .get(instance)
                    .is_some_and(|prior| prior.filter != set.filter);
                if self.options.get(instance) != Some(&set) {
                    report.mark(address.to_string());
                }
                self.options.insert(instance.clone(), set);
                if !refiltered || frozen {
                    return Applied::default();
                }
                match self.write(instance, None) {
                    Ok(wrote) => Applied {
                        wrote,
                        cleared: Vec::new(),
                    },
                    Err(_) => Applied::default(),
                }
            }
            Effect::Suspend(request) => {
                self.suspend(instance.clone(), address, request, report);
                Applied::default()
            }
        }
    }

    /// Freezes the instance and hands the aggregation to a background task.
    fn suspend(
        &mut self,
        instance: Instance,
        address: &str,
        request: AsyncRequest,
        report: &mut PropagationReport,
    ) {
        let aggregator = match &self.aggregator {
            Some(aggregator) => aggregator.clone(),
            None => {
                report.diagnostics.push(Diagnostic::new(
                    address,
                    DiagnosticKind::Action,
                    format!("no aggregator for {}", request.aggregation),
                ));
                return;
            }
        };
        let generation = self.bump(&instance);
        self.pending.insert(instance.clone(), generation);
        report.mark(address.to_string());

        let tx = self.completions_tx.clone();
        let session = self.id;
        tokio::spawn(async move {
            let result = aggregator
                .aggregate(&request.aggregation, &request.arguments)
                .await;
            let completion = AsyncCompletion {
                instance,
                generation,
                aggregation: request.aggregation,
                result,
            };
            if tx.send(completion).is_err() {
                debug!("Session {} closed before aggregation finished", session);
            }
        });
    }

    /// Recomputes effective access for every instance, parents first, and
    /// clears values of instances that just became GONE. Returns the
    /// cleared instances.
    fn recompute_access(&mut self, report: &mut PropagationReport) -> Vec<Instance> {
        let schema = self.schema();
        let mut next: HashMap<Instance, EffectiveAccess> = HashMap::new();
        let mut newly_gone = Vec::new();

        for field in schema.fields() {
            for instance in self.instances_under(field.id, &[]) {
                let own = self
                    .own_access
                    .get(&instance)
                    .unwrap_or(&field.access);
                let parent = field.parent.and_then(|parent| {
                    let depth = schema.field(parent).repeat_depth;
                    next.get(&Instance::new(parent, instance.rows[..depth].to_vec()))
                });
                let effective = self.resolver.resolve(own, parent);
                let previous = self.effective.get(&instance);
                if previous != Some(&effective) {
                    report.mark(self.address(&instance).to_string());
                }
                if effective.is_gone() && previous.map_or(true, |p| !p.is_gone()) {
                    newly_gone.push(instance.clone());
                }
                next.insert(instance, effective);
            }
        }
        self.effective = next;

        let mut cleared = Vec::new();
        if !self.config.clear_on_gone {
            return cleared;
        }
        for instance in newly_gone.into_iter().rev() {
            let address = self.address(&instance);
            if self.answers.remove(&address).is_some() {
                debug!("Cleared {} on GONE", address);
                self.bump(&instance);
                self.pending.remove(&instance);
                report.mark(address.to_string());
                cleared.push(instance);
            }
        }
        if !cleared.is_empty() {
            self.prune_vanished();
        }
        cleared
    }

    /// Forgets per-instance state of rows that no longer exist, so a row
    /// created later at the same index starts from the field defaults.
    /// Generations are kept so late completions for the old row stay stale.
    fn prune_vanished(&mut self) {
        let schema = self.schema();
        let live: HashSet<Instance> = schema
            .fields()
            .flat_map(|field| self.instances_under(field.id, &[]))
            .collect();
        self.own_access.retain(|key, _| live.contains(key));
        self.effective.retain(|key, _| live.contains(key));
        self.options.retain(|key, _| live.contains(key));
        self.errors.retain(|key, _| live.contains(key));
        self.pending.retain(|key, _| live.contains(key));
    }
}

/// Re-keys per-instance state after a row is removed from a repeating group.
struct RowShift<'a> {
    schema: &'a Schema,
    group: FieldId,
    prefix: &'a [usize],
    depth: usize,
    index: usize,
}

impl RowShift<'_> {
    fn covers(&self, key: &Instance) -> bool {
        self.schema.is_descendant_of(key.field, self.group)
            && key.rows.len() > self.depth
            && key.rows[..self.depth] == *self.prefix
    }

    fn apply<V>(&self, map: &mut HashMap<Instance, V>) {
        let entries = std::mem::take(map);
        for (mut key, value) in entries {
            if self.covers(&key) {
                if key.rows[self.depth] == self.index {
                    continue;
                }
                if key.rows[self.depth] > self.index {
                    key.rows[self.depth] -= 1;
                }
            }
            map.insert(key, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Visibility;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    async fn open(schema: serde_json::Value) -> (FormSession, PropagationReport) {
        let definition = FormDefinition::from_json_str(&schema.to_string()).unwrap();
        FormSession::open(definition, RuntimeConfig::default(), Services::default()).await
    }

    fn line_items() -> serde_json::Value {
        json!({"schema": {"properties": {
            "items": {
                "type": "array",
                "items": {"properties": {
                    "qty": {"type": "number", "default": 1, "dependentKeys": ["amount"]},
                    "price": {"type": "number", "dependentKeys": ["amount"]},
                    "amount": {
                        "type": "number",
                        "dependentKeys": ["first"],
                        "predicates": [{"action": "CALC", "actionConfig": {"formula": "items[$i].qty * items[$i].price"}}]
                    }
                }}
            },
            "first": {
                "type": "number",
                "predicates": [{"action": "CALC", "actionConfig": {"formula": "items[0].amount"}}]
            }
        }}})
    }

    #[tokio::test]
    async fn test_calc_propagates_through_rows() {
        let (mut session, _) = open(line_items()).await;
        let (row, _) = session.add_row("items").await.unwrap();
        assert_eq!(row, 0);
        assert_eq!(session.value("items[0].qty"), Some(&json!(1)));

        let report = session.apply_edit("items[0].price", json!(20)).await.unwrap();
        assert!(report.has_changed("items[0].amount"));
        assert_eq!(session.value("items[0].amount"), Some(&json!(20)));
        assert_eq!(session.value("first"), Some(&json!(20)));

        session.add_row("items").await.unwrap();
        session.apply_edit("items[1].qty", json!(3)).await.unwrap();
        session.apply_edit("items[1].price", json!(5)).await.unwrap();
        assert_eq!(session.value("items[1].amount"), Some(&json!(15)));
        assert_eq!(session.value("first"), Some(&json!(20)));

        session.remove_row("items", 0).await.unwrap();
        assert_eq!(session.value("items[0].amount"), Some(&json!(15)));
        assert_eq!(session.value("first"), Some(&json!(15)));
        assert_eq!(session.value("items[1].qty"), None);
    }

    #[tokio::test]
    async fn test_edit_errors() {
        let (mut session, _) = open(line_items()).await;
        assert!(matches!(
            session.apply_edit("nope", json!(1)).await,
            Err(SessionError::UnknownField(_))
        ));
        assert!(matches!(
            session.apply_edit("items[3].qty", json!(1)).await,
            Err(SessionError::RowOutOfRange { .. })
        ));
        assert!(matches!(
            session.apply_edit("items", json!(1)).await,
            Err(SessionError::NotALeaf(_))
        ));
        assert!(matches!(
            session.apply_edit("1 + 2", json!(1)).await,
            Err(SessionError::InvalidAddress(_))
        ));
        assert!(matches!(
            session.add_row("total").await,
            Err(SessionError::NotRepeating(_))
        ));
    }

    #[tokio::test]
    async fn test_gone_clears_and_rejects() {
        let (mut session, _) = open(json!({"schema": {"properties": {
            "married": {"type": "boolean", "dependentKeys": ["spouse"]},
            "spouse": {
                "type": "object",
                "predicates": [
                    {"condition": "married == true", "action": "APPLY_ACCESS_MATRIX", "actionConfig": {"visibility": "VISIBLE"}},
                    {"condition": "married != true", "action": "APPLY_ACCESS_MATRIX", "actionConfig": {"visibility": "GONE"}}
                ],
                "properties": {"name": {"type": "string"}}
            }
        }}}))
        .await;
        assert_eq!(session.access("spouse.name").unwrap().visibility, Visibility::Gone);

        let report = session.apply_edit("spouse.name", json!("Asha")).await.unwrap();
        assert_eq!(report.diagnostics[0].kind, DiagnosticKind::Rejected);
        assert_eq!(session.value("spouse.name"), None);

        session.apply_edit("married", json!(true)).await.unwrap();
        session.apply_edit("spouse.name", json!("Asha")).await.unwrap();
        assert_eq!(session.value("spouse.name"), Some(&json!("Asha")));

        let report = session.apply_edit("married", json!(false)).await.unwrap();
        assert!(report.has_changed("spouse.name"));
        assert_eq!(session.value("spouse.name"), None);
        assert_eq!(session.answers().snapshot(), json!({"married": false}));
    }

    #[tokio::test]
    async fn test_row_limits() {
        let (mut session, _) = open(json!({"schema": {"properties": {
            "kids": {"type": "array", "minItems": 1, "maxItems": 2, "items": {"properties": {"name": {}}}}
        }}}))
        .await;
        session.add_row("kids").await.unwrap();
        session.add_row("kids").await.unwrap();
        assert_eq!(
            session.add_row("kids").await.unwrap_err(),
            SessionError::RowLimit { group: "kids".into(), limit: 2 }
        );
        session.remove_row("kids", 1).await.unwrap();
        assert!(matches!(
            session.remove_row("kids", 0).await,
            Err(SessionError::RowLimit { limit: 1, .. })
        ));
    }

    #[tokio::test]
    async fn test_prefilled_answers_are_kept() {
        let definition = FormDefinition::from_json_str(&line_items().to_string()).unwrap();
        let (session, _) = FormSession::open_with_answers(
            definition,
            RuntimeConfig::default(),
            Services::default(),
            json!({"items": [{"qty": 2, "price": 4}, {"price": 1}]}),
        )
        .await;
        assert_eq!(session.value("items[1].qty"), Some(&json!(1)));
        assert_eq!(session.value("items[1].amount"), Some(&json!(1)));
        assert_eq!(session.value("first"), Some(&json!(8)));
    }
}
