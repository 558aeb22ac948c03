use serde::Serialize;
use serde_json::Value as JsonValue;

use super::FormSession;
use crate::schema::{FieldKind, LeafSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum IssueKind {
    MandatoryMissing,
    TooShort,
    TooLong,
    PatternMismatch,
    BelowMinimum,
    AboveMaximum,
    TooFewRows,
    TooManyRows,
    /// A VALIDATE predicate currently reports the field invalid.
    Invalid,
}

/// Why the form cannot be submitted yet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmitIssue {
    pub address: String,
    pub kind: IssueKind,
    pub message: String,
}

impl SubmitIssue {
    fn new(address: &str, kind: IssueKind, message: String) -> Self {
        Self {
            address: address.to_string(),
            kind,
            message,
        }
    }
}

impl FormSession {
    /// Checks every visible instance against its schema constraints,
    /// mandatory flags and VALIDATE results. An empty list means the answers
    /// can be submitted.
    pub fn validate_for_submit(&self) -> Vec<SubmitIssue> {
        let schema = self.definition.schema();
        let mut issues = Vec::new();

        for field in schema.fields() {
            for instance in self.instances_under(field.id, &[]) {
                let access = self.effective.get(&instance).cloned().unwrap_or_default();
                if !access.is_visible() {
                    continue;
                }
                let address = schema.address_of(field.id, &instance.rows).to_string();
                let value = self.answers.get(&schema.address_of(field.id, &instance.rows));

                match &field.kind {
                    FieldKind::Leaf(spec) => match value.filter(|v| !is_blank(v)) {
                        None if access.mandatory => issues.push(SubmitIssue::new(
                            &address,
                            IssueKind::MandatoryMissing,
                            format!("{} is required", address),
                        )),
                        None => {}
                        Some(value) => issues.extend(check_leaf(&address, spec, value)),
                    },
                    FieldKind::Repeating {
                        min_rows, max_rows, ..
                    } => {
                        let count = self.answers.row_count(&schema.address_of(field.id, &instance.rows));
                        if count == 0 && access.mandatory {
                            issues.push(SubmitIssue::new(
                                &address,
                                IssueKind::MandatoryMissing,
                                format!("{} needs at least one row", address),
                            ));
                        }
                        if let Some(min) = min_rows.filter(|min| count < *min) {
                            issues.push(SubmitIssue::new(
                                &address,
                                IssueKind::TooFewRows,
                                format!("{} needs at least {} row(s), has {}", address, min, count),
                            ));
                        }
                        if let Some(max) = max_rows.filter(|max| count > *max) {
                            issues.push(SubmitIssue::new(
                                &address,
                                IssueKind::TooManyRows,
                                format!("{} allows at most {} row(s), has {}", address, max, count),
                            ));
                        }
                    }
                    FieldKind::Group { .. } => {}
                }

                if let Some(message) = self.errors.get(&instance) {
                    issues.push(SubmitIssue::new(&address, IssueKind::Invalid, message.clone()));
                }
            }
        }
        issues
    }
}

fn is_blank(value: &JsonValue) -> bool {
    match value {
        JsonValue::Null => true,
        JsonValue::String(s) => s.trim().is_empty(),
        JsonValue::Array(items) => items.is_empty(),
        _ => false,
    }
}

fn check_leaf(address: &str, spec: &LeafSpec, value: &JsonValue) -> Vec<SubmitIssue> {
    let mut issues = Vec::new();
    if let JsonValue::String(text) = value {
        let length = text.chars().count();
        if let Some(min) = spec.min_length.filter(|min| length < *min) {
            issues.push(SubmitIssue::new(
                address,
                IssueKind::TooShort,
                format!("{} must be at least {} characters", address, min),
            ));
        }
        if let Some(max) = spec.max_length.filter(|max| length > *max) {
            issues.push(SubmitIssue::new(
                address,
                IssueKind::TooLong,
                format!("{} must be at most {} characters", address, max),
            ));
        }
        if let Some(pattern) = spec.pattern.as_ref().filter(|p| !p.is_match(text)) {
            issues.push(SubmitIssue::new(
                address,
                IssueKind::PatternMismatch,
                format!("{} does not match {}", address, pattern.as_str()),
            ));
        }
    }
    if let Some(number) = value.as_f64() {
        if let Some(min) = spec.minimum.filter(|min| number < *min) {
            issues.push(SubmitIssue::new(
                address,
                IssueKind::BelowMinimum,
                format!("{} must be at least {}", address, min),
            ));
        }
        if let Some(max) = spec.maximum.filter(|max| number > *max) {
            issues.push(SubmitIssue::new(
                address,
                IssueKind::AboveMaximum,
                format!("{} must be at most {}", address, max),
            ));
        }
    }
    issues
}
