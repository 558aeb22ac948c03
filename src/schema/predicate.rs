use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::access::AccessPatch;
use crate::ast::{Address, Expression};
use crate::config::RuntimeMode;

/// The action a predicate performs when its condition holds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ActionKind {
    Calc,
    OptionFilter,
    ApplyAccessMatrix,
    Validate,
    Copy,
    Append,
    AsyncCalc,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Calc {
        formula: Expression,
    },
    OptionFilter {
        /// Controlling parent field.
        parent: Address,
        /// Dataset column compared with the parent's value.
        column: String,
    },
    ApplyAccessMatrix(AccessPatch),
    Validate {
        message: String,
    },
    Copy {
        source: Address,
    },
    Append {
        expression: Expression,
    },
    AsyncCalc {
        aggregation: String,
        arguments: BTreeMap<String, Expression>,
    },
}

impl Action {
    pub fn kind(&self) -> ActionKind {
        match self {
            Action::Calc { .. } => ActionKind::Calc,
            Action::OptionFilter { .. } => ActionKind::OptionFilter,
            Action::ApplyAccessMatrix(_) => ActionKind::ApplyAccessMatrix,
            Action::Validate { .. } => ActionKind::Validate,
            Action::Copy { .. } => ActionKind::Copy,
            Action::Append { .. } => ActionKind::Append,
            Action::AsyncCalc { .. } => ActionKind::AsyncCalc,
        }
    }

    /// Whether the action produces the field's value.
    pub fn writes_value(&self) -> bool {
        matches!(
            self,
            Action::Calc { .. } | Action::Copy { .. } | Action::Append { .. } | Action::AsyncCalc { .. }
        )
    }

    /// Every expression the action reads, for dependency scanning.
    pub fn expressions(&self) -> Vec<&Expression> {
        match self {
            Action::Calc { formula } => vec![formula],
            Action::Append { expression } => vec![expression],
            Action::AsyncCalc { arguments, .. } => arguments.values().collect(),
            _ => Vec::new(),
        }
    }

    /// Fields the action reads directly by address.
    pub fn addresses(&self) -> Vec<&Address> {
        match self {
            Action::OptionFilter { parent, .. } => vec![parent],
            Action::Copy { source } => vec![source],
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Predicate {
    pub condition: Option<Expression>,
    /// Original condition text, kept for diagnostics.
    pub condition_source: Option<String>,
    pub action: Action,
    pub skip_on_client: bool,
    pub skip_on_server: bool,
}

impl Predicate {
    pub fn runs_in(&self, mode: RuntimeMode) -> bool {
        match mode {
            RuntimeMode::Client => !self.skip_on_client,
            RuntimeMode::Server => !self.skip_on_server,
        }
    }

    /// Every field reference read by the condition and the action.
    pub fn references(&self) -> Vec<&Address> {
        let mut out: Vec<&Address> = self
            .condition
            .iter()
            .flat_map(|c| c.references())
            .collect();
        for expr in self.action.expressions() {
            out.extend(expr.references());
        }
        out.extend(self.action.addresses());
        out
    }
}

// actionConfig payloads

#[derive(Debug, Deserialize)]
pub(crate) struct CalcConfig {
    pub formula: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OptionFilterConfig {
    pub field: String,
    #[serde(default)]
    pub column: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ValidateConfig {
    #[serde(default = "default_validation_message")]
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CopyConfig {
    pub field: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AppendConfig {
    pub expression: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AsyncCalcConfig {
    pub aggregation: String,
    #[serde(default)]
    pub arguments: BTreeMap<String, String>,
}

fn default_validation_message() -> String {
    "Invalid value".to_string()
}
