//! # Access Matrix
//!
//! Each field instance has an *own* access state, initialised from the schema
//! and changed by APPLY_ACCESS_MATRIX, and an *effective* state derived from
//! its own state and its parent's effective state:
//!
//! * a GONE ancestor gates every descendant to GONE
//! * INVISIBLE, readOnly, mandatory and roles flow down only when the matching
//!   [`CascadeConfig`] switch is on
//! * a field that is not effectively VISIBLE is never effectively mandatory

use serde::{Deserialize, Serialize};

use crate::config::CascadeConfig;

#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    #[default]
    Visible,
    Invisible,
    Gone,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessState {
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub mandatory: bool,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Partial access matrix; unspecified properties keep their prior value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<Visibility>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mandatory: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_only: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub roles: Option<Vec<String>>,
}

impl AccessPatch {
    pub fn is_empty(&self) -> bool {
        self.visibility.is_none()
            && self.mandatory.is_none()
            && self.read_only.is_none()
            && self.roles.is_none()
    }
}

impl AccessState {
    /// Merges `patch` property by property. Returns whether anything changed.
    pub fn merge(&mut self, patch: &AccessPatch) -> bool {
        let before = self.clone();
        if let Some(visibility) = patch.visibility {
            self.visibility = visibility;
        }
        if let Some(mandatory) = patch.mandatory {
            self.mandatory = mandatory;
        }
        if let Some(read_only) = patch.read_only {
            self.read_only = read_only;
        }
        if let Some(roles) = &patch.roles {
            self.roles = roles.clone();
        }
        *self != before
    }
}

impl From<AccessPatch> for AccessState {
    fn from(patch: AccessPatch) -> Self {
        let mut state = AccessState::default();
        state.merge(&patch);
        state
    }
}

/// Access state after cascading, as seen by renderers and submitters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EffectiveAccess {
    pub visibility: Visibility,
    pub mandatory: bool,
    pub read_only: bool,
    pub roles: Vec<String>,
}

impl EffectiveAccess {
    pub fn is_gone(&self) -> bool {
        self.visibility == Visibility::Gone
    }

    pub fn is_visible(&self) -> bool {
        self.visibility == Visibility::Visible
    }
}

#[derive(Debug, Clone, Default)]
pub struct AccessResolver {
    cascade: CascadeConfig,
}

impl AccessResolver {
    pub fn new(cascade: CascadeConfig) -> Self {
        Self { cascade }
    }

    /// Effective access of a field given its own state and the effective
    /// state of its parent (`None` for top-level fields).
    pub fn resolve(&self, own: &AccessState, parent: Option<&EffectiveAccess>) -> EffectiveAccess {
        let inherited = match parent.map(|p| p.visibility) {
            Some(Visibility::Gone) => Visibility::Gone,
            Some(Visibility::Invisible) if self.cascade.invisible_cascades => {
                Visibility::Invisible
            }
            _ => Visibility::Visible,
        };
        let visibility = own.visibility.max(inherited);

        let read_only =
            own.read_only || (self.cascade.read_only_cascades && parent.is_some_and(|p| p.read_only));
        let mandatory = (own.mandatory
            || (self.cascade.mandatory_cascades && parent.is_some_and(|p| p.mandatory)))
            && visibility == Visibility::Visible;
        let roles = match parent {
            Some(p) if self.cascade.roles_cascade && own.roles.is_empty() => p.roles.clone(),
            _ => own.roles.clone(),
        };

        EffectiveAccess {
            visibility,
            mandatory,
            read_only,
            roles,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn own(visibility: Visibility, mandatory: bool) -> AccessState {
        AccessState {
            visibility,
            mandatory,
            ..Default::default()
        }
    }

    fn effective(visibility: Visibility) -> EffectiveAccess {
        EffectiveAccess {
            visibility,
            mandatory: true,
            read_only: true,
            roles: vec!["admin".into()],
        }
    }

    #[test]
    fn test_merge_is_partial() {
        let mut state = own(Visibility::Visible, true);
        let changed = state.merge(&AccessPatch {
            visibility: Some(Visibility::Gone),
            ..Default::default()
        });
        assert!(changed);
        assert_eq!(state.visibility, Visibility::Gone);
        assert!(state.mandatory);
        assert!(!state.merge(&AccessPatch::default()));
    }

    #[test]
    fn test_gone_gates_descendants() {
        let resolver = AccessResolver::default();
        let result = resolver.resolve(
            &own(Visibility::Visible, true),
            Some(&effective(Visibility::Gone)),
        );
        assert_eq!(result.visibility, Visibility::Gone);
        assert!(!result.mandatory);
    }

    #[test]
    fn test_invisible_does_not_cascade_by_default() {
        let resolver = AccessResolver::default();
        let parent = effective(Visibility::Invisible);
        let result = resolver.resolve(&own(Visibility::Visible, true), Some(&parent));
        assert_eq!(result.visibility, Visibility::Visible);
        assert!(result.mandatory);
        assert!(!result.read_only);
        assert!(result.roles.is_empty());

        let resolver = AccessResolver::new(CascadeConfig {
            invisible_cascades: true,
            ..Default::default()
        });
        let result = resolver.resolve(&own(Visibility::Visible, true), Some(&parent));
        assert_eq!(result.visibility, Visibility::Invisible);
        assert!(!result.mandatory);
    }

    #[test]
    fn test_switchable_cascades() {
        let resolver = AccessResolver::new(CascadeConfig {
            read_only_cascades: true,
            mandatory_cascades: true,
            roles_cascade: true,
            ..Default::default()
        });
        let result = resolver.resolve(
            &own(Visibility::Visible, false),
            Some(&effective(Visibility::Visible)),
        );
        assert!(result.read_only);
        assert!(result.mandatory);
        assert_eq!(result.roles, vec!["admin".to_string()]);
    }

    #[test]
    fn test_hidden_field_is_not_mandatory() {
        let resolver = AccessResolver::default();
        let result = resolver.resolve(&own(Visibility::Invisible, true), None);
        assert!(!result.mandatory);
    }

    #[test]
    fn test_visibility_json() {
        let patch: AccessPatch =
            serde_json::from_str(r#"{"visibility": "GONE", "readOnly": true}"#).unwrap();
        assert_eq!(patch.visibility, Some(Visibility::Gone));
        assert_eq!(patch.read_only, Some(true));
        assert_eq!(patch.mandatory, None);
    }
}
