//! Serde shapes of the schema document, before validation.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::access::AccessPatch;

use super::{MasterBinding, MasterDecl, ValueType};

#[derive(Debug, Deserialize)]
pub struct SchemaDocument {
    pub schema: RawGroup,
    #[serde(default)]
    pub masters: BTreeMap<String, MasterDecl>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RawGroup {
    #[serde(default)]
    pub properties: Entries<RawField>,
    #[serde(default)]
    pub order: Option<Vec<String>>,
    #[serde(default)]
    pub required: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawField {
    #[serde(rename = "type", default)]
    pub value_type: Option<ValueType>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub title: Option<String>,

    #[serde(default)]
    pub properties: Option<Entries<RawField>>,
    #[serde(default)]
    pub order: Option<Vec<String>>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub items: Option<Box<RawField>>,
    #[serde(default)]
    pub min_items: Option<usize>,
    #[serde(default)]
    pub max_items: Option<usize>,

    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    #[serde(default)]
    pub default: Option<JsonValue>,

    #[serde(default)]
    pub access_matrix: Option<AccessPatch>,
    #[serde(default)]
    pub predicates: Vec<RawPredicate>,
    #[serde(default)]
    pub dependent_keys: Vec<String>,
    #[serde(default)]
    pub master: Option<MasterBinding>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawPredicate {
    #[serde(default)]
    pub condition: Option<String>,
    pub action: String,
    #[serde(default)]
    pub action_config: JsonValue,
    #[serde(default)]
    pub skip_predicate_execution_on_client: bool,
    #[serde(default)]
    pub skip_predicate_execution_on_server: bool,
}

/// Object entries in document order, duplicates kept so they can be reported.
#[derive(Debug)]
pub struct Entries<T>(pub Vec<(String, T)>);

impl<T> Default for Entries<T> {
    fn default() -> Self {
        Entries(Vec::new())
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Entries<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct EntriesVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for EntriesVisitor<T> {
            type Value = Entries<T>;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object of field definitions")
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: MapAccess<'de>,
            {
                let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, value)) = map.next_entry::<String, T>()? {
                    entries.push((key, value));
                }
                Ok(Entries(entries))
            }
        }

        deserializer.deserialize_map(EntriesVisitor(PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entries_keep_duplicates_in_order() {
        let group: RawGroup = serde_json::from_str(
            r#"{"properties": {"b": {}, "a": {"type": "number"}, "b": {}}}"#,
        )
        .unwrap();
        let keys: Vec<&str> = group.properties.0.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["b", "a", "b"]);
        assert_eq!(group.properties.0[1].1.value_type, Some(ValueType::Number));
    }

    #[test]
    fn test_predicate_shape() {
        let predicate: RawPredicate = serde_json::from_str(
            r#"{
                "condition": "maritalStatus == 'Married'",
                "action": "APPLY_ACCESS_MATRIX",
                "actionConfig": {"visibility": "VISIBLE"},
                "skipPredicateExecutionOnServer": true
            }"#,
        )
        .unwrap();
        assert_eq!(predicate.action, "APPLY_ACCESS_MATRIX");
        assert!(predicate.skip_predicate_execution_on_server);
        assert!(!predicate.skip_predicate_execution_on_client);
    }
}
