//! # Master Data
//!
//! Externally sourced option datasets. A [`MasterDataSource`] performs the raw
//! fetches; the [`MasterDataManager`] sits in front of it and adds request
//! deduplication, versioned caching, partitioned loading and LRU eviction of
//! partitions. Row sets are handed out as `Arc<RowSet>` and shared read-only by
//! every field bound to the same dataset.

pub mod file;
pub mod http;
pub mod manager;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub use file::FileMasterSource;
pub use http::HttpMasterSource;
pub use manager::{MasterDataManager, MasterStats, SyncOutcome};

/// One dataset row, keyed by column.
pub type Row = serde_json::Map<String, JsonValue>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowSet {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub rows: Vec<Row>,
}

impl RowSet {
    pub fn new(rows: Vec<Row>) -> Self {
        Self {
            version: None,
            rows,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows whose `column` cell matches `value`.
    pub fn filter(&self, column: &str, value: &str) -> RowSet {
        RowSet {
            version: self.version.clone(),
            rows: self
                .rows
                .iter()
                .filter(|row| row.get(column).is_some_and(|cell| cell_matches(cell, value)))
                .cloned()
                .collect(),
        }
    }

    /// Values of `column`, skipping rows without it.
    pub fn values(&self, column: &str) -> Vec<JsonValue> {
        self.rows
            .iter()
            .filter_map(|row| row.get(column).cloned())
            .collect()
    }
}

/// A delta returned by `changes?since=`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub version: Option<String>,
    #[serde(default)]
    pub upserts: Vec<Row>,
    /// Key column values of deleted rows.
    #[serde(default)]
    pub deletes: Vec<JsonValue>,
}

/// Selects the rows whose `column` equals `value`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionFilter {
    pub column: String,
    pub value: String,
}

impl PartitionFilter {
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            value: value.into(),
        }
    }
}

/// Text form used to compare a parent value with dataset cells.
pub fn filter_key(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Null => None,
        JsonValue::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub(crate) fn cell_matches(cell: &JsonValue, value: &str) -> bool {
    filter_key(cell).is_some_and(|key| key == value)
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("Master dataset not found: {0}")]
    NotFound(String),
    #[error("Unexpected status {status} from {url}")]
    Status { url: String, status: u16 },
    #[error("Failed to decode response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error("Request to {0} timed out")]
    Timeout(String),
    #[error("Aggregation {name} failed: {message}")]
    Aggregation { name: String, message: String },
}

pub type FetchResult<T> = Result<T, FetchError>;

/// The four operations a master data backend must offer.
#[mockall::automock]
#[async_trait]
pub trait MasterDataSource: Send + Sync {
    async fn fetch(&self, dataset: &str, columns: &[String]) -> FetchResult<RowSet>;
    async fn fetch_partition(&self, dataset: &str, column: &str, value: &str)
        -> FetchResult<RowSet>;
    /// Current version token, if the backend publishes one.
    async fn version(&self, dataset: &str) -> FetchResult<Option<String>>;
    async fn changes(&self, dataset: &str, since: &str) -> FetchResult<ChangeSet>;
}

#[cfg(test)]
pub(crate) fn rows(value: JsonValue) -> Vec<Row> {
    match value {
        JsonValue::Array(items) => items
            .into_iter()
            .filter_map(|item| match item {
                JsonValue::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_filter_rows() {
        let set = RowSet::new(rows(json!([
            {"state": "Goa", "name": "North Goa"},
            {"state": "Kerala", "name": "Kollam"},
            {"state": "Goa", "name": "South Goa"},
            {"name": "Nowhere"}
        ])));
        let goa = set.filter("state", "Goa");
        assert_eq!(goa.values("name"), vec![json!("North Goa"), json!("South Goa")]);
        assert!(set.filter("state", "Assam").is_empty());
    }

    #[test]
    fn test_filter_key() {
        assert_eq!(filter_key(&json!("a")), Some("a".to_string()));
        assert_eq!(filter_key(&json!(3)), Some("3".to_string()));
        assert_eq!(filter_key(&json!(null)), None);
        assert!(cell_matches(&json!(true), "true"));
    }
}
