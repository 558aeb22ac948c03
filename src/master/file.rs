use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::http::RowsBody;
use super::{ChangeSet, FetchError, FetchResult, MasterDataSource, RowSet};

/// Serves datasets held in memory, typically loaded from a JSON file of the
/// form `{"districts": [{...}, ...], "states": {"version": "3", "rows": [...]}}`.
/// Static data never changes, so `changes` always returns an empty delta.
#[derive(Default)]
pub struct FileMasterSource {
    datasets: HashMap<String, RowSet>,
    fetches: AtomicUsize,
}

impl FileMasterSource {
    pub fn new(datasets: HashMap<String, RowSet>) -> Self {
        Self {
            datasets,
            fetches: AtomicUsize::new(0),
        }
    }

    pub fn from_value(value: JsonValue) -> FetchResult<Self> {
        let bodies: HashMap<String, RowsBody> =
            serde_json::from_value(value).map_err(|e| FetchError::Decode {
                url: "<inline>".to_string(),
                message: e.to_string(),
            })?;
        Ok(Self::new(
            bodies.into_iter().map(|(id, body)| (id, body.into())).collect(),
        ))
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> FetchResult<Self> {
        let path = path.as_ref();
        let location = path.display().to_string();
        let text = std::fs::read_to_string(path).map_err(|e| FetchError::Request {
            url: location.clone(),
            message: e.to_string(),
        })?;
        let value = serde_json::from_str(&text).map_err(|e| FetchError::Decode {
            url: location,
            message: e.to_string(),
        })?;
        Self::from_value(value)
    }

    /// Number of `fetch`/`fetch_partition` calls served so far.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn dataset(&self, id: &str) -> FetchResult<&RowSet> {
        self.datasets
            .get(id)
            .ok_or_else(|| FetchError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl MasterDataSource for FileMasterSource {
    async fn fetch(&self, dataset: &str, columns: &[String]) -> FetchResult<RowSet> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let set = self.dataset(dataset)?;
        if columns.is_empty() {
            return Ok(set.clone());
        }
        let rows = set
            .rows
            .iter()
            .map(|row| {
                row.iter()
                    .filter(|(column, _)| columns.contains(column))
                    .map(|(column, value)| (column.clone(), value.clone()))
                    .collect()
            })
            .collect();
        Ok(RowSet {
            version: set.version.clone(),
            rows,
        })
    }

    async fn fetch_partition(
        &self,
        dataset: &str,
        column: &str,
        value: &str,
    ) -> FetchResult<RowSet> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.dataset(dataset)?.filter(column, value))
    }

    async fn version(&self, dataset: &str) -> FetchResult<Option<String>> {
        Ok(self.dataset(dataset)?.version.clone())
    }

    async fn changes(&self, dataset: &str, _since: &str) -> FetchResult<ChangeSet> {
        Ok(ChangeSet {
            version: self.dataset(dataset)?.version.clone(),
            ..Default::default()
        })
    }
}
