//! Deduplicating, versioned cache in front of a [`MasterDataSource`].
//!
//! Concurrent resolutions of the same (dataset, partition) key share a single
//! in-flight future. The first caller to arrive starts the fetch, stores the
//! result and only then retires the in-flight entry; every other caller
//! awaits a clone of the same [`Shared`] future.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;

use crate::config::MasterDataConfig;
use crate::schema::MasterDecl;

use super::{cell_matches, filter_key, FetchResult, MasterDataSource, PartitionFilter, Row, RowSet};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    dataset: String,
    partition: Option<PartitionFilter>,
}

struct CacheEntry {
    rows: Arc<RowSet>,
    fetched_at: Instant,
    /// None means the entry never expires.
    expires_at: Option<Instant>,
    last_used: Instant,
}

struct VersionCheck {
    token: Option<String>,
    checked_at: Instant,
}

type SharedFetch = Shared<BoxFuture<'static, FetchResult<Arc<RowSet>>>>;

/// Removes a leader's in-flight entry when it finishes or is cancelled.
struct Retire<'a> {
    in_flight: &'a DashMap<CacheKey, SharedFetch>,
    key: CacheKey,
}

impl Drop for Retire<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Counters exposed for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MasterStats {
    pub fetches: u64,
    pub cache_hits: u64,
    pub deduplicated: u64,
    pub evictions: u64,
    pub invalidations: u64,
    pub entries: usize,
}

#[derive(Default)]
struct Counters {
    fetches: AtomicU64,
    cache_hits: AtomicU64,
    deduplicated: AtomicU64,
    evictions: AtomicU64,
    invalidations: AtomicU64,
}

/// What [`MasterDataManager::sync`] did to the cached entries of a dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Unchanged,
    Applied { upserts: usize, deletes: usize },
    Invalidated,
}

pub struct MasterDataManager {
    source: Arc<dyn MasterDataSource>,
    config: MasterDataConfig,
    cache: DashMap<CacheKey, CacheEntry>,
    in_flight: DashMap<CacheKey, SharedFetch>,
    versions: DashMap<String, VersionCheck>,
    counters: Counters,
}

impl MasterDataManager {
    pub fn new(source: Arc<dyn MasterDataSource>, config: MasterDataConfig) -> Self {
        Self {
            source,
            config,
            cache: DashMap::new(),
            in_flight: DashMap::new(),
            versions: DashMap::new(),
            counters: Counters::default(),
        }
    }

    /// Rows of `decl`, restricted to `filter` when given. A filter on the
    /// declared partition column loads only that partition; a filter on any
    /// other column is applied to the full dataset.
    #[tracing::instrument(level = "debug", skip(self, decl), fields(dataset = %decl.id))]
    pub async fn resolve(
        &self,
        decl: &MasterDecl,
        filter: Option<&PartitionFilter>,
    ) -> FetchResult<Arc<RowSet>> {
        self.check_version(decl).await;

        let partitioned = filter
            .filter(|f| decl.partition_column.as_deref() == Some(f.column.as_str()))
            .cloned();
        let key = CacheKey {
            dataset: decl.id.clone(),
            partition: partitioned.clone(),
        };

        let rows = match self.cached(&key) {
            Some(rows) => rows,
            None => self.load(decl, key).await?,
        };

        match filter {
            Some(f) if partitioned.is_none() => Ok(Arc::new(rows.filter(&f.column, &f.value))),
            _ => Ok(rows),
        }
    }

    fn cached(&self, key: &CacheKey) -> Option<Arc<RowSet>> {
        let now = Instant::now();
        let mut entry = self.cache.get_mut(key)?;
        if entry.expires_at.is_some_and(|at| at <= now) {
            drop(entry);
            self.cache.remove(key);
            return None;
        }
        entry.last_used = now;
        self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.rows.clone())
    }

    async fn load(&self, decl: &MasterDecl, key: CacheKey) -> FetchResult<Arc<RowSet>> {
        let (fetch, leader) = match self.in_flight.entry(key.clone()) {
            Entry::Occupied(entry) => {
                self.counters.deduplicated.fetch_add(1, Ordering::Relaxed);
                (entry.get().clone(), false)
            }
            Entry::Vacant(entry) => {
                // the previous leader may have stored and left after our cache miss
                if let Some(rows) = self.cached(&key) {
                    return Ok(rows);
                }
                self.counters.fetches.fetch_add(1, Ordering::Relaxed);
                let fetch = self.start_fetch(decl, &key);
                entry.insert(fetch.clone());
                (fetch, true)
            }
        };
        if !leader {
            return fetch.await;
        }

        // only the leader retires the in-flight entry, after storing
        let _retire = Retire {
            in_flight: &self.in_flight,
            key: key.clone(),
        };
        let result = fetch.await;
        match &result {
            Ok(rows) => self.store(key, rows.clone()),
            Err(e) => tracing::warn!("Failed to fetch master {}: {}", decl.id, e),
        }
        result
    }

    fn start_fetch(&self, decl: &MasterDecl, key: &CacheKey) -> SharedFetch {
        let source = self.source.clone();
        let dataset = decl.id.clone();
        let columns = decl.columns.clone();
        let partition = key.partition.clone();
        async move {
            let rows = match partition {
                Some(p) => source.fetch_partition(&dataset, &p.column, &p.value).await?,
                None => source.fetch(&dataset, &columns).await?,
            };
            Ok(Arc::new(rows))
        }
        .boxed()
        .shared()
    }

    fn store(&self, key: CacheKey, rows: Arc<RowSet>) {
        let now = Instant::now();
        let ttl = self.config.ttl;
        if let Some(token) = rows.version.clone() {
            self.versions
                .entry(key.dataset.clone())
                .and_modify(|v| v.token = Some(token.clone()))
                .or_insert(VersionCheck {
                    token: Some(token),
                    checked_at: now,
                });
        } else {
            self.versions
                .entry(key.dataset.clone())
                .or_insert(VersionCheck {
                    token: None,
                    checked_at: now,
                });
        }

        let dataset = key.dataset.clone();
        let partitioned = key.partition.is_some();
        self.cache.insert(
            key,
            CacheEntry {
                rows,
                fetched_at: now,
                expires_at: (!ttl.is_zero()).then(|| now + ttl),
                last_used: now,
            },
        );
        if partitioned {
            self.evict_partitions(&dataset);
        }
    }

    /// Drops least recently used partitions of `dataset` beyond `max_partitions`.
    fn evict_partitions(&self, dataset: &str) {
        let mut partitions: Vec<(CacheKey, Instant)> = self
            .cache
            .iter()
            .filter(|e| e.key().dataset == dataset && e.key().partition.is_some())
            .map(|e| (e.key().clone(), e.value().last_used))
            .collect();
        if partitions.len() <= self.config.max_partitions {
            return;
        }
        partitions.sort_by_key(|(_, used)| *used);
        let excess = partitions.len() - self.config.max_partitions;
        for (key, _) in partitions.into_iter().take(excess) {
            tracing::debug!("Evicting partition {:?} of {}", key.partition, dataset);
            self.cache.remove(&key);
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Re-reads the version token once per check interval and invalidates
    /// the dataset when it moved. Failures keep the cache as is.
    async fn check_version(&self, decl: &MasterDecl) {
        let known = match self.versions.get(&decl.id) {
            Some(check) if check.checked_at.elapsed() < self.config.version_check_interval => {
                return
            }
            Some(check) => check.token.clone(),
            None => return,
        };

        let token = match self.source.version(&decl.id).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!("Version check for {} failed: {}", decl.id, e);
                known.clone()
            }
        };
        if let (Some(old), Some(new)) = (&known, &token) {
            if old != new {
                tracing::debug!("Master {} moved from {} to {}", decl.id, old, new);
                self.invalidate(&decl.id);
            }
        }
        self.versions.insert(
            decl.id.clone(),
            VersionCheck {
                token: token.or(known),
                checked_at: Instant::now(),
            },
        );
    }

    /// Brings cached entries of `decl` up to date. With a key column and
    /// delta sync enabled the `changes` feed is applied in place; otherwise,
    /// or when the feed fails, a moved version invalidates the dataset.
    #[tracing::instrument(level = "debug", skip(self, decl), fields(dataset = %decl.id))]
    pub async fn sync(&self, decl: &MasterDecl) -> FetchResult<SyncOutcome> {
        let known = self.versions.get(&decl.id).and_then(|v| v.token.clone());
        let current = self.source.version(&decl.id).await?;
        self.versions.insert(
            decl.id.clone(),
            VersionCheck {
                token: current.clone().or(known.clone()),
                checked_at: Instant::now(),
            },
        );

        let since = match known {
            Some(since) => since,
            None => return Ok(SyncOutcome::Unchanged),
        };
        if current.as_ref() == Some(&since) {
            return Ok(SyncOutcome::Unchanged);
        }

        let key_column = match (&decl.key_column, self.config.delta_sync) {
            (Some(column), true) => column,
            _ => {
                self.invalidate(&decl.id);
                return Ok(SyncOutcome::Invalidated);
            }
        };

        let changes = match self.source.changes(&decl.id, &since).await {
            Ok(changes) => changes,
            Err(e) => {
                tracing::warn!("Delta sync for {} failed, invalidating: {}", decl.id, e);
                self.invalidate(&decl.id);
                return Ok(SyncOutcome::Invalidated);
            }
        };

        let version = changes.version.clone().or(current);
        for mut entry in self.cache.iter_mut() {
            if entry.key().dataset != decl.id {
                continue;
            }
            let partition = entry.key().partition.clone();
            let mut rows = entry.rows.rows.clone();
            rows.retain(|row| {
                !row
                    .get(key_column)
                    .is_some_and(|key| changes.deletes.contains(key))
            });
            let upserts = changes.upserts.iter().filter(|row| match &partition {
                Some(p) => row.get(&p.column).is_some_and(|cell| cell_matches(cell, &p.value)),
                None => true,
            });
            for upsert in upserts {
                apply_upsert(&mut rows, upsert, key_column);
            }
            entry.rows = Arc::new(RowSet {
                version: version.clone(),
                rows,
            });
        }
        if let Some(mut check) = self.versions.get_mut(&decl.id) {
            check.token = version;
        }

        Ok(SyncOutcome::Applied {
            upserts: changes.upserts.len(),
            deletes: changes.deletes.len(),
        })
    }

    /// Drops every cached entry of `dataset`.
    pub fn invalidate(&self, dataset: &str) {
        self.cache.retain(|key, _| key.dataset != dataset);
        self.counters.invalidations.fetch_add(1, Ordering::Relaxed);
    }

    /// Drops expired entries; returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.cache.len();
        self.cache
            .retain(|_, entry| entry.expires_at.map_or(true, |at| at > now));
        before - self.cache.len()
    }

    /// Age of the cached entry for a key, if any.
    pub fn age(&self, dataset: &str, filter: Option<&PartitionFilter>) -> Option<std::time::Duration> {
        let key = CacheKey {
            dataset: dataset.to_string(),
            partition: filter.cloned(),
        };
        self.cache.get(&key).map(|e| e.fetched_at.elapsed())
    }

    pub fn stats(&self) -> MasterStats {
        MasterStats {
            fetches: self.counters.fetches.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            deduplicated: self.counters.deduplicated.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            invalidations: self.counters.invalidations.load(Ordering::Relaxed),
            entries: self.cache.len(),
        }
    }
}

fn apply_upsert(rows: &mut Vec<Row>, upsert: &Row, key_column: &str) {
    let key = upsert.get(key_column).and_then(filter_key);
    let existing = key.as_deref().and_then(|key| {
        rows.iter()
            .position(|row| row.get(key_column).is_some_and(|cell| cell_matches(cell, key)))
    });
    match existing {
        Some(index) => rows[index] = upsert.clone(),
        None => rows.push(upsert.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::master::{rows, ChangeSet, FetchError, MockMasterDataSource};
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn districts() -> MasterDecl {
        MasterDecl {
            id: "districts".into(),
            columns: vec!["id".into(), "state".into(), "name".into()],
            partition_column: Some("state".into()),
            key_column: Some("id".into()),
        }
    }

    fn config() -> MasterDataConfig {
        MasterDataConfig {
            version_check_interval: Duration::from_secs(3600),
            ..Default::default()
        }
    }

    fn state_rows(state: &str) -> RowSet {
        RowSet::new(rows(json!([
            {"id": 1, "state": state, "name": format!("{} North", state)},
            {"id": 2, "state": state, "name": format!("{} South", state)}
        ])))
        .with_version("v1")
    }

    /// Counts calls and answers after a delay, so callers overlap.
    struct SlowSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl MasterDataSource for SlowSource {
        async fn fetch(&self, _dataset: &str, _columns: &[String]) -> FetchResult<RowSet> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(state_rows("Goa"))
        }

        async fn fetch_partition(
            &self,
            _dataset: &str,
            _column: &str,
            value: &str,
        ) -> FetchResult<RowSet> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok(state_rows(value))
        }

        async fn version(&self, _dataset: &str) -> FetchResult<Option<String>> {
            Ok(Some("v1".into()))
        }

        async fn changes(&self, _dataset: &str, _since: &str) -> FetchResult<ChangeSet> {
            Ok(ChangeSet::default())
        }
    }

    #[tokio::test]
    async fn test_concurrent_resolves_share_one_fetch() {
        let source = Arc::new(SlowSource {
            calls: AtomicUsize::new(0),
        });
        let manager = MasterDataManager::new(source.clone(), config());
        let decl = districts();
        let filter = PartitionFilter::new("state", "Maharashtra");

        let (a, b) = tokio::join!(
            manager.resolve(&decl, Some(&filter)),
            manager.resolve(&decl, Some(&filter))
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.len(), 2);
        let stats = manager.stats();
        assert_eq!(stats.fetches, 1);
        assert_eq!(stats.deduplicated, 1);

        // now cached
        manager.resolve(&decl, Some(&filter)).await.unwrap();
        assert_eq!(manager.stats().cache_hits, 1);
        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_late_callers_never_refetch() {
        let source = Arc::new(SlowSource {
            calls: AtomicUsize::new(0),
        });
        let manager = Arc::new(MasterDataManager::new(source.clone(), config()));

        // callers keep arriving before, during and after the 50ms fetch
        let mut tasks = Vec::new();
        for i in 0..24u64 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(i * 4)).await;
                let filter = PartitionFilter::new("state", "Kerala");
                manager.resolve(&districts(), Some(&filter)).await
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().len(), 2);
        }

        assert_eq!(source.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        let stats = manager.stats();
        assert_eq!(stats.fetches, 1);
        assert_eq!(stats.cache_hits + stats.deduplicated, 23);
    }

    #[tokio::test]
    async fn test_partition_fetch_and_local_filter() {
        let mut source = MockMasterDataSource::new();
        source
            .expect_fetch_partition()
            .withf(|dataset, column, value| dataset == "districts" && column == "state" && value == "Goa")
            .times(1)
            .returning(|_, _, _| Ok(state_rows("Goa")));
        source
            .expect_fetch()
            .times(1)
            .returning(|_, _| Ok(state_rows("Goa")));
        let manager = MasterDataManager::new(Arc::new(source), config());
        let decl = districts();

        let goa = manager
            .resolve(&decl, Some(&PartitionFilter::new("state", "Goa")))
            .await
            .unwrap();
        assert_eq!(goa.len(), 2);

        // not the partition column: whole dataset, filtered here
        let north = manager
            .resolve(&decl, Some(&PartitionFilter::new("name", "Goa North")))
            .await
            .unwrap();
        assert_eq!(north.values("id"), vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_lru_eviction_of_partitions() {
        let source = Arc::new(SlowSource {
            calls: AtomicUsize::new(0),
        });
        let manager = MasterDataManager::new(
            source.clone(),
            MasterDataConfig {
                max_partitions: 2,
                ..config()
            },
        );
        let decl = districts();
        let goa = PartitionFilter::new("state", "Goa");
        let kerala = PartitionFilter::new("state", "Kerala");
        let assam = PartitionFilter::new("state", "Assam");

        manager.resolve(&decl, Some(&goa)).await.unwrap();
        manager.resolve(&decl, Some(&kerala)).await.unwrap();
        // touch goa so kerala is the least recently used
        manager.resolve(&decl, Some(&goa)).await.unwrap();
        manager.resolve(&decl, Some(&assam)).await.unwrap();

        let stats = manager.stats();
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.entries, 2);
        assert!(manager.age("districts", Some(&kerala)).is_none());
        assert!(manager.age("districts", Some(&goa)).is_some());
    }

    #[tokio::test]
    async fn test_version_change_invalidates() {
        let mut source = MockMasterDataSource::new();
        source
            .expect_fetch()
            .times(2)
            .returning(|_, _| Ok(state_rows("Goa")));
        let mut tokens = vec!["v1", "v2"].into_iter();
        source
            .expect_version()
            .returning(move |_| Ok(tokens.next().map(String::from)));
        let manager = MasterDataManager::new(
            Arc::new(source),
            MasterDataConfig {
                version_check_interval: Duration::ZERO,
                ..config()
            },
        );
        let decl = districts();

        manager.resolve(&decl, None).await.unwrap();
        // token still v1: served from cache
        manager.resolve(&decl, None).await.unwrap();
        assert_eq!(manager.stats().cache_hits, 1);
        // token moved to v2: refetched
        manager.resolve(&decl, None).await.unwrap();
        let stats = manager.stats();
        assert_eq!(stats.invalidations, 1);
        assert_eq!(stats.fetches, 2);
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let mut source = MockMasterDataSource::new();
        source
            .expect_fetch()
            .times(2)
            .returning(|_, _| Ok(RowSet::default()));
        let manager = MasterDataManager::new(
            Arc::new(source),
            MasterDataConfig {
                ttl: Duration::from_millis(10),
                ..config()
            },
        );
        let decl = districts();

        manager.resolve(&decl, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(manager.purge_expired(), 1);
        manager.resolve(&decl, None).await.unwrap();
        assert_eq!(manager.stats().fetches, 2);
    }

    #[tokio::test]
    async fn test_fetch_error_is_not_cached() {
        let mut source = MockMasterDataSource::new();
        let mut attempts = 0;
        source.expect_fetch().times(2).returning(move |_, _| {
            attempts += 1;
            if attempts == 1 {
                Err(FetchError::Timeout("masters/districts".into()))
            } else {
                Ok(RowSet::default())
            }
        });
        let manager = MasterDataManager::new(Arc::new(source), config());
        let decl = districts();

        assert_eq!(
            manager.resolve(&decl, None).await.unwrap_err(),
            FetchError::Timeout("masters/districts".into())
        );
        assert!(manager.resolve(&decl, None).await.is_ok());
    }

    #[tokio::test]
    async fn test_delta_sync_applies_changes() {
        let mut source = MockMasterDataSource::new();
        source
            .expect_fetch_partition()
            .returning(|_, _, value| Ok(state_rows(value)));
        source
            .expect_version()
            .returning(|_| Ok(Some("v2".into())));
        source
            .expect_changes()
            .withf(|dataset, since| dataset == "districts" && since == "v1")
            .times(1)
            .returning(|_, _| {
                Ok(ChangeSet {
                    version: Some("v2".into()),
                    upserts: rows(json!([
                        {"id": 2, "state": "Goa", "name": "Goa South (renamed)"},
                        {"id": 9, "state": "Kerala", "name": "Wayanad"}
                    ])),
                    deletes: vec![json!(1)],
                })
            });
        let manager = MasterDataManager::new(Arc::new(source), config());
        let decl = districts();
        let goa = PartitionFilter::new("state", "Goa");

        manager.resolve(&decl, Some(&goa)).await.unwrap();
        let outcome = manager.sync(&decl).await.unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Applied {
                upserts: 2,
                deletes: 1
            }
        );

        let rows = manager.resolve(&decl, Some(&goa)).await.unwrap();
        assert_eq!(rows.values("name"), vec![json!("Goa South (renamed)")]);
        assert_eq!(rows.version.as_deref(), Some("v2"));
        assert_eq!(manager.stats().fetches, 1);
    }

    #[tokio::test]
    async fn test_sync_without_key_column_invalidates() {
        let mut source = MockMasterDataSource::new();
        source
            .expect_fetch()
            .returning(|_, _| Ok(state_rows("Goa")));
        source
            .expect_version()
            .returning(|_| Ok(Some("v2".into())));
        source.expect_changes().never();
        let manager = MasterDataManager::new(Arc::new(source), config());
        let decl = MasterDecl {
            key_column: None,
            ..districts()
        };

        manager.resolve(&decl, None).await.unwrap();
        assert_eq!(manager.sync(&decl).await.unwrap(), SyncOutcome::Invalidated);
        assert_eq!(manager.stats().entries, 0);
    }
}
