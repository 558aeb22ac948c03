use serde::{Deserialize, Serialize};
use std::{fs::File, io::BufReader, path::Path, time::Duration};

use crate::{Error, InternalResult};

/// Settings of one form runtime. Every field has a default, so `{}` is a
/// valid configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub mode: RuntimeMode,

    /// Fail on operations across incompatible kinds instead of yielding null.
    #[serde(default)]
    pub strict_expressions: bool,

    /// Upper bound on how often one predicate of one field instance may fire
    /// during a single propagation pass.
    #[serde(default = "default_max_firings_per_predicate")]
    pub max_firings_per_predicate: usize,

    /// Clear values of fields whose effective visibility becomes GONE.
    #[serde(default = "default_true")]
    pub clear_on_gone: bool,

    #[serde(default)]
    pub cascade: CascadeConfig,

    #[serde(default)]
    pub option_filter: EmptyParentFilter,

    #[serde(default)]
    pub master: MasterDataConfig,

    /// Capacity of a session's command queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

/// Which side is evaluating; predicates flagged to skip this side never fire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum RuntimeMode {
    #[default]
    Client,
    Server,
}

/// Which access properties of a container flow down to its descendants.
/// GONE always gates descendants and has no switch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CascadeConfig {
    #[serde(default)]
    pub invisible_cascades: bool,
    #[serde(default)]
    pub read_only_cascades: bool,
    #[serde(default)]
    pub mandatory_cascades: bool,
    #[serde(default)]
    pub roles_cascade: bool,
}

/// Options shown by OPTION_FILTER while the controlling parent is empty.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
pub enum EmptyParentFilter {
    /// No options.
    #[default]
    None,
    /// Every row of the dataset.
    All,
    /// Whatever the field showed before the parent was cleared.
    KeepPrior,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MasterDataConfig {
    #[serde(default = "default_version_check_interval", with = "duration_ms")]
    pub version_check_interval: Duration,

    #[serde(default = "default_cache_ttl", with = "duration_ms")]
    pub ttl: Duration,

    /// Cached partitions kept per dataset before the least recently used
    /// one is evicted.
    #[serde(default = "default_max_partitions")]
    pub max_partitions: usize,

    /// Apply `changes?since=` deltas instead of refetching on version change.
    #[serde(default = "default_true")]
    pub delta_sync: bool,

    /// Applied by [`HttpMasterSource`](crate::master::HttpMasterSource) only.
    #[serde(default = "default_request_timeout", with = "duration_ms")]
    pub request_timeout: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            mode: RuntimeMode::default(),
            strict_expressions: false,
            max_firings_per_predicate: default_max_firings_per_predicate(),
            clear_on_gone: default_true(),
            cascade: CascadeConfig::default(),
            option_filter: EmptyParentFilter::default(),
            master: MasterDataConfig::default(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl Default for MasterDataConfig {
    fn default() -> Self {
        Self {
            version_check_interval: default_version_check_interval(),
            ttl: default_cache_ttl(),
            max_partitions: default_max_partitions(),
            delta_sync: default_true(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl RuntimeConfig {
    // JSONファイルから設定を読み込む
    pub fn from_file<P: AsRef<Path>>(path: P) -> InternalResult<Self> {
        from_file(path)
    }
}

pub fn from_file<T: for<'de> Deserialize<'de>, P: AsRef<Path>>(path: P) -> InternalResult<T> {
    let path = path.as_ref();
    let file = File::open(path)
        .map_err(|e| Error::Config(format!("Failed to open {}: {}", path.display(), e)))?;
    let reader = BufReader::new(file);
    let config = serde_json::from_reader(reader)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
    Ok(config)
}

pub fn from_str<T: for<'de> Deserialize<'de>>(s: &str) -> InternalResult<T> {
    let config =
        serde_json::from_str(s).map_err(|e| Error::Config(format!("Failed to parse: {}", e)))?;
    Ok(config)
}

// デフォルト値の定義
fn default_true() -> bool {
    true
}

fn default_max_firings_per_predicate() -> usize {
    16
}

fn default_queue_capacity() -> usize {
    64
}

fn default_version_check_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(30 * 60)
}

fn default_max_partitions() -> usize {
    32
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

// Duration型のシリアライズ/デシリアライズヘルパー
mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_empty_object_is_default() {
        let config: RuntimeConfig = from_str("{}").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.mode, RuntimeMode::Client);
        assert_eq!(config.option_filter, EmptyParentFilter::None);
        assert!(!config.cascade.invisible_cascades);
    }

    #[test]
    fn test_partial_config() {
        let config: RuntimeConfig = from_str(
            r#"{
                "mode": "server",
                "strict_expressions": true,
                "cascade": { "invisible_cascades": true },
                "option_filter": "keep_prior",
                "master": { "ttl": 1500, "max_partitions": 2 }
            }"#,
        )
        .unwrap();
        assert_eq!(config.mode, RuntimeMode::Server);
        assert!(config.strict_expressions);
        assert!(config.cascade.invisible_cascades);
        assert!(!config.cascade.roles_cascade);
        assert_eq!(config.option_filter, EmptyParentFilter::KeepPrior);
        assert_eq!(config.master.ttl, Duration::from_millis(1500));
        assert_eq!(config.master.max_partitions, 2);
        assert_eq!(
            config.master.version_check_interval,
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_round_trip_durations() {
        let config = MasterDataConfig::default();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["ttl"], serde_json::json!(1_800_000));
    }

    #[test]
    fn test_invalid_config() {
        let result: InternalResult<RuntimeConfig> = from_str(r#"{"mode": "browser"}"#);
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
