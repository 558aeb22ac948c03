use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use form_runtime::action::{Aggregator, MockAggregator};
use form_runtime::master::{FetchError, FetchResult};
use form_runtime::session::DiagnosticKind;
use form_runtime::{FormDefinition, FormSession, RuntimeConfig, Services, SessionHandle};
use pretty_assertions::assert_eq;
use serde_json::{json, Value as JsonValue};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[ctor::ctor]
fn init_tests() {
    // テストの前に一度だけ実行したい処理
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set tracing subscriber");
}

/// Doubles `n`, sleeping `n * 10` ms first so larger inputs finish later.
struct SlowDoubler;

#[async_trait]
impl Aggregator for SlowDoubler {
    async fn aggregate(
        &self,
        _name: &str,
        arguments: &BTreeMap<String, JsonValue>,
    ) -> FetchResult<JsonValue> {
        let n = arguments.get("n").and_then(JsonValue::as_i64).unwrap_or(0);
        tokio::time::sleep(Duration::from_millis(n as u64 * 10)).await;
        Ok(json!(n * 2))
    }
}

fn definition() -> FormDefinition {
    FormDefinition::from_json_str(
        &json!({"schema": {"properties": {
            "n": {"type": "integer", "dependentKeys": ["score"]},
            "score": {"type": "integer", "dependentKeys": ["label"], "predicates": [
                {"condition": "n > 0", "action": "ASYNC_CALC",
                 "actionConfig": {"aggregation": "double", "arguments": {"n": "n"}}},
                {"condition": "n == 0", "action": "CALC", "actionConfig": {"formula": "0"}}
            ]},
            "label": {"predicates": [
                {"condition": "score > 10", "action": "CALC", "actionConfig": {"formula": "'high'"}},
                {"condition": "score <= 10", "action": "CALC", "actionConfig": {"formula": "'low'"}}
            ]}
        }}})
        .to_string(),
    )
    .unwrap()
}

async fn open(aggregator: Arc<dyn Aggregator>) -> FormSession {
    let services = Services::default().with_aggregator(aggregator);
    let (session, _) = FormSession::open(definition(), RuntimeConfig::default(), services).await;
    session
}

#[tokio::test]
async fn test_result_applies_and_propagates() {
    let mut aggregator = MockAggregator::new();
    aggregator
        .expect_aggregate()
        .withf(|name, arguments| name == "double" && arguments.get("n") == Some(&json!(4)))
        .times(1)
        .returning(|_, _| Ok(json!(8)));
    let mut session = open(Arc::new(aggregator)).await;

    let report = session.apply_edit("n", json!(4)).await.unwrap();
    assert!(report.has_changed("score"));
    assert!(session.is_pending("score"));
    assert_eq!(session.snapshot().field("score").map(|f| f.pending), Some(true));

    let settled = session.settle().await;
    assert!(!session.has_pending());
    assert_eq!(session.value("score"), Some(&json!(8)));
    assert!(settled.has_changed("label"));
    assert_eq!(session.value("label"), Some(&json!("low")));
}

#[tokio::test]
async fn test_last_edit_wins() {
    let mut session = open(Arc::new(SlowDoubler)).await;

    // slow call first, fast call second
    session.apply_edit("n", json!(9)).await.unwrap();
    session.apply_edit("n", json!(2)).await.unwrap();
    session.settle().await;
    assert_eq!(session.value("score"), Some(&json!(4)));

    // the superseded call still arrives and is dropped
    let stale = tokio::time::timeout(Duration::from_secs(2), session.next_completion())
        .await
        .unwrap()
        .unwrap();
    let report = session.complete(stale).await;
    assert!(report.changed.is_empty());
    assert_eq!(session.value("score"), Some(&json!(4)));
    assert_eq!(session.value("label"), Some(&json!("low")));
}

#[tokio::test]
async fn test_condition_turning_false_cancels_pending() {
    let mut session = open(Arc::new(SlowDoubler)).await;
    session.apply_edit("n", json!(5)).await.unwrap();
    assert!(session.is_pending("score"));

    // the CALC branch takes over and the in-flight call no longer counts
    let report = session.apply_edit("n", json!(0)).await.unwrap();
    assert!(report.has_changed("score"));
    assert!(!session.is_pending("score"));
    assert!(!session.has_pending());
    assert_eq!(session.value("score"), Some(&json!(0)));
    assert_eq!(session.value("label"), Some(&json!("low")));

    let stale = tokio::time::timeout(Duration::from_secs(2), session.next_completion())
        .await
        .unwrap()
        .unwrap();
    let report = session.complete(stale).await;
    assert!(report.changed.is_empty());
    assert_eq!(session.value("score"), Some(&json!(0)));
    assert_eq!(session.value("label"), Some(&json!("low")));
}

#[tokio::test]
async fn test_user_edit_supersedes_pending_result() {
    let mut session = open(Arc::new(SlowDoubler)).await;
    session.apply_edit("n", json!(5)).await.unwrap();
    session.apply_edit("score", json!(100)).await.unwrap();
    assert!(!session.is_pending("score"));
    assert_eq!(session.value("label"), Some(&json!("high")));

    let stale = tokio::time::timeout(Duration::from_secs(2), session.next_completion())
        .await
        .unwrap()
        .unwrap();
    session.complete(stale).await;
    assert_eq!(session.value("score"), Some(&json!(100)));
}

#[tokio::test]
async fn test_failed_aggregation_keeps_value() {
    let mut aggregator = MockAggregator::new();
    aggregator
        .expect_aggregate()
        .returning(|name, _| {
            Err(FetchError::Aggregation {
                name: name.to_string(),
                message: "backend down".into(),
            })
        });
    let mut session = open(Arc::new(aggregator)).await;

    session.apply_edit("n", json!(3)).await.unwrap();
    let report = session.settle().await;
    assert_eq!(report.diagnostics.len(), 1);
    assert_eq!(report.diagnostics[0].kind, DiagnosticKind::Fetch);
    assert_eq!(session.value("score"), None);
    assert!(!session.has_pending());
}

#[tokio::test]
async fn test_handle_publishes_async_results() {
    let mut aggregator = MockAggregator::new();
    aggregator.expect_aggregate().returning(|_, _| Ok(json!(42)));
    let services = Services::default().with_aggregator(Arc::new(aggregator));
    let (handle, _) = SessionHandle::spawn(definition(), RuntimeConfig::default(), services).await;
    let mut updates = handle.subscribe();

    handle.edit("n", json!(21)).await.unwrap();
    let report = tokio::time::timeout(Duration::from_secs(2), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(report.has_changed("score"));
    assert!(report.has_changed("label"));

    let snapshot = handle.snapshot().await.unwrap();
    assert_eq!(snapshot.answers, json!({"n": 21, "score": 42, "label": "high"}));
}
