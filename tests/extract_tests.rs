use chrono::NaiveDate;
use serde_json::json;
use std::sync::Arc;
use unthread_sync::api::{ListEndpoint, RetryPolicy};
use unthread_sync::context::RunContext;
use unthread_sync::error::{ApiError, SyncError};
use unthread_sync::extract::{ExtractFilter, ParallelExtractor, ParallelOptions};
use unthread_sync::test_utils::{create_test_store, FakeConnector, FakeTicketingApi};
use unthread_sync::types::EntityKind;

fn two_week_window() -> ExtractFilter {
    ExtractFilter::date_range(
        NaiveDate::from_ymd_opt(2024, 1, 1),
        NaiveDate::from_ymd_opt(2024, 1, 14),
    )
}

fn parallel(enabled: bool) -> ParallelOptions {
    ParallelOptions {
        enabled,
        max_workers: 2,
        batch_size: 7,
    }
}

fn fixture() -> (Arc<FakeTicketingApi>, Arc<FakeConnector>) {
    let api = Arc::new(FakeTicketingApi::new());
    for id in ["c1", "c2"] {
        api.add_conversation(json!({"id": id, "status": "closed"}));
    }
    let connector = Arc::new(FakeConnector::new(api.clone()));
    (api, connector)
}

#[tokio::test]
async fn each_chunk_gets_its_own_connection() {
    let (api, connector) = fixture();
    api.push_page(ListEndpoint::Conversations, vec![json!({"id": "c1"})], false);
    api.push_page(ListEndpoint::Conversations, vec![json!({"id": "c2"})], false);

    let store = create_test_store();
    let extractor = ParallelExtractor::new(connector.clone(), store.clone(), RetryPolicy::none(), 50, parallel(true));
    let report = extractor
        .extract(Arc::new(RunContext::new()), EntityKind::Conversations, &two_week_window())
        .await
        .unwrap();

    assert_eq!(connector.connects(), 2);
    assert_eq!(report.stored, 2);
    assert!(report.is_clean());
    assert_eq!(store.count(EntityKind::Conversations).unwrap(), 2);
}

#[tokio::test]
async fn sequential_mode_uses_one_connection() {
    let (api, connector) = fixture();
    api.push_page(ListEndpoint::Conversations, vec![json!({"id": "c1"}), json!({"id": "c2"})], false);

    let extractor = ParallelExtractor::new(
        connector.clone(),
        create_test_store(),
        RetryPolicy::none(),
        50,
        parallel(false),
    );
    let report = extractor
        .extract(Arc::new(RunContext::new()), EntityKind::Conversations, &two_week_window())
        .await
        .unwrap();

    assert_eq!(connector.connects(), 1);
    assert_eq!(report.stored, 2);
    assert_eq!(api.list_calls(), 1);
}

#[tokio::test]
async fn failed_chunk_does_not_sink_the_others() {
    let (api, connector) = fixture();
    api.push_list_error(ListEndpoint::Conversations, ApiError::from_status(503, "unavailable"));
    api.push_page(ListEndpoint::Conversations, vec![json!({"id": "c2"})], false);

    let extractor = ParallelExtractor::new(connector, create_test_store(), RetryPolicy::none(), 50, parallel(true));
    let report = extractor
        .extract(Arc::new(RunContext::new()), EntityKind::Conversations, &two_week_window())
        .await
        .unwrap();

    assert_eq!(report.stored, 1);
    assert_eq!(report.chunk_failures.len(), 1);
    assert!(!report.is_clean());
}

#[tokio::test]
async fn rejected_credentials_abort_parallel_extraction() {
    let (api, connector) = fixture();
    api.push_list_error(ListEndpoint::Conversations, ApiError::Unauthorized { status: 403 });

    let extractor = ParallelExtractor::new(connector, create_test_store(), RetryPolicy::none(), 50, parallel(true));
    let err = extractor
        .extract(Arc::new(RunContext::new()), EntityKind::Conversations, &two_week_window())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Auth { .. }));
}

#[tokio::test]
async fn reference_entities_are_never_partitioned() {
    let (api, connector) = fixture();
    api.push_page(ListEndpoint::Users, vec![json!({"id": "u1"}), json!({"id": "u2"})], true);
    api.push_page(ListEndpoint::Users, vec![json!({"id": "u3"})], false);

    let store = create_test_store();
    let extractor = ParallelExtractor::new(connector.clone(), store.clone(), RetryPolicy::none(), 2, parallel(true));
    let ctx = Arc::new(RunContext::new());
    let report = extractor
        .extract(ctx.clone(), EntityKind::Users, &ExtractFilter::default())
        .await
        .unwrap();

    assert_eq!(connector.connects(), 1);
    assert_eq!(report.stored, 3);
    assert_eq!(ctx.counters.snapshot().pages_fetched, 2);
    assert_eq!(store.count(EntityKind::Users).unwrap(), 3);
}
