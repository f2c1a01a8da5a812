use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use unthread_sync::api::RetryPolicy;
use unthread_sync::config::FieldIds;
use unthread_sync::context::RunContext;
use unthread_sync::error::{ApiError, SyncError};
use unthread_sync::persistence::LocalStore;
use unthread_sync::sync::{BatchUpdater, UpdaterSettings};
use unthread_sync::test_utils::{create_test_store, FakeTicketingApi};
use unthread_sync::types::{Classification, Provenance};

fn settings(dry_run: bool) -> UpdaterSettings {
    UpdaterSettings {
        max_in_flight: 3,
        min_interval: Duration::ZERO,
        dry_run,
    }
}

fn updater(store: &LocalStore, api: &Arc<FakeTicketingApi>, dry_run: bool) -> BatchUpdater {
    BatchUpdater::new(
        store.clone(),
        api.clone(),
        RetryPolicy::none(),
        FieldIds::default(),
        settings(dry_run),
    )
}

fn seed(store: &LocalStore, api: &FakeTicketingApi, id: &str) {
    api.add_conversation(json!({"id": id, "ticketTypeFields": {}}));
    store
        .record_classification(
            id,
            &Classification {
                category: Some("LangGraph".into()),
                sub_category: Some("Platform".into()),
                resolution: Some("Resolved".into()),
                reasoning: Some("test".into()),
            },
            Provenance::Ai,
        )
        .unwrap();
}

#[tokio::test]
async fn one_permanent_failure_does_not_stop_the_batch() {
    let store = create_test_store();
    let api = Arc::new(FakeTicketingApi::new());
    let ids: Vec<String> = (1..=10).map(|i| format!("c{:02}", i)).collect();
    for id in &ids {
        seed(&store, &api, id);
    }
    api.fail_update("c04", ApiError::from_status(400, "field rejected"));

    let pending = store.pending_classifications().unwrap();
    assert_eq!(pending.len(), 10);
    let summary = updater(&store, &api, false)
        .push(&RunContext::new(), &pending, 4)
        .await
        .unwrap();

    assert_eq!(summary.processed, 10);
    assert_eq!(summary.succeeded, 9);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failed_ids, vec!["c04".to_string()]);

    let still_pending: Vec<String> = store
        .pending_classifications()
        .unwrap()
        .into_iter()
        .map(|r| r.conversation_id)
        .collect();
    assert_eq!(still_pending, vec!["c04".to_string()]);
    for id in ids.iter().filter(|id| id.as_str() != "c04") {
        let record = store.get_classification(id).unwrap().unwrap();
        assert!(record.updated_time.is_some(), "{} should be marked synced", id);
    }
}

#[tokio::test]
async fn write_preserves_unrelated_fields() {
    let store = create_test_store();
    let api = Arc::new(FakeTicketingApi::new());
    let fields = FieldIds::default();
    seed(&store, &api, "c1");
    api.add_conversation(json!({
        "id": "c1",
        "ticketTypeFields": {
            "priority-field": "P1",
            fields.category.clone(): "Old category",
        }
    }));

    let pending = store.pending_classifications().unwrap();
    let summary = updater(&store, &api, false)
        .push(&RunContext::new(), &pending, 50)
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);

    let remote = api.conversation("c1").unwrap();
    let written = &remote["ticketTypeFields"];
    assert_eq!(written["priority-field"], "P1");
    assert_eq!(written[&fields.category], "LangGraph");
    assert_eq!(written[&fields.sub_category], "Platform");
    assert_eq!(written[&fields.migration_category], "LangGraph - Platform");
    assert_eq!(written[&fields.resolution], "Resolved");
}

#[tokio::test]
async fn dry_run_sends_nothing_and_keeps_records_pending() {
    let store = create_test_store();
    let api = Arc::new(FakeTicketingApi::new());
    seed(&store, &api, "c1");
    seed(&store, &api, "c2");

    let ctx = RunContext::new();
    let pending = store.pending_classifications().unwrap();
    let summary = updater(&store, &api, true).push(&ctx, &pending, 50).await.unwrap();

    assert_eq!(summary.skipped, 2);
    assert_eq!(summary.succeeded, 0);
    assert_eq!(api.update_calls(), 0);
    assert_eq!(store.pending_classifications().unwrap().len(), 2);
}

#[tokio::test]
async fn remote_already_current_is_marked_without_a_write() {
    let store = create_test_store();
    let api = Arc::new(FakeTicketingApi::new());
    seed(&store, &api, "c1");

    let updater = updater(&store, &api, false);
    let pending = store.pending_classifications().unwrap();
    updater.push(&RunContext::new(), &pending, 50).await.unwrap();
    assert_eq!(api.update_calls(), 1);

    store.reset_sync("c1").unwrap();
    let pending = store.pending_classifications().unwrap();
    let summary = updater.push(&RunContext::new(), &pending, 50).await.unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(api.update_calls(), 1);
    assert!(store.pending_classifications().unwrap().is_empty());
}

#[tokio::test]
async fn rejected_credentials_abort_the_push() {
    let store = create_test_store();
    let api = Arc::new(FakeTicketingApi::new());
    seed(&store, &api, "c1");
    api.fail_update("c1", ApiError::Unauthorized { status: 401 });

    let pending = store.pending_classifications().unwrap();
    let err = updater(&store, &api, false)
        .push(&RunContext::new(), &pending, 50)
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Auth { .. }));
    assert_eq!(store.pending_classifications().unwrap().len(), 1);
}

#[tokio::test]
async fn missing_remote_conversation_is_a_failure() {
    let store = create_test_store();
    let api = Arc::new(FakeTicketingApi::new());
    seed(&store, &api, "c1");
    store
        .record_classification(
            "ghost",
            &Classification {
                category: Some("Other".into()),
                sub_category: Some("General".into()),
                resolution: Some("Resolved".into()),
                reasoning: None,
            },
            Provenance::Ai,
        )
        .unwrap();

    let pending = store.pending_classifications().unwrap();
    let summary = updater(&store, &api, false)
        .push(&RunContext::new(), &pending, 50)
        .await
        .unwrap();
    assert_eq!(summary.succeeded, 1);
    assert_eq!(summary.failed_ids, vec!["ghost".to_string()]);
}
