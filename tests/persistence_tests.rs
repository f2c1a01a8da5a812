use chrono::{Duration, TimeZone, Utc};
use serde_json::json;
use unthread_sync::persistence::{LocalStore, RecordOutcome};
use unthread_sync::types::{
    Classification, Conversation, EntityKind, LifecycleState, Message, Provenance,
};
use tempfile::tempdir;

fn temp_db_path() -> std::path::PathBuf {
    let dir = tempdir().unwrap();
    let path = dir.path().join("test.duckdb");
    // Keep directory alive by leaking it for test duration to avoid drop before use
    Box::leak(Box::new(dir));
    path
}

fn classified(category: &str, resolution: Option<&str>) -> Classification {
    Classification {
        category: Some(category.to_string()),
        sub_category: None,
        resolution: resolution.map(str::to_string),
        reasoning: None,
    }
}

fn pending_ids(store: &LocalStore) -> Vec<String> {
    store
        .pending_classifications()
        .unwrap()
        .into_iter()
        .map(|r| r.conversation_id)
        .collect()
}

#[test]
fn db_initializes_and_tables_exist() {
    let path = temp_db_path();
    let store = LocalStore::new(&path).expect("init db");
    for kind in [
        EntityKind::Users,
        EntityKind::Customers,
        EntityKind::Conversations,
        EntityKind::Messages,
    ] {
        assert_eq!(store.count(kind).unwrap(), 0, "{} should start empty", kind.as_str());
    }
    assert!(store.pending_classifications().unwrap().is_empty());
}

#[test]
fn conversations_and_messages_upsert() {
    let store = LocalStore::new(temp_db_path()).unwrap();
    let payload = json!({"id": "c1", "status": "open", "title": "First"});
    let conversation = Conversation::from_payload(&payload).unwrap();
    store.upsert_conversation(&conversation, &payload).unwrap();

    let payload = json!({"id": "c1", "status": "closed", "title": "Renamed"});
    let conversation = Conversation::from_payload(&payload).unwrap();
    store.upsert_conversation(&conversation, &payload).unwrap();

    assert_eq!(store.count(EntityKind::Conversations).unwrap(), 1);
    let stored = store.get_conversation("c1").unwrap().unwrap();
    assert_eq!(stored.status.as_deref(), Some("closed"));
    assert_eq!(stored.title.as_deref(), Some("Renamed"));

    let message = Message {
        id: "m1".into(),
        conversation_id: "c1".into(),
        sent_at: Utc.with_ymd_and_hms(2024, 1, 1, 9, 0, 0).unwrap(),
        sender: Some("u1".into()),
        text: "hello".into(),
        is_private_note: false,
    };
    store.upsert_message(&message, &json!({"id": "m1"})).unwrap();
    store.upsert_message(&message, &json!({"id": "m1"})).unwrap();
    let messages = store.list_messages("c1").unwrap();
    assert_eq!(messages, vec![message]);
}

#[test]
fn pending_set_tracks_sync_and_reclassification() {
    let store = LocalStore::new(temp_db_path()).unwrap();
    let t0 = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();

    store
        .record_classification_at("c1", &classified("Billing", Some("Resolved")), Provenance::Ai, t0)
        .unwrap();
    assert_eq!(pending_ids(&store), vec!["c1".to_string()]);

    assert!(store.mark_synced("c1", t0 + Duration::minutes(1)).unwrap());
    assert!(pending_ids(&store).is_empty());
    let record = store.get_classification("c1").unwrap().unwrap();
    assert_eq!(record.lifecycle(), LifecycleState::Synced);

    // A newer classification written after the sync is pending again.
    let outcome = store
        .record_classification_at(
            "c1",
            &classified("Account", Some("Resolved")),
            Provenance::Ai,
            t0 + Duration::minutes(5),
        )
        .unwrap();
    assert_eq!(outcome, RecordOutcome::Applied);
    assert_eq!(pending_ids(&store), vec!["c1".to_string()]);
    assert!(store.get_classification("c1").unwrap().unwrap().updated_time.is_none());
}

#[test]
fn incomplete_and_unresolved_records_are_not_pending() {
    let store = LocalStore::new(temp_db_path()).unwrap();
    store
        .record_classification("c1", &classified("Billing", None), Provenance::ApiOverride)
        .unwrap();
    store
        .record_classification("c2", &Classification::default(), Provenance::None)
        .unwrap();
    assert!(pending_ids(&store).is_empty());

    let counts = store.lifecycle_counts().unwrap();
    assert_eq!(counts.get(&LifecycleState::Incomplete), Some(&1));
    assert_eq!(counts.get(&LifecycleState::Unresolved), Some(&1));
}

#[test]
fn lower_provenance_never_overwrites_higher() {
    let store = LocalStore::new(temp_db_path()).unwrap();
    store
        .record_classification("c1", &classified("Billing", Some("Resolved")), Provenance::Warehouse)
        .unwrap();

    let outcome = store
        .record_classification("c1", &classified("Other", Some("Duplicate")), Provenance::Ai)
        .unwrap();
    assert_eq!(
        outcome,
        RecordOutcome::Superseded {
            existing: Provenance::Warehouse
        }
    );
    let record = store.get_classification("c1").unwrap().unwrap();
    assert_eq!(record.category.as_deref(), Some("Billing"));
    assert_eq!(record.provenance, Provenance::Warehouse);

    // The other direction upgrades.
    store
        .record_classification("c2", &classified("Other", Some("Resolved")), Provenance::Ai)
        .unwrap();
    let outcome = store
        .record_classification("c2", &classified("Billing", Some("Resolved")), Provenance::ApiOverride)
        .unwrap();
    assert_eq!(outcome, RecordOutcome::Applied);
    assert_eq!(
        store.get_classification("c2").unwrap().unwrap().provenance,
        Provenance::ApiOverride
    );
}

#[test]
fn exclusion_removes_from_work_lists() {
    let store = LocalStore::new(temp_db_path()).unwrap();
    for id in ["c1", "c2", "c3"] {
        let payload = json!({"id": id});
        let conversation = Conversation::from_payload(&payload).unwrap();
        store.upsert_conversation(&conversation, &payload).unwrap();
    }
    store
        .record_classification("c2", &classified("Billing", Some("Resolved")), Provenance::Ai)
        .unwrap();
    store.exclude("c2", Some("internal test ticket")).unwrap();
    store.exclude("c3", None).unwrap();

    assert!(pending_ids(&store).is_empty());
    assert_eq!(store.unclassified_conversation_ids(None).unwrap(), vec!["c1".to_string()]);
    assert_eq!(store.active_conversation_ids(None).unwrap(), vec!["c1".to_string()]);
    let excluded = store.excluded_ids().unwrap();
    assert!(excluded.contains("c2") && excluded.contains("c3"));
    // Exclusion keeps the classification history.
    assert_eq!(
        store.get_classification("c2").unwrap().unwrap().category.as_deref(),
        Some("Billing")
    );
}

#[test]
fn reset_sync_requeues() {
    let store = LocalStore::new(temp_db_path()).unwrap();
    store
        .record_classification("c1", &classified("Billing", Some("Resolved")), Provenance::Ai)
        .unwrap();
    store.mark_synced("c1", Utc::now() + Duration::seconds(1)).unwrap();
    assert!(pending_ids(&store).is_empty());

    assert!(store.reset_sync("c1").unwrap());
    assert_eq!(pending_ids(&store), vec!["c1".to_string()]);
    assert!(!store.reset_sync("missing").unwrap());
}

#[test]
fn data_survives_reopen() {
    let path = temp_db_path();
    {
        let store = LocalStore::new(&path).unwrap();
        store
            .record_classification("c1", &classified("Billing", Some("Resolved")), Provenance::Ai)
            .unwrap();
        store.checkpoint().unwrap();
    }
    let store = LocalStore::new(&path).unwrap();
    let counts = store.provenance_counts().unwrap();
    assert_eq!(counts.get(&Provenance::Ai), Some(&1));
}

#[test]
fn incomplete_records_stay_in_the_work_list() {
    let store = LocalStore::new(temp_db_path()).unwrap();
    for id in ["c1", "c2"] {
        let payload = json!({"id": id});
        let conversation = Conversation::from_payload(&payload).unwrap();
        store.upsert_conversation(&conversation, &payload).unwrap();
    }
    store
        .record_classification("c1", &classified("LangSmith", None), Provenance::Warehouse)
        .unwrap();
    store
        .record_classification("c2", &classified("Billing", Some("Resolved")), Provenance::ApiOverride)
        .unwrap();

    assert!(!pending_ids(&store).contains(&"c1".to_string()));
    assert_eq!(store.unclassified_conversation_ids(None).unwrap(), vec!["c1".to_string()]);

    store.exclude("c1", None).unwrap();
    assert!(store.unclassified_conversation_ids(None).unwrap().is_empty());
}
