use chrono::{TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use unthread_sync::api::RetryPolicy;
use unthread_sync::classify::{ClassificationResolver, ResolverSettings, Taxonomy, Tier, TierOutcome};
use unthread_sync::config::{AppConfig, FieldIds};
use unthread_sync::context::RunContext;
use unthread_sync::llm::mock::DEFAULT_CLASSIFICATION;
use unthread_sync::llm::MockProvider;
use unthread_sync::persistence::LocalStore;
use unthread_sync::test_utils::{create_test_store, warehouse_row, FakeTicketingApi, StaticWarehouse};
use unthread_sync::types::{Classification, Conversation, Message, Provenance};
use unthread_sync::warehouse::WarehouseRow;

struct Harness {
    store: LocalStore,
    api: Arc<FakeTicketingApi>,
    warehouse: Arc<StaticWarehouse>,
    provider: MockProvider,
}

impl Harness {
    fn new(warehouse: StaticWarehouse, provider: MockProvider) -> Self {
        Self {
            store: create_test_store(),
            api: Arc::new(FakeTicketingApi::new()),
            warehouse: Arc::new(warehouse),
            provider,
        }
    }

    fn resolver(&self) -> ClassificationResolver {
        let config = AppConfig::embedded_default().unwrap();
        ClassificationResolver::new(
            self.store.clone(),
            self.warehouse.clone(),
            self.api.clone(),
            Arc::new(self.provider.clone()),
            Taxonomy::from_config(&config.taxonomy),
            RetryPolicy::none(),
            ResolverSettings::default(),
        )
    }

    /// Remote conversation with no custom fields plus one stored message.
    fn conversation_with_transcript(&self, id: &str) {
        self.api.add_conversation(json!({"id": id}));
        let message = Message {
            id: format!("{}-m1", id),
            conversation_id: id.to_string(),
            sent_at: Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap(),
            sender: Some("u1".into()),
            text: "My deployment keeps failing on the platform".into(),
            is_private_note: false,
        };
        self.store.upsert_message(&message, &json!({})).unwrap();
    }
}

#[tokio::test]
async fn warehouse_hit_skips_later_tiers() {
    let h = Harness::new(
        StaticWarehouse::new(vec![warehouse_row("c1", "LangGraph", "Platform", "Resolved")]),
        MockProvider::default(),
    );
    h.conversation_with_transcript("c1");

    let ctx = RunContext::new();
    let summary = h.resolver().resolve_batch(&ctx, &["c1".to_string()]).await.unwrap();

    assert_eq!(summary.warehouse_found, 1);
    assert_eq!(summary.applied, 1);
    assert_eq!(h.api.get_calls(), 0);
    assert_eq!(h.provider.call_count(), 0);
    let record = h.store.get_classification("c1").unwrap().unwrap();
    assert_eq!(record.provenance, Provenance::Warehouse);
    assert_eq!(record.category.as_deref(), Some("LangGraph"));
}

#[tokio::test]
async fn warehouse_lookups_are_batched() {
    let h = Harness::new(
        StaticWarehouse::default().with_batch_size(2),
        MockProvider::default(),
    );
    let ids: Vec<String> = (1..=5).map(|i| format!("c{}", i)).collect();
    for id in &ids {
        h.conversation_with_transcript(id);
    }

    let ctx = RunContext::new();
    let summary = h.resolver().resolve_batch(&ctx, &ids).await.unwrap();
    assert_eq!(h.warehouse.batches(), vec![2, 2, 1]);
    assert_eq!(ctx.counters.snapshot().warehouse_queries, 3);
    assert_eq!(summary.ai_classified, 5);
}

#[tokio::test]
async fn ticket_fields_override_the_classifier() {
    let h = Harness::new(StaticWarehouse::default(), MockProvider::default());
    let fields = FieldIds::default();
    h.api.add_conversation(json!({
        "id": "c1",
        "ticketTypeFields": {
            fields.category.clone(): "Billing",
            fields.sub_category.clone(): "Plans",
            fields.resolution.clone(): "Resolved",
        }
    }));

    let outcome = h.resolver().resolve(&RunContext::new(), "c1").await.unwrap();
    assert!(matches!(outcome, TierOutcome::Resolved { tier: Tier::ApiOverride, .. }));
    assert_eq!(h.provider.call_count(), 0);
    let record = h.store.get_classification("c1").unwrap().unwrap();
    assert_eq!(record.provenance, Provenance::ApiOverride);
    assert_eq!(record.sub_category.as_deref(), Some("Plans"));
}

#[tokio::test]
async fn classifier_is_the_last_resort() {
    let h = Harness::new(StaticWarehouse::default(), MockProvider::default());
    h.conversation_with_transcript("c1");

    let ctx = RunContext::new();
    let outcome = h.resolver().resolve(&ctx, "c1").await.unwrap();
    let TierOutcome::Resolved { tier, value } = outcome.clone() else {
        panic!("expected a resolved outcome, got {:?}", outcome);
    };
    assert_eq!(tier, Tier::Ai);
    assert_eq!(value.category.as_deref(), Some("Other"));
    assert_eq!(value.resolution.as_deref(), Some("Resolved"));
    // One call for the category, one for the resolution.
    assert_eq!(h.provider.call_count(), 2);
    assert!(h.provider.prompts()[0].contains("My deployment keeps failing"));
    assert_eq!(ctx.counters.snapshot().override_lookups, 1);
}

#[tokio::test]
async fn invalid_reply_is_retried_once() {
    let provider = MockProvider::with_responses(vec![
        "I believe this is about billing.".to_string(),
        DEFAULT_CLASSIFICATION.to_string(),
    ]);
    let h = Harness::new(StaticWarehouse::default(), provider);
    h.conversation_with_transcript("c1");

    let ctx = RunContext::new();
    let outcome = h.resolver().resolve(&ctx, "c1").await.unwrap();
    assert!(matches!(outcome, TierOutcome::Resolved { tier: Tier::Ai, .. }));

    // Both questions needed a corrective retry.
    let counters = ctx.counters.snapshot();
    assert_eq!(counters.classifier_calls, 4);
    assert_eq!(counters.validation_failures, 2);
    assert!(h.provider.prompts()[1].contains("I believe this is about billing."));
}

#[tokio::test]
async fn two_invalid_replies_leave_the_conversation_unresolved() {
    let provider = MockProvider::new(r#"{"category": "Astrology", "sub_category": "Tarot"}"#);
    let h = Harness::new(StaticWarehouse::default(), provider);
    h.conversation_with_transcript("c1");

    let summary = h
        .resolver()
        .resolve_batch(&RunContext::new(), &["c1".to_string()])
        .await
        .unwrap();
    assert_eq!(summary.unresolved, 1);
    assert_eq!(h.provider.call_count(), 2);

    let record = h.store.get_classification("c1").unwrap().unwrap();
    assert_eq!(record.provenance, Provenance::None);
    assert!(record.category.is_none());
    assert!(!record.is_pending());
}

#[tokio::test]
async fn higher_provenance_is_kept_without_remote_calls() {
    let h = Harness::new(StaticWarehouse::default(), MockProvider::default());
    h.conversation_with_transcript("c1");
    h.store
        .record_classification(
            "c1",
            &Classification {
                category: Some("Billing".into()),
                sub_category: Some("Invoices".into()),
                resolution: Some("Resolved".into()),
                reasoning: None,
            },
            Provenance::Warehouse,
        )
        .unwrap();

    let summary = h
        .resolver()
        .resolve_batch(&RunContext::new(), &["c1".to_string()])
        .await
        .unwrap();
    assert_eq!(summary.kept, 1);
    assert_eq!(h.api.get_calls(), 0);
    assert_eq!(h.provider.call_count(), 0);
    assert_eq!(
        h.store.get_classification("c1").unwrap().unwrap().category.as_deref(),
        Some("Billing")
    );
}

#[tokio::test]
async fn warehouse_hit_without_resolution_is_tagged() {
    let row = WarehouseRow {
        resolution: None,
        ..warehouse_row("c1", "LangSmith", "Tracing", "")
    };
    let h = Harness::new(StaticWarehouse::new(vec![row]), MockProvider::default());
    h.conversation_with_transcript("c1");

    h.resolver().resolve(&RunContext::new(), "c1").await.unwrap();
    let record = h.store.get_classification("c1").unwrap().unwrap();
    assert_eq!(record.provenance, Provenance::Warehouse);
    assert_eq!(record.category.as_deref(), Some("LangSmith"));
    assert_eq!(record.resolution.as_deref(), Some("Resolved"));
    assert_eq!(h.provider.call_count(), 1);
}

#[tokio::test]
async fn excluded_and_duplicate_ids_are_skipped() {
    let h = Harness::new(StaticWarehouse::default(), MockProvider::default());
    h.conversation_with_transcript("c1");
    h.conversation_with_transcript("c2");
    h.store.exclude("c2", Some("spam")).unwrap();

    let ids = vec!["c1".to_string(), "c2".to_string(), "c1".to_string()];
    let summary = h.resolver().resolve_batch(&RunContext::new(), &ids).await.unwrap();
    assert_eq!(summary.requested, 3);
    assert_eq!(summary.excluded, 1);
    assert_eq!(summary.ai_classified, 1);
    assert_eq!(h.provider.call_count(), 2);
}

fn untagged_warehouse_row(id: &str) -> WarehouseRow {
    WarehouseRow {
        resolution: None,
        ..warehouse_row(id, "LangSmith", "Tracing", "")
    }
}

#[tokio::test]
async fn failed_tagging_is_retried_on_the_next_run() {
    let provider = MockProvider::with_responses(vec![
        "not json".to_string(),
        "not json".to_string(),
        r#"{"resolution": "Bug Filed"}"#.to_string(),
    ]);
    let h = Harness::new(StaticWarehouse::new(vec![untagged_warehouse_row("c1")]), provider);
    let payload = json!({"id": "c1"});
    h.store
        .upsert_conversation(&Conversation::from_payload(&payload).unwrap(), &payload)
        .unwrap();
    h.conversation_with_transcript("c1");

    let first = h.store.unclassified_conversation_ids(None).unwrap();
    h.resolver().resolve_batch(&RunContext::new(), &first).await.unwrap();
    let record = h.store.get_classification("c1").unwrap().unwrap();
    assert_eq!(record.provenance, Provenance::Warehouse);
    assert_eq!(record.resolution, None);
    assert!(h.store.pending_classifications().unwrap().is_empty());

    let second = h.store.unclassified_conversation_ids(None).unwrap();
    assert_eq!(second, vec!["c1".to_string()]);
    h.resolver().resolve_batch(&RunContext::new(), &second).await.unwrap();
    let record = h.store.get_classification("c1").unwrap().unwrap();
    assert_eq!(record.provenance, Provenance::Warehouse);
    assert_eq!(record.resolution.as_deref(), Some("Bug Filed"));
    assert_eq!(h.store.pending_classifications().unwrap().len(), 1);
    assert!(h.store.unclassified_conversation_ids(None).unwrap().is_empty());
}

#[tokio::test]
async fn recheck_reuses_the_stored_resolution() {
    let provider = MockProvider::with_responses(vec![
        r#"{"resolution": "Resolved"}"#.to_string(),
        r#"{"resolution": "Bug Filed"}"#.to_string(),
    ]);
    let h = Harness::new(StaticWarehouse::new(vec![untagged_warehouse_row("c1")]), provider);
    h.conversation_with_transcript("c1");
    let ids = vec!["c1".to_string()];

    h.resolver().resolve_batch(&RunContext::new(), &ids).await.unwrap();
    assert!(h.store.mark_synced("c1", Utc::now()).unwrap());

    let summary = h.resolver().resolve_batch(&RunContext::new(), &ids).await.unwrap();
    assert_eq!(summary.warehouse_found, 1);
    assert_eq!(summary.unchanged, 1);
    assert_eq!(h.provider.call_count(), 1);
    let record = h.store.get_classification("c1").unwrap().unwrap();
    assert_eq!(record.resolution.as_deref(), Some("Resolved"));
    assert!(record.updated_time.is_some());
    assert!(h.store.pending_classifications().unwrap().is_empty());
}
