//! Migration-category label and the out-of-band pass that rewrites it.

use futures::stream::{self, StreamExt};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{ticket_type_fields, RetryPolicy, TicketingApi};
use crate::config::FieldIds;
use crate::context::{RunContext, RunCounters};
use crate::error::{ApiError, SyncError, SyncResult};
use crate::persistence::LocalStore;
use crate::sync::{PushSummary, Throttle, UpdateOutcome, UpdaterSettings};
use crate::types::ClassificationRecord;

/// Combine category and sub-category into one label.
///
/// Both present gives `"{category} - {sub_category}"`, one present gives
/// that value, neither gives an empty string. Blank strings count as absent.
pub fn derive_migration_category(category: Option<&str>, sub_category: Option<&str>) -> String {
    let category = category.map(str::trim).filter(|s| !s.is_empty());
    let sub_category = sub_category.map(str::trim).filter(|s| !s.is_empty());
    match (category, sub_category) {
        (Some(c), Some(s)) => format!("{} - {}", c, s),
        (Some(c), None) => c.to_string(),
        (None, Some(s)) => s.to_string(),
        (None, None) => String::new(),
    }
}

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub batch_size: usize,
    pub max: Option<usize>,
    /// Restrict the pass to these conversations.
    pub ids: Vec<String>,
    pub dry_run: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max: None,
            ids: Vec::new(),
            dry_run: false,
        }
    }
}

/// Rewrites only the migration-category field of already classified
/// conversations. Leaves `updated_time` alone.
pub struct MigrationPass {
    store: LocalStore,
    api: Arc<dyn TicketingApi>,
    retry: RetryPolicy,
    fields: FieldIds,
    settings: UpdaterSettings,
    throttle: Throttle,
}

impl MigrationPass {
    pub fn new(
        store: LocalStore,
        api: Arc<dyn TicketingApi>,
        retry: RetryPolicy,
        fields: FieldIds,
        settings: UpdaterSettings,
    ) -> Self {
        let throttle = Throttle::new(settings.min_interval);
        Self {
            store,
            api,
            retry,
            fields,
            settings,
            throttle,
        }
    }

    pub async fn run(&self, ctx: &RunContext, options: &MigrationOptions) -> SyncResult<PushSummary> {
        let mut summary = PushSummary::default();
        let batch_size = options.batch_size.max(1);

        if !options.ids.is_empty() {
            let mut records = Vec::new();
            for id in &options.ids {
                match self.store.get_classification(id).map_err(SyncError::Store)? {
                    Some(record) if record.category.is_some() => records.push(record),
                    _ => {
                        warn!(conversation_id = %id, "no stored category, skipping");
                        summary.record(id, &UpdateOutcome::Failed("no stored category".into()));
                    }
                }
            }
            if let Some(max) = options.max {
                records.truncate(max);
            }
            for batch in records.chunks(batch_size) {
                self.run_batch(ctx, batch, options.dry_run, &mut summary).await?;
            }
        } else {
            let mut offset = 0;
            loop {
                let remaining = options.max.map(|m| m.saturating_sub(offset));
                if remaining == Some(0) {
                    break;
                }
                let limit = remaining.map_or(batch_size, |r| r.min(batch_size));
                let batch = self
                    .store
                    .categorized_classifications(offset, limit)
                    .map_err(SyncError::Store)?;
                if batch.is_empty() {
                    break;
                }
                offset += batch.len();
                self.run_batch(ctx, &batch, options.dry_run, &mut summary).await?;
            }
        }

        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            dry_run = options.dry_run,
            "migration-category pass finished"
        );
        Ok(summary)
    }

    async fn run_batch(
        &self,
        ctx: &RunContext,
        batch: &[ClassificationRecord],
        dry_run: bool,
        summary: &mut PushSummary,
    ) -> SyncResult<()> {
        let mut results = stream::iter(batch)
            .map(|record| async move { (record, self.migrate_one(ctx, record, dry_run).await) })
            .buffer_unordered(self.settings.max_in_flight.max(1));
        while let Some((record, outcome)) = results.next().await {
            summary.record(&record.conversation_id, &outcome?);
        }
        Ok(())
    }

    async fn migrate_one(
        &self,
        ctx: &RunContext,
        record: &ClassificationRecord,
        dry_run: bool,
    ) -> SyncResult<UpdateOutcome> {
        let id = record.conversation_id.as_str();
        let target = derive_migration_category(record.category.as_deref(), record.sub_category.as_deref());

        let current = self
            .retry
            .run("get_conversation", || async {
                self.throttle.wait().await;
                self.api.get_conversation(id).await
            })
            .await;
        let current = match current {
            Ok(current) => current,
            Err(err) => return failure(id, err),
        };

        let mut fields = ticket_type_fields(&current);
        if fields.get(&self.fields.migration_category).and_then(|v| v.as_str()) == Some(target.as_str()) {
            debug!(conversation_id = id, "migration category already current");
            return Ok(UpdateOutcome::AlreadyCurrent);
        }
        if dry_run {
            info!(conversation_id = id, migration_category = %target, "dry run, not sending");
            return Ok(UpdateOutcome::DryRun);
        }

        fields.insert(self.fields.migration_category.clone(), json!(target));
        let patch = json!({ "ticketTypeFields": fields });
        let sent = self
            .retry
            .run("update_conversation", || async {
                self.throttle.wait().await;
                self.api.update_conversation(id, &patch).await
            })
            .await;
        match sent {
            Ok(()) => {
                RunCounters::bump(&ctx.counters.remote_updates);
                Ok(UpdateOutcome::Updated)
            }
            Err(err) => failure(id, err),
        }
    }
}

fn failure(conversation_id: &str, err: ApiError) -> SyncResult<UpdateOutcome> {
    if let ApiError::Unauthorized { .. } = err {
        return Err(SyncError::Auth { service: "unthread" });
    }
    let err = SyncError::Update {
        conversation_id: conversation_id.to_string(),
        source: err,
    };
    warn!(error = %err, "migration-category update failed");
    Ok(UpdateOutcome::Failed(err.to_string()))
}
