//! Write-back of resolved classifications to the ticketing API.
//!
//! Each record is pushed as a read-merge-write of the ticket's custom
//! fields: the current field map is fetched, the four classification fields
//! are laid over it, and the merged map is sent back. Successful writes are
//! marked synced exactly once. Per-record failures are tallied and never
//! stop the batch; auth and store failures abort the push.

pub mod throttle;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::{json, Map, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::api::{ticket_type_fields, RetryPolicy, TicketingApi};
use crate::config::{FieldIds, UpdaterConfig};
use crate::context::{RunContext, RunCounters};
use crate::error::{ApiError, SyncError, SyncResult};
use crate::migration::derive_migration_category;
use crate::persistence::LocalStore;
use crate::types::ClassificationRecord;

pub use throttle::Throttle;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PushSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failed_ids: Vec<String>,
}

impl PushSummary {
    pub fn record(&mut self, conversation_id: &str, outcome: &UpdateOutcome) {
        self.processed += 1;
        match outcome {
            UpdateOutcome::Updated => self.succeeded += 1,
            UpdateOutcome::AlreadyCurrent | UpdateOutcome::DryRun => self.skipped += 1,
            UpdateOutcome::Failed(_) => {
                self.failed += 1;
                self.failed_ids.push(conversation_id.to_string());
            }
        }
    }
}

/// Terminal bucket of one record's push.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// The remote already holds these values; marked synced without a write.
    AlreadyCurrent,
    DryRun,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct UpdaterSettings {
    pub max_in_flight: usize,
    pub min_interval: Duration,
    pub dry_run: bool,
}

impl UpdaterSettings {
    pub fn from_config(config: &UpdaterConfig) -> Self {
        Self {
            max_in_flight: config.max_in_flight.max(1),
            min_interval: Duration::from_millis(config.min_interval_ms),
            dry_run: false,
        }
    }
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self::from_config(&UpdaterConfig::default())
    }
}

/// Lay the classification fields of `record` over the remote field map.
///
/// The migration category is derived fresh from the record. A record
/// without a sub-category clears a non-null remote sub-category.
pub fn merge_fields(
    existing: &Map<String, JsonValue>,
    record: &ClassificationRecord,
    fields: &FieldIds,
) -> Map<String, JsonValue> {
    let mut merged = existing.clone();
    if let Some(category) = &record.category {
        merged.insert(fields.category.clone(), JsonValue::String(category.clone()));
    }
    match &record.sub_category {
        Some(sub_category) => {
            merged.insert(fields.sub_category.clone(), JsonValue::String(sub_category.clone()));
        }
        None => {
            if merged.get(&fields.sub_category).is_some_and(|v| !v.is_null()) {
                merged.insert(fields.sub_category.clone(), JsonValue::Null);
            }
        }
    }
    merged.insert(
        fields.migration_category.clone(),
        JsonValue::String(derive_migration_category(
            record.category.as_deref(),
            record.sub_category.as_deref(),
        )),
    );
    if let Some(resolution) = &record.resolution {
        merged.insert(fields.resolution.clone(), JsonValue::String(resolution.clone()));
    }
    merged
}

pub struct BatchUpdater {
    store: LocalStore,
    api: Arc<dyn TicketingApi>,
    retry: RetryPolicy,
    fields: FieldIds,
    settings: UpdaterSettings,
    throttle: Throttle,
}

impl BatchUpdater {
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

    /// Push records in batches of `batch_size`, at most `max_in_flight`
    /// requests at a time.
    pub async fn push(
        &self,
        ctx: &RunContext,
        records: &[ClassificationRecord],
        batch_size: usize,
    ) -> SyncResult<PushSummary> {
        let mut summary = PushSummary::default();
        let batch_size = batch_size.max(1);
        let total_batches = records.len().div_ceil(batch_size);

        for (index, batch) in records.chunks(batch_size).enumerate() {
            debug!(batch = index + 1, of = total_batches, size = batch.len(), "pushing batch");
            let mut results = stream::iter(batch)
                .map(|record| async move { (record, self.push_one(ctx, record).await) })
                .buffer_unordered(self.settings.max_in_flight.max(1));

            while let Some((record, outcome)) = results.next().await {
                let outcome = outcome?;
                summary.record(&record.conversation_id, &outcome);
            }
        }

        info!(
            processed = summary.processed,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            dry_run = self.settings.dry_run,
            "push finished"
        );
        Ok(summary)
    }

    /// Read-merge-write one record. Only auth and store failures are errors.
    pub async fn push_one(&self, ctx: &RunContext, record: &ClassificationRecord) -> SyncResult<UpdateOutcome> {
        let id = record.conversation_id.as_str();

        let current = match self
            .retry
            .run("get_conversation", || async {
                self.throttle.wait().await;
                self.api.get_conversation(id).await
            })
            .await
        {
            Ok(current) => current,
            Err(err) => return self.failure(id, err),
        };

        let existing = ticket_type_fields(&current);
        let merged = merge_fields(&existing, record, &self.fields);
        if merged == existing {
            if !self.settings.dry_run {
                self.store.mark_synced(id, Utc::now()).map_err(SyncError::Store)?;
            }
            debug!(conversation_id = id, "remote already current");
            return Ok(UpdateOutcome::AlreadyCurrent);
        }

        let patch = json!({ "ticketTypeFields": merged });
        if self.settings.dry_run {
            info!(conversation_id = id, patch = %patch, "dry run, not sending");
            return Ok(UpdateOutcome::DryRun);
        }

        let sent = self
            .retry
            .run("update_conversation", || async {
                self.throttle.wait().await;
                self.api.update_conversation(id, &patch).await
            })
            .await;
        if let Err(err) = sent {
            return self.failure(id, err);
        }
        RunCounters::bump(&ctx.counters.remote_updates);

        self.store.mark_synced(id, Utc::now()).map_err(SyncError::Store)?;
        debug!(
            conversation_id = id,
            category = ?record.category,
            provenance = %record.provenance,
            "classification pushed"
        );
        Ok(UpdateOutcome::Updated)
    }

    fn failure(&self, conversation_id: &str, err: ApiError) -> SyncResult<UpdateOutcome> {
        if let ApiError::Unauthorized { .. } = err {
            return Err(SyncError::Auth { service: "unthread" });
        }
        let err = SyncError::Update {
            conversation_id: conversation_id.to_string(),
            source: err,
        };
        warn!(error = %err, "update failed");
        Ok(UpdateOutcome::Failed(err.to_string()))
    }
}
