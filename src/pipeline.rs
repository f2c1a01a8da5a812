//! End-to-end orchestration: extract, resolve, push.
//!
//! Every stage reads its inputs from the local store, so a run interrupted
//! at any point picks up where it stopped: synced ids are not revisited and
//! anything not yet synced is retried.

use anyhow::Context;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::info;

use crate::api::{ApiConnector, RetryPolicy, TicketingApi, UnthreadConnector};
use crate::classify::{ClassificationResolver, ResolveSummary, ResolverSettings, Taxonomy};
use crate::config::AppConfig;
use crate::context::{CounterSnapshot, RunContext};
use crate::error::{SyncError, SyncResult};
use crate::extract::{ExtractFilter, ExtractionReport, ParallelExtractor, ParallelOptions};
use crate::llm::{create_provider, GenerationConfig, ModelProvider};
use crate::migration::{MigrationOptions, MigrationPass};
use crate::persistence::LocalStore;
use crate::sync::{BatchUpdater, PushSummary, UpdaterSettings};
use crate::types::{EntityKind, LifecycleState, Provenance};
use crate::warehouse::{BigQueryWarehouse, DisabledWarehouse, Warehouse};

/// Where the resolver's work list comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkList {
    Explicit(Vec<String>),
    /// Stored conversations with no classification or only an unresolved one.
    Unclassified { limit: Option<usize> },
    /// Every stored, non-excluded conversation.
    All { limit: Option<usize> },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub extraction: ExtractionReport,
    pub resolution: ResolveSummary,
    pub push: PushSummary,
    pub counters: CounterSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub conversations: i64,
    pub messages: i64,
    pub users: i64,
    pub customers: i64,
    pub lifecycle: BTreeMap<LifecycleState, usize>,
    pub provenance: BTreeMap<Provenance, usize>,
}

/// Collect UUID-shaped tokens from free text (e.g. an earlier run's log),
/// deduplicated, in order of first appearance.
pub fn ids_from_text(text: &str) -> anyhow::Result<Vec<String>> {
    let pattern = Regex::new(r"(?i)\b[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}\b")
        .context("compiling id pattern")?;
    let mut seen = HashSet::new();
    Ok(pattern
        .find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|id| seen.insert(id.clone()))
        .collect())
}

pub struct Pipeline {
    config: AppConfig,
    store: LocalStore,
    connector: Arc<dyn ApiConnector>,
    warehouse: Arc<dyn Warehouse>,
    provider: Option<Arc<dyn ModelProvider>>,
    retry: RetryPolicy,
}

impl Pipeline {
    pub fn new(
        config: AppConfig,
        store: LocalStore,
        connector: Arc<dyn ApiConnector>,
        warehouse: Arc<dyn Warehouse>,
        provider: Option<Arc<dyn ModelProvider>>,
    ) -> Self {
        let retry = RetryPolicy::from_config(&config.retry);
        Self {
            config,
            store,
            connector,
            warehouse,
            provider,
            retry,
        }
    }

    /// Wire up the production collaborators. The warehouse and model
    /// provider are only built when `classify` is set, so commands that
    /// never classify do not need their credentials.
    pub fn from_config(config: AppConfig, store: LocalStore, classify: bool) -> anyhow::Result<Self> {
        let connector: Arc<dyn ApiConnector> = Arc::new(UnthreadConnector::from_env(&config.api)?);
        let (warehouse, provider): (Arc<dyn Warehouse>, Option<Arc<dyn ModelProvider>>) = if classify {
            let warehouse: Arc<dyn Warehouse> = if config.warehouse.enabled {
                Arc::new(BigQueryWarehouse::from_env(&config.warehouse)?)
            } else {
                Arc::new(DisabledWarehouse)
            };
            (warehouse, Some(create_provider(&config.classifier)?))
        } else {
            (Arc::new(DisabledWarehouse), None)
        };
        Ok(Self::new(config, store, connector, warehouse, provider))
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn store(&self) -> &LocalStore {
        &self.store
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    fn api(&self) -> SyncResult<Arc<dyn TicketingApi>> {
        self.connector
            .connect()
            .map_err(|e| SyncError::Config(format!("{:#}", e)))
    }

    pub async fn extract(
        &self,
        ctx: Arc<RunContext>,
        kinds: &[EntityKind],
        filter: &ExtractFilter,
        parallel: ParallelOptions,
    ) -> SyncResult<ExtractionReport> {
        let extractor = ParallelExtractor::new(
            self.connector.clone(),
            self.store.clone(),
            self.retry.clone(),
            self.config.api.page_limit,
            parallel,
        );
        let mut report = ExtractionReport::default();
        for kind in kinds {
            report.merge(extractor.extract(ctx.clone(), *kind, filter).await?);
        }
        self.store.checkpoint().map_err(SyncError::Store)?;
        Ok(report)
    }

    pub fn work_list(&self, source: &WorkList) -> SyncResult<Vec<String>> {
        match source {
            WorkList::Explicit(ids) => Ok(ids.clone()),
            WorkList::Unclassified { limit } => self
                .store
                .unclassified_conversation_ids(*limit)
                .map_err(SyncError::Store),
            WorkList::All { limit } => self
                .store
                .active_conversation_ids(*limit)
                .map_err(SyncError::Store),
        }
    }

    pub fn resolver(&self) -> SyncResult<ClassificationResolver> {
        let provider = self
            .provider
            .clone()
            .ok_or_else(|| SyncError::Config("no classifier provider configured".to_string()))?;
        let settings = ResolverSettings {
            fields: self.config.api.fields.clone(),
            empty_override_policy: self.config.classifier.empty_override_policy,
            max_concurrency: self.config.classifier.max_concurrency,
            generation: GenerationConfig {
                temperature: Some(self.config.classifier.temperature),
                ..GenerationConfig::default()
            },
        };
        Ok(ClassificationResolver::new(
            self.store.clone(),
            self.warehouse.clone(),
            self.api()?,
            provider,
            Taxonomy::from_config(&self.config.taxonomy),
            self.retry.clone(),
            settings,
        ))
    }

    pub async fn resolve(&self, ctx: &RunContext, source: &WorkList) -> SyncResult<ResolveSummary> {
        let ids = self.work_list(source)?;
        info!(run_id = %ctx.run_id, ids = ids.len(), "resolving work list");
        let summary = self.resolver()?.resolve_batch(ctx, &ids).await?;
        self.store.checkpoint().map_err(SyncError::Store)?;
        Ok(summary)
    }

    fn updater_settings(&self, dry_run: bool) -> UpdaterSettings {
        UpdaterSettings {
            dry_run,
            ..UpdaterSettings::from_config(&self.config.updater)
        }
    }

    /// Push every pending classification.
    pub async fn push(&self, ctx: &RunContext, batch_size: Option<usize>, dry_run: bool) -> SyncResult<PushSummary> {
        let pending = self.store.pending_classifications().map_err(SyncError::Store)?;
        info!(run_id = %ctx.run_id, pending = pending.len(), dry_run, "pushing classifications");
        let updater = BatchUpdater::new(
            self.store.clone(),
            self.api()?,
            self.retry.clone(),
            self.config.api.fields.clone(),
            self.updater_settings(dry_run),
        );
        let summary = updater
            .push(ctx, &pending, batch_size.unwrap_or(self.config.updater.batch_size))
            .await?;
        self.store.checkpoint().map_err(SyncError::Store)?;
        Ok(summary)
    }

    pub async fn migrate_categories(&self, ctx: &RunContext, options: &MigrationOptions) -> SyncResult<PushSummary> {
        let pass = MigrationPass::new(
            self.store.clone(),
            self.api()?,
            self.retry.clone(),
            self.config.api.fields.clone(),
            self.updater_settings(options.dry_run),
        );
        pass.run(ctx, options).await
    }

    /// Extract conversations for `filter`, resolve the unclassified ones,
    /// then push everything pending.
    pub async fn run(
        &self,
        ctx: Arc<RunContext>,
        filter: &ExtractFilter,
        parallel: ParallelOptions,
    ) -> SyncResult<RunSummary> {
        info!(run_id = %ctx.run_id, filter = %filter.describe(), "starting run");
        let extraction = self
            .extract(ctx.clone(), &[EntityKind::Conversations], filter, parallel)
            .await?;
        let resolution = self
            .resolve(&ctx, &WorkList::Unclassified { limit: None })
            .await?;
        let push = self.push(&ctx, None, false).await?;

        Ok(RunSummary {
            run_id: ctx.run_id.clone(),
            extraction,
            resolution,
            push,
            counters: ctx.counters.snapshot(),
        })
    }

    pub fn status(&self) -> anyhow::Result<StatusReport> {
        status(&self.store)
    }
}

/// Entity counts plus lifecycle and provenance breakdowns. Needs only the store.
pub fn status(store: &LocalStore) -> anyhow::Result<StatusReport> {
    Ok(StatusReport {
        conversations: store.count(EntityKind::Conversations)?,
        messages: store.count(EntityKind::Messages)?,
        users: store.count(EntityKind::Users)?,
        customers: store.count(EntityKind::Customers)?,
        lifecycle: store.lifecycle_counts()?,
        provenance: store.provenance_counts()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrapes_ids_from_logs() {
        let log = "2024-05-01 WARN failed 1A6900F6-36d2-4380-ad06-790b0b05c4b3\n\
                   retry 1a6900f6-36d2-4380-ad06-790b0b05c4b3 and 05492140-551c-49ea-a8a2-4caeec8cda4d\n\
                   not-an-id 1234";
        let ids = ids_from_text(log).unwrap();
        assert_eq!(
            ids,
            vec![
                "1a6900f6-36d2-4380-ad06-790b0b05c4b3".to_string(),
                "05492140-551c-49ea-a8a2-4caeec8cda4d".to_string(),
            ]
        );
    }

    #[test]
    fn status_on_empty_store() {
        let store = crate::test_utils::create_test_store();
        let report = status(&store).unwrap();
        assert_eq!(report.conversations, 0);
        assert!(report.lifecycle.is_empty());
    }
}
