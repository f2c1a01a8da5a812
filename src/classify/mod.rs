//! Three-tier classification resolver.
//!
//! For each conversation the resolver tries, in order: the analytics
//! warehouse (batched), the ticket's own custom fields on the API, and the
//! generative classifier. The first tier with an answer wins and its
//! provenance is recorded with the result. The store arbitrates overwrites
//! by provenance rank, so re-resolving is idempotent.

pub mod prompt;
pub mod taxonomy;
pub mod transcript;

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::api::{ticket_type_fields, RetryPolicy, TicketingApi};
use crate::config::{EmptyOverridePolicy, FieldIds};
use crate::context::{RunContext, RunCounters};
use crate::error::{ApiError, SyncError, SyncResult};
use crate::llm::{extract_json_object, GenerationConfig, ModelProvider};
use crate::persistence::{LocalStore, RecordOutcome};
use crate::types::{Classification, Provenance};
use crate::warehouse::{latest_per_id, Warehouse};

pub use taxonomy::Taxonomy;

/// Source tier of a resolved classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Warehouse,
    ApiOverride,
    Ai,
}

impl Tier {
    pub fn provenance(&self) -> Provenance {
        match self {
            Tier::Warehouse => Provenance::Warehouse,
            Tier::ApiOverride => Provenance::ApiOverride,
            Tier::Ai => Provenance::Ai,
        }
    }
}

/// Result of running the fallback chain for one conversation.
#[derive(Debug, Clone, PartialEq)]
pub enum TierOutcome {
    Resolved { tier: Tier, value: Classification },
    /// Every tier came up empty or the classifier never produced a valid answer.
    Unresolved { reason: String },
    /// A stored classification outranks every tier that could still answer.
    Kept { existing: Provenance },
    /// A remote call failed; nothing was recorded and the id stays in the work list.
    Failed { reason: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolveSummary {
    pub requested: usize,
    pub warehouse_found: usize,
    pub api_override_found: usize,
    pub ai_classified: usize,
    pub unresolved: usize,
    pub kept: usize,
    pub excluded: usize,
    pub failed: usize,
    /// Records written.
    pub applied: usize,
    /// Same tier returned the same answer.
    pub unchanged: usize,
    /// A higher-provenance record already existed.
    pub superseded: usize,
    pub failed_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub fields: FieldIds,
    pub empty_override_policy: EmptyOverridePolicy,
    pub max_concurrency: usize,
    pub generation: GenerationConfig,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            fields: FieldIds::default(),
            empty_override_policy: EmptyOverridePolicy::Absent,
            max_concurrency: 4,
            generation: GenerationConfig::default(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CategoryReply {
    category: Option<String>,
    #[serde(alias = "subcategory", alias = "sub-category", alias = "subCategory")]
    sub_category: Option<String>,
    reasoning: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResolutionReply {
    resolution: Option<String>,
}

/// What the model produced for one question after validation.
enum ModelAnswer<T> {
    Valid(T),
    Invalid(String),
    Failed(String),
}

pub struct ClassificationResolver {
    store: LocalStore,
    warehouse: Arc<dyn Warehouse>,
    api: Arc<dyn TicketingApi>,
    provider: Arc<dyn ModelProvider>,
    taxonomy: Arc<Taxonomy>,
    retry: RetryPolicy,
    settings: ResolverSettings,
}

impl ClassificationResolver {
    pub fn new(
        store: LocalStore,
        warehouse: Arc<dyn Warehouse>,
        api: Arc<dyn TicketingApi>,
        provider: Arc<dyn ModelProvider>,
        taxonomy: Taxonomy,
        retry: RetryPolicy,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            store,
            warehouse,
            api,
            provider,
            taxonomy: Arc::new(taxonomy),
            retry,
            settings,
        }
    }

    /// Resolve and record a single conversation.
    pub async fn resolve(&self, ctx: &RunContext, conversation_id: &str) -> SyncResult<TierOutcome> {
        let ids = [conversation_id.to_string()];
        let mut hits = self.warehouse_tier(ctx, &ids).await?;
        let outcome = self
            .resolve_after_warehouse(ctx, conversation_id, hits.remove(conversation_id))
            .await?;
        let mut summary = ResolveSummary::default();
        self.settle(conversation_id, &outcome, &mut summary)?;
        Ok(outcome)
    }

    /// Resolve a work list. Warehouse lookups are batched; the remaining
    /// tiers run per id with bounded concurrency.
    pub async fn resolve_batch(&self, ctx: &RunContext, ids: &[String]) -> SyncResult<ResolveSummary> {
        let mut summary = ResolveSummary {
            requested: ids.len(),
            ..ResolveSummary::default()
        };
        let excluded = self.store.excluded_ids().map_err(SyncError::Store)?;
        let mut seen = HashSet::new();
        let work: Vec<String> = ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .filter(|id| {
                let skip = excluded.contains(id.as_str());
                if skip {
                    debug!(conversation_id = %id, "skipping excluded conversation");
                }
                !skip
            })
            .cloned()
            .collect();
        summary.excluded = excluded.iter().filter(|id| seen.contains(id.as_str())).count();

        for chunk in work.chunks(self.warehouse.batch_size().max(1)) {
            let mut hits = self.warehouse_tier(ctx, chunk).await?;
            let pending: Vec<(String, Option<Classification>)> = chunk
                .iter()
                .map(|id| (id.clone(), hits.remove(id)))
                .collect();

            let mut outcomes = stream::iter(pending)
                .map(|(id, hit)| async move {
                    let outcome = self.resolve_after_warehouse(ctx, &id, hit).await;
                    (id, outcome)
                })
                .buffer_unordered(self.settings.max_concurrency.max(1));

            while let Some((id, outcome)) = outcomes.next().await {
                let outcome = outcome?;
                self.settle(&id, &outcome, &mut summary)?;
            }
        }

        info!(
            requested = summary.requested,
            warehouse = summary.warehouse_found,
            api_override = summary.api_override_found,
            ai = summary.ai_classified,
            unresolved = summary.unresolved,
            failed = summary.failed,
            "resolution finished"
        );
        Ok(summary)
    }

    /// Tier 1 for one bounded batch. Lookup failures other than auth fall
    /// through to the next tier.
    async fn warehouse_tier(
        &self,
        ctx: &RunContext,
        ids: &[String],
    ) -> SyncResult<HashMap<String, Classification>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        RunCounters::bump(&ctx.counters.warehouse_queries);
        let rows = match self
            .retry
            .run("warehouse lookup", || self.warehouse.lookup_batch(ids))
            .await
        {
            Ok(rows) => rows,
            Err(ApiError::Unauthorized { .. }) => return Err(SyncError::Auth { service: "warehouse" }),
            Err(err) => {
                warn!(ids = ids.len(), error = %err, "warehouse lookup failed, falling through");
                return Ok(HashMap::new());
            }
        };
        Ok(latest_per_id(rows)
            .into_iter()
            .map(|(id, row)| (id, row.into_classification()))
            .collect())
    }

    async fn resolve_after_warehouse(
        &self,
        ctx: &RunContext,
        conversation_id: &str,
        warehouse_hit: Option<Classification>,
    ) -> SyncResult<TierOutcome> {
        if let Some(mut value) = warehouse_hit {
            self.complete_resolution(ctx, conversation_id, Tier::Warehouse, &mut value).await?;
            return Ok(TierOutcome::Resolved {
                tier: Tier::Warehouse,
                value,
            });
        }

        let existing = self
            .store
            .get_classification(conversation_id)
            .map_err(SyncError::Store)?
            .map(|record| record.provenance)
            .unwrap_or(Provenance::None);
        if existing > Provenance::ApiOverride {
            return Ok(TierOutcome::Kept { existing });
        }

        let override_value = match self.override_tier(ctx, conversation_id).await? {
            Ok(value) => value,
            Err(reason) => return Ok(TierOutcome::Failed { reason }),
        };
        let known_resolution = match override_value {
            Some(value) if value.category.is_some() => {
                let mut value = value;
                self.complete_resolution(ctx, conversation_id, Tier::ApiOverride, &mut value).await?;
                return Ok(TierOutcome::Resolved {
                    tier: Tier::ApiOverride,
                    value,
                });
            }
            Some(value) => value.resolution,
            None => None,
        };

        if existing > Provenance::Ai {
            return Ok(TierOutcome::Kept { existing });
        }
        self.ai_tier(ctx, conversation_id, known_resolution).await
    }

    /// Tier 2: read the ticket's custom fields. The outer result carries
    /// fatal errors, the inner one a per-id failure.
    async fn override_tier(
        &self,
        ctx: &RunContext,
        conversation_id: &str,
    ) -> SyncResult<Result<Option<Classification>, String>> {
        RunCounters::bump(&ctx.counters.override_lookups);
        let payload = match self
            .retry
            .run("get_conversation", || self.api.get_conversation(conversation_id))
            .await
        {
            Ok(payload) => payload,
            Err(ApiError::Unauthorized { .. }) => return Err(SyncError::Auth { service: "unthread" }),
            Err(ApiError::NotFound) => {
                debug!(conversation_id, "conversation not found remotely, skipping override lookup");
                return Ok(Ok(None));
            }
            Err(err) => {
                warn!(conversation_id, error = %err, "override lookup failed");
                return Ok(Err(err.to_string()));
            }
        };
        Ok(Ok(self.read_override(&payload)))
    }

    fn read_override(&self, payload: &JsonValue) -> Option<Classification> {
        let fields = ticket_type_fields(payload);
        let read = |field_id: &str| -> Option<String> {
            let raw = fields.get(field_id)?.as_str()?.trim();
            if raw == "None" {
                return None;
            }
            if raw.is_empty() {
                return match self.settings.empty_override_policy {
                    EmptyOverridePolicy::Absent => None,
                    EmptyOverridePolicy::Present => Some(String::new()),
                };
            }
            Some(raw.to_string())
        };

        let category = read(&self.settings.fields.category);
        let resolution = read(&self.settings.fields.resolution);
        if category.is_none() && resolution.is_none() {
            return None;
        }
        Some(Classification {
            sub_category: category.as_ref().and(read(&self.settings.fields.sub_category)),
            category,
            resolution,
            reasoning: Some("ticket custom fields".to_string()),
        })
    }

    /// Tier 3: classify the transcript, then tag its resolution unless one is
    /// already known.
    async fn ai_tier(
        &self,
        ctx: &RunContext,
        conversation_id: &str,
        known_resolution: Option<String>,
    ) -> SyncResult<TierOutcome> {
        let messages = self
            .store
            .list_messages(conversation_id)
            .map_err(SyncError::Store)?;
        let transcript = transcript::assemble(&messages);
        if transcript.is_empty() {
            return Ok(TierOutcome::Unresolved {
                reason: "no message text to classify".to_string(),
            });
        }

        let category_prompt = prompt::category_prompt(&self.taxonomy, &transcript);
        let taxonomy = self.taxonomy.clone();
        let answer = self
            .ask(ctx, conversation_id, &category_prompt, |content| {
                let reply: CategoryReply = parse_reply(content)?;
                let category = reply.category.ok_or("reply has no category")?;
                let (category, sub_category) =
                    taxonomy.canonical_pair(&category, reply.sub_category.as_deref())?;
                Ok((category, sub_category, reply.reasoning))
            })
            .await;
        let (category, sub_category, reasoning) = match answer {
            ModelAnswer::Valid(v) => v,
            ModelAnswer::Invalid(reason) => return Ok(TierOutcome::Unresolved { reason }),
            ModelAnswer::Failed(reason) => return Ok(TierOutcome::Failed { reason }),
        };

        let resolution = match known_resolution {
            Some(resolution) => resolution,
            None => match self.tag_resolution(ctx, conversation_id, &transcript).await {
                ModelAnswer::Valid(r) => r,
                ModelAnswer::Invalid(reason) => return Ok(TierOutcome::Unresolved { reason }),
                ModelAnswer::Failed(reason) => return Ok(TierOutcome::Failed { reason }),
            },
        };

        Ok(TierOutcome::Resolved {
            tier: Tier::Ai,
            value: Classification {
                category: Some(category),
                sub_category,
                resolution: Some(resolution),
                reasoning,
            },
        })
    }

    async fn tag_resolution(
        &self,
        ctx: &RunContext,
        conversation_id: &str,
        transcript: &str,
    ) -> ModelAnswer<String> {
        let resolution_prompt = prompt::resolution_prompt(&self.taxonomy, transcript);
        let taxonomy = self.taxonomy.clone();
        self.ask(ctx, conversation_id, &resolution_prompt, |content| {
            let reply: ResolutionReply = parse_reply(content)?;
            let resolution = reply.resolution.ok_or("reply has no resolution")?;
            taxonomy.canonical_resolution(&resolution)
        })
        .await
    }

    /// Fill a missing resolution on a tier 1/2 hit. A resolution already
    /// stored at the hit's tier or above is reused; otherwise the resolution
    /// tagger runs. The hit keeps its tier; a tagging failure leaves the
    /// resolution empty and the id stays in the work list.
    async fn complete_resolution(
        &self,
        ctx: &RunContext,
        conversation_id: &str,
        tier: Tier,
        value: &mut Classification,
    ) -> SyncResult<()> {
        if value.resolution.is_some() {
            return Ok(());
        }
        let stored = self
            .store
            .get_classification(conversation_id)
            .map_err(SyncError::Store)?;
        if let Some(stored) = stored {
            if stored.provenance >= tier.provenance() && stored.resolution.is_some() {
                value.resolution = stored.resolution;
                return Ok(());
            }
        }
        let messages = self
            .store
            .list_messages(conversation_id)
            .map_err(SyncError::Store)?;
        let transcript = transcript::assemble(&messages);
        if transcript.is_empty() {
            return Ok(());
        }
        match self.tag_resolution(ctx, conversation_id, &transcript).await {
            ModelAnswer::Valid(resolution) => value.resolution = Some(resolution),
            ModelAnswer::Invalid(reason) | ModelAnswer::Failed(reason) => {
                warn!(conversation_id, reason = %reason, "could not tag resolution");
            }
        }
        Ok(())
    }

    /// Ask the model, validate the reply, and re-ask once with a corrective
    /// instruction if it is invalid.
    async fn ask<T, V>(&self, ctx: &RunContext, conversation_id: &str, prompt_text: &str, validate: V) -> ModelAnswer<T>
    where
        V: Fn(&str) -> Result<T, String>,
    {
        let mut current = prompt_text.to_string();
        for attempt in 1..=2 {
            RunCounters::bump(&ctx.counters.classifier_calls);
            let response = match self.provider.generate(&current, &self.settings.generation).await {
                Ok(response) => response,
                Err(err) => {
                    warn!(conversation_id, error = %err, "classifier call failed");
                    return ModelAnswer::Failed(format!("{:#}", err));
                }
            };
            match validate(&response.content) {
                Ok(value) => return ModelAnswer::Valid(value),
                Err(problem) => {
                    RunCounters::bump(&ctx.counters.validation_failures);
                    if attempt == 2 {
                        let err = SyncError::Validation {
                            conversation_id: conversation_id.to_string(),
                            detail: problem.clone(),
                        };
                        warn!(error = %err, "classifier output rejected twice");
                        return ModelAnswer::Invalid(problem);
                    }
                    debug!(conversation_id, problem = %problem, "retrying with corrective prompt");
                    current = prompt::corrective(prompt_text, &response.content, &problem);
                }
            }
        }
        ModelAnswer::Invalid("classifier gave no valid answer".to_string())
    }

    /// Record an outcome and tally it.
    fn settle(&self, conversation_id: &str, outcome: &TierOutcome, summary: &mut ResolveSummary) -> SyncResult<()> {
        let (value, provenance) = match outcome {
            TierOutcome::Resolved { tier, value } => {
                match tier {
                    Tier::Warehouse => summary.warehouse_found += 1,
                    Tier::ApiOverride => summary.api_override_found += 1,
                    Tier::Ai => summary.ai_classified += 1,
                }
                (value.clone(), tier.provenance())
            }
            TierOutcome::Unresolved { reason } => {
                summary.unresolved += 1;
                let value = Classification {
                    reasoning: Some(reason.clone()),
                    ..Classification::default()
                };
                (value, Provenance::None)
            }
            TierOutcome::Kept { existing } => {
                debug!(conversation_id, existing = %existing, "kept higher-provenance classification");
                summary.kept += 1;
                return Ok(());
            }
            TierOutcome::Failed { reason } => {
                warn!(conversation_id, reason = %reason, "resolution failed, will retry next run");
                summary.failed += 1;
                summary.failed_ids.push(conversation_id.to_string());
                return Ok(());
            }
        };

        let recorded = self
            .store
            .record_classification(conversation_id, &value, provenance)
            .map_err(SyncError::Store)?;
        match recorded {
            RecordOutcome::Applied => summary.applied += 1,
            RecordOutcome::Unchanged => summary.unchanged += 1,
            RecordOutcome::Superseded { .. } => summary.superseded += 1,
        }
        debug!(
            conversation_id,
            provenance = %provenance,
            category = ?value.category,
            outcome = ?recorded,
            "classification settled"
        );
        Ok(())
    }
}

fn parse_reply<T: serde::de::DeserializeOwned>(content: &str) -> Result<T, String> {
    let json = extract_json_object(content).ok_or("reply is not a JSON object")?;
    serde_json::from_str(json).map_err(|e| format!("reply is not valid JSON: {}", e))
}
