//! Paginated extraction from the ticketing API into the local store.
//!
//! [`PaginatedExtractor::fetch`] yields raw records lazily, following cursors
//! until an empty page or the end-of-cursor signal. [`PaginatedExtractor::extract`]
//! consumes that stream and upserts each record as it arrives.
//! [`ParallelExtractor`] splits a filter into disjoint chunks and runs one
//! extractor per chunk, each with its own API connection.

pub mod partition;

use chrono::{Duration as ChronoDuration, NaiveDate};
use futures::stream::{Stream, StreamExt};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{AcquireError, Semaphore};
use tracing::{debug, error, info, warn};

use crate::api::{ApiConnector, ListEndpoint, ListQuery, Page, RetryPolicy, TicketingApi, WhereClause};
use crate::context::{RunContext, RunCounters};
use crate::error::{ApiError, SyncError, SyncResult};
use crate::persistence::LocalStore;
use crate::types::{Conversation, EntityKind, Message};

pub use partition::partition;

pub type RecordStream<'a> = Pin<Box<dyn Stream<Item = SyncResult<JsonValue>> + Send + 'a>>;

/// Which slice of a collection to fetch. Dates are inclusive days in UTC.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractFilter {
    pub ids: Vec<String>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

impl ExtractFilter {
    pub fn by_id(id: impl Into<String>) -> Self {
        Self {
            ids: vec![id.into()],
            ..Self::default()
        }
    }

    pub fn date_range(start_date: Option<NaiveDate>, end_date: Option<NaiveDate>) -> Self {
        Self {
            ids: Vec::new(),
            start_date,
            end_date,
        }
    }

    /// Short human label used in logs and failure reports.
    pub fn describe(&self) -> String {
        if !self.ids.is_empty() {
            if self.ids.len() == 1 {
                return format!("id {}", self.ids[0]);
            }
            return format!("{} ids starting {}", self.ids.len(), self.ids[0]);
        }
        match (self.start_date, self.end_date) {
            (Some(s), Some(e)) => format!("{} to {}", s, e),
            (Some(s), None) => format!("from {}", s),
            (None, Some(e)) => format!("until {}", e),
            (None, None) => "everything".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParallelOptions {
    pub enabled: bool,
    pub max_workers: usize,
    /// Ids per chunk, or days per date window.
    pub batch_size: usize,
}

impl Default for ParallelOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            max_workers: 4,
            batch_size: 7,
        }
    }
}

/// A chunk whose extraction gave up. Re-running with `filter` resumes it.
#[derive(Debug, Clone, Serialize)]
pub struct ChunkFailure {
    pub filter: ExtractFilter,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExtractionReport {
    /// Records seen on list pages.
    pub fetched: usize,
    /// Primary entities written to the store.
    pub stored: usize,
    pub messages_stored: usize,
    pub rejected: usize,
    /// Conversations whose detail or messages could not be fetched.
    pub failed_ids: Vec<String>,
    pub chunk_failures: Vec<ChunkFailure>,
}

impl ExtractionReport {
    pub fn merge(&mut self, other: ExtractionReport) {
        self.fetched += other.fetched;
        self.stored += other.stored;
        self.messages_stored += other.messages_stored;
        self.rejected += other.rejected;
        self.failed_ids.extend(other.failed_ids);
        self.chunk_failures.extend(other.chunk_failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failed_ids.is_empty() && self.chunk_failures.is_empty()
    }
}

pub struct PaginatedExtractor {
    api: Arc<dyn TicketingApi>,
    store: LocalStore,
    retry: RetryPolicy,
    page_limit: usize,
}

impl PaginatedExtractor {
    pub fn new(api: Arc<dyn TicketingApi>, store: LocalStore, retry: RetryPolicy, page_limit: usize) -> Self {
        Self {
            api,
            store,
            retry,
            page_limit,
        }
    }

    /// One list request per slice of the filter.
    fn requests_for(&self, kind: EntityKind, filter: &ExtractFilter) -> Vec<(ListEndpoint, ListQuery)> {
        let base = ListQuery {
            limit: Some(self.page_limit),
            ..ListQuery::default()
        };
        match kind {
            EntityKind::Users => vec![(ListEndpoint::Users, base)],
            EntityKind::Customers => vec![(ListEndpoint::Customers, base)],
            EntityKind::Messages => filter
                .ids
                .iter()
                .map(|id| {
                    (
                        ListEndpoint::Messages {
                            conversation_id: id.clone(),
                        },
                        base.clone(),
                    )
                })
                .collect(),
            EntityKind::Conversations => {
                let ordered = ListQuery {
                    order: vec!["createdAt".to_string(), "id".to_string()],
                    descending: Some(true),
                    ..base
                };
                if !filter.ids.is_empty() {
                    return filter
                        .ids
                        .iter()
                        .map(|id| {
                            let mut query = ordered.clone();
                            query.filters.push(WhereClause::new("id", "==", id.as_str()));
                            (ListEndpoint::Conversations, query)
                        })
                        .collect();
                }
                let mut query = ordered;
                if let Some(start) = filter.start_date {
                    query
                        .filters
                        .push(WhereClause::new("createdAt", ">=", start.format("%Y-%m-%d").to_string()));
                }
                if let Some(end) = filter.end_date {
                    // Inclusive end day: everything before the following midnight.
                    let next = end + ChronoDuration::days(1);
                    query
                        .filters
                        .push(WhereClause::new("createdAt", "<", next.format("%Y-%m-%d").to_string()));
                }
                vec![(ListEndpoint::Conversations, query)]
            }
        }
    }

    async fn fetch_page(
        &self,
        ctx: &RunContext,
        endpoint: &ListEndpoint,
        query: &ListQuery,
        cursor: Option<&str>,
    ) -> SyncResult<Page> {
        let label = endpoint.path();
        let page = self
            .retry
            .run(&label, || self.api.list_page(endpoint, query, cursor))
            .await
            .map_err(|source| match source {
                ApiError::Unauthorized { .. } => SyncError::Auth { service: "unthread" },
                source => SyncError::Extraction {
                    scope: label.clone(),
                    source,
                },
            })?;
        RunCounters::bump(&ctx.counters.pages_fetched);
        debug!(
            endpoint = %label,
            items = page.items.len(),
            has_next = page.has_next,
            "fetched page"
        );
        Ok(page)
    }

    /// Lazily yield raw records of `kind` matching `filter`.
    ///
    /// The stream ends after the last page or on the first error.
    pub fn fetch<'a>(&'a self, ctx: &'a RunContext, kind: EntityKind, filter: &ExtractFilter) -> RecordStream<'a> {
        let requests = self.requests_for(kind, filter);
        Box::pin(async_stream::try_stream! {
            for (endpoint, query) in requests {
                let mut cursor: Option<String> = None;
                loop {
                    let page = self.fetch_page(ctx, &endpoint, &query, cursor.as_deref()).await?;
                    let last = page.is_last();
                    let next = page.next_cursor;
                    for item in page.items {
                        yield item;
                    }
                    if last {
                        break;
                    }
                    if next.is_some() && next == cursor {
                        warn!(endpoint = %endpoint.path(), "server repeated a cursor, stopping");
                        break;
                    }
                    cursor = next;
                }
            }
        })
    }

    /// Fetch `kind` matching `filter` and upsert every record into the store.
    ///
    /// Paging failures end the chunk and land in `chunk_failures`; per
    /// conversation failures land in `failed_ids`. Store and auth failures
    /// abort with an error.
    pub async fn extract(
        &self,
        ctx: &RunContext,
        kind: EntityKind,
        filter: &ExtractFilter,
    ) -> SyncResult<ExtractionReport> {
        let mut report = ExtractionReport::default();
        let mut stream = self.fetch(ctx, kind, filter);

        while let Some(item) = stream.next().await {
            let item = match item {
                Ok(item) => item,
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => {
                    error!(kind = kind.as_str(), filter = %filter.describe(), error = %err, "extraction chunk failed");
                    report.chunk_failures.push(ChunkFailure {
                        filter: filter.clone(),
                        error: err.to_string(),
                    });
                    break;
                }
            };
            report.fetched += 1;

            match kind {
                EntityKind::Users | EntityKind::Customers => {
                    let Some(id) = item.get("id").and_then(JsonValue::as_str).filter(|s| !s.is_empty()) else {
                        warn!(kind = kind.as_str(), "rejected record without id");
                        RunCounters::bump(&ctx.counters.records_rejected);
                        report.rejected += 1;
                        continue;
                    };
                    self.store.upsert_raw(kind, id, &item).map_err(SyncError::Store)?;
                    RunCounters::bump(&ctx.counters.records_stored);
                    report.stored += 1;
                }
                EntityKind::Conversations => {
                    let Some(id) = item.get("id").and_then(JsonValue::as_str).filter(|s| !s.is_empty()) else {
                        warn!("rejected conversation summary without id");
                        RunCounters::bump(&ctx.counters.records_rejected);
                        report.rejected += 1;
                        continue;
                    };
                    let id = id.to_string();
                    match self.refresh_conversation(ctx, &id, &mut report).await {
                        Ok(()) => {}
                        Err(err) if err.is_fatal() => return Err(err),
                        Err(err) => {
                            warn!(conversation_id = %id, error = %err, "conversation extraction failed");
                            report.failed_ids.push(id);
                        }
                    }
                }
                EntityKind::Messages => {
                    let parent = filter.ids.first().map(String::as_str).unwrap_or_default();
                    self.store_message(ctx, &item, parent, &mut report)?;
                }
            }
        }

        info!(
            kind = kind.as_str(),
            filter = %filter.describe(),
            fetched = report.fetched,
            stored = report.stored,
            messages = report.messages_stored,
            rejected = report.rejected,
            failed = report.failed_ids.len(),
            "extraction finished"
        );
        Ok(report)
    }

    /// Re-read one conversation by id, store it, then stream its messages.
    async fn refresh_conversation(
        &self,
        ctx: &RunContext,
        conversation_id: &str,
        report: &mut ExtractionReport,
    ) -> SyncResult<()> {
        let payload = self
            .retry
            .run("get_conversation", || self.api.get_conversation(conversation_id))
            .await
            .map_err(|source| match source {
                ApiError::Unauthorized { .. } => SyncError::Auth { service: "unthread" },
                source => SyncError::Extraction {
                    scope: format!("conversation {}", conversation_id),
                    source,
                },
            })?;

        let conversation = match Conversation::from_payload(&payload) {
            Ok(conversation) => conversation,
            Err(err) => {
                warn!(conversation_id, error = %err, "rejected conversation payload");
                RunCounters::bump(&ctx.counters.records_rejected);
                report.rejected += 1;
                return Ok(());
            }
        };
        self.store
            .upsert_conversation(&conversation, &payload)
            .map_err(SyncError::Store)?;
        RunCounters::bump(&ctx.counters.records_stored);
        report.stored += 1;

        let filter = ExtractFilter::by_id(conversation.id.as_str());
        let mut messages = self.fetch(ctx, EntityKind::Messages, &filter);
        while let Some(item) = messages.next().await {
            let item = item?;
            self.store_message(ctx, &item, &conversation.id, report)?;
        }
        Ok(())
    }

    fn store_message(
        &self,
        ctx: &RunContext,
        payload: &JsonValue,
        conversation_id: &str,
        report: &mut ExtractionReport,
    ) -> SyncResult<()> {
        match Message::from_payload(payload, conversation_id) {
            Ok(message) => {
                self.store
                    .upsert_message(&message, payload)
                    .map_err(SyncError::Store)?;
                RunCounters::bump(&ctx.counters.records_stored);
                report.messages_stored += 1;
            }
            Err(err) => {
                warn!(conversation_id, error = %err, "rejected message payload");
                RunCounters::bump(&ctx.counters.records_rejected);
                report.rejected += 1;
            }
        }
        Ok(())
    }
}

/// Runs one [`PaginatedExtractor`] per chunk on a bounded pool of tasks.
pub struct ParallelExtractor {
    connector: Arc<dyn ApiConnector>,
    store: LocalStore,
    retry: RetryPolicy,
    page_limit: usize,
    options: ParallelOptions,
}

impl ParallelExtractor {
    pub fn new(
        connector: Arc<dyn ApiConnector>,
        store: LocalStore,
        retry: RetryPolicy,
        page_limit: usize,
        options: ParallelOptions,
    ) -> Self {
        Self {
            connector,
            store,
            retry,
            page_limit,
            options,
        }
    }

    fn extractor(&self) -> anyhow::Result<PaginatedExtractor> {
        Ok(PaginatedExtractor::new(
            self.connector.connect()?,
            self.store.clone(),
            self.retry.clone(),
            self.page_limit,
        ))
    }

    /// Extract `kind`, splitting the filter into chunks when parallel mode is on.
    ///
    /// Every spawned chunk is awaited before returning, even when one of them
    /// hits a fatal error; the first fatal error is then returned.
    pub async fn extract(
        &self,
        ctx: Arc<RunContext>,
        kind: EntityKind,
        filter: &ExtractFilter,
    ) -> SyncResult<ExtractionReport> {
        let parallel = self.options.enabled && kind == EntityKind::Conversations;
        let chunks = if parallel {
            partition(filter, self.options.batch_size, chrono::Utc::now().date_naive())
        } else {
            vec![filter.clone()]
        };

        if chunks.len() <= 1 {
            return match self.extractor() {
                Ok(extractor) => extractor.extract(&ctx, kind, filter).await,
                Err(err) => Ok(ExtractionReport {
                    chunk_failures: vec![ChunkFailure {
                        filter: filter.clone(),
                        error: format!("could not open API connection: {:#}", err),
                    }],
                    ..ExtractionReport::default()
                }),
            };
        }

        info!(
            kind = kind.as_str(),
            chunks = chunks.len(),
            max_workers = self.options.max_workers,
            "starting parallel extraction"
        );

        let semaphore = Arc::new(Semaphore::new(self.options.max_workers.max(1)));
        let mut handles = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(worker_pool_closed)?;
            let connector = self.connector.clone();
            let store = self.store.clone();
            let retry = self.retry.clone();
            let page_limit = self.page_limit;
            let ctx = ctx.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                let api = match connector.connect() {
                    Ok(api) => api,
                    Err(err) => {
                        return Ok(ExtractionReport {
                            chunk_failures: vec![ChunkFailure {
                                filter: chunk,
                                error: format!("could not open API connection: {:#}", err),
                            }],
                            ..ExtractionReport::default()
                        })
                    }
                };
                let extractor = PaginatedExtractor::new(api, store, retry, page_limit);
                extractor.extract(&ctx, kind, &chunk).await
            });
            handles.push(handle);
        }

        let mut report = ExtractionReport::default();
        let mut fatal: Option<SyncError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(chunk_report)) => report.merge(chunk_report),
                Ok(Err(err)) => {
                    error!(error = %err, "extraction worker aborted");
                    fatal.get_or_insert(err);
                }
                Err(join_err) => {
                    error!(error = %join_err, "extraction worker panicked");
                    report.chunk_failures.push(ChunkFailure {
                        filter: filter.clone(),
                        error: join_err.to_string(),
                    });
                }
            }
        }

        match fatal {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }
}

fn worker_pool_closed(err: AcquireError) -> SyncError {
    SyncError::Config(format!("extraction worker pool closed: {}", err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{create_test_store, FakeTicketingApi};
    use serde_json::json;

    #[tokio::test]
    async fn closed_worker_pool_is_a_config_error() {
        let semaphore = Arc::new(Semaphore::new(1));
        semaphore.close();
        let err = semaphore.acquire_owned().await.map_err(worker_pool_closed).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
        assert!(err.is_fatal());
    }

    fn extractor(api: Arc<FakeTicketingApi>) -> PaginatedExtractor {
        PaginatedExtractor::new(api, create_test_store(), RetryPolicy::none(), 2)
    }

    #[test]
    fn conversation_requests_carry_filters() {
        let ex = extractor(Arc::new(FakeTicketingApi::new()));
        let filter = ExtractFilter::date_range(
            NaiveDate::from_ymd_opt(2024, 1, 1),
            NaiveDate::from_ymd_opt(2024, 1, 31),
        );
        let requests = ex.requests_for(EntityKind::Conversations, &filter);
        assert_eq!(requests.len(), 1);
        let (_, query) = &requests[0];
        assert_eq!(query.descending, Some(true));
        assert_eq!(query.filters[0], WhereClause::new("createdAt", ">=", "2024-01-01"));
        assert_eq!(query.filters[1], WhereClause::new("createdAt", "<", "2024-02-01"));

        let by_ids = ExtractFilter {
            ids: vec!["a".into(), "b".into()],
            ..ExtractFilter::default()
        };
        assert_eq!(ex.requests_for(EntityKind::Conversations, &by_ids).len(), 2);
    }

    #[tokio::test]
    async fn fetch_follows_cursors_until_last_page() {
        let api = Arc::new(FakeTicketingApi::new());
        api.push_page(
            ListEndpoint::Users,
            vec![json!({"id": "u1"}), json!({"id": "u2"})],
            true,
        );
        api.push_page(ListEndpoint::Users, vec![json!({"id": "u3"})], false);
        let ex = extractor(api.clone());
        let ctx = RunContext::new();

        let items: Vec<_> = ex
            .fetch(&ctx, EntityKind::Users, &ExtractFilter::default())
            .collect()
            .await;
        assert_eq!(items.len(), 3);
        assert_eq!(api.list_calls(), 2);
        assert_eq!(ctx.counters.snapshot().pages_fetched, 2);
    }

    #[tokio::test]
    async fn users_without_id_are_rejected() {
        let api = Arc::new(FakeTicketingApi::new());
        api.push_page(
            ListEndpoint::Users,
            vec![json!({"id": "u1"}), json!({"name": "nobody"})],
            false,
        );
        let ex = extractor(api);
        let report = ex
            .extract(&RunContext::new(), EntityKind::Users, &ExtractFilter::default())
            .await
            .unwrap();
        assert_eq!(report.stored, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(ex.store.count(EntityKind::Users).unwrap(), 1);
    }

    #[tokio::test]
    async fn conversations_are_refreshed_with_messages() {
        let api = Arc::new(FakeTicketingApi::new());
        api.add_conversation(json!({"id": "c1", "status": "open", "title": "Help"}));
        api.push_page(ListEndpoint::Conversations, vec![json!({"id": "c1"})], false);
        api.push_page(
            ListEndpoint::Messages {
                conversation_id: "c1".into(),
            },
            vec![
                json!({"id": "m1", "timestamp": "2024-01-01T00:00:00Z", "text": "hi"}),
                json!({"id": "m2", "text": "no timestamp"}),
            ],
            false,
        );
        let ex = extractor(api);
        let report = ex
            .extract(&RunContext::new(), EntityKind::Conversations, &ExtractFilter::default())
            .await
            .unwrap();
        assert_eq!(report.stored, 1);
        assert_eq!(report.messages_stored, 1);
        assert_eq!(report.rejected, 1);
        assert!(report.is_clean());
        assert_eq!(ex.store.list_messages("c1").unwrap().len(), 1);
    }

    #[tokio::test]
    async fn paging_failure_is_scoped_to_the_chunk() {
        let api = Arc::new(FakeTicketingApi::new());
        api.push_page(ListEndpoint::Users, vec![json!({"id": "u1"})], true);
        api.push_list_error(ListEndpoint::Users, ApiError::from_status(503, "down"));
        let ex = extractor(api);
        let report = ex
            .extract(&RunContext::new(), EntityKind::Users, &ExtractFilter::default())
            .await
            .unwrap();
        assert_eq!(report.stored, 1);
        assert_eq!(report.chunk_failures.len(), 1);
    }

    #[tokio::test]
    async fn unauthorized_aborts() {
        let api = Arc::new(FakeTicketingApi::new());
        api.push_list_error(ListEndpoint::Users, ApiError::Unauthorized { status: 401 });
        let ex = extractor(api);
        let err = ex
            .extract(&RunContext::new(), EntityKind::Users, &ExtractFilter::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Auth { .. }));
    }
}
