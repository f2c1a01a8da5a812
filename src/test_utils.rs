//! In-memory collaborators for tests.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::api::{ApiConnector, ListEndpoint, ListQuery, Page, TicketingApi};
use crate::error::ApiError;
use crate::persistence::LocalStore;
use crate::warehouse::{Warehouse, WarehouseRow};

/// Process-wide mutex for tests that mutate environment variables.
pub fn env_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

pub fn create_test_store() -> LocalStore {
    use tempfile::tempdir;
    let dir = tempdir().unwrap();
    let db_path = dir.path().join("test.duckdb");
    // Leak the temp dir to keep it alive for the test duration
    std::mem::forget(dir);
    LocalStore::new(&db_path).unwrap()
}

/// Scripted stand-in for the ticketing API.
///
/// List endpoints replay queued pages (or errors) in order and return an
/// empty page once the queue is drained. Conversations live in a map;
/// updates replace the stored `ticketTypeFields`.
#[derive(Default)]
pub struct FakeTicketingApi {
    pages: Mutex<HashMap<ListEndpoint, VecDeque<Result<Page, ApiError>>>>,
    conversations: Mutex<HashMap<String, JsonValue>>,
    get_failures: Mutex<HashMap<String, ApiError>>,
    update_failures: Mutex<HashMap<String, ApiError>>,
    updates: Mutex<Vec<(String, JsonValue)>>,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl FakeTicketingApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_page(&self, endpoint: ListEndpoint, items: Vec<JsonValue>, has_next: bool) {
        let n = self.pages.lock().unwrap().values().map(VecDeque::len).sum::<usize>();
        let page = Page {
            items,
            next_cursor: has_next.then(|| format!("cursor-{}", n + 1)),
            has_next,
        };
        self.pages
            .lock()
            .unwrap()
            .entry(endpoint)
            .or_default()
            .push_back(Ok(page));
    }

    pub fn push_list_error(&self, endpoint: ListEndpoint, err: ApiError) {
        self.pages
            .lock()
            .unwrap()
            .entry(endpoint)
            .or_default()
            .push_back(Err(err));
    }

    /// Store (or replace) a conversation payload, keyed by its `id`.
    pub fn add_conversation(&self, payload: JsonValue) {
        let id = payload["id"].as_str().unwrap_or_default().to_string();
        self.conversations.lock().unwrap().insert(id, payload);
    }

    pub fn conversation(&self, id: &str) -> Option<JsonValue> {
        self.conversations.lock().unwrap().get(id).cloned()
    }

    /// Every `get_conversation(id)` fails with `err`.
    pub fn fail_get(&self, id: &str, err: ApiError) {
        self.get_failures.lock().unwrap().insert(id.to_string(), err);
    }

    /// Every `update_conversation(id, ..)` fails with `err`.
    pub fn fail_update(&self, id: &str, err: ApiError) {
        self.update_failures.lock().unwrap().insert(id.to_string(), err);
    }

    /// Successful updates, in the order they were applied.
    pub fn updates(&self) -> Vec<(String, JsonValue)> {
        self.updates.lock().unwrap().clone()
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.update_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TicketingApi for FakeTicketingApi {
    async fn list_page(
        &self,
        endpoint: &ListEndpoint,
        _query: &ListQuery,
        _cursor: Option<&str>,
    ) -> Result<Page, ApiError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self
            .pages
            .lock()
            .unwrap()
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front);
        next.unwrap_or_else(|| Ok(Page::default()))
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<JsonValue, ApiError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.get_failures.lock().unwrap().get(conversation_id) {
            return Err(err.clone());
        }
        self.conversation(conversation_id).ok_or(ApiError::NotFound)
    }

    async fn update_conversation(
        &self,
        conversation_id: &str,
        patch: &JsonValue,
    ) -> Result<(), ApiError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.update_failures.lock().unwrap().get(conversation_id) {
            return Err(err.clone());
        }
        let mut conversations = self.conversations.lock().unwrap();
        let stored = conversations
            .get_mut(conversation_id)
            .ok_or(ApiError::NotFound)?;
        if let (Some(obj), Some(patch_obj)) = (stored.as_object_mut(), patch.as_object()) {
            for (key, value) in patch_obj {
                obj.insert(key.clone(), value.clone());
            }
        }
        self.updates
            .lock()
            .unwrap()
            .push((conversation_id.to_string(), patch.clone()));
        Ok(())
    }
}

/// Hands out the same fake API to every worker and counts connections.
pub struct FakeConnector {
    api: Arc<FakeTicketingApi>,
    connects: AtomicUsize,
}

impl FakeConnector {
    pub fn new(api: Arc<FakeTicketingApi>) -> Self {
        Self {
            api,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl ApiConnector for FakeConnector {
    fn connect(&self) -> anyhow::Result<Arc<dyn TicketingApi>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.api.clone())
    }
}

/// Warehouse backed by a fixed list of rows.
pub struct StaticWarehouse {
    rows: Vec<WarehouseRow>,
    batch_size: usize,
    batches: Mutex<Vec<usize>>,
}

impl Default for StaticWarehouse {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl StaticWarehouse {
    pub fn new(rows: Vec<WarehouseRow>) -> Self {
        Self {
            rows,
            batch_size: 100,
            batches: Mutex::new(Vec::new()),
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Size of every lookup batch received, in order.
    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }
}

#[async_trait]
impl Warehouse for StaticWarehouse {
    async fn lookup_batch(&self, ids: &[String]) -> Result<Vec<WarehouseRow>, ApiError> {
        self.batches.lock().unwrap().push(ids.len());
        Ok(self
            .rows
            .iter()
            .filter(|row| ids.contains(&row.conversation_id))
            .cloned()
            .collect())
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

/// Warehouse row with category, sub-category and resolution.
pub fn warehouse_row(id: &str, category: &str, sub_category: &str, resolution: &str) -> WarehouseRow {
    WarehouseRow {
        conversation_id: id.to_string(),
        category: Some(category.to_string()),
        sub_category: Some(sub_category.to_string()),
        resolution: Some(resolution.to_string()),
    }
}
