//! Remote ticketing API surface.
//!
//! [`TicketingApi`] is the seam every pipeline component talks to; the
//! production implementation is [`UnthreadClient`], tests use
//! `test_utils::FakeTicketingApi`.

pub mod client;
pub mod retry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::error::ApiError;
use crate::types::EntityKind;

pub use client::{UnthreadClient, UnthreadConnector};
pub use retry::RetryPolicy;

/// A paged list endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ListEndpoint {
    Users,
    Customers,
    Conversations,
    Messages { conversation_id: String },
}

impl ListEndpoint {
    pub fn path(&self) -> String {
        match self {
            ListEndpoint::Users => "/users/list".to_string(),
            ListEndpoint::Customers => "/customers/list".to_string(),
            ListEndpoint::Conversations => "/conversations/list".to_string(),
            ListEndpoint::Messages { conversation_id } => {
                format!("/conversations/{}/messages/list", conversation_id)
            }
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            ListEndpoint::Users => EntityKind::Users,
            ListEndpoint::Customers => EntityKind::Customers,
            ListEndpoint::Conversations => EntityKind::Conversations,
            ListEndpoint::Messages { .. } => EntityKind::Messages,
        }
    }
}

/// One `where` clause of a list request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhereClause {
    pub field: String,
    pub operator: String,
    pub value: JsonValue,
}

impl WhereClause {
    pub fn new(field: &str, operator: &str, value: impl Into<JsonValue>) -> Self {
        Self {
            field: field.to_string(),
            operator: operator.to_string(),
            value: value.into(),
        }
    }
}

/// Body of a list request, minus the cursor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ListQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub order: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub descending: Option<bool>,
    #[serde(rename = "where", skip_serializing_if = "Vec::is_empty", default)]
    pub filters: Vec<WhereClause>,
}

/// One page of a list response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    pub items: Vec<JsonValue>,
    pub next_cursor: Option<String>,
    pub has_next: bool,
}

impl Page {
    /// Whether the server signalled there is nothing after this page.
    pub fn is_last(&self) -> bool {
        self.items.is_empty() || !self.has_next || self.next_cursor.is_none()
    }
}

#[async_trait]
pub trait TicketingApi: Send + Sync {
    /// Fetch one page of a list endpoint.
    async fn list_page(
        &self,
        endpoint: &ListEndpoint,
        query: &ListQuery,
        cursor: Option<&str>,
    ) -> Result<Page, ApiError>;

    /// Fetch the current state of one conversation.
    async fn get_conversation(&self, conversation_id: &str) -> Result<JsonValue, ApiError>;

    /// Partial update of one conversation.
    async fn update_conversation(
        &self,
        conversation_id: &str,
        patch: &JsonValue,
    ) -> Result<(), ApiError>;
}

/// Produces independent API connections, one per extraction worker.
pub trait ApiConnector: Send + Sync {
    fn connect(&self) -> anyhow::Result<Arc<dyn TicketingApi>>;
}

/// Read the `ticketTypeFields` map off a conversation payload.
pub fn ticket_type_fields(conversation: &JsonValue) -> serde_json::Map<String, JsonValue> {
    conversation
        .get("ticketTypeFields")
        .and_then(JsonValue::as_object)
        .cloned()
        .unwrap_or_default()
}
