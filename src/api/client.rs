//! reqwest client for the Unthread REST API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{ApiConnector, ListEndpoint, ListQuery, Page, TicketingApi};
use crate::config::ApiConfig;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListEnvelope {
    data: Vec<JsonValue>,
    #[serde(default)]
    cursors: Option<CursorEnvelope>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct CursorEnvelope {
    next: Option<String>,
    #[serde(default)]
    has_next: bool,
}

/// Client for one API connection. Cheap to clone; clones share the pool.
#[derive(Clone)]
pub struct UnthreadClient {
    base_url: String,
    client: reqwest::Client,
}

impl UnthreadClient {
    pub fn new(base_url: impl Into<String>, api_key: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut key = HeaderValue::from_str(api_key).context("API key is not a valid header value")?;
        key.set_sensitive(true);
        headers.insert("X-Api-Key", key);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::from_status(status.as_u16(), body))
    }
}

#[async_trait]
impl TicketingApi for UnthreadClient {
    async fn list_page(
        &self,
        endpoint: &ListEndpoint,
        query: &ListQuery,
        cursor: Option<&str>,
    ) -> Result<Page, ApiError> {
        let mut body = serde_json::to_value(query).map_err(|e| ApiError::Decode(e.to_string()))?;
        if let (Some(cursor), Some(obj)) = (cursor, body.as_object_mut()) {
            obj.insert("cursor".to_string(), JsonValue::String(cursor.to_string()));
        }

        let url = self.url(&endpoint.path());
        debug!(url = %url, cursor = ?cursor, "listing page");
        let response = self.client.post(&url).json(&body).send().await?;
        let response = Self::check(response).await?;
        let envelope: ListEnvelope = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(format!("{} list envelope: {}", endpoint.kind().as_str(), e)))?;
        let cursors = envelope.cursors.unwrap_or_default();

        Ok(Page {
            items: envelope.data,
            next_cursor: cursors.next,
            has_next: cursors.has_next,
        })
    }

    async fn get_conversation(&self, conversation_id: &str) -> Result<JsonValue, ApiError> {
        let url = self.url(&format!("/conversations/{}", conversation_id));
        let response = self.client.get(&url).send().await?;
        let response = Self::check(response).await?;
        let value: JsonValue = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        if !value.is_object() {
            return Err(ApiError::Decode(format!(
                "conversation {} is not a JSON object",
                conversation_id
            )));
        }
        Ok(value)
    }

    async fn update_conversation(
        &self,
        conversation_id: &str,
        patch: &JsonValue,
    ) -> Result<(), ApiError> {
        let url = self.url(&format!("/conversations/{}", conversation_id));
        let response = self.client.patch(&url).json(patch).send().await?;
        Self::check(response).await?;
        Ok(())
    }
}

/// Builds a fresh [`UnthreadClient`] (and connection pool) per call.
#[derive(Clone)]
pub struct UnthreadConnector {
    config: ApiConfig,
    api_key: String,
}

impl UnthreadConnector {
    pub fn new(config: ApiConfig, api_key: impl Into<String>) -> Self {
        Self {
            config,
            api_key: api_key.into(),
        }
    }

    /// Read the API key from the environment variable named in the config.
    pub fn from_env(config: &ApiConfig) -> Result<Self> {
        let api_key = std::env::var(&config.api_key_env)
            .with_context(|| format!("{} environment variable not set", config.api_key_env))?;
        Ok(Self::new(config.clone(), api_key))
    }

    pub fn client(&self) -> Result<UnthreadClient> {
        UnthreadClient::new(
            self.config.base_url.clone(),
            &self.api_key,
            Duration::from_secs(self.config.timeout_secs),
        )
    }
}

impl ApiConnector for UnthreadConnector {
    fn connect(&self) -> Result<Arc<dyn TicketingApi>> {
        Ok(Arc::new(self.client()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn list_envelope_requires_data() {
        let missing: Result<ListEnvelope, _> = serde_json::from_value(json!({"cursors": {}}));
        assert!(missing.is_err());

        let ok: ListEnvelope = serde_json::from_value(json!({
            "data": [{"id": "1"}],
            "cursors": {"next": "abc", "hasNext": true}
        }))
        .unwrap();
        let cursors = ok.cursors.unwrap();
        assert_eq!(cursors.next.as_deref(), Some("abc"));
        assert!(cursors.has_next);
    }

    #[test]
    fn base_url_is_normalized() {
        let client =
            UnthreadClient::new("https://api.example.test/api/", "key", Duration::from_secs(1))
                .unwrap();
        assert_eq!(
            client.url("/conversations/x"),
            "https://api.example.test/api/conversations/x"
        );
    }
}
