//! BigQuery `jobs.query` REST client.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;
use tracing::debug;

use super::{Warehouse, WarehouseRow};
use crate::config::WarehouseConfig;
use crate::error::ApiError;

const BIGQUERY_BASE: &str = "https://bigquery.googleapis.com/bigquery/v2";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    job_complete: bool,
    #[serde(default)]
    rows: Vec<QueryRow>,
}

#[derive(Debug, Deserialize)]
struct QueryRow {
    f: Vec<QueryCell>,
}

#[derive(Debug, Deserialize)]
struct QueryCell {
    v: JsonValue,
}

pub struct BigQueryWarehouse {
    client: reqwest::Client,
    endpoint: String,
    access_token: String,
    sql: String,
    batch_size: usize,
}

impl BigQueryWarehouse {
    pub fn new(config: &WarehouseConfig, access_token: impl Into<String>) -> Result<Self> {
        if config.project_id.trim().is_empty() {
            anyhow::bail!("warehouse.project_id must be set when the warehouse is enabled");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .build()
            .context("building BigQuery client")?;
        Ok(Self {
            client,
            endpoint: format!("{}/projects/{}/queries", BIGQUERY_BASE, config.project_id),
            access_token: access_token.into(),
            sql: lookup_sql(&config.table, &config.submitter_table),
            batch_size: config.batch_size.max(1),
        })
    }

    pub fn from_env(config: &WarehouseConfig) -> Result<Self> {
        let token = std::env::var(&config.access_token_env)
            .with_context(|| format!("{} environment variable not set", config.access_token_env))?;
        Self::new(config, token)
    }

    fn request_body(&self, ids: &[String]) -> JsonValue {
        let values: Vec<JsonValue> = ids.iter().map(|id| json!({ "value": id })).collect();
        json!({
            "query": self.sql,
            "useLegacySql": false,
            "parameterMode": "NAMED",
            "timeoutMs": 60000,
            "queryParameters": [{
                "name": "ids",
                "parameterType": { "type": "ARRAY", "arrayType": { "type": "STRING" } },
                "parameterValue": { "arrayValues": values }
            }]
        })
    }
}

/// Lookup query. Rows for the same conversation are ordered newest first so
/// the caller can keep the first one.
fn lookup_sql(table: &str, submitter_table: &str) -> String {
    let join = if submitter_table.trim().is_empty() {
        String::new()
    } else {
        format!(
            "\n  JOIN `{}` u ON u.user_id = c.submitter_user_id",
            submitter_table
        )
    };
    format!(
        r#"SELECT
  c.conversation_id,
  c.ticket_category,
  c.ticket_sub_category,
  c.ticket_resolution
FROM `{table}` c{join}
WHERE c.conversation_id IN UNNEST(@ids)
ORDER BY c.conversation_id DESC, c.updated_at DESC"#
    )
}

fn cell_string(row: &QueryRow, index: usize) -> Option<String> {
    row.f
        .get(index)
        .and_then(|cell| cell.v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "None")
        .map(str::to_string)
}

fn decode_rows(response: QueryResponse) -> Result<Vec<WarehouseRow>, ApiError> {
    if !response.job_complete {
        return Err(ApiError::Transient {
            status: None,
            message: "warehouse query did not complete in time".to_string(),
        });
    }
    response
        .rows
        .iter()
        .map(|row| {
            let conversation_id = cell_string(row, 0)
                .ok_or_else(|| ApiError::Decode("warehouse row without conversation_id".to_string()))?;
            Ok(WarehouseRow {
                conversation_id,
                category: cell_string(row, 1),
                sub_category: cell_string(row, 2),
                resolution: cell_string(row, 3),
            })
        })
        .collect()
}

#[async_trait]
impl Warehouse for BigQueryWarehouse {
    async fn lookup_batch(&self, ids: &[String]) -> Result<Vec<WarehouseRow>, ApiError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        debug!(ids = ids.len(), "querying warehouse");
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.access_token)
            .json(&self.request_body(ids))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::from_status(status.as_u16(), body));
        }
        let parsed: QueryResponse = response
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        decode_rows(parsed)
    }

    fn batch_size(&self) -> usize {
        self.batch_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_joins_submitters_and_binds_ids() {
        let sql = lookup_sql("dbt.conv", "dbt.users");
        assert!(sql.contains("FROM `dbt.conv` c"));
        assert!(sql.contains("JOIN `dbt.users` u"));
        assert!(sql.contains("IN UNNEST(@ids)"));

        let bare = lookup_sql("dbt.conv", "");
        assert!(!bare.contains("JOIN"));
    }

    #[test]
    fn rows_decode_and_none_strings_are_dropped() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobComplete": true,
            "rows": [
                {"f": [{"v": "c1"}, {"v": "LangSmith"}, {"v": "None"}, {"v": "Resolved"}]},
                {"f": [{"v": "c2"}, {"v": null}, {"v": null}, {"v": null}]}
            ]
        }))
        .unwrap();
        let rows = decode_rows(response).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].category.as_deref(), Some("LangSmith"));
        assert_eq!(rows[0].sub_category, None);
        assert!(!rows[1].is_hit());
    }

    #[test]
    fn incomplete_job_is_transient() {
        let response: QueryResponse =
            serde_json::from_value(json!({"jobComplete": false})).unwrap();
        assert!(decode_rows(response).unwrap_err().is_transient());
    }

    #[test]
    fn requires_project_id() {
        let config = WarehouseConfig::default();
        assert!(BigQueryWarehouse::new(&config, "token").is_err());
    }
}
