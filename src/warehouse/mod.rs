//! Read-only analytics warehouse lookups (tier 1 of the resolver).

pub mod bigquery;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::ApiError;
use crate::types::Classification;

pub use bigquery::BigQueryWarehouse;

/// One warehouse row for a conversation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WarehouseRow {
    pub conversation_id: String,
    pub category: Option<String>,
    pub sub_category: Option<String>,
    pub resolution: Option<String>,
}

impl WarehouseRow {
    /// A row only counts as a hit when it carries a category.
    pub fn is_hit(&self) -> bool {
        self.category.as_deref().is_some_and(|c| !c.trim().is_empty())
    }

    pub fn into_classification(self) -> Classification {
        Classification {
            category: self.category,
            sub_category: self.sub_category,
            resolution: self.resolution,
            reasoning: Some("analytics warehouse".to_string()),
        }
    }
}

#[async_trait]
pub trait Warehouse: Send + Sync {
    /// Look up one bounded batch of ids. Rows come back ordered so that the
    /// first row for an id is the most recent one.
    async fn lookup_batch(&self, ids: &[String]) -> Result<Vec<WarehouseRow>, ApiError>;

    /// Largest id list accepted by [`lookup_batch`](Self::lookup_batch).
    fn batch_size(&self) -> usize;
}

/// Keep the first (most recent) row per id, then drop ids whose latest row
/// has no category.
pub fn latest_per_id(rows: Vec<WarehouseRow>) -> HashMap<String, WarehouseRow> {
    let mut out = HashMap::with_capacity(rows.len());
    for row in rows {
        out.entry(row.conversation_id.clone()).or_insert(row);
    }
    out.retain(|_, row| row.is_hit());
    out
}

/// Warehouse that never has data, used when tier 1 is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledWarehouse;

#[async_trait]
impl Warehouse for DisabledWarehouse {
    async fn lookup_batch(&self, _ids: &[String]) -> Result<Vec<WarehouseRow>, ApiError> {
        Ok(Vec::new())
    }

    fn batch_size(&self) -> usize {
        100
    }
}
