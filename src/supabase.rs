//! Supabase (PostgREST) backend for the category collection.

use anyhow::{anyhow, Result};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::category::{blank_root_parent, CategoryRecord, CategoryType};
use crate::category_store::CategoryStore;

/// PostgREST caps responses at 1000 rows by default.
const PAGE_SIZE: usize = 1000;
/// Upserts are chunked to keep request bodies small.
const WRITE_CHUNK: usize = 500;

/// Supabase client configuration.
#[derive(Clone)]
pub struct SupabaseCategoryStore {
    client: Client,
    base_url: String,
    service_role_key: String,
    schema: String,
}

impl SupabaseCategoryStore {
    /// Create a new store from environment variables.
    pub fn from_env() -> Result<Self> {
        let base_url =
            std::env::var("SUPABASE_URL").map_err(|_| anyhow!("SUPABASE_URL not set"))?;
        let service_role_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .map_err(|_| anyhow!("SUPABASE_SERVICE_ROLE_KEY not set"))?;
        let schema = std::env::var("SUPABASE_SCHEMA").unwrap_or_else(|_| "targeting".to_string());

        Ok(Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            service_role_key,
            schema,
        })
    }

    fn table_url(&self) -> String {
        format!("{}/rest/v1/categories", self.base_url)
    }

    /// Helper: GET from Supabase REST API.
    async fn get_rows(&self, query: &str) -> Result<Vec<CategoryRow>> {
        let url = format!("{}?{}", self.table_url(), query);
        let resp = self
            .client
            .get(&url)
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Accept-Profile", &self.schema)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Supabase GET categories failed: {} - {}", status, text));
        }

        Ok(resp.json().await?)
    }

    async fn upsert_chunk(&self, rows: &[CategoryRow]) -> Result<()> {
        let resp = self
            .client
            .post(self.table_url())
            .header("apikey", &self.service_role_key)
            .header("Authorization", format!("Bearer {}", self.service_role_key))
            .header("Content-Type", "application/json")
            .header("Content-Profile", &self.schema)
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(rows)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(anyhow!("Failed to upsert categories: {} - {}", status, text));
        }

        debug!("Upserted {} category rows", rows.len());
        Ok(())
    }
}

#[async_trait::async_trait]
impl CategoryStore for SupabaseCategoryStore {
    fn name(&self) -> &str {
        "supabase"
    }

    async fn list_all(&self) -> Result<Vec<CategoryRecord>> {
        let mut records = Vec::new();
        let mut offset = 0;

        loop {
            let page = self
                .get_rows(&format!(
                    "select=id,name,parent_id,level,size,category_type&order=id&limit={}&offset={}",
                    PAGE_SIZE, offset
                ))
                .await?;
            let fetched = page.len();
            records.extend(page.into_iter().map(CategoryRecord::from));

            if fetched < PAGE_SIZE {
                break;
            }
            offset += fetched;
        }

        info!("Fetched {} categories from Supabase", records.len());
        Ok(records)
    }

    async fn get(&self, id: &str) -> Result<Option<CategoryRecord>> {
        let rows = self.get_rows(&lookup_query(id)).await?;
        Ok(rows.into_iter().next().map(CategoryRecord::from))
    }

    async fn upsert_batch(&self, records: &[CategoryRecord]) -> Result<usize> {
        let rows: Vec<CategoryRow> = records.iter().map(CategoryRow::from).collect();
        for chunk in rows.chunks(WRITE_CHUNK) {
            self.upsert_chunk(chunk).await?;
        }
        info!("Upserted {} categories to Supabase", rows.len());
        Ok(rows.len())
    }
}

fn lookup_query(id: &str) -> String {
    format!(
        "id=eq.{}&select=id,name,parent_id,level,size,category_type&limit=1",
        urlencoding::encode(id)
    )
}

// ============================================================================
// Supabase row types
// ============================================================================

#[derive(Debug, Serialize, Deserialize)]
struct CategoryRow {
    id: String,
    #[serde(default)]
    name: Option<String>,
    parent_id: Option<String>,
    level: u32,
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    category_type: Option<CategoryType>,
}

impl From<CategoryRow> for CategoryRecord {
    fn from(row: CategoryRow) -> Self {
        Self {
            id: row.id,
            name: row.name.unwrap_or_default(),
            parent_id: blank_root_parent(row.parent_id, row.level),
            level: row.level,
            size: row.size.unwrap_or_default(),
            category_type: row.category_type,
        }
    }
}

impl From<&CategoryRecord> for CategoryRow {
    fn from(record: &CategoryRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: Some(record.name.clone()),
            parent_id: record.parent_id.clone(),
            level: record.level,
            size: Some(record.size.clone()),
            category_type: record.category_type,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_round_trip_normalizes_empty_parent() {
        let row: CategoryRow = serde_json::from_value(serde_json::json!({
            "id": "behaviors-travel",
            "name": "Travel",
            "parent_id": "",
            "level": 1,
            "size": null,
            "category_type": "behaviors"
        }))
        .unwrap();

        let record = CategoryRecord::from(row);
        assert_eq!(record.parent_id, None);
        assert_eq!(record.size, "");
        assert_eq!(record.category_type, Some(CategoryType::Behaviors));

        let back = serde_json::to_value(CategoryRow::from(&record)).unwrap();
        assert_eq!(back["parent_id"], serde_json::Value::Null);
        assert_eq!(back["category_type"], "behaviors");
    }

    #[test]
    fn test_blank_parent_below_root_is_kept() {
        let row: CategoryRow = serde_json::from_value(serde_json::json!({
            "id": "x",
            "parent_id": "",
            "level": 3
        }))
        .unwrap();
        assert_eq!(CategoryRecord::from(row).parent_id.as_deref(), Some(""));
    }

    #[test]
    fn test_point_lookup_filter_is_encoded() {
        assert_eq!(
            lookup_query("interests-food & drink"),
            "id=eq.interests-food%20%26%20drink&select=id,name,parent_id,level,size,category_type&limit=1"
        );
    }
}
