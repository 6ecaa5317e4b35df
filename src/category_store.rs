//! Category storage abstraction.
//!
//! Defines the [`CategoryStore`] trait so the in-memory store and the Supabase
//! table can be swapped at startup. Stores are plain key-value collections
//! keyed by category id; they know nothing about the hierarchy.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};

use crate::category::CategoryRecord;

/// Async trait implemented by each storage backend.
#[async_trait::async_trait]
pub trait CategoryStore: Send + Sync {
    fn name(&self) -> &str;

    /// Full scan of the collection. No ordering guarantee.
    async fn list_all(&self) -> Result<Vec<CategoryRecord>>;

    /// Point lookup by exact id.
    async fn get(&self, id: &str) -> Result<Option<CategoryRecord>>;

    /// Write records by id, last write wins. Returns the number written.
    async fn upsert_batch(&self, records: &[CategoryRecord]) -> Result<usize>;
}

/// Known backend identifiers used for startup selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    Memory,
    Supabase,
}

impl StoreKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "supabase" => Some(Self::Supabase),
            _ => None,
        }
    }
}

/// In-memory category store.
///
/// Scans come back ordered by id so repeated hierarchy requests see the same
/// input order.
#[derive(Debug, Clone, Default)]
pub struct MemoryCategoryStore {
    inner: Arc<RwLock<BTreeMap<String, CategoryRecord>>>,
}

impl MemoryCategoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|m| m.len()).unwrap_or(0)
    }
}

#[async_trait::async_trait]
impl CategoryStore for MemoryCategoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn list_all(&self) -> Result<Vec<CategoryRecord>> {
        let store = self
            .inner
            .read()
            .map_err(|_| anyhow!("category store lock poisoned"))?;
        Ok(store.values().cloned().collect())
    }

    async fn get(&self, id: &str) -> Result<Option<CategoryRecord>> {
        let store = self
            .inner
            .read()
            .map_err(|_| anyhow!("category store lock poisoned"))?;
        Ok(store.get(id).cloned())
    }

    async fn upsert_batch(&self, records: &[CategoryRecord]) -> Result<usize> {
        let mut store = self
            .inner
            .write()
            .map_err(|_| anyhow!("category store lock poisoned"))?;
        for record in records {
            store.insert(record.id.clone(), record.clone());
        }
        tracing::debug!(
            "MemoryCategoryStore: upserted {} records ({} total)",
            records.len(),
            store.len()
        );
        Ok(records.len())
    }
}
