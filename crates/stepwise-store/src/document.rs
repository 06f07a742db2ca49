//! Narrow document store interface
//!
//! The persistent store is external; the system only needs keyed
//! put/get/delete and ordered prefix scans within a collection.

use crate::error::StoreError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;

/// Collection holding memory entries
pub const MEMORY: &str = "memory";
/// Collection holding current plan documents
pub const PLANS: &str = "plans";
/// Collection holding immutable plan snapshots
pub const PLAN_SNAPSHOTS: &str = "plan_snapshots";
/// Collection holding personas
pub const PERSONAS: &str = "personas";

/// Keyed document storage
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert or replace a document
    async fn put(&self, collection: &str, key: &str, doc: Value) -> Result<(), StoreError>;

    /// Fetch a document
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError>;

    /// Remove a document, returning whether it existed
    async fn delete(&self, collection: &str, key: &str) -> Result<bool, StoreError>;

    /// Documents whose key starts with `prefix`, in key order
    async fn scan_prefix(
        &self,
        collection: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Value)>, StoreError>;
}

/// In-process store for tests and single-node deployments
#[derive(Debug, Default)]
pub struct InMemoryDocumentStore {
    collections: DashMap<String, BTreeMap<String, Value>>,
}

impl InMemoryDocumentStore {
    /// Create empty store
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of documents in a collection
    #[must_use]
    pub fn len(&self, collection: &str) -> usize {
        self.collections.get(collection).map_or(0, |c| c.len())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn put(&self, collection: &str, key: &str, doc: Value) -> Result<(), StoreError> {
        self.collections
            .entry(collection.to_string())
            .or_default()
            .insert(key.to_string(), doc);
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self
            .collections
            .get(collection)
            .and_then(|c| c.get(key).cloned()))
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, StoreError> {
        Ok(self
            .collections
            .get_mut(collection)
            .is_some_and(|mut c| c.remove(key).is_some()))
    }

    async fn scan_prefix(
        &self,
        collection: &str,
        prefix: &str,
    ) -> Result<Vec<(String, Value)>, StoreError> {
        let Some(docs) = self.collections.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(docs
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}
