//! Tenant personas and policies
//!
//! Stored under `tenant:user`, or `tenant:*` for the tenant-wide default.
//! Lookups for a user fall back to the tenant default.

use crate::document::{DocumentStore, PERSONAS};
use crate::error::StoreError;
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use stepwise_core::Persona;

/// Persona persistence
#[derive(Clone)]
pub struct PersonaStore {
    store: Arc<dyn DocumentStore>,
}

impl std::fmt::Debug for PersonaStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersonaStore").finish_non_exhaustive()
    }
}

impl PersonaStore {
    /// Create store
    #[inline]
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Insert or replace a persona
    ///
    /// # Errors
    /// Returns a store error on backend failure
    pub async fn upsert(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
        persona: Value,
        policies: Value,
    ) -> Result<Persona, StoreError> {
        let record = Persona {
            tenant_id: tenant_id.to_string(),
            user_id: user_id.map(str::to_string),
            persona,
            policies,
            updated_at: Utc::now(),
        };
        self.store
            .put(
                PERSONAS,
                &Persona::key(tenant_id, user_id),
                serde_json::to_value(&record)?,
            )
            .await?;
        tracing::info!(tenant_id, user_id = ?user_id, "persona updated");
        Ok(record)
    }

    /// Persona for a user, falling back to the tenant default
    ///
    /// # Errors
    /// Returns a store error on backend failure
    pub async fn get(
        &self,
        tenant_id: &str,
        user_id: Option<&str>,
    ) -> Result<Option<Persona>, StoreError> {
        if user_id.is_some() {
            if let Some(doc) = self.store.get(PERSONAS, &Persona::key(tenant_id, user_id)).await? {
                return Ok(Some(serde_json::from_value(doc)?));
            }
        }
        self.store
            .get(PERSONAS, &Persona::key(tenant_id, None))
            .await?
            .map(serde_json::from_value)
            .transpose()
            .map_err(StoreError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::InMemoryDocumentStore;
    use serde_json::json;

    #[tokio::test]
    async fn user_falls_back_to_tenant_default() {
        let store = PersonaStore::new(Arc::new(InMemoryDocumentStore::new()));
        store
            .upsert("t1", None, json!({"tone": "formal"}), json!({}))
            .await
            .unwrap();
        store
            .upsert("t1", Some("u9"), json!({"tone": "casual"}), json!({}))
            .await
            .unwrap();

        let default = store.get("t1", Some("u1")).await.unwrap().unwrap();
        assert_eq!(default.persona, json!({"tone": "formal"}));
        let own = store.get("t1", Some("u9")).await.unwrap().unwrap();
        assert_eq!(own.persona, json!({"tone": "casual"}));
        assert!(store.get("t2", None).await.unwrap().is_none());
    }
}
