//! Plan repository
//!
//! Plans are saved as immutable, numbered snapshots plus a current
//! document. Saves are optimistic: the caller's version must match the
//! stored one, so a stale orchestrator can never overwrite newer state.
//! The version check and the write run under one per-plan writer lock.

use crate::document::{DocumentStore, PLANS, PLAN_SNAPSHOTS};
use crate::error::{RepositoryError, StoreError};
use dashmap::DashMap;
use std::sync::Arc;
use stepwise_core::{Plan, PlanId, Step};
use tokio::sync::Mutex;

/// Plan persistence
#[derive(Clone)]
pub struct PlanRepository {
    store: Arc<dyn DocumentStore>,
    writers: Arc<DashMap<PlanId, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for PlanRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanRepository").finish_non_exhaustive()
    }
}

impl PlanRepository {
    /// Create repository over a store
    #[inline]
    #[must_use]
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            writers: Arc::new(DashMap::new()),
        }
    }

    fn writer(&self, plan_id: PlanId) -> Arc<Mutex<()>> {
        Arc::clone(self.writers.entry(plan_id).or_default().value())
    }

    /// Persist a new plan as version 1
    ///
    /// # Errors
    /// Returns `RepositoryError::AlreadyExists` if the id is taken
    pub async fn create(&self, plan: &mut Plan) -> Result<u64, RepositoryError> {
        let writer = self.writer(plan.plan_id);
        let _guard = writer.lock().await;
        let key = plan.plan_id.to_string();
        if self.store.get(PLANS, &key).await?.is_some() {
            return Err(RepositoryError::AlreadyExists(plan.plan_id));
        }
        plan.version = 1;
        self.write(plan).await?;
        Ok(plan.version)
    }

    /// Persist a new snapshot, bumping the version
    ///
    /// # Errors
    /// - `RepositoryError::NotFound` if the plan was never created
    /// - `RepositoryError::VersionConflict` if the stored version moved on
    pub async fn save(&self, plan: &mut Plan) -> Result<u64, RepositoryError> {
        let writer = self.writer(plan.plan_id);
        let _guard = writer.lock().await;
        let stored = self.get(plan.plan_id).await?;
        if stored.version != plan.version {
            return Err(RepositoryError::VersionConflict {
                plan_id: plan.plan_id,
                expected: plan.version,
                found: stored.version,
            });
        }
        plan.version += 1;
        if let Err(e) = self.write(plan).await {
            plan.version -= 1;
            return Err(e);
        }
        if plan.status.is_terminal() {
            self.writers.remove(&plan.plan_id);
        }
        Ok(plan.version)
    }

    async fn write(&self, plan: &Plan) -> Result<(), RepositoryError> {
        let doc = serde_json::to_value(plan).map_err(StoreError::from)?;
        let snapshot_key = format!("{}:{:010}", plan.plan_id, plan.version);
        self.store.put(PLAN_SNAPSHOTS, &snapshot_key, doc.clone()).await?;
        self.store.put(PLANS, &plan.plan_id.to_string(), doc).await?;
        tracing::debug!(plan_id = %plan.plan_id, version = plan.version, status = plan.status.as_str(), "plan persisted");
        Ok(())
    }

    /// Current plan document
    ///
    /// # Errors
    /// Returns `RepositoryError::NotFound` if absent
    pub async fn get(&self, plan_id: PlanId) -> Result<Plan, RepositoryError> {
        let doc = self
            .store
            .get(PLANS, &plan_id.to_string())
            .await?
            .ok_or(RepositoryError::NotFound(plan_id))?;
        Ok(serde_json::from_value(doc).map_err(StoreError::from)?)
    }

    /// One step of the current plan
    ///
    /// # Errors
    /// Returns `RepositoryError::StepNotFound` if the plan has no such step
    pub async fn step(&self, plan_id: PlanId, step_index: u32) -> Result<Step, RepositoryError> {
        self.get(plan_id)
            .await?
            .step(step_index)
            .cloned()
            .ok_or(RepositoryError::StepNotFound {
                plan_id,
                step_index,
            })
    }

    /// All snapshots, oldest first
    ///
    /// # Errors
    /// Returns a store error if a snapshot cannot be decoded
    pub async fn snapshots(&self, plan_id: PlanId) -> Result<Vec<Plan>, RepositoryError> {
        self.store
            .scan_prefix(PLAN_SNAPSHOTS, &format!("{plan_id}:"))
            .await?
            .into_iter()
            .map(|(_, doc)| {
                serde_json::from_value(doc).map_err(|e| RepositoryError::Store(e.into()))
            })
            .collect()
    }

    /// Snapshot at a specific version
    ///
    /// # Errors
    /// Returns `RepositoryError::NotFound` if that version was never saved
    pub async fn snapshot(&self, plan_id: PlanId, version: u64) -> Result<Plan, RepositoryError> {
        let doc = self
            .store
            .get(PLAN_SNAPSHOTS, &format!("{plan_id}:{version:010}"))
            .await?
            .ok_or(RepositoryError::NotFound(plan_id))?;
        Ok(serde_json::from_value(doc).map_err(StoreError::from)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::InMemoryDocumentStore;
    use stepwise_core::{Identity, PlanStatus};

    fn repo() -> PlanRepository {
        PlanRepository::new(Arc::new(InMemoryDocumentStore::new()))
    }

    fn plan() -> Plan {
        let mut plan = Plan::new(Identity::new("t1", "u1", "s1"), "list outlets then rank");
        plan.steps = vec![Step::new(1, "list"), Step::new(2, "rank").with_input_from(1)];
        plan
    }

    #[tokio::test]
    async fn save_bumps_version_and_keeps_snapshots() {
        let repo = repo();
        let mut plan = plan();
        assert_eq!(repo.create(&mut plan).await.unwrap(), 1);
        plan.transition(PlanStatus::Planning).unwrap();
        assert_eq!(repo.save(&mut plan).await.unwrap(), 2);

        let snaps = repo.snapshots(plan.plan_id).await.unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].status, PlanStatus::Pending);
        assert_eq!(snaps[1].status, PlanStatus::Planning);
        assert_eq!(repo.get(plan.plan_id).await.unwrap(), plan);
    }

    #[tokio::test]
    async fn stale_writer_rejected() {
        let repo = repo();
        let mut plan = plan();
        repo.create(&mut plan).await.unwrap();
        let mut stale = plan.clone();
        repo.save(&mut plan).await.unwrap();

        let err = repo.save(&mut stale).await.unwrap_err();
        assert!(matches!(
            err,
            RepositoryError::VersionConflict { expected: 1, found: 2, .. }
        ));
        assert_eq!(stale.version, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_saves_of_one_version_admit_one_writer() {
        let repo = repo();
        let mut plan = plan();
        repo.create(&mut plan).await.unwrap();

        let writers: Vec<_> = (0..8)
            .map(|_| {
                let repo = repo.clone();
                let mut copy = plan.clone();
                tokio::spawn(async move { repo.save(&mut copy).await })
            })
            .collect();
        let mut saved = 0;
        let mut conflicts = 0;
        for writer in writers {
            match writer.await.unwrap() {
                Ok(version) => {
                    assert_eq!(version, 2);
                    saved += 1;
                }
                Err(RepositoryError::VersionConflict { expected: 1, found: 2, .. }) => conflicts += 1,
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert_eq!((saved, conflicts), (1, 7));
        assert_eq!(repo.snapshots(plan.plan_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn partial_step_read() {
        let repo = repo();
        let mut plan = plan();
        repo.create(&mut plan).await.unwrap();
        let step = repo.step(plan.plan_id, 2).await.unwrap();
        assert_eq!(step.input_from_step, Some(1));
        assert!(matches!(
            repo.step(plan.plan_id, 9).await,
            Err(RepositoryError::StepNotFound { step_index: 9, .. })
        ));
    }

    #[tokio::test]
    async fn duplicate_create_rejected() {
        let repo = repo();
        let mut plan = plan();
        repo.create(&mut plan).await.unwrap();
        assert!(matches!(
            repo.create(&mut plan).await,
            Err(RepositoryError::AlreadyExists(_))
        ));
    }
}
