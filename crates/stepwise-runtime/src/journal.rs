//! Plan journal
//!
//! Couples plan persistence with audit: every status change is saved as a
//! new snapshot and announced as one `plan.transition` event.

use crate::error::RunError;
use serde_json::{json, Value};
use std::sync::Arc;
use stepwise_core::{Event, EventKind, EventSink, Lineage, Plan, PlanStatus};
use stepwise_store::PlanRepository;

/// Persisting, event-emitting view over the plan repository
#[derive(Clone)]
pub struct PlanJournal {
    repo: PlanRepository,
    events: Arc<dyn EventSink>,
}

impl std::fmt::Debug for PlanJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlanJournal")
            .field("repo", &self.repo)
            .finish_non_exhaustive()
    }
}

impl PlanJournal {
    /// Create journal
    #[must_use]
    pub fn new(repo: PlanRepository, events: Arc<dyn EventSink>) -> Self {
        Self { repo, events }
    }

    /// Underlying repository
    #[inline]
    #[must_use]
    pub fn repository(&self) -> &PlanRepository {
        &self.repo
    }

    /// Persist a new plan
    ///
    /// # Errors
    /// Repository errors
    pub async fn create(&self, plan: &mut Plan) -> Result<(), RunError> {
        self.repo.create(plan).await?;
        tracing::info!(plan_id = %plan.plan_id, "plan created");
        Ok(())
    }

    /// Persist step-level changes
    ///
    /// # Errors
    /// Repository errors, including version conflicts
    pub async fn save(&self, plan: &mut Plan) -> Result<(), RunError> {
        self.repo.save(plan).await?;
        Ok(())
    }

    /// Change status, persist, and emit the transition
    ///
    /// # Errors
    /// - `RunError::Lifecycle` for disallowed moves (nothing persisted)
    /// - repository errors
    pub async fn transition(
        &self,
        plan: &mut Plan,
        to: PlanStatus,
        reason: &str,
    ) -> Result<(), RunError> {
        let from = plan.transition(to)?;
        self.repo.save(plan).await?;
        tracing::info!(
            plan_id = %plan.plan_id,
            from = from.as_str(),
            to = to.as_str(),
            reason,
            "plan transition"
        );
        self.emit(
            plan,
            EventKind::PlanTransition,
            json!({
                "from": from.as_str(),
                "to": to.as_str(),
                "reason": reason,
                "version": plan.version,
            }),
        );
        Ok(())
    }

    /// Emit a plan-scoped event
    pub fn emit(&self, plan: &Plan, kind: EventKind, payload: Value) {
        self.emit_with(Lineage::new(&plan.identity).with_plan(plan.plan_id), kind, payload);
    }

    /// Emit an event with explicit lineage
    pub fn emit_with(&self, lineage: Lineage, kind: EventKind, payload: Value) {
        self.events.record(Event::new(kind, lineage, payload));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::Identity;
    use stepwise_store::{EventLog, InMemoryDocumentStore};

    fn journal() -> (PlanJournal, Arc<EventLog>) {
        let log = Arc::new(EventLog::new());
        let repo = PlanRepository::new(Arc::new(InMemoryDocumentStore::new()));
        (PlanJournal::new(repo, log.clone()), log)
    }

    #[tokio::test]
    async fn transition_persists_and_emits() {
        let (journal, log) = journal();
        let mut plan = Plan::new(Identity::new("t", "u", "s"), "task");
        journal.create(&mut plan).await.unwrap();
        journal
            .transition(&mut plan, PlanStatus::Planning, "run accepted")
            .await
            .unwrap();

        let stored = journal.repository().get(plan.plan_id).await.unwrap();
        assert_eq!(stored.status, PlanStatus::Planning);
        assert_eq!(stored.version, 2);

        let events = log.for_plan(plan.plan_id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::PlanTransition);
        assert_eq!(events[0].payload["from"], "pending");
        assert_eq!(events[0].payload["to"], "planning");
    }

    #[tokio::test]
    async fn illegal_transition_is_not_persisted() {
        let (journal, log) = journal();
        let mut plan = Plan::new(Identity::new("t", "u", "s"), "task");
        journal.create(&mut plan).await.unwrap();
        let err = journal
            .transition(&mut plan, PlanStatus::Complete, "skip")
            .await
            .unwrap_err();
        assert!(matches!(err, RunError::Lifecycle(_)));
        assert_eq!(journal.repository().get(plan.plan_id).await.unwrap().version, 1);
        assert!(log.is_empty());
    }
}
