//! Audit events
//!
//! Every lifecycle transition and every boundary crossing (skill call,
//! extraction, memory write) produces an [`Event`] carrying its tenant,
//! session, plan and task lineage. Sinks decide where events go; the store
//! crate provides a hash-chained log.

use crate::types::{Identity, PlanId, TaskId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use ulid::Ulid;

/// Event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// A run request arrived
    #[serde(rename = "run.received")]
    RunReceived,
    /// Plan status changed
    #[serde(rename = "plan.transition")]
    PlanTransition,
    /// Step executor started
    #[serde(rename = "step.started")]
    StepStarted,
    /// Skill call finished
    #[serde(rename = "skill.called")]
    SkillCalled,
    /// Response crossed the content-length threshold
    #[serde(rename = "large_response.detected")]
    LargeResponseDetected,
    /// Sandbox ran an extraction procedure
    #[serde(rename = "extraction.executed")]
    ExtractionExecuted,
    /// Gateway stored a validated value
    #[serde(rename = "memory.written")]
    MemoryWritten,
    /// Output failed its contract
    #[serde(rename = "contract_violation")]
    ContractViolation,
    /// Step asked to be split
    #[serde(rename = "step.insufficient")]
    StepInsufficient,
    /// Step executor finished
    #[serde(rename = "step.finished")]
    StepFinished,
    /// Replan controller invoked the planner
    #[serde(rename = "replan.triggered")]
    ReplanTriggered,
}

impl EventKind {
    /// Dotted event name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunReceived => "run.received",
            Self::PlanTransition => "plan.transition",
            Self::StepStarted => "step.started",
            Self::SkillCalled => "skill.called",
            Self::LargeResponseDetected => "large_response.detected",
            Self::ExtractionExecuted => "extraction.executed",
            Self::MemoryWritten => "memory.written",
            Self::ContractViolation => "contract_violation",
            Self::StepInsufficient => "step.insufficient",
            Self::StepFinished => "step.finished",
            Self::ReplanTriggered => "replan.triggered",
        }
    }
}

/// Where an event came from
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lineage {
    /// Tenant
    pub tenant_id: String,
    /// Session
    pub session_id: String,
    /// Plan, once created
    #[serde(default)]
    pub plan_id: Option<PlanId>,
    /// Step execution identity
    #[serde(default)]
    pub task_id: Option<TaskId>,
    /// Step position
    #[serde(default)]
    pub step_index: Option<u32>,
}

impl Lineage {
    /// Lineage for a caller
    #[must_use]
    pub fn new(identity: &Identity) -> Self {
        Self {
            tenant_id: identity.tenant_id.clone(),
            session_id: identity.session_id.clone(),
            ..Self::default()
        }
    }

    /// With plan
    #[inline]
    #[must_use]
    pub fn with_plan(mut self, plan_id: PlanId) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    /// With step execution
    #[inline]
    #[must_use]
    pub fn with_step(mut self, step_index: u32, task_id: Option<TaskId>) -> Self {
        self.step_index = Some(step_index);
        self.task_id = task_id;
        self
    }
}

/// One audit event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Identifier
    pub event_id: Ulid,
    /// Type
    pub kind: EventKind,
    /// Origin
    pub lineage: Lineage,
    /// Type-specific fields
    pub payload: Value,
    /// Emission time
    pub timestamp: DateTime<Utc>,
    /// Hex hash of the previous event in the log (set by the log)
    #[serde(default)]
    pub prev_hash: String,
    /// Hex hash of this event (set by the log)
    #[serde(default)]
    pub hash: String,
}

impl Event {
    /// Create an unchained event
    #[must_use]
    pub fn new(kind: EventKind, lineage: Lineage, payload: Value) -> Self {
        Self {
            event_id: Ulid::new(),
            kind,
            lineage,
            payload,
            timestamp: Utc::now(),
            prev_hash: String::new(),
            hash: String::new(),
        }
    }
}

/// Destination for audit events
pub trait EventSink: Send + Sync {
    /// Record an event; sinks must not fail the caller
    fn record(&self, event: Event);
}

impl<T: EventSink + ?Sized> EventSink for Arc<T> {
    fn record(&self, event: Event) {
        (**self).record(event);
    }
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl EventSink for NullSink {
    fn record(&self, _event: Event) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn kind_serializes_dotted() {
        assert_eq!(
            serde_json::to_value(EventKind::LargeResponseDetected).unwrap(),
            json!("large_response.detected")
        );
        assert_eq!(EventKind::StepFinished.as_str(), "step.finished");
    }

    #[test]
    fn lineage_builder() {
        let id = Identity::new("t", "u", "s");
        let plan = PlanId::new();
        let lineage = Lineage::new(&id).with_plan(plan).with_step(2, None);
        assert_eq!(lineage.tenant_id, "t");
        assert_eq!(lineage.plan_id, Some(plan));
        assert_eq!(lineage.step_index, Some(2));
    }
}
