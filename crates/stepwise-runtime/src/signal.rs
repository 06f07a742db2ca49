//! Run signals
//!
//! - [`SignalBus`]: live fan-out of step and plan completions (the audit
//!   log stays the source of truth)
//! - [`CancellationRegistry`]: one cancellation token per tenant session,
//!   propagated into every executor and sandbox run of that session

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use stepwise_core::{PlanId, PlanStatus};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

/// Run progress signal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Signal {
    /// A step's output was written and read back
    StepCompleted {
        /// Plan
        plan_id: PlanId,
        /// Step
        step_index: u32,
        /// Where the output lives
        memory_key: String,
    },
    /// A plan reached a terminal state
    PlanFinished {
        /// Plan
        plan_id: PlanId,
        /// Terminal status
        status: PlanStatus,
    },
}

/// Realtime signal fan-out
pub trait SignalBus: Send + Sync {
    /// Publish to every live subscriber; no subscribers is not an error
    fn publish(&self, signal: Signal);

    /// Subscribe to signals published from now on
    fn subscribe(&self) -> broadcast::Receiver<Signal>;
}

/// In-process bus over a tokio broadcast channel
#[derive(Debug)]
pub struct BroadcastBus {
    tx: broadcast::Sender<Signal>,
}

impl BroadcastBus {
    /// Create bus with channel capacity
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl SignalBus for BroadcastBus {
    fn publish(&self, signal: Signal) {
        let _ = self.tx.send(signal);
    }

    fn subscribe(&self) -> broadcast::Receiver<Signal> {
        self.tx.subscribe()
    }
}

/// Session-scoped cancellation tokens
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: DashMap<(String, String), CancellationToken>,
}

impl CancellationRegistry {
    /// Create empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for a session, creating a fresh one if none is live
    ///
    /// A cancelled token is replaced, so a new run after cancellation starts clean.
    #[must_use]
    pub fn token(&self, tenant_id: &str, session_id: &str) -> CancellationToken {
        let mut entry = self
            .tokens
            .entry((tenant_id.to_string(), session_id.to_string()))
            .or_default();
        if entry.is_cancelled() {
            *entry = CancellationToken::new();
        }
        entry.clone()
    }

    /// Cancel a session's in-flight work
    ///
    /// Returns whether a live token existed.
    pub fn cancel(&self, tenant_id: &str, session_id: &str) -> bool {
        self.tokens
            .remove(&(tenant_id.to_string(), session_id.to_string()))
            .map(|(_, token)| token.cancel())
            .is_some()
    }

    /// Forget a session's token once its run finished
    pub fn finish(&self, tenant_id: &str, session_id: &str) {
        self.tokens
            .remove_if(&(tenant_id.to_string(), session_id.to_string()), |_, t| {
                !t.is_cancelled()
            });
    }

    /// Live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Whether no session is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_without_subscribers_is_fine() {
        BroadcastBus::new(4).publish(Signal::PlanFinished {
            plan_id: PlanId::new(),
            status: PlanStatus::Complete,
        });
    }

    #[tokio::test]
    async fn subscribers_see_signals() {
        let bus = BroadcastBus::default();
        let mut rx = bus.subscribe();
        let plan_id = PlanId::new();
        bus.publish(Signal::StepCompleted {
            plan_id,
            step_index: 1,
            memory_key: "t:s:x:step_1_output".into(),
        });
        assert!(matches!(rx.recv().await.unwrap(), Signal::StepCompleted { step_index: 1, .. }));
    }

    #[test]
    fn cancel_trips_the_session_token_only() {
        let registry = CancellationRegistry::new();
        let a = registry.token("t", "s1");
        let b = registry.token("t", "s2");
        assert!(registry.cancel("t", "s1"));
        assert!(a.is_cancelled());
        assert!(!b.is_cancelled());
        assert!(!registry.cancel("t", "s1"));
        assert!(!registry.token("t", "s1").is_cancelled());
    }
}
