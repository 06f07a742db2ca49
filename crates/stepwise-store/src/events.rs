//! Hash-chained audit log
//!
//! Each appended event records the SHA-256 of its predecessor, so any
//! edit or deletion inside the trace is detectable with
//! [`EventLog::verify_integrity`].

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use stepwise_core::{Event, EventSink, PlanId};

/// Chain verification failed
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event log integrity violation at position {position}")]
pub struct IntegrityViolation {
    /// First bad event
    pub position: usize,
}

/// In-process audit log
#[derive(Debug, Default)]
pub struct EventLog {
    inner: Mutex<Vec<Event>>,
}

impl EventLog {
    /// Create empty log
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Chain and store an event
    pub fn append(&self, mut event: Event) -> Event {
        let mut guard = self.inner.lock();
        event.prev_hash = guard.last().map(|e| e.hash.clone()).unwrap_or_default();
        event.hash = compute_hash(&event);
        tracing::debug!(
            event = event.kind.as_str(),
            tenant = %event.lineage.tenant_id,
            session = %event.lineage.session_id,
            plan = ?event.lineage.plan_id,
            step = ?event.lineage.step_index,
            "audit event"
        );
        guard.push(event.clone());
        event
    }

    /// All events in order
    #[must_use]
    pub fn events(&self) -> Vec<Event> {
        self.inner.lock().clone()
    }

    /// Events of one session, in order
    #[must_use]
    pub fn for_session(&self, tenant_id: &str, session_id: &str) -> Vec<Event> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.lineage.tenant_id == tenant_id && e.lineage.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Events of one plan, in order
    #[must_use]
    pub fn for_plan(&self, plan_id: PlanId) -> Vec<Event> {
        self.inner
            .lock()
            .iter()
            .filter(|e| e.lineage.plan_id == Some(plan_id))
            .cloned()
            .collect()
    }

    /// Number of events
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Whether the log is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Recompute the chain
    ///
    /// # Errors
    /// Returns the position of the first event whose link or hash does not match
    pub fn verify_integrity(&self) -> Result<(), IntegrityViolation> {
        let guard = self.inner.lock();
        let mut prev = String::new();
        for (position, e) in guard.iter().enumerate() {
            if e.prev_hash != prev || e.hash != compute_hash(e) {
                return Err(IntegrityViolation { position });
            }
            prev.clone_from(&e.hash);
        }
        Ok(())
    }

    #[cfg(test)]
    fn tamper(&self, position: usize, f: impl FnOnce(&mut Event)) {
        if let Some(e) = self.inner.lock().get_mut(position) {
            f(e);
        }
    }
}

impl EventSink for EventLog {
    fn record(&self, event: Event) {
        self.append(event);
    }
}

fn compute_hash(event: &Event) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.event_id.to_string().as_bytes());
    hasher.update(event.kind.as_str().as_bytes());
    hasher.update([0]);
    hasher.update(serde_json::to_vec(&event.lineage).unwrap_or_default());
    hasher.update([0]);
    hasher.update(serde_json::to_vec(&event.payload).unwrap_or_default());
    hasher.update([0]);
    hasher.update(event.timestamp.to_rfc3339().as_bytes());
    hasher.update(event.prev_hash.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stepwise_core::{EventKind, Identity, Lineage};

    fn event(session: &str) -> Event {
        Event::new(
            EventKind::StepStarted,
            Lineage::new(&Identity::new("t1", "u1", session)),
            json!({"step_index": 1}),
        )
    }

    #[test]
    fn chain_links_events() {
        let log = EventLog::new();
        let first = log.append(event("s1"));
        let second = log.append(event("s1"));
        assert!(first.prev_hash.is_empty());
        assert_eq!(second.prev_hash, first.hash);
        assert!(log.verify_integrity().is_ok());
    }

    #[test]
    fn tampering_detected() {
        let log = EventLog::new();
        log.append(event("s1"));
        log.append(event("s1"));
        log.tamper(0, |e| e.payload = json!({"step_index": 9}));
        assert_eq!(log.verify_integrity(), Err(IntegrityViolation { position: 0 }));
    }

    #[test]
    fn session_trace_filters() {
        let log = EventLog::new();
        log.record(event("s1"));
        log.record(event("s2"));
        log.record(event("s1"));
        assert_eq!(log.for_session("t1", "s1").len(), 2);
        assert_eq!(log.for_session("t2", "s1").len(), 0);
    }
}
