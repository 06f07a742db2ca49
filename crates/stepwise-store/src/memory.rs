//! Memory store gateway
//!
//! The only path from step output to persistent memory. A write:
//! 1. rejects namespaced labels (executors only know short labels)
//! 2. validates the data against the step's return contract, writing nothing on mismatch
//! 3. builds the full key `tenant:session:task:label`
//! 4. takes the per-key lock for the writing task, waiting a bounded time
//! 5. stores the entry with lineage and announces the upsert
//!
//! The lock stays held until the orchestrator confirms it read the value.
//!
//! Besides step outputs the gateway keeps notes a step decides to remember:
//! - user memory (`user.` labels), visible across the user's sessions
//! - action memory (`action.` labels), scoped to the session
//!
//! A note whose canonical fingerprint already exists in its scope is skipped.

use crate::document::{DocumentStore, MEMORY};
use crate::error::{MemoryError, StoreError};
use crate::lock::LockTable;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use stepwise_core::telemetry::LOCK_TIMEOUTS;
use stepwise_core::{
    shape, ContentHash, Event, EventKind, EventSink, Identity, Lineage, PlanId, ReturnSpec,
    StepwiseConfig, TaskId,
};
use tokio::sync::broadcast;

/// Default number of query results
pub const DEFAULT_QUERY_LIMIT: usize = 5;

/// What an entry records
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Validated output of a plan step
    #[default]
    StepOutput,
    /// Outcome worth keeping for the rest of the session
    Action,
    /// Durable fact or preference of the user
    User,
}

impl MemoryKind {
    /// Label namespace of the kind
    #[inline]
    #[must_use]
    pub const fn label_prefix(self) -> &'static str {
        match self {
            Self::StepOutput => "",
            Self::Action => "action.",
            Self::User => "user.",
        }
    }

    /// Stable name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StepOutput => "step_output",
            Self::Action => "action",
            Self::User => "user",
        }
    }
}

/// Who is writing, and for which step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteTarget {
    /// Tenant
    pub tenant_id: String,
    /// Session
    pub session_id: String,
    /// Writing task (lock owner)
    pub task_id: TaskId,
    /// Plan, for lineage
    pub plan_id: Option<PlanId>,
    /// Step, for lineage
    pub step_index: Option<u32>,
    /// Owning user, for user memory
    pub user_id: Option<String>,
    /// Entry kind
    pub kind: MemoryKind,
}

impl WriteTarget {
    /// Create target
    #[inline]
    #[must_use]
    pub fn new(tenant_id: impl Into<String>, session_id: impl Into<String>, task_id: TaskId) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            session_id: session_id.into(),
            task_id,
            plan_id: None,
            step_index: None,
            user_id: None,
            kind: MemoryKind::StepOutput,
        }
    }

    /// With owning user
    #[inline]
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// With entry kind
    #[inline]
    #[must_use]
    pub fn with_kind(mut self, kind: MemoryKind) -> Self {
        self.kind = kind;
        self
    }

    /// With step lineage
    #[inline]
    #[must_use]
    pub fn with_step(mut self, plan_id: PlanId, step_index: u32) -> Self {
        self.plan_id = Some(plan_id);
        self.step_index = Some(step_index);
        self
    }

    fn lineage(&self) -> Lineage {
        Lineage {
            tenant_id: self.tenant_id.clone(),
            session_id: self.session_id.clone(),
            plan_id: self.plan_id,
            task_id: Some(self.task_id),
            step_index: self.step_index,
        }
    }
}

/// Stored memory entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Full key
    pub key: String,
    /// Tenant
    pub tenant_id: String,
    /// Session
    pub session_id: String,
    /// Writer
    pub task_id: TaskId,
    /// Short label
    pub label: String,
    /// Entry kind
    #[serde(default)]
    pub kind: MemoryKind,
    /// Owning user, for user memory
    #[serde(default)]
    pub user_id: Option<String>,
    /// Canonical content fingerprint
    #[serde(default)]
    pub fingerprint: Option<String>,
    /// Validated value
    pub value: Value,
    /// Contract shape the value was validated against
    pub shape: Value,
    /// Encoded size
    pub size_bytes: usize,
    /// Plan lineage
    #[serde(default)]
    pub plan_id: Option<PlanId>,
    /// Step lineage
    #[serde(default)]
    pub step_index: Option<u32>,
    /// Write time
    pub created_at: DateTime<Utc>,
    /// Expiry
    pub expires_at: DateTime<Utc>,
}

/// Successful write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReceipt {
    /// Full key the orchestrator reads back
    pub memory_key: String,
    /// Encoded size
    pub size_bytes: usize,
    /// Time spent waiting for the lock
    pub lock_wait: Duration,
}

/// Query visibility
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "id")]
pub enum QueryScope {
    /// Entries of one session
    Session(String),
    /// User memory of one user, across sessions
    User(String),
    /// Entries of every session in the tenant
    Tenant,
}

/// Result of saving a note
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteSaved {
    /// Written under a new key
    Stored {
        /// Full key
        memory_key: String,
    },
    /// An identical note already exists in the scope
    Duplicate {
        /// Key of the existing note
        memory_key: String,
    },
}

/// Structured memory query
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryQuery {
    /// Visibility
    pub scope: QueryScope,
    /// Exact label match
    pub label: Option<String>,
    /// Case-insensitive substring over the stored value
    pub contains: Option<String>,
    /// Entry kind
    pub kind: Option<MemoryKind>,
    /// Maximum results
    pub limit: usize,
}

impl MemoryQuery {
    /// Query a scope
    #[inline]
    #[must_use]
    pub fn new(scope: QueryScope) -> Self {
        Self {
            scope,
            label: None,
            contains: None,
            kind: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }

    /// With kind match
    #[inline]
    #[must_use]
    pub fn of_kind(mut self, kind: MemoryKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// With text match
    #[inline]
    #[must_use]
    pub fn containing(mut self, text: impl Into<String>) -> Self {
        self.contains = Some(text.into());
        self
    }

    /// With label match
    #[inline]
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    /// With result limit
    #[inline]
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }
}

/// Memory gateway
pub struct MemoryGateway {
    store: Arc<dyn DocumentStore>,
    locks: LockTable,
    events: Arc<dyn EventSink>,
    upserts: broadcast::Sender<String>,
    lock_wait: Duration,
    entry_ttl: Duration,
}

impl std::fmt::Debug for MemoryGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryGateway")
            .field("lock_wait", &self.lock_wait)
            .field("entry_ttl", &self.entry_ttl)
            .finish_non_exhaustive()
    }
}

impl MemoryGateway {
    /// Create gateway over a store
    #[must_use]
    pub fn new(
        store: Arc<dyn DocumentStore>,
        events: Arc<dyn EventSink>,
        cfg: &StepwiseConfig,
    ) -> Self {
        let (upserts, _) = broadcast::channel(256);
        Self {
            store,
            locks: LockTable::new(cfg.lock_ttl()),
            events,
            upserts,
            lock_wait: cfg.lock_wait(),
            entry_ttl: Duration::from_secs(cfg.memory.entry_ttl_secs),
        }
    }

    /// Build the full key for a label
    #[must_use]
    pub fn full_key(tenant_id: &str, session_id: &str, task_id: TaskId, label: &str) -> String {
        format!("{tenant_id}:{session_id}:{task_id}:{label}")
    }

    /// Validate and store a step output
    ///
    /// # Errors
    /// - `MemoryError::InvalidLabel` / `InvalidNamespace` for malformed key parts
    /// - `MemoryError::ContractViolation` if `data` fails `spec` (nothing written)
    /// - `MemoryError::LockTimeout` if another task holds the key past the wait window
    pub async fn write(
        &self,
        label: &str,
        data: Value,
        spec: &ReturnSpec,
        target: &WriteTarget,
    ) -> Result<WriteReceipt, MemoryError> {
        if label.is_empty() || label.contains(':') {
            return Err(MemoryError::InvalidLabel(label.to_string()));
        }
        for segment in [&target.tenant_id, &target.session_id] {
            if segment.is_empty() || segment.contains(':') {
                return Err(MemoryError::InvalidNamespace(segment.clone()));
            }
        }

        shape::validate(&data, spec)?;

        let key = Self::full_key(&target.tenant_id, &target.session_id, target.task_id, label);
        let acquired = match self.locks.acquire(&key, target.task_id, self.lock_wait).await {
            Ok(acquired) => acquired,
            Err(exceeded) => {
                metrics::counter!(LOCK_TIMEOUTS).increment(1);
                tracing::warn!(%key, holder = %exceeded.holder, "memory lock timeout");
                return Err(MemoryError::LockTimeout {
                    key,
                    waited: exceeded.waited,
                });
            }
        };

        let size_bytes = serde_json::to_vec(&data).map_err(StoreError::from)?.len();
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.entry_ttl)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let entry = MemoryEntry {
            key: key.clone(),
            tenant_id: target.tenant_id.clone(),
            session_id: target.session_id.clone(),
            task_id: target.task_id,
            label: label.to_string(),
            kind: target.kind,
            user_id: target.user_id.clone(),
            fingerprint: fingerprint_of(&data),
            value: data,
            shape: spec.expected_shape(),
            size_bytes,
            plan_id: target.plan_id,
            step_index: target.step_index,
            created_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(now),
        };
        let doc = serde_json::to_value(&entry).map_err(StoreError::from)?;
        if let Err(e) = self.store.put(MEMORY, &key, doc).await {
            self.locks.release(&key);
            return Err(e.into());
        }

        let lock_wait_ms = u64::try_from(acquired.waited.as_millis()).unwrap_or(u64::MAX);
        self.events.record(Event::new(
            EventKind::MemoryWritten,
            target.lineage(),
            json!({
                "key": key,
                "kind": target.kind.as_str(),
                "size": size_bytes,
                "validated": true,
                "lock_wait_ms": lock_wait_ms,
            }),
        ));
        let _ = self.upserts.send(key.clone());
        tracing::debug!(%key, size_bytes, lock_wait_ms, "memory written");

        Ok(WriteReceipt {
            memory_key: key,
            size_bytes,
            lock_wait: acquired.waited,
        })
    }

    /// Remember a fact about the user for later sessions
    ///
    /// Without `spec` the contract is inferred from `data`.
    ///
    /// # Errors
    /// - `MemoryError::InvalidNote` unless `data` is a JSON object
    /// - the errors of [`MemoryGateway::write`]
    pub async fn save_user_memory(
        &self,
        identity: &Identity,
        label: &str,
        data: Value,
        spec: Option<&ReturnSpec>,
    ) -> Result<NoteSaved, MemoryError> {
        self.save_note(MemoryKind::User, identity, label, data, spec)
            .await
    }

    /// Remember an action outcome for the rest of the session
    ///
    /// # Errors
    /// Same as [`MemoryGateway::save_user_memory`]
    pub async fn save_action_memory(
        &self,
        identity: &Identity,
        label: &str,
        data: Value,
        spec: Option<&ReturnSpec>,
    ) -> Result<NoteSaved, MemoryError> {
        self.save_note(MemoryKind::Action, identity, label, data, spec)
            .await
    }

    async fn save_note(
        &self,
        kind: MemoryKind,
        identity: &Identity,
        label: &str,
        data: Value,
        spec: Option<&ReturnSpec>,
    ) -> Result<NoteSaved, MemoryError> {
        if label.is_empty() || label.contains(':') {
            return Err(MemoryError::InvalidLabel(label.to_string()));
        }
        if !data.is_object() {
            return Err(MemoryError::InvalidNote(shape::type_name(&data).to_string()));
        }
        if identity.user_id.is_empty() || identity.user_id.contains(':') {
            return Err(MemoryError::InvalidNamespace(identity.user_id.clone()));
        }
        let inferred;
        let spec = match spec {
            Some(spec) => spec,
            None => {
                inferred = shape::infer_spec(&data);
                &inferred
            }
        };
        shape::validate(&data, spec)?;

        let scope = match kind {
            MemoryKind::User => QueryScope::User(identity.user_id.clone()),
            MemoryKind::Action | MemoryKind::StepOutput => {
                QueryScope::Session(identity.session_id.clone())
            }
        };
        if let Some(fingerprint) = fingerprint_of(&data) {
            let existing = self
                .query(
                    &identity.tenant_id,
                    &MemoryQuery::new(scope).of_kind(kind).with_limit(usize::MAX),
                )
                .await?
                .into_iter()
                .find(|e| e.fingerprint.as_deref() == Some(fingerprint.as_str()));
            if let Some(entry) = existing {
                tracing::debug!(key = %entry.key, kind = kind.as_str(), "duplicate memory skipped");
                return Ok(NoteSaved::Duplicate {
                    memory_key: entry.key,
                });
            }
        }

        let target = WriteTarget::new(&identity.tenant_id, &identity.session_id, TaskId::new())
            .with_user(&identity.user_id)
            .with_kind(kind);
        let full_label = format!("{}{label}", kind.label_prefix());
        let receipt = self.write(&full_label, data, spec, &target).await?;
        self.locks.release(&receipt.memory_key);
        Ok(NoteSaved::Stored {
            memory_key: receipt.memory_key,
        })
    }

    /// Full entry under a key
    ///
    /// # Errors
    /// Returns `MemoryError::NotFound` if absent or expired
    pub async fn entry(&self, key: &str) -> Result<MemoryEntry, MemoryError> {
        let doc = self
            .store
            .get(MEMORY, key)
            .await?
            .ok_or_else(|| MemoryError::NotFound(key.to_string()))?;
        let entry: MemoryEntry = serde_json::from_value(doc).map_err(StoreError::from)?;
        if entry.expires_at <= Utc::now() {
            self.store.delete(MEMORY, key).await?;
            return Err(MemoryError::NotFound(key.to_string()));
        }
        Ok(entry)
    }

    /// Value under a key
    ///
    /// # Errors
    /// Returns `MemoryError::NotFound` if absent or expired
    pub async fn read(&self, key: &str) -> Result<Value, MemoryError> {
        self.entry(key).await.map(|e| e.value)
    }

    /// Read a value and release its write lock
    ///
    /// # Errors
    /// Returns `MemoryError::NotFound` if absent or expired; the lock is released either way
    pub async fn read_confirmed(&self, key: &str) -> Result<Value, MemoryError> {
        let value = self.read(key).await;
        self.locks.release(key);
        value
    }

    /// Release a write lock without reading
    pub fn release(&self, key: &str) {
        self.locks.release(key);
    }

    /// Write lock table
    #[inline]
    #[must_use]
    pub fn locks(&self) -> &LockTable {
        &self.locks
    }

    /// Drop expired write locks; returns how many were removed
    pub fn purge_locks(&self) -> usize {
        self.locks.purge_expired()
    }

    /// Current lock holder of a key
    #[must_use]
    pub fn lock_holder(&self, key: &str) -> Option<TaskId> {
        self.locks.holder(key)
    }

    /// Structured query, always confined to one tenant
    ///
    /// Results are newest first.
    ///
    /// # Errors
    /// Returns `MemoryError::InvalidNamespace` for malformed ids, or a store error
    pub async fn query(
        &self,
        tenant_id: &str,
        query: &MemoryQuery,
    ) -> Result<Vec<MemoryEntry>, MemoryError> {
        if tenant_id.is_empty() || tenant_id.contains(':') {
            return Err(MemoryError::InvalidNamespace(tenant_id.to_string()));
        }
        let prefix = match &query.scope {
            QueryScope::Session(session) => {
                if session.is_empty() || session.contains(':') {
                    return Err(MemoryError::InvalidNamespace(session.clone()));
                }
                format!("{tenant_id}:{session}:")
            }
            QueryScope::User(user) => {
                if user.is_empty() || user.contains(':') {
                    return Err(MemoryError::InvalidNamespace(user.clone()));
                }
                format!("{tenant_id}:")
            }
            QueryScope::Tenant => format!("{tenant_id}:"),
        };
        let user = match &query.scope {
            QueryScope::User(user) => Some(user.as_str()),
            _ => None,
        };
        let needle = query.contains.as_deref().map(str::to_lowercase);
        let now = Utc::now();

        let mut hits: Vec<MemoryEntry> = self
            .store
            .scan_prefix(MEMORY, &prefix)
            .await?
            .into_iter()
            .filter_map(|(_, doc)| serde_json::from_value::<MemoryEntry>(doc).ok())
            .filter(|e| e.tenant_id == tenant_id && e.expires_at > now)
            .filter(|e| {
                user.map_or(true, |u| {
                    e.kind == MemoryKind::User && e.user_id.as_deref() == Some(u)
                })
            })
            .filter(|e| query.kind.map_or(true, |k| e.kind == k))
            .filter(|e| query.label.as_ref().map_or(true, |l| &e.label == l))
            .filter(|e| {
                needle
                    .as_ref()
                    .map_or(true, |n| e.value.to_string().to_lowercase().contains(n))
            })
            .collect();
        hits.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        hits.truncate(query.limit);
        Ok(hits)
    }

    /// Subscribe to upsert notifications (full keys)
    #[must_use]
    pub fn subscribe_upserts(&self) -> broadcast::Receiver<String> {
        self.upserts.subscribe()
    }
}

fn fingerprint_of(data: &Value) -> Option<String> {
    ContentHash::of_json(data).ok().map(|h| h.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::InMemoryDocumentStore;
    use crate::events::EventLog;
    use pretty_assertions::assert_eq;
    use stepwise_core::FieldShape;

    fn gateway() -> (MemoryGateway, Arc<EventLog>) {
        let log = Arc::new(EventLog::new());
        let gw = MemoryGateway::new(
            Arc::new(InMemoryDocumentStore::new()),
            log.clone(),
            &StepwiseConfig::default(),
        );
        (gw, log)
    }

    fn spec() -> ReturnSpec {
        ReturnSpec::new().with_field("outlets", FieldShape::Array)
    }

    #[tokio::test]
    async fn write_then_read_returns_validated_value() {
        let (gw, log) = gateway();
        let task = TaskId::new();
        let data = json!({"outlets": ["a", "b"]});
        let receipt = gw
            .write("step_1_output", data.clone(), &spec(), &WriteTarget::new("t1", "s1", task))
            .await
            .unwrap();

        assert_eq!(receipt.memory_key, format!("t1:s1:{task}:step_1_output"));
        assert_eq!(gw.read(&receipt.memory_key).await.unwrap(), data);
        assert_eq!(log.events()[0].kind, EventKind::MemoryWritten);
    }

    #[tokio::test]
    async fn namespaced_label_rejected() {
        let (gw, _) = gateway();
        let err = gw
            .write("t1:s1:x:y", json!({"outlets": []}), &spec(), &WriteTarget::new("t1", "s1", TaskId::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidLabel(_)));
    }

    #[tokio::test]
    async fn violation_writes_nothing() {
        let (gw, log) = gateway();
        let err = gw
            .write("l", json!({"outlets": "nope"}), &spec(), &WriteTarget::new("t1", "s1", TaskId::new()))
            .await
            .unwrap_err();
        let MemoryError::ContractViolation(v) = err else {
            panic!("expected contract violation");
        };
        assert_eq!(v.actual, json!({"outlets": "string"}));
        assert!(log.events().is_empty());
        assert!(gw
            .query("t1", &MemoryQuery::new(QueryScope::Tenant))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn lock_held_until_confirmed_read() {
        let (gw, _) = gateway();
        let task = TaskId::new();
        let receipt = gw
            .write("l", json!({"outlets": []}), &spec(), &WriteTarget::new("t1", "s1", task))
            .await
            .unwrap();
        assert_eq!(gw.lock_holder(&receipt.memory_key), Some(task));
        gw.read_confirmed(&receipt.memory_key).await.unwrap();
        assert_eq!(gw.lock_holder(&receipt.memory_key), None);
    }

    #[tokio::test]
    async fn query_never_crosses_tenants() {
        let (gw, _) = gateway();
        for tenant in ["t1", "t10", "t2"] {
            gw.write("l", json!({"outlets": [tenant]}), &spec(), &WriteTarget::new(tenant, "s1", TaskId::new()))
                .await
                .unwrap();
        }
        let hits = gw.query("t1", &MemoryQuery::new(QueryScope::Tenant)).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].tenant_id, "t1");
    }

    #[tokio::test]
    async fn query_filters_session_and_text() {
        let (gw, _) = gateway();
        gw.write("l", json!({"outlets": ["TechCrunch"]}), &spec(), &WriteTarget::new("t1", "s1", TaskId::new()))
            .await
            .unwrap();
        gw.write("l", json!({"outlets": ["bbc"]}), &spec(), &WriteTarget::new("t1", "s2", TaskId::new()))
            .await
            .unwrap();

        let session = gw
            .query("t1", &MemoryQuery::new(QueryScope::Session("s1".into())))
            .await
            .unwrap();
        assert_eq!(session.len(), 1);

        let text = gw
            .query("t1", &MemoryQuery::new(QueryScope::Tenant).containing("techcrunch"))
            .await
            .unwrap();
        assert_eq!(text.len(), 1);
        assert_eq!(text[0].session_id, "s1");
    }

    #[tokio::test(start_paused = true)]
    async fn contended_key_waits_then_times_out() {
        let (gw, _) = gateway();
        let task = TaskId::new();
        let key = MemoryGateway::full_key("t1", "s1", task, "l");
        gw.locks.acquire(&key, TaskId::new(), Duration::ZERO).await.unwrap();

        let err = gw
            .write("l", json!({"outlets": []}), &spec(), &WriteTarget::new("t1", "s1", task))
            .await
            .unwrap_err();
        let MemoryError::LockTimeout { waited, .. } = err else {
            panic!("expected lock timeout");
        };
        assert_eq!(waited, Duration::from_secs(5));
        assert!(gw.read(&key).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn contended_key_succeeds_after_release() {
        let (gw, _) = gateway();
        let gw = Arc::new(gw);
        let task = TaskId::new();
        let key = MemoryGateway::full_key("t1", "s1", task, "l");
        gw.locks.acquire(&key, TaskId::new(), Duration::ZERO).await.unwrap();

        let writer = {
            let gw = Arc::clone(&gw);
            tokio::spawn(async move {
                gw.write("l", json!({"outlets": [1]}), &spec(), &WriteTarget::new("t1", "s1", task))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(2)).await;
        gw.release(&key);

        let receipt = writer.await.unwrap().unwrap();
        assert!(receipt.lock_wait >= Duration::from_secs(2));
        assert_eq!(gw.read(&key).await.unwrap(), json!({"outlets": [1]}));
    }

    #[tokio::test]
    async fn upserts_are_announced() {
        let (gw, _) = gateway();
        let mut rx = gw.subscribe_upserts();
        let receipt = gw
            .write("l", json!({"outlets": []}), &spec(), &WriteTarget::new("t1", "s1", TaskId::new()))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap(), receipt.memory_key);
    }

    fn alice(session: &str) -> Identity {
        Identity::new("t1", "alice", session)
    }

    #[tokio::test]
    async fn user_memory_follows_the_user_across_sessions() {
        let (gw, _) = gateway();
        let saved = gw
            .save_user_memory(&alice("s1"), "diet", json!({"vegetarian": true}), None)
            .await
            .unwrap();
        let NoteSaved::Stored { memory_key } = saved else {
            panic!("expected a new note");
        };
        assert!(memory_key.ends_with(":user.diet"));
        assert_eq!(gw.lock_holder(&memory_key), None);

        let mine = gw
            .query("t1", &MemoryQuery::new(QueryScope::User("alice".into())))
            .await
            .unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].kind, MemoryKind::User);
        assert_eq!(mine[0].user_id.as_deref(), Some("alice"));

        let others = gw
            .query("t1", &MemoryQuery::new(QueryScope::User("bob".into())))
            .await
            .unwrap();
        assert!(others.is_empty());
    }

    #[tokio::test]
    async fn identical_user_memory_is_skipped() {
        let (gw, _) = gateway();
        let first = gw
            .save_user_memory(&alice("s1"), "diet", json!({"vegetarian": true, "nuts": false}), None)
            .await
            .unwrap();
        let second = gw
            .save_user_memory(&alice("s2"), "diet", json!({"nuts": false, "vegetarian": true}), None)
            .await
            .unwrap();
        let NoteSaved::Stored { memory_key } = first else {
            panic!("expected a new note");
        };
        assert_eq!(second, NoteSaved::Duplicate { memory_key });

        let changed = gw
            .save_user_memory(&alice("s2"), "diet", json!({"vegetarian": false}), None)
            .await
            .unwrap();
        assert!(matches!(changed, NoteSaved::Stored { .. }));
    }

    #[tokio::test]
    async fn action_memory_stays_in_the_session() {
        let (gw, _) = gateway();
        let note = json!({"booked": "table for two"});
        gw.save_action_memory(&alice("s1"), "booking", note.clone(), None)
            .await
            .unwrap();
        let again = gw
            .save_action_memory(&alice("s2"), "booking", note, None)
            .await
            .unwrap();
        assert!(matches!(again, NoteSaved::Stored { .. }));

        let s1 = gw
            .query(
                "t1",
                &MemoryQuery::new(QueryScope::Session("s1".into())).of_kind(MemoryKind::Action),
            )
            .await
            .unwrap();
        assert_eq!(s1.len(), 1);
        assert_eq!(s1[0].label, "action.booking");
    }

    #[tokio::test]
    async fn notes_must_be_objects() {
        let (gw, _) = gateway();
        let err = gw
            .save_user_memory(&alice("s1"), "diet", json!(["vegetarian"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::InvalidNote(_)));
        assert_eq!(err.reason_code(), "invalid_memory_json");
    }

    #[tokio::test(start_paused = true)]
    async fn purge_locks_drops_abandoned_writers() {
        let log = Arc::new(EventLog::new());
        let mut cfg = StepwiseConfig::default();
        cfg.memory.lock_ttl_secs = 1;
        let gw = MemoryGateway::new(Arc::new(InMemoryDocumentStore::new()), log, &cfg);
        gw.write("l", json!({"outlets": []}), &spec(), &WriteTarget::new("t1", "s1", TaskId::new()))
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(gw.purge_locks(), 1);
    }
}
