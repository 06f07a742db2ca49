//! Error types for Stepwise storage

use std::time::Duration;
use stepwise_core::{ContractViolation, FileId, PlanId, TaskId};

/// Backend errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Backend rejected the operation
    #[error("backend error: {0}")]
    Backend(String),

    /// Document could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Memory gateway errors
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    /// Caller passed a namespaced key instead of a short label
    #[error("invalid label {0:?}: executors must pass short key labels, not namespaced keys")]
    InvalidLabel(String),

    /// Tenant or session id cannot be used as a key segment
    #[error("invalid namespace segment {0:?}")]
    InvalidNamespace(String),

    /// Data failed the return contract; nothing was written
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),

    /// Another task held the key for the whole wait window
    #[error("memory lock timeout on {key} after {waited:?}")]
    LockTimeout {
        /// Full key
        key: String,
        /// How long we waited
        waited: Duration,
    },

    /// No live entry under the key
    #[error("memory key not found: {0}")]
    NotFound(String),

    /// Notes must be JSON objects
    #[error("memory note must be a JSON object, got {0}")]
    InvalidNote(String),

    /// Backend failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl MemoryError {
    /// Whether the same write may succeed on a second attempt
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }

    /// Stable reason code
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::InvalidLabel(_) | Self::InvalidNamespace(_) => "memory_invalid_key",
            Self::ContractViolation(_) => "contract_violation",
            Self::LockTimeout { .. } => "memory_lock_timeout",
            Self::NotFound(_) => "memory_not_found",
            Self::InvalidNote(_) => "invalid_memory_json",
            Self::Store(_) => "memory_store_error",
        }
    }
}

/// Plan repository errors
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// No such plan
    #[error("plan not found: {0}")]
    NotFound(PlanId),

    /// Plan already exists
    #[error("plan already exists: {0}")]
    AlreadyExists(PlanId),

    /// Someone saved a newer snapshot first
    #[error("version conflict on plan {plan_id}: expected {expected}, found {found}")]
    VersionConflict {
        /// Plan
        plan_id: PlanId,
        /// Version the caller held
        expected: u64,
        /// Version in the store
        found: u64,
    },

    /// No such step in the plan
    #[error("plan {plan_id} has no step {step_index}")]
    StepNotFound {
        /// Plan
        plan_id: PlanId,
        /// Requested step
        step_index: u32,
    },

    /// Backend failure
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Temp store errors
#[derive(Debug, thiserror::Error)]
pub enum TempStoreError {
    /// Filesystem failure
    #[error("temp store io: {0}")]
    Io(#[from] std::io::Error),

    /// Artifact expired or never existed
    #[error("staged artifact not found: {0}")]
    NotFound(FileId),

    /// Artifact belongs to another task
    #[error("artifact {file_id} is not visible to task {task_id}")]
    ForeignTask {
        /// Artifact
        file_id: FileId,
        /// Requesting task
        task_id: TaskId,
    },

    /// Staging worker died
    #[error("temp store worker failed: {0}")]
    Worker(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_lock_timeouts_retry() {
        let timeout = MemoryError::LockTimeout {
            key: "t:s:x:l".into(),
            waited: Duration::from_secs(5),
        };
        assert!(timeout.is_retryable());
        assert_eq!(timeout.reason_code(), "memory_lock_timeout");
        assert!(!MemoryError::InvalidLabel("a:b".into()).is_retryable());
    }

    #[test]
    fn label_error_mentions_short_labels() {
        assert!(MemoryError::InvalidLabel("a:b".into())
            .to_string()
            .contains("short key labels"));
    }
}
