//! Executor pool
//!
//! Starts step executors as spawned tokio tasks:
//! - bounded concurrency across runs (semaphore permits)
//! - each executor reports its outcome over a oneshot channel
//! - starting one requires a [`SpawnAuthority`], which only the orchestrator mints
//!
//! Executors themselves never see the pool.

use crate::context::StepAssignment;
use crate::error::PoolError;
use crate::executor::{StepExecutor, StepOutcome};
use parking_lot::Mutex;
use std::sync::Arc;
use stepwise_core::TaskId;
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Proof that the caller may start executors
///
/// Cannot be constructed outside this crate.
#[derive(Debug)]
pub struct SpawnAuthority {
    _private: (),
}

impl SpawnAuthority {
    pub(crate) fn mint() -> Self {
        Self { _private: () }
    }
}

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Executors started
    pub total_spawned: usize,
    /// Executors running now
    pub active_count: usize,
    /// Executors that reported back
    pub total_completed: usize,
}

/// Handle to one running executor
#[derive(Debug)]
pub struct ExecutorHandle {
    /// Task identity of the step
    pub task_id: TaskId,
    outcome: oneshot::Receiver<StepOutcome>,
    join: JoinHandle<()>,
}

impl ExecutorHandle {
    /// Wait for the executor's report
    ///
    /// An executor that dies without reporting counts as a failed step.
    pub async fn outcome(self) -> StepOutcome {
        let outcome = self.outcome.await.unwrap_or_else(|_| StepOutcome::Failed {
            reason: "executor_crashed".to_string(),
        });
        if let Err(e) = self.join.await {
            tracing::warn!(task_id = %self.task_id, error = %e, "executor task ended abnormally");
        }
        outcome
    }
}

/// Pool of step executors
#[derive(Debug)]
pub struct ExecutorPool {
    executor: Arc<StepExecutor>,
    permits: Arc<Semaphore>,
    stats: Arc<Mutex<PoolStats>>,
}

impl ExecutorPool {
    /// Create pool allowing `max_concurrent` executors in flight
    #[must_use]
    pub fn new(executor: Arc<StepExecutor>, max_concurrent: usize) -> Self {
        Self {
            executor,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
            stats: Arc::new(Mutex::new(PoolStats::default())),
        }
    }

    /// Start an executor for an assigned step
    ///
    /// Waits for a free permit.
    ///
    /// # Errors
    /// Returns `PoolError::Closed` if the pool was shut down
    pub async fn spawn(
        &self,
        _authority: &SpawnAuthority,
        assignment: StepAssignment,
        cancel: CancellationToken,
    ) -> Result<ExecutorHandle, PoolError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;
        let task_id = assignment.step.task_id.unwrap_or_default();
        let (tx, rx) = oneshot::channel();
        let executor = Arc::clone(&self.executor);
        let stats = Arc::clone(&self.stats);
        {
            let mut s = stats.lock();
            s.total_spawned += 1;
            s.active_count += 1;
        }

        let join = tokio::spawn(async move {
            let outcome = executor.execute(assignment, cancel).await;
            {
                let mut s = stats.lock();
                s.active_count -= 1;
                s.total_completed += 1;
            }
            drop(permit);
            let _ = tx.send(outcome);
        });

        Ok(ExecutorHandle {
            task_id,
            outcome: rx,
            join,
        })
    }

    /// Current statistics
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        *self.stats.lock()
    }

    /// Free permits
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Stop accepting new executors; running ones finish normally
    pub fn close(&self) {
        self.permits.close();
    }

    /// Whether [`ExecutorPool::close`] was called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.permits.is_closed()
    }
}
