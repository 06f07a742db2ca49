//! Per-key single-writer locks
//!
//! One writer per fully qualified memory key:
//! - the holder may re-acquire its own lock
//! - other owners wait, woken on release or holder expiry, up to a deadline
//! - every lock carries a TTL so an abandoned holder cannot block forever
//!
//! Keys are independent; writers of different keys never contend.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use stepwise_core::TaskId;
use tokio::sync::Notify;
use tokio::time::Instant;

/// Table size at which acquire also drops expired holders
const PURGE_AT: usize = 256;

#[derive(Debug, Clone, Copy)]
struct Holder {
    owner: TaskId,
    expires_at: Instant,
}

/// Outcome of a successful acquire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Acquired {
    /// Time spent waiting for another holder
    pub waited: Duration,
}

/// Acquire gave up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockWaitExceeded {
    /// Time spent waiting
    pub waited: Duration,
    /// Task holding the key when we gave up
    pub holder: TaskId,
}

/// Lock table keyed by full memory key
#[derive(Debug)]
pub struct LockTable {
    holders: Mutex<HashMap<String, Holder>>,
    released: Notify,
    ttl: Duration,
}

impl LockTable {
    /// Create table with a lock TTL
    #[inline]
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            holders: Mutex::new(HashMap::new()),
            released: Notify::new(),
            ttl,
        }
    }

    /// Acquire `key` for `owner`, waiting up to `wait` on contention
    ///
    /// # Errors
    /// Returns `LockWaitExceeded` if another owner still holds the key at the deadline
    pub async fn acquire(
        &self,
        key: &str,
        owner: TaskId,
        wait: Duration,
    ) -> Result<Acquired, LockWaitExceeded> {
        let started = Instant::now();
        let deadline = started + wait;
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let holder = match self.try_acquire(key, owner) {
                Ok(()) => {
                    return Ok(Acquired {
                        waited: started.elapsed(),
                    })
                }
                Err(holder) => holder,
            };

            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(key, %owner, holder = %holder.owner, "lock wait exceeded");
                return Err(LockWaitExceeded {
                    waited: now - started,
                    holder: holder.owner,
                });
            }

            let wake_at = deadline.min(holder.expires_at);
            let _ = tokio::time::timeout_at(wake_at, notified).await;
        }
    }

    fn try_acquire(&self, key: &str, owner: TaskId) -> Result<(), Holder> {
        let now = Instant::now();
        let mut holders = self.holders.lock();
        match holders.get(key) {
            Some(h) if h.owner != owner && h.expires_at > now => Err(*h),
            _ => {
                if holders.len() >= PURGE_AT {
                    holders.retain(|_, h| h.expires_at > now);
                }
                holders.insert(
                    key.to_string(),
                    Holder {
                        owner,
                        expires_at: now + self.ttl,
                    },
                );
                Ok(())
            }
        }
    }

    /// Release `key` regardless of owner
    ///
    /// Returns the previous holder, if any.
    pub fn release(&self, key: &str) -> Option<TaskId> {
        let previous = self.holders.lock().remove(key).map(|h| h.owner);
        if previous.is_some() {
            self.released.notify_waiters();
        }
        previous
    }

    /// Current live holder of `key`
    #[must_use]
    pub fn holder(&self, key: &str) -> Option<TaskId> {
        let now = Instant::now();
        self.holders
            .lock()
            .get(key)
            .filter(|h| h.expires_at > now)
            .map(|h| h.owner)
    }

    /// Drop expired entries; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut holders = self.holders.lock();
        let before = holders.len();
        holders.retain(|_, h| h.expires_at > now);
        before - holders.len()
    }
}
