//! Temp store for oversized skill payloads
//!
//! Large responses never enter model context or memory; they are staged
//! here as files under a per-task directory and handed to the extraction
//! sandbox by path. Artifacts are cached with moka:
//! - TTL expiry (`temp.sweep_after_secs`)
//! - bounded entry count (`temp.max_artifacts`)
//! - file removal when the last handle is dropped
//!
//! Only the staging task can see its artifacts.

use crate::error::TempStoreError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use stepwise_core::config::TempSection;
use stepwise_core::{FileId, TaskId};
use tempfile::{NamedTempFile, TempDir};

/// A staged payload on disk
#[derive(Debug)]
pub struct StagedArtifact {
    /// Identifier
    pub file_id: FileId,
    /// Owning task
    pub task_id: TaskId,
    /// Payload size
    pub byte_len: u64,
    /// Staging time
    pub staged_at: DateTime<Utc>,
    file: NamedTempFile,
    scope: PathBuf,
}

impl StagedArtifact {
    /// File path
    #[inline]
    #[must_use]
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Task directory the artifact lives in
    #[inline]
    #[must_use]
    pub fn scope(&self) -> &Path {
        &self.scope
    }
}

/// Staged payload store
pub struct TempStore {
    root: TempDir,
    artifacts: Cache<FileId, Arc<StagedArtifact>>,
    by_task: DashMap<TaskId, Vec<FileId>>,
}

impl std::fmt::Debug for TempStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TempStore")
            .field("root", &self.root.path())
            .field("artifacts", &self.artifacts.entry_count())
            .finish_non_exhaustive()
    }
}

impl TempStore {
    /// Create store under a fresh temp root
    ///
    /// # Errors
    /// Returns `TempStoreError::Io` if the root cannot be created
    pub fn new(cfg: &TempSection) -> Result<Self, TempStoreError> {
        Ok(Self {
            root: tempfile::Builder::new().prefix("stepwise-").tempdir()?,
            artifacts: Cache::builder()
                .max_capacity(cfg.max_artifacts)
                .time_to_live(Duration::from_secs(cfg.sweep_after_secs))
                .build(),
            by_task: DashMap::new(),
        })
    }

    /// Store root
    #[must_use]
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    /// Stage bytes for a task
    ///
    /// # Errors
    /// Returns `TempStoreError::Io` on filesystem failure
    pub async fn stage(
        &self,
        task_id: TaskId,
        bytes: Vec<u8>,
    ) -> Result<Arc<StagedArtifact>, TempStoreError> {
        let scope = self.root.path().join(task_id.to_string());
        let file_id = FileId::new();
        let byte_len = bytes.len() as u64;

        let staged = tokio::task::spawn_blocking(move || -> Result<StagedArtifact, TempStoreError> {
            std::fs::create_dir_all(&scope)?;
            let mut file = tempfile::Builder::new()
                .prefix(&format!("{file_id}-"))
                .suffix(".payload")
                .tempfile_in(&scope)?;
            file.write_all(&bytes)?;
            file.flush()?;
            Ok(StagedArtifact {
                file_id,
                task_id,
                byte_len,
                staged_at: Utc::now(),
                file,
                scope,
            })
        })
        .await
        .map_err(|e| TempStoreError::Worker(e.to_string()))??;

        let staged = Arc::new(staged);
        self.artifacts.insert(file_id, Arc::clone(&staged)).await;
        self.by_task.entry(task_id).or_default().push(file_id);
        tracing::debug!(%file_id, %task_id, byte_len, "payload staged");
        Ok(staged)
    }

    /// Artifact visible to `task_id`
    ///
    /// # Errors
    /// - `TempStoreError::NotFound` if expired or unknown
    /// - `TempStoreError::ForeignTask` if another task staged it
    pub async fn get(
        &self,
        task_id: TaskId,
        file_id: FileId,
    ) -> Result<Arc<StagedArtifact>, TempStoreError> {
        let staged = self
            .artifacts
            .get(&file_id)
            .await
            .ok_or(TempStoreError::NotFound(file_id))?;
        if staged.task_id != task_id {
            return Err(TempStoreError::ForeignTask { file_id, task_id });
        }
        Ok(staged)
    }

    /// Read `count` lines starting at line `offset`
    ///
    /// # Errors
    /// Same as [`TempStore::get`], plus `TempStoreError::Io` on read failure
    pub async fn sample(
        &self,
        task_id: TaskId,
        file_id: FileId,
        offset: usize,
        count: usize,
    ) -> Result<Vec<String>, TempStoreError> {
        let staged = self.get(task_id, file_id).await?;
        tokio::task::spawn_blocking(move || -> Result<Vec<String>, TempStoreError> {
            let reader = BufReader::new(std::fs::File::open(staged.path())?);
            reader
                .lines()
                .skip(offset)
                .take(count)
                .map(|line| line.map_err(TempStoreError::from))
                .collect()
        })
        .await
        .map_err(|e| TempStoreError::Worker(e.to_string()))?
    }

    /// Drop every artifact a task staged; returns how many were dropped
    pub async fn release_task(&self, task_id: TaskId) -> usize {
        let Some((_, ids)) = self.by_task.remove(&task_id) else {
            return 0;
        };
        for id in &ids {
            self.artifacts.invalidate(id).await;
        }
        let scope = self.root.path().join(task_id.to_string());
        if let Err(e) = tokio::fs::remove_dir_all(&scope).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(%task_id, error = %e, "failed to remove task staging dir");
            }
        }
        ids.len()
    }

    /// Evict expired artifacts; returns how many index entries were dropped
    ///
    /// Task directories left empty are removed as well.
    pub async fn sweep(&self) -> usize {
        self.artifacts.run_pending_tasks().await;
        let mut dropped = 0;
        for mut entry in self.by_task.iter_mut() {
            let before = entry.len();
            entry.retain(|id| self.artifacts.contains_key(id));
            dropped += before - entry.len();
        }
        let mut emptied = Vec::new();
        self.by_task.retain(|task_id, ids| {
            if ids.is_empty() {
                emptied.push(*task_id);
            }
            !ids.is_empty()
        });
        for task_id in emptied {
            let scope = self.root.path().join(task_id.to_string());
            match tokio::fs::remove_dir(&scope).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                // still in use through an outstanding handle
                Err(e) => tracing::debug!(%task_id, error = %e, "task staging dir kept"),
            }
        }
        if dropped > 0 {
            tracing::debug!(dropped, "temp store swept");
        }
        dropped
    }

    /// Number of live artifacts
    #[must_use]
    pub fn len(&self) -> u64 {
        self.artifacts.entry_count()
    }

    /// Whether no artifact is staged
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_task.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(ttl_secs: u64) -> TempStore {
        TempStore::new(&TempSection {
            sweep_after_secs: ttl_secs,
            max_artifacts: 16,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn staged_payload_is_sampled_by_line() {
        let store = store(3600);
        let task = TaskId::new();
        let body: String = (0..50).map(|i| format!("line {i}\n")).collect();
        let staged = store.stage(task, body.into_bytes()).await.unwrap();

        assert!(staged.path().starts_with(staged.scope()));
        let lines = store.sample(task, staged.file_id, 10, 3).await.unwrap();
        assert_eq!(lines, vec!["line 10", "line 11", "line 12"]);
    }

    #[tokio::test]
    async fn other_tasks_cannot_see_artifact() {
        let store = store(3600);
        let staged = store.stage(TaskId::new(), b"{}".to_vec()).await.unwrap();
        let err = store.get(TaskId::new(), staged.file_id).await.unwrap_err();
        assert!(matches!(err, TempStoreError::ForeignTask { .. }));
    }

    #[tokio::test]
    async fn release_removes_task_files() {
        let store = store(3600);
        let task = TaskId::new();
        let staged = store.stage(task, b"payload".to_vec()).await.unwrap();
        let path = staged.path().to_path_buf();
        let file_id = staged.file_id;
        drop(staged);

        assert_eq!(store.release_task(task).await, 1);
        assert!(matches!(
            store.get(task, file_id).await,
            Err(TempStoreError::NotFound(_))
        ));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn expired_artifacts_are_swept() {
        let store = store(1);
        let task = TaskId::new();
        let staged = store.stage(task, b"x".to_vec()).await.unwrap();
        let (file_id, scope) = (staged.file_id, staged.scope().to_path_buf());
        drop(staged);
        tokio::time::sleep(Duration::from_millis(1_200)).await;

        assert!(store.get(task, file_id).await.is_err());
        assert_eq!(store.sweep().await, 1);
        assert!(store.is_empty());
        assert!(!scope.exists());
    }

    #[tokio::test]
    async fn sweep_keeps_directories_of_live_tasks() {
        let store = store(3600);
        let task = TaskId::new();
        let staged = store.stage(task, b"x".to_vec()).await.unwrap();
        assert_eq!(store.sweep().await, 0);
        assert!(staged.scope().exists());
        assert!(staged.path().exists());
    }
}
