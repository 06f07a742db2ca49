//! Sandbox runner
//!
//! Runs a compiled procedure on a blocking worker with:
//! - no network (URL sources fail closed)
//! - reads confined to the artifact's scope directory
//! - a wall-clock deadline enforced both outside and inside the worker
//! - an output cap (oversized output is an error, never truncated)
//! - cooperative cancellation through the session token

use crate::error::SandboxError;
use crate::procedure::{ExtractionProcedure, Source};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use stepwise_core::{ContentHash, StepwiseConfig};
use tokio_util::sync::CancellationToken;

/// Resource bounds for one run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SandboxLimits {
    /// Wall-clock limit
    pub timeout: Duration,
    /// Output cap in bytes
    pub max_output_bytes: usize,
}

impl SandboxLimits {
    /// Limits from configuration
    #[must_use]
    pub fn from_config(cfg: &StepwiseConfig) -> Self {
        Self {
            timeout: cfg.sandbox_timeout(),
            max_output_bytes: cfg.sandbox.max_output_bytes,
        }
    }
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self::from_config(&StepwiseConfig::default())
    }
}

/// A staged artifact the sandbox may read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    /// File holding the payload
    pub path: PathBuf,
    /// Directory the procedure is confined to
    pub scope: PathBuf,
    /// Payload size
    pub byte_len: u64,
}

/// Successful run
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxReport {
    /// Reduced output, one key per procedure field
    pub output: Value,
    /// Audit hash of the procedure
    pub procedure_hash: ContentHash,
    /// Bytes read
    pub input_bytes: u64,
    /// Bytes produced
    pub output_bytes: usize,
    /// Wall time
    pub duration: Duration,
}

/// Extraction sandbox
#[derive(Debug, Clone, Default)]
pub struct Sandbox {
    limits: SandboxLimits,
}

impl Sandbox {
    /// Create sandbox with limits
    #[inline]
    #[must_use]
    pub fn new(limits: SandboxLimits) -> Self {
        Self { limits }
    }

    /// Configured limits
    #[inline]
    #[must_use]
    pub fn limits(&self) -> SandboxLimits {
        self.limits
    }

    /// Run a procedure against an artifact
    ///
    /// # Errors
    /// - `SandboxError::NetworkDenied` / `FilesystemDenied` for sources outside the artifact scope
    /// - `SandboxError::Timeout` when the deadline passes
    /// - `SandboxError::OversizedOutput` when the result exceeds the cap
    /// - `SandboxError::Cancelled` when the session token fires
    pub async fn run(
        &self,
        procedure: &ExtractionProcedure,
        artifact: &ArtifactRef,
        cancel: &CancellationToken,
    ) -> Result<SandboxReport, SandboxError> {
        let procedure_hash = procedure.hash();
        let input = resolve_source(&procedure.source, artifact)?;
        let compiled = procedure.compile()?;

        let started = Instant::now();
        let timeout = self.limits.timeout;
        let deadline = started + timeout;
        let worker_token = cancel.child_token();
        let guard = worker_token.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let checkpoint = || {
                if guard.is_cancelled() {
                    return Err(SandboxError::Cancelled);
                }
                if Instant::now() >= deadline {
                    return Err(SandboxError::Timeout(timeout));
                }
                Ok(())
            };
            checkpoint()?;
            let raw = std::fs::read_to_string(&input)?;
            checkpoint()?;
            let doc = compiled.parse(&raw, &checkpoint)?;
            compiled.evaluate(&doc, &checkpoint)
        });

        let output = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                worker_token.cancel();
                return Err(SandboxError::Cancelled);
            }
            joined = tokio::time::timeout(timeout, handle) => match joined {
                Err(_) => {
                    worker_token.cancel();
                    return Err(SandboxError::Timeout(timeout));
                }
                Ok(Err(join)) => return Err(SandboxError::Worker(join.to_string())),
                Ok(Ok(result)) => result?,
            },
        };

        let output_bytes = serde_json::to_vec(&output)
            .map_err(|e| SandboxError::Worker(e.to_string()))?
            .len();
        if output_bytes > self.limits.max_output_bytes {
            return Err(SandboxError::OversizedOutput {
                bytes: output_bytes,
                limit: self.limits.max_output_bytes,
            });
        }

        let duration = started.elapsed();
        tracing::debug!(
            procedure = %procedure_hash.short(),
            input_bytes = artifact.byte_len,
            output_bytes,
            duration_ms = duration.as_millis(),
            "extraction finished"
        );

        Ok(SandboxReport {
            output,
            procedure_hash,
            input_bytes: artifact.byte_len,
            output_bytes,
            duration,
        })
    }
}

fn resolve_source(source: &Source, artifact: &ArtifactRef) -> Result<PathBuf, SandboxError> {
    match source {
        Source::Artifact => Ok(artifact.path.clone()),
        Source::Url(url) => Err(SandboxError::NetworkDenied(url.clone())),
        Source::File(path) => confine(path, &artifact.scope),
    }
}

fn confine(path: &Path, scope: &Path) -> Result<PathBuf, SandboxError> {
    let candidate = if path.is_absolute() {
        path.to_path_buf()
    } else {
        scope.join(path)
    };
    let denied = || SandboxError::FilesystemDenied(path.to_path_buf());
    let resolved = candidate.canonicalize().map_err(|_| denied())?;
    let scope = scope.canonicalize().map_err(|_| denied())?;
    if resolved.starts_with(&scope) {
        Ok(resolved)
    } else {
        Err(denied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::procedure::{FieldRule, InputFormat, Reduce};
    use serde_json::json;
    use std::io::Write;

    fn stage(dir: &tempfile::TempDir, body: &str) -> ArtifactRef {
        let path = dir.path().join("payload.json");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        ArtifactRef {
            path,
            scope: dir.path().to_path_buf(),
            byte_len: body.len() as u64,
        }
    }

    fn count_items() -> ExtractionProcedure {
        ExtractionProcedure::over_artifact(InputFormat::Json)
            .with_field("count", FieldRule::new("items.*", Reduce::Count))
    }

    #[tokio::test]
    async fn runs_against_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = stage(&dir, r#"{"items": [1, 2, 3]}"#);
        let report = Sandbox::default()
            .run(&count_items(), &artifact, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.output, json!({"count": 3}));
        assert_eq!(report.procedure_hash, count_items().hash());
    }

    #[tokio::test]
    async fn network_source_fails_closed() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = stage(&dir, "{}");
        let mut proc = count_items();
        proc.source = Source::Url("https://example.com/data".into());
        let err = Sandbox::default()
            .run(&proc, &artifact, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::NetworkDenied(_)));
    }

    #[tokio::test]
    async fn file_outside_scope_denied() {
        let dir = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let artifact = stage(&dir, "{}");
        let outside = stage(&other, "{}");
        let mut proc = count_items();
        proc.source = Source::File(outside.path);
        let err = Sandbox::default()
            .run(&proc, &artifact, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::FilesystemDenied(_)));
    }

    #[tokio::test]
    async fn file_inside_scope_allowed() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = stage(&dir, r#"{"items": [1]}"#);
        let mut proc = count_items();
        proc.source = Source::File(PathBuf::from("payload.json"));
        let report = Sandbox::default()
            .run(&proc, &artifact, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.output, json!({"count": 1}));
    }

    #[tokio::test]
    async fn oversized_output_is_error_not_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let items: Vec<String> = (0..100).map(|i| format!("item-{i}")).collect();
        let artifact = stage(&dir, &json!({ "items": items }).to_string());
        let proc = ExtractionProcedure::over_artifact(InputFormat::Json)
            .with_field("items", FieldRule::new("items", Reduce::Value));
        let sandbox = Sandbox::new(SandboxLimits {
            timeout: Duration::from_secs(5),
            max_output_bytes: 64,
        });
        let err = sandbox
            .run(&proc, &artifact, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::OversizedOutput { limit: 64, .. }));
    }

    #[tokio::test]
    async fn zero_deadline_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = stage(&dir, r#"{"items": []}"#);
        let sandbox = Sandbox::new(SandboxLimits {
            timeout: Duration::ZERO,
            max_output_bytes: 1024,
        });
        let err = sandbox
            .run(&count_items(), &artifact, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }

    #[tokio::test]
    async fn cancelled_session_stops_run() {
        let dir = tempfile::tempdir().unwrap();
        let artifact = stage(&dir, r#"{"items": []}"#);
        let token = CancellationToken::new();
        token.cancel();
        let err = Sandbox::default()
            .run(&count_items(), &artifact, &token)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Cancelled));
    }
}
