//! Sandbox errors

use std::path::PathBuf;
use std::time::Duration;

/// Why an extraction run did not produce output
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Wall-clock limit reached
    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),

    /// Output larger than the cap; narrow and retry
    #[error("extraction output {bytes} bytes exceeds cap {limit}")]
    OversizedOutput {
        /// Produced size
        bytes: usize,
        /// Cap
        limit: usize,
    },

    /// Procedure tried to reach the network
    #[error("network access denied: {0}")]
    NetworkDenied(String),

    /// Procedure tried to read outside the artifact scope
    #[error("filesystem access denied: {}", .0.display())]
    FilesystemDenied(PathBuf),

    /// Procedure is malformed
    #[error("invalid procedure: {0}")]
    InvalidProcedure(String),

    /// Artifact could not be parsed in the declared format
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Session cancelled the run
    #[error("extraction cancelled")]
    Cancelled,

    /// Artifact could not be read
    #[error("artifact read failed: {0}")]
    Io(#[from] std::io::Error),

    /// Worker thread died
    #[error("extraction worker failed: {0}")]
    Worker(String),
}

impl SandboxError {
    /// Whether a narrower procedure might succeed
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::OversizedOutput { .. })
    }

    /// Exit status recorded in the audit event
    #[must_use]
    pub fn exit_status(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::OversizedOutput { .. } => "oversized_output",
            Self::NetworkDenied(_) => "network_denied",
            Self::FilesystemDenied(_) => "filesystem_denied",
            Self::InvalidProcedure(_) => "invalid_procedure",
            Self::InvalidInput(_) => "invalid_input",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io_error",
            Self::Worker(_) => "worker_failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_budget_errors_retry() {
        assert!(SandboxError::Timeout(Duration::from_secs(30)).is_retryable());
        assert!(SandboxError::OversizedOutput { bytes: 2, limit: 1 }.is_retryable());
        assert!(!SandboxError::NetworkDenied("http://x".into()).is_retryable());
        assert!(!SandboxError::Cancelled.is_retryable());
    }
}
