//! Runtime configuration
//!
//! Loading order: built-in defaults, then `config/stepwise.toml` if present,
//! then an explicit file, then `STEPWISE__*` environment variables (double
//! underscore separates nesting, e.g. `STEPWISE__GATE__THRESHOLD_BYTES=65536`).

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Hard ceiling on plan length
pub const MAX_PLAN_STEPS: usize = 10;
/// Hard ceiling on replans per plan
pub const MAX_REPLANS: u32 = 3;

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepwiseConfig {
    /// Plan and step budgets
    pub limits: LimitsSection,
    /// Content-length gate
    pub gate: GateSection,
    /// Extraction sandbox
    pub sandbox: SandboxSection,
    /// Memory gateway
    pub memory: MemorySection,
    /// Temp store
    pub temp: TempSection,
    /// HTTP boundary
    pub server: ServerSection,
    /// Logging
    pub telemetry: TelemetrySection,
}

/// `[limits]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsSection {
    /// Maximum steps in a plan
    pub max_steps: usize,
    /// Maximum replans per plan
    pub max_replans: u32,
    /// Wall-clock budget for one step
    pub step_timeout_secs: u64,
    /// Executors allowed in flight across runs
    pub max_concurrent_executors: usize,
}

impl Default for LimitsSection {
    fn default() -> Self {
        Self {
            max_steps: MAX_PLAN_STEPS,
            max_replans: MAX_REPLANS,
            step_timeout_secs: 120,
            max_concurrent_executors: 4,
        }
    }
}

/// `[gate]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateSection {
    /// Responses at or above this many bytes go through extraction
    pub threshold_bytes: usize,
    /// Lines sampled from a staged artifact to infer its shape
    pub sample_lines: usize,
}

impl Default for GateSection {
    fn default() -> Self {
        Self {
            threshold_bytes: 50 * 1024,
            sample_lines: 20,
        }
    }
}

/// `[sandbox]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxSection {
    /// Wall-clock limit per procedure
    pub timeout_secs: u64,
    /// Output cap in bytes
    pub max_output_bytes: usize,
    /// Narrow-and-retry attempts after the first run, per step
    pub extraction_retries: u32,
}

impl Default for SandboxSection {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_output_bytes: 500 * 1024,
            extraction_retries: 2,
        }
    }
}

/// `[memory]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemorySection {
    /// Wait for a contended lock before failing
    pub lock_wait_ms: u64,
    /// Lock lifetime if never released
    pub lock_ttl_secs: u64,
    /// Entry lifetime
    pub entry_ttl_secs: u64,
}

impl Default for MemorySection {
    fn default() -> Self {
        Self {
            lock_wait_ms: 5_000,
            lock_ttl_secs: 30,
            entry_ttl_secs: 86_400,
        }
    }
}

/// `[temp]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TempSection {
    /// Fallback sweep age for staged artifacts
    pub sweep_after_secs: u64,
    /// Maximum staged artifacts held at once
    pub max_artifacts: u64,
}

impl Default for TempSection {
    fn default() -> Self {
        Self {
            sweep_after_secs: 3_600,
            max_artifacts: 1_024,
        }
    }
}

/// `[server]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    /// Listen address
    pub bind: String,
    /// Skill provider base URL
    pub skill_endpoint: Option<String>,
    /// Decision service base URL (planner and step agent)
    pub decision_endpoint: Option<String>,
    /// Outbound request timeout
    pub request_timeout_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8080".to_string(),
            skill_endpoint: None,
            decision_endpoint: None,
            request_timeout_secs: 60,
        }
    }
}

/// `[telemetry]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySection {
    /// `EnvFilter` directive
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for TelemetrySection {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

impl StepwiseConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from files and environment
    ///
    /// # Errors
    /// Returns `ConfigError` if a source cannot be read or a value is invalid
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/stepwise").required(false));

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("STEPWISE")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: Self = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        tracing::debug!(
            max_steps = cfg.limits.max_steps,
            threshold_bytes = cfg.gate.threshold_bytes,
            "configuration loaded"
        );
        Ok(cfg)
    }

    /// Check ranges
    ///
    /// # Errors
    /// Returns `ConfigError::Invalid` naming the first bad key
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.limits.max_steps == 0 || self.limits.max_steps > MAX_PLAN_STEPS {
            return Err(ConfigError::invalid(
                "limits.max_steps",
                format!("must be 1..={MAX_PLAN_STEPS}"),
            ));
        }
        if self.limits.max_replans > MAX_REPLANS {
            return Err(ConfigError::invalid(
                "limits.max_replans",
                format!("must be at most {MAX_REPLANS}"),
            ));
        }
        if self.limits.max_concurrent_executors == 0 {
            return Err(ConfigError::invalid("limits.max_concurrent_executors", "must be positive"));
        }
        if self.gate.threshold_bytes == 0 || self.gate.sample_lines == 0 {
            return Err(ConfigError::invalid("gate", "threshold and sample size must be positive"));
        }
        if self.sandbox.max_output_bytes == 0 || self.sandbox.timeout_secs == 0 {
            return Err(ConfigError::invalid("sandbox", "timeout and output cap must be positive"));
        }
        if self.memory.lock_ttl_secs == 0 {
            return Err(ConfigError::invalid("memory.lock_ttl_secs", "must be positive"));
        }
        Ok(())
    }

    /// With max steps
    #[inline]
    #[must_use]
    pub fn with_max_steps(mut self, max: usize) -> Self {
        self.limits.max_steps = max;
        self
    }

    /// With max replans
    #[inline]
    #[must_use]
    pub fn with_max_replans(mut self, max: u32) -> Self {
        self.limits.max_replans = max;
        self
    }

    /// With step timeout
    #[inline]
    #[must_use]
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.limits.step_timeout_secs = timeout.as_secs().max(1);
        self
    }

    /// With gate threshold
    #[inline]
    #[must_use]
    pub fn with_gate_threshold(mut self, bytes: usize) -> Self {
        self.gate.threshold_bytes = bytes;
        self
    }

    /// With sandbox output cap
    #[inline]
    #[must_use]
    pub fn with_sandbox_output_cap(mut self, bytes: usize) -> Self {
        self.sandbox.max_output_bytes = bytes;
        self
    }

    /// Step timeout as a duration
    #[inline]
    #[must_use]
    pub fn step_timeout(&self) -> Duration {
        Duration::from_secs(self.limits.step_timeout_secs)
    }

    /// Sandbox timeout as a duration
    #[inline]
    #[must_use]
    pub fn sandbox_timeout(&self) -> Duration {
        Duration::from_secs(self.sandbox.timeout_secs)
    }

    /// Lock wait as a duration
    #[inline]
    #[must_use]
    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.memory.lock_wait_ms)
    }

    /// Lock TTL as a duration
    #[inline]
    #[must_use]
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_secs(self.memory.lock_ttl_secs)
    }
}
