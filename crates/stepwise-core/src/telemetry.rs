//! Logging setup and metric names

use crate::config::TelemetrySection;
use crate::error::ConfigError;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Counter: outputs rejected by their return contract
pub const CONTRACT_VIOLATIONS: &str = "stepwise_contract_violations_total";
/// Counter: replans triggered
pub const REPLANS: &str = "stepwise_replans_total";
/// Counter: responses routed through extraction
pub const LARGE_RESPONSES: &str = "stepwise_large_responses_total";
/// Counter: memory lock waits that timed out
pub const LOCK_TIMEOUTS: &str = "stepwise_lock_timeouts_total";
/// Counter: plans reaching a terminal status, labelled by status
pub const PLANS_FINISHED: &str = "stepwise_plans_finished_total";

/// Install the global subscriber
///
/// `RUST_LOG` takes precedence over the configured filter.
///
/// # Errors
/// Returns `ConfigError::Telemetry` if the filter is malformed or a
/// subscriber is already installed
pub fn init(settings: &TelemetrySection) -> Result<(), ConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&settings.filter)
            .map_err(|e| ConfigError::Telemetry(e.to_string()))?,
    };

    let json = settings.json.then(|| fmt::layer().json().with_current_span(true));
    let plain = (!settings.json).then(fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(json)
        .with(plain)
        .try_init()
        .map_err(|e| ConfigError::Telemetry(e.to_string()))
}
