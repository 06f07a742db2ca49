//! Stepwise core
//!
//! Shared vocabulary for bounded plan orchestration:
//! - [`types`]: plans, steps, return contracts, run results
//! - [`lifecycle`]: plan and step state machines
//! - [`shape`]: the one return-contract validator
//! - [`event`]: audit events and sinks
//! - [`config`]: layered configuration
//! - [`telemetry`]: subscriber setup and metric names

pub mod config;
pub mod error;
pub mod event;
pub mod hash;
pub mod lifecycle;
pub mod secret;
pub mod shape;
pub mod telemetry;
pub mod types;

pub use config::{StepwiseConfig, MAX_PLAN_STEPS, MAX_REPLANS};
pub use error::{ConfigError, ContractViolation, LifecycleError, PlanError};
pub use event::{Event, EventKind, EventSink, Lineage, NullSink};
pub use hash::ContentHash;
pub use secret::Credential;
pub use types::{
    CompletedStep, FieldShape, FileId, Identity, LastFailure, Persona, Plan, PlanId, PlanStatus,
    ReplanRecord, ReplanTrigger, ReturnSpec, RunRequest, RunResponse, Step, StepStatus,
    StructuredFailure, TaskId,
};
