//! Stepwise runtime
//!
//! Bounded plan orchestration:
//! - [`orchestrator`]: plan lifecycle, the only holder of spawn authority
//! - [`planner`]: planner capability and plan validation
//! - [`executor`]: single-step execution behind a content-length gate
//! - [`replan`]: bounded recovery from step failures
//! - [`pool`]: executor tasks with bounded concurrency
//!
//! Decision logic (drafting plans, producing step outputs) is injected
//! through [`Planner`] and [`StepAgent`]; skills through [`SkillClient`].

pub mod context;
pub mod error;
pub mod executor;
pub mod gate;
pub mod journal;
pub mod orchestrator;
pub mod planner;
pub mod pool;
pub mod replan;
pub mod signal;
pub mod skill;
pub mod synthesis;

pub use context::{AgentOutcome, Remembered, StepAgent, StepAssignment, StepContext, StepServices};
pub use error::{ExecutorError, PlannerError, PoolError, RunError, SkillError};
pub use executor::{StepExecutor, StepOutcome, STEP_TIMEOUT};
pub use gate::{infer_format, ContentGate, ContractProjection, ProcedureDeriver, Route};
pub use journal::PlanJournal;
pub use orchestrator::{Orchestrator, OrchestratorBuilder, RunOptions, INVALID_IDENTITY};
pub use planner::{validate_plan, verify_return_specs, FailedStep, Planner, PlanningContext};
pub use pool::{ExecutorHandle, ExecutorPool, PoolStats, SpawnAuthority};
pub use replan::{ReplanController, ReplanDecision, StepFailure, REPLANS_EXHAUSTED};
pub use signal::{BroadcastBus, CancellationRegistry, Signal, SignalBus};
pub use skill::{is_spawn_shaped, SkillCatalog, SkillClient, SkillDescriptor, SkillRequest};
pub use synthesis::synthesize;
