//! Stepwise server
//!
//! HTTP boundary for the orchestrator:
//! - [`app`]: axum routes and error mapping
//! - [`remote`]: skill provider and decision service over HTTP
//! - [`offline`]: local stand-ins used when no endpoint is configured

pub mod app;
pub mod offline;
pub mod remote;

pub use app::{router, ApiError, AppState};

use std::sync::Arc;
use stepwise_core::StepwiseConfig;
use stepwise_runtime::{Orchestrator, Planner, RunError, SkillClient, SkillError, StepAgent};
use stepwise_store::EventLog;

/// Startup failures
#[derive(Debug, thiserror::Error)]
pub enum BootError {
    /// Skill listing could not be fetched
    #[error("skill catalog unavailable: {0}")]
    Catalog(#[from] SkillError),

    /// Orchestrator rejected the configuration
    #[error(transparent)]
    Orchestrator(#[from] RunError),
}

/// Wire the orchestrator from configuration
///
/// Remote clients are used for every configured endpoint; the offline
/// components fill in the rest.
///
/// # Errors
/// Returns `BootError` if the skill catalog cannot be fetched or the
/// configuration is rejected
pub async fn assemble(cfg: &StepwiseConfig) -> Result<AppState, BootError> {
    let timeout = std::time::Duration::from_secs(cfg.server.request_timeout_secs.max(1));

    let (skills, catalog): (Arc<dyn SkillClient>, _) = match &cfg.server.skill_endpoint {
        Some(endpoint) => {
            let client = remote::HttpSkillClient::new(endpoint.clone(), timeout);
            let catalog = client.catalog().await?;
            tracing::info!(endpoint = %endpoint, skills = catalog.iter().count(), "skill provider attached");
            (Arc::new(client), catalog)
        }
        None => {
            tracing::warn!("no skill endpoint configured, using built-in skills");
            (Arc::new(offline::LocalSkills), offline::catalog())
        }
    };

    let (planner, agent): (Arc<dyn Planner>, Arc<dyn StepAgent>) =
        match &cfg.server.decision_endpoint {
            Some(endpoint) => {
                tracing::info!(endpoint = %endpoint, "decision service attached");
                (
                    Arc::new(remote::HttpPlanner::new(endpoint.clone(), timeout)),
                    Arc::new(remote::HttpStepAgent::new(endpoint.clone(), timeout)),
                )
            }
            None => {
                tracing::warn!("no decision endpoint configured, using offline planner");
                (Arc::new(offline::KeywordPlanner), Arc::new(offline::TemplateAgent))
            }
        };

    let events = Arc::new(EventLog::new());
    let orchestrator = Orchestrator::builder(planner, agent, skills)
        .catalog(catalog)
        .config(cfg.clone())
        .events(events.clone())
        .build()?;

    Ok(AppState {
        orchestrator: Arc::new(orchestrator),
        events,
    })
}
