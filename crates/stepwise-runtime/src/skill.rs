//! Skill provider seam
//!
//! Skills are remote capabilities, already scoped to the caller by the
//! provider. The runtime sees them through:
//! - [`SkillClient`]: performs one call, injected at construction
//! - [`SkillCatalog`]: declares which output fields each skill can produce
//!
//! The catalog is what planners verify return contracts against.

use crate::error::SkillError;
use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use stepwise_core::{Credential, Identity, ReturnSpec};

/// One skill invocation
#[derive(Debug, Clone)]
pub struct SkillRequest {
    /// Skill name
    pub skill_id: String,
    /// Call arguments
    pub arguments: Value,
    /// Caller identity, forwarded to the provider
    pub identity: Identity,
    /// Forwarded credential (redacted in every output)
    pub credential: Option<Credential>,
}

impl SkillRequest {
    /// Encoded argument size
    #[must_use]
    pub fn request_bytes(&self) -> usize {
        serde_json::to_vec(&self.arguments).map_or(0, |b| b.len())
    }
}

/// Performs skill calls
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SkillClient: Send + Sync {
    /// Call a skill, returning its raw response body
    async fn call(&self, request: &SkillRequest) -> Result<String, SkillError>;
}

/// Declared output capability of a skill
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillDescriptor {
    /// Skill name
    pub name: String,
    /// Output fields the skill can produce
    pub output_fields: BTreeSet<String>,
    /// Free-form description for planners
    #[serde(default)]
    pub description: String,
}

impl SkillDescriptor {
    /// Create descriptor
    #[must_use]
    pub fn new<I, S>(name: impl Into<String>, output_fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            output_fields: output_fields.into_iter().map(Into::into).collect(),
            description: String::new(),
        }
    }

    /// With description
    #[inline]
    #[must_use]
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Registry of skill capabilities
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkillCatalog {
    skills: IndexMap<String, SkillDescriptor>,
}

impl SkillCatalog {
    /// Empty catalog
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// With a skill
    #[must_use]
    pub fn with_skill(mut self, descriptor: SkillDescriptor) -> Self {
        self.register(descriptor);
        self
    }

    /// Add or replace a skill
    pub fn register(&mut self, descriptor: SkillDescriptor) {
        self.skills.insert(descriptor.name.clone(), descriptor);
    }

    /// Descriptor by name
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SkillDescriptor> {
        self.skills.get(name)
    }

    /// All descriptors in registration order
    pub fn iter(&self) -> impl Iterator<Item = &SkillDescriptor> {
        self.skills.values()
    }

    /// Union of declared output fields over a skill set
    #[must_use]
    pub fn output_fields<S: AsRef<str>>(&self, skills: &[S]) -> BTreeSet<&str> {
        skills
            .iter()
            .filter_map(|s| self.skills.get(s.as_ref()))
            .flat_map(|d| d.output_fields.iter().map(String::as_str))
            .collect()
    }

    /// Contract fields none of the skills declares, sorted
    #[must_use]
    pub fn missing_fields<S: AsRef<str>>(&self, skills: &[S], spec: &ReturnSpec) -> Vec<String> {
        let available = self.output_fields(skills);
        let mut missing: Vec<String> = spec
            .field_names()
            .filter(|f| !available.contains(f))
            .map(str::to_string)
            .collect();
        missing.sort();
        missing
    }
}

/// Whether a skill name asks for another agent to be started
#[must_use]
pub fn is_spawn_shaped(skill: &str) -> bool {
    let lower = skill.to_ascii_lowercase();
    lower.contains("spawn") || lower.contains("subagent") || lower.contains("sub_agent")
}
