//! Stepwise storage
//!
//! Everything the orchestrator persists or stages:
//! - [`memory`]: contract-validated memory gateway with per-key locks
//! - [`plans`]: versioned plan repository
//! - [`temp`]: per-task staging for oversized payloads
//! - [`events`]: hash-chained audit log
//! - [`personas`]: tenant persona and policy documents
//!
//! All persistent state goes through the narrow [`DocumentStore`] trait.

pub mod document;
pub mod error;
pub mod events;
pub mod lock;
pub mod memory;
pub mod personas;
pub mod plans;
pub mod temp;

pub use document::{DocumentStore, InMemoryDocumentStore};
pub use error::{MemoryError, RepositoryError, StoreError, TempStoreError};
pub use events::{EventLog, IntegrityViolation};
pub use lock::LockTable;
pub use memory::{
    MemoryEntry, MemoryGateway, MemoryKind, MemoryQuery, NoteSaved, QueryScope, WriteReceipt,
    WriteTarget,
    DEFAULT_QUERY_LIMIT,
};
pub use personas::PersonaStore;
pub use plans::PlanRepository;
pub use temp::{StagedArtifact, TempStore};
