//! Stepwise extraction sandbox
//!
//! Reduces an oversized staged payload to the handful of fields a step's
//! return contract asks for. Procedures are declarative
//! ([`ExtractionProcedure`]) and run under [`Sandbox`] limits: no network,
//! scope-confined reads, a wall-clock deadline and an output cap.

pub mod error;
pub mod procedure;
pub mod runner;

pub use error::SandboxError;
pub use procedure::{ExtractionProcedure, FieldRule, InputFormat, Reduce, Source, DEFAULT_NARROW_LIMIT};
pub use runner::{ArtifactRef, Sandbox, SandboxLimits, SandboxReport};
