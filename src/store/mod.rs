//! Artifact Store Module
//!
//! Versioned, checkpointable artifact storage. The store is the single
//! shared mutable resource of the core; all mutation flows through
//! `update_atomic` or the checkpoint/rollback pair.

mod artifacts;
mod schema;

pub use artifacts::{content_hash, validate_path, ArtifactStore};
pub use schema::{CREATE_TABLES, SCHEMA_VERSION};
