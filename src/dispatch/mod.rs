//! Tool Dispatch Module
//!
//! Capability-gated dispatch of named operations: a static descriptor
//! table, trusted built-in handlers, and the sandboxed path for
//! untrusted verification payloads.

mod descriptors;
mod engine;

pub use descriptors::{builtin_descriptors, handler_for, validate_args, BuiltinHandler};
pub use engine::{DispatchEngine, EngineMetrics};
