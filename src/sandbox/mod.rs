//! Sandbox Module
//!
//! Isolated, crash-contained, time-bounded execution of untrusted
//! verification payloads against read-only artifact snapshots.

mod program;
mod runner;

pub use program::{evaluate_checks, run_script};
pub use runner::{SandboxMetrics, SandboxRunner, VerificationJob};
