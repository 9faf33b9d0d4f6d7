//! Cycle Module
//!
//! The approval-gated state machine driving curate -> plan -> propose ->
//! approve -> apply -> reflect, plus the broker that routes every gated
//! decision to the approval surface.

mod approvals;
mod machine;

pub use approvals::{ApprovalBroker, DEFAULT_HISTORY_CAPACITY};
pub use machine::{CycleRunner, StateChangeCallback};
