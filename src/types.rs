//! Metamorph - Type Definitions
//!
//! All shared types for the self-modification execution core: artifacts,
//! checkpoints, tool descriptors, change sets, approvals, and the cycle
//! record threaded through one pass of the state machine.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;

// ---- Artifacts -------------------------------------------------------------

/// Content class of a stored artifact.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Text,
    Binary,
    Json,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ArtifactKind::Text => "text",
            ArtifactKind::Binary => "binary",
            ArtifactKind::Json => "json",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(ArtifactKind::Text),
            "binary" => Some(ArtifactKind::Binary),
            "json" => Some(ArtifactKind::Json),
            _ => None,
        }
    }
}

/// A named, versioned unit of persisted content. Owned exclusively by the
/// artifact store; every other component references artifacts by path.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub path: String,
    #[serde(with = "content_b64")]
    pub content: Vec<u8>,
    pub kind: ArtifactKind,
    pub version: u64,
    pub updated_at: String,
}

impl Artifact {
    /// Content as UTF-8 text, lossy for binary artifacts.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).to_string()
    }
}

/// Base64 (de)serialization for artifact content bytes.
mod content_b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

/// An immutable, named reference to the version of every artifact at
/// creation time. Version pinning, not a deep copy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub label: String,
    pub created_at: String,
    pub snapshot: BTreeMap<String, u64>,
}

/// A deep-copied value view of artifact content, handed to `update_atomic`
/// updaters and to sandboxed verification. Detached from the store: edits
/// here touch nothing until the store validates and commits them.
#[derive(Clone, Debug, Default)]
pub struct StoreSnapshot {
    pub artifacts: BTreeMap<String, SnapshotEntry>,
}

#[derive(Clone, Debug)]
pub struct SnapshotEntry {
    pub content: Vec<u8>,
    pub kind: ArtifactKind,
}

impl StoreSnapshot {
    pub fn get(&self, path: &str) -> Option<&SnapshotEntry> {
        self.artifacts.get(path)
    }

    pub fn text(&self, path: &str) -> Option<String> {
        self.artifacts
            .get(path)
            .map(|e| String::from_utf8_lossy(&e.content).to_string())
    }

    pub fn set(&mut self, path: &str, content: Vec<u8>, kind: ArtifactKind) {
        self.artifacts
            .insert(path.to_string(), SnapshotEntry { content, kind });
    }

    pub fn remove(&mut self, path: &str) -> bool {
        self.artifacts.remove(path).is_some()
    }
}

/// Per-instance mutation counters for the artifact store. Owned by the
/// store and read by whoever holds it; there is no process-wide state.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreMetrics {
    pub writes: u64,
    pub deletes: u64,
    pub checkpoints_created: u64,
    pub rollbacks: u64,
}

// ---- Tool System -----------------------------------------------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToolCategory {
    Read,
    Write,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum SafetyLevel {
    Low,
    Medium,
    High,
    Critical,
}

/// Static description of one dispatchable operation. The descriptor table
/// is loaded at startup and immutable for the lifetime of a run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    pub category: ToolCategory,
    pub safety_level: SafetyLevel,
    pub requires_approval: bool,
    pub creates_checkpoint: bool,
    pub input_schema: Value,
}

/// A request to run one named operation with JSON arguments.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    pub tool: String,
    pub args: Value,
    pub requested_at: String,
}

impl ToolInvocation {
    pub fn new(tool: &str, args: Value) -> Self {
        Self {
            tool: tool.to_string(),
            args,
            requested_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Structured failure payload carried inside a [`ToolResult`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
}

/// Outcome of a dispatch. Failures are structured data, never a panic or
/// an error escaping the engine boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn ok(data: Value, checkpoint_id: Option<String>, duration_ms: u64) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            checkpoint_id,
            duration_ms,
        }
    }

    pub fn fail(
        kind: ErrorKind,
        message: impl Into<String>,
        checkpoint_id: Option<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ToolError {
                kind,
                message: message.into(),
                checkpoint_id: checkpoint_id.clone(),
            }),
            checkpoint_id,
            duration_ms,
        }
    }
}

// ---- Change Sets -----------------------------------------------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeOp {
    Create,
    Modify,
    Delete,
}

/// One proposed operation against an artifact. `content` is UTF-8 text
/// for text/json artifacts and base64 for binary ones.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedChange {
    pub op: ChangeOp,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ArtifactKind>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verify: Option<VerifySpec>,
}

/// An ordered list of proposed operations, produced by the reasoning
/// collaborator. Untrusted until it passes the change-set schema gate.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposedChangeSet {
    pub changes: Vec<ProposedChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

// ---- Verification ----------------------------------------------------------

/// A closed set of typed verification checks. `Script` is the dynamic
/// path: a payload interpreted inside the sandbox, never in-process.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum VerifyCheck {
    Exists { path: String },
    Equals { path: String, expected: String },
    Contains { path: String, needle: String },
    Matches { path: String, pattern: String },
    ParsesJson { path: String },
    Script { source: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VerifySpec {
    pub checks: Vec<VerifyCheck>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Result of one sandboxed verification run.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verdict {
    pub success: bool,
    pub results: Vec<CheckResult>,
    pub output: Vec<String>,
    pub errors: Vec<String>,
}

// ---- Approvals -------------------------------------------------------------

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    TimedOut,
}

/// A gated decision raised by any component. Consumed exactly once, then
/// removed from the pending set and recorded in the history ring.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub id: String,
    pub capability: String,
    pub action: String,
    pub payload: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub status: ApprovalStatus,
    pub requested_at: String,
}

/// The decision sent back over the approval channel.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ApprovalDecision {
    Approve {
        #[serde(skip_serializing_if = "Option::is_none")]
        data: Option<Value>,
    },
    Reject {
        #[serde(skip_serializing_if = "Option::is_none")]
        feedback: Option<String>,
    },
}

/// What the requester observes once the request resolves.
#[derive(Clone, Debug, PartialEq)]
pub enum ApprovalOutcome {
    Approved(Option<Value>),
    Rejected(Option<String>),
    TimedOut,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStats {
    pub approved: u64,
    pub rejected: u64,
    pub timed_out: u64,
}

/// One resolved request as kept in the bounded history ring.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRecord {
    pub id: String,
    pub capability: String,
    pub action: String,
    pub status: ApprovalStatus,
    pub resolved_at: String,
}

// ---- Cycle -----------------------------------------------------------------

/// One unit of work submitted to the state machine.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Goal {
    pub id: String,
    pub description: String,
    /// Path prefixes the curation step should gather. Empty means all.
    #[serde(default)]
    pub context_paths: Vec<String>,
}

impl Goal {
    pub fn new(description: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            description: description.to_string(),
            context_paths: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    CuratingContext,
    AwaitingContextApproval,
    Planning,
    GeneratingProposal,
    AwaitingProposalApproval,
    ApplyingChangeset,
    Reflecting,
}

/// One applied (or attempted) change, recorded for the cycle outcome.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedChange {
    pub op: ChangeOp,
    pub path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checkpoint_id: Option<String>,
}

/// The mutable record threaded through one pass of the state machine.
/// Created at cycle start, owned by the cycle runner, archived to the
/// log at cycle end.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleContext {
    pub goal: Goal,
    pub curated_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proposed: Option<ProposedChangeSet>,
    pub approval_status: ApprovalStatus,
    pub applied_changes: Vec<AppliedChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_checkpoint_id: Option<String>,
    pub started_at: String,
}

impl CycleContext {
    pub fn new(goal: Goal) -> Self {
        Self {
            goal,
            curated_paths: Vec::new(),
            proposed: None,
            approval_status: ApprovalStatus::Pending,
            applied_changes: Vec::new(),
            last_checkpoint_id: None,
            started_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

/// Recorded in reflection at the end of every cycle.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleOutcome {
    pub goal_id: String,
    pub success: bool,
    pub cancelled: bool,
    pub applied: Vec<AppliedChange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ToolError>,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    pub finished_at: String,
}

/// Knobs governing autonomy and gating for the cycle runner.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CyclePolicy {
    /// When set, context curation auto-advances to planning with no human
    /// involved. This is the only transition allowed to bypass approval.
    pub autonomous_context: bool,
    pub max_iterations_per_goal: u32,
    pub max_queued_goals: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_timeout_ms: Option<u64>,
}

impl Default for CyclePolicy {
    fn default() -> Self {
        Self {
            autonomous_context: false,
            max_iterations_per_goal: 3,
            max_queued_goals: 8,
            approval_timeout_ms: None,
        }
    }
}

// ---- Reasoning Collaborator ------------------------------------------------

/// The external reasoning process that decides what change to propose.
/// Its output is untrusted JSON and must pass the change-set schema gate
/// before any use.
#[async_trait]
pub trait ReasoningClient: Send + Sync {
    async fn propose_change_set(
        &self,
        goal: &Goal,
        context: &StoreSnapshot,
    ) -> anyhow::Result<Value>;
}

// ---- Configuration ---------------------------------------------------------

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    pub db_path: String,
    pub log_level: LogLevel,
    pub autonomous_context: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_timeout_ms: Option<u64>,
    pub sandbox_timeout_ms: u64,
    pub max_iterations_per_goal: u32,
    pub max_queued_goals: usize,
    pub version: String,
}

/// Defaults for operational fields; callers override what they need.
pub fn default_config() -> CoreConfig {
    CoreConfig {
        db_path: "~/.metamorph/core.db".to_string(),
        log_level: LogLevel::Info,
        autonomous_context: false,
        approval_timeout_ms: None,
        sandbox_timeout_ms: 5_000,
        max_iterations_per_goal: 3,
        max_queued_goals: 8,
        version: "0.1.0".to_string(),
    }
}
