//! Tool Dispatch Engine
//!
//! Resolves a named operation to a trusted built-in handler or a
//! sandboxed verification run. Ordering is fixed: checkpoint before
//! handler execution, rollback before returning control. No error
//! escapes `dispatch`; every failure is a structured result.

use std::sync::{Arc, Mutex};
use std::time::Instant;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::changeset::change_content_bytes;
use crate::cycle::ApprovalBroker;
use crate::error::{CoreError, CoreResult, ErrorKind};
use crate::sandbox::{SandboxRunner, VerificationJob};
use crate::store::{validate_path, ArtifactStore};
use crate::types::{
    ApprovalOutcome, ArtifactKind, ChangeOp, ProposedChange, ToolCategory, ToolDescriptor,
    ToolInvocation, ToolResult, Verdict, VerifyCheck, VerifySpec,
};

use super::descriptors::{builtin_descriptors, handler_for, validate_args, BuiltinHandler};

/// Per-instance dispatch counters.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineMetrics {
    pub dispatched: u64,
    pub failed: u64,
    pub rolled_back: u64,
}

pub struct DispatchEngine {
    store: Arc<Mutex<ArtifactStore>>,
    sandbox: Arc<SandboxRunner>,
    approvals: ApprovalBroker,
    approval_timeout_ms: Option<u64>,
    descriptors: Vec<ToolDescriptor>,
    metrics: Mutex<EngineMetrics>,
}

impl DispatchEngine {
    pub fn new(
        store: Arc<Mutex<ArtifactStore>>,
        sandbox: Arc<SandboxRunner>,
        approvals: ApprovalBroker,
        approval_timeout_ms: Option<u64>,
    ) -> Self {
        Self {
            store,
            sandbox,
            approvals,
            approval_timeout_ms,
            descriptors: builtin_descriptors(),
            metrics: Mutex::new(EngineMetrics::default()),
        }
    }

    pub fn descriptors(&self) -> &[ToolDescriptor] {
        &self.descriptors
    }

    pub fn metrics(&self) -> EngineMetrics {
        *self.metrics.lock().expect("engine metrics lock")
    }

    /// Dispatch one invocation. The caller never observes a half-applied
    /// write: any checkpoint opened for the call is rolled back before a
    /// failure result is returned.
    pub async fn dispatch(&self, invocation: ToolInvocation) -> ToolResult {
        {
            let mut metrics = self.metrics.lock().expect("engine metrics lock");
            metrics.dispatched += 1;
        }

        let start = Instant::now();
        let result = self.dispatch_inner(&invocation, start).await;

        if result.success {
            info!(tool = %invocation.tool, duration_ms = result.duration_ms, "dispatch ok");
        } else {
            let mut metrics = self.metrics.lock().expect("engine metrics lock");
            metrics.failed += 1;
            if let Some(ref error) = result.error {
                warn!(tool = %invocation.tool, kind = %error.kind, "dispatch failed: {}", error.message);
            }
        }
        result
    }

    async fn dispatch_inner(&self, invocation: &ToolInvocation, start: Instant) -> ToolResult {
        let descriptor = match self.descriptors.iter().find(|d| d.name == invocation.tool) {
            Some(descriptor) => descriptor,
            None => {
                return ToolResult::fail(
                    ErrorKind::NotFound,
                    format!("unknown tool: {}", invocation.tool),
                    None,
                    elapsed_ms(start),
                )
            }
        };

        // Mandatory schema gate, before any mutation.
        if let Err(err) = validate_args(&descriptor.input_schema, &invocation.args) {
            return ToolResult::fail(err.kind(), err.to_string(), None, elapsed_ms(start));
        }

        // Checkpoint creation always precedes handler execution.
        let mut checkpoint_id: Option<String> = None;
        if descriptor.category == ToolCategory::Write && descriptor.creates_checkpoint {
            let created = {
                let mut store = self.store.lock().expect("artifact store lock");
                store.create_checkpoint(&format!("auto:{}", descriptor.name))
            };
            match created {
                Ok(checkpoint) => checkpoint_id = Some(checkpoint.id),
                Err(err) => {
                    return ToolResult::fail(err.kind(), err.to_string(), None, elapsed_ms(start))
                }
            }
        }

        if descriptor.requires_approval {
            let payload = json!({
                "tool": descriptor.name,
                "safetyLevel": descriptor.safety_level,
                "args": invocation.args,
            });
            let outcome = self
                .approvals
                .request(
                    &format!("tool:{}", descriptor.name),
                    &descriptor.name,
                    payload,
                    self.approval_timeout_ms,
                )
                .await;
            match outcome {
                ApprovalOutcome::Approved(_) => {}
                ApprovalOutcome::Rejected(feedback) => {
                    return ToolResult::fail(
                        ErrorKind::Rejected,
                        feedback.unwrap_or_else(|| "approval rejected".to_string()),
                        checkpoint_id,
                        elapsed_ms(start),
                    );
                }
                ApprovalOutcome::TimedOut => {
                    return ToolResult::fail(
                        ErrorKind::Rejected,
                        "approval request timed out",
                        checkpoint_id,
                        elapsed_ms(start),
                    );
                }
            }
        }

        let handler = handler_for(&descriptor.name)
            .expect("descriptor table and handler table stay in sync");

        match self.execute_handler(handler, &invocation.args).await {
            Ok((data, verify)) => {
                if let (Some(cp_id), Some(spec)) = (checkpoint_id.clone(), verify) {
                    if let Err(err) = self.run_verification(&spec).await {
                        return self.rollback_and_fail(&cp_id, err, elapsed_ms(start));
                    }
                }
                ToolResult::ok(data, checkpoint_id, elapsed_ms(start))
            }
            Err(err) => match checkpoint_id {
                Some(cp_id) => self.rollback_and_fail(&cp_id, err, elapsed_ms(start)),
                None => ToolResult::fail(err.kind(), err.to_string(), None, elapsed_ms(start)),
            },
        }
    }

    // ---- Handlers ----------------------------------------------------------

    /// Trusted in-process handlers. The second tuple element is an
    /// attached verification spec to run after a checkpointed write.
    async fn execute_handler(
        &self,
        handler: BuiltinHandler,
        args: &Value,
    ) -> CoreResult<(Value, Option<VerifySpec>)> {
        match handler {
            BuiltinHandler::ReadArtifact => {
                let path = required_str(args, "path")?;
                let artifact = {
                    let store = self.store.lock().expect("artifact store lock");
                    store.read(path)?
                };
                Ok((serde_json::to_value(&artifact)?, None))
            }

            BuiltinHandler::ListArtifacts => {
                let prefix = args.get("prefix").and_then(|v| v.as_str());
                let mut paths = {
                    let store = self.store.lock().expect("artifact store lock");
                    store.list_paths()?
                };
                if let Some(prefix) = prefix {
                    paths.retain(|p| p.starts_with(prefix));
                }
                Ok((json!({ "paths": paths }), None))
            }

            BuiltinHandler::ListCheckpoints => {
                let checkpoints = {
                    let store = self.store.lock().expect("artifact store lock");
                    store.list_checkpoints()?
                };
                let summaries: Vec<Value> = checkpoints
                    .iter()
                    .map(|c| {
                        json!({
                            "id": c.id,
                            "label": c.label,
                            "createdAt": c.created_at,
                            "artifacts": c.snapshot.len(),
                        })
                    })
                    .collect();
                Ok((json!({ "checkpoints": summaries }), None))
            }

            BuiltinHandler::CreateCheckpoint => {
                let label = required_str(args, "label")?;
                let checkpoint = {
                    let mut store = self.store.lock().expect("artifact store lock");
                    store.create_checkpoint(label)?
                };
                Ok((
                    json!({
                        "id": checkpoint.id,
                        "label": checkpoint.label,
                        "createdAt": checkpoint.created_at,
                        "artifacts": checkpoint.snapshot.len(),
                    }),
                    None,
                ))
            }

            BuiltinHandler::WriteArtifact => {
                let path = required_str(args, "path")?;
                let content = required_str(args, "content")?;
                let kind = args
                    .get("kind")
                    .and_then(|v| v.as_str())
                    .and_then(ArtifactKind::parse)
                    .unwrap_or(ArtifactKind::Text);
                let bytes = match kind {
                    ArtifactKind::Binary => BASE64.decode(content).map_err(|e| {
                        CoreError::Validation(format!("invalid base64 content for {path}: {e}"))
                    })?,
                    ArtifactKind::Text | ArtifactKind::Json => content.as_bytes().to_vec(),
                };
                let version = {
                    let mut store = self.store.lock().expect("artifact store lock");
                    store.write(path, &bytes, kind)?
                };
                Ok((
                    json!({ "path": path, "version": version }),
                    parse_verify(args)?,
                ))
            }

            BuiltinHandler::ApplyChange => {
                let change: ProposedChange = serde_json::from_value(args.clone())?;
                validate_path(&change.path)?;

                let data = match change.op {
                    ChangeOp::Create => {
                        let bytes = change_content_bytes(&change)?;
                        let kind = change.kind.unwrap_or(ArtifactKind::Text);
                        let version = {
                            let mut store = self.store.lock().expect("artifact store lock");
                            store.write(&change.path, &bytes, kind)?
                        };
                        json!({ "op": "CREATE", "path": change.path, "version": version })
                    }
                    ChangeOp::Modify => {
                        let bytes = change_content_bytes(&change)?;
                        let version = {
                            let mut store = self.store.lock().expect("artifact store lock");
                            // MODIFY requires the path to already exist.
                            let existing = store.read(&change.path)?;
                            let kind = change.kind.unwrap_or(existing.kind);
                            store.write(&change.path, &bytes, kind)?
                        };
                        json!({ "op": "MODIFY", "path": change.path, "version": version })
                    }
                    ChangeOp::Delete => {
                        let mut store = self.store.lock().expect("artifact store lock");
                        store.delete(&change.path)?;
                        json!({ "op": "DELETE", "path": change.path })
                    }
                };
                Ok((data, change.verify))
            }

            BuiltinHandler::DeleteArtifact => {
                let path = required_str(args, "path")?;
                {
                    let mut store = self.store.lock().expect("artifact store lock");
                    store.delete(path)?;
                }
                Ok((json!({ "deleted": path }), None))
            }

            BuiltinHandler::Rollback => {
                let checkpoint_id = required_str(args, "checkpointId")?;
                let applied = {
                    let mut store = self.store.lock().expect("artifact store lock");
                    store.rollback(checkpoint_id)?
                };
                Ok((
                    json!({ "checkpointId": checkpoint_id, "applied": applied }),
                    None,
                ))
            }

            BuiltinHandler::Verify => {
                let checks: Vec<VerifyCheck> = serde_json::from_value(args["checks"].clone())?;
                let timeout_ms = args.get("timeoutMs").and_then(|v| v.as_u64());
                let snapshot = {
                    let store = self.store.lock().expect("artifact store lock");
                    match args.get("paths").and_then(|v| v.as_array()) {
                        Some(paths) => {
                            let selection: Vec<&str> =
                                paths.iter().filter_map(|v| v.as_str()).collect();
                            store.snapshot(Some(&selection))?
                        }
                        None => store.snapshot(None)?,
                    }
                };

                let verdict = self
                    .sandbox
                    .verify(VerificationJob {
                        checks,
                        snapshot,
                        timeout_ms,
                    })
                    .await?;

                if verdict.success {
                    Ok((serde_json::to_value(&verdict)?, None))
                } else {
                    Err(CoreError::VerificationFailed {
                        reason: summarize_verdict(&verdict),
                        checkpoint_id: None,
                    })
                }
            }
        }
    }

    // ---- Verification & Rollback -------------------------------------------

    /// Run an attached verification spec against a read-only snapshot of
    /// the post-write state.
    async fn run_verification(&self, spec: &VerifySpec) -> CoreResult<()> {
        let snapshot = {
            let store = self.store.lock().expect("artifact store lock");
            store.snapshot(None)?
        };
        let verdict = self
            .sandbox
            .verify(VerificationJob {
                checks: spec.checks.clone(),
                snapshot,
                timeout_ms: spec.timeout_ms,
            })
            .await?;

        if verdict.success {
            Ok(())
        } else {
            Err(CoreError::VerificationFailed {
                reason: summarize_verdict(&verdict),
                checkpoint_id: None,
            })
        }
    }

    /// Roll the store back to `checkpoint_id`, then surface `err` with
    /// the checkpoint attached for audit. A failing rollback outranks
    /// the original error.
    fn rollback_and_fail(&self, checkpoint_id: &str, err: CoreError, duration_ms: u64) -> ToolResult {
        let rolled_back = {
            let mut store = self.store.lock().expect("artifact store lock");
            store.rollback(checkpoint_id)
        };

        match rolled_back {
            Ok(_) => {
                let mut metrics = self.metrics.lock().expect("engine metrics lock");
                metrics.rolled_back += 1;
            }
            Err(CoreError::Integrity(detail)) => {
                return ToolResult::fail(
                    ErrorKind::Integrity,
                    detail,
                    Some(checkpoint_id.to_string()),
                    duration_ms,
                );
            }
            Err(other) => {
                return ToolResult::fail(
                    ErrorKind::ExecutionFailed,
                    format!("rollback of {checkpoint_id} failed: {other}"),
                    Some(checkpoint_id.to_string()),
                    duration_ms,
                );
            }
        }

        let message = match &err {
            CoreError::VerificationFailed { reason, .. } => reason.clone(),
            other => other.to_string(),
        };
        ToolResult::fail(err.kind(), message, Some(checkpoint_id.to_string()), duration_ms)
    }
}

// ---- Helpers ---------------------------------------------------------------

fn elapsed_ms(start: Instant) -> u64 {
    start.elapsed().as_millis() as u64
}

fn required_str<'a>(args: &'a Value, key: &str) -> CoreResult<&'a str> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| CoreError::Validation(format!("missing '{key}' argument")))
}

fn parse_verify(args: &Value) -> CoreResult<Option<VerifySpec>> {
    match args.get("verify") {
        Some(raw) if !raw.is_null() => Ok(Some(serde_json::from_value(raw.clone())?)),
        _ => Ok(None),
    }
}

fn summarize_verdict(verdict: &Verdict) -> String {
    let mut failed: Vec<String> = verdict
        .results
        .iter()
        .filter(|r| !r.passed)
        .map(|r| r.name.clone())
        .collect();
    failed.extend(verdict.errors.iter().cloned());
    if failed.is_empty() {
        "verification reported failure".to_string()
    } else {
        format!("checks failed: {}", failed.join(", "))
    }
}
