//! Tool Descriptors
//!
//! The static table of dispatchable operations. Loaded at startup,
//! immutable during a run. Argument payloads are validated against the
//! descriptor's JSON Schema before any handler runs.

use jsonschema::JSONSchema;
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};
use crate::types::{SafetyLevel, ToolCategory, ToolDescriptor};

/// The closed set of trusted in-process handlers. Dynamic verification
/// payloads never land here; they are forwarded to the sandbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuiltinHandler {
    ReadArtifact,
    ListArtifacts,
    ListCheckpoints,
    CreateCheckpoint,
    WriteArtifact,
    ApplyChange,
    DeleteArtifact,
    Rollback,
    Verify,
}

/// Resolve a tool name to its handler variant.
pub fn handler_for(name: &str) -> Option<BuiltinHandler> {
    match name {
        "read_artifact" => Some(BuiltinHandler::ReadArtifact),
        "list_artifacts" => Some(BuiltinHandler::ListArtifacts),
        "list_checkpoints" => Some(BuiltinHandler::ListCheckpoints),
        "checkpoint" => Some(BuiltinHandler::CreateCheckpoint),
        "write_artifact" => Some(BuiltinHandler::WriteArtifact),
        "apply_change" => Some(BuiltinHandler::ApplyChange),
        "delete_artifact" => Some(BuiltinHandler::DeleteArtifact),
        "rollback" => Some(BuiltinHandler::Rollback),
        "verify" => Some(BuiltinHandler::Verify),
        _ => None,
    }
}

/// Create the built-in descriptor table.
pub fn builtin_descriptors() -> Vec<ToolDescriptor> {
    vec![
        ToolDescriptor {
            name: "read_artifact".to_string(),
            description: "Read the current version of an artifact.".to_string(),
            category: ToolCategory::Read,
            safety_level: SafetyLevel::Low,
            requires_approval: false,
            creates_checkpoint: false,
            input_schema: json!({
                "type": "object",
                "required": ["path"],
                "properties": {
                    "path": { "type": "string", "minLength": 1 }
                }
            }),
        },
        ToolDescriptor {
            name: "list_artifacts".to_string(),
            description: "List artifact paths, optionally under a prefix.".to_string(),
            category: ToolCategory::Read,
            safety_level: SafetyLevel::Low,
            requires_approval: false,
            creates_checkpoint: false,
            input_schema: json!({
                "type": "object",
                "properties": {
                    "prefix": { "type": "string" }
                }
            }),
        },
        ToolDescriptor {
            name: "list_checkpoints".to_string(),
            description: "List all checkpoints with their labels.".to_string(),
            category: ToolCategory::Read,
            safety_level: SafetyLevel::Low,
            requires_approval: false,
            creates_checkpoint: false,
            input_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolDescriptor {
            name: "checkpoint".to_string(),
            description: "Create a named checkpoint of the current artifact versions.".to_string(),
            category: ToolCategory::Write,
            safety_level: SafetyLevel::Low,
            requires_approval: false,
            creates_checkpoint: false,
            input_schema: json!({
                "type": "object",
                "required": ["label"],
                "properties": {
                    "label": { "type": "string", "minLength": 1 }
                }
            }),
        },
        ToolDescriptor {
            name: "write_artifact".to_string(),
            description: "Write artifact content under an automatic checkpoint, optionally verified in the sandbox.".to_string(),
            category: ToolCategory::Write,
            safety_level: SafetyLevel::Medium,
            requires_approval: false,
            creates_checkpoint: true,
            input_schema: json!({
                "type": "object",
                "required": ["path", "content"],
                "properties": {
                    "path": { "type": "string", "minLength": 1 },
                    "content": { "type": "string" },
                    "kind": { "enum": ["text", "binary", "json"] },
                    "verify": { "type": "object" }
                }
            }),
        },
        ToolDescriptor {
            name: "apply_change".to_string(),
            description: "Apply one proposed change (create/modify/delete) under an automatic checkpoint.".to_string(),
            category: ToolCategory::Write,
            safety_level: SafetyLevel::High,
            requires_approval: false,
            creates_checkpoint: true,
            input_schema: json!({
                "type": "object",
                "required": ["op", "path", "reason"],
                "properties": {
                    "op": { "enum": ["CREATE", "MODIFY", "DELETE"] },
                    "path": { "type": "string", "minLength": 1 },
                    "content": { "type": ["string", "null"] },
                    "kind": { "enum": ["text", "binary", "json"] },
                    "reason": { "type": "string", "minLength": 1 },
                    "verify": { "type": "object" }
                }
            }),
        },
        ToolDescriptor {
            name: "delete_artifact".to_string(),
            description: "Delete an artifact. Approval-gated; history is retained.".to_string(),
            category: ToolCategory::Write,
            safety_level: SafetyLevel::High,
            requires_approval: true,
            creates_checkpoint: true,
            input_schema: json!({
                "type": "object",
                "required": ["path"],
                "properties": {
                    "path": { "type": "string", "minLength": 1 }
                }
            }),
        },
        ToolDescriptor {
            name: "rollback".to_string(),
            description: "Restore every artifact to the versions pinned by a checkpoint.".to_string(),
            category: ToolCategory::Write,
            safety_level: SafetyLevel::Critical,
            requires_approval: true,
            creates_checkpoint: false,
            input_schema: json!({
                "type": "object",
                "required": ["checkpointId"],
                "properties": {
                    "checkpointId": { "type": "string", "minLength": 1 }
                }
            }),
        },
        ToolDescriptor {
            name: "verify".to_string(),
            description: "Run verification checks against a read-only snapshot in the sandbox.".to_string(),
            category: ToolCategory::Read,
            safety_level: SafetyLevel::Medium,
            requires_approval: false,
            creates_checkpoint: false,
            input_schema: json!({
                "type": "object",
                "required": ["checks"],
                "properties": {
                    "checks": { "type": "array", "items": { "type": "object" } },
                    "paths": { "type": "array", "items": { "type": "string" } },
                    "timeoutMs": { "type": "integer", "minimum": 1 }
                }
            }),
        },
    ]
}

/// Validate an argument payload against a descriptor's input schema.
/// The mandatory gate before any handler, trusted or sandboxed, runs.
pub fn validate_args(schema: &Value, args: &Value) -> CoreResult<()> {
    let compiled = JSONSchema::compile(schema)
        .map_err(|e| CoreError::Validation(format!("tool input schema compile: {e}")))?;
    if let Err(errors) = compiled.validate(args) {
        let details: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(CoreError::Validation(format!(
            "invalid tool arguments: {}",
            details.join("; ")
        )));
    }
    Ok(())
}
