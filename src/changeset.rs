//! Change-Set Validation and Bundle Exchange
//!
//! The reasoning collaborator returns untrusted JSON. Nothing downstream
//! touches it until it passes the schema gate here. The bundle format is
//! the interop surface: an ordered list of flat records that round-trips
//! back into an equivalent change set.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use jsonschema::JSONSchema;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};
use crate::store::validate_path;
use crate::types::{ArtifactKind, ChangeOp, ProposedChange, ProposedChangeSet};

/// JSON Schema for a proposed change set, the mandatory gate between the
/// reasoning collaborator and everything that mutates state.
pub fn change_set_schema() -> Value {
    json!({
        "type": "object",
        "required": ["changes"],
        "properties": {
            "changes": {
                "type": "array",
                "items": {
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
                }
            },
            "confidence": { "type": "number", "minimum": 0.0, "maximum": 1.0 }
        }
    })
}

/// Validate untrusted change-set JSON and parse it into a typed value.
///
/// Two layers: structural validation against [`change_set_schema`], then
/// semantic checks (path shape, content presence per operation). Fails
/// with `Validation` before any mutation can happen.
pub fn validate_change_set(raw: &Value) -> CoreResult<ProposedChangeSet> {
    let schema = change_set_schema();
    let compiled = JSONSchema::compile(&schema)
        .map_err(|e| CoreError::Validation(format!("change-set schema compile: {e}")))?;

    if let Err(errors) = compiled.validate(raw) {
        let details: Vec<String> = errors.map(|e| e.to_string()).collect();
        return Err(CoreError::Validation(format!(
            "change set rejected: {}",
            details.join("; ")
        )));
    }

    let set: ProposedChangeSet = serde_json::from_value(raw.clone())?;

    for change in &set.changes {
        validate_path(&change.path)?;
        match change.op {
            ChangeOp::Create | ChangeOp::Modify => {
                if change.content.is_none() {
                    return Err(CoreError::Validation(format!(
                        "{:?} {} requires content",
                        change.op, change.path
                    )));
                }
            }
            ChangeOp::Delete => {
                if change.content.is_some() {
                    return Err(CoreError::Validation(format!(
                        "DELETE {} must not carry content",
                        change.path
                    )));
                }
            }
        }
    }

    Ok(set)
}

/// Decode a change's content into raw bytes. Binary artifact content is
/// base64 on the wire; text and json are UTF-8.
pub fn change_content_bytes(change: &ProposedChange) -> CoreResult<Vec<u8>> {
    let content = change
        .content
        .as_ref()
        .ok_or_else(|| CoreError::Validation(format!("{} has no content", change.path)))?;

    match change.kind.unwrap_or(ArtifactKind::Text) {
        ArtifactKind::Binary => BASE64.decode(content).map_err(|e| {
            CoreError::Validation(format!("invalid base64 content for {}: {e}", change.path))
        }),
        ArtifactKind::Text | ArtifactKind::Json => Ok(content.clone().into_bytes()),
    }
}

// ---- Bundle Format ---------------------------------------------------------

/// One flat interop record. `content` serializes explicitly (null for
/// deletes) so the wire shape is stable for external consumers.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BundleRecord {
    pub operation: ChangeOp,
    pub path: String,
    pub content: Option<String>,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ArtifactKind>,
}

/// Serialize a change set to its ordered bundle records. Attached
/// verification specs are cycle-internal and do not travel.
pub fn to_bundle(set: &ProposedChangeSet) -> Vec<BundleRecord> {
    set.changes
        .iter()
        .map(|change| BundleRecord {
            operation: change.op,
            path: change.path.clone(),
            content: change.content.clone(),
            reason: change.reason.clone(),
            kind: change.kind,
        })
        .collect()
}

/// Rebuild a change set from bundle records.
pub fn from_bundle(records: &[BundleRecord]) -> ProposedChangeSet {
    ProposedChangeSet {
        changes: records
            .iter()
            .map(|record| ProposedChange {
                op: record.operation,
                path: record.path.clone(),
                content: record.content.clone(),
                kind: record.kind,
                reason: record.reason.clone(),
                verify: None,
            })
            .collect(),
        confidence: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_set() -> Value {
        json!({
            "changes": [
                {
                    "op": "CREATE",
                    "path": "/src/hello.txt",
                    "content": "hello",
                    "kind": "text",
                    "reason": "seed greeting"
                },
                {
                    "op": "DELETE",
                    "path": "/src/old.txt",
                    "reason": "obsolete"
                }
            ],
            "confidence": 0.8
        })
    }

    #[test]
    fn test_valid_change_set_parses() {
        let set = validate_change_set(&sample_set()).unwrap();
        assert_eq!(set.changes.len(), 2);
        assert_eq!(set.changes[0].op, ChangeOp::Create);
        assert_eq!(set.confidence, Some(0.8));
    }

    #[test]
    fn test_missing_reason_is_rejected() {
        let raw = json!({
            "changes": [{ "op": "CREATE", "path": "/a", "content": "x" }]
        });
        assert!(matches!(
            validate_change_set(&raw),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn test_unknown_op_is_rejected() {
        let raw = json!({
            "changes": [{ "op": "RENAME", "path": "/a", "reason": "r" }]
        });
        assert!(matches!(
            validate_change_set(&raw),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn test_create_without_content_is_rejected() {
        let raw = json!({
            "changes": [{ "op": "CREATE", "path": "/a.txt", "reason": "r" }]
        });
        assert!(matches!(
            validate_change_set(&raw),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn test_delete_with_content_is_rejected() {
        let raw = json!({
            "changes": [{ "op": "DELETE", "path": "/a.txt", "content": "x", "reason": "r" }]
        });
        assert!(matches!(
            validate_change_set(&raw),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn test_invalid_path_is_rejected() {
        let raw = json!({
            "changes": [{ "op": "CREATE", "path": "../escape", "content": "x", "reason": "r" }]
        });
        assert!(matches!(
            validate_change_set(&raw),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn test_binary_content_decodes_base64() {
        let change = ProposedChange {
            op: ChangeOp::Create,
            path: "/blob".to_string(),
            content: Some(BASE64.encode([0u8, 1, 2, 255])),
            kind: Some(ArtifactKind::Binary),
            reason: "binary payload".to_string(),
            verify: None,
        };
        assert_eq!(change_content_bytes(&change).unwrap(), vec![0, 1, 2, 255]);
    }

    #[test]
    fn test_bundle_round_trip_is_equivalent() {
        let set = validate_change_set(&sample_set()).unwrap();
        let bundle = to_bundle(&set);

        // Through JSON, as an external consumer would see it.
        let wire = serde_json::to_string(&bundle).unwrap();
        assert!(wire.contains("\"content\":null"));
        let records: Vec<BundleRecord> = serde_json::from_str(&wire).unwrap();

        let back = from_bundle(&records);
        assert_eq!(back.changes.len(), set.changes.len());
        for (a, b) in back.changes.iter().zip(set.changes.iter()) {
            assert_eq!(a.op, b.op);
            assert_eq!(a.path, b.path);
            assert_eq!(a.content, b.content);
            assert_eq!(a.reason, b.reason);
        }
    }

    #[test]
    fn test_bundle_preserves_order() {
        let set = validate_change_set(&sample_set()).unwrap();
        let bundle = to_bundle(&set);
        assert_eq!(bundle[0].path, "/src/hello.txt");
        assert_eq!(bundle[1].path, "/src/old.txt");
    }
}
