//! Artifact Store
//!
//! SQLite-backed versioned path-to-content map with atomic multi-artifact
//! update and checkpoint/rollback. Every successful write appends to an
//! immutable history table; checkpoints pin `(path, version)` pairs and
//! never deep-copy content. The store is the single shared mutable
//! resource of the core: callers hold it behind `Arc<Mutex<_>>` and all
//! mutation passes through the methods here.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use chrono::Utc;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use sha3::{Digest, Sha3_256};
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::types::{Artifact, ArtifactKind, Checkpoint, SnapshotEntry, StoreMetrics, StoreSnapshot};

use super::schema::{CREATE_TABLES, SCHEMA_VERSION};

/// The versioned artifact store handle.
pub struct ArtifactStore {
    conn: Connection,
    metrics: StoreMetrics,
}

impl ArtifactStore {
    /// Open (or create) the store at `db_path` and apply the schema.
    pub fn open(db_path: &str) -> CoreResult<Self> {
        if let Some(parent) = Path::new(db_path).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent).map_err(|e| {
                    CoreError::ExecutionFailed(format!(
                        "failed to create store directory {}: {e}",
                        parent.display()
                    ))
                })?;
            }
        }

        let conn = Connection::open(db_path)?;

        // WAL for better concurrent read performance on disk
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        Self::init_schema(conn)
    }

    /// Open an in-memory store (useful for testing).
    pub fn open_in_memory() -> CoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Self::init_schema(conn)
    }

    fn init_schema(conn: Connection) -> CoreResult<Self> {
        conn.execute_batch(CREATE_TABLES)?;
        conn.execute(
            "INSERT OR REPLACE INTO schema_version (version, applied_at) VALUES (?1, datetime('now'))",
            params![SCHEMA_VERSION],
        )?;
        Ok(Self {
            conn,
            metrics: StoreMetrics::default(),
        })
    }

    /// Per-instance mutation counters.
    pub fn metrics(&self) -> StoreMetrics {
        self.metrics
    }

    // ---- Single-Artifact Operations ----------------------------------------

    /// Read the current version of the artifact at `path`.
    pub fn read(&self, path: &str) -> CoreResult<Artifact> {
        self.conn
            .query_row(
                "SELECT path, kind, version, content, updated_at FROM artifacts WHERE path = ?1",
                params![path],
                |row| {
                    Ok(Artifact {
                        path: row.get(0)?,
                        kind: ArtifactKind::parse(&row.get::<_, String>(1)?)
                            .unwrap_or(ArtifactKind::Binary),
                        version: row.get::<_, i64>(2)? as u64,
                        content: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?
            .ok_or_else(|| CoreError::NotFound(format!("artifact {path}")))
    }

    /// Write `content` to `path`, creating it if absent. Returns the new
    /// version. The version counter is monotonic over the path's whole
    /// history, including deletions and restores.
    pub fn write(&mut self, path: &str, content: &[u8], kind: ArtifactKind) -> CoreResult<u64> {
        validate_path(path)?;

        let tx = self.conn.transaction()?;
        let version = write_within(&tx, path, content, kind)?;
        tx.commit()?;

        self.metrics.writes += 1;
        Ok(version)
    }

    /// Delete the artifact at `path`. History rows are retained so any
    /// checkpoint covering the path still resolves.
    pub fn delete(&mut self, path: &str) -> CoreResult<()> {
        let removed = self
            .conn
            .execute("DELETE FROM artifacts WHERE path = ?1", params![path])?;
        if removed == 0 {
            return Err(CoreError::NotFound(format!("artifact {path}")));
        }
        self.metrics.deletes += 1;
        Ok(())
    }

    /// Total number of versions recorded across all paths, live or not.
    pub fn history_depth(&self) -> CoreResult<u64> {
        let count: i64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM artifact_history", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// All currently live artifact paths, sorted.
    pub fn list_paths(&self) -> CoreResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path FROM artifacts ORDER BY path")?;
        let paths = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(paths)
    }

    /// Deep-copied value view of the selected artifacts (`None` = all).
    /// Missing paths in the selection are silently skipped; the caller
    /// decides whether absence matters.
    pub fn snapshot(&self, paths: Option<&[&str]>) -> CoreResult<StoreSnapshot> {
        let mut snapshot = StoreSnapshot::default();
        match paths {
            None => {
                let mut stmt = self
                    .conn
                    .prepare("SELECT path, kind, content FROM artifacts")?;
                let rows = stmt.query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Vec<u8>>(2)?,
                    ))
                })?;
                for row in rows {
                    let (path, kind, content) = row?;
                    snapshot.artifacts.insert(
                        path,
                        SnapshotEntry {
                            content,
                            kind: ArtifactKind::parse(&kind).unwrap_or(ArtifactKind::Binary),
                        },
                    );
                }
            }
            Some(selection) => {
                for path in selection {
                    if let Ok(artifact) = self.read(path) {
                        snapshot.artifacts.insert(
                            artifact.path.clone(),
                            SnapshotEntry {
                                content: artifact.content,
                                kind: artifact.kind,
                            },
                        );
                    }
                }
            }
        }
        Ok(snapshot)
    }

    // ---- Atomic Multi-Artifact Update --------------------------------------

    /// The sole mechanism for multi-artifact mutation. Hands `updater` a
    /// deep copy of the selected state (`None` = all artifacts); the
    /// updater computes a new snapshot purely from it; the store
    /// validates and commits the difference as one transaction. Callers
    /// serialize through the mutex guarding the store instance, so no
    /// interleaved write can be observed mid-computation.
    pub fn update_atomic<F>(&mut self, paths: Option<&[&str]>, updater: F) -> CoreResult<StoreSnapshot>
    where
        F: FnOnce(StoreSnapshot) -> CoreResult<StoreSnapshot>,
    {
        let before = self.snapshot(paths)?;
        let after = updater(before.clone())?;

        for path in after.artifacts.keys() {
            validate_path(path)?;
        }

        let mut writes: u64 = 0;
        let mut deletes: u64 = 0;

        let tx = self.conn.transaction()?;
        for (path, entry) in &after.artifacts {
            let unchanged = before
                .artifacts
                .get(path)
                .map(|prev| prev.content == entry.content && prev.kind == entry.kind)
                .unwrap_or(false);
            if !unchanged {
                write_within(&tx, path, &entry.content, entry.kind)?;
                writes += 1;
            }
        }
        for path in before.artifacts.keys() {
            if !after.artifacts.contains_key(path) {
                tx.execute("DELETE FROM artifacts WHERE path = ?1", params![path])?;
                deletes += 1;
            }
        }
        tx.commit()?;

        self.metrics.writes += writes;
        self.metrics.deletes += deletes;
        Ok(after)
    }

    // ---- Checkpoints -------------------------------------------------------

    /// Record the current version of every tracked artifact under a new
    /// checkpoint id. Metadata only; content is never copied.
    pub fn create_checkpoint(&mut self, label: &str) -> CoreResult<Checkpoint> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().to_rfc3339();

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO checkpoints (id, label, created_at) VALUES (?1, ?2, ?3)",
            params![id, label, now],
        )?;
        tx.execute(
            "INSERT INTO checkpoint_entries (checkpoint_id, path, version)
             SELECT ?1, path, version FROM artifacts",
            params![id],
        )?;
        tx.commit()?;

        self.metrics.checkpoints_created += 1;

        let snapshot = self.checkpoint_snapshot(&id)?;
        Ok(Checkpoint {
            id,
            label: label.to_string(),
            created_at: now,
            snapshot,
        })
    }

    /// Fetch a checkpoint by id.
    pub fn get_checkpoint(&self, checkpoint_id: &str) -> CoreResult<Checkpoint> {
        let row = self
            .conn
            .query_row(
                "SELECT id, label, created_at FROM checkpoints WHERE id = ?1",
                params![checkpoint_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()?;

        let (id, label, created_at) =
            row.ok_or_else(|| CoreError::NotFound(format!("checkpoint {checkpoint_id}")))?;
        let snapshot = self.checkpoint_snapshot(&id)?;
        Ok(Checkpoint {
            id,
            label,
            created_at,
            snapshot,
        })
    }

    /// All checkpoints, oldest first.
    pub fn list_checkpoints(&self) -> CoreResult<Vec<Checkpoint>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, label, created_at FROM checkpoints ORDER BY created_at, id")?;
        let headers = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let mut checkpoints = Vec::with_capacity(headers.len());
        for (id, label, created_at) in headers {
            let snapshot = self.checkpoint_snapshot(&id)?;
            checkpoints.push(Checkpoint {
                id,
                label,
                created_at,
                snapshot,
            });
        }
        Ok(checkpoints)
    }

    fn checkpoint_snapshot(&self, checkpoint_id: &str) -> CoreResult<BTreeMap<String, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT path, version FROM checkpoint_entries WHERE checkpoint_id = ?1")?;
        let mut snapshot = BTreeMap::new();
        let rows = stmt.query_map(params![checkpoint_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })?;
        for row in rows {
            let (path, version) = row?;
            snapshot.insert(path, version);
        }
        Ok(snapshot)
    }

    // ---- Rollback ----------------------------------------------------------

    /// Restore every path covered by the checkpoint to its recorded
    /// version and delete every path created since. All-or-nothing: a
    /// missing or hash-mismatched history row aborts the whole rollback
    /// with an integrity error and leaves the store untouched.
    ///
    /// Restored content lands as a new (bumped) version so the version
    /// counter stays monotonic; bytes are guaranteed identical to the
    /// checkpointed version.
    pub fn rollback(&mut self, checkpoint_id: &str) -> CoreResult<usize> {
        let checkpoint = self.get_checkpoint(checkpoint_id)?;

        let mut applied: usize = 0;
        let tx = self.conn.transaction()?;

        for (path, version) in &checkpoint.snapshot {
            let row = tx
                .query_row(
                    "SELECT kind, content, hash FROM artifact_history
                     WHERE path = ?1 AND version = ?2",
                    params![path, *version as i64],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Vec<u8>>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?;

            let (kind_str, content, stored_hash) = row.ok_or_else(|| {
                CoreError::Integrity(format!(
                    "history missing for {path} v{version} (checkpoint {checkpoint_id})"
                ))
            })?;

            if content_hash(&content) != stored_hash {
                return Err(CoreError::Integrity(format!(
                    "content hash mismatch for {path} v{version} (checkpoint {checkpoint_id})"
                )));
            }

            // Restore only when the live content differs or the path is gone.
            let current_hash: Option<String> = tx
                .query_row(
                    "SELECT hash FROM artifacts WHERE path = ?1",
                    params![path],
                    |row| row.get(0),
                )
                .optional()?;
            if current_hash.as_deref() != Some(stored_hash.as_str()) {
                let kind = ArtifactKind::parse(&kind_str).unwrap_or(ArtifactKind::Binary);
                write_within(&tx, path, &content, kind)?;
                applied += 1;
            }
        }

        // Paths created after the checkpoint and not covered by it.
        {
            let mut stmt = tx.prepare("SELECT path FROM artifacts")?;
            let live_paths = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            for path in live_paths {
                if !checkpoint.snapshot.contains_key(&path) {
                    tx.execute("DELETE FROM artifacts WHERE path = ?1", params![path])?;
                    applied += 1;
                }
            }
        }

        tx.commit()?;
        self.metrics.rollbacks += 1;
        Ok(applied)
    }
}

// ---- Helpers ---------------------------------------------------------------

/// Hex-encoded SHA3-256 of artifact content, kept per version for
/// rollback integrity verification.
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Artifact paths are POSIX-like: absolute, no empty or dot segments.
pub fn validate_path(path: &str) -> CoreResult<()> {
    let pattern = Regex::new(r"^(/[A-Za-z0-9._-]+)+$").expect("static path pattern");
    if !pattern.is_match(path) {
        return Err(CoreError::Validation(format!(
            "invalid artifact path: {path}"
        )));
    }
    if path.split('/').any(|seg| seg == "." || seg == "..") {
        return Err(CoreError::Validation(format!(
            "artifact path may not contain dot segments: {path}"
        )));
    }
    Ok(())
}

/// Append a history row and upsert the live artifact within an open
/// transaction. Versions come from the history high-water mark so they
/// stay monotonic across delete/restore.
fn write_within(
    conn: &Connection,
    path: &str,
    content: &[u8],
    kind: ArtifactKind,
) -> CoreResult<u64> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM artifact_history WHERE path = ?1",
        params![path],
        |row| row.get(0),
    )?;
    let now = Utc::now().to_rfc3339();
    let hash = content_hash(content);

    conn.execute(
        "INSERT INTO artifact_history (path, version, kind, content, hash, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![path, next, kind.as_str(), content, hash, now],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO artifacts (path, kind, version, content, hash, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![path, kind.as_str(), next, content, hash, now],
    )?;

    Ok(next as u64)
}
