//! Artifact Store Schema
//!
//! SQL schema for the versioned artifact store. History rows are
//! append-only; a version referenced by any checkpoint is never deleted.

pub const SCHEMA_VERSION: i64 = 1;

pub const CREATE_TABLES: &str = r#"
CREATE TABLE IF NOT EXISTS artifacts (
    path        TEXT PRIMARY KEY,
    kind        TEXT NOT NULL,
    version     INTEGER NOT NULL,
    content     BLOB NOT NULL,
    hash        TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS artifact_history (
    path        TEXT NOT NULL,
    version     INTEGER NOT NULL,
    kind        TEXT NOT NULL,
    content     BLOB NOT NULL,
    hash        TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    PRIMARY KEY (path, version)
);

CREATE TABLE IF NOT EXISTS checkpoints (
    id          TEXT PRIMARY KEY,
    label       TEXT NOT NULL,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS checkpoint_entries (
    checkpoint_id TEXT NOT NULL REFERENCES checkpoints(id),
    path          TEXT NOT NULL,
    version       INTEGER NOT NULL,
    PRIMARY KEY (checkpoint_id, path)
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_history_path ON artifact_history(path);
CREATE INDEX IF NOT EXISTS idx_checkpoint_entries_path ON checkpoint_entries(path);
"#;
