//! SQLite schema definition.

/// Complete database schema for the local patient cache.
pub const SCHEMA: &str = r#"
-- ============================================================================
-- Patients (Local Store)
-- ============================================================================

CREATE TABLE IF NOT EXISTS patients (
    local_id TEXT PRIMARY KEY,
    remote_id TEXT UNIQUE,                       -- NULL until the create is confirmed
    version INTEGER NOT NULL DEFAULT 0,          -- server version of last confirmed sync
    last_synced_at TEXT,
    first_name TEXT NOT NULL,
    last_name TEXT NOT NULL,
    date_of_birth TEXT,
    gender TEXT,
    email TEXT,
    phone TEXT,
    address TEXT,
    medical_record_number TEXT,
    tags TEXT NOT NULL DEFAULT '[]',             -- JSON array of strings
    custom_data TEXT NOT NULL DEFAULT '{}',      -- JSON object
    content_hash TEXT NOT NULL,                  -- SHA-256 of the demographic payload
    deleted INTEGER NOT NULL DEFAULT 0,          -- tombstone until the delete is confirmed
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_patients_remote_id ON patients(remote_id);
CREATE INDEX IF NOT EXISTS idx_patients_name ON patients(last_name, first_name);
CREATE INDEX IF NOT EXISTS idx_patients_updated ON patients(updated_at);

-- remote_id goes from NULL to a value exactly once
CREATE TRIGGER IF NOT EXISTS patients_remote_id_immutable BEFORE UPDATE OF remote_id ON patients
WHEN old.remote_id IS NOT NULL
    AND (new.remote_id IS NULL OR new.remote_id != old.remote_id)
BEGIN
    SELECT RAISE(ABORT, 'remote_id is immutable once assigned');
END;

-- ============================================================================
-- Operation Log (Append-Only, ordered by seq)
-- ============================================================================

CREATE TABLE IF NOT EXISTS operations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    op_id TEXT NOT NULL UNIQUE,                  -- idempotency key
    target_local_id TEXT NOT NULL,
    kind TEXT NOT NULL CHECK (kind IN ('create', 'update', 'delete')),
    payload TEXT NOT NULL,                       -- JSON OperationPayload
    status TEXT NOT NULL DEFAULT 'pending'
        CHECK (status IN ('pending', 'in_flight', 'failed', 'done')),
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    next_attempt_at TEXT,
    terminal INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    completed_at TEXT
);

-- One lane per patient, walked in seq order
CREATE INDEX IF NOT EXISTS idx_operations_lane ON operations(target_local_id, seq);
CREATE INDEX IF NOT EXISTS idx_operations_status ON operations(status);

-- ============================================================================
-- Sync State
-- ============================================================================

CREATE TABLE IF NOT EXISTS sync_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Track last successful sync timestamps
INSERT OR IGNORE INTO sync_state (key, value) VALUES ('last_sync', '');
INSERT OR IGNORE INTO sync_state (key, value) VALUES ('last_pull_at', '');
"#;
