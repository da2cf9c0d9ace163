//! Local store of patient records.
//!
//! Thin typed layer over the `patients` table. Every successful write marks
//! the event hub dirty; the caller that owns the write flushes it.

mod search;

pub use search::{rank, MatchTier, SearchHit};

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::{Database, DbResult, StoredPatient, Storage};
use crate::events::{ChangeKind, EventHub};
use crate::models::{PatientData, PatientRecord};

/// Persistent, keyed container of patient records.
#[derive(Clone)]
pub struct LocalStore {
    storage: Storage,
    hub: Arc<EventHub>,
}

impl LocalStore {
    pub fn new(storage: Storage, hub: Arc<EventHub>) -> Self {
        Self { storage, hub }
    }

    /// Point lookup; tombstoned records read as absent.
    pub fn get(&self, local_id: &str) -> DbResult<Option<PatientRecord>> {
        self.storage.read(|db| db.get_patient(local_id))
    }

    /// Lookup including tombstoned records.
    pub fn get_stored(&self, local_id: &str) -> DbResult<Option<StoredPatient>> {
        self.storage.read(|db| db.get_stored_patient(local_id))
    }

    /// All live records ordered by name.
    pub fn list(&self) -> DbResult<Vec<PatientRecord>> {
        self.storage.read(|db| db.list_patients())
    }

    /// Records matching `query`, best match first.
    pub fn search(&self, query: &str) -> DbResult<Vec<PatientRecord>> {
        let records = self.list()?;
        Ok(rank(records, query).into_iter().map(|hit| hit.record).collect())
    }

    pub fn count(&self) -> DbResult<usize> {
        self.storage.read(|db| db.count_patients())
    }

    /// Insert or overwrite a record's payload.
    pub fn put(&self, record: &PatientRecord) -> DbResult<()> {
        self.storage.write(|db| db.upsert_patient(record))?;
        self.mark_changed();
        Ok(())
    }

    /// Physically remove a record.
    pub fn remove(&self, local_id: &str) -> DbResult<bool> {
        let removed = self.storage.write(|db| db.purge_patient(local_id))?;
        if removed {
            self.mark_changed();
        }
        Ok(removed)
    }

    /// Note a write made directly through the storage handle.
    pub(crate) fn mark_changed(&self) {
        self.hub.mark_dirty(ChangeKind::DataChanged);
        // total_patients may have moved
        self.hub.mark_dirty(ChangeKind::SyncStatusChanged);
    }
}

/// Record a server confirmation within the caller's transaction: links the
/// server ID (first time only) and stores the confirmed version.
pub fn confirm_in(
    db: &Database,
    local_id: &str,
    remote_id: Option<&str>,
    version: i64,
    synced_at: DateTime<Utc>,
) -> DbResult<()> {
    if let Some(remote_id) = remote_id {
        if !db.link_remote_id(local_id, remote_id)? {
            tracing::debug!(local_id, remote_id, "patient already linked to a server id");
        }
    }
    db.set_sync_metadata(local_id, version, synced_at)?;
    Ok(())
}

/// Replace a record's payload with the server's state within the caller's
/// transaction. Returns false when the record is gone.
///
/// A tombstoned record is revived unless its delete is still queued.
pub fn apply_server_state_in(
    db: &Database,
    local_id: &str,
    data: &PatientData,
    version: i64,
    server_updated_at: DateTime<Utc>,
    synced_at: DateTime<Utc>,
) -> DbResult<bool> {
    let Some(stored) = db.get_stored_patient(local_id)? else {
        return Ok(false);
    };
    let keep_tombstone = stored.deleted && db.has_pending_delete(local_id)?;
    let mut record = stored.record;
    record.data = data.clone();
    record.updated_at = server_updated_at;
    db.upsert_patient(&record)?;
    if keep_tombstone {
        db.tombstone_patient(local_id)?;
    }
    db.set_sync_metadata(local_id, version, synced_at)?;
    Ok(true)
}
