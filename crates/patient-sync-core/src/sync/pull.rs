//! Merging server-side changes into the local store.
//!
//! Local intent wins while it is unconfirmed: a record with open operations
//! or a pending delete is left alone and converges through its own lane.

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::db::{Database, DbResult};
use crate::models::{PatientRecord, SyncMetadata};
use crate::remote::RemotePatient;
use crate::store::apply_server_state_in;

/// What a pulled record did to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Unknown locally, inserted as a clean record
    Inserted,
    /// Known and clean, overwritten with a newer server version
    Refreshed,
    /// Local copy already at this version or newer
    Current,
    /// Local copy has unconfirmed operations
    Dirty,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(self, MergeOutcome::Inserted | MergeOutcome::Refreshed)
    }
}

/// Merge one remote record within the caller's transaction.
pub fn merge_in(
    db: &Database,
    remote: &RemotePatient,
    synced_at: DateTime<Utc>,
) -> DbResult<MergeOutcome> {
    let Some(stored) = db.get_patient_by_remote_id(&remote.id)? else {
        let mut record = PatientRecord::new(remote.data.clone());
        record.created_at = remote.updated_at;
        record.updated_at = remote.updated_at;
        record.sync = SyncMetadata {
            remote_id: Some(remote.id.clone()),
            version: remote.version,
            dirty: false,
            last_synced_at: Some(synced_at),
        };
        db.upsert_patient(&record)?;
        trace!(remote_id = %remote.id, local_id = %record.local_id, "pulled new patient");
        return Ok(MergeOutcome::Inserted);
    };

    let local_id = &stored.record.local_id;
    if stored.deleted || db.has_open_operations(local_id)? {
        return Ok(MergeOutcome::Dirty);
    }
    if remote.version <= stored.record.sync.version {
        return Ok(MergeOutcome::Current);
    }

    apply_server_state_in(
        db,
        local_id,
        &remote.data,
        remote.version,
        remote.updated_at,
        synced_at,
    )?;
    trace!(remote_id = %remote.id, %local_id, version = remote.version, "refreshed patient");
    Ok(MergeOutcome::Refreshed)
}
