//! Patient database operations.

use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DbError, DbResult};
use crate::models::{PatientData, PatientRecord, SyncMetadata};

/// Patient row together with its tombstone flag.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPatient {
    pub record: PatientRecord,
    /// Deleted locally, waiting for the server to confirm
    pub deleted: bool,
}

// `dirty` is derived from the operation log so it can never disagree with it.
const SELECT_PATIENT: &str = r#"
    SELECT p.local_id, p.remote_id, p.version, p.last_synced_at,
           p.first_name, p.last_name, p.date_of_birth, p.gender, p.email,
           p.phone, p.address, p.medical_record_number, p.tags, p.custom_data,
           p.created_at, p.updated_at, p.deleted,
           EXISTS (
               SELECT 1 FROM operations o
               WHERE o.target_local_id = p.local_id AND o.status != 'done'
           ) AS dirty
    FROM patients p
"#;

impl Database {
    /// Insert or overwrite the payload of a patient.
    ///
    /// Sync metadata is only taken from `record` when the row is new; for an
    /// existing row it is owned by the sync coordinator and left alone.
    pub fn upsert_patient(&self, record: &PatientRecord) -> DbResult<()> {
        let tags_json = serde_json::to_string(&record.data.tags)?;
        let custom_json = serde_json::to_string(&record.data.custom_data)?;

        self.conn.execute(
            r#"
            INSERT INTO patients (
                local_id, remote_id, version, last_synced_at,
                first_name, last_name, date_of_birth, gender, email, phone,
                address, medical_record_number, tags, custom_data,
                content_hash, deleted, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, 0, ?16, ?17)
            ON CONFLICT(local_id) DO UPDATE SET
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                date_of_birth = excluded.date_of_birth,
                gender = excluded.gender,
                email = excluded.email,
                phone = excluded.phone,
                address = excluded.address,
                medical_record_number = excluded.medical_record_number,
                tags = excluded.tags,
                custom_data = excluded.custom_data,
                content_hash = excluded.content_hash,
                deleted = 0,
                updated_at = excluded.updated_at
            "#,
            params![
                record.local_id,
                record.sync.remote_id,
                record.sync.version,
                record.sync.last_synced_at,
                record.data.first_name,
                record.data.last_name,
                record.data.date_of_birth,
                record.data.gender,
                record.data.email,
                record.data.phone,
                record.data.address,
                record.data.medical_record_number,
                tags_json,
                custom_json,
                record.data.content_hash(),
                record.created_at,
                record.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Get a live (not tombstoned) patient by local ID.
    pub fn get_patient(&self, local_id: &str) -> DbResult<Option<PatientRecord>> {
        Ok(self
            .get_stored_patient(local_id)?
            .filter(|stored| !stored.deleted)
            .map(|stored| stored.record))
    }

    /// Get a patient by local ID, tombstoned or not.
    pub fn get_stored_patient(&self, local_id: &str) -> DbResult<Option<StoredPatient>> {
        let sql = format!("{SELECT_PATIENT} WHERE p.local_id = ?");
        self.conn
            .query_row(&sql, [local_id], PatientRow::from_row)
            .optional()?
            .map(TryInto::try_into)
            .transpose()
    }

    /// Get a patient by server ID, tombstoned or not.
    pub fn get_patient_by_remote_id(&self, remote_id: &str) -> DbResult<Option<StoredPatient>> {
        let sql = format!("{SELECT_PATIENT} WHERE p.remote_id = ?");
        self.conn
            .query_row(&sql, [remote_id], PatientRow::from_row)
            .optional()?
            .map(TryInto::try_into)
            .transpose()
    }

    /// List all live patients, ordered by name.
    pub fn list_patients(&self) -> DbResult<Vec<PatientRecord>> {
        let sql = format!(
            "{SELECT_PATIENT} WHERE p.deleted = 0 ORDER BY p.last_name, p.first_name, p.created_at"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map([], PatientRow::from_row)?;

        let mut patients = Vec::new();
        for row in rows {
            let stored: StoredPatient = row?.try_into()?;
            patients.push(stored.record);
        }
        Ok(patients)
    }

    /// Count live patients.
    pub fn count_patients(&self) -> DbResult<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM patients WHERE deleted = 0",
            [],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Hide a patient from reads until its delete is confirmed.
    pub fn tombstone_patient(&self, local_id: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE patients SET deleted = 1 WHERE local_id = ? AND deleted = 0",
            [local_id],
        )?;
        Ok(rows_affected > 0)
    }

    /// Bring a tombstoned patient back.
    pub fn restore_patient(&self, local_id: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE patients SET deleted = 0 WHERE local_id = ? AND deleted = 1",
            [local_id],
        )?;
        Ok(rows_affected > 0)
    }

    /// Physically delete a patient row.
    pub fn purge_patient(&self, local_id: &str) -> DbResult<bool> {
        let rows_affected = self
            .conn
            .execute("DELETE FROM patients WHERE local_id = ?", [local_id])?;
        Ok(rows_affected > 0)
    }

    /// Link local patient to server ID after its create is confirmed.
    ///
    /// Returns false if the patient already has a server ID.
    pub fn link_remote_id(&self, local_id: &str, remote_id: &str) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE patients SET remote_id = ?2 WHERE local_id = ?1 AND remote_id IS NULL",
            params![local_id, remote_id],
        )?;
        Ok(rows_affected > 0)
    }

    /// Record a confirmed server version.
    pub fn set_sync_metadata(
        &self,
        local_id: &str,
        version: i64,
        synced_at: DateTime<Utc>,
    ) -> DbResult<bool> {
        let rows_affected = self.conn.execute(
            "UPDATE patients SET version = ?2, last_synced_at = ?3 WHERE local_id = ?1",
            params![local_id, version, synced_at],
        )?;
        Ok(rows_affected > 0)
    }
}

/// Intermediate row struct for database mapping.
struct PatientRow {
    local_id: String,
    remote_id: Option<String>,
    version: i64,
    last_synced_at: Option<DateTime<Utc>>,
    first_name: String,
    last_name: String,
    date_of_birth: Option<NaiveDate>,
    gender: Option<String>,
    email: Option<String>,
    phone: Option<String>,
    address: Option<String>,
    medical_record_number: Option<String>,
    tags: String,
    custom_data: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted: bool,
    dirty: bool,
}

impl PatientRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            local_id: row.get(0)?,
            remote_id: row.get(1)?,
            version: row.get(2)?,
            last_synced_at: row.get(3)?,
            first_name: row.get(4)?,
            last_name: row.get(5)?,
            date_of_birth: row.get(6)?,
            gender: row.get(7)?,
            email: row.get(8)?,
            phone: row.get(9)?,
            address: row.get(10)?,
            medical_record_number: row.get(11)?,
            tags: row.get(12)?,
            custom_data: row.get(13)?,
            created_at: row.get(14)?,
            updated_at: row.get(15)?,
            deleted: row.get(16)?,
            dirty: row.get(17)?,
        })
    }
}

impl TryFrom<PatientRow> for StoredPatient {
    type Error = DbError;

    fn try_from(row: PatientRow) -> Result<Self, Self::Error> {
        let tags: Vec<String> = serde_json::from_str(&row.tags)?;
        let custom_data = serde_json::from_str(&row.custom_data)?;

        Ok(StoredPatient {
            record: PatientRecord {
                local_id: row.local_id,
                data: PatientData {
                    first_name: row.first_name,
                    last_name: row.last_name,
                    date_of_birth: row.date_of_birth,
                    gender: row.gender,
                    email: row.email,
                    phone: row.phone,
                    address: row.address,
                    medical_record_number: row.medical_record_number,
                    tags,
                    custom_data,
                },
                created_at: row.created_at,
                updated_at: row.updated_at,
                sync: SyncMetadata {
                    remote_id: row.remote_id,
                    version: row.version,
                    dirty: row.dirty,
                    last_synced_at: row.last_synced_at,
                },
            },
            deleted: row.deleted,
        })
    }
}
