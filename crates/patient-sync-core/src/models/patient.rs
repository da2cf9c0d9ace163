//! Patient models.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use sha2::{Digest, Sha256};

/// Demographic payload of a patient, without any identity or sync state.
///
/// This is what callers hand to `save_patient` and what is sent to the
/// remote service on create.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PatientData {
    pub first_name: String,
    pub last_name: String,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    /// Medical record number assigned by the clinic
    #[serde(default)]
    pub medical_record_number: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Free-form custom fields
    #[serde(default)]
    pub custom_data: serde_json::Map<String, serde_json::Value>,
}

impl PatientData {
    /// Create a payload with the required name fields.
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
            ..Default::default()
        }
    }

    /// "First Last", trimmed.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }

    /// Apply a partial update in place.
    pub fn apply(&mut self, patch: &PatientPatch) {
        if let Some(first_name) = &patch.first_name {
            self.first_name.clone_from(first_name);
        }
        if let Some(last_name) = &patch.last_name {
            self.last_name.clone_from(last_name);
        }
        if let Some(date_of_birth) = &patch.date_of_birth {
            self.date_of_birth = *date_of_birth;
        }
        if let Some(gender) = &patch.gender {
            self.gender.clone_from(gender);
        }
        if let Some(email) = &patch.email {
            self.email.clone_from(email);
        }
        if let Some(phone) = &patch.phone {
            self.phone.clone_from(phone);
        }
        if let Some(address) = &patch.address {
            self.address.clone_from(address);
        }
        if let Some(mrn) = &patch.medical_record_number {
            self.medical_record_number.clone_from(mrn);
        }
        if let Some(tags) = &patch.tags {
            self.tags.clone_from(tags);
        }
        if let Some(custom_data) = &patch.custom_data {
            self.custom_data.clone_from(custom_data);
        }
    }

    /// SHA-256 over the canonical JSON form, hex encoded.
    ///
    /// Used to detect updates that leave the record unchanged.
    pub fn content_hash(&self) -> String {
        // Struct fields serialize in declaration order and serde_json::Map is
        // ordered by key, so the encoding is stable.
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&canonical))
    }
}

/// Partial update for a patient.
///
/// `None` leaves a field untouched. For nullable fields `Some(None)` clears
/// the value; in JSON that is an explicit `null`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PatientPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_name: Option<String>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub date_of_birth: Option<Option<NaiveDate>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub gender: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub email: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub phone: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub address: Option<Option<String>>,
    #[serde(
        default,
        deserialize_with = "double_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub medical_record_number: Option<Option<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<serde_json::Map<String, serde_json::Value>>,
}

impl PatientPatch {
    /// True when the patch touches no field.
    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

fn double_option<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Sync bookkeeping attached 1:1 to every patient record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncMetadata {
    /// Server ID - null until the create has been confirmed
    pub remote_id: Option<String>,
    /// Server version from the last confirmed sync (0 = never synced)
    pub version: i64,
    /// Local copy has operations the server has not confirmed yet
    pub dirty: bool,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// A patient record as held by the local store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PatientRecord {
    /// Local UUID - always present, generated locally
    pub local_id: String,
    #[serde(flatten)]
    pub data: PatientData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sync: SyncMetadata,
}

impl PatientRecord {
    /// Create a new, never-synced record with a fresh local ID.
    pub fn new(data: PatientData) -> Self {
        let now = Utc::now();
        Self {
            local_id: uuid::Uuid::new_v4().to_string(),
            data,
            created_at: now,
            updated_at: now,
            sync: SyncMetadata::default(),
        }
    }

    /// Check if this patient has been confirmed by the server.
    pub fn is_synced(&self) -> bool {
        self.sync.remote_id.is_some()
    }
}
