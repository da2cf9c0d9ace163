//! Remote patient service.
//!
//! The engine only talks to the server through [`RemotePatientService`].
//! [`HttpPatientService`] is the REST implementation; the in-memory one is a
//! faithful stand-in used by tests and demos.

mod http;
mod memory;

pub use http::HttpPatientService;
pub use memory::{InMemoryPatientService, RemoteCall};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{PatientData, PatientPatch};

/// A patient as the server sees it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemotePatient {
    /// Server-assigned ID
    pub id: String,
    /// Bumped by the server on every accepted change
    pub version: i64,
    #[serde(flatten)]
    pub data: PatientData,
    pub updated_at: DateTime<Utc>,
}

/// Filters for listing patients.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ListParams {
    /// Only records changed after this instant
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_since: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Remote service errors.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RemoteError {
    /// Payload rejected (4xx). Never retried automatically.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The server holds a newer version than the request was based on.
    /// `current` is the server's state, `None` if it was deleted.
    #[error("Version conflict")]
    Conflict { current: Option<Box<RemotePatient>> },

    #[error("Not found: {0}")]
    NotFound(String),

    /// Connection refused, 5xx, throttling.
    #[error("Transient failure: {0}")]
    Transient(String),

    #[error("Request timed out")]
    Timeout,

    /// Response body could not be understood.
    #[error("Invalid response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_) | RemoteError::Timeout)
    }
}

pub type RemoteResult<T> = Result<T, RemoteError>;

/// The server side of patient sync.
///
/// Mutating calls carry an idempotency key: replaying a request with the
/// same key must return the original outcome without applying it twice.
#[async_trait]
pub trait RemotePatientService: Send + Sync {
    async fn list_patients(&self, params: &ListParams) -> RemoteResult<Vec<RemotePatient>>;

    async fn get_patient(&self, remote_id: &str) -> RemoteResult<RemotePatient>;

    async fn create_patient(
        &self,
        payload: &PatientData,
        idempotency_key: Uuid,
    ) -> RemoteResult<RemotePatient>;

    /// Apply `patch` if the server is still at `base_version`.
    async fn update_patient(
        &self,
        remote_id: &str,
        patch: &PatientPatch,
        base_version: i64,
        idempotency_key: Uuid,
    ) -> RemoteResult<RemotePatient>;

    /// Delete if the server is still at `base_version`.
    async fn delete_patient(
        &self,
        remote_id: &str,
        base_version: i64,
        idempotency_key: Uuid,
    ) -> RemoteResult<()>;
}
