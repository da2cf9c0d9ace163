//! Operation log entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::patient::{PatientData, PatientPatch};

/// Kind of pending mutation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// Lifecycle of an operation in the log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OperationStatus {
    /// Waiting to be dispatched
    Pending,
    /// Dispatched, response not yet applied
    InFlight,
    /// Last dispatch failed (see `Operation::terminal`)
    Failed,
    /// Confirmed by the server, or resolved by conflict policy
    Done,
}

/// What the operation carries to the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "data")]
pub enum OperationPayload {
    /// Full record
    Create(PatientData),
    /// Changed fields only
    Update(PatientPatch),
    Delete,
}

impl OperationPayload {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationPayload::Create(_) => OperationKind::Create,
            OperationPayload::Update(_) => OperationKind::Update,
            OperationPayload::Delete => OperationKind::Delete,
        }
    }
}

/// A pending mutation against one patient record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    /// Idempotency key sent with every dispatch of this operation
    pub id: Uuid,
    /// Position in the append-only log, assigned on enqueue
    pub seq: i64,
    /// Local ID of the patient this operation belongs to (its lane)
    pub target_local_id: String,
    pub payload: OperationPayload,
    pub created_at: DateTime<Utc>,
    pub status: OperationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Earliest time a failed operation may be retried
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Failed permanently; blocks its lane until retried or abandoned
    pub terminal: bool,
}

impl Operation {
    /// Build a new pending operation. `seq` is assigned by the log.
    pub fn new(target_local_id: impl Into<String>, payload: OperationPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            target_local_id: target_local_id.into(),
            payload,
            created_at: Utc::now(),
            status: OperationStatus::Pending,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            terminal: false,
        }
    }

    pub fn kind(&self) -> OperationKind {
        self.payload.kind()
    }

    /// Not yet `Done`.
    pub fn is_open(&self) -> bool {
        self.status != OperationStatus::Done
    }

    /// Whether this operation may be dispatched at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            OperationStatus::Pending => true,
            OperationStatus::Failed if !self.terminal => {
                self.next_attempt_at.map_or(true, |at| at <= now)
            }
            _ => false,
        }
    }

    /// Never handed to the remote service.
    pub fn never_dispatched(&self) -> bool {
        self.status == OperationStatus::Pending && self.attempts == 0
    }
}
