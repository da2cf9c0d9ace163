//! Patient Sync Core Library
//!
//! Offline-first patient record cache with an operation log and background
//! synchronization against a remote patient service.
//!
//! # Architecture
//!
//! ```text
//!  save / update / delete                         get / search / list
//!          │                                              ▲
//!          ▼                                              │
//!  ┌───────────────────────────── SyncEngine ─────────────┴──────────┐
//!  │                                                                 │
//!  │   [ one transaction ]                                           │
//!  │   LocalStore.put  +  OperationLog.enqueue ──► EventHub.flush    │
//!  │                             │                    │ callbacks    │
//!  │                             │                    │ broadcast    │
//!  │   ConnectivityMonitor ──────┤ offline → online   ▼              │
//!  │   sweep interval ───────────┤                 observers         │
//!  │   sync_with_server() ───────┤                                   │
//!  │                             ▼                                   │
//!  │                      SyncCoordinator                            │
//!  │          lane a: op1 → op2      lane b: op1      (≤ N lanes)    │
//!  │                             │                                   │
//!  └─────────────────────────────┼───────────────────────────────────┘
//!                                ▼
//!                      RemotePatientService
//!                 (Idempotency-Key per operation)
//! ```
//!
//! # Core Principle
//!
//! **Local writes never wait for the network.** They land in the local store
//! and the operation log together; the server catches up later, one entity
//! lane at a time, and wins any version conflict.
//!
//! # Modules
//!
//! - [`engine`]: the facade, and the only entry point applications need
//! - [`db`]: SQLite persistence (patients, operation log, sync state)
//! - [`store`]: local patient store with ranked fuzzy search
//! - [`oplog`]: ordered, persistent log of unconfirmed mutations
//! - [`sync`]: coordinator, retry policy and pull merge
//! - [`remote`]: remote service trait, HTTP client and in-memory server
//! - [`connectivity`]: online/offline tracking
//! - [`events`]: change notifications
//! - [`config`]: layered configuration

pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod events;
pub mod models;
pub mod oplog;
pub mod remote;
pub mod store;
pub mod sync;

// Re-export commonly used types
pub use config::{ConfigError, SyncConfig};
pub use connectivity::{Connectivity, ConnectivityHandle, ConnectivitySignal};
pub use db::{Database, DbError};
pub use engine::SyncEngine;
pub use events::{ChangeKind, StatusChange, SubscriptionId, SyncEvent};
pub use models::{
    Operation, OperationKind, OperationPayload, OperationStatus, PatientData, PatientPatch,
    PatientRecord, SyncMetadata, SyncReport, SyncStatus,
};
pub use remote::{
    HttpPatientService, InMemoryPatientService, RemoteError, RemotePatient,
    RemotePatientService,
};

// =========================================================================
// Error Type
// =========================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Unknown local ID. Never queued.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The server rejected the payload.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Transient network failure: {0}")]
    TransientNetworkFailure(String),

    /// Resolved automatically during sync; only seen from direct remote calls.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// A local write could not be recorded.
    #[error("Storage failure: {0}")]
    StorageFailure(#[source] DbError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The engine was destroyed.
    #[error("Sync engine has been shut down")]
    ShutDown,
}

impl From<DbError> for SyncError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::NotFound(id) => SyncError::NotFound(id),
            other => SyncError::StorageFailure(other),
        }
    }
}

impl From<RemoteError> for SyncError {
    fn from(e: RemoteError) -> Self {
        match e {
            RemoteError::Validation(msg) | RemoteError::Decode(msg) => {
                SyncError::ValidationFailed(msg)
            }
            RemoteError::Conflict { current } => SyncError::Conflict(match current {
                Some(current) => format!("server is at version {}", current.version),
                None => "server copy was deleted".to_string(),
            }),
            RemoteError::NotFound(id) => SyncError::NotFound(id),
            RemoteError::Transient(msg) => SyncError::TransientNetworkFailure(msg),
            RemoteError::Timeout => SyncError::TransientNetworkFailure("request timed out".into()),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        SyncError::StorageFailure(DbError::LockPoisoned(e.to_string()))
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
