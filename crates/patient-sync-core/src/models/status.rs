//! Sync status snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Point-in-time view of connectivity and sync progress. Derived on demand,
/// never persisted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SyncStatus {
    pub is_online: bool,
    pub is_syncing: bool,
    pub last_sync: Option<DateTime<Utc>>,
    /// Operations not yet `Done`
    pub pending_operations: usize,
    /// Operations that failed permanently and wait for the user
    pub failed_operations: usize,
    pub total_patients: usize,
}

/// Outcome counts of one sync pass.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SyncReport {
    pub completed: usize,
    pub conflicts: usize,
    pub transient_failures: usize,
    pub permanent_failures: usize,
    /// Remote records inserted or refreshed by the pull phase
    pub pulled: usize,
    /// Pass was skipped because the client is offline or shutting down
    pub skipped: bool,
}

impl SyncReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Default::default()
        }
    }

    /// Add another report's counts to this one.
    pub fn absorb(&mut self, other: &SyncReport) {
        self.completed += other.completed;
        self.conflicts += other.conflicts;
        self.transient_failures += other.transient_failures;
        self.permanent_failures += other.permanent_failures;
        self.pulled += other.pulled;
    }

    /// True when nothing went wrong during the pass.
    pub fn is_clean(&self) -> bool {
        !self.skipped && self.transient_failures == 0 && self.permanent_failures == 0
    }
}
