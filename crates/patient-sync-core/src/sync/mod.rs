//! Synchronization with the remote patient service.
//!
//! - [`SyncCoordinator`] runs passes: drain the operation log lane by lane,
//!   then pull server changes.
//! - [`RetryPolicy`] schedules transient failures.
//! - The scheduler task decides when passes run: on reconnect, on a periodic
//!   sweep while online, and when a scheduled retry falls due.

mod backoff;
mod coordinator;
mod pull;
mod scheduler;

pub use backoff::RetryPolicy;
pub use coordinator::SyncCoordinator;
pub use pull::{merge_in, MergeOutcome};
pub(crate) use scheduler::run_scheduler;
