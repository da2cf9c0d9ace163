//! Persistent, ordered log of mutations awaiting server confirmation.
//!
//! The log is append-only: `seq` fixes the order and each patient's
//! operations form a lane. Only a lane's head (its oldest open operation) is
//! ever dispatched, which gives strict FIFO per patient without any
//! cross-lane ordering.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::{Database, DbError, DbResult, Storage};
use crate::events::{ChangeKind, EventHub};
use crate::models::{Operation, OperationKind, OperationStatus};

/// What happened to an enqueued operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Appended at `seq`; `superseded` updates were removed ahead of it
    Appended { seq: i64, superseded: Vec<Uuid> },
    /// A delete met a create the server never accepted: the whole lane was
    /// dropped and nothing was appended
    Collapsed { dropped: Vec<Uuid> },
}

/// Apply the enqueue rules and append `op` within the caller's transaction.
///
/// - a lane starts with its create, and nothing follows a delete
/// - a delete removes the lane's queued updates that are not in flight
/// - a delete whose create was never dispatched (or was rejected) drops the
///   lane instead of being appended
pub fn enqueue_in(db: &Database, op: &Operation) -> DbResult<EnqueueOutcome> {
    let lane = db.list_lane_operations(&op.target_local_id)?;

    if lane.iter().any(|queued| queued.kind() == OperationKind::Delete) {
        return Err(DbError::Constraint(format!(
            "patient {} already has a pending delete",
            op.target_local_id
        )));
    }
    if op.kind() == OperationKind::Create && !lane.is_empty() {
        return Err(DbError::Constraint(format!(
            "patient {} already has queued operations",
            op.target_local_id
        )));
    }

    if op.kind() == OperationKind::Delete {
        let unsent_create = lane.iter().any(|queued| {
            queued.kind() == OperationKind::Create && (queued.never_dispatched() || queued.terminal)
        });
        if unsent_create {
            let dropped: Vec<Uuid> = lane.iter().map(|queued| queued.id).collect();
            db.delete_open_lane(&op.target_local_id)?;
            return Ok(EnqueueOutcome::Collapsed { dropped });
        }

        let mut superseded = Vec::new();
        for queued in &lane {
            if queued.kind() == OperationKind::Update && queued.status != OperationStatus::InFlight
            {
                db.delete_operation(&queued.id)?;
                superseded.push(queued.id);
            }
        }
        let seq = db.append_operation(op)?;
        return Ok(EnqueueOutcome::Appended { seq, superseded });
    }

    let seq = db.append_operation(op)?;
    Ok(EnqueueOutcome::Appended {
        seq,
        superseded: Vec::new(),
    })
}

/// Handle to the operation log.
#[derive(Clone)]
pub struct OperationLog {
    storage: Storage,
    hub: Arc<EventHub>,
}

impl OperationLog {
    pub fn new(storage: Storage, hub: Arc<EventHub>) -> Self {
        Self { storage, hub }
    }

    /// Append `op`, enforcing the lane rules.
    pub fn enqueue(&self, op: &Operation) -> DbResult<EnqueueOutcome> {
        let outcome = self.storage.write(|db| enqueue_in(db, op))?;
        log_enqueue(op, &outcome);
        self.mark_changed();
        Ok(outcome)
    }

    pub fn get(&self, id: &Uuid) -> DbResult<Option<Operation>> {
        self.storage.read(|db| db.get_operation(id))
    }

    /// Oldest ready lane head whose lane is not in `excluding`.
    pub fn peek_next(
        &self,
        excluding: &HashSet<String>,
        now: DateTime<Utc>,
    ) -> DbResult<Option<Operation>> {
        let heads = self.storage.read(|db| db.list_lane_heads())?;
        Ok(heads
            .into_iter()
            .find(|op| !excluding.contains(&op.target_local_id) && op.is_ready(now)))
    }

    /// The head of one lane, if it is ready.
    pub fn next_in_lane(&self, local_id: &str, now: DateTime<Utc>) -> DbResult<Option<Operation>> {
        let lane = self.storage.read(|db| db.list_lane_operations(local_id))?;
        Ok(lane.into_iter().next().filter(|op| op.is_ready(now)))
    }

    /// Earliest scheduled retry among lane heads.
    pub fn next_retry_at(&self) -> DbResult<Option<DateTime<Utc>>> {
        let heads = self.storage.read(|db| db.list_lane_heads())?;
        Ok(heads
            .iter()
            .filter(|op| op.status == OperationStatus::Failed && !op.terminal)
            .filter_map(|op| op.next_attempt_at)
            .min())
    }

    /// Mark dispatched. Counts the attempt.
    pub fn mark_in_flight(&self, id: &Uuid) -> DbResult<Operation> {
        self.transition(id, |op| {
            op.status = OperationStatus::InFlight;
            op.attempts = op.attempts.saturating_add(1);
            op.next_attempt_at = None;
        })
    }

    /// Mark confirmed or resolved.
    pub fn mark_done(&self, id: &Uuid) -> DbResult<Operation> {
        self.complete(id, |_| Ok(())).map(|(op, ())| op)
    }

    /// Mark done and run `also` in the same transaction, so the effect of a
    /// confirmed operation and its completion commit together.
    pub fn complete<T>(
        &self,
        id: &Uuid,
        also: impl FnOnce(&Database) -> DbResult<T>,
    ) -> DbResult<(Operation, T)> {
        let (op, value) = self.storage.write(|db| {
            let mut op = db
                .get_operation(id)?
                .ok_or_else(|| DbError::NotFound(id.to_string()))?;
            op.status = OperationStatus::Done;
            op.last_error = None;
            op.next_attempt_at = None;
            op.terminal = false;
            db.save_operation_state(&op)?;
            let value = also(db)?;
            Ok((op, value))
        })?;
        debug!(op_id = %op.id, attempts = op.attempts, "operation done");
        // The target's dirty flag may have cleared.
        self.mark_changed();
        Ok((op, value))
    }

    /// Mark failed. `retry_at = None` makes the failure terminal.
    pub fn mark_failed(
        &self,
        id: &Uuid,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> DbResult<Operation> {
        self.transition(id, |op| {
            op.status = OperationStatus::Failed;
            op.last_error = Some(error.to_string());
            op.next_attempt_at = retry_at;
            op.terminal = retry_at.is_none();
        })
    }

    /// Remove an open operation the user gave up on, running `also` in the
    /// same transaction.
    pub fn abandon<T>(
        &self,
        id: &Uuid,
        also: impl FnOnce(&Database, &Operation) -> DbResult<T>,
    ) -> DbResult<(Operation, T)> {
        let (op, value) = self.storage.write(|db| {
            let op = db
                .get_operation(id)?
                .ok_or_else(|| DbError::NotFound(id.to_string()))?;
            if op.status == OperationStatus::InFlight || op.status == OperationStatus::Done {
                return Err(DbError::Constraint(format!(
                    "operation {} is {:?} and cannot be abandoned",
                    id, op.status
                )));
            }
            db.delete_operation(id)?;
            let value = also(db, &op)?;
            Ok((op, value))
        })?;
        info!(op_id = %op.id, local_id = %op.target_local_id, kind = ?op.kind(), "operation abandoned");
        self.mark_changed();
        Ok((op, value))
    }

    /// Put a failed operation back in the queue for immediate dispatch.
    pub fn retry(&self, id: &Uuid) -> DbResult<Operation> {
        let op = self.get(id)?.ok_or_else(|| DbError::NotFound(id.to_string()))?;
        if op.status != OperationStatus::Failed {
            return Err(DbError::Constraint(format!(
                "operation {} is {:?}, not failed",
                id, op.status
            )));
        }
        self.transition(id, |op| {
            op.status = OperationStatus::Pending;
            op.next_attempt_at = None;
            op.terminal = false;
        })
    }

    /// Count of operations not yet done.
    pub fn pending_count(&self) -> DbResult<usize> {
        self.storage.read(|db| db.count_open_operations())
    }

    /// Count of terminally failed operations.
    pub fn failed_count(&self) -> DbResult<usize> {
        self.storage.read(|db| db.count_terminal_operations())
    }

    /// Open operations in log order.
    pub fn list_open(&self) -> DbResult<Vec<Operation>> {
        self.storage.read(|db| db.list_open_operations())
    }

    /// Terminally failed operations in log order.
    pub fn list_failed(&self) -> DbResult<Vec<Operation>> {
        self.storage.read(|db| db.list_terminal_operations())
    }

    /// Reset operations a previous process left in flight.
    pub fn recover(&self) -> DbResult<usize> {
        let reset = self.storage.write(|db| db.reset_in_flight_operations())?;
        if reset > 0 {
            info!(count = reset, "re-queued operations left in flight by a previous run");
        }
        Ok(reset)
    }

    /// Drop pending backoff so retrying operations are due now.
    pub fn resume_retries(&self) -> DbResult<usize> {
        let resumed = self.storage.write(|db| db.clear_retry_schedule())?;
        if resumed > 0 {
            debug!(count = resumed, "cleared retry backoff");
            self.hub.mark_dirty(ChangeKind::SyncStatusChanged);
        }
        Ok(resumed)
    }

    /// Delete done operations completed before `before`.
    pub fn prune_completed(&self, before: DateTime<Utc>) -> DbResult<usize> {
        self.storage.write(|db| db.prune_done_operations(before))
    }

    fn transition(&self, id: &Uuid, apply: impl FnOnce(&mut Operation)) -> DbResult<Operation> {
        let op = self.storage.write(|db| {
            let mut op = db
                .get_operation(id)?
                .ok_or_else(|| DbError::NotFound(id.to_string()))?;
            apply(&mut op);
            db.save_operation_state(&op)?;
            Ok(op)
        })?;
        debug!(op_id = %op.id, status = ?op.status, attempts = op.attempts, "operation transitioned");
        self.hub.mark_dirty(ChangeKind::SyncStatusChanged);
        Ok(op)
    }

    fn mark_changed(&self) {
        self.hub.mark_dirty(ChangeKind::SyncStatusChanged);
        self.hub.mark_dirty(ChangeKind::DataChanged);
    }
}

/// Trace an enqueue outcome.
pub(crate) fn log_enqueue(op: &Operation, outcome: &EnqueueOutcome) {
    match outcome {
        EnqueueOutcome::Appended { seq, superseded } => {
            debug!(op_id = %op.id, local_id = %op.target_local_id, kind = ?op.kind(), seq, "operation enqueued");
            if !superseded.is_empty() {
                info!(local_id = %op.target_local_id, count = superseded.len(), "delete superseded queued updates");
            }
        }
        EnqueueOutcome::Collapsed { dropped } => {
            info!(local_id = %op.target_local_id, count = dropped.len(), "delete dropped a lane the server never saw");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OperationPayload, PatientData, PatientPatch};
    use chrono::Duration;

    fn setup() -> OperationLog {
        OperationLog::new(Storage::open(None).unwrap(), Arc::new(EventHub::new(16)))
    }

    fn create(local_id: &str) -> Operation {
        Operation::new(local_id, OperationPayload::Create(PatientData::new("Ada", "Lovelace")))
    }

    fn update(local_id: &str) -> Operation {
        Operation::new(
            local_id,
            OperationPayload::Update(PatientPatch {
                phone: Some(Some("555-0100".into())),
                ..Default::default()
            }),
        )
    }

    fn delete(local_id: &str) -> Operation {
        Operation::new(local_id, OperationPayload::Delete)
    }

    /// Simulate a confirmed create so the lane is past its first operation.
    fn confirm(log: &OperationLog, op: &Operation) {
        log.mark_in_flight(&op.id).unwrap();
        log.mark_done(&op.id).unwrap();
    }

    #[test]
    fn test_delete_supersedes_pending_updates() {
        let log = setup();
        let c = create("p1");
        log.enqueue(&c).unwrap();
        confirm(&log, &c);

        let u1 = update("p1");
        let u2 = update("p1");
        log.enqueue(&u1).unwrap();
        log.enqueue(&u2).unwrap();

        let d = delete("p1");
        let outcome = log.enqueue(&d).unwrap();
        match outcome {
            EnqueueOutcome::Appended { superseded, .. } => {
                assert_eq!(superseded, vec![u1.id, u2.id]);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let open: Vec<Uuid> = log.list_open().unwrap().iter().map(|op| op.id).collect();
        assert_eq!(open, vec![d.id]);
    }

    #[test]
    fn test_delete_keeps_in_flight_update() {
        let log = setup();
        let c = create("p1");
        log.enqueue(&c).unwrap();
        confirm(&log, &c);

        let u = update("p1");
        log.enqueue(&u).unwrap();
        log.mark_in_flight(&u.id).unwrap();

        let d = delete("p1");
        log.enqueue(&d).unwrap();

        let open: Vec<Uuid> = log.list_open().unwrap().iter().map(|op| op.id).collect();
        assert_eq!(open, vec![u.id, d.id]);
    }

    #[test]
    fn test_delete_collapses_unsent_create() {
        let log = setup();
        let c = create("p1");
        let u = update("p1");
        log.enqueue(&c).unwrap();
        log.enqueue(&u).unwrap();

        let outcome = log.enqueue(&delete("p1")).unwrap();
        assert_eq!(
            outcome,
            EnqueueOutcome::Collapsed {
                dropped: vec![c.id, u.id]
            }
        );
        assert_eq!(log.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_nothing_after_delete() {
        let log = setup();
        let c = create("p1");
        log.enqueue(&c).unwrap();
        confirm(&log, &c);
        log.enqueue(&delete("p1")).unwrap();

        assert!(log.enqueue(&update("p1")).is_err());
        assert!(log.enqueue(&delete("p1")).is_err());
    }

    #[test]
    fn test_peek_next_respects_lanes_and_exclusions() {
        let log = setup();
        let a = create("a");
        let b = create("b");
        log.enqueue(&a).unwrap();
        log.enqueue(&update("a")).unwrap();
        log.enqueue(&b).unwrap();

        let now = Utc::now();
        assert_eq!(log.peek_next(&HashSet::new(), now).unwrap().unwrap().id, a.id);

        let busy: HashSet<String> = ["a".to_string()].into_iter().collect();
        assert_eq!(log.peek_next(&busy, now).unwrap().unwrap().id, b.id);

        // An in-flight head blocks the rest of its lane
        log.mark_in_flight(&a.id).unwrap();
        assert_eq!(log.peek_next(&HashSet::new(), now).unwrap().unwrap().id, b.id);
    }

    #[test]
    fn test_failed_head_waits_for_backoff() {
        let log = setup();
        let a = create("a");
        log.enqueue(&a).unwrap();
        log.mark_in_flight(&a.id).unwrap();

        let now = Utc::now();
        let retry_at = now + Duration::seconds(30);
        let failed = log.mark_failed(&a.id, "connection refused", Some(retry_at)).unwrap();
        assert_eq!(failed.attempts, 1);
        assert!(!failed.terminal);

        assert!(log.peek_next(&HashSet::new(), now).unwrap().is_none());
        assert!(log.peek_next(&HashSet::new(), retry_at).unwrap().is_some());
        assert_eq!(log.next_retry_at().unwrap(), Some(retry_at));
    }

    #[test]
    fn test_resume_retries_skips_backoff() {
        let log = setup();
        let a = create("a");
        let b = create("b");
        log.enqueue(&a).unwrap();
        log.enqueue(&b).unwrap();
        log.mark_in_flight(&a.id).unwrap();
        log.mark_in_flight(&b.id).unwrap();

        let now = Utc::now();
        log.mark_failed(&a.id, "connection refused", Some(now + Duration::minutes(10))).unwrap();
        log.mark_failed(&b.id, "last_name required", None).unwrap();
        assert!(log.peek_next(&HashSet::new(), now).unwrap().is_none());

        assert_eq!(log.resume_retries().unwrap(), 1);
        assert_eq!(log.peek_next(&HashSet::new(), now).unwrap().unwrap().id, a.id);
        assert_eq!(log.next_retry_at().unwrap(), None);

        let terminal = log.get(&b.id).unwrap().unwrap();
        assert!(terminal.terminal);
        assert_eq!(terminal.status, OperationStatus::Failed);
        assert_eq!(log.resume_retries().unwrap(), 0);
    }

    #[test]
    fn test_terminal_failure_blocks_lane_until_retried() {
        let log = setup();
        let a = create("a");
        log.enqueue(&a).unwrap();
        log.mark_in_flight(&a.id).unwrap();
        log.mark_failed(&a.id, "last_name required", None).unwrap();

        let far_future = Utc::now() + Duration::days(365);
        assert!(log.peek_next(&HashSet::new(), far_future).unwrap().is_none());
        assert_eq!(log.failed_count().unwrap(), 1);

        let retried = log.retry(&a.id).unwrap();
        assert_eq!(retried.status, OperationStatus::Pending);
        assert!(log.peek_next(&HashSet::new(), Utc::now()).unwrap().is_some());
        assert!(log.retry(&a.id).is_err());
    }

    #[test]
    fn test_complete_runs_in_same_transaction() {
        let log = setup();
        let a = create("a");
        log.enqueue(&a).unwrap();
        log.mark_in_flight(&a.id).unwrap();

        let result: DbResult<(Operation, ())> = log.complete(&a.id, |_| {
            Err(DbError::Constraint("store write failed".into()))
        });
        assert!(result.is_err());
        assert_eq!(log.get(&a.id).unwrap().unwrap().status, OperationStatus::InFlight);

        let (done, ()) = log.complete(&a.id, |_| Ok(())).unwrap();
        assert_eq!(done.status, OperationStatus::Done);
        assert_eq!(log.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_abandon_removes_open_operation() {
        let log = setup();
        let a = create("a");
        log.enqueue(&a).unwrap();
        log.mark_in_flight(&a.id).unwrap();
        assert!(log.abandon(&a.id, |_, _| Ok(())).is_err(), "in flight");

        log.mark_failed(&a.id, "last_name required", None).unwrap();
        let (abandoned, lane_left) = log
            .abandon(&a.id, |db, op| db.list_lane_operations(&op.target_local_id))
            .unwrap();
        assert_eq!(abandoned.id, a.id);
        assert!(lane_left.is_empty());
        assert!(log.get(&a.id).unwrap().is_none());
    }

    #[test]
    fn test_recover_in_flight() {
        let log = setup();
        let a = create("a");
        log.enqueue(&a).unwrap();
        log.mark_in_flight(&a.id).unwrap();

        assert_eq!(log.recover().unwrap(), 1);
        assert_eq!(log.get(&a.id).unwrap().unwrap().status, OperationStatus::Pending);
    }
}
