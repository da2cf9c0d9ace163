//! Drains the operation log against the remote service.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};

use super::pull::merge_in;
use super::RetryPolicy;
use crate::config::SyncConfig;
use crate::db::{Storage, LAST_PULL_KEY, LAST_SYNC_KEY};
use crate::events::{ChangeKind, EventHub, StatusChange, SyncEvent};
use crate::models::{Operation, OperationKind, OperationPayload, SyncReport};
use crate::oplog::OperationLog;
use crate::remote::{ListParams, RemoteError, RemotePatient, RemotePatientService, RemoteResult};
use crate::store::{apply_server_state_in, confirm_in, LocalStore};
use crate::{SyncError, SyncResult};

/// How one dispatch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Dispatch {
    Completed,
    /// Server state won
    Conflict,
    /// Transient failure, scheduled for retry
    Retrying,
    /// Permanent failure, waits for the user
    Rejected,
}

impl Dispatch {
    /// The lane may move on to its next operation.
    fn continues_lane(self) -> bool {
        matches!(self, Dispatch::Completed | Dispatch::Conflict)
    }

    fn tally(self, report: &mut SyncReport) {
        match self {
            Dispatch::Completed => report.completed += 1,
            Dispatch::Conflict => report.conflicts += 1,
            Dispatch::Retrying => report.transient_failures += 1,
            Dispatch::Rejected => report.permanent_failures += 1,
        }
    }
}

/// Runs sync passes: one entity lane per task, several lanes at once.
pub struct SyncCoordinator {
    storage: Storage,
    store: LocalStore,
    log: OperationLog,
    remote: Arc<dyn RemotePatientService>,
    hub: Arc<EventHub>,
    policy: RetryPolicy,
    request_timeout: Duration,
    max_lanes: usize,
    pull_on_sync: bool,
    /// Held for the duration of a pass
    pass_gate: tokio::sync::Mutex<()>,
    finished: Notify,
    last_report: Mutex<SyncReport>,
    syncing: AtomicBool,
    cancelled: AtomicBool,
}

impl SyncCoordinator {
    pub fn new(
        storage: Storage,
        store: LocalStore,
        log: OperationLog,
        remote: Arc<dyn RemotePatientService>,
        hub: Arc<EventHub>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            storage,
            store,
            log,
            remote,
            hub,
            policy: RetryPolicy::from_config(config),
            request_timeout: config.request_timeout(),
            max_lanes: config.max_concurrent_lanes.max(1),
            pull_on_sync: config.pull_on_sync,
            pass_gate: tokio::sync::Mutex::new(()),
            finished: Notify::new(),
            last_report: Mutex::new(SyncReport::default()),
            syncing: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn is_syncing(&self) -> bool {
        self.syncing.load(Ordering::Acquire)
    }

    /// Stop dispatching. Requests already sent are allowed to finish.
    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            info!("sync cancelled; no new operations will be dispatched");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Completion time of the last finished pass.
    pub fn last_sync(&self) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self
            .storage
            .read(|db| db.get_sync_timestamp(LAST_SYNC_KEY))?)
    }

    /// Report of the last finished pass.
    pub fn last_report(&self) -> SyncReport {
        match self.last_report.lock() {
            Ok(report) => report.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// When the earliest transient failure becomes due again.
    pub fn next_retry_at(&self) -> SyncResult<Option<DateTime<Utc>>> {
        Ok(self.log.next_retry_at()?)
    }

    /// Make transient failures due now, e.g. after the network returns.
    pub fn resume_retries(&self) -> SyncResult<usize> {
        Ok(self.log.resume_retries()?)
    }

    /// Wait until no pass is running.
    pub async fn wait_idle(&self) {
        let _idle = self.pass_gate.lock().await;
    }

    /// Run one sync pass: drain every ready lane, then pull server changes.
    ///
    /// If a pass is already running this waits for it and returns its report
    /// instead of starting another.
    pub async fn run_pass(self: &Arc<Self>) -> SyncResult<SyncReport> {
        if self.is_cancelled() {
            return Err(SyncError::ShutDown);
        }
        let _gate = match self.pass_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => {
                debug!("sync pass already running; joining it");
                let _joined = self.pass_gate.lock().await;
                return Ok(self.last_report());
            }
        };

        self.syncing.store(true, Ordering::Release);
        self.hub
            .publish(SyncEvent::SyncStatusChanged(StatusChange::PassStarted));

        let result = self.pass().await;

        self.syncing.store(false, Ordering::Release);
        if let Ok(report) = &result {
            match self.last_report.lock() {
                Ok(mut last) => *last = report.clone(),
                Err(poisoned) => *poisoned.into_inner() = report.clone(),
            }
        }
        self.hub.flush();
        self.hub
            .publish(SyncEvent::SyncStatusChanged(StatusChange::PassFinished));
        self.finished.notify_one();
        result
    }

    /// Resolves after the next pass finishes, or at once if one finished
    /// since the last call.
    pub(crate) async fn pass_finished(&self) {
        self.finished.notified().await;
    }

    #[instrument(skip(self), name = "sync_pass")]
    async fn pass(self: &Arc<Self>) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();
        self.drain(&mut report).await?;

        if self.pull_on_sync && !self.is_cancelled() {
            match self.pull().await {
                Ok(pulled) => report.pulled = pulled,
                Err(SyncError::StorageFailure(e)) => return Err(SyncError::StorageFailure(e)),
                Err(e) => warn!(error = %e, "pulling server changes failed"),
            }
        }

        self.storage
            .write(|db| db.set_sync_timestamp(LAST_SYNC_KEY, Utc::now()))?;
        self.hub.mark_dirty(ChangeKind::SyncStatusChanged);
        info!(
            completed = report.completed,
            conflicts = report.conflicts,
            retrying = report.transient_failures,
            rejected = report.permanent_failures,
            pulled = report.pulled,
            "sync pass finished"
        );
        Ok(report)
    }

    /// Dispatch ready lane heads, `max_lanes` at a time. Each lane is drained
    /// at most once per pass, so a failing lane is not retried in a loop.
    async fn drain(self: &Arc<Self>, report: &mut SyncReport) -> SyncResult<()> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut lanes: JoinSet<(String, SyncResult<SyncReport>)> = JoinSet::new();
        let mut failure: Option<SyncError> = None;
        let mut stranded = false;

        loop {
            while failure.is_none() && lanes.len() < self.max_lanes && !self.is_cancelled() {
                let head = match self.log.peek_next(&visited, Utc::now()) {
                    Ok(Some(head)) => head,
                    Ok(None) => break,
                    Err(e) => {
                        failure = Some(e.into());
                        break;
                    }
                };
                let local_id = head.target_local_id;
                visited.insert(local_id.clone());
                let this = Arc::clone(self);
                lanes.spawn(async move {
                    let result = this.drain_lane(&local_id).await;
                    (local_id, result)
                });
            }

            // Running lanes always finish, even after a failure.
            let Some(joined) = lanes.join_next().await else {
                break;
            };
            match joined {
                Ok((_, Ok(lane))) => report.absorb(&lane),
                Ok((local_id, Err(e))) => {
                    error!(%local_id, error = %e, "sync lane failed");
                    stranded = true;
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    error!(error = %e, "sync lane task aborted");
                    stranded = true;
                }
            }
        }

        if stranded {
            // Every lane has been joined, so anything still in flight is an
            // orphan of a failed lane.
            self.log.recover()?;
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Dispatch one lane's operations in order until it is empty or blocked.
    async fn drain_lane(&self, local_id: &str) -> SyncResult<SyncReport> {
        let mut report = SyncReport::default();
        while !self.is_cancelled() {
            let Some(op) = self.log.next_in_lane(local_id, Utc::now())? else {
                break;
            };
            let outcome = self.dispatch(op).await?;
            outcome.tally(&mut report);
            if !outcome.continues_lane() {
                break;
            }
        }
        Ok(report)
    }

    #[instrument(skip(self, op), fields(op_id = %op.id, local_id = %op.target_local_id, kind = ?op.kind()))]
    async fn dispatch(&self, op: Operation) -> SyncResult<Dispatch> {
        let op = self.log.mark_in_flight(&op.id)?;
        self.hub.flush();
        debug!(attempt = op.attempts, "dispatching");

        let stored = self.store.get_stored(&op.target_local_id)?;
        let base_version = stored.as_ref().map_or(0, |s| s.record.sync.version);
        let remote_id = stored.and_then(|s| s.record.sync.remote_id);

        let outcome = match (&op.payload, remote_id) {
            (OperationPayload::Create(data), _) => {
                let result = self.call(self.remote.create_patient(data, op.id)).await;
                self.settle_write(&op, result, true)?
            }
            (OperationPayload::Update(patch), Some(remote_id)) => {
                let result = self
                    .call(self.remote.update_patient(&remote_id, patch, base_version, op.id))
                    .await;
                match result {
                    Err(RemoteError::Conflict { current }) => {
                        self.resolve_conflict(&op, &remote_id, current).await?
                    }
                    Err(RemoteError::NotFound(_)) => self.resolve_remote_deletion(&op)?,
                    other => self.settle_write(&op, other, false)?,
                }
            }
            (OperationPayload::Delete, Some(remote_id)) => {
                let result = self
                    .call(self.remote.delete_patient(&remote_id, base_version, op.id))
                    .await;
                match result {
                    // Already gone is what we wanted
                    Ok(()) | Err(RemoteError::NotFound(_)) => self.settle_delete(&op)?,
                    Err(RemoteError::Conflict { current }) => {
                        self.resolve_conflict(&op, &remote_id, current).await?
                    }
                    Err(e) => self.fail(&op, e)?,
                }
            }
            (OperationPayload::Update(_), None) => {
                self.reject(&op, "patient has no server id yet")?
            }
            // The server never saw this patient.
            (OperationPayload::Delete, None) => self.settle_delete(&op)?,
        };

        self.hub.flush();
        Ok(outcome)
    }

    /// Bound a remote call by the request timeout.
    async fn call<T>(&self, request: impl Future<Output = RemoteResult<T>>) -> RemoteResult<T> {
        tokio::time::timeout(self.request_timeout, request)
            .await
            .unwrap_or_else(|_| Err(RemoteError::Timeout))
    }

    /// Record a confirmed create or update.
    ///
    /// Server-normalized fields are only copied into the local record when no
    /// later operation of the lane is still waiting, so queued local edits
    /// stay visible.
    fn settle_write(
        &self,
        op: &Operation,
        result: RemoteResult<RemotePatient>,
        link: bool,
    ) -> SyncResult<Dispatch> {
        let remote = match result {
            Ok(remote) => remote,
            Err(e) => return self.fail(op, e),
        };
        let local_id = op.target_local_id.as_str();
        let synced_at = Utc::now();
        let remote_id = link.then_some(remote.id.as_str());

        let (_, refreshed) = self.log.complete(&op.id, |db| {
            confirm_in(db, local_id, remote_id, remote.version, synced_at)?;
            if db.has_open_operations(local_id)? {
                return Ok(false);
            }
            apply_server_state_in(
                db,
                local_id,
                &remote.data,
                remote.version,
                remote.updated_at,
                synced_at,
            )
        })?;
        self.store.mark_changed();
        info!(remote_id = %remote.id, version = remote.version, refreshed, "operation confirmed");
        Ok(Dispatch::Completed)
    }

    /// The delete is confirmed: the tombstone can go.
    fn settle_delete(&self, op: &Operation) -> SyncResult<Dispatch> {
        let local_id = op.target_local_id.as_str();
        self.log.complete(&op.id, |db| db.purge_patient(local_id))?;
        self.store.mark_changed();
        info!("delete confirmed");
        Ok(Dispatch::Completed)
    }

    /// Server authority: replace the local record with the server's state,
    /// complete the operation, then tell observers.
    async fn resolve_conflict(
        &self,
        op: &Operation,
        remote_id: &str,
        current: Option<Box<RemotePatient>>,
    ) -> SyncResult<Dispatch> {
        let server = match current {
            Some(current) => *current,
            None => match self.call(self.remote.get_patient(remote_id)).await {
                Ok(current) => current,
                Err(RemoteError::NotFound(_)) => return self.resolve_remote_deletion(op),
                Err(e) => return self.fail(op, e),
            },
        };

        let local_id = op.target_local_id.as_str();
        let synced_at = Utc::now();
        self.log.complete(&op.id, |db| {
            apply_server_state_in(
                db,
                local_id,
                &server.data,
                server.version,
                server.updated_at,
                synced_at,
            )
        })?;
        self.store.mark_changed();
        warn!(server_version = server.version, "local change superseded by server");

        self.hub.flush();
        self.hub
            .publish(SyncEvent::SyncStatusChanged(StatusChange::ConflictResolved {
                operation_id: op.id,
                local_id: op.target_local_id.clone(),
                server_version: Some(server.version),
            }));
        Ok(Dispatch::Conflict)
    }

    /// The server no longer has the patient: drop it locally along with any
    /// work still queued for it.
    fn resolve_remote_deletion(&self, op: &Operation) -> SyncResult<Dispatch> {
        let local_id = op.target_local_id.as_str();
        self.log.complete(&op.id, |db| {
            db.delete_open_lane(local_id)?;
            db.purge_patient(local_id)
        })?;
        self.store.mark_changed();
        warn!("patient was deleted on the server; local copy removed");

        self.hub.flush();
        self.hub
            .publish(SyncEvent::SyncStatusChanged(StatusChange::ConflictResolved {
                operation_id: op.id,
                local_id: op.target_local_id.clone(),
                server_version: None,
            }));
        Ok(Dispatch::Conflict)
    }

    fn fail(&self, op: &Operation, err: RemoteError) -> SyncResult<Dispatch> {
        if !err.is_transient() {
            return self.reject(op, &err.to_string());
        }

        let delay = self.policy.delay_for(op.attempts);
        let retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        let message = err.to_string();
        let op = self.log.mark_failed(&op.id, &message, Some(retry_at))?;
        warn!(
            attempts = op.attempts,
            retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            error = %message,
            "transient failure; will retry"
        );

        if self.policy.should_warn(op.attempts) {
            self.hub.flush();
            self.hub
                .publish(SyncEvent::SyncStatusChanged(StatusChange::RetryThresholdReached {
                    operation_id: op.id,
                    local_id: op.target_local_id.clone(),
                    attempts: op.attempts,
                    message,
                }));
        }
        Ok(Dispatch::Retrying)
    }

    fn reject(&self, op: &Operation, message: &str) -> SyncResult<Dispatch> {
        self.log.mark_failed(&op.id, message, None)?;
        error!(error = message, "operation rejected; waiting for the user");

        self.hub.flush();
        self.hub
            .publish(SyncEvent::SyncStatusChanged(StatusChange::OperationRejected {
                operation_id: op.id,
                local_id: op.target_local_id.clone(),
                message: message.to_string(),
            }));
        Ok(Dispatch::Rejected)
    }

    /// Fetch server changes since the last pull and merge them.
    async fn pull(&self) -> SyncResult<usize> {
        // A create the server applied without us hearing back would come
        // back as a stranger and be imported twice.
        let unconfirmed_create = self
            .log
            .list_open()?
            .iter()
            .any(|op| op.kind() == OperationKind::Create && op.attempts > 0 && !op.terminal);
        if unconfirmed_create {
            debug!("pull deferred until dispatched creates are confirmed");
            return Ok(0);
        }

        let since = self.storage.read(|db| db.get_sync_timestamp(LAST_PULL_KEY))?;
        let params = ListParams {
            updated_since: since,
            ..Default::default()
        };
        let fetched = self.call(self.remote.list_patients(&params)).await?;
        let Some(watermark) = fetched.iter().map(|p| p.updated_at).max() else {
            return Ok(0);
        };

        let synced_at = Utc::now();
        let changed = self.storage.write(|db| {
            let mut changed = 0;
            for patient in &fetched {
                if merge_in(db, patient, synced_at)?.changed() {
                    changed += 1;
                }
            }
            db.set_sync_timestamp(LAST_PULL_KEY, watermark)?;
            Ok(changed)
        })?;
        if changed > 0 {
            self.store.mark_changed();
        }
        debug!(fetched = fetched.len(), changed, "pulled server changes");
        Ok(changed)
    }
}
