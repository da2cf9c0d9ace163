//! The sync engine facade.
//!
//! [`SyncEngine`] owns the local store, the operation log, the connectivity
//! monitor and the coordinator, and is the only type applications need.
//! Construct one per database with [`SyncEngine::initialize`] and release it
//! with [`SyncEngine::destroy`].

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::connectivity::{Connectivity, ConnectivityMonitor, ConnectivitySignal};
use crate::db::{Database, DbError, DbResult, Storage};
use crate::events::{ChangeKind, EventHub, SubscriptionId, SyncEvent};
use crate::models::{
    Operation, OperationKind, OperationPayload, PatientData, PatientPatch, PatientRecord,
    SyncReport, SyncStatus,
};
use crate::oplog::{enqueue_in, log_enqueue, EnqueueOutcome, OperationLog};
use crate::remote::RemotePatientService;
use crate::store::LocalStore;
use crate::sync::{run_scheduler, SyncCoordinator};
use crate::{SyncError, SyncResult};

/// Offline-first patient records with background sync.
///
/// Writes land locally and return immediately; the server catches up when
/// the client is online. Every method is safe to call while offline.
pub struct SyncEngine {
    storage: Storage,
    store: LocalStore,
    log: OperationLog,
    hub: Arc<EventHub>,
    monitor: Arc<ConnectivityMonitor>,
    coordinator: Arc<SyncCoordinator>,
    shutdown: watch::Sender<bool>,
    scheduler: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl SyncEngine {
    /// Open storage, recover interrupted work and start watching
    /// connectivity. Does not sync.
    ///
    /// Must be called from within a Tokio runtime.
    #[instrument(skip_all, fields(db = ?config.database_path))]
    pub async fn initialize(
        config: SyncConfig,
        remote: Arc<dyn RemotePatientService>,
        connectivity: ConnectivitySignal,
    ) -> SyncResult<Self> {
        config.validate()?;

        let hub = Arc::new(EventHub::new(config.event_buffer));
        let storage = Storage::open(config.database_path.as_deref())?;
        let store = LocalStore::new(storage.clone(), Arc::clone(&hub));
        let log = OperationLog::new(storage.clone(), Arc::clone(&hub));
        log.recover()?;

        let monitor = Arc::new(ConnectivityMonitor::start(connectivity, Arc::clone(&hub)));
        let coordinator = Arc::new(SyncCoordinator::new(
            storage.clone(),
            store.clone(),
            log.clone(),
            remote,
            Arc::clone(&hub),
            &config,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        let scheduler = tokio::spawn(run_scheduler(
            Arc::clone(&coordinator),
            Arc::clone(&monitor),
            monitor.subscribe(),
            shutdown_rx,
            config.sweep_interval(),
        ));

        // Drop changes marked during recovery; nobody has subscribed yet.
        hub.flush();
        info!(
            online = monitor.is_online(),
            pending = log.pending_count()?,
            "sync engine initialized"
        );

        Ok(Self {
            storage,
            store,
            log,
            hub,
            monitor,
            coordinator,
            shutdown,
            scheduler: Mutex::new(Some(scheduler)),
            destroyed: AtomicBool::new(false),
        })
    }

    /// Open with configuration loaded from `file` and the environment.
    pub async fn from_config_file(
        file: Option<&Path>,
        remote: Arc<dyn RemotePatientService>,
        connectivity: ConnectivitySignal,
    ) -> SyncResult<Self> {
        let config = SyncConfig::load(file)?;
        Self::initialize(config, remote, connectivity).await
    }

    /// Stop the monitor and the scheduler, let requests already sent finish,
    /// and drop every subscription. Later calls fail with `ShutDown`.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down sync engine");

        self.coordinator.cancel();
        self.monitor.stop();
        let _ = self.shutdown.send(true);

        self.coordinator.wait_idle().await;
        let scheduler = match self.scheduler.lock() {
            Ok(mut scheduler) => scheduler.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(scheduler) = scheduler {
            let _ = scheduler.await;
        }

        self.hub.clear();
        debug!("sync engine shut down");
    }

    fn ensure_live(&self) -> SyncResult<()> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(SyncError::ShutDown);
        }
        Ok(())
    }

    // =========================================================================
    // Patient Operations
    // =========================================================================

    /// Store a new patient and queue its creation on the server.
    #[instrument(skip_all)]
    pub async fn save_patient(&self, data: PatientData) -> SyncResult<PatientRecord> {
        self.ensure_live()?;
        let record = PatientRecord::new(data);
        let op = Operation::new(
            record.local_id.clone(),
            OperationPayload::Create(record.data.clone()),
        );

        let outcome = self.store_write(|db| {
            db.upsert_patient(&record)?;
            enqueue_in(db, &op)
        })?;
        log_enqueue(&op, &outcome);
        self.hub.flush();

        self.read_back(&record.local_id)
    }

    /// Merge `patch` into a patient and queue the update.
    ///
    /// A patch that leaves the patient unchanged writes and queues nothing.
    #[instrument(skip(self, patch))]
    pub async fn update_patient(
        &self,
        local_id: &str,
        patch: PatientPatch,
    ) -> SyncResult<PatientRecord> {
        self.ensure_live()?;

        let queued = self.store_write(|db| {
            let mut record = db
                .get_patient(local_id)?
                .ok_or_else(|| DbError::NotFound(local_id.to_string()))?;
            let before = record.data.content_hash();
            record.data.apply(&patch);
            if record.data.content_hash() == before {
                return Ok(None);
            }

            record.updated_at = Utc::now();
            db.upsert_patient(&record)?;
            let op = Operation::new(local_id, OperationPayload::Update(patch.clone()));
            let outcome = enqueue_in(db, &op)?;
            Ok(Some((op, outcome)))
        })?;

        match queued {
            Some((op, outcome)) => {
                log_enqueue(&op, &outcome);
                self.hub.flush();
            }
            None => debug!("update changes nothing; skipped"),
        }
        self.read_back(local_id)
    }

    /// Remove a patient from every read now and queue the deletion.
    ///
    /// A patient the server never heard of is dropped outright.
    #[instrument(skip(self))]
    pub async fn delete_patient(&self, local_id: &str) -> SyncResult<()> {
        self.ensure_live()?;
        let op = Operation::new(local_id, OperationPayload::Delete);

        let outcome = self.store_write(|db| {
            if db.get_patient(local_id)?.is_none() {
                return Err(DbError::NotFound(local_id.to_string()));
            }
            let outcome = enqueue_in(db, &op)?;
            match outcome {
                EnqueueOutcome::Collapsed { .. } => db.purge_patient(local_id)?,
                EnqueueOutcome::Appended { .. } => db.tombstone_patient(local_id)?,
            };
            Ok(outcome)
        })?;
        log_enqueue(&op, &outcome);
        self.hub.flush();
        Ok(())
    }

    pub async fn get_patient(&self, local_id: &str) -> SyncResult<Option<PatientRecord>> {
        self.ensure_live()?;
        Ok(self.store.get(local_id)?)
    }

    /// Patients matching `query`, best match first.
    pub async fn search_patients(&self, query: &str) -> SyncResult<Vec<PatientRecord>> {
        self.ensure_live()?;
        Ok(self.store.search(query)?)
    }

    /// Every patient, ordered by name.
    pub async fn get_all_patients(&self) -> SyncResult<Vec<PatientRecord>> {
        self.ensure_live()?;
        Ok(self.store.list()?)
    }

    // =========================================================================
    // Sync Operations
    // =========================================================================

    /// Run a sync pass now and wait for it.
    ///
    /// Offline, this returns a skipped report instead of failing. If a pass is
    /// already running, this waits for that one.
    pub async fn sync_with_server(&self) -> SyncResult<SyncReport> {
        self.ensure_live()?;
        if !self.monitor.is_online() {
            debug!("offline; sync skipped");
            return Ok(SyncReport::skipped());
        }
        self.coordinator.run_pass().await
    }

    pub async fn get_sync_status(&self) -> SyncResult<SyncStatus> {
        self.ensure_live()?;
        Ok(SyncStatus {
            is_online: self.monitor.is_online(),
            is_syncing: self.coordinator.is_syncing(),
            last_sync: self.coordinator.last_sync()?,
            pending_operations: self.log.pending_count()?,
            failed_operations: self.log.failed_count()?,
            total_patients: self.store.count()?,
        })
    }

    pub fn connectivity(&self) -> Connectivity {
        self.monitor.state()
    }

    // =========================================================================
    // Operation Log
    // =========================================================================

    /// Operations not yet confirmed, in the order they were queued.
    pub async fn pending_operations(&self) -> SyncResult<Vec<Operation>> {
        self.ensure_live()?;
        Ok(self.log.list_open()?)
    }

    /// Operations the server rejected, waiting for the user.
    pub async fn failed_operations(&self) -> SyncResult<Vec<Operation>> {
        self.ensure_live()?;
        Ok(self.log.list_failed()?)
    }

    /// Queue a failed operation for dispatch again.
    pub async fn retry_operation(&self, id: Uuid) -> SyncResult<Operation> {
        self.ensure_live()?;
        let op = self.log.retry(&id)?;
        self.hub.flush();
        Ok(op)
    }

    /// Give up on an operation.
    ///
    /// Abandoning a create drops the patient and everything queued for it;
    /// abandoning a delete brings the patient back.
    pub async fn abandon_operation(&self, id: Uuid) -> SyncResult<()> {
        self.ensure_live()?;
        self.log.abandon(&id, |db, op| {
            let local_id = op.target_local_id.as_str();
            match op.kind() {
                OperationKind::Create => {
                    db.delete_open_lane(local_id)?;
                    db.purge_patient(local_id)?;
                }
                OperationKind::Delete => {
                    db.restore_patient(local_id)?;
                }
                OperationKind::Update => {}
            }
            Ok(())
        })?;
        self.store.mark_changed();
        self.hub.flush();
        Ok(())
    }

    /// Delete confirmed operations older than `age`.
    pub async fn prune_completed(&self, age: Duration) -> SyncResult<usize> {
        self.ensure_live()?;
        // An age past the representable range leaves nothing old enough.
        let Some(cutoff) = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return Ok(0);
        };
        let pruned = self.log.prune_completed(cutoff)?;
        if pruned > 0 {
            info!(count = pruned, "pruned completed operations");
        }
        Ok(pruned)
    }

    // =========================================================================
    // Subscriptions
    // =========================================================================

    /// Register a change callback. See [`EventHub::subscribe`].
    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.hub.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.hub.unsubscribe(id)
    }

    /// Broadcast receiver of change events.
    pub fn receiver(&self) -> broadcast::Receiver<SyncEvent> {
        self.hub.receiver()
    }

    /// Run a local write in one transaction and mark both kinds of change.
    fn store_write<T>(&self, f: impl FnOnce(&Database) -> DbResult<T>) -> SyncResult<T> {
        let value = self.storage.write(f)?;
        self.store.mark_changed();
        self.hub.mark_dirty(ChangeKind::SyncStatusChanged);
        Ok(value)
    }

    fn read_back(&self, local_id: &str) -> SyncResult<PatientRecord> {
        self.store
            .get(local_id)?
            .ok_or_else(|| SyncError::NotFound(local_id.to_string()))
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            // Cooperative: the scheduler finishes its current pass and exits.
            self.coordinator.cancel();
            self.monitor.stop();
            let _ = self.shutdown.send(true);
        }
    }
}
