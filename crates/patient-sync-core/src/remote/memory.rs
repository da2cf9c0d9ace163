//! In-memory patient server.
//!
//! Behaves like the REST service (versions, idempotency keys, normalization,
//! optimistic concurrency) and adds knobs for failure injection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;
use uuid::Uuid;

use super::{ListParams, RemoteError, RemotePatient, RemotePatientService, RemoteResult};
use crate::models::{PatientData, PatientPatch};

/// A call as received by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    List,
    Get {
        remote_id: String,
    },
    Create {
        key: Uuid,
    },
    Update {
        remote_id: String,
        base_version: i64,
        key: Uuid,
    },
    Delete {
        remote_id: String,
        base_version: i64,
        key: Uuid,
    },
}

impl RemoteCall {
    pub fn key(&self) -> Option<Uuid> {
        match self {
            RemoteCall::Create { key }
            | RemoteCall::Update { key, .. }
            | RemoteCall::Delete { key, .. } => Some(*key),
            RemoteCall::List | RemoteCall::Get { .. } => None,
        }
    }
}

type LatencyFn = Arc<dyn Fn(&RemoteCall) -> Duration + Send + Sync>;

#[derive(Debug, Clone)]
enum Settled {
    Patient(RemotePatient),
    Deleted,
}

#[derive(Default)]
struct ServerState {
    next_id: u64,
    records: BTreeMap<String, RemotePatient>,
    /// Successful outcomes by idempotency key
    ledger: HashMap<Uuid, Settled>,
    calls: Vec<RemoteCall>,
    applied: Vec<RemoteCall>,
    injected: VecDeque<RemoteError>,
    offline: bool,
    dropped_responses: usize,
}

impl ServerState {
    fn assign_id(&mut self) -> String {
        self.next_id += 1;
        format!("p-{}", self.next_id)
    }

    /// Offline and injected failures, checked before anything is applied.
    fn gate(&mut self) -> RemoteResult<()> {
        if self.offline {
            return Err(RemoteError::Transient("server unreachable".into()));
        }
        match self.injected.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Lose the response of an applied change, if requested.
    fn take_dropped(&mut self) -> bool {
        if self.dropped_responses > 0 {
            self.dropped_responses -= 1;
            true
        } else {
            false
        }
    }
}

/// Test double for [`RemotePatientService`].
#[derive(Clone, Default)]
pub struct InMemoryPatientService {
    state: Arc<Mutex<ServerState>>,
    latency: Arc<Mutex<Option<LatencyFn>>>,
}

impl InMemoryPatientService {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Fail the next call with `err` without applying it.
    pub fn fail_next(&self, err: RemoteError) {
        self.state().injected.push_back(err);
    }

    /// Refuse every call with a transient error while set.
    pub fn set_offline(&self, offline: bool) {
        self.state().offline = offline;
    }

    /// Apply the next mutation but report a transient failure, as if the
    /// response was lost on the way back.
    pub fn drop_next_response(&self) {
        self.state().dropped_responses += 1;
    }

    /// Delay each call by `latency(call)` before the server handles it.
    pub fn set_latency<F>(&self, latency: F)
    where
        F: Fn(&RemoteCall) -> Duration + Send + Sync + 'static,
    {
        let mut slot = match self.latency.lock() {
            Ok(slot) => slot,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Some(Arc::new(latency));
    }

    /// Seed a record as if another client created it.
    pub fn insert_remote(&self, data: PatientData) -> RemotePatient {
        let mut state = self.state();
        let id = state.assign_id();
        let patient = RemotePatient {
            id: id.clone(),
            version: 1,
            data: normalize(data),
            updated_at: Utc::now(),
        };
        state.records.insert(id, patient.clone());
        patient
    }

    /// Change a record as if another client edited it. Bumps the version.
    pub fn edit_remote(
        &self,
        remote_id: &str,
        edit: impl FnOnce(&mut PatientData),
    ) -> Option<RemotePatient> {
        let mut state = self.state();
        let patient = state.records.get_mut(remote_id)?;
        edit(&mut patient.data);
        patient.data = normalize(std::mem::take(&mut patient.data));
        patient.version += 1;
        patient.updated_at = Utc::now();
        Some(patient.clone())
    }

    /// Bump a record's version without changing its content.
    pub fn bump_version(&self, remote_id: &str) -> Option<i64> {
        self.edit_remote(remote_id, |_| {}).map(|p| p.version)
    }

    /// Delete a record as if another client removed it.
    pub fn remove_remote(&self, remote_id: &str) -> Option<RemotePatient> {
        self.state().records.remove(remote_id)
    }

    pub fn get(&self, remote_id: &str) -> Option<RemotePatient> {
        self.state().records.get(remote_id).cloned()
    }

    /// All records, ordered by server ID.
    pub fn all(&self) -> Vec<RemotePatient> {
        self.state().records.values().cloned().collect()
    }

    /// Every call received, in arrival order.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.state().calls.clone()
    }

    /// Mutations that changed server state, in the order they took effect.
    pub fn applied(&self) -> Vec<RemoteCall> {
        self.state().applied.clone()
    }

    async fn arrive(&self, call: RemoteCall) {
        let delay = {
            let latency = match self.latency.lock() {
                Ok(latency) => latency.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            };
            latency.map(|f| f(&call)).unwrap_or_default()
        };
        debug!(?call, ?delay, "remote call received");
        self.state().calls.push(call);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl RemotePatientService for InMemoryPatientService {
    async fn list_patients(&self, params: &ListParams) -> RemoteResult<Vec<RemotePatient>> {
        self.arrive(RemoteCall::List).await;
        let mut state = self.state();
        state.gate()?;

        let search = params.search.as_deref().map(str::to_lowercase);
        let mut patients: Vec<RemotePatient> = state
            .records
            .values()
            .filter(|p| params.updated_since.map_or(true, |since| p.updated_at > since))
            .filter(|p| {
                search
                    .as_deref()
                    .map_or(true, |q| p.data.full_name().to_lowercase().contains(q))
            })
            .cloned()
            .collect();
        patients.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        if let Some(limit) = params.limit {
            patients.truncate(limit as usize);
        }
        Ok(patients)
    }

    async fn get_patient(&self, remote_id: &str) -> RemoteResult<RemotePatient> {
        self.arrive(RemoteCall::Get {
            remote_id: remote_id.to_string(),
        })
        .await;
        let mut state = self.state();
        state.gate()?;
        state
            .records
            .get(remote_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))
    }

    async fn create_patient(
        &self,
        payload: &PatientData,
        idempotency_key: Uuid,
    ) -> RemoteResult<RemotePatient> {
        let call = RemoteCall::Create {
            key: idempotency_key,
        };
        self.arrive(call.clone()).await;
        let mut state = self.state();
        state.gate()?;

        if let Some(Settled::Patient(patient)) = state.ledger.get(&idempotency_key) {
            return Ok(patient.clone());
        }

        let data = normalize(payload.clone());
        validate(&data)?;
        let id = state.assign_id();
        let patient = RemotePatient {
            id: id.clone(),
            version: 1,
            data,
            updated_at: Utc::now(),
        };
        state.records.insert(id, patient.clone());
        state
            .ledger
            .insert(idempotency_key, Settled::Patient(patient.clone()));
        state.applied.push(call);

        if state.take_dropped() {
            return Err(RemoteError::Transient("response lost".into()));
        }
        Ok(patient)
    }

    async fn update_patient(
        &self,
        remote_id: &str,
        patch: &PatientPatch,
        base_version: i64,
        idempotency_key: Uuid,
    ) -> RemoteResult<RemotePatient> {
        let call = RemoteCall::Update {
            remote_id: remote_id.to_string(),
            base_version,
            key: idempotency_key,
        };
        self.arrive(call.clone()).await;
        let mut state = self.state();
        state.gate()?;

        if let Some(Settled::Patient(patient)) = state.ledger.get(&idempotency_key) {
            return Ok(patient.clone());
        }

        let current = state
            .records
            .get(remote_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;
        if current.version != base_version {
            return Err(RemoteError::Conflict {
                current: Some(Box::new(current)),
            });
        }

        let mut data = current.data.clone();
        data.apply(patch);
        let data = normalize(data);
        validate(&data)?;
        let patient = RemotePatient {
            id: current.id,
            version: current.version + 1,
            data,
            updated_at: Utc::now(),
        };
        state.records.insert(remote_id.to_string(), patient.clone());
        state
            .ledger
            .insert(idempotency_key, Settled::Patient(patient.clone()));
        state.applied.push(call);

        if state.take_dropped() {
            return Err(RemoteError::Transient("response lost".into()));
        }
        Ok(patient)
    }

    async fn delete_patient(
        &self,
        remote_id: &str,
        base_version: i64,
        idempotency_key: Uuid,
    ) -> RemoteResult<()> {
        let call = RemoteCall::Delete {
            remote_id: remote_id.to_string(),
            base_version,
            key: idempotency_key,
        };
        self.arrive(call.clone()).await;
        let mut state = self.state();
        state.gate()?;

        if let Some(Settled::Deleted) = state.ledger.get(&idempotency_key) {
            return Ok(());
        }

        let current = state
            .records
            .get(remote_id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(remote_id.to_string()))?;
        if current.version != base_version {
            return Err(RemoteError::Conflict {
                current: Some(Box::new(current)),
            });
        }

        state.records.remove(remote_id);
        state.ledger.insert(idempotency_key, Settled::Deleted);
        state.applied.push(call);

        if state.take_dropped() {
            return Err(RemoteError::Transient("response lost".into()));
        }
        Ok(())
    }
}

/// Server-side canonical form: trimmed names, lowercase email.
fn normalize(mut data: PatientData) -> PatientData {
    data.first_name = data.first_name.trim().to_string();
    data.last_name = data.last_name.trim().to_string();
    data.email = data
        .email
        .map(|email| email.trim().to_lowercase())
        .filter(|email| !email.is_empty());
    data
}

fn validate(data: &PatientData) -> RemoteResult<()> {
    if data.first_name.is_empty() || data.last_name.is_empty() {
        return Err(RemoteError::Validation(
            "first_name and last_name are required".into(),
        ));
    }
    Ok(())
}
