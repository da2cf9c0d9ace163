//! End-to-end tests of the sync engine against the in-memory server.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use patient_sync_core::connectivity::channel;
use patient_sync_core::remote::RemoteCall;
use patient_sync_core::{
    ConnectivityHandle, InMemoryPatientService, OperationKind, PatientData, PatientPatch,
    RemoteError, StatusChange, SyncConfig, SyncEngine, SyncEvent,
};

fn fast_retries(mut config: SyncConfig) -> SyncConfig {
    config.retry_base_delay_ms = 1;
    config.retry_max_delay_ms = 1;
    config
}

/// Log to the test harness, filtered by `RUST_LOG`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start(
    config: SyncConfig,
    online: bool,
) -> (SyncEngine, ConnectivityHandle, InMemoryPatientService) {
    init_tracing();
    let server = InMemoryPatientService::new();
    let (handle, signal) = channel(online);
    let engine = SyncEngine::initialize(config, Arc::new(server.clone()), signal)
        .await
        .unwrap();
    (engine, handle, server)
}

/// Flip reachability and wait until the engine has seen it.
async fn set_online(engine: &SyncEngine, handle: &ConnectivityHandle, online: bool) {
    handle.set_online(online);
    for _ in 0..200 {
        if engine.connectivity().is_online() == online {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("engine never saw online={}", online);
}

/// Wait for the background scheduler to empty the queue.
async fn wait_for_drain(engine: &SyncEngine) {
    for _ in 0..400 {
        if engine.get_sync_status().await.unwrap().pending_operations == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("queue never drained");
}

fn phone(number: &str) -> PatientPatch {
    PatientPatch {
        phone: Some(Some(number.to_string())),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_create_is_linked_to_server_id() {
    let (engine, _handle, server) = start(SyncConfig::in_memory(), true).await;

    let saved = engine
        .save_patient(PatientData::new("Ada", "Lovelace"))
        .await
        .unwrap();
    assert!(saved.sync.dirty);

    let report = engine.sync_with_server().await.unwrap();
    assert_eq!(report.completed, 1);

    let synced = engine.get_patient(&saved.local_id).await.unwrap().unwrap();
    assert_eq!(synced.local_id, saved.local_id);
    assert_eq!(synced.sync.remote_id.as_deref(), Some("p-1"));
    assert_eq!(synced.sync.version, 1);
    assert!(!synced.sync.dirty);
    assert!(synced.sync.last_synced_at.is_some());
    assert_eq!(server.get("p-1").unwrap().data.last_name, "Lovelace");
}

#[tokio::test]
async fn test_offline_edits_replay_in_order() {
    let (engine, handle, server) = start(SyncConfig::in_memory(), false).await;

    let ada = engine
        .save_patient(PatientData::new("Ada", "Lovelace"))
        .await
        .unwrap();
    engine
        .update_patient(&ada.local_id, phone("555-0100"))
        .await
        .unwrap();
    engine
        .update_patient(
            &ada.local_id,
            PatientPatch {
                email: Some(Some("ada@example.com".into())),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let grace = engine
        .save_patient(PatientData::new("Grace", "Hopper"))
        .await
        .unwrap();
    engine
        .update_patient(&grace.local_id, phone("555-0199"))
        .await
        .unwrap();

    let queued = engine.pending_operations().await.unwrap();
    assert_eq!(queued.len(), 5);
    assert!(server.calls().is_empty());

    set_online(&engine, &handle, true).await;
    engine.sync_with_server().await.unwrap();
    wait_for_drain(&engine).await;

    // Each patient's operations reached the server in the order they were made
    let applied: Vec<_> = server.applied().iter().filter_map(RemoteCall::key).collect();
    for local_id in [&ada.local_id, &grace.local_id] {
        let lane: Vec<_> = queued
            .iter()
            .filter(|op| &op.target_local_id == local_id)
            .map(|op| op.id)
            .collect();
        let lane_ids: HashSet<_> = lane.iter().copied().collect();
        let seen: Vec<_> = applied
            .iter()
            .copied()
            .filter(|key| lane_ids.contains(key))
            .collect();
        assert_eq!(seen, lane);
    }

    let ada = engine.get_patient(&ada.local_id).await.unwrap().unwrap();
    assert_eq!(ada.sync.version, 3);
    assert!(!ada.sync.dirty);
    let remote = server.get(ada.sync.remote_id.as_deref().unwrap()).unwrap();
    assert_eq!(remote.data, ada.data);
    assert_eq!(remote.data.phone.as_deref(), Some("555-0100"));
    assert_eq!(remote.data.email.as_deref(), Some("ada@example.com"));
}

#[tokio::test]
async fn test_reconnect_drains_queue_in_background() {
    let (engine, handle, server) = start(SyncConfig::in_memory(), false).await;
    for last_name in ["Lovelace", "Hopper", "Hamilton"] {
        engine
            .save_patient(PatientData::new("Test", last_name))
            .await
            .unwrap();
    }
    assert_eq!(engine.get_sync_status().await.unwrap().pending_operations, 3);

    // No explicit sync: the transition alone starts a pass
    set_online(&engine, &handle, true).await;
    wait_for_drain(&engine).await;

    assert_eq!(server.all().len(), 3);
    let status = engine.get_sync_status().await.unwrap();
    assert!(status.is_online);
    assert_eq!(status.total_patients, 3);
    assert!(status.last_sync.is_some());
}

#[tokio::test]
async fn test_lost_response_is_not_applied_twice() {
    let (engine, _handle, server) = start(fast_retries(SyncConfig::in_memory()), true).await;
    let saved = engine
        .save_patient(PatientData::new("Ada", "Lovelace"))
        .await
        .unwrap();

    server.drop_next_response();
    let report = engine.sync_with_server().await.unwrap();
    assert_eq!(report.transient_failures, 1);

    tokio::time::sleep(Duration::from_millis(10)).await;
    engine.sync_with_server().await.unwrap();
    wait_for_drain(&engine).await;

    // Both attempts carried the same key; the server applied the first only
    let creates: Vec<_> = server
        .calls()
        .into_iter()
        .filter(|call| matches!(call, RemoteCall::Create { .. }))
        .collect();
    assert_eq!(creates.len(), 2);
    assert_eq!(creates[0].key(), creates[1].key());
    assert_eq!(server.applied().len(), 1);
    assert_eq!(server.all().len(), 1);

    let synced = engine.get_patient(&saved.local_id).await.unwrap().unwrap();
    assert_eq!(synced.sync.remote_id.as_deref(), Some("p-1"));
}

#[tokio::test]
async fn test_transient_failure_is_retried_in_background() {
    let (engine, _handle, server) = start(fast_retries(SyncConfig::in_memory()), true).await;
    engine
        .save_patient(PatientData::new("Ada", "Lovelace"))
        .await
        .unwrap();

    server.fail_next(RemoteError::Transient("503 Service Unavailable".into()));
    let report = engine.sync_with_server().await.unwrap();
    assert_eq!(report.transient_failures, 1);
    assert_eq!(engine.get_sync_status().await.unwrap().failed_operations, 0);

    wait_for_drain(&engine).await;
    assert_eq!(server.all().len(), 1);
}

#[tokio::test]
async fn test_reconnect_skips_pending_backoff() {
    let mut config = SyncConfig::in_memory();
    config.retry_base_delay_ms = 60_000;
    config.retry_max_delay_ms = 60_000;
    let (engine, handle, server) = start(config, true).await;
    engine
        .save_patient(PatientData::new("Ada", "Lovelace"))
        .await
        .unwrap();

    server.set_offline(true);
    let report = engine.sync_with_server().await.unwrap();
    assert_eq!(report.transient_failures, 1);
    let status = engine.get_sync_status().await.unwrap();
    assert_eq!(status.pending_operations, 1);
    assert_eq!(status.failed_operations, 0);

    // The network drops and comes back long before the retry is due.
    set_online(&engine, &handle, false).await;
    server.set_offline(false);
    set_online(&engine, &handle, true).await;
    wait_for_drain(&engine).await;

    assert_eq!(server.all().len(), 1);
}

#[tokio::test]
async fn test_delete_supersedes_queued_updates() {
    let (engine, handle, server) = start(SyncConfig::in_memory(), true).await;
    let saved = engine
        .save_patient(PatientData::new("Ada", "Lovelace"))
        .await
        .unwrap();
    engine.sync_with_server().await.unwrap();

    set_online(&engine, &handle, false).await;
    engine
        .update_patient(&saved.local_id, phone("555-0100"))
        .await
        .unwrap();
    engine
        .update_patient(&saved.local_id, phone("555-0101"))
        .await
        .unwrap();
    engine.delete_patient(&saved.local_id).await.unwrap();

    let queued = engine.pending_operations().await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].kind(), OperationKind::Delete);
    assert!(engine.get_patient(&saved.local_id).await.unwrap().is_none());
    assert!(engine.get_all_patients().await.unwrap().is_empty());

    set_online(&engine, &handle, true).await;
    engine.sync_with_server().await.unwrap();
    wait_for_drain(&engine).await;

    assert!(server.get("p-1").is_none());
    assert!(!server
        .calls()
        .iter()
        .any(|call| matches!(call, RemoteCall::Update { .. })));
    assert_eq!(engine.get_sync_status().await.unwrap().total_patients, 0);
}

#[tokio::test]
async fn test_conflict_takes_server_state() {
    let (engine, _handle, server) = start(SyncConfig::in_memory(), true).await;
    let saved = engine
        .save_patient(PatientData::new("Ada", "Lovelace"))
        .await
        .unwrap();
    engine.sync_with_server().await.unwrap();

    server.edit_remote("p-1", |data| data.last_name = "King".into());
    engine
        .update_patient(&saved.local_id, phone("555-0100"))
        .await
        .unwrap();

    let mut events = engine.receiver();
    let report = engine.sync_with_server().await.unwrap();
    assert_eq!(report.conflicts, 1);

    let record = engine.get_patient(&saved.local_id).await.unwrap().unwrap();
    assert_eq!(record.data.last_name, "King");
    assert_eq!(record.data.phone, None);
    assert_eq!(record.sync.version, 2);
    assert!(!record.sync.dirty);
    assert!(engine.pending_operations().await.unwrap().is_empty());

    let mut resolved = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::SyncStatusChanged(StatusChange::ConflictResolved {
            local_id,
            server_version,
            ..
        }) = event
        {
            assert_eq!(local_id, saved.local_id);
            assert_eq!(server_version, Some(2));
            resolved = true;
        }
    }
    assert!(resolved);
}

#[tokio::test]
async fn test_remote_deletion_removes_local_copy() {
    let (engine, _handle, server) = start(SyncConfig::in_memory(), true).await;
    let saved = engine
        .save_patient(PatientData::new("Ada", "Lovelace"))
        .await
        .unwrap();
    engine.sync_with_server().await.unwrap();

    server.remove_remote("p-1");
    engine
        .update_patient(&saved.local_id, phone("555-0100"))
        .await
        .unwrap();
    engine.sync_with_server().await.unwrap();

    assert!(engine.get_patient(&saved.local_id).await.unwrap().is_none());
    assert!(engine.pending_operations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rejected_operation_waits_for_user() {
    let (engine, _handle, server) = start(SyncConfig::in_memory(), true).await;
    let saved = engine
        .save_patient(PatientData::new("Ada", "Lovelace"))
        .await
        .unwrap();

    server.fail_next(RemoteError::Validation("medical_record_number taken".into()));
    let mut events = engine.receiver();
    let report = engine.sync_with_server().await.unwrap();
    assert_eq!(report.permanent_failures, 1);

    let status = engine.get_sync_status().await.unwrap();
    assert_eq!(status.failed_operations, 1);
    assert_eq!(status.pending_operations, 1);

    // The local copy is kept as written
    let record = engine.get_patient(&saved.local_id).await.unwrap().unwrap();
    assert!(record.sync.dirty);
    assert!(record.sync.remote_id.is_none());

    let failed = engine.failed_operations().await.unwrap();
    assert!(failed[0].terminal);
    assert!(failed[0]
        .last_error
        .as_deref()
        .unwrap()
        .contains("medical_record_number"));

    let mut rejected = false;
    while let Ok(event) = events.try_recv() {
        if let SyncEvent::SyncStatusChanged(StatusChange::OperationRejected { local_id, .. }) =
            event
        {
            assert_eq!(local_id, saved.local_id);
            rejected = true;
        }
    }
    assert!(rejected);

    // Another pass does not resend it
    engine.sync_with_server().await.unwrap();
    let creates = server
        .calls()
        .iter()
        .filter(|call| matches!(call, RemoteCall::Create { .. }))
        .count();
    assert_eq!(creates, 1);
}

#[tokio::test]
async fn test_pull_imports_other_clients_records() {
    let (engine, _handle, server) = start(SyncConfig::in_memory(), true).await;
    let remote = server.insert_remote(PatientData::new("Grace", "Hopper"));

    let report = engine.sync_with_server().await.unwrap();
    assert_eq!(report.pulled, 1);

    let all = engine.get_all_patients().await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].sync.remote_id.as_deref(), Some(remote.id.as_str()));
    assert!(!all[0].sync.dirty);
    assert!(engine.pending_operations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_search_ranks_matches() {
    let (engine, _handle, _server) = start(SyncConfig::in_memory(), false).await;
    for (first, last) in [("Ada", "Lovelace"), ("Grace", "Hopper"), ("Ada", "Byron")] {
        engine
            .save_patient(PatientData::new(first, last))
            .await
            .unwrap();
    }

    let hits = engine.search_patients("lovelace").await.unwrap();
    assert_eq!(hits[0].data.last_name, "Lovelace");
    assert!(hits.iter().all(|p| p.data.last_name != "Hopper"));

    let all = engine.get_all_patients().await.unwrap();
    assert_eq!(all.len(), 3);
}

#[tokio::test]
async fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("patients.db");

    let local_id = {
        let (engine, _handle, _server) = start(SyncConfig::with_database(&path), false).await;
        let saved = engine
            .save_patient(PatientData::new("Ada", "Lovelace"))
            .await
            .unwrap();
        engine
            .update_patient(&saved.local_id, phone("555-0100"))
            .await
            .unwrap();
        engine.destroy().await;
        saved.local_id
    };

    let (engine, _handle, server) = start(SyncConfig::with_database(&path), true).await;
    let record = engine.get_patient(&local_id).await.unwrap().unwrap();
    assert_eq!(record.data.phone.as_deref(), Some("555-0100"));
    assert!(record.sync.dirty);
    assert_eq!(engine.pending_operations().await.unwrap().len(), 2);

    engine.sync_with_server().await.unwrap();
    let record = engine.get_patient(&local_id).await.unwrap().unwrap();
    assert_eq!(record.sync.remote_id.as_deref(), Some("p-1"));
    assert_eq!(
        server.get("p-1").unwrap().data.phone.as_deref(),
        Some("555-0100")
    );
}

#[tokio::test]
async fn test_failing_subscribers_are_isolated() {
    let (engine, _handle, _server) = start(SyncConfig::in_memory(), false).await;

    engine.subscribe(|_| Err(anyhow::anyhow!("listener broke")));
    engine.subscribe(|_| panic!("listener panicked"));
    let data_changes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&data_changes);
    let id = engine.subscribe(move |event| {
        if *event == SyncEvent::DataChanged {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    });

    let saved = engine
        .save_patient(PatientData::new("Ada", "Lovelace"))
        .await
        .unwrap();
    assert_eq!(data_changes.load(Ordering::SeqCst), 1);

    assert!(engine.unsubscribe(id));
    engine
        .update_patient(&saved.local_id, phone("555-0100"))
        .await
        .unwrap();
    assert_eq!(data_changes.load(Ordering::SeqCst), 1);
}
