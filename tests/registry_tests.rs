//! Master registry: registration, removal on disconnect, deferred pokes.


use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use taskfabric::config::MasterConfig;
use taskfabric::master::{MasterCore, MasterDaemon, Registry, WorkerEntry};
use taskfabric::proto::{AuthPolicy, Connection};
use test_harness::{assert_eventually, start_server, NullHandler, RecordingHandler};

fn test_master_config() -> MasterConfig {
    MasterConfig {
        poke_throttle_interval: 0,
        ..MasterConfig::default()
    }
}

async fn start_master() -> (Arc<MasterCore>, String) {
    let core = MasterCore::new(&test_master_config());
    let daemon = Arc::new(MasterDaemon { core: core.clone() });
    let (addr, _token) = start_server(daemon, AuthPolicy::default()).await;
    (core, addr)
}

async fn fake_registry_entry(target: &str) -> WorkerEntry {
    // A connection to nowhere in particular; only identity and targets matter
    // for registry bookkeeping.
    let (core, addr) = start_master().await;
    drop(core);
    let conn = Connection::connect(&addr, None, Arc::new(NullHandler))
        .await
        .unwrap();
    WorkerEntry {
        id: Uuid::new_v4(),
        name: None,
        targets: vec![target.to_string()],
        conn,
    }
}

#[tokio::test]
async fn register_and_lookup() {
    let mut registry = Registry::new();
    let entry = fake_registry_entry("a").await;
    let id = entry.id;

    let drained = registry.register(entry);
    assert!(drained.is_empty());
    assert_eq!(registry.len(), 1);
    assert_eq!(registry.workers_serving("a").len(), 1);
    assert!(registry.workers_serving("b").is_empty());

    registry.remove(id);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn registration_drains_matching_deferred_pokes() {
    let mut registry = Registry::new();
    registry.defer("x".to_string());
    registry.defer("z".to_string());

    let entry = fake_registry_entry("x").await;
    let drained = registry.register(entry);
    assert_eq!(drained, vec!["x".to_string()]);
    assert!(registry.deferred().contains("z"));
    assert!(!registry.deferred().contains("x"));
}

#[tokio::test]
async fn poke_for_absent_target_is_deferred_until_a_worker_registers() {
    let (core, addr) = start_master().await;

    // No worker yet: the poke is accepted and parked.
    let client = Connection::connect(&addr, None, Arc::new(NullHandler))
        .await
        .unwrap();
    let response = client
        .send_request("poke", Some(json!({ "targets": ["x"] })))
        .await
        .unwrap();
    assert_eq!(response.into_data().unwrap(), Some(json!("ok")));

    assert_eventually(
        || async { core.registry.lock().await.deferred().contains("x") },
        Duration::from_secs(2),
        "poke should be deferred",
    )
    .await;

    // A worker serving x registers and is immediately polled for it.
    let worker_handler = RecordingHandler::new();
    let worker = Connection::connect(&addr, None, worker_handler.clone())
        .await
        .unwrap();
    worker
        .send_request(
            "register-worker",
            Some(json!({ "targets": ["x", "y"], "name": "w1" })),
        )
        .await
        .unwrap();

    assert_eventually(
        || async {
            worker_handler
                .seen
                .lock()
                .await
                .iter()
                .any(|(kind, data)| {
                    kind == "poll" && data == &Some(json!({ "targets": ["x"] }))
                })
        },
        Duration::from_secs(2),
        "newly registered worker should receive the deferred poll",
    )
    .await;
    assert!(!core.registry.lock().await.deferred().contains("x"));
}

#[tokio::test]
async fn worker_is_removed_when_its_connection_closes() {
    let (core, addr) = start_master().await;

    let worker = Connection::connect(&addr, None, RecordingHandler::new())
        .await
        .unwrap();
    worker
        .send_request("register-worker", Some(json!({ "targets": ["a"] })))
        .await
        .unwrap();
    assert_eventually(
        || async { core.registry.lock().await.len() == 1 },
        Duration::from_secs(2),
        "worker should be registered",
    )
    .await;

    worker.close();
    assert_eventually(
        || async { core.registry.lock().await.is_empty() },
        Duration::from_secs(2),
        "worker should be removed on disconnect",
    )
    .await;
}

#[tokio::test]
async fn register_worker_validates_targets() {
    let (_core, addr) = start_master().await;
    let worker = Connection::connect(&addr, None, RecordingHandler::new())
        .await
        .unwrap();

    let response = worker
        .send_request("register-worker", Some(json!({ "targets": [] })))
        .await
        .unwrap();
    assert_eq!(response.error.as_deref(), Some("empty targets list"));

    let response = worker
        .send_request("register-worker", Some(json!({ "targets": [""] })))
        .await
        .unwrap();
    assert_eq!(response.error.as_deref(), Some("empty target name"));
}

#[tokio::test]
async fn poke_without_targets_is_invalid() {
    let (_core, addr) = start_master().await;
    let client = Connection::connect(&addr, None, Arc::new(NullHandler))
        .await
        .unwrap();

    let response = client.send_request("poke", None).await.unwrap();
    assert!(response.error.is_some());

    let response = client
        .send_request("poke", Some(json!({ "targets": [] })))
        .await
        .unwrap();
    assert_eq!(response.error.as_deref(), Some("empty targets list"));
}

#[tokio::test]
async fn registered_worker_receives_forwarded_polls() {
    let (_core, addr) = start_master().await;

    let worker_handler = RecordingHandler::new();
    let worker = Connection::connect(&addr, None, worker_handler.clone())
        .await
        .unwrap();
    worker
        .send_request("register-worker", Some(json!({ "targets": ["a", "b"] })))
        .await
        .unwrap();

    let client = Connection::connect(&addr, None, Arc::new(NullHandler))
        .await
        .unwrap();
    client
        .send_request("poke", Some(json!({ "targets": ["a", "c"] })))
        .await
        .unwrap();

    // Only the intersection with the advertisement is forwarded.
    assert_eventually(
        || async {
            worker_handler
                .seen
                .lock()
                .await
                .iter()
                .any(|(kind, data)| {
                    kind == "poll" && data == &Some(json!({ "targets": ["a"] }))
                })
        },
        Duration::from_secs(2),
        "worker should receive a poll for the served intersection",
    )
    .await;
}
