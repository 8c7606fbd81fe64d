//! Cross-module coverage for the store's lifecycle-event emission combined
//! with the command reliability engine, beyond what each module's own
//! `#[cfg(test)]` unit tests exercise in isolation.

use node_agent_core::{CommandResultPayload, CommandType, LifecycleBus, LifecycleEvent, NewHost, Telemetry};
use node_agent_store::{CommandEngine, HostStore};
use std::sync::Arc;

async fn new_store() -> (HostStore, tokio::sync::mpsc::UnboundedReceiver<LifecycleEvent>) {
    let bus = LifecycleBus::new();
    let rx = bus.subscribe();
    let store = HostStore::open(":memory:", bus).await.unwrap();
    (store, rx)
}

#[tokio::test]
async fn add_emits_host_discovered_on_the_bus() {
    let (store, mut rx) = new_store().await;
    store
        .add("LANTERN", "AA:BB:CC:DD:EE:01", "192.168.1.20", NewHost::default())
        .await
        .unwrap();

    match rx.recv().await.unwrap() {
        LifecycleEvent::HostDiscovered(host) => assert_eq!(host.name, "LANTERN"),
        other => panic!("expected HostDiscovered, got {other:?}"),
    }
}

#[tokio::test]
async fn suppressed_update_does_not_echo_on_the_bus() {
    let (store, mut rx) = new_store().await;
    store
        .add("LANTERN", "AA:BB:CC:DD:EE:01", "192.168.1.20", NewHost::default())
        .await
        .unwrap();
    // Drain the add's HostDiscovered event.
    rx.recv().await.unwrap();

    let patch = node_agent_core::HostPatch {
        notes: Some("agent-driven update".to_string()),
        ..Default::default()
    };
    store.update("LANTERN", patch, false).await.unwrap();

    // No event should arrive; the caller is responsible for re-emitting.
    let result = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
    assert!(result.is_err(), "suppressed update must not publish a lifecycle event");
}

#[tokio::test]
async fn command_engine_replays_a_duplicate_command_id_without_rerunning_work() {
    let telemetry = Arc::new(Telemetry::new());
    let engine = CommandEngine::new(telemetry);
    let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));

    let do_work = {
        let calls = Arc::clone(&calls);
        move || {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(CommandResultPayload {
                    success: true,
                    message: Some("done".to_string()),
                    error: None,
                    host_ping: None,
                })
            }
        }
    };

    let first = engine.execute("cmd-1", CommandType::UpdateHost, do_work.clone()).await;
    assert!(!first.is_replay);
    let second = engine.execute("cmd-1", CommandType::UpdateHost, do_work).await;
    assert!(second.is_replay);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}
