mod common;

use std::time::Duration;

use common::{config, owners, participant, wait_for, ScriptedTransport};
use push_relay::{ConnectionLease, RelayEvent, StopReason};
use shared_slot::MemoryOrigin;

#[tokio::test(start_paused = true)]
async fn concurrent_participants_converge_on_one_owner() {
    let origin = MemoryOrigin::new();
    let transport = ScriptedTransport::new();
    let a = participant(&origin, "a", &transport, config());
    tokio::time::sleep(Duration::from_millis(300)).await;
    let b = participant(&origin, "b", &transport, config());
    let c = participant(&origin, "c", &transport, config());
    let d = participant(&origin, "d", &transport, config());

    tokio::time::sleep(Duration::from_millis(3_000)).await;
    let held = owners(&[&a, &b, &c, &d]).await;
    assert_eq!(held.len(), 1, "owners: {held:?}");

    // And it stays that way.
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert_eq!(owners(&[&a, &b, &c, &d]).await, held);
}

#[tokio::test(start_paused = true)]
async fn another_participant_takes_over_when_the_owner_goes_silent() {
    let origin = MemoryOrigin::new();
    let transport = ScriptedTransport::new();
    let first = participant(&origin, "first", &transport, config());
    tokio::time::sleep(Duration::from_millis(2_500)).await;
    assert!(first.is_owner().await.unwrap());

    let second = participant(&origin, "second", &transport, config());
    let third = participant(&origin, "third", &transport, config());
    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert_eq!(owners(&[&first, &second, &third]).await, vec!["first".to_string()]);

    let mut events = second.events();
    // Dropping without shutdown leaves the lease behind to expire.
    drop(first);

    let took_over = wait_for(
        || async { owners(&[&second, &third]).await.len() == 1 },
        Duration::from_millis(5_000),
    )
    .await;
    assert!(took_over);
    // One more period so the loser has observed the new owner too.
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    let new_owner = owners(&[&second, &third]).await.remove(0);
    let announced = common::drain(&mut events);
    assert!(announced.contains(&RelayEvent::ReEstablished { owner: new_owner }));
}

#[tokio::test(start_paused = true)]
async fn shutdown_releases_the_lease_only_when_owned() {
    let origin = MemoryOrigin::new();
    let transport = ScriptedTransport::new();
    let owner = participant(&origin, "owner", &transport, config());
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    let follower = participant(&origin, "follower", &transport, config());
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert!(owner.is_owner().await.unwrap());

    let key = "push-relay:lease";
    follower.shutdown().await.unwrap();
    let lease: ConnectionLease = serde_json::from_str(&origin.peek(key).unwrap()).unwrap();
    assert!(lease.is_held_by("owner"));

    let mut events = owner.events();
    owner.shutdown().await.unwrap();
    assert!(origin.peek(key).is_none());
    assert_eq!(
        common::drain(&mut events),
        vec![RelayEvent::Stopped(StopReason::Shutdown)]
    );
}

#[tokio::test(start_paused = true)]
async fn idle_owner_opens_no_connection() {
    let origin = MemoryOrigin::new();
    let transport = ScriptedTransport::new();
    let relay = participant(&origin, "solo", &transport, config());
    tokio::time::sleep(Duration::from_millis(5_000)).await;
    assert!(relay.is_owner().await.unwrap());
    assert_eq!(transport.request_count(), 0);

    relay.register(["late"], |_| {}).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(transport.request_count(), 1);
    assert_eq!(transport.sent_ids(0), vec!["late".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn expiry_cycle_restores_ids_another_window_deregistered() {
    let origin = MemoryOrigin::new();
    let transport = ScriptedTransport::new();
    let mut cfg = config();
    cfg.expiry_interval = Duration::from_millis(2_000);
    let leaving = participant(&origin, "leaving", &transport, cfg.clone());
    let staying = participant(&origin, "staying", &transport, cfg);
    leaving.register(["shared"], |_| {}).await.unwrap();
    staying.register(["shared"], |_| {}).await.unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;

    leaving.deregister(["shared"]).await.unwrap();
    assert!(staying.registry().shared_ids().await.unwrap().is_empty());

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    let shared = staying.registry().shared_ids().await.unwrap();
    assert!(shared.contains("shared"), "shared: {shared:?}");
}
