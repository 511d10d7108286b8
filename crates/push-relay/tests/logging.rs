mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{config, participant, ScriptedTransport};
use parking_lot::Mutex;
use shared_slot::MemoryOrigin;
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::{Layer, Registry};

/// Records the target of every event so filters like
/// `RUST_LOG=push.election=debug` can be checked against them.
#[derive(Clone, Default)]
struct Targets(Arc<Mutex<Vec<String>>>);

impl<S: Subscriber> Layer<S> for Targets {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        self.0.lock().push(event.metadata().target().to_string());
    }
}

#[tokio::test(start_paused = true)]
async fn components_log_under_their_own_targets() {
    let targets = Targets::default();
    let _guard = tracing::subscriber::set_default(Registry::default().with(targets.clone()));

    let origin = MemoryOrigin::new();
    let transport = ScriptedTransport::new();
    let relay = participant(&origin, "solo", &transport, config());
    relay.register(["a"], |_| {}).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    relay.shutdown().await.unwrap();

    let seen = targets.0.lock().clone();
    assert!(seen.iter().any(|t| t == "push.election"), "targets: {seen:?}");
    assert!(seen.iter().any(|t| t == "push.connection"), "targets: {seen:?}");
    assert!(seen.iter().all(|t| t != "push_relay::election"), "targets: {seen:?}");
}
