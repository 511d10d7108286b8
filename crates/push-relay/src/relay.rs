use std::collections::BTreeSet;
use std::sync::Arc;

use shared_slot::SlotStore;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::AuthProvider;
use crate::broadcast::{broadcaster_for, Broadcaster, Inbound};
use crate::clock::Clock;
use crate::config::RelayConfig;
use crate::connection::{spawn_connection, ConnectionHandle, ConnectionParts};
use crate::election::{Election, ElectionParts};
use crate::error::RelayResult;
use crate::events::{EventHub, EventKind, RelayEvent, Unsubscribe};
use crate::expiry::{ExpiryMonitor, ExpiryParts};
use crate::lease::LeaseSlot;
use crate::registry::{Notification, PushIdRegistry};
use crate::transport::LongPollTransport;

pub const LEASE_SLOT: &str = "lease";
pub const PUSH_IDS_SLOT: &str = "push-ids";
pub const BROWSER_SLOT: &str = "browser";

/// Everything one participant is built from. Nothing is process-global: two
/// contexts over the same store behave like two windows of one browser.
pub struct RelayContext {
    pub config: RelayConfig,
    pub store: Arc<SlotStore>,
    pub transport: Arc<dyn LongPollTransport>,
    pub auth: Arc<dyn AuthProvider>,
    pub clock: Clock,
    pub participant_id: String,
}

impl RelayContext {
    pub fn new(
        config: RelayConfig,
        store: Arc<SlotStore>,
        transport: Arc<dyn LongPollTransport>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            auth,
            clock: Clock::new(),
            participant_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_participant_id(mut self, participant_id: impl Into<String>) -> Self {
        self.participant_id = participant_id.into();
        self
    }
}

/// One participant of the push relay: registry, election loop, connection
/// driver, broadcaster and expiry monitor wired together.
pub struct PushRelay {
    participant_id: String,
    registry: Arc<PushIdRegistry>,
    events: EventHub,
    connection: ConnectionHandle,
    lease: LeaseSlot,
    _broadcaster: Arc<dyn Broadcaster>,
    _expiry: Option<Arc<ExpiryMonitor>>,
    shutdown: CancellationToken,
    election: Option<JoinHandle<()>>,
    expiry_timer: Option<JoinHandle<()>>,
}

impl PushRelay {
    /// Spawns the participant's background tasks on the current runtime.
    pub fn start(ctx: RelayContext) -> Self {
        let RelayContext {
            config,
            store,
            transport,
            auth,
            clock,
            participant_id,
        } = ctx;
        store.set_sharing(config.share_connection);

        let registry = Arc::new(PushIdRegistry::new(store.slot(PUSH_IDS_SLOT)));
        let events = EventHub::new();
        let lease = LeaseSlot::new(store.slot(LEASE_SLOT), participant_id.clone());

        let inbound: Inbound = {
            let registry = Arc::clone(&registry);
            Arc::new(move |ids: &BTreeSet<String>, payload: Option<&str>| {
                registry.deliver(ids, payload)
            })
        };
        let broadcaster = broadcaster_for(
            &store,
            config.pending_capacity,
            config.broadcast_poll_interval,
            inbound,
        );

        let connection = spawn_connection(ConnectionParts {
            config: config.connection.clone(),
            server_url: config.server_url.clone(),
            transport,
            auth,
            registry: Arc::clone(&registry),
            lease: lease.clone(),
            browser: store.slot(BROWSER_SLOT),
            broadcaster: Arc::clone(&broadcaster),
            events: events.clone(),
        });

        let shutdown = CancellationToken::new();
        let election = Election::new(ElectionParts {
            lease: lease.clone(),
            registry: Arc::clone(&registry),
            connection: connection.clone(),
            events: events.clone(),
            clock,
            poll_period: config.poll_period,
            lease_ttl: config.lease_ttl(),
        })
        .spawn(shutdown.clone());

        let expiry = ExpiryMonitor::new(ExpiryParts {
            store: Arc::clone(&store),
            registry: Arc::clone(&registry),
            lease: lease.clone(),
            threshold: config.expiry_threshold,
        })
        .map(Arc::new);
        let expiry_timer = expiry.as_ref().map(|monitor| {
            let reset = monitor.resetter();
            let _ = events.listen(EventKind::ReEstablished, move |_| reset());
            monitor.spawn_timer(config.expiry_interval)
        });
        if expiry.is_none() {
            debug!(target: "push.expiry", "no change events on this backing, expiry monitor disabled");
        }

        info!(
            target: "push.election",
            participant = %participant_id,
            mode = ?store.mode(),
            "push relay participant started"
        );

        Self {
            participant_id,
            registry,
            events,
            connection,
            lease,
            _broadcaster: broadcaster,
            _expiry: expiry,
            shutdown,
            election: Some(election),
            expiry_timer,
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// Subscribes `on_notification` to `push_ids`. The connection owner picks
    /// the new ids up on its next election tick.
    pub async fn register<I, S, F>(&self, push_ids: I, on_notification: F) -> RelayResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.registry.register(push_ids, Arc::new(on_notification)).await
    }

    pub async fn deregister<I, S>(&self, push_ids: I) -> RelayResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.registry.deregister(push_ids).await
    }

    pub fn registry(&self) -> &Arc<PushIdRegistry> {
        &self.registry
    }

    pub fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    pub async fn is_owner(&self) -> RelayResult<bool> {
        self.lease.is_held_by_me().await
    }

    /// Every lifecycle event, in emission order.
    pub fn events(&self) -> broadcast::Receiver<RelayEvent> {
        self.events.subscribe()
    }

    pub fn on_receive<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&RelayEvent) + Send + Sync + 'static,
    {
        self.events.listen(EventKind::Receive, listener)
    }

    pub fn on_server_error<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&RelayEvent) + Send + Sync + 'static,
    {
        self.events.listen(EventKind::ServerError, listener)
    }

    pub fn on_unstable<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&RelayEvent) + Send + Sync + 'static,
    {
        self.events.listen(EventKind::Unstable, listener)
    }

    pub fn on_lost<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&RelayEvent) + Send + Sync + 'static,
    {
        self.events.listen(EventKind::Lost, listener)
    }

    pub fn on_re_established<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&RelayEvent) + Send + Sync + 'static,
    {
        self.events.listen(EventKind::ReEstablished, listener)
    }

    pub fn on_stopped<F>(&self, listener: F) -> Unsubscribe
    where
        F: Fn(&RelayEvent) + Send + Sync + 'static,
    {
        self.events.listen(EventKind::Stopped, listener)
    }

    /// Stops every task, emits a final `Stopped`, and releases the lease if
    /// this participant owns it.
    pub async fn shutdown(mut self) -> RelayResult<()> {
        self.shutdown.cancel();
        if let Some(election) = self.election.take() {
            let _ = election.await;
        }
        if let Some(timer) = self.expiry_timer.take() {
            timer.abort();
        }
        self.connection.shutdown().await?;
        if self.lease.release_if_owner().await? {
            info!(target: "push.election", participant = %self.participant_id, "released connection lease");
        }
        Ok(())
    }
}

impl Drop for PushRelay {
    fn drop(&mut self) {
        self.shutdown.cancel();
        if let Some(election) = self.election.take() {
            election.abort();
        }
        if let Some(timer) = self.expiry_timer.take() {
            timer.abort();
        }
    }
}
