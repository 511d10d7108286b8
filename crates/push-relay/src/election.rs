//! Lease-based choice of the participant that holds the long-poll connection.
//!
//! Every participant runs the same loop on a fixed period. The lease slot is
//! advisory: two participants may briefly both believe they own it, and the
//! expiry timestamp settles the race within a few periods.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::clock::Clock;
use crate::connection::{ConnectionHandle, ConnectionState};
use crate::error::RelayResult;
use crate::events::{EventHub, RelayEvent};
use crate::lease::LeaseSlot;
use crate::registry::PushIdRegistry;

pub struct ElectionParts {
    pub lease: LeaseSlot,
    pub registry: Arc<PushIdRegistry>,
    pub connection: ConnectionHandle,
    pub events: EventHub,
    pub clock: Clock,
    pub poll_period: Duration,
    pub lease_ttl: Duration,
}

pub struct Election {
    parts: ElectionParts,
    owner: bool,
    last_owner: Option<String>,
    reoffer_pending: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl Election {
    pub fn new(parts: ElectionParts) -> Self {
        Self {
            parts,
            owner: false,
            last_owner: None,
            reoffer_pending: Arc::new(AtomicBool::new(false)),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn is_owner(&self) -> bool {
        self.owner
    }

    fn lease_ttl_ms(&self) -> u64 {
        self.parts.lease_ttl.as_millis() as u64
    }

    pub async fn tick(&mut self) -> RelayResult<()> {
        let now = self.parts.clock.now_ms();
        let me = self.parts.lease.participant_id().to_string();

        let Some(mut lease) = self.parts.lease.read().await? else {
            trace!(target: "push.election", participant = %me, "lease empty, offering candidacy");
            self.parts.lease.offer(now + self.lease_ttl_ms()).await?;
            self.set_owner(false).await;
            return Ok(());
        };

        let owner = if lease.owner_candidate_id == me {
            if !lease.owned_marker {
                info!(target: "push.election", participant = %me, "claimed connection lease");
            }
            lease.owned_marker = true;
            lease.lease_expires_at = now + self.lease_ttl_ms();
            self.parts.lease.write(&lease).await?;
            true
        } else {
            if lease.is_expired(now) {
                self.schedule_reoffer();
            }
            false
        };

        if let Some(current) = lease.owner() {
            if self.last_owner.as_deref() != Some(current) {
                info!(target: "push.election", owner = %current, "connection owner changed");
                self.last_owner = Some(current.to_string());
                self.parts.events.emit(RelayEvent::ReEstablished {
                    owner: current.to_string(),
                });
            }
        }

        let became_owner = owner && !self.owner;
        self.set_owner(owner).await;
        if owner && !became_owner {
            self.sync_push_ids().await?;
        }
        Ok(())
    }

    async fn set_owner(&mut self, owner: bool) {
        let was_owner = std::mem::replace(&mut self.owner, owner);
        let connection = &self.parts.connection;
        if owner && !was_owner {
            match self.parts.registry.shared_ids().await {
                Ok(ids) if !ids.is_empty() => {
                    let _ = connection.start();
                }
                Ok(_) => debug!(target: "push.election", "owning lease with no push ids, staying idle"),
                Err(err) => warn!(target: "push.election", error = %err, "could not read push ids"),
            }
        } else if !owner
            && !matches!(connection.state(), ConnectionState::Stopped | ConnectionState::Paused)
        {
            if was_owner {
                info!(target: "push.election", "lost connection lease, stopping");
            }
            let _ = connection.stop();
        }
    }

    /// Reconnects when the registered ids drifted from what the server saw.
    /// A paused connection is left alone; resume() picks up the current ids.
    async fn sync_push_ids(&self) -> RelayResult<()> {
        let ids = self.parts.registry.shared_ids().await?;
        let connection = &self.parts.connection;
        if connection.state() == ConnectionState::Paused || ids == connection.last_sent() {
            return Ok(());
        }
        debug!(target: "push.election", count = ids.len(), "push ids changed, reconnecting");
        if ids.is_empty() {
            let _ = connection.stop();
        } else if connection.state() == ConnectionState::Stopped {
            let _ = connection.start();
        } else {
            let _ = connection.restart();
        }
        Ok(())
    }

    /// Re-offers candidacy after a small random delay, provided the lease is
    /// still expired or gone by then.
    fn schedule_reoffer(&self) {
        if self.reoffer_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let max_ms = (self.parts.poll_period.as_millis() as u64 / 2).max(1);
        let delay = Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms));
        let lease = self.parts.lease.clone();
        let clock = self.parts.clock;
        let ttl = self.lease_ttl_ms();
        let pending = Arc::clone(&self.reoffer_pending);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let now = clock.now_ms();
            let result = match lease.read().await {
                Ok(current) if current.as_ref().map_or(true, |l| l.is_expired(now)) => {
                    debug!(target: "push.election", participant = %lease.participant_id(), "lease expired, re-offering");
                    lease.offer(now + ttl).await
                }
                Ok(_) => Ok(()),
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                warn!(target: "push.election", error = %err, "re-offer failed");
            }
            pending.store(false, Ordering::SeqCst);
        });
    }

    /// Runs the loop until `shutdown` fires. Pending re-offers are dropped
    /// with it, so a departing participant never re-enters the lease.
    pub fn spawn(mut self, shutdown: CancellationToken) -> JoinHandle<()> {
        self.shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.parts.poll_period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(err) = self.tick().await {
                            warn!(target: "push.election", error = %err, "election tick failed");
                        }
                    }
                }
            }
            debug!(target: "push.election", "election loop exited");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;
    use crate::broadcast::{broadcaster_for, Inbound};
    use crate::connection::{spawn_connection, ConnectionParts};
    use crate::config::ConnectionConfig;
    use crate::events::EventKind;
    use crate::lease::ConnectionLease;
    use crate::transport::{LongPollRequest, LongPollResponse, LongPollTransport, TransportError};
    use async_trait::async_trait;
    use shared_slot::{LocalSlots, MemoryOrigin, SlotStore};
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;

    struct Hanging;

    #[async_trait]
    impl LongPollTransport for Hanging {
        async fn long_poll(&self, _: LongPollRequest) -> Result<LongPollResponse, TransportError> {
            std::future::pending().await
        }
    }

    fn election(origin: &MemoryOrigin, id: &str, events: EventHub) -> Election {
        let store = SlotStore::new("t", Arc::new(LocalSlots::new()), Arc::new(origin.attach()), true);
        let registry = Arc::new(PushIdRegistry::new(store.slot("push-ids")));
        let lease = LeaseSlot::new(store.slot("lease"), id);
        let inbound: Inbound = Arc::new(|_: &BTreeSet<String>, _: Option<&str>| BTreeSet::new());
        let connection = spawn_connection(ConnectionParts {
            config: ConnectionConfig::default(),
            server_url: "http://push.invalid/".parse().unwrap(),
            transport: Arc::new(Hanging),
            auth: Arc::new(StaticAuth::new("realm", "account")),
            registry: Arc::clone(&registry),
            lease: lease.clone(),
            browser: store.slot("browser"),
            broadcaster: broadcaster_for(&store, 8192, Duration::from_millis(300), inbound),
            events: events.clone(),
        });
        Election::new(ElectionParts {
            lease,
            registry,
            connection,
            events,
            clock: Clock::new(),
            poll_period: Duration::from_millis(1000),
            lease_ttl: Duration::from_millis(3000),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn offers_then_claims_and_announces_owner() {
        let origin = MemoryOrigin::new();
        let events = EventHub::new();
        let announced = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&announced);
        let _listener = events.listen(EventKind::ReEstablished, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut participant = election(&origin, "p1", events);

        participant.tick().await.unwrap();
        assert!(!participant.is_owner());
        participant.tick().await.unwrap();
        assert!(participant.is_owner());
        participant.tick().await.unwrap();
        assert!(participant.is_owner());
        assert_eq!(announced.load(Ordering::SeqCst), 1);

        let lease: ConnectionLease = serde_json::from_str(&origin.peek("t:lease").unwrap()).unwrap();
        assert!(lease.is_held_by("p1"));
    }

    #[tokio::test(start_paused = true)]
    async fn takes_over_an_expired_lease() {
        let origin = MemoryOrigin::new();
        let mut first = election(&origin, "p1", EventHub::new());
        let mut second = election(&origin, "p2", EventHub::new());

        first.tick().await.unwrap();
        first.tick().await.unwrap();
        second.tick().await.unwrap();
        assert!(first.is_owner());
        assert!(!second.is_owner());

        // p1 stops renewing.
        tokio::time::sleep(Duration::from_millis(3_000)).await;
        second.tick().await.unwrap();
        tokio::time::sleep(Duration::from_millis(600)).await;
        second.tick().await.unwrap();
        assert!(second.is_owner());

        first.tick().await.unwrap();
        assert!(!first.is_owner());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_participant_drops_its_pending_reoffer() {
        let origin = MemoryOrigin::new();
        let mut first = election(&origin, "p1", EventHub::new());
        let mut second = election(&origin, "p2", EventHub::new());
        first.tick().await.unwrap();
        first.tick().await.unwrap();

        tokio::time::sleep(Duration::from_millis(3_000)).await;
        let shutdown = CancellationToken::new();
        second.shutdown = shutdown.clone();
        second.tick().await.unwrap();
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(600)).await;

        let lease: ConnectionLease = serde_json::from_str(&origin.peek("t:lease").unwrap()).unwrap();
        assert_eq!(lease.owner_candidate_id, "p1");
    }
}
