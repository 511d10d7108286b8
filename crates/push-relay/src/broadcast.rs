//! Fan-out of received notifications to every participant.
//!
//! The connection owner calls [`Broadcaster::notify`]; every participant,
//! the owner included, hands matching ids to its inbound callback. Two
//! strategies share that contract: [`LiveBroadcaster`] rides on the slot
//! backing's change events, [`PollingBroadcaster`] keeps a bounded pending
//! list in a slot and scans it on a timer.

use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared_slot::{SharedSlot, SlotChange, SlotStore};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use crate::error::RelayResult;

pub const NOTIFICATION_SLOT: &str = "notification";
pub const PENDING_SLOT: &str = "pending-notifications";

const SEEN_NONCE_LIMIT: usize = 512;

/// Receives `(target_ids, payload)` and returns the ids delivered locally.
pub type Inbound = Arc<dyn Fn(&BTreeSet<String>, Option<&str>) -> BTreeSet<String> + Send + Sync>;

#[async_trait]
pub trait Broadcaster: Send + Sync {
    async fn notify(&self, target_ids: BTreeSet<String>, payload: Option<String>) -> RelayResult<()>;
}

/// Storage form of a notification. The nonce makes every write distinct and
/// lets a participant recognise an entry it already handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireNotification {
    #[serde(rename = "push-ids")]
    pub target_ids: BTreeSet<String>,
    #[serde(default)]
    pub payload: Option<String>,
    pub nonce: String,
}

impl WireNotification {
    fn new(target_ids: BTreeSet<String>, payload: Option<String>) -> Self {
        Self {
            target_ids,
            payload,
            nonce: Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Default)]
struct SeenNonces {
    order: VecDeque<String>,
    lookup: HashSet<String>,
}

impl SeenNonces {
    /// Returns false when the nonce was already recorded.
    fn insert(&mut self, nonce: &str) -> bool {
        if !self.lookup.insert(nonce.to_string()) {
            return false;
        }
        self.order.push_back(nonce.to_string());
        if self.order.len() > SEEN_NONCE_LIMIT {
            if let Some(oldest) = self.order.pop_front() {
                self.lookup.remove(&oldest);
            }
        }
        true
    }

    fn contains(&self, nonce: &str) -> bool {
        self.lookup.contains(nonce)
    }
}

/// Picks the live strategy when the active backing publishes change events.
pub fn broadcaster_for(
    store: &Arc<SlotStore>,
    pending_capacity: usize,
    poll_interval: Duration,
    inbound: Inbound,
) -> Arc<dyn Broadcaster> {
    match store.changes() {
        Some(changes) => Arc::new(LiveBroadcaster::start(
            store.slot(NOTIFICATION_SLOT),
            changes,
            inbound,
        )),
        None => {
            let capacity = store
                .capacity()
                .map_or(pending_capacity, |backing| backing.min(pending_capacity));
            Arc::new(PollingBroadcaster::start(
                store.slot(PENDING_SLOT),
                capacity,
                poll_interval,
                inbound,
            ))
        }
    }
}

pub struct LiveBroadcaster {
    slot: SharedSlot,
    inbound: Inbound,
    seen: Arc<Mutex<SeenNonces>>,
    listener: JoinHandle<()>,
}

impl LiveBroadcaster {
    pub fn start(slot: SharedSlot, changes: broadcast::Receiver<SlotChange>, inbound: Inbound) -> Self {
        let seen = Arc::new(Mutex::new(SeenNonces::default()));
        let listener = tokio::spawn(listen(
            slot.key().to_string(),
            slot.store().writer_id().to_string(),
            changes,
            Arc::clone(&inbound),
            Arc::clone(&seen),
        ));
        Self {
            slot,
            inbound,
            seen,
            listener,
        }
    }
}

impl Drop for LiveBroadcaster {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

#[async_trait]
impl Broadcaster for LiveBroadcaster {
    async fn notify(&self, target_ids: BTreeSet<String>, payload: Option<String>) -> RelayResult<()> {
        let wire = WireNotification::new(target_ids, payload);
        self.seen.lock().insert(&wire.nonce);
        self.slot.set_json(&wire).await?;
        // Change events never reach the writer, so deliver here too.
        let delivered = (self.inbound)(&wire.target_ids, wire.payload.as_deref());
        debug!(
            target: "push.broadcast",
            nonce = %wire.nonce,
            delivered = delivered.len(),
            "notification published"
        );
        Ok(())
    }
}

async fn listen(
    key: String,
    own_writer: String,
    mut changes: broadcast::Receiver<SlotChange>,
    inbound: Inbound,
    seen: Arc<Mutex<SeenNonces>>,
) {
    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(RecvError::Lagged(skipped)) => {
                warn!(target: "push.broadcast", skipped, "notification listener lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if change.key != key || change.writer == own_writer {
            continue;
        }
        let Some(raw) = change.value else { continue };
        let wire: WireNotification = match serde_json::from_str(&raw) {
            Ok(wire) => wire,
            Err(err) => {
                debug!(target: "push.broadcast", error = %err, "ignoring undecodable notification");
                continue;
            }
        };
        if !seen.lock().insert(&wire.nonce) {
            trace!(target: "push.broadcast", nonce = %wire.nonce, "duplicate notification");
            continue;
        }
        let delivered = inbound(&wire.target_ids, wire.payload.as_deref());
        trace!(
            target: "push.broadcast",
            nonce = %wire.nonce,
            delivered = delivered.len(),
            "notification observed"
        );
    }
}

struct PendingState {
    slot: SharedSlot,
    capacity: usize,
    inbound: Inbound,
    seen: Mutex<SeenNonces>,
}

pub struct PollingBroadcaster {
    state: Arc<PendingState>,
    poller: JoinHandle<()>,
}

impl PollingBroadcaster {
    pub fn start(slot: SharedSlot, capacity: usize, poll_interval: Duration, inbound: Inbound) -> Self {
        let state = Arc::new(PendingState {
            slot,
            capacity,
            inbound,
            seen: Mutex::new(SeenNonces::default()),
        });
        let poller_state = Arc::clone(&state);
        let poller = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = poller_state.poll_once().await {
                    warn!(target: "push.broadcast", error = %err, "pending notification scan failed");
                }
            }
        });
        Self { state, poller }
    }

    /// One scan of the pending list. Returns how many entries were delivered
    /// to this participant.
    pub async fn poll_once(&self) -> RelayResult<usize> {
        self.state.poll_once().await
    }
}

impl Drop for PollingBroadcaster {
    fn drop(&mut self) {
        self.poller.abort();
    }
}

#[async_trait]
impl Broadcaster for PollingBroadcaster {
    async fn notify(&self, target_ids: BTreeSet<String>, payload: Option<String>) -> RelayResult<()> {
        let state = &self.state;
        let mut wire = WireNotification::new(target_ids, payload);
        state.seen.lock().insert(&wire.nonce);
        let delivered = (state.inbound)(&wire.target_ids, wire.payload.as_deref());
        wire.target_ids.retain(|id| !delivered.contains(id));
        if wire.target_ids.is_empty() {
            return Ok(());
        }
        let mut pending = state.read().await?;
        pending.push(wire);
        state.write(pending).await
    }
}

impl PendingState {
    async fn read(&self) -> RelayResult<Vec<WireNotification>> {
        Ok(self
            .slot
            .get_json::<Vec<WireNotification>>()
            .await?
            .unwrap_or_default())
    }

    /// Writes the list back, dropping the oldest entries until it fits.
    async fn write(&self, mut pending: Vec<WireNotification>) -> RelayResult<()> {
        if pending.is_empty() {
            self.slot.remove().await?;
            return Ok(());
        }
        let mut raw = serde_json::to_string(&pending)
            .map_err(|err| shared_slot::SlotError::Codec(err.to_string()))?;
        let mut dropped = 0usize;
        while raw.len() > self.capacity && !pending.is_empty() {
            pending.remove(0);
            dropped += 1;
            raw = serde_json::to_string(&pending)
                .map_err(|err| shared_slot::SlotError::Codec(err.to_string()))?;
        }
        if dropped > 0 {
            warn!(
                target: "push.broadcast",
                dropped,
                capacity = self.capacity,
                "pending notifications exceeded storage capacity, oldest dropped"
            );
        }
        if pending.is_empty() {
            self.slot.remove().await?;
        } else {
            self.slot.set(raw).await?;
        }
        Ok(())
    }

    async fn poll_once(&self) -> RelayResult<usize> {
        let pending = self.read().await?;
        if pending.is_empty() {
            return Ok(0);
        }
        let mut delivered_entries = 0;
        let mut changed = false;
        let mut remainder = Vec::with_capacity(pending.len());
        for mut wire in pending {
            if self.seen.lock().contains(&wire.nonce) {
                remainder.push(wire);
                continue;
            }
            let delivered = (self.inbound)(&wire.target_ids, wire.payload.as_deref());
            self.seen.lock().insert(&wire.nonce);
            if !delivered.is_empty() {
                delivered_entries += 1;
                changed = true;
                wire.target_ids.retain(|id| !delivered.contains(id));
            }
            if !wire.target_ids.is_empty() {
                remainder.push(wire);
            }
        }
        if changed {
            self.write(remainder).await?;
        }
        Ok(delivered_entries)
    }
}
