//! Garbage collection of push ids nobody listens to anymore.
//!
//! The connection owner periodically pings every id in the per-browser set.
//! Any participant holding one of those ids locally answers with the overlap.
//! Ids that stay unanswered for more than `threshold` consecutive pings are
//! dropped from the shared set, so windows that vanished without
//! deregistering stop costing server-side subscriptions.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use shared_slot::{SharedSlot, SlotChange, SlotStore};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::RelayResult;
use crate::lease::LeaseSlot;
use crate::registry::PushIdRegistry;

pub const PING_SLOT: &str = "liveliness-ping";
pub const CONFIRM_SLOT: &str = "liveliness-confirm";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Ping {
    id: String,
    #[serde(rename = "push-ids")]
    push_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Confirm {
    ping: String,
    #[serde(rename = "push-ids")]
    push_ids: BTreeSet<String>,
    /// Keeps two identical answers from collapsing into one write.
    nonce: String,
}

#[derive(Debug, Default)]
struct MonitorState {
    outstanding: Option<Ping>,
    confirmed: BTreeSet<String>,
    misses: HashMap<String, u32>,
}

impl MonitorState {
    fn reset(&mut self) {
        self.outstanding = None;
        self.confirmed.clear();
        self.misses.clear();
    }
}

pub struct ExpiryParts {
    pub store: Arc<SlotStore>,
    pub registry: Arc<PushIdRegistry>,
    pub lease: LeaseSlot,
    pub threshold: u32,
}

pub struct ExpiryMonitor {
    registry: Arc<PushIdRegistry>,
    lease: LeaseSlot,
    ping: SharedSlot,
    threshold: u32,
    state: Arc<Mutex<MonitorState>>,
    responder: JoinHandle<()>,
}

impl ExpiryMonitor {
    /// `None` when the active backing publishes no change events: without them
    /// confirmations cannot be collected.
    pub fn new(parts: ExpiryParts) -> Option<Self> {
        let changes = parts.store.changes()?;
        let state = Arc::new(Mutex::new(MonitorState::default()));
        let responder = tokio::spawn(respond(
            changes,
            parts.store.slot(PING_SLOT).key().to_string(),
            parts.store.slot(CONFIRM_SLOT),
            parts.store.writer_id().to_string(),
            Arc::clone(&parts.registry),
            Arc::clone(&state),
        ));
        Some(Self {
            ping: parts.store.slot(PING_SLOT),
            registry: parts.registry,
            lease: parts.lease,
            threshold: parts.threshold,
            state,
            responder,
        })
    }

    /// Forgets all tracking. Called when the connection owner changes.
    pub fn reset(&self) {
        self.state.lock().reset();
    }

    /// Closure form of [`reset`](Self::reset) for event listeners.
    pub fn resetter(&self) -> impl Fn() + Send + Sync + 'static {
        let state = Arc::clone(&self.state);
        move || state.lock().reset()
    }

    pub fn misses(&self, push_id: &str) -> u32 {
        self.state.lock().misses.get(push_id).copied().unwrap_or(0)
    }

    /// One monitor cycle: settle the previous ping, then send the next.
    /// Returns the ids dropped as orphaned.
    pub async fn run_cycle(&self) -> RelayResult<BTreeSet<String>> {
        self.registry.reassert_local().await?;
        if !self.lease.is_held_by_me().await? {
            self.reset();
            return Ok(BTreeSet::new());
        }

        let local = self.registry.local_ids();
        let orphans = {
            let mut state = self.state.lock();
            let mut orphans = BTreeSet::new();
            if let Some(ping) = state.outstanding.take() {
                let confirmed = std::mem::take(&mut state.confirmed);
                state.misses.retain(|id, _| ping.push_ids.contains(id));
                for id in &ping.push_ids {
                    if confirmed.contains(id) || local.contains(id) {
                        state.misses.remove(id);
                        continue;
                    }
                    let misses = state.misses.entry(id.clone()).or_insert(0);
                    *misses += 1;
                    if *misses > self.threshold {
                        orphans.insert(id.clone());
                    }
                }
                for id in &orphans {
                    state.misses.remove(id);
                }
            }
            orphans
        };
        if !orphans.is_empty() {
            info!(target: "push.expiry", ids = ?orphans, "push ids unconfirmed, expiring");
            self.registry.forget_shared(&orphans).await?;
        }

        let push_ids = self.registry.shared_ids().await?;
        if push_ids.is_empty() {
            return Ok(orphans);
        }
        let ping = Ping {
            id: Uuid::new_v4().to_string(),
            push_ids,
        };
        {
            let mut state = self.state.lock();
            state.confirmed.clear();
            state.outstanding = Some(ping.clone());
        }
        debug!(target: "push.expiry", ping = %ping.id, count = ping.push_ids.len(), "liveliness ping");
        self.ping.set_json(&ping).await?;
        Ok(orphans)
    }

    pub fn spawn_timer(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately; let the election settle.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(err) = monitor.run_cycle().await {
                    warn!(target: "push.expiry", error = %err, "expiry cycle failed");
                }
            }
        })
    }
}

impl Drop for ExpiryMonitor {
    fn drop(&mut self) {
        self.responder.abort();
    }
}

/// Answers pings from other participants and collects confirmations for our
/// own outstanding ping.
async fn respond(
    mut changes: broadcast::Receiver<SlotChange>,
    ping_key: String,
    confirm: SharedSlot,
    own_writer: String,
    registry: Arc<PushIdRegistry>,
    state: Arc<Mutex<MonitorState>>,
) {
    loop {
        let change = match changes.recv().await {
            Ok(change) => change,
            Err(RecvError::Lagged(skipped)) => {
                warn!(target: "push.expiry", skipped, "liveliness listener lagged");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if change.writer == own_writer {
            continue;
        }
        let Some(raw) = change.value else { continue };

        if change.key == ping_key {
            let Ok(ping) = serde_json::from_str::<Ping>(&raw) else {
                continue;
            };
            let overlap: BTreeSet<String> = ping
                .push_ids
                .intersection(&registry.local_ids())
                .cloned()
                .collect();
            if overlap.is_empty() {
                continue;
            }
            let answer = Confirm {
                ping: ping.id,
                push_ids: overlap,
                nonce: Uuid::new_v4().to_string(),
            };
            if let Err(err) = confirm.set_json(&answer).await {
                warn!(target: "push.expiry", error = %err, "could not confirm liveliness");
            }
        } else if change.key == confirm.key() {
            let Ok(answer) = serde_json::from_str::<Confirm>(&raw) else {
                continue;
            };
            let mut state = state.lock();
            if state.outstanding.as_ref().is_some_and(|ping| ping.id == answer.ping) {
                state.confirmed.extend(answer.push_ids);
            }
        }
    }
}
