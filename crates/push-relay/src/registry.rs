//! Push-id subscriptions.
//!
//! The per-browser set lives in a shared slot so whichever participant owns
//! the connection knows what to ask the server for. The per-window set maps
//! ids to the callbacks registered in this participant and is what delivery
//! filters against. Every per-window id is also in the per-browser set.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use shared_slot::SharedSlot;
use tracing::{debug, info};

use crate::error::RelayResult;

/// What a registered callback receives: the ids it registered for that this
/// notification targets, plus the payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub push_ids: BTreeSet<String>,
    pub payload: Option<String>,
}

pub type NotificationCallback = Arc<dyn Fn(&Notification) + Send + Sync>;

pub struct PushIdRegistry {
    shared: SharedSlot,
    local: Mutex<HashMap<String, Vec<NotificationCallback>>>,
}

impl PushIdRegistry {
    pub fn new(shared: SharedSlot) -> Self {
        Self {
            shared,
            local: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register<I, S>(&self, push_ids: I, callback: NotificationCallback) -> RelayResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: BTreeSet<String> = push_ids.into_iter().map(Into::into).collect();
        if ids.is_empty() {
            return Ok(());
        }
        // Shared first so a local id is never missing from the shared set.
        self.add_shared(&ids).await?;
        let mut local = self.local.lock();
        for id in &ids {
            local
                .entry(id.clone())
                .or_default()
                .push(Arc::clone(&callback));
        }
        debug!(target: "push.registry", ids = ?ids, "registered push ids");
        Ok(())
    }

    /// Removes ids locally and from the per-browser set. Another window may
    /// still hold one of them; it re-adds the id on its next expiry cycle via
    /// [`PushIdRegistry::reassert_local`], so the owner can briefly poll
    /// without it.
    pub async fn deregister<I, S>(&self, push_ids: I) -> RelayResult<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let ids: BTreeSet<String> = push_ids.into_iter().map(Into::into).collect();
        {
            let mut local = self.local.lock();
            for id in &ids {
                local.remove(id);
            }
        }
        self.remove_shared(&ids).await?;
        debug!(target: "push.registry", ids = ?ids, "deregistered push ids");
        Ok(())
    }

    /// Drops ids from the per-browser set only, leaving local callbacks alone.
    pub async fn forget_shared(&self, push_ids: &BTreeSet<String>) -> RelayResult<()> {
        self.remove_shared(push_ids).await?;
        info!(target: "push.registry", ids = ?push_ids, "dropped orphaned push ids");
        Ok(())
    }

    pub async fn shared_ids(&self) -> RelayResult<BTreeSet<String>> {
        Ok(self
            .shared
            .get_json::<BTreeSet<String>>()
            .await?
            .unwrap_or_default())
    }

    pub fn local_ids(&self) -> BTreeSet<String> {
        self.local.lock().keys().cloned().collect()
    }

    /// Re-adds local ids a concurrent writer dropped from the shared set.
    pub async fn reassert_local(&self) -> RelayResult<usize> {
        let local = self.local_ids();
        let shared = self.shared_ids().await?;
        let missing: BTreeSet<String> = local.difference(&shared).cloned().collect();
        if !missing.is_empty() {
            self.add_shared(&missing).await?;
            debug!(target: "push.registry", ids = ?missing, "re-asserted local push ids");
        }
        Ok(missing.len())
    }

    /// Invokes each callback once with the subset of `target_ids` it owns and
    /// returns every id that had at least one callback here.
    pub fn deliver(&self, target_ids: &BTreeSet<String>, payload: Option<&str>) -> BTreeSet<String> {
        let mut delivered = BTreeSet::new();
        let mut groups: BTreeMap<usize, (NotificationCallback, BTreeSet<String>)> = BTreeMap::new();
        {
            let local = self.local.lock();
            for id in target_ids {
                let Some(callbacks) = local.get(id) else {
                    continue;
                };
                delivered.insert(id.clone());
                for callback in callbacks {
                    let key = Arc::as_ptr(callback) as *const () as usize;
                    groups
                        .entry(key)
                        .or_insert_with(|| (Arc::clone(callback), BTreeSet::new()))
                        .1
                        .insert(id.clone());
                }
            }
        }
        for (_, (callback, push_ids)) in groups {
            callback(&Notification {
                push_ids,
                payload: payload.map(str::to_string),
            });
        }
        delivered
    }

    async fn add_shared(&self, ids: &BTreeSet<String>) -> RelayResult<()> {
        let mut shared = self.shared_ids().await?;
        let before = shared.len();
        shared.extend(ids.iter().cloned());
        if shared.len() != before || !self.shared.exists().await? {
            self.shared.set_json(&shared).await?;
        }
        Ok(())
    }

    async fn remove_shared(&self, ids: &BTreeSet<String>) -> RelayResult<()> {
        let mut shared = self.shared_ids().await?;
        let before = shared.len();
        shared.retain(|id| !ids.contains(id));
        if shared.len() != before {
            self.shared.set_json(&shared).await?;
        }
        Ok(())
    }
}
