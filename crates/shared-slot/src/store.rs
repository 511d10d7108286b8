use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::{SlotBackend, SlotChange, SlotError, SlotResult};

/// Which backing a slot access resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotMode {
    Local,
    Shared,
}

/// Pair of backings plus the switch that picks between them. The switch is
/// consulted on every access, so flipping it takes effect immediately.
pub struct SlotStore {
    prefix: String,
    local: Arc<dyn SlotBackend>,
    shared: Arc<dyn SlotBackend>,
    sharing: AtomicBool,
}

impl SlotStore {
    pub fn new(
        prefix: impl Into<String>,
        local: Arc<dyn SlotBackend>,
        shared: Arc<dyn SlotBackend>,
        sharing: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            prefix: prefix.into(),
            local,
            shared,
            sharing: AtomicBool::new(sharing),
        })
    }

    pub fn set_sharing(&self, sharing: bool) {
        self.sharing.store(sharing, Ordering::SeqCst);
    }

    pub fn mode(&self) -> SlotMode {
        if self.sharing.load(Ordering::SeqCst) {
            SlotMode::Shared
        } else {
            SlotMode::Local
        }
    }

    fn backing_for(&self, mode: SlotMode) -> &Arc<dyn SlotBackend> {
        match mode {
            SlotMode::Local => &self.local,
            SlotMode::Shared => &self.shared,
        }
    }

    pub fn backing(&self) -> &Arc<dyn SlotBackend> {
        self.backing_for(self.mode())
    }

    /// Change events of the active backing, if it produces any.
    pub fn changes(&self) -> Option<broadcast::Receiver<SlotChange>> {
        self.backing().changes()
    }

    pub fn writer_id(&self) -> &str {
        self.backing().writer_id()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.backing().capacity()
    }

    pub fn key(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}:{}", self.prefix, name)
        }
    }

    pub fn slot(self: &Arc<Self>, name: &str) -> SharedSlot {
        SharedSlot {
            store: Arc::clone(self),
            key: self.key(name),
            last_mode: Arc::new(Mutex::new(None)),
        }
    }
}

/// A single named value resolved through a [`SlotStore`].
#[derive(Clone)]
pub struct SharedSlot {
    store: Arc<SlotStore>,
    key: String,
    last_mode: Arc<Mutex<Option<SlotMode>>>,
}

impl SharedSlot {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn store(&self) -> &Arc<SlotStore> {
        &self.store
    }

    /// Resolves the backing for this access, carrying the value over verbatim
    /// when the mode changed since the previous access. The old backing keeps
    /// its copy: other participants may still read it there.
    async fn resolve(&self) -> SlotResult<&Arc<dyn SlotBackend>> {
        let mode = self.store.mode();
        let previous = *self.last_mode.lock();
        if let Some(previous) = previous {
            if previous != mode {
                let from = self.store.backing_for(previous);
                let to = self.store.backing_for(mode);
                if let Some(value) = from.get(&self.key).await? {
                    to.set(&self.key, value).await?;
                }
                debug!(key = %self.key, from = ?previous, to = ?mode, "slot switched backing");
            }
        }
        *self.last_mode.lock() = Some(mode);
        Ok(self.store.backing_for(mode))
    }

    pub async fn get(&self) -> SlotResult<Option<String>> {
        self.resolve().await?.get(&self.key).await
    }

    pub async fn set(&self, value: String) -> SlotResult<()> {
        self.resolve().await?.set(&self.key, value).await
    }

    pub async fn remove(&self) -> SlotResult<()> {
        self.resolve().await?.remove(&self.key).await
    }

    pub async fn exists(&self) -> SlotResult<bool> {
        self.resolve().await?.exists(&self.key).await
    }

    /// Reads and decodes the value; an undecodable value reads as absent.
    pub async fn get_json<T: DeserializeOwned>(&self) -> SlotResult<Option<T>> {
        match self.get().await? {
            Some(raw) if !raw.is_empty() => match serde_json::from_str(&raw) {
                Ok(value) => Ok(Some(value)),
                Err(err) => {
                    debug!(key = %self.key, error = %err, "ignoring undecodable slot value");
                    Ok(None)
                }
            },
            _ => Ok(None),
        }
    }

    pub async fn set_json<T: Serialize>(&self, value: &T) -> SlotResult<()> {
        let raw = serde_json::to_string(value).map_err(|err| SlotError::Codec(err.to_string()))?;
        self.set(raw).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{LocalSlots, MemoryOrigin};

    fn store(origin: &MemoryOrigin, sharing: bool) -> Arc<SlotStore> {
        SlotStore::new(
            "push",
            Arc::new(LocalSlots::new()),
            Arc::new(origin.attach()),
            sharing,
        )
    }

    #[tokio::test]
    async fn prefixes_keys() {
        let origin = MemoryOrigin::new();
        let store = store(&origin, true);
        let slot = store.slot("lease");
        assert_eq!(slot.key(), "push:lease");
        slot.set("x".into()).await.unwrap();
        assert_eq!(origin.peek("push:lease").as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn carries_value_over_when_mode_switches() {
        let origin = MemoryOrigin::new();
        let store = store(&origin, false);
        let slot = store.slot("ids");
        slot.set("[\"a\"]".into()).await.unwrap();
        assert!(origin.peek("push:ids").is_none());

        store.set_sharing(true);
        assert_eq!(slot.get().await.unwrap().as_deref(), Some("[\"a\"]"));
        assert_eq!(origin.peek("push:ids").as_deref(), Some("[\"a\"]"));

        store.set_sharing(false);
        assert!(slot.exists().await.unwrap());
        assert_eq!(origin.peek("push:ids").as_deref(), Some("[\"a\"]"));
    }

    #[tokio::test]
    async fn opting_out_leaves_shared_value_for_peers() {
        let origin = MemoryOrigin::new();
        let leaving = store(&origin, true);
        let staying = store(&origin, true);
        let mine = leaving.slot("push-ids");
        mine.set("[\"a\"]".into()).await.unwrap();

        leaving.set_sharing(false);
        assert_eq!(mine.get().await.unwrap().as_deref(), Some("[\"a\"]"));
        assert_eq!(
            staying.slot("push-ids").get().await.unwrap().as_deref(),
            Some("[\"a\"]")
        );
    }

    #[tokio::test]
    async fn json_helpers_treat_garbage_as_absent() {
        let origin = MemoryOrigin::new();
        let store = store(&origin, true);
        let slot = store.slot("lease");
        slot.set("{not json".into()).await.unwrap();
        assert!(slot.get_json::<Vec<String>>().await.unwrap().is_none());

        slot.set_json(&vec!["a".to_string()]).await.unwrap();
        assert_eq!(
            slot.get_json::<Vec<String>>().await.unwrap(),
            Some(vec!["a".to_string()])
        );
    }

    #[tokio::test]
    async fn changes_follow_active_backing() {
        let origin = MemoryOrigin::new();
        let store = store(&origin, false);
        assert!(store.changes().is_none());
        store.set_sharing(true);
        assert!(store.changes().is_some());
    }
}
