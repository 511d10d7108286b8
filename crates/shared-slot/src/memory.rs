use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::{SlotBackend, SlotChange, SlotError, SlotResult};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

fn check_capacity(capacity: Option<usize>, key: &str, value: &str) -> SlotResult<()> {
    match capacity {
        Some(capacity) if value.len() > capacity => Err(SlotError::CapacityExceeded {
            key: key.to_string(),
            len: value.len(),
            capacity,
        }),
        _ => Ok(()),
    }
}

/// Process-local slots. Nothing written here is visible to other participants.
#[derive(Debug)]
pub struct LocalSlots {
    values: RwLock<HashMap<String, String>>,
    writer: String,
    capacity: Option<usize>,
}

impl LocalSlots {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            writer: Uuid::new_v4().to_string(),
            capacity: None,
        }
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

impl Default for LocalSlots {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SlotBackend for LocalSlots {
    async fn get(&self, key: &str) -> SlotResult<Option<String>> {
        Ok(self.values.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> SlotResult<()> {
        check_capacity(self.capacity, key, &value)?;
        self.values.write().insert(key.to_string(), value);
        Ok(())
    }

    async fn remove(&self, key: &str) -> SlotResult<()> {
        self.values.write().remove(key);
        Ok(())
    }

    fn writer_id(&self) -> &str {
        &self.writer
    }

    fn capacity(&self) -> Option<usize> {
        self.capacity
    }
}

#[derive(Debug)]
struct OriginInner {
    values: RwLock<HashMap<String, String>>,
    changes: broadcast::Sender<SlotChange>,
    capacity: Option<usize>,
}

/// In-memory storage shared by every participant attached to it, with change
/// events. Stands in for cross-process storage when all participants live in
/// one process.
#[derive(Debug, Clone)]
pub struct MemoryOrigin {
    inner: Arc<OriginInner>,
}

impl MemoryOrigin {
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self::build(Some(capacity))
    }

    fn build(capacity: Option<usize>) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(OriginInner {
                values: RwLock::new(HashMap::new()),
                changes,
                capacity,
            }),
        }
    }

    /// Returns a handle with its own writer identity.
    pub fn attach(&self) -> OriginSlots {
        OriginSlots {
            inner: Arc::clone(&self.inner),
            writer: Uuid::new_v4().to_string(),
        }
    }

    /// Raw read that bypasses any handle, for inspection.
    pub fn peek(&self, key: &str) -> Option<String> {
        self.inner.values.read().get(key).cloned()
    }
}

impl Default for MemoryOrigin {
    fn default() -> Self {
        Self::new()
    }
}

/// One participant's view of a [`MemoryOrigin`].
#[derive(Debug, Clone)]
pub struct OriginSlots {
    inner: Arc<OriginInner>,
    writer: String,
}

impl OriginSlots {
    fn publish(&self, key: &str, value: Option<String>) {
        // No receivers is fine: nobody is listening yet.
        let _ = self.inner.changes.send(SlotChange {
            key: key.to_string(),
            value,
            writer: self.writer.clone(),
        });
    }
}

#[async_trait]
impl SlotBackend for OriginSlots {
    async fn get(&self, key: &str) -> SlotResult<Option<String>> {
        Ok(self.inner.values.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> SlotResult<()> {
        check_capacity(self.inner.capacity, key, &value)?;
        self.inner
            .values
            .write()
            .insert(key.to_string(), value.clone());
        self.publish(key, Some(value));
        Ok(())
    }

    async fn remove(&self, key: &str) -> SlotResult<()> {
        let removed = self.inner.values.write().remove(key);
        if removed.is_some() {
            self.publish(key, None);
        }
        Ok(())
    }

    fn changes(&self) -> Option<broadcast::Receiver<SlotChange>> {
        Some(self.inner.changes.subscribe())
    }

    fn writer_id(&self) -> &str {
        &self.writer
    }

    fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }
}
