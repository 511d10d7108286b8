//! Named values shared between cooperating participants of one origin.
//!
//! A [`SlotBackend`] is a flat key/value space with last-writer-wins semantics
//! and no compare-and-swap. Backings that span several participants also
//! publish a [`SlotChange`] for every write so peers can react without polling.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

pub mod memory;
pub mod redis_slots;
pub mod store;

pub use memory::{LocalSlots, MemoryOrigin, OriginSlots};
pub use redis_slots::RedisSlots;
pub use store::{SharedSlot, SlotMode, SlotStore};

/// A write observed on a shared backing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotChange {
    pub key: String,
    /// `None` when the key was removed.
    pub value: Option<String>,
    /// Writer id of the handle that performed the write.
    pub writer: String,
}

#[derive(Debug, Error)]
pub enum SlotError {
    #[error("slot backend error: {0}")]
    Backend(String),
    #[error("slot value codec error: {0}")]
    Codec(String),
    #[error("value for {key} is {len} bytes, capacity is {capacity}")]
    CapacityExceeded {
        key: String,
        len: usize,
        capacity: usize,
    },
    #[error("slot change channel closed")]
    Closed,
}

pub type SlotResult<T> = Result<T, SlotError>;

#[async_trait]
pub trait SlotBackend: Send + Sync {
    async fn get(&self, key: &str) -> SlotResult<Option<String>>;
    async fn set(&self, key: &str, value: String) -> SlotResult<()>;
    async fn remove(&self, key: &str) -> SlotResult<()>;

    async fn exists(&self, key: &str) -> SlotResult<bool> {
        Ok(self.get(key).await?.is_some())
    }

    /// Change notifications from other writers, when the backing supports them.
    fn changes(&self) -> Option<broadcast::Receiver<SlotChange>> {
        None
    }

    /// Identity stamped on changes produced through this handle.
    fn writer_id(&self) -> &str;

    /// Largest value, in bytes, the backing accepts for a single key.
    fn capacity(&self) -> Option<usize> {
        None
    }
}
