use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{SlotBackend, SlotChange, SlotError, SlotResult};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

impl From<redis::RedisError> for SlotError {
    fn from(err: redis::RedisError) -> Self {
        SlotError::Backend(err.to_string())
    }
}

/// Cross-process slots kept in Redis. Every write is announced on a pub/sub
/// channel so peers observe it as a [`SlotChange`].
pub struct RedisSlots {
    conn: ConnectionManager,
    channel: String,
    writer: String,
    changes: broadcast::Sender<SlotChange>,
    forwarder: JoinHandle<()>,
}

impl RedisSlots {
    /// Connects to `url` and subscribes to `channel` before returning, so no
    /// change published after this call is missed.
    pub async fn connect(url: &str, channel: impl Into<String>) -> SlotResult<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        let channel = channel.into();

        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(&channel).await?;

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let forwarder = tokio::spawn(forward_changes(pubsub, changes.clone()));

        Ok(Self {
            conn,
            channel,
            writer: Uuid::new_v4().to_string(),
            changes,
            forwarder,
        })
    }

    async fn announce(&self, key: &str, value: Option<String>) -> SlotResult<()> {
        let change = SlotChange {
            key: key.to_string(),
            value,
            writer: self.writer.clone(),
        };
        let payload =
            serde_json::to_string(&change).map_err(|err| SlotError::Codec(err.to_string()))?;
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(&self.channel, payload).await?;
        Ok(())
    }
}

impl Drop for RedisSlots {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

async fn forward_changes(mut pubsub: redis::aio::PubSub, sender: broadcast::Sender<SlotChange>) {
    let mut messages = pubsub.on_message();
    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                warn!(target: "slot.redis", error = %err, "dropping non-text change message");
                continue;
            }
        };
        match serde_json::from_str::<SlotChange>(&payload) {
            Ok(change) => {
                let _ = sender.send(change);
            }
            Err(err) => {
                warn!(target: "slot.redis", error = %err, "failed to decode slot change");
            }
        }
    }
    debug!(target: "slot.redis", "change subscription ended");
}

#[async_trait]
impl SlotBackend for RedisSlots {
    async fn get(&self, key: &str) -> SlotResult<Option<String>> {
        let mut conn = self.conn.clone();
        Ok(conn.get::<_, Option<String>>(key).await?)
    }

    async fn set(&self, key: &str, value: String) -> SlotResult<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(key, &value).await?;
        self.announce(key, Some(value)).await
    }

    async fn remove(&self, key: &str) -> SlotResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        self.announce(key, None).await
    }

    async fn exists(&self, key: &str) -> SlotResult<bool> {
        let mut conn = self.conn.clone();
        Ok(conn.exists::<_, bool>(key).await?)
    }

    fn changes(&self) -> Option<broadcast::Receiver<SlotChange>> {
        Some(self.changes.subscribe())
    }

    fn writer_id(&self) -> &str {
        &self.writer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[ignore = "requires a running redis at REDIS_URL"]
    async fn redis_slots_roundtrip_and_announce() {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1/".into());
        let a = RedisSlots::connect(&url, "push-relay-test:changes")
            .await
            .expect("redis");
        let b = RedisSlots::connect(&url, "push-relay-test:changes")
            .await
            .expect("redis");
        let mut rx = b.changes().expect("changes");

        a.set("push-relay-test:lease", "owner".into())
            .await
            .expect("set");
        assert_eq!(
            b.get("push-relay-test:lease").await.unwrap().as_deref(),
            Some("owner")
        );

        let change = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("change timeout")
            .expect("change");
        assert_eq!(change.key, "push-relay-test:lease");
        assert_eq!(change.writer, a.writer_id());

        a.remove("push-relay-test:lease").await.expect("remove");
        assert!(!b.exists("push-relay-test:lease").await.unwrap());
    }
}
