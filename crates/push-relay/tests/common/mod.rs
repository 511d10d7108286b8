#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use push_relay::{
    LongPollRequest, LongPollResponse, LongPollTransport, PushRelay, RelayConfig, RelayContext,
    RelayEvent, StaticAuth, TransportError,
};
use shared_slot::{LocalSlots, MemoryOrigin, SlotStore};
use tokio::sync::broadcast;

pub enum Reply {
    Respond(LongPollResponse),
    Fail,
    /// Held open by the server until aborted.
    Hang,
}

/// Long-poll transport that answers from a script. Once the script runs
/// out every request hangs, like a server with nothing to say.
#[derive(Default)]
pub struct ScriptedTransport {
    replies: Mutex<VecDeque<Reply>>,
    requests: Mutex<Vec<LongPollRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push(&self, reply: Reply) -> &Self {
        self.replies.lock().push_back(reply);
        self
    }

    pub fn json(&self, body: serde_json::Value) -> &Self {
        self.push(Reply::Respond(
            LongPollResponse::new(200, body.to_string()).with_header("content-type", "application/json"),
        ))
    }

    pub fn status(&self, status: u16) -> &Self {
        self.push(Reply::Respond(LongPollResponse::new(status, "")))
    }

    pub fn fail(&self, times: usize) -> &Self {
        for _ in 0..times {
            self.push(Reply::Fail);
        }
        self
    }

    pub fn requests(&self) -> Vec<LongPollRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// `push-ids` of the n-th request body.
    pub fn sent_ids(&self, index: usize) -> Vec<String> {
        let body: serde_json::Value =
            serde_json::from_str(&self.requests()[index].body).expect("request body is json");
        serde_json::from_value(body["push-ids"].clone()).expect("push-ids array")
    }
}

#[async_trait]
impl LongPollTransport for ScriptedTransport {
    async fn long_poll(&self, request: LongPollRequest) -> Result<LongPollResponse, TransportError> {
        self.requests.lock().push(request);
        let reply = self.replies.lock().pop_front();
        match reply {
            Some(Reply::Respond(response)) => Ok(response),
            Some(Reply::Fail) => Err(TransportError::Network("connection refused".into())),
            Some(Reply::Hang) | None => std::future::pending().await,
        }
    }
}

pub fn config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.server_url = "http://push.test/".parse().expect("url");
    config.poll_period = Duration::from_millis(1_000);
    config.connection.heartbeat_interval = Duration::from_millis(1_000);
    config.connection.network_retry_factors = vec![0.1, 0.2];
    config.connection.network_delay = Duration::ZERO;
    config.connection.server_retry_delays = vec![Duration::from_millis(100), Duration::from_millis(200)];
    config
}

pub fn participant(
    origin: &MemoryOrigin,
    id: &str,
    transport: &Arc<ScriptedTransport>,
    config: RelayConfig,
) -> PushRelay {
    let store = SlotStore::new(
        config.key_prefix.clone(),
        Arc::new(LocalSlots::new()),
        Arc::new(origin.attach()),
        config.share_connection,
    );
    let auth = StaticAuth::new("realm", "account").with_token("token");
    let ctx = RelayContext::new(config, store, transport.clone(), Arc::new(auth)).with_participant_id(id);
    PushRelay::start(ctx)
}

pub async fn eventually<F: FnMut() -> bool>(mut check: F, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

pub async fn owners(relays: &[&PushRelay]) -> Vec<String> {
    let mut owners = Vec::new();
    for relay in relays {
        if relay.is_owner().await.expect("lease readable") {
            owners.push(relay.participant_id().to_string());
        }
    }
    owners
}

pub async fn wait_for<F, Fut>(mut check: F, within: Duration) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}

pub fn drain(events: &mut broadcast::Receiver<RelayEvent>) -> Vec<RelayEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}
