//! The long-poll connection driver.
//!
//! One actor task per participant owns every piece of connection state. Public
//! calls and internal completions (attempt finished, retry step, back-off
//! elapsed) arrive as messages, so state is only ever touched from that task.
//! Each long-poll attempt runs in its own task carrying a cancellation token
//! and a generation number; completions from superseded attempts are dropped.
//!
//! Only one retry sequence is active at a time. A failure of the other kind
//! cancels it and starts its own table from the beginning.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use shared_slot::SharedSlot;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{push_url, AuthProvider};
use crate::broadcast::Broadcaster;
use crate::commands::{parse_response, PushCommand, PushResponse, ServerConfiguration};
use crate::config::ConnectionConfig;
use crate::error::{RelayError, RelayResult};
use crate::events::{EventHub, RelayEvent, StopReason};
use crate::lease::LeaseSlot;
use crate::registry::PushIdRegistry;
use crate::retry::{start_sequence, RetryHandle};
use crate::transport::{LongPollRequest, LongPollResponse, LongPollTransport, TransportError};

pub const CLOSE_HEADER: &str = "x-push-connection";
pub const CLOSE_REASON_HEADER: &str = "x-push-close-reason";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Stopped,
    Connecting,
    NetworkRetryWait,
    ServerErrorRetryWait,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Network,
    Server,
}

enum Command {
    Start,
    Restart,
    Stop,
    Pause,
    Resume,
    Reconfigure(ServerConfiguration),
    Shutdown(oneshot::Sender<()>),
}

enum Internal {
    AttemptFinished {
        generation: u64,
        outcome: Result<LongPollResponse, TransportError>,
    },
    RetryStep {
        sequence: u64,
        index: usize,
        total: usize,
    },
    RetryExhausted {
        sequence: u64,
    },
    BackOffElapsed {
        generation: u64,
    },
}

/// Everything the driver needs from the rest of the participant.
pub struct ConnectionParts {
    pub config: ConnectionConfig,
    pub server_url: Url,
    pub transport: Arc<dyn LongPollTransport>,
    pub auth: Arc<dyn AuthProvider>,
    pub registry: Arc<PushIdRegistry>,
    pub lease: LeaseSlot,
    pub browser: SharedSlot,
    pub broadcaster: Arc<dyn Broadcaster>,
    pub events: EventHub,
}

/// Cheap, cloneable control surface for the driver task.
#[derive(Clone)]
pub struct ConnectionHandle {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
    last_sent: Arc<Mutex<BTreeSet<String>>>,
}

impl ConnectionHandle {
    fn send(&self, command: Command) -> RelayResult<()> {
        self.commands
            .send(command)
            .map_err(|_| RelayError::DriverGone)
    }

    /// Opens the connection unless it is already running or paused.
    pub fn start(&self) -> RelayResult<()> {
        self.send(Command::Start)
    }

    /// Aborts whatever is in flight and reconnects immediately.
    pub fn restart(&self) -> RelayResult<()> {
        self.send(Command::Restart)
    }

    /// Stops silently. Used when ownership moves elsewhere. A paused
    /// connection stays paused.
    pub fn stop(&self) -> RelayResult<()> {
        self.send(Command::Stop)
    }

    pub fn pause(&self) -> RelayResult<()> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> RelayResult<()> {
        self.send(Command::Resume)
    }

    pub fn reconfigure(&self, configuration: ServerConfiguration) -> RelayResult<()> {
        self.send(Command::Reconfigure(configuration))
    }

    /// Stops the driver for good. Listeners are cleared once it returns.
    pub async fn shutdown(&self) -> RelayResult<()> {
        let (done, wait) = oneshot::channel();
        self.send(Command::Shutdown(done))?;
        wait.await.map_err(|_| RelayError::DriverGone)
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Waits until the driver reports `target`.
    pub async fn wait_for(&self, target: ConnectionState) -> RelayResult<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| RelayError::DriverGone)
    }

    /// Push ids carried by the most recent request.
    pub fn last_sent(&self) -> BTreeSet<String> {
        self.last_sent.lock().clone()
    }
}

pub fn spawn_connection(parts: ConnectionParts) -> ConnectionHandle {
    let (commands, command_rx) = mpsc::unbounded_channel();
    let (internal, internal_rx) = mpsc::unbounded_channel();
    let (state_tx, state) = watch::channel(ConnectionState::Stopped);
    let last_sent = Arc::new(Mutex::new(BTreeSet::new()));

    let driver = Driver {
        empty_budget: parts.config.empty_response_retries,
        parts,
        internal,
        state_tx,
        last_sent: Arc::clone(&last_sent),
        state: ConnectionState::Stopped,
        generation: 0,
        in_flight: None,
        retry: None,
        next_sequence: 0,
        exhausted: false,
        last_status: 0,
        server_sequence: None,
        last_server_timestamp: None,
        back_off: None,
    };
    tokio::spawn(driver.run(command_rx, internal_rx));

    ConnectionHandle {
        commands,
        state,
        last_sent,
    }
}

#[derive(Serialize)]
struct PollBody<'a> {
    #[serde(rename = "push-ids")]
    push_ids: &'a BTreeSet<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    browser: Option<&'a str>,
}

struct ActiveRetry {
    kind: FailureKind,
    id: u64,
    handle: RetryHandle,
}

struct Driver {
    parts: ConnectionParts,
    internal: mpsc::UnboundedSender<Internal>,
    state_tx: watch::Sender<ConnectionState>,
    last_sent: Arc<Mutex<BTreeSet<String>>>,
    state: ConnectionState,
    generation: u64,
    in_flight: Option<CancellationToken>,
    retry: Option<ActiveRetry>,
    next_sequence: u64,
    /// The active table ran out while an attempt was still outstanding; that
    /// attempt's outcome decides between recovery and a terminal event.
    exhausted: bool,
    empty_budget: u32,
    last_status: u16,
    server_sequence: Option<u64>,
    last_server_timestamp: Option<u64>,
    back_off: Option<CancellationToken>,
}

impl Driver {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.on_command(command).await {
                            break;
                        }
                    }
                    None => {
                        self.abort_all();
                        break;
                    }
                },
                Some(message) = internal.recv() => self.on_internal(message).await,
            }
        }
        debug!(target: "push.connection", "connection driver exited");
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!(target: "push.connection", from = ?self.state, to = ?state, "state change");
        }
        self.state = state;
        self.state_tx.send_replace(state);
    }

    /// Returns false once the driver should exit.
    async fn on_command(&mut self, command: Command) -> bool {
        match command {
            Command::Start => {
                if self.state == ConnectionState::Stopped {
                    self.fresh_start().await;
                }
            }
            Command::Restart => {
                if self.state != ConnectionState::Paused {
                    self.fresh_start().await;
                }
            }
            Command::Stop => {
                self.abort_all();
                self.last_sent.lock().clear();
                // Only resume() leaves Paused.
                if self.state != ConnectionState::Paused {
                    self.set_state(ConnectionState::Stopped);
                }
            }
            Command::Pause => {
                if self.state == ConnectionState::Paused {
                    return true;
                }
                self.abort_all();
                self.set_state(ConnectionState::Paused);
                info!(target: "push.connection", "connection paused");
                self.parts.events.emit(RelayEvent::Stopped(StopReason::Paused));
            }
            Command::Resume => {
                if self.state == ConnectionState::Paused {
                    self.set_state(ConnectionState::Stopped);
                    info!(target: "push.connection", "connection resumed");
                    self.fresh_start().await;
                }
            }
            Command::Reconfigure(configuration) => self.reconfigure(&configuration),
            Command::Shutdown(done) => {
                self.shutdown();
                let _ = done.send(());
                return false;
            }
        }
        true
    }

    async fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::AttemptFinished {
                generation,
                outcome,
            } => {
                if generation != self.generation {
                    return;
                }
                self.in_flight = None;
                match outcome {
                    Err(err) => {
                        debug!(target: "push.connection", error = %err, "long-poll failed");
                        self.on_failure(FailureKind::Network);
                    }
                    Ok(response) if response.is_server_error() => {
                        self.last_status = response.status;
                        self.on_failure(FailureKind::Server);
                    }
                    Ok(response) if !response.is_success() => {
                        debug!(target: "push.connection", status = response.status, "unexpected status");
                        self.on_failure(FailureKind::Network);
                    }
                    Ok(response) => self.on_response(response).await,
                }
            }
            Internal::RetryStep {
                sequence,
                index,
                total,
            } => {
                let Some(kind) = self.retry_kind(sequence) else {
                    return;
                };
                if kind == FailureKind::Network {
                    self.parts.events.emit(RelayEvent::Unstable {
                        attempt: index + 1,
                        total,
                    });
                }
                debug!(target: "push.connection", kind = ?kind, attempt = index + 1, total, "retrying");
                self.issue().await;
            }
            Internal::RetryExhausted { sequence } => {
                let Some(kind) = self.retry_kind(sequence) else {
                    return;
                };
                if self.in_flight.is_some() {
                    self.exhausted = true;
                } else {
                    self.give_up(kind);
                }
            }
            Internal::BackOffElapsed { generation } => {
                if generation == self.generation && self.back_off.take().is_some() {
                    self.issue().await;
                }
            }
        }
    }

    fn retry_kind(&self, sequence: u64) -> Option<FailureKind> {
        self.retry
            .as_ref()
            .filter(|retry| retry.id == sequence)
            .map(|retry| retry.kind)
    }

    async fn fresh_start(&mut self) {
        self.abort_all();
        self.empty_budget = self.parts.config.empty_response_retries;
        self.issue().await;
    }

    /// Re-validates push ids and ownership, then sends one long-poll request.
    async fn issue(&mut self) {
        self.cancel_in_flight();
        let ids = match self.parts.registry.shared_ids().await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(target: "push.connection", error = %err, "could not read push ids");
                self.on_failure(FailureKind::Network);
                return;
            }
        };
        if ids.is_empty() {
            debug!(target: "push.connection", "no push ids registered, staying idle");
            self.to_stopped();
            return;
        }
        match self.parts.lease.is_held_by_me().await {
            Ok(true) => {}
            Ok(false) => {
                debug!(target: "push.connection", "lease not held, not connecting");
                self.to_stopped();
                return;
            }
            Err(err) => {
                warn!(target: "push.connection", error = %err, "could not read lease");
                self.on_failure(FailureKind::Network);
                return;
            }
        }
        let url = match push_url(&self.parts.server_url, self.parts.auth.as_ref()) {
            Ok(url) => url,
            Err(err) => {
                warn!(target: "push.connection", error = %err, "cannot build push url");
                self.to_stopped();
                return;
            }
        };
        let browser = self.parts.browser.get().await.ok().flatten();
        let body = match serde_json::to_string(&PollBody {
            push_ids: &ids,
            sequence: self.server_sequence,
            browser: browser.as_deref(),
        }) {
            Ok(body) => body,
            Err(err) => {
                warn!(target: "push.connection", error = %err, "cannot encode request body");
                self.to_stopped();
                return;
            }
        };

        *self.last_sent.lock() = ids;
        self.generation += 1;
        let generation = self.generation;
        let token = CancellationToken::new();
        self.in_flight = Some(token.clone());
        if self.retry.is_none() {
            self.set_state(ConnectionState::Connecting);
        }

        let transport = Arc::clone(&self.parts.transport);
        let internal = self.internal.clone();
        let request = LongPollRequest { url, body };
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                outcome = transport.long_poll(request) => {
                    let _ = internal.send(Internal::AttemptFinished { generation, outcome });
                }
            }
        });
    }

    fn on_failure(&mut self, kind: FailureKind) {
        let active = self.retry.as_ref().map(|retry| retry.kind);
        match active {
            Some(current) if current == kind && self.exhausted => self.give_up(kind),
            // The running sequence schedules the next attempt.
            Some(current) if current == kind => {}
            _ => {
                if let Some(current) = active {
                    info!(target: "push.connection", from = ?current, to = ?kind, "failure kind changed, switching retry table");
                }
                self.start_retry(kind, 0);
            }
        }
    }

    fn start_retry(&mut self, kind: FailureKind, resume_from: usize) {
        if let Some(previous) = self.retry.take() {
            previous.handle.cancel();
        }
        self.exhausted = false;
        let delays = match kind {
            FailureKind::Network => self.parts.config.network_retry_delays(),
            FailureKind::Server => self.parts.config.server_retry_delays.clone(),
        };
        self.next_sequence += 1;
        let id = self.next_sequence;
        let on_step = self.internal.clone();
        let on_abort = self.internal.clone();
        let handle = start_sequence(
            delays,
            resume_from,
            move |index, total| {
                let _ = on_step.send(Internal::RetryStep {
                    sequence: id,
                    index,
                    total,
                });
            },
            move || {
                let _ = on_abort.send(Internal::RetryExhausted { sequence: id });
            },
        );
        self.retry = Some(ActiveRetry { kind, id, handle });
        self.set_state(match kind {
            FailureKind::Network => ConnectionState::NetworkRetryWait,
            FailureKind::Server => ConnectionState::ServerErrorRetryWait,
        });
    }

    fn give_up(&mut self, kind: FailureKind) {
        self.abort_all();
        self.set_state(ConnectionState::Stopped);
        match kind {
            FailureKind::Network => {
                warn!(
                    target: "push.connection",
                    last_server_timestamp = ?self.last_server_timestamp,
                    "network retries exhausted, connection lost"
                );
                self.parts.events.emit(RelayEvent::Lost);
            }
            FailureKind::Server => {
                warn!(target: "push.connection", status = self.last_status, "server retries exhausted");
                self.parts.events.emit(RelayEvent::ServerError {
                    status: self.last_status,
                });
            }
        }
    }

    async fn on_response(&mut self, response: LongPollResponse) {
        self.cancel_retry();
        self.set_state(ConnectionState::Connecting);

        if response
            .header(CLOSE_HEADER)
            .is_some_and(|value| value.eq_ignore_ascii_case("close"))
        {
            let reason = response.header(CLOSE_REASON_HEADER).map(str::to_string);
            info!(target: "push.connection", reason = ?reason, "server closed the connection");
            self.to_stopped();
            self.parts
                .events
                .emit(RelayEvent::Stopped(StopReason::ClosedByServer { reason }));
            return;
        }

        let parsed = match classify_body(&response) {
            Some(parsed) => parsed,
            None => {
                self.empty_budget = self.empty_budget.saturating_sub(1);
                if self.empty_budget == 0 {
                    warn!(target: "push.connection", "too many empty responses, stopping");
                    self.to_stopped();
                    self.parts
                        .events
                        .emit(RelayEvent::Stopped(StopReason::TooManyEmptyResponses));
                } else {
                    debug!(target: "push.connection", remaining = self.empty_budget, "empty response");
                    self.issue().await;
                }
                return;
            }
        };

        self.empty_budget = self.parts.config.empty_response_retries;
        if parsed.sequence.is_some() {
            self.server_sequence = parsed.sequence;
        }
        if let Some(heartbeat) = parsed.heartbeat {
            if let Some(interval) = heartbeat.interval {
                if interval != self.parts.config.heartbeat_interval {
                    self.parts.config.heartbeat_interval = interval;
                    self.restart_active_retry();
                }
            }
            self.last_server_timestamp = Some(heartbeat.timestamp);
        }

        let mut delivered = 0usize;
        let mut back_off = None;
        for command in parsed.commands {
            debug!(target: "push.connection", command = command.name(), "dispatching");
            match command {
                PushCommand::Noop => {}
                PushCommand::Notifications(envelopes) => {
                    for envelope in envelopes {
                        delivered += 1;
                        if let Err(err) = self
                            .parts
                            .broadcaster
                            .notify(envelope.target_ids, envelope.payload)
                            .await
                        {
                            warn!(target: "push.connection", error = %err, "broadcast failed");
                        }
                    }
                }
                PushCommand::Configuration(configuration) => self.reconfigure(&configuration),
                PushCommand::Browser { id } => {
                    if let Err(err) = self.parts.browser.set(id).await {
                        warn!(target: "push.connection", error = %err, "could not store browser id");
                    }
                }
                PushCommand::BackOff { delay } => back_off = Some(delay),
            }
        }

        self.parts.events.emit(RelayEvent::Received {
            sequence: self.server_sequence,
            notifications: delivered,
        });

        match back_off {
            Some(delay) => self.schedule_back_off(delay),
            None => self.issue().await,
        }
    }

    fn schedule_back_off(&mut self, delay: Duration) {
        debug!(target: "push.connection", delay_ms = delay.as_millis() as u64, "server requested back-off");
        let token = CancellationToken::new();
        self.back_off = Some(token.clone());
        let generation = self.generation;
        let internal = self.internal.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = internal.send(Internal::BackOffElapsed { generation });
                }
            }
        });
    }

    fn reconfigure(&mut self, configuration: &ServerConfiguration) {
        let before = self.parts.config.clone();
        self.parts.config.apply(configuration);
        if configuration.response_timeout_handler.is_some() {
            self.empty_budget = self.parts.config.empty_response_retries;
        }
        if self.parts.config != before {
            info!(target: "push.connection", config = ?self.parts.config, "connection reconfigured");
            self.restart_active_retry();
        }
    }

    /// Rebuilds the active retry table from current settings, resuming at
    /// the old cursor.
    fn restart_active_retry(&mut self) {
        if let Some(retry) = &self.retry {
            let kind = retry.kind;
            let cursor = retry.handle.cursor();
            let exhausted = self.exhausted;
            self.start_retry(kind, cursor);
            self.exhausted = exhausted;
        }
    }

    fn cancel_in_flight(&mut self) {
        if let Some(token) = self.in_flight.take() {
            token.cancel();
        }
        if let Some(token) = self.back_off.take() {
            token.cancel();
        }
        self.generation += 1;
    }

    fn cancel_retry(&mut self) {
        if let Some(retry) = self.retry.take() {
            retry.handle.cancel();
        }
        self.exhausted = false;
    }

    fn abort_all(&mut self) {
        self.cancel_in_flight();
        self.cancel_retry();
    }

    fn to_stopped(&mut self) {
        self.abort_all();
        self.set_state(ConnectionState::Stopped);
    }

    fn shutdown(&mut self) {
        self.abort_all();
        self.last_sent.lock().clear();
        self.set_state(ConnectionState::Stopped);
        info!(target: "push.connection", "connection shut down");
        self.parts
            .events
            .emit(RelayEvent::Stopped(StopReason::Shutdown));
        self.parts.events.clear();
    }
}

/// `None` for bodies that count against the empty-response budget: blank,
/// non-JSON content type, or unparsable.
fn classify_body(response: &LongPollResponse) -> Option<PushResponse> {
    if response.body.trim().is_empty() {
        return None;
    }
    if let Some(content_type) = response.header("content-type") {
        if !content_type.to_ascii_lowercase().contains("json") {
            debug!(target: "push.connection", content_type, "unexpected content type");
            return None;
        }
    }
    match parse_response(&response.body) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            debug!(target: "push.connection", error = %err, "unparsable response");
            None
        }
    }
}
