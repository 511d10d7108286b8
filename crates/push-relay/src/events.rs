use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 128;

/// Why the connection stopped without a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Paused,
    TooManyEmptyResponses,
    ClosedByServer { reason: Option<String> },
    Shutdown,
}

/// Lifecycle events surfaced to the application. Transport errors never
/// appear here directly; only their outcome once a retry budget is spent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Received {
        sequence: Option<u64>,
        notifications: usize,
    },
    Unstable {
        attempt: usize,
        total: usize,
    },
    Lost,
    ServerError {
        status: u16,
    },
    ReEstablished {
        owner: String,
    },
    Stopped(StopReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Receive,
    Unstable,
    Lost,
    ServerError,
    ReEstablished,
    Stopped,
}

impl RelayEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RelayEvent::Received { .. } => EventKind::Receive,
            RelayEvent::Unstable { .. } => EventKind::Unstable,
            RelayEvent::Lost => EventKind::Lost,
            RelayEvent::ServerError { .. } => EventKind::ServerError,
            RelayEvent::ReEstablished { .. } => EventKind::ReEstablished,
            RelayEvent::Stopped(_) => EventKind::Stopped,
        }
    }
}

type Listener = Arc<dyn Fn(&RelayEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    entries: Vec<(u64, EventKind, Listener)>,
}

/// Fans lifecycle events out to per-kind listeners and to a broadcast stream.
#[derive(Clone)]
pub struct EventHub {
    listeners: Arc<Mutex<Listeners>>,
    stream: broadcast::Sender<RelayEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (stream, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            listeners: Arc::new(Mutex::new(Listeners::default())),
            stream,
        }
    }

    pub fn listen<F>(&self, kind: EventKind, listener: F) -> Unsubscribe
    where
        F: Fn(&RelayEvent) + Send + Sync + 'static,
    {
        let mut guard = self.listeners.lock();
        let id = guard.next_id;
        guard.next_id += 1;
        guard.entries.push((id, kind, Arc::new(listener)));
        Unsubscribe {
            listeners: Arc::downgrade(&self.listeners),
            id,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.stream.subscribe()
    }

    /// Listeners run outside the lock, so they may (un)subscribe re-entrantly.
    pub fn emit(&self, event: RelayEvent) {
        let kind = event.kind();
        let matching: Vec<Listener> = self
            .listeners
            .lock()
            .entries
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, listener)| Arc::clone(listener))
            .collect();
        for listener in matching {
            listener(&event);
        }
        let _ = self.stream.send(event);
    }

    pub fn clear(&self) {
        self.listeners.lock().entries.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().entries.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned by every listener registration.
#[must_use = "dropping this keeps the listener registered; call unsubscribe() to remove it"]
pub struct Unsubscribe {
    listeners: Weak<Mutex<Listeners>>,
    id: u64,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners.lock().entries.retain(|(id, _, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn routes_by_kind_and_unsubscribes() {
        let hub = EventHub::new();
        let lost = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&lost);
        let handle = hub.listen(EventKind::Lost, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let _other = hub.listen(EventKind::Stopped, |_| panic!("wrong kind"));

        hub.emit(RelayEvent::Lost);
        assert_eq!(lost.load(Ordering::SeqCst), 1);

        handle.unsubscribe();
        hub.emit(RelayEvent::Lost);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
        assert_eq!(hub.listener_count(), 1);
    }

    #[tokio::test]
    async fn stream_sees_every_event() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();
        hub.emit(RelayEvent::ServerError { status: 503 });
        hub.emit(RelayEvent::Stopped(StopReason::Paused));
        assert_eq!(rx.recv().await.unwrap(), RelayEvent::ServerError { status: 503 });
        assert_eq!(
            rx.recv().await.unwrap(),
            RelayEvent::Stopped(StopReason::Paused)
        );
    }

    #[test]
    fn clear_drops_all_listeners() {
        let hub = EventHub::new();
        let _a = hub.listen(EventKind::Receive, |_| {});
        let _b = hub.listen(EventKind::Lost, |_| {});
        hub.clear();
        assert_eq!(hub.listener_count(), 0);
    }
}
