use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use futures::{Stream, StreamExt};
use opencode_client_error::ClientError;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio_util::sync::CancellationToken;

use crate::classify::classify_status;
use crate::config::StreamConfig;
use crate::events::{decode_event, StreamEvent};
use crate::retry::backoff_delay;
use crate::sse::{SseDecoder, SseFrame};
use crate::transport::Transport;

const RAW_FRAME_LOG_LIMIT: usize = 200;

/// Which events a subscription receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionFilter {
    #[default]
    All,
    Session(String),
}

impl SessionFilter {
    pub fn session(id: impl Into<String>) -> Self {
        Self::Session(id.into())
    }

    /// Events without a session (delivery markers, server-wide errors) reach
    /// every subscriber.
    pub fn matches(&self, event: &StreamEvent) -> bool {
        match self {
            Self::All => true,
            Self::Session(id) => event.session_id().map_or(true, |session| session == id),
        }
    }
}

impl From<Option<String>> for SessionFilter {
    fn from(session_id: Option<String>) -> Self {
        session_id.map_or(Self::All, Self::Session)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Closed,
}

/// Sees every decoded event before it is fanned out.
pub trait EventObserver: Send + Sync {
    fn observe(&self, event: &StreamEvent);
}

/// Largest per-subscriber queue. Requested capacities are clamped to a power
/// of two no larger than the request.
const MAX_SUBSCRIBER_BUFFER: usize = 1 << 16;

/// One subscriber's delivery queue. A full queue evicts its oldest event and
/// the receiver reports the gap as `Lagged` on its next read.
struct SubscriberEntry {
    filter: SessionFilter,
    sender: broadcast::Sender<StreamEvent>,
    capacity: usize,
    lossy: Arc<AtomicBool>,
}

impl SubscriberEntry {
    fn deliver(&self, event: &StreamEvent) {
        if !self.filter.matches(event) {
            return;
        }
        if self.sender.len() >= self.capacity {
            self.lossy.store(true, Ordering::SeqCst);
        }
        let _ = self.sender.send(event.clone());
    }
}

fn queue_capacity(requested: usize) -> usize {
    let requested = requested.clamp(1, MAX_SUBSCRIBER_BUFFER);
    1 << (usize::BITS - 1 - requested.leading_zeros())
}

struct BusTable {
    state: BusState,
    subscribers: BTreeMap<u64, SubscriberEntry>,
    loop_started: bool,
    epoch: u64,
}

struct BusShared {
    transport: Arc<dyn Transport>,
    config: StreamConfig,
    table: Mutex<BusTable>,
    shutdown: CancellationToken,
    observer: Option<Arc<dyn EventObserver>>,
    next_id: AtomicU64,
}

enum PumpExit {
    Shutdown,
    Ended { reason: String, connected: bool },
}

/// Owns the single event-stream connection of a client and fans decoded
/// events out to subscribers.
pub struct EventBus {
    shared: Arc<BusShared>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("path", &self.shared.config.path)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: StreamConfig,
        observer: Option<Arc<dyn EventObserver>>,
    ) -> Self {
        Self {
            shared: Arc::new(BusShared {
                transport,
                config,
                table: Mutex::new(BusTable {
                    state: BusState::Idle,
                    subscribers: BTreeMap::new(),
                    loop_started: false,
                    epoch: 0,
                }),
                shutdown: CancellationToken::new(),
                observer,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn state(&self) -> BusState {
        lock(&self.shared.table).state
    }

    /// Number of successful connections so far.
    pub fn epoch(&self) -> u64 {
        lock(&self.shared.table).epoch
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.shared.table).subscribers.len()
    }

    pub fn subscribe(&self, filter: SessionFilter) -> Result<Subscription, ClientError> {
        self.subscribe_with_capacity(filter, self.shared.config.subscriber_buffer)
    }

    /// Registers a subscriber and starts the connection loop if this is the
    /// first one. `capacity` is rounded down to a power of two.
    pub fn subscribe_with_capacity(
        &self,
        filter: SessionFilter,
        capacity: usize,
    ) -> Result<Subscription, ClientError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ClientError::StreamDisconnected {
                reason: "no tokio runtime to drive the event stream".to_string(),
            }
        })?;
        let capacity = queue_capacity(capacity);
        let (sender, receiver) = broadcast::channel(capacity);
        let lossy = Arc::new(AtomicBool::new(false));
        let id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);

        let start_loop = {
            let mut table = lock(&self.shared.table);
            if table.state == BusState::Closed {
                return Err(ClientError::StreamDisconnected {
                    reason: "event bus is closed".to_string(),
                });
            }
            table.subscribers.insert(
                id,
                SubscriberEntry {
                    filter: filter.clone(),
                    sender,
                    capacity,
                    lossy: lossy.clone(),
                },
            );
            if table.loop_started {
                false
            } else {
                table.loop_started = true;
                table.state = BusState::Connecting;
                true
            }
        };

        tracing::debug!(subscriber = id, filter = ?filter, capacity = capacity, "event bus: subscribed");
        if start_loop {
            tracing::info!(path = %self.shared.config.path, "event bus: starting stream loop");
            runtime.spawn(run(self.shared.clone()));
        }

        Ok(Subscription {
            id,
            filter,
            receiver,
            lossy,
            bus: Arc::downgrade(&self.shared),
        })
    }

    /// Closes the connection and ends every subscription. Later subscribe
    /// calls fail with `StreamDisconnected`.
    pub fn shutdown(&self) {
        if self.state() != BusState::Closed {
            tracing::info!(path = %self.shared.config.path, "event bus: shutting down");
        }
        self.shared.shutdown.cancel();
        self.shared.close(None);
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

impl BusShared {
    fn set_state(&self, state: BusState) {
        let mut table = lock(&self.table);
        if table.state != BusState::Closed {
            table.state = state;
        }
    }

    fn begin_epoch(&self) -> u64 {
        let mut table = lock(&self.table);
        if table.state != BusState::Closed {
            table.state = BusState::Connected;
        }
        table.epoch += 1;
        table.epoch
    }

    fn broadcast(&self, event: StreamEvent) {
        let table = lock(&self.table);
        for entry in table.subscribers.values() {
            entry.deliver(&event);
        }
    }

    fn close(&self, terminal: Option<StreamEvent>) {
        let subscribers = {
            let mut table = lock(&self.table);
            table.state = BusState::Closed;
            std::mem::take(&mut table.subscribers)
        };
        // Dropping the senders ends each subscription once its queue drains.
        if let Some(event) = &terminal {
            for entry in subscribers.values() {
                entry.deliver(event);
            }
        }
    }

    fn dispatch_frame(&self, frame: &SseFrame) {
        let event = match decode_event(&frame.data) {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::debug!(sse_event = ?frame.event, "event bus: skipping untracked event type");
                return;
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    raw = %truncate(&frame.data, RAW_FRAME_LOG_LIMIT),
                    "event bus: skipping malformed frame"
                );
                return;
            }
        };
        if let Some(observer) = &self.observer {
            observer.observe(&event);
        }
        self.broadcast(event);
    }

    async fn connect_and_pump(&self, decoder: &mut SseDecoder) -> PumpExit {
        let path = self.config.path.as_str();
        let opened = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => return PumpExit::Shutdown,
            opened = self.transport.open_stream(path) => opened,
        };
        let response = match opened {
            Ok(response) => response,
            Err(err) => {
                return PumpExit::Ended {
                    reason: err.message,
                    connected: false,
                }
            }
        };
        if !(200..300).contains(&response.status) {
            let err = classify_status(
                response.status,
                &[],
                "event_stream",
                &format!("event stream {path}"),
            );
            return PumpExit::Ended {
                reason: err.to_string(),
                connected: false,
            };
        }

        decoder.reset();
        let epoch = self.begin_epoch();
        tracing::info!(path = %path, epoch = epoch, "event bus: connected");

        let mut stream = response.stream;
        let mut frames: u64 = 0;
        loop {
            let next = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return PumpExit::Shutdown,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(chunk)) => {
                    for frame in decoder.push(&chunk) {
                        frames += 1;
                        self.dispatch_frame(&frame);
                    }
                }
                Some(Err(err)) => {
                    tracing::debug!(epoch = epoch, frames = frames, "event bus: stream read failed");
                    return PumpExit::Ended {
                        reason: err.message,
                        connected: true,
                    };
                }
                None => {
                    tracing::debug!(epoch = epoch, frames = frames, "event bus: stream ended");
                    return PumpExit::Ended {
                        reason: "server closed the event stream".to_string(),
                        connected: true,
                    };
                }
            }
        }
    }
}

async fn run(shared: Arc<BusShared>) {
    let mut decoder = SseDecoder::new();
    let mut failures: u32 = 0;

    loop {
        shared.set_state(BusState::Connecting);
        let (reason, connected) = match shared.connect_and_pump(&mut decoder).await {
            PumpExit::Shutdown => break,
            PumpExit::Ended { reason, connected } => (reason, connected),
        };

        shared.set_state(BusState::Disconnected);
        if connected {
            failures = 0;
            shared.broadcast(StreamEvent::Disconnected {
                reason: reason.clone(),
            });
        }
        failures += 1;

        let config = &shared.config;
        if !config.reconnect || failures > config.max_reconnect_attempts {
            tracing::warn!(
                path = %config.path,
                attempts = failures,
                reason = %reason,
                "event bus: giving up on event stream"
            );
            shared.close(Some(StreamEvent::Error {
                session_id: None,
                message: format!("event stream closed: {reason}"),
            }));
            return;
        }

        let delay = backoff_delay(config.reconnect_delay, config.max_reconnect_delay, failures - 1);
        tracing::info!(
            path = %config.path,
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "event bus: reconnecting"
        );
        tokio::select! {
            biased;
            _ = shared.shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    shared.close(None);
    tracing::debug!(path = %shared.config.path, "event bus: stream loop stopped");
}

/// One subscriber's view of the event stream. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    filter: SessionFilter,
    receiver: broadcast::Receiver<StreamEvent>,
    lossy: Arc<AtomicBool>,
    bus: Weak<BusShared>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("filter", &self.filter)
            .field("lossy", &self.is_lossy())
            .finish()
    }
}

impl Subscription {
    /// Next event, or `None` once the bus has closed and its queue is
    /// drained.
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        match self.receiver.recv().await {
            Ok(event) => Some(event),
            Err(RecvError::Lagged(dropped)) => Some(self.lagged(dropped)),
            Err(RecvError::Closed) => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<StreamEvent> {
        match self.receiver.try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Lagged(dropped)) => Some(self.lagged(dropped)),
            Err(TryRecvError::Empty | TryRecvError::Closed) => None,
        }
    }

    /// Whether any event was dropped because this subscriber fell behind.
    pub fn is_lossy(&self) -> bool {
        self.lossy.load(Ordering::SeqCst)
    }

    pub fn filter(&self) -> &SessionFilter {
        &self.filter
    }

    fn lagged(&self, dropped: u64) -> StreamEvent {
        self.lossy.store(true, Ordering::SeqCst);
        StreamEvent::Lagged { dropped }
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamEvent> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|event| (event, subscription))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(shared) = self.bus.upgrade() {
            lock(&shared.table).subscribers.remove(&self.id);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn truncate(raw: &str, limit: usize) -> String {
    match raw.char_indices().nth(limit) {
        Some((end, _)) => format!("{}...", &raw[..end]),
        None => raw.to_string(),
    }
}
