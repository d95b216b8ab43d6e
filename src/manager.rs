use crate::config::TopicManagerConfig;
use crate::connection::{SocketEvent, SocketEventKind, SocketHandle, Transport, TungsteniteTransport};
use crate::cursor::ReplayCursors;
use crate::error::Error;
use crate::handler::{
    ChannelHandler, ConnectionNotifier, ConnectionState, ConnectionStatus, LogNotifier,
    MessageHandler,
};
use crate::health::LivenessMonitor;
use crate::metrics::Metrics;
use crate::protocol::{
    parse_frame, pong_frame, Frame, InboundMessage, NORMAL_CLOSURE, PING_TIMEOUT_CLOSURE,
    PING_TIMEOUT_REASON,
};
use crate::registry::{SubscriptionId, SubscriptionRegistry};
use crate::topics::{topic_signature, TopicAggregator, TopicChange};
use crate::Result;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, trace, warn};

/// Stand-in deadline for disabled timers
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365);

/// Requests from the public handle to the manager task
#[derive(Debug)]
enum Command {
    /// A subscription was added or removed
    TopicsChanged,
    /// Serialized outbound payload
    Send(String),
    /// Manual retry after giving up
    Reconnect,
    /// Close the socket and stop the task
    Shutdown,
}

/// Owns the one shared socket and every subscription routed over it.
///
/// Cheap to clone; all clones share the same connection. Construct one at
/// application start and hand clones to whatever needs real-time data.
///
/// `subscribe`, `unsubscribe` and `send` never block and never fail because
/// of the network: connection changes are applied asynchronously by a
/// background task, and problems show up as [`ConnectionStatus`] changes.
///
/// The task stops when the last clone is dropped. A handler that captures a
/// clone keeps the manager alive through the registry, so call
/// [`TopicManager::shutdown`] to stop it in that case.
///
/// # Example
/// ```ignore
/// let manager = TopicManager::new(TopicManagerConfig::default());
/// let id = manager.subscribe(["metrics"], |msg: &InboundMessage| {
///     println!("{:?}", msg.data);
/// });
/// // ...
/// manager.unsubscribe(&id);
/// ```
#[derive(Clone)]
pub struct TopicManager {
    inner: Arc<Inner>,
}

struct Inner {
    registry: Arc<RwLock<SubscriptionRegistry>>,
    cursors: Arc<RwLock<ReplayCursors>>,
    metrics: Arc<Metrics>,
    status: watch::Receiver<ConnectionStatus>,
    commands: mpsc::UnboundedSender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Last handle gone: stop the task so no timer or socket outlives us
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

impl TopicManager {
    /// Create a manager that connects with `tokio-tungstenite` and reports
    /// recovery and give-up through the log.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(config: TopicManagerConfig) -> Self {
        let transport = TungsteniteTransport::new(config.connection.clone());
        Self::with_transport(config, transport, Arc::new(LogNotifier))
    }

    /// Create a manager with a custom transport and notification sink.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_transport<T: Transport>(
        config: TopicManagerConfig,
        transport: T,
        notifier: Arc<dyn ConnectionNotifier>,
    ) -> Self {
        let registry = Arc::new(RwLock::new(SubscriptionRegistry::new()));
        let cursors = Arc::new(RwLock::new(ReplayCursors::new()));
        let metrics = Arc::new(Metrics::new());
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let task = ManagerTask {
            liveness: LivenessMonitor::new(config.health.clone()),
            config,
            transport,
            notifier,
            registry: registry.clone(),
            cursors: cursors.clone(),
            metrics: metrics.clone(),
            status: status_tx,
            commands: command_rx,
            events_tx,
            events_rx,
            aggregator: TopicAggregator::new(),
            socket: None,
            next_generation: 0,
            attempts: 0,
            connection_id: None,
            state: ConnectionState::Disconnected,
            debounce_deadline: None,
            settle_deadline: None,
            reconnect_deadline: None,
        };
        let handle = tokio::spawn(task.run());

        Self {
            inner: Arc::new(Inner {
                registry,
                cursors,
                metrics,
                status: status_rx,
                commands: command_tx,
                task: Mutex::new(Some(handle)),
            }),
        }
    }

    /// Register `handler` for `topics`.
    ///
    /// The shared connection is reconfigured once the current burst of
    /// subscribe/unsubscribe calls has settled.
    pub fn subscribe<I, S, H>(&self, topics: I, handler: H) -> SubscriptionId
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        H: MessageHandler,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        let topic_count = topics.len();
        let id = self.inner.registry.write().add(topics, Arc::new(handler));
        debug!("Added subscription {} ({} topics)", id, topic_count);
        self.topics_changed();
        id
    }

    /// Register for `topics` and receive their messages on a channel.
    ///
    /// Dropping the receiver does not unsubscribe.
    pub fn subscribe_channel<I, S>(
        &self,
        topics: I,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<InboundMessage>)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(topics, ChannelHandler::new(tx));
        (id, rx)
    }

    /// Remove a subscription. Unknown ids are ignored.
    ///
    /// Returns whether a subscription was removed.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let removed = self.inner.registry.write().remove(id);
        if removed {
            debug!("Removed subscription {}", id);
            self.topics_changed();
        } else {
            trace!("Unsubscribe of unknown subscription {}", id);
        }
        removed
    }

    /// Serialize `payload` and send it over the shared socket.
    ///
    /// Only sent while connected; otherwise the payload is dropped with a
    /// warning. Returns whether it was handed to the socket.
    pub fn send<P: Serialize + ?Sized>(&self, payload: &P) -> bool {
        if !self.is_connected() {
            warn!("Not connected, dropping outbound message");
            self.inner.metrics.record_send_dropped();
            return false;
        }

        let text = match encode(payload) {
            Ok(text) => text,
            Err(e) => {
                warn!("Dropping outbound message: {}", e);
                return false;
            }
        };

        self.inner.commands.send(Command::Send(text)).is_ok()
    }

    /// Retry connecting after reconnection gave up.
    ///
    /// Resets the attempt counter; does nothing while a socket exists or no
    /// topics are subscribed.
    pub fn reconnect(&self) -> Result<()> {
        self.inner
            .commands
            .send(Command::Reconnect)
            .map_err(|_| Error::ShuttingDown)
    }

    /// Close the socket, cancel all timers and stop the background task.
    ///
    /// Subscriptions stay registered but nothing is delivered any more.
    pub async fn shutdown(&self) {
        let _ = self.inner.commands.send(Command::Shutdown);

        let task = self.inner.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                if e.is_panic() {
                    error!("Topic manager task panicked: {}", e);
                }
            }
        }
    }

    /// Current connection status
    pub fn status(&self) -> ConnectionStatus {
        self.inner.status.borrow().clone()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.status.borrow().state
    }

    /// Whether the shared socket is open
    pub fn is_connected(&self) -> bool {
        self.inner.status.borrow().is_connected()
    }

    /// Server-assigned id of the current connection
    pub fn connection_id(&self) -> Option<String> {
        self.inner.status.borrow().connection_id.clone()
    }

    /// Subscribe to status changes
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.clone()
    }

    /// Union of all subscribed topics
    pub fn active_topics(&self) -> BTreeSet<String> {
        self.inner.registry.read().active_topics()
    }

    /// Number of live subscriptions
    pub fn subscription_count(&self) -> usize {
        self.inner.registry.read().len()
    }

    /// Last sequence number seen for `topic`
    pub fn last_sequence(&self, topic: &str) -> Option<u64> {
        self.inner.cursors.read().get(topic)
    }

    /// Get the metrics for this manager
    pub fn metrics(&self) -> Arc<Metrics> {
        self.inner.metrics.clone()
    }

    fn topics_changed(&self) {
        // Task gone means we are shutting down; nothing to reconfigure
        let _ = self.inner.commands.send(Command::TopicsChanged);
    }
}

fn encode<P: Serialize + ?Sized>(payload: &P) -> Result<String> {
    Ok(serde_json::to_string(payload)?)
}

/// The physical socket currently owned by the manager
struct ActiveSocket {
    handle: SocketHandle,
    open: bool,
}

/// Background task owning all connection state.
struct ManagerTask<T: Transport> {
    config: TopicManagerConfig,
    transport: T,
    notifier: Arc<dyn ConnectionNotifier>,
    registry: Arc<RwLock<SubscriptionRegistry>>,
    cursors: Arc<RwLock<ReplayCursors>>,
    metrics: Arc<Metrics>,
    status: watch::Sender<ConnectionStatus>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<SocketEvent>,
    events_rx: mpsc::UnboundedReceiver<SocketEvent>,
    aggregator: TopicAggregator,
    liveness: LivenessMonitor,
    socket: Option<ActiveSocket>,
    next_generation: u64,
    attempts: u32,
    connection_id: Option<String>,
    state: ConnectionState,
    debounce_deadline: Option<Instant>,
    settle_deadline: Option<Instant>,
    reconnect_deadline: Option<Instant>,
}

impl<T: Transport> ManagerTask<T> {
    async fn run(mut self) {
        debug!("Topic manager started");

        loop {
            let far = Instant::now() + FAR_FUTURE;
            let debounce = self.debounce_deadline;
            let settle = self.settle_deadline;
            let reconnect = self.reconnect_deadline;
            let liveness = self.liveness.deadline();

            tokio::select! {
                biased;

                cmd = self.commands.recv() => match cmd {
                    Some(Command::Shutdown) | None => {
                        self.force_disconnect();
                        break;
                    }
                    Some(cmd) => self.handle_command(cmd),
                },

                Some(event) = self.events_rx.recv() => self.handle_socket_event(event),

                _ = sleep_until(debounce.unwrap_or(far)), if debounce.is_some() => {
                    self.debounce_deadline = None;
                    self.apply_topics();
                }

                _ = sleep_until(settle.unwrap_or(far)), if settle.is_some() => {
                    self.settle_deadline = None;
                    self.open();
                }

                _ = sleep_until(reconnect.unwrap_or(far)), if reconnect.is_some() => {
                    self.reconnect_deadline = None;
                    debug!("Reconnect attempt {} starting", self.attempts);
                    self.open();
                }

                _ = sleep_until(liveness.unwrap_or(far)), if liveness.is_some() => {
                    self.on_liveness_expired();
                }
            }
        }

        debug!("Topic manager stopped");
    }

    fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::TopicsChanged => {
                self.debounce_deadline = Some(Instant::now() + self.config.topic_debounce);
            }
            Command::Send(text) => self.transmit(text),
            Command::Reconnect => {
                if let Some(socket) = &self.socket {
                    debug!(
                        "[WS-{}] Manual reconnect ignored, socket exists",
                        socket.handle.generation()
                    );
                    return;
                }
                info!("Manual reconnect requested");
                self.attempts = 0;
                self.reconnect_deadline = None;
                self.open();
            }
            // Handled by the run loop
            Command::Shutdown => {}
        }
    }

    fn transmit(&mut self, text: String) {
        match &self.socket {
            Some(socket) if socket.open => {
                if socket.handle.send(Message::Text(text)) {
                    self.metrics.record_message_sent();
                } else {
                    warn!("[WS-{}] Socket gone, dropping outbound message", socket.handle.generation());
                    self.metrics.record_send_dropped();
                }
            }
            _ => {
                warn!("Not connected, dropping outbound message");
                self.metrics.record_send_dropped();
            }
        }
    }

    /// Debounced recomputation of the active topic set
    fn apply_topics(&mut self) {
        let topics = self.registry.read().active_topics();

        match self.aggregator.apply(topics) {
            TopicChange::Unchanged => trace!("Active topics unchanged"),
            TopicChange::Cleared => {
                info!("No active topics, disconnecting");
                self.force_disconnect();
            }
            TopicChange::Changed(topics) => {
                debug!("Active topics changed to [{}]", topic_signature(&topics));

                if let Some(socket) = self.socket.take() {
                    info!(
                        "[WS-{}] Topics changed, reconnecting",
                        socket.handle.generation()
                    );
                    socket.handle.close(NORMAL_CLOSURE, "Topics changed");
                    self.liveness.disarm();
                    self.connection_id = None;
                    self.settle_deadline = Some(Instant::now() + self.config.settle_delay);
                    self.set_state(ConnectionState::Connecting);
                } else if self.reconnect_deadline.is_none() {
                    self.open();
                } else {
                    debug!("Reconnect pending, it will pick up the new topics");
                }
            }
        }
    }

    /// Open a socket for the current topics, unless one already exists
    fn open(&mut self) {
        if let Some(socket) = &self.socket {
            debug!(
                "[WS-{}] Socket already {}, not opening another",
                socket.handle.generation(),
                if socket.open { "open" } else { "connecting" }
            );
            return;
        }

        let topics = self.registry.read().active_topics();
        if topics.is_empty() {
            debug!("No active topics, not connecting");
            self.settle_deadline = None;
            self.reconnect_deadline = None;
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let url = self
            .config
            .endpoint
            .connection_url(&topics, &self.cursors.read());
        let url = match url {
            Ok(url) => url,
            Err(e) => {
                error!("Cannot build connection URL: {}", e);
                self.set_state(ConnectionState::Disconnected);
                return;
            }
        };

        // The socket carries these topics now; a pending debounce must not redo it
        self.aggregator.apply(topics);
        self.settle_deadline = None;
        self.reconnect_deadline = None;

        self.next_generation += 1;
        let generation = self.next_generation;
        info!("[WS-{}] Connecting to {}", generation, url);

        let handle = self
            .transport
            .open(url, generation, self.events_tx.clone());
        self.socket = Some(ActiveSocket {
            handle,
            open: false,
        });
        self.set_state(ConnectionState::Connecting);
    }

    /// Close the socket cleanly and cancel every timer
    fn force_disconnect(&mut self) {
        self.debounce_deadline = None;
        self.settle_deadline = None;
        self.reconnect_deadline = None;
        self.liveness.disarm();

        if let Some(socket) = self.socket.take() {
            info!("[WS-{}] Disconnecting", socket.handle.generation());
            socket.handle.close(NORMAL_CLOSURE, "Normal closure");
        }

        self.attempts = 0;
        self.connection_id = None;
        self.set_state(ConnectionState::Disconnected);
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        let current = self.socket.as_ref().map(|s| s.handle.generation());
        if current != Some(event.generation) {
            trace!("[WS-{}] Ignoring event from retired socket", event.generation);
            return;
        }

        match event.kind {
            SocketEventKind::Opened => self.on_open(event.generation),
            SocketEventKind::Text(text) => self.on_text(&text),
            SocketEventKind::Closed { code, reason } => {
                self.on_close(event.generation, code, &reason)
            }
        }
    }

    fn on_open(&mut self, generation: u64) {
        if let Some(socket) = self.socket.as_mut() {
            socket.open = true;
        }

        let recovered = self.attempts > 0;
        if recovered {
            info!("[WS-{}] Reconnected after {} attempts", generation, self.attempts);
        } else {
            info!("[WS-{}] Connected", generation);
        }

        self.attempts = 0;
        self.liveness.arm();
        self.metrics.record_connection();
        self.set_state(ConnectionState::Connected);

        if recovered {
            let notifier = self.notifier.clone();
            self.guarded("connection_restored notifier", || notifier.connection_restored());
        }
    }

    fn on_text(&mut self, text: &str) {
        let frame = match parse_frame(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame: {}", e);
                self.metrics.record_parse_failure();
                return;
            }
        };

        match frame {
            Frame::Ping { ts } => {
                trace!("Heartbeat received");
                self.metrics.record_ping();
                self.liveness.record_heartbeat();
                self.transmit(pong_frame(ts.as_ref()));
            }
            Frame::Connection { connection_id } => {
                debug!("Connection acknowledged: {:?}", connection_id);
                self.connection_id = connection_id;
                self.publish();
            }
            Frame::Data(message) => self.dispatch(message),
        }
    }

    fn dispatch(&mut self, message: InboundMessage) {
        if let (Some(topic), Some(seq)) = (message.topic.as_deref(), message.seq) {
            if !self.cursors.write().observe(topic, seq) {
                trace!("Sequence {} for {} is not newer, cursor kept", seq, topic);
            }
        }

        self.metrics.record_message_received();

        // Snapshot so handlers may subscribe/unsubscribe without deadlocking
        let recipients = self.registry.read().recipients(message.topic.as_deref());
        for (id, handler) in recipients {
            let label = format!("subscription {}", id);
            self.guarded(&label, || handler.on_message(&message));
        }
    }

    fn on_close(&mut self, generation: u64, code: u16, reason: &str) {
        info!(
            "[WS-{}] Closed (code {}, reason {:?})",
            generation, code, reason
        );

        self.socket = None;
        self.liveness.disarm();
        self.connection_id = None;
        self.settle_deadline = None;
        self.reconnect_deadline = None;

        if self.registry.read().active_topics().is_empty() {
            self.attempts = 0;
            self.set_state(ConnectionState::Disconnected);
            return;
        }

        let backoff = &self.config.backoff;
        if backoff.allows_retry(self.attempts) {
            self.attempts += 1;
            let delay = backoff.delay_for_attempt(self.attempts);
            info!(
                "Reconnecting in {:?} (attempt {}/{})",
                delay, self.attempts, backoff.max_attempts
            );
            self.reconnect_deadline = Some(Instant::now() + delay);
            self.metrics.record_reconnection();
            self.set_state(ConnectionState::Reconnecting);
        } else {
            let attempts = self.attempts;
            error!("Giving up after {} reconnect attempts", attempts);
            self.metrics.record_give_up();
            self.set_state(ConnectionState::Disconnected);

            let notifier = self.notifier.clone();
            self.guarded("reconnect_failed notifier", || notifier.reconnect_failed(attempts));
        }
    }

    fn on_liveness_expired(&mut self) {
        self.liveness.disarm();

        let Some(socket) = &self.socket else {
            return;
        };
        let generation = socket.handle.generation();
        warn!(
            "[WS-{}] No heartbeat within {:?}, closing",
            generation, self.config.health.ping_timeout
        );
        self.metrics.record_ping_timeout();

        // The close event that follows drives reconnection
        if !socket.handle.close(PING_TIMEOUT_CLOSURE, PING_TIMEOUT_REASON) {
            self.on_close(generation, PING_TIMEOUT_CLOSURE, PING_TIMEOUT_REASON);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("Connection state {:?} -> {:?}", self.state, state);
            self.state = state;
        }
        self.publish();
    }

    fn publish(&self) {
        let next = ConnectionStatus {
            state: self.state,
            connection_id: self.connection_id.clone(),
            reconnect_attempt: self.attempts,
        };
        self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }

    /// Run user code, logging and counting a panic instead of unwinding
    fn guarded(&self, label: &str, f: impl FnOnce()) {
        if let Err(panic) = catch_unwind(AssertUnwindSafe(f)) {
            error!("{} panicked: {}", label, panic_message(&*panic));
            self.metrics.record_handler_panic();
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "Unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::mock::{MockSocket, MockTransport};
    use crate::endpoint::Endpoint;
    use crate::protocol::ABNORMAL_CLOSURE;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::sleep;

    #[derive(Default)]
    struct RecordingNotifier {
        restored: AtomicU32,
        failed: Mutex<Vec<u32>>,
    }

    impl ConnectionNotifier for RecordingNotifier {
        fn connection_restored(&self) {
            self.restored.fetch_add(1, Ordering::SeqCst);
        }

        fn reconnect_failed(&self, attempts: u32) {
            self.failed.lock().push(attempts);
        }
    }

    struct Harness {
        manager: TopicManager,
        sockets: mpsc::UnboundedReceiver<MockSocket>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Harness {
        fn new() -> Self {
            let config = TopicManagerConfig::builder()
                .endpoint(Endpoint::new("https://radar.example.com").unwrap())
                .build()
                .unwrap();
            let (transport, sockets) = MockTransport::new();
            let notifier = Arc::new(RecordingNotifier::default());
            let manager = TopicManager::with_transport(config, transport, notifier.clone());
            Self {
                manager,
                sockets,
                notifier,
            }
        }

        fn next_socket(&mut self) -> MockSocket {
            self.sockets.try_recv().expect("a socket should have been opened")
        }

        fn assert_no_socket(&mut self) {
            assert!(self.sockets.try_recv().is_err(), "no socket expected");
        }

        /// Subscribe, let the debounce fire and complete the handshake
        async fn connected(&mut self, topics: &[&str]) -> (SubscriptionId, MockSocket) {
            let id = self.manager.subscribe(topics.iter().copied(), |_: &InboundMessage| {});
            sleep(ms(60)).await;
            let socket = self.next_socket();
            socket.accept();
            sleep(ms(1)).await;
            assert_eq!(self.manager.state(), ConnectionState::Connected);
            (id, socket)
        }
    }

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn noop(_: &InboundMessage) {}

    #[tokio::test(start_paused = true)]
    async fn test_subscriptions_in_same_tick_open_one_connection() {
        let mut h = Harness::new();

        h.manager.subscribe(["metrics"], noop);
        h.manager.subscribe(["analysis", "proposals"], noop);
        sleep(ms(60)).await;

        let socket = h.next_socket();
        assert_eq!(
            socket.url.as_str(),
            "wss://radar.example.com/ws?topics=analysis,metrics,proposals"
        );
        h.assert_no_socket();
        assert_eq!(h.manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_coalesced_to_final_topics() {
        let mut h = Harness::new();

        let first = h.manager.subscribe(["metrics"], noop);
        sleep(ms(10)).await;
        h.manager.subscribe(["analysis"], noop);
        sleep(ms(10)).await;
        h.manager.unsubscribe(&first);
        sleep(ms(10)).await;
        h.assert_no_socket();

        sleep(ms(60)).await;
        let socket = h.next_socket();
        assert_eq!(socket.url.query(), Some("topics=analysis"));
        h.assert_no_socket();
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_is_noop_while_socket_exists() {
        let mut h = Harness::new();

        h.manager.subscribe(["metrics"], noop);
        sleep(ms(60)).await;
        let socket = h.next_socket();

        // Still connecting
        let before = h.manager.status();
        h.manager.reconnect().unwrap();
        sleep(ms(10)).await;
        h.assert_no_socket();
        assert_eq!(h.manager.status(), before);

        socket.accept();
        sleep(ms(1)).await;
        let before = h.manager.status();
        h.manager.reconnect().unwrap();
        sleep(ms(10)).await;
        h.assert_no_socket();
        assert!(h.manager.is_connected());
        assert_eq!(h.manager.status(), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribing_last_closes_normally() {
        let mut h = Harness::new();
        let (id, mut socket) = h.connected(&["metrics"]).await;

        assert!(h.manager.unsubscribe(&id));
        sleep(ms(60)).await;

        assert_eq!(
            socket.close_requested(),
            Some((NORMAL_CLOSURE, "Normal closure".to_string()))
        );
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);

        // The retired socket reporting its close changes nothing
        socket.close(NORMAL_CLOSURE, "Normal closure");
        sleep(ms(60_000)).await;
        h.assert_no_socket();
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unexpected_close_reconnects_with_same_topics() {
        let mut h = Harness::new();
        let (_id, socket) = h.connected(&["analysis", "metrics"]).await;

        socket.close(ABNORMAL_CLOSURE, "");
        sleep(ms(1)).await;
        let status = h.manager.status();
        assert_eq!(status.state, ConnectionState::Reconnecting);
        assert_eq!(status.reconnect_attempt, 1);

        sleep(ms(998)).await;
        h.assert_no_socket();

        sleep(ms(2)).await;
        let retry = h.next_socket();
        assert_eq!(retry.url, socket.url);
        assert_eq!(h.manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_normal_close_still_reconnects() {
        let mut h = Harness::new();
        let (_id, socket) = h.connected(&["metrics"]).await;

        socket.close(NORMAL_CLOSURE, "server restart");
        sleep(ms(1)).await;
        assert_eq!(h.manager.state(), ConnectionState::Reconnecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sequence_then_gives_up() {
        let mut h = Harness::new();
        h.manager.subscribe(["metrics"], noop);
        sleep(ms(60)).await;
        let mut socket = h.next_socket();

        for (attempt, delay) in [1000u64, 2000, 4000, 8000, 16000].into_iter().enumerate() {
            socket.close(ABNORMAL_CLOSURE, "Connection refused");
            sleep(ms(delay - 1)).await;
            h.assert_no_socket();
            let status = h.manager.status();
            assert_eq!(status.state, ConnectionState::Reconnecting);
            assert_eq!(status.reconnect_attempt, attempt as u32 + 1);

            sleep(ms(2)).await;
            socket = h.next_socket();
        }

        socket.close(ABNORMAL_CLOSURE, "Connection refused");
        sleep(ms(120_000)).await;
        h.assert_no_socket();
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert_eq!(*h.notifier.failed.lock(), vec![5]);
        assert_eq!(h.manager.metrics().reconnect_give_ups(), 1);

        // Only a manual retry starts over
        h.manager.reconnect().unwrap();
        sleep(ms(1)).await;
        let _ = h.next_socket();
        assert_eq!(h.manager.status().reconnect_attempt, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_is_notified() {
        let mut h = Harness::new();
        let (_id, socket) = h.connected(&["metrics"]).await;
        assert_eq!(h.notifier.restored.load(Ordering::SeqCst), 0);

        socket.close(ABNORMAL_CLOSURE, "");
        sleep(ms(1001)).await;
        let retry = h.next_socket();
        retry.accept();
        sleep(ms(1)).await;

        assert!(h.manager.is_connected());
        assert_eq!(h.manager.status().reconnect_attempt, 0);
        assert_eq!(h.notifier.restored.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_timeout_closes_socket() {
        let mut h = Harness::new();
        let (_id, mut socket) = h.connected(&["metrics"]).await;

        sleep(Duration::from_secs(45) - ms(2)).await;
        assert_eq!(socket.close_requested(), None);

        sleep(ms(2)).await;
        assert_eq!(
            socket.close_requested(),
            Some((PING_TIMEOUT_CLOSURE, PING_TIMEOUT_REASON.to_string()))
        );
        assert_eq!(h.manager.metrics().ping_timeouts(), 1);

        // Transport reports the close; reconnection follows the normal path
        socket.close(PING_TIMEOUT_CLOSURE, PING_TIMEOUT_REASON);
        sleep(ms(1)).await;
        assert_eq!(h.manager.state(), ConnectionState::Reconnecting);
        sleep(ms(1000)).await;
        let _ = h.next_socket();
    }

    #[tokio::test(start_paused = true)]
    async fn test_ping_is_answered_and_rearms_liveness() {
        let mut h = Harness::new();
        let (_id, mut socket) = h.connected(&["metrics"]).await;

        sleep(Duration::from_secs(30)).await;
        socket.push(r#"{"type":"ping","ts":12345}"#);
        sleep(ms(1)).await;
        assert_eq!(socket.sent_texts(), vec![r#"{"type":"pong","ts":12345}"#.to_string()]);

        // 45s after the first open, but only 15s after the heartbeat
        sleep(Duration::from_secs(20)).await;
        assert_eq!(socket.close_requested(), None);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(
            socket.close_requested().map(|(code, _)| code),
            Some(PING_TIMEOUT_CLOSURE)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_by_topic() {
        let mut h = Harness::new();
        let (_metrics_id, mut metrics_rx) = h.manager.subscribe_channel(["metrics"]);
        let (_analysis_id, mut analysis_rx) = h.manager.subscribe_channel(["analysis"]);
        sleep(ms(60)).await;
        let socket = h.next_socket();
        socket.accept();

        socket.push(r#"{"type":"update","topic":"metrics","data":{"cpu":0.5}}"#);
        socket.push(r#"{"type":"broadcast","data":"hello"}"#);
        socket.push(r#"{"type":"ping","ts":1}"#);
        socket.push(r#"{"type":"connection","data":{"connectionId":"c-1"}}"#);
        sleep(ms(1)).await;

        let first = metrics_rx.try_recv().unwrap();
        assert_eq!(first.topic.as_deref(), Some("metrics"));
        assert_eq!(first.data, Some(json!({"cpu": 0.5})));
        assert_eq!(metrics_rx.try_recv().unwrap().kind.as_deref(), Some("broadcast"));
        assert!(metrics_rx.try_recv().is_err());

        assert_eq!(analysis_rx.try_recv().unwrap().kind.as_deref(), Some("broadcast"));
        assert!(analysis_rx.try_recv().is_err());

        assert_eq!(h.manager.connection_id().as_deref(), Some("c-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_handler_is_isolated() {
        let mut h = Harness::new();
        h.manager.subscribe(["metrics"], |_: &InboundMessage| panic!("boom"));
        let (_id, mut rx) = h.manager.subscribe_channel(["metrics"]);
        sleep(ms(60)).await;
        let socket = h.next_socket();
        socket.accept();

        socket.push(r#"{"topic":"metrics","seq":1}"#);
        socket.push(r#"{"topic":"metrics","seq":2}"#);
        sleep(ms(1)).await;

        assert_eq!(rx.try_recv().unwrap().seq, Some(1));
        assert_eq!(rx.try_recv().unwrap().seq, Some(2));
        assert_eq!(h.manager.metrics().handler_panics(), 2);
        assert!(h.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_frame_is_dropped() {
        let mut h = Harness::new();
        let (_id, mut rx) = h.manager.subscribe_channel(["metrics"]);
        sleep(ms(60)).await;
        let socket = h.next_socket();
        socket.accept();

        socket.push("{not json");
        socket.push(r#"{"topic":"metrics"}"#);
        sleep(ms(1)).await;

        assert_eq!(rx.try_recv().unwrap().topic.as_deref(), Some("metrics"));
        assert_eq!(h.manager.metrics().parse_failures(), 1);
        assert!(h.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_replay_cursor_sent_on_reconnect() {
        let mut h = Harness::new();
        let (_id, socket) = h.connected(&["analysis"]).await;

        socket.push(r#"{"topic":"analysis","seq":3}"#);
        socket.push(r#"{"topic":"analysis","seq":7}"#);
        socket.push(r#"{"topic":"analysis","seq":5}"#);
        sleep(ms(1)).await;
        assert_eq!(h.manager.last_sequence("analysis"), Some(7));

        socket.close(ABNORMAL_CLOSURE, "");
        sleep(ms(1001)).await;
        let retry = h.next_socket();
        assert_eq!(retry.url.query(), Some("topics=analysis&lastSeq=analysis:7"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_float_seq_is_delivered_and_tracked() {
        let mut h = Harness::new();
        let (_id, mut rx) = h.manager.subscribe_channel(["analysis"]);
        sleep(ms(60)).await;
        let socket = h.next_socket();
        socket.accept();

        socket.push(r#"{"topic":"analysis","seq":7.0,"data":{"id":1}}"#);
        socket.push(r#"{"topic":"analysis","seq":-3,"data":{"id":2}}"#);
        sleep(ms(1)).await;

        assert_eq!(rx.try_recv().unwrap().seq, Some(7));
        assert_eq!(rx.try_recv().unwrap().data, Some(json!({"id": 2})));
        assert_eq!(h.manager.last_sequence("analysis"), Some(7));
        assert_eq!(h.manager.metrics().parse_failures(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_topic_change_replaces_socket() {
        let mut h = Harness::new();
        let (_id, mut socket) = h.connected(&["metrics"]).await;

        h.manager.subscribe(["analysis"], noop);
        sleep(ms(51)).await;
        assert_eq!(
            socket.close_requested().map(|(code, _)| code),
            Some(NORMAL_CLOSURE)
        );
        h.assert_no_socket();

        // Late close of the replaced socket is not a failure
        socket.close(NORMAL_CLOSURE, "");
        sleep(ms(50)).await;

        let replacement = h.next_socket();
        assert_eq!(replacement.url.query(), Some("topics=analysis,metrics"));
        assert_eq!(h.manager.state(), ConnectionState::Connecting);
        assert_eq!(h.manager.metrics().reconnections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unchanged_topics_keep_socket() {
        let mut h = Harness::new();
        let (_id, mut socket) = h.connected(&["metrics"]).await;

        let extra = h.manager.subscribe(["metrics"], noop);
        sleep(ms(60)).await;
        h.manager.unsubscribe(&extra);
        sleep(ms(60)).await;

        assert_eq!(socket.close_requested(), None);
        h.assert_no_socket();
        assert!(h.manager.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_only_while_connected() {
        let mut h = Harness::new();
        assert!(!h.manager.send(&json!({"type": "ack"})));
        assert_eq!(h.manager.metrics().sends_dropped(), 1);

        let (_id, mut socket) = h.connected(&["metrics"]).await;
        assert!(h.manager.send(&json!({"type": "ack"})));
        sleep(ms(1)).await;

        assert_eq!(socket.sent_texts(), vec![r#"{"type":"ack"}"#.to_string()]);
        assert_eq!(h.manager.metrics().messages_sent(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_status_sees_transitions() {
        let mut h = Harness::new();
        let mut status = h.manager.watch_status();
        assert_eq!(status.borrow_and_update().state, ConnectionState::Disconnected);

        let (_id, _socket) = h.connected(&["metrics"]).await;
        assert!(status.has_changed().unwrap());
        assert_eq!(status.borrow_and_update().state, ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_and_stops() {
        let mut h = Harness::new();
        let (_id, mut socket) = h.connected(&["metrics"]).await;

        h.manager.shutdown().await;

        assert_eq!(
            socket.close_requested(),
            Some((NORMAL_CLOSURE, "Normal closure".to_string()))
        );
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
        assert!(matches!(h.manager.reconnect(), Err(Error::ShuttingDown)));

        h.manager.subscribe(["analysis"], noop);
        sleep(ms(60_000)).await;
        h.assert_no_socket();
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_may_unsubscribe_itself() {
        let mut h = Harness::new();
        let manager = h.manager.clone();
        let own_id: Arc<Mutex<Option<SubscriptionId>>> = Arc::default();
        let slot = own_id.clone();
        let id = h.manager.subscribe(["metrics"], move |_: &InboundMessage| {
            if let Some(id) = slot.lock().take() {
                manager.unsubscribe(&id);
            }
        });
        *own_id.lock() = Some(id);
        h.manager.subscribe(["analysis"], noop);
        sleep(ms(60)).await;
        let socket = h.next_socket();
        socket.accept();

        socket.push(r#"{"topic":"metrics"}"#);
        sleep(ms(1)).await;
        assert_eq!(h.manager.subscription_count(), 1);
        assert_eq!(
            h.manager.active_topics(),
            BTreeSet::from(["analysis".to_string()])
        );

        // The handler's clone keeps the task alive; shutdown still stops it
        h.manager.shutdown().await;
        assert!(matches!(h.manager.reconnect(), Err(Error::ShuttingDown)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_while_retry_in_flight_keeps_attempts() {
        let mut h = Harness::new();
        h.manager.subscribe(["metrics"], noop);
        sleep(ms(60)).await;
        let socket = h.next_socket();

        socket.close(ABNORMAL_CLOSURE, "");
        sleep(ms(1001)).await;
        let retry = h.next_socket();
        assert_eq!(h.manager.status().reconnect_attempt, 1);

        h.manager.reconnect().unwrap();
        sleep(ms(1)).await;
        h.assert_no_socket();
        let status = h.manager.status();
        assert_eq!(status.state, ConnectionState::Connecting);
        assert_eq!(status.reconnect_attempt, 1);

        // The retry failing counts against the same budget
        retry.close(ABNORMAL_CLOSURE, "");
        sleep(ms(1)).await;
        assert_eq!(h.manager.status().reconnect_attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_while_retry_in_flight_keeps_restored_notice() {
        let mut h = Harness::new();
        h.manager.subscribe(["metrics"], noop);
        sleep(ms(60)).await;
        let socket = h.next_socket();

        socket.close(ABNORMAL_CLOSURE, "");
        sleep(ms(1001)).await;
        let retry = h.next_socket();

        h.manager.reconnect().unwrap();
        sleep(ms(1)).await;
        retry.accept();
        sleep(ms(1)).await;

        assert!(h.manager.is_connected());
        assert_eq!(h.notifier.restored.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_topic_change_while_connecting_replaces_socket() {
        let mut h = Harness::new();
        h.manager.subscribe(["metrics"], noop);
        sleep(ms(60)).await;
        let mut socket = h.next_socket();
        assert_eq!(h.manager.state(), ConnectionState::Connecting);

        h.manager.subscribe(["analysis"], noop);
        sleep(ms(51)).await;
        assert_eq!(
            socket.close_requested(),
            Some((NORMAL_CLOSURE, "Topics changed".to_string()))
        );
        h.assert_no_socket();
        assert_eq!(h.manager.state(), ConnectionState::Connecting);

        sleep(ms(50)).await;
        let replacement = h.next_socket();
        assert_eq!(replacement.url.query(), Some("topics=analysis,metrics"));

        // A late handshake on the retired socket is ignored
        socket.accept();
        sleep(ms(1)).await;
        assert_eq!(h.manager.state(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn test_topic_change_during_backoff_waits_for_retry() {
        let mut h = Harness::new();
        let (_id, socket) = h.connected(&["metrics"]).await;

        socket.close(ABNORMAL_CLOSURE, "");
        h.manager.subscribe(["analysis"], noop);
        sleep(ms(60)).await;
        h.assert_no_socket();
        assert_eq!(h.manager.state(), ConnectionState::Reconnecting);

        sleep(ms(939)).await;
        h.assert_no_socket();

        sleep(ms(2)).await;
        let retry = h.next_socket();
        assert_eq!(retry.url.query(), Some("topics=analysis,metrics"));
        h.assert_no_socket();
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribing_last_during_backoff_cancels_retry() {
        let mut h = Harness::new();
        let (id, socket) = h.connected(&["metrics"]).await;

        socket.close(ABNORMAL_CLOSURE, "");
        sleep(ms(1)).await;
        assert_eq!(h.manager.state(), ConnectionState::Reconnecting);

        h.manager.unsubscribe(&id);
        sleep(ms(60)).await;
        let status = h.manager.status();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.reconnect_attempt, 0);

        sleep(ms(60_000)).await;
        h.assert_no_socket();
        assert_eq!(h.manager.state(), ConnectionState::Disconnected);
    }
}
