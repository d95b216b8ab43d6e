use crate::protocol::InboundMessage;
use tokio::sync::mpsc;
use tracing::{error, info};

/// Observable connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket, and none scheduled (initial and terminal state)
    #[default]
    Disconnected,
    /// A socket is being opened
    Connecting,
    /// The socket is open
    Connected,
    /// The socket dropped; a backoff retry is scheduled
    Reconnecting,
}

/// Snapshot published on every state change
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionStatus {
    /// Current state
    pub state: ConnectionState,
    /// Server-assigned id of the current connection, once acknowledged
    pub connection_id: Option<String>,
    /// Reconnection attempts since the last successful open
    pub reconnect_attempt: u32,
}

impl ConnectionStatus {
    /// Whether the socket is currently open
    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }
}

/// Receives messages for one subscription.
///
/// Called on the manager task, so implementations should hand heavy work off
/// elsewhere. A panic is caught and logged; it does not affect other
/// subscriptions or the connection.
///
/// Any `Fn(&InboundMessage) + Send + Sync` closure is a handler.
///
/// A handler holding a `TopicManager` clone keeps that manager running until
/// `shutdown()` is called, even after every other clone is dropped.
pub trait MessageHandler: Send + Sync + 'static {
    /// Called for every message routed to this subscription.
    fn on_message(&self, message: &InboundMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(&InboundMessage) + Send + Sync + 'static,
{
    fn on_message(&self, message: &InboundMessage) {
        self(message)
    }
}

/// Forwards messages into an unbounded channel (see `TopicManager::subscribe_channel`).
pub(crate) struct ChannelHandler {
    tx: mpsc::UnboundedSender<InboundMessage>,
}

impl ChannelHandler {
    pub(crate) fn new(tx: mpsc::UnboundedSender<InboundMessage>) -> Self {
        Self { tx }
    }
}

impl MessageHandler for ChannelHandler {
    fn on_message(&self, message: &InboundMessage) {
        // Receiver dropped means the consumer lost interest; unsubscribe is theirs to call.
        let _ = self.tx.send(message.clone());
    }
}

/// User-facing notifications about connection recovery and failure.
///
/// This is the toast/banner sink of a UI. Both methods have defaults so an
/// implementation only overrides what it displays.
pub trait ConnectionNotifier: Send + Sync + 'static {
    /// The connection came back after at least one failed attempt.
    fn connection_restored(&self) {}

    /// Reconnection gave up after `attempts` attempts; only a manual
    /// `reconnect()` will try again.
    fn reconnect_failed(&self, _attempts: u32) {}
}

/// Default notifier that writes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl ConnectionNotifier for LogNotifier {
    fn connection_restored(&self) {
        info!("Real-time connection restored");
    }

    fn reconnect_failed(&self, attempts: u32) {
        error!(
            "Could not reconnect to real-time updates after {} attempts; reconnect manually",
            attempts
        );
    }
}
