use crate::config::ConnectionConfig;
use crate::error::Error;
use crate::protocol::{ABNORMAL_CLOSURE, NORMAL_CLOSURE};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use tokio::net::TcpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{
    client_async_tls_with_config, tungstenite::client::IntoClientRequest, tungstenite::Message,
    Connector, MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Close code reported when the peer closed without a status
const NO_STATUS_RECEIVED: u16 = 1005;

/// Event reported by a physical socket to the manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketEvent {
    /// Generation of the socket that produced the event
    pub generation: u64,
    /// What happened
    pub kind: SocketEventKind,
}

/// Socket lifecycle and data events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEventKind {
    /// Handshake completed
    Opened,
    /// Text frame received (binary frames holding UTF-8 are reported as text)
    Text(String),
    /// Socket closed or failed to open. Always the last event of a socket.
    Closed { code: u16, reason: String },
}

/// Commands that can be sent to a socket
#[derive(Debug)]
pub enum SocketCommand {
    /// Send a message
    Send(Message),
    /// Close with the given code and reason; a `Closed` event follows
    Close { code: u16, reason: String },
}

/// Handle to one physical socket.
///
/// Dropping the handle closes the socket with a normal closure and no
/// further events are expected.
#[derive(Debug)]
pub struct SocketHandle {
    generation: u64,
    commands: mpsc::UnboundedSender<SocketCommand>,
    _task: Option<JoinHandle<()>>,
}

impl SocketHandle {
    /// Wrap a command channel (and the task serving it, if any)
    pub fn new(
        generation: u64,
        commands: mpsc::UnboundedSender<SocketCommand>,
        task: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            generation,
            commands,
            _task: task,
        }
    }

    /// Generation this socket was opened with
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Queue a message. Returns `false` if the socket is already gone.
    pub fn send(&self, message: Message) -> bool {
        self.commands.send(SocketCommand::Send(message)).is_ok()
    }

    /// Ask the socket to close. Returns `false` if the socket is already gone.
    pub fn close(&self, code: u16, reason: impl Into<String>) -> bool {
        self.commands
            .send(SocketCommand::Close {
                code,
                reason: reason.into(),
            })
            .is_ok()
    }
}

/// Opens physical sockets for the manager.
///
/// `open` must return immediately; the outcome of the connect attempt is
/// reported through `events` (`Opened`, or `Closed` on failure), tagged with
/// `generation`.
pub trait Transport: Send + Sync + 'static {
    /// Start connecting to `url`.
    fn open(
        &self,
        url: Url,
        generation: u64,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> SocketHandle;
}

/// [`Transport`] backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteTransport {
    config: ConnectionConfig,
}

impl TungsteniteTransport {
    /// Create a transport with the given connection settings
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }
}

impl Transport for TungsteniteTransport {
    fn open(
        &self,
        url: Url,
        generation: u64,
        events: mpsc::UnboundedSender<SocketEvent>,
    ) -> SocketHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let task = SocketTask {
            generation,
            url,
            config: self.config.clone(),
            events,
            commands: command_rx,
        };
        let handle = tokio::spawn(task.run());
        SocketHandle::new(generation, command_tx, Some(handle))
    }
}

/// Type alias for WebSocket stream
type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Drives one physical socket until it closes
struct SocketTask {
    generation: u64,
    url: Url,
    config: ConnectionConfig,
    events: mpsc::UnboundedSender<SocketEvent>,
    commands: mpsc::UnboundedReceiver<SocketCommand>,
}

impl SocketTask {
    fn emit(&self, kind: SocketEventKind) {
        // Manager gone means nobody is interested any more
        let _ = self.events.send(SocketEvent {
            generation: self.generation,
            kind,
        });
    }

    fn emit_closed(&self, code: u16, reason: impl Into<String>) {
        self.emit(SocketEventKind::Closed {
            code,
            reason: reason.into(),
        });
    }

    async fn run(mut self) {
        debug!("[WS-{}] Connecting to {}", self.generation, self.url);

        let connect = timeout(self.config.connect_timeout, connect_with_options(&self.url));
        tokio::pin!(connect);

        let ws_stream = loop {
            tokio::select! {
                result = &mut connect => match result {
                    Ok(Ok(stream)) => break stream,
                    Ok(Err(e)) => {
                        warn!(
                            "[WS-{}] Connection failed ({:?}): {}",
                            self.generation,
                            e.kind(),
                            e
                        );
                        self.emit_closed(ABNORMAL_CLOSURE, e.to_string());
                        return;
                    }
                    Err(_) => {
                        warn!(
                            "[WS-{}] Connection timeout after {:?}",
                            self.generation, self.config.connect_timeout
                        );
                        self.emit_closed(ABNORMAL_CLOSURE, "Connection timeout");
                        return;
                    }
                },
                cmd = self.commands.recv() => match cmd {
                    Some(SocketCommand::Close { code, reason }) => {
                        debug!("[WS-{}] Closed before handshake completed", self.generation);
                        self.emit_closed(code, reason);
                        return;
                    }
                    Some(SocketCommand::Send(_)) => {
                        warn!("[WS-{}] Dropping message sent before open", self.generation);
                    }
                    None => {
                        debug!("[WS-{}] Abandoned while connecting", self.generation);
                        return;
                    }
                },
            }
        };

        info!("[WS-{}] Connected to {}", self.generation, self.url);
        self.emit(SocketEventKind::Opened);

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        trace!("[WS-{}] Received {} bytes", self.generation, text.len());
                        self.emit(SocketEventKind::Text(text));
                    }
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => self.emit(SocketEventKind::Text(text)),
                        Err(_) => debug!("[WS-{}] Dropping non UTF-8 binary frame", self.generation),
                    },
                    Some(Ok(Message::Ping(data))) => {
                        trace!("[WS-{}] Received protocol ping, sending pong", self.generation);
                        if let Err(e) = write.send(Message::Pong(data)).await {
                            warn!("[WS-{}] Failed to send pong: {}", self.generation, e);
                            self.emit_closed(ABNORMAL_CLOSURE, e.to_string());
                            return;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (u16::from(f.code), f.reason.into_owned()))
                            .unwrap_or((NO_STATUS_RECEIVED, String::new()));
                        info!(
                            "[WS-{}] Received close frame (code {}, reason {:?})",
                            self.generation, code, reason
                        );
                        self.emit_closed(code, reason);
                        return;
                    }
                    Some(Err(e)) => {
                        warn!("[WS-{}] WebSocket error: {}", self.generation, e);
                        self.emit_closed(ABNORMAL_CLOSURE, e.to_string());
                        return;
                    }
                    None => {
                        info!("[WS-{}] WebSocket stream ended", self.generation);
                        self.emit_closed(ABNORMAL_CLOSURE, "WebSocket stream ended");
                        return;
                    }
                },

                cmd = self.commands.recv() => match cmd {
                    Some(SocketCommand::Send(message)) => {
                        if let Err(e) = write.send(message).await {
                            warn!("[WS-{}] Failed to send message: {}", self.generation, e);
                            self.emit_closed(ABNORMAL_CLOSURE, e.to_string());
                            return;
                        }
                    }
                    Some(SocketCommand::Close { code, reason }) => {
                        info!("[WS-{}] Closing (code {}, reason {:?})", self.generation, code, reason);
                        self.close_gracefully(&mut write, code, &reason).await;
                        self.emit_closed(code, reason);
                        return;
                    }
                    None => {
                        debug!("[WS-{}] Handle dropped, closing", self.generation);
                        self.close_gracefully(&mut write, NORMAL_CLOSURE, "Normal closure").await;
                        return;
                    }
                },
            }
        }
    }

    async fn close_gracefully(
        &self,
        write: &mut SplitSink<WsStream, Message>,
        code: u16,
        reason: &str,
    ) {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: Cow::Owned(reason.to_string()),
        };
        match timeout(self.config.close_timeout, write.send(Message::Close(Some(frame)))).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("[WS-{}] Close frame not sent: {}", self.generation, e),
            Err(_) => debug!("[WS-{}] Close frame timed out", self.generation),
        }
    }
}

/// Connect to a WebSocket URL (ws:// or wss://) directly.
async fn connect_with_options(url: &Url) -> Result<WsStream, Error> {
    let host = url
        .host_str()
        .ok_or_else(|| Error::ConnectionFailed("No host in URL".to_string()))?;

    let is_tls = url.scheme() == "wss";
    let port = url.port().unwrap_or(if is_tls { 443 } else { 80 });

    let request = url
        .as_str()
        .into_client_request()
        .map_err(|e| Error::ConnectionFailed(format!("Invalid WebSocket request: {}", e)))?;

    let tcp_stream = connect_direct(host, port).await?;

    // Set TCP options for low latency
    set_tcp_options(&tcp_stream);

    let connector = if is_tls {
        let tls = native_tls::TlsConnector::new()
            .map_err(|e| Error::ConnectionFailed(format!("TLS error: {}", e)))?;
        Some(Connector::NativeTls(tls))
    } else {
        None
    };

    let (ws_stream, _response) = client_async_tls_with_config(request, tcp_stream, None, connector)
        .await
        .map_err(Error::WebSocket)?;

    Ok(ws_stream)
}

/// Resolve and connect a TCP stream
async fn connect_direct(host: &str, port: u16) -> Result<tokio::net::TcpStream, Error> {
    // IPv6 literals come out of the URL bracketed
    let host = host.trim_start_matches('[').trim_end_matches(']');

    let dest_addr: SocketAddr = tokio::net::lookup_host((host, port))
        .await
        .map_err(|e| Error::ConnectionFailed(format!("DNS lookup failed: {}", e)))?
        .next()
        .ok_or_else(|| Error::ConnectionFailed(format!("No addresses found for {}", host)))?;

    let socket = if dest_addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(|e| Error::ConnectionFailed(format!("Failed to create socket: {}", e)))?;

    socket.connect(dest_addr).await.map_err(|e| {
        Error::ConnectionFailed(format!("TCP connect to {} failed: {}", dest_addr, e))
    })
}

/// Set TCP options for low latency
fn set_tcp_options(stream: &tokio::net::TcpStream) {
    let sock2 = socket2::SockRef::from(stream);

    // Enable TCP_NODELAY (disable Nagle's algorithm)
    let _ = sock2.set_nodelay(true);

    // Keepalive catches dead peers underneath the heartbeat watchdog
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(30))
        .with_interval(Duration::from_secs(10));
    let _ = sock2.set_tcp_keepalive(&keepalive);
}

/// In-memory transport for exercising the manager without a network.
#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    /// Records every socket the manager opens
    pub(crate) struct MockTransport {
        opened: mpsc::UnboundedSender<MockSocket>,
    }

    impl MockTransport {
        pub(crate) fn new() -> (Self, mpsc::UnboundedReceiver<MockSocket>) {
            let (opened, rx) = mpsc::unbounded_channel();
            (Self { opened }, rx)
        }
    }

    impl Transport for MockTransport {
        fn open(
            &self,
            url: Url,
            generation: u64,
            events: mpsc::UnboundedSender<SocketEvent>,
        ) -> SocketHandle {
            let (command_tx, command_rx) = mpsc::unbounded_channel();
            let _ = self.opened.send(MockSocket {
                url,
                generation,
                events,
                commands: command_rx,
            });
            SocketHandle::new(generation, command_tx, None)
        }
    }

    /// Server side of a mock socket
    pub(crate) struct MockSocket {
        pub(crate) url: Url,
        pub(crate) generation: u64,
        events: mpsc::UnboundedSender<SocketEvent>,
        commands: mpsc::UnboundedReceiver<SocketCommand>,
    }

    impl MockSocket {
        fn emit(&self, kind: SocketEventKind) {
            let _ = self.events.send(SocketEvent {
                generation: self.generation,
                kind,
            });
        }

        /// Complete the handshake
        pub(crate) fn accept(&self) {
            self.emit(SocketEventKind::Opened);
        }

        /// Push a text frame to the client
        pub(crate) fn push(&self, text: &str) {
            self.emit(SocketEventKind::Text(text.to_string()));
        }

        /// Report the socket closed (server drop, failed connect, or completed close)
        pub(crate) fn close(&self, code: u16, reason: &str) {
            self.emit(SocketEventKind::Closed {
                code,
                reason: reason.to_string(),
            });
        }

        /// Next command the client issued, if one is queued
        pub(crate) fn try_command(&mut self) -> Option<SocketCommand> {
            self.commands.try_recv().ok()
        }

        /// Text payloads the client has sent so far
        pub(crate) fn sent_texts(&mut self) -> Vec<String> {
            let mut texts = Vec::new();
            while let Some(cmd) = self.try_command() {
                if let SocketCommand::Send(Message::Text(text)) = cmd {
                    texts.push(text);
                }
            }
            texts
        }

        /// Whether the client asked to close with `code`, draining other commands
        pub(crate) fn close_requested(&mut self) -> Option<(u16, String)> {
            while let Some(cmd) = self.try_command() {
                if let SocketCommand::Close { code, reason } = cmd {
                    return Some((code, reason));
                }
            }
            None
        }
    }
}
