//! # pulse-ws
//!
//! Topic-based subscriptions multiplexed over one shared WebSocket for the
//! Pulse Radar push channel.
//!
//! ## Features
//!
//! - **One socket** for every subscription, reconfigured with the union of
//!   subscribed topics
//! - **Debounced** topic changes so a burst of subscribes reconnects once
//! - **Auto-reconnection** with capped exponential backoff and a bounded
//!   number of attempts
//! - **Liveness monitoring** of server heartbeats (pong replies included)
//! - **Replay cursors** so a reconnect asks the server for missed messages
//! - **Metrics** for observability
//!
//! ## Example
//!
//! ```ignore
//! use pulse_ws::{Endpoint, InboundMessage, TopicManager, TopicManagerConfig};
//!
//! let config = TopicManagerConfig::builder()
//!     .endpoint(Endpoint::from_env("https://radar.example.com")?)
//!     .build()?;
//!
//! let manager = TopicManager::new(config);
//! let id = manager.subscribe(["metrics", "analysis"], |msg: &InboundMessage| {
//!     println!("{:?}: {:?}", msg.topic, msg.data);
//! });
//! ```

mod config;
mod connection;
mod cursor;
mod endpoint;
mod error;
mod handler;
mod health;
mod manager;
mod metrics;
mod protocol;
mod registry;
mod topics;

pub use config::{
    BackoffConfig, ConfigError, ConnectionConfig, HealthConfig, TopicManagerConfig,
    TopicManagerConfigBuilder, DEFAULT_SETTLE_DELAY, DEFAULT_TOPIC_DEBOUNCE,
};
pub use connection::{
    SocketCommand, SocketEvent, SocketEventKind, SocketHandle, Transport, TungsteniteTransport,
};
pub use cursor::ReplayCursors;
pub use endpoint::{Endpoint, DEFAULT_WS_PATH, HOST_ENV, PATH_ENV};
pub use error::{Error, ErrorKind};
pub use handler::{
    ConnectionNotifier, ConnectionState, ConnectionStatus, LogNotifier, MessageHandler,
};
pub use health::LivenessMonitor;
pub use manager::TopicManager;
pub use metrics::{Metrics, MetricsSnapshot};
pub use protocol::{
    parse_frame, pong_frame, Frame, InboundMessage, ABNORMAL_CLOSURE, NORMAL_CLOSURE,
    PING_TIMEOUT_CLOSURE, PING_TIMEOUT_REASON,
};
pub use registry::{SubscriptionId, SubscriptionRegistry};
pub use topics::{topic_signature, TopicAggregator, TopicChange};

// Re-export the frame type used by custom transports
pub use tokio_tungstenite::tungstenite::Message;

/// Result type for pulse-ws operations
pub type Result<T> = std::result::Result<T, Error>;
