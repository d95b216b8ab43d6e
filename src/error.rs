use thiserror::Error;

/// Categorizes errors for logging.
///
/// Lightweight, cloneable mirror of [`Error`] for places that only need to
/// branch on the error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// WebSocket protocol error
    WebSocket,
    /// Connection failed (timeout, refused, DNS, TLS)
    ConnectionFailed,
    /// Payload could not be serialized
    Serialization,
    /// Manager is shutting down
    ShuttingDown,
}

/// Errors that can occur below the public API.
///
/// None of these surface from `subscribe`, `unsubscribe` or `send`: the
/// manager turns them into state transitions or log lines.
#[derive(Error, Debug)]
pub enum Error {
    /// WebSocket connection error
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Establishing the connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Outbound payload could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Manager is shutting down
    #[error("Manager is shutting down")]
    ShuttingDown,
}

impl Error {
    /// Get the kind of this error for decision-making.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::WebSocket(_) => ErrorKind::WebSocket,
            Error::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            Error::Serialization(_) => ErrorKind::Serialization,
            Error::ShuttingDown => ErrorKind::ShuttingDown,
        }
    }
}
