//! Wire format of the Pulse Radar push channel.
//!
//! Inbound frames are JSON objects `{ type?, topic?, seq?, data?, ts? }`.
//! `ping` and `connection` frames are control traffic handled by the manager;
//! everything else is delivered to subscribers.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};

/// Close code for intentional teardown
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code reported locally when the transport fails without a close frame
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close code used when the liveness monitor declares the socket dead
pub const PING_TIMEOUT_CLOSURE: u16 = 4000;

/// Close reason paired with [`PING_TIMEOUT_CLOSURE`]
pub const PING_TIMEOUT_REASON: &str = "Ping timeout";

/// A message pushed by the server.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Frame type (`ping`, `connection`, or an application type)
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Topic the message belongs to; absent means "for everyone"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    /// Per-topic sequence number used for replay. Values that are not a
    /// non-negative integer are read as absent.
    #[serde(
        default,
        deserialize_with = "lenient_seq",
        skip_serializing_if = "Option::is_none"
    )]
    pub seq: Option<u64>,
    /// Payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Server timestamp
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<Value>,
}

fn lenient_seq<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(sequence_number))
}

/// `7`, `7.0` and `"7"` are sequence 7; anything else is no sequence.
fn sequence_number(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| {
            n.as_f64()
                .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64)
                .map(|f| f as u64)
        }),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Inbound frame after classification
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Server heartbeat; must be answered with a pong echoing `ts`
    Ping { ts: Option<Value> },
    /// Handshake acknowledgement carrying the server-assigned connection id
    Connection { connection_id: Option<String> },
    /// Anything else, destined for subscribers
    Data(InboundMessage),
}

/// Parse and classify a text frame.
pub fn parse_frame(text: &str) -> Result<Frame, serde_json::Error> {
    let message: InboundMessage = serde_json::from_str(text)?;

    Ok(match message.kind.as_deref() {
        Some("ping") => Frame::Ping { ts: message.ts },
        Some("connection") => Frame::Connection {
            connection_id: message
                .data
                .as_ref()
                .and_then(|d| d.get("connectionId"))
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        _ => Frame::Data(message),
    })
}

/// Heartbeat reply: `{"type":"pong","ts":<echo>}`, `ts` omitted when the ping had none.
pub fn pong_frame(ts: Option<&Value>) -> String {
    match ts {
        Some(ts) => json!({ "type": "pong", "ts": ts }).to_string(),
        None => json!({ "type": "pong" }).to_string(),
    }
}
