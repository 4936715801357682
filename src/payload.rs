//! Wire payload structures.
//!
//! Inbound frames are parsed in two stages: [`RawGatewayPayload`] pulls
//! out the envelope fields (`op`, `s`, `t`) while leaving `d` as a raw
//! JSON slice, and the dispatcher decodes `d` only for the opcodes that
//! need it. Dispatch payloads are never re-encoded; the original document
//! is handed to the host verbatim.

use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::intents::Intents;
use crate::opcode::OpCode;

/// An inbound frame with the data field left unparsed.
#[derive(Debug, Deserialize)]
pub struct RawGatewayPayload<'a> {
    /// Opcode for the payload.
    pub op: u8,

    /// Sequence number; zero and null both mean "none".
    pub s: Option<i64>,

    /// Event data, decoded lazily per opcode.
    #[serde(borrow)]
    pub d: Option<&'a RawValue>,

    /// Event name, present on dispatch frames.
    #[serde(borrow)]
    pub t: Option<Cow<'a, str>>,
}

/// An outbound envelope: `{"op": <int>, "d": <any>}`.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayPayload<D> {
    /// Opcode for the payload.
    pub op: OpCode,

    /// Payload data.
    pub d: D,
}

impl<D: Serialize> GatewayPayload<D> {
    /// Create a new outbound payload.
    pub fn new(op: OpCode, data: D) -> Self {
        Self { op, d: data }
    }
}

/// Payload of the hello frame (op 10), received right after connecting.
#[derive(Debug, Clone, Deserialize)]
pub struct HelloPayload {
    /// Interval (in milliseconds) at which to send heartbeats.
    pub heartbeat_interval: u64,
}

/// Payload of the identify frame (op 2), sent to start a fresh session.
#[derive(Debug, Clone, Serialize)]
pub struct IdentifyPayload<'a> {
    /// Authentication token.
    pub token: Cow<'a, str>,

    /// Capability flags for event delivery.
    pub intents: Intents,

    /// Shard tuple: `[index, count]`.
    pub shards: [u32; 2],

    /// Connection properties.
    pub properties: ConnectionProperties<'a>,
}

/// Identity descriptors sent with identify.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionProperties<'a> {
    /// Operating system.
    pub os: Cow<'a, str>,

    /// Client name.
    pub browser: Cow<'a, str>,

    /// Device name.
    pub device: Cow<'a, str>,
}

impl Default for ConnectionProperties<'_> {
    fn default() -> Self {
        Self {
            os: Cow::Borrowed(std::env::consts::OS),
            browser: Cow::Borrowed("ferry"),
            device: Cow::Borrowed("ferry"),
        }
    }
}

/// Payload of the resume frame (op 6), sent to reattach to a session.
#[derive(Debug, Clone, Serialize)]
pub struct ResumePayload<'a> {
    /// Authentication token.
    pub token: Cow<'a, str>,

    /// Session id from the previous READY event.
    pub session_id: Cow<'a, str>,

    /// Last sequence number received.
    pub seq: i64,
}

/// The slice of the READY dispatch event the bridge cares about.
///
/// The full event is forwarded to the host untouched; only the resume
/// coordinates and the account identity are extracted here.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyEventData {
    /// Session id for resuming.
    pub session_id: String,

    /// URL to reconnect to when resuming.
    pub resume_gateway_url: String,

    /// Current account, used only for log tagging.
    #[serde(default)]
    pub user: Option<ReadyUser>,
}

/// Account identity carried by READY.
#[derive(Debug, Clone, Deserialize)]
pub struct ReadyUser {
    pub username: String,
    pub discriminator: String,
}

impl ReadyUser {
    /// Display tag in `username#discriminator` form.
    pub fn tag(&self) -> String {
        format!("{}#{}", self.username, self.discriminator)
    }
}

/// Encode a heartbeat frame (op 1).
///
/// The payload is the last-seen sequence number, or null when no
/// sequenced frame has arrived yet.
pub fn create_heartbeat_payload(sequence: Option<i64>) -> String {
    match sequence {
        Some(seq) => format!(r#"{{"op":1,"d":{seq}}}"#),
        None => r#"{"op":1,"d":null}"#.to_string(),
    }
}
