//! Gateway opcodes.
//!
//! Opcodes identify the kind of payload carried by a frame on the
//! Gateway WebSocket.

use serde_repr::{Deserialize_repr, Serialize_repr};

/// Gateway operation codes.
///
/// See: <https://discord.com/developers/docs/topics/opcodes-and-status-codes#gateway-gateway-opcodes>
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum OpCode {
    /// An event was dispatched.
    /// Direction: Receive
    Dispatch = 0,

    /// Keepalive, acknowledged with [`OpCode::HeartbeatAck`].
    /// Direction: Send/Receive
    Heartbeat = 1,

    /// Start a new session.
    /// Direction: Send
    Identify = 2,

    /// Reattach to a previous session.
    /// Direction: Send
    Resume = 6,

    /// The server requested a reconnect.
    /// Direction: Receive
    Reconnect = 7,

    /// The session has been invalidated.
    /// Direction: Receive
    InvalidSession = 9,

    /// Sent right after connecting, carries the heartbeat interval.
    /// Direction: Receive
    Hello = 10,

    /// Acknowledgment of a heartbeat.
    /// Direction: Receive
    HeartbeatAck = 11,
}

impl OpCode {
    /// Map a raw opcode byte to a known opcode.
    ///
    /// Unknown opcodes return `None` and are ignored by the dispatcher;
    /// the gateway is free to introduce new ones.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OpCode::Dispatch),
            1 => Some(OpCode::Heartbeat),
            2 => Some(OpCode::Identify),
            6 => Some(OpCode::Resume),
            7 => Some(OpCode::Reconnect),
            9 => Some(OpCode::InvalidSession),
            10 => Some(OpCode::Hello),
            11 => Some(OpCode::HeartbeatAck),
            _ => None,
        }
    }

    /// Returns whether this opcode is only ever received.
    pub const fn is_receive_only(self) -> bool {
        matches!(
            self,
            OpCode::Dispatch
                | OpCode::Reconnect
                | OpCode::InvalidSession
                | OpCode::Hello
                | OpCode::HeartbeatAck
        )
    }
}
