//! Gateway error types using thiserror.
//!
//! Every failure mode of the bridge is a [`GatewayError`] variant. The
//! supervisor decides per variant whether to reconnect or terminate, so
//! the taxonomy here mirrors the recovery policy rather than the source
//! of the failure.

use thiserror::Error;

/// Errors that can occur while running a gateway session.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// WebSocket connection or protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Failed to decode a JSON payload.
    #[error("JSON decode error: {0}")]
    JsonDecode(String),

    /// The session was invalidated by the gateway (opcode 9).
    /// The boolean indicates whether the session can still be resumed.
    #[error("session invalidated, resumable: {resumable}")]
    InvalidSession {
        /// Whether the session id survives the reconnect.
        resumable: bool,
    },

    /// The connection was closed by the gateway.
    #[error("connection closed: code={code}, reason={reason}")]
    Closed {
        /// WebSocket close code (0 when the peer sent no close frame).
        code: u16,
        /// Close reason.
        reason: String,
    },

    /// No heartbeat acknowledgment arrived within the liveness window.
    #[error("heartbeat acknowledgment timeout")]
    HeartbeatTimeout,

    /// The hello payload carried no usable heartbeat interval.
    #[error("couldn't determine heartbeat interval")]
    MissingHeartbeatInterval,

    /// A reconnect was requested (opcode 7, or a host control envelope).
    #[error("reconnect requested")]
    ReconnectRequested,

    /// Too many consecutive failed connection attempts.
    #[error("gave up after {attempts} reconnect attempts")]
    ReconnectExhausted {
        /// Number of attempts made.
        attempts: u32,
    },

    /// Reading or writing a host pipe failed.
    #[error("host pipe error: {0}")]
    Pipe(#[from] std::io::Error),

    /// The internal command channel closed while the connection was live.
    #[error("command channel closed")]
    ChannelClosed,

    /// Gateway URL could not be parsed.
    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Invalid bridge configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::JsonDecode(err.to_string())
    }
}

/// Whether a WebSocket close code permits another connection attempt.
///
/// Everything outside this set (notably 4004 authentication failed, 4010
/// invalid shard, 4011 sharding required, 4012 invalid API version, 4013
/// invalid intents and 4014 disallowed intents) is terminal.
pub const fn reconnect_ok(code: u16) -> bool {
    matches!(
        code,
        1000 | 1007
            | 1008
            | 1009
            | 1011
            | 1012
            | 1013
            | 1014
            | 4000
            | 4001
            | 4002
            | 4003
            | 4005
            | 4007
            | 4008
            | 4009
    )
}
