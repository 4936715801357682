//! Ferry - a long-lived Discord Gateway session bridge.
#![deny(unsafe_code)]
//!
//! Ferry keeps a session with the Discord Gateway alive indefinitely and
//! bridges it to a local host process over two pipe descriptors: every
//! dispatched event (opcode 0) is written to the outbound pipe as one
//! JSON line, and the inbound pipe accepts `{"op": N, "d": ...}` control
//! envelopes to forward, plus the pseudo-ops `-1` (reconnect) and `-2`
//! (shutdown).
//!
//! The bridge handles the whole session lifecycle on its own:
//!
//! - identify with token, intents and shard tuple, or resume an existing
//!   session with the last-seen sequence number
//! - heartbeat at the server-dictated cadence, with a liveness watchdog
//!   that tears down zombie connections
//! - close-code classification into reconnectable and terminal codes
//! - reconnection with exponential backoff and jitter
//!
//! # Example
//!
//! ```ignore
//! use ferry_gateway::{Bridge, BridgeConfig, HostReader, HostWriter, Intents};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BridgeConfig::new("your-token", Intents::NON_PRIVILEGED);
//!     let bridge = Bridge::new(config);
//!
//!     let host_in = HostReader::from_fd(3)?;
//!     let host_out = HostWriter::from_fd(4)?;
//!     bridge.run(host_in, host_out).await?;
//!
//!     Ok(())
//! }
//! ```

mod backoff;
mod bridge;
pub mod error;
mod framer;
mod heartbeat;
mod host;
mod intents;
mod opcode;
mod payload;
mod session;

pub use bridge::{Bridge, BridgeConfig, ConnectionState};
pub use error::GatewayError;
pub use host::{HostReader, HostWriter, HOST_OP_RECONNECT, HOST_OP_SHUTDOWN};
pub use intents::Intents;
pub use opcode::OpCode;
pub use payload::{
    ConnectionProperties, GatewayPayload, HelloPayload, IdentifyPayload, ReadyEventData,
    ResumePayload,
};
pub use session::{Disposition, ResumeState, Session};

use std::os::fd::RawFd;

use tracing::error;

/// Gateway API version spoken by this crate.
pub const GATEWAY_VERSION: u8 = 10;

/// Discovery URL, used when no resume URL is known.
pub const DEFAULT_GATEWAY_URL: &str = "wss://gateway.discord.gg";

/// User agent presented during the WebSocket handshake.
pub const USER_AGENT: &str = "DiscordBot (https://github.com/reshsix/makima, 0.0)";

/// Entry point for hosts that hand over raw pipe descriptors.
///
/// Builds a runtime, adopts the two descriptors (duplicating them and
/// switching the duplicates to non-blocking mode) and runs the bridge to
/// completion. Returns a process exit code: 0 iff the final disposition
/// is OK.
pub fn gateway(
    token: impl Into<String>,
    intents: u64,
    shard_index: u32,
    shard_count: u32,
    in_fd: RawFd,
    out_fd: RawFd,
) -> i32 {
    let config = BridgeConfig::new(token, Intents::from_bits_truncate(intents))
        .with_shard(shard_index, shard_count);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            error!(error = %e, "Failed to start runtime");
            return 1;
        }
    };

    let disposition = runtime.block_on(async {
        let host_in = match HostReader::from_fd(in_fd) {
            Ok(reader) => reader,
            Err(e) => {
                error!(fd = in_fd, error = %e, "Failed to adopt host inbound pipe");
                return Disposition::Fatal;
            }
        };
        let host_out = match HostWriter::from_fd(out_fd) {
            Ok(writer) => writer,
            Err(e) => {
                error!(fd = out_fd, error = %e, "Failed to adopt host outbound pipe");
                return Disposition::Fatal;
            }
        };

        let bridge = Bridge::new(config);
        match bridge.run(host_in, host_out).await {
            Ok(()) => Disposition::Ok,
            Err(_) => {
                // The supervisor has already logged and classified.
                let mut disposition = bridge.disposition();
                disposition.raise(Disposition::Error);
                disposition
            }
        }
    });

    match disposition {
        Disposition::Ok => 0,
        Disposition::Error | Disposition::Fatal => 1,
    }
}
