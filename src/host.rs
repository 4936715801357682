//! Host pipe bridge.
//!
//! The host process hands the bridge two pipe descriptors: an inbound
//! pipe carrying control envelopes `{"op": N, "d": ...}` and an outbound
//! pipe that receives every dispatched event as one JSON line. Real op
//! numbers are forwarded to the gateway as-is; negative ops are
//! pseudo-ops interpreted locally.
//!
//! The descriptors stay owned by the host: the bridge duplicates them,
//! switches the duplicates to non-blocking mode for the reactor, and
//! never closes the originals.
#![allow(unsafe_code)]

use std::io;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::io::AsyncWriteExt;
use tokio::net::unix::pipe;
use tracing::warn;

/// Host pseudo-op: force a reconnect.
pub const HOST_OP_RECONNECT: i32 = -1;

/// Host pseudo-op: shut the bridge down cleanly.
pub const HOST_OP_SHUTDOWN: i32 = -2;

/// Drain granularity for the inbound pipe.
const READ_CHUNK: usize = 256;

/// One control envelope read from the host inbound pipe.
#[derive(Debug, Deserialize)]
pub struct HostEnvelope {
    /// Gateway opcode, or a negative pseudo-op.
    pub op: i32,

    /// Payload forwarded untouched.
    #[serde(default)]
    pub d: Option<Box<RawValue>>,
}

/// Outbound event frame built from a host envelope.
///
/// `d` is serialized as `null` when the host omitted it, matching what
/// the gateway expects for payload-less sends.
#[derive(Serialize)]
struct OutboundEvent<'a> {
    op: i32,
    d: Option<&'a RawValue>,
}

/// What the event loop should do with a host envelope.
#[derive(Debug)]
pub enum HostAction {
    /// Send this pre-encoded frame to the gateway.
    Forward(String),

    /// Tear the connection down and reconnect.
    Reconnect,

    /// Stop the bridge; the exit disposition stays OK.
    Shutdown,
}

/// Duplicate a host descriptor without taking over the original.
fn dup_host_fd(fd: RawFd) -> io::Result<OwnedFd> {
    // SAFETY: the entry contract guarantees `fd` is an open pipe end that
    // outlives the bridge; it is borrowed only long enough to duplicate.
    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
    borrowed.try_clone_to_owned()
}

/// Non-blocking reader for the host inbound pipe.
///
/// Envelopes may arrive concatenated back to back or split across
/// writes; every complete envelope in the buffer is consumed in order
/// and an incomplete tail waits for the next readable event.
#[derive(Debug)]
pub struct HostReader {
    rx: pipe::Receiver,
    buf: Vec<u8>,
}

impl HostReader {
    /// Adopt the host's read descriptor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_fd(fd: RawFd) -> io::Result<Self> {
        Ok(Self::new(pipe::Receiver::from_owned_fd(dup_host_fd(fd)?)?))
    }

    /// Wrap an already-open pipe receiver.
    pub fn new(rx: pipe::Receiver) -> Self {
        Self {
            rx,
            buf: Vec::with_capacity(512),
        }
    }

    /// Wait until the pipe has data (or has been closed).
    pub async fn readable(&self) -> io::Result<()> {
        self.rx.readable().await
    }

    /// Drain everything currently readable and interpret it.
    ///
    /// EOF means the host is gone and is reported as a final
    /// [`HostAction::Shutdown`].
    pub fn drain(&mut self) -> io::Result<Vec<HostAction>> {
        let mut saw_eof = false;
        loop {
            let mut chunk = [0u8; READ_CHUNK];
            match self.rx.try_read(&mut chunk) {
                Ok(0) => {
                    saw_eof = true;
                    break;
                }
                Ok(n) => self.buf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
        }

        let mut actions = parse_envelopes(&mut self.buf);
        if saw_eof {
            actions.push(HostAction::Shutdown);
        }
        Ok(actions)
    }
}

/// Writer for the host outbound pipe.
#[derive(Debug)]
pub struct HostWriter {
    tx: pipe::Sender,
}

impl HostWriter {
    /// Adopt the host's write descriptor.
    ///
    /// Must be called from within a tokio runtime.
    pub fn from_fd(fd: RawFd) -> io::Result<Self> {
        Ok(Self::new(pipe::Sender::from_owned_fd(dup_host_fd(fd)?)?))
    }

    /// Wrap an already-open pipe sender.
    pub fn new(tx: pipe::Sender) -> Self {
        Self { tx }
    }

    /// Write one dispatched document followed by exactly one newline.
    ///
    /// Flushed before returning, so dispatch lines reach the host in
    /// arrival order before the next frame is parsed.
    pub async fn write_line(&mut self, doc: &str) -> io::Result<()> {
        self.tx.write_all(doc.as_bytes()).await?;
        self.tx.write_all(b"\n").await?;
        self.tx.flush().await
    }
}

/// Consume every complete envelope from `buf`, leaving a partial tail.
fn parse_envelopes(buf: &mut Vec<u8>) -> Vec<HostAction> {
    let mut actions = Vec::new();
    let mut consumed = 0;
    {
        let mut stream = serde_json::Deserializer::from_slice(buf).into_iter::<HostEnvelope>();
        loop {
            match stream.next() {
                Some(Ok(envelope)) => {
                    consumed = stream.byte_offset();
                    if let Some(action) = envelope_action(envelope) {
                        actions.push(action);
                    }
                }
                Some(Err(e)) if e.is_eof() => break,
                Some(Err(e)) => {
                    // The host can resend; drop the unparseable input.
                    warn!(error = %e, "Failed to parse host envelope");
                    consumed = buf.len();
                    break;
                }
                None => {
                    consumed = buf.len();
                    break;
                }
            }
        }
    }
    buf.drain(..consumed);
    actions
}

fn envelope_action(envelope: HostEnvelope) -> Option<HostAction> {
    match envelope.op {
        op if op >= 0 => {
            let event = OutboundEvent {
                op,
                d: envelope.d.as_deref(),
            };
            match serde_json::to_string(&event) {
                Ok(frame) => Some(HostAction::Forward(frame)),
                Err(e) => {
                    warn!(error = %e, "Failed to encode host event");
                    None
                }
            }
        }
        HOST_OP_RECONNECT => Some(HostAction::Reconnect),
        HOST_OP_SHUTDOWN => Some(HostAction::Shutdown),
        op => {
            warn!(op, "Ignoring unknown host control op");
            None
        }
    }
}
