//! Inbound frame assembly.
//!
//! The transport already reassembles WebSocket fragments, but a gateway
//! payload can still reach us split across deliveries when an
//! intermediary rechunks the stream. The assembler accumulates text until
//! it holds one syntactically complete JSON document, then hands the
//! document out for dispatch.
//!
//! The buffer is grown on demand and reused across frames and
//! connections; it is never shrunk.

use serde::de::IgnoredAny;

use crate::error::GatewayError;

const INITIAL_CAPACITY: usize = 1024;

/// Reassembles partial JSON payloads across frame deliveries.
#[derive(Debug)]
pub struct FrameAssembler {
    buf: String,
    partial: bool,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self {
            buf: String::with_capacity(INITIAL_CAPACITY),
            partial: false,
        }
    }

    /// Feed one delivered chunk.
    ///
    /// Returns the complete document once the buffer parses, `None` while
    /// a prefix is still awaiting continuation. A chunk that can never
    /// become valid JSON is an error; the session loop ends and the
    /// supervisor decides whether to reconnect.
    pub fn push(&mut self, chunk: &str) -> Result<Option<&str>, GatewayError> {
        if !self.partial {
            self.buf.clear();
        }
        self.buf.push_str(chunk);

        if !self.partial && !self.buf.starts_with('{') {
            return Err(GatewayError::JsonDecode("corrupted data".to_string()));
        }

        match serde_json::from_str::<IgnoredAny>(&self.buf) {
            Ok(_) => {
                self.partial = false;
                Ok(Some(self.buf.as_str()))
            }
            Err(e) if e.is_eof() => {
                self.partial = true;
                Ok(None)
            }
            Err(e) => Err(GatewayError::JsonDecode(e.to_string())),
        }
    }

    /// Drop any half-assembled prefix, keeping the allocation.
    ///
    /// Called between connections; a continuation never spans a
    /// reconnect.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.partial = false;
    }

    /// Whether a prefix is waiting for continuation.
    pub fn is_partial(&self) -> bool {
        self.partial
    }
}

impl Default for FrameAssembler {
    fn default() -> Self {
        Self::new()
    }
}
