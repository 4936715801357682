//! Shared session state.
//!
//! One [`Session`] record lives for the whole life of the bridge and is
//! shared between the event loop and the heartbeat actor. The fields
//! both tasks touch (sequence number, ack flag) are atomics; the rest is
//! behind short-lived `parking_lot` locks.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;

/// Resume coordinates captured from the latest READY event.
#[derive(Debug, Clone)]
pub struct ResumeState {
    /// Session id to resume.
    pub session_id: String,
    /// URL to reconnect to instead of the discovery URL.
    pub resume_url: String,
}

/// Final outcome of the bridge, monotone in severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Disposition {
    /// Clean shutdown.
    Ok,
    /// A terminal protocol or transport failure.
    Error,
    /// An unrecoverable runtime failure.
    Fatal,
}

impl Disposition {
    /// Raise severity; lowering is a no-op.
    pub fn raise(&mut self, to: Disposition) {
        if to > *self {
            *self = to;
        }
    }
}

/// Mutable state of one gateway session.
#[derive(Debug)]
pub struct Session {
    /// Last sequence number received; 0 means none yet.
    sequence: AtomicI64,

    /// Set on heartbeat-ack, cleared right before each heartbeat send.
    acked: AtomicBool,

    /// When the last heartbeat was sent, for latency measurement.
    last_beat: RwLock<Instant>,

    /// Last heartbeat round-trip in milliseconds; `u64::MAX` means none.
    rtt_ms: AtomicU64,

    /// Resume coordinates; `None` forces a fresh identify.
    resume: RwLock<Option<ResumeState>>,

    /// Account tag for log lines, `None` until READY.
    tag: RwLock<Option<String>>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            sequence: AtomicI64::new(0),
            acked: AtomicBool::new(true),
            last_beat: RwLock::new(Instant::now()),
            rtt_ms: AtomicU64::new(u64::MAX),
            resume: RwLock::new(None),
            tag: RwLock::new(None),
        }
    }

    /// Last sequence number received, 0 when none yet.
    pub fn sequence(&self) -> i64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Sequence as a heartbeat/resume payload value.
    pub fn sequence_opt(&self) -> Option<i64> {
        match self.sequence() {
            0 => None,
            seq => Some(seq),
        }
    }

    /// Record a sequence number from an inbound frame.
    ///
    /// Zero is the "never received" sentinel and is ignored.
    pub fn note_sequence(&self, seq: i64) {
        if seq != 0 {
            self.sequence.store(seq, Ordering::SeqCst);
        }
    }

    /// Forget the sequence counter, for a fresh identify.
    pub fn reset_sequence(&self) {
        self.sequence.store(0, Ordering::SeqCst);
    }

    /// Mark a heartbeat as sent and start the liveness window.
    pub fn mark_beat(&self) {
        self.acked.store(false, Ordering::SeqCst);
        *self.last_beat.write() = Instant::now();
    }

    /// Record a heartbeat acknowledgment.
    pub fn mark_acked(&self) {
        let rtt = self.last_beat.read().elapsed();
        self.acked.store(true, Ordering::SeqCst);
        self.rtt_ms.store(rtt.as_millis() as u64, Ordering::Release);
    }

    /// Whether the last heartbeat has been acknowledged.
    pub fn is_acked(&self) -> bool {
        self.acked.load(Ordering::SeqCst)
    }

    /// Reset the ack flag for a new connection.
    pub fn reset_ack(&self) {
        self.acked.store(true, Ordering::SeqCst);
    }

    /// Last measured heartbeat round-trip time.
    pub fn latency(&self) -> Option<Duration> {
        match self.rtt_ms.load(Ordering::Acquire) {
            u64::MAX => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Current resume coordinates, if a session is resumable.
    pub fn resume(&self) -> Option<ResumeState> {
        self.resume.read().clone()
    }

    /// Store resume coordinates from READY.
    pub fn set_resume(&self, state: ResumeState) {
        *self.resume.write() = Some(state);
    }

    /// Discard the session id, forcing a fresh identify next connect.
    pub fn clear_resume(&self) {
        *self.resume.write() = None;
    }

    /// Account tag for log prefixes; `?` until READY has named it.
    pub fn tag(&self) -> String {
        self.tag.read().clone().unwrap_or_else(|| "?".to_string())
    }

    pub fn set_tag(&self, tag: String) {
        *self.tag.write() = Some(tag);
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
