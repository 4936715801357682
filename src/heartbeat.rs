//! Heartbeat actor.
//!
//! An independently timed task keeps the session alive and watches for
//! zombie connections. It never touches the socket directly: frames and
//! the liveness verdict travel over a channel into the event loop, so
//! the transport only ever has one writer and the actor can be aborted
//! at any await point without leaving a half-sent frame behind.

use std::sync::Arc;
use std::time::Duration;

use flume::Sender;
use rand::Rng;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{trace, warn};

use crate::payload::create_heartbeat_payload;
use crate::session::Session;

/// How long to wait for a heartbeat ack before declaring the
/// connection dead.
pub(crate) const LIVENESS_WINDOW: Duration = Duration::from_millis(5000);

/// Message from the heartbeat actor to the event loop.
#[derive(Debug)]
pub(crate) enum Pulse {
    /// A heartbeat frame ready to be written to the socket.
    Beat(String),

    /// No ack arrived within the liveness window; tear the
    /// connection down.
    Failed,
}

/// Start the heartbeat actor for one connection.
///
/// Spawned only after identify/resume has been sent, so the first
/// heartbeat can never precede authentication. The first beat waits a
/// uniform jitter in `[0, interval)` as the hello contract requires.
/// The returned handle is aborted on every connection teardown.
pub(crate) fn spawn(
    session: Arc<Session>,
    interval: Duration,
    pulses: Sender<Pulse>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let jitter_ms = rand::rng().random_range(0..interval.as_millis() as u64);
        sleep(Duration::from_millis(jitter_ms)).await;

        loop {
            session.mark_beat();
            let frame = create_heartbeat_payload(session.sequence_opt());
            trace!(tag = %session.tag(), seq = session.sequence(), "Sending heartbeat");
            if pulses.send_async(Pulse::Beat(frame)).await.is_err() {
                return;
            }

            sleep(LIVENESS_WINDOW).await;
            if !session.is_acked() {
                warn!(tag = %session.tag(), "Heartbeat ack not received");
                let _ = pulses.send_async(Pulse::Failed).await;
                return;
            }

            sleep(interval.saturating_sub(LIVENESS_WINDOW)).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_beat_then_failure_without_ack() {
        let session = Arc::new(Session::new());
        session.note_sequence(7);
        let (tx, rx) = flume::unbounded();

        let handle = spawn(session.clone(), Duration::from_millis(45000), tx);

        // First beat arrives after at most the full jitter window.
        let pulse = rx.recv_async().await.unwrap();
        match pulse {
            Pulse::Beat(frame) => assert_eq!(frame, r#"{"op":1,"d":7}"#),
            Pulse::Failed => panic!("expected a beat first"),
        }
        assert!(!session.is_acked());

        // No ack ever arrives, so the liveness window expires.
        let pulse = rx.recv_async().await.unwrap();
        assert!(matches!(pulse, Pulse::Failed));

        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_acked_beat_keeps_cadence() {
        let session = Arc::new(Session::new());
        let (tx, rx) = flume::unbounded();

        let handle = spawn(session.clone(), Duration::from_millis(45000), tx);

        let pulse = rx.recv_async().await.unwrap();
        match pulse {
            Pulse::Beat(frame) => assert_eq!(frame, r#"{"op":1,"d":null}"#),
            Pulse::Failed => panic!("expected a beat first"),
        }
        session.mark_acked();

        // The next pulse must be another beat, not a failure.
        let pulse = rx.recv_async().await.unwrap();
        assert!(matches!(pulse, Pulse::Beat(_)));

        handle.abort();
    }

    #[test]
    fn test_jitter_stays_below_interval() {
        let interval = Duration::from_millis(1000);
        for _ in 0..64 {
            let jitter = rand::rng().random_range(0..interval.as_millis() as u64);
            assert!(jitter < 1000);
        }
    }
}
