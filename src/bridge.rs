//! Gateway session supervisor and event loop.
//!
//! [`Bridge`] owns the whole connection lifecycle: it dials the gateway
//! (discovery URL or the resume URL from the last READY), answers hello
//! with identify or resume, multiplexes the socket with the host pipes
//! and the heartbeat actor, and classifies every way a connection can
//! end into "reconnect" or "terminal".

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use flume::Sender;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use serde_json::value::RawValue;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{header, HeaderValue};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, trace, warn};
use url::Url;

use crate::backoff::reconnect_delay;
use crate::error::{reconnect_ok, GatewayError};
use crate::framer::FrameAssembler;
use crate::heartbeat::{self, Pulse};
use crate::host::{HostAction, HostReader, HostWriter};
use crate::intents::Intents;
use crate::opcode::OpCode;
use crate::payload::{
    create_heartbeat_payload, ConnectionProperties, GatewayPayload, HelloPayload, IdentifyPayload,
    RawGatewayPayload, ReadyEventData, ResumePayload,
};
use crate::session::{Disposition, ResumeState, Session};
use crate::{DEFAULT_GATEWAY_URL, GATEWAY_VERSION};

/// Type alias for the WebSocket stream.
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Type alias for the write half of the socket.
type WsSink = SplitSink<WsStream, WsMessage>;

/// Connection state, observable by embedders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not running.
    Disconnected,
    /// Dialing the gateway.
    Connecting,
    /// Connected, waiting for hello.
    Handshaking,
    /// Identify sent, waiting for READY.
    Identifying,
    /// Resume sent, waiting for replay.
    Resuming,
    /// Session established.
    Connected,
    /// Between connection attempts.
    Reconnecting,
    /// Shutting down.
    Disconnecting,
}

/// Configuration for a bridge.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bot token.
    pub token: String,

    /// Capability flags declared at identify time.
    pub intents: Intents,

    /// Shard index claimed by this process.
    pub shard_index: u32,

    /// Total shard count.
    pub shard_count: u32,

    /// Discovery URL, used when no resume URL is known.
    pub gateway_url: String,

    /// User agent presented during the WebSocket handshake.
    pub user_agent: String,

    /// Identity descriptors sent with identify.
    pub properties: ConnectionProperties<'static>,

    /// Consecutive failed attempts tolerated before giving up.
    ///
    /// `None` (the default) reconnects indefinitely; the delay between
    /// attempts still backs off.
    pub max_reconnect_attempts: Option<u32>,

    /// Base reconnect delay in milliseconds.
    pub reconnect_base_delay_ms: u64,

    /// Maximum reconnect delay in milliseconds.
    pub reconnect_max_delay_ms: u64,
}

impl BridgeConfig {
    /// Create a configuration with required fields.
    pub fn new(token: impl Into<String>, intents: Intents) -> Self {
        Self {
            token: token.into(),
            intents,
            shard_index: 0,
            shard_count: 1,
            gateway_url: DEFAULT_GATEWAY_URL.to_string(),
            user_agent: crate::USER_AGENT.to_string(),
            properties: ConnectionProperties::default(),
            max_reconnect_attempts: None,
            reconnect_base_delay_ms: 1000,
            reconnect_max_delay_ms: 60000,
        }
    }

    /// Set the shard tuple reported at identify time.
    pub fn with_shard(mut self, index: u32, count: u32) -> Self {
        self.shard_index = index;
        self.shard_count = count;
        self
    }

    /// Set a custom gateway URL.
    pub fn with_gateway_url(mut self, url: impl Into<String>) -> Self {
        self.gateway_url = url.into();
        self
    }
}

/// A gateway session bridge.
///
/// Maintains one connection at a time, reconnecting as policy allows,
/// and shuttles traffic between the socket and the host pipes.
pub struct Bridge {
    config: BridgeConfig,
    session: Arc<Session>,
    state: RwLock<ConnectionState>,
    disposition: RwLock<Disposition>,
    shutdown: AtomicBool,
}

impl Bridge {
    pub fn new(config: BridgeConfig) -> Self {
        Self {
            config,
            session: Arc::new(Session::new()),
            state: RwLock::new(ConnectionState::Disconnected),
            disposition: RwLock::new(Disposition::Ok),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Shared session state (sequence, resume coordinates, latency).
    pub fn session(&self) -> Arc<Session> {
        Arc::clone(&self.session)
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Outcome severity so far.
    pub fn disposition(&self) -> Disposition {
        *self.disposition.read()
    }

    /// Request a graceful shutdown; observed at the next loop iteration.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.write() = state;
    }

    fn raise(&self, to: Disposition) {
        self.disposition.write().raise(to);
    }

    /// Run the bridge until shutdown or a terminal failure.
    ///
    /// Returns `Ok(())` only for a clean shutdown (host pseudo-op `-2`,
    /// host pipe EOF, or [`Bridge::shutdown`]); every terminal error has
    /// already raised the exit disposition when this returns.
    pub async fn run(
        &self,
        mut host_in: HostReader,
        mut host_out: HostWriter,
    ) -> Result<(), GatewayError> {
        let mut assembler = FrameAssembler::new();
        let mut attempts = 0u32;

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                self.set_state(ConnectionState::Disconnecting);
                break;
            }

            assembler.reset();
            let result = self
                .connect_and_run(&mut host_in, &mut host_out, &mut assembler)
                .await;

            // A connection that reached READY starts the attempt
            // counter over.
            if self.state() == ConnectionState::Connected {
                attempts = 0;
            }

            let immediate = match result {
                Ok(()) => {
                    self.set_state(ConnectionState::Disconnecting);
                    break;
                }
                Err(GatewayError::ReconnectRequested) => {
                    info!(tag = %self.session.tag(), "Received reconnect request, reconnecting");
                    true
                }
                Err(GatewayError::HeartbeatTimeout) => {
                    warn!(tag = %self.session.tag(), "Heartbeat timed out, reconnecting");
                    attempts = attempts.saturating_add(1);
                    false
                }
                Err(GatewayError::InvalidSession { resumable }) => {
                    warn!(tag = %self.session.tag(), resumable, "Invalid session");
                    if !resumable {
                        self.session.clear_resume();
                        self.session.reset_sequence();
                    }
                    attempts = attempts.saturating_add(1);
                    false
                }
                Err(GatewayError::Closed { code, reason }) if code == 0 || reconnect_ok(code) => {
                    warn!(
                        tag = %self.session.tag(),
                        code,
                        reason = %reason,
                        "Connection closed, reconnecting"
                    );
                    attempts = attempts.saturating_add(1);
                    false
                }
                Err(e @ GatewayError::Closed { .. }) => {
                    error!(tag = %self.session.tag(), error = %e, "Terminal close code");
                    self.raise(Disposition::Error);
                    return Err(e);
                }
                Err(e @ GatewayError::MissingHeartbeatInterval) => {
                    error!(tag = %self.session.tag(), error = %e, "Protocol failure");
                    self.raise(Disposition::Error);
                    return Err(e);
                }
                Err(e @ GatewayError::Pipe(_)) => {
                    error!(tag = %self.session.tag(), error = %e, "Host pipe failure");
                    self.raise(Disposition::Error);
                    return Err(e);
                }
                Err(e) => {
                    // Transient: dial, TLS, send and decode failures.
                    warn!(tag = %self.session.tag(), error = %e, "Connection failed, reconnecting");
                    attempts = attempts.saturating_add(1);
                    false
                }
            };

            if let Some(max) = self.config.max_reconnect_attempts {
                if attempts > max {
                    error!(tag = %self.session.tag(), attempts, "Giving up on reconnecting");
                    self.raise(Disposition::Error);
                    return Err(GatewayError::ReconnectExhausted { attempts });
                }
            }

            self.set_state(ConnectionState::Reconnecting);
            if !immediate && attempts > 0 {
                let delay = reconnect_delay(
                    attempts - 1,
                    self.config.reconnect_base_delay_ms,
                    self.config.reconnect_max_delay_ms,
                );
                debug!(
                    tag = %self.session.tag(),
                    attempt = attempts,
                    backoff_ms = delay.as_millis() as u64,
                    "Waiting before reconnect"
                );
                sleep(delay).await;
            }
        }

        info!(tag = %self.session.tag(), "Shutting down");
        self.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    /// Dial once and drive the connection until it ends.
    async fn connect_and_run(
        &self,
        host_in: &mut HostReader,
        host_out: &mut HostWriter,
        assembler: &mut FrameAssembler,
    ) -> Result<(), GatewayError> {
        let url = self.gateway_url()?;
        info!(tag = %self.session.tag(), url = %url, "Connecting to gateway");
        self.set_state(ConnectionState::Connecting);

        let mut request = url.as_str().into_client_request()?;
        let agent = HeaderValue::from_str(&self.config.user_agent)
            .map_err(|e| GatewayError::Config(format!("invalid user agent: {e}")))?;
        request.headers_mut().insert(header::USER_AGENT, agent);

        let (ws_stream, _response) = connect_async(request).await?;
        debug!(tag = %self.session.tag(), "WebSocket connected");
        self.set_state(ConnectionState::Handshaking);

        let (mut sink, mut stream) = ws_stream.split();
        let (pulse_tx, pulse_rx) = flume::unbounded();
        let mut heartbeat: Option<JoinHandle<()>> = None;
        self.session.reset_ack();

        let result: Result<(), GatewayError> = 'session: loop {
            tokio::select! {
                message = stream.next() => match message {
                    Some(Ok(message)) => {
                        if let Err(e) = self
                            .handle_message(
                                message,
                                &mut sink,
                                host_out,
                                assembler,
                                &pulse_tx,
                                &mut heartbeat,
                            )
                            .await
                        {
                            break 'session Err(e);
                        }
                    }
                    Some(Err(e)) => break 'session Err(GatewayError::WebSocket(e)),
                    None => {
                        break 'session Err(GatewayError::Closed {
                            code: 0,
                            reason: "WebSocket stream ended".to_string(),
                        })
                    }
                },

                pulse = pulse_rx.recv_async() => match pulse {
                    Ok(Pulse::Beat(frame)) => {
                        if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                            warn!(tag = %self.session.tag(), "A heartbeat was not sent, reconnecting");
                            break 'session Err(GatewayError::WebSocket(e));
                        }
                    }
                    Ok(Pulse::Failed) => break 'session Err(GatewayError::HeartbeatTimeout),
                    Err(_) => break 'session Err(GatewayError::ChannelClosed),
                },

                ready = host_in.readable() => {
                    if let Err(e) = ready {
                        break 'session Err(GatewayError::Pipe(e));
                    }
                    let actions = match host_in.drain() {
                        Ok(actions) => actions,
                        Err(e) => break 'session Err(GatewayError::Pipe(e)),
                    };
                    for action in actions {
                        match action {
                            HostAction::Forward(frame) => {
                                if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                                    warn!(tag = %self.session.tag(), "An event was not sent, reconnecting");
                                    break 'session Err(GatewayError::WebSocket(e));
                                }
                            }
                            HostAction::Reconnect => break 'session Err(GatewayError::ReconnectRequested),
                            HostAction::Shutdown => break 'session Ok(()),
                        }
                    }
                },
            }

            if self.shutdown.load(Ordering::SeqCst) {
                break 'session Ok(());
            }
        };

        if let Some(handle) = heartbeat.take() {
            handle.abort();
        }
        if result.is_ok() {
            let _ = sink.close().await;
        }
        result
    }

    /// Build the connection URL: the resume URL verbatim when a session
    /// is resumable, the discovery URL with version and encoding
    /// parameters otherwise.
    fn gateway_url(&self) -> Result<Url, GatewayError> {
        if let Some(resume) = self.session.resume() {
            return Ok(Url::parse(&resume.resume_url)?);
        }

        let mut url = Url::parse(&self.config.gateway_url)?;
        url.query_pairs_mut()
            .append_pair("v", &GATEWAY_VERSION.to_string())
            .append_pair("encoding", "json");
        Ok(url)
    }

    /// Handle one inbound WebSocket message.
    async fn handle_message(
        &self,
        message: WsMessage,
        sink: &mut WsSink,
        host_out: &mut HostWriter,
        assembler: &mut FrameAssembler,
        pulse_tx: &Sender<Pulse>,
        heartbeat: &mut Option<JoinHandle<()>>,
    ) -> Result<(), GatewayError> {
        match message {
            WsMessage::Text(text) => {
                if let Some(doc) = assembler.push(text.as_str())? {
                    self.process_frame(doc, sink, host_out, pulse_tx, heartbeat)
                        .await?;
                }
                Ok(())
            }
            WsMessage::Close(frame) => {
                let (code, reason) = frame
                    .map(|f| (u16::from(f.code), f.reason.to_string()))
                    .unwrap_or((0, String::new()));
                Err(GatewayError::Closed { code, reason })
            }
            WsMessage::Ping(data) => {
                sink.send(WsMessage::Pong(data)).await?;
                Ok(())
            }
            WsMessage::Binary(_) => {
                // Compression is never negotiated, so binary frames are
                // unexpected here.
                trace!(tag = %self.session.tag(), "Ignoring binary frame");
                Ok(())
            }
            WsMessage::Pong(_) | WsMessage::Frame(_) => Ok(()),
        }
    }

    /// Interpret one complete JSON document from the gateway.
    async fn process_frame(
        &self,
        doc: &str,
        sink: &mut WsSink,
        host_out: &mut HostWriter,
        pulse_tx: &Sender<Pulse>,
        heartbeat: &mut Option<JoinHandle<()>>,
    ) -> Result<(), GatewayError> {
        let payload: RawGatewayPayload = serde_json::from_str(doc)?;

        if let Some(seq) = payload.s {
            self.session.note_sequence(seq);
        }

        match OpCode::from_u8(payload.op) {
            Some(OpCode::Dispatch) => {
                host_out.write_line(doc).await?;
                match payload.t.as_deref() {
                    Some("READY") => self.handle_ready(payload.d),
                    Some("RESUMED") => info!(tag = %self.session.tag(), "Session resumed"),
                    _ => {}
                }
            }
            Some(OpCode::Heartbeat) => {
                debug!(tag = %self.session.tag(), "Heartbeat requested by gateway");
                let frame = create_heartbeat_payload(self.session.sequence_opt());
                sink.send(WsMessage::Text(frame.into())).await?;
            }
            Some(OpCode::Reconnect) => {
                info!(tag = %self.session.tag(), "Gateway requested reconnect");
                return Err(GatewayError::ReconnectRequested);
            }
            Some(OpCode::InvalidSession) => {
                let resumable = payload
                    .d
                    .and_then(|d| serde_json::from_str(d.get()).ok())
                    .unwrap_or(false);
                return Err(GatewayError::InvalidSession { resumable });
            }
            Some(OpCode::Hello) => {
                self.handle_hello(payload.d, sink, pulse_tx, heartbeat)
                    .await?
            }
            Some(OpCode::HeartbeatAck) => {
                self.session.mark_acked();
                if let Some(rtt) = self.session.latency() {
                    trace!(
                        tag = %self.session.tag(),
                        rtt_ms = rtt.as_millis() as u64,
                        "Heartbeat acked"
                    );
                }
            }
            Some(OpCode::Identify) | Some(OpCode::Resume) => {
                trace!(tag = %self.session.tag(), op = payload.op, "Ignoring send-only opcode");
            }
            None => {
                trace!(tag = %self.session.tag(), op = payload.op, "Ignoring unknown opcode");
            }
        }

        Ok(())
    }

    /// Capture resume coordinates and the account tag from READY.
    ///
    /// The full event has already been forwarded to the host; failures
    /// here only degrade resume and logging, never the session.
    fn handle_ready(&self, d: Option<&RawValue>) {
        let Some(d) = d else {
            warn!(tag = %self.session.tag(), "Ready carried no payload");
            return;
        };

        let ready: ReadyEventData = match serde_json::from_str(d.get()) {
            Ok(ready) => ready,
            Err(e) => {
                warn!(tag = %self.session.tag(), error = %e, "Failed to extract session from Ready");
                return;
            }
        };

        self.session.set_resume(ResumeState {
            session_id: ready.session_id,
            resume_url: ready.resume_gateway_url,
        });
        self.set_state(ConnectionState::Connected);

        match ready.user {
            Some(user) => {
                self.session.set_tag(user.tag());
                info!(tag = %self.session.tag(), "Ready");
            }
            None => {
                warn!(tag = %self.session.tag(), "Ready, but failed to get account tag");
            }
        }
    }

    /// Answer hello: resume when a session id is held, identify
    /// otherwise, then start the heartbeat actor.
    async fn handle_hello(
        &self,
        d: Option<&RawValue>,
        sink: &mut WsSink,
        pulse_tx: &Sender<Pulse>,
        heartbeat: &mut Option<JoinHandle<()>>,
    ) -> Result<(), GatewayError> {
        let hello: HelloPayload = match d {
            Some(d) => serde_json::from_str(d.get())
                .map_err(|_| GatewayError::MissingHeartbeatInterval)?,
            None => return Err(GatewayError::MissingHeartbeatInterval),
        };
        if hello.heartbeat_interval == 0 {
            return Err(GatewayError::MissingHeartbeatInterval);
        }

        let frame = match self.session.resume() {
            Some(resume) => {
                self.set_state(ConnectionState::Resuming);
                info!(
                    tag = %self.session.tag(),
                    session_id = %resume.session_id,
                    "Resuming session"
                );
                serde_json::to_string(&GatewayPayload::new(
                    OpCode::Resume,
                    ResumePayload {
                        token: self.config.token.as_str().into(),
                        session_id: resume.session_id.into(),
                        seq: self.session.sequence(),
                    },
                ))?
            }
            None => {
                self.set_state(ConnectionState::Identifying);
                info!(tag = %self.session.tag(), "Sending identify");
                serde_json::to_string(&GatewayPayload::new(
                    OpCode::Identify,
                    IdentifyPayload {
                        token: self.config.token.as_str().into(),
                        intents: self.config.intents,
                        shards: [self.config.shard_index, self.config.shard_count],
                        properties: self.config.properties.clone(),
                    },
                ))?
            }
        };
        sink.send(WsMessage::Text(frame.into())).await?;

        // The actor is only ever spawned after identify/resume has gone
        // out, so authentication always precedes the first heartbeat.
        if let Some(stale) = heartbeat.take() {
            stale.abort();
        }
        *heartbeat = Some(heartbeat::spawn(
            self.session.clone(),
            Duration::from_millis(hello.heartbeat_interval),
            pulse_tx.clone(),
        ));

        Ok(())
    }
}
