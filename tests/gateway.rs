//! End-to-end session tests against an in-process mock gateway.
//!
//! Each test binds a local WebSocket server, points the bridge at it via
//! its gateway URL override, and drives the protocol from the server
//! side while watching the host pipes from the outside.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::pipe;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use ferry_gateway::{
    Bridge, BridgeConfig, Disposition, GatewayError, HostReader, HostWriter, Intents, ResumeState,
};

const WAIT: Duration = Duration::from_secs(10);

type ServerWs = WebSocketStream<TcpStream>;

/// The test's ends of the two host pipes.
struct HostEnds {
    /// Write end of the control pipe the bridge reads.
    control: pipe::Sender,
    /// Read end of the dispatch pipe the bridge writes.
    dispatch: pipe::Receiver,
}

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

fn base_config(url: &str) -> BridgeConfig {
    let mut config = BridgeConfig::new("test_token", Intents::GUILDS | Intents::GUILD_MESSAGES)
        .with_gateway_url(url);
    config.reconnect_base_delay_ms = 50;
    config.reconnect_max_delay_ms = 200;
    config
}

fn new_bridge(config: BridgeConfig) -> (Arc<Bridge>, HostReader, HostWriter, HostEnds) {
    let (control_tx, control_rx) = pipe::pipe().unwrap();
    let (dispatch_tx, dispatch_rx) = pipe::pipe().unwrap();
    (
        Arc::new(Bridge::new(config)),
        HostReader::new(control_rx),
        HostWriter::new(dispatch_tx),
        HostEnds {
            control: control_tx,
            dispatch: dispatch_rx,
        },
    )
}

fn run_bridge(
    bridge: &Arc<Bridge>,
    host_in: HostReader,
    host_out: HostWriter,
) -> JoinHandle<Result<(), GatewayError>> {
    let bridge = Arc::clone(bridge);
    tokio::spawn(async move { bridge.run(host_in, host_out).await })
}

async fn accept_ws(listener: &TcpListener) -> ServerWs {
    let (stream, _) = timeout(WAIT, listener.accept())
        .await
        .expect("timed out waiting for a connection")
        .unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn send_json(ws: &mut ServerWs, value: Value) {
    ws.send(Message::Text(value.to_string().into()))
        .await
        .unwrap();
}

async fn send_hello(ws: &mut ServerWs, interval_ms: u64) {
    send_json(ws, json!({"op": 10, "d": {"heartbeat_interval": interval_ms}})).await;
}

async fn recv_json(ws: &mut ServerWs) -> Value {
    loop {
        let message = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .unwrap();
        if let Message::Text(text) = message {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

/// Receive frames until one with the wanted opcode shows up, skipping
/// heartbeats that race in from the jittered actor.
async fn recv_op(ws: &mut ServerWs, op: i64) -> Value {
    loop {
        let value = recv_json(ws).await;
        if value["op"] == op {
            return value;
        }
    }
}

async fn write_control(host: &mut HostEnds, value: Value) {
    host.control
        .write_all(value.to_string().as_bytes())
        .await
        .unwrap();
    host.control.flush().await.unwrap();
}

async fn read_dispatch_line(host: &mut HostEnds) -> String {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = timeout(WAIT, host.dispatch.read(&mut byte))
            .await
            .expect("timed out waiting for a dispatch line")
            .unwrap();
        assert!(n > 0, "dispatch pipe closed");
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }
    String::from_utf8(line).unwrap()
}

#[tokio::test]
async fn fresh_identify_after_hello() {
    let (listener, url) = bind().await;
    let (bridge, host_in, host_out, _host) = new_bridge(base_config(&url));
    let handle = run_bridge(&bridge, host_in, host_out);

    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;

    let identify = recv_op(&mut ws, 2).await;
    assert_eq!(identify["d"]["token"], "test_token");
    assert_eq!(identify["d"]["intents"], 513);
    assert_eq!(identify["d"]["shards"], json!([0, 1]));
    assert!(identify["d"]["properties"]["os"].is_string());
    assert!(identify["d"]["properties"]["browser"].is_string());

    handle.abort();
}

#[tokio::test]
async fn resume_uses_preloaded_session_and_url() {
    let (listener, url) = bind().await;

    // The discovery URL is unreachable on purpose: a connection only
    // arrives if the preloaded resume URL is preferred.
    let (bridge, host_in, host_out, _host) = new_bridge(base_config("ws://127.0.0.1:1"));
    bridge.session().set_resume(ResumeState {
        session_id: "ABC".to_string(),
        resume_url: url.clone(),
    });
    bridge.session().note_sequence(42);
    let handle = run_bridge(&bridge, host_in, host_out);

    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;

    let resume = recv_op(&mut ws, 6).await;
    assert_eq!(resume["d"]["token"], "test_token");
    assert_eq!(resume["d"]["session_id"], "ABC");
    assert_eq!(resume["d"]["seq"], 42);

    handle.abort();
}

#[tokio::test]
async fn non_resumable_invalid_session_identifies_fresh() {
    let (listener, url) = bind().await;
    let (bridge, host_in, host_out, _host) = new_bridge(base_config(&url));
    bridge.session().set_resume(ResumeState {
        session_id: "ABC".to_string(),
        resume_url: url.clone(),
    });
    bridge.session().note_sequence(42);
    let handle = run_bridge(&bridge, host_in, host_out);

    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    recv_op(&mut ws, 6).await;
    send_json(&mut ws, json!({"op": 9, "d": false})).await;

    // The session id is discarded, so the next connection identifies.
    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    let identify = recv_op(&mut ws, 2).await;
    assert_eq!(identify["d"]["token"], "test_token");
    assert!(bridge.session().resume().is_none());

    handle.abort();
}

#[tokio::test]
async fn resumable_invalid_session_keeps_session_id() {
    let (listener, url) = bind().await;
    let (bridge, host_in, host_out, _host) = new_bridge(base_config(&url));
    bridge.session().set_resume(ResumeState {
        session_id: "ABC".to_string(),
        resume_url: url.clone(),
    });
    let handle = run_bridge(&bridge, host_in, host_out);

    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    recv_op(&mut ws, 6).await;
    send_json(&mut ws, json!({"op": 9, "d": true})).await;

    // The session id survives, so the next connection resumes again.
    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    let resume = recv_op(&mut ws, 6).await;
    assert_eq!(resume["d"]["session_id"], "ABC");

    handle.abort();
}

#[tokio::test]
async fn reconnectable_close_code_reconnects() {
    let (listener, url) = bind().await;
    let (bridge, host_in, host_out, _host) = new_bridge(base_config(&url));
    let handle = run_bridge(&bridge, host_in, host_out);

    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    recv_op(&mut ws, 2).await;

    ws.send(Message::Close(Some(CloseFrame {
        code: CloseCode::from(4000),
        reason: "Unknown error.".to_string().into(),
    })))
    .await
    .unwrap();

    // 4000 is in the reconnect-ok set: a new attempt follows.
    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    recv_op(&mut ws, 2).await;

    handle.abort();
}

#[tokio::test]
async fn second_ready_replaces_resume_state() {
    let (listener, url) = bind().await;
    let (bridge, host_in, host_out, mut host) = new_bridge(base_config(&url));
    let handle = run_bridge(&bridge, host_in, host_out);

    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    recv_op(&mut ws, 2).await;

    for session_id in ["S1", "S2"] {
        send_json(
            &mut ws,
            json!({
                "op": 0,
                "s": 1,
                "t": "READY",
                "d": {
                    "session_id": session_id,
                    "resume_gateway_url": url,
                    "user": {"username": "ferry", "discriminator": "0001"},
                },
            }),
        )
        .await;
        // Reading the forwarded line synchronizes with the frame
        // having been processed.
        read_dispatch_line(&mut host).await;
    }

    assert_eq!(bridge.session().resume().unwrap().session_id, "S2");

    handle.abort();
}

#[tokio::test]
async fn missed_heartbeat_ack_tears_down_and_resumes() {
    let (listener, url) = bind().await;
    let (bridge, host_in, host_out, _host) = new_bridge(base_config(&url));
    let handle = run_bridge(&bridge, host_in, host_out);

    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 1000).await;
    recv_op(&mut ws, 2).await;
    send_json(
        &mut ws,
        json!({
            "op": 0,
            "s": 1,
            "t": "READY",
            "d": {
                "session_id": "S1",
                "resume_gateway_url": url,
                "user": {"username": "ferry", "discriminator": "0001"},
            },
        }),
    )
    .await;

    // A heartbeat arrives within the interval but is never acked, so
    // the liveness watchdog kills the connection.
    let beat = recv_op(&mut ws, 1).await;
    assert!(beat["d"] == json!(1) || beat["d"].is_null());

    // The session survives: the next connection resumes with the same
    // session id.
    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    let resume = recv_op(&mut ws, 6).await;
    assert_eq!(resume["d"]["session_id"], "S1");

    handle.abort();
}

#[tokio::test]
async fn dispatch_is_forwarded_verbatim() {
    let (listener, url) = bind().await;
    let (bridge, host_in, host_out, mut host) = new_bridge(base_config(&url));
    let handle = run_bridge(&bridge, host_in, host_out);

    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    recv_op(&mut ws, 2).await;

    let doc = r#"{"op":0,"s":17,"d":{"x":1},"t":"MESSAGE_CREATE"}"#;
    ws.send(Message::Text(doc.to_string().into())).await.unwrap();

    let line = read_dispatch_line(&mut host).await;
    assert_eq!(line, doc);
    assert_eq!(bridge.session().sequence(), 17);

    handle.abort();
}

#[tokio::test]
async fn server_heartbeat_request_is_answered() {
    let (listener, url) = bind().await;
    let (bridge, host_in, host_out, _host) = new_bridge(base_config(&url));
    let handle = run_bridge(&bridge, host_in, host_out);

    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    recv_op(&mut ws, 2).await;

    send_json(&mut ws, json!({"op": 1})).await;
    let beat = recv_op(&mut ws, 1).await;
    assert!(beat["d"].is_null() || beat["d"].is_i64());

    handle.abort();
}

#[tokio::test]
async fn terminal_close_code_stops_the_bridge() {
    let (listener, url) = bind().await;
    let (bridge, host_in, host_out, _host) = new_bridge(base_config(&url));
    let handle = run_bridge(&bridge, host_in, host_out);

    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    recv_op(&mut ws, 2).await;

    ws.send(Message::Close(Some(CloseFrame {
        code: CloseCode::from(4004),
        reason: "Authentication failed.".to_string().into(),
    })))
    .await
    .unwrap();

    let result = timeout(WAIT, handle).await.unwrap().unwrap();
    match result {
        Err(GatewayError::Closed { code, .. }) => assert_eq!(code, 4004),
        other => panic!("expected a terminal close, got {other:?}"),
    }
    assert_eq!(bridge.disposition(), Disposition::Error);

    // No reconnect attempt follows a terminal close code.
    assert!(
        timeout(Duration::from_millis(500), listener.accept())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn host_reconnect_envelope_reconnects() {
    let (listener, url) = bind().await;
    let (bridge, host_in, host_out, mut host) = new_bridge(base_config(&url));
    let handle = run_bridge(&bridge, host_in, host_out);

    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    recv_op(&mut ws, 2).await;

    write_control(&mut host, json!({"op": -1})).await;

    // Observationally the same as a wire opcode 7: a new connection.
    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    recv_op(&mut ws, 2).await;

    handle.abort();
}

#[tokio::test]
async fn host_event_is_forwarded_to_the_gateway() {
    let (listener, url) = bind().await;
    let (bridge, host_in, host_out, mut host) = new_bridge(base_config(&url));
    let handle = run_bridge(&bridge, host_in, host_out);

    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    recv_op(&mut ws, 2).await;

    write_control(&mut host, json!({"op": 3, "d": {"status": "online"}})).await;

    let event = recv_op(&mut ws, 3).await;
    assert_eq!(event, json!({"op": 3, "d": {"status": "online"}}));

    handle.abort();
}

#[tokio::test]
async fn host_shutdown_envelope_exits_clean() {
    let (listener, url) = bind().await;
    let (bridge, host_in, host_out, mut host) = new_bridge(base_config(&url));
    let handle = run_bridge(&bridge, host_in, host_out);

    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    recv_op(&mut ws, 2).await;

    write_control(&mut host, json!({"op": -2})).await;

    let result = timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(bridge.disposition(), Disposition::Ok);
}

#[tokio::test]
async fn host_pipe_eof_exits_clean() {
    let (listener, url) = bind().await;
    let (bridge, host_in, host_out, host) = new_bridge(base_config(&url));
    let handle = run_bridge(&bridge, host_in, host_out);

    let mut ws = accept_ws(&listener).await;
    send_hello(&mut ws, 45000).await;
    recv_op(&mut ws, 2).await;

    drop(host.control);

    let result = timeout(WAIT, handle).await.unwrap().unwrap();
    assert!(result.is_ok());
    assert_eq!(bridge.disposition(), Disposition::Ok);
}
