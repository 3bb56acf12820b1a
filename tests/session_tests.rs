//! End-to-end scenarios S1, S2, S3 and S6.
//!
//! Each test stands up a TCP listener that speaks the server side of the
//! control-channel WebSocket handshake directly (via `tokio-tungstenite`'s
//! `accept_async`) and, where needed, a tiny `hyper` HTTP responder
//! standing in for the local service.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;

use tunnel_agent::message::{decode, encode, Frame, RequestMetadata};
use tunnel_agent::{TunnelClientOptions, TunnelSession};

/// Bind an ephemeral TCP listener for a fake tunnel server.
async fn bind_fake_server() -> (SocketAddr, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    (addr, listener)
}

/// Accept one connection and complete the WebSocket handshake as the
/// tunnel server would.
async fn accept_control_channel(
    listener: &TcpListener,
) -> tokio_tungstenite::WebSocketStream<tokio::net::TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn recv_frame(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
) -> Frame {
    loop {
        match ws.next_frame().await {
            Message::Text(text) => return decode(&text).unwrap(),
            _ => continue,
        }
    }
}

/// Small extension trait so the test body reads naturally.
trait NextFrame {
    async fn next_frame(&mut self) -> Message;
}

impl NextFrame for tokio_tungstenite::WebSocketStream<tokio::net::TcpStream> {
    async fn next_frame(&mut self) -> Message {
        use futures_util::StreamExt;
        self.next().await.unwrap().unwrap()
    }
}

/// Read frames until one matches `pred`, discarding interleaved
/// `LOCAL_SERVICE_PING`/`HEARTBEAT` frames from the independent timers.
async fn recv_frame_matching(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    pred: impl Fn(&Frame) -> bool,
) -> Frame {
    loop {
        let frame = recv_frame(ws).await;
        if pred(&frame) {
            return frame;
        }
    }
}

async fn send_frame(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    frame: Frame,
) {
    use futures_util::SinkExt;
    ws.send(Message::Text(encode(&frame).unwrap())).await.unwrap();
}

/// Spawn a `hyper` HTTP server on an ephemeral port that replies
/// `200 hello` to every request, standing in for the local service.
async fn spawn_local_echo_service() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let io = TokioIo::new(stream);
            tokio::spawn(async move {
                let service = service_fn(|_req: Request<hyper::body::Incoming>| async move {
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from("hello"))))
                });
                let _ = hyper::server::conn::http1::Builder::new()
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    port
}

async fn await_established(session: &TunnelSession) {
    for _ in 0..200 {
        if session.state().await.connected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("session never reached Established");
}

#[tokio::test]
async fn s1_happy_path_reaches_established_with_normalized_url() {
    let (addr, listener) = bind_fake_server().await;
    let local_port = spawn_local_echo_service().await;

    let mut options = TunnelClientOptions::new(local_port, "1.0.0");
    options.server_url = format!("http://{addr}");
    options.subdomain = Some("demo".to_string());
    options.token = Some("tok".to_string());
    options.reconnect = false;

    let session = std::sync::Arc::new(TunnelSession::new(options));
    let session_for_task = session.clone();
    let session_task = tokio::spawn(async move { session_for_task.connect().await });

    let mut ws = accept_control_channel(&listener).await;
    let connect = recv_frame(&mut ws).await;
    assert!(matches!(connect, Frame::Connect { token: Some(t), .. } if t == "tok"));

    send_frame(
        &mut ws,
        Frame::ConnectAck {
            timestamp: 0,
            tunnel_id: "T1".to_string(),
            subdomain: "demo".to_string(),
            public_url: "https://demo.tunnl.fit".to_string(),
        },
    )
    .await;

    await_established(&session).await;

    let state = session.state().await;
    assert_eq!(state.tunnel_id.as_deref(), Some("T1"));
    assert!(state.public_url.unwrap().starts_with("https://"));

    session_task.abort();
}

#[tokio::test]
async fn s2_request_forwarding_round_trips_through_local_service() {
    let (addr, listener) = bind_fake_server().await;
    let local_port = spawn_local_echo_service().await;

    let mut options = TunnelClientOptions::new(local_port, "1.0.0");
    options.server_url = format!("http://{addr}");
    options.reconnect = false;

    let session = std::sync::Arc::new(TunnelSession::new(options));
    let session_for_task = session.clone();
    let session_task = tokio::spawn(async move { session_for_task.connect().await });

    let mut ws = accept_control_channel(&listener).await;
    let _connect = recv_frame(&mut ws).await;
    send_frame(
        &mut ws,
        Frame::ConnectAck {
            timestamp: 0,
            tunnel_id: "T1".to_string(),
            subdomain: "demo".to_string(),
            public_url: "https://demo.tunnl.fit".to_string(),
        },
    )
    .await;

    await_established(&session).await;

    send_frame(
        &mut ws,
        Frame::Request {
            timestamp: 0,
            stream_id: "S".to_string(),
            tunnel_id: "T1".to_string(),
            metadata: RequestMetadata {
                method: "GET".to_string(),
                path: "/x".to_string(),
                query: "a=1".to_string(),
                headers: vec![
                    ("host".to_string(), "demo.tunnl.fit".to_string()),
                    ("user-agent".to_string(), "curl/8".to_string()),
                ],
            },
            body: tunnel_agent::message::Base64Body(vec![]),
        },
    )
    .await;

    let response = recv_frame_matching(&mut ws, |f| matches!(f, Frame::Response { .. })).await;
    match response {
        Frame::Response { stream_id, metadata, body, .. } => {
            assert_eq!(stream_id, "S");
            assert_eq!(metadata.status_code, 200);
            assert_eq!(body.0, b"hello");
        }
        other => panic!("expected RESPONSE, got {other:?}"),
    }

    let log = recv_frame_matching(&mut ws, |f| matches!(f, Frame::RequestLog { .. })).await;
    match log {
        Frame::RequestLog {
            method,
            path,
            status_code,
            user_agent,
            host,
            ..
        } => {
            assert_eq!(method, "GET");
            assert_eq!(path, "/x");
            assert_eq!(status_code, 200);
            assert_eq!(user_agent.as_deref(), Some("curl/8"));
            assert_eq!(host, "demo.tunnl.fit");
        }
        other => panic!("expected REQUEST_LOG, got {other:?}"),
    }

    session_task.abort();
}

#[tokio::test]
async fn s3_local_service_down_yields_bad_gateway_and_offline_ping() {
    let (addr, listener) = bind_fake_server().await;

    // Reserve a port and drop the listener so nothing answers on it.
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = reserved.local_addr().unwrap().port();
    drop(reserved);

    let mut options = TunnelClientOptions::new(dead_port, "1.0.0");
    options.server_url = format!("http://{addr}");
    options.reconnect = false;

    let session = std::sync::Arc::new(TunnelSession::new(options));
    let session_for_task = session.clone();
    let session_task = tokio::spawn(async move { session_for_task.connect().await });

    let mut ws = accept_control_channel(&listener).await;
    let _connect = recv_frame(&mut ws).await;
    send_frame(
        &mut ws,
        Frame::ConnectAck {
            timestamp: 0,
            tunnel_id: "T1".to_string(),
            subdomain: "demo".to_string(),
            public_url: "https://demo.tunnl.fit".to_string(),
        },
    )
    .await;

    await_established(&session).await;

    send_frame(
        &mut ws,
        Frame::Request {
            timestamp: 0,
            stream_id: "S".to_string(),
            tunnel_id: "T1".to_string(),
            metadata: RequestMetadata {
                method: "GET".to_string(),
                path: "/x".to_string(),
                query: String::new(),
                headers: vec![],
            },
            body: tunnel_agent::message::Base64Body(vec![]),
        },
    )
    .await;

    let response = recv_frame_matching(&mut ws, |f| matches!(f, Frame::Response { .. })).await;
    match response {
        Frame::Response {
            metadata, body, ..
        } => {
            assert_eq!(metadata.status_code, 502);
            assert_eq!(metadata.status_message, "Bad Gateway");
            assert_eq!(body.0, b"Error forwarding request to local service");
        }
        other => panic!("expected RESPONSE, got {other:?}"),
    }

    let _log = recv_frame_matching(&mut ws, |f| matches!(f, Frame::RequestLog { .. })).await;

    let ping = tokio::time::timeout(
        Duration::from_secs(7),
        recv_frame_matching(&mut ws, |f| matches!(f, Frame::LocalServicePing { .. })),
    )
    .await
    .expect("no LOCAL_SERVICE_PING within 7s");

    let Frame::LocalServicePing { local_service_connected, .. } = ping else {
        unreachable!()
    };
    assert!(!local_service_connected);

    session_task.abort();
}

#[tokio::test]
async fn s6_graceful_shutdown_emits_disconnect_and_stops_timers() {
    let (addr, listener) = bind_fake_server().await;
    let local_port = spawn_local_echo_service().await;

    let mut options = TunnelClientOptions::new(local_port, "1.0.0");
    options.server_url = format!("http://{addr}");
    options.reconnect = true;

    let session = std::sync::Arc::new(TunnelSession::new(options));
    let session_for_task = session.clone();
    let session_task = tokio::spawn(async move { session_for_task.connect().await });

    let mut ws = accept_control_channel(&listener).await;
    let _connect = recv_frame(&mut ws).await;
    send_frame(
        &mut ws,
        Frame::ConnectAck {
            timestamp: 0,
            tunnel_id: "T1".to_string(),
            subdomain: "demo".to_string(),
            public_url: "https://demo.tunnl.fit".to_string(),
        },
    )
    .await;

    await_established(&session).await;

    session.disconnect().await;

    let disconnect = tokio::time::timeout(
        Duration::from_secs(2),
        recv_frame_matching(&mut ws, |f| matches!(f, Frame::Disconnect { .. })),
    )
    .await
    .expect("no DISCONNECT frame received");
    assert!(matches!(
        disconnect,
        Frame::Disconnect { reason: Some(r), .. } if r == "Client disconnect"
    ));

    let result = tokio::time::timeout(Duration::from_secs(2), session_task)
        .await
        .expect("connect() did not return after disconnect")
        .unwrap();
    assert!(result.is_ok());
    assert!(!session.state().await.connected);
}

/// §4.4: `Connecting | channel error, pre-Established | Terminated` rejects
/// the caller's `connect()` directly, with no reconnect attempt at all —
/// distinct from the post-`Established` reconnect-with-backoff path.
#[tokio::test]
async fn connect_fails_fast_when_never_established() {
    let (addr, listener) = bind_fake_server().await;
    // Nothing ever accepts on `listener`, so the handshake can't complete;
    // drop it immediately so the port refuses the connection outright.
    drop(listener);

    let mut options = TunnelClientOptions::new(3000, "1.0.0");
    options.server_url = format!("http://{addr}");
    options.reconnect = true;

    let session = TunnelSession::new(options);

    let result = tokio::time::timeout(Duration::from_secs(2), session.connect())
        .await
        .expect("connect() should reject immediately, not retry with backoff");

    assert!(matches!(result, Err(tunnel_agent::AgentError::Transport(_))));
}

/// S5: ten consecutive failed reconnects exhaust the retry ceiling and
/// `connect()` surfaces a fatal `ExhaustedRetries`. Regression test for the
/// backoff-reset bug that made this branch unreachable.
#[tokio::test(start_paused = true)]
async fn s5_reconnect_exhausts_after_ten_failed_attempts() {
    let (addr, listener) = bind_fake_server().await;
    let local_port = spawn_local_echo_service().await;

    let handshake = tokio::spawn(async move {
        let mut ws = accept_control_channel(&listener).await;
        let _connect = recv_frame(&mut ws).await;
        send_frame(
            &mut ws,
            Frame::ConnectAck {
                timestamp: 0,
                tunnel_id: "T1".to_string(),
                subdomain: "demo".to_string(),
                public_url: "https://demo.tunnl.fit".to_string(),
            },
        )
        .await;
        // Drop the connection and stop listening right after the
        // handshake, so every subsequent reconnect attempt is refused.
        drop(ws);
        drop(listener);
    });

    let mut options = TunnelClientOptions::new(local_port, "1.0.0");
    options.server_url = format!("http://{addr}");
    options.reconnect = true;

    let session = TunnelSession::new(options);
    let result = session.connect().await;
    handshake.await.unwrap();

    assert!(matches!(
        result,
        Err(tunnel_agent::AgentError::ExhaustedRetries { attempts: 10 })
    ));
}
