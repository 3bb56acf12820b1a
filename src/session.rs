//! Session state machine, dispatcher, heartbeat/local-probe engine, and
//! the reconnection supervisor, composed behind a minimal facade (§4.4,
//! §2 components C–G).

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::Engine;
use tokio::sync::{mpsc, Mutex, Notify};
use tracing::{debug, error, info, warn};

use crate::config::TunnelClientOptions;
use crate::error::AgentError;
use crate::forwarder::HttpForwarder;
use crate::message::{
    now_millis, Base64Body, Frame, RequestMetadata, ResponseMetadata,
};
use crate::normalizer::normalize;
use crate::reconnect::Backoff;
use crate::transport::{ControlChannel, ControlChannelWriter, FrameOrNoise};

/// Maximum base64-encoded response body length before a size warning is
/// logged; the frame is still sent (§4.5 step 3).
const RESPONSE_SIZE_WARNING_BYTES: usize = 10 * 1024 * 1024;

/// Coarse lifecycle phase, tracked for logging and tests. The externally
/// observable behavior lives in [`SessionState`] and [`TunnelSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Connecting,
    AwaitingAck,
    Established,
    Disconnected,
    Reconnecting,
    Terminated,
}

/// Mutable session identity and connectivity, mutated by the dispatcher,
/// heartbeat/probe engine, and reconnection supervisor (§3).
#[derive(Debug, Clone)]
pub struct SessionState {
    pub phase: Phase,
    pub connected: bool,
    pub tunnel_id: Option<String>,
    pub subdomain: Option<String>,
    pub public_url: Option<String>,
    pub should_reconnect: bool,
}

impl SessionState {
    fn idle() -> Self {
        Self {
            phase: Phase::Idle,
            connected: false,
            tunnel_id: None,
            subdomain: None,
            public_url: None,
            should_reconnect: true,
        }
    }
}

/// Why a single connection attempt ended.
enum ConnectionEnded {
    /// `disconnect()` was called; the supervisor must not reconnect.
    Graceful,
    /// The channel closed or errored out from under us.
    Dropped,
}

/// Composes the message codec, forwarder, session state, dispatcher,
/// heartbeat/probe engine, and reconnection supervisor behind a minimal
/// `connect`/`disconnect` interface (§2 component G).
pub struct TunnelSession {
    options: TunnelClientOptions,
    forwarder: Arc<HttpForwarder>,
    state: Arc<Mutex<SessionState>>,
    shutdown: Arc<Notify>,
}

impl TunnelSession {
    pub fn new(options: TunnelClientOptions) -> Self {
        let forwarder = Arc::new(HttpForwarder::new(options.local_port));
        Self {
            options,
            forwarder,
            state: Arc::new(Mutex::new(SessionState::idle())),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Snapshot of the current session state, e.g. for a status display.
    pub async fn state(&self) -> SessionState {
        self.state.lock().await.clone()
    }

    /// Connect and run until a fatal retry exhaustion, or until
    /// `disconnect()` is called from another task.
    ///
    /// This is the Reconnection Supervisor (§2 component F): each
    /// dropped connection is retried with exponential backoff, bounded
    /// by [`crate::reconnect::MAX_ATTEMPTS`]. Exhaustion surfaces as
    /// [`AgentError::ExhaustedRetries`] — fatal, per §4.4.
    pub async fn connect(&self) -> Result<(), AgentError> {
        let mut backoff = Backoff::new();
        let mut ever_established = false;

        loop {
            self.state.lock().await.phase = Phase::Connecting;

            match self.run_connection(&mut backoff, &mut ever_established).await {
                Ok(ConnectionEnded::Graceful) => {
                    let mut state = self.state.lock().await;
                    state.phase = Phase::Terminated;
                    state.connected = false;
                    return Ok(());
                }
                Err(e) if !ever_established => {
                    // Connecting, channel error, pre-Established -> Terminated:
                    // reject the caller's connect() directly, no retry (§4.4).
                    let mut state = self.state.lock().await;
                    state.phase = Phase::Terminated;
                    state.connected = false;
                    return Err(e);
                }
                Ok(ConnectionEnded::Dropped) | Err(_) => {
                    let should_reconnect = {
                        let state = self.state.lock().await;
                        state.should_reconnect
                    };

                    if !should_reconnect || !self.options.reconnect {
                        let mut state = self.state.lock().await;
                        state.phase = Phase::Terminated;
                        state.connected = false;
                        return Ok(());
                    }

                    self.state.lock().await.phase = Phase::Disconnected;

                    match backoff.next_delay() {
                        Some(delay) => {
                            self.state.lock().await.phase = Phase::Reconnecting;
                            warn!(
                                attempt = backoff.attempt(),
                                delay_secs = delay.as_secs(),
                                "[Agent] connection lost, reconnecting"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        None => {
                            self.state.lock().await.phase = Phase::Terminated;
                            error!(
                                attempts = backoff.attempt(),
                                "[Agent] exhausted reconnection attempts, giving up"
                            );
                            return Err(AgentError::ExhaustedRetries {
                                attempts: backoff.attempt(),
                            });
                        }
                    }
                }
            }
        }
    }

    /// Request a graceful shutdown: stop reconnecting, best-effort emit
    /// `DISCONNECT`, and close the channel. Non-blocking, per §5.
    pub async fn disconnect(&self) {
        self.state.lock().await.should_reconnect = false;
        self.shutdown.notify_one();
    }

    /// Run a single connection attempt end-to-end: open the channel,
    /// handshake, and dispatch until the channel drops or a graceful
    /// shutdown is requested.
    async fn run_connection(
        &self,
        backoff: &mut Backoff,
        ever_established: &mut bool,
    ) -> Result<ConnectionEnded, AgentError> {
        let url = self.options.control_channel_url()?;
        let mut channel = ControlChannel::connect(&url).await.map_err(|e| {
            warn!(error = %e, "[Agent] failed to open control channel");
            AgentError::Transport(e)
        })?;

        self.state.lock().await.phase = Phase::AwaitingAck;

        channel
            .send(Frame::Connect {
                timestamp: now_millis(),
                token: self.options.token.clone(),
                requested_subdomain: self.options.subdomain.clone(),
                agent_version: self.options.agent_version.clone(),
                local_port: Some(self.options.local_port),
                request_count: None,
            })
            .await
            .map_err(AgentError::Transport)?;

        let ack = channel.recv().await.map_err(AgentError::Transport)?;
        let (tunnel_id, subdomain, public_url) = match ack {
            Some(FrameOrNoise::Frame(Frame::ConnectAck {
                tunnel_id,
                subdomain,
                public_url,
                ..
            })) => (tunnel_id, subdomain, public_url),
            Some(FrameOrNoise::Frame(other)) => {
                return Err(AgentError::Protocol(format!(
                    "expected CONNECT_ACK, got {other:?}"
                )))
            }
            Some(FrameOrNoise::Malformed(e)) => return Err(AgentError::Protocol(e)),
            None => return Err(AgentError::Protocol("channel closed before CONNECT_ACK".into())),
        };

        let public_url = normalize(&self.options.server_url, &subdomain, &public_url);

        {
            let mut state = self.state.lock().await;
            state.phase = Phase::Established;
            state.connected = true;
            state.tunnel_id = Some(tunnel_id.clone());
            state.subdomain = Some(subdomain);
            state.public_url = Some(public_url.clone());
        }

        // Reconnecting | success | Established: retry counter reset by the
        // new CONNECT_ACK (§4.4, §3 invariant).
        *ever_established = true;
        backoff.reset();

        info!("[Agent] tunnel established at {public_url}");

        self.run_established(channel).await
    }

    /// Spawn the heartbeat/local-probe engine and drive the dispatch loop
    /// while `Established`. Every timer handle spawned here is released
    /// before returning, regardless of exit path (§9 "Timers as owned
    /// resources").
    async fn run_established(&self, channel: ControlChannel) -> Result<ConnectionEnded, AgentError> {
        let (outbound_tx, outbound_rx) = mpsc::channel::<Frame>(256);
        let (mut reader, writer) = channel.split();

        let writer_task = tokio::spawn(run_writer(writer, outbound_rx));
        let heartbeat_task = tokio::spawn(run_heartbeat(outbound_tx.clone()));
        let probe_task = tokio::spawn(run_local_probe(
            self.forwarder.clone(),
            self.state.clone(),
            outbound_tx.clone(),
        ));

        let result = loop {
            tokio::select! {
                _ = self.shutdown.notified() => {
                    let _ = outbound_tx
                        .send(Frame::Disconnect {
                            timestamp: now_millis(),
                            reason: Some("Client disconnect".to_string()),
                        })
                        .await;
                    break Ok(ConnectionEnded::Graceful);
                }
                frame = reader.recv() => {
                    match frame {
                        Ok(Some(FrameOrNoise::Frame(frame))) => {
                            if let Err(e) = self
                                .dispatch(frame, &outbound_tx)
                                .await
                            {
                                error!(error = %e, "[Agent] error dispatching frame");
                            }
                        }
                        Ok(Some(FrameOrNoise::Malformed(e))) => {
                            warn!(error = %e, "[Agent] dropping malformed frame");
                        }
                        Ok(None) => {
                            break Ok(ConnectionEnded::Dropped);
                        }
                        Err(e) => {
                            warn!(error = %e, "[Agent] control channel error");
                            break Ok(ConnectionEnded::Dropped);
                        }
                    }
                }
            }
        };

        heartbeat_task.abort();
        probe_task.abort();
        drop(outbound_tx);
        let _ = writer_task.await;

        {
            let mut state = self.state.lock().await;
            state.connected = false;
            state.tunnel_id = None;
            state.subdomain = None;
            state.public_url = None;
        }

        result
    }

    /// Route one decoded inbound frame to its handler (§4.4 Established
    /// transitions, §4.5 request dispatch).
    async fn dispatch(
        &self,
        frame: Frame,
        outbound: &mpsc::Sender<Frame>,
    ) -> Result<(), AgentError> {
        match frame {
            Frame::Request {
                stream_id,
                tunnel_id,
                metadata,
                body,
                ..
            } => {
                let forwarder = self.forwarder.clone();
                let state = self.state.clone();
                let outbound = outbound.clone();
                tokio::spawn(async move {
                    handle_request(forwarder, state, outbound, stream_id, tunnel_id, metadata, body)
                        .await;
                });
                Ok(())
            }
            Frame::Heartbeat { .. } => outbound
                .send(Frame::HeartbeatAck {
                    timestamp: now_millis(),
                })
                .await
                .map_err(|_| AgentError::NotConnected),
            Frame::Error { code, message, .. } => {
                let err = AgentError::Server { code, message };
                error!(error = %err, "[Agent] server reported an error");
                Ok(())
            }
            Frame::Disconnect { reason, .. } => {
                info!(reason = ?reason, "[Agent] server requested disconnect");
                Ok(())
            }
            other => {
                warn!(frame = ?other, "[Agent] dropping unexpected frame in Established state");
                Ok(())
            }
        }
    }
}

/// Drains the outbound queue and writes frames one at a time onto the
/// write half, the single writer required by §5/§9.
async fn run_writer(mut writer: ControlChannelWriter, mut outbound_rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = outbound_rx.recv().await {
        if let Err(e) = writer.send(frame).await {
            debug!(error = %e, "[Agent] failed to write frame, stopping writer");
            break;
        }
    }
    let _ = writer.close().await;
}

/// Emits a `HEARTBEAT` frame every 30s while Established (§4.4).
async fn run_heartbeat(outbound: mpsc::Sender<Frame>) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    interval.tick().await; // first tick fires immediately; skip it
    loop {
        interval.tick().await;
        if outbound
            .send(Frame::Heartbeat {
                timestamp: now_millis(),
            })
            .await
            .is_err()
        {
            break;
        }
    }
}

/// Probes the local service every 5s and pushes liveness upstream (§4.4).
async fn run_local_probe(
    forwarder: Arc<HttpForwarder>,
    state: Arc<Mutex<SessionState>>,
    outbound: mpsc::Sender<Frame>,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;

        let Some(live) = forwarder.probe_liveness().await else {
            continue;
        };

        let tunnel_id = state
            .lock()
            .await
            .tunnel_id
            .clone()
            .unwrap_or_default();

        if outbound
            .send(Frame::LocalServicePing {
                timestamp: now_millis(),
                tunnel_id,
                local_service_connected: live,
            })
            .await
            .is_err()
        {
            break;
        }
    }
}

/// Forward one inbound request and emit its `RESPONSE` + `REQUEST_LOG`
/// (§4.5). Runs as an independent task so requests are processed
/// concurrently even though they arrive serialized on the channel.
#[allow(clippy::too_many_arguments)]
async fn handle_request(
    forwarder: Arc<HttpForwarder>,
    state: Arc<Mutex<SessionState>>,
    outbound: mpsc::Sender<Frame>,
    stream_id: String,
    tunnel_id: String,
    metadata: RequestMetadata,
    body: Base64Body,
) {
    let start = Instant::now();
    let method = metadata.method.clone();
    let path = metadata.path.clone();
    let user_agent = header_value(&metadata.headers, "user-agent");
    let ip_address = header_value(&metadata.headers, "x-forwarded-for");
    let request_host = header_value(&metadata.headers, "host");

    let outcome = forwarder.forward(&metadata, body.0).await;

    let (status_code, response_frame, error_message) = match outcome {
        Ok(response) => {
            let encoded_len = base64::engine::general_purpose::STANDARD
                .encode(&response.body)
                .len();
            if encoded_len > RESPONSE_SIZE_WARNING_BYTES {
                warn!(
                    stream_id,
                    encoded_len, "[Agent] response body exceeds 10 MiB warning threshold"
                );
            }

            let frame = Frame::Response {
                timestamp: now_millis(),
                stream_id: stream_id.clone(),
                metadata: ResponseMetadata {
                    status_code: response.status_code,
                    status_message: response.status_message.clone(),
                    headers: response.headers,
                },
                body: Base64Body(response.body),
            };
            (response.status_code, frame, None)
        }
        Err(err) => {
            let agent_err = AgentError::Forwarder(err);
            warn!(stream_id, error = %agent_err, "[Agent] forwarding request failed");
            let message = agent_err.to_string();
            let frame = Frame::Response {
                timestamp: now_millis(),
                stream_id: stream_id.clone(),
                metadata: ResponseMetadata {
                    status_code: 502,
                    status_message: "Bad Gateway".to_string(),
                    headers: vec![("content-type".to_string(), "text/plain".to_string())],
                },
                body: Base64Body(b"Error forwarding request to local service".to_vec()),
            };
            (502, frame, Some(message))
        }
    };

    if outbound.send(response_frame).await.is_err() {
        return;
    }

    let host = match request_host {
        Some(host) => host,
        None => state
            .lock()
            .await
            .public_url
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
    };

    let log_frame = Frame::RequestLog {
        timestamp: now_millis(),
        tunnel_id,
        method,
        host,
        path,
        status_code,
        response_time: start.elapsed().as_millis() as u64,
        ip_address,
        user_agent,
        error_message,
    };

    let _ = outbound.send(log_frame).await;
}

fn header_value(headers: &[(String, String)], name: &str) -> Option<String> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_session_starts_idle_and_disconnected() {
        let options = TunnelClientOptions::new(3000, "test");
        let session = TunnelSession::new(options);
        let state = session.state().await;
        assert_eq!(state.phase, Phase::Idle);
        assert!(!state.connected);
        assert!(state.tunnel_id.is_none());
    }

    #[test]
    fn header_value_is_case_insensitive() {
        let headers = vec![("Host".to_string(), "demo.tunnl.fit".to_string())];
        assert_eq!(
            header_value(&headers, "host"),
            Some("demo.tunnl.fit".to_string())
        );
    }

    /// Testable property 5: while Established, a `HEARTBEAT` frame is
    /// emitted at least once per 30s ± 10%. Uses paused virtual time so
    /// the cadence is exercised without a real 30s wait.
    #[tokio::test(start_paused = true)]
    async fn heartbeat_fires_at_least_once_per_30_seconds() {
        let (tx, mut rx) = mpsc::channel(8);
        let heartbeat = tokio::spawn(run_heartbeat(tx));

        tokio::time::advance(Duration::from_secs(27)).await;
        assert!(
            rx.try_recv().is_err(),
            "heartbeat fired before the 30s cadence"
        );

        tokio::time::advance(Duration::from_secs(6)).await;
        let frame = rx.recv().await.expect("heartbeat frame within 30s + 10%");
        assert!(matches!(frame, Frame::Heartbeat { .. }));

        tokio::time::advance(Duration::from_secs(30)).await;
        let frame = rx.recv().await.expect("second heartbeat after another 30s");
        assert!(matches!(frame, Frame::Heartbeat { .. }));

        heartbeat.abort();
    }
}
