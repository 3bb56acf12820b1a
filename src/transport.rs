//! Control-channel transport: a single `tokio-tungstenite` WebSocket
//! connection carrying JSON text frames.

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

use crate::message::{decode, encode, Frame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Full-duplex transport for the control channel.
///
/// Reconnection is deliberately not handled here (§6): the caller
/// supervises reconnects and creates a fresh [`ControlChannel`] for each
/// attempt.
pub struct ControlChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ControlChannel {
    /// Open the control channel to `url` (e.g. `wss://tunnl.fit/agent`).
    ///
    /// The initial handshake is bounded to 60s per §6.
    pub async fn connect(url: &str) -> Result<Self, tokio_tungstenite::tungstenite::Error> {
        debug!(url, "opening control channel");

        let connect = connect_async(url);
        let (stream, _response) = tokio::time::timeout(std::time::Duration::from_secs(60), connect)
            .await
            .map_err(|_| {
                tokio_tungstenite::tungstenite::Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "control channel handshake timed out",
                ))
            })??;

        debug!("control channel open");
        Ok(Self { stream })
    }

    /// Send one framed message, stamping it with the current time.
    pub async fn send(&mut self, frame: Frame) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let text = encode(&frame).map_err(|e| {
            tokio_tungstenite::tungstenite::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            ))
        })?;
        trace!(bytes = text.len(), "sending frame");
        self.stream.send(Message::Text(text)).await
    }

    /// Receive the next frame.
    ///
    /// Returns `Ok(None)` when the peer closed the channel cleanly.
    /// A non-JSON or mistagged text message is a [`FrameError::Malformed`]
    /// protocol error (the caller logs and drops it, per §7); the channel
    /// stays open.
    pub async fn recv(&mut self) -> Result<Option<FrameOrNoise>, tokio_tungstenite::tungstenite::Error> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => match decode(&text) {
                    Ok(frame) => return Ok(Some(FrameOrNoise::Frame(frame))),
                    Err(e) => return Ok(Some(FrameOrNoise::Malformed(e.to_string()))),
                },
                Some(Ok(Message::Close(_))) => {
                    debug!("control channel closed by remote");
                    return Ok(None);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(other)) => {
                    debug!(?other, "ignoring non-text control-channel message");
                    continue;
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    }

    /// Close the channel.
    pub async fn close(&mut self) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        self.stream.close(None).await
    }

    /// Split into independent read/write halves so the dispatcher and the
    /// outbound writer can each own one side, satisfying the single-writer
    /// discipline without serializing reads behind the same lock (§9).
    pub fn split(self) -> (ControlChannelReader, ControlChannelWriter) {
        let (sink, stream) = self.stream.split();
        (ControlChannelReader { stream }, ControlChannelWriter { sink })
    }
}

/// Read half of a split [`ControlChannel`].
pub struct ControlChannelReader {
    stream: SplitStream<WsStream>,
}

impl ControlChannelReader {
    /// Receive the next frame; see [`ControlChannel::recv`].
    pub async fn recv(&mut self) -> Result<Option<FrameOrNoise>, tokio_tungstenite::tungstenite::Error> {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => match decode(&text) {
                    Ok(frame) => return Ok(Some(FrameOrNoise::Frame(frame))),
                    Err(e) => return Ok(Some(FrameOrNoise::Malformed(e.to_string()))),
                },
                Some(Ok(Message::Close(_))) => {
                    debug!("control channel closed by remote");
                    return Ok(None);
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(other)) => {
                    debug!(?other, "ignoring non-text control-channel message");
                    continue;
                }
                Some(Err(e)) => return Err(e),
                None => return Ok(None),
            }
        }
    }
}

/// Write half of a split [`ControlChannel`].
pub struct ControlChannelWriter {
    sink: SplitSink<WsStream, Message>,
}

impl ControlChannelWriter {
    /// Send one framed message; see [`ControlChannel::send`].
    pub async fn send(&mut self, frame: Frame) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let text = encode(&frame).map_err(|e| {
            tokio_tungstenite::tungstenite::Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                e.to_string(),
            ))
        })?;
        trace!(bytes = text.len(), "sending frame");
        self.sink.send(Message::Text(text)).await
    }

    /// Close the channel.
    pub async fn close(&mut self) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        self.sink.close().await
    }
}

/// The result of polling the channel for the next message.
#[derive(Debug)]
pub enum FrameOrNoise {
    Frame(Frame),
    /// Text message that failed to decode (§7 `ProtocolError`).
    Malformed(String),
}
