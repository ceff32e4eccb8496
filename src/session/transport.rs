//! Realtime transport: one bidirectional connection carrying JSON frames.
//!
//! A [`Transport`] drives a single connection attempt. It reports lifecycle
//! and inbound frames on an unbounded event channel (nothing is dropped) and
//! writes whatever arrives on its outbound channel until told to close.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, warn};

/// Lifecycle signals and inbound frames from one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is open and ready for the setup message.
    Opened,
    /// One inbound JSON text frame.
    Frame(String),
    /// The connection closed cleanly.
    Closed,
    /// The connection failed, was refused, or was lost.
    Failed(String),
}

/// Frames written to the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    /// One serialized JSON message.
    Text(String),
    /// Close the connection with a normal close code.
    Close,
}

/// Connection driver contract.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open `url` and pump frames until the connection ends.
    ///
    /// Must emit exactly one of `Closed`/`Failed` as the final event, and
    /// `Opened` before any `Frame`.
    async fn run(
        &self,
        url: String,
        outbound: mpsc::UnboundedReceiver<OutboundFrame>,
        events: mpsc::UnboundedSender<TransportEvent>,
    );
}

// ── WebSocket ─────────────────────────────────────────────────────

/// WebSocket transport built on tokio-tungstenite.
#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn run(
        &self,
        url: String,
        mut outbound: mpsc::UnboundedReceiver<OutboundFrame>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let (ws_stream, _response) = match tokio_tungstenite::connect_async(url.as_str()).await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("websocket connect failed: {e}");
                let _ = events.send(TransportEvent::Failed(format!("connect: {e}")));
                return;
            }
        };

        info!("websocket connection opened");
        let _ = events.send(TransportEvent::Opened);

        let (mut write, mut read) = ws_stream.split();

        loop {
            tokio::select! {
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            let _ = events.send(TransportEvent::Frame(text));
                        }
                        Some(Ok(Message::Binary(data))) => {
                            // JSON control frames may arrive as binary frames.
                            match binary_json_frame(&data) {
                                Some(text) => {
                                    let _ = events.send(TransportEvent::Frame(text));
                                }
                                None => debug!(len = data.len(), "dropping non-JSON binary frame"),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            // tungstenite queued the close reply; push it out.
                            if let Err(e) = write.flush().await {
                                debug!("close reply not delivered: {e}");
                            }
                            let _ = events.send(close_event(frame.as_ref()));
                            return;
                        }
                        Some(Ok(_)) => {} // Ping/Pong handled by tungstenite.
                        Some(Err(e)) => {
                            let _ = events.send(TransportEvent::Failed(format!("read error: {e}")));
                            return;
                        }
                        None => {
                            let _ = events.send(TransportEvent::Failed(
                                "connection lost without close frame".to_owned(),
                            ));
                            return;
                        }
                    }
                }
                out = outbound.recv() => {
                    match out {
                        Some(OutboundFrame::Text(json)) => {
                            if let Err(e) = write.send(Message::Text(json)).await {
                                let _ = events.send(TransportEvent::Failed(format!("send error: {e}")));
                                return;
                            }
                        }
                        Some(OutboundFrame::Close) | None => {
                            let frame = CloseFrame {
                                code: CloseCode::Normal,
                                reason: Cow::Borrowed("client disconnect"),
                            };
                            if let Err(e) = write.send(Message::Close(Some(frame))).await {
                                debug!("close frame not delivered: {e}");
                            }
                            let _ = write.close().await;
                            info!("websocket connection closed by client");
                            let _ = events.send(TransportEvent::Closed);
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Interpret a binary frame as JSON text when it looks like an object.
fn binary_json_frame(data: &[u8]) -> Option<String> {
    if data.first() != Some(&b'{') {
        return None;
    }
    std::str::from_utf8(data).ok().map(str::to_owned)
}

/// Normal and going-away closes are clean; anything else is a failure.
fn close_event(frame: Option<&CloseFrame<'_>>) -> TransportEvent {
    match frame {
        None => TransportEvent::Closed,
        Some(f) if matches!(f.code, CloseCode::Normal | CloseCode::Away) => TransportEvent::Closed,
        Some(f) => TransportEvent::Failed(format!(
            "server closed connection ({}): {}",
            u16::from(f.code),
            f.reason
        )),
    }
}

// ── In-memory ─────────────────────────────────────────────────────

/// Server side of one [`MemoryTransport`] connection.
pub struct MemoryConnection {
    /// Frames the client wrote.
    pub outbound: mpsc::UnboundedReceiver<OutboundFrame>,
    /// Inject lifecycle events and inbound frames.
    pub events: mpsc::UnboundedSender<TransportEvent>,
    /// URL the client asked for.
    pub url: String,
}

/// In-process transport: every connection attempt is handed to the holder
/// of the paired receiver, which plays the server.
pub struct MemoryTransport {
    accept_tx: mpsc::UnboundedSender<MemoryConnection>,
}

impl MemoryTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryConnection>) {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        (Self { accept_tx }, accept_rx)
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn run(
        &self,
        url: String,
        outbound: mpsc::UnboundedReceiver<OutboundFrame>,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) {
        let connection = MemoryConnection {
            outbound,
            events,
            url,
        };
        if let Err(mpsc::error::SendError(conn)) = self.accept_tx.send(connection) {
            let _ = conn
                .events
                .send(TransportEvent::Failed("connection refused".to_owned()));
        }
    }
}
