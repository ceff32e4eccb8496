//! Live session: owns one transport connection at a time, drives the state
//! machine, and exposes decoded server events to a single consumer.

use crate::config::{AudioConfig, SessionConfig};
use crate::error::{HaloError, Result};
use crate::protocol::messages::{
    JPEG_MIME, build_audio_stream_end_message, build_media_message, build_setup_message,
    build_text_message, build_tool_response,
};
use crate::protocol::{ServerEvent, decode_frame};
use crate::session::state::{SessionState, Transition};
use crate::session::transport::{OutboundFrame, Transport, TransportEvent};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Time the transport gets to finish its close handshake.
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Log every Nth outbound audio chunk.
const AUDIO_LOG_INTERVAL: u64 = 50;

struct Connection {
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    cancel: CancellationToken,
    transport_task: JoinHandle<()>,
    driver_task: JoinHandle<()>,
}

struct Inner {
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    session_id: String,
    audio_mime: String,
    state_tx: watch::Sender<SessionState>,
    events_tx: mpsc::UnboundedSender<ServerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<ServerEvent>>>,
    connection: Mutex<Option<Connection>>,
    audio_chunks_sent: AtomicU64,
}

/// Handle to the realtime session. Cheap to clone.
#[derive(Clone)]
pub struct LiveSession {
    inner: Arc<Inner>,
}

impl LiveSession {
    /// Session announcing microphone audio in the default capture format.
    pub fn new(config: SessionConfig, transport: Arc<dyn Transport>) -> Self {
        Self::with_audio(config, transport, &AudioConfig::default())
    }

    /// Session announcing microphone audio as `audio` captures it.
    pub fn with_audio(
        config: SessionConfig,
        transport: Arc<dyn Transport>,
        audio: &AudioConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                session_id: uuid::Uuid::new_v4().to_string(),
                audio_mime: audio.capture_mime_type(),
                state_tx,
                events_tx,
                events_rx: Mutex::new(Some(events_rx)),
                connection: Mutex::new(None),
                audio_chunks_sent: AtomicU64::new(0),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    /// Observe state changes. Intermediate states may be coalesced.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Take the decoded server event stream. Returns `None` after the first call.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<ServerEvent>> {
        self.inner
            .events_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
    }

    /// Open a connection. No-op while already connecting or connected.
    ///
    /// Returns once the attempt has started; completion is observed through
    /// [`subscribe_state`](Self::subscribe_state).
    pub fn connect(&self) -> Result<()> {
        let mut slot = self
            .inner
            .connection
            .lock()
            .map_err(|_| HaloError::Channel("connection lock poisoned".to_owned()))?;

        let current = self.state();
        if current.is_active() {
            debug!(state = %current, "connect ignored, session already active");
            return Ok(());
        }

        let url = self.inner.config.websocket_url()?;

        if let Some(stale) = slot.take() {
            stale.cancel.cancel();
            stale.transport_task.abort();
            stale.driver_task.abort();
        }

        self.transition(Transition::ConnectRequested);
        info!(session_id = %self.inner.session_id, "connecting");

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (tev_tx, tev_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let transport = Arc::clone(&self.inner.transport);
        let transport_task = tokio::spawn(async move {
            transport.run(url, out_rx, tev_tx).await;
        });

        let driver = Driver {
            inner: Arc::clone(&self.inner),
            outbound: out_tx.clone(),
            cancel: cancel.clone(),
            setup_sent: false,
        };
        let driver_task = tokio::spawn(driver.run(tev_rx));

        *slot = Some(Connection {
            outbound: out_tx,
            cancel,
            transport_task,
            driver_task,
        });
        Ok(())
    }

    /// Close the connection and set `Disconnected`. Idempotent.
    ///
    /// The state changes only after the driver has stopped, so a failure
    /// racing the close cannot overwrite `Disconnected`.
    pub async fn disconnect(&self) {
        let connection = self
            .inner
            .connection
            .lock()
            .ok()
            .and_then(|mut slot| slot.take());

        let Some(conn) = connection else {
            self.transition(Transition::DisconnectRequested);
            return;
        };

        conn.cancel.cancel();
        let _ = conn.outbound.send(OutboundFrame::Close);

        let abort = conn.transport_task.abort_handle();
        if tokio::time::timeout(CLOSE_GRACE, conn.transport_task)
            .await
            .is_err()
        {
            warn!("transport did not close within grace period, aborting");
            abort.abort();
        }
        let _ = conn.driver_task.await;
        self.transition(Transition::DisconnectRequested);
        info!(session_id = %self.inner.session_id, "disconnected");
    }

    /// Send one user text turn.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.send_message(&build_text_message(text))
    }

    /// Send one chunk of mono PCM16 microphone audio.
    pub fn send_audio(&self, pcm: &[u8]) -> Result<()> {
        self.send_message(&build_media_message(&self.inner.audio_mime, pcm))?;
        let n = self.inner.audio_chunks_sent.fetch_add(1, Ordering::Relaxed) + 1;
        if n == 1 || n % AUDIO_LOG_INTERVAL == 0 {
            debug!(chunks = n, bytes = pcm.len(), "sent audio chunk");
        }
        Ok(())
    }

    /// Send one JPEG frame.
    pub fn send_image(&self, jpeg: &[u8]) -> Result<()> {
        self.send_message(&build_media_message(JPEG_MIME, jpeg))
    }

    /// Tell the backend the microphone stream ended.
    pub fn send_audio_stream_end(&self) -> Result<()> {
        self.send_message(&build_audio_stream_end_message())
    }

    /// Answer a tool call.
    pub fn send_tool_response(&self, call_id: &str, response: serde_json::Value) -> Result<()> {
        self.send_message(&build_tool_response(call_id, response))
    }

    fn send_message<T: Serialize>(&self, message: &T) -> Result<()> {
        let state = self.state();
        if state != SessionState::Connected {
            return Err(HaloError::NotConnected(state.to_string()));
        }
        let outbound = self
            .inner
            .connection
            .lock()
            .ok()
            .and_then(|slot| slot.as_ref().map(|c| c.outbound.clone()))
            .ok_or_else(|| HaloError::NotConnected(state.to_string()))?;
        let json = serde_json::to_string(message)?;
        outbound
            .send(OutboundFrame::Text(json))
            .map_err(|_| HaloError::Transport("connection writer closed".to_owned()))
    }

    fn transition(&self, transition: Transition) {
        self.inner.transition(transition);
    }
}

impl Inner {
    fn transition(&self, transition: Transition) {
        self.state_tx.send_if_modified(|state| {
            let next = state.apply(transition);
            if next == *state {
                return false;
            }
            debug!(from = %state, to = %next, ?transition, "session state");
            *state = next;
            true
        });
    }
}

// ── Driver ────────────────────────────────────────────────────────

/// Consumes one connection's transport events.
struct Driver {
    inner: Arc<Inner>,
    outbound: mpsc::UnboundedSender<OutboundFrame>,
    cancel: CancellationToken,
    setup_sent: bool,
}

impl Driver {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                ev = events.recv() => ev,
            };
            // A disconnect may land between recv and here.
            if self.cancel.is_cancelled() {
                return;
            }
            match event {
                Some(TransportEvent::Opened) => self.on_opened(),
                Some(TransportEvent::Frame(raw)) => self.on_frame(&raw),
                Some(TransportEvent::Closed) => {
                    info!("connection closed");
                    self.inner.transition(Transition::TransportClosed);
                    return;
                }
                Some(TransportEvent::Failed(reason)) => {
                    self.fail(reason);
                    return;
                }
                None => {
                    self.fail("transport ended without closing".to_owned());
                    return;
                }
            }
        }
    }

    fn on_opened(&mut self) {
        if self.setup_sent {
            return;
        }
        self.setup_sent = true;
        let setup = build_setup_message(&self.inner.config);
        match serde_json::to_string(&setup) {
            Ok(json) => {
                debug!(model = %self.inner.config.model, "sending setup");
                let _ = self.outbound.send(OutboundFrame::Text(json));
            }
            Err(e) => self.fail(format!("failed to encode setup: {e}")),
        }
    }

    fn on_frame(&self, raw: &str) {
        for event in decode_frame(raw) {
            if matches!(event, ServerEvent::SetupComplete) {
                info!("setup acknowledged");
                self.inner.transition(Transition::SetupAcknowledged);
            }
            let _ = self.inner.events_tx.send(event);
        }
    }

    fn fail(&self, reason: String) {
        warn!(%reason, "session failed");
        self.inner.transition(Transition::TransportFailed);
        let _ = self.inner.events_tx.send(ServerEvent::Error(reason));
    }
}
