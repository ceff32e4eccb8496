//! Assistant orchestrator: one dispatcher task that owns the transcript, the
//! tool call table, and the media pipelines, and applies session events,
//! executor completions, and user commands strictly one at a time.

use crate::audio::{
    AudioBackend, CaptureEnd, CapturePipeline, CaptureReport, PlaybackPipeline, open_input_blocking,
    open_output_blocking,
};
use crate::config::HaloConfig;
use crate::error::{HaloError, Result};
use crate::pipeline::messages::Command;
use crate::protocol::ServerEvent;
use crate::runtime::RuntimeEvent;
use crate::session::{LiveSession, SessionState, Transport};
use crate::tools::{ActiveToolCall, TaskExecutor, ToolCallCoordinator, ToolCompletion};
use crate::transcript::{Role, TranscriptAggregator, TranscriptEntry};
use crate::video::{FrameThrottle, encode_jpeg};
use image::RgbImage;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Runtime event broadcast capacity.
const RUNTIME_CHANNEL_SIZE: usize = 256;

/// Handle to a running assistant. Dropping the last handle stops the
/// dispatcher.
pub struct AssistantCoordinator {
    config: HaloConfig,
    session: LiveSession,
    cmd_tx: mpsc::UnboundedSender<Command>,
    runtime_tx: broadcast::Sender<RuntimeEvent>,
    transcript_rx: watch::Receiver<Vec<TranscriptEntry>>,
    tool_rx: watch::Receiver<Option<ActiveToolCall>>,
    recording_rx: watch::Receiver<bool>,
    throttle: Mutex<FrameThrottle>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl AssistantCoordinator {
    /// Build the session and spawn the dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn new(
        config: HaloConfig,
        transport: Arc<dyn Transport>,
        audio: Arc<dyn AudioBackend>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Self {
        let session = LiveSession::with_audio(config.session.clone(), transport, &config.audio);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (runtime_tx, _) = broadcast::channel(RUNTIME_CHANNEL_SIZE);
        let (transcript_tx, transcript_rx) = watch::channel(Vec::new());
        let (tool_tx, tool_rx) = watch::channel(None);
        let (recording_tx, recording_rx) = watch::channel(false);
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let (audio_err_tx, audio_err_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        let tools = ToolCallCoordinator::new(executor, Arc::new(session.clone()), completion_tx);

        let dispatcher = Dispatcher {
            config: config.clone(),
            session: session.clone(),
            audio,
            transcript: TranscriptAggregator::new(),
            tools,
            playback: None,
            capture: None,
            runtime_tx: runtime_tx.clone(),
            transcript_tx,
            tool_tx,
            recording_tx,
            audio_err_tx,
        };
        let channels = Channels {
            commands: cmd_rx,
            events: session.take_events(),
            completions: completion_rx,
            audio_errors: audio_err_rx,
            state: session.subscribe_state(),
        };
        let task = tokio::spawn(dispatcher.run(channels, cancel.clone()));

        Self {
            throttle: Mutex::new(FrameThrottle::from_config(&config.video)),
            config,
            session,
            cmd_tx,
            runtime_tx,
            transcript_rx,
            tool_rx,
            recording_rx,
            cancel,
            task: Some(task),
        }
    }

    /// Open the session. No-op while already connecting or connected.
    pub async fn connect(&self) -> Result<()> {
        let fresh = !self.session.state().is_active();
        self.request(Command::Connect).await??;
        if fresh {
            self.throttle
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .reset();
        }
        Ok(())
    }

    /// Stop capture and playback, release both devices, and close the
    /// session. Idempotent.
    pub async fn disconnect(&self) {
        if self.request(Command::Disconnect).await.is_err() {
            debug!("disconnect after dispatcher stopped");
        }
    }

    /// Start streaming the microphone. No-op if already recording.
    ///
    /// # Errors
    ///
    /// Fails when the session is not connected or the input device cannot
    /// be opened; the session is unaffected either way.
    pub async fn start_recording(&self) -> Result<()> {
        self.request(Command::StartRecording).await?
    }

    pub async fn stop_recording(&self) {
        if self.request(Command::StopRecording).await.is_err() {
            debug!("stop_recording after dispatcher stopped");
        }
    }

    /// Flip recording on or off. Returns the new recording state.
    pub async fn toggle_recording(&self) -> Result<bool> {
        if self.is_recording() {
            self.stop_recording().await;
            Ok(false)
        } else {
            self.start_recording().await?;
            Ok(true)
        }
    }

    /// Send a user text turn and record it in the transcript.
    pub async fn send_text(&self, text: impl Into<String>) -> Result<()> {
        let text = text.into();
        self.request(|reply| Command::SendText(text, reply)).await?
    }

    /// Forward one camera frame as JPEG.
    ///
    /// Returns `Ok(false)` when video is disabled or the frame falls inside
    /// the throttle window.
    pub async fn send_video_frame(&self, frame: RgbImage) -> Result<bool> {
        if !self.config.video.enabled {
            return Ok(false);
        }
        let state = self.session.state();
        if state != SessionState::Connected {
            return Err(HaloError::NotConnected(state.to_string()));
        }
        let admitted = self
            .throttle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .admit(Instant::now());
        if !admitted {
            return Ok(false);
        }

        let quality = self.config.video.jpeg_quality;
        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&frame, quality))
            .await
            .map_err(|e| HaloError::Channel(format!("encoder task failed: {e}")))??;
        self.session.send_image(&jpeg)?;
        debug!(bytes = jpeg.len(), "sent video frame");
        Ok(true)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.runtime_tx.subscribe()
    }

    /// Current transcript snapshot.
    pub fn transcript(&self) -> Vec<TranscriptEntry> {
        self.transcript_rx.borrow().clone()
    }

    pub fn subscribe_transcript(&self) -> watch::Receiver<Vec<TranscriptEntry>> {
        self.transcript_rx.clone()
    }

    /// The most recently issued tool call, if still tracked.
    pub fn active_tool_call(&self) -> Option<ActiveToolCall> {
        self.tool_rx.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.session.subscribe_state()
    }

    pub fn is_recording(&self) -> bool {
        *self.recording_rx.borrow()
    }

    pub fn session_id(&self) -> &str {
        self.session.session_id()
    }

    /// Disconnect and stop the dispatcher.
    pub async fn shutdown(mut self) {
        self.disconnect().await;
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(make(tx))
            .map_err(|_| HaloError::Channel("assistant dispatcher stopped".into()))?;
        rx.await
            .map_err(|_| HaloError::Channel("assistant dispatcher dropped request".into()))
    }
}

impl Drop for AssistantCoordinator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ── Dispatcher ────────────────────────────────────────────────────

struct Channels {
    commands: mpsc::UnboundedReceiver<Command>,
    events: Option<mpsc::UnboundedReceiver<ServerEvent>>,
    completions: mpsc::UnboundedReceiver<ToolCompletion>,
    audio_errors: mpsc::UnboundedReceiver<String>,
    state: watch::Receiver<SessionState>,
}

/// Sole owner of the transcript, the tool table, and both pipelines.
struct Dispatcher {
    config: HaloConfig,
    session: LiveSession,
    audio: Arc<dyn AudioBackend>,
    transcript: TranscriptAggregator,
    tools: ToolCallCoordinator,
    playback: Option<PlaybackPipeline>,
    capture: Option<CapturePipeline>,
    runtime_tx: broadcast::Sender<RuntimeEvent>,
    transcript_tx: watch::Sender<Vec<TranscriptEntry>>,
    tool_tx: watch::Sender<Option<ActiveToolCall>>,
    recording_tx: watch::Sender<bool>,
    audio_err_tx: mpsc::UnboundedSender<String>,
}

impl Dispatcher {
    async fn run(mut self, mut ch: Channels, cancel: CancellationToken) {
        let Some(mut events) = ch.events.take() else {
            error!("session events already taken, dispatcher not started");
            return;
        };
        info!(session_id = %self.session.session_id(), "assistant dispatcher started");

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                cmd = ch.commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => break,
                },
                Some(event) = events.recv() => self.on_event(event),
                Some(completion) = ch.completions.recv() => self.on_completion(completion),
                changed = ch.state.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *ch.state.borrow_and_update();
                    self.on_state(state).await;
                }
                report = capture_finished(&mut self.capture) => self.on_capture_end(report),
                Some(message) = ch.audio_errors.recv() => {
                    self.emit(RuntimeEvent::AudioError(message));
                }
            }
        }

        self.teardown().await;
        info!("assistant dispatcher stopped");
    }

    // ── Commands ──────────────────────────────────────────────────

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Connect(reply) => {
                let result = self.connect().await;
                let _ = reply.send(result);
            }
            Command::Disconnect(reply) => {
                self.teardown().await;
                let _ = reply.send(());
            }
            Command::StartRecording(reply) => {
                let result = self.start_recording().await;
                let _ = reply.send(result);
            }
            Command::StopRecording(reply) => {
                self.stop_recording().await;
                let _ = reply.send(());
            }
            Command::SendText(text, reply) => {
                let result = self.session.send_text(&text);
                if result.is_ok() {
                    self.transcript.add_message(Role::User, text);
                    self.publish_transcript();
                }
                let _ = reply.send(result);
            }
        }
    }

    async fn connect(&mut self) -> Result<()> {
        if self.session.state().is_active() {
            return Ok(());
        }
        // Commands win over state changes, so a failure may not have been
        // handled yet.
        self.release_resources().await;
        if self.playback.is_none() {
            let backend = Arc::clone(&self.audio);
            match open_output_blocking(backend, self.config.audio.clone()).await {
                Ok(device) => {
                    self.playback = Some(PlaybackPipeline::start(
                        device,
                        Some(self.audio_err_tx.clone()),
                    ));
                }
                Err(e) => {
                    warn!("playback unavailable, continuing without speaker: {e}");
                    self.emit(RuntimeEvent::AudioError(e.to_string()));
                }
            }
        }
        self.session.connect()
    }

    async fn start_recording(&mut self) -> Result<()> {
        if self.capture.as_ref().is_some_and(CapturePipeline::is_running) {
            return Ok(());
        }
        let state = self.session.state();
        if state != SessionState::Connected {
            return Err(HaloError::NotConnected(state.to_string()));
        }
        let backend = Arc::clone(&self.audio);
        let device = match open_input_blocking(backend, self.config.audio.clone()).await {
            Ok(device) => device,
            Err(e) => {
                warn!("microphone unavailable: {e}");
                self.emit(RuntimeEvent::AudioError(e.to_string()));
                return Err(e);
            }
        };
        let capture = CapturePipeline::start(
            device,
            self.session.clone(),
            self.config.audio.capture_chunk_bytes(),
        )?;
        self.capture = Some(capture);
        self.set_recording(true);
        Ok(())
    }

    async fn stop_recording(&mut self) {
        if let Some(capture) = self.capture.take() {
            let report = capture.stop().await;
            debug!(chunks = report.chunks_sent, "recording stopped");
        }
        self.set_recording(false);
    }

    /// Close the session and release every resource. Safe to call repeatedly.
    async fn teardown(&mut self) {
        self.release_resources().await;
        self.session.disconnect().await;
    }

    /// Stop both pipelines, drop pending tool calls, and seal the transcript.
    async fn release_resources(&mut self) {
        self.stop_recording().await;
        if let Some(playback) = self.playback.take() {
            playback.shutdown().await;
        }
        if self.tools.in_flight() > 0 {
            info!(in_flight = self.tools.in_flight(), "abandoning tool calls");
        }
        self.tools.clear();
        self.tool_tx.send_replace(None);
        if self.transcript.on_session_ended() {
            self.publish_transcript();
        }
    }

    // ── Session events ────────────────────────────────────────────

    fn on_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::SetupComplete => debug!("session ready"),
            ServerEvent::Audio(pcm) => match &self.playback {
                Some(playback) => playback.enqueue(pcm),
                None => debug!(bytes = pcm.len(), "no playback device, dropping audio"),
            },
            ServerEvent::Text(fragment) => self.transcript.push_text(&fragment),
            ServerEvent::TurnComplete => {
                if self.transcript.on_turn_complete() {
                    self.publish_transcript();
                }
            }
            ServerEvent::ToolCall(request) => {
                let call_id = request.id.clone();
                let line = self.tools.on_tool_call(request);
                self.transcript.add_message(Role::Tool, line);
                self.publish_transcript();
                self.publish_tool(&call_id);
            }
            ServerEvent::ToolCallCancellation(ids) => {
                for call_id in self.tools.on_cancellation(&ids) {
                    self.emit(RuntimeEvent::ToolCallCancelled { call_id });
                }
                self.tool_tx.send_replace(self.tools.active().cloned());
            }
            ServerEvent::InputTranscription(fragment) => {
                self.transcript.append_fragment(Role::User, &fragment);
                self.publish_transcript();
            }
            ServerEvent::OutputTranscription(fragment) => {
                self.transcript.append_fragment(Role::Assistant, &fragment);
                self.publish_transcript();
            }
            ServerEvent::Interrupted => {
                if let Some(playback) = &self.playback {
                    playback.interrupt();
                }
                if self.transcript.on_interrupted() {
                    self.publish_transcript();
                }
            }
            ServerEvent::Error(message) => {
                warn!(%message, "session error");
                self.transcript
                    .add_message(Role::System, format!("error: {message}"));
                self.publish_transcript();
                self.emit(RuntimeEvent::Error(message));
            }
        }
    }

    fn on_completion(&mut self, completion: ToolCompletion) {
        let call_id = completion.call_id.clone();
        if let Some(line) = self.tools.on_completion(completion) {
            self.transcript.add_message(Role::Tool, line);
            self.publish_transcript();
            self.publish_tool(&call_id);
        }
    }

    async fn on_state(&mut self, state: SessionState) {
        info!(%state, "session state changed");
        self.emit(RuntimeEvent::StateChanged(state));
        if state.is_terminal() {
            self.release_resources().await;
        }
    }

    fn on_capture_end(&mut self, report: CaptureReport) {
        self.capture = None;
        info!(chunks = report.chunks_sent, end = ?report.end, "capture ended");
        if let CaptureEnd::Failed(reason) = report.end {
            self.emit(RuntimeEvent::AudioError(reason));
        }
        self.set_recording(false);
    }

    // ── Publishing ────────────────────────────────────────────────

    fn emit(&self, event: RuntimeEvent) {
        // No subscribers is fine.
        let _ = self.runtime_tx.send(event);
    }

    fn publish_transcript(&self) {
        let entries = self.transcript.entries();
        self.transcript_tx.send_replace(entries.to_vec());
        self.emit(RuntimeEvent::TranscriptUpdated {
            len: entries.len(),
            last: entries.last().cloned(),
        });
    }

    fn publish_tool(&self, call_id: &str) {
        if let Some(call) = self.tools.get(call_id) {
            self.emit(RuntimeEvent::ToolCallUpdated(call.clone()));
        }
        self.tool_tx.send_replace(self.tools.active().cloned());
    }

    fn set_recording(&self, active: bool) {
        let changed = self.recording_tx.send_if_modified(|current| {
            let changed = *current != active;
            *current = active;
            changed
        });
        if changed {
            self.emit(RuntimeEvent::RecordingChanged { active });
        }
    }
}

async fn capture_finished(capture: &mut Option<CapturePipeline>) -> CaptureReport {
    match capture {
        Some(capture) => capture.finished().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::session::transport::{MemoryConnection, MemoryTransport, OutboundFrame, TransportEvent};
    use crate::test_utils::{FakeAudioBackend, StaticExecutor};
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        assistant: AssistantCoordinator,
        server: MemoryConnection,
        accept: mpsc::UnboundedReceiver<MemoryConnection>,
        audio: FakeAudioBackend,
    }

    fn test_config() -> HaloConfig {
        let mut config = HaloConfig::default();
        config.session.api_key = "k".into();
        config
    }

    async fn connected(executor: StaticExecutor) -> Harness {
        let (transport, mut accept) = MemoryTransport::new();
        let audio = FakeAudioBackend::new();
        let assistant = AssistantCoordinator::new(
            test_config(),
            Arc::new(transport),
            Arc::new(audio.clone()),
            Arc::new(executor),
        );
        assistant.connect().await.unwrap();
        let server = handshake(&assistant, &mut accept).await;
        Harness {
            assistant,
            server,
            accept,
            audio,
        }
    }

    /// Play the server side of one connection attempt up to `Connected`.
    async fn handshake(
        assistant: &AssistantCoordinator,
        accept: &mut mpsc::UnboundedReceiver<MemoryConnection>,
    ) -> MemoryConnection {
        let mut server = timeout(WAIT, accept.recv()).await.unwrap().unwrap();
        server.events.send(TransportEvent::Opened).unwrap();
        let _setup = server.outbound.recv().await.unwrap();
        server
            .events
            .send(TransportEvent::Frame(r#"{"setupComplete":{}}"#.into()))
            .unwrap();
        let mut state = assistant.subscribe_state();
        timeout(WAIT, state.wait_for(|s| *s == SessionState::Connected))
            .await
            .unwrap()
            .unwrap();
        server
    }

    fn frame(h: &Harness, json: &str) {
        h.server
            .events
            .send(TransportEvent::Frame(json.to_owned()))
            .unwrap();
    }

    async fn wait_transcript(h: &Harness, pred: impl Fn(&[TranscriptEntry]) -> bool) {
        let mut rx = h.assistant.subscribe_transcript();
        timeout(WAIT, rx.wait_for(|t| pred(t)))
            .await
            .expect("transcript timeout")
            .unwrap();
    }

    #[tokio::test]
    async fn text_turn_becomes_one_assistant_entry() {
        let h = connected(StaticExecutor::ok("x")).await;
        frame(&h, r#"{"serverContent":{"modelTurn":{"parts":[{"text":"Hel"}]}}}"#);
        frame(&h, r#"{"serverContent":{"modelTurn":{"parts":[{"text":"lo"}]}}}"#);
        frame(&h, r#"{"serverContent":{"turnComplete":true}}"#);
        wait_transcript(&h, |t| !t.is_empty()).await;
        let t = h.assistant.transcript();
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].role, Role::Assistant);
        assert_eq!(t[0].text, "Hello");
        assert!(t[0].finalized);
    }

    #[tokio::test]
    async fn tool_call_round_trip() {
        let mut h = connected(StaticExecutor::ok("Added.")).await;
        frame(
            &h,
            r#"{"toolCall":{"functionCalls":[{"id":"c1","name":"execute","args":{"task":"add milk to list"}}]}}"#,
        );
        let response = timeout(WAIT, h.server.outbound.recv()).await.unwrap();
        assert_eq!(
            response,
            Some(OutboundFrame::Text(
                r#"{"toolResponse":{"functionResponses":[{"id":"c1","response":{"result":"Added."}}]}}"#
                    .into()
            ))
        );
        wait_transcript(&h, |t| t.iter().any(|e| e.text == "completed: Added.")).await;
        let call = h.assistant.active_tool_call().unwrap();
        assert_eq!(call.call_id, "c1");
        assert_eq!(call.status, crate::tools::ToolCallStatus::Completed);
    }

    #[tokio::test]
    async fn recording_requires_connection() {
        let (transport, _accept) = MemoryTransport::new();
        let assistant = AssistantCoordinator::new(
            test_config(),
            Arc::new(transport),
            Arc::new(FakeAudioBackend::new()),
            Arc::new(StaticExecutor::ok("x")),
        );
        let err = assistant.start_recording().await.unwrap_err();
        assert!(matches!(err, HaloError::NotConnected(_)));
        assert!(!assistant.is_recording());
    }

    #[tokio::test]
    async fn toggle_recording_flips_state() {
        let h = connected(StaticExecutor::ok("x")).await;
        assert!(h.assistant.toggle_recording().await.unwrap());
        assert!(h.assistant.is_recording());
        assert!(!h.assistant.toggle_recording().await.unwrap());
        assert!(!h.assistant.is_recording());
        assert_eq!(h.audio.inputs_released(), 1);
    }

    #[tokio::test]
    async fn missing_microphone_keeps_session_up() {
        let h = connected(StaticExecutor::ok("x")).await;
        h.audio.fail_input("no microphone");
        let mut runtime = h.assistant.subscribe();
        assert!(h.assistant.start_recording().await.is_err());
        assert_eq!(h.assistant.state(), SessionState::Connected);
        let found = timeout(WAIT, async {
            loop {
                if let RuntimeEvent::AudioError(m) = runtime.recv().await.unwrap() {
                    return m;
                }
            }
        })
        .await
        .unwrap();
        assert!(found.contains("no microphone"));
    }

    #[tokio::test]
    async fn disconnect_twice_releases_devices_once() {
        let h = connected(StaticExecutor::ok("x")).await;
        h.assistant.start_recording().await.unwrap();
        h.assistant.disconnect().await;
        h.assistant.disconnect().await;
        assert_eq!(h.assistant.state(), SessionState::Disconnected);
        assert_eq!(h.audio.inputs_released(), 1);
        assert_eq!(h.audio.outputs_released(), 1);
        assert!(!h.assistant.is_recording());
    }

    #[tokio::test]
    async fn transport_failure_finalizes_transcript() {
        let h = connected(StaticExecutor::ok("x")).await;
        frame(&h, r#"{"serverContent":{"outputTranscription":{"text":"Half a sen"}}}"#);
        wait_transcript(&h, |t| !t.is_empty()).await;
        h.server
            .events
            .send(TransportEvent::Failed("connection reset".into()))
            .unwrap();
        wait_transcript(&h, |t| t.iter().any(|e| e.role == Role::System)).await;
        let mut state = h.assistant.subscribe_state();
        timeout(WAIT, state.wait_for(|s| *s == SessionState::Error))
            .await
            .unwrap()
            .unwrap();
        wait_transcript(&h, |t| t.iter().all(|e| e.finalized)).await;
    }

    #[tokio::test]
    async fn video_frames_are_throttled() {
        let mut h = connected(StaticExecutor::ok("x")).await;
        let frame = RgbImage::from_pixel(8, 8, image::Rgb([1, 2, 3]));
        assert!(h.assistant.send_video_frame(frame.clone()).await.unwrap());
        assert!(!h.assistant.send_video_frame(frame).await.unwrap());
        match timeout(WAIT, h.server.outbound.recv()).await.unwrap() {
            Some(OutboundFrame::Text(json)) => {
                let v: serde_json::Value = serde_json::from_str(&json).unwrap();
                assert_eq!(v["realtimeInput"]["mediaChunks"][0]["mimeType"], "image/jpeg");
            }
            other => panic!("expected image frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn user_text_is_sent_and_recorded() {
        let mut h = connected(StaticExecutor::ok("x")).await;
        h.assistant.send_text("what's on my list?").await.unwrap();
        let sent = timeout(WAIT, h.server.outbound.recv()).await.unwrap();
        assert!(matches!(sent, Some(OutboundFrame::Text(ref s)) if s.contains("clientContent")));
        let t = h.assistant.transcript();
        assert_eq!(t.len(), 1);
        assert_eq!(t[0].role, Role::User);
        assert!(t[0].finalized);
    }

    #[tokio::test]
    async fn reconnect_resets_video_throttle() {
        let mut h = connected(StaticExecutor::ok("x")).await;
        let frame = RgbImage::from_pixel(8, 8, image::Rgb([1, 2, 3]));
        assert!(h.assistant.send_video_frame(frame.clone()).await.unwrap());

        h.assistant.disconnect().await;
        h.assistant.connect().await.unwrap();
        let _server = handshake(&h.assistant, &mut h.accept).await;
        assert!(h.assistant.send_video_frame(frame).await.unwrap());
    }

    #[tokio::test]
    async fn reconnect_after_failure_drops_stale_turn_state() {
        let h = connected(StaticExecutor::ok("late").with_delay(Duration::from_secs(5))).await;
        frame(
            &h,
            r#"{"toolCall":{"functionCalls":[{"id":"c1","name":"execute","args":{"task":"slow"}}]}}"#,
        );
        frame(&h, r#"{"serverContent":{"outputTranscription":{"text":"Half a sen"}}}"#);
        wait_transcript(&h, |t| {
            t.iter().any(|e| e.role == Role::Assistant && !e.finalized)
        })
        .await;
        assert!(h.assistant.active_tool_call().is_some());

        h.server
            .events
            .send(TransportEvent::Failed("connection reset".into()))
            .unwrap();
        let mut state = h.assistant.subscribe_state();
        timeout(WAIT, state.wait_for(|s| *s == SessionState::Error))
            .await
            .unwrap()
            .unwrap();
        // Reconnect before the dispatcher necessarily saw the failure.
        h.assistant.connect().await.unwrap();

        assert!(h.assistant.active_tool_call().is_none());
        assert!(h.assistant.transcript().iter().all(|e| e.finalized));
    }

    #[tokio::test]
    async fn slow_device_open_does_not_stall_the_runtime() {
        let (transport, _accept) = MemoryTransport::new();
        let audio = FakeAudioBackend::new().with_open_delay(Duration::from_millis(400));
        let assistant = Arc::new(AssistantCoordinator::new(
            test_config(),
            Arc::new(transport),
            Arc::new(audio),
            Arc::new(StaticExecutor::ok("x")),
        ));
        let connecting = tokio::spawn({
            let assistant = Arc::clone(&assistant);
            async move { assistant.connect().await }
        });

        let started = Instant::now();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(
            started.elapsed() < Duration::from_millis(300),
            "timer starved while the device opened"
        );
        timeout(WAIT, connecting).await.unwrap().unwrap().unwrap();
    }
}
