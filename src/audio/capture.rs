//! Microphone capture pipeline.
//!
//! Reads fixed-size PCM16 chunks from a [`CaptureDevice`] and forwards each
//! one to the session. Runs until stopped, until the session leaves
//! `Connected`, or until the device ends or fails. The device is released on
//! every exit path.

use crate::audio::device::CaptureDevice;
use crate::error::{HaloError, Result};
use crate::session::{LiveSession, SessionState};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why a capture run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEnd {
    /// `stop()` was called.
    Stopped,
    /// The session left `Connected`.
    SessionEnded,
    /// The device reported end of stream.
    DeviceEnded,
    /// The device or the session send failed.
    Failed(String),
}

/// Summary of one capture run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub chunks_sent: u64,
    pub end: CaptureEnd,
}

/// A running capture loop.
pub struct CapturePipeline {
    cancel: CancellationToken,
    task: Option<JoinHandle<CaptureReport>>,
}

impl CapturePipeline {
    /// Start capturing into `session` in chunks of `chunk_bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`HaloError::NotConnected`] unless the session is connected;
    /// the device is released in that case.
    pub fn start(
        mut device: Box<dyn CaptureDevice>,
        session: LiveSession,
        chunk_bytes: usize,
    ) -> Result<Self> {
        let state = session.state();
        if state != SessionState::Connected {
            device.release();
            return Err(HaloError::NotConnected(state.to_string()));
        }
        if chunk_bytes == 0 {
            device.release();
            return Err(HaloError::Audio("capture chunk size must be non-zero".into()));
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_capture(device, session, chunk_bytes, cancel.clone()));
        info!(chunk_bytes, "capture started");
        Ok(Self {
            cancel,
            task: Some(task),
        })
    }

    /// Stop capturing and wait for the device to be released.
    pub async fn stop(mut self) -> CaptureReport {
        self.cancel.cancel();
        self.join().await
    }

    /// Wait for the run to end on its own. Cancel-safe.
    ///
    /// Resolves once; later calls pend forever.
    pub async fn finished(&mut self) -> CaptureReport {
        let Some(task) = self.task.as_mut() else {
            return std::future::pending().await;
        };
        let result = task.await;
        self.task = None;
        report_from(result)
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|t| !t.is_finished())
    }

    async fn join(&mut self) -> CaptureReport {
        let Some(task) = self.task.take() else {
            return CaptureReport {
                chunks_sent: 0,
                end: CaptureEnd::Stopped,
            };
        };
        report_from(task.await)
    }
}

fn report_from(
    result: std::result::Result<CaptureReport, tokio::task::JoinError>,
) -> CaptureReport {
    match result {
        Ok(report) => report,
        Err(e) => CaptureReport {
            chunks_sent: 0,
            end: CaptureEnd::Failed(format!("capture task failed: {e}")),
        },
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_capture(
    mut device: Box<dyn CaptureDevice>,
    session: LiveSession,
    chunk_bytes: usize,
    cancel: CancellationToken,
) -> CaptureReport {
    let mut state_rx = session.subscribe_state();
    let mut chunk = vec![0u8; chunk_bytes];
    let mut filled = 0usize;
    let mut chunks_sent = 0u64;

    let end = loop {
        if *state_rx.borrow_and_update() != SessionState::Connected {
            break CaptureEnd::SessionEnded;
        }

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => break CaptureEnd::Stopped,
            changed = state_rx.changed() => {
                if changed.is_err() {
                    break CaptureEnd::SessionEnded;
                }
                continue;
            }
            r = device.read(&mut chunk[filled..]) => r,
        };

        match read {
            Ok(0) => break CaptureEnd::DeviceEnded,
            Ok(n) => {
                filled += n;
                if filled == chunk_bytes {
                    if let Err(e) = session.send_audio(&chunk) {
                        break send_failure(e);
                    }
                    chunks_sent += 1;
                    filled = 0;
                }
            }
            Err(e) => break CaptureEnd::Failed(e.to_string()),
        }
    };

    device.release();

    // Flush the trailing short chunk and mark end of input.
    if matches!(end, CaptureEnd::Stopped | CaptureEnd::DeviceEnded)
        && session.state() == SessionState::Connected
    {
        if filled > 0 {
            match session.send_audio(&chunk[..filled]) {
                Ok(()) => chunks_sent += 1,
                Err(e) => debug!("final chunk not sent: {e}"),
            }
        }
        if let Err(e) = session.send_audio_stream_end() {
            debug!("audio stream end not sent: {e}");
        }
    }

    match &end {
        CaptureEnd::Failed(reason) => warn!(%reason, chunks_sent, "capture failed"),
        other => info!(end = ?other, chunks_sent, "capture stopped"),
    }

    CaptureReport { chunks_sent, end }
}

/// A send fails either because the session went away or because of a local
/// fault; only the latter is reported as a capture failure.
fn send_failure(e: HaloError) -> CaptureEnd {
    match e {
        HaloError::NotConnected(_) => CaptureEnd::SessionEnded,
        e if e.is_session_fatal() => {
            debug!("session transport gone: {e}");
            CaptureEnd::SessionEnded
        }
        other => CaptureEnd::Failed(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::config::SessionConfig;
    use crate::session::transport::{MemoryConnection, MemoryTransport, OutboundFrame, TransportEvent};
    use crate::test_utils::ScriptedCapture;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    async fn connected_session() -> (LiveSession, MemoryConnection) {
        let (transport, mut accept) = MemoryTransport::new();
        let config = SessionConfig {
            api_key: "k".into(),
            ..SessionConfig::default()
        };
        let session = LiveSession::new(config, Arc::new(transport));
        session.connect().unwrap();
        let mut conn = accept.recv().await.unwrap();
        conn.events.send(TransportEvent::Opened).unwrap();
        let _setup = conn.outbound.recv().await.unwrap();
        conn.events
            .send(TransportEvent::Frame(r#"{"setupComplete":{}}"#.into()))
            .unwrap();
        let mut rx = session.subscribe_state();
        timeout(WAIT, rx.wait_for(|s| *s == SessionState::Connected))
            .await
            .unwrap()
            .unwrap();
        (session, conn)
    }

    async fn outbound_json(conn: &mut MemoryConnection) -> serde_json::Value {
        match timeout(WAIT, conn.outbound.recv()).await.unwrap() {
            Some(OutboundFrame::Text(s)) => serde_json::from_str(&s).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn refuses_to_start_when_not_connected() {
        let (transport, _accept) = MemoryTransport::new();
        let session = LiveSession::new(SessionConfig::default(), Arc::new(transport));
        let (device, released) = ScriptedCapture::new(vec![vec![0; 10]]);
        let err = CapturePipeline::start(Box::new(device), session, 4).err();
        assert!(matches!(err, Some(HaloError::NotConnected(_))));
        assert!(released.is_released());
    }

    #[tokio::test]
    async fn sends_full_chunks_then_short_tail() {
        let (session, mut conn) = connected_session().await;
        // 7000 bytes -> 3200 + 3200 + 600
        let (device, released) = ScriptedCapture::new(vec![vec![1u8; 7000]]);
        let mut capture = CapturePipeline::start(Box::new(device), session, 3200).unwrap();

        let report = timeout(WAIT, capture.finished()).await.unwrap();
        assert_eq!(report.end, CaptureEnd::DeviceEnded);
        assert_eq!(report.chunks_sent, 3);
        assert!(released.is_released());

        let mut sizes = Vec::new();
        for _ in 0..3 {
            let v = outbound_json(&mut conn).await;
            let data = v["realtimeInput"]["mediaChunks"][0]["data"].as_str().unwrap();
            use base64::Engine;
            sizes.push(
                base64::engine::general_purpose::STANDARD
                    .decode(data)
                    .unwrap()
                    .len(),
            );
        }
        assert_eq!(sizes, vec![3200, 3200, 600]);
        let end = outbound_json(&mut conn).await;
        assert_eq!(end["realtimeInput"]["audioStreamEnd"], true);
    }

    #[tokio::test]
    async fn stop_releases_device() {
        let (session, _conn) = connected_session().await;
        let (device, released) = ScriptedCapture::endless();
        let capture = CapturePipeline::start(Box::new(device), session, 3200).unwrap();
        let report = timeout(WAIT, capture.stop()).await.unwrap();
        assert_eq!(report.end, CaptureEnd::Stopped);
        assert!(released.is_released());
    }

    #[tokio::test]
    async fn disconnect_ends_capture() {
        let (session, _conn) = connected_session().await;
        let (device, released) = ScriptedCapture::endless();
        let mut capture =
            CapturePipeline::start(Box::new(device), session.clone(), 3200).unwrap();
        session.disconnect().await;
        let report = timeout(WAIT, capture.finished()).await.unwrap();
        assert_eq!(report.end, CaptureEnd::SessionEnded);
        assert!(released.is_released());
    }

    #[tokio::test]
    async fn device_error_is_reported() {
        let (session, _conn) = connected_session().await;
        let (device, released) = ScriptedCapture::failing("mic unplugged");
        let mut capture = CapturePipeline::start(Box::new(device), session, 3200).unwrap();
        let report = timeout(WAIT, capture.finished()).await.unwrap();
        assert!(matches!(report.end, CaptureEnd::Failed(ref m) if m.contains("mic unplugged")));
        assert!(released.is_released());
    }

    #[tokio::test]
    async fn lost_transport_ends_capture_quietly() {
        let (session, conn) = connected_session().await;
        // The writer side goes away while the session still reads Connected.
        drop(conn.outbound);
        let (device, released) = ScriptedCapture::new(vec![vec![0u8; 3200]]);
        let mut capture = CapturePipeline::start(Box::new(device), session, 3200).unwrap();
        let report = timeout(WAIT, capture.finished()).await.unwrap();
        assert_eq!(report.end, CaptureEnd::SessionEnded);
        assert_eq!(report.chunks_sent, 0);
        assert!(released.is_released());
    }
}
