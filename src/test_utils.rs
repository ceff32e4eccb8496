//! In-memory fakes for the audio devices, the task executor, and the tool
//! response sink.
//!
//! Public so integration tests under `tests/` can drive the assistant
//! without hardware or network access.

use crate::audio::{AudioBackend, CaptureDevice, PlaybackDevice};
use crate::config::AudioConfig;
use crate::error::{ExecutorError, HaloError, Result};
use crate::tools::{TaskExecutor, ToolResponder};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Pacing for [`ScriptedCapture::endless`] reads.
const ENDLESS_READ_INTERVAL: Duration = Duration::from_millis(10);

// ── Release tracking ──────────────────────────────────────────────

/// Observes whether a fake device was released.
#[derive(Debug, Clone, Default)]
pub struct ReleaseFlag(Arc<AtomicBool>);

impl ReleaseFlag {
    pub fn is_released(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Marks the flag and bumps the shared counter on the first release only.
#[derive(Debug, Default)]
struct Release {
    flag: ReleaseFlag,
    counter: Option<Arc<AtomicUsize>>,
}

impl Release {
    fn with_counter(counter: Arc<AtomicUsize>) -> Self {
        Self {
            flag: ReleaseFlag::default(),
            counter: Some(counter),
        }
    }

    fn release(&self) {
        let first = !self.flag.0.swap(true, Ordering::SeqCst);
        if first && let Some(counter) = &self.counter {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    }
}

// ── Capture ───────────────────────────────────────────────────────

enum Script {
    Chunks(VecDeque<Vec<u8>>),
    Endless,
    Fail(String),
}

/// Capture device that replays a fixed script.
pub struct ScriptedCapture {
    script: Script,
    release: Release,
}

impl ScriptedCapture {
    /// Yields the given bytes, then reports end of stream.
    pub fn new(chunks: Vec<Vec<u8>>) -> (Self, ReleaseFlag) {
        Self::build(Script::Chunks(chunks.into()), Release::default())
    }

    /// Yields silence forever, one buffer every few milliseconds.
    pub fn endless() -> (Self, ReleaseFlag) {
        Self::build(Script::Endless, Release::default())
    }

    /// Fails the first read with `message`.
    pub fn failing(message: &str) -> (Self, ReleaseFlag) {
        Self::build(Script::Fail(message.to_owned()), Release::default())
    }

    fn build(script: Script, release: Release) -> (Self, ReleaseFlag) {
        let flag = release.flag.clone();
        (Self { script, release }, flag)
    }
}

#[async_trait]
impl CaptureDevice for ScriptedCapture {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.script {
            Script::Chunks(chunks) => {
                tokio::task::yield_now().await;
                let Some(front) = chunks.front_mut() else {
                    return Ok(0);
                };
                let n = front.len().min(buf.len());
                buf[..n].copy_from_slice(&front[..n]);
                front.drain(..n);
                if front.is_empty() {
                    chunks.pop_front();
                }
                Ok(n)
            }
            Script::Endless => {
                tokio::time::sleep(ENDLESS_READ_INTERVAL).await;
                buf.fill(0);
                Ok(buf.len())
            }
            Script::Fail(message) => {
                tokio::task::yield_now().await;
                Err(HaloError::Audio(message.clone()))
            }
        }
    }

    fn release(&mut self) {
        self.release.release();
    }
}

// ── Playback ──────────────────────────────────────────────────────

#[derive(Default)]
struct LogInner {
    writes: Mutex<Vec<Vec<u8>>>,
    started: AtomicUsize,
    changed: Notify,
}

/// What a [`RecordingPlayback`] was asked to play.
#[derive(Clone)]
pub struct PlaybackLog {
    inner: Arc<LogInner>,
    released: ReleaseFlag,
}

impl PlaybackLog {
    /// Chunks that were written successfully, in order.
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.inner
            .writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_released(&self) -> bool {
        self.released.is_released()
    }

    /// Wait until at least `n` chunks were written successfully.
    pub async fn wait_for_writes(&self, n: usize) {
        self.wait_until(|inner| {
            inner
                .writes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
                >= n
        })
        .await;
    }

    /// Wait until at least `n` writes have begun.
    pub async fn wait_for_started(&self, n: usize) {
        self.wait_until(|inner| inner.started.load(Ordering::SeqCst) >= n)
            .await;
    }

    async fn wait_until(&self, done: impl Fn(&LogInner) -> bool) {
        loop {
            let notified = self.inner.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if done(&self.inner) {
                return;
            }
            notified.await;
        }
    }
}

/// Playback device that records every chunk, optionally taking `delay` per
/// write to simulate real-time output.
pub struct RecordingPlayback {
    inner: Arc<LogInner>,
    delay: Duration,
    fail_next: bool,
    release: Release,
}

impl RecordingPlayback {
    pub fn new(delay: Duration) -> (Self, PlaybackLog) {
        Self::build(delay, false, Release::default())
    }

    /// The first write fails with "device busy"; later writes succeed.
    pub fn failing_first(delay: Duration) -> (Self, PlaybackLog) {
        Self::build(delay, true, Release::default())
    }

    fn build(delay: Duration, fail_next: bool, release: Release) -> (Self, PlaybackLog) {
        let inner = Arc::new(LogInner::default());
        let log = PlaybackLog {
            inner: inner.clone(),
            released: release.flag.clone(),
        };
        let device = Self {
            inner,
            delay,
            fail_next,
            release,
        };
        (device, log)
    }
}

#[async_trait]
impl PlaybackDevice for RecordingPlayback {
    async fn write(&mut self, pcm: &[u8]) -> Result<()> {
        self.inner.started.fetch_add(1, Ordering::SeqCst);
        self.inner.changed.notify_waiters();
        if self.delay.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.delay).await;
        }
        if std::mem::take(&mut self.fail_next) {
            return Err(HaloError::Audio("device busy".into()));
        }
        self.inner
            .writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(pcm.to_vec());
        self.inner.changed.notify_waiters();
        Ok(())
    }

    fn release(&mut self) {
        self.release.release();
    }
}

// ── Backend ───────────────────────────────────────────────────────

/// Audio backend handing out fake devices. Inputs yield silence forever;
/// outputs record what they play, instantly unless a delay is set.
#[derive(Clone, Default)]
pub struct FakeAudioBackend {
    input_error: Arc<Mutex<Option<String>>>,
    open_delay: Duration,
    output_delay: Duration,
    outputs: Arc<Mutex<Vec<PlaybackLog>>>,
    inputs_released: Arc<AtomicUsize>,
    outputs_released: Arc<AtomicUsize>,
}

impl FakeAudioBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every device open block the calling thread for `delay`, like a
    /// slow audio host.
    pub fn with_open_delay(mut self, delay: Duration) -> Self {
        self.open_delay = delay;
        self
    }

    /// Make every playback write take `delay`.
    pub fn with_output_delay(mut self, delay: Duration) -> Self {
        self.output_delay = delay;
        self
    }

    /// Log of the most recently opened playback device.
    pub fn last_output(&self) -> Option<PlaybackLog> {
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last()
            .cloned()
    }

    /// Make every later `open_input` fail with `message`.
    pub fn fail_input(&self, message: &str) {
        *self
            .input_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(message.to_owned());
    }

    /// Number of capture devices released so far.
    pub fn inputs_released(&self) -> usize {
        self.inputs_released.load(Ordering::SeqCst)
    }

    /// Number of playback devices released so far.
    pub fn outputs_released(&self) -> usize {
        self.outputs_released.load(Ordering::SeqCst)
    }
}

impl AudioBackend for FakeAudioBackend {
    fn open_input(&self, _config: &AudioConfig) -> Result<Box<dyn CaptureDevice>> {
        std::thread::sleep(self.open_delay);
        let error = self
            .input_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(message) = error {
            return Err(HaloError::Audio(message));
        }
        let (device, _) = ScriptedCapture::build(
            Script::Endless,
            Release::with_counter(self.inputs_released.clone()),
        );
        Ok(Box::new(device))
    }

    fn open_output(&self, _config: &AudioConfig) -> Result<Box<dyn PlaybackDevice>> {
        std::thread::sleep(self.open_delay);
        let (device, log) = RecordingPlayback::build(
            self.output_delay,
            false,
            Release::with_counter(self.outputs_released.clone()),
        );
        self.outputs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(log);
        Ok(Box::new(device))
    }

    fn input_devices(&self) -> Result<Vec<String>> {
        Ok(vec!["Fake Microphone".to_owned()])
    }

    fn output_devices(&self) -> Result<Vec<String>> {
        Ok(vec!["Fake Speaker".to_owned()])
    }
}

// ── Tools ─────────────────────────────────────────────────────────

/// Executor that returns a fixed result, optionally after a delay.
#[derive(Clone)]
pub struct StaticExecutor {
    result: std::result::Result<String, ExecutorError>,
    delay: Duration,
    calls: Arc<AtomicUsize>,
}

impl StaticExecutor {
    pub fn ok(content: &str) -> Self {
        Self::with_result(Ok(content.to_owned()))
    }

    pub fn err(error: ExecutorError) -> Self {
        Self::with_result(Err(error))
    }

    fn with_result(result: std::result::Result<String, ExecutorError>) -> Self {
        Self {
            result,
            delay: Duration::ZERO,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Shared counter of `execute_task` invocations.
    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl TaskExecutor for StaticExecutor {
    async fn execute_task(&self, _task: &str) -> std::result::Result<String, ExecutorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.result.clone()
    }
}

/// Collects tool responses instead of sending them.
#[derive(Default)]
pub struct RecordingResponder {
    responses: Mutex<Vec<(String, serde_json::Value)>>,
}

impl RecordingResponder {
    pub fn responses(&self) -> Vec<(String, serde_json::Value)> {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ToolResponder for RecordingResponder {
    fn send_tool_response(&self, call_id: &str, response: serde_json::Value) -> Result<()> {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((call_id.to_owned(), response));
        Ok(())
    }
}
