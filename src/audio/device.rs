//! Audio device contracts and the cpal backend.
//!
//! Devices speak 16-bit little-endian mono PCM. cpal streams are not `Send`,
//! so each opened device owns a dedicated thread that holds the stream and
//! exits when the device is released.

use crate::audio::{downsample, f32_to_pcm16, pcm16_to_f32, to_mono};
use crate::config::AudioConfig;
use crate::error::{HaloError, Result};
use async_trait::async_trait;
use cpal::StreamConfig;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Microphone source.
#[async_trait]
pub trait CaptureDevice: Send {
    /// Read up to `buf.len()` bytes of PCM16 audio.
    ///
    /// Returns `Ok(0)` once the source is exhausted. Must be cancel-safe.
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Stop the source and free the device. Idempotent.
    fn release(&mut self);
}

/// Speaker sink.
#[async_trait]
pub trait PlaybackDevice: Send {
    /// Play `pcm`, returning once it has been rendered.
    async fn write(&mut self, pcm: &[u8]) -> Result<()>;

    /// Stop the sink and free the device. Idempotent.
    fn release(&mut self);
}

/// Opens devices and lists what is available.
///
/// Opening may block while the host starts a stream; async callers go
/// through [`open_input_blocking`] and [`open_output_blocking`].
pub trait AudioBackend: Send + Sync {
    fn open_input(&self, config: &AudioConfig) -> Result<Box<dyn CaptureDevice>>;
    fn open_output(&self, config: &AudioConfig) -> Result<Box<dyn PlaybackDevice>>;
    fn input_devices(&self) -> Result<Vec<String>>;
    fn output_devices(&self) -> Result<Vec<String>>;
}

/// Open the input device on the blocking pool.
///
/// # Errors
///
/// Returns the backend's error, or [`HaloError::Audio`] if the open task
/// itself failed.
pub async fn open_input_blocking(
    backend: Arc<dyn AudioBackend>,
    config: AudioConfig,
) -> Result<Box<dyn CaptureDevice>> {
    tokio::task::spawn_blocking(move || backend.open_input(&config))
        .await
        .map_err(|e| HaloError::Audio(format!("input open task failed: {e}")))?
}

/// Open the output device on the blocking pool.
///
/// # Errors
///
/// Returns the backend's error, or [`HaloError::Audio`] if the open task
/// itself failed.
pub async fn open_output_blocking(
    backend: Arc<dyn AudioBackend>,
    config: AudioConfig,
) -> Result<Box<dyn PlaybackDevice>> {
    tokio::task::spawn_blocking(move || backend.open_output(&config))
        .await
        .map_err(|e| HaloError::Audio(format!("output open task failed: {e}")))?
}

// ── cpal backend ──────────────────────────────────────────────────

/// System audio through cpal's default host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

impl AudioBackend for CpalBackend {
    fn open_input(&self, config: &AudioConfig) -> Result<Box<dyn CaptureDevice>> {
        Ok(Box::new(CpalCapture::open(config)?))
    }

    fn open_output(&self, config: &AudioConfig) -> Result<Box<dyn PlaybackDevice>> {
        Ok(Box::new(CpalPlayback::open(config)?))
    }

    fn input_devices(&self) -> Result<Vec<String>> {
        list_input_devices()
    }

    fn output_devices(&self) -> Result<Vec<String>> {
        list_output_devices()
    }
}

/// Names of the available input devices.
///
/// # Errors
///
/// Returns an error if devices cannot be enumerated.
fn list_input_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .input_devices()
        .map_err(|e| HaloError::Audio(format!("cannot enumerate devices: {e}")))?;
    Ok(devices
        .filter_map(|d| d.description().ok().map(|desc| desc.name().to_owned()))
        .collect())
}

/// Names of the available output devices.
///
/// # Errors
///
/// Returns an error if devices cannot be enumerated.
fn list_output_devices() -> Result<Vec<String>> {
    let host = cpal::default_host();
    let devices = host
        .output_devices()
        .map_err(|e| HaloError::Audio(format!("cannot enumerate devices: {e}")))?;
    Ok(devices
        .filter_map(|d| d.description().ok().map(|desc| desc.name().to_owned()))
        .collect())
}

fn device_name(device: &cpal::Device) -> String {
    device
        .description()
        .map(|d| d.name().to_owned())
        .unwrap_or_else(|_| "<unknown>".into())
}

fn find_input(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .input_devices()
            .map_err(|e| HaloError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .is_some_and(|desc| desc.name() == name)
            })
            .ok_or_else(|| HaloError::Audio(format!("input device '{name}' not found"))),
        None => host
            .default_input_device()
            .ok_or_else(|| HaloError::Audio("no default input device".into())),
    }
}

fn find_output(name: Option<&str>) -> Result<cpal::Device> {
    let host = cpal::default_host();
    match name {
        Some(name) => host
            .output_devices()
            .map_err(|e| HaloError::Audio(format!("cannot enumerate devices: {e}")))?
            .find(|d| {
                d.description()
                    .ok()
                    .is_some_and(|desc| desc.name() == name)
            })
            .ok_or_else(|| HaloError::Audio(format!("output device '{name}' not found"))),
        None => host
            .default_output_device()
            .ok_or_else(|| HaloError::Audio("no default output device".into())),
    }
}

/// Thread that owns a cpal stream until told to stop.
struct StreamThread {
    stop_tx: crossbeam_channel::Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl StreamThread {
    /// Spawn `build` on a new thread and wait for it to report readiness.
    fn spawn<F>(name: &str, build: F) -> Result<Self>
    where
        F: FnOnce() -> std::result::Result<cpal::Stream, String> + Send + 'static,
    {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::result::Result<(), String>>(1);

        let handle = std::thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(format!("failed to start stream: {e}")));
                    return;
                }
                let _ = ready_tx.send(Ok(()));
                // Hold the stream alive until released.
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| HaloError::Audio(format!("failed to spawn audio thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                stop_tx,
                handle: Some(handle),
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(HaloError::Audio(e))
            }
            Err(_) => {
                let _ = handle.join();
                Err(HaloError::Audio("audio thread exited during startup".into()))
            }
        }
    }

    /// Signal the thread to drop its stream. Inside a runtime the join runs
    /// on the blocking pool, since closing a cpal stream can wait on the
    /// audio host.
    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let _ = self.stop_tx.send(());
        let join = move || {
            if handle.join().is_err() {
                error!("audio thread panicked");
            }
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(join);
            }
            Err(_) => join(),
        }
    }
}

impl Drop for StreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Capture ───────────────────────────────────────────────────────

/// Microphone capture via cpal.
///
/// Captures at the device's native rate and channel count, then mixes to
/// mono and downsamples to the configured capture rate.
pub struct CpalCapture {
    thread: StreamThread,
    rx: mpsc::Receiver<Vec<u8>>,
    pending: VecDeque<u8>,
}

impl CpalCapture {
    /// Open the configured (or default) input device.
    ///
    /// # Errors
    ///
    /// Returns an error if no input device is available or the stream
    /// cannot be started.
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let device = find_input(config.input_device.as_deref())?;
        info!("using input device: {}", device_name(&device));

        let default_config = device
            .default_input_config()
            .map_err(|e| HaloError::Audio(format!("no default input config: {e}")))?;
        let native_rate = default_config.sample_rate();
        let native_channels = default_config.channels();
        let target_rate = config.capture_sample_rate;

        let stream_config = StreamConfig {
            channels: native_channels,
            sample_rate: native_rate,
            buffer_size: cpal::BufferSize::Default,
        };
        info!(
            native_rate,
            native_channels, target_rate, "starting audio capture"
        );

        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);

        let thread = StreamThread::spawn("halo-capture", move || {
            device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                        let mono = if native_channels > 1 {
                            to_mono(data, native_channels)
                        } else {
                            data.to_vec()
                        };
                        let samples = downsample(&mono, native_rate, target_rate);
                        // Never block the audio thread.
                        if tx.try_send(f32_to_pcm16(&samples)).is_err() {
                            debug!("capture channel full, dropping block");
                        }
                    },
                    move |err| {
                        error!("audio input stream error: {err}");
                    },
                    None,
                )
                .map_err(|e| format!("failed to build input stream: {e}"))
        })?;

        Ok(Self {
            thread,
            rx,
            pending: VecDeque::new(),
        })
    }
}

#[async_trait]
impl CaptureDevice for CpalCapture {
    async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv().await {
                Some(block) => self.pending.extend(block),
                None => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        for (dst, src) in buf.iter_mut().zip(self.pending.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn release(&mut self) {
        self.thread.stop();
        self.rx.close();
        self.pending.clear();
    }
}

// ── Playback ──────────────────────────────────────────────────────

/// Abort a write when the stream stops consuming samples for this long.
const PLAYBACK_STALL: Duration = Duration::from_secs(2);

/// Speaker playback via cpal.
///
/// One output stream stays open and renders from a shared sample buffer;
/// `write` appends and waits for the buffer to drain.
pub struct CpalPlayback {
    thread: StreamThread,
    buffer: Arc<Mutex<VecDeque<f32>>>,
}

impl CpalPlayback {
    /// Open the configured (or default) output device.
    ///
    /// # Errors
    ///
    /// Returns an error if no output device is available or the stream
    /// cannot be started.
    pub fn open(config: &AudioConfig) -> Result<Self> {
        let device = find_output(config.output_device.as_deref())?;
        info!("using output device: {}", device_name(&device));

        let stream_config = StreamConfig {
            channels: 1,
            sample_rate: config.playback_sample_rate,
            buffer_size: cpal::BufferSize::Default,
        };

        let buffer = Arc::new(Mutex::new(VecDeque::<f32>::new()));
        let shared = Arc::clone(&buffer);

        let thread = StreamThread::spawn("halo-playback", move || {
            device
                .build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                        let mut buf = shared.lock().unwrap_or_else(PoisonError::into_inner);
                        for sample in data.iter_mut() {
                            *sample = buf.pop_front().unwrap_or(0.0);
                        }
                    },
                    move |err| {
                        error!("audio output stream error: {err}");
                    },
                    None,
                )
                .map_err(|e| format!("failed to build output stream: {e}"))
        })?;

        Ok(Self { thread, buffer })
    }

    fn buffer(&self) -> std::sync::MutexGuard<'_, VecDeque<f32>> {
        self.buffer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PlaybackDevice for CpalPlayback {
    async fn write(&mut self, pcm: &[u8]) -> Result<()> {
        self.buffer().extend(pcm16_to_f32(pcm));

        // Wait for playback to finish.
        let mut last = self.buffer().len();
        let mut last_progress = Instant::now();
        while last > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let now = self.buffer().len();
            if now < last {
                last_progress = Instant::now();
            } else if last_progress.elapsed() > PLAYBACK_STALL {
                warn!(remaining = now, "output stream stalled");
                self.buffer().clear();
                return Err(HaloError::Audio("output stream stalled".into()));
            }
            last = now;
        }
        Ok(())
    }

    fn release(&mut self) {
        self.buffer().clear();
        self.thread.stop();
    }
}
