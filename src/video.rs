//! Camera frame forwarding: JPEG encoding and rate limiting.

use crate::config::VideoConfig;
use crate::error::{HaloError, Result};
use image::{ExtendedColorType, ImageEncoder, RgbImage};
use std::time::{Duration, Instant};

/// Encode an RGB frame as JPEG at `quality` (1-100).
///
/// # Errors
///
/// Returns [`HaloError::Protocol`] if the encoder rejects the frame.
pub fn encode_jpeg(frame: &RgbImage, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    encoder
        .write_image(
            frame.as_raw(),
            frame.width(),
            frame.height(),
            ExtendedColorType::Rgb8,
        )
        .map_err(|e| HaloError::Protocol(format!("JPEG encode: {e}")))?;
    Ok(buf)
}

/// Admits at most one frame per interval.
#[derive(Debug, Clone)]
pub struct FrameThrottle {
    interval: Duration,
    last_sent: Option<Instant>,
}

impl FrameThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_sent: None,
        }
    }

    pub fn from_config(config: &VideoConfig) -> Self {
        Self::new(Duration::from_millis(config.frame_interval_ms))
    }

    /// Whether a frame arriving at `now` should be sent. Admitting a frame
    /// starts a new interval.
    pub fn admit(&mut self, now: Instant) -> bool {
        match self.last_sent {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_sent = Some(now);
                true
            }
        }
    }

    /// Forget the last admitted frame, e.g. after a reconnect.
    pub fn reset(&mut self) {
        self.last_sent = None;
    }
}
