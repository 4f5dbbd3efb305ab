use crate::{Error, ROI};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Pixel format (and bit depth) requested from the camera.
pub enum PixelFormat {
    /// 8-bit monochrome/raw.
    Mono8,
    /// 16-bit monochrome/raw, little-endian in the frame buffer.
    Mono16,
    /// 8-bit interleaved RGB.
    Rgb8,
}

impl PixelFormat {
    /// Bits per pixel per channel.
    pub fn bits(&self) -> u32 {
        match self {
            PixelFormat::Mono8 | PixelFormat::Rgb8 => 8,
            PixelFormat::Mono16 => 16,
        }
    }

    /// Number of interleaved channels.
    pub fn channels(&self) -> u32 {
        match self {
            PixelFormat::Mono8 | PixelFormat::Mono16 => 1,
            PixelFormat::Rgb8 => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// A single exposure, consumed once by the supervisor.
pub struct ExposureRequest {
    /// Requested exposure duration.
    pub duration: Duration,
    /// Capture format / bit depth hint.
    pub format: PixelFormat,
    /// Region of interest and binning.
    pub roi: ROI,
}

impl ExposureRequest {
    /// Create an exposure request of `duration` seconds over `roi`.
    ///
    /// # Errors
    /// [`Error::InvalidValue`] if `seconds` is negative or not finite.
    pub fn new(seconds: f64, format: PixelFormat, roi: ROI) -> Result<Self, Error> {
        let duration = Duration::try_from_secs_f64(seconds).map_err(|_| {
            Error::InvalidValue(format!("Exposure duration {} s is not valid", seconds))
        })?;
        Ok(Self {
            duration,
            format,
            roi,
        })
    }

    /// Requested duration in fractional seconds.
    pub fn seconds(&self) -> f64 {
        self.duration.as_secs_f64()
    }
}

impl Display for ExposureRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Exposure {:.5} s, {:?}, {}",
            self.seconds(),
            self.format,
            self.roi
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Parameters of a live-video session. Lives as long as the `Streaming` state.
pub struct StreamingSession {
    /// Target frame rate in frames per second.
    pub frame_rate: f64,
    /// Pixel format of streamed frames.
    pub format: PixelFormat,
    /// Region of interest and binning.
    pub roi: ROI,
}

impl Display for StreamingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Stream {:.1} fps, {:?}, {}",
            self.frame_rate, self.format, self.roi
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// Geometry reported by the hardware for a pulled frame.
pub struct FrameInfo {
    /// Width in (binned) pixels.
    pub width: u32,
    /// Height in (binned) pixels.
    pub height: u32,
    /// Bits per pixel per channel.
    pub bpp: u32,
    /// Number of channels.
    pub channels: u32,
}

impl FrameInfo {
    /// Number of bytes the frame occupies in a buffer.
    pub fn byte_len(&self) -> usize {
        self.width as usize * self.height as usize * (self.bpp as usize / 8) * self.channels as usize
    }
}
