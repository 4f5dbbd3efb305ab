use crate::{Error, FrameInfo, FrameMetadata, ROI};
use std::sync::mpsc::Sender;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How a frame was captured.
pub enum FrameKind {
    /// The single frame of a timed exposure.
    Exposure,
    /// One frame of a live stream.
    Stream,
}

#[derive(Debug, Clone)]
/// A frame handed from the supervisor to the front end.
///
/// The buffer is moved out of the supervisor once the pull completes, so the
/// receiver owns it exclusively.
pub struct CapturedFrame {
    /// How the frame was captured.
    pub kind: FrameKind,
    /// Raw pixel bytes as read from the camera.
    pub data: Vec<u8>,
    /// Geometry reported by the camera.
    pub info: FrameInfo,
    /// Region and binning the frame was requested with.
    pub roi: ROI,
    /// Decoded GPS header, if decoding is enabled.
    pub metadata: Option<FrameMetadata>,
    /// Requested exposure in seconds (zero for streamed frames).
    pub exposure: f64,
    /// Host time at which the pull completed.
    pub received: SystemTime,
}

impl CapturedFrame {
    /// SER timestamp (microseconds since 0001-01-01) of the shutter opening,
    /// if a GPS header was decoded.
    pub fn ser_timestamp(&self) -> Option<u64> {
        self.metadata.map(|meta| meta.start.ser_timestamp())
    }
}

#[derive(Debug)]
/// Events delivered through a channel by the [`CaptureSink`] implementation on [`Sender`].
pub enum CaptureEvent {
    /// Seconds left in the running exposure.
    Progress(f64),
    /// A completed exposure or streamed frame.
    Frame(CapturedFrame),
    /// A capture attempt failed for good.
    Failed(Error),
}

/// Receiver of supervisor results. Called only from the supervisor thread.
pub trait CaptureSink: Send {
    /// A frame is ready. Called exactly once per completed exposure and once per streamed frame.
    fn on_frame(&mut self, frame: CapturedFrame);

    /// Remaining exposure time in seconds, on the countdown cadence.
    fn on_progress(&mut self, _remaining: f64) {}

    /// A capture attempt failed after local retries were exhausted.
    fn on_failure(&mut self, _error: Error) {}
}

impl CaptureSink for Sender<CaptureEvent> {
    // A dropped receiver only means nobody is listening anymore.
    fn on_frame(&mut self, frame: CapturedFrame) {
        let _ = self.send(CaptureEvent::Frame(frame));
    }

    fn on_progress(&mut self, remaining: f64) {
        let _ = self.send(CaptureEvent::Progress(remaining));
    }

    fn on_failure(&mut self, error: Error) {
        let _ = self.send(CaptureEvent::Failed(error));
    }
}
