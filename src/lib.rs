/*!

# captureunit

`captureunit` runs the capture side of a CCD/CMOS camera driver: a single supervisor thread
that owns the camera handle and serializes exposures, live streaming, aborts and shutdown,
plus a decoder for the GPS timing header that some cameras embed in the first bytes of
every frame.

You can use `captureunit` to:
 - Wrap a vendor SDK behind the [`CaptureHardware`] trait and drive it from a polling front end
   that never blocks on the camera,
 - Time exposures with a countdown suitable for display, with a watchdog that re-triggers
   exposures the hardware never completes,
 - Decode sub-microsecond shutter timestamps and location from frames captured with a GPS
   timing module ([`FrameMetadata`]),
 - Convert captured frames into [`image`](https://crates.io/crates/image) images with
   metadata ([`ImageData`]), optionally saving them to `FITS` files (enable the `fitsio` feature,
   requires the `cfitsio` C library).

## Usage
Add this to your `Cargo.toml`:
```toml
[dependencies]
captureunit = "0.1.0"
```
and this to your source code:
```no_run
use captureunit::{CaptureUnit, CaptureConfig, ExposureRequest, PixelFormat, ROI};
```

## Example
```no_run
use captureunit::{CameraRegistry, CaptureConfig, CaptureEvent, ExposureRequest, PixelFormat, SimulatedBus, ROI};
use std::sync::mpsc::channel;

let bus = SimulatedBus::new(1);
let registry = CameraRegistry::scan(&bus).unwrap();
let (tx, rx) = channel();
let camera = registry.open_first(&bus, CaptureConfig::default(), tx).unwrap();
camera
    .request_exposure(ExposureRequest::new(0.5, PixelFormat::Mono16, ROI::full(640, 480)).unwrap())
    .unwrap();
for event in rx.iter() {
    if let CaptureEvent::Frame(frame) = event {
        println!("Got {} bytes", frame.data.len());
        break;
    }
}
camera.request_terminate();
```

## Notes
 1. [`CaptureHardware`] is moved into the supervisor thread when a [`CaptureUnit`] is created.
 Only that thread ever calls into the camera, so implementations need to be `Send` but
 never `Sync`.
 2. Requests are not queued. [`CaptureUnit::request_exposure`] and
 [`CaptureUnit::request_streaming`] are rejected unless the unit is idle; wait for the
 frame (or failure) event before issuing the next one.
 3. [`CaptureUnit::request_abort`] and [`CaptureUnit::request_terminate`] block until the
 supervisor acknowledges them. A hardware call already in flight is never interrupted.

*/

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

mod config;
mod events;
pub mod gps;
mod imagedata;
mod registry;
mod request;
mod simulator;
mod state;
mod supervisor;
pub mod timing;

pub use config::CaptureConfig;
pub use events::{CaptureEvent, CaptureSink, CapturedFrame, FrameKind};
pub use gps::{FrameMetadata, GpsState, ShutterEvent};
pub use imagedata::{ImageData, ImageMetaData};
pub use registry::{CameraBus, CameraDescriptor, CameraRegistry};
pub use request::{ExposureRequest, FrameInfo, PixelFormat, StreamingSession};
pub use simulator::{SimulatedBus, SimulatedCamera, SimulatorCounters};
pub use state::CaptureState;
pub use supervisor::CaptureUnit;

#[deny(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
/// This structure defines a region of interest.
/// The origin and size are in un-binned pixel space.
pub struct ROI {
    /// The minimum X coordinate (un-binned).
    pub x_min: u32,
    /// The minimum Y coordinate (un-binned).
    pub y_min: u32,
    /// The region width (un-binned).
    pub width: u32,
    /// The region height (un-binned).
    pub height: u32,
    /// The binning factor, applied to both axes.
    pub bin: u32,
}

impl ROI {
    /// A full-frame, unbinned region of `width` x `height`.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x_min: 0,
            y_min: 0,
            width,
            height,
            bin: 1,
        }
    }

    /// Size of the read-out image in binned pixels.
    pub fn binned_size(&self) -> (u32, u32) {
        let bin = self.bin.max(1);
        (self.width / bin, self.height / bin)
    }
}

impl Display for ROI {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ROI: Origin = ({}, {}), Image Size = ({} x {}), bin = {}",
            self.x_min, self.y_min, self.width, self.height, self.bin
        )
    }
}

/// The hardware access interface of a camera.
///
/// Every call may block for as long as the hardware needs and returns a coarse
/// success or failure, never a partial result. The object is moved into the
/// supervisor thread of a [`CaptureUnit`], which is the only caller.
pub trait CaptureHardware: Send {
    /// Get the camera name.
    fn camera_name(&self) -> &str;

    /// Program the region, binning and duration of `request` and start exposing.
    fn begin_exposure(&mut self, request: &ExposureRequest) -> Result<(), Error>;

    /// Whether the camera reports data-ready through [`CaptureHardware::exposure_ready`].
    ///
    /// When `false` (the default) the supervisor relies on elapsed time alone and
    /// pulls the frame as soon as the countdown ends.
    fn signals_ready(&self) -> bool {
        false
    }

    /// Poll the data-ready event of the running exposure.
    ///
    /// Defaults to `false` if unimplemented.
    fn exposure_ready(&mut self) -> Result<bool, Error> {
        Ok(false)
    }

    /// Read the completed exposure into `buffer`, resizing it as needed.
    fn pull_frame(&mut self, buffer: &mut Vec<u8>) -> Result<FrameInfo, Error>;

    /// Start live streaming.
    fn begin_stream(&mut self, session: &StreamingSession) -> Result<(), Error>;

    /// Read the next live frame into `buffer`, resizing it as needed.
    fn pull_stream_frame(&mut self, buffer: &mut Vec<u8>) -> Result<FrameInfo, Error>;

    /// Cancel an ongoing exposure and readout.
    fn cancel(&mut self) -> Result<(), Error>;

    /// Stop live streaming.
    fn stop_stream(&mut self) -> Result<(), Error>;
}

#[derive(Error, Debug, Clone, PartialEq)]
/// Errors returned by capture operations.
pub enum Error {
    /// Error message.
    #[error("Error: {0}")]
    Message(String),
    /// Invalid camera ID.
    #[error("Invalid ID: {0}")]
    InvalidId(String),
    /// No cameras available.
    #[error("No cameras available")]
    NoCamerasAvailable,
    /// Invalid size.
    #[error("Invalid size: {0}")]
    InvalidSize(usize),
    /// Operation timed out.
    #[error("Operation timed out")]
    TimedOut,
    /// Buffer too small.
    #[error("Buffer too small: {0}")]
    BufferTooSmall(usize),
    /// Request rejected because the capture unit is busy.
    #[error("Request rejected, capture unit is {0}")]
    RequestRejected(CaptureState),
    /// Exposure failed.
    #[error("Exposure failed: {0}")]
    ExposureFailed(String),
    /// Invalid value.
    #[error("Invalid value: {0}")]
    InvalidValue(String),
    /// A hardware call returned a failure code.
    #[error("Hardware call {op} failed ({code})")]
    Hardware {
        /// Name of the failed call.
        op: &'static str,
        /// Vendor return code.
        code: i32,
    },
    /// The supervisor thread could not be started.
    #[error("Could not start capture thread: {0}")]
    ThreadSpawn(String),
}
