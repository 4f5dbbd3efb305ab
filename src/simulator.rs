//! In-process camera used for simulation mode and tests.

use crate::gps::HEADER_LEN;
use crate::registry::{CameraBus, CameraDescriptor};
use crate::{
    CaptureHardware, Error, ExposureRequest, FrameInfo, PixelFormat, StreamingSession, ROI,
};
use log::{debug, trace};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Seconds from the Unix epoch to the timing module's epoch (JD 2450000.5).
const VENDOR_EPOCH_UNIX: u64 = 9413 * 86400;

const MAX_FRAME_PERIOD: Duration = Duration::from_secs(1);

#[derive(Debug, Default)]
/// Hardware calls made on a [`SimulatedCamera`], readable from other threads.
pub struct SimulatorCounters {
    /// Exposures started.
    pub exposures: AtomicU32,
    /// Frames read out, exposure and stream.
    pub frames: AtomicU32,
    /// Cancel calls.
    pub cancels: AtomicU32,
    /// Streams started.
    pub streams: AtomicU32,
    /// Streams stopped.
    pub stream_stops: AtomicU32,
}

impl SimulatorCounters {
    /// Read a counter.
    pub fn get(counter: &AtomicU32) -> u32 {
        counter.load(Ordering::SeqCst)
    }
}

/// A camera that fills frames with a deterministic pattern.
///
/// Pulls block for the remainder of the exposure plus the configured readout
/// time, like a vendor SDK's blocking read. When the GPS header is enabled the
/// first [`HEADER_LEN`] bytes carry a synthetic timing header.
pub struct SimulatedCamera {
    name: String,
    width: u32,
    height: u32,
    readout: Duration,
    gps_header: bool,
    signals_ready: bool,
    never_ready: bool,
    failing_pulls: u32,
    failing_begins: u32,
    latitude: u32,
    longitude: u32,
    sequence: u32,
    exposure: Option<(Instant, ExposureRequest, SystemTime)>,
    stream: Option<StreamingSession>,
    counters: Arc<SimulatorCounters>,
}

impl SimulatedCamera {
    /// Create a simulated camera with a `width` x `height` sensor.
    pub fn new(name: &str, width: u32, height: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            readout: Duration::from_millis(5),
            gps_header: false,
            signals_ready: false,
            never_ready: false,
            failing_pulls: 0,
            failing_begins: 0,
            latitude: 453_000_000,
            longitude: 1_010_300_000,
            sequence: 0,
            exposure: None,
            stream: None,
            counters: Arc::new(SimulatorCounters::default()),
        }
    }

    /// Time taken to read a frame out after the exposure ends.
    pub fn with_readout(mut self, readout: Duration) -> Self {
        self.readout = readout;
        self
    }

    /// Embed a GPS timing header in every frame.
    pub fn with_gps_header(mut self, enabled: bool) -> Self {
        self.gps_header = enabled;
        self
    }

    /// Report data-ready through [`CaptureHardware::exposure_ready`].
    pub fn with_ready_signal(mut self, enabled: bool) -> Self {
        self.signals_ready = enabled;
        self
    }

    /// Signal readiness support but never become ready, to exercise the watchdog.
    pub fn never_ready(mut self) -> Self {
        self.signals_ready = true;
        self.never_ready = true;
        self
    }

    /// Fail the next `count` frame pulls.
    pub fn with_failing_pulls(mut self, count: u32) -> Self {
        self.failing_pulls = count;
        self
    }

    /// Fail the next `count` exposure starts.
    pub fn with_failing_begins(mut self, count: u32) -> Self {
        self.failing_begins = count;
        self
    }

    /// Packed location written into the GPS header.
    pub fn with_location(mut self, latitude: u32, longitude: u32) -> Self {
        self.latitude = latitude;
        self.longitude = longitude;
        self
    }

    /// Shared call counters.
    pub fn counters(&self) -> Arc<SimulatorCounters> {
        self.counters.clone()
    }

    /// Time between streamed frames, at most one second.
    fn frame_period(&self, session: &StreamingSession) -> Duration {
        if session.frame_rate > 0.0 {
            Duration::try_from_secs_f64(session.frame_rate.recip())
                .unwrap_or(MAX_FRAME_PERIOD)
                .min(MAX_FRAME_PERIOD)
        } else {
            self.readout.min(MAX_FRAME_PERIOD)
        }
    }

    fn take_failure(&mut self, op: &'static str) -> Result<(), Error> {
        if self.failing_pulls > 0 {
            self.failing_pulls -= 1;
            trace!("Simulated {} failure", op);
            return Err(Error::Hardware { op, code: -1 });
        }
        Ok(())
    }

    fn fill(&mut self, buffer: &mut Vec<u8>, roi: &ROI, format: PixelFormat) -> FrameInfo {
        let (width, height) = roi.binned_size();
        let info = FrameInfo {
            width,
            height,
            bpp: format.bits(),
            channels: format.channels(),
        };
        self.sequence = self.sequence.wrapping_add(1);
        let seq = self.sequence;
        buffer.clear();
        buffer.reserve(info.byte_len());
        for y in 0..height {
            for x in 0..width {
                let value = x.wrapping_add(y).wrapping_add(seq);
                match format {
                    PixelFormat::Mono8 => buffer.push(value as u8),
                    PixelFormat::Mono16 => {
                        buffer.extend_from_slice(&((value.wrapping_mul(64)) as u16).to_le_bytes())
                    }
                    PixelFormat::Rgb8 => {
                        buffer.extend_from_slice(&[value as u8, (value >> 1) as u8, (value >> 2) as u8])
                    }
                }
            }
        }
        self.counters.frames.fetch_add(1, Ordering::SeqCst);
        info
    }

    fn write_header(&self, buffer: &mut [u8], start: SystemTime, exposure: Duration) {
        if !self.gps_header || buffer.len() < HEADER_LEN {
            return;
        }
        let end = start + exposure;
        let now = SystemTime::now().max(end);
        let header = &mut buffer[..HEADER_LEN];
        header.fill(0);
        header[0..4].copy_from_slice(&self.sequence.to_be_bytes());
        header[4] = self.sequence as u8;
        header[5..7].copy_from_slice(&(self.width as u16).to_be_bytes());
        header[7..9].copy_from_slice(&(self.height as u16).to_be_bytes());
        header[9..13].copy_from_slice(&self.latitude.to_be_bytes());
        header[13..17].copy_from_slice(&self.longitude.to_be_bytes());
        write_event(&mut header[17..25], 0x01, start);
        write_event(&mut header[25..33], 0x02, end);
        // High nibble 3: receiver locked.
        write_event(&mut header[33..41], 0x30, now);
        header[41..44].copy_from_slice(&10_000_000u32.to_be_bytes()[1..]);
    }
}

fn write_event(out: &mut [u8], flag: u8, at: SystemTime) {
    let since_unix = at.duration_since(UNIX_EPOCH).unwrap_or_default();
    let seconds = since_unix.as_secs().saturating_sub(VENDOR_EPOCH_UNIX) as u32;
    let ticks = since_unix.subsec_micros() * 10;
    out[0] = flag;
    out[1..5].copy_from_slice(&seconds.to_be_bytes());
    out[5..8].copy_from_slice(&ticks.to_be_bytes()[1..]);
}

impl CaptureHardware for SimulatedCamera {
    fn camera_name(&self) -> &str {
        &self.name
    }

    fn begin_exposure(&mut self, request: &ExposureRequest) -> Result<(), Error> {
        if self.failing_begins > 0 {
            self.failing_begins -= 1;
            return Err(Error::Hardware {
                op: "begin_exposure",
                code: -1,
            });
        }
        debug!("Simulated exposure: {}", request);
        self.counters.exposures.fetch_add(1, Ordering::SeqCst);
        self.exposure = Some((Instant::now(), request.clone(), SystemTime::now()));
        Ok(())
    }

    fn signals_ready(&self) -> bool {
        self.signals_ready
    }

    fn exposure_ready(&mut self) -> Result<bool, Error> {
        if self.never_ready {
            return Ok(false);
        }
        Ok(match &self.exposure {
            Some((start, request, _)) => start.elapsed() >= request.duration + self.readout,
            None => false,
        })
    }

    fn pull_frame(&mut self, buffer: &mut Vec<u8>) -> Result<FrameInfo, Error> {
        let (start, request, wall_start) = self.exposure.take().ok_or(Error::Hardware {
            op: "pull_frame",
            code: -2,
        })?;
        let done = start + request.duration + self.readout;
        let now = Instant::now();
        if done > now {
            std::thread::sleep(done - now);
        }
        self.take_failure("pull_frame")?;
        let info = self.fill(buffer, &request.roi, request.format);
        self.write_header(buffer, wall_start, request.duration);
        Ok(info)
    }

    fn begin_stream(&mut self, session: &StreamingSession) -> Result<(), Error> {
        debug!("Simulated {}", session);
        self.counters.streams.fetch_add(1, Ordering::SeqCst);
        self.stream = Some(session.clone());
        Ok(())
    }

    fn pull_stream_frame(&mut self, buffer: &mut Vec<u8>) -> Result<FrameInfo, Error> {
        let session = self.stream.clone().ok_or(Error::Hardware {
            op: "pull_stream_frame",
            code: -2,
        })?;
        let period = self.frame_period(&session);
        std::thread::sleep(period);
        self.take_failure("pull_stream_frame")?;
        let start = SystemTime::now();
        let info = self.fill(buffer, &session.roi, session.format);
        self.write_header(buffer, start, period);
        Ok(info)
    }

    fn cancel(&mut self) -> Result<(), Error> {
        self.counters.cancels.fetch_add(1, Ordering::SeqCst);
        self.exposure = None;
        Ok(())
    }

    fn stop_stream(&mut self) -> Result<(), Error> {
        self.counters.stream_stops.fetch_add(1, Ordering::SeqCst);
        self.stream = None;
        Ok(())
    }
}

/// A bus with `count` simulated cameras attached.
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    count: usize,
    width: u32,
    height: u32,
}

impl SimulatedBus {
    /// Attach `count` simulated 1280 x 1024 cameras.
    pub fn new(count: usize) -> Self {
        Self {
            count,
            width: 1280,
            height: 1024,
        }
    }
}

impl CameraBus for SimulatedBus {
    fn enumerate(&self) -> Result<Vec<CameraDescriptor>, Error> {
        Ok((0..self.count)
            .map(|i| CameraDescriptor {
                id: format!("SIM-{:04}", i + 1),
                model: "Simulator".to_string(),
            })
            .collect())
    }

    fn open(&self, id: &str) -> Result<Box<dyn CaptureHardware>, Error> {
        if !self.enumerate()?.iter().any(|camera| camera.id == id) {
            return Err(Error::InvalidId(id.to_string()));
        }
        Ok(Box::new(SimulatedCamera::new(id, self.width, self.height)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FrameMetadata;

    fn request(seconds: f64, format: PixelFormat) -> ExposureRequest {
        ExposureRequest::new(seconds, format, ROI::full(64, 48)).unwrap()
    }

    #[test]
    fn test_pull_without_exposure_fails() {
        let mut cam = SimulatedCamera::new("sim", 64, 48);
        let mut buf = Vec::new();
        assert!(matches!(
            cam.pull_frame(&mut buf),
            Err(Error::Hardware { op: "pull_frame", .. })
        ));
    }

    #[test]
    fn test_frame_geometry() {
        let mut cam = SimulatedCamera::new("sim", 64, 48).with_readout(Duration::ZERO);
        cam.begin_exposure(&request(0.0, PixelFormat::Mono16)).unwrap();
        let mut buf = Vec::new();
        let info = cam.pull_frame(&mut buf).unwrap();
        assert_eq!((info.width, info.height, info.bpp), (64, 48, 16));
        assert_eq!(buf.len(), info.byte_len());
        assert_eq!(SimulatorCounters::get(&cam.counters().frames), 1);
    }

    #[test]
    fn test_embedded_header_decodes() {
        let mut cam = SimulatedCamera::new("sim", 64, 48)
            .with_readout(Duration::ZERO)
            .with_gps_header(true)
            .with_location(200_000_000, 1_120_000_000);
        cam.begin_exposure(&request(0.01, PixelFormat::Mono8)).unwrap();
        let mut buf = Vec::new();
        cam.pull_frame(&mut buf).unwrap();
        let meta = FrameMetadata::decode(&buf).unwrap();
        assert_eq!(meta.sequence, 1);
        assert_eq!((meta.width, meta.height), (64, 48));
        assert_eq!(meta.latitude, 20.0);
        assert_eq!(meta.longitude, -120.0);
        assert_eq!(meta.gps_state(), Some(crate::GpsState::Locked));
        assert!((meta.measured_exposure() - 0.01).abs() < 1e-5);
    }

    #[test]
    fn test_failing_pulls_recover() {
        let mut cam = SimulatedCamera::new("sim", 8, 8).with_failing_pulls(2);
        cam.begin_stream(&StreamingSession {
            frame_rate: 1000.0,
            format: PixelFormat::Mono8,
            roi: ROI::full(8, 8),
        })
        .unwrap();
        let mut buf = Vec::new();
        assert!(cam.pull_stream_frame(&mut buf).is_err());
        assert!(cam.pull_stream_frame(&mut buf).is_err());
        assert!(cam.pull_stream_frame(&mut buf).is_ok());
        assert_eq!(buf.len(), 64);
    }

    #[test]
    fn test_frame_period_saturates() {
        let cam = SimulatedCamera::new("sim", 8, 8).with_readout(Duration::from_millis(3));
        let session = |frame_rate| StreamingSession {
            frame_rate,
            format: PixelFormat::Mono8,
            roi: ROI::full(8, 8),
        };
        assert_eq!(cam.frame_period(&session(100.0)), Duration::from_millis(10));
        assert_eq!(cam.frame_period(&session(1e-300)), MAX_FRAME_PERIOD);
        assert_eq!(cam.frame_period(&session(0.5)), MAX_FRAME_PERIOD);
        assert_eq!(cam.frame_period(&session(0.0)), Duration::from_millis(3));
        assert_eq!(cam.frame_period(&session(f64::NAN)), Duration::from_millis(3));
        assert_eq!(cam.frame_period(&session(f64::INFINITY)), Duration::ZERO);
    }

    #[test]
    fn test_bus_open() {
        let bus = SimulatedBus::new(2);
        let cam = bus.open("SIM-0002").unwrap();
        assert_eq!(cam.camera_name(), "SIM-0002");
        assert!(bus.open("SIM-0003").is_err());
    }
}
