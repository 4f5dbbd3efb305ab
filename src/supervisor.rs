//! The capture state machine and its supervisor thread.
//!
//! [`CaptureUnit`] is the front end: it records requests and returns at once,
//! except for abort and terminate which wait for the supervisor. The supervisor
//! is the only thread that touches the [`CaptureHardware`]. Both sides share one
//! mutex-protected [`CaptureState`] plus a single pending-job slot, and one
//! condition variable that is signalled on every transition.

use crate::timing::{ExposureTimer, Watchdog};
use crate::{
    CaptureConfig, CaptureHardware, CaptureSink, CaptureState, CapturedFrame, Error,
    ExposureRequest, FrameInfo, FrameKind, FrameMetadata, StreamingSession, ROI,
};
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use CaptureState::*;

/// Work handed from the front end to the supervisor. At most one is pending.
#[derive(Debug)]
enum Job {
    Expose {
        request: ExposureRequest,
        attempt: u32,
    },
    Stream(StreamingSession),
}

#[derive(Debug, Default)]
struct Inner {
    state: CaptureState,
    job: Option<Job>,
    timer: Option<ExposureTimer>,
    in_exposure: bool,
}

impl Inner {
    fn set(&mut self, next: CaptureState) {
        if !self.state.can_transition(next) {
            warn!("Unexpected capture transition {} -> {}", self.state, next);
        }
        trace!("Capture state {} -> {}", self.state, next);
        self.state = next;
    }

    fn clear_exposure(&mut self) {
        self.in_exposure = false;
        self.timer = None;
    }
}

struct Shared {
    inner: Mutex<Inner>,
    cv: Condvar,
    gps_header: AtomicBool,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, Inner>) -> MutexGuard<'a, Inner> {
        self.cv.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_timeout<'a>(
        &self,
        guard: MutexGuard<'a, Inner>,
        timeout: Duration,
    ) -> MutexGuard<'a, Inner> {
        match self.cv.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    /// Entry point shared by fresh requests and watchdog restarts.
    fn arm_exposure(
        &self,
        request: ExposureRequest,
        attempt: u32,
        from: CaptureState,
    ) -> Result<(), Error> {
        let mut inner = self.lock();
        if inner.state != from {
            return Err(Error::RequestRejected(inner.state));
        }
        inner.set(Exposing);
        inner.timer = Some(ExposureTimer::start(request.duration));
        inner.in_exposure = true;
        inner.job = Some(Job::Expose { request, attempt });
        self.cv.notify_all();
        Ok(())
    }

    /// Return to `Idle` if the state is still `from`, or if an abort is waiting.
    fn finish(&self, from: CaptureState) {
        let mut inner = self.lock();
        inner.clear_exposure();
        if inner.state == from || inner.state == Aborting {
            inner.set(Idle);
            self.cv.notify_all();
        }
    }

    fn acknowledge_abort(&self) {
        let mut inner = self.lock();
        if inner.state == Aborting {
            inner.clear_exposure();
            inner.set(Idle);
            self.cv.notify_all();
            info!("Capture aborted.");
        }
    }
}

/// Marks the unit terminated when the supervisor thread exits, even by panic.
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        let mut inner = self.0.lock();
        if inner.state != Terminating {
            error!("Capture supervisor exited while {}", inner.state);
        }
        inner.clear_exposure();
        inner.job = None;
        inner.state = Terminated;
        self.0.cv.notify_all();
    }
}

enum Outcome {
    /// Frame ready; carries the instant the requested exposure ended.
    Ready(Instant),
    Interrupted,
    WatchdogExpired,
}

/// A camera driven by a dedicated capture thread.
///
/// All methods take `&self`; the unit can be shared between the polling front
/// end and whatever issues aborts. Dropping the unit terminates the thread.
pub struct CaptureUnit {
    name: String,
    shared: Arc<Shared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CaptureUnit {
    /// Move `hardware` into a new supervisor thread and return its front end.
    ///
    /// # Errors
    ///  - [`Error::InvalidValue`] if `config` does not validate.
    ///  - [`Error::ThreadSpawn`] if the thread cannot be created. The unit cannot
    ///    work without it.
    pub fn new(
        hardware: Box<dyn CaptureHardware>,
        sink: impl CaptureSink + 'static,
        config: CaptureConfig,
    ) -> Result<Self, Error> {
        config.validate()?;
        let name = hardware.camera_name().to_string();
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner::default()),
            cv: Condvar::new(),
            gps_header: AtomicBool::new(config.decode_gps_header),
        });
        let supervisor = Supervisor {
            name: name.clone(),
            hw: hardware,
            sink: Box::new(sink),
            watchdog: Watchdog::from_config(&config),
            config,
            shared: shared.clone(),
            last_len: 0,
        };
        let worker = std::thread::Builder::new()
            .name(format!("capture-{}", name))
            .spawn(move || supervisor.run())
            .map_err(|e| {
                error!("Error creating imaging thread ({})", e);
                Error::ThreadSpawn(e.to_string())
            })?;
        Ok(Self {
            name,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Get the camera name.
    pub fn camera_name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the capture state. It may change right after the read.
    pub fn current_state(&self) -> CaptureState {
        self.shared.lock().state
    }

    /// Start a single exposure.
    ///
    /// # Errors
    /// [`Error::RequestRejected`] unless the unit is `Idle`. Nothing is queued.
    pub fn request_exposure(&self, request: ExposureRequest) -> Result<(), Error> {
        let seconds = request.seconds();
        self.shared
            .arm_exposure(request, 0, Idle)
            .map_err(|err| {
                debug!("Exposure request rejected: {}", err);
                err
            })?;
        debug!("Taking a {:.5} seconds frame...", seconds);
        Ok(())
    }

    /// Start live streaming.
    ///
    /// # Errors
    /// [`Error::RequestRejected`] unless the unit is `Idle`.
    pub fn request_streaming(&self, session: StreamingSession) -> Result<(), Error> {
        let mut inner = self.shared.lock();
        if inner.state != Idle {
            debug!("Streaming request rejected while {}", inner.state);
            return Err(Error::RequestRejected(inner.state));
        }
        debug!("Starting {}", session);
        inner.set(Streaming);
        inner.job = Some(Job::Stream(session));
        self.shared.cv.notify_all();
        Ok(())
    }

    /// Stop live streaming. The supervisor stops the hardware stream at its next check.
    ///
    /// # Errors
    /// [`Error::RequestRejected`] unless the unit is `Streaming`.
    pub fn stop_streaming(&self) -> Result<(), Error> {
        let mut inner = self.shared.lock();
        if inner.state != Streaming {
            return Err(Error::RequestRejected(inner.state));
        }
        inner.set(Idle);
        self.shared.cv.notify_all();
        Ok(())
    }

    /// Abort the running exposure or stream and wait until the supervisor is idle.
    ///
    /// Returns immediately if nothing is in progress. A frame whose pull already
    /// completed may still be delivered, but always before this returns.
    pub fn request_abort(&self) {
        let mut inner = self.shared.lock();
        match inner.state {
            Idle | Terminating | Terminated => return,
            Aborting => {}
            _ => {
                debug!("Aborting camera exposure...");
                inner.set(Aborting);
                self.shared.cv.notify_all();
            }
        }
        while inner.state == Aborting {
            inner = self.shared.wait(inner);
        }
    }

    /// Stop the supervisor and wait for its thread to exit.
    ///
    /// Any exposure or stream in flight is cancelled. No callbacks are made once
    /// this returns. Further requests are rejected.
    pub fn request_terminate(&self) {
        {
            let mut inner = self.shared.lock();
            if inner.state != Terminated {
                if inner.state != Terminating {
                    debug!("Closing {}...", self.name);
                    inner.set(Terminating);
                }
                self.shared.cv.notify_all();
                while inner.state != Terminated {
                    inner = self.shared.wait(inner);
                }
            }
        }
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if worker.join().is_err() {
                error!("Capture thread of {} panicked", self.name);
            } else {
                info!("Camera {} is offline.", self.name);
            }
        }
    }

    /// Seconds left in the running exposure, or `None` if not counting down.
    pub fn time_left(&self) -> Option<f64> {
        let inner = self.shared.lock();
        match (inner.state, inner.timer) {
            (Exposing, Some(timer)) if inner.in_exposure => Some(timer.remaining().max(0.0)),
            _ => None,
        }
    }

    /// Whether an exposure is still counting down. Cleared once readout starts.
    pub fn is_exposing(&self) -> bool {
        self.shared.lock().in_exposure
    }

    /// Enable or disable decoding of the embedded GPS header.
    pub fn set_gps_header(&self, enabled: bool) {
        self.shared.gps_header.store(enabled, Ordering::Relaxed);
        info!(
            "GPS header is {}.",
            if enabled { "Enabled" } else { "Disabled" }
        );
    }

    /// Whether the embedded GPS header is decoded.
    pub fn gps_header(&self) -> bool {
        self.shared.gps_header.load(Ordering::Relaxed)
    }
}

impl Drop for CaptureUnit {
    fn drop(&mut self) {
        self.request_terminate();
    }
}

/// The capture thread. Owns the hardware and the sink.
struct Supervisor {
    name: String,
    hw: Box<dyn CaptureHardware>,
    sink: Box<dyn CaptureSink>,
    config: CaptureConfig,
    watchdog: Watchdog,
    shared: Arc<Shared>,
    last_len: usize,
}

impl Supervisor {
    fn run(mut self) {
        let _exit = ExitGuard(self.shared.clone());
        debug!("Capture thread for {} started", self.name);
        while self.dispatch() {}
        debug!("Capture thread for {} exiting", self.name);
    }

    /// Wait for work and execute it. Returns `false` once terminating.
    fn dispatch(&mut self) -> bool {
        let (state, job) = {
            let mut inner = self.shared.lock();
            while inner.state == Idle {
                inner = self.shared.wait(inner);
            }
            (inner.state, inner.job.take())
        };
        match (state, job) {
            (Terminating, _) | (Terminated, _) => return false,
            (Exposing, Some(Job::Expose { request, attempt })) => self.expose(request, attempt),
            (Streaming, Some(Job::Stream(session))) => self.stream(session),
            (RestartingExposure, Some(Job::Expose { request, attempt })) => {
                debug!("Restarting exposure, attempt {}", attempt + 1);
                if let Err(err) = self
                    .shared
                    .arm_exposure(request, attempt, RestartingExposure)
                {
                    debug!("Restart abandoned: {}", err);
                }
            }
            (Aborting, job) => {
                if job.is_some() {
                    debug!("Dropping request that never started");
                }
                self.shared.acknowledge_abort();
            }
            (state, job) => {
                warn!("Capture thread woke in {} with job {:?}", state, job);
                self.shared.finish(state);
            }
        }
        true
    }

    fn expose(&mut self, request: ExposureRequest, attempt: u32) {
        if let Err(err) = self.hw.begin_exposure(&request) {
            error!("Begin exposure failed: {}", err);
            self.fail_exposure(Error::ExposureFailed(err.to_string()));
            return;
        }
        {
            let mut inner = self.shared.lock();
            if inner.state == Exposing {
                inner.timer = Some(ExposureTimer::start(request.duration));
            }
        }
        match self.wait_exposure(&request) {
            Outcome::Ready(exposure_end) => self.download(&request, exposure_end),
            Outcome::Interrupted => self.interrupt_exposure(),
            Outcome::WatchdogExpired => self.restart_or_fail(request, attempt),
        }
    }

    /// Count down the exposure, then wait for data-ready until the watchdog expires.
    fn wait_exposure(&mut self, request: &ExposureRequest) -> Outcome {
        let timeout = self.watchdog.timeout_for(request.duration);
        let mut counted_down = false;
        let mut inner = self.shared.lock();
        loop {
            if inner.state != Exposing {
                return Outcome::Interrupted;
            }
            let timer = inner
                .timer
                .unwrap_or_else(|| ExposureTimer::start(request.duration));
            drop(inner);

            let ready = self.hw.signals_ready()
                && self.hw.exposure_ready().unwrap_or_else(|err| {
                    warn!("Exposure status poll failed: {}", err);
                    false
                });
            let now = Instant::now();
            let exposure_end = timer.start_time() + timer.duration();
            let countdown = timer.countdown_at(now, &self.config);
            let wait = if ready {
                if !counted_down {
                    self.end_countdown(request);
                }
                return Outcome::Ready(exposure_end);
            } else if countdown.remaining > 0.0 {
                self.sink.on_progress(countdown.remaining);
                countdown.next_poll
            } else {
                if !counted_down {
                    self.end_countdown(request);
                    counted_down = true;
                }
                if !self.hw.signals_ready() {
                    return Outcome::Ready(exposure_end);
                }
                let deadline = timer.start_time() + timeout;
                if now >= deadline {
                    return Outcome::WatchdogExpired;
                }
                self.config.fine_poll.min(deadline - now)
            };

            inner = self.shared.lock();
            if inner.state == Exposing {
                inner = self.shared.wait_timeout(inner, wait);
            }
        }
    }

    fn end_countdown(&mut self, request: &ExposureRequest) {
        self.shared.lock().in_exposure = false;
        self.sink.on_progress(0.0);
        if request.duration > self.config.coarse_poll * 5 {
            info!("Exposure done, downloading image...");
        } else {
            debug!("Exposure done, downloading image...");
        }
    }

    /// Pull the finished frame and hand it over.
    ///
    /// The frame is delivered only if no abort or terminate arrived before the
    /// pull returned. An abort issued after that check is too late to cancel
    /// the exposure; its caller still returns only after delivery, so no frame
    /// ever reaches the sink once `request_abort` has returned.
    fn download(&mut self, request: &ExposureRequest, exposure_end: Instant) {
        let mut buffer = Vec::with_capacity(self.last_len);
        debug!("Blocking frame read on {}", self.name);
        let result = self.hw.pull_frame(&mut buffer);
        let pulled = Instant::now();
        match result {
            Ok(info) => {
                self.watchdog.record_readout(exposure_end, pulled);
                debug!(
                    "Download complete {:.3} s after exposure end.",
                    pulled.saturating_duration_since(exposure_end).as_secs_f64()
                );
                let frame = self.make_frame(
                    FrameKind::Exposure,
                    buffer,
                    info,
                    request.roi,
                    request.seconds(),
                );
                if self.shared.lock().state == Exposing {
                    self.sink.on_frame(frame);
                } else {
                    debug!("Discarding frame of interrupted exposure");
                }
                self.shared.finish(Exposing);
            }
            Err(err) => {
                error!("Frame download failed: {}", err);
                self.fail_exposure(Error::ExposureFailed(err.to_string()));
            }
        }
    }

    fn interrupt_exposure(&mut self) {
        if let Err(err) = self.hw.cancel() {
            error!("Abort exposure failed: {}", err);
        }
        self.shared.lock().clear_exposure();
        self.shared.acknowledge_abort();
    }

    fn restart_or_fail(&mut self, request: ExposureRequest, attempt: u32) {
        if let Err(err) = self.hw.cancel() {
            debug!("Cancel of stalled exposure failed: {}", err);
        }
        if attempt >= self.config.exposure_retry_budget {
            error!(
                "Exposure of {:.3} s never completed after {} attempts",
                request.seconds(),
                attempt + 1
            );
            self.fail_exposure(Error::TimedOut);
            return;
        }
        warn!(
            "Exposure watchdog expired, retrying ({}/{})",
            attempt + 1,
            self.config.exposure_retry_budget
        );
        let mut inner = self.shared.lock();
        if inner.state == Exposing {
            inner.set(RestartingExposure);
            inner.job = Some(Job::Expose {
                request,
                attempt: attempt + 1,
            });
            self.shared.cv.notify_all();
        }
    }

    /// Report a final exposure failure, unless the exposure was aborted meanwhile.
    fn fail_exposure(&mut self, err: Error) {
        let state = {
            let mut inner = self.shared.lock();
            inner.clear_exposure();
            inner.state
        };
        if state == Exposing {
            self.sink.on_failure(err);
        }
        self.shared.finish(Exposing);
    }

    fn stream(&mut self, session: StreamingSession) {
        if let Err(err) = self.hw.begin_stream(&session) {
            error!("Begin stream failed: {}", err);
            if self.shared.lock().state == Streaming {
                self.sink.on_failure(err);
            }
            self.shared.finish(Streaming);
            return;
        }
        info!("{} started.", session);
        let mut frames = 0u64;
        while self.streaming() {
            let mut buffer = Vec::with_capacity(self.last_len);
            let mut attempts = 0;
            let result = loop {
                attempts += 1;
                match self.hw.pull_stream_frame(&mut buffer) {
                    Ok(info) => break Ok(info),
                    Err(err) if attempts < self.config.stream_retry_limit => {
                        trace!("Live frame attempt {} failed: {}", attempts, err);
                        std::thread::sleep(self.config.stream_retry_pause);
                    }
                    Err(err) => break Err(err),
                }
            };
            match result {
                Ok(info) => {
                    let frame =
                        self.make_frame(FrameKind::Stream, buffer, info, session.roi, 0.0);
                    if self.streaming() {
                        frames += 1;
                        self.sink.on_frame(frame);
                    }
                }
                Err(err) => {
                    warn!("Live frame lost after {} attempts: {}", attempts, err);
                    self.sink.on_failure(err);
                }
            }
        }
        if let Err(err) = self.hw.stop_stream() {
            error!("Stop stream failed: {}", err);
        }
        info!("Streaming stopped after {} frames.", frames);
        self.shared.acknowledge_abort();
    }

    /// Still streaming the session that was started, with no newer request pending.
    fn streaming(&self) -> bool {
        let inner = self.shared.lock();
        inner.state == Streaming && inner.job.is_none()
    }

    fn make_frame(
        &mut self,
        kind: FrameKind,
        data: Vec<u8>,
        info: FrameInfo,
        roi: ROI,
        exposure: f64,
    ) -> CapturedFrame {
        self.last_len = self.last_len.max(data.len());
        let metadata = if self.shared.gps_header.load(Ordering::Relaxed) {
            match FrameMetadata::decode(&data) {
                Ok(meta) => Some(meta),
                Err(err) => {
                    warn!("GPS header not decoded: {}", err);
                    None
                }
            }
        } else {
            None
        };
        CapturedFrame {
            kind,
            data,
            info,
            roi,
            metadata,
            exposure,
            received: SystemTime::now(),
        }
    }
}
