use crate::{CaptureConfig, CaptureHardware, CaptureSink, CaptureUnit, Error};
use log::{debug, info};
use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
/// Identification of an attached camera.
pub struct CameraDescriptor {
    /// Unique identifier on the bus (usually model plus serial number).
    pub id: String,
    /// Model name.
    pub model: String,
}

impl Display for CameraDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.model, self.id)
    }
}

/// Access to the cameras attached to the host, typically backed by a vendor SDK.
pub trait CameraBus {
    /// List the attached cameras.
    fn enumerate(&self) -> Result<Vec<CameraDescriptor>, Error>;

    /// Open the camera with the given identifier.
    fn open(&self, id: &str) -> Result<Box<dyn CaptureHardware>, Error>;
}

/// The cameras found when the process started.
///
/// Built once by the entry point and passed to whoever opens cameras, instead
/// of a process-wide list.
#[derive(Debug, Clone, Default)]
pub struct CameraRegistry {
    cameras: Vec<CameraDescriptor>,
}

impl CameraRegistry {
    /// Enumerate the cameras on `bus`.
    pub fn scan(bus: &dyn CameraBus) -> Result<Self, Error> {
        let cameras = bus.enumerate()?;
        info!("Detected {} camera(s).", cameras.len());
        for camera in cameras.iter() {
            debug!("Detected {}", camera);
        }
        Ok(Self { cameras })
    }

    /// Build a registry from known descriptors.
    pub fn from_descriptors(cameras: Vec<CameraDescriptor>) -> Self {
        Self { cameras }
    }

    /// Get the number of available cameras.
    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    /// Whether no camera was found.
    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }

    /// Iterate over the available cameras.
    pub fn iter(&self) -> impl Iterator<Item = &CameraDescriptor> {
        self.cameras.iter()
    }

    /// Find a camera by identifier.
    pub fn get(&self, id: &str) -> Option<&CameraDescriptor> {
        self.cameras.iter().find(|camera| camera.id == id)
    }

    /// Open the camera `id` and start its capture thread.
    ///
    /// # Errors
    ///  - [`Error::InvalidId`] if `id` was not found by the scan.
    ///  - Any error from [`CameraBus::open`] or [`CaptureUnit::new`].
    pub fn open(
        &self,
        bus: &dyn CameraBus,
        id: &str,
        config: CaptureConfig,
        sink: impl CaptureSink + 'static,
    ) -> Result<CaptureUnit, Error> {
        let camera = self
            .get(id)
            .ok_or_else(|| Error::InvalidId(id.to_string()))?;
        let hardware = bus.open(&camera.id)?;
        info!("Opened {}", camera);
        CaptureUnit::new(hardware, sink, config)
    }

    /// Open the first available camera.
    ///
    /// # Errors
    /// [`Error::NoCamerasAvailable`] if the registry is empty.
    pub fn open_first(
        &self,
        bus: &dyn CameraBus,
        config: CaptureConfig,
        sink: impl CaptureSink + 'static,
    ) -> Result<CaptureUnit, Error> {
        let camera = self.cameras.first().ok_or(Error::NoCamerasAvailable)?;
        self.open(bus, &camera.id, config, sink)
    }
}
