use serde::{Deserialize, Serialize};
use std::fmt::Display;

/// What the capture subsystem is doing right now.
///
/// Exactly one value is active at any instant. The value is owned by
/// [`crate::CaptureUnit`] and only changes under its lock.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CaptureState {
    /// Nothing in flight, the supervisor is parked.
    #[default]
    Idle,
    /// A single exposure is being timed or downloaded.
    Exposing,
    /// Live frames are being pulled continuously.
    Streaming,
    /// The watchdog expired and the previous request is being re-armed.
    RestartingExposure,
    /// An abort was requested and the supervisor has not yet acknowledged it.
    Aborting,
    /// Shutdown was requested.
    Terminating,
    /// The supervisor thread has exited. Terminal.
    Terminated,
}

impl CaptureState {
    /// Check whether `self -> next` is an edge of the capture state machine.
    ///
    /// `Exposing -> Idle` covers both frame handoff and exhausted retries,
    /// `Streaming -> Idle` is a stop request.
    pub fn can_transition(self, next: CaptureState) -> bool {
        use CaptureState::*;
        match (self, next) {
            (Terminated, _) => false,
            (Terminating, Terminated) => true,
            (Terminating, _) => false,
            (_, Terminating) => true,
            (Idle, Exposing) | (Idle, Streaming) => true,
            (Exposing, Idle) | (Exposing, Aborting) | (Exposing, RestartingExposure) => true,
            (RestartingExposure, Exposing) | (RestartingExposure, Aborting) => true,
            // A restart that cannot re-arm the hardware gives up.
            (RestartingExposure, Idle) => true,
            (Streaming, Idle) | (Streaming, Aborting) => true,
            (Aborting, Idle) => true,
            _ => false,
        }
    }

    /// Whether a capture activity (exposure or stream) is in flight.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            CaptureState::Exposing | CaptureState::Streaming | CaptureState::RestartingExposure
        )
    }
}

impl Display for CaptureState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CaptureState::Idle => "Idle",
            CaptureState::Exposing => "Exposing",
            CaptureState::Streaming => "Streaming",
            CaptureState::RestartingExposure => "RestartingExposure",
            CaptureState::Aborting => "Aborting",
            CaptureState::Terminating => "Terminating",
            CaptureState::Terminated => "Terminated",
        };
        write!(f, "{}", name)
    }
}
