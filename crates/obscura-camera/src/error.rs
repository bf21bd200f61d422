//! Error taxonomy for camera control and capture.

use crate::backend::{BackendKind, LensFacing};
use crate::controller::SessionState;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CameraError {
    #[error("no camera matches lens facing {facing:?}")]
    NoMatchingCamera { facing: LensFacing },

    #[error("{operation} is not supported by the {backend:?} backend")]
    UnsupportedByBackend {
        backend: BackendKind,
        operation: &'static str,
    },

    /// A still capture was requested while another is outstanding. The
    /// controller rejects rather than queues; see `CameraController::capture_still`.
    #[error("a still capture is already in flight")]
    CaptureBusy,

    #[error("capture session configuration failed: {0}")]
    SessionConfigurationFailed(String),

    /// The platform revoked the device. Non-recoverable: the controller
    /// transitions to `Closed` immediately.
    #[error("camera hardware disconnected")]
    HardwareDisconnected,

    #[error("operation cancelled by shutdown")]
    Cancelled,

    #[error("{operation} is not legal in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    #[error("controller thread exited")]
    ControllerGone,
}
