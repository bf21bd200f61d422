//! Capture-backend contract: the capability-oriented interface both the
//! unified and the low-level session implementations sit behind.
//!
//! The host application supplies the platform side (camera service, devices,
//! preview surfaces) through the traits in the variant modules; this module
//! defines what every backend owes the controller. Notification of preview
//! target destruction is wired by the host through the controller's
//! [`LifecycleScope`](crate::controller::LifecycleScope).

pub mod low_level;
pub mod unified;

use crate::crop::Rect;
use crate::error::CameraError;
use crate::frame::FrameBuffer;
use crate::pipeline::FrameQueue;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Which capture stack a controller drives. Chosen at construction, never
/// switched at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// High-level platform camera service with managed sessions and built-in
    /// analyzer backpressure.
    #[default]
    Unified,
    /// Direct device/session/request management over a raw camera service.
    LowLevel,
}

/// Physical lens orientation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LensFacing {
    Front,
    #[default]
    Back,
}

impl LensFacing {
    pub fn opposite(&self) -> Self {
        match self {
            LensFacing::Front => LensFacing::Back,
            LensFacing::Back => LensFacing::Front,
        }
    }
}

/// One enumerated physical camera.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraDescriptor {
    pub id: String,
    pub facing: LensFacing,
    /// Sensor active-array rectangle, immutable per device.
    pub sensor_rect: Rect,
    /// Maximum digital zoom the device reports.
    pub max_zoom: f32,
}

/// Opaque host-side token for a drawable target surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SurfaceHandle(pub u64);

impl SurfaceHandle {
    /// Reserved token for the backend-owned image-reader output stream.
    /// Hosts treat a session output with this handle as "allocate an image
    /// reader and deliver its frames as device events".
    pub const IMAGE_READER: SurfaceHandle = SurfaceHandle(u64::MAX);
}

/// Capability exposing a drawable surface, in the style of a managed preview
/// widget. Accepted by the unified backend.
pub trait SurfaceProvider: Send + Sync {
    fn surface(&self) -> SurfaceHandle;
}

/// Generic preview-target adapter that can expose either capability,
/// letting one caller-side type serve both backend variants.
pub trait PreviewProvider: Send + Sync {
    /// The managed-surface capability, if this provider supports it.
    fn as_surface_provider(&self) -> Option<Arc<dyn SurfaceProvider>>;
    /// The legacy raw-surface capability, if this provider supports it.
    fn as_raw_surface(&self) -> Option<SurfaceHandle>;
}

/// A preview target offered to `bind_preview`. Which variants a backend
/// accepts is part of its capability contract; a mismatch is reported as
/// [`CameraError::UnsupportedByBackend`], never silently ignored.
#[derive(Clone)]
pub enum PreviewTarget {
    /// Managed surface provider (unified backend).
    SurfaceProvider(Arc<dyn SurfaceProvider>),
    /// Legacy raw surface (low-level backend).
    RawSurface(SurfaceHandle),
    /// Generic provider resolved against the active backend's capability.
    Provider(Arc<dyn PreviewProvider>),
}

impl std::fmt::Debug for PreviewTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreviewTarget::SurfaceProvider(p) => {
                write!(f, "SurfaceProvider({:?})", p.surface())
            }
            PreviewTarget::RawSurface(s) => write!(f, "RawSurface({s:?})"),
            PreviewTarget::Provider(_) => write!(f, "Provider"),
        }
    }
}

/// Backend capability probes, used for policy decisions and diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    SurfaceProviderPreview,
    RawSurfacePreview,
    BuiltInAnalyzerAttachment,
}

/// Completion and hardware events a backend reports to its controller.
/// Delivery is marshaled onto the controller thread by [`EventSink`].
#[derive(Debug)]
pub enum BackendEvent {
    /// A preview frame was placed into the frame queue.
    FrameReady,
    StillCaptured(FrameBuffer),
    StillFailed(CameraError),
    /// The platform revoked the device.
    Disconnected,
}

/// Clonable, thread-safe channel from backend (and hardware callbacks) onto
/// the controller thread. Sending never blocks.
#[derive(Clone)]
pub struct EventSink {
    deliver: Arc<dyn Fn(BackendEvent) + Send + Sync>,
}

impl EventSink {
    pub(crate) fn new(deliver: impl Fn(BackendEvent) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn send(&self, event: BackendEvent) {
        (self.deliver)(event);
    }
}

/// Where preview frames go: the controller's frame queue plus the wake-up
/// event. Handed to whichever side produces analyzer frames: the unified
/// service's built-in attachment, or the low-level image-reader synthesis.
#[derive(Clone)]
pub struct FrameTap {
    queue: Arc<FrameQueue>,
    events: EventSink,
}

impl FrameTap {
    pub(crate) fn new(queue: Arc<FrameQueue>, events: EventSink) -> Self {
        Self { queue, events }
    }

    /// Deliver one frame toward the analyzer pipeline, applying the queue's
    /// backpressure policy.
    pub fn deliver(&self, frame: FrameBuffer) {
        self.queue.push(frame);
        self.events.send(BackendEvent::FrameReady);
    }
}

/// The session-lifecycle contract every backend variant implements.
///
/// All methods are invoked on the controller's delivery thread; backends own
/// their device and session handles and must release them in `shutdown`
/// best-effort, without panicking. `shutdown` releases session and device but
/// leaves the backend reusable for a subsequent `open`; terminal close is
/// the facade's concern.
pub trait CaptureBackend: Send {
    fn kind(&self) -> BackendKind;

    fn supports(&self, capability: Capability) -> bool;

    /// Enumerate physical cameras available through this backend's service.
    fn enumerate(&mut self) -> Result<Vec<CameraDescriptor>, CameraError>;

    /// Open the device selected by the controller. `events` carries
    /// completions and hardware faults; `frames` carries preview frames.
    fn open(
        &mut self,
        descriptor: &CameraDescriptor,
        events: EventSink,
        frames: FrameTap,
    ) -> Result<(), CameraError>;

    /// Establish the capture session for `target`, with the initial crop
    /// region already applied to the repeating request.
    fn bind_preview(&mut self, target: &PreviewTarget, crop: Option<Rect>)
        -> Result<(), CameraError>;

    /// Tear down the active session, if any. Idempotent.
    fn unbind(&mut self);

    fn has_session(&self) -> bool;

    /// Re-apply the crop region to the repeating request without restarting
    /// the preview stream.
    fn apply_crop(&mut self, crop: Option<Rect>) -> Result<(), CameraError>;

    /// Submit one still capture. Completion arrives as
    /// [`BackendEvent::StillCaptured`] or [`BackendEvent::StillFailed`].
    fn capture_still(&mut self, crop: Option<Rect>) -> Result<(), CameraError>;

    /// Release session and device, best-effort. Idempotent.
    fn shutdown(&mut self);
}
