//! `CameraController`: the public facade composing a capture backend, the
//! analyzer pipeline, and zoom/lens-facing state behind a session state
//! machine.
//!
//! All session state lives on one dedicated controller thread per instance;
//! public methods are async and complete via oneshot replies, hardware events
//! are marshaled onto the same thread through [`EventSink`]. Concurrent still
//! captures are rejected with [`CameraError::CaptureBusy`], never queued.

use crate::backend::low_level::{LowLevelBackend, RawCameraService, ReaderConfig};
use crate::backend::unified::{UnifiedBackend, UnifiedCameraService};
use crate::backend::{
    BackendEvent, CameraDescriptor, CaptureBackend, EventSink, FrameTap, LensFacing, PreviewTarget,
};
use crate::config::ControllerConfig;
use crate::crop::{self, Rect};
use crate::error::CameraError;
use crate::frame::FrameBuffer;
use crate::pipeline::{AnalyzerEntry, AnalyzerPipeline, FrameQueue};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

/// Why a controller reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Explicit `shutdown()` call.
    Shutdown,
    /// The bound lifecycle scope signaled stop (or its handle was dropped).
    LifecycleStopped,
    /// The platform revoked the device.
    HardwareLost,
}

/// Controller session states. `Closed` is terminal: a closed controller is
/// never re-initialized, construct a new instance instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Initializing,
    Ready,
    PreviewBound,
    /// Transient: a still capture is in flight.
    Capturing,
    ShuttingDown,
    Closed(CloseReason),
}

/// Hosting-application lifecycle hook: a single "stopped" signal that
/// auto-releases camera resources, the way a preview surface destruction or
/// an activity stop would.
///
/// Dropping the [`LifecycleHandle`] counts as a stop.
pub struct LifecycleScope {
    rx: Option<std::sync::mpsc::Receiver<()>>,
}

pub struct LifecycleHandle {
    tx: std::sync::mpsc::Sender<()>,
}

impl LifecycleScope {
    pub fn new() -> (LifecycleHandle, LifecycleScope) {
        let (tx, rx) = std::sync::mpsc::channel();
        (LifecycleHandle { tx }, LifecycleScope { rx: Some(rx) })
    }

    /// A scope that never signals stop, for hosts managing teardown solely
    /// through `shutdown()`.
    pub fn detached() -> Self {
        LifecycleScope { rx: None }
    }

    fn is_detached(&self) -> bool {
        self.rx.is_none()
    }

    /// Block until the scope stops. Only called from the scope watcher thread.
    fn wait_stopped(self) {
        if let Some(rx) = self.rx {
            let _ = rx.recv();
        }
    }
}

impl LifecycleHandle {
    pub fn stop(self) {
        let _ = self.tx.send(());
    }
}

enum Msg {
    Initialize {
        reply: oneshot::Sender<Result<CameraDescriptor, CameraError>>,
    },
    SetLensFacing {
        facing: LensFacing,
        reply: oneshot::Sender<Result<LensFacing, CameraError>>,
    },
    BindPreview {
        target: PreviewTarget,
        scope: LifecycleScope,
        reply: oneshot::Sender<Result<(), CameraError>>,
    },
    CaptureStill {
        reply: oneshot::Sender<Result<FrameBuffer, CameraError>>,
    },
    SetZoom {
        level: f32,
        reply: oneshot::Sender<Result<f32, CameraError>>,
    },
    AddAnalyzer {
        entry: AnalyzerEntry,
        reply: oneshot::Sender<Result<(), CameraError>>,
    },
    RemoveAnalyzer {
        name: String,
        reply: oneshot::Sender<Result<bool, CameraError>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Backend(BackendEvent),
    ScopeStopped {
        generation: u64,
    },
}

/// Clone-safe handle to one camera controller instance.
#[derive(Clone)]
pub struct CameraController {
    tx: mpsc::UnboundedSender<Msg>,
    state_rx: watch::Receiver<SessionState>,
    queue: Arc<FrameQueue>,
}

impl CameraController {
    /// Controller over the unified (managed-session) backend.
    pub fn unified(service: Box<dyn UnifiedCameraService>, config: ControllerConfig) -> Self {
        let backend = UnifiedBackend::new(service, config.backpressure);
        Self::spawn(Box::new(backend), config)
    }

    /// Controller over the low-level (direct device/session) backend.
    pub fn low_level(service: Box<dyn RawCameraService>, config: ControllerConfig) -> Self {
        let reader = ReaderConfig {
            width: config.still_width,
            height: config.still_height,
            max_images: config.max_buffered_images,
        };
        Self::spawn(Box::new(LowLevelBackend::new(service, reader)), config)
    }

    fn spawn(backend: Box<dyn CaptureBackend>, config: ControllerConfig) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Msg>();
        let (state_tx, state_rx) = watch::channel(SessionState::Uninitialized);
        let queue = Arc::new(FrameQueue::new(config.backpressure));

        let events = {
            let tx = tx.clone();
            EventSink::new(move |event| {
                let _ = tx.send(Msg::Backend(event));
            })
        };
        let tap = FrameTap::new(queue.clone(), events.clone());

        let mut inner = Inner {
            backend,
            pipeline: AnalyzerPipeline::new(),
            queue: queue.clone(),
            events,
            tap,
            tx: tx.clone(),
            state: SessionState::Uninitialized,
            state_tx,
            desired_facing: config.lens_facing,
            selected: None,
            zoom: 1.0,
            bound_target: None,
            binding_generation: 0,
            pending_still: None,
        };

        std::thread::Builder::new()
            .name("obscura-camera".into())
            .spawn(move || {
                tracing::debug!("controller thread started");
                while let Some(msg) = rx.blocking_recv() {
                    inner.handle(msg);
                    if inner.is_closed() {
                        break;
                    }
                }
                // Drain anything already queued, then stop; late callers see
                // the closed state through the watch channel.
                while let Ok(msg) = rx.try_recv() {
                    inner.reject(msg);
                }
                tracing::debug!("controller thread exiting");
            })
            .expect("failed to spawn controller thread");

        Self {
            tx,
            state_rx,
            queue,
        }
    }

    /// Select and open the camera matching the configured lens facing.
    ///
    /// Falls back to the opposite facing when the requested one has no
    /// device; the fallback is visible in the returned descriptor. Legal only
    /// while `Uninitialized` (a failed attempt may be retried).
    pub async fn initialize(&self) -> Result<CameraDescriptor, CameraError> {
        self.call("initialize", |reply| Msg::Initialize { reply })
            .await
    }

    /// Change the desired lens facing, rebuilding the capture session if one
    /// is bound. Returns the facing actually in effect (fallback included).
    pub async fn set_lens_facing(&self, facing: LensFacing) -> Result<LensFacing, CameraError> {
        self.call("set_lens_facing", |reply| Msg::SetLensFacing { facing, reply })
            .await
    }

    /// Bind a preview target. At most one target is bound at a time;
    /// rebinding tears down the previous session first. When `scope` signals
    /// stop, the controller shuts itself down.
    pub async fn bind_preview(
        &self,
        target: PreviewTarget,
        scope: LifecycleScope,
    ) -> Result<(), CameraError> {
        self.call("bind_preview", |reply| Msg::BindPreview {
            target,
            scope,
            reply,
        })
        .await
    }

    /// Capture one still frame with the current crop region applied.
    ///
    /// Requires `PreviewBound`. A second request while one is outstanding is
    /// rejected with [`CameraError::CaptureBusy`].
    pub async fn capture_still(&self) -> Result<FrameBuffer, CameraError> {
        self.call("capture_still", |reply| Msg::CaptureStill { reply })
            .await
    }

    /// Set the zoom level, clamped to the device maximum. The recomputed
    /// crop region is applied to the active repeating request without
    /// interrupting the preview stream. Returns the clamped level.
    pub async fn set_zoom(&self, level: f32) -> Result<f32, CameraError> {
        self.call("set_zoom", |reply| Msg::SetZoom { level, reply })
            .await
    }

    /// Register an analyzer. Legal before or after binding.
    pub async fn add_analyzer(&self, entry: AnalyzerEntry) -> Result<(), CameraError> {
        self.call("add_analyzer", |reply| Msg::AddAnalyzer { entry, reply })
            .await
    }

    /// Remove every analyzer registered under `name`.
    pub async fn remove_analyzer(&self, name: &str) -> Result<bool, CameraError> {
        let name = name.to_string();
        self.call("remove_analyzer", |reply| Msg::RemoveAnalyzer { name, reply })
            .await
    }

    /// Release session, device, and buffered frames. Idempotent; any state
    /// transitions to `Closed`. Outstanding still captures resolve with
    /// [`CameraError::Cancelled`].
    pub async fn shutdown(&self) -> Result<(), CameraError> {
        if matches!(*self.state_rx.borrow(), SessionState::Closed(_)) {
            return Ok(());
        }
        let (reply, rx) = oneshot::channel();
        if self.tx.send(Msg::Shutdown { reply }).is_err() {
            // Controller thread already gone; it only exits once closed.
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    /// Watch session-state transitions, including the close reason.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    /// Preview frames released without analysis under backpressure.
    pub fn dropped_frames(&self) -> u64 {
        self.queue.dropped()
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        build: impl FnOnce(oneshot::Sender<Result<T, CameraError>>) -> Msg,
    ) -> Result<T, CameraError> {
        let state = *self.state_rx.borrow();
        if let SessionState::Closed(_) = state {
            return Err(CameraError::InvalidState { operation, state });
        }

        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .map_err(|_| CameraError::ControllerGone)?;
        match rx.await {
            Ok(result) => result,
            Err(_) => {
                // The controller closed between send and reply.
                let state = *self.state_rx.borrow();
                if let SessionState::Closed(_) = state {
                    Err(CameraError::InvalidState { operation, state })
                } else {
                    Err(CameraError::ControllerGone)
                }
            }
        }
    }
}

/// Controller-thread state. Everything here is confined to the dedicated
/// thread; no locking beyond the channels.
struct Inner {
    backend: Box<dyn CaptureBackend>,
    pipeline: AnalyzerPipeline,
    queue: Arc<FrameQueue>,
    events: EventSink,
    tap: FrameTap,
    tx: mpsc::UnboundedSender<Msg>,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    desired_facing: LensFacing,
    selected: Option<CameraDescriptor>,
    zoom: f32,
    bound_target: Option<PreviewTarget>,
    /// Bumped on every bind so stale scope-stop signals are ignored.
    binding_generation: u64,
    pending_still: Option<oneshot::Sender<Result<FrameBuffer, CameraError>>>,
}

impl Inner {
    fn handle(&mut self, msg: Msg) {
        match msg {
            Msg::Initialize { reply } => {
                let _ = reply.send(self.do_initialize());
            }
            Msg::SetLensFacing { facing, reply } => {
                let _ = reply.send(self.do_set_lens_facing(facing));
            }
            Msg::BindPreview {
                target,
                scope,
                reply,
            } => {
                let _ = reply.send(self.do_bind_preview(target, scope));
            }
            Msg::CaptureStill { reply } => self.do_capture_still(reply),
            Msg::SetZoom { level, reply } => {
                let _ = reply.send(self.do_set_zoom(level));
            }
            Msg::AddAnalyzer { entry, reply } => {
                self.pipeline.add(entry);
                let _ = reply.send(Ok(()));
            }
            Msg::RemoveAnalyzer { name, reply } => {
                let _ = reply.send(Ok(self.pipeline.remove(&name)));
            }
            Msg::Shutdown { reply } => {
                self.close(CloseReason::Shutdown);
                let _ = reply.send(());
            }
            Msg::Backend(event) => self.handle_backend_event(event),
            Msg::ScopeStopped { generation } => {
                if generation == self.binding_generation
                    && !matches!(
                        self.state,
                        SessionState::ShuttingDown | SessionState::Closed(_)
                    )
                {
                    tracing::info!("lifecycle scope stopped, shutting down");
                    self.close(CloseReason::LifecycleStopped);
                }
            }
        }
    }

    /// Queued messages arriving after close: answer without touching the
    /// backend.
    fn reject(&mut self, msg: Msg) {
        let state = self.state;
        match msg {
            Msg::Initialize { reply } => {
                let _ = reply.send(Err(CameraError::InvalidState {
                    operation: "initialize",
                    state,
                }));
            }
            Msg::SetLensFacing { reply, .. } => {
                let _ = reply.send(Err(CameraError::InvalidState {
                    operation: "set_lens_facing",
                    state,
                }));
            }
            Msg::BindPreview { reply, .. } => {
                let _ = reply.send(Err(CameraError::InvalidState {
                    operation: "bind_preview",
                    state,
                }));
            }
            Msg::CaptureStill { reply } => {
                let _ = reply.send(Err(CameraError::Cancelled));
            }
            Msg::SetZoom { reply, .. } => {
                let _ = reply.send(Err(CameraError::InvalidState {
                    operation: "set_zoom",
                    state,
                }));
            }
            Msg::AddAnalyzer { reply, .. } => {
                let _ = reply.send(Ok(()));
            }
            Msg::RemoveAnalyzer { name, reply } => {
                let _ = reply.send(Ok(self.pipeline.remove(&name)));
            }
            Msg::Shutdown { reply } => {
                let _ = reply.send(());
            }
            Msg::Backend(BackendEvent::StillCaptured(frame)) => {
                let _ = frame.release();
            }
            Msg::Backend(_) | Msg::ScopeStopped { .. } => {}
        }
    }

    fn is_closed(&self) -> bool {
        matches!(self.state, SessionState::Closed(_))
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "session state");
            self.state = state;
            let _ = self.state_tx.send(state);
        }
    }

    fn do_initialize(&mut self) -> Result<CameraDescriptor, CameraError> {
        if self.state != SessionState::Uninitialized {
            return Err(CameraError::InvalidState {
                operation: "initialize",
                state: self.state,
            });
        }
        self.set_state(SessionState::Initializing);
        match self.select_and_open(self.desired_facing) {
            Ok(descriptor) => {
                self.set_state(SessionState::Ready);
                Ok(descriptor)
            }
            Err(err) => {
                // Failed attempts may be retried from scratch.
                self.set_state(SessionState::Uninitialized);
                Err(err)
            }
        }
    }

    /// Enumerate, select by facing with opposite-facing fallback, open.
    fn select_and_open(&mut self, facing: LensFacing) -> Result<CameraDescriptor, CameraError> {
        let cameras = self.backend.enumerate()?;
        let descriptor = select_facing(&cameras, facing)?;
        self.backend
            .open(&descriptor, self.events.clone(), self.tap.clone())?;
        self.zoom = self.zoom.clamp(1.0, descriptor.max_zoom.max(1.0));
        self.desired_facing = descriptor.facing;
        self.selected = Some(descriptor.clone());
        Ok(descriptor)
    }

    fn do_set_lens_facing(&mut self, facing: LensFacing) -> Result<LensFacing, CameraError> {
        match self.state {
            SessionState::Uninitialized | SessionState::Initializing => {
                self.desired_facing = facing;
                Ok(facing)
            }
            SessionState::Ready => {
                self.backend.shutdown();
                self.selected = None;
                match self.select_and_open(facing) {
                    Ok(descriptor) => Ok(descriptor.facing),
                    Err(err) => {
                        self.set_state(SessionState::Uninitialized);
                        Err(err)
                    }
                }
            }
            SessionState::PreviewBound => self.rebuild_session(facing),
            SessionState::Capturing => Err(CameraError::CaptureBusy),
            state @ (SessionState::ShuttingDown | SessionState::Closed(_)) => {
                Err(CameraError::InvalidState {
                    operation: "set_lens_facing",
                    state,
                })
            }
        }
    }

    /// Tear down and rebuild the bound session on a different camera,
    /// preserving target and zoom. On failure the previous camera is
    /// restored; if even that fails the hardware is gone and the controller
    /// closes.
    fn rebuild_session(&mut self, facing: LensFacing) -> Result<LensFacing, CameraError> {
        let target = self.bound_target.clone().ok_or_else(|| {
            CameraError::SessionConfigurationFailed("preview bound without a target".into())
        })?;
        let previous = self.selected.clone();

        self.backend.unbind();
        self.backend.shutdown();
        self.selected = None;

        let rebuilt = self.select_and_open(facing).and_then(|descriptor| {
            let crop = self.crop_region();
            self.backend.bind_preview(&target, crop)?;
            Ok(descriptor.facing)
        });

        match rebuilt {
            Ok(actual) => Ok(actual),
            Err(err) => {
                tracing::warn!(error = %err, "session rebuild failed, restoring previous camera");
                self.backend.shutdown();
                let restored = previous.ok_or(CameraError::HardwareDisconnected).and_then(
                    |descriptor| {
                        self.backend.open(
                            &descriptor,
                            self.events.clone(),
                            self.tap.clone(),
                        )?;
                        self.selected = Some(descriptor);
                        let crop = self.crop_region();
                        self.backend.bind_preview(&target, crop)
                    },
                );
                if let Err(restore_err) = restored {
                    tracing::error!(error = %restore_err, "failed to restore previous session");
                    self.close(CloseReason::HardwareLost);
                }
                Err(err)
            }
        }
    }

    fn do_bind_preview(
        &mut self,
        target: PreviewTarget,
        scope: LifecycleScope,
    ) -> Result<(), CameraError> {
        match self.state {
            SessionState::Ready | SessionState::PreviewBound => {}
            SessionState::Capturing => return Err(CameraError::CaptureBusy),
            state => {
                return Err(CameraError::InvalidState {
                    operation: "bind_preview",
                    state,
                })
            }
        }

        // Exactly one prior session is torn down before the next is built.
        self.backend.unbind();

        let crop = self.crop_region();
        if let Err(err) = self.backend.bind_preview(&target, crop) {
            self.bound_target = None;
            self.set_state(SessionState::Ready);
            return Err(err);
        }

        self.binding_generation += 1;
        self.spawn_scope_watcher(scope, self.binding_generation);
        self.bound_target = Some(target);
        self.set_state(SessionState::PreviewBound);
        Ok(())
    }

    fn spawn_scope_watcher(&self, scope: LifecycleScope, generation: u64) {
        if scope.is_detached() {
            return;
        }
        let tx = self.tx.clone();
        let spawned = std::thread::Builder::new()
            .name("obscura-scope".into())
            .spawn(move || {
                scope.wait_stopped();
                let _ = tx.send(Msg::ScopeStopped { generation });
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "failed to spawn scope watcher thread");
        }
    }

    fn do_capture_still(&mut self, reply: oneshot::Sender<Result<FrameBuffer, CameraError>>) {
        if self.pending_still.is_some() || self.state == SessionState::Capturing {
            let _ = reply.send(Err(CameraError::CaptureBusy));
            return;
        }
        if self.state != SessionState::PreviewBound {
            let _ = reply.send(Err(CameraError::InvalidState {
                operation: "capture_still",
                state: self.state,
            }));
            return;
        }

        let crop = self.crop_region();
        match self.backend.capture_still(crop) {
            Ok(()) => {
                self.pending_still = Some(reply);
                self.set_state(SessionState::Capturing);
            }
            Err(err) => {
                let _ = reply.send(Err(err));
            }
        }
    }

    fn do_set_zoom(&mut self, level: f32) -> Result<f32, CameraError> {
        if matches!(
            self.state,
            SessionState::ShuttingDown | SessionState::Closed(_)
        ) {
            return Err(CameraError::InvalidState {
                operation: "set_zoom",
                state: self.state,
            });
        }

        self.zoom = match self.selected.as_ref() {
            Some(descriptor) => level.clamp(1.0, descriptor.max_zoom.max(1.0)),
            // Device max unknown before initialize; re-clamped on open.
            None => level.max(1.0),
        };

        if self.backend.has_session() {
            let crop = self.crop_region();
            self.backend.apply_crop(crop)?;
        }
        Ok(self.zoom)
    }

    /// Current crop region, `None` at default zoom.
    fn crop_region(&self) -> Option<Rect> {
        let descriptor = self.selected.as_ref()?;
        let z = self.zoom.clamp(1.0, descriptor.max_zoom.max(1.0));
        if z <= 1.0 {
            return None;
        }
        Some(crop::zoom_crop(z, descriptor.max_zoom, descriptor.sensor_rect))
    }

    fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::FrameReady => {
                if let Some(frame) = self.queue.pop() {
                    match self.state {
                        SessionState::PreviewBound | SessionState::Capturing => {
                            self.pipeline.dispatch(frame);
                        }
                        _ => {
                            let _ = frame.release();
                        }
                    }
                }
            }
            BackendEvent::StillCaptured(frame) => {
                // Settle the state before resolving the caller, so the state
                // they observe after the await is never the transient one.
                if self.state == SessionState::Capturing {
                    self.set_state(SessionState::PreviewBound);
                }
                match self.pending_still.take() {
                    Some(reply) => {
                        if let Err(Ok(unclaimed)) = reply.send(Ok(frame)) {
                            let _ = unclaimed.release();
                        }
                    }
                    None => {
                        tracing::warn!(sequence = frame.sequence(), "unsolicited still capture");
                        let _ = frame.release();
                    }
                }
            }
            BackendEvent::StillFailed(err) => {
                tracing::warn!(error = %err, "still capture failed");
                if self.state == SessionState::Capturing {
                    self.set_state(SessionState::PreviewBound);
                }
                self.fail_pending(err);
            }
            BackendEvent::Disconnected => {
                tracing::error!("camera hardware disconnected");
                self.fail_pending(CameraError::HardwareDisconnected);
                self.close(CloseReason::HardwareLost);
            }
        }
    }

    fn fail_pending(&mut self, err: CameraError) {
        if let Some(reply) = self.pending_still.take() {
            let _ = reply.send(Err(err));
        }
    }

    /// Best-effort release of everything; never panics past this boundary.
    fn close(&mut self, reason: CloseReason) {
        if self.is_closed() {
            return;
        }
        self.set_state(SessionState::ShuttingDown);
        self.fail_pending(CameraError::Cancelled);
        self.backend.unbind();
        self.backend.shutdown();
        self.queue.clear();
        self.bound_target = None;
        tracing::info!(?reason, "controller closed");
        self.set_state(SessionState::Closed(reason));
    }
}

fn select_facing(
    cameras: &[CameraDescriptor],
    facing: LensFacing,
) -> Result<CameraDescriptor, CameraError> {
    if let Some(descriptor) = cameras.iter().find(|d| d.facing == facing) {
        return Ok(descriptor.clone());
    }
    if let Some(descriptor) = cameras.iter().find(|d| d.facing == facing.opposite()) {
        tracing::warn!(
            requested = ?facing,
            actual = ?descriptor.facing,
            camera = %descriptor.id,
            "requested lens facing unavailable, falling back"
        );
        return Ok(descriptor.clone());
    }
    Err(CameraError::NoMatchingCamera { facing })
}
