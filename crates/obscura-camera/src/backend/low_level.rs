//! Low-level backend: direct device open/close, session configuration over
//! output surfaces, and repeating-request submission.
//!
//! This variant has no built-in analyzer attachment; analyzer frames are
//! synthesized from the device's image-reader events and routed through the
//! controller-owned frame queue.

use super::{
    BackendKind, CameraDescriptor, Capability, CaptureBackend, EventSink, FrameTap, PreviewTarget,
    SurfaceHandle,
};
use crate::backend::BackendEvent;
use crate::crop::Rect;
use crate::error::CameraError;
use std::sync::Arc;

/// Events a raw device reports from its hardware callback thread.
#[derive(Debug)]
pub enum DeviceEvent {
    /// An image-reader frame suitable for analysis.
    Frame(crate::frame::FrameBuffer),
    /// A completed still capture.
    Still(crate::frame::FrameBuffer),
    StillFailed(CameraError),
    /// The platform revoked the device.
    Disconnected,
}

/// Channel from a raw device's callback thread into the backend. Cheap to
/// clone, never blocks.
#[derive(Clone)]
pub struct DeviceEventSink {
    deliver: Arc<dyn Fn(DeviceEvent) + Send + Sync>,
}

impl DeviceEventSink {
    fn new(deliver: impl Fn(DeviceEvent) + Send + Sync + 'static) -> Self {
        Self {
            deliver: Arc::new(deliver),
        }
    }

    pub fn send(&self, event: DeviceEvent) {
        (self.deliver)(event);
    }
}

/// Image-reader stream parameters, forwarded to the host device so it can
/// size the still/analysis output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderConfig {
    pub width: u32,
    pub height: u32,
    /// Maximum images the reader may hold before recycling.
    pub max_images: usize,
}

/// Output set for one capture session: the caller's preview surface plus the
/// backend's synthesized image-reader stream.
#[derive(Debug, Clone)]
pub struct SessionOutputs {
    pub preview: SurfaceHandle,
    pub reader: SurfaceHandle,
    pub reader_config: ReaderConfig,
}

/// Host-supplied raw camera service: enumeration and device open.
pub trait RawCameraService: Send {
    fn enumerate(&mut self) -> Result<Vec<CameraDescriptor>, CameraError>;

    fn open_device(
        &mut self,
        id: &str,
        events: DeviceEventSink,
    ) -> Result<Box<dyn RawCameraDevice>, CameraError>;
}

/// An open raw device.
pub trait RawCameraDevice: Send {
    fn configure_session(
        &mut self,
        outputs: &SessionOutputs,
    ) -> Result<Box<dyn RawCaptureSession>, CameraError>;

    fn close(&mut self);
}

/// A configured raw capture session.
pub trait RawCaptureSession: Send {
    /// (Re)start the repeating preview request with the given crop region.
    fn set_repeating(&mut self, crop: Option<Rect>) -> Result<(), CameraError>;

    /// Submit one still request; the result arrives as [`DeviceEvent::Still`].
    fn submit_still(&mut self, crop: Option<Rect>) -> Result<(), CameraError>;

    fn close(&mut self);
}

pub struct LowLevelBackend {
    service: Box<dyn RawCameraService>,
    reader_config: ReaderConfig,
    device: Option<Box<dyn RawCameraDevice>>,
    session: Option<Box<dyn RawCaptureSession>>,
}

impl LowLevelBackend {
    pub fn new(service: Box<dyn RawCameraService>, reader_config: ReaderConfig) -> Self {
        Self {
            service,
            reader_config,
            device: None,
            session: None,
        }
    }

    fn resolve_surface(&self, target: &PreviewTarget) -> Result<SurfaceHandle, CameraError> {
        match target {
            PreviewTarget::RawSurface(surface) => Ok(*surface),
            PreviewTarget::Provider(provider) => {
                provider
                    .as_raw_surface()
                    .ok_or(CameraError::UnsupportedByBackend {
                        backend: BackendKind::LowLevel,
                        operation: "preview via provider without raw-surface capability",
                    })
            }
            PreviewTarget::SurfaceProvider(_) => Err(CameraError::UnsupportedByBackend {
                backend: BackendKind::LowLevel,
                operation: "managed surface-provider preview binding",
            }),
        }
    }
}

impl CaptureBackend for LowLevelBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::LowLevel
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(capability, Capability::RawSurfacePreview)
    }

    fn enumerate(&mut self) -> Result<Vec<CameraDescriptor>, CameraError> {
        self.service.enumerate()
    }

    fn open(
        &mut self,
        descriptor: &CameraDescriptor,
        events: EventSink,
        frames: FrameTap,
    ) -> Result<(), CameraError> {
        // Translate raw device events into backend events, synthesizing the
        // analyzer stream from the image reader.
        let sink = DeviceEventSink::new(move |event| match event {
            DeviceEvent::Frame(frame) => frames.deliver(frame),
            DeviceEvent::Still(frame) => events.send(BackendEvent::StillCaptured(frame)),
            DeviceEvent::StillFailed(err) => events.send(BackendEvent::StillFailed(err)),
            DeviceEvent::Disconnected => events.send(BackendEvent::Disconnected),
        });

        let device = self.service.open_device(&descriptor.id, sink)?;
        tracing::info!(camera = %descriptor.id, facing = ?descriptor.facing, "raw device opened");
        self.device = Some(device);
        Ok(())
    }

    fn bind_preview(
        &mut self,
        target: &PreviewTarget,
        crop: Option<Rect>,
    ) -> Result<(), CameraError> {
        let preview = self.resolve_surface(target)?;
        self.unbind();

        let device = self.device.as_mut().ok_or_else(|| {
            CameraError::SessionConfigurationFailed("device not open".into())
        })?;
        let outputs = SessionOutputs {
            preview,
            reader: SurfaceHandle::IMAGE_READER,
            reader_config: self.reader_config,
        };
        let mut session = device.configure_session(&outputs)?;
        session.set_repeating(crop)?;
        tracing::debug!(preview = ?preview, "raw session configured, repeating request running");
        self.session = Some(session);
        Ok(())
    }

    fn unbind(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            tracing::debug!("raw session closed");
        }
    }

    fn has_session(&self) -> bool {
        self.session.is_some()
    }

    fn apply_crop(&mut self, crop: Option<Rect>) -> Result<(), CameraError> {
        match self.session.as_mut() {
            Some(session) => session.set_repeating(crop),
            None => Err(CameraError::SessionConfigurationFailed(
                "no active session".into(),
            )),
        }
    }

    fn capture_still(&mut self, crop: Option<Rect>) -> Result<(), CameraError> {
        match self.session.as_mut() {
            Some(session) => session.submit_still(crop),
            None => Err(CameraError::SessionConfigurationFailed(
                "no active session".into(),
            )),
        }
    }

    fn shutdown(&mut self) {
        self.unbind();
        if let Some(mut device) = self.device.take() {
            device.close();
            tracing::debug!("raw device closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{Backpressure, FrameQueue};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    const READER: ReaderConfig = ReaderConfig {
        width: 1920,
        height: 1080,
        max_images: 2,
    };

    #[derive(Default)]
    struct Shared {
        sessions: AtomicUsize,
        repeating_crop: Mutex<Option<Option<Rect>>>,
        outputs: Mutex<Option<SessionOutputs>>,
    }

    struct Service {
        shared: Arc<Shared>,
    }
    struct Device {
        shared: Arc<Shared>,
    }
    struct Session {
        shared: Arc<Shared>,
    }

    impl RawCameraService for Service {
        fn enumerate(&mut self) -> Result<Vec<CameraDescriptor>, CameraError> {
            Ok(vec![])
        }
        fn open_device(
            &mut self,
            _id: &str,
            _events: DeviceEventSink,
        ) -> Result<Box<dyn RawCameraDevice>, CameraError> {
            Ok(Box::new(Device {
                shared: self.shared.clone(),
            }))
        }
    }

    impl RawCameraDevice for Device {
        fn configure_session(
            &mut self,
            outputs: &SessionOutputs,
        ) -> Result<Box<dyn RawCaptureSession>, CameraError> {
            self.shared.sessions.fetch_add(1, Ordering::SeqCst);
            *self.shared.outputs.lock().unwrap() = Some(outputs.clone());
            Ok(Box::new(Session {
                shared: self.shared.clone(),
            }))
        }
        fn close(&mut self) {}
    }

    impl RawCaptureSession for Session {
        fn set_repeating(&mut self, crop: Option<Rect>) -> Result<(), CameraError> {
            *self.shared.repeating_crop.lock().unwrap() = Some(crop);
            Ok(())
        }
        fn submit_still(&mut self, _crop: Option<Rect>) -> Result<(), CameraError> {
            Ok(())
        }
        fn close(&mut self) {
            self.shared.sessions.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn opened_backend(shared: &Arc<Shared>) -> LowLevelBackend {
        let mut backend = LowLevelBackend::new(
            Box::new(Service {
                shared: shared.clone(),
            }),
            READER,
        );
        let events = EventSink::new(|_| {});
        let tap = FrameTap::new(
            Arc::new(FrameQueue::new(Backpressure::KeepOnlyLatest)),
            events.clone(),
        );
        let descriptor = CameraDescriptor {
            id: "raw0".into(),
            facing: crate::backend::LensFacing::Back,
            sensor_rect: Rect::new(0, 0, 4000, 3000),
            max_zoom: 8.0,
        };
        backend.open(&descriptor, events, tap).unwrap();
        backend
    }

    #[test]
    fn surface_provider_is_unsupported() {
        struct Widget;
        impl crate::backend::SurfaceProvider for Widget {
            fn surface(&self) -> SurfaceHandle {
                SurfaceHandle(1)
            }
        }

        let shared = Arc::new(Shared::default());
        let mut backend = opened_backend(&shared);
        let err = backend
            .bind_preview(&PreviewTarget::SurfaceProvider(Arc::new(Widget)), None)
            .unwrap_err();
        assert!(matches!(
            err,
            CameraError::UnsupportedByBackend {
                backend: BackendKind::LowLevel,
                ..
            }
        ));
    }

    #[test]
    fn session_includes_image_reader_output() {
        let shared = Arc::new(Shared::default());
        let mut backend = opened_backend(&shared);
        backend
            .bind_preview(&PreviewTarget::RawSurface(SurfaceHandle(5)), None)
            .unwrap();

        let outputs = shared.outputs.lock().unwrap().clone().unwrap();
        assert_eq!(outputs.preview, SurfaceHandle(5));
        assert_eq!(outputs.reader, SurfaceHandle::IMAGE_READER);
        assert_eq!(outputs.reader_config, READER);
        assert_eq!(
            *shared.repeating_crop.lock().unwrap(),
            Some(None),
            "repeating request starts without crop at default zoom"
        );
    }

    #[test]
    fn rebind_and_shutdown_keep_at_most_one_session() {
        let shared = Arc::new(Shared::default());
        let mut backend = opened_backend(&shared);
        let target = PreviewTarget::RawSurface(SurfaceHandle(5));

        backend.bind_preview(&target, None).unwrap();
        backend.bind_preview(&target, None).unwrap();
        assert_eq!(shared.sessions.load(Ordering::SeqCst), 1);

        backend.shutdown();
        backend.shutdown();
        assert_eq!(shared.sessions.load(Ordering::SeqCst), 0);
        assert!(!backend.has_session());
    }

    #[test]
    fn apply_crop_restarts_repeating_request() {
        let shared = Arc::new(Shared::default());
        let mut backend = opened_backend(&shared);
        backend
            .bind_preview(&PreviewTarget::RawSurface(SurfaceHandle(5)), None)
            .unwrap();

        let crop = Rect::new(1000, 750, 3000, 2250);
        backend.apply_crop(Some(crop)).unwrap();
        assert_eq!(*shared.repeating_crop.lock().unwrap(), Some(Some(crop)));
    }
}
