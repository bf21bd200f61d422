//! Unified backend: session lifecycle delegated to a high-level platform
//! camera service with managed sessions and built-in analyzer attachment.

use super::{
    BackendKind, CameraDescriptor, Capability, CaptureBackend, EventSink, FrameTap, PreviewTarget,
    SurfaceHandle,
};
use crate::crop::Rect;
use crate::error::CameraError;
use crate::pipeline::Backpressure;

/// Host-supplied high-level camera service.
///
/// The service owns device selection and session plumbing; the backend only
/// asks it to open one managed session at a time. Frames flow through the
/// request's [`FrameTap`] (the service applies the requested backpressure),
/// completions and faults through its [`EventSink`].
pub trait UnifiedCameraService: Send {
    fn enumerate(&mut self) -> Result<Vec<CameraDescriptor>, CameraError>;

    fn open_session(
        &mut self,
        request: SessionRequest,
    ) -> Result<Box<dyn UnifiedSession>, CameraError>;
}

/// Everything the service needs to establish one managed session.
pub struct SessionRequest {
    pub camera_id: String,
    pub surface: SurfaceHandle,
    /// Destination for analyzer frames; built-in backpressure applies here.
    pub frames: FrameTap,
    pub events: EventSink,
    pub backpressure: Backpressure,
    /// Initial crop region for the repeating request, if zoom is non-default.
    pub crop: Option<Rect>,
}

/// One managed capture session.
pub trait UnifiedSession: Send {
    fn set_crop(&mut self, crop: Option<Rect>) -> Result<(), CameraError>;

    /// Completion arrives via the session's event sink.
    fn capture_still(&mut self, crop: Option<Rect>) -> Result<(), CameraError>;

    fn close(&mut self);
}

pub struct UnifiedBackend {
    service: Box<dyn UnifiedCameraService>,
    backpressure: Backpressure,
    camera_id: Option<String>,
    events: Option<EventSink>,
    frames: Option<FrameTap>,
    session: Option<Box<dyn UnifiedSession>>,
}

impl UnifiedBackend {
    pub fn new(service: Box<dyn UnifiedCameraService>, backpressure: Backpressure) -> Self {
        Self {
            service,
            backpressure,
            camera_id: None,
            events: None,
            frames: None,
            session: None,
        }
    }

    fn resolve_surface(&self, target: &PreviewTarget) -> Result<SurfaceHandle, CameraError> {
        match target {
            PreviewTarget::SurfaceProvider(provider) => Ok(provider.surface()),
            PreviewTarget::Provider(provider) => provider
                .as_surface_provider()
                .map(|p| p.surface())
                .ok_or(CameraError::UnsupportedByBackend {
                    backend: BackendKind::Unified,
                    operation: "preview via provider without surface-provider capability",
                }),
            PreviewTarget::RawSurface(_) => Err(CameraError::UnsupportedByBackend {
                backend: BackendKind::Unified,
                operation: "raw-surface preview binding",
            }),
        }
    }
}

impl CaptureBackend for UnifiedBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Unified
    }

    fn supports(&self, capability: Capability) -> bool {
        matches!(
            capability,
            Capability::SurfaceProviderPreview | Capability::BuiltInAnalyzerAttachment
        )
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
        // The managed service opens the device lazily at session setup; the
        // backend just records the selection.
        tracing::info!(camera = %descriptor.id, facing = ?descriptor.facing, "unified backend selected camera");
        self.camera_id = Some(descriptor.id.clone());
        self.events = Some(events);
        self.frames = Some(frames);
        Ok(())
    }

    fn bind_preview(
        &mut self,
        target: &PreviewTarget,
        crop: Option<Rect>,
    ) -> Result<(), CameraError> {
        let surface = self.resolve_surface(target)?;
        let camera_id = self.camera_id.clone().ok_or_else(|| {
            CameraError::SessionConfigurationFailed("no camera selected".into())
        })?;
        let (events, frames) = match (&self.events, &self.frames) {
            (Some(e), Some(f)) => (e.clone(), f.clone()),
            _ => {
                return Err(CameraError::SessionConfigurationFailed(
                    "backend not opened".into(),
                ))
            }
        };

        self.unbind();
        let session = self.service.open_session(SessionRequest {
            camera_id,
            surface,
            frames,
            events,
            backpressure: self.backpressure,
            crop,
        })?;
        tracing::debug!(surface = ?surface, "unified session configured");
        self.session = Some(session);
        Ok(())
    }

    fn unbind(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            tracing::debug!("unified session closed");
        }
    }

    fn has_session(&self) -> bool {
        self.session.is_some()
    }

    fn apply_crop(&mut self, crop: Option<Rect>) -> Result<(), CameraError> {
        match self.session.as_mut() {
            Some(session) => session.set_crop(crop),
            None => Err(CameraError::SessionConfigurationFailed(
                "no active session".into(),
            )),
        }
    }

    fn capture_still(&mut self, crop: Option<Rect>) -> Result<(), CameraError> {
        match self.session.as_mut() {
            Some(session) => session.capture_still(crop),
            None => Err(CameraError::SessionConfigurationFailed(
                "no active session".into(),
            )),
        }
    }

    fn shutdown(&mut self) {
        self.unbind();
        self.camera_id = None;
        self.events = None;
        self.frames = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SurfaceProvider;
    use crate::pipeline::FrameQueue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct NullService;
    impl UnifiedCameraService for NullService {
        fn enumerate(&mut self) -> Result<Vec<CameraDescriptor>, CameraError> {
            Ok(vec![])
        }
        fn open_session(
            &mut self,
            _request: SessionRequest,
        ) -> Result<Box<dyn UnifiedSession>, CameraError> {
            struct S;
            impl UnifiedSession for S {
                fn set_crop(&mut self, _crop: Option<Rect>) -> Result<(), CameraError> {
                    Ok(())
                }
                fn capture_still(&mut self, _crop: Option<Rect>) -> Result<(), CameraError> {
                    Ok(())
                }
                fn close(&mut self) {}
            }
            Ok(Box::new(S))
        }
    }

    fn opened_backend() -> UnifiedBackend {
        let mut backend = UnifiedBackend::new(Box::new(NullService), Backpressure::KeepOnlyLatest);
        let events = EventSink::new(|_| {});
        let tap = FrameTap::new(
            Arc::new(FrameQueue::new(Backpressure::KeepOnlyLatest)),
            events.clone(),
        );
        let descriptor = CameraDescriptor {
            id: "cam0".into(),
            facing: crate::backend::LensFacing::Back,
            sensor_rect: Rect::new(0, 0, 100, 100),
            max_zoom: 4.0,
        };
        backend.open(&descriptor, events, tap).unwrap();
        backend
    }

    #[test]
    fn raw_surface_is_unsupported() {
        let mut backend = opened_backend();
        let err = backend
            .bind_preview(&PreviewTarget::RawSurface(SurfaceHandle(1)), None)
            .unwrap_err();
        assert!(matches!(
            err,
            CameraError::UnsupportedByBackend {
                backend: BackendKind::Unified,
                ..
            }
        ));
    }

    #[test]
    fn provider_without_surface_capability_is_unsupported() {
        struct RawOnly;
        impl crate::backend::PreviewProvider for RawOnly {
            fn as_surface_provider(&self) -> Option<Arc<dyn SurfaceProvider>> {
                None
            }
            fn as_raw_surface(&self) -> Option<SurfaceHandle> {
                Some(SurfaceHandle(9))
            }
        }

        let mut backend = opened_backend();
        let err = backend
            .bind_preview(&PreviewTarget::Provider(Arc::new(RawOnly)), None)
            .unwrap_err();
        assert!(matches!(err, CameraError::UnsupportedByBackend { .. }));
    }

    #[test]
    fn rebind_closes_previous_session() {
        struct CountingService {
            open: Arc<AtomicUsize>,
        }
        struct CountingSession {
            open: Arc<AtomicUsize>,
        }
        impl UnifiedSession for CountingSession {
            fn set_crop(&mut self, _crop: Option<Rect>) -> Result<(), CameraError> {
                Ok(())
            }
            fn capture_still(&mut self, _crop: Option<Rect>) -> Result<(), CameraError> {
                Ok(())
            }
            fn close(&mut self) {
                self.open.fetch_sub(1, Ordering::SeqCst);
            }
        }
        impl UnifiedCameraService for CountingService {
            fn enumerate(&mut self) -> Result<Vec<CameraDescriptor>, CameraError> {
                Ok(vec![])
            }
            fn open_session(
                &mut self,
                _request: SessionRequest,
            ) -> Result<Box<dyn UnifiedSession>, CameraError> {
                self.open.fetch_add(1, Ordering::SeqCst);
                assert!(
                    self.open.load(Ordering::SeqCst) <= 1,
                    "previous session must be closed before a new one opens"
                );
                Ok(Box::new(CountingSession {
                    open: self.open.clone(),
                }))
            }
        }

        struct Widget;
        impl SurfaceProvider for Widget {
            fn surface(&self) -> SurfaceHandle {
                SurfaceHandle(42)
            }
        }

        let open = Arc::new(AtomicUsize::new(0));
        let mut backend = UnifiedBackend::new(
            Box::new(CountingService { open: open.clone() }),
            Backpressure::KeepOnlyLatest,
        );
        let events = EventSink::new(|_| {});
        let tap = FrameTap::new(
            Arc::new(FrameQueue::new(Backpressure::KeepOnlyLatest)),
            events.clone(),
        );
        let descriptor = CameraDescriptor {
            id: "cam0".into(),
            facing: crate::backend::LensFacing::Back,
            sensor_rect: Rect::new(0, 0, 100, 100),
            max_zoom: 4.0,
        };
        backend.open(&descriptor, events, tap).unwrap();

        let target = PreviewTarget::SurfaceProvider(Arc::new(Widget));
        backend.bind_preview(&target, None).unwrap();
        backend.bind_preview(&target, None).unwrap();
        assert_eq!(open.load(Ordering::SeqCst), 1);

        backend.shutdown();
        assert_eq!(open.load(Ordering::SeqCst), 0);
        assert!(!backend.has_session());
    }
}
