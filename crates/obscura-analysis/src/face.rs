//! Asynchronous face-detection analyzer.
//!
//! Detection is slower than the frame interval, so the analyzer hands frames
//! to a worker thread over a depth-1 channel and drops frames that arrive
//! while the detector is busy. The analyzer retains dispatched frames and
//! the worker releases them once detection finishes; register it with
//! `AnalyzerEntry::retaining`.

use image::GrayImage;
use obscura_camera::frame::FrameError;
use obscura_camera::{FrameAnalyzer, FrameBuffer, Rect, Rotation};
use serde::{Deserialize, Serialize};
use std::sync::mpsc::{sync_channel, SyncSender, TrySendError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaceDetectError {
    #[error("detector failed: {0}")]
    Detector(String),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// One detected face, in image coordinates. Use
/// [`translate_bounds`](crate::overlay::translate_bounds) to map `bounds`
/// onto a preview view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Face {
    pub bounds: Rect,
    pub confidence: f32,
    /// Stable id across consecutive frames, when the detector tracks.
    pub tracking_id: Option<u32>,
}

/// Host-supplied detection engine.
pub trait FaceDetector: Send {
    fn detect(&mut self, image: &GrayImage, rotation: Rotation)
        -> Result<Vec<Face>, FaceDetectError>;
}

type FacesCallback = dyn Fn(&[Face], &FrameBuffer) + Send + Sync;
type ErrorCallback = dyn Fn(FaceDetectError) + Send + Sync;

/// Frame analyzer running a [`FaceDetector`] off the dispatch thread.
///
/// `on_faces` receives the detections together with the originating frame,
/// still unreleased, so callers can crop or snapshot it. The worker releases
/// the frame after the callback returns. Dropping the analyzer stops the
/// worker once the in-flight frame finishes.
pub struct FaceAnalyzer {
    tx: SyncSender<FrameBuffer>,
}

impl FaceAnalyzer {
    pub fn new(
        mut detector: Box<dyn FaceDetector>,
        on_faces: impl Fn(&[Face], &FrameBuffer) + Send + Sync + 'static,
        on_error: impl Fn(FaceDetectError) + Send + Sync + 'static,
    ) -> Self {
        let on_faces: Box<FacesCallback> = Box::new(on_faces);
        let on_error: Box<ErrorCallback> = Box::new(on_error);
        let (tx, rx) = sync_channel::<FrameBuffer>(1);

        let spawned = std::thread::Builder::new()
            .name("obscura-face".into())
            .spawn(move || {
                while let Ok(frame) = rx.recv() {
                    let result = frame
                        .to_luma()
                        .map_err(FaceDetectError::from)
                        .and_then(|image| detector.detect(&image, frame.rotation()));
                    match result {
                        Ok(faces) => on_faces(&faces, &frame),
                        Err(err) => on_error(err),
                    }
                    if let Err(err) = frame.release() {
                        tracing::warn!(sequence = frame.sequence(), error = %err, "face frame already released");
                    }
                }
            });
        if let Err(err) = spawned {
            tracing::error!(error = %err, "failed to spawn face detection worker");
        }

        Self { tx }
    }
}

impl FrameAnalyzer for FaceAnalyzer {
    fn analyze(&self, frame: &FrameBuffer) {
        match self.tx.try_send(frame.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) | Err(TrySendError::Disconnected(frame)) => {
                // Detector busy (or worker gone): drop this frame now so the
                // stream never stalls behind detection.
                tracing::trace!(sequence = frame.sequence(), "face detector busy, frame dropped");
                if let Err(err) = frame.release() {
                    tracing::warn!(sequence = frame.sequence(), error = %err, "dropped frame already released");
                }
            }
        }
    }
}
