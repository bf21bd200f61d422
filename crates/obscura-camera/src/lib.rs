//! obscura-camera — Unified device-camera abstraction.
//!
//! One controller facade over two mutually exclusive capture backends: a
//! unified managed-session service and a low-level device/session stack.
//! Preview binding, still capture, zoom-as-crop, lens-facing selection, and
//! an analyzer pipeline with keep-only-latest backpressure all behave
//! identically across backends.

pub mod backend;
pub mod config;
pub mod controller;
pub mod crop;
pub mod error;
pub mod frame;
pub mod pipeline;

pub use backend::{BackendKind, CameraDescriptor, LensFacing, PreviewTarget};
pub use config::ControllerConfig;
pub use controller::{CameraController, CloseReason, LifecycleHandle, LifecycleScope, SessionState};
pub use crop::{zoom_crop, Rect};
pub use error::CameraError;
pub use frame::{FrameBuffer, FrameError, PixelFormat, Rotation};
pub use pipeline::{AnalyzerEntry, AnalyzerPipeline, Backpressure, FrameAnalyzer};
