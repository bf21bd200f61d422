//! obscura-analysis — Ready-made frame analyzers for obscura-camera.
//!
//! Barcode/QR decoding, asynchronous face detection with frame retention,
//! and the preview-overlay coordinate transform for drawing detection
//! results over a letterboxed preview.

pub mod barcode;
pub mod face;
pub mod overlay;

pub use barcode::{BarcodeAnalyzer, BarcodeDecoder};
pub use face::{Face, FaceAnalyzer, FaceDetectError, FaceDetector};
pub use overlay::translate_bounds;
