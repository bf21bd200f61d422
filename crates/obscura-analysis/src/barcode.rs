//! Synchronous code-scanning analyzer.
//!
//! Barcodes and QR codes share one contract: a decoder over a grayscale
//! image producing the decoded payload, wired to a detection callback. The
//! analyzer runs inline on the dispatch thread and never retains frames.

use image::GrayImage;
use obscura_camera::{FrameAnalyzer, FrameBuffer};
use std::sync::Arc;

/// A symbology decoder. Implementations cover one family (Code 128, QR, and
/// so on); the analyzer is agnostic.
pub trait BarcodeDecoder: Send + Sync {
    /// Decode the first recognizable code, if any.
    fn decode(&self, image: &GrayImage) -> Option<String>;
}

/// Frame analyzer that feeds each preview frame through a [`BarcodeDecoder`]
/// and reports decoded payloads.
///
/// Register non-retaining: the pipeline releases the frame after dispatch.
pub struct BarcodeAnalyzer {
    decoder: Arc<dyn BarcodeDecoder>,
    on_detected: Box<dyn Fn(&str) + Send + Sync>,
}

impl BarcodeAnalyzer {
    pub fn new(
        decoder: Arc<dyn BarcodeDecoder>,
        on_detected: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            decoder,
            on_detected: Box::new(on_detected),
        }
    }
}

impl FrameAnalyzer for BarcodeAnalyzer {
    fn analyze(&self, frame: &FrameBuffer) {
        let image = match frame.to_luma() {
            Ok(image) => image,
            Err(err) => {
                tracing::warn!(sequence = frame.sequence(), error = %err, "frame not decodable");
                return;
            }
        };
        if let Some(payload) = self.decoder.decode(&image) {
            tracing::debug!(sequence = frame.sequence(), len = payload.len(), "code detected");
            (self.on_detected)(&payload);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use obscura_camera::{PixelFormat, Rotation};
    use std::sync::Mutex;

    struct FixedDecoder(Option<String>);
    impl BarcodeDecoder for FixedDecoder {
        fn decode(&self, _image: &GrayImage) -> Option<String> {
            self.0.clone()
        }
    }

    fn frame() -> FrameBuffer {
        FrameBuffer::new(
            vec![0u8; 8 * 8],
            8,
            8,
            PixelFormat::Gray8,
            Rotation::Deg0,
            1,
        )
        .unwrap()
    }

    #[test]
    fn reports_decoded_payload() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let analyzer = BarcodeAnalyzer::new(
            Arc::new(FixedDecoder(Some("CODE-128-PAYLOAD".into()))),
            move |payload| sink.lock().unwrap().push(payload.to_string()),
        );

        analyzer.analyze(&frame());
        assert_eq!(seen.lock().unwrap().as_slice(), &["CODE-128-PAYLOAD"]);
    }

    #[test]
    fn silent_when_nothing_decodes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let analyzer = BarcodeAnalyzer::new(Arc::new(FixedDecoder(None)), move |payload| {
            sink.lock().unwrap().push(payload.to_string())
        });

        analyzer.analyze(&frame());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn released_frame_is_skipped() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let analyzer = BarcodeAnalyzer::new(
            Arc::new(FixedDecoder(Some("X".into()))),
            move |payload| sink.lock().unwrap().push(payload.to_string()),
        );

        let frame = frame();
        frame.release().unwrap();
        analyzer.analyze(&frame);
        assert!(seen.lock().unwrap().is_empty());
    }
}
