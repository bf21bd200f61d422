//! Frame buffer with explicit single-release ownership, plus pixel-format
//! conversions (YUV420 planar, grayscale, JPEG) out of the raw buffer.

use image::{GrayImage, RgbImage};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame {sequence} released twice")]
    AlreadyReleased { sequence: u64 },
    #[error("frame {sequence} accessed after release")]
    Released { sequence: u64 },
    #[error("buffer too short for {width}x{height} {format:?}: expected {expected}, got {actual}")]
    InvalidLength {
        width: u32,
        height: u32,
        format: PixelFormat,
        expected: usize,
        actual: usize,
    },
    #[error("image decode failed: {0}")]
    Decode(String),
}

/// Pixel layout of a captured frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// 8-bit grayscale, one byte per pixel.
    Gray8,
    /// Planar YUV 4:2:0 (I420): full-size Y plane followed by quarter-size
    /// U and V planes.
    Yuv420,
    /// Packed 24-bit RGB.
    Rgb8,
    /// JPEG-compressed still image.
    Jpeg,
}

impl PixelFormat {
    /// Expected buffer length for a frame of this format, `None` for
    /// variable-length (compressed) formats.
    fn expected_len(&self, width: u32, height: u32) -> Option<usize> {
        let w = width as usize;
        let h = height as usize;
        // Chroma planes round up for odd dimensions.
        let cw = w.div_ceil(2);
        let ch = h.div_ceil(2);
        match self {
            PixelFormat::Gray8 => Some(w * h),
            PixelFormat::Yuv420 => Some(w * h + 2 * cw * ch),
            PixelFormat::Rgb8 => Some(w * h * 3),
            PixelFormat::Jpeg => None,
        }
    }
}

/// Display rotation applied to the frame, in degrees clockwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Deg0,
    Deg90,
    Deg180,
    Deg270,
}

impl Rotation {
    pub fn degrees(&self) -> u32 {
        match self {
            Rotation::Deg0 => 0,
            Rotation::Deg90 => 90,
            Rotation::Deg180 => 180,
            Rotation::Deg270 => 270,
        }
    }
}

struct FrameInner {
    /// Pixel data; taken (freed) on release even while other handles exist.
    data: Mutex<Option<Vec<u8>>>,
    released: AtomicBool,
    width: u32,
    height: u32,
    format: PixelFormat,
    rotation: Rotation,
    timestamp: Instant,
    sequence: u64,
}

/// One captured frame.
///
/// Handles are cheap clones of a shared buffer. The frame must be released
/// exactly once, by the pipeline after dispatch or by the analyzer that
/// declared retention. A second release is reported as
/// [`FrameError::AlreadyReleased`], never a panic.
#[derive(Clone)]
pub struct FrameBuffer {
    inner: Arc<FrameInner>,
}

impl FrameBuffer {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
        rotation: Rotation,
        sequence: u64,
    ) -> Result<Self, FrameError> {
        if let Some(expected) = format.expected_len(width, height) {
            if data.len() < expected {
                return Err(FrameError::InvalidLength {
                    width,
                    height,
                    format,
                    expected,
                    actual: data.len(),
                });
            }
        }
        Ok(Self {
            inner: Arc::new(FrameInner {
                data: Mutex::new(Some(data)),
                released: AtomicBool::new(false),
                width,
                height,
                format,
                rotation,
                timestamp: Instant::now(),
                sequence,
            }),
        })
    }

    pub fn width(&self) -> u32 {
        self.inner.width
    }

    pub fn height(&self) -> u32 {
        self.inner.height
    }

    pub fn format(&self) -> PixelFormat {
        self.inner.format
    }

    pub fn rotation(&self) -> Rotation {
        self.inner.rotation
    }

    pub fn timestamp(&self) -> Instant {
        self.inner.timestamp
    }

    pub fn sequence(&self) -> u64 {
        self.inner.sequence
    }

    pub fn is_released(&self) -> bool {
        self.inner.released.load(Ordering::Acquire)
    }

    /// Release the backing buffer. Frees the pixel memory for every handle.
    pub fn release(&self) -> Result<(), FrameError> {
        if self.inner.released.swap(true, Ordering::AcqRel) {
            return Err(FrameError::AlreadyReleased {
                sequence: self.inner.sequence,
            });
        }
        if let Ok(mut guard) = self.inner.data.lock() {
            guard.take();
        }
        Ok(())
    }

    /// Run `f` over the raw pixel data.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, FrameError> {
        let guard = self
            .inner
            .data
            .lock()
            .map_err(|_| self.released_err())?;
        match guard.as_deref() {
            Some(data) => Ok(f(data)),
            None => Err(self.released_err()),
        }
    }

    /// Extract a grayscale view of the frame.
    ///
    /// Gray frames pass through, YUV420 yields the Y plane, RGB is reduced
    /// with integer BT.601 luma weights, JPEG is decoded.
    pub fn to_luma(&self) -> Result<GrayImage, FrameError> {
        let w = self.inner.width;
        let h = self.inner.height;
        self.with_data(|data| match self.inner.format {
            PixelFormat::Gray8 | PixelFormat::Yuv420 => {
                let pixels = (w * h) as usize;
                GrayImage::from_raw(w, h, data[..pixels].to_vec()).ok_or(FrameError::Decode(
                    "gray plane does not match frame dimensions".into(),
                ))
            }
            PixelFormat::Rgb8 => {
                let luma = data
                    .chunks_exact(3)
                    .map(|px| {
                        let (r, g, b) = (px[0] as u32, px[1] as u32, px[2] as u32);
                        ((77 * r + 150 * g + 29 * b) >> 8) as u8
                    })
                    .collect();
                GrayImage::from_raw(w, h, luma).ok_or(FrameError::Decode(
                    "rgb data does not match frame dimensions".into(),
                ))
            }
            PixelFormat::Jpeg => image::load_from_memory(data)
                .map(|img| img.to_luma8())
                .map_err(|e| FrameError::Decode(e.to_string())),
        })?
    }

    /// Convert the frame to packed RGB.
    pub fn to_rgb(&self) -> Result<RgbImage, FrameError> {
        let w = self.inner.width;
        let h = self.inner.height;
        self.with_data(|data| match self.inner.format {
            PixelFormat::Rgb8 => RgbImage::from_raw(w, h, data.to_vec()).ok_or(
                FrameError::Decode("rgb data does not match frame dimensions".into()),
            ),
            PixelFormat::Gray8 => {
                let rgb = data
                    .iter()
                    .take((w * h) as usize)
                    .flat_map(|&y| [y, y, y])
                    .collect();
                RgbImage::from_raw(w, h, rgb).ok_or(FrameError::Decode(
                    "gray data does not match frame dimensions".into(),
                ))
            }
            PixelFormat::Yuv420 => yuv420_to_rgb(data, w, h),
            PixelFormat::Jpeg => image::load_from_memory(data)
                .map(|img| img.to_rgb8())
                .map_err(|e| FrameError::Decode(e.to_string())),
        })?
    }

    fn released_err(&self) -> FrameError {
        FrameError::Released {
            sequence: self.inner.sequence,
        }
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("sequence", &self.inner.sequence)
            .field("width", &self.inner.width)
            .field("height", &self.inner.height)
            .field("format", &self.inner.format)
            .field("rotation", &self.inner.rotation)
            .field("released", &self.is_released())
            .finish()
    }
}

/// Convert planar YUV 4:2:0 (I420) to packed RGB with fixed-point BT.601
/// full-swing coefficients.
pub fn yuv420_to_rgb(data: &[u8], width: u32, height: u32) -> Result<RgbImage, FrameError> {
    let w = width as usize;
    let h = height as usize;
    let cw = w.div_ceil(2);
    let ch = h.div_ceil(2);
    let expected = w * h + 2 * cw * ch;
    if data.len() < expected {
        return Err(FrameError::InvalidLength {
            width,
            height,
            format: PixelFormat::Yuv420,
            expected,
            actual: data.len(),
        });
    }

    let (y_plane, chroma) = data.split_at(w * h);
    let (u_plane, v_plane) = chroma.split_at(cw * ch);

    let mut rgb = Vec::with_capacity(w * h * 3);
    for row in 0..h {
        for col in 0..w {
            let y = y_plane[row * w + col] as i32;
            let ci = (row / 2) * cw + col / 2;
            let u = u_plane[ci] as i32 - 128;
            let v = v_plane[ci] as i32 - 128;

            let r = y + ((91_881 * v) >> 16);
            let g = y - ((22_554 * u + 46_802 * v) >> 16);
            let b = y + ((116_130 * u) >> 16);

            rgb.push(r.clamp(0, 255) as u8);
            rgb.push(g.clamp(0, 255) as u8);
            rgb.push(b.clamp(0, 255) as u8);
        }
    }

    RgbImage::from_raw(width, height, rgb)
        .ok_or(FrameError::Decode("yuv conversion size mismatch".into()))
}
