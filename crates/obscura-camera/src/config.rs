//! Controller configuration, loadable from environment variables or TOML.

use crate::backend::{BackendKind, LensFacing};
use crate::pipeline::Backpressure;
use serde::Deserialize;

/// Construction-time knobs for a [`CameraController`](crate::controller::CameraController).
///
/// `backend` is host policy: it selects which constructor the host calls, in
/// the same way a build flag would pick the capture stack. It never switches
/// at runtime.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ControllerConfig {
    pub backend: BackendKind,
    pub lens_facing: LensFacing,
    /// Backpressure for the analyzer frame stream.
    pub backpressure: Backpressure,
    /// Still-capture resolution hint (the device may deliver the closest
    /// supported size).
    pub still_width: u32,
    pub still_height: u32,
    /// Image-reader depth for the low-level backend.
    pub max_buffered_images: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            lens_facing: LensFacing::default(),
            backpressure: Backpressure::default(),
            still_width: 1920,
            still_height: 1080,
            max_buffered_images: 2,
        }
    }
}

impl ControllerConfig {
    /// Load configuration from `OBSCURA_*` environment variables with
    /// defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            backend: match std::env::var("OBSCURA_BACKEND").as_deref() {
                Ok("low-level") => BackendKind::LowLevel,
                Ok("unified") => BackendKind::Unified,
                _ => defaults.backend,
            },
            lens_facing: match std::env::var("OBSCURA_LENS_FACING").as_deref() {
                Ok("front") => LensFacing::Front,
                Ok("back") => LensFacing::Back,
                _ => defaults.lens_facing,
            },
            backpressure: match std::env::var("OBSCURA_BACKPRESSURE").as_deref() {
                Ok("queue-all") => Backpressure::QueueAll,
                Ok("keep-only-latest") => Backpressure::KeepOnlyLatest,
                _ => defaults.backpressure,
            },
            still_width: env_u32("OBSCURA_STILL_WIDTH", defaults.still_width),
            still_height: env_u32("OBSCURA_STILL_HEIGHT", defaults.still_height),
            max_buffered_images: env_usize(
                "OBSCURA_MAX_BUFFERED_IMAGES",
                defaults.max_buffered_images,
            ),
        }
    }

    /// Parse configuration from a TOML document. Missing keys take defaults.
    pub fn from_toml_str(input: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(input)
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ControllerConfig::default();
        assert_eq!(config.backend, BackendKind::Unified);
        assert_eq!(config.lens_facing, LensFacing::Back);
        assert_eq!(config.backpressure, Backpressure::KeepOnlyLatest);
        assert_eq!(config.still_width, 1920);
        assert_eq!(config.max_buffered_images, 2);
    }

    #[test]
    fn toml_overrides() {
        let config = ControllerConfig::from_toml_str(
            r#"
            backend = "low-level"
            lens-facing = "front"
            backpressure = "queue-all"
            still-width = 1280
            still-height = 720
            "#,
        )
        .unwrap();
        assert_eq!(config.backend, BackendKind::LowLevel);
        assert_eq!(config.lens_facing, LensFacing::Front);
        assert_eq!(config.backpressure, Backpressure::QueueAll);
        assert_eq!(config.still_width, 1280);
        assert_eq!(config.still_height, 720);
        // Unset keys keep defaults.
        assert_eq!(config.max_buffered_images, 2);
    }

    #[test]
    fn toml_rejects_unknown_backend() {
        assert!(ControllerConfig::from_toml_str(r#"backend = "hal9000""#).is_err());
    }
}
