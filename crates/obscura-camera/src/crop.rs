//! Zoom-to-crop mapping over the sensor active-array rectangle.

use serde::{Deserialize, Serialize};

/// Sensor-space rectangle: left/top inclusive, right/bottom exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Rect {
    pub fn new(left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    pub fn width(&self) -> i32 {
        self.right - self.left
    }

    pub fn height(&self) -> i32 {
        self.bottom - self.top
    }

    /// Integer center, matching platform rect semantics ((l + r) / 2).
    pub fn center_x(&self) -> i32 {
        (self.left + self.right) / 2
    }

    pub fn center_y(&self) -> i32 {
        (self.top + self.bottom) / 2
    }
}

/// Compute the digital-zoom crop region for a given zoom level.
///
/// The zoom is clamped to `[1.0, max_zoom]`. The crop keeps the sensor
/// center and shrinks both extents by the clamped zoom factor; at zoom 1
/// the result is the sensor rectangle itself. The result is never smaller
/// than 1×1.
pub fn zoom_crop(zoom: f32, max_zoom: f32, sensor: Rect) -> Rect {
    let z = zoom.clamp(1.0, max_zoom.max(1.0));
    let cx = sensor.center_x() as f32;
    let cy = sensor.center_y() as f32;
    let half_w = sensor.width() as f32 / (2.0 * z);
    let half_h = sensor.height() as f32 / (2.0 * z);

    let mut crop = Rect {
        left: (cx - half_w) as i32,
        top: (cy - half_h) as i32,
        right: (cx + half_w) as i32,
        bottom: (cy + half_h) as i32,
    };

    if crop.right <= crop.left {
        crop.right = crop.left + 1;
    }
    if crop.bottom <= crop.top {
        crop.bottom = crop.top + 1;
    }
    crop
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENSOR: Rect = Rect {
        left: 0,
        top: 0,
        right: 4000,
        bottom: 3000,
    };

    #[test]
    fn zoom_one_is_full_sensor() {
        assert_eq!(zoom_crop(1.0, 8.0, SENSOR), SENSOR);
    }

    #[test]
    fn zoom_two_halves_both_extents() {
        let crop = zoom_crop(2.0, 8.0, SENSOR);
        assert_eq!(crop, Rect::new(1000, 750, 3000, 2250));
    }

    #[test]
    fn zoom_below_one_clamps_to_full_sensor() {
        assert_eq!(zoom_crop(0.25, 8.0, SENSOR), SENSOR);
        assert_eq!(zoom_crop(-3.0, 8.0, SENSOR), SENSOR);
    }

    #[test]
    fn zoom_above_max_clamps_to_max() {
        let at_max = zoom_crop(4.0, 4.0, SENSOR);
        assert_eq!(zoom_crop(100.0, 4.0, SENSOR), at_max);
    }

    #[test]
    fn offset_sensor_rect_keeps_center() {
        let sensor = Rect::new(100, 100, 500, 400);
        let crop = zoom_crop(2.0, 4.0, sensor);
        assert_eq!(crop.center_x(), sensor.center_x());
        assert_eq!(crop.center_y(), sensor.center_y());
        assert_eq!(crop.width(), sensor.width() / 2);
        assert_eq!(crop.height(), sensor.height() / 2);
    }

    #[test]
    fn never_collapses_below_one_pixel() {
        let tiny = Rect::new(0, 0, 2, 2);
        let crop = zoom_crop(1000.0, 1000.0, tiny);
        assert!(crop.width() >= 1);
        assert!(crop.height() >= 1);
    }

    #[test]
    fn degenerate_max_zoom_treated_as_one() {
        // Devices that report no digital zoom capability get the full rect.
        assert_eq!(zoom_crop(3.0, 0.0, SENSOR), SENSOR);
    }
}
