//! Image-to-view coordinate transform for detection overlays.

use obscura_camera::{Rect, Rotation};

/// Map a detection rectangle from image coordinates onto a preview view.
///
/// The image is assumed drawn fit-center: scaled uniformly to fit the view
/// and letterboxed on the shorter axis. `rotation` is the frame's rotation
/// relative to the view; the rectangle is rotated accordingly before the
/// scale and offsets apply.
pub fn translate_bounds(
    bounds: Rect,
    image_width: u32,
    image_height: u32,
    view_width: u32,
    view_height: u32,
    rotation: Rotation,
) -> Rect {
    let (iw, ih) = (image_width as f32, image_height as f32);
    let (vw, vh) = (view_width as f32, view_height as f32);
    let scale = (vw / iw).min(vh / ih);
    let offset_x = (vw - iw * scale) / 2.0;
    let offset_y = (vh - ih * scale) / 2.0;

    let (l, t, r, b) = (
        bounds.left as f32,
        bounds.top as f32,
        bounds.right as f32,
        bounds.bottom as f32,
    );

    let (left, top, right, bottom) = match rotation {
        Rotation::Deg90 => (
            vw - b * scale - offset_x,
            l * scale + offset_y,
            vw - t * scale - offset_x,
            r * scale + offset_y,
        ),
        Rotation::Deg180 => (
            vw - r * scale - offset_x,
            vh - b * scale - offset_y,
            vw - l * scale - offset_x,
            vh - t * scale - offset_y,
        ),
        Rotation::Deg270 => (
            t * scale + offset_x,
            vh - r * scale - offset_y,
            b * scale + offset_x,
            vh - l * scale - offset_y,
        ),
        Rotation::Deg0 => (
            l * scale + offset_x,
            t * scale + offset_y,
            r * scale + offset_x,
            b * scale + offset_y,
        ),
    };

    Rect::new(left as i32, top as i32, right as i32, bottom as i32)
}
