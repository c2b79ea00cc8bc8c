//! Preview overlay drawing.
//!
//! The detection engine annotates the RGBA preview as it works: ROI
//! rectangle, blue tint over the thresholded dark set, thin ellipses and
//! crosses for pupil candidates, Purkinje crosshair with its exclusion
//! circle, retained re-fit points, and a thick ellipse for the final pupil.
//! Everything here is best-effort eye candy for the operator; detection
//! results never depend on it.

use crate::detect::ellipse::Ellipse;
use crate::params::TrackingParams;
use image::{GrayImage, Rgba, RgbaImage};
use imageproc::drawing::{draw_hollow_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;

const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
const GREEN: Rgba<u8> = Rgba([0, 255, 0, 255]);
const ORANGE: Rgba<u8> = Rgba([255, 192, 0, 255]);
const TEAL: Rgba<u8> = Rgba([0, 255, 192, 255]);

/// Half-length of the crosshair arms, in pixels.
const CROSS_ARM: f32 = 20.0;

/// Copy the 8-bit source frame into the preview as gray RGBA.
pub fn init_preview(preview: &mut RgbaImage, source: &GrayImage) {
    for (dst, src) in preview.pixels_mut().zip(source.pixels()) {
        let v = src[0];
        *dst = Rgba([v, v, v, 255]);
    }
}

pub fn draw_roi(preview: &mut RgbaImage, roi: Rect) {
    draw_hollow_rect_mut(preview, roi, WHITE);
}

/// Tint the thresholded dark set blue so the operator sees what the pupil
/// threshold selects.
pub fn tint_dark(preview: &mut RgbaImage, mask: &GrayImage, roi: Rect) {
    for y in 0..mask.height() {
        for x in 0..mask.width() {
            if mask.get_pixel(x, y)[0] != 0 {
                let px = preview.get_pixel_mut(roi.left() as u32 + x, roi.top() as u32 + y);
                px[2] |= 150;
            }
        }
    }
}

/// Thin ellipse plus cross for a pupil candidate that passed the filter.
pub fn draw_candidate(preview: &mut RgbaImage, ellipse: &Ellipse) {
    draw_rotated_ellipse(preview, ellipse, GREEN);
    draw_cross(preview, ellipse.center, GREEN);
}

/// Search square, crosshair and exclusion circle for a Purkinje hit.
pub fn draw_purkinje(
    preview: &mut RgbaImage,
    pupil_center: (f32, f32),
    purkinje: (f32, f32),
    params: &TrackingParams,
) {
    let sa = params.purkinje_search_area as i32;
    let rect = Rect::at(pupil_center.0 as i32 - sa, pupil_center.1 as i32 - sa)
        .of_size((2 * sa) as u32, (2 * sa) as u32);
    draw_hollow_rect_mut(preview, rect, WHITE);
    draw_cross(preview, purkinje, ORANGE);
    draw_hollow_circle_mut(
        preview,
        (purkinje.0 as i32, purkinje.1 as i32),
        params.purkinje_exclude_area as i32,
        ORANGE,
    );
}

/// Contour points retained for the re-fit.
pub fn draw_fine_points(preview: &mut RgbaImage, points: &[(f32, f32)]) {
    for &(x, y) in points {
        draw_hollow_circle_mut(preview, (x as i32, y as i32), 1, WHITE);
    }
}

/// Final (re-fitted) pupil ellipse, drawn thick, plus cross.
pub fn draw_fine(preview: &mut RgbaImage, ellipse: &Ellipse) {
    draw_rotated_ellipse(preview, ellipse, TEAL);
    let grown = Ellipse {
        width: ellipse.width + 2.0,
        height: ellipse.height + 2.0,
        ..*ellipse
    };
    draw_rotated_ellipse(preview, &grown, TEAL);
    draw_cross(preview, ellipse.center, TEAL);
}

fn draw_cross(preview: &mut RgbaImage, center: (f32, f32), color: Rgba<u8>) {
    let (x, y) = center;
    draw_line_segment_mut(preview, (x, y - CROSS_ARM), (x, y + CROSS_ARM), color);
    draw_line_segment_mut(preview, (x - CROSS_ARM, y), (x + CROSS_ARM, y), color);
}

/// Rotated ellipses are drawn as a closed polyline; `imageproc` only rasters
/// axis-aligned ones.
fn draw_rotated_ellipse(preview: &mut RgbaImage, ellipse: &Ellipse, color: Rgba<u8>) {
    const SEGMENTS: usize = 48;
    let rad = ellipse.angle_deg.to_radians();
    let (sin, cos) = rad.sin_cos();
    let (rx, ry) = (ellipse.width / 2.0, ellipse.height / 2.0);
    let point = |i: usize| {
        let t = 2.0 * std::f32::consts::PI * (i % SEGMENTS) as f32 / SEGMENTS as f32;
        let (ex, ey) = (rx * t.cos(), ry * t.sin());
        (
            ellipse.center.0 + ex * cos - ey * sin,
            ellipse.center.1 + ex * sin + ey * cos,
        )
    };
    for i in 0..SEGMENTS {
        draw_line_segment_mut(preview, point(i), point(i + 1), color);
    }
}
