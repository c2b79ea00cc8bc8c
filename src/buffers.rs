//! Owned image buffers and the detection ROI.
//!
//! The process owns four pixel buffers for its whole lifetime: the 8-bit
//! monochrome source frame the camera writes into, the RGBA preview the
//! detection engine overlays, the RGBA calibration-result plot, and the byte
//! buffer used for out-of-band image transfer to the client. Preview and
//! plot contents are transient; no caller may assume pixels persist across
//! frames.

use crate::config::Settings;
use crate::error::{AppResult, GazeError};
use image::{GrayImage, RgbaImage};
use imageproc::rect::Rect;

/// All process-owned image buffers plus the centered detection ROI.
pub struct Buffers {
    /// 8-bit monochrome camera frame. Mutated only by the capture side
    /// between successive detection runs.
    pub source: GrayImage,
    /// 32-bit preview, same dimensions as `source`. Mutated only by the
    /// detection engine.
    pub preview: RgbaImage,
    /// Detection-error label for the current preview frame, when error
    /// display is enabled. Rendered by the GUI, not rasterized here.
    pub preview_note: Option<String>,
    /// Calibration-result plot at preview dimensions.
    pub cal_plot: RgbaImage,
    /// Centered detection ROI in frame coordinates.
    pub roi: Rect,
}

impl Buffers {
    pub fn new(settings: &Settings) -> AppResult<Self> {
        let c = &settings.common;
        if c.camera_width == 0 || c.camera_height == 0 || c.preview_width == 0
            || c.preview_height == 0
        {
            return Err(GazeError::Buffer(format!(
                "wrong camera/preview size ({},{},{},{})",
                c.camera_width, c.camera_height, c.preview_width, c.preview_height
            )));
        }
        if c.roi_width == 0
            || c.roi_height == 0
            || c.roi_width > c.camera_width
            || c.roi_height > c.camera_height
        {
            return Err(GazeError::Buffer(
                "ROI width/height must be positive and no larger than the camera frame".into(),
            ));
        }
        let roi = Rect::at(
            ((c.camera_width - c.roi_width) / 2) as i32,
            ((c.camera_height - c.roi_height) / 2) as i32,
        )
        .of_size(c.roi_width, c.roi_height);
        Ok(Self {
            source: GrayImage::new(c.camera_width, c.camera_height),
            preview: RgbaImage::new(c.camera_width, c.camera_height),
            preview_note: None,
            cal_plot: RgbaImage::new(c.preview_width, c.preview_height),
            roi,
        })
    }

    /// Extract the ROI of the source frame for wire transfer.
    ///
    /// Zero bytes are reserved as the transfer terminator, so a pixel value
    /// of 0 encodes as 1; values below the pupil threshold also encode as 1,
    /// which lets the client display the thresholded dark set directly.
    pub fn fill_send_image(&self, threshold: u8, out: &mut Vec<u8>) {
        let (w, h) = (self.roi.width(), self.roi.height());
        out.clear();
        out.reserve((w * h) as usize);
        for y in 0..h {
            for x in 0..w {
                let px = self
                    .source
                    .get_pixel(self.roi.left() as u32 + x, self.roi.top() as u32 + y)[0];
                out.push(if px < threshold.max(1) { 1 } else { px });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;

    #[test]
    fn test_roi_is_centered() {
        let s = Settings::for_tests(640, 480, 320, 240);
        let b = Buffers::new(&s).expect("buffers");
        assert_eq!(b.roi.left(), 160);
        assert_eq!(b.roi.top(), 120);
        assert_eq!(b.roi.width(), 320);
        assert_eq!(b.roi.height(), 240);
    }

    #[test]
    fn test_oversized_roi_rejected() {
        let s = Settings::for_tests(320, 240, 640, 240);
        assert!(Buffers::new(&s).is_err());
    }

    #[test]
    fn test_send_image_reserves_zero() {
        let s = Settings::for_tests(8, 8, 4, 4);
        let mut b = Buffers::new(&s).expect("buffers");
        // One dark pixel, one zero pixel, one bright pixel inside the ROI.
        b.source.put_pixel(2, 2, image::Luma([0]));
        b.source.put_pixel(3, 2, image::Luma([10]));
        b.source.put_pixel(4, 2, image::Luma([200]));
        let mut out = Vec::new();
        b.fill_send_image(55, &mut out);
        assert_eq!(out.len(), 16);
        assert!(out.iter().all(|&v| v != 0));
        assert_eq!(out[0], 1); // zero source pixel
        assert_eq!(out[1], 1); // below threshold
        assert_eq!(out[2], 200); // bright passes through
    }
}
