//! Camera backend interface.
//!
//! The acquisition side owns a single boxed [`CameraDevice`]. Backends only
//! need to fill the monochrome source frame on demand; everything else
//! (menu entries, per-frame metadata, parameter persistence) is optional.

pub mod simulated;

use crate::error::AppResult;
use image::GrayImage;
use std::collections::HashMap;

/// A camera backend.
///
/// `grab` returns `Ok(true)` when a new frame was written into `frame`,
/// `Ok(false)` when no frame is available yet (the caller polls again), and
/// an error on unrecoverable failure.
pub trait CameraDevice: Send {
    fn name(&self) -> &str;

    /// Initialize the device from the opaque `[camera]` configuration
    /// section. Must be called before the first `grab`.
    fn open(&mut self, config: &HashMap<String, String>) -> AppResult<()>;

    fn grab(&mut self, frame: &mut GrayImage) -> AppResult<bool>;

    fn release(&mut self);

    /// Opaque per-frame metadata word recorded next to each sample when
    /// camera-specific output is enabled.
    fn specific_data(&self) -> Option<u32> {
        None
    }

    /// Write the backend's `[camera]` section body for configuration
    /// write-back.
    fn save_params(&self, out: &mut String) {
        let _ = out;
    }

    /// Extra menu entries exposed by the backend: `(label, value)` pairs.
    fn custom_menu(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Adjust custom menu entry `index` by `delta` (±1 from the arrow keys).
    fn adjust_custom_menu(&mut self, index: usize, delta: i32) {
        let _ = (index, delta);
    }
}
