//! Synthetic-eye camera backend.
//!
//! Renders an artificial eye image: uniform gray background, dark elliptical
//! pupil, bright Purkinje dot offset from the pupil center, and a little
//! sensor noise. In binocular setups it draws a second eye mirrored across
//! the frame midline. The pupil drifts on a slow Lissajous path so gaze
//! output is visibly alive. Used for development, demos and the test suite.

use super::CameraDevice;
use crate::error::{AppResult, GazeError};
use image::{GrayImage, Luma};
use imageproc::drawing::draw_filled_ellipse_mut;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

const BACKGROUND: u8 = 128;
const PUPIL_LEVEL: u8 = 20;
const PURKINJE_LEVEL: u8 = 250;

pub struct SimulatedCamera {
    opened: bool,
    binocular: bool,
    pupil_radius: i32,
    purkinje_offset: (i32, i32),
    wander: f64,
    noise: u8,
    frame_counter: u32,
    rng: StdRng,
}

impl SimulatedCamera {
    pub fn new() -> Self {
        Self {
            opened: false,
            binocular: false,
            pupil_radius: 20,
            purkinje_offset: (6, 2),
            wander: 10.0,
            noise: 3,
            frame_counter: 0,
            rng: StdRng::seed_from_u64(0x6a7e),
        }
    }

    fn eye_center(&self, frame: &GrayImage, which: usize) -> (i32, i32) {
        let (w, h) = (frame.width() as i32, frame.height() as i32);
        let phase = f64::from(self.frame_counter) / 120.0;
        let dx = (self.wander * (phase * 2.0).sin()) as i32;
        let dy = (self.wander * (phase * 3.0).cos()) as i32;
        if self.binocular {
            let x = if which == 0 { w / 4 } else { 3 * w / 4 };
            (x + dx, h / 2 + dy)
        } else {
            (w / 2 + dx, h / 2 + dy)
        }
    }
}

impl Default for SimulatedCamera {
    fn default() -> Self {
        Self::new()
    }
}

impl CameraDevice for SimulatedCamera {
    fn name(&self) -> &str {
        "Simulated Camera"
    }

    fn open(&mut self, config: &HashMap<String, String>) -> AppResult<()> {
        for (key, value) in config {
            match key.as_str() {
                "binocular" => self.binocular = value == "1",
                "pupil_radius" => {
                    self.pupil_radius = value.parse().map_err(|_| {
                        GazeError::Camera(format!("pupil_radius must be an integer (got {value})"))
                    })?;
                }
                "wander" => {
                    self.wander = value.parse().map_err(|_| {
                        GazeError::Camera(format!("wander must be a number (got {value})"))
                    })?;
                }
                "noise" => {
                    self.noise = value.parse().map_err(|_| {
                        GazeError::Camera(format!("noise must be an integer (got {value})"))
                    })?;
                }
                "use_thread" => {} // read by the acquisition layer
                other => {
                    log::warn!("Unknown camera option ({other})");
                }
            }
        }
        self.opened = true;
        log::info!(
            "Simulated camera ready (binocular={}, pupil_radius={})",
            self.binocular,
            self.pupil_radius
        );
        Ok(())
    }

    fn grab(&mut self, frame: &mut GrayImage) -> AppResult<bool> {
        if !self.opened {
            return Err(GazeError::Camera("grab before open".into()));
        }
        for px in frame.pixels_mut() {
            let n = self.rng.gen_range(0..=self.noise.max(1));
            *px = Luma([BACKGROUND.saturating_add(n)]);
        }
        let eyes = if self.binocular { 2 } else { 1 };
        for which in 0..eyes {
            let (cx, cy) = self.eye_center(frame, which);
            draw_filled_ellipse_mut(
                frame,
                (cx, cy),
                self.pupil_radius,
                self.pupil_radius - 2,
                Luma([PUPIL_LEVEL]),
            );
            draw_filled_ellipse_mut(
                frame,
                (cx + self.purkinje_offset.0, cy + self.purkinje_offset.1),
                3,
                3,
                Luma([PURKINJE_LEVEL]),
            );
        }
        self.frame_counter = self.frame_counter.wrapping_add(1);
        Ok(true)
    }

    fn release(&mut self) {
        self.opened = false;
    }

    fn specific_data(&self) -> Option<u32> {
        Some(self.frame_counter)
    }

    fn save_params(&self, out: &mut String) {
        use std::fmt::Write;
        let _ = writeln!(out, "binocular={}", u8::from(self.binocular));
        let _ = writeln!(out, "pupil_radius={}", self.pupil_radius);
        let _ = writeln!(out, "wander={}", self.wander);
        let _ = writeln!(out, "noise={}", self.noise);
    }

    fn custom_menu(&self) -> Vec<(String, String)> {
        vec![("SimPupilRadius".to_string(), self.pupil_radius.to_string())]
    }

    fn adjust_custom_menu(&mut self, index: usize, delta: i32) {
        if index == 0 {
            self.pupil_radius = (self.pupil_radius + delta).clamp(6, 60);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grab_requires_open() {
        let mut cam = SimulatedCamera::new();
        let mut frame = GrayImage::new(64, 64);
        assert!(cam.grab(&mut frame).is_err());
    }

    #[test]
    fn test_grab_draws_pupil_and_purkinje() {
        let mut cam = SimulatedCamera::new();
        cam.open(&HashMap::new()).expect("open");
        let mut frame = GrayImage::new(320, 240);
        assert!(cam.grab(&mut frame).expect("grab"));
        let dark = frame.pixels().filter(|p| p[0] == PUPIL_LEVEL).count();
        let bright = frame.pixels().filter(|p| p[0] == PURKINJE_LEVEL).count();
        assert!(dark > 200, "pupil pixels: {dark}");
        assert!(bright > 10, "purkinje pixels: {bright}");
    }

    #[test]
    fn test_binocular_draws_two_pupils() {
        let mut cam = SimulatedCamera::new();
        let cfg = HashMap::from([("binocular".to_string(), "1".to_string())]);
        cam.open(&cfg).expect("open");
        let mut frame = GrayImage::new(320, 240);
        cam.grab(&mut frame).expect("grab");
        let left_half_dark = frame
            .enumerate_pixels()
            .filter(|(x, _, p)| *x < 160 && p[0] == PUPIL_LEVEL)
            .count();
        let right_half_dark = frame
            .enumerate_pixels()
            .filter(|(x, _, p)| *x >= 160 && p[0] == PUPIL_LEVEL)
            .count();
        assert!(left_half_dark > 100);
        assert!(right_half_dark > 100);
    }

    #[test]
    fn test_frame_counter_is_specific_data() {
        let mut cam = SimulatedCamera::new();
        cam.open(&HashMap::new()).expect("open");
        let mut frame = GrayImage::new(64, 64);
        cam.grab(&mut frame).expect("grab");
        cam.grab(&mut frame).expect("grab");
        assert_eq!(cam.specific_data(), Some(2));
    }
}
