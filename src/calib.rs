//! Calibration and validation.
//!
//! During calibration the client presents targets and asks the tracker to
//! collect a number of frames at each one; valid detections are paired with
//! the current target position. At `endCal` the affine mapping from the
//! pupil−Purkinje vector to screen coordinates is solved by least squares,
//! and summary accuracy/precision figures are produced. Validation reuses
//! the same collection path but only recomputes the summary against the
//! existing mapping.
//!
//! The most recently committed calibration (target list plus per-point
//! errors) is snapshotted as the "last calibration" and written into every
//! data-file recording header.

use crate::config::RecordingMode;
use crate::detect::{is_valid_value, DetectFailure};
use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_hollow_circle_mut, draw_line_segment_mut};
use nalgebra::{DMatrix, DVector, Matrix3, Vector3};

/// Maximum number of registered calibration targets.
pub const MAX_CAL_POINTS: usize = 60;
/// Capacity of the calibration sample buffer.
pub const MAX_CAL_SAMPLES: usize = 7200;
/// Per-target cap on requested samples.
pub const MAX_SAMPLES_PER_POINT: u32 = (MAX_CAL_SAMPLES / MAX_CAL_POINTS) as u32;

/// Sentinel stored in per-point slots that received no valid samples.
pub const NO_CALIBRATION_DATA: f64 = -11001.0;

/// Eye index: left (also the monocular slot).
pub const EYE_L: usize = 0;
/// Eye index: right.
pub const EYE_R: usize = 1;

/// What the last completed collection was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalKind {
    Calibration,
    Validation,
}

/// One collected calibration frame: target position plus per-eye Δ (error
/// tags inline) and pupil area.
#[derive(Debug, Clone, Copy)]
pub struct CalSample {
    pub target: (f64, f64),
    pub delta: [(f64, f64); 2],
    pub pupil: [f64; 2],
}

impl CalSample {
    pub fn eye_valid(&self, eye: usize) -> bool {
        is_valid_value(self.delta[eye].0)
    }
}

/// Affine gaze mapping for one eye: `screen_x = x·[Δx, Δy, 1]`, likewise y.
#[derive(Debug, Clone, Copy)]
pub struct AffineParams {
    pub x: [f64; 3],
    pub y: [f64; 3],
}

impl Default for AffineParams {
    fn default() -> Self {
        Self {
            x: [0.0; 3],
            y: [0.0; 3],
        }
    }
}

impl AffineParams {
    pub fn map(&self, delta: (f64, f64)) -> (f64, f64) {
        (
            self.x[0] * delta.0 + self.x[1] * delta.1 + self.x[2],
            self.y[0] * delta.0 + self.y[1] * delta.1 + self.y[2],
        )
    }
}

/// Per-target accuracy (mean signed residual) and precision (standard
/// deviation of the residual), per eye.
#[derive(Debug, Clone, Copy)]
pub struct CalPointStats {
    pub target: (f64, f64),
    pub accuracy: [(f64, f64); 2],
    pub precision: [(f64, f64); 2],
}

/// Summary of the last calibration or validation.
#[derive(Debug, Clone, Copy, Default)]
pub struct CalSummary {
    pub mean_error: [f64; 2],
    pub max_error: [f64; 2],
    pub goodness: [(f64, f64); 2],
}

/// Calibration state: sample collection, solved parameters, summaries and
/// the last-calibration snapshot.
pub struct Calibration {
    mode: RecordingMode,
    frame: (u32, u32),
    pub area: (i32, i32, i32, i32),
    targets: Vec<(f64, f64)>,
    samples: Vec<CalSample>,
    pub current_target: (f64, f64),
    pub samples_remaining: u32,
    params: [AffineParams; 2],
    pub is_calibrated: bool,
    summary: CalSummary,
    pub last_kind: CalKind,
    /// Snapshot of the last committed calibration for file headers.
    last_points: Vec<CalPointStats>,
}

impl Calibration {
    pub fn new(mode: RecordingMode, frame_width: u32, frame_height: u32) -> Self {
        Self {
            mode,
            frame: (frame_width, frame_height),
            area: (0, 0, 0, 0),
            targets: Vec::new(),
            samples: Vec::new(),
            current_target: (0.0, 0.0),
            samples_remaining: 0,
            params: [AffineParams::default(); 2],
            is_calibrated: false,
            summary: CalSummary::default(),
            last_kind: CalKind::Calibration,
            last_points: Vec::new(),
        }
    }

    pub fn mode(&self) -> RecordingMode {
        self.mode
    }

    pub fn params(&self) -> &[AffineParams; 2] {
        &self.params
    }

    pub fn samples(&self) -> &[CalSample] {
        &self.samples
    }

    pub fn num_targets(&self) -> usize {
        self.targets.len()
    }

    pub fn summary(&self) -> &CalSummary {
        &self.summary
    }

    pub fn last_points(&self) -> &[CalPointStats] {
        &self.last_points
    }

    /// Begin a calibration pass. `clear` wipes previously collected samples
    /// so a pass can also extend an earlier one.
    pub fn start(&mut self, area: (i32, i32, i32, i32), clear: bool) {
        self.area = area;
        if clear {
            self.targets.clear();
            self.samples.clear();
        }
        self.samples_remaining = 0;
    }

    /// Begin a validation pass; always collects from scratch.
    pub fn start_validation(&mut self, area: (i32, i32, i32, i32)) {
        self.area = area;
        self.targets.clear();
        self.samples.clear();
        self.samples_remaining = 0;
    }

    /// Register a target position and arm collection of `samples` frames.
    pub fn register_target(&mut self, x: f64, y: f64, samples: u32) {
        if self.targets.len() >= MAX_CAL_POINTS {
            log::warn!(
                "number of calibration points exceeded its maximum ({})",
                MAX_CAL_POINTS
            );
            self.targets.clear();
        }
        self.targets.push((x, y));
        self.current_target = (x, y);
        self.samples_remaining = samples.clamp(1, MAX_SAMPLES_PER_POINT);
    }

    /// Store one valid frame against the current target. The caller (the
    /// acquisition state machine) filters invalid detections and checks
    /// `samples_remaining`.
    pub fn push_sample(&mut self, delta: [(f64, f64); 2], pupil: [f64; 2]) {
        if self.samples.len() >= MAX_CAL_SAMPLES {
            log::warn!(
                "number of calibration samples exceeded its maximum ({})",
                MAX_CAL_SAMPLES
            );
            self.samples.clear();
        }
        self.samples.push(CalSample {
            target: self.current_target,
            delta,
            pupil,
        });
        self.samples_remaining = self.samples_remaining.saturating_sub(1);
    }

    /// Remove the named targets and every sample collected at them.
    pub fn delete_targets(&mut self, points: &[(f64, f64)]) {
        for &(x, y) in points {
            self.samples.retain(|s| s.target != (x, y));
            self.targets.retain(|&t| t != (x, y));
        }
    }

    /// Solve the affine parameters, compute summaries and per-point errors,
    /// and commit the snapshot.
    pub fn finish_calibration(&mut self) {
        match self.mode {
            RecordingMode::Monocular => self.estimate_mono(),
            RecordingMode::Binocular => self.estimate_bin(),
        }
        self.compute_summary();
        self.last_points = self.compute_point_stats();
        self.is_calibrated = true;
        self.last_kind = CalKind::Calibration;
    }

    /// Recompute the summary against the current parameters; no refit.
    pub fn finish_validation(&mut self) {
        self.compute_summary();
        self.last_kind = CalKind::Validation;
    }

    /// Discard an in-progress collection without committing anything.
    pub fn abort(&mut self) {
        self.targets.clear();
        self.samples.clear();
        self.samples_remaining = 0;
    }

    /// Map a monocular Δ to screen coordinates.
    pub fn gaze_mono(&self, delta: (f64, f64)) -> (f64, f64) {
        self.params[EYE_L].map(delta)
    }

    /// Map per-eye Δs to screen coordinates. An eye whose Δ carries an error
    /// tag propagates that tag to both of its output coordinates.
    pub fn gaze_bin(&self, delta: [(f64, f64); 2]) -> [(f64, f64); 2] {
        let mut out = [(0.0, 0.0); 2];
        for eye in [EYE_L, EYE_R] {
            out[eye] = if is_valid_value(delta[eye].0) {
                self.params[eye].map(delta[eye])
            } else {
                (delta[eye].0, delta[eye].0)
            };
        }
        out
    }

    fn estimate_mono(&mut self) {
        let rows: Vec<&CalSample> = self.samples.iter().collect();
        if rows.is_empty() {
            return;
        }
        if let Some(p) = solve_affine(rows.iter().map(|s| (s.delta[EYE_L], s.target))) {
            self.params[EYE_L] = p;
        }
    }

    fn estimate_bin(&mut self) {
        if self.samples.is_empty() {
            return;
        }
        for eye in [EYE_L, EYE_R] {
            let rows: Vec<((f64, f64), (f64, f64))> = self
                .samples
                .iter()
                .filter(|s| s.eye_valid(eye))
                .map(|s| (s.delta[eye], s.target))
                .collect();
            if rows.is_empty() {
                // Leave this eye's parameters unchanged.
                continue;
            }
            if let Some(p) = solve_affine(rows.into_iter()) {
                self.params[eye] = p;
            }
        }
    }

    fn compute_summary(&mut self) {
        let mut summary = CalSummary::default();
        let eyes: &[usize] = match self.mode {
            RecordingMode::Monocular => &[EYE_L],
            RecordingMode::Binocular => &[EYE_L, EYE_R],
        };
        for &eye in eyes {
            let mut sum = 0.0;
            let mut max = 0.0f64;
            let mut n = 0usize;
            for s in self.samples.iter().filter(|s| s.eye_valid(eye)) {
                let gaze = self.params[eye].map(s.delta[eye]);
                let err = ((gaze.0 - s.target.0).powi(2) + (gaze.1 - s.target.1).powi(2)).sqrt();
                sum += err;
                max = max.max(err);
                n += 1;
            }
            if n > 0 {
                summary.mean_error[eye] = sum / n as f64;
                summary.max_error[eye] = max;
            }
            let p = &self.params[eye];
            summary.goodness[eye] = (
                100.0 * (p.x[0].abs() + p.x[1].abs()) / (2.0 * f64::from(self.frame.0)),
                100.0 * (p.y[0].abs() + p.y[1].abs()) / (2.0 * f64::from(self.frame.1)),
            );
        }
        self.summary = summary;
    }

    /// Per-target accuracy and precision for the registered target list.
    fn compute_point_stats(&self) -> Vec<CalPointStats> {
        struct Acc {
            n: usize,
            sum: (f64, f64),
            sq: (f64, f64),
        }
        let mut acc: Vec<[Acc; 2]> = self
            .targets
            .iter()
            .map(|_| {
                [
                    Acc { n: 0, sum: (0.0, 0.0), sq: (0.0, 0.0) },
                    Acc { n: 0, sum: (0.0, 0.0), sq: (0.0, 0.0) },
                ]
            })
            .collect();

        let eyes: &[usize] = match self.mode {
            RecordingMode::Monocular => &[EYE_L],
            RecordingMode::Binocular => &[EYE_L, EYE_R],
        };
        for s in &self.samples {
            let Some(idx) = self.targets.iter().position(|&t| t == s.target) else {
                continue;
            };
            for &eye in eyes {
                if !s.eye_valid(eye) {
                    continue;
                }
                let gaze = self.params[eye].map(s.delta[eye]);
                let rx = gaze.0 - s.target.0;
                let ry = gaze.1 - s.target.1;
                let a = &mut acc[idx][eye];
                a.n += 1;
                a.sum.0 += rx;
                a.sum.1 += ry;
                a.sq.0 += rx * rx;
                a.sq.1 += ry * ry;
            }
        }

        self.targets
            .iter()
            .zip(acc.iter())
            .map(|(&target, per_eye)| {
                let mut stats = CalPointStats {
                    target,
                    accuracy: [(NO_CALIBRATION_DATA, NO_CALIBRATION_DATA); 2],
                    precision: [(NO_CALIBRATION_DATA, NO_CALIBRATION_DATA); 2],
                };
                for &eye in eyes {
                    let a = &per_eye[eye];
                    if a.n == 0 {
                        continue;
                    }
                    let n = a.n as f64;
                    let mean = (a.sum.0 / n, a.sum.1 / n);
                    stats.accuracy[eye] = mean;
                    stats.precision[eye] = (
                        (a.sq.0 / n - mean.0 * mean.0).max(0.0).sqrt(),
                        (a.sq.1 / n - mean.1 * mean.1).max(0.0).sqrt(),
                    );
                }
                stats
            })
            .collect()
    }

    /// Per-sample detail line for the `getCalResultsDetail` reply:
    /// `tx,ty,gx,gy,…` (six columns per sample in binocular mode).
    pub fn detail_string(&self) -> String {
        let mut out = String::new();
        for s in &self.samples {
            match self.mode {
                RecordingMode::Monocular => {
                    let gaze = self.gaze_mono(s.delta[EYE_L]);
                    out.push_str(&format!(
                        "{:.0},{:.0},{:.0},{:.0},",
                        s.target.0, s.target.1, gaze.0, gaze.1
                    ));
                }
                RecordingMode::Binocular => {
                    let gaze = self.gaze_bin(s.delta);
                    out.push_str(&format!(
                        "{:.0},{:.0},{:.0},{:.0},{:.0},{:.0},",
                        s.target.0, s.target.1, gaze[EYE_L].0, gaze[EYE_L].1, gaze[EYE_R].0,
                        gaze[EYE_R].1
                    ));
                }
            }
        }
        out.pop(); // trailing comma
        out
    }

    /// Redraw the calibration-result plot: registered targets as red rings,
    /// predicted gaze joined to its target (blue for the left/monocular eye,
    /// green for the right).
    pub fn draw_result_plot(&self, img: &mut RgbaImage) {
        const WHITE: Rgba<u8> = Rgba([255, 255, 255, 255]);
        const RED: Rgba<u8> = Rgba([255, 0, 0, 255]);
        const BLUE: Rgba<u8> = Rgba([0, 0, 255, 255]);
        const GREEN: Rgba<u8> = Rgba([0, 255, 0, 255]);

        let (w, h) = (img.width(), img.height());
        for px in img.pixels_mut() {
            *px = WHITE;
        }

        let area_w = f64::from(self.area.2 - self.area.0).max(1.0);
        let area_h = f64::from(self.area.3 - self.area.1).max(1.0);
        let to_px = |x: f64, y: f64| {
            (
                ((x - f64::from(self.area.0)) * f64::from(w) / area_w) as f32,
                ((y - f64::from(self.area.1)) * f64::from(h) / area_h) as f32,
            )
        };

        for &(tx, ty) in &self.targets {
            let (px, py) = to_px(tx, ty);
            let r = (20.0 * f64::from(w) / area_w) as i32;
            draw_hollow_circle_mut(img, (px as i32, py as i32), r.max(1), RED);
            draw_hollow_circle_mut(img, (px as i32, py as i32), (r * 2).max(2), RED);
        }

        let eyes: &[(usize, Rgba<u8>)] = match self.mode {
            RecordingMode::Monocular => &[(EYE_L, BLUE)],
            RecordingMode::Binocular => &[(EYE_L, BLUE), (EYE_R, GREEN)],
        };
        for s in &self.samples {
            let (tx, ty) = to_px(s.target.0, s.target.1);
            for &(eye, color) in eyes {
                if !s.eye_valid(eye) {
                    continue;
                }
                let gaze = self.params[eye].map(s.delta[eye]);
                let (gx, gy) = to_px(gaze.0, gaze.1);
                draw_line_segment_mut(img, (gx, gy), (tx, ty), color);
                draw_hollow_circle_mut(img, (gx as i32, gy as i32), 3, color);
            }
        }
    }
}

/// Least-squares affine solve over `(Δ, target)` rows:
/// `P = (MᵀM)⁻¹·Mᵀ·t` with `M = [Δx, Δy, 1]`, one solve per axis.
fn solve_affine(
    rows: impl Iterator<Item = ((f64, f64), (f64, f64))> + Clone,
) -> Option<AffineParams> {
    let n = rows.clone().count();
    if n < 3 {
        return None;
    }
    let mut m = DMatrix::<f64>::zeros(n, 3);
    let mut tx = DVector::<f64>::zeros(n);
    let mut ty = DVector::<f64>::zeros(n);
    for (i, (delta, target)) in rows.enumerate() {
        m[(i, 0)] = delta.0;
        m[(i, 1)] = delta.1;
        m[(i, 2)] = 1.0;
        tx[i] = target.0;
        ty[i] = target.1;
    }
    let mt = m.transpose();
    let normal: Matrix3<f64> = Matrix3::from_iterator((&mt * &m).iter().copied());
    let inv = normal.try_inverse()?;
    let px: Vector3<f64> = inv * Vector3::from_iterator((&mt * tx).iter().copied());
    let py: Vector3<f64> = inv * Vector3::from_iterator((&mt * ty).iter().copied());
    Some(AffineParams {
        x: [px[0], px[1], px[2]],
        y: [py[0], py[1], py[2]],
    })
}

/// Build a valid monocular sample for `push_sample`.
pub fn mono_delta(dx: f64, dy: f64, pupil: f64) -> ([(f64, f64); 2], [f64; 2]) {
    ([(dx, dy), (0.0, 0.0)], [pupil, 0.0])
}

/// Per-eye delta with an error tag standing in for a missing eye.
pub fn eye_delta_or_tag(result: Result<(f64, f64), DetectFailure>) -> (f64, f64) {
    match result {
        Ok(d) => d,
        Err(f) => (f64::from(f.code()), f64::from(f.code())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn five_point_calibration() -> Calibration {
        let mut cal = Calibration::new(RecordingMode::Monocular, 640, 480);
        cal.start((0, 0, 1024, 768), true);
        // Δ = (target - b) / 5 inverted: gaze = 5·Δ + 100 on both axes.
        for &(tx, ty) in &[
            (100.0, 100.0),
            (900.0, 100.0),
            (100.0, 700.0),
            (900.0, 700.0),
            (512.0, 384.0),
        ] {
            cal.register_target(tx, ty, 10);
            for _ in 0..10 {
                let (d, p) = mono_delta((tx - 100.0) / 5.0, (ty - 100.0) / 5.0, 300.0);
                cal.push_sample(d, p);
            }
        }
        cal
    }

    #[test]
    fn test_affine_recovery_is_exact() {
        let mut cal = five_point_calibration();
        cal.finish_calibration();
        assert!(cal.is_calibrated);
        let p = &cal.params()[EYE_L];
        assert_relative_eq!(p.x[0], 5.0, epsilon = 1e-6);
        assert_relative_eq!(p.x[1], 0.0, epsilon = 1e-6);
        assert_relative_eq!(p.x[2], 100.0, epsilon = 1e-6);
        assert_relative_eq!(p.y[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(p.y[1], 5.0, epsilon = 1e-6);
        assert_relative_eq!(p.y[2], 100.0, epsilon = 1e-6);
        assert!(cal.summary().mean_error[EYE_L] < 0.01);
        assert!(cal.summary().max_error[EYE_L] < 0.01);
    }

    #[test]
    fn test_per_point_stats_zero_residual() {
        let mut cal = five_point_calibration();
        cal.finish_calibration();
        assert_eq!(cal.last_points().len(), 5);
        for stats in cal.last_points() {
            assert_relative_eq!(stats.accuracy[EYE_L].0, 0.0, epsilon = 1e-6);
            assert_relative_eq!(stats.precision[EYE_L].0, 0.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn test_precision_is_standard_deviation() {
        let mut cal = Calibration::new(RecordingMode::Monocular, 640, 480);
        cal.start((0, 0, 1024, 768), true);
        // Identity mapping from three targets, then jittered samples.
        for &(tx, ty) in &[(100.0, 100.0), (500.0, 100.0), (100.0, 500.0)] {
            cal.register_target(tx, ty, 10);
            for _ in 0..4 {
                let (d, p) = mono_delta(tx, ty, 1.0);
                cal.push_sample(d, p);
            }
        }
        cal.finish_calibration();
        // Now validate with symmetric jitter ±2 around one target.
        cal.start((0, 0, 1024, 768), true);
        cal.register_target(100.0, 100.0, 4);
        for jitter in [-2.0, 2.0, -2.0, 2.0] {
            let (d, p) = mono_delta(100.0 + jitter, 100.0, 1.0);
            cal.push_sample(d, p);
        }
        cal.finish_calibration();
        let stats = cal.last_points()[0];
        assert_relative_eq!(stats.accuracy[EYE_L].0, 0.0, epsilon = 1e-6);
        assert_relative_eq!(stats.precision[EYE_L].0, 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_empty_point_gets_sentinel() {
        let mut cal = five_point_calibration();
        cal.register_target(512.0, 100.0, 10); // never collected
        cal.finish_calibration();
        let stats = cal
            .last_points()
            .iter()
            .find(|s| s.target == (512.0, 100.0))
            .expect("registered target present");
        assert_eq!(stats.accuracy[EYE_L].0, NO_CALIBRATION_DATA);
        assert_eq!(stats.precision[EYE_L].1, NO_CALIBRATION_DATA);
    }

    #[test]
    fn test_delete_targets_refits_without_them() {
        let mut cal = five_point_calibration();
        cal.finish_calibration();
        assert_eq!(cal.samples().len(), 50);
        cal.delete_targets(&[(512.0, 384.0)]);
        assert_eq!(cal.samples().len(), 40);
        assert_eq!(cal.num_targets(), 4);
        cal.finish_calibration();
        assert_eq!(cal.last_points().len(), 4);
        assert!(cal.summary().mean_error[EYE_L] < 0.01);
    }

    #[test]
    fn test_binocular_missing_eye_keeps_parameters() {
        let mut cal = Calibration::new(RecordingMode::Binocular, 640, 480);
        cal.start((0, 0, 1024, 768), true);
        let tag = f64::from(DetectFailure::NoPupilCandidate.code());
        for &(tx, ty) in &[(100.0, 100.0), (900.0, 100.0), (512.0, 700.0)] {
            cal.register_target(tx, ty, 5);
            for _ in 0..5 {
                // Left eye valid, right eye always missing.
                cal.push_sample([(tx / 4.0, ty / 4.0), (tag, tag)], [200.0, 0.0]);
            }
        }
        cal.finish_calibration();
        let left = cal.params()[EYE_L];
        let right = cal.params()[EYE_R];
        assert_relative_eq!(left.x[0], 4.0, epsilon = 1e-6);
        // Right eye had zero valid rows: parameters untouched (zeros).
        assert_eq!(right.x, [0.0; 3]);
    }

    #[test]
    fn test_gaze_bin_propagates_error_tags() {
        let cal = Calibration::new(RecordingMode::Binocular, 640, 480);
        let tag = f64::from(DetectFailure::NoPurkinjeCandidate.code());
        let out = cal.gaze_bin([(1.0, 2.0), (tag, tag)]);
        assert_eq!(out[EYE_R], (tag, tag));
    }

    #[test]
    fn test_samples_per_point_is_capped() {
        let mut cal = Calibration::new(RecordingMode::Monocular, 640, 480);
        cal.start((0, 0, 100, 100), true);
        cal.register_target(1.0, 1.0, 10_000);
        assert_eq!(cal.samples_remaining, MAX_SAMPLES_PER_POINT);
    }

    #[test]
    fn test_detail_string_layout() {
        let mut cal = five_point_calibration();
        cal.finish_calibration();
        let detail = cal.detail_string();
        let fields: Vec<&str> = detail.split(',').collect();
        assert_eq!(fields.len(), 50 * 4);
        assert_eq!(fields[0], "100");
        assert_eq!(fields[1], "100");
    }
}
