//! Pupil and Purkinje-image detection.
//!
//! One call per captured frame. The pipeline binarizes the ROI at the pupil
//! threshold (optionally cleaned up by a morphological opening or closing),
//! extracts contours of the dark set, filters pupil candidates by size,
//! shape and interior darkness, searches each candidate's neighborhood for
//! the first Purkinje reflection, and re-fits the pupil ellipse on the
//! contour points outside the Purkinje exclusion radius. The re-fit center
//! is the reported pupil position.
//!
//! Failures are *data*: each variant carries the negative integer tag that
//! is stored inline in the sample stream and written to the data file as a
//! mnemonic string. They are deliberately not part of [`crate::error`].
//!
//! All geometry is 32-bit float, no subpixel interpolation; the interior
//! test does its trigonometry once per candidate and walks integer offsets.

pub mod ellipse;
pub mod overlay;

use crate::params::TrackingParams;
use ellipse::{fit_ellipse, Ellipse};
use image::{GrayImage, Luma, RgbaImage};
use imageproc::contours::find_contours;
use imageproc::distance_transform::Norm;
use imageproc::morphology::{close, open};
use imageproc::rect::Rect;

/// Values at or below this sentinel are error tags, not coordinates.
pub const ERROR_SENTINEL: f64 = -10000.0;

/// Oblateness (minor/major confusion aside: height/width) acceptance band,
/// exclusive on both ends.
const OBLATENESS_LOW: f32 = 0.67;
const OBLATENESS_HIGH: f32 = 1.50;
/// Number of pupil candidates accepted before the frame is rejected.
const MAX_FIRST_CANDIDATES: usize = 5;
/// Minimum contour length considered for any ellipse fit.
const MIN_CONTOUR_POINTS: usize = 6;
/// Minimum retained points for the pupil re-fit.
const MIN_FINE_POINTS: usize = 10;
/// Fraction of the sampled ellipse interior that must be dark.
const MIN_DARK_FRACTION: f32 = 0.75;

/// Per-frame detection failure, stored inline in the sample stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectFailure {
    MultiplePupilCandidates,
    NoPupilCandidate,
    NoPurkinjeCandidate,
    MultiplePurkinjeCandidates,
    NoFinePupilCandidate,
    NanInMovingAverage,
    NoCalibrationData,
}

impl DetectFailure {
    /// Negative integer tag carried in place of the Δ values.
    pub fn code(self) -> i32 {
        match self {
            DetectFailure::MultiplePupilCandidates => -10001,
            DetectFailure::NoPupilCandidate => -10002,
            DetectFailure::NoPurkinjeCandidate => -10003,
            DetectFailure::MultiplePurkinjeCandidates => -10004,
            DetectFailure::NoFinePupilCandidate => -10005,
            DetectFailure::NanInMovingAverage => -10006,
            DetectFailure::NoCalibrationData => -11001,
        }
    }

    /// Mnemonic written to the data file in place of a coordinate.
    pub fn mnemonic(self) -> &'static str {
        match self {
            DetectFailure::MultiplePupilCandidates => "MULTIPUPIL",
            DetectFailure::NoPupilCandidate => "NOPUPIL",
            DetectFailure::NoPurkinjeCandidate => "NOPURKINJE",
            DetectFailure::MultiplePurkinjeCandidates => "MULTIPURKINJE",
            DetectFailure::NoFinePupilCandidate => "NOFINEPUPIL",
            _ => "FAIL",
        }
    }

    /// Human-readable label shown on the preview when error display is on.
    pub fn label(self) -> &'static str {
        match self {
            DetectFailure::MultiplePupilCandidates => "MULTIPLE_PUPIL_CANDIDATES",
            DetectFailure::NoPupilCandidate => "NO_PUPIL_CANDIDATE",
            DetectFailure::NoPurkinjeCandidate => "NO_PURKINJE_CANDIDATE",
            DetectFailure::MultiplePurkinjeCandidates => "MULTIPLE_PURKINJE_CANDIDATES",
            DetectFailure::NoFinePupilCandidate => "NO_FINE_PUPIL_CANDIDATE",
            DetectFailure::NanInMovingAverage => "NAN_IN_MOVING_AVERAGE",
            DetectFailure::NoCalibrationData => "NO_CALIBRATION_DATA",
        }
    }

    /// Mnemonic for a raw tag value out of the sample stream. Unknown tags
    /// (for example `NanInMovingAverage` leaking into a row) print `FAIL`.
    pub fn mnemonic_for_code(code: f64) -> &'static str {
        match code as i64 {
            -10001 => "MULTIPUPIL",
            -10002 => "NOPUPIL",
            -10003 => "NOPURKINJE",
            -10004 => "MULTIPURKINJE",
            -10005 => "NOFINEPUPIL",
            _ => "FAIL",
        }
    }
}

/// `true` when a stored Δ value is a coordinate rather than an error tag.
pub fn is_valid_value(v: f64) -> bool {
    v > ERROR_SENTINEL
}

/// A successfully detected eye.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EyeDetection {
    pub pupil: (f32, f32),
    pub purkinje: (f32, f32),
    pub pupil_area: f32,
}

/// Per-eye outcome.
pub type EyeResult = Result<EyeDetection, DetectFailure>;

/// Binocular outcome: per-eye results after eye assignment. An eye with no
/// surviving pupil/Purkinje pair carries `NoPupilCandidate`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinDetection {
    pub left: EyeResult,
    pub right: EyeResult,
}

/// A pupil candidate: fitted ellipse plus its contour points (frame coords).
struct Candidate {
    ellipse: Ellipse,
    points: Vec<(f32, f32)>,
}

/// Shared per-call context.
pub struct DetectContext<'a> {
    pub source: &'a GrayImage,
    pub roi: Rect,
    pub params: &'a TrackingParams,
    /// Overlay target; `None` suppresses all preview work.
    pub preview: Option<&'a mut RgbaImage>,
}

/// Detect pupil and Purkinje image, monocular variant.
pub fn detect_mono(ctx: DetectContext<'_>) -> EyeResult {
    let DetectContext {
        source,
        roi,
        params,
        mut preview,
    } = ctx;

    if let Some(p) = preview.as_deref_mut() {
        overlay::init_preview(p, source);
        overlay::draw_roi(p, roi);
    }

    let mask = dark_mask(source, roi, params);
    if let Some(p) = preview.as_deref_mut() {
        overlay::tint_dark(p, &mask, roi);
    }

    let candidates = collect_pupil_candidates(source, &mask, roi, params, preview.as_deref_mut())?;

    let mut survivors: Vec<(usize, (f32, f32))> = Vec::new();
    for (i, cand) in candidates.iter().enumerate() {
        if let Some(pk) = find_purkinje(source, params, cand.ellipse.center) {
            if let Some(p) = preview.as_deref_mut() {
                overlay::draw_purkinje(p, cand.ellipse.center, pk, params);
            }
            survivors.push((i, pk));
        }
    }

    match survivors.len() {
        0 => return Err(DetectFailure::NoPurkinjeCandidate),
        1 => {}
        _ => return Err(DetectFailure::MultiplePurkinjeCandidates),
    }
    let (index, purkinje) = survivors[0];

    let fine = refit_outside_exclusion(
        &candidates[index].points,
        purkinje,
        params.purkinje_exclude_area as f32,
        preview.as_deref_mut(),
    )?;
    if let Some(p) = preview.as_deref_mut() {
        overlay::draw_fine(p, &fine);
    }

    Ok(EyeDetection {
        pupil: fine.center,
        purkinje,
        pupil_area: fine.area(),
    })
}

/// Detect pupil and Purkinje image, binocular variant. Surviving pairs are
/// assigned to an eye by the fine pupil center's x coordinate relative to
/// the frame midline: x < W/2 is the right eye (mirror convention).
pub fn detect_bin(ctx: DetectContext<'_>) -> Result<BinDetection, DetectFailure> {
    let DetectContext {
        source,
        roi,
        params,
        mut preview,
    } = ctx;

    if let Some(p) = preview.as_deref_mut() {
        overlay::init_preview(p, source);
        overlay::draw_roi(p, roi);
    }

    let mask = dark_mask(source, roi, params);
    if let Some(p) = preview.as_deref_mut() {
        overlay::tint_dark(p, &mask, roi);
    }

    let candidates = collect_pupil_candidates(source, &mask, roi, params, preview.as_deref_mut())?;

    let midline = source.width() as f32 / 2.0;
    let mut left: EyeResult = Err(DetectFailure::NoPupilCandidate);
    let mut right: EyeResult = Err(DetectFailure::NoPupilCandidate);
    let mut num_purkinje = 0usize;
    let mut num_final = 0usize;

    for cand in &candidates {
        let Some(pk) = find_purkinje(source, params, cand.ellipse.center) else {
            continue;
        };
        num_purkinje += 1;
        if let Some(p) = preview.as_deref_mut() {
            overlay::draw_purkinje(p, cand.ellipse.center, pk, params);
        }
        if num_final >= 2 {
            continue;
        }
        let Ok(fine) = refit_outside_exclusion(
            &cand.points,
            pk,
            params.purkinje_exclude_area as f32,
            preview.as_deref_mut(),
        ) else {
            continue;
        };
        if let Some(p) = preview.as_deref_mut() {
            overlay::draw_fine(p, &fine);
        }
        let eye = EyeDetection {
            pupil: fine.center,
            purkinje: pk,
            pupil_area: fine.area(),
        };
        if fine.center.0 < midline {
            right = Ok(eye);
        } else {
            left = Ok(eye);
        }
        num_final += 1;
    }

    if num_purkinje == 0 {
        Err(DetectFailure::NoPurkinjeCandidate)
    } else if num_purkinje > 2 {
        Err(DetectFailure::MultiplePurkinjeCandidates)
    } else if num_final == 0 {
        Err(DetectFailure::NoFinePupilCandidate)
    } else {
        Ok(BinDetection { left, right })
    }
}

/// Binarize the ROI: dark pixels (≤ threshold) become foreground, then the
/// optional morphological transform is applied (closing for positive values
/// above 1, opening for values below −1, circular structuring element).
fn dark_mask(source: &GrayImage, roi: Rect, params: &TrackingParams) -> GrayImage {
    let (w, h) = (roi.width(), roi.height());
    let mut mask = GrayImage::new(w, h);
    for y in 0..h {
        for x in 0..w {
            let px = source.get_pixel(roi.left() as u32 + x, roi.top() as u32 + y)[0];
            if px <= params.threshold {
                mask.put_pixel(x, y, Luma([255]));
            }
        }
    }
    let m = params.morph_trans;
    if m > 1 {
        close(&mask, Norm::L2, (m / 2) as u8)
    } else if m < -1 {
        open(&mask, Norm::L2, (-m / 2) as u8)
    } else {
        mask
    }
}

/// Contour the dark set and filter pupil candidates. Returns at most
/// [`MAX_FIRST_CANDIDATES`] candidates; a further passing contour
/// short-circuits the frame.
fn collect_pupil_candidates(
    source: &GrayImage,
    mask: &GrayImage,
    roi: Rect,
    params: &TrackingParams,
    mut preview: Option<&mut RgbaImage>,
) -> Result<Vec<Candidate>, DetectFailure> {
    let (frame_w, frame_h) = (source.width() as f32, source.height() as f32);
    let min_w = params.min_pupil_width as f32 / 100.0 * roi.width() as f32;
    let max_w = params.max_pupil_width as f32 / 100.0 * roi.width() as f32;
    let search = params.purkinje_search_area as f32;

    let mut candidates: Vec<Candidate> = Vec::new();
    for contour in find_contours::<i32>(mask) {
        if contour.points.len() < MIN_CONTOUR_POINTS {
            continue;
        }

        // Bounding box in pixels, inclusive of both borders.
        let (mut min_x, mut min_y, mut max_x, mut max_y) = (i32::MAX, i32::MAX, i32::MIN, i32::MIN);
        for pt in &contour.points {
            min_x = min_x.min(pt.x);
            min_y = min_y.min(pt.y);
            max_x = max_x.max(pt.x);
            max_y = max_y.max(pt.y);
        }
        let bw = (max_x - min_x + 1) as f32;
        let bh = (max_y - min_y + 1) as f32;
        if bw < min_w || bw > max_w || bh < min_w || bh > max_w {
            continue;
        }

        let points: Vec<(f32, f32)> = contour
            .points
            .iter()
            .map(|pt| ((pt.x + roi.left()) as f32, (pt.y + roi.top()) as f32))
            .collect();
        let Some(ellipse) = fit_ellipse(&points) else {
            continue;
        };
        let (cx, cy) = ellipse.center;

        // Center strictly inside the ROI.
        if cx <= roi.left() as f32
            || cy <= roi.top() as f32
            || cx >= (roi.left() + roi.width() as i32) as f32
            || cy >= (roi.top() + roi.height() as i32) as f32
        {
            continue;
        }

        let oblateness = ellipse.oblateness();
        if oblateness <= OBLATENESS_LOW || oblateness >= OBLATENESS_HIGH {
            continue;
        }

        // The Purkinje search square must fit inside the camera frame.
        if cx <= search || cy <= search || cx >= frame_w - search || cy >= frame_h - search {
            continue;
        }

        if dark_fraction(mask, roi, &ellipse) < MIN_DARK_FRACTION {
            continue;
        }

        if candidates.len() >= MAX_FIRST_CANDIDATES {
            return Err(DetectFailure::MultiplePupilCandidates);
        }
        if let Some(p) = preview.as_deref_mut() {
            overlay::draw_candidate(p, &ellipse);
        }
        candidates.push(Candidate { ellipse, points });
    }

    if candidates.is_empty() {
        return Err(DetectFailure::NoPupilCandidate);
    }
    Ok(candidates)
}

/// Fraction of the ellipse interior that is dark, sampled at integer offsets
/// rotated by the fit angle and clipped to the ROI.
fn dark_fraction(mask: &GrayImage, roi: Rect, ellipse: &Ellipse) -> f32 {
    let rad = ellipse.angle_deg.to_radians();
    let (sin, cos) = rad.sin_cos();
    let hw = (ellipse.width as i32) / 2;
    let hh = (ellipse.height as i32) / 2;
    let (roi_w, roi_h) = (roi.width() as i32, roi.height() as i32);

    let mut dark = 0u32;
    for ix in -hw..hw {
        for iy in -hh..hh {
            let fx = ix as f32;
            let fy = iy as f32;
            let xp = (fx * cos - fy * sin + ellipse.center.0) as i32 - roi.left();
            let yp = (fx * sin + fy * cos + ellipse.center.1) as i32 - roi.top();
            if xp < 0 || yp < 0 || xp >= roi_w || yp >= roi_h {
                continue;
            }
            if mask.get_pixel(xp as u32, yp as u32)[0] != 0 {
                dark += 1;
            }
        }
    }
    dark as f32 / ellipse.area()
}

/// Search the square of side 2·search-area centered on the pupil candidate
/// for bright regions and return the region center closest to the pupil
/// center. Ties resolve to the first contour encountered (strict `<`).
fn find_purkinje(
    source: &GrayImage,
    params: &TrackingParams,
    pupil_center: (f32, f32),
) -> Option<(f32, f32)> {
    let sa = params.purkinje_search_area as i32;
    let x0 = pupil_center.0 as i32 - sa;
    let y0 = pupil_center.1 as i32 - sa;
    let side = (2 * sa) as u32;

    let mut bright = GrayImage::new(side, side);
    for y in 0..side {
        for x in 0..side {
            let sx = x0 + x as i32;
            let sy = y0 + y as i32;
            if sx < 0 || sy < 0 || sx >= source.width() as i32 || sy >= source.height() as i32 {
                continue;
            }
            if source.get_pixel(sx as u32, sy as u32)[0] >= params.purkinje_threshold {
                bright.put_pixel(x, y, Luma([255]));
            }
        }
    }

    let mut best: Option<((f32, f32), f32)> = None;
    for contour in find_contours::<i32>(&bright) {
        if contour.points.len() < MIN_CONTOUR_POINTS {
            continue;
        }
        let points: Vec<(f32, f32)> = contour
            .points
            .iter()
            .map(|pt| ((pt.x + x0) as f32, (pt.y + y0) as f32))
            .collect();
        let Some(e) = fit_ellipse(&points) else {
            continue;
        };
        let dx = pupil_center.0 - e.center.0;
        let dy = pupil_center.1 - e.center.1;
        let d2 = dx * dx + dy * dy;
        if best.map_or(true, |(_, bd)| d2 < bd) {
            best = Some((e.center, d2));
        }
    }
    best.map(|(center, _)| center)
}

/// Re-fit the pupil ellipse on the contour points farther than the exclusion
/// radius from the Purkinje center.
fn refit_outside_exclusion(
    points: &[(f32, f32)],
    purkinje: (f32, f32),
    exclude: f32,
    mut preview: Option<&mut RgbaImage>,
) -> Result<Ellipse, DetectFailure> {
    let exclude2 = exclude * exclude;
    let retained: Vec<(f32, f32)> = points
        .iter()
        .copied()
        .filter(|&(x, y)| {
            let dx = x - purkinje.0;
            let dy = y - purkinje.1;
            dx * dx + dy * dy > exclude2
        })
        .collect();
    if retained.len() < MIN_FINE_POINTS {
        return Err(DetectFailure::NoFinePupilCandidate);
    }
    if let Some(p) = preview.as_deref_mut() {
        overlay::draw_fine_points(p, &retained);
    }
    fit_ellipse(&retained).ok_or(DetectFailure::NoFinePupilCandidate)
}
