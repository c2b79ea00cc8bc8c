//! Direct least-squares ellipse fitting.
//!
//! Fits a general conic `a·x² + b·xy + c·y² + d·x + e·y = 1` to a point set
//! by linear least squares after shifting the points to their centroid (the
//! centroid of a closed contour lies inside the ellipse, so the unit
//! right-hand side is always representable and the system stays well
//! conditioned). The conic is then converted to center / axes / rotation
//! form. Point sets whose best conic is not an ellipse yield `None`.

use nalgebra::{DMatrix, DVector, Matrix2, Vector2};

/// A fitted ellipse in frame coordinates.
///
/// `width` and `height` are full axis lengths (diameters); `angle_deg` is the
/// rotation of the `width` axis, in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ellipse {
    pub center: (f32, f32),
    pub width: f32,
    pub height: f32,
    pub angle_deg: f32,
}

impl Ellipse {
    /// Ratio of the `height` axis to the `width` axis.
    pub fn oblateness(&self) -> f32 {
        self.height / self.width
    }

    /// Area enclosed by the ellipse.
    pub fn area(&self) -> f32 {
        std::f32::consts::PI * self.width * self.height / 4.0
    }
}

/// Fit an ellipse to `points`. Needs at least 5 points; returns `None` when
/// the solve is degenerate or the resulting conic is not an ellipse.
pub fn fit_ellipse(points: &[(f32, f32)]) -> Option<Ellipse> {
    if points.len() < 5 {
        return None;
    }

    let n = points.len();
    let cx = points.iter().map(|p| f64::from(p.0)).sum::<f64>() / n as f64;
    let cy = points.iter().map(|p| f64::from(p.1)).sum::<f64>() / n as f64;

    let mut design = DMatrix::<f64>::zeros(n, 5);
    for (i, p) in points.iter().enumerate() {
        let x = f64::from(p.0) - cx;
        let y = f64::from(p.1) - cy;
        design[(i, 0)] = x * x;
        design[(i, 1)] = x * y;
        design[(i, 2)] = y * y;
        design[(i, 3)] = x;
        design[(i, 4)] = y;
    }
    let rhs = DVector::<f64>::from_element(n, 1.0);
    let svd = design.svd(true, true);
    let coeffs = svd.solve(&rhs, 1e-12).ok()?;
    let (a, b, c, d, e) = (coeffs[0], coeffs[1], coeffs[2], coeffs[3], coeffs[4]);

    // Conic matrix form: xᵀ·A·x + Lᵀ·x = 1 with A = [a b/2; b/2 c].
    let quad = Matrix2::new(a, b / 2.0, b / 2.0, c);
    let lin = Vector2::new(d, e);

    // Ellipse condition: positive-definite quadratic part.
    let det = quad.determinant();
    if det <= f64::EPSILON || a + c <= 0.0 {
        return None;
    }

    // Center (in centroid-shifted coordinates): 2·A·x0 + L = 0.
    let center = quad.try_inverse()? * lin * -0.5;
    // (x-x0)ᵀ·A·(x-x0) = 1 + x0ᵀ·A·x0
    let k = 1.0 + (center.transpose() * quad * center)[(0, 0)];
    if k <= 0.0 {
        return None;
    }

    let eigen = nalgebra::SymmetricEigen::new(quad);
    let l0 = eigen.eigenvalues[0];
    let l1 = eigen.eigenvalues[1];
    if l0 <= 0.0 || l1 <= 0.0 {
        return None;
    }
    let axis0 = eigen.eigenvectors.column(0);
    let angle = axis0[1].atan2(axis0[0]);

    Some(Ellipse {
        center: ((center[0] + cx) as f32, (center[1] + cy) as f32),
        width: (2.0 * (k / l0).sqrt()) as f32,
        height: (2.0 * (k / l1).sqrt()) as f32,
        angle_deg: angle.to_degrees() as f32,
    })
}
