//! Displacement field from the spherical-harmonic series
//!
//! For every grid point the position is converted to spherical coordinates
//! about the coil iso-center and the series
//!
//! ```text
//! b = sum_n rad^n sum_m (alpha[n,m] cos(m phi) + beta[n,m] sin(m phi)) P_n^m(cos theta) w(n,m)
//! ```
//!
//! is accumulated for each axis. The Siemens convention uses `rad = r / R0`
//! and `w(n,m)` the Siemens normalization. The GE convention uses the radius
//! in centimeters with `w = 1` and scales the sum back by 1/100. Either way
//! the displacement in millimeters is `b * R0_mm`.
//!
//! All three axes share the Legendre table and trigonometric terms of a
//! point, so the basis is built once per point and contracted against each
//! axis' coefficients.

use std::sync::atomic::{AtomicUsize, Ordering};

use rayon::prelude::*;
use tracing::info;

use super::grid::EvaluationGrid;
use super::legendre::{legendre_table, siemens_normalization};
use crate::coeffs::{Axis, CoefficientSet};
use crate::config::Vendor;

/// Offset added to x (mm) to keep r away from zero at the iso-center
const ISOCENTER_EPSILON_MM: f64 = 1e-4;

/// Three displacement components (mm) on the evaluation grid, x-fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplacementField {
    pub dx: Vec<f64>,
    pub dy: Vec<f64>,
    pub dz: Vec<f64>,
    dims: (usize, usize, usize),
}

impl DisplacementField {
    pub fn zeros(dims: (usize, usize, usize)) -> Self {
        let n = dims.0 * dims.1 * dims.2;
        Self {
            dx: vec![0.0; n],
            dy: vec![0.0; n],
            dz: vec![0.0; n],
            dims,
        }
    }

    /// Wrap existing component arrays. Returns `None` if a length disagrees with `dims`.
    pub fn from_components(
        dx: Vec<f64>,
        dy: Vec<f64>,
        dz: Vec<f64>,
        dims: (usize, usize, usize),
    ) -> Option<Self> {
        let n = dims.0 * dims.1 * dims.2;
        if dx.len() != n || dy.len() != n || dz.len() != n {
            return None;
        }
        Some(Self { dx, dy, dz, dims })
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }

    pub fn component(&self, axis: Axis) -> &[f64] {
        match axis {
            Axis::X => &self.dx,
            Axis::Y => &self.dy,
            Axis::Z => &self.dz,
        }
    }

    /// Largest absolute displacement over all components
    pub fn max_abs(&self) -> f64 {
        self.dx
            .iter()
            .chain(self.dy.iter())
            .chain(self.dz.iter())
            .fold(0.0f64, |acc, v| acc.max(v.abs()))
    }
}

/// Per-point workspace for the harmonic basis
pub struct HarmonicBasis<'a> {
    coeffs: &'a CoefficientSet,
    vendor: Vendor,
    nmax: usize,
    weights: Vec<f64>,
    legendre: Vec<f64>,
    cos_m: Vec<f64>,
    sin_m: Vec<f64>,
}

impl<'a> HarmonicBasis<'a> {
    pub fn new(coeffs: &'a CoefficientSet, vendor: Vendor) -> Self {
        let nmax = coeffs.degree();
        let stride = nmax + 1;
        let mut weights = vec![1.0; stride * stride];
        if vendor == Vendor::Siemens {
            for n in 0..=nmax {
                for m in 0..=n {
                    weights[n * stride + m] = siemens_normalization(n, m);
                }
            }
        }
        Self {
            coeffs,
            vendor,
            nmax,
            weights,
            legendre: vec![0.0; stride * stride],
            cos_m: vec![0.0; stride],
            sin_m: vec![0.0; stride],
        }
    }

    /// Displacement (mm) at a physical position (mm) relative to iso-center
    pub fn displacement(&mut self, p: [f64; 3]) -> [f64; 3] {
        let x = p[0] + ISOCENTER_EPSILON_MM;
        let (y, z) = (p[1], p[2]);
        let r = (x * x + y * y + z * z).sqrt();
        let cos_theta = (z / r).clamp(-1.0, 1.0);
        let phi = y.atan2(x);

        legendre_table(self.nmax, cos_theta, &mut self.legendre);
        for m in 0..=self.nmax {
            let (s, c) = (m as f64 * phi).sin_cos();
            self.cos_m[m] = c;
            self.sin_m[m] = s;
        }

        let r0_mm = self.coeffs.r0_mm();
        let rad = match self.vendor {
            Vendor::Siemens => r / r0_mm,
            Vendor::Ge => r / 10.0,
        };

        let stride = self.nmax + 1;
        let mut out = [0.0; 3];
        for axis in Axis::ALL {
            let alpha = self.coeffs.alpha(axis);
            let beta = self.coeffs.beta(axis);
            let mut b = 0.0;
            let mut rad_n = 1.0;
            for n in 0..=self.nmax {
                let mut inner = 0.0;
                for m in 0..=n {
                    let idx = n * stride + m;
                    let angular = alpha.get(n, m) * self.cos_m[m] + beta.get(n, m) * self.sin_m[m];
                    inner += angular * self.legendre[idx] * self.weights[idx];
                }
                b += rad_n * inner;
                rad_n *= rad;
            }
            if self.vendor == Vendor::Ge {
                b /= 100.0;
            }
            out[axis.index()] = b * r0_mm;
        }
        out
    }
}

/// Evaluate the displacement field of `coeffs` on `grid`.
pub fn evaluate(coeffs: &CoefficientSet, vendor: Vendor, grid: &EvaluationGrid) -> DisplacementField {
    evaluate_with_progress(coeffs, vendor, grid, |_, _| {})
}

/// Evaluate the displacement field with a progress callback.
///
/// Planes are evaluated in parallel; `progress(done, total)` is called once
/// per finished z-plane, possibly from worker threads.
pub fn evaluate_with_progress<F>(
    coeffs: &CoefficientSet,
    vendor: Vendor,
    grid: &EvaluationGrid,
    progress: F,
) -> DisplacementField
where
    F: Fn(usize, usize) + Sync,
{
    let n = grid.numpoints();
    let plane = n * n;
    let mut field = DisplacementField::zeros(grid.dims());

    info!(
        "Evaluating {} harmonics (degree {}) on a {}^3 grid, {:.1} mm to {:.1} mm",
        vendor,
        coeffs.degree(),
        n,
        grid.coordinate_mm(0),
        grid.coordinate_mm(n - 1)
    );

    if coeffs.is_zero() {
        progress(n, n);
        return field;
    }

    let axis = grid.axis_mm();
    let done = AtomicUsize::new(0);
    let DisplacementField { dx, dy, dz, .. } = &mut field;

    dx.par_chunks_mut(plane)
        .zip(dy.par_chunks_mut(plane))
        .zip(dz.par_chunks_mut(plane))
        .enumerate()
        .for_each(|(k, ((px, py), pz))| {
            let mut basis = HarmonicBasis::new(coeffs, vendor);
            let z = axis[k];
            for j in 0..n {
                let y = axis[j];
                for i in 0..n {
                    let d = basis.displacement([axis[i], y, z]);
                    let idx = i + j * n;
                    px[idx] = d[0];
                    py[idx] = d[1];
                    pz[idx] = d[2];
                }
            }
            let finished = done.fetch_add(1, Ordering::Relaxed) + 1;
            progress(finished, n);
        });

    field
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coeffs::CoefficientMatrix;

    fn single_term(axis: Axis, n: usize, m: usize, value: f64, r0_m: f64) -> CoefficientSet {
        let size = n + 1;
        let mut alpha = [
            CoefficientMatrix::zeros(size),
            CoefficientMatrix::zeros(size),
            CoefficientMatrix::zeros(size),
        ];
        alpha[axis.index()].set(n, m, value).unwrap();
        let beta = [
            CoefficientMatrix::zeros(size),
            CoefficientMatrix::zeros(size),
            CoefficientMatrix::zeros(size),
        ];
        CoefficientSet::from_matrices(alpha, beta, r0_m).unwrap()
    }

    #[test]
    fn test_zero_coefficients_give_zero_field() {
        let coeffs = CoefficientSet::zeros(5, 0.25).unwrap();
        let grid = EvaluationGrid::new(-0.1, 0.1, 7).unwrap();
        for vendor in [Vendor::Siemens, Vendor::Ge] {
            let field = evaluate(&coeffs, vendor, &grid);
            assert_eq!(field.dims(), (7, 7, 7));
            assert_eq!(field.max_abs(), 0.0);
        }
    }

    #[test]
    fn test_zero_coefficients_full_evaluation_path() {
        // A zero set sized past the shortcut still yields exact zeros.
        let coeffs = CoefficientSet::zeros(3, 0.25).unwrap();
        let mut basis = HarmonicBasis::new(&coeffs, Vendor::Siemens);
        for p in [[0.0, 0.0, 0.0], [120.0, -40.0, 75.0], [0.0, 0.0, -300.0]] {
            assert_eq!(basis.displacement(p), [0.0; 3]);
        }
    }

    #[test]
    fn test_siemens_linear_gradient_term() {
        // alpha_z[1][0] = 1 gives b = (r/R0) cos(theta) = z/R0, displacement = z.
        let coeffs = single_term(Axis::Z, 1, 0, 1.0, 0.25);
        let mut basis = HarmonicBasis::new(&coeffs, Vendor::Siemens);
        for p in [[10.0, 20.0, 30.0], [-50.0, 5.0, -80.0]] {
            let d = basis.displacement(p);
            assert!((d[2] - p[2]).abs() < 1e-9, "{:?}", d);
            assert_eq!(d[0], 0.0);
            assert_eq!(d[1], 0.0);
        }
    }

    #[test]
    fn test_siemens_sectoral_term_is_x() {
        // alpha_x[1][1]: norm(1,1) P_1^1 = sqrt(3/4) sin(theta), so b = sqrt(3/4) x / R0.
        let coeffs = single_term(Axis::X, 1, 1, 1.0, 0.25);
        let mut basis = HarmonicBasis::new(&coeffs, Vendor::Siemens);
        let p = [40.0, -15.0, 22.0];
        let d = basis.displacement(p);
        let want = 0.75f64.sqrt() * (p[0] + ISOCENTER_EPSILON_MM);
        assert!((d[0] - want).abs() < 1e-9, "got {} want {}", d[0], want);
    }

    #[test]
    fn test_ge_linear_term_units() {
        // GE: b = r_cm cos(theta) / 100 = z_mm / 1000, times R0_mm.
        let coeffs = single_term(Axis::Z, 1, 0, 1.0, 0.2);
        let mut basis = HarmonicBasis::new(&coeffs, Vendor::Ge);
        let d = basis.displacement([5.0, 5.0, 50.0]);
        assert!((d[2] - 50.0 / 1000.0 * 200.0).abs() < 1e-9);
    }

    #[test]
    fn test_isocenter_is_finite() {
        let coeffs = single_term(Axis::Y, 4, 2, 0.3, 0.25);
        let mut basis = HarmonicBasis::new(&coeffs, Vendor::Siemens);
        let d = basis.displacement([0.0, 0.0, 0.0]);
        assert!(d.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_grid_layout_is_x_fastest() {
        let coeffs = single_term(Axis::Z, 1, 0, 1.0, 0.25);
        let grid = EvaluationGrid::new(-0.05, 0.05, 5).unwrap();
        let field = evaluate(&coeffs, Vendor::Siemens, &grid);
        let n = 5;
        for k in 0..n {
            let idx = 2 + 1 * n + k * n * n;
            assert!((field.dz[idx] - grid.coordinate_mm(k)).abs() < 1e-9);
        }
    }

    #[test]
    fn test_progress_reports_every_plane() {
        let coeffs = single_term(Axis::X, 2, 1, 0.1, 0.25);
        let grid = EvaluationGrid::new(-0.05, 0.05, 6).unwrap();
        let calls = AtomicUsize::new(0);
        let _ = evaluate_with_progress(&coeffs, Vendor::Siemens, &grid, |_, total| {
            assert_eq!(total, 6);
            calls.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(calls.load(Ordering::Relaxed), 6);
    }
}
