//! Cubic evaluation grid for the harmonic field

use crate::affine::Affine;
use crate::error::{Result, UnwarpError};

/// Cubic grid over `[fov_min, fov_max]` (meters) on all three axes.
///
/// Points are laid out x-fastest, matching the rest of the crate:
/// `index = i + j*n + k*n*n` with `i` along x.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationGrid {
    fov_min_m: f64,
    fov_max_m: f64,
    numpoints: usize,
    spacing_mm: f64,
}

impl EvaluationGrid {
    /// Build a grid, rejecting fewer than two points or a non-positive spacing.
    pub fn new(fov_min_m: f64, fov_max_m: f64, numpoints: usize) -> Result<Self> {
        if !fov_min_m.is_finite() || !fov_max_m.is_finite() {
            return Err(UnwarpError::configuration(format!(
                "grid field of view must be finite, got [{}, {}]",
                fov_min_m, fov_max_m
            )));
        }
        if numpoints < 2 {
            return Err(UnwarpError::configuration(format!(
                "grid needs at least 2 points per axis, got {}",
                numpoints
            )));
        }
        let spacing_mm = (fov_max_m - fov_min_m) * 1000.0 / (numpoints - 1) as f64;
        if !(spacing_mm > 0.0) {
            return Err(UnwarpError::configuration(format!(
                "grid spacing must be positive (fov [{}, {}] m, {} points)",
                fov_min_m, fov_max_m, numpoints
            )));
        }
        Ok(Self {
            fov_min_m,
            fov_max_m,
            numpoints,
            spacing_mm,
        })
    }

    pub fn fov_min_m(&self) -> f64 {
        self.fov_min_m
    }

    pub fn fov_max_m(&self) -> f64 {
        self.fov_max_m
    }

    pub fn numpoints(&self) -> usize {
        self.numpoints
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        (self.numpoints, self.numpoints, self.numpoints)
    }

    pub fn len(&self) -> usize {
        self.numpoints * self.numpoints * self.numpoints
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Uniform spacing between neighbouring points, in millimeters
    pub fn spacing_mm(&self) -> f64 {
        self.spacing_mm
    }

    /// Physical coordinate (mm) of grid index `i` along any axis
    #[inline]
    pub fn coordinate_mm(&self, i: usize) -> f64 {
        self.fov_min_m * 1000.0 + self.spacing_mm * i as f64
    }

    /// Coordinates of all points along one axis, in millimeters
    pub fn axis_mm(&self) -> Vec<f64> {
        (0..self.numpoints).map(|i| self.coordinate_mm(i)).collect()
    }

    /// Grid index to physical xyz (mm)
    pub fn index_to_xyz(&self) -> Affine {
        let origin = self.fov_min_m * 1000.0;
        Affine::scale_translate([self.spacing_mm; 3], [origin; 3])
    }

    /// Physical xyz (mm) to fractional grid index
    pub fn xyz_to_index(&self) -> Affine {
        let inv = 1.0 / self.spacing_mm;
        let offset = -self.fov_min_m * 1000.0 * inv;
        Affine::scale_translate([inv; 3], [offset; 3])
    }
}
