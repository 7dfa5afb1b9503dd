//! Per-slice coordinate mapping and resampling
//!
//! For every voxel `v` of output slice `k`:
//!
//! 1. `p = M v` maps the voxel into scanner space (LAI, half-voxel centered)
//! 2. `g = G p` locates it on the evaluation grid, where the displacement
//!    `d` (and the Jacobian multiplier) are interpolated
//! 3. `s = M^-1 (p + polarity * d)` is the source voxel, where the input
//!    intensity is interpolated
//! 4. the source voxel, in FSL scaled-mm coordinates, is the full warp
//!
//! All interpolations use the run's order and replace NaN/Inf with 0.

use std::ops::AddAssign;

use crate::affine::Affine;
use crate::config::{Polarity, WarpConvention};
use crate::interpolation::SplineVolume;
use crate::utils::simd_ops::{axpy_into_f64, multiply_f64, subtract_into_f64};

/// Counts of locally repaired numeric anomalies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnomalyCounts {
    /// Non-finite displacement samples replaced by 0
    pub displacement: usize,
    /// Non-finite intensity samples replaced by 0
    pub intensity: usize,
    /// Non-finite Jacobian samples replaced by 0
    pub jacobian: usize,
    /// Grid determinants clipped to the vendor maximum
    pub jacobian_clipped: usize,
    /// Grid determinants (or their inverses) that were NaN/Inf
    pub jacobian_non_finite: usize,
}

impl AnomalyCounts {
    pub fn total(&self) -> usize {
        self.displacement + self.intensity + self.jacobian + self.jacobian_clipped + self.jacobian_non_finite
    }
}

impl AddAssign for AnomalyCounts {
    fn add_assign(&mut self, rhs: Self) {
        self.displacement += rhs.displacement;
        self.intensity += rhs.intensity;
        self.jacobian += rhs.jacobian;
        self.jacobian_clipped += rhs.jacobian_clipped;
        self.jacobian_non_finite += rhs.jacobian_non_finite;
    }
}

/// FSL scaled-mm coordinates for a voxel-to-RAS affine.
///
/// Voxel indices are scaled by the voxel pitch. When the affine has a
/// positive determinant (neurological storage) the x axis is flipped.
pub fn vox_to_fsl(affine: &Affine, nx: usize) -> Affine {
    let [p1, p2, p3] = affine.voxel_sizes();
    if affine.determinant3() > 0.0 {
        Affine::scale_translate([-p1, p2, p3], [p1 * (nx as f64 - 1.0), 0.0, 0.0])
    } else {
        Affine::scale_translate([p1, p2, p3], [0.0; 3])
    }
}

/// Resampled data for one slice, in-plane index `i + j*nx`.
#[derive(Debug, Clone)]
pub struct SliceOutput {
    pub slice: usize,
    /// One plane per input frame
    pub intensity: Vec<Vec<f64>>,
    pub jacobian: Vec<f64>,
    /// Warp components x, y, z
    pub warp: [Vec<f64>; 3],
    pub anomalies: AnomalyCounts,
}

/// Read-only state shared by all slices of a run.
pub struct SliceResampler<'a> {
    /// Prefiltered input frames
    pub frames: &'a [SplineVolume],
    /// Prefiltered displacement components on the grid
    pub displacement: &'a [SplineVolume; 3],
    /// Prefiltered Jacobian multiplier; `None` means a constant 1
    pub jacobian: Option<&'a SplineVolume>,
    /// Voxel to LAI, half-voxel centered
    pub vox_to_lai: Affine,
    pub lai_to_vox: Affine,
    /// LAI (mm) to fractional grid index
    pub lai_to_grid: Affine,
    pub vox_to_fsl: Affine,
    pub polarity: Polarity,
    pub convention: WarpConvention,
    /// Spatial dimensions of the input volume
    pub dims: (usize, usize, usize),
}

impl<'a> SliceResampler<'a> {
    /// Resample slice `k` of every frame.
    pub fn resample_slice(&self, k: usize) -> SliceOutput {
        let (nx, ny, _) = self.dims;
        let plane = nx * ny;
        let mut anomalies = AnomalyCounts::default();

        let mut vx = vec![0.0; plane];
        let mut vy = vec![0.0; plane];
        let vz = vec![k as f64; plane];
        for j in 0..ny {
            for i in 0..nx {
                vx[i + j * nx] = i as f64;
                vy[i + j * nx] = j as f64;
            }
        }

        // Scanner (LAI) coordinates and their grid indices
        let (mut px, mut py, mut pz) = (vec![0.0; plane], vec![0.0; plane], vec![0.0; plane]);
        self.vox_to_lai
            .transform_coordinates_into(&vx, &vy, &vz, &mut px, &mut py, &mut pz);
        let (mut gx, mut gy, mut gz) = (vec![0.0; plane], vec![0.0; plane], vec![0.0; plane]);
        self.lai_to_grid
            .transform_coordinates_into(&px, &py, &pz, &mut gx, &mut gy, &mut gz);

        // Displacement at the grid locations
        let mut d = [vec![0.0; plane], vec![0.0; plane], vec![0.0; plane]];
        for (component, out) in self.displacement.iter().zip(d.iter_mut()) {
            anomalies.displacement += component.sample_into(&gx, &gy, &gz, out);
        }

        // Displaced scanner coordinates, back to source voxels
        let sign = self.polarity.sign();
        let (mut wx, mut wy, mut wz) = (vec![0.0; plane], vec![0.0; plane], vec![0.0; plane]);
        axpy_into_f64(&mut wx, &px, sign, &d[0]);
        axpy_into_f64(&mut wy, &py, sign, &d[1]);
        axpy_into_f64(&mut wz, &pz, sign, &d[2]);
        let (mut sx, mut sy, mut sz) = (vec![0.0; plane], vec![0.0; plane], vec![0.0; plane]);
        self.lai_to_vox
            .transform_coordinates_into(&wx, &wy, &wz, &mut sx, &mut sy, &mut sz);

        let jacobian = match self.jacobian {
            Some(jac) => {
                let mut out = vec![0.0; plane];
                anomalies.jacobian += jac.sample_into(&gx, &gy, &gz, &mut out);
                out
            }
            None => vec![1.0; plane],
        };

        let intensity = self
            .frames
            .iter()
            .map(|frame| {
                let mut out = vec![0.0; plane];
                anomalies.intensity += frame.sample_into(&sx, &sy, &sz, &mut out);
                if self.jacobian.is_some() {
                    multiply_f64(&mut out, &jacobian);
                }
                out
            })
            .collect();

        // Full warp: source voxel in FSL scaled mm
        let mut warp = [vec![0.0; plane], vec![0.0; plane], vec![0.0; plane]];
        {
            let [fx, fy, fz] = &mut warp;
            self.vox_to_fsl.transform_coordinates_into(&sx, &sy, &sz, fx, fy, fz);
        }
        if self.convention == WarpConvention::Relative {
            let (mut ox, mut oy, mut oz) = (vec![0.0; plane], vec![0.0; plane], vec![0.0; plane]);
            self.vox_to_fsl
                .transform_coordinates_into(&vx, &vy, &vz, &mut ox, &mut oy, &mut oz);
            for (component, own) in warp.iter_mut().zip([ox, oy, oz]) {
                let absolute = component.clone();
                subtract_into_f64(component, &absolute, &own);
            }
        }

        SliceOutput {
            slice: k,
            intensity,
            jacobian,
            warp,
            anomalies,
        }
    }
}
