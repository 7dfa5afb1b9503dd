//! Volumetric B-spline interpolation of order 1-4
//!
//! Samples a 3D volume at arbitrary fractional voxel coordinates. Order 1 is
//! plain trilinear interpolation; orders 2-4 interpolate with B-splines of
//! the same degree after a recursive prefilter turns the samples into spline
//! coefficients (mirror-symmetric boundary), so that the spline passes
//! exactly through the stored values.
//!
//! Coordinates outside `[0, n-1]` on any axis sample to 0.
//!
//! Reference:
//! Unser, M. (1999). "Splines: a perfect fit for signal and image processing."
//! IEEE Signal Processing Magazine, 16(6):22-38. https://doi.org/10.1109/79.799930

use rayon::prelude::*;

use crate::error::{Result, UnwarpError};
use crate::utils::simd_ops::scrub_non_finite_f64;

/// Tolerance for coordinates that land a hair outside the volume
const EDGE_TOLERANCE: f64 = 1e-6;

/// Truncation tolerance for the causal prefilter initialisation
const PREFILTER_TOLERANCE: f64 = 1e-12;

/// Spline order in `[1, 4]`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InterpolationOrder(u8);

impl InterpolationOrder {
    pub const LINEAR: InterpolationOrder = InterpolationOrder(1);
    pub const QUADRATIC: InterpolationOrder = InterpolationOrder(2);
    pub const CUBIC: InterpolationOrder = InterpolationOrder(3);
    pub const QUARTIC: InterpolationOrder = InterpolationOrder(4);

    pub fn new(order: u8) -> Result<Self> {
        if (1..=4).contains(&order) {
            Ok(InterpolationOrder(order))
        } else {
            Err(UnwarpError::configuration(format!(
                "interpolation order must be in [1, 4], got {}",
                order
            )))
        }
    }

    pub fn degree(&self) -> usize {
        self.0 as usize
    }

    /// Poles of the recursive prefilter for this degree
    fn poles(&self) -> Vec<f64> {
        match self.0 {
            2 => vec![8.0_f64.sqrt() - 3.0],
            3 => vec![3.0_f64.sqrt() - 2.0],
            4 => {
                let s = 438976.0_f64.sqrt();
                vec![
                    (664.0 - s).sqrt() + 304.0_f64.sqrt() - 19.0,
                    (664.0 + s).sqrt() - 304.0_f64.sqrt() - 19.0,
                ]
            }
            _ => Vec::new(),
        }
    }
}

impl Default for InterpolationOrder {
    fn default() -> Self {
        Self::LINEAR
    }
}

/// A volume prepared for sampling at one interpolation order.
///
/// Holds spline coefficients (the raw samples for order 1) in Fortran
/// order: index = i + j*nx + k*nx*ny.
#[derive(Debug, Clone)]
pub struct SplineVolume {
    coeffs: Vec<f64>,
    dims: (usize, usize, usize),
    order: InterpolationOrder,
}

impl SplineVolume {
    /// Prefilter `data` for sampling at `order`.
    pub fn new(data: &[f64], dims: (usize, usize, usize), order: InterpolationOrder) -> Result<Self> {
        let (nx, ny, nz) = dims;
        if data.len() != nx * ny * nz {
            return Err(UnwarpError::ShapeMismatch {
                expected: vec![nx, ny, nz],
                actual: vec![data.len()],
            });
        }
        if nx == 0 || ny == 0 || nz == 0 {
            return Err(UnwarpError::configuration("cannot interpolate an empty volume"));
        }

        let mut coeffs = data.to_vec();
        let poles = order.poles();
        if !poles.is_empty() {
            prefilter_3d(&mut coeffs, nx, ny, nz, &poles);
        }

        Ok(Self { coeffs, dims, order })
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }

    pub fn order(&self) -> InterpolationOrder {
        self.order
    }

    /// Sample at fractional voxel coordinate (x, y, z). Returns 0 outside the volume.
    pub fn sample(&self, x: f64, y: f64, z: f64) -> f64 {
        let (nx, ny, nz) = self.dims;
        if !inside(x, nx) || !inside(y, ny) || !inside(z, nz) {
            return 0.0;
        }

        let degree = self.order.degree();
        let mut wx = [0.0; 5];
        let mut wy = [0.0; 5];
        let mut wz = [0.0; 5];
        let mut ix = [0usize; 5];
        let mut iy = [0usize; 5];
        let mut iz = [0usize; 5];
        spline_weights(x, nx, degree, &mut wx, &mut ix);
        spline_weights(y, ny, degree, &mut wy, &mut iy);
        spline_weights(z, nz, degree, &mut wz, &mut iz);

        let nxy = nx * ny;
        let mut value = 0.0;
        for c in 0..=degree {
            if wz[c] == 0.0 {
                continue;
            }
            let k_offset = iz[c] * nxy;
            let mut plane = 0.0;
            for b in 0..=degree {
                if wy[b] == 0.0 {
                    continue;
                }
                let jk_offset = iy[b] * nx + k_offset;
                let mut line = 0.0;
                for a in 0..=degree {
                    if wx[a] != 0.0 {
                        line += wx[a] * self.coeffs[ix[a] + jk_offset];
                    }
                }
                plane += wy[b] * line;
            }
            value += wz[c] * plane;
        }
        value
    }

    /// Sample at a batch of coordinates, replacing NaN/Inf results with 0.
    ///
    /// Returns the number of non-finite values that were replaced.
    pub fn sample_into(&self, xs: &[f64], ys: &[f64], zs: &[f64], out: &mut [f64]) -> usize {
        debug_assert_eq!(xs.len(), out.len());
        debug_assert_eq!(ys.len(), out.len());
        debug_assert_eq!(zs.len(), out.len());

        for (idx, o) in out.iter_mut().enumerate() {
            *o = self.sample(xs[idx], ys[idx], zs[idx]);
        }
        scrub_non_finite_f64(out)
    }
}

#[inline]
fn inside(x: f64, n: usize) -> bool {
    x >= -EDGE_TOLERANCE && x <= (n - 1) as f64 + EDGE_TOLERANCE
}

/// Mirror an index into `[0, n-1]` (whole-sample symmetric extension)
#[inline]
fn mirror_index(i: i64, n: usize) -> usize {
    if n == 1 {
        return 0;
    }
    let period = 2 * (n as i64 - 1);
    let mut i = i.rem_euclid(period);
    if i > n as i64 - 1 {
        i = period - i;
    }
    i as usize
}

/// Centered B-spline basis function of the given degree
#[inline]
fn bspline(degree: usize, t: f64) -> f64 {
    let t = t.abs();
    match degree {
        1 => {
            if t < 1.0 { 1.0 - t } else { 0.0 }
        }
        2 => {
            if t < 0.5 {
                0.75 - t * t
            } else if t < 1.5 {
                let u = 1.5 - t;
                0.5 * u * u
            } else {
                0.0
            }
        }
        3 => {
            if t < 1.0 {
                2.0 / 3.0 - t * t + 0.5 * t * t * t
            } else if t < 2.0 {
                let u = 2.0 - t;
                u * u * u / 6.0
            } else {
                0.0
            }
        }
        4 => {
            let t2 = t * t;
            if t < 0.5 {
                115.0 / 192.0 - 0.625 * t2 + 0.25 * t2 * t2
            } else if t < 1.5 {
                (55.0 + 20.0 * t - 120.0 * t2 + 80.0 * t2 * t - 16.0 * t2 * t2) / 96.0
            } else if t < 2.5 {
                let u = 5.0 - 2.0 * t;
                u * u * u * u / 384.0
            } else {
                0.0
            }
        }
        _ => 0.0,
    }
}

/// Weights and (mirrored) indices of the `degree + 1` coefficients supporting `x`
#[inline]
fn spline_weights(x: f64, n: usize, degree: usize, weights: &mut [f64; 5], indices: &mut [usize; 5]) {
    let half = (degree / 2) as i64;
    let start = if degree % 2 == 1 {
        x.floor() as i64 - half
    } else {
        (x + 0.5).floor() as i64 - half
    };
    for p in 0..=degree {
        let i = start + p as i64;
        weights[p] = bspline(degree, x - i as f64);
        indices[p] = mirror_index(i, n);
    }
}

/// Convert samples to B-spline coefficients along all three axes.
fn prefilter_3d(c: &mut [f64], nx: usize, ny: usize, nz: usize, poles: &[f64]) {
    let nxy = nx * ny;

    // x and y lines stay inside one z-plane
    c.par_chunks_mut(nxy).for_each(|plane| {
        let mut line = vec![0.0; nx.max(ny)];
        if nx > 1 {
            for j in 0..ny {
                let row = &mut plane[j * nx..(j + 1) * nx];
                prefilter_line(row, poles);
            }
        }
        if ny > 1 {
            for i in 0..nx {
                for j in 0..ny {
                    line[j] = plane[i + j * nx];
                }
                prefilter_line(&mut line[..ny], poles);
                for j in 0..ny {
                    plane[i + j * nx] = line[j];
                }
            }
        }
    });

    if nz > 1 {
        let mut line = vec![0.0; nz];
        for idx in 0..nxy {
            for k in 0..nz {
                line[k] = c[idx + k * nxy];
            }
            prefilter_line(&mut line, poles);
            for k in 0..nz {
                c[idx + k * nxy] = line[k];
            }
        }
    }
}

/// In-place recursive prefilter of one line (causal + anti-causal pass per pole)
fn prefilter_line(c: &mut [f64], poles: &[f64]) {
    let n = c.len();
    if n < 2 {
        return;
    }

    let gain: f64 = poles.iter().map(|&z| (1.0 - z) * (1.0 - 1.0 / z)).product();
    for v in c.iter_mut() {
        *v *= gain;
    }

    for &z in poles {
        c[0] = initial_causal(c, z);
        for k in 1..n {
            c[k] += z * c[k - 1];
        }
        c[n - 1] = initial_anticausal(c, z);
        for k in (0..n - 1).rev() {
            c[k] = z * (c[k + 1] - c[k]);
        }
    }
}

fn initial_causal(c: &[f64], z: f64) -> f64 {
    let n = c.len();
    let horizon = (PREFILTER_TOLERANCE.ln() / z.abs().ln()).ceil() as usize;

    if horizon < n {
        // truncated sum; remaining terms are below tolerance
        let mut zn = z;
        let mut sum = c[0];
        for &v in &c[1..horizon] {
            sum += zn * v;
            zn *= z;
        }
        sum
    } else {
        // exact mirror-symmetric initialisation
        let iz = 1.0 / z;
        let mut zn = z;
        let mut z2n = z.powi(n as i32 - 1);
        let mut sum = c[0] + z2n * c[n - 1];
        z2n *= z2n * iz;
        for &v in &c[1..n - 1] {
            sum += (zn + z2n) * v;
            zn *= z;
            z2n *= iz;
        }
        sum / (1.0 - zn * zn)
    }
}

#[inline]
fn initial_anticausal(c: &[f64], z: f64) -> f64 {
    let n = c.len();
    (z / (z * z - 1.0)) * (c[n - 1] + z * c[n - 2])
}
