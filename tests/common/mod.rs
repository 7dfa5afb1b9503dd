//! Common test utilities for gradunwarp-core integration tests
#![allow(dead_code)]

use gradunwarp_core::coeffs::{Axis, CoefficientMatrix, CoefficientSet};
use gradunwarp_core::{Affine, VoxelVolume};

/// Compute RMSE between two arrays, only within mask (non-zero values)
pub fn rmse(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    let mut sum_sq = 0.0;
    let mut count = 0usize;
    for i in 0..a.len() {
        if mask[i] > 0 {
            let diff = a[i] - b[i];
            sum_sq += diff * diff;
            count += 1;
        }
    }
    if count == 0 {
        return 0.0;
    }
    (sum_sq / count as f64).sqrt()
}

/// Compute NRMSE (normalized by range of ground truth within mask)
pub fn nrmse(a: &[f64], b: &[f64], mask: &[u8]) -> f64 {
    let rmse_val = rmse(a, b, mask);

    let mut min_b = f64::INFINITY;
    let mut max_b = f64::NEG_INFINITY;
    for i in 0..b.len() {
        if mask[i] > 0 {
            if b[i] < min_b { min_b = b[i]; }
            if b[i] > max_b { max_b = b[i]; }
        }
    }

    let range = max_b - min_b;
    if range == 0.0 {
        return 0.0;
    }
    rmse_val / range
}

/// Mask excluding a border of `margin` voxels on every face
pub fn interior_mask(dims: (usize, usize, usize), margin: usize) -> Vec<u8> {
    let (nx, ny, nz) = dims;
    let mut mask = vec![0u8; nx * ny * nz];
    for k in margin..nz.saturating_sub(margin) {
        for j in margin..ny.saturating_sub(margin) {
            for i in margin..nx.saturating_sub(margin) {
                mask[i + j * nx + k * nx * ny] = 1;
            }
        }
    }
    mask
}

/// Affine with isotropic `voxel_mm` spacing, centred on the scanner origin
pub fn centred_affine(dims: (usize, usize, usize), voxel_mm: f64) -> Affine {
    let offset = |n: usize| -voxel_mm * (n as f64 - 1.0) / 2.0;
    Affine::scale_translate(
        [voxel_mm, voxel_mm, voxel_mm],
        [offset(dims.0), offset(dims.1), offset(dims.2)],
    )
}

/// Gaussian blob of amplitude `amplitude` and width `sigma_mm` at the volume centre
pub fn gaussian_volume(dims: (usize, usize, usize), voxel_mm: f64, sigma_mm: f64, amplitude: f64) -> VoxelVolume {
    let (nx, ny, nz) = dims;
    let affine = centred_affine(dims, voxel_mm);
    let mut data = vec![0.0; nx * ny * nz];
    for k in 0..nz {
        for j in 0..ny {
            for i in 0..nx {
                let [x, y, z] = affine.apply([i as f64, j as f64, k as f64]);
                let r2 = x * x + y * y + z * z;
                data[i + j * nx + k * nx * ny] = amplitude * (-r2 / (2.0 * sigma_mm * sigma_mm)).exp();
            }
        }
    }
    VoxelVolume::from_3d(data, dims, affine).expect("valid volume")
}

/// Constant-valued volume
pub fn uniform_volume(dims: (usize, usize, usize), voxel_mm: f64, value: f64) -> VoxelVolume {
    let n = dims.0 * dims.1 * dims.2;
    VoxelVolume::from_3d(vec![value; n], dims, centred_affine(dims, voxel_mm)).expect("valid volume")
}

/// Coefficient set with the given `(alpha, axis, n, m, value)` entries
pub fn sparse_coefficients(degree: usize, r0_m: f64, entries: &[(bool, Axis, usize, usize, f64)]) -> CoefficientSet {
    let size = degree + 1;
    let mut alpha = [
        CoefficientMatrix::zeros(size),
        CoefficientMatrix::zeros(size),
        CoefficientMatrix::zeros(size),
    ];
    let mut beta = alpha.clone();
    for &(is_alpha, axis, n, m, value) in entries {
        let target = if is_alpha { &mut alpha } else { &mut beta };
        target[axis.index()].set(n, m, value).expect("index within degree");
    }
    CoefficientSet::from_matrices(alpha, beta, r0_m).expect("valid coefficients")
}
