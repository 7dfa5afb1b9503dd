//! Finite-difference gradient operators
//!
//! Second-order central differences in the interior and first-order
//! one-sided differences on the boundary. Arrays are x-fastest:
//! `index = i + j*nx + k*nx*ny`.

use rayon::prelude::*;

/// Central-difference gradient (in-place)
///
/// Writes the derivative along each axis into pre-allocated buffers. An axis
/// of length 1 has zero derivative.
///
/// # Arguments
/// * `gx`, `gy`, `gz` - Output gradient components (must be pre-allocated to nx*ny*nz)
/// * `f` - Input array (nx * ny * nz)
/// * `nx`, `ny`, `nz` - Array dimensions
/// * `hx`, `hy`, `hz` - Sample spacing along each axis (non-zero)
pub fn central_grad_inplace(
    gx: &mut [f64], gy: &mut [f64], gz: &mut [f64],
    f: &[f64],
    nx: usize, ny: usize, nz: usize,
    hx: f64, hy: f64, hz: f64,
) {
    let plane = nx * ny;
    debug_assert_eq!(f.len(), plane * nz);

    gx.par_chunks_mut(plane)
        .zip(gy.par_chunks_mut(plane))
        .zip(gz.par_chunks_mut(plane))
        .enumerate()
        .for_each(|(k, ((px, py), pz))| {
            let k_offset = k * plane;
            for j in 0..ny {
                let j_offset = j * nx;
                for i in 0..nx {
                    let idx = i + j_offset;
                    px[idx] = diff_along(f, k_offset + j_offset, 1, i, nx, hx);
                    py[idx] = diff_along(f, k_offset + i, nx, j, ny, hy);
                    pz[idx] = diff_along(f, j_offset + i, plane, k, nz, hz);
                }
            }
        });
}

/// Derivative at position `pos` of the line `base + t*stride`, `t < len`
#[inline]
fn diff_along(f: &[f64], base: usize, stride: usize, pos: usize, len: usize, h: f64) -> f64 {
    if len < 2 {
        return 0.0;
    }
    let at = |t: usize| f[base + t * stride];
    if pos == 0 {
        (at(1) - at(0)) / h
    } else if pos == len - 1 {
        (at(len - 1) - at(len - 2)) / h
    } else {
        (at(pos + 1) - at(pos - 1)) / (2.0 * h)
    }
}

/// Central-difference gradient
///
/// # Returns
/// (gx, gy, gz) derivative components
pub fn central_grad(
    f: &[f64],
    nx: usize, ny: usize, nz: usize,
    hx: f64, hy: f64, hz: f64,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    let n_total = nx * ny * nz;
    let mut gx = vec![0.0; n_total];
    let mut gy = vec![0.0; n_total];
    let mut gz = vec![0.0; n_total];
    central_grad_inplace(&mut gx, &mut gy, &mut gz, f, nx, ny, nz, hx, hy, hz);
    (gx, gy, gz)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradient_of_constant_is_zero() {
        let (nx, ny, nz) = (4, 5, 3);
        let f = vec![7.5; nx * ny * nz];
        let (gx, gy, gz) = central_grad(&f, nx, ny, nz, 1.0, 2.0, 3.0);
        assert!(gx.iter().chain(gy.iter()).chain(gz.iter()).all(|&v| v == 0.0));
    }

    #[test]
    fn test_gradient_of_linear_is_exact() {
        // f = 2x - 3y + 0.5z on a grid with spacing (1.5, 2, 0.5)
        let (nx, ny, nz) = (5, 4, 6);
        let (hx, hy, hz) = (1.5, 2.0, 0.5);
        let mut f = vec![0.0; nx * ny * nz];
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    let (x, y, z) = (i as f64 * hx, j as f64 * hy, k as f64 * hz);
                    f[i + j * nx + k * nx * ny] = 2.0 * x - 3.0 * y + 0.5 * z;
                }
            }
        }
        let (gx, gy, gz) = central_grad(&f, nx, ny, nz, hx, hy, hz);
        for idx in 0..f.len() {
            assert!((gx[idx] - 2.0).abs() < 1e-12);
            assert!((gy[idx] + 3.0).abs() < 1e-12);
            assert!((gz[idx] - 0.5).abs() < 1e-12);
        }
    }

    #[test]
    fn test_gradient_stencil_on_ramp() {
        let f = vec![1.0, 2.0, 4.0, 7.0, 11.0];
        let (gx, gy, gz) = central_grad(&f, 5, 1, 1, 1.0, 1.0, 1.0);
        assert_eq!(gx, vec![1.0, 1.5, 2.5, 3.5, 4.0]);
        assert!(gy.iter().all(|&v| v == 0.0));
        assert!(gz.iter().all(|&v| v == 0.0));
    }
}
