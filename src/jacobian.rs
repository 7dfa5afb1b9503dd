//! Jacobian determinant of the displacement mapping
//!
//! The mapping `p -> p + d(p)` has Jacobian `I + grad(d)`. Its determinant is
//! the local volume change used to renormalize resampled intensities. Values
//! are taken in absolute value and clipped to `[0, max_det]`, which keeps the
//! noisy outskirts of the field of view from producing huge multipliers.

use rayon::prelude::*;
use tracing::debug;

use crate::error::{Result, UnwarpError};
use crate::harmonics::DisplacementField;
use crate::utils::gradient::central_grad;

/// Determinant multiplier on the evaluation grid, x-fastest.
#[derive(Debug, Clone, PartialEq)]
pub struct JacobianField {
    data: Vec<f64>,
    dims: (usize, usize, usize),
    /// Values replaced because they were NaN or infinite
    pub non_finite: usize,
    /// Values clipped to the upper bound
    pub clipped: usize,
}

impl JacobianField {
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    pub fn dims(&self) -> (usize, usize, usize) {
        self.dims
    }

    /// Multiplier for warp polarity: `1/det`.
    ///
    /// Zero determinants invert to infinity and are replaced by 0 like any
    /// other non-finite value.
    pub fn inverted(&self) -> Self {
        let mut non_finite = 0;
        let data = self
            .data
            .iter()
            .map(|&v| {
                let inv = 1.0 / v;
                if inv.is_finite() {
                    inv
                } else {
                    non_finite += 1;
                    0.0
                }
            })
            .collect();
        Self {
            data,
            dims: self.dims,
            non_finite: self.non_finite + non_finite,
            clipped: self.clipped,
        }
    }
}

/// Determinant of `I + J` for the nine partials of the displacement.
///
/// `j` is row-major: `[dFx/dx, dFx/dy, dFx/dz, dFy/dx, .., dFz/dz]`.
#[inline]
pub fn determinant(j: [f64; 9]) -> f64 {
    let [a, b, c, d, e, f, g, h, i] = j;
    (1.0 + a) * (1.0 + e) * (1.0 + i)
        - (1.0 + a) * f * h
        - b * d * (1.0 + i)
        + b * f * g
        + c * d * h
        - c * (1.0 + e) * g
}

fn check_spacing(spacing: [f64; 3]) -> Result<()> {
    if spacing.iter().any(|&h| h == 0.0) {
        return Err(UnwarpError::configuration(format!(
            "zero spacing in Jacobian computation: {:?}",
            spacing
        )));
    }
    if spacing.iter().any(|h| !h.is_finite()) {
        return Err(UnwarpError::numeric(format!(
            "non-finite spacing in Jacobian computation: {:?}",
            spacing
        )));
    }
    Ok(())
}

/// Unclipped determinant of `I + grad(d)` at every grid point.
///
/// # Arguments
/// * `field` - Displacement field (mm)
/// * `spacing` - Grid spacing along x, y, z (mm)
pub fn raw_determinant(field: &DisplacementField, spacing: [f64; 3]) -> Result<Vec<f64>> {
    check_spacing(spacing)?;
    let (nx, ny, nz) = field.dims();
    let [hx, hy, hz] = spacing;

    let (fxx, fxy, fxz) = central_grad(&field.dx, nx, ny, nz, hx, hy, hz);
    let (fyx, fyy, fyz) = central_grad(&field.dy, nx, ny, nz, hx, hy, hz);
    let (fzx, fzy, fzz) = central_grad(&field.dz, nx, ny, nz, hx, hy, hz);

    Ok((0..nx * ny * nz)
        .into_par_iter()
        .map(|idx| {
            determinant([
                fxx[idx], fxy[idx], fxz[idx],
                fyx[idx], fyy[idx], fyz[idx],
                fzx[idx], fzy[idx], fzz[idx],
            ])
        })
        .collect())
}

/// Clipped absolute Jacobian determinant of a displacement field.
///
/// NaN determinants become 0; everything else is `min(|det|, max_det)`.
///
/// # Errors
/// `ConfigurationError` if any spacing is zero, `NumericFailure` if any
/// spacing is not finite.
pub fn compute(field: &DisplacementField, spacing: [f64; 3], max_det: f64) -> Result<JacobianField> {
    let mut data = raw_determinant(field, spacing)?;
    let mut non_finite = 0;
    let mut clipped = 0;
    for v in data.iter_mut() {
        let a = v.abs();
        if a.is_nan() {
            non_finite += 1;
            *v = 0.0;
        } else if a > max_det {
            clipped += 1;
            *v = max_det;
        } else {
            *v = a;
        }
    }
    debug!(
        "Jacobian determinant: {} values clipped to {}, {} non-finite replaced",
        clipped, max_det, non_finite
    );
    Ok(JacobianField {
        data,
        dims: field.dims(),
        non_finite,
        clipped,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field_from_fn<F: Fn(f64, f64, f64) -> [f64; 3]>(n: usize, h: f64, f: F) -> DisplacementField {
        let mut field = DisplacementField::zeros((n, n, n));
        for k in 0..n {
            for j in 0..n {
                for i in 0..n {
                    let d = f(i as f64 * h, j as f64 * h, k as f64 * h);
                    let idx = i + j * n + k * n * n;
                    field.dx[idx] = d[0];
                    field.dy[idx] = d[1];
                    field.dz[idx] = d[2];
                }
            }
        }
        field
    }

    #[test]
    fn test_zero_field_gives_unit_determinant() {
        let field = DisplacementField::zeros((6, 5, 4));
        let raw = raw_determinant(&field, [2.0, 2.0, 2.0]).unwrap();
        assert!(raw.iter().all(|&v| v == 1.0));
        let jac = compute(&field, [2.0, 2.0, 2.0], 10.0).unwrap();
        assert!(jac.data().iter().all(|&v| v == 1.0));
        assert_eq!(jac.clipped, 0);
    }

    #[test]
    fn test_uniform_scaling() {
        // d = 0.1 p: det = 1.1^3
        let field = field_from_fn(5, 3.0, |x, y, z| [0.1 * x, 0.1 * y, 0.1 * z]);
        let jac = compute(&field, [3.0; 3], 10.0).unwrap();
        for &v in jac.data() {
            assert!((v - 1.331).abs() < 1e-12);
        }
    }

    #[test]
    fn test_shear_preserves_volume() {
        let field = field_from_fn(5, 1.0, |_, y, _| [0.5 * y, 0.0, 0.0]);
        let jac = compute(&field, [1.0; 3], 10.0).unwrap();
        assert!(jac.data().iter().all(|&v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn test_clipping_and_absolute_value() {
        // d = -3 p: det = (-2)^3 = -8, |det| = 8, clipped to 5
        let field = field_from_fn(4, 1.0, |x, y, z| [-3.0 * x, -3.0 * y, -3.0 * z]);
        let jac = compute(&field, [1.0; 3], 5.0).unwrap();
        assert!(jac.data().iter().all(|&v| v == 5.0));
        assert_eq!(jac.clipped, 64);

        let jac = compute(&field, [1.0; 3], 10.0).unwrap();
        assert!(jac.data().iter().all(|&v| (v - 8.0).abs() < 1e-12));
    }

    #[test]
    fn test_nan_determinant_becomes_zero() {
        let mut field = DisplacementField::zeros((3, 3, 3));
        field.dx[13] = f64::NAN;
        let jac = compute(&field, [1.0; 3], 10.0).unwrap();
        assert!(jac.non_finite > 0);
        assert!(jac.data().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_spacing_errors() {
        let field = DisplacementField::zeros((3, 3, 3));
        assert!(matches!(
            compute(&field, [1.0, 0.0, 1.0], 10.0),
            Err(UnwarpError::ConfigurationError(_))
        ));
        assert!(matches!(
            compute(&field, [1.0, f64::NAN, 1.0], 10.0),
            Err(UnwarpError::NumericFailure(_))
        ));
    }

    #[test]
    fn test_inverted() {
        let field = field_from_fn(3, 1.0, |x, y, z| [x, y, z]);
        let jac = compute(&field, [1.0; 3], 10.0).unwrap();
        let inv = jac.inverted();
        assert!(inv.data().iter().all(|&v| (v - 0.125).abs() < 1e-12));

        let zero = JacobianField {
            data: vec![1.0, 0.0],
            dims: (2, 1, 1),
            non_finite: 0,
            clipped: 0,
        };
        let inv = zero.inverted();
        assert_eq!(inv.data(), &[1.0, 0.0]);
        assert_eq!(inv.non_finite, 1);
    }
}
