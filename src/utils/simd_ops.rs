//! SIMD-accelerated element-wise operations for the resampling loop
//!
//! When the `simd` feature is enabled these use 256-bit lanes (f64x4).
//! All operations have scalar fallbacks when SIMD is disabled.

#[cfg(feature = "simd")]
use wide::f64x4;

/// SIMD lane width (4 for f64x4)
#[cfg(feature = "simd")]
pub const SIMD_WIDTH: usize = 4;

#[cfg(not(feature = "simd"))]
pub const SIMD_WIDTH: usize = 1;

#[cfg(feature = "simd")]
#[inline]
fn load(s: &[f64]) -> f64x4 {
    f64x4::from([s[0], s[1], s[2], s[3]])
}

// ============================================================================
// Fused Multiply-Add Operations
// ============================================================================

/// Compute out[i] = a[i] + alpha * b[i]
#[cfg(feature = "simd")]
#[inline]
pub fn axpy_into_f64(out: &mut [f64], a: &[f64], alpha: f64, b: &[f64]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());
    let n = a.len();
    let chunks = n / SIMD_WIDTH;
    let valpha = f64x4::splat(alpha);

    for i in 0..chunks {
        let idx = i * SIMD_WIDTH;
        let result = load(&a[idx..]) + valpha * load(&b[idx..]);
        out[idx..idx + SIMD_WIDTH].copy_from_slice(result.as_array_ref());
    }

    for i in chunks * SIMD_WIDTH..n {
        out[i] = a[i] + alpha * b[i];
    }
}

#[cfg(not(feature = "simd"))]
#[inline]
pub fn axpy_into_f64(out: &mut [f64], a: &[f64], alpha: f64, b: &[f64]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());
    for i in 0..out.len() {
        out[i] = a[i] + alpha * b[i];
    }
}

// ============================================================================
// Element-wise Operations
// ============================================================================

/// Compute a[i] = a[i] * b[i]
#[cfg(feature = "simd")]
#[inline]
pub fn multiply_f64(a: &mut [f64], b: &[f64]) {
    debug_assert_eq!(a.len(), b.len());
    let n = a.len();
    let chunks = n / SIMD_WIDTH;

    for i in 0..chunks {
        let idx = i * SIMD_WIDTH;
        let result = load(&a[idx..]) * load(&b[idx..]);
        a[idx..idx + SIMD_WIDTH].copy_from_slice(result.as_array_ref());
    }

    for i in chunks * SIMD_WIDTH..n {
        a[i] *= b[i];
    }
}

#[cfg(not(feature = "simd"))]
#[inline]
pub fn multiply_f64(a: &mut [f64], b: &[f64]) {
    debug_assert_eq!(a.len(), b.len());
    for i in 0..a.len() {
        a[i] *= b[i];
    }
}

/// Compute out[i] = a[i] - b[i]
#[cfg(feature = "simd")]
#[inline]
pub fn subtract_into_f64(out: &mut [f64], a: &[f64], b: &[f64]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());
    let n = a.len();
    let chunks = n / SIMD_WIDTH;

    for i in 0..chunks {
        let idx = i * SIMD_WIDTH;
        let result = load(&a[idx..]) - load(&b[idx..]);
        out[idx..idx + SIMD_WIDTH].copy_from_slice(result.as_array_ref());
    }

    for i in chunks * SIMD_WIDTH..n {
        out[i] = a[i] - b[i];
    }
}

#[cfg(not(feature = "simd"))]
#[inline]
pub fn subtract_into_f64(out: &mut [f64], a: &[f64], b: &[f64]) {
    debug_assert_eq!(a.len(), b.len());
    debug_assert_eq!(a.len(), out.len());
    for i in 0..out.len() {
        out[i] = a[i] - b[i];
    }
}

/// Replace NaN and infinite values with 0, returning how many were replaced
#[inline]
pub fn scrub_non_finite_f64(a: &mut [f64]) -> usize {
    let mut count = 0;
    for v in a.iter_mut() {
        if !v.is_finite() {
            *v = 0.0;
            count += 1;
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axpy_into() {
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let b = vec![2.0, 3.0, 4.0, 5.0, 6.0];
        let mut out = vec![0.0; 5];
        axpy_into_f64(&mut out, &a, -0.5, &b);

        for i in 0..5 {
            assert!((out[i] - (a[i] - 0.5 * b[i])).abs() < 1e-15);
        }
    }

    #[test]
    fn test_multiply() {
        let mut a = vec![1.0, -2.0, 3.0, -4.0, 5.0, 6.0];
        let b = vec![2.0, 2.0, 0.5, 0.0, 1.0, -1.0];
        multiply_f64(&mut a, &b);
        assert_eq!(a, vec![2.0, -4.0, 1.5, 0.0, 5.0, -6.0]);
    }

    #[test]
    fn test_subtract_into() {
        let a = vec![5.0, 4.0, 3.0, 2.0, 1.0];
        let b = vec![1.0, 1.0, 1.0, 1.0, 1.0];
        let mut out = vec![0.0; 5];
        subtract_into_f64(&mut out, &a, &b);
        assert_eq!(out, vec![4.0, 3.0, 2.0, 1.0, 0.0]);
    }

    #[test]
    fn test_scrub_non_finite() {
        let mut a = vec![1.0, f64::NAN, f64::INFINITY, -2.0, f64::NEG_INFINITY];
        let replaced = scrub_non_finite_f64(&mut a);
        assert_eq!(replaced, 3);
        assert_eq!(a, vec![1.0, 0.0, 0.0, -2.0, 0.0]);
    }
}
