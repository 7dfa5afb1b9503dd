//! Associated Legendre functions
//!
//! `P_n^m(x)` with the Condon-Shortley phase, computed by the stable
//! upward recursion in degree:
//!
//! ```text
//! P_m^m     = (-1)^m (2m-1)!! (1-x^2)^(m/2)
//! P_{m+1}^m = x (2m+1) P_m^m
//! P_n^m     = (x (2n-1) P_{n-1}^m - (n+m-1) P_{n-2}^m) / (n-m)
//! ```

/// Double factorial of an odd number, `(2m-1)!!`, as f64
fn odd_double_factorial(m: usize) -> f64 {
    let mut acc = 1.0;
    let mut k = 1usize;
    while k < 2 * m {
        acc *= k as f64;
        k += 2;
    }
    acc
}

/// Starting value `P_m^m(x)`
#[inline]
fn sectoral(m: usize, x: f64) -> f64 {
    if m == 0 {
        return 1.0;
    }
    let sign = if m % 2 == 1 { -1.0 } else { 1.0 };
    let s = (1.0 - x * x).max(0.0).sqrt();
    sign * odd_double_factorial(m) * s.powi(m as i32)
}

/// Associated Legendre function `P_n^m(x)` for `x` in [-1, 1].
///
/// Returns 0 when `m > n`.
pub fn legendre(n: usize, m: usize, x: f64) -> f64 {
    if m > n {
        return 0.0;
    }
    let mut p_prev = sectoral(m, x);
    if n == m {
        return p_prev;
    }
    let mut p = x * (2 * m + 1) as f64 * p_prev;
    for l in (m + 2)..=n {
        let next = (x * (2 * l - 1) as f64 * p - (l + m - 1) as f64 * p_prev) / (l - m) as f64;
        p_prev = p;
        p = next;
    }
    p
}

/// Fill `table[n * (nmax + 1) + m]` with `P_n^m(x)` for all `0 <= m <= n <= nmax`.
///
/// Entries with `m > n` are set to 0. One recursion per order, so the cost is
/// O(nmax^2) for the whole table instead of O(nmax^3) for repeated calls to
/// [`legendre`].
pub fn legendre_table(nmax: usize, x: f64, table: &mut [f64]) {
    let stride = nmax + 1;
    debug_assert!(table.len() >= stride * stride);
    table[..stride * stride].iter_mut().for_each(|v| *v = 0.0);

    let s = (1.0 - x * x).max(0.0).sqrt();
    let mut pmm = 1.0;
    for m in 0..=nmax {
        if m > 0 {
            // P_m^m = -(2m-1) s P_{m-1}^{m-1}
            pmm *= -((2 * m - 1) as f64) * s;
        }
        table[m * stride + m] = pmm;
        if m == nmax {
            break;
        }
        let mut p_prev = pmm;
        let mut p = x * (2 * m + 1) as f64 * pmm;
        table[(m + 1) * stride + m] = p;
        for l in (m + 2)..=nmax {
            let next = (x * (2 * l - 1) as f64 * p - (l + m - 1) as f64 * p_prev) / (l - m) as f64;
            p_prev = p;
            p = next;
            table[l * stride + m] = p;
        }
    }
}

/// Siemens normalization factor
///
/// `(-1)^m sqrt((2n+1) (n-m)! / (2 (n+m)!))` for `m > 0`, and 1 for `m = 0`.
pub fn siemens_normalization(n: usize, m: usize) -> f64 {
    if m == 0 || m > n {
        return 1.0;
    }
    // (n-m)!/(n+m)! = 1 / prod_{k=n-m+1}^{n+m} k
    let mut ratio = 1.0;
    for k in (n - m + 1)..=(n + m) {
        ratio /= k as f64;
    }
    let sign = if m % 2 == 1 { -1.0 } else { 1.0 };
    sign * ((2 * n + 1) as f64 * ratio / 2.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    const XS: [f64; 7] = [-1.0, -0.7, -0.2, 0.0, 0.3, 0.85, 1.0];

    #[test]
    fn test_low_degree_identities() {
        for &x in &XS {
            assert_eq!(legendre(0, 0, x), 1.0);
            assert!((legendre(1, 0, x) - x).abs() < 1e-15);
            assert!((legendre(1, 1, x) + (1.0 - x * x).sqrt()).abs() < 1e-15);
        }
    }

    #[test]
    fn test_closed_forms() {
        for &x in &XS {
            let s2 = 1.0 - x * x;
            let s = s2.sqrt();
            assert!((legendre(2, 0, x) - 0.5 * (3.0 * x * x - 1.0)).abs() < 1e-12);
            assert!((legendre(2, 1, x) + 3.0 * x * s).abs() < 1e-12);
            assert!((legendre(2, 2, x) - 3.0 * s2).abs() < 1e-12);
            assert!((legendre(3, 0, x) - 0.5 * (5.0 * x * x * x - 3.0 * x)).abs() < 1e-12);
            assert!((legendre(3, 3, x) + 15.0 * s2 * s).abs() < 1e-12);
            // P_4^2 = 7.5 (7x^2 - 1)(1 - x^2)
            assert!((legendre(4, 2, x) - 7.5 * (7.0 * x * x - 1.0) * s2).abs() < 1e-11);
        }
    }

    #[test]
    fn test_order_above_degree_is_zero() {
        assert_eq!(legendre(2, 3, 0.4), 0.0);
    }

    #[test]
    fn test_table_matches_single_evaluation() {
        let nmax = 12;
        let mut table = vec![f64::NAN; (nmax + 1) * (nmax + 1)];
        for &x in &XS {
            legendre_table(nmax, x, &mut table);
            for m in 0..=nmax {
                let scale = (0..=nmax)
                    .map(|n| legendre(n, m, x).abs())
                    .fold(1.0, f64::max);
                for n in 0..=nmax {
                    let want = legendre(n, m, x);
                    let got = table[n * (nmax + 1) + m];
                    let tol = 1e-12 * scale;
                    assert!((got - want).abs() <= tol, "n={} m={} x={}", n, m, x);
                }
            }
        }
    }

    #[test]
    fn test_siemens_normalization() {
        assert_eq!(siemens_normalization(3, 0), 1.0);
        // n=1, m=1: -sqrt(3 * 0! / (2 * 2!)) = -sqrt(3/4)
        assert!((siemens_normalization(1, 1) + 0.75f64.sqrt()).abs() < 1e-15);
        // n=2, m=2: sqrt(5 * 0! / (2 * 4!)) = sqrt(5/48)
        assert!((siemens_normalization(2, 2) - (5.0f64 / 48.0).sqrt()).abs() < 1e-15);
    }

    #[test]
    fn test_normalized_values_stay_bounded_at_high_degree() {
        // Normalized functions are O(1); the naive factorial form overflows here.
        let n = 20;
        for m in 0..=n {
            let v = siemens_normalization(n, m) * legendre(n, m, 0.3);
            assert!(v.is_finite());
            assert!(v.abs() < 10.0, "m={} value={}", m, v);
        }
    }
}
