//! Spherical-harmonic coefficient sets
//!
//! A coefficient set holds six square matrices, `alpha_{x,y,z}` and
//! `beta_{x,y,z}`, indexed `[n][m]` by harmonic degree and order, plus the
//! reference radius `R0` in meters. Sets are parsed once per run and never
//! mutated afterwards.
//!
//! Two text formats are understood:
//!
//! - flat tables (`.coef`): one `name n m value` entry per line, `#` starts
//!   a comment line, an optional `R0_m value` line embeds the radius
//! - positional vendor files (`.grad`): a free-form header closed by a
//!   `#*] END:` marker, the radius on a fixed line after it, then one
//!   `A(n,m)` / `B(n,m)` entry per line ending in `value axis`

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use tracing::{debug, info};

use crate::config::Vendor;
use crate::error::{Result, UnwarpError};

/// Marker closing the header block of a `.grad` file
const GRAD_HEADER_END: &str = "#*] END:";
/// R0 sits on the third line after the header marker
const GRAD_R0_OFFSET: usize = 3;
/// Coefficient data starts seven lines after the R0 line
const GRAD_DATA_OFFSET: usize = 7;

/// Largest harmonic degree or order accepted from a coefficient file
pub const MAX_DEGREE: usize = 100;

/// Default Siemens reference radii (meters) keyed by coil model file prefix
const SIEMENS_R0_BY_PREFIX: &[(&str, f64)] = &[
    ("quantum", 0.25),
    ("allegra", 0.14),
    ("sonata", 0.25),
    ("avanto", 0.25),
    ("as39st", 0.25),
    ("as39s", 0.25),
    ("as39t", 0.25),
];

/// Gradient axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    X,
    Y,
    Z,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn index(&self) -> usize {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Z => 2,
        }
    }

    pub fn letter(&self) -> char {
        match self {
            Axis::X => 'x',
            Axis::Y => 'y',
            Axis::Z => 'z',
        }
    }

    fn from_letter(c: &str) -> Option<Axis> {
        match c {
            "x" | "X" => Some(Axis::X),
            "y" | "Y" => Some(Axis::Y),
            "z" | "Z" => Some(Axis::Z),
            _ => None,
        }
    }
}

/// Square coefficient matrix, row `n` (degree), column `m` (order).
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientMatrix {
    size: usize,
    data: Vec<f64>,
}

impl CoefficientMatrix {
    pub fn zeros(size: usize) -> Self {
        Self {
            size,
            data: vec![0.0; size * size],
        }
    }

    /// Number of rows (and columns)
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn get(&self, n: usize, m: usize) -> f64 {
        if n < self.size && m < self.size {
            self.data[n * self.size + m]
        } else {
            0.0
        }
    }

    /// Set entry `[n][m]`; indices outside the matrix are rejected.
    pub fn set(&mut self, n: usize, m: usize, value: f64) -> Result<()> {
        if n >= self.size || m >= self.size {
            return Err(UnwarpError::ShapeMismatch {
                expected: vec![self.size, self.size],
                actual: vec![n + 1, m + 1],
            });
        }
        self.data[n * self.size + m] = value;
        Ok(())
    }

    pub fn is_zero(&self) -> bool {
        self.data.iter().all(|&v| v == 0.0)
    }
}

/// Immutable set of six coefficient matrices and the reference radius.
#[derive(Debug, Clone, PartialEq)]
pub struct CoefficientSet {
    alpha: [CoefficientMatrix; 3],
    beta: [CoefficientMatrix; 3],
    r0_m: f64,
}

impl CoefficientSet {
    /// Build from matrices ordered x, y, z.
    ///
    /// All six matrices must share one size and `r0_m` must be positive.
    pub fn from_matrices(
        alpha: [CoefficientMatrix; 3],
        beta: [CoefficientMatrix; 3],
        r0_m: f64,
    ) -> Result<Self> {
        if !(r0_m.is_finite() && r0_m > 0.0) {
            return Err(UnwarpError::parse(format!(
                "reference radius must be positive, got {}",
                r0_m
            )));
        }
        let size = alpha[0].size();
        if size == 0 {
            return Err(UnwarpError::parse("coefficient matrices are empty"));
        }
        for mat in alpha.iter().chain(beta.iter()) {
            if mat.size() != size {
                return Err(UnwarpError::ShapeMismatch {
                    expected: vec![size, size],
                    actual: vec![mat.size(), mat.size()],
                });
            }
        }
        Ok(Self { alpha, beta, r0_m })
    }

    /// All-zero set of the given maximum degree
    pub fn zeros(degree: usize, r0_m: f64) -> Result<Self> {
        let mat = CoefficientMatrix::zeros(degree + 1);
        Self::from_matrices(
            [mat.clone(), mat.clone(), mat.clone()],
            [mat.clone(), mat.clone(), mat],
            r0_m,
        )
    }

    pub fn alpha(&self, axis: Axis) -> &CoefficientMatrix {
        &self.alpha[axis.index()]
    }

    pub fn beta(&self, axis: Axis) -> &CoefficientMatrix {
        &self.beta[axis.index()]
    }

    /// Reference radius in meters
    pub fn r0_m(&self) -> f64 {
        self.r0_m
    }

    /// Reference radius in millimeters
    pub fn r0_mm(&self) -> f64 {
        self.r0_m * 1000.0
    }

    /// Matrix size (maximum degree + 1)
    pub fn size(&self) -> usize {
        self.alpha[0].size()
    }

    /// Maximum harmonic degree N
    pub fn degree(&self) -> usize {
        self.size() - 1
    }

    pub fn is_zero(&self) -> bool {
        self.alpha.iter().chain(self.beta.iter()).all(|m| m.is_zero())
    }
}

/// Table key for matrix `beta` (false) or `alpha` (true) along `axis`
fn table_name(alpha: bool, axis: Axis) -> String {
    format!("{}_{}", if alpha { "Alpha" } else { "Beta" }, axis.letter())
}

fn parse_table_name(name: &str) -> Option<(bool, Axis)> {
    let lower = name.to_ascii_lowercase();
    let (kind, axis) = lower.split_once('_')?;
    let is_alpha = match kind {
        "alpha" => true,
        "beta" => false,
        _ => return None,
    };
    Some((is_alpha, Axis::from_letter(axis)?))
}

/// Accumulates sparse entries and sizes matrices to the largest index seen.
#[derive(Default)]
struct Accumulator {
    entries: Vec<(bool, Axis, usize, usize, f64)>,
    max_index: usize,
}

impl Accumulator {
    fn push(&mut self, is_alpha: bool, axis: Axis, n: usize, m: usize, value: f64) {
        self.max_index = self.max_index.max(n).max(m);
        self.entries.push((is_alpha, axis, n, m, value));
    }

    fn finish(self, r0_m: f64) -> Result<CoefficientSet> {
        if self.entries.is_empty() {
            return Err(UnwarpError::parse("no coefficients found"));
        }
        let size = self.max_index + 1;
        let mut alpha = [
            CoefficientMatrix::zeros(size),
            CoefficientMatrix::zeros(size),
            CoefficientMatrix::zeros(size),
        ];
        let mut beta = alpha.clone();
        for (is_alpha, axis, n, m, value) in self.entries {
            let target = if is_alpha { &mut alpha } else { &mut beta };
            target[axis.index()].set(n, m, value)?;
        }
        CoefficientSet::from_matrices(alpha, beta, r0_m)
    }
}

fn parse_value(token: &str, lineno: usize) -> Result<f64> {
    let v: f64 = token.parse().map_err(|_| {
        UnwarpError::parse(format!("line {}: invalid coefficient value '{}'", lineno, token))
    })?;
    if !v.is_finite() {
        return Err(UnwarpError::parse(format!(
            "line {}: non-finite coefficient value '{}'",
            lineno, token
        )));
    }
    Ok(v)
}

fn parse_index(token: &str, lineno: usize) -> Result<usize> {
    let index: usize = token.trim().parse().map_err(|_| {
        UnwarpError::parse(format!("line {}: invalid harmonic index '{}'", lineno, token))
    })?;
    if index > MAX_DEGREE {
        return Err(UnwarpError::parse(format!(
            "line {}: harmonic index {} exceeds the maximum degree {}",
            lineno, index, MAX_DEGREE
        )));
    }
    Ok(index)
}

/// Parse a flat coefficient table.
///
/// Returns the coefficients and the embedded R0 (meters), if any.
pub fn parse_coef_table(text: &str) -> Result<(CoefficientSetParts, Option<f64>)> {
    let mut acc = Accumulator::default();
    let mut r0_m = None;

    for (idx, raw) in text.lines().enumerate() {
        let lineno = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.trim_end_matches(';').trim_end();
        let tokens: Vec<&str> = line.split_whitespace().collect();

        if tokens.len() == 2 && matches!(tokens[0].to_ascii_lowercase().as_str(), "r0_m" | "r0") {
            let r0 = parse_value(tokens[1], lineno)?;
            r0_m = Some(r0);
            continue;
        }
        if tokens.len() != 4 {
            return Err(UnwarpError::parse(format!(
                "line {}: expected 'name n m value', got '{}'",
                lineno, line
            )));
        }
        let (is_alpha, axis) = parse_table_name(tokens[0]).ok_or_else(|| {
            UnwarpError::parse(format!("line {}: unknown coefficient name '{}'", lineno, tokens[0]))
        })?;
        let n = parse_index(tokens[1], lineno)?;
        let m = parse_index(tokens[2], lineno)?;
        let value = parse_value(tokens[3], lineno)?;
        acc.push(is_alpha, axis, n, m, value);
    }

    Ok((CoefficientSetParts(acc), r0_m))
}

/// Parsed coefficients still waiting for their reference radius.
pub struct CoefficientSetParts(Accumulator);

impl CoefficientSetParts {
    pub fn with_r0(self, r0_m: f64) -> Result<CoefficientSet> {
        self.0.finish(r0_m)
    }
}

/// Parse a positional `.grad` file. The reference radius is embedded.
pub fn parse_grad(text: &str) -> Result<CoefficientSet> {
    let lines: Vec<&str> = text.lines().collect();
    let header_end = lines
        .iter()
        .position(|l| l.starts_with(GRAD_HEADER_END))
        .ok_or_else(|| UnwarpError::parse(format!("missing '{}' header marker", GRAD_HEADER_END)))?;

    let r0_line = header_end + GRAD_R0_OFFSET;
    let r0_text = lines
        .get(r0_line)
        .and_then(|l| l.split_whitespace().next())
        .ok_or_else(|| UnwarpError::parse(format!("line {}: missing reference radius", r0_line + 1)))?;
    let r0_m = parse_value(r0_text, r0_line + 1)?;

    let mut acc = Accumulator::default();
    for (idx, line) in lines.iter().enumerate().skip(r0_line + GRAD_DATA_OFFSET) {
        let lineno = idx + 1;
        let (open, close) = match (line.find('('), line.find(')')) {
            (None, None) => break,
            (Some(o), Some(c)) if o < c => (o, c),
            _ => {
                return Err(UnwarpError::parse(format!(
                    "line {}: unbalanced index parentheses in '{}'",
                    lineno,
                    line.trim()
                )))
            }
        };
        let (n_text, m_text) = line[open + 1..close].split_once(',').ok_or_else(|| {
            UnwarpError::parse(format!("line {}: expected '(n,m)' index pair", lineno))
        })?;
        let n = parse_index(n_text, lineno)?;
        let m = parse_index(m_text, lineno)?;

        let is_alpha = match line[..open].trim_end().chars().last() {
            Some('A') => true,
            Some('B') => false,
            _ => {
                return Err(UnwarpError::parse(format!(
                    "line {}: coefficient tag must be 'A' or 'B'",
                    lineno
                )))
            }
        };

        let tokens: Vec<&str> = line[close + 1..].split_whitespace().collect();
        if tokens.len() < 2 {
            return Err(UnwarpError::parse(format!(
                "line {}: expected 'value axis' after the index pair",
                lineno
            )));
        }
        let axis = Axis::from_letter(tokens[tokens.len() - 1]).ok_or_else(|| {
            UnwarpError::parse(format!(
                "line {}: unknown axis '{}'",
                lineno,
                tokens[tokens.len() - 1]
            ))
        })?;
        let value = parse_value(tokens[tokens.len() - 2], lineno)?;
        acc.push(is_alpha, axis, n, m, value);
    }

    acc.finish(r0_m)
}

/// Default Siemens R0 for a coefficient file, from the coil model prefix.
pub fn siemens_default_r0(path: &Path) -> Option<f64> {
    let name = path.file_name()?.to_str()?.to_ascii_lowercase();
    SIEMENS_R0_BY_PREFIX
        .iter()
        .find(|(prefix, _)| name.starts_with(prefix))
        .map(|&(_, r0)| r0)
}

/// Serialize a coefficient set as a flat table.
///
/// Every matrix entry is written, so parsing the result reproduces the set
/// exactly, including its size.
pub fn to_coef_table(coeffs: &CoefficientSet) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# spherical harmonic coefficients, degree {}", coeffs.degree());
    let _ = writeln!(out, "R0_m {}", coeffs.r0_m());
    for is_alpha in [true, false] {
        for axis in Axis::ALL {
            let mat = if is_alpha { coeffs.alpha(axis) } else { coeffs.beta(axis) };
            let name = table_name(is_alpha, axis);
            for n in 0..mat.size() {
                for m in 0..mat.size() {
                    let _ = writeln!(out, "{} {} {} {}", name, n, m, mat.get(n, m));
                }
            }
        }
    }
    out
}

/// Load the coefficient set for `vendor` from `path`.
///
/// The format follows the extension: `.coef` flat table or `.grad`
/// positional file (Siemens only).
pub fn load_coefficients(vendor: Vendor, path: &Path) -> Result<CoefficientSet> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    info!("Parsing {} for harmonic coefficients", path.display());

    let coeffs = match (vendor, ext.as_str()) {
        (_, "coef") => {
            let text = fs::read_to_string(path)?;
            let (parts, embedded) = parse_coef_table(&text)?;
            let r0_m = match (embedded, vendor) {
                (Some(r0), _) => r0,
                (None, Vendor::Siemens) => siemens_default_r0(path).ok_or_else(|| {
                    UnwarpError::parse(format!(
                        "{}: no embedded R0 and no known coil model prefix in the file name",
                        path.display()
                    ))
                })?,
                (None, Vendor::Ge) => {
                    return Err(UnwarpError::parse(format!(
                        "{}: GE coefficient tables must embed R0_m",
                        path.display()
                    )))
                }
            };
            parts.with_r0(r0_m)?
        }
        (Vendor::Siemens, "grad") => parse_grad(&fs::read_to_string(path)?)?,
        _ => {
            return Err(UnwarpError::parse(format!(
                "unsupported coefficient file '{}' for vendor {}",
                path.display(),
                vendor
            )))
        }
    };

    debug!(
        "Loaded coefficients: degree {}, R0 = {} m",
        coeffs.degree(),
        coeffs.r0_m()
    );
    Ok(coeffs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_grad() -> String {
        let mut s = String::new();
        s.push_str("#*] Siemens gradient coil file\n");
        s.push_str("#*] some header text\n");
        s.push_str("#*] END:\n");
        s.push_str("\n");
        s.push_str(" Gradient coefficients\n");
        s.push_str(" 0.25 m = R0\n");
        for _ in 0..6 {
            s.push_str(" filler\n");
        }
        s.push_str("  1 A( 1, 0)      1.00000000      z\n");
        s.push_str("  2 A( 3, 0)     -0.05882352      z\n");
        s.push_str("  3 A( 1, 1)      0.99766427      x\n");
        s.push_str("  4 B( 1, 1)      1.00312930      y\n");
        s.push_str("  5 B( 5, 3)     -0.00125000      y\n");
        s.push_str("\n");
        s.push_str(" trailing text without an index\n");
        s
    }

    #[test]
    fn test_parse_grad() {
        let coeffs = parse_grad(&sample_grad()).unwrap();
        assert_eq!(coeffs.r0_m(), 0.25);
        assert_eq!(coeffs.size(), 6);
        assert_eq!(coeffs.alpha(Axis::Z).get(1, 0), 1.0);
        assert_eq!(coeffs.alpha(Axis::Z).get(3, 0), -0.05882352);
        assert_eq!(coeffs.alpha(Axis::X).get(1, 1), 0.99766427);
        assert_eq!(coeffs.beta(Axis::Y).get(1, 1), 1.00312930);
        assert_eq!(coeffs.beta(Axis::Y).get(5, 3), -0.00125);
        assert!(coeffs.alpha(Axis::Y).is_zero());
    }

    #[test]
    fn test_parse_grad_missing_marker() {
        let err = parse_grad("no header here\n").unwrap_err();
        assert!(matches!(err, UnwarpError::ParseError(_)));
    }

    #[test]
    fn test_parse_grad_bad_axis() {
        let text = sample_grad().replace("0.99766427      x", "0.99766427      w");
        assert!(matches!(parse_grad(&text), Err(UnwarpError::ParseError(_))));
    }

    #[test]
    fn test_parse_coef_table() {
        let text = "\
# comment line
Alpha_z 1 0 1.0;
alpha_x 1 1 0.5
Beta_y 2 1 -0.25
";
        let (parts, r0) = parse_coef_table(text).unwrap();
        assert!(r0.is_none());
        let coeffs = parts.with_r0(0.25).unwrap();
        assert_eq!(coeffs.size(), 3);
        assert_eq!(coeffs.alpha(Axis::Z).get(1, 0), 1.0);
        assert_eq!(coeffs.alpha(Axis::X).get(1, 1), 0.5);
        assert_eq!(coeffs.beta(Axis::Y).get(2, 1), -0.25);
    }

    #[test]
    fn test_parse_coef_table_rejects_malformed() {
        for text in ["Gamma_x 1 1 0.5", "Alpha_x 1 0.5", "Alpha_x a 1 0.5", "Alpha_x 1 1 nan"] {
            assert!(
                matches!(parse_coef_table(text), Err(UnwarpError::ParseError(_))),
                "accepted '{}'",
                text
            );
        }
    }

    #[test]
    fn test_coef_table_round_trip_is_exact() {
        let (parts, _) = parse_coef_table(
            "Alpha_x 3 1 0.1\nAlpha_z 1 0 1\nBeta_y 2 2 -3.3333333333333335e-7\nBeta_x 3 3 -0.0\n",
        )
        .unwrap();
        let original = parts.with_r0(0.2345).unwrap();

        let text = to_coef_table(&original);
        let (parts, r0) = parse_coef_table(&text).unwrap();
        assert_eq!(r0, Some(0.2345));
        let parsed = parts.with_r0(r0.unwrap()).unwrap();

        assert_eq!(parsed.r0_m().to_bits(), original.r0_m().to_bits());
        assert_eq!(parsed.size(), original.size());
        for axis in Axis::ALL {
            for n in 0..original.size() {
                for m in 0..original.size() {
                    assert_eq!(
                        parsed.alpha(axis).get(n, m).to_bits(),
                        original.alpha(axis).get(n, m).to_bits()
                    );
                    assert_eq!(
                        parsed.beta(axis).get(n, m).to_bits(),
                        original.beta(axis).get(n, m).to_bits()
                    );
                }
            }
        }
    }

    #[test]
    fn test_index_above_max_degree_is_parse_error() {
        let text = format!("Alpha_x {} 0 1.0\n", MAX_DEGREE + 1);
        assert!(matches!(parse_coef_table(&text), Err(UnwarpError::ParseError(_))));
        assert!(matches!(
            parse_coef_table("Alpha_x 100000 0 1.0\nBeta_y 1 1 0.5\n"),
            Err(UnwarpError::ParseError(_))
        ));

        let grad = sample_grad().replace("A( 1, 0)", "A( 1, 100000)");
        assert!(matches!(parse_grad(&grad), Err(UnwarpError::ParseError(_))));

        let text = format!("Alpha_x {} 0 1.0\n", MAX_DEGREE);
        let (parts, _) = parse_coef_table(&text).unwrap();
        assert_eq!(parts.with_r0(0.25).unwrap().size(), MAX_DEGREE + 1);
    }

    #[test]
    fn test_matrix_set_rejects_out_of_range() {
        let mut mat = CoefficientMatrix::zeros(3);
        mat.set(2, 1, 0.5).unwrap();
        assert_eq!(mat.get(2, 1), 0.5);
        assert!(matches!(mat.set(0, 3, 1.0), Err(UnwarpError::ShapeMismatch { .. })));
        assert!(matches!(mat.set(3, 0, 1.0), Err(UnwarpError::ShapeMismatch { .. })));
        // A rejected write must not land in a neighbouring row
        assert_eq!(mat.get(1, 0), 0.0);
        assert!(mat.data.iter().filter(|&&v| v != 0.0).count() == 1);
    }

    #[test]
    fn test_siemens_default_r0() {
        assert_eq!(siemens_default_r0(Path::new("/data/coils/allegra.coef")), Some(0.14));
        assert_eq!(siemens_default_r0(Path::new("AS39ST_coeffs.coef")), Some(0.25));
        assert_eq!(siemens_default_r0(Path::new("prisma.coef")), None);
    }

    #[test]
    fn test_from_matrices_validation() {
        let a = CoefficientMatrix::zeros(3);
        let b = CoefficientMatrix::zeros(4);
        let err = CoefficientSet::from_matrices(
            [a.clone(), a.clone(), a.clone()],
            [a.clone(), a.clone(), b],
            0.25,
        )
        .unwrap_err();
        assert!(matches!(err, UnwarpError::ShapeMismatch { .. }));
        assert!(CoefficientSet::zeros(3, 0.0).is_err());
        assert!(CoefficientSet::zeros(3, 0.25).unwrap().is_zero());
    }
}
