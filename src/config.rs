//! Run configuration for gradient unwarping
//!
//! Holds everything a run needs besides the volume itself: vendor, the
//! coefficient source, polarity, Jacobian handling, interpolation order and
//! optional overrides of the vendor evaluation-grid defaults. A `RunConfig`
//! is built once (usually by the CLI layer) and passed by reference to each
//! stage of the pipeline.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{Result, UnwarpError};
use crate::harmonics::EvaluationGrid;
use crate::interpolation::InterpolationOrder;

// Siemens evaluation grid defaults (meters)
pub const SIEMENS_FOV_MIN: f64 = -0.30;
pub const SIEMENS_FOV_MAX: f64 = 0.30;
pub const SIEMENS_NUMPOINTS: usize = 60;
/// Upper clip for the Siemens Jacobian determinant
pub const SIEMENS_MAX_DET: f64 = 10.0;

// GE evaluation grid defaults (meters)
pub const GE_FOV_MIN: f64 = -0.5;
pub const GE_FOV_MAX: f64 = 0.5;
pub const GE_RESOLUTION: f64 = 0.0075;
/// Upper clip for the GE Jacobian determinant
pub const GE_MAX_DET: f64 = 10.0;

/// Scanner vendor, selecting the harmonic convention and grid defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Siemens,
    Ge,
}

impl Vendor {
    pub fn name(&self) -> &'static str {
        match self {
            Vendor::Siemens => "siemens",
            Vendor::Ge => "ge",
        }
    }

    /// Default lower field-of-view bound of the evaluation grid (meters)
    pub fn default_fov_min(&self) -> f64 {
        match self {
            Vendor::Siemens => SIEMENS_FOV_MIN,
            Vendor::Ge => GE_FOV_MIN,
        }
    }

    /// Default upper field-of-view bound of the evaluation grid (meters)
    pub fn default_fov_max(&self) -> f64 {
        match self {
            Vendor::Siemens => SIEMENS_FOV_MAX,
            Vendor::Ge => GE_FOV_MAX,
        }
    }

    /// Default number of grid points per axis
    pub fn default_numpoints(&self) -> usize {
        match self {
            Vendor::Siemens => SIEMENS_NUMPOINTS,
            Vendor::Ge => ((GE_FOV_MAX - GE_FOV_MIN) / GE_RESOLUTION).round() as usize + 1,
        }
    }

    /// Clip value for the absolute Jacobian determinant
    pub fn max_jacobian_det(&self) -> f64 {
        match self {
            Vendor::Siemens => SIEMENS_MAX_DET,
            Vendor::Ge => GE_MAX_DET,
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Vendor {
    type Err = UnwarpError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "siemens" => Ok(Vendor::Siemens),
            "ge" => Ok(Vendor::Ge),
            other => Err(UnwarpError::configuration(format!(
                "unsupported vendor '{}' (expected 'siemens' or 'ge')",
                other
            ))),
        }
    }
}

/// Direction of the correction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Polarity {
    /// Remove the distortion (default)
    #[default]
    Unwarp,
    /// Re-apply the distortion
    Warp,
}

impl Polarity {
    /// +1 for unwarp, -1 for warp
    pub fn sign(&self) -> f64 {
        match self {
            Polarity::Unwarp => 1.0,
            Polarity::Warp => -1.0,
        }
    }

    pub fn reversed(&self) -> Self {
        match self {
            Polarity::Unwarp => Polarity::Warp,
            Polarity::Warp => Polarity::Unwarp,
        }
    }
}

/// How the full warp field is expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WarpConvention {
    /// Absolute source coordinate of every output voxel (FSL scaled mm)
    #[default]
    Absolute,
    /// Source coordinate minus the voxel's own coordinate (FSL scaled mm)
    Relative,
}

/// Where the spherical-harmonic coefficients come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoefficientSource {
    /// Positional vendor `.grad` file
    GradFile(PathBuf),
    /// Flat `name n m value` table (`.coef`)
    CoefFile(PathBuf),
}

impl CoefficientSource {
    /// Resolve the mutually exclusive grad/coef options of the CLI contract.
    pub fn from_options(grad_file: Option<&Path>, coef_file: Option<&Path>) -> Result<Self> {
        match (grad_file, coef_file) {
            (Some(g), None) => Ok(CoefficientSource::GradFile(g.to_path_buf())),
            (None, Some(c)) => Ok(CoefficientSource::CoefFile(c.to_path_buf())),
            (None, None) => Err(UnwarpError::configuration(
                "no coefficient source given: exactly one of grad-file or coef-file is required",
            )),
            (Some(_), Some(_)) => Err(UnwarpError::configuration(
                "both grad-file and coef-file given: exactly one coefficient source is allowed",
            )),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            CoefficientSource::GradFile(p) | CoefficientSource::CoefFile(p) => p,
        }
    }
}

/// Optional overrides of the vendor evaluation-grid defaults.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct GridParams {
    /// Lower field-of-view bound in meters
    pub fov_min: Option<f64>,
    /// Upper field-of-view bound in meters
    pub fov_max: Option<f64>,
    /// Number of grid points per axis
    pub numpoints: Option<usize>,
}

/// Complete configuration of one unwarping run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub vendor: Vendor,
    pub grad_file: Option<PathBuf>,
    pub coef_file: Option<PathBuf>,
    pub polarity: Polarity,
    pub apply_jacobian: bool,
    pub order: InterpolationOrder,
    pub grid: GridParams,
    pub warp_convention: WarpConvention,
}

impl RunConfig {
    /// Configuration with vendor defaults: unwarp, Jacobian on, linear interpolation.
    pub fn new(vendor: Vendor) -> Self {
        Self {
            vendor,
            grad_file: None,
            coef_file: None,
            polarity: Polarity::Unwarp,
            apply_jacobian: true,
            order: InterpolationOrder::LINEAR,
            grid: GridParams::default(),
            warp_convention: WarpConvention::Absolute,
        }
    }

    pub fn with_grad_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.grad_file = Some(path.into());
        self
    }

    pub fn with_coef_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.coef_file = Some(path.into());
        self
    }

    pub fn with_polarity(mut self, polarity: Polarity) -> Self {
        self.polarity = polarity;
        self
    }

    pub fn with_jacobian(mut self, apply: bool) -> Self {
        self.apply_jacobian = apply;
        self
    }

    pub fn with_order(mut self, order: InterpolationOrder) -> Self {
        self.order = order;
        self
    }

    pub fn with_grid(mut self, grid: GridParams) -> Self {
        self.grid = grid;
        self
    }

    pub fn with_warp_convention(mut self, convention: WarpConvention) -> Self {
        self.warp_convention = convention;
        self
    }

    /// The single coefficient source, or a configuration error.
    pub fn coefficient_source(&self) -> Result<CoefficientSource> {
        let source = CoefficientSource::from_options(
            self.grad_file.as_deref(),
            self.coef_file.as_deref(),
        )?;
        if self.vendor == Vendor::Ge && matches!(source, CoefficientSource::GradFile(_)) {
            return Err(UnwarpError::configuration(
                "vendor 'ge' does not support .grad coefficient files",
            ));
        }
        Ok(source)
    }

    /// Evaluation grid after applying overrides to the vendor defaults.
    pub fn evaluation_grid(&self) -> Result<EvaluationGrid> {
        let fov_min = self.grid.fov_min.unwrap_or_else(|| self.vendor.default_fov_min());
        let fov_max = self.grid.fov_max.unwrap_or_else(|| self.vendor.default_fov_max());
        let numpoints = self.grid.numpoints.unwrap_or_else(|| self.vendor.default_numpoints());
        EvaluationGrid::new(fov_min, fov_max, numpoints)
    }

    /// Check everything that can be checked without touching the filesystem.
    pub fn validate(&self) -> Result<()> {
        self.coefficient_source()?;
        self.evaluation_grid()?;
        Ok(())
    }
}
