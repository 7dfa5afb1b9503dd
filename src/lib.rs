//! Gradunwarp-Core: gradient nonlinearity correction for MR volumes
//!
//! This crate removes (or re-applies) the geometric distortion caused by
//! gradient coil nonlinearity, using the vendor's spherical-harmonic
//! description of the gradient fields.
//!
//! # Modules
//! - `coeffs`: Siemens `.grad` and flat `.coef` coefficient parsing
//! - `harmonics`: Legendre functions, evaluation grid, displacement field
//! - `jacobian`: Volume-change determinant of the displacement field
//! - `interpolation`: B-spline volume sampling (orders 1-4)
//! - `resample`: Per-slice coordinate pipeline and full warp
//! - `unwarp`: Run orchestration and file-level jobs
//! - `affine`: 4x4 voxel/scanner transforms
//! - `nifti_io`, `mgh_io`, `volume`: Volume I/O
//! - `utils`: Gradient operators and SIMD helpers

// Core modules
pub mod affine;
pub mod config;
pub mod error;

// Algorithm modules
pub mod coeffs;
pub mod harmonics;
pub mod interpolation;
pub mod jacobian;
pub mod resample;
pub mod unwarp;
pub mod utils;

// I/O modules
pub mod mgh_io;
pub mod nifti_io;
pub mod volume;

pub use affine::Affine;
pub use coeffs::{load_coefficients, Axis, CoefficientMatrix, CoefficientSet};
pub use config::{Polarity, RunConfig, Vendor, WarpConvention};
pub use error::{Result, UnwarpError};
pub use harmonics::{DisplacementField, EvaluationGrid};
pub use interpolation::{InterpolationOrder, SplineVolume};
pub use jacobian::JacobianField;
pub use resample::AnomalyCounts;
pub use unwarp::{OutputVolume, RunStage, UnwarpJob, UnwarpRunner};
pub use volume::{load_volume, save_volume, VoxelVolume};
