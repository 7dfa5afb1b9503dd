//! Spherical-harmonic gradient field model
//!
//! This module provides:
//! - Associated Legendre functions and the Siemens normalization
//! - The cubic evaluation grid
//! - Evaluation of the vendor harmonic series into a displacement field

pub mod field;
pub mod grid;
pub mod legendre;

pub use field::{evaluate, evaluate_with_progress, DisplacementField, HarmonicBasis};
pub use grid::EvaluationGrid;
pub use legendre::{legendre, legendre_table, siemens_normalization};
