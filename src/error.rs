//! Error types for gradient unwarping.
//!
//! Fatal conditions are reported through [`UnwarpError`]. Local numeric
//! anomalies (NaN/Inf from interpolation, out-of-range Jacobian values)
//! are not errors: they are repaired in place and only counted.

use thiserror::Error;

/// Main error type for unwarping operations.
#[derive(Error, Debug)]
pub enum UnwarpError {
    /// Malformed or unsupported coefficient file.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// Invalid run configuration (grid, vendor/file pairing, coefficient sources).
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// A required differential or transform is degenerate.
    #[error("Numeric failure: {0}")]
    NumericFailure(String),

    /// Volume container could not be read or written.
    #[error("Volume I/O error: {0}")]
    VolumeIoError(String),

    /// Shape mismatch between arrays that must agree.
    #[error("Shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Result type for unwarping operations.
pub type Result<T> = std::result::Result<T, UnwarpError>;

impl UnwarpError {
    /// Create a parse error.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create a configuration error.
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::ConfigurationError(msg.into())
    }

    /// Create a numeric failure.
    pub fn numeric(msg: impl Into<String>) -> Self {
        Self::NumericFailure(msg.into())
    }

    /// Create a volume I/O error.
    pub fn volume_io(msg: impl Into<String>) -> Self {
        Self::VolumeIoError(msg.into())
    }
}
