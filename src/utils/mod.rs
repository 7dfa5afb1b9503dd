//! Array utilities shared by the field and resampling stages

pub mod gradient;
pub mod simd_ops;

pub use gradient::{central_grad, central_grad_inplace};
pub use simd_ops::{axpy_into_f64, multiply_f64, scrub_non_finite_f64, subtract_into_f64};
