//! Residual factor implementations with automatic differentiation support.
//!
//! Factor functions are generic over [`nalgebra::RealField`] so that the same code
//! evaluates plain `f64` residuals and the dual numbers used by tiny-solver for
//! Jacobians.
//!
//! # Available Factors
//!
//! - [`stereo_reprojection`] - stereo reprojection through per-bin pixel offsets,
//!   with the four parameter-sharing wirings described by [`SharingVariant`]
//!
//! [`SharingVariant`]: stereo_reprojection::SharingVariant

pub mod stereo_reprojection;
