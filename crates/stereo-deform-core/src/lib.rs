//! Core geometry and data primitives for stereo deformation-field calibration.
//!
//! This crate contains:
//! - linear algebra type aliases (`Real`, `Pt2`, `Vec3`, ...),
//! - the rectified stereo camera model ([`StereoIntrinsics`]) and known frame motion
//!   ([`RelativePose`]),
//! - the uniform image-plane bin grid ([`BinGrid`]),
//! - per-bin accumulation of tracked stereo correspondences ([`TrackAccumulator`]),
//! - the solved per-bin pixel correction ([`DeformationField`]).
//!
//! Data flow:
//! `tracker output -> TrackAccumulator -> optimizer -> DeformationField`

/// Stereo intrinsics.
pub mod camera;
/// Typed errors for input validation.
pub mod error;
/// Solved per-bin correction field and its persistence.
pub mod field;
/// Image-plane bin grid.
pub mod grid;
/// Linear algebra type aliases and helpers.
pub mod math;
/// Known relative motion between consecutive frames.
pub mod pose;
/// Tracked correspondences and per-bin accumulation.
pub mod tracks;

pub use camera::*;
pub use error::*;
pub use field::*;
pub use grid::*;
pub use math::*;
pub use pose::*;
pub use tracks::*;
