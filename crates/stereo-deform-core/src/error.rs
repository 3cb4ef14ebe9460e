use thiserror::Error;

use crate::{Pt2, Real};

/// Errors raised while validating grid configuration or tracked input.
///
/// Per-correspondence variants (`PointOutOfBounds`, `NonFinitePoint`,
/// `DegenerateDisparity`) cause that single correspondence to be skipped by the
/// accumulator; they never abort a frame.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TrackError {
    #[error("point ({}, {}) lies outside the {cols}x{rows} image", .point.x, .point.y)]
    PointOutOfBounds { point: Pt2, cols: usize, rows: usize },
    #[error("point ({}, {}) is not finite", .point.x, .point.y)]
    NonFinitePoint { point: Pt2 },
    #[error("previous-frame disparity {disparity} is below the minimum {min}")]
    DegenerateDisparity { disparity: Real, min: Real },
    #[error("invalid bin grid: {0}")]
    InvalidGrid(String),
    #[error("invalid stereo intrinsics: {0}")]
    InvalidIntrinsics(String),
}
