//! Solved per-bin pixel correction for both cameras.

use std::fs;
use std::path::Path;

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{BinGrid, GridConfig, Pt2, Real, Side, TrackError};

/// Pixel coordinate axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    X,
    Y,
}

impl Axis {
    pub fn as_str(self) -> &'static str {
        match self {
            Axis::X => "dx",
            Axis::Y => "dy",
        }
    }
}

/// Correction added to a raw pixel coordinate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PixelOffset {
    pub dx: Real,
    pub dy: Real,
}

impl PixelOffset {
    pub fn new(dx: Real, dy: Real) -> Self {
        Self { dx, dy }
    }

    pub fn get(&self, axis: Axis) -> Real {
        match axis {
            Axis::X => self.dx,
            Axis::Y => self.dy,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.dx.is_finite() && self.dy.is_finite()
    }
}

#[derive(Debug, Error)]
pub enum FieldIoError {
    #[error("failed to access deformation field file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode or decode deformation field: {0}")]
    Json(#[from] serde_json::Error),
    #[error("inconsistent deformation field: {0}")]
    Inconsistent(String),
}

/// Per-bin `(dx, dy)` for the left and right cameras.
///
/// Offsets are stored row-major by bin id (`row * bin_cols + col`). The counts
/// record how many residual terms touched each bin during the solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeformationField {
    pub grid: GridConfig,
    pub left: Vec<PixelOffset>,
    pub right: Vec<PixelOffset>,
    #[serde(default)]
    pub left_counts: Vec<u64>,
    #[serde(default)]
    pub right_counts: Vec<u64>,
}

impl DeformationField {
    /// Field with every offset at zero.
    pub fn zeros(grid: GridConfig) -> Self {
        let n = grid.bin_rows * grid.bin_cols;
        Self {
            grid,
            left: vec![PixelOffset::default(); n],
            right: vec![PixelOffset::default(); n],
            left_counts: vec![0; n],
            right_counts: vec![0; n],
        }
    }

    pub fn num_bins(&self) -> usize {
        self.grid.bin_rows * self.grid.bin_cols
    }

    pub fn offsets(&self, side: Side) -> &[PixelOffset] {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn counts(&self, side: Side) -> &[u64] {
        match side {
            Side::Left => &self.left_counts,
            Side::Right => &self.right_counts,
        }
    }

    pub fn offset(&self, side: Side, bin: usize) -> Option<PixelOffset> {
        self.offsets(side).get(bin).copied()
    }

    /// Apply the correction of the bin containing `point`.
    pub fn correct(&self, side: Side, point: &Pt2) -> Result<Pt2, TrackError> {
        let grid = BinGrid::new(self.grid)?;
        let bin = grid.bin_of(point)?;
        let off = self.offset(side, bin).ok_or_else(|| {
            TrackError::InvalidGrid(format!(
                "field has {} {} offsets, bin {} requested",
                self.offsets(side).len(),
                side.as_str(),
                bin
            ))
        })?;
        Ok(Pt2::new(point.x + off.dx, point.y + off.dy))
    }

    /// One axis of one side as a `bin_rows x bin_cols` matrix.
    pub fn to_matrix(&self, side: Side, axis: Axis) -> Result<DMatrix<Real>, FieldIoError> {
        self.validate()?;
        let offsets = self.offsets(side);
        Ok(DMatrix::from_fn(
            self.grid.bin_rows,
            self.grid.bin_cols,
            |r, c| offsets[r * self.grid.bin_cols + c].get(axis),
        ))
    }

    pub fn validate(&self) -> Result<(), FieldIoError> {
        let n = self.num_bins();
        if self.left.len() != n || self.right.len() != n {
            return Err(FieldIoError::Inconsistent(format!(
                "expected {} offsets per side, got left={} right={}",
                n,
                self.left.len(),
                self.right.len()
            )));
        }
        for counts in [&self.left_counts, &self.right_counts] {
            if !counts.is_empty() && counts.len() != n {
                return Err(FieldIoError::Inconsistent(format!(
                    "expected {} coverage counts, got {}",
                    n,
                    counts.len()
                )));
            }
        }
        Ok(())
    }

    /// Write the field as pretty-printed JSON.
    ///
    /// The file is only touched after encoding succeeded.
    pub fn save_json(&self, path: &Path) -> Result<(), FieldIoError> {
        self.validate()?;
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load_json(path: &Path) -> Result<Self, FieldIoError> {
        let data = fs::read_to_string(path)?;
        let field: Self = serde_json::from_str(&data)?;
        field.validate()?;
        Ok(field)
    }
}
