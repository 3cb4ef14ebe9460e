//! Uniform bin grid over the image plane.
//!
//! A point `(x, y)` falls into column `c = floor(x / bin_width)` and row
//! `r = floor(y / bin_height)`; its bin id is `r * bin_cols + c`.

use serde::{Deserialize, Serialize};

use crate::{is_finite_point, Pt2, Real, TrackError};

/// Grid and image dimensions, as found in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridConfig {
    pub bin_rows: usize,
    pub bin_cols: usize,
    pub img_rows: usize,
    pub img_cols: usize,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            bin_rows: 4,
            bin_cols: 8,
            img_rows: 376,
            img_cols: 1241,
        }
    }
}

/// Validated bin grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BinGrid {
    config: GridConfig,
    bin_width: Real,
    bin_height: Real,
}

impl BinGrid {
    pub fn new(config: GridConfig) -> Result<Self, TrackError> {
        if config.bin_rows == 0 || config.bin_cols == 0 {
            return Err(TrackError::InvalidGrid(format!(
                "bin grid must be non-empty, got {}x{}",
                config.bin_rows, config.bin_cols
            )));
        }
        if config.img_rows == 0 || config.img_cols == 0 {
            return Err(TrackError::InvalidGrid(format!(
                "image must be non-empty, got {}x{}",
                config.img_cols, config.img_rows
            )));
        }
        Ok(Self {
            config,
            bin_width: config.img_cols as Real / config.bin_cols as Real,
            bin_height: config.img_rows as Real / config.bin_rows as Real,
        })
    }

    pub fn config(&self) -> GridConfig {
        self.config
    }

    pub fn bin_rows(&self) -> usize {
        self.config.bin_rows
    }

    pub fn bin_cols(&self) -> usize {
        self.config.bin_cols
    }

    pub fn num_bins(&self) -> usize {
        self.config.bin_rows * self.config.bin_cols
    }

    pub fn bin_width(&self) -> Real {
        self.bin_width
    }

    pub fn bin_height(&self) -> Real {
        self.bin_height
    }

    /// Returns `true` if `p` lies in `[0, img_cols) x [0, img_rows)`.
    pub fn contains(&self, p: &Pt2) -> bool {
        p.x >= 0.0
            && p.y >= 0.0
            && p.x < self.config.img_cols as Real
            && p.y < self.config.img_rows as Real
    }

    /// Raw bin index without any bounds handling.
    ///
    /// Points outside the image produce indices outside `[0, num_bins)`,
    /// possibly negative. Use [`BinGrid::bin_of`] unless the point has already
    /// been validated.
    pub fn raw_bin_index(&self, p: &Pt2) -> i64 {
        let c = (p.x / self.bin_width).floor() as i64;
        let r = (p.y / self.bin_height).floor() as i64;
        r * self.config.bin_cols as i64 + c
    }

    /// Bin id of an in-image point.
    ///
    /// Out-of-image and non-finite points are rejected, never clamped into a
    /// neighbouring bin.
    pub fn bin_of(&self, p: &Pt2) -> Result<usize, TrackError> {
        if !is_finite_point(p) {
            return Err(TrackError::NonFinitePoint { point: *p });
        }
        if !self.contains(p) {
            return Err(TrackError::PointOutOfBounds {
                point: *p,
                cols: self.config.img_cols,
                rows: self.config.img_rows,
            });
        }
        // Rounding in bin_width can push in-image points on the last edge one bin over.
        let c = ((p.x / self.bin_width).floor() as usize).min(self.config.bin_cols - 1);
        let r = ((p.y / self.bin_height).floor() as usize).min(self.config.bin_rows - 1);
        Ok(r * self.config.bin_cols + c)
    }

    /// `(row, col)` of a bin id.
    pub fn row_col(&self, bin: usize) -> (usize, usize) {
        (bin / self.config.bin_cols, bin % self.config.bin_cols)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid_4x3() -> BinGrid {
        BinGrid::new(GridConfig {
            bin_rows: 3,
            bin_cols: 4,
            img_rows: 480,
            img_cols: 640,
        })
        .unwrap()
    }

    #[test]
    fn in_bounds_points_map_into_grid() {
        let grid = grid_4x3();
        let mut y = 0.0;
        while y < 480.0 {
            let mut x = 0.0;
            while x < 640.0 {
                let bin = grid.bin_of(&Pt2::new(x, y)).unwrap();
                assert!(bin < grid.num_bins(), "bin {bin} for ({x}, {y})");
                x += 7.3;
            }
            y += 5.9;
        }
        let last = grid.bin_of(&Pt2::new(639.999, 479.999)).unwrap();
        assert_eq!(last, grid.num_bins() - 1);
    }

    #[test]
    fn same_cell_same_bin() {
        let grid = grid_4x3();
        let a = grid.bin_of(&Pt2::new(170.0, 330.0)).unwrap();
        let b = grid.bin_of(&Pt2::new(319.0, 479.0)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a, 2 * 4 + 1);
        assert_eq!(grid.row_col(a), (2, 1));
    }

    #[test]
    fn out_of_bounds_is_rejected_not_clamped() {
        let grid = grid_4x3();
        let p = Pt2::new(640.0, 10.0);
        assert!(matches!(
            grid.bin_of(&p),
            Err(TrackError::PointOutOfBounds { .. })
        ));
        // The raw index leaks into the next row instead of saturating.
        assert_eq!(grid.raw_bin_index(&p), 4);
        assert!(grid.raw_bin_index(&Pt2::new(-1.0, 0.0)) < 0);
        assert!(matches!(
            grid.bin_of(&Pt2::new(f64::NAN, 1.0)),
            Err(TrackError::NonFinitePoint { .. })
        ));
    }

    #[test]
    fn empty_grid_is_invalid() {
        let cfg = GridConfig {
            bin_rows: 0,
            ..GridConfig::default()
        };
        assert!(BinGrid::new(cfg).is_err());
    }
}
