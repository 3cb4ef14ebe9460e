//! Per-bin offset parameters for both cameras.

use std::collections::HashMap;

use anyhow::{anyhow, ensure, Result};
use nalgebra::DVector;
use stereo_deform_core::{Axis, BinGrid, DeformationField, PixelOffset, Real, Side};

/// Address of one scalar offset parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OffsetHandle {
    pub side: Side,
    pub axis: Axis,
    pub bin: usize,
}

impl OffsetHandle {
    pub fn new(side: Side, axis: Axis, bin: usize) -> Self {
        Self { side, axis, bin }
    }

    /// Parameter block name used in the IR and in backend solutions.
    pub fn name(&self) -> String {
        format!("{}/{}/{}", self.side.as_str(), self.axis.as_str(), self.bin)
    }

    /// Current value packed as a 1-D block.
    pub fn to_dvec(value: Real) -> DVector<f64> {
        DVector::from_vec(vec![value])
    }
}

/// Current values of the `(dx, dy)` offsets of every bin of both cameras.
///
/// Values persist across solves and seed the next one.
#[derive(Debug, Clone)]
pub struct DeformationParameterStore {
    grid: BinGrid,
    left: Vec<PixelOffset>,
    right: Vec<PixelOffset>,
}

impl DeformationParameterStore {
    /// All offsets start at zero.
    pub fn new(grid: BinGrid) -> Self {
        let n = grid.num_bins();
        Self {
            grid,
            left: vec![PixelOffset::default(); n],
            right: vec![PixelOffset::default(); n],
        }
    }

    pub fn grid(&self) -> &BinGrid {
        &self.grid
    }

    pub fn num_bins(&self) -> usize {
        self.grid.num_bins()
    }

    fn side(&self, side: Side) -> &[PixelOffset] {
        match side {
            Side::Left => &self.left,
            Side::Right => &self.right,
        }
    }

    pub fn get(&self, side: Side, bin: usize) -> Option<PixelOffset> {
        self.side(side).get(bin).copied()
    }

    pub fn get_mut(&mut self, side: Side, bin: usize) -> Option<&mut PixelOffset> {
        match side {
            Side::Left => self.left.get_mut(bin),
            Side::Right => self.right.get_mut(bin),
        }
    }

    pub fn value(&self, handle: OffsetHandle) -> Option<Real> {
        self.get(handle.side, handle.bin)
            .map(|off| off.get(handle.axis))
    }

    pub fn set(&mut self, handle: OffsetHandle, value: Real) -> Result<()> {
        let off = self
            .get_mut(handle.side, handle.bin)
            .ok_or_else(|| anyhow!("bin {} out of range", handle.bin))?;
        match handle.axis {
            Axis::X => off.dx = value,
            Axis::Y => off.dy = value,
        }
        Ok(())
    }

    /// Write solved values back for every handle.
    ///
    /// Nothing is written unless every value is present, 1-D, and finite.
    pub fn apply_solution(
        &mut self,
        handles: &[OffsetHandle],
        solution: &HashMap<String, DVector<f64>>,
    ) -> Result<()> {
        let mut values = Vec::with_capacity(handles.len());
        for handle in handles {
            ensure!(
                handle.bin < self.num_bins(),
                "bin {} out of range",
                handle.bin
            );
            let name = handle.name();
            let v = solution
                .get(&name)
                .ok_or_else(|| anyhow!("solution missing parameter {}", name))?;
            ensure!(v.len() == 1, "parameter {} expected 1 value, got {}", name, v.len());
            ensure!(v[0].is_finite(), "parameter {} is not finite: {}", name, v[0]);
            values.push(v[0]);
        }
        for (handle, value) in handles.iter().zip(values) {
            self.set(*handle, value)?;
        }
        Ok(())
    }

    /// Snapshot of the current values as a field.
    pub fn to_field(&self, left_counts: Vec<u64>, right_counts: Vec<u64>) -> DeformationField {
        DeformationField {
            grid: self.grid.config(),
            left: self.left.clone(),
            right: self.right.clone(),
            left_counts,
            right_counts,
        }
    }

    /// Seed the store from a previously solved field on the same grid.
    pub fn load_field(&mut self, field: &DeformationField) -> Result<()> {
        ensure!(
            field.grid == self.grid.config(),
            "field grid {:?} does not match {:?}",
            field.grid,
            self.grid.config()
        );
        ensure!(
            field.left.len() == self.left.len() && field.right.len() == self.right.len(),
            "field has wrong number of bins"
        );
        self.left.copy_from_slice(&field.left);
        self.right.copy_from_slice(&field.right);
        Ok(())
    }

    pub fn reset(&mut self) {
        self.left.fill(PixelOffset::default());
        self.right.fill(PixelOffset::default());
    }
}
