use anyhow::{ensure, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::factors::stereo_reprojection::{RoleSlots, SharingVariant, StereoTermData};

/// Identifier for a parameter block in the IR.
///
/// This is stable within a `ProblemIR` instance and is used by residual blocks
/// to reference their parameter dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParamId(pub usize);

/// Bounds for a single parameter index.
///
/// Bounds are applied after each update in backends that support them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bound {
    pub idx: usize,
    pub lower: f64,
    pub upper: f64,
}

/// Robust loss applied to a residual block.
///
/// Each residual block has its own loss; per-correspondence robustification is
/// achieved by using one residual block per term.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub enum RobustLoss {
    #[default]
    None,
    Huber {
        scale: f64,
    },
    Cauchy {
        scale: f64,
    },
    Arctan {
        scale: f64,
    },
}

/// Backend-agnostic factor kinds.
///
/// Each factor kind implies its parameter layout and residual dimension.
#[derive(Debug, Clone, PartialEq)]
pub enum FactorKind {
    /// Stereo reprojection through per-bin offsets.
    ///
    /// Parameters: the distinct scalar offset blocks referenced by `slots`, in
    /// slot order. Residual: `[left_x, left_y, right_x, right_y]`, each with the
    /// regularization addend, scaled by `sqrt(w)`.
    StereoDeformation {
        data: StereoTermData,
        sharing: SharingVariant,
        slots: RoleSlots,
        reg_weight: f64,
        w: f64,
    },
    /// Zero-mean prior on one scalar offset: `sqrt_weight * d`.
    ///
    /// Parameters: \[offset\].
    OffsetPrior { sqrt_weight: f64 },
}

impl FactorKind {
    /// Residual dimension implied by the factor.
    pub fn residual_dim(&self) -> usize {
        match self {
            FactorKind::StereoDeformation { .. } => 4,
            FactorKind::OffsetPrior { .. } => 1,
        }
    }
}

/// Parameter block definition in the IR.
#[derive(Debug, Clone)]
pub struct ParamBlock {
    pub id: ParamId,
    pub name: String,
    pub dim: usize,
    pub bounds: Option<Vec<Bound>>,
}

/// Residual block definition in the IR.
///
/// The order of `params` must match the factor's expected parameter order.
#[derive(Debug, Clone)]
pub struct ResidualBlock {
    pub params: Vec<ParamId>,
    pub loss: RobustLoss,
    pub factor: FactorKind,
    pub residual_dim: usize,
}

/// Backend-agnostic optimization problem representation.
///
/// Backends compile this IR into solver-specific problems.
#[derive(Debug, Default, Clone)]
pub struct ProblemIR {
    pub params: Vec<ParamBlock>,
    pub residuals: Vec<ResidualBlock>,
}

impl ProblemIR {
    /// Creates an empty IR.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a parameter block and returns its `ParamId`.
    pub fn add_param_block(
        &mut self,
        name: impl Into<String>,
        dim: usize,
        bounds: Option<Vec<Bound>>,
    ) -> ParamId {
        let id = ParamId(self.params.len());
        self.params.push(ParamBlock {
            id,
            name: name.into(),
            dim,
            bounds,
        });
        id
    }

    /// Adds a residual block to the IR.
    pub fn add_residual_block(&mut self, residual: ResidualBlock) {
        self.residuals.push(residual);
    }

    /// Finds a parameter by name.
    pub fn param_by_name(&self, name: &str) -> Option<ParamId> {
        self.params.iter().find(|p| p.name == name).map(|p| p.id)
    }

    /// Validates internal consistency and factor expectations.
    pub fn validate(&self) -> Result<()> {
        let mut names = HashSet::new();
        for (idx, param) in self.params.iter().enumerate() {
            ensure!(
                param.id.0 == idx,
                "param id mismatch: expected {}, got {:?}",
                idx,
                param.id
            );
            ensure!(param.dim > 0, "param {} has zero dimension", param.name);
            ensure!(
                names.insert(param.name.as_str()),
                "duplicate param name {}",
                param.name
            );
            if let Some(bounds) = &param.bounds {
                for bound in bounds {
                    ensure!(
                        bound.idx < param.dim,
                        "param {} bound index {} out of range",
                        param.name,
                        bound.idx
                    );
                    ensure!(
                        bound.lower <= bound.upper,
                        "param {} bound lower {} > upper {}",
                        param.name,
                        bound.lower,
                        bound.upper
                    );
                }
            }
        }

        for (r_idx, residual) in self.residuals.iter().enumerate() {
            ensure!(
                residual.residual_dim == residual.factor.residual_dim(),
                "residual {} dim {} does not match factor expectation {}",
                r_idx,
                residual.residual_dim,
                residual.factor.residual_dim()
            );
            for param in &residual.params {
                ensure!(
                    param.0 < self.params.len(),
                    "residual {} references missing param {:?}",
                    r_idx,
                    param
                );
            }

            match &residual.factor {
                FactorKind::StereoDeformation {
                    sharing,
                    slots,
                    reg_weight,
                    w,
                    ..
                } => {
                    let n = residual.params.len();
                    ensure!(
                        n > 0 && n <= sharing.max_params(),
                        "residual {}: {:?} term expects 1..={} params, got {}",
                        r_idx,
                        sharing,
                        sharing.max_params(),
                        n
                    );
                    let unique: HashSet<_> = residual.params.iter().collect();
                    ensure!(
                        unique.len() == n,
                        "residual {} references a parameter block twice",
                        r_idx
                    );
                    for id in &residual.params {
                        let p = &self.params[id.0];
                        ensure!(
                            p.dim == 1,
                            "stereo deformation term expects scalar offsets, {} has dim {}",
                            p.name,
                            p.dim
                        );
                    }
                    let used: HashSet<usize> = slots.as_array().into_iter().collect();
                    ensure!(
                        used.iter().all(|&s| s < n),
                        "residual {} slot out of range for {} params",
                        r_idx,
                        n
                    );
                    ensure!(
                        used.len() == n,
                        "residual {} has parameter blocks not fed to any role",
                        r_idx
                    );
                    ensure!(
                        slots.respects(*sharing),
                        "residual {} wiring violates {:?}",
                        r_idx,
                        sharing
                    );
                    ensure!(
                        reg_weight.is_finite() && *reg_weight >= 0.0,
                        "regularization weight must be non-negative, got {}",
                        reg_weight
                    );
                    ensure!(
                        w.is_finite() && *w >= 0.0,
                        "term weight must be non-negative, got {}",
                        w
                    );
                }
                FactorKind::OffsetPrior { sqrt_weight } => {
                    ensure!(
                        residual.params.len() == 1,
                        "OffsetPrior requires 1 param [offset]"
                    );
                    let p = &self.params[residual.params[0].0];
                    ensure!(
                        p.dim == 1,
                        "OffsetPrior expects a scalar offset, {} has dim {}",
                        p.name,
                        p.dim
                    );
                    ensure!(
                        sqrt_weight.is_finite() && *sqrt_weight >= 0.0,
                        "OffsetPrior weight must be non-negative, got {}",
                        sqrt_weight
                    );
                }
            }
        }

        Ok(())
    }
}
