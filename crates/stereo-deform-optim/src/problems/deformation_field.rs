//! Per-bin stereo deformation field estimation.
//!
//! Every accumulated correspondence becomes one 4-D stereo reprojection term
//! wired to the offsets of the bins its points fall in. The [`SharingVariant`]
//! decides which bin feeds the current-frame roles. Offsets are registered as
//! solver variables only when some term touches them, so unobserved bins keep
//! their stored value.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, ensure, Context, Result};
use log::{debug, info, warn};
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use stereo_deform_core::{
    Axis, BinGrid, DeformationField, FieldIoError, GridConfig, IngestStats, RelativePose,
    RoleBins, Side, StereoCorrespondence, StereoIntrinsics, StreamKind, TrackAccumulator,
    TrackError,
};
use thiserror::Error;

use crate::backend::{BackendSolveOptions, OptimBackend, TinySolverBackend};
use crate::factors::stereo_reprojection::{RoleSlots, SharingVariant, StereoTermData};
use crate::ir::{Bound, FactorKind, ParamId, ProblemIR, ResidualBlock, RobustLoss};
use crate::params::{DeformationParameterStore, OffsetHandle};

/// How the offset magnitude penalty enters the objective.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegularizationMode {
    /// `weight * sum(d_i^2)` over the roles of a term, added to each of its
    /// four residual components.
    #[default]
    Folded,
    /// One `sqrt(weight) * d` residual per registered offset.
    Separate,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegularizationConfig {
    pub weight: f64,
    pub mode: RegularizationMode,
}

impl Default for RegularizationConfig {
    fn default() -> Self {
        Self {
            weight: 1.0,
            mode: RegularizationMode::Folded,
        }
    }
}

/// Policy for one accumulation stream.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    pub enabled: bool,
    /// Multiplier on the squared residual of every term from this stream.
    pub weight: f64,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            weight: 1.0,
        }
    }
}

/// Configuration of a deformation field solve.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeformationSolverConfig {
    pub grid: GridConfig,
    pub intrinsics: StereoIntrinsics,
    pub sharing: SharingVariant,
    pub regularization: RegularizationConfig,
    /// Smallest accepted previous-frame disparity in pixels.
    pub min_disparity: f64,
    /// Tracks younger than this are left out of the problem.
    pub min_track_age: u32,
    pub forward: StreamOptions,
    pub reverse: StreamOptions,
    /// Robust loss on every stereo term.
    pub robust_loss: RobustLoss,
    /// Symmetric bound `|d| <= max_offset` on every offset.
    pub max_offset: Option<f64>,
    /// Where the solved field is written, if anywhere.
    pub output_path: Option<PathBuf>,
    pub backend_opts: BackendSolveOptions,
}

impl Default for DeformationSolverConfig {
    fn default() -> Self {
        Self {
            grid: GridConfig::default(),
            intrinsics: StereoIntrinsics::default(),
            sharing: SharingVariant::Independent,
            regularization: RegularizationConfig::default(),
            min_disparity: 0.01,
            min_track_age: 0,
            forward: StreamOptions::default(),
            reverse: StreamOptions::default(),
            robust_loss: RobustLoss::None,
            max_offset: None,
            output_path: None,
            backend_opts: BackendSolveOptions::default(),
        }
    }
}

impl DeformationSolverConfig {
    /// Load a configuration from a JSON file. Missing fields take their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        BinGrid::new(self.grid)?;
        self.intrinsics.validate()?;
        ensure!(
            self.min_disparity.is_finite() && self.min_disparity > 0.0,
            "min_disparity must be positive, got {}",
            self.min_disparity
        );
        ensure!(
            self.regularization.weight.is_finite() && self.regularization.weight >= 0.0,
            "regularization weight must be non-negative, got {}",
            self.regularization.weight
        );
        for (name, stream) in [("forward", &self.forward), ("reverse", &self.reverse)] {
            ensure!(
                stream.weight.is_finite() && stream.weight >= 0.0,
                "{} stream weight must be non-negative, got {}",
                name,
                stream.weight
            );
        }
        if let Some(m) = self.max_offset {
            ensure!(m.is_finite() && m > 0.0, "max_offset must be positive, got {}", m);
        }
        Ok(())
    }

    fn stream(&self, kind: StreamKind) -> &StreamOptions {
        match kind {
            StreamKind::Forward => &self.forward,
            StreamKind::Reverse => &self.reverse,
        }
    }
}

/// Assembled problem together with the bookkeeping needed to read it back.
#[derive(Debug, Clone)]
pub struct DeformationProblem {
    pub ir: ProblemIR,
    pub initial: HashMap<String, DVector<f64>>,
    /// Offset behind each IR parameter, indexed by `ParamId`.
    pub handles: Vec<OffsetHandle>,
    /// Terms touching each left bin.
    pub left_counts: Vec<u64>,
    /// Terms touching each right bin.
    pub right_counts: Vec<u64>,
    pub num_terms: usize,
    pub skipped_young: usize,
}

/// Offset handle feeding each role of a term, before de-duplication.
fn role_handles(bins: &RoleBins, sharing: SharingVariant) -> [OffsetHandle; 7] {
    let lc_bin = if sharing.shares_left() {
        bins.left_prev
    } else {
        bins.left_curr
    };
    let rc_bin = if sharing.shares_right() {
        bins.right_prev
    } else {
        bins.right_curr
    };
    [
        OffsetHandle::new(Side::Left, Axis::X, bins.left_prev),
        OffsetHandle::new(Side::Left, Axis::Y, bins.left_prev),
        OffsetHandle::new(Side::Left, Axis::X, lc_bin),
        OffsetHandle::new(Side::Left, Axis::Y, lc_bin),
        OffsetHandle::new(Side::Right, Axis::X, bins.right_prev),
        OffsetHandle::new(Side::Right, Axis::X, rc_bin),
        OffsetHandle::new(Side::Right, Axis::Y, rc_bin),
    ]
}

/// Distinct handles of a term in first-use order, and the slot of each role.
fn dedup_roles(roles: &[OffsetHandle; 7]) -> (Vec<OffsetHandle>, RoleSlots) {
    let mut distinct: Vec<OffsetHandle> = Vec::with_capacity(7);
    let mut slot = |h: OffsetHandle| match distinct.iter().position(|d| *d == h) {
        Some(i) => i,
        None => {
            distinct.push(h);
            distinct.len() - 1
        }
    };
    let slots = RoleSlots {
        lp_dx: slot(roles[0]),
        lp_dy: slot(roles[1]),
        lc_dx: slot(roles[2]),
        lc_dy: slot(roles[3]),
        rp_dx: slot(roles[4]),
        rc_dx: slot(roles[5]),
        rc_dy: slot(roles[6]),
    };
    (distinct, slots)
}

struct IrAssembler<'a> {
    store: &'a DeformationParameterStore,
    bounds: Option<Vec<Bound>>,
    ir: ProblemIR,
    initial: HashMap<String, DVector<f64>>,
    ids: HashMap<OffsetHandle, ParamId>,
    handles: Vec<OffsetHandle>,
}

impl IrAssembler<'_> {
    fn param(&mut self, handle: OffsetHandle) -> Result<ParamId> {
        if let Some(id) = self.ids.get(&handle) {
            return Ok(*id);
        }
        let mut value = self
            .store
            .value(handle)
            .ok_or_else(|| anyhow!("bin {} outside the parameter store", handle.bin))?;
        if let Some(bounds) = &self.bounds {
            value = value.clamp(bounds[0].lower, bounds[0].upper);
        }
        let name = handle.name();
        let id = self.ir.add_param_block(name.clone(), 1, self.bounds.clone());
        self.initial.insert(name, OffsetHandle::to_dvec(value));
        self.ids.insert(handle, id);
        self.handles.push(handle);
        Ok(id)
    }
}

/// Build the IR for every usable accumulated correspondence.
///
/// Streams are walked forward first, then reverse; within a stream bin by bin
/// in insertion order, so the result is reproducible.
pub fn build_deformation_ir(
    accumulator: &TrackAccumulator,
    store: &DeformationParameterStore,
    config: &DeformationSolverConfig,
) -> Result<DeformationProblem> {
    let num_bins = accumulator.grid().num_bins();
    ensure!(
        store.num_bins() == num_bins,
        "parameter store has {} bins, accumulator has {}",
        store.num_bins(),
        num_bins
    );

    let separate = config.regularization.mode == RegularizationMode::Separate;
    let reg_weight = if separate {
        0.0
    } else {
        config.regularization.weight
    };
    let bounds = config.max_offset.map(|m| {
        vec![Bound {
            idx: 0,
            lower: -m,
            upper: m,
        }]
    });

    let mut asm = IrAssembler {
        store,
        bounds,
        ir: ProblemIR::new(),
        initial: HashMap::new(),
        ids: HashMap::new(),
        handles: Vec::new(),
    };
    let mut left_counts = vec![0u64; num_bins];
    let mut right_counts = vec![0u64; num_bins];
    let mut num_terms = 0;
    let mut skipped_young = 0;

    for kind in [StreamKind::Forward, StreamKind::Reverse] {
        let opts = config.stream(kind);
        let stream = accumulator.stream(kind);
        if !opts.enabled {
            if !stream.is_empty() {
                debug!("{:?} stream disabled, ignoring {} entries", kind, stream.len());
            }
            continue;
        }

        for entry in stream.iter() {
            if entry.corr.age < config.min_track_age {
                skipped_young += 1;
                continue;
            }
            let pose = stream
                .pose(entry.frame)
                .ok_or_else(|| anyhow!("{:?} entry references missing frame {}", kind, entry.frame))?;

            let (distinct, slots) = dedup_roles(&role_handles(&entry.bins, config.sharing));
            let params = distinct
                .iter()
                .map(|h| asm.param(*h))
                .collect::<Result<Vec<_>>>()?;

            let mut touched: Vec<(Side, usize)> = distinct.iter().map(|h| (h.side, h.bin)).collect();
            touched.sort_by_key(|(side, bin)| (*side == Side::Right, *bin));
            touched.dedup();
            for (side, bin) in touched {
                match side {
                    Side::Left => left_counts[bin] += 1,
                    Side::Right => right_counts[bin] += 1,
                }
            }

            let factor = FactorKind::StereoDeformation {
                data: StereoTermData::new(&entry.corr, &config.intrinsics, pose),
                sharing: config.sharing,
                slots,
                reg_weight,
                w: opts.weight,
            };
            asm.ir.add_residual_block(ResidualBlock {
                params,
                loss: config.robust_loss,
                residual_dim: factor.residual_dim(),
                factor,
            });
            num_terms += 1;
        }
    }

    if separate && config.regularization.weight > 0.0 {
        let sqrt_weight = config.regularization.weight.sqrt();
        for idx in 0..asm.handles.len() {
            asm.ir.add_residual_block(ResidualBlock {
                params: vec![ParamId(idx)],
                loss: RobustLoss::None,
                factor: FactorKind::OffsetPrior { sqrt_weight },
                residual_dim: 1,
            });
        }
    }

    Ok(DeformationProblem {
        ir: asm.ir,
        initial: asm.initial,
        handles: asm.handles,
        left_counts,
        right_counts,
        num_terms,
        skipped_young,
    })
}

/// Failure of a deformation field solve.
#[derive(Debug, Error)]
pub enum SolveError {
    #[error("invalid solver configuration: {0:#}")]
    InvalidConfig(anyhow::Error),
    #[error("no usable correspondences accumulated")]
    NoObservations,
    #[error("failed to assemble problem: {0:#}")]
    Assembly(anyhow::Error),
    #[error("solver failed: {0:#}")]
    Backend(anyhow::Error),
    #[error("solver returned unusable values: {0:#}")]
    NonFiniteSolution(anyhow::Error),
    #[error("failed to persist deformation field: {0}")]
    Persist(#[from] FieldIoError),
}

impl From<TrackError> for SolveError {
    fn from(err: TrackError) -> Self {
        SolveError::InvalidConfig(err.into())
    }
}

/// Outcome of a successful solve.
#[derive(Debug, Clone)]
pub struct DeformationSolveReport {
    pub field: DeformationField,
    pub initial_cost: f64,
    pub final_cost: f64,
    pub num_terms: usize,
    pub num_params: usize,
    pub skipped_young: usize,
    /// Set when the field was written to `output_path`.
    pub persisted_to: Option<PathBuf>,
}

/// Assemble, solve and read back one deformation field.
///
/// `store` is updated only when the backend returns finite values for every
/// registered offset. The field is persisted only after that succeeds.
pub fn solve_deformation_field(
    accumulator: &TrackAccumulator,
    store: &mut DeformationParameterStore,
    config: &DeformationSolverConfig,
    backend: &dyn OptimBackend,
) -> Result<DeformationSolveReport, SolveError> {
    let problem = build_deformation_ir(accumulator, store, config).map_err(SolveError::Assembly)?;
    if problem.num_terms == 0 {
        return Err(SolveError::NoObservations);
    }
    debug!(
        "deformation problem: {} terms, {} offsets, {} residual blocks, {} young tracks skipped",
        problem.num_terms,
        problem.handles.len(),
        problem.ir.residuals.len(),
        problem.skipped_young
    );

    let solution = backend
        .solve(&problem.ir, &problem.initial, &config.backend_opts)
        .map_err(SolveError::Backend)?;
    if !solution.final_cost.is_finite() {
        return Err(SolveError::NonFiniteSolution(anyhow!(
            "final cost is {}",
            solution.final_cost
        )));
    }
    store
        .apply_solution(&problem.handles, &solution.params)
        .map_err(SolveError::NonFiniteSolution)?;

    let field = store.to_field(problem.left_counts, problem.right_counts);
    let persisted_to = match &config.output_path {
        Some(path) => {
            field.save_json(path)?;
            Some(path.clone())
        }
        None => None,
    };

    info!(
        "deformation field solved: cost {:.6e} -> {:.6e} over {} terms ({} offsets)",
        solution.initial_cost,
        solution.final_cost,
        problem.num_terms,
        problem.handles.len()
    );

    Ok(DeformationSolveReport {
        field,
        initial_cost: solution.initial_cost,
        final_cost: solution.final_cost,
        num_terms: problem.num_terms,
        num_params: problem.handles.len(),
        skipped_young: problem.skipped_young,
        persisted_to,
    })
}

/// Accumulates tracked correspondences and estimates the deformation field.
pub struct DeformationFieldSolver {
    config: DeformationSolverConfig,
    accumulator: TrackAccumulator,
    store: DeformationParameterStore,
    backend: Box<dyn OptimBackend>,
}

impl DeformationFieldSolver {
    /// Solver using the tiny-solver backend.
    pub fn new(config: DeformationSolverConfig) -> Result<Self, SolveError> {
        Self::with_backend(config, Box::new(TinySolverBackend))
    }

    pub fn with_backend(
        config: DeformationSolverConfig,
        backend: Box<dyn OptimBackend>,
    ) -> Result<Self, SolveError> {
        config.validate().map_err(SolveError::InvalidConfig)?;
        let grid = BinGrid::new(config.grid)?;
        Ok(Self {
            accumulator: TrackAccumulator::new(grid, config.min_disparity),
            store: DeformationParameterStore::new(grid),
            backend,
            config,
        })
    }

    pub fn config(&self) -> &DeformationSolverConfig {
        &self.config
    }

    pub fn accumulator(&self) -> &TrackAccumulator {
        &self.accumulator
    }

    pub fn store(&self) -> &DeformationParameterStore {
        &self.store
    }

    /// Seed the offsets from an earlier solution.
    pub fn warm_start(&mut self, field: &DeformationField) -> Result<(), SolveError> {
        self.store
            .load_field(field)
            .map_err(SolveError::InvalidConfig)
    }

    pub fn add_forward_frame(
        &mut self,
        correspondences: &[StereoCorrespondence],
        pose: RelativePose,
    ) -> IngestStats {
        self.accumulator.add_forward_frame(correspondences, pose)
    }

    pub fn add_reverse_frame(
        &mut self,
        correspondences: &[StereoCorrespondence],
        pose: RelativePose,
    ) -> IngestStats {
        self.accumulator.add_reverse_frame(correspondences, pose)
    }

    /// Assemble the problem for the current accumulation without solving it.
    pub fn build_problem(&self) -> Result<DeformationProblem> {
        build_deformation_ir(&self.accumulator, &self.store, &self.config)
    }

    /// Solve for the field, persist it if configured, and start a new
    /// accumulation session.
    ///
    /// On any error the accumulated tracks are kept so the caller can retry.
    pub fn solve(&mut self) -> Result<DeformationSolveReport, SolveError> {
        let stats = (
            self.accumulator.forward().stats(),
            self.accumulator.reverse().stats(),
        );
        if stats.0.rejected() + stats.1.rejected() > 0 {
            warn!(
                "rejected correspondences: forward {:?}, reverse {:?}",
                stats.0, stats.1
            );
        }
        let report = solve_deformation_field(
            &self.accumulator,
            &mut self.store,
            &self.config,
            self.backend.as_ref(),
        )?;
        self.accumulator.clear();
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stereo_deform_core::Pt2;

    fn grid() -> GridConfig {
        GridConfig {
            bin_rows: 3,
            bin_cols: 4,
            img_rows: 480,
            img_cols: 640,
        }
    }

    fn config(sharing: SharingVariant) -> DeformationSolverConfig {
        DeformationSolverConfig {
            grid: grid(),
            intrinsics: StereoIntrinsics {
                f: 500.0,
                cx: 320.0,
                cy: 240.0,
                baseline: 0.5,
            },
            sharing,
            ..DeformationSolverConfig::default()
        }
    }

    fn accumulate(corrs: &[StereoCorrespondence]) -> TrackAccumulator {
        let mut acc = TrackAccumulator::new(BinGrid::new(grid()).unwrap(), 0.01);
        let stats = acc.add_forward_frame(corrs, RelativePose::identity());
        assert_eq!(stats.accepted, corrs.len());
        acc
    }

    fn store() -> DeformationParameterStore {
        DeformationParameterStore::new(BinGrid::new(grid()).unwrap())
    }

    // Every role falls in a different bin: lp 0, lc 1, rp 0, rc 1.
    fn spread() -> StereoCorrespondence {
        StereoCorrespondence::new(
            Pt2::new(100.0, 100.0),
            Pt2::new(200.0, 100.0),
            Pt2::new(90.0, 100.0),
            Pt2::new(190.0, 100.0),
            3,
        )
    }

    #[test]
    fn parameter_count_follows_sharing_variant() {
        let acc = accumulate(&[spread()]);
        for (sharing, expected) in [
            (SharingVariant::Independent, 7),
            (SharingVariant::ShareLeft, 5),
            (SharingVariant::ShareRight, 6),
            (SharingVariant::ShareBoth, 4),
        ] {
            let problem = build_deformation_ir(&acc, &store(), &config(sharing)).unwrap();
            assert_eq!(problem.num_terms, 1);
            assert_eq!(problem.ir.params.len(), expected, "{sharing:?}");
            assert_eq!(problem.ir.residuals[0].params.len(), expected);
            problem.ir.validate().unwrap();
        }
    }

    #[test]
    fn independent_and_share_left_coincide_in_one_bin() {
        let corr = StereoCorrespondence::new(
            Pt2::new(100.0, 100.0),
            Pt2::new(102.0, 101.0),
            Pt2::new(90.0, 100.0),
            Pt2::new(300.0, 400.0),
            1,
        );
        let acc = accumulate(&[corr]);
        let a = build_deformation_ir(&acc, &store(), &config(SharingVariant::Independent)).unwrap();
        let b = build_deformation_ir(&acc, &store(), &config(SharingVariant::ShareLeft)).unwrap();

        let names = |p: &DeformationProblem| -> Vec<String> {
            p.ir.params.iter().map(|blk| blk.name.clone()).collect()
        };
        assert_eq!(names(&a), names(&b));
        let slots = |p: &DeformationProblem| match &p.ir.residuals[0].factor {
            FactorKind::StereoDeformation { slots, .. } => *slots,
            other => panic!("unexpected factor {other:?}"),
        };
        assert_eq!(slots(&a), slots(&b));
    }

    #[test]
    fn counts_record_touched_bins_once_per_term() {
        let acc = accumulate(&[spread(), spread()]);
        let problem =
            build_deformation_ir(&acc, &store(), &config(SharingVariant::Independent)).unwrap();
        assert_eq!(problem.left_counts[0], 2);
        assert_eq!(problem.left_counts[1], 2);
        assert_eq!(problem.right_counts[0], 2);
        assert_eq!(problem.right_counts[1], 2);
        assert_eq!(problem.left_counts.iter().sum::<u64>(), 4);
        // Shared parameters are registered once across terms.
        assert_eq!(problem.ir.params.len(), 7);
    }

    #[test]
    fn young_tracks_and_disabled_streams_are_skipped() {
        let mut acc = accumulate(&[spread()]);
        acc.add_reverse_frame(&[spread()], RelativePose::identity());

        let mut cfg = config(SharingVariant::Independent);
        cfg.min_track_age = 5;
        let problem = build_deformation_ir(&acc, &store(), &cfg).unwrap();
        assert_eq!(problem.num_terms, 0);
        assert_eq!(problem.skipped_young, 2);
        assert!(problem.ir.params.is_empty());

        let mut cfg = config(SharingVariant::Independent);
        cfg.reverse.enabled = false;
        let problem = build_deformation_ir(&acc, &store(), &cfg).unwrap();
        assert_eq!(problem.num_terms, 1);
    }

    #[test]
    fn separate_regularization_emits_priors() {
        let acc = accumulate(&[spread()]);
        let mut cfg = config(SharingVariant::ShareBoth);
        cfg.regularization.mode = RegularizationMode::Separate;
        cfg.regularization.weight = 4.0;
        let problem = build_deformation_ir(&acc, &store(), &cfg).unwrap();

        assert_eq!(problem.ir.residuals.len(), 1 + 4);
        match &problem.ir.residuals[0].factor {
            FactorKind::StereoDeformation { reg_weight, .. } => assert_eq!(*reg_weight, 0.0),
            other => panic!("unexpected factor {other:?}"),
        }
        for r in &problem.ir.residuals[1..] {
            assert_eq!(r.factor, FactorKind::OffsetPrior { sqrt_weight: 2.0 });
        }
        problem.ir.validate().unwrap();
    }

    #[test]
    fn max_offset_bounds_every_parameter_and_clamps_initial_values() {
        let acc = accumulate(&[spread()]);
        let mut st = store();
        st.set(OffsetHandle::new(Side::Left, Axis::X, 0), 5.0).unwrap();
        let mut cfg = config(SharingVariant::Independent);
        cfg.max_offset = Some(2.0);
        let problem = build_deformation_ir(&acc, &st, &cfg).unwrap();

        for p in &problem.ir.params {
            let b = p.bounds.as_ref().unwrap();
            assert_eq!((b[0].lower, b[0].upper), (-2.0, 2.0));
        }
        assert_eq!(problem.initial["left/dx/0"][0], 2.0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut cfg = config(SharingVariant::Independent);
        cfg.min_disparity = 0.0;
        assert!(matches!(
            DeformationFieldSolver::new(cfg),
            Err(SolveError::InvalidConfig(_))
        ));

        let mut cfg = config(SharingVariant::Independent);
        cfg.intrinsics.baseline = -1.0;
        assert!(DeformationFieldSolver::new(cfg).is_err());
    }
}
