//! End-to-end deformation field estimation on synthetic stereo tracks.
//!
//! Observations are generated by projecting known 3D points through an ideal
//! rectified stereo pair before and after a known motion.

use std::collections::HashMap;

use anyhow::{bail, Result};
use nalgebra::{DVector, Vector2, Vector3};
use stereo_deform_core::{
    DeformationField, GridConfig, Pt2, RelativePose, Side, StereoCorrespondence,
    StereoIntrinsics,
};
use stereo_deform_optim::backend::{BackendSolution, BackendSolveOptions, OptimBackend};
use stereo_deform_optim::factors::stereo_reprojection::{
    stereo_residual_parts, RoleOffsets, StereoTermData,
};
use stereo_deform_optim::ir::{ProblemIR, RobustLoss};
use stereo_deform_optim::problems::deformation_field::*;
use stereo_deform_optim::SharingVariant;

fn intrinsics() -> StereoIntrinsics {
    StereoIntrinsics {
        f: 500.0,
        cx: 320.0,
        cy: 240.0,
        baseline: 0.5,
    }
}

fn config() -> DeformationSolverConfig {
    DeformationSolverConfig {
        grid: GridConfig {
            bin_rows: 3,
            bin_cols: 4,
            img_rows: 480,
            img_cols: 640,
        },
        intrinsics: intrinsics(),
        ..DeformationSolverConfig::default()
    }
}

fn in_image(p: &Pt2) -> bool {
    p.x >= 0.0 && p.y >= 0.0 && p.x < 640.0 && p.y < 480.0
}

/// Noiseless correspondences of a 3D point lattice under `pose`, with
/// `right_shift` added to every right-image x observation.
fn synthetic_frame(pose: &RelativePose, right_shift: f64) -> Vec<StereoCorrespondence> {
    let intr = intrinsics();
    let mut out = Vec::new();
    for iz in 0..3 {
        for iy in 0..5 {
            for ix in 0..7 {
                let p = Vector3::new(
                    -3.0 + ix as f64,
                    -2.0 + iy as f64,
                    8.0 + 3.0 * iz as f64,
                );
                let q = pose.transform_point(&p);
                let shift = Vector2::new(right_shift, 0.0);
                let corr = StereoCorrespondence::new(
                    intr.project_left(&p),
                    intr.project_left(&q),
                    intr.project_right(&p) + shift,
                    intr.project_right(&q) + shift,
                    2,
                );
                if [corr.left_prev, corr.left_curr, corr.right_prev, corr.right_curr]
                    .iter()
                    .all(in_image)
                {
                    out.push(corr);
                }
            }
        }
    }
    out
}

fn forward_motion() -> RelativePose {
    RelativePose::new(Vector3::new(0.0, 0.01, 0.0), Vector3::new(0.05, 0.0, -0.4))
}

#[test]
fn noiseless_identity_correspondence_has_zero_residual() {
    let intr = intrinsics();
    let lp = Pt2::new(100.0, 100.0);
    let rp = Pt2::new(90.0, 100.0);
    let p = intr.triangulate(&lp, &rp);
    let corr = StereoCorrespondence::new(lp, intr.project_left(&p), rp, intr.project_right(&p), 1);
    let data = StereoTermData::new(&corr, &intr, &RelativePose::identity());

    let parts = stereo_residual_parts(&RoleOffsets::zeros(), &data, 1.0);
    assert!(parts.reprojection.norm() < 1e-9, "{:?}", parts.reprojection);
    assert_eq!(parts.regularization, 0.0);
}

#[test]
fn near_zero_disparity_is_rejected_before_assembly() {
    let intr = intrinsics();
    let lp = Pt2::new(100.0, 100.0);
    let rp = Pt2::new(100.0 - 1e-4, 100.0);
    let depth = intr.triangulate(&lp, &rp).z;
    assert!(depth > 1e6, "depth {depth}");

    let mut solver = DeformationFieldSolver::new(config()).unwrap();
    let stats = solver.add_forward_frame(
        &[StereoCorrespondence::new(lp, lp, rp, rp, 1)],
        RelativePose::identity(),
    );
    assert_eq!(stats.accepted, 0);
    assert_eq!(stats.degenerate, 1);
    assert!(solver.accumulator().is_empty());
    assert!(matches!(solver.solve(), Err(SolveError::NoObservations)));
}

#[test]
fn biased_right_camera_solve_reduces_cost() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("field/deformation.json");
    let mut cfg = config();
    cfg.regularization.weight = 1e-3;
    cfg.output_path = Some(path.clone());

    let mut solver = DeformationFieldSolver::new(cfg).unwrap();
    let pose = forward_motion();
    let frame = synthetic_frame(&pose, -0.8);
    assert!(frame.len() > 20, "only {} correspondences", frame.len());
    let stats = solver.add_forward_frame(&frame, pose);
    assert_eq!(stats.accepted, frame.len());
    solver.add_reverse_frame(&synthetic_frame(&pose.inverse(), -0.8), pose.inverse());

    let report = solver.solve().unwrap();
    assert!(report.initial_cost > 0.0);
    assert!(
        report.final_cost < report.initial_cost,
        "cost {} -> {}",
        report.initial_cost,
        report.final_cost
    );
    assert!(report.field.validate().is_ok());
    assert!(report.num_terms >= frame.len());
    assert!(report.field.right_counts.iter().sum::<u64>() > 0);

    // Persisted and session reset.
    assert_eq!(report.persisted_to.as_deref(), Some(path.as_path()));
    let loaded = DeformationField::load_json(&path).unwrap();
    assert_eq!(loaded, report.field);
    assert!(solver.accumulator().is_empty());

    // The store keeps the solution as the next starting point.
    solver.add_forward_frame(&frame, pose);
    let problem = solver.build_problem().unwrap();
    for (handle, name) in problem
        .handles
        .iter()
        .zip(problem.ir.params.iter().map(|p| &p.name))
    {
        let expected = report.field.offset(handle.side, handle.bin).unwrap();
        assert_eq!(problem.initial[name][0], expected.get(handle.axis));
    }
}

#[test]
fn every_sharing_variant_solves() {
    let pose = forward_motion();
    let frame = synthetic_frame(&pose, -0.5);
    for sharing in [
        SharingVariant::Independent,
        SharingVariant::ShareLeft,
        SharingVariant::ShareRight,
        SharingVariant::ShareBoth,
    ] {
        let mut cfg = config();
        cfg.sharing = sharing;
        cfg.regularization.weight = 1e-3;
        let mut solver = DeformationFieldSolver::new(cfg).unwrap();
        solver.add_forward_frame(&frame, pose);
        let report = solver.solve().unwrap();
        assert!(report.final_cost <= report.initial_cost, "{sharing:?}");
        assert!(report.persisted_to.is_none());
        assert!(report
            .field
            .offsets(Side::Left)
            .iter()
            .chain(report.field.offsets(Side::Right))
            .all(|o| o.is_finite()));
    }
}

fn solve_biased(cfg: DeformationSolverConfig) -> DeformationSolveReport {
    let pose = forward_motion();
    let mut solver = DeformationFieldSolver::new(cfg).unwrap();
    solver.add_forward_frame(&synthetic_frame(&pose, -0.8), pose);
    solver.solve().unwrap()
}

#[test]
fn separate_regularization_solves_with_offset_priors() {
    let mut cfg = config();
    cfg.regularization.mode = RegularizationMode::Separate;
    cfg.regularization.weight = 1e-3;
    let report = solve_biased(cfg);
    assert!(
        report.final_cost < report.initial_cost,
        "cost {} -> {}",
        report.initial_cost,
        report.final_cost
    );
    assert!(report.field.validate().is_ok());
}

#[test]
fn huber_loss_solves() {
    let mut cfg = config();
    cfg.regularization.weight = 1e-3;
    cfg.robust_loss = RobustLoss::Huber { scale: 1.0 };
    let report = solve_biased(cfg);
    assert!(
        report.final_cost < report.initial_cost,
        "cost {} -> {}",
        report.initial_cost,
        report.final_cost
    );
}

#[test]
fn max_offset_holds_every_solved_offset() {
    let mut cfg = config();
    cfg.regularization.weight = 1e-3;
    cfg.max_offset = Some(0.3);
    let report = solve_biased(cfg);
    assert!(report.final_cost <= report.initial_cost);
    for off in report
        .field
        .offsets(Side::Left)
        .iter()
        .chain(report.field.offsets(Side::Right))
    {
        assert!(off.dx.abs() <= 0.3 + 1e-9, "dx {}", off.dx);
        assert!(off.dy.abs() <= 0.3 + 1e-9, "dy {}", off.dy);
    }
}

struct FailingBackend;

impl OptimBackend for FailingBackend {
    fn solve(
        &self,
        _ir: &ProblemIR,
        _initial: &HashMap<String, DVector<f64>>,
        _opts: &BackendSolveOptions,
    ) -> Result<BackendSolution> {
        bail!("did not converge")
    }
}

struct NanBackend;

impl OptimBackend for NanBackend {
    fn solve(
        &self,
        ir: &ProblemIR,
        _initial: &HashMap<String, DVector<f64>>,
        _opts: &BackendSolveOptions,
    ) -> Result<BackendSolution> {
        let params = ir
            .params
            .iter()
            .map(|p| (p.name.clone(), DVector::from_element(1, f64::NAN)))
            .collect();
        Ok(BackendSolution {
            params,
            initial_cost: 1.0,
            final_cost: 0.5,
        })
    }
}

#[test]
fn solver_failure_persists_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("deformation.json");
    let pose = forward_motion();
    let frame = synthetic_frame(&pose, 0.0);

    let mut cfg = config();
    cfg.output_path = Some(path.clone());
    let mut solver =
        DeformationFieldSolver::with_backend(cfg.clone(), Box::new(FailingBackend)).unwrap();
    solver.add_forward_frame(&frame, pose);
    assert!(matches!(solver.solve(), Err(SolveError::Backend(_))));
    assert!(!path.exists());
    assert!(!solver.accumulator().is_empty());

    let mut solver = DeformationFieldSolver::with_backend(cfg, Box::new(NanBackend)).unwrap();
    solver.add_forward_frame(&frame, pose);
    assert!(matches!(
        solver.solve(),
        Err(SolveError::NonFiniteSolution(_))
    ));
    assert!(!path.exists());
    let field = solver.store().to_field(Vec::new(), Vec::new());
    assert!(field.left.iter().chain(&field.right).all(|o| o.dx == 0.0 && o.dy == 0.0));
}

#[test]
fn config_round_trips_through_json() {
    let mut cfg = config();
    cfg.sharing = SharingVariant::ShareRight;
    cfg.regularization.mode = RegularizationMode::Separate;
    cfg.max_offset = Some(3.0);
    cfg.reverse = StreamOptions {
        enabled: false,
        weight: 0.5,
    };
    let json = serde_json::to_string_pretty(&cfg).unwrap();
    let back: DeformationSolverConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, cfg);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, r#"{ "sharing": "ShareBoth", "min_track_age": 2 }"#).unwrap();
    let partial = DeformationSolverConfig::from_json_file(&path).unwrap();
    assert_eq!(partial.sharing, SharingVariant::ShareBoth);
    assert_eq!(partial.min_track_age, 2);
    assert_eq!(partial.min_disparity, 0.01);
    assert_eq!(partial.regularization, RegularizationConfig::default());

    std::fs::write(&path, r#"{ "min_disparity": -1.0 }"#).unwrap();
    assert!(DeformationSolverConfig::from_json_file(&path).is_err());
}
