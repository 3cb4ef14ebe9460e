//! High-level problem builders.
//!
//! Each module turns accumulated observations into a [`crate::ir::ProblemIR`],
//! solves it through an [`crate::backend::OptimBackend`] and reads the result back.

pub mod deformation_field;

pub use deformation_field::{
    build_deformation_ir, solve_deformation_field, DeformationFieldSolver, DeformationProblem,
    DeformationSolveReport, DeformationSolverConfig, RegularizationConfig, RegularizationMode,
    SolveError, StreamOptions,
};
