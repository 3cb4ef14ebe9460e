//! Non-linear estimation of per-bin stereo deformation fields on tiny-solver.
//!
//! The crate is layered the same way for every problem:
//! - [`factors`]: generic residual functions evaluated for `f64` and dual numbers,
//! - [`ir`]: a backend-independent description of parameter and residual blocks,
//! - [`backend`]: adapters compiling the IR into a concrete solver,
//! - [`params`]: the values behind the parameter blocks,
//! - [`problems`]: builders turning accumulated observations into an IR and back.
//!
//! Most users only need [`DeformationFieldSolver`].

pub mod backend;
pub mod factors;
pub mod ir;
pub mod params;
pub mod problems;

pub use crate::backend::{BackendSolveOptions, OptimBackend, TinySolverBackend};
pub use crate::factors::stereo_reprojection::SharingVariant;
pub use crate::params::{DeformationParameterStore, OffsetHandle};
pub use crate::problems::deformation_field::{
    DeformationFieldSolver, DeformationSolveReport, DeformationSolverConfig, SolveError,
};
