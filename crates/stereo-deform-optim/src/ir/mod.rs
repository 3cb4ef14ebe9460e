//! Backend-independent intermediate representation of optimization problems.

mod types;

pub use types::{
    Bound, FactorKind, ParamBlock, ParamId, ProblemIR, ResidualBlock, RobustLoss,
};
