//! Parameter block definitions for deformation estimation.
//!
//! Every optimized quantity is a scalar pixel offset addressed by an
//! [`OffsetHandle`] (side, axis, bin). Handles map to stable IR block names such
//! as `left/dx/5`.
//!
//! # Available Parameters
//!
//! - [`deformation::OffsetHandle`] - address of one scalar offset
//! - [`deformation::DeformationParameterStore`] - current values of all offsets

pub mod deformation;

pub use deformation::{DeformationParameterStore, OffsetHandle};
