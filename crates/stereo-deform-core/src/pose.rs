//! Known rigid motion between two consecutive frames.

use nalgebra::{Rotation3, Translation3, UnitQuaternion};
use serde::{Deserialize, Serialize};

use crate::{Iso3, Mat3, Mat34, Vec3};

/// Relative pose mapping previous-frame camera coordinates into the current
/// frame: `P' = R(rotation) * P + translation`.
///
/// The rotation is an axis-angle vector (direction = axis, norm = angle in radians).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RelativePose {
    pub rotation: Vec3,
    pub translation: Vec3,
}

impl Default for RelativePose {
    fn default() -> Self {
        Self::identity()
    }
}

impl RelativePose {
    pub fn new(rotation: Vec3, translation: Vec3) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    pub fn identity() -> Self {
        Self::new(Vec3::zeros(), Vec3::zeros())
    }

    pub fn from_isometry(iso: &Iso3) -> Self {
        Self::new(iso.rotation.scaled_axis(), iso.translation.vector)
    }

    /// Build from a `[R | t]` matrix.
    ///
    /// `R` is re-orthonormalized before conversion, so small numerical drift in
    /// ground-truth files is tolerated.
    pub fn from_rt_matrix(rt: &Mat34) -> Self {
        let r: Mat3 = rt.fixed_view::<3, 3>(0, 0).into_owned();
        let t: Vec3 = rt.column(3).into_owned();
        let rot = Rotation3::from_matrix(&r);
        Self::new(rot.scaled_axis(), t)
    }

    pub fn rotation_matrix(&self) -> Mat3 {
        Rotation3::new(self.rotation).into_inner()
    }

    pub fn to_isometry(&self) -> Iso3 {
        Iso3::from_parts(
            Translation3::from(self.translation),
            UnitQuaternion::new(self.rotation),
        )
    }

    pub fn transform_point(&self, p: &Vec3) -> Vec3 {
        self.rotation_matrix() * p + self.translation
    }

    /// Motion from the current frame back to the previous one.
    pub fn inverse(&self) -> Self {
        Self::from_isometry(&self.to_isometry().inverse())
    }
}
