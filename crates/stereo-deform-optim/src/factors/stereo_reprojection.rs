//! Stereo reprojection residual through per-bin pixel offsets.
//!
//! One term uses a tracked feature seen at four image locations (left/right x
//! previous/current frame). The previous-frame point is corrected, triangulated,
//! moved by the known relative pose and reprojected into both current images.
//!
//! Seven offset roles feed a term: `(dx, dy)` for left-previous, left-current and
//! right-current, and `dx` only for right-previous (its `y` never enters the
//! triangulation). Which parameter feeds each role is decided at assembly time
//! through [`RoleSlots`]; the formula is shared by all [`SharingVariant`]s.

use nalgebra::{DVector, Matrix3, RealField, SVector, Vector3};
use serde::{Deserialize, Serialize};
use stereo_deform_core::{
    project_pinhole, project_pinhole_right, stereo_triangulate, Mat3, RelativePose,
    StereoCorrespondence, StereoIntrinsics, Vec3,
};

/// Parameter-sharing policy between previous and current frame roles.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SharingVariant {
    /// Every role uses the offsets of the bin its own point falls in.
    #[default]
    Independent,
    /// Left-previous and left-current share the left-previous bin's offsets.
    ShareLeft,
    /// Right-previous and right-current share the right-previous bin's offsets.
    ShareRight,
    /// Both sharings: one left and one right correction per term.
    ShareBoth,
}

impl SharingVariant {
    pub fn shares_left(self) -> bool {
        matches!(self, SharingVariant::ShareLeft | SharingVariant::ShareBoth)
    }

    pub fn shares_right(self) -> bool {
        matches!(self, SharingVariant::ShareRight | SharingVariant::ShareBoth)
    }

    /// Upper bound on distinct scalar parameter blocks per term.
    pub fn max_params(self) -> usize {
        match self {
            SharingVariant::Independent => 7,
            SharingVariant::ShareLeft => 5,
            SharingVariant::ShareRight => 6,
            SharingVariant::ShareBoth => 4,
        }
    }
}

/// Index of the parameter block feeding each offset role of a term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSlots {
    pub lp_dx: usize,
    pub lp_dy: usize,
    pub lc_dx: usize,
    pub lc_dy: usize,
    pub rp_dx: usize,
    pub rc_dx: usize,
    pub rc_dy: usize,
}

impl RoleSlots {
    pub fn as_array(&self) -> [usize; 7] {
        [
            self.lp_dx, self.lp_dy, self.lc_dx, self.lc_dy, self.rp_dx, self.rc_dx, self.rc_dy,
        ]
    }

    /// Returns `true` if the wiring honours the sharing constraints of `variant`.
    pub fn respects(&self, variant: SharingVariant) -> bool {
        let left_ok =
            !variant.shares_left() || (self.lp_dx == self.lc_dx && self.lp_dy == self.lc_dy);
        let right_ok = !variant.shares_right() || self.rp_dx == self.rc_dx;
        left_ok && right_ok
    }
}

/// Offset value of every role.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleOffsets<T: RealField> {
    pub lp_dx: T,
    pub lp_dy: T,
    pub lc_dx: T,
    pub lc_dy: T,
    pub rp_dx: T,
    pub rc_dx: T,
    pub rc_dy: T,
}

impl<T: RealField> RoleOffsets<T> {
    pub fn zeros() -> Self {
        Self {
            lp_dx: T::zero(),
            lp_dy: T::zero(),
            lc_dx: T::zero(),
            lc_dy: T::zero(),
            rp_dx: T::zero(),
            rc_dx: T::zero(),
            rc_dy: T::zero(),
        }
    }

    /// Gather role values from scalar parameter blocks.
    pub fn from_params(params: &[DVector<T>], slots: &RoleSlots) -> Self {
        let at = |slot: usize| {
            debug_assert!(slot < params.len(), "slot {slot} out of range");
            debug_assert_eq!(params[slot].len(), 1, "offset blocks are scalar");
            params[slot][0].clone()
        };
        Self {
            lp_dx: at(slots.lp_dx),
            lp_dy: at(slots.lp_dy),
            lc_dx: at(slots.lc_dx),
            lc_dy: at(slots.lc_dy),
            rp_dx: at(slots.rp_dx),
            rc_dx: at(slots.rc_dx),
            rc_dy: at(slots.rc_dy),
        }
    }

    /// `sum(d_i^2)` over all seven roles. A parameter shared by two roles is
    /// counted once per role.
    pub fn sum_of_squares(&self) -> T {
        [
            &self.lp_dx,
            &self.lp_dy,
            &self.lc_dx,
            &self.lc_dy,
            &self.rp_dx,
            &self.rc_dx,
            &self.rc_dy,
        ]
        .into_iter()
        .fold(T::zero(), |acc, d| acc + d.clone() * d.clone())
    }
}

/// Known data of one term: the observed points, camera model and frame motion.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StereoTermData {
    pub left_prev: [f64; 2],
    pub left_curr: [f64; 2],
    pub right_prev: [f64; 2],
    pub right_curr: [f64; 2],
    pub intrinsics: StereoIntrinsics,
    /// Rotation matrix of the relative pose.
    pub rotation: Mat3,
    pub translation: Vec3,
}

impl StereoTermData {
    pub fn new(
        corr: &StereoCorrespondence,
        intrinsics: &StereoIntrinsics,
        pose: &RelativePose,
    ) -> Self {
        Self {
            left_prev: [corr.left_prev.x, corr.left_prev.y],
            left_curr: [corr.left_curr.x, corr.left_curr.y],
            right_prev: [corr.right_prev.x, corr.right_prev.y],
            right_curr: [corr.right_curr.x, corr.right_curr.y],
            intrinsics: *intrinsics,
            rotation: pose.rotation_matrix(),
            translation: pose.translation,
        }
    }
}

/// Residual split into its geometric part and the regularization addend.
#[derive(Debug, Clone, PartialEq)]
pub struct StereoResidualParts<T: RealField> {
    /// `[left_x, left_y, right_x, right_y]`, predicted minus observed.
    pub reprojection: SVector<T, 4>,
    /// `weight * sum(d_i^2)`, added to every reprojection component.
    pub regularization: T,
}

impl<T: RealField> StereoResidualParts<T> {
    /// Combined residual scaled by `sqrt(w)`.
    pub fn combined(&self, w: f64) -> SVector<T, 4> {
        let sqrt_w = T::from_f64(w.sqrt()).unwrap();
        self.reprojection
            .map(|r| (r + self.regularization.clone()) * sqrt_w.clone())
    }
}

/// Evaluate both parts of the stereo residual for `f64` offsets.
pub fn stereo_residual_parts(
    offsets: &RoleOffsets<f64>,
    data: &StereoTermData,
    reg_weight: f64,
) -> StereoResidualParts<f64> {
    stereo_residual_parts_generic(offsets, data, reg_weight)
}

/// Combined, weighted stereo residual for `f64` offsets.
pub fn stereo_residual(
    offsets: &RoleOffsets<f64>,
    data: &StereoTermData,
    reg_weight: f64,
    w: f64,
) -> SVector<f64, 4> {
    stereo_residual_parts_generic(offsets, data, reg_weight).combined(w)
}

/// Generic evaluator shared by the public helpers and the backend factors.
///
/// Disparity is not guarded here; degenerate correspondences are rejected when
/// tracks are accumulated.
pub(crate) fn stereo_residual_parts_generic<T: RealField>(
    offsets: &RoleOffsets<T>,
    data: &StereoTermData,
    reg_weight: f64,
) -> StereoResidualParts<T> {
    let c = |v: f64| T::from_f64(v).unwrap();

    let f = c(data.intrinsics.f);
    let cx = c(data.intrinsics.cx);
    let cy = c(data.intrinsics.cy);
    let b = c(data.intrinsics.baseline);

    // Corrected observations
    let lp_x = c(data.left_prev[0]) + offsets.lp_dx.clone();
    let lp_y = c(data.left_prev[1]) + offsets.lp_dy.clone();
    let lc_x = c(data.left_curr[0]) + offsets.lc_dx.clone();
    let lc_y = c(data.left_curr[1]) + offsets.lc_dy.clone();
    let rp_x = c(data.right_prev[0]) + offsets.rp_dx.clone();
    let rc_x = c(data.right_curr[0]) + offsets.rc_dx.clone();
    let rc_y = c(data.right_curr[1]) + offsets.rc_dy.clone();

    let p_prev = stereo_triangulate(
        f.clone(),
        cx.clone(),
        cy.clone(),
        b.clone(),
        lp_x,
        lp_y,
        rp_x,
    );

    let rot = Matrix3::from_fn(|r, k| c(data.rotation[(r, k)]));
    let t = Vector3::new(
        c(data.translation.x),
        c(data.translation.y),
        c(data.translation.z),
    );
    let p_curr = rot * p_prev + t;

    let left = project_pinhole(f.clone(), cx.clone(), cy.clone(), p_curr.clone());
    let right = project_pinhole_right(f, cx, cy, b, p_curr);

    let reprojection = SVector::<T, 4>::new(
        left.x.clone() - lc_x,
        left.y.clone() - lc_y,
        right.x.clone() - rc_x,
        right.y.clone() - rc_y,
    );
    let regularization = c(reg_weight) * offsets.sum_of_squares();

    StereoResidualParts {
        reprojection,
        regularization,
    }
}
