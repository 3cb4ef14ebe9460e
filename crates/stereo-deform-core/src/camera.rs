//! Rectified stereo camera model.
//!
//! Both cameras share one focal length and principal point; the right camera
//! sits `baseline` units along +x of the left camera.

use nalgebra::{RealField, Vector2, Vector3};
use serde::{Deserialize, Serialize};

use crate::{Pt2, Real, TrackError, Vec3};

/// Fixed intrinsics of a rectified stereo pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StereoIntrinsics {
    /// Focal length in pixels, shared by x and y.
    pub f: Real,
    pub cx: Real,
    pub cy: Real,
    /// Stereo baseline in metric units.
    pub baseline: Real,
}

impl Default for StereoIntrinsics {
    fn default() -> Self {
        Self {
            f: 718.856,
            cx: 607.1928,
            cy: 185.2157,
            baseline: 0.53716,
        }
    }
}

impl StereoIntrinsics {
    /// Build from the packed `[fx, fy, cx, cy, baseline]` layout.
    ///
    /// Only `fx` is used as the focal length.
    pub fn from_packed(v: [Real; 5]) -> Self {
        if (v[0] - v[1]).abs() > 1e-9 {
            log::warn!(
                "stereo model uses a single focal length; ignoring fy={} (fx={})",
                v[1],
                v[0]
            );
        }
        Self {
            f: v[0],
            cx: v[2],
            cy: v[3],
            baseline: v[4],
        }
    }

    pub fn validate(&self) -> Result<(), TrackError> {
        let all_finite = [self.f, self.cx, self.cy, self.baseline]
            .iter()
            .all(|v| v.is_finite());
        if !all_finite {
            return Err(TrackError::InvalidIntrinsics(
                "all parameters must be finite".to_string(),
            ));
        }
        if self.f <= 0.0 {
            return Err(TrackError::InvalidIntrinsics(format!(
                "focal length must be positive, got {}",
                self.f
            )));
        }
        if self.baseline <= 0.0 {
            return Err(TrackError::InvalidIntrinsics(format!(
                "baseline must be positive, got {}",
                self.baseline
            )));
        }
        Ok(())
    }

    /// Triangulate a left/right pixel pair. No disparity guard is applied.
    pub fn triangulate(&self, left: &Pt2, right: &Pt2) -> Vec3 {
        stereo_triangulate(
            self.f,
            self.cx,
            self.cy,
            self.baseline,
            left.x,
            left.y,
            right.x,
        )
    }

    /// Project a point given in the left camera frame into the left image.
    pub fn project_left(&self, p: &Vec3) -> Pt2 {
        let uv = project_pinhole(self.f, self.cx, self.cy, *p);
        Pt2::new(uv.x, uv.y)
    }

    /// Project a point given in the left camera frame into the right image.
    pub fn project_right(&self, p: &Vec3) -> Pt2 {
        let uv = project_pinhole_right(self.f, self.cx, self.cy, self.baseline, *p);
        Pt2::new(uv.x, uv.y)
    }
}

/// Triangulate from left pixel `(xl, yl)` and right column `xr`.
///
/// `d = xl - xr`, `X = (xl - cx) b / d`, `Y = (yl - cy) b / d`, `Z = f b / d`.
pub fn stereo_triangulate<T: RealField>(
    f: T,
    cx: T,
    cy: T,
    baseline: T,
    xl: T,
    yl: T,
    xr: T,
) -> Vector3<T> {
    let disparity = xl.clone() - xr;
    Vector3::new(
        (xl - cx) * baseline.clone() / disparity.clone(),
        (yl - cy) * baseline.clone() / disparity.clone(),
        f * baseline / disparity,
    )
}

/// Pinhole projection with a single focal length. No depth epsilon.
pub fn project_pinhole<T: RealField>(f: T, cx: T, cy: T, pc: Vector3<T>) -> Vector2<T> {
    let x = pc.x.clone() / pc.z.clone();
    let y = pc.y.clone() / pc.z.clone();
    Vector2::new(f.clone() * x + cx, f * y + cy)
}

/// Pinhole projection into the right camera of a point in the left camera frame.
pub fn project_pinhole_right<T: RealField>(
    f: T,
    cx: T,
    cy: T,
    baseline: T,
    pc: Vector3<T>,
) -> Vector2<T> {
    let shifted = Vector3::new(pc.x.clone() - baseline, pc.y.clone(), pc.z.clone());
    project_pinhole(f, cx, cy, shifted)
}
