//! Helpers on homogeneous 4x4 poses of the form [s*R | t; 0 | 1].
//!
//! The fusion loop keeps its named transforms (`T_init`, `T_align`, raw and
//! fused camera) as plain matrices; these helpers read the blocks back out.

use std::f64::consts::{PI, TAU};

use nalgebra::{Matrix3, Matrix4, Vector3};

/// Translation column of a pose.
pub fn translation(pose: &Matrix4<f64>) -> Vector3<f64> {
    pose.fixed_view::<3, 1>(0, 3).into_owned()
}

/// Upper-left 3x3 block (s*R for a similarity transform).
pub fn linear_block(pose: &Matrix4<f64>) -> Matrix3<f64> {
    pose.fixed_view::<3, 3>(0, 0).into_owned()
}

/// Uniform scale of a pose, taken from the norm of the first column.
pub fn scale(pose: &Matrix4<f64>) -> f64 {
    linear_block(pose).column(0).norm()
}

/// Rotation block with the scale divided out.
pub fn normalized_rotation(pose: &Matrix4<f64>) -> Matrix3<f64> {
    let s = scale(pose);
    if s > 1e-10 {
        linear_block(pose) / s
    } else {
        Matrix3::identity()
    }
}

/// Heading about the map z axis, normalized to [0, 2π).
pub fn yaw(pose: &Matrix4<f64>) -> f64 {
    let r = normalized_rotation(pose);
    normalize_angle(r[(1, 0)].atan2(r[(0, 0)]))
}

/// Pitch of a rotation under the z-y-x (yaw-pitch-roll) convention.
pub fn pitch(rotation: &Matrix3<f64>) -> f64 {
    (-rotation[(2, 0)]).clamp(-1.0, 1.0).asin()
}

/// Wraps an angle into [0, 2π).
pub fn normalize_angle(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(TAU);
    // rem_euclid can round up to exactly TAU for tiny negative inputs
    if wrapped >= TAU { 0.0 } else { wrapped }
}

/// Shortest-arc distance between two headings, in [0, π].
pub fn angle_difference(a: f64, b: f64) -> f64 {
    let d = (normalize_angle(a) - normalize_angle(b)).abs();
    if d > PI { TAU - d } else { d }
}
