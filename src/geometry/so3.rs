//! Rotation helpers for the alignment Jacobians.
//!
//! Rotations are parameterized by a rotation vector φ with `R = Exp(φ)`.
//! A parameter step δ moves the rotation on the right:
//! `Exp(φ + δ) ≈ Exp(φ) Exp(Jr(φ) δ)`.

use nalgebra::{Matrix3, Vector3};

/// Below this angle the series expansion of `Jr` is used.
const SERIES_ANGLE: f64 = 1e-6;

/// Cross-product matrix: `skew(v) * u == v × u`.
#[inline]
pub fn skew(v: &Vector3<f64>) -> Matrix3<f64> {
    v.cross_matrix()
}

/// Right Jacobian of SO(3).
///
/// `Jr(φ) = I - a [φ]× + b [φ]×²` with `a = (1 - cos θ) / θ²` and
/// `b = (θ - sin θ) / θ³`, θ = |φ|.
pub fn right_jacobian_so3(phi: &Vector3<f64>) -> Matrix3<f64> {
    let theta = phi.norm();
    let k = skew(phi);

    if theta < SERIES_ANGLE {
        return Matrix3::identity() - 0.5 * k;
    }

    let a = (1.0 - theta.cos()) / theta.powi(2);
    let b = (theta - theta.sin()) / theta.powi(3);
    Matrix3::identity() - a * k + b * k * k
}
