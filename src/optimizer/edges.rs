//! Residual blocks of the alignment graph.
//!
//! All blocks act on the single similarity vertex, parameterized as
//! `x = [ω (3), t (3), ln s]` with `T(x) p = s Exp(ω) p + t`.

use nalgebra::{Matrix3, SMatrix, Vector3};

use crate::geometry::{Sim3, pose, right_jacobian_so3, skew};
use crate::map::cloud::is_finite;

/// Jacobian of a 3-vector residual with respect to the 7 vertex parameters.
pub type Jacobian3x7 = SMatrix<f64, 3, 7>;
/// Jacobian of a scalar residual with respect to the 7 vertex parameters.
pub type Jacobian1x7 = SMatrix<f64, 1, 7>;

/// Step of the central difference used for the pitch Jacobian.
const PITCH_DIFF_STEP: f64 = 1e-6;

/// Jacobian of `T(x) p` with respect to `x`.
fn point_jacobian(sim3: &Sim3, rotation_vector: &Vector3<f64>, p: &Vector3<f64>) -> Jacobian3x7 {
    let rotation = sim3.rotation_matrix();
    let rotated = rotation * p;

    let mut j = Jacobian3x7::zeros();
    j.fixed_view_mut::<3, 3>(0, 0)
        .copy_from(&(-sim3.scale * rotation * skew(p) * right_jacobian_so3(rotation_vector)));
    j.fixed_view_mut::<3, 3>(0, 3).copy_from(&Matrix3::identity());
    j.fixed_view_mut::<3, 1>(0, 6).copy_from(&(sim3.scale * rotated));
    j
}

/// Generalized-ICP edge between one source landmark and its matched map point.
///
/// The error is `T source - target`, whitened by `S` where `Sᵀ S` is the
/// information matrix. With a finite target normal `n` the information is
/// `n nᵀ + ε (I - n nᵀ)`: full weight along the normal, `ε` in the tangent
/// plane. Otherwise it is the identity.
#[derive(Debug, Clone)]
pub struct GicpEdge {
    pub source: Vector3<f64>,
    pub target: Vector3<f64>,
    sqrt_information: Matrix3<f64>,
}

impl GicpEdge {
    pub fn point_to_point(source: Vector3<f64>, target: Vector3<f64>) -> Self {
        Self {
            source,
            target,
            sqrt_information: Matrix3::identity(),
        }
    }

    pub fn with_normal(
        source: Vector3<f64>,
        target: Vector3<f64>,
        normal: &Vector3<f64>,
        precision_floor: f64,
    ) -> Self {
        let norm = normal.norm();
        if !is_finite(normal) || norm < 1e-12 {
            return Self::point_to_point(source, target);
        }
        let n = normal / norm;
        let along = n * n.transpose();
        let tangent = Matrix3::identity() - along;

        // along and tangent are orthogonal projectors, so S² = along + ε tangent
        Self {
            source,
            target,
            sqrt_information: along + precision_floor.max(0.0).sqrt() * tangent,
        }
    }

    #[cfg(test)]
    fn information(&self) -> Matrix3<f64> {
        self.sqrt_information.transpose() * self.sqrt_information
    }

    /// Whitened error `S (T source - target)`.
    pub fn whitened_error(&self, sim3: &Sim3) -> Vector3<f64> {
        self.sqrt_information * (sim3.transform_point(&self.source) - self.target)
    }

    pub fn jacobian(&self, sim3: &Sim3, rotation_vector: &Vector3<f64>) -> Jacobian3x7 {
        self.sqrt_information * point_jacobian(sim3, rotation_vector, &self.source)
    }
}

/// Soft priors on the vertex. They are not robustified.
///
/// The vertex is a correction applied on top of an existing alignment, so the
/// scale and pitch priors act on the composed transform `T ∘ base`.
#[derive(Debug, Clone)]
pub enum Restriction {
    /// Pulls the composed scale towards 1: `g (1 - s s_base)`.
    Scale { gain: f64, base_scale: f64 },
    /// Pulls the composed pitch towards 0: `g pitch(R R_base)`.
    Pitch { gain: f64, base_rotation: Matrix3<f64> },
    /// Pulls the raw camera position (already in the base-aligned frame) onto
    /// the constant-velocity prediction: `g (T raw_position - predicted)`.
    MotionModel {
        gain: f64,
        raw_position: Vector3<f64>,
        predicted: Vector3<f64>,
    },
}

impl Restriction {
    pub fn gain(&self) -> f64 {
        match self {
            Restriction::Scale { gain, .. }
            | Restriction::Pitch { gain, .. }
            | Restriction::MotionModel { gain, .. } => *gain,
        }
    }

    /// Number of scalar residuals.
    pub fn dimension(&self) -> usize {
        match self {
            Restriction::Scale { .. } | Restriction::Pitch { .. } => 1,
            Restriction::MotionModel { .. } => 3,
        }
    }

    /// Writes this block's residuals into `out` (length `dimension()`).
    pub fn residuals(&self, sim3: &Sim3, out: &mut [f64]) {
        match self {
            Restriction::Scale { gain, base_scale } => {
                out[0] = gain * (1.0 - sim3.scale * base_scale)
            }
            Restriction::Pitch {
                gain,
                base_rotation,
            } => out[0] = gain * pose::pitch(&(sim3.rotation_matrix() * base_rotation)),
            Restriction::MotionModel {
                gain,
                raw_position,
                predicted,
            } => {
                let e = *gain * (sim3.transform_point(raw_position) - predicted);
                out.copy_from_slice(e.as_slice());
            }
        }
    }

    /// Rows of the Jacobian, one per residual, flattened row-major.
    pub fn jacobian(&self, sim3: &Sim3, params: &[f64; 7]) -> Vec<[f64; 7]> {
        match self {
            Restriction::Scale { gain, base_scale } => {
                let mut row = [0.0; 7];
                row[6] = -gain * sim3.scale * base_scale;
                vec![row]
            }
            Restriction::Pitch {
                gain,
                base_rotation,
            } => {
                let pitch_at = |x: &[f64; 7]| pose::pitch(&(Sim3::exp(x).rotation_matrix() * base_rotation));
                let mut row = [0.0; 7];
                for (k, entry) in row.iter_mut().take(3).enumerate() {
                    let mut plus = *params;
                    let mut minus = *params;
                    plus[k] += PITCH_DIFF_STEP;
                    minus[k] -= PITCH_DIFF_STEP;
                    *entry = gain * (pitch_at(&plus) - pitch_at(&minus)) / (2.0 * PITCH_DIFF_STEP);
                }
                vec![row]
            }
            Restriction::MotionModel {
                gain, raw_position, ..
            } => {
                let omega = Vector3::new(params[0], params[1], params[2]);
                let j = *gain * point_jacobian(sim3, &omega, raw_position);
                (0..3)
                    .map(|r| {
                        let mut row = [0.0; 7];
                        for (c, entry) in row.iter_mut().enumerate() {
                            *entry = j[(r, c)];
                        }
                        row
                    })
                    .collect()
            }
        }
    }
}
