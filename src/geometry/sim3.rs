//! Similarity transforms.
//!
//! Visual landmarks come with an arbitrary monocular scale, so the correction
//! onto the metric LiDAR map is a similarity `x ↦ s R x + t`. The scale is
//! left free and only softly pulled towards 1.

use nalgebra::{Matrix3, Matrix4, Rotation3, UnitQuaternion, Vector3};

/// `x ↦ s R x + t`
#[derive(Debug, Clone, PartialEq)]
pub struct Sim3 {
    pub rotation: UnitQuaternion<f64>,
    pub translation: Vector3<f64>,
    pub scale: f64,
}

impl Sim3 {
    pub fn identity() -> Self {
        Self {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.0,
        }
    }

    pub fn from_rts(rotation: Matrix3<f64>, translation: Vector3<f64>, scale: f64) -> Self {
        Self {
            rotation: UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(rotation)),
            translation,
            scale,
        }
    }

    /// Splits a homogeneous `[[s R, t], [0, 1]]` matrix. The scale is the norm
    /// of the first column of the linear block; a degenerate block yields the
    /// identity rotation.
    pub fn from_matrix(m: &Matrix4<f64>) -> Self {
        let linear = m.fixed_view::<3, 3>(0, 0).into_owned();
        let scale = linear.column(0).norm();
        let rotation = if scale > 1e-10 {
            linear / scale
        } else {
            Matrix3::identity()
        };
        Self::from_rts(rotation, m.fixed_view::<3, 1>(0, 3).into_owned(), scale)
    }

    pub fn to_matrix(&self) -> Matrix4<f64> {
        let mut m = Matrix4::identity();
        m.fixed_view_mut::<3, 3>(0, 0)
            .copy_from(&(self.rotation_matrix() * self.scale));
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&self.translation);
        m
    }

    /// `self ∘ other`, i.e. `other` is applied first.
    pub fn compose(&self, other: &Sim3) -> Self {
        Self {
            rotation: self.rotation * other.rotation,
            translation: self.transform_point(&other.translation),
            scale: self.scale * other.scale,
        }
    }

    pub fn transform_point(&self, p: &Vector3<f64>) -> Vector3<f64> {
        self.rotation * p * self.scale + self.translation
    }

    pub fn rotation_matrix(&self) -> Matrix3<f64> {
        self.rotation.to_rotation_matrix().into_inner()
    }

    /// Solver parameters `[φ, t, ln s]` with `R = Exp(φ)`.
    pub fn log(&self) -> [f64; 7] {
        let phi = self.rotation.scaled_axis();
        let t = &self.translation;
        [phi.x, phi.y, phi.z, t.x, t.y, t.z, self.scale.ln()]
    }

    /// Inverse of [`Sim3::log`].
    pub fn exp(x: &[f64; 7]) -> Self {
        Self {
            rotation: UnitQuaternion::from_scaled_axis(Vector3::new(x[0], x[1], x[2])),
            translation: Vector3::new(x[3], x[4], x[5]),
            scale: x[6].exp(),
        }
    }
}

impl Default for Sim3 {
    fn default() -> Self {
        Self::identity()
    }
}
