//! Constant-velocity position model used by the motion-model prior.

use nalgebra::Vector3;

/// Keeps the last two fused camera positions and extrapolates the next one.
#[derive(Debug, Clone)]
pub struct MotionModel {
    /// Position of the previous frame.
    pre: Vector3<f64>,
    /// Position two frames back.
    pre_pre: Vector3<f64>,
}

impl MotionModel {
    /// Both history slots start at `position`, so the first prediction is
    /// a standstill.
    pub fn new(position: Vector3<f64>) -> Self {
        Self {
            pre: position,
            pre_pre: position,
        }
    }

    /// Roll the window with a new fused position.
    pub fn update(&mut self, position: Vector3<f64>) {
        self.pre_pre = self.pre;
        self.pre = position;
    }

    /// Predicted position of the current frame: `2 pre - pre_pre`.
    pub fn predict(&self) -> Vector3<f64> {
        2.0 * self.pre - self.pre_pre
    }
}

impl Default for MotionModel {
    fn default() -> Self {
        Self::new(Vector3::zeros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_constant_velocity_prediction() {
        let mut model = MotionModel::new(Vector3::new(1.0, 0.0, 0.0));
        assert_relative_eq!(model.predict(), Vector3::new(1.0, 0.0, 0.0));

        model.update(Vector3::new(2.0, 0.5, 0.0));
        assert_relative_eq!(model.predict(), Vector3::new(3.0, 1.0, 0.0));

        model.update(Vector3::new(2.5, 0.5, 1.0));
        assert_relative_eq!(model.predict(), Vector3::new(3.0, 0.5, 2.0));
    }
}
