//! Landmark density control.
//!
//! The accuracy knob is nudged each frame so that the landmark count stays
//! between two watermarks.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DensityConfig {
    /// Below this many landmarks the knob is lowered.
    pub low_watermark: usize,
    /// Above this many landmarks the knob is raised.
    pub high_watermark: usize,
    pub step: f64,
    pub min_accuracy: f64,
    pub max_accuracy: f64,
    pub initial_accuracy: f64,
    /// Keyframe depth of the landmark request.
    pub recollection: usize,
}

impl Default for DensityConfig {
    fn default() -> Self {
        Self {
            low_watermark: 400,
            high_watermark: 600,
            step: 0.01,
            min_accuracy: 0.01,
            max_accuracy: 0.99,
            initial_accuracy: 0.5,
            recollection: 30,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DensityController {
    config: DensityConfig,
    accuracy: f64,
}

impl DensityController {
    pub fn new(config: DensityConfig) -> Self {
        let accuracy = config
            .initial_accuracy
            .clamp(config.min_accuracy, config.max_accuracy);
        Self { config, accuracy }
    }

    pub fn accuracy(&self) -> f64 {
        self.accuracy
    }

    pub fn recollection(&self) -> usize {
        self.config.recollection
    }

    /// Adjusts the knob from this frame's landmark count and returns the new
    /// value.
    pub fn update(&mut self, landmark_count: usize) -> f64 {
        let c = &self.config;
        if landmark_count < c.low_watermark && self.accuracy > c.min_accuracy {
            self.accuracy -= c.step;
        } else if landmark_count > c.high_watermark && self.accuracy < c.max_accuracy {
            self.accuracy += c.step;
        }
        self.accuracy = self.accuracy.clamp(c.min_accuracy, c.max_accuracy);
        self.accuracy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_knob_follows_watermarks() {
        let mut density = DensityController::new(DensityConfig::default());
        assert_relative_eq!(density.update(100), 0.49, epsilon = 1e-12);
        assert_relative_eq!(density.update(500), 0.49, epsilon = 1e-12);
        assert_relative_eq!(density.update(800), 0.50, epsilon = 1e-12);
        assert_relative_eq!(density.update(400), 0.50, epsilon = 1e-12);
        assert_relative_eq!(density.update(600), 0.50, epsilon = 1e-12);
    }

    #[test]
    fn test_knob_stays_in_bounds() {
        let mut density = DensityController::new(DensityConfig {
            initial_accuracy: 0.02,
            ..DensityConfig::default()
        });
        for _ in 0..10 {
            density.update(0);
        }
        assert_relative_eq!(density.accuracy(), 0.01, epsilon = 1e-12);

        for _ in 0..200 {
            density.update(10_000);
        }
        assert!(density.accuracy() <= 0.99);
        assert_relative_eq!(density.accuracy(), 0.99, epsilon = 1e-9);
    }
}
