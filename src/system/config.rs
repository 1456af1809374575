//! YAML configuration.
//!
//! Every section has defaults, so a config file only needs the keys it
//! changes. `Config::validate` runs before the fusion loop starts; the loop
//! itself never sees an invalid configuration.

use std::path::Path;

use anyhow::{Context, Result, bail, ensure};
use nalgebra::Matrix4;
use serde::{Deserialize, Serialize};

use crate::map::LocalMapParams;
use crate::optimizer::AlignerConfig;
use crate::tracking::{DensityConfig, GainConfig};

/// Bounded refinement loop of one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementConfig {
    /// Iteration budget per frame.
    pub iterations: usize,
    /// Rejection distance of the last iteration (metres).
    pub distance_min: f64,
    /// Rejection distance of the first iteration (metres).
    pub distance_max: f64,
    /// Stop once the fused translation moves less than this (metres)...
    pub converge_translation: f64,
    /// ...and the chordal rotation change is below this.
    pub converge_rotation: f64,
}

impl Default for RefinementConfig {
    fn default() -> Self {
        Self {
            iterations: 5,
            distance_min: 0.5,
            distance_max: 2.0,
            converge_translation: 0.01,
            converge_rotation: 0.01,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Candidates examined per source point.
    pub k_search: usize,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self { k_search: 10 }
    }
}

/// Rerun viewer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerConfig {
    pub application_id: String,
    /// Frame notices buffered for the viewer thread before they are dropped.
    pub queue_capacity: usize,
}

impl Default for ViewerConfig {
    fn default() -> Self {
        Self {
            application_id: "rust-vllm".to_string(),
            queue_capacity: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Initial alignment of the tracker frame in the map, 16 values row-major.
    pub t_init: Vec<f64>,
    pub map: LocalMapParams,
    pub refinement: RefinementConfig,
    pub solver: AlignerConfig,
    pub estimator: EstimatorConfig,
    pub gains: GainConfig,
    pub density: DensityConfig,
    pub viewer: ViewerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            t_init: Matrix4::<f64>::identity().transpose().as_slice().to_vec(),
            map: LocalMapParams::default(),
            refinement: RefinementConfig::default(),
            solver: AlignerConfig::default(),
            estimator: EstimatorConfig::default(),
            gains: GainConfig::default(),
            density: DensityConfig::default(),
            viewer: ViewerConfig::default(),
        }
    }
}

impl Config {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(text).context("failed to parse YAML")?;
        config.validate()?;
        Ok(config)
    }

    /// `t_init` as a matrix. Only meaningful after `validate`.
    pub fn initial_pose(&self) -> Matrix4<f64> {
        if self.t_init.len() == 16 {
            Matrix4::from_row_slice(&self.t_init)
        } else {
            Matrix4::identity()
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.t_init.len() == 16,
            "t_init must have 16 entries (row-major 4x4), got {}",
            self.t_init.len()
        );
        ensure!(
            self.t_init.iter().all(|v| v.is_finite()),
            "t_init contains non-finite entries"
        );
        ensure!(
            self.t_init[12..] == [0.0, 0.0, 0.0, 1.0],
            "t_init bottom row must be [0, 0, 0, 1], got {:?}",
            &self.t_init[12..]
        );

        self.map.validate()?;

        let r = &self.refinement;
        ensure!(r.iterations > 0, "refinement.iterations must be positive");
        if !(r.distance_min >= 0.0 && r.distance_min <= r.distance_max) {
            bail!(
                "refinement.distance_min ({}) must be in [0, distance_max ({})]",
                r.distance_min,
                r.distance_max
            );
        }
        ensure!(
            r.converge_translation > 0.0 && r.converge_rotation > 0.0,
            "refinement convergence thresholds must be positive"
        );

        ensure!(self.solver.iterations > 0, "solver.iterations must be positive");
        ensure!(self.solver.huber_delta > 0.0, "solver.huber_delta must be positive");
        ensure!(
            (0.0..=1.0).contains(&self.solver.plane_precision_floor),
            "solver.plane_precision_floor must be in [0, 1]"
        );
        ensure!(self.estimator.k_search > 0, "estimator.k_search must be positive");

        let g = &self.gains;
        ensure!(
            g.scale >= 0.0 && g.pitch >= 0.0 && g.model >= 0.0,
            "restriction gains must be non-negative"
        );
        ensure!(g.recovery_frames > 0, "gains.recovery_frames must be positive");

        let d = &self.density;
        ensure!(
            d.low_watermark <= d.high_watermark,
            "density.low_watermark ({}) exceeds density.high_watermark ({})",
            d.low_watermark,
            d.high_watermark
        );
        ensure!(
            0.0 <= d.min_accuracy && d.min_accuracy <= d.max_accuracy && d.max_accuracy <= 1.0,
            "density accuracy bounds must satisfy 0 <= min <= max <= 1"
        );
        ensure!(d.step > 0.0, "density.step must be positive");
        Ok(())
    }
}
