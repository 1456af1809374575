//! Per-frame results and diagnostics of the fusion loop.
//!
//! These types describe what happened during one frame:
//! - effective tracking state
//! - raw and fused poses
//! - correspondence counts of each refinement iteration
//! - timing information for profiling

use nalgebra::Matrix4;

use crate::tracking::TrackingState;

/// What `FusionController::execute` did with a frame.
#[derive(Debug, Clone)]
pub enum FrameOutcome {
    /// The tracker had no frame to offer; nothing changed.
    Skipped,
    Fused(FusionResult),
}

impl FrameOutcome {
    pub fn fused(&self) -> Option<&FusionResult> {
        match self {
            FrameOutcome::Fused(result) => Some(result),
            FrameOutcome::Skipped => None,
        }
    }
}

/// One refinement iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationReport {
    /// Correspondences found before rejection.
    pub raw_correspondences: usize,
    /// Correspondences kept by the distance rejection.
    pub kept_correspondences: usize,
    pub rejection_distance: f64,
    pub delta_translation: f64,
    pub delta_rotation: f64,
    /// False when no correspondence survived and the solve was skipped.
    pub solved: bool,
}

/// Summary of one fused frame. Informational only.
#[derive(Debug, Clone)]
pub struct FusionResult {
    pub frame: u64,
    /// State after the reset flag was applied.
    pub state: TrackingState,
    pub raw_pose: Matrix4<f64>,
    pub fused_pose: Matrix4<f64>,
    pub iterations: Vec<IterationReport>,
    /// Whether the convergence test passed.
    pub converged: bool,
    pub landmarks: usize,
    pub local_map_rebuilt: bool,
    pub accuracy: f64,
    pub scale_gain: f64,
    pub timing: TimingStats,
}

impl FusionResult {
    pub fn iterations_run(&self) -> usize {
        self.iterations.len()
    }

    pub fn final_correspondences(&self) -> usize {
        self.iterations.last().map_or(0, |it| it.kept_correspondences)
    }
}

/// Timing breakdown for a frame.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimingStats {
    pub total_ms: f64,
    pub tracker_ms: f64,
    pub local_map_ms: f64,
    pub refine_ms: f64,
}
