//! Interface to the visual SLAM front-end.

use nalgebra::Matrix4;

use crate::map::cloud::{NormalCloud, PointCloud};

use super::state::TrackingState;

/// Parameters of a landmark request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LandmarkQuery {
    /// Density knob in [0, 1]: the tracker returns only landmarks whose
    /// quality is at least this value. Lower means more landmarks.
    pub accuracy: f64,
    /// How many recent keyframes the tracker may draw landmarks from.
    pub recollection: usize,
}

/// The visual tracker the fusion loop pulls from once per frame.
pub trait VisualTracker {
    /// Processes the next frame. Returns false when there was nothing to
    /// process or processing failed; the fusion loop then skips the frame.
    fn try_execute_frame(&mut self) -> bool;

    fn state(&self) -> TrackingState;

    /// Camera-to-world pose in the tracker's own frame. `None` unless tracking.
    fn camera_pose(&self) -> Option<Matrix4<f64>>;

    /// Landmarks of the current frame with their per-point normals,
    /// index-aligned.
    fn landmarks_and_normals(&self, query: &LandmarkQuery) -> (PointCloud, NormalCloud);

    /// Asks the tracker to drop its map and start over.
    fn request_reset(&mut self);
}
