//! Everything the fusion loop needs from, and keeps about, visual tracking:
//! - the `VisualTracker` interface to the front-end
//! - the tracking state machine inputs
//! - the motion model, scale-gain ramp and landmark density knob

pub mod bridge;
pub mod density;
pub mod gain;
pub mod motion_model;
pub mod state;

pub use bridge::{LandmarkQuery, VisualTracker};
pub use density::{DensityConfig, DensityController};
pub use gain::{GainConfig, ScaleGainSchedule};
pub use motion_model::MotionModel;
pub use state::TrackingState;
