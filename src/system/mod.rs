//! Fusion orchestration.
//!
//! `FusionController` runs the per-frame loop; `VllmSystem` wraps it with the
//! optional viewer thread. Results are published through `FusionShared`.

pub mod config;
pub mod fusion;
pub mod result;
pub mod shared_state;
mod vllm_system;

pub use config::{Config, EstimatorConfig, RefinementConfig, ViewerConfig};
pub use fusion::FusionController;
pub use result::{FrameOutcome, FusionResult, IterationReport, TimingStats};
pub use shared_state::{FusionShared, PublishedState, Trajectories};
pub use vllm_system::VllmSystem;
