//! Correspondence search and rejection for the refinement loop.

pub mod correspondence;
pub mod rejection;

pub use correspondence::{BackProjectionEstimator, Correspondence, CorrespondenceEstimator};
pub use rejection::{reject_by_distance, rejection_threshold};
