pub mod point_cloud;
pub mod replay;

pub use point_cloud::{load_map_csv, write_trajectory_csv};
pub use replay::{ReplayFrame, ReplayLandmark, ReplayTracker};
