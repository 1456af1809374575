//! Static LiDAR map storage and the local working subset.
//!
//! - `cloud`: point/normal cloud containers and transforms
//! - `submap`: one-shot grid tiling of the full map
//! - `index`: kd-tree nearest-neighbour index over a cloud
//! - `normals`: k-nearest-neighbour normal estimation
//! - `local_map`: the pose-driven local map cache read by the aligner and viewers

pub mod cloud;
pub mod index;
pub mod local_map;
pub mod normals;
pub mod submap;

pub use cloud::{NormalCloud, PointCloud};
pub use index::{Neighbor, PointIndex};
pub use local_map::{LocalMapManager, LocalMapParams, LocalMapSnapshot, LocalmapInfo};
pub use normals::{estimate_normals, fill_missing_normals};
pub use submap::{GridKey, SubmapStore};
