//! Local map maintenance.
//!
//! The `LocalMapManager` keeps the working subset of the static map around
//! the camera. It rebuilds the subset only when the camera has moved or turned
//! far enough since the last rebuild, and hands readers immutable `Arc`
//! snapshots so that a rebuild never changes a buffer somebody is reading.
//!
//! Locking:
//! - `snapshot` (RwLock): readers clone the `Arc`s; the producer takes the
//!   write lock only to swap in a finished rebuild.
//! - `center` (Mutex): serializes `inform_current_pose` calls. Readers never
//!   touch it.

use std::sync::Arc;

use anyhow::{Result, bail};
use nalgebra::{Matrix4, Vector3};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::pose;

use super::cloud::{NormalCloud, PointCloud};
use super::submap::{SubmapStore, cell_of};

/// Parameters of the local map cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalMapParams {
    /// Edge length of a square grid tile (metres).
    pub tile_size: f64,
    /// Tiles within this many cells (Chebyshev) of the camera cell are unioned.
    pub submap_radius_cells: u32,
    /// Planar displacement that triggers a rebuild (metres).
    pub recompute_distance: f64,
    /// Heading change that triggers a rebuild (degrees).
    pub recompute_angle_deg: f64,
    /// Voxel leaf of the sparse whole-map cloud handed to viewers (metres).
    pub sparse_leaf: f64,
}

impl Default for LocalMapParams {
    fn default() -> Self {
        Self {
            tile_size: 10.0,
            submap_radius_cells: 2,
            recompute_distance: 5.0,
            recompute_angle_deg: 60.0,
            sparse_leaf: 1.0,
        }
    }
}

impl LocalMapParams {
    pub fn recompute_angle(&self) -> f64 {
        self.recompute_angle_deg.to_radians()
    }

    /// The unioned area must reach at least as far as the camera may travel
    /// before the next rebuild, otherwise the camera can leave the local map.
    pub fn validate(&self) -> Result<()> {
        if !(self.tile_size.is_finite() && self.tile_size > 0.0) {
            bail!("map.tile_size must be positive, got {}", self.tile_size);
        }
        if !(self.recompute_distance.is_finite() && self.recompute_distance > 0.0) {
            bail!(
                "map.recompute_distance must be positive, got {}",
                self.recompute_distance
            );
        }
        if !(self.recompute_angle_deg > 0.0 && self.recompute_angle_deg <= 180.0) {
            bail!(
                "map.recompute_angle_deg must be in (0, 180], got {}",
                self.recompute_angle_deg
            );
        }
        let reach = self.submap_radius_cells as f64 * self.tile_size;
        if reach < self.recompute_distance {
            bail!(
                "map.submap_radius_cells * map.tile_size ({}) is smaller than map.recompute_distance ({}); \
                 the camera could leave the local map before it is rebuilt",
                reach,
                self.recompute_distance
            );
        }
        Ok(())
    }
}

/// Summary of the current local map for viewers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalmapInfo {
    /// Planar position and heading [x, y, yaw] of the last rebuild.
    pub center: Vector3<f64>,
    pub tile_size: f64,
    /// Number of tiles unioned into the local map.
    pub tile_count: usize,
    pub point_count: usize,
    /// Incremented on every rebuild.
    pub revision: u64,
}

/// Immutable view of the local map at one revision.
#[derive(Debug, Clone)]
pub struct LocalMapSnapshot {
    pub cloud: Arc<PointCloud>,
    pub normals: Arc<NormalCloud>,
    pub info: LocalmapInfo,
}

/// Maintains the local subset of a tiled static map.
pub struct LocalMapManager {
    params: LocalMapParams,
    store: SubmapStore,
    sparse_cloud: Arc<PointCloud>,
    /// [x, y, yaw] of the last rebuild.
    center: Mutex<Vector3<f64>>,
    snapshot: RwLock<LocalMapSnapshot>,
}

impl LocalMapManager {
    /// Tile the full map and build the first local map around `initial_pose`.
    pub fn new(
        cloud: &PointCloud,
        normals: &NormalCloud,
        params: LocalMapParams,
        initial_pose: &Matrix4<f64>,
    ) -> Result<Self> {
        params.validate()?;
        let store = SubmapStore::build(cloud, normals, params.tile_size);
        let sparse_cloud = Arc::new(cloud.voxel_downsample(params.sparse_leaf));
        debug!(
            "Tiled static map: {} points into {} tiles, sparse cloud {} points",
            store.num_points(),
            store.len(),
            sparse_cloud.len()
        );
        Ok(Self::from_store(store, sparse_cloud, params, initial_pose))
    }

    /// Build from an existing tiling. `params.tile_size` is taken from the store.
    pub fn from_store(
        store: SubmapStore,
        sparse_cloud: Arc<PointCloud>,
        mut params: LocalMapParams,
        initial_pose: &Matrix4<f64>,
    ) -> Self {
        params.tile_size = store.tile_size();
        let center = planar_pose(initial_pose);
        let first = assemble(&store, &params, center, 0);

        Self {
            params,
            store,
            sparse_cloud,
            center: Mutex::new(center),
            snapshot: RwLock::new(first),
        }
    }

    /// Inform the manager of the latest fused camera pose.
    ///
    /// Rebuilds the local map when the planar displacement or the heading
    /// change since the last rebuild exceeds its threshold. Returns whether a
    /// rebuild happened.
    pub fn inform_current_pose(&self, pose: &Matrix4<f64>) -> bool {
        let mut center = self.center.lock();
        let current = planar_pose(pose);

        if !self.is_update_necessary(&center, &current) {
            return false;
        }

        let revision = self.snapshot.read().info.revision + 1;
        let rebuilt = assemble(&self.store, &self.params, current, revision);
        debug!(
            "Local map rebuilt at ({:.2}, {:.2}, yaw {:.1} deg): {} tiles, {} points",
            current.x,
            current.y,
            current.z.to_degrees(),
            rebuilt.info.tile_count,
            rebuilt.info.point_count
        );

        *self.snapshot.write() = rebuilt;
        *center = current;
        true
    }

    fn is_update_necessary(&self, last: &Vector3<f64>, current: &Vector3<f64>) -> bool {
        let distance = (current.xy() - last.xy()).norm();
        if distance > self.params.recompute_distance {
            return true;
        }
        pose::angle_difference(current.z, last.z) > self.params.recompute_angle()
    }

    pub fn localmap_info(&self) -> LocalmapInfo {
        self.snapshot.read().info
    }

    pub fn target_cloud(&self) -> Arc<PointCloud> {
        self.snapshot.read().cloud.clone()
    }

    pub fn target_normals(&self) -> Arc<NormalCloud> {
        self.snapshot.read().normals.clone()
    }

    /// Cloud, normals and info taken under one lock.
    pub fn snapshot(&self) -> LocalMapSnapshot {
        self.snapshot.read().clone()
    }

    /// Downsampled whole map; never changes after construction.
    pub fn sparse_cloud(&self) -> Arc<PointCloud> {
        self.sparse_cloud.clone()
    }

    pub fn params(&self) -> &LocalMapParams {
        &self.params
    }

    pub fn store(&self) -> &SubmapStore {
        &self.store
    }
}

/// [x, y, yaw] of a pose.
fn planar_pose(pose: &Matrix4<f64>) -> Vector3<f64> {
    let t = pose::translation(pose);
    Vector3::new(t.x, t.y, pose::yaw(pose))
}

fn assemble(
    store: &SubmapStore,
    params: &LocalMapParams,
    center: Vector3<f64>,
    revision: u64,
) -> LocalMapSnapshot {
    let cell = cell_of(center.x, center.y, store.tile_size());
    let (cloud, normals, tile_count) = store.gather(cell, params.submap_radius_cells);
    let point_count = cloud.len();

    LocalMapSnapshot {
        cloud: Arc::new(cloud),
        normals: Arc::new(normals),
        info: LocalmapInfo {
            center,
            tile_size: store.tile_size(),
            tile_count,
            point_count,
            revision,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Rotation3;

    use crate::geometry::Sim3;

    fn pose_at(x: f64, y: f64, yaw_deg: f64) -> Matrix4<f64> {
        Sim3::from_rts(
            Rotation3::from_euler_angles(0.0, 0.0, yaw_deg.to_radians()).into_inner(),
            Vector3::new(x, y, 0.0),
            1.0,
        )
        .to_matrix()
    }

    /// 100 points spread over the four tiles around the origin (tile size 10).
    fn four_tile_map() -> (PointCloud, NormalCloud) {
        let mut cloud = PointCloud::new();
        for i in 0..100 {
            let quadrant = i % 4;
            let offset = (i / 4) as f64 * 0.3 + 0.5;
            let (sx, sy) = match quadrant {
                0 => (1.0, 1.0),
                1 => (-1.0, 1.0),
                2 => (-1.0, -1.0),
                _ => (1.0, -1.0),
            };
            cloud.push(Vector3::new(sx * offset, sy * offset, 0.0));
        }
        let normals = cloud.iter().map(|_| Vector3::z()).collect();
        (cloud, normals)
    }

    fn params(radius: u32) -> LocalMapParams {
        LocalMapParams {
            tile_size: 10.0,
            submap_radius_cells: radius,
            recompute_distance: 5.0,
            recompute_angle_deg: 60.0,
            sparse_leaf: 1.0,
        }
    }

    fn sorted(cloud: &PointCloud) -> Vec<[f64; 3]> {
        let mut pts: Vec<[f64; 3]> = cloud.iter().map(|p| [p.x, p.y, p.z]).collect();
        pts.sort_by(|a, b| a.partial_cmp(b).unwrap());
        pts
    }

    #[test]
    fn test_four_tile_scenario() {
        let (cloud, normals) = four_tile_map();
        let manager = LocalMapManager::new(&cloud, &normals, params(1), &pose_at(0.0, 0.0, 0.0)).unwrap();
        assert_eq!(manager.store().len(), 4);
        assert_eq!(manager.localmap_info().point_count, 100);

        let before = manager.target_cloud();
        assert!(!manager.inform_current_pose(&pose_at(4.0, 0.0, 0.0)));
        assert!(Arc::ptr_eq(&before, &manager.target_cloud()));

        assert!(manager.inform_current_pose(&pose_at(6.0, 0.0, 0.0)));
        let info = manager.localmap_info();
        assert_eq!(info.revision, 1);
        assert_eq!(info.center.x, 6.0);

        // (6, 0) lies in cell (0, 0); cells x and y in [-1, 1] cover all four
        // quadrant tiles, so every map point is back in the local map
        assert_eq!(info.tile_count, 4);
        assert_eq!(info.point_count, 100);
        let rebuilt = manager.target_cloud();
        assert_eq!(rebuilt.len(), 100);
        assert_eq!(sorted(&rebuilt), sorted(&cloud));
    }

    #[test]
    fn test_rebuild_covers_only_tiles_within_radius() {
        // One point per tile along x from -50 to 50
        let cloud: PointCloud = (-5..5).map(|i| Vector3::new(i as f64 * 10.0 + 5.0, 5.0, 0.0)).collect();
        let normals: NormalCloud = cloud.iter().map(|_| Vector3::z()).collect();
        let manager = LocalMapManager::new(&cloud, &normals, params(2), &pose_at(0.0, 0.0, 0.0)).unwrap();

        assert!(manager.inform_current_pose(&pose_at(21.0, 3.0, 0.0)));
        let xs: Vec<f64> = sorted(&manager.target_cloud()).iter().map(|p| p[0]).collect();
        assert_eq!(xs, vec![5.0, 15.0, 25.0, 35.0, 45.0]);
        assert_eq!(manager.localmap_info().tile_count, 5);
        assert_eq!(manager.target_normals().len(), 5);
    }

    #[test]
    fn test_small_motion_keeps_map() {
        let (cloud, normals) = four_tile_map();
        let manager = LocalMapManager::new(&cloud, &normals, params(1), &pose_at(0.0, 0.0, 10.0)).unwrap();
        let info = manager.localmap_info();

        for (x, y, yaw) in [(1.0, 1.0, 20.0), (-3.0, 3.9, 60.0), (0.0, -4.9, -40.0), (3.0, 3.0, 355.0)] {
            assert!(!manager.inform_current_pose(&pose_at(x, y, yaw)));
        }
        assert_eq!(manager.localmap_info(), info);
    }

    #[test]
    fn test_rotation_alone_triggers_rebuild_once() {
        let (cloud, normals) = four_tile_map();
        let manager = LocalMapManager::new(&cloud, &normals, params(1), &pose_at(0.0, 0.0, 350.0)).unwrap();

        // 350 -> 30 is a 40 degree turn across the wrap point
        assert!(!manager.inform_current_pose(&pose_at(0.0, 0.0, 30.0)));
        assert!(manager.inform_current_pose(&pose_at(0.0, 0.0, 80.0)));
        assert!(!manager.inform_current_pose(&pose_at(0.0, 0.0, 80.0)));
        assert_eq!(manager.localmap_info().revision, 1);
    }

    #[test]
    fn test_reader_snapshot_survives_rebuild() {
        let (cloud, normals) = four_tile_map();
        let manager = LocalMapManager::new(&cloud, &normals, params(1), &pose_at(0.0, 0.0, 0.0)).unwrap();

        let held = manager.snapshot();
        let held_points = sorted(&held.cloud);
        assert!(manager.inform_current_pose(&pose_at(40.0, 40.0, 0.0)));

        assert!(manager.target_cloud().is_empty());
        assert_eq!(sorted(&held.cloud), held_points);
        assert_eq!(held.info.revision, 0);
    }

    #[test]
    fn test_concurrent_readers_see_consistent_snapshots() {
        let (cloud, normals) = four_tile_map();
        let manager = Arc::new(
            LocalMapManager::new(&cloud, &normals, params(1), &pose_at(0.0, 0.0, 0.0)).unwrap(),
        );

        let reader = {
            let manager = manager.clone();
            std::thread::spawn(move || {
                for _ in 0..500 {
                    let snap = manager.snapshot();
                    assert_eq!(snap.cloud.len(), snap.info.point_count);
                    assert_eq!(snap.cloud.len(), snap.normals.len());
                }
            })
        };

        for i in 0..200 {
            let x = if i % 2 == 0 { 30.0 } else { 0.0 };
            assert!(manager.inform_current_pose(&pose_at(x, 0.0, 0.0)));
        }
        reader.join().unwrap();
    }

    #[test]
    fn test_validate_rejects_staleness_gap() {
        let mut p = params(0);
        assert!(p.validate().is_err());
        p.submap_radius_cells = 1;
        assert!(p.validate().is_ok());
        p.tile_size = 0.0;
        assert!(p.validate().is_err());
    }
}
