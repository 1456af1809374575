//! Nearest-neighbour index over a point cloud.
//!
//! Built once per cloud with kiddo's balanced immutable tree, which accepts
//! any number of points sharing a coordinate (flat floors, voxelized maps,
//! repeated points). Non-finite points are left out of the tree.

use kiddo::{ImmutableKdTree, SquaredEuclidean};
use nalgebra::Vector3;

use super::cloud::{PointCloud, is_finite};

/// A neighbour returned by [`PointIndex::nearest_n`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Neighbor {
    /// Index into the indexed cloud.
    pub index: usize,
    /// Squared Euclidean distance to the query.
    pub distance_sq: f64,
}

pub struct PointIndex {
    tree: Option<ImmutableKdTree<f64, 3>>,
    /// Tree item to cloud index; only finite points are in the tree.
    cloud_indices: Vec<usize>,
}

impl PointIndex {
    pub fn build(cloud: &PointCloud) -> Self {
        let mut positions = Vec::with_capacity(cloud.len());
        let mut cloud_indices = Vec::with_capacity(cloud.len());
        for (i, p) in cloud.iter().enumerate() {
            if is_finite(p) {
                positions.push([p.x, p.y, p.z]);
                cloud_indices.push(i);
            }
        }

        let tree = if positions.is_empty() {
            None
        } else {
            Some(ImmutableKdTree::new_from_slice(&positions))
        };
        Self { tree, cloud_indices }
    }

    pub fn empty() -> Self {
        Self {
            tree: None,
            cloud_indices: Vec::new(),
        }
    }

    /// Number of indexed (finite) points.
    pub fn len(&self) -> usize {
        self.cloud_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cloud_indices.is_empty()
    }

    /// Up to `k` nearest points, closest first.
    pub fn nearest_n(&self, query: &Vector3<f64>, k: usize) -> Vec<Neighbor> {
        let Some(tree) = &self.tree else {
            return Vec::new();
        };
        tree.nearest_n::<SquaredEuclidean>(&[query.x, query.y, query.z], k)
            .into_iter()
            .filter_map(|n| {
                let index = *self.cloud_indices.get(n.item as usize)?;
                Some(Neighbor {
                    index,
                    distance_sq: n.distance,
                })
            })
            .collect()
    }
}

impl Default for PointIndex {
    fn default() -> Self {
        Self::empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Exact z = 0 grid plus many copies of one point.
    fn flat_floor_with_duplicates() -> PointCloud {
        let mut cloud: PointCloud = (0..2000)
            .map(|i| Vector3::new((i % 50) as f64 * 0.1, (i / 50) as f64 * 0.1, 0.0))
            .collect();
        cloud.extend(std::iter::repeat_n(Vector3::new(1.0, 2.0, 3.0), 100));
        cloud
    }

    #[test]
    fn test_flat_floor_and_duplicates_build() {
        let cloud = flat_floor_with_duplicates();
        let index = PointIndex::build(&cloud);
        assert_eq!(index.len(), 2100);

        let near_floor = index.nearest_n(&Vector3::new(0.52, 0.31, 0.05), 1);
        assert_eq!(near_floor.len(), 1);
        assert_eq!(near_floor[0].index, 3 * 50 + 5);

        let near_copies = index.nearest_n(&Vector3::new(1.0, 2.0, 3.1), 5);
        assert_eq!(near_copies.len(), 5);
        for n in &near_copies {
            assert!(n.index >= 2000);
            assert!((n.distance_sq - 0.01).abs() < 1e-9);
        }
    }

    #[test]
    fn test_skips_non_finite_and_maps_indices() {
        let cloud = PointCloud(vec![
            Vector3::new(f64::NAN, 0.0, 0.0),
            Vector3::new(5.0, 0.0, 0.0),
            Vector3::new(0.0, 0.0, 0.0),
        ]);
        let index = PointIndex::build(&cloud);
        assert_eq!(index.len(), 2);

        let nearest = index.nearest_n(&Vector3::new(4.0, 0.0, 0.0), 2);
        assert_eq!(nearest[0].index, 1);
        assert_eq!(nearest[1].index, 2);
    }

    #[test]
    fn test_empty_cloud_has_no_neighbors() {
        let index = PointIndex::build(&PointCloud::new());
        assert!(index.is_empty());
        assert!(index.nearest_n(&Vector3::zeros(), 3).is_empty());
    }
}
