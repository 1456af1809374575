//! Nearest-neighbour correspondence search between the aligned landmarks and
//! the local map.

use std::sync::Arc;

use nalgebra::Vector3;

use crate::map::PointIndex;
use crate::map::cloud::{NormalCloud, PointCloud, is_finite};

/// Pairing of a source point with a target point.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    /// Index into the source cloud.
    pub query: usize,
    /// Index into the target cloud.
    pub target: usize,
    /// Euclidean distance between the paired points (metres).
    pub distance: f64,
}

/// Finds correspondences from a source cloud into a fixed target cloud.
pub trait CorrespondenceEstimator {
    /// Replace the target. Indices in later correspondences refer to this cloud.
    fn set_target(&mut self, cloud: Arc<PointCloud>, normals: Arc<NormalCloud>);

    /// At most one correspondence per source point; source points without a
    /// candidate are skipped.
    fn determine_correspondences(
        &self,
        source: &PointCloud,
        source_normals: Option<&NormalCloud>,
    ) -> Vec<Correspondence>;
}

/// Default estimator: among the `k_search` nearest target points pick the one
/// that minimizes `d² (2 - cos²θ)`, θ being the angle between the source and
/// target normals. Without usable normals this reduces to the nearest point.
pub struct BackProjectionEstimator {
    k_search: usize,
    index: PointIndex,
    normals: Arc<NormalCloud>,
}

impl BackProjectionEstimator {
    pub fn new(k_search: usize) -> Self {
        Self {
            k_search: k_search.max(1),
            index: PointIndex::empty(),
            normals: Arc::new(NormalCloud::new()),
        }
    }

    fn normal_agreement(&self, source_normal: Option<&Vector3<f64>>, target: usize) -> f64 {
        let (Some(ns), Some(nt)) = (source_normal, self.normals.get(target)) else {
            return 1.0;
        };
        if !is_finite(ns) || !is_finite(nt) {
            return 1.0;
        }
        let denom = ns.norm() * nt.norm();
        if denom < 1e-12 {
            return 1.0;
        }
        let cos = ns.dot(nt) / denom;
        2.0 - cos * cos
    }
}

impl Default for BackProjectionEstimator {
    fn default() -> Self {
        Self::new(10)
    }
}

impl CorrespondenceEstimator for BackProjectionEstimator {
    fn set_target(&mut self, cloud: Arc<PointCloud>, normals: Arc<NormalCloud>) {
        self.index = PointIndex::build(&cloud);
        self.normals = normals;
    }

    fn determine_correspondences(
        &self,
        source: &PointCloud,
        source_normals: Option<&NormalCloud>,
    ) -> Vec<Correspondence> {
        let mut correspondences = Vec::with_capacity(source.len());
        if self.index.is_empty() {
            return correspondences;
        }

        for (i, p) in source.iter().enumerate() {
            if !is_finite(p) {
                continue;
            }
            let neighbors = self.index.nearest_n(p, self.k_search);
            let source_normal = source_normals.and_then(|n| n.get(i));

            let best = neighbors
                .iter()
                .map(|n| {
                    let weighted = n.distance_sq * self.normal_agreement(source_normal, n.index);
                    (n.index, n.distance_sq, weighted)
                })
                .min_by(|a, b| a.2.total_cmp(&b.2));

            if let Some((target, distance_sq, _)) = best {
                correspondences.push(Correspondence {
                    query: i,
                    target,
                    distance: distance_sq.sqrt(),
                });
            }
        }
        correspondences
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn line_target() -> (Arc<PointCloud>, Arc<NormalCloud>) {
        let cloud: PointCloud = (0..20)
            .map(|i| Vector3::new(i as f64 * 0.5, 0.0, 0.0))
            .collect();
        let normals: NormalCloud = cloud.iter().map(|_| Vector3::z()).collect();
        (Arc::new(cloud), Arc::new(normals))
    }

    #[test]
    fn test_nearest_without_normals() {
        let (cloud, normals) = line_target();
        let mut estimator = BackProjectionEstimator::new(5);
        estimator.set_target(cloud.clone(), normals);

        let source = PointCloud(vec![Vector3::new(2.1, 0.0, 0.3), Vector3::new(7.4, 0.2, 0.0)]);
        let corrs = estimator.determine_correspondences(&source, None);

        assert_eq!(corrs.len(), 2);
        assert_eq!(corrs[0].query, 0);
        assert_eq!(corrs[0].target, 4);
        assert_relative_eq!(
            corrs[0].distance,
            (source[0] - cloud[4]).norm(),
            epsilon = 1e-9
        );
        assert_eq!(corrs[1].target, 15);
    }

    #[test]
    fn test_normal_agreement_prefers_aligned_candidate() {
        // Two candidates at nearly the same distance, one facing the same way
        let cloud = Arc::new(PointCloud(vec![
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(-1.05, 0.0, 0.0),
        ]));
        let normals = Arc::new(NormalCloud(vec![Vector3::x(), Vector3::y()]));
        let mut estimator = BackProjectionEstimator::new(2);
        estimator.set_target(cloud, normals);

        let source = PointCloud(vec![Vector3::zeros()]);
        let source_normals = NormalCloud(vec![Vector3::y()]);

        let plain = estimator.determine_correspondences(&source, None);
        assert_eq!(plain[0].target, 0);

        let weighted = estimator.determine_correspondences(&source, Some(&source_normals));
        assert_eq!(weighted[0].target, 1);
        assert_relative_eq!(weighted[0].distance, 1.05, epsilon = 1e-12);
    }

    #[test]
    fn test_flat_target_with_repeated_points() {
        let mut cloud: PointCloud = (0..2000)
            .map(|i| Vector3::new((i % 50) as f64 * 0.2, (i / 50) as f64 * 0.2, 0.0))
            .collect();
        cloud.extend(std::iter::repeat_n(Vector3::new(1.0, 2.0, 3.0), 100));
        let normals: NormalCloud = cloud.iter().map(|_| Vector3::z()).collect();

        let mut estimator = BackProjectionEstimator::new(10);
        estimator.set_target(Arc::new(cloud), Arc::new(normals));

        let source = PointCloud(vec![Vector3::new(2.01, 4.02, 0.1), Vector3::new(1.0, 2.0, 2.9)]);
        let corrs = estimator.determine_correspondences(&source, None);

        assert_eq!(corrs.len(), 2);
        assert_eq!(corrs[0].target, 20 * 50 + 10);
        assert!(corrs[1].target >= 2000);
        assert_relative_eq!(corrs[1].distance, 0.1, epsilon = 1e-9);
    }

    #[test]
    fn test_empty_target_and_non_finite_source() {
        let mut estimator = BackProjectionEstimator::default();
        let source = PointCloud(vec![Vector3::new(1.0, 1.0, 1.0)]);
        assert!(estimator.determine_correspondences(&source, None).is_empty());

        let (cloud, normals) = line_target();
        estimator.set_target(cloud, normals);
        let source = PointCloud(vec![Vector3::new(f64::NAN, 0.0, 0.0), Vector3::new(0.0, 0.0, 0.0)]);
        let corrs = estimator.determine_correspondences(&source, None);
        assert_eq!(corrs.len(), 1);
        assert_eq!(corrs[0].query, 1);
    }
}
