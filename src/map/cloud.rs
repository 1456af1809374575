//! Point and normal clouds.
//!
//! Both are index-aligned when paired: `normals[i]` belongs to `points[i]`.
//! Transforms always write into a new cloud so that a buffer handed to a
//! reader is never changed underneath it.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};

use nalgebra::{Matrix4, Vector3};

use crate::geometry::pose;

/// Ordered sequence of 3D points.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PointCloud(pub Vec<Vector3<f64>>);

/// Ordered sequence of unit normals. Entries may be non-finite where the
/// normal could not be estimated.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalCloud(pub Vec<Vector3<f64>>);

impl PointCloud {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    /// Returns a copy of the cloud with `transform` applied to every point.
    pub fn transformed(&self, transform: &Matrix4<f64>) -> Self {
        let linear = pose::linear_block(transform);
        let t = pose::translation(transform);
        Self(self.0.iter().map(|p| linear * p + t).collect())
    }

    /// Voxel-grid downsampling: one centroid per occupied cubic voxel.
    ///
    /// Output order follows the first occurrence of each voxel in the input.
    pub fn voxel_downsample(&self, leaf: f64) -> Self {
        if leaf <= 0.0 {
            return self.clone();
        }

        let mut order: Vec<(i64, i64, i64)> = Vec::new();
        let mut grid: HashMap<(i64, i64, i64), (usize, Vector3<f64>)> = HashMap::new();

        for p in &self.0 {
            if !is_finite(p) {
                continue;
            }
            let index = (
                (p.x / leaf).floor() as i64,
                (p.y / leaf).floor() as i64,
                (p.z / leaf).floor() as i64,
            );
            grid.entry(index)
                .and_modify(|(count, sum)| {
                    *count += 1;
                    *sum += p;
                })
                .or_insert_with(|| {
                    order.push(index);
                    (1, *p)
                });
        }

        Self(
            order
                .iter()
                .filter_map(|index| grid.get(index))
                .map(|(count, sum)| sum / *count as f64)
                .collect(),
        )
    }
}

impl NormalCloud {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self(Vec::with_capacity(capacity))
    }

    /// Rotates every normal by the rotation part of `transform` and
    /// re-normalizes it. Non-finite normals stay non-finite.
    pub fn transformed(&self, transform: &Matrix4<f64>) -> Self {
        let rotation = pose::normalized_rotation(transform);
        Self(
            self.0
                .iter()
                .map(|n| {
                    let rotated = rotation * n;
                    let norm = rotated.norm();
                    if norm > 1e-12 && norm.is_finite() {
                        rotated / norm
                    } else {
                        rotated
                    }
                })
                .collect(),
        )
    }
}

impl Deref for PointCloud {
    type Target = Vec<Vector3<f64>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for PointCloud {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl Deref for NormalCloud {
    type Target = Vec<Vector3<f64>>;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for NormalCloud {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

impl FromIterator<Vector3<f64>> for PointCloud {
    fn from_iter<I: IntoIterator<Item = Vector3<f64>>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl FromIterator<Vector3<f64>> for NormalCloud {
    fn from_iter<I: IntoIterator<Item = Vector3<f64>>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// True when every component of the vector is finite.
#[inline]
pub fn is_finite(v: &Vector3<f64>) -> bool {
    v.iter().all(|c| c.is_finite())
}
