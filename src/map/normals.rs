//! Normal estimation for maps that ship without normals.
//!
//! Each normal is the eigenvector of the smallest eigenvalue of the covariance
//! of the point's k nearest neighbours, flipped to point upwards (+z).

use nalgebra::{Matrix3, SymmetricEigen, Vector3};

use super::cloud::{NormalCloud, PointCloud, is_finite};
use super::index::PointIndex;

/// Fewer neighbours than this give no normal.
const MIN_NEIGHBORS: usize = 3;

/// Estimates a normal for every point from its `k` nearest neighbours.
///
/// Non-finite points and points without enough finite neighbours get a NaN
/// normal, so the result stays index-aligned with `cloud`.
pub fn estimate_normals(cloud: &PointCloud, k: usize) -> NormalCloud {
    let index = PointIndex::build(cloud);
    cloud
        .iter()
        .map(|p| {
            if is_finite(p) {
                normal_at(&index, cloud, p, k)
            } else {
                Vector3::repeat(f64::NAN)
            }
        })
        .collect()
}

/// Replaces the non-finite entries of `normals` with estimated ones. Returns
/// how many entries were filled.
pub fn fill_missing_normals(cloud: &PointCloud, normals: &mut NormalCloud, k: usize) -> usize {
    normals.resize(cloud.len(), Vector3::repeat(f64::NAN));
    let missing: Vec<usize> = (0..cloud.len())
        .filter(|&i| is_finite(&cloud[i]) && !is_finite(&normals[i]))
        .collect();
    if missing.is_empty() {
        return 0;
    }

    let index = PointIndex::build(cloud);
    let mut filled = 0;
    for i in missing {
        let n = normal_at(&index, cloud, &cloud[i], k);
        if is_finite(&n) {
            normals[i] = n;
            filled += 1;
        }
    }
    filled
}

fn normal_at(index: &PointIndex, cloud: &PointCloud, p: &Vector3<f64>, k: usize) -> Vector3<f64> {
    let neighbors = index.nearest_n(p, k.max(MIN_NEIGHBORS));
    if neighbors.len() < MIN_NEIGHBORS {
        return Vector3::repeat(f64::NAN);
    }

    let points: Vec<Vector3<f64>> = neighbors.iter().map(|n| cloud[n.index]).collect();
    let mean = points.iter().sum::<Vector3<f64>>() / points.len() as f64;
    let covariance = points
        .iter()
        .map(|q| (q - mean) * (q - mean).transpose())
        .sum::<Matrix3<f64>>()
        / points.len() as f64;

    let SymmetricEigen {
        eigenvalues,
        eigenvectors,
    } = covariance.symmetric_eigen();
    let normal = eigenvectors.column(eigenvalues.imin()).into_owned();

    if normal.z < 0.0 { -normal } else { normal }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn noisy_floor() -> PointCloud {
        let mut rng = StdRng::seed_from_u64(7);
        (0..400)
            .map(|i| {
                Vector3::new(
                    (i % 20) as f64 * 0.1 + rng.gen_range(-0.01..0.01),
                    (i / 20) as f64 * 0.1 + rng.gen_range(-0.01..0.01),
                    rng.gen_range(-0.002..0.002),
                )
            })
            .collect()
    }

    #[test]
    fn test_floor_normals_point_up() {
        let cloud = noisy_floor();
        let normals = estimate_normals(&cloud, 10);

        assert_eq!(normals.len(), cloud.len());
        for n in normals.iter() {
            assert_relative_eq!(n.norm(), 1.0, epsilon = 1e-9);
            assert!(n.z > 0.9, "normal {:?} not vertical", n);
        }
    }

    #[test]
    fn test_fill_only_missing() {
        let cloud = noisy_floor();
        let mut normals: NormalCloud = cloud.iter().map(|_| Vector3::x()).collect();
        normals[5] = Vector3::repeat(f64::NAN);
        normals.truncate(390);

        let filled = fill_missing_normals(&cloud, &mut normals, 10);

        assert_eq!(filled, 11);
        assert_eq!(normals.len(), cloud.len());
        assert_eq!(normals[0], Vector3::x());
        assert!(normals[5].z > 0.9);
        assert!(normals[395].z > 0.9);
    }

    #[test]
    fn test_exact_floor_with_repeated_points() {
        let mut cloud: PointCloud = (0..400)
            .map(|i| Vector3::new((i % 20) as f64 * 0.1, (i / 20) as f64 * 0.1, 0.0))
            .collect();
        // A stack of identical returns away from the floor
        cloud.extend(std::iter::repeat_n(Vector3::new(10.0, 10.0, 0.0), 40));
        let mut normals = NormalCloud::new();

        let filled = fill_missing_normals(&cloud, &mut normals, 10);

        assert_eq!(filled, 440);
        assert!(normals[..400].iter().all(|n| n.z > 0.99));
    }

    #[test]
    fn test_too_few_points_give_nan() {
        let cloud = PointCloud(vec![Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)]);
        let normals = estimate_normals(&cloud, 10);
        assert!(normals.iter().all(|n| n.x.is_nan()));
    }
}
