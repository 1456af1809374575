//! Distance-based correspondence rejection.

use super::correspondence::Correspondence;

/// Keeps the correspondences whose distance is at most `max_distance`.
pub fn reject_by_distance(correspondences: &[Correspondence], max_distance: f64) -> Vec<Correspondence> {
    correspondences
        .iter()
        .filter(|c| c.distance <= max_distance)
        .copied()
        .collect()
}

/// Rejection threshold of refinement iteration `iteration`.
///
/// Shrinks linearly from `max` at the first iteration towards `min`; it never
/// increases with the iteration index.
pub fn rejection_threshold(iteration: usize, iterations: usize, min: f64, max: f64) -> f64 {
    if iterations == 0 {
        return max;
    }
    let progress = iteration.min(iterations) as f64 / iterations as f64;
    max - (max - min) * progress
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_threshold_schedule() {
        assert_relative_eq!(rejection_threshold(0, 5, 0.5, 2.0), 2.0);
        assert_relative_eq!(rejection_threshold(1, 5, 0.5, 2.0), 1.7, epsilon = 1e-12);
        assert_relative_eq!(rejection_threshold(4, 5, 0.5, 2.0), 0.8, epsilon = 1e-12);

        let mut previous = f64::INFINITY;
        for i in 0..10 {
            let t = rejection_threshold(i, 10, 0.2, 3.0);
            assert!(t <= previous);
            assert!(t >= 0.2);
            previous = t;
        }
    }

    #[test]
    fn test_reject_keeps_boundary() {
        let corrs: Vec<Correspondence> = [0.1, 1.0, 1.5, 3.0]
            .iter()
            .enumerate()
            .map(|(i, &d)| Correspondence { query: i, target: i, distance: d })
            .collect();

        let kept = reject_by_distance(&corrs, 1.5);
        assert_eq!(kept.iter().map(|c| c.query).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(reject_by_distance(&corrs, 0.05).is_empty());
    }
}
