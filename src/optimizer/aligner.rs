//! Similarity alignment of the visual landmarks against the local map.
//!
//! One solve builds a fresh graph: a single Sim(3) vertex initialized at the
//! identity, one GICP edge per correspondence and the restriction priors.
//! The source points are the landmarks already moved by the current
//! alignment, so the estimate is a correction `ΔT`; the caller composes it as
//! `T_align ← ΔT T_align`.

use levenberg_marquardt::LeastSquaresProblem;
use nalgebra::{DMatrix, DVector, Dyn, Matrix4, Owned, Vector3};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::geometry::Sim3;
use crate::map::cloud::{NormalCloud, PointCloud, is_finite};
use crate::matching::Correspondence;

use super::edges::{GicpEdge, Restriction};
use super::solver::{SolverSummary, solve_fixed_iterations};

/// Number of parameters of the similarity vertex.
const VERTEX_DIM: usize = 7;

/// Solver settings of the alignment graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlignerConfig {
    /// Damped Gauss-Newton iterations per solve.
    pub iterations: usize,
    /// Huber threshold on the whitened GICP error (metres).
    pub huber_delta: f64,
    /// Tangent-plane precision of the point-to-plane information.
    pub plane_precision_floor: f64,
}

impl Default for AlignerConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            huber_delta: 1.0,
            plane_precision_floor: 0.01,
        }
    }
}

/// Gains of the three restriction priors. A gain of 0 disables the prior.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RestrictionGains {
    pub scale: f64,
    pub pitch: f64,
    pub model: f64,
}

/// Typed handle of the similarity vertex of a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VertexHandle(usize);

/// The least-squares problem handed to the solver.
pub struct AlignmentGraph {
    params: DVector<f64>,
    estimate: Sim3,
    gicp: Vec<GicpEdge>,
    restrictions: Vec<Restriction>,
    huber_delta: f64,
}

impl AlignmentGraph {
    fn new(huber_delta: f64) -> Self {
        Self {
            params: DVector::from_row_slice(&Sim3::identity().log()),
            estimate: Sim3::identity(),
            gicp: Vec::new(),
            restrictions: Vec::new(),
            huber_delta,
        }
    }

    #[cfg(test)]
    fn num_restrictions(&self) -> usize {
        self.restrictions.len()
    }

    fn num_residuals(&self) -> usize {
        3 * self.gicp.len() + self.restrictions.iter().map(|r| r.dimension()).sum::<usize>()
    }

    fn param_array(&self) -> [f64; VERTEX_DIM] {
        let mut x = [0.0; VERTEX_DIM];
        x.copy_from_slice(self.params.as_slice());
        x
    }

    /// IRLS weight of the Huber kernel, applied as its square root.
    fn huber_weight(&self, error_norm: f64) -> f64 {
        if error_norm <= self.huber_delta {
            1.0
        } else {
            self.huber_delta / error_norm
        }
    }
}

impl LeastSquaresProblem<f64, Dyn, Dyn> for AlignmentGraph {
    type JacobianStorage = Owned<f64, Dyn, Dyn>;
    type ParameterStorage = Owned<f64, Dyn>;
    type ResidualStorage = Owned<f64, Dyn>;

    fn set_params(&mut self, params: &DVector<f64>) {
        assert_eq!(
            params.len(),
            VERTEX_DIM,
            "similarity vertex expects {} parameters",
            VERTEX_DIM
        );
        self.params.copy_from(params);
        self.estimate = Sim3::exp(&self.param_array());
    }

    fn params(&self) -> DVector<f64> {
        self.params.clone()
    }

    fn residuals(&self) -> Option<DVector<f64>> {
        let mut r = DVector::zeros(self.num_residuals());
        let mut row = 0;

        for edge in &self.gicp {
            let e = edge.whitened_error(&self.estimate);
            let w = self.huber_weight(e.norm()).sqrt();
            r.fixed_rows_mut::<3>(row).copy_from(&(w * e));
            row += 3;
        }
        for restriction in &self.restrictions {
            let dim = restriction.dimension();
            restriction.residuals(&self.estimate, &mut r.as_mut_slice()[row..row + dim]);
            row += dim;
        }
        Some(r)
    }

    fn jacobian(&self) -> Option<DMatrix<f64>> {
        let x = self.param_array();
        let omega = Vector3::new(x[0], x[1], x[2]);
        let mut j = DMatrix::zeros(self.num_residuals(), VERTEX_DIM);
        let mut row = 0;

        for edge in &self.gicp {
            let w = self.huber_weight(edge.whitened_error(&self.estimate).norm()).sqrt();
            j.fixed_view_mut::<3, 7>(row, 0)
                .copy_from(&(w * edge.jacobian(&self.estimate, &omega)));
            row += 3;
        }
        for restriction in &self.restrictions {
            for values in restriction.jacobian(&self.estimate, &x) {
                for (c, v) in values.iter().enumerate() {
                    j[(row, c)] = *v;
                }
                row += 1;
            }
        }
        Some(j)
    }
}

/// Result of one alignment solve.
#[derive(Debug, Clone)]
pub struct AlignmentOutcome {
    pub sim3: Sim3,
    /// `[[s R, t], [0, 1]]`
    pub transform: Matrix4<f64>,
    pub summary: SolverSummary,
    pub num_edges: usize,
}

/// Builds and solves the alignment graph.
pub struct AlignmentGraphBuilder {
    config: AlignerConfig,
    graph: AlignmentGraph,
    vertex: Option<VertexHandle>,
}

impl AlignmentGraphBuilder {
    pub fn new(config: AlignerConfig) -> Self {
        let graph = AlignmentGraph::new(config.huber_delta);
        Self {
            config,
            graph,
            vertex: None,
        }
    }

    /// Adds the similarity vertex at the identity. A graph has one vertex;
    /// calling this again returns the same handle.
    pub fn add_vertex(&mut self) -> VertexHandle {
        *self.vertex.get_or_insert(VertexHandle(0))
    }

    fn check(&self, vertex: VertexHandle) {
        assert_eq!(self.vertex, Some(vertex), "unknown vertex handle {:?}", vertex);
    }

    /// One GICP edge per correspondence, from `source[c.query]` to
    /// `target[c.target]`. Point-to-plane information is used where
    /// `target_normals` has a finite normal for the match. Returns the number
    /// of edges added; correspondences with out-of-range indices or
    /// non-finite points are skipped.
    pub fn add_gicp_edges(
        &mut self,
        vertex: VertexHandle,
        source: &PointCloud,
        target: &PointCloud,
        correspondences: &[Correspondence],
        target_normals: Option<&NormalCloud>,
    ) -> usize {
        self.check(vertex);
        let before = self.graph.gicp.len();

        for c in correspondences {
            let (Some(src), Some(tgt)) = (source.get(c.query), target.get(c.target)) else {
                continue;
            };
            if !is_finite(src) || !is_finite(tgt) {
                continue;
            }
            let edge = match target_normals.and_then(|n| n.get(c.target)) {
                Some(normal) => {
                    GicpEdge::with_normal(*src, *tgt, normal, self.config.plane_precision_floor)
                }
                None => GicpEdge::point_to_point(*src, *tgt),
            };
            self.graph.gicp.push(edge);
        }
        self.graph.gicp.len() - before
    }

    /// Adds a restriction prior unless its gain is 0.
    pub fn add_restriction(&mut self, vertex: VertexHandle, restriction: Restriction) {
        self.check(vertex);
        if restriction.gain() != 0.0 {
            self.graph.restrictions.push(restriction);
        }
    }

    /// Adds the scale, pitch and motion-model priors.
    ///
    /// `base` is the alignment the vertex is composed onto; `raw_position` is
    /// the raw camera position already moved by `base`.
    pub fn add_restrictions(
        &mut self,
        vertex: VertexHandle,
        gains: RestrictionGains,
        base: &Sim3,
        raw_position: Vector3<f64>,
        predicted: Vector3<f64>,
    ) {
        self.add_restriction(
            vertex,
            Restriction::Scale {
                gain: gains.scale,
                base_scale: base.scale,
            },
        );
        self.add_restriction(
            vertex,
            Restriction::Pitch {
                gain: gains.pitch,
                base_rotation: base.rotation_matrix(),
            },
        );
        self.add_restriction(
            vertex,
            Restriction::MotionModel {
                gain: gains.model,
                raw_position,
                predicted,
            },
        );
    }

    #[cfg(test)]
    fn graph(&self) -> &AlignmentGraph {
        &self.graph
    }

    /// Runs the solver for the configured number of iterations and returns
    /// the estimate of `vertex`.
    pub fn solve(mut self, vertex: VertexHandle) -> AlignmentOutcome {
        self.check(vertex);
        let summary = solve_fixed_iterations(&mut self.graph, self.config.iterations);

        let params = self.graph.params();
        assert_eq!(params.len(), VERTEX_DIM, "solver returned a malformed vertex");
        let sim3 = self.graph.estimate.clone();
        debug!(
            "Alignment solve: {} GICP edges, {} priors, cost {:.4e} -> {:.4e}, scale {:.4}",
            self.graph.gicp.len(),
            self.graph.restrictions.len(),
            summary.initial_cost,
            summary.final_cost,
            sim3.scale
        );

        AlignmentOutcome {
            transform: sim3.to_matrix(),
            num_edges: self.graph.gicp.len(),
            sim3,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    use crate::geometry::pose;

    fn random_cloud(n: usize, seed: u64) -> PointCloud {
        let mut rng = StdRng::seed_from_u64(seed);
        (0..n)
            .map(|_| {
                Vector3::new(
                    rng.gen_range(-5.0..5.0),
                    rng.gen_range(-5.0..5.0),
                    rng.gen_range(-2.0..2.0),
                )
            })
            .collect()
    }

    fn identity_correspondences(n: usize) -> Vec<Correspondence> {
        (0..n)
            .map(|i| Correspondence {
                query: i,
                target: i,
                distance: 0.0,
            })
            .collect()
    }

    fn zero_gains() -> RestrictionGains {
        RestrictionGains {
            scale: 0.0,
            pitch: 0.0,
            model: 0.0,
        }
    }

    fn solve_pair(
        source: &PointCloud,
        target: &PointCloud,
        gains: RestrictionGains,
        huber_delta: f64,
    ) -> AlignmentOutcome {
        let mut builder = AlignmentGraphBuilder::new(AlignerConfig {
            huber_delta,
            ..AlignerConfig::default()
        });
        let v = builder.add_vertex();
        builder.add_gicp_edges(v, source, target, &identity_correspondences(source.len()), None);
        builder.add_restrictions(v, gains, &Sim3::identity(), Vector3::zeros(), Vector3::zeros());
        builder.solve(v)
    }

    #[test]
    fn test_recovers_known_similarity() {
        let truth = Sim3 {
            rotation: UnitQuaternion::from_euler_angles(0.05, -0.03, 0.1),
            translation: Vector3::new(0.3, -0.2, 0.1),
            scale: 1.1,
        };
        let source = random_cloud(60, 7);
        let target: PointCloud = source.iter().map(|p| truth.transform_point(p)).collect();

        let outcome = solve_pair(&source, &target, zero_gains(), 100.0);
        assert_relative_eq!(outcome.transform, truth.to_matrix(), epsilon = 1e-4);
        assert!(outcome.summary.final_cost < 1e-8);
        assert_eq!(outcome.num_edges, 60);
    }

    #[test]
    fn test_identity_when_already_aligned() {
        let source = random_cloud(20, 3);
        let outcome = solve_pair(&source, &source.clone(), zero_gains(), 1.0);
        assert_relative_eq!(outcome.transform, Matrix4::identity(), epsilon = 1e-9);
    }

    #[test]
    fn test_huber_limits_outlier_influence() {
        let truth = Sim3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::new(0.2, 0.0, 0.0),
            scale: 1.0,
        };
        let source = random_cloud(40, 11);
        let mut target: PointCloud = source.iter().map(|p| truth.transform_point(p)).collect();
        target[0] += Vector3::new(0.0, 30.0, 0.0);
        target[1] += Vector3::new(0.0, -25.0, 10.0);

        let robust = solve_pair(&source, &target, zero_gains(), 1.0);
        let plain = solve_pair(&source, &target, zero_gains(), 1e6);

        let robust_err = (pose::translation(&robust.transform) - truth.translation).norm();
        let plain_err = (pose::translation(&plain.transform) - truth.translation).norm();
        assert!(robust_err < plain_err, "robust {} plain {}", robust_err, plain_err);
    }

    #[test]
    fn test_scale_prior_pulls_towards_one() {
        let truth = Sim3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 1.5,
        };
        let source = random_cloud(30, 5);
        let target: PointCloud = source.iter().map(|p| truth.transform_point(p)).collect();

        let free = solve_pair(&source, &target, zero_gains(), 100.0);
        let held = solve_pair(
            &source,
            &target,
            RestrictionGains {
                scale: 1000.0,
                ..zero_gains()
            },
            100.0,
        );

        assert_relative_eq!(free.sim3.scale, 1.5, epsilon = 1e-4);
        assert!(held.sim3.scale < free.sim3.scale);
        assert!(held.sim3.scale >= 1.0 - 1e-6);
    }

    #[test]
    fn test_scale_prior_acts_on_composed_scale() {
        // Base already at scale 2: the prior asks the correction to halve it
        let base = Sim3 {
            rotation: UnitQuaternion::identity(),
            translation: Vector3::zeros(),
            scale: 2.0,
        };
        let mut builder = AlignmentGraphBuilder::new(AlignerConfig::default());
        let v = builder.add_vertex();
        builder.add_restrictions(
            v,
            RestrictionGains {
                scale: 1.0,
                ..zero_gains()
            },
            &base,
            Vector3::zeros(),
            Vector3::zeros(),
        );
        let outcome = builder.solve(v);
        assert_relative_eq!(outcome.sim3.scale * base.scale, 1.0, epsilon = 1e-4);
    }

    #[test]
    fn test_motion_model_prior_alone_moves_raw_position() {
        let raw = Vector3::new(1.0, 2.0, 0.0);
        let predicted = Vector3::new(1.5, 2.0, 0.2);

        let mut builder = AlignmentGraphBuilder::new(AlignerConfig::default());
        let v = builder.add_vertex();
        builder.add_restrictions(
            v,
            RestrictionGains {
                scale: 0.0,
                pitch: 0.0,
                model: 1.0,
            },
            &Sim3::identity(),
            raw,
            predicted,
        );
        assert_eq!(builder.graph().num_restrictions(), 1);

        let outcome = builder.solve(v);
        let moved = outcome.sim3.transform_point(&raw);
        assert!((moved - predicted).norm() < (raw - predicted).norm() * 0.1);
    }

    #[test]
    fn test_plane_edges_ignore_tangent_offsets() {
        // Matches slid along a plane: point-to-plane leaves the vertex at identity
        let source: PointCloud = random_cloud(30, 13).iter().map(|p| Vector3::new(p.x, p.y, 0.0)).collect();
        let target: PointCloud = source.iter().map(|p| p + Vector3::new(0.05, -0.05, 0.0)).collect();
        let normals: NormalCloud = source.iter().map(|_| Vector3::z()).collect();

        let mut builder = AlignmentGraphBuilder::new(AlignerConfig {
            plane_precision_floor: 0.0,
            ..AlignerConfig::default()
        });
        let v = builder.add_vertex();
        builder.add_gicp_edges(v, &source, &target, &identity_correspondences(30), Some(&normals));
        let outcome = builder.solve(v);

        assert!(outcome.summary.initial_cost < 1e-20);
        assert_relative_eq!(pose::translation(&outcome.transform).z, 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_zero_gain_drops_prior_and_bad_indices_are_skipped() {
        let mut builder = AlignmentGraphBuilder::new(AlignerConfig::default());
        let v = builder.add_vertex();
        assert_eq!(builder.add_vertex(), v);

        builder.add_restrictions(v, zero_gains(), &Sim3::identity(), Vector3::zeros(), Vector3::zeros());
        assert_eq!(builder.graph().num_restrictions(), 0);

        let source = PointCloud(vec![Vector3::zeros()]);
        let corrs = [Correspondence {
            query: 0,
            target: 5,
            distance: 0.0,
        }];
        assert_eq!(builder.add_gicp_edges(v, &source, &source, &corrs, None), 0);
    }

    #[test]
    #[should_panic]
    fn test_malformed_parameter_vector_panics() {
        let mut graph = AlignmentGraph::new(1.0);
        graph.set_params(&DVector::zeros(6));
    }
}
