//! The per-frame fusion loop.
//!
//! Each frame the controller pulls the tracker, moves the landmarks into the
//! map frame with `T_init`, and refines the correction `T_align` against the
//! local map in a bounded loop. The fused camera is `T_align · T_init · pose`.
//!
//! On tracking loss the tracker is reset and `T_init` takes the last raw
//! camera, so the new visual map starts where the old one left off. The scale
//! prior is switched off at that point and ramped back in while tracking.

use std::sync::Arc;
use std::time::Instant;

use nalgebra::Matrix4;
use tracing::{debug, info, warn};

use crate::geometry::{Sim3, pose};
use crate::map::cloud::{NormalCloud, PointCloud};
use crate::map::{LocalMapManager, LocalMapSnapshot};
use crate::matching::{
    BackProjectionEstimator, Correspondence, CorrespondenceEstimator, reject_by_distance,
    rejection_threshold,
};
use crate::optimizer::{AlignerConfig, AlignmentGraphBuilder, RestrictionGains};
use crate::tracking::{
    DensityController, LandmarkQuery, MotionModel, ScaleGainSchedule, TrackingState,
    VisualTracker,
};

use super::config::{Config, RefinementConfig};
use super::result::{FrameOutcome, FusionResult, IterationReport, TimingStats};
use super::shared_state::{FusionShared, PublishedState};

/// Drives one visual tracker against a local LiDAR map.
pub struct FusionController<T: VisualTracker, E: CorrespondenceEstimator = BackProjectionEstimator> {
    tracker: T,
    estimator: E,
    local_map: Arc<LocalMapManager>,
    /// Local map the estimator currently searches.
    target: LocalMapSnapshot,
    shared: Arc<FusionShared>,

    refinement: RefinementConfig,
    aligner: AlignerConfig,
    scale_gain: ScaleGainSchedule,
    pitch_gain: f64,
    model_gain: f64,
    density: DensityController,
    motion: MotionModel,

    t_init: Matrix4<f64>,
    t_align: Matrix4<f64>,
    last_raw_camera: Matrix4<f64>,
    last_fused_camera: Matrix4<f64>,
    last_state: TrackingState,
    frame: u64,
}

impl<T: VisualTracker> FusionController<T, BackProjectionEstimator> {
    pub fn new(config: &Config, tracker: T, local_map: Arc<LocalMapManager>) -> Self {
        let estimator = BackProjectionEstimator::new(config.estimator.k_search);
        Self::with_estimator(config, tracker, estimator, local_map)
    }
}

impl<T: VisualTracker, E: CorrespondenceEstimator> FusionController<T, E> {
    pub fn with_estimator(
        config: &Config,
        tracker: T,
        mut estimator: E,
        local_map: Arc<LocalMapManager>,
    ) -> Self {
        let t_init = config.initial_pose();
        let target = local_map.snapshot();
        estimator.set_target(target.cloud.clone(), target.normals.clone());

        Self {
            tracker,
            estimator,
            local_map,
            target,
            shared: FusionShared::new(t_init),
            refinement: config.refinement.clone(),
            aligner: config.solver.clone(),
            scale_gain: ScaleGainSchedule::new(config.gains.scale, config.gains.recovery_frames),
            pitch_gain: config.gains.pitch,
            model_gain: config.gains.model,
            density: DensityController::new(config.density.clone()),
            motion: MotionModel::new(pose::translation(&t_init)),
            t_init,
            t_align: Matrix4::identity(),
            last_raw_camera: t_init,
            last_fused_camera: t_init,
            last_state: TrackingState::default(),
            frame: 0,
        }
    }

    /// Processes one frame.
    pub fn execute(&mut self) -> FrameOutcome {
        let t_start = Instant::now();
        let mut timing = TimingStats::default();

        if !self.tracker.try_execute_frame() {
            warn!("Frame {}: tracker produced no frame, skipping", self.frame);
            return FrameOutcome::Skipped;
        }
        timing.tracker_ms = t_start.elapsed().as_secs_f64() * 1000.0;

        let query = LandmarkQuery {
            accuracy: self.density.accuracy(),
            recollection: self.density.recollection(),
        };
        let (landmarks, landmark_normals) = self.tracker.landmarks_and_normals(&query);
        let mut state = self.tracker.state();
        let tracker_pose = match state {
            TrackingState::Tracking => self.tracker.camera_pose().unwrap_or_else(Matrix4::identity),
            _ => Matrix4::identity(),
        };

        if self.shared.take_reset_request() {
            warn!("Frame {}: reset requested", self.frame);
            state = TrackingState::ResetRequested;
        }

        if self.last_state == TrackingState::Initializing && state == TrackingState::Tracking {
            self.scale_gain.restore();
        }
        self.last_state = state;

        let accuracy = self.density.update(landmarks.len());

        let mut raw_camera = self.t_init * tracker_pose;
        let source = landmarks.transformed(&self.t_init);
        let source_normals = landmark_normals.transformed(&self.t_init);

        if state.needs_recovery() {
            warn!(
                "Frame {}: tracking {}, requesting tracker reset and re-anchoring T_init",
                self.frame, state
            );
            self.tracker.request_reset();
            self.t_init = self.last_raw_camera;
            raw_camera = self.last_raw_camera;
            self.scale_gain.suspend();
        }
        if state.is_tracking() {
            self.scale_gain.ramp();
        }

        let t_map = Instant::now();
        let local_map_rebuilt = self.local_map.inform_current_pose(&self.last_fused_camera);
        self.refresh_target();
        timing.local_map_ms = t_map.elapsed().as_secs_f64() * 1000.0;

        let t_refine = Instant::now();
        let (iterations, converged, correspondences) = self.refine(&source, &source_normals, &raw_camera);
        timing.refine_ms = t_refine.elapsed().as_secs_f64() * 1000.0;

        let fused_camera = self.t_align * raw_camera;
        self.publish(state, &raw_camera, &fused_camera, &source, &source_normals, correspondences);
        self.last_raw_camera = raw_camera;

        timing.total_ms = t_start.elapsed().as_secs_f64() * 1000.0;
        let result = FusionResult {
            frame: self.frame,
            state,
            raw_pose: raw_camera,
            fused_pose: fused_camera,
            iterations,
            converged,
            landmarks: landmarks.len(),
            local_map_rebuilt,
            accuracy,
            scale_gain: self.scale_gain.current(),
            timing,
        };
        if local_map_rebuilt {
            let info = self.local_map.localmap_info();
            info!(
                "Frame {}: local map rebuilt ({} tiles, {} points)",
                self.frame, info.tile_count, info.point_count
            );
        }
        self.frame += 1;
        FrameOutcome::Fused(result)
    }

    /// Re-targets the estimator when the local map was rebuilt since the
    /// last frame.
    fn refresh_target(&mut self) {
        let snapshot = self.local_map.snapshot();
        if snapshot.info.revision != self.target.info.revision {
            self.estimator
                .set_target(snapshot.cloud.clone(), snapshot.normals.clone());
            self.target = snapshot;
        }
    }

    /// The bounded refinement loop. Returns the iteration reports, whether
    /// the convergence test passed, and the correspondences of the last
    /// iteration.
    fn refine(
        &mut self,
        source: &PointCloud,
        source_normals: &NormalCloud,
        raw_camera: &Matrix4<f64>,
    ) -> (Vec<IterationReport>, bool, Vec<Correspondence>) {
        let budget = self.refinement.iterations;
        let gains = RestrictionGains {
            scale: self.scale_gain.current(),
            pitch: self.pitch_gain,
            model: self.model_gain,
        };
        let predicted = self.motion.predict();

        let mut reports = Vec::with_capacity(budget);
        let mut correspondences = Vec::new();
        let mut converged = false;

        for i in 0..budget {
            let aligned = source.transformed(&self.t_align);
            let aligned_normals = source_normals.transformed(&self.t_align);

            let found = self
                .estimator
                .determine_correspondences(&aligned, Some(&aligned_normals));
            let rejection_distance = rejection_threshold(
                i,
                budget,
                self.refinement.distance_min,
                self.refinement.distance_max,
            );
            correspondences = reject_by_distance(&found, rejection_distance);

            let solved = !correspondences.is_empty();
            if solved {
                let base = Sim3::from_matrix(&self.t_align);
                let raw_position = pose::translation(&(self.t_align * raw_camera));

                let mut builder = AlignmentGraphBuilder::new(self.aligner.clone());
                let vertex = builder.add_vertex();
                builder.add_gicp_edges(
                    vertex,
                    &aligned,
                    &self.target.cloud,
                    &correspondences,
                    Some(self.target.normals.as_ref()),
                );
                builder.add_restrictions(vertex, gains, &base, raw_position, predicted);
                let outcome = builder.solve(vertex);
                self.t_align = outcome.sim3.compose(&base).to_matrix();
            }

            let now = self.t_align * raw_camera;
            let delta_translation =
                (pose::translation(&self.last_fused_camera) - pose::translation(&now)).norm();
            let delta_rotation = (pose::linear_block(&self.last_fused_camera) - pose::linear_block(&now))
                .norm()
                / pose::scale(&now);
            self.last_fused_camera = now;

            debug!(
                "Frame {} iter {}: correspondences {} -> {} (<= {:.2} m), update {:.4} m / {:.4}",
                self.frame,
                i,
                found.len(),
                correspondences.len(),
                rejection_distance,
                delta_translation,
                delta_rotation
            );
            reports.push(IterationReport {
                raw_correspondences: found.len(),
                kept_correspondences: correspondences.len(),
                rejection_distance,
                delta_translation,
                delta_rotation,
                solved,
            });

            if delta_translation < self.refinement.converge_translation
                && delta_rotation < self.refinement.converge_rotation
            {
                converged = true;
                break;
            }
        }
        (reports, converged, correspondences)
    }

    fn publish(
        &mut self,
        state: TrackingState,
        raw_camera: &Matrix4<f64>,
        fused_camera: &Matrix4<f64>,
        source: &PointCloud,
        source_normals: &NormalCloud,
        correspondences: Vec<Correspondence>,
    ) {
        let published = PublishedState {
            frame: Some(self.frame),
            state,
            fused_pose: *fused_camera,
            raw_pose: *raw_camera,
            aligned_cloud: Arc::new(source.transformed(&self.t_align)),
            aligned_normals: Arc::new(source_normals.transformed(&self.t_align)),
            correspondences: Arc::new(correspondences),
            target_cloud: self.target.cloud.clone(),
        };
        self.shared.publish(
            published,
            pose::translation(raw_camera),
            pose::translation(fused_camera),
        );
        self.motion.update(pose::translation(fused_camera));
    }

    pub fn shared(&self) -> &Arc<FusionShared> {
        &self.shared
    }

    pub fn local_map(&self) -> &Arc<LocalMapManager> {
        &self.local_map
    }

    pub fn tracker(&self) -> &T {
        &self.tracker
    }

    pub fn t_align(&self) -> &Matrix4<f64> {
        &self.t_align
    }

    /// Number of frames fused so far.
    pub fn frames_fused(&self) -> u64 {
        self.frame
    }
}
