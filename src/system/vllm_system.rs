//! Top-level system: owns the fusion controller and the optional viewer thread.
//!
//! The fusion loop runs in the caller's thread. When the viewer is enabled,
//! each fused frame sends a notice over a bounded channel; the viewer thread
//! reads the published snapshots and never blocks the loop.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::{debug, info, warn};

use crate::map::cloud::{NormalCloud, PointCloud};
use crate::map::LocalMapManager;
use crate::tracking::VisualTracker;
use crate::viz::rerun::RerunVisualizer;

use super::config::{Config, ViewerConfig};
use super::fusion::FusionController;
use super::result::FrameOutcome;
use super::shared_state::FusionShared;

pub struct VllmSystem<T: VisualTracker> {
    controller: FusionController<T>,

    /// Frame notices for the viewer thread. `None` when the viewer is off
    /// or after shutdown.
    viewer_sender: Option<Sender<u64>>,

    viewer_handle: Option<JoinHandle<()>>,
}

impl<T: VisualTracker> VllmSystem<T> {
    /// Builds the local map from the full map cloud and wires the controller.
    pub fn new(
        config: &Config,
        tracker: T,
        cloud: &PointCloud,
        normals: &NormalCloud,
        with_viewer: bool,
    ) -> Result<Self> {
        config.validate()?;
        let local_map = Arc::new(LocalMapManager::new(
            cloud,
            normals,
            config.map.clone(),
            &config.initial_pose(),
        )?);
        info!(
            "Local map ready: {} tiles, {} points",
            local_map.store().len(),
            local_map.store().num_points()
        );
        Ok(Self::with_local_map(config, tracker, local_map, with_viewer))
    }

    pub fn with_local_map(
        config: &Config,
        tracker: T,
        local_map: Arc<LocalMapManager>,
        with_viewer: bool,
    ) -> Self {
        let controller = FusionController::new(config, tracker, local_map);

        let (viewer_sender, viewer_handle) = if with_viewer {
            let (sender, receiver) = bounded::<u64>(config.viewer.queue_capacity.max(1));
            let handle = Self::spawn_viewer(
                controller.shared().clone(),
                controller.local_map().clone(),
                receiver,
                config.viewer.clone(),
            );
            (Some(sender), Some(handle))
        } else {
            (None, None)
        };

        Self {
            controller,
            viewer_sender,
            viewer_handle,
        }
    }

    fn spawn_viewer(
        shared: Arc<FusionShared>,
        local_map: Arc<LocalMapManager>,
        receiver: Receiver<u64>,
        config: ViewerConfig,
    ) -> JoinHandle<()> {
        thread::spawn(move || {
            let mut viz = match RerunVisualizer::new(&config.application_id) {
                Ok(viz) => viz,
                Err(e) => {
                    warn!("Viewer disabled: {:#}", e);
                    return;
                }
            };
            viz.log_global_map(&local_map.sparse_cloud());

            // Exits when the sender is dropped
            while let Ok(frame) = receiver.recv() {
                if shared.is_shutdown_requested() {
                    break;
                }
                viz.set_frame(frame);
                viz.render(&shared, &local_map);
            }
        })
    }

    /// Runs one fusion step and notifies the viewer when a frame was fused.
    pub fn process_frame(&mut self) -> FrameOutcome {
        let outcome = self.controller.execute();

        if let (Some(result), Some(sender)) = (outcome.fused(), &self.viewer_sender) {
            let disconnected = match sender.try_send(result.frame) {
                Ok(()) => false,
                Err(TrySendError::Full(frame)) => {
                    debug!("Viewer busy, dropping frame {}", frame);
                    false
                }
                Err(TrySendError::Disconnected(_)) => true,
            };
            if disconnected {
                debug!("Viewer thread gone");
                self.viewer_sender = None;
            }
        }

        outcome
    }

    pub fn controller(&self) -> &FusionController<T> {
        &self.controller
    }

    pub fn shared_state(&self) -> &Arc<FusionShared> {
        self.controller.shared()
    }

    pub fn local_map(&self) -> &Arc<LocalMapManager> {
        self.controller.local_map()
    }

    /// Signals shutdown and joins the viewer thread. Safe to call twice.
    pub fn shutdown(&mut self) {
        self.shared_state().request_shutdown();

        // Dropping the sender unblocks the viewer's recv
        self.viewer_sender = None;

        if let Some(handle) = self.viewer_handle.take() {
            if handle.join().is_err() {
                warn!("Viewer thread panicked");
            }
        }
    }
}

impl<T: VisualTracker> Drop for VllmSystem<T> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::{Matrix4, Vector3};

    use crate::tracking::{LandmarkQuery, TrackingState};

    /// Tracks at the identity pose and sees the same landmarks every frame.
    struct StillTracker {
        frames_left: usize,
        landmarks: PointCloud,
        resets: usize,
    }

    impl VisualTracker for StillTracker {
        fn try_execute_frame(&mut self) -> bool {
            if self.frames_left == 0 {
                return false;
            }
            self.frames_left -= 1;
            true
        }

        fn state(&self) -> TrackingState {
            TrackingState::Tracking
        }

        fn camera_pose(&self) -> Option<Matrix4<f64>> {
            Some(Matrix4::identity())
        }

        fn landmarks_and_normals(&self, _query: &LandmarkQuery) -> (PointCloud, NormalCloud) {
            let normals = self.landmarks.iter().map(|_| Vector3::z()).collect();
            (self.landmarks.clone(), normals)
        }

        fn request_reset(&mut self) {
            self.resets += 1;
        }
    }

    /// Flat floor at exactly z = 0.
    fn floor_map() -> (PointCloud, NormalCloud) {
        let cloud: PointCloud = (0..15)
            .flat_map(|a| (0..15).map(move |b| Vector3::new(a as f64 * 0.3, b as f64 * 0.3, 0.0)))
            .collect();
        let normals = cloud.iter().map(|_| Vector3::z()).collect();
        (cloud, normals)
    }

    #[test]
    fn test_process_frames_without_viewer() {
        let (cloud, normals) = floor_map();
        let tracker = StillTracker {
            frames_left: 3,
            landmarks: cloud.iter().step_by(5).copied().collect(),
            resets: 0,
        };

        let mut system = VllmSystem::new(&Config::default(), tracker, &cloud, &normals, false).unwrap();
        assert!(system.viewer_handle.is_none());

        let mut fused = 0;
        for _ in 0..5 {
            if system.process_frame().fused().is_some() {
                fused += 1;
            }
        }
        assert_eq!(fused, 3);
        assert_eq!(system.controller().frames_fused(), 3);
        assert_eq!(system.controller().tracker().resets, 0);

        // Landmarks already lie on the map, so the fused pose stays put
        let pose = system.shared_state().fused_pose();
        assert_relative_eq!(pose, Matrix4::identity(), epsilon = 1e-3);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let (cloud, normals) = floor_map();
        let tracker = StillTracker {
            frames_left: 0,
            landmarks: PointCloud::new(),
            resets: 0,
        };
        let mut system = VllmSystem::new(&Config::default(), tracker, &cloud, &normals, false).unwrap();

        system.shutdown();
        system.shutdown();
        assert!(system.shared_state().is_shutdown_requested());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let (cloud, normals) = floor_map();
        let tracker = StillTracker {
            frames_left: 0,
            landmarks: PointCloud::new(),
            resets: 0,
        };
        let mut config = Config::default();
        config.t_init = vec![1.0; 3];

        assert!(VllmSystem::new(&config, tracker, &cloud, &normals, false).is_err());
    }
}
