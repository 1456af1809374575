//! Rerun-based visualization of the fusion loop.
//!
//! Entity hierarchy:
//!     status                  - Tracking state, landmark count, local map summary
//!     world/
//!         camera              - Fused camera transform
//!         trajectory/fused    - Fused trajectory (orange)
//!         trajectory/raw      - Raw visual trajectory (gray)
//!         landmarks           - Aligned landmarks (green)
//!         local_map           - Current local map (white)
//!         global_map          - Sparse whole map (dim, logged once)
//!         correspondences     - Landmark to map segments (cyan)
//!     plots/
//!         correspondences     - Kept correspondences per frame
//!         scale               - Scale of the fused pose

use std::collections::VecDeque;
use std::time::Instant;

use anyhow::{Context, Result};
use nalgebra::{Matrix4, Vector3};
use rerun::{RecordingStream, external::glam};

use crate::geometry::{Sim3, pose};
use crate::map::cloud::PointCloud;
use crate::map::{LocalMapManager, LocalmapInfo};
use crate::matching::Correspondence;
use crate::system::{FusionShared, PublishedState, Trajectories};

/// Frames used for the FPS estimate.
const FPS_WINDOW: usize = 100;

pub struct RerunVisualizer {
    rec: RecordingStream,
    frame_times: VecDeque<Instant>,
    /// Local copy of the published trajectories, extended with the new
    /// entries each frame.
    trajectories: Trajectories,
}

impl RerunVisualizer {
    /// Spawns a rerun viewer process and connects to it.
    pub fn new(app_name: &str) -> Result<Self> {
        let rec = rerun::RecordingStreamBuilder::new(app_name)
            .spawn()
            .context("failed to spawn rerun viewer")?;

        // Map frame is Z-up
        rec.log_static("world", &rerun::ViewCoordinates::RFU()).ok();

        Ok(Self {
            rec,
            frame_times: VecDeque::with_capacity(FPS_WINDOW),
            trajectories: Trajectories::default(),
        })
    }

    pub fn set_frame(&mut self, frame: u64) {
        self.rec.set_time_sequence("frame", frame as i64);

        self.frame_times.push_back(Instant::now());
        if self.frame_times.len() > FPS_WINDOW {
            self.frame_times.pop_front();
        }
    }

    /// Frames per second over the recent window.
    pub fn fps(&self) -> f64 {
        match (self.frame_times.front(), self.frame_times.back()) {
            (Some(first), Some(last)) if self.frame_times.len() >= 2 => {
                let dt = last.duration_since(*first).as_secs_f64();
                if dt > 0.0 {
                    (self.frame_times.len() - 1) as f64 / dt
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    /// Logs everything published for the current frame.
    pub fn render(&mut self, shared: &FusionShared, local_map: &LocalMapManager) {
        let published = shared.snapshot();
        let map = local_map.snapshot();
        let new = shared.trajectories_since(self.trajectories.fused.len());
        self.trajectories.raw.extend(new.raw);
        self.trajectories.fused.extend(new.fused);

        self.log_status(&published, &map.info);
        self.log_camera_pose(&published.fused_pose);
        self.log_trajectories(&self.trajectories.raw, &self.trajectories.fused);
        self.log_landmarks(&published.aligned_cloud);
        self.log_local_map(&map.cloud);
        self.log_correspondences(
            &published.aligned_cloud,
            &published.target_cloud,
            &published.correspondences,
        );
        self.log_plots(&published);
    }

    pub fn log_status(&self, published: &PublishedState, info: &LocalmapInfo) {
        let status_text = format!(
            "**{}** | Landmarks: {} | Correspondences: {} | Local map: {} tiles, {} pts (rev {}) | Scale: {:.3} | FPS: {:.1}",
            published.state,
            published.aligned_cloud.len(),
            published.correspondences.len(),
            info.tile_count,
            info.point_count,
            info.revision,
            pose::scale(&published.fused_pose),
            self.fps()
        );

        self.rec
            .log(
                "status",
                &rerun::TextDocument::new(status_text)
                    .with_media_type(rerun::MediaType::markdown()),
            )
            .ok();
    }

    pub fn log_camera_pose(&self, fused_pose: &Matrix4<f64>) {
        let sim3 = Sim3::from_matrix(fused_pose);
        let t = &sim3.translation;
        let q = &sim3.rotation;
        let translation = glam::Vec3::new(t.x as f32, t.y as f32, t.z as f32);
        let rotation = glam::Quat::from_xyzw(
            q.coords.x as f32,
            q.coords.y as f32,
            q.coords.z as f32,
            q.w as f32,
        );

        self.rec
            .log(
                "world/camera",
                &rerun::Transform3D::from_translation_rotation(translation, rotation),
            )
            .ok();
    }

    pub fn log_trajectories(&self, raw: &[Vector3<f64>], fused: &[Vector3<f64>]) {
        if raw.len() >= 2 {
            self.rec
                .log(
                    "world/trajectory/raw",
                    &rerun::LineStrips3D::new([to_f32_points(raw)])
                        .with_colors([[128u8, 128, 128]])
                        .with_radii([0.01f32]),
                )
                .ok();
        }
        if fused.len() >= 2 {
            self.rec
                .log(
                    "world/trajectory/fused",
                    &rerun::LineStrips3D::new([to_f32_points(fused)])
                        .with_colors([[255u8, 140, 0]])
                        .with_radii([0.02f32]),
                )
                .ok();
        }
    }

    pub fn log_landmarks(&self, cloud: &PointCloud) {
        if cloud.is_empty() {
            return;
        }
        self.rec
            .log(
                "world/landmarks",
                &rerun::Points3D::new(to_f32_points(cloud))
                    .with_colors([[0u8, 220, 80]])
                    .with_radii([0.03f32]),
            )
            .ok();
    }

    pub fn log_local_map(&self, cloud: &PointCloud) {
        self.rec
            .log(
                "world/local_map",
                &rerun::Points3D::new(to_f32_points(cloud))
                    .with_colors([[255u8, 255, 255]])
                    .with_radii([0.01f32]),
            )
            .ok();
    }

    /// The whole map never changes, so it is logged as static data.
    pub fn log_global_map(&self, cloud: &PointCloud) {
        if cloud.is_empty() {
            return;
        }
        self.rec
            .log_static(
                "world/global_map",
                &rerun::Points3D::new(to_f32_points(cloud))
                    .with_colors([[90u8, 90, 90]])
                    .with_radii([0.01f32]),
            )
            .ok();
    }

    pub fn log_correspondences(
        &self,
        source: &PointCloud,
        target: &PointCloud,
        correspondences: &[Correspondence],
    ) {
        let segments = correspondence_segments(source, target, correspondences);
        self.rec
            .log(
                "world/correspondences",
                &rerun::LineStrips3D::new(segments.iter().map(|s| s.to_vec()))
                    .with_colors([[0u8, 200, 255]])
                    .with_radii([0.005f32]),
            )
            .ok();
    }

    fn log_plots(&self, published: &PublishedState) {
        self.rec
            .log(
                "plots/correspondences",
                &rerun::Scalars::new([published.correspondences.len() as f64]),
            )
            .ok();
        self.rec
            .log(
                "plots/scale",
                &rerun::Scalars::new([pose::scale(&published.fused_pose)]),
            )
            .ok();
    }
}

fn to_f32_points(points: &[Vector3<f64>]) -> Vec<[f32; 3]> {
    points
        .iter()
        .map(|p| [p.x as f32, p.y as f32, p.z as f32])
        .collect()
}

/// Two-point line strips from each source point to its match. Pairs whose
/// indices fall outside either cloud are dropped.
fn correspondence_segments(
    source: &PointCloud,
    target: &PointCloud,
    correspondences: &[Correspondence],
) -> Vec<[[f32; 3]; 2]> {
    correspondences
        .iter()
        .filter_map(|c| {
            let s = source.get(c.query)?;
            let t = target.get(c.target)?;
            Some([
                [s.x as f32, s.y as f32, s.z as f32],
                [t.x as f32, t.y as f32, t.z as f32],
            ])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_correspondence_segments_skip_stale_indices() {
        let source = PointCloud(vec![Vector3::new(0.0, 0.0, 0.0), Vector3::new(1.0, 0.0, 0.0)]);
        let target = PointCloud(vec![Vector3::new(0.0, 1.0, 0.0)]);
        let corrs = [
            Correspondence {
                query: 1,
                target: 0,
                distance: 2f64.sqrt(),
            },
            Correspondence {
                query: 0,
                target: 3,
                distance: 0.1,
            },
        ];

        let segments = correspondence_segments(&source, &target, &corrs);
        assert_eq!(segments, vec![[[1.0, 0.0, 0.0], [0.0, 1.0, 0.0]]]);
    }
}
