//! State shared between the fusion loop and its readers (viewer thread,
//! external reset requests).
//!
//! The fusion loop is the only writer. It takes the write locks once per
//! frame, for the publish step only. The trajectories grow without bound, so
//! they live under their own lock and readers copy only the entries they have
//! not seen yet; a snapshot of the per-frame state is a handful of `Arc`
//! clones.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use nalgebra::{Matrix4, Vector3};
use parking_lot::RwLock;

use crate::map::cloud::{NormalCloud, PointCloud};
use crate::matching::Correspondence;
use crate::tracking::TrackingState;

/// What the fusion loop published at the end of its last frame.
#[derive(Debug, Clone)]
pub struct PublishedState {
    /// Index of the last fused frame (0-based); `None` before the first.
    pub frame: Option<u64>,
    pub state: TrackingState,
    pub fused_pose: Matrix4<f64>,
    pub raw_pose: Matrix4<f64>,
    /// Source landmarks moved by the final alignment.
    pub aligned_cloud: Arc<PointCloud>,
    pub aligned_normals: Arc<NormalCloud>,
    /// Correspondences of the last refinement iteration, indexing
    /// `aligned_cloud` and the local map it was matched against.
    pub correspondences: Arc<Vec<Correspondence>>,
    /// Local map the correspondences refer to.
    pub target_cloud: Arc<PointCloud>,
}

impl PublishedState {
    pub fn new(initial_pose: Matrix4<f64>) -> Self {
        Self {
            frame: None,
            state: TrackingState::default(),
            fused_pose: initial_pose,
            raw_pose: initial_pose,
            aligned_cloud: Arc::new(PointCloud::new()),
            aligned_normals: Arc::new(NormalCloud::new()),
            correspondences: Arc::new(Vec::new()),
            target_cloud: Arc::new(PointCloud::new()),
        }
    }
}

/// Camera positions of every fused frame, raw and fused, index-aligned.
#[derive(Debug, Clone, Default)]
pub struct Trajectories {
    pub raw: Vec<Vector3<f64>>,
    pub fused: Vec<Vector3<f64>>,
}

/// Shared state of one fusion loop.
pub struct FusionShared {
    /// Published per-frame results. Readers take the read lock.
    published: RwLock<PublishedState>,

    /// Append-only; locked after `published` when both are held.
    trajectories: RwLock<Trajectories>,

    /// Set by any thread; consumed by the fusion loop on its next frame,
    /// which then runs the loss recovery protocol.
    pub reset_requested: AtomicBool,

    /// Request the viewer thread to exit.
    pub shutdown_requested: AtomicBool,
}

impl FusionShared {
    pub fn new(initial_pose: Matrix4<f64>) -> Arc<Self> {
        Arc::new(Self {
            published: RwLock::new(PublishedState::new(initial_pose)),
            trajectories: RwLock::new(Trajectories::default()),
            reset_requested: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        })
    }

    /// Replaces the published frame and appends one position to each
    /// trajectory.
    pub fn publish(&self, state: PublishedState, raw_position: Vector3<f64>, fused_position: Vector3<f64>) {
        let mut published = self.published.write();
        *published = state;
        let mut trajectories = self.trajectories.write();
        trajectories.raw.push(raw_position);
        trajectories.fused.push(fused_position);
    }

    pub fn request_reset(&self) {
        self.reset_requested.store(true, Ordering::SeqCst);
    }

    /// Test-and-clear of the reset flag. A request is observed exactly once.
    pub fn take_reset_request(&self) -> bool {
        self.reset_requested.swap(false, Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::SeqCst);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    pub fn fused_pose(&self) -> Matrix4<f64> {
        self.published.read().fused_pose
    }

    pub fn aligned_cloud(&self) -> Arc<PointCloud> {
        self.published.read().aligned_cloud.clone()
    }

    pub fn aligned_normals(&self) -> Arc<NormalCloud> {
        self.published.read().aligned_normals.clone()
    }

    pub fn raw_trajectory(&self) -> Vec<Vector3<f64>> {
        self.trajectories.read().raw.clone()
    }

    pub fn fused_trajectory(&self) -> Vec<Vector3<f64>> {
        self.trajectories.read().fused.clone()
    }

    /// Trajectory entries from index `from` on. A reader that keeps its own
    /// copy passes its current length and appends the result.
    pub fn trajectories_since(&self, from: usize) -> Trajectories {
        let trajectories = self.trajectories.read();
        let from = from.min(trajectories.fused.len());
        Trajectories {
            raw: trajectories.raw[from..].to_vec(),
            fused: trajectories.fused[from..].to_vec(),
        }
    }

    pub fn correspondences(&self) -> Arc<Vec<Correspondence>> {
        self.published.read().correspondences.clone()
    }

    /// Consistent copy of everything published for one frame, trajectories
    /// excluded.
    pub fn snapshot(&self) -> PublishedState {
        self.published.read().clone()
    }
}
