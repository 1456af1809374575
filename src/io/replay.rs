//! CSV-driven tracker that plays back recorded visual SLAM output.
//!
//! `frames.csv` rows: `frame, state, m00 .. m23` where `state` is 1
//! (initializing), 2 (tracking) or 3 (lost) and the twelve values are the
//! row-major 3x4 camera-to-world pose.
//!
//! `landmarks.csv` rows: `frame, x, y, z, nx, ny, nz, quality`.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use csv::{ReaderBuilder, StringRecord};
use nalgebra::{Matrix4, Vector3};
use tracing::info;

use crate::map::cloud::{NormalCloud, PointCloud};
use crate::tracking::{LandmarkQuery, TrackingState, VisualTracker};

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayFrame {
    pub frame: u64,
    pub state: TrackingState,
    pub pose: Matrix4<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplayLandmark {
    pub position: Vector3<f64>,
    pub normal: Vector3<f64>,
    /// Tracker confidence in [0, 1].
    pub quality: f64,
}

#[derive(Debug, Default)]
pub struct ReplayTracker {
    frames: Vec<ReplayFrame>,
    landmarks: BTreeMap<u64, Vec<ReplayLandmark>>,
    cursor: usize,
    current: Option<usize>,
    resets: usize,
}

impl ReplayTracker {
    pub fn new(frames: Vec<ReplayFrame>, landmarks: Vec<(u64, ReplayLandmark)>) -> Self {
        let mut by_frame: BTreeMap<u64, Vec<ReplayLandmark>> = BTreeMap::new();
        for (frame, landmark) in landmarks {
            by_frame.entry(frame).or_default().push(landmark);
        }
        Self {
            frames,
            landmarks: by_frame,
            ..Default::default()
        }
    }

    pub fn from_files<P: AsRef<Path>, Q: AsRef<Path>>(frames: P, landmarks: Q) -> Result<Self> {
        let frames = load_frames(frames.as_ref())?;
        let landmarks = load_landmarks(landmarks.as_ref())?;
        Ok(Self::new(frames, landmarks))
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.frames.len()
    }

    /// Number of reset requests received so far.
    pub fn resets(&self) -> usize {
        self.resets
    }

    pub fn current_frame(&self) -> Option<&ReplayFrame> {
        self.current.and_then(|i| self.frames.get(i))
    }
}

impl VisualTracker for ReplayTracker {
    fn try_execute_frame(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.current = Some(self.cursor);
        self.cursor += 1;
        true
    }

    fn state(&self) -> TrackingState {
        self.current_frame()
            .map_or(TrackingState::Initializing, |f| f.state)
    }

    fn camera_pose(&self) -> Option<Matrix4<f64>> {
        self.current_frame()
            .filter(|f| f.state.is_tracking())
            .map(|f| f.pose)
    }

    /// Landmarks recorded in the last `recollection` frames (at least the
    /// current one) whose quality reaches `accuracy`.
    fn landmarks_and_normals(&self, query: &LandmarkQuery) -> (PointCloud, NormalCloud) {
        let Some(current) = self.current_frame() else {
            return (PointCloud::new(), NormalCloud::new());
        };
        let window = query.recollection.max(1) as u64;
        let first = current.frame.saturating_sub(window - 1);

        let mut cloud = PointCloud::new();
        let mut normals = NormalCloud::new();
        for landmark in self
            .landmarks
            .range(first..=current.frame)
            .flat_map(|(_, l)| l)
            .filter(|l| l.quality >= query.accuracy)
        {
            cloud.push(landmark.position);
            normals.push(landmark.normal);
        }
        (cloud, normals)
    }

    fn request_reset(&mut self) {
        self.resets += 1;
        info!(
            "Replay tracker reset requested at frame {:?}",
            self.current_frame().map(|f| f.frame)
        );
    }
}

fn parse_field<T: std::str::FromStr>(rec: &StringRecord, i: usize, path: &Path, row: usize) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    rec[i]
        .trim()
        .parse()
        .with_context(|| format!("{}: row {}, column {}", path.display(), row + 1, i + 1))
}

fn load_frames(path: &Path) -> Result<Vec<ReplayFrame>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut frames = Vec::new();
    for (row, rec) in rdr.records().enumerate() {
        let rec = rec.with_context(|| format!("{}: bad record {}", path.display(), row + 1))?;
        if rec.len() < 14 {
            bail!(
                "{}: row {} has {} fields, expected 14",
                path.display(),
                row + 1,
                rec.len()
            );
        }

        let frame: u64 = parse_field(&rec, 0, path, row)?;
        let code: u8 = parse_field(&rec, 1, path, row)?;
        let Some(state) = TrackingState::from_code(code) else {
            bail!("{}: row {}: unknown state code {}", path.display(), row + 1, code);
        };

        let mut pose = Matrix4::identity();
        for r in 0..3 {
            for c in 0..4 {
                pose[(r, c)] = parse_field(&rec, 2 + r * 4 + c, path, row)?;
            }
        }
        frames.push(ReplayFrame { frame, state, pose });
    }
    Ok(frames)
}

fn load_landmarks(path: &Path) -> Result<Vec<(u64, ReplayLandmark)>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(false)
        .comment(Some(b'#'))
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut landmarks = Vec::new();
    for (row, rec) in rdr.records().enumerate() {
        let rec = rec.with_context(|| format!("{}: bad record {}", path.display(), row + 1))?;
        if rec.len() < 8 {
            bail!(
                "{}: row {} has {} fields, expected 8",
                path.display(),
                row + 1,
                rec.len()
            );
        }
        let field = |i| parse_field::<f64>(&rec, i, path, row);
        let frame: u64 = parse_field(&rec, 0, path, row)?;
        landmarks.push((
            frame,
            ReplayLandmark {
                position: Vector3::new(field(1)?, field(2)?, field(3)?),
                normal: Vector3::new(field(4)?, field(5)?, field(6)?),
                quality: field(7)?,
            },
        ));
    }
    Ok(landmarks)
}
