use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use rust_vllm::geometry::pose;
use rust_vllm::io::{ReplayTracker, load_map_csv, write_trajectory_csv};
use rust_vllm::map::fill_missing_normals;
use rust_vllm::system::{Config, FrameOutcome, VllmSystem};

/// Replays recorded visual tracking output against a LiDAR map.
#[derive(Debug, Parser)]
#[command(name = "rust-vllm", version)]
struct Args {
    /// YAML configuration; defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Map cloud, rows of `x,y,z,nx,ny,nz`.
    #[arg(long)]
    map: PathBuf,

    /// Recorded tracker frames, rows of `frame,state,m00..m23`.
    #[arg(long)]
    frames: PathBuf,

    /// Recorded landmarks, rows of `frame,x,y,z,nx,ny,nz,quality`.
    #[arg(long)]
    landmarks: PathBuf,

    /// Spawn the rerun viewer.
    #[arg(long)]
    viewer: bool,

    /// Neighbours used to estimate map normals missing from the file; 0 disables.
    #[arg(long, default_value_t = 10)]
    normal_neighbors: usize,

    /// Write the fused trajectory here when the replay ends.
    #[arg(long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            Config::from_yaml_file(path)?
        }
        None => {
            info!("Using default configuration");
            Config::default()
        }
    };

    let (cloud, mut normals) = load_map_csv(&args.map)?;
    info!("Loaded {} map points from {}", cloud.len(), args.map.display());
    if args.normal_neighbors > 0 {
        let filled = fill_missing_normals(&cloud, &mut normals, args.normal_neighbors);
        if filled > 0 {
            info!("Estimated {} missing map normals", filled);
        }
    }

    let tracker = ReplayTracker::from_files(&args.frames, &args.landmarks)?;
    info!("Loaded {} recorded frames", tracker.len());

    let mut system = VllmSystem::new(&config, tracker, &cloud, &normals, args.viewer)?;

    let mut skipped = 0usize;
    while !system.controller().tracker().is_exhausted() {
        match system.process_frame() {
            FrameOutcome::Skipped => skipped += 1,
            FrameOutcome::Fused(result) => {
                if result.frame % 100 == 0 {
                    let t = result.fused_pose.fixed_view::<3, 1>(0, 3);
                    info!(
                        "Frame {}: {} | landmarks {} | corr {} | iters {} | pos [{:.2}, {:.2}, {:.2}] | {:.1} ms",
                        result.frame,
                        result.state,
                        result.landmarks,
                        result.final_correspondences(),
                        result.iterations_run(),
                        t[0],
                        t[1],
                        t[2],
                        result.timing.total_ms
                    );
                }
            }
        }
    }

    info!(
        "Done: {} frames fused, {} skipped, {} tracker resets, alignment scale {:.4}",
        system.controller().frames_fused(),
        skipped,
        system.controller().tracker().resets(),
        pose::scale(system.controller().t_align())
    );

    if let Some(path) = &args.output {
        let trajectory = system.shared_state().fused_trajectory();
        if trajectory.is_empty() {
            warn!("No fused poses to write");
        }
        write_trajectory_csv(path, &trajectory)?;
        info!("Wrote {} fused positions to {}", trajectory.len(), path.display());
    }

    system.shutdown();
    Ok(())
}
