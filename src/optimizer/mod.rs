//! Sim(3) alignment of visual landmarks against the LiDAR map.
//!
//! - `edges`: GICP and restriction residual blocks with analytic Jacobians
//! - `aligner`: graph construction and solve
//! - `solver`: fixed-iteration Levenberg-Marquardt over `LeastSquaresProblem`

pub mod aligner;
pub mod edges;
pub mod solver;

pub use aligner::{
    AlignerConfig, AlignmentGraph, AlignmentGraphBuilder, AlignmentOutcome, RestrictionGains,
    VertexHandle,
};
pub use edges::{GicpEdge, Restriction};
pub use solver::{SolverSummary, solve_fixed_iterations};
