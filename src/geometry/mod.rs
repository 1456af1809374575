//! Geometry utilities: Sim3 transforms, SO(3) Jacobians, pose block helpers.

pub mod pose;
pub mod sim3;
pub mod so3;

pub use sim3::Sim3;
pub use so3::{right_jacobian_so3, skew};
