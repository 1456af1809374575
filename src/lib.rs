pub mod geometry;
pub mod io;
pub mod map;
pub mod matching;
pub mod optimizer;
pub mod system;
pub mod tracking;
pub mod viz;
