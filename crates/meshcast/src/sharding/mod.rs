//! Device meshes and per-axis distribution specifiers.

mod mesh;
mod partition;
mod spec;

pub use mesh::*;
pub use partition::*;
pub use spec::*;
