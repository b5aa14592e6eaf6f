#![warn(missing_docs)]

//! Hierarchical device meshes and distribution casting for sharded tensors.
//!
//! A tensor that is too large for one device is kept as a set of per-device
//! shards, described by a [`sharding::Placement`]: an N-dimensional
//! [`sharding::DeviceMesh`] plus one [`sharding::Distribution`] tag per mesh
//! axis (broadcast, split on a tensor axis, or partial-sum). The
//! [`cast`](crate::cast) module plans and executes the collective
//! communication required to move a tensor from one placement to another
//! without changing its logical value, and the [`graph`] module exposes a
//! small session/graph surface that drives casts inside a computation,
//! including manual gradient-direction overrides during training.

mod error;
mod tensor;

pub mod cast;
pub mod graph;
pub mod optim;
pub mod sharding;
pub mod testing;

pub use error::*;
pub use tensor::*;
