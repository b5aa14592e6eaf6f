//! A minimal session/graph surface around distribution casts.
//!
//! A [`GraphBuilder`] records a computation over placeholder inputs and
//! named persistent variables: matrix multiply, relu, reduce-sum, gather,
//! slice, reshape, and the hierarchical distribution cast. A [`Session`]
//! owns the variables and executes graphs against concrete arrays, running a
//! backward sweep and an SGD step for graphs built in [`Mode::Train`].
//!
//! Operators other than the cast are consumed as black boxes: they compute
//! on the logical value and re-shard their result, while casts operate on
//! the physical shards through [`crate::cast`]. A cast may carry a manual
//! gradient placement, in which case the backward sweep casts the incoming
//! gradient to that placement instead of mirroring the forward cast.

mod build;
mod exec;
mod node;
mod session;

pub use build::{Graph, GraphBuilder, Mode, TensorId};
pub use node::{DType, HostTensor, Initializer};
pub use session::Session;
