//! Planning and execution of distribution casts.
//!
//! A cast converts a [`ShardedTensor`] from one [`Placement`] to another
//! without changing its logical value. [`CastPlan::new`] decides which
//! collectives run and in what order; [`CastPlan::execute`] applies them to
//! the physical shards. Each collective phase changes exactly one mesh axis
//! and acts as a synchronization barrier across the peer groups of that
//! axis, so a two-level hierarchy where both axes change runs two sequential
//! phases.

mod collective;
mod exec;
mod plan;

pub use plan::*;

use crate::sharding::Placement;
use crate::{Element, Result, ShardedTensor};

/// Casts a tensor to a new placement, preserving its logical value.
///
/// Convenience wrapper that plans and executes in one step. Placements whose
/// hierarchies disagree on the total device count are rejected before any
/// collective communication runs.
pub fn cast<A: Element>(tensor: &ShardedTensor<A>, target: &Placement) -> Result<ShardedTensor<A>> {
    let plan = CastPlan::new(tensor.global_shape(), tensor.placement(), target)?;
    plan.execute(tensor)
}
