use ndarray::ArrayD;
use rayon::prelude::*;

use crate::{Element, Error, Result, ShardedTensor};

use super::collective;
use super::plan::{CastPlan, CastStep, Transition};

impl CastPlan {
    /// Runs the plan against a tensor's physical shards.
    ///
    /// Every transition executes one collective per peer group; groups of a
    /// phase run in parallel and the phase completes only when all of them
    /// have, which gives each phase barrier semantics across the changing
    /// axis. A failure in any group aborts the cast.
    pub fn execute<A: Element>(&self, tensor: &ShardedTensor<A>) -> Result<ShardedTensor<A>> {
        if tensor.global_shape() != self.shape() {
            return Err(Error::ShapeMismatch(format!(
                "plan was built for shape {:?} but tensor has shape {:?}",
                self.shape(),
                tensor.global_shape(),
            )));
        }
        if tensor.placement() != self.src() {
            return Err(Error::InvalidDistribution(format!(
                "plan was built for source {} but tensor is placed as {}",
                self.src(),
                tensor.placement(),
            )));
        }

        let mut shards: Vec<ArrayD<A>> = tensor.shards().to_vec();
        let mut placement = self.src().clone();
        for step in self.steps() {
            match step {
                CastStep::Rebind(target) => {
                    log::trace!("rebind {placement} -> {target}");
                    placement = target.clone();
                }
                CastStep::Transition(transition) => {
                    log::trace!(
                        "axis {} {} -> {} via {:?}",
                        transition.mesh_axis,
                        transition.from,
                        transition.to,
                        transition.collective,
                    );
                    run_phase(&mut shards, &placement, transition)?;
                    placement.set_axis(transition.mesh_axis, transition.to);
                }
            }
        }

        Ok(ShardedTensor::from_parts(
            shards,
            self.shape().to_vec(),
            self.dst().clone(),
        ))
    }
}

fn run_phase<A: Element>(
    shards: &mut [ArrayD<A>],
    placement: &crate::sharding::Placement,
    transition: &Transition,
) -> Result<()> {
    let groups = placement.mesh().axis_groups(transition.mesh_axis);
    let outputs: Vec<Vec<ArrayD<A>>> = {
        let shards_ref: &[ArrayD<A>] = shards;
        groups
            .par_iter()
            .map(|group| {
                let members: Vec<&ArrayD<A>> = group.iter().map(|&d| &shards_ref[d]).collect();
                collective::apply(&transition.collective, &members)
            })
            .collect::<Result<_>>()?
    };
    for (group, out) in groups.iter().zip(outputs) {
        for (&device, buffer) in group.iter().zip(out) {
            shards[device] = buffer;
        }
    }
    Ok(())
}
