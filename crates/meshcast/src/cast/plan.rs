use crate::sharding::{DeviceMesh, Distribution, Placement, layout_identical};
use crate::{Error, Result};

/// The collective (or local) data movement realizing one per-axis transition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Collective {
    /// Peers concatenate their chunks of `tensor_axis`; everyone ends with
    /// the full value.
    AllGather {
        /// Tensor axis being gathered.
        tensor_axis: usize,
    },
    /// Peers sum their addends; everyone ends with the full value.
    AllReduce,
    /// Peers sum their addends, then each keeps one chunk of `tensor_axis`.
    ReduceScatter {
        /// Tensor axis being scattered.
        tensor_axis: usize,
    },
    /// Peers trade chunks of `src_axis` for chunks of `dst_axis`.
    AllToAll {
        /// Tensor axis currently split.
        src_axis: usize,
        /// Tensor axis split afterwards.
        dst_axis: usize,
    },
    /// Each peer keeps its own chunk of `tensor_axis`; no peer traffic.
    SliceLocal {
        /// Tensor axis being split.
        tensor_axis: usize,
    },
    /// The root peer keeps the value, the rest drop to zeros; no peer traffic.
    MaskToPartial,
    /// Each peer zero-pads its chunk back to the group length; no peer traffic.
    EmbedToPartial {
        /// Tensor axis whose chunks are embedded.
        tensor_axis: usize,
    },
}

/// One collective phase: a single mesh axis changes distribution.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transition {
    /// Mesh axis whose peer groups participate.
    pub mesh_axis: usize,
    /// Distribution of the axis before the phase.
    pub from: Distribution,
    /// Distribution of the axis after the phase.
    pub to: Distribution,
    /// Data movement realizing the change.
    pub collective: Collective,
}

/// One step of a [`CastPlan`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CastStep {
    /// Reinterpret the shards under an equivalent placement. Pure metadata,
    /// valid only between layout-identical placements.
    Rebind(Placement),
    /// Run one collective phase across the groups of a mesh axis.
    Transition(Transition),
}

/// An ordered sequence of steps converting one placement into another.
///
/// Planning picks the cheapest of four routes:
///
/// 1. the placements are layout-identical: a single rebind;
/// 2. some distribution on the target mesh is layout-identical to the
///    source: rebind, then per-axis transitions on the target mesh;
/// 3. some distribution on the source mesh is layout-identical to the
///    target: per-axis transitions on the source mesh, then rebind;
/// 4. otherwise: gather the source to fully-broadcast, rebind to the target
///    mesh, and re-shard locally.
///
/// Per-axis transitions assume the peer groups of the changing axis can act
/// independently. That fails when a deeper (inner) mesh axis splits a tensor
/// axis involved in the change, so the planner first releases such inner
/// axes to broadcast and restores them afterwards.
#[derive(Clone, Debug)]
pub struct CastPlan {
    shape: Vec<usize>,
    src: Placement,
    dst: Placement,
    steps: Vec<CastStep>,
}

impl CastPlan {
    /// Plans a cast of a `shape`-shaped tensor from `src` to `dst`.
    ///
    /// # Errors
    ///
    /// Rejects placements whose hierarchies have different device-count
    /// products ([`Error::DeviceCountMismatch`]) and distribution vectors
    /// that do not fit the mesh rank or the tensor rank. No step of the
    /// returned plan is dispatched before these checks pass.
    pub fn new(shape: &[usize], src: &Placement, dst: &Placement) -> Result<Self> {
        src.validate_for(shape.len())?;
        dst.validate_for(shape.len())?;
        let src_count = src.mesh().num_devices();
        let dst_count = dst.mesh().num_devices();
        if src_count != dst_count {
            return Err(Error::DeviceCountMismatch {
                src: src.mesh().shape().to_vec(),
                dst: dst.mesh().shape().to_vec(),
                src_count,
                dst_count,
            });
        }

        let mut steps = Vec::new();
        if src.mesh().shape() == dst.mesh().shape() {
            log::debug!("cast {src} -> {dst}: per-axis transitions");
            push_transitions(&mut steps, plan_axes(src.distribution(), dst.distribution()));
        } else if layout_identical(shape, src, dst) {
            log::debug!("cast {src} -> {dst}: layouts identical, rebinding");
            steps.push(CastStep::Rebind(dst.clone()));
        } else if let Some(equiv) = find_equivalent(shape, src, dst.mesh()) {
            log::debug!("cast {src} -> {dst}: rebinding through {equiv}");
            push_transitions(
                &mut steps,
                plan_axes(equiv.distribution(), dst.distribution()),
            );
            steps.insert(0, CastStep::Rebind(equiv));
        } else if let Some(equiv) = find_equivalent(shape, dst, src.mesh()) {
            log::debug!("cast {src} -> {dst}: transitioning to equivalent {equiv}");
            push_transitions(
                &mut steps,
                plan_axes(src.distribution(), equiv.distribution()),
            );
            steps.push(CastStep::Rebind(dst.clone()));
        } else {
            log::debug!("cast {src} -> {dst}: no equivalent layout, routing through broadcast");
            let src_broadcast = vec![Distribution::Broadcast; src.mesh().rank()];
            let dst_broadcast = vec![Distribution::Broadcast; dst.mesh().rank()];
            push_transitions(&mut steps, plan_axes(src.distribution(), &src_broadcast));
            steps.push(CastStep::Rebind(Placement::broadcast(dst.mesh().clone())));
            push_transitions(&mut steps, plan_axes(&dst_broadcast, dst.distribution()));
        }

        Ok(Self {
            shape: shape.to_vec(),
            src: src.clone(),
            dst: dst.clone(),
            steps,
        })
    }

    /// The steps of the plan, in execution order.
    pub fn steps(&self) -> &[CastStep] {
        &self.steps
    }

    /// Tensor shape the plan was built for.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Source placement.
    pub fn src(&self) -> &Placement {
        &self.src
    }

    /// Target placement.
    pub fn dst(&self) -> &Placement {
        &self.dst
    }

    /// Number of phases that move data between peers.
    pub fn communication_phases(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| {
                matches!(
                    step,
                    CastStep::Transition(Transition {
                        collective: Collective::AllGather { .. }
                            | Collective::AllReduce
                            | Collective::ReduceScatter { .. }
                            | Collective::AllToAll { .. },
                        ..
                    })
                )
            })
            .count()
    }
}

fn push_transitions(steps: &mut Vec<CastStep>, transitions: Vec<Transition>) {
    steps.extend(transitions.into_iter().map(CastStep::Transition));
}

/// Plans per-axis transitions between two distributions on the same mesh.
///
/// Axes are visited outermost-first. Before an axis changes, any inner axis
/// splitting a tensor axis involved in the change is released to broadcast;
/// the main sweep restores it when its turn comes.
fn plan_axes(src: &[Distribution], dst: &[Distribution]) -> Vec<Transition> {
    let mut cur: Vec<Distribution> = src.to_vec();
    let mut transitions = Vec::new();
    for axis in 0..cur.len() {
        if cur[axis] == dst[axis] {
            continue;
        }
        let mut needs = Vec::new();
        if let Distribution::Split(k) = cur[axis] {
            needs.push(k);
        }
        if let Distribution::Split(k) = dst[axis] {
            if !needs.contains(&k) {
                needs.push(k);
            }
        }
        release_inner(axis, &needs, &mut cur, &mut transitions);
        push_axis(&mut transitions, axis, cur[axis], dst[axis]);
        cur[axis] = dst[axis];
    }
    transitions
}

/// Releases to broadcast every axis deeper than `axis` that splits one of
/// the tensor axes in `needs`.
fn release_inner(
    axis: usize,
    needs: &[usize],
    cur: &mut [Distribution],
    transitions: &mut Vec<Transition>,
) {
    for inner in axis + 1..cur.len() {
        if let Distribution::Split(k) = cur[inner] {
            if needs.contains(&k) {
                release_inner(inner, &[k], cur, transitions);
                push_axis(
                    transitions,
                    inner,
                    Distribution::Split(k),
                    Distribution::Broadcast,
                );
                cur[inner] = Distribution::Broadcast;
            }
        }
    }
}

fn push_axis(transitions: &mut Vec<Transition>, mesh_axis: usize, from: Distribution, to: Distribution) {
    if let Some(collective) = collective_for(from, to) {
        transitions.push(Transition {
            mesh_axis,
            from,
            to,
            collective,
        });
    }
}

/// The collective realizing a single-axis transition; `None` for no-ops.
fn collective_for(from: Distribution, to: Distribution) -> Option<Collective> {
    use Distribution::{Broadcast, PartialSum, Split};
    match (from, to) {
        (Broadcast, Broadcast) | (PartialSum, PartialSum) => None,
        (Split(i), Split(j)) if i == j => None,
        (Split(i), Split(j)) => Some(Collective::AllToAll {
            src_axis: i,
            dst_axis: j,
        }),
        (Split(k), Broadcast) => Some(Collective::AllGather { tensor_axis: k }),
        (Broadcast, Split(k)) => Some(Collective::SliceLocal { tensor_axis: k }),
        (PartialSum, Broadcast) => Some(Collective::AllReduce),
        (PartialSum, Split(k)) => Some(Collective::ReduceScatter { tensor_axis: k }),
        (Broadcast, PartialSum) => Some(Collective::MaskToPartial),
        (Split(k), PartialSum) => Some(Collective::EmbedToPartial { tensor_axis: k }),
    }
}

/// Searches for a distribution on `mesh` that is layout-identical to
/// `target`. A hit means the two hierarchies can be converted by relabeling.
fn find_equivalent(
    shape: &[usize],
    target: &Placement,
    mesh: &DeviceMesh,
) -> Option<Placement> {
    let choices = candidate_tags(shape.len());
    let rank = mesh.rank();
    let total = choices.len().pow(rank as u32);
    for mut code in 0..total {
        let mut distribution = Vec::with_capacity(rank);
        for _ in 0..rank {
            distribution.push(choices[code % choices.len()]);
            code /= choices.len();
        }
        let candidate = Placement::new(mesh.clone(), distribution).ok()?;
        if layout_identical(shape, &candidate, target) {
            return Some(candidate);
        }
    }
    None
}

fn candidate_tags(tensor_ndim: usize) -> Vec<Distribution> {
    let mut choices = vec![Distribution::Broadcast];
    choices.extend((0..tensor_ndim).map(Distribution::Split));
    choices.push(Distribution::PartialSum);
    choices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(shape: &[usize], src: &[&str], src_mesh: &[usize], dst: &[&str], dst_mesh: &[usize]) -> CastPlan {
        let src = Placement::from_tags(src_mesh, src).unwrap();
        let dst = Placement::from_tags(dst_mesh, dst).unwrap();
        CastPlan::new(shape, &src, &dst).unwrap()
    }

    #[test]
    fn test_noop_plan_is_empty() {
        let p = plan(&[8, 8], &["B", "S(1)"], &[2, 2], &["B", "S(1)"], &[2, 2]);
        assert!(p.steps().is_empty());
    }

    #[test]
    fn test_single_axis_change_is_one_phase() {
        let p = plan(&[8, 8], &["S(0)", "S(1)"], &[2, 2], &["S(0)", "B"], &[2, 2]);
        assert_eq!(p.steps().len(), 1);
        assert_eq!(
            p.steps()[0],
            CastStep::Transition(Transition {
                mesh_axis: 1,
                from: Distribution::Split(1),
                to: Distribution::Broadcast,
                collective: Collective::AllGather { tensor_axis: 1 },
            })
        );
    }

    #[test]
    fn test_both_axes_change_is_two_phases() {
        let p = plan(&[8, 8], &["S(0)", "S(1)"], &[2, 2], &["B", "B"], &[2, 2]);
        assert_eq!(p.steps().len(), 2);
        assert_eq!(p.communication_phases(), 2);
    }

    #[test]
    fn test_inner_split_is_released_before_outer_change() {
        // [B, S(0)] -> [S(0), S(0)]: the inner axis splits the same tensor
        // axis the outer change needs, so it is gathered first and re-split
        // after.
        let p = plan(&[8, 8], &["B", "S(0)"], &[2, 2], &["S(0)", "S(0)"], &[2, 2]);
        let axes: Vec<usize> = p
            .steps()
            .iter()
            .map(|s| match s {
                CastStep::Transition(t) => t.mesh_axis,
                CastStep::Rebind(_) => unreachable!(),
            })
            .collect();
        assert_eq!(axes, vec![1, 0, 1]);
        assert_eq!(p.communication_phases(), 1); // only the release gathers
    }

    #[test]
    fn test_nested_split_rebinds_to_flat() {
        let p = plan(&[8, 8], &["S(0)", "S(0)"], &[2, 2], &["S(0)"], &[4]);
        assert_eq!(p.steps().len(), 1);
        assert!(matches!(p.steps()[0], CastStep::Rebind(_)));
        assert_eq!(p.communication_phases(), 0);
    }

    #[test]
    fn test_flat_split_rebinds_then_transitions() {
        // [4][S(1)] is layout-identical to [2, 2][S(1), S(1)], which then
        // casts per-axis to [B, S(1)].
        let p = plan(&[8, 8], &["S(1)"], &[4], &["B", "S(1)"], &[2, 2]);
        assert!(matches!(p.steps()[0], CastStep::Rebind(_)));
        assert!(p.communication_phases() >= 1);
    }

    #[test]
    fn test_device_count_mismatch_rejected() {
        let src = Placement::from_tags(&[2, 2], &["B", "B"]).unwrap();
        let dst = Placement::from_tags(&[3], &["B"]).unwrap();
        let err = CastPlan::new(&[8, 8], &src, &dst).unwrap_err();
        assert!(matches!(err, Error::DeviceCountMismatch { .. }));
    }

    #[test]
    fn test_split_past_tensor_rank_rejected() {
        let src = Placement::from_tags(&[4], &["S(3)"]).unwrap();
        let dst = Placement::from_tags(&[4], &["B"]).unwrap();
        assert!(CastPlan::new(&[8, 8], &src, &dst).is_err());
    }
}
