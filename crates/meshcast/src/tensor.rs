use ndarray::{ArrayD, Axis, Slice, concatenate};
use num_traits::Zero;

use crate::sharding::{Distribution, Placement, shard_region};
use crate::{Error, Result};

/// Element types that can live inside a [`ShardedTensor`].
///
/// Collectives only ever copy, concatenate, slice, and sum shard buffers, so
/// the bound is deliberately small.
pub trait Element:
    Copy + PartialEq + std::fmt::Debug + Zero + std::ops::AddAssign<Self> + Send + Sync + 'static
{
}

impl Element for f32 {}
impl Element for i32 {}

/// A tensor distributed across the devices of a mesh.
///
/// A `ShardedTensor` holds one physical buffer per device, in the mesh's
/// linear device order, along with the global (logical) shape and the
/// [`Placement`] describing how the buffers relate to the logical value.
/// [`ShardedTensor::assemble`] recovers the logical value from the buffers;
/// any operation that changes the placement must leave that value intact.
#[derive(Clone, Debug)]
pub struct ShardedTensor<A: Element> {
    /// Per-device buffers in linear mesh order.
    shards: Vec<ArrayD<A>>,
    /// Global shape of the tensor (across all devices).
    global_shape: Vec<usize>,
    /// How the buffers are distributed.
    placement: Placement,
}

impl<A: Element> ShardedTensor<A> {
    /// Distributes a global array across the devices of `placement`.
    ///
    /// Each device receives the slice given by its [`shard_region`]; devices
    /// with a nonzero coordinate on a partial-sum axis receive zeros.
    pub fn scatter(global: &ArrayD<A>, placement: Placement) -> Result<Self> {
        placement.validate_for(global.ndim())?;
        let global_shape = global.shape().to_vec();
        let mut shards = Vec::with_capacity(placement.mesh().num_devices());
        for device in 0..placement.mesh().num_devices() {
            let region = shard_region(&global_shape, &placement, device);
            let mut view = global.view();
            for (k, range) in region.ranges.iter().enumerate() {
                view.slice_axis_inplace(Axis(k), Slice::from(range.clone()));
            }
            if region.zeroed {
                shards.push(ArrayD::zeros(view.raw_dim()));
            } else {
                shards.push(view.to_owned());
            }
        }
        Ok(Self {
            shards,
            global_shape,
            placement,
        })
    }

    /// Reassembles the logical value from the physical buffers.
    ///
    /// Mesh axes are reduced innermost-first: broadcast axes collapse to one
    /// copy, split axes concatenate their chunks in coordinate order, and
    /// partial-sum axes sum their addends.
    pub fn assemble(&self) -> Result<ArrayD<A>> {
        let mesh = self.placement.mesh();
        let distribution = self.placement.distribution();
        let mut bufs = self.shards.clone();
        for axis in (0..mesh.rank()).rev() {
            let size = mesh.axis_size(axis);
            let mut next = Vec::with_capacity(bufs.len() / size);
            for group in bufs.chunks(size) {
                next.push(combine(group, distribution[axis])?);
            }
            bufs = next;
        }
        bufs.pop()
            .ok_or_else(|| Error::InvalidMesh("mesh has no devices".into()))
    }

    /// The placement of this tensor.
    pub fn placement(&self) -> &Placement {
        &self.placement
    }

    /// The global (logical) shape.
    pub fn global_shape(&self) -> &[usize] {
        &self.global_shape
    }

    /// The buffer held by one device, by linear mesh position.
    pub fn shard(&self, device: usize) -> &ArrayD<A> {
        &self.shards[device]
    }

    /// Number of physical shards (one per device).
    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    pub(crate) fn shards(&self) -> &[ArrayD<A>] {
        &self.shards
    }

    pub(crate) fn from_parts(
        shards: Vec<ArrayD<A>>,
        global_shape: Vec<usize>,
        placement: Placement,
    ) -> Self {
        debug_assert_eq!(shards.len(), placement.mesh().num_devices());
        Self {
            shards,
            global_shape,
            placement,
        }
    }
}

fn combine<A: Element>(group: &[ArrayD<A>], dist: Distribution) -> Result<ArrayD<A>> {
    match dist {
        Distribution::Broadcast => Ok(group[0].clone()),
        Distribution::PartialSum => {
            let mut acc = group[0].clone();
            for member in &group[1..] {
                acc += member;
            }
            Ok(acc)
        }
        Distribution::Split(k) => {
            let views: Vec<_> = group.iter().map(|m| m.view()).collect();
            concatenate(Axis(k), &views).map_err(|e| Error::ShapeMismatch(e.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;
    use pretty_assertions::assert_eq;

    fn iota(shape: &[usize]) -> ArrayD<f32> {
        let n: usize = shape.iter().product();
        ArrayD::from_shape_vec(IxDyn(shape), (0..n).map(|v| v as f32).collect()).unwrap()
    }

    #[test]
    fn test_scatter_assemble_nested_split() {
        let x = iota(&[8, 4]);
        let placement = Placement::from_tags(&[2, 2], &["S(0)", "S(0)"]).unwrap();
        let t = ShardedTensor::scatter(&x, placement).unwrap();
        assert_eq!(t.shard(0).shape(), &[2, 4]);
        assert_eq!(t.assemble().unwrap(), x);
    }

    #[test]
    fn test_scatter_assemble_mixed_axes() {
        let x = iota(&[8, 6]);
        for tags in [
            ["S(0)", "S(1)"],
            ["S(1)", "S(0)"],
            ["B", "S(1)"],
            ["S(1)", "B"],
        ] {
            let placement = Placement::from_tags(&[2, 2], &tags).unwrap();
            let t = ShardedTensor::scatter(&x, placement).unwrap();
            assert_eq!(t.assemble().unwrap(), x, "placement {tags:?}");
        }
    }

    #[test]
    fn test_scatter_assemble_partial_sum() {
        let x = iota(&[4, 4]);
        let placement = Placement::from_tags(&[2, 2], &["S(0)", "P"]).unwrap();
        let t = ShardedTensor::scatter(&x, placement).unwrap();
        // Non-root partial shards hold zeros but keep the region shape.
        assert_eq!(t.shard(1).shape(), &[2, 4]);
        assert!(t.shard(1).iter().all(|&v| v == 0.0));
        assert_eq!(t.assemble().unwrap(), x);
    }

    #[test]
    fn test_uneven_split() {
        let x = iota(&[5, 3]);
        let placement = Placement::from_tags(&[2], &["S(0)"]).unwrap();
        let t = ShardedTensor::scatter(&x, placement).unwrap();
        assert_eq!(t.shard(0).shape(), &[3, 3]);
        assert_eq!(t.shard(1).shape(), &[2, 3]);
        assert_eq!(t.assemble().unwrap(), x);
    }

    #[test]
    fn test_split_axis_out_of_range() {
        let x = iota(&[4, 4]);
        let placement = Placement::from_tags(&[4], &["S(2)"]).unwrap();
        assert!(ShardedTensor::scatter(&x, placement).is_err());
    }
}
