//! Collective primitives applied to one peer group.
//!
//! Each function takes the buffers of every device in a group (ordered by
//! mesh coordinate along the changing axis) and returns the buffers the
//! group holds afterwards. No buffer is produced until every contributing
//! peer's input has been consumed, which is what makes each primitive a
//! barrier for its group.

use ndarray::{ArrayD, ArrayViewD, Axis, Slice, concatenate};

use crate::sharding::balanced_parts;
use crate::{Element, Error, Result};

use super::plan::Collective;

pub(crate) fn apply<A: Element>(
    collective: &Collective,
    members: &[&ArrayD<A>],
) -> Result<Vec<ArrayD<A>>> {
    match *collective {
        Collective::AllGather { tensor_axis } => all_gather(members, tensor_axis),
        Collective::AllReduce => Ok(all_reduce(members)),
        Collective::ReduceScatter { tensor_axis } => reduce_scatter(members, tensor_axis),
        Collective::AllToAll { src_axis, dst_axis } => all_to_all(members, src_axis, dst_axis),
        Collective::SliceLocal { tensor_axis } => Ok(slice_local(members, tensor_axis)),
        Collective::MaskToPartial => Ok(mask_to_partial(members)),
        Collective::EmbedToPartial { tensor_axis } => Ok(embed_to_partial(members, tensor_axis)),
    }
}

fn concat_members<A: Element>(members: &[&ArrayD<A>], axis: usize) -> Result<ArrayD<A>> {
    let views: Vec<ArrayViewD<A>> = members.iter().map(|m| m.view()).collect();
    concatenate(Axis(axis), &views).map_err(|e| Error::ShapeMismatch(e.to_string()))
}

fn chunk<A: Element>(full: &ArrayD<A>, axis: usize, rank: usize, parts: usize) -> ArrayD<A> {
    let ranges = balanced_parts(full.len_of(Axis(axis)), parts);
    full.slice_axis(Axis(axis), Slice::from(ranges[rank].clone()))
        .to_owned()
}

/// Split -> broadcast: every peer ends with the concatenation of all chunks.
fn all_gather<A: Element>(members: &[&ArrayD<A>], axis: usize) -> Result<Vec<ArrayD<A>>> {
    let full = concat_members(members, axis)?;
    Ok(vec![full; members.len()])
}

/// Partial-sum -> broadcast: every peer ends with the elementwise sum.
fn all_reduce<A: Element>(members: &[&ArrayD<A>]) -> Vec<ArrayD<A>> {
    let mut sum = members[0].clone();
    for member in &members[1..] {
        sum += *member;
    }
    vec![sum; members.len()]
}

/// Partial-sum -> split: sum the addends, then keep one chunk per peer.
fn reduce_scatter<A: Element>(members: &[&ArrayD<A>], axis: usize) -> Result<Vec<ArrayD<A>>> {
    let sum = all_reduce(members).pop().ok_or_else(empty_group)?;
    Ok((0..members.len())
        .map(|rank| chunk(&sum, axis, rank, members.len()))
        .collect())
}

/// Split on one tensor axis -> split on another: exchange so each peer trades
/// its `src_axis` chunk for a `dst_axis` chunk.
fn all_to_all<A: Element>(
    members: &[&ArrayD<A>],
    src_axis: usize,
    dst_axis: usize,
) -> Result<Vec<ArrayD<A>>> {
    let full = concat_members(members, src_axis)?;
    Ok((0..members.len())
        .map(|rank| chunk(&full, dst_axis, rank, members.len()))
        .collect())
}

/// Broadcast -> split: every peer already holds the full value and keeps only
/// its own chunk. No peer traffic.
fn slice_local<A: Element>(members: &[&ArrayD<A>], axis: usize) -> Vec<ArrayD<A>> {
    members
        .iter()
        .enumerate()
        .map(|(rank, member)| chunk(member, axis, rank, members.len()))
        .collect()
}

/// Broadcast -> partial-sum: the root keeps the value, peers drop to zero.
/// No peer traffic.
fn mask_to_partial<A: Element>(members: &[&ArrayD<A>]) -> Vec<ArrayD<A>> {
    members
        .iter()
        .enumerate()
        .map(|(rank, member)| {
            if rank == 0 {
                (*member).clone()
            } else {
                ArrayD::zeros(member.raw_dim())
            }
        })
        .collect()
}

/// Split -> partial-sum: each peer pads its chunk with zeros back to the
/// group length, so the addends sum to the gathered value. No peer traffic.
fn embed_to_partial<A: Element>(members: &[&ArrayD<A>], axis: usize) -> Vec<ArrayD<A>> {
    let total: usize = members.iter().map(|m| m.len_of(Axis(axis))).sum();
    let mut offset = 0;
    members
        .iter()
        .map(|member| {
            let mut shape = member.shape().to_vec();
            shape[axis] = total;
            let mut out = ArrayD::zeros(ndarray::IxDyn(&shape));
            let len = member.len_of(Axis(axis));
            out.slice_axis_mut(Axis(axis), Slice::from(offset..offset + len))
                .assign(member);
            offset += len;
            out
        })
        .collect()
}

fn empty_group() -> Error {
    Error::InvalidMesh("collective group has no members".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::IxDyn;
    use pretty_assertions::assert_eq;

    fn arr(shape: &[usize], data: Vec<f32>) -> ArrayD<f32> {
        ArrayD::from_shape_vec(IxDyn(shape), data).unwrap()
    }

    #[test]
    fn test_all_gather() {
        let a = arr(&[1, 2], vec![1.0, 2.0]);
        let b = arr(&[1, 2], vec![3.0, 4.0]);
        let out = all_gather(&[&a, &b], 0).unwrap();
        let expected = arr(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(out, vec![expected.clone(), expected]);
    }

    #[test]
    fn test_all_reduce() {
        let a = arr(&[2], vec![1.0, 2.0]);
        let b = arr(&[2], vec![10.0, 20.0]);
        let out = all_reduce(&[&a, &b]);
        assert_eq!(out[0], arr(&[2], vec![11.0, 22.0]));
        assert_eq!(out[0], out[1]);
    }

    #[test]
    fn test_reduce_scatter() {
        let a = arr(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]);
        let b = arr(&[2, 2], vec![4.0, 3.0, 2.0, 1.0]);
        let out = reduce_scatter(&[&a, &b], 0).unwrap();
        assert_eq!(out[0], arr(&[1, 2], vec![5.0, 5.0]));
        assert_eq!(out[1], arr(&[1, 2], vec![5.0, 5.0]));
    }

    #[test]
    fn test_all_to_all() {
        // Two peers each hold one row; afterwards each holds one column.
        let a = arr(&[1, 2], vec![1.0, 2.0]);
        let b = arr(&[1, 2], vec![3.0, 4.0]);
        let out = all_to_all(&[&a, &b], 0, 1).unwrap();
        assert_eq!(out[0], arr(&[2, 1], vec![1.0, 3.0]));
        assert_eq!(out[1], arr(&[2, 1], vec![2.0, 4.0]));
    }

    #[test]
    fn test_slice_local() {
        let full = arr(&[4], vec![1.0, 2.0, 3.0, 4.0]);
        let out = slice_local(&[&full, &full], 0);
        assert_eq!(out[0], arr(&[2], vec![1.0, 2.0]));
        assert_eq!(out[1], arr(&[2], vec![3.0, 4.0]));
    }

    #[test]
    fn test_embed_to_partial_sums_to_gather() {
        let a = arr(&[1, 2], vec![1.0, 2.0]);
        let b = arr(&[1, 2], vec![3.0, 4.0]);
        let out = embed_to_partial(&[&a, &b], 0);
        let sum = &out[0] + &out[1];
        assert_eq!(sum, arr(&[2, 2], vec![1.0, 2.0, 3.0, 4.0]));
    }
}
