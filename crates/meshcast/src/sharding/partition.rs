use std::ops::Range;

use super::{Distribution, Placement};

/// Splits `len` indices into `parts` contiguous ranges.
///
/// The first `len % parts` ranges receive one extra element, so shard sizes
/// differ by at most one and the split is stable for any length, including
/// lengths smaller than the part count (trailing ranges are then empty).
pub fn balanced_parts(len: usize, parts: usize) -> Vec<Range<usize>> {
    let base = len / parts;
    let rem = len % parts;
    let mut out = Vec::with_capacity(parts);
    let mut start = 0;
    for i in 0..parts {
        let end = start + base + usize::from(i < rem);
        out.push(start..end);
        start = end;
    }
    out
}

/// The portion of a logical tensor that one device physically holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardRegion {
    /// Half-open index range per tensor axis.
    pub ranges: Vec<Range<usize>>,
    /// Whether the buffer holds zeros instead of the sliced values. This is
    /// the canonical partial-sum layout for non-root devices.
    pub zeroed: bool,
}

/// Computes the region of `shape` held by `device` under `placement`.
///
/// Mesh axes are applied in order, each narrowing the ranges produced by the
/// axes before it. A device whose coordinate is nonzero on any partial-sum
/// axis holds a zero buffer of the region shape.
pub fn shard_region(shape: &[usize], placement: &Placement, device: usize) -> ShardRegion {
    let mesh = placement.mesh();
    let coords = mesh.coords(device);
    let mut ranges: Vec<Range<usize>> = shape.iter().map(|&n| 0..n).collect();
    let mut zeroed = false;
    for (axis, dist) in placement.distribution().iter().enumerate() {
        match *dist {
            Distribution::Broadcast => {}
            Distribution::PartialSum => {
                if coords[axis] != 0 {
                    zeroed = true;
                }
            }
            Distribution::Split(k) => {
                let cur = ranges[k].clone();
                let parts = balanced_parts(cur.len(), mesh.axis_size(axis));
                let part = &parts[coords[axis]];
                ranges[k] = cur.start + part.start..cur.start + part.end;
            }
        }
    }
    ShardRegion { ranges, zeroed }
}

/// Whether two placements give every device the exact same physical buffer.
///
/// Layout-identical placements can be converted into each other by relabeling
/// the hierarchy, with no data movement. `[2, 2][S(0), S(0)]` and
/// `[4][S(0)]` are identical whenever the split axis divides evenly, as are
/// `[2, 2][B, B]` and `[4][B]` always.
pub fn layout_identical(shape: &[usize], a: &Placement, b: &Placement) -> bool {
    if a.mesh().num_devices() != b.mesh().num_devices() {
        return false;
    }
    (0..a.mesh().num_devices())
        .all(|device| shard_region(shape, a, device) == shard_region(shape, b, device))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_balanced_parts_even() {
        assert_eq!(balanced_parts(8, 4), vec![0..2, 2..4, 4..6, 6..8]);
    }

    #[test]
    fn test_balanced_parts_uneven() {
        assert_eq!(balanced_parts(5, 2), vec![0..3, 3..5]);
        assert_eq!(balanced_parts(1, 2), vec![0..1, 1..1]);
    }

    #[test]
    fn test_nested_split_regions() {
        let placement = Placement::from_tags(&[2, 2], &["S(0)", "S(0)"]).unwrap();
        let regions: Vec<_> = (0..4)
            .map(|d| shard_region(&[8, 3], &placement, d).ranges[0].clone())
            .collect();
        assert_eq!(regions, vec![0..2, 2..4, 4..6, 6..8]);
    }

    #[test]
    fn test_partial_sum_zeroes_nonroot() {
        let placement = Placement::from_tags(&[2, 2], &["S(0)", "P"]).unwrap();
        assert!(!shard_region(&[4, 4], &placement, 0).zeroed);
        assert!(shard_region(&[4, 4], &placement, 1).zeroed);
        assert_eq!(
            shard_region(&[4, 4], &placement, 3).ranges,
            vec![2..4, 0..4]
        );
    }

    #[test]
    fn test_layout_identical_collapse() {
        let nested = Placement::from_tags(&[2, 2], &["S(0)", "S(0)"]).unwrap();
        let flat = Placement::from_tags(&[4], &["S(0)"]).unwrap();
        assert!(layout_identical(&[8, 4], &nested, &flat));

        let broadcast_nested = Placement::from_tags(&[2, 2], &["B", "B"]).unwrap();
        let broadcast_flat = Placement::from_tags(&[4], &["B"]).unwrap();
        assert!(layout_identical(&[8, 4], &broadcast_nested, &broadcast_flat));
    }

    #[test]
    fn test_layout_not_identical() {
        let nested = Placement::from_tags(&[2, 2], &["S(1)", "S(1)"]).unwrap();
        let flat = Placement::from_tags(&[4], &["S(0)"]).unwrap();
        assert!(!layout_identical(&[8, 8], &nested, &flat));

        let partial = Placement::from_tags(&[4], &["P"]).unwrap();
        let broadcast = Placement::from_tags(&[4], &["B"]).unwrap();
        assert!(!layout_identical(&[8, 8], &partial, &broadcast));
    }
}
