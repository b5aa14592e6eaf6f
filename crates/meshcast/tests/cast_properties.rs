//! Value-preservation checks for distribution casts, exercised over the
//! placement pairs that matter in practice: flat and two-level hierarchies,
//! partial-sum sources, uneven splits, and cross-hierarchy moves.

use meshcast::cast;
use meshcast::sharding::Placement;
use meshcast::testing::assert_allclose;
use meshcast::ShardedTensor;
use ndarray::{ArrayD, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn random(shape: &[usize], seed: u64) -> ArrayD<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    let n: usize = shape.iter().product();
    ArrayD::from_shape_vec(IxDyn(shape), (0..n).map(|_| rng.random::<f32>()).collect())
        .expect("shape and element count agree")
}

/// Casts `x` from `src` to `dst` and checks the logical value survives.
///
/// When the target has no partial-sum axis the physical shards are fully
/// determined, so they are additionally compared against a direct scatter
/// under the target placement.
fn check_cast(x: &ArrayD<f32>, src: &Placement, dst: &Placement) {
    let t = ShardedTensor::scatter(x, src.clone()).expect("scatter under source");
    let out = cast::cast(&t, dst).unwrap_or_else(|e| panic!("cast {src} -> {dst}: {e}"));
    assert_eq!(out.placement(), dst);
    assert_allclose(&out.assemble().expect("assemble result"), x);

    if !dst
        .distribution()
        .iter()
        .any(|d| matches!(d, meshcast::sharding::Distribution::PartialSum))
    {
        let direct = ShardedTensor::scatter(x, dst.clone()).expect("scatter under target");
        for device in 0..out.num_shards() {
            assert_eq!(
                out.shard(device),
                direct.shard(device),
                "shard {device} for {src} -> {dst}"
            );
        }
    }
}

fn placement(mesh: &[usize], tags: &[&str]) -> Placement {
    Placement::from_tags(mesh, tags).expect("valid placement")
}

#[test]
fn test_flat_single_axis_pairs() {
    let x = random(&[8, 4], 1);
    let tags = ["B", "S(0)", "S(1)", "P"];
    for from in tags {
        for to in tags {
            check_cast(&x, &placement(&[4], &[from]), &placement(&[4], &[to]));
        }
    }
}

#[test]
fn test_two_level_all_pairs() {
    let x = random(&[8, 4], 2);
    let tags = ["B", "S(0)", "S(1)", "P"];
    for a in tags {
        for b in tags {
            for c in tags {
                for d in tags {
                    check_cast(
                        &x,
                        &placement(&[2, 2], &[a, b]),
                        &placement(&[2, 2], &[c, d]),
                    );
                }
            }
        }
    }
}

#[test]
fn test_nested_split_release() {
    // The outer axis cannot change while the inner one still splits the same
    // tensor axis; the plan must release the inner split first and restore it.
    let x = random(&[8, 4], 3);
    check_cast(
        &x,
        &placement(&[2, 2], &["B", "S(0)"]),
        &placement(&[2, 2], &["S(0)", "S(0)"]),
    );
    check_cast(
        &x,
        &placement(&[2, 2], &["S(0)", "S(0)"]),
        &placement(&[2, 2], &["B", "S(0)"]),
    );
    check_cast(
        &x,
        &placement(&[2, 2], &["S(0)", "S(0)"]),
        &placement(&[2, 2], &["S(1)", "S(0)"]),
    );
}

#[test]
fn test_cross_hierarchy_moves() {
    let x = random(&[8, 4], 4);
    let cases = [
        (placement(&[2, 2], &["B", "B"]), placement(&[4], &["S(0)"])),
        (placement(&[2, 2], &["S(0)", "B"]), placement(&[4], &["B"])),
        (
            placement(&[2, 2], &["S(0)", "S(0)"]),
            placement(&[4], &["S(0)"]),
        ),
        (
            placement(&[4], &["S(0)"]),
            placement(&[2, 2], &["S(0)", "S(0)"]),
        ),
        (
            placement(&[2, 2], &["S(0)", "S(1)"]),
            placement(&[4], &["S(1)"]),
        ),
        (
            placement(&[4], &["P"]),
            placement(&[2, 2], &["S(1)", "S(1)"]),
        ),
    ];
    for (src, dst) in &cases {
        check_cast(&x, src, dst);
    }
}

#[test]
fn test_uneven_shapes() {
    let x = random(&[7, 5], 5);
    check_cast(
        &x,
        &placement(&[4], &["S(0)"]),
        &placement(&[4], &["S(1)"]),
    );
    check_cast(
        &x,
        &placement(&[2, 2], &["S(0)", "S(1)"]),
        &placement(&[2, 2], &["B", "B"]),
    );
    check_cast(
        &x,
        &placement(&[2, 2], &["B", "B"]),
        &placement(&[2, 2], &["S(1)", "S(0)"]),
    );
}

#[test]
fn test_integer_tensors_cast() {
    let x = ArrayD::from_shape_vec(IxDyn(&[6]), (0..6).collect::<Vec<i32>>())
        .expect("shape and element count agree");
    let src = placement(&[2], &["B"]);
    let dst = placement(&[2], &["S(0)"]);
    let t = ShardedTensor::scatter(&x, src).expect("scatter");
    let out = cast::cast(&t, &dst).expect("cast");
    assert_eq!(out.shard(0).as_slice().expect("contiguous"), &[0, 1, 2]);
    assert_eq!(out.shard(1).as_slice().expect("contiguous"), &[3, 4, 5]);
    assert_eq!(out.assemble().expect("assemble"), x);
}

#[test]
fn test_device_count_mismatch_rejected() {
    let x = random(&[8, 4], 6);
    let t = ShardedTensor::scatter(&x, placement(&[4], &["B"])).expect("scatter");
    let err = cast::cast(&t, &placement(&[2], &["B"])).unwrap_err();
    assert!(matches!(err, meshcast::Error::DeviceCountMismatch { .. }));
}
