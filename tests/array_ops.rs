//! Array node behavior: widening, scans, and the packed-width round-trip
//! invariants.

use packdb::{NodeKind, NodePool, SlabAlloc, Width};
use proptest::prelude::*;
use rand::prelude::*;
use rand::Rng;

fn with_pool<R>(f: impl FnOnce(&mut NodePool<'_>) -> R) -> R {
    let mut alloc = SlabAlloc::new();
    alloc.attach_empty();
    let mut pool = NodePool::new(&mut alloc);
    f(&mut pool)
}

#[test]
fn widen_on_set() {
    // A three-element width-2 node widens to 32 bits when a large value
    // lands in the middle.
    with_pool(|pool| {
        let node = pool.create_empty(NodeKind::Normal).unwrap();
        pool.add(node, 1).unwrap();
        pool.add(node, 2).unwrap();
        pool.add(node, 3).unwrap();
        assert_eq!(pool.width_bits(node), 2);

        pool.set(node, 1, 1_000_000).unwrap();

        assert_eq!(pool.width_bits(node), 32);
        let values: Vec<i64> = (0..3).map(|i| pool.get(node, i)).collect();
        assert_eq!(values, vec![1, 1_000_000, 3]);
    });
}

#[test]
fn find_across_widths() {
    // 1000 random int16 values containing 7 exactly three times.
    with_pool(|pool| {
        let node = pool.create_empty(NodeKind::Normal).unwrap();
        let mut rng = StdRng::seed_from_u64(0x5EED);

        for i in 0..1000 {
            let v = if [42, 499, 877].contains(&i) {
                7
            } else {
                // keep the node at width 16 and the needle unique
                loop {
                    let v = rng.gen_range(-30000..30000i64);
                    if v != 7 {
                        break v;
                    }
                }
            };
            pool.add(node, v).unwrap();
        }
        // force width 16 even if the random draw stayed narrow
        assert_eq!(pool.width_bits(node), 16);

        assert_eq!(pool.find(node, 7, 0, 1000), Some(42));

        let out = pool.create_empty(NodeKind::Normal).unwrap();
        pool.find_all(out, node, 7, 0, 0, 1000).unwrap();
        let hits: Vec<i64> = (0..pool.len(out)).map(|i| pool.get(out, i)).collect();
        assert_eq!(hits, vec![42, 499, 877]);
    });
}

#[test]
fn find_all_applies_the_caller_offset() {
    with_pool(|pool| {
        let node = pool.create_empty(NodeKind::Normal).unwrap();
        for v in [5, 9, 5, 1] {
            pool.add(node, v).unwrap();
        }
        let out = pool.create_empty(NodeKind::Normal).unwrap();
        pool.find_all(out, node, 5, 1000, 0, 4).unwrap();

        let hits: Vec<i64> = (0..pool.len(out)).map(|i| pool.get(out, i)).collect();
        assert_eq!(hits, vec![1000, 1002]);
    });
}

#[test]
fn values_too_wide_for_the_node_are_never_scanned() {
    with_pool(|pool| {
        let node = pool.create_empty(NodeKind::Normal).unwrap();
        for v in [1, 2, 3] {
            pool.add(node, v).unwrap();
        }
        assert_eq!(pool.width_bits(node), 2);
        // 100 needs 8 bits; a width-2 node cannot contain it
        assert_eq!(pool.find(node, 100, 0, 3), None);
        assert_eq!(pool.find(node, -1, 0, 3), None);
    });
}

#[test]
fn zero_width_nodes_answer_find_for_zero_only() {
    with_pool(|pool| {
        let node = pool.create_empty(NodeKind::Normal).unwrap();
        for _ in 0..10 {
            pool.add(node, 0).unwrap();
        }
        assert_eq!(pool.width_bits(node), 0);
        assert_eq!(pool.find(node, 0, 3, 10), Some(3));
        assert_eq!(pool.find(node, 1, 0, 10), None);
        assert_eq!(pool.sum(node, 0, 10), 0);
    });
}

fn width_strategy() -> impl Strategy<Value = (Width, std::ops::RangeInclusive<i64>)> {
    prop_oneof![
        Just((Width::W1, 0..=1i64)),
        Just((Width::W2, 0..=3i64)),
        Just((Width::W4, 0..=15i64)),
        Just((Width::W8, i8::MIN as i64..=i8::MAX as i64)),
        Just((Width::W16, i16::MIN as i64..=i16::MAX as i64)),
        Just((Width::W32, i32::MIN as i64..=i32::MAX as i64)),
        Just((Width::W64, i64::MIN..=i64::MAX)),
    ]
}

proptest! {
    #[test]
    fn roundtrip_on_all_widths(
        (width, range) in width_strategy(),
        seed in any::<u64>(),
        count in 1usize..300,
    ) {
        let mut rng = StdRng::seed_from_u64(seed);
        let values: Vec<i64> = (0..count).map(|_| rng.gen_range(range.clone())).collect();

        with_pool(|pool| {
            let node = pool.create_empty(NodeKind::Normal).unwrap();
            for &v in &values {
                pool.add(node, v).unwrap();
            }

            prop_assert!(pool.width_bits(node) <= width.bits());
            prop_assert_eq!(pool.len(node), values.len());
            for (i, &v) in values.iter().enumerate() {
                prop_assert_eq!(pool.get(node, i), v);
            }
            Ok(())
        })?;
    }

    #[test]
    fn insert_and_delete_track_length(
        ops in prop::collection::vec((any::<bool>(), any::<u16>(), -5000i64..5000), 1..120),
    ) {
        with_pool(|pool| {
            let node = pool.create_empty(NodeKind::Normal).unwrap();
            let mut model: Vec<i64> = Vec::new();

            for (is_insert, pos, value) in ops {
                if is_insert || model.is_empty() {
                    let at = pos as usize % (model.len() + 1);
                    pool.insert(node, at, value).unwrap();
                    model.insert(at, value);
                } else {
                    let at = pos as usize % model.len();
                    pool.delete(node, at).unwrap();
                    model.remove(at);
                }
                prop_assert_eq!(pool.len(node), model.len());
            }

            for (i, &v) in model.iter().enumerate() {
                prop_assert_eq!(pool.get(node, i), v);
            }
            Ok(())
        })?;
    }

    #[test]
    fn set_then_get_is_identity(
        initial in prop::collection::vec(-100i64..100, 1..80),
        index in any::<prop::sample::Index>(),
        value in any::<i64>(),
    ) {
        with_pool(|pool| {
            let node = pool.create_empty(NodeKind::Normal).unwrap();
            for &v in &initial {
                pool.add(node, v).unwrap();
            }
            let i = index.index(initial.len());
            pool.set(node, i, value).unwrap();

            prop_assert_eq!(pool.get(node, i), value);
            for (j, &v) in initial.iter().enumerate() {
                if j != i {
                    prop_assert_eq!(pool.get(node, j), v);
                }
            }
            Ok(())
        })?;
    }

    #[test]
    fn find_returns_the_minimal_matching_index(
        values in prop::collection::vec(-300i64..300, 1..250),
        probe in -300i64..300,
    ) {
        with_pool(|pool| {
            let node = pool.create_empty(NodeKind::Normal).unwrap();
            for &v in &values {
                pool.add(node, v).unwrap();
            }

            let expected = values.iter().position(|&v| v == probe);
            prop_assert_eq!(pool.find(node, probe, 0, values.len()), expected);
            Ok(())
        })?;
    }

    #[test]
    fn sum_equals_element_wise_fold(
        values in prop::collection::vec(-10_000i64..10_000, 0..250),
        bounds in (any::<prop::sample::Index>(), any::<prop::sample::Index>()),
    ) {
        with_pool(|pool| {
            let node = pool.create_empty(NodeKind::Normal).unwrap();
            for &v in &values {
                pool.add(node, v).unwrap();
            }

            let (a, b) = (
                bounds.0.index(values.len() + 1),
                bounds.1.index(values.len() + 1),
            );
            let (start, end) = (a.min(b), a.max(b));
            let expected: i64 = values[start..end].iter().sum();
            prop_assert_eq!(pool.sum(node, start, end), expected);
            Ok(())
        })?;
    }
}
