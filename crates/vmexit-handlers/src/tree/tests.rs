use proptest::prelude::*;
use vmexit_core::{InterceptError, Pa};

use super::{HandlerRecord, NIL, PhysHandlerTree, RecordHandle};
use crate::TypeHandle;

fn record(first: u64, last: u64) -> HandlerRecord {
    HandlerRecord::new(Pa(first), Pa(last), TypeHandle(0), first, "test")
}

/// Checks ordering, disjointness, cached heights and AVL balance.
fn check_invariants(tree: &PhysHandlerTree) {
    fn walk(tree: &PhysHandlerTree, index: u32) -> (u8, usize) {
        if index == NIL {
            return (0, 0);
        }

        let node = tree.node(index);
        let (lh, lc) = walk(tree, node.left);
        let (rh, rc) = walk(tree, node.right);

        assert!((lh as i16 - rh as i16).abs() <= 1, "unbalanced node");
        assert_eq!(node.height, 1 + lh.max(rh), "stale height");
        (node.height, lc + rc + 1)
    }

    let (_, count) = walk(tree, tree.root);
    assert_eq!(count, tree.len());

    let ranges: Vec<_> = tree.iter().map(|(_, r)| (r.first(), r.last())).collect();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 < pair[1].0, "overlap or disorder: {pair:?}");
    }
}

#[test]
fn insert_and_find_exact() -> Result<(), InterceptError> {
    let mut tree = PhysHandlerTree::new(16);
    let handle = tree.insert(HandlerRecord::new(
        Pa(0x1000),
        Pa(0x1fff),
        TypeHandle(3),
        0xdead,
        "mmio",
    ))?;

    assert_eq!(tree.find_exact(Pa(0x1000), Pa(0x1fff)), Some(handle));
    assert_eq!(tree.find_exact(Pa(0x1000), Pa(0x1ffe)), None);

    let found = tree.get(handle).ok_or(InterceptError::NotFound)?;
    assert_eq!(found.type_handle(), TypeHandle(3));
    assert_eq!(found.user_tag(), 0xdead);
    assert_eq!(found.page_count(), 1);

    tree.remove(handle)?;
    assert_eq!(tree.find_exact(Pa(0x1000), Pa(0x1fff)), None);
    Ok(())
}

#[test]
fn rejects_overlap_and_inverted_ranges() -> Result<(), InterceptError> {
    let mut tree = PhysHandlerTree::new(16);
    tree.insert(record(0x1000, 0x1fff))?;
    tree.insert(record(0x3000, 0x3fff))?;

    for (first, last) in [(0x1fff, 0x2000), (0x0, 0x1000), (0x1800, 0x1900), (0x0, 0xffff)] {
        assert!(matches!(
            tree.insert(record(first, last)),
            Err(InterceptError::RangeOverlap { .. })
        ));
    }

    assert!(matches!(
        tree.insert(record(0x5000, 0x4fff)),
        Err(InterceptError::InvalidRange { .. })
    ));

    tree.insert(record(0x2000, 0x2fff))?;
    assert_eq!(tree.len(), 3);
    check_invariants(&tree);
    Ok(())
}

#[test]
fn remove_twice_is_not_found() -> Result<(), InterceptError> {
    let mut tree = PhysHandlerTree::new(4);
    let handle = tree.insert(record(0x1000, 0x1fff))?;
    tree.remove(handle)?;

    assert!(matches!(tree.remove(handle), Err(InterceptError::NotFound)));

    // The slot is reused, but the stale handle must not resolve to it.
    let reused = tree.insert(record(0x1000, 0x1fff))?;
    assert_ne!(reused, handle);
    assert!(tree.get(handle).is_none());
    assert!(matches!(tree.remove(handle), Err(InterceptError::NotFound)));
    assert!(tree.get(reused).is_some());
    Ok(())
}

#[test]
fn capacity_is_fixed() -> Result<(), InterceptError> {
    let mut tree = PhysHandlerTree::new(2);
    tree.insert(record(0x0, 0xfff))?;
    tree.insert(record(0x1000, 0x1fff))?;

    assert!(matches!(
        tree.insert(record(0x2000, 0x2fff)),
        Err(InterceptError::OutOfResources(_))
    ));
    Ok(())
}

#[test]
fn neighbour_lookups() -> Result<(), InterceptError> {
    let mut tree = PhysHandlerTree::new(16);
    let low = tree.insert(record(0xa000, 0xa0ff))?;
    let high = tree.insert(record(0xa800, 0xa8ff))?;

    assert_eq!(tree.lookup(Pa(0xa050)), Some(low));
    assert_eq!(tree.lookup(Pa(0xa100)), None);

    assert_eq!(tree.lookup_matching_or_above(Pa(0xa100)), Some(high));
    assert_eq!(tree.lookup_matching_or_above(Pa(0xa0ff)), Some(low));
    assert_eq!(tree.lookup_matching_or_above(Pa(0xa900)), None);

    assert_eq!(tree.lookup_matching_or_below(Pa(0xa7ff)), Some(low));
    assert_eq!(tree.lookup_matching_or_below(Pa(0xa900)), Some(high));
    assert_eq!(tree.lookup_matching_or_below(Pa(0x9fff)), None);

    assert_eq!(tree.intersecting(Pa(0xa000), Pa(0xafff)).as_slice(), [low, high]);
    assert!(tree.intersecting(Pa(0xa100), Pa(0xa7ff)).is_empty());
    Ok(())
}

#[test]
fn visits_in_address_order() -> Result<(), InterceptError> {
    let mut tree = PhysHandlerTree::new(64);

    for page in [7u64, 3, 11, 1, 5, 9, 13, 0, 2] {
        tree.insert(record(page << 12, (page << 12) | 0xfff))?;
    }

    let mut ascending = Vec::new();
    tree.visit_ascending(|_, r| ascending.push(r.first().0 >> 12));
    assert_eq!(ascending, [0, 1, 2, 3, 5, 7, 9, 11, 13]);

    let mut descending = Vec::new();
    tree.visit_descending(|_, r| descending.push(r.first().0 >> 12));
    ascending.reverse();
    assert_eq!(descending, ascending);
    Ok(())
}

#[test]
fn stays_balanced_under_sequential_inserts() -> Result<(), InterceptError> {
    let mut tree = PhysHandlerTree::new(1024);
    let mut handles = Vec::new();

    for page in 0..1000u64 {
        handles.push(tree.insert(record(page << 12, (page << 12) | 0xfff))?);
    }

    // AVL height bound: 1.44 * log2(1001) < 15.
    assert!(tree.height() <= 14);
    check_invariants(&tree);

    for handle in handles.iter().step_by(2) {
        tree.remove(*handle)?;
    }

    assert_eq!(tree.len(), 500);
    check_invariants(&tree);
    Ok(())
}

#[derive(Debug, Clone)]
enum Op {
    Insert(u64, u64),
    Remove(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0u64..0x40, 0u64..0x8).prop_map(|(start, len)| Op::Insert(start * 0x100, len * 0x100 + 0xff)),
        any::<usize>().prop_map(Op::Remove),
    ]
}

proptest! {
    #[test]
    fn never_holds_overlapping_ranges(ops in proptest::collection::vec(op(), 1..200)) {
        let mut tree = PhysHandlerTree::new(256);
        let mut model: Vec<(RecordHandle, u64, u64)> = Vec::new();

        for op in ops {
            match op {
                Op::Insert(first, len) => {
                    let last = first + len;
                    let overlaps = model.iter().any(|&(_, f, l)| first <= l && f <= last);

                    match tree.insert(record(first, last)) {
                        Ok(handle) => {
                            prop_assert!(!overlaps);
                            model.push((handle, first, last));
                        }
                        Err(InterceptError::RangeOverlap { .. }) => prop_assert!(overlaps),
                        Err(err) => prop_assert!(false, "unexpected error {err}"),
                    }
                }
                Op::Remove(index) if !model.is_empty() => {
                    let (handle, first, last) = model.swap_remove(index % model.len());
                    let removed = tree.remove(handle);
                    prop_assert!(removed.is_ok_and(|r| r.first() == Pa(first) && r.last() == Pa(last)));
                }
                Op::Remove(_) => {}
            }

            check_invariants(&tree);
            prop_assert_eq!(tree.len(), model.len());
        }

        for &(handle, first, last) in &model {
            prop_assert_eq!(tree.find_exact(Pa(first), Pa(last)), Some(handle));
            prop_assert_eq!(tree.lookup(Pa(first + (last - first) / 2)), Some(handle));
        }
    }
}
