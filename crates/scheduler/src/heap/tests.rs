use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::*;

/// Walk every tree and check heap order, parent links, degree counts and
/// that `min` points at the true minimum.
fn check_invariants<T>(heap: &FibonacciHeap<T>) {
    let Some(min) = heap.min else {
        assert_eq!(heap.len, 0);
        return;
    };
    let mut seen = 0;
    let mut stack: Vec<usize> = heap.siblings(min);
    for &root in &stack {
        assert!(heap.node(root).parent.is_none());
        assert!(!heap.precedes(root, min), "min pointer is not minimal");
    }
    while let Some(i) = stack.pop() {
        seen += 1;
        let node = heap.node(i);
        if let Some(c) = node.child {
            let children = heap.siblings(c);
            assert_eq!(children.len(), node.degree);
            for &child in &children {
                assert_eq!(heap.node(child).parent, Some(i));
                assert!(!heap.precedes(child, i), "child precedes parent");
            }
            stack.extend(children);
        } else {
            assert_eq!(node.degree, 0);
        }
    }
    assert_eq!(seen, heap.len);
}

fn drain<T>(heap: &mut FibonacciHeap<T>) -> Vec<(f64, T)> {
    let mut out = Vec::new();
    while let Ok(entry) = heap.extract_min() {
        check_invariants(heap);
        out.push(entry);
    }
    out
}

#[test]
fn extracts_in_key_order() {
    let mut heap = FibonacciHeap::new();
    for (k, name) in [(3.0, "c"), (1.0, "a"), (4.0, "d"), (2.0, "b")] {
        heap.insert(k, name);
    }
    let keys: Vec<f64> = drain(&mut heap).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![1.0, 2.0, 3.0, 4.0]);
    assert!(heap.is_empty());
}

#[test]
fn decrease_key_reorders() {
    let mut heap = FibonacciHeap::new();
    let a = heap.insert(5.0, "A");
    heap.insert(3.0, "B");
    let c = heap.insert(7.0, "C");

    heap.decrease_key(c, 1.0).unwrap();
    assert_eq!(heap.extract_min().unwrap(), (1.0, "C"));

    heap.decrease_key(a, 2.0).unwrap();
    assert_eq!(heap.extract_min().unwrap(), (2.0, "A"));
    assert_eq!(heap.extract_min().unwrap(), (3.0, "B"));
    assert_eq!(heap.extract_min(), Err(HeapError::Empty));
}

#[test]
fn decrease_key_after_consolidation_cuts_from_parent() {
    let mut heap = FibonacciHeap::new();
    let handles: Vec<Handle> = (0..16).map(|i| heap.insert(i as f64 * 10.0, i)).collect();
    // Forces a consolidation so later entries sit below other roots.
    heap.extract_min().unwrap();
    check_invariants(&heap);

    heap.decrease_key(handles[15], 1.0).unwrap();
    check_invariants(&heap);
    heap.decrease_key(handles[14], 2.0).unwrap();
    heap.decrease_key(handles[13], 3.0).unwrap();
    check_invariants(&heap);

    let items: Vec<i32> = drain(&mut heap).into_iter().map(|(_, i)| i).take(4).collect();
    assert_eq!(items, vec![15, 14, 13, 1]);
}

#[test]
fn non_decreasing_key_is_rejected_without_change() {
    let mut heap = FibonacciHeap::new();
    let a = heap.insert(4.0, "a");
    heap.insert(6.0, "b");

    for bad in [4.0, 9.0, f64::NAN] {
        let err = heap.decrease_key(a, bad).unwrap_err();
        assert!(matches!(err, HeapError::InvalidKey { current, .. } if current == 4.0));
        assert!(!err.is_underflow());
    }
    assert_eq!(heap.key(a).unwrap(), 4.0);
    assert_eq!(heap.peek_min(), Some(4.0));
    assert_eq!(heap.len(), 2);
}

#[test]
fn empty_heap_errors() {
    let mut heap: FibonacciHeap<u32> = FibonacciHeap::new();
    assert_eq!(heap.peek_min(), None);
    let err = heap.extract_min().unwrap_err();
    assert!(err.is_underflow());
}

#[test]
fn stale_handle_is_rejected() {
    let mut heap = FibonacciHeap::new();
    let a = heap.insert(1.0, "a");
    heap.extract_min().unwrap();

    // The slot is reused by the next insert; the old handle must not alias it.
    let b = heap.insert(2.0, "b");
    assert_ne!(a, b);
    assert!(matches!(heap.decrease_key(a, 0.0), Err(HeapError::StaleHandle(_))));
    assert!(heap.delete(a).unwrap_err().is_underflow());
    assert_eq!(heap.get(a), None);
    assert_eq!(heap.get(b), Some(&"b"));
}

#[test]
fn delete_arbitrary_entries() {
    let mut heap = FibonacciHeap::new();
    let handles: Vec<Handle> = (0..10).map(|i| heap.insert(i as f64, i)).collect();
    heap.extract_min().unwrap();

    assert_eq!(heap.delete(handles[5]).unwrap(), (5.0, 5));
    check_invariants(&heap);
    assert_eq!(heap.delete(handles[1]).unwrap(), (1.0, 1));
    check_invariants(&heap);
    assert!(!heap.contains(handles[1]));

    let items: Vec<i32> = drain(&mut heap).into_iter().map(|(_, i)| i).collect();
    assert_eq!(items, vec![2, 3, 4, 6, 7, 8, 9]);
}

#[test]
fn equal_keys_pop_in_insertion_order() {
    let mut heap = FibonacciHeap::new();
    for i in 0..8 {
        heap.insert(1.0, i);
    }
    heap.insert(0.5, 100);
    let items: Vec<i32> = drain(&mut heap).into_iter().map(|(_, i)| i).collect();
    assert_eq!(items, vec![100, 0, 1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn merge_combines_both_heaps() {
    let mut left = FibonacciHeap::new();
    left.insert(4.0, "l4");
    left.insert(2.0, "l2");
    let mut right = FibonacciHeap::new();
    right.insert(1.0, "r1");
    right.insert(3.0, "r3");

    let mut merged = left.merge(right);
    assert_eq!(merged.len(), 4);
    assert_eq!(merged.peek_min(), Some(1.0));
    let items: Vec<&str> = drain(&mut merged).into_iter().map(|(_, i)| i).collect();
    assert_eq!(items, vec!["r1", "l2", "r3", "l4"]);
}

#[test]
fn absorb_translates_handles() {
    let mut left = FibonacciHeap::new();
    left.insert(10.0, "l");
    let gone = left.insert(0.0, "gone");
    left.extract_min().unwrap();
    assert!(!left.contains(gone));

    let mut right = FibonacciHeap::new();
    let r = right.insert(20.0, "r");
    right.insert(5.0, "r5");
    right.extract_min().unwrap();

    let rebase = left.absorb(right);
    let moved = rebase.translate(r);
    assert_eq!(left.get(moved), Some(&"r"));
    left.decrease_key(moved, 1.0).unwrap();
    check_invariants(&left);
    assert_eq!(left.extract_min().unwrap(), (1.0, "r"));
    assert_eq!(left.extract_min().unwrap(), (10.0, "l"));

    // Freed slots carried over from the absorbed arena are reusable.
    let fresh = left.insert(7.0, "fresh");
    assert_eq!(left.get(fresh), Some(&"fresh"));
}

#[test]
fn absorb_into_empty_heap() {
    let mut empty = FibonacciHeap::new();
    let mut other = FibonacciHeap::new();
    let h = other.insert(3.0, 3u8);
    let rebase = empty.absorb(other);
    assert_eq!(empty.key(rebase.translate(h)).unwrap(), 3.0);
    assert_eq!(empty.peek_min_entry(), Some((3.0, &3u8)));
}

#[test]
fn interleaved_operations_extract_non_decreasing() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for _ in 0..20 {
        let mut heap = FibonacciHeap::new();
        let mut live: Vec<Handle> = Vec::new();
        let mut last = f64::NEG_INFINITY;

        for step in 0..400u32 {
            match rng.gen_range(0..10) {
                0..=4 => {
                    // Keys never drop below what was already extracted.
                    let key = last.max(0.0) + f64::from(rng.gen_range(0..1000u32));
                    live.push(heap.insert(key, step));
                }
                5..=6 if !live.is_empty() => {
                    let idx = rng.gen_range(0..live.len());
                    let h = live[idx];
                    let current = heap.key(h).unwrap();
                    let target = last.max(0.0) + f64::from(rng.gen_range(0..1000u32));
                    match heap.decrease_key(h, target) {
                        Ok(()) => assert!(target < current),
                        Err(HeapError::InvalidKey { .. }) => {
                            assert!(target >= current);
                            assert_eq!(heap.key(h).unwrap(), current);
                        }
                        Err(e) => panic!("unexpected error {e}"),
                    }
                }
                7 if !live.is_empty() => {
                    let idx = rng.gen_range(0..live.len());
                    let h = live.swap_remove(idx);
                    heap.delete(h).unwrap();
                }
                _ => {
                    if let Ok((key, _)) = heap.extract_min() {
                        assert!(key >= last, "extracted {key} after {last}");
                        last = key;
                        live.retain(|h| heap.contains(*h));
                    }
                }
            }
            check_invariants(&heap);
        }

        let rest = drain(&mut heap);
        for pair in rest.windows(2) {
            assert!(pair[0].0 <= pair[1].0);
        }
    }
}
