//! Collection laws: repeated full collections are idempotent, registered
//! root areas keep their referents alive, and statistics are recorded.

use mostly_gc::{
    alloc_object, collect, collect_full, heap_bytes, last_collect_stats, register_root_area,
    unregister_root_area, CollectKind, GcPtr, Traverse,
};

#[derive(Traverse)]
struct Node {
    left: GcPtr<Node>,
    right: GcPtr<Node>,
    value: i64,
}

fn leaf(value: i64) -> GcPtr<Node> {
    alloc_object(Node {
        left: GcPtr::null(),
        right: GcPtr::null(),
        value,
    })
}

fn tree(depth: u32, value: i64) -> GcPtr<Node> {
    if depth == 0 {
        return leaf(value);
    }
    let mut node = leaf(value);
    node.left = tree(depth - 1, value + 1);
    node.right = tree(depth - 1, value + 1);
    node
}

fn check(node: GcPtr<Node>, depth: u32, value: i64) {
    assert_eq!(node.value, value);
    if depth == 0 {
        assert!(node.left.is_null());
        assert!(node.right.is_null());
    } else {
        check(node.left, depth - 1, value + 1);
        check(node.right, depth - 1, value + 1);
    }
}

#[test]
fn back_to_back_full_collections_change_nothing() {
    let root = tree(10, 0);
    collect_full();
    let size1 = heap_bytes();
    let stats1 = last_collect_stats();
    collect_full();
    let size2 = heap_bytes();
    let stats2 = last_collect_stats();
    assert_eq!(size1, size2);
    assert_eq!(stats1.kind, CollectKind::Full);
    assert_eq!(stats2.kind, CollectKind::Full);
    assert_eq!(stats2.total_collections, stats1.total_collections + 1);
    check(root, 10, 0);
}

#[test]
fn registered_areas_root_their_contents() {
    // A slot in untraced storage; only the registration makes the
    // collector look at it.
    let slot: Box<[GcPtr<Node>; 4]> = Box::new([GcPtr::null(); 4]);
    let slot = Box::leak(slot);
    register_root_area(
        std::ptr::from_ref(slot).cast::<u8>(),
        std::mem::size_of_val(slot),
    );
    for (i, s) in slot.iter_mut().enumerate() {
        *s = leaf(i as i64);
    }
    for _ in 0..3 {
        collect();
    }
    for (i, s) in slot.iter().enumerate() {
        assert_eq!(s.value, i as i64);
    }
    unregister_root_area(std::ptr::from_ref(slot).cast::<u8>());
}

#[test]
fn stats_reflect_collection_activity() {
    let before = last_collect_stats().total_collections;
    let keep = leaf(99);
    collect();
    let stats = last_collect_stats();
    assert_eq!(stats.total_collections, before + 1);
    // The page holding `keep` was promoted from the stack.
    assert!(stats.pages_promoted > 0);
    assert_eq!(keep.value, 99);
}
