//! A long list where every cell's `next` points at the next-allocated
//! cell — usually a forward reference within the same page. During
//! compaction the scavenge of such a pointer must defer to the sweep
//! cursor instead of recursing.

use mostly_gc::{alloc_object, collect, GcPtr, Traverse};

const CELLS: usize = 100_000;

#[derive(Traverse)]
struct Cell {
    next: GcPtr<Cell>,
    value: usize,
}

#[test]
fn forward_linked_list_survives_compaction() {
    let head = alloc_object(Cell {
        next: GcPtr::null(),
        value: 0,
    });
    let mut cur = head;
    for i in 1..CELLS {
        let next = alloc_object(Cell {
            next: GcPtr::null(),
            value: i,
        });
        cur.next = next;
        cur = next;
    }

    collect();
    collect();

    let mut walk = head;
    for i in 0..CELLS {
        assert_eq!(walk.value, i, "list damaged at {i}");
        walk = walk.next;
    }
    assert!(walk.is_null());
}
