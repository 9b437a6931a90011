//! Pointers to collected cells held in the untraced heap, plus derived
//! pointers into an object's own interior, must survive collections.

use std::ptr::null_mut;

use mostly_gc::{
    alloc_object, configure, flags, uncollected, Config, GcPtr, Traverse,
};

const TOT: usize = 5000;

#[derive(Traverse)]
struct Cell {
    next: GcPtr<Cell>,
    value1: *mut i64,
    value2: i64,
}

fn new_cell(value2: i64) -> GcPtr<Cell> {
    alloc_object(Cell {
        next: GcPtr::null(),
        value1: null_mut(),
        value2,
    })
}

#[test]
fn uncollected_array_and_derived_pointers_survive() {
    configure(Config::new().flags(flags::HEAPROOTS));
    mostly_gc::init();

    // An array in the untraced heap; with HEAPROOTS its words are
    // ambiguous roots.
    let array =
        uncollected::alloc_zeroed(TOT * std::mem::size_of::<GcPtr<Cell>>()).cast::<GcPtr<Cell>>();
    assert!(!array.is_null());

    for i in 0..TOT {
        let cp = new_cell(i as i64);
        unsafe { *array.add(i) = cp };
    }

    // A chain of cells, each pointing into its own value2, with plenty of
    // garbage in between to force implicit collections.
    let mut cl: GcPtr<Cell> = GcPtr::null();
    for i in 0..TOT {
        let _garbage = new_cell(-1);
        let _garbage = new_cell(-2);
        let _garbage = new_cell(-3);
        let mut cp = new_cell(i as i64);
        cp.next = cl;
        cp.value1 = unsafe { std::ptr::addr_of_mut!((*cp.as_ptr()).value2) };
        cl = cp;
    }

    // Cells referenced only from the untraced array still exist.
    for i in 0..TOT {
        let cp = unsafe { *array.add(i) };
        assert_eq!(cp.value2, i as i64, "cell {i} not valid");
    }

    // The chain is intact and every derived pointer was updated along
    // with its object.
    let mut walk = cl;
    for i in (0..TOT).rev() {
        assert_eq!(walk.value2, i as i64, "chain damaged at {i}");
        let own_value2 = unsafe { std::ptr::addr_of_mut!((*walk.as_ptr()).value2) };
        assert_eq!(walk.value1, own_value2, "derived pointer left behind at {i}");
        assert_eq!(unsafe { *walk.value1 }, walk.value2);
        walk = walk.next;
    }
    assert!(walk.is_null());

    uncollected::free(array.cast::<u8>());
}
