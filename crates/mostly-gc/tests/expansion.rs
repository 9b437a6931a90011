//! Heap expansion under load: live data outgrows the initial heap, so
//! collections must expand it, within the configured maximum.

use mostly_gc::{alloc_array, collect, configure, heap_bytes, Config, GcArray, GcPtr};

const BLOCKS: usize = 22;
const INTS_PER_BLOCK: usize = 25_000;

#[test]
fn live_data_forces_expansion() {
    configure(
        Config::new()
            .min_heap(1 << 20)
            .max_heap(10 << 20)
            .inc_heap(2 << 20),
    );
    mostly_gc::init();
    let initial = heap_bytes();
    assert!(initial >= 1 << 20);

    let mut blocks: [GcPtr<GcArray<i32>>; BLOCKS] = [GcPtr::null(); BLOCKS];
    for (k, slot) in blocks.iter_mut().enumerate() {
        let mut block = alloc_array::<i32>(INTS_PER_BLOCK);
        for (j, elem) in block.as_mut_slice().iter_mut().enumerate() {
            *elem = (k * INTS_PER_BLOCK + j) as i32;
        }
        *slot = block;
        collect();
    }

    // Everything is live, so the heap had to grow past its initial size
    // while staying within the maximum.
    assert!(heap_bytes() > initial, "no expansion happened");
    assert!(heap_bytes() <= (10 << 20) + (2 << 20), "heap exceeded maximum");

    for (k, block) in blocks.iter().enumerate() {
        let data = block.as_slice();
        assert_eq!(data.len(), INTS_PER_BLOCK);
        for (j, &elem) in data.iter().enumerate() {
            assert_eq!(elem as usize, k * INTS_PER_BLOCK + j, "block {k} damaged at {j}");
        }
    }
}
