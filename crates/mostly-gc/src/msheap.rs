//! Mark-and-sweep companion heap.
//!
//! An opaque heap sharing the page directory with the default collector:
//! explicit `reclaim`, size-classed free lists carved from directory-owned
//! pages, and a conservative mark-and-sweep collection that starts only
//! once the heap's footprint crosses the configured `gc_threshold`. Being
//! opaque, its interior is never traversed by the default collector; a
//! root word landing in one of its pages instead makes that page's words
//! ambiguous roots for the default heap.

use std::collections::HashMap;

use crate::heap::GcState;
use crate::pages::{
    page_addr, page_of, PageId, MARK_SWEEP_HEAP, PAGE_BYTES, UNALLOCATED_SPACE, WORD_BYTES,
};
use crate::platform;
use crate::scan::scan_region;

/// Block size classes. One page holds blocks of a single class.
const CLASSES: [usize; 5] = [16, 32, 64, 128, 256];

/// Requests above the largest class get dedicated page runs.
const MAX_CLASS_BYTES: usize = 256;

const fn class_index(bytes: usize) -> usize {
    let mut i = 0;
    while i < CLASSES.len() {
        if bytes <= CLASSES[i] {
            return i;
        }
        i += 1;
    }
    CLASSES.len()
}

/// State of the companion heap.
pub(crate) struct MarkSweepHeap {
    pub(crate) reserved_pages: usize,
    /// Head of the free-block chain per class; the next link lives in the
    /// block's first word. 0 terminates.
    free_lists: [usize; CLASSES.len()],
    /// Class index per small-object page.
    page_class: HashMap<PageId, usize>,
    /// Allocated-block bits per small-object page, by slot index.
    alloc_mask: HashMap<PageId, u64>,
    /// Dedicated runs for large blocks: head page, run length, bytes.
    large: Vec<(PageId, usize, usize)>,
    pub(crate) allocated_bytes: usize,
}

impl MarkSweepHeap {
    pub(crate) fn new() -> Self {
        Self {
            reserved_pages: 0,
            free_lists: [0; CLASSES.len()],
            page_class: HashMap::new(),
            alloc_mask: HashMap::new(),
            large: Vec::new(),
            allocated_bytes: 0,
        }
    }
}

/// Allocate `bytes` from the companion heap.
pub(crate) fn alloc(st: &mut GcState, bytes: usize) -> *mut u8 {
    maybe_collect(st);
    let bytes = bytes.max(WORD_BYTES);
    if bytes > MAX_CLASS_BYTES {
        return alloc_large(st, bytes);
    }
    let class = class_index(bytes);
    if st.ms.free_lists[class] == 0 {
        carve_page(st, class);
    }
    let block = st.ms.free_lists[class];
    // SAFETY: free blocks chain through their first word.
    st.ms.free_lists[class] = unsafe { *(block as *const usize) };
    // SAFETY: reusing the block; the link word is dead now.
    unsafe { std::ptr::write_bytes(block as *mut u8, 0, CLASSES[class]) };
    let page = page_of(block);
    let slot = (block - page_addr(page)) / CLASSES[class];
    *st.ms.alloc_mask.entry(page).or_insert(0) |= 1 << slot;
    st.ms.allocated_bytes += CLASSES[class];
    st.dir.set_object(block);
    block as *mut u8
}

fn alloc_large(st: &mut GcState, bytes: usize) -> *mut u8 {
    let pages = bytes.div_ceil(PAGE_BYTES);
    let cfg = st.config;
    let first = st.dir.allocate_pages(pages, MARK_SWEEP_HEAP, &cfg);
    st.ms.reserved_pages += pages;
    st.dir.set_group(first, pages as i32);
    for k in 0..pages {
        st.dir.set_space(first + k, UNALLOCATED_SPACE);
        if k > 0 {
            // Continuation pages point back at the head so interior
            // pointers into the run resolve.
            st.dir.set_group(first + k, -(k as i32));
        }
    }
    let addr = page_addr(first);
    // SAFETY: a fresh run owned by this heap.
    unsafe { std::ptr::write_bytes(addr as *mut u8, 0, pages * PAGE_BYTES) };
    st.dir.set_object(addr);
    st.ms.large.push((first, pages, bytes));
    st.ms.allocated_bytes += pages * PAGE_BYTES;
    addr as *mut u8
}

fn carve_page(st: &mut GcState, class: usize) {
    let cfg = st.config;
    let page = st.dir.allocate_pages(1, MARK_SWEEP_HEAP, &cfg);
    st.ms.reserved_pages += 1;
    st.dir.set_space(page, UNALLOCATED_SPACE);
    st.ms.page_class.insert(page, class);
    st.ms.alloc_mask.insert(page, 0);
    let size = CLASSES[class];
    let base = page_addr(page);
    // Chain every slot onto the free list; each carries an object-start
    // bit so interior pointers resolve to block bases.
    for slot in (0..PAGE_BYTES / size).rev() {
        let block = base + slot * size;
        // SAFETY: the page is fresh and owned by this heap.
        unsafe { *(block as *mut usize) = st.ms.free_lists[class] };
        st.ms.free_lists[class] = block;
        st.dir.set_object(block);
    }
}

/// Return a block to its free list (explicit deallocation).
pub(crate) fn reclaim(st: &mut GcState, ptr: *mut u8) {
    let block = ptr as usize;
    let page = page_of(block);
    if let Some(&class) = st.ms.page_class.get(&page) {
        let size = CLASSES[class];
        let slot = (block - page_addr(page)) / size;
        if let Some(mask) = st.ms.alloc_mask.get_mut(&page) {
            if *mask & (1 << slot) == 0 {
                return;
            }
            *mask &= !(1 << slot);
        }
        // SAFETY: the block is dead; its first word becomes the link.
        unsafe { *(block as *mut usize) = st.ms.free_lists[class] };
        st.ms.free_lists[class] = block;
        st.ms.allocated_bytes -= size;
        return;
    }
    if let Some(pos) = st.ms.large.iter().position(|&(p, _, _)| p == page) {
        let (first, pages, _) = st.ms.large.swap_remove(pos);
        st.ms.allocated_bytes -= pages * PAGE_BYTES;
        st.ms.reserved_pages -= pages;
        st.dir.release_pages(first, pages);
    }
}

fn maybe_collect(st: &mut GcState) {
    // One collection in flight across all heaps.
    let default_collecting = st.default_heap.next_space == crate::pages::STABLE_SPACE;
    if !default_collecting && st.ms.allocated_bytes > st.config.gc_threshold {
        collect(st);
    }
}

/// Conservative mark-and-sweep over this heap's pages. Stack, static
/// areas, and registered root areas are the root set; reachable blocks are
/// scanned transitively; everything else returns to the free lists.
pub(crate) fn collect(st: &mut GcState) {
    // Live bits on our pages are private to this collection.
    let pages: Vec<PageId> = st
        .ms
        .page_class
        .keys()
        .copied()
        .chain(st.ms.large.iter().map(|&(p, _, _)| p))
        .collect();
    for &page in &pages {
        let run = st.ms.large.iter().find(|&&(p, _, _)| p == page).map_or(1, |&(_, n, _)| n);
        st.dir.clear_live_range(page, run);
    }

    let mut worklist: Vec<(usize, usize)> = Vec::new();

    let bottom = st.stack_bottom;
    platform::spill_registers_and_scan(bottom, |word| mark_candidate(st, &mut worklist, word));
    platform::data_segments_for_each(|base, limit| {
        // SAFETY: the platform layer reports readable segments.
        unsafe { scan_region(base, limit, |word| mark_candidate(st, &mut worklist, word)) };
    });
    for (addr, bytes) in st.roots.snapshot() {
        // SAFETY: registration declared the area readable.
        unsafe { scan_region(addr, addr + bytes, |word| mark_candidate(st, &mut worklist, word)) };
    }
    for word in st.test_roots.clone() {
        mark_candidate(st, &mut worklist, word);
    }

    while let Some((block, bytes)) = worklist.pop() {
        let mut inner = Vec::new();
        // SAFETY: a live block of this heap is readable for its size.
        unsafe { scan_region(block, block + bytes, |word| mark_candidate(st, &mut inner, word)) };
        worklist.append(&mut inner);
    }

    sweep(st);
}

fn mark_candidate(st: &mut GcState, worklist: &mut Vec<(usize, usize)>, word: usize) {
    let page = page_of(word);
    if !st.dir.contains(page) || st.dir.owner(page) != MARK_SWEEP_HEAP {
        return;
    }
    let Some(base) = st.dir.base_pointer(word) else {
        return;
    };
    let bpage = page_of(base);
    let bytes = if let Some(&class) = st.ms.page_class.get(&bpage) {
        let slot = (base - page_addr(bpage)) / CLASSES[class];
        if st.ms.alloc_mask.get(&bpage).is_none_or(|m| m & (1 << slot) == 0) {
            return;
        }
        CLASSES[class]
    } else if let Some(&(_, _, bytes)) = st.ms.large.iter().find(|&&(p, _, _)| p == bpage) {
        bytes
    } else {
        return;
    };
    if !st.dir.is_marked(base) {
        st.dir.mark(base);
        worklist.push((base, bytes));
    }
}

fn sweep(st: &mut GcState) {
    let small_pages: Vec<(PageId, usize)> =
        st.ms.page_class.iter().map(|(&p, &c)| (p, c)).collect();
    for (page, class) in small_pages {
        let size = CLASSES[class];
        let base = page_addr(page);
        let mask = st.ms.alloc_mask.get(&page).copied().unwrap_or(0);
        for slot in 0..PAGE_BYTES / size {
            let block = base + slot * size;
            if mask & (1 << slot) != 0 && !st.dir.is_marked(block) {
                // SAFETY: the block is unreachable; recycle it.
                unsafe { *(block as *mut usize) = st.ms.free_lists[class] };
                st.ms.free_lists[class] = block;
                if let Some(m) = st.ms.alloc_mask.get_mut(&page) {
                    *m &= !(1 << slot);
                }
                st.ms.allocated_bytes -= size;
            }
        }
    }
    let large = std::mem::take(&mut st.ms.large);
    for (first, pages, bytes) in large {
        if st.dir.is_marked(page_addr(first)) {
            st.ms.large.push((first, pages, bytes));
        } else {
            st.ms.allocated_bytes -= pages * PAGE_BYTES;
            st.ms.reserved_pages -= pages;
            st.dir.release_pages(first, pages);
        }
    }
}

/// Make one of this heap's pages a source of ambiguous roots for the
/// default heap. Invoked when the promotion phase finds a root word
/// pointing into this heap.
pub(crate) fn scan_roots(st: &mut GcState, page: PageId) {
    // SAFETY: the page is backed and owned by this heap.
    unsafe {
        scan_region(page_addr(page), page_addr(page + 1), |word| {
            crate::gc::promote_page(st, word);
        });
    }
}
