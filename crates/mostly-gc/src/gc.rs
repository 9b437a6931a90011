//! The default heap: a mostly-copying, generational collector.
//!
//! Allocation bumps a pointer within a current page. A collection promotes
//! every page referenced from an ambiguous root in place, then walks the
//! stable-set queue copying live FromSpace objects into stable pages;
//! advancing the FromSpace counter at the end frees the old FromSpace
//! wholesale. Objects moved once stay put until a full collection merges
//! the stable set back into FromSpace.

use std::time::Instant;

use crate::config::{flags, verbose};
use crate::heap::GcState;
use crate::object::{self, bytes_to_words, kind_of, max_words_per_page, traverse_object, GcBox};
#[cfg(not(feature = "headerless"))]
use crate::object::{
    header_tag, header_words, make_header, FREE_TAG, HEADER_BYTES, HEADER_WORDS, MAX_HEADER_WORDS,
    OBJECT_TAG,
};
use crate::pages::{
    page_addr, page_of, HeapId, PageId, DEFAULT_HEAP, FIRST_FROM_SPACE, FIRST_USER_HEAP,
    MARK_SWEEP_HEAP, PAGE_BYTES, SCANNED_SPACE, STABLE_SPACE, UNALLOCATED_SPACE, UNCOLLECTED_HEAP,
    WORDS_PER_PAGE, WORD_BYTES,
};
use crate::platform;
use crate::ptr::GcPtr;
use crate::scan::scan_region;
use crate::stats::{self, CollectKind, CollectStats};
use crate::traverse::Traverse;
use crate::verify;

/// State of the default heap. The space tags themselves live in the page
/// directory; this records the allocation frontier, the stable-set queue,
/// and the FromSpace counter.
pub(crate) struct DefaultHeap {
    /// Pages allocated into since the last epoch advance.
    pub(crate) used_pages: usize,
    /// Pages in the stable set.
    pub(crate) stable_pages: usize,
    /// Pages reserved for this heap in the directory.
    pub(crate) reserved_pages: usize,
    /// Cursor for recycling reserved pages.
    pub(crate) first_unused_page: PageId,
    pub(crate) first_reserved_page: PageId,
    pub(crate) last_reserved_page: PageId,
    /// Bump pointer; 0 when no page is open.
    pub(crate) first_free_word: usize,
    /// Words left on the current page.
    pub(crate) free_words: usize,
    /// Stable-set queue threaded through the directory's link table.
    pub(crate) queue_head: PageId,
    pub(crate) queue_tail: PageId,
    /// Current FromSpace tag; advanced after every collection.
    pub(crate) from: u32,
    /// Space given to pages acquired by `get_pages`: equals `from`
    /// normally, `STABLE_SPACE` inside a collection so copy destinations
    /// are born stable.
    pub(crate) next_space: u32,
    /// Page currently under the compaction sweep.
    pub(crate) scan_page: PageId,
    /// Sweep position within `scan_page`.
    pub(crate) scan_ptr: usize,
    pub(crate) objects_moved: usize,
    pub(crate) pages_promoted: usize,
}

impl DefaultHeap {
    pub(crate) fn new(first_page: PageId) -> Self {
        Self {
            used_pages: 0,
            stable_pages: 0,
            reserved_pages: 0,
            first_unused_page: first_page,
            first_reserved_page: first_page,
            last_reserved_page: first_page,
            first_free_word: 0,
            free_words: 0,
            queue_head: 0,
            queue_tail: 0,
            from: FIRST_FROM_SPACE,
            next_space: FIRST_FROM_SPACE,
            scan_page: 0,
            scan_ptr: 0,
            objects_moved: 0,
            pages_promoted: 0,
        }
    }
}

// ----------------------------------------------------------------------
// Allocation
// ----------------------------------------------------------------------

/// Allocate `bytes` from the default heap; returns the object base (past
/// the header) with the object-start bit set and a no-op traversal
/// descriptor installed.
pub(crate) fn default_alloc(st: &mut GcState, bytes: usize) -> usize {
    let words = bytes_to_words(bytes);
    let alloc_base;
    if words <= st.default_heap.free_words {
        alloc_base = bump(st, words);
    } else if words < max_words_per_page() {
        // Close the current page and open a fresh one.
        get_pages(st, 1);
        alloc_base = bump(st, words);
    } else {
        #[cfg(not(feature = "headerless"))]
        if words > MAX_HEADER_WORDS {
            eprintln!(
                "\n***** mgc  unable to allocate objects larger than {} bytes",
                MAX_HEADER_WORDS * WORD_BYTES - WORD_BYTES
            );
            std::process::abort();
        }
        alloc_base = alloc_large(st, words);
    }
    finish_alloc(st, alloc_base, words)
}

fn bump(st: &mut GcState, words: usize) -> usize {
    let dh = &mut st.default_heap;
    let base = dh.first_free_word;
    dh.free_words -= words;
    dh.first_free_word += words * WORD_BYTES;
    header_align(st);
    base
}

/// Multi-page object: placed at offset zero of a fresh page run; the tail
/// of the run is closed off and never allocated into.
fn alloc_large(st: &mut GcState, words: usize) -> usize {
    let pages = if cfg!(feature = "double-align") {
        (words + WORDS_PER_PAGE) / WORDS_PER_PAGE
    } else {
        words.div_ceil(WORDS_PER_PAGE)
    };
    get_pages(st, pages);
    let base = st.default_heap.first_free_word;
    let tail_words = st.default_heap.free_words - words;
    st.default_heap.free_words = 0;
    st.default_heap.first_free_word = 0;
    if tail_words > 0 {
        let tail = base + words * WORD_BYTES;
        write_free_filler(st, tail, tail_words);
    }
    base
}

fn write_free_filler(st: &mut GcState, addr: usize, words: usize) {
    #[cfg(not(feature = "headerless"))]
    {
        // SAFETY: addr is the first unused word of a page this heap owns.
        unsafe { *(addr as *mut usize) = make_header(words, FREE_TAG) };
    }
    #[cfg(feature = "headerless")]
    {
        let _ = words;
        // SAFETY: as above; size is recovered from the object map.
        unsafe {
            *(addr as *mut *const object::ObjectKind) = &object::FREE_KIND;
        }
        st.dir.set_object(addr);
    }
    #[cfg(not(feature = "headerless"))]
    let _ = st;
}

fn finish_alloc(st: &mut GcState, alloc_base: usize, words: usize) -> usize {
    #[cfg(not(feature = "headerless"))]
    let obj = {
        // SAFETY: alloc_base is the header slot of the fresh allocation.
        unsafe { *(alloc_base as *mut usize) = make_header(words, OBJECT_TAG) };
        alloc_base + HEADER_BYTES
    };
    #[cfg(feature = "headerless")]
    let obj = {
        let _ = words;
        alloc_base
    };
    st.dir.set_object(obj);
    // A collection arriving before the value is written must find a
    // traversable object.
    // SAFETY: the descriptor slot is the object's first word.
    unsafe {
        *(obj as *mut *const object::ObjectKind) = &object::NOOP_KIND;
    }
    obj
}

#[cfg(feature = "double-align")]
fn header_align(st: &mut GcState) {
    use crate::object::PAD_TAG;
    let dh = &mut st.default_heap;
    if dh.free_words != 0 && dh.free_words % 2 == 0 {
        // SAFETY: first_free_word is the next unused word of the page.
        unsafe { *(dh.first_free_word as *mut usize) = make_header(1, PAD_TAG) };
        dh.first_free_word += WORD_BYTES;
        dh.free_words -= 1;
    }
}

#[cfg(not(feature = "double-align"))]
fn header_align(_st: &mut GcState) {}

/// Fill the remainder of the current page so linear scans skip it.
pub(crate) fn close_current_page(st: &mut GcState) {
    if st.default_heap.free_words == 0 {
        return;
    }
    let addr = st.default_heap.first_free_word;
    let words = st.default_heap.free_words;
    write_free_filler(st, addr, words);
    st.default_heap.free_words = 0;
}

/// Acquire `pages` contiguous pages for allocation, recycling this heap's
/// own free pages before going to the page allocator.
pub(crate) fn get_pages(st: &mut GcState, pages: usize) {
    // Trigger a collection when the projected occupancy outgrows twice the
    // projected free space, unless one is already running (copy
    // destinations are acquired with next_space == STABLE).
    {
        let dh = &st.default_heap;
        let used = dh.used_pages as isize;
        let want = pages as isize;
        let avail = st.dir.free_pages as isize + dh.reserved_pages as isize - used - want;
        if dh.next_space != STABLE_SPACE && used + want > 2 * avail {
            collect_now(st);
        }
    }
    close_current_page(st);

    let mut found: Option<PageId> = None;
    let reserved = st.default_heap.reserved_pages;
    if reserved - st.default_heap.used_pages > reserved / 16 {
        // Scan our reserved range for a recyclable run.
        let from = st.default_heap.from;
        let mut run = 0;
        let mut first = st.default_heap.first_unused_page;
        let mut remaining =
            st.default_heap.last_reserved_page - st.default_heap.first_reserved_page;
        while remaining > 0 {
            remaining -= 1;
            let cur = st.default_heap.first_unused_page;
            if st.dir.owner(cur) == DEFAULT_HEAP && st.dir.in_free_space(cur, from) {
                run += 1;
                if run == pages {
                    found = Some(first);
                    break;
                }
            } else {
                run = 0;
                first = cur + 1;
            }
            if cur == st.default_heap.last_reserved_page {
                st.default_heap.first_unused_page = st.default_heap.first_reserved_page;
                first = st.default_heap.first_reserved_page;
                run = 0;
            } else {
                st.default_heap.first_unused_page = cur + 1;
            }
        }
    }
    let first_page = found.unwrap_or_else(|| {
        // Get a bunch at a time; the surplus stays reserved-unallocated.
        let reserve = pages.max(8);
        let cfg = st.config;
        let first = st.dir.allocate_pages(reserve, DEFAULT_HEAP, &cfg);
        st.default_heap.reserved_pages += reserve;
        st.default_heap.first_unused_page = first;
        st.default_heap.first_reserved_page = st.default_heap.first_reserved_page.min(first);
        st.default_heap.last_reserved_page =
            st.default_heap.last_reserved_page.max(first + reserve - 1);
        for i in pages..reserve {
            st.dir.set_space(first + i, UNALLOCATED_SPACE);
        }
        first
    });

    let addr = page_addr(first_page);
    // SAFETY: the run belongs to this heap and nothing lives there.
    unsafe { std::ptr::write_bytes(addr as *mut u8, 0, pages * PAGE_BYTES) };
    st.dir.clear_object_range(first_page, pages);
    st.default_heap.first_free_word = addr;
    st.default_heap.free_words = pages * WORDS_PER_PAGE;
    #[cfg(feature = "double-align")]
    {
        use crate::object::PAD_TAG;
        // Keep the bump pointer one word past double alignment so object
        // bases land double-aligned after their header.
        // SAFETY: first word of a fresh run.
        unsafe { *(addr as *mut usize) = make_header(1, PAD_TAG) };
        st.default_heap.first_free_word += WORD_BYTES;
        st.default_heap.free_words -= 1;
    }
    st.default_heap.used_pages += pages;
    let space = st.default_heap.next_space;
    st.dir.set_space(first_page, space);
    st.dir.set_group(first_page, pages as i32);
    for k in 1..pages {
        st.dir.set_space(first_page + k, space);
        st.dir.set_group(first_page + k, -(k as i32));
    }
}

/// Construct a collected object in the default heap.
pub(crate) fn alloc_in_default<T: Traverse>(st: &mut GcState, value: T, extra: usize) -> GcPtr<T> {
    assert!(
        std::mem::align_of::<T>() <= WORD_BYTES,
        "collected types must not require more than word alignment"
    );
    let bytes = std::mem::size_of::<GcBox<T>>() + extra;
    let obj = default_alloc(st, bytes);
    // SAFETY: obj addresses a fresh allocation of at least `bytes` bytes.
    unsafe {
        let boxed = obj as *mut GcBox<T>;
        std::ptr::addr_of_mut!((*boxed).kind).write(kind_of::<T>());
        std::ptr::addr_of_mut!((*boxed).value).write(value);
        GcPtr::from_box_addr(obj)
    }
}

// ----------------------------------------------------------------------
// Promotion
// ----------------------------------------------------------------------

/// Treat a word as a candidate pointer: a hit in this heap's FromSpace
/// promotes the containing page group to the stable set in place; a hit in
/// another registered heap delegates to that heap's root scan.
pub(crate) fn promote_page(st: &mut GcState, candidate: usize) {
    let page = page_of(candidate);
    if !st.dir.contains(page) {
        return;
    }
    match st.dir.owner(page) {
        DEFAULT_HEAP => {}
        MARK_SWEEP_HEAP => {
            delegate_scan_roots(st, page, MARK_SWEEP_HEAP);
            return;
        }
        HeapId(id) if id >= FIRST_USER_HEAP => {
            delegate_scan_roots(st, page, HeapId(id));
            return;
        }
        _ => return,
    }
    // Resolve the exact object so it can be marked live; unmarked objects
    // in promoted pages are swept as garbage.
    let Some(base) = st.dir.base_pointer(candidate) else {
        return;
    };
    let bpage = page_of(base);
    if st.dir.outside_heaps(bpage) {
        return;
    }
    st.dir.mark(base);
    if st.dir.space(bpage) == st.default_heap.from {
        let head = st.dir.group_head(bpage);
        let pages = st.dir.group(head).max(1) as usize;
        if st.verbose(verbose::DEBUGLOG) {
            eprintln!("promoted {:#x}", page_addr(head));
        }
        queue_page(st, head);
        st.default_heap.used_pages += pages;
        st.default_heap.stable_pages += pages;
        st.default_heap.pages_promoted += pages;
        for k in 0..pages {
            st.dir.set_space(head + k, STABLE_SPACE);
        }
    }
}

/// A root word landed in another registered heap's page: have that heap
/// scan the page as roots, once per collection.
fn delegate_scan_roots(st: &mut GcState, page: PageId, owner: HeapId) {
    if st.scanned_foreign.contains(&page) {
        return;
    }
    st.scanned_foreign.push(page);
    if owner == MARK_SWEEP_HEAP {
        crate::msheap::scan_roots(st, page);
    } else {
        crate::heap::with_user_heap(st, owner, |gc, heap| heap.scan_roots(gc, page));
    }
}

/// Append a page to the stable-set queue.
fn queue_page(st: &mut GcState, page: PageId) {
    if st.default_heap.queue_head == 0 {
        st.default_heap.queue_head = page;
    } else {
        let tail = st.default_heap.queue_tail;
        st.dir.set_link(tail, page);
    }
    st.dir.set_link(page, 0);
    st.default_heap.queue_tail = page;
}

// ----------------------------------------------------------------------
// Scavenging
// ----------------------------------------------------------------------

/// The pointer-update interface handed to `traverse` implementations.
///
/// Each call routes one pointer-typed location through the collector: the
/// referent is copied, promoted, marked, or handed to its owning heap, and
/// the location is rewritten to the new address with any interior offset
/// preserved.
pub struct Scavenger<'gc> {
    pub(crate) st: &'gc mut GcState,
}

impl Scavenger<'_> {
    /// Scavenge a collected-pointer field.
    pub fn scavenge<T>(&mut self, loc: &mut GcPtr<T>) {
        // SAFETY: loc is a live pointer-sized location.
        unsafe { self.scavenge_location(std::ptr::from_mut(loc).cast::<usize>()) }
    }

    /// Scavenge a raw pointer field. Interior (derived) pointers are
    /// rewritten with their offset preserved.
    pub fn scavenge_raw<T>(&mut self, loc: &mut *mut T) {
        // SAFETY: loc is a live pointer-sized location.
        unsafe { self.scavenge_location(std::ptr::from_mut(loc).cast::<usize>()) }
    }

    /// Scavenge an arbitrary pointer-sized location.
    ///
    /// # Safety
    ///
    /// `loc` must be valid for reads and writes of one word.
    pub unsafe fn scavenge_location(&mut self, loc: *mut usize) {
        // SAFETY: per contract.
        let pp = unsafe { *loc };
        let page = page_of(pp);
        if !self.st.dir.contains(page) || self.st.dir.owner(page) == UNCOLLECTED_HEAP {
            return;
        }
        let Some(base) = self.st.dir.base_pointer(pp) else {
            return;
        };
        let bpage = page_of(base);
        let owner = self.st.dir.owner(bpage);
        if owner == DEFAULT_HEAP {
            if self.st.dir.space(bpage) == self.st.default_heap.from {
                // SAFETY: base is an object base in FromSpace.
                let moved = unsafe { move_object(self.st, base) };
                // SAFETY: per contract; interior offset preserved.
                unsafe { *loc = moved + (pp - base) };
            } else if !self.st.dir.is_marked(base) {
                // Usually a stable or scanned page; a stale value in a
                // falsely retained object may also land in the free band,
                // in which case marking is harmless and nothing recurses.
                self.st.dir.mark(base);
                let dh = &self.st.default_heap;
                // The linear sweep will reach anything at or ahead of the
                // cursor in the page being scanned.
                if !(bpage == dh.scan_page && base > dh.scan_ptr)
                    && self.st.dir.space(bpage) == SCANNED_SPACE
                {
                    #[cfg(not(feature = "headerless"))]
                    {
                        // SAFETY: base has a valid header.
                        let header = unsafe { *((base - HEADER_BYTES) as *const usize) };
                        if header_tag(header) != OBJECT_TAG {
                            return;
                        }
                    }
                    // SAFETY: base is live, marked, and not forwarded.
                    unsafe { traverse_object(base, self) };
                }
            }
        } else if owner == MARK_SWEEP_HEAP {
            // The companion heap is opaque: its interior is not scanned,
            // but the pointer stays valid.
        } else if owner.0 >= FIRST_USER_HEAP {
            let opaque = crate::heap::user_heap_opaque(self.st, owner).unwrap_or(true);
            if !opaque {
                self.visit(base);
            }
        }
    }

    /// Mark-and-traverse an object inside a transparent foreign heap.
    fn visit(&mut self, base: usize) {
        if !self.st.dir.is_marked(base) {
            self.st.dir.mark(base);
            // SAFETY: base is the base of a live foreign object laid out
            // with a traversal descriptor.
            unsafe { traverse_object(base, self) };
        }
    }
}

/// Copy an object from FromSpace to StableSpace, or promote its page in
/// place when it is page-sized or larger. Returns the object's new base;
/// following an existing forward is a no-op.
unsafe fn move_object(st: &mut GcState, base: usize) -> usize {
    if st.flag(flags::TSTOBJ) {
        // SAFETY: base points into this heap per caller.
        unsafe {
            verify::verify_object(st, base, true);
            verify::verify_header(st, base);
        }
    }

    // SAFETY: base is an object base; forwarding encoding per the object
    // model.
    if unsafe { object::is_forwarded(&st.dir, st.default_heap.from, base) } {
        // SAFETY: the forward slot holds the relocated object's base.
        return unsafe { object::get_forward(base) };
    }

    // SAFETY: base is a live object in this heap.
    let words = unsafe { object::object_words(&st.dir, base) };
    if words >= st.default_heap.free_words {
        if words >= max_words_per_page() {
            // Page-sized or larger: promote in place rather than copy, so
            // collection never forces heap expansion for a copy target.
            promote_page(st, base);
            return base;
        }
        // Discard any partial destination page and open a fresh one; with
        // next_space == STABLE it is born stable and joins the queue.
        get_pages(st, 1);
        let dest = page_of(st.default_heap.first_free_word);
        if st.verbose(verbose::DEBUGLOG) {
            eprintln!("queued   {:#x}", st.default_heap.first_free_word);
        }
        queue_page(st, dest);
        st.default_heap.stable_pages += 1;
    }

    st.default_heap.objects_moved += 1;
    #[cfg(not(feature = "headerless"))]
    let new_base = {
        // SAFETY: base has a header; the destination page has room for
        // `words` words starting at first_free_word.
        unsafe {
            let header = *((base - HEADER_BYTES) as *const usize);
            let dest = st.default_heap.first_free_word;
            *(dest as *mut usize) = header;
            let new_base = dest + HEADER_BYTES;
            st.dir.set_object(new_base);
            st.default_heap.free_words -= words;
            object::set_forward(&mut st.dir, base, new_base);
            let payload = words - HEADER_WORDS;
            std::ptr::copy_nonoverlapping(base as *const usize, new_base as *mut usize, payload);
            st.default_heap.first_free_word = new_base + payload * WORD_BYTES;
            new_base
        }
    };
    #[cfg(feature = "headerless")]
    let new_base = {
        // SAFETY: as above, headerless layout.
        unsafe {
            let new_base = st.default_heap.first_free_word;
            st.dir.set_object(new_base);
            st.default_heap.free_words -= words;
            std::ptr::copy_nonoverlapping(base as *const usize, new_base as *mut usize, words);
            object::set_forward(&mut st.dir, base, new_base);
            st.default_heap.first_free_word = new_base + words * WORD_BYTES;
            new_base
        }
    };
    header_align(st);
    st.dir.mark(new_base);
    new_base
}

// ----------------------------------------------------------------------
// Collection cycle
// ----------------------------------------------------------------------

/// Run a collection of the default heap.
pub(crate) fn collect_now(st: &mut GcState) {
    let start = Instant::now();
    let cfg = st.config;
    let total_collection = st.default_heap.queue_head == 0;

    #[cfg(feature = "tracing")]
    let _collection_span = crate::tracing::internal::collection_span(
        if total_collection { "full" } else { "partial" },
        crate::tracing::internal::next_gc_id(),
    );

    let percent_before = st.heap_percent(st.default_heap.used_pages);
    if st.verbose(verbose::STATS) {
        eprint!("***** mgc  collecting - {percent_before}% allocated  ->  ");
        newline_if_logging(st);
    }
    st.default_heap.objects_moved = 0;
    st.default_heap.pages_promoted = 0;

    // Setup: close the current page, zero the live map, and let pages
    // acquired during the collection be born stable.
    {
        #[cfg(feature = "tracing")]
        let _span = crate::tracing::internal::phase_span(crate::tracing::internal::GcPhase::Setup);
        close_current_page(st);
        st.default_heap.next_space = STABLE_SPACE;
        st.default_heap.used_pages = st.default_heap.stable_pages;
        st.dir.clear_live_all();
        st.scanned_foreign.clear();
    }

    {
        #[cfg(feature = "tracing")]
        let _span =
            crate::tracing::internal::phase_span(crate::tracing::internal::GcPhase::Promote);
        promotion_phase(st);
    }
    if st.verbose(verbose::STATS) {
        eprint!(
            "{}% promoted  ",
            st.heap_percent(st.default_heap.used_pages)
        );
        newline_if_logging(st);
    }

    {
        #[cfg(feature = "tracing")]
        let _span =
            crate::tracing::internal::phase_span(crate::tracing::internal::GcPhase::Compact);
        compaction_phase(st);
    }
    if st.verbose(verbose::STATS) {
        eprintln!(
            "{}% stable.",
            st.heap_percent(st.default_heap.stable_pages)
        );
        eprintln!("moved objects: {}", st.default_heap.objects_moved);
    }

    {
        #[cfg(feature = "tracing")]
        let _span =
            crate::tracing::internal::phase_span(crate::tracing::internal::GcPhase::Advance);
        if cfg.generational != 0 {
            if st.heap_percent(st.default_heap.used_pages) >= cfg.generational as usize {
                empty_stable_space(st);
                if total_collection && should_expand(st) {
                    st.dir.expand(cfg.inc_heap, &cfg);
                }
            }
        } else {
            empty_stable_space(st);
            if should_expand(st) {
                st.dir.expand(cfg.inc_heap, &cfg);
            }
        }
        st.default_heap.next_space = st.default_heap.from;
    }

    stats::record(CollectStats {
        kind: if total_collection {
            CollectKind::Full
        } else {
            CollectKind::Partial
        },
        pages_promoted: st.default_heap.pages_promoted,
        objects_moved: st.default_heap.objects_moved,
        percent_before,
        percent_after: st.heap_percent(st.default_heap.used_pages),
        percent_stable: st.heap_percent(st.default_heap.stable_pages),
        duration: start.elapsed(),
        total_collections: 0,
    });
}

fn newline_if_logging(st: &GcState) {
    if st.verbose(verbose::DEBUGLOG | verbose::ROOTLOG | verbose::HEAPLOG) {
        eprintln!();
    }
}

fn should_expand(st: &GcState) -> bool {
    st.heap_percent(st.default_heap.used_pages) >= st.config.inc_percent as usize
        && st.dir.total_pages < st.config.max_heap / PAGE_BYTES
        && st.config.inc_heap != 0
}

/// Scan every ambiguous-root source, promoting referenced pages.
fn promotion_phase(st: &mut GcState) {
    if st.verbose(verbose::ROOTLOG) {
        eprintln!("stack roots:");
    }
    let bottom = st.stack_bottom;
    platform::spill_registers_and_scan(bottom, |word| promote_page(st, word));

    if st.verbose(verbose::ROOTLOG) {
        eprintln!("static and registered roots:");
    }
    platform::data_segments_for_each(|base, limit| {
        // SAFETY: the platform layer reports readable segments.
        unsafe { scan_region(base, limit, |word| promote_page(st, word)) };
    });

    for (addr, bytes) in st.roots.snapshot() {
        // SAFETY: registration declared the area readable.
        unsafe { scan_region(addr, addr + bytes, |word| promote_page(st, word)) };
    }

    for word in st.test_roots.clone() {
        promote_page(st, word);
    }

    if st.flag(flags::HEAPROOTS) {
        if st.verbose(verbose::HEAPLOG) {
            eprintln!("uncollected heap roots:");
        }
        let end = platform::uncollected_heap_end();
        let mut fp = st.global_heap_start.next_multiple_of(WORD_BYTES);
        while fp + WORD_BYTES <= end {
            let page = page_of(fp);
            if st.dir.contains(page) && st.dir.owner(page) == DEFAULT_HEAP {
                fp += PAGE_BYTES;
            } else {
                // SAFETY: the break region is committed memory.
                let word = unsafe { std::ptr::read_volatile(fp as *const usize) };
                promote_page(st, word);
                fp += WORD_BYTES;
            }
        }
    }
}

/// Walk the stable-set queue, sweeping each page in address order and
/// traversing its live objects. Copies extend the queue, so the walk
/// terminates without a recursion stack.
fn compaction_phase(st: &mut GcState) {
    let mut page = st.default_heap.queue_head;
    while page != 0 {
        st.dir.set_space(page, SCANNED_SPACE);
        st.default_heap.scan_page = page;
        let mut cp = page_addr(page);
        let next_page_addr = page_addr(page + 1);
        let in_current =
            st.default_heap.first_free_word != 0 && page_of(st.default_heap.first_free_word) == page;
        if st.verbose(verbose::DEBUGLOG) {
            eprintln!("sweeping {cp:#x}");
        }
        loop {
            // The current page may keep filling while we sweep it.
            let nextcp = if in_current {
                let ffw = st.default_heap.first_free_word;
                if cp <= ffw && ffw < next_page_addr {
                    ffw
                } else {
                    next_page_addr
                }
            } else {
                next_page_addr
            };
            if cp >= nextcp {
                break;
            }
            #[cfg(not(feature = "headerless"))]
            {
                // SAFETY: cp walks successive headers of a closed page.
                let header = unsafe { *(cp as *const usize) };
                let obj = cp + HEADER_BYTES;
                if st.flag(flags::TSTOBJ) {
                    // SAFETY: obj is an object base on this page.
                    unsafe { verify::verify_header(st, obj) };
                }
                if header_tag(header) == OBJECT_TAG && st.dir.is_marked(obj) {
                    st.default_heap.scan_ptr = cp;
                    let mut sc = Scavenger { st: &mut *st };
                    // SAFETY: obj is a live, marked object.
                    unsafe { traverse_object(obj, &mut sc) };
                }
                cp += header_words(header) * WORD_BYTES;
            }
            #[cfg(feature = "headerless")]
            {
                if st.dir.is_marked(cp) {
                    st.default_heap.scan_ptr = cp;
                    let mut sc = Scavenger { st: &mut *st };
                    // SAFETY: cp is a live, marked object base.
                    unsafe { traverse_object(cp, &mut sc) };
                }
                // SAFETY: cp is an object base on this page.
                cp += unsafe { object::object_words(&st.dir, cp) } * WORD_BYTES;
            }
        }
        page = st.dir.link(page);
        if cp == st.default_heap.first_free_word && page != 0 {
            // The sweep caught up with the bump pointer but more queued
            // pages follow (a large-object promotion may forward into this
            // page behind us): close it so nothing lands here unscanned.
            close_current_page(st);
        }
    }

    // Scanned pages return to the stable set.
    let mut scan = st.default_heap.queue_head;
    while scan != 0 {
        st.dir.set_space(scan, STABLE_SPACE);
        scan = st.dir.link(scan);
    }
    // Epoch advance: the whole old FromSpace is now free.
    st.default_heap.from += 1;
}

/// Merge the stable set back into FromSpace; the next collection runs as a
/// full collection.
pub(crate) fn empty_stable_space(st: &mut GcState) {
    let mut count = 0;
    while st.default_heap.queue_head != 0 {
        let head = st.default_heap.queue_head;
        let pages = st.dir.group(head).max(1) as usize;
        for k in 0..pages {
            st.dir.set_space(head + k, st.default_heap.from);
            count += 1;
        }
        st.default_heap.queue_head = st.dir.link(head);
    }
    st.default_heap.queue_tail = 0;
    st.default_heap.stable_pages -= count;
}

#[cfg(test)]
pub(crate) mod invariants {
    use super::*;

    /// Structural checks over the directory and the stable queue.
    pub(crate) fn check(st: &GcState) {
        // The stable queue has no duplicates and no cycles, and covers
        // exactly stable_pages pages.
        let mut seen = Vec::new();
        let mut covered = 0usize;
        let mut page = st.default_heap.queue_head;
        while page != 0 {
            assert!(!seen.contains(&page), "stable queue repeats page {page}");
            seen.push(page);
            let group = st.dir.group(page);
            assert!(group > 0, "queued page {page} is not a group head");
            covered += group as usize;
            for k in 1..group as usize {
                assert_eq!(
                    st.dir.group(page + k),
                    -(k as i32),
                    "group continuation offsets must descend"
                );
            }
            assert!(seen.len() <= st.dir.total_pages, "stable queue cycles");
            page = st.dir.link(page);
        }
        assert_eq!(covered, st.default_heap.stable_pages);

        // Outside a collection, no page carries the transient tag, and
        // FromSpace is empty right after an epoch advance.
        for p in st.dir.first_page()..=st.dir.last_page() {
            if st.dir.owner(p) == DEFAULT_HEAP {
                assert_ne!(st.dir.space(p), SCANNED_SPACE);
            }
        }
    }
}
