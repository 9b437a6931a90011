//! Page directory and page allocator.
//!
//! All collector bookkeeping is page-granular. For every page the process
//! has ever backed, six parallel tables record the owning heap, the space
//! tag, the page-group shape, the stable-queue link, and two per-word
//! bitmaps (object starts and liveness). Tables are indexed by absolute
//! page number over the heap span; inter-block gaps inside the span are
//! tagged with the uncollected sentinel so they are never handed out.

use sys_alloc::Block;

use crate::config::Config;

/// Bytes per collector page. Independent of the OS page size; a multiple of
/// the bitmap word size.
pub const PAGE_BYTES: usize = 512;

/// Bytes per machine word.
pub const WORD_BYTES: usize = std::mem::size_of::<usize>();

/// Words per collector page.
pub const WORDS_PER_PAGE: usize = PAGE_BYTES / WORD_BYTES;

/// Bits per bitmap word.
pub const BITS_PER_WORD: usize = usize::BITS as usize;

/// Bitmap words covering one page.
const MAP_WORDS_PER_PAGE: usize = WORDS_PER_PAGE / BITS_PER_WORD;

/// Absolute page number (address divided by [`PAGE_BYTES`]).
pub type PageId = usize;

/// Page number containing `addr`.
#[inline]
#[must_use]
pub const fn page_of(addr: usize) -> PageId {
    addr / PAGE_BYTES
}

/// First address of page `page`.
#[inline]
#[must_use]
pub const fn page_addr(page: PageId) -> usize {
    page * PAGE_BYTES
}

/// Identity of a heap in the page directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapId(pub(crate) u16);

/// Sentinel: the page belongs to no heap (free).
pub const NO_HEAP: HeapId = HeapId(0);
/// Sentinel: the page is not managed by any collector.
pub const UNCOLLECTED_HEAP: HeapId = HeapId(1);
/// The default (mostly-copying) heap.
pub const DEFAULT_HEAP: HeapId = HeapId(2);
/// The mark-and-sweep companion heap.
pub const MARK_SWEEP_HEAP: HeapId = HeapId(3);
/// First identity handed to user-registered heaps.
pub(crate) const FIRST_USER_HEAP: u16 = 4;

/// Space tag of pages that survived a collection.
pub const STABLE_SPACE: u32 = 0;
/// Transient tag for a stable page while the compaction sweep is on it.
pub const SCANNED_SPACE: u32 = 1;
/// Tag for pages reserved by a heap but not allocated into.
pub const UNALLOCATED_SPACE: u32 = 2;
/// Initial value of the FromSpace counter.
pub(crate) const FIRST_FROM_SPACE: u32 = 3;

#[inline]
const fn word_index(addr: usize) -> usize {
    addr / (BITS_PER_WORD * WORD_BYTES)
}

#[inline]
const fn bit_index(addr: usize) -> usize {
    (addr / WORD_BYTES) & (BITS_PER_WORD - 1)
}

/// The process-wide page directory and page allocator.
pub struct PageDirectory {
    first_page: PageId,
    last_page: PageId,
    /// Owning heap per page.
    owner: Vec<HeapId>,
    /// Space tag per page.
    space: Vec<u32>,
    /// Group size for head pages; negative offset to the head for
    /// continuation pages.
    group: Vec<i32>,
    /// Stable-queue link per page (0 terminates).
    link: Vec<PageId>,
    /// One bit per word: an object starts here.
    object_map: Vec<usize>,
    /// One bit per word: the object here was reached in this collection.
    live_map: Vec<usize>,
    /// Pages actually backed by mapped blocks.
    pub(crate) total_pages: usize,
    /// Backed pages not owned by any heap.
    pub(crate) free_pages: usize,
    /// Allocation cursor.
    pub(crate) first_free_page: PageId,
    expand_failed: bool,
    blocks: Vec<Block>,
}

impl PageDirectory {
    /// Map the initial heap and build tables covering it.
    ///
    /// # Errors
    ///
    /// Propagates the OS error when the initial block cannot be mapped.
    pub(crate) fn new(min_heap: usize) -> std::io::Result<Self> {
        let block = Block::map(min_heap.max(4 * PAGE_BYTES), None)?;
        let total_pages = block.len() / PAGE_BYTES;
        let first_page = page_of(block.ptr() as usize);
        let last_page = first_page + total_pages - 1;
        let span = total_pages;
        Ok(Self {
            first_page,
            last_page,
            owner: vec![NO_HEAP; span],
            space: vec![UNALLOCATED_SPACE; span],
            group: vec![0; span],
            link: vec![0; span],
            object_map: vec![0; span * MAP_WORDS_PER_PAGE],
            live_map: vec![0; span * MAP_WORDS_PER_PAGE],
            total_pages,
            free_pages: total_pages,
            first_free_page: first_page,
            expand_failed: false,
            blocks: vec![block],
        })
    }

    /// First page of the heap span.
    #[inline]
    pub(crate) const fn first_page(&self) -> PageId {
        self.first_page
    }

    /// Last page of the heap span.
    #[inline]
    pub(crate) const fn last_page(&self) -> PageId {
        self.last_page
    }

    /// Total heap size in bytes (backed pages only).
    #[inline]
    pub(crate) const fn heap_bytes(&self) -> usize {
        self.total_pages * PAGE_BYTES
    }

    /// Whether `page` lies within the heap span.
    #[inline]
    pub(crate) const fn contains(&self, page: PageId) -> bool {
        page >= self.first_page && page <= self.last_page
    }

    /// A page outside the span or handed to the untraced world.
    #[inline]
    pub(crate) fn outside_heaps(&self, page: PageId) -> bool {
        !self.contains(page) || self.owner[page - self.first_page] == UNCOLLECTED_HEAP
    }

    #[inline]
    fn index(&self, page: PageId) -> usize {
        debug_assert!(self.contains(page));
        page - self.first_page
    }

    #[inline]
    pub(crate) fn owner(&self, page: PageId) -> HeapId {
        self.owner[self.index(page)]
    }

    #[inline]
    pub(crate) fn set_owner(&mut self, page: PageId, heap: HeapId) {
        let i = self.index(page);
        self.owner[i] = heap;
    }

    #[inline]
    pub(crate) fn space(&self, page: PageId) -> u32 {
        self.space[self.index(page)]
    }

    #[inline]
    pub(crate) fn set_space(&mut self, page: PageId, space: u32) {
        let i = self.index(page);
        self.space[i] = space;
    }

    #[inline]
    pub(crate) fn group(&self, page: PageId) -> i32 {
        self.group[self.index(page)]
    }

    #[inline]
    pub(crate) fn set_group(&mut self, page: PageId, group: i32) {
        let i = self.index(page);
        self.group[i] = group;
    }

    #[inline]
    pub(crate) fn link(&self, page: PageId) -> PageId {
        self.link[self.index(page)]
    }

    #[inline]
    pub(crate) fn set_link(&mut self, page: PageId, next: PageId) {
        let i = self.index(page);
        self.link[i] = next;
    }

    /// Head page of the group containing `page`.
    #[inline]
    pub(crate) fn group_head(&self, page: PageId) -> PageId {
        let g = self.group(page);
        if g < 0 {
            let head = page.wrapping_add_signed(g as isize);
            if self.contains(head) && head < page {
                return head;
            }
        }
        page
    }

    /// Pages whose tag lies in the free band.
    #[inline]
    pub(crate) fn in_free_space(&self, page: PageId, from: u32) -> bool {
        let s = self.space(page);
        (UNALLOCATED_SPACE..from).contains(&s)
    }

    #[inline]
    fn map_index(&self, addr: usize) -> usize {
        debug_assert!(self.contains(page_of(addr)));
        word_index(addr) - word_index(page_addr(self.first_page))
    }

    // ------------------------------------------------------------------
    // Object-start bitmap
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn is_object(&self, addr: usize) -> bool {
        self.object_map[self.map_index(addr)] >> bit_index(addr) & 1 != 0
    }

    #[inline]
    pub(crate) fn set_object(&mut self, addr: usize) {
        let i = self.map_index(addr);
        self.object_map[i] |= 1 << bit_index(addr);
    }

    #[inline]
    pub(crate) fn clear_object(&mut self, addr: usize) {
        let i = self.map_index(addr);
        self.object_map[i] &= !(1 << bit_index(addr));
    }

    /// Clear the object map for a run of pages about to be reused.
    pub(crate) fn clear_object_range(&mut self, page: PageId, pages: usize) {
        let start = self.map_index(page_addr(page));
        let words = pages * MAP_WORDS_PER_PAGE;
        self.object_map[start..start + words].fill(0);
    }

    // ------------------------------------------------------------------
    // Live bitmap
    // ------------------------------------------------------------------

    #[inline]
    pub(crate) fn is_marked(&self, addr: usize) -> bool {
        self.live_map[self.map_index(addr)] >> bit_index(addr) & 1 != 0
    }

    #[inline]
    pub(crate) fn mark(&mut self, addr: usize) {
        let i = self.map_index(addr);
        self.live_map[i] |= 1 << bit_index(addr);
    }

    /// Zero the live bitmap across the whole span. Done at the start of
    /// every collection; live bits are meaningless outside one.
    pub(crate) fn clear_live_all(&mut self) {
        self.live_map.fill(0);
    }

    /// Zero the live bitmap for a run of pages.
    pub(crate) fn clear_live_range(&mut self, page: PageId, pages: usize) {
        let start = self.map_index(page_addr(page));
        let words = pages * MAP_WORDS_PER_PAGE;
        self.live_map[start..start + words].fill(0);
    }

    // ------------------------------------------------------------------
    // Base resolution
    // ------------------------------------------------------------------

    /// Resolve an interior pointer to the base of its containing object by
    /// scanning the object map backward, a bitmap word at a time.
    ///
    /// The scan is bounded by the first page of the containing group; a
    /// candidate with no object start in range is not a pointer.
    pub(crate) fn base_pointer(&self, addr: usize) -> Option<usize> {
        let page = page_of(addr);
        if !self.contains(page) {
            return None;
        }
        let addr = addr & !(WORD_BYTES - 1);
        let floor = page_addr(self.group_head(page));
        let mut index = self.map_index(addr);
        let shift = bit_index(addr);
        let mut word_base = addr - shift * WORD_BYTES;
        let mut bits = self.object_map[index] & (!0usize >> (BITS_PER_WORD - 1 - shift));
        loop {
            if bits != 0 {
                let top = BITS_PER_WORD - 1 - bits.leading_zeros() as usize;
                let base = word_base + top * WORD_BYTES;
                return (base >= floor).then_some(base);
            }
            if word_base <= floor || index == 0 {
                return None;
            }
            index -= 1;
            bits = self.object_map[index];
            word_base -= BITS_PER_WORD * WORD_BYTES;
        }
    }

    /// Address of the next object-start bit in `[from, limit)`, scanning
    /// forward a bitmap word at a time.
    pub(crate) fn next_object_bit(&self, from: usize, limit: usize) -> Option<usize> {
        if from >= limit {
            return None;
        }
        let mut index = self.map_index(from);
        let shift = bit_index(from);
        let mut word_base = from - shift * WORD_BYTES;
        let mut bits = self.object_map[index] & (!0usize << shift);
        loop {
            if bits != 0 {
                let low = bits.trailing_zeros() as usize;
                let addr = word_base + low * WORD_BYTES;
                return (addr < limit).then_some(addr);
            }
            word_base += BITS_PER_WORD * WORD_BYTES;
            if word_base >= limit {
                return None;
            }
            index += 1;
            bits = self.object_map[index];
        }
    }

    // ------------------------------------------------------------------
    // Page allocation
    // ------------------------------------------------------------------

    /// Hand `pages` contiguous pages to `heap`, expanding the heap if no
    /// run can be found. Aborts the process when expansion is denied and
    /// the request cannot be satisfied.
    pub(crate) fn allocate_pages(&mut self, pages: usize, heap: HeapId, cfg: &Config) -> PageId {
        debug_assert!(pages > 0);
        let found = self.find_free_run(pages).or_else(|| {
            // Assure the increment covers the request before expanding.
            let increment = cfg.inc_heap.max(pages * PAGE_BYTES);
            self.expand(increment, cfg)
                .and_then(|_| self.find_free_run(pages))
        });
        let Some(first) = found else {
            eprintln!("\n***** mgc  unable to allocate {pages} pages");
            std::process::abort();
        };
        self.free_pages -= pages;
        for i in 0..pages {
            self.set_owner(first + i, heap);
            // Make every page of the run look like the head of a group
            // reaching its end, so object sizing works before the owning
            // heap lays the run out.
            self.set_group(first + i, (pages - i) as i32);
        }
        first
    }

    fn find_free_run(&mut self, pages: usize) -> Option<PageId> {
        let mut remaining = self.last_page - self.first_page + 1;
        let mut run = 0;
        let mut first = self.first_free_page;
        while remaining > 0 {
            remaining -= 1;
            if self.owner(self.first_free_page) == NO_HEAP {
                run += 1;
                if run == pages {
                    return Some(first);
                }
            } else {
                run = 0;
            }
            self.first_free_page = if self.first_free_page == self.last_page {
                self.first_page
            } else {
                self.first_free_page + 1
            };
            if self.first_free_page == self.first_page {
                run = 0;
            }
            if run == 0 {
                first = self.first_free_page;
            }
        }
        None
    }

    /// Release a run of pages back to the free pool.
    pub(crate) fn release_pages(&mut self, page: PageId, pages: usize) {
        self.clear_object_range(page, pages);
        for i in 0..pages {
            self.set_owner(page + i, NO_HEAP);
            self.set_space(page + i, UNALLOCATED_SPACE);
            self.set_group(page + i, 0);
        }
        self.free_pages += pages;
    }

    // ------------------------------------------------------------------
    // Expansion
    // ------------------------------------------------------------------

    /// Grow the heap by at least `increment` bytes. Returns the first new
    /// page, or `None` when the OS refuses; a refusal latches and disables
    /// further attempts for the process lifetime.
    pub(crate) fn expand(&mut self, increment: usize, cfg: &Config) -> Option<PageId> {
        if self.expand_failed {
            return None;
        }
        let hint = self.blocks.last().map(sys_alloc::Block::end);
        let block = match Block::map(increment, hint) {
            Ok(b) => b,
            Err(_) => {
                self.expand_failed = true;
                if cfg.verbose & crate::config::verbose::STATS != 0 {
                    eprintln!("\n***** mgc  heap expansion failed");
                }
                return None;
            }
        };
        let inc_pages = block.len() / PAGE_BYTES;
        let inc_first = page_of(block.ptr() as usize);
        let inc_last = inc_first + inc_pages - 1;

        let new_first = self.first_page.min(inc_first);
        let new_last = self.last_page.max(inc_last);
        let new_span = new_last - new_first + 1;

        let mut owner = vec![UNCOLLECTED_HEAP; new_span];
        let mut space = vec![UNALLOCATED_SPACE; new_span];
        let mut group = vec![0i32; new_span];
        let mut link = vec![0usize; new_span];
        let mut object_map = vec![0usize; new_span * MAP_WORDS_PER_PAGE];
        let mut live_map = vec![0usize; new_span * MAP_WORDS_PER_PAGE];

        let off = self.first_page - new_first;
        let old_span = self.last_page - self.first_page + 1;
        owner[off..off + old_span].copy_from_slice(&self.owner);
        space[off..off + old_span].copy_from_slice(&self.space);
        group[off..off + old_span].copy_from_slice(&self.group);
        link[off..off + old_span].copy_from_slice(&self.link);
        let map_off = off * MAP_WORDS_PER_PAGE;
        let map_len = old_span * MAP_WORDS_PER_PAGE;
        object_map[map_off..map_off + map_len].copy_from_slice(&self.object_map);
        // The live map must survive an expansion that happens inside a
        // collection (a copy destination may force one).
        live_map[map_off..map_off + map_len].copy_from_slice(&self.live_map);

        let inc_off = inc_first - new_first;
        owner[inc_off..inc_off + inc_pages].fill(NO_HEAP);

        self.owner = owner;
        self.space = space;
        self.group = group;
        self.link = link;
        self.object_map = object_map;
        self.live_map = live_map;
        self.first_page = new_first;
        self.last_page = new_last;
        self.total_pages += inc_pages;
        self.free_pages += inc_pages;
        self.first_free_page = inc_first;
        self.blocks.push(block);

        if cfg.verbose & crate::config::verbose::STATS != 0 {
            eprintln!(
                "\n***** mgc  heap expanded to {} bytes",
                self.total_pages * PAGE_BYTES
            );
        }
        Some(inc_first)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_dir() -> PageDirectory {
        PageDirectory::new(64 * PAGE_BYTES).expect("mapping failed")
    }

    #[test]
    fn directory_covers_initial_block() {
        let dir = small_dir();
        assert!(dir.total_pages >= 64);
        assert_eq!(dir.free_pages, dir.total_pages);
        assert!(dir.contains(dir.first_page()));
        assert!(dir.contains(dir.last_page()));
        assert_eq!(dir.owner(dir.first_page()), NO_HEAP);
    }

    #[test]
    fn object_bits_round_trip() {
        let mut dir = small_dir();
        let addr = page_addr(dir.first_page()) + 5 * WORD_BYTES;
        assert!(!dir.is_object(addr));
        dir.set_object(addr);
        assert!(dir.is_object(addr));
        dir.clear_object(addr);
        assert!(!dir.is_object(addr));
    }

    #[test]
    fn base_pointer_resolves_interior_addresses() {
        let mut dir = small_dir();
        let page = dir.first_page() + 2;
        dir.set_group(page, 1);
        let base = page_addr(page) + 3 * WORD_BYTES;
        dir.set_object(base);
        // Any word inside the object maps back to its base, even past a
        // bitmap word boundary.
        for off in 0..40 {
            assert_eq!(dir.base_pointer(base + off * WORD_BYTES), Some(base));
        }
        // Misaligned interior bytes are clamped to their word.
        assert_eq!(dir.base_pointer(base + 3), Some(base));
        // Below the object, and on a fresh page, there is nothing.
        assert_eq!(dir.base_pointer(base - WORD_BYTES), None);
    }

    #[test]
    fn base_pointer_stops_at_group_head() {
        let mut dir = small_dir();
        let head = dir.first_page() + 4;
        dir.set_group(head, 3);
        dir.set_group(head + 1, -1);
        dir.set_group(head + 2, -2);
        let base = page_addr(head);
        dir.set_object(base);
        let interior = page_addr(head + 2) + 7 * WORD_BYTES;
        assert_eq!(dir.base_pointer(interior), Some(base));
    }

    #[test]
    fn next_object_bit_scans_forward() {
        let mut dir = small_dir();
        let page = dir.first_page() + 1;
        dir.set_group(page, 1);
        let a = page_addr(page) + 2 * WORD_BYTES;
        let b = page_addr(page) + 17 * WORD_BYTES;
        dir.set_object(a);
        dir.set_object(b);
        assert_eq!(dir.next_object_bit(a + WORD_BYTES, page_addr(page + 1)), Some(b));
        assert_eq!(dir.next_object_bit(b + WORD_BYTES, page_addr(page + 1)), None);
    }

    #[test]
    fn allocate_pages_hands_out_contiguous_runs() {
        let mut dir = small_dir();
        let cfg = Config::new();
        let first = dir.allocate_pages(3, DEFAULT_HEAP, &cfg);
        for i in 0..3 {
            assert_eq!(dir.owner(first + i), DEFAULT_HEAP);
        }
        assert_eq!(dir.group(first), 3);
        assert_eq!(dir.group(first + 2), 1);
        assert_eq!(dir.free_pages, dir.total_pages - 3);
        let second = dir.allocate_pages(1, MARK_SWEEP_HEAP, &cfg);
        assert_ne!(first, second);
        assert_eq!(dir.owner(second), MARK_SWEEP_HEAP);
    }

    #[test]
    fn release_returns_pages_to_the_pool() {
        let mut dir = small_dir();
        let cfg = Config::new();
        let total = dir.free_pages;
        let first = dir.allocate_pages(2, MARK_SWEEP_HEAP, &cfg);
        dir.release_pages(first, 2);
        assert_eq!(dir.free_pages, total);
        assert_eq!(dir.owner(first), NO_HEAP);
    }

    #[test]
    fn expansion_grows_span_and_preserves_tables() {
        let mut dir = small_dir();
        let cfg = Config::new();
        let page = dir.allocate_pages(1, DEFAULT_HEAP, &cfg);
        let addr = page_addr(page) + 4 * WORD_BYTES;
        dir.set_object(addr);
        dir.set_space(page, STABLE_SPACE);
        let before = dir.total_pages;
        assert!(dir.expand(32 * PAGE_BYTES, &cfg).is_some());
        assert!(dir.total_pages > before);
        assert!(dir.is_object(addr));
        assert_eq!(dir.owner(page), DEFAULT_HEAP);
        assert_eq!(dir.space(page), STABLE_SPACE);
    }
}
