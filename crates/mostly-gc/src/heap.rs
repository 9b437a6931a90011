//! Heaps and the thread-local collector state.
//!
//! Any number of heaps share the page directory; pages are tagged with
//! their owner. The default (mostly-copying) heap and the mark-and-sweep
//! companion are built in; further heaps implement [`Heap`] and register
//! through [`register_heap`]. The collector, on meeting a pointer into
//! another registered heap, visits the object through that heap when it is
//! transparent and leaves it alone when it is opaque.

use std::cell::RefCell;

use crate::config::{self, Config};
use crate::gc::DefaultHeap;
use crate::msheap::MarkSweepHeap;
use crate::pages::{PageDirectory, PageId, FIRST_USER_HEAP, HeapId, PAGE_BYTES};
use crate::platform;
use crate::roots::RootAreas;

/// A heap cooperating through the shared page directory.
///
/// Implementations receive the collector state so they can reach the page
/// directory and interact with the other heaps.
pub trait Heap {
    /// Allocate `bytes` of storage, returning its address.
    fn alloc(&mut self, gc: &mut GcState, bytes: usize) -> *mut u8;

    /// Release storage previously returned by `alloc`. May be a no-op.
    fn reclaim(&mut self, _gc: &mut GcState, _ptr: *mut u8) {}

    /// Collect this heap.
    fn collect(&mut self, _gc: &mut GcState) {
        eprintln!("warning: garbage collection on a non-collectable heap");
    }

    /// Update a pointer-typed location during another heap's collection.
    fn scavenge(&mut self, _gc: &mut GcState, _loc: *mut usize) {}

    /// Treat the words of one of this heap's pages as ambiguous roots for
    /// the collecting heap.
    fn scan_roots(&mut self, _gc: &mut GcState, _page: PageId) {}

    /// An opaque heap's interior is never scanned by other collectors.
    fn opaque(&self) -> bool {
        true
    }

    /// Whether `ptr` points into storage owned by this heap.
    fn inside(&self, gc: &GcState, ptr: *const u8) -> bool {
        let page = crate::pages::page_of(ptr as usize);
        gc.dir.contains(page) && gc.dir.owner(page) == self.id()
    }

    /// The identity this heap was registered under.
    fn id(&self) -> HeapId;
}

/// The untraced system heap. Owns no pages in the directory, serves
/// `malloc`/`free` directly, and is always opaque; with the `HEAPROOTS`
/// flag its span is scanned for ambiguous roots.
pub mod uncollected {
    /// Allocate untraced storage.
    #[must_use]
    pub fn alloc(bytes: usize) -> *mut u8 {
        // SAFETY: plain malloc.
        unsafe { libc::malloc(bytes.max(1)).cast::<u8>() }
    }

    /// Allocate zeroed untraced storage.
    #[must_use]
    pub fn alloc_zeroed(bytes: usize) -> *mut u8 {
        // SAFETY: plain calloc.
        unsafe { libc::calloc(bytes.max(1), 1).cast::<u8>() }
    }

    /// Release untraced storage.
    pub fn free(ptr: *mut u8) {
        // SAFETY: ptr came from alloc/alloc_zeroed above.
        unsafe { libc::free(ptr.cast::<libc::c_void>()) }
    }
}

/// Per-thread collector state: the page directory and every heap attached
/// to it.
pub struct GcState {
    pub(crate) config: Config,
    pub(crate) dir: PageDirectory,
    pub(crate) default_heap: DefaultHeap,
    pub(crate) ms: MarkSweepHeap,
    pub(crate) roots: RootAreas,
    pub(crate) user_heaps: Vec<Option<Box<dyn Heap>>>,
    /// Base of the mutator stack, captured at initialization.
    pub(crate) stack_bottom: usize,
    /// Start of the untraced system heap span.
    pub(crate) global_heap_start: usize,
    /// Foreign pages already delegated during the current collection.
    pub(crate) scanned_foreign: Vec<PageId>,
    /// Explicitly registered test roots.
    pub(crate) test_roots: Vec<usize>,
}

impl GcState {
    fn new() -> Self {
        let config = config::take_effective();
        let dir = match PageDirectory::new(config.min_heap) {
            Ok(dir) => dir,
            Err(_) => {
                eprintln!(
                    "\n****** mgc  unable to allocate {} byte heap",
                    config.min_heap
                );
                std::process::abort();
            }
        };
        let default_heap = DefaultHeap::new(dir.first_page());
        Self {
            config,
            dir,
            default_heap,
            ms: MarkSweepHeap::new(),
            roots: RootAreas::new(),
            user_heaps: Vec::new(),
            stack_bottom: platform::stack_base(),
            global_heap_start: platform::uncollected_heap_start(),
            scanned_foreign: Vec::new(),
            test_roots: Vec::new(),
        }
    }

    /// Percent of the heap the given page count represents.
    pub(crate) fn heap_percent(&self, pages: usize) -> usize {
        pages * 100 / (self.default_heap.reserved_pages + self.dir.free_pages)
    }

    pub(crate) fn verbose(&self, bit: u32) -> bool {
        self.config.verbose & bit != 0
    }

    pub(crate) fn flag(&self, bit: u32) -> bool {
        self.config.flags & bit != 0
    }

    // Surface for user heap implementations.

    /// Reserve `pages` contiguous pages owned by `heap` in the page
    /// directory; returns their base address. The caller lays the run out
    /// and sets space tags as its discipline requires.
    pub fn allocate_heap_pages(&mut self, pages: usize, heap: HeapId) -> *mut u8 {
        let cfg = self.config;
        let first = self.dir.allocate_pages(pages, heap, &cfg);
        crate::pages::page_addr(first) as *mut u8
    }

    /// Return a page run to the free pool.
    pub fn release_heap_pages(&mut self, addr: *const u8, pages: usize) {
        self.dir
            .release_pages(crate::pages::page_of(addr as usize), pages);
    }

    /// Record an object start so interior pointers into this address
    /// resolve to it.
    pub fn note_object_start(&mut self, addr: *const u8) {
        self.dir.set_object(addr as usize);
    }

    /// Treat a word as an ambiguous root for the default heap; used by
    /// `Heap::scan_roots` implementations.
    pub fn promote_candidate(&mut self, word: usize) {
        crate::gc::promote_page(self, word);
    }

    /// The effective configuration.
    #[must_use]
    pub fn effective_config(&self) -> &Config {
        &self.config
    }
}

thread_local! {
    static STATE: RefCell<Option<GcState>> = const { RefCell::new(None) };
}

/// Run `f` with the thread's collector state, creating it on first use.
///
/// Reentry (e.g. allocating into the collected heap from inside a
/// `traverse` callback) is rejected with a panic.
pub(crate) fn with_gc<R>(f: impl FnOnce(&mut GcState) -> R) -> R {
    STATE.with(|s| {
        let mut guard = s
            .try_borrow_mut()
            .expect("collected heap entered reentrantly; traverse callbacks must not allocate into the heap being collected");
        let state = guard.get_or_insert_with(GcState::new);
        f(state)
    })
}

/// Create the collector state for this thread if it does not exist yet.
/// Idempotent; every public entry point calls it implicitly.
pub fn init() {
    with_gc(|_| ());
}

/// Register an additional heap. Returns the identity under which its pages
/// appear in the page directory.
pub fn register_heap(heap: Box<dyn Heap>) -> HeapId {
    with_gc(|st| {
        st.user_heaps.push(Some(heap));
        HeapId(FIRST_USER_HEAP + u16::try_from(st.user_heaps.len() - 1).expect("too many heaps"))
    })
}

/// Run `f` with a registered user heap temporarily detached from the
/// state, so it can receive the state mutably alongside itself.
pub(crate) fn with_user_heap<R>(
    st: &mut GcState,
    id: HeapId,
    f: impl FnOnce(&mut GcState, &mut dyn Heap) -> R,
) -> Option<R> {
    let idx = (id.0 as usize).checked_sub(FIRST_USER_HEAP as usize)?;
    let mut heap = st.user_heaps.get_mut(idx)?.take()?;
    let result = f(st, heap.as_mut());
    st.user_heaps[idx] = Some(heap);
    Some(result)
}

/// Opacity of a registered user heap, without detaching it.
pub(crate) fn user_heap_opaque(st: &GcState, id: HeapId) -> Option<bool> {
    let idx = (id.0 as usize).checked_sub(FIRST_USER_HEAP as usize)?;
    st.user_heaps.get(idx)?.as_ref().map(|h| h.opaque())
}

/// Total heap size in bytes.
#[must_use]
pub fn heap_bytes() -> usize {
    with_gc(|st| st.dir.heap_bytes())
}

/// Whether `p` points into a region the collector scans: the stack, the
/// static areas, or a page owned by a collected heap.
#[must_use]
pub fn is_traced(p: *const u8) -> bool {
    let addr = p as usize;
    with_gc(|st| {
        let probe = 0usize;
        let sp = std::ptr::addr_of!(probe) as usize;
        if addr >= sp && addr < st.stack_bottom {
            return true;
        }
        let mut in_static = false;
        platform::data_segments_for_each(|base, limit| {
            if (base..limit).contains(&addr) {
                in_static = true;
            }
        });
        if in_static {
            return true;
        }
        let page = crate::pages::page_of(addr);
        if !st.dir.contains(page) {
            return false;
        }
        let owner = st.dir.owner(page);
        owner != crate::pages::NO_HEAP && owner != crate::pages::UNCOLLECTED_HEAP
    })
}

/// Declare `[addr, addr + bytes)` as a region of ambiguous roots.
pub fn register_root_area(addr: *const u8, bytes: usize) {
    with_gc(|st| st.roots.insert(addr as usize, bytes));
}

/// Remove a region previously registered with [`register_root_area`].
pub fn unregister_root_area(addr: *const u8) {
    with_gc(|st| st.roots.erase(addr as usize));
}

const _: () = assert!(PAGE_BYTES.is_power_of_two());
