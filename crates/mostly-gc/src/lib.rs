//! A mostly-copying, generational, conservative garbage collector.
//!
//! `mostly-gc` manages a collected heap that coexists with the ordinary
//! system allocator: programs mix collected objects with untraced heap and
//! stack data, and the collector discovers roots by conservatively
//! scanning CPU registers, the call stack, static data, registered root
//! areas, and (optionally) the untraced heap.
//!
//! Storage is partitioned into 512-byte pages. A collection promotes every
//! page referenced from an ambiguous root in place — objects directly
//! visible from the stack never move — then compacts the rest of the live
//! data by copying it into the stable set. Advancing a space counter frees
//! the old allocation space wholesale. Generational behavior comes from
//! this space partitioning alone; there are no write barriers.
//!
//! # Quick start
//!
//! ```ignore
//! use mostly_gc::{alloc_object, GcPtr, Scavenger, Traverse};
//!
//! #[derive(Traverse)]
//! struct Node {
//!     value: i64,
//!     next: GcPtr<Node>,
//! }
//!
//! let mut head = alloc_object(Node { value: 1, next: GcPtr::null() });
//! head.next = alloc_object(Node { value: 2, next: GcPtr::null() });
//! assert_eq!(head.next.value, 2);
//! ```
//!
//! Types stored in the heap implement [`Traverse`] (usually through
//! `#[derive(Traverse)]`), reporting every embedded pointer to the
//! [`Scavenger`]. The collector is single-threaded: each thread that uses
//! the crate gets an independent heap.

#![warn(missing_docs)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]

mod config;
mod gc;
mod heap;
mod msheap;
mod object;
mod pages;
mod platform;
mod ptr;
mod roots;
mod scan;
mod stats;
mod tracing;
mod traverse;
mod verify;

pub use config::{configure, flags, verbose, Config};
pub use gc::Scavenger;
pub use heap::{
    heap_bytes, init, is_traced, register_heap, register_root_area, uncollected,
    unregister_root_area, GcState, Heap,
};
pub use object::GcArray;
pub use pages::{
    HeapId, PageId, DEFAULT_HEAP, MARK_SWEEP_HEAP, NO_HEAP, PAGE_BYTES, UNCOLLECTED_HEAP,
};
pub use ptr::GcPtr;
pub use stats::{last_collect_stats, CollectKind, CollectStats};
pub use traverse::Traverse;

// Re-export the derive macro alongside the trait it implements.
#[cfg(feature = "derive")]
pub use mostly_gc_derive::Traverse;

use heap::with_gc;
use object::GcBox;

/// Allocate a collected object in the default heap.
pub fn alloc_object<T: Traverse>(value: T) -> GcPtr<T> {
    with_gc(|st| gc::alloc_in_default(st, value, 0))
}

/// Allocate a variable-size collected object: `value` followed by
/// `extra_bytes` of zeroed trailing storage.
pub fn alloc_var_object<T: Traverse>(value: T, extra_bytes: usize) -> GcPtr<T> {
    with_gc(|st| gc::alloc_in_default(st, value, extra_bytes))
}

/// Allocate a collected array of `len` zeroed elements.
pub fn alloc_array<T: Traverse>(len: usize) -> GcPtr<GcArray<T>> {
    with_gc(|st| {
        gc::alloc_in_default(st, GcArray::with_len(len), len * std::mem::size_of::<T>())
    })
}

/// Allocate a collected object in the given heap.
///
/// The default heap bump-allocates; the mark-and-sweep companion serves
/// from its free lists; the uncollected heap hands out untraced storage.
pub fn alloc_object_in<T: Traverse>(heap: HeapId, value: T) -> GcPtr<T> {
    with_gc(|st| {
        if heap == DEFAULT_HEAP {
            gc::alloc_in_default(st, value, 0)
        } else if heap == MARK_SWEEP_HEAP {
            let addr = msheap::alloc(st, std::mem::size_of::<GcBox<T>>()) as usize;
            // SAFETY: a fresh block large enough for GcBox<T>.
            unsafe { install(addr, value) }
        } else if heap == UNCOLLECTED_HEAP {
            let addr = uncollected::alloc_zeroed(std::mem::size_of::<GcBox<T>>()) as usize;
            assert!(addr != 0, "uncollected allocation failed");
            // SAFETY: a fresh untraced allocation of the right size.
            unsafe { install(addr, value) }
        } else {
            let bytes = std::mem::size_of::<GcBox<T>>();
            let addr = heap::with_user_heap(st, heap, |gc, h| h.alloc(gc, bytes) as usize)
                .expect("no such heap");
            // SAFETY: the heap returned a block of the requested size.
            unsafe { install(addr, value) }
        }
    })
}

/// Lay a `GcBox<T>` down at `addr`.
unsafe fn install<T: Traverse>(addr: usize, value: T) -> GcPtr<T> {
    assert!(
        std::mem::align_of::<T>() <= std::mem::size_of::<usize>(),
        "collected types must not require more than word alignment"
    );
    // SAFETY: per caller, addr is a fresh allocation of at least
    // size_of::<GcBox<T>>() bytes.
    unsafe {
        let boxed = addr as *mut GcBox<T>;
        std::ptr::addr_of_mut!((*boxed).kind).write(object::kind_of::<T>());
        std::ptr::addr_of_mut!((*boxed).value).write(value);
        GcPtr::from_box_addr(addr)
    }
}

/// Collect the default heap.
pub fn collect() {
    with_gc(gc::collect_now);
}

/// Merge the stable set back into the allocation space, then collect:
/// every live object is reconsidered.
pub fn collect_full() {
    with_gc(|st| {
        gc::empty_stable_space(st);
        gc::collect_now(st);
    });
}

/// Request collection of the given heap.
pub fn collect_heap(heap: HeapId) {
    with_gc(|st| {
        if heap == DEFAULT_HEAP {
            gc::collect_now(st);
        } else if heap == MARK_SWEEP_HEAP {
            msheap::collect(st);
        } else if heap == UNCOLLECTED_HEAP {
            eprintln!("warning: garbage collection on a non-collectable heap");
        } else {
            heap::with_user_heap(st, heap, |gc, h| h.collect(gc));
        }
    });
}

/// The mark-and-sweep companion heap.
pub mod ms {
    use super::{msheap, with_gc};

    /// Allocate `bytes` of storage.
    #[must_use]
    pub fn alloc(bytes: usize) -> *mut u8 {
        with_gc(|st| msheap::alloc(st, bytes))
    }

    /// Release storage previously returned by [`alloc`].
    pub fn free(ptr: *mut u8) {
        with_gc(|st| msheap::reclaim(st, ptr));
    }

    /// Collect the companion heap now, regardless of its footprint.
    pub fn collect() {
        with_gc(msheap::collect);
    }
}

/// Test support: explicitly registered roots.
#[doc(hidden)]
pub mod test_util {
    use super::with_gc;

    /// Register a pointer value treated as a root by every collection.
    pub fn register_test_root(ptr: *const u8) {
        with_gc(|st| st.test_roots.push(ptr as usize));
    }

    /// Drop all registered test roots.
    pub fn clear_test_roots() {
        with_gc(|st| st.test_roots.clear());
    }
}

#[cfg(test)]
mod lifecycle_tests {
    use super::*;

    #[derive(Debug)]
    struct Pair {
        a: GcPtr<Pair>,
        b: i64,
    }

    // SAFETY: reports the only pointer field; tolerates zeroed state.
    unsafe impl Traverse for Pair {
        fn traverse(&mut self, sc: &mut Scavenger<'_>) {
            sc.scavenge(&mut self.a);
        }
    }

    #[test]
    fn alloc_sets_object_start_bit() {
        let p = alloc_object(Pair {
            a: GcPtr::null(),
            b: 7,
        });
        with_gc(|st| {
            let addr = p.as_ptr() as usize - std::mem::size_of::<usize>();
            assert!(st.dir.is_object(addr), "object-start bit missing");
        });
        assert_eq!(p.b, 7);
    }

    #[test]
    fn page_tags_progress_through_the_lifecycle() {
        let p = alloc_object(Pair {
            a: GcPtr::null(),
            b: 1,
        });
        let page = pages::page_of(p.as_ptr() as usize);
        let from_before = with_gc(|st| {
            assert_eq!(st.dir.owner(page), DEFAULT_HEAP);
            assert_eq!(st.dir.space(page), st.default_heap.from);
            st.default_heap.from
        });
        collect();
        with_gc(|st| {
            assert_eq!(st.default_heap.from, from_before + 1);
            // The page was reachable from the stack, so it was promoted in
            // place; nothing may still carry the old FromSpace tag as its
            // current space.
            assert_eq!(st.dir.space(page), pages::STABLE_SPACE);
            gc::invariants::check(st);
        });
        assert_eq!(p.b, 1);
    }

    #[test]
    fn chain_survives_collections_and_objects_move() {
        let head = alloc_object(Pair {
            a: GcPtr::null(),
            b: 0,
        });
        let mut cur = head;
        for i in 1..200 {
            let next = alloc_object(Pair {
                a: GcPtr::null(),
                b: i,
            });
            cur.a = next;
            cur = next;
        }
        collect();
        collect();
        let mut walk = head;
        for i in 0..200 {
            assert_eq!(walk.b, i);
            walk = walk.a;
        }
        assert!(walk.is_null());
        with_gc(|st| gc::invariants::check(st));
    }

    #[test]
    fn full_collection_twice_is_stable() {
        let mut nodes = Vec::new();
        for i in 0..64 {
            nodes.push(alloc_object(Pair {
                a: GcPtr::null(),
                b: i,
            }));
        }
        register_root_area(
            nodes.as_ptr().cast::<u8>(),
            nodes.len() * std::mem::size_of::<GcPtr<Pair>>(),
        );
        collect_full();
        let first = (heap_bytes(), with_gc(|st| st.default_heap.stable_pages));
        collect_full();
        let second = (heap_bytes(), with_gc(|st| st.default_heap.stable_pages));
        assert_eq!(first, second);
        for (i, n) in nodes.iter().enumerate() {
            assert_eq!(n.b, i as i64);
        }
        unregister_root_area(nodes.as_ptr().cast::<u8>());
    }

    #[test]
    fn is_traced_distinguishes_regions() {
        let p = alloc_object(Pair {
            a: GcPtr::null(),
            b: 3,
        });
        assert!(is_traced(p.as_ptr().cast::<u8>()));
        let local = 0u64;
        assert!(is_traced(std::ptr::addr_of!(local).cast::<u8>()));
        let boxed = Box::new(0u64);
        let heap_ptr: *const u64 = &*boxed;
        // Ordinary allocator storage is not a collected region.
        assert!(!is_traced(heap_ptr.cast::<u8>()));
        drop(boxed);
        assert_eq!(p.b, 3);
    }

    #[test]
    fn ms_heap_allocates_and_reclaims() {
        let a = ms::alloc(40);
        let b = ms::alloc(40);
        assert!(!a.is_null() && !b.is_null());
        assert_ne!(a, b);
        with_gc(|st| {
            let page = pages::page_of(a as usize);
            assert_eq!(st.dir.owner(page), MARK_SWEEP_HEAP);
        });
        ms::free(a);
        let c = ms::alloc(40);
        // The freed block is recycled.
        assert_eq!(a, c);
        ms::free(b);
        ms::free(c);
    }
}
