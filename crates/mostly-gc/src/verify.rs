//! Object and header verification, active when the `TSTOBJ` flag is set.
//!
//! All failures are fatal: a diagnostic on standard error, then abort.

use crate::heap::GcState;
use crate::object::{self, HEADER_BYTES};
#[cfg(not(feature = "headerless"))]
use crate::object::{header_is_forwarded, header_tag, header_words, max_words_per_page};
use crate::pages::{page_addr, page_of, UNALLOCATED_SPACE, WORD_BYTES};

/// Step from one object base to the next on the same page, skipping
/// through forwarded headers.
pub(crate) unsafe fn next_object(st: &GcState, obj: usize) -> usize {
    #[cfg(not(feature = "headerless"))]
    {
        let _ = st;
        // SAFETY: per contract, obj - HEADER_BYTES is a header slot.
        let header = unsafe { *((obj - HEADER_BYTES) as *const usize) };
        let words = if header_is_forwarded(header) {
            // SAFETY: a forward stores the new base; its header precedes it.
            unsafe { header_words(*((header - HEADER_BYTES) as *const usize)) }
        } else {
            header_words(header)
        };
        obj + words * WORD_BYTES
    }
    #[cfg(feature = "headerless")]
    {
        // SAFETY: per contract, obj is an object base.
        obj + unsafe { object::object_words(&st.dir, obj) } * WORD_BYTES
    }
}

/// Verify that `obj` is the base of an object in the heap. `old` means the
/// object is expected on the collection's source side (not in FreeSpace);
/// otherwise it must sit in a page acquired for the current space.
pub(crate) unsafe fn verify_object(st: &GcState, obj: usize, old: bool) {
    let page = page_of(obj);
    let mut error = 0;
    'fail: {
        if page < st.dir.first_page() {
            break 'fail;
        }
        error = 1;
        if page > st.dir.last_page() {
            break 'fail;
        }
        error = 2;
        if st.dir.space(page) == UNALLOCATED_SPACE {
            break 'fail;
        }
        error = 3;
        if old && st.dir.in_free_space(page, st.default_heap.from) {
            break 'fail;
        }
        error = 4;
        if !old && st.dir.space(page) != st.default_heap.next_space {
            break 'fail;
        }
        error = 5;
        // Walk the page's objects; obj must be one of the bases.
        let mut walk = page_addr(page) + HEADER_BYTES;
        while obj > walk {
            // SAFETY: walk steps through valid headers up the page.
            walk = unsafe { next_object(st, walk) };
        }
        if obj == walk {
            return;
        }
    }
    eprintln!("\n***** mgc  invalid pointer  error: {error}  pointer: {obj:#x}");
    std::process::abort();
}

/// Verify the header (or map-derived extent) of the object based at `obj`.
#[cfg_attr(feature = "headerless", allow(unused_variables))]
pub(crate) unsafe fn verify_header(st: &GcState, obj: usize) {
    let page = page_of(obj);
    // SAFETY: per contract, obj is an object base.
    let words = unsafe { object::object_words(&st.dir, obj) };
    let mut error = 0;
    'fail: {
        #[cfg(not(feature = "headerless"))]
        {
            // SAFETY: obj - HEADER_BYTES is the header slot.
            let header = unsafe { *((obj - HEADER_BYTES) as *const usize) };
            if header_is_forwarded(header) {
                break 'fail;
            }
            error = 1;
            if header_tag(header) > 2 {
                break 'fail;
            }
            if words <= max_words_per_page() {
                error = 2;
                if obj - HEADER_BYTES + words * WORD_BYTES > page_addr(page + 1) {
                    break 'fail;
                }
                return;
            }
            error = 3;
            let pages = words.div_ceil(crate::pages::WORDS_PER_PAGE);
            for k in 1..pages {
                let cont = page + k;
                if cont > st.dir.last_page()
                    || st.dir.group(cont) > 0
                    || st.dir.space(cont) != st.dir.space(page)
                {
                    break 'fail;
                }
            }
            return;
        }
        #[cfg(feature = "headerless")]
        {
            error = 2;
            let head = st.dir.group_head(page);
            let group = st.dir.group(head).max(1) as usize;
            if obj + words * WORD_BYTES > page_addr(head + group) {
                break 'fail;
            }
            return;
        }
    }
    eprintln!("\n***** mgc  invalid header  error: {error}  object&: {obj:#x}");
    std::process::abort();
}
