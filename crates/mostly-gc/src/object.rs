//! Object model: header encoding, forwarding, traversal descriptors.
//!
//! With the default build every object carries a one-word header,
//! `[tag:11][words:20][mark:1]`. A mark bit of 1 means a valid header; 0
//! means the whole word has been overwritten with a forwarding address.
//! With the `headerless` feature there is no header word: object sizes are
//! recovered from the object-start bitmap, and "forwarded" is encoded as
//! the live bit set while the page is still in FromSpace, with the new
//! address stored in the object's first word.

use std::marker::PhantomData;

use crate::gc::Scavenger;
#[cfg(feature = "headerless")]
use crate::pages::{page_addr, page_of};
use crate::pages::{PageDirectory, WORD_BYTES, WORDS_PER_PAGE};
use crate::traverse::Traverse;

#[cfg(all(feature = "headerless", feature = "double-align"))]
compile_error!("the double-align padding scheme requires object headers");

/// Words occupied by the object header.
pub(crate) const HEADER_WORDS: usize = if cfg!(feature = "headerless") { 0 } else { 1 };

/// Bytes occupied by the object header.
pub(crate) const HEADER_BYTES: usize = HEADER_WORDS * WORD_BYTES;

/// Header tag of free-space filler objects.
pub(crate) const FREE_TAG: usize = 0;
/// Header tag of alignment pad objects.
#[cfg(feature = "double-align")]
pub(crate) const PAD_TAG: usize = 1;
/// Header tag of live objects.
pub(crate) const OBJECT_TAG: usize = 2;

/// Largest encodable object size, in words (header included).
pub(crate) const MAX_HEADER_WORDS: usize = 0xF_FFFF;

#[inline]
pub(crate) const fn make_header(words: usize, tag: usize) -> usize {
    tag << 21 | words << 1 | 1
}

#[inline]
pub(crate) const fn header_tag(header: usize) -> usize {
    header >> 21 & 0x7FF
}

#[inline]
pub(crate) const fn header_words(header: usize) -> usize {
    header >> 1 & 0xF_FFFF
}

#[inline]
pub(crate) const fn header_is_forwarded(header: usize) -> bool {
    header & 1 == 0
}

/// Traversal descriptor. The first word of every collected object points
/// at one of these; the allocator installs [`NOOP_KIND`] before the value
/// is written so a collection arriving in between finds a traversable
/// object.
#[repr(C)]
pub struct ObjectKind {
    pub(crate) traverse: unsafe fn(*mut u8, &mut Scavenger<'_>),
}

unsafe fn noop_traverse(_obj: *mut u8, _sc: &mut Scavenger<'_>) {}

/// Descriptor of an object with nothing to traverse.
pub(crate) static NOOP_KIND: ObjectKind = ObjectKind {
    traverse: noop_traverse,
};

/// Descriptor of the filler written to close a page.
#[cfg(feature = "headerless")]
pub(crate) static FREE_KIND: ObjectKind = ObjectKind {
    traverse: noop_traverse,
};

unsafe fn traverse_thunk<T: Traverse>(obj: *mut u8, sc: &mut Scavenger<'_>) {
    let boxed = obj.cast::<GcBox<T>>();
    // SAFETY: the thunk is only installed on objects laid out as GcBox<T>.
    unsafe { (*boxed).value.traverse(sc) }
}

struct KindFor<T>(PhantomData<T>);

impl<T: Traverse> KindFor<T> {
    const KIND: ObjectKind = ObjectKind {
        traverse: traverse_thunk::<T>,
    };
}

/// The traversal descriptor for `T`.
pub(crate) fn kind_of<T: Traverse>() -> &'static ObjectKind {
    &KindFor::<T>::KIND
}

/// Heap layout of a collected object: the descriptor word followed by the
/// value (and, for variable-size objects, trailing storage).
#[repr(C)]
pub struct GcBox<T> {
    pub(crate) kind: &'static ObjectKind,
    pub(crate) value: T,
}

/// Dispatch an object's traversal through its descriptor word.
///
/// # Safety
///
/// `obj` must be the base address of a live, non-forwarded collected
/// object.
pub(crate) unsafe fn traverse_object(obj: usize, sc: &mut Scavenger<'_>) {
    // SAFETY: the descriptor is the object's first word and is installed
    // at allocation time.
    unsafe {
        let kind = *(obj as *const *const ObjectKind);
        ((*kind).traverse)(obj as *mut u8, sc);
    }
}

/// Size of the object based at `obj`, in words, header included.
#[cfg(not(feature = "headerless"))]
pub(crate) unsafe fn object_words(_dir: &PageDirectory, obj: usize) -> usize {
    // SAFETY: per contract, obj - HEADER_BYTES is a valid header word.
    unsafe { header_words(*((obj - HEADER_BYTES) as *const usize)) }
}

/// Size of the object based at `obj`, in words: the distance to the next
/// object-start bit, or to the end of the page group.
#[cfg(feature = "headerless")]
pub(crate) unsafe fn object_words(dir: &PageDirectory, obj: usize) -> usize {
    let page = page_of(obj);
    let head = dir.group_head(page);
    let group = dir.group(head).max(1) as usize;
    let limit = page_addr(head + group);
    match dir.next_object_bit(obj + WORD_BYTES, limit) {
        Some(next) => (next - obj) / WORD_BYTES,
        None => (limit - obj) / WORD_BYTES,
    }
}

/// Whether the object based at `obj` has been forwarded.
pub(crate) unsafe fn is_forwarded(dir: &PageDirectory, from: u32, obj: usize) -> bool {
    #[cfg(not(feature = "headerless"))]
    {
        let _ = (dir, from);
        // SAFETY: per contract, obj - HEADER_BYTES is the header slot.
        unsafe { header_is_forwarded(*((obj - HEADER_BYTES) as *const usize)) }
    }
    #[cfg(feature = "headerless")]
    {
        dir.is_marked(obj) && dir.space(page_of(obj)) == from
    }
}

/// Record that the object based at `obj` now lives at `new`.
pub(crate) unsafe fn set_forward(dir: &mut PageDirectory, obj: usize, new: usize) {
    #[cfg(not(feature = "headerless"))]
    {
        let _ = dir;
        // SAFETY: overwrites the header slot; the address is word-aligned
        // so its low bit is 0, which is what marks the word as a forward.
        unsafe { *((obj - HEADER_BYTES) as *mut usize) = new };
    }
    #[cfg(feature = "headerless")]
    {
        dir.mark(obj);
        // SAFETY: the old object body is dead once forwarded.
        unsafe { *(obj as *mut usize) = new };
    }
}

/// The forwarding address stored for the object based at `obj`.
pub(crate) unsafe fn get_forward(obj: usize) -> usize {
    #[cfg(not(feature = "headerless"))]
    // SAFETY: per contract the header slot holds the forwarding address.
    unsafe {
        *((obj - HEADER_BYTES) as *const usize)
    }
    #[cfg(feature = "headerless")]
    // SAFETY: per contract the first word holds the forwarding address.
    unsafe {
        *(obj as *const usize)
    }
}

/// Largest single-object size that still leaves room on its page, in words.
#[inline]
pub(crate) const fn max_words_per_page() -> usize {
    if cfg!(feature = "double-align") {
        WORDS_PER_PAGE - HEADER_WORDS
    } else {
        WORDS_PER_PAGE
    }
}

/// Request size in words, header included.
#[inline]
pub(crate) const fn bytes_to_words(bytes: usize) -> usize {
    bytes.div_ceil(WORD_BYTES) + HEADER_WORDS
}

// ----------------------------------------------------------------------
// Arrays
// ----------------------------------------------------------------------

/// A collected array: a length word followed by `len` trailing elements.
///
/// Storage is zeroed at allocation, so a collection that runs before the
/// elements are written finds traversable state (see the [`Traverse`]
/// safety contract).
#[repr(C)]
pub struct GcArray<T> {
    len: usize,
    _marker: PhantomData<T>,
}

impl<T> GcArray<T> {
    pub(crate) const fn with_len(len: usize) -> Self {
        Self {
            len,
            _marker: PhantomData,
        }
    }

    /// Number of elements.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Whether the array is empty.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn elems(&self) -> *mut T {
        let base = (self as *const Self).cast_mut();
        // Elements trail the length word.
        unsafe { base.add(1).cast::<T>() }
    }

    /// The elements as a slice.
    #[must_use]
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: allocation reserved len elements of trailing storage.
        unsafe { std::slice::from_raw_parts(self.elems(), self.len) }
    }

    /// The elements as a mutable slice.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: allocation reserved len elements of trailing storage.
        unsafe { std::slice::from_raw_parts_mut(self.elems(), self.len) }
    }
}

impl<T> std::ops::Index<usize> for GcArray<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}

impl<T> std::ops::IndexMut<usize> for GcArray<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.as_mut_slice()[index]
    }
}

// SAFETY: traverses every element; zeroed storage is a zero-length prefix
// of zeroed elements, which the element contract requires to be tolerable.
unsafe impl<T: Traverse> Traverse for GcArray<T> {
    fn traverse(&mut self, sc: &mut Scavenger<'_>) {
        for elem in self.as_mut_slice() {
            elem.traverse(sc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips() {
        let h = make_header(1234, OBJECT_TAG);
        assert_eq!(header_words(h), 1234);
        assert_eq!(header_tag(h), OBJECT_TAG);
        assert!(!header_is_forwarded(h));
    }

    #[test]
    fn header_field_limits() {
        let h = make_header(MAX_HEADER_WORDS, OBJECT_TAG);
        assert_eq!(header_words(h), MAX_HEADER_WORDS);
        assert_eq!(header_tag(h), OBJECT_TAG);
        let free = make_header(7, FREE_TAG);
        assert_eq!(header_tag(free), FREE_TAG);
        assert_eq!(header_words(free), 7);
    }

    #[test]
    fn word_aligned_addresses_read_as_forwarded() {
        // Any word-aligned address has a clear low bit, which is exactly
        // the forwarded encoding.
        assert!(header_is_forwarded(0x7f00_1234_5678));
        assert!(!header_is_forwarded(make_header(2, OBJECT_TAG)));
    }

    #[test]
    fn size_rounding_includes_header() {
        assert_eq!(bytes_to_words(1), 1 + HEADER_WORDS);
        assert_eq!(bytes_to_words(WORD_BYTES), 1 + HEADER_WORDS);
        assert_eq!(bytes_to_words(WORD_BYTES + 1), 2 + HEADER_WORDS);
    }
}
