//! Low-level memory primitives for the collector.
//!
//! Provides anonymous, page-aligned block mapping with an optional placement
//! hint. The collector asks for blocks near its existing span so that the
//! page-directory tables, which cover the whole span, stay small.

use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

pub use os::page_size;

/// An anonymous memory mapping, unmapped on drop.
pub struct Block {
    inner: os::BlockInner,
}

impl Block {
    /// Map `len` bytes of zeroed, read-write anonymous memory.
    ///
    /// `hint` is a preferred placement address; the kernel may ignore it.
    /// The returned mapping is aligned to the OS page size.
    ///
    /// # Errors
    ///
    /// Returns the underlying OS error when the mapping cannot be created.
    pub fn map(len: usize, hint: Option<usize>) -> io::Result<Self> {
        Ok(Self {
            inner: os::BlockInner::map(len, hint)?,
        })
    }

    /// Pointer to the start of the mapping.
    #[must_use]
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Length of the mapping in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the mapping is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.len() == 0
    }

    /// Address one past the end of the mapping.
    #[must_use]
    pub fn end(&self) -> usize {
        self.inner.ptr() as usize + self.inner.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_write() {
        let block = Block::map(64 * 1024, None).unwrap();
        assert!(block.len() >= 64 * 1024);
        assert_eq!(block.ptr() as usize % page_size(), 0);
        unsafe {
            block.ptr().write(0xAB);
            block.ptr().add(block.len() - 1).write(0xCD);
            assert_eq!(block.ptr().read(), 0xAB);
        }
    }

    #[test]
    fn fresh_mapping_is_zeroed() {
        let block = Block::map(page_size(), None).unwrap();
        let words = block.len() / std::mem::size_of::<usize>();
        for i in 0..words {
            unsafe {
                assert_eq!(block.ptr().cast::<usize>().add(i).read(), 0);
            }
        }
    }

    #[test]
    fn hint_is_best_effort() {
        let first = Block::map(page_size(), None).unwrap();
        let hinted = Block::map(page_size(), Some(first.end())).unwrap();
        assert!(!hinted.ptr().is_null());
    }
}
