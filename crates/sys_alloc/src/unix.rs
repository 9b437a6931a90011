use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Returns the system page size, cached after the first query.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    // SAFETY: sysconf is always safe to call.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    let size = usize::try_from(size).unwrap_or(4096);
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

pub struct BlockInner {
    ptr: *mut u8,
    len: usize,
}

// The mapping is plain memory; thread affinity is the caller's concern.
unsafe impl Send for BlockInner {}
unsafe impl Sync for BlockInner {}

impl BlockInner {
    pub fn map(len: usize, hint: Option<usize>) -> io::Result<Self> {
        let len = len.max(1).next_multiple_of(page_size());
        let hint_ptr = hint.map_or(std::ptr::null_mut(), |addr| addr as *mut libc::c_void);
        // SAFETY: anonymous private mapping with no file descriptor. The hint
        // is advisory (no MAP_FIXED), so a bad hint cannot clobber anything.
        let ptr = unsafe {
            libc::mmap(
                hint_ptr,
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            ptr: ptr.cast::<u8>(),
            len,
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for BlockInner {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by us and is unmapped exactly once.
        unsafe {
            libc::munmap(self.ptr.cast::<libc::c_void>(), self.len);
        }
    }
}
