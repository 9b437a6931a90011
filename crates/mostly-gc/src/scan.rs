//! Conservative scanning of arbitrary memory regions.

use crate::pages::WORD_BYTES;

/// Feed every word of `[start, end)` to `f` as a candidate pointer.
///
/// Words are read through a pointer-sized integer, never through a typed
/// pointer, so non-pointer data is read soundly. Only word alignment is
/// assumed; a misaligned start is rounded up.
///
/// # Safety
///
/// The region must be readable for its whole length.
pub(crate) unsafe fn scan_region(start: usize, end: usize, mut f: impl FnMut(usize)) {
    let mut current = start.next_multiple_of(WORD_BYTES);
    while current + WORD_BYTES <= end {
        // SAFETY: caller guarantees readability; volatile keeps the
        // compiler from assuming anything about the bytes.
        let word = unsafe { std::ptr::read_volatile(current as *const usize) };
        f(word);
        current += WORD_BYTES;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scans_every_aligned_word() {
        let data = [1usize, 2, 3, 4];
        let start = data.as_ptr() as usize;
        let end = start + std::mem::size_of_val(&data);
        let mut seen = Vec::new();
        unsafe { scan_region(start, end, |w| seen.push(w)) };
        assert_eq!(seen, vec![1, 2, 3, 4]);
    }

    #[test]
    fn misaligned_start_is_rounded_up() {
        let data = [7usize, 8, 9];
        let start = data.as_ptr() as usize + 1;
        let end = data.as_ptr() as usize + std::mem::size_of_val(&data);
        let mut seen = Vec::new();
        unsafe { scan_region(start, end, |w| seen.push(w)) };
        assert_eq!(seen, vec![8, 9]);
    }
}
