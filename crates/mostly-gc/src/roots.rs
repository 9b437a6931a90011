//! Registered root areas.
//!
//! Regions of memory the mutator declares to contain ambiguous roots.
//! Every word of a registered area is treated as a candidate pointer by
//! the promotion phase.

/// A registered region.
#[derive(Debug, Clone, Copy)]
struct RootArea {
    addr: usize,
    bytes: usize,
}

/// The set of registered root areas. Erased slots are tombstoned and
/// reused by later insertions.
pub(crate) struct RootAreas {
    entries: Vec<Option<RootArea>>,
    freed: usize,
}

impl RootAreas {
    pub(crate) const fn new() -> Self {
        Self {
            entries: Vec::new(),
            freed: 0,
        }
    }

    pub(crate) fn insert(&mut self, addr: usize, bytes: usize) {
        let area = RootArea { addr, bytes };
        if self.freed > 0 {
            if let Some(slot) = self.entries.iter_mut().find(|e| e.is_none()) {
                *slot = Some(area);
                self.freed -= 1;
                return;
            }
        }
        self.entries.push(Some(area));
    }

    pub(crate) fn erase(&mut self, addr: usize) {
        if let Some(slot) = self
            .entries
            .iter_mut()
            .find(|e| e.is_some_and(|a| a.addr == addr))
        {
            *slot = None;
            self.freed += 1;
        }
    }

    /// Snapshot of the registered `(addr, bytes)` pairs.
    pub(crate) fn snapshot(&self) -> Vec<(usize, usize)> {
        self.entries
            .iter()
            .flatten()
            .map(|a| (a.addr, a.bytes))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_erase_reuse() {
        let mut roots = RootAreas::new();
        roots.insert(0x1000, 64);
        roots.insert(0x2000, 32);
        assert_eq!(roots.snapshot(), vec![(0x1000, 64), (0x2000, 32)]);
        roots.erase(0x1000);
        assert_eq!(roots.snapshot(), vec![(0x2000, 32)]);
        roots.insert(0x3000, 16);
        // The tombstoned slot is reused, not appended.
        assert_eq!(roots.entries.len(), 2);
        assert_eq!(roots.snapshot(), vec![(0x3000, 16), (0x2000, 32)]);
    }

    #[test]
    fn erase_of_unknown_address_is_a_no_op() {
        let mut roots = RootAreas::new();
        roots.insert(0x1000, 8);
        roots.erase(0xdead);
        assert_eq!(roots.snapshot(), vec![(0x1000, 8)]);
    }
}
