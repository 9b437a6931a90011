//! Collection statistics.

use std::cell::Cell;
use std::time::Duration;

/// What kind of collection ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CollectKind {
    /// No collection has run yet.
    #[default]
    None,
    /// Partial collection: the stable set was traced but not evacuated.
    Partial,
    /// Full collection: the stable set had been merged back into
    /// FromSpace, so everything was considered for copying.
    Full,
}

/// Statistics from the most recent collection of the default heap.
#[derive(Debug, Clone, Copy, Default)]
pub struct CollectStats {
    /// Kind of the collection.
    pub kind: CollectKind,
    /// Pages promoted in place from ambiguous roots.
    pub pages_promoted: usize,
    /// Objects copied from FromSpace to StableSpace.
    pub objects_moved: usize,
    /// Percent of the heap allocated when the collection began.
    pub percent_before: usize,
    /// Percent of the heap allocated when it finished.
    pub percent_after: usize,
    /// Percent of the heap held by the stable set when it finished.
    pub percent_stable: usize,
    /// Wall-clock duration.
    pub duration: Duration,
    /// Collections since this thread's heap was created.
    pub total_collections: usize,
}

thread_local! {
    static LAST: Cell<CollectStats> = const { Cell::new(CollectStats::new()) };
    static TOTAL: Cell<usize> = const { Cell::new(0) };
}

impl CollectStats {
    const fn new() -> Self {
        Self {
            kind: CollectKind::None,
            pages_promoted: 0,
            objects_moved: 0,
            percent_before: 0,
            percent_after: 0,
            percent_stable: 0,
            duration: Duration::from_secs(0),
            total_collections: 0,
        }
    }
}

/// Statistics from the most recent collection.
#[must_use]
pub fn last_collect_stats() -> CollectStats {
    LAST.with(Cell::get)
}

/// Record a finished collection.
pub(crate) fn record(mut stats: CollectStats) {
    TOTAL.with(|t| t.set(t.get() + 1));
    stats.total_collections = TOTAL.with(Cell::get);
    LAST.with(|l| l.set(stats));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_bumps_the_counter() {
        let before = last_collect_stats().total_collections;
        record(CollectStats {
            kind: CollectKind::Partial,
            pages_promoted: 3,
            ..CollectStats::new()
        });
        let after = last_collect_stats();
        assert_eq!(after.total_collections, before + 1);
        assert_eq!(after.pages_promoted, 3);
        assert_eq!(after.kind, CollectKind::Partial);
    }
}
