//! Collector configuration.
//!
//! A [`Config`] may be applied programmatically any number of times before
//! the heap is created. When several configurations are applied, the one
//! with the largest `max_heap` controls the sizing options, while `flags`
//! and `verbose` are OR-combined. Environment variables (the option name
//! upper-cased and prefixed with `MGC_`) override programmatic settings at
//! heap-creation time.

use std::cell::RefCell;

use crate::pages::PAGE_BYTES;

/// Feature flags (`Config::flags`).
pub mod flags {
    /// Treat the untraced system heap as a source of ambiguous roots.
    pub const HEAPROOTS: u32 = 1;
    /// Extensively verify objects and headers during collection.
    pub const TSTOBJ: u32 = 2;
}

/// Verbosity bits (`Config::verbose`).
pub mod verbose {
    /// Log collection statistics.
    pub const STATS: u32 = 1;
    /// Log roots found in registers, stack and static areas.
    pub const ROOTLOG: u32 = 2;
    /// Log possible roots found in the untraced heap.
    pub const HEAPLOG: u32 = 4;
    /// Log events internal to the collector.
    pub const DEBUGLOG: u32 = 8;
}

const DEFAULT_MIN_HEAP: usize = 131_072;
const DEFAULT_MAX_HEAP: usize = 0x7FFF_FFFF;
const DEFAULT_INC_HEAP: usize = 1_048_576;
const DEFAULT_GENERATIONAL: u32 = 35;
const DEFAULT_INC_PERCENT: u32 = 25;
const DEFAULT_GC_THRESHOLD: usize = 6_000_000;

/// Collector configuration record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Initial heap size in bytes.
    pub min_heap: usize,
    /// Cap on total heap size in bytes.
    pub max_heap: usize,
    /// Expansion increment in bytes.
    pub inc_heap: usize,
    /// Percent allocated after a partial collection that forces a total
    /// collection (0–50; 0 disables generational behavior).
    pub generational: u32,
    /// Percent allocated after a total collection that forces expansion
    /// (0–50).
    pub inc_percent: u32,
    /// Heap size beyond which the mark-and-sweep companion heap collects.
    pub gc_threshold: usize,
    /// Feature flags, see [`flags`].
    pub flags: u32,
    /// Verbosity bits, see [`verbose`].
    pub verbose: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

impl Config {
    /// The default configuration.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            min_heap: DEFAULT_MIN_HEAP,
            max_heap: DEFAULT_MAX_HEAP,
            inc_heap: DEFAULT_INC_HEAP,
            generational: DEFAULT_GENERATIONAL,
            inc_percent: DEFAULT_INC_PERCENT,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            flags: 0,
            verbose: 0,
        }
    }

    /// Set the initial heap size in bytes.
    #[must_use]
    pub const fn min_heap(mut self, bytes: usize) -> Self {
        self.min_heap = bytes;
        self
    }

    /// Set the maximum heap size in bytes.
    #[must_use]
    pub const fn max_heap(mut self, bytes: usize) -> Self {
        self.max_heap = bytes;
        self
    }

    /// Set the expansion increment in bytes.
    #[must_use]
    pub const fn inc_heap(mut self, bytes: usize) -> Self {
        self.inc_heap = bytes;
        self
    }

    /// Set the total-collection threshold percentage.
    #[must_use]
    pub const fn generational(mut self, percent: u32) -> Self {
        self.generational = percent;
        self
    }

    /// Set the expansion threshold percentage.
    #[must_use]
    pub const fn inc_percent(mut self, percent: u32) -> Self {
        self.inc_percent = percent;
        self
    }

    /// Set the companion-heap collection threshold in bytes.
    #[must_use]
    pub const fn gc_threshold(mut self, bytes: usize) -> Self {
        self.gc_threshold = bytes;
        self
    }

    /// OR the given feature flags in.
    #[must_use]
    pub const fn flags(mut self, flags: u32) -> Self {
        self.flags |= flags;
        self
    }

    /// OR the given verbosity bits in.
    #[must_use]
    pub const fn verbose(mut self, verbose: u32) -> Self {
        self.verbose |= verbose;
        self
    }

    fn clamp(&mut self) {
        self.min_heap = self.min_heap.max(4 * PAGE_BYTES);
        self.max_heap = self.max_heap.max(self.min_heap);
        if self.generational > 50 {
            self.generational = DEFAULT_GENERATIONAL;
        }
        if self.inc_percent > 50 {
            self.inc_percent = DEFAULT_INC_PERCENT;
        }
    }
}

struct Pending {
    cfg: Config,
    defaults: bool,
    created: bool,
}

thread_local! {
    static PENDING: RefCell<Pending> = const {
        RefCell::new(Pending { cfg: Config::new(), defaults: true, created: false })
    };
}

/// Apply a configuration.
///
/// Settings applied after the heap has been created are ignored, as are
/// configurations whose `max_heap` is smaller than an already applied one;
/// `flags` and `verbose` accumulate either way.
pub fn configure(new: Config) {
    PENDING.with(|p| {
        let mut p = p.borrow_mut();
        if !p.created && new.min_heap > 0 && (p.defaults || new.max_heap >= p.cfg.max_heap) {
            p.defaults = false;
            let flags = p.cfg.flags;
            let verbose = p.cfg.verbose;
            p.cfg = new;
            p.cfg.clamp();
            p.cfg.flags |= flags;
            p.cfg.verbose |= verbose;
        } else {
            p.cfg.flags |= new.flags;
            p.cfg.verbose |= new.verbose;
            p.cfg.gc_threshold = new.gc_threshold;
        }
    });
}

fn env_value(name: &str) -> Option<usize> {
    std::env::var(name).ok()?.trim().parse().ok()
}

/// Resolve the effective configuration, consulting the environment.
/// Called once, when the heap is created.
pub(crate) fn take_effective() -> Config {
    PENDING.with(|p| {
        let mut p = p.borrow_mut();
        p.created = true;
        let cfg = &mut p.cfg;
        let mut from_env = false;
        let mut u32_from_env = |name: &str, slot: &mut u32| {
            if let Some(v) = env_value(name) {
                *slot = u32::try_from(v).unwrap_or(u32::MAX);
                from_env = true;
            }
        };
        u32_from_env("MGC_GENERATIONAL", &mut cfg.generational);
        u32_from_env("MGC_INC_PERCENT", &mut cfg.inc_percent);
        u32_from_env("MGC_FLAGS", &mut cfg.flags);
        u32_from_env("MGC_VERBOSE", &mut cfg.verbose);
        for (name, slot) in [
            ("MGC_MIN_HEAP", &mut cfg.min_heap),
            ("MGC_MAX_HEAP", &mut cfg.max_heap),
            ("MGC_INC_HEAP", &mut cfg.inc_heap),
            ("MGC_GC_THRESHOLD", &mut cfg.gc_threshold),
        ] {
            if let Some(v) = env_value(name) {
                *slot = v;
                from_env = true;
            }
        }
        cfg.clamp();
        if from_env || cfg.verbose != 0 {
            eprintln!(
                "***** mgc({}, {}, {}, {}, {}, {}, {:#x}, {:#x})",
                cfg.min_heap,
                cfg.max_heap,
                cfg.inc_heap,
                cfg.generational,
                cfg.inc_percent,
                cfg.gc_threshold,
                cfg.flags,
                cfg.verbose,
            );
        }
        *cfg
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = Config::new();
        assert_eq!(cfg.min_heap, 131_072);
        assert_eq!(cfg.max_heap, 0x7FFF_FFFF);
        assert_eq!(cfg.inc_heap, 1_048_576);
        assert_eq!(cfg.generational, 35);
        assert_eq!(cfg.inc_percent, 25);
        assert_eq!(cfg.gc_threshold, 6_000_000);
    }

    #[test]
    fn largest_max_heap_wins() {
        // Each test thread gets its own pending configuration, so the
        // merge precedence can be exercised end to end.
        configure(
            Config::new()
                .min_heap(1 << 20)
                .max_heap(8 << 20)
                .flags(flags::HEAPROOTS),
        );
        // Smaller max_heap: sizing ignored, flags still accumulate.
        configure(
            Config::new()
                .min_heap(1 << 21)
                .max_heap(4 << 20)
                .flags(flags::TSTOBJ),
        );
        let cfg = take_effective();
        assert_eq!(cfg.min_heap, 1 << 20);
        assert_eq!(cfg.max_heap, 8 << 20);
        assert_eq!(cfg.flags, flags::HEAPROOTS | flags::TSTOBJ);
    }

    #[test]
    fn out_of_range_percentages_fall_back() {
        let mut cfg = Config::new().generational(80).inc_percent(99);
        cfg.clamp();
        assert_eq!(cfg.generational, DEFAULT_GENERATIONAL);
        assert_eq!(cfg.inc_percent, DEFAULT_INC_PERCENT);
    }

    #[test]
    fn min_heap_is_at_least_four_pages() {
        let mut cfg = Config::new().min_heap(1);
        cfg.clamp();
        assert_eq!(cfg.min_heap, 4 * PAGE_BYTES);
        assert!(cfg.max_heap >= cfg.min_heap);
    }
}
