//! Structured tracing support.
//!
//! With the `tracing` feature enabled, each collection gets a span
//! carrying a stable id, and each phase a nested span.

#[cfg(feature = "tracing")]
pub(crate) mod internal {
    use std::sync::atomic::{AtomicU64, Ordering};

    use tracing::{span, Level};

    /// Collection phases.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum GcPhase {
        /// Close the current page, zero the live map, flip `next_space`.
        Setup,
        /// Conservative root scan and in-place page promotion.
        Promote,
        /// Stable-queue walk copying live FromSpace objects.
        Compact,
        /// Epoch advance and generational/expansion policy.
        Advance,
    }

    static NEXT_GC_ID: AtomicU64 = AtomicU64::new(1);

    /// Identifier correlating all events of one collection.
    pub fn next_gc_id() -> u64 {
        NEXT_GC_ID.fetch_add(1, Ordering::Relaxed)
    }

    /// Span covering a whole collection.
    pub fn collection_span(kind: &str, gc_id: u64) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_collect", kind = kind, gc_id = gc_id).entered()
    }

    /// Span covering one phase.
    pub fn phase_span(phase: GcPhase) -> span::EnteredSpan {
        span!(Level::DEBUG, "gc_phase", phase = ?phase).entered()
    }
}

#[cfg(not(feature = "tracing"))]
pub(crate) mod internal {
    pub fn next_gc_id() -> u64 {
        0
    }
}
