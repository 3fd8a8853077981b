//! Deferred reclamation for lock-free data structures.
//!
//! Freeing a node the instant it is unlinked is unsound under concurrency:
//! another thread may have loaded a pointer to that node a moment earlier and
//! still be reading through it. This module defers the physical free until no
//! such reader can exist, using a version-based variant of hazard pointers.
//!
//! The scheme has three pieces:
//!
//! - A process-wide **retirement clock**, a monotonically increasing counter.
//!   Every logically deleted node is stamped with the clock value at the
//!   moment it is retired.
//! - A process-wide registry of [`HazardRecord`]s. Before a thread reads any
//!   shared pointer it publishes the current clock value into a record it
//!   owns (see [`HazardGuard`]). Publishing must happen *before* the first
//!   read: any node still linked when the read happens is, by construction,
//!   retired afterwards and therefore stamped no lower than the published
//!   version.
//! - Per-thread [retire lists](retire()). A scan frees a retired node once
//!   its stamp is below the minimum version over all active records, which
//!   means every reader either published too late to have seen the node at
//!   all, or published a version the node's stamp does not undercut.
//!
//! Records are recycled rather than freed, so a stale version left on a
//! released record can only be older than any later publication. An old
//! version lowers the minimum a scan computes, which delays frees but never
//! permits one; the scheme degrades toward leaking, not toward use-after-free.
//!
//! The only blocking behavior in the module is thread teardown: a thread's
//! retire list drains on exit, sleeping with bounded exponential backoff
//! until every stale guard elsewhere has been released.

pub(crate) mod hazard;
pub(crate) mod retire;

pub use hazard::{registry_len, HazardGuard, HazardRecord};
pub use retire::{flush, retire, retire_any};

/// The process-wide retirement clock.
pub(crate) mod clock {
    use std::sync::atomic::{AtomicU64, Ordering};

    use crossbeam_utils::CachePadded;

    static CLOCK: CachePadded<AtomicU64> = CachePadded::new(AtomicU64::new(1));

    /// The current clock value.
    pub(crate) fn now() -> u64 {
        CLOCK.load(Ordering::Acquire)
    }

    /// Advances the clock, returning its pre-increment value.
    ///
    /// `AcqRel` keeps the increments chained: a reader whose `now` observes
    /// tick `n` also observes everything sequenced before every tick up to
    /// `n`, which is what lets a freshly published version vouch for the
    /// unlinks that preceded older stamps.
    pub(crate) fn tick() -> u64 {
        CLOCK.fetch_add(1, Ordering::AcqRel)
    }
}

/// Tears down the process-wide hazard registry, freeing every record.
///
/// Intended for hosts that run leak detectors over process shutdown. Calling
/// it is never required for correctness; records are recycled, not leaked,
/// while the process runs.
///
/// # Safety
///
/// No thread may hold a [`HazardGuard`], create one concurrently, or run a
/// retire scan while this executes. In practice: join every thread that ever
/// touched a structure built on this module first.
pub unsafe fn shutdown() {
    hazard::HazardRecord::clear();
}

#[cfg(test)]
mod tests {
    use super::clock;

    #[test]
    fn clock_is_monotonic() {
        let a = clock::now();
        let b = clock::tick();
        let c = clock::now();
        assert!(a <= b);
        assert!(b < c);
    }

    #[test]
    fn tick_returns_the_pre_increment_value() {
        let before = clock::tick();
        let after = clock::tick();
        assert!(after > before);
    }
}
