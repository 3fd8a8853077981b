//! The process-wide registry of hazard records.
//!
//! Records form one global singly-linked list, prepended to on allocation and
//! never unlinked. A record is either active (owned by exactly one guard) or
//! inactive (claimable by anyone). `acquire` prefers recycling an inactive
//! record over allocating, so the registry's length converges on the peak
//! number of simultaneously live guards.

use std::{
    marker::PhantomData,
    ptr,
    sync::atomic::{self, AtomicBool, AtomicPtr, AtomicU64, AtomicUsize, Ordering},
};

use crossbeam_utils::{Backoff, CachePadded};

use super::clock;

static HEAD: CachePadded<AtomicPtr<HazardRecord>> =
    CachePadded::new(AtomicPtr::new(ptr::null_mut()));
static LEN: AtomicUsize = AtomicUsize::new(0);

/// One slot in the registry: a published version and an ownership flag.
pub struct HazardRecord {
    version: AtomicU64,
    active: AtomicBool,
    next: *const HazardRecord,
}

// `next` is written only between allocation and the prepend that publishes
// the record; afterwards it is immutable, and records are shared across
// threads for the life of the process.
unsafe impl Send for HazardRecord {}
unsafe impl Sync for HazardRecord {}

impl HazardRecord {
    /// Claims a record, recycling an inactive one when possible, and
    /// publishes the current clock value into it.
    pub fn acquire() -> &'static HazardRecord {
        let mut p: *const HazardRecord = HEAD.load(Ordering::Acquire);
        while !p.is_null() {
            // Records are never freed while the registry is live, so the
            // reference cannot dangle.
            let rec = unsafe { &*p };
            if !rec.active.load(Ordering::Relaxed)
                && rec
                    .active
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
            {
                rec.publish();
                return rec;
            }
            p = rec.next;
        }
        Self::acquire_slow()
    }

    /// Allocates a fresh record and prepends it to the registry.
    fn acquire_slow() -> &'static HazardRecord {
        let raw = Box::into_raw(Box::new(HazardRecord {
            version: AtomicU64::new(0),
            active: AtomicBool::new(true),
            next: ptr::null(),
        }));
        let backoff = Backoff::new();
        let mut head = HEAD.load(Ordering::Relaxed);
        loop {
            // Still unshared; plain writes to `next` are fine until the CAS
            // below succeeds.
            unsafe { (*raw).next = head };
            match HEAD.compare_exchange_weak(head, raw, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(observed) => {
                    head = observed;
                    backoff.spin();
                }
            }
        }
        LEN.fetch_add(1, Ordering::Relaxed);
        let rec = unsafe { &*raw };
        rec.publish();
        rec
    }

    /// Stores the current clock value and fences.
    ///
    /// The fence pairs with the one at the top of [`min_active_version`]:
    /// whichever fence comes first in the total order, either the scan sees
    /// this publication, or the publishing thread's subsequent pointer loads
    /// see every unlink that preceded the scan.
    fn publish(&self) {
        self.version.store(clock::now(), Ordering::Release);
        atomic::fence(Ordering::SeqCst);
    }

    /// Re-reads the clock and republishes it, keeping ownership of the
    /// record. Call before restarting a traversal so reclamation is not held
    /// back by a version published at the start of a long retry loop.
    pub fn reacquire(&self) {
        debug_assert!(self.active.load(Ordering::Relaxed));
        self.publish();
    }

    /// Returns the record to the registry.
    ///
    /// This must be the owner's last access: a recycler inspects nothing but
    /// `active`, so any later write to the record races with its next owner.
    pub fn release(&self) {
        debug_assert!(self.active.load(Ordering::Relaxed));
        self.active.store(false, Ordering::Release);
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    /// Frees every record in the registry.
    ///
    /// # Safety
    ///
    /// Callers must guarantee exclusive access to the registry: no live
    /// guard, no concurrent `acquire`, and no retire scan anywhere in the
    /// process. See [`crate::reclaim::shutdown`].
    pub unsafe fn clear() {
        let mut p: *const HazardRecord = HEAD.swap(ptr::null_mut(), Ordering::AcqRel);
        LEN.store(0, Ordering::Relaxed);
        while !p.is_null() {
            let rec = Box::from_raw(p as *mut HazardRecord);
            debug_assert!(!rec.active.load(Ordering::Relaxed));
            p = rec.next;
        }
    }
}

/// The smallest version published by any active record, or `u64::MAX` when
/// none is active. Retired allocations stamped below this value cannot be
/// observed by any guard.
pub(crate) fn min_active_version() -> u64 {
    // Pairs with the fence in `HazardRecord::publish`; see there.
    atomic::fence(Ordering::SeqCst);
    let mut min = u64::MAX;
    let mut p: *const HazardRecord = HEAD.load(Ordering::Acquire);
    while !p.is_null() {
        let rec = unsafe { &*p };
        if rec.active.load(Ordering::Acquire) {
            // A racing release/re-acquire can only leave an older version
            // here, which lowers the minimum: frees get delayed, never
            // permitted early.
            min = min.min(rec.version.load(Ordering::Acquire));
        }
        p = rec.next;
    }
    min
}

/// The number of records in the registry, active or not. Grows to the peak
/// guard concurrency seen so far and stays there; useful as a diagnostic and
/// as a sizing input for scan thresholds.
pub fn registry_len() -> usize {
    LEN.load(Ordering::Relaxed)
}

/// Scope-bound ownership of one [`HazardRecord`].
///
/// Creating a guard publishes the current retirement clock; dropping it
/// releases the record. While the guard is held, any node that was still
/// linked when this thread read a pointer to it is kept allocated.
///
/// The protection protocol is publish-then-read: the guard (or a
/// [`reacquire`](Self::reacquire)) must exist *before* the pointer loads it
/// is meant to cover. Reads made before publishing are not protected.
pub struct HazardGuard {
    record: &'static HazardRecord,
    // Version protection covers reads made by the publishing thread; keep
    // the guard where it was created.
    _not_send: PhantomData<*mut ()>,
}

impl HazardGuard {
    pub fn new() -> Self {
        Self {
            record: HazardRecord::acquire(),
            _not_send: PhantomData,
        }
    }

    /// Republishes a fresh version, e.g. before restarting a traversal.
    pub fn reacquire(&self) {
        self.record.reacquire();
    }

    /// The version this guard last published.
    pub fn version(&self) -> u64 {
        self.record.version()
    }
}

impl Default for HazardGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for HazardGuard {
    fn drop(&mut self) {
        self.record.release();
    }
}

#[cfg(test)]
mod tests {
    use super::super::clock;
    use super::*;

    #[test]
    fn acquire_publishes_a_covering_version() {
        let guard = HazardGuard::new();
        assert!(guard.version() > 0);
        assert!(guard.version() <= clock::now());
        // An active guard always bounds the scan minimum.
        assert!(min_active_version() <= guard.version());
    }

    #[test]
    fn reacquire_advances_past_newer_ticks() {
        let guard = HazardGuard::new();
        let before = guard.version();
        clock::tick();
        guard.reacquire();
        assert!(guard.version() > before);
    }

    #[test]
    fn concurrent_guards_need_distinct_records() {
        let _a = HazardGuard::new();
        let _b = HazardGuard::new();
        let _c = HazardGuard::new();
        assert!(registry_len() >= 3);
    }

    #[test]
    fn registry_never_shrinks_outside_teardown() {
        let before = registry_len();
        for _ in 0..16 {
            let _guard = HazardGuard::new();
        }
        assert!(registry_len() >= before);
    }
}
