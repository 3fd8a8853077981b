//! Thread-local lists of retired allocations.
//!
//! A retired allocation is logically dead (no new reader can reach it) but
//! possibly still referenced by threads that loaded a pointer to it before it
//! was unlinked. Each record carries a clock stamp taken at retirement; a
//! scan frees exactly the records whose stamp undercuts every active hazard
//! version. Lists are strictly thread-local, so retiring and scanning never
//! contend; only [`min_active_version`](super::hazard) reads shared state.

use std::{cell::RefCell, mem, thread, time::Duration};

use smallvec::SmallVec;

use super::{clock, hazard};

/// Scans are triggered once a list outgrows twice the registry size, with a
/// floor so small registries still amortize the scan cost.
const SCAN_THRESHOLD_FLOOR: usize = 64;

const INITIAL_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_secs(2);

/// A deferred free: a type-erased destructor, its argument, and the clock
/// value at retirement. Owned by exactly one thread's list, never shared.
struct RetireRecord {
    ptr: *mut (),
    drop_fn: unsafe fn(*mut ()),
    version: u64,
}

struct RetireList {
    records: Vec<RetireRecord>,
}

thread_local! {
    static RETIRE_LIST: RefCell<RetireList> = RefCell::new(RetireList {
        records: Vec::new(),
    });
}

/// Hands an allocation to the current thread's retire list.
///
/// The pointer must originate from `Box::into_raw`; the eventual free drops
/// the box.
///
/// # Safety
///
/// `ptr` must be a valid, exclusively owned `Box<T>` allocation that no new
/// reader can reach, and it must not be retired twice.
pub unsafe fn retire<T>(ptr: *mut T) {
    unsafe fn drop_box<T>(ptr: *mut ()) {
        drop(Box::from_raw(ptr.cast::<T>()));
    }
    retire_any(drop_box::<T>, ptr.cast());
}

/// Like [`retire`], with an arbitrary destructor instead of a `Box` drop.
///
/// # Safety
///
/// `ptr` must stay valid until `drop_fn(ptr)` runs, `drop_fn` must fully
/// release it, and the pair must be retired exactly once.
pub unsafe fn retire_any(drop_fn: unsafe fn(*mut ()), ptr: *mut ()) {
    let version = clock::tick();
    if RETIRE_LIST.try_with(|_| ()).is_err() {
        // This thread's list is already gone; we are inside its teardown.
        retire_fallback(drop_fn, ptr, version);
        return;
    }
    let should_scan = RETIRE_LIST.with(|list| {
        let mut list = list.borrow_mut();
        list.records.push(RetireRecord {
            ptr,
            drop_fn,
            version,
        });
        list.records.len() >= scan_threshold()
    });
    if should_scan {
        scan_current();
    }
}

/// Runs a scan over the calling thread's retire list, returning the number
/// of records still awaiting a safe free.
pub fn flush() -> usize {
    if RETIRE_LIST.try_with(|_| ()).is_err() {
        return 0;
    }
    scan_current();
    RETIRE_LIST.with(|list| list.borrow().records.len())
}

fn scan_threshold() -> usize {
    (hazard::registry_len() * 2).max(SCAN_THRESHOLD_FLOOR)
}

/// Scans the thread-local list. The records are taken out of the `RefCell`
/// before any destructor runs, so a destructor that itself retires (a freed
/// node dropping a payload that owns another lock-free structure) re-enters
/// cleanly instead of hitting a nested borrow.
fn scan_current() {
    let mut taken = RETIRE_LIST.with(|list| mem::take(&mut list.borrow_mut().records));
    if taken.is_empty() {
        return;
    }
    free_unprotected(&mut taken);
    if !taken.is_empty() {
        RETIRE_LIST.with(|list| list.borrow_mut().records.extend(taken));
    }
}

/// Frees every record whose stamp undercuts all active hazard versions;
/// survivors are kept in place.
fn free_unprotected(records: &mut Vec<RetireRecord>) {
    let min = hazard::min_active_version();
    let taken = mem::take(records);
    let mut survivors: SmallVec<[RetireRecord; 16]> = SmallVec::new();
    for rec in taken {
        if rec.version < min {
            // No active record predates this stamp, so no thread can still
            // hold a pointer into the allocation.
            unsafe { (rec.drop_fn)(rec.ptr) };
        } else {
            survivors.push(rec);
        }
    }
    records.extend(survivors);
}

/// Free path for retirements that happen after the thread-local list has
/// been torn down. Rare; waits out the stale guards synchronously.
fn retire_fallback(drop_fn: unsafe fn(*mut ()), ptr: *mut (), version: u64) {
    let mut backoff = INITIAL_BACKOFF;
    while hazard::min_active_version() <= version {
        thread::sleep(backoff);
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    unsafe { (drop_fn)(ptr) };
}

impl Drop for RetireList {
    /// Drains the list on thread exit. If another thread still holds a
    /// hazard version covering one of our records, sleep with bounded
    /// exponential backoff and rescan; the wait ends as soon as the last
    /// stale guard is released.
    fn drop(&mut self) {
        if self.records.is_empty() {
            return;
        }
        free_unprotected(&mut self.records);
        let mut backoff = INITIAL_BACKOFF;
        #[cfg(feature = "logging")]
        let mut warned = false;
        while !self.records.is_empty() {
            thread::sleep(backoff);
            if backoff < MAX_BACKOFF {
                backoff = (backoff * 2).min(MAX_BACKOFF);
            } else {
                #[cfg(feature = "logging")]
                if !warned {
                    warn_stalled(self.records.len());
                    warned = true;
                }
            }
            free_unprotected(&mut self.records);
        }
    }
}

#[cfg(feature = "logging")]
fn warn_stalled(pending: usize) {
    log::warn!(
        "a retire list has been draining at the backoff cap; \
         {pending} allocation(s) are still covered by published hazard versions"
    );
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use crate::reclaim::HazardGuard;

    use super::*;

    // Frees from parallel tests' guards can only be delayed, never forced,
    // so positive assertions loop until the free lands.
    fn eventually<F: FnMut() -> bool>(mut f: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn threshold_has_a_floor() {
        assert!(scan_threshold() >= SCAN_THRESHOLD_FLOOR);
    }

    #[test]
    fn flush_frees_unprotected_records() {
        static FREED: AtomicUsize = AtomicUsize::new(0);
        unsafe fn count_free(ptr: *mut ()) {
            drop(Box::from_raw(ptr.cast::<u64>()));
            FREED.fetch_add(1, Ordering::SeqCst);
        }

        let ptr = Box::into_raw(Box::new(7_u64));
        unsafe { retire_any(count_free, ptr.cast()) };
        assert!(eventually(|| {
            flush();
            FREED.load(Ordering::SeqCst) >= 1
        }));
    }

    #[test]
    fn a_held_guard_blocks_frees_behind_it() {
        static FREED: AtomicUsize = AtomicUsize::new(0);
        unsafe fn count_free(ptr: *mut ()) {
            drop(Box::from_raw(ptr.cast::<u64>()));
            FREED.fetch_add(1, Ordering::SeqCst);
        }

        let guard = HazardGuard::new();
        // Stamped after the guard's version, so the guard pins it.
        let ptr = Box::into_raw(Box::new(9_u64));
        unsafe { retire_any(count_free, ptr.cast()) };
        for _ in 0..10 {
            flush();
        }
        assert_eq!(FREED.load(Ordering::SeqCst), 0);

        drop(guard);
        assert!(eventually(|| {
            flush();
            FREED.load(Ordering::SeqCst) == 1
        }));
    }

    #[test]
    fn boxed_retire_drops_the_value() {
        static DROPS: AtomicUsize = AtomicUsize::new(0);
        struct Counted;
        impl Drop for Counted {
            fn drop(&mut self) {
                DROPS.fetch_add(1, Ordering::SeqCst);
            }
        }

        let ptr = Box::into_raw(Box::new(Counted));
        unsafe { retire(ptr) };
        assert!(eventually(|| {
            flush();
            DROPS.load(Ordering::SeqCst) == 1
        }));
    }
}
