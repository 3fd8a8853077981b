//! Pointers paired with a generation stamp, packed into one atomic word.
//!
//! A compare-and-swap on a bare pointer cannot tell "nothing changed" apart
//! from "the location changed away and back". When the second case involves
//! freeing the pointed-to allocation and reusing its address for an unrelated
//! node, a stale CAS succeeds against a value it has never examined (the ABA
//! problem). [`StampedPtr`] widens every link into a `(pointer, stamp)` pair
//! and [`AtomicStampedPtr`] swaps both halves as a single unit, so a reader
//! that loaded `(p, s)` can only CAS against a location that still holds
//! exactly `(p, s)`.
//!
//! The pair is packed into a single `u64`: the low 48 bits hold the address,
//! the high 16 bits hold the stamp. 48 bits cover the canonical user-space
//! range on x86_64 and aarch64; debug builds assert that addresses fit.
//! Callers that reserve a stamp bit for their own bookkeeping (the map keeps
//! the low stamp bit as a deletion flag) advance stamps in steps of two.

use std::{
    fmt,
    marker::PhantomData,
    sync::atomic::{AtomicU64, Ordering},
};

const STAMP_BITS: u32 = 16;
const ADDR_BITS: u32 = u64::BITS - STAMP_BITS;
const ADDR_MASK: u64 = (1 << ADDR_BITS) - 1;

/// A raw pointer and a 16-bit generation stamp, packed into one `u64`.
///
/// `StampedPtr` is a plain value: loading, storing, and comparing it never
/// touches the pointed-to memory. Dereferencing the contained pointer is the
/// caller's responsibility, exactly as with `*mut T`.
pub struct StampedPtr<T> {
    packed: u64,
    marker: PhantomData<*mut T>,
}

impl<T> StampedPtr<T> {
    /// Packs `ptr` and `stamp` into a single word.
    ///
    /// Debug builds panic if the address does not fit the 48-bit field.
    pub fn new(ptr: *mut T, stamp: u16) -> Self {
        let addr = ptr as usize as u64;
        debug_assert_eq!(addr & !ADDR_MASK, 0, "address exceeds the packable range");
        Self::from_packed((u64::from(stamp) << ADDR_BITS) | (addr & ADDR_MASK))
    }

    /// The null pointer with stamp zero.
    pub const fn null() -> Self {
        Self::from_packed(0)
    }

    pub fn ptr(self) -> *mut T {
        (self.packed & ADDR_MASK) as usize as *mut T
    }

    pub fn is_null(self) -> bool {
        self.packed & ADDR_MASK == 0
    }

    pub fn stamp(self) -> u16 {
        (self.packed >> ADDR_BITS) as u16
    }

    /// The same pointer carrying a different stamp.
    pub fn with_stamp(self, stamp: u16) -> Self {
        Self::from_packed((self.packed & ADDR_MASK) | (u64::from(stamp) << ADDR_BITS))
    }

    const fn from_packed(packed: u64) -> Self {
        Self {
            packed,
            marker: PhantomData,
        }
    }
}

impl<T> Clone for StampedPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StampedPtr<T> {}

impl<T> PartialEq for StampedPtr<T> {
    fn eq(&self, other: &Self) -> bool {
        self.packed == other.packed
    }
}

impl<T> Eq for StampedPtr<T> {}

impl<T> fmt::Debug for StampedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StampedPtr")
            .field("ptr", &self.ptr())
            .field("stamp", &self.stamp())
            .finish()
    }
}

/// An atomic cell holding a [`StampedPtr`].
///
/// All operations act on the packed word, so the pointer and the stamp are
/// always observed and updated together. A `compare_exchange` whose expected
/// value carries a stale stamp fails even when the address matches, which is
/// what defeats ABA after an address is freed and reused.
pub struct AtomicStampedPtr<T> {
    cell: AtomicU64,
    marker: PhantomData<*mut T>,
}

// Like `AtomicPtr`, the cell itself only stores an address; dereferencing
// whatever it points to is the caller's unsafe responsibility.
unsafe impl<T> Send for AtomicStampedPtr<T> {}
unsafe impl<T> Sync for AtomicStampedPtr<T> {}

impl<T> AtomicStampedPtr<T> {
    pub fn new(ptr: StampedPtr<T>) -> Self {
        Self {
            cell: AtomicU64::new(ptr.packed),
            marker: PhantomData,
        }
    }

    /// A cell holding the null pointer with stamp zero.
    pub const fn null() -> Self {
        Self {
            cell: AtomicU64::new(0),
            marker: PhantomData,
        }
    }

    pub fn load(&self, order: Ordering) -> StampedPtr<T> {
        StampedPtr::from_packed(self.cell.load(order))
    }

    pub fn store(&self, ptr: StampedPtr<T>, order: Ordering) {
        self.cell.store(ptr.packed, order);
    }

    /// Stores `new` only if the cell still holds `current`, pointer and stamp
    /// both. On failure the observed value is returned for the caller's retry.
    pub fn compare_exchange(
        &self,
        current: StampedPtr<T>,
        new: StampedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<StampedPtr<T>, StampedPtr<T>> {
        match self
            .cell
            .compare_exchange(current.packed, new.packed, success, failure)
        {
            Ok(prev) => Ok(StampedPtr::from_packed(prev)),
            Err(prev) => Err(StampedPtr::from_packed(prev)),
        }
    }

    /// The weak variant of [`compare_exchange`](Self::compare_exchange); may
    /// fail spuriously, for use inside retry loops.
    pub fn compare_exchange_weak(
        &self,
        current: StampedPtr<T>,
        new: StampedPtr<T>,
        success: Ordering,
        failure: Ordering,
    ) -> Result<StampedPtr<T>, StampedPtr<T>> {
        match self
            .cell
            .compare_exchange_weak(current.packed, new.packed, success, failure)
        {
            Ok(prev) => Ok(StampedPtr::from_packed(prev)),
            Err(prev) => Err(StampedPtr::from_packed(prev)),
        }
    }
}

impl<T> Default for AtomicStampedPtr<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T> fmt::Debug for AtomicStampedPtr<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(Ordering::Relaxed), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_and_unpacks() {
        let raw = Box::into_raw(Box::new(42_u64));
        let ptr = StampedPtr::new(raw, 7);
        assert_eq!(ptr.ptr(), raw);
        assert_eq!(ptr.stamp(), 7);
        assert!(!ptr.is_null());
        unsafe { drop(Box::from_raw(raw)) };
    }

    #[test]
    fn null_has_no_address_and_no_stamp() {
        let ptr = StampedPtr::<u64>::null();
        assert!(ptr.is_null());
        assert!(ptr.ptr().is_null());
        assert_eq!(ptr.stamp(), 0);
    }

    #[test]
    fn with_stamp_keeps_the_pointer() {
        let raw = Box::into_raw(Box::new(5_u32));
        let ptr = StampedPtr::new(raw, 3);
        let restamped = ptr.with_stamp(u16::MAX);
        assert_eq!(restamped.ptr(), raw);
        assert_eq!(restamped.stamp(), u16::MAX);
        assert_ne!(ptr, restamped);
        unsafe { drop(Box::from_raw(raw)) };
    }

    #[test]
    fn a_null_with_a_stamp_is_still_null() {
        let ptr = StampedPtr::<u64>::null().with_stamp(9);
        assert!(ptr.is_null());
        assert_eq!(ptr.stamp(), 9);
    }

    #[test]
    fn cas_requires_both_halves_to_match() {
        let a = Box::into_raw(Box::new(1_u64));
        let b = Box::into_raw(Box::new(2_u64));
        let cell = AtomicStampedPtr::new(StampedPtr::new(a, 0));

        // Right pointer, wrong stamp.
        let stale = StampedPtr::new(a, 2);
        let observed = cell
            .compare_exchange(
                stale,
                StampedPtr::new(b, 4),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .unwrap_err();
        assert_eq!(observed, StampedPtr::new(a, 0));

        // Exact match succeeds and the new value is visible.
        cell.compare_exchange(
            StampedPtr::new(a, 0),
            StampedPtr::new(b, 2),
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .unwrap();
        assert_eq!(cell.load(Ordering::Acquire), StampedPtr::new(b, 2));

        unsafe {
            drop(Box::from_raw(a));
            drop(Box::from_raw(b));
        }
    }

    #[test]
    fn weak_cas_retries_through_spurious_failures() {
        let raw = Box::into_raw(Box::new(3_u64));
        let cell = AtomicStampedPtr::<u64>::null();

        // The weak variant may fail even when the cell matches, so it only
        // makes sense driven by a loop that reloads the observed value.
        let mut current = cell.load(Ordering::Acquire);
        loop {
            let next = StampedPtr::new(raw, current.stamp().wrapping_add(2));
            match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        assert_eq!(cell.load(Ordering::Acquire), StampedPtr::new(raw, 2));

        // A mismatched expectation still fails outright, weak or not.
        assert!(cell
            .compare_exchange_weak(
                StampedPtr::new(raw, 4),
                StampedPtr::null(),
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err());

        unsafe { drop(Box::from_raw(raw)) };
    }

    #[test]
    fn stamps_wrap_without_disturbing_the_pointer() {
        let raw = Box::into_raw(Box::new(0_u8));
        let ptr = StampedPtr::new(raw, u16::MAX - 1);
        let bumped = ptr.with_stamp(ptr.stamp().wrapping_add(2));
        assert_eq!(bumped.stamp(), 0);
        assert_eq!(bumped.ptr(), raw);
        unsafe { drop(Box::from_raw(raw)) };
    }
}
