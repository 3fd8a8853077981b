//! The extensible bucket directory.
//!
//! Bucket heads are stored in up to [`TRUNK_COUNT`] separately allocated
//! slabs. The first slab holds `2^FIRST_SHIFT` slots; every further slab
//! doubles the total, so slab `i` holds `2^(FIRST_SHIFT + i - 1)` slots and
//! existing slabs are never resized or moved. A bucket index addresses a
//! slab by its highest set bit and a slot by the remaining bits; clearing
//! that highest bit also yields the bucket's parent, the bucket whose run
//! it subdivides.

use std::{
    ptr,
    sync::atomic::{AtomicPtr, Ordering},
};

use super::entry::Entry;

/// log2 of the initial bucket count.
pub(crate) const FIRST_SHIFT: u32 = 4;

/// Number of directory slabs, capping the table at 2^31 buckets.
pub(crate) const TRUNK_COUNT: usize = 28;

/// Largest publishable `bucket_shift`.
pub(crate) const MAX_SHIFT: u32 = FIRST_SHIFT + TRUNK_COUNT as u32 - 1;

/// Directory of bucket-head slots. A null slot means the bucket's dummy has
/// not been linked into the list yet.
pub(crate) struct Trunks<K, V> {
    slabs: [AtomicPtr<AtomicPtr<Entry<K, V>>>; TRUNK_COUNT],
}

impl<K, V> Trunks<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            slabs: std::array::from_fn(|_| AtomicPtr::new(ptr::null_mut())),
        }
    }

    /// Number of bucket slots in slab `index`.
    pub(crate) fn trunk_len(index: usize) -> usize {
        debug_assert!(index < TRUNK_COUNT);
        if index == 0 {
            1 << FIRST_SHIFT
        } else {
            1 << (FIRST_SHIFT as usize + index - 1)
        }
    }

    /// Splits a bucket index into `(slab, offset)`.
    pub(crate) fn locate(bucket: u64) -> (usize, usize) {
        if bucket < (1 << FIRST_SHIFT) {
            (0, bucket as usize)
        } else {
            let top = 63 - bucket.leading_zeros();
            (
                (top - FIRST_SHIFT + 1) as usize,
                (bucket & !(1u64 << top)) as usize,
            )
        }
    }

    /// Allocates and publishes slab `trunk`. Serialized by the caller (the
    /// directory growth lock, or construction).
    pub(crate) fn install_trunk(&self, trunk: usize) {
        debug_assert!(trunk < TRUNK_COUNT);
        debug_assert!(self.slabs[trunk].load(Ordering::Relaxed).is_null());
        let slab: Box<[AtomicPtr<Entry<K, V>>]> = (0..Self::trunk_len(trunk))
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        let raw = Box::into_raw(slab) as *mut AtomicPtr<Entry<K, V>>;
        self.slabs[trunk].store(raw, Ordering::Release);
    }

    /// The head slot for `bucket`. The owning slab must already be
    /// installed, which the shift publication order guarantees for every
    /// bucket index derived from a loaded shift.
    pub(crate) fn slot(&self, bucket: u64) -> &AtomicPtr<Entry<K, V>> {
        let (trunk, offset) = Self::locate(bucket);
        let slab = self.slabs[trunk].load(Ordering::Acquire);
        debug_assert!(!slab.is_null());
        debug_assert!(offset < Self::trunk_len(trunk));
        // Slabs are published before the shift that makes their buckets
        // addressable and live until the directory is dropped.
        unsafe { &*slab.add(offset) }
    }
}

impl<K, V> Drop for Trunks<K, V> {
    fn drop(&mut self) {
        for (i, slab) in self.slabs.iter().enumerate() {
            let p = slab.load(Ordering::Relaxed);
            if p.is_null() {
                continue;
            }
            // The entries the slots point into are freed by the map's own
            // `Drop`; only the slot arrays are owned here.
            unsafe {
                drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                    p,
                    Self::trunk_len(i),
                )));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_splits_on_the_highest_bit() {
        assert_eq!(Trunks::<u64, u64>::locate(0), (0, 0));
        assert_eq!(Trunks::<u64, u64>::locate(15), (0, 15));
        assert_eq!(Trunks::<u64, u64>::locate(16), (1, 0));
        assert_eq!(Trunks::<u64, u64>::locate(17), (1, 1));
        assert_eq!(Trunks::<u64, u64>::locate(31), (1, 15));
        assert_eq!(Trunks::<u64, u64>::locate(32), (2, 0));
        assert_eq!(Trunks::<u64, u64>::locate(63), (2, 31));
        assert_eq!(Trunks::<u64, u64>::locate(64), (3, 0));
        assert_eq!(Trunks::<u64, u64>::locate((1 << 31) - 1), (27, (1 << 30) - 1));
    }

    #[test]
    fn slabs_double_the_bucket_count() {
        let mut total = 0_usize;
        for i in 0..TRUNK_COUNT {
            total += Trunks::<u64, u64>::trunk_len(i);
            assert_eq!(total, 1 << (FIRST_SHIFT as usize + i));
        }
        assert_eq!(MAX_SHIFT, 31);
    }

    #[test]
    fn every_offset_fits_its_slab() {
        for bucket in (0..4096).chain([1 << 20, (1 << 31) - 1]) {
            let (trunk, offset) = Trunks::<u64, u64>::locate(bucket);
            assert!(trunk < TRUNK_COUNT, "bucket {bucket}");
            assert!(offset < Trunks::<u64, u64>::trunk_len(trunk), "bucket {bucket}");
        }
    }

    #[test]
    fn installed_slots_start_null_and_hold_stores() {
        let trunks = Trunks::<u64, u64>::new();
        trunks.install_trunk(0);
        trunks.install_trunk(1);
        assert!(trunks.slot(3).load(Ordering::Relaxed).is_null());
        assert!(trunks.slot(19).load(Ordering::Relaxed).is_null());

        let dummy = Box::into_raw(Entry::<u64, u64>::dummy(3));
        trunks.slot(3).store(dummy, Ordering::Release);
        assert_eq!(trunks.slot(3).load(Ordering::Acquire), dummy);
        // Slots do not own entries; reclaim manually.
        unsafe { drop(Box::from_raw(dummy)) };
    }
}
