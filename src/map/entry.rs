//! List nodes and split-order keys.

use crate::stamped::AtomicStampedPtr;

/// Low bit of a link stamp. Set on a node's *own* `next` once the node is
/// logically deleted; the node must not be mutated afterwards, except to be
/// unlinked by whoever wins the predecessor CAS.
pub(crate) const RETIRED: u16 = 0b1;

/// Stamp increment for link updates. Two, not one, so an update never
/// disturbs the [`RETIRED`] bit while still making every write distinct to
/// a racing reader.
pub(crate) const STAMP_STEP: u16 = 0b10;

/// One node of the global list.
///
/// Dummies head buckets, carry no payload, and are never removed before the
/// map itself is dropped. Data entries carry the key/value pair. Both sort
/// by `so_key`; dummy keys are even and data keys odd, so a dummy always
/// precedes the data entries of its bucket and equal `so_key` values can
/// only collide data-with-data.
pub(crate) struct Entry<K, V> {
    pub(crate) so_key: u64,
    pub(crate) next: AtomicStampedPtr<Entry<K, V>>,
    pub(crate) kind: EntryKind<K, V>,
}

pub(crate) enum EntryKind<K, V> {
    Dummy,
    Data { key: K, value: V },
}

impl<K, V> Entry<K, V> {
    pub(crate) fn dummy(bucket: u64) -> Box<Self> {
        Box::new(Self {
            so_key: dummy_key(bucket),
            next: AtomicStampedPtr::null(),
            kind: EntryKind::Dummy,
        })
    }

    pub(crate) fn data(so_key: u64, key: K, value: V) -> Box<Self> {
        debug_assert_eq!(so_key & 1, 1);
        Box::new(Self {
            so_key,
            next: AtomicStampedPtr::null(),
            kind: EntryKind::Data { key, value },
        })
    }

    pub(crate) fn is_dummy(&self) -> bool {
        matches!(self.kind, EntryKind::Dummy)
    }

    pub(crate) fn key(&self) -> Option<&K> {
        match &self.kind {
            EntryKind::Data { key, .. } => Some(key),
            EntryKind::Dummy => None,
        }
    }

    pub(crate) fn value(&self) -> Option<&V> {
        match &self.kind {
            EntryKind::Data { value, .. } => Some(value),
            EntryKind::Dummy => None,
        }
    }
}

/// Split-order key of a data entry: the bit-reversed hash with the low bit
/// forced on.
pub(crate) fn data_key(hash: u64) -> u64 {
    hash.reverse_bits() | 1
}

/// Split-order key of the dummy heading `bucket`. Bucket indices stay well
/// below 2^63, so the reversed value always has a zero low bit.
pub(crate) fn dummy_key(bucket: u64) -> u64 {
    bucket.reverse_bits()
}
