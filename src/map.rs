//! A lock-free hash map built on a single split-ordered list.
//!
//! All entries, real and placeholder, live in one globally ordered linked
//! list. The order key is the bit-reversed hash: reversing puts the bits
//! that select a bucket at the *top* of the key, so the entries of bucket
//! `b` form one contiguous run, and the entries that will belong to bucket
//! `b + 2^k` after the directory doubles form a contiguous sub-run inside
//! it. Doubling the table therefore never moves an entry; it only drops a
//! new placeholder ("dummy") node into the middle of an existing run to
//! mark where the run splits. See [`SplitOrderedHashMap`] for the operation
//! contracts.

pub(crate) mod entry;
pub(crate) mod split;
pub(crate) mod trunks;

use std::collections::hash_map::RandomState;

/// Default hasher for [`SplitOrderedHashMap`].
pub type DefaultHashBuilder = RandomState;

pub use split::SplitOrderedHashMap;
