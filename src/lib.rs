#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! Hazel provides lock-free building blocks for concurrent programs, and a
//! hash map built out of them:
//!
//! - [`stamped`]: a pointer packed with a modification stamp into one
//!   atomic word, so compare-and-swap can tell a recycled address apart
//!   from an untouched one.
//! - [`reclaim`]: version-based safe memory reclamation. Readers publish a
//!   logical timestamp in a process-wide registry; detached nodes are freed
//!   only once every published timestamp has moved past their retirement.
//! - [`map`]: a [`SplitOrderedHashMap`], a hash map over a single
//!   bit-reversed ordered list whose bucket directory doubles in place.
//!   Entries never move when the map grows, and no operation takes a lock.
//!
//! All map operations are safe to call from any number of threads through a
//! shared reference:
//!
//! ```
//! use hazel::SplitOrderedHashMap;
//!
//! let map = SplitOrderedHashMap::new();
//!
//! assert!(map.insert("apple", 3));
//! assert!(map.insert("pear", 5));
//! // `insert` never overwrites.
//! assert!(!map.insert("apple", 7));
//!
//! assert_eq!(map.get(&"apple"), Some(3));
//! assert_eq!(map.remove(&"pear"), Some(5));
//! assert_eq!(map.len(), 1);
//! ```
//!
//! # Feature flags
//!
//! - `logging`: emits [`log`](https://crates.io/crates/log) records for
//!   events worth observing in production, such as a thread exiting while
//!   readers still pin its retired memory. Disabled by default.
//!
//! # Minimum Supported Rust Version
//!
//! This crate's minimum supported Rust version (MSRV) is 1.65.

pub mod map;
pub mod reclaim;
pub mod stamped;

pub use map::{DefaultHashBuilder, SplitOrderedHashMap};

#[cfg(test)]
pub(crate) mod test_util;
