//! The split-ordered hash map.
//!
//! Each operation hashes its key, locates the bucket's dummy through the
//! trunk directory, and walks the global list from there under a hazard
//! guard. Mutations are single CASes on [`AtomicStampedPtr`] links:
//! insertion swings a predecessor link onto a fully initialized node, and
//! removal first sets the retired bit on the victim's own link (the
//! linearization point) and only then detaches it. Walks that encounter a
//! retired node detach it in passing; whichever CAS detaches a node also
//! hands it to the retire list, exactly once.
//!
//! Directory growth is triggered by load factor, serialized by a try-lock
//! so at most one grower runs while everyone else proceeds lock-free, and
//! publishes a new slab before the new shift. New buckets receive their
//! dummy lazily: the first operation to touch one links it into the parent
//! bucket's run with the ordinary insertion primitive, which is the only
//! structural change growth ever makes. Data nodes never move.

use std::{
    borrow::Borrow,
    hash::{BuildHasher, Hash, Hasher},
    marker::PhantomData,
    ptr,
    sync::atomic::{AtomicPtr, AtomicU32, AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;

use crate::{
    reclaim::{self, HazardGuard},
    stamped::{AtomicStampedPtr, StampedPtr},
};

use super::{
    entry::{self, Entry, EntryKind, RETIRED, STAMP_STEP},
    trunks::{Trunks, FIRST_SHIFT, MAX_SHIFT},
    DefaultHashBuilder,
};

/// Grow once `len * 4` reaches `buckets * 3`.
const LOAD_FACTOR_NUM: u64 = 3;
const LOAD_FACTOR_DEN: u64 = 4;

/// A lock-free hash map that grows without ever rehashing an entry.
///
/// Every operation is safe to call from any number of threads without
/// external synchronization, and none of them blocks: writers retry CASes
/// under contention, and the only lock in the structure serializes
/// concurrent directory growers against each other, never against readers
/// or writers.
///
/// `get` and `remove` hand values out by clone, so `V` is typically cheap
/// to clone or an `Arc`. [`get_and`](Self::get_and) borrows the live value
/// instead for callers that want to avoid that.
pub struct SplitOrderedHashMap<K, V, S = DefaultHashBuilder> {
    trunks: Trunks<K, V>,
    bucket_shift: AtomicU32,
    len: CachePadded<AtomicUsize>,
    growth_lock: Mutex<()>,
    build_hasher: S,
    marker: PhantomData<Box<Entry<K, V>>>,
}

// Entries are owned by the map but freed by whichever thread detaches them,
// and values are cloned out through `&self`, so `Sync` needs the payload
// types to be `Send` as well.
unsafe impl<K, V, S> Send for SplitOrderedHashMap<K, V, S>
where
    K: Send,
    V: Send,
    S: Send,
{
}
unsafe impl<K, V, S> Sync for SplitOrderedHashMap<K, V, S>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync,
{
}

/// Where a walk stopped: the link cell to CAS for a mutation and the value
/// it held. On a hit the link's pointer is the matched node; on a miss it
/// is the first node past the target position (or null at the tail).
struct Search<K, V> {
    prev: *const AtomicStampedPtr<Entry<K, V>>,
    prev_link: StampedPtr<Entry<K, V>>,
    found: bool,
}

impl<K, V> Search<K, V> {
    fn cur(&self) -> *mut Entry<K, V> {
        self.prev_link.ptr()
    }
}

impl<K, V> SplitOrderedHashMap<K, V, DefaultHashBuilder>
where
    K: Hash + Eq,
{
    /// Creates an empty map with the initial bucket directory.
    pub fn new() -> Self {
        Self::with_capacity_and_hasher(0, DefaultHashBuilder::default())
    }

    /// Creates an empty map whose directory is pre-sized so that `capacity`
    /// entries fit without triggering growth.
    pub fn with_capacity(capacity: usize) -> Self {
        Self::with_capacity_and_hasher(capacity, DefaultHashBuilder::default())
    }
}

impl<K, V, S> SplitOrderedHashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher,
{
    /// Creates an empty map that hashes keys with `build_hasher`.
    pub fn with_hasher(build_hasher: S) -> Self {
        Self::with_capacity_and_hasher(0, build_hasher)
    }

    /// Creates an empty map sized for `capacity` entries, hashing keys with
    /// `build_hasher`.
    pub fn with_capacity_and_hasher(capacity: usize, build_hasher: S) -> Self {
        let shift = shift_for_capacity(capacity);
        let trunks = Trunks::new();
        for trunk in 0..=(shift - FIRST_SHIFT) as usize {
            trunks.install_trunk(trunk);
        }
        // Bucket zero heads the global list and is always present.
        let root = Box::into_raw(Entry::dummy(0));
        trunks.slot(0).store(root, Ordering::Release);
        Self {
            trunks,
            bucket_shift: AtomicU32::new(shift),
            len: CachePadded::new(AtomicUsize::new(0)),
            growth_lock: Mutex::new(()),
            build_hasher,
            marker: PhantomData,
        }
    }

    /// Returns a clone of the value `key` maps to.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.get_and(key, |value| value.clone())
    }

    /// Applies `with_value` to the live value `key` maps to, while the
    /// entry is still protected from reclamation.
    pub fn get_and<Q, F, T>(&self, key: &Q, with_value: F) -> Option<T>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        F: FnOnce(&V) -> T,
    {
        let guard = HazardGuard::new();
        let hash = self.hash_key(key);
        let head = self.bucket_dummy(&guard, hash);
        let found = self.search_from(&guard, head, entry::data_key(hash), Some(key));
        if !found.found {
            return None;
        }
        // The guard keeps the matched entry allocated until this returns.
        let value = unsafe { (*found.cur()).value() };
        value.map(with_value)
    }

    /// Returns `true` if `key` is present.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.get_and(key, |_| ()).is_some()
    }

    /// Inserts `key -> value` if `key` is absent. Returns `true` if a new
    /// entry was created and `false` if the key was already present, in
    /// which case the existing value is left untouched and the given pair
    /// is dropped.
    pub fn insert(&self, key: K, value: V) -> bool {
        let guard = HazardGuard::new();
        let hash = self.hash_key(&key);
        let so_key = entry::data_key(hash);
        let head = self.bucket_dummy(&guard, hash);
        let node = Box::into_raw(Entry::data(so_key, key, value));
        loop {
            let found = self.search_for_node(&guard, head, node);
            if found.found {
                // Lost to an existing entry; the node was never linked.
                unsafe { drop(Box::from_raw(node)) };
                return false;
            }
            if self.link(&found, node) {
                self.note_insertion();
                return true;
            }
        }
    }

    /// Maps `key` to `value` unconditionally. Returns the value the key
    /// mapped to immediately before this call's insertion took effect.
    pub fn put(&self, key: K, value: V) -> Option<V>
    where
        V: Clone,
    {
        let guard = HazardGuard::new();
        let hash = self.hash_key(&key);
        let so_key = entry::data_key(hash);
        let head = self.bucket_dummy(&guard, hash);
        let node = Box::into_raw(Entry::data(so_key, key, value));
        let mut replaced = None;
        loop {
            let found = self.search_for_node(&guard, head, node);
            if found.found {
                // Displace the incumbent, then try again to claim the slot.
                if let Some(value) = self.remove_found(&found) {
                    replaced = Some(value);
                }
                continue;
            }
            if self.link(&found, node) {
                self.note_insertion();
                return replaced;
            }
        }
    }

    /// Removes `key`, returning a clone of the value it mapped to. Exactly
    /// one of any set of racing removers wins; the others return `None`.
    pub fn remove<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        let guard = HazardGuard::new();
        let hash = self.hash_key(key);
        let head = self.bucket_dummy(&guard, hash);
        let found = self.search_from(&guard, head, entry::data_key(hash), Some(key));
        if !found.found {
            return None;
        }
        self.remove_found(&found)
    }

    /// Removes every entry the sweep observes. Returns once a full pass
    /// finds the map empty; entries inserted concurrently behind the sweep
    /// may survive it.
    pub fn clear(&self) {
        let guard = HazardGuard::new();
        while self.remove_first(&guard) {}
    }

    /// The number of entries. Approximate while mutations are in flight,
    /// exact once the map is quiesced.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn hash_key<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    /// The dummy heading `hash`'s bucket under the current shift, linking
    /// it (and any missing ancestors) into the list first if needed.
    fn bucket_dummy(&self, guard: &HazardGuard, hash: u64) -> *mut Entry<K, V> {
        let shift = self.bucket_shift.load(Ordering::Acquire);
        let bucket = hash & ((1u64 << shift) - 1);
        self.ensure_bucket(guard, bucket)
    }

    fn ensure_bucket(&self, guard: &HazardGuard, bucket: u64) -> *mut Entry<K, V> {
        let slot = self.trunks.slot(bucket);
        let head = slot.load(Ordering::Acquire);
        if !head.is_null() {
            return head;
        }
        self.init_bucket(guard, bucket, slot)
    }

    /// Links the dummy for `bucket` into its parent's run and publishes it
    /// in `slot`. Racing initializers all end up with the same node: one
    /// wins the list insertion, the rest find that winner by key.
    fn init_bucket(
        &self,
        guard: &HazardGuard,
        bucket: u64,
        slot: &AtomicPtr<Entry<K, V>>,
    ) -> *mut Entry<K, V> {
        debug_assert_ne!(bucket, 0);
        // The parent is the bucket index with its highest bit cleared; its
        // run is the one this bucket subdivides.
        let top = 63 - bucket.leading_zeros();
        let parent = self.ensure_bucket(guard, bucket & !(1u64 << top));

        let so_key = entry::dummy_key(bucket);
        let node = Box::into_raw(Entry::dummy(bucket));
        let installed = loop {
            let found = self.search_from::<K>(guard, parent, so_key, None);
            if found.found {
                // Another initializer linked the dummy first.
                unsafe { drop(Box::from_raw(node)) };
                break found.cur();
            }
            if self.link(&found, node) {
                break node;
            }
        };
        // Either we publish first or a racer already published the same
        // pointer; both leave the slot correct.
        let _ = slot.compare_exchange(
            ptr::null_mut(),
            installed,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        installed
    }

    /// Search keyed by an unlinked node's own key. The node is exclusively
    /// ours until linked, so borrowing its key for the walk is safe.
    fn search_for_node(
        &self,
        guard: &HazardGuard,
        head: *mut Entry<K, V>,
        node: *mut Entry<K, V>,
    ) -> Search<K, V> {
        let (so_key, key) = unsafe {
            match &(*node).kind {
                EntryKind::Data { key, .. } => ((*node).so_key, key),
                EntryKind::Dummy => unreachable!("search_for_node takes data nodes"),
            }
        };
        self.search_from(guard, head, so_key, Some(key))
    }

    /// Walks the list from `head` to the position of `so_key`, helping to
    /// detach any retired node it passes. `key` is `None` when the target
    /// is a dummy. Restarts from `head` with a fresh guard version whenever
    /// a CAS it depends on is lost.
    fn search_from<Q>(
        &self,
        guard: &HazardGuard,
        head: *mut Entry<K, V>,
        so_key: u64,
        key: Option<&Q>,
    ) -> Search<K, V>
    where
        K: Borrow<Q>,
        Q: Eq + ?Sized,
    {
        'restart: loop {
            guard.reacquire();
            // Dummies live until the map is dropped, so `head` cannot
            // dangle even across restarts.
            let mut prev: *const AtomicStampedPtr<Entry<K, V>> = unsafe { &(*head).next };
            let mut link = unsafe { &*prev }.load(Ordering::Acquire);
            loop {
                debug_assert_eq!(link.stamp() & RETIRED, 0);
                let cur = link.ptr();
                if cur.is_null() {
                    return Search {
                        prev,
                        prev_link: link,
                        found: false,
                    };
                }
                // `cur` was linked when `link` was loaded, which is after
                // this walk's version was published; the guard keeps it
                // allocated from here on.
                let cur_next = unsafe { &(*cur).next }.load(Ordering::Acquire);
                if cur_next.stamp() & RETIRED != 0 {
                    // Retired but still linked; detach it before moving on.
                    match self.unlink(prev, link, cur_next.ptr()) {
                        Some(new_link) => {
                            link = new_link;
                            continue;
                        }
                        None => continue 'restart,
                    }
                }
                let cur_key = unsafe { (*cur).so_key };
                if cur_key > so_key {
                    return Search {
                        prev,
                        prev_link: link,
                        found: false,
                    };
                }
                if cur_key == so_key {
                    // Equal keys still need a payload comparison: data keys
                    // collide when two hashes differ only in the top bit.
                    let matched = match (key, unsafe { (*cur).key() }) {
                        (Some(query), Some(existing)) => existing.borrow() == query,
                        (None, None) => true,
                        _ => false,
                    };
                    if matched {
                        return Search {
                            prev,
                            prev_link: link,
                            found: true,
                        };
                    }
                }
                prev = unsafe { &(*cur).next };
                link = cur_next;
            }
        }
    }

    /// Links `node` in place of a missed search position. The node's next
    /// pointer is set before the CAS publishes it, so no reader can ever
    /// observe a partially initialized entry.
    fn link(&self, at: &Search<K, V>, node: *mut Entry<K, V>) -> bool {
        debug_assert!(!at.found);
        unsafe {
            (*node)
                .next
                .store(StampedPtr::new(at.cur(), 0), Ordering::Relaxed);
        }
        let linked = StampedPtr::new(node, at.prev_link.stamp().wrapping_add(STAMP_STEP));
        unsafe { &*at.prev }
            .compare_exchange(at.prev_link, linked, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// Sets the retired bit on `cur`'s own link, freezing its successor.
    /// `Ok` carries that successor; `Err` means a racing remover owns the
    /// node's deletion.
    fn mark_entry(&self, cur: *mut Entry<K, V>) -> Result<*mut Entry<K, V>, ()> {
        loop {
            let cur_next = unsafe { &(*cur).next }.load(Ordering::Acquire);
            if cur_next.stamp() & RETIRED != 0 {
                return Err(());
            }
            let marked = cur_next.with_stamp(cur_next.stamp() | RETIRED);
            match unsafe { &(*cur).next }.compare_exchange_weak(
                cur_next,
                marked,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Ok(cur_next.ptr()),
                // Spurious failure, or an insertion landed right after
                // `cur` and changed its successor; reload and try again.
                Err(_) => {}
            }
        }
    }

    /// Swings `prev` past a retired node. The winner of this CAS is the
    /// node's sole retirer. `None` means the predecessor changed and some
    /// later walk will detach the node instead.
    fn unlink(
        &self,
        prev: *const AtomicStampedPtr<Entry<K, V>>,
        link: StampedPtr<Entry<K, V>>,
        succ: *mut Entry<K, V>,
    ) -> Option<StampedPtr<Entry<K, V>>> {
        let unlinked = StampedPtr::new(succ, link.stamp().wrapping_add(STAMP_STEP));
        match unsafe { &*prev }.compare_exchange(link, unlinked, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => {
                // Unreachable from the list as of the CAS; safe to retire.
                unsafe { reclaim::retire(link.ptr()) };
                Some(unlinked)
            }
            Err(_) => None,
        }
    }

    /// Removes the entry a hit search stopped on: mark, then best-effort
    /// detach. A failed detach leaves the node for a later walk; the
    /// removal itself has already taken effect at the mark.
    fn remove_found(&self, at: &Search<K, V>) -> Option<V>
    where
        V: Clone,
    {
        let cur = at.cur();
        let succ = self.mark_entry(cur).ok()?;
        // Marking froze the entry and the guard keeps it allocated; the
        // payload is safe to read until this operation returns.
        let value = unsafe { (*cur).value() }.cloned();
        self.len.fetch_sub(1, Ordering::Relaxed);
        let _ = self.unlink(at.prev, at.prev_link, succ);
        value
    }

    /// Detaches the first data entry reachable from the list head. Returns
    /// `false` once only dummies remain.
    fn remove_first(&self, guard: &HazardGuard) -> bool {
        'restart: loop {
            guard.reacquire();
            let head = self.trunks.slot(0).load(Ordering::Acquire);
            let mut prev: *const AtomicStampedPtr<Entry<K, V>> = unsafe { &(*head).next };
            let mut link = unsafe { &*prev }.load(Ordering::Acquire);
            loop {
                let cur = link.ptr();
                if cur.is_null() {
                    return false;
                }
                let cur_next = unsafe { &(*cur).next }.load(Ordering::Acquire);
                if cur_next.stamp() & RETIRED != 0 {
                    match self.unlink(prev, link, cur_next.ptr()) {
                        Some(new_link) => {
                            link = new_link;
                            continue;
                        }
                        None => continue 'restart,
                    }
                }
                if !unsafe { (*cur).is_dummy() } {
                    match self.mark_entry(cur) {
                        Ok(succ) => {
                            self.len.fetch_sub(1, Ordering::Relaxed);
                            let _ = self.unlink(prev, link, succ);
                            return true;
                        }
                        // A racing remover owns it; rescan for the next one.
                        Err(()) => continue 'restart,
                    }
                }
                prev = unsafe { &(*cur).next };
                link = cur_next;
            }
        }
    }

    fn note_insertion(&self) {
        // A remover that wins its mark decrements right away, possibly
        // before the insert that linked the entry is counted here; the
        // counter then reads as wrapped until the increments catch up.
        let len = self.len.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if len as isize <= 0 {
            return;
        }
        let shift = self.bucket_shift.load(Ordering::Relaxed);
        let buckets = 1u64 << shift;
        if (len as u64).saturating_mul(LOAD_FACTOR_DEN) >= buckets * LOAD_FACTOR_NUM {
            self.grow_directory(shift);
        }
    }

    /// Doubles the bucket directory if nobody else is already doing so.
    /// Readers and writers never wait on this path; a grower that finds
    /// the lock taken simply leaves growth to the holder.
    fn grow_directory(&self, from_shift: u32) {
        if from_shift >= MAX_SHIFT {
            return;
        }
        let _growth = match self.growth_lock.try_lock() {
            Some(lock) => lock,
            None => return,
        };
        if self.bucket_shift.load(Ordering::Relaxed) != from_shift {
            // A previous holder already grew past us.
            return;
        }
        let next_trunk = (from_shift - FIRST_SHIFT + 1) as usize;
        self.trunks.install_trunk(next_trunk);
        // New buckets become addressable only after this store; their
        // dummies are linked lazily on first touch.
        self.bucket_shift.store(from_shift + 1, Ordering::Release);
        #[cfg(feature = "logging")]
        log::debug!(
            "doubled the bucket directory to 2^{} buckets",
            from_shift + 1
        );
    }
}

impl<K, V, S> Default for SplitOrderedHashMap<K, V, S>
where
    K: Hash + Eq,
    S: BuildHasher + Default,
{
    fn default() -> Self {
        Self::with_capacity_and_hasher(0, S::default())
    }
}

impl<K, V, S> Drop for SplitOrderedHashMap<K, V, S> {
    fn drop(&mut self) {
        // Exclusive access: free every node still linked, marked or not.
        // Nodes that were already detached belong to the retire lists of
        // the threads that removed them and are freed there.
        let mut p = self.trunks.slot(0).load(Ordering::Relaxed);
        while !p.is_null() {
            let next = unsafe { &(*p).next }.load(Ordering::Relaxed).ptr();
            unsafe { drop(Box::from_raw(p)) };
            p = next;
        }
        // Slab arrays are freed by `Trunks::drop` afterwards.
    }
}

/// The smallest shift whose bucket count keeps `capacity` entries below
/// the growth threshold.
fn shift_for_capacity(capacity: usize) -> u32 {
    let demand = (capacity as u64).saturating_mul(LOAD_FACTOR_DEN);
    let mut shift = FIRST_SHIFT;
    while shift < MAX_SHIFT && (1u64 << shift) * LOAD_FACTOR_NUM <= demand {
        shift += 1;
    }
    shift
}
