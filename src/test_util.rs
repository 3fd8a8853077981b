use std::{
    sync::atomic::{AtomicUsize, Ordering},
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use crate::reclaim;

/// Counts how many values sharing this notifier have been dropped.
#[derive(Debug, Default)]
pub(crate) struct DropNotifier {
    dropped: AtomicUsize,
}

impl DropNotifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn dropped(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Flushes retire lists until `expected` drops have been observed.
    /// Hazard records published by unrelated threads can postpone frees,
    /// so keep flushing for a while before giving up. Returns `false` on
    /// timeout or if *more* than `expected` drops ever show up.
    pub(crate) fn eventually_dropped(&self, expected: usize) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let dropped = self.dropped();
            if dropped >= expected {
                return dropped == expected;
            }
            if Instant::now() > deadline {
                return false;
            }
            reclaim::flush();
            thread::sleep(Duration::from_millis(10));
        }
    }
}

/// A value that reports its own destruction to a shared [`DropNotifier`].
/// Stored in maps behind an `Arc` so that handing out clones does not
/// multiply the drop count.
#[derive(Debug)]
pub(crate) struct NoisyDropper<T> {
    parent: Arc<DropNotifier>,
    pub(crate) elem: T,
}

impl<T> NoisyDropper<T> {
    pub(crate) fn new(parent: Arc<DropNotifier>, elem: T) -> Self {
        Self { parent, elem }
    }
}

impl<T> Drop for NoisyDropper<T> {
    fn drop(&mut self) {
        self.parent.dropped.fetch_add(1, Ordering::Relaxed);
    }
}
