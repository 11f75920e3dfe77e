//! Per-frame resource ring with fence-ordered deferred release.
//!
//! A small fixed number of frame slots is cycled. Each submitted slot is
//! tagged with a value on a [`TimelineFence`]; before a slot is reused its
//! value must have been reached. Resources that may still be in use are
//! handed to a [`DeferredArena`] with the fence value after which they are
//! free, and come back out once that value completes.

use std::sync::{Condvar, Mutex, MutexGuard};

/// Monotonic completion counter shared between the submitting thread and
/// whoever retires work (GPU callback, present thread)
#[derive(Debug, Default)]
pub struct TimelineFence {
    completed: Mutex<u64>,
    signalled: Condvar,
}

impl TimelineFence {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, u64> {
        self.completed.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn completed(&self) -> u64 {
        *self.lock()
    }

    /// Mark everything up to `value` complete. Never moves backwards.
    pub fn signal(&self, value: u64) {
        let mut completed = self.lock();
        if value > *completed {
            *completed = value;
            self.signalled.notify_all();
        }
    }

    /// Block until `value` has completed
    pub fn wait(&self, value: u64) {
        let mut completed = self.lock();
        while *completed < value {
            completed = self.signalled.wait(completed).unwrap_or_else(|e| e.into_inner());
        }
    }
}

struct ArenaEntry<T> {
    resource: Option<T>,
    fence: u64,
}

/// Resources waiting for a fence value, stored in reusable entries
pub struct DeferredArena<T> {
    entries: Vec<ArenaEntry<T>>,
    free: Vec<usize>,
}

impl<T> Default for DeferredArena<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<T> DeferredArena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand over `resource` until `fence` completes. Returns its entry index.
    pub fn release(&mut self, resource: T, fence: u64) -> usize {
        let entry = ArenaEntry { resource: Some(resource), fence };
        match self.free.pop() {
            Some(index) => {
                self.entries[index] = entry;
                index
            }
            None => {
                self.entries.push(entry);
                self.entries.len() - 1
            }
        }
    }

    /// Take back everything whose fence is at or below `completed`
    pub fn collect(&mut self, completed: u64) -> Vec<T> {
        let mut out = Vec::new();
        for (index, entry) in self.entries.iter_mut().enumerate() {
            if entry.fence <= completed {
                if let Some(resource) = entry.resource.take() {
                    out.push(resource);
                    self.free.push(index);
                }
            }
        }
        out
    }

    pub fn pending(&self) -> usize {
        self.entries.iter().filter(|e| e.resource.is_some()).count()
    }

    /// Take everything regardless of fences (teardown after a full wait)
    pub fn drain(&mut self) -> Vec<T> {
        self.free.clear();
        self.entries.drain(..).filter_map(|e| e.resource).collect()
    }
}

struct FrameSlot<R> {
    resources: R,
    /// Timeline value of the last submission from this slot, 0 if none
    fence_value: u64,
}

pub struct FrameRing<R, D> {
    slots: Vec<FrameSlot<R>>,
    current: usize,
    next_fence_value: u64,
    deferred: DeferredArena<D>,
    reclaimed: Vec<D>,
}

impl<R, D> FrameRing<R, D> {
    /// One slot per element of `resources`; the first one is active
    pub fn new(resources: Vec<R>) -> Self {
        assert!(!resources.is_empty(), "frame ring needs at least one slot");
        Self {
            slots: resources
                .into_iter()
                .map(|resources| FrameSlot { resources, fence_value: 0 })
                .collect(),
            current: 0,
            next_fence_value: 1,
            deferred: DeferredArena::new(),
            reclaimed: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn current(&self) -> &R {
        &self.slots[self.current].resources
    }

    pub fn current_mut(&mut self) -> &mut R {
        &mut self.slots[self.current].resources
    }

    /// Timeline value the current slot's next submission will get
    pub fn pending_fence_value(&self) -> u64 {
        self.next_fence_value
    }

    /// Tag the current slot's work. The caller signals the returned value
    /// on the timeline once the work has been consumed.
    pub fn submit(&mut self) -> u64 {
        let value = self.next_fence_value;
        self.next_fence_value += 1;
        self.slots[self.current].fence_value = value;
        value
    }

    /// Make `index` current, waiting for its previous submission first
    pub fn activate(&mut self, index: usize, timeline: &TimelineFence) {
        let slot = &self.slots[index];
        if slot.fence_value > timeline.completed() {
            timeline.wait(slot.fence_value);
        }
        self.current = index;
        let completed = timeline.completed();
        let freed = self.deferred.collect(completed);
        self.reclaimed.extend(freed);
    }

    pub fn move_to_next(&mut self, timeline: &TimelineFence) -> usize {
        let next = (self.current + 1) % self.slots.len();
        self.activate(next, timeline);
        next
    }

    /// Release `resource` once the current slot's next submission retires
    pub fn defer_release(&mut self, resource: D) {
        self.deferred.release(resource, self.next_fence_value);
    }

    pub fn take_reclaimed(&mut self) -> Vec<D> {
        std::mem::take(&mut self.reclaimed)
    }

    pub fn deferred_count(&self) -> usize {
        self.deferred.pending()
    }

    /// Wait for every submitted slot, then hand back all deferred resources
    pub fn wait_all(&mut self, timeline: &TimelineFence) -> Vec<D> {
        let last = self.next_fence_value - 1;
        timeline.wait(last);
        let mut out = self.take_reclaimed();
        out.extend(self.deferred.drain());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_timeline_never_moves_back() {
        let fence = TimelineFence::new();
        fence.signal(5);
        fence.signal(3);
        assert_eq!(fence.completed(), 5);
        fence.wait(4);
    }

    #[test]
    fn test_timeline_wait_blocks_until_signal() {
        let fence = Arc::new(TimelineFence::new());
        let signaller = Arc::clone(&fence);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            signaller.signal(2);
        });
        fence.wait(2);
        assert_eq!(fence.completed(), 2);
        handle.join().expect("join");
    }

    #[test]
    fn test_arena_reuses_free_entries() {
        let mut arena = DeferredArena::new();
        let a = arena.release("a", 1);
        let b = arena.release("b", 3);
        assert_ne!(a, b);
        assert_eq!(arena.pending(), 2);

        assert_eq!(arena.collect(2), vec!["a"]);
        assert_eq!(arena.pending(), 1);
        // The freed entry is handed out again
        assert_eq!(arena.release("c", 4), a);

        assert_eq!(arena.collect(3), vec!["b"]);
        assert_eq!(arena.drain(), vec!["c"]);
        assert_eq!(arena.pending(), 0);
    }

    #[test]
    fn test_ring_waits_for_slot_fence() {
        let timeline = TimelineFence::new();
        let mut ring: FrameRing<u32, &str> = FrameRing::new(vec![10, 20]);

        let first = ring.submit();
        assert_eq!(first, 1);
        ring.move_to_next(&timeline);
        assert_eq!(*ring.current(), 20);
        let second = ring.submit();

        // Slot 0 can be reused once its fence is signalled
        timeline.signal(first);
        assert_eq!(ring.move_to_next(&timeline), 0);
        timeline.signal(second);
        assert_eq!(ring.move_to_next(&timeline), 1);
    }

    #[test]
    fn test_deferred_release_follows_fence() {
        let timeline = TimelineFence::new();
        let mut ring: FrameRing<(), &str> = FrameRing::new(vec![(), ()]);

        ring.defer_release("old texture");
        let value = ring.submit();
        ring.move_to_next(&timeline);
        assert!(ring.take_reclaimed().is_empty());
        assert_eq!(ring.deferred_count(), 1);

        timeline.signal(value);
        ring.submit();
        ring.move_to_next(&timeline);
        assert_eq!(ring.take_reclaimed(), vec!["old texture"]);
    }

    #[test]
    fn test_ring_blocks_on_other_thread() {
        let timeline = Arc::new(TimelineFence::new());
        let mut ring: FrameRing<u8, ()> = FrameRing::new(vec![0]);
        let value = ring.submit();

        let signaller = Arc::clone(&timeline);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            signaller.signal(value);
        });
        ring.move_to_next(&timeline);
        assert_eq!(timeline.completed(), value);
        handle.join().expect("join");
    }
}
