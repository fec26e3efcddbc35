//! Stop-the-world handshake between allocating threads and the collector.
//!
//! Every [`LocalHeap`](crate::LocalHeap) registers a [`ThreadState`]. A
//! thread is either running or parked; a parked thread promises not to touch
//! the heap until it unparks. A collection only starts once every
//! registered thread is parked, and parked threads cannot unpark while it
//! runs.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::heap::Heap;
use crate::local_heap::ThreadState;

#[derive(Debug, Default)]
struct SafepointState {
    threads: Vec<Arc<ThreadState>>,
    running: usize,
    collecting: bool,
    /// Bumped when a collection completes.
    epoch: u64,
}

#[derive(Debug, Default)]
pub struct GlobalSafepoint {
    pause_requested: AtomicBool,
    state: Mutex<SafepointState>,
    cond: Condvar,
}

impl GlobalSafepoint {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cheap check for the cooperative safepoint poll.
    #[must_use]
    pub fn is_pause_requested(&self) -> bool {
        self.pause_requested.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn registered_threads(&self) -> usize {
        self.state.lock().threads.len()
    }

    #[must_use]
    pub fn running_threads(&self) -> usize {
        self.state.lock().running
    }

    /// Number of completed collections.
    #[must_use]
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    pub(crate) fn register(&self, thread: &Arc<ThreadState>) {
        let mut state = self.state.lock();
        while state.collecting {
            self.cond.wait(&mut state);
        }
        state.threads.push(Arc::clone(thread));
        state.running += 1;
        thread.set_parked(false);
    }

    pub(crate) fn unregister(&self, thread: &ThreadState) {
        let mut state = self.state.lock();
        state.threads.retain(|registered| registered.id() != thread.id());
        if !thread.is_parked() {
            state.running -= 1;
        }
        self.cond.notify_all();
    }

    /// Mark `thread` parked and wake a collector waiting for it.
    pub fn park(&self, thread: &ThreadState) {
        let mut state = self.state.lock();
        debug_assert!(!thread.is_parked(), "thread {} parked twice", thread.id());
        thread.set_parked(true);
        state.running -= 1;
        if state.running == 0 {
            self.cond.notify_all();
        }
    }

    /// Resume `thread`, waiting out any collection in progress.
    pub fn unpark(&self, thread: &ThreadState) {
        let mut state = self.state.lock();
        debug_assert!(thread.is_parked(), "thread {} is not parked", thread.id());
        while state.collecting {
            self.cond.wait(&mut state);
        }
        state.running += 1;
        thread.set_parked(false);
    }

    /// Run one collection with the world stopped, or wait for the one
    /// already running.
    ///
    /// The caller must be parked, otherwise this never returns.
    pub fn request_and_wait_for_collection(&self, heap: &Heap) {
        heap.metrics().record_collection_request();

        let mut state = self.state.lock();
        if state.collecting {
            let epoch = state.epoch;
            while state.epoch == epoch {
                self.cond.wait(&mut state);
            }
            return;
        }

        state.collecting = true;
        self.pause_requested.store(true, Ordering::Release);
        while state.running > 0 {
            self.cond.wait(&mut state);
        }
        let threads = state.threads.len();
        drop(state);
        let guard = PauseGuard { safepoint: self };

        let id = crate::tracing::internal::next_collection_id();
        let _span = crate::tracing::internal::trace_collection(id, threads);
        let start = Instant::now();
        heap.collector().collect_garbage(heap);
        let pause = start.elapsed();

        heap.metrics().record_collection(pause);
        #[allow(clippy::cast_possible_truncation)]
        crate::tracing::internal::log_collection_done(id, pause.as_micros() as u64);
        drop(guard);
    }
}

impl GlobalSafepoint {
    /// Call `f` on every registered thread while the world is stopped.
    ///
    /// # Panics
    ///
    /// Panics unless a collection is running and every thread is parked.
    pub(crate) fn for_each_parked_thread(&self, mut f: impl FnMut(&ThreadState)) {
        let state = self.state.lock();
        assert!(
            state.collecting && state.running == 0,
            "thread states can only be visited while the world is stopped"
        );
        for thread in &state.threads {
            debug_assert!(thread.is_parked());
            f(thread);
        }
    }
}

/// Ends the pause on every exit path, including a panicking collector.
struct PauseGuard<'a> {
    safepoint: &'a GlobalSafepoint,
}

impl Drop for PauseGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.safepoint.state.lock();
        state.collecting = false;
        state.epoch += 1;
        self.safepoint.pause_requested.store(false, Ordering::Release);
        self.safepoint.cond.notify_all();
    }
}

/// Keeps a thread parked for as long as the scope lives.
#[must_use = "the thread unparks as soon as the scope is dropped"]
pub struct ParkedScope<'a> {
    safepoint: &'a GlobalSafepoint,
    thread: &'a ThreadState,
}

impl<'a> ParkedScope<'a> {
    pub fn new(safepoint: &'a GlobalSafepoint, thread: &'a ThreadState) -> Self {
        safepoint.park(thread);
        Self { safepoint, thread }
    }
}

impl Drop for ParkedScope<'_> {
    fn drop(&mut self) {
        self.safepoint.unpark(self.thread);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_park_unpark_counts() {
        let safepoint = GlobalSafepoint::new();
        let thread = Arc::new(ThreadState::new(1));
        safepoint.register(&thread);
        assert_eq!(safepoint.running_threads(), 1);

        {
            let _parked = ParkedScope::new(&safepoint, &thread);
            assert!(thread.is_parked());
            assert_eq!(safepoint.running_threads(), 0);
        }

        assert!(!thread.is_parked());
        assert_eq!(safepoint.running_threads(), 1);
        safepoint.unregister(&thread);
        assert_eq!(safepoint.registered_threads(), 0);
    }

    #[test]
    fn test_parked_scope_unparks_on_panic() {
        let safepoint = GlobalSafepoint::new();
        let thread = Arc::new(ThreadState::new(1));
        safepoint.register(&thread);

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _parked = ParkedScope::new(&safepoint, &thread);
            panic!("wait failed");
        }));

        assert!(result.is_err());
        assert!(!thread.is_parked());
        assert_eq!(safepoint.running_threads(), 1);
    }

    #[test]
    fn test_unregister_parked_thread() {
        let safepoint = GlobalSafepoint::new();
        let thread = Arc::new(ThreadState::new(1));
        safepoint.register(&thread);
        safepoint.park(&thread);
        safepoint.unregister(&thread);
        assert_eq!(safepoint.running_threads(), 0);
        assert_eq!(safepoint.registered_threads(), 0);
    }

    #[test]
    #[should_panic(expected = "world is stopped")]
    fn test_visiting_threads_requires_a_pause() {
        let safepoint = GlobalSafepoint::new();
        let thread = Arc::new(ThreadState::new(1));
        safepoint.register(&thread);
        safepoint.for_each_parked_thread(|_| {});
    }
}
