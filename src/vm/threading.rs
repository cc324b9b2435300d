use crate::vm::{CallStack, Root, RuntimeMetrics, ThreadId};
use parking_lot::{Condvar, Mutex};
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Called by the interpreter after conditional and backward branches.
///
/// The thread's frame chain is consistent and every reference slot is
/// tagged whenever this runs, so an implementation may enumerate the
/// thread's roots or block it.
pub trait SafepointHandler: Send + Sync {
    fn reached(&self, stack: &CallStack);
}

/// Safe points that never pause.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSafepoints;

impl SafepointHandler for NoSafepoints {
    #[inline]
    fn reached(&self, _stack: &CallStack) {}
}

#[derive(Default)]
struct PauseState {
    parked: usize,
    roots: Vec<(ThreadId, Root)>,
}

/// Parks interpreter threads at their next safe point so a collector can
/// look at their roots.
///
/// The protocol:
/// 1. The collector calls [`StopTheWorld::stop`], which raises the request
///    flag and waits until the expected number of threads have parked.
/// 2. Each thread reaching a safe point while the flag is up records its
///    roots, counts itself parked and blocks.
/// 3. Dropping the returned [`StopTheWorldGuard`] lowers the flag and wakes
///    every parked thread.
///
/// Threads blocked inside a monitor enter are not at a safe point and are
/// not counted.
pub struct StopTheWorld {
    requested: AtomicBool,
    state: Mutex<PauseState>,
    changed: Condvar,
    metrics: Arc<RuntimeMetrics>,
}

impl StopTheWorld {
    pub fn new(metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            requested: AtomicBool::new(false),
            state: Mutex::new(PauseState::default()),
            changed: Condvar::new(),
            metrics,
        }
    }

    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub fn parked(&self) -> usize {
        self.state.lock().parked
    }

    /// Stops `threads` threads. Returns `None`, with every thread released
    /// again, if they do not all park within `timeout`.
    pub fn stop(&self, threads: usize, timeout: Duration) -> Option<StopTheWorldGuard<'_>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        state.roots.clear();
        self.requested.store(true, Ordering::Release);

        while state.parked < threads {
            if self.changed.wait_until(&mut state, deadline).timed_out() && state.parked < threads {
                tracing::warn!(
                    parked = state.parked,
                    expected = threads,
                    "stop-the-world request timed out"
                );
                drop(state);
                self.resume();
                return None;
            }
        }
        tracing::debug!(threads, "all threads parked");
        Some(StopTheWorldGuard { coordinator: self })
    }

    fn resume(&self) {
        let _state = self.state.lock();
        self.requested.store(false, Ordering::Release);
        self.changed.notify_all();
    }
}

impl SafepointHandler for StopTheWorld {
    fn reached(&self, stack: &CallStack) {
        if !self.is_requested() {
            return;
        }
        let start = Instant::now();
        let mut state = self.state.lock();
        if !self.is_requested() {
            return;
        }
        let thread = stack.thread_id();
        stack.visit_roots(|r| state.roots.push((thread, r)));
        state.parked += 1;
        self.changed.notify_all();

        while self.is_requested() {
            self.changed.wait(&mut state);
        }
        state.parked -= 1;
        drop(state);
        self.metrics.record_safepoint_pause(start.elapsed());
    }
}

/// Keeps the world stopped until dropped.
pub struct StopTheWorldGuard<'a> {
    coordinator: &'a StopTheWorld,
}

impl StopTheWorldGuard<'_> {
    /// Roots recorded by the parked threads.
    pub fn roots(&self) -> Vec<(ThreadId, Root)> {
        self.coordinator.state.lock().roots.clone()
    }
}

impl Drop for StopTheWorldGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.resume();
    }
}
