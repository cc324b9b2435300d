use crate::{error::MonitorStateError, value::ObjectRef, vm::metrics::RuntimeMetrics};
use parking_lot::{Condvar, Mutex};
use std::{collections::HashMap, sync::Arc, time::Instant};

/// Identifies an interpreter thread to the monitor implementation. Zero is
/// reserved for "unowned".
pub type ThreadId = u64;

/// The lock operations behind `monitorenter`, `monitorexit` and synchronized
/// methods. Enter and exit are full acquire/release barriers.
pub trait Synchronizer: Send + Sync {
    /// Blocks until `thread` owns the monitor of `object`. Re-entrant.
    fn monitor_enter(&self, thread: ThreadId, object: ObjectRef);

    fn monitor_exit(&self, thread: ThreadId, object: ObjectRef) -> Result<(), MonitorStateError>;

    /// Non-blocking attempt, used to decide whether a thread is about to block.
    fn try_enter(&self, thread: ThreadId, object: ObjectRef) -> bool;
}

#[derive(Debug)]
struct SyncBlockState {
    /// Thread ID of the current lock owner (0 means unlocked)
    owner_thread_id: ThreadId,
    /// Lock recursion count (for nested locks by the same thread)
    recursion_count: usize,
}

/// The monitor of one object: a recursive lock built from a mutex and a
/// condition variable.
///
/// The same thread may acquire the lock several times and must release it
/// the same number of times before another thread can acquire it.
#[derive(Debug)]
pub struct SyncBlock {
    state: Mutex<SyncBlockState>,
    condvar: Condvar,
}

impl SyncBlock {
    fn new() -> Self {
        Self {
            state: Mutex::new(SyncBlockState {
                owner_thread_id: 0,
                recursion_count: 0,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Try to enter the monitor (non-blocking).
    pub fn try_enter(&self, thread_id: ThreadId) -> bool {
        let mut state = self.state.lock();
        if state.owner_thread_id == 0 {
            state.owner_thread_id = thread_id;
            state.recursion_count = 1;
            true
        } else if state.owner_thread_id == thread_id {
            state.recursion_count += 1;
            true
        } else {
            false
        }
    }

    /// Enter the monitor (blocking).
    pub fn enter(&self, thread_id: ThreadId, metrics: &RuntimeMetrics) {
        let mut state = self.state.lock();

        if state.owner_thread_id == thread_id {
            state.recursion_count += 1;
            return;
        }

        if state.owner_thread_id != 0 {
            let start_wait = Instant::now();
            while state.owner_thread_id != 0 {
                self.condvar.wait(&mut state);
            }
            metrics.record_lock_contention(start_wait.elapsed());
        }

        state.owner_thread_id = thread_id;
        state.recursion_count = 1;
    }

    /// Exit the monitor.
    /// Returns false if the monitor is not owned by this thread.
    pub fn exit(&self, thread_id: ThreadId) -> bool {
        let mut state = self.state.lock();

        if state.owner_thread_id != thread_id || thread_id == 0 || state.recursion_count == 0 {
            return false;
        }

        state.recursion_count -= 1;

        if state.recursion_count == 0 {
            state.owner_thread_id = 0;
            self.condvar.notify_one();
        }

        true
    }

    pub fn owner(&self) -> Option<ThreadId> {
        let state = self.state.lock();
        (state.owner_thread_id != 0).then_some(state.owner_thread_id)
    }
}

/// Sync blocks keyed by object, created on first use.
pub struct SyncBlockManager {
    blocks: Mutex<HashMap<ObjectRef, Arc<SyncBlock>>>,
    metrics: Arc<RuntimeMetrics>,
}

impl SyncBlockManager {
    pub fn new(metrics: Arc<RuntimeMetrics>) -> Self {
        Self {
            blocks: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn get_or_create_sync_block(&self, object: ObjectRef) -> Arc<SyncBlock> {
        self.blocks
            .lock()
            .entry(object)
            .or_insert_with(|| Arc::new(SyncBlock::new()))
            .clone()
    }

    pub fn get_sync_block(&self, object: ObjectRef) -> Option<Arc<SyncBlock>> {
        self.blocks.lock().get(&object).cloned()
    }
}

impl Default for SyncBlockManager {
    fn default() -> Self {
        Self::new(Arc::new(RuntimeMetrics::new()))
    }
}

impl Synchronizer for SyncBlockManager {
    fn monitor_enter(&self, thread: ThreadId, object: ObjectRef) {
        // the map lock is released before blocking on the monitor itself
        let block = self.get_or_create_sync_block(object);
        block.enter(thread, &self.metrics);
    }

    fn monitor_exit(&self, thread: ThreadId, object: ObjectRef) -> Result<(), MonitorStateError> {
        let released = self
            .get_sync_block(object)
            .is_some_and(|block| block.exit(thread));
        if released {
            Ok(())
        } else {
            Err(MonitorStateError::NotOwner { thread, object })
        }
    }

    fn try_enter(&self, thread: ThreadId, object: ObjectRef) -> bool {
        self.get_or_create_sync_block(object).try_enter(thread)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::HEAP_BASE;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_sync_block_recursion() {
        let block = SyncBlock::new();
        let tid = 1;
        let metrics = RuntimeMetrics::new();

        assert!(block.try_enter(tid));
        block.enter(tid, &metrics);
        assert_eq!(block.state.lock().recursion_count, 2);

        assert!(block.exit(tid));
        assert_eq!(block.state.lock().recursion_count, 1);
        assert!(block.exit(tid));
        assert_eq!(block.state.lock().recursion_count, 0);
        assert_eq!(block.owner(), None);
    }

    #[test]
    fn test_sync_block_contention() {
        let block = Arc::new(SyncBlock::new());
        let block_clone = block.clone();
        let metrics = Arc::new(RuntimeMetrics::new());
        let metrics_clone = metrics.clone();

        block.enter(1, &metrics);

        let handle = thread::spawn(move || {
            block_clone.enter(2, &metrics_clone);
            let recursion = block_clone.state.lock().recursion_count;
            block_clone.exit(2);
            recursion
        });

        thread::sleep(Duration::from_millis(50));
        block.exit(1);

        let recursion = handle.join().unwrap();
        assert_eq!(recursion, 1);
        assert_eq!(
            metrics
                .lock_contention_count
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_sync_block_try_enter() {
        let block = SyncBlock::new();
        assert!(block.try_enter(1));
        assert!(!block.try_enter(2));
        block.exit(1);
        assert!(block.try_enter(2));
    }

    #[test]
    fn test_exit_by_non_owner_fails() {
        let manager = SyncBlockManager::default();
        let obj = ObjectRef::from_address(HEAP_BASE + 8);

        assert!(manager.monitor_exit(1, obj).is_err());
        manager.monitor_enter(1, obj);
        assert_eq!(
            manager.monitor_exit(2, obj),
            Err(MonitorStateError::NotOwner {
                thread: 2,
                object: obj
            })
        );
        assert_eq!(manager.monitor_exit(1, obj), Ok(()));
        assert!(manager.monitor_exit(1, obj).is_err());
    }

    #[test]
    fn test_stress_heavy_contention() {
        let manager = Arc::new(SyncBlockManager::default());
        let obj = ObjectRef::from_address(HEAP_BASE + 16);
        let counter = Arc::new(Mutex::new(0u64));
        let mut handles = vec![];

        for tid in 1..=10 {
            let manager = manager.clone();
            let counter = counter.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    manager.monitor_enter(tid, obj);
                    *counter.lock() += 1;
                    thread::sleep(Duration::from_micros(10));
                    manager.monitor_exit(tid, obj).unwrap();
                }
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(*counter.lock(), 1000);
    }
}
