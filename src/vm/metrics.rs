use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug, Default)]
pub struct RuntimeMetrics {
    /// Total time threads spent parked at safe points (in microseconds)
    pub safepoint_pause_total_us: AtomicU64,
    /// Number of stop-the-world pauses completed
    pub safepoint_pause_count: AtomicU64,
    /// Number of times a thread had to block waiting for a monitor
    pub lock_contention_count: AtomicU64,
    /// Total time spent waiting for monitors (in microseconds)
    pub lock_contention_total_us: AtomicU64,
    /// Guest exceptions raised by the interpreter or thrown by bytecode
    pub exceptions_raised: AtomicU64,
    /// Calls that crossed the native boundary
    pub native_calls: AtomicU64,
}

impl RuntimeMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_safepoint_pause(&self, duration: Duration) {
        self.safepoint_pause_total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.safepoint_pause_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lock_contention(&self, duration: Duration) {
        self.lock_contention_count.fetch_add(1, Ordering::Relaxed);
        self.lock_contention_total_us
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
    }

    pub fn record_exception(&self) {
        self.exceptions_raised.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_native_call(&self) {
        self.native_calls.fetch_add(1, Ordering::Relaxed);
    }
}
