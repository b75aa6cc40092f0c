//! Usage barrier guarding queue destruction.

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct BarrierState {
    count: usize,
    deleted: bool,
}

/// Counts in-flight uses of a queue and blocks destruction until they
/// drain. Once destroyed, no further use can be acquired.
#[derive(Default)]
pub struct UsageBarrier {
    state: Mutex<BarrierState>,
    idle: Condvar,
}

impl UsageBarrier {
    pub fn acquire(&self) -> bool {
        let mut state = self.state.lock();
        if state.deleted {
            false
        } else {
            state.count += 1;
            true
        }
    }

    pub fn release(&self) {
        let mut state = self.state.lock();
        state.count -= 1;
        if state.count == 0 {
            self.idle.notify_all();
        }
    }

    /// Mark deleted and wait for the in-flight count to reach zero.
    pub fn destroy(&self) {
        let mut state = self.state.lock();
        state.deleted = true;
        while state.count > 0 {
            self.idle.wait(&mut state);
        }
    }

    /// Mark deleted without waiting (no store to drain against).
    pub fn mark_deleted(&self) {
        self.state.lock().deleted = true;
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }
}

/// RAII use token.
pub struct ScopedUse<'a> {
    barrier: &'a UsageBarrier,
    pub acquired: bool,
}

impl<'a> ScopedUse<'a> {
    pub fn new(barrier: &'a UsageBarrier) -> Self {
        ScopedUse { acquired: barrier.acquire(), barrier }
    }
}

impl Drop for ScopedUse<'_> {
    fn drop(&mut self) {
        if self.acquired {
            self.barrier.release();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn acquire_fails_after_destroy() {
        let barrier = UsageBarrier::default();
        assert!(barrier.acquire());
        barrier.release();
        barrier.mark_deleted();
        assert!(!barrier.acquire());
    }

    #[test]
    fn destroy_waits_for_inflight_users() {
        let barrier = Arc::new(UsageBarrier::default());
        assert!(barrier.acquire());
        let b = Arc::clone(&barrier);
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            b.release();
        });
        barrier.destroy();
        assert!(barrier.is_deleted());
        releaser.join().unwrap();
    }

    #[test]
    fn scoped_use_releases_on_drop() {
        let barrier = UsageBarrier::default();
        {
            let use1 = ScopedUse::new(&barrier);
            assert!(use1.acquired);
        }
        barrier.destroy(); // returns immediately: count is zero
    }
}
