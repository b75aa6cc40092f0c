//! Minimal one-shot task timer.
//!
//! A single background thread drives a binary heap of cancelable tasks.
//! Used for delayed auto-deletion and the periodic expiry sweep.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::warn;

/// A scheduled callback. Cancelation is a flag check at fire time, so a
/// cancel that races the firing may still observe the callback run; the
/// callbacks used here re-check their own preconditions.
pub struct TimerTask {
    name: String,
    fire_at: Instant,
    cancelled: AtomicBool,
    callback: Box<dyn Fn() + Send + Sync>,
}

impl TimerTask {
    pub fn new(
        name: impl Into<String>,
        delay: Duration,
        callback: impl Fn() + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(TimerTask {
            name: name.into(),
            fire_at: Instant::now() + delay,
            cancelled: AtomicBool::new(false),
            callback: Box::new(callback),
        })
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn fire(&self) {
        (self.callback)();
    }
}

struct Entry(Arc<TimerTask>);

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.0.fire_at == other.0.fire_at
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // min-heap on fire time
        other.0.fire_at.cmp(&self.0.fire_at)
    }
}

#[derive(Default)]
struct TimerState {
    heap: BinaryHeap<Entry>,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    available: Condvar,
}

/// Owns the timer thread; dropping the timer stops it.
pub struct Timer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn new(name: impl Into<String>) -> Self {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            available: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let thread = std::thread::Builder::new()
            .name(name.into())
            .spawn(move || run(worker))
            .expect("failed to spawn timer thread");
        Timer { shared, thread: Some(thread) }
    }

    pub fn add(&self, task: Arc<TimerTask>) {
        let mut state = self.shared.state.lock();
        state.heap.push(Entry(task));
        self.shared.available.notify_one();
    }

    fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        state.shutdown = true;
        drop(state);
        self.shared.available.notify_all();
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shutdown();
        if let Some(handle) = self.thread.take() {
            if handle.join().is_err() {
                warn!("timer thread terminated abnormally");
            }
        }
    }
}

fn run(shared: Arc<Shared>) {
    let mut state = shared.state.lock();
    loop {
        if state.shutdown {
            return;
        }
        match state.heap.peek() {
            None => {
                shared.available.wait(&mut state);
            }
            Some(entry) => {
                let fire_at = entry.0.fire_at;
                let now = Instant::now();
                if fire_at > now {
                    let _ = shared.available.wait_until(&mut state, fire_at);
                    continue;
                }
                let task = state.heap.pop().expect("peeked entry vanished").0;
                if task.is_cancelled() {
                    continue;
                }
                // Fire outside the lock so callbacks may schedule more
                // tasks or take queue locks.
                drop(state);
                task.fire();
                tracing::trace!(task = %task.name, "timer task fired");
                state = shared.state.lock();
            }
        }
    }
}
