//! Host facilities: monotonic time, stack bounds, monitors and aborts.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Monotonic microseconds since the runtime started.
pub fn get_microseconds() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_micros() as u64
}

/// Upper bound on a single coroutine stack.
pub fn max_stack_size_in_words() -> usize {
    128 * 1024
}

/// Abort immediately; assertion failures land here.
pub fn immediate_abort() -> ! {
    std::process::abort()
}

static ABORT_SCHEDULED: AtomicBool = AtomicBool::new(false);

/// Request an abort at the next safepoint instead of right now;
/// expectation failures use this.
pub fn schedule_abort() {
    ABORT_SCHEDULED.store(true, Ordering::Release);
}

pub fn abort_scheduled() -> bool {
    ABORT_SCHEDULED.load(Ordering::Acquire)
}

/// A classic monitor: one lock, one condition, a generation counter so
/// waits are not lost to spurious wakeups.
pub struct Monitor {
    state: Mutex<u64>,
    condition: Condvar,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    pub fn new() -> Monitor {
        Monitor { state: Mutex::new(0), condition: Condvar::new() }
    }

    /// Block until the next notify after the call.
    pub fn wait(&self) {
        let mut generation = self.state.lock();
        let seen = *generation;
        while *generation == seen {
            self.condition.wait(&mut generation);
        }
    }

    pub fn notify_one(&self) {
        *self.state.lock() += 1;
        self.condition.notify_one();
    }

    pub fn notify_all(&self) {
        *self.state.lock() += 1;
        self.condition.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn microseconds_are_monotonic() {
        let first = get_microseconds();
        let second = get_microseconds();
        assert!(second >= first);
    }

    #[test]
    fn monitor_wakes_a_waiter() {
        let monitor = Arc::new(Monitor::new());
        let waiter = {
            let monitor = Arc::clone(&monitor);
            std::thread::spawn(move || monitor.wait())
        };
        // Keep notifying until the waiter joined; a single notify could
        // race with the waiter not having blocked yet.
        loop {
            monitor.notify_all();
            if waiter.is_finished() {
                break;
            }
            std::thread::yield_now();
        }
        waiter.join().expect("waiter");
    }
}
