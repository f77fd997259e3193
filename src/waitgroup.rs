//! Counter-based barrier for fan-out / fan-in.

use std::sync::{Arc, Condvar, Mutex, PoisonError};

/// A counter-based barrier.
///
/// `add` raises the expectation, `done` retires one unit, and `wait`
/// blocks the caller until the counter reaches zero. Clones share one
/// counter, which is how a group follows jobs onto other threads. The
/// group is reusable: `add` may be called again after a `wait` returns.
#[derive(Clone)]
pub struct WaitGroup {
    inner: Arc<Inner>,
}

struct Inner {
    count: Mutex<isize>,
    zero: Condvar,
}

impl WaitGroup {
    pub fn new() -> WaitGroup {
        WaitGroup {
            inner: Arc::new(Inner {
                count: Mutex::new(0),
                zero: Condvar::new(),
            }),
        }
    }

    /// Adds `n` (which may be negative) to the counter. A counter resting
    /// below zero is a contract violation.
    pub fn add(&self, n: isize) {
        let mut count = self
            .inner
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *count += n;
        debug_assert!(*count >= 0, "waitgroup counter went negative");
        if *count <= 0 {
            self.inner.zero.notify_all();
        }
    }

    /// Retires one unit; equivalent to `add(-1)`.
    pub fn done(&self) {
        self.add(-1);
    }

    /// Blocks until the counter reaches zero. Returns immediately if it
    /// already is.
    pub fn wait(&self) {
        let mut count = self
            .inner
            .count
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .inner
                .zero
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Default for WaitGroup {
    fn default() -> WaitGroup {
        WaitGroup::new()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let count = self.count.get_mut().map(|c| *c).unwrap_or(0);
        debug_assert_eq!(count, 0, "waitgroup dropped while still awaited");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_on_a_quiet_group_returns_immediately() {
        WaitGroup::new().wait();
    }

    #[test]
    fn wait_returns_once_every_unit_is_done() {
        let wg = WaitGroup::new();
        wg.add(8);
        let mut handles = Vec::new();
        for _ in 0..8 {
            let wg = wg.clone();
            handles.push(thread::spawn(move || wg.done()));
        }
        wg.wait();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn group_is_reusable_after_wait() {
        let wg = WaitGroup::new();
        wg.add(1);
        wg.done();
        wg.wait();

        wg.add(2);
        let peer = wg.clone();
        let h = thread::spawn(move || {
            peer.done();
            peer.done();
        });
        wg.wait();
        h.join().unwrap();
    }
}
