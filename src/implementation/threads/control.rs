// Copyright 2020 Xavier Gillard
//
// Permission is hereby granted, free of charge, to any person obtaining a copy of
// this software and associated documentation files (the "Software"), to deal in
// the Software without restriction, including without limitation the rights to
// use, copy, modify, merge, publish, distribute, sublicense, and/or sell copies of
// the Software, and to permit persons to whom the Software is furnished to do so,
// subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY, FITNESS
// FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE AUTHORS OR
// COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER LIABILITY, WHETHER
// IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM, OUT OF OR IN
// CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE SOFTWARE.

//! The thread control trio: mutex, condition variable, counter.  This is the
//! one synchronization shape the whole pool is built from, used both as the
//! per-worker "start" gate and as the per-tree "stop" barrier.

use std::time::Duration;

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Mutex + condition + integer count.  The meaning of the count belongs to
/// the client: the pool uses "1 = idle, 0 = run" on start gates and
/// "number of unfinished workers" on stop barriers.
#[derive(Debug, Default)]
pub struct ThreadControl {
    mutex: Mutex<i32>,
    cond: Condvar,
}

impl ThreadControl {
    pub const fn new() -> Self {
        ThreadControl { mutex: Mutex::new(0), cond: Condvar::new() }
    }

    /// Takes the lock; the guard gives direct count access for compound
    /// updates (the worker loop decrements the stop count and re-arms its
    /// start gate under one critical section).
    pub fn lock(&self) -> MutexGuard<'_, i32> {
        self.mutex.lock()
    }

    pub fn lock_and_set(&self, value: i32) {
        *self.mutex.lock() = value;
    }

    pub fn lock_and_increment(&self, offset: i32) {
        *self.mutex.lock() += offset;
    }

    pub fn count(&self) -> i32 {
        *self.mutex.lock()
    }

    /// Wakes one waiter.
    pub fn notify_one(&self) {
        self.cond.notify_one();
    }

    /// Wakes every waiter.
    pub fn notify_all(&self) {
        self.cond.notify_all();
    }

    /// Waits on the condition with a guard obtained from [Self::lock].
    pub fn wait(&self, guard: &mut MutexGuard<'_, i32>) {
        self.cond.wait(guard);
    }

    /// Blocks until the count reaches zero.
    pub fn wait_for_zero(&self) {
        let mut guard = self.mutex.lock();
        while *guard != 0 {
            self.cond.wait(&mut guard);
        }
    }

    /// Waits up to `timeout` for the count to *change* from its value at
    /// entry.  Returns the count observed on exit.  Only the tree teardown
    /// path uses this, to avoid hanging on workers orphaned by an error.
    pub fn wait_for_change(&self, timeout: Duration) -> i32 {
        let mut guard = self.mutex.lock();
        let refcount = *guard;
        while *guard == refcount {
            if self.cond.wait_for(&mut guard, timeout).timed_out() {
                break;
            }
        }
        *guard
    }
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_control {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_for_zero_wakes_on_last_decrement() {
        let ctrl = Arc::new(ThreadControl::new());
        ctrl.lock_and_set(3);
        let theirs = Arc::clone(&ctrl);
        let handle = std::thread::spawn(move || {
            for _ in 0..3 {
                let mut guard = theirs.lock();
                *guard -= 1;
                if *guard == 0 {
                    theirs.notify_one();
                }
            }
        });
        ctrl.wait_for_zero();
        assert_eq!(0, ctrl.count());
        handle.join().unwrap();
    }

    #[test]
    fn wait_for_change_times_out() {
        let ctrl = ThreadControl::new();
        ctrl.lock_and_set(5);
        let observed = ctrl.wait_for_change(Duration::from_millis(5));
        assert_eq!(5, observed);
    }
}
