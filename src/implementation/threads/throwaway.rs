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

//! Detached background tasks: launched and forgotten, a write-behind
//! checkpoint being the canonical use.
//!
//! A [ThrowawayWorker] keeps an active-task count so its owner can delay its
//! own teardown until the stragglers finish; the drop implementation waits
//! best-effort (100 seconds polled at half-second steps) and then proceeds
//! regardless.  Background tasks are deliberately not bound to any memory
//! node: they should run wherever they disturb the compute crew least.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::{core_err, warn, CoreError, CoreResult, ErrorKind};

use super::pool::relay;

/// Handle on a family of detached background tasks.
pub struct ThrowawayWorker {
    /// Diagnostic label carried into error messages.
    name: String,
    active_count: Arc<Mutex<i64>>,
}

impl ThrowawayWorker {
    pub fn new(name: impl Into<String>) -> Self {
        ThrowawayWorker { name: name.into(), active_count: Arc::new(Mutex::new(0)) }
    }

    /// Number of launched tasks that have not finished yet.
    pub fn active_count(&self) -> i64 {
        *self.active_count.lock()
    }

    /// Spawns `task` on a detached thread.  The active count is incremented
    /// up front and decremented when the task exits, panicking included; on
    /// spawn failure the count is rolled back and the failure raised.
    pub fn launch<F>(&self, task: F) -> CoreResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        // Surface anything left over from previous background work first.
        warn::transmit_message_hold();
        if let Some(msg) = relay::check_and_clear() {
            return Err(CoreError::new(ErrorKind::BadThread, msg));
        }

        *self.active_count.lock() += 1;

        let count = Arc::clone(&self.active_count);
        let name = self.name.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("spinmin-throwaway-{name}"))
            .spawn(move || {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
                    let text = if let Some(s) = payload.downcast_ref::<&str>() {
                        (*s).to_string()
                    } else if let Some(s) = payload.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unrecognized panic payload".to_string()
                    };
                    relay::set_error(format!("{text}\nException thrown in thread {name}"));
                }
                *count.lock() -= 1;
            });

        match spawned {
            Ok(_handle) => Ok(()), // Detached: the handle is dropped
            Err(e) => {
                *self.active_count.lock() -= 1;
                Err(core_err!(ResourceAlloc, "throwaway thread creation failed: {e}"))
            }
        }
    }
}

impl Drop for ThrowawayWorker {
    fn drop(&mut self) {
        // Wait for stragglers, then proceed regardless.
        const SLEEP: Duration = Duration::from_millis(500);
        let mut timeout = 100i64 * (1000 / 500); // 100 s at 0.5 s steps
        while timeout > 0 && *self.active_count.lock() > 0 {
            std::thread::sleep(SLEEP);
            timeout -= 1;
        }
    }
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_throwaway {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn count_rises_and_drains() {
        let crew = ThrowawayWorker::new("unit");
        let release = Arc::new(AtomicBool::new(false));
        for _ in 0..3 {
            let release = Arc::clone(&release);
            crew.launch(move || {
                while !release.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
            .unwrap();
        }
        assert_eq!(3, crew.active_count());
        release.store(true, Ordering::SeqCst);
        // Dropping waits for the tasks to drain.
        drop(crew);
    }

    #[test]
    fn a_panicking_task_reports_through_the_relay() {
        let crew = ThrowawayWorker::new("bomb");
        crew.launch(|| panic!("background boom")).unwrap();
        // Drain before checking the relay.
        while crew.active_count() > 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        let msg = relay::check_and_clear().expect("an error should be pending");
        assert!(msg.contains("background boom"));
        assert!(msg.contains("thread bomb"));
    }
}
