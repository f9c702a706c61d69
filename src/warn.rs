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

//! Nonfatal message handling.
//!
//! Warnings raised by worker threads are *held* in a process-wide queue and
//! only *transmitted* (through the [log] facade) by the master thread, at the
//! next join point.  This keeps the log stream single-writer and lets the
//! master attach join-time context.  Each warning carries a revision stamp
//! identifying the code that raised it, and a cap on how many times the same
//! message may be emitted; once the cap is exceeded a single "further
//! messages suppressed" notice is appended.

use std::sync::atomic::{AtomicU32, Ordering};

use fxhash::FxHashMap;
use parking_lot::Mutex;

/// Identifies the revision of the file a warning originates from.  Create one
/// `static` instance per file that sends warnings.
#[derive(Debug, Clone)]
pub struct RevisionInfo {
    /// Source file name.
    pub file: &'static str,
    /// Revision tag of that file.
    pub revision: &'static str,
    /// Date of the revision.
    pub date: &'static str,
    /// Author of the revision.
    pub author: &'static str,
}

impl RevisionInfo {
    pub const fn new(
        file: &'static str,
        revision: &'static str,
        date: &'static str,
        author: &'static str,
    ) -> Self {
        RevisionInfo { file, revision, date, author }
    }
}

/// A reusable warning channel with an emission cap.
///
/// Instances are meant to be `static` so the per-instance message count is
/// retained across sends:
/// ```
/// # use spinmin::warn::{RevisionInfo, WarningMessage};
/// static REVISION: RevisionInfo =
///     RevisionInfo::new(file!(), "1.0", "2020-05-12", "xgillard");
/// static FOX_WARNING: WarningMessage = WarningMessage::new(3);
/// FOX_WARNING.send(&REVISION, line!(), "the fox is in the henhouse");
/// ```
#[derive(Debug)]
pub struct WarningMessage {
    /// Lazily assigned process-unique id (0 means unassigned).
    id: AtomicU32,
    /// Maximum number of times this message is emitted; -1 means no limit.
    max_count: i32,
}

/// One held, not-yet-transmitted warning.
#[derive(Debug, Clone)]
struct HeldMessage {
    text: String,
}

static NEXT_ID: AtomicU32 = AtomicU32::new(1);
static COUNTS: Mutex<Option<FxHashMap<u32, u32>>> = Mutex::new(None);
static HOLD: Mutex<Vec<HeldMessage>> = Mutex::new(Vec::new());

impl WarningMessage {
    /// Creates a warning channel capped at `max_count` emissions
    /// (-1 for unlimited).
    pub const fn new(max_count: i32) -> Self {
        WarningMessage { id: AtomicU32::new(0), max_count }
    }

    fn instance_id(&self) -> u32 {
        let id = self.id.load(Ordering::Relaxed);
        if id != 0 {
            return id;
        }
        let fresh = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        match self.id.compare_exchange(0, fresh, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => fresh,
            Err(current) => current,
        }
    }

    /// Number of times this message has been sent so far.
    pub fn current_count(&self) -> u32 {
        let id = self.instance_id();
        COUNTS.lock().as_ref().and_then(|m| m.get(&id).copied()).unwrap_or(0)
    }

    /// The emission cap (-1 for unlimited).
    pub fn max_count(&self) -> i32 {
        self.max_count
    }

    /// Queues the warning in the process-wide hold buffer.  Any thread may
    /// call this; nothing reaches the log until the master transmits.
    pub fn send(&self, revinfo: &RevisionInfo, line: u32, msg: &str) {
        let id = self.instance_id();
        let count = {
            let mut counts = COUNTS.lock();
            let counts = counts.get_or_insert_with(FxHashMap::default);
            let entry = counts.entry(id).or_insert(0);
            *entry += 1;
            *entry
        };
        if self.max_count >= 0 {
            let cap = self.max_count as u32;
            if count > cap + 1 {
                return;
            }
            if count == cap + 1 {
                // One extra record past the cap, to say we are going quiet.
                HOLD.lock().push(HeldMessage {
                    text: format!(
                        "{} (revision {}, {}, {}, line {}): \
                         further messages of this type suppressed",
                        revinfo.file, revinfo.revision, revinfo.date, revinfo.author, line
                    ),
                });
                return;
            }
        }
        HOLD.lock().push(HeldMessage {
            text: format!(
                "{} (revision {}, {}, {}, line {}): {}",
                revinfo.file, revinfo.revision, revinfo.date, revinfo.author, line, msg
            ),
        });
    }
}

/// Drains the hold queue through `log::warn!`.  Only the master thread should
/// call this; the thread pool does so at every join.
pub fn transmit_message_hold() {
    let pending = std::mem::take(&mut *HOLD.lock());
    for held in pending {
        log::warn!("{}", held.text);
    }
}

/// Forgets all per-channel emission counts.  Used when a new problem run
/// starts so capped messages get a fresh allowance.
pub fn clear_counts() {
    if let Some(counts) = COUNTS.lock().as_mut() {
        counts.clear();
    }
}

#[cfg(test)]
pub(crate) fn held_count() -> usize {
    HOLD.lock().len()
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_warn {
    use super::*;

    static REVISION: RevisionInfo = RevisionInfo::new(file!(), "1.0", "2020-05-12", "xgillard");

    #[test]
    fn cap_appends_one_suppression_notice() {
        // The hold queue is process wide: serialize against every other test
        // that can trigger a transmit.
        let _guard = crate::test_support::serial();
        static CAPPED: WarningMessage = WarningMessage::new(2);
        let before = held_count();
        for _ in 0..5 {
            CAPPED.send(&REVISION, line!(), "repeated complaint");
        }
        // two real messages plus one suppression notice
        assert_eq!(before + 3, held_count());
        assert_eq!(5, CAPPED.current_count());
        transmit_message_hold();
    }

    #[test]
    fn unlimited_messages_are_all_held() {
        let _guard = crate::test_support::serial();
        static CHATTY: WarningMessage = WarningMessage::new(-1);
        let before = held_count();
        for _ in 0..4 {
            CHATTY.send(&REVISION, line!(), "still going");
        }
        assert_eq!(before + 4, held_count());
        transmit_message_hold();
        assert_eq!(0, held_count());
    }
}
