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

//! Memory-node placement information.
//!
//! The library itself does not talk to the operating system's NUMA
//! interface; the embedding application (which owns processor affinity for
//! its threads) installs the thread-to-node assignment here before
//! `init_threads`, and the pool shapes its two-level launch topology around
//! it.  First-touch page binding then follows from each worker initializing
//! only its own stripes.  Without an installed assignment the pool falls
//! back to the square-root launch topology and striping is only a cache
//! locality measure.

use parking_lot::Mutex;

static NODE_ASSIGNMENTS: Mutex<Option<Vec<usize>>> = Mutex::new(None);

/// Installs (or clears) the per-thread memory node assignment.  Index i of
/// the vector is the node thread i runs on, thread 0 being the master.
pub fn set_node_assignments(assignments: Option<Vec<usize>>) {
    *NODE_ASSIGNMENTS.lock() = assignments;
}

/// True when a node assignment has been installed.
pub fn ready() -> bool {
    NODE_ASSIGNMENTS.lock().is_some()
}

/// The node the given thread is assigned to; threads beyond the installed
/// table land on node 0.
pub fn node_of_thread(thread_id: usize) -> usize {
    NODE_ASSIGNMENTS
        .lock()
        .as_ref()
        .and_then(|v| v.get(thread_id).copied())
        .unwrap_or(0)
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_numa {
    use super::*;

    #[test]
    fn assignment_round_trip() {
        set_node_assignments(Some(vec![0, 0, 1, 1]));
        assert!(ready());
        assert_eq!(1, node_of_thread(2));
        assert_eq!(0, node_of_thread(99)); // Beyond the table
        set_node_assignments(None);
        assert!(!ready());
        assert_eq!(0, node_of_thread(2));
    }
}
