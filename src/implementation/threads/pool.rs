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

//! The persistent worker pool and its launch/join machinery.
//!
//! A process holds one static table of workers, numbered 1..N-1; the caller
//! is worker 0.  Work is handed out through [ThreadTree] objects: a tree
//! owns a "stop" barrier counting started-but-unfinished workers, and at
//! most one tree may have a non-zero stop count at any instant (the launch
//! mutex serializes the find-a-free-worker critical sections).  Launching
//! can be flat ([ThreadTree::launch]) or two-level
//! ([ThreadTree::launch_tree]): with the tree launch, a set of leader
//! workers each wake their own follower list, which matters once the worker
//! count grows past a handful or spans memory nodes.
//!
//! Panics escaping a job on a worker are caught, recorded in a process-wide
//! error relay with the worker number attached, and re-raised on the master
//! at the next join as a `BadThread` error.  Warnings held by workers are
//! transmitted by the master at the same point.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

use crate::abstraction::ThreadJob;
use crate::implementation::storage::{JobBasket, StripedArray, StripedElement};
use crate::{core_err, warn, CoreError, CoreResult, ErrorKind};

use super::control::ThreadControl;
use super::locker::ThreadLocalMap;
use super::numa;

// ----------------------------------------------------------------------------
// --- ERROR RELAY ------------------------------------------------------------
// ----------------------------------------------------------------------------
/// Process-wide error relay: workers append, the master checks-and-clears at
/// join.
pub mod relay {
    use parking_lot::Mutex;

    static ERROR: Mutex<Option<String>> = Mutex::new(None);

    /// Appends an error message; messages accumulate until the next check.
    pub fn set_error(msg: String) {
        let mut guard = ERROR.lock();
        match guard.as_mut() {
            Some(existing) => {
                existing.push('\n');
                existing.push_str(&msg);
            }
            None => *guard = Some(msg),
        }
    }

    /// Atomically reports and clears the accumulated error, if any.
    pub fn check_and_clear() -> Option<String> {
        ERROR.lock().take()
    }

    /// True when an error is pending.
    pub fn is_error() -> bool {
        ERROR.lock().is_some()
    }
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unrecognized panic payload".to_string()
    }
}

fn bad_thread_error(msg: String) -> CoreError {
    CoreError::new(ErrorKind::BadThread, msg).at(file!(), line!())
}

// ----------------------------------------------------------------------------
// --- WORKER -----------------------------------------------------------------
// ----------------------------------------------------------------------------

thread_local! {
    static WORKER_ID: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

/// The id of the pool worker executing the current thread; 0 on the master
/// (and on any thread outside the pool).
pub fn current_worker_id() -> usize {
    WORKER_ID.with(|c| c.get())
}

/// A job handed to a worker: a borrow of the job object and of the tree's
/// stop control, erased to raw pointers.  Their validity is bounded by the
/// surrounding launch/join pair; the pool never stores a handle beyond the
/// join of the tree that created it.
#[derive(Clone, Copy)]
struct JobHandle {
    job: *const (dyn ThreadJob + Sync),
    stop: *const ThreadControl,
    multilevel: bool,
}
// The pointees are Sync (job by bound, control by construction); the handle
// only moves between threads inside one launch/join window.
unsafe impl Send for JobHandle {}

struct StartSlot {
    /// 1 means the worker is idle waiting; 0 means "run".
    count: i32,
    /// The job to run when woken; `None` plus count 0 requests exit.
    job: Option<JobHandle>,
}

/// Control block for one persistent worker.
struct Worker {
    id: usize,
    slot: Mutex<StartSlot>,
    cond: Condvar,
    /// Followers this worker wakes when launched as a leader in a two-level
    /// tree.  Only the master mutates this, and only between joins.
    sub_workers: Mutex<Vec<Arc<Worker>>>,
}

impl Worker {
    /// Spawns the OS thread and waits for it to reach its idle gate.
    fn spawn(id: usize) -> CoreResult<Arc<Worker>> {
        let worker = Arc::new(Worker {
            id,
            slot: Mutex::new(StartSlot { count: 0, job: None }),
            cond: Condvar::new(),
            sub_workers: Mutex::new(Vec::new()),
        });
        let mine = Arc::clone(&worker);
        std::thread::Builder::new()
            .name(format!("spinmin-worker-{id}"))
            .spawn(move || worker_main(mine))
            .map_err(|e| {
                core_err!(ResourceAlloc, "worker thread creation failed: {e}")
            })?;
        // Handshake: wait until the worker parks at its start gate.
        let mut slot = worker.slot.lock();
        while slot.count == 0 {
            worker.cond.wait(&mut slot);
        }
        drop(slot);
        Ok(worker)
    }

    /// True when the worker is parked at its start gate.
    fn is_idle(&self) -> bool {
        self.slot.lock().count == 1
    }

    /// Wakes the worker on `handle`, first waiting out any job a different
    /// tree may still have pending on it.
    fn run_cmd(&self, handle: JobHandle) {
        let mut slot = self.slot.lock();
        while slot.count != 1 {
            self.cond.wait(&mut slot);
        }
        slot.job = Some(handle);
        slot.count = 0; // Run signal
        drop(slot);
        self.cond.notify_all();
    }

    /// Asks the worker thread to exit and waits for the handshake.
    fn shut_down(&self) {
        let mut slot = self.slot.lock();
        while slot.count != 1 {
            self.cond.wait(&mut slot);
        }
        slot.job = None;
        slot.count = 0;
        self.cond.notify_all();
        while slot.count == 0 {
            self.cond.wait(&mut slot);
        }
    }
}

fn worker_main(me: Arc<Worker>) {
    WORKER_ID.with(|c| c.set(me.id));

    let mut slot = me.slot.lock();
    // Notify the spawner that we are ready and waiting.
    slot.count = 1;
    me.cond.notify_all();

    loop {
        while slot.count != 0 {
            me.cond.wait(&mut slot);
        }
        let Some(handle) = slot.job.take() else {
            break; // Exit request
        };

        if handle.multilevel {
            // Wake the followers before doing our own share.
            let subs = me.sub_workers.lock().clone();
            for sub in subs {
                sub.run_cmd(handle);
            }
        }

        let job = unsafe { &*handle.job };
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job.cmd(me.id))) {
            relay::set_error(format!(
                "{}\nException thrown in thread {}, caught in file {} line {}",
                panic_text(payload),
                me.id,
                file!(),
                line!()
            ));
        }

        // Decrement the tree barrier; the start gate is re-armed while the
        // stop mutex is still held so the master cannot observe this worker
        // idle before the stop count reflects its completion.
        let stop = unsafe { &*handle.stop };
        {
            let mut stop_count = stop.lock();
            *stop_count -= 1;
            if *stop_count == 0 {
                stop.notify_one();
            }
            slot.count = 1; // Ready to wait
        }
        // Wake any master parked in run_cmd waiting for this worker.
        me.cond.notify_all();
    }

    slot.count = 1;
    me.cond.notify_all();
    drop(slot);

    ThreadLocalMap::delete_locker();
}

// ----------------------------------------------------------------------------
// --- THE STATIC POOL --------------------------------------------------------
// ----------------------------------------------------------------------------

struct Registry {
    /// Child workers; worker number i lives at index i-1 because number 0 is
    /// the master and is not represented here.
    workers: Vec<Arc<Worker>>,
    /// Leaders (and stray followers of the master's node) the master wakes
    /// directly in a two-level launch.
    root_launch: Vec<Arc<Worker>>,
    /// Number of children participating in tree launches; typically the
    /// configured thread count minus one.
    multi_level_thread_count: usize,
    /// Whether `init_threads` has configured the pool at all.
    configured: bool,
}

static REGISTRY: Mutex<Registry> = Mutex::new(Registry {
    workers: Vec::new(),
    root_launch: Vec::new(),
    multi_level_thread_count: 0,
    configured: false,
});

/// Serializes the find-a-free-worker critical sections and pool teardown:
/// this is what makes "at most one active tree" a global invariant.
static LAUNCH_MUTEX: Mutex<()> = Mutex::new(());

/// Configures the pool to the machine's logical CPU count if nobody did so
/// explicitly.  The pool is created lazily on first use.
fn ensure_configured() -> CoreResult<()> {
    let configured = REGISTRY.lock().configured;
    if !configured {
        init_threads(num_cpus::get())?;
    }
    Ok(())
}

/// Total number of threads (master included) the pool is sized for, which is
/// also what striped allocations get partitioned into.  Triggers the lazy
/// pool creation when nothing is configured yet.
pub fn thread_count() -> usize {
    let _ = ensure_configured();
    REGISTRY.lock().multi_level_thread_count + 1
}

/// Builds the two-level launch topology for `threadcount` total threads.
/// Returns the list of workers (by number) the master launches directly and
/// the follower list of every worker.  Pure so it can be tested on its own.
fn build_topology(
    threadcount: usize,
    nodes: Option<&[usize]>,
) -> (Vec<usize>, Vec<Vec<usize>>) {
    let mut root: Vec<usize> = Vec::new();
    let mut subs: Vec<Vec<usize>> = vec![Vec::new(); threadcount.saturating_sub(1)];
    if threadcount <= 1 {
        return (root, subs);
    }

    if let Some(nodes) = nodes {
        // Group threads by node; the first thread of each non-root node
        // leads that node, remaining threads of the node follow it.  Extra
        // threads of the master's node are woken by the master directly.
        struct NodeDist {
            node: usize,
            threads: Vec<usize>,
        }
        let mut nodedist: Vec<NodeDist> = Vec::new();
        for t in 0..threadcount {
            let node = nodes.get(t).copied().unwrap_or(0);
            match nodedist.iter_mut().find(|d| d.node == node) {
                Some(dist) => dist.threads.push(t),
                None => nodedist.push(NodeDist { node, threads: vec![t] }),
            }
        }
        for dist in nodedist.iter().skip(1) {
            let leader = dist.threads[0];
            root.push(leader);
            for &follower in &dist.threads[1..] {
                subs[leader - 1].push(follower);
            }
        }
        for &straggler in &nodedist[0].threads[1..] {
            root.push(straggler);
        }
    } else {
        // No placement information: ceil(sqrt(n)) leaders spaced so each
        // leader's follower block roughly matches the leader count.
        let leadercount = (threadcount as f64).sqrt().ceil() as usize;
        let slavestep = threadcount / leadercount;
        let slaveextra = threadcount % leadercount;
        let mut ni = slavestep - 1; // Thread 0 is not in the worker table
        for li in 1..leadercount {
            let nni = ni + slavestep + usize::from(li <= slaveextra);
            root.push(ni + 1);
            for si in ni + 1..nni {
                subs[ni].push(si + 1);
            }
            ni = nni;
        }
        for ni in 1..slavestep {
            root.push(ni);
        }
    }
    (root, subs)
}

/// Ensures the pool holds `threadcount - 1` persistent workers (creating new
/// ones as needed, never destroying), and rebuilds the two-level launch
/// topology used by [ThreadTree::launch_tree].
pub fn init_threads(threadcount: usize) -> CoreResult<()> {
    let threadcount = threadcount.max(1);
    let _launch = LAUNCH_MUTEX.lock();
    let mut registry = REGISTRY.lock();

    let have = registry.workers.len();
    for id in have..threadcount - 1 {
        let worker = Worker::spawn(id + 1)?;
        registry.workers.push(worker);
    }
    registry.multi_level_thread_count = threadcount - 1;
    registry.configured = true;

    // Rebuild the launch lists from scratch.
    registry.root_launch.clear();
    for worker in &registry.workers {
        worker.sub_workers.lock().clear();
    }
    let nodes: Option<Vec<usize>> = if numa::ready() {
        Some((0..threadcount).map(numa::node_of_thread).collect())
    } else {
        None
    };
    let (root, subs) = build_topology(threadcount, nodes.as_deref());
    for number in root {
        let worker = Arc::clone(&registry.workers[number - 1]);
        registry.root_launch.push(worker);
    }
    for (idx, followers) in subs.into_iter().enumerate() {
        if followers.is_empty() {
            continue;
        }
        let list: Vec<Arc<Worker>> = followers
            .iter()
            .map(|&number| Arc::clone(&registry.workers[number - 1]))
            .collect();
        *registry.workers[idx].sub_workers.lock() = list;
    }
    log::debug!(
        "thread pool sized to {} workers, {} root launches",
        registry.workers.len(),
        registry.root_launch.len()
    );
    Ok(())
}

/// Idempotent, reentrancy-guarded teardown of every pool worker.  Also
/// destroys the master's thread-local map.
pub fn end_threads() {
    static GUARD: Mutex<bool> = Mutex::new(false);
    {
        let mut in_process = GUARD.lock();
        if *in_process {
            // Teardown already active somewhere up the call stack.
            return;
        }
        *in_process = true;
    }

    {
        let _launch = LAUNCH_MUTEX.lock();
        let mut registry = REGISTRY.lock();
        for worker in registry.workers.drain(..) {
            worker.shut_down();
        }
        registry.root_launch.clear();
        registry.multi_level_thread_count = 0;
        registry.configured = false;
    }

    ThreadLocalMap::delete_locker();
    *GUARD.lock() = false;
}

// ----------------------------------------------------------------------------
// --- THREAD TREE ------------------------------------------------------------
// ----------------------------------------------------------------------------

/// One launch/join scope.  See the module documentation.
pub struct ThreadTree {
    stop: ThreadControl,
    /// Count of launched, unjoined workers.  Mirrors the stop count, except
    /// it is only touched by the master.
    threads_unjoined: usize,
}

impl Default for ThreadTree {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadTree {
    pub fn new() -> Self {
        ThreadTree { stop: ThreadControl::new(), threads_unjoined: 0 }
    }

    fn handle<'a>(&'a self, job: &'a (dyn ThreadJob + Sync), multilevel: bool) -> JobHandle {
        let ptr: *const (dyn ThreadJob + Sync + 'a) = job;
        // SAFETY: erases the borrow's lifetime into the 'static raw pointer
        // stored in `JobHandle`; the caller (`launch`/`join`) guarantees the
        // referent outlives the launch/join window during which the handle
        // is used by the worker thread.
        let job: *const (dyn ThreadJob + Sync) = unsafe { std::mem::transmute(ptr) };
        JobHandle { job, stop: &self.stop as *const ThreadControl, multilevel }
    }

    /// Launches `job` on one free worker (creating a worker if every
    /// existing one is busy).  Pair with [Self::join].
    pub fn launch(&mut self, job: &(dyn ThreadJob + Sync)) -> CoreResult<()> {
        let _launch = LAUNCH_MUTEX.lock();
        let worker = {
            let mut registry = REGISTRY.lock();
            match registry.workers.iter().find(|w| w.is_idle()) {
                Some(w) => Arc::clone(w),
                None => {
                    let worker = Worker::spawn(registry.workers.len() + 1)?;
                    registry.workers.push(Arc::clone(&worker));
                    worker
                }
            }
        };
        self.threads_unjoined += 1;
        self.stop.lock_and_increment(1);
        worker.run_cmd(self.handle(job, false));
        Ok(())
    }

    /// Joins all workers launched through this tree, transmits held
    /// warnings, and raises any relayed worker error.
    pub fn join(&mut self) -> CoreResult<()> {
        if self.threads_unjoined == 0 {
            if let Some(msg) = relay::check_and_clear() {
                return Err(bad_thread_error(msg));
            }
            return Ok(());
        }
        self.stop.wait_for_zero();
        self.threads_unjoined = 0;

        warn::transmit_message_hold();
        if let Some(msg) = relay::check_and_clear() {
            return Err(bad_thread_error(msg));
        }
        Ok(())
    }

    /// Runs `job` on the master (thread 0), then joins every previously
    /// launched worker, with error handling on both sides.
    pub fn launch_root(&mut self, job: &(dyn ThreadJob + Sync)) -> CoreResult<()> {
        let root_result = catch_unwind(AssertUnwindSafe(|| job.cmd(0)));
        if let Err(payload) = root_result {
            if self.threads_unjoined > 0 {
                // Children first; their failure is secondary to ours.
                let _ = self.join();
            }
            return Err(bad_thread_error(format!(
                "{}\nException thrown in thread 0",
                panic_text(payload)
            )));
        }

        if self.threads_unjoined > 0 {
            self.join()?;
        }
        warn::transmit_message_hold();
        if let Some(msg) = relay::check_and_clear() {
            return Err(bad_thread_error(msg));
        }
        Ok(())
    }

    /// Single call two-level launch: wakes the leader workers, which in turn
    /// wake their followers; runs the job on the master; waits for the whole
    /// crew.  All threads share the one job object.
    pub fn launch_tree(&mut self, job: &(dyn ThreadJob + Sync)) -> CoreResult<()> {
        let _launch = LAUNCH_MUTEX.lock();
        self.launch_tree_inner(job)
    }

    /// [Self::launch_tree] body, for callers already holding the launch
    /// mutex.
    fn launch_tree_inner(&mut self, job: &(dyn ThreadJob + Sync)) -> CoreResult<()> {
        let (roots, count) = {
            let registry = REGISTRY.lock();
            (registry.root_launch.clone(), registry.multi_level_thread_count)
        };
        if count == 0 {
            // No child threads.
            return match catch_unwind(AssertUnwindSafe(|| job.cmd(0))) {
                Ok(()) => Ok(()),
                Err(payload) => Err(bad_thread_error(format!(
                    "{}\nException thrown in thread 0",
                    panic_text(payload)
                ))),
            };
        }

        self.stop.lock_and_set(count as i32);

        let handle = self.handle(job, true);
        for leader in &roots {
            leader.run_cmd(handle);
        }
        let root_result = catch_unwind(AssertUnwindSafe(|| job.cmd(0)));
        if let Err(payload) = &root_result {
            relay::set_error(format!(
                "Error detected in launch_tree\nException thrown in thread 0: {}",
                match payload.downcast_ref::<String>() {
                    Some(s) => s.as_str(),
                    None => payload.downcast_ref::<&str>().copied().unwrap_or("?"),
                }
            ));
        }

        self.stop.wait_for_zero();

        warn::transmit_message_hold();
        if let Some(msg) = relay::check_and_clear() {
            return Err(bad_thread_error(msg));
        }
        Ok(())
    }

    /// Runs `job` on workers `first..=last` inclusive (0 meaning the master;
    /// `None` for `last` meaning the highest existing worker), creating
    /// workers as needed.  Self-joining; blocks until no worker is running.
    pub fn run_on_thread_range(
        &mut self,
        first: usize,
        last: Option<usize>,
        job: &(dyn ThreadJob + Sync),
    ) -> CoreResult<()> {
        warn::transmit_message_hold();
        if let Some(msg) = relay::check_and_clear() {
            return Err(bad_thread_error(msg));
        }

        let _launch = LAUNCH_MUTEX.lock();
        self.join()?;

        let targets: Vec<Arc<Worker>> = {
            let mut registry = REGISTRY.lock();
            while registry.workers.len() < first {
                let worker = Worker::spawn(registry.workers.len() + 1)?;
                registry.workers.push(worker);
            }
            if let Some(last) = last {
                while registry.workers.len() < last {
                    let worker = Worker::spawn(registry.workers.len() + 1)?;
                    registry.workers.push(worker);
                }
            }
            let last = last.unwrap_or(registry.workers.len());
            (first.max(1)..=last)
                .filter_map(|number| registry.workers.get(number - 1).cloned())
                .collect()
        };

        for worker in &targets {
            self.threads_unjoined += 1;
            self.stop.lock_and_increment(1);
            worker.run_cmd(self.handle(job, false));
        }

        if first == 0 {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| job.cmd(0))) {
                let _ = self.join();
                return Err(bad_thread_error(format!(
                    "{}\nException thrown in thread 0",
                    panic_text(payload)
                )));
            }
        }

        self.join()?;

        warn::transmit_message_hold();
        if let Some(msg) = relay::check_and_clear() {
            return Err(bad_thread_error(msg));
        }
        Ok(())
    }
}

impl Drop for ThreadTree {
    fn drop(&mut self) {
        // Reached with live workers only when the master unwound mid-tree;
        // poll for stragglers rather than hang on a barrier that may never
        // drain.
        if self.threads_unjoined > 0 {
            while self.threads_unjoined > 0 && self.stop.count() > 0 {
                self.stop.wait_for_change(Duration::from_millis(10));
                self.threads_unjoined -= 1;
            }
            self.threads_unjoined = 0;
        }
        let refcount = self.stop.count();
        if refcount > 0 {
            log::warn!("thread tree dropped with {refcount} unjoined workers");
        }
    }
}

// ----------------------------------------------------------------------------
// --- POOL-WIDE SERVICES -----------------------------------------------------
// ----------------------------------------------------------------------------

struct DeleteLockerItemJob<'a> {
    name: &'a str,
}
impl ThreadJob for DeleteLockerItemJob<'_> {
    fn cmd(&self, _worker_id: usize) {
        if ThreadLocalMap::contains(self.name) {
            let _ = ThreadLocalMap::delete_item(self.name);
        }
    }
}

/// Removes the named thread-local item from every thread of the pool
/// (master included).  No error if the name is absent anywhere.
pub fn delete_locker_item(name: &str) -> CoreResult<()> {
    let job = DeleteLockerItemJob { name };
    ThreadTree::new().run_on_thread_range(0, None, &job)
}

/// Runs `body(worker_id, start, stop)` in parallel over the index ranges of
/// `arr`, handing out work through a [JobBasket] seeded from the stripe
/// layout so each worker touches the memory it first-touched.  `record_size`
/// quantizes chunk boundaries for loops that consume tuples.
pub fn run_threaded<T, F>(arr: &StripedArray<T>, record_size: usize, body: F) -> CoreResult<()>
where
    T: StripedElement,
    F: Fn(usize, usize, usize) + Sync,
{
    ensure_configured()?;
    // Holding the launch mutex from basket seeding through the join keeps
    // the basket's worker count consistent with the tree topology even if
    // another thread re-sizes the pool concurrently.
    let _launch = LAUNCH_MUTEX.lock();
    let count = REGISTRY.lock().multi_level_thread_count + 1;
    let mut basket = JobBasket::new();
    basket.init(count, arr, record_size)?;
    let job = move |worker_id: usize| {
        while let Some((start, stop)) = basket.take_job(worker_id) {
            body(worker_id, start, stop);
        }
    };
    ThreadTree::new().launch_tree_inner(&job)
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_pool {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountJob<'a> {
        hits: &'a AtomicUsize,
    }
    impl ThreadJob for CountJob<'_> {
        fn cmd(&self, _worker_id: usize) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn topology_sqrt_covers_every_worker_once() {
        for n in 2..=17 {
            let (root, subs) = build_topology(n, None);
            let mut seen = vec![false; n];
            seen[0] = true; // Master launches itself
            for &r in &root {
                assert!(!seen[r], "worker {r} launched twice (n={n})");
                seen[r] = true;
            }
            for list in &subs {
                for &s in list {
                    assert!(!seen[s], "worker {s} launched twice (n={n})");
                    seen[s] = true;
                }
            }
            assert!(seen.iter().all(|&b| b), "not all workers launched (n={n})");
        }
    }

    #[test]
    fn topology_numa_groups_by_node() {
        // Threads 0,1 on node 0; 2,3 on node 1; 4,5 on node 2.
        let nodes = [0, 0, 1, 1, 2, 2];
        let (root, subs) = build_topology(6, Some(&nodes));
        // Leaders of nodes 1 and 2, plus thread 1 from the master's node.
        assert_eq!(vec![2, 4, 1], root);
        assert_eq!(vec![3], subs[1]); // Worker 2 leads worker 3
        assert_eq!(vec![5], subs[3]); // Worker 4 leads worker 5
        assert!(subs[0].is_empty());
    }

    #[test]
    fn every_launch_mode_runs_each_worker_exactly_once() {
        let _guard = crate::test_support::serial();
        init_threads(4).unwrap();

        // launch: three children + join
        let hits = AtomicUsize::new(0);
        let job = CountJob { hits: &hits };
        let mut tree = ThreadTree::new();
        for _ in 0..3 {
            tree.launch(&job).unwrap();
        }
        tree.join().unwrap();
        assert_eq!(3, hits.load(Ordering::SeqCst));

        // launch + launch_root: children plus master
        let hits = AtomicUsize::new(0);
        let job = CountJob { hits: &hits };
        let mut tree = ThreadTree::new();
        for _ in 0..3 {
            tree.launch(&job).unwrap();
        }
        tree.launch_root(&job).unwrap();
        assert_eq!(4, hits.load(Ordering::SeqCst));

        // launch_tree: all four threads in one call
        let hits = AtomicUsize::new(0);
        let job = CountJob { hits: &hits };
        ThreadTree::new().launch_tree(&job).unwrap();
        assert_eq!(4, hits.load(Ordering::SeqCst));

        // run_on_thread_range over everything that exists (the flat launches
        // above may have grown the pool past the configured count)
        let expected = REGISTRY.lock().workers.len() + 1;
        let hits = AtomicUsize::new(0);
        let job = CountJob { hits: &hits };
        ThreadTree::new().run_on_thread_range(0, None, &job).unwrap();
        assert_eq!(expected, hits.load(Ordering::SeqCst));
    }

    #[test]
    fn worker_panic_surfaces_as_bad_thread_at_join() {
        let _guard = crate::test_support::serial();
        init_threads(3).unwrap();

        struct Exploder;
        impl ThreadJob for Exploder {
            fn cmd(&self, worker_id: usize) {
                if worker_id == 1 {
                    panic!("deliberate failure");
                }
            }
        }
        let err = ThreadTree::new().launch_tree(&Exploder).unwrap_err();
        assert_eq!(ErrorKind::BadThread, err.kind);
        assert!(err.msg.contains("thread 1"), "{}", err.msg);
        assert!(err.msg.contains("deliberate failure"));
    }

    #[test]
    fn blocked_sum_over_a_range_of_workers() {
        let _guard = crate::test_support::serial();
        init_threads(4).unwrap();

        // Sum 0..=100000 split in blocks of ceil(100001/12) across the crew.
        let n = 100_001usize;
        let block = n.div_ceil(12);
        let next = AtomicUsize::new(0);
        let total = AtomicUsize::new(0);
        let job = |_worker: usize| loop {
            let start = next.fetch_add(block, Ordering::SeqCst);
            if start >= n {
                break;
            }
            let stop = (start + block).min(n);
            let mut acc = 0usize;
            for i in start..stop {
                acc += i;
            }
            total.fetch_add(acc, Ordering::SeqCst);
        };
        ThreadTree::new().launch_tree(&job).unwrap();
        assert_eq!(5_000_050_000usize, total.load(Ordering::SeqCst));
    }

    #[test]
    fn delete_locker_item_reaches_every_worker() {
        let _guard = crate::test_support::serial();
        init_threads(3).unwrap();

        struct Plant;
        impl ThreadJob for Plant {
            fn cmd(&self, worker_id: usize) {
                let _ = ThreadLocalMap::add_item("plant", Box::new(worker_id));
            }
        }
        ThreadTree::new().run_on_thread_range(0, None, &Plant).unwrap();
        assert!(ThreadLocalMap::contains("plant"));

        delete_locker_item("plant").unwrap();
        assert!(!ThreadLocalMap::contains("plant"));

        struct Check;
        impl ThreadJob for Check {
            fn cmd(&self, _worker_id: usize) {
                assert!(!ThreadLocalMap::contains("plant"));
            }
        }
        ThreadTree::new().run_on_thread_range(0, None, &Check).unwrap();
    }
}
