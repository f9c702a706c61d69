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

//! The contract between the thread pool and the work it runs.

/// A unit of parallel work.
///
/// One job object is shared by every thread of a launch; `cmd` is invoked
/// once per participating worker with that worker's number (0 is the
/// master).  All the job's data travels inside the object itself, so
/// anything written concurrently must either be sharded by worker number or
/// carry its own synchronization.
pub trait ThreadJob: Sync {
    /// The work.  A panic escaping this call is caught by the pool,
    /// recorded with the worker number attached, and re-raised on the
    /// master at the next join.
    fn cmd(&self, worker_id: usize);
}

/// Closures are jobs; this is the form nearly all internal parallel loops
/// take.
impl<F> ThreadJob for F
where
    F: Fn(usize) + Sync,
{
    fn cmd(&self, worker_id: usize) {
        self(worker_id)
    }
}
