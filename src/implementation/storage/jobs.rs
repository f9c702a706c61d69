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

//! Dynamic job handout aligned to stripe boundaries.
//!
//! A [JobBasket] holds one index-range bin per worker, seeded from the
//! stripe layout of the array being processed so that each worker reads and
//! writes the memory it first-touched.  When the bins follow the stripes,
//! node locality is preserved for the whole pass; that is also why a worker
//! whose bin drains never steals from another bin: a stolen range would be
//! remote memory, typically costing more than the idle wait saves.
//!
//! When a record groups several consecutive elements (say the three
//! components of a vector split over separate scalar arrays), chunk
//! boundaries are snapped to record multiples so unrolled consumers never
//! face a partial tuple at a seam.

use parking_lot::Mutex;

use crate::{core_err, CoreResult};

use super::striped::{StripedArray, StripedElement};
use crate::implementation::threads::numa;

#[derive(Debug)]
struct BinState {
    start: isize,
    stop: isize,
    all_done: bool,
}

/// Per-worker job bins.  See the module documentation.
#[derive(Debug, Default)]
pub struct JobBasket {
    bins: Vec<Mutex<BinState>>,
}

impl JobBasket {
    pub fn new() -> Self {
        JobBasket { bins: Vec::new() }
    }

    /// Number of bins (the worker count used at seeding).
    pub fn bin_count(&self) -> usize {
        self.bins.len()
    }

    /// Seeds the basket for `worker_count` workers over the index range of
    /// `arr`.  Each job handed out will be an integral multiple of
    /// `record_size` elements, except possibly the final one.
    pub fn init<T: StripedElement>(
        &mut self,
        worker_count: usize,
        arr: &StripedArray<T>,
        record_size: usize,
    ) -> CoreResult<()> {
        let record_size = record_size.max(1);
        let worker_count = worker_count.max(1);

        self.bins.clear();
        self.bins.reserve(worker_count);

        let strip_count = arr.strip_count();
        if numa::ready() && worker_count < strip_count {
            return Err(core_err!(
                BadCode,
                "thread count {worker_count} is smaller than the array \
                 split count {strip_count}"
            ));
        }

        let arrsize = arr.size() as isize;
        let mut ranges: Vec<(isize, isize)> = Vec::with_capacity(worker_count);
        if worker_count < strip_count {
            // Without node binding in play, just split the work evenly.
            let blocksize = arrsize / worker_count as isize;
            let fudgesize = arrsize - blocksize * worker_count as isize;
            let mut fencepole = 0;
            for i in 0..worker_count {
                let adj = blocksize + if (i as isize) < fudgesize { 1 } else { 0 };
                ranges.push((fencepole, fencepole + adj));
                fencepole += adj;
            }
        } else {
            // Jobs are exactly the stripes; surplus workers get null jobs.
            for i in 0..strip_count {
                let (start, stop) = arr.strip_position(i);
                ranges.push((start as isize, stop as isize));
            }
            for _ in strip_count..worker_count {
                ranges.push((arrsize, arrsize));
            }
        }
        debug_assert!(ranges[0].0 == 0 || arrsize == 0);
        debug_assert!(ranges[worker_count - 1].1 == arrsize);

        if record_size > 1 {
            // Snap boundaries to record multiples.  The stop of the final
            // job is never moved.
            let record = record_size as isize;
            let mut fencepole = ranges[0].0;
            for i in 1..worker_count {
                let mut jobsize = (ranges[i].0 - fencepole).max(0);
                let adj = jobsize % record;
                if adj != 0 {
                    if adj < record / 2 && (i > 1 || jobsize > adj) {
                        // Round down, unless that would leave worker 0 with
                        // a null job: some callers assume worker 0 always
                        // has at least one record.
                        jobsize -= adj;
                    } else {
                        jobsize += record - adj;
                    }
                }
                fencepole += jobsize;
                if fencepole > arrsize {
                    fencepole = arrsize;
                }
                ranges[i].0 = fencepole;
            }
            for i in 0..worker_count - 1 {
                ranges[i].1 = ranges[i + 1].0;
            }
        }

        for (start, stop) in ranges {
            if start < stop {
                self.bins.push(Mutex::new(BinState { start, stop, all_done: false }));
            } else {
                self.bins.push(Mutex::new(BinState { start: -1, stop: -1, all_done: true }));
            }
        }
        Ok(())
    }

    /// Hands the full remaining range of the caller's bin out and empties
    /// the bin.  `None` once the bin is exhausted; there is no reassignment
    /// across bins.
    pub fn take_job(&self, worker_id: usize) -> Option<(usize, usize)> {
        let bin = self.bins.get(worker_id)?;
        let (start, stop, fini) = {
            let mut state = bin.lock();
            let start = state.start;
            let stop = state.stop;
            state.start = stop;
            (start, stop, state.all_done)
        };
        if start < stop {
            return Some((start as usize, stop as usize));
        }
        if !fini {
            bin.lock().all_done = true;
        }
        None
    }

    /// Re-arms every bin whose seeded range was non-trivial.
    pub fn reset(&mut self) {
        for bin in &self.bins {
            let mut state = bin.lock();
            state.all_done = state.start >= state.stop;
        }
    }
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_jobs {
    use super::*;

    fn seeded(size: usize, workers: usize, record: usize) -> JobBasket {
        let mut arr: StripedArray<f64> = StripedArray::new();
        arr.set_size(size).unwrap();
        let mut basket = JobBasket::new();
        basket.init(workers, &arr, record).unwrap();
        basket
    }

    #[test]
    fn jobs_cover_the_range_exactly_and_disjointly() {
        for (size, workers, record) in
            [(1000usize, 4usize, 1usize), (1000, 4, 3), (17, 5, 1), (100_001, 12, 3), (5, 9, 2)]
        {
            let basket = seeded(size, workers, record);
            let mut covered = vec![false; size];
            for w in 0..workers {
                while let Some((start, stop)) = basket.take_job(w) {
                    for slot in &mut covered[start..stop] {
                        assert!(!*slot, "index covered twice");
                        *slot = true;
                    }
                }
            }
            assert!(covered.iter().all(|&b| b), "cover has holes ({size}/{workers}/{record})");
        }
    }

    #[test]
    fn non_final_jobs_are_record_multiples() {
        let basket = seeded(100_001, 8, 3);
        let mut jobs = Vec::new();
        for w in 0..8 {
            while let Some(job) = basket.take_job(w) {
                jobs.push(job);
            }
        }
        jobs.sort_unstable();
        for &(start, stop) in &jobs[..jobs.len() - 1] {
            assert_eq!(0, (stop - start) % 3, "job [{start},{stop}) not a record multiple");
        }
    }

    #[test]
    fn worker_zero_always_has_work() {
        // Tiny array, large record: the snapping must not starve worker 0.
        let basket = seeded(4, 4, 8);
        let first = basket.take_job(0);
        assert!(first.is_some());
        assert_eq!((0, 4), first.unwrap());
    }

    #[test]
    fn bins_drain_exactly_once() {
        let basket = seeded(100, 2, 1);
        assert!(basket.take_job(0).is_some());
        assert!(basket.take_job(0).is_none()); // Bin now empty
        assert!(basket.take_job(0).is_none()); // And stays empty
        assert!(basket.take_job(7).is_none()); // Unknown workers get nothing
    }

    #[test]
    fn surplus_workers_get_null_jobs() {
        let mut arr: StripedArray<f64> = StripedArray::new();
        arr.set_size(64).unwrap();
        let workers = arr.strip_count() + 3;
        let mut basket = JobBasket::new();
        basket.init(workers, &arr, 1).unwrap();
        // The trailing workers were seeded empty.
        assert!(basket.take_job(workers - 1).is_none());
        assert!(basket.take_job(workers - 2).is_none());
    }
}
