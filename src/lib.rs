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

//! # SPINMIN
//! Spinmin is a deterministic, parallel minimizer for scalar energy
//! functionals over unit-vector fields discretized on a regular three
//! dimensional mesh.  You describe your energy as a set of [EnergyTerm]s
//! contributing density and effective field per cell; the [CgEvolver] then
//! walks the field downhill with a preconditioned nonlinear conjugate
//! gradient line search, one `try_step` at a time, until the torque
//! `m x H x m` vanishes.
//!
//! Three pieces of infrastructure make the minimizer both fast and
//! reproducible, and are usable on their own:
//!
//! * [DoubleDouble] and [Accumulator] provide roughly 107 bits of mantissa
//!   with correctly rounded basic operations and compensated summation.
//!   Every long reduction in the minimizer runs compensated, which is why
//!   results agree to a few ulps no matter how many threads participate or
//!   how the scheduler interleaves them.
//! * [StripedArray] partitions every large buffer into per-worker stripes
//!   whose pages are first-touched by the worker that will process them, so
//!   on a NUMA machine each worker computes against local memory.
//! * A persistent worker pool ([init_threads], [ThreadTree]) hands out
//!   stripe-aligned work through [JobBasket]s, with a two-level launch tree,
//!   per-worker scratch maps, and an error relay that turns worker panics
//!   into plain errors on the caller.
//!
//! ## Quick example
//! Minimizing starts from a state snapshot and iterates `try_step`:
//! ```ignore
//! let mut evolver = CgEvolver::new(CgParamsBuilder::default().build()?, terms);
//! let driver = SimpleDriver;
//! let mut state: StateKey = initial_state;
//! while state.get_derived_data(derived::MAX_MXHXM).map_or(true, |t| t > 1e-10) {
//!     state = evolver.try_step(&driver, &state)?;
//! }
//! ```
//! Each call performs at most one energy evaluation: it either anchors a new
//! search direction, widens the bracket around the line minimum, or shrinks
//! it, returning the best state seen so far.

mod common;

pub mod abstraction;
pub mod error;
pub mod implementation;
pub mod warn;

pub use abstraction::*;
pub use common::*;
pub use error::{CoreError, CoreResult, ErrorKind};
pub use implementation::*;

#[cfg(test)]
pub(crate) mod test_support {
    //! Cross-module serialization for tests that drive process-wide state:
    //! the worker pool, the error relay, and the warning hold queue.
    use parking_lot::{Mutex, MutexGuard};

    static LOCK: Mutex<()> = Mutex::new(());

    pub fn serial() -> MutexGuard<'static, ()> {
        LOCK.lock()
    }
}
