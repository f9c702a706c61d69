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

//! The concrete machinery behind the abstractions: extended precision
//! arithmetic, striped storage with job baskets, the persistent worker
//! pool, and the conjugate gradient evolver itself.

pub mod cg;
pub mod storage;
pub mod threads;
pub mod xp;

pub use cg::{CgEvolver, CgParams, CgParamsBuilder, ConjugateMethod, PreconditionerType};
pub use storage::{JobBasket, MeshValue, StripedArray, StripedElement};
pub use threads::{
    current_worker_id, delete_locker_item, end_threads, init_threads, run_threaded,
    thread_count, ThreadControl, ThreadLocalMap, ThreadTree, ThrowawayWorker,
};
pub use xp::{Accumulator, BigFloatVec, DoubleDouble};
