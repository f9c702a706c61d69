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

//! Extended precision arithmetic: the [DoubleDouble] scalar, the compensated
//! [Accumulator], and the error-free kernels they are built from.  Every long
//! accumulation in the minimizer goes through this module, which is what
//! makes the parallel reductions independent of thread count and schedule.

pub mod accum;
pub mod core;
pub mod doubledouble;
pub mod hexfloat;
pub mod transcendental;
pub mod triple;

pub use accum::Accumulator;
pub use core::{frexp, ordered_two_sum, split, square_prod, two_diff, two_prod, two_sum, xp_ldexp};
pub use doubledouble::{BigFloatVec, DoubleDouble};
pub use hexfloat::{format_hex_f64, hex_float_width, scan_hex_f64};
