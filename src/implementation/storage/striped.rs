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

//! A typed contiguous buffer partitioned into per-worker stripes, each
//! first-touched by the worker that will own it.
//!
//! On a NUMA machine with node-local allocation policy, the page a stripe
//! lives on is bound to the memory node of the thread that first writes it;
//! striping the initial zeroing therefore pins each worker's share of the
//! array to its own node.  On a uniform-memory machine the same layout still
//! buys cache-line and page alignment of the per-worker shares.  Either way
//! the buffer start is page aligned once the allocation reaches a page, and
//! cache-line aligned below that.

use std::alloc::Layout;

use crate::implementation::threads::pool;
use crate::{core_err, CoreResult, Vector3};

/// Block granularity of stripe boundaries: the system page size.
pub const STRIPE_BLOCK_SIZE: usize = 4096;
/// Alignment used for sub-page allocations.
pub const CACHE_LINE_SIZE: usize = 64;

/// Marker for element types the striped storage can hold.
///
/// # Safety
/// Implementors assert that a value whose bytes are all zero is a valid
/// value of the type, which is what lets the parallel first-touch zeroing
/// double as element initialization.
pub unsafe trait StripedElement: Copy + Send + Sync + 'static {}

unsafe impl StripedElement for u8 {}
unsafe impl StripedElement for i32 {}
unsafe impl StripedElement for u32 {}
unsafe impl StripedElement for i64 {}
unsafe impl StripedElement for u64 {}
unsafe impl StripedElement for usize {}
unsafe impl StripedElement for f32 {}
unsafe impl StripedElement for f64 {}
unsafe impl StripedElement for Vector3 {}
unsafe impl<T: StripedElement, const N: usize> StripedElement for [T; N] {}

/// The striped array.  See the module documentation.
pub struct StripedArray<T: StripedElement> {
    ptr: *mut T,
    size: usize,
    layout: Option<Layout>,
    /// Stripe boundaries in bytes; `strip_pos[0] == 0` and the last entry is
    /// the full byte size.  The vector holds stripe-count + 1 entries.
    strip_pos: Vec<usize>,
}

unsafe impl<T: StripedElement> Send for StripedArray<T> {}
unsafe impl<T: StripedElement> Sync for StripedArray<T> {}

// Helper so raw byte ranges can cross into the zeroing threads.
#[derive(Clone, Copy)]
struct SendPtr(*mut u8);
unsafe impl Send for SendPtr {}

impl<T: StripedElement> StripedArray<T> {
    pub const fn new() -> Self {
        StripedArray { ptr: std::ptr::null_mut(), size: 0, layout: None, strip_pos: Vec::new() }
    }

    /// Releases the storage and forgets the stripe plan.
    pub fn free(&mut self) {
        if let Some(layout) = self.layout.take() {
            unsafe { std::alloc::dealloc(self.ptr as *mut u8, layout) };
        }
        self.ptr = std::ptr::null_mut();
        self.size = 0;
        self.strip_pos.clear();
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn strip_count(&self) -> usize {
        self.strip_pos.len().saturating_sub(1)
    }

    pub fn as_slice(&self) -> &[T] {
        if self.size == 0 {
            return &[];
        }
        unsafe { std::slice::from_raw_parts(self.ptr, self.size) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        if self.size == 0 {
            return &mut [];
        }
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.size) }
    }

    /// Resizes to `newsize` elements: frees existing storage, re-plans the
    /// stripes against the current worker count, allocates aligned, and runs
    /// the parallel first-touch zeroing.  All elements read as zero after.
    pub fn set_size(&mut self, newsize: usize) -> CoreResult<()> {
        if newsize == self.size {
            return Ok(()); // Nothing to do
        }
        self.free();
        if newsize == 0 {
            return Ok(());
        }

        let elem = std::mem::size_of::<T>();
        let fullsize = newsize
            .checked_mul(elem)
            .ok_or_else(|| {
                core_err!(
                    BadParameter,
                    "allocation request too big: {newsize} items of size {elem} \
                     (index overflow)"
                )
            })?;

        // Plan the stripes: one per worker, each a whole number of blocks,
        // leftovers distributed one block each to the leading stripes.
        let strip_count = pool::thread_count().max(1);
        let strip_size;
        let augment_count;
        if strip_count > 1 && fullsize > STRIPE_BLOCK_SIZE {
            let mut nominal = (newsize / strip_count) * elem;
            nominal -= nominal % STRIPE_BLOCK_SIZE;
            strip_size = nominal;
            let leftovers = fullsize - strip_count * strip_size;
            augment_count = leftovers / STRIPE_BLOCK_SIZE;
        } else {
            // Everything lands in the first stripe.
            strip_size = fullsize;
            augment_count = 0;
        }

        self.strip_pos.clear();
        self.strip_pos.reserve(strip_count + 1);
        for istrip in 0..strip_count {
            let pos = if istrip < augment_count {
                istrip * (strip_size + STRIPE_BLOCK_SIZE)
            } else {
                istrip * strip_size + augment_count * STRIPE_BLOCK_SIZE
            };
            // A small array can be eaten whole by the first stripes, leaving
            // the trailing ones empty.
            self.strip_pos.push(pos.min(fullsize));
        }
        self.strip_pos.push(fullsize);

        let alignment = if fullsize >= STRIPE_BLOCK_SIZE {
            STRIPE_BLOCK_SIZE
        } else {
            CACHE_LINE_SIZE
        }
        .max(std::mem::align_of::<T>());
        let layout = Layout::from_size_align(fullsize, alignment)
            .map_err(|e| core_err!(BadParameter, "invalid allocation layout: {e}"))?;

        let base = unsafe { std::alloc::alloc(layout) };
        if base.is_null() {
            self.strip_pos.clear();
            return Err(core_err!(
                NoMem,
                "failure to allocate memory block of {fullsize} bytes"
            ));
        }

        // First-touch zeroing: one short-lived thread per stripe, so that
        // under a node-local memory policy each stripe's pages bind to the
        // node of the worker that will process it.
        std::thread::scope(|scope| {
            for istrip in 0..strip_count {
                let start = self.strip_pos[istrip];
                let stop = self.strip_pos[istrip + 1];
                if stop <= start {
                    continue;
                }
                let chunk = SendPtr(unsafe { base.add(start) });
                scope.spawn(move || {
                    let chunk = chunk;
                    let SendPtr(ptr) = chunk;
                    unsafe { std::ptr::write_bytes(ptr, 0u8, stop - start) };
                });
            }
        });

        self.ptr = base as *mut T;
        self.size = newsize;
        self.layout = Some(layout);
        Ok(())
    }

    /// Element range `[start, stop)` owned by the given stripe.  When the
    /// element size does not divide the stripe size, a stripe owns the
    /// elements whose first byte lies inside its byte span; the last stripe
    /// additionally absorbs any remainder.
    pub fn strip_position(&self, strip_number: usize) -> (usize, usize) {
        assert!(strip_number < self.strip_count());
        let elem = std::mem::size_of::<T>();
        let mystart = self.strip_pos[strip_number];
        let mystop = self.strip_pos[strip_number + 1];

        let start = mystart.div_ceil(elem);
        let mut stop = self.size;
        if strip_number < self.strip_count() - 1 {
            let test = mystop.div_ceil(elem);
            if test < stop {
                stop = test;
            }
        }
        if start > stop {
            // Happens when the array is too small to give every stripe a
            // piece; present an empty range rather than a reversed one.
            return (stop, stop);
        }
        (start, stop)
    }
}

impl<T: StripedElement> Default for StripedArray<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: StripedElement> Drop for StripedArray<T> {
    fn drop(&mut self) {
        self.free();
    }
}

impl<T: StripedElement> Clone for StripedArray<T> {
    fn clone(&self) -> Self {
        let mut copy = StripedArray::new();
        if self.size > 0 {
            copy.set_size(self.size).expect("clone of a live array cannot overflow");
            copy.as_mut_slice().copy_from_slice(self.as_slice());
        }
        copy
    }
}

impl<T: StripedElement> std::ops::Index<usize> for StripedArray<T> {
    type Output = T;
    #[inline]
    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}
impl<T: StripedElement> std::ops::IndexMut<usize> for StripedArray<T> {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.as_mut_slice()[index]
    }
}

impl<T: StripedElement> std::fmt::Debug for StripedArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StripedArray")
            .field("size", &self.size)
            .field("strip_count", &self.strip_count())
            .finish()
    }
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_striped {
    use super::*;

    #[test]
    fn elements_read_zero_after_set_size() {
        let mut arr: StripedArray<f64> = StripedArray::new();
        arr.set_size(10_000).unwrap();
        assert_eq!(10_000, arr.size());
        assert!(arr.as_slice().iter().all(|&v| v == 0.0));
    }

    #[test]
    fn stripes_partition_the_index_range() {
        let mut arr: StripedArray<f64> = StripedArray::new();
        arr.set_size(100_000).unwrap();

        let mut expected_start = 0usize;
        for i in 0..arr.strip_count() {
            let (start, stop) = arr.strip_position(i);
            assert_eq!(expected_start, start, "stripe {i} does not continue the cover");
            assert!(stop >= start);
            expected_start = stop;
        }
        assert_eq!(arr.size(), expected_start);
    }

    #[test]
    fn stripe_boundaries_are_block_multiples() {
        let mut arr: StripedArray<f64> = StripedArray::new();
        arr.set_size(100_000).unwrap();
        // Byte offsets are non-decreasing, block aligned except the final
        // entry, and sum to the full byte size.
        let n = arr.strip_pos.len();
        assert_eq!(0, arr.strip_pos[0]);
        assert_eq!(100_000 * std::mem::size_of::<f64>(), arr.strip_pos[n - 1]);
        for w in arr.strip_pos.windows(2) {
            assert!(w[0] <= w[1]);
        }
        for &pos in &arr.strip_pos[..n - 1] {
            assert_eq!(0, pos % STRIPE_BLOCK_SIZE, "stripe start not block aligned");
        }
    }

    #[test]
    fn small_arrays_use_cache_line_alignment() {
        let mut arr: StripedArray<f64> = StripedArray::new();
        arr.set_size(4).unwrap();
        let addr = arr.as_slice().as_ptr() as usize;
        assert_eq!(0, addr % CACHE_LINE_SIZE);
        // Everything lands in stripe 0.
        assert_eq!((0, 4), arr.strip_position(0));
    }

    #[test]
    fn large_arrays_are_page_aligned() {
        let mut arr: StripedArray<u8> = StripedArray::new();
        arr.set_size(3 * STRIPE_BLOCK_SIZE).unwrap();
        let addr = arr.as_slice().as_ptr() as usize;
        assert_eq!(0, addr % STRIPE_BLOCK_SIZE);
    }

    #[test]
    fn overflow_is_a_bad_parameter() {
        let mut arr: StripedArray<f64> = StripedArray::new();
        let err = arr.set_size(usize::MAX / 4).unwrap_err();
        assert_eq!(crate::ErrorKind::BadParameter, err.kind);
    }

    #[test]
    fn resize_and_free_round_trip() {
        let mut arr: StripedArray<Vector3> = StripedArray::new();
        arr.set_size(100).unwrap();
        arr[5] = Vector3::new(1.0, 2.0, 3.0);
        let copy = arr.clone();
        assert_eq!(Vector3::new(1.0, 2.0, 3.0), copy[5]);

        arr.set_size(10).unwrap();
        assert_eq!(10, arr.size());
        assert_eq!(Vector3::ZERO, arr[5]); // Fresh storage, re-zeroed

        arr.free();
        assert_eq!(0, arr.size());
        assert_eq!(0, arr.strip_count());
    }
}
