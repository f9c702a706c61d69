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

//! A per-cell quantity over a mesh, backed by striped storage so parallel
//! passes stay node local.  This is the array type energy terms fill and the
//! minimizer reduces.

use crate::abstraction::Mesh;
use crate::CoreResult;

use super::striped::{StripedArray, StripedElement};

/// Mesh-sized typed array.  Indexing follows the mesh's cell numbering.
#[derive(Debug, Clone, Default)]
pub struct MeshValue<T: StripedElement> {
    arr: StripedArray<T>,
}

impl<T: StripedElement> MeshValue<T> {
    pub const fn new() -> Self {
        MeshValue { arr: StripedArray::new() }
    }

    pub fn with_size(size: usize) -> CoreResult<Self> {
        let mut value = MeshValue::new();
        value.arr.set_size(size)?;
        Ok(value)
    }

    /// Sizes the buffer to the mesh, reallocating (and zeroing) only when
    /// the cell count changed.
    pub fn adjust_size(&mut self, mesh: &dyn Mesh) -> CoreResult<()> {
        self.arr.set_size(mesh.size())
    }

    pub fn size(&self) -> usize {
        self.arr.size()
    }

    pub fn is_empty(&self) -> bool {
        self.arr.size() == 0
    }

    pub fn as_slice(&self) -> &[T] {
        self.arr.as_slice()
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        self.arr.as_mut_slice()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.arr.as_slice().iter()
    }

    /// Sets every element to `value` (serially; sizing already bound the
    /// pages where they belong).
    pub fn fill(&mut self, value: T) {
        for slot in self.arr.as_mut_slice() {
            *slot = value;
        }
    }

    /// The backing striped array, for seeding job baskets.
    pub fn array(&self) -> &StripedArray<T> {
        &self.arr
    }
}

/// Shared write handle over a slice for parallel fills.
///
/// The pool's workers each own a disjoint index range of the target, but a
/// shared borrow cannot express that to the compiler; this wrapper carries
/// the raw base pointer across the closure boundary instead.
pub struct ParallelWriter<T> {
    ptr: *mut T,
    len: usize,
}
unsafe impl<T: Send> Send for ParallelWriter<T> {}
unsafe impl<T: Send> Sync for ParallelWriter<T> {}

impl<T> ParallelWriter<T> {
    pub fn new(slice: &mut [T]) -> Self {
        ParallelWriter { ptr: slice.as_mut_ptr(), len: slice.len() }
    }

    /// Stores `value` at `index`.
    ///
    /// # Safety
    /// Concurrent callers must write disjoint index sets, and the slice the
    /// writer was built from must outlive every write (which holds whenever
    /// the writer only lives across one launch/join pair).
    #[inline]
    pub unsafe fn write(&self, index: usize, value: T) {
        debug_assert!(index < self.len);
        unsafe { *self.ptr.add(index) = value };
    }

    /// Mutable access to the element at `index`.
    ///
    /// # Safety
    /// Same contract as [Self::write].
    #[inline]
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut(&self, index: usize) -> &mut T {
        debug_assert!(index < self.len);
        unsafe { &mut *self.ptr.add(index) }
    }
}

impl<T: StripedElement> std::ops::Index<usize> for MeshValue<T> {
    type Output = T;
    #[inline]
    fn index(&self, index: usize) -> &T {
        &self.arr.as_slice()[index]
    }
}
impl<T: StripedElement> std::ops::IndexMut<usize> for MeshValue<T> {
    #[inline]
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.arr.as_mut_slice()[index]
    }
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_mesh_value {
    use super::*;

    #[test]
    fn sizing_and_fill() {
        let mut v: MeshValue<f64> = MeshValue::with_size(16).unwrap();
        assert_eq!(16, v.size());
        assert!(v.iter().all(|&x| x == 0.0));
        v.fill(2.5);
        assert_eq!(2.5, v[7]);
        let w = v.clone();
        assert_eq!(2.5, w[15]);
    }
}
