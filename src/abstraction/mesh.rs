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

//! The mesh contract consumed by the minimizer, plus the one concrete mesh
//! everything regular lives on.

use std::sync::atomic::{AtomicU64, Ordering};

/// What the minimizer needs to know about the discretization.  The `id` is a
/// process-unique stamp: a change of id forces the minimizer to rebuild its
/// mesh-derived caches (preconditioner, scaling arrays).
pub trait Mesh: Send + Sync {
    /// Process-unique identity of this mesh instance.
    fn id(&self) -> u64;
    /// Number of cells.
    fn size(&self) -> usize;
    /// Volume of one cell.
    fn volume(&self, index: usize) -> f64;
    /// Volume of the whole discretized region.
    fn total_volume(&self) -> f64;
    /// `Some(v)` when every cell has the same volume `v`; lets reductions
    /// hoist the volume factor out of their inner loops.
    fn has_uniform_cell_volumes(&self) -> Option<f64>;
}

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(1);

/// A regular three dimensional mesh with identical rectangular cells,
/// indexed x fastest and z slowest.
#[derive(Debug)]
pub struct RectangularMesh {
    id: u64,
    counts: (usize, usize, usize),
    cell_volume: f64,
}

impl RectangularMesh {
    /// A mesh of `nx * ny * nz` cells of dimensions `dx * dy * dz`.
    pub fn new(counts: (usize, usize, usize), cellsize: (f64, f64, f64)) -> Self {
        RectangularMesh {
            id: NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed),
            counts,
            cell_volume: cellsize.0 * cellsize.1 * cellsize.2,
        }
    }

    /// Cell counts along x, y, z.
    pub fn counts(&self) -> (usize, usize, usize) {
        self.counts
    }

    /// Flat index of cell (i, j, k).
    pub fn index(&self, i: usize, j: usize, k: usize) -> usize {
        (k * self.counts.1 + j) * self.counts.0 + i
    }
}

impl Mesh for RectangularMesh {
    fn id(&self) -> u64 {
        self.id
    }
    fn size(&self) -> usize {
        self.counts.0 * self.counts.1 * self.counts.2
    }
    fn volume(&self, _index: usize) -> f64 {
        self.cell_volume
    }
    fn total_volume(&self) -> f64 {
        self.cell_volume * self.size() as f64
    }
    fn has_uniform_cell_volumes(&self) -> Option<f64> {
        Some(self.cell_volume)
    }
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_mesh {
    use super::*;

    #[test]
    fn rectangular_mesh_geometry() {
        let mesh = RectangularMesh::new((4, 3, 2), (1e-9, 1e-9, 2e-9));
        assert_eq!(24, mesh.size());
        assert_eq!(Some(2e-27), mesh.has_uniform_cell_volumes());
        assert!((mesh.total_volume() - 24.0 * 2e-27).abs() < 1e-40);
        assert_eq!(mesh.index(1, 2, 0), 9);
        assert_eq!(mesh.index(0, 0, 1), 12);
    }

    #[test]
    fn ids_are_unique() {
        let a = RectangularMesh::new((1, 1, 1), (1.0, 1.0, 1.0));
        let b = RectangularMesh::new((1, 1, 1), (1.0, 1.0, 1.0));
        assert_ne!(a.id(), b.id());
    }
}
