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

//! This module defines the most basic data types that are used throughout all
//! the code of our library (both at the abstraction and implementation
//! levels).  These are also the types your client library is likely to work
//! with: the three component vector attached to every mesh cell, and the
//! reference counted simulation state snapshot the minimizer steps through.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::abstraction::Mesh;
use crate::MeshValue;

/// Permeability of free space, in SI units.
pub const MU0: f64 = 4.0e-7 * std::f64::consts::PI;

// ----------------------------------------------------------------------------
// --- VECTOR3 ----------------------------------------------------------------
// ----------------------------------------------------------------------------
/// A three component vector, the per-cell quantity everything in this library
/// revolves around.  The layout is guaranteed to be three tightly packed
/// `f64` in x:y:z order so the striped storage may treat arrays of them as
/// plain bytes.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
#[repr(C)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub const ZERO: Vector3 = Vector3 { x: 0.0, y: 0.0, z: 0.0 };

    #[inline]
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Vector3 { x, y, z }
    }
    /// Dot product.
    #[inline]
    pub fn dot(&self, o: &Vector3) -> f64 {
        self.x * o.x + self.y * o.y + self.z * o.z
    }
    /// Cross product.
    #[inline]
    pub fn cross(&self, o: &Vector3) -> Vector3 {
        Vector3 {
            x: self.y * o.z - self.z * o.y,
            y: self.z * o.x - self.x * o.z,
            z: self.x * o.y - self.y * o.x,
        }
    }
    /// Squared Euclidean magnitude.
    #[inline]
    pub fn mag_sq(&self) -> f64 {
        self.x * self.x + self.y * self.y + self.z * self.z
    }
    /// `self += scale * o`, the fused update the inner loops live on.
    #[inline]
    pub fn accum(&mut self, scale: f64, o: &Vector3) {
        self.x += scale * o.x;
        self.y += scale * o.y;
        self.z += scale * o.z;
    }
    /// Componentwise product, used to apply diagonal preconditioners.
    #[inline]
    pub fn mul_components(&self, o: &Vector3) -> Vector3 {
        Vector3 { x: self.x * o.x, y: self.y * o.y, z: self.z * o.z }
    }
    /// Largest component value.
    #[inline]
    pub fn max_component(&self) -> f64 {
        self.x.max(self.y).max(self.z)
    }
    /// Rescales to unit magnitude.  A zero vector is left untouched.
    #[inline]
    pub fn make_unit(&mut self) {
        let magsq = self.mag_sq();
        if magsq > 0.0 && magsq.is_finite() {
            let inv = 1.0 / magsq.sqrt();
            self.x *= inv;
            self.y *= inv;
            self.z *= inv;
        }
    }
}

impl std::ops::Add for Vector3 {
    type Output = Vector3;
    #[inline]
    fn add(self, o: Vector3) -> Vector3 {
        Vector3 { x: self.x + o.x, y: self.y + o.y, z: self.z + o.z }
    }
}
impl std::ops::Sub for Vector3 {
    type Output = Vector3;
    #[inline]
    fn sub(self, o: Vector3) -> Vector3 {
        Vector3 { x: self.x - o.x, y: self.y - o.y, z: self.z - o.z }
    }
}
impl std::ops::Mul<f64> for Vector3 {
    type Output = Vector3;
    #[inline]
    fn mul(self, s: f64) -> Vector3 {
        Vector3 { x: self.x * s, y: self.y * s, z: self.z * s }
    }
}
impl std::ops::Mul<Vector3> for f64 {
    type Output = Vector3;
    #[inline]
    fn mul(self, v: Vector3) -> Vector3 {
        v * self
    }
}
impl std::ops::Neg for Vector3 {
    type Output = Vector3;
    #[inline]
    fn neg(self) -> Vector3 {
        Vector3 { x: -self.x, y: -self.y, z: -self.z }
    }
}
impl std::ops::AddAssign for Vector3 {
    #[inline]
    fn add_assign(&mut self, o: Vector3) {
        self.x += o.x;
        self.y += o.y;
        self.z += o.z;
    }
}

// ----------------------------------------------------------------------------
// --- DERIVED DATA KEYS ------------------------------------------------------
// ----------------------------------------------------------------------------
/// String keys under which the minimizer memoizes scalars into a state's
/// derived data map.  Collaborators read these back instead of recomputing.
pub mod derived {
    pub const TOTAL_ENERGY: &str = "Total energy";
    pub const MAX_MXHXM: &str = "Max mxHxm";
    pub const ENERGY_DENSITY_ERROR_ESTIMATE: &str = "Energy density error estimate";
    pub const ENERGY_BEST_STATE_ID: &str = "Energy best state id";
    pub const RELATIVE_ENERGY: &str = "Relative energy";
    pub const CYCLE_COUNT: &str = "Cycle count";
    pub const CYCLE_SUB_COUNT: &str = "Cycle sub count";
    pub const CONJUGATE_CYCLE_COUNT: &str = "Conjugate cycle count";
    pub const BRACKET_COUNT: &str = "Bracket count";
    pub const LINE_MIN_COUNT: &str = "Line min count";
    pub const ENERGY_CALC_COUNT: &str = "Energy calc count";
    pub const LAST_ENERGY: &str = "Last energy";
}

// ----------------------------------------------------------------------------
// --- SIMSTATE ---------------------------------------------------------------
// ----------------------------------------------------------------------------
static NEXT_STATE_ID: AtomicU64 = AtomicU64::new(1);

/// A snapshot of the simulation: the spin configuration plus the structural
/// data it was computed on.
///
/// States are immutable once shared (see [StateKey]); the only mutation ever
/// applied to a shared state goes through the `derived` memo map, which is
/// append-only and safe to fill from worker threads.
pub struct SimState {
    /// Process-unique identity of this snapshot.
    id: u64,
    /// Stage of the schedule this state belongs to.
    pub stage_number: u32,
    /// Total number of steps taken to reach this state.
    pub iteration_count: u64,
    /// Number of steps taken within the current stage.
    pub stage_iteration_count: u64,
    /// Per-cell unit spin vectors.
    pub spin: MeshValue<Vector3>,
    /// Per-cell saturation magnetization, shared across snapshots.
    pub ms: Arc<MeshValue<f64>>,
    /// The mesh everything is discretized on.
    pub mesh: Arc<dyn Mesh>,
    /// Extensible memo map for derived scalar quantities.
    derived: DashMap<String, f64, fxhash::FxBuildHasher>,
}

/// A shared, read-only handle on a [SimState].  Cloning the key is how a
/// collaborator keeps a snapshot alive.
pub type StateKey = Arc<SimState>;

impl SimState {
    /// Builds a fresh state around the given structural data.  The spin
    /// buffer must already be sized to the mesh.
    pub fn new(mesh: Arc<dyn Mesh>, ms: Arc<MeshValue<f64>>, spin: MeshValue<Vector3>) -> Self {
        SimState {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            stage_number: 0,
            iteration_count: 0,
            stage_iteration_count: 0,
            spin,
            ms,
            mesh,
            derived: DashMap::default(),
        }
    }

    /// Builds an unshared work state with the same structure as `self`: same
    /// mesh and Ms, a copy of the spins, a fresh id, and an empty memo map.
    pub fn spawn_like(&self) -> SimState {
        SimState {
            id: NEXT_STATE_ID.fetch_add(1, Ordering::Relaxed),
            stage_number: self.stage_number,
            iteration_count: self.iteration_count,
            stage_iteration_count: self.stage_iteration_count,
            spin: self.spin.clone(),
            ms: Arc::clone(&self.ms),
            mesh: Arc::clone(&self.mesh),
            derived: DashMap::default(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Number of cells in this state's mesh.
    pub fn size(&self) -> usize {
        self.mesh.size()
    }

    /// Memoizes a derived scalar.  The first write wins; a second write under
    /// the same key is reported back as `false` and ignored.
    pub fn add_derived_data(&self, name: &str, value: f64) -> bool {
        if self.derived.contains_key(name) {
            return false;
        }
        self.derived.insert(name.to_string(), value);
        true
    }

    /// Reads a memoized derived scalar back.
    pub fn get_derived_data(&self, name: &str) -> Option<f64> {
        self.derived.get(name).map(|v| *v)
    }
}

impl std::fmt::Debug for SimState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimState")
            .field("id", &self.id)
            .field("stage_number", &self.stage_number)
            .field("iteration_count", &self.iteration_count)
            .field("size", &self.mesh.size())
            .finish()
    }
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_vector3 {
    use super::*;

    #[test]
    fn cross_of_axes_is_third_axis() {
        let x = Vector3::new(1.0, 0.0, 0.0);
        let y = Vector3::new(0.0, 1.0, 0.0);
        assert_eq!(Vector3::new(0.0, 0.0, 1.0), x.cross(&y));
    }

    #[test]
    fn make_unit_normalizes_and_spares_zero() {
        let mut v = Vector3::new(3.0, 0.0, 4.0);
        v.make_unit();
        assert!((v.mag_sq() - 1.0).abs() < 1e-15);

        let mut z = Vector3::ZERO;
        z.make_unit();
        assert_eq!(Vector3::ZERO, z);
    }

    #[test]
    fn accum_is_fused_scale_add() {
        let mut v = Vector3::new(1.0, 1.0, 1.0);
        v.accum(2.0, &Vector3::new(1.0, 2.0, 3.0));
        assert_eq!(Vector3::new(3.0, 5.0, 7.0), v);
    }
}
