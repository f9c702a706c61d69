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

//! The driver contract: the collaborator that owns the step/stage schedule
//! and decorates the work states the minimizer creates.

use crate::{derived, SimState};

/// What the minimizer needs from the outer stepping loop.  Work states are
/// spawned structurally complete (mesh, Ms and spins copied); the driver
/// hooks let the embedding application graft its own bookkeeping on.
pub trait Driver: Send + Sync {
    /// Completes the structural member data of a freshly spawned work
    /// state.  Called while the state is still unshared and mutable.
    fn fill_state_member_data(&self, _prev: &SimState, _next: &mut SimState) {}

    /// Negotiates supplemental data (e.g. step size bounds) on the work
    /// state before it is evaluated.
    fn fill_state_supplemental_data(&self, _next: &mut SimState) {}

    /// Propagates cached scalars once the work state is finalized.  The
    /// default carries the predecessor's total energy over as
    /// "Last energy", which is what the delta-E output reads.
    fn fill_state_derived_data(&self, prev: &SimState, next: &SimState) {
        if let Some(e) = prev.get_derived_data(derived::TOTAL_ENERGY) {
            next.add_derived_data(derived::LAST_ENERGY, e);
        }
    }

    /// True when the schedule considers the stage of `state` finished.
    fn is_stage_done(&self, state: &SimState) -> bool;
}

/// A driver with no schedule of its own: stages never end on their own and
/// no extra state decoration happens.  Good enough for library tests and
/// for embedders that drive stage changes themselves.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimpleDriver;

impl Driver for SimpleDriver {
    fn is_stage_done(&self, _state: &SimState) -> bool {
        false
    }
}
