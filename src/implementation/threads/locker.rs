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

//! Per-worker scratch storage: a map from names to owned, type-erased
//! values, one map per thread.
//!
//! Each worker only ever touches its own map, so no locking is involved; a
//! master wanting to reach into other workers' maps must do it by running a
//! job on those workers (which is exactly what the pool's
//! `delete_locker_item` does).  Worker maps are torn down on worker exit, the
//! master's at `end_threads`.

use std::any::Any;
use std::cell::RefCell;

use fxhash::FxHashMap;

use crate::{core_err, CoreResult};

thread_local! {
    static LOCKER: RefCell<FxHashMap<String, Box<dyn Any + Send>>> =
        RefCell::new(FxHashMap::default());
}

/// Access point for the calling thread's locker map.
pub struct ThreadLocalMap;

impl ThreadLocalMap {
    /// Installs `item` under `name`.  It is an error if `name` is already
    /// present.
    pub fn add_item(name: &str, item: Box<dyn Any + Send>) -> CoreResult<()> {
        LOCKER.with(|l| {
            let mut map = l.borrow_mut();
            if map.contains_key(name) {
                return Err(core_err!(BadParameter, "locker item {name:?} already present"));
            }
            map.insert(name.to_string(), item);
            Ok(())
        })
    }

    /// Runs `body` against the item under `name` (or `None` when absent).
    pub fn with_item<R>(name: &str, body: impl FnOnce(Option<&mut (dyn Any + Send)>) -> R) -> R {
        LOCKER.with(|l| {
            let mut map = l.borrow_mut();
            body(map.get_mut(name).map(|b| b.as_mut()))
        })
    }

    /// True when `name` is present in this thread's map.
    pub fn contains(name: &str) -> bool {
        LOCKER.with(|l| l.borrow().contains_key(name))
    }

    /// Removes the item under `name` and hands it back without destroying
    /// it.  It is an error if `name` is absent.
    pub fn unmap_item(name: &str) -> CoreResult<Box<dyn Any + Send>> {
        LOCKER.with(|l| {
            l.borrow_mut()
                .remove(name)
                .ok_or_else(|| core_err!(BadParameter, "locker item {name:?} not present"))
        })
    }

    /// Removes and drops the item under `name`.  It is an error if `name`
    /// is absent.
    pub fn delete_item(name: &str) -> CoreResult<()> {
        Self::unmap_item(name).map(|_| ())
    }

    /// Drops every item in this thread's map.  Called by the worker mainline
    /// on exit and by `end_threads` for the master.
    pub(crate) fn delete_locker() {
        LOCKER.with(|l| l.borrow_mut().clear());
    }
}

// ############################################################################
// #### TESTS #################################################################
// ############################################################################

#[cfg(test)]
mod test_locker {
    use super::*;

    #[test]
    fn items_are_name_keyed_and_typed() {
        ThreadLocalMap::delete_locker();
        ThreadLocalMap::add_item("scratch", Box::new(vec![1.0f64, 2.0])).unwrap();
        assert!(ThreadLocalMap::contains("scratch"));
        // Double insert is refused.
        assert!(ThreadLocalMap::add_item("scratch", Box::new(0u8)).is_err());

        let sum = ThreadLocalMap::with_item("scratch", |item| {
            let v = item.unwrap().downcast_mut::<Vec<f64>>().unwrap();
            v.push(3.0);
            v.iter().sum::<f64>()
        });
        assert_eq!(6.0, sum);

        ThreadLocalMap::delete_item("scratch").unwrap();
        assert!(!ThreadLocalMap::contains("scratch"));
        assert!(ThreadLocalMap::delete_item("scratch").is_err());
    }

    #[test]
    fn maps_are_per_thread() {
        ThreadLocalMap::delete_locker();
        ThreadLocalMap::add_item("mine", Box::new(7i32)).unwrap();
        std::thread::spawn(|| {
            assert!(!ThreadLocalMap::contains("mine"));
        })
        .join()
        .unwrap();
        ThreadLocalMap::delete_locker();
    }
}
