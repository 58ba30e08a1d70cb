//! A waker that does nothing when woken.
//!
//! The scheduler decides when to re-poll a task by its own round-robin pass
//! over the task table (see [`super::Scheduler::run_once`]), not by
//! reacting to `Waker::wake` calls, so every poll uses this no-op waker.

use std::task::{RawWaker, RawWakerVTable, Waker};

static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, wake, wake_by_ref, drop);

fn clone(_: *const ()) -> RawWaker {
  RawWaker::new(std::ptr::null(), &VTABLE)
}

fn wake(_: *const ()) {}

fn wake_by_ref(_: *const ()) {}

fn drop(_: *const ()) {}

pub fn noop_waker() -> Waker {
  let raw = RawWaker::new(std::ptr::null(), &VTABLE);
  unsafe { Waker::from_raw(raw) }
}
