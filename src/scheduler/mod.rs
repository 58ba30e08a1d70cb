//! Clock & Scheduler.
//!
//! The source firmware's *fibre* is a stackful green thread switched by hand
//! (`os_fibre.c`, a manually written context-switch). The idiomatic Rust
//! equivalent of "stack-per-task, cooperative, suspend only at yield/sleep"
//! is a stackless coroutine: an `async fn` polled by a small executor we own
//! outright, rather than a real OS thread or hand-rolled stack switch. A
//! [`TaskHandle`] is the capability a task body uses to suspend itself
//! ([`TaskHandle::yield_now`], [`TaskHandle::sleep`]); the [`Scheduler`]
//! round-robins over the fixed-capacity task table exactly as the source's
//! `os_fibre_start` loop does.
//!
//! Single-threaded by construction: `Scheduler` is built on `Rc<RefCell<_>>`,
//! not `Arc<Mutex<_>>`, because only one thread ever drives it — the
//! scheduler is the only execution environment for user logic.

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use log::{debug, trace, warn};

use crate::clock::{wrapping_diff, Clock, Tick};
use crate::error::{BridgeError, Result};

mod waker;

/// Opaque handle identifying a task slot; index-based rather than a pointer,
/// to keep invariants local.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
  Ready,
  Running,
  Sleeping,
  Blocked,
  Dead,
}

/// Inspectable snapshot of a task slot (the source's `os_fibre_info_t`).
#[derive(Debug, Clone)]
pub struct TaskInfo {
  pub name: String,
  pub state: TaskState,
  pub run_count: u32,
  pub wake_tick: Tick,
  pub stack_hint: u32,
}

type BoxFuture = Pin<Box<dyn Future<Output = ()>>>;

struct TaskSlot {
  name: String,
  state: TaskState,
  wake_tick: Tick,
  run_count: u32,
  stack_hint: u32,
  future: Option<BoxFuture>,
}

struct Inner {
  clock: Clock,
  tasks: Vec<Option<TaskSlot>>,
  capacity: usize,
  started: bool,
  current: Option<TaskId>,
}

/// The cooperative round-robin scheduler (C1).
#[derive(Clone)]
pub struct Scheduler {
  inner: Rc<RefCell<Inner>>,
}

impl Scheduler {
  /// `capacity` mirrors the source's `OS_MAX_FIBRES`.
  pub fn new(clock: Clock, capacity: usize) -> Self {
    let mut tasks = Vec::with_capacity(capacity);
    tasks.resize_with(capacity, || None);
    Scheduler {
      inner: Rc::new(RefCell::new(Inner {
        clock,
        tasks,
        capacity,
        started: false,
        current: None,
      })),
    }
  }

  pub fn clock(&self) -> Clock {
    self.inner.borrow().clock.clone()
  }

  pub fn now_ticks(&self) -> Tick {
    self.inner.borrow().clock.now_ticks()
  }

  pub fn uptime_ms(&self) -> u32 {
    self.inner.borrow().clock.uptime_ms()
  }

  /// Advance the clock. Driven by an external timer source; safe to call
  /// from outside the scheduler loop (it only touches the atomic clock).
  pub fn tick_advance(&self, by: u32) {
    self.inner.borrow().clock.tick_advance(by);
  }

  /// Create a task from an async task body. `stack_hint` is retained only
  /// for parity with the source's `stack_size` parameter and introspection;
  /// Rust's stackless tasks have no fixed stack to size.
  pub fn create<F, Fut>(&self, name: &str, stack_hint: u32, body: F) -> Result<TaskId>
  where
    F: FnOnce(TaskHandle) -> Fut + 'static,
    Fut: Future<Output = ()> + 'static,
  {
    let mut inner = self.inner.borrow_mut();
    let slot_index = inner.tasks.iter().position(|t| t.is_none());
    let Some(idx) = slot_index else {
      warn!(target: "zb2mqtt::scheduler", "task pool full ({} slots)", inner.capacity);
      return Err(BridgeError::NoMem);
    };
    let id = TaskId(idx);
    drop(inner);
    let handle = TaskHandle {
      inner: self.inner.clone(),
      id,
    };
    let future: BoxFuture = Box::pin(body(handle));
    let mut inner = self.inner.borrow_mut();
    inner.tasks[idx] = Some(TaskSlot {
      name: name.to_string(),
      state: TaskState::Ready,
      wake_tick: 0,
      run_count: 0,
      stack_hint,
      future: Some(future),
    });
    debug!(target: "zb2mqtt::scheduler", "created task '{name}' (id={idx})");
    Ok(id)
  }

  /// Number of live (non-Dead, occupied) task slots.
  pub fn count(&self) -> u32 {
    self
      .inner
      .borrow()
      .tasks
      .iter()
      .filter(|t| t.is_some())
      .count() as u32
  }

  pub fn info(&self, index: u32) -> Result<TaskInfo> {
    let inner = self.inner.borrow();
    let slot = inner
      .tasks
      .get(index as usize)
      .and_then(|t| t.as_ref())
      .ok_or(BridgeError::NotFound)?;
    Ok(TaskInfo {
      name: slot.name.clone(),
      state: slot.state,
      run_count: slot.run_count,
      wake_tick: slot.wake_tick,
      stack_hint: slot.stack_hint,
    })
  }

  pub fn current(&self) -> Option<TaskId> {
    self.inner.borrow().current
  }

  /// One round-robin pass over the task table. Returns the number of tasks
  /// actually polled. Dead tasks are reaped (slot freed) at the end of the
  /// pass they complete in.
  pub fn run_once(&self) -> usize {
    let waker = waker::noop_waker();
    let mut cx = Context::from_waker(&waker);
    let capacity = self.inner.borrow().capacity;
    let mut polled = 0usize;

    for idx in 0..capacity {
      let now = self.now_ticks();
      // Decide readiness and take ownership of the future out of the slot
      // so we can poll it without holding the RefCell borrow across `poll`
      // (a task may itself call back into the scheduler, e.g. `create`).
      let mut taken = {
        let mut inner = self.inner.borrow_mut();
        let Some(slot) = inner.tasks[idx].as_mut() else {
          continue;
        };
        if slot.state == TaskState::Sleeping {
          if wrapping_diff(now, slot.wake_tick) < 0 {
            continue;
          }
          slot.state = TaskState::Ready;
        }
        if slot.state != TaskState::Ready {
          continue;
        }
        slot.state = TaskState::Running;
        inner.current = Some(TaskId(idx));
        slot.future.take()
      };

      let Some(fut) = taken.as_mut() else {
        continue;
      };
      polled += 1;
      let poll_result = fut.as_mut().poll(&mut cx);

      let mut inner = self.inner.borrow_mut();
      inner.current = None;
      let slot = inner.tasks[idx].as_mut().expect("slot present during poll");
      slot.run_count = slot.run_count.wrapping_add(1);
      match poll_result {
        Poll::Ready(()) => {
          trace!(target: "zb2mqtt::scheduler", "task '{}' finished", slot.name);
          inner.tasks[idx] = None;
        }
        Poll::Pending => {
          // A suspension primitive (Sleep/Yield) already set the
          // slot's state (Sleeping or Ready); if the task awaited
          // something else entirely, default back to Ready so it is
          // retried next round rather than stalling forever.
          if slot.state == TaskState::Running {
            slot.state = TaskState::Ready;
          }
          slot.future = taken;
        }
      }
    }
    polled
  }

  /// Runs rounds until no task is immediately Ready (all remaining are
  /// Sleeping or the table is empty). Useful for deterministic tests that
  /// drive the clock by hand; never used by the real daemon, which calls
  /// [`Scheduler::start`].
  pub fn run_until_idle(&self) -> usize {
    let mut total = 0;
    loop {
      let polled = self.run_once();
      total += polled;
      if polled == 0 {
        break;
      }
    }
    total
  }

  /// Enters the scheduling loop. First call only has effect; subsequent
  /// calls are no-ops.
  /// Drives the clock forward at roughly 1 tick per millisecond of wall
  /// time so that `sleep`/interview/pending-timeout deadlines measured in
  /// ticks track real elapsed time.
  pub fn start(&self) {
    {
      let mut inner = self.inner.borrow_mut();
      if inner.started {
        return;
      }
      inner.started = true;
    }
    loop {
      self.tick_advance(1);
      self.run_once();
      std::thread::sleep(std::time::Duration::from_millis(1));
    }
  }
}

/// Capability passed to a task body, used to suspend cooperatively.
#[derive(Clone)]
pub struct TaskHandle {
  inner: Rc<RefCell<Inner>>,
  id: TaskId,
}

impl TaskHandle {
  pub fn id(&self) -> TaskId {
    self.id
  }

  pub fn now_ticks(&self) -> Tick {
    self.inner.borrow().clock.now_ticks()
  }

  /// `sleep(0)` is equivalent to [`TaskHandle::yield_now`].
  pub fn sleep(&self, ms: u32) -> Sleep {
    Sleep {
      handle: self.clone(),
      wake_tick: None,
      deadline_ms: ms,
    }
  }

  pub fn yield_now(&self) -> Yield {
    Yield {
      handle: self.clone(),
      yielded: false,
    }
  }
}

/// Future returned by [`TaskHandle::sleep`].
pub struct Sleep {
  handle: TaskHandle,
  wake_tick: Option<Tick>,
  deadline_ms: u32,
}

impl Future for Sleep {
  type Output = ();

  fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
    let mut inner = self.handle.inner.borrow_mut();
    let now = inner.clock.now_ticks();
    match self.wake_tick {
      None => {
        if self.deadline_ms == 0 {
          return Poll::Ready(());
        }
        let wake_tick = now.wrapping_add(self.deadline_ms);
        self.wake_tick = Some(wake_tick);
        if let Some(slot) = inner.tasks[self.handle.id.0].as_mut() {
          slot.state = TaskState::Sleeping;
          slot.wake_tick = wake_tick;
        }
        Poll::Pending
      }
      Some(wake_tick) => {
        if wrapping_diff(now, wake_tick) >= 0 {
          Poll::Ready(())
        } else {
          if let Some(slot) = inner.tasks[self.handle.id.0].as_mut() {
            slot.state = TaskState::Sleeping;
            slot.wake_tick = wake_tick;
          }
          Poll::Pending
        }
      }
    }
  }
}

/// Future returned by [`TaskHandle::yield_now`]. Resolves on the scheduler's
/// very next visit to this task, without waiting for any tick to elapse.
pub struct Yield {
  handle: TaskHandle,
  yielded: bool,
}

impl Future for Yield {
  type Output = ();

  fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
    if self.yielded {
      return Poll::Ready(());
    }
    self.yielded = true;
    let mut inner = self.handle.inner.borrow_mut();
    if let Some(slot) = inner.tasks[self.handle.id.0].as_mut() {
      slot.state = TaskState::Ready;
    }
    Poll::Pending
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::Cell;

  #[test]
  fn create_fails_with_no_mem_when_pool_full() {
    let sched = Scheduler::new(Clock::new(), 1);
    sched.create("a", 0, |h| async move { h.yield_now().await }).unwrap();
    let err = sched
      .create("b", 0, |h| async move { h.yield_now().await })
      .unwrap_err();
    assert_eq!(err, BridgeError::NoMem);
  }

  #[test]
  fn yield_runs_next_round() {
    let sched = Scheduler::new(Clock::new(), 4);
    let counter = Rc::new(Cell::new(0));
    let c = counter.clone();
    sched
      .create("counter", 0, move |h| async move {
        c.set(c.get() + 1);
        h.yield_now().await;
        c.set(c.get() + 1);
      })
      .unwrap();
    sched.run_once();
    assert_eq!(counter.get(), 1);
    sched.run_once();
    assert_eq!(counter.get(), 2);
  }

  #[test]
  fn sleep_blocks_until_tick_reached() {
    let clock = Clock::new();
    let sched = Scheduler::new(clock.clone(), 4);
    let woke = Rc::new(Cell::new(false));
    let w = woke.clone();
    sched
      .create("sleeper", 0, move |h| async move {
        h.sleep(10).await;
        w.set(true);
      })
      .unwrap();
    sched.run_once();
    assert!(!woke.get());
    clock.tick_advance(5);
    sched.run_once();
    assert!(!woke.get());
    clock.tick_advance(5);
    sched.run_once();
    assert!(woke.get());
  }

  #[test]
  fn sleep_zero_is_yield() {
    let sched = Scheduler::new(Clock::new(), 4);
    let done = Rc::new(Cell::new(false));
    let d = done.clone();
    sched
      .create("t", 0, move |h| async move {
        h.sleep(0).await;
        d.set(true);
      })
      .unwrap();
    sched.run_once();
    assert!(done.get());
  }

  #[test]
  fn task_completes_and_slot_is_reaped() {
    let sched = Scheduler::new(Clock::new(), 4);
    sched.create("finite", 0, |_h| async move {}).unwrap();
    assert_eq!(sched.count(), 1);
    sched.run_once();
    assert_eq!(sched.count(), 0);
  }
}
