//! Event bus.
//!
//! The bounded, never-blocking publish contract mirrors
//! `StatusChannelSender::try_send`: a full queue is not an error condition
//! the publisher need unwind from, it is dropped with a counter bump,
//! because nothing guarantees a subscriber is even listening. This uses the
//! same `mio_extras::channel::sync_channel` underneath for the same reason:
//! it is a `Sync`, clonable sender usable from a radio-stack callback thread
//! without an explicit `Mutex` around the send path, while `dispatch` (the
//! only place handlers run) stays single-threaded on the scheduler.

pub mod event;

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use log::{trace, warn};
use mio_extras::channel as mio_channel;

use crate::clock::Clock;
use crate::error::{BridgeError, Result};

pub use event::{event_type, Event, EventFilter, EventType, Payload};

/// `OS_MAX_SUBSCRIBERS` in the source's `os_config.h`.
pub const M_SUB: usize = 32;
/// `OS_EVENT_QUEUE_SIZE` in the source's `os_config.h`.
pub const Q_SIZE: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionHandle {
  index: usize,
  generation: u64,
}

struct Subscription {
  filter: EventFilter,
  handler: Box<dyn FnMut(&Event)>,
  generation: u64,
  active: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventBusStats {
  pub published: u64,
  pub dispatched: u64,
  pub dropped: u64,
  pub current_size: u32,
  pub high_water: u32,
}

pub struct EventBus {
  clock: Clock,
  sender: mio_channel::SyncSender<Event>,
  receiver: mio_channel::Receiver<Event>,
  subs: Rc<RefCell<Vec<Subscription>>>,
  stats: Arc<Mutex<EventBusStats>>,
  next_corr_id: Rc<AtomicU32>,
}

impl EventBus {
  pub fn new(clock: Clock) -> Self {
    let (sender, receiver) = mio_channel::sync_channel(Q_SIZE);
    EventBus {
      clock,
      sender,
      receiver,
      subs: Rc::new(RefCell::new(Vec::new())),
      stats: Arc::new(Mutex::new(EventBusStats::default())),
      next_corr_id: Rc::new(AtomicU32::new(1)),
    }
  }

  /// A cloneable handle usable from another thread (the radio stack's
  /// native callback context) to publish without touching `self`.
  pub fn sender(&self) -> BusSender {
    BusSender {
      sender: self.sender.clone(),
      stats: self.stats.clone(),
    }
  }

  /// Next correlation id. Never returns `0`, which is reserved for
  /// fire-and-forget events.
  pub fn new_corr_id(&self) -> u32 {
    loop {
      let id = self.next_corr_id.fetch_add(1, Ordering::Relaxed);
      if id != 0 {
        return id;
      }
    }
  }

  pub fn publish(&self, event: Event) -> Result<()> {
    BusSender {
      sender: self.sender.clone(),
      stats: self.stats.clone(),
    }
    .publish(event)
  }

  /// Convenience: stamp `timestamp` from the bus's clock and publish.
  pub fn emit(&self, ty: EventType, corr_id: u32, src_id: u8, payload: Payload) -> Result<()> {
    let event = Event::new(ty, self.clock.now_ticks(), corr_id, src_id, payload);
    self.publish(event)
  }

  /// Register a handler invoked, in subscription order, for every dispatched
  /// event matching `filter`.
  pub fn subscribe(
    &self,
    filter: EventFilter,
    handler: impl FnMut(&Event) + 'static,
  ) -> Result<SubscriptionHandle> {
    let mut subs = self.subs.borrow_mut();
    if let Some((index, slot)) = subs.iter_mut().enumerate().find(|(_, s)| !s.active) {
      slot.filter = filter;
      slot.handler = Box::new(handler);
      slot.active = true;
      slot.generation += 1;
      return Ok(SubscriptionHandle {
        index,
        generation: slot.generation,
      });
    }
    if subs.len() >= M_SUB {
      return Err(BridgeError::NoMem);
    }
    let index = subs.len();
    subs.push(Subscription {
      filter,
      handler: Box::new(handler),
      generation: 0,
      active: true,
    });
    Ok(SubscriptionHandle {
      index,
      generation: 0,
    })
  }

  pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<()> {
    let mut subs = self.subs.borrow_mut();
    let slot = subs.get_mut(handle.index).ok_or(BridgeError::NotFound)?;
    if !slot.active || slot.generation != handle.generation {
      return Err(BridgeError::NotFound);
    }
    slot.active = false;
    // Drop the closure's captures now rather than waiting for the slot to
    // be reused; it may be holding an Rc the caller expects released.
    slot.handler = Box::new(|_: &Event| {});
    Ok(())
  }

  /// Drain up to `max` queued events (`0` means unbounded), invoking every
  /// matching active handler for each. Returns the number dispatched.
  pub fn dispatch(&self, max: u32) -> u32 {
    let mut dispatched = 0u32;
    loop {
      if max != 0 && dispatched >= max {
        break;
      }
      let event = match self.receiver.try_recv() {
        Ok(event) => event,
        Err(std::sync::mpsc::TryRecvError::Empty) => break,
        Err(std::sync::mpsc::TryRecvError::Disconnected) => {
          warn!(target: "zb2mqtt::eventbus", "event bus sender disconnected");
          break;
        }
      };
      {
        let mut stats = self.stats.lock().unwrap();
        stats.current_size = stats.current_size.saturating_sub(1);
        stats.dispatched += 1;
      }
      let mut subs = self.subs.borrow_mut();
      for sub in subs.iter_mut().filter(|s| s.active && s.filter.matches(event.ty)) {
        (sub.handler)(&event);
      }
      dispatched += 1;
    }
    dispatched
  }

  pub fn stats(&self) -> EventBusStats {
    *self.stats.lock().unwrap()
  }
}

/// A cloneable, `Send` handle that only publishes (the radio adapter's
/// callback thread holds one of these, never the full
/// `EventBus`, which is `!Send` by virtue of `Rc`/`RefCell`). Backed by
/// `Arc<Mutex<_>>` rather than `Rc<RefCell<_>>` specifically so this type
/// can cross that thread boundary safely.
#[derive(Clone)]
pub struct BusSender {
  sender: mio_channel::SyncSender<Event>,
  stats: Arc<Mutex<EventBusStats>>,
}

impl BusSender {
  pub fn publish(&self, event: Event) -> Result<()> {
    match self.sender.try_send(event) {
      Ok(()) => {
        let mut stats = self.stats.lock().unwrap();
        stats.published += 1;
        stats.current_size += 1;
        stats.high_water = stats.high_water.max(stats.current_size);
        Ok(())
      }
      Err(mio_channel::TrySendError::Full(_)) => {
        trace!(target: "zb2mqtt::eventbus", "event bus full, dropping event");
        self.stats.lock().unwrap().dropped += 1;
        Err(BridgeError::Full)
      }
      Err(mio_channel::TrySendError::Disconnected(_)) => Err(BridgeError::NotReady),
      Err(mio_channel::TrySendError::Io(_)) => Err(BridgeError::NotReady),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::cell::Cell;

  fn bus() -> EventBus {
    EventBus::new(Clock::new())
  }

  #[test]
  fn new_corr_id_never_returns_zero_and_increments() {
    let bus = bus();
    let a = bus.new_corr_id();
    let b = bus.new_corr_id();
    assert_ne!(a, 0);
    assert_ne!(b, 0);
    assert_ne!(a, b);
  }

  #[test]
  fn publish_and_dispatch_invokes_matching_subscriber() {
    let bus = bus();
    let seen = Rc::new(Cell::new(0u32));
    let seen2 = seen.clone();
    bus
      .subscribe(EventFilter::one(event_type::BOOT), move |_e| {
        seen2.set(seen2.get() + 1);
      })
      .unwrap();
    bus.emit(event_type::BOOT, 0, 1, Payload::None).unwrap();
    let n = bus.dispatch(0);
    assert_eq!(n, 1);
    assert_eq!(seen.get(), 1);
  }

  #[test]
  fn filter_excludes_non_matching_type() {
    let bus = bus();
    let seen = Rc::new(Cell::new(0u32));
    let seen2 = seen.clone();
    bus
      .subscribe(EventFilter::one(event_type::NET_UP), move |_e| {
        seen2.set(seen2.get() + 1);
      })
      .unwrap();
    bus.emit(event_type::BOOT, 0, 1, Payload::None).unwrap();
    bus.dispatch(0);
    assert_eq!(seen.get(), 0);
  }

  #[test]
  fn publish_past_capacity_is_dropped_not_an_error_panic() {
    let bus = bus();
    for _ in 0..Q_SIZE {
      bus.emit(event_type::BOOT, 0, 1, Payload::None).unwrap();
    }
    let err = bus.emit(event_type::BOOT, 0, 1, Payload::None).unwrap_err();
    assert_eq!(err, BridgeError::Full);
    assert_eq!(bus.stats().dropped, 1);
  }

  #[test]
  fn unsubscribe_stops_further_dispatch() {
    let bus = bus();
    let seen = Rc::new(Cell::new(0u32));
    let seen2 = seen.clone();
    let handle = bus
      .subscribe(EventFilter::all(), move |_e| {
        seen2.set(seen2.get() + 1);
      })
      .unwrap();
    bus.unsubscribe(handle).unwrap();
    bus.emit(event_type::BOOT, 0, 1, Payload::None).unwrap();
    bus.dispatch(0);
    assert_eq!(seen.get(), 0);
  }

  #[test]
  fn slot_is_reused_after_unsubscribe_with_new_generation() {
    let bus = bus();
    let first = bus.subscribe(EventFilter::all(), |_e| {}).unwrap();
    bus.unsubscribe(first).unwrap();
    let second = bus.subscribe(EventFilter::all(), |_e| {}).unwrap();
    assert_eq!(first.index, second.index);
    assert_ne!(first.generation, second.generation);
    // the stale handle must not be able to unsubscribe the new occupant
    assert!(bus.unsubscribe(first).is_err());
  }

  #[test]
  fn stats_track_published_dispatched_and_high_water() {
    let bus = bus();
    bus.emit(event_type::BOOT, 0, 1, Payload::None).unwrap();
    bus.emit(event_type::BOOT, 0, 1, Payload::None).unwrap();
    let stats = bus.stats();
    assert_eq!(stats.published, 2);
    assert_eq!(stats.current_size, 2);
    assert_eq!(stats.high_water, 2);
    bus.dispatch(1);
    let stats = bus.stats();
    assert_eq!(stats.dispatched, 1);
    assert_eq!(stats.current_size, 1);
  }
}
