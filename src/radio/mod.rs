//! Radio adapter — the critical subsystem.

pub mod addr_cache;
pub mod pending;
pub mod sim;
pub mod stack;

use std::cell::{Cell, RefCell};

use log::{info, trace, warn};

use crate::clock::Clock;
use crate::error::{BridgeError, Result};
use crate::eventbus::{event_type, EventBus, Payload};
use crate::model::{component_id, AttrValue, CorrId, Eui64, Nwk};

pub use addr_cache::{AddrCache, M_DEV};
pub use pending::{PendingTable, M_PEND, T_CMD_MS};
pub use sim::SimRadioStack;
pub use stack::{RadioStack, StackSignal};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioState {
  Uninitialized,
  Initializing,
  Ready,
  Error,
}

pub struct RadioAdapter<'a> {
  clock: Clock,
  bus: &'a EventBus,
  state: Cell<RadioState>,
  stack: RefCell<Box<dyn RadioStack>>,
  addr_cache: RefCell<AddrCache>,
  pending: RefCell<PendingTable>,
}

impl<'a> RadioAdapter<'a> {
  pub fn new(clock: Clock, bus: &'a EventBus, stack: Box<dyn RadioStack>) -> Self {
    RadioAdapter {
      clock,
      bus,
      state: Cell::new(RadioState::Uninitialized),
      stack: RefCell::new(stack),
      addr_cache: RefCell::new(AddrCache::new()),
      pending: RefCell::new(PendingTable::new()),
    }
  }

  pub fn state(&self) -> RadioState {
    self.state.get()
  }

  fn transition(&self, to: RadioState) {
    let from = self.state.get();
    let legal = matches!(
      (from, to),
      (RadioState::Uninitialized, RadioState::Initializing)
        | (RadioState::Initializing, RadioState::Ready)
        | (RadioState::Initializing, RadioState::Error)
        | (RadioState::Ready, RadioState::Error)
    );
    if !legal {
      warn!(target: "zb2mqtt::radio", "ignoring illegal radio state transition {from:?} -> {to:?}");
      return;
    }
    info!(target: "zb2mqtt::radio", "radio state {from:?} -> {to:?}");
    self.state.set(to);
  }

  /// Allocate caches and move to `Initializing`. Requires `Uninitialized`.
  pub fn init(&self) -> Result<()> {
    if self.state.get() != RadioState::Uninitialized {
      return Err(BridgeError::AlreadyExists);
    }
    self.transition(RadioState::Initializing);
    Ok(())
  }

  /// Idempotent if already `Ready`/`Initializing`.
  pub fn start_coordinator(&self) -> Result<()> {
    match self.state.get() {
      RadioState::Ready | RadioState::Initializing => {}
      RadioState::Uninitialized => return Err(BridgeError::NotReady),
      RadioState::Error => return Err(BridgeError::NotReady),
    }
    self.stack.borrow_mut().start_coordinator()
  }

  pub fn set_permit_join(&self, seconds: u8) -> Result<()> {
    self.require_ready()?;
    if seconds > 254 {
      return Err(BridgeError::InvalidArg("permit join seconds must be <= 254".into()));
    }
    self.stack.borrow_mut().set_permit_join(seconds)
  }

  fn require_ready(&self) -> Result<()> {
    if self.state.get() != RadioState::Ready {
      return Err(BridgeError::NotReady);
    }
    Ok(())
  }

  fn resolve_nwk(&self, eui64: Eui64) -> Result<Nwk> {
    self.addr_cache.borrow().find_by_eui64(eui64).ok_or(BridgeError::NotFound)
  }

  /// Allocates a pending slot for `corr_id` (unless it is `0`) before
  /// invoking `submit`, then records the TSN the stack returns into it.
  fn submit_correlated(&self, corr_id: CorrId, submit: impl FnOnce(&mut dyn RadioStack) -> Result<u8>) -> Result<()> {
    if corr_id != 0 {
      self.pending.borrow_mut().allocate(corr_id, self.clock.now_ticks())?;
    }
    let result = submit(&mut **self.stack.borrow_mut());
    match result {
      Ok(tsn) => {
        if corr_id != 0 {
          self.pending.borrow_mut().record_tsn(corr_id, tsn);
        }
        Ok(())
      }
      Err(e) => {
        if corr_id != 0 {
          self.pending.borrow_mut().discard(corr_id);
        }
        Err(e)
      }
    }
  }

  pub fn send_onoff(&self, eui64: Eui64, endpoint: u8, on: bool, corr_id: CorrId) -> Result<()> {
    self.require_ready()?;
    let nwk = self.resolve_nwk(eui64)?;
    self.submit_correlated(corr_id, |stack| stack.send_onoff(nwk, endpoint, on))
  }

  /// `level_pct` in `0..=100`; scaled to `0..=254` with rounding
  /// (`(pct*254 + 50)/100`); `transition_ms` scaled to 100ms units.
  pub fn send_level(
    &self,
    eui64: Eui64,
    endpoint: u8,
    level_pct: u8,
    transition_ms: u16,
    corr_id: CorrId,
  ) -> Result<()> {
    self.require_ready()?;
    if level_pct > 100 {
      return Err(BridgeError::InvalidArg("level_pct must be <= 100".into()));
    }
    let nwk = self.resolve_nwk(eui64)?;
    let level_0_254 = ((level_pct as u32 * 254 + 50) / 100) as u8;
    let transition_100ms = (transition_ms / 100).max(if transition_ms > 0 { 1 } else { 0 });
    self.submit_correlated(corr_id, |stack| stack.send_level(nwk, endpoint, level_0_254, transition_100ms))
  }

  pub fn read_attrs(&self, eui64: Eui64, endpoint: u8, cluster: u16, ids: &[u16], corr_id: CorrId) -> Result<()> {
    self.require_ready()?;
    if ids.len() > 8 {
      return Err(BridgeError::InvalidArg("at most 8 attribute ids per read".into()));
    }
    let nwk = self.resolve_nwk(eui64)?;
    self.submit_correlated(corr_id, |stack| stack.read_attrs(nwk, endpoint, cluster, ids))
  }

  #[allow(clippy::too_many_arguments)]
  pub fn configure_reporting(
    &self,
    eui64: Eui64,
    endpoint: u8,
    cluster: u16,
    attr: u16,
    min_s: u16,
    max_s: u16,
    corr_id: CorrId,
  ) -> Result<()> {
    self.require_ready()?;
    let nwk = self.resolve_nwk(eui64)?;
    self.submit_correlated(corr_id, |stack| stack.configure_reporting(nwk, endpoint, cluster, attr, min_s, max_s))
  }

  pub fn bind(&self, eui64: Eui64, endpoint: u8, cluster: u16, corr_id: CorrId) -> Result<()> {
    self.require_ready()?;
    let nwk = self.resolve_nwk(eui64)?;
    // Bind destination is the coordinator's own address; the coordinator's
    // eui64 is conventionally 0 in the simulated address
    // space, since nothing here ever looks it up by that value.
    self.submit_correlated(corr_id, |stack| stack.bind(nwk, endpoint, cluster, 0))
  }

  // -- Signal / report demux (called from the radio callback context) ----

  pub fn on_signal(&self, signal: StackSignal) {
    match signal {
      StackSignal::DeviceFirstStart | StackSignal::Reboot => {
        trace!(target: "zb2mqtt::radio", "requesting network formation after {signal:?}");
      }
      StackSignal::FormationOk => {
        self.transition(RadioState::Ready);
        let _ = self.bus.emit(event_type::ZB_STACK_UP, 0, component_id::RADIO, Payload::None);
      }
      StackSignal::FormationFailed => {
        self.transition(RadioState::Error);
        let _ = self.bus.emit(event_type::ZB_STACK_DOWN, 0, component_id::RADIO, Payload::None);
      }
    }
  }

  pub fn on_device_announce(&self, eui64: Eui64, nwk: Nwk) {
    self.addr_cache.borrow_mut().upsert(eui64, nwk, self.clock.now_ticks());
    let _ = self.bus.emit(event_type::ZB_ANNOUNCE, 0, component_id::RADIO, Payload::ZbAnnounce { eui64, nwk });
  }

  pub fn on_leave_indication(&self, eui64: Eui64) {
    self.addr_cache.borrow_mut().remove(eui64);
    let _ = self.bus.emit(event_type::ZB_DEVICE_LEFT, 0, component_id::RADIO, Payload::ZbDeviceLeft { eui64 });
  }

  pub fn on_attr_report(&self, nwk: Nwk, endpoint: u8, cluster: u16, attr: u16, value: AttrValue) {
    let Some(eui64) = self.addr_cache.borrow().find_by_nwk(nwk) else {
      warn!(target: "zb2mqtt::radio", "attribute report from unknown nwk {nwk:04x}, dropped");
      return;
    };
    let _ = self.bus.emit(
      event_type::ZB_ATTR_REPORT,
      0,
      component_id::RADIO,
      Payload::ZbAttrReport { eui64, endpoint, cluster, attr, value },
    );
  }

  /// Stack send-status callback: resolves the pending slot by `tsn` and
  /// emits exactly one confirm/error, freeing the slot.
  pub fn on_send_status(&self, tsn: u8, status: u8) {
    let Some(corr_id) = self.pending.borrow_mut().resolve_by_tsn(tsn) else {
      return;
    };
    if status == 0 {
      let _ = self.bus.emit(
        event_type::ZB_CMD_CONFIRM,
        corr_id,
        component_id::RADIO,
        Payload::ZbCmdConfirm { corr_id, tsn },
      );
    } else {
      let _ = self.bus.emit(
        event_type::ZB_CMD_ERROR,
        corr_id,
        component_id::RADIO,
        Payload::ZbCmdError { corr_id, err: "stack reported failure" },
      );
    }
  }

  /// Periodic sweep (`dispatch_ms` cadence): frees and reports timeout for
  /// every pending slot older than [`T_CMD_MS`].
  pub fn sweep_timeouts(&self) {
    let now = self.clock.now_ticks();
    for corr_id in self.pending.borrow_mut().sweep_expired(now) {
      let _ = self.bus.emit(
        event_type::ZB_CMD_ERROR,
        corr_id,
        component_id::RADIO,
        Payload::ZbCmdError { corr_id, err: "timeout" },
      );
    }
  }

  pub fn addr_cache_len(&self) -> usize {
    self.addr_cache.borrow().len()
  }

  pub fn pending_len(&self) -> usize {
    self.pending.borrow().len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn adapter(bus: &EventBus) -> RadioAdapter<'_> {
    let clock = Clock::new();
    let adapter = RadioAdapter::new(clock, bus, Box::new(SimRadioStack::new()));
    adapter.init().unwrap();
    adapter.on_signal(StackSignal::FormationOk);
    adapter
  }

  #[test]
  fn init_then_formation_ok_reaches_ready_and_emits_stack_up() {
    let bus = EventBus::new(Clock::new());
    let radio = adapter(&bus);
    assert_eq!(radio.state(), RadioState::Ready);
    assert_eq!(bus.dispatch(0), 1);
  }

  #[test]
  fn send_onoff_requires_known_address() {
    let bus = EventBus::new(Clock::new());
    let radio = adapter(&bus);
    assert_eq!(radio.send_onoff(0xAA, 1, true, 1).unwrap_err(), BridgeError::NotFound);
  }

  #[test]
  fn send_onoff_success_path_allocates_pending_slot() {
    let bus = EventBus::new(Clock::new());
    let radio = adapter(&bus);
    radio.on_device_announce(0xAA, 0x1111);
    bus.dispatch(0);
    radio.send_onoff(0xAA, 1, true, 42).unwrap();
    assert_eq!(radio.pending_len(), 1);
  }

  #[test]
  fn send_status_resolves_pending_and_emits_confirm() {
    let bus = EventBus::new(Clock::new());
    let radio = adapter(&bus);
    radio.on_device_announce(0xAA, 0x1111);
    bus.dispatch(0);
    radio.send_onoff(0xAA, 1, true, 42).unwrap();
    radio.on_send_status(1, 0);
    assert_eq!(radio.pending_len(), 0);
    assert_eq!(bus.dispatch(0), 1);
  }

  #[test]
  fn sweep_timeouts_emits_error_for_stale_pending() {
    let bus = EventBus::new(Clock::new());
    let radio = adapter(&bus);
    radio.on_device_announce(0xAA, 0x1111);
    bus.dispatch(0);
    radio.send_onoff(0xAA, 1, true, 42).unwrap();
    radio.clock.tick_advance(T_CMD_MS + 1);
    radio.sweep_timeouts();
    assert_eq!(radio.pending_len(), 0);
    assert_eq!(bus.dispatch(0), 1);
  }

  #[test]
  fn leave_indication_removes_from_cache_and_emits_device_left() {
    let bus = EventBus::new(Clock::new());
    let radio = adapter(&bus);
    radio.on_device_announce(0xAA, 0x1111);
    bus.dispatch(0);
    radio.on_leave_indication(0xAA);
    assert_eq!(radio.addr_cache_len(), 0);
    assert_eq!(bus.dispatch(0), 1);
  }

  #[test]
  fn send_level_scales_percent_and_transition() {
    let bus = EventBus::new(Clock::new());
    let radio = adapter(&bus);
    radio.on_device_announce(0xAA, 0x1111);
    bus.dispatch(0);
    // correctness of the scaling formula is exercised indirectly: no panic,
    // and pending slot is still allocated as for any correlated command.
    radio.send_level(0xAA, 1, 50, 1000, 7).unwrap();
    assert_eq!(radio.pending_len(), 1);
  }

  #[test]
  fn fire_and_forget_corr_id_zero_allocates_no_pending_slot() {
    let bus = EventBus::new(Clock::new());
    let radio = adapter(&bus);
    radio.on_device_announce(0xAA, 0x1111);
    bus.dispatch(0);
    radio.send_onoff(0xAA, 1, true, 0).unwrap();
    assert_eq!(radio.pending_len(), 0);
  }
}
