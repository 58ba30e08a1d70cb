//! Pending-command correlation table.
//!
//! Maps `corr_id <-> tsn` for in-flight radio commands so the stack's
//! send-status callback (keyed by `tsn`) can be turned back into exactly
//! one `ZB_CMD_CONFIRM`/`ZB_CMD_ERROR` for the caller's `corr_id`.

use crate::clock::{wrapping_diff, Tick};
use crate::error::{BridgeError, Result};
use crate::model::Tsn;

/// `ZB_MAX_PENDING` in the source's `zb_real.c`.
pub const M_PEND: usize = 16;
/// `ZB_CMD_TIMEOUT_MS` in the source's `zb_real.c`.
pub const T_CMD_MS: u32 = 5000;

struct Slot {
  corr_id: u32,
  tsn: Option<Tsn>,
  created: Tick,
}

#[derive(Default)]
pub struct PendingTable {
  slots: Vec<Slot>,
}

impl PendingTable {
  pub fn new() -> Self {
    PendingTable { slots: Vec::with_capacity(M_PEND) }
  }

  pub fn len(&self) -> usize {
    self.slots.len()
  }

  pub fn is_empty(&self) -> bool {
    self.slots.is_empty()
  }

  /// Allocates a slot for `corr_id` before the stack call is made.
  pub fn allocate(&mut self, corr_id: u32, now: Tick) -> Result<()> {
    if self.slots.len() >= M_PEND {
      return Err(BridgeError::NoMem);
    }
    self.slots.push(Slot { corr_id, tsn: None, created: now });
    Ok(())
  }

  /// Records the TSN the stack returned for the most recently allocated
  /// slot with this `corr_id` (there is only ever one in flight per id).
  pub fn record_tsn(&mut self, corr_id: u32, tsn: Tsn) {
    if let Some(slot) = self.slots.iter_mut().find(|s| s.corr_id == corr_id && s.tsn.is_none()) {
      slot.tsn = Some(tsn);
    }
  }

  /// Frees and returns the `corr_id` for a slot whose stack-assigned `tsn`
  /// matches, on the stack's send-status callback.
  pub fn resolve_by_tsn(&mut self, tsn: Tsn) -> Option<u32> {
    let idx = self.slots.iter().position(|s| s.tsn == Some(tsn))?;
    Some(self.slots.remove(idx).corr_id)
  }

  /// Frees and returns the `corr_id`s for every slot older than `T_CMD_MS`.
  pub fn sweep_expired(&mut self, now: Tick) -> Vec<u32> {
    let mut expired = Vec::new();
    self.slots.retain(|slot| {
      if wrapping_diff(now, slot.created) as u32 > T_CMD_MS {
        expired.push(slot.corr_id);
        false
      } else {
        true
      }
    });
    expired
  }

  /// Drops the slot for a fire-and-forget `corr_id == 0` submission, if one
  /// was allocated anyway for internal bookkeeping (the simulator does
  /// this; see `sim::SimRadioStack`).
  pub fn discard(&mut self, corr_id: u32) {
    self.slots.retain(|s| s.corr_id != corr_id);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn allocate_record_resolve_round_trips() {
    let mut table = PendingTable::new();
    table.allocate(7, 0).unwrap();
    table.record_tsn(7, 42);
    assert_eq!(table.resolve_by_tsn(42), Some(7));
    assert_eq!(table.len(), 0);
  }

  #[test]
  fn allocate_fails_when_full() {
    let mut table = PendingTable::new();
    for i in 0..M_PEND as u32 {
      table.allocate(i + 1, 0).unwrap();
    }
    assert_eq!(table.allocate(999, 0).unwrap_err(), BridgeError::NoMem);
  }

  #[test]
  fn sweep_expired_frees_old_slots_only() {
    let mut table = PendingTable::new();
    table.allocate(1, 0).unwrap();
    table.allocate(2, 4000).unwrap();
    let expired = table.sweep_expired(5001);
    assert_eq!(expired, vec![1]);
    assert_eq!(table.len(), 1);
  }

  #[test]
  fn resolve_unknown_tsn_returns_none() {
    let mut table = PendingTable::new();
    assert_eq!(table.resolve_by_tsn(5), None);
  }
}
