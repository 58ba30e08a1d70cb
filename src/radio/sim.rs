//! Host-simulation radio stack. Ships by default;
//! answers every submission immediately with a fresh TSN and never fails,
//! which is enough for the adapter's state machine, correlation table, and
//! address cache to be exercised end-to-end without real hardware.

use crate::error::Result;
use crate::model::{Eui64, Nwk};
use crate::radio::stack::{RadioStack, SubmitResult};

pub struct SimRadioStack {
  next_tsn: u8,
}

impl Default for SimRadioStack {
  fn default() -> Self {
    SimRadioStack { next_tsn: 1 }
  }
}

impl SimRadioStack {
  pub fn new() -> Self {
    Self::default()
  }

  fn next_tsn(&mut self) -> u8 {
    let tsn = self.next_tsn;
    self.next_tsn = self.next_tsn.wrapping_add(1);
    if self.next_tsn == 0 {
      self.next_tsn = 1;
    }
    tsn
  }
}

impl RadioStack for SimRadioStack {
  fn start_coordinator(&mut self) -> Result<()> {
    Ok(())
  }

  fn set_permit_join(&mut self, _seconds: u8) -> Result<()> {
    Ok(())
  }

  fn send_onoff(&mut self, _nwk: Nwk, _endpoint: u8, _on: bool) -> SubmitResult {
    Ok(self.next_tsn())
  }

  fn send_level(&mut self, _nwk: Nwk, _endpoint: u8, _level_0_254: u8, _transition_100ms: u16) -> SubmitResult {
    Ok(self.next_tsn())
  }

  fn read_attrs(&mut self, _nwk: Nwk, _endpoint: u8, _cluster: u16, _attr_ids: &[u16]) -> SubmitResult {
    Ok(self.next_tsn())
  }

  fn configure_reporting(
    &mut self,
    _nwk: Nwk,
    _endpoint: u8,
    _cluster: u16,
    _attr: u16,
    _min_s: u16,
    _max_s: u16,
  ) -> SubmitResult {
    Ok(self.next_tsn())
  }

  fn bind(&mut self, _nwk: Nwk, _endpoint: u8, _cluster: u16, _dst: Eui64) -> SubmitResult {
    Ok(self.next_tsn())
  }
}
