//! The `RadioStack` collaborator boundary.
//!
//! The physical radio PHY and vendor SDK are out-of-scope collaborators;
//! this trait is the seam a hardware-backed implementation would fill. Only
//! the simulation variant (`sim::SimRadioStack`) ships by default.

use crate::error::Result;
use crate::model::{Eui64, Nwk, Tsn};

/// Asynchronous signals the stack pushes up through [`RadioCallbacks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackSignal {
  DeviceFirstStart,
  Reboot,
  FormationOk,
  FormationFailed,
}

/// A command submission result: the stack hands back a TSN synchronously;
/// the actual success/failure of the over-the-air exchange arrives later
/// via [`RadioCallbacks::on_send_status`].
pub type SubmitResult = Result<Tsn>;

/// Everything a command-submitting caller can ask the stack to do.
/// Mirrors `zb_adapter.h`'s `zba_*` function set.
pub trait RadioStack {
  fn start_coordinator(&mut self) -> Result<()>;
  fn set_permit_join(&mut self, seconds: u8) -> Result<()>;

  fn send_onoff(&mut self, nwk: Nwk, endpoint: u8, on: bool) -> SubmitResult;
  fn send_level(&mut self, nwk: Nwk, endpoint: u8, level_0_254: u8, transition_100ms: u16) -> SubmitResult;
  fn read_attrs(&mut self, nwk: Nwk, endpoint: u8, cluster: u16, attr_ids: &[u16]) -> SubmitResult;
  fn configure_reporting(
    &mut self,
    nwk: Nwk,
    endpoint: u8,
    cluster: u16,
    attr: u16,
    min_s: u16,
    max_s: u16,
  ) -> SubmitResult;
  fn bind(&mut self, nwk: Nwk, endpoint: u8, cluster: u16, dst: Eui64) -> SubmitResult;
}

// A hardware-backed `RadioStack` (ESP32-C6 + Zigbee SDK, matching the
// source's `zb_real.c`) would live behind the `hardware` feature and talk
// to the vendor stack's task/callback API directly; it is intentionally
// not implemented here; §1 scopes the physical radio stack as an external
// collaborator, not something this crate owns.
#[cfg(feature = "hardware")]
pub mod hardware {
  //! Placeholder module documenting the seam. Not compiled by default.
}
