//! Event and payload taxonomy.
//!
//! The source firmware carries every event as a `(type, payload[32])` pair
//! and leaves the receiver to reinterpret the raw bytes per type. A plain
//! Rust enum expresses the same closed taxonomy without that unsafe
//! reinterpretation, so `Payload` replaces the byte buffer. The bound the
//! source enforces with `sizeof(payload) <= 32` is kept here as a property
//! of the *variants themselves*: every variant used on the radio-callback
//! publish path is a handful of `Copy` scalars, so cloning a `Payload` on
//! that path is a bitwise copy, never a heap allocation, exactly as the
//! original ISR-safety requirement demands. Variants produced only from
//! scheduler-task context (capability/persistence events) may carry a
//! `String`; nothing on the ISR path ever constructs those.

use crate::clock::Tick;
use crate::model::{CapCmdType, Capability, CapValue, Eui64, Nwk, AttrValue};

/// Raw wire-style type id, kept as a plain integer (not a closed enum)
/// because subscriber filters (§4.2) test a contiguous `min..=max` range
/// that must also cover the open-ended user-reserved space (`>= USER_BASE`).
pub type EventType = u8;

pub mod event_type {
  use super::EventType;

  pub const BOOT: EventType = 0;
  pub const LOG: EventType = 1;
  pub const NET_UP: EventType = 2;
  pub const NET_DOWN: EventType = 3;

  pub const ZB_STACK_UP: EventType = 10;
  pub const ZB_STACK_DOWN: EventType = 11;
  pub const ZB_DEVICE_JOINED: EventType = 12;
  pub const ZB_DEVICE_LEFT: EventType = 13;
  pub const ZB_ANNOUNCE: EventType = 14;
  pub const ZB_DESC_ENDPOINTS: EventType = 15;
  pub const ZB_DESC_CLUSTERS: EventType = 16;
  pub const ZB_ATTR_REPORT: EventType = 17;
  pub const ZB_CMD_CONFIRM: EventType = 18;
  pub const ZB_CMD_ERROR: EventType = 19;
  pub const ZB_MAX: EventType = ZB_CMD_ERROR;

  pub const CAP_STATE_CHANGED: EventType = 30;
  pub const CAP_COMMAND: EventType = 31;

  pub const PERSIST_FLUSH: EventType = 40;

  /// First id available for bridge-internal or test use; open-ended above.
  pub const USER_BASE: EventType = 100;
}

/// A `[type_min, type_max]` subscription filter (§4.2). Use
/// [`EventFilter::one`] for a single type or [`EventFilter::range`] for a
/// contiguous band (the `ZB_*` family, for instance).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventFilter {
  pub type_min: EventType,
  pub type_max: EventType,
}

impl EventFilter {
  pub fn one(ty: EventType) -> Self {
    EventFilter {
      type_min: ty,
      type_max: ty,
    }
  }

  pub fn range(type_min: EventType, type_max: EventType) -> Self {
    EventFilter { type_min, type_max }
  }

  pub fn all() -> Self {
    EventFilter {
      type_min: EventType::MIN,
      type_max: EventType::MAX,
    }
  }

  pub fn radio() -> Self {
    EventFilter::range(event_type::ZB_STACK_UP, event_type::ZB_MAX)
  }

  pub fn matches(&self, ty: EventType) -> bool {
    ty >= self.type_min && ty <= self.type_max
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
  None,
  ZbDeviceJoined { eui64: Eui64, nwk: Nwk },
  ZbDeviceLeft { eui64: Eui64 },
  ZbAnnounce { eui64: Eui64, nwk: Nwk },
  ZbDescEndpoints { eui64: Eui64, endpoint_count: u8 },
  ZbDescClusters { eui64: Eui64, endpoint: u8, cluster_count: u8 },
  ZbAttrReport {
    eui64: Eui64,
    endpoint: u8,
    cluster: u16,
    attr: u16,
    value: AttrValue,
  },
  ZbCmdConfirm { corr_id: u32, tsn: u8 },
  ZbCmdError { corr_id: u32, err: &'static str },
  CapStateChanged { eui64: Eui64, cap: Capability, value: CapValue },
  CapCommand {
    eui64: Eui64,
    endpoint: u8,
    cap: Capability,
    cmd: CapCmdType,
    value: Option<CapValue>,
    corr_id: u32,
  },
  PersistFlush { records: u32 },
  User { id: u8, note: String },
}

/// A single bus event (§4.2). `timestamp` and `corr_id` are filled in by
/// [`super::EventBus::emit`]; construct with [`Event::new`] when the caller
/// already knows both (republishing a stored event in a test, say).
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
  pub ty: EventType,
  pub timestamp: Tick,
  pub corr_id: u32,
  pub src_id: u8,
  pub payload: Payload,
}

impl Event {
  pub fn new(ty: EventType, timestamp: Tick, corr_id: u32, src_id: u8, payload: Payload) -> Self {
    Event {
      ty,
      timestamp,
      corr_id,
      src_id,
      payload,
    }
  }
}
