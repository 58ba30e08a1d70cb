//! Shared leaf types used across the registry, capability mapper, event bus,
//! MQTT adapter, and HA discovery.
//!
//! Kept in one module, rather than defined inside whichever component first
//! needs them, to avoid a cyclic collaborator graph: the event bus must not
//! depend on the registry module (and vice versa) just to share a type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 64-bit IEEE extended unique identifier. Stable per device.
pub type Eui64 = u64;

/// 16-bit short network address. Ephemeral; `NWK_UNKNOWN` until assigned.
pub type Nwk = u16;
pub const NWK_UNKNOWN: Nwk = 0xFFFF;

/// Bridge-internal correlation id. `0` means fire-and-forget.
pub type CorrId = u32;

/// Radio-stack transaction sequence number.
pub type Tsn = u8;

pub fn format_eui64(eui64: Eui64) -> String {
  format!("{eui64:016x}")
}

/// Stable `src_id` tags stamped on every [`crate::eventbus::Event`], one per
/// publishing component. Kept in one place so two components never collide.
pub mod component_id {
  pub const SCHEDULER: u8 = 0;
  pub const EVENTBUS: u8 = 1;
  pub const PERSISTENCE: u8 = 2;
  pub const RADIO: u8 = 3;
  pub const REGISTRY: u8 = 4;
  pub const INTERVIEW: u8 = 5;
  pub const CAPABILITY: u8 = 6;
  pub const MQTT: u8 = 7;
  pub const HA_DISCOVERY: u8 = 8;
  pub const BRIDGE: u8 = 9;
}

/// A small, fixed-capacity, `Copy` byte buffer — the Rust analogue of the
/// source's `char str[32]` / `uint8_t value[32]` inline buffers. Used only
/// on the radio-callback → event-bus path, which must never allocate.
#[derive(Clone, Copy)]
pub struct FixedBytes<const N: usize> {
  len: u8,
  data: [u8; N],
}

impl<const N: usize> FixedBytes<N> {
  pub fn from_slice(bytes: &[u8]) -> Self {
    let mut data = [0u8; N];
    let len = bytes.len().min(N);
    data[..len].copy_from_slice(&bytes[..len]);
    FixedBytes {
      len: len as u8,
      data,
    }
  }

  pub fn as_slice(&self) -> &[u8] {
    &self.data[..self.len as usize]
  }

  pub fn len(&self) -> usize {
    self.len as usize
  }

  pub fn is_empty(&self) -> bool {
    self.len == 0
  }
}

impl<const N: usize> fmt::Debug for FixedBytes<N> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "FixedBytes({:?})", self.as_slice())
  }
}

impl<const N: usize> PartialEq for FixedBytes<N> {
  fn eq(&self, other: &Self) -> bool {
    self.as_slice() == other.as_slice()
  }
}

pub type FixedStr32 = FixedBytes<32>;

/// Zigbee attribute data type discriminant (`reg_attr_type_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttrType {
  Bool,
  U8,
  U16,
  U32,
  S8,
  S16,
  S32,
  String,
  Array,
}

/// A tagged attribute value (`reg_attr_value_t`). `Copy`: carried inline on
/// the ISR-safe radio-adapter → event-bus path without allocation.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AttrValue {
  Bool(bool),
  U8(u8),
  U16(u16),
  U32(u32),
  S8(i8),
  S16(i16),
  S32(i32),
  Str(FixedStr32),
  Array(FixedStr32),
}

impl AttrValue {
  pub fn attr_type(&self) -> AttrType {
    match self {
      AttrValue::Bool(_) => AttrType::Bool,
      AttrValue::U8(_) => AttrType::U8,
      AttrValue::U16(_) => AttrType::U16,
      AttrValue::U32(_) => AttrType::U32,
      AttrValue::S8(_) => AttrType::S8,
      AttrValue::S16(_) => AttrType::S16,
      AttrValue::S32(_) => AttrType::S32,
      AttrValue::Str(_) => AttrType::String,
      AttrValue::Array(_) => AttrType::Array,
    }
  }

  /// Widen to a plain signed integer, for clusters whose capability mapping
  /// treats the raw attribute as an integer.
  pub fn as_i64(&self) -> Option<i64> {
    match *self {
      AttrValue::Bool(b) => Some(b as i64),
      AttrValue::U8(v) => Some(v as i64),
      AttrValue::U16(v) => Some(v as i64),
      AttrValue::U32(v) => Some(v as i64),
      AttrValue::S8(v) => Some(v as i64),
      AttrValue::S16(v) => Some(v as i64),
      AttrValue::S32(v) => Some(v as i64),
      _ => None,
    }
  }

  pub fn as_bool(&self) -> Option<bool> {
    match *self {
      AttrValue::Bool(b) => Some(b),
      _ => None,
    }
  }
}

/// Power source classification (`reg_power_source_t`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PowerSource {
  #[default]
  Unknown,
  Mains,
  Battery,
  Dc,
}

/// The closed set of semantic capabilities the capability mapper produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
  SwitchOn,
  LightOn,
  LightLevel,
  LightColorTemp,
  SensorTemperature,
  SensorHumidity,
  SensorContact,
  SensorMotion,
  SensorIlluminance,
  PowerWatts,
  EnergyKwh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
  Bool,
  Int,
  Float,
  String,
}

impl Capability {
  /// Stable dotted name used on the wire (MQTT topics, HA unique ids).
  pub fn name(&self) -> &'static str {
    match self {
      Capability::SwitchOn => "switch.on",
      Capability::LightOn => "light.on",
      Capability::LightLevel => "light.level",
      Capability::LightColorTemp => "light.color_temp",
      Capability::SensorTemperature => "sensor.temperature",
      Capability::SensorHumidity => "sensor.humidity",
      Capability::SensorContact => "sensor.contact",
      Capability::SensorMotion => "sensor.motion",
      Capability::SensorIlluminance => "sensor.illuminance",
      Capability::PowerWatts => "power.watts",
      Capability::EnergyKwh => "energy.kwh",
    }
  }

  pub fn value_kind(&self) -> ValueKind {
    match self {
      Capability::SwitchOn
      | Capability::LightOn
      | Capability::SensorContact
      | Capability::SensorMotion => ValueKind::Bool,
      Capability::LightLevel | Capability::LightColorTemp | Capability::SensorIlluminance => {
        ValueKind::Int
      }
      Capability::SensorTemperature
      | Capability::SensorHumidity
      | Capability::PowerWatts
      | Capability::EnergyKwh => ValueKind::Float,
    }
  }

  pub fn unit(&self) -> &'static str {
    match self {
      Capability::SwitchOn | Capability::LightOn | Capability::SensorContact | Capability::SensorMotion => "",
      Capability::LightLevel => "%",
      Capability::LightColorTemp => "mired",
      Capability::SensorTemperature => "°C",
      Capability::SensorHumidity => "%",
      Capability::SensorIlluminance => "lx",
      Capability::PowerWatts => "W",
      Capability::EnergyKwh => "kWh",
    }
  }

  /// Reverse of [`Capability::name`] (MQTT topic parsing, HA discovery).
  pub fn from_name(name: &str) -> Option<Capability> {
    Capability::ALL.iter().copied().find(|c| c.name() == name)
  }

  pub const ALL: &'static [Capability] = &[
    Capability::SwitchOn,
    Capability::LightOn,
    Capability::LightLevel,
    Capability::LightColorTemp,
    Capability::SensorTemperature,
    Capability::SensorHumidity,
    Capability::SensorContact,
    Capability::SensorMotion,
    Capability::SensorIlluminance,
    Capability::PowerWatts,
    Capability::EnergyKwh,
  ];
}

/// A capability value. Not on the ISR path (only ever produced by the
/// capability-mapper task), so a heap-allocated `String` variant is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CapValue {
  Bool(bool),
  Int(i32),
  Float(f32),
  Str(String),
}

impl CapValue {
  pub fn as_bool(&self) -> Option<bool> {
    match self {
      CapValue::Bool(b) => Some(*b),
      _ => None,
    }
  }

  pub fn as_int(&self) -> Option<i32> {
    match self {
      CapValue::Int(i) => Some(*i),
      _ => None,
    }
  }

  pub fn as_float(&self) -> Option<f32> {
    match self {
      CapValue::Float(f) => Some(*f),
      _ => None,
    }
  }
}

/// Command kinds accepted by the capability mapper's `execute` (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapCmdType {
  Set,
  Toggle,
  Increment,
  Decrement,
}
