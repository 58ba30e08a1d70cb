//! Capability mapper.
//!
//! Maps Zigbee cluster/attribute pairs to the closed `Capability` vocabulary
//! (`model.rs`), maintaining a per-node fixed-slot cache exactly as the
//! source's `capability.c` does, with the quirks table (C8) spliced in on
//! both the report and command paths.

pub mod quirks;

use std::cell::RefCell;

use log::{debug, info, warn};

use crate::clock::{Clock, Tick};
use crate::error::{BridgeError, Result};
use crate::eventbus::{event_type, EventBus, Payload};
use crate::model::{component_id, AttrValue, CapCmdType, CapValue, Capability, Eui64};
use crate::registry::Registry;

/// `MAX_NODE_CAPS` in the source's `capability.c`.
pub const K_CAP: usize = 8;
/// `MAX_CAP_CACHE`.
pub const M_CACHE: usize = 32;

/// Zigbee HA-profile lighting device ids (`0x0100`-`0x010C`), used to decide
/// whether an `0x0006` OnOff cluster maps to `light.on` or the generic
/// `switch.on` (the source's simulated devices only ever exercise the light
/// case, so this crate resolves the ambiguity by endpoint device id).
fn is_light_device(device_id: u16) -> bool {
  (0x0100..=0x010C).contains(&device_id)
}

struct ClusterMapEntry {
  cluster_id: u16,
  attr_id: u16,
  resolve: fn(u16) -> Capability,
}

static CLUSTER_MAP: &[ClusterMapEntry] = &[
  ClusterMapEntry { cluster_id: 0x0006, attr_id: 0x0000, resolve: |d| if is_light_device(d) { Capability::LightOn } else { Capability::SwitchOn } },
  ClusterMapEntry { cluster_id: 0x0008, attr_id: 0x0000, resolve: |_| Capability::LightLevel },
  ClusterMapEntry { cluster_id: 0x0300, attr_id: 0x0007, resolve: |_| Capability::LightColorTemp },
  ClusterMapEntry { cluster_id: 0x0402, attr_id: 0x0000, resolve: |_| Capability::SensorTemperature },
  ClusterMapEntry { cluster_id: 0x0405, attr_id: 0x0000, resolve: |_| Capability::SensorHumidity },
  ClusterMapEntry { cluster_id: 0x0500, attr_id: 0x0002, resolve: |_| Capability::SensorContact },
  ClusterMapEntry { cluster_id: 0x0406, attr_id: 0x0000, resolve: |_| Capability::SensorMotion },
  ClusterMapEntry { cluster_id: 0x0400, attr_id: 0x0000, resolve: |_| Capability::SensorIlluminance },
  ClusterMapEntry { cluster_id: 0x0702, attr_id: 0x0000, resolve: |_| Capability::EnergyKwh },
  ClusterMapEntry { cluster_id: 0x0B04, attr_id: 0x050B, resolve: |_| Capability::PowerWatts },
];

fn cap_to_cluster(cap: Capability) -> Option<(u16, u16)> {
  CLUSTER_MAP
    .iter()
    .find(|e| (e.resolve)(0x0100) == cap || (e.resolve)(0x0000) == cap)
    .map(|e| (e.cluster_id, e.attr_id))
}

fn convert_report_value(cap: Capability, raw: AttrValue) -> CapValue {
  let raw_i = raw.as_i64().unwrap_or(0);
  match cap {
    Capability::LightOn | Capability::SwitchOn | Capability::SensorMotion => {
      CapValue::Bool(raw.as_bool().unwrap_or(raw_i != 0))
    }
    Capability::SensorContact => CapValue::Bool(raw_i & 0x1 != 0),
    Capability::LightLevel => CapValue::Int(((raw_i * 100) / 254) as i32),
    Capability::LightColorTemp | Capability::SensorIlluminance => CapValue::Int(raw_i as i32),
    Capability::SensorTemperature | Capability::SensorHumidity => CapValue::Float(raw_i as f32 / 100.0),
    Capability::PowerWatts | Capability::EnergyKwh => CapValue::Float(raw_i as f32),
  }
}

#[derive(Debug, Clone)]
struct CapState {
  cap: Capability,
  value: Option<CapValue>,
  timestamp: Tick,
}

struct NodeCapCache {
  eui64: Eui64,
  caps: Vec<CapState>,
}

pub struct CapabilityMapper<'a> {
  clock: Clock,
  bus: &'a EventBus,
  registry: &'a Registry<'a>,
  cache: RefCell<Vec<NodeCapCache>>,
}

impl<'a> CapabilityMapper<'a> {
  pub fn new(clock: Clock, bus: &'a EventBus, registry: &'a Registry<'a>) -> Self {
    CapabilityMapper { clock, bus, registry, cache: RefCell::new(Vec::new()) }
  }

  fn find_or_alloc_cache(&self, eui64: Eui64) -> Result<usize> {
    let mut cache = self.cache.borrow_mut();
    if let Some(i) = cache.iter().position(|c| c.eui64 == eui64) {
      return Ok(i);
    }
    if cache.len() >= M_CACHE {
      return Err(BridgeError::NoMem);
    }
    cache.push(NodeCapCache { eui64, caps: Vec::new() });
    Ok(cache.len() - 1)
  }

  /// Recomputes the capability set for `eui64` from its current registry
  /// endpoints/clusters. Existing values are discarded (the source clears
  /// `cap_count` unconditionally on every recompute).
  pub fn compute_for_node(&self, eui64: Eui64) -> Result<u32> {
    let node = self.registry.find_node(eui64).ok_or(BridgeError::NotFound)?;
    let idx = self.find_or_alloc_cache(eui64)?;
    let mut caps = Vec::new();
    for ep in &node.endpoints {
      for cluster in &ep.clusters {
        if let Some(entry) = CLUSTER_MAP.iter().find(|e| e.cluster_id == cluster.cluster_id) {
          if caps.len() >= K_CAP {
            break;
          }
          let cap = (entry.resolve)(ep.device_id);
          caps.push(CapState { cap, value: None, timestamp: 0 });
        }
      }
    }
    let count = caps.len() as u32;
    self.cache.borrow_mut()[idx].caps = caps;
    info!(target: "zb2mqtt::capability", "node {eui64:016x}: computed {count} capabilities");
    Ok(count)
  }

  pub fn get_value(&self, eui64: Eui64, cap: Capability) -> Option<CapValue> {
    self
      .cache
      .borrow()
      .iter()
      .find(|c| c.eui64 == eui64)
      .and_then(|c| c.caps.iter().find(|s| s.cap == cap))
      .and_then(|s| s.value.clone())
  }

  /// Whether `cap` was discovered for `eui64` by [`Self::compute_for_node`],
  /// independent of whether any value has been reported yet (mirrors the
  /// source's `cap_get_state`, which succeeds once the slot exists).
  pub fn has_cap(&self, eui64: Eui64, cap: Capability) -> bool {
    self
      .cache
      .borrow()
      .iter()
      .find(|c| c.eui64 == eui64)
      .is_some_and(|c| c.caps.iter().any(|s| s.cap == cap))
  }

  /// Ingests a decoded Zigbee attribute report, applying conversion and
  /// quirks, and unconditionally emits `CAP_STATE_CHANGED` (no dedup against
  /// the previous value).
  pub fn handle_report(&self, eui64: Eui64, _endpoint: u8, cluster: u16, attr: u16, value: AttrValue) -> Result<()> {
    let Some(entry) = CLUSTER_MAP.iter().find(|e| e.cluster_id == cluster && e.attr_id == attr) else {
      return Ok(()); // unmapped attribute, silently skipped
    };
    let node = self.registry.find_node(eui64).ok_or(BridgeError::NotFound)?;
    let device_id = node.endpoints.iter().find(|e| e.find_cluster(cluster).is_some()).map(|e| e.device_id).unwrap_or(0);
    let cap = (entry.resolve)(device_id);

    let mut converted = convert_report_value(cap, value);
    if let Some(quirk) = quirks::find(&node.manufacturer, &node.model) {
      if quirks::apply_value(quirk, cap, &mut converted) {
        debug!(target: "zb2mqtt::capability", "quirk applied to {} for {eui64:016x}", cap.name());
      }
    }

    let now = self.clock.now_ticks();
    let mut cache = self.cache.borrow_mut();
    let node_cache = cache.iter_mut().find(|c| c.eui64 == eui64).ok_or(BridgeError::NotFound)?;
    let slot = node_cache.caps.iter_mut().find(|s| s.cap == cap).ok_or(BridgeError::NotFound)?;
    slot.value = Some(converted.clone());
    slot.timestamp = now;
    drop(cache);

    let _ = self.bus.emit(
      event_type::CAP_STATE_CHANGED,
      0,
      component_id::CAPABILITY,
      Payload::CapStateChanged { eui64, cap, value: converted },
    );
    Ok(())
  }

  /// Executes a capability command: reverse-maps to a
  /// cluster, resolves `Toggle`/`Increment`/`Decrement` against the cached
  /// value, applies the inverse quirk transform, and emits `CAP_COMMAND` for
  /// the radio adapter (C4) to submit. This crate does not call the radio
  /// adapter directly from here, matching the source's decoupled
  /// event-emission boundary between the capability and Zigbee layers.
  pub fn execute(
    &self,
    eui64: Eui64,
    endpoint: u8,
    cap: Capability,
    cmd_type: CapCmdType,
    value: Option<CapValue>,
    corr_id: u32,
  ) -> Result<()> {
    let (cluster, _attr) = cap_to_cluster(cap).ok_or(BridgeError::NotFound)?;
    let node = self.registry.find_node(eui64).ok_or(BridgeError::NotFound)?;

    let current = self.get_value(eui64, cap);
    let mut target = match cmd_type {
      CapCmdType::Set => value.ok_or_else(|| BridgeError::InvalidArg("Set requires a value".to_string()))?,
      CapCmdType::Toggle => {
        let cur = current.and_then(|v| v.as_bool()).unwrap_or(false);
        CapValue::Bool(!cur)
      }
      CapCmdType::Increment | CapCmdType::Decrement => {
        let delta = value.as_ref().and_then(|v| v.as_int()).unwrap_or(1);
        let signed_delta = if cmd_type == CapCmdType::Decrement { -delta } else { delta };
        let cur = current.as_ref().and_then(|v| v.as_int()).unwrap_or(0);
        CapValue::Int(cur + signed_delta)
      }
    };

    if let Some(quirk) = quirks::find(&node.manufacturer, &node.model) {
      quirks::apply_command(quirk, cap, &mut target);
    }

    debug!(target: "zb2mqtt::capability", "execute {} on {eui64:016x} ep{endpoint} (cluster {cluster:#06x})", cap.name());
    self.bus.emit(
      event_type::CAP_COMMAND,
      corr_id,
      component_id::CAPABILITY,
      Payload::CapCommand { eui64, endpoint, cap, cmd: cmd_type, value: Some(target), corr_id },
    )?;
    Ok(())
  }

  pub fn cache_size(&self) -> usize {
    self.cache.borrow().len()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::eventbus::EventFilter;
  use crate::registry::{Cluster, ClusterDir, Endpoint};
  use std::cell::Cell;
  use std::rc::Rc;

  fn harness() -> (Clock, EventBus) {
    let clock = Clock::new();
    (clock.clone(), EventBus::new(clock))
  }

  fn light_node(registry: &Registry, eui64: Eui64) {
    registry.add_node(eui64, 0x1111).unwrap();
    registry
      .with_node(eui64, |n| {
        n.manufacturer = "IKEA of Sweden".to_string();
        n.model = "TRADFRI bulb E27".to_string();
        n.endpoints.push(Endpoint {
          endpoint_id: 1,
          profile_id: 0x0104,
          device_id: 0x0100,
          clusters: vec![
            Cluster { cluster_id: 0x0006, direction: ClusterDir::Server, attributes: vec![] },
            Cluster { cluster_id: 0x0008, direction: ClusterDir::Server, attributes: vec![] },
          ],
        });
      })
      .unwrap();
  }

  #[test]
  fn compute_finds_light_on_and_level() {
    let (clock, bus) = harness();
    let registry = Registry::new(clock.clone(), &bus);
    light_node(&registry, 0xAA);
    let mapper = CapabilityMapper::new(clock, &bus, &registry);
    let n = mapper.compute_for_node(0xAA).unwrap();
    assert_eq!(n, 2);
    assert_eq!(mapper.get_value(0xAA, Capability::LightOn), None);
  }

  #[test]
  fn handle_report_scales_level_and_applies_quirk_clamp() {
    let (clock, bus) = harness();
    let registry = Registry::new(clock.clone(), &bus);
    light_node(&registry, 0xAA);
    let mapper = CapabilityMapper::new(clock, &bus, &registry);
    mapper.compute_for_node(0xAA).unwrap();
    mapper.handle_report(0xAA, 1, 0x0008, 0x0000, AttrValue::U8(0)).unwrap();
    // 0 scales to 0%, then the TRADFRI quirk clamps to a minimum of 1.
    assert_eq!(mapper.get_value(0xAA, Capability::LightLevel), Some(CapValue::Int(1)));
  }

  #[test]
  fn handle_report_emits_cap_state_changed() {
    let (clock, bus) = harness();
    let registry = Registry::new(clock.clone(), &bus);
    light_node(&registry, 0xAA);
    let mapper = CapabilityMapper::new(clock, &bus, &registry);
    mapper.compute_for_node(0xAA).unwrap();

    let seen = Rc::new(Cell::new(0u32));
    let seen2 = seen.clone();
    bus.subscribe(EventFilter::one(event_type::CAP_STATE_CHANGED), move |_e| seen2.set(seen2.get() + 1)).unwrap();
    mapper.handle_report(0xAA, 1, 0x0006, 0x0000, AttrValue::Bool(true)).unwrap();
    bus.dispatch(0);
    assert_eq!(seen.get(), 1);
  }

  #[test]
  fn unmapped_attribute_is_silently_skipped() {
    let (clock, bus) = harness();
    let registry = Registry::new(clock.clone(), &bus);
    light_node(&registry, 0xAA);
    let mapper = CapabilityMapper::new(clock, &bus, &registry);
    mapper.compute_for_node(0xAA).unwrap();
    mapper.handle_report(0xAA, 1, 0x0006, 0x00FF, AttrValue::Bool(true)).unwrap();
    assert_eq!(mapper.get_value(0xAA, Capability::LightOn), None);
  }

  #[test]
  fn execute_toggle_flips_cached_value_and_emits_cap_command() {
    let (clock, bus) = harness();
    let registry = Registry::new(clock.clone(), &bus);
    light_node(&registry, 0xAA);
    let mapper = CapabilityMapper::new(clock, &bus, &registry);
    mapper.compute_for_node(0xAA).unwrap();
    mapper.handle_report(0xAA, 1, 0x0006, 0x0000, AttrValue::Bool(false)).unwrap();
    bus.dispatch(0);

    let seen = Rc::new(Cell::new(0u32));
    let seen2 = seen.clone();
    bus
      .subscribe(EventFilter::one(event_type::CAP_COMMAND), move |e| {
        if let Payload::CapCommand { value: Some(CapValue::Bool(true)), .. } = &e.payload {
          seen2.set(seen2.get() + 1);
        }
      })
      .unwrap();
    mapper.execute(0xAA, 1, Capability::LightOn, CapCmdType::Toggle, None, 42).unwrap();
    bus.dispatch(0);
    assert_eq!(seen.get(), 1);
  }

  #[test]
  fn execute_set_without_value_is_invalid_arg() {
    let (clock, bus) = harness();
    let registry = Registry::new(clock.clone(), &bus);
    light_node(&registry, 0xAA);
    let mapper = CapabilityMapper::new(clock, &bus, &registry);
    let err = mapper.execute(0xAA, 1, Capability::LightOn, CapCmdType::Set, None, 1).unwrap_err();
    assert_eq!(err, BridgeError::InvalidArg("Set requires a value".to_string()));
  }
}
