//! Home Assistant MQTT discovery.
//!
//! Generates and publishes (or retracts) discovery documents under
//! `homeassistant/<component>/<bridge>_<hex>_<suffix>/config`. A node
//! exposing both `light.on` and `light.level` is merged into one light
//! entity with brightness, matching `ha_disc.c`'s `publish_light_discovery`;
//! every other capability gets its own document.

use std::cell::RefCell;

use log::{info, warn};
use serde_json::json;

use crate::capability::CapabilityMapper;
use crate::error::{BridgeError, Result};
use crate::model::{Capability, Eui64};
use crate::mqtt::{MqttAdapter, MqttState};
use crate::registry::{Node, NodeState, Registry};

/// `HA_BRIDGE_ID` in the source.
pub const BRIDGE_ID: &str = "zigbee_bridge";
/// `HA_MAX_PENDING`.
pub const M_PENDING: usize = 32;

/// Capabilities published as their own standalone sensor/binary_sensor
/// document (everything except the light.on/light.level merge and the
/// standalone switch.on entity). `LightColorTemp` has no counterpart in
/// the source's discovery service; it is included here as a plain numeric
/// sensor rather than folded into the light entity, to keep the merge
/// logic limited to the on/off + brightness case the source models.
const SENSOR_CAPS: &[Capability] = &[
  Capability::SensorTemperature,
  Capability::SensorHumidity,
  Capability::SensorContact,
  Capability::SensorMotion,
  Capability::SensorIlluminance,
  Capability::PowerWatts,
  Capability::EnergyKwh,
  Capability::LightColorTemp,
];

fn sanitize(cap_name: &str) -> String {
  cap_name.replace('.', "_")
}

fn device_name(node: &Node) -> String {
  if !node.friendly_name.is_empty() {
    node.friendly_name.clone()
  } else if !node.model.is_empty() {
    node.model.clone()
  } else {
    format!("Zigbee {:016x}", node.ieee_addr)
  }
}

fn device_block(node: &Node) -> serde_json::Value {
  json!({
    "identifiers": [format!("{BRIDGE_ID}_{:016x}", node.ieee_addr)],
    "name": device_name(node),
    "manufacturer": node.manufacturer,
    "model": node.model,
  })
}

fn sensor_component_and_class(cap: Capability) -> (&'static str, &'static str) {
  match cap {
    Capability::SensorTemperature => ("sensor", "temperature"),
    Capability::SensorHumidity => ("sensor", "humidity"),
    Capability::SensorContact => ("binary_sensor", "door"),
    Capability::SensorMotion => ("binary_sensor", "motion"),
    Capability::SensorIlluminance => ("sensor", "illuminance"),
    Capability::PowerWatts => ("sensor", "power"),
    Capability::EnergyKwh => ("sensor", "energy"),
    _ => ("sensor", ""),
  }
}

fn light_discovery(node: &Node, has_level: bool) -> (String, Vec<u8>) {
  let eui64 = node.ieee_addr;
  let topic = format!("homeassistant/light/{BRIDGE_ID}_{eui64:016x}_light/config");
  let mut payload = json!({
    "name": device_name(node),
    "unique_id": format!("{BRIDGE_ID}_{eui64:016x}_light"),
    "availability_topic": "bridge/status",
    "payload_available": "online",
    "payload_not_available": "offline",
    "state_topic": format!("bridge/{eui64:016x}/light.on/state"),
    "command_topic": format!("bridge/{eui64:016x}/light.on/set"),
    "value_template": "{{ value_json.v }}",
    "state_value_template": "{{ 'ON' if value_json.v else 'OFF' }}",
    "payload_on": "{\"v\":true}",
    "payload_off": "{\"v\":false}",
    "device": device_block(node),
  });
  if has_level {
    payload["brightness_state_topic"] = json!(format!("bridge/{eui64:016x}/light.level/state"));
    payload["brightness_command_topic"] = json!(format!("bridge/{eui64:016x}/light.level/set"));
    payload["brightness_value_template"] = json!("{{ (value_json.v | float * 2.55) | int }}");
    payload["brightness_scale"] = json!(255);
  }
  (topic, payload.to_string().into_bytes())
}

fn switch_discovery(node: &Node) -> (String, Vec<u8>) {
  let eui64 = node.ieee_addr;
  let topic = format!("homeassistant/switch/{BRIDGE_ID}_{eui64:016x}_switch_on/config");
  let payload = json!({
    "name": device_name(node),
    "unique_id": format!("{BRIDGE_ID}_{eui64:016x}_switch_on"),
    "availability_topic": "bridge/status",
    "payload_available": "online",
    "payload_not_available": "offline",
    "state_topic": format!("bridge/{eui64:016x}/switch.on/state"),
    "command_topic": format!("bridge/{eui64:016x}/switch.on/set"),
    "value_template": "{{ value_json.v }}",
    "state_value_template": "{{ 'ON' if value_json.v else 'OFF' }}",
    "payload_on": "{\"v\":true}",
    "payload_off": "{\"v\":false}",
    "device": device_block(node),
  });
  (topic, payload.to_string().into_bytes())
}

fn sensor_discovery(node: &Node, cap: Capability) -> (String, Vec<u8>) {
  let eui64 = node.ieee_addr;
  let cap_sanitized = sanitize(cap.name());
  let (component, device_class) = sensor_component_and_class(cap);
  let topic = format!("homeassistant/{component}/{BRIDGE_ID}_{eui64:016x}_{cap_sanitized}/config");
  let mut payload = json!({
    "name": format!("{} {}", device_name(node), cap.name()),
    "unique_id": format!("{BRIDGE_ID}_{eui64:016x}_{cap_sanitized}"),
    "state_topic": format!("bridge/{eui64:016x}/{}/state", cap.name()),
    "value_template": "{{ value_json.v }}",
    "availability_topic": "bridge/status",
    "payload_available": "online",
    "payload_not_available": "offline",
    "device": device_block(node),
  });
  if !cap.unit().is_empty() {
    payload["unit_of_measurement"] = json!(cap.unit());
  }
  if !device_class.is_empty() {
    payload["device_class"] = json!(device_class);
  }
  (topic, payload.to_string().into_bytes())
}

pub struct HaDiscovery<'a> {
  registry: &'a Registry<'a>,
  capability: &'a CapabilityMapper<'a>,
  mqtt: &'a MqttAdapter<'a>,
  pending: RefCell<Vec<Eui64>>,
}

impl<'a> HaDiscovery<'a> {
  pub fn new(registry: &'a Registry<'a>, capability: &'a CapabilityMapper<'a>, mqtt: &'a MqttAdapter<'a>) -> Self {
    HaDiscovery {
      registry,
      capability,
      mqtt,
      pending: RefCell::new(Vec::new()),
    }
  }

  pub fn pending_count(&self) -> usize {
    self.pending.borrow().len()
  }

  fn add_pending(&self, eui64: Eui64) {
    let mut pending = self.pending.borrow_mut();
    if pending.contains(&eui64) {
      return;
    }
    if pending.len() >= M_PENDING {
      warn!(target: "zb2mqtt::ha_discovery", "pending queue full, cannot add node {eui64:016x}");
      return;
    }
    pending.push(eui64);
  }

  /// Publishes every discovery document applicable to `eui64`'s current
  /// capability set. Queues the node instead if MQTT is not yet connected.
  pub fn publish_node(&self, eui64: Eui64) -> Result<()> {
    if self.mqtt.state() != MqttState::Connected {
      self.add_pending(eui64);
      return Ok(());
    }
    let node = self.registry.find_node(eui64).ok_or(BridgeError::NotFound)?;
    if node.state != NodeState::Ready {
      return Err(BridgeError::NotFound);
    }

    info!(target: "zb2mqtt::ha_discovery", "publishing discovery for node {eui64:016x}");
    let mut first_err = None;

    if self.capability.has_cap(eui64, Capability::LightOn) {
      let has_level = self.capability.has_cap(eui64, Capability::LightLevel);
      let (topic, payload) = light_discovery(&node, has_level);
      if let Err(e) = self.mqtt.publish_raw(&topic, &payload, true) {
        warn!(target: "zb2mqtt::ha_discovery", "light discovery publish failed for {eui64:016x}: {e}");
        first_err.get_or_insert(e);
      }
    }
    if self.capability.has_cap(eui64, Capability::SwitchOn) {
      let (topic, payload) = switch_discovery(&node);
      if let Err(e) = self.mqtt.publish_raw(&topic, &payload, true) {
        warn!(target: "zb2mqtt::ha_discovery", "switch discovery publish failed for {eui64:016x}: {e}");
        first_err.get_or_insert(e);
      }
    }
    for &cap in SENSOR_CAPS {
      if self.capability.has_cap(eui64, cap) {
        let (topic, payload) = sensor_discovery(&node, cap);
        if let Err(e) = self.mqtt.publish_raw(&topic, &payload, true) {
          warn!(target: "zb2mqtt::ha_discovery", "{} discovery publish failed for {eui64:016x}: {e}", cap.name());
          first_err.get_or_insert(e);
        }
      }
    }

    first_err.map_or(Ok(()), Err)
  }

  /// Retracts every discovery document `eui64` could plausibly have had, by
  /// publishing a retained empty payload at each topic, regardless of
  /// whether the node ever actually had that capability (mirrors the
  /// source's unconditional sensor-removal loop, which is harmless against
  /// a topic nobody ever populated).
  pub fn unpublish_node(&self, eui64: Eui64) -> Result<()> {
    if self.mqtt.state() != MqttState::Connected {
      return Err(BridgeError::NotReady);
    }
    info!(target: "zb2mqtt::ha_discovery", "unpublishing discovery for node {eui64:016x}");
    let mut first_err = None;

    let light_topic = format!("homeassistant/light/{BRIDGE_ID}_{eui64:016x}_light/config");
    if let Err(e) = self.mqtt.publish_raw(&light_topic, b"", true) {
      first_err.get_or_insert(e);
    }
    let switch_topic = format!("homeassistant/switch/{BRIDGE_ID}_{eui64:016x}_switch_on/config");
    if let Err(e) = self.mqtt.publish_raw(&switch_topic, b"", true) {
      first_err.get_or_insert(e);
    }
    for &cap in SENSOR_CAPS {
      let (component, _) = sensor_component_and_class(cap);
      let topic = format!("homeassistant/{component}/{BRIDGE_ID}_{eui64:016x}_{}/config", sanitize(cap.name()));
      if let Err(e) = self.mqtt.publish_raw(&topic, b"", true) {
        first_err.get_or_insert(e);
      }
    }

    first_err.map_or(Ok(()), Err)
  }

  /// Replays every queued node once MQTT is connected (subscribed to the
  /// adapter's connect event by the composition root).
  pub fn flush_pending(&self) -> u32 {
    if self.mqtt.state() != MqttState::Connected {
      return 0;
    }
    let queued: Vec<Eui64> = self.pending.borrow_mut().drain(..).collect();
    let mut flushed = 0;
    for eui64 in queued {
      match self.publish_node(eui64) {
        Ok(()) => flushed += 1,
        Err(e) => warn!(target: "zb2mqtt::ha_discovery", "flush publish failed for {eui64:016x}: {e}"),
      }
    }
    if flushed > 0 {
      info!(target: "zb2mqtt::ha_discovery", "flushed {flushed} pending discovery publishes");
    }
    flushed
  }

  /// Republishes discovery for every already-`Ready` node. Intended to be
  /// called once by the composition root after the registry has been
  /// restored and the MQTT adapter reaches `Connected` following a restart
  /// (retained discovery documents cannot be assumed to have survived a
  /// Home Assistant restart either).
  pub fn publish_all(&self) -> u32 {
    let mut count = 0;
    for eui64 in self.registry.all_ready_nodes() {
      if self.publish_node(eui64).is_ok() {
        count += 1;
      }
    }
    info!(target: "zb2mqtt::ha_discovery", "published discovery for {count} nodes");
    count
  }

  /// External handler: a node left the network.
  pub fn on_node_removed(&self, eui64: Eui64) {
    if let Err(e) = self.unpublish_node(eui64) {
      warn!(target: "zb2mqtt::ha_discovery", "failed to unpublish {eui64:016x}: {e}");
    }
  }

  /// External handler: the MQTT adapter just reached `Connected`.
  pub fn on_mqtt_connected(&self) {
    self.flush_pending();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::Clock;
  use crate::eventbus::EventBus;
  use crate::model::AttrValue;
  use crate::mqtt::{LoopbackTransport, MqttConfig};
  use crate::registry::{Cluster, ClusterDir, Endpoint};

  struct Harness {
    clock: Clock,
    bus: EventBus,
  }

  fn harness() -> Harness {
    let clock = Clock::new();
    let bus = EventBus::new(clock.clone());
    Harness { clock, bus }
  }

  fn light_node(registry: &Registry, eui64: Eui64) {
    registry.add_node(eui64, 0x1111).unwrap();
    registry
      .with_node(eui64, |n| {
        n.state = NodeState::Ready;
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
  fn publish_node_queues_while_mqtt_disconnected() {
    let h = harness();
    let registry = Registry::new(h.clock.clone(), &h.bus);
    light_node(&registry, 0xAA);
    let mapper = CapabilityMapper::new(h.clock.clone(), &h.bus, &registry);
    mapper.compute_for_node(0xAA).unwrap();
    let mqtt = MqttAdapter::new(h.clock.clone(), &h.bus, MqttConfig::default(), Box::new(LoopbackTransport::new()));
    let disc = HaDiscovery::new(&registry, &mapper, &mqtt);

    disc.publish_node(0xAA).unwrap();
    assert_eq!(disc.pending_count(), 1);
  }

  #[test]
  fn publish_node_emits_merged_light_entity_with_brightness() {
    let h = harness();
    let registry = Registry::new(h.clock.clone(), &h.bus);
    light_node(&registry, 0xAA);
    let mapper = CapabilityMapper::new(h.clock.clone(), &h.bus, &registry);
    mapper.compute_for_node(0xAA).unwrap();
    mapper.handle_report(0xAA, 1, 0x0006, 0x0000, AttrValue::Bool(true)).unwrap();
    h.bus.dispatch(0);

    let mqtt = MqttAdapter::new(h.clock.clone(), &h.bus, MqttConfig::default(), Box::new(LoopbackTransport::new()));
    mqtt.connect().unwrap();
    let disc = HaDiscovery::new(&registry, &mapper, &mqtt);
    disc.publish_node(0xAA).unwrap();

    // one retained light/config publish among connect's own status publish.
    assert_eq!(disc.pending_count(), 0);
  }

  #[test]
  fn flush_pending_replays_once_connected() {
    let h = harness();
    let registry = Registry::new(h.clock.clone(), &h.bus);
    light_node(&registry, 0xAA);
    let mapper = CapabilityMapper::new(h.clock.clone(), &h.bus, &registry);
    mapper.compute_for_node(0xAA).unwrap();

    let mqtt = MqttAdapter::new(h.clock.clone(), &h.bus, MqttConfig::default(), Box::new(LoopbackTransport::new()));
    let disc = HaDiscovery::new(&registry, &mapper, &mqtt);
    disc.publish_node(0xAA).unwrap();
    assert_eq!(disc.pending_count(), 1);

    mqtt.connect().unwrap();
    let flushed = disc.flush_pending();
    assert_eq!(flushed, 1);
    assert_eq!(disc.pending_count(), 0);
  }

  #[test]
  fn unpublish_node_requires_connected_mqtt() {
    let h = harness();
    let registry = Registry::new(h.clock.clone(), &h.bus);
    light_node(&registry, 0xAA);
    let mapper = CapabilityMapper::new(h.clock.clone(), &h.bus, &registry);
    let mqtt = MqttAdapter::new(h.clock, &h.bus, MqttConfig::default(), Box::new(LoopbackTransport::new()));
    let disc = HaDiscovery::new(&registry, &mapper, &mqtt);
    let err = disc.unpublish_node(0xAA).unwrap_err();
    assert_eq!(err, BridgeError::NotReady);
  }

  #[test]
  fn publish_all_counts_ready_nodes_only() {
    let h = harness();
    let registry = Registry::new(h.clock.clone(), &h.bus);
    light_node(&registry, 0xAA);
    registry.add_node(0xBB, 0x2222).unwrap(); // left in New, not Ready
    let mapper = CapabilityMapper::new(h.clock.clone(), &h.bus, &registry);
    mapper.compute_for_node(0xAA).unwrap();
    let mqtt = MqttAdapter::new(h.clock, &h.bus, MqttConfig::default(), Box::new(LoopbackTransport::new()));
    mqtt.connect().unwrap();
    let disc = HaDiscovery::new(&registry, &mapper, &mqtt);
    assert_eq!(disc.publish_all(), 1);
  }
}
