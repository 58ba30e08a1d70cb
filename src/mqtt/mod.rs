//! MQTT northbound adapter.

pub mod transport;

use std::cell::{Cell, RefCell};

use log::{error, info, warn};
use serde::Deserialize;
use serde_json::json;

use crate::clock::{wrapping_diff, Clock, Tick};
use crate::error::{BridgeError, Result};
use crate::eventbus::{event_type, EventBus, Payload};
use crate::model::{component_id, CapCmdType, CapValue, Capability, Eui64};
pub use transport::{LoopbackTransport, MqttTransport};

/// `os_sleep(5000)` in the source's `mqtt_task` reconnect loop.
pub const T_RECONNECT_MS: u32 = 5000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MqttState {
  Disconnected,
  Connecting,
  Connected,
  Error,
}

impl MqttState {
  pub fn name(&self) -> &'static str {
    match self {
      MqttState::Disconnected => "DISCONNECTED",
      MqttState::Connecting => "CONNECTING",
      MqttState::Connected => "CONNECTED",
      MqttState::Error => "ERROR",
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
  pub broker_uri: String,
  pub client_id: String,
  pub username: Option<String>,
  pub password: Option<String>,
  pub keepalive_sec: u16,
}

impl Default for MqttConfig {
  fn default() -> Self {
    MqttConfig {
      broker_uri: "mqtt://localhost:1883".to_string(),
      client_id: "zigbee-bridge".to_string(),
      username: None,
      password: None,
      keepalive_sec: 30,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MqttStats {
  pub messages_published: u32,
  pub messages_received: u32,
  pub reconnects: u32,
  pub errors: u32,
}

fn state_topic(eui64: Eui64, cap: Capability) -> String {
  format!("bridge/{:016x}/{}/state", eui64, cap.name())
}

fn meta_topic(eui64: Eui64) -> String {
  format!("bridge/{:016x}/meta", eui64)
}

fn value_json(value: &CapValue) -> serde_json::Value {
  match value {
    CapValue::Bool(b) => json!(b),
    CapValue::Int(i) => json!(i),
    CapValue::Float(f) => json!(f),
    CapValue::Str(s) => json!(s),
  }
}

pub struct MqttAdapter<'a> {
  clock: Clock,
  /// Held only to hand outgoing `CAP_COMMAND`s back to the capability
  /// mapper when an inbound `.../set` message is decoded; the adapter
  /// otherwise has no reason to publish events of its own.
  bus: &'a EventBus,
  config: MqttConfig,
  transport: RefCell<Box<dyn MqttTransport>>,
  state: Cell<MqttState>,
  stats: RefCell<MqttStats>,
  last_attempt: Cell<Tick>,
  corr_seq: Cell<u32>,
}

impl<'a> MqttAdapter<'a> {
  pub fn new(clock: Clock, bus: &'a EventBus, config: MqttConfig, transport: Box<dyn MqttTransport>) -> Self {
    MqttAdapter {
      clock,
      bus,
      config,
      transport: RefCell::new(transport),
      state: Cell::new(MqttState::Disconnected),
      stats: RefCell::new(MqttStats::default()),
      last_attempt: Cell::new(0),
      corr_seq: Cell::new(0),
    }
  }

  pub fn state(&self) -> MqttState {
    self.state.get()
  }

  pub fn stats(&self) -> MqttStats {
    *self.stats.borrow()
  }

  /// Connects, publishes retained online status, and subscribes to command
  /// topics — mirrors `mqtt_connect` + `mqtt_subscribe_commands` run back to
  /// back in the source's `mqtt_task`. Idempotent while already `Connected`.
  pub fn connect(&self) -> Result<()> {
    if self.state.get() == MqttState::Connected {
      return Ok(());
    }
    info!(target: "zb2mqtt::mqtt", "connecting to {}...", self.config.broker_uri);
    self.state.set(MqttState::Connecting);
    let result = self.transport.borrow_mut().connect(&self.config.broker_uri, &self.config.client_id, self.config.keepalive_sec);
    match result {
      Ok(()) => {
        self.state.set(MqttState::Connected);
        self.publish_status(true)?;
        self.transport.borrow_mut().subscribe("bridge/+/+/set")?;
        Ok(())
      }
      Err(e) => {
        self.state.set(MqttState::Error);
        self.stats.borrow_mut().errors += 1;
        error!(target: "zb2mqtt::mqtt", "connect failed: {e}");
        Err(e)
      }
    }
  }

  pub fn disconnect(&self) -> Result<()> {
    if self.state.get() == MqttState::Connected {
      self.publish_status(false)?;
    }
    self.transport.borrow_mut().disconnect()?;
    self.state.set(MqttState::Disconnected);
    info!(target: "zb2mqtt::mqtt", "disconnected");
    Ok(())
  }

  /// Called at scheduler cadence; reattempts `connect` every `T_RECONNECT_MS`
  /// while in `Disconnected` or `Error`.
  pub fn tick(&self) {
    let now = self.clock.now_ticks();
    if self.state.get() == MqttState::Connected {
      return;
    }
    if wrapping_diff(now, self.last_attempt.get()) < T_RECONNECT_MS as i32 {
      return;
    }
    self.last_attempt.set(now);
    self.stats.borrow_mut().reconnects += 1;
    info!(target: "zb2mqtt::mqtt", "reconnecting...");
    let _ = self.connect();
  }

  /// Raw publish for collaborators outside the fixed state/meta/status
  /// scheme (the HA discovery service's `homeassistant/...` topics).
  pub fn publish_raw(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
    self.publish(topic, payload, retain)
  }

  fn publish(&self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
    if self.state.get() != MqttState::Connected {
      warn!(target: "zb2mqtt::mqtt", "not connected, cannot publish to {topic}");
      return Err(BridgeError::Busy);
    }
    self.transport.borrow_mut().publish(topic, payload, retain)?;
    self.stats.borrow_mut().messages_published += 1;
    Ok(())
  }

  pub fn publish_state(&self, eui64: Eui64, cap: Capability, value: &CapValue) -> Result<()> {
    let payload = json!({ "v": value_json(value), "ts": self.clock.now_ticks() });
    self.publish(&state_topic(eui64, cap), payload.to_string().as_bytes(), false)
  }

  pub fn publish_meta(&self, eui64: Eui64, manufacturer: &str, model: &str) -> Result<()> {
    let payload = json!({ "ieee": format!("{eui64:016x}"), "manufacturer": manufacturer, "model": model });
    self.publish(&meta_topic(eui64), payload.to_string().as_bytes(), false)
  }

  /// Bridge status is retained so a reconnecting subscriber immediately
  /// learns whether the bridge is up (source's `mqtt_publish_status`).
  pub fn publish_status(&self, online: bool) -> Result<()> {
    let payload = json!({ "v": if online { "online" } else { "offline" } });
    self.transport.borrow_mut().publish("bridge/status", payload.to_string().as_bytes(), true)?;
    self.stats.borrow_mut().messages_published += 1;
    Ok(())
  }

  /// Subscribed by the composition root to `CAP_STATE_CHANGED`.
  pub fn on_cap_state_changed(&self, eui64: Eui64, cap: Capability, value: &CapValue) {
    if let Err(e) = self.publish_state(eui64, cap, value) {
      warn!(target: "zb2mqtt::mqtt", "dropped state publish for {eui64:016x}/{}: {e}", cap.name());
    }
  }

  /// Decodes an inbound `bridge/<hex>/<cap>/set` message and forwards it as
  /// a `CAP_COMMAND` for the capability mapper to execute. Unlike
  /// `CAP_STATE_CHANGED`'s fan-out, commands always target endpoint `0`
  /// since the wire protocol carries no endpoint id (the topic scheme is
  /// `<hex-eui64>/<cap.name>/set` only).
  pub fn handle_incoming(&self, topic: &str, payload: &[u8]) -> Result<()> {
    self.stats.borrow_mut().messages_received += 1;
    let mut parts = topic.split('/');
    let (Some("bridge"), Some(hex), Some(cap_name), Some("set")) = (parts.next(), parts.next(), parts.next(), parts.next()) else {
      return Err(BridgeError::InvalidArg(format!("unrecognized topic: {topic}")));
    };
    let eui64 = Eui64::from_str_radix(hex, 16).map_err(|e| BridgeError::InvalidArg(e.to_string()))?;
    let cap = Capability::from_name(cap_name).ok_or_else(|| BridgeError::InvalidArg(format!("unknown capability: {cap_name}")))?;
    let json: serde_json::Value = serde_json::from_slice(payload)?;
    let v = json.get("v").ok_or_else(|| BridgeError::InvalidArg("missing 'v' field".to_string()))?;
    let value = match cap.value_kind() {
      crate::model::ValueKind::Bool => CapValue::Bool(v.as_bool().ok_or_else(|| BridgeError::InvalidArg("expected bool".to_string()))?),
      crate::model::ValueKind::Int => CapValue::Int(v.as_i64().ok_or_else(|| BridgeError::InvalidArg("expected int".to_string()))? as i32),
      crate::model::ValueKind::Float => CapValue::Float(v.as_f64().ok_or_else(|| BridgeError::InvalidArg("expected float".to_string()))? as f32),
      crate::model::ValueKind::String => CapValue::Str(v.as_str().ok_or_else(|| BridgeError::InvalidArg("expected string".to_string()))?.to_string()),
    };

    let corr_id = self.corr_seq.get().wrapping_add(1).max(1);
    self.corr_seq.set(corr_id);
    self.bus.publish(crate::eventbus::Event::new(
      event_type::CAP_COMMAND,
      self.clock.now_ticks(),
      corr_id,
      component_id::MQTT,
      Payload::CapCommand { eui64, endpoint: 0, cap, cmd: CapCmdType::Set, value: Some(value), corr_id },
    ))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::eventbus::EventBus;

  fn harness() -> (Clock, EventBus) {
    let clock = Clock::new();
    let bus = EventBus::new(clock.clone());
    (clock, bus)
  }

  #[test]
  fn connect_publishes_retained_online_status() {
    let (clock, bus) = harness();
    let adapter = MqttAdapter::new(clock, &bus, MqttConfig::default(), Box::new(LoopbackTransport::new()));
    adapter.connect().unwrap();
    assert_eq!(adapter.state(), MqttState::Connected);
  }

  #[test]
  fn publish_state_before_connect_is_busy() {
    let (clock, bus) = harness();
    let adapter = MqttAdapter::new(clock, &bus, MqttConfig::default(), Box::new(LoopbackTransport::new()));
    let err = adapter.publish_state(0xAA, Capability::LightOn, &CapValue::Bool(true)).unwrap_err();
    assert_eq!(err, BridgeError::Busy);
  }

  #[test]
  fn tick_reconnects_after_t_reconnect_elapses() {
    let (clock, bus) = harness();
    let adapter = MqttAdapter::new(clock.clone(), &bus, MqttConfig::default(), Box::new(LoopbackTransport::new()));
    adapter.connect().unwrap();
    adapter.disconnect().unwrap();
    adapter.tick();
    assert_eq!(adapter.state(), MqttState::Disconnected); // too soon
    clock.tick_advance(T_RECONNECT_MS + 1);
    adapter.tick();
    assert_eq!(adapter.state(), MqttState::Connected);
    assert_eq!(adapter.stats().reconnects, 1);
  }

  #[test]
  fn handle_incoming_decodes_bool_set_and_emits_cap_command() {
    let (clock, bus) = harness();
    let adapter = MqttAdapter::new(clock, &bus, MqttConfig::default(), Box::new(LoopbackTransport::new()));
    adapter.handle_incoming("bridge/00000000000000aa/light.on/set", br#"{"v":true}"#).unwrap();
    let n = bus.dispatch(0);
    assert_eq!(n, 1);
  }

  #[test]
  fn handle_incoming_rejects_malformed_topic() {
    let (clock, bus) = harness();
    let adapter = MqttAdapter::new(clock, &bus, MqttConfig::default(), Box::new(LoopbackTransport::new()));
    let err = adapter.handle_incoming("garbage", br#"{"v":true}"#).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArg(_)));
  }

  #[test]
  fn handle_incoming_rejects_unknown_capability() {
    let (clock, bus) = harness();
    let adapter = MqttAdapter::new(clock, &bus, MqttConfig::default(), Box::new(LoopbackTransport::new()));
    let err = adapter.handle_incoming("bridge/00000000000000aa/not.a.cap/set", br#"{"v":true}"#).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArg(_)));
  }
}
