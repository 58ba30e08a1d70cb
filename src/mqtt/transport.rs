//! The `MqttTransport` collaborator boundary.
//!
//! The wire protocol itself is out of scope; a real client (e.g. `rumqttc`)
//! would implement this trait. Only `LoopbackTransport`, the host-simulation
//! variant mirroring `mqtt_adapter.c`'s `OS_PLATFORM_HOST` branch (log
//! instead of publish), ships by default.

use std::cell::RefCell;

use log::info;

use crate::error::Result;

pub trait MqttTransport {
  fn connect(&mut self, uri: &str, client_id: &str, keepalive_sec: u16) -> Result<()>;
  fn disconnect(&mut self) -> Result<()>;
  fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<()>;
  fn subscribe(&mut self, topic_filter: &str) -> Result<()>;
}

/// Host-simulation transport: every call succeeds and is logged, matching
/// `mqtt_adapter.c`'s host build (`LOG_I(MQTT_MODULE, "PUB %s: %.*s", ...)`).
#[derive(Default)]
pub struct LoopbackTransport {
  published: RefCell<Vec<(String, Vec<u8>, bool)>>,
}

impl LoopbackTransport {
  pub fn new() -> Self {
    Self::default()
  }

  /// Test/introspection hook: every `(topic, payload, retain)` published so far.
  pub fn published(&self) -> Vec<(String, Vec<u8>, bool)> {
    self.published.borrow().clone()
  }
}

impl MqttTransport for LoopbackTransport {
  fn connect(&mut self, uri: &str, client_id: &str, _keepalive_sec: u16) -> Result<()> {
    info!(target: "zb2mqtt::mqtt", "connected (simulated) to {uri} as {client_id}");
    Ok(())
  }

  fn disconnect(&mut self) -> Result<()> {
    info!(target: "zb2mqtt::mqtt", "disconnected (simulated)");
    Ok(())
  }

  fn publish(&mut self, topic: &str, payload: &[u8], retain: bool) -> Result<()> {
    info!(target: "zb2mqtt::mqtt", "PUB {topic}{}: {}", if retain { " (retained)" } else { "" }, String::from_utf8_lossy(payload));
    self.published.borrow_mut().push((topic.to_string(), payload.to_vec(), retain));
    Ok(())
  }

  fn subscribe(&mut self, topic_filter: &str) -> Result<()> {
    info!(target: "zb2mqtt::mqtt", "subscribed (simulated) to {topic_filter}");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn publish_records_for_introspection() {
    let mut t = LoopbackTransport::new();
    t.connect("mqtt://localhost:1883", "zigbee-bridge", 30).unwrap();
    t.publish("bridge/status", br#"{"v":"online"}"#, true).unwrap();
    assert_eq!(t.published().len(), 1);
    assert!(t.published()[0].2);
  }
}
