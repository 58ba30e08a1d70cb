//! Configuration loading and CLI bootstrap.
//!
//! Layering mirrors the source's `os_config` precedence (compiled-in
//! defaults, overridden by a TOML file, overridden by environment
//! variables, overridden by explicit CLI flags) rather than any one of
//! those sources being authoritative on its own.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use log::warn;
use serde::Deserialize;

use crate::error::{BridgeError, Result};
use crate::mqtt::MqttConfig;

pub const DEFAULT_CONFIG_PATH: &str = "./bridge.toml";
/// `PERSIST_DIR` in the source's host `os_persist.c`.
pub const DEFAULT_PERSIST_DIR: &str = "/tmp/bridge_persist";
/// `zba_set_permit_join(180)` in the source's `zb_shell.c` startup path.
pub const DEFAULT_PERMIT_JOIN_SECS: u8 = 180;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// The compile-time capacities this build was sized for.
///
/// The registry, interview table, capability cache, radio caches and event
/// bus all size fixed-capacity collections off the `N_MAX`/`I_MAX`/...
/// constants at compile time — none of that can
/// actually change without a rebuild. This struct exists so a config file
/// or CLI flag that disagrees with the compiled-in capacity produces a
/// loud startup warning instead of silently doing nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
  pub max_nodes: usize,
  pub max_interviews: usize,
  pub max_capability_cache: usize,
  pub max_pending_radio_cmds: usize,
  pub max_addr_cache: usize,
  pub event_queue_size: usize,
  pub max_subscribers: usize,
}

impl Default for SizingConfig {
  fn default() -> Self {
    SizingConfig {
      max_nodes: crate::registry::N_MAX,
      max_interviews: crate::interview::I_MAX,
      max_capability_cache: crate::capability::M_CACHE,
      max_pending_radio_cmds: crate::radio::M_PEND,
      max_addr_cache: crate::radio::M_DEV,
      event_queue_size: crate::eventbus::Q_SIZE,
      max_subscribers: crate::eventbus::M_SUB,
    }
  }
}

impl SizingConfig {
  /// Warn about any field that disagrees with the compiled-in capacity.
  pub fn warn_on_mismatch(&self) {
    let checks: [(&str, usize, usize); 7] = [
      ("max_nodes", self.max_nodes, crate::registry::N_MAX),
      ("max_interviews", self.max_interviews, crate::interview::I_MAX),
      ("max_capability_cache", self.max_capability_cache, crate::capability::M_CACHE),
      ("max_pending_radio_cmds", self.max_pending_radio_cmds, crate::radio::M_PEND),
      ("max_addr_cache", self.max_addr_cache, crate::radio::M_DEV),
      ("event_queue_size", self.event_queue_size, crate::eventbus::Q_SIZE),
      ("max_subscribers", self.max_subscribers, crate::eventbus::M_SUB),
    ];
    for (name, configured, compiled) in checks {
      if configured != compiled {
        warn!(
          target: "zb2mqtt::config",
          "{name} = {configured} in config disagrees with this build's compiled-in capacity ({compiled}); rebuild to change it, ignoring override"
        );
      }
    }
  }
}

/// Deserializable configuration, as loaded from `bridge.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
  pub mqtt: MqttConfig,
  pub persist_dir: PathBuf,
  pub permit_join_secs: u8,
  pub log_level: String,
  pub sizing: SizingConfig,
}

impl Default for BridgeConfig {
  fn default() -> Self {
    BridgeConfig {
      mqtt: MqttConfig::default(),
      persist_dir: PathBuf::from(DEFAULT_PERSIST_DIR),
      permit_join_secs: DEFAULT_PERMIT_JOIN_SECS,
      log_level: DEFAULT_LOG_LEVEL.to_string(),
      sizing: SizingConfig::default(),
    }
  }
}

impl BridgeConfig {
  /// Load the TOML file at `path`, falling back to defaults if it does not
  /// exist. A present-but-malformed file is a hard `InvalidArg` error.
  pub fn load_file(path: &Path) -> Result<Self> {
    if !path.exists() {
      return Ok(BridgeConfig::default());
    }
    let text = fs::read_to_string(path)
      .map_err(|e| BridgeError::InvalidArg(format!("reading {}: {e}", path.display())))?;
    toml::from_str(&text).map_err(|e| BridgeError::InvalidArg(format!("{}: {e}", path.display())))
  }

  /// Apply CLI overrides (which themselves may carry environment-variable
  /// defaults via `clap`'s `env` feature) on top of a file/default base.
  fn apply_cli(mut self, cli: &Cli) -> Self {
    if let Some(uri) = &cli.mqtt_uri {
      self.mqtt.broker_uri = uri.clone();
    }
    if let Some(client_id) = &cli.mqtt_client_id {
      self.mqtt.client_id = client_id.clone();
    }
    if let Some(user) = &cli.mqtt_username {
      self.mqtt.username = Some(user.clone());
    }
    if let Some(pass) = &cli.mqtt_password {
      self.mqtt.password = Some(pass.clone());
    }
    if let Some(dir) = &cli.persist_dir {
      self.persist_dir = dir.clone();
    }
    if let Some(secs) = cli.permit_join {
      self.permit_join_secs = secs;
    }
    if let Some(level) = &cli.log_level {
      self.log_level = level.clone();
    }
    self
  }

  /// Reject combinations no component downstream can act on. Never panics;
  /// always returns `InvalidArg` for the caller to report and exit.
  pub fn validate(&self) -> Result<()> {
    if self.mqtt.broker_uri.trim().is_empty() {
      return Err(BridgeError::InvalidArg("mqtt.broker_uri must not be empty".into()));
    }
    if self.mqtt.client_id.trim().is_empty() {
      return Err(BridgeError::InvalidArg("mqtt.client_id must not be empty".into()));
    }
    if self.permit_join_secs > 254 {
      return Err(BridgeError::InvalidArg("permit_join_secs must be <= 254".into()));
    }
    self.sizing.warn_on_mismatch();
    Ok(())
  }

  /// Full precedence chain: defaults < file < env < CLI flags. `clap`'s
  /// `env` attribute folds the env layer into `cli` itself, so by the time
  /// we get here only the file-vs-CLI merge is left to do.
  pub fn resolve(cli: Cli) -> Result<Self> {
    let config_path = cli.config.clone().unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let base = BridgeConfig::load_file(&config_path)?;
    let merged = base.apply_cli(&cli);
    merged.validate()?;
    Ok(merged)
  }
}

/// Command-line flags for the bridge daemon.
#[derive(Debug, Parser)]
#[command(name = "zb2mqtt-bridged", about = "Zigbee 3.0 coordinator to MQTT bridge")]
pub struct Cli {
  /// Path to a TOML config file (defaults to `./bridge.toml`, silently
  /// skipped if absent).
  #[arg(long, env = "ZB2MQTT_CONFIG")]
  pub config: Option<PathBuf>,

  /// Overrides `mqtt.broker_uri`.
  #[arg(long = "mqtt-uri", env = "ZB2MQTT_MQTT_URI")]
  pub mqtt_uri: Option<String>,

  /// Overrides `mqtt.client_id`.
  #[arg(long = "mqtt-client-id", env = "ZB2MQTT_MQTT_CLIENT_ID")]
  pub mqtt_client_id: Option<String>,

  #[arg(long = "mqtt-username", env = "ZB2MQTT_MQTT_USERNAME")]
  pub mqtt_username: Option<String>,

  #[arg(long = "mqtt-password", env = "ZB2MQTT_MQTT_PASSWORD")]
  pub mqtt_password: Option<String>,

  /// Overrides `persist_dir`.
  #[arg(long = "persist-dir", env = "ZB2MQTT_PERSIST_DIR")]
  pub persist_dir: Option<PathBuf>,

  /// Overrides `permit_join_secs`.
  #[arg(long = "permit-join", env = "ZB2MQTT_PERMIT_JOIN")]
  pub permit_join: Option<u8>,

  /// Overrides `log_level` (passed through to `env_logger`).
  #[arg(long = "log-level", env = "ZB2MQTT_LOG_LEVEL")]
  pub log_level: Option<String>,

  /// Print registry node summaries then exit.
  #[arg(long)]
  pub devices: bool,

  /// Print event bus / persistence / MQTT stats then exit.
  #[arg(long = "dump-stats")]
  pub dump_stats: bool,
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cli_defaults() -> Cli {
    Cli {
      config: None,
      mqtt_uri: None,
      mqtt_client_id: None,
      mqtt_username: None,
      mqtt_password: None,
      persist_dir: None,
      permit_join: None,
      log_level: None,
      devices: false,
      dump_stats: false,
    }
  }

  #[test]
  fn default_config_is_valid() {
    let cfg = BridgeConfig::default();
    assert!(cfg.validate().is_ok());
    assert_eq!(cfg.permit_join_secs, DEFAULT_PERMIT_JOIN_SECS);
    assert_eq!(cfg.persist_dir, PathBuf::from(DEFAULT_PERSIST_DIR));
  }

  #[test]
  fn missing_file_falls_back_to_defaults() {
    let cfg = BridgeConfig::load_file(Path::new("/nonexistent/path/bridge.toml")).unwrap();
    assert_eq!(cfg.mqtt.broker_uri, MqttConfig::default().broker_uri);
  }

  #[test]
  fn malformed_file_is_invalid_arg_not_panic() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.toml");
    fs::write(&path, "this is not valid toml {{{").unwrap();
    let err = BridgeConfig::load_file(&path).unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArg(_)));
  }

  #[test]
  fn file_values_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.toml");
    fs::write(
      &path,
      r#"
      persist_dir = "/var/lib/zb2mqtt"
      permit_join_secs = 60

      [mqtt]
      broker_uri = "mqtt://broker.local:1883"
      client_id = "test-bridge"
      "#,
    )
    .unwrap();
    let cfg = BridgeConfig::load_file(&path).unwrap();
    assert_eq!(cfg.persist_dir, PathBuf::from("/var/lib/zb2mqtt"));
    assert_eq!(cfg.permit_join_secs, 60);
    assert_eq!(cfg.mqtt.broker_uri, "mqtt://broker.local:1883");
    assert_eq!(cfg.mqtt.client_id, "test-bridge");
    // Fields absent from the file still take their defaults.
    assert_eq!(cfg.mqtt.keepalive_sec, MqttConfig::default().keepalive_sec);
  }

  #[test]
  fn cli_overrides_take_precedence_over_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bridge.toml");
    fs::write(&path, "permit_join_secs = 60\n").unwrap();

    let mut cli = cli_defaults();
    cli.config = Some(path);
    cli.permit_join = Some(120);
    cli.mqtt_uri = Some("mqtt://override:1883".to_string());

    let cfg = BridgeConfig::resolve(cli).unwrap();
    assert_eq!(cfg.permit_join_secs, 120);
    assert_eq!(cfg.mqtt.broker_uri, "mqtt://override:1883");
  }

  #[test]
  fn empty_broker_uri_is_rejected() {
    let mut cfg = BridgeConfig::default();
    cfg.mqtt.broker_uri = "   ".to_string();
    let err = cfg.validate().unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArg(_)));
  }

  #[test]
  fn permit_join_above_254_is_rejected() {
    let mut cfg = BridgeConfig::default();
    cfg.permit_join_secs = 255;
    let err = cfg.validate().unwrap_err();
    assert!(matches!(err, BridgeError::InvalidArg(_)));
  }

  #[test]
  fn sizing_defaults_match_compiled_in_capacities() {
    let sizing = SizingConfig::default();
    assert_eq!(sizing.max_nodes, crate::registry::N_MAX);
    assert_eq!(sizing.max_interviews, crate::interview::I_MAX);
    // Mismatched sizing only warns, it never fails validation.
    let mut cfg = BridgeConfig::default();
    cfg.sizing.max_nodes = 9999;
    assert!(cfg.validate().is_ok());
  }
}
