//! Daemon entry point.
//!
//! Resolves configuration, builds the bridge, and enters the scheduler's
//! run loop until `SIGINT`/`SIGTERM`. Mirrors the original firmware's
//! `main()` (init everything, start the coordinator, hand control to the
//! fibre scheduler) with no interactive shell attached (§1 excludes it).

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use log::{error, info};

use zb2mqtt_bridge::bridge::Bridge;
use zb2mqtt_bridge::config::{BridgeConfig, Cli};

fn main() -> ExitCode {
  let cli = Cli::parse();
  let dump_stats = cli.dump_stats;
  let show_devices = cli.devices;

  let config = match BridgeConfig::resolve(cli) {
    Ok(config) => config,
    Err(err) => {
      // Too early for the resolved log level; fall back to env_logger's own
      // default so this failure is still visible.
      env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
      error!(target: "zb2mqtt::bridge", "configuration error: {err}");
      return ExitCode::FAILURE;
    }
  };

  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.log_level.clone())).init();

  let bridge = match Bridge::build(config) {
    Ok(bridge) => bridge,
    Err(err) => {
      error!(target: "zb2mqtt::bridge", "failed to start bridge: {err}");
      return ExitCode::FAILURE;
    }
  };

  if show_devices {
    for node in bridge.devices() {
      println!(
        "{:016x}  {:<12} {:<16} {:<20} lqi={}",
        node.ieee_addr,
        node.state.name(),
        node.manufacturer,
        node.friendly_name,
        node.lqi
      );
    }
  }

  let shutdown = Arc::new(AtomicBool::new(false));
  let handler_flag = shutdown.clone();
  if let Err(err) = ctrlc::set_handler(move || {
    handler_flag.store(true, Ordering::Relaxed);
  }) {
    error!(target: "zb2mqtt::bridge", "failed to install signal handler: {err}");
  }

  info!(target: "zb2mqtt::bridge", "bridge running, permit-join window active");
  bridge.run_until(&shutdown);

  info!(target: "zb2mqtt::bridge", "shutdown signal received");
  if dump_stats {
    bridge.dump_stats();
  }
  ExitCode::SUCCESS
}
