//! Composition root.
//!
//! Every other module exposes borrowed collaborators (`&'a EventBus`,
//! `&'a Registry<'a>`, ...) and is driven either by a direct call or by a
//! bus subscription; nothing subscribes to its own events internally. This
//! module is where those wires get connected, and the one place in the
//! crate that needs every component to outlive the subscriptions and
//! scheduler tasks it hands out — i.e. to be `'static`. Since `EventBus`
//! itself is `!Clone` (it owns the non-`Clone` receiving half of the
//! channel) and every component here is built directly against it, the
//! bridge can't keep its components behind a `Clone`-able handle the way
//! `Scheduler`/`Registry` do internally with `Rc`; the only precedent-free
//! option is to promote each composition-root-owned component to `&'static`
//! with `Box::leak` once, at startup. For a daemon that runs until the
//! process exits this is a deliberate, bounded leak rather than a gradual
//! one — see `DESIGN.md` for the fuller rationale.

use log::info;

use crate::capability::CapabilityMapper;
use crate::clock::Clock;
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::eventbus::{event_type, EventBus, EventFilter, Payload};
use crate::ha_discovery::HaDiscovery;
use crate::interview::InterviewEngine;
use crate::model::{component_id, CapValue, Capability};
use crate::mqtt::{LoopbackTransport, MqttAdapter};
use crate::persistence::{FileBackend, Store};
use crate::radio::{RadioAdapter, SimRadioStack};
use crate::registry::Registry;
use crate::scheduler::Scheduler;

/// `OS_MAX_FIBRES` in the source's `os_config.h`; a handful of long-lived
/// scheduler tasks run this daemon (interview poll, radio timeout sweep,
/// MQTT tick, persistence flush), so a small fixed pool is plenty.
const TASK_POOL: usize = 16;

/// Cadence of the periodic housekeeping tasks, in milliseconds. Matches the
/// source's `main_task` poll loop (`os_sleep(100)` between state-machine
/// passes).
const T_POLL_MS: u32 = 100;
/// `os_sleep(1000)` in the source's `mqtt_task` tick loop.
const T_MQTT_TICK_MS: u32 = 1000;
/// `os_sleep(30000)` in the source's `persist_task` flush loop.
const T_FLUSH_MS: u32 = 30_000;

/// The fully-wired daemon: an owned [`Scheduler`] plus the leaked component
/// set it drives. Dropping a `Bridge` stops nothing on its own (every task
/// and subscription lives for the process's remaining lifetime); the
/// intended use is to build one and call [`Bridge::run`].
pub struct Bridge {
  scheduler: Scheduler,
  bus: &'static EventBus,
  registry: &'static Registry<'static>,
  radio: &'static RadioAdapter<'static>,
  mqtt: &'static MqttAdapter<'static>,
  ha_discovery: &'static HaDiscovery<'static>,
  store: &'static Store,
  config: BridgeConfig,
}

impl Bridge {
  /// Builds the full component graph from a resolved [`BridgeConfig`] and
  /// wires every cross-component subscription. Does not start the scheduler
  /// loop — call [`Bridge::run`] for that.
  pub fn build(config: BridgeConfig) -> Result<Bridge> {
    let clock = Clock::new();
    let scheduler = Scheduler::new(clock.clone(), TASK_POOL);

    // `EventBus` is not `Clone` (it owns the channel's receiving half), so
    // every component below that needs it is built against a leaked,
    // `'static` reference rather than an owned value or an `Rc`.
    let bus: &'static EventBus = Box::leak(Box::new(EventBus::new(clock.clone())));

    let backend = Box::new(FileBackend::new(&config.persist_dir)?);
    let store: &'static Store = Box::leak(Box::new(Store::new(backend, Some(bus.sender()))));

    let registry: &'static Registry<'static> = Box::leak(Box::new(Registry::new(clock.clone(), bus)));
    let restored = registry.restore(store)?;
    info!(target: "zb2mqtt::bridge", "restored {restored} node(s) from persistence");

    let radio: &'static RadioAdapter<'static> =
      Box::leak(Box::new(RadioAdapter::new(clock.clone(), bus, Box::new(SimRadioStack::new()))));
    radio.init()?;

    let interview: &'static InterviewEngine<'static> =
      Box::leak(Box::new(InterviewEngine::new(clock.clone(), bus, registry)));

    let capability: &'static CapabilityMapper<'static> =
      Box::leak(Box::new(CapabilityMapper::new(clock.clone(), bus, registry)));

    let mqtt: &'static MqttAdapter<'static> =
      Box::leak(Box::new(MqttAdapter::new(clock.clone(), bus, config.mqtt.clone(), Box::new(LoopbackTransport::new()))));

    let ha_discovery: &'static HaDiscovery<'static> = Box::leak(Box::new(HaDiscovery::new(registry, capability, mqtt)));

    Self::wire_events(bus, registry, radio, interview, capability, mqtt, ha_discovery);
    Self::spawn_tasks(&scheduler, registry, radio, interview, mqtt, ha_discovery, store, bus, &config)?;

    Ok(Bridge {
      scheduler,
      bus,
      registry,
      radio,
      mqtt,
      ha_discovery,
      store,
      config,
    })
  }

  /// Cross-component bus subscriptions (nothing talks to anything else
  /// directly except through published events). Each
  /// `subscribe` call leaks its own closure capture list by virtue of
  /// capturing only `'static` references, so no separate promotion is
  /// needed beyond the one done in [`Bridge::build`].
  fn wire_events(
    bus: &'static EventBus,
    registry: &'static Registry<'static>,
    radio: &'static RadioAdapter<'static>,
    interview: &'static InterviewEngine<'static>,
    capability: &'static CapabilityMapper<'static>,
    mqtt: &'static MqttAdapter<'static>,
    ha_discovery: &'static HaDiscovery<'static>,
  ) {
    // A newly announced node enters the registry and starts its interview.
    bus
      .subscribe(EventFilter::one(event_type::ZB_ANNOUNCE), move |e| {
        if let Payload::ZbAnnounce { eui64, nwk } = &e.payload {
          if registry.add_node(*eui64, *nwk).is_ok() {
            let _ = interview.start(*eui64);
          }
        }
      })
      .expect("subscriber table has room at startup");

    // A node leaving drops it from the registry and un-publishes its HA
    // discovery config.
    bus
      .subscribe(EventFilter::one(event_type::ZB_DEVICE_LEFT), move |e| {
        if let Payload::ZbDeviceLeft { eui64 } = &e.payload {
          let _ = registry.remove_node(*eui64);
          ha_discovery.on_node_removed(*eui64);
        }
      })
      .expect("subscriber table has room at startup");

    // Attribute reports feed the capability cache, which republishes
    // `CAP_STATE_CHANGED` for anything that actually changed.
    bus
      .subscribe(EventFilter::one(event_type::ZB_ATTR_REPORT), move |e| {
        if let Payload::ZbAttrReport { eui64, endpoint, cluster, attr, value } = &e.payload {
          let _ = capability.handle_report(*eui64, *endpoint, *cluster, *attr, *value);
        }
      })
      .expect("subscriber table has room at startup");

    // A changed capability value is republished to MQTT. `publish_node` is
    // cheap and idempotent (it (re)sends the same retained discovery
    // documents and queues itself if MQTT isn't connected yet), so calling
    // it on every state change is how this bridge learns "a node is ready
    // to show up in Home Assistant" — there is no dedicated
    // interview-complete event on the bus, and the first capability value
    // a `Ready` node produces is the earliest reliable signal of that.
    //
    // That first event is always the one `InterviewEngine::finish` emits
    // directly (`src_id == component_id::INTERVIEW`), ahead of any report
    // the radio has actually seen, so it is also the right moment to
    // (re)run `compute_for_node`: the registry's endpoint/cluster set is
    // only fully populated once the interview reaches `Bindings`, and
    // nothing else on the bus signals that it's worth recomputing from.
    // That same marker carries a fixed `SwitchOn`/`true` payload regardless
    // of what the node actually supports, so it drives discovery but must
    // not be forwarded to MQTT as a real state publish — only reports
    // the capability mapper itself produces are.
    bus
      .subscribe(EventFilter::one(event_type::CAP_STATE_CHANGED), move |e| {
        if let Payload::CapStateChanged { eui64, cap, value } = &e.payload {
          if e.src_id == component_id::INTERVIEW {
            let _ = capability.compute_for_node(*eui64);
          } else {
            mqtt.on_cap_state_changed(*eui64, *cap, value);
          }
          let _ = ha_discovery.publish_node(*eui64);
        }
      })
      .expect("subscriber table has room at startup");

    // An outbound command from the capability layer is submitted to the
    // radio. Only on/off and level commands have a cluster-level radio
    // counterpart in this bridge; everything else is read-only telemetry.
    bus
      .subscribe(EventFilter::one(event_type::CAP_COMMAND), move |e| {
        if let Payload::CapCommand { eui64, endpoint, cap, value, corr_id, .. } = &e.payload {
          let result = match cap {
            Capability::SwitchOn | Capability::LightOn => value
              .as_ref()
              .and_then(CapValue::as_bool)
              .map(|on| radio.send_onoff(*eui64, *endpoint, on, *corr_id)),
            Capability::LightLevel => value
              .as_ref()
              .and_then(CapValue::as_int)
              .map(|pct| radio.send_level(*eui64, *endpoint, pct.clamp(0, 100) as u8, 0, *corr_id)),
            _ => None,
          };
          if let Some(Err(err)) = result {
            log::warn!(target: "zb2mqtt::bridge", "dispatching {:?} for {eui64:016x} failed: {err}", cap);
          }
        }
      })
      .expect("subscriber table has room at startup");

    // Inbound radio confirmations/errors (`ZB_CMD_CONFIRM`/`ZB_CMD_ERROR`)
    // are already logged by the radio adapter itself; nothing downstream
    // currently needs a subscription of its own.
  }

  /// Periodic housekeeping scheduler tasks: the main loop as cooperative
  /// tasks. Each loops forever at a fixed cadence; there
  /// is no supervisor restart because none of these bodies can return
  /// `Err` without already having logged it.
  #[allow(clippy::too_many_arguments)]
  fn spawn_tasks(
    scheduler: &Scheduler,
    registry: &'static Registry<'static>,
    radio: &'static RadioAdapter<'static>,
    interview: &'static InterviewEngine<'static>,
    mqtt: &'static MqttAdapter<'static>,
    ha_discovery: &'static HaDiscovery<'static>,
    store: &'static Store,
    bus: &'static EventBus,
    config: &BridgeConfig,
  ) -> Result<()> {
    let permit_join_secs = config.permit_join_secs;

    // Drains the bus and runs every matching subscriber. Nothing else calls
    // `dispatch`, so this cadence is the bridge's effective event latency.
    scheduler.create("event-pump", 0, move |handle| async move {
      loop {
        bus.dispatch(0);
        handle.sleep(T_POLL_MS).await;
      }
    })?;

    scheduler.create("interview-poll", 0, move |handle| async move {
      loop {
        interview.process();
        radio.sweep_timeouts();
        handle.sleep(T_POLL_MS).await;
      }
    })?;

    scheduler.create("mqtt-tick", 0, move |handle| async move {
      let mut was_connected = false;
      loop {
        if mqtt.connect().is_ok() && !was_connected {
          was_connected = true;
          ha_discovery.on_mqtt_connected();
          ha_discovery.publish_all();
        }
        mqtt.tick();
        handle.sleep(T_MQTT_TICK_MS).await;
      }
    })?;

    scheduler.create("persist-flush", 0, move |handle| async move {
      loop {
        if let Err(err) = registry.persist(store) {
          log::warn!(target: "zb2mqtt::bridge", "periodic registry persist failed: {err}");
        }
        if let Err(err) = store.flush() {
          log::warn!(target: "zb2mqtt::bridge", "periodic flush failed: {err}");
        }
        handle.sleep(T_FLUSH_MS).await;
      }
    })?;

    scheduler.create("coordinator-start", 0, move |handle| async move {
      handle.sleep(0).await;
      if let Err(err) = radio.start_coordinator() {
        log::warn!(target: "zb2mqtt::bridge", "coordinator start failed: {err}");
        return;
      }
      if let Err(err) = radio.set_permit_join(permit_join_secs) {
        log::warn!(target: "zb2mqtt::bridge", "set_permit_join failed: {err}");
      }
    })?;

    Ok(())
  }

  pub fn registry(&self) -> &'static Registry<'static> {
    self.registry
  }

  pub fn mqtt(&self) -> &'static MqttAdapter<'static> {
    self.mqtt
  }

  pub fn config(&self) -> &BridgeConfig {
    &self.config
  }

  /// Enters the scheduler's run loop. Never returns under normal operation.
  pub fn run(&self) -> ! {
    self.scheduler.start();
    unreachable!("Scheduler::start loops forever")
  }

  /// Same loop as [`Scheduler::start`], but checked against `shutdown`
  /// every tick so a signal handler can request a clean exit without
  /// reaching into the (`Rc`-based, `!Send`) scheduler internals itself.
  pub fn run_until(&self, shutdown: &std::sync::atomic::AtomicBool) {
    use std::sync::atomic::Ordering;
    while !shutdown.load(Ordering::Relaxed) {
      self.scheduler.tick_advance(1);
      self.scheduler.run_once();
      std::thread::sleep(std::time::Duration::from_millis(1));
    }
  }

  /// `--dump-stats`: a one-shot, `log`-facade render of
  /// every component's `stats()`-equivalent, in place of the original
  /// firmware's interactive `ps`/`stats` shell commands.
  pub fn dump_stats(&self) {
    let sched_tasks = self.scheduler.count();
    let bus_stats = self.bus.stats();
    let reg_stats = self.registry.stats();
    let persist_stats = self.store.stats();
    let mqtt_stats = self.mqtt.stats();
    info!(target: "zb2mqtt::bridge", "scheduler: {sched_tasks} active task(s)");
    info!(
      target: "zb2mqtt::bridge",
      "event bus: {} published, {} dispatched, {} dropped, {} queued (high water {})",
      bus_stats.published, bus_stats.dispatched, bus_stats.dropped, bus_stats.current_size, bus_stats.high_water
    );
    info!(target: "zb2mqtt::bridge", "registry: {} node(s)", reg_stats.node_count);
    info!(
      target: "zb2mqtt::bridge",
      "persistence: {} write(s) ({} buffered), {} read(s)",
      persist_stats.total_writes, persist_stats.writes_buffered, persist_stats.total_reads
    );
    info!(
      target: "zb2mqtt::bridge",
      "mqtt: {:?}, {} published, {} received, {} reconnect(s)",
      self.mqtt.state(), mqtt_stats.messages_published, mqtt_stats.messages_received, mqtt_stats.reconnects
    );
  }

  /// `--devices` (the original's `devices` shell command, as a library
  /// method): the registry's node table rendered one line per
  /// node.
  pub fn devices(&self) -> Vec<crate::registry::NodeInfo> {
    let mut out = Vec::new();
    for i in 0..self.registry.node_count() {
      if let Ok(info) = self.registry.get_node_info(i as usize) {
        out.push(info);
      }
    }
    out
  }
}
