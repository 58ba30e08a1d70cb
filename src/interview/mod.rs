//! Interview engine.
//!
//! The per-stage actions are carried over directly from `interview.c`'s
//! `simulate_*` helpers: this repository ships the host-simulation variant
//! (§4.4's note that, absent real hardware, stage actions populate the
//! registry synchronously rather than emitting a radio query and waiting
//! for the response).

use std::cell::RefCell;

use log::{debug, info, warn};

use crate::clock::{wrapping_diff, Clock, Tick};
use crate::error::{BridgeError, Result};
use crate::eventbus::{event_type, EventBus, Payload};
use crate::model::{component_id, CapValue, Capability, Eui64};
use crate::registry::{ClusterDir, Endpoint, NodeState, Registry};

/// `MAX_INTERVIEWS` in the source's `interview.c`.
pub const I_MAX: usize = 4;
/// `INTERVIEW_TIMEOUT_MS`.
pub const T_TOTAL_MS: u32 = 30_000;
/// `STEP_TIMEOUT_MS`.
pub const T_STEP_MS: u32 = 5_000;
/// The driver loop's poll cadence (`os_sleep(100)` in `interview_task`).
pub const T_POLL_MS: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Stage {
  Init,
  ActiveEp,
  SimpleDesc,
  BasicAttr,
  Bindings,
  Complete,
  Failed,
}

impl Stage {
  pub fn name(&self) -> &'static str {
    match self {
      Stage::Init => "INIT",
      Stage::ActiveEp => "ACTIVE_EP",
      Stage::SimpleDesc => "SIMPLE_DESC",
      Stage::BasicAttr => "BASIC_ATTR",
      Stage::Bindings => "BINDINGS",
      Stage::Complete => "COMPLETE",
      Stage::Failed => "FAILED",
    }
  }

  fn next(&self) -> Stage {
    match self {
      Stage::Init => Stage::ActiveEp,
      Stage::ActiveEp => Stage::SimpleDesc,
      Stage::SimpleDesc => Stage::BasicAttr,
      Stage::BasicAttr => Stage::Bindings,
      Stage::Bindings => Stage::Complete,
      Stage::Complete => Stage::Complete,
      Stage::Failed => Stage::Failed,
    }
  }
}

struct Context {
  eui64: Eui64,
  stage: Stage,
  retry: u8,
  start_tick: Tick,
  step_tick: Tick,
}

pub struct InterviewEngine<'a> {
  clock: Clock,
  bus: &'a EventBus,
  registry: &'a Registry<'a>,
  interviews: RefCell<Vec<Context>>,
}

impl<'a> InterviewEngine<'a> {
  pub fn new(clock: Clock, bus: &'a EventBus, registry: &'a Registry<'a>) -> Self {
    InterviewEngine {
      clock,
      bus,
      registry,
      interviews: RefCell::new(Vec::new()),
    }
  }

  /// Idempotent: a node already under interview returns `Ok` without effect.
  pub fn start(&self, eui64: Eui64) -> Result<()> {
    if self.interviews.borrow().iter().any(|c| c.eui64 == eui64) {
      return Ok(());
    }
    let mut interviews = self.interviews.borrow_mut();
    if interviews.len() >= I_MAX {
      return Err(BridgeError::NoMem);
    }
    let now = self.clock.now_ticks();
    interviews.push(Context { eui64, stage: Stage::Init, retry: 0, start_tick: now, step_tick: now });
    drop(interviews);
    let _ = self.registry.set_state(eui64, NodeState::Interviewing);
    info!(target: "zb2mqtt::interview", "starting interview for {eui64:016x}");
    Ok(())
  }

  pub fn stage_of(&self, eui64: Eui64) -> Stage {
    self
      .interviews
      .borrow()
      .iter()
      .find(|c| c.eui64 == eui64)
      .map(|c| c.stage)
      .unwrap_or(Stage::Init)
  }

  /// Idempotent: cancelling an interview not in progress is a no-op `Ok`.
  pub fn cancel(&self, eui64: Eui64) -> Result<()> {
    self.interviews.borrow_mut().retain(|c| c.eui64 != eui64);
    Ok(())
  }

  pub fn active_count(&self) -> usize {
    self.interviews.borrow().len()
  }

  /// Advances every active interview by one driver tick (§4.6). Intended to
  /// be called at `T_POLL_MS` cadence from a scheduler task.
  pub fn process(&self) {
    let now = self.clock.now_ticks();
    let eui64s: Vec<Eui64> = self.interviews.borrow().iter().map(|c| c.eui64).collect();
    for eui64 in eui64s {
      self.process_one(eui64, now);
    }
  }

  fn process_one(&self, eui64: Eui64, now: Tick) {
    let outcome = {
      let mut interviews = self.interviews.borrow_mut();
      let Some(ctx) = interviews.iter_mut().find(|c| c.eui64 == eui64) else {
        return;
      };

      if wrapping_diff(now, ctx.start_tick) as u32 > T_TOTAL_MS {
        warn!(target: "zb2mqtt::interview", "interview timeout for {eui64:016x}");
        ctx.stage = Stage::Failed;
      } else if wrapping_diff(now, ctx.step_tick) as u32 > T_STEP_MS {
        ctx.retry += 1;
        if ctx.retry > 3 {
          warn!(target: "zb2mqtt::interview", "step timeout, advancing stage for {eui64:016x}");
          ctx.retry = 0;
          ctx.stage = ctx.stage.next();
        }
        ctx.step_tick = now;
      }
      ctx.stage
    };

    match outcome {
      Stage::Init => self.advance(eui64, Stage::ActiveEp),
      Stage::ActiveEp => {
        self.simulate_active_endpoints(eui64);
        self.advance(eui64, Stage::SimpleDesc);
      }
      Stage::SimpleDesc => {
        self.simulate_simple_descriptors(eui64);
        self.advance(eui64, Stage::BasicAttr);
      }
      Stage::BasicAttr => {
        self.simulate_basic_attributes(eui64);
        self.advance(eui64, Stage::Bindings);
      }
      Stage::Bindings => self.advance(eui64, Stage::Complete),
      Stage::Complete => self.finish(eui64, true),
      Stage::Failed => self.finish(eui64, false),
    }
  }

  fn advance(&self, eui64: Eui64, to: Stage) {
    debug!(target: "zb2mqtt::interview", "{eui64:016x}: stage -> {}", to.name());
    let now = self.clock.now_ticks();
    if let Some(ctx) = self.interviews.borrow_mut().iter_mut().find(|c| c.eui64 == eui64) {
      ctx.stage = to;
      ctx.step_tick = now;
    }
  }

  fn finish(&self, eui64: Eui64, success: bool) {
    if success {
      info!(target: "zb2mqtt::interview", "interview complete for {eui64:016x}");
      let _ = self.registry.set_state(eui64, NodeState::Ready);
      let _ = self.bus.emit(
        event_type::CAP_STATE_CHANGED,
        0,
        component_id::INTERVIEW,
        Payload::CapStateChanged { eui64, cap: Capability::SwitchOn, value: CapValue::Bool(true) },
      );
    } else {
      warn!(target: "zb2mqtt::interview", "interview failed for {eui64:016x}");
      let _ = self.registry.set_state(eui64, NodeState::Stale);
    }
    self.interviews.borrow_mut().retain(|c| c.eui64 != eui64);
  }

  fn simulate_active_endpoints(&self, eui64: Eui64) {
    let _ = self.registry.with_node(eui64, |node| {
      node.endpoints.push(Endpoint { endpoint_id: 1, profile_id: 0x0104, device_id: 0x0100, clusters: Vec::new() });
      node.endpoints.push(Endpoint { endpoint_id: 2, profile_id: 0x0104, device_id: 0x0302, clusters: Vec::new() });
    });
  }

  fn simulate_simple_descriptors(&self, eui64: Eui64) {
    let _ = self.registry.with_node(eui64, |node| {
      if let Some(ep1) = node.find_endpoint_mut(1) {
        for cluster_id in [0x0000u16, 0x0006, 0x0008] {
          ep1.clusters.push(crate::registry::Cluster { cluster_id, direction: ClusterDir::Server, attributes: Vec::new() });
        }
      }
      if let Some(ep2) = node.find_endpoint_mut(2) {
        for cluster_id in [0x0000u16, 0x0402] {
          ep2.clusters.push(crate::registry::Cluster { cluster_id, direction: ClusterDir::Server, attributes: Vec::new() });
        }
      }
    });
  }

  fn simulate_basic_attributes(&self, eui64: Eui64) {
    let _ = self.registry.with_node(eui64, |node| {
      node.manufacturer = "Test Manufacturer".to_string();
      node.model = "Test Model".to_string();
      node.sw_build = 1;
      node.power_source = crate::model::PowerSource::Mains;
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::eventbus::EventBus;

  fn harness() -> (Clock, EventBus) {
    let clock = Clock::new();
    (clock.clone(), EventBus::new(clock))
  }

  #[test]
  fn full_interview_reaches_ready_with_clusters() {
    let (clock, bus) = harness();
    let registry = Registry::new(clock.clone(), &bus);
    registry.add_node(0xAA, 0x1111).unwrap();
    bus.dispatch(0);
    let engine = InterviewEngine::new(clock, &bus, &registry);
    engine.start(0xAA).unwrap();

    // INIT -> ActiveEp -> SimpleDesc -> BasicAttr -> Bindings -> Complete -> finish
    for _ in 0..6 {
      engine.process();
    }

    assert_eq!(engine.active_count(), 0);
    let node = registry.find_node(0xAA).unwrap();
    assert_eq!(node.state, NodeState::Ready);
    assert_eq!(node.manufacturer, "Test Manufacturer");
    assert_eq!(node.endpoints.len(), 2);
    assert_eq!(node.find_endpoint(1).unwrap().clusters.len(), 3);
  }

  #[test]
  fn start_is_idempotent_while_in_progress() {
    let (clock, bus) = harness();
    let registry = Registry::new(clock.clone(), &bus);
    registry.add_node(0xAA, 0x1111).unwrap();
    let engine = InterviewEngine::new(clock, &bus, &registry);
    engine.start(0xAA).unwrap();
    engine.start(0xAA).unwrap();
    assert_eq!(engine.active_count(), 1);
  }

  #[test]
  fn overall_timeout_marks_node_stale() {
    let (clock, bus) = harness();
    let registry = Registry::new(clock.clone(), &bus);
    registry.add_node(0xAA, 0x1111).unwrap();
    let engine = InterviewEngine::new(clock.clone(), &bus, &registry);
    engine.start(0xAA).unwrap();
    clock.tick_advance(T_TOTAL_MS + 1);
    engine.process();
    let node = registry.find_node(0xAA).unwrap();
    assert_eq!(node.state, NodeState::Stale);
    assert_eq!(engine.active_count(), 0);
  }

  #[test]
  fn step_timeout_retries_then_advances_stage() {
    let (clock, bus) = harness();
    let registry = Registry::new(clock.clone(), &bus);
    registry.add_node(0xAA, 0x1111).unwrap();
    let engine = InterviewEngine::new(clock.clone(), &bus, &registry);
    engine.start(0xAA).unwrap();
    engine.process(); // Init -> ActiveEp, step_tick reset
    for _ in 0..4 {
      clock.tick_advance(T_STEP_MS + 1);
      engine.process();
    }
    // after 4 retries (>3) the stage should have advanced past ActiveEp
    assert_ne!(engine.stage_of(0xAA), Stage::ActiveEp);
  }

  #[test]
  fn cancel_is_idempotent() {
    let (clock, bus) = harness();
    let registry = Registry::new(clock.clone(), &bus);
    registry.add_node(0xAA, 0x1111).unwrap();
    let engine = InterviewEngine::new(clock, &bus, &registry);
    engine.start(0xAA).unwrap();
    engine.cancel(0xAA).unwrap();
    engine.cancel(0xAA).unwrap();
    assert_eq!(engine.active_count(), 0);
  }
}
