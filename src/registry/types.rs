//! Device graph types: Node → Endpoint → Cluster → Attribute
//! (ported from `reg_types.h`).

use serde::{Deserialize, Serialize};

use crate::clock::Tick;
use crate::model::{AttrType, AttrValue, Eui64, Nwk, PowerSource};

/// `REG_MAX_ENDPOINTS`.
pub const MAX_ENDPOINTS: usize = 8;
/// `REG_MAX_CLUSTERS`.
pub const MAX_CLUSTERS: usize = 16;
/// `REG_MAX_ATTRIBUTES`.
pub const MAX_ATTRIBUTES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
  New,
  Interviewing,
  Ready,
  Stale,
  Left,
}

impl NodeState {
  pub fn name(&self) -> &'static str {
    match self {
      NodeState::New => "new",
      NodeState::Interviewing => "interviewing",
      NodeState::Ready => "ready",
      NodeState::Stale => "stale",
      NodeState::Left => "left",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterDir {
  Server,
  Client,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribute {
  pub attr_id: u16,
  pub attr_type: AttrType,
  pub value: AttrValueSerde,
  pub last_updated: Tick,
}

/// `AttrValue` isn't itself `Serialize`/`Deserialize` (it borrows nothing,
/// but deriving serde for a `Copy` enum with a `FixedBytes<32>` payload
/// needs an explicit bridge type rather than deriving through it), so the
/// persisted record shape stores the tag and raw bytes directly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttrValueSerde {
  pub tag: AttrType,
  pub int: i64,
  pub bytes: Vec<u8>,
}

impl From<AttrValue> for AttrValueSerde {
  fn from(v: AttrValue) -> Self {
    match v {
      AttrValue::Bool(b) => AttrValueSerde { tag: AttrType::Bool, int: b as i64, bytes: Vec::new() },
      AttrValue::U8(x) => AttrValueSerde { tag: AttrType::U8, int: x as i64, bytes: Vec::new() },
      AttrValue::U16(x) => AttrValueSerde { tag: AttrType::U16, int: x as i64, bytes: Vec::new() },
      AttrValue::U32(x) => AttrValueSerde { tag: AttrType::U32, int: x as i64, bytes: Vec::new() },
      AttrValue::S8(x) => AttrValueSerde { tag: AttrType::S8, int: x as i64, bytes: Vec::new() },
      AttrValue::S16(x) => AttrValueSerde { tag: AttrType::S16, int: x as i64, bytes: Vec::new() },
      AttrValue::S32(x) => AttrValueSerde { tag: AttrType::S32, int: x as i64, bytes: Vec::new() },
      AttrValue::Str(s) => AttrValueSerde { tag: AttrType::String, int: 0, bytes: s.as_slice().to_vec() },
      AttrValue::Array(s) => AttrValueSerde { tag: AttrType::Array, int: 0, bytes: s.as_slice().to_vec() },
    }
  }
}

impl From<&AttrValueSerde> for AttrValue {
  fn from(v: &AttrValueSerde) -> Self {
    use crate::model::FixedStr32;
    match v.tag {
      AttrType::Bool => AttrValue::Bool(v.int != 0),
      AttrType::U8 => AttrValue::U8(v.int as u8),
      AttrType::U16 => AttrValue::U16(v.int as u16),
      AttrType::U32 => AttrValue::U32(v.int as u32),
      AttrType::S8 => AttrValue::S8(v.int as i8),
      AttrType::S16 => AttrValue::S16(v.int as i16),
      AttrType::S32 => AttrValue::S32(v.int as i32),
      AttrType::String => AttrValue::Str(FixedStr32::from_slice(&v.bytes)),
      AttrType::Array => AttrValue::Array(FixedStr32::from_slice(&v.bytes)),
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cluster {
  pub cluster_id: u16,
  pub direction: ClusterDir,
  pub attributes: Vec<Attribute>,
}

impl Cluster {
  pub fn find_attribute(&self, attr_id: u16) -> Option<&Attribute> {
    self.attributes.iter().find(|a| a.attr_id == attr_id)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
  pub endpoint_id: u8,
  pub profile_id: u16,
  pub device_id: u16,
  pub clusters: Vec<Cluster>,
}

impl Endpoint {
  pub fn find_cluster(&self, cluster_id: u16) -> Option<&Cluster> {
    self.clusters.iter().find(|c| c.cluster_id == cluster_id)
  }

  pub fn find_cluster_mut(&mut self, cluster_id: u16) -> Option<&mut Cluster> {
    self.clusters.iter_mut().find(|c| c.cluster_id == cluster_id)
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
  pub ieee_addr: Eui64,
  pub nwk_addr: Nwk,
  pub state: NodeState,
  pub manufacturer: String,
  pub model: String,
  pub friendly_name: String,
  pub sw_build: u32,
  pub lqi: u8,
  pub rssi: i8,
  pub power_source: PowerSource,
  pub endpoints: Vec<Endpoint>,
  pub join_time: Tick,
  pub last_seen: Tick,
  pub interview_stage: u8,
}

impl Node {
  pub fn new(ieee_addr: Eui64, nwk_addr: Nwk, now: Tick) -> Self {
    Node {
      ieee_addr,
      nwk_addr,
      state: NodeState::New,
      manufacturer: String::new(),
      model: String::new(),
      friendly_name: String::new(),
      sw_build: 0,
      lqi: 0,
      rssi: 0,
      power_source: PowerSource::Unknown,
      endpoints: Vec::new(),
      join_time: now,
      last_seen: now,
      interview_stage: 0,
    }
  }

  pub fn find_endpoint(&self, endpoint_id: u8) -> Option<&Endpoint> {
    self.endpoints.iter().find(|e| e.endpoint_id == endpoint_id)
  }

  pub fn find_endpoint_mut(&mut self, endpoint_id: u8) -> Option<&mut Endpoint> {
    self.endpoints.iter_mut().find(|e| e.endpoint_id == endpoint_id)
  }
}

/// Minimal read-only projection for shell/API consumers (`reg_node_info_t`).
#[derive(Debug, Clone)]
pub struct NodeInfo {
  pub ieee_addr: Eui64,
  pub nwk_addr: Nwk,
  pub state: NodeState,
  pub manufacturer: String,
  pub model: String,
  pub friendly_name: String,
  pub lqi: u8,
  pub endpoint_count: u8,
}

impl From<&Node> for NodeInfo {
  fn from(n: &Node) -> Self {
    NodeInfo {
      ieee_addr: n.ieee_addr,
      nwk_addr: n.nwk_addr,
      state: n.state,
      manufacturer: n.manufacturer.clone(),
      model: n.model.clone(),
      friendly_name: n.friendly_name.clone(),
      lqi: n.lqi,
      endpoint_count: n.endpoints.len() as u8,
    }
  }
}
