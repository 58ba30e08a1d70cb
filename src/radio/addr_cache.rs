//! Address cache: `eui64 <-> nwk` with last-seen eviction.

use crate::clock::Tick;
use crate::model::{Eui64, Nwk};

struct Entry {
  eui64: Eui64,
  nwk: Nwk,
  last_seen: Tick,
}

/// `ZB_MAX_DEVICES` in the source's `zb_real.c`.
pub const M_DEV: usize = 64;

pub struct AddrCache {
  entries: Vec<Entry>,
}

impl Default for AddrCache {
  fn default() -> Self {
    Self::new()
  }
}

impl AddrCache {
  pub fn new() -> Self {
    AddrCache {
      entries: Vec::with_capacity(M_DEV),
    }
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Insert-or-update by eui64. Evicts the oldest entry by `last_seen` if
  /// the table is full and this is a new eui64.
  pub fn upsert(&mut self, eui64: Eui64, nwk: Nwk, now: Tick) {
    if let Some(entry) = self.entries.iter_mut().find(|e| e.eui64 == eui64) {
      entry.nwk = nwk;
      entry.last_seen = now;
      return;
    }
    if self.entries.len() >= M_DEV {
      if let Some((idx, _)) = self
        .entries
        .iter()
        .enumerate()
        .min_by_key(|(_, e)| e.last_seen)
      {
        self.entries.remove(idx);
      }
    }
    self.entries.push(Entry { eui64, nwk, last_seen: now });
  }

  pub fn remove(&mut self, eui64: Eui64) {
    self.entries.retain(|e| e.eui64 != eui64);
  }

  pub fn find_by_eui64(&self, eui64: Eui64) -> Option<Nwk> {
    self.entries.iter().find(|e| e.eui64 == eui64).map(|e| e.nwk)
  }

  pub fn find_by_nwk(&self, nwk: Nwk) -> Option<Eui64> {
    self.entries.iter().find(|e| e.nwk == nwk).map(|e| e.eui64)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn upsert_then_lookup_both_directions() {
    let mut cache = AddrCache::new();
    cache.upsert(1, 100, 0);
    assert_eq!(cache.find_by_eui64(1), Some(100));
    assert_eq!(cache.find_by_nwk(100), Some(1));
  }

  #[test]
  fn upsert_same_eui64_updates_in_place() {
    let mut cache = AddrCache::new();
    cache.upsert(1, 100, 0);
    cache.upsert(1, 200, 5);
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.find_by_eui64(1), Some(200));
  }

  #[test]
  fn remove_drops_entry() {
    let mut cache = AddrCache::new();
    cache.upsert(1, 100, 0);
    cache.remove(1);
    assert_eq!(cache.find_by_eui64(1), None);
  }

  #[test]
  fn full_table_evicts_oldest_by_last_seen() {
    let mut cache = AddrCache::new();
    for i in 0..M_DEV as u64 {
      cache.upsert(i + 1, i as u16, i as u32);
    }
    assert_eq!(cache.len(), M_DEV);
    // eui64=1 was inserted at tick 0, the oldest
    cache.upsert(9999, 9999, M_DEV as u32);
    assert_eq!(cache.find_by_eui64(1), None);
    assert_eq!(cache.find_by_eui64(9999), Some(9999));
    assert_eq!(cache.len(), M_DEV);
  }
}
