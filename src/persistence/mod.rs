//! Buffered key/value persistence.
//!
//! The write-buffer-then-flush shape, including the slightly odd "buffer
//! full and key is new → flush, then reuse slot 0" fallback, is carried
//! over verbatim from `os_persist.c`'s host implementation: after `flush`
//! empties every valid slot, slot 0 is guaranteed free, so the fallback
//! never actually clobbers a still-buffered write.

pub mod backend;

use std::cell::RefCell;

use log::{debug, trace, warn};

use crate::error::{BridgeError, Result};
use crate::eventbus::{event_type, BusSender, Payload};
use crate::model::component_id;

pub use backend::{FileBackend, MemoryBackend, PersistBackend};

/// `OS_PERSIST_KEY_MAX`.
pub const K_MAX: usize = 32;
/// `OS_PERSIST_VALUE_MAX`.
pub const V_MAX: usize = 512;
/// `WRITE_BUFFER_SIZE` in the source's host `os_persist.c`.
pub const M_WB: usize = 16;

const SCHEMA_KEY: &str = "_schema_version";

struct WriteBufEntry {
  key: String,
  data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistStats {
  pub writes_buffered: u32,
  pub total_writes: u64,
  pub total_reads: u64,
}

pub struct Store {
  backend: Box<dyn PersistBackend>,
  buffer: RefCell<Vec<WriteBufEntry>>,
  bus: Option<BusSender>,
  stats: RefCell<PersistStats>,
  schema_version: RefCell<u32>,
}

impl Store {
  pub fn new(backend: Box<dyn PersistBackend>, bus: Option<BusSender>) -> Self {
    let schema_version = match backend.read(SCHEMA_KEY) {
      Ok(Some(bytes)) if bytes.len() == 4 => {
        u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
      }
      _ => 0,
    };
    debug!(target: "zb2mqtt::persistence", "persistence initialized (schema v{schema_version})");
    Store {
      backend,
      buffer: RefCell::new(Vec::new()),
      bus,
      stats: RefCell::new(PersistStats::default()),
      schema_version: RefCell::new(schema_version),
    }
  }

  pub fn put(&self, key: &str, data: &[u8]) -> Result<()> {
    if key.is_empty() || key.len() > K_MAX {
      return Err(BridgeError::InvalidArg(format!("key length {} exceeds K_MAX", key.len())));
    }
    if data.len() > V_MAX {
      return Err(BridgeError::InvalidArg(format!("value length {} exceeds V_MAX", data.len())));
    }

    let mut buffer = self.buffer.borrow_mut();
    if let Some(entry) = buffer.iter_mut().find(|e| e.key == key) {
      entry.data = data.to_vec();
      trace!(target: "zb2mqtt::persistence", "buffered write (update): {key} ({} bytes)", data.len());
      return Ok(());
    }

    if buffer.len() < M_WB {
      buffer.push(WriteBufEntry {
        key: key.to_string(),
        data: data.to_vec(),
      });
      self.stats.borrow_mut().writes_buffered = buffer.len() as u32;
      trace!(target: "zb2mqtt::persistence", "buffered write: {key} ({} bytes)", data.len());
      return Ok(());
    }

    drop(buffer);
    self.flush()?;
    let mut buffer = self.buffer.borrow_mut();
    buffer.push(WriteBufEntry {
      key: key.to_string(),
      data: data.to_vec(),
    });
    self.stats.borrow_mut().writes_buffered = buffer.len() as u32;
    Ok(())
  }

  pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    self.stats.borrow_mut().total_reads += 1;
    if let Some(entry) = self.buffer.borrow().iter().find(|e| e.key == key) {
      return Ok(Some(entry.data.clone()));
    }
    self.backend.read(key)
  }

  pub fn del(&self, key: &str) -> Result<()> {
    self.buffer.borrow_mut().retain(|e| e.key != key);
    self.stats.borrow_mut().writes_buffered = self.buffer.borrow().len() as u32;
    self.backend.delete(key)
  }

  pub fn exists(&self, key: &str) -> bool {
    if self.buffer.borrow().iter().any(|e| e.key == key) {
      return true;
    }
    self.backend.exists(key)
  }

  /// Writes every buffered entry to the backend. Emits `PERSIST_FLUSH` with
  /// the count actually written.
  pub fn flush(&self) -> Result<()> {
    let entries = self.buffer.borrow_mut().drain(..).collect::<Vec<_>>();
    let mut flushed = 0u32;
    let mut stats = self.stats.borrow_mut();
    for entry in entries {
      match self.backend.write(&entry.key, &entry.data) {
        Ok(()) => {
          stats.total_writes += 1;
          flushed += 1;
        }
        Err(e) => warn!(target: "zb2mqtt::persistence", "failed to flush {}: {e}", entry.key),
      }
    }
    stats.writes_buffered = 0;
    drop(stats);

    if flushed > 0 {
      debug!(target: "zb2mqtt::persistence", "flushed {flushed} writes");
      if let Some(bus) = &self.bus {
        let _ = bus.publish(crate::eventbus::Event::new(
          event_type::PERSIST_FLUSH,
          0,
          0,
          component_id::PERSISTENCE,
          Payload::PersistFlush { records: flushed },
        ));
      }
    }
    Ok(())
  }

  pub fn schema_version(&self) -> u32 {
    *self.schema_version.borrow()
  }

  pub fn set_schema_version(&self, version: u32) -> Result<()> {
    *self.schema_version.borrow_mut() = version;
    self.put(SCHEMA_KEY, &version.to_le_bytes())
  }

  pub fn erase_all(&self) -> Result<()> {
    self.buffer.borrow_mut().clear();
    *self.stats.borrow_mut() = PersistStats::default();
    *self.schema_version.borrow_mut() = 0;
    self.backend.erase_all()
  }

  pub fn stats(&self) -> PersistStats {
    *self.stats.borrow()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn store() -> Store {
    Store::new(Box::new(MemoryBackend::new()), None)
  }

  #[test]
  fn put_then_get_reads_from_write_buffer() {
    let store = store();
    store.put("a", b"1").unwrap();
    assert_eq!(store.get("a").unwrap(), Some(b"1".to_vec()));
    assert_eq!(store.stats().total_writes, 0);
  }

  #[test]
  fn flush_moves_entries_to_backend_and_clears_buffer() {
    let store = store();
    store.put("a", b"1").unwrap();
    store.put("b", b"2").unwrap();
    store.flush().unwrap();
    assert_eq!(store.stats().writes_buffered, 0);
    assert_eq!(store.stats().total_writes, 2);
    assert_eq!(store.get("a").unwrap(), Some(b"1".to_vec()));
  }

  #[test]
  fn put_rejects_oversized_key_and_value() {
    let store = store();
    let long_key = "x".repeat(K_MAX + 1);
    assert!(store.put(&long_key, b"v").is_err());
    let big_value = vec![0u8; V_MAX + 1];
    assert!(store.put("k", &big_value).is_err());
  }

  #[test]
  fn buffer_overflow_flushes_then_accepts_new_key() {
    let store = store();
    for i in 0..M_WB {
      store.put(&format!("k{i}"), b"v").unwrap();
    }
    assert_eq!(store.stats().writes_buffered, M_WB as u32);
    store.put("overflow", b"v").unwrap();
    // the M_WB original entries were flushed to make room
    assert_eq!(store.stats().total_writes, M_WB as u64);
    assert_eq!(store.get("overflow").unwrap(), Some(b"v".to_vec()));
  }

  #[test]
  fn del_removes_from_buffer_and_backend() {
    let store = store();
    store.put("a", b"1").unwrap();
    store.flush().unwrap();
    store.del("a").unwrap();
    assert!(!store.exists("a"));
  }

  #[test]
  fn schema_version_defaults_to_zero_and_is_settable() {
    let store = Store::new(Box::new(MemoryBackend::new()), None);
    assert_eq!(store.schema_version(), 0);
    store.set_schema_version(3).unwrap();
    assert_eq!(store.schema_version(), 3);
  }
}
