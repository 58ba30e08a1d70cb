//! Backing stores for the persistence front end.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};

use crate::error::Result;

pub trait PersistBackend {
  fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;
  fn write(&self, key: &str, data: &[u8]) -> Result<()>;
  fn delete(&self, key: &str) -> Result<()>;
  fn exists(&self, key: &str) -> bool;
  fn erase_all(&self) -> Result<()>;
}

/// Host-simulation / test backend: `HashMap`-backed, nothing touches disk.
#[derive(Default)]
pub struct MemoryBackend {
  data: RefCell<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    MemoryBackend::default()
  }
}

impl PersistBackend for MemoryBackend {
  fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.data.borrow().get(key).cloned())
  }

  fn write(&self, key: &str, data: &[u8]) -> Result<()> {
    self.data.borrow_mut().insert(key.to_string(), data.to_vec());
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    self.data.borrow_mut().remove(key);
    Ok(())
  }

  fn exists(&self, key: &str) -> bool {
    self.data.borrow().contains_key(key)
  }

  fn erase_all(&self) -> Result<()> {
    self.data.borrow_mut().clear();
    Ok(())
  }
}

/// "a directory of files" backend (§6 simulation target, §4.3): one file per
/// key, named by a filesystem-safe hash of the key, mirroring the source's
/// host implementation (`os_persist.c`'s `PERSIST_DIR`/`key_to_path`), which
/// also keyed each on-disk file by the raw key rather than any structured
/// path. We hash instead of sanitizing the key into a path ourselves, since
/// keys here (`"node/<hex-eui64>"`) already contain a path separator.
pub struct FileBackend {
  dir: PathBuf,
}

impl FileBackend {
  pub fn new(dir: impl AsRef<Path>) -> Result<Self> {
    let dir = dir.as_ref().to_path_buf();
    fs::create_dir_all(&dir)?;
    Ok(FileBackend { dir })
  }

  fn path_for(&self, key: &str) -> PathBuf {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    key.hash(&mut hasher);
    self.dir.join(format!("{:016x}.bin", hasher.finish()))
  }
}

impl PersistBackend for FileBackend {
  fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
    match fs::read(self.path_for(key)) {
      Ok(bytes) => Ok(Some(bytes)),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
      Err(e) => Err(e.into()),
    }
  }

  fn write(&self, key: &str, data: &[u8]) -> Result<()> {
    fs::write(self.path_for(key), data)?;
    Ok(())
  }

  fn delete(&self, key: &str) -> Result<()> {
    match fs::remove_file(self.path_for(key)) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
      Err(e) => Err(e.into()),
    }
  }

  fn exists(&self, key: &str) -> bool {
    self.path_for(key).exists()
  }

  fn erase_all(&self) -> Result<()> {
    for entry in fs::read_dir(&self.dir)? {
      let entry = entry?;
      if entry.file_type()?.is_file() {
        fs::remove_file(entry.path())?;
      }
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn memory_backend_roundtrips() {
    let be = MemoryBackend::new();
    be.write("k", b"v").unwrap();
    assert_eq!(be.read("k").unwrap(), Some(b"v".to_vec()));
    assert!(be.exists("k"));
    be.delete("k").unwrap();
    assert!(!be.exists("k"));
  }

  #[test]
  fn file_backend_roundtrips() {
    let tmp = tempfile::tempdir().unwrap();
    let be = FileBackend::new(tmp.path()).unwrap();
    be.write("node/aabbcc", b"payload").unwrap();
    assert_eq!(be.read("node/aabbcc").unwrap(), Some(b"payload".to_vec()));
    assert!(be.exists("node/aabbcc"));
    be.delete("node/aabbcc").unwrap();
    assert_eq!(be.read("node/aabbcc").unwrap(), None);
  }

  #[test]
  fn file_backend_erase_all_clears_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let be = FileBackend::new(tmp.path()).unwrap();
    be.write("a", b"1").unwrap();
    be.write("b", b"2").unwrap();
    be.erase_all().unwrap();
    assert!(!be.exists("a"));
    assert!(!be.exists("b"));
  }
}
