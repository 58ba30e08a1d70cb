//! Shared error vocabulary.
//!
//! Every component in this crate returns `Result<T, BridgeError>`. The
//! variants are the coarse error kinds the original firmware's `os_err_t`
//! exposed; we keep them as one enum rather than one-per-component, since
//! every component shares one vocabulary rather than exposing distinct
//! public APIs per entity kind the way DDS's per-subsystem `dds::result`
//! error types do.

use thiserror::Error;

/// Uniform error kind shared by every component.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
  #[error("invalid argument: {0}")]
  InvalidArg(String),

  #[error("no memory: resource pool exhausted")]
  NoMem,

  #[error("operation timed out")]
  Timeout,

  #[error("queue or buffer is full")]
  Full,

  #[error("queue or buffer is empty")]
  Empty,

  #[error("not found")]
  NotFound,

  #[error("resource busy")]
  Busy,

  #[error("already exists")]
  AlreadyExists,

  #[error("not initialized")]
  NotInitialized,

  #[error("not ready")]
  NotReady,
}

pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<serde_json::Error> for BridgeError {
  fn from(e: serde_json::Error) -> Self {
    BridgeError::InvalidArg(e.to_string())
  }
}

impl From<std::io::Error> for BridgeError {
  fn from(e: std::io::Error) -> Self {
    match e.kind() {
      std::io::ErrorKind::NotFound => BridgeError::NotFound,
      _ => BridgeError::InvalidArg(e.to_string()),
    }
  }
}
