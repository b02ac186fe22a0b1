//! # Errors
//!
//! Every fallible operation in this crate returns [`Result`]. The variants fall into two groups:
//!
//! - Failures that abort the enclosing transaction or open call: [`Error::Io`],
//!   [`Error::Corruption`], [`Error::Locked`] and [`Error::Poisoned`].
//! - Expected outcomes that callers are meant to match on: [`Error::NotFound`] and
//!   [`Error::BucketMissing`]. Returning one of these from a write transaction rolls it back, but
//!   never damages the store.

use std::io;

use thiserror::Error;

use crate::diary::EntryId;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in store and entry operations.
#[derive(Debug, Error)]
pub enum Error {
  #[error("I/O error: {0}")]
  Io(#[from] io::Error),

  #[error("store corrupted: {0}")]
  Corruption(String),

  #[error("store file is locked by another handle: {0}")]
  Locked(#[source] io::Error),

  #[error("store poisoned by a failed commit, reopen it to continue")]
  Poisoned,

  #[error("bucket {0:?} does not exist")]
  BucketMissing(String),

  #[error("bucket {0:?} already exists")]
  BucketExists(String),

  #[error("sequence of bucket {0:?} overflowed")]
  SequenceOverflow(String),

  #[error("entry with ID {0} not found")]
  NotFound(EntryId),

  #[error("key required")]
  KeyRequired,

  #[error("key too large: {size} bytes (max {max})")]
  KeyTooLarge { size: usize, max: usize },

  #[error("value too large: {size} bytes (max {max})")]
  ValueTooLarge { size: usize, max: usize },

  #[error("invalid page size {0}")]
  InvalidPageSize(usize),

  #[error("failed to encode entry: {0}")]
  Encode(#[from] bincode::error::EncodeError),

  #[error("failed to decode entry: {0}")]
  Decode(#[from] bincode::error::DecodeError),

  #[error("clock reading out of range")]
  Clock,
}

impl Error {
  /// Returns `true` for the expected "absent key" outcome.
  pub fn is_not_found(&self) -> bool {
    matches!(self, Error::NotFound(_))
  }

  /// Returns `true` if the schema precondition (bucket exists) was violated.
  pub fn is_bucket_missing(&self) -> bool {
    matches!(self, Error::BucketMissing(_))
  }

  pub(crate) fn corruption(reason: impl Into<String>) -> Self {
    Error::Corruption(reason.into())
  }
}
