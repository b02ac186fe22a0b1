//! # Riji
//!
//! A personal diary on top of an embedded, single-file, transactional key-value store.
//!
//! The store keeps named buckets of ordered byte keys in copy-on-write B+ trees. Any number of
//! read transactions see consistent snapshots while one write transaction at a time builds the
//! next commit, which becomes visible atomically once its meta page is durable. See
//! [`storage::paging`] for the file format.

pub mod encoding {
  pub mod prefix_varint;
}

pub mod storage {
  pub mod btree;
  pub mod freelist;
  pub mod node;
  pub mod paging;
  pub mod vfs;
}

pub mod diary;
pub mod error;
pub mod store;
pub mod tx;

pub use diary::{Clock, Entry, EntryId, EntryStore, SystemClock};
pub use error::{Error, Result};
pub use storage::btree::{Cursor, Iter};
pub use store::{Options, Stats, Store};
pub use tx::{ReadTransaction, Transaction, WriteTransaction};
