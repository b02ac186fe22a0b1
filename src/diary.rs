//! # Diary entries
//!
//! Entries live in the `entries` bucket, keyed by their [`EntryId`] and serialized with `bincode`.
//! Each operation of [`EntryStore`] runs as exactly one transaction.

use std::fmt;
use std::path;
use std::str;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::storage::vfs;
use crate::store::{Options, Store};
use crate::tx::Transaction;

/// Name of the bucket holding every entry.
pub const ENTRIES: &str = "entries";

/// # Entry identifier
///
/// Nanoseconds since the Unix epoch at creation, bumped past the last issued id when the clock has
/// not advanced. Keys are stored big-endian, so key order is id order is creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub u64);

impl EntryId {
  pub fn to_key(self) -> [u8; 8] {
    self.0.to_be_bytes()
  }

  pub fn from_key(key: &[u8]) -> Result<Self> {
    let bytes: [u8; 8] = key.try_into().map_err(|_| Error::corruption(format!("malformed entry key {key:?}")))?;
    Ok(EntryId(u64::from_be_bytes(bytes)))
  }
}

impl fmt::Display for EntryId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl str::FromStr for EntryId {
  type Err = std::num::ParseIntError;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    s.trim().parse().map(EntryId)
  }
}

/// The value stored under an entry's key.
#[derive(Debug, Serialize, Deserialize)]
struct EntryRecord {
  title: String,
  content: String,
  created_at: DateTime<Utc>,
}

/// A diary entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
  pub id: EntryId,
  pub title: String,
  pub content: String,
  pub created_at: DateTime<Utc>,
}

impl Entry {
  fn decode(key: &[u8], value: &[u8]) -> Result<Self> {
    let (record, _): (EntryRecord, usize) = bincode::serde::decode_from_slice(value, bincode::config::standard())?;
    Ok(Entry { id: EntryId::from_key(key)?, title: record.title, content: record.content, created_at: record.created_at })
  }
}

impl fmt::Display for Entry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let date = self.created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S");
    write!(f, "Title: {}\nContent: {}\nDate: {}", self.title, self.content, date)
  }
}

/// Source of creation timestamps.
pub trait Clock {
  fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// # Entry store
///
/// Create, read, list and delete diary entries on top of a [`Store`].
pub struct EntryStore<F: vfs::File = vfs::StandardFile, C: Clock = SystemClock> {
  store: Store<F>,
  clock: C,
}

impl EntryStore {
  /// Opens (or creates) the diary at `path` and makes sure the `entries` bucket exists.
  pub fn open(path: impl AsRef<path::Path>) -> Result<Self> {
    let entries = Self::new(Store::open(path, Options::default())?, SystemClock);
    entries.init()?;
    Ok(entries)
  }
}

impl<F: vfs::File, C: Clock> EntryStore<F, C> {
  /// Wraps an open store. Entry operations fail with [`Error::BucketMissing`] until
  /// [`EntryStore::init`] has run once on the store.
  pub fn new(store: Store<F>, clock: C) -> Self {
    Self { store, clock }
  }

  /// Creates the `entries` bucket unless it exists.
  pub fn init(&self) -> Result<()> {
    self.store.update(|tx| tx.create_bucket_if_not_exists(ENTRIES))
  }

  pub fn store(&self) -> &Store<F> {
    &self.store
  }

  /// Closes the underlying store.
  pub fn close(self) -> Result<()> {
    self.store.close()
  }

  /// Stores a new entry and returns its id, which is greater than every id issued before.
  pub fn create_entry(&self, title: &str, content: &str) -> Result<EntryId> {
    let created_at = self.clock.now();
    let nanos = created_at.timestamp_nanos_opt().and_then(|nanos| u64::try_from(nanos).ok()).ok_or(Error::Clock)?;
    let record = EntryRecord { title: title.to_string(), content: content.to_string(), created_at };
    let value = bincode::serde::encode_to_vec(&record, bincode::config::standard())?;

    self.store.update(|tx| {
      // The bucket's sequence holds the greatest id ever handed out, deleted entries included.
      let last = tx.sequence(ENTRIES)?;
      let id = EntryId(nanos.max(last.checked_add(1).ok_or(Error::Clock)?));
      if id.0 != nanos {
        tracing::debug!(%id, nanos, "entry id bumped past the last issued id");
      }
      tx.put(ENTRIES, &id.to_key(), &value)?;
      tx.set_sequence(ENTRIES, id.0)?;
      Ok(id)
    })
  }

  /// Returns the entry with the given id, or [`Error::NotFound`].
  pub fn read_entry(&self, id: EntryId) -> Result<Entry> {
    self.store.view(|tx| match tx.get(ENTRIES, &id.to_key())? {
      Some(value) => Entry::decode(&id.to_key(), &value),
      None => Err(Error::NotFound(id)),
    })
  }

  /// Returns every entry in ascending id (creation) order.
  pub fn list_entries(&self) -> Result<Vec<Entry>> {
    self.store.view(|tx| {
      tx.iter(ENTRIES)?.map(|element| element.and_then(|(key, value)| Entry::decode(&key, &value))).collect()
    })
  }

  /// Deletes the entry with the given id, or fails with [`Error::NotFound`] without changing
  /// anything.
  pub fn delete_entry(&self, id: EntryId) -> Result<()> {
    self.store.update(|tx| {
      if !tx.delete(ENTRIES, &id.to_key())? {
        return Err(Error::NotFound(id));
      }
      Ok(())
    })
  }
}

#[cfg(test)]
mod tests {
  use std::collections::VecDeque;

  use chrono::TimeZone;
  use parking_lot::Mutex;

  use super::*;
  use crate::storage::vfs::{MemoryFile, MemoryFileSystem};

  /// A clock that replays the given readings (in nanoseconds), then repeats the last one.
  struct ScriptedClock(Mutex<VecDeque<i64>>);

  impl ScriptedClock {
    fn new(readings: &[i64]) -> Self {
      Self(Mutex::new(readings.iter().copied().collect()))
    }
  }

  impl Clock for ScriptedClock {
    fn now(&self) -> DateTime<Utc> {
      let mut readings = self.0.lock();
      let nanos = if readings.len() > 1 { readings.pop_front() } else { readings.front().copied() };
      Utc.timestamp_nanos(nanos.unwrap_or_default())
    }
  }

  fn entries<C: Clock>(clock: C) -> EntryStore<MemoryFile, C> {
    let mut fs = MemoryFileSystem::default();
    let entries = EntryStore::new(Store::open_in(&mut fs, "diary", Options::default()).unwrap(), clock);
    entries.init().unwrap();
    entries
  }

  fn titles<F: vfs::File, C: Clock>(entries: &EntryStore<F, C>) -> Vec<String> {
    entries.list_entries().unwrap().into_iter().map(|entry| entry.title).collect()
  }

  #[test]
  fn test_entry_id_text_and_key() {
    let id: EntryId = "1735762832123456789".parse().unwrap();
    assert_eq!(id, EntryId(1735762832123456789));
    assert_eq!(id.to_string(), "1735762832123456789");
    assert_eq!(EntryId::from_key(&id.to_key()).unwrap(), id);
    assert!("12ab".parse::<EntryId>().is_err());
    assert!(EntryId::from_key(b"short").is_err());
    assert!(EntryId(255).to_key() < EntryId(256).to_key());
  }

  #[test]
  fn test_create_then_read() {
    let entries = entries(SystemClock);
    let id = entries.create_entry("My First Day", "Today I started.").unwrap();
    let entry = entries.read_entry(id).unwrap();
    assert_eq!(entry.id, id);
    assert_eq!(entry.title, "My First Day");
    assert_eq!(entry.content, "Today I started.");
    assert_eq!(entry.created_at.timestamp_nanos_opt(), Some(id.0 as i64));
  }

  #[test]
  fn test_list_in_creation_order() {
    let entries = entries(SystemClock);
    assert!(entries.list_entries().unwrap().is_empty());
    let ids: Vec<EntryId> = (0..50).map(|i| entries.create_entry(&format!("entry {i}"), "").unwrap()).collect();
    let listed: Vec<EntryId> = entries.list_entries().unwrap().into_iter().map(|entry| entry.id).collect();
    assert_eq!(listed, ids);
    assert!(ids.windows(2).all(|pair| pair[0] < pair[1]));
  }

  #[test]
  fn test_clock_collisions_and_regressions_still_yield_increasing_ids() {
    let entries = entries(ScriptedClock::new(&[1_000, 1_000, 1_000, 500, 2_000]));
    let ids: Vec<u64> = (0..6).map(|i| entries.create_entry(&i.to_string(), "").unwrap().0).collect();
    assert_eq!(ids, vec![1_000, 1_001, 1_002, 1_003, 2_000, 2_001]);
    assert_eq!(titles(&entries), vec!["0", "1", "2", "3", "4", "5"]);
  }

  #[test]
  fn test_deleted_ids_are_never_reissued() {
    let entries = entries(ScriptedClock::new(&[1_000]));
    let first = entries.create_entry("X", "").unwrap();
    entries.delete_entry(first).unwrap();
    let second = entries.create_entry("Y", "").unwrap();
    assert!(second > first);
    assert!(entries.read_entry(first).unwrap_err().is_not_found());
    assert_eq!(entries.read_entry(second).unwrap().title, "Y");
  }

  #[test]
  fn test_issued_ids_survive_reopen() {
    let mut fs = MemoryFileSystem::default();
    let open = |fs: &mut MemoryFileSystem| {
      let entries = EntryStore::new(Store::open_in(fs, "diary", Options::default()).unwrap(), ScriptedClock::new(&[5]));
      entries.init().unwrap();
      entries
    };
    let entries = open(&mut fs);
    let ids: Vec<EntryId> = (0..3).map(|_| entries.create_entry("t", "").unwrap()).collect();
    for &id in &ids {
      entries.delete_entry(id).unwrap();
    }
    entries.close().unwrap();

    let entries = open(&mut fs);
    assert_eq!(entries.create_entry("t", "").unwrap(), EntryId(8));
  }

  #[test]
  fn test_clock_before_epoch_is_rejected() {
    let entries = entries(ScriptedClock::new(&[-1]));
    assert!(matches!(entries.create_entry("t", "c"), Err(Error::Clock)));
    assert!(entries.list_entries().unwrap().is_empty());
  }

  #[test]
  fn test_missing_ids_are_not_found() {
    let entries = entries(SystemClock);
    entries.create_entry("kept", "").unwrap();
    let missing = EntryId(42);
    assert!(entries.read_entry(missing).unwrap_err().is_not_found());
    let txid = entries.store().stats().txid;
    for _ in 0..2 {
      assert!(matches!(entries.delete_entry(missing), Err(Error::NotFound(id)) if id == missing));
    }
    assert_eq!(entries.store().stats().txid, txid);
    assert_eq!(titles(&entries), vec!["kept"]);
  }

  #[test]
  fn test_operations_require_bucket() {
    let mut fs = MemoryFileSystem::default();
    let entries = EntryStore::new(Store::open_in(&mut fs, "diary", Options::default()).unwrap(), SystemClock);
    assert!(entries.create_entry("t", "c").unwrap_err().is_bucket_missing());
    assert!(entries.read_entry(EntryId(1)).unwrap_err().is_bucket_missing());
    assert!(entries.list_entries().unwrap_err().is_bucket_missing());
    assert!(entries.delete_entry(EntryId(1)).unwrap_err().is_bucket_missing());
    entries.init().unwrap();
    entries.init().unwrap();
    entries.create_entry("t", "c").unwrap();
  }

  #[test]
  fn test_delete_scenario() {
    let entries = entries(SystemClock);
    let a = entries.create_entry("A", "first").unwrap();
    let b = entries.create_entry("B", "second").unwrap();
    let c = entries.create_entry("C", "third").unwrap();
    assert_eq!(titles(&entries), vec!["A", "B", "C"]);

    entries.delete_entry(b).unwrap();
    let listed: Vec<EntryId> = entries.list_entries().unwrap().into_iter().map(|entry| entry.id).collect();
    assert_eq!(listed, vec![a, c]);
    assert!(entries.read_entry(b).unwrap_err().is_not_found());
  }

  #[test]
  fn test_display_layout() {
    let created_at = Utc.with_ymd_and_hms(2025, 1, 1, 12, 30, 45).unwrap();
    let entry = Entry { id: EntryId(1), title: "Go Programming".into(), content: "Simple.".into(), created_at };
    let local = created_at.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string();
    assert_eq!(entry.to_string(), format!("Title: Go Programming\nContent: Simple.\nDate: {local}"));
  }
}
