//! # Store
//!
//! A [`Store`] is one open backing file. It hands out any number of concurrent read
//! transactions and at most one write transaction at a time.

use std::collections;
use std::path;

use parking_lot::Mutex;

use crate::error::{Error, Result};
use crate::storage::freelist::{Allocator, Freelist};
use crate::storage::paging::{self, Meta, PageHeader, PageRange, Pager, TxId};
use crate::storage::vfs::{self, FileSystem};
use crate::tx::{ReadTransaction, WriteTransaction};

/// Options for opening a [`Store`].
#[derive(Debug, Clone)]
pub struct Options {
  /// Page size for newly created stores. Existing stores keep the page size they were created
  /// with.
  pub page_size: usize,
  /// Skip fsync on commit. Commits stay atomic but are no longer durable.
  pub no_sync: bool,
  /// Number of decoded pages kept in the least-recently-used page cache. Zero is treated as one.
  pub cache_capacity: usize,
  /// Take an exclusive lock on the backing file while the store is open.
  pub lock: bool,
}

impl Default for Options {
  fn default() -> Self {
    Self { page_size: paging::DEFAULT_PAGE_SIZE, no_sync: false, cache_capacity: 1024, lock: true }
  }
}

impl Options {
  pub fn with_page_size(mut self, page_size: usize) -> Self {
    self.page_size = page_size;
    self
  }

  pub fn with_no_sync(mut self, no_sync: bool) -> Self {
    self.no_sync = no_sync;
    self
  }

  pub fn with_cache_capacity(mut self, cache_capacity: usize) -> Self {
    self.cache_capacity = cache_capacity;
    self
  }

  pub fn with_lock(mut self, lock: bool) -> Self {
    self.lock = lock;
    self
  }
}

fn valid_page_size(page_size: usize) -> bool {
  page_size.is_power_of_two() && (paging::MIN_PAGE_SIZE..=paging::MAX_PAGE_SIZE).contains(&page_size)
}

/// Reads a meta page at a byte offset, before the page size is known.
fn read_meta_at<F: vfs::File>(file: &mut F, offset: u64) -> Option<Meta> {
  let mut buf = [0u8; PageHeader::SIZE + Meta::SIZE];
  file.read(offset, &mut buf).ok()?;
  Meta::from_bytes(&buf).ok()
}

/// Store statistics, as of the last commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stats {
  pub txid: TxId,
  pub page_size: usize,
  pub page_count: u64,
  pub free_pages: usize,
  pub pending_pages: usize,
  pub readers: usize,
}

/// State owned by whoever holds the writer lock.
#[derive(Debug, Clone)]
pub(crate) struct Writer {
  pub allocator: Allocator,
  /// Pages holding the persisted free-list of the current meta.
  pub freelist_pages: PageRange,
  pub poisoned: bool,
}

/// The current meta and the snapshots pinned by live read transactions.
#[derive(Debug)]
pub(crate) struct Snapshots {
  pub meta: Meta,
  pub readers: collections::BTreeMap<TxId, usize>,
}

impl Snapshots {
  pub fn oldest_reader(&self) -> Option<TxId> {
    self.readers.keys().next().copied()
  }

  pub fn unregister(&mut self, txid: TxId) {
    if let collections::btree_map::Entry::Occupied(mut entry) = self.readers.entry(txid) {
      *entry.get_mut() -= 1;
      if *entry.get() == 0 {
        entry.remove();
      }
    }
  }
}

/// # Transactional key-value store
///
/// Buckets of ordered byte keys live in a single file. Every change happens inside a
/// [`WriteTransaction`] and becomes visible atomically when it commits; [`ReadTransaction`]s
/// see the state as of the commit that was current when they began.
pub struct Store<F: vfs::File = vfs::StandardFile> {
  pub(crate) pager: Pager<F>,
  pub(crate) writer: Mutex<Writer>,
  pub(crate) snapshots: Mutex<Snapshots>,
  locked: bool,
}

impl Store<vfs::StandardFile> {
  /// Opens the store at `path`, creating it if it does not exist.
  pub fn open(path: impl AsRef<path::Path>, options: Options) -> Result<Self> {
    Self::open_in(&mut vfs::StandardFileSystem, path.as_ref(), options)
  }
}

impl<F: vfs::File> Store<F> {
  /// Opens the store at `path` within the given file system.
  pub fn open_in<S: FileSystem<File = F>>(fs: &mut S, path: &S::Path, options: Options) -> Result<Self> {
    Self::from_file(fs.open(path)?, options)
  }

  /// Opens a store backed by an already opened file.
  pub fn from_file(mut file: F, options: Options) -> Result<Self> {
    if options.lock {
      file.try_lock().map_err(Error::Locked)?;
    }
    let layout = Self::layout(&mut file, &options);
    let (fresh, page_size) = match layout {
      Ok(layout) => layout,
      Err(err) => {
        if options.lock {
          let _ = file.unlock();
        }
        return Err(err);
      }
    };
    let pager = Pager::new(file, page_size, options.no_sync, options.cache_capacity);
    let result = if fresh { Self::create(&pager) } else { Self::load(&pager) };
    let (meta, writer) = match result {
      Ok(state) => state,
      Err(err) => {
        if options.lock {
          let _ = pager.with_file(|file| file.unlock());
        }
        return Err(err);
      }
    };
    tracing::debug!(txid = meta.txid, page_size, pages = meta.page_count, "opened store");
    Ok(Self {
      pager,
      writer: Mutex::new(writer),
      snapshots: Mutex::new(Snapshots { meta, readers: collections::BTreeMap::new() }),
      locked: options.lock,
    })
  }

  /// Returns whether the file is new, and the page size to use. Existing stores take their page
  /// size from meta slot 0. If slot 0 is damaged, slot 1 is looked for at every valid page size.
  fn layout(file: &mut F, options: &Options) -> Result<(bool, usize)> {
    if file.size()? == 0 {
      if !valid_page_size(options.page_size) {
        return Err(Error::InvalidPageSize(options.page_size));
      }
      return Ok((true, options.page_size));
    }
    if let Some(meta) = read_meta_at(file, 0).filter(|meta| valid_page_size(meta.page_size as usize)) {
      return Ok((false, meta.page_size as usize));
    }
    let page_sizes = (0..usize::BITS).map(|shift| 1usize << shift).filter(|&size| valid_page_size(size));
    for page_size in page_sizes {
      if read_meta_at(file, page_size as u64).is_some_and(|meta| meta.page_size as usize == page_size) {
        tracing::warn!(page_size, "meta slot 0 is damaged, page size taken from slot 1");
        return Ok((false, page_size));
      }
    }
    Err(Error::corruption("no valid meta page"))
  }

  /// Writes both meta slots of a new store. Slot 1 carries the higher txid, so the first commit
  /// lands in slot 0.
  fn create(pager: &Pager<F>) -> Result<(Meta, Writer)> {
    let page_size = pager.page_size();
    let mut meta = Meta { page_size: page_size as u32, root: 0, freelist: 0, page_count: 2, txid: 0 };
    for txid in 0..2 {
      meta.txid = txid;
      let mut page = vec![0u8; page_size];
      let bytes = meta.to_bytes();
      page[..bytes.len()].copy_from_slice(&bytes);
      pager.write(meta.slot(), &page)?;
    }
    pager.sync()?;
    let allocator = Allocator { freelist: Freelist::default(), page_count: meta.page_count };
    Ok((meta, Writer { allocator, freelist_pages: 0..0, poisoned: false }))
  }

  /// Picks the valid meta slot with the higher txid and loads its free-list.
  fn load(pager: &Pager<F>) -> Result<(Meta, Writer)> {
    let page_size = pager.page_size();
    let meta = [pager.read_meta(0), pager.read_meta(1)]
      .into_iter()
      .flatten()
      .filter(|meta| meta.page_size as usize == page_size)
      .max_by_key(|meta| meta.txid)
      .ok_or_else(|| Error::corruption("no valid meta page"))?;
    tracing::debug!(txid = meta.txid, slot = meta.slot(), "selected meta");

    let (freelist, freelist_pages) = if meta.freelist == 0 {
      (Freelist::default(), 0..0)
    } else {
      Freelist::decode(&pager.read(meta.freelist)?)?
    };
    if freelist.ids().iter().any(|&id| id < 2 || id >= meta.page_count) {
      return Err(Error::corruption("free-list refers to pages outside the file"));
    }

    // Pages past the high-water mark belong to commits that never completed.
    let end = meta.page_count * page_size as u64;
    let trimmed = pager.with_file(|file| -> std::io::Result<bool> {
      let trim = file.size()? > end;
      if trim {
        file.truncate(end)?;
      }
      Ok(trim)
    })?;
    if trimmed {
      tracing::debug!(pages = meta.page_count, "trimmed pages past the last commit");
    }
    let allocator = Allocator { freelist, page_count: meta.page_count };
    Ok((meta, Writer { allocator, freelist_pages, poisoned: false }))
  }

  /// Begins a read transaction pinned to the current commit. Never blocks on writers.
  pub fn begin_read(&self) -> ReadTransaction<'_, F> {
    let mut snapshots = self.snapshots.lock();
    let meta = snapshots.meta;
    *snapshots.readers.entry(meta.txid).or_default() += 1;
    ReadTransaction::new(self, meta)
  }

  /// Begins the write transaction, blocking while another one is active.
  pub fn begin_write(&self) -> Result<WriteTransaction<'_, F>> {
    let mut writer = self.writer.lock();
    if writer.poisoned {
      tracing::warn!("refusing write transaction on poisoned store");
      return Err(Error::Poisoned);
    }
    let meta = {
      let snapshots = self.snapshots.lock();
      writer.allocator.freelist.release(snapshots.oldest_reader());
      snapshots.meta
    };
    Ok(WriteTransaction::new(self, writer, meta))
  }

  /// Runs `f` in a read transaction.
  pub fn view<T>(&self, f: impl FnOnce(&ReadTransaction<'_, F>) -> Result<T>) -> Result<T> {
    let tx = self.begin_read();
    f(&tx)
  }

  /// Runs `f` in the write transaction, committing if it returns `Ok` and rolling back
  /// otherwise.
  pub fn update<T>(&self, f: impl FnOnce(&mut WriteTransaction<'_, F>) -> Result<T>) -> Result<T> {
    let mut tx = self.begin_write()?;
    match f(&mut tx) {
      Ok(value) => {
        tx.commit()?;
        Ok(value)
      }
      Err(err) => {
        tx.rollback();
        Err(err)
      }
    }
  }

  /// Makes a commit visible to read transactions that begin from now on.
  pub(crate) fn publish(&self, meta: Meta) {
    self.snapshots.lock().meta = meta;
  }

  /// Returns statistics as of the last commit. Blocks while a write transaction is active.
  pub fn stats(&self) -> Stats {
    let writer = self.writer.lock();
    let snapshots = self.snapshots.lock();
    Stats {
      txid: snapshots.meta.txid,
      page_size: self.pager.page_size(),
      page_count: snapshots.meta.page_count,
      free_pages: writer.allocator.freelist.free_count(),
      pending_pages: writer.allocator.freelist.pending_count(),
      readers: snapshots.readers.values().sum(),
    }
  }

  /// Releases the file lock and closes the store.
  pub fn close(mut self) -> Result<()> {
    if self.locked {
      self.locked = false;
      self.pager.with_file(|file| file.unlock())?;
    }
    Ok(())
  }
}

impl<F: vfs::File> Drop for Store<F> {
  fn drop(&mut self) {
    if self.locked {
      if let Err(err) = self.pager.with_file(|file| file.unlock()) {
        tracing::warn!(%err, "failed to unlock store file");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::vfs::{Fault, File, FileSystem, MemoryFile, MemoryFileSystem};
  use crate::tx::Transaction;
  use tempfile;

  const PAGE_SIZE: usize = 1024;

  fn open(fs: &mut MemoryFileSystem) -> Result<Store<MemoryFile>> {
    Store::open_in(fs, "db", Options::default().with_page_size(PAGE_SIZE))
  }

  fn put(store: &Store<MemoryFile>, key: &[u8], value: &[u8]) {
    store
      .update(|tx| {
        tx.create_bucket_if_not_exists("b")?;
        tx.put("b", key, value)
      })
      .unwrap();
  }

  fn get(store: &Store<MemoryFile>, key: &[u8]) -> Option<Vec<u8>> {
    store.view(|tx| tx.get("b", key)).unwrap()
  }

  #[test]
  fn test_standard_file_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    {
      let store = Store::open(&path, Options::default()).unwrap();
      assert_eq!(store.stats().txid, 1);
      store
        .update(|tx| {
          tx.create_bucket("b")?;
          tx.put("b", b"hello", b"world")
        })
        .unwrap();
      store.close().unwrap();
    }
    let store = Store::open(&path, Options::default().with_page_size(8192)).unwrap();
    // The page size recorded in the file wins.
    assert_eq!(store.stats().page_size, paging::DEFAULT_PAGE_SIZE);
    assert_eq!(store.view(|tx| tx.get("b", b"hello")).unwrap(), Some(b"world".to_vec()));
  }

  #[test]
  fn test_second_open_is_locked() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    let store = Store::open(&path, Options::default()).unwrap();
    assert!(matches!(Store::open(&path, Options::default()), Err(Error::Locked(_))));
    drop(store);
    Store::open(&path, Options::default()).unwrap();

    let mut fs = MemoryFileSystem::default();
    let store = open(&mut fs).unwrap();
    assert!(matches!(open(&mut fs), Err(Error::Locked(_))));
    drop(store);
    open(&mut fs).unwrap();
  }

  #[test]
  fn test_invalid_page_size() {
    let mut fs = MemoryFileSystem::default();
    for page_size in [512, 3000, 1 << 17] {
      let options = Options::default().with_page_size(page_size);
      assert!(matches!(Store::open_in(&mut fs, "db", options), Err(Error::InvalidPageSize(size)) if size == page_size));
    }
    // A failed open leaves the file unlocked.
    open(&mut fs).unwrap();
  }

  #[test]
  fn test_crash_before_sync_keeps_last_commit() {
    let mut fs = MemoryFileSystem::default();
    let store = open(&mut fs).unwrap();
    put(&store, b"a", b"1");

    fs.set_fault("db", Some(Fault::Sync));
    assert!(store.update(|tx| tx.put("b", b"a", b"2")).is_err());
    drop(store);
    fs.crash();

    let store = open(&mut fs).unwrap();
    assert_eq!(get(&store, b"a"), Some(b"1".to_vec()));
    put(&store, b"a", b"3");
    assert_eq!(get(&store, b"a"), Some(b"3".to_vec()));
  }

  #[test]
  fn test_crash_before_meta_flip_keeps_last_commit() {
    let mut fs = MemoryFileSystem::default();
    let store = open(&mut fs).unwrap();
    put(&store, b"a", b"1");
    let txid = store.stats().txid;

    // Data pages reach the disk, the meta page does not.
    fs.set_fault("db", Some(Fault::WriteRange(0..2 * PAGE_SIZE as u64)));
    assert!(store.update(|tx| tx.put("b", b"a", b"2")).is_err());
    drop(store);
    fs.crash();

    let store = open(&mut fs).unwrap();
    assert_eq!(store.stats().txid, txid);
    assert_eq!(get(&store, b"a"), Some(b"1".to_vec()));
  }

  #[test]
  fn test_corrupted_newest_meta_falls_back() {
    let mut fs = MemoryFileSystem::default();
    let store = open(&mut fs).unwrap();
    put(&store, b"a", b"1");
    put(&store, b"a", b"2");
    let txid = store.stats().txid;
    drop(store);

    let slot = txid % 2;
    fs.corrupt("db", slot * PAGE_SIZE as u64 + PageHeader::SIZE as u64 + 20, &[0xff; 4]);
    let store = open(&mut fs).unwrap();
    assert_eq!(store.stats().txid, txid - 1);
    assert_eq!(get(&store, b"a"), Some(b"1".to_vec()));
    drop(store);

    fs.corrupt("db", (1 - slot) * PAGE_SIZE as u64 + PageHeader::SIZE as u64, b"junk");
    assert!(matches!(open(&mut fs), Err(Error::Corruption(_))));
  }

  #[test]
  fn test_damaged_slot_zero_with_custom_page_size() {
    let mut fs = MemoryFileSystem::default();
    let store = Store::open_in(&mut fs, "db", Options::default().with_page_size(2048)).unwrap();
    put(&store, b"a", b"1");
    put(&store, b"a", b"2");
    let txid = store.stats().txid;
    assert_eq!(txid % 2, 1);
    drop(store);

    fs.corrupt("db", PageHeader::SIZE as u64, b"junk");
    let store = Store::open_in(&mut fs, "db", Options::default()).unwrap();
    assert_eq!(store.stats().page_size, 2048);
    assert_eq!(store.stats().txid, txid);
    assert_eq!(get(&store, b"a"), Some(b"2".to_vec()));
  }

  #[test]
  fn test_reopen_trims_pages_of_unfinished_commit() {
    let mut fs = MemoryFileSystem::default();
    let store = open(&mut fs).unwrap();
    put(&store, b"a", b"1");
    let page_count = store.stats().page_count;

    fs.set_fault("db", Some(Fault::WriteRange(0..2 * PAGE_SIZE as u64)));
    assert!(store.update(|tx| tx.put("b", &[7u8; 500], &[0u8; 3000])).is_err());
    drop(store);
    fs.crash();
    assert!(fs.open("db").unwrap().size().unwrap() > page_count * PAGE_SIZE as u64);

    let store = open(&mut fs).unwrap();
    assert_eq!(store.stats().page_count, page_count);
    assert_eq!(fs.open("db").unwrap().size().unwrap(), page_count * PAGE_SIZE as u64);
    put(&store, b"b", b"2");
    assert_eq!(get(&store, b"a"), Some(b"1".to_vec()));
  }

  #[test]
  fn test_freed_pages_are_reused() {
    let mut fs = MemoryFileSystem::default();
    let store = open(&mut fs).unwrap();
    for i in 0..200u32 {
      put(&store, b"counter", &i.to_le_bytes());
    }
    assert!(store.stats().page_count < 16, "{:?}", store.stats());
  }

  #[test]
  fn test_readers_pin_released_pages() {
    let mut fs = MemoryFileSystem::default();
    let store = open(&mut fs).unwrap();
    put(&store, b"a", b"1");

    let reader = store.begin_read();
    for i in 0..10u32 {
      put(&store, b"a", &i.to_le_bytes());
    }
    let stats = store.stats();
    assert_eq!(stats.readers, 1);
    assert!(stats.pending_pages > 0);
    assert_eq!(reader.get("b", b"a").unwrap(), Some(b"1".to_vec()));

    drop(reader);
    put(&store, b"a", b"last");
    let stats = store.stats();
    assert_eq!(stats.readers, 0);
    assert!(stats.free_pages > 0);
    assert_eq!(get(&store, b"a"), Some(b"last".to_vec()));
  }

  #[test]
  fn test_reopen_restores_free_list() {
    let mut fs = MemoryFileSystem::default();
    let store = open(&mut fs).unwrap();
    for i in 0..20u32 {
      put(&store, &i.to_be_bytes(), &[0u8; 100]);
    }
    store.update(|tx| tx.delete_bucket("b")).unwrap();
    let before = store.stats();
    drop(store);

    let store = open(&mut fs).unwrap();
    let after = store.stats();
    assert_eq!(after.page_count, before.page_count);
    assert_eq!(after.free_pages, before.free_pages + before.pending_pages);
    assert_eq!(store.view(|tx| tx.bucket_names()).unwrap(), Vec::<String>::new());
  }
}
