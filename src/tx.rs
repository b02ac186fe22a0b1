//! # Transactions
//!
//! Both transaction kinds read through the [`Transaction`] trait. Buckets are found through a
//! catalog tree whose keys are bucket names and whose values are the buckets' root pages.
//!
//! A [`WriteTransaction`] holds the writer lock for its whole life. Its changes live in dirty
//! in-memory nodes until [`WriteTransaction::commit`], which writes them to free pages, syncs,
//! and only then writes and syncs the new meta page. Dropping it without committing rolls it
//! back.

use std::collections;

use parking_lot::MutexGuard;

use crate::error::{Error, Result};
use crate::storage::btree::{self, Child, ChildRef, Cursor, Iter};
use crate::storage::freelist::Freelist;
use crate::storage::paging::{Meta, PageId, Pager, TxId};
use crate::storage::vfs;
use crate::store::{Store, Writer};

/// Largest accepted key, in bytes.
pub const MAX_KEY_SIZE: usize = 32768;

/// Largest accepted value, in bytes.
pub const MAX_VALUE_SIZE: usize = (1 << 31) - 2;

/// A catalog value: the bucket's root page (`0` while it is empty) and its sequence number.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct BucketHeader {
  root: PageId,
  sequence: u64,
}

impl BucketHeader {
  const SIZE: usize = 16;

  fn to_bytes(self) -> [u8; Self::SIZE] {
    let mut buf = [0u8; Self::SIZE];
    buf[..8].copy_from_slice(&self.root.to_le_bytes());
    buf[8..].copy_from_slice(&self.sequence.to_le_bytes());
    buf
  }

  fn from_bytes(name: &str, value: &[u8]) -> Result<Self> {
    let bytes: [u8; Self::SIZE] =
      value.try_into().map_err(|_| Error::corruption(format!("bucket {name:?} has a malformed header")))?;
    let (root, sequence) = bytes.split_at(8);
    Ok(Self {
      root: PageId::from_le_bytes(root.try_into().unwrap_or_default()),
      sequence: u64::from_le_bytes(sequence.try_into().unwrap_or_default()),
    })
  }
}

/// # Read access shared by both transaction kinds
pub trait Transaction<F: vfs::File> {
  /// The txid of the commit this transaction reads (or, for a write transaction, will create).
  fn txid(&self) -> TxId;

  #[doc(hidden)]
  fn pager(&self) -> &Pager<F>;

  #[doc(hidden)]
  fn catalog(&self) -> ChildRef<'_>;

  /// Returns the bucket's root and sequence number.
  #[doc(hidden)]
  fn bucket(&self, bucket: &str) -> Result<(ChildRef<'_>, u64)>;

  /// Returns the value stored under `key`, or `None`.
  fn get(&self, bucket: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
    btree::get(self.pager(), self.bucket(bucket)?.0, key)
  }

  /// Returns an unpositioned cursor over the bucket.
  fn cursor(&self, bucket: &str) -> Result<Cursor<'_, F>> {
    Ok(Cursor::new(self.pager(), self.bucket(bucket)?.0))
  }

  /// Returns the bucket's sequence number. It starts at zero and only changes through
  /// [`WriteTransaction::next_sequence`] and [`WriteTransaction::set_sequence`].
  fn sequence(&self, bucket: &str) -> Result<u64> {
    Ok(self.bucket(bucket)?.1)
  }

  /// Iterates over the whole bucket in ascending key order. Every call starts from the beginning
  /// of this transaction's snapshot.
  fn iter(&self, bucket: &str) -> Result<Iter<'_, F>> {
    Ok(Iter::new(self.cursor(bucket)?, None))
  }

  /// Iterates over the keys not less than `start`, in ascending order.
  fn range(&self, bucket: &str, start: &[u8]) -> Result<Iter<'_, F>> {
    Ok(Iter::new(self.cursor(bucket)?, Some(start.to_vec())))
  }

  fn has_bucket(&self, bucket: &str) -> Result<bool> {
    match self.bucket(bucket) {
      Ok(_) => Ok(true),
      Err(Error::BucketMissing(_)) => Ok(false),
      Err(err) => Err(err),
    }
  }

  /// Names of all buckets, in ascending order.
  fn bucket_names(&self) -> Result<Vec<String>> {
    Iter::new(Cursor::new(self.pager(), self.catalog()), None)
      .map(|element| element.map(|(name, _)| String::from_utf8_lossy(&name).into_owned()))
      .collect()
  }
}

fn lookup_bucket<F: vfs::File>(pager: &Pager<F>, catalog: ChildRef<'_>, bucket: &str) -> Result<BucketHeader> {
  let value = btree::get(pager, catalog, bucket.as_bytes())?;
  let value = value.ok_or_else(|| Error::BucketMissing(bucket.to_string()))?;
  BucketHeader::from_bytes(bucket, &value)
}

/// # Read transaction
///
/// An immutable view of the store as of the commit that was current when it began. Pages it can
/// reach are not reused until it is dropped.
pub struct ReadTransaction<'s, F: vfs::File> {
  store: &'s Store<F>,
  meta: Meta,
}

impl<'s, F: vfs::File> ReadTransaction<'s, F> {
  pub(crate) fn new(store: &'s Store<F>, meta: Meta) -> Self {
    Self { store, meta }
  }
}

impl<F: vfs::File> Transaction<F> for ReadTransaction<'_, F> {
  fn txid(&self) -> TxId {
    self.meta.txid
  }

  fn pager(&self) -> &Pager<F> {
    &self.store.pager
  }

  fn catalog(&self) -> ChildRef<'_> {
    ChildRef::Clean(self.meta.root)
  }

  fn bucket(&self, bucket: &str) -> Result<(ChildRef<'_>, u64)> {
    let header = lookup_bucket(self.pager(), self.catalog(), bucket)?;
    Ok((ChildRef::Clean(header.root), header.sequence))
  }
}

impl<F: vfs::File> Drop for ReadTransaction<'_, F> {
  fn drop(&mut self) {
    self.store.snapshots.lock().unregister(self.meta.txid);
  }
}

/// A bucket touched by a write transaction.
#[derive(Debug)]
struct OpenBucket {
  root: Child,
  sequence: u64,
  /// Whether the sequence number was changed.
  changed: bool,
}

/// Returns the bucket's entry in `buckets`, loading it from the catalog on first use.
fn open_bucket<'b, F: vfs::File>(
  pager: &Pager<F>,
  catalog: &Child,
  buckets: &'b mut collections::BTreeMap<Vec<u8>, OpenBucket>,
  bucket: &str,
) -> Result<&'b mut OpenBucket> {
  match buckets.entry(bucket.as_bytes().to_vec()) {
    collections::btree_map::Entry::Occupied(entry) => Ok(entry.into_mut()),
    collections::btree_map::Entry::Vacant(entry) => {
      let header = lookup_bucket(pager, catalog.as_ref(), bucket)?;
      Ok(entry.insert(OpenBucket { root: Child::Clean(header.root), sequence: header.sequence, changed: false }))
    }
  }
}

/// # Write transaction
///
/// The only transaction allowed to modify the store. See the module documentation for the commit
/// protocol.
pub struct WriteTransaction<'s, F: vfs::File> {
  store: &'s Store<F>,
  writer: MutexGuard<'s, Writer>,
  meta: Meta,
  catalog: Child,
  /// Buckets this transaction has touched, keyed by name.
  buckets: collections::BTreeMap<Vec<u8>, OpenBucket>,
  /// Committed pages this transaction copied or dropped.
  freed: Vec<PageId>,
  done: bool,
}

impl<'s, F: vfs::File> WriteTransaction<'s, F> {
  pub(crate) fn new(store: &'s Store<F>, writer: MutexGuard<'s, Writer>, meta: Meta) -> Self {
    Self {
      store,
      writer,
      meta,
      catalog: Child::Clean(meta.root),
      buckets: collections::BTreeMap::new(),
      freed: Vec::new(),
      done: false,
    }
  }

  /// Inserts or replaces `key`, returning the previous value.
  pub fn put(&mut self, bucket: &str, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>> {
    if key.is_empty() {
      return Err(Error::KeyRequired);
    }
    if key.len() > MAX_KEY_SIZE {
      return Err(Error::KeyTooLarge { size: key.len(), max: MAX_KEY_SIZE });
    }
    if value.len() > MAX_VALUE_SIZE {
      return Err(Error::ValueTooLarge { size: value.len(), max: MAX_VALUE_SIZE });
    }
    let pager = &self.store.pager;
    let open = open_bucket(pager, &self.catalog, &mut self.buckets, bucket)?;
    btree::put(pager, &mut open.root, key, value, &mut self.freed)
  }

  /// Removes `key`, returning whether it existed.
  pub fn delete(&mut self, bucket: &str, key: &[u8]) -> Result<bool> {
    let pager = &self.store.pager;
    let open = open_bucket(pager, &self.catalog, &mut self.buckets, bucket)?;
    Ok(btree::delete(pager, &mut open.root, key, &mut self.freed)?.is_some())
  }

  /// Increments the bucket's sequence number and returns the new value.
  pub fn next_sequence(&mut self, bucket: &str) -> Result<u64> {
    let open = open_bucket(&self.store.pager, &self.catalog, &mut self.buckets, bucket)?;
    open.sequence = open.sequence.checked_add(1).ok_or_else(|| Error::SequenceOverflow(bucket.to_string()))?;
    open.changed = true;
    Ok(open.sequence)
  }

  /// Sets the bucket's sequence number.
  pub fn set_sequence(&mut self, bucket: &str, sequence: u64) -> Result<()> {
    let open = open_bucket(&self.store.pager, &self.catalog, &mut self.buckets, bucket)?;
    open.sequence = sequence;
    open.changed = true;
    Ok(())
  }

  /// Creates an empty bucket, failing if it already exists.
  pub fn create_bucket(&mut self, bucket: &str) -> Result<()> {
    if bucket.is_empty() {
      return Err(Error::KeyRequired);
    }
    if self.has_bucket(bucket)? {
      return Err(Error::BucketExists(bucket.to_string()));
    }
    let header = BucketHeader::default().to_bytes();
    btree::put(&self.store.pager, &mut self.catalog, bucket.as_bytes(), &header, &mut self.freed)?;
    self.buckets.insert(bucket.as_bytes().to_vec(), OpenBucket { root: Child::Clean(0), sequence: 0, changed: false });
    Ok(())
  }

  /// Creates the bucket unless it already exists.
  pub fn create_bucket_if_not_exists(&mut self, bucket: &str) -> Result<()> {
    match self.create_bucket(bucket) {
      Err(Error::BucketExists(_)) => Ok(()),
      result => result,
    }
  }

  /// Deletes a bucket and releases all of its pages.
  pub fn delete_bucket(&mut self, bucket: &str) -> Result<()> {
    open_bucket(&self.store.pager, &self.catalog, &mut self.buckets, bucket)?;
    let open = self.buckets.remove(bucket.as_bytes()).ok_or_else(|| Error::BucketMissing(bucket.to_string()))?;
    btree::free_tree(&self.store.pager, &open.root, &mut self.freed)?;
    btree::delete(&self.store.pager, &mut self.catalog, bucket.as_bytes(), &mut self.freed)?;
    Ok(())
  }

  fn is_dirty(&self) -> bool {
    matches!(self.catalog, Child::Dirty(_))
      || !self.freed.is_empty()
      || self.buckets.values().any(|open| open.changed || matches!(open.root, Child::Dirty(_)))
  }

  /// Commits the transaction. On failure nothing becomes visible and the previous commit stays
  /// intact; a failure while writing the meta page additionally poisons the store.
  pub fn commit(mut self) -> Result<()> {
    self.done = true;
    if !self.is_dirty() {
      return Ok(());
    }
    let backup = self.writer.clone();
    match self.write_out() {
      Ok(meta) => {
        self.store.publish(meta);
        tracing::debug!(txid = meta.txid, root = meta.root, pages = meta.page_count, "committed");
        Ok(())
      }
      Err(err) => {
        let poisoned = self.writer.poisoned;
        *self.writer = backup;
        self.writer.poisoned = poisoned;
        tracing::warn!(txid = self.txid(), %err, poisoned, "commit failed");
        Err(err)
      }
    }
  }

  /// Spills every dirty tree, persists the free-list, syncs, and writes the new meta.
  fn write_out(&mut self) -> Result<Meta> {
    let txid = self.txid();
    let store = self.store;
    let pager = &store.pager;
    let page_size = pager.page_size();

    for (name, open) in std::mem::take(&mut self.buckets) {
      if !open.changed && matches!(open.root, Child::Clean(_)) {
        continue;
      }
      let root = btree::spill(pager, &mut self.writer.allocator, open.root)?;
      let header = BucketHeader { root, sequence: open.sequence };
      btree::put(pager, &mut self.catalog, &name, &header.to_bytes(), &mut self.freed)?;
    }
    let catalog = std::mem::replace(&mut self.catalog, Child::Clean(self.meta.root));
    let root = btree::spill(pager, &mut self.writer.allocator, catalog)?;

    let writer = &mut *self.writer;
    let old_freelist = std::mem::replace(&mut writer.freelist_pages, 0..0);
    writer.allocator.free_pages(txid, self.freed.drain(..).chain(old_freelist));
    let freelist = &writer.allocator.freelist;
    let pages = Freelist::pages_for(freelist.free_count() + freelist.pending_count(), page_size);
    let range = writer.allocator.allocate(pages);
    pager.write(range.start, &writer.allocator.freelist.encode(range.start, pages, page_size))?;
    writer.freelist_pages = range.clone();
    pager.sync()?;

    let page_count = writer.allocator.page_count;
    let meta = Meta { page_size: page_size as u32, root, freelist: range.start, page_count, txid };
    if let Err(err) = pager.write_meta(&meta).and_then(|()| pager.sync()) {
      writer.poisoned = true;
      return Err(err);
    }
    Ok(meta)
  }

  /// Discards every change made by the transaction.
  pub fn rollback(mut self) {
    self.done = true;
    tracing::debug!(txid = self.txid(), "rolled back");
  }
}

impl<F: vfs::File> Transaction<F> for WriteTransaction<'_, F> {
  fn txid(&self) -> TxId {
    self.meta.txid + 1
  }

  fn pager(&self) -> &Pager<F> {
    &self.store.pager
  }

  fn catalog(&self) -> ChildRef<'_> {
    self.catalog.as_ref()
  }

  fn bucket(&self, bucket: &str) -> Result<(ChildRef<'_>, u64)> {
    if let Some(open) = self.buckets.get(bucket.as_bytes()) {
      return Ok((open.root.as_ref(), open.sequence));
    }
    let header = lookup_bucket(self.pager(), self.catalog(), bucket)?;
    Ok((ChildRef::Clean(header.root), header.sequence))
  }
}

impl<F: vfs::File> Drop for WriteTransaction<'_, F> {
  fn drop(&mut self) {
    if !self.done {
      tracing::debug!(txid = self.txid(), "rolled back on drop");
    }
  }
}
