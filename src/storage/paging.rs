//! # Page/file manager
//!
//! This module owns the single backing file: it maps the file into fixed-size pages, reads and
//! writes them, keeps the double-buffered meta pages, and makes commits durable.

#![doc = include_str!("../../doc/file_format.md")]

use std::num::NonZeroUsize;
use std::ops;
use std::sync;

use lru::LruCache;
use parking_lot::Mutex;

use super::node::PageNode;
use super::vfs;
use crate::error::{Error, Result};

/// Index of a page in the backing file. Page 0 and 1 are the meta slots, so `0` doubles as "no
/// page".
pub type PageId = u64;

/// A contiguous run of pages returned by the allocator.
pub type PageRange = ops::Range<PageId>;

/// Transaction counter stored in the meta page. Commit `t` writes meta slot `t % 2`.
pub type TxId = u64;

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest page size accepted for new stores.
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest page size accepted for new stores.
pub const MAX_PAGE_SIZE: usize = 65536;

const MAGIC: u32 = 0x726a_6462;
const VERSION: u32 = 1;

/// Kinds of pages in the backing file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageKind {
  Meta = 1,
  Freelist = 2,
  Branch = 3,
  Leaf = 4,
}

impl TryFrom<u8> for PageKind {
  type Error = Error;

  fn try_from(value: u8) -> Result<Self> {
    match value {
      1 => Ok(PageKind::Meta),
      2 => Ok(PageKind::Freelist),
      3 => Ok(PageKind::Branch),
      4 => Ok(PageKind::Leaf),
      other => Err(Error::corruption(format!("unknown page kind {other}"))),
    }
  }
}

/// # Page header
///
/// Layout (16 bytes):
/// - kind: 1 byte
/// - flags: 1 byte (reserved, zero)
/// - count: 2 bytes (number of elements in branch and leaf pages)
/// - overflow: 4 bytes (number of pages following this one that belong to it)
/// - id: 8 bytes (the page's own id, checked on read)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
  pub kind: PageKind,
  pub count: u16,
  pub overflow: u32,
  pub id: PageId,
}

impl PageHeader {
  pub const SIZE: usize = 16;

  pub fn to_bytes(&self) -> [u8; Self::SIZE] {
    let mut buf = [0u8; Self::SIZE];
    buf[0] = self.kind as u8;
    buf[2..4].copy_from_slice(&self.count.to_le_bytes());
    buf[4..8].copy_from_slice(&self.overflow.to_le_bytes());
    buf[8..16].copy_from_slice(&self.id.to_le_bytes());
    buf
  }

  pub fn from_bytes(buf: &[u8]) -> Result<Self> {
    if buf.len() < Self::SIZE {
      return Err(Error::corruption("truncated page header"));
    }
    Ok(Self {
      kind: PageKind::try_from(buf[0])?,
      count: u16::from_le_bytes([buf[2], buf[3]]),
      overflow: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
      id: read_u64(&buf[8..16]),
    })
  }
}

fn read_u32(buf: &[u8]) -> u32 {
  let mut array = [0u8; 4];
  array.copy_from_slice(&buf[..4]);
  u32::from_le_bytes(array)
}

fn read_u64(buf: &[u8]) -> u64 {
  let mut array = [0u8; 8];
  array.copy_from_slice(&buf[..8]);
  u64::from_le_bytes(array)
}

/// # Meta page
///
/// The root pointer record. Exactly one of the two meta slots is current: the valid one with the
/// higher `txid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Meta {
  pub page_size: u32,
  /// Root page of the bucket catalog, or `0` if no bucket exists.
  pub root: PageId,
  /// First page of the persisted free-list, or `0` if it is empty.
  pub freelist: PageId,
  /// Number of pages in the file (the allocation high-water mark).
  pub page_count: u64,
  pub txid: TxId,
}

impl Meta {
  /// Size of the encoded meta body, following the page header.
  pub const SIZE: usize = 56;

  /// Returns the meta slot this meta is written to.
  pub fn slot(&self) -> PageId {
    self.txid % 2
  }

  pub fn to_bytes(&self) -> [u8; PageHeader::SIZE + Self::SIZE] {
    let mut buf = [0u8; PageHeader::SIZE + Self::SIZE];
    let header = PageHeader { kind: PageKind::Meta, count: 0, overflow: 0, id: self.slot() };
    buf[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
    let body = &mut buf[PageHeader::SIZE..];
    body[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    body[4..8].copy_from_slice(&VERSION.to_le_bytes());
    body[8..12].copy_from_slice(&self.page_size.to_le_bytes());
    body[16..24].copy_from_slice(&self.root.to_le_bytes());
    body[24..32].copy_from_slice(&self.freelist.to_le_bytes());
    body[32..40].copy_from_slice(&self.page_count.to_le_bytes());
    body[40..48].copy_from_slice(&self.txid.to_le_bytes());
    let checksum = crc32fast::hash(&body[..48]) as u64;
    body[48..56].copy_from_slice(&checksum.to_le_bytes());
    buf
  }

  /// Decodes and validates a meta page. Any mismatch (magic, version, checksum) is reported as
  /// [`Error::Corruption`].
  pub fn from_bytes(buf: &[u8]) -> Result<Self> {
    let header = PageHeader::from_bytes(buf)?;
    if header.kind != PageKind::Meta {
      return Err(Error::corruption("meta slot does not hold a meta page"));
    }
    let body = buf.get(PageHeader::SIZE..PageHeader::SIZE + Self::SIZE).ok_or_else(|| Error::corruption("truncated meta page"))?;
    if read_u32(&body[0..4]) != MAGIC {
      return Err(Error::corruption("invalid magic"));
    }
    if read_u32(&body[4..8]) != VERSION {
      return Err(Error::corruption(format!("unsupported format version {}", read_u32(&body[4..8]))));
    }
    if read_u64(&body[48..56]) != crc32fast::hash(&body[..48]) as u64 {
      return Err(Error::corruption("meta checksum mismatch"));
    }
    let meta = Self {
      page_size: read_u32(&body[8..12]),
      root: read_u64(&body[16..24]),
      freelist: read_u64(&body[24..32]),
      page_count: read_u64(&body[32..40]),
      txid: read_u64(&body[40..48]),
    };
    if header.id != meta.slot() {
      return Err(Error::corruption("meta page stored in the wrong slot"));
    }
    Ok(meta)
  }
}

/// A decoded page held by the page cache. Pages are immutable once written; a page id only gets
/// a new [`Page`] after the old one became unreachable from every live transaction.
#[derive(Debug)]
pub struct Page {
  pub id: PageId,
  pub overflow: u32,
  pub node: PageNode,
}

impl Page {
  /// Returns every page id occupied by this page, overflow included.
  pub fn ids(&self) -> PageRange {
    self.id..self.id + 1 + self.overflow as u64
  }
}

/// # Paged file
///
/// Wraps a [`vfs::File`] and exposes it as an array of fixed-size pages, with an arena of decoded
/// immutable pages indexed by page id. The least recently used pages are evicted first.
pub struct Pager<F: vfs::File> {
  file: Mutex<F>,
  page_size: usize,
  no_sync: bool,
  cache: Mutex<LruCache<PageId, sync::Arc<Page>>>,
}

impl<F: vfs::File> Pager<F> {
  pub fn new(file: F, page_size: usize, no_sync: bool, cache_capacity: usize) -> Self {
    let capacity = NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN);
    Self { file: Mutex::new(file), page_size, no_sync, cache: Mutex::new(LruCache::new(capacity)) }
  }

  pub fn page_size(&self) -> usize {
    self.page_size
  }

  /// Runs `f` with exclusive access to the underlying file.
  pub fn with_file<T>(&self, f: impl FnOnce(&mut F) -> T) -> T {
    f(&mut self.file.lock())
  }

  fn offset(&self, id: PageId) -> u64 {
    id * self.page_size as u64
  }

  /// Reads a page and its overflow run.
  pub fn read(&self, id: PageId) -> Result<Vec<u8>> {
    let mut file = self.file.lock();
    let mut buf = vec![0u8; self.page_size];
    file.read(self.offset(id), &mut buf)?;
    let header = PageHeader::from_bytes(&buf)?;
    if header.id != id {
      return Err(Error::corruption(format!("page {id} claims to be page {}", header.id)));
    }
    if header.overflow > 0 {
      buf.resize(self.page_size * (1 + header.overflow as usize), 0);
      file.read(self.offset(id) + self.page_size as u64, &mut buf[self.page_size..])?;
    }
    Ok(buf)
  }

  /// Writes `bytes` at page `id`. The buffer must span a whole number of pages.
  pub fn write(&self, id: PageId, bytes: &[u8]) -> Result<()> {
    debug_assert_eq!(bytes.len() % self.page_size, 0);
    self.file.lock().write(self.offset(id), bytes)?;
    Ok(())
  }

  /// Makes every previous write durable. This is the commit durability boundary.
  pub fn sync(&self) -> Result<()> {
    if !self.no_sync {
      self.file.lock().sync()?;
    }
    Ok(())
  }

  /// Returns the decoded branch or leaf page `id`, reading it through the cache.
  pub fn page(&self, id: PageId) -> Result<sync::Arc<Page>> {
    if let Some(page) = self.cache.lock().get(&id) {
      return Ok(page.clone());
    }
    let bytes = self.read(id)?;
    let (node, overflow) = PageNode::decode(&bytes)?;
    let page = sync::Arc::new(Page { id, overflow, node });
    self.remember(page.clone());
    Ok(page)
  }

  /// Writes an encoded node and replaces whatever the cache held for its id.
  pub fn write_page(&self, page: Page, bytes: &[u8]) -> Result<()> {
    self.write(page.id, bytes)?;
    self.remember(sync::Arc::new(page));
    Ok(())
  }

  fn remember(&self, page: sync::Arc<Page>) {
    self.cache.lock().put(page.id, page);
  }

  /// Returns whether page `id` is currently cached, without touching its recency.
  #[cfg(test)]
  fn is_cached(&self, id: PageId) -> bool {
    self.cache.lock().peek(&id).is_some()
  }

  /// Reads the meta slot `slot`, returning `None` if it does not hold a valid meta.
  pub fn read_meta(&self, slot: PageId) -> Option<Meta> {
    let mut buf = [0u8; PageHeader::SIZE + Meta::SIZE];
    if let Err(err) = self.file.lock().read(self.offset(slot), &mut buf) {
      tracing::warn!(slot, %err, "meta slot unreadable");
      return None;
    }
    match Meta::from_bytes(&buf) {
      Ok(meta) => Some(meta),
      Err(err) => {
        tracing::warn!(slot, %err, "meta slot invalid");
        None
      }
    }
  }

  /// Writes `meta` into its slot. Callers sync before and after.
  pub fn write_meta(&self, meta: &Meta) -> Result<()> {
    self.file.lock().write(self.offset(meta.slot()), &meta.to_bytes())?;
    Ok(())
  }
}
