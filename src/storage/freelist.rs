//! # Free page tracking
//!
//! Pages released by a commit cannot be reused right away: read transactions that started before
//! that commit may still walk them. They wait in a pending list keyed by the releasing
//! transaction until every such reader has finished.

use std::collections;

use super::paging::{PageHeader, PageId, PageKind, PageRange, TxId};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Freelist {
  free: collections::BTreeSet<PageId>,
  pending: collections::BTreeMap<TxId, Vec<PageId>>,
}

impl Freelist {
  /// Number of pages ready for reuse.
  pub fn free_count(&self) -> usize {
    self.free.len()
  }

  /// Number of pages waiting for older readers to finish.
  pub fn pending_count(&self) -> usize {
    self.pending.values().map(Vec::len).sum()
  }

  /// Records pages released by the commit of `txid`.
  pub fn free(&mut self, txid: TxId, ids: impl IntoIterator<Item = PageId>) {
    self.pending.entry(txid).or_default().extend(ids);
  }

  /// Moves pending pages to the free set once no reader can reach them. `oldest_reader` is the
  /// snapshot txid of the oldest live read transaction, if any.
  pub fn release(&mut self, oldest_reader: Option<TxId>) {
    let still_pending = match oldest_reader {
      Some(oldest) => self.pending.split_off(&(oldest + 1)),
      None => collections::BTreeMap::new(),
    };
    for (_, ids) in std::mem::replace(&mut self.pending, still_pending) {
      self.free.extend(ids);
    }
  }

  /// Takes the lowest run of `n` consecutive free pages, if there is one. This walks the free set
  /// in ascending order, so it costs time linear in the number of free pages.
  pub fn allocate(&mut self, n: usize) -> Option<PageId> {
    let n = n as u64;
    let mut run_start = None;
    let mut previous = None;
    let mut found = None;
    for &id in &self.free {
      let start = match (run_start, previous) {
        (Some(start), Some(prev)) if prev + 1 == id => start,
        _ => id,
      };
      run_start = Some(start);
      previous = Some(id);
      if id - start + 1 == n {
        found = Some(start);
        break;
      }
    }
    let start = found?;
    for id in start..start + n {
      self.free.remove(&id);
    }
    Some(start)
  }

  /// Every page id that is free or pending, in ascending order.
  pub fn ids(&self) -> Vec<PageId> {
    let mut ids: Vec<PageId> = self.free.iter().copied().chain(self.pending.values().flatten().copied()).collect();
    ids.sort_unstable();
    ids
  }

  /// Number of pages needed to persist `count` ids.
  pub fn pages_for(count: usize, page_size: usize) -> usize {
    (PageHeader::SIZE + 8 + 8 * count).div_ceil(page_size)
  }

  /// Encodes the free-list into a run of `pages` pages starting at `id`. Pending pages are written
  /// as free: after a reopen there is no reader left that could still see them.
  pub fn encode(&self, id: PageId, pages: usize, page_size: usize) -> Vec<u8> {
    let ids = self.ids();
    debug_assert!(Self::pages_for(ids.len(), page_size) <= pages);
    let header = PageHeader { kind: PageKind::Freelist, count: 0, overflow: (pages - 1) as u32, id };
    let mut buf = Vec::with_capacity(pages * page_size);
    buf.extend_from_slice(&header.to_bytes());
    buf.extend_from_slice(&(ids.len() as u64).to_le_bytes());
    for id in ids {
      buf.extend_from_slice(&id.to_le_bytes());
    }
    buf.resize(pages * page_size, 0);
    buf
  }

  /// Decodes a persisted free-list, returning it and the pages it occupies.
  pub fn decode(buf: &[u8]) -> Result<(Self, PageRange)> {
    let header = PageHeader::from_bytes(buf)?;
    if header.kind != PageKind::Freelist {
      return Err(Error::corruption(format!("page {} is not a free-list page", header.id)));
    }
    let body = &buf[PageHeader::SIZE..];
    let count = body.get(..8).map(|b| u64::from_le_bytes(b.try_into().unwrap_or_default()));
    let count = count.ok_or_else(|| Error::corruption("truncated free-list"))? as usize;
    let end = count.checked_mul(8).and_then(|len| len.checked_add(8));
    let ids = end.and_then(|end| body.get(8..end)).ok_or_else(|| Error::corruption("truncated free-list"))?;
    let free = ids.chunks_exact(8).map(|chunk| u64::from_le_bytes(chunk.try_into().unwrap_or_default())).collect();
    let freelist = Self { free, pending: collections::BTreeMap::new() };
    Ok((freelist, header.id..header.id + 1 + header.overflow as u64))
  }
}

/// # Page allocator
///
/// Hands out page runs to the write transaction, preferring free pages and growing the file
/// otherwise. Only ever touched while holding the writer lock.
#[derive(Debug, Clone)]
pub struct Allocator {
  pub freelist: Freelist,
  /// First page id past the end of the file.
  pub page_count: u64,
}

impl Allocator {
  /// Allocates a run of `n` contiguous pages.
  pub fn allocate(&mut self, n: usize) -> PageRange {
    if let Some(start) = self.freelist.allocate(n) {
      return start..start + n as u64;
    }
    let start = self.page_count;
    self.page_count += n as u64;
    tracing::trace!(start, n, "growing file");
    start..self.page_count
  }

  /// Hands pages released by the commit of `txid` to the free-list.
  pub fn free_pages(&mut self, txid: TxId, ids: impl IntoIterator<Item = PageId>) {
    self.freelist.free(txid, ids);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn freelist(ids: &[PageId]) -> Freelist {
    let mut freelist = Freelist::default();
    freelist.free(1, ids.iter().copied());
    freelist.release(None);
    freelist
  }

  #[test]
  fn test_allocate_prefers_lowest_run() {
    let mut freelist = freelist(&[3, 5, 6, 7, 9, 10]);
    assert_eq!(freelist.allocate(2), Some(5));
    assert_eq!(freelist.allocate(2), Some(9));
    assert_eq!(freelist.allocate(2), None);
    assert_eq!(freelist.allocate(1), Some(3));
    assert_eq!(freelist.allocate(1), Some(7));
    assert_eq!(freelist.free_count(), 0);
  }

  #[test]
  fn test_pending_waits_for_readers() {
    let mut freelist = Freelist::default();
    freelist.free(4, [10, 11]);
    freelist.free(6, [12]);
    assert_eq!(freelist.pending_count(), 3);

    // A reader pinned at txid 3 can still see pages released by commit 4.
    freelist.release(Some(3));
    assert_eq!(freelist.free_count(), 0);

    freelist.release(Some(5));
    assert_eq!(freelist.free_count(), 2);
    assert_eq!(freelist.pending_count(), 1);

    freelist.release(None);
    assert_eq!(freelist.free_count(), 3);
    assert_eq!(freelist.pending_count(), 0);
  }

  #[test]
  fn test_encode_decode_includes_pending() {
    let mut freelist = freelist(&[8, 3]);
    freelist.free(9, [20, 5]);
    let pages = Freelist::pages_for(4, 64);
    let bytes = freelist.encode(30, pages, 64);
    assert_eq!(bytes.len(), pages * 64);

    let (decoded, range) = Freelist::decode(&bytes).unwrap();
    assert_eq!(range, 30..30 + pages as u64);
    assert_eq!(decoded.ids(), vec![3, 5, 8, 20]);
    assert_eq!(decoded.pending_count(), 0);
  }

  #[test]
  fn test_allocator_grows_when_free_list_has_no_run() {
    let mut allocator = Allocator { freelist: freelist(&[2, 4]), page_count: 6 };
    assert_eq!(allocator.allocate(2), 6..8);
    assert_eq!(allocator.allocate(1), 2..3);
    assert_eq!(allocator.page_count, 8);
  }
}
