//! # B-tree nodes
//!
//! A node is either a leaf, holding sorted `(key, value)` elements, or a branch, holding sorted
//! `(key, child)` elements where `key` is the smallest key reachable through `child`. The child
//! type is generic so the same shape serves decoded pages (`C = PageId`) and the dirty nodes a
//! write transaction builds up before commit.
//!
//! ## Page body encoding
//!
//! After the [`PageHeader`], leaf elements are stored as `varint(key_len) varint(value_len) key
//! value` and branch elements as `varint(key_len) varint(child) key`, using the prefix-varint
//! format.

use super::paging::{PageHeader, PageId, PageKind};
use crate::encoding::prefix_varint;
use crate::error::{Error, Result};

/// Fewest elements a node may be split down to. Guarantees every split strictly shrinks the
/// number of nodes one level up, even when single elements are larger than a page.
pub const MIN_ELEMENTS_PER_PAGE: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node<C> {
  Leaf(Vec<(Vec<u8>, Vec<u8>)>),
  Branch(Vec<(Vec<u8>, C)>),
}

/// A node as stored in a page.
pub type PageNode = Node<PageId>;

impl<C> Node<C> {
  pub fn empty_leaf() -> Self {
    Node::Leaf(Vec::new())
  }

  pub fn len(&self) -> usize {
    match self {
      Node::Leaf(elements) => elements.len(),
      Node::Branch(elements) => elements.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_leaf(&self) -> bool {
    matches!(self, Node::Leaf(_))
  }

  pub fn key(&self, index: usize) -> &[u8] {
    match self {
      Node::Leaf(elements) => &elements[index].0,
      Node::Branch(elements) => &elements[index].0,
    }
  }

  /// Binary search over the node's keys.
  pub fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
    match self {
      Node::Leaf(elements) => elements.binary_search_by(|(k, _)| k.as_slice().cmp(key)),
      Node::Branch(elements) => elements.binary_search_by(|(k, _)| k.as_slice().cmp(key)),
    }
  }

  /// Index of the branch element whose subtree may contain `key`: the last element whose key is
  /// not greater than `key`, or the first element if `key` sorts before all of them.
  pub fn child_index(&self, key: &[u8]) -> usize {
    match self.search(key) {
      Ok(index) => index,
      Err(index) => index.saturating_sub(1),
    }
  }
}

fn leaf_element_size(key: &[u8], value: &[u8]) -> usize {
  prefix_varint::encoded_len(key.len() as u64) + prefix_varint::encoded_len(value.len() as u64) + key.len() + value.len()
}

fn branch_element_size(key: &[u8], child: PageId) -> usize {
  prefix_varint::encoded_len(key.len() as u64) + prefix_varint::encoded_len(child) + key.len()
}

impl PageNode {
  fn element_size(&self, index: usize) -> usize {
    match self {
      Node::Leaf(elements) => leaf_element_size(&elements[index].0, &elements[index].1),
      Node::Branch(elements) => branch_element_size(&elements[index].0, elements[index].1),
    }
  }

  /// Size of the encoded node in bytes, header included.
  pub fn encoded_size(&self) -> usize {
    PageHeader::SIZE + (0..self.len()).map(|index| self.element_size(index)).sum::<usize>()
  }

  /// Number of pages the encoded node occupies.
  pub fn pages(&self, page_size: usize) -> usize {
    self.encoded_size().div_ceil(page_size)
  }

  /// Splits the node into runs that each fit one page, unless that would leave a run with fewer
  /// than [`MIN_ELEMENTS_PER_PAGE`] elements. Such runs spill into overflow pages instead.
  pub fn split(self, page_size: usize) -> Vec<PageNode> {
    let len = self.len();
    let mut boundaries = Vec::new();
    let mut start = 0;
    let mut size = PageHeader::SIZE;
    for index in 0..len {
      let element = self.element_size(index);
      let count = index - start;
      if count >= MIN_ELEMENTS_PER_PAGE && size + element > page_size && len - index >= MIN_ELEMENTS_PER_PAGE {
        boundaries.push(index);
        start = index;
        size = PageHeader::SIZE;
      }
      size += element;
    }
    if boundaries.is_empty() {
      return vec![self];
    }
    match self {
      Node::Leaf(elements) => split_at(elements, &boundaries).into_iter().map(Node::Leaf).collect(),
      Node::Branch(elements) => split_at(elements, &boundaries).into_iter().map(Node::Branch).collect(),
    }
  }

  /// Encodes the node as page `id`, padded to a whole number of pages.
  pub fn encode(&self, id: PageId, page_size: usize) -> Vec<u8> {
    let pages = self.pages(page_size);
    let header = PageHeader {
      kind: if self.is_leaf() { PageKind::Leaf } else { PageKind::Branch },
      count: self.len() as u16,
      overflow: (pages - 1) as u32,
      id,
    };
    let mut buf = Vec::with_capacity(pages * page_size);
    buf.extend_from_slice(&header.to_bytes());
    match self {
      Node::Leaf(elements) => {
        for (key, value) in elements {
          prefix_varint::encode(key.len() as u64, &mut buf);
          prefix_varint::encode(value.len() as u64, &mut buf);
          buf.extend_from_slice(key);
          buf.extend_from_slice(value);
        }
      }
      Node::Branch(elements) => {
        for (key, child) in elements {
          prefix_varint::encode(key.len() as u64, &mut buf);
          prefix_varint::encode(*child, &mut buf);
          buf.extend_from_slice(key);
        }
      }
    }
    buf.resize(pages * page_size, 0);
    buf
  }

  /// Decodes a branch or leaf page, returning the node and its overflow count.
  pub fn decode(buf: &[u8]) -> Result<(PageNode, u32)> {
    let header = PageHeader::from_bytes(buf)?;
    let mut input = &buf[PageHeader::SIZE..];
    let truncated = || Error::corruption(format!("truncated node in page {}", header.id));
    let node = match header.kind {
      PageKind::Leaf => {
        let mut elements = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
          let key_len = prefix_varint::take(&mut input).ok_or_else(truncated)? as usize;
          let value_len = prefix_varint::take(&mut input).ok_or_else(truncated)? as usize;
          let key = take_bytes(&mut input, key_len).ok_or_else(truncated)?;
          let value = take_bytes(&mut input, value_len).ok_or_else(truncated)?;
          elements.push((key, value));
        }
        Node::Leaf(elements)
      }
      PageKind::Branch => {
        let mut elements = Vec::with_capacity(header.count as usize);
        for _ in 0..header.count {
          let key_len = prefix_varint::take(&mut input).ok_or_else(truncated)? as usize;
          let child = prefix_varint::take(&mut input).ok_or_else(truncated)?;
          let key = take_bytes(&mut input, key_len).ok_or_else(truncated)?;
          elements.push((key, child));
        }
        Node::Branch(elements)
      }
      kind => return Err(Error::corruption(format!("expected a tree page at {}, found {kind:?}", header.id))),
    };
    Ok((node, header.overflow))
  }
}

fn take_bytes(input: &mut &[u8], len: usize) -> Option<Vec<u8>> {
  if input.len() < len {
    return None;
  }
  let (head, tail) = input.split_at(len);
  *input = tail;
  Some(head.to_vec())
}

fn split_at<T>(mut elements: Vec<T>, boundaries: &[usize]) -> Vec<Vec<T>> {
  let mut runs = Vec::with_capacity(boundaries.len() + 1);
  for &boundary in boundaries.iter().rev() {
    runs.push(elements.split_off(boundary));
  }
  runs.push(elements);
  runs.reverse();
  runs
}
