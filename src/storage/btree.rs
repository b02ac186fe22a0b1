//! # Copy-on-write B+ tree
//!
//! Committed trees live in immutable pages. A write transaction never modifies those pages:
//! the first write below a page copies it into a dirty in-memory node (and records the page as
//! released), so every reader holding the old root keeps seeing the old tree. On commit the
//! dirty nodes are spilled bottom-up into freshly allocated pages, split wherever they exceed a
//! page.
//!
//! There is no eager merging. A node left empty by deletes simply disappears from its parent on
//! spill, and a root branch with a single child is replaced by that child.

use std::sync;

use super::freelist::Allocator;
use super::node::{Node, PageNode};
use super::paging::{Page, PageId, Pager};
use super::vfs;
use crate::error::{Error, Result};

/// A child pointer inside a write transaction's tree.
#[derive(Debug)]
pub enum Child {
  /// A committed page, or `0` for an empty tree.
  Clean(PageId),
  /// A node copied (or created) by this transaction.
  Dirty(Box<DirtyNode>),
}

pub type DirtyNode = Node<Child>;

impl Child {
  pub fn as_ref(&self) -> ChildRef<'_> {
    match self {
      Child::Clean(id) => ChildRef::Clean(*id),
      Child::Dirty(node) => ChildRef::Dirty(&**node),
    }
  }
}

/// A borrowed [`Child`], as used by lookups and cursors.
#[derive(Debug, Clone, Copy)]
pub enum ChildRef<'a> {
  Clean(PageId),
  Dirty(&'a DirtyNode),
}

/// One level of a cursor's path: either a cached page or a dirty node.
enum Frame<'a> {
  Page(sync::Arc<Page>),
  Dirty(&'a DirtyNode),
}

impl<'a> Frame<'a> {
  fn load<F: vfs::File>(pager: &Pager<F>, child: ChildRef<'a>) -> Result<Option<Self>> {
    match child {
      ChildRef::Clean(0) => Ok(None),
      ChildRef::Clean(id) => Ok(Some(Frame::Page(pager.page(id)?))),
      ChildRef::Dirty(node) => Ok(Some(Frame::Dirty(node))),
    }
  }

  fn len(&self) -> usize {
    match self {
      Frame::Page(page) => page.node.len(),
      Frame::Dirty(node) => node.len(),
    }
  }

  fn is_leaf(&self) -> bool {
    match self {
      Frame::Page(page) => page.node.is_leaf(),
      Frame::Dirty(node) => node.is_leaf(),
    }
  }

  fn search(&self, key: &[u8]) -> std::result::Result<usize, usize> {
    match self {
      Frame::Page(page) => page.node.search(key),
      Frame::Dirty(node) => node.search(key),
    }
  }

  fn child_index(&self, key: &[u8]) -> usize {
    match self {
      Frame::Page(page) => page.node.child_index(key),
      Frame::Dirty(node) => node.child_index(key),
    }
  }

  fn element(&self, index: usize) -> Option<(Vec<u8>, Vec<u8>)> {
    let (key, value) = match self {
      Frame::Page(page) => match &page.node {
        Node::Leaf(elements) => elements.get(index)?,
        Node::Branch(_) => return None,
      },
      Frame::Dirty(node) => match node {
        Node::Leaf(elements) => elements.get(index)?,
        Node::Branch(_) => return None,
      },
    };
    Some((key.clone(), value.clone()))
  }

  fn child(&self, index: usize) -> Result<ChildRef<'a>> {
    let child = match self {
      Frame::Page(page) => match &page.node {
        Node::Branch(elements) => elements.get(index).map(|(_, id)| ChildRef::Clean(*id)),
        Node::Leaf(_) => None,
      },
      Frame::Dirty(node) => {
        let node: &'a DirtyNode = *node;
        match node {
          Node::Branch(elements) => elements.get(index).map(|(_, child)| child.as_ref()),
          Node::Leaf(_) => None,
        }
      }
    };
    child.ok_or_else(|| Error::corruption(format!("branch has no child at index {index}")))
  }
}

/// Looks up `key` in the tree rooted at `root`.
pub fn get<F: vfs::File>(pager: &Pager<F>, root: ChildRef<'_>, key: &[u8]) -> Result<Option<Vec<u8>>> {
  let mut child = root;
  loop {
    let Some(frame) = Frame::load(pager, child)? else {
      return Ok(None);
    };
    if frame.is_leaf() {
      return Ok(frame.search(key).ok().and_then(|index| frame.element(index)).map(|(_, value)| value));
    }
    child = frame.child(frame.child_index(key))?;
  }
}

/// Copies a clean child into a dirty node (if it is not dirty already) and returns it. The pages
/// of the copied node are appended to `freed`.
fn materialize<'c, F: vfs::File>(pager: &Pager<F>, child: &'c mut Child, freed: &mut Vec<PageId>) -> Result<&'c mut DirtyNode> {
  if let Child::Clean(id) = *child {
    let node = if id == 0 {
      Node::empty_leaf()
    } else {
      let page = pager.page(id)?;
      freed.extend(page.ids());
      match &page.node {
        Node::Leaf(elements) => Node::Leaf(elements.clone()),
        Node::Branch(elements) => Node::Branch(elements.iter().map(|(key, id)| (key.clone(), Child::Clean(*id))).collect()),
      }
    };
    *child = Child::Dirty(Box::new(node));
  }
  match child {
    Child::Dirty(node) => Ok(&mut **node),
    Child::Clean(id) => Err(Error::corruption(format!("page {id} was not copied"))),
  }
}

/// Inserts or replaces `key`, returning the previous value.
pub fn put<F: vfs::File>(
  pager: &Pager<F>,
  root: &mut Child,
  key: &[u8],
  value: &[u8],
  freed: &mut Vec<PageId>,
) -> Result<Option<Vec<u8>>> {
  let mut node = materialize(pager, root, freed)?;
  loop {
    let index = node.child_index(key);
    match node {
      Node::Leaf(elements) => {
        return Ok(match elements.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
          Ok(index) => Some(std::mem::replace(&mut elements[index].1, value.to_vec())),
          Err(index) => {
            elements.insert(index, (key.to_vec(), value.to_vec()));
            None
          }
        });
      }
      Node::Branch(elements) => node = materialize(pager, &mut elements[index].1, freed)?,
    }
  }
}

/// Removes `key`, returning the removed value. Pages are only copied if the key exists.
pub fn delete<F: vfs::File>(
  pager: &Pager<F>,
  root: &mut Child,
  key: &[u8],
  freed: &mut Vec<PageId>,
) -> Result<Option<Vec<u8>>> {
  if get(pager, root.as_ref(), key)?.is_none() {
    return Ok(None);
  }
  let mut node = materialize(pager, root, freed)?;
  loop {
    let index = node.child_index(key);
    match node {
      Node::Leaf(elements) => {
        return Ok(match elements.binary_search_by(|(k, _)| k.as_slice().cmp(key)) {
          Ok(index) => Some(elements.remove(index).1),
          Err(_) => None,
        });
      }
      Node::Branch(elements) => node = materialize(pager, &mut elements[index].1, freed)?,
    }
  }
}

/// Appends every page of the tree to `freed`. Pages of dirty nodes were already released when
/// they were copied, so only their clean descendants are visited.
pub fn free_tree<F: vfs::File>(pager: &Pager<F>, root: &Child, freed: &mut Vec<PageId>) -> Result<()> {
  match root {
    Child::Clean(0) => Ok(()),
    Child::Clean(id) => free_page_tree(pager, *id, freed),
    Child::Dirty(node) => {
      if let Node::Branch(elements) = &**node {
        for (_, child) in elements {
          free_tree(pager, child, freed)?;
        }
      }
      Ok(())
    }
  }
}

fn free_page_tree<F: vfs::File>(pager: &Pager<F>, id: PageId, freed: &mut Vec<PageId>) -> Result<()> {
  let page = pager.page(id)?;
  freed.extend(page.ids());
  if let Node::Branch(elements) = &page.node {
    for (_, child) in elements {
      free_page_tree(pager, *child, freed)?;
    }
  }
  Ok(())
}

/// Drops empty dirty nodes from their parents.
fn prune(node: &mut DirtyNode) {
  if let Node::Branch(elements) = node {
    for (_, child) in elements.iter_mut() {
      if let Child::Dirty(child) = child {
        prune(child);
      }
    }
    elements.retain(|(_, child)| !matches!(child, Child::Dirty(node) if node.is_empty()));
  }
}

/// Replaces a dirty root branch that has a single child by that child, repeatedly.
fn collapse(mut root: Child) -> Child {
  while let Child::Dirty(node) = &mut root {
    let Node::Branch(elements) = &mut **node else {
      break;
    };
    if elements.len() != 1 {
      break;
    }
    let Some((_, child)) = elements.pop() else {
      break;
    };
    root = child;
  }
  root
}

/// Writes a dirty node and its dirty descendants, returning `(first key, page)` for every page
/// the node was split into.
fn spill_node<F: vfs::File>(pager: &Pager<F>, allocator: &mut Allocator, node: DirtyNode) -> Result<Vec<(Vec<u8>, PageId)>> {
  let node: PageNode = match node {
    Node::Leaf(elements) => Node::Leaf(elements),
    Node::Branch(elements) => {
      let mut children = Vec::with_capacity(elements.len());
      for (key, child) in elements {
        match child {
          Child::Clean(id) => children.push((key, id)),
          Child::Dirty(node) => children.extend(spill_node(pager, allocator, *node)?),
        }
      }
      Node::Branch(children)
    }
  };
  let page_size = pager.page_size();
  let mut written = Vec::new();
  if node.is_empty() {
    return Ok(written);
  }
  for run in node.split(page_size) {
    let range = allocator.allocate(run.pages(page_size));
    let bytes = run.encode(range.start, page_size);
    written.push((run.key(0).to_vec(), range.start));
    let overflow = (range.end - range.start - 1) as u32;
    pager.write_page(Page { id: range.start, overflow, node: run }, &bytes)?;
  }
  Ok(written)
}

/// Writes out the tree rooted at `root` and returns its new root page (`0` if it is empty).
pub fn spill<F: vfs::File>(pager: &Pager<F>, allocator: &mut Allocator, mut root: Child) -> Result<PageId> {
  if let Child::Dirty(node) = &mut root {
    prune(node);
  }
  let mut root = collapse(root);
  loop {
    let pieces = match root {
      Child::Clean(id) => return Ok(id),
      Child::Dirty(node) => spill_node(pager, allocator, *node)?,
    };
    match pieces.len() {
      0 => return Ok(0),
      1 => return Ok(pieces[0].1),
      _ => {
        let elements = pieces.into_iter().map(|(key, id)| (key, Child::Clean(id))).collect();
        root = Child::Dirty(Box::new(Node::Branch(elements)));
      }
    }
  }
}

/// # Tree cursor
///
/// A cursor walks the leaves of one tree snapshot in byte-lexicographic key order. It holds the
/// path from the root to the current leaf; positioning methods ([`Cursor::first`],
/// [`Cursor::last`], [`Cursor::seek`]) rebuild the path and the stepping methods move along it.
/// Once a step runs off either end the cursor is unpositioned and must be repositioned.
pub struct Cursor<'a, F: vfs::File> {
  pager: &'a Pager<F>,
  root: ChildRef<'a>,
  stack: Vec<(Frame<'a>, usize)>,
}

type Item = Option<(Vec<u8>, Vec<u8>)>;

impl<'a, F: vfs::File> Cursor<'a, F> {
  pub fn new(pager: &'a Pager<F>, root: ChildRef<'a>) -> Self {
    Self { pager, root, stack: Vec::new() }
  }

  /// Moves to the smallest key.
  pub fn first(&mut self) -> Result<Item> {
    self.stack.clear();
    self.push_edge(self.root, false)?;
    self.settle_forward()
  }

  /// Moves to the greatest key.
  pub fn last(&mut self) -> Result<Item> {
    self.stack.clear();
    self.push_edge(self.root, true)?;
    self.settle_backward()
  }

  /// Moves to the smallest key not less than `key`.
  pub fn seek(&mut self, key: &[u8]) -> Result<Item> {
    self.stack.clear();
    let mut child = self.root;
    loop {
      let Some(frame) = Frame::load(self.pager, child)? else {
        return Ok(None);
      };
      if frame.is_leaf() {
        let index = frame.search(key).unwrap_or_else(|index| index);
        self.stack.push((frame, index));
        return self.settle_forward();
      }
      let index = frame.child_index(key);
      child = frame.child(index)?;
      self.stack.push((frame, index));
    }
  }

  /// Moves to the next key.
  pub fn next(&mut self) -> Result<Item> {
    match self.stack.last_mut() {
      Some((_, index)) => *index += 1,
      None => return Ok(None),
    }
    self.settle_forward()
  }

  /// Moves to the previous key.
  pub fn prev(&mut self) -> Result<Item> {
    loop {
      match self.stack.last_mut() {
        None => return Ok(None),
        Some((_, index)) if *index > 0 => {
          *index -= 1;
          break;
        }
        Some(_) => {
          self.stack.pop();
        }
      }
    }
    self.settle_backward()
  }

  /// Descends from `child` along the leftmost (or rightmost) edge.
  fn push_edge(&mut self, mut child: ChildRef<'a>, last: bool) -> Result<()> {
    loop {
      let Some(frame) = Frame::load(self.pager, child)? else {
        return Ok(());
      };
      let len = frame.len();
      let index = if last { len.saturating_sub(1) } else { 0 };
      if frame.is_leaf() || len == 0 {
        self.stack.push((frame, index));
        return Ok(());
      }
      child = frame.child(index)?;
      self.stack.push((frame, index));
    }
  }

  /// Returns the element under the cursor, moving forward past exhausted nodes.
  fn settle_forward(&mut self) -> Result<Item> {
    loop {
      let Some((frame, index)) = self.stack.last() else {
        return Ok(None);
      };
      let index = *index;
      if index < frame.len() {
        if frame.is_leaf() {
          return Ok(frame.element(index));
        }
        let child = frame.child(index)?;
        self.push_edge(child, false)?;
        continue;
      }
      self.stack.pop();
      if let Some((_, index)) = self.stack.last_mut() {
        *index += 1;
      }
    }
  }

  /// Returns the element under the cursor, moving backward past empty nodes.
  fn settle_backward(&mut self) -> Result<Item> {
    loop {
      let Some((frame, index)) = self.stack.last() else {
        return Ok(None);
      };
      let index = *index;
      if frame.len() == 0 {
        self.stack.pop();
        return self.prev();
      }
      if frame.is_leaf() {
        return Ok(frame.element(index));
      }
      let child = frame.child(index)?;
      self.push_edge(child, true)?;
    }
  }
}

/// # Tree iterator
///
/// A lazy, finite iterator over `(key, value)` pairs in ascending key order, optionally starting
/// at a lower bound. It stops after the first error.
pub struct Iter<'a, F: vfs::File> {
  cursor: Cursor<'a, F>,
  start: Option<Vec<u8>>,
  started: bool,
  done: bool,
}

impl<'a, F: vfs::File> Iter<'a, F> {
  pub fn new(cursor: Cursor<'a, F>, start: Option<Vec<u8>>) -> Self {
    Self { cursor, start, started: false, done: false }
  }
}

impl<F: vfs::File> Iterator for Iter<'_, F> {
  type Item = Result<(Vec<u8>, Vec<u8>)>;

  fn next(&mut self) -> Option<Self::Item> {
    if self.done {
      return None;
    }
    let item = if self.started {
      self.cursor.next()
    } else {
      self.started = true;
      match self.start.take() {
        Some(start) => self.cursor.seek(&start),
        None => self.cursor.first(),
      }
    };
    match item {
      Ok(Some(element)) => Some(Ok(element)),
      Ok(None) => {
        self.done = true;
        None
      }
      Err(err) => {
        self.done = true;
        Some(Err(err))
      }
    }
  }
}
