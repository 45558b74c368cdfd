//! Registry of sampled spans.
//!
//! A doubly linked list whose nodes live in a mmap'd arena and link to each
//! other by `u32` slot index. The arena doubles when it runs out of slots,
//! so inserting never fails. Spans hold a [`SampledNode`] handle instead of
//! list pointers, so removal is O(1) and a removed span leaves nothing
//! dangling behind. The registry does no locking: callers share it
//! behind whatever lock serialises span sampling.

use core::{mem::size_of, ptr::copy_nonoverlapping};

use crate::{
  PAGE_SIZE, align_up,
  pages::PageId,
  platform::{os_mmap, os_munmap},
};

const NIL: u32 = u32::MAX;
const MAX_CAPACITY: u32 = NIL - 1;

/// Mapping size for at least `capacity` nodes, and the node count it really holds.
fn arena_for(capacity: u32) -> (usize, u32) {
  let mapped = align_up(capacity as usize * size_of::<Node>(), PAGE_SIZE);
  (mapped, (mapped / size_of::<Node>()).min(MAX_CAPACITY as usize) as u32)
}

#[repr(C)]
#[derive(Clone, Copy)]
struct Node {
  /// Sampled span, identified by its first page.
  page: PageId,
  prev: u32,
  /// Next live node, or next recycled slot while on the free chain.
  next: u32,
}

/// A span's membership in [`SampledSpans`]. Not `Clone`: exactly one owner.
#[derive(Debug, PartialEq, Eq)]
pub struct SampledNode(u32);

pub struct SampledSpans {
  nodes: *mut Node,
  mapped: usize,
  capacity: u32,
  /// Slots below this have been handed out at least once.
  high_water: u32,
  /// Recycled slots, chained through `Node::next`.
  free: u32,
  head: u32,
  len: usize,
}

unsafe impl Send for SampledSpans {}

impl SampledSpans {
  /// Registry with room for at least `capacity` spans before it first grows.
  /// The node arena is an anonymous mapping that only gets touched as slots
  /// are first used.
  pub fn new(capacity: usize) -> Option<Self> {
    let (mapped, capacity) = arena_for(capacity.clamp(1, MAX_CAPACITY as usize) as u32);
    let nodes = unsafe { os_mmap(mapped) } as *mut Node;
    if nodes.is_null() {
      log::warn!("SampledSpans::new({capacity}): mmap of {mapped} bytes failed");
      return None;
    }
    log::debug!("SampledSpans::new({capacity})");
    Some(Self {
      nodes,
      mapped,
      capacity,
      high_water: 0,
      free: NIL,
      head: NIL,
      len: 0,
    })
  }

  #[inline]
  fn node(&self, idx: u32) -> &Node {
    debug_assert!(idx < self.high_water, "node {idx} never allocated");
    unsafe { &*self.nodes.add(idx as usize) }
  }

  #[inline]
  fn node_mut(&mut self, idx: u32) -> &mut Node {
    debug_assert!(idx < self.high_water, "node {idx} never allocated");
    unsafe { &mut *self.nodes.add(idx as usize) }
  }

  /// Moves the arena to a mapping twice the size. Slot indices are kept, so
  /// outstanding [`SampledNode`]s stay valid.
  #[cold]
  fn grow(&mut self) {
    let capacity = self.capacity.saturating_mul(2).min(MAX_CAPACITY);
    if capacity == self.capacity {
      log::error!("SampledSpans::grow: {} slots is the limit", self.capacity);
      std::process::abort();
    }
    let (mapped, capacity) = arena_for(capacity);
    let nodes = unsafe { os_mmap(mapped) } as *mut Node;
    if nodes.is_null() {
      log::error!("SampledSpans::grow({capacity}): mmap of {mapped} bytes failed");
      std::process::abort();
    }
    unsafe {
      copy_nonoverlapping(self.nodes, nodes, self.high_water as usize);
      os_munmap(self.nodes.cast(), self.mapped);
    }
    log::debug!("SampledSpans::grow: {} -> {capacity} slots", self.capacity);
    self.nodes = nodes;
    self.mapped = mapped;
    self.capacity = capacity;
  }

  /// Inserts `page` at the head, growing the arena when every slot is taken.
  pub fn prepend(&mut self, page: PageId) -> SampledNode {
    let idx = if self.free != NIL {
      let idx = self.free;
      self.free = self.node(idx).next;
      idx
    } else {
      if self.high_water == self.capacity {
        self.grow();
      }
      self.high_water += 1;
      self.high_water - 1
    };

    let old_head = self.head;
    *self.node_mut(idx) = Node {
      page,
      prev: NIL,
      next: old_head,
    };
    if old_head != NIL {
      self.node_mut(old_head).prev = idx;
    }
    self.head = idx;
    self.len += 1;
    SampledNode(idx)
  }

  /// Unlinks `node` and recycles its slot.
  pub fn remove(&mut self, node: SampledNode) {
    let idx = node.0;
    let Node { prev, next, .. } = *self.node(idx);

    if prev != NIL {
      self.node_mut(prev).next = next;
    } else {
      debug_assert_eq!(self.head, idx, "remove: node {idx} has no prev but is not head");
      self.head = next;
    }
    if next != NIL {
      self.node_mut(next).prev = prev;
    }

    let free = self.free;
    let n = self.node_mut(idx);
    n.prev = NIL;
    n.next = free;
    self.free = idx;
    self.len -= 1;
  }

  /// First page of the span registered under `node`.
  #[inline]
  pub fn page(&self, node: &SampledNode) -> PageId {
    self.node(node.0).page
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.len == 0
  }

  /// Slots available before the next growth.
  #[inline]
  pub fn capacity(&self) -> usize {
    self.capacity as usize
  }

  /// Sampled spans, most recently sampled first.
  pub fn iter(&self) -> Iter<'_> {
    Iter {
      list: self,
      cur: self.head,
    }
  }
}

impl Drop for SampledSpans {
  fn drop(&mut self) {
    unsafe { os_munmap(self.nodes.cast(), self.mapped) };
  }
}

pub struct Iter<'a> {
  list: &'a SampledSpans,
  cur: u32,
}

impl Iterator for Iter<'_> {
  type Item = PageId;

  fn next(&mut self) -> Option<PageId> {
    if self.cur == NIL {
      return None;
    }
    let node = self.list.node(self.cur);
    self.cur = node.next;
    Some(node.page)
  }
}
