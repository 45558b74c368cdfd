//! Span: a run of pages sliced into equal-size objects, and its free list.
//!
//! Free objects are named by 2-byte indices: the object's offset from the
//! span start divided by a power of two. Objects up to [`MULTI_PAGE_SIZE`]
//! use [`ALIGNMENT`](crate::ALIGNMENT) as divisor and live in one-page
//! spans; larger ones use [`MULTI_PAGE_ALIGNMENT`](crate::MULTI_PAGE_ALIGNMENT).
//! Both keep every index strictly below [`LIST_END`].
//!
//! The free list has two parts. A 4-entry cache sits in the span itself and
//! can be used without touching any object. The rest is stored in the free
//! objects: slot 0 of an object links to the next object in the chain, the
//! remaining `size / 2 - 1` slots hold more free indices. Only the head
//! object (`freelist`) is partially filled; every object behind it is full.
//!
//! ```text
//!         freelist  embed_count          cache        cache_size
//! Span: [  |idx|         4          |idx|idx|---|---|      2      ]
//!            |
//!            v
//!            [idx|idx|idx|idx|idx|---|---|---]  16-byte object
//!              |
//!              v
//!            [END|idx|idx|idx|idx|idx|idx|idx]  16-byte object
//! ```

use core::{mem::size_of, ptr::null_mut};

use crate::{
  ALIGNMENT_SHIFT, CACHE_SIZE, LIST_END, MULTI_PAGE_ALIGNMENT_SHIFT, MULTI_PAGE_SIZE, ObjIdx,
  PAGE_SIZE,
  pagemap::PageMap,
  pages::PageId,
  sampled::{SampledNode, SampledSpans},
  size_class::class_to_size,
  stack_trace::{StackTrace, allocated_bytes},
  stats::StatsCounter,
};

/// Addressing mode, picked once per operation from the object size.
trait Align {
  const SHIFT: usize;
  const LARGE: bool;
}

enum Small {}
enum Large {}

impl Align for Small {
  const SHIFT: usize = ALIGNMENT_SHIFT;
  const LARGE: bool = false;
}

impl Align for Large {
  const SHIFT: usize = MULTI_PAGE_ALIGNMENT_SHIFT;
  const LARGE: bool = true;
}

/// Indices an object of `size` bytes can hold besides its chain link.
#[inline(always)]
const fn max_embed(size: usize) -> usize {
  size / size_of::<ObjIdx>() - 1
}

#[derive(Debug)]
pub struct Span {
  // === Free-list state (every push/pop) ===
  cache: [ObjIdx; CACHE_SIZE],
  cache_size: u8,
  /// Extra indices held by the head chain object.
  embed_count: u16,
  /// Head chain object, or `LIST_END`.
  freelist: ObjIdx,
  /// Objects handed out and not yet pushed back.
  allocated: u16,

  // === Geometry, sampling, aging ===
  first_page: PageId,
  num_pages: usize,
  freelist_added_time: u64,
  /// Present iff the span is sampled.
  sampled_stack: Option<Box<StackTrace>>,
  sampled_node: Option<SampledNode>,
}

impl Span {
  /// A span over `[first_page, first_page + num_pages)` with an empty free list.
  pub fn new(first_page: PageId, num_pages: usize) -> Self {
    tripwire!(num_pages > 0, "Span::new: empty span at {first_page:?}");
    Self {
      cache: [LIST_END; CACHE_SIZE],
      cache_size: 0,
      embed_count: 0,
      freelist: LIST_END,
      allocated: 0,
      first_page,
      num_pages,
      freelist_added_time: 0,
      sampled_stack: None,
      sampled_node: None,
    }
  }

  // ---------------------------------------------------------------------------
  // Geometry
  // ---------------------------------------------------------------------------

  #[inline]
  pub fn first_page(&self) -> PageId {
    self.first_page
  }

  #[inline]
  pub fn last_page(&self) -> PageId {
    self.first_page + (self.num_pages - 1)
  }

  #[inline]
  pub fn num_pages(&self) -> usize {
    self.num_pages
  }

  #[inline]
  pub fn set_num_pages(&mut self, num_pages: usize) {
    tripwire!(num_pages > 0, "set_num_pages: empty span at {:?}", self.first_page);
    self.num_pages = num_pages;
  }

  #[inline]
  pub fn bytes_in_span(&self) -> usize {
    self.num_pages * PAGE_SIZE
  }

  #[inline]
  pub fn start_address(&self) -> *mut u8 {
    self.first_page.start_ptr()
  }

  #[inline]
  pub fn contains(&self, ptr: *const u8) -> bool {
    let start = self.first_page.start_addr();
    let p = ptr as usize;
    p >= start && p < start + self.bytes_in_span()
  }

  #[inline]
  pub fn allocated(&self) -> usize {
    self.allocated as usize
  }

  #[inline]
  pub fn freelist_empty(&self) -> bool {
    self.cache_size == 0 && self.freelist == LIST_END
  }

  // ---------------------------------------------------------------------------
  // Index <-> pointer
  // ---------------------------------------------------------------------------

  #[inline(always)]
  fn ptr_to_idx_sized<A: Align>(&self, ptr: *const u8) -> ObjIdx {
    let p = ptr as usize;
    let off = if A::LARGE {
      (p - self.first_page.start_addr()) >> A::SHIFT
    } else {
      // One-page span: the in-page offset is the span offset, `first_page` stays unread.
      tripwire!(
        PageId::containing(p) == self.first_page,
        "ptr_to_idx: {p:#x} outside one-page span {:?}",
        self.first_page
      );
      (p & (PAGE_SIZE - 1)) >> A::SHIFT
    };
    tripwire!(
      off < LIST_END as usize,
      "ptr_to_idx: offset {off} of {p:#x} does not fit an index"
    );
    off as ObjIdx
  }

  #[inline(always)]
  fn idx_to_ptr_sized<A: Align>(&self, idx: ObjIdx) -> *mut ObjIdx {
    tripwire!(idx != LIST_END, "idx_to_ptr: end-of-list marker in span {:?}", self.first_page);
    let ptr = (self.first_page.start_addr() + ((idx as usize) << A::SHIFT)) as *mut ObjIdx;
    tripwire!(
      self.ptr_to_idx_sized::<A>(ptr.cast()) == idx,
      "idx_to_ptr: index {idx} does not round-trip through {ptr:p}"
    );
    ptr
  }

  /// Index of the object at `ptr`, for objects of `size` bytes.
  #[inline]
  pub fn ptr_to_idx(&self, ptr: *const u8, size: usize) -> ObjIdx {
    if size <= MULTI_PAGE_SIZE {
      self.ptr_to_idx_sized::<Small>(ptr)
    } else {
      self.ptr_to_idx_sized::<Large>(ptr)
    }
  }

  /// Address of the object named by `idx`, for objects of `size` bytes.
  #[inline]
  pub fn idx_to_ptr(&self, idx: ObjIdx, size: usize) -> *mut u8 {
    let ptr = if size <= MULTI_PAGE_SIZE {
      self.idx_to_ptr_sized::<Small>(idx)
    } else {
      self.idx_to_ptr_sized::<Large>(idx)
    };
    ptr.cast()
  }

  // ---------------------------------------------------------------------------
  // Free list
  // ---------------------------------------------------------------------------

  /// Makes all `count` objects of `size` bytes free and resets `allocated`.
  ///
  /// # Safety
  /// The span's pages must be mapped and writable, and none of its objects may
  /// be in use. `count` objects of `size` bytes must fit in the span.
  pub unsafe fn build_freelist(&mut self, size: usize, count: usize) {
    if size <= MULTI_PAGE_SIZE {
      unsafe { self.build_freelist_sized::<Small>(size, count) }
    } else {
      unsafe { self.build_freelist_sized::<Large>(size, count) }
    }
  }

  unsafe fn build_freelist_sized<A: Align>(&mut self, size: usize, count: usize) {
    tripwire!(
      A::LARGE || self.num_pages == 1,
      "build_freelist: {size}-byte objects need a one-page span, {:?} has {} pages",
      self.first_page,
      self.num_pages
    );
    tripwire!(
      size >= 1 << A::SHIFT && size % (1 << A::SHIFT) == 0,
      "build_freelist: size {size} is not a multiple of {}",
      1 << A::SHIFT
    );
    tripwire!(
      count * size <= self.bytes_in_span(),
      "build_freelist: {count} x {size} bytes overflow span {:?} of {} pages",
      self.first_page,
      self.num_pages
    );

    self.allocated = 0;
    self.freelist = LIST_END;

    let step = size >> A::SHIFT;
    // Valid objects are {0, step, 2 * step, ..., (count - 1) * step}.
    let mut idx = 0;
    let mut idx_end = count * step;
    // The end of the useful part of the span stays below LIST_END, so no real
    // index can be confused with it.
    tripwire!(
      idx_end < LIST_END as usize,
      "build_freelist: {count} objects of {size} bytes do not fit 16-bit indices"
    );

    let mut cache_size = 0;
    while idx < idx_end && cache_size < CACHE_SIZE {
      self.cache[cache_size] = idx as ObjIdx;
      cache_size += 1;
      idx += step;
    }
    self.cache_size = cache_size as u8;

    // Chain objects come from the low end, embedded indices from the high end:
    // draining touches the span gradually and leaves the cache alone.
    let max_embed = max_embed(size);
    let mut host: *mut ObjIdx = null_mut();
    let mut embed_count = 0;
    while idx < idx_end {
      if !host.is_null() && embed_count != max_embed {
        embed_count += 1;
        idx_end -= step;
        unsafe { host.add(embed_count).write(idx_end as ObjIdx) };
      } else {
        host = self.idx_to_ptr_sized::<A>(idx as ObjIdx);
        unsafe { host.write(self.freelist) };
        self.freelist = idx as ObjIdx;
        embed_count = 0;
        idx += step;
      }
    }
    self.embed_count = embed_count as u16;
  }

  /// Pops up to `batch.len()` free objects into `batch`, cache first.
  /// Returns how many were written.
  ///
  /// # Safety
  /// The free list must have been built by [`Span::build_freelist`] with the
  /// same `size`, and the span's pages must still be mapped.
  pub unsafe fn freelist_pop_batch(&mut self, batch: &mut [*mut u8], size: usize) -> usize {
    if size <= MULTI_PAGE_SIZE {
      unsafe { self.freelist_pop_batch_sized::<Small>(batch, size) }
    } else {
      unsafe { self.freelist_pop_batch_sized::<Large>(batch, size) }
    }
  }

  unsafe fn freelist_pop_batch_sized<A: Align>(
    &mut self,
    batch: &mut [*mut u8],
    size: usize,
  ) -> usize {
    let n = batch.len();
    let mut result = 0;

    // Cache, most recently pushed first.
    let csize = self.cache_size as usize;
    let cache_reads = csize.min(n);
    while result < cache_reads {
      batch[result] = self.idx_to_ptr_sized::<A>(self.cache[csize - result - 1]).cast();
      result += 1;
    }
    self.cache_size = (csize - result) as u8;

    while result < n {
      if self.freelist == LIST_END {
        break;
      }

      let host = self.idx_to_ptr_sized::<A>(self.freelist);
      let mut embed_count = self.embed_count as usize;
      let take = embed_count.min(n - result);
      for i in 0..take {
        let idx = unsafe { host.add(embed_count - i).read() };
        batch[result + i] = self.idx_to_ptr_sized::<A>(idx).cast();
      }
      embed_count -= take;
      result += take;

      if result == n {
        self.embed_count = embed_count as u16;
        break;
      }

      // Head object is drained: hand it out and move to the next one.
      tripwire!(embed_count == 0, "pop_batch: head {} still holds {embed_count}", self.freelist);
      batch[result] = host.cast();
      result += 1;

      self.freelist = unsafe { host.read() };
      // Objects behind the head are always full.
      self.embed_count = max_embed(size) as u16;
    }

    tripwire!(
      self.allocated as usize + result < LIST_END as usize,
      "pop_batch: allocated count overflow in span {:?}",
      self.first_page
    );
    self.allocated += result as u16;
    result
  }

  /// Returns one object to the free list.
  ///
  /// Returns `false` without touching the free list when `ptr` is the last
  /// live object: the caller releases the whole span instead.
  ///
  /// # Safety
  /// `ptr` must be an object of `size` bytes from this span that was handed out
  /// by [`Span::freelist_pop_batch`] and is no longer in use.
  pub unsafe fn freelist_push(&mut self, ptr: *mut u8, size: usize) -> bool {
    tripwire!(
      self.allocated > 0,
      "freelist_push: {ptr:p} into span {:?} with no live objects",
      self.first_page
    );
    tripwire!(self.contains(ptr), "freelist_push: {ptr:p} outside span {:?}", self.first_page);
    if self.allocated == 1 {
      return false;
    }
    self.allocated -= 1;

    if size <= MULTI_PAGE_SIZE {
      unsafe { self.freelist_push_sized::<Small>(ptr, size) };
    } else {
      unsafe { self.freelist_push_sized::<Large>(ptr, size) };
    }
    true
  }

  unsafe fn freelist_push_sized<A: Align>(&mut self, ptr: *mut u8, size: usize) {
    let idx = self.ptr_to_idx_sized::<A>(ptr);

    if (self.cache_size as usize) != CACHE_SIZE {
      self.cache[self.cache_size as usize] = idx;
      self.cache_size += 1;
    } else if self.freelist != LIST_END && self.embed_count as usize != max_embed(size) {
      let host = if A::LARGE {
        self.idx_to_ptr_sized::<A>(self.freelist)
      } else {
        // Head lives on the same page as `ptr`.
        ((ptr as usize & !(PAGE_SIZE - 1)) + ((self.freelist as usize) << A::SHIFT))
          as *mut ObjIdx
      };
      self.embed_count += 1;
      unsafe { host.add(self.embed_count as usize).write(idx) };
    } else {
      // Cache and head are full (or there is no head): `ptr` becomes the head.
      let obj = ptr as *mut ObjIdx;
      unsafe { obj.write(self.freelist) };
      self.freelist = idx;
      self.embed_count = 0;
    }
  }

  // ---------------------------------------------------------------------------
  // Sampling
  // ---------------------------------------------------------------------------

  #[inline]
  pub fn sampled(&self) -> bool {
    self.sampled_stack.is_some()
  }

  #[inline]
  pub fn sampled_stack(&self) -> Option<&StackTrace> {
    self.sampled_stack.as_deref()
  }

  /// Marks the span as a profiling sample of `stack`.
  ///
  /// The span takes ownership of `stack`, joins `sampled` under its first
  /// page and adds its byte estimate to `sampled_bytes`. Must not already be
  /// sampled.
  pub fn sample(
    &mut self,
    stack: Box<StackTrace>,
    sampled: &mut SampledSpans,
    sampled_bytes: &StatsCounter,
  ) {
    tripwire!(self.sampled_stack.is_none(), "sample: span {:?} already sampled", self.first_page);

    let bytes = allocated_bytes(&stack, true) as i64;
    self.sampled_node = Some(sampled.prepend(self.first_page));
    self.sampled_stack = Some(stack);
    sampled_bytes.lossy_add(bytes);
  }

  /// Ends the sample and hands the stack record back, or `None` (and no side
  /// effects) if the span is not sampled.
  pub fn unsample(
    &mut self,
    sampled: &mut SampledSpans,
    sampled_bytes: &StatsCounter,
  ) -> Option<Box<StackTrace>> {
    let stack = self.sampled_stack.take()?;
    if let Some(node) = self.sampled_node.take() {
      sampled.remove(node);
    }
    sampled_bytes.lossy_add(-(allocated_bytes(&stack, true) as i64));
    Some(stack)
  }

  // ---------------------------------------------------------------------------
  // Fragmentation / aging
  // ---------------------------------------------------------------------------

  /// Free slots pinned per live object: `(capacity - live) / live`.
  ///
  /// Counted in objects, not bytes. A span with no size class or no live
  /// objects trips the contract check; unchecked builds return 0.
  pub fn fragmentation(&self, pagemap: &PageMap) -> f64 {
    let class = pagemap.size_class(self.first_page);
    if class == 0 {
      tripwire!(class != 0, "fragmentation: span {:?} has no size class", self.first_page);
      log::debug!("fragmentation: span {:?} has no size class", self.first_page);
      return 0.0;
    }
    let span_objects = self.bytes_in_span() / class_to_size(class);
    let live = self.allocated as usize;
    if live == 0 {
      tripwire!(live != 0, "fragmentation: span {:?} has no live objects", self.first_page);
      log::debug!("fragmentation: span {:?} has no live objects", self.first_page);
      return 0.0;
    }
    span_objects.saturating_sub(live) as f64 / live as f64
  }

  #[inline]
  pub fn freelist_added_time(&self) -> u64 {
    self.freelist_added_time
  }

  #[inline]
  pub fn set_freelist_added_time(&mut self, time: u64) {
    self.freelist_added_time = time;
  }

  /// Page-weighted average of this span's and `other`'s timestamps, for a
  /// span about to absorb `other`.
  pub fn average_freelist_added_time(&mut self, other: &Span) {
    // f64 keeps `time * pages` from overflowing u64.
    let weighted = self.freelist_added_time as f64 * self.num_pages as f64
      + other.freelist_added_time as f64 * other.num_pages as f64;
    self.freelist_added_time = (weighted / (self.num_pages + other.num_pages) as f64) as u64;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    ALIGNMENT,
    platform::PageRegion,
    size_class::{CLASSES_COUNT, class_to_pages, objects_per_span},
  };
  use proptest::prelude::*;
  use std::collections::BTreeSet;

  fn step_of(size: usize) -> usize {
    size >> crate::index_shift(size)
  }

  /// Every free index, read straight out of the encoding.
  fn free_indices(span: &Span, size: usize) -> Vec<ObjIdx> {
    let mut out: Vec<ObjIdx> = span.cache[..span.cache_size as usize].to_vec();
    let mut node = span.freelist;
    let mut embedded = span.embed_count as usize;
    while node != LIST_END {
      out.push(node);
      let host = span.idx_to_ptr(node, size) as *const ObjIdx;
      for i in 1..=embedded {
        out.push(unsafe { host.add(i).read() });
      }
      node = unsafe { host.read() };
      embedded = max_embed(size);
    }
    out
  }

  fn span_for(region: &PageRegion, class: usize) -> Span {
    Span::new(region.first_page(), class_to_pages(class))
  }

  #[test]
  fn worked_example() {
    assert_eq!(ALIGNMENT, 8);
    let region = PageRegion::map(1).expect("mmap");
    let mut span = Span::new(region.first_page(), 1);
    unsafe { span.build_freelist(16, 6) };

    assert_eq!(span.cache_size, 4);
    assert_eq!(span.cache, [0, 2, 4, 6]);
    assert_eq!(span.freelist, 8);
    assert_eq!(span.embed_count, 1);
    let host = span.idx_to_ptr(8, 16) as *const ObjIdx;
    unsafe {
      assert_eq!(host.read(), LIST_END);
      assert_eq!(host.add(1).read(), 10);
    }
    assert_eq!(span.allocated(), 0);
  }

  #[test]
  fn build_fills_cache_only_for_tiny_counts() {
    let region = PageRegion::map(1).expect("mmap");
    let mut span = Span::new(region.first_page(), 1);
    unsafe { span.build_freelist(64, 3) };
    assert_eq!(span.cache_size, 3);
    assert_eq!(&span.cache[..3], &[0, 8, 16]);
    assert_eq!(span.freelist, LIST_END);

    unsafe { span.build_freelist(64, 0) };
    assert!(span.freelist_empty());
  }

  #[test]
  fn round_trip_every_index_every_class() {
    for class in 1..CLASSES_COUNT {
      let size = class_to_size(class);
      let region = PageRegion::map(class_to_pages(class)).expect("mmap");
      let span = span_for(&region, class);
      let step = step_of(size);
      for i in 0..objects_per_span(class) {
        let idx = (i * step) as ObjIdx;
        let ptr = span.idx_to_ptr(idx, size);
        assert!(span.contains(ptr), "class {class} idx {idx}");
        assert_eq!(ptr as usize - span.start_address() as usize, i * size);
        assert_eq!(span.ptr_to_idx(ptr, size), idx, "class {class} idx {idx}");
      }
    }
  }

  #[test]
  fn pop_drains_cache_then_embedded_then_host() {
    let region = PageRegion::map(1).expect("mmap");
    let mut span = Span::new(region.first_page(), 1);
    unsafe { span.build_freelist(16, 6) };

    let mut batch = [null_mut::<u8>(); 8];
    let n = unsafe { span.freelist_pop_batch(&mut batch, 16) };
    assert_eq!(n, 6);
    let idx: Vec<ObjIdx> = batch[..n].iter().map(|&p| span.ptr_to_idx(p, 16)).collect();
    assert_eq!(idx, [6, 4, 2, 0, 10, 8]);
    assert_eq!(span.allocated(), 6);
    assert!(span.freelist_empty());
  }

  #[test]
  fn pop_stops_midway_through_embedded_entries() {
    let region = PageRegion::map(1).expect("mmap");
    let mut span = Span::new(region.first_page(), 1);
    // 4 cached, head at 10 with 2 embedded, then 8 full with 7.
    unsafe { span.build_freelist(16, 15) };
    let before: BTreeSet<ObjIdx> = free_indices(&span, 16).into_iter().collect();

    let mut batch = [null_mut::<u8>(); 6];
    assert_eq!(unsafe { span.freelist_pop_batch(&mut batch, 16) }, 6);
    let after: BTreeSet<ObjIdx> = free_indices(&span, 16).into_iter().collect();
    let popped: BTreeSet<ObjIdx> = batch.iter().map(|&p| span.ptr_to_idx(p, 16)).collect();

    assert_eq!(after.len(), 9);
    assert!(after.is_disjoint(&popped));
    assert_eq!(&after | &popped, before);
  }

  #[test]
  fn push_fills_cache_then_head_then_new_head() {
    let region = PageRegion::map(1).expect("mmap");
    let mut span = Span::new(region.first_page(), 1);
    let count = 40;
    unsafe { span.build_freelist(16, count) };

    let mut batch: Vec<*mut u8> = vec![null_mut(); count];
    assert_eq!(unsafe { span.freelist_pop_batch(&mut batch, 16) }, count);
    assert!(span.freelist_empty());

    // 4 into the cache.
    for &p in &batch[..4] {
      assert!(unsafe { span.freelist_push(p, 16) });
    }
    assert_eq!(span.cache_size as usize, CACHE_SIZE);
    assert_eq!(span.freelist, LIST_END);

    // Next one becomes the head.
    assert!(unsafe { span.freelist_push(batch[4], 16) });
    assert_eq!(span.freelist, span.ptr_to_idx(batch[4], 16));
    assert_eq!(span.embed_count, 0);

    // Then the head fills up.
    for &p in &batch[5..5 + max_embed(16)] {
      assert!(unsafe { span.freelist_push(p, 16) });
    }
    assert_eq!(span.embed_count as usize, max_embed(16));

    // And a new head starts.
    let next = batch[5 + max_embed(16)];
    assert!(unsafe { span.freelist_push(next, 16) });
    assert_eq!(span.freelist, span.ptr_to_idx(next, 16));
    assert_eq!(span.embed_count, 0);

    let pushed = 5 + max_embed(16) + 1;
    assert_eq!(span.allocated(), count - pushed);
    let free: BTreeSet<ObjIdx> = free_indices(&span, 16).into_iter().collect();
    let expected: BTreeSet<ObjIdx> = batch[..pushed]
      .iter()
      .map(|&p| span.ptr_to_idx(p, 16))
      .collect();
    assert_eq!(free, expected);
  }

  #[test]
  fn last_push_reports_empty_span() {
    let region = PageRegion::map(1).expect("mmap");
    let mut span = Span::new(region.first_page(), 1);
    unsafe { span.build_freelist(32, 2) };
    let mut batch = [null_mut::<u8>(); 2];
    assert_eq!(unsafe { span.freelist_pop_batch(&mut batch, 32) }, 2);

    assert!(unsafe { span.freelist_push(batch[0], 32) });
    assert!(!unsafe { span.freelist_push(batch[1], 32) });
    assert_eq!(span.allocated(), 1);
  }

  #[test]
  fn unsample_without_sample_is_noop() {
    let mut list = SampledSpans::new(4).expect("mmap");
    let bytes = StatsCounter::new();
    bytes.lossy_add(7);
    let mut span = Span::new(PageId::new(123), 1);
    assert!(span.unsample(&mut list, &bytes).is_none());
    assert_eq!(bytes.value(), 7);
    assert!(list.is_empty());
  }

  #[test]
  fn sample_links_node_keyed_by_first_page() {
    let mut list = SampledSpans::new(4).expect("mmap");
    let bytes = StatsCounter::new();
    let mut span = Span::new(PageId::new(77), 2);
    span.sample(Box::new(StackTrace::new(10, 16, 1100)), &mut list, &bytes);

    assert!(span.sampled());
    let node = span.sampled_node.as_ref().expect("listed");
    assert_eq!(list.page(node), PageId::new(77));
    assert_eq!(bytes.value(), 1600);

    span.unsample(&mut list, &bytes).expect("stack");
    assert!(span.sampled_node.is_none());
    assert_eq!(bytes.value(), 0);
  }

  #[test]
  fn merged_sampled_span_keeps_registry_key() {
    let mut list = SampledSpans::new(4).expect("mmap");
    let bytes = StatsCounter::new();
    let mut span = Span::new(PageId::new(77), 2);
    let neighbour = Span::new(PageId::new(79), 3);
    span.sample(Box::new(StackTrace::new(10, 16, 1100)), &mut list, &bytes);

    // Absorbing a right-hand neighbour only extends the span.
    span.average_freelist_added_time(&neighbour);
    span.set_num_pages(span.num_pages() + neighbour.num_pages());
    assert_eq!(span.last_page(), PageId::new(81));
    let node = span.sampled_node.as_ref().expect("listed");
    assert_eq!(list.page(node), span.first_page());
    assert_eq!(list.iter().collect::<Vec<_>>(), [span.first_page()]);
  }

  #[test]
  fn sampling_outgrows_initial_registry() {
    let mut list = SampledSpans::new(1).expect("mmap");
    let bytes = StatsCounter::new();
    let count = list.capacity() + 1;
    let mut spans: Vec<Span> = (0..count).map(|i| Span::new(PageId::new(i * 2), 2)).collect();

    for span in spans.iter_mut() {
      span.sample(Box::new(StackTrace::new(8, 16, 900)), &mut list, &bytes);
      assert!(span.sampled_node.is_some());
    }
    assert_eq!(list.len(), count);
    assert_eq!(bytes.value(), count as i64 * 1600);
    for span in spans.iter() {
      assert_eq!(list.page(span.sampled_node.as_ref().expect("listed")), span.first_page());
    }

    for span in spans.iter_mut() {
      span.unsample(&mut list, &bytes).expect("stack");
    }
    assert!(list.is_empty());
    assert_eq!(bytes.value(), 0);
  }

  #[cfg(any(debug_assertions, feature = "debug-tripwire"))]
  #[test]
  #[should_panic(expected = "outside one-page span")]
  fn idx_past_small_span_trips() {
    let region = PageRegion::map(2).expect("mmap");
    let span = Span::new(region.first_page(), 1);
    span.idx_to_ptr((PAGE_SIZE / ALIGNMENT) as ObjIdx, 16);
  }

  #[cfg(any(debug_assertions, feature = "debug-tripwire"))]
  #[test]
  #[should_panic(expected = "already sampled")]
  fn double_sample_trips() {
    let mut list = SampledSpans::new(4).expect("mmap");
    let bytes = StatsCounter::new();
    let mut span = Span::new(PageId::new(1), 1);
    span.sample(Box::new(StackTrace::new(8, 16, 1)), &mut list, &bytes);
    span.sample(Box::new(StackTrace::new(8, 16, 1)), &mut list, &bytes);
  }

  #[cfg(any(debug_assertions, feature = "debug-tripwire"))]
  #[test]
  #[should_panic(expected = "do not fit 16-bit indices")]
  fn oversized_build_trips() {
    let count = LIST_END as usize / 8 + 1;
    let mut span = Span::new(PageId::new(1), (count * 512).div_ceil(PAGE_SIZE));
    // Never touches memory: the check fires before the first write.
    unsafe { span.build_freelist(512, count) };
  }

  proptest! {
    #![proptest_config(ProptestConfig { cases: 96, ..ProptestConfig::default() })]
    #[test]
    fn build_conserves_every_object(
      (class, count) in (1..CLASSES_COUNT).prop_flat_map(|class| {
        (Just(class), 0..=objects_per_span(class))
      })
    ) {
      let size = class_to_size(class);
      let region = PageRegion::map(class_to_pages(class)).expect("mmap");
      let mut span = span_for(&region, class);
      unsafe { span.build_freelist(size, count) };

      let mut free = free_indices(&span, size);
      prop_assert_eq!(free.len(), count);
      prop_assert!(!free.contains(&LIST_END));
      prop_assert!(span.cache_size as usize <= CACHE_SIZE);
      prop_assert!(span.embed_count as usize <= max_embed(size));
      free.sort_unstable();
      let step = step_of(size);
      let expected: Vec<ObjIdx> = (0..count).map(|i| (i * step) as ObjIdx).collect();
      prop_assert_eq!(free, expected);
    }
  }
}
