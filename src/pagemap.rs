//! Flat page → size-class map for one registered address range.

use core::sync::atomic::{AtomicU8, Ordering};

use crate::{
  PAGE_SIZE, align_up,
  pages::PageId,
  platform::{os_mmap, os_munmap},
  size_class::CLASSES_COUNT,
};

const _: () = assert!(CLASSES_COUNT <= u8::MAX as usize);

/// One byte per page holding its size class (0 = none).
///
/// Entries are relaxed atomics so lookups from reporting threads never tear
/// while the owner (re)assigns spans.
pub struct PageMap {
  classes: *mut AtomicU8,
  mapped: usize,
  base: PageId,
  num_pages: usize,
}

unsafe impl Send for PageMap {}
unsafe impl Sync for PageMap {}

impl PageMap {
  /// Covers `num_pages` pages starting at `base`, all initially class 0.
  pub fn new(base: PageId, num_pages: usize) -> Option<Self> {
    let mapped = align_up(num_pages.max(1), PAGE_SIZE);
    // Anonymous mappings are zero-filled: every page starts as "no class".
    let classes = unsafe { os_mmap(mapped) } as *mut AtomicU8;
    if classes.is_null() {
      log::warn!("PageMap::new({base:?}, {num_pages}): mmap of {mapped} bytes failed");
      return None;
    }
    Some(Self {
      classes,
      mapped,
      base,
      num_pages,
    })
  }

  #[inline]
  fn slot(&self, page: PageId) -> Option<&AtomicU8> {
    if page < self.base {
      return None;
    }
    let offset = page - self.base;
    if offset >= self.num_pages {
      return None;
    }
    Some(unsafe { &*self.classes.add(offset) })
  }

  /// Size class of `page`, or 0 if unassigned or outside the covered range.
  #[inline]
  pub fn size_class(&self, page: PageId) -> usize {
    self
      .slot(page)
      .map(|s| s.load(Ordering::Relaxed) as usize)
      .unwrap_or(0)
  }

  /// Assigns `class` to every page of the span `[first_page, first_page + num_pages)`.
  /// Pass 0 to clear.
  pub fn set_span(&self, first_page: PageId, num_pages: usize, class: usize) {
    debug_assert!(class < CLASSES_COUNT, "set_span: class {class} out of range");
    for n in 0..num_pages {
      let page = first_page + n;
      match self.slot(page) {
        Some(s) => s.store(class as u8, Ordering::Relaxed),
        None => debug_assert!(false, "set_span: page {page:?} outside map at {:?}", self.base),
      }
    }
  }
}

impl Drop for PageMap {
  fn drop(&mut self) {
    unsafe { os_munmap(self.classes.cast(), self.mapped) };
  }
}
