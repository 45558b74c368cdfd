//! Page identity arithmetic.

use core::ops::{Add, Sub};

use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Index of a page in the address space (`addr >> PAGE_SHIFT`).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct PageId(usize);

impl PageId {
  #[inline(always)]
  pub const fn new(index: usize) -> Self {
    Self(index)
  }

  /// Page containing `addr`.
  #[inline(always)]
  pub const fn containing(addr: usize) -> Self {
    Self(addr >> PAGE_SHIFT)
  }

  #[inline(always)]
  pub const fn index(self) -> usize {
    self.0
  }

  /// First byte of the page.
  #[inline(always)]
  pub const fn start_addr(self) -> usize {
    self.0 << PAGE_SHIFT
  }

  #[inline(always)]
  pub fn start_ptr(self) -> *mut u8 {
    self.start_addr() as *mut u8
  }

  /// One past the last byte of the page.
  #[inline(always)]
  pub const fn end_addr(self) -> usize {
    self.start_addr() + PAGE_SIZE
  }
}

impl Add<usize> for PageId {
  type Output = PageId;

  #[inline(always)]
  fn add(self, pages: usize) -> PageId {
    PageId(self.0 + pages)
  }
}

impl Sub<usize> for PageId {
  type Output = PageId;

  #[inline(always)]
  fn sub(self, pages: usize) -> PageId {
    PageId(self.0 - pages)
  }
}

/// Distance in pages.
impl Sub<PageId> for PageId {
  type Output = usize;

  #[inline(always)]
  fn sub(self, other: PageId) -> usize {
    self.0 - other.0
  }
}
