use core::ptr::null_mut;

use crate::{PAGE_SIZE, align_up, pages::PageId};

pub(crate) unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    null_mut()
  } else {
    ptr as *mut u8
  }
}

pub(crate) unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// Page-aligned anonymous mapping, unmapped on drop.
///
/// Stands in for the page heap: spans are carved out of it with
/// [`PageRegion::page`].
#[derive(Debug)]
pub struct PageRegion {
  raw: *mut u8,
  raw_size: usize,
  first_page: PageId,
  num_pages: usize,
}

unsafe impl Send for PageRegion {}
unsafe impl Sync for PageRegion {}

impl PageRegion {
  /// Maps `num_pages` zeroed pages. Returns `None` if the OS refuses.
  pub fn map(num_pages: usize) -> Option<Self> {
    if num_pages == 0 {
      return None;
    }
    // Over-allocate for alignment padding.
    let raw_size = num_pages.checked_mul(PAGE_SIZE)?.checked_add(PAGE_SIZE)?;
    let raw = unsafe { os_mmap(raw_size) };
    if raw.is_null() {
      log::warn!("PageRegion::map({num_pages}): mmap of {raw_size} bytes failed");
      return None;
    }

    let first_page = PageId::containing(align_up(raw as usize, PAGE_SIZE));
    log::debug!(
      "PageRegion::map({num_pages}) -> {:#x}",
      first_page.start_addr()
    );
    Some(Self {
      raw,
      raw_size,
      first_page,
      num_pages,
    })
  }

  #[inline]
  pub fn first_page(&self) -> PageId {
    self.first_page
  }

  #[inline]
  pub fn num_pages(&self) -> usize {
    self.num_pages
  }

  /// The `n`th page of the region.
  #[inline]
  pub fn page(&self, n: usize) -> PageId {
    debug_assert!(n < self.num_pages, "page {n} outside region of {}", self.num_pages);
    self.first_page + n
  }

  #[inline]
  pub fn contains(&self, addr: usize) -> bool {
    let start = self.first_page.start_addr();
    addr >= start && addr < start + self.num_pages * PAGE_SIZE
  }
}

impl Drop for PageRegion {
  fn drop(&mut self) {
    unsafe { os_munmap(self.raw, self.raw_size) };
  }
}
