//! Size-class table: class → object size, pages per span, objects per span.
//!
//! Class `0` is reserved and means "no class" (e.g. a page that does not
//! back a small-object span). Classes from 1 up are 16-byte linear steps up
//! to 128 bytes, then four classes per doubling up to [`MAX_SIZE`].

use crate::{
  ALIGNMENT, LIST_END, MULTI_PAGE_ALIGNMENT, MULTI_PAGE_ALIGNMENT_SHIFT, MULTI_PAGE_SIZE, PAGE_SIZE,
  align_up, index_shift,
};

/// Number of linear size classes (16...128).
const CLASSES_LINEAR: usize = 8;
const CLASSES_LINEAR_STEP: usize = 16;

/// Classes per doubling in geometric progression
const CLASSES_PER_DOUBLING: usize = 4;

/// Largest object served from a span free list.
pub const MAX_SIZE: usize = 256 * 1024;

/// Spans grow until tail waste is at most 1/8 of the span.
const MAX_WASTE_FRACTION: usize = 8;

/// Returns the total number of size classes, including class 0. Computed at compile-time.
const fn count_size_classes() -> usize {
  let mut class = 1;
  loop {
    if class_to_size(class) >= MAX_SIZE {
      return class + 1;
    }
    class += 1;
    if class > 128 {
      return class;
    }
  }
}

/// Total number of size classes, including the reserved class 0.
pub const CLASSES_COUNT: usize = count_size_classes();

/// Object size per class, sorted ascending. `CLASS_SIZES[0] == 0`.
pub static CLASS_SIZES: [usize; CLASSES_COUNT] = {
  let mut table = [0usize; CLASSES_COUNT];
  let mut class = 1;
  while class < CLASSES_COUNT {
    table[class] = class_to_size(class);
    class += 1;
  }
  table
};

/// Sub-class multipliers for geometric range (scaled by 16 for integer math).
/// Each represents a fraction of the doubling: 1.0, 1.19, 1.44, 1.69
const GEO_MULTIPLIERS: [usize; 4] = [16, 19, 23, 27];

/// Convert class index to object size (inverse of [`size_to_class`]).
///
/// Sizes above [`MULTI_PAGE_SIZE`] are rounded to [`MULTI_PAGE_ALIGNMENT`] so
/// large-mode indices address object starts exactly.
#[inline(always)]
pub const fn class_to_size(class: usize) -> usize {
  if class == 0 {
    return 0;
  }
  let class = class - 1;
  if class < CLASSES_LINEAR {
    (class + 1) * CLASSES_LINEAR_STEP
  } else {
    let geo_index = class - CLASSES_LINEAR + 1;
    let order = geo_index / CLASSES_PER_DOUBLING;
    let sub = geo_index % CLASSES_PER_DOUBLING;

    let base = 128 << order;
    let raw = (base * GEO_MULTIPLIERS[sub]) / 16;
    let size = if raw > MULTI_PAGE_SIZE {
      align_up(raw, MULTI_PAGE_ALIGNMENT)
    } else {
      align_up(raw, CLASSES_LINEAR_STEP)
    };

    if size > MAX_SIZE { MAX_SIZE } else { size }
  }
}

/// Smallest class whose objects hold `size` bytes, or `None` above [`MAX_SIZE`].
#[inline]
pub fn size_to_class(size: usize) -> Option<usize> {
  if size > MAX_SIZE {
    return None;
  }

  // Binary search for the smallest class >= size, skipping class 0.
  let mut lo = 1usize;
  let mut hi = CLASSES_COUNT;
  while lo < hi {
    let mid = lo + (hi - lo) / 2;
    if CLASS_SIZES[mid] < size {
      lo = mid + 1;
    } else {
      hi = mid;
    }
  }

  if lo < CLASSES_COUNT { Some(lo) } else { None }
}

/// Pages backing one span of `class`.
///
/// Small-mode classes always get exactly one page (their indices are taken
/// from the in-page offset). Larger classes add pages until tail waste is
/// acceptable or the span would stop being addressable with 16-bit indices.
pub const fn class_to_pages(class: usize) -> usize {
  let size = class_to_size(class);
  if size == 0 {
    return 0;
  }
  if size <= MULTI_PAGE_SIZE {
    return 1;
  }

  let mut pages = size.div_ceil(PAGE_SIZE);
  loop {
    let bytes = pages * PAGE_SIZE;
    if bytes % size <= bytes / MAX_WASTE_FRACTION {
      return pages;
    }
    if (bytes + PAGE_SIZE) >> MULTI_PAGE_ALIGNMENT_SHIFT >= LIST_END as usize {
      return pages;
    }
    pages += 1;
  }
}

/// Objects carved out of one span of `class`.
pub const fn objects_per_span(class: usize) -> usize {
  let size = class_to_size(class);
  if size == 0 {
    return 0;
  }
  class_to_pages(class) * PAGE_SIZE / size
}

/// Every class fits the free-list encoding: aligned for its addressing mode,
/// one page for small mode, and `objects * step` strictly below `LIST_END`.
const fn all_classes_indexable() -> bool {
  let mut class = 1;
  while class < CLASSES_COUNT {
    let size = class_to_size(class);
    let shift = index_shift(size);
    if size % (1 << shift) != 0 || size % ALIGNMENT != 0 {
      return false;
    }
    if size <= MULTI_PAGE_SIZE && class_to_pages(class) != 1 {
      return false;
    }
    if objects_per_span(class) == 0 {
      return false;
    }
    if objects_per_span(class) * (size >> shift) >= LIST_END as usize {
      return false;
    }
    class += 1;
  }
  true
}

const _: () = assert!(class_to_size(1) == 16);
const _: () = assert!(class_to_size(CLASSES_COUNT - 1) == MAX_SIZE);
const _: () = assert!(all_classes_indexable());
