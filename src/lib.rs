#![allow(clippy::missing_safety_doc)]

//! Per-span free-object tracking for a size-class allocator.
//!
//! A [`Span`] is a run of pages cut into equal objects. It keeps its free
//! objects as 16-bit indices: a few in an inline cache, the rest stored
//! inside the free objects themselves. It also carries the bookkeeping the
//! allocator attaches to spans: profiling samples, fragmentation estimate,
//! and a free-list age used when spans are merged.

// =============================================================================
// Contract checks
// =============================================================================

/// Contract check. Active in debug builds, and in release builds with the
/// `debug-tripwire` feature; compiled out otherwise.
macro_rules! tripwire {
  ($($arg:tt)*) => {
    if cfg!(any(debug_assertions, feature = "debug-tripwire")) {
      assert!($($arg)*);
    }
  };
}

pub mod pagemap;
pub mod pages;
pub mod platform;
pub mod sampled;
pub mod size_class;
pub mod span;
pub mod stack_trace;
pub mod stats;

pub use pagemap::PageMap;
pub use pages::PageId;
pub use platform::PageRegion;
pub use sampled::{SampledNode, SampledSpans};
pub use span::Span;
pub use stack_trace::{StackTrace, allocated_bytes};
pub use stats::StatsCounter;

// =============================================================================
// Constants
// =============================================================================

#[cfg(feature = "pages-256k")]
pub const PAGE_SHIFT: usize = 18;
#[cfg(all(feature = "pages-32k", not(feature = "pages-256k")))]
pub const PAGE_SHIFT: usize = 15;
#[cfg(all(
  feature = "pages-4k",
  not(any(feature = "pages-32k", feature = "pages-256k"))
))]
pub const PAGE_SHIFT: usize = 12;
#[cfg(not(any(feature = "pages-4k", feature = "pages-32k", feature = "pages-256k")))]
pub const PAGE_SHIFT: usize = 13; // 8KB

pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Index divisor for objects up to [`MULTI_PAGE_SIZE`].
pub const ALIGNMENT_SHIFT: usize = 3;
pub const ALIGNMENT: usize = 1 << ALIGNMENT_SHIFT;

/// Objects up to this size live in one-page spans and use [`ALIGNMENT`] indices.
pub const MULTI_PAGE_SIZE: usize = 256;

/// Index divisor for objects above [`MULTI_PAGE_SIZE`].
pub const MULTI_PAGE_ALIGNMENT_SHIFT: usize = 6;
pub const MULTI_PAGE_ALIGNMENT: usize = 1 << MULTI_PAGE_ALIGNMENT_SHIFT;

/// Free indices kept directly in the span.
pub const CACHE_SIZE: usize = 4;

/// Object index inside a span.
pub type ObjIdx = u16;

/// End-of-chain marker. No object index may ever take this value.
pub const LIST_END: ObjIdx = ObjIdx::MAX;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MULTI_PAGE_SIZE % ALIGNMENT == 0);
const _: () = assert!(MULTI_PAGE_SIZE < PAGE_SIZE);
const _: () = assert!(MULTI_PAGE_ALIGNMENT > ALIGNMENT);
// Small-mode indices are in-page offsets.
const _: () = assert!(PAGE_SIZE / ALIGNMENT < LIST_END as usize);
// A chain object needs its link slot plus at least one embedded slot.
const _: () = assert!(ALIGNMENT >= 2 * core::mem::size_of::<ObjIdx>());
const _: () = assert!(CACHE_SIZE <= u8::MAX as usize);

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// Index shift used for objects of `size` bytes.
#[inline(always)]
pub const fn index_shift(size: usize) -> usize {
  if size <= MULTI_PAGE_SIZE {
    ALIGNMENT_SHIFT
  } else {
    MULTI_PAGE_ALIGNMENT_SHIFT
  }
}
