//! Allocation-site record attached to sampled spans.

/// Deepest call stack a record keeps.
pub const MAX_STACK_DEPTH: usize = 64;

/// A captured allocation site plus the sizes and sampling weight of the
/// allocation that triggered it. Capture itself happens elsewhere.
#[derive(Clone, Debug)]
pub struct StackTrace {
  /// Size the caller asked for.
  pub requested_size: usize,
  /// Size actually handed out (the object size of the class).
  pub allocated_size: usize,
  /// Sampling weight: bytes of allocation this sample stands for.
  pub weight: usize,
  depth: usize,
  frames: [usize; MAX_STACK_DEPTH],
}

impl StackTrace {
  pub fn new(requested_size: usize, allocated_size: usize, weight: usize) -> Self {
    Self {
      requested_size,
      allocated_size,
      weight,
      depth: 0,
      frames: [0; MAX_STACK_DEPTH],
    }
  }

  /// Builder-style frame setter; frames past [`MAX_STACK_DEPTH`] are dropped.
  pub fn with_frames(mut self, frames: &[usize]) -> Self {
    let depth = frames.len().min(MAX_STACK_DEPTH);
    self.frames[..depth].copy_from_slice(&frames[..depth]);
    self.depth = depth;
    self
  }

  #[inline]
  pub fn frames(&self) -> &[usize] {
    &self.frames[..self.depth]
  }
}

/// Estimated bytes attributable to `stack`.
///
/// With `unsample` the sample is scaled back up to the allocation volume it
/// represents: `weight * allocated_size / (requested_size + 1)`. Otherwise it
/// is just the object size.
#[inline]
pub fn allocated_bytes(stack: &StackTrace, unsample: bool) -> f64 {
  if unsample {
    stack.weight as f64 * stack.allocated_size as f64 / (stack.requested_size as f64 + 1.0)
  } else {
    stack.allocated_size as f64
  }
}
