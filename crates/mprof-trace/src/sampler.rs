//! Byte-stride sampling decision.
//!
//! Every allocation consumes its size from a running byte budget. When an
//! allocation exhausts the budget it is sampled, and it counts once for every
//! stride boundary it crosses. Large allocations are therefore sampled in
//! proportion to their size without doing any per-byte work.
//!
//! The decision is deterministic: a fixed allocation sequence always yields
//! the same samples.

/// Running byte budget for one thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sampler {
    stride: u64,
    /// 0 means the sampler was never armed
    bytes_until_next_sample: u64,
}

impl Sampler {
    /// A sampler that has not been armed yet.
    pub const UNARMED: Sampler = Sampler {
        stride: 0,
        bytes_until_next_sample: 0,
    };

    /// Create a sampler with a full budget of `stride` bytes.
    ///
    /// A zero stride is bumped to 1 so the budget can never stall at the
    /// unarmed sentinel.
    pub const fn new(stride: u64) -> Self {
        let stride = if stride == 0 { 1 } else { stride };
        Sampler {
            stride,
            bytes_until_next_sample: stride,
        }
    }

    #[inline]
    pub const fn is_armed(&self) -> bool {
        self.bytes_until_next_sample != 0
    }

    #[inline]
    pub const fn stride(&self) -> u64 {
        self.stride
    }

    #[inline]
    pub const fn bytes_until_next_sample(&self) -> u64 {
        self.bytes_until_next_sample
    }

    /// Consume `size` bytes from the budget and return how many samples the
    /// allocation represents (0 on the fast path).
    ///
    /// Must only be called on an armed sampler.
    #[inline]
    pub fn advance(&mut self, size: u64) -> u64 {
        let remaining = self.bytes_until_next_sample;
        if size < remaining {
            self.bytes_until_next_sample = remaining - size;
            return 0;
        }
        self.cross(size - remaining)
    }

    #[cold]
    #[inline(never)]
    fn cross(&mut self, consumed: u64) -> u64 {
        let samples = 1 + consumed / self.stride;
        self.bytes_until_next_sample = self.stride - consumed % self.stride;
        samples
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::UNARMED
    }
}
