//! Call-site aggregation table.
//!
//! A fixed-capacity, open-addressed hash table keyed by return address. It
//! lives inside the per-thread state, so it is never shared and never locked.
//! The table never grows: growing would mean allocating from inside the
//! allocator being observed. Once every slot is taken, samples for new
//! addresses are reported as [`RecordOutcome::Overflow`] while addresses that
//! already own a slot keep updating.

use core::num::NonZeroUsize;

/// Number of call-site slots per thread
pub const SITE_CAPACITY: usize = 256;

/// Aggregated samples for one call site
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteRecord {
    /// Return address of the allocating caller (0 = empty slot)
    pub address: usize,
    pub sample_count: u64,
    pub total_bytes: u64,
}

impl SiteRecord {
    pub const EMPTY: SiteRecord = SiteRecord {
        address: 0,
        sample_count: 0,
        total_bytes: 0,
    };

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.address == 0
    }
}

/// What [`SiteTable::record`] did with a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    Updated,
    /// Table full and the address owns no slot
    Overflow,
}

/// Murmur3 64-bit finalizer.
///
/// Code addresses are clustered and their low bits are mostly alignment, so
/// they need a full avalanche before being reduced to a slot index.
#[inline]
pub const fn hash_address(address: usize) -> u64 {
    let mut x = address as u64;
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^= x >> 33;
    x
}

/// Open-addressed call-site table with `N` slots and linear probing.
#[derive(Debug, Clone)]
pub struct SiteTable<const N: usize = SITE_CAPACITY> {
    slots: [SiteRecord; N],
    len: usize,
}

impl<const N: usize> SiteTable<N> {
    pub const fn new() -> Self {
        SiteTable {
            slots: [SiteRecord::EMPTY; N],
            len: 0,
        }
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Number of occupied slots
    #[inline]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Add `samples` and `bytes` to the record for `address`, creating it if
    /// there is room.
    pub fn record(&mut self, address: NonZeroUsize, samples: u64, bytes: u64) -> RecordOutcome {
        if N == 0 {
            return RecordOutcome::Overflow;
        }
        let address = address.get();
        let mut idx = (hash_address(address) % N as u64) as usize;

        for _ in 0..N {
            let slot = &mut self.slots[idx];

            if slot.address == address {
                slot.sample_count = slot.sample_count.wrapping_add(samples);
                slot.total_bytes = slot.total_bytes.wrapping_add(bytes);
                return RecordOutcome::Updated;
            }

            if slot.is_empty() {
                *slot = SiteRecord {
                    address,
                    sample_count: samples,
                    total_bytes: bytes,
                };
                self.len += 1;
                return RecordOutcome::Inserted;
            }

            idx += 1;
            if idx == N {
                idx = 0;
            }
        }

        RecordOutcome::Overflow
    }

    /// Look up the record for `address`.
    pub fn get(&self, address: usize) -> Option<&SiteRecord> {
        if N == 0 || address == 0 {
            return None;
        }
        let mut idx = (hash_address(address) % N as u64) as usize;
        for _ in 0..N {
            let slot = &self.slots[idx];
            if slot.address == address {
                return Some(slot);
            }
            if slot.is_empty() {
                return None;
            }
            idx = (idx + 1) % N;
        }
        None
    }

    /// Occupied records in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &SiteRecord> {
        self.slots.iter().filter(|s| !s.is_empty())
    }
}

impl<const N: usize> Default for SiteTable<N> {
    fn default() -> Self {
        Self::new()
    }
}
