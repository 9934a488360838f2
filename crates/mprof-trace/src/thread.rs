//! Per-thread profiler state.
//!
//! Every thread owns one [`ThreadState`] in a thread-local slot. The hook
//! only ever touches the calling thread's slot, so nothing here is shared or
//! locked. The slot is const-initialized: first access costs no allocation.
//!
//! A thread moves through `Uninitialized -> Active -> Flushed`. Events that
//! arrive after the flush, while the slot is being destroyed, or re-entrantly
//! while the slot is already borrowed (an allocation made by the flush
//! itself) are dropped.

use core::cell::RefCell;
use core::num::NonZeroUsize;

use crate::config::{self, Config};
use crate::sampler::Sampler;
use crate::sites::{RecordOutcome, SiteTable};
use crate::snapshot::{SnapshotHeader, VERSION};
use crate::writer::{self, FlushOutcome, SkipReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Uninitialized,
    Active,
    Flushed,
}

/// Counters and call-site table for one thread
#[derive(Debug, Clone)]
pub struct ThreadState {
    lifecycle: Lifecycle,
    allocation_count: u64,
    sample_count: u64,
    /// Samples whose site could not get a slot
    overflow_count: u64,
    sampler: Sampler,
    sites: SiteTable,
}

impl ThreadState {
    pub const fn new() -> Self {
        ThreadState {
            lifecycle: Lifecycle::Uninitialized,
            allocation_count: 0,
            sample_count: 0,
            overflow_count: 0,
            sampler: Sampler::UNARMED,
            sites: SiteTable::new(),
        }
    }

    /// Account for one allocation of `size` bytes made from `site` (0 when
    /// the caller is unknown). Returns the number of samples it triggered.
    #[inline]
    pub fn record(&mut self, size: u64, site: usize, stride: u64) -> u64 {
        self.record_with(size, stride, || site)
    }

    /// Like [`ThreadState::record`], with the call site computed only when
    /// the allocation is sampled.
    #[inline]
    pub fn record_with(&mut self, size: u64, stride: u64, site: impl FnOnce() -> usize) -> u64 {
        match self.lifecycle {
            Lifecycle::Active => {}
            Lifecycle::Uninitialized => self.activate(stride),
            Lifecycle::Flushed => return 0,
        }

        self.allocation_count = self.allocation_count.wrapping_add(1);

        let samples = self.sampler.advance(size);
        if samples != 0 {
            self.record_sample(samples, size, site());
        }
        samples
    }

    #[cold]
    fn activate(&mut self, stride: u64) {
        self.sampler = Sampler::new(stride);
        self.lifecycle = Lifecycle::Active;
    }

    #[cold]
    fn record_sample(&mut self, samples: u64, size: u64, site: usize) {
        self.sample_count = self.sample_count.wrapping_add(samples);

        let Some(site) = NonZeroUsize::new(site) else {
            return;
        };
        if self.sites.record(site, samples, size) == RecordOutcome::Overflow {
            self.overflow_count = self.overflow_count.wrapping_add(1);
        }
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn allocation_count(&self) -> u64 {
        self.allocation_count
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow_count
    }

    pub fn bytes_until_next_sample(&self) -> u64 {
        self.sampler.bytes_until_next_sample()
    }

    pub fn sites(&self) -> &SiteTable {
        &self.sites
    }

    /// Nothing was observed on this thread
    pub fn is_empty(&self) -> bool {
        self.allocation_count == 0 && self.sample_count == 0
    }

    pub(crate) fn mark_flushed(&mut self) {
        self.lifecycle = Lifecycle::Flushed;
    }

    /// Header describing the current counters
    pub fn snapshot_header(&self, stride_bytes: u64) -> SnapshotHeader {
        SnapshotHeader {
            version: VERSION,
            stride_bytes,
            alloc_count: self.allocation_count,
            sample_count: self.sample_count,
            overflow_count: self.overflow_count,
            site_count: self.sites.len() as u64,
        }
    }
}

impl Default for ThreadState {
    fn default() -> Self {
        Self::new()
    }
}

struct Slot(RefCell<ThreadState>);

impl Drop for Slot {
    // Runs from the thread's TLS destructors. glibc's `exit` runs them for the
    // exiting thread before the `atexit` handlers, so this is normally what
    // flushes `main` too; the exit handler then finds the slot destroyed.
    fn drop(&mut self) {
        if let Some(config) = config::try_global() {
            writer::flush(self.0.get_mut(), config);
        }
    }
}

thread_local! {
    static STATE: Slot = const { Slot(RefCell::new(ThreadState::new())) };
}

/// Feed one allocation into the calling thread's state using `config`.
///
/// Never blocks, never allocates, never panics.
#[inline]
pub fn record(config: &Config, size: usize, site: usize) {
    record_with(config, size, || site);
}

/// Like [`record`], with the call site computed only when the allocation is
/// sampled.
#[inline]
pub fn record_with(config: &Config, size: usize, site: impl FnOnce() -> usize) {
    if !config.enabled {
        return;
    }
    let stride = config.stride_bytes;
    let _ = STATE.try_with(|slot| {
        if let Ok(mut state) = slot.0.try_borrow_mut() {
            if state.lifecycle == Lifecycle::Uninitialized {
                crate::register_exit_flush();
            }
            state.record_with(size as u64, stride, site);
        }
    });
}

/// Inspect the calling thread's state. Returns `None` if the slot is gone or
/// currently borrowed.
pub fn with_current<R>(f: impl FnOnce(&ThreadState) -> R) -> Option<R> {
    STATE
        .try_with(|slot| slot.0.try_borrow().ok().map(|state| f(&state)))
        .ok()
        .flatten()
}

/// Flush the calling thread's state with `config`.
pub fn flush_current(config: &Config) -> FlushOutcome {
    STATE
        .try_with(|slot| match slot.0.try_borrow_mut() {
            Ok(mut state) => writer::flush(&mut state, config),
            Err(_) => FlushOutcome::Skipped(SkipReason::Busy),
        })
        .unwrap_or(FlushOutcome::Skipped(SkipReason::Busy))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sites::SITE_CAPACITY;

    #[test]
    fn first_allocation_arms_the_budget() {
        let mut state = ThreadState::new();
        assert_eq!(state.lifecycle(), Lifecycle::Uninitialized);
        assert_eq!(state.bytes_until_next_sample(), 0);

        state.record(10, 0x1000, 1024);
        assert_eq!(state.lifecycle(), Lifecycle::Active);
        assert_eq!(state.bytes_until_next_sample(), 1014);
        assert_eq!(state.allocation_count(), 1);
    }

    #[test]
    fn eleventh_small_allocation_samples() {
        let mut state = ThreadState::new();
        for i in 1..=20u64 {
            let samples = state.record(100, 0x4000 + i as usize, 1024);
            assert_eq!(samples, u64::from(i == 11), "allocation #{i}");
            if i == 11 {
                assert_eq!(state.bytes_until_next_sample(), 948);
            }
        }
        assert_eq!(state.sample_count(), 1);
        assert_eq!(state.sites().len(), 1);
        let rec = state.sites().get(0x4000 + 11).unwrap();
        assert_eq!((rec.sample_count, rec.total_bytes), (1, 100));
    }

    #[test]
    fn one_site_update_for_multi_stride_allocation() {
        let mut state = ThreadState::new();
        assert_eq!(state.record(5000, 0xbeef0, 1024), 4);
        assert_eq!(state.bytes_until_next_sample(), 216);

        let rec = state.sites().get(0xbeef0).unwrap();
        assert_eq!(rec.sample_count, 4);
        assert_eq!(rec.total_bytes, 5000);
        assert_eq!(state.sample_count(), 4);
    }

    #[test]
    fn unknown_caller_is_counted_but_not_attributed() {
        let mut state = ThreadState::new();
        state.record(3 * 1024, 0, 1024);
        assert_eq!(state.sample_count(), 3);
        assert!(state.sites().is_empty());
        assert_eq!(state.overflow_count(), 0);
    }

    #[test]
    fn full_table_counts_overflow() {
        let mut state = ThreadState::new();
        for i in 0..=SITE_CAPACITY {
            state.record(1024, 0x10_0000 + i * 16, 1024);
        }
        assert_eq!(state.sites().len(), SITE_CAPACITY);
        assert_eq!(state.overflow_count(), 1);
        assert_eq!(state.sample_count(), SITE_CAPACITY as u64 + 1);

        // existing sites still update
        state.record(2048, 0x10_0000, 1024);
        assert_eq!(state.sites().get(0x10_0000).unwrap().sample_count, 3);
        assert_eq!(state.overflow_count(), 1);
    }

    #[test]
    fn flushed_state_ignores_events() {
        let mut state = ThreadState::new();
        state.record(4096, 0x1, 1024);
        state.mark_flushed();
        assert_eq!(state.record(4096, 0x1, 1024), 0);
        assert_eq!(state.allocation_count(), 1);
    }

    #[test]
    fn tls_record_is_per_thread() {
        let config = Config::enabled(1024);
        let child = std::thread::spawn(move || {
            for _ in 0..10 {
                record(&config, 512, 0x7000);
            }
            with_current(|s| (s.allocation_count(), s.sample_count())).unwrap()
        })
        .join()
        .unwrap();
        assert_eq!(child, (10, 5));
    }

    #[test]
    fn site_is_only_computed_for_samples() {
        let mut state = ThreadState::new();
        let mut computed = 0;
        for _ in 0..10 {
            state.record_with(100, 1024, || {
                computed += 1;
                0x9000
            });
        }
        assert_eq!(computed, 0);
        state.record_with(100, 1024, || {
            computed += 1;
            0x9000
        });
        assert_eq!(computed, 1);
        assert_eq!(state.sites().get(0x9000).unwrap().sample_count, 1);
    }

    #[test]
    fn disabled_config_is_a_no_op() {
        let seen = std::thread::spawn(|| {
            record(&Config::DISABLED, 1 << 20, 0x7000);
            with_current(|s| s.lifecycle()).unwrap()
        })
        .join()
        .unwrap();
        assert_eq!(seen, Lifecycle::Uninitialized);
    }
}
