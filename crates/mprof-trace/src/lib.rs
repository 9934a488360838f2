//! Size-weighted allocation sampling with per-thread call-site aggregation.
//!
//! Every allocation consumes its size from a per-thread byte budget. When the
//! budget runs out the allocation is sampled and attributed to the address it
//! was requested from. At exit, each thread writes a compact binary snapshot
//! that the `mprof` CLI can rank and symbolize.
//!
//! # Usage
//!
//! Install the sampling allocator:
//! ```rust,ignore
//! mprof_trace::profiler!();
//! ```
//!
//! Or call the hook from your own allocator after every successful
//! allocation:
//! ```rust,ignore
//! mprof_trace::on_alloc(size, ptr);
//! ```
//!
//! Then run with the profiler switched on:
//! ```bash
//! MPROF=1 MPROF_BYTES=65536 MPROF_OUT=/tmp/app ./app
//! mprof top /tmp/app.<pid>.<tid>.bin -e ./app
//! ```
//!
//! Build with frame pointers so call sites can be attributed:
//! ```bash
//! RUSTFLAGS="-C force-frame-pointers=yes" cargo build --release
//! ```
//!
//! The hook never takes a lock and never allocates. Each thread's state is
//! flushed by its TLS destructor when it exits. On glibc, `exit` runs the
//! destructors of the exiting thread (normally `main`) before the `atexit`
//! handlers, so that thread is flushed the same way; an `atexit` callback
//! registered on the first recorded allocation covers platforms where it is
//! not. Threads that are torn down without running their TLS destructors lose
//! their data unless the host calls [`flush_current_thread`] itself.

pub mod callsite;
pub mod config;
pub mod sampler;
pub mod sites;
pub mod snapshot;
pub mod symtab;
pub mod thread;
pub mod writer;

use core::sync::atomic::{AtomicBool, Ordering};

pub use config::Config;
pub use snapshot::{Snapshot, SnapshotError, SnapshotHeader, SnapshotSite};
pub use writer::{FlushOutcome, SkipReason};

/// Record an allocation of `size` bytes attributed to the immediate caller
/// of the allocator function that calls this hook.
///
/// The hook is inlined into that function, which must keep its own frame
/// (`#[inline(never)]`, built with frame pointers). `_ptr` is the address
/// handed out by the allocator; it is accepted for allocator integrations but
/// not needed for aggregation.
#[inline(always)]
pub fn on_alloc(size: usize, _ptr: *mut u8) {
    #[cfg(feature = "heap")]
    record_alloc_at(size, callsite::caller_address(0));

    #[cfg(not(feature = "heap"))]
    let _ = size;
}

/// Record an allocation of `size` bytes made from `site` (0 if unknown).
#[inline]
pub fn record_alloc_at(size: usize, site: usize) {
    #[cfg(feature = "heap")]
    thread::record(&config::global(), size, site);

    #[cfg(not(feature = "heap"))]
    let _ = (size, site);
}

/// Flush the calling thread's state now, using the process configuration.
pub fn flush_current_thread() -> FlushOutcome {
    match config::try_global() {
        Some(config) => thread::flush_current(config),
        None => FlushOutcome::Skipped(SkipReason::Disabled),
    }
}

static EXIT_HOOK_REGISTERED: AtomicBool = AtomicBool::new(false);

extern "C" fn flush_at_exit() {
    let _ = flush_current_thread();
}

/// Register the process exit flush. Only the first call has an effect.
pub(crate) fn register_exit_flush() {
    if EXIT_HOOK_REGISTERED.swap(true, Ordering::AcqRel) {
        return;
    }
    unsafe {
        libc::atexit(flush_at_exit);
    }
}

/// A sampling allocator that wraps another allocator (the system allocator
/// by default).
///
/// With the `heap` feature enabled, every successful `alloc`, `alloc_zeroed`
/// and `realloc` is fed to the sampler. A sampled allocation is attributed to
/// the first frame above the allocator that is not `std`, `alloc`, `core` or
/// allocator shim code (see [`callsite::allocating_caller`]). Without the
/// feature this is a passthrough.
pub struct ProfilingAllocator<A = std::alloc::System> {
    inner: A,
}

impl ProfilingAllocator<std::alloc::System> {
    pub const fn new() -> Self {
        ProfilingAllocator {
            inner: std::alloc::System,
        }
    }
}

impl<A> ProfilingAllocator<A> {
    /// Sample allocations served by `inner`.
    pub const fn wrap(inner: A) -> Self {
        ProfilingAllocator { inner }
    }
}

impl Default for ProfilingAllocator<std::alloc::System> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(not(feature = "heap"))]
mod disabled {
    use super::ProfilingAllocator;
    use core::alloc::{GlobalAlloc, Layout};

    unsafe impl<A: GlobalAlloc> GlobalAlloc for ProfilingAllocator<A> {
        #[inline]
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            unsafe { self.inner.alloc(layout) }
        }

        #[inline]
        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            unsafe { self.inner.dealloc(ptr, layout) }
        }

        #[inline]
        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            unsafe { self.inner.realloc(ptr, layout, new_size) }
        }

        #[inline]
        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            unsafe { self.inner.alloc_zeroed(layout) }
        }
    }
}

#[cfg(feature = "heap")]
mod enabled {
    use super::ProfilingAllocator;
    use crate::callsite::allocating_caller;
    use crate::{config, thread};
    use core::alloc::{GlobalAlloc, Layout};

    #[inline(always)]
    fn sample(size: usize) {
        thread::record_with(&config::global(), size, allocating_caller);
    }

    unsafe impl<A: GlobalAlloc> GlobalAlloc for ProfilingAllocator<A> {
        #[inline]
        unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
            let ptr = unsafe { self.inner.alloc(layout) };
            if !ptr.is_null() {
                sample(layout.size());
            }
            ptr
        }

        #[inline]
        unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
            unsafe { self.inner.dealloc(ptr, layout) }
        }

        #[inline]
        unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
            let new_ptr = unsafe { self.inner.realloc(ptr, layout, new_size) };
            if !new_ptr.is_null() {
                sample(new_size);
            }
            new_ptr
        }

        #[inline]
        unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
            let ptr = unsafe { self.inner.alloc_zeroed(layout) };
            if !ptr.is_null() {
                sample(layout.size());
            }
            ptr
        }
    }
}

/// Install [`ProfilingAllocator`] over the system allocator as the global
/// allocator.
///
/// Sampling is still gated at runtime by the `MPROF` environment variable.
/// When the `heap` feature is disabled, it expands to nothing.
///
/// ```rust,ignore
/// mprof_trace::profiler!();
/// ```
#[macro_export]
#[cfg(feature = "heap")]
macro_rules! profiler {
    () => {
        #[global_allocator]
        static __MPROF_ALLOC: $crate::ProfilingAllocator = $crate::ProfilingAllocator::new();
    };
}

/// No-op when the heap feature is disabled
#[macro_export]
#[cfg(not(feature = "heap"))]
macro_rules! profiler {
    () => {};
}
