//! Caller address capture by walking frame pointers.
//!
//! Build the profiled program with `-C force-frame-pointers=yes`; without
//! frame pointers the walk stops early and the caller is reported as 0
//! (counted, but not attributed to a site).

use crate::symtab;

/// Longest walk [`allocating_caller`] makes before giving up
pub const MAX_WALK: usize = 64;

/// Return addresses of the frames above a frame pointer, innermost first.
///
/// Each hop is checked for alignment, range and upward progress; a corrupted
/// chain ends the iteration.
pub struct Frames {
    fp: *const usize,
}

impl Frames {
    /// # Safety
    ///
    /// `fp` must be null or point into a frame-pointer chain on the current
    /// thread's stack.
    pub unsafe fn from_frame_pointer(fp: *const usize) -> Self {
        Frames { fp }
    }
}

impl Iterator for Frames {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if !plausible(self.fp) {
            return None;
        }
        // [fp] is the caller's saved frame pointer, [fp + 1] the return address
        let ret = unsafe { *self.fp.add(1) };
        let next = unsafe { *self.fp } as *const usize;
        self.fp = if next > self.fp {
            next
        } else {
            core::ptr::null()
        };
        (ret != 0).then_some(ret)
    }
}

/// Return address `skip` frames above the function this is inlined into, or
/// 0 when it cannot be determined.
///
/// With `skip == 0` this is the return address into the immediate caller.
#[inline(always)]
pub fn caller_address(skip: usize) -> usize {
    let fp = current_frame_pointer();
    unsafe { Frames::from_frame_pointer(fp) }
        .nth(skip)
        .unwrap_or(0)
}

/// First return address on the current stack that lies outside allocator and
/// runtime code (see [`symtab`]).
///
/// Returns 0 when the walk ends first, or while another thread is still
/// loading the executable's code ranges.
#[inline(never)]
pub fn allocating_caller() -> usize {
    let Some(runtime) = symtab::runtime_code() else {
        return 0;
    };
    let fp = current_frame_pointer();
    unsafe { Frames::from_frame_pointer(fp) }
        .take(MAX_WALK)
        .find(|&ret| !runtime.contains(ret))
        .unwrap_or(0)
}

#[inline(always)]
fn current_frame_pointer() -> *const usize {
    #[cfg(target_arch = "x86_64")]
    {
        let fp: *const usize;
        unsafe {
            core::arch::asm!(
                "mov {}, rbp",
                out(reg) fp,
                options(nomem, nostack, preserves_flags)
            );
        }
        fp
    }

    #[cfg(target_arch = "aarch64")]
    {
        let fp: *const usize;
        unsafe {
            core::arch::asm!(
                "mov {}, x29",
                out(reg) fp,
                options(nomem, nostack, preserves_flags)
            );
        }
        fp
    }

    #[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
    {
        core::ptr::null()
    }
}

#[inline(always)]
fn plausible(fp: *const usize) -> bool {
    let addr = fp as usize;
    addr & (core::mem::align_of::<usize>() - 1) == 0 && (0x1000..=0x7fff_ffff_ffff).contains(&addr)
}
