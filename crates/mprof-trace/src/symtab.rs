//! Address ranges of allocator and runtime code in the running executable.
//!
//! A sample taken inside [`crate::ProfilingAllocator`] sits under a stack of
//! `__rust_alloc`, `alloc::raw_vec` and similar frames whose depth depends on
//! the call path and on inlining. Walking up until the first return address
//! outside these ranges lands in the function that asked for memory.
//!
//! The ranges come from the executable's `.symtab`, read once through `mmap`
//! and classified by mangled name, so loading them never touches the heap.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicU8, Ordering};

/// Crates whose frames are never reported as allocation sites
const RUNTIME_CRATES: &[&[u8]] = &[b"alloc", b"core", b"std", b"hashbrown", b"mprof_trace"];

/// Allocator shims emitted by rustc for the global allocator
const SHIM_PREFIXES: &[&[u8]] = &[b"__rust_", b"__rg_", b"__rdl_"];

/// Prefixes stripped from an impl's self type before classifying it
const SELF_TYPE_DECORATIONS: &[&[u8]] = &[
    b"$RF$",
    b"$BP$",
    b"mut$u20$",
    b"const$u20$",
    b"dyn$u20$",
    b"$u5b$",
];

const IMPL_AS: &[u8] = b"$u20$as$u20$";

/// Merged ranges kept for the executable
pub const RANGE_CAPACITY: usize = 16 * 1024;

/// Half-open `[start, end)` range of code addresses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CodeRange {
    pub start: usize,
    pub end: usize,
}

/// Fixed-capacity set of code ranges.
///
/// Inserts append; [`RangeSet::compact`] sorts and merges in place and must
/// run before [`RangeSet::contains`] is used.
pub struct RangeSet<const N: usize> {
    ranges: [CodeRange; N],
    len: usize,
    dropped: usize,
}

impl<const N: usize> RangeSet<N> {
    const EMPTY: CodeRange = CodeRange { start: 0, end: 0 };

    pub const fn new() -> Self {
        RangeSet {
            ranges: [Self::EMPTY; N],
            len: 0,
            dropped: 0,
        }
    }

    /// Add `[start, end)`. When the set is full even after merging, the range
    /// is counted in [`RangeSet::dropped`] instead.
    pub fn insert(&mut self, start: usize, end: usize) {
        if end <= start {
            return;
        }
        if self.len == N {
            self.compact();
        }
        if self.len == N {
            self.dropped += 1;
            return;
        }
        self.ranges[self.len] = CodeRange { start, end };
        self.len += 1;
    }

    /// Sort by start and merge overlapping or touching ranges.
    pub fn compact(&mut self) {
        self.ranges[..self.len].sort_unstable_by_key(|r| r.start);

        let mut merged = 0;
        for i in 0..self.len {
            let range = self.ranges[i];
            if merged > 0 && range.start <= self.ranges[merged - 1].end {
                let last = &mut self.ranges[merged - 1];
                last.end = last.end.max(range.end);
            } else {
                self.ranges[merged] = range;
                merged += 1;
            }
        }
        self.len = merged;
    }

    pub fn contains(&self, addr: usize) -> bool {
        let ranges = &self.ranges[..self.len];
        let idx = ranges.partition_point(|r| r.start <= addr);
        idx > 0 && addr < ranges[idx - 1].end
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Ranges that did not fit
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl<const N: usize> Default for RangeSet<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether a symbol table name belongs to allocator or runtime code.
///
/// Works on legacy (`_ZN`) mangled names. Trait impls count as runtime code
/// when their self type lives in a runtime crate, or when the self type is a
/// primitive or generic parameter and the trait lives in one.
pub fn is_runtime_symbol(name: &[u8]) -> bool {
    if SHIM_PREFIXES.iter().any(|p| name.starts_with(p)) {
        return true;
    }
    let Some(ident) = leading_ident(name) else {
        return false;
    };
    match ident.strip_prefix(b"_$LT$") {
        Some(impl_path) => impl_is_runtime(impl_path),
        None => RUNTIME_CRATES.iter().any(|krate| *krate == ident),
    }
}

/// First path component of a legacy mangled name.
fn leading_ident(name: &[u8]) -> Option<&[u8]> {
    let rest = name.strip_prefix(b"_ZN")?;
    let digits = rest.iter().take_while(|b| b.is_ascii_digit()).count();
    let len: usize = core::str::from_utf8(&rest[..digits]).ok()?.parse().ok()?;
    rest.get(digits..digits.checked_add(len)?)
}

fn impl_is_runtime(path: &[u8]) -> bool {
    let mut self_ty = path;
    while let Some(rest) = SELF_TYPE_DECORATIONS
        .iter()
        .find_map(|d| self_ty.strip_prefix(*d))
    {
        self_ty = rest;
    }

    let (self_ty, trait_path) = match find(self_ty, IMPL_AS) {
        Some(idx) => (&self_ty[..idx], Some(&self_ty[idx + IMPL_AS.len()..])),
        None => (self_ty, None),
    };

    if in_runtime_crate(self_ty) {
        return true;
    }
    match trait_path {
        Some(trait_path) if find(self_ty, b"..").is_none() => in_runtime_crate(trait_path),
        _ => false,
    }
}

fn in_runtime_crate(path: &[u8]) -> bool {
    RUNTIME_CRATES.iter().any(|krate| {
        path.strip_prefix(*krate)
            .is_some_and(|rest| rest.starts_with(b".."))
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

const STATE_UNLOADED: u8 = 0;
const STATE_LOADING: u8 = 1;
const STATE_LOADED: u8 = 2;

struct RuntimeCode {
    state: AtomicU8,
    ranges: UnsafeCell<RangeSet<RANGE_CAPACITY>>,
}

// `ranges` is written only by the thread that moved `state` to LOADING, and
// read only after LOADED is released.
unsafe impl Sync for RuntimeCode {}

static RUNTIME_CODE: RuntimeCode = RuntimeCode {
    state: AtomicU8::new(STATE_UNLOADED),
    ranges: UnsafeCell::new(RangeSet::new()),
};

/// Runtime code ranges of the executable, loading them on first use.
///
/// Returns `None` while another thread is loading. Empty when the executable
/// cannot be read or is not a 64-bit little-endian ELF file.
pub fn runtime_code() -> Option<&'static RangeSet<RANGE_CAPACITY>> {
    match RUNTIME_CODE.state.load(Ordering::Acquire) {
        STATE_LOADED => return Some(unsafe { &*RUNTIME_CODE.ranges.get() }),
        STATE_LOADING => return None,
        _ => {}
    }

    if RUNTIME_CODE
        .state
        .compare_exchange(
            STATE_UNLOADED,
            STATE_LOADING,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        return match RUNTIME_CODE.state.load(Ordering::Acquire) {
            STATE_LOADED => Some(unsafe { &*RUNTIME_CODE.ranges.get() }),
            _ => None,
        };
    }

    {
        let ranges = unsafe { &mut *RUNTIME_CODE.ranges.get() };
        load_executable(ranges);
        ranges.compact();
    }
    RUNTIME_CODE.state.store(STATE_LOADED, Ordering::Release);
    Some(unsafe { &*RUNTIME_CODE.ranges.get() })
}

#[cfg(target_os = "linux")]
fn load_executable<const N: usize>(ranges: &mut RangeSet<N>) {
    let Some(image) = MappedFile::open(c"/proc/self/exe") else {
        return;
    };
    let at_phdr = unsafe { libc::getauxval(libc::AT_PHDR) } as usize;
    if at_phdr == 0 {
        return;
    }
    let _ = scan_elf(image.bytes(), at_phdr, ranges);
}

#[cfg(not(target_os = "linux"))]
fn load_executable<const N: usize>(_ranges: &mut RangeSet<N>) {}

/// Read-only private mapping of a whole file
#[cfg(target_os = "linux")]
struct MappedFile {
    ptr: *mut libc::c_void,
    len: usize,
}

#[cfg(target_os = "linux")]
impl MappedFile {
    fn open(path: &core::ffi::CStr) -> Option<Self> {
        unsafe {
            let fd = libc::open(path.as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC);
            if fd < 0 {
                return None;
            }
            let mut stat: libc::stat = core::mem::zeroed();
            let len = if libc::fstat(fd, &mut stat) == 0 {
                stat.st_size as usize
            } else {
                0
            };
            let ptr = if len > 0 {
                libc::mmap(
                    core::ptr::null_mut(),
                    len,
                    libc::PROT_READ,
                    libc::MAP_PRIVATE,
                    fd,
                    0,
                )
            } else {
                libc::MAP_FAILED
            };
            libc::close(fd);
            if ptr == libc::MAP_FAILED {
                return None;
            }
            Some(MappedFile { ptr, len })
        }
    }

    fn bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

#[cfg(target_os = "linux")]
impl Drop for MappedFile {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr, self.len);
        }
    }
}

const PT_LOAD: u32 = 1;
const PT_PHDR: u32 = 6;
const SHT_SYMTAB: u32 = 2;
const STT_FUNC: u8 = 2;
const SYMBOL_SIZE: usize = 24;

/// Add the runtime functions of an ELF64 little-endian `image` to `out`,
/// relocated by the load bias derived from the runtime address of its
/// program headers (`AT_PHDR`).
pub fn scan_elf<const N: usize>(image: &[u8], at_phdr: usize, out: &mut RangeSet<N>) -> Option<()> {
    if image.get(..4)? != b"\x7fELF" || *image.get(4)? != 2 || *image.get(5)? != 1 {
        return None;
    }
    let phoff = read_u64(image, 0, 0x20)? as usize;
    let shoff = read_u64(image, 0, 0x28)? as usize;
    let phentsize = read_u16(image, 0, 0x36)? as usize;
    let phnum = read_u16(image, 0, 0x38)? as usize;
    let shentsize = read_u16(image, 0, 0x3a)? as usize;
    let shnum = read_u16(image, 0, 0x3c)? as usize;

    let bias = load_bias(image, phoff, phentsize, phnum, at_phdr)?;

    for i in 0..shnum {
        let header = shoff.checked_add(i.checked_mul(shentsize)?)?;
        if read_u32(image, header, 4)? != SHT_SYMTAB {
            continue;
        }
        let symbols = section(image, header)?;
        let link = read_u32(image, header, 0x28)? as usize;
        let strings = section(image, shoff.checked_add(link.checked_mul(shentsize)?)?)?;
        let entsize = read_u64(image, header, 0x38)? as usize;
        if entsize < SYMBOL_SIZE {
            continue;
        }

        for symbol in symbols.chunks_exact(entsize) {
            if symbol[4] & 0xf != STT_FUNC {
                continue;
            }
            let value = read_u64(symbol, 0, 8)? as usize;
            let size = read_u64(symbol, 0, 16)? as usize;
            if value == 0 || size == 0 {
                continue;
            }
            let name = c_str_at(strings, read_u32(symbol, 0, 0)? as usize);
            if is_runtime_symbol(name) {
                let start = value.wrapping_add(bias);
                out.insert(start, start.saturating_add(size));
            }
        }
    }
    Some(())
}

fn load_bias(
    image: &[u8],
    phoff: usize,
    phentsize: usize,
    phnum: usize,
    at_phdr: usize,
) -> Option<usize> {
    let mut phdr_vaddr = None;
    for i in 0..phnum {
        let header = phoff.checked_add(i.checked_mul(phentsize)?)?;
        let p_type = read_u32(image, header, 0)?;
        let p_offset = read_u64(image, header, 8)?;
        let p_vaddr = read_u64(image, header, 0x10)?;
        match p_type {
            PT_PHDR => {
                phdr_vaddr = Some(p_vaddr);
                break;
            }
            PT_LOAD if p_offset == 0 && phdr_vaddr.is_none() => {
                phdr_vaddr = Some(p_vaddr.wrapping_add(phoff as u64));
            }
            _ => {}
        }
    }
    Some(at_phdr.wrapping_sub(phdr_vaddr? as usize))
}

/// File contents of the section whose header starts at `header`
fn section(image: &[u8], header: usize) -> Option<&[u8]> {
    let offset = read_u64(image, header, 0x18)? as usize;
    let size = read_u64(image, header, 0x20)? as usize;
    image.get(offset..offset.checked_add(size)?)
}

fn c_str_at(strings: &[u8], offset: usize) -> &[u8] {
    let tail = strings.get(offset..).unwrap_or(&[]);
    let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
    &tail[..end]
}

fn read_bytes<const W: usize>(bytes: &[u8], base: usize, field: usize) -> Option<[u8; W]> {
    let start = base.checked_add(field)?;
    bytes.get(start..start.checked_add(W)?)?.try_into().ok()
}

fn read_u16(bytes: &[u8], base: usize, field: usize) -> Option<u16> {
    read_bytes(bytes, base, field).map(u16::from_le_bytes)
}

fn read_u32(bytes: &[u8], base: usize, field: usize) -> Option<u32> {
    read_bytes(bytes, base, field).map(u32::from_le_bytes)
}

fn read_u64(bytes: &[u8], base: usize, field: usize) -> Option<u64> {
    read_bytes(bytes, base, field).map(u64::from_le_bytes)
}
