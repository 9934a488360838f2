//! Process-wide profiler configuration.
//!
//! The configuration is resolved once, on the first allocation any thread
//! observes, and is immutable afterwards. Resolution goes through `getenv`
//! and parses in place: building a `String` here would re-enter the
//! allocator that is asking for the configuration.
//!
//! | Variable      | Meaning                                              |
//! |---------------|------------------------------------------------------|
//! | `MPROF`       | `1` enables profiling, anything else disables it     |
//! | `MPROF_BYTES` | sampling stride in bytes, decimal, at least 1024     |
//! | `MPROF_STATS` | `1` prints a stats line per thread at flush          |
//! | `MPROF_OUT`   | snapshot file prefix, `{prefix}.{pid}.{tid}.bin`     |

use core::cell::UnsafeCell;
use core::ffi::CStr;
use core::mem::MaybeUninit;
use core::ops::Deref;
use core::sync::atomic::{AtomicU8, Ordering};

pub const ENV_ENABLE: &CStr = c"MPROF";
pub const ENV_STRIDE: &CStr = c"MPROF_BYTES";
pub const ENV_STATS: &CStr = c"MPROF_STATS";
pub const ENV_OUTPUT: &CStr = c"MPROF_OUT";

/// Default sampling stride (512 KiB)
pub const DEFAULT_STRIDE_BYTES: u64 = 512 * 1024;

/// Smallest stride accepted from the environment
pub const MIN_STRIDE_BYTES: u64 = 1024;

/// Longest output prefix that fits in [`OutputPrefix`]
pub const PREFIX_CAPACITY: usize = 512;

/// Snapshot file prefix stored inline so the configuration owns no heap memory.
#[derive(Clone, Copy)]
pub struct OutputPrefix {
    buf: [u8; PREFIX_CAPACITY],
    len: usize,
}

impl OutputPrefix {
    /// Returns `None` for an empty prefix or one that does not fit.
    pub fn new(bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > PREFIX_CAPACITY || bytes.contains(&0) {
            return None;
        }
        let mut buf = [0u8; PREFIX_CAPACITY];
        buf[..bytes.len()].copy_from_slice(bytes);
        Some(OutputPrefix {
            buf,
            len: bytes.len(),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl PartialEq for OutputPrefix {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for OutputPrefix {}

impl core::fmt::Debug for OutputPrefix {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("OutputPrefix")
            .field(&String::from_utf8_lossy(self.as_bytes()))
            .finish()
    }
}

/// Resolved profiler configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub enabled: bool,
    pub stride_bytes: u64,
    pub emit_stats: bool,
    pub output_prefix: Option<OutputPrefix>,
}

impl Config {
    /// Profiling off. Used for every thread when `MPROF` is not `1`.
    pub const DISABLED: Config = Config {
        enabled: false,
        stride_bytes: DEFAULT_STRIDE_BYTES,
        emit_stats: false,
        output_prefix: None,
    };

    /// Profiling on with the default stride and no outputs.
    pub const fn enabled(stride_bytes: u64) -> Self {
        Config {
            enabled: true,
            stride_bytes,
            emit_stats: false,
            output_prefix: None,
        }
    }

    /// Resolve from an arbitrary variable lookup.
    ///
    /// Malformed values never fail: a bad stride falls back to the default,
    /// anything but `1` in a flag leaves it off.
    pub fn from_lookup<'a, F>(lookup: F) -> Self
    where
        F: Fn(&CStr) -> Option<&'a [u8]>,
    {
        if !is_on(lookup(ENV_ENABLE)) {
            return Config::DISABLED;
        }

        let stride_bytes = lookup(ENV_STRIDE)
            .and_then(parse_stride)
            .unwrap_or(DEFAULT_STRIDE_BYTES);

        Config {
            enabled: true,
            stride_bytes,
            emit_stats: is_on(lookup(ENV_STATS)),
            output_prefix: lookup(ENV_OUTPUT).and_then(OutputPrefix::new),
        }
    }

    /// Resolve from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(getenv)
    }

    /// Whether flushing a thread can produce any output.
    pub fn has_destination(&self) -> bool {
        self.emit_stats || self.output_prefix.is_some()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::DISABLED
    }
}

fn getenv(name: &CStr) -> Option<&'static [u8]> {
    // The environment is treated as immutable once profiling starts; the
    // returned slice is only read during resolution and copied out.
    let ptr = unsafe { libc::getenv(name.as_ptr()) };
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_bytes())
}

fn is_on(value: Option<&[u8]>) -> bool {
    value == Some(b"1".as_slice())
}

/// Parse a decimal stride. Rejects trailing garbage and values below
/// [`MIN_STRIDE_BYTES`].
pub fn parse_stride(raw: &[u8]) -> Option<u64> {
    let text = core::str::from_utf8(raw).ok()?;
    if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u64 = text.parse().ok()?;
    (value >= MIN_STRIDE_BYTES).then_some(value)
}

const STATE_UNINIT: u8 = 0;
const STATE_RESOLVING: u8 = 1;
const STATE_READY: u8 = 2;

/// Lazily resolved, write-once configuration slot.
///
/// One thread wins the right to publish. Threads that arrive while it is
/// resolving do not wait: they resolve a private copy from the same input,
/// which yields the same values.
pub struct ConfigCell {
    state: AtomicU8,
    value: UnsafeCell<MaybeUninit<Config>>,
}

// The value is written once before `STATE_READY` is released and never again.
unsafe impl Sync for ConfigCell {}

impl ConfigCell {
    pub const fn new() -> Self {
        ConfigCell {
            state: AtomicU8::new(STATE_UNINIT),
            value: UnsafeCell::new(MaybeUninit::uninit()),
        }
    }

    /// The published configuration, if any.
    #[inline]
    pub fn get(&self) -> Option<&Config> {
        if self.state.load(Ordering::Acquire) == STATE_READY {
            Some(unsafe { (*self.value.get()).assume_init_ref() })
        } else {
            None
        }
    }

    /// Return the published configuration, resolving it with `resolve` first
    /// if nobody has.
    #[inline]
    pub fn get_or_resolve<F>(&self, resolve: F) -> Resolved<'_>
    where
        F: FnOnce() -> Config,
    {
        if let Some(config) = self.get() {
            return Resolved::Shared(config);
        }
        self.resolve_slow(resolve)
    }

    #[cold]
    fn resolve_slow<F>(&self, resolve: F) -> Resolved<'_>
    where
        F: FnOnce() -> Config,
    {
        let won = self
            .state
            .compare_exchange(
                STATE_UNINIT,
                STATE_RESOLVING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();

        let config = resolve();
        if !won {
            return match self.get() {
                Some(published) => Resolved::Shared(published),
                None => Resolved::Private(config),
            };
        }

        unsafe { (*self.value.get()).write(config) };
        self.state.store(STATE_READY, Ordering::Release);
        Resolved::Shared(unsafe { (*self.value.get()).assume_init_ref() })
    }
}

impl Default for ConfigCell {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration handed to a caller by [`ConfigCell::get_or_resolve`].
pub enum Resolved<'a> {
    Shared(&'a Config),
    /// Resolved concurrently with the publishing thread
    Private(Config),
}

impl Deref for Resolved<'_> {
    type Target = Config;

    fn deref(&self) -> &Config {
        match self {
            Resolved::Shared(config) => config,
            Resolved::Private(config) => config,
        }
    }
}

static GLOBAL: ConfigCell = ConfigCell::new();

/// The process configuration, read from the environment on first use.
#[inline]
pub fn global() -> Resolved<'static> {
    GLOBAL.get_or_resolve(Config::from_env)
}

/// The process configuration if it has already been resolved.
#[inline]
pub fn try_global() -> Option<&'static Config> {
    GLOBAL.get()
}
