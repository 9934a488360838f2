//! Exit-time export of one thread's state.
//!
//! Flushing is best effort. A file that cannot be created or written is
//! dropped silently; the profiled program must behave exactly as it would
//! without the profiler.

use core::fmt::{self, Write as _};
use std::fs::OpenOptions;
use std::io::{self, BufWriter};
use std::os::unix::ffi::OsStringExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::config::{Config, OutputPrefix};
use crate::snapshot::write_snapshot;
use crate::thread::{Lifecycle, ThreadState};

/// Result of [`flush`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    Written,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Profiling is off for this process
    Disabled,
    /// The thread never allocated
    Empty,
    /// Neither stats nor snapshot files are configured
    NoDestination,
    AlreadyFlushed,
    /// The thread's state is borrowed or already destroyed
    Busy,
}

/// Export `state` according to `config` and move it to `Flushed`.
///
/// Emits the stats line when `emit_stats` is set and writes
/// `{prefix}.{pid}.{tid}.bin` when an output prefix is configured.
pub fn flush(state: &mut ThreadState, config: &Config) -> FlushOutcome {
    if !config.enabled {
        return FlushOutcome::Skipped(SkipReason::Disabled);
    }
    if state.lifecycle() == Lifecycle::Flushed {
        return FlushOutcome::Skipped(SkipReason::AlreadyFlushed);
    }
    if state.is_empty() {
        return FlushOutcome::Skipped(SkipReason::Empty);
    }

    state.mark_flushed();

    if !config.has_destination() {
        return FlushOutcome::Skipped(SkipReason::NoDestination);
    }

    let tid = thread_id();

    if config.emit_stats {
        emit_stats_line(state, config.stride_bytes, tid);
    }

    if let Some(prefix) = &config.output_prefix {
        let path = snapshot_path(prefix, std::process::id(), tid);
        let _ = write_snapshot_file(&path, state, config.stride_bytes);
    }

    FlushOutcome::Written
}

/// `{prefix}.{pid}.{tid}.bin`
pub fn snapshot_path(prefix: &OutputPrefix, pid: u32, tid: u64) -> PathBuf {
    let mut name = prefix.as_bytes().to_vec();
    name.extend_from_slice(format!(".{pid}.{tid}.bin").as_bytes());
    PathBuf::from(std::ffi::OsString::from_vec(name))
}

/// Write `state` as a snapshot at `path`, replacing any existing file.
pub fn write_snapshot_file(path: &Path, state: &ThreadState, stride_bytes: u64) -> io::Result<()> {
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)?;
    let mut out = BufWriter::new(file);
    write_snapshot(&mut out, &state.snapshot_header(stride_bytes), state.sites().iter())
}

/// Kernel thread id on Linux, `pthread_self` elsewhere.
pub fn thread_id() -> u64 {
    #[cfg(target_os = "linux")]
    {
        (unsafe { libc::syscall(libc::SYS_gettid) }) as u64
    }

    #[cfg(not(target_os = "linux"))]
    {
        (unsafe { libc::pthread_self() }) as usize as u64
    }
}

/// Fixed-capacity line buffer so the stats line needs no heap.
struct LineBuf {
    buf: [u8; 256],
    len: usize,
}

impl LineBuf {
    const fn new() -> Self {
        LineBuf {
            buf: [0; 256],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for LineBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let bytes = s.as_bytes();
        let end = self.len.checked_add(bytes.len()).ok_or(fmt::Error)?;
        if end > self.buf.len() {
            return Err(fmt::Error);
        }
        self.buf[self.len..end].copy_from_slice(bytes);
        self.len = end;
        Ok(())
    }
}

fn format_stats_line(line: &mut LineBuf, state: &ThreadState, stride_bytes: u64, tid: u64) -> fmt::Result {
    writeln!(
        line,
        "mprof stats: thread={} alloc_count={} sample_count={} stride={} site_overflow={}",
        tid,
        state.allocation_count(),
        state.sample_count(),
        stride_bytes,
        state.overflow_count()
    )
}

fn emit_stats_line(state: &ThreadState, stride_bytes: u64, tid: u64) {
    let mut line = LineBuf::new();
    if format_stats_line(&mut line, state, stride_bytes, tid).is_err() {
        return;
    }
    let bytes = line.as_bytes();
    unsafe {
        libc::write(libc::STDERR_FILENO, bytes.as_ptr().cast(), bytes.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::Snapshot;
    use std::fmt::Write as _;

    fn busy_state() -> ThreadState {
        let mut state = ThreadState::new();
        state.record(5000, 0xa000, 1024);
        state.record(100, 0xb000, 1024);
        state.record(2048, 0xa000, 1024);
        state
    }

    fn config_with_prefix(prefix: &Path) -> Config {
        Config {
            output_prefix: OutputPrefix::new(prefix.as_os_str().as_encoded_bytes()),
            ..Config::enabled(1024)
        }
    }

    #[test]
    fn stats_line_format() {
        let state = busy_state();
        let mut line = LineBuf::new();
        format_stats_line(&mut line, &state, 1024, 4242).unwrap();
        assert_eq!(
            std::str::from_utf8(line.as_bytes()).unwrap(),
            "mprof stats: thread=4242 alloc_count=3 sample_count=6 stride=1024 site_overflow=0\n"
        );
    }

    #[test]
    fn line_buffer_refuses_to_overflow() {
        let mut line = LineBuf::new();
        assert!(line.write_str(&"x".repeat(300)).is_err());
        assert_eq!(line.as_bytes().len(), 0);
    }

    #[test]
    fn snapshot_file_name() {
        let prefix = OutputPrefix::new(b"/tmp/run").unwrap();
        assert_eq!(snapshot_path(&prefix, 77, 1234), PathBuf::from("/tmp/run.77.1234.bin"));
    }

    #[test]
    fn writes_a_parseable_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_prefix(&dir.path().join("prof"));
        let mut state = busy_state();

        assert_eq!(flush(&mut state, &config), FlushOutcome::Written);
        assert_eq!(state.lifecycle(), Lifecycle::Flushed);

        let path = snapshot_path(config.output_prefix.as_ref().unwrap(), std::process::id(), thread_id());
        let snapshot = Snapshot::read(&path).unwrap();
        assert_eq!(snapshot.header.alloc_count, 3);
        assert_eq!(snapshot.header.sample_count, 6);
        assert_eq!(snapshot.header.stride_bytes, 1024);
        assert_eq!(snapshot.header.overflow_count, 0);

        let mut sites: Vec<_> = snapshot
            .sites
            .iter()
            .map(|s| (s.address, s.sample_count, s.total_bytes))
            .collect();
        sites.sort_unstable();
        assert_eq!(sites, vec![(0xa000, 6, 7048)]);
    }

    #[test]
    fn flushes_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_prefix(&dir.path().join("once"));
        let mut state = busy_state();
        assert_eq!(flush(&mut state, &config), FlushOutcome::Written);
        assert_eq!(
            flush(&mut state, &config),
            FlushOutcome::Skipped(SkipReason::AlreadyFlushed)
        );
    }

    #[test]
    fn skips_empty_threads_and_missing_destinations() {
        let mut empty = ThreadState::new();
        assert_eq!(
            flush(&mut empty, &Config::enabled(1024)),
            FlushOutcome::Skipped(SkipReason::Empty)
        );

        let mut state = busy_state();
        assert_eq!(
            flush(&mut state, &Config::enabled(1024)),
            FlushOutcome::Skipped(SkipReason::NoDestination)
        );

        let mut state = busy_state();
        assert_eq!(
            flush(&mut state, &Config::DISABLED),
            FlushOutcome::Skipped(SkipReason::Disabled)
        );
    }

    #[test]
    fn unwritable_destination_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_with_prefix(&dir.path().join("missing-dir").join("prof"));
        let mut state = busy_state();
        assert_eq!(flush(&mut state, &config), FlushOutcome::Written);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
