//! Re-run a test of the current binary in a child process with profiling
//! switched on.
//!
//! The configuration is read from the environment on the first allocation,
//! long before a test body runs, so the only way to profile a test is to
//! start a fresh process with `MPROF` already set. The child reports what the
//! parent needs to check as `mprof-child key=value` lines on stdout.

#![allow(dead_code)]

use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::process::Command;

use mprof::symbols::{DwarfInfo, SymbolResolver};
use mprof_trace::config::OutputPrefix;
use mprof_trace::writer::snapshot_path;

const CHILD_ENV: &str = "MPROF_TEST_CHILD";
const REPORT_PREFIX: &str = "mprof-child ";

/// Whether this process is the profiled child
pub fn in_child() -> bool {
    std::env::var_os(CHILD_ENV).is_some()
}

/// Print a value for the parent to pick up.
pub fn report(key: &str, value: impl Display) {
    println!("{REPORT_PREFIX}{key}={value}");
}

/// Values reported by the child
pub struct Reported(Vec<(String, String)>);

impl Reported {
    /// Decimal or `0x` hex value of `key`
    pub fn get(&self, key: &str) -> u64 {
        let (_, raw) = self
            .0
            .iter()
            .find(|(k, _)| k == key)
            .unwrap_or_else(|| panic!("child did not report {key}"));
        match raw.strip_prefix("0x") {
            Some(hex) => u64::from_str_radix(hex, 16).unwrap(),
            None => raw.parse().unwrap(),
        }
    }
}

/// Run `test` of the current test binary with `MPROF=1`, writing snapshots
/// under `prefix`.
pub fn run_profiled(test: &str, prefix: &Path, stride: u64) -> Reported {
    let output = Command::new(std::env::current_exe().unwrap())
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(CHILD_ENV, "1")
        .env("MPROF", "1")
        .env("MPROF_BYTES", stride.to_string())
        .env("MPROF_OUT", prefix)
        .env_remove("MPROF_STATS")
        .output()
        .unwrap();

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "profiled child failed\n--- stdout\n{}\n--- stderr\n{}",
        stdout,
        String::from_utf8_lossy(&output.stderr)
    );

    Reported(
        stdout
            .lines()
            // libtest prints `test <name> ... ` without a newline, so the
            // first report can share a line with it
            .filter_map(|line| {
                line.find(REPORT_PREFIX)
                    .map(|i| &line[i + REPORT_PREFIX.len()..])
            })
            .filter_map(|line| line.split_once('='))
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}

/// `{prefix}.{pid}.{tid}.bin` of a child thread
pub fn snapshot_of(prefix: &Path, pid: u64, tid: u64) -> PathBuf {
    let prefix = OutputPrefix::new(prefix.as_os_str().as_encoded_bytes()).unwrap();
    snapshot_path(&prefix, pid as u32, tid)
}

/// Resolver for the current executable, with the load base derived from the
/// runtime address of the function named `function` (crate path, no hash).
/// Returns the resolver and the function's symbol name.
pub fn resolver_for(function: &str, runtime_addr: u64) -> (SymbolResolver, String) {
    let exe = std::env::current_exe().unwrap();
    let dwarf = DwarfInfo::parse(&exe).unwrap();
    let symbol = dwarf
        .functions
        .iter()
        .find(|f| without_hash(&f.name) == function)
        .unwrap_or_else(|| panic!("no symbol for {function}"))
        .clone();
    let load_base = runtime_addr - symbol.start;
    (SymbolResolver::from_dwarf(dwarf, load_base), symbol.name)
}

fn without_hash(name: &str) -> &str {
    match name.rsplit_once("::h") {
        Some((path, hash)) if hash.len() == 16 && hash.chars().all(|c| c.is_ascii_hexdigit()) => {
            path
        }
        _ => name,
    }
}
