//! Allocation churn demo for mprof
//!
//! A few worker threads with different allocation patterns: many small
//! strings, a handful of large buffers, and a growing index.
//!
//! Build: RUSTFLAGS="-C force-frame-pointers=yes" cargo build --release --example churn -p mprof-trace
//! Run:   MPROF=1 MPROF_BYTES=65536 MPROF_STATS=1 MPROF_OUT=/tmp/churn ./target/release/examples/churn
//! Inspect: mprof top /tmp/churn.<pid>.<tid>.bin -e ./target/release/examples/churn

use std::collections::HashMap;
use std::hint::black_box;
use std::time::Instant;

mprof_trace::profiler!();

const ROUNDS: u64 = 20_000;

fn main() {
    println!("=== Allocation Churn ===");
    println!("PID: {}", std::process::id());
    println!();

    let start = Instant::now();

    let workers = [
        std::thread::spawn(|| small_strings(ROUNDS)),
        std::thread::spawn(|| large_buffers(ROUNDS / 100)),
        std::thread::spawn(|| growing_index(ROUNDS)),
    ];

    let mut total = 0usize;
    for worker in workers {
        total += worker.join().unwrap_or(0);
    }

    // The main thread allocates too; it is flushed at process exit.
    let summary = session_tokens(ROUNDS / 10);

    println!(
        "[{:>5.2}s] worker_bytes={} main_tokens={}",
        start.elapsed().as_secs_f64(),
        total,
        summary
    );
}

// Many short-lived allocations from one site
#[inline(never)]
fn small_strings(rounds: u64) -> usize {
    let mut bytes = 0;
    for i in 0..rounds {
        let label = format!("user-{i:08}-session");
        bytes += black_box(label).len();
    }
    bytes
}

// Few allocations, each larger than the default stride
#[inline(never)]
fn large_buffers(rounds: u64) -> usize {
    let mut bytes = 0;
    for i in 0..rounds {
        let buf = vec![(i & 0xff) as u8; 1 << 20];
        bytes += black_box(buf).len();
    }
    bytes
}

// Long-lived map that keeps reallocating as it grows
#[inline(never)]
fn growing_index(rounds: u64) -> usize {
    let mut index: HashMap<u64, Vec<u64>> = HashMap::new();
    for i in 0..rounds {
        index.entry(i % 512).or_default().push(i);
    }
    index.values().map(|v| v.len() * size_of::<u64>()).sum()
}

#[inline(never)]
fn session_tokens(rounds: u64) -> usize {
    (0..rounds)
        .map(|i| black_box(i.to_string().repeat(4)).len())
        .sum()
}
