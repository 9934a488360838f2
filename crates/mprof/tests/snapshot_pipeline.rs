use std::path::{Path, PathBuf};

use mprof::commands::{import, list, query, top};
use mprof::symbols::SymbolResolver;
use mprof_trace::config::{Config, OutputPrefix};
use mprof_trace::thread;
use mprof_trace::writer::{snapshot_path, thread_id};
use mprof_trace::{FlushOutcome, Snapshot};

/// Run `work` on a fresh thread with profiling on and return its snapshot path.
fn record_thread(prefix: &Path, stride: u64, work: fn(&Config)) -> PathBuf {
    let config = Config {
        output_prefix: OutputPrefix::new(prefix.as_os_str().as_encoded_bytes()),
        ..Config::enabled(stride)
    };
    let tid = std::thread::spawn(move || {
        work(&config);
        assert_eq!(thread::flush_current(&config), FlushOutcome::Written);
        thread_id()
    })
    .join()
    .unwrap();
    snapshot_path(&config.output_prefix.unwrap(), std::process::id(), tid)
}

fn mixed_sites(config: &Config) {
    for _ in 0..100 {
        thread::record(config, 100, 0xa000);
    }
    thread::record(config, 8 * 1024, 0xb000);
    thread::record(config, 3000, 0);
}

fn one_site(config: &Config) {
    for _ in 0..64 {
        thread::record(config, 1024, 0xc000);
    }
}

#[test]
fn recorded_threads_rank_list_and_import() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = dir.path().join("app");
    let first = record_thread(&prefix, 1024, mixed_sites);
    let second = record_thread(&prefix, 1024, one_site);

    // top
    let snapshot = Snapshot::read(&first).unwrap();
    assert_eq!(snapshot.header.alloc_count, 102);
    let report = top::build_report(&snapshot, 10, None);
    assert_eq!(report.entries[0].address, 0xb000);
    assert_eq!(report.entries[0].sample_count, 8);
    assert!(report.attributed_samples < snapshot.header.sample_count);
    let shares: f64 = report.entries.iter().map(|e| e.share_pct).sum();
    assert!(shares <= 100.0 + 1e-9);

    // list
    let found = list::find_snapshots(dir.path()).unwrap();
    assert_eq!(found.len(), 2);
    assert!(found.iter().all(|s| s.name.as_ref().is_some_and(|n| n.prefix == "app")));

    // import + query
    let db = dir.path().join("profile.db");
    let summary = import::import_files(&db, &[first, second.clone()], None).unwrap();
    assert_eq!(summary.snapshots, 2);
    assert_eq!(summary.sites, 3);

    let mut out = Vec::new();
    query::write_query(
        &db,
        "SELECT x.sample_count, x.est_bytes FROM sites x JOIN snapshots s ON s.id = x.snapshot_id WHERE x.address = 49152",
        &mut out,
    )
    .unwrap();
    assert_eq!(String::from_utf8(out).unwrap(), "sample_count\test_bytes\n64\t65536\n");

    // a corrupt file aborts the whole import
    let corrupt = dir.path().join("bad.1.1.bin");
    std::fs::write(&corrupt, b"MPROFILE").unwrap();
    let err = import::import_files(&db, &[second, corrupt], None).unwrap_err();
    assert_eq!(err.exit_code(), mprof::error::exit_code::INVALID_SNAPSHOT);
}

#[test]
fn symbols_load_from_a_debug_binary() {
    // Test binaries are built with debug info.
    let exe = std::env::current_exe().unwrap();
    let resolver = SymbolResolver::from_binary(&exe, 0).unwrap();
    assert!(resolver.range_count() > 0);
    assert!(resolver.resolve(0).is_unknown());
}
