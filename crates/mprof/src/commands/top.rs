use crate::error::{Error, Result};
use crate::symbols::{Location, SymbolResolver};
use mprof_trace::{Snapshot, SnapshotHeader};
use std::path::Path;

/// One ranked call site
#[derive(Debug, Clone)]
pub struct TopEntry {
    pub address: u64,
    pub sample_count: u64,
    /// Sizes of the sampled allocations, summed
    pub total_bytes: u64,
    /// `sample_count * stride`
    pub est_bytes: u64,
    /// Share of the thread's estimated bytes, in percent
    pub share_pct: f64,
    pub location: Option<Location>,
}

#[derive(Debug, Clone)]
pub struct TopReport {
    pub header: SnapshotHeader,
    /// Samples that landed in a recorded site
    pub attributed_samples: u64,
    pub entries: Vec<TopEntry>,
}

/// Rank the sites of `snapshot` by total sampled bytes and keep `limit`.
pub fn build_report(
    snapshot: &Snapshot,
    limit: usize,
    resolver: Option<&SymbolResolver>,
) -> TopReport {
    let stride = snapshot.header.stride_bytes;
    let thread_est = snapshot.header.estimated_bytes();

    let entries = snapshot
        .sites_by_bytes()
        .into_iter()
        .take(limit)
        .map(|site| {
            let est_bytes = site.estimated_bytes(stride);
            TopEntry {
                address: site.address,
                sample_count: site.sample_count,
                total_bytes: site.total_bytes,
                est_bytes,
                share_pct: percent(est_bytes, thread_est),
                location: resolver.map(|r| r.resolve(site.address)),
            }
        })
        .collect();

    TopReport {
        header: snapshot.header,
        attributed_samples: snapshot.attributed_samples(),
        entries,
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

pub fn run(
    file: &Path,
    limit: usize,
    exe: Option<&Path>,
    load_base: u64,
    json: bool,
    csv: bool,
) -> Result<()> {
    let snapshot = Snapshot::read(file).map_err(|e| Error::snapshot(file, e))?;
    tracing::info!(
        sites = snapshot.sites.len(),
        samples = snapshot.header.sample_count,
        "read {}",
        file.display()
    );

    let resolver = exe
        .map(|path| SymbolResolver::from_binary(path, load_base))
        .transpose()?;
    if let Some(r) = &resolver {
        tracing::info!(
            ranges = r.range_count(),
            load_base = %format!("0x{:x}", r.load_base()),
            "symbolizing"
        );
    }

    let report = build_report(&snapshot, limit, resolver.as_ref());

    if report.entries.is_empty() {
        eprintln!("No call sites recorded in {}.", file.display());
        if report.header.sample_count > 0 {
            eprintln!("Samples were taken but no caller could be captured.");
            eprintln!("Build the target with RUSTFLAGS=\"-C force-frame-pointers=yes\".");
        }
    }

    if json {
        print_json(file, &report);
    } else if csv {
        print_csv(&report);
    } else {
        print_table(file, &report);
    }

    Ok(())
}

fn print_table(file: &Path, report: &TopReport) {
    let h = &report.header;
    println!("# {}", file.display());
    println!(
        "# Stride: {} | Allocs: {} | Samples: {} | Est: {} | Sites: {} | Overflow: {}",
        format_bytes(h.stride_bytes),
        format_count(h.alloc_count),
        format_count(h.sample_count),
        format_bytes(h.estimated_bytes()),
        h.site_count,
        format_count(h.overflow_count)
    );
    let unattributed = h.sample_count.saturating_sub(report.attributed_samples);
    if unattributed > 0 {
        println!(
            "# Unattributed samples: {} ({:.1}%)",
            format_count(unattributed),
            percent(unattributed, h.sample_count)
        );
    }
    println!();

    println!(
        "{:>10}  {:>6}  {:>9}  {:<30}  FUNCTION",
        "EST", "SHARE", "SAMPLES", "LOCATION"
    );
    println!("{}", "-".repeat(80));

    for entry in &report.entries {
        let (location, function) = match &entry.location {
            Some(loc) => (loc.as_file_line(), format_function(&loc.function)),
            None => (format!("0x{:x}", entry.address), "-".to_string()),
        };
        println!(
            "{:>10}  {:>5.1}%  {:>9}  {:<30}  {}",
            format_bytes(entry.est_bytes),
            entry.share_pct,
            format_count(entry.sample_count),
            location,
            function
        );
    }
}

fn print_json(file: &Path, report: &TopReport) {
    let h = &report.header;
    println!("{{");
    println!("  \"file\": \"{}\",", json_escape(&file.display().to_string()));
    println!("  \"stride_bytes\": {},", h.stride_bytes);
    println!("  \"alloc_count\": {},", h.alloc_count);
    println!("  \"sample_count\": {},", h.sample_count);
    println!("  \"overflow_count\": {},", h.overflow_count);
    println!("  \"est_bytes\": {},", h.estimated_bytes());
    println!("  \"entries\": [");

    for (i, entry) in report.entries.iter().enumerate() {
        let comma = if i + 1 < report.entries.len() { "," } else { "" };
        let symbol = match &entry.location {
            Some(loc) => format!(
                ", \"file\": \"{}\", \"line\": {}, \"function\": \"{}\"",
                json_escape(&loc.file),
                loc.line,
                json_escape(&loc.function)
            ),
            None => String::new(),
        };
        println!(
            "    {{ \"address\": \"0x{:x}\", \"samples\": {}, \"sampled_bytes\": {}, \"est_bytes\": {}, \"share_pct\": {:.1}{} }}{}",
            entry.address,
            entry.sample_count,
            entry.total_bytes,
            entry.est_bytes,
            entry.share_pct,
            symbol,
            comma
        );
    }

    println!("  ]");
    println!("}}");
}

fn print_csv(report: &TopReport) {
    println!("address,samples,sampled_bytes,est_bytes,share_pct,file,line,function");
    for entry in &report.entries {
        let (file, line, function) = match &entry.location {
            Some(loc) => (loc.file.as_str(), loc.line, loc.function.as_str()),
            None => ("", 0, ""),
        };
        println!(
            "0x{:x},{},{},{},{:.1},{},{},\"{}\"",
            entry.address,
            entry.sample_count,
            entry.total_bytes,
            entry.est_bytes,
            entry.share_pct,
            file,
            line,
            function.replace('"', "\"\"")
        );
    }
}

fn json_escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Format bytes as human-readable with decimals (heaptrack style)
pub fn format_bytes(bytes: u64) -> String {
    let b = bytes as f64;
    if b >= 1024.0 * 1024.0 * 1024.0 {
        format!("{:.2}G", b / (1024.0 * 1024.0 * 1024.0))
    } else if b >= 1024.0 * 1024.0 {
        format!("{:.2}M", b / (1024.0 * 1024.0))
    } else if b >= 1024.0 {
        format!("{:.1}K", b / 1024.0)
    } else {
        format!("{}B", bytes)
    }
}

/// Format a number with commas for readability
pub fn format_count(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + s.len() / 3);
    for (i, c) in s.chars().enumerate() {
        if i > 0 && (s.len() - i) % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result
}

/// Format a function name - remove hash suffix and simplify
fn format_function(func: &str) -> String {
    let mut result = func.to_string();

    // "::h1234567890abcdef"
    if let Some(idx) = result.rfind("::h") {
        let suffix = &result[idx + 3..];
        if suffix.len() == 16 && suffix.chars().all(|c| c.is_ascii_hexdigit()) {
            result.truncate(idx);
        }
    }

    // <path::to::Type as path::to::Trait>::method -> to::Type::method
    if result.starts_with('<')
        && let Some(as_pos) = result.find(" as ")
        && let Some(gt_pos) = result.find(">::")
        && as_pos < gt_pos
    {
        let type_short = simplify_type_path(&result[1..as_pos]);
        result = format!("{}::{}", type_short, &result[gt_pos + 3..]);
    }

    let prefixes_to_shorten = [
        ("alloc::vec::", "Vec::"),
        ("alloc::string::", "String::"),
        ("alloc::alloc::", "alloc::"),
        ("hashbrown::raw::", "hashbrown::"),
        ("std::collections::hash_map::", "HashMap::"),
    ];
    for (prefix, replacement) in prefixes_to_shorten {
        if let Some(rest) = result.strip_prefix(prefix) {
            result = format!("{}{}", replacement, rest);
            break;
        }
    }

    // Collapse long generic parameter lists
    if let (Some(start), Some(end)) = (result.find('<'), result.rfind('>'))
        && start < end
    {
        let generic = &result[start..=end];
        if generic.len() > 20 || generic.contains("::") {
            result = format!("{}<_>{}", &result[..start], &result[end + 1..]);
        }
    }

    result
}

fn simplify_type_path(path: &str) -> String {
    let parts: Vec<&str> = path.split("::").collect();
    if parts.len() >= 2 {
        format!("{}::{}", parts[parts.len() - 2], parts[parts.len() - 1])
    } else {
        path.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mprof_trace::SnapshotSite;
    use mprof_trace::snapshot::VERSION;

    fn snapshot() -> Snapshot {
        let sites = vec![
            SnapshotSite {
                address: 0x1100,
                sample_count: 1,
                total_bytes: 1100,
            },
            SnapshotSite {
                address: 0x2200,
                sample_count: 4,
                total_bytes: 5000,
            },
            SnapshotSite {
                address: 0x3300,
                sample_count: 2,
                total_bytes: 2048,
            },
        ];
        Snapshot {
            header: SnapshotHeader {
                version: VERSION,
                stride_bytes: 1024,
                alloc_count: 40,
                sample_count: 8,
                overflow_count: 0,
                site_count: sites.len() as u64,
            },
            sites,
        }
    }

    #[test]
    fn ranks_by_sampled_bytes() {
        let report = build_report(&snapshot(), 10, None);
        let order: Vec<_> = report.entries.iter().map(|e| e.address).collect();
        assert_eq!(order, vec![0x2200, 0x3300, 0x1100]);
        assert_eq!(report.attributed_samples, 7);

        let top = &report.entries[0];
        assert_eq!(top.est_bytes, 4096);
        assert!((top.share_pct - 50.0).abs() < 1e-9);
        assert!(top.location.is_none());
    }

    #[test]
    fn limit_truncates() {
        let report = build_report(&snapshot(), 1, None);
        assert_eq!(report.entries.len(), 1);
        assert_eq!(report.entries[0].address, 0x2200);
    }

    #[test]
    fn empty_thread_has_zero_share() {
        let mut snap = snapshot();
        snap.header.sample_count = 0;
        let report = build_report(&snap, 10, None);
        assert!(report.entries.iter().all(|e| e.share_pct == 0.0));
    }

    #[test]
    fn byte_and_count_formatting() {
        assert_eq!(format_bytes(512), "512B");
        assert_eq!(format_bytes(1536), "1.5K");
        assert_eq!(format_bytes(512 * 1024), "512.0K");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00M");
        assert_eq!(format_count(0), "0");
        assert_eq!(format_count(999), "999");
        assert_eq!(format_count(1000), "1,000");
        assert_eq!(format_count(1234567), "1,234,567");
    }

    #[test]
    fn function_names_are_shortened() {
        assert_eq!(
            format_function("app::cache::fill::h0123456789abcdef"),
            "app::cache::fill"
        );
        assert_eq!(
            format_function("<app::model::User as core::clone::Clone>::clone"),
            "model::User::clone"
        );
        assert_eq!(
            format_function("alloc::vec::Vec<T,A>::reserve"),
            "Vec::Vec<T,A>::reserve"
        );
        assert_eq!(
            format_function("hashbrown::raw::RawTable<(u64, alloc::vec::Vec<u64>)>::reserve_rehash"),
            "hashbrown::RawTable<_>::reserve_rehash"
        );
    }
}
