use super::top::{format_bytes, format_count};
use crate::error::Result;
use mprof_trace::SnapshotHeader;
use mprof_trace::snapshot::HEADER_SIZE;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Where a snapshot came from, as encoded in `{prefix}.{pid}.{tid}.bin`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotName {
    pub prefix: String,
    pub pid: u32,
    pub tid: u64,
}

impl SnapshotName {
    pub fn parse(file_name: &str) -> Option<Self> {
        let stem = file_name.strip_suffix(".bin")?;
        let mut parts = stem.rsplitn(3, '.');
        let tid = parts.next()?.parse().ok()?;
        let pid = parts.next()?.parse().ok()?;
        let prefix = parts.next()?;
        if prefix.is_empty() {
            return None;
        }
        Some(SnapshotName {
            prefix: prefix.to_string(),
            pid,
            tid,
        })
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        Self::parse(path.file_name()?.to_str()?)
    }
}

/// Snapshot file summary extracted from its header
pub struct SnapshotInfo {
    pub path: PathBuf,
    pub name: Option<SnapshotName>,
    pub header: SnapshotHeader,
}

/// Find all snapshot files in a directory
pub fn find_snapshots(dir: &Path) -> Result<Vec<SnapshotInfo>> {
    let mut snapshots = Vec::new();

    for entry in std::fs::read_dir(dir)?.flatten() {
        let path = entry.path();
        if path.extension().is_none_or(|e| e != "bin") {
            continue;
        }
        match read_header(&path) {
            Ok(header) => snapshots.push(SnapshotInfo {
                name: SnapshotName::from_path(&path),
                path,
                header,
            }),
            Err(reason) => tracing::debug!("skipping {}: {}", path.display(), reason),
        }
    }

    snapshots.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(snapshots)
}

/// Validate the header and the file length without reading the records.
fn read_header(path: &Path) -> std::result::Result<SnapshotHeader, String> {
    let mut file = File::open(path).map_err(|e| e.to_string())?;
    let len = file.metadata().map_err(|e| e.to_string())?.len();

    let mut buf = [0u8; HEADER_SIZE];
    file.read_exact(&mut buf).map_err(|e| e.to_string())?;
    let header = SnapshotHeader::decode(&buf).map_err(|e| e.to_string())?;

    match header.expected_len() {
        Some(expected) if expected == len => Ok(header),
        _ => Err(format!(
            "length {} does not match {} sites",
            len, header.site_count
        )),
    }
}

/// Run the list command
pub fn run(dir: Option<&Path>) -> Result<()> {
    let search_dir = dir.unwrap_or_else(|| Path::new("."));
    let snapshots = find_snapshots(search_dir)?;

    if snapshots.is_empty() {
        println!("No mprof snapshots found in {}", search_dir.display());
        return Ok(());
    }

    println!(
        "{:<36} {:>8} {:>10} {:>10} {:>6} {:>9} {:>10}",
        "FILE", "PID", "THREAD", "SAMPLES", "SITES", "OVERFLOW", "EST"
    );
    println!("{}", "-".repeat(95));

    for snapshot in snapshots {
        let filename = snapshot
            .path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        let (pid, tid) = match &snapshot.name {
            Some(name) => (name.pid.to_string(), name.tid.to_string()),
            None => ("?".to_string(), "?".to_string()),
        };
        let h = &snapshot.header;

        println!(
            "{:<36} {:>8} {:>10} {:>10} {:>6} {:>9} {:>10}",
            filename,
            pid,
            tid,
            format_count(h.sample_count),
            h.site_count,
            format_count(h.overflow_count),
            format_bytes(h.estimated_bytes())
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mprof_trace::sites::SiteRecord;
    use mprof_trace::snapshot::{VERSION, write_snapshot};

    fn no_sites<'a>() -> std::iter::Empty<&'a SiteRecord> {
        std::iter::empty()
    }

    fn write_empty(path: &Path, sample_count: u64) {
        let header = SnapshotHeader {
            version: VERSION,
            stride_bytes: 4096,
            sample_count,
            ..Default::default()
        };
        let mut buf = Vec::new();
        write_snapshot(&mut buf, &header, no_sites()).unwrap();
        std::fs::write(path, buf).unwrap();
    }

    #[test]
    fn file_name_parsing() {
        assert_eq!(
            SnapshotName::parse("app.1234.1240.bin"),
            Some(SnapshotName {
                prefix: "app".into(),
                pid: 1234,
                tid: 1240,
            })
        );
        assert_eq!(
            SnapshotName::parse("run.v2.99.100.bin").map(|n| n.prefix),
            Some("run.v2".into())
        );
        assert_eq!(SnapshotName::parse("app.bin"), None);
        assert_eq!(SnapshotName::parse("app.x.1.bin"), None);
        assert_eq!(SnapshotName::parse(".1.2.bin"), None);
        assert_eq!(SnapshotName::parse("app.1.2.db"), None);
    }

    #[test]
    fn finds_only_valid_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        write_empty(&dir.path().join("b.10.11.bin"), 3);
        write_empty(&dir.path().join("a.10.10.bin"), 0);
        write_empty(&dir.path().join("renamed.bin"), 1);
        std::fs::write(dir.path().join("junk.5.5.bin"), b"not a snapshot").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"hello").unwrap();

        let mut padded = Vec::new();
        let header = SnapshotHeader {
            version: VERSION,
            ..Default::default()
        };
        write_snapshot(&mut padded, &header, no_sites()).unwrap();
        padded.push(0);
        std::fs::write(dir.path().join("padded.1.1.bin"), padded).unwrap();

        let found = find_snapshots(dir.path()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|s| s.path.file_name().unwrap().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.10.10.bin", "b.10.11.bin", "renamed.bin"]);

        assert_eq!(found[1].name.as_ref().map(|n| n.tid), Some(11));
        assert_eq!(found[1].header.sample_count, 3);
        assert!(found[2].name.is_none());
    }
}
