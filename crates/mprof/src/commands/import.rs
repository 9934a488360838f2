use crate::error::{Error, Result};
use crate::storage::{ImportSummary, Storage};
use crate::symbols::SymbolResolver;
use mprof_trace::Snapshot;
use std::path::{Path, PathBuf};

/// Import snapshot files into `db`.
///
/// Every file is decoded before the database is touched, so one bad file
/// imports nothing.
pub fn import_files(
    db: &Path,
    files: &[PathBuf],
    resolver: Option<&SymbolResolver>,
) -> Result<ImportSummary> {
    if files.is_empty() {
        return Err(Error::InvalidArgument("no snapshot files given".to_string()));
    }

    let snapshots = files
        .iter()
        .map(|path| {
            Snapshot::read(path)
                .map(|snapshot| (path.as_path(), snapshot))
                .map_err(|e| Error::snapshot(path, e))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut storage = Storage::open(db)?;
    let pairs: Vec<(&Path, &Snapshot)> = snapshots.iter().map(|(p, s)| (*p, s)).collect();
    storage.import(&pairs, resolver)
}

/// Run the import command
pub fn run(db: &Path, files: &[PathBuf], exe: Option<&Path>, load_base: u64) -> Result<()> {
    let resolver = exe
        .map(|path| SymbolResolver::from_binary(path, load_base))
        .transpose()?;

    let summary = import_files(db, files, resolver.as_ref())?;

    println!(
        "Imported {} snapshot(s), {} site(s) into {}",
        summary.snapshots,
        summary.sites,
        db.display()
    );
    Ok(())
}
