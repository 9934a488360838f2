use super::schema::{self, SCHEMA_VERSION};
use crate::commands::list::SnapshotName;
use crate::error::{Error, Result};
use crate::symbols::SymbolResolver;
use mprof_trace::Snapshot;
use rusqlite::{Connection, params};
use std::path::Path;

/// Counts of what one import wrote
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub snapshots: usize,
    pub sites: usize,
}

/// SQLite database holding imported snapshots
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// Open `path`, creating the database if needed.
    ///
    /// A database written by a different schema version is refused.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::create_tables(&conn)?;

        match schema::get_meta(&conn, "version")? {
            Some(version) if version != SCHEMA_VERSION.to_string() => {
                return Err(Error::InvalidArgument(format!(
                    "{} has schema version {}, expected {}",
                    path.display(),
                    version,
                    SCHEMA_VERSION
                )));
            }
            Some(_) => {}
            None => {
                schema::set_meta(&conn, "version", &SCHEMA_VERSION.to_string())?;
                schema::set_meta(&conn, "created", &chrono::Utc::now().to_rfc3339())?;
            }
        }

        Ok(Storage { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Import decoded snapshots in one transaction.
    ///
    /// A path that was imported before is replaced. Site addresses and
    /// counters are stored as their two's-complement `i64` bit patterns.
    pub fn import(
        &mut self,
        snapshots: &[(&Path, &Snapshot)],
        resolver: Option<&SymbolResolver>,
    ) -> Result<ImportSummary> {
        let imported_at = chrono::Utc::now().to_rfc3339();
        let mut summary = ImportSummary::default();

        let tx = self.conn.transaction()?;
        {
            let mut delete_sites = tx.prepare_cached(
                "DELETE FROM sites WHERE snapshot_id IN (SELECT id FROM snapshots WHERE path = ?)",
            )?;
            let mut delete_snapshot = tx.prepare_cached("DELETE FROM snapshots WHERE path = ?")?;
            let mut insert_snapshot = tx.prepare_cached(
                "INSERT INTO snapshots (path, prefix, pid, tid, stride_bytes, alloc_count, sample_count, overflow_count, site_count, imported_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            let mut insert_site = tx.prepare_cached(
                "INSERT INTO sites (snapshot_id, address, sample_count, total_bytes, est_bytes, function, file, line) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )?;

            for (path, snapshot) in snapshots {
                let key = path.display().to_string();
                delete_sites.execute([&key])?;
                delete_snapshot.execute([&key])?;

                let name = SnapshotName::from_path(path);
                let h = &snapshot.header;
                insert_snapshot.execute(params![
                    key,
                    name.as_ref().map(|n| n.prefix.as_str()),
                    name.as_ref().map(|n| n.pid),
                    name.as_ref().map(|n| n.tid as i64),
                    h.stride_bytes as i64,
                    h.alloc_count as i64,
                    h.sample_count as i64,
                    h.overflow_count as i64,
                    h.site_count as i64,
                    imported_at,
                ])?;
                let snapshot_id = tx.last_insert_rowid();

                for site in &snapshot.sites {
                    let location = resolver.map(|r| r.resolve(site.address));
                    let location = location.filter(|l| !l.is_unknown());
                    insert_site.execute(params![
                        snapshot_id,
                        site.address as i64,
                        site.sample_count as i64,
                        site.total_bytes as i64,
                        site.estimated_bytes(h.stride_bytes) as i64,
                        location.as_ref().map(|l| l.function.as_str()),
                        location.as_ref().map(|l| l.file.as_str()),
                        location.as_ref().map(|l| l.line as i64),
                    ])?;
                    summary.sites += 1;
                }

                summary.snapshots += 1;
                tracing::debug!(
                    snapshot_id,
                    sites = snapshot.sites.len(),
                    "imported {}",
                    path.display()
                );
            }
        }
        tx.commit()?;

        Ok(summary)
    }

    /// Number of imported snapshots
    pub fn snapshot_count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM snapshots", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}
