use rusqlite::{Connection, OptionalExtension};

pub const SCHEMA_VERSION: i32 = 1;

/// Create tables that do not exist yet. Existing imports are kept.
pub fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        -- Metadata table
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- One row per imported snapshot file
        CREATE TABLE IF NOT EXISTS snapshots (
            id INTEGER PRIMARY KEY,
            path TEXT NOT NULL UNIQUE,
            prefix TEXT,
            pid INTEGER,
            tid INTEGER,
            stride_bytes INTEGER NOT NULL,
            alloc_count INTEGER NOT NULL,
            sample_count INTEGER NOT NULL,
            overflow_count INTEGER NOT NULL,
            site_count INTEGER NOT NULL,
            imported_at TEXT NOT NULL
        );

        -- One row per call-site record; symbol columns are NULL unless
        -- the import was given a binary
        CREATE TABLE IF NOT EXISTS sites (
            snapshot_id INTEGER NOT NULL,
            address INTEGER NOT NULL,
            sample_count INTEGER NOT NULL,
            total_bytes INTEGER NOT NULL,
            est_bytes INTEGER NOT NULL,
            function TEXT,
            file TEXT,
            line INTEGER,
            PRIMARY KEY (snapshot_id, address),
            FOREIGN KEY (snapshot_id) REFERENCES snapshots(id)
        );

        CREATE INDEX IF NOT EXISTS idx_sites_function ON sites(function);
        "#,
    )
}

/// Set a metadata key
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
        [key, value],
    )?;
    Ok(())
}

/// Get a metadata key
pub fn get_meta(conn: &Connection, key: &str) -> rusqlite::Result<Option<String>> {
    conn.query_row("SELECT value FROM meta WHERE key = ?", [key], |row| {
        row.get(0)
    })
    .optional()
}
