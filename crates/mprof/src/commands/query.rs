use crate::error::Result;
use rusqlite::types::Value;
use rusqlite::{Connection, OpenFlags};
use std::io::Write;
use std::path::Path;

/// Run `sql` against an imported database and write tab-separated rows,
/// header first.
pub fn write_query<W: Write>(file: &Path, sql: &str, out: &mut W) -> Result<()> {
    let conn = Connection::open_with_flags(
        file,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let mut stmt = conn.prepare(sql)?;

    let column_count = stmt.column_count();
    let column_names: Vec<String> = stmt.column_names().iter().map(|s| s.to_string()).collect();

    writeln!(out, "{}", column_names.join("\t"))?;

    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let values: Vec<String> = (0..column_count)
            .map(|i| {
                row.get::<_, Value>(i)
                    .map(|v| format_value(&v))
                    .unwrap_or_else(|_| "NULL".to_string())
            })
            .collect();
        writeln!(out, "{}", values.join("\t"))?;
    }

    Ok(())
}

pub fn run(file: &Path, sql: &str) -> Result<()> {
    let stdout = std::io::stdout();
    write_query(file, sql, &mut stdout.lock())
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Integer(i) => i.to_string(),
        Value::Real(f) => format!("{:.6}", f),
        Value::Text(s) => s.clone(),
        Value::Blob(b) => format!("<blob {} bytes>", b.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[test]
    fn tab_separated_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("q.db");
        {
            let conn = Connection::open(&db).unwrap();
            conn.execute_batch(
                "CREATE TABLE t (name TEXT, n INTEGER, r REAL, b BLOB);
                 INSERT INTO t VALUES ('a', 1, 0.5, x'0102'), (NULL, 2, NULL, NULL);",
            )
            .unwrap();
        }

        let mut out = Vec::new();
        write_query(&db, "SELECT name, n, r, b FROM t ORDER BY n", &mut out).unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "name\tn\tr\tb\na\t1\t0.500000\t<blob 2 bytes>\nNULL\t2\tNULL\tNULL\n"
        );
    }

    #[test]
    fn missing_database_is_not_created() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("absent.db");
        let mut out = Vec::new();
        assert!(matches!(
            write_query(&db, "SELECT 1", &mut out),
            Err(Error::Database(_))
        ));
        assert!(!db.exists());
    }

    #[test]
    fn writes_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("ro.db");
        Connection::open(&db)
            .unwrap()
            .execute_batch("CREATE TABLE t (x INTEGER);")
            .unwrap();

        let mut out = Vec::new();
        assert!(write_query(&db, "INSERT INTO t VALUES (1)", &mut out).is_err());
    }
}
