use mprof_trace::SnapshotError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid snapshot {path}: {source}")]
    Snapshot {
        path: String,
        #[source]
        source: SnapshotError,
    },

    #[error("Missing debug info in {path}. Recompile with `debug = true` in Cargo.toml")]
    MissingDebugInfo { path: String },

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Symbol resolution error: {0}")]
    SymbolResolution(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod exit_code {
    pub const SUCCESS: i32 = 0;
    pub const GENERAL_ERROR: i32 = 1;
    pub const INVALID_ARGUMENTS: i32 = 2;
    pub const INVALID_SNAPSHOT: i32 = 3;
    pub const MISSING_DEBUG_INFO: i32 = 4;
    pub const DATABASE_ERROR: i32 = 5;
}

impl Error {
    /// Wrap a snapshot decoding failure with the file it came from.
    pub fn snapshot(path: &std::path::Path, source: SnapshotError) -> Self {
        Error::Snapshot {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Error::Snapshot { .. } => exit_code::INVALID_SNAPSHOT,
            Error::MissingDebugInfo { .. } => exit_code::MISSING_DEBUG_INFO,
            Error::Database(_) => exit_code::DATABASE_ERROR,
            Error::InvalidArgument(_) => exit_code::INVALID_ARGUMENTS,
            _ => exit_code::GENERAL_ERROR,
        }
    }
}
