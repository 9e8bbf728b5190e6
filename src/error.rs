use thiserror::Error;

#[derive(Error, Debug)]
pub enum FaviconError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("store version {found} is incompatible with supported version {supported}")]
    VersionMismatch { found: String, supported: i64 },

    #[error("favicon store is locked by another process")]
    StoreLocked,

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, FaviconError>;
