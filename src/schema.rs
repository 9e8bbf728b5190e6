//! On-disk layout of the favicon store.
//!
//! The table layout matches the host browser's own Favicons database
//! bit-for-bit. The browser keeps reading the file this crate writes, so
//! nothing here may drift.

use crate::error::Result;
use rusqlite::{params, Connection};

/// Store schema version this crate can safely write.
pub const SUPPORTED_VERSION: i64 = 8;

pub const TABLE_META: &str = "meta";
pub const TABLE_FAVICONS: &str = "favicons";
pub const TABLE_FAVICON_BITMAPS: &str = "favicon_bitmaps";
pub const TABLE_ICON_MAPPING: &str = "icon_mapping";

/// The four tables of a well-formed store.
pub const TABLES: [&str; 4] = [
    TABLE_META,
    TABLE_FAVICONS,
    TABLE_FAVICON_BITMAPS,
    TABLE_ICON_MAPPING,
];

/// Keys every meta table carries.
pub const META_KEYS: [&str; 3] = ["mmap_status", "version", "last_compatible_version"];

/// Icon-type tag the browser uses for plain favicons.
pub const ICON_TYPE_FAVICON: i64 = 1;

/// Bitmap edge lengths stored per favicon.
pub const ICON_DIMENSIONS: [i64; 2] = [16, 32];

/// A favicon rendered at the two sizes the store persists.
///
/// Producing the PNG bytes (decoding, rescaling, format conversion) is the
/// fetch collaborator's job; by the time an `IconPair` reaches
/// [`crate::session::StoreSession::add_icons`] both buffers must already be
/// normalized.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IconPair {
    /// 16×16 PNG bytes.
    pub x16: Vec<u8>,
    /// 32×32 PNG bytes.
    pub x32: Vec<u8>,
}

impl IconPair {
    pub fn new(x16: Vec<u8>, x32: Vec<u8>) -> Self {
        IconPair { x16, x32 }
    }
}

const CREATE_TABLES_SQL: &str = "\
    CREATE TABLE meta(key TEXT PRIMARY KEY, value TEXT);
    CREATE TABLE favicons(id INTEGER PRIMARY KEY, url TEXT UNIQUE, icon_type INTEGER);
    CREATE TABLE favicon_bitmaps(id INTEGER PRIMARY KEY, icon_id INTEGER, \
        last_updated INTEGER, image_data BLOB, width INTEGER, height INTEGER, \
        last_requested INTEGER);
    CREATE TABLE icon_mapping(id INTEGER PRIMARY KEY, page_url TEXT UNIQUE, \
        icon_id INTEGER);";

/// Provision the four tables and the meta rows of an empty store.
///
/// The browser normally creates the Favicons file itself; this exists for
/// test fixtures and for provisioning a cache from scratch.
pub fn initialize_store(conn: &Connection) -> Result<()> {
    conn.execute_batch(CREATE_TABLES_SQL)?;
    conn.execute(
        "INSERT INTO meta(key, value) VALUES \
         ('mmap_status', '-1'), ('version', ?1), ('last_compatible_version', ?1)",
        params![SUPPORTED_VERSION.to_string()],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_creates_expected_tables() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_store(&conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_schema WHERE type = 'table' ORDER BY name")
            .unwrap();
        let tables: Vec<String> = stmt
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<rusqlite::Result<_>>()
            .unwrap();

        let mut expected: Vec<String> = TABLES.iter().map(|t| t.to_string()).collect();
        expected.sort();
        assert_eq!(tables, expected);
    }

    #[test]
    fn initialize_writes_supported_version() {
        let conn = Connection::open_in_memory().unwrap();
        initialize_store(&conn).unwrap();

        let version: String = conn
            .query_row("SELECT value FROM meta WHERE key = 'version'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version.parse::<i64>().unwrap(), SUPPORTED_VERSION);

        let keys: i64 = conn
            .query_row("SELECT COUNT(*) FROM meta", [], |row| row.get(0))
            .unwrap();
        assert_eq!(keys, META_KEYS.len() as i64);
    }
}
