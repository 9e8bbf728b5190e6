//! The merge protocol: a write session against the favicon store.
//!
//! [`StoreSession`] methods are intended to be called in this order:
//!
//! 1. [`StoreSession::existing_mappings`]: page URLs that are already done
//!    and must be excluded from every later step.
//! 2. [`StoreSession::merge`] with the discovered page→favicon mapping.
//!    Pages whose favicon is already stored get linked; the rest come back.
//! 3. [`StoreSession::add_icons`] with fetched icons for the leftover
//!    favicon URLs.
//! 4. [`StoreSession::merge`] again with the still-unmapped discoveries; the
//!    leftover list is now empty for every favicon that was added.
//! 5. [`StoreSession::close`] to commit.
//!
//! Following this order guarantees that no icon already saved in the store
//! is ever fetched or stored again. The ordering is a caller contract, not
//! runtime-enforced: calling `merge` twice without `add_icons` in between
//! simply returns the same unmatched set, which keeps retries cheap.
//!
//! All writes happen inside one exclusive transaction held for the life of
//! the session. Dropping a session without [`StoreSession::close`] rolls
//! everything back, so a crashed run never leaves a half-merged store.

use crate::error::{FaviconError, Result};
use crate::ids;
use crate::schema::{
    IconPair, ICON_TYPE_FAVICON, SUPPORTED_VERSION, TABLE_FAVICONS, TABLE_FAVICON_BITMAPS,
    TABLE_ICON_MAPPING,
};
use rusqlite::backup::Backup;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, ErrorCode, OpenFlags};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Pages copied per step of the online backup behind
/// [`StoreSession::open_in_memory_copy`].
const BACKUP_PAGES_PER_STEP: std::os::raw::c_int = 64;

/// A single-connection write session implementing the merge protocol.
#[derive(Debug)]
pub struct StoreSession {
    conn: Connection,
}

impl StoreSession {
    /// Open the store at `path` for synchronization.
    ///
    /// Takes a single-shot exclusive transaction with a zero busy timeout: a
    /// conflicting owner of the file (a running browser) makes this fail
    /// right away with [`FaviconError::StoreLocked`] instead of waiting, the
    /// assumption being that the browser will not let go any time soon.
    ///
    /// # Errors
    ///
    /// [`FaviconError::StoreLocked`] if another writer holds the file, and
    /// [`FaviconError::VersionMismatch`] if `meta.version` is not
    /// [`SUPPORTED_VERSION`]. Both are detected before any write.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        debug!("Opening favicon store at {:?}", path.as_ref());
        let conn = Connection::open_with_flags(path.as_ref(), OpenFlags::SQLITE_OPEN_READ_WRITE)?;
        conn.busy_timeout(Duration::ZERO)?;

        if let Err(err) = conn.execute_batch("BEGIN EXCLUSIVE") {
            return Err(match err {
                rusqlite::Error::SqliteFailure(code, _)
                    if matches!(
                        code.code,
                        ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                    ) =>
                {
                    FaviconError::StoreLocked
                }
                other => other.into(),
            });
        }

        Self::verify_version(&conn)?;
        Ok(StoreSession { conn })
    }

    /// Load the store at `path` into a transient in-memory working copy.
    ///
    /// Writes made through this session never reach the original file.
    /// Useful for dry runs and tests. The version check still applies; the
    /// lock contract does not, since the copy has no co-owner.
    pub fn open_in_memory_copy<P: AsRef<Path>>(path: P) -> Result<Self> {
        debug!(
            "Loading favicon store at {:?} into a working copy",
            path.as_ref()
        );
        let src = Connection::open_with_flags(path.as_ref(), OpenFlags::SQLITE_OPEN_READ_ONLY)?;
        let mut conn = Connection::open_in_memory()?;
        {
            let backup = Backup::new(&src, &mut conn)?;
            backup.run_to_completion(BACKUP_PAGES_PER_STEP, Duration::ZERO, None)?;
        }
        src.close().map_err(|(_, err)| FaviconError::from(err))?;

        conn.execute_batch("BEGIN EXCLUSIVE")?;
        Self::verify_version(&conn)?;
        Ok(StoreSession { conn })
    }

    fn verify_version(conn: &Connection) -> Result<()> {
        let found: String = conn.query_row(
            "SELECT value FROM meta WHERE key = 'version'",
            [],
            |row| {
                Ok(match row.get_ref(0)? {
                    ValueRef::Integer(v) => v.to_string(),
                    ValueRef::Text(v) => String::from_utf8_lossy(v).into_owned(),
                    other => format!("{other:?}"),
                })
            },
        )?;

        match found.parse::<i64>() {
            Ok(version) if version == SUPPORTED_VERSION => Ok(()),
            _ => Err(FaviconError::VersionMismatch {
                found,
                supported: SUPPORTED_VERSION,
            }),
        }
    }

    /// All page URLs that already have a stored icon mapping.
    ///
    /// Pure read. Callers must drop these pages from their candidate set
    /// before querying favicon URLs for them: they require no further work,
    /// and [`StoreSession::merge`] rejects them.
    pub fn existing_mappings(&self) -> Result<HashSet<String>> {
        let mut stmt = self.conn.prepare("SELECT page_url FROM icon_mapping")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;

        let mut mappings = HashSet::new();
        for page_url in rows {
            mappings.insert(page_url?);
        }
        Ok(mappings)
    }

    /// Reconcile `candidates` (page URL → favicon URL) against the stored
    /// icons.
    ///
    /// Every candidate whose favicon URL exactly matches a stored favicon
    /// gets a new icon mapping row; the reconciliation is two-phase (the
    /// full match set is read first, then applied as one batch of inserts).
    /// Returns the page URLs whose favicon has no stored record yet; the
    /// caller must fetch and [`StoreSession::add_icons`] exactly these.
    ///
    /// Several candidate pages sharing one favicon URL is expected and
    /// fine; they all map to the same record.
    ///
    /// # Errors
    ///
    /// [`FaviconError::ProtocolViolation`] if any candidate page URL is
    /// already mapped, detected before any row is written.
    pub fn merge(&mut self, candidates: &HashMap<String, String>) -> Result<Vec<String>> {
        debug!("Merging {} candidate mapping(s)", candidates.len());
        self.conn.execute_batch(
            "CREATE TEMPORARY TABLE favicon_query(\
                favicon_url TEXT NOT NULL, website_url TEXT NOT NULL)",
        )?;

        let result = self.merge_candidates(candidates);
        // The scratch table never outlives a single merge call, even on
        // error, so a later retry starts clean.
        let cleanup = self.conn.execute_batch("DROP TABLE favicon_query");

        let unmatched = result?;
        cleanup?;
        Ok(unmatched)
    }

    fn merge_candidates(&mut self, candidates: &HashMap<String, String>) -> Result<Vec<String>> {
        self.populate_query_table(candidates)?;
        self.check_mapping_collision()?;

        let matches = self.matched_candidates()?;
        self.insert_mappings(&matches)?;
        self.unmatched_candidates()
    }

    fn populate_query_table(&mut self, candidates: &HashMap<String, String>) -> Result<()> {
        let mut insert = self
            .conn
            .prepare("INSERT INTO favicon_query VALUES (?1, ?2)")?;
        for (page_url, favicon_url) in candidates {
            insert.execute(params![favicon_url, page_url])?;
        }
        Ok(())
    }

    /// Candidate pages must not already be mapped; those URLs were filtered
    /// out via [`StoreSession::existing_mappings`] and showing up here means
    /// the caller skipped that step.
    fn check_mapping_collision(&self) -> Result<()> {
        let collisions: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM icon_mapping AS map \
             INNER JOIN favicon_query AS search ON map.page_url = search.website_url",
            [],
            |row| row.get(0),
        )?;
        if collisions != 0 {
            return Err(FaviconError::ProtocolViolation(format!(
                "{collisions} candidate page URL(s) are already mapped in the store"
            )));
        }
        Ok(())
    }

    /// Read snapshot: every candidate page whose favicon URL is already
    /// stored, paired with the matching favicon id. `favicons.url` is
    /// unique, so each candidate matches at most once.
    fn matched_candidates(&self) -> Result<Vec<(String, i64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT search.website_url, fav.id FROM favicons AS fav \
             INNER JOIN favicon_query AS search ON fav.url = search.favicon_url",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    fn insert_mappings(&mut self, matches: &[(String, i64)]) -> Result<()> {
        let mut id = ids::next_id(&self.conn, TABLE_ICON_MAPPING)?;
        let mut insert = self
            .conn
            .prepare("INSERT INTO icon_mapping VALUES (?1, ?2, ?3)")?;
        for (page_url, icon_id) in matches {
            insert.execute(params![id, page_url, icon_id])?;
            id += 1;
        }
        Ok(())
    }

    fn unmatched_candidates(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT website_url FROM favicon_query \
             WHERE favicon_url NOT IN (SELECT url FROM favicons)",
        )?;
        let rows = stmt.query_map([], |row| row.get(0))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(Into::into)
    }

    /// Store new icons: one favicon record plus its 16×16 and 32×32 bitmap
    /// rows per entry, with consecutive freshly allocated ids.
    ///
    /// Does not touch the mapping table; call [`StoreSession::merge`] again
    /// afterwards to link the waiting pages.
    ///
    /// # Errors
    ///
    /// [`FaviconError::ProtocolViolation`] if `entries` repeats a favicon
    /// URL, detected before any row is written.
    pub fn add_icons(&mut self, entries: &[(String, IconPair)]) -> Result<()> {
        debug!("Adding {} new icon(s)", entries.len());
        let mut seen = HashSet::with_capacity(entries.len());
        for (favicon_url, _) in entries {
            if !seen.insert(favicon_url.as_str()) {
                return Err(FaviconError::ProtocolViolation(format!(
                    "favicon URL {favicon_url:?} passed to add_icons more than once"
                )));
            }
        }

        let mut favicon_id = ids::next_id(&self.conn, TABLE_FAVICONS)?;
        let mut bitmap_id = ids::next_id(&self.conn, TABLE_FAVICON_BITMAPS)?;

        let mut insert_favicon = self
            .conn
            .prepare("INSERT INTO favicons VALUES (?1, ?2, ?3)")?;
        // Columns: id, icon_id, last_updated, image_data, width, height,
        // last_requested. The two timestamps stay 0, matching rows the
        // browser has never refreshed.
        let mut insert_bitmap = self
            .conn
            .prepare("INSERT INTO favicon_bitmaps VALUES (?1, ?2, 0, ?3, ?4, ?4, 0)")?;

        for (favicon_url, icons) in entries {
            insert_favicon.execute(params![favicon_id, favicon_url, ICON_TYPE_FAVICON])?;
            insert_bitmap.execute(params![bitmap_id, favicon_id, icons.x16, 16])?;
            bitmap_id += 1;
            insert_bitmap.execute(params![bitmap_id, favicon_id, icons.x32, 32])?;
            bitmap_id += 1;
            favicon_id += 1;
        }
        Ok(())
    }

    /// Commit every write made through this session and release the
    /// connection.
    pub fn close(self) -> Result<()> {
        debug!("Committing favicon store session");
        self.conn.execute_batch("COMMIT")?;
        self.conn.close().map_err(|(_, err)| err.into())
    }

    /// Read-only view of the underlying connection, mainly so the integrity
    /// checker can run against a session's in-memory working copy.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
