//! Read-only structural validation of a favicon store.
//!
//! The checker detects corruption, it never repairs it. Verdicts come back
//! as data: a corrupted store is an expected, reportable condition rather
//! than a fault of the current operation, so only operational SQLite
//! failures surface as `Err`. Diagnostics are mirrored through `tracing`
//! (summary at `error`, offending rows at `info`) and the report types are
//! serializable for any other reporting channel.
//!
//! Checks run in a fixed order and stop at the first failure. Each check is
//! standalone: none depends on another's side effects, since there are
//! none.

use crate::error::Result;
use crate::schema::{ICON_DIMENSIONS, META_KEYS, TABLES};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{error, info};

/// Upper bound on offending rows kept per violation.
pub const DIAGNOSTIC_ROW_LIMIT: usize = 20;

/// The individual structural checks, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Check {
    /// The table set is exactly the four expected tables.
    TableSet,
    /// No column of any table holds NULL.
    NullValues,
    /// The meta table has exactly the expected keys with sane values.
    MetaRecords,
    /// `favicons.url` values are unique.
    UniqueFaviconUrls,
    /// `icon_mapping.page_url` values are unique.
    UniquePageUrls,
    /// Bitmaps are square and sized 16 or 32.
    BitmapDimensions,
    /// Every referenced favicon has exactly two bitmap rows.
    BitmapsPerIcon,
    /// The bitmap row count is exactly twice the favicon row count.
    BitmapFaviconParity,
    /// Every bitmap row joins back to a favicon row.
    OrphanBitmaps,
    /// Every mapping's icon_id resolves to a favicon.
    MappingReferences,
}

/// One failed check with bounded row-level diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct Violation {
    pub check: Check,
    pub message: String,
    /// Offending rows, capped at [`DIAGNOSTIC_ROW_LIMIT`].
    pub rows: Vec<String>,
}

/// Outcome of a validation pass.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CheckReport {
    pub violations: Vec<Violation>,
}

impl CheckReport {
    /// True when no structural violation was found.
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Validate the store behind `conn`.
///
/// False negatives are possible (this is a sanity check, not a proof), but
/// a failed report always describes real structural damage.
pub fn check(conn: &Connection) -> Result<CheckReport> {
    let checks: &[fn(&Connection) -> Result<Option<Violation>>] = &[
        check_tables,
        check_nulls,
        check_meta,
        check_unique_favicon_urls,
        check_unique_page_urls,
        check_bitmap_dimensions,
        check_bitmaps_per_icon,
        check_bitmap_parity,
        check_orphan_bitmaps,
        check_mapping_references,
    ];

    let mut report = CheckReport::default();
    for run in checks {
        if let Some(violation) = run(conn)? {
            error!("{}", violation.message);
            if !violation.rows.is_empty() {
                info!("Listing defective entries:");
                for row in &violation.rows {
                    info!("  {row}");
                }
            }
            report.violations.push(violation);
            break;
        }
    }
    Ok(report)
}

/// Validate the store file at `path`, opened read-only.
pub fn check_store<P: AsRef<Path>>(path: P) -> Result<CheckReport> {
    let conn = Connection::open_with_flags(path.as_ref(), OpenFlags::SQLITE_OPEN_READ_ONLY)?;
    check(&conn)
}

fn check_tables(conn: &Connection) -> Result<Option<Violation>> {
    let mut stmt = conn.prepare("SELECT name FROM sqlite_schema WHERE type = 'table'")?;
    let found: BTreeSet<String> = stmt
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    let expected: BTreeSet<String> = TABLES.iter().map(|t| t.to_string()).collect();

    if found != expected {
        return Ok(Some(Violation {
            check: Check::TableSet,
            message: format!("store table set {found:?} does not match expected {expected:?}"),
            rows: Vec::new(),
        }));
    }
    Ok(None)
}

fn check_nulls(conn: &Connection) -> Result<Option<Violation>> {
    for table in TABLES {
        let columns = table_columns(conn, table)?;
        if columns.is_empty() {
            // Missing table, so no rows to hold NULL; the table-set check
            // owns that failure.
            continue;
        }
        let condition = columns
            .iter()
            .map(|column| format!("{column} IS NULL"))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!("SELECT * FROM {table} WHERE {condition}");
        if let Some(violation) = violation_if_any(conn, Check::NullValues, &sql, |count| {
            format!("{count} row(s) in {table} contain NULL")
        })? {
            return Ok(Some(violation));
        }
    }
    Ok(None)
}

fn check_meta(conn: &Connection) -> Result<Option<Violation>> {
    let mut stmt = conn.prepare("SELECT key, value FROM meta")?;
    let mut rows = stmt.query([])?;
    let mut meta: BTreeMap<String, String> = BTreeMap::new();
    while let Some(row) = rows.next()? {
        meta.insert(row.get(0)?, loose_text(row.get_ref(1)?));
    }

    let found: BTreeSet<&str> = meta.keys().map(String::as_str).collect();
    let expected: BTreeSet<&str> = META_KEYS.iter().copied().collect();
    if found != expected {
        return Ok(Some(Violation {
            check: Check::MetaRecords,
            message: format!("meta key set {found:?} does not match expected {expected:?}"),
            rows: meta
                .iter()
                .map(|(key, value)| format!("{key} = {value}"))
                .collect(),
        }));
    }

    for key in ["version", "last_compatible_version"] {
        let value = &meta[key];
        match value.parse::<i64>() {
            Ok(version) if version >= 0 => {}
            _ => {
                return Ok(Some(Violation {
                    check: Check::MetaRecords,
                    message: format!("meta.{key} is not a non-negative integer"),
                    rows: vec![format!("{key} = {value}")],
                }));
            }
        }
    }
    Ok(None)
}

fn check_unique_favicon_urls(conn: &Connection) -> Result<Option<Violation>> {
    unique_violation(conn, "favicons", "url", Check::UniqueFaviconUrls)
}

fn check_unique_page_urls(conn: &Connection) -> Result<Option<Violation>> {
    unique_violation(conn, "icon_mapping", "page_url", Check::UniquePageUrls)
}

fn check_bitmap_dimensions(conn: &Connection) -> Result<Option<Violation>> {
    if let Some(violation) = violation_if_any(
        conn,
        Check::BitmapDimensions,
        "SELECT * FROM favicon_bitmaps WHERE width != height",
        |count| format!("{count} bitmap row(s) have non-matching width and height"),
    )? {
        return Ok(Some(violation));
    }

    let allowed = ICON_DIMENSIONS
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    violation_if_any(
        conn,
        Check::BitmapDimensions,
        &format!("SELECT * FROM favicon_bitmaps WHERE width NOT IN ({allowed})"),
        |count| format!("{count} bitmap row(s) have nonstandard dimensions"),
    )
}

fn check_bitmaps_per_icon(conn: &Connection) -> Result<Option<Violation>> {
    violation_if_any(
        conn,
        Check::BitmapsPerIcon,
        "SELECT * FROM favicon_bitmaps GROUP BY icon_id HAVING COUNT(*) != 2",
        |count| format!("{count} icon id(s) have a bitmap count other than two"),
    )
}

fn check_bitmap_parity(conn: &Connection) -> Result<Option<Violation>> {
    let favicons: i64 = conn.query_row("SELECT COUNT(*) FROM favicons", [], |row| row.get(0))?;
    let bitmaps: i64 =
        conn.query_row("SELECT COUNT(*) FROM favicon_bitmaps", [], |row| row.get(0))?;

    if favicons * 2 != bitmaps {
        return Ok(Some(Violation {
            check: Check::BitmapFaviconParity,
            message: format!(
                "count mismatch: {favicons} favicon row(s) but {bitmaps} bitmap row(s)"
            ),
            rows: Vec::new(),
        }));
    }
    Ok(None)
}

fn check_orphan_bitmaps(conn: &Connection) -> Result<Option<Violation>> {
    let bitmaps: i64 =
        conn.query_row("SELECT COUNT(*) FROM favicon_bitmaps", [], |row| row.get(0))?;
    let joined: i64 = conn.query_row(
        "SELECT COUNT(*) FROM favicons INNER JOIN favicon_bitmaps \
         ON favicon_bitmaps.icon_id = favicons.id",
        [],
        |row| row.get(0),
    )?;

    if joined != bitmaps {
        let rows = fetch_rows(
            conn,
            &format!(
                "SELECT * FROM favicon_bitmaps \
                 WHERE icon_id NOT IN (SELECT id FROM favicons) \
                 LIMIT {DIAGNOSTIC_ROW_LIMIT}"
            ),
        )?;
        return Ok(Some(Violation {
            check: Check::OrphanBitmaps,
            message: format!(
                "{} bitmap row(s) are not bound to any favicon",
                bitmaps - joined
            ),
            rows,
        }));
    }
    Ok(None)
}

fn check_mapping_references(conn: &Connection) -> Result<Option<Violation>> {
    violation_if_any(
        conn,
        Check::MappingReferences,
        "SELECT * FROM icon_mapping WHERE icon_id NOT IN (SELECT id FROM favicons)",
        |count| format!("{count} icon mapping(s) point to a nonexistent favicon"),
    )
}

/// Table and field names come from schema constants, never caller input.
fn unique_violation(
    conn: &Connection,
    table: &str,
    field: &str,
    check: Check,
) -> Result<Option<Violation>> {
    let sql = format!("SELECT * FROM {table} GROUP BY {field} HAVING COUNT(*) > 1");
    violation_if_any(conn, check, &sql, |count| {
        format!("{count} duplicate {field} value(s) in {table}")
    })
}

/// Run a probe query; a non-empty result becomes a violation carrying the
/// total match count and a bounded sample of the offending rows.
fn violation_if_any(
    conn: &Connection,
    check: Check,
    sql: &str,
    describe: impl FnOnce(i64) -> String,
) -> Result<Option<Violation>> {
    let count: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM ({sql})"), [], |row| {
        row.get(0)
    })?;
    if count == 0 {
        return Ok(None);
    }

    let rows = fetch_rows(conn, &format!("{sql} LIMIT {DIAGNOSTIC_ROW_LIMIT}"))?;
    Ok(Some(Violation {
        check,
        message: describe(count),
        rows,
    }))
}

fn table_columns(conn: &Connection, table: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_table_info(?1)")?;
    let columns = stmt
        .query_map([table], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(columns)
}

fn fetch_rows(conn: &Connection, sql: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let column_count = stmt.column_count();
    let mut rows = stmt.query([])?;

    let mut formatted = Vec::new();
    while let Some(row) = rows.next()? {
        let mut fields = Vec::with_capacity(column_count);
        for index in 0..column_count {
            fields.push(display_value(row.get_ref(index)?));
        }
        formatted.push(format!("({})", fields.join(", ")));
    }
    Ok(formatted)
}

fn display_value(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(v) => v.to_string(),
        ValueRef::Real(v) => v.to_string(),
        ValueRef::Text(v) => format!("{:?}", String::from_utf8_lossy(v)),
        ValueRef::Blob(v) => format!("<{} byte blob>", v.len()),
    }
}

/// Meta values may legally be stored with either text or integer affinity;
/// render both the same way so the numeric parse below sees one shape.
fn loose_text(value: ValueRef<'_>) -> String {
    match value {
        ValueRef::Null => "NULL".to_string(),
        ValueRef::Integer(v) => v.to_string(),
        ValueRef::Real(v) => v.to_string(),
        ValueRef::Text(v) => String::from_utf8_lossy(v).into_owned(),
        ValueRef::Blob(v) => format!("<{} byte blob>", v.len()),
    }
}
