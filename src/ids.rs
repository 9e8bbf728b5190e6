//! Identifier allocation for the append-only store tables.

use crate::error::Result;
use rusqlite::Connection;

/// Next free identifier for `table`: the largest existing id plus one, or 1
/// for an empty table.
///
/// Nothing in this crate deletes rows, but the allocator makes no gap-free
/// assumption either way; max()+1 is the only contract.
pub fn next_id(conn: &Connection, table: &str) -> Result<i64> {
    // Table names come from schema constants, never from caller input.
    let max: Option<i64> = conn.query_row(&format!("SELECT MAX(id) FROM {table}"), [], |row| {
        row.get(0)
    })?;
    Ok(max.map_or(1, |id| id + 1))
}
