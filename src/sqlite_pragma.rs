//! Shared SQLite connection tuning

use rusqlite::Connection;

/// Apply the PRAGMAs every long-lived connection uses
///
/// WAL lets the batch aggregator's reads proceed while the event store is
/// being appended to. `busy_timeout` covers the short write lock windows.
pub fn apply_optimized_pragmas(conn: &Connection) -> Result<(), rusqlite::Error> {
    // journal_mode returns a row; in-memory databases report "memory"
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "cache_size", -16_000)?;
    conn.pragma_update(None, "wal_autocheckpoint", 1_000)?;
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    Ok(())
}
