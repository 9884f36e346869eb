//! One-time conversion from the deprecated `migration_version` scheme.
//!
//! Databases created before the current engine track their schema with a
//! single-row `migration_version(version int)` table.  The only convertible
//! value is [`LEGACY_FINAL_VERSION`], the last version that scheme ever
//! produced; anything else means the deployment skipped required upgrades
//! and an operator has to intervene.  Conversion is one-way: the legacy
//! table is dropped and `schema_migrations` is seeded at the first version
//! of the new scheme.

use rusqlite::{params, Connection};

use crate::error::{MigrateError, Result};
use crate::source::SchemaVersion;

/// The last version ever written by the legacy scheme.
pub const LEGACY_FINAL_VERSION: i64 = 189;

/// Convert a legacy-scheme database to the current version tracking.
///
/// No-op when no `migration_version` table exists.  `base_version` is the
/// catalogue's first new-scheme version; the legacy final schema is, by
/// construction, identical to the result of that first migration, so it is
/// recorded as already applied.
pub fn convert_from_legacy(conn: &Connection, base_version: SchemaVersion) -> Result<()> {
    if !table_exists(conn, "migration_version")? {
        return Ok(());
    }

    let actual: i64 = conn.query_row("SELECT version FROM migration_version", [], |row| {
        row.get(0)
    })?;

    if actual != LEGACY_FINAL_VERSION {
        return Err(MigrateError::LegacyVersionMismatch {
            expected: LEGACY_FINAL_VERSION,
            actual,
        });
    }

    tracing::info!(
        legacy_version = actual,
        seed_version = base_version,
        "converting legacy migration_version table"
    );

    conn.execute_batch("DROP TABLE IF EXISTS migration_version")?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (version bigint, dirty boolean)",
    )?;
    conn.execute(
        "INSERT INTO schema_migrations (version, dirty) VALUES (?1, false)",
        params![base_version],
    )?;

    Ok(())
}

/// True when a table with this name exists in the connected database.
pub(crate) fn table_exists(conn: &Connection, name: &str) -> Result<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?1",
        params![name],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}
