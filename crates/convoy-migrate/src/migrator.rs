//! The orchestration core: plans and applies migration steps while holding
//! the cluster migration lock.
//!
//! State lives in two tables.  `schema_migrations` is a single row
//! `{version, dirty}`; `migrations_history` is an append-only log with one
//! row per attempt.  A failed step marks the schema dirty and aborts the
//! remaining plan; the next `migrate` call reattempts from the recorded
//! version (dirty never blocks a retry, and is only cleared by a
//! subsequently successful step).

use chrono::Utc;
use convoy_crypto::Strategy;
use convoy_lock::{LockFactory, LOCK_ID_SCHEMA_MIGRATION};
use rusqlite::{params, Connection};

use crate::error::{MigrateError, Result};
use crate::legacy::{self, table_exists};
use crate::runner::Runner;
use crate::source::{Direction, MigrationStep, SchemaVersion, Source};

pub struct Migrator<'a, S: Source> {
    conn: &'a Connection,
    lock_factory: &'a LockFactory,
    source: &'a S,
    strategy: &'a dyn Strategy,
}

impl<'a, S: Source> Migrator<'a, S> {
    pub fn new(
        conn: &'a Connection,
        lock_factory: &'a LockFactory,
        source: &'a S,
        strategy: &'a dyn Strategy,
    ) -> Self {
        Self {
            conn,
            lock_factory,
            source,
            strategy,
        }
    }

    /// The version currently recorded in the database.  0 when nothing has
    /// been applied yet.
    pub fn current_version(&self) -> Result<SchemaVersion> {
        let _lock = self.lock_factory.acquire(LOCK_ID_SCHEMA_MIGRATION)?;
        Ok(self.read_state()?.0)
    }

    /// The highest version in the catalogue — what this binary expects.
    /// Reads only the migration source, so no lock is taken.
    pub fn supported_version(&self) -> Result<SchemaVersion> {
        let steps = self.source.load()?;
        Ok(steps.last().map(|s| s.version()).unwrap_or(0))
    }

    /// Migrate to the latest supported version.
    pub fn up(&self) -> Result<()> {
        self.migrate(self.supported_version()?)
    }

    /// Migrate to an arbitrary target version, up or down.
    pub fn migrate(&self, target: SchemaVersion) -> Result<()> {
        let _lock = self.lock_factory.acquire(LOCK_ID_SCHEMA_MIGRATION)?;
        self.migrate_locked(target)
    }

    fn migrate_locked(&self, target: SchemaVersion) -> Result<()> {
        let steps = self.source.load()?;
        let base_version = steps.first().map(|s| s.version()).unwrap_or(0);

        // Normalize legacy state before anything reads the current version.
        legacy::convert_from_legacy(self.conn, base_version)?;

        let (current, dirty) = self.read_state()?;
        if target == current {
            return Ok(());
        }

        if dirty {
            tracing::warn!(
                version = current,
                "schema is marked dirty from a previous failed run, reattempting"
            );
        }

        self.ensure_tables()?;

        let plan = build_plan(&steps, current, target)?;
        tracing::info!(current, target, steps = plan.len(), "migrating schema");

        let mut at = current;
        for (step, resulting_version) in plan {
            self.apply(&step, resulting_version, at)?;
            at = resulting_version;
        }

        Ok(())
    }

    /// Execute one step.  `resulting_version` is what `schema_migrations`
    /// records on success; `at` is where the schema stays on failure.
    fn apply(
        &self,
        step: &MigrationStep,
        resulting_version: SchemaVersion,
        at: SchemaVersion,
    ) -> Result<()> {
        let version = step.version();
        let direction = step.direction();
        tracing::info!(version, direction = direction.as_str(), "applying migration");

        let result = match step {
            MigrationStep::Sql { statements, .. } => self
                .conn
                .execute_batch(statements)
                .map_err(MigrateError::from),
            MigrationStep::Code { name, .. } => {
                Runner::new(self.conn, self.strategy).run(name)
            }
        };

        match result {
            Ok(()) => {
                self.write_version(resulting_version, false)?;
                self.record_history(version, direction, "passed", false)?;
                Ok(())
            }
            // Catalogue/registry drift: nothing executed, nothing to mark.
            Err(err @ MigrateError::UnknownCodeMigration(_)) => Err(err),
            Err(err) => {
                tracing::error!(version, error = %err, "migration step failed");
                self.record_history(version, direction, "failed", true)?;
                self.write_version(at, true)?;
                Err(MigrateError::StepFailed {
                    version,
                    cause: err.to_string(),
                })
            }
        }
    }

    /// Read `{version, dirty}`.  Falls back to the newest passed history
    /// row when `schema_migrations` is missing or empty, so a database
    /// whose version row was lost can still be recovered.
    fn read_state(&self) -> Result<(SchemaVersion, bool)> {
        if table_exists(self.conn, "schema_migrations")? {
            match self.conn.query_row(
                "SELECT version, dirty FROM schema_migrations LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            ) {
                Ok(state) => return Ok(state),
                Err(rusqlite::Error::QueryReturnedNoRows) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if table_exists(self.conn, "migrations_history")? {
            match self.conn.query_row(
                "SELECT version FROM migrations_history
                 WHERE status = 'passed' AND direction = 'up'
                 ORDER BY rowid DESC LIMIT 1",
                [],
                |row| row.get(0),
            ) {
                Ok(version) => return Ok((version, false)),
                Err(rusqlite::Error::QueryReturnedNoRows) => {}
                Err(e) => return Err(e.into()),
            }
        }

        Ok((0, false))
    }

    fn ensure_tables(&self) -> Result<()> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_migrations (version bigint, dirty boolean);
             CREATE TABLE IF NOT EXISTS migrations_history (version bigint, tstamp timestamptz, direction varchar, status varchar, dirty boolean);",
        )?;
        Ok(())
    }

    // Single-row discipline: replace whatever is there, including stale
    // dirty rows left by older tooling.
    fn write_version(&self, version: SchemaVersion, dirty: bool) -> Result<()> {
        self.conn.execute("DELETE FROM schema_migrations", [])?;
        self.conn.execute(
            "INSERT INTO schema_migrations (version, dirty) VALUES (?1, ?2)",
            params![version, dirty],
        )?;
        Ok(())
    }

    fn record_history(
        &self,
        version: SchemaVersion,
        direction: Direction,
        status: &str,
        dirty: bool,
    ) -> Result<()> {
        self.conn.execute(
            "INSERT INTO migrations_history (version, tstamp, direction, status, dirty)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                version,
                Utc::now().to_rfc3339(),
                direction.as_str(),
                status,
                dirty
            ],
        )?;
        Ok(())
    }
}

/// Select and order the steps for one run.  Each plan entry carries the
/// version `schema_migrations` should record once that step passes: the
/// step's own version going up, the next catalogue version below it going
/// down.
fn build_plan(
    steps: &[MigrationStep],
    current: SchemaVersion,
    target: SchemaVersion,
) -> Result<Vec<(MigrationStep, SchemaVersion)>> {
    let mut up_versions: Vec<SchemaVersion> = steps
        .iter()
        .filter(|s| s.direction() == Direction::Up)
        .map(|s| s.version())
        .collect();
    up_versions.dedup();

    if target > current {
        Ok(steps
            .iter()
            .filter(|s| {
                s.direction() == Direction::Up && s.version() > current && s.version() <= target
            })
            .map(|s| (s.clone(), s.version()))
            .collect())
    } else {
        let mut plan = Vec::new();

        for &version in up_versions
            .iter()
            .rev()
            .filter(|&&v| v > target && v <= current)
        {
            let down = steps
                .iter()
                .find(|s| s.direction() == Direction::Down && s.version() == version)
                .ok_or(MigrateError::MissingDownStep(version))?;

            let resulting = up_versions
                .iter()
                .copied()
                .filter(|&v| v < version)
                .max()
                .unwrap_or(0);

            plan.push((down.clone(), resulting));
        }

        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::tests_support::TestSource;
    use convoy_crypto::NoEncryption;

    fn setup() -> (tempfile::TempDir, Connection, LockFactory) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.db");
        let conn = Connection::open(&path).unwrap();
        let factory = LockFactory::new(&path);
        (dir, conn, factory)
    }

    fn catalogue() -> TestSource {
        TestSource::sql(&[
            ("100_one.up.sql", "CREATE TABLE t100 (x int);"),
            ("100_one.down.sql", "DROP TABLE t100;"),
            ("200_two.up.sql", "CREATE TABLE t200 (x int);"),
            ("200_two.down.sql", "DROP TABLE t200;"),
            ("300_three.up.sql", "CREATE TABLE t300 (x int);"),
            ("300_three.down.sql", "DROP TABLE t300;"),
        ])
    }

    fn history(conn: &Connection) -> Vec<(i64, String, String)> {
        let mut stmt = conn
            .prepare("SELECT version, direction, status FROM migrations_history ORDER BY rowid")
            .unwrap();
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .unwrap();
        rows.collect::<std::result::Result<Vec<_>, _>>().unwrap()
    }

    fn state(conn: &Connection) -> (i64, bool) {
        conn.query_row("SELECT version, dirty FROM schema_migrations", [], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })
        .unwrap()
    }

    #[test]
    fn test_up_applies_all_steps() {
        let (_dir, conn, factory) = setup();
        let source = catalogue();
        let migrator = Migrator::new(&conn, &factory, &source, &NoEncryption);

        migrator.up().unwrap();

        assert_eq!(migrator.current_version().unwrap(), 300);
        assert_eq!(state(&conn), (300, false));
        assert!(table_exists(&conn, "t100").unwrap());
        assert!(table_exists(&conn, "t300").unwrap());

        // Passed rows form a contiguous ascending chain.
        let versions: Vec<i64> = history(&conn).iter().map(|(v, _, _)| *v).collect();
        assert_eq!(versions, vec![100, 200, 300]);
    }

    #[test]
    fn test_supported_version_is_catalogue_max() {
        let (_dir, conn, factory) = setup();
        let source = catalogue();
        let migrator = Migrator::new(&conn, &factory, &source, &NoEncryption);

        assert_eq!(migrator.supported_version().unwrap(), 300);
    }

    #[test]
    fn test_current_version_on_fresh_database_is_zero() {
        let (_dir, conn, factory) = setup();
        let source = catalogue();
        let migrator = Migrator::new(&conn, &factory, &source, &NoEncryption);

        assert_eq!(migrator.current_version().unwrap(), 0);
    }

    #[test]
    fn test_migrate_to_current_version_writes_nothing() {
        let (_dir, conn, factory) = setup();
        let source = catalogue();
        let migrator = Migrator::new(&conn, &factory, &source, &NoEncryption);

        migrator.up().unwrap();
        let before = history(&conn);

        migrator.migrate(300).unwrap();

        assert_eq!(history(&conn), before);
        assert_eq!(state(&conn), (300, false));
    }

    #[test]
    fn test_partial_upgrade_stops_at_target() {
        let (_dir, conn, factory) = setup();
        let source = catalogue();
        let migrator = Migrator::new(&conn, &factory, &source, &NoEncryption);

        migrator.migrate(200).unwrap();

        assert_eq!(state(&conn), (200, false));
        assert!(table_exists(&conn, "t200").unwrap());
        assert!(!table_exists(&conn, "t300").unwrap());
    }

    #[test]
    fn test_downgrade_applies_down_steps_in_descending_order() {
        let (_dir, conn, factory) = setup();
        let source = catalogue();
        let migrator = Migrator::new(&conn, &factory, &source, &NoEncryption);

        migrator.up().unwrap();
        migrator.migrate(100).unwrap();

        assert_eq!(state(&conn), (100, false));
        assert!(table_exists(&conn, "t100").unwrap());
        assert!(!table_exists(&conn, "t200").unwrap());
        assert!(!table_exists(&conn, "t300").unwrap());

        let tail: Vec<(i64, String)> = history(&conn)
            .iter()
            .skip(3)
            .map(|(v, d, _)| (*v, d.clone()))
            .collect();
        assert_eq!(
            tail,
            vec![(300, "down".to_string()), (200, "down".to_string())]
        );
    }

    #[test]
    fn test_missing_down_step_aborts_before_any_step_runs() {
        let (_dir, conn, factory) = setup();
        let source = TestSource::sql(&[
            ("100_one.up.sql", "CREATE TABLE t100 (x int);"),
            ("100_one.down.sql", "DROP TABLE t100;"),
            ("200_two.up.sql", "CREATE TABLE t200 (x int);"),
            // 200 has no down script: irreversible.
            ("300_three.up.sql", "CREATE TABLE t300 (x int);"),
            ("300_three.down.sql", "DROP TABLE t300;"),
        ]);
        let migrator = Migrator::new(&conn, &factory, &source, &NoEncryption);

        migrator.up().unwrap();
        let err = migrator.migrate(100).unwrap_err();

        assert!(matches!(err, MigrateError::MissingDownStep(200)));
        // 300's down script was planned after the gap was found, so it
        // never ran.
        assert_eq!(state(&conn), (300, false));
        assert!(table_exists(&conn, "t300").unwrap());
    }

    #[test]
    fn test_failed_step_marks_dirty_and_aborts() {
        let (_dir, conn, factory) = setup();
        let source = TestSource::sql(&[
            ("100_one.up.sql", "CREATE TABLE t100 (x int);"),
            ("200_two.up.sql", "THIS IS NOT SQL;"),
            ("300_three.up.sql", "CREATE TABLE t300 (x int);"),
        ]);
        let migrator = Migrator::new(&conn, &factory, &source, &NoEncryption);

        let err = migrator.up().unwrap_err();
        assert!(matches!(err, MigrateError::StepFailed { version: 200, .. }));

        // Schema stays at the last good version, explicitly dirty.
        assert_eq!(state(&conn), (100, true));
        assert!(!table_exists(&conn, "t300").unwrap());

        let rows = history(&conn);
        assert_eq!(rows[0], (100, "up".to_string(), "passed".to_string()));
        assert_eq!(rows[1], (200, "up".to_string(), "failed".to_string()));
    }

    #[test]
    fn test_dirty_state_does_not_block_a_retry() {
        let (_dir, conn, factory) = setup();
        let broken = TestSource::sql(&[
            ("100_one.up.sql", "CREATE TABLE t100 (x int);"),
            ("200_two.up.sql", "THIS IS NOT SQL;"),
        ]);
        Migrator::new(&conn, &factory, &broken, &NoEncryption)
            .up()
            .unwrap_err();
        assert_eq!(state(&conn), (100, true));

        // The next deploy ships a fixed catalogue; reattempting clears
        // dirty once a step passes.
        let fixed = TestSource::sql(&[
            ("100_one.up.sql", "CREATE TABLE t100 (x int);"),
            ("200_two.up.sql", "CREATE TABLE t200 (x int);"),
        ]);
        Migrator::new(&conn, &factory, &fixed, &NoEncryption)
            .up()
            .unwrap();
        assert_eq!(state(&conn), (200, false));
    }

    #[test]
    fn test_code_step_routes_through_registry() {
        let (_dir, conn, factory) = setup();
        let source = TestSource::with_code(
            &[(
                "100_nodes.up.sql",
                "CREATE TABLE nodes (id TEXT PRIMARY KEY, name TEXT, auth_token TEXT, created_at TEXT);
                 INSERT INTO nodes VALUES ('n1', 'node-1', 'tok-one', '2024-01-01T00:00:00Z');",
            )],
            &["1700000900_encrypt_node_tokens.up"],
        );
        let migrator = Migrator::new(&conn, &factory, &source, &NoEncryption);

        migrator.up().unwrap();

        assert_eq!(state(&conn), (1700000900, false));
        let token: String = conn
            .query_row("SELECT auth_token FROM nodes WHERE id = 'n1'", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(token, hex::encode("tok-one"));
    }

    #[test]
    fn test_unregistered_code_step_is_fatal() {
        let (_dir, conn, factory) = setup();
        let source = TestSource::with_code(
            &[("100_one.up.sql", "CREATE TABLE t100 (x int);")],
            &["200_not_in_registry.up"],
        );
        let migrator = Migrator::new(&conn, &factory, &source, &NoEncryption);

        let err = migrator.up().unwrap_err();
        assert!(matches!(err, MigrateError::UnknownCodeMigration(_)));

        // Nothing executed for the unknown step: no dirty marker, no
        // history row for it.
        assert_eq!(state(&conn), (100, false));
        assert_eq!(history(&conn).len(), 1);
    }

    #[test]
    fn test_legacy_conversion_runs_before_planning() {
        let (_dir, conn, factory) = setup();
        conn.execute_batch(
            "CREATE TABLE migration_version (version int);
             INSERT INTO migration_version (version) VALUES (189);",
        )
        .unwrap();
        // The legacy final schema equals the catalogue's first migration.
        conn.execute_batch("CREATE TABLE t100 (x int);").unwrap();

        let source = catalogue();
        let migrator = Migrator::new(&conn, &factory, &source, &NoEncryption);

        migrator.migrate(200).unwrap();

        assert!(!table_exists(&conn, "migration_version").unwrap());
        assert_eq!(state(&conn), (200, false));
        assert!(table_exists(&conn, "t200").unwrap());
        // Only 200 was applied; 100 was credited by the conversion.
        let versions: Vec<i64> = history(&conn).iter().map(|(v, _, _)| *v).collect();
        assert_eq!(versions, vec![200]);
    }
}
