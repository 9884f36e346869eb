//! Top-level facade over the migration engine.
//!
//! A [`Gateway`] is the only surface other subsystems are allowed to call;
//! nothing else may touch the migration tables.  Every operation opens its
//! own connection and closes it deterministically — a caller never receives
//! a half-migrated handle.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use convoy_crypto::Strategy;
use convoy_lock::LockFactory;
use rusqlite::Connection;

use crate::error::Result;
use crate::legacy;
use crate::migrator::Migrator;
use crate::source::{EmbeddedSource, SchemaVersion, Source};

pub struct Gateway<S: Source = EmbeddedSource> {
    path: PathBuf,
    lock_factory: LockFactory,
    strategy: Arc<dyn Strategy>,
    source: S,
}

impl Gateway<EmbeddedSource> {
    /// Gateway over the catalogue shipped with this binary.
    pub fn new(path: impl Into<PathBuf>, strategy: Arc<dyn Strategy>) -> Self {
        Self::with_source(path, strategy, EmbeddedSource)
    }
}

impl<S: Source> Gateway<S> {
    /// Gateway over an explicit source.  Used by tooling and tests that
    /// pin their own catalogue.
    pub fn with_source(path: impl Into<PathBuf>, strategy: Arc<dyn Strategy>, source: S) -> Self {
        let path = path.into();
        let lock_factory = LockFactory::new(&path);

        Self {
            path,
            lock_factory,
            strategy,
            source,
        }
    }

    /// Override how long a blocked instance waits for another instance's
    /// migration run to finish.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_factory = LockFactory::new(&self.path).with_busy_timeout(timeout);
        self
    }

    pub fn current_version(&self) -> Result<SchemaVersion> {
        let conn = self.open_conn()?;
        self.migrator(&conn).current_version()
    }

    pub fn supported_version(&self) -> Result<SchemaVersion> {
        let conn = self.open_conn()?;
        self.migrator(&conn).supported_version()
    }

    /// Open the database, migrated to the latest supported version, and
    /// hand the live connection to the caller.
    pub fn open(&self) -> Result<Connection> {
        let conn = self.open_conn()?;
        self.migrator(&conn).up()?;
        Ok(conn)
    }

    /// Like [`open`](Self::open), but pinned at an arbitrary version.
    pub fn open_at_version(&self, version: SchemaVersion) -> Result<Connection> {
        let conn = self.open_conn()?;
        self.migrator(&conn).migrate(version)?;
        Ok(conn)
    }

    /// Migrate to an arbitrary version and close the connection.
    ///
    /// Runs the legacy conversion explicitly first, so a legacy-scheme
    /// database can jump straight to a non-latest target.
    pub fn migrate_to_version(&self, version: SchemaVersion) -> Result<()> {
        let conn = self.open_conn()?;
        let migrator = self.migrator(&conn);

        {
            let _lock = self
                .lock_factory
                .acquire(convoy_lock::LOCK_ID_SCHEMA_MIGRATION)?;
            let steps = self.source.load()?;
            let base_version = steps.first().map(|s| s.version()).unwrap_or(0);
            legacy::convert_from_legacy(&conn, base_version)?;
        }

        migrator.migrate(version)
    }

    fn open_conn(&self) -> Result<Connection> {
        tracing::debug!(path = %self.path.display(), "opening database");
        let conn = Connection::open(&self.path)?;

        // Recommended SQLite settings.
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(Duration::from_secs(30))?;

        Ok(conn)
    }

    fn migrator<'a>(&'a self, conn: &'a Connection) -> Migrator<'a, S> {
        Migrator::new(conn, &self.lock_factory, &self.source, self.strategy.as_ref())
    }
}
