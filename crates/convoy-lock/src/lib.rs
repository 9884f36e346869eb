//! # convoy-lock
//!
//! Cluster-wide advisory locks for service instances sharing one database.
//!
//! Each lock ID maps to its own lock file next to the database.  Holding a
//! lock means holding an immediate (write) transaction on that file, so the
//! operating system releases it if the process dies.  Acquisition blocks up
//! to the factory's busy timeout, then fails with [`LockError::Busy`].

use std::path::PathBuf;
use std::time::Duration;

use rusqlite::Connection;
use thiserror::Error;

/// Identifier for one advisory lock, shared by every process in the cluster.
///
/// IDs are reserved centrally so independent subsystems never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockId(pub i64);

/// Reserved for the schema migration engine.
pub const LOCK_ID_SCHEMA_MIGRATION: LockId = LockId(1);

/// Reserved for the data retention sweeper.
pub const LOCK_ID_DATA_RETENTION: LockId = LockId(2);

#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock {0} is held by another process")]
    Busy(i64),

    #[error("Lock database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, LockError>;

/// Hands out [`Lock`] guards for a fixed filesystem location.
///
/// `base` is typically the service database path; lock files are created
/// next to it (`app.db` locks under `app.lock-<id>`).
pub struct LockFactory {
    base: PathBuf,
    busy_timeout: Duration,
}

impl LockFactory {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self {
            base: base.into(),
            busy_timeout: Duration::from_secs(60),
        }
    }

    /// Override how long [`acquire`](Self::acquire) waits for a contended
    /// lock before giving up.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Acquire the lock, blocking up to the busy timeout.
    ///
    /// The returned guard holds the lock until dropped.
    pub fn acquire(&self, id: LockId) -> Result<Lock> {
        let path = self.base.with_extension(format!("lock-{}", id.0));
        let conn = Connection::open(&path)?;
        conn.busy_timeout(self.busy_timeout)?;

        // An immediate transaction takes the file's write lock up front.
        // A second holder gets SQLITE_BUSY once the timeout elapses.
        match conn.execute_batch("BEGIN IMMEDIATE") {
            Ok(()) => {}
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::DatabaseBusy =>
            {
                return Err(LockError::Busy(id.0));
            }
            Err(e) => return Err(e.into()),
        }

        tracing::debug!(lock_id = id.0, "acquired cluster lock");

        Ok(Lock {
            conn: Some(conn),
            id,
        })
    }
}

/// A held cluster lock.  Released on drop, on every exit path.
pub struct Lock {
    conn: Option<Connection>,
    id: LockId,
}

impl Drop for Lock {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = conn.execute_batch("ROLLBACK");
            tracing::debug!(lock_id = self.id.0, "released cluster lock");
        }
    }
}
