use thiserror::Error;

/// Errors produced by the migration engine.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// SQLite error (failed connection, bad statement, ...).
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Could not acquire or release the cluster migration lock.
    #[error("Lock error: {0}")]
    Lock(#[from] convoy_lock::LockError),

    /// The legacy `migration_version` table is present but not at the one
    /// version this engine knows how to convert.  Requires operator
    /// intervention; the legacy table is left untouched.
    #[error("must upgrade from version {expected}, current version: {actual}")]
    LegacyVersionMismatch { expected: i64, actual: i64 },

    /// Encryption strategy failure inside a code migration.
    #[error("Crypto error: {0}")]
    Crypto(#[from] convoy_crypto::CryptoError),

    /// Hex decoding error.
    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),

    /// The catalogue names a code migration the registry does not know.
    /// Configuration bug: the catalogue and registry have drifted.
    #[error("Unknown code migration: {0}")]
    UnknownCodeMigration(String),

    /// A migration step failed.  The schema stays at the last successfully
    /// applied version, marked dirty.
    #[error("Migration {version} failed: {cause}")]
    StepFailed { version: i64, cause: String },

    /// A downgrade path crosses a version with no down script.
    #[error("No down migration for version {0}, cannot downgrade past it")]
    MissingDownStep(i64),

    /// The migration source could not produce a named asset.
    #[error("Migration source unavailable: {0}")]
    SourceUnavailable(String),

    /// An asset name does not follow the catalogue naming convention.
    #[error("Invalid migration asset name: {0}")]
    InvalidAssetName(String),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MigrateError>;
