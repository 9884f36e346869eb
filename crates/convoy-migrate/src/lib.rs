//! # convoy-migrate
//!
//! Versioned schema migrations for the service database.  Brings a database
//! from whatever state it is in up (or down) to a target schema version,
//! safely, even when many service instances start at once against the same
//! database: every run holds the cluster-wide migration lock from
//! [`convoy-lock`](convoy_lock).
//!
//! The catalogue mixes plain SQL steps with code migrations — imperative
//! steps that need application logic, such as re-encrypting stored secrets
//! with the configured [`convoy-crypto`](convoy_crypto) strategy.
//! Databases created by the deprecated single-row `migration_version`
//! scheme are converted transparently on first contact.
//!
//! Entry point is [`Gateway`]; the service startup sequence calls
//! [`Gateway::open`] and receives a fully migrated connection.

pub mod gateway;
pub mod legacy;
pub mod migrator;
pub mod runner;
pub mod source;

mod error;

pub use error::{MigrateError, Result};
pub use gateway::Gateway;
pub use legacy::LEGACY_FINAL_VERSION;
pub use migrator::Migrator;
pub use source::{Direction, EmbeddedSource, MigrationStep, SchemaVersion, Source};
