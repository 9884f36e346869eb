//! Code-migration dispatch.
//!
//! Some schema changes need application logic rather than SQL — re-keying
//! stored secrets being the usual case.  Each such migration is a method on
//! [`Runner`], registered by its catalogue asset name in [`Runner::run`].
//! The registry is a plain `match`, so a catalogue entry without a matching
//! arm is caught by tests at build time instead of surfacing in production.

use convoy_crypto::Strategy;
use rusqlite::{params, Connection};

use crate::error::{MigrateError, Result};

/// Executes code migrations against a live connection with the configured
/// encryption strategy.
pub struct Runner<'a> {
    conn: &'a Connection,
    strategy: &'a dyn Strategy,
}

impl<'a> Runner<'a> {
    pub fn new(conn: &'a Connection, strategy: &'a dyn Strategy) -> Self {
        Self { conn, strategy }
    }

    /// Resolve a catalogue name to its implementation and run it.
    ///
    /// An unknown name means the catalogue and this registry have drifted
    /// apart.  That is a configuration bug and is never skipped.
    pub fn run(&self, name: &str) -> Result<()> {
        match name {
            "1700000900_encrypt_node_tokens.up" => self.encrypt_node_tokens(),
            "1700000900_encrypt_node_tokens.down" => self.decrypt_node_tokens(),
            other => Err(MigrateError::UnknownCodeMigration(other.to_string())),
        }
    }

    /// Encrypt every plaintext node auth token with the configured strategy.
    /// Ciphertext is stored hex-encoded in the existing TEXT column.
    fn encrypt_node_tokens(&self) -> Result<()> {
        let tokens = self.node_tokens()?;
        let count = tokens.len();

        for (id, token) in tokens {
            let ciphertext = self.strategy.encrypt(token.as_bytes())?;
            self.conn.execute(
                "UPDATE nodes SET auth_token = ?1 WHERE id = ?2",
                params![hex::encode(ciphertext), id],
            )?;
        }

        tracing::info!(count, "encrypted node auth tokens");
        Ok(())
    }

    /// Reverse of [`Self::encrypt_node_tokens`]: restore plaintext tokens.
    fn decrypt_node_tokens(&self) -> Result<()> {
        let tokens = self.node_tokens()?;
        let count = tokens.len();

        for (id, token) in tokens {
            let ciphertext = hex::decode(&token)?;
            let plaintext = self.strategy.decrypt(&ciphertext)?;
            let token = String::from_utf8(plaintext)
                .map_err(|_| MigrateError::Crypto(convoy_crypto::CryptoError::DecryptionFailed))?;
            self.conn.execute(
                "UPDATE nodes SET auth_token = ?1 WHERE id = ?2",
                params![token, id],
            )?;
        }

        tracing::info!(count, "decrypted node auth tokens");
        Ok(())
    }

    fn node_tokens(&self) -> Result<Vec<(String, String)>> {
        let mut stmt = self.conn.prepare("SELECT id, auth_token FROM nodes")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(MigrateError::Sqlite)
    }
}
