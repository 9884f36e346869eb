//! Migration catalogue loading.
//!
//! A [`Source`] is an opaque store of named byte blobs.  SQL steps are
//! assets named `<version>_<description>.<up|down>.sql`; code steps carry
//! the same shape minus the `.sql` suffix and resolve against the static
//! registry in [`crate::runner`].  The shipped catalogue is embedded into
//! the binary at compile time.

use crate::error::{MigrateError, Result};

/// Monotonically ordered identifier for one unit of schema change.
/// By convention a Unix timestamp taken when the migration was written.
pub type SchemaVersion = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Up => "up",
            Direction::Down => "down",
        }
    }
}

/// One step of the migration catalogue, immutable once loaded.
#[derive(Debug, Clone)]
pub enum MigrationStep {
    /// Raw SQL, executed as a batch against the live connection.
    Sql {
        version: SchemaVersion,
        direction: Direction,
        statements: String,
    },
    /// Imperative migration, dispatched by name through the code registry.
    Code {
        version: SchemaVersion,
        direction: Direction,
        name: String,
    },
}

impl MigrationStep {
    pub fn version(&self) -> SchemaVersion {
        match self {
            MigrationStep::Sql { version, .. } => *version,
            MigrationStep::Code { version, .. } => *version,
        }
    }

    pub fn direction(&self) -> Direction {
        match self {
            MigrationStep::Sql { direction, .. } => *direction,
            MigrationStep::Code { direction, .. } => *direction,
        }
    }
}

/// Read-only, deterministic store of migration definitions.
pub trait Source {
    /// Names of every available asset, in no particular order.
    fn asset_names(&self) -> Vec<String>;

    /// Raw bytes for one asset.
    fn asset(&self, name: &str) -> Result<Vec<u8>>;

    /// Parse every asset into a [`MigrationStep`], sorted ascending by
    /// version.
    fn load(&self) -> Result<Vec<MigrationStep>> {
        let mut steps = Vec::new();

        for name in self.asset_names() {
            let (version, direction, is_sql) = parse_name(&name)?;

            let step = if is_sql {
                let bytes = self.asset(&name)?;
                let statements = String::from_utf8(bytes).map_err(|_| {
                    MigrateError::SourceUnavailable(format!("{name}: not valid UTF-8"))
                })?;
                MigrationStep::Sql {
                    version,
                    direction,
                    statements,
                }
            } else {
                MigrationStep::Code {
                    version,
                    direction,
                    name,
                }
            };

            steps.push(step);
        }

        steps.sort_by_key(|s| s.version());
        Ok(steps)
    }
}

/// Split `<version>_<description>.<up|down>[.sql]` into its parts.
fn parse_name(name: &str) -> Result<(SchemaVersion, Direction, bool)> {
    let (stem, is_sql) = match name.strip_suffix(".sql") {
        Some(stem) => (stem, true),
        None => (name, false),
    };

    let (stem, direction) = if let Some(stem) = stem.strip_suffix(".up") {
        (stem, Direction::Up)
    } else if let Some(stem) = stem.strip_suffix(".down") {
        (stem, Direction::Down)
    } else {
        return Err(MigrateError::InvalidAssetName(name.to_string()));
    };

    let version = stem
        .split('_')
        .next()
        .and_then(|v| v.parse::<SchemaVersion>().ok())
        .ok_or_else(|| MigrateError::InvalidAssetName(name.to_string()))?;

    Ok((version, direction, is_sql))
}

/// The catalogue shipped with this binary, embedded at compile time so a
/// deployed service can never lose its migration definitions.
pub struct EmbeddedSource;

static ASSETS: &[(&str, &[u8])] = &[
    (
        "1700000000_initial_schema.up.sql",
        include_bytes!("../assets/1700000000_initial_schema.up.sql"),
    ),
    (
        "1700000000_initial_schema.down.sql",
        include_bytes!("../assets/1700000000_initial_schema.down.sql"),
    ),
    (
        "1700000500_add_job_logs.up.sql",
        include_bytes!("../assets/1700000500_add_job_logs.up.sql"),
    ),
    (
        "1700000500_add_job_logs.down.sql",
        include_bytes!("../assets/1700000500_add_job_logs.down.sql"),
    ),
    // Code migrations carry no payload; the name is the whole definition.
    ("1700000900_encrypt_node_tokens.up", b""),
    ("1700000900_encrypt_node_tokens.down", b""),
];

impl Source for EmbeddedSource {
    fn asset_names(&self) -> Vec<String> {
        ASSETS.iter().map(|(name, _)| name.to_string()).collect()
    }

    fn asset(&self, name: &str) -> Result<Vec<u8>> {
        ASSETS
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, bytes)| bytes.to_vec())
            .ok_or_else(|| MigrateError::SourceUnavailable(name.to_string()))
    }
}

#[cfg(test)]
pub(crate) mod tests_support {
    use super::*;

    /// In-memory source for tests, mirroring the embedded catalogue shape.
    pub(crate) struct TestSource {
        assets: Vec<(String, Vec<u8>)>,
    }

    impl TestSource {
        pub(crate) fn sql(entries: &[(&str, &str)]) -> Self {
            Self::with_code(entries, &[])
        }

        pub(crate) fn with_code(sql: &[(&str, &str)], code: &[&str]) -> Self {
            let mut assets: Vec<(String, Vec<u8>)> = sql
                .iter()
                .map(|(name, body)| (name.to_string(), body.as_bytes().to_vec()))
                .collect();
            assets.extend(code.iter().map(|name| (name.to_string(), Vec::new())));
            Self { assets }
        }
    }

    impl Source for TestSource {
        fn asset_names(&self) -> Vec<String> {
            self.assets.iter().map(|(name, _)| name.clone()).collect()
        }

        fn asset(&self, name: &str) -> Result<Vec<u8>> {
            self.assets
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, bytes)| bytes.clone())
                .ok_or_else(|| MigrateError::SourceUnavailable(name.to_string()))
        }
    }
}
