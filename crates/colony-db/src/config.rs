use std::env;
use std::path::{Path, PathBuf};

/// Database configuration.
///
/// Reads from the `COLONY_DB_PATH` environment variable, falling back to a
/// per-user data directory.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Filesystem path of the SQLite database file.
    pub database_path: PathBuf,
}

impl DbConfig {
    /// Build a config from the environment.
    ///
    /// Priority: `COLONY_DB_PATH` env var, then the platform default.
    pub fn from_env() -> Self {
        let database_path = env::var_os("COLONY_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(Self::default_path);
        Self { database_path }
    }

    /// Build a config from an explicit path (useful for tests and embedders).
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: path.into(),
        }
    }

    /// Default location: `<local data dir>/colony/colony.db`, falling back
    /// to the current directory when the platform has no known data dir.
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("colony")
            .join("colony.db")
    }

    pub fn path(&self) -> &Path {
        &self.database_path
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
