use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Top-level configuration, as read from `config.yml` or `config.toml`.
/// Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub migrations: MigrationsConfig,
    pub ledger: LedgerConfig,
    pub log: LogConfig,
}

impl AppConfig {
    /// Where the ledger lives: its own path for the JSON backend, otherwise
    /// the record store database.
    pub fn ledger_path(&self) -> PathBuf {
        match (self.ledger.backend, &self.ledger.path) {
            (LedgerBackend::Sqlite, _) => self.database.path.clone(),
            (LedgerBackend::Json, Some(path)) => path.clone(),
            (LedgerBackend::Json, None) => default_json_ledger(&self.database.path),
        }
    }
}

fn default_json_ledger(db_path: &Path) -> PathBuf {
    let mut name = db_path
        .file_stem()
        .map(|s| s.to_os_string())
        .unwrap_or_else(|| "stratum".into());
    name.push(".ledger.json");
    db_path.with_file_name(name)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("stratum.db"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationsConfig {
    pub dir: PathBuf,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("migrations"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerBackend {
    /// `_migrations` table inside the record store database.
    #[default]
    Sqlite,
    /// Standalone JSON document.
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub backend: LedgerBackend,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `tracing` filter directive, e.g. `info` or `stratum_db=debug`.
    pub level: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
