use std::path::{Path, PathBuf};

use stratum_common::{Error, Result};
use tracing::{debug, info};

use crate::model::AppConfig;

const CONFIG_DIR: &str = ".stratum";
const CONFIG_FILE: &str = "config.yml";

/// Reads `AppConfig` from a YAML or TOML file, chosen by extension.
pub struct ConfigLoader {
    path: PathBuf,
}

impl ConfigLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Loader for `~/.stratum/config.yml`.
    pub fn from_default_location() -> Result<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| Error::Config("could not determine home directory".into()))?;
        Ok(Self::new(home.join(CONFIG_DIR).join(CONFIG_FILE)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the file, or defaults if it does not exist.
    pub fn load(&self) -> Result<AppConfig> {
        if !self.path.exists() {
            debug!("no config at {}, using defaults", self.path.display());
            return Ok(AppConfig::default());
        }
        let config = parse_config(&self.path)?;
        info!("loaded config from {}", self.path.display());
        Ok(config)
    }
}

fn parse_config(path: &Path) -> Result<AppConfig> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;

    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
    match ext {
        "yml" | "yaml" => serde_yaml::from_str(&contents)
            .map_err(|e| Error::Config(format!("YAML parse error in {}: {e}", path.display()))),
        "toml" => toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("TOML parse error in {}: {e}", path.display()))),
        other => Err(Error::Config(format!(
            "unsupported config extension: {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::LedgerBackend;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::new(dir.path().join("absent.yml")).load().unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.database.path, PathBuf::from("stratum.db"));
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn reads_partial_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        std::fs::write(
            &path,
            "database:\n  path: /var/lib/farm/data.db\nledger:\n  backend: json\n",
        )
        .unwrap();

        let config = ConfigLoader::new(&path).load().unwrap();
        assert_eq!(config.database.path, PathBuf::from("/var/lib/farm/data.db"));
        assert_eq!(config.ledger.backend, LedgerBackend::Json);
        assert_eq!(config.migrations.dir, PathBuf::from("migrations"));
        assert_eq!(
            config.ledger_path(),
            PathBuf::from("/var/lib/farm/data.ledger.json")
        );
    }

    #[test]
    fn reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[migrations]\ndir = \"db/migrations\"\n\n[log]\nlevel = \"debug\"\njson = true\n",
        )
        .unwrap();

        let config = ConfigLoader::new(&path).load().unwrap();
        assert_eq!(config.migrations.dir, PathBuf::from("db/migrations"));
        assert_eq!(config.log.level, "debug");
        assert!(config.log.json);
        assert_eq!(config.ledger_path(), PathBuf::from("stratum.db"));
    }

    #[test]
    fn rejects_unknown_extension_and_bad_syntax() {
        let dir = tempfile::tempdir().unwrap();
        let ini = dir.path().join("config.ini");
        std::fs::write(&ini, "x=1").unwrap();
        assert!(matches!(ConfigLoader::new(&ini).load(), Err(Error::Config(_))));

        let yml = dir.path().join("config.yml");
        std::fs::write(&yml, "database: [unclosed").unwrap();
        let err = ConfigLoader::new(&yml).load().unwrap_err();
        assert!(err.to_string().contains("YAML parse error"));
    }
}
