use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use stratum_common::{Error, Result, Version};
use tracing::{debug, info};

/// One applied migration, as recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub version: Version,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn now(version: Version, name: impl Into<String>) -> Self {
        Self {
            version,
            name: name.into(),
            applied_at: Utc::now(),
        }
    }

    pub fn matches(&self, version: Version, name: &str) -> bool {
        self.version == version && self.name == name
    }
}

/// Durable record of which migrations are applied, in application order.
///
/// Writes are serialized and durable before the call returns.
pub trait Ledger: Send + Sync {
    /// Applied entries, oldest application first.
    fn entries(&self) -> Result<Vec<LedgerEntry>>;

    fn mark_applied(&self, entry: LedgerEntry) -> Result<()>;

    fn mark_reverted(&self, version: Version, name: &str) -> Result<()>;

    fn applied_set(&self) -> Result<BTreeSet<Version>> {
        Ok(self.entries()?.into_iter().map(|e| e.version).collect())
    }
}

fn append_entry(entries: &mut Vec<LedgerEntry>, entry: LedgerEntry) -> Result<()> {
    if entries.iter().any(|e| e.matches(entry.version, &entry.name)) {
        return Err(Error::Ledger(format!(
            "migration {}_{} is already recorded as applied",
            entry.version, entry.name
        )));
    }
    entries.push(entry);
    Ok(())
}

fn remove_entry(entries: &mut Vec<LedgerEntry>, version: Version, name: &str) -> Result<()> {
    let index = entries
        .iter()
        .position(|e| e.matches(version, name))
        .ok_or_else(|| {
            Error::Ledger(format!(
                "migration {version}_{name} is not recorded as applied"
            ))
        })?;
    entries.remove(index);
    Ok(())
}

/// Ledger kept in process memory.
#[derive(Default)]
pub struct MemoryLedger {
    entries: Mutex<Vec<LedgerEntry>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<LedgerEntry>) -> Self {
        Self {
            entries: Mutex::new(entries),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, Vec<LedgerEntry>>> {
        self.entries
            .lock()
            .map_err(|_| Error::Ledger("memory ledger lock poisoned".into()))
    }
}

impl Ledger for MemoryLedger {
    fn entries(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.guard()?.clone())
    }

    fn mark_applied(&self, entry: LedgerEntry) -> Result<()> {
        append_entry(&mut *self.guard()?, entry)
    }

    fn mark_reverted(&self, version: Version, name: &str) -> Result<()> {
        remove_entry(&mut *self.guard()?, version, name)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    applied: Vec<LedgerEntry>,
}

/// Ledger stored as a JSON document on disk.
///
/// Every write goes to a sibling temp file which is synced and then renamed
/// over the ledger, so a crash leaves either the old or the new document.
pub struct JsonFileLedger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonFileLedger {
    pub fn open(path: &Path) -> Result<Self> {
        info!("using JSON ledger at {}", path.display());
        let ledger = Self {
            path: path.to_path_buf(),
            write_lock: Mutex::new(()),
        };
        // Fail early on an unreadable document.
        ledger.read()?;
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<LedgerFile> {
        if !self.path.exists() {
            return Ok(LedgerFile::default());
        }
        let contents = fs::read_to_string(&self.path).map_err(|e| {
            Error::Ledger(format!("failed to read {}: {e}", self.path.display()))
        })?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::Ledger(format!("failed to parse {}: {e}", self.path.display())))
    }

    fn write(&self, file: &LedgerFile) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Ledger(format!("failed to create {}: {e}", parent.display()))
            })?;
        }

        let tmp = self.path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(file)?;
        let mut out = File::create(&tmp)
            .map_err(|e| Error::Ledger(format!("failed to create {}: {e}", tmp.display())))?;
        out.write_all(&bytes)
            .and_then(|_| out.sync_all())
            .map_err(|e| Error::Ledger(format!("failed to write {}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path).map_err(|e| {
            Error::Ledger(format!("failed to replace {}: {e}", self.path.display()))
        })?;
        debug!("ledger written to {}", self.path.display());
        Ok(())
    }

    fn update(&self, f: impl FnOnce(&mut Vec<LedgerEntry>) -> Result<()>) -> Result<()> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| Error::Ledger("ledger write lock poisoned".into()))?;
        let mut file = self.read()?;
        f(&mut file.applied)?;
        self.write(&file)
    }
}

impl Ledger for JsonFileLedger {
    fn entries(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.read()?.applied)
    }

    fn mark_applied(&self, entry: LedgerEntry) -> Result<()> {
        self.update(|entries| append_entry(entries, entry))
    }

    fn mark_reverted(&self, version: Version, name: &str) -> Result<()> {
        self.update(|entries| remove_entry(entries, version, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_ledger_keeps_application_order() {
        let ledger = MemoryLedger::new();
        ledger.mark_applied(LedgerEntry::now(Version::new(5), "b")).unwrap();
        ledger.mark_applied(LedgerEntry::now(Version::new(2), "a")).unwrap();

        let versions: Vec<_> = ledger.entries().unwrap().iter().map(|e| e.version).collect();
        assert_eq!(versions, vec![Version::new(5), Version::new(2)]);

        let set = ledger.applied_set().unwrap();
        assert!(set.contains(&Version::new(2)));
        assert!(set.contains(&Version::new(5)));
    }

    #[test]
    fn double_apply_and_unknown_revert_are_errors() {
        let ledger = MemoryLedger::new();
        ledger.mark_applied(LedgerEntry::now(Version::new(1), "a")).unwrap();
        assert!(matches!(
            ledger.mark_applied(LedgerEntry::now(Version::new(1), "a")),
            Err(Error::Ledger(_))
        ));
        assert!(ledger.mark_reverted(Version::new(9), "z").is_err());
        ledger.mark_reverted(Version::new(1), "a").unwrap();
        assert!(ledger.entries().unwrap().is_empty());
    }

    #[test]
    fn same_version_different_name_are_distinct_entries() {
        let ledger = MemoryLedger::new();
        ledger.mark_applied(LedgerEntry::now(Version::new(1), "a")).unwrap();
        ledger.mark_applied(LedgerEntry::now(Version::new(1), "b")).unwrap();
        ledger.mark_reverted(Version::new(1), "a").unwrap();
        let entries = ledger.entries().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "b");
    }

    #[test]
    fn json_ledger_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("ledger.json");

        let ledger = JsonFileLedger::open(&path).unwrap();
        assert!(ledger.entries().unwrap().is_empty());
        ledger.mark_applied(LedgerEntry::now(Version::new(10), "tasks")).unwrap();
        ledger.mark_applied(LedgerEntry::now(Version::new(20), "inventory")).unwrap();
        drop(ledger);

        let reopened = JsonFileLedger::open(&path).unwrap();
        let names: Vec<_> = reopened
            .entries()
            .unwrap()
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["tasks", "inventory"]);

        reopened.mark_reverted(Version::new(20), "inventory").unwrap();
        assert_eq!(reopened.entries().unwrap().len(), 1);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn json_ledger_rejects_corrupt_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(matches!(JsonFileLedger::open(&path), Err(Error::Ledger(_))));
    }
}
