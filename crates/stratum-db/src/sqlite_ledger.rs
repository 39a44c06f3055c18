use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use stratum_common::{Error, Result, Version};
use tracing::info;

use crate::ledger::{Ledger, LedgerEntry};

/// Ledger kept in a `_migrations` table, normally in the same database file
/// as the record store.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening migration ledger at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Ledger(format!("failed to open database: {e}")))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Ledger(format!("failed to open in-memory database: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
            PRAGMA synchronous=FULL;

            CREATE TABLE IF NOT EXISTS _migrations (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                version INTEGER NOT NULL,
                name TEXT NOT NULL,
                applied_at TEXT NOT NULL,
                UNIQUE (version, name)
            );",
        )
        .map_err(|e| Error::Ledger(format!("ledger migration failed: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Ledger("ledger lock poisoned".into()))
    }
}

impl Ledger for SqliteLedger {
    fn entries(&self) -> Result<Vec<LedgerEntry>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare("SELECT version, name, applied_at FROM _migrations ORDER BY seq ASC")
            .map_err(|e| Error::Ledger(format!("failed to prepare query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                Ok(LedgerEntry {
                    version: Version::new(row.get::<_, i64>(0)? as u64),
                    name: row.get(1)?,
                    applied_at: parse_datetime(row.get::<_, String>(2)?),
                })
            })
            .map_err(|e| Error::Ledger(format!("failed to query ledger: {e}")))?;

        let mut entries = Vec::new();
        for row in rows {
            entries.push(row.map_err(|e| Error::Ledger(format!("failed to read ledger row: {e}")))?);
        }
        Ok(entries)
    }

    fn mark_applied(&self, entry: LedgerEntry) -> Result<()> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO _migrations (version, name, applied_at) VALUES (?1, ?2, ?3)",
            params![
                entry.version.as_u64() as i64,
                entry.name,
                entry.applied_at.to_rfc3339()
            ],
        )
        .map_err(|e| {
            Error::Ledger(format!(
                "failed to record migration {}_{}: {e}",
                entry.version, entry.name
            ))
        })?;
        Ok(())
    }

    fn mark_reverted(&self, version: Version, name: &str) -> Result<()> {
        let conn = self.connection()?;
        let removed = conn
            .execute(
                "DELETE FROM _migrations WHERE version = ?1 AND name = ?2",
                params![version.as_u64() as i64, name],
            )
            .map_err(|e| Error::Ledger(format!("failed to unrecord migration {version}_{name}: {e}")))?;
        if removed == 0 {
            return Err(Error::Ledger(format!(
                "migration {version}_{name} is not recorded as applied"
            )));
        }
        Ok(())
    }
}

fn parse_datetime(s: String) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| {
            // SQLite datetime('now') produces "YYYY-MM-DD HH:MM:SS"
            chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
                .unwrap_or_else(|_| Utc::now())
        })
}
