use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use stratum_common::{Error, Result};
use stratum_schema::{CollectionDescriptor, FieldChange, FieldDescriptor, FieldKind, Schema};
use tracing::{debug, info, warn};

use crate::store::{Store, lock_conflict};

const LOCK_NAME: &str = "migrations";

/// SQLite-backed record store.
///
/// Collection descriptors live as JSON in `_collections`; every collection
/// also gets a record table named after it with one column per field.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening record store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Store(format!("failed to open database: {e}")))?;
        Self::init(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Store(format!("failed to open in-memory database: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Store(format!("failed to set pragmas: {e}")))?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.bootstrap()?;
        Ok(store)
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Store("record store lock poisoned".into()))
    }

    fn bootstrap(&self) -> Result<()> {
        let mut conn = self.connection()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _collections (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE COLLATE NOCASE,
                system INTEGER NOT NULL DEFAULT 0,
                descriptor TEXT NOT NULL,
                created TEXT NOT NULL DEFAULT (datetime('now')),
                updated TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS _locks (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                acquired_at TEXT NOT NULL DEFAULT (datetime('now'))
            );",
        )
        .map_err(|e| Error::Store(format!("bootstrap failed: {e}")))?;

        let users = CollectionDescriptor::system_users();
        let tx = conn
            .transaction()
            .map_err(|e| Error::Store(format!("failed to begin transaction: {e}")))?;
        if load_schema(&tx)?.get(&users.id).is_none() {
            create_table(&tx, &users)?;
            insert_descriptor(&tx, &users)?;
            info!("bootstrapped system collection `{}`", users.name);
        }
        tx.commit()
            .map_err(|e| Error::Store(format!("failed to commit bootstrap: {e}")))?;
        Ok(())
    }

    /// Drop the migration lock regardless of who holds it. Returns the
    /// previous holder, if any.
    pub fn force_unlock(&self) -> Result<Option<String>> {
        let conn = self.connection()?;
        let holder: Option<String> = conn
            .query_row(
                "SELECT holder FROM _locks WHERE name = ?1",
                params![LOCK_NAME],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Store(format!("failed to read lock: {e}")))?;
        conn.execute("DELETE FROM _locks WHERE name = ?1", params![LOCK_NAME])
            .map_err(|e| Error::Store(format!("failed to clear lock: {e}")))?;
        if let Some(holder) = &holder {
            warn!("forcibly released migration lock held by {holder}");
        }
        Ok(holder)
    }

    /// Column names of a collection's record table, in table order.
    pub fn table_columns(&self, table: &str) -> Result<Vec<String>> {
        let conn = self.connection()?;
        let mut stmt = conn
            .prepare(&format!("PRAGMA table_info(\"{table}\")"))
            .map_err(|e| Error::Store(format!("failed to prepare query: {e}")))?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(1))
            .map_err(|e| Error::Store(format!("failed to query columns: {e}")))?;

        let mut columns = Vec::new();
        for row in rows {
            columns.push(row.map_err(|e| Error::Store(format!("failed to read column: {e}")))?);
        }
        Ok(columns)
    }
}

impl Store for SqliteStore {
    fn collections(&self) -> Result<Vec<CollectionDescriptor>> {
        let conn = self.connection()?;
        Ok(load_schema(&conn)?.collections().cloned().collect())
    }

    fn find_collection(&self, name_or_id: &str) -> Result<Option<CollectionDescriptor>> {
        let conn = self.connection()?;
        let descriptor: Option<String> = conn
            .query_row(
                "SELECT descriptor FROM _collections WHERE id = ?1 OR name = ?1 COLLATE NOCASE
                 ORDER BY id = ?1 DESC LIMIT 1",
                params![name_or_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| Error::Store(format!("failed to find collection: {e}")))?;
        descriptor.map(|json| decode_descriptor(&json)).transpose()
    }

    fn create_collection(&self, collection: &CollectionDescriptor) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Store(format!("failed to begin transaction: {e}")))?;

        let mut schema = load_schema(&tx)?;
        schema.create_collection(collection.clone())?;
        create_table(&tx, collection)?;
        insert_descriptor(&tx, collection)?;

        tx.commit()
            .map_err(|e| Error::Store(format!("failed to commit collection: {e}")))?;
        info!("created collection `{}` ({})", collection.name, collection.id);
        Ok(())
    }

    fn delete_collection(&self, id: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Store(format!("failed to begin transaction: {e}")))?;

        let mut schema = load_schema(&tx)?;
        let removed = schema.delete_collection(id)?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS \"{}\";", removed.name))
            .map_err(|e| Error::Store(format!("failed to drop table `{}`: {e}", removed.name)))?;
        tx.execute("DELETE FROM _collections WHERE id = ?1", params![id])
            .map_err(|e| Error::Store(format!("failed to delete collection: {e}")))?;

        tx.commit()
            .map_err(|e| Error::Store(format!("failed to commit deletion: {e}")))?;
        info!("deleted collection `{}` ({id})", removed.name);
        Ok(())
    }

    fn alter_collection(&self, id: &str, changes: &[FieldChange]) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .map_err(|e| Error::Store(format!("failed to begin transaction: {e}")))?;

        let mut schema = load_schema(&tx)?;
        let altered = schema.alter_collection(id, changes)?;
        let table = altered.name.as_str();

        for change in changes {
            debug!("altering `{table}`: {}", change.describe());
            match change {
                FieldChange::Add { field } => {
                    tx.execute_batch(&format!(
                        "ALTER TABLE \"{table}\" ADD COLUMN {};",
                        column_definition(field)
                    ))
                    .map_err(|e| Error::Store(format!("failed to add column `{}`: {e}", field.name)))?;
                    if field.unique {
                        create_unique_index(&tx, id, table, field)?;
                    }
                }
                FieldChange::Remove { field } => {
                    drop_unique_index(&tx, id, field)?;
                    tx.execute_batch(&format!(
                        "ALTER TABLE \"{table}\" DROP COLUMN \"{}\";",
                        field.name
                    ))
                    .map_err(|e| {
                        Error::Store(format!("failed to drop column `{}`: {e}", field.name))
                    })?;
                }
                FieldChange::Modify { before, after } => {
                    if storage_type(before) != storage_type(after) {
                        return Err(Error::Store(format!(
                            "field `{}` cannot change storage from {} to {} in place",
                            before.name,
                            storage_type(before),
                            storage_type(after)
                        )));
                    }
                    drop_unique_index(&tx, id, before)?;
                    if before.name != after.name {
                        tx.execute_batch(&format!(
                            "ALTER TABLE \"{table}\" RENAME COLUMN \"{}\" TO \"{}\";",
                            before.name, after.name
                        ))
                        .map_err(|e| {
                            Error::Store(format!("failed to rename column `{}`: {e}", before.name))
                        })?;
                    }
                    if after.unique {
                        create_unique_index(&tx, id, table, after)?;
                    }
                }
            }
        }

        let json = serde_json::to_string(&altered)?;
        tx.execute(
            "UPDATE _collections SET descriptor = ?1, updated = datetime('now') WHERE id = ?2",
            params![json, id],
        )
        .map_err(|e| Error::Store(format!("failed to update collection: {e}")))?;

        tx.commit()
            .map_err(|e| Error::Store(format!("failed to commit alteration: {e}")))?;
        info!("altered collection `{table}` ({} change(s))", changes.len());
        Ok(())
    }

    fn acquire_lock(&self, holder: &str) -> Result<()> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| Error::Store(format!("failed to begin lock transaction: {e}")))?;

        let current: Option<(String, String)> = tx
            .query_row(
                "SELECT holder, acquired_at FROM _locks WHERE name = ?1",
                params![LOCK_NAME],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(|e| Error::Store(format!("failed to read lock: {e}")))?;
        if let Some((current, since)) = current {
            return Err(lock_conflict(&current, &since));
        }

        tx.execute(
            "INSERT INTO _locks (name, holder) VALUES (?1, ?2)",
            params![LOCK_NAME, holder],
        )
        .map_err(|e| Error::Store(format!("failed to take lock: {e}")))?;
        tx.commit()
            .map_err(|e| Error::Store(format!("failed to commit lock: {e}")))?;
        Ok(())
    }

    fn release_lock(&self, holder: &str) -> Result<()> {
        let conn = self.connection()?;
        let removed = conn
            .execute(
                "DELETE FROM _locks WHERE name = ?1 AND holder = ?2",
                params![LOCK_NAME, holder],
            )
            .map_err(|e| Error::Store(format!("failed to release lock: {e}")))?;
        if removed == 0 {
            return Err(Error::Locked(format!(
                "migration lock is not held by {holder}"
            )));
        }
        Ok(())
    }
}

fn load_schema(conn: &Connection) -> Result<Schema> {
    let mut stmt = conn
        .prepare("SELECT descriptor FROM _collections ORDER BY created, id")
        .map_err(|e| Error::Store(format!("failed to prepare query: {e}")))?;
    let rows = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| Error::Store(format!("failed to query collections: {e}")))?;

    let mut collections = Vec::new();
    for row in rows {
        let json = row.map_err(|e| Error::Store(format!("failed to read collection row: {e}")))?;
        collections.push(decode_descriptor(&json)?);
    }
    Ok(Schema::from_collections(collections))
}

fn decode_descriptor(json: &str) -> Result<CollectionDescriptor> {
    serde_json::from_str(json)
        .map_err(|e| Error::Store(format!("stored collection descriptor is corrupt: {e}")))
}

fn insert_descriptor(conn: &Connection, collection: &CollectionDescriptor) -> Result<()> {
    let json = serde_json::to_string(collection)?;
    conn.execute(
        "INSERT INTO _collections (id, name, system, descriptor) VALUES (?1, ?2, ?3, ?4)",
        params![collection.id, collection.name, collection.system, json],
    )
    .map_err(|e| Error::Store(format!("failed to record collection: {e}")))?;
    Ok(())
}

fn create_table(conn: &Connection, collection: &CollectionDescriptor) -> Result<()> {
    let mut sql = format!(
        "CREATE TABLE \"{}\" (
            id TEXT PRIMARY KEY NOT NULL,
            created TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%fZ')),
            updated TEXT NOT NULL DEFAULT (strftime('%Y-%m-%d %H:%M:%fZ'))",
        collection.name
    );
    for field in &collection.fields {
        sql.push_str(",\n            ");
        sql.push_str(&column_definition(field));
    }
    sql.push_str("\n        );");

    conn.execute_batch(&sql)
        .map_err(|e| Error::Store(format!("failed to create table `{}`: {e}", collection.name)))?;

    for field in collection.fields.iter().filter(|f| f.unique) {
        create_unique_index(conn, &collection.id, &collection.name, field)?;
    }
    Ok(())
}

/// SQLite column type for a field. Required-ness is enforced by the
/// platform on write, so every column carries a default.
fn storage_type(field: &FieldDescriptor) -> &'static str {
    if field.is_multi() {
        return "JSON DEFAULT '[]' NOT NULL";
    }
    match field.kind {
        Some(FieldKind::Number) => "NUMERIC DEFAULT 0 NOT NULL",
        Some(FieldKind::Bool) => "BOOLEAN DEFAULT FALSE NOT NULL",
        Some(FieldKind::Json) => "JSON DEFAULT NULL",
        _ => "TEXT DEFAULT '' NOT NULL",
    }
}

fn column_definition(field: &FieldDescriptor) -> String {
    format!("\"{}\" {}", field.name, storage_type(field))
}

fn unique_index_name(collection_id: &str, field: &FieldDescriptor) -> String {
    format!("idx_unique_{collection_id}_{}", field.name)
}

fn create_unique_index(
    conn: &Connection,
    collection_id: &str,
    table: &str,
    field: &FieldDescriptor,
) -> Result<()> {
    conn.execute_batch(&format!(
        "CREATE UNIQUE INDEX \"{}\" ON \"{table}\" (\"{}\");",
        unique_index_name(collection_id, field),
        field.name
    ))
    .map_err(|e| Error::Store(format!("failed to index `{}`: {e}", field.name)))
}

fn drop_unique_index(conn: &Connection, collection_id: &str, field: &FieldDescriptor) -> Result<()> {
    conn.execute_batch(&format!(
        "DROP INDEX IF EXISTS \"{}\";",
        unique_index_name(collection_id, field)
    ))
    .map_err(|e| Error::Store(format!("failed to drop index on `{}`: {e}", field.name)))
}
