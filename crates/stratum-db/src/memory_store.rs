use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use stratum_common::{Error, Result};
use stratum_schema::{CollectionDescriptor, FieldChange, Schema};

use crate::store::{Store, lock_conflict};

/// In-process store holding only schema. Used for dry runs and tests.
pub struct MemoryStore {
    schema: Mutex<Schema>,
    lock: Mutex<Option<(String, String)>>,
}

impl MemoryStore {
    /// A store bootstrapped with the system `users` collection.
    pub fn new() -> Self {
        Self::from_schema(Schema::from_collections([
            CollectionDescriptor::system_users(),
        ]))
    }

    pub fn from_schema(schema: Schema) -> Self {
        Self {
            schema: Mutex::new(schema),
            lock: Mutex::new(None),
        }
    }

    fn schema(&self) -> Result<MutexGuard<'_, Schema>> {
        self.schema
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".into()))
    }

    fn lock_slot(&self) -> Result<MutexGuard<'_, Option<(String, String)>>> {
        self.lock
            .lock()
            .map_err(|_| Error::Store("memory store lock poisoned".into()))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn collections(&self) -> Result<Vec<CollectionDescriptor>> {
        Ok(self.schema()?.collections().cloned().collect())
    }

    fn find_collection(&self, name_or_id: &str) -> Result<Option<CollectionDescriptor>> {
        Ok(self.schema()?.find_by_name_or_id(name_or_id).cloned())
    }

    fn create_collection(&self, collection: &CollectionDescriptor) -> Result<()> {
        self.schema()?.create_collection(collection.clone())
    }

    fn delete_collection(&self, id: &str) -> Result<()> {
        self.schema()?.delete_collection(id).map(|_| ())
    }

    fn alter_collection(&self, id: &str, changes: &[FieldChange]) -> Result<()> {
        self.schema()?.alter_collection(id, changes).map(|_| ())
    }

    fn acquire_lock(&self, holder: &str) -> Result<()> {
        let mut slot = self.lock_slot()?;
        if let Some((current, since)) = slot.as_ref() {
            return Err(lock_conflict(current, since));
        }
        *slot = Some((holder.to_string(), Utc::now().to_rfc3339()));
        Ok(())
    }

    fn release_lock(&self, holder: &str) -> Result<()> {
        let mut slot = self.lock_slot()?;
        match slot.as_ref() {
            Some((current, _)) if current == holder => {
                *slot = None;
                Ok(())
            }
            _ => Err(Error::Locked(format!("migration lock is not held by {holder}"))),
        }
    }
}
