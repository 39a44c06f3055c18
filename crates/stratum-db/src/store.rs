use stratum_common::{Error, Result};
use stratum_schema::{CollectionDescriptor, FieldChange, Schema};
use tracing::{debug, warn};
use uuid::Uuid;

/// A record store whose collection schema can be changed.
///
/// Each mutating call is atomic from the caller's point of view: it either
/// fully applies or leaves the schema untouched.
pub trait Store: Send + Sync {
    /// Every live collection, system collections included.
    fn collections(&self) -> Result<Vec<CollectionDescriptor>>;

    fn find_collection(&self, name_or_id: &str) -> Result<Option<CollectionDescriptor>>;

    fn create_collection(&self, collection: &CollectionDescriptor) -> Result<()>;

    fn delete_collection(&self, id: &str) -> Result<()>;

    fn alter_collection(&self, id: &str, changes: &[FieldChange]) -> Result<()>;

    /// Take the exclusive migration lock. Fails with [`Error::Locked`] if
    /// another holder has it.
    fn acquire_lock(&self, holder: &str) -> Result<()>;

    fn release_lock(&self, holder: &str) -> Result<()>;

    fn snapshot(&self) -> Result<Schema> {
        Ok(Schema::from_collections(self.collections()?))
    }

    /// Run `f` while holding the migration lock. The lock is released on
    /// every exit path, including a panic inside `f`.
    fn with_lock<T, F>(&self, f: F) -> Result<T>
    where
        Self: Sized,
        F: FnOnce() -> Result<T>,
    {
        let lock = StoreLock::acquire(self)?;
        let result = f();
        match (result, lock.release()) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(release_err)) => {
                warn!("failed to release migration lock after error: {release_err}");
                Err(e)
            }
        }
    }
}

/// Scoped hold on a store's migration lock.
pub struct StoreLock<'a> {
    store: &'a dyn Store,
    holder: String,
    released: bool,
}

impl<'a> StoreLock<'a> {
    pub fn acquire(store: &'a dyn Store) -> Result<Self> {
        let holder = format!("{}@{}", Uuid::new_v4(), std::process::id());
        store.acquire_lock(&holder)?;
        debug!("migration lock acquired by {holder}");
        Ok(Self {
            store,
            holder,
            released: false,
        })
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.store.release_lock(&self.holder)?;
        debug!("migration lock released by {}", self.holder);
        Ok(())
    }
}

impl Drop for StoreLock<'_> {
    fn drop(&mut self) {
        if !self.released
            && let Err(e) = self.store.release_lock(&self.holder)
        {
            warn!("failed to release migration lock held by {}: {e}", self.holder);
        }
    }
}

pub(crate) fn lock_conflict(current_holder: &str, since: &str) -> Error {
    Error::Locked(format!(
        "migration lock is held by {current_holder} since {since}"
    ))
}
