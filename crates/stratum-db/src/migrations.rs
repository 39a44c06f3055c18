//! Migration units: versioned, reversible schema changes.
//!
//! Each unit carries exactly one [`SchemaChange`]. `up` applies it and `down`
//! applies its inverse, so a unit never needs hand-written rollback code.
//! Units are authored as JSON files named `<version>_<name>.json`, where the
//! version is the authoring timestamp in milliseconds.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use stratum_common::{Error, Result, Version};
use stratum_schema::{CollectionDescriptor, FieldChange, FieldDescriptor, Schema};
use tracing::{debug, info};
use uuid::Uuid;

use crate::store::Store;

/// One schema change, with enough data to compute its own inverse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SchemaChange {
    CreateCollection {
        collection: CollectionDescriptor,
    },
    DeleteCollection {
        collection: CollectionDescriptor,
    },
    AddField {
        collection_id: String,
        field: FieldDescriptor,
    },
    RemoveField {
        collection_id: String,
        field: FieldDescriptor,
    },
    ModifyField {
        collection_id: String,
        before: FieldDescriptor,
        after: FieldDescriptor,
    },
}

impl SchemaChange {
    pub fn inverse(&self) -> SchemaChange {
        match self {
            SchemaChange::CreateCollection { collection } => SchemaChange::DeleteCollection {
                collection: collection.clone(),
            },
            SchemaChange::DeleteCollection { collection } => SchemaChange::CreateCollection {
                collection: collection.clone(),
            },
            SchemaChange::AddField {
                collection_id,
                field,
            } => SchemaChange::RemoveField {
                collection_id: collection_id.clone(),
                field: field.clone(),
            },
            SchemaChange::RemoveField {
                collection_id,
                field,
            } => SchemaChange::AddField {
                collection_id: collection_id.clone(),
                field: field.clone(),
            },
            SchemaChange::ModifyField {
                collection_id,
                before,
                after,
            } => SchemaChange::ModifyField {
                collection_id: collection_id.clone(),
                before: after.clone(),
                after: before.clone(),
            },
        }
    }

    /// The collection this change touches.
    pub fn collection_id(&self) -> &str {
        match self {
            SchemaChange::CreateCollection { collection }
            | SchemaChange::DeleteCollection { collection } => collection.id.as_str(),
            SchemaChange::AddField { collection_id, .. }
            | SchemaChange::RemoveField { collection_id, .. }
            | SchemaChange::ModifyField { collection_id, .. } => collection_id.as_str(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            SchemaChange::CreateCollection { collection } => {
                format!("create collection `{}`", collection.name)
            }
            SchemaChange::DeleteCollection { collection } => {
                format!("delete collection `{}`", collection.name)
            }
            SchemaChange::AddField {
                collection_id,
                field,
            } => format!("add field `{}` on collection {collection_id}", field.name),
            SchemaChange::RemoveField {
                collection_id,
                field,
            } => format!("remove field `{}` on collection {collection_id}", field.name),
            SchemaChange::ModifyField {
                collection_id,
                before,
                after,
            } if before.name != after.name => format!(
                "modify field `{}` (renamed to `{}`) on collection {collection_id}",
                before.name, after.name
            ),
            SchemaChange::ModifyField {
                collection_id,
                before,
                ..
            } => format!("modify field `{}` on collection {collection_id}", before.name),
        }
    }

    /// Check every descriptor the change carries. Never touches a store.
    pub fn validate(&self) -> Result<()> {
        match self {
            SchemaChange::CreateCollection { collection }
            | SchemaChange::DeleteCollection { collection } => collection.validate(),
            SchemaChange::AddField {
                collection_id,
                field,
            }
            | SchemaChange::RemoveField {
                collection_id,
                field,
            } => {
                require_collection_id(collection_id)?;
                field.validate()
            }
            SchemaChange::ModifyField {
                collection_id,
                before,
                after,
            } => {
                require_collection_id(collection_id)?;
                before.validate()?;
                after.validate()
            }
        }
    }

    /// Apply the change to a store with a single store call.
    pub fn apply<S: Store + ?Sized>(&self, store: &S) -> Result<()> {
        match self {
            SchemaChange::CreateCollection { collection } => store.create_collection(collection),
            SchemaChange::DeleteCollection { collection } => {
                let current = store.find_collection(&collection.id)?.ok_or_else(|| {
                    Error::Store(format!("collection `{}` does not exist", collection.id))
                })?;
                ensure_recorded_shape(&current, collection)?;
                store.delete_collection(&collection.id)
            }
            SchemaChange::AddField {
                collection_id,
                field,
            } => store.alter_collection(
                collection_id,
                &[FieldChange::Add {
                    field: field.clone(),
                }],
            ),
            SchemaChange::RemoveField {
                collection_id,
                field,
            } => store.alter_collection(
                collection_id,
                &[FieldChange::Remove {
                    field: field.clone(),
                }],
            ),
            SchemaChange::ModifyField {
                collection_id,
                before,
                after,
            } => store.alter_collection(
                collection_id,
                &[FieldChange::Modify {
                    before: before.clone(),
                    after: after.clone(),
                }],
            ),
        }
    }

    /// Apply the change to an in-memory schema snapshot.
    pub fn project(&self, schema: &mut Schema) -> Result<()> {
        match self {
            SchemaChange::CreateCollection { collection } => {
                schema.create_collection(collection.clone())
            }
            SchemaChange::DeleteCollection { collection } => {
                let current = schema.get(&collection.id).ok_or_else(|| {
                    Error::Store(format!("collection `{}` does not exist", collection.id))
                })?;
                ensure_recorded_shape(current, collection)?;
                schema.delete_collection(&collection.id).map(|_| ())
            }
            SchemaChange::AddField {
                collection_id,
                field,
            } => schema
                .alter_collection(
                    collection_id,
                    &[FieldChange::Add {
                        field: field.clone(),
                    }],
                )
                .map(|_| ()),
            SchemaChange::RemoveField {
                collection_id,
                field,
            } => schema
                .alter_collection(
                    collection_id,
                    &[FieldChange::Remove {
                        field: field.clone(),
                    }],
                )
                .map(|_| ()),
            SchemaChange::ModifyField {
                collection_id,
                before,
                after,
            } => schema
                .alter_collection(
                    collection_id,
                    &[FieldChange::Modify {
                        before: before.clone(),
                        after: after.clone(),
                    }],
                )
                .map(|_| ()),
        }
    }
}

fn require_collection_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidCollection(
            "field change names no collection id".into(),
        ));
    }
    Ok(())
}

/// Deleting is only reversible if the live collection is the one recorded.
fn ensure_recorded_shape(current: &CollectionDescriptor, recorded: &CollectionDescriptor) -> Result<()> {
    if !current.same_shape(recorded) {
        return Err(Error::Store(format!(
            "collection `{}` differs from its recorded definition; refusing to delete",
            recorded.name
        )));
    }
    Ok(())
}

/// A versioned, reversible schema change.
#[derive(Debug, Clone, PartialEq)]
pub struct Migration {
    pub version: Version,
    pub name: String,
    pub change: SchemaChange,
}

impl Migration {
    pub fn new(version: impl Into<Version>, name: impl Into<String>, change: SchemaChange) -> Self {
        Self {
            version: version.into(),
            name: name.into(),
            change,
        }
    }

    pub fn up<S: Store + ?Sized>(&self, store: &S) -> Result<()> {
        info!("applying {} ({})", self.label(), self.change.describe());
        self.change.apply(store)
    }

    pub fn down<S: Store + ?Sized>(&self, store: &S) -> Result<()> {
        let inverse = self.change.inverse();
        info!("reverting {} ({})", self.label(), inverse.describe());
        inverse.apply(store)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_migration_name(&self.name) {
            return Err(Error::Migration(format!(
                "migration {} has an invalid name `{}`",
                self.version, self.name
            )));
        }
        self.change.validate()
    }

    pub fn label(&self) -> String {
        format!("{}_{}", self.version, self.name)
    }

    pub fn file_name(&self) -> String {
        format!("{}.json", self.label())
    }
}

fn is_migration_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Split `<version>_<name>.json` into its parts.
pub fn parse_file_name(file_name: &str) -> Option<(Version, String)> {
    let stem = file_name.strip_suffix(".json")?;
    let (version, name) = stem.split_once('_')?;
    if version.is_empty() || !version.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    if !is_migration_name(name) {
        return None;
    }
    Some((version.parse().ok()?, name.to_string()))
}

/// Load every `*.json` migration in `dir`, in file-name order.
pub fn load_dir(dir: &Path) -> Result<Vec<Migration>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        Error::Migration(format!("failed to read migrations directory {}: {e}", dir.display()))
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    let mut migrations = Vec::with_capacity(paths.len());
    for path in paths {
        migrations.push(load_file(&path)?);
    }
    debug!("loaded {} migration(s) from {}", migrations.len(), dir.display());
    Ok(migrations)
}

pub fn load_file(path: &Path) -> Result<Migration> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default();
    let (version, name) = parse_file_name(file_name).ok_or_else(|| {
        Error::Migration(format!(
            "{} is not named `<version>_<name>.json`",
            path.display()
        ))
    })?;

    let contents = fs::read_to_string(path)?;
    let change: SchemaChange = serde_json::from_str(&contents).map_err(|e| {
        Error::Migration(format!("failed to parse {}: {e}", path.display()))
    })?;
    Ok(Migration::new(version, name, change))
}

/// Write a new migration file that creates an empty collection called `name`.
/// The version is the current time in milliseconds.
pub fn scaffold(dir: &Path, name: &str) -> Result<PathBuf> {
    if !is_migration_name(name) {
        return Err(Error::Migration(format!(
            "migration name `{name}` may only contain lowercase letters, digits and underscores"
        )));
    }
    let version = Version::new(Utc::now().timestamp_millis().max(0) as u64);
    let collection_name = name.strip_prefix("created_").unwrap_or(name);
    // Platform-style 15 character id that always starts with a letter.
    let collection_id = format!("c{}", &Uuid::new_v4().simple().to_string()[..14]);

    let migration = Migration::new(
        version,
        name,
        SchemaChange::CreateCollection {
            collection: CollectionDescriptor::new(collection_id, collection_name),
        },
    );

    fs::create_dir_all(dir)?;
    let path = dir.join(migration.file_name());
    if path.exists() {
        return Err(Error::Migration(format!("{} already exists", path.display())));
    }
    let json = serde_json::to_string_pretty(&migration.change)?;
    fs::write(&path, json + "\n")?;
    info!("created migration {}", path.display());
    Ok(path)
}
