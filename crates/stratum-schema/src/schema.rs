use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use stratum_common::{Error, Result};

use crate::collection::{CollectionDescriptor, FieldChange};

/// A snapshot of every live collection, keyed by collection id.
///
/// Enforces the rules a store applies to schema mutations: ids and names are
/// unique among live collections, relation targets exist, and a collection
/// cannot be deleted while it is a system collection or another collection
/// still points at it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    collections: BTreeMap<String, CollectionDescriptor>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from trusted descriptors (e.g. read back from a store)
    /// without re-checking store rules.
    pub fn from_collections(collections: impl IntoIterator<Item = CollectionDescriptor>) -> Self {
        Self {
            collections: collections
                .into_iter()
                .map(|c| (c.id.clone(), c))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.collections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.collections.is_empty()
    }

    pub fn collections(&self) -> impl Iterator<Item = &CollectionDescriptor> {
        self.collections.values()
    }

    pub fn get(&self, id: &str) -> Option<&CollectionDescriptor> {
        self.collections.get(id)
    }

    /// Collection names are matched ignoring ASCII case, like SQLite table names.
    pub fn find_by_name(&self, name: &str) -> Option<&CollectionDescriptor> {
        self.collections
            .values()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub fn find_by_name_or_id(&self, name_or_id: &str) -> Option<&CollectionDescriptor> {
        self.get(name_or_id).or_else(|| self.find_by_name(name_or_id))
    }

    /// A copy without the given collections.
    pub fn excluding(&self, ids: &BTreeSet<String>) -> Schema {
        Schema::from_collections(
            self.collections()
                .filter(|c| !ids.contains(&c.id))
                .cloned(),
        )
    }

    pub fn create_collection(&mut self, collection: CollectionDescriptor) -> Result<()> {
        collection.validate()?;
        if self.collections.contains_key(&collection.id) {
            return Err(Error::Store(format!(
                "collection id `{}` already exists",
                collection.id
            )));
        }
        if self.find_by_name(&collection.name).is_some() {
            return Err(Error::Store(format!(
                "collection name `{}` is already taken",
                collection.name
            )));
        }
        self.check_relation_targets(&collection)?;
        self.collections.insert(collection.id.clone(), collection);
        Ok(())
    }

    pub fn delete_collection(&mut self, id: &str) -> Result<CollectionDescriptor> {
        let existing = self
            .collections
            .get(id)
            .ok_or_else(|| Error::Store(format!("collection `{id}` does not exist")))?;
        if existing.system {
            return Err(Error::Store(format!(
                "system collection `{}` cannot be deleted",
                existing.name
            )));
        }
        if let Some(referrer) = self
            .collections
            .values()
            .find(|c| c.id != id && c.relation_targets().any(|target| target == id))
        {
            return Err(Error::Store(format!(
                "collection `{}` is still referenced by relation fields in `{}`",
                existing.name, referrer.name
            )));
        }
        self.collections
            .remove(id)
            .ok_or_else(|| Error::Store(format!("collection `{id}` does not exist")))
    }

    /// Apply field changes to one collection and return its new shape.
    pub fn alter_collection(&mut self, id: &str, changes: &[FieldChange]) -> Result<CollectionDescriptor> {
        let existing = self
            .collections
            .get(id)
            .ok_or_else(|| Error::Store(format!("collection `{id}` does not exist")))?;
        let altered = existing.apply_changes(changes)?;
        self.check_relation_targets(&altered)?;
        self.collections.insert(altered.id.clone(), altered.clone());
        Ok(altered)
    }

    fn check_relation_targets(&self, collection: &CollectionDescriptor) -> Result<()> {
        for target in collection.relation_targets() {
            if target != collection.id && !self.collections.contains_key(target) {
                return Err(Error::Store(format!(
                    "collection `{}` relates to missing collection `{target}`",
                    collection.name
                )));
            }
        }
        Ok(())
    }

    /// Human-readable differences between this (expected) snapshot and
    /// `actual`, limited to the given collection ids.
    pub fn differences(&self, actual: &Schema, ids: &BTreeSet<String>) -> Vec<String> {
        let mut out = Vec::new();
        for id in ids {
            match (self.get(id), actual.get(id)) {
                (None, None) => {}
                (Some(expected), None) => out.push(format!(
                    "collection `{}` ({id}) is recorded as applied but missing from the store",
                    expected.name
                )),
                (None, Some(found)) => out.push(format!(
                    "collection `{}` ({id}) exists in the store but no applied migration created it",
                    found.name
                )),
                (Some(expected), Some(found)) if !expected.same_shape(found) => out.push(format!(
                    "collection `{}` ({id}) differs from the shape recorded by applied migrations",
                    expected.name
                )),
                (Some(_), Some(_)) => {}
            }
        }
        out
    }

    /// Structural equality ignoring field order.
    pub fn same_shape(&self, other: &Schema) -> bool {
        self.collections.len() == other.collections.len()
            && self
                .collections
                .values()
                .all(|c| other.get(&c.id).is_some_and(|o| c.same_shape(o)))
    }
}
