use serde::{Deserialize, Serialize};
use stratum_common::{Error, Result};

use crate::field::{FieldDescriptor, FieldKind, FieldOptions, is_identifier};

/// Id of the built-in auth collection that owns user accounts.
pub const USERS_COLLECTION_ID: &str = "_pb_users_auth_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    #[default]
    Base,
    Auth,
}

/// Access rule for one record operation.
///
/// Serialized the way the hosting platform stores rules: `null` locks the
/// operation to administrators, `""` leaves it open, anything else is a filter
/// expression evaluated by the platform.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "Option<String>")]
pub enum AccessRule {
    #[default]
    Locked,
    Unrestricted,
    Expression(String),
}

impl From<Option<String>> for AccessRule {
    fn from(value: Option<String>) -> Self {
        match value {
            None => AccessRule::Locked,
            Some(s) if s.is_empty() => AccessRule::Unrestricted,
            Some(s) => AccessRule::Expression(s),
        }
    }
}

impl From<AccessRule> for Option<String> {
    fn from(rule: AccessRule) -> Self {
        match rule {
            AccessRule::Locked => None,
            AccessRule::Unrestricted => Some(String::new()),
            AccessRule::Expression(expr) => Some(expr),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleOperation {
    List,
    View,
    Create,
    Update,
    Delete,
}

impl RuleOperation {
    pub const ALL: [RuleOperation; 5] = [
        RuleOperation::List,
        RuleOperation::View,
        RuleOperation::Create,
        RuleOperation::Update,
        RuleOperation::Delete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RuleOperation::List => "list",
            RuleOperation::View => "view",
            RuleOperation::Create => "create",
            RuleOperation::Update => "update",
            RuleOperation::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessRules {
    #[serde(default)]
    pub list_rule: AccessRule,
    #[serde(default)]
    pub view_rule: AccessRule,
    #[serde(default)]
    pub create_rule: AccessRule,
    #[serde(default)]
    pub update_rule: AccessRule,
    #[serde(default)]
    pub delete_rule: AccessRule,
}

impl AccessRules {
    pub fn get(&self, op: RuleOperation) -> &AccessRule {
        match op {
            RuleOperation::List => &self.list_rule,
            RuleOperation::View => &self.view_rule,
            RuleOperation::Create => &self.create_rule,
            RuleOperation::Update => &self.update_rule,
            RuleOperation::Delete => &self.delete_rule,
        }
    }

    pub fn set(&mut self, op: RuleOperation, rule: AccessRule) {
        let slot = match op {
            RuleOperation::List => &mut self.list_rule,
            RuleOperation::View => &mut self.view_rule,
            RuleOperation::Create => &mut self.create_rule,
            RuleOperation::Update => &mut self.update_rule,
            RuleOperation::Delete => &mut self.delete_rule,
        };
        *slot = rule;
    }
}

/// One field-level change inside an altered collection. Each variant carries
/// enough data to compute its inverse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum FieldChange {
    Add {
        field: FieldDescriptor,
    },
    Remove {
        field: FieldDescriptor,
    },
    Modify {
        before: FieldDescriptor,
        after: FieldDescriptor,
    },
}

impl FieldChange {
    pub fn inverse(&self) -> FieldChange {
        match self {
            FieldChange::Add { field } => FieldChange::Remove {
                field: field.clone(),
            },
            FieldChange::Remove { field } => FieldChange::Add {
                field: field.clone(),
            },
            FieldChange::Modify { before, after } => FieldChange::Modify {
                before: after.clone(),
                after: before.clone(),
            },
        }
    }

    pub fn describe(&self) -> String {
        match self {
            FieldChange::Add { field } => format!("add field `{}`", field.name),
            FieldChange::Remove { field } => format!("remove field `{}`", field.name),
            FieldChange::Modify { before, after } if before.name != after.name => {
                format!("modify field `{}` (renamed to `{}`)", before.name, after.name)
            }
            FieldChange::Modify { before, .. } => format!("modify field `{}`", before.name),
        }
    }
}

/// The shape of one collection: identity, fields and access rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: CollectionKind,
    #[serde(default)]
    pub system: bool,
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
    #[serde(flatten)]
    pub rules: AccessRules,
}

impl CollectionDescriptor {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            kind: CollectionKind::Base,
            system: false,
            fields: Vec::new(),
            rules: AccessRules::default(),
        }
    }

    /// The auth collection the store is bootstrapped with.
    pub fn system_users() -> Self {
        let mut users = Self::new(USERS_COLLECTION_ID, "users")
            .with_field(FieldDescriptor::new("email", FieldKind::Email).required().unique())
            .with_field(
                FieldDescriptor::new("username", FieldKind::Text)
                    .with_options(FieldOptions::text_length(Some(3), Some(150))),
            );
        users.kind = CollectionKind::Auth;
        users.system = true;
        users
    }

    pub fn with_field(mut self, field: FieldDescriptor) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_rule(mut self, op: RuleOperation, rule: AccessRule) -> Self {
        self.rules.set(op, rule);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Collection ids referenced by this collection's relation fields.
    pub fn relation_targets(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().filter_map(FieldDescriptor::relation_target)
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(Error::InvalidCollection("collection id cannot be empty".into()));
        }
        if !is_identifier(&self.id) {
            return Err(Error::InvalidCollection(format!(
                "collection id `{}` contains invalid characters",
                self.id
            )));
        }
        if self.name.is_empty() {
            return Err(Error::InvalidCollection(format!(
                "collection `{}` has an empty name",
                self.id
            )));
        }
        if !is_identifier(&self.name) {
            return Err(Error::InvalidCollection(format!(
                "collection name `{}` contains invalid characters",
                self.name
            )));
        }

        for (i, field) in self.fields.iter().enumerate() {
            if self.fields[..i].iter().any(|f| f.name == field.name) {
                return Err(Error::InvalidCollection(format!(
                    "collection `{}` declares field `{}` more than once",
                    self.name, field.name
                )));
            }
            field.validate().map_err(|e| {
                Error::InvalidCollection(format!("collection `{}`: {e}", self.name))
            })?;
        }

        for op in RuleOperation::ALL {
            if let AccessRule::Expression(expr) = self.rules.get(op)
                && expr.trim().is_empty()
            {
                return Err(Error::InvalidCollection(format!(
                    "collection `{}`: {} rule is blank",
                    self.name,
                    op.as_str()
                )));
            }
        }
        Ok(())
    }

    /// Field-level differences between two versions of a collection.
    ///
    /// Fields are matched by id when both sides carry one, otherwise by name.
    /// The result lists removals and modifications in `old` order, then
    /// additions in `new` order. It is informational: a migration states its
    /// own changes, since a rename and a drop-plus-add look alike here.
    pub fn diff(old: &CollectionDescriptor, new: &CollectionDescriptor) -> Vec<FieldChange> {
        let matches = |a: &FieldDescriptor, b: &FieldDescriptor| {
            if !a.id.is_empty() && !b.id.is_empty() {
                a.id == b.id
            } else {
                a.name == b.name
            }
        };

        let mut removes = Vec::new();
        let mut modifies = Vec::new();
        for before in &old.fields {
            match new.fields.iter().find(|after| matches(before, after)) {
                None => removes.push(FieldChange::Remove {
                    field: before.clone(),
                }),
                Some(after) if after != before => modifies.push(FieldChange::Modify {
                    before: before.clone(),
                    after: after.clone(),
                }),
                Some(_) => {}
            }
        }

        let adds = new
            .fields
            .iter()
            .filter(|after| !old.fields.iter().any(|before| matches(before, after)))
            .map(|field| FieldChange::Add {
                field: field.clone(),
            });

        removes.into_iter().chain(modifies).chain(adds).collect()
    }

    /// Apply field changes, producing the altered descriptor.
    ///
    /// Removals and modifications must name a field whose stored definition
    /// equals the recorded one, so the inverse change restores it exactly.
    pub fn apply_changes(&self, changes: &[FieldChange]) -> Result<CollectionDescriptor> {
        let mut next = self.clone();
        for change in changes {
            match change {
                FieldChange::Add { field } => {
                    if next.field(&field.name).is_some() {
                        return Err(Error::Store(format!(
                            "collection `{}` already has a field named `{}`",
                            next.name, field.name
                        )));
                    }
                    next.fields.push(field.clone());
                }
                FieldChange::Remove { field } => {
                    let index = next.recorded_field_index(field)?;
                    next.fields.remove(index);
                }
                FieldChange::Modify { before, after } => {
                    let index = next.recorded_field_index(before)?;
                    if after.name != before.name && next.field(&after.name).is_some() {
                        return Err(Error::Store(format!(
                            "cannot rename `{}` to `{}`: collection `{}` already has that field",
                            before.name, after.name, next.name
                        )));
                    }
                    next.fields[index] = after.clone();
                }
            }
        }
        next.validate()?;
        Ok(next)
    }

    fn recorded_field_index(&self, recorded: &FieldDescriptor) -> Result<usize> {
        let index = self
            .fields
            .iter()
            .position(|f| f.name == recorded.name)
            .ok_or_else(|| {
                Error::Store(format!(
                    "collection `{}` has no field named `{}`",
                    self.name, recorded.name
                ))
            })?;
        if &self.fields[index] != recorded {
            return Err(Error::Store(format!(
                "field `{}` in collection `{}` differs from its recorded definition",
                recorded.name, self.name
            )));
        }
        Ok(index)
    }

    /// Structural equality. Field order only matters for display.
    pub fn same_shape(&self, other: &CollectionDescriptor) -> bool {
        if self.id != other.id
            || self.name != other.name
            || self.kind != other.kind
            || self.system != other.system
            || self.rules != other.rules
            || self.fields.len() != other.fields.len()
        {
            return false;
        }
        self.fields
            .iter()
            .all(|field| other.field(&field.name) == Some(field))
    }
}
