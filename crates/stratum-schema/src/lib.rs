//! Declarative descriptors for record collections.
//!
//! A [`CollectionDescriptor`] is an ordered list of [`FieldDescriptor`]s plus
//! identity and access rules. Descriptors are plain data: they are validated
//! against the recognized field kinds and never inferred from record shape.

pub mod collection;
pub mod field;
pub mod schema;

pub use collection::{
    AccessRule, AccessRules, CollectionDescriptor, CollectionKind, FieldChange, RuleOperation,
    USERS_COLLECTION_ID,
};
pub use field::{Bound, FieldDescriptor, FieldKind, FieldOptions};
pub use schema::Schema;
