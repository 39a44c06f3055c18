use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use stratum_common::{Error, Result};

/// Field names every record carries implicitly.
pub const RESERVED_FIELD_NAMES: &[&str] = &["id", "created", "updated"];

/// Recognized field kinds. Each kind accepts a fixed set of option keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Number,
    #[serde(alias = "boolean")]
    Bool,
    Date,
    Relation,
    Select,
    Email,
    Url,
    Json,
}

impl FieldKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldKind::Text => "text",
            FieldKind::Number => "number",
            FieldKind::Bool => "bool",
            FieldKind::Date => "date",
            FieldKind::Relation => "relation",
            FieldKind::Select => "select",
            FieldKind::Email => "email",
            FieldKind::Url => "url",
            FieldKind::Json => "json",
        }
    }

    /// Option keys (as authored) that this kind accepts.
    pub fn allowed_options(&self) -> &'static [&'static str] {
        match self {
            FieldKind::Text => &["min", "max", "pattern"],
            FieldKind::Number => &["min", "max", "noDecimal"],
            FieldKind::Date => &["min", "max"],
            FieldKind::Relation => &[
                "collectionId",
                "cascadeDelete",
                "minSelect",
                "maxSelect",
                "displayFields",
            ],
            FieldKind::Select => &["values", "maxSelect"],
            FieldKind::Bool | FieldKind::Email | FieldKind::Url | FieldKind::Json => &[],
        }
    }
}

/// A `min`/`max` bound. Numeric for text lengths and numbers, a timestamp
/// string for dates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Bound {
    Number(f64),
    Text(String),
}

/// Kind-specific options. Which keys may be set depends on the field kind;
/// see [`FieldKind::allowed_options`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FieldOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<Bound>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<Bound>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_decimal: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cascade_delete: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_select: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_select: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_fields: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<String>>,
}

impl FieldOptions {
    pub fn text_length(min: Option<u32>, max: Option<u32>) -> Self {
        Self {
            min: min.map(|v| Bound::Number(f64::from(v))),
            max: max.map(|v| Bound::Number(f64::from(v))),
            ..Default::default()
        }
    }

    pub fn number_range(min: Option<f64>, max: Option<f64>) -> Self {
        Self {
            min: min.map(Bound::Number),
            max: max.map(Bound::Number),
            ..Default::default()
        }
    }

    pub fn relation(collection_id: impl Into<String>, cascade_delete: bool) -> Self {
        Self {
            collection_id: Some(collection_id.into()),
            cascade_delete: Some(cascade_delete),
            ..Default::default()
        }
    }

    pub fn select<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            values: Some(values.into_iter().map(Into::into).collect()),
            ..Default::default()
        }
    }

    /// Authored keys that carry a value.
    pub fn present_keys(&self) -> Vec<&'static str> {
        let mut keys = Vec::new();
        if self.min.is_some() {
            keys.push("min");
        }
        if self.max.is_some() {
            keys.push("max");
        }
        if self.pattern.is_some() {
            keys.push("pattern");
        }
        if self.no_decimal.is_some() {
            keys.push("noDecimal");
        }
        if self.collection_id.is_some() {
            keys.push("collectionId");
        }
        if self.cascade_delete.is_some() {
            keys.push("cascadeDelete");
        }
        if self.min_select.is_some() {
            keys.push("minSelect");
        }
        if self.max_select.is_some() {
            keys.push("maxSelect");
        }
        if self.display_fields.is_some() {
            keys.push("displayFields");
        }
        if self.values.is_some() {
            keys.push("values");
        }
        keys
    }
}

/// A single typed field definition inside a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    /// Optional stable id; used to match fields across renames.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    pub name: String,
    #[serde(rename = "type", default)]
    pub kind: Option<FieldKind>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub options: FieldOptions,
}

impl FieldDescriptor {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            kind: Some(kind),
            required: false,
            unique: false,
            options: FieldOptions::default(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn with_options(mut self, options: FieldOptions) -> Self {
        self.options = options;
        self
    }

    /// Target collection id for relation fields.
    pub fn relation_target(&self) -> Option<&str> {
        match self.kind {
            Some(FieldKind::Relation) => self.options.collection_id.as_deref(),
            _ => None,
        }
    }

    /// Whether the field holds a list of values rather than a single one.
    pub fn is_multi(&self) -> bool {
        matches!(self.kind, Some(FieldKind::Relation | FieldKind::Select))
            && self.options.max_select.is_some_and(|max| max > 1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(invalid("field name cannot be empty"));
        }
        if !is_identifier(&self.name) {
            return Err(invalid(format!(
                "field name `{}` must start with a letter or underscore and contain only letters, digits and underscores",
                self.name
            )));
        }
        if RESERVED_FIELD_NAMES.contains(&self.name.as_str()) {
            return Err(invalid(format!("field name `{}` is reserved", self.name)));
        }

        let Some(kind) = self.kind else {
            return Err(invalid(format!("field `{}` has no type", self.name)));
        };

        let allowed = kind.allowed_options();
        if let Some(key) = self
            .options
            .present_keys()
            .into_iter()
            .find(|key| !allowed.contains(key))
        {
            return Err(invalid(format!(
                "field `{}`: option `{key}` is not valid for {} fields",
                self.name,
                kind.as_str()
            )));
        }

        match kind {
            FieldKind::Text => self.validate_text(),
            FieldKind::Number => self.validate_number(),
            FieldKind::Date => self.validate_date(),
            FieldKind::Relation => self.validate_relation(),
            FieldKind::Select => self.validate_select(),
            FieldKind::Bool | FieldKind::Email | FieldKind::Url | FieldKind::Json => Ok(()),
        }
    }

    fn validate_text(&self) -> Result<()> {
        let min = self.length_bound("min", self.options.min.as_ref())?;
        let max = self.length_bound("max", self.options.max.as_ref())?;
        if let (Some(min), Some(max)) = (min, max)
            && min > max
        {
            return Err(invalid(format!(
                "field `{}`: min length {min} exceeds max length {max}",
                self.name
            )));
        }
        if let Some(pattern) = self.options.pattern.as_deref()
            && !pattern.is_empty()
        {
            Regex::new(pattern).map_err(|e| {
                invalid(format!("field `{}`: invalid pattern: {e}", self.name))
            })?;
        }
        Ok(())
    }

    fn length_bound(&self, key: &str, bound: Option<&Bound>) -> Result<Option<f64>> {
        match bound {
            None => Ok(None),
            Some(Bound::Number(n)) if *n >= 0.0 && n.fract() == 0.0 => Ok(Some(*n)),
            Some(_) => Err(invalid(format!(
                "field `{}`: `{key}` must be a non-negative integer",
                self.name
            ))),
        }
    }

    fn validate_number(&self) -> Result<()> {
        let numeric = |key: &str, bound: Option<&Bound>| match bound {
            None => Ok(None),
            Some(Bound::Number(n)) if n.is_finite() => Ok(Some(*n)),
            Some(_) => Err(invalid(format!(
                "field `{}`: `{key}` must be a finite number",
                self.name
            ))),
        };
        let min = numeric("min", self.options.min.as_ref())?;
        let max = numeric("max", self.options.max.as_ref())?;
        if let (Some(min), Some(max)) = (min, max)
            && min > max
        {
            return Err(invalid(format!(
                "field `{}`: min {min} exceeds max {max}",
                self.name
            )));
        }
        Ok(())
    }

    fn validate_date(&self) -> Result<()> {
        let timestamp = |key: &str, bound: Option<&Bound>| match bound {
            None => Ok(None),
            Some(Bound::Text(s)) if s.is_empty() => Ok(None),
            Some(Bound::Text(s)) => parse_timestamp(s).map(Some).ok_or_else(|| {
                invalid(format!(
                    "field `{}`: `{key}` is not a valid timestamp: {s}",
                    self.name
                ))
            }),
            Some(Bound::Number(_)) => Err(invalid(format!(
                "field `{}`: `{key}` must be a timestamp string",
                self.name
            ))),
        };
        let min = timestamp("min", self.options.min.as_ref())?;
        let max = timestamp("max", self.options.max.as_ref())?;
        if let (Some(min), Some(max)) = (min, max)
            && min > max
        {
            return Err(invalid(format!(
                "field `{}`: min date is after max date",
                self.name
            )));
        }
        Ok(())
    }

    fn validate_relation(&self) -> Result<()> {
        match self.options.collection_id.as_deref() {
            Some(target) if !target.is_empty() => {}
            _ => {
                return Err(invalid(format!(
                    "relation field `{}` requires a collectionId",
                    self.name
                )));
            }
        }
        self.validate_selection_bounds(None)
    }

    fn validate_select(&self) -> Result<()> {
        let values = match self.options.values.as_deref() {
            Some(values) if !values.is_empty() => values,
            _ => {
                return Err(invalid(format!(
                    "select field `{}` requires at least one value",
                    self.name
                )));
            }
        };
        for (i, value) in values.iter().enumerate() {
            if value.trim().is_empty() {
                return Err(invalid(format!(
                    "select field `{}` has an empty value",
                    self.name
                )));
            }
            if values[..i].contains(value) {
                return Err(invalid(format!(
                    "select field `{}` lists `{value}` more than once",
                    self.name
                )));
            }
        }
        self.validate_selection_bounds(Some(values.len()))
    }

    fn validate_selection_bounds(&self, choices: Option<usize>) -> Result<()> {
        if self.options.max_select == Some(0) {
            return Err(invalid(format!(
                "field `{}`: maxSelect must be at least 1",
                self.name
            )));
        }
        if let (Some(min), Some(max)) = (self.options.min_select, self.options.max_select)
            && min > max
        {
            return Err(invalid(format!(
                "field `{}`: minSelect {min} exceeds maxSelect {max}",
                self.name
            )));
        }
        if let (Some(max), Some(choices)) = (self.options.max_select, choices)
            && max as usize > choices
        {
            return Err(invalid(format!(
                "field `{}`: maxSelect {max} exceeds the {choices} available values",
                self.name
            )));
        }
        Ok(())
    }
}

/// `[A-Za-z_][A-Za-z0-9_]*`
pub fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
        .or_else(|| {
            // Stored timestamps look like "2025-09-10 19:16:59.102Z"
            NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.fZ")
                .map(|naive| naive.and_utc())
                .ok()
        })
}

fn invalid(msg: impl Into<String>) -> Error {
    Error::InvalidField(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn title() -> FieldDescriptor {
        FieldDescriptor::new("title", FieldKind::Text)
            .required()
            .with_options(FieldOptions::text_length(None, Some(200)))
    }

    #[test]
    fn accepts_well_formed_fields() {
        assert!(title().validate().is_ok());
        assert!(
            FieldDescriptor::new("quantity", FieldKind::Number)
                .with_options(FieldOptions::number_range(Some(0.0), None))
                .validate()
                .is_ok()
        );
        assert!(
            FieldDescriptor::new("user_id", FieldKind::Relation)
                .with_options(FieldOptions::relation("_pb_users_auth_", true))
                .validate()
                .is_ok()
        );
        assert!(
            FieldDescriptor::new("season", FieldKind::Select)
                .with_options(FieldOptions::select(["kharif", "rabi", "zaid"]))
                .validate()
                .is_ok()
        );
        assert!(FieldDescriptor::new("completed", FieldKind::Bool).validate().is_ok());
    }

    #[test]
    fn rejects_empty_and_malformed_names() {
        let mut field = title();
        field.name.clear();
        assert!(matches!(field.validate(), Err(Error::InvalidField(_))));

        field.name = "2fast".into();
        assert!(field.validate().is_err());

        field.name = "has space".into();
        assert!(field.validate().is_err());

        field.name = "created".into();
        assert!(field.validate().is_err());
    }

    #[test]
    fn rejects_missing_kind() {
        let mut field = title();
        field.kind = None;
        let err = field.validate().unwrap_err();
        assert!(err.to_string().contains("has no type"));
    }

    #[test]
    fn rejects_options_that_do_not_match_kind() {
        let field = FieldDescriptor::new("completed", FieldKind::Bool)
            .with_options(FieldOptions::text_length(Some(1), None));
        let err = field.validate().unwrap_err();
        assert!(err.to_string().contains("option `min` is not valid for bool"));

        let field = FieldDescriptor::new("title", FieldKind::Text)
            .with_options(FieldOptions::relation("users", false));
        assert!(field.validate().is_err());
    }

    #[test]
    fn text_bounds_must_be_ordered_integers() {
        let field = FieldDescriptor::new("code", FieldKind::Text)
            .with_options(FieldOptions::text_length(Some(10), Some(5)));
        assert!(field.validate().is_err());

        let field = FieldDescriptor::new("code", FieldKind::Text)
            .with_options(FieldOptions::number_range(Some(1.5), None));
        assert!(field.validate().is_err());
    }

    #[test]
    fn text_pattern_must_compile() {
        let mut field = title();
        field.options.pattern = Some("^[a-z]+$".into());
        assert!(field.validate().is_ok());

        field.options.pattern = Some("([".into());
        assert!(field.validate().is_err());

        field.options.pattern = Some(String::new());
        assert!(field.validate().is_ok());
    }

    #[test]
    fn date_bounds_accept_empty_and_stored_formats() {
        let mut field = FieldDescriptor::new("date", FieldKind::Date);
        field.options.min = Some(Bound::Text(String::new()));
        field.options.max = Some(Bound::Text(String::new()));
        assert!(field.validate().is_ok());

        field.options.min = Some(Bound::Text("2025-01-01 00:00:00.000Z".into()));
        field.options.max = Some(Bound::Text("2025-12-31T23:59:59Z".into()));
        assert!(field.validate().is_ok());

        field.options.min = Some(Bound::Text("2026-01-01T00:00:00Z".into()));
        assert!(field.validate().is_err());

        field.options.min = Some(Bound::Text("yesterday".into()));
        assert!(field.validate().is_err());
    }

    #[test]
    fn relation_requires_target() {
        let mut field = FieldDescriptor::new("owner", FieldKind::Relation)
            .with_options(FieldOptions::relation("", true));
        assert!(field.validate().is_err());

        field.options.collection_id = Some("users".into());
        field.options.min_select = Some(3);
        field.options.max_select = Some(1);
        assert!(field.validate().is_err());
    }

    #[test]
    fn select_values_must_be_unique_and_cover_max_select() {
        let field = FieldDescriptor::new("season", FieldKind::Select)
            .with_options(FieldOptions::select(["rabi", "rabi"]));
        assert!(field.validate().is_err());

        let field = FieldDescriptor::new("season", FieldKind::Select)
            .with_options(FieldOptions::select(Vec::<String>::new()));
        assert!(field.validate().is_err());

        let mut field = FieldDescriptor::new("season", FieldKind::Select)
            .with_options(FieldOptions::select(["rabi", "zaid"]));
        field.options.max_select = Some(3);
        assert!(field.validate().is_err());
    }

    #[test]
    fn deserializes_authored_json() {
        let json = r#"{
            "id": "rkipllhg",
            "name": "title",
            "type": "text",
            "required": true,
            "options": { "min": null, "max": 200, "pattern": "" }
        }"#;
        let field: FieldDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(field.kind, Some(FieldKind::Text));
        assert_eq!(field.options.max, Some(Bound::Number(200.0)));
        assert!(field.validate().is_ok());
    }

    #[test]
    fn unknown_option_keys_fail_to_deserialize() {
        let json = r#"{ "name": "done", "type": "bool", "options": { "colour": "red" } }"#;
        assert!(serde_json::from_str::<FieldDescriptor>(json).is_err());
    }

    #[test]
    fn boolean_alias_is_accepted() {
        let json = r#"{ "name": "done", "type": "boolean" }"#;
        let field: FieldDescriptor = serde_json::from_str(json).unwrap();
        assert_eq!(field.kind, Some(FieldKind::Bool));
    }

    #[test]
    fn multi_value_fields_are_detected() {
        let mut field = FieldDescriptor::new("tags", FieldKind::Select)
            .with_options(FieldOptions::select(["a", "b"]));
        assert!(!field.is_multi());
        field.options.max_select = Some(2);
        assert!(field.is_multi());
    }
}
