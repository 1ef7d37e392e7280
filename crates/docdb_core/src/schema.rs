//! Collection schemas and index definitions.
//!
//! Schemas are written in a compact string form and parsed once when a
//! collection is configured:
//!
//! ```text
//! @id; &email; *tags:string; [last+first]; age:number
//! ```
//!
//! | sigil        | meaning                                        |
//! |--------------|------------------------------------------------|
//! | `@field`     | UUID primary key, generated when missing       |
//! | `++field`    | auto-increment primary key                     |
//! | `&field`     | unique index                                   |
//! | `*field`     | multi-value index (array elements indexed)     |
//! | `[a+b]`      | compound index                                 |
//! | `field:type` | typed, unindexed field                         |
//!
//! Types are `string`, `number`, `boolean`, `object`, `array` and `any`.

use crate::document::{kind_name, Document, ID_FIELD};
use crate::error::{CoreError, CoreResult};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldType {
    /// Any JSON value.
    #[default]
    Any,
    /// JSON string.
    String,
    /// JSON number.
    Number,
    /// JSON boolean.
    Boolean,
    /// JSON object.
    Object,
    /// JSON array.
    Array,
}

impl FieldType {
    fn parse(name: &str) -> CoreResult<Self> {
        match name {
            "any" => Ok(Self::Any),
            "string" => Ok(Self::String),
            "number" => Ok(Self::Number),
            "boolean" | "bool" => Ok(Self::Boolean),
            "object" => Ok(Self::Object),
            "array" => Ok(Self::Array),
            other => Err(CoreError::validation(format!("unknown field type {other:?}"))),
        }
    }

    /// Returns true if `value` has this type. `null` never matches a concrete type.
    #[must_use]
    pub fn matches(self, value: &Value) -> bool {
        match self {
            Self::Any => true,
            Self::String => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Any => "any",
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        };
        f.write_str(name)
    }
}

/// How document ids are assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrimaryKey {
    /// The caller supplies `id`.
    #[default]
    Supplied,
    /// A UUID v4 is generated when `id` is missing.
    Uuid,
    /// A per-collection counter is used when `id` is missing.
    AutoIncrement,
}

/// A typed field declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSchema {
    /// Field path.
    pub name: String,
    /// Declared type.
    pub ty: FieldType,
    /// For multi-value fields, arrays are checked element by element.
    pub multi_value: bool,
}

impl FieldSchema {
    fn check(&self, value: &Value) -> CoreResult<()> {
        let ok = match value {
            Value::Array(items) if self.multi_value && self.ty != FieldType::Array => {
                items.iter().all(|item| self.ty.matches(item))
            }
            _ => self.ty.matches(value),
        };
        if ok {
            Ok(())
        } else {
            Err(CoreError::validation(format!(
                "field {:?} must be {}, got {}",
                self.name,
                self.ty,
                kind_name(value)
            )))
        }
    }
}

/// A secondary index definition.
///
/// Uniqueness is a property of the definition: the tree itself always
/// accepts duplicate keys, and the collection checks uniqueness before
/// writing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndexDefinition {
    /// Indexed field paths; more than one makes a compound index.
    pub fields: Vec<String>,
    /// Whether a key may map to at most one document.
    pub unique: bool,
    /// Whether the field is declared to hold arrays. Array values are
    /// indexed element by element for every index; this flag only changes
    /// how the field is typed.
    pub multi_value: bool,
}

impl IndexDefinition {
    /// A plain, non-unique index on one field.
    pub fn plain(field: impl Into<String>) -> Self {
        Self {
            fields: vec![field.into()],
            unique: false,
            multi_value: false,
        }
    }

    /// A unique index on one field.
    pub fn unique(field: impl Into<String>) -> Self {
        Self {
            unique: true,
            ..Self::plain(field)
        }
    }

    /// A multi-value index on one field.
    pub fn multi_value(field: impl Into<String>) -> Self {
        Self {
            multi_value: true,
            ..Self::plain(field)
        }
    }

    /// A compound index over several fields.
    pub fn compound<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            unique: false,
            multi_value: false,
        }
    }

    /// Returns true for indexes over more than one field.
    #[must_use]
    pub fn is_compound(&self) -> bool {
        self.fields.len() > 1
    }

    /// Returns the single indexed field, if this is not a compound index.
    #[must_use]
    pub fn single_field(&self) -> Option<&str> {
        match self.fields.as_slice() {
            [field] => Some(field),
            _ => None,
        }
    }

    /// The canonical name in schema-string form, e.g. `&email` or `[a+b]`.
    #[must_use]
    pub fn name(&self) -> String {
        let body = if self.is_compound() {
            format!("[{}]", self.fields.join("+"))
        } else {
            self.fields.join("+")
        };
        if self.unique {
            format!("&{body}")
        } else if self.multi_value {
            format!("*{body}")
        } else {
            body
        }
    }

    /// Directory name under `_indexes/`.
    #[must_use]
    pub fn dir_name(&self) -> String {
        self.fields.join("+")
    }

    /// Parses a canonical name back into a definition.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `name` is not an index spec.
    pub fn from_name(name: &str) -> CoreResult<Self> {
        let (unique, rest) = match name.strip_prefix('&') {
            Some(rest) => (true, rest),
            None => (false, name),
        };
        let (multi_value, rest) = match rest.strip_prefix('*') {
            Some(rest) => (true, rest),
            None => (false, rest),
        };
        let fields = match rest.strip_prefix('[').and_then(|r| r.strip_suffix(']')) {
            Some(inner) => parse_compound_fields(inner)?,
            None => vec![parse_field_name(rest)?.to_string()],
        };
        Ok(Self {
            fields,
            unique,
            multi_value,
        })
    }
}

impl fmt::Display for IndexDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Parsed, typed schema of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CollectionSchema {
    /// How ids are assigned.
    pub primary_key: PrimaryKey,
    /// Typed fields by path.
    pub fields: BTreeMap<String, FieldSchema>,
    /// Declared secondary indexes.
    pub indexes: Vec<IndexDefinition>,
}

impl CollectionSchema {
    /// An empty schema: caller-supplied ids, no typed fields, no indexes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a schema string.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed specs, unknown types,
    /// more than one primary key or two indexes over the same fields.
    pub fn parse(spec: &str) -> CoreResult<Self> {
        let mut schema = Self::new();
        let mut primary_key_seen = false;

        for raw in spec.split(';') {
            let item = raw.trim();
            if item.is_empty() {
                continue;
            }

            if let Some(rest) = item.strip_prefix("++") {
                schema.set_primary_key(&mut primary_key_seen, rest, PrimaryKey::AutoIncrement)?;
            } else if let Some(rest) = item.strip_prefix('@') {
                schema.set_primary_key(&mut primary_key_seen, rest, PrimaryKey::Uuid)?;
            } else if let Some(rest) = item.strip_prefix('&') {
                let (name, ty) = split_typed(rest)?;
                schema.add_field(name, ty, false);
                schema.add_index(IndexDefinition::unique(name))?;
            } else if let Some(rest) = item.strip_prefix('*') {
                let (name, ty) = split_typed(rest)?;
                schema.add_field(name, ty, true);
                schema.add_index(IndexDefinition::multi_value(name))?;
            } else if let Some(inner) = item.strip_prefix('[') {
                let inner = inner
                    .strip_suffix(']')
                    .ok_or_else(|| CoreError::validation(format!("unterminated compound index {item:?}")))?;
                schema.add_index(IndexDefinition::compound(parse_compound_fields(inner)?))?;
            } else {
                let (name, ty) = split_typed(item)?;
                schema.add_field(name, ty, false);
            }
        }

        Ok(schema)
    }

    /// Adds an index definition.
    ///
    /// # Errors
    ///
    /// Returns a validation error if an index over the same fields exists.
    pub fn add_index(&mut self, definition: IndexDefinition) -> CoreResult<()> {
        if self.indexes.iter().any(|d| d.fields == definition.fields) {
            return Err(CoreError::validation(format!(
                "duplicate index on {:?}",
                definition.dir_name()
            )));
        }
        self.indexes.push(definition);
        Ok(())
    }

    /// Adds an index definition, builder style.
    ///
    /// # Errors
    ///
    /// See [`CollectionSchema::add_index`].
    pub fn with_index(mut self, definition: IndexDefinition) -> CoreResult<Self> {
        self.add_index(definition)?;
        Ok(self)
    }

    /// Sets the primary key strategy, builder style.
    #[must_use]
    pub fn with_primary_key(mut self, primary_key: PrimaryKey) -> Self {
        self.primary_key = primary_key;
        self
    }

    /// Checks a document against the typed fields.
    ///
    /// Missing fields are allowed; present fields must match their type.
    /// The id must be a non-empty string.
    ///
    /// # Errors
    ///
    /// Returns a validation error describing the first mismatch.
    pub fn validate(&self, doc: &Document) -> CoreResult<()> {
        match doc.get(ID_FIELD) {
            Some(Value::String(id)) if !id.is_empty() => {}
            Some(other) => {
                return Err(CoreError::validation(format!(
                    "id must be a non-empty string, got {}",
                    kind_name(other)
                )))
            }
            None => return Err(CoreError::validation("document has no id")),
        }

        for field in self.fields.values() {
            if let Some(value) = doc.get_path(&field.name) {
                field.check(value)?;
            }
        }
        Ok(())
    }

    fn set_primary_key(
        &mut self,
        seen: &mut bool,
        rest: &str,
        primary_key: PrimaryKey,
    ) -> CoreResult<()> {
        if *seen {
            return Err(CoreError::validation("schema declares more than one primary key"));
        }
        let name = parse_field_name(rest)?;
        if name != ID_FIELD {
            return Err(CoreError::validation(format!(
                "primary key must be the {ID_FIELD:?} field, got {name:?}"
            )));
        }
        *seen = true;
        self.primary_key = primary_key;
        Ok(())
    }

    fn add_field(&mut self, name: &str, ty: FieldType, multi_value: bool) {
        self.fields.insert(
            name.to_string(),
            FieldSchema {
                name: name.to_string(),
                ty,
                multi_value,
            },
        );
    }
}

fn split_typed(spec: &str) -> CoreResult<(&str, FieldType)> {
    match spec.split_once(':') {
        Some((name, ty)) => Ok((parse_field_name(name)?, FieldType::parse(ty.trim())?)),
        None => Ok((parse_field_name(spec)?, FieldType::Any)),
    }
}

fn parse_compound_fields(inner: &str) -> CoreResult<Vec<String>> {
    let fields = inner
        .split('+')
        .map(|f| parse_field_name(f).map(str::to_string))
        .collect::<CoreResult<Vec<_>>>()?;
    if fields.len() < 2 {
        return Err(CoreError::validation(format!(
            "compound index [{inner}] needs at least two fields"
        )));
    }
    Ok(fields)
}

fn parse_field_name(raw: &str) -> CoreResult<&str> {
    let name = raw.trim();
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.ends_with('.')
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(name)
    } else {
        Err(CoreError::validation(format!("invalid field name {raw:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_full_schema() {
        let schema =
            CollectionSchema::parse("@id; &email; *tags:string; [last+first]; age:number").unwrap();

        assert_eq!(schema.primary_key, PrimaryKey::Uuid);
        assert_eq!(schema.fields["age"].ty, FieldType::Number);
        assert_eq!(schema.fields["tags"].ty, FieldType::String);
        assert!(schema.fields["tags"].multi_value);

        let names: Vec<String> = schema.indexes.iter().map(IndexDefinition::name).collect();
        assert_eq!(names, vec!["&email", "*tags", "[last+first]"]);
    }

    #[test]
    fn parse_auto_increment() {
        let schema = CollectionSchema::parse("++id;name:string").unwrap();
        assert_eq!(schema.primary_key, PrimaryKey::AutoIncrement);
        assert!(schema.indexes.is_empty());
    }

    #[test]
    fn parse_rejects_bad_specs() {
        assert!(CollectionSchema::parse("@id;++id").is_err());
        assert!(CollectionSchema::parse("@uid").is_err());
        assert!(CollectionSchema::parse("age:decimal").is_err());
        assert!(CollectionSchema::parse("[a]").is_err());
        assert!(CollectionSchema::parse("[a+b").is_err());
        assert!(CollectionSchema::parse("&a;*a").is_err());
        assert!(CollectionSchema::parse("bad name").is_err());
    }

    #[test]
    fn empty_schema() {
        let schema = CollectionSchema::parse("  ;  ").unwrap();
        assert_eq!(schema, CollectionSchema::new());
    }

    #[test]
    fn canonical_names_round_trip() {
        for def in [
            IndexDefinition::plain("age"),
            IndexDefinition::unique("email"),
            IndexDefinition::multi_value("tags"),
            IndexDefinition::compound(["last", "first"]),
            IndexDefinition::plain("address.city"),
        ] {
            assert_eq!(IndexDefinition::from_name(&def.name()).unwrap(), def);
        }
        assert_eq!(IndexDefinition::compound(["a", "b"]).dir_name(), "a+b");
    }

    #[test]
    fn validate_types() {
        let schema = CollectionSchema::parse("age:number; *tags:string").unwrap();

        let ok = Document::from_value(json!({"id": "a", "age": 3, "tags": ["x"]})).unwrap();
        assert!(schema.validate(&ok).is_ok());

        let missing = Document::from_value(json!({"id": "a"})).unwrap();
        assert!(schema.validate(&missing).is_ok());

        let bad_age = Document::from_value(json!({"id": "a", "age": "3"})).unwrap();
        assert!(matches!(schema.validate(&bad_age), Err(CoreError::Validation { .. })));

        let bad_tag = Document::from_value(json!({"id": "a", "tags": ["x", 1]})).unwrap();
        assert!(schema.validate(&bad_tag).is_err());
    }

    #[test]
    fn validate_id() {
        let schema = CollectionSchema::new();
        let no_id = Document::from_value(json!({"name": "x"})).unwrap();
        assert!(schema.validate(&no_id).is_err());

        let numeric = Document::from_value(json!({"id": 5})).unwrap();
        assert!(schema.validate(&numeric).is_err());

        let empty = Document::from_value(json!({"id": ""})).unwrap();
        assert!(schema.validate(&empty).is_err());
    }
}
