//! Namespace registry.
//!
//! Each content type registers a [`NamespaceDescriptor`] once at startup. A
//! descriptor carries the type's zero-value template and three hooks, all
//! optional with sensible defaults:
//! - `decode`: apply a field map onto a record
//! - `sort_key`: the key the sorted index orders by
//! - `slug_of`: the slug candidate for a freshly inserted record
//!
//! The registry is immutable once built and is shared by reference.

use super::{
    CodecError, CodecResult, FieldMap, Record, ID_FIELD, REMOVE_SENTINEL, SLUG_FIELD,
    TIMESTAMP_FIELD, UPDATED_FIELD, UUID_FIELD,
};
use serde_json::{Number, Value};
use std::collections::HashMap;

/// Applies `fields` onto `record`, using `template` for field kinds and defaults.
pub type DecodeFn = fn(template: &Record, record: &mut Record, fields: &FieldMap) -> CodecResult<()>;

/// Computes the ordering key of a record.
pub type SortKeyFn = fn(record: &Record) -> SortKey;

/// Derives the slug candidate of a record.
pub type SlugFn = fn(record: &Record) -> Option<String>;

/// Ordering key for the sorted index. Larger sorts first.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct SortKey {
    /// Epoch milliseconds
    pub timestamp: i64,
    /// Tie breaker, used on its own when no timestamp exists
    pub fallback: i64,
}

/// Describes one content type.
#[derive(Clone)]
pub struct NamespaceDescriptor {
    kind: String,
    template: Record,
    decode: DecodeFn,
    sort_key: SortKeyFn,
    slug_of: SlugFn,
}

impl std::fmt::Debug for NamespaceDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamespaceDescriptor")
            .field("kind", &self.kind)
            .field("template", &self.template)
            .finish()
    }
}

impl NamespaceDescriptor {
    /// A descriptor with the default hooks and the core item fields.
    pub fn new(kind: impl Into<String>) -> Self {
        let mut template = Record::new();
        template.insert(ID_FIELD, Value::from(0));
        template.insert(UUID_FIELD, Value::from(""));
        template.insert(SLUG_FIELD, Value::from(""));
        template.insert(TIMESTAMP_FIELD, Value::from(0));
        template.insert(UPDATED_FIELD, Value::from(0));

        Self {
            kind: kind.into(),
            template,
            decode: decode_fields,
            sort_key: default_sort_key,
            slug_of: default_slug,
        }
    }

    /// Declares a typed field and its zero value.
    pub fn with_field(mut self, field: &str, zero: Value) -> Self {
        self.template.insert(field, zero);
        self
    }

    pub fn with_decoder(mut self, decode: DecodeFn) -> Self {
        self.decode = decode;
        self
    }

    pub fn with_sort_key(mut self, sort_key: SortKeyFn) -> Self {
        self.sort_key = sort_key;
        self
    }

    pub fn with_slug(mut self, slug_of: SlugFn) -> Self {
        self.slug_of = slug_of;
        self
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// A fresh zero-value record of this type.
    pub fn zero(&self) -> Record {
        self.template.clone()
    }

    /// Decodes `fields` onto `record`.
    pub fn decode(&self, record: &mut Record, fields: &FieldMap) -> CodecResult<()> {
        (self.decode)(&self.template, record, fields)
    }

    /// Decodes a stored record of this type.
    pub fn decode_bytes(&self, raw: &[u8]) -> CodecResult<Record> {
        Record::from_bytes(raw)
    }

    pub fn sort_key(&self, record: &Record) -> SortKey {
        (self.sort_key)(record)
    }

    /// Slug candidate for `record`, already normalized.
    pub fn slug_of(&self, record: &Record) -> Option<String> {
        (self.slug_of)(record)
            .map(|s| slugify(&s))
            .filter(|s| !s.is_empty())
    }
}

/// Immutable set of registered content types.
#[derive(Clone, Debug, Default)]
pub struct TypeRegistry {
    types: HashMap<String, NamespaceDescriptor>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a descriptor, replacing any previous one of the same kind.
    pub fn register(mut self, descriptor: NamespaceDescriptor) -> Self {
        self.types.insert(descriptor.kind.clone(), descriptor);
        self
    }

    pub fn get(&self, kind: &str) -> CodecResult<&NamespaceDescriptor> {
        self.types
            .get(kind)
            .ok_or_else(|| CodecError::UnknownNamespace(kind.to_string()))
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.types.contains_key(kind)
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.types.keys().map(String::as_str).collect();
        kinds.sort();
        kinds
    }
}

/// Default decoder. The template (or, failing that, the current value) decides
/// how each submitted string is typed; unknown fields are kept as strings, or
/// string arrays when several values were submitted.
pub fn decode_fields(template: &Record, record: &mut Record, fields: &FieldMap) -> CodecResult<()> {
    for (field, values) in fields.iter() {
        if field.is_empty() {
            continue;
        }

        if values.len() == 1 && values[0] == REMOVE_SENTINEL {
            match template.get(field) {
                Some(zero) => record.insert(field.as_str(), zero.clone()),
                None => {
                    record.remove(field);
                }
            }
            continue;
        }

        let kind = template.get(field).or_else(|| record.get(field)).cloned();
        let value = match kind {
            Some(Value::Number(zero)) => parse_number(field, first(values), &zero)?,
            Some(Value::Bool(_)) => parse_bool(field, first(values))?,
            Some(Value::Array(_)) => Value::from(values.clone()),
            Some(Value::String(_)) => Value::from(first(values)),
            _ if values.len() == 1 => Value::from(values[0].as_str()),
            _ => Value::from(values.clone()),
        };
        record.insert(field.as_str(), value);
    }

    Ok(())
}

fn first(values: &[String]) -> &str {
    values.first().map(String::as_str).unwrap_or("")
}

fn parse_number(field: &str, raw: &str, zero: &Number) -> CodecResult<Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Value::Number(zero.clone()));
    }

    if !zero.is_f64() {
        if let Ok(i) = raw.parse::<i64>() {
            return Ok(Value::from(i));
        }
    }

    raw.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .ok_or_else(|| CodecError::InvalidField {
            field: field.to_string(),
            reason: format!("{:?} is not a number", raw),
        })
}

fn parse_bool(field: &str, raw: &str) -> CodecResult<Value> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "on" | "1" | "yes" => Ok(Value::Bool(true)),
        "false" | "off" | "0" | "no" | "" => Ok(Value::Bool(false)),
        other => Err(CodecError::InvalidField {
            field: field.to_string(),
            reason: format!("{:?} is not a boolean", other),
        }),
    }
}

/// Orders by `timestamp`, falling back to `updated`, ties broken by id.
pub fn default_sort_key(record: &Record) -> SortKey {
    let timestamp = match record.timestamp() {
        0 => record.updated(),
        t => t,
    };
    SortKey {
        timestamp,
        fallback: record.id(),
    }
}

/// Slug from `title` or `name`, else from the uuid.
pub fn default_slug(record: &Record) -> Option<String> {
    record
        .str_field("title")
        .or_else(|| record.str_field("name"))
        .map(str::to_string)
        .or_else(|| record.uuid().map(|u| format!("item-id-{}", u)))
}

/// Lowercases and replaces every run of non-alphanumerics with a single `-`.
pub fn slugify(raw: &str) -> String {
    let mut slug = String::with_capacity(raw.len());
    let mut pending_dash = false;

    for c in raw.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }

    slug
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn post() -> NamespaceDescriptor {
        NamespaceDescriptor::new("Post")
            .with_field("title", json!(""))
            .with_field("views", json!(0))
            .with_field("rating", json!(0.0))
            .with_field("published", json!(false))
            .with_field("tags", json!([]))
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Hello World"), "hello-world");
        assert_eq!(slugify("  Rust -- is_fun!  "), "rust-is-fun");
        assert_eq!(slugify("Ünïcode Title"), "ünïcode-title");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn test_decode_types_from_template() {
        let desc = post();
        let mut record = desc.zero();
        let fields: FieldMap = vec![
            ("title", "Hi"),
            ("views", "12"),
            ("rating", "4.5"),
            ("published", "on"),
            ("tags", "a"),
            ("tags", "b"),
            ("extra", "x"),
        ]
        .into_iter()
        .collect();

        desc.decode(&mut record, &fields).unwrap();
        assert_eq!(record.get("title"), Some(&json!("Hi")));
        assert_eq!(record.get("views"), Some(&json!(12)));
        assert_eq!(record.get("rating"), Some(&json!(4.5)));
        assert_eq!(record.get("published"), Some(&json!(true)));
        assert_eq!(record.get("tags"), Some(&json!(["a", "b"])));
        assert_eq!(record.get("extra"), Some(&json!("x")));
    }

    #[test]
    fn test_decode_rejects_bad_number() {
        let desc = post();
        let mut record = desc.zero();
        let fields: FieldMap = vec![("views", "many")].into_iter().collect();
        assert!(matches!(
            desc.decode(&mut record, &fields),
            Err(CodecError::InvalidField { .. })
        ));
    }

    #[test]
    fn test_remove_sentinel_resets_field() {
        let desc = post();
        let mut record = desc.zero();
        record.insert("title", json!("Old"));
        record.insert("extra", json!("x"));

        let fields: FieldMap = vec![("title", REMOVE_SENTINEL), ("extra", REMOVE_SENTINEL)]
            .into_iter()
            .collect();
        desc.decode(&mut record, &fields).unwrap();

        assert_eq!(record.get("title"), Some(&json!("")));
        assert_eq!(record.get("extra"), None);
    }

    #[test]
    fn test_default_hooks() {
        let desc = post();
        let mut record = desc.zero();
        record.set_id(9);
        record.insert("title", json!("Hello World"));
        assert_eq!(desc.slug_of(&record), Some("hello-world".to_string()));
        assert_eq!(desc.sort_key(&record), SortKey { timestamp: 0, fallback: 9 });

        record.set_updated(50);
        assert_eq!(desc.sort_key(&record).timestamp, 50);
        record.set_timestamp(70);
        assert_eq!(desc.sort_key(&record).timestamp, 70);
    }

    #[test]
    fn test_registry_lookup() {
        let registry = TypeRegistry::new().register(post());
        assert!(registry.get("Post").is_ok());
        assert!(matches!(
            registry.get("Order"),
            Err(CodecError::UnknownNamespace(_))
        ));
        assert_eq!(registry.kinds(), vec!["Post"]);
    }
}
